//! Camera sessions, their registration and periodic cleanup.

mod cleanup;
mod manager;
mod registry;

pub use cleanup::{LongSessionRemover, SegmentCleanupTask};
pub use manager::{SessionManager, StreamSession};
pub use registry::{CameraRegistry, CameraStatus, RegistrationClient, SEGMENT_CLEANUP_JOB};
