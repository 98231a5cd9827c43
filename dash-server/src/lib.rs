//! dash-server library crate.
//!
//! Control-plane core of the DASH server: job scheduling, retries, camera
//! sessions and their housekeeping. The RTP port pool lives in the
//! `port-pool` crate.

pub mod config;
pub mod error;
pub mod logging;
pub mod retry;
pub mod scheduler;
pub mod services;
pub mod session;

pub use error::{Error, Result};
pub use port_pool::{PortPool, PortPoolError};
