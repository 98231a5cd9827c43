//! Service layer module.
//!
//! This module provides the service container wiring the port pool,
//! schedulers, retries and sessions together.

pub mod container;

pub use container::{MAINTENANCE_UNIT, ServiceContainer};
