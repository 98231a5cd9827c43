use thiserror::Error;

/// Errors raised while configuring a [`crate::PortPool`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortPoolError {
    #[error("Invalid port range: min {min} is greater than max {max}")]
    InvalidRange { min: u16, max: u16 },

    #[error("Port gap must be greater than zero")]
    ZeroGap,
}
