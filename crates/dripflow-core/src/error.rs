//! Crate-wide error type. Library code propagates with `?`; the
//! dispatcher boundary is where errors stop (one lead's failure must
//! never abort the tick).

use thiserror::Error;

/// All the ways Dripflow operations can fail.
#[derive(Debug, Error)]
pub enum DripflowError {
    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("shared state error: {0}")]
    State(String),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("invalid campaign: {0}")]
    InvalidCampaign(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DripflowError>;
