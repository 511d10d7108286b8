use shared_slot::SlotError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("shared storage error: {0}")]
    Slot(#[from] SlotError),
    #[error("invalid push response: {0}")]
    Protocol(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("connection driver is gone")]
    DriverGone,
}

pub type RelayResult<T> = Result<T, RelayError>;
