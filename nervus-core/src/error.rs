use thiserror::Error;

/// Discriminated error kinds shared across the event distribution core.
///
/// Each crate wraps its lower-level failures (sqlx, io, regex) into one of
/// these variants rather than surfacing them as opaque strings, so callers
/// can match on kind (§7).
#[derive(Error, Debug)]
pub enum Error {
    #[error("not running")]
    NotRunning,

    #[error("already running")]
    AlreadyRunning,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("backpressure: {0} is full")]
    BackpressureDrop(String),

    #[error("event expired")]
    Expired,

    #[error("capacity reached: {0}")]
    CapReached(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store io error: {0}")]
    StoreIo(String),

    #[error("transport failed: {0}")]
    TransportFailed(String),

    #[error("replay failed: {0}")]
    ReplayFailed(String),

    #[error("decode error on field {field}: {reason}")]
    DecodeError { field: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
