use thiserror::Error;

/// Errors raised while encoding or decoding wire records.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record is missing field '{0}'")]
    MissingField(&'static str),

    #[error("unknown event type '{0}'")]
    UnknownType(String),

    #[error("event type '{0}' is local to the process and cannot cross the wire")]
    LocalOnly(String),

    #[error("record chain context {found} does not belong to connection context {expected}")]
    ContextMismatch { expected: u64, found: u64 },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
