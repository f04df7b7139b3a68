use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("organization not found: {0}")]
    NotFound(String),

    #[error("organization id mismatch: expected {expected}, got {got}")]
    BadRequest { expected: String, got: String },

    #[error("timed out acquiring lock {key} after {waited_ms}ms")]
    LockTimeout { key: String, waited_ms: u64 },

    #[error("store arithmetic error on {key}: {reason}")]
    StoreArithmetic { key: String, reason: String },

    #[error("store communication error: {0}")]
    StoreUnavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}
