use thiserror::Error;

/// Errors from store operations (used by trait definitions in runloom-core).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Errors from job-queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("enqueue failed for job '{job_id}': {message}")]
    Enqueue { job_id: String, message: String },

    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("queue is closed")]
    Closed,
}

/// Errors related to secret operations.
///
/// Variants deliberately carry no key or plaintext material; the secret
/// *name* is an identifier and safe to surface.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret '{0}' not found")]
    NotFound(String),

    #[error("secret key must decode to 32 bytes (64-char hex or base64)")]
    InvalidKey,

    #[error("no secret key configured")]
    KeyMissing,

    #[error("secret decryption failed")]
    Decrypt,

    #[error("secret encryption failed")]
    Encrypt,

    #[error("storage error: {0}")]
    StorageError(String),
}
