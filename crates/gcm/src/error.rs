use thiserror::Error;

/// Result alias for GCM operations.
pub type Result<T> = std::result::Result<T, GcmError>;

/// Errors surfaced by the GCM engine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GcmError {
    /// Malformed argument: key length, tag length, empty nonce, or data
    /// shorter than the tag.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// The nonce was already used with this key while uniqueness
    /// enforcement is on.
    #[error("nonce reuse detected for this key")]
    NonceReuse,

    /// The per-key invocation ceiling would be reached.
    #[error("invocation limit reached for this key")]
    InvocationLimit,

    /// The authentication tag is invalid.
    #[error("the authentication tag is invalid")]
    InvalidTag,
}
