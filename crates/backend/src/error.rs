//! Error classification at the frame boundary.
//!
//! Transport errors are swallowed by the dispatcher (logged, frame
//! skipped): sending an authenticated error needs a working session, and
//! sending unauthenticated data on this channel is forbidden. Protocol
//! errors are surfaced to the host in-band as a failure envelope.

use thiserror::Error;

/// A frame that could not cross the encrypted transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("malformed base64 frame: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("frame too short ({len} bytes)")]
    ShortFrame { len: usize },

    #[error(transparent)]
    Crypto(#[from] gcm::GcmError),
}

/// A frame that decrypted fine but carried a malformed command.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("command envelope shorter than its length prefix")]
    TruncatedEnvelope,

    #[error("malformed command JSON: {0}")]
    Json(#[from] serde_json::Error),
}
