// =============================================================================
// LAGRANGE RELAY — error.rs
// =============================================================================
//
// Single error type for the relay pipeline. Decode and verification failures
// are recovered inside the loop that hit them; only connectivity failures end
// a session.
// =============================================================================

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Signature, key or declared size did not check out.
    #[error("verification failed: {0}")]
    VerificationFailure(String),

    /// Envelope or payload could not be decoded.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Previous stage could not be reached.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Peer closed the stream.
    #[error("unexpected disconnect: {0}")]
    UnexpectedDisconnect(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("control plane error: {0}")]
    Control(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// What a loop should do after an iteration failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Skip,
    Terminate,
}

impl RelayError {
    pub fn disposition(&self) -> Disposition {
        match self {
            RelayError::VerificationFailure(_)
            | RelayError::MalformedEnvelope(_)
            | RelayError::ShapeMismatch(_)
            | RelayError::Json(_) => Disposition::Skip,
            RelayError::UpstreamUnavailable(_)
            | RelayError::UnexpectedDisconnect(_)
            | RelayError::Identity(_)
            | RelayError::Control(_)
            | RelayError::Io(_) => Disposition::Terminate,
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        RelayError::MalformedEnvelope(msg.into())
    }
}
