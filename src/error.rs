use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Scanned text is not a session payload (noise from an unrelated code, truncated scan)
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Payload decoded but the description inside cannot be used
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    /// Negotiation call made out of sequence
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Underlying peer connection failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// ICE gathering did not complete within the caller-imposed deadline
    #[error("ICE gathering timed out after {0} ms")]
    GatheringTimeout(u64),

    /// Local hardware cannot honour a control request
    #[error("Unsupported capability [{capability}]: {reason}")]
    UnsupportedCapability { capability: String, reason: String },

    /// Control message failed validation
    #[error("Invalid control message: {0}")]
    InvalidControl(String),

    #[error("Advisor error: {0}")]
    Advisor(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    pub fn unsupported(capability: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedCapability {
            capability: capability.into(),
            reason: reason.into(),
        }
    }
}

impl From<webrtc::Error> for AppError {
    fn from(e: webrtc::Error) -> Self {
        AppError::Transport(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
