//! Error types for the voice mesh coordinator

/// Result type alias using the voice mesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in voice mesh operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Peer not found
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Media playback/decoding error
    #[error("Media error: {0}")]
    MediaError(String),

    /// Preference store error
    #[error("Preference store error: {0}")]
    StoreError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error may clear on retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PeerConnectionError(_) | Error::IceCandidateError(_) | Error::IoError(_)
        )
    }

    /// Check if this error relates to a single peer's pipeline
    ///
    /// Peer-scoped errors must never abort processing of other peers.
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_)
                | Error::PeerConnectionError(_)
                | Error::IceCandidateError(_)
                | Error::SdpError(_)
                | Error::MediaError(_)
        )
    }
}
