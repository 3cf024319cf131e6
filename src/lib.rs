//! # voicemesh
//!
//! Peer-to-peer voice channel coordination over WebRTC full-mesh.
//!
//! Each participant runs a [`VoiceChannelCoordinator`] that keeps one peer
//! connection per remote participant. The coordinator handles SDP
//! negotiation with Opus-tuned descriptions, fans the local microphone track
//! out to every peer, decodes each remote track into a per-peer audio sink
//! with persisted volume/mute preferences, detects who is speaking, and
//! recovers degraded transports with bounded ICE restarts.
//!
//! ```text
//!  signaling in ──► VoiceChannelCoordinator ──► events out
//!                    │            │     (offers/answers/candidates,
//!                    │            │      speaking changes, degradation)
//!            PeerLink (per peer)  │
//!              │    │             │
//!              │    └─ monitor ──► RemoteAudioSinkManager ──► AudioOutput
//!              │        (opus decode + SpeakingDetector)
//!              └─ IceRecoveryStateMachine
//! ```
//!
//! The signaling transport and platform audio playback are collaborators
//! supplied by the application, through [`SignalingMessage`] routing and the
//! [`AudioOutputFactory`] trait.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use voicemesh::{
//!     JsonFileStore, NullAudioOutputFactory, SignalingMessage, VoiceChannelCoordinator,
//!     VoiceMeshConfig,
//! };
//!
//! # async fn run() -> voicemesh::Result<()> {
//! let store = Arc::new(JsonFileStore::open("audio-prefs.json"));
//! let (coordinator, mut events) =
//!     VoiceChannelCoordinator::new(VoiceMeshConfig::default(), store, Arc::new(NullAudioOutputFactory))?;
//!
//! // Feed signaling into the coordinator and drain its events back out.
//! coordinator
//!     .handle_signaling(SignalingMessage::PeerJoined {
//!         peer_id: "peer-a".to_string(),
//!         name: None,
//!     })
//!     .await?;
//! while let Some(event) = events.recv().await {
//!     // forward offers/answers/candidates over the signaling transport
//!     let _ = event;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod media;
mod peer;
pub mod prefs;
pub mod recovery;
pub mod sdp;
pub mod signaling;

pub use config::{
    DegradationPreference, OpusTuning, RecoveryPolicy, SenderHints, SenderPriority,
    TurnServerConfig, VoiceMeshConfig,
};
pub use coordinator::VoiceChannelCoordinator;
pub use error::{Error, Result};
pub use media::{
    AudioOutput, AudioOutputFactory, EncoderControl, LocalAudio, NullAudioOutput,
    NullAudioOutputFactory, SpeakingDetector,
};
pub use peer::{LinkState, PeerInfo};
pub use prefs::{JsonFileStore, MemoryStore, PeerAudioPreference, PreferenceStore};
pub use recovery::IceRecoveryStateMachine;
pub use signaling::{IceCandidatePayload, SignalingMessage, VoiceMeshEvent};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_version() {
        assert!(!super::version().is_empty());
    }
}
