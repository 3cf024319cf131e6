//! Local and remote media plumbing
//!
//! [`LocalAudio`] bundles the outbound microphone track with an optional
//! handle into the capture side's encoder; [`sink`] renders remote audio and
//! [`speaking`] classifies it.

pub mod sink;
pub mod speaking;

use std::sync::Arc;

use webrtc::track::track_local::TrackLocal;

use crate::config::SenderHints;

pub use sink::{
    AudioOutput, AudioOutputFactory, NullAudioOutput, NullAudioOutputFactory,
    RemoteAudioSinkManager,
};
pub use speaking::SpeakingDetector;

/// Handle into the capture pipeline's Opus encoder
///
/// The browser-style per-sender bitrate/priority knobs have no equivalent on
/// the native sender, so transport hints are applied directly at the encoder
/// that feeds the local track.
pub trait EncoderControl: Send + Sync {
    /// Apply transport hints to the encoder
    fn apply(&self, hints: &SenderHints);
}

/// The local outbound audio stream
#[derive(Clone)]
pub struct LocalAudio {
    /// Track attached to every peer connection
    pub track: Arc<dyn TrackLocal + Send + Sync>,

    /// Encoder handle, when the capture side exposes one
    pub encoder: Option<Arc<dyn EncoderControl>>,
}

impl LocalAudio {
    /// Wrap a track with no encoder handle
    pub fn new(track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        Self {
            track,
            encoder: None,
        }
    }

    /// Wrap a track together with its encoder handle
    pub fn with_encoder(
        track: Arc<dyn TrackLocal + Send + Sync>,
        encoder: Arc<dyn EncoderControl>,
    ) -> Self {
        Self {
            track,
            encoder: Some(encoder),
        }
    }
}

impl std::fmt::Debug for LocalAudio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAudio")
            .field("track_id", &self.track.id())
            .field("has_encoder", &self.encoder.is_some())
            .finish()
    }
}
