//! Remote audio sinks and per-peer playback state
//!
//! One sink per remote peer, fed by that peer's monitor task. The manager
//! owns the global output controls (master volume, deafen, output device) and
//! composes them with each peer's persisted preference into the state pushed
//! down to the platform audio output.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::Result;
use crate::prefs::{PeerAudioPreference, PreferenceStore};

/// Platform audio output for one remote peer
///
/// Implementations wrap whatever the application plays audio with. All
/// methods other than device switching are infallible: playback glitches are
/// the output's problem, not the coordinator's.
pub trait AudioOutput: Send + Sync {
    /// Set the effective playback volume, 0.0..=1.0
    fn set_volume(&self, volume: f32);

    /// Set the effective mute state
    fn set_muted(&self, muted: bool);

    /// Route playback to a different output device
    fn set_output_device(&self, device_id: &str) -> Result<()>;

    /// Start playback
    fn start(&self) -> Result<()>;

    /// Push a frame of decoded PCM samples
    fn write_samples(&self, samples: &[f32]);
}

/// Creates an [`AudioOutput`] per attached peer
#[async_trait]
pub trait AudioOutputFactory: Send + Sync {
    /// Create an output for the given peer
    async fn create(&self, peer_id: &str) -> Result<Arc<dyn AudioOutput>>;
}

/// Audio output that discards everything
///
/// Used in tests and headless deployments.
#[derive(Debug, Default)]
pub struct NullAudioOutput {
    state: parking_lot::Mutex<NullOutputState>,
}

#[derive(Debug, Default)]
struct NullOutputState {
    volume: f32,
    muted: bool,
    started: bool,
    device: Option<String>,
}

impl NullAudioOutput {
    /// Create a discarded output
    pub fn new() -> Self {
        Self::default()
    }

    /// Last volume pushed down
    pub fn volume(&self) -> f32 {
        self.state.lock().volume
    }

    /// Last mute state pushed down
    pub fn muted(&self) -> bool {
        self.state.lock().muted
    }

    /// Whether playback was started
    pub fn started(&self) -> bool {
        self.state.lock().started
    }

    /// Last device routed to
    pub fn device(&self) -> Option<String> {
        self.state.lock().device.clone()
    }
}

impl AudioOutput for NullAudioOutput {
    fn set_volume(&self, volume: f32) {
        self.state.lock().volume = volume;
    }

    fn set_muted(&self, muted: bool) {
        self.state.lock().muted = muted;
    }

    fn set_output_device(&self, device_id: &str) -> Result<()> {
        self.state.lock().device = Some(device_id.to_string());
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.state.lock().started = true;
        Ok(())
    }

    fn write_samples(&self, _samples: &[f32]) {}
}

/// Factory producing [`NullAudioOutput`] instances
#[derive(Debug, Default)]
pub struct NullAudioOutputFactory;

#[async_trait]
impl AudioOutputFactory for NullAudioOutputFactory {
    async fn create(&self, _peer_id: &str) -> Result<Arc<dyn AudioOutput>> {
        Ok(Arc::new(NullAudioOutput::new()))
    }
}

struct RemoteAudioSink {
    output: Arc<dyn AudioOutput>,
    pref: PeerAudioPreference,
}

/// Manages one audio sink per remote peer
pub struct RemoteAudioSinkManager {
    sinks: RwLock<HashMap<String, RemoteAudioSink>>,
    output_volume: RwLock<f32>,
    deafened: RwLock<bool>,
    output_device: RwLock<Option<String>>,
    store: Arc<dyn PreferenceStore>,
}

impl RemoteAudioSinkManager {
    /// Create a manager backed by the given preference store
    pub fn new(store: Arc<dyn PreferenceStore>) -> Self {
        Self {
            sinks: RwLock::new(HashMap::new()),
            output_volume: RwLock::new(1.0),
            deafened: RwLock::new(false),
            output_device: RwLock::new(None),
            store,
        }
    }

    /// Attach a sink for a newly connected peer
    ///
    /// The persisted preference is loaded and applied before the output is
    /// started, so even the first rendered sample honors a stored mute. A
    /// failing `start()` leaves the sink attached; volume and mute state keep
    /// tracking so playback is correct if the output recovers.
    pub async fn attach(&self, peer_id: &str, output: Arc<dyn AudioOutput>) {
        let pref = self.store.get(peer_id).unwrap_or_default().clamped();

        let global_volume = *self.output_volume.read().await;
        let deafened = *self.deafened.read().await;
        output.set_volume(effective_volume(pref.volume, global_volume));
        output.set_muted(pref.muted || deafened);

        if let Some(device) = self.output_device.read().await.as_deref() {
            if let Err(e) = output.set_output_device(device) {
                warn!(peer_id, error = %e, "Failed to route new sink to output device");
            }
        }

        if let Err(e) = output.start() {
            warn!(peer_id, error = %e, "Failed to start audio output");
        }

        debug!(peer_id, muted = pref.muted, volume = pref.volume, "Attached audio sink");
        self.sinks
            .write()
            .await
            .insert(peer_id.to_string(), RemoteAudioSink { output, pref });
    }

    /// Detach and drop the sink for a departed peer
    ///
    /// The persisted preference is kept for the peer's next session.
    pub async fn detach(&self, peer_id: &str) {
        if self.sinks.write().await.remove(peer_id).is_some() {
            debug!(peer_id, "Detached audio sink");
        }
    }

    /// Drop all sinks
    pub async fn clear(&self) {
        self.sinks.write().await.clear();
    }

    /// Feed decoded samples to a peer's sink
    pub async fn write_samples(&self, peer_id: &str, samples: &[f32]) {
        if let Some(sink) = self.sinks.read().await.get(peer_id) {
            sink.output.write_samples(samples);
        }
    }

    /// Set and persist a peer's local volume
    pub async fn set_peer_volume(&self, peer_id: &str, volume: f32) -> Result<()> {
        let mut pref = self.store.get(peer_id).unwrap_or_default();
        pref.volume = volume;
        let pref = pref.clamped();
        self.store.set(peer_id, pref)?;

        let mut sinks = self.sinks.write().await;
        if let Some(sink) = sinks.get_mut(peer_id) {
            sink.pref = pref;
            sink.output
                .set_volume(effective_volume(pref.volume, *self.output_volume.read().await));
        }
        Ok(())
    }

    /// Set and persist a peer's local mute
    pub async fn set_peer_muted(&self, peer_id: &str, muted: bool) -> Result<()> {
        let mut pref = self.store.get(peer_id).unwrap_or_default().clamped();
        pref.muted = muted;
        self.store.set(peer_id, pref)?;

        let mut sinks = self.sinks.write().await;
        if let Some(sink) = sinks.get_mut(peer_id) {
            sink.pref = pref;
            sink.output
                .set_muted(pref.muted || *self.deafened.read().await);
        }
        Ok(())
    }

    /// Remove a peer's persisted preference, reverting to defaults
    pub async fn clear_peer_preference(&self, peer_id: &str) -> Result<()> {
        self.store.remove(peer_id)?;

        let pref = PeerAudioPreference::default();
        let mut sinks = self.sinks.write().await;
        if let Some(sink) = sinks.get_mut(peer_id) {
            sink.pref = pref;
            sink.output
                .set_volume(effective_volume(pref.volume, *self.output_volume.read().await));
            sink.output
                .set_muted(pref.muted || *self.deafened.read().await);
        }
        Ok(())
    }

    /// The effective preference for one peer (persisted or default)
    pub fn peer_preference(&self, peer_id: &str) -> PeerAudioPreference {
        self.store.get(peer_id).unwrap_or_default().clamped()
    }

    /// All persisted preferences
    pub fn all_preferences(&self) -> HashMap<String, PeerAudioPreference> {
        self.store.load_all()
    }

    /// Set the global output volume and re-render every sink
    pub async fn set_output_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        *self.output_volume.write().await = volume;

        let sinks = self.sinks.read().await;
        for sink in sinks.values() {
            sink.output
                .set_volume(effective_volume(sink.pref.volume, volume));
        }
    }

    /// Set the deafen state and re-render every sink's mute
    pub async fn set_deafened(&self, deafened: bool) {
        *self.deafened.write().await = deafened;

        let sinks = self.sinks.read().await;
        for sink in sinks.values() {
            sink.output.set_muted(sink.pref.muted || deafened);
        }
    }

    /// Route all sinks to a different output device
    ///
    /// A per-sink routing failure is logged and skipped; the remaining sinks
    /// still move.
    pub async fn set_output_device(&self, device_id: &str) {
        *self.output_device.write().await = Some(device_id.to_string());

        let sinks = self.sinks.read().await;
        for (peer_id, sink) in sinks.iter() {
            if let Err(e) = sink.output.set_output_device(device_id) {
                warn!(peer_id, error = %e, "Failed to route sink to output device");
            }
        }
    }

    /// Number of attached sinks
    pub async fn sink_count(&self) -> usize {
        self.sinks.read().await.len()
    }
}

fn effective_volume(local: f32, global: f32) -> f32 {
    (local * global).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::MemoryStore;

    fn manager() -> RemoteAudioSinkManager {
        RemoteAudioSinkManager::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_attach_applies_defaults() {
        let mgr = manager();
        let output = Arc::new(NullAudioOutput::new());
        mgr.attach("peer-a", output.clone()).await;

        assert!(output.started());
        assert_eq!(output.volume(), 1.0);
        assert!(!output.muted());
    }

    #[tokio::test]
    async fn test_persisted_pref_applied_on_attach() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(
                "peer-a",
                PeerAudioPreference {
                    muted: true,
                    volume: 0.3,
                },
            )
            .unwrap();

        let mgr = RemoteAudioSinkManager::new(store);
        let output = Arc::new(NullAudioOutput::new());
        mgr.attach("peer-a", output.clone()).await;

        assert!(output.muted());
        assert!((output.volume() - 0.3).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_effective_volume_composes_global() {
        let mgr = manager();
        let output = Arc::new(NullAudioOutput::new());
        mgr.attach("peer-a", output.clone()).await;

        mgr.set_peer_volume("peer-a", 0.5).await.unwrap();
        mgr.set_output_volume(0.5).await;

        assert!((output.volume() - 0.25).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_deafen_overrides_unmuted_peers() {
        let mgr = manager();
        let output = Arc::new(NullAudioOutput::new());
        mgr.attach("peer-a", output.clone()).await;

        mgr.set_deafened(true).await;
        assert!(output.muted());

        // Undeafening restores the per-peer state
        mgr.set_deafened(false).await;
        assert!(!output.muted());
    }

    #[tokio::test]
    async fn test_deafen_does_not_clobber_peer_mute() {
        let mgr = manager();
        let output = Arc::new(NullAudioOutput::new());
        mgr.attach("peer-a", output.clone()).await;

        mgr.set_peer_muted("peer-a", true).await.unwrap();
        mgr.set_deafened(true).await;
        mgr.set_deafened(false).await;

        // The peer's own mute survives the deafen cycle
        assert!(output.muted());
    }

    #[tokio::test]
    async fn test_pref_survives_detach() {
        let mgr = manager();
        let output = Arc::new(NullAudioOutput::new());
        mgr.attach("peer-a", output).await;

        mgr.set_peer_volume("peer-a", 0.7).await.unwrap();
        mgr.detach("peer-a").await;

        let pref = mgr.peer_preference("peer-a");
        assert!((pref.volume - 0.7).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_clear_preference_reverts_to_default() {
        let mgr = manager();
        let output = Arc::new(NullAudioOutput::new());
        mgr.attach("peer-a", output.clone()).await;

        mgr.set_peer_muted("peer-a", true).await.unwrap();
        mgr.clear_peer_preference("peer-a").await.unwrap();

        assert!(!output.muted());
        assert_eq!(mgr.peer_preference("peer-a"), PeerAudioPreference::default());
    }

    #[tokio::test]
    async fn test_idempotent_re_render() {
        let mgr = manager();
        let output = Arc::new(NullAudioOutput::new());
        mgr.attach("peer-a", output.clone()).await;

        mgr.set_peer_volume("peer-a", 0.6).await.unwrap();
        let first = output.volume();
        mgr.set_peer_volume("peer-a", 0.6).await.unwrap();
        assert_eq!(output.volume(), first);
    }

    #[tokio::test]
    async fn test_device_routing_covers_new_sinks() {
        let mgr = manager();
        mgr.set_output_device("headset").await;

        let output = Arc::new(NullAudioOutput::new());
        mgr.attach("peer-a", output.clone()).await;
        assert_eq!(output.device().as_deref(), Some("headset"));
    }

    #[tokio::test]
    async fn test_volume_setter_clamps() {
        let mgr = manager();
        let output = Arc::new(NullAudioOutput::new());
        mgr.attach("peer-a", output.clone()).await;

        mgr.set_peer_volume("peer-a", 4.0).await.unwrap();
        assert_eq!(output.volume(), 1.0);
    }
}
