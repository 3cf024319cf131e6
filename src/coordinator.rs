//! Voice channel coordination
//!
//! [`VoiceChannelCoordinator`] owns the full-mesh of peer links for one voice
//! channel: it reacts to signaling, negotiates tuned SDP, fans the local
//! audio track out to every peer, renders each remote track through its audio
//! sink, and schedules bounded ICE recovery when a transport degrades.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::track::track_remote::TrackRemote;

use crate::config::VoiceMeshConfig;
use crate::error::{Error, Result};
use crate::media::{AudioOutputFactory, LocalAudio, RemoteAudioSinkManager, SpeakingDetector};
use crate::peer::{LinkNotice, LinkSignal, PeerInfo, PeerLink};
use crate::prefs::{PeerAudioPreference, PreferenceStore};
use crate::recovery::IceRecoveryStateMachine;
use crate::signaling::{IceCandidatePayload, SignalingMessage, VoiceMeshEvent};

const SAMPLE_RATE: u32 = 48000;
const CHANNELS: usize = 2;
// One 120ms Opus frame at 48kHz, the longest the decoder can produce
const MAX_FRAME_SAMPLES: usize = 5760;

/// Coordinates peer connections for one voice channel
pub struct VoiceChannelCoordinator {
    config: VoiceMeshConfig,
    links: RwLock<HashMap<String, Arc<PeerLink>>>,
    monitors: RwLock<HashMap<String, JoinHandle<()>>>,
    sinks: Arc<RemoteAudioSinkManager>,
    recovery: IceRecoveryStateMachine,
    local_audio: RwLock<Option<LocalAudio>>,
    output_factory: Arc<dyn AudioOutputFactory>,
    notices: UnboundedSender<(String, LinkNotice)>,
    events: UnboundedSender<VoiceMeshEvent>,
}

impl VoiceChannelCoordinator {
    /// Create a coordinator and its event receiver
    ///
    /// The receiver carries outbound signaling (offers, answers, candidates)
    /// and UI notifications (speaking changes, degradation). The caller must
    /// drain it.
    pub fn new(
        config: VoiceMeshConfig,
        store: Arc<dyn PreferenceStore>,
        output_factory: Arc<dyn AudioOutputFactory>,
    ) -> Result<(Arc<Self>, UnboundedReceiver<VoiceMeshEvent>)> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();

        let recovery = IceRecoveryStateMachine::new(
            config.recovery.clone(),
            config.has_relay_fallback(),
            events_tx.clone(),
        );

        let coordinator = Arc::new(Self {
            config,
            links: RwLock::new(HashMap::new()),
            monitors: RwLock::new(HashMap::new()),
            sinks: Arc::new(RemoteAudioSinkManager::new(store)),
            recovery,
            local_audio: RwLock::new(None),
            output_factory,
            notices: notices_tx,
            events: events_tx,
        });

        tokio::spawn(Self::notice_loop(Arc::downgrade(&coordinator), notices_rx));

        Ok((coordinator, events_rx))
    }

    /// React to link notices until the coordinator is dropped
    async fn notice_loop(
        this: Weak<Self>,
        mut notices: UnboundedReceiver<(String, LinkNotice)>,
    ) {
        while let Some((peer_id, notice)) = notices.recv().await {
            let Some(coordinator) = this.upgrade() else {
                break;
            };
            match notice {
                LinkNotice::Signal(LinkSignal::Healthy) => {
                    coordinator.recovery.reset(&peer_id);
                }
                LinkNotice::Signal(LinkSignal::Degraded(reason)) => {
                    let link = {
                        let links = coordinator.links.read().await;
                        links.get(&peer_id).cloned()
                    };
                    // Closed or already-removed links get no recovery
                    let Some(link) = link else {
                        continue;
                    };
                    if link.is_closed().await {
                        continue;
                    }

                    debug!(peer_id = %peer_id, reason, "Link degraded");
                    let weak = this.clone();
                    let restart_peer = peer_id.clone();
                    coordinator.recovery.schedule(&peer_id, async move {
                        let Some(coordinator) = weak.upgrade() else {
                            return;
                        };
                        if let Err(e) = coordinator.restart_peer(&restart_peer).await {
                            warn!(peer_id = %restart_peer, error = %e, "ICE restart failed");
                        }
                    });
                }
                LinkNotice::Signal(LinkSignal::Closed) => {
                    coordinator.recovery.remove(&peer_id);
                }
                LinkNotice::Candidate(candidate) => {
                    let _ = coordinator.events.send(VoiceMeshEvent::IceCandidate {
                        peer_id,
                        candidate,
                    });
                }
                LinkNotice::RemoteTrack(track) => {
                    coordinator.handle_remote_track(peer_id, track).await;
                }
            }
        }
    }

    /// Route an inbound signaling message to the right handler
    pub async fn handle_signaling(&self, message: SignalingMessage) -> Result<()> {
        match message {
            SignalingMessage::PeerJoined { peer_id, name } => {
                info!(peer_id = %peer_id, name = ?name, "Peer joined channel");
                // Both sides learn of each other on a symmetric join; only
                // the lexicographically smaller peer id offers, so the two
                // never race each other into have-local-offer.
                if self.config.local_peer_id < peer_id {
                    self.create_offer(&peer_id).await?;
                } else {
                    debug!(peer_id = %peer_id, "Awaiting offer from joined peer");
                }
                Ok(())
            }
            SignalingMessage::PeerLeft { peer_id } => {
                info!(peer_id = %peer_id, "Peer left channel");
                self.remove_peer(&peer_id).await;
                Ok(())
            }
            SignalingMessage::Offer { peer_id, sdp } => {
                self.handle_offer(&peer_id, sdp).await?;
                Ok(())
            }
            SignalingMessage::Answer { peer_id, sdp } => self.handle_answer(&peer_id, sdp).await,
            SignalingMessage::IceCandidate { peer_id, candidate } => {
                self.handle_ice_candidate(&peer_id, candidate).await
            }
        }
    }

    /// Get or create the link for a peer
    async fn ensure_link(&self, peer_id: &str) -> Result<Arc<PeerLink>> {
        {
            let links = self.links.read().await;
            if let Some(link) = links.get(peer_id) {
                return Ok(Arc::clone(link));
            }
        }

        let mut links = self.links.write().await;
        // Racing caller may have created it while we waited for the lock
        if let Some(link) = links.get(peer_id) {
            return Ok(Arc::clone(link));
        }

        if links.len() >= self.config.max_peers as usize {
            return Err(Error::PeerConnectionError(format!(
                "Channel is full: {} peers (max {})",
                links.len(),
                self.config.max_peers
            )));
        }

        let link = PeerLink::new(peer_id.to_string(), &self.config, self.notices.clone()).await?;

        if let Some(local) = self.local_audio.read().await.clone() {
            if let Err(e) = link.set_outbound_track(Some(local.track)).await {
                // Close rather than drop so the connection's background
                // ICE/DTLS tasks are torn down with it.
                if let Err(close_err) = link.close().await {
                    warn!(peer_id, error = %close_err, "Error closing link after track attach failure");
                }
                return Err(e);
            }
        }

        links.insert(peer_id.to_string(), Arc::clone(&link));
        Ok(link)
    }

    /// Push the configured transport hints into the capture encoder
    ///
    /// Runs before every outbound description so the encoder is aligned with
    /// what the description advertises.
    async fn apply_sender_hints(&self) {
        if let Some(local) = self.local_audio.read().await.as_ref() {
            if let Some(encoder) = &local.encoder {
                encoder.apply(&self.config.sender_hints);
            }
        }
    }

    /// Create a tuned offer for a peer and emit it for signaling
    ///
    /// The `Offer` event is only emitted once the offer is fully built and
    /// installed, so a failure leaves nothing half-sent.
    pub async fn create_offer(&self, peer_id: &str) -> Result<String> {
        let link = self.ensure_link(peer_id).await?;
        self.apply_sender_hints().await;
        let sdp = link.offer(&self.config.opus, false).await?;

        let _ = self.events.send(VoiceMeshEvent::Offer {
            peer_id: peer_id.to_string(),
            sdp: sdp.clone(),
        });
        Ok(sdp)
    }

    /// Accept a remote offer, emit the tuned answer for signaling
    pub async fn handle_offer(&self, peer_id: &str, sdp: String) -> Result<String> {
        let link = self.ensure_link(peer_id).await?;
        self.apply_sender_hints().await;
        let answer = link.answer(sdp, &self.config.opus).await?;

        let _ = self.events.send(VoiceMeshEvent::Answer {
            peer_id: peer_id.to_string(),
            sdp: answer.clone(),
        });
        Ok(answer)
    }

    /// Install a remote answer
    ///
    /// Signaling is unordered; an answer for an unknown peer is logged and
    /// absorbed rather than treated as fatal.
    pub async fn handle_answer(&self, peer_id: &str, sdp: String) -> Result<()> {
        let link = {
            let links = self.links.read().await;
            links.get(peer_id).cloned()
        };
        match link {
            Some(link) => link.accept_answer(sdp).await,
            None => {
                warn!(peer_id = %peer_id, "Answer for unknown peer, ignoring");
                Ok(())
            }
        }
    }

    /// Add a remote ICE candidate
    pub async fn handle_ice_candidate(
        &self,
        peer_id: &str,
        candidate: IceCandidatePayload,
    ) -> Result<()> {
        let link = {
            let links = self.links.read().await;
            links.get(peer_id).cloned()
        };
        match link {
            Some(link) => link.add_remote_candidate(candidate).await,
            None => {
                warn!(peer_id = %peer_id, "ICE candidate for unknown peer, ignoring");
                Ok(())
            }
        }
    }

    /// Tear down everything associated with a peer
    ///
    /// Persisted audio preferences survive for the peer's next session.
    pub async fn remove_peer(&self, peer_id: &str) {
        let link = self.links.write().await.remove(peer_id);
        if let Some(link) = link {
            if let Err(e) = link.close().await {
                warn!(peer_id = %peer_id, error = %e, "Error closing peer link");
            }
        }
        self.recovery.remove(peer_id);
        self.sinks.detach(peer_id).await;
        if let Some(monitor) = self.monitors.write().await.remove(peer_id) {
            monitor.abort();
        }
    }

    /// Set or clear the local outbound audio stream
    ///
    /// The track fans out to every existing link; links that need a fresh
    /// media line get a renegotiation offer. Per-peer failures are logged and
    /// the fan-out continues.
    pub async fn set_local_stream(&self, stream: Option<LocalAudio>) {
        if let Some(local) = &stream {
            if let Some(encoder) = &local.encoder {
                encoder.apply(&self.config.sender_hints);
            }
        }

        *self.local_audio.write().await = stream.clone();

        let links: Vec<(String, Arc<PeerLink>)> = {
            let links = self.links.read().await;
            links
                .iter()
                .map(|(id, link)| (id.clone(), Arc::clone(link)))
                .collect()
        };

        for (peer_id, link) in links {
            let track = stream.as_ref().map(|s| Arc::clone(&s.track));
            match link.set_outbound_track(track).await {
                Ok(true) => {
                    if let Err(e) = self.create_offer(&peer_id).await {
                        warn!(peer_id = %peer_id, error = %e, "Renegotiation offer failed");
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(peer_id = %peer_id, error = %e, "Failed to update outbound track");
                }
            }
        }
    }

    /// Issue an ICE-restart offer for a degraded peer
    pub async fn restart_peer(&self, peer_id: &str) -> Result<()> {
        let link = {
            let links = self.links.read().await;
            links.get(peer_id).cloned()
        };
        let Some(link) = link else {
            return Err(Error::PeerNotFound(peer_id.to_string()));
        };
        if link.is_closed().await {
            return Err(Error::PeerConnectionError(format!(
                "Peer {peer_id} is closed"
            )));
        }

        info!(peer_id = %peer_id, "Issuing ICE restart offer");
        self.apply_sender_hints().await;
        let sdp = link.offer(&self.config.opus, true).await?;
        let _ = self.events.send(VoiceMeshEvent::Offer {
            peer_id: peer_id.to_string(),
            sdp,
        });
        Ok(())
    }

    /// Attach a sink and start the decode monitor for a remote track
    async fn handle_remote_track(&self, peer_id: String, track: Arc<TrackRemote>) {
        debug!(peer_id = %peer_id, "Remote audio track arrived");

        let output = match self.output_factory.create(&peer_id).await {
            Ok(output) => output,
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "Failed to create audio output");
                return;
            }
        };
        self.sinks.attach(&peer_id, output).await;

        let decoder = match opus::Decoder::new(SAMPLE_RATE, opus::Channels::Stereo) {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "Failed to create Opus decoder");
                return;
            }
        };

        let monitor = tokio::spawn(Self::monitor_track(
            peer_id.clone(),
            track,
            decoder,
            Arc::clone(&self.sinks),
            self.events.clone(),
        ));

        // A replaced remote track supersedes its predecessor's monitor
        if let Some(previous) = self.monitors.write().await.insert(peer_id, monitor) {
            previous.abort();
        }
    }

    /// Decode RTP into PCM, feeding the sink and speaking detector
    async fn monitor_track(
        peer_id: String,
        track: Arc<TrackRemote>,
        mut decoder: opus::Decoder,
        sinks: Arc<RemoteAudioSinkManager>,
        events: UnboundedSender<VoiceMeshEvent>,
    ) {
        let mut pcm = vec![0.0f32; MAX_FRAME_SAMPLES * CHANNELS];
        let mut detector = SpeakingDetector::default();

        loop {
            let (packet, _attributes) = match track.read_rtp().await {
                Ok(read) => read,
                Err(e) => {
                    debug!(peer_id = %peer_id, error = %e, "Remote track ended");
                    break;
                }
            };
            if packet.payload.is_empty() {
                continue;
            }

            match decoder.decode_float(&packet.payload, &mut pcm, false) {
                Ok(samples_per_channel) => {
                    let samples = &pcm[..samples_per_channel * CHANNELS];
                    sinks.write_samples(&peer_id, samples).await;
                    if let Some(speaking) = detector.process(samples) {
                        let _ = events.send(VoiceMeshEvent::SpeakingChanged {
                            peer_id: peer_id.clone(),
                            speaking,
                        });
                    }
                }
                Err(e) => {
                    debug!(peer_id = %peer_id, error = %e, "Opus decode failed, dropping packet");
                }
            }
        }

        if detector.is_speaking() {
            let _ = events.send(VoiceMeshEvent::SpeakingChanged {
                peer_id,
                speaking: false,
            });
        }
    }

    /// Set the global output volume
    pub async fn set_output_volume(&self, volume: f32) {
        self.sinks.set_output_volume(volume).await;
    }

    /// Route all remote audio to a different output device
    pub async fn set_output_device(&self, device_id: &str) {
        self.sinks.set_output_device(device_id).await;
    }

    /// Mute or unmute all remote audio at once
    pub async fn set_deafened(&self, deafened: bool) {
        self.sinks.set_deafened(deafened).await;
    }

    /// Set and persist a peer's playback volume
    pub async fn set_peer_volume(&self, peer_id: &str, volume: f32) -> Result<()> {
        self.sinks.set_peer_volume(peer_id, volume).await
    }

    /// Set and persist a peer's local mute
    pub async fn set_peer_muted(&self, peer_id: &str, muted: bool) -> Result<()> {
        self.sinks.set_peer_muted(peer_id, muted).await
    }

    /// Remove a peer's persisted audio preference
    pub async fn clear_peer_audio_preference(&self, peer_id: &str) -> Result<()> {
        self.sinks.clear_peer_preference(peer_id).await
    }

    /// The effective audio preference for a peer
    pub fn get_peer_audio_preference(&self, peer_id: &str) -> PeerAudioPreference {
        self.sinks.peer_preference(peer_id)
    }

    /// All persisted audio preferences
    pub fn all_peer_audio_preferences(&self) -> HashMap<String, PeerAudioPreference> {
        self.sinks.all_preferences()
    }

    /// Snapshot of every peer link
    pub async fn list_peers(&self) -> Vec<PeerInfo> {
        let links = self.links.read().await;
        let mut peers = Vec::with_capacity(links.len());
        for link in links.values() {
            peers.push(link.info().await);
        }
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// Number of active peer links
    pub async fn peer_count(&self) -> usize {
        self.links.read().await.len()
    }

    /// This node's peer identifier
    pub fn local_peer_id(&self) -> &str {
        &self.config.local_peer_id
    }

    /// Leave the channel: close every link and drop all runtime state
    pub async fn dispose(&self) {
        info!("Disposing voice channel");
        let links: Vec<Arc<PeerLink>> = self.links.write().await.drain().map(|(_, l)| l).collect();
        for link in links {
            if let Err(e) = link.close().await {
                warn!(error = %e, "Error closing peer link during dispose");
            }
        }
        self.recovery.clear();
        self.sinks.clear().await;
        for (_, monitor) in self.monitors.write().await.drain() {
            monitor.abort();
        }
    }
}
