//! Per-peer WebRTC connection wrapper
//!
//! [`PeerLink`] owns one `RTCPeerConnection` and surfaces everything the
//! coordinator needs through a single notice channel: transport health
//! transitions, locally gathered ICE candidates, and inbound remote tracks.
//! All SDP leaving this module has already been through the Opus tuner.

use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{OpusTuning, VoiceMeshConfig};
use crate::error::{Error, Result};
use crate::sdp;
use crate::signaling::IceCandidatePayload;

/// Lifecycle state of a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created, no negotiation yet
    New,
    /// Offer/answer exchange in progress
    Negotiating,
    /// Media is flowing
    Connected,
    /// Transport interrupted, may recover
    Disconnected,
    /// Transport failed
    Failed,
    /// Closed, terminal
    Closed,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkState::New => "new",
            LinkState::Negotiating => "negotiating",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of one peer link for callers
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    /// Peer identifier
    pub peer_id: String,
    /// Current link state
    pub state: LinkState,
    /// Seconds since the link last connected, if connected
    pub duration_secs: Option<u64>,
}

/// Transport health transition reported by the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkSignal {
    /// Transport is connected
    Healthy,
    /// Transport is interrupted or failed, with a short reason
    Degraded(&'static str),
    /// Transport closed
    Closed,
}

/// Notice from a link to the coordinator
pub(crate) enum LinkNotice {
    /// Health transition
    Signal(LinkSignal),
    /// Locally gathered ICE candidate to relay over signaling
    Candidate(IceCandidatePayload),
    /// Remote audio track arrived
    RemoteTrack(Arc<TrackRemote>),
}

/// One peer connection and its outbound audio sender
pub(crate) struct PeerLink {
    peer_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    state: Arc<RwLock<LinkState>>,
    connected_at: Arc<RwLock<Option<SystemTime>>>,
    audio_sender: RwLock<Option<Arc<RTCRtpSender>>>,
}

impl PeerLink {
    /// Create a link and wire its transport callbacks to the notice channel
    pub(crate) async fn new(
        peer_id: String,
        config: &VoiceMeshConfig,
        notices: UnboundedSender<(String, LinkNotice)>,
    ) -> Result<Arc<Self>> {
        info!(peer_id = %peer_id, "Creating peer link");

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {e}")))?;

        let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| Error::WebRtcError(format!("Failed to create peer connection: {e}")))?,
        );

        let state = Arc::new(RwLock::new(LinkState::New));
        let connected_at = Arc::new(RwLock::new(None));

        // Peer connection state drives both the public link state and the
        // health signal fed into recovery.
        {
            let state = Arc::clone(&state);
            let connected_at = Arc::clone(&connected_at);
            let notices = notices.clone();
            let peer_id = peer_id.clone();
            peer_connection.on_peer_connection_state_change(Box::new(
                move |s: RTCPeerConnectionState| {
                    let state = Arc::clone(&state);
                    let connected_at = Arc::clone(&connected_at);
                    let notices = notices.clone();
                    let peer_id = peer_id.clone();
                    Box::pin(async move {
                        let (new_state, signal) = match s {
                            RTCPeerConnectionState::New => (LinkState::New, None),
                            RTCPeerConnectionState::Connecting => (LinkState::Negotiating, None),
                            RTCPeerConnectionState::Connected => {
                                *connected_at.write().await = Some(SystemTime::now());
                                (LinkState::Connected, Some(LinkSignal::Healthy))
                            }
                            RTCPeerConnectionState::Disconnected => (
                                LinkState::Disconnected,
                                Some(LinkSignal::Degraded("transport disconnected")),
                            ),
                            RTCPeerConnectionState::Failed => (
                                LinkState::Failed,
                                Some(LinkSignal::Degraded("transport failed")),
                            ),
                            RTCPeerConnectionState::Closed => {
                                (LinkState::Closed, Some(LinkSignal::Closed))
                            }
                            _ => return,
                        };

                        let mut guard = state.write().await;
                        let old_state = *guard;
                        if old_state != new_state {
                            debug!(peer_id = %peer_id, from = %old_state, to = %new_state, "Link state transition");
                            *guard = new_state;
                        }
                        drop(guard);

                        if let Some(signal) = signal {
                            let _ = notices.send((peer_id, LinkNotice::Signal(signal)));
                        }
                    })
                },
            ));
        }

        // ICE connection state can degrade before the peer connection state
        // does; both feed the same signal and recovery coalesces them.
        {
            let notices = notices.clone();
            let peer_id = peer_id.clone();
            peer_connection.on_ice_connection_state_change(Box::new(
                move |s: RTCIceConnectionState| {
                    let notices = notices.clone();
                    let peer_id = peer_id.clone();
                    Box::pin(async move {
                        let signal = match s {
                            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                                Some(LinkSignal::Healthy)
                            }
                            RTCIceConnectionState::Disconnected => {
                                Some(LinkSignal::Degraded("ice disconnected"))
                            }
                            RTCIceConnectionState::Failed => {
                                Some(LinkSignal::Degraded("ice failed"))
                            }
                            _ => None,
                        };
                        if let Some(signal) = signal {
                            let _ = notices.send((peer_id, LinkNotice::Signal(signal)));
                        }
                    })
                },
            ));
        }

        {
            let notices = notices.clone();
            let peer_id = peer_id.clone();
            peer_connection.on_ice_candidate(Box::new(move |candidate| {
                let notices = notices.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    // None marks end of gathering
                    if let Some(candidate) = candidate {
                        match candidate.to_json() {
                            Ok(init) => {
                                let _ = notices
                                    .send((peer_id, LinkNotice::Candidate(init.into())));
                            }
                            Err(e) => {
                                warn!(peer_id = %peer_id, error = %e, "Failed to serialize ICE candidate");
                            }
                        }
                    }
                })
            }));
        }

        {
            let notices = notices.clone();
            let peer_id = peer_id.clone();
            peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
                let notices = notices.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    if track.kind() != RTPCodecType::Audio {
                        debug!(peer_id = %peer_id, kind = %track.kind(), "Ignoring non-audio remote track");
                        return;
                    }
                    let _ = notices.send((peer_id, LinkNotice::RemoteTrack(track)));
                })
            }));
        }

        Ok(Arc::new(Self {
            peer_id,
            peer_connection,
            state,
            connected_at,
            audio_sender: RwLock::new(None),
        }))
    }

    /// Create a tuned SDP offer and install it as the local description
    ///
    /// `ice_restart` requests fresh ICE credentials for transport recovery.
    pub(crate) async fn offer(&self, tuning: &OpusTuning, ice_restart: bool) -> Result<String> {
        *self.state.write().await = LinkState::Negotiating;

        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });

        let offer = self
            .peer_connection
            .create_offer(options)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {e}")))?;

        let tuned = sdp::tune(&offer.sdp, tuning);
        let tuned_offer = RTCSessionDescription::offer(tuned)
            .map_err(|e| Error::SdpError(format!("Failed to parse tuned offer: {e}")))?;

        self.peer_connection
            .set_local_description(tuned_offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {e}")))?;

        let local_desc = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("No local description after setting offer".to_string()))?;

        debug!(peer_id = %self.peer_id, ice_restart, "Created SDP offer");
        Ok(local_desc.sdp)
    }

    /// Accept a remote offer and produce a tuned answer
    pub(crate) async fn answer(&self, offer_sdp: String, tuning: &OpusTuning) -> Result<String> {
        *self.state.write().await = LinkState::Negotiating;

        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse offer: {e}")))?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {e}")))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {e}")))?;

        let tuned = sdp::tune(&answer.sdp, tuning);
        let tuned_answer = RTCSessionDescription::answer(tuned)
            .map_err(|e| Error::SdpError(format!("Failed to parse tuned answer: {e}")))?;

        self.peer_connection
            .set_local_description(tuned_answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {e}")))?;

        let local_desc = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| {
                Error::SdpError("No local description after setting answer".to_string())
            })?;

        debug!(peer_id = %self.peer_id, "Created SDP answer");
        Ok(local_desc.sdp)
    }

    /// Install a remote answer to our offer
    pub(crate) async fn accept_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse answer: {e}")))?;

        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {e}")))?;

        debug!(peer_id = %self.peer_id, "Accepted SDP answer");
        Ok(())
    }

    /// Add a remote ICE candidate
    pub(crate) async fn add_remote_candidate(&self, candidate: IceCandidatePayload) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {e}")))
    }

    /// Swap the outbound audio track
    ///
    /// Returns `true` when the change needs renegotiation: only the first
    /// `add_track` does, `replace_track` (including replacing with `None`)
    /// keeps the existing sender and media line.
    pub(crate) async fn set_outbound_track(
        &self,
        track: Option<Arc<dyn TrackLocal + Send + Sync>>,
    ) -> Result<bool> {
        let mut sender_guard = self.audio_sender.write().await;

        if let Some(sender) = sender_guard.as_ref() {
            sender
                .replace_track(track)
                .await
                .map_err(|e| Error::MediaError(format!("Failed to replace track: {e}")))?;
            return Ok(false);
        }

        match track {
            Some(track) => {
                let sender = self
                    .peer_connection
                    .add_track(track)
                    .await
                    .map_err(|e| Error::MediaError(format!("Failed to add track: {e}")))?;
                *sender_guard = Some(sender);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Current link state
    pub(crate) async fn state(&self) -> LinkState {
        *self.state.read().await
    }

    /// Snapshot for callers
    pub(crate) async fn info(&self) -> PeerInfo {
        let state = self.state().await;
        let duration_secs = if state == LinkState::Connected {
            self.connected_at
                .read()
                .await
                .and_then(|t| t.elapsed().ok())
                .map(|d| d.as_secs())
        } else {
            None
        };
        PeerInfo {
            peer_id: self.peer_id.clone(),
            state,
            duration_secs,
        }
    }

    /// Close the underlying peer connection
    pub(crate) async fn close(&self) -> Result<()> {
        info!(peer_id = %self.peer_id, "Closing peer link");
        *self.state.write().await = LinkState::Closed;
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to close connection: {e}")))
    }

    /// Whether the link has reached its terminal state
    pub(crate) async fn is_closed(&self) -> bool {
        *self.state.read().await == LinkState::Closed
    }
}
