//! Signaling message types for the voice channel event channel
//!
//! The signaling transport itself (WebSocket, IPC, whatever the application
//! uses) is a collaborator; this module only defines the serde shapes crossing
//! it. Inbound messages are routed through
//! [`VoiceChannelCoordinator::handle_signaling`](crate::VoiceChannelCoordinator::handle_signaling);
//! outbound traffic and UI notifications arrive as [`VoiceMeshEvent`] values
//! on the coordinator's event receiver.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// An ICE candidate as carried over signaling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidatePayload {
    /// Candidate attribute string
    pub candidate: String,

    /// Media stream identification tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Media line index
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl From<RTCIceCandidateInit> for IceCandidatePayload {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        }
    }
}

impl From<IceCandidatePayload> for RTCIceCandidateInit {
    fn from(payload: IceCandidatePayload) -> Self {
        RTCIceCandidateInit {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
            username_fragment: None,
        }
    }
}

/// Inbound signaling messages
///
/// Delivery is at-least-once and unordered across peers; every handler in the
/// coordinator absorbs out-of-order arrivals for unknown peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// A peer joined the voice channel
    PeerJoined {
        /// Peer identifier
        peer_id: String,
        /// Display name, if the channel system provides one
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// A peer left the voice channel
    PeerLeft {
        /// Peer identifier
        peer_id: String,
    },

    /// SDP offer from a remote peer
    Offer {
        /// Sender peer
        peer_id: String,
        /// Offer SDP text
        sdp: String,
    },

    /// SDP answer from a remote peer
    Answer {
        /// Sender peer
        peer_id: String,
        /// Answer SDP text
        sdp: String,
    },

    /// ICE candidate from a remote peer
    IceCandidate {
        /// Sender peer
        peer_id: String,
        /// Candidate payload
        candidate: IceCandidatePayload,
    },
}

impl SignalingMessage {
    /// Convert message to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize signaling message: {e}"))
        })
    }

    /// Parse message from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize signaling message: {e}"
            ))
        })
    }

    /// The peer this message concerns
    pub fn peer_id(&self) -> &str {
        match self {
            SignalingMessage::PeerJoined { peer_id, .. }
            | SignalingMessage::PeerLeft { peer_id }
            | SignalingMessage::Offer { peer_id, .. }
            | SignalingMessage::Answer { peer_id, .. }
            | SignalingMessage::IceCandidate { peer_id, .. } => peer_id,
        }
    }
}

/// Events emitted by the coordinator
///
/// `Offer`/`Answer`/`IceCandidate` are destined for the signaling transport;
/// `SpeakingChanged` and `ConnectionDegraded` are destined for the UI layer.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceMeshEvent {
    /// Send this SDP offer to the peer
    Offer {
        /// Recipient peer
        peer_id: String,
        /// Offer SDP text
        sdp: String,
    },

    /// Send this SDP answer to the peer
    Answer {
        /// Recipient peer
        peer_id: String,
        /// Answer SDP text
        sdp: String,
    },

    /// Relay this ICE candidate to the peer
    IceCandidate {
        /// Recipient peer
        peer_id: String,
        /// Candidate payload
        candidate: IceCandidatePayload,
    },

    /// A peer started or stopped speaking
    SpeakingChanged {
        /// Peer whose speaking state changed
        peer_id: String,
        /// New speaking state
        speaking: bool,
    },

    /// Recovery is exhausted and no relay fallback is configured
    ///
    /// Emitted at most once per process lifetime, regardless of how many
    /// peers hit the restart bound.
    ConnectionDegraded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip() {
        let msg = SignalingMessage::Offer {
            peer_id: "peer-a".to_string(),
            sdp: "v=0".to_string(),
        };
        let json = msg.to_json().unwrap();
        let parsed = SignalingMessage::from_json(&json).unwrap();
        assert_eq!(msg, parsed);
    }

    #[test]
    fn test_message_tag_format() {
        let msg = SignalingMessage::PeerJoined {
            peer_id: "peer-a".to_string(),
            name: Some("Alice".to_string()),
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"peer_joined\""));
    }

    #[test]
    fn test_peer_id_accessor() {
        let msg = SignalingMessage::PeerLeft {
            peer_id: "peer-b".to_string(),
        };
        assert_eq!(msg.peer_id(), "peer-b");
    }

    #[test]
    fn test_candidate_payload_conversion() {
        let payload = IceCandidatePayload {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54400 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let init: RTCIceCandidateInit = payload.clone().into();
        assert_eq!(init.candidate, payload.candidate);
        let back: IceCandidatePayload = init.into();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_malformed_json_is_error() {
        let err = SignalingMessage::from_json("{\"type\":\"bogus\"}").unwrap_err();
        assert!(matches!(err, crate::Error::SerializationError(_)));
    }
}
