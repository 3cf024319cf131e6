//! Configuration types for the voice mesh coordinator

use serde::{Deserialize, Serialize};

/// Main configuration for the voice channel coordinator
///
/// Resolved once at startup and passed into
/// [`VoiceChannelCoordinator::new`](crate::VoiceChannelCoordinator::new);
/// nothing in the mesh reads configuration from ambient globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceMeshConfig {
    /// Local peer ID (auto-generated v4 UUID by default)
    pub local_peer_id: String,

    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional relay fallback)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Maximum peers in the mesh (default: 10)
    pub max_peers: u32,

    /// ICE recovery policy
    pub recovery: RecoveryPolicy,

    /// Opus SDP tuning targets applied to every local description
    pub opus: OpusTuning,

    /// Outbound encoder hints (non-SDP transport hints)
    pub sender_hints: SenderHints,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// ICE recovery policy
///
/// Restart attempts are bounded and fire on a fixed delay; there is no
/// exponential growth because a voice channel either comes back within a
/// couple of restarts or needs a relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    /// Maximum ICE restart attempts per peer before giving up (default: 3)
    pub max_attempts: u32,

    /// Fixed delay before each restart in milliseconds (default: 2000)
    pub restart_delay_ms: u64,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            restart_delay_ms: 2000,
        }
    }
}

/// Fixed Opus format-parameter targets written into every local description
///
/// See [`crate::sdp::tune`] for how these land in the fmtp line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpusTuning {
    /// Enable stereo decoding/encoding hints
    pub stereo: bool,

    /// Enable in-band forward error correction
    pub fec: bool,

    /// Constant bitrate (disabled: VBR tracks speech better)
    pub cbr: bool,

    /// Maximum average bitrate in bits/s
    pub max_average_bitrate: u32,

    /// Maximum playback sample rate in Hz
    pub max_playback_rate: u32,

    /// Minimum packet time hint in milliseconds
    pub min_ptime_ms: u32,

    /// Maximum packet time hint in milliseconds
    pub max_ptime_ms: u32,

    /// Packet time directive inserted when the media section lacks one
    pub ptime_ms: u32,
}

impl Default for OpusTuning {
    fn default() -> Self {
        Self {
            stereo: true,
            fec: true,
            cbr: false,
            max_average_bitrate: 64_000,
            max_playback_rate: 48_000,
            min_ptime_ms: 10,
            max_ptime_ms: 60,
            ptime_ms: 20,
        }
    }
}

/// Outbound sender priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderPriority {
    /// Background traffic
    Low,
    /// Default priority
    Medium,
    /// Voice-first priority
    High,
}

/// What the encoder should sacrifice first under constrained bandwidth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationPreference {
    /// Keep fidelity, allow packet rate to drop
    MaintainQuality,
    /// Keep packet rate, allow fidelity to drop
    MaintainRate,
    /// Let the encoder decide
    Balanced,
}

/// Per-sender transport hints applied to the outbound encoder
///
/// These are deliberately NOT written into SDP; they are handed to the
/// capture collaborator's [`EncoderControl`](crate::media::EncoderControl)
/// before every outbound description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderHints {
    /// Bitrate ceiling in bits/s
    pub max_bitrate_bps: u32,

    /// Sender priority
    pub priority: SenderPriority,

    /// Degradation preference under constrained bandwidth
    pub degradation: DegradationPreference,
}

impl Default for SenderHints {
    fn default() -> Self {
        Self {
            max_bitrate_bps: 64_000,
            priority: SenderPriority::High,
            degradation: DegradationPreference::MaintainQuality,
        }
    }
}

impl Default for VoiceMeshConfig {
    fn default() -> Self {
        Self {
            local_peer_id: uuid::Uuid::new_v4().to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            max_peers: 10,
            recovery: RecoveryPolicy::default(),
            opus: OpusTuning::default(),
            sender_hints: SenderHints::default(),
        }
    }
}

impl VoiceMeshConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `stun_servers` is empty
    /// - `max_peers` is not in range 1-64
    /// - `recovery.max_attempts` is zero
    /// - `opus.max_average_bitrate` is outside the Opus range 6000-510000
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        if self.max_peers == 0 || self.max_peers > 64 {
            return Err(Error::InvalidConfig(format!(
                "max_peers must be in range 1-64, got {}",
                self.max_peers
            )));
        }

        if self.recovery.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "recovery.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.opus.max_average_bitrate < 6_000 || self.opus.max_average_bitrate > 510_000 {
            return Err(Error::InvalidConfig(format!(
                "opus.max_average_bitrate must be in range 6000-510000, got {}",
                self.opus.max_average_bitrate
            )));
        }

        if self.opus.min_ptime_ms == 0 || self.opus.min_ptime_ms > self.opus.max_ptime_ms {
            return Err(Error::InvalidConfig(format!(
                "opus packet time hints out of order: min {} max {}",
                self.opus.min_ptime_ms, self.opus.max_ptime_ms
            )));
        }

        Ok(())
    }

    /// Whether a relay (TURN) fallback is configured
    ///
    /// Drives the one-shot "connection degraded" warning: with a relay
    /// available, exhausted restarts are not worth alerting the user about.
    pub fn has_relay_fallback(&self) -> bool {
        !self.turn_servers.is_empty()
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Set the local peer ID
    pub fn with_local_peer_id(mut self, peer_id: &str) -> Self {
        self.local_peer_id = peer_id.to_string();
        self
    }

    /// Set the maximum number of peers
    pub fn with_max_peers(mut self, max_peers: u32) -> Self {
        self.max_peers = max_peers;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = VoiceMeshConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_stun_servers_fails() {
        let mut config = VoiceMeshConfig::default();
        config.stun_servers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_max_peers_fails() {
        let mut config = VoiceMeshConfig::default();
        config.max_peers = 0;
        assert!(config.validate().is_err());

        config.max_peers = 65;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_recovery_attempts_fails() {
        let mut config = VoiceMeshConfig::default();
        config.recovery.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_opus_bitrate_range() {
        let mut config = VoiceMeshConfig::default();
        config.opus.max_average_bitrate = 1_000;
        assert!(config.validate().is_err());

        config.opus.max_average_bitrate = 600_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_relay_fallback_detection() {
        let config = VoiceMeshConfig::default();
        assert!(!config.has_relay_fallback());

        let config = config.with_turn_servers(vec![TurnServerConfig {
            url: "turn:turn.example.com:3478".to_string(),
            username: "user".to_string(),
            credential: "pass".to_string(),
        }]);
        assert!(config.has_relay_fallback());
    }

    #[test]
    fn test_builder_chain() {
        let config = VoiceMeshConfig::default()
            .with_local_peer_id("me")
            .with_max_peers(4);
        assert!(config.validate().is_ok());
        assert_eq!(config.local_peer_id, "me");
        assert_eq!(config.max_peers, 4);
    }

    #[test]
    fn test_config_serialization() {
        let config = VoiceMeshConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: VoiceMeshConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.local_peer_id, deserialized.local_peer_id);
        assert_eq!(config.max_peers, deserialized.max_peers);
    }
}
