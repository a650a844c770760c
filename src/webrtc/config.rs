//! WebRTC configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Public STUN endpoint used when no servers are configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Default label of the control data channel
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "control";

/// WebRTC configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// Label of the control data channel created by the initiator
    pub data_channel_label: String,
    /// Give up on ICE gathering after this many milliseconds (None = wait forever)
    pub gathering_timeout_ms: Option<u64>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            turn_servers: vec![],
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            gathering_timeout_ms: Some(10_000),
        }
    }
}

impl WebRtcConfig {
    /// Config without any ICE servers (host candidates only)
    pub fn host_only() -> Self {
        Self {
            stun_servers: vec![],
            ..Default::default()
        }
    }

    pub fn gathering_timeout(&self) -> Option<Duration> {
        self.gathering_timeout_ms.map(Duration::from_millis)
    }

    /// At least one STUN or TURN endpoint is configured
    pub fn has_ice_servers(&self) -> bool {
        !self.stun_servers.is_empty() || !self.turn_servers.is_empty()
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnServer {
    /// TURN server URLs (e.g., ["turn:turn.example.com:3478?transport=udp"])
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl TurnServer {
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_public_stun() {
        let config = WebRtcConfig::default();
        assert!(config.has_ice_servers());
        assert_eq!(config.stun_servers[0], DEFAULT_STUN_SERVER);
        assert_eq!(config.data_channel_label, "control");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: WebRtcConfig =
            serde_json::from_str(r#"{"gathering_timeout_ms": null}"#).unwrap();
        assert_eq!(config.gathering_timeout(), None);
        assert_eq!(config.stun_servers.len(), 1);
    }

    #[test]
    fn test_turn_only_counts_as_ice_servers() {
        let mut config = WebRtcConfig::host_only();
        assert!(!config.has_ice_servers());
        config.turn_servers.push(TurnServer::new(
            "turn:turn.example.com:3478".to_string(),
            "user".to_string(),
            "secret".to_string(),
        ));
        assert!(config.has_ice_servers());
    }
}
