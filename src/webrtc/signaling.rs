//! Session description and transport state types

use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{AppError, Result};

/// Description type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl std::fmt::Display for SdpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
        }
    }
}

/// One endpoint's media/network parameters
///
/// Serializes as `{"type": "offer", "sdp": "..."}`, the same shape browsers
/// use for `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(SdpKind::Offer, sdp)
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(SdpKind::Answer, sdp)
    }

    /// Number of `a=candidate:` lines embedded in the body
    pub fn candidate_count(&self) -> usize {
        self.sdp.matches("a=candidate:").count()
    }

    /// Convert into the `webrtc` crate representation, parsing the SDP body
    pub fn to_rtc(&self) -> Result<RTCSessionDescription> {
        let parsed = match self.kind {
            SdpKind::Offer => RTCSessionDescription::offer(self.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(self.sdp.clone()),
        };
        parsed.map_err(|e| {
            AppError::InvalidDescription(format!("Invalid SDP {}: {}", self.kind, e))
        })
    }
}

impl TryFrom<RTCSessionDescription> for SessionDescription {
    type Error = AppError;

    fn try_from(desc: RTCSessionDescription) -> Result<Self> {
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            other => {
                return Err(AppError::InvalidDescription(format!(
                    "Unsupported description type: {}",
                    other
                )))
            }
        };
        Ok(Self::new(kind, desc.sdp))
    }
}

/// ICE gathering progress
///
/// A description must not be exported before `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IceGatheringState {
    #[default]
    New,
    Gathering,
    Complete,
}

impl std::fmt::Display for IceGatheringState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IceGatheringState::New => write!(f, "new"),
            IceGatheringState::Gathering => write!(f, "gathering"),
            IceGatheringState::Complete => write!(f, "complete"),
        }
    }
}

/// Underlying peer connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// No further transitions are expected after this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PeerState::Disconnected | PeerState::Failed | PeerState::Closed
        )
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::New => write!(f, "new"),
            PeerState::Connecting => write!(f, "connecting"),
            PeerState::Connected => write!(f, "connected"),
            PeerState::Disconnected => write!(f, "disconnected"),
            PeerState::Failed => write!(f, "failed"),
            PeerState::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_json_shape() {
        let desc = SessionDescription::offer("v=0\r\n");
        let json = serde_json::to_string(&desc).unwrap();
        assert_eq!(json, r#"{"type":"offer","sdp":"v=0\r\n"}"#);
    }

    #[test]
    fn test_candidate_count() {
        let desc = SessionDescription::answer(concat!(
            "v=0\r\n",
            "a=candidate:1 1 udp 1 10.0.0.1 5000 typ host\r\n",
            "a=candidate:2 1 udp 1 10.0.0.2 5000 typ host\r\n",
        ));
        assert_eq!(desc.candidate_count(), 2);
    }

    #[test]
    fn test_garbage_sdp_is_invalid_description() {
        let desc = SessionDescription::offer("definitely not sdp");
        assert!(matches!(
            desc.to_rtc(),
            Err(AppError::InvalidDescription(_))
        ));
    }

    #[test]
    fn test_terminal_states() {
        assert!(PeerState::Failed.is_terminal());
        assert!(PeerState::Disconnected.is_terminal());
        assert!(!PeerState::Connecting.is_terminal());
    }
}
