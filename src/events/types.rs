//! Session event types

use serde::{Deserialize, Serialize};

use crate::control::ControlMessage;
use crate::negotiation::ConnectionState;

/// Event emitted by a session
///
/// Serialized as `{"event": "session.state_changed", "data": {...}}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    /// Session connection state changed
    #[serde(rename = "session.state_changed")]
    StateChanged {
        state: ConnectionState,
        /// Failure reason when `state` is `failed`
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Peer started sending a media track
    #[serde(rename = "session.remote_track")]
    RemoteTrack {
        /// "audio" or "video"
        kind: String,
        id: String,
    },

    /// Control data channel is open in this direction
    #[serde(rename = "session.channel_open")]
    ChannelOpen { label: String },

    /// Control message received and accepted
    #[serde(rename = "control.received")]
    ControlReceived { message: ControlMessage },

    /// Still image arrived from the peer
    #[serde(rename = "control.photo")]
    PhotoReceived {
        image_data: String,
        received_at: chrono::DateTime<chrono::Utc>,
    },

    /// Control request could not be honoured locally (never sent to the peer)
    #[serde(rename = "control.diagnostic")]
    ControlDiagnostic { capability: String, message: String },

    /// Power management suggestion
    #[serde(rename = "advisor.suggestion")]
    AdvisorSuggestion {
        should_keep_alive: bool,
        reason: String,
    },
}
