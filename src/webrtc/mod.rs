//! Peer transport layer
//!
//! Architecture:
//! ```text
//! Host (initiator)                          Client (responder)
//!   WebRtcTransport                           WebRtcTransport
//!     | offer, gathered                          ^
//!     +------ optical code / paste --------------+
//!     ^                                          | answer, gathered
//!     +------ optical code / paste --------------+
//!        |
//!        +==== media + "control" data channel ====+
//! ```
//!
//! `LoopbackTransport` implements the same contract inside one process.

pub mod config;
pub mod loopback;
pub mod mdns;
pub mod peer;
pub mod signaling;
pub mod transport;

pub use config::{TurnServer, WebRtcConfig};
pub use loopback::{LoopbackNetwork, LoopbackTrack, LoopbackTransport};
pub use peer::{LocalTrack, WebRtcTransport};
pub use signaling::{IceGatheringState, PeerState, SdpKind, SessionDescription};
pub use transport::{PeerStateFeed, PeerTransport};
