//! Offer/answer negotiation state machine
//!
//! Exactly one offer and one answer per session. The machine only tracks
//! where the session is; the session controller performs the transport work
//! and reports the outcome back here.
//!
//! ```text
//! Idle ──> Negotiating(Local) ──> Negotiating(RemoteApplied) ──> Connected ──> Disconnected
//!   │              │                        │
//!   └──────────────┴────────────────────────┴──> Failed
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::webrtc::signaling::PeerState;

/// Fixed role of a device for the lifetime of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Camera host: creates the data channel and the offer
    Initiator,
    /// Viewer: applies the offer and gives the answer
    Responder,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// Sub-phase of `Negotiating`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationPhase {
    /// Local description is being built or waits to be shown to the peer
    Local,
    /// Both descriptions are in place, waiting for the transport to connect
    RemoteApplied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "phase", rename_all = "snake_case")]
pub enum NegotiationState {
    Idle,
    Negotiating(NegotiationPhase),
    Connected,
    Disconnected,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Disconnected | NegotiationState::Failed)
    }

    pub fn connection_state(&self) -> ConnectionState {
        match self {
            NegotiationState::Idle => ConnectionState::Idle,
            NegotiationState::Negotiating(_) => ConnectionState::Negotiating,
            NegotiationState::Connected => ConnectionState::Connected,
            NegotiationState::Disconnected => ConnectionState::Disconnected,
            NegotiationState::Failed => ConnectionState::Failed,
        }
    }
}

/// Session state observed by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Idle,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Negotiating => write!(f, "negotiating"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// Negotiation state machine for one session
#[derive(Debug)]
pub struct Negotiator {
    role: Role,
    state: NegotiationState,
    /// Initiator: offer payload has been produced
    offer_exported: bool,
    failure: Option<String>,
}

impl Negotiator {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: NegotiationState::Idle,
            offer_exported: false,
            failure: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Reason recorded by the transition into `Failed`
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    fn expect_role(&self, role: Role, operation: &str) -> Result<()> {
        if self.role != role {
            return Err(AppError::ProtocolViolation(format!(
                "{} is not allowed for the {} role",
                operation, self.role
            )));
        }
        Ok(())
    }

    fn expect_live(&self, operation: &str) -> Result<()> {
        if self.state.is_terminal() {
            return Err(AppError::ProtocolViolation(format!(
                "{} on a {} session; start a new session",
                operation,
                self.state.connection_state()
            )));
        }
        Ok(())
    }

    fn transition(&mut self, next: NegotiationState) -> NegotiationState {
        if self.state != next {
            debug!("Negotiation ({}) {:?} -> {:?}", self.role, self.state, next);
            self.state = next;
        }
        next
    }

    /// Initiator: start building the offer
    pub fn begin_offer(&mut self) -> Result<NegotiationState> {
        self.expect_role(Role::Initiator, "createOffer")?;
        self.expect_live("createOffer")?;
        if self.state != NegotiationState::Idle {
            return Err(AppError::ProtocolViolation(
                "An offer was already created for this session".to_string(),
            ));
        }
        Ok(self.transition(NegotiationState::Negotiating(NegotiationPhase::Local)))
    }

    /// Initiator: the gathered offer has been encoded for display
    pub fn offer_exported(&mut self) -> Result<()> {
        self.expect_role(Role::Initiator, "exportOffer")?;
        if self.state != NegotiationState::Negotiating(NegotiationPhase::Local) {
            return Err(AppError::ProtocolViolation(format!(
                "Cannot export an offer in state {:?}",
                self.state
            )));
        }
        self.offer_exported = true;
        Ok(())
    }

    /// Initiator: check that a scanned answer may be applied now
    pub fn check_apply_answer(&self) -> Result<()> {
        self.expect_role(Role::Initiator, "applyAnswer")?;
        self.expect_live("applyAnswer")?;
        match self.state {
            NegotiationState::Negotiating(NegotiationPhase::Local) if self.offer_exported => Ok(()),
            NegotiationState::Idle | NegotiationState::Negotiating(NegotiationPhase::Local) => {
                Err(AppError::ProtocolViolation(
                    "No offer has been exported yet".to_string(),
                ))
            }
            _ => Err(AppError::ProtocolViolation(
                "An answer was already applied; renegotiation is not supported".to_string(),
            )),
        }
    }

    /// Initiator: the answer is set as remote description
    pub fn answer_applied(&mut self) -> Result<NegotiationState> {
        self.check_apply_answer()?;
        Ok(self.transition(NegotiationState::Negotiating(
            NegotiationPhase::RemoteApplied,
        )))
    }

    /// Responder: accept a scanned offer, only from `Idle`
    pub fn begin_apply_offer(&mut self) -> Result<NegotiationState> {
        self.expect_role(Role::Responder, "applyOffer")?;
        self.expect_live("applyOffer")?;
        if self.state != NegotiationState::Idle {
            return Err(AppError::ProtocolViolation(
                "An offer was already applied; renegotiation is not supported".to_string(),
            ));
        }
        Ok(self.transition(NegotiationState::Negotiating(NegotiationPhase::Local)))
    }

    /// Responder: the gathered answer has been encoded for display
    pub fn answer_exported(&mut self) -> Result<NegotiationState> {
        self.expect_role(Role::Responder, "exportAnswer")?;
        match self.state {
            NegotiationState::Negotiating(NegotiationPhase::Local) => Ok(self.transition(
                NegotiationState::Negotiating(NegotiationPhase::RemoteApplied),
            )),
            // The transport may already have connected while the answer was encoded
            NegotiationState::Connected => Ok(self.state),
            other => Err(AppError::ProtocolViolation(format!(
                "Cannot export an answer in state {:?}",
                other
            ))),
        }
    }

    /// Record a failure. No-op once terminal.
    pub fn fail(&mut self, reason: impl Into<String>) -> NegotiationState {
        if self.state.is_terminal() {
            return self.state;
        }
        let reason = reason.into();
        warn!("Negotiation ({}) failed: {}", self.role, reason);
        self.failure = Some(reason);
        self.transition(NegotiationState::Failed)
    }

    /// Feed a transport state change; returns the new state if it changed
    pub fn on_peer_state(&mut self, peer: PeerState) -> Option<NegotiationState> {
        let before = self.state;
        match (self.state, peer) {
            (NegotiationState::Negotiating(_), PeerState::Connected) => {
                info!("Session ({}) connected", self.role);
                self.transition(NegotiationState::Connected);
            }
            (NegotiationState::Connected, peer) if peer.is_terminal() => {
                info!("Session ({}) lost its peer: {}", self.role, peer);
                self.transition(NegotiationState::Disconnected);
            }
            (NegotiationState::Idle | NegotiationState::Negotiating(_), PeerState::Failed) => {
                self.fail("transport reported failure");
            }
            (NegotiationState::Negotiating(_), PeerState::Disconnected | PeerState::Closed) => {
                self.fail(format!("peer connection {} before connecting", peer));
            }
            (state, peer) => {
                debug!("Ignoring peer state {} in {:?}", peer, state);
            }
        }
        (self.state != before).then_some(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_initiator() -> Negotiator {
        let mut n = Negotiator::new(Role::Initiator);
        n.begin_offer().unwrap();
        n.offer_exported().unwrap();
        n.answer_applied().unwrap();
        n.on_peer_state(PeerState::Connected);
        n
    }

    #[test]
    fn test_initiator_path() {
        let mut n = Negotiator::new(Role::Initiator);
        assert_eq!(n.state(), NegotiationState::Idle);

        n.begin_offer().unwrap();
        assert_eq!(
            n.state(),
            NegotiationState::Negotiating(NegotiationPhase::Local)
        );

        // Answer before the offer was shown to anyone
        assert!(matches!(
            n.check_apply_answer(),
            Err(AppError::ProtocolViolation(_))
        ));

        n.offer_exported().unwrap();
        n.answer_applied().unwrap();
        assert_eq!(
            n.state(),
            NegotiationState::Negotiating(NegotiationPhase::RemoteApplied)
        );
        assert_eq!(n.state().connection_state(), ConnectionState::Negotiating);

        // Applying the answer is not enough; the transport confirms
        assert_eq!(
            n.on_peer_state(PeerState::Connected),
            Some(NegotiationState::Connected)
        );
    }

    #[test]
    fn test_responder_path() {
        let mut n = Negotiator::new(Role::Responder);
        n.begin_apply_offer().unwrap();
        n.answer_exported().unwrap();
        assert_eq!(
            n.state(),
            NegotiationState::Negotiating(NegotiationPhase::RemoteApplied)
        );
        n.on_peer_state(PeerState::Connecting);
        assert_eq!(n.state().connection_state(), ConnectionState::Negotiating);
        n.on_peer_state(PeerState::Connected);
        assert_eq!(n.state().connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn test_second_offer_or_answer_rejected() {
        let mut responder = Negotiator::new(Role::Responder);
        responder.begin_apply_offer().unwrap();
        assert!(matches!(
            responder.begin_apply_offer(),
            Err(AppError::ProtocolViolation(_))
        ));

        let mut initiator = connected_initiator();
        assert!(matches!(
            initiator.answer_applied(),
            Err(AppError::ProtocolViolation(_))
        ));
        assert!(matches!(
            initiator.begin_offer(),
            Err(AppError::ProtocolViolation(_))
        ));
        // Rejection does not disturb a live session
        assert_eq!(initiator.state(), NegotiationState::Connected);
    }

    #[test]
    fn test_role_mismatch() {
        let mut n = Negotiator::new(Role::Responder);
        assert!(matches!(
            n.begin_offer(),
            Err(AppError::ProtocolViolation(_))
        ));
        assert_eq!(n.state(), NegotiationState::Idle);
    }

    #[test]
    fn test_failure_is_terminal() {
        let mut n = Negotiator::new(Role::Initiator);
        n.begin_offer().unwrap();
        n.fail("gathering timed out");
        assert_eq!(n.state(), NegotiationState::Failed);
        assert_eq!(n.failure(), Some("gathering timed out"));

        // Nothing revives a failed session
        assert_eq!(n.on_peer_state(PeerState::Connected), None);
        assert!(n.begin_offer().is_err());
        assert_eq!(n.fail("again"), NegotiationState::Failed);
        assert_eq!(n.failure(), Some("gathering timed out"));
    }

    #[test]
    fn test_transport_failure_while_negotiating() {
        let mut n = Negotiator::new(Role::Responder);
        n.begin_apply_offer().unwrap();
        assert_eq!(
            n.on_peer_state(PeerState::Failed),
            Some(NegotiationState::Failed)
        );
    }

    #[test]
    fn test_link_lost_before_connecting_fails() {
        let mut n = Negotiator::new(Role::Initiator);
        n.begin_offer().unwrap();
        n.offer_exported().unwrap();
        n.answer_applied().unwrap();
        assert_eq!(
            n.on_peer_state(PeerState::Disconnected),
            Some(NegotiationState::Failed)
        );
        assert_eq!(n.failure(), Some("peer connection disconnected before connecting"));

        // An idle session has no link to lose
        let mut n = Negotiator::new(Role::Responder);
        assert_eq!(n.on_peer_state(PeerState::Closed), None);
        assert_eq!(n.state(), NegotiationState::Idle);
    }

    #[test]
    fn test_disconnect_after_connected() {
        let mut n = connected_initiator();
        assert_eq!(
            n.on_peer_state(PeerState::Disconnected),
            Some(NegotiationState::Disconnected)
        );
        // No auto-reconnect
        assert_eq!(n.on_peer_state(PeerState::Connected), None);
        assert_eq!(n.state(), NegotiationState::Disconnected);
    }
}
