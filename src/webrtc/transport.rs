//! Transport session contract
//!
//! One peer connection plus its control data channel end. `WebRtcTransport`
//! is the production implementation; `LoopbackTransport` connects two
//! sessions inside one process.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::warn;

use super::signaling::{IceGatheringState, PeerState, SdpKind, SessionDescription};
use crate::control::ControlMessage;
use crate::error::{AppError, Result};
use crate::negotiation::Role;

/// Peer connection state with a lossless change feed
///
/// The watch side only holds the latest state. Subscribers that must see
/// every transition (a connect followed at once by a disconnect) read the
/// broadcast side, which is seeded with the state current at subscription.
pub struct PeerStateFeed {
    current: watch::Sender<PeerState>,
    changes: Mutex<broadcast::Sender<PeerState>>,
}

impl PeerStateFeed {
    pub fn new() -> Self {
        let (current, _) = watch::channel(PeerState::New);
        let (changes, _) = broadcast::channel(32);
        Self {
            current,
            changes: Mutex::new(changes),
        }
    }

    /// Record `state`, returning the previous one
    pub fn set(&self, state: PeerState) -> PeerState {
        let changes = self.changes.lock();
        let previous = self.current.send_replace(state);
        if previous != state {
            let _ = changes.send(state);
        }
        previous
    }

    pub fn get(&self) -> PeerState {
        *self.current.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<PeerState> {
        self.current.subscribe()
    }

    /// Current state and a receiver of every later change
    pub fn subscribe(&self) -> (PeerState, broadcast::Receiver<PeerState>) {
        let changes = self.changes.lock();
        (self.get(), changes.subscribe())
    }
}

impl Default for PeerStateFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Locally captured track type
    type Track: Send + 'static;

    fn role(&self) -> Role;

    /// Bind local tracks for sending. No-op once the local description exists.
    async fn attach_local_media(&self, tracks: Vec<Self::Track>) -> Result<()>;

    /// Create and set the local description, which starts ICE gathering
    ///
    /// An offer requires that no remote description is set; an answer
    /// requires one. The returned description is pending: it may lack
    /// candidates until gathering completes.
    async fn create_local_description(&self, kind: SdpKind) -> Result<SessionDescription>;

    fn gathering_state(&self) -> IceGatheringState;

    /// Suspend until gathering is complete. Aborted by `close()`.
    async fn await_gathering_complete(&self) -> Result<()>;

    /// Current local description, including the candidates gathered so far
    async fn local_description(&self) -> Option<SessionDescription>;

    /// Set-once remote description
    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<()>;

    fn peer_state(&self) -> &PeerStateFeed;

    /// Latest peer state only; intermediate states may be skipped
    fn state_watch(&self) -> watch::Receiver<PeerState> {
        self.peer_state().watch()
    }

    /// Take the receiver of raw inbound control channel messages (once)
    fn take_control_receiver(&self) -> Option<mpsc::UnboundedReceiver<Bytes>>;

    /// Send on the control channel; dropped silently unless the channel is open
    ///
    /// Returns whether the message was handed to the channel.
    async fn send_control_message(&self, msg: &ControlMessage) -> bool;

    /// Release tracks, close channel and connection. Idempotent.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// Final local description, safe to hand to the peer
    ///
    /// Refuses to export while gathering is incomplete: the peer would be
    /// missing candidates needed to reach us.
    async fn export_local_description(&self) -> Result<SessionDescription> {
        let gathering = self.gathering_state();
        if gathering != IceGatheringState::Complete {
            return Err(AppError::ProtocolViolation(format!(
                "Local description is not final (ICE gathering {})",
                gathering
            )));
        }
        self.local_description().await.ok_or_else(|| {
            AppError::ProtocolViolation("No local description has been created".to_string())
        })
    }

    /// Connection state changes, starting with the current state
    ///
    /// Every transition is yielded. Ends after a terminal state. A new call
    /// starts a new stream from the state current at that time.
    fn observe_connection_state(&self) -> BoxStream<'static, PeerState> {
        let (mut last, mut rx) = self.peer_state().subscribe();
        Box::pin(async_stream::stream! {
            yield last;
            while !last.is_terminal() {
                match rx.recv().await {
                    Ok(state) if state != last => {
                        last = state;
                        yield state;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!("Missed {} peer state changes", n),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
