//! In-process transport
//!
//! `LoopbackNetwork` hands out transports that reach each other only through
//! the descriptions they exchange, exactly like real peers: a transport
//! learns its peer's endpoint id from the applied remote description, and
//! the link comes up once both sides have applied each other's description.
//! Candidates appear in the local description only after the simulated
//! gathering delay, so exporting early yields a description the peer cannot
//! connect with.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::config::DEFAULT_DATA_CHANNEL_LABEL;
use super::signaling::{IceGatheringState, PeerState, SdpKind, SessionDescription};
use super::transport::{PeerStateFeed, PeerTransport};
use crate::control::ControlMessage;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::negotiation::Role;

const ENDPOINT_ATTR: &str = "a=x-loopback-endpoint:";
const TRACK_ATTR: &str = "a=x-loopback-track:";
const CANDIDATE_LINE: &str = "a=candidate:1 1 udp 2130706431 127.0.0.1 9 typ host";

/// Media track of a loopback transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackTrack {
    /// "audio" or "video"
    pub kind: String,
    pub id: String,
}

impl LoopbackTrack {
    pub fn video(id: impl Into<String>) -> Self {
        Self {
            kind: "video".to_string(),
            id: id.into(),
        }
    }

    pub fn audio(id: impl Into<String>) -> Self {
        Self {
            kind: "audio".to_string(),
            id: id.into(),
        }
    }
}

struct Endpoint {
    id: String,
    label: String,
    state: PeerStateFeed,
    gathering: watch::Sender<IceGatheringState>,
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    channel_open: AtomicBool,
    events: Arc<EventBus>,
    link: Mutex<LinkState>,
}

#[derive(Default)]
struct LinkState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    /// Peer endpoint id taken from the remote description
    peer: Option<String>,
    tracks: Vec<LoopbackTrack>,
}

impl Endpoint {
    fn set_state(&self, state: PeerState) {
        let previous = self.state.set(state);
        if previous != state {
            debug!("Loopback {} peer state: {} -> {}", self.id, previous, state);
        }
    }
}

/// Registry through which loopback transports find each other
#[derive(Clone)]
pub struct LoopbackNetwork {
    endpoints: Arc<Mutex<HashMap<String, Arc<Endpoint>>>>,
    gather_delay: Option<Duration>,
}

impl LoopbackNetwork {
    /// Network whose gathering completes after 20ms
    pub fn new() -> Self {
        Self::with_gather_delay(Some(Duration::from_millis(20)))
    }

    /// `None` means gathering never completes
    pub fn with_gather_delay(gather_delay: Option<Duration>) -> Self {
        Self {
            endpoints: Arc::new(Mutex::new(HashMap::new())),
            gather_delay,
        }
    }

    /// Open a transport on this network (`open(role)` of a transport session)
    pub fn open(&self, role: Role, events: Arc<EventBus>) -> LoopbackTransport {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let (gathering_tx, _) = watch::channel(IceGatheringState::New);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let endpoint = Arc::new(Endpoint {
            id: id.clone(),
            label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            state: PeerStateFeed::new(),
            gathering: gathering_tx,
            inbound_tx,
            channel_open: AtomicBool::new(false),
            events,
            link: Mutex::new(LinkState::default()),
        });
        self.endpoints.lock().insert(id.clone(), endpoint.clone());
        debug!("Loopback endpoint {} opened as {}", id, role);

        LoopbackTransport {
            role,
            endpoint,
            network: self.clone(),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    fn lookup(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.lock().get(id).cloned()
    }

    fn remove(&self, id: &str) {
        self.endpoints.lock().remove(id);
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.lock().len()
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport session connected through a `LoopbackNetwork`
pub struct LoopbackTransport {
    role: Role,
    endpoint: Arc<Endpoint>,
    network: LoopbackNetwork,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl LoopbackTransport {
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint.id
    }

    /// Simulate network loss: both ends drop to `Disconnected`
    pub fn sever(&self) {
        let peer = self.peer();
        for endpoint in std::iter::once(self.endpoint.clone()).chain(peer) {
            endpoint.channel_open.store(false, Ordering::SeqCst);
            if endpoint.state.get() == PeerState::Connected {
                endpoint.set_state(PeerState::Disconnected);
            }
        }
        info!("Loopback link of {} severed", self.endpoint.id);
    }

    fn peer(&self) -> Option<Arc<Endpoint>> {
        let peer_id = self.endpoint.link.lock().peer.clone()?;
        self.network.lookup(&peer_id)
    }

    fn describe(
        &self,
        kind: SdpKind,
        tracks: &[LoopbackTrack],
        with_candidate: bool,
    ) -> SessionDescription {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=camlink-loopback\r\nt=0 0\r\n{}{}\r\n",
            self.endpoint.id.len(),
            ENDPOINT_ATTR,
            self.endpoint.id
        );
        for track in tracks {
            sdp.push_str(&format!("{}{} {}\r\n", TRACK_ATTR, track.kind, track.id));
        }
        if with_candidate {
            sdp.push_str(CANDIDATE_LINE);
            sdp.push_str("\r\n");
        }
        SessionDescription::new(kind, sdp)
    }

    fn spawn_gathering(&self, kind: SdpKind) {
        let Some(delay) = self.network.gather_delay else {
            debug!("Loopback {} gathering will never complete", self.endpoint.id);
            return;
        };
        let endpoint = self.endpoint.clone();
        let cancel = self.cancel.clone();
        let tracks = self.endpoint.link.lock().tracks.clone();
        let full = self.describe(kind, &tracks, true);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    endpoint.link.lock().local = Some(full);
                    endpoint.gathering.send_replace(IceGatheringState::Complete);
                }
            }
        });
    }

    /// Bring the link up once both ends hold each other's description
    fn try_connect(&self) {
        let Some(peer) = self.peer() else {
            info!("Loopback peer of {} is unreachable", self.endpoint.id);
            self.endpoint.set_state(PeerState::Failed);
            return;
        };

        let (peer_points_back, peer_remote_has_candidates, peer_tracks) = {
            let link = peer.link.lock();
            (
                link.peer.as_deref() == Some(self.endpoint.id.as_str()),
                link.remote.as_ref().map(|d| d.candidate_count() > 0),
                link.tracks.clone(),
            )
        };
        let (remote_has_candidates, own_tracks) = {
            let link = self.endpoint.link.lock();
            (
                link.remote.as_ref().map(|d| d.candidate_count() > 0).unwrap_or(false),
                link.tracks.clone(),
            )
        };

        if !peer_points_back {
            self.endpoint.set_state(PeerState::Connecting);
            return;
        }

        // Either side missing candidates means no usable path
        if !remote_has_candidates || peer_remote_has_candidates != Some(true) {
            info!("Loopback link {} <-> {} has no candidate pair", self.endpoint.id, peer.id);
            self.endpoint.set_state(PeerState::Failed);
            peer.set_state(PeerState::Failed);
            return;
        }

        for (endpoint, remote_tracks) in [(&self.endpoint, &peer_tracks), (&peer, &own_tracks)] {
            endpoint.set_state(PeerState::Connecting);
            endpoint.set_state(PeerState::Connected);
            endpoint.channel_open.store(true, Ordering::SeqCst);
            endpoint.events.publish(SessionEvent::ChannelOpen {
                label: endpoint.label.clone(),
            });
            for track in remote_tracks {
                endpoint.events.publish(SessionEvent::RemoteTrack {
                    kind: track.kind.clone(),
                    id: track.id.clone(),
                });
            }
        }
        info!("Loopback link {} <-> {} connected", self.endpoint.id, peer.id);
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    type Track = LoopbackTrack;

    fn role(&self) -> Role {
        self.role
    }

    async fn attach_local_media(&self, tracks: Vec<LoopbackTrack>) -> Result<()> {
        let mut link = self.endpoint.link.lock();
        if link.local.is_some() {
            debug!("Ignoring local tracks: local description already created");
            return Ok(());
        }
        link.tracks.extend(tracks);
        Ok(())
    }

    async fn create_local_description(&self, kind: SdpKind) -> Result<SessionDescription> {
        if self.is_closed() {
            return Err(AppError::Transport("Transport is closed".to_string()));
        }
        let pending = {
            let mut link = self.endpoint.link.lock();
            if link.local.is_some() {
                return Err(AppError::ProtocolViolation(
                    "Local description already created".to_string(),
                ));
            }
            match (kind, link.remote.is_some()) {
                (SdpKind::Offer, true) => {
                    return Err(AppError::ProtocolViolation(
                        "Cannot create an offer after a remote description".to_string(),
                    ))
                }
                (SdpKind::Answer, false) => {
                    return Err(AppError::ProtocolViolation(
                        "Cannot create an answer without a remote offer".to_string(),
                    ))
                }
                _ => {}
            }
            let pending = self.describe(kind, &link.tracks, false);
            link.local = Some(pending.clone());
            pending
        };

        self.endpoint
            .gathering
            .send_replace(IceGatheringState::Gathering);
        self.spawn_gathering(kind);
        Ok(pending)
    }

    fn gathering_state(&self) -> IceGatheringState {
        *self.endpoint.gathering.borrow()
    }

    async fn await_gathering_complete(&self) -> Result<()> {
        let mut rx = self.endpoint.gathering.subscribe();
        if *rx.borrow() == IceGatheringState::New {
            return Err(AppError::ProtocolViolation(
                "ICE gathering has not started".to_string(),
            ));
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(AppError::Transport("Transport closed while gathering".to_string()))
            }
            res = rx.wait_for(|s| *s == IceGatheringState::Complete) => {
                res.map(|_| ()).map_err(|_| {
                    AppError::Transport("Gathering state channel closed".to_string())
                })
            }
        }
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.endpoint.link.lock().local.clone()
    }

    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if self.is_closed() {
            return Err(AppError::Transport("Transport is closed".to_string()));
        }
        {
            let mut link = self.endpoint.link.lock();
            if link.remote.is_some() {
                return Err(AppError::ProtocolViolation(
                    "Remote description is already set".to_string(),
                ));
            }

            let peer_id = desc
                .sdp
                .lines()
                .find_map(|line| line.strip_prefix(ENDPOINT_ATTR))
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .ok_or_else(|| {
                    AppError::InvalidDescription("Not a loopback description".to_string())
                })?;

            match (desc.kind, link.local.as_ref().map(|d| d.kind)) {
                (SdpKind::Offer, None) | (SdpKind::Answer, Some(SdpKind::Offer)) => {}
                (kind, local) => {
                    return Err(AppError::InvalidDescription(format!(
                        "Remote {} does not fit local {:?}",
                        kind, local
                    )))
                }
            }

            link.peer = Some(peer_id);
            link.remote = Some(desc);
        }

        self.try_connect();
        Ok(())
    }

    fn peer_state(&self) -> &PeerStateFeed {
        &self.endpoint.state
    }

    fn take_control_receiver(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.inbound_rx.lock().take()
    }

    async fn send_control_message(&self, msg: &ControlMessage) -> bool {
        if self.is_closed() || !self.endpoint.channel_open.load(Ordering::SeqCst) {
            debug!("Loopback channel not open, dropping {} message", msg.kind());
            return false;
        }
        let Some(peer) = self.peer() else {
            return false;
        };
        let Ok(text) = msg.to_json() else {
            return false;
        };
        peer.inbound_tx.send(Bytes::from(text)).is_ok()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();

        if let Some(peer) = self.peer() {
            peer.channel_open.store(false, Ordering::SeqCst);
            if peer.state.get() == PeerState::Connected {
                peer.set_state(PeerState::Disconnected);
            }
        }

        self.endpoint.channel_open.store(false, Ordering::SeqCst);
        self.endpoint.link.lock().tracks.clear();
        self.endpoint.set_state(PeerState::Closed);
        self.network.remove(&self.endpoint.id);
        debug!("Loopback endpoint {} closed", self.endpoint.id);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
