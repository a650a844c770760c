//! Session controller
//!
//! Composes one transport, one exchange codec and the negotiation state
//! machine into the initiator and responder flows:
//!
//! ```text
//! Initiator                                   Responder
//! create_offer() -> payload X  ---scan--->    accept_offer(X) -> payload Y
//! accept_answer(Y)             <--scan----
//!          \__________ both observe Connected __________/
//! ```
//!
//! Negotiation errors are returned from the call that caused them. Once a
//! step has started, its failure also moves the session to `Failed`; the
//! session must then be closed and a new one created. Transport failures
//! arrive asynchronously through the state watch and the event bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::control::{CameraDevice, ControlHandler, ControlMessage, ZoomRange};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::exchange::{CodecKind, ExchangeCodec, OutOfBandPayload};
use crate::negotiation::{ConnectionState, NegotiationState, Negotiator, Role};
use crate::utils::LogThrottler;
use crate::wake_lock::{WakeLock, WakeLockGuard};
use crate::webrtc::{
    PeerState, PeerTransport, SdpKind, SessionDescription, WebRtcConfig, WebRtcTransport,
};

/// Per-session settings
#[derive(Clone)]
pub struct SessionOptions {
    pub codec: Arc<dyn ExchangeCodec>,
    pub zoom_range: ZoomRange,
    /// Deadline for ICE gathering; `None` waits indefinitely
    pub gathering_timeout: Option<Duration>,
    pub diagnostic_throttle: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            codec: CodecKind::default().codec(),
            zoom_range: ZoomRange::default(),
            gathering_timeout: WebRtcConfig::default().gathering_timeout(),
            diagnostic_throttle: Duration::from_secs(5),
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            codec: config.exchange.codec.codec(),
            zoom_range: config.control.zoom_range()?,
            gathering_timeout: config.webrtc.gathering_timeout(),
            diagnostic_throttle: Duration::from_secs(config.control.diagnostic_throttle_secs),
        })
    }
}

/// State shared with the background tasks
struct Shared {
    session_id: String,
    negotiator: Mutex<Negotiator>,
    state_tx: watch::Sender<ConnectionState>,
    events: Arc<EventBus>,
    wake_lock: Mutex<Option<WakeLockGuard>>,
}

impl Shared {
    /// Run a negotiator step and publish the resulting state
    fn step<R>(&self, f: impl FnOnce(&mut Negotiator) -> Result<R>) -> Result<R> {
        let mut negotiator = self.negotiator.lock();
        let result = f(&mut negotiator);
        self.sync(&negotiator);
        result
    }

    fn fail(&self, reason: impl Into<String>) {
        let mut negotiator = self.negotiator.lock();
        negotiator.fail(reason);
        self.sync(&negotiator);
    }

    /// Fail the session with `error` and hand it back to the caller
    fn fail_with(&self, error: AppError) -> AppError {
        self.fail(error.to_string());
        error
    }

    fn on_peer_state(&self, peer: PeerState) {
        let mut negotiator = self.negotiator.lock();
        if negotiator.on_peer_state(peer).is_some() {
            self.sync(&negotiator);
        }
    }

    /// Mirror the negotiator into the public state; called with the lock held
    /// so observers never see states out of order
    fn sync(&self, negotiator: &Negotiator) {
        let state = negotiator.state().connection_state();
        if *self.state_tx.borrow() == state {
            return;
        }

        info!("Session {} state: {}", self.session_id, state);
        if negotiator.state().is_terminal() {
            self.release_wake_lock();
        }
        let reason = match state {
            ConnectionState::Failed => negotiator.failure().map(str::to_string),
            _ => None,
        };
        self.events
            .publish(SessionEvent::StateChanged { state, reason });
        self.state_tx.send_replace(state);
    }

    fn release_wake_lock(&self) {
        if let Some(guard) = self.wake_lock.lock().take() {
            guard.release();
        }
    }
}

/// One peer session in a fixed role
pub struct SessionController<T: PeerTransport> {
    session_id: String,
    role: Role,
    transport: Arc<T>,
    codec: Arc<dyn ExchangeCodec>,
    zoom_range: ZoomRange,
    gathering_timeout: Option<Duration>,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<ConnectionState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes wake lock acquisition
    wake_lock_gate: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl SessionController<WebRtcTransport> {
    /// Open a WebRTC session configured from `config`
    pub async fn open(
        role: Role,
        config: &AppConfig,
        device: Arc<dyn CameraDevice>,
    ) -> Result<Self> {
        let options = SessionOptions::from_config(config)?;
        let events = Arc::new(EventBus::new());
        let transport = WebRtcTransport::open(role, &config.webrtc, events.clone()).await?;
        Ok(Self::new(transport, device, events, options))
    }
}

impl<T: PeerTransport> SessionController<T> {
    /// Wrap an opened transport. Must be called inside a Tokio runtime.
    ///
    /// `events` must be the bus the transport publishes on.
    pub fn new(
        transport: T,
        device: Arc<dyn CameraDevice>,
        events: Arc<EventBus>,
        options: SessionOptions,
    ) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let role = transport.role();
        let transport = Arc::new(transport);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let shared = Arc::new(Shared {
            session_id: session_id.clone(),
            negotiator: Mutex::new(Negotiator::new(role)),
            state_tx,
            events: events.clone(),
            wake_lock: Mutex::new(None),
        });

        let handler = ControlHandler::new(device, options.zoom_range, events)
            .with_throttler(LogThrottler::new(options.diagnostic_throttle));

        let mut tasks = vec![Self::spawn_state_watcher(&transport, shared.clone())];
        match transport.take_control_receiver() {
            Some(rx) => tasks.push(Self::spawn_control_loop(&transport, rx, handler)),
            None => warn!("Session {}: control receiver already taken", session_id),
        }

        info!("Session {} created as {} ({} codec)", session_id, role, options.codec.name());

        Self {
            session_id,
            role,
            transport,
            codec: options.codec,
            zoom_range: options.zoom_range,
            gathering_timeout: options.gathering_timeout,
            shared,
            state_rx,
            tasks: Mutex::new(tasks),
            wake_lock_gate: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    fn spawn_state_watcher(transport: &Arc<T>, shared: Arc<Shared>) -> JoinHandle<()> {
        let (initial, mut rx) = transport.peer_state().subscribe();
        tokio::spawn(async move {
            shared.on_peer_state(initial);
            loop {
                match rx.recv().await {
                    Ok(peer) => shared.on_peer_state(peer),
                    Err(RecvError::Lagged(n)) => {
                        warn!("Session {} missed {} peer state changes", shared.session_id, n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_control_loop(
        transport: &Arc<T>,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<bytes::Bytes>,
        handler: ControlHandler,
    ) -> JoinHandle<()> {
        let transport = transport.clone();
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Some(reply) = handler.handle_raw(&data).await {
                    if !transport.send_control_message(&reply).await {
                        warn!("Could not send {} reply: channel not open", reply.kind());
                    }
                }
            }
            debug!("Control loop ended");
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Read-only view of the connection state
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.shared.negotiator.lock().state()
    }

    /// Why the session failed, once `Failed`
    pub fn failure_reason(&self) -> Option<String> {
        self.shared.negotiator.lock().failure().map(str::to_string)
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.shared.events.clone()
    }

    /// Bind local tracks; only effective before the local description exists
    pub async fn attach_local_media(&self, tracks: Vec<T::Track>) -> Result<()> {
        self.transport.attach_local_media(tracks).await
    }

    /// Initiator: create the offer, wait for gathering and encode it
    pub async fn create_offer(&self) -> Result<OutOfBandPayload> {
        self.shared.step(|n| n.begin_offer())?;

        let payload = match self.build_local(SdpKind::Offer).await {
            Ok(payload) => payload,
            Err(e) => return Err(self.shared.fail_with(e)),
        };
        self.shared.step(|n| n.offer_exported())?;

        info!("Session {}: offer ready ({} chars)", self.session_id, payload.len());
        Ok(payload)
    }

    /// Initiator: apply the scanned answer
    ///
    /// Connection is confirmed later by the transport, not by this call.
    pub async fn accept_answer(&self, payload: &str) -> Result<()> {
        self.shared.step(|n| n.answer_applied())?;

        let applied = async {
            let desc = self.decode(payload, SdpKind::Answer)?;
            self.transport.apply_remote_description(desc).await
        }
        .await;
        applied.map_err(|e| self.shared.fail_with(e))?;

        info!("Session {}: answer applied", self.session_id);
        Ok(())
    }

    /// Responder: apply the scanned offer and produce the answer payload
    pub async fn accept_offer(&self, payload: &str) -> Result<OutOfBandPayload> {
        self.shared.step(|n| n.begin_apply_offer())?;

        let answer = async {
            let desc = self.decode(payload, SdpKind::Offer)?;
            self.transport.apply_remote_description(desc).await?;
            self.build_local(SdpKind::Answer).await
        }
        .await;
        let answer = answer.map_err(|e| self.shared.fail_with(e))?;
        self.shared.step(|n| n.answer_exported())?;

        info!("Session {}: answer ready ({} chars)", self.session_id, answer.len());
        Ok(answer)
    }

    fn decode(&self, payload: &str, expected: SdpKind) -> Result<SessionDescription> {
        let desc = self.codec.decode(payload)?;
        if desc.kind != expected {
            return Err(AppError::InvalidDescription(format!(
                "Expected an {}, got an {}",
                expected, desc.kind
            )));
        }
        Ok(desc)
    }

    async fn build_local(&self, kind: SdpKind) -> Result<OutOfBandPayload> {
        self.transport.create_local_description(kind).await?;
        self.await_gathering().await?;
        let desc = self.transport.export_local_description().await?;
        debug!(
            "Session {}: {} gathered with {} candidates",
            self.session_id,
            kind,
            desc.candidate_count()
        );
        self.codec.encode(&desc)
    }

    async fn await_gathering(&self) -> Result<()> {
        match self.gathering_timeout {
            Some(limit) => tokio::time::timeout(limit, self.transport.await_gathering_complete())
                .await
                .map_err(|_| AppError::GatheringTimeout(limit.as_millis() as u64))?,
            None => self.transport.await_gathering_complete().await,
        }
    }

    /// Send a control message to the peer
    ///
    /// Invalid messages are rejected before sending. Returns `false` when the
    /// channel is not open and the message was dropped.
    pub async fn send_control(&self, msg: ControlMessage) -> Result<bool> {
        msg.validate(&self.zoom_range)?;
        let sent = self.transport.send_control_message(&msg).await;
        if !sent {
            debug!("Session {}: {} dropped, channel not open", self.session_id, msg.kind());
        }
        Ok(sent)
    }

    pub async fn set_zoom(&self, level: f64) -> Result<bool> {
        self.send_control(ControlMessage::Zoom { level }).await
    }

    pub async fn set_flash(&self, enabled: bool) -> Result<bool> {
        self.send_control(ControlMessage::Flash { enabled }).await
    }

    /// Ask the peer for a still; the photo arrives as a `PhotoReceived` event
    pub async fn request_capture(&self) -> Result<bool> {
        self.send_control(ControlMessage::CaptureRequest).await
    }

    /// Hold `lock` until the session ends
    ///
    /// Failure to acquire is logged and the session continues without it.
    /// A session holds at most one wake lock; further calls while it is held
    /// are no-ops.
    pub async fn acquire_wake_lock(&self, lock: Arc<dyn WakeLock>) -> bool {
        let _gate = self.wake_lock_gate.lock().await;
        if self.is_closed() || self.negotiation_state().is_terminal() {
            return false;
        }
        if self.holds_wake_lock() {
            debug!("Session {}: wake lock already held", self.session_id);
            return true;
        }
        match WakeLockGuard::acquire(lock).await {
            Ok(guard) => {
                *self.shared.wake_lock.lock() = Some(guard);
                // The session may have ended while acquiring
                if self.is_closed() || self.negotiation_state().is_terminal() {
                    self.shared.release_wake_lock();
                    return false;
                }
                true
            }
            Err(e) => {
                warn!("Session {}: continuing without wake lock: {}", self.session_id, e);
                false
            }
        }
    }

    pub fn holds_wake_lock(&self) -> bool {
        self.shared.wake_lock.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear down the session. Idempotent.
    ///
    /// A connected session ends `Disconnected`; one still negotiating ends
    /// `Failed`.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing session {}", self.session_id);

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let result = self.transport.close().await;

        let state = self.negotiation_state();
        if state == NegotiationState::Connected {
            self.shared.on_peer_state(PeerState::Closed);
        } else if !state.is_terminal() && state != NegotiationState::Idle {
            self.shared.fail("Session closed during negotiation");
        }
        self.shared.release_wake_lock();
        result
    }
}

impl<T: PeerTransport> Drop for SessionController<T> {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.release_wake_lock();

        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let transport = self.transport.clone();
                handle.spawn(async move {
                    let _ = transport.close().await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::message::decode_data_uri;
    use crate::control::{CapturedFrame, NullCamera, StillImageCamera};
    use crate::wake_lock::tests::CountingWakeLock;
    use crate::webrtc::{LoopbackNetwork, LoopbackTrack, LoopbackTransport};
    use tokio::sync::broadcast;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9];

    type Session = Arc<SessionController<LoopbackTransport>>;

    fn session(net: &LoopbackNetwork, role: Role, device: Arc<dyn CameraDevice>) -> Session {
        session_with(net, role, device, SessionOptions::default())
    }

    fn session_with(
        net: &LoopbackNetwork,
        role: Role,
        device: Arc<dyn CameraDevice>,
        options: SessionOptions,
    ) -> Session {
        let events = Arc::new(EventBus::new());
        let transport = net.open(role, events.clone());
        Arc::new(SessionController::new(transport, device, events, options))
    }

    fn camera() -> Arc<dyn CameraDevice> {
        Arc::new(StillImageCamera::new(CapturedFrame::new("image/jpeg", JPEG.to_vec())))
    }

    async fn wait_state(session: &Session, target: ConnectionState) {
        let mut rx = session.state_watch();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == target))
            .await
            .expect("state not reached in time")
            .unwrap();
    }

    async fn connected_pair(net: &LoopbackNetwork) -> (Session, Session) {
        let host = session(net, Role::Initiator, camera());
        let client = session(net, Role::Responder, Arc::new(NullCamera));

        let offer = host.create_offer().await.unwrap();
        let answer = client.accept_offer(offer.as_str()).await.unwrap();
        host.accept_answer(answer.as_str()).await.unwrap();

        wait_state(&host, ConnectionState::Connected).await;
        wait_state(&client, ConnectionState::Connected).await;
        (host, client)
    }

    async fn next_photo(rx: &mut broadcast::Receiver<SessionEvent>) -> Option<String> {
        loop {
            match rx.recv().await {
                Ok(SessionEvent::PhotoReceived { image_data, .. }) => return Some(image_data),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    #[tokio::test]
    async fn test_handshake_connects_both_sides() {
        let net = LoopbackNetwork::new();
        let host = session(&net, Role::Initiator, camera());
        let client = session(&net, Role::Responder, Arc::new(NullCamera));
        let mut host_events = host.events().subscribe();

        host.attach_local_media(vec![LoopbackTrack::video("camera")])
            .await
            .unwrap();
        assert_eq!(host.connection_state(), ConnectionState::Idle);

        let offer = host.create_offer().await.unwrap();
        assert_eq!(host.connection_state(), ConnectionState::Negotiating);
        let answer = client.accept_offer(offer.as_str()).await.unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Negotiating);
        host.accept_answer(answer.as_str()).await.unwrap();

        wait_state(&host, ConnectionState::Connected).await;
        wait_state(&client, ConnectionState::Connected).await;

        let mut states = Vec::new();
        while let Ok(event) = host_events.try_recv() {
            if let SessionEvent::StateChanged { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![ConnectionState::Negotiating, ConnectionState::Connected]
        );
    }

    #[tokio::test]
    async fn test_remote_track_reaches_client() {
        let net = LoopbackNetwork::new();
        let host = session(&net, Role::Initiator, camera());
        let client = session(&net, Role::Responder, Arc::new(NullCamera));
        let mut client_events = client.events().subscribe();

        host.attach_local_media(vec![
            LoopbackTrack::video("camera"),
            LoopbackTrack::audio("mic"),
        ])
        .await
        .unwrap();
        let offer = host.create_offer().await.unwrap();
        let answer = client.accept_offer(offer.as_str()).await.unwrap();
        host.accept_answer(answer.as_str()).await.unwrap();
        wait_state(&client, ConnectionState::Connected).await;

        let mut tracks = Vec::new();
        while let Ok(event) = client_events.try_recv() {
            if let SessionEvent::RemoteTrack { kind, id } = event {
                tracks.push((kind, id));
            }
        }
        assert_eq!(
            tracks,
            vec![
                ("video".to_string(), "camera".to_string()),
                ("audio".to_string(), "mic".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_capture_yields_exactly_one_photo() {
        let net = LoopbackNetwork::new();
        let (_host, client) = connected_pair(&net).await;
        let mut rx = client.events().subscribe();

        assert!(client.request_capture().await.unwrap());

        let image = tokio::time::timeout(Duration::from_secs(2), next_photo(&mut rx))
            .await
            .unwrap()
            .unwrap();
        let (mime, data) = decode_data_uri(&image).unwrap();
        assert_eq!(mime, "image/jpeg");
        assert_eq!(data, JPEG);

        let second = tokio::time::timeout(Duration::from_millis(200), next_photo(&mut rx)).await;
        assert!(second.is_err(), "a second photo arrived");
    }

    #[tokio::test]
    async fn test_zoom_and_flash_reach_host() {
        let net = LoopbackNetwork::new();
        let (host, client) = connected_pair(&net).await;
        let mut rx = host.events().subscribe();

        assert!(client.set_zoom(2.5).await.unwrap());
        assert!(client.set_flash(true).await.unwrap());

        let mut received = Vec::new();
        while received.len() < 2 {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let SessionEvent::ControlReceived { message } = event {
                received.push(message);
            }
        }
        assert_eq!(
            received,
            vec![
                ControlMessage::Zoom { level: 2.5 },
                ControlMessage::Flash { enabled: true }
            ]
        );
    }

    #[tokio::test]
    async fn test_out_of_range_zoom_is_not_sent() {
        let net = LoopbackNetwork::new();
        let (_host, client) = connected_pair(&net).await;
        for level in [0.5, 4.01, f64::NAN] {
            assert!(matches!(
                client.set_zoom(level).await,
                Err(AppError::InvalidControl(_))
            ));
        }
        assert_eq!(client.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_send_before_connected_is_dropped() {
        let net = LoopbackNetwork::new();
        let client = session(&net, Role::Responder, Arc::new(NullCamera));
        assert!(!client.request_capture().await.unwrap());
    }

    #[tokio::test]
    async fn test_second_answer_is_protocol_violation() {
        let net = LoopbackNetwork::new();
        let host = session(&net, Role::Initiator, camera());
        let client = session(&net, Role::Responder, Arc::new(NullCamera));

        let offer = host.create_offer().await.unwrap();
        let answer = client.accept_offer(offer.as_str()).await.unwrap();
        host.accept_answer(answer.as_str()).await.unwrap();
        wait_state(&host, ConnectionState::Connected).await;

        assert!(matches!(
            host.accept_answer(answer.as_str()).await,
            Err(AppError::ProtocolViolation(_))
        ));
        assert!(matches!(
            client.accept_offer(offer.as_str()).await,
            Err(AppError::ProtocolViolation(_))
        ));
        assert!(matches!(
            host.create_offer().await,
            Err(AppError::ProtocolViolation(_))
        ));
        assert_eq!(host.connection_state(), ConnectionState::Connected);
        assert_eq!(client.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_wrong_role_is_rejected_without_failing() {
        let net = LoopbackNetwork::new();
        let client = session(&net, Role::Responder, Arc::new(NullCamera));
        assert!(matches!(
            client.create_offer().await,
            Err(AppError::ProtocolViolation(_))
        ));
        assert!(matches!(
            client.accept_answer("{}").await,
            Err(AppError::ProtocolViolation(_))
        ));
        assert_eq!(client.connection_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_answer_before_offer_is_rejected() {
        let net = LoopbackNetwork::new();
        let host = session(&net, Role::Initiator, camera());
        assert!(matches!(
            host.accept_answer("{}").await,
            Err(AppError::ProtocolViolation(_))
        ));
        assert_eq!(host.connection_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_garbage_scan_fails_session() {
        let net = LoopbackNetwork::new();
        let client = session(&net, Role::Responder, Arc::new(NullCamera));
        let mut rx = client.events().subscribe();

        let err = client
            .accept_offer("https://example.com/menu")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::MalformedPayload(_)));
        assert_eq!(client.connection_state(), ConnectionState::Failed);
        assert!(client.failure_reason().unwrap().contains("Malformed"));

        // Negotiating, then Failed with a reason
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::StateChanged { state, reason } = event {
                last = Some((state, reason));
            }
        }
        let (state, reason) = last.unwrap();
        assert_eq!(state, ConnectionState::Failed);
        assert!(reason.is_some());

        // No partial repair
        assert!(matches!(
            client.accept_offer("{}").await,
            Err(AppError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_offer_given_to_initiator_is_invalid() {
        let net = LoopbackNetwork::new();
        let host = session(&net, Role::Initiator, camera());
        let offer = host.create_offer().await.unwrap();

        let err = host.accept_answer(offer.as_str()).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidDescription(_)));
        assert_eq!(host.connection_state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_gathering_timeout_fails_session() {
        let net = LoopbackNetwork::with_gather_delay(None);
        let options = SessionOptions {
            gathering_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let host = session_with(&net, Role::Initiator, camera(), options);

        let err = host.create_offer().await.unwrap_err();
        assert!(matches!(err, AppError::GatheringTimeout(50)));
        assert_eq!(host.connection_state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_text_codec_handshake() {
        let net = LoopbackNetwork::new();
        let options = SessionOptions {
            codec: CodecKind::Text.codec(),
            ..Default::default()
        };
        let host = session_with(&net, Role::Initiator, camera(), options.clone());
        let client = session_with(&net, Role::Responder, Arc::new(NullCamera), options);

        let offer = host.create_offer().await.unwrap();
        assert!(offer.as_str().starts_with("camlink:"));
        let answer = client.accept_offer(offer.as_str()).await.unwrap();
        host.accept_answer(answer.as_str()).await.unwrap();
        wait_state(&host, ConnectionState::Connected).await;
        wait_state(&client, ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn test_network_loss_disconnects_and_releases_wake_lock() {
        let net = LoopbackNetwork::new();
        let (host, client) = connected_pair(&net).await;
        let lock = Arc::new(CountingWakeLock::default());
        assert!(client.acquire_wake_lock(lock.clone()).await);
        assert!(lock.held());

        host.transport().sever();

        wait_state(&host, ConnectionState::Disconnected).await;
        wait_state(&client, ConnectionState::Disconnected).await;
        assert!(!lock.held());
        assert!(!client.holds_wake_lock());
    }

    #[tokio::test]
    async fn test_link_lost_right_after_connect_is_reported() {
        let net = LoopbackNetwork::new();
        let host = session(&net, Role::Initiator, camera());
        let client = session(&net, Role::Responder, Arc::new(NullCamera));
        let mut host_events = host.events().subscribe();

        let offer = host.create_offer().await.unwrap();
        let answer = client.accept_offer(offer.as_str()).await.unwrap();
        host.accept_answer(answer.as_str()).await.unwrap();
        // Before the state watchers get to run
        host.transport().sever();

        wait_state(&host, ConnectionState::Disconnected).await;
        wait_state(&client, ConnectionState::Disconnected).await;

        let mut states = Vec::new();
        while let Ok(event) = host_events.try_recv() {
            if let SessionEvent::StateChanged { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::Negotiating,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_webrtc_pair_serves_capture() {
        let config = AppConfig {
            webrtc: WebRtcConfig::host_only(),
            ..Default::default()
        };
        let host = SessionController::open(Role::Initiator, &config, camera())
            .await
            .unwrap();
        let client = SessionController::open(Role::Responder, &config, Arc::new(NullCamera))
            .await
            .unwrap();
        let mut client_events = client.events().subscribe();

        let offer = host.create_offer().await.unwrap();
        let answer = client.accept_offer(offer.as_str()).await.unwrap();
        host.accept_answer(answer.as_str()).await.unwrap();

        for session in [&host, &client] {
            let mut rx = session.state_watch();
            tokio::time::timeout(
                Duration::from_secs(10),
                rx.wait_for(|s| *s == ConnectionState::Connected),
            )
            .await
            .expect("webrtc pair did not connect")
            .unwrap();
        }

        // The responder's channel end arrives through on_data_channel
        tokio::time::timeout(Duration::from_secs(10), async {
            while !client.request_capture().await.unwrap() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("control channel did not open");

        let photo = tokio::time::timeout(Duration::from_secs(10), next_photo(&mut client_events))
            .await
            .expect("no photo received")
            .unwrap();
        let (mime, bytes) = decode_data_uri(&photo).unwrap();
        assert_eq!(mime, "image/jpeg");
        assert_eq!(bytes, JPEG);

        for session in [&host, &client] {
            session.close().await.unwrap();
            session.close().await.unwrap();
            assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        }
    }

    #[tokio::test]
    async fn test_wake_lock_released_on_negotiation_error() {
        let net = LoopbackNetwork::new();
        let client = session(&net, Role::Responder, Arc::new(NullCamera));
        let lock = Arc::new(CountingWakeLock::default());
        assert!(client.acquire_wake_lock(lock.clone()).await);

        assert!(client.accept_offer("not a payload").await.is_err());
        assert!(!lock.held());

        // Terminal sessions do not take the lock again
        assert!(!client.acquire_wake_lock(lock.clone()).await);
        assert!(!lock.held());
    }

    #[tokio::test]
    async fn test_second_wake_lock_request_keeps_the_first() {
        let net = LoopbackNetwork::new();
        let (_host, client) = connected_pair(&net).await;
        let lock = Arc::new(CountingWakeLock::default());

        assert!(client.acquire_wake_lock(lock.clone()).await);
        assert!(client.acquire_wake_lock(lock.clone()).await);
        assert_eq!(lock.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(lock.released.load(Ordering::SeqCst), 0);
        assert!(lock.held());

        client.close().await.unwrap();
        assert_eq!(lock.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let net = LoopbackNetwork::new();
        let (host, client) = connected_pair(&net).await;
        let lock = Arc::new(CountingWakeLock::default());
        assert!(client.acquire_wake_lock(lock.clone()).await);

        client.close().await.unwrap();
        client.close().await.unwrap();

        assert!(client.is_closed());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert_eq!(
            lock.released.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        wait_state(&host, ConnectionState::Disconnected).await;
        assert!(!host.request_capture().await.unwrap());
    }

    #[tokio::test]
    async fn test_close_aborts_pending_offer() {
        let net = LoopbackNetwork::with_gather_delay(None);
        let options = SessionOptions {
            gathering_timeout: None,
            ..Default::default()
        };
        let host = session_with(&net, Role::Initiator, camera(), options);

        let pending = {
            let host = host.clone();
            tokio::spawn(async move { host.create_offer().await })
        };
        wait_state(&host, ConnectionState::Negotiating).await;

        host.close().await.unwrap();
        assert!(pending.await.unwrap().is_err());
        assert_eq!(host.connection_state(), ConnectionState::Failed);
    }
}
