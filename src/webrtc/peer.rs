//! WebRTC peer connection transport

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::config::WebRtcConfig;
use super::mdns::{mdns_host_name, mdns_mode};
use super::signaling::{IceGatheringState, PeerState, SdpKind, SessionDescription};
use super::transport::{PeerStateFeed, PeerTransport};
use crate::control::ControlMessage;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::negotiation::Role;

/// Local media track accepted by `WebRtcTransport`
pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// Transport session over a `webrtc` peer connection
pub struct WebRtcTransport {
    pub session_id: String,
    role: Role,
    pc: Arc<RTCPeerConnection>,
    /// Control channel (created locally by the initiator, received by the responder)
    data_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    /// Senders of attached local tracks
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
    state: Arc<PeerStateFeed>,
    gathering: Arc<watch::Sender<IceGatheringState>>,
    inbound_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    local_set: AtomicBool,
    remote_set: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl WebRtcTransport {
    /// Build the peer connection; the initiator also creates the control channel
    pub async fn open(role: Role, config: &WebRtcConfig, events: Arc<EventBus>) -> Result<Self> {
        let session_id = uuid::Uuid::new_v4().to_string();

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::Transport(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::Transport(format!("Failed to register interceptors: {}", e))
        })?;

        let mut setting_engine = SettingEngine::default();
        let mode = mdns_mode();
        setting_engine.set_ice_multicast_dns_mode(mode);
        if mode == MulticastDnsMode::QueryAndGather {
            setting_engine.set_multicast_dns_host_name(mdns_host_name(&session_id));
        }

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers = vec![];
        for stun_url in &config.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }
        for turn in &config.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }
        if !config.has_ice_servers() {
            warn!("No STUN/TURN servers configured, only host candidates will be gathered");
        }

        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| AppError::Transport(format!("Failed to create peer connection: {}", e)))?;

        let (gathering_tx, _) = watch::channel(IceGatheringState::New);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let transport = Self {
            session_id,
            role,
            pc: Arc::new(pc),
            data_channel: Arc::new(RwLock::new(None)),
            senders: Mutex::new(vec![]),
            state: Arc::new(PeerStateFeed::new()),
            gathering: Arc::new(gathering_tx),
            inbound_rx: parking_lot::Mutex::new(Some(inbound_rx)),
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        };

        transport.setup_event_handlers(config, inbound_tx.clone(), events.clone());

        // The channel must exist before the offer, or the offer will not
        // carry an application section for it.
        if role == Role::Initiator {
            let dc = transport
                .pc
                .create_data_channel(
                    &config.data_channel_label,
                    Some(RTCDataChannelInit {
                        ordered: Some(true),
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|e| AppError::Transport(format!("Failed to create data channel: {}", e)))?;
            wire_data_channel(&dc, inbound_tx, events);
            *transport.data_channel.write().await = Some(dc);
            info!(
                "Data channel '{}' created for session {}",
                config.data_channel_label, transport.session_id
            );
        }

        info!(
            "WebRTC transport {} opened as {} (mDNS {:?})",
            transport.session_id, role, mode
        );
        Ok(transport)
    }

    fn setup_event_handlers(
        &self,
        config: &WebRtcConfig,
        inbound_tx: mpsc::UnboundedSender<Bytes>,
        events: Arc<EventBus>,
    ) {
        let state = self.state.clone();
        let session_id = self.session_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = state.clone();
                let session_id = session_id.clone();
                Box::pin(async move {
                    let new_state = match s {
                        RTCPeerConnectionState::New => PeerState::New,
                        RTCPeerConnectionState::Connecting => PeerState::Connecting,
                        RTCPeerConnectionState::Connected => PeerState::Connected,
                        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
                        RTCPeerConnectionState::Failed => PeerState::Failed,
                        RTCPeerConnectionState::Closed => PeerState::Closed,
                        _ => return,
                    };
                    info!("Transport {} peer state: {}", session_id, new_state);
                    state.set(new_state);
                })
            }));

        let gathering = self.gathering.clone();
        let session_id = self.session_id.clone();
        self.pc
            .on_ice_gathering_state_change(Box::new(move |s: RTCIceGathererState| {
                let next = match s {
                    RTCIceGathererState::New => Some(IceGatheringState::New),
                    RTCIceGathererState::Gathering => Some(IceGatheringState::Gathering),
                    RTCIceGathererState::Complete => Some(IceGatheringState::Complete),
                    _ => None,
                };
                if let Some(next) = next {
                    debug!("Transport {} ICE gathering: {}", session_id, next);
                    gathering.send_replace(next);
                }
                Box::pin(async {})
            }));

        self.pc.on_ice_candidate(Box::new(|candidate: Option<RTCIceCandidate>| {
            if let Some(c) = candidate {
                debug!("ICE candidate gathered: {} {}", c.protocol, c.address);
            }
            Box::pin(async {})
        }));

        let track_events = events.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = track.kind().to_string();
                let id = track.id();
                info!("Remote {} track: {}", kind, id);
                track_events.publish(SessionEvent::RemoteTrack { kind, id });
                Box::pin(async {})
            },
        ));

        let data_channel = self.data_channel.clone();
        let label = config.data_channel_label.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let data_channel = data_channel.clone();
                let inbound_tx = inbound_tx.clone();
                let events = events.clone();
                let label = label.clone();
                Box::pin(async move {
                    if dc.label() != label {
                        info!("Ignoring unexpected data channel '{}'", dc.label());
                        return;
                    }
                    info!("Data channel received: {}", dc.label());
                    wire_data_channel(&dc, inbound_tx, events);
                    *data_channel.write().await = Some(dc);
                })
            }));
    }
}

/// Forward channel messages to the inbound queue and announce the open
fn wire_data_channel(
    dc: &Arc<RTCDataChannel>,
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    events: Arc<EventBus>,
) {
    let label = dc.label().to_string();
    dc.on_open(Box::new(move || {
        info!("Data channel '{}' open", label);
        events.publish(SessionEvent::ChannelOpen { label });
        Box::pin(async {})
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        debug!("Control channel message: {} bytes", msg.data.len());
        if inbound_tx.send(msg.data).is_err() {
            debug!("Control receiver dropped, discarding message");
        }
        Box::pin(async {})
    }));

    let label = dc.label().to_string();
    dc.on_close(Box::new(move || {
        debug!("Data channel '{}' closed", label);
        Box::pin(async {})
    }));
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    type Track = LocalTrack;

    fn role(&self) -> Role {
        self.role
    }

    async fn attach_local_media(&self, tracks: Vec<LocalTrack>) -> Result<()> {
        if self.local_set.load(Ordering::SeqCst) {
            warn!(
                "Ignoring {} local track(s): local description already created",
                tracks.len()
            );
            return Ok(());
        }

        let mut senders = self.senders.lock().await;
        for track in tracks {
            let sender = self
                .pc
                .add_track(track.clone())
                .await
                .map_err(|e| AppError::Transport(format!("Failed to add track: {}", e)))?;
            info!("Local {} track '{}' attached", track.kind(), track.id());
            senders.push(sender);
        }
        Ok(())
    }

    async fn create_local_description(&self, kind: SdpKind) -> Result<SessionDescription> {
        if self.is_closed() {
            return Err(AppError::Transport("Transport is closed".to_string()));
        }
        if self.local_set.load(Ordering::SeqCst) {
            return Err(AppError::ProtocolViolation(
                "Local description already created".to_string(),
            ));
        }

        let remote_set = self.remote_set.load(Ordering::SeqCst);
        let desc = match kind {
            SdpKind::Offer => {
                if remote_set {
                    return Err(AppError::ProtocolViolation(
                        "Cannot create an offer after a remote description".to_string(),
                    ));
                }
                self.pc.create_offer(None).await
            }
            SdpKind::Answer => {
                if !remote_set {
                    return Err(AppError::ProtocolViolation(
                        "Cannot create an answer without a remote offer".to_string(),
                    ));
                }
                self.pc.create_answer(None).await
            }
        }
        .map_err(|e| AppError::Transport(format!("Failed to create {}: {}", kind, e)))?;

        self.gathering.send_replace(IceGatheringState::Gathering);
        self.pc
            .set_local_description(desc.clone())
            .await
            .map_err(|e| AppError::Transport(format!("Failed to set local description: {}", e)))?;
        self.local_set.store(true, Ordering::SeqCst);

        debug!("Local {} set, ICE gathering started", kind);
        SessionDescription::try_from(desc)
    }

    fn gathering_state(&self) -> IceGatheringState {
        *self.gathering.borrow()
    }

    async fn await_gathering_complete(&self) -> Result<()> {
        let mut rx = self.gathering.subscribe();
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
        let desc = self.pc.local_description().await?;
        SessionDescription::try_from(desc).ok()
    }

    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if self.is_closed() {
            return Err(AppError::Transport("Transport is closed".to_string()));
        }
        if self.remote_set.load(Ordering::SeqCst) {
            return Err(AppError::ProtocolViolation(
                "Remote description is already set".to_string(),
            ));
        }

        let rtc = desc.to_rtc()?;
        if self
            .remote_set
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::ProtocolViolation(
                "Remote description is already set".to_string(),
            ));
        }

        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(|e| {
                AppError::InvalidDescription(format!("Remote {} rejected: {}", desc.kind, e))
            })?;

        info!(
            "Remote {} applied ({} candidates)",
            desc.kind,
            desc.candidate_count()
        );
        Ok(())
    }

    fn peer_state(&self) -> &PeerStateFeed {
        &self.state
    }

    fn take_control_receiver(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.inbound_rx.lock().take()
    }

    async fn send_control_message(&self, msg: &ControlMessage) -> bool {
        let dc = self.data_channel.read().await.clone();
        let Some(channel) = dc else {
            debug!("No control channel yet, dropping {} message", msg.kind());
            return false;
        };
        if channel.ready_state() != RTCDataChannelState::Open {
            debug!(
                "Control channel {}, dropping {} message",
                channel.ready_state(),
                msg.kind()
            );
            return false;
        }

        let text = match msg.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize {} message: {}", msg.kind(), e);
                return false;
            }
        };
        match channel.send_text(text).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Failed to send {} message: {}", msg.kind(), e);
                false
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();

        for sender in self.senders.lock().await.drain(..) {
            if let Err(e) = sender.stop().await {
                debug!("Failed to stop sender: {}", e);
            }
        }

        if let Some(dc) = self.data_channel.write().await.take() {
            if let Err(e) = dc.close().await {
                debug!("Failed to close data channel: {}", e);
            }
        }

        self.pc
            .close()
            .await
            .map_err(|e| AppError::Transport(format!("Failed to close peer connection: {}", e)))?;
        self.state.set(PeerState::Closed);

        info!("WebRTC transport {} closed", self.session_id);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
