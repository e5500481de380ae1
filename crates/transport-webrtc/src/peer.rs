use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use call_session::TransportError;
use call_session::transport::{
    ConnectMode, ConnectionState, DataChannel, GatheringState, PeerTransport, TransportEvent,
    TransportEventSink,
};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::channel::WebRtcDataChannel;
use crate::config::WebRtcConfig;
use crate::signaling::{LocalSignalingChannel, Signaling, SignalingMessage};

fn to_setup_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn build_api(config: &WebRtcConfig) -> Result<API, TransportError> {
    let mut setting = SettingEngine::default();
    if config.has_ice_timeouts() {
        setting.set_ice_timeouts(
            config.disconnected_timeout,
            config.failed_timeout,
            config.keepalive_interval,
        );
    }

    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn map_connection_state(state: RTCIceConnectionState) -> Option<ConnectionState> {
    match state {
        RTCIceConnectionState::New => Some(ConnectionState::New),
        RTCIceConnectionState::Checking => Some(ConnectionState::Checking),
        RTCIceConnectionState::Connected => Some(ConnectionState::Connected),
        RTCIceConnectionState::Completed => Some(ConnectionState::Completed),
        RTCIceConnectionState::Failed => Some(ConnectionState::Failed),
        RTCIceConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCIceConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

fn map_gathering_state(state: RTCIceGathererState) -> Option<GatheringState> {
    match state {
        RTCIceGathererState::New => Some(GatheringState::New),
        RTCIceGathererState::Gathering => Some(GatheringState::Gathering),
        RTCIceGathererState::Complete => Some(GatheringState::Complete),
        _ => None,
    }
}

/// [`PeerTransport`] backed by a webrtc-rs peer connection. Offers, answers
/// and ICE candidates travel over a [`Signaling`] implementation.
///
/// Every peer connection gets an epoch; callbacks from a connection that was
/// replaced by [`PeerTransport::hard_reset`] are dropped.
pub struct WebRtcPeerTransport {
    inner: Arc<Inner>,
}

struct Inner {
    api: API,
    config: WebRtcConfig,
    signaling: Arc<dyn Signaling>,
    pc: RwLock<Option<Arc<RTCPeerConnection>>>,
    epoch: AtomicU64,
    sink: RwLock<Option<TransportEventSink>>,
    channels: Mutex<HashMap<String, Arc<WebRtcDataChannel>>>,
    early_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    local_video: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl WebRtcPeerTransport {
    pub async fn new(
        config: WebRtcConfig,
        signaling: Arc<dyn Signaling>,
    ) -> Result<Arc<Self>, TransportError> {
        let api = build_api(&config)?;
        let inner = Arc::new(Inner {
            api,
            config,
            signaling: Arc::clone(&signaling),
            pc: RwLock::new(None),
            epoch: AtomicU64::new(0),
            sink: RwLock::new(None),
            channels: Mutex::new(HashMap::new()),
            early_candidates: Mutex::new(Vec::new()),
            local_video: AtomicBool::new(true),
            pump: Mutex::new(None),
        });
        inner.install_peer_connection().await?;

        let pump = tokio::spawn(signaling_pump(Arc::downgrade(&inner), signaling));
        *inner.pump.lock() = Some(pump);
        Ok(Arc::new(Self { inner }))
    }

    /// Two transports wired together through in-process signaling.
    pub async fn local_pair(
        config: WebRtcConfig,
    ) -> Result<(Arc<Self>, Arc<Self>), TransportError> {
        let (left, right) = LocalSignalingChannel::create_pair();
        let first = Self::new(config.clone(), Arc::new(left)).await?;
        let second = Self::new(config, Arc::new(right)).await?;
        Ok((first, second))
    }

    pub fn local_video_enabled(&self) -> bool {
        self.inner.local_video.load(Ordering::SeqCst)
    }

    pub fn channel_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.inner.channels.lock().keys().cloned().collect();
        labels.sort();
        labels
    }
}

impl Inner {
    fn current_pc(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        self.pc.read().clone().ok_or(TransportError::NoSession)
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn emit(&self, epoch: u64, event: TransportEvent) {
        if !self.is_current(epoch) {
            trace!(target: "call::webrtc", epoch, event = ?event, "dropping event from retired peer connection");
            return;
        }
        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }

    async fn install_peer_connection(self: &Arc<Self>) -> Result<(), TransportError> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.config.ice_servers(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(to_setup_error)?,
        );
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.attach_handlers(&pc, epoch);
        self.early_candidates.lock().clear();
        *self.pc.write() = Some(pc);
        debug!(target: "call::webrtc", epoch, "peer connection ready");
        Ok(())
    }

    fn attach_handlers(self: &Arc<Self>, pc: &Arc<RTCPeerConnection>, epoch: u64) {
        let weak = Arc::downgrade(self);
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                info!(target: "call::webrtc", epoch, state = %state, "ice connection state changed");
                if let Some(state) = map_connection_state(state) {
                    inner.emit(epoch, TransportEvent::ConnectionState(state));
                }
            })
        }));

        let weak = Arc::downgrade(self);
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Some(state) = map_gathering_state(state) {
                    inner.emit(epoch, TransportEvent::GatheringState(state));
                }
            })
        }));

        let weak = Arc::downgrade(self);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let weak = weak.clone();
            Box::pin(async move {
                let (Some(candidate), Some(inner)) = (candidate, weak.upgrade()) else {
                    return;
                };
                if !inner.is_current(epoch) {
                    return;
                }
                let message = match SignalingMessage::from_ice_candidate(&candidate) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(target: "call::webrtc", error = %err, "unable to encode ice candidate");
                        return;
                    }
                };
                if let Err(err) = inner.signaling.send(message).await {
                    debug!(target: "call::webrtc", error = %err, "failed to send ice candidate");
                }
            })
        }));

        let weak = Arc::downgrade(self);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.is_current(epoch) {
                    return;
                }
                let ordered = dc.ordered();
                let channel = WebRtcDataChannel::wrap(dc, ordered, ordered);
                let label = channel.label().to_string();
                {
                    let mut channels = inner.channels.lock();
                    if channels.contains_key(&label) {
                        debug!(target: "call::webrtc", label = %label, "remote channel shadows a local label");
                        return;
                    }
                    channels.insert(label.clone(), Arc::clone(&channel));
                }
                info!(target: "call::webrtc", label = %label, ordered, "remote data channel");
                inner.emit(epoch, TransportEvent::ChannelAdded(channel));
            })
        }));
    }

    async fn handle_signal(&self, message: SignalingMessage) -> Result<(), TransportError> {
        let pc = self.current_pc()?;
        match &message {
            SignalingMessage::Offer { .. } => {
                let offer = message.to_session_description().map_err(to_setup_error)?;
                pc.set_remote_description(offer)
                    .await
                    .map_err(to_setup_error)?;
                self.flush_early_candidates(&pc).await;
                let answer = pc.create_answer(None).await.map_err(to_setup_error)?;
                pc.set_local_description(answer.clone())
                    .await
                    .map_err(to_setup_error)?;
                self.signaling
                    .send(SignalingMessage::from_answer(&answer))
                    .await
                    .map_err(|err| TransportError::NonFatal(err.to_string()))?;
                debug!(target: "call::webrtc", "answer sent");
            }
            SignalingMessage::Answer { .. } => {
                let answer = message.to_session_description().map_err(to_setup_error)?;
                pc.set_remote_description(answer)
                    .await
                    .map_err(to_setup_error)?;
                self.flush_early_candidates(&pc).await;
                debug!(target: "call::webrtc", "answer applied");
            }
            SignalingMessage::IceCandidate { .. } => {
                let Some(init) = message.to_candidate_init() else {
                    return Ok(());
                };
                if pc.remote_description().await.is_none() {
                    self.early_candidates.lock().push(init);
                    return Ok(());
                }
                pc.add_ice_candidate(init)
                    .await
                    .map_err(|err| TransportError::NonFatal(err.to_string()))?;
            }
        }
        Ok(())
    }

    async fn flush_early_candidates(&self, pc: &RTCPeerConnection) {
        let early = std::mem::take(&mut *self.early_candidates.lock());
        for init in early {
            if let Err(err) = pc.add_ice_candidate(init).await {
                debug!(target: "call::webrtc", error = %err, "dropping early ice candidate");
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

async fn signaling_pump(inner: Weak<Inner>, signaling: Arc<dyn Signaling>) {
    while let Some(message) = signaling.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let kind = message.kind();
        let epoch = inner.epoch.load(Ordering::SeqCst);
        trace!(target: "call::webrtc", kind, epoch, "signaling message");
        match inner.handle_signal(message).await {
            Ok(()) => {}
            Err(err) if err.is_non_fatal() => {
                debug!(target: "call::webrtc", kind, error = %err, "signaling hiccup");
            }
            Err(err) => {
                warn!(target: "call::webrtc", kind, error = %err, "signaling message rejected");
                if kind == "offer" {
                    inner.emit(epoch, TransportEvent::Error(err.to_string()));
                }
            }
        }
    }
    debug!(target: "call::webrtc", "signaling pump finished");
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    fn is_ready(&self) -> bool {
        self.inner.pc.read().is_some()
    }

    fn set_event_sink(&self, sink: TransportEventSink) {
        *self.inner.sink.write() = Some(sink);
    }

    async fn connect(&self, mode: ConnectMode) -> Result<(), TransportError> {
        let pc = self.inner.current_pc()?;
        let offer = pc.create_offer(None).await.map_err(to_setup_error)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(to_setup_error)?;

        match self
            .inner
            .signaling
            .send(SignalingMessage::from_offer(&offer))
            .await
        {
            Ok(()) => {
                info!(target: "call::webrtc", mode = ?mode, "offer sent");
                Ok(())
            }
            Err(err) => {
                let err = TransportError::NonFatal(err.to_string());
                if mode == ConnectMode::IgnoreNonFatal {
                    warn!(target: "call::webrtc", error = %err, "offer not delivered, continuing");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn open_channel(
        &self,
        label: &str,
        ordered: bool,
        reliable: bool,
    ) -> Result<Option<Arc<dyn DataChannel>>, TransportError> {
        let pc = self.inner.current_pc()?;
        let init = RTCDataChannelInit {
            ordered: Some(ordered),
            max_retransmits: if reliable { None } else { Some(0) },
            ..Default::default()
        };
        let dc = pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_setup_error)?;
        let channel = WebRtcDataChannel::wrap(dc, ordered, reliable);
        self.inner
            .channels
            .lock()
            .insert(label.to_string(), Arc::clone(&channel));
        debug!(target: "call::webrtc", label, ordered, reliable, "data channel created");
        let channel: Arc<dyn DataChannel> = channel;
        Ok(Some(channel))
    }

    async fn close_channel(&self, channel: &Arc<dyn DataChannel>) -> Result<(), TransportError> {
        let removed = self.inner.channels.lock().remove(channel.label());
        if let Some(removed) = removed {
            removed.close().await;
        }
        Ok(())
    }

    async fn hard_reset(&self) -> Result<(), TransportError> {
        let retired = self.inner.pc.write().take();
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        let channels: Vec<Arc<WebRtcDataChannel>> = self
            .inner
            .channels
            .lock()
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        for channel in &channels {
            channel.close().await;
        }

        let mut result = Ok(());
        if let Some(pc) = retired {
            if let Err(err) = pc.close().await {
                result = Err(TransportError::Setup(format!("closing peer connection: {err}")));
            }
        }
        self.inner.install_peer_connection().await?;
        info!(target: "call::webrtc", closed_channels = channels.len(), "peer connection recycled");
        result
    }

    fn set_local_video_enabled(&self, enabled: bool) {
        self.inner.local_video.store(enabled, Ordering::SeqCst);
        debug!(target: "call::webrtc", enabled, "local video toggled");
    }
}
