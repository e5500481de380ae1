use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{
    CameraSource, ChannelMessageObserver, ChannelState, ChannelStateObserver, ConnectMode,
    ConnectionState, DataChannel, PeerTransport, TransportEvent, TransportEventSink,
};
use crate::error::TransportError;

/// In-memory channel whose state is driven by the test.
pub struct MockDataChannel {
    label: String,
    ordered: bool,
    reliable: bool,
    state: Mutex<ChannelState>,
    state_observer: Mutex<Option<ChannelStateObserver>>,
    message_observer: Mutex<Option<ChannelMessageObserver>>,
    sent: Mutex<Vec<Bytes>>,
    fail_sends: Mutex<bool>,
}

impl MockDataChannel {
    fn new(label: &str, ordered: bool, reliable: bool, state: ChannelState) -> Self {
        Self {
            label: label.to_string(),
            ordered,
            reliable,
            state: Mutex::new(state),
            state_observer: Mutex::new(None),
            message_observer: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            fail_sends: Mutex::new(false),
        }
    }

    /// Moves the channel to `state` and notifies the observer, the way a
    /// transport thread would.
    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
        let observer = self.state_observer.lock().clone();
        if let Some(observer) = observer {
            observer(state);
        }
    }

    /// Simulates an inbound message from the remote peer.
    pub fn deliver(&self, payload: impl Into<Bytes>) {
        let observer = self.message_observer.lock().clone();
        if let Some(observer) = observer {
            observer(payload.into());
        }
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        *self.fail_sends.lock() = fail;
    }

    fn set_state_silently(&self, state: ChannelState) {
        *self.state.lock() = state;
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ordered(&self) -> bool {
        self.ordered
    }

    fn reliable(&self) -> bool {
        self.reliable
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn observe_state(&self, observer: ChannelStateObserver) {
        *self.state_observer.lock() = Some(observer);
    }

    fn observe_messages(&self, observer: ChannelMessageObserver) {
        *self.message_observer.lock() = Some(observer);
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if *self.fail_sends.lock() {
            return Err(TransportError::Send(format!("{} rejected payload", self.label)));
        }
        if self.state() != ChannelState::Open {
            return Err(TransportError::Send(format!("{} is not open", self.label)));
        }
        self.sent.lock().push(payload);
        Ok(())
    }
}

struct MockState {
    ready: bool,
    sink: Option<TransportEventSink>,
    channels: HashMap<String, Arc<MockDataChannel>>,
    initial_channel_state: ChannelState,
    failing_opens: HashSet<String>,
    empty_opens: HashSet<String>,
    connect_failure: Option<TransportError>,
    release_failures: bool,
    open_requests: Vec<String>,
    connect_calls: Vec<ConnectMode>,
    released: Vec<String>,
    resets: usize,
    local_video: Vec<bool>,
}

/// Scriptable [`PeerTransport`] for exercising the session without a real
/// peer connection.
pub struct MockPeerTransport {
    state: Mutex<MockState>,
}

impl Default for MockPeerTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPeerTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                ready: true,
                sink: None,
                channels: HashMap::new(),
                initial_channel_state: ChannelState::Connecting,
                failing_opens: HashSet::new(),
                empty_opens: HashSet::new(),
                connect_failure: None,
                release_failures: false,
                open_requests: Vec::new(),
                connect_calls: Vec::new(),
                released: Vec::new(),
                resets: 0,
                local_video: Vec::new(),
            }),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.state.lock().ready = ready;
    }

    /// State newly opened channels start in.
    pub fn set_initial_channel_state(&self, state: ChannelState) {
        self.state.lock().initial_channel_state = state;
    }

    pub fn fail_open(&self, label: &str) {
        self.state.lock().failing_opens.insert(label.to_string());
    }

    /// Makes `open_channel` succeed without producing a channel.
    pub fn yield_no_channel(&self, label: &str) {
        self.state.lock().empty_opens.insert(label.to_string());
    }

    pub fn fail_connect(&self, error: TransportError) {
        self.state.lock().connect_failure = Some(error);
    }

    pub fn fail_releases(&self, fail: bool) {
        self.state.lock().release_failures = fail;
    }

    pub fn channel(&self, label: &str) -> Option<Arc<MockDataChannel>> {
        self.state.lock().channels.get(label).cloned()
    }

    pub fn channel_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.state.lock().channels.keys().cloned().collect();
        labels.sort();
        labels
    }

    pub fn open_requests(&self) -> Vec<String> {
        self.state.lock().open_requests.clone()
    }

    pub fn connect_calls(&self) -> Vec<ConnectMode> {
        self.state.lock().connect_calls.clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.state.lock().released.clone()
    }

    pub fn reset_count(&self) -> usize {
        self.state.lock().resets
    }

    pub fn local_video_toggles(&self) -> Vec<bool> {
        self.state.lock().local_video.clone()
    }

    pub fn emit_connection_state(&self, state: ConnectionState) {
        self.emit(TransportEvent::ConnectionState(state));
    }

    pub fn emit_error(&self, message: &str) {
        self.emit(TransportEvent::Error(message.to_string()));
    }

    /// Registers a channel as if the remote peer had opened it.
    pub fn add_remote_channel(&self, label: &str, ordered: bool, reliable: bool) -> Arc<MockDataChannel> {
        let channel = {
            let mut state = self.state.lock();
            let channel = Arc::new(MockDataChannel::new(
                label,
                ordered,
                reliable,
                state.initial_channel_state,
            ));
            state.channels.insert(label.to_string(), channel.clone());
            channel
        };
        self.emit(TransportEvent::ChannelAdded(channel.clone()));
        channel
    }

    fn emit(&self, event: TransportEvent) {
        let sink = self.state.lock().sink.clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    fn set_event_sink(&self, sink: TransportEventSink) {
        self.state.lock().sink = Some(sink);
    }

    async fn connect(&self, mode: ConnectMode) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.connect_calls.push(mode);
        if !state.ready {
            return Err(TransportError::NoSession);
        }
        match state.connect_failure.clone() {
            Some(err) if err.is_non_fatal() && mode == ConnectMode::IgnoreNonFatal => Ok(()),
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn open_channel(
        &self,
        label: &str,
        ordered: bool,
        reliable: bool,
    ) -> Result<Option<Arc<dyn DataChannel>>, TransportError> {
        let mut state = self.state.lock();
        state.open_requests.push(label.to_string());
        if !state.ready {
            return Err(TransportError::NoSession);
        }
        if state.failing_opens.contains(label) {
            return Err(TransportError::Setup(format!("refused to open {label}")));
        }
        if state.empty_opens.contains(label) {
            return Ok(None);
        }
        let channel = Arc::new(MockDataChannel::new(
            label,
            ordered,
            reliable,
            state.initial_channel_state,
        ));
        state.channels.insert(label.to_string(), channel.clone());
        Ok(Some(channel))
    }

    async fn close_channel(&self, channel: &Arc<dyn DataChannel>) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let label = channel.label().to_string();
        if state.release_failures {
            return Err(TransportError::Release {
                label,
                reason: "mock release failure".into(),
            });
        }
        if let Some(removed) = state.channels.remove(&label) {
            removed.set_state_silently(ChannelState::Closed);
        }
        state.released.push(label);
        Ok(())
    }

    async fn hard_reset(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        for (_, channel) in state.channels.drain() {
            channel.set_state_silently(ChannelState::Closed);
        }
        state.resets += 1;
        Ok(())
    }

    fn set_local_video_enabled(&self, enabled: bool) {
        self.state.lock().local_video.push(enabled);
    }
}

/// Camera stub recording every toggle.
#[derive(Default)]
pub struct MockCamera {
    toggles: Mutex<Vec<bool>>,
    fail: Mutex<bool>,
}

impl MockCamera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_toggles(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn toggles(&self) -> Vec<bool> {
        self.toggles.lock().clone()
    }
}

impl CameraSource for MockCamera {
    fn set_enabled(&self, enabled: bool) -> Result<(), TransportError> {
        self.toggles.lock().push(enabled);
        if *self.fail.lock() {
            return Err(TransportError::Setup("camera unavailable".into()));
        }
        Ok(())
    }
}
