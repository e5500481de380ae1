use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use call_session::TransportError;
use call_session::transport::{
    ChannelMessageObserver, ChannelState, ChannelStateObserver, DataChannel,
};
use parking_lot::Mutex;
use tracing::{debug, trace};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;

#[derive(Default)]
struct Observers {
    state: Mutex<Option<ChannelStateObserver>>,
    message: Mutex<Option<ChannelMessageObserver>>,
}

impl Observers {
    fn state_changed(&self, state: ChannelState) {
        let observer = self.state.lock().clone();
        if let Some(observer) = observer {
            observer(state);
        }
    }

    fn message(&self, payload: Bytes) {
        let observer = self.message.lock().clone();
        if let Some(observer) = observer {
            observer(payload);
        }
    }
}

/// [`DataChannel`] over a webrtc-rs data channel.
pub struct WebRtcDataChannel {
    inner: Arc<RTCDataChannel>,
    label: String,
    ordered: bool,
    reliable: bool,
    observers: Arc<Observers>,
}

impl WebRtcDataChannel {
    pub(crate) fn wrap(inner: Arc<RTCDataChannel>, ordered: bool, reliable: bool) -> Arc<Self> {
        let observers = Arc::new(Observers::default());
        let label = inner.label().to_string();

        let on_open = Arc::clone(&observers);
        let open_label = label.clone();
        inner.on_open(Box::new(move || {
            let observers = Arc::clone(&on_open);
            let label = open_label.clone();
            Box::pin(async move {
                debug!(target: "call::webrtc", label = %label, "data channel open");
                observers.state_changed(ChannelState::Open);
            })
        }));

        let on_close = Arc::clone(&observers);
        let close_label = label.clone();
        inner.on_close(Box::new(move || {
            let observers = Arc::clone(&on_close);
            let label = close_label.clone();
            Box::pin(async move {
                debug!(target: "call::webrtc", label = %label, "data channel closed");
                observers.state_changed(ChannelState::Closed);
            })
        }));

        let on_message = Arc::clone(&observers);
        let message_label = label.clone();
        inner.on_message(Box::new(move |msg: DataChannelMessage| {
            let observers = Arc::clone(&on_message);
            let label = message_label.clone();
            Box::pin(async move {
                trace!(
                    target: "call::webrtc",
                    label = %label,
                    payload_len = msg.data.len(),
                    "data channel message"
                );
                observers.message(msg.data);
            })
        }));

        Arc::new(Self {
            inner,
            label,
            ordered,
            reliable,
            observers,
        })
    }

    pub(crate) async fn close(&self) {
        if let Err(err) = self.inner.close().await {
            debug!(target: "call::webrtc", label = %self.label, error = %err, "data channel close failed");
        }
    }
}

pub(crate) fn map_state(state: RTCDataChannelState) -> ChannelState {
    match state {
        RTCDataChannelState::Open => ChannelState::Open,
        RTCDataChannelState::Closing => ChannelState::Closing,
        RTCDataChannelState::Closed => ChannelState::Closed,
        _ => ChannelState::Connecting,
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
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
        map_state(self.inner.ready_state())
    }

    fn observe_state(&self, observer: ChannelStateObserver) {
        *self.observers.state.lock() = Some(observer);
    }

    fn observe_messages(&self, observer: ChannelMessageObserver) {
        *self.observers.message.lock() = Some(observer);
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        self.inner
            .send(&payload)
            .await
            .map(|_| ())
            .map_err(|err| TransportError::Send(format!("{}: {err}", self.label)))
    }
}
