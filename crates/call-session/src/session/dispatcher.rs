use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use super::{Delivery, SessionStatus};
use crate::channel::{ChannelEvents, ChannelHandle, ChannelRef};
use crate::error::{ChannelError, SendError};
use crate::transport::{
    ChannelState, ConnectionState, DataChannel, GatheringState, TransportEvent, TransportEventSink,
};

/// Work items for the session task. Everything that reads or mutates session
/// state arrives here first.
pub(crate) enum Task {
    ToggleCall {
        done: oneshot::Sender<()>,
    },
    SendMessage {
        payload: Bytes,
        channel: ChannelRef,
        reply: oneshot::Sender<Result<Delivery, SendError>>,
    },
    GetOrCreateChannel {
        label: String,
        ordered: bool,
        reliable: bool,
        reply: oneshot::Sender<Result<ChannelHandle, ChannelError>>,
    },
    ConnectionStateChanged(ConnectionState),
    GatheringStateChanged(GatheringState),
    TransportError(String),
    ChannelAdded(Arc<dyn DataChannel>),
    ChannelStateChanged {
        label: String,
        state: ChannelState,
    },
    MessageReceived {
        label: String,
        payload: Bytes,
    },
    CallTimeoutElapsed {
        generation: u64,
    },
    SettleElapsed {
        failed: bool,
    },
    EnsureBaselineChannel,
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

impl Task {
    fn name(&self) -> &'static str {
        match self {
            Task::ToggleCall { .. } => "toggle_call",
            Task::SendMessage { .. } => "send_message",
            Task::GetOrCreateChannel { .. } => "get_or_create_channel",
            Task::ConnectionStateChanged(_) => "connection_state",
            Task::GatheringStateChanged(_) => "gathering_state",
            Task::TransportError(_) => "transport_error",
            Task::ChannelAdded(_) => "channel_added",
            Task::ChannelStateChanged { .. } => "channel_state",
            Task::MessageReceived { .. } => "message_received",
            Task::CallTimeoutElapsed { .. } => "call_timeout",
            Task::SettleElapsed { .. } => "settle",
            Task::EnsureBaselineChannel => "baseline_channel",
            Task::Status { .. } => "status",
            Task::Shutdown { .. } => "shutdown",
        }
    }
}

/// Producer side of the serial session queue. Cheap to clone and safe to
/// use from any thread.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    tx: mpsc::UnboundedSender<Task>,
}

impl Dispatcher {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Task>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the session task has stopped.
    pub(crate) fn enqueue(&self, task: Task) -> bool {
        let name = task.name();
        match self.tx.send(task) {
            Ok(()) => {
                trace!(target: "call::dispatcher", task = name, "task enqueued");
                true
            }
            Err(_) => {
                debug!(target: "call::dispatcher", task = name, "session stopped, task dropped");
                false
            }
        }
    }

    /// Sink handed to the transport; converts its callbacks into tasks.
    pub(crate) fn transport_sink(&self) -> TransportEventSink {
        let dispatcher = self.clone();
        Arc::new(move |event| {
            let task = match event {
                TransportEvent::ConnectionState(state) => Task::ConnectionStateChanged(state),
                TransportEvent::GatheringState(state) => Task::GatheringStateChanged(state),
                TransportEvent::ChannelAdded(channel) => Task::ChannelAdded(channel),
                TransportEvent::Error(message) => Task::TransportError(message),
            };
            dispatcher.enqueue(task);
        })
    }
}

impl ChannelEvents for Dispatcher {
    fn state_changed(&self, label: &str, state: ChannelState) {
        self.enqueue(Task::ChannelStateChanged {
            label: label.to_string(),
            state,
        });
    }

    fn message_received(&self, label: &str, payload: Bytes) {
        self.enqueue(Task::MessageReceived {
            label: label.to_string(),
            payload,
        });
    }
}
