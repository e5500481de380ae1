use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{info, trace, warn};

use crate::channel::ChannelHandle;
use crate::telemetry::payload_preview;

const EVENT_CAPACITY: usize = 128;
const PREVIEW_BYTES: usize = 48;

/// Notifications published by the call controller.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    CallButtonPressed,
    CallStarted,
    CallEnded,
    CallFailed,
    DataChannelAdded(ChannelHandle),
    MessageReceived { label: String, payload: Bytes },
}

impl CallEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::CallButtonPressed => "call_button_pressed",
            CallEvent::CallStarted => "call_started",
            CallEvent::CallEnded => "call_ended",
            CallEvent::CallFailed => "call_failed",
            CallEvent::DataChannelAdded(_) => "data_channel_added",
            CallEvent::MessageReceived { .. } => "message_received",
        }
    }
}

/// Fan-out of [`CallEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<CallEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: CallEvent) {
        match &event {
            CallEvent::CallFailed => warn!(target: "call::events", "call failed"),
            CallEvent::MessageReceived { label, payload } => trace!(
                target: "call::events",
                label = %label,
                payload_len = payload.len(),
                preview = %payload_preview(payload, PREVIEW_BYTES),
                "message received"
            ),
            CallEvent::DataChannelAdded(handle) => info!(
                target: "call::events",
                label = handle.label(),
                "data channel added"
            ),
            other => info!(target: "call::events", event = other.name(), "call notification"),
        }
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}
