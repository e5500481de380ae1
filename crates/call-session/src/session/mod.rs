use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tracing::warn;

use crate::channel::{ChannelHandle, ChannelRef};
use crate::config::CallConfig;
use crate::error::{CallError, ChannelError, SendError};
use crate::events::{CallEvent, Notifier};
use crate::transport::{CameraSource, PeerTransport};

mod controller;
mod dispatcher;
mod timer;

use controller::CallSession;
use dispatcher::{Dispatcher, Task};

pub use timer::SETTLE_DELAY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Allocating,
    Connecting,
    Active,
    Ending,
}

/// How an accepted message left the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Held until the channel opens.
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub phase: CallPhase,
    pub on_call: bool,
    pub ignore_button_presses: bool,
    /// Registered channel labels, sorted.
    pub channels: Vec<String>,
    pub pending_messages: usize,
}

pub struct CallControllerBuilder {
    transport: Arc<dyn PeerTransport>,
    config: CallConfig,
    camera: Option<Arc<dyn CameraSource>>,
}

impl CallControllerBuilder {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            transport,
            config: CallConfig::default(),
            camera: None,
        }
    }

    pub fn config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    pub fn camera(mut self, camera: Arc<dyn CameraSource>) -> Self {
        self.camera = Some(camera);
        self
    }

    /// Starts the session task on the current tokio runtime and opens the
    /// baseline channel.
    pub fn spawn(self) -> CallController {
        let (dispatcher, rx) = Dispatcher::new();
        let notifier = Notifier::new();
        self.transport.set_event_sink(dispatcher.transport_sink());

        let session = CallSession::new(
            self.config,
            self.transport,
            self.camera,
            notifier.clone(),
            dispatcher.clone(),
        );
        dispatcher.enqueue(Task::EnsureBaselineChannel);
        tokio::spawn(session.run(rx));

        CallController {
            dispatcher,
            notifier,
        }
    }
}

/// Cloneable handle to a running call session. Every method is marshalled
/// onto the session task and processed in call order.
#[derive(Clone)]
pub struct CallController {
    dispatcher: Dispatcher,
    notifier: Notifier,
}

impl CallController {
    pub fn builder(transport: Arc<dyn PeerTransport>) -> CallControllerBuilder {
        CallControllerBuilder::new(transport)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.notifier.subscribe()
    }

    /// Starts a call, or hangs up the current one. Returns once the request
    /// has been processed; the outcome arrives as a [`CallEvent`].
    pub async fn toggle_call(&self) {
        let (done, wait) = oneshot::channel();
        if self.dispatcher.enqueue(Task::ToggleCall { done }) {
            let _ = wait.await;
        }
    }

    pub async fn try_send_message(
        &self,
        payload: impl Into<Bytes>,
        channel: impl Into<ChannelRef>,
    ) -> Result<Delivery, SendError> {
        let (reply, wait) = oneshot::channel();
        let task = Task::SendMessage {
            payload: payload.into(),
            channel: channel.into(),
            reply,
        };
        if !self.dispatcher.enqueue(task) {
            return Err(SendError::ControllerStopped);
        }
        wait.await.map_err(|_| SendError::ControllerStopped)?
    }

    /// Returns true if the message was sent or queued for a connecting
    /// channel.
    pub async fn send_message(
        &self,
        payload: impl Into<Bytes>,
        channel: impl Into<ChannelRef>,
    ) -> bool {
        let channel = channel.into();
        let label = channel.label().to_string();
        match self.try_send_message(payload, channel).await {
            Ok(_) => true,
            Err(err) => {
                warn!(target: "call::controller", label = %label, error = %err, "message not sent");
                false
            }
        }
    }

    pub async fn send_json<T: Serialize>(
        &self,
        value: &T,
        channel: impl Into<ChannelRef>,
    ) -> Result<Delivery, SendError> {
        let payload = serde_json::to_vec(value)?;
        self.try_send_message(payload, channel).await
    }

    pub async fn try_get_or_create_channel(
        &self,
        label: &str,
        ordered: bool,
        reliable: bool,
    ) -> Result<ChannelHandle, ChannelError> {
        let (reply, wait) = oneshot::channel();
        let task = Task::GetOrCreateChannel {
            label: label.to_string(),
            ordered,
            reliable,
            reply,
        };
        if !self.dispatcher.enqueue(task) {
            return Err(ChannelError::ControllerStopped);
        }
        wait.await.map_err(|_| ChannelError::ControllerStopped)?
    }

    pub async fn get_or_create_channel(
        &self,
        label: &str,
        ordered: bool,
        reliable: bool,
    ) -> Option<ChannelHandle> {
        match self.try_get_or_create_channel(label, ordered, reliable).await {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(target: "call::controller", label, error = %err, "channel unavailable");
                None
            }
        }
    }

    pub async fn get_or_create_unreliable_channel(&self, label: &str) -> Option<ChannelHandle> {
        self.get_or_create_channel(label, false, false).await
    }

    pub async fn status(&self) -> Result<SessionStatus, CallError> {
        let (reply, wait) = oneshot::channel();
        if !self.dispatcher.enqueue(Task::Status { reply }) {
            return Err(CallError::ControllerStopped);
        }
        wait.await.map_err(|_| CallError::ControllerStopped)
    }

    /// Releases everything and stops the session task. Later calls on any
    /// clone of this handle report the controller as stopped.
    pub async fn shutdown(&self) {
        let (done, wait) = oneshot::channel();
        if self.dispatcher.enqueue(Task::Shutdown { done }) {
            let _ = wait.await;
        }
    }
}
