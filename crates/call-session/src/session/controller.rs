use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::dispatcher::{Dispatcher, Task};
use super::timer::{DeferredTask, SETTLE_DELAY, TimeoutGuard};
use super::{CallPhase, Delivery, SessionStatus};
use crate::channel::{ChannelHandle, ChannelRef, ChannelRegistry, Lookup, PendingQueue};
use crate::config::CallConfig;
use crate::error::{CallError, ChannelError, SendError, Unavailable};
use crate::events::{CallEvent, Notifier};
use crate::transport::{
    CameraSource, ChannelState, ConnectMode, ConnectionState, DataChannel, PeerTransport,
};

/// Owns every piece of mutable call state. Runs as a single task that
/// consumes the dispatcher queue, so handlers never overlap.
pub(crate) struct CallSession {
    config: CallConfig,
    transport: Arc<dyn PeerTransport>,
    camera: Option<Arc<dyn CameraSource>>,
    registry: ChannelRegistry,
    pending: PendingQueue,
    notifier: Notifier,
    dispatcher: Dispatcher,
    phase: CallPhase,
    on_call: bool,
    ignore_button_presses: bool,
    timeout: TimeoutGuard,
    settling: VecDeque<DeferredTask>,
}

impl CallSession {
    pub(crate) fn new(
        config: CallConfig,
        transport: Arc<dyn PeerTransport>,
        camera: Option<Arc<dyn CameraSource>>,
        notifier: Notifier,
        dispatcher: Dispatcher,
    ) -> Self {
        let registry = ChannelRegistry::new(Arc::clone(&transport), Arc::new(dispatcher.clone()));
        Self {
            config,
            transport,
            camera,
            registry,
            pending: PendingQueue::new(),
            notifier,
            dispatcher,
            phase: CallPhase::Idle,
            on_call: false,
            ignore_button_presses: false,
            timeout: TimeoutGuard::default(),
            settling: VecDeque::new(),
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Task>) {
        info!(
            target: "call::session",
            timeout_ms = self.config.call_timeout().as_millis() as u64,
            mode = ?self.config.connect_mode(),
            "call session started"
        );
        while let Some(task) = rx.recv().await {
            if let Task::Shutdown { done } = task {
                self.shutdown().await;
                let _ = done.send(());
                break;
            }
            self.handle(task).await;
        }
        info!(target: "call::session", "call session stopped");
    }

    async fn handle(&mut self, task: Task) {
        match task {
            Task::ToggleCall { done } => {
                self.toggle_call().await;
                let _ = done.send(());
            }
            Task::SendMessage {
                payload,
                channel,
                reply,
            } => {
                let result = self.send_message(payload, channel).await;
                let _ = reply.send(result);
            }
            Task::GetOrCreateChannel {
                label,
                ordered,
                reliable,
                reply,
            } => {
                let result = self.get_or_create_channel(&label, ordered, reliable).await;
                let _ = reply.send(result);
            }
            Task::ConnectionStateChanged(state) => self.on_connection_state(state).await,
            Task::GatheringStateChanged(state) => {
                info!(target: "call::session", state = ?state, "ice gathering state changed");
            }
            Task::TransportError(message) => {
                let err = CallError::TransportFault(message);
                warn!(target: "call::session", error = %err, "peer connection error");
                self.end_call(true).await;
            }
            Task::ChannelAdded(channel) => self.on_channel_added(channel),
            Task::ChannelStateChanged { label, state } => {
                self.on_channel_state(&label, state).await
            }
            Task::MessageReceived { label, payload } => {
                self.notifier.emit(CallEvent::MessageReceived { label, payload });
            }
            Task::CallTimeoutElapsed { generation } => self.on_call_timeout(generation).await,
            Task::SettleElapsed { failed } => self.on_settled(failed),
            Task::EnsureBaselineChannel => self.ensure_baseline_channel().await,
            Task::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Task::Shutdown { .. } => {}
        }
    }

    async fn toggle_call(&mut self) {
        if self.ignore_button_presses {
            debug!(target: "call::session", phase = ?self.phase, "call toggle ignored while pending");
            return;
        }
        self.ignore_button_presses = true;

        if self.on_call {
            info!(target: "call::session", "hanging up");
            self.teardown(false).await;
            return;
        }

        self.notifier.emit(CallEvent::CallButtonPressed);
        self.phase = CallPhase::Allocating;
        for spec in self.config.default_channels() {
            if let Err(err) = self
                .get_or_create_channel(&spec.label, spec.ordered, spec.reliable)
                .await
            {
                self.abort_start(CallError::Channel(err)).await;
                return;
            }
        }

        self.phase = CallPhase::Connecting;
        let mode = self.config.connect_mode();
        info!(target: "call::session", mode = ?mode, channels = self.registry.len(), "starting call");
        match self.transport.connect(mode).await {
            Ok(()) => {}
            Err(err) if err.is_non_fatal() && mode == ConnectMode::IgnoreNonFatal => {
                debug!(target: "call::session", error = %err, "ignoring non-fatal connect error");
            }
            Err(err) => {
                self.abort_start(CallError::ConnectFailed(err)).await;
                return;
            }
        }
        self.timeout.arm(self.config.call_timeout(), &self.dispatcher);
    }

    /// Undoes a call start that never reached the transport's connected
    /// state. No transport reset is needed here.
    async fn abort_start(&mut self, err: CallError) {
        warn!(target: "call::session", error = %err, phase = ?self.phase, "call start failed");
        self.registry.close_all().await;
        let dropped = self.pending.clear();
        if dropped > 0 {
            debug!(target: "call::session", dropped, "discarded pending messages");
        }
        self.ignore_button_presses = false;
        self.phase = CallPhase::Idle;
        self.notifier.emit(CallEvent::CallFailed);
    }

    async fn on_connection_state(&mut self, state: ConnectionState) {
        info!(target: "call::session", state = ?state, phase = ?self.phase, "ice connection state changed");
        match state {
            ConnectionState::Connected | ConnectionState::Completed => {
                if self.on_call {
                    return;
                }
                self.on_call = true;
                self.ignore_button_presses = false;
                self.phase = CallPhase::Active;
                self.notifier.emit(CallEvent::CallStarted);
            }
            ConnectionState::Failed => self.end_call(true).await,
            ConnectionState::Disconnected | ConnectionState::Closed => self.end_call(false).await,
            ConnectionState::Checking => {
                if self.phase == CallPhase::Idle {
                    // Remote-initiated negotiation; a later failure must recycle.
                    self.phase = CallPhase::Connecting;
                }
            }
            ConnectionState::New => {}
        }
    }

    /// Transport-driven teardown. Skipped while a teardown is settling, or
    /// while idle with no negotiation reported since the last reset.
    async fn end_call(&mut self, failed: bool) {
        match self.phase {
            CallPhase::Idle | CallPhase::Ending => {
                debug!(
                    target: "call::session",
                    phase = ?self.phase,
                    failed,
                    "no call in progress, ignoring transport teardown"
                );
            }
            CallPhase::Allocating | CallPhase::Connecting | CallPhase::Active => {
                self.teardown(failed).await
            }
        }
    }

    async fn on_call_timeout(&mut self, generation: u64) {
        if !self.timeout.take_if_current(generation) {
            trace!(
                target: "call::session",
                generation,
                armed = self.timeout.is_armed(),
                "stale call timeout ignored"
            );
            return;
        }
        if self.on_call {
            self.ignore_button_presses = false;
            return;
        }
        let err = CallError::Timeout {
            seconds: self.config.call_timeout().as_secs_f32(),
        };
        warn!(target: "call::session", error = %err, "call did not connect in time");
        self.teardown(true).await;
    }

    async fn teardown(&mut self, failed: bool) {
        info!(target: "call::session", failed, phase = ?self.phase, "tearing down call");
        self.phase = CallPhase::Ending;
        self.on_call = false;
        let dropped = self.pending.clear();
        if dropped > 0 {
            debug!(target: "call::session", dropped, "discarded pending messages");
        }

        self.registry.close_all().await;
        self.timeout.cancel();
        self.recycle_transport().await;

        self.settling.push_back(DeferredTask::schedule(
            SETTLE_DELAY,
            &self.dispatcher,
            Task::SettleElapsed { failed },
        ));
        self.ensure_baseline_channel().await;
        self.ignore_button_presses = false;
    }

    /// Hard reset with local media paused around it. The reset runs even if
    /// the media toggles fail.
    async fn recycle_transport(&self) {
        self.set_local_media(false);
        if let Err(err) = self.transport.hard_reset().await {
            warn!(target: "call::session", error = %err, "transport reset failed");
        }
        self.set_local_media(true);
    }

    fn set_local_media(&self, enabled: bool) {
        self.transport.set_local_video_enabled(enabled);
        let Some(camera) = &self.camera else {
            return;
        };
        if let Err(err) = camera.set_enabled(enabled) {
            warn!(target: "call::session", enabled, error = %err, "failed to toggle camera");
        }
    }

    fn on_settled(&mut self, failed: bool) {
        self.settling.pop_front();
        if self.phase == CallPhase::Ending {
            self.phase = CallPhase::Idle;
        }
        self.notifier.emit(if failed {
            CallEvent::CallFailed
        } else {
            CallEvent::CallEnded
        });
    }

    async fn ensure_baseline_channel(&mut self) {
        if !self.registry.is_empty() {
            return;
        }
        let label = Uuid::new_v4().to_string();
        match self.get_or_create_channel(&label, true, true).await {
            Ok(handle) => {
                debug!(target: "call::session", label = handle.label(), "baseline channel ready")
            }
            Err(err) => {
                warn!(target: "call::session", error = %err, "unable to open baseline channel")
            }
        }
    }

    async fn get_or_create_channel(
        &mut self,
        label: &str,
        ordered: bool,
        reliable: bool,
    ) -> Result<ChannelHandle, ChannelError> {
        match self.registry.get_or_create(label, ordered, reliable).await? {
            Lookup::Existing(handle) => Ok(handle),
            Lookup::Created(handle) => {
                self.notifier.emit(CallEvent::DataChannelAdded(handle.clone()));
                Ok(handle)
            }
        }
    }

    fn on_channel_added(&mut self, channel: Arc<dyn DataChannel>) {
        if let Some(handle) = self.registry.register_remote(channel) {
            self.notifier.emit(CallEvent::DataChannelAdded(handle));
        }
    }

    async fn on_channel_state(&mut self, label: &str, state: ChannelState) {
        debug!(target: "call::session", label, state = ?state, "data channel state changed");
        let report = self.pending.drain().await;
        if report != Default::default() {
            debug!(
                target: "call::session",
                sent = report.sent,
                failed = report.failed,
                dropped = report.dropped,
                retained = report.retained,
                "pending messages drained"
            );
        }
        let removed = self.registry.remove_closed().await;
        let purged = self.pending.purge(&removed);
        if purged > 0 {
            debug!(target: "call::session", purged, "dropped messages for removed channels");
        }
    }

    async fn send_message(
        &mut self,
        payload: Bytes,
        target: ChannelRef,
    ) -> Result<Delivery, SendError> {
        if !self.transport.is_ready() {
            return Err(SendError::NotConnected);
        }
        let handle = match &target {
            ChannelRef::Label(label) => self.registry.get(label),
            ChannelRef::Handle(handle) => self.registry.resolve(handle),
        }
        .ok_or_else(|| SendError::ChannelUnavailable {
            label: target.label().to_string(),
            reason: Unavailable::Unknown,
        })?;

        let Some(channel) = handle.upgrade() else {
            return Err(SendError::ChannelUnavailable {
                label: handle.label().to_string(),
                reason: Unavailable::Closed,
            });
        };
        match channel.state() {
            ChannelState::Connecting => {
                self.pending.enqueue(handle, payload);
                Ok(Delivery::Queued)
            }
            ChannelState::Open => {
                channel
                    .send(payload)
                    .await
                    .map_err(|source| SendError::SendFailed {
                        label: handle.label().to_string(),
                        source,
                    })?;
                Ok(Delivery::Sent)
            }
            state @ (ChannelState::Closing | ChannelState::Closed) => {
                Err(SendError::ChannelUnavailable {
                    label: handle.label().to_string(),
                    reason: state.into(),
                })
            }
        }
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            phase: self.phase,
            on_call: self.on_call,
            ignore_button_presses: self.ignore_button_presses,
            channels: self.registry.labels(),
            pending_messages: self.pending.len(),
        }
    }

    async fn shutdown(&mut self) {
        info!(target: "call::session", on_call = self.on_call, "shutting down call session");
        self.timeout.cancel();
        self.settling.clear();
        self.pending.clear();
        self.registry.close_all().await;
        if self.phase != CallPhase::Idle {
            self.recycle_transport().await;
        }
        if self.on_call {
            self.on_call = false;
            self.notifier.emit(CallEvent::CallEnded);
        }
        self.phase = CallPhase::Idle;
    }
}
