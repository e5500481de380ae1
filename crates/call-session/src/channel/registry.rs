use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::ChannelHandle;
use crate::error::{ChannelError, TransportError};
use crate::transport::{ChannelState, DataChannel, PeerTransport};

/// Receives channel notifications from the transport's execution context.
/// Implementations must only hand the notification off, never touch session
/// state directly.
pub trait ChannelEvents: Send + Sync + 'static {
    fn state_changed(&self, label: &str, state: ChannelState);
    fn message_received(&self, label: &str, payload: Bytes);
}

/// Result of [`ChannelRegistry::get_or_create`].
#[derive(Debug, Clone)]
pub enum Lookup {
    Existing(ChannelHandle),
    Created(ChannelHandle),
}

impl Lookup {
    pub fn handle(&self) -> &ChannelHandle {
        match self {
            Lookup::Existing(handle) | Lookup::Created(handle) => handle,
        }
    }

    pub fn into_handle(self) -> ChannelHandle {
        match self {
            Lookup::Existing(handle) | Lookup::Created(handle) => handle,
        }
    }
}

/// Known data channels of the current peer session, keyed by label.
pub struct ChannelRegistry {
    transport: Arc<dyn PeerTransport>,
    events: Arc<dyn ChannelEvents>,
    channels: HashMap<String, ChannelHandle>,
}

impl ChannelRegistry {
    pub fn new(transport: Arc<dyn PeerTransport>, events: Arc<dyn ChannelEvents>) -> Self {
        Self {
            transport,
            events,
            channels: HashMap::new(),
        }
    }

    pub fn get(&self, label: &str) -> Option<ChannelHandle> {
        self.channels.get(label).cloned()
    }

    /// Returns the registered handle pointing at the same channel as
    /// `handle`, if any.
    pub fn resolve(&self, handle: &ChannelHandle) -> Option<ChannelHandle> {
        self.channels
            .get(handle.label())
            .filter(|known| known.same_channel(handle))
            .cloned()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.channels.contains_key(label)
    }

    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.channels.keys().cloned().collect();
        labels.sort();
        labels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub async fn get_or_create(
        &mut self,
        label: &str,
        ordered: bool,
        reliable: bool,
    ) -> Result<Lookup, ChannelError> {
        if !self.transport.is_ready() {
            warn!(target: "call::registry", label, "peer is not present");
            return Err(ChannelError::NotConnected);
        }
        if let Some(existing) = self.channels.get(label) {
            return Ok(Lookup::Existing(existing.clone()));
        }

        debug!(target: "call::registry", label, ordered, reliable, "channel not found, opening");
        let channel = match self.transport.open_channel(label, ordered, reliable).await {
            Ok(Some(channel)) => channel,
            Ok(None) => {
                return Err(ChannelError::CreationFailed {
                    label: label.to_string(),
                    source: TransportError::Setup("transport yielded no channel".into()),
                });
            }
            Err(TransportError::NoSession) => return Err(ChannelError::NotConnected),
            Err(source) => {
                return Err(ChannelError::CreationFailed {
                    label: label.to_string(),
                    source,
                });
            }
        };

        let handle = self.attach(&channel);
        info!(target: "call::registry", label, ordered, reliable, "data channel registered");
        Ok(Lookup::Created(handle))
    }

    /// Registers a channel the remote peer opened. Returns `None` when the
    /// label is already known.
    pub fn register_remote(&mut self, channel: Arc<dyn DataChannel>) -> Option<ChannelHandle> {
        if self.channels.contains_key(channel.label()) {
            debug!(
                target: "call::registry",
                label = channel.label(),
                "remote channel already registered"
            );
            return None;
        }
        let handle = self.attach(&channel);
        info!(target: "call::registry", label = handle.label(), "remote data channel registered");
        Some(handle)
    }

    /// Unregisters and releases every channel the transport reports as
    /// `Closed`. Returns the labels that were removed.
    pub async fn remove_closed(&mut self) -> Vec<String> {
        let closed: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, handle)| handle.state() == ChannelState::Closed)
            .map(|(label, _)| label.clone())
            .collect();

        for label in &closed {
            if let Some(handle) = self.channels.remove(label) {
                debug!(target: "call::registry", label = %label, "removing closed channel");
                self.release(&handle).await;
            }
        }
        closed
    }

    /// Releases every known channel regardless of state.
    pub async fn close_all(&mut self) {
        let handles: Vec<ChannelHandle> = self.channels.drain().map(|(_, handle)| handle).collect();
        if !handles.is_empty() {
            debug!(target: "call::registry", count = handles.len(), "closing all channels");
        }
        for handle in &handles {
            self.release(handle).await;
        }
    }

    fn attach(&mut self, channel: &Arc<dyn DataChannel>) -> ChannelHandle {
        let label = channel.label().to_string();

        let events = Arc::clone(&self.events);
        let state_label = label.clone();
        channel.observe_state(Arc::new(move |state| {
            events.state_changed(&state_label, state);
        }));

        let events = Arc::clone(&self.events);
        let message_label = label.clone();
        channel.observe_messages(Arc::new(move |payload| {
            events.message_received(&message_label, payload);
        }));

        let handle = ChannelHandle::new(channel);
        self.channels.insert(label, handle.clone());
        handle
    }

    // A channel that refuses to be released is as good as gone from here.
    async fn release(&self, handle: &ChannelHandle) {
        let Some(channel) = handle.upgrade() else {
            return;
        };
        if let Err(err) = self.transport.close_channel(&channel).await {
            warn!(
                target: "call::registry",
                label = handle.label(),
                error = %err,
                "failed to release channel"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockPeerTransport;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorded {
        states: Mutex<Vec<(String, ChannelState)>>,
        messages: Mutex<Vec<(String, Bytes)>>,
    }

    impl ChannelEvents for Recorded {
        fn state_changed(&self, label: &str, state: ChannelState) {
            self.states.lock().push((label.to_string(), state));
        }

        fn message_received(&self, label: &str, payload: Bytes) {
            self.messages.lock().push((label.to_string(), payload));
        }
    }

    fn registry() -> (Arc<MockPeerTransport>, Arc<Recorded>, ChannelRegistry) {
        let transport = Arc::new(MockPeerTransport::new());
        let events = Arc::new(Recorded::default());
        let registry = ChannelRegistry::new(transport.clone(), events.clone());
        (transport, events, registry)
    }

    #[tokio::test]
    async fn get_or_create_reuses_existing_label() {
        let (transport, _, mut registry) = registry();

        let first = registry.get_or_create("clicks", true, true).await.expect("create");
        assert!(matches!(first, Lookup::Created(_)));
        let second = registry.get_or_create("clicks", false, false).await.expect("lookup");
        assert!(matches!(second, Lookup::Existing(_)));
        assert_eq!(first.handle(), second.handle());
        assert_eq!(transport.open_requests(), vec!["clicks".to_string()]);
        assert!(second.handle().ordered() && second.handle().reliable());
    }

    #[tokio::test]
    async fn get_or_create_without_session_is_not_connected() {
        let (transport, _, mut registry) = registry();
        transport.set_ready(false);

        let err = registry.get_or_create("clicks", true, true).await.unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected));
        assert!(transport.open_requests().is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn creation_failures_are_reported_per_label() {
        let (transport, _, mut registry) = registry();
        transport.fail_open("broken");
        transport.yield_no_channel("ghost");

        let err = registry.get_or_create("broken", true, true).await.unwrap_err();
        assert!(matches!(err, ChannelError::CreationFailed { ref label, .. } if label == "broken"));
        let err = registry.get_or_create("ghost", true, true).await.unwrap_err();
        assert!(matches!(err, ChannelError::CreationFailed { ref label, .. } if label == "ghost"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn observers_forward_channel_notifications() {
        let (transport, events, mut registry) = registry();
        registry.get_or_create("axis", false, false).await.expect("create");

        let channel = transport.channel("axis").expect("mock channel");
        channel.set_state(ChannelState::Open);
        channel.deliver(Bytes::from_static(b"{}"));

        assert_eq!(
            events.states.lock().clone(),
            vec![("axis".to_string(), ChannelState::Open)]
        );
        assert_eq!(events.messages.lock()[0].1, Bytes::from_static(b"{}"));
    }

    #[tokio::test]
    async fn remove_closed_only_drops_closed_channels() {
        let (transport, _, mut registry) = registry();
        registry.get_or_create("open", true, true).await.expect("create");
        registry.get_or_create("gone", true, true).await.expect("create");
        transport.channel("open").unwrap().set_state(ChannelState::Open);
        transport.channel("gone").unwrap().set_state(ChannelState::Closed);

        let removed = registry.remove_closed().await;
        assert_eq!(removed, vec!["gone".to_string()]);
        assert_eq!(registry.labels(), vec!["open".to_string()]);
        assert_eq!(transport.released(), vec!["gone".to_string()]);

        assert!(registry.remove_closed().await.is_empty());
    }

    #[tokio::test]
    async fn release_failures_do_not_keep_channels_registered() {
        let (transport, _, mut registry) = registry();
        registry.get_or_create("a", true, true).await.expect("create");
        registry.get_or_create("b", false, false).await.expect("create");
        transport.fail_releases(true);

        registry.close_all().await;
        assert!(registry.is_empty());
        assert!(transport.released().is_empty());
    }

    #[tokio::test]
    async fn remote_channels_register_once() {
        let (transport, _, mut registry) = registry();
        let remote = transport.add_remote_channel("remote", true, true);

        let handle = registry.register_remote(remote.clone()).expect("registered");
        assert_eq!(handle.label(), "remote");
        assert!(registry.register_remote(remote).is_none());
        assert!(registry.resolve(&handle).is_some());
    }
}
