use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

pub mod mock;

/// Lifecycle of a single data channel as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Connection-level (ICE) state of the peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

/// How a transport should treat non-fatal problems while connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectMode {
    Strict,
    #[default]
    IgnoreNonFatal,
}

/// Notifications a transport raises from its own execution context.
pub enum TransportEvent {
    ConnectionState(ConnectionState),
    GatheringState(GatheringState),
    /// A channel opened by the remote peer.
    ChannelAdded(Arc<dyn DataChannel>),
    /// The peer connection reported an error outside any call operation.
    Error(String),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::ConnectionState(state) => {
                f.debug_tuple("ConnectionState").field(state).finish()
            }
            TransportEvent::GatheringState(state) => {
                f.debug_tuple("GatheringState").field(state).finish()
            }
            TransportEvent::ChannelAdded(channel) => {
                f.debug_tuple("ChannelAdded").field(&channel.label()).finish()
            }
            TransportEvent::Error(message) => f.debug_tuple("Error").field(message).finish(),
        }
    }
}

pub type TransportEventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;
pub type ChannelStateObserver = Arc<dyn Fn(ChannelState) + Send + Sync>;
pub type ChannelMessageObserver = Arc<dyn Fn(Bytes) + Send + Sync>;

/// A labelled data stream multiplexed over the peer connection. Owned by
/// the transport; the session only keeps weak references.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn ordered(&self) -> bool;
    fn reliable(&self) -> bool;
    fn state(&self) -> ChannelState;

    /// Replaces the state-change observer. Invoked from the transport's
    /// execution context.
    fn observe_state(&self, observer: ChannelStateObserver);

    fn observe_messages(&self, observer: ChannelMessageObserver);

    async fn send(&self, payload: Bytes) -> Result<(), TransportError>;
}

/// The peer-connection primitive the session is built on.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Whether a peer session exists that channels can be opened on.
    fn is_ready(&self) -> bool;

    fn set_event_sink(&self, sink: TransportEventSink);

    async fn connect(&self, mode: ConnectMode) -> Result<(), TransportError>;

    /// Opens a channel. `Ok(None)` means the transport accepted the request
    /// but produced no channel.
    async fn open_channel(
        &self,
        label: &str,
        ordered: bool,
        reliable: bool,
    ) -> Result<Option<Arc<dyn DataChannel>>, TransportError>;

    async fn close_channel(&self, channel: &Arc<dyn DataChannel>) -> Result<(), TransportError>;

    /// Fully recycles the peer session. Once this returns the transport
    /// accepts a fresh `connect`.
    async fn hard_reset(&self) -> Result<(), TransportError>;

    fn set_local_video_enabled(&self, _enabled: bool) {}
}

/// Local camera feeding the call's video track. Only toggled while the
/// transport is being recycled.
pub trait CameraSource: Send + Sync {
    fn set_enabled(&self, enabled: bool) -> Result<(), TransportError>;
}
