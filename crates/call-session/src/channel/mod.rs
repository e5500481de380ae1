use std::fmt;
use std::sync::{Arc, Weak};

use crate::transport::{ChannelState, DataChannel};

pub mod pending;
pub mod registry;

pub use pending::{DrainReport, PendingQueue};
pub use registry::{ChannelEvents, ChannelRegistry, Lookup};

/// Non-owning reference to a transport channel, keyed by label.
#[derive(Clone)]
pub struct ChannelHandle {
    label: Arc<str>,
    ordered: bool,
    reliable: bool,
    channel: Weak<dyn DataChannel>,
}

impl ChannelHandle {
    pub fn new(channel: &Arc<dyn DataChannel>) -> Self {
        Self {
            label: Arc::from(channel.label()),
            ordered: channel.ordered(),
            reliable: channel.reliable(),
            channel: Arc::downgrade(channel),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn ordered(&self) -> bool {
        self.ordered
    }

    pub fn reliable(&self) -> bool {
        self.reliable
    }

    /// Current transport-reported state. A channel the transport already
    /// dropped reads as `Closed`.
    pub fn state(&self) -> ChannelState {
        self.upgrade()
            .map(|channel| channel.state())
            .unwrap_or(ChannelState::Closed)
    }

    pub fn upgrade(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.upgrade()
    }

    pub fn same_channel(&self, other: &ChannelHandle) -> bool {
        self.label == other.label && Weak::ptr_eq(&self.channel, &other.channel)
    }
}

impl PartialEq for ChannelHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_channel(other)
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("label", &self.label)
            .field("ordered", &self.ordered)
            .field("reliable", &self.reliable)
            .field("state", &self.state())
            .finish()
    }
}

/// Send target: a channel label or a handle obtained earlier.
#[derive(Debug, Clone)]
pub enum ChannelRef {
    Label(String),
    Handle(ChannelHandle),
}

impl ChannelRef {
    pub fn label(&self) -> &str {
        match self {
            ChannelRef::Label(label) => label,
            ChannelRef::Handle(handle) => handle.label(),
        }
    }
}

impl From<&str> for ChannelRef {
    fn from(label: &str) -> Self {
        ChannelRef::Label(label.to_string())
    }
}

impl From<String> for ChannelRef {
    fn from(label: String) -> Self {
        ChannelRef::Label(label)
    }
}

impl From<ChannelHandle> for ChannelRef {
    fn from(handle: ChannelHandle) -> Self {
        ChannelRef::Handle(handle)
    }
}

impl From<&ChannelHandle> for ChannelRef {
    fn from(handle: &ChannelHandle) -> Self {
        ChannelRef::Handle(handle.clone())
    }
}
