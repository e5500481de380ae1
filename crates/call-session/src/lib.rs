//! Call session controller for a single peer-to-peer data call.
//!
//! Responsibilities:
//! - starting and hanging up calls over an external peer transport
//! - provisioning ordered/unordered data channels by label
//! - buffering outbound messages until their channel opens
//! - enforcing the call-establishment timeout and recycling the transport
//!
//! All session state lives on one serial task queue; transport callbacks
//! are marshalled onto it before they touch anything.

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use channel::{ChannelHandle, ChannelRef};
pub use config::CallConfig;
pub use error::{CallError, ChannelError, SendError, TransportError};
pub use events::CallEvent;
pub use session::{CallController, CallControllerBuilder, CallPhase, Delivery, SessionStatus};
pub use transport::{
    CameraSource, ChannelState, ConnectMode, ConnectionState, DataChannel, GatheringState,
    PeerTransport, TransportEvent,
};
