//! WebRTC implementation of the call session's peer transport.
//!
//! [`WebRtcPeerTransport`] drives one webrtc-rs peer connection at a time and
//! exchanges SDP/ICE over any [`Signaling`] implementation.
//! [`LocalSignalingChannel`] pairs two transports inside one process.

pub mod channel;
pub mod config;
mod peer;
pub mod signaling;

pub use channel::WebRtcDataChannel;
pub use config::WebRtcConfig;
pub use peer::WebRtcPeerTransport;
pub use signaling::{LocalSignalingChannel, Signaling, SignalingError, SignalingMessage};
