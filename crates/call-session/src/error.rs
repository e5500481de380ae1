use std::fmt;

use thiserror::Error;

use crate::transport::ChannelState;

/// Errors reported by a [`PeerTransport`](crate::transport::PeerTransport)
/// implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("no active peer session")]
    NoSession,
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("non-fatal transport issue: {0}")]
    NonFatal(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("failed to release channel {label}: {reason}")]
    Release { label: String, reason: String },
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Non-fatal connect issues may be suppressed by configuration.
    pub fn is_non_fatal(&self) -> bool {
        matches!(self, TransportError::NonFatal(_))
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no active peer session")]
    NotConnected,
    #[error("failed to open data channel {label}: {source}")]
    CreationFailed {
        label: String,
        #[source]
        source: TransportError,
    },
    #[error("call controller stopped")]
    ControllerStopped,
}

/// Why a send target cannot accept messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailable {
    Unknown,
    Closing,
    Closed,
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unavailable::Unknown => f.write_str("not registered"),
            Unavailable::Closing => f.write_str("closing"),
            Unavailable::Closed => f.write_str("closed"),
        }
    }
}

impl From<ChannelState> for Unavailable {
    fn from(state: ChannelState) -> Self {
        match state {
            ChannelState::Closing => Unavailable::Closing,
            _ => Unavailable::Closed,
        }
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("no active peer session")]
    NotConnected,
    #[error("channel {label} is unavailable ({reason})")]
    ChannelUnavailable { label: String, reason: Unavailable },
    #[error("failed to send on channel {label}: {source}")]
    SendFailed {
        label: String,
        #[source]
        source: TransportError,
    },
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("call controller stopped")]
    ControllerStopped,
}

/// Failure taxonomy of the call lifecycle. Nothing here escapes the
/// controller; these values end up in logs and in call-failed decisions.
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] TransportError),
    #[error("transport reported an error: {0}")]
    TransportFault(String),
    #[error("no connected notification within {seconds:.1}s")]
    Timeout { seconds: f32 },
    #[error("call controller stopped")]
    ControllerStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_non_fatal_variant_is_suppressible() {
        assert!(TransportError::NonFatal("late candidate".into()).is_non_fatal());
        assert!(!TransportError::Setup("sdp".into()).is_non_fatal());
        assert!(!TransportError::NoSession.is_non_fatal());
    }

    #[test]
    fn unavailable_reason_follows_channel_state() {
        assert_eq!(Unavailable::from(ChannelState::Closing), Unavailable::Closing);
        assert_eq!(Unavailable::from(ChannelState::Closed), Unavailable::Closed);
        let err = SendError::ChannelUnavailable {
            label: "axis".into(),
            reason: Unavailable::Closing,
        };
        assert_eq!(err.to_string(), "channel axis is unavailable (closing)");
    }
}
