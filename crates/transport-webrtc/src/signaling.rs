use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling channel closed")]
    Closed,
    #[error("not a session description")]
    NotDescription,
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid ice candidate: {0}")]
    InvalidCandidate(String),
    #[error("signaling codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// SDP and ICE exchange between the two peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },
}

impl SignalingMessage {
    pub fn from_offer(desc: &RTCSessionDescription) -> Self {
        SignalingMessage::Offer {
            sdp: desc.sdp.clone(),
        }
    }

    pub fn from_answer(desc: &RTCSessionDescription) -> Self {
        SignalingMessage::Answer {
            sdp: desc.sdp.clone(),
        }
    }

    pub fn from_ice_candidate(candidate: &RTCIceCandidate) -> Result<Self, SignalingError> {
        let init = candidate
            .to_json()
            .map_err(|err| SignalingError::InvalidCandidate(err.to_string()))?;
        Ok(SignalingMessage::IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        })
    }

    pub fn to_session_description(&self) -> Result<RTCSessionDescription, SignalingError> {
        let desc = match self {
            SignalingMessage::Offer { sdp } => RTCSessionDescription::offer(sdp.clone()),
            SignalingMessage::Answer { sdp } => RTCSessionDescription::answer(sdp.clone()),
            SignalingMessage::IceCandidate { .. } => return Err(SignalingError::NotDescription),
        };
        desc.map_err(|err| SignalingError::InvalidDescription(err.to_string()))
    }

    pub fn to_candidate_init(&self) -> Option<RTCIceCandidateInit> {
        match self {
            SignalingMessage::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => Some(RTCIceCandidateInit {
                candidate: candidate.clone(),
                sdp_mid: sdp_mid.clone(),
                sdp_mline_index: *sdp_mline_index,
                username_fragment: None,
            }),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice_candidate",
        }
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, SignalingError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Carries signaling messages to the remote peer.
#[async_trait]
pub trait Signaling: Send + Sync {
    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError>;

    /// Next message from the remote peer; `None` once the channel is gone.
    async fn recv(&self) -> Option<SignalingMessage>;
}

/// In-process signaling for two peers living in the same process.
#[derive(Clone)]
pub struct LocalSignalingChannel {
    tx: mpsc::UnboundedSender<SignalingMessage>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<SignalingMessage>>>,
}

impl LocalSignalingChannel {
    pub fn create_pair() -> (Self, Self) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();

        let first = Self {
            tx: tx2,
            rx: Arc::new(AsyncMutex::new(rx1)),
        };
        let second = Self {
            tx: tx1,
            rx: Arc::new(AsyncMutex::new(rx2)),
        };
        (first, second)
    }
}

#[async_trait]
impl Signaling for LocalSignalingChannel {
    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        self.tx.send(message).map_err(|_| SignalingError::Closed)
    }

    async fn recv(&self) -> Option<SignalingMessage> {
        self.rx.lock().await.recv().await
    }
}
