use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;

const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
const LOCALHOST_ONLY_ENV: &str = "CALL_LOCALHOST_ONLY";

/// ICE settings for [`WebRtcPeerTransport`](crate::WebRtcPeerTransport).
#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    pub ice_server_urls: Vec<String>,
    /// Overrides for the ICE agent's disconnected timeout, failed timeout
    /// and keepalive interval.
    pub disconnected_timeout: Option<Duration>,
    pub failed_timeout: Option<Duration>,
    pub keepalive_interval: Option<Duration>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        let ice_server_urls = if std::env::var(LOCALHOST_ONLY_ENV).is_ok() {
            Vec::new()
        } else {
            vec![DEFAULT_STUN_URL.to_string()]
        };
        Self {
            ice_server_urls,
            disconnected_timeout: None,
            failed_timeout: None,
            keepalive_interval: None,
        }
    }
}

impl WebRtcConfig {
    /// Host candidates only, with short ICE timeouts.
    pub fn localhost() -> Self {
        Self {
            ice_server_urls: Vec::new(),
            disconnected_timeout: Some(Duration::from_secs(2)),
            failed_timeout: Some(Duration::from_secs(4)),
            keepalive_interval: Some(Duration::from_millis(500)),
        }
    }

    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        if self.ice_server_urls.is_empty() {
            return Vec::new();
        }
        vec![RTCIceServer {
            urls: self.ice_server_urls.clone(),
            ..Default::default()
        }]
    }

    pub(crate) fn has_ice_timeouts(&self) -> bool {
        self.disconnected_timeout.is_some()
            || self.failed_timeout.is_some()
            || self.keepalive_interval.is_some()
    }
}
