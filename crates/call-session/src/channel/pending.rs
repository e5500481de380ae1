use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::ChannelHandle;
use crate::transport::ChannelState;

#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub channel: ChannelHandle,
    pub payload: Bytes,
}

/// Outcome of one pass over the queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub failed: usize,
    pub dropped: usize,
    pub retained: usize,
}

/// Messages waiting for their channel to leave `Connecting`.
#[derive(Debug, Default)]
pub struct PendingQueue {
    messages: VecDeque<PendingMessage>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, channel: ChannelHandle, payload: Bytes) {
        trace!(
            target: "call::pending",
            label = channel.label(),
            payload_len = payload.len(),
            queued = self.messages.len() + 1,
            "queueing message until channel opens"
        );
        self.messages.push_back(PendingMessage { channel, payload });
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn labels(&self) -> Vec<String> {
        self.messages
            .iter()
            .map(|message| message.channel.label().to_string())
            .collect()
    }

    /// Discards everything. Returns how many messages were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.messages.len();
        self.messages.clear();
        dropped
    }

    /// Drops messages bound to channels that were unregistered.
    pub fn purge(&mut self, labels: &[String]) -> usize {
        if labels.is_empty() {
            return 0;
        }
        let before = self.messages.len();
        self.messages
            .retain(|message| !labels.iter().any(|label| label == message.channel.label()));
        before - self.messages.len()
    }

    /// Walks the current queue once, sending whatever can go out now.
    /// Entries for open channels leave the queue even if the send fails.
    pub async fn drain(&mut self) -> DrainReport {
        let mut report = DrainReport::default();
        if self.messages.is_empty() {
            return report;
        }

        let snapshot = std::mem::take(&mut self.messages);
        for message in snapshot {
            let Some(channel) = message.channel.upgrade() else {
                debug!(
                    target: "call::pending",
                    label = message.channel.label(),
                    "dropping message for vanished channel"
                );
                report.dropped += 1;
                continue;
            };

            match channel.state() {
                ChannelState::Connecting => {
                    self.messages.push_back(message);
                    report.retained += 1;
                }
                ChannelState::Open => {
                    debug!(
                        target: "call::pending",
                        label = message.channel.label(),
                        payload_len = message.payload.len(),
                        "dispatching pending message"
                    );
                    match channel.send(message.payload).await {
                        Ok(()) => report.sent += 1,
                        Err(err) => {
                            warn!(
                                target: "call::pending",
                                label = message.channel.label(),
                                error = %err,
                                "unable to send pending message"
                            );
                            report.failed += 1;
                        }
                    }
                }
                ChannelState::Closing | ChannelState::Closed => {
                    trace!(
                        target: "call::pending",
                        label = message.channel.label(),
                        "dropping message for closing channel"
                    );
                    report.dropped += 1;
                }
            }
        }
        report
    }
}
