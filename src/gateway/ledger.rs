//! Append-only message history with per-entry delivery status.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageStatus {
    /// Inbound text heard from the mesh.
    Received,
    /// Local send issued, awaiting the device.
    Pending,
    /// The device queued the packet for transmission.
    Sent,
    Acknowledged,
    TimedOut,
    /// A routing error was reported or the device link rejected the write.
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageStatus::Received
                | MessageStatus::Acknowledged
                | MessageStatus::TimedOut
                | MessageStatus::Failed
        )
    }

    fn can_become(self, next: MessageStatus) -> bool {
        !self.is_terminal() && self != next && !(self == MessageStatus::Sent && next == MessageStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    pub channel: u32,
    /// `!hex` node id of the sender, or the local node for outbound messages.
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub text: String,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_id: Option<u32>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
}

/// Ordered message log shared by the ingestion and client-command contexts.
#[derive(Debug, Default)]
pub struct MessageLedger {
    entries: Mutex<Vec<ChannelMessage>>,
}

impl MessageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ChannelMessage>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append and return a copy of the stored entry.
    pub fn append(&self, message: ChannelMessage) -> ChannelMessage {
        self.lock().push(message.clone());
        message
    }

    /// Transition the most recent outbound entry carrying `packet_id`.
    ///
    /// Inbound entries keep the remote sender's packet id, which may collide with
    /// a local one, so they are never matched. Returns the updated entry, or `None`
    /// when there is no such entry or it is already terminal (repeat reports are
    /// harmless).
    pub fn mark_status(
        &self,
        packet_id: u32,
        status: MessageStatus,
        reason: Option<String>,
    ) -> Option<ChannelMessage> {
        let mut entries = self.lock();
        let entry = entries
            .iter_mut()
            .rev()
            .find(|m| m.packet_id == Some(packet_id) && m.status != MessageStatus::Received)?;
        if !entry.status.can_become(status) {
            return None;
        }
        entry.status = status;
        entry.status_reason = reason;
        Some(entry.clone())
    }

    /// Entire ordered history.
    pub fn snapshot(&self) -> Vec<ChannelMessage> {
        self.lock().clone()
    }

    pub fn for_channel(&self, channel: u32) -> Vec<ChannelMessage> {
        self.lock()
            .iter()
            .filter(|m| m.channel == channel)
            .cloned()
            .collect()
    }

    /// History grouped by channel index, each group in append order.
    pub fn grouped(&self) -> BTreeMap<u32, Vec<ChannelMessage>> {
        let mut out: BTreeMap<u32, Vec<ChannelMessage>> = BTreeMap::new();
        for m in self.lock().iter() {
            out.entry(m.channel).or_default().push(m.clone());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
