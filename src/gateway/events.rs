//! Normalized event feed published to clients.

use super::ledger::{ChannelMessage, MessageStatus};
use super::node::NodeRecord;
use super::transport::ChannelDescriptor;
use log::warn;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Mutex;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckNotice {
    pub packet_id: u32,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// `!hex` id of the attached radio, when it reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub my_node: Option<String>,
    pub channel_count: usize,
    pub node_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionFault {
    pub message: String,
}

/// One entry of the event stream. Serialized as `{"event": kind, "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum GatewayEvent {
    /// Full record after a merge that changed something.
    NodeUpdated(NodeRecord),
    NewMessage(ChannelMessage),
    MessageAck(AckNotice),
    ChannelList(Vec<ChannelDescriptor>),
    ConnectionEstablished(ConnectionInfo),
    ConnectionError(ConnectionFault),
}

impl GatewayEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayEvent::NodeUpdated(_) => "nodeUpdated",
            GatewayEvent::NewMessage(_) => "newMessage",
            GatewayEvent::MessageAck(_) => "messageAck",
            GatewayEvent::ChannelList(_) => "channelList",
            GatewayEvent::ConnectionEstablished(_) => "connectionEstablished",
            GatewayEvent::ConnectionError(_) => "connectionError",
        }
    }

    pub fn ack(packet_id: u32, status: MessageStatus, reason: Option<String>) -> Self {
        GatewayEvent::MessageAck(AckNotice {
            packet_id,
            status,
            reason,
        })
    }
}

/// Publish target. Implementations must not call back into the gateway.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: GatewayEvent);
}

impl EventSink for broadcast::Sender<GatewayEvent> {
    fn publish(&self, event: GatewayEvent) {
        // No subscribers is fine; events are not buffered for late clients.
        let _ = self.send(event);
    }
}

/// Writes every event as one JSON line.
pub struct JsonLinesSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|p| p.into_inner())
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn publish(&self, event: GatewayEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Dropping {} event: {}", event.kind(), e);
                return;
            }
        };
        let mut out = self.out.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            warn!("Event output failed: {}", e);
        }
    }
}
