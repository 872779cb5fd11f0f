//! The device side of the gateway: what a radio link delivers and what it accepts.

use super::error::GatewayResult;
use super::node::{NodeId, NodeUpdate};
use super::packet::RawPacket;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    #[default]
    Disabled,
    Primary,
    Secondary,
}

/// One configured radio channel as reported by the device at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDescriptor {
    pub index: u32,
    pub name: String,
    pub role: ChannelRole,
}

impl ChannelDescriptor {
    /// Display name; unnamed primary channels show as the preset default.
    pub fn display_name(&self) -> String {
        match (self.name.trim(), self.role) {
            ("", ChannelRole::Primary) => "Primary".to_string(),
            ("", _) => format!("Channel {}", self.index),
            (name, _) => name.to_string(),
        }
    }
}

/// Everything the device reported during its configuration dump.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionSnapshot {
    pub my_node: Option<NodeId>,
    pub channels: Vec<ChannelDescriptor>,
    pub nodes: Vec<(NodeId, NodeUpdate)>,
}

/// Events flowing from a device link into the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A mesh packet heard by the radio.
    Packet(RawPacket),
    /// The device finished its configuration dump.
    Connected(ConnectionSnapshot),
    /// A node database entry reported outside the initial dump.
    NodeInfo(NodeId, NodeUpdate),
    /// The device accepted an outbound packet into its transmit queue.
    Queued(u32),
    /// The link failed; no further events follow from this link.
    Error(String),
}

/// Outbound half of a device link.
///
/// Writes are small and synchronous, matching how serial writes are issued. Packet
/// ids are allocated by the gateway so an ack can be registered before the write.
pub trait DeviceLink: Send + Sync {
    fn send_text(&self, packet_id: u32, text: &str, channel: u32) -> GatewayResult<()>;

    /// Stop the link. Its event channel closes once the reader exits.
    fn close(&self);
}
