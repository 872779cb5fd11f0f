//! # Meshtastic serial device link
//!
//! Connects the gateway to a Meshtastic radio over USB/UART.
//!
//! On open the link asks the device for its configuration (`want_config_id`),
//! collects `MyNodeInfo`, node database entries and channels until the matching
//! `config_complete_id`, then reports a single [`DeviceEvent::Connected`]. After
//! that every mesh packet is converted to a [`RawPacket`] and forwarded. A
//! heartbeat keeps the device's serial API session alive.
//!
//! ```rust,no_run
//! use meshgate::config::MeshtasticConfig;
//! use meshgate::gateway::{Gateway, GatewaySettings};
//! use meshgate::meshtastic::SerialLink;
//! use std::sync::Arc;
//!
//! # async fn run(sink: Arc<dyn meshgate::gateway::EventSink>) -> anyhow::Result<()> {
//! let gateway = Gateway::new(GatewaySettings::default(), sink);
//! let (tx, rx) = gateway.event_channel();
//! let link = SerialLink::open(&MeshtasticConfig::default(), tx).await?;
//! gateway.attach(link, rx);
//! # Ok(())
//! # }
//! ```

pub mod framer;

use crate::gateway::extract::node_info_update;
use crate::gateway::{ChannelDescriptor, ChannelRole, ConnectionSnapshot, DeviceEvent, NodeId, NodeUpdate, RawPacket};
use crate::logutil::hex_snippet;
use crate::protobuf::meshtastic_generated as proto;
use log::{debug, trace, warn};
use prost::Message;

/// Broadcast destination address.
pub const BROADCAST_ADDR: u32 = 0xffff_ffff;
const DEFAULT_HOP_LIMIT: u32 = 3;

/// Protocol state for one device session, independent of the byte transport.
#[derive(Debug)]
pub struct RadioSession {
    config_id: u32,
    connected: bool,
    needs_config: bool,
    my_node: Option<NodeId>,
    channels: Vec<ChannelDescriptor>,
    nodes: Vec<(NodeId, NodeUpdate)>,
}

impl RadioSession {
    pub fn new(config_id: u32) -> Self {
        Self {
            config_id,
            connected: false,
            needs_config: false,
            my_node: None,
            channels: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn want_config(&self) -> proto::ToRadio {
        proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::WantConfigId(self.config_id)),
        }
    }

    /// True once after the device rebooted and needs a fresh config request.
    pub fn take_reconfigure(&mut self) -> bool {
        std::mem::take(&mut self.needs_config)
    }

    /// Decode one frame. Frames that are not `FromRadio` are logged and skipped.
    pub fn on_frame(&mut self, frame: &[u8]) -> Option<DeviceEvent> {
        match proto::FromRadio::decode(frame) {
            Ok(msg) => self.on_from_radio(msg),
            Err(e) => {
                debug!("Undecodable frame ({}): {}", e, hex_snippet(frame, 32));
                None
            }
        }
    }

    pub fn on_from_radio(&mut self, msg: proto::FromRadio) -> Option<DeviceEvent> {
        use proto::from_radio::PayloadVariant as FR;
        match msg.payload_variant? {
            FR::Packet(pkt) => Some(DeviceEvent::Packet(RawPacket::from_mesh_packet(&pkt))),
            FR::MyInfo(info) => {
                debug!("Device node number 0x{:08x}", info.my_node_num);
                self.my_node = Some(NodeId(info.my_node_num));
                None
            }
            FR::NodeInfo(info) => {
                let (id, update) = node_info_update(&info);
                if self.connected {
                    Some(DeviceEvent::NodeInfo(id, update))
                } else {
                    self.nodes.push((id, update));
                    None
                }
            }
            FR::Channel(ch) => {
                if let Some(desc) = channel_descriptor(&ch) {
                    self.channels.retain(|c| c.index != desc.index);
                    self.channels.push(desc);
                    self.channels.sort_by_key(|c| c.index);
                }
                None
            }
            FR::ConfigCompleteId(id) if id == self.config_id && !self.connected => {
                self.connected = true;
                Some(DeviceEvent::Connected(ConnectionSnapshot {
                    my_node: self.my_node,
                    channels: std::mem::take(&mut self.channels),
                    nodes: std::mem::take(&mut self.nodes),
                }))
            }
            FR::ConfigCompleteId(id) => {
                trace!("Ignoring config_complete_id 0x{:08x}", id);
                None
            }
            FR::QueueStatus(qs) => {
                if qs.mesh_packet_id == 0 {
                    return None;
                }
                if qs.res != 0 {
                    warn!(
                        "Device refused packet 0x{:08x} (res={}, free={}/{})",
                        qs.mesh_packet_id, qs.res, qs.free, qs.maxlen
                    );
                    return None;
                }
                Some(DeviceEvent::Queued(qs.mesh_packet_id))
            }
            FR::Rebooted(_) => {
                warn!("Device rebooted; requesting configuration again");
                self.connected = false;
                self.needs_config = true;
                None
            }
        }
    }
}

fn channel_descriptor(ch: &proto::Channel) -> Option<ChannelDescriptor> {
    let index = u32::try_from(ch.index).ok()?;
    let role = match proto::channel::Role::try_from(ch.role) {
        Ok(proto::channel::Role::Primary) => ChannelRole::Primary,
        Ok(proto::channel::Role::Secondary) => ChannelRole::Secondary,
        _ => ChannelRole::Disabled,
    };
    Some(ChannelDescriptor {
        index,
        name: ch
            .settings
            .as_ref()
            .map(|s| s.name.trim().to_string())
            .unwrap_or_default(),
        role,
    })
}

/// Build the `ToRadio` for a broadcast text on `channel`, requesting an ack.
pub fn text_packet(packet_id: u32, text: &str, channel: u32) -> proto::ToRadio {
    use proto::mesh_packet::PayloadVariant as MP;
    let data = proto::Data {
        portnum: proto::PortNum::TextMessageApp as i32,
        payload: bytes::Bytes::copy_from_slice(text.as_bytes()),
        ..Default::default()
    };
    proto::ToRadio {
        payload_variant: Some(proto::to_radio::PayloadVariant::Packet(proto::MeshPacket {
            to: BROADCAST_ADDR,
            channel,
            id: packet_id,
            hop_limit: DEFAULT_HOP_LIMIT,
            want_ack: true,
            payload_variant: Some(MP::Decoded(data)),
            ..Default::default()
        })),
    }
}

pub fn heartbeat() -> proto::ToRadio {
    proto::ToRadio {
        payload_variant: Some(proto::to_radio::PayloadVariant::Heartbeat(proto::Heartbeat {})),
    }
}

#[cfg(feature = "serial")]
mod serial;
#[cfg(feature = "serial")]
pub use serial::SerialLink;
