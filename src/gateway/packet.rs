//! Raw inbound packet shape.
//!
//! Mirrors the dictionary form Meshtastic client libraries produce (camelCase keys,
//! every field optional). Packets decoded from the serial protobuf stream are
//! converted into the same shape so extraction never cares where a packet came from.

use super::error::{GatewayError, GatewayResult};
use super::node::{NodeRef, Position, Telemetry, User};
use crate::protobuf::meshtastic_generated as proto;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A protobuf enum value given either by number or by its symbolic name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnumValue {
    Num(i32),
    Name(String),
}

impl EnumValue {
    pub fn port(&self) -> Option<proto::PortNum> {
        match self {
            EnumValue::Num(n) => proto::PortNum::try_from(*n).ok(),
            EnumValue::Name(s) => proto::PortNum::from_str_name(s.trim()),
        }
    }

    pub fn routing_error(&self) -> Option<proto::routing::Error> {
        match self {
            EnumValue::Num(n) => proto::routing::Error::try_from(*n).ok(),
            EnumValue::Name(s) => proto::routing::Error::from_str_name(s.trim()),
        }
    }

    pub fn is_ack_priority(&self) -> bool {
        match self {
            EnumValue::Num(n) => *n == proto::mesh_packet::Priority::Ack as i32,
            EnumValue::Name(s) => s.trim().eq_ignore_ascii_case("ACK"),
        }
    }
}

impl fmt::Display for EnumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnumValue::Num(n) => write!(f, "{}", n),
            EnumValue::Name(s) => f.write_str(s),
        }
    }
}

/// Binary payload: a byte array, or base64 text as JSON dumps carry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Bytes(Vec<u8>),
    Base64(String),
}

impl Payload {
    pub fn to_bytes(&self) -> GatewayResult<Vec<u8>> {
        match self {
            Payload::Bytes(b) => Ok(b.clone()),
            Payload::Base64(s) => B64
                .decode(s.trim())
                .map_err(|e| GatewayError::MalformedPacket(format!("payload is not base64: {}", e))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoutingInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<EnumValue>,
}

/// Decoded application payload. Structured fields take precedence over `payload`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Decoded {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portnum: Option<EnumValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<Telemetry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawPacket {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<NodeRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<NodeRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_snr: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_rssi: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hop_limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hop_start: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via_mqtt: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_node: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<EnumValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded: Option<Decoded>,
}

impl RawPacket {
    pub fn from_json(line: &str) -> GatewayResult<Self> {
        serde_json::from_str(line).map_err(|e| GatewayError::MalformedPacket(e.to_string()))
    }

    /// Originating node reference, preferring the numeric `from` field.
    pub fn sender(&self) -> Option<NodeRef> {
        self.from
            .clone()
            .or_else(|| self.from_id.clone().map(NodeRef::Name))
    }

    pub fn portnum(&self) -> Option<&EnumValue> {
        self.decoded.as_ref().and_then(|d| d.portnum.as_ref())
    }

    /// Channel index from the packet envelope or the decoded body, default 0.
    pub fn channel_index(&self) -> u32 {
        self.channel
            .or_else(|| self.decoded.as_ref().and_then(|d| d.channel))
            .unwrap_or(0)
    }

    /// Convert a protobuf mesh packet, keeping only fields the firmware actually set.
    pub fn from_mesh_packet(pkt: &proto::MeshPacket) -> Self {
        use proto::mesh_packet::PayloadVariant;

        let nonzero = |v: u32| (v != 0).then_some(v);
        let mut raw = RawPacket {
            from: Some(NodeRef::Num(pkt.from)),
            to: Some(NodeRef::Num(pkt.to)),
            id: nonzero(pkt.id),
            channel: Some(pkt.channel),
            rx_time: nonzero(pkt.rx_time).map(i64::from),
            rx_snr: (pkt.rx_snr != 0.0).then_some(pkt.rx_snr),
            rx_rssi: (pkt.rx_rssi != 0).then_some(pkt.rx_rssi),
            hop_limit: Some(pkt.hop_limit),
            hop_start: nonzero(pkt.hop_start),
            via_mqtt: Some(pkt.via_mqtt),
            relay_node: nonzero(pkt.relay_node),
            priority: (pkt.priority != 0).then_some(EnumValue::Num(pkt.priority)),
            ..Default::default()
        };
        match &pkt.payload_variant {
            Some(PayloadVariant::Decoded(data)) => {
                raw.decoded = Some(Decoded {
                    portnum: Some(EnumValue::Num(data.portnum)),
                    payload: Some(Payload::Bytes(data.payload.to_vec())),
                    request_id: nonzero(data.request_id),
                    reply_id: nonzero(data.reply_id),
                    ..Default::default()
                });
            }
            Some(PayloadVariant::Encrypted(bytes)) => {
                raw.encrypted = Some(Payload::Bytes(bytes.to_vec()));
            }
            None => {}
        }
        raw
    }
}
