//! Field extraction: raw packet × port kind → typed fields.
//!
//! Each handled port kind has its own variant. Structured (already decoded) fields
//! are used when present; otherwise the binary payload is decoded with prost into
//! the same shape, so callers never see which wire form a packet arrived in.

use super::error::{GatewayError, GatewayResult};
use super::node::{DeviceMetrics, Environment, NodeId, NodeUpdate, Position, Telemetry, User};
use super::packet::{EnumValue, RawPacket};
use crate::protobuf::meshtastic_generated as proto;
use prost::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Text,
    Position,
    NodeInfo,
    Telemetry,
    Routing,
    Admin,
}

impl PortKind {
    /// Map a declared port to a handled kind. Anything else is `UnknownPortKind`.
    pub fn classify(port: &EnumValue) -> GatewayResult<PortKind> {
        use proto::PortNum;
        match port.port() {
            Some(PortNum::TextMessageApp) => Ok(PortKind::Text),
            Some(PortNum::PositionApp) => Ok(PortKind::Position),
            Some(PortNum::NodeinfoApp) => Ok(PortKind::NodeInfo),
            Some(PortNum::TelemetryApp) => Ok(PortKind::Telemetry),
            Some(PortNum::RoutingApp) => Ok(PortKind::Routing),
            Some(PortNum::AdminApp) => Ok(PortKind::Admin),
            Some(other) => Err(GatewayError::UnknownPortKind(other.as_str_name().to_string())),
            None => Err(GatewayError::UnknownPortKind(port.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextFields {
    pub channel: u32,
    pub text: String,
    /// Unix seconds; receive time, or ingestion time when the device omitted it.
    pub timestamp: i64,
}

/// Correlation data carried by routing and admin replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckReport {
    pub packet_id: u32,
    /// Routing error name when the reply reports a failure.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    Text(TextFields),
    Position(Position),
    NodeInfo(User),
    Telemetry(Telemetry),
    Routing(AckReport),
    Admin(AckReport),
}

impl Extracted {
    /// Node-bearing part of the extraction, if this kind carries any.
    pub fn node_update(&self) -> Option<NodeUpdate> {
        match self {
            Extracted::Position(p) => Some(NodeUpdate {
                position: Some(p.clone()),
                ..Default::default()
            }),
            Extracted::NodeInfo(u) => Some(NodeUpdate {
                user: Some(u.clone()),
                ..Default::default()
            }),
            // Device metrics also land at the top level, where node database
            // snapshots put them, so both views agree.
            Extracted::Telemetry(t) => Some(NodeUpdate {
                device_metrics: t.device_metrics.clone(),
                telemetry: Some(t.clone()),
                ..Default::default()
            }),
            Extracted::Text(_) | Extracted::Routing(_) | Extracted::Admin(_) => None,
        }
    }
}

fn malformed(msg: impl Into<String>) -> GatewayError {
    GatewayError::MalformedPacket(msg.into())
}

fn payload_bytes(packet: &RawPacket) -> GatewayResult<Option<Vec<u8>>> {
    match packet.decoded.as_ref().and_then(|d| d.payload.as_ref()) {
        Some(p) => p.to_bytes().map(Some),
        None => Ok(None),
    }
}

fn decode_payload<M: Message + Default>(packet: &RawPacket, what: &str) -> GatewayResult<M> {
    let bytes = payload_bytes(packet)?.ok_or_else(|| malformed(format!("{} packet without payload", what)))?;
    M::decode(bytes.as_slice()).map_err(|e| malformed(format!("{} payload: {}", what, e)))
}

/// Extract the typed fields for `kind`. `now` is the ingestion time in unix seconds.
pub fn extract(packet: &RawPacket, kind: PortKind, now: i64) -> GatewayResult<Extracted> {
    let decoded = packet.decoded.clone().unwrap_or_default();
    match kind {
        PortKind::Text => {
            let text = match decoded.text {
                Some(t) => t,
                None => {
                    let bytes = payload_bytes(packet)?.ok_or_else(|| malformed("text packet without body"))?;
                    String::from_utf8(bytes).map_err(|_| malformed("text body is not UTF-8"))?
                }
            };
            Ok(Extracted::Text(TextFields {
                channel: packet.channel_index(),
                text,
                timestamp: packet.rx_time.filter(|t| *t > 0).unwrap_or(now),
            }))
        }
        PortKind::Position => {
            let mut position = match decoded.position {
                Some(p) => p,
                None => position_from_proto(&decode_payload::<proto::Position>(packet, "position")?),
            };
            normalize_position(&mut position)?;
            Ok(Extracted::Position(position))
        }
        PortKind::NodeInfo => {
            let user = match decoded.user {
                Some(u) => u,
                None => user_from_proto(&decode_payload::<proto::User>(packet, "nodeinfo")?),
            };
            Ok(Extracted::NodeInfo(user))
        }
        PortKind::Telemetry => {
            let mut telemetry = match decoded.telemetry {
                Some(t) => t,
                None => telemetry_from_proto(&decode_payload::<proto::Telemetry>(packet, "telemetry")?),
            };
            sanitize_telemetry(&mut telemetry);
            Ok(Extracted::Telemetry(telemetry))
        }
        PortKind::Routing => {
            let packet_id = correlation_id(packet).ok_or_else(|| malformed("routing reply without request id"))?;
            let error = match decoded.routing.and_then(|r| r.error_reason) {
                Some(reason) => routing_error_name(&reason),
                None => match payload_bytes(packet)? {
                    Some(bytes) => {
                        let routing = proto::Routing::decode(bytes.as_slice())
                            .map_err(|e| malformed(format!("routing payload: {}", e)))?;
                        match routing.variant {
                            Some(proto::routing::Variant::ErrorReason(code)) => {
                                routing_error_name(&EnumValue::Num(code))
                            }
                            _ => None,
                        }
                    }
                    None => None,
                },
            };
            Ok(Extracted::Routing(AckReport { packet_id, error }))
        }
        PortKind::Admin => {
            let packet_id = correlation_id(packet).ok_or_else(|| malformed("admin reply without request id"))?;
            Ok(Extracted::Admin(AckReport {
                packet_id,
                error: None,
            }))
        }
    }
}

/// `requestId`, falling back to `replyId`.
pub fn correlation_id(packet: &RawPacket) -> Option<u32> {
    let d = packet.decoded.as_ref()?;
    d.request_id.filter(|id| *id != 0).or(d.reply_id.filter(|id| *id != 0))
}

/// `None` for success, otherwise the error's symbolic name.
fn routing_error_name(reason: &EnumValue) -> Option<String> {
    match reason.routing_error() {
        Some(proto::routing::Error::None) => None,
        Some(e) => Some(e.as_str_name().to_string()),
        None => Some(format!("ERROR_{}", reason)),
    }
}

/// Drop non-finite coordinates, then fill in whichever coordinate form is missing.
pub fn normalize_position(p: &mut Position) -> GatewayResult<()> {
    p.latitude = p.latitude.filter(|v| v.is_finite());
    p.longitude = p.longitude.filter(|v| v.is_finite());

    if p.latitude.is_none() {
        p.latitude = p.latitude_int.map(|i| f64::from(i) / 1e7);
    }
    if p.longitude.is_none() {
        p.longitude = p.longitude_int.map(|i| f64::from(i) / 1e7);
    }
    if p.latitude_int.is_none() {
        p.latitude_int = p.latitude.map(|f| (f * 1e7).trunc() as i32);
    }
    if p.longitude_int.is_none() {
        p.longitude_int = p.longitude.map(|f| (f * 1e7).trunc() as i32);
    }

    if p.latitude.is_some_and(|v| !(-90.0..=90.0).contains(&v)) {
        return Err(malformed("latitude out of range"));
    }
    if p.longitude.is_some_and(|v| !(-180.0..=180.0).contains(&v)) {
        return Err(malformed("longitude out of range"));
    }
    Ok(())
}

fn finite(v: Option<f32>) -> Option<f32> {
    v.filter(|x| x.is_finite())
}

fn sanitize_telemetry(t: &mut Telemetry) {
    if let Some(dm) = t.device_metrics.as_mut() {
        dm.voltage = finite(dm.voltage);
        dm.channel_utilization = finite(dm.channel_utilization);
        dm.air_util_tx = finite(dm.air_util_tx);
    }
    if let Some(env) = t.environment.as_mut() {
        env.temperature = finite(env.temperature);
        env.relative_humidity = finite(env.relative_humidity);
        env.barometric_pressure = finite(env.barometric_pressure);
        env.gas_resistance = finite(env.gas_resistance);
        env.voltage = finite(env.voltage);
        env.current = finite(env.current);
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn nonzero(v: u32) -> Option<u32> {
    (v != 0).then_some(v)
}

pub fn user_from_proto(u: &proto::User) -> User {
    let mac = (!u.macaddr.is_empty()).then(|| {
        u.macaddr
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    });
    let hardware_model = (u.hw_model != 0).then(|| {
        proto::HardwareModel::try_from(u.hw_model)
            .map(|m| m.as_str_name().to_string())
            .unwrap_or_else(|_| u.hw_model.to_string())
    });
    let role = proto::DeviceRole::try_from(u.role)
        .map(|r| r.as_str_name().to_string())
        .unwrap_or_else(|_| u.role.to_string());
    User {
        id: non_empty(&u.id),
        long_name: non_empty(&u.long_name),
        short_name: non_empty(&u.short_name),
        mac_address: mac,
        hardware_model,
        is_licensed: Some(u.is_licensed),
        role: Some(role),
    }
}

pub fn position_from_proto(p: &proto::Position) -> Position {
    let time = nonzero(p.time).or(nonzero(p.timestamp)).map(i64::from);
    Position {
        latitude: None,
        longitude: None,
        latitude_int: p.latitude_i,
        longitude_int: p.longitude_i,
        altitude: p.altitude,
        time,
        precision_bits: nonzero(p.precision_bits),
        satellites_in_view: nonzero(p.sats_in_view),
        ground_speed: p.ground_speed,
        ground_track: p.ground_track,
        pdop: nonzero(p.pdop),
    }
}

pub fn device_metrics_from_proto(m: &proto::DeviceMetrics) -> DeviceMetrics {
    DeviceMetrics {
        battery_level: m.battery_level,
        voltage: finite(m.voltage),
        channel_utilization: finite(m.channel_utilization),
        air_util_tx: finite(m.air_util_tx),
        uptime_seconds: m.uptime_seconds,
    }
}

pub fn telemetry_from_proto(t: &proto::Telemetry) -> Telemetry {
    let mut out = Telemetry {
        time: nonzero(t.time).map(i64::from),
        ..Default::default()
    };
    match &t.variant {
        Some(proto::telemetry::Variant::DeviceMetrics(m)) => {
            out.device_metrics = Some(device_metrics_from_proto(m));
        }
        Some(proto::telemetry::Variant::EnvironmentMetrics(e)) => {
            out.environment = Some(Environment {
                temperature: e.temperature,
                relative_humidity: e.relative_humidity,
                barometric_pressure: e.barometric_pressure,
                gas_resistance: e.gas_resistance,
                voltage: e.voltage,
                current: e.current,
                satellite_count: None,
            });
        }
        None => {}
    }
    out
}

/// Node database entry from the device's config dump.
pub fn node_info_update(info: &proto::NodeInfo) -> (NodeId, NodeUpdate) {
    let position = info.position.as_ref().map(position_from_proto).and_then(|mut p| {
        // A bad fix in a snapshot is dropped; the rest of the entry still applies.
        normalize_position(&mut p).ok().map(|_| p)
    });
    let update = NodeUpdate {
        user: info.user.as_ref().map(user_from_proto),
        position,
        snr: (info.snr != 0.0 && info.snr.is_finite()).then_some(info.snr),
        last_heard: nonzero(info.last_heard).map(i64::from),
        hops_away: info.hops_away,
        via_relay: info.via_mqtt.then_some(true),
        device_metrics: info.device_metrics.as_ref().map(device_metrics_from_proto),
        telemetry: None,
    };
    (NodeId(info.num), update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::packet::{Decoded, Payload, RoutingInfo};

    const NOW: i64 = 1_700_000_500;

    fn with_decoded(decoded: Decoded) -> RawPacket {
        RawPacket {
            from: Some(crate::gateway::node::NodeRef::Num(0xa1b2)),
            decoded: Some(decoded),
            ..Default::default()
        }
    }

    fn binary(port: proto::PortNum, msg: impl Message) -> RawPacket {
        with_decoded(Decoded {
            portnum: Some(EnumValue::Num(port as i32)),
            payload: Some(Payload::Bytes(msg.encode_to_vec())),
            ..Default::default()
        })
    }

    #[test]
    fn classifies_known_and_unknown_ports() {
        assert_eq!(
            PortKind::classify(&EnumValue::Name("TELEMETRY_APP".into())),
            Ok(PortKind::Telemetry)
        );
        assert_eq!(
            PortKind::classify(&EnumValue::Num(71)),
            Err(GatewayError::UnknownPortKind("NEIGHBORINFO_APP".into()))
        );
        assert!(matches!(
            PortKind::classify(&EnumValue::Name("FUTURE_APP".into())),
            Err(GatewayError::UnknownPortKind(_))
        ));
    }

    #[test]
    fn text_defaults_channel_and_timestamp() {
        let pkt = with_decoded(Decoded {
            text: Some("hi".into()),
            ..Default::default()
        });
        let Extracted::Text(t) = extract(&pkt, PortKind::Text, NOW).unwrap() else {
            panic!("expected text");
        };
        assert_eq!(t.channel, 0);
        assert_eq!(t.text, "hi");
        assert_eq!(t.timestamp, NOW);
    }

    #[test]
    fn text_from_payload_requires_utf8() {
        let mut pkt = with_decoded(Decoded {
            payload: Some(Payload::Bytes(vec![0xff, 0xfe])),
            ..Default::default()
        });
        assert!(matches!(
            extract(&pkt, PortKind::Text, NOW),
            Err(GatewayError::MalformedPacket(_))
        ));
        pkt.decoded.as_mut().unwrap().payload = Some(Payload::Bytes("héllo".as_bytes().to_vec()));
        pkt.rx_time = Some(1_600_000_000);
        let Extracted::Text(t) = extract(&pkt, PortKind::Text, NOW).unwrap() else {
            panic!("expected text");
        };
        assert_eq!(t.text, "héllo");
        assert_eq!(t.timestamp, 1_600_000_000);
    }

    #[test]
    fn position_forms_cross_derive() {
        let mut from_int = Position {
            latitude_int: Some(374_221_234),
            longitude_int: Some(-1_220_841_234),
            ..Default::default()
        };
        normalize_position(&mut from_int).unwrap();
        let lat = from_int.latitude.unwrap();
        let lon = from_int.longitude.unwrap();
        assert!((lat - 37.422_123_4).abs() < 1e-9);
        assert!((lon + 122.084_123_4).abs() < 1e-9);

        let mut from_float = Position {
            latitude: Some(lat),
            longitude: Some(lon),
            ..Default::default()
        };
        normalize_position(&mut from_float).unwrap();
        assert!((from_float.latitude_int.unwrap() - 374_221_234).abs() <= 1);
        assert!((from_float.longitude_int.unwrap() + 1_220_841_234).abs() <= 1);
    }

    #[test]
    fn position_rejects_out_of_range_and_drops_nan() {
        let mut bad = Position {
            latitude_int: Some(1_000_000_000),
            ..Default::default()
        };
        assert!(normalize_position(&mut bad).is_err());

        let mut nan = Position {
            latitude: Some(f64::NAN),
            altitude: Some(12),
            ..Default::default()
        };
        normalize_position(&mut nan).unwrap();
        assert!(nan.latitude.is_none());
        assert!(nan.latitude_int.is_none());
        assert_eq!(nan.altitude, Some(12));
    }

    #[test]
    fn binary_and_structured_nodeinfo_agree() {
        let user = proto::User {
            id: "!0000a1b2".into(),
            long_name: "Hilltop".into(),
            short_name: "HT".into(),
            hw_model: proto::HardwareModel::HeltecV3 as i32,
            ..Default::default()
        };
        let Extracted::NodeInfo(from_bin) =
            extract(&binary(proto::PortNum::NodeinfoApp, user), PortKind::NodeInfo, NOW).unwrap()
        else {
            panic!("expected nodeinfo");
        };
        assert_eq!(from_bin.long_name.as_deref(), Some("Hilltop"));
        assert_eq!(from_bin.hardware_model.as_deref(), Some("HELTEC_V3"));
        assert_eq!(from_bin.role.as_deref(), Some("CLIENT"));

        let structured = with_decoded(Decoded {
            user: Some(from_bin.clone()),
            ..Default::default()
        });
        assert_eq!(
            extract(&structured, PortKind::NodeInfo, NOW).unwrap(),
            Extracted::NodeInfo(from_bin)
        );
    }

    #[test]
    fn telemetry_mirrors_device_metrics() {
        let t = proto::Telemetry {
            time: 5,
            variant: Some(proto::telemetry::Variant::DeviceMetrics(proto::DeviceMetrics {
                battery_level: Some(64),
                voltage: Some(f32::NAN),
                ..Default::default()
            })),
        };
        let ex = extract(&binary(proto::PortNum::TelemetryApp, t), PortKind::Telemetry, NOW).unwrap();
        let update = ex.node_update().unwrap();
        let top = update.device_metrics.unwrap();
        assert_eq!(top.battery_level, Some(64));
        assert_eq!(top.voltage, None);
        let nested = update.telemetry.unwrap();
        assert_eq!(nested.time, Some(5));
        assert_eq!(nested.device_metrics.unwrap().battery_level, Some(64));
    }

    #[test]
    fn routing_reports_errors_by_name() {
        let ok = with_decoded(Decoded {
            request_id: Some(99),
            routing: Some(RoutingInfo {
                error_reason: Some(EnumValue::Name("NONE".into())),
            }),
            ..Default::default()
        });
        assert_eq!(
            extract(&ok, PortKind::Routing, NOW).unwrap(),
            Extracted::Routing(AckReport {
                packet_id: 99,
                error: None
            })
        );

        let mut nak = binary(
            proto::PortNum::RoutingApp,
            proto::Routing {
                variant: Some(proto::routing::Variant::ErrorReason(
                    proto::routing::Error::NoRoute as i32,
                )),
            },
        );
        nak.decoded.as_mut().unwrap().request_id = Some(100);
        assert_eq!(
            extract(&nak, PortKind::Routing, NOW).unwrap(),
            Extracted::Routing(AckReport {
                packet_id: 100,
                error: Some("NO_ROUTE".into())
            })
        );
    }

    #[test]
    fn routing_without_correlation_is_malformed() {
        let pkt = with_decoded(Decoded::default());
        assert!(matches!(
            extract(&pkt, PortKind::Routing, NOW),
            Err(GatewayError::MalformedPacket(_))
        ));
        let admin = with_decoded(Decoded {
            reply_id: Some(12),
            ..Default::default()
        });
        assert_eq!(
            extract(&admin, PortKind::Admin, NOW).unwrap(),
            Extracted::Admin(AckReport {
                packet_id: 12,
                error: None
            })
        );
    }

    #[test]
    fn node_info_snapshot_conversion() {
        let info = proto::NodeInfo {
            num: 0xbeef,
            snr: 7.5,
            last_heard: 1_700_000_000,
            hops_away: Some(2),
            position: Some(proto::Position {
                latitude_i: Some(515_000_000),
                longitude_i: Some(-1_000_000),
                ..Default::default()
            }),
            ..Default::default()
        };
        let (id, update) = node_info_update(&info);
        assert_eq!(id, NodeId(0xbeef));
        assert_eq!(update.hops_away, Some(2));
        assert_eq!(update.last_heard, Some(1_700_000_000));
        assert_eq!(update.via_relay, None);
        let pos = update.position.unwrap();
        assert!((pos.latitude.unwrap() - 51.5).abs() < 1e-9);
    }
}
