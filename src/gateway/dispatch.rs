//! Ingestion dispatcher and ack sweeper.
//!
//! The dispatcher is the single consumer of device events. Each packet is handled
//! to completion before the next one is looked at, so per-packet steps never
//! interleave with another packet's.

use super::error::GatewayError;
use super::events::{ConnectionFault, ConnectionInfo, GatewayEvent};
use super::extract::{extract, Extracted, PortKind};
use super::ledger::{ChannelMessage, MessageStatus};
use super::node::NodeUpdate;
use super::packet::RawPacket;
use super::transport::{ConnectionSnapshot, DeviceEvent};
use super::GatewayState;
use crate::logutil::{escape_log, truncate_for_log};
use crate::metrics;
use chrono::Utc;
use log::{debug, error, info, trace, warn};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Recently seen `(from, id)` pairs, oldest evicted first.
#[derive(Debug)]
struct SeenPackets {
    order: VecDeque<(u32, u32)>,
    set: HashSet<(u32, u32)>,
    capacity: usize,
}

impl SeenPackets {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            set: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record the key; returns false if it was already present.
    fn insert(&mut self, key: (u32, u32)) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if !self.set.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

/// Liveness carried by every packet: when it was heard, how well, from how far.
fn liveness_update(packet: &RawPacket, now: i64) -> NodeUpdate {
    let hops_away = match (packet.hop_start, packet.hop_limit) {
        (Some(start), Some(limit)) if start >= limit => Some(start - limit),
        _ => None,
    };
    let via_relay = match (packet.via_mqtt, packet.relay_node) {
        (None, None) => None,
        (mqtt, relay) => Some(mqtt.unwrap_or(false) || relay.unwrap_or(0) != 0),
    };
    NodeUpdate {
        last_heard: Some(packet.rx_time.filter(|t| *t > 0).unwrap_or(now)),
        snr: packet.rx_snr.filter(|s| s.is_finite()),
        hops_away,
        via_relay,
        ..Default::default()
    }
}

pub struct IngestionDispatcher {
    state: Arc<GatewayState>,
    seen: SeenPackets,
}

impl IngestionDispatcher {
    pub(crate) fn new(state: Arc<GatewayState>) -> Self {
        let window = state.settings.dedup_window;
        Self {
            state,
            seen: SeenPackets::new(window),
        }
    }

    /// Consume device events until the channel closes or shutdown is signalled.
    pub async fn run(mut self, mut events: mpsc::Receiver<DeviceEvent>, mut shutdown: watch::Receiver<bool>) {
        info!("Ingestion dispatcher started");
        loop {
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => self.handle_event(ev),
                    None => {
                        info!("Device event channel closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    debug!("Dispatcher received shutdown signal");
                    break;
                }
            }
        }
        info!("Ingestion dispatcher stopped");
    }

    pub fn handle_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Packet(packet) => self.handle(packet),
            DeviceEvent::Connected(snapshot) => self.on_connected(snapshot),
            DeviceEvent::NodeInfo(id, update) => self.state.merge_node(id, &update),
            DeviceEvent::Queued(packet_id) => {
                if self
                    .state
                    .ledger
                    .mark_status(packet_id, MessageStatus::Sent, None)
                    .is_some()
                {
                    self.state
                        .publish(GatewayEvent::ack(packet_id, MessageStatus::Sent, None));
                }
            }
            DeviceEvent::Error(message) => {
                error!("Device link failed: {}", message);
                self.state.drop_link();
                self.state
                    .publish(GatewayEvent::ConnectionError(ConnectionFault { message }));
            }
        }
    }

    fn on_connected(&mut self, snapshot: ConnectionSnapshot) {
        let ConnectionSnapshot {
            my_node,
            channels,
            nodes,
        } = snapshot;
        info!(
            "Device connected: node={} channels={} nodes={}",
            my_node.map_or_else(|| "?".to_string(), |n| n.to_string()),
            channels.len(),
            nodes.len()
        );
        self.state.set_local_node(my_node);
        let channel_count = channels.len();
        for (id, update) in &nodes {
            self.state.merge_node(*id, update);
        }
        self.state.replace_channels(channels);
        self.state
            .publish(GatewayEvent::ConnectionEstablished(ConnectionInfo {
                my_node: my_node.map(|n| n.to_string()),
                channel_count,
                node_count: self.state.registry.len(),
            }));
    }

    /// Process one inbound packet. Never fails: bad packets are logged and dropped.
    pub fn handle(&mut self, packet: RawPacket) {
        self.handle_at(packet, Utc::now().timestamp());
    }

    pub fn handle_at(&mut self, packet: RawPacket, now: i64) {
        metrics::inc_packets_received();

        let sender = match packet.sender() {
            Some(node) => match self.state.registry.resolve(&node) {
                Some(id) => Some(id),
                None => {
                    let err = GatewayError::UnresolvedNode(node.to_string());
                    warn!("{}; node state not updated", escape_log(&err.to_string()));
                    None
                }
            },
            None => None,
        };

        if let (Some(from), Some(id)) = (sender, packet.id.filter(|id| *id != 0)) {
            if !self.seen.insert((from.0, id)) {
                metrics::inc_packets_duplicate();
                trace!("duplicate packet {} 0x{:08x}", from, id);
                return;
            }
        }

        // Routing replies carry their own outcome; the extractor settles those.
        let is_routing = packet
            .portnum()
            .is_some_and(|p| PortKind::classify(p) == Ok(PortKind::Routing));
        if let Some(reply_id) = packet
            .decoded
            .as_ref()
            .and_then(|d| d.reply_id)
            .filter(|id| *id != 0)
        {
            if !is_routing && packet.priority.as_ref().is_some_and(|p| p.is_ack_priority()) {
                self.state.settle_ack(reply_id, None);
            }
        }

        let extracted = match packet.portnum() {
            None if packet.encrypted.is_some() => {
                metrics::inc_packets_encrypted();
                debug!("Ignoring encrypted packet from {:?}", sender);
                return;
            }
            None => Err(GatewayError::MalformedPacket("packet has no port".into())),
            Some(port) => PortKind::classify(port).and_then(|kind| extract(&packet, kind, now)),
        };
        let extracted = match extracted {
            Ok(x) => Some(x),
            Err(GatewayError::UnknownPortKind(port)) => {
                metrics::inc_packets_unknown_port();
                debug!("Dropping packet with unhandled port {}", port);
                return;
            }
            Err(e) => {
                metrics::inc_packets_malformed();
                warn!("Dropping payload from {:?}: {}", sender, escape_log(&e.to_string()));
                None
            }
        };
        trace!("route {:?} from {:?}", extracted.as_ref().map(kind_name), sender);

        // Liveness and the node-bearing fields go in as one merge.
        if let Some(id) = sender {
            let mut update = liveness_update(&packet, now);
            if let Some(fields) = extracted.as_ref().and_then(Extracted::node_update) {
                update.absorb(&fields);
            }
            self.state.merge_node(id, &update);
        }

        match extracted {
            Some(Extracted::Text(fields)) => {
                let sender_label = match sender {
                    Some(id) => id.to_string(),
                    None => packet
                        .sender()
                        .map_or_else(|| "unknown".to_string(), |n| n.to_string()),
                };
                let sender_name = sender
                    .and_then(|id| self.state.registry.get(id))
                    .and_then(|rec| rec.user.and_then(|u| u.long_name));
                debug!(
                    "text ch{} from {}: {}",
                    fields.channel,
                    sender_label,
                    truncate_for_log(&fields.text, 80)
                );
                let message = self.state.ledger.append(ChannelMessage {
                    channel: fields.channel,
                    sender: sender_label,
                    sender_name,
                    text: fields.text,
                    timestamp: fields.timestamp,
                    packet_id: packet.id,
                    status: MessageStatus::Received,
                    status_reason: None,
                });
                metrics::inc_messages_received();
                self.state.publish(GatewayEvent::NewMessage(message));
            }
            Some(Extracted::Routing(report)) | Some(Extracted::Admin(report)) => {
                self.state.settle_ack(report.packet_id, report.error);
            }
            _ => {}
        }
    }

}

fn kind_name(x: &Extracted) -> &'static str {
    match x {
        Extracted::Text(_) => "text",
        Extracted::Position(_) => "position",
        Extracted::NodeInfo(_) => "nodeInfo",
        Extracted::Telemetry(_) => "telemetry",
        Extracted::Routing(_) => "routing",
        Extracted::Admin(_) => "admin",
    }
}

/// Periodically time out pending acks.
pub(crate) async fn run_ack_sweeper(
    state: Arc<GatewayState>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let n = state.expire_acks(tokio::time::Instant::now());
                if n > 0 {
                    trace!("ack sweep expired {}", n);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("Ack sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::events::EventSink;
    use crate::gateway::packet::{Decoded, EnumValue, RoutingInfo};
    use crate::gateway::{GatewaySettings, NodeId, NodeRef};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<GatewayEvent>>);

    impl EventSink for Collect {
        fn publish(&self, event: GatewayEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn setup() -> (IngestionDispatcher, Arc<Collect>, Arc<GatewayState>) {
        let sink = Arc::new(Collect::default());
        let state = Arc::new(GatewayState::new(GatewaySettings::default(), sink.clone()));
        (IngestionDispatcher::new(state.clone()), sink, state)
    }

    fn text_packet(id: u32, text: &str) -> RawPacket {
        RawPacket {
            from: Some(NodeRef::Num(0xa1b2)),
            id: Some(id),
            hop_start: Some(3),
            hop_limit: Some(1),
            rx_snr: Some(5.5),
            decoded: Some(Decoded {
                portnum: Some(EnumValue::Name("TEXT_MESSAGE_APP".into())),
                text: Some(text.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn text_packet_merges_liveness_then_appends() {
        let (mut d, sink, state) = setup();
        d.handle_at(text_packet(1, "hi"), 1_000);

        let events = sink.0.lock().unwrap().clone();
        let kinds: Vec<_> = events.iter().map(GatewayEvent::kind).collect();
        assert_eq!(kinds, vec!["nodeUpdated", "newMessage"]);
        let rec = state.registry.get(NodeId(0xa1b2)).unwrap();
        assert_eq!(rec.last_heard, Some(1_000));
        assert_eq!(rec.hops_away, Some(2));
        assert_eq!(rec.snr, Some(5.5));
        let msgs = state.ledger.snapshot();
        assert_eq!(msgs[0].sender, "!0000a1b2");
        assert_eq!(msgs[0].status, MessageStatus::Received);
    }

    #[test]
    fn rebroadcasts_are_dropped() {
        let (mut d, _sink, state) = setup();
        d.handle_at(text_packet(9, "once"), 1);
        d.handle_at(text_packet(9, "once"), 2);
        assert_eq!(state.ledger.len(), 1);
        // id 0 is never treated as a duplicate
        d.handle_at(text_packet(0, "a"), 3);
        d.handle_at(text_packet(0, "b"), 4);
        assert_eq!(state.ledger.len(), 3);
    }

    #[test]
    fn dedup_window_evicts_oldest() {
        let mut seen = SeenPackets::new(2);
        assert!(seen.insert((1, 1)));
        assert!(seen.insert((1, 2)));
        assert!(seen.insert((1, 3)));
        assert!(seen.insert((1, 1)));
        assert!(!seen.insert((1, 3)));
        let mut off = SeenPackets::new(0);
        assert!(off.insert((1, 1)));
        assert!(off.insert((1, 1)));
    }

    #[test]
    fn unknown_port_creates_no_record() {
        let (mut d, sink, state) = setup();
        let mut pkt = text_packet(5, "");
        pkt.decoded.as_mut().unwrap().portnum = Some(EnumValue::Name("RANGE_TEST_APP".into()));
        d.handle_at(pkt, 10);
        assert!(state.registry.is_empty());
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn encrypted_packets_are_ignored() {
        let (mut d, sink, state) = setup();
        let pkt = RawPacket {
            from: Some(NodeRef::Num(3)),
            encrypted: Some(crate::gateway::packet::Payload::Bytes(vec![1, 2, 3])),
            ..Default::default()
        };
        d.handle_at(pkt, 10);
        assert!(state.registry.is_empty());
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn malformed_payload_still_counts_as_liveness() {
        let (mut d, _sink, state) = setup();
        let mut pkt = text_packet(6, "");
        let decoded = pkt.decoded.as_mut().unwrap();
        decoded.portnum = Some(EnumValue::Num(3));
        decoded.text = None;
        decoded.payload = Some(crate::gateway::packet::Payload::Bytes(vec![0xff; 4]));
        d.handle_at(pkt, 77);
        let rec = state.registry.get(NodeId(0xa1b2)).unwrap();
        assert_eq!(rec.last_heard, Some(77));
        assert!(rec.position.is_none());
        assert!(state.ledger.is_empty());
    }

    #[test]
    fn ack_priority_packet_resolves_reply_id() {
        let (mut d, sink, state) = setup();
        state.acks.register(0x55, Duration::from_secs(30)).unwrap();
        let pkt = RawPacket {
            from: Some(NodeRef::Num(0xa1b2)),
            id: Some(0x66),
            priority: Some(EnumValue::Num(120)),
            decoded: Some(Decoded {
                portnum: Some(EnumValue::Name("ROUTING_APP".into())),
                reply_id: Some(0x55),
                ..Default::default()
            }),
            ..Default::default()
        };
        d.handle_at(pkt, 1);
        assert_eq!(state.acks.outstanding(), 0);
        let acks: Vec<_> = sink
            .0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind() == "messageAck")
            .cloned()
            .collect();
        assert_eq!(acks, vec![GatewayEvent::ack(0x55, MessageStatus::Acknowledged, None)]);
    }

    #[test]
    fn ack_priority_routing_error_still_fails() {
        let (mut d, sink, state) = setup();
        state.acks.register(0x57, Duration::from_secs(30)).unwrap();
        let pkt = RawPacket {
            from: Some(NodeRef::Num(0xa1b2)),
            id: Some(0x67),
            priority: Some(EnumValue::Name("ACK".into())),
            decoded: Some(Decoded {
                portnum: Some(EnumValue::Name("ROUTING_APP".into())),
                reply_id: Some(0x57),
                routing: Some(RoutingInfo {
                    error_reason: Some(EnumValue::Name("MAX_RETRANSMIT".into())),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        d.handle_at(pkt, 1);
        assert_eq!(state.acks.outstanding(), 0);
        let acks: Vec<_> = sink
            .0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind() == "messageAck")
            .cloned()
            .collect();
        assert_eq!(
            acks,
            vec![GatewayEvent::ack(
                0x57,
                MessageStatus::Failed,
                Some("MAX_RETRANSMIT".into())
            )]
        );
    }

    #[test]
    fn device_error_detaches_and_reports() {
        let (mut d, sink, _state) = setup();
        d.handle_event(DeviceEvent::Error("port vanished".into()));
        let events = sink.0.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![GatewayEvent::ConnectionError(ConnectionFault {
                message: "port vanished".into()
            })]
        );
    }
}
