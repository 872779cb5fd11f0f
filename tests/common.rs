//! Test utilities & fixtures shared by the integration tests.
#![allow(dead_code)] // each test binary uses a different subset

use meshgate::gateway::{
    DeviceEvent, DeviceLink, EventSink, Gateway, GatewayError, GatewayEvent, GatewayResult, GatewaySettings,
    MessageStatus, RawPacket,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Device link double: records every text handed to it, optionally refuses writes.
#[derive(Default)]
pub struct MockLink {
    pub sent: Mutex<Vec<(u32, String, u32)>>,
    pub fail_writes: AtomicBool,
    pub closed: AtomicBool,
}

impl MockLink {
    pub fn failing() -> Self {
        let link = Self::default();
        link.fail_writes.store(true, Ordering::SeqCst);
        link
    }

    pub fn sent(&self) -> Vec<(u32, String, u32)> {
        self.sent.lock().unwrap().clone()
    }
}

impl DeviceLink for MockLink {
    fn send_text(&self, packet_id: u32, text: &str, channel: u32) -> GatewayResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GatewayError::TransportFailure("mock write refused".into()));
        }
        self.sent.lock().unwrap().push((packet_id, text.to_string(), channel));
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Event sink that keeps everything it is given.
#[derive(Default)]
pub struct Collector {
    events: Mutex<Vec<GatewayEvent>>,
}

impl EventSink for Collector {
    fn publish(&self, event: GatewayEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl Collector {
    pub fn events(&self) -> Vec<GatewayEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(GatewayEvent::kind).collect()
    }

    /// Ack statuses published for one packet id, in order.
    pub fn acks_for(&self, packet_id: u32) -> Vec<MessageStatus> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                GatewayEvent::MessageAck(n) if n.packet_id == packet_id => Some(n.status),
                _ => None,
            })
            .collect()
    }
}

pub fn settings() -> GatewaySettings {
    GatewaySettings {
        ack_timeout: Duration::from_secs(30),
        sweep_interval: Duration::from_millis(1000),
        ..GatewaySettings::default()
    }
}

/// Gateway with a collecting sink and nothing attached.
pub fn detached_gateway() -> (Gateway, Arc<Collector>) {
    let sink = Arc::new(Collector::default());
    (Gateway::new(settings(), sink.clone()), sink)
}

/// Gateway with a mock link attached; the sender feeds device events to the dispatcher.
pub fn connected_gateway(
    link: MockLink,
) -> (Gateway, Arc<Collector>, Arc<MockLink>, mpsc::Sender<DeviceEvent>) {
    let (gateway, sink) = detached_gateway();
    let link = Arc::new(link);
    let (tx, rx) = gateway.event_channel();
    gateway.attach(link.clone(), rx);
    (gateway, sink, link, tx)
}

/// Let spawned tasks drain their queues.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub fn packet(value: serde_json::Value) -> RawPacket {
    RawPacket::from_json(&value.to_string()).expect("fixture packet parses")
}

pub fn text(from: &str, id: u32, body: &str) -> RawPacket {
    packet(json!({
        "from": from,
        "id": id,
        "decoded": { "portnum": "TEXT_MESSAGE_APP", "text": body, "channel": 0 }
    }))
}

pub fn telemetry(from: u32, id: u32, device_metrics: serde_json::Value) -> RawPacket {
    packet(json!({
        "from": from,
        "id": id,
        "decoded": { "portnum": "TELEMETRY_APP", "telemetry": { "deviceMetrics": device_metrics } }
    }))
}

pub fn routing_reply(from: u32, request_id: u32, error_reason: &str) -> RawPacket {
    packet(json!({
        "from": from,
        "decoded": {
            "portnum": "ROUTING_APP",
            "requestId": request_id,
            "routing": { "errorReason": error_reason }
        }
    }))
}
