//! Process-wide gateway counters.
//! Plain atomics; the binary logs a snapshot periodically and at shutdown.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static PACKETS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static PACKETS_DUPLICATE: AtomicU64 = AtomicU64::new(0);
static PACKETS_ENCRYPTED: AtomicU64 = AtomicU64::new(0);
static PACKETS_MALFORMED: AtomicU64 = AtomicU64::new(0);
static PACKETS_UNKNOWN_PORT: AtomicU64 = AtomicU64::new(0);
static NODE_MERGES: AtomicU64 = AtomicU64::new(0);
static MESSAGES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_SENT: AtomicU64 = AtomicU64::new(0);
static ACKS_ACKNOWLEDGED: AtomicU64 = AtomicU64::new(0);
static ACKS_FAILED: AtomicU64 = AtomicU64::new(0);
static ACKS_TIMED_OUT: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_packets_received() {
    bump(&PACKETS_RECEIVED);
}
pub fn inc_packets_duplicate() {
    bump(&PACKETS_DUPLICATE);
}
pub fn inc_packets_encrypted() {
    bump(&PACKETS_ENCRYPTED);
}
pub fn inc_packets_malformed() {
    bump(&PACKETS_MALFORMED);
}
pub fn inc_packets_unknown_port() {
    bump(&PACKETS_UNKNOWN_PORT);
}
pub fn inc_node_merges() {
    bump(&NODE_MERGES);
}
pub fn inc_messages_received() {
    bump(&MESSAGES_RECEIVED);
}
pub fn inc_messages_sent() {
    bump(&MESSAGES_SENT);
}
pub fn inc_acks_failed() {
    bump(&ACKS_FAILED);
}
pub fn inc_acks_timed_out() {
    bump(&ACKS_TIMED_OUT);
}

/// Count an acknowledgement and fold its round-trip time into the average.
pub fn observe_ack(waited: Duration) {
    bump(&ACKS_ACKNOWLEDGED);
    ACK_LATENCY_SUM_MS.fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
    ACK_LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub packets_received: u64,
    pub packets_duplicate: u64,
    pub packets_encrypted: u64,
    pub packets_malformed: u64,
    pub packets_unknown_port: u64,
    pub node_merges: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub acks_acknowledged: u64,
    pub acks_failed: u64,
    pub acks_timed_out: u64,
    pub ack_latency_avg_ms: Option<u64>,
}

pub fn snapshot() -> Snapshot {
    let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
    let sum = load(&ACK_LATENCY_SUM_MS);
    let count = load(&ACK_LATENCY_COUNT);
    Snapshot {
        packets_received: load(&PACKETS_RECEIVED),
        packets_duplicate: load(&PACKETS_DUPLICATE),
        packets_encrypted: load(&PACKETS_ENCRYPTED),
        packets_malformed: load(&PACKETS_MALFORMED),
        packets_unknown_port: load(&PACKETS_UNKNOWN_PORT),
        node_merges: load(&NODE_MERGES),
        messages_received: load(&MESSAGES_RECEIVED),
        messages_sent: load(&MESSAGES_SENT),
        acks_acknowledged: load(&ACKS_ACKNOWLEDGED),
        acks_failed: load(&ACKS_FAILED),
        acks_timed_out: load(&ACKS_TIMED_OUT),
        ack_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
    }
}
