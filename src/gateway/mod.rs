//! Packet ingestion and node-state reconciliation.
//!
//! The [`Gateway`] owns three components, each behind its own lock:
//!
//! - [`NodeRegistry`]: merged per-node state under the deep-merge law
//! - [`MessageLedger`]: ordered channel history with delivery status
//! - [`AckCorrelator`]: pending acks for outbound packets, with deadlines
//!
//! Device events reach the [`IngestionDispatcher`] over a bounded channel and are
//! handled one at a time. Client commands (`list_*`, `send_message`) run on the
//! caller's context. Events are published to the [`EventSink`] only after the
//! component lock that produced them has been released.

pub mod acks;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod extract;
pub mod ledger;
pub mod node;
pub mod packet;
pub mod registry;
pub mod transport;

pub use acks::AckCorrelator;
pub use dispatch::IngestionDispatcher;
pub use error::{GatewayError, GatewayResult};
pub use events::{EventSink, GatewayEvent};
pub use ledger::{ChannelMessage, MessageLedger, MessageStatus};
pub use node::{NodeId, NodeRecord, NodeRef, NodeUpdate};
pub use packet::RawPacket;
pub use registry::NodeRegistry;
pub use transport::{ChannelDescriptor, ChannelRole, ConnectionSnapshot, DeviceEvent, DeviceLink};

use crate::config::GatewayConfig;
use crate::logutil::truncate_for_log;
use crate::metrics;
use chrono::Utc;
use log::{debug, error, info, trace};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Runtime knobs for the engine, derived from `[gateway]` config.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub ack_timeout: Duration,
    pub sweep_interval: Duration,
    pub dedup_window: usize,
    pub max_text_bytes: usize,
    pub ingest_queue_depth: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

impl From<&GatewayConfig> for GatewaySettings {
    fn from(cfg: &GatewayConfig) -> Self {
        Self {
            ack_timeout: Duration::from_secs(cfg.ack_timeout_secs),
            sweep_interval: Duration::from_millis(cfg.ack_sweep_interval_ms),
            dedup_window: cfg.dedup_window,
            max_text_bytes: cfg.max_text_bytes,
            ingest_queue_depth: cfg.ingest_queue_depth.max(1),
        }
    }
}

/// State shared by the dispatcher, the ack sweeper and client commands.
pub(crate) struct GatewayState {
    pub(crate) registry: NodeRegistry,
    pub(crate) ledger: MessageLedger,
    pub(crate) acks: AckCorrelator,
    channels: Mutex<Vec<ChannelDescriptor>>,
    local_node: Mutex<Option<NodeId>>,
    link: Mutex<Option<Arc<dyn DeviceLink>>>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) settings: GatewaySettings,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl GatewayState {
    fn new(settings: GatewaySettings, sink: Arc<dyn EventSink>) -> Self {
        Self {
            registry: NodeRegistry::new(),
            ledger: MessageLedger::new(),
            acks: AckCorrelator::new(),
            channels: Mutex::new(Vec::new()),
            local_node: Mutex::new(None),
            link: Mutex::new(None),
            sink,
            settings,
        }
    }

    pub(crate) fn publish(&self, event: GatewayEvent) {
        trace!("publish {}", event.kind());
        self.sink.publish(event);
    }

    /// Merge and publish the full record if anything changed.
    pub(crate) fn merge_node(&self, id: NodeId, update: &NodeUpdate) {
        if let Some(record) = self.registry.merge(id, update) {
            metrics::inc_node_merges();
            self.publish(GatewayEvent::NodeUpdated(record));
        }
    }

    /// Settle a pending ack with a success or failure outcome. Unknown or
    /// already-settled ids are ignored.
    pub(crate) fn settle_ack(&self, packet_id: u32, failure: Option<String>) {
        let Some(settled) = self.acks.resolve(packet_id) else {
            trace!("ack for 0x{:08x} has no pending entry", packet_id);
            return;
        };
        let status = match &failure {
            None => {
                metrics::observe_ack(settled.waited);
                debug!("ack 0x{:08x} after {:?}", packet_id, settled.waited);
                MessageStatus::Acknowledged
            }
            Some(reason) => {
                metrics::inc_acks_failed();
                debug!("delivery of 0x{:08x} failed: {}", packet_id, reason);
                MessageStatus::Failed
            }
        };
        self.ledger.mark_status(packet_id, status, failure.clone());
        self.publish(GatewayEvent::ack(packet_id, status, failure));
    }

    /// Time out every pending ack whose deadline has passed.
    pub(crate) fn expire_acks(&self, now: tokio::time::Instant) -> usize {
        let expired = self.acks.sweep(now);
        for id in &expired {
            metrics::inc_acks_timed_out();
            debug!("ack wait for 0x{:08x} timed out", id);
            self.ledger.mark_status(*id, MessageStatus::TimedOut, None);
            self.publish(GatewayEvent::ack(*id, MessageStatus::TimedOut, None));
        }
        expired.len()
    }

    pub(crate) fn replace_channels(&self, channels: Vec<ChannelDescriptor>) {
        *relock(&self.channels) = channels.clone();
        self.publish(GatewayEvent::ChannelList(channels));
    }

    pub(crate) fn set_local_node(&self, id: Option<NodeId>) {
        *relock(&self.local_node) = id;
    }

    pub(crate) fn local_node(&self) -> Option<NodeId> {
        *relock(&self.local_node)
    }

    fn link(&self) -> Option<Arc<dyn DeviceLink>> {
        relock(&self.link).clone()
    }

    fn set_link(&self, link: Option<Arc<dyn DeviceLink>>) -> Option<Arc<dyn DeviceLink>> {
        std::mem::replace(&mut *relock(&self.link), link)
    }

    /// Forget the attached link after it reported a failure.
    pub(crate) fn drop_link(&self) {
        if self.set_link(None).is_some() {
            info!("Device link detached");
        }
    }
}

/// Client-facing handle to the engine.
pub struct Gateway {
    state: Arc<GatewayState>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub fn new(settings: GatewaySettings, sink: Arc<dyn EventSink>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Arc::new(GatewayState::new(settings, sink)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.state.settings
    }

    /// A dispatcher bound to this gateway's state, for feeding packets directly.
    pub fn dispatcher(&self) -> IngestionDispatcher {
        IngestionDispatcher::new(self.state.clone())
    }

    /// Bounded channel sized for device → dispatcher traffic.
    pub fn event_channel(&self) -> (mpsc::Sender<DeviceEvent>, mpsc::Receiver<DeviceEvent>) {
        mpsc::channel(self.state.settings.ingest_queue_depth)
    }

    /// Attach a device link and start consuming its events. Must be called from
    /// within a tokio runtime. A previously attached link is closed.
    pub fn attach(&self, link: Arc<dyn DeviceLink>, events: mpsc::Receiver<DeviceEvent>) {
        if let Some(old) = self.state.set_link(Some(link)) {
            old.close();
        }
        let dispatcher = self.dispatcher();
        let handle = tokio::spawn(dispatcher.run(events, self.shutdown.subscribe()));
        let mut tasks = relock(&self.tasks);
        tasks.push(handle);
        if tasks.len() == 1 {
            tasks.push(self.spawn_sweeper());
        }
    }

    /// Start the ack sweeper on its own, for gateways fed without a device link.
    pub fn start_sweeper(&self) {
        let mut tasks = relock(&self.tasks);
        if tasks.is_empty() {
            tasks.push(self.spawn_sweeper());
        }
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        tokio::spawn(dispatch::run_ack_sweeper(
            self.state.clone(),
            self.state.settings.sweep_interval,
            self.shutdown.subscribe(),
        ))
    }

    /// Close and forget the current link. Sends fail with `NotConnected` afterwards.
    pub fn detach(&self) {
        if let Some(link) = self.state.set_link(None) {
            link.close();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.link().is_some()
    }

    /// Stop background tasks. Merges already committed stay; pending acks are
    /// discarded without being reported.
    pub async fn shutdown(&self) {
        self.detach();
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = relock(&self.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        let dropped = self.state.acks.clear();
        if dropped > 0 {
            debug!("Discarded {} pending acks at shutdown", dropped);
        }
    }

    pub fn list_channels(&self) -> Vec<ChannelDescriptor> {
        relock(&self.state.channels).clone()
    }

    pub fn list_nodes(&self) -> Vec<NodeRecord> {
        self.state.registry.snapshot()
    }

    pub fn node(&self, node: &NodeRef) -> GatewayResult<NodeRecord> {
        self.state
            .registry
            .resolve(node)
            .and_then(|id| self.state.registry.get(id))
            .ok_or_else(|| GatewayError::UnresolvedNode(node.to_string()))
    }

    /// Full history, or one channel's history when `channel` is given.
    pub fn list_messages(&self, channel: Option<u32>) -> Vec<ChannelMessage> {
        match channel {
            Some(ch) => self.state.ledger.for_channel(ch),
            None => self.state.ledger.snapshot(),
        }
    }

    /// History keyed by channel index, for initial client sync.
    pub fn messages_by_channel(&self) -> BTreeMap<u32, Vec<ChannelMessage>> {
        self.state.ledger.grouped()
    }

    pub fn local_node(&self) -> Option<NodeId> {
        self.state.local_node()
    }

    pub fn pending_acks(&self) -> usize {
        self.state.acks.outstanding()
    }

    /// Broadcast `text` on `channel`. Returns the packet id whose ack is awaited.
    pub fn send_message(&self, text: &str, channel: u32) -> GatewayResult<u32> {
        let mut packet_id: u32 = rand::random();
        if packet_id == 0 {
            packet_id = 1;
        }
        self.send_message_with_id(packet_id, text, channel)
    }

    /// Like [`send_message`](Self::send_message) with a caller-chosen packet id.
    pub fn send_message_with_id(&self, packet_id: u32, text: &str, channel: u32) -> GatewayResult<u32> {
        if text.trim().is_empty() {
            return Err(GatewayError::InvalidMessage("message is empty".into()));
        }
        let limit = self.state.settings.max_text_bytes;
        if text.len() > limit {
            return Err(GatewayError::InvalidMessage(format!(
                "message is {} bytes, limit is {}",
                text.len(),
                limit
            )));
        }
        let link = self.state.link().ok_or(GatewayError::NotConnected)?;

        self.state.acks.register(packet_id, self.state.settings.ack_timeout)?;
        let local = self.local_node();
        let sender_name = local
            .and_then(|id| self.state.registry.get(id))
            .and_then(|rec| rec.user.and_then(|u| u.long_name));
        let message = self.state.ledger.append(ChannelMessage {
            channel,
            sender: local.map_or_else(|| "local".to_string(), |id| id.to_string()),
            sender_name,
            text: text.to_string(),
            timestamp: Utc::now().timestamp(),
            packet_id: Some(packet_id),
            status: MessageStatus::Pending,
            status_reason: None,
        });
        self.state.publish(GatewayEvent::NewMessage(message));

        match link.send_text(packet_id, text, channel) {
            Ok(()) => {
                metrics::inc_messages_sent();
                debug!(
                    "sent 0x{:08x} on ch{}: {}",
                    packet_id,
                    channel,
                    truncate_for_log(text, 64)
                );
                Ok(packet_id)
            }
            Err(e) => {
                error!("Send of 0x{:08x} failed: {}", packet_id, e);
                self.state.acks.cancel(packet_id);
                let reason = e.to_string();
                self.state
                    .ledger
                    .mark_status(packet_id, MessageStatus::Failed, Some(reason.clone()));
                self.state
                    .publish(GatewayEvent::ack(packet_id, MessageStatus::Failed, Some(reason)));
                Err(e)
            }
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
