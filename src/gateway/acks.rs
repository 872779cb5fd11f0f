//! Ack correlation: one pending entry per outbound packet id, each with a deadline.
//!
//! Deadlines live in a min-heap checked by a single sweeping task. Entries are
//! removed exactly once, by whichever of resolve / fail / sweep / cancel gets there
//! first, so every terminal outcome is reported at most once per packet id.

use super::error::{GatewayError, GatewayResult};
use log::trace;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct PendingAck {
    created_at: Instant,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct AckTable {
    pending: HashMap<u32, PendingAck>,
    deadlines: BinaryHeap<Reverse<(Instant, u32)>>,
}

/// Outcome of settling a pending ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settled {
    pub packet_id: u32,
    pub waited: Duration,
}

#[derive(Debug, Default)]
pub struct AckCorrelator {
    table: Mutex<AckTable>,
}

impl AckCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AckTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start waiting for an ack of `packet_id`.
    pub fn register(&self, packet_id: u32, timeout: Duration) -> GatewayResult<()> {
        let now = Instant::now();
        let mut table = self.lock();
        if table.pending.contains_key(&packet_id) {
            return Err(GatewayError::DuplicatePacketId(packet_id));
        }
        let deadline = now + timeout;
        table.pending.insert(
            packet_id,
            PendingAck {
                created_at: now,
                deadline,
            },
        );
        table.deadlines.push(Reverse((deadline, packet_id)));
        trace!("ack pending id={} timeout={:?}", packet_id, timeout);
        Ok(())
    }

    /// Settle a pending entry. Returns `None` for unknown or already settled ids,
    /// which makes double-reported acks harmless.
    pub fn resolve(&self, packet_id: u32) -> Option<Settled> {
        let entry = self.lock().pending.remove(&packet_id)?;
        Some(Settled {
            packet_id,
            waited: entry.created_at.elapsed(),
        })
    }

    /// Withdraw a registration without reporting it (failed write, shutdown).
    pub fn cancel(&self, packet_id: u32) -> bool {
        self.lock().pending.remove(&packet_id).is_some()
    }

    /// Remove and return every entry whose deadline is at or before `now`.
    pub fn sweep(&self, now: Instant) -> Vec<u32> {
        let mut table = self.lock();
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, id))) = table.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            table.deadlines.pop();
            // Heap entries outlive settled acks; only a matching deadline counts.
            if table.pending.get(&id).map(|p| p.deadline) == Some(deadline) {
                table.pending.remove(&id);
                expired.push(id);
            }
        }
        if table.pending.is_empty() {
            table.deadlines.clear();
        }
        expired
    }

    pub fn is_pending(&self, packet_id: u32) -> bool {
        self.lock().pending.contains_key(&packet_id)
    }

    pub fn outstanding(&self) -> usize {
        self.lock().pending.len()
    }

    /// Drop everything still pending. Used at shutdown; nothing is reported.
    pub fn clear(&self) -> usize {
        let mut table = self.lock();
        let n = table.pending.len();
        table.pending.clear();
        table.deadlines.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(30);

    #[test]
    fn duplicate_register_fails() {
        let acks = AckCorrelator::new();
        acks.register(7, WAIT).unwrap();
        assert_eq!(
            acks.register(7, WAIT),
            Err(GatewayError::DuplicatePacketId(7))
        );
        assert_eq!(acks.outstanding(), 1);
    }

    #[test]
    fn resolve_settles_exactly_once() {
        let acks = AckCorrelator::new();
        acks.register(9, WAIT).unwrap();
        assert!(acks.resolve(9).is_some());
        assert!(acks.resolve(9).is_none());
        assert!(acks.resolve(1234).is_none());
        // Id is free again after settling.
        assert!(acks.register(9, WAIT).is_ok());
    }

    #[test]
    fn expired_entry_times_out_once_and_late_resolve_is_noop() {
        let acks = AckCorrelator::new();
        acks.register(1, Duration::from_secs(5)).unwrap();
        acks.register(2, Duration::from_secs(60)).unwrap();
        let later = Instant::now() + Duration::from_secs(10);

        assert_eq!(acks.sweep(later), vec![1]);
        assert!(acks.sweep(later).is_empty());
        assert!(acks.resolve(1).is_none());
        assert!(acks.is_pending(2));
    }

    #[test]
    fn resolved_entry_never_times_out() {
        let acks = AckCorrelator::new();
        acks.register(3, Duration::from_millis(1)).unwrap();
        acks.resolve(3);
        assert!(acks.sweep(Instant::now() + WAIT).is_empty());
    }

    #[test]
    fn reregistered_id_uses_new_deadline() {
        let acks = AckCorrelator::new();
        acks.register(4, Duration::from_secs(1)).unwrap();
        acks.register(5, Duration::from_secs(100)).unwrap();
        assert!(acks.cancel(4));
        acks.register(4, Duration::from_secs(50)).unwrap();

        let t = Instant::now() + Duration::from_secs(10);
        assert!(acks.sweep(t).is_empty());
        assert!(acks.is_pending(4));
    }

    #[test]
    fn clear_discards_without_reporting() {
        let acks = AckCorrelator::new();
        for id in 1..=3 {
            acks.register(id, Duration::from_millis(1)).unwrap();
        }
        assert_eq!(acks.clear(), 3);
        assert!(acks.sweep(Instant::now() + WAIT).is_empty());
    }
}
