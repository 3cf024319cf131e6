//! Bounded ICE restart scheduling
//!
//! Transport state callbacks can report the same degradation twice (peer
//! connection state and ICE connection state both fire). The state machine
//! coalesces those into at most one pending restart timer per peer, and stops
//! restarting a peer after the configured attempt bound.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RecoveryPolicy;
use crate::signaling::VoiceMeshEvent;

#[derive(Default)]
struct RecoveryRecord {
    attempts: u32,
    pending: Option<JoinHandle<()>>,
}

/// Per-peer recovery state
pub struct IceRecoveryStateMachine {
    records: Arc<Mutex<HashMap<String, RecoveryRecord>>>,
    policy: RecoveryPolicy,
    has_relay: bool,
    degraded_warned: AtomicBool,
    events: UnboundedSender<VoiceMeshEvent>,
}

impl IceRecoveryStateMachine {
    /// Create a state machine
    ///
    /// `has_relay` reflects whether TURN servers are configured; when they
    /// are, exhausting the restart bound is not reported as degraded because
    /// the ICE agent still has a relay path to fall back on.
    pub fn new(
        policy: RecoveryPolicy,
        has_relay: bool,
        events: UnboundedSender<VoiceMeshEvent>,
    ) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            policy,
            has_relay,
            degraded_warned: AtomicBool::new(false),
            events,
        }
    }

    /// Schedule a restart for a degraded peer
    ///
    /// No-op when a restart timer is already pending for this peer. Once the
    /// attempt bound is reached no further restarts are scheduled; the first
    /// peer to exhaust the bound without a relay fallback emits a single
    /// [`VoiceMeshEvent::ConnectionDegraded`] for the whole process.
    pub fn schedule<F>(&self, peer_id: &str, restart: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut records = self.records.lock();
        let record = records.entry(peer_id.to_string()).or_default();

        if record.pending.is_some() {
            debug!(peer_id, "Restart already pending, coalescing");
            return;
        }

        if record.attempts >= self.policy.max_attempts {
            warn!(
                peer_id,
                attempts = record.attempts,
                "Restart bound reached, giving up on peer"
            );
            if !self.has_relay && !self.degraded_warned.swap(true, Ordering::SeqCst) {
                let _ = self.events.send(VoiceMeshEvent::ConnectionDegraded);
            }
            return;
        }

        let delay = Duration::from_millis(self.policy.restart_delay_ms);
        info!(
            peer_id,
            attempt = record.attempts + 1,
            max = self.policy.max_attempts,
            delay_ms = self.policy.restart_delay_ms,
            "Scheduling ICE restart"
        );

        let records_ref = Arc::clone(&self.records);
        let peer = peer_id.to_string();
        record.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut records = records_ref.lock();
                if let Some(record) = records.get_mut(&peer) {
                    record.pending = None;
                    record.attempts += 1;
                }
            }
            restart.await;
        }));
    }

    /// Reset a peer's attempt counter after it reports healthy again
    ///
    /// Also cancels any pending restart timer.
    pub fn reset(&self, peer_id: &str) {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(peer_id) {
            if let Some(handle) = record.pending.take() {
                handle.abort();
            }
            if record.attempts > 0 {
                debug!(peer_id, "Link healthy, resetting restart budget");
            }
            record.attempts = 0;
        }
    }

    /// Drop a peer's recovery state entirely
    pub fn remove(&self, peer_id: &str) {
        let mut records = self.records.lock();
        if let Some(record) = records.remove(peer_id) {
            if let Some(handle) = record.pending {
                handle.abort();
            }
        }
    }

    /// Cancel every pending restart and drop all state
    pub fn clear(&self) {
        let mut records = self.records.lock();
        for (_, record) in records.drain() {
            if let Some(handle) = record.pending {
                handle.abort();
            }
        }
    }

    /// Attempts used so far for a peer
    pub fn attempts(&self, peer_id: &str) -> u32 {
        self.records
            .lock()
            .get(peer_id)
            .map(|r| r.attempts)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::mpsc;

    fn fast_policy() -> RecoveryPolicy {
        RecoveryPolicy {
            max_attempts: 3,
            restart_delay_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_restart_fires_after_delay() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let machine = IceRecoveryStateMachine::new(fast_policy(), false, tx);

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        machine.schedule("peer-a", async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(machine.attempts("peer-a"), 1);
    }

    #[tokio::test]
    async fn test_double_trigger_coalesces() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let machine = IceRecoveryStateMachine::new(fast_policy(), false, tx);

        let count = Arc::new(AtomicU32::new(0));
        for _ in 0..2 {
            let counter = count.clone();
            machine.schedule("peer-a", async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_bound_enforced() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let machine = IceRecoveryStateMachine::new(fast_policy(), true, tx);

        let count = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let counter = count.clone();
            machine.schedule("peer-a", async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(machine.attempts("peer-a"), 3);
    }

    #[tokio::test]
    async fn test_degraded_event_fires_once_without_relay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let machine = IceRecoveryStateMachine::new(fast_policy(), false, tx);

        for _ in 0..3 {
            machine.schedule("peer-a", async {});
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        // Two more triggers past the bound, across two peers
        for _ in 0..3 {
            machine.schedule("peer-a", async {});
        }
        for _ in 0..4 {
            machine.schedule("peer-b", async {});
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut degraded = 0;
        while let Ok(event) = rx.try_recv() {
            if event == VoiceMeshEvent::ConnectionDegraded {
                degraded += 1;
            }
        }
        assert_eq!(degraded, 1);
    }

    #[tokio::test]
    async fn test_no_degraded_event_with_relay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let machine = IceRecoveryStateMachine::new(fast_policy(), true, tx);

        for _ in 0..5 {
            machine.schedule("peer-a", async {});
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reset_restores_budget_and_cancels_pending() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let machine = IceRecoveryStateMachine::new(
            RecoveryPolicy {
                max_attempts: 3,
                restart_delay_ms: 200,
            },
            false,
            tx,
        );

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        machine.schedule("peer-a", async move {
            flag.store(true, Ordering::SeqCst);
        });
        machine.reset("peer-a");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(machine.attempts("peer-a"), 0);
    }

    #[tokio::test]
    async fn test_remove_drops_state() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let machine = IceRecoveryStateMachine::new(fast_policy(), false, tx);

        machine.schedule("peer-a", async {});
        machine.remove("peer-a");
        assert_eq!(machine.attempts("peer-a"), 0);
    }
}
