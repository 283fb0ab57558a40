//! Snapshot cache and live-subscriber broadcast
//!
//! One periodic task samples both pollers' latest values (non-blocking,
//! whatever was last published), assembles a timestamped [`Snapshot`],
//! replaces the cached copy and pushes it to every registered subscriber.
//! Delivery is best-effort and independent per subscriber: a gone subscriber
//! is dropped from the registry without disturbing the others, and a slow
//! one merely misses that tick.

use crate::logging::StructuredLogger;
use crate::types::{ChannelMap, SensorFrame, Snapshot};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};

/// Per-subscriber queue depth; a subscriber further behind than this skips
/// ticks rather than queueing history.
const SUBSCRIBER_QUEUE: usize = 8;

const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Thread-safe registry of live snapshot subscribers.
///
/// Broadcast iterates over a snapshot copy of the registry, so removal
/// during iteration is safe by construction.
struct SubscriberRegistry {
    inner: StdMutex<RegistryInner>,
}

struct RegistryInner {
    next_id: u64,
    senders: HashMap<u64, mpsc::Sender<Snapshot>>,
}

impl SubscriberRegistry {
    fn new() -> Self {
        Self {
            inner: StdMutex::new(RegistryInner {
                next_id: 0,
                senders: HashMap::new(),
            }),
        }
    }

    fn add(&self) -> mpsc::Receiver<Snapshot> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        if let Ok(mut inner) = self.inner.lock() {
            let id = inner.next_id;
            inner.next_id += 1;
            inner.senders.insert(id, tx);
        }
        rx
    }

    fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.senders.len()).unwrap_or(0)
    }

    /// Deliver one snapshot to every subscriber, removing the ones whose
    /// channel has closed. Returns how many were removed.
    fn broadcast(&self, snapshot: &Snapshot) -> usize {
        let targets: Vec<(u64, mpsc::Sender<Snapshot>)> = match self.inner.lock() {
            Ok(inner) => inner
                .senders
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect(),
            Err(_) => return 0,
        };

        let mut dead = Vec::new();
        for (id, tx) in &targets {
            match tx.try_send(snapshot.clone()) {
                Ok(()) => {}
                // A slow subscriber misses this tick but stays registered
                Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
            }
        }

        if !dead.is_empty()
            && let Ok(mut inner) = self.inner.lock()
        {
            for id in &dead {
                inner.senders.remove(id);
            }
        }
        dead.len()
    }
}

/// Handle to the snapshot cache and its broadcast task
pub struct SnapshotBroadcaster {
    /// Last assembled snapshot
    latest: watch::Receiver<Snapshot>,

    /// Live subscribers
    registry: Arc<SubscriberRegistry>,

    /// Cooperative stop signal
    stop: mpsc::UnboundedSender<()>,

    /// Broadcast task, taken on shutdown
    task: StdMutex<Option<JoinHandle<()>>>,

    /// Logger
    logger: StructuredLogger,
}

impl SnapshotBroadcaster {
    /// Start the periodic snapshot/broadcast task at `sample_frequency` Hz,
    /// sampling the given poller latest-value cells.
    pub fn start(
        sample_frequency: f64,
        analyzer: watch::Receiver<ChannelMap>,
        sensor: watch::Receiver<SensorFrame>,
    ) -> Self {
        let logger = crate::logging::get_logger("snapshot");
        let (latest_tx, latest_rx) = watch::channel(Snapshot::default());
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(SubscriberRegistry::new());
        let period = Duration::from_secs_f64(1.0 / sample_frequency);

        let task = tokio::spawn(broadcast_loop(
            period,
            analyzer,
            sensor,
            latest_tx,
            Arc::clone(&registry),
            stop_rx,
        ));
        logger.info("Snapshot broadcaster started");

        Self {
            latest: latest_rx,
            registry,
            stop: stop_tx,
            task: StdMutex::new(Some(task)),
            logger,
        }
    }

    /// Last assembled snapshot; `Snapshot::default()` before the first tick
    pub fn read(&self) -> Snapshot {
        self.latest.borrow().clone()
    }

    /// Register a live subscriber. Dropping the receiver unregisters it on
    /// the next broadcast tick.
    pub fn subscribe(&self) -> mpsc::Receiver<Snapshot> {
        self.registry.add()
    }

    /// Number of currently registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop the periodic task. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(());
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(mut task) = task {
            if timeout(JOIN_TIMEOUT, &mut task).await.is_err() {
                self.logger.warn("Broadcast task did not stop in time, aborting");
                task.abort();
            }
            self.logger.info("Snapshot broadcaster stopped");
        }
    }
}

async fn broadcast_loop(
    period: Duration,
    analyzer: watch::Receiver<ChannelMap>,
    sensor: watch::Receiver<SensorFrame>,
    latest: watch::Sender<Snapshot>,
    registry: Arc<SubscriberRegistry>,
    mut stop: mpsc::UnboundedReceiver<()>,
) {
    let logger = crate::logging::get_logger("snapshot");
    // First snapshot lands one full period after startup
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = Snapshot {
                    time: chrono::Utc::now(),
                    analyzer: analyzer.borrow().clone(),
                    sensor: sensor.borrow().clone(),
                };
                latest.send_replace(snapshot.clone());
                let removed = registry.broadcast(&snapshot);
                if removed > 0 {
                    logger.debug(&format!("Dropped {} gone subscriber(s)", removed));
                }
            }
            _ = stop.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_removes_closed_subscriber_once() {
        let registry = SubscriberRegistry::new();
        let rx_a = registry.add();
        let rx_b = registry.add();
        assert_eq!(registry.len(), 2);

        drop(rx_a);
        let removed = registry.broadcast(&Snapshot::default());
        assert_eq!(removed, 1);
        assert_eq!(registry.len(), 1);

        // Second broadcast finds nothing further to remove
        let removed = registry.broadcast(&Snapshot::default());
        assert_eq!(removed, 0);
        assert_eq!(registry.len(), 1);
        drop(rx_b);
    }

    #[test]
    fn test_registry_full_queue_keeps_subscriber() {
        let registry = SubscriberRegistry::new();
        let mut rx = registry.add();

        for _ in 0..SUBSCRIBER_QUEUE + 3 {
            registry.broadcast(&Snapshot::default());
        }
        // Queue overflowed, but the subscriber is still registered
        assert_eq!(registry.len(), 1);

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_QUEUE);
    }
}
