//! Dual-cadence sink router
//!
//! Every published snapshot replaces the live value at once. Independently,
//! once `persist_interval` has passed since the last confirmed durable write,
//! the snapshot is also handed to the durable sink in a background task. The
//! durable branch is lossy: nothing is queued while storage is unavailable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::snapshot::DecodedSnapshot;

/// Durable destination for periodic snapshots
#[async_trait]
pub trait SnapshotSink: Send + Sync + 'static {
    /// Whether a write can be attempted now; may kick off a reconnect
    fn ready(&self) -> bool;

    async fn persist(&self, snapshot: &DecodedSnapshot) -> Result<()>;
}

type LiveValue = Option<Arc<DecodedSnapshot>>;

/// Live snapshot holder plus periodic persistence for one device
pub struct SinkRouter<S: SnapshotSink> {
    live: watch::Sender<LiveValue>,
    sink: Arc<S>,
    persist_interval: Duration,
    /// Instant of the last confirmed durable write
    cursor: Arc<Mutex<Instant>>,
    in_flight: Arc<AtomicBool>,
}

impl<S: SnapshotSink> SinkRouter<S> {
    /// Create a router whose persistence cursor starts now
    pub fn new(sink: Arc<S>, persist_interval: Duration) -> Self {
        let (live, _) = watch::channel(None);
        Self {
            live,
            sink,
            persist_interval,
            cursor: Arc::new(Mutex::new(Instant::now())),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn persist_interval(&self) -> Duration {
        self.persist_interval
    }

    /// Most recent snapshot, if any cycle has completed
    pub fn latest(&self) -> Option<Arc<DecodedSnapshot>> {
        self.live.borrow().clone()
    }

    pub fn persistence_cursor(&self) -> Instant {
        *self.cursor.lock()
    }

    /// Whether a durable write is currently running
    pub fn persist_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> LiveFeed {
        LiveFeed {
            rx: self.live.subscribe(),
            primed: false,
        }
    }

    /// Publish a snapshot captured now
    pub fn publish(&self, snapshot: DecodedSnapshot) -> Option<JoinHandle<()>> {
        self.publish_at(snapshot, Instant::now())
    }

    /// Publish with an explicit clock reading.
    ///
    /// Always replaces the live snapshot. Returns the handle of the durable
    /// write when one was started.
    pub fn publish_at(&self, snapshot: DecodedSnapshot, now: Instant) -> Option<JoinHandle<()>> {
        let snapshot = Arc::new(snapshot);
        self.live.send_replace(Some(Arc::clone(&snapshot)));
        debug!(
            "Live snapshot updated: {} ({} fields)",
            snapshot.device,
            snapshot.values.len()
        );

        let elapsed = now.saturating_duration_since(*self.cursor.lock());
        if elapsed < self.persist_interval {
            return None;
        }

        if !self.sink.ready() {
            debug!(
                "Persistence due for {} but storage is not ready, skipping",
                snapshot.device
            );
            return None;
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Durable write already in flight for {}", snapshot.device);
            return None;
        }

        let sink = Arc::clone(&self.sink);
        let cursor = Arc::clone(&self.cursor);
        let in_flight = Arc::clone(&self.in_flight);
        Some(tokio::spawn(async move {
            match sink.persist(&snapshot).await {
                Ok(()) => {
                    {
                        let mut cursor = cursor.lock();
                        if now > *cursor {
                            *cursor = now;
                        }
                    }
                    info!(
                        "Persisted snapshot for {} captured at {}",
                        snapshot.device, snapshot.captured_at
                    );
                },
                Err(e) => warn!("Persist failed for {}: {}", snapshot.device, e),
            }
            in_flight.store(false, Ordering::Release);
        }))
    }
}

/// Subscription to a router's live snapshots
#[derive(Debug, Clone)]
pub struct LiveFeed {
    rx: watch::Receiver<LiveValue>,
    primed: bool,
}

impl LiveFeed {
    /// Next snapshot for this subscriber.
    ///
    /// The first call yields the current snapshot if one exists; later calls
    /// wait for the next publish. Returns `None` once the router is dropped.
    pub async fn recv(&mut self) -> Option<Arc<DecodedSnapshot>> {
        if !self.primed {
            self.primed = true;
            if let Some(snapshot) = self.rx.borrow_and_update().clone() {
                return Some(snapshot);
            }
        }

        loop {
            self.rx.changed().await.ok()?;
            if let Some(snapshot) = self.rx.borrow_and_update().clone() {
                return Some(snapshot);
            }
        }
    }

    /// Current snapshot without waiting
    pub fn current(&self) -> Option<Arc<DecodedSnapshot>> {
        self.rx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::snapshot::FieldValue;
    use crate::test_utils::RecordingSink;

    const PERSIST: Duration = Duration::from_secs(120);

    fn snapshot(voltage: f64) -> DecodedSnapshot {
        let mut values = BTreeMap::new();
        values.insert(
            "VL1".to_string(),
            FieldValue {
                value: voltage,
                unit: "V".to_string(),
                description: None,
            },
        );
        DecodedSnapshot::new("Meter-1", Utc::now(), values)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_write_over_one_persist_interval() {
        let sink = Arc::new(RecordingSink::new());
        let router = SinkRouter::new(Arc::clone(&sink), PERSIST);
        let start = Instant::now();

        let mut write_times = Vec::new();
        for step in 0..=60u64 {
            let t = Duration::from_secs(step * 2);
            if let Some(handle) = router.publish_at(snapshot(step as f64), start + t) {
                handle.await.expect("persist task");
                write_times.push(t.as_secs());
            }
        }

        assert_eq!(write_times, vec![120]);
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.records()[0].value("VL1"), Some(60.0));
        assert_eq!(router.persistence_cursor(), start + PERSIST);
        assert_eq!(router.latest().and_then(|s| s.value("VL1")), Some(60.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_not_ready_skips_without_backfill() {
        let sink = Arc::new(RecordingSink::new());
        sink.set_ready(false);
        let router = SinkRouter::new(Arc::clone(&sink), PERSIST);
        let start = Instant::now();

        assert!(router.publish_at(snapshot(230.0), start + PERSIST).is_none());
        assert_eq!(router.latest().and_then(|s| s.value("VL1")), Some(230.0));
        assert_eq!(router.persistence_cursor(), start);
        assert!(sink.records().is_empty());

        sink.set_ready(true);
        let handle = router
            .publish_at(snapshot(231.0), start + PERSIST + Duration::from_secs(2))
            .expect("write is due once storage recovers");
        handle.await.expect("persist task");

        // Only the current snapshot is written; the skipped one is gone
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value("VL1"), Some(231.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_leaves_cursor() {
        let sink = Arc::new(RecordingSink::new());
        sink.fail_writes(true);
        let router = SinkRouter::new(Arc::clone(&sink), PERSIST);
        let start = Instant::now();

        let handle = router.publish_at(snapshot(1.0), start + PERSIST).expect("due");
        handle.await.expect("persist task");
        assert_eq!(router.persistence_cursor(), start);
        assert!(!router.persist_in_flight());

        // The next cycle tries again
        sink.fail_writes(false);
        let handle = router
            .publish_at(snapshot(2.0), start + PERSIST + Duration::from_secs(2))
            .expect("still due");
        handle.await.expect("persist task");
        assert_eq!(
            router.persistence_cursor(),
            start + PERSIST + Duration::from_secs(2)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_durable_write_in_flight() {
        let sink = Arc::new(RecordingSink::new().with_write_delay(Duration::from_secs(10)));
        let router = SinkRouter::new(Arc::clone(&sink), PERSIST);
        let start = Instant::now();

        let first = router.publish_at(snapshot(1.0), start + PERSIST).expect("due");
        tokio::task::yield_now().await;
        assert!(router.persist_in_flight());
        assert!(router
            .publish_at(snapshot(2.0), start + PERSIST + Duration::from_secs(2))
            .is_none());
        // Live feed is not held up by the slow write
        assert_eq!(router.latest().and_then(|s| s.value("VL1")), Some(2.0));

        first.await.expect("persist task");
        assert_eq!(sink.records().len(), 1);
        assert!(!router.persist_in_flight());
    }

    #[tokio::test]
    async fn test_publish_is_idempotent_and_last_write_wins() {
        let sink = Arc::new(RecordingSink::new());
        let router = SinkRouter::new(sink, PERSIST);
        assert!(router.latest().is_none());

        let snap = snapshot(230.5);
        router.publish(snap.clone());
        router.publish(snap.clone());
        assert_eq!(router.latest().as_deref(), Some(&snap));

        router.publish(snapshot(229.0));
        assert_eq!(router.latest().and_then(|s| s.value("VL1")), Some(229.0));
    }

    #[tokio::test]
    async fn test_live_feed_delivers_latest_then_updates() {
        let sink = Arc::new(RecordingSink::new());
        let router = SinkRouter::new(sink, PERSIST);

        let mut early = router.subscribe();
        assert!(early.current().is_none());

        router.publish(snapshot(1.0));
        router.publish(snapshot(2.0));

        // A late subscriber sees the current value straight away
        let mut late = router.subscribe();
        assert_eq!(late.recv().await.and_then(|s| s.value("VL1")), Some(2.0));
        assert_eq!(early.recv().await.and_then(|s| s.value("VL1")), Some(2.0));

        router.publish(snapshot(3.0));
        assert_eq!(late.recv().await.and_then(|s| s.value("VL1")), Some(3.0));

        drop(router);
        assert_eq!(early.recv().await.and_then(|s| s.value("VL1")), Some(3.0));
        assert!(early.recv().await.is_none());
        assert!(late.recv().await.is_none());
    }
}
