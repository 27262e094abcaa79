//! Test doubles shared by unit tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{MeterSrvError, Result};
use crate::protocol::RegisterSource;
use crate::router::SnapshotSink;
use crate::runtime::Connector;
use crate::snapshot::DecodedSnapshot;

// ==================== Register source ====================

#[derive(Debug, Default)]
struct Script {
    requests: Vec<(u16, u16)>,
    short_at: HashMap<u16, usize>,
    fail_at: HashSet<u16>,
}

/// Register source whose value at every address is the address itself.
///
/// Clones share one script and request log, so a source handed to a
/// connector can still be inspected and reprogrammed by the test.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    script: Arc<Mutex<Script>>,
}

impl ScriptedSource {
    pub fn counting() -> Self {
        Self::default()
    }

    /// Answer requests starting at `address` with only `len` words
    pub fn short_at(self, address: u16, len: usize) -> Self {
        self.script.lock().short_at.insert(address, len);
        self
    }

    /// Fail requests starting at `address`
    pub fn fail_at(self, address: u16) -> Self {
        self.set_failing(address, true);
        self
    }

    pub fn set_failing(&self, address: u16, failing: bool) {
        let mut script = self.script.lock();
        if failing {
            script.fail_at.insert(address);
        } else {
            script.fail_at.remove(&address);
        }
    }

    /// Every `(address, count)` requested so far, in order
    pub fn requests(&self) -> Vec<(u16, u16)> {
        self.script.lock().requests.clone()
    }
}

#[async_trait]
impl RegisterSource for ScriptedSource {
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        let mut script = self.script.lock();
        script.requests.push((address, count));

        if script.fail_at.contains(&address) {
            return Err(MeterSrvError::timeout(format!("no reply for {address}")));
        }

        let len = script
            .short_at
            .get(&address)
            .copied()
            .unwrap_or(usize::from(count));
        Ok((0..len).map(|i| address.wrapping_add(i as u16)).collect())
    }
}

// ==================== Connector ====================

#[derive(Debug, Default)]
struct ConnectorCounters {
    attempts: AtomicU32,
    failures_left: AtomicU32,
    in_flight: AtomicU32,
    max_concurrent: AtomicU32,
}

/// Connector handing out clones of a template connection
#[derive(Debug, Clone)]
pub struct MockConnector<T> {
    template: T,
    connect_delay: Duration,
    counters: Arc<ConnectorCounters>,
}

impl<T> MockConnector<T> {
    pub fn new(template: T) -> Self {
        Self {
            template,
            connect_delay: Duration::ZERO,
            counters: Arc::new(ConnectorCounters::default()),
        }
    }

    /// Refuse the first `n` attempts
    pub fn failing_first(self, n: u32) -> Self {
        self.counters.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.counters.attempts.load(Ordering::SeqCst)
    }

    /// Highest number of attempts ever running at once
    pub fn max_concurrent(&self) -> u32 {
        self.counters.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T> Connector for MockConnector<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Connection = T;

    fn target(&self) -> String {
        "mock://device".to_string()
    }

    async fn connect(&self) -> Result<T> {
        let counters = &self.counters;
        counters.attempts.fetch_add(1, Ordering::SeqCst);
        let running = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_concurrent.fetch_max(running, Ordering::SeqCst);

        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        counters.in_flight.fetch_sub(1, Ordering::SeqCst);

        let refused = counters
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(MeterSrvError::connection("connection refused"));
        }
        Ok(self.template.clone())
    }
}

// ==================== Snapshot sink ====================

/// Sink that records every persisted snapshot
#[derive(Debug)]
pub struct RecordingSink {
    ready: AtomicBool,
    fail: AtomicBool,
    write_delay: Duration,
    records: Mutex<Vec<DecodedSnapshot>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(true),
            fail: AtomicBool::new(false),
            write_delay: Duration::ZERO,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<DecodedSnapshot> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl SnapshotSink for RecordingSink {
    fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn persist(&self, snapshot: &DecodedSnapshot) -> Result<()> {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(MeterSrvError::storage("injected write failure"));
        }
        self.records.lock().push(snapshot.clone());
        Ok(())
    }
}
