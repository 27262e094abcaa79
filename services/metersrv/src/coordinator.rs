//! Acquisition cycle coordinator
//!
//! Once per poll interval: check the transport, read every block, decode,
//! publish. A failed read or decode aborts that cycle only; the transport is
//! reset and the previous live snapshot stays visible.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::decode::decode;
use crate::error::{MeterSrvError, Result};
use crate::layout::{DeviceEndpoint, FieldLayout};
use crate::protocol::RegisterSource;
use crate::reader::read_all_blocks;
use crate::router::{SinkRouter, SnapshotSink};
use crate::runtime::{ConnectionManager, ConnectionState, Connector};
use crate::snapshot::{DecodedSnapshot, FieldValue};

/// Result of one acquisition cycle
#[derive(Debug)]
pub enum CycleOutcome {
    /// Transport was not ready; a reconnect has been requested
    TransportNotReady,
    /// Read or decode failed and the transport was reset
    Aborted(MeterSrvError),
    /// A snapshot was published; `persist` is the durable write started, if any
    Published { persist: Option<JoinHandle<()>> },
}

impl CycleOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, CycleOutcome::Published { .. })
    }
}

/// Drives one device's poll-read-decode-publish loop
pub struct Coordinator<T, S>
where
    T: Connector,
    T::Connection: RegisterSource,
    S: SnapshotSink,
{
    device: Arc<DeviceEndpoint>,
    layout: Arc<FieldLayout>,
    transport: ConnectionManager<T>,
    router: SinkRouter<S>,
    poll_interval: Duration,
    max_chunk: u16,
}

impl<T, S> Coordinator<T, S>
where
    T: Connector,
    T::Connection: RegisterSource,
    S: SnapshotSink,
{
    pub fn new(
        device: Arc<DeviceEndpoint>,
        layout: Arc<FieldLayout>,
        transport: ConnectionManager<T>,
        router: SinkRouter<S>,
        poll_interval: Duration,
        max_chunk: u16,
    ) -> Self {
        Self {
            device,
            layout,
            transport,
            router,
            poll_interval,
            max_chunk,
        }
    }

    pub fn device(&self) -> &DeviceEndpoint {
        &self.device
    }

    pub fn transport(&self) -> &ConnectionManager<T> {
        &self.transport
    }

    pub fn router(&self) -> &SinkRouter<S> {
        &self.router
    }

    /// Run a single cycle to completion
    pub async fn run_cycle(&self) -> CycleOutcome {
        if self.transport.ensure_ready() != ConnectionState::Ready {
            debug!(
                "{}: transport not ready ({}), skipping cycle",
                self.device.name,
                self.transport.state()
            );
            return CycleOutcome::TransportNotReady;
        }

        let Some(mut client) = self.transport.take() else {
            debug!("{}: transport busy, skipping cycle", self.device.name);
            return CycleOutcome::TransportNotReady;
        };

        match self.acquire(&mut client).await {
            Ok(values) => {
                self.transport.restore(client);
                let snapshot = DecodedSnapshot::new(self.device.name.clone(), Utc::now(), values);
                let persist = self.router.publish(snapshot);
                CycleOutcome::Published { persist }
            },
            Err(e) => {
                drop(client);
                if e.is_read_failure() {
                    warn!("{}: cycle aborted: {}", self.device.name, e);
                } else {
                    error!(
                        "{}: cycle aborted, layout does not match device: {}",
                        self.device.name, e
                    );
                }
                self.transport.fault(e.to_string());
                CycleOutcome::Aborted(e)
            },
        }
    }

    async fn acquire(&self, client: &mut T::Connection) -> Result<BTreeMap<String, FieldValue>> {
        let raw = read_all_blocks(client, self.layout.blocks(), self.max_chunk).await?;
        decode(&raw, &self.layout)
    }

    /// Poll until `cancel` fires; cycles never overlap and are never interrupted.
    ///
    /// A durable write still running at cancellation is awaited before return.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "{}: polling {} every {:?}, archiving every {:?} ({} registers in {} blocks)",
            self.device.name,
            self.device.address(),
            self.poll_interval,
            self.router.persist_interval(),
            self.layout.register_count(),
            self.layout.blocks().len()
        );

        let mut published = 0u64;
        let mut aborted = 0u64;
        let mut pending_write: Option<JoinHandle<()>> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }

            match self.run_cycle().await {
                CycleOutcome::Published { persist } => {
                    published += 1;
                    if persist.is_some() {
                        pending_write = persist;
                    }
                },
                CycleOutcome::Aborted(_) => aborted += 1,
                CycleOutcome::TransportNotReady => {},
            }
        }

        if let Some(write) = pending_write {
            if !write.is_finished() {
                debug!("{}: waiting for durable write to finish", self.device.name);
            }
            if let Err(e) = write.await {
                warn!("{}: durable write task failed: {}", self.device.name, e);
            }
        }

        info!(
            "{}: polling stopped ({} cycles published, {} aborted)",
            self.device.name, published, aborted
        );
    }
}
