//! Connection lifecycle management
//!
//! A [`ConnectionManager`] owns one live connection to an external dependency
//! (the field device or the durable store) and the background task that
//! re-establishes it. Callers only ever observe [`ConnectionState`]; connect
//! failures are absorbed here and never propagate to the acquisition cycle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::reconnect::ReconnectPolicy;
use crate::error::Result;

/// Opens connections of one kind to one target
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Human-readable target for logs
    fn target(&self) -> String;

    async fn connect(&self) -> Result<Self::Connection>;
}

/// Connection state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no attempt made yet
    Disconnected,
    /// An attempt is in progress
    Connecting,
    /// Connected and usable
    Ready,
    /// Last attempt failed or the connection was dropped after an error
    Faulted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a managed connection
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_attempt: Option<DateTime<Utc>>,
    /// Consecutive failed attempts since the last success
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_attempt: None,
            attempts: 0,
            last_error: None,
        }
    }
}

struct Shared<C: Connector> {
    connector: C,
    policy: ReconnectPolicy,
    status: RwLock<ConnectionStatus>,
    slot: Mutex<Option<C::Connection>>,
    reconnecting: AtomicBool,
    cancel: CancellationToken,
}

/// Lifecycle owner for one dependency connection
pub struct ConnectionManager<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("target", &self.shared.connector.target())
            .field("status", &*self.shared.status.read())
            .finish()
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager in the `Disconnected` state; nothing connects until
    /// [`ensure_ready`](Self::ensure_ready) or [`reconnect`](Self::reconnect)
    pub fn new(connector: C, policy: ReconnectPolicy, cancel: CancellationToken) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                policy,
                status: RwLock::new(ConnectionStatus::default()),
                slot: Mutex::new(None),
                reconnecting: AtomicBool::new(false),
                cancel,
            }),
        }
    }

    pub fn target(&self) -> String {
        self.shared.connector.target()
    }

    pub fn connector(&self) -> &C {
        &self.shared.connector
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status.read().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Whether a reconnect attempt or loop is currently running
    pub fn is_reconnecting(&self) -> bool {
        self.shared.reconnecting.load(Ordering::Acquire)
    }

    /// Report readiness, starting a background reconnect loop if needed.
    ///
    /// No-op while `Ready`. Otherwise spawns at most one reconnect task; further
    /// calls while it runs return immediately. Must be called from within a
    /// tokio runtime.
    pub fn ensure_ready(&self) -> ConnectionState {
        let state = self.state();
        if state == ConnectionState::Ready || self.shared.cancel.is_cancelled() {
            return state;
        }

        if self.try_begin_reconnect() {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                shared.reconnect_loop().await;
                shared.reconnecting.store(false, Ordering::Release);
            });
        }
        self.state()
    }

    /// Perform one awaited connection attempt.
    ///
    /// Returns immediately with the current state when already `Ready` or when
    /// another attempt holds the single-attempt guard.
    pub async fn reconnect(&self) -> ConnectionState {
        if self.is_ready() || !self.try_begin_reconnect() {
            return self.state();
        }

        let _ = self.shared.attempt().await;
        self.shared.reconnecting.store(false, Ordering::Release);
        self.state()
    }

    /// Check the live connection out for exclusive use.
    ///
    /// Returns `None` when not `Ready` or when another caller holds it.
    pub fn take(&self) -> Option<C::Connection> {
        if !self.is_ready() {
            return None;
        }
        self.shared.slot.lock().take()
    }

    /// Check a connection back in; dropped if the manager faulted meanwhile
    pub fn restore(&self, connection: C::Connection) {
        let status = self.shared.status.read();
        if status.state == ConnectionState::Ready {
            let mut slot = self.shared.slot.lock();
            if slot.is_none() {
                *slot = Some(connection);
            }
        }
    }

    /// Drop the connection after an I/O failure and mark the manager `Faulted`
    pub fn fault(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let dropped = self.shared.slot.lock().take();
        drop(dropped);
        self.shared
            .set_state(ConnectionState::Faulted, Some(reason));
    }

    /// Hand back the connection and mark the manager `Disconnected`
    pub fn disconnect(&self) -> Option<C::Connection> {
        let connection = self.shared.slot.lock().take();
        self.shared.set_state(ConnectionState::Disconnected, None);
        connection
    }
}

impl<C> ConnectionManager<C>
where
    C: Connector,
    C::Connection: Clone,
{
    /// Shared handle for pooled connections; `None` unless `Ready`
    pub fn handle(&self) -> Option<C::Connection> {
        if !self.is_ready() {
            return None;
        }
        self.shared.slot.lock().clone()
    }
}

impl<C: Connector> ConnectionManager<C> {
    fn try_begin_reconnect(&self) -> bool {
        self.shared
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl<C: Connector> Shared<C> {
    fn set_state(&self, new: ConnectionState, error: Option<String>) {
        let mut status = self.status.write();
        let old = status.state;
        status.state = new;
        match new {
            ConnectionState::Ready => {
                status.attempts = 0;
                status.last_error = None;
            },
            ConnectionState::Faulted => status.last_error = error.clone(),
            _ => {},
        }
        drop(status);

        if old == new {
            return;
        }
        let target = self.connector.target();
        match (new, error) {
            (ConnectionState::Ready, _) => info!("{}: {} -> {}", target, old, new),
            (ConnectionState::Faulted, Some(err)) => {
                warn!("{}: {} -> {} ({})", target, old, new, err)
            },
            _ => debug!("{}: {} -> {}", target, old, new),
        }
    }

    /// One connect attempt; updates status either way
    async fn attempt(&self) -> Result<()> {
        {
            let mut status = self.status.write();
            status.attempts = status.attempts.saturating_add(1);
            status.last_attempt = Some(Utc::now());
        }
        self.set_state(ConnectionState::Connecting, None);

        match self.connector.connect().await {
            Ok(connection) => {
                *self.slot.lock() = Some(connection);
                self.set_state(ConnectionState::Ready, None);
                Ok(())
            },
            Err(e) => {
                self.set_state(ConnectionState::Faulted, Some(e.to_string()));
                Err(e)
            },
        }
    }

    async fn reconnect_loop(&self) {
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                debug!("{}: reconnect cancelled", self.connector.target());
                return;
            }

            attempt += 1;
            if self.attempt().await.is_ok() {
                return;
            }

            if self.policy.exhausted(attempt) {
                warn!(
                    "{}: giving up after {} reconnection attempts",
                    self.connector.target(),
                    attempt
                );
                return;
            }

            let delay = self.policy.delay_for_attempt(attempt);
            debug!(
                "{}: waiting {:?} before reconnection attempt {}",
                self.connector.target(),
                delay,
                attempt + 1
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_utils::MockConnector;

    fn manager(connector: MockConnector<u32>) -> ConnectionManager<MockConnector<u32>> {
        ConnectionManager::new(connector, ReconnectPolicy::default(), CancellationToken::new())
    }

    /// Let spawned tasks run without advancing the paused clock
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_ready_connects_in_background() {
        let connector = MockConnector::new(7u32);
        let manager = manager(connector.clone());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.ensure_ready();
        settle().await;

        assert!(manager.is_ready());
        assert_eq!(manager.handle(), Some(7));
        assert_eq!(connector.attempts(), 1);
        assert!(!manager.is_reconnecting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_retries_after_policy_delay() {
        let connector = MockConnector::new(1u32).failing_first(2);
        let manager = manager(connector.clone());

        manager.ensure_ready();
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Faulted);
        assert_eq!(connector.attempts(), 1);
        let status = manager.status();
        assert_eq!(status.attempts, 1);
        assert!(status.last_error.is_some());
        assert!(status.last_attempt.is_some());

        // Nothing happens before the 5s delay elapses
        tokio::time::advance(Duration::from_millis(4900)).await;
        settle().await;
        assert_eq!(connector.attempts(), 1);

        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(connector.attempts(), 2);
        assert_eq!(manager.state(), ConnectionState::Faulted);

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(connector.attempts(), 3);
        assert!(manager.is_ready());
        assert_eq!(manager.status().attempts, 0);
        assert!(manager.status().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_ready_is_idempotent() {
        let connector = MockConnector::new(1u32).failing_first(u32::MAX);
        let manager = manager(connector.clone());

        for _ in 0..5 {
            manager.ensure_ready();
        }
        settle().await;
        for _ in 0..5 {
            manager.ensure_ready();
        }
        settle().await;

        // A single loop is running and has made a single attempt
        assert_eq!(connector.attempts(), 1);
        assert!(manager.is_reconnecting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_attempt_outstanding() {
        let connector = MockConnector::new(1u32).with_connect_delay(Duration::from_secs(1));
        let manager = manager(connector.clone());

        manager.ensure_ready();
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Connecting);

        // The awaited form observes the in-flight attempt instead of starting another
        assert_eq!(manager.reconnect().await, ConnectionState::Connecting);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert!(manager.is_ready());
        assert_eq!(connector.attempts(), 1);
        assert_eq!(connector.max_concurrent(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_awaits_one_attempt() {
        let connector = MockConnector::new(3u32).failing_first(1);
        let manager = manager(connector.clone());

        assert_eq!(manager.reconnect().await, ConnectionState::Faulted);
        assert_eq!(manager.reconnect().await, ConnectionState::Ready);
        // No-op once ready
        assert_eq!(manager.reconnect().await, ConnectionState::Ready);
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_restore_and_fault() {
        let connector = MockConnector::new(9u32);
        let manager = manager(connector.clone());
        manager.reconnect().await;

        let conn = manager.take().expect("connection available");
        assert_eq!(conn, 9);
        // Checked out: a second take gets nothing
        assert!(manager.take().is_none());
        manager.restore(conn);
        assert_eq!(manager.take(), Some(9));

        manager.fault("read failed");
        assert_eq!(manager.state(), ConnectionState::Faulted);
        assert_eq!(manager.status().last_error.as_deref(), Some("read failed"));
        // A connection returned after the fault is discarded
        manager.restore(9);
        assert!(manager.take().is_none());
        assert!(manager.handle().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts_stops_loop() {
        let connector = MockConnector::new(1u32).failing_first(u32::MAX);
        let policy = ReconnectPolicy {
            max_attempts: 2,
            ..ReconnectPolicy::default()
        };
        let manager = ConnectionManager::new(connector.clone(), policy, CancellationToken::new());

        manager.ensure_ready();
        settle().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(connector.attempts(), 2);
        assert!(!manager.is_reconnecting());

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(connector.attempts(), 2);

        // A later check starts a fresh run
        manager.ensure_ready();
        settle().await;
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_reconnect_loop() {
        let connector = MockConnector::new(1u32).failing_first(u32::MAX);
        let cancel = CancellationToken::new();
        let manager =
            ConnectionManager::new(connector.clone(), ReconnectPolicy::default(), cancel.clone());

        manager.ensure_ready();
        settle().await;
        cancel.cancel();
        settle().await;
        assert!(!manager.is_reconnecting());

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(connector.attempts(), 1);
    }
}
