/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * DbKeeper - Database lifecycle orchestration for document stores
 * Built with Rust for superior performance and reliability
 *
 * @file connection.rs
 * @brief Connection state machine, retry/backoff and background health checks
 */

use crate::config::DatabaseConfig;
use crate::error::{DbKeeperError, Result};
use crate::store::{DocumentStore, StoreConnector};
use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            Self::Connected => 1.0,
            Self::Connecting | Self::Reconnecting => 0.5,
            Self::Disconnected | Self::Error => 0.0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one liveness probe. Always produced, even when the probe fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub connected: bool,
    pub state: ConnectionState,
    pub latency_ms: u64,
    pub database: Option<String>,
    pub collections: Option<u64>,
    pub objects: Option<u64>,
    pub data_size_bytes: Option<u64>,
    pub server_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    fn failed(state: ConnectionState, started: Instant, error: String) -> Self {
        Self {
            connected: false,
            state,
            latency_ms: started.elapsed().as_millis() as u64,
            database: None,
            collections: None,
            objects: None,
            data_size_bytes: None,
            server_version: None,
            error: Some(error),
            checked_at: Utc::now(),
        }
    }
}

/// Owns the single live store handle.
///
/// Other managers keep an `Arc<ConnectionManager>` and call [`store`](Self::store)
/// at the start of every operation so a reconnect is picked up transparently.
pub struct ConnectionManager {
    config: DatabaseConfig,
    connector: Arc<dyn StoreConnector>,
    state: RwLock<ConnectionState>,
    store: RwLock<Option<Arc<dyn DocumentStore>>>,
    retry_count: AtomicU32,
    shutdown: Mutex<CancellationToken>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    pub fn new(config: DatabaseConfig, connector: Arc<dyn StoreConnector>) -> Arc<Self> {
        Arc::new(Self {
            config,
            connector,
            state: RwLock::new(ConnectionState::Disconnected),
            store: RwLock::new(None),
            retry_count: AtomicU32::new(0),
            shutdown: Mutex::new(CancellationToken::new()),
            health_task: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.store.read().is_some()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    /// The live handle, or a connection error when there is none.
    pub fn store(&self) -> Result<Arc<dyn DocumentStore>> {
        self.store
            .read()
            .clone()
            .ok_or_else(|| DbKeeperError::Connection("database is not connected".to_string()))
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!("Connection state {} -> {}", previous, state);
        }
        gauge!("dbkeeper_connection_state").set(state.gauge_value());
    }

    /// Publish a freshly connected handle unless `token` was cancelled.
    /// Checked under the store lock, which `graceful_shutdown` also takes
    /// while cancelling, so a shutdown can never be followed by an install.
    fn install_store(&self, store: Arc<dyn DocumentStore>, token: &CancellationToken) -> bool {
        let mut slot = self.store.write();
        if token.is_cancelled() {
            return false;
        }
        *slot = Some(store);
        self.retry_count.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        true
    }

    /// Token for the current lifecycle; a cancelled one is replaced.
    fn lifecycle_token(&self) -> CancellationToken {
        let mut token = self.shutdown.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }

    /// Connect with bounded retries. Returns the live handle immediately when
    /// already connected.
    pub async fn connect(self: &Arc<Self>) -> Result<Arc<dyn DocumentStore>> {
        let _guard = self.connect_lock.lock().await;

        if self.is_connected() {
            return self.store();
        }

        let token = self.lifecycle_token();
        let max_retries = self.config.max_retries.max(1);
        let mut last_error = String::from("no connection attempt was made");

        self.set_state(ConnectionState::Connecting);
        info!("Connecting to database '{}'", self.config.name);

        for attempt in 1..=max_retries {
            counter!("dbkeeper_connection_attempts_total").increment(1);

            let outcome = tokio::select! {
                _ = token.cancelled() => break,
                outcome = timeout(self.config.connect_timeout(), self.connector.connect(&self.config)) => outcome,
            };

            match outcome {
                Ok(Ok(store)) => {
                    if !self.install_store(Arc::clone(&store), &token) {
                        break;
                    }
                    self.start_health_checks(token);
                    info!("Connected to database '{}' on attempt {}", self.config.name, attempt);
                    return Ok(store);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("connect timed out after {:?}", self.config.connect_timeout()),
            }

            counter!("dbkeeper_connection_failures_total").increment(1);
            warn!("Connection attempt {}/{} failed: {}", attempt, max_retries, last_error);

            if attempt < max_retries {
                let delay = self.config.connect_backoff.delay_for(
                    self.config.retry_delay(),
                    attempt,
                    self.config.max_retry_delay(),
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
        }

        if token.is_cancelled() {
            self.set_state(ConnectionState::Disconnected);
            return Err(DbKeeperError::Connection("connect cancelled by shutdown".to_string()));
        }

        self.set_state(ConnectionState::Error);
        error!("Giving up on database '{}' after {} attempts", self.config.name, max_retries);
        Err(DbKeeperError::Connection(last_error))
    }

    /// Ping plus a stats query. Never fails; problems land in `error`.
    pub async fn perform_health_check(&self) -> HealthReport {
        let started = Instant::now();

        let store = match self.store() {
            Ok(store) => store,
            Err(e) => return HealthReport::failed(self.state(), started, e.to_string()),
        };

        if let Err(e) = store.ping().await {
            return HealthReport::failed(self.state(), started, e.to_string());
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        histogram!("dbkeeper_health_check_latency_ms").record(latency_ms as f64);

        match store.server_stats().await {
            Ok(stats) => HealthReport {
                connected: true,
                state: self.state(),
                latency_ms,
                database: Some(stats.database),
                collections: Some(stats.collections),
                objects: Some(stats.objects),
                data_size_bytes: Some(stats.data_size_bytes),
                server_version: Some(stats.server_version),
                error: None,
                checked_at: Utc::now(),
            },
            Err(e) => HealthReport::failed(self.state(), started, e.to_string()),
        }
    }

    fn start_health_checks(self: &Arc<Self>, token: CancellationToken) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.health_check_interval();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(interval) => {}
                }

                let Some(manager) = weak.upgrade() else { break };
                let report = manager.perform_health_check().await;

                if report.connected {
                    debug!("Health check ok in {}ms", report.latency_ms);
                    continue;
                }

                warn!(
                    "Health check failed: {}",
                    report.error.as_deref().unwrap_or("unknown error")
                );
                if manager.state() == ConnectionState::Connected && !manager.handle_disconnect().await {
                    break;
                }
            }
            debug!("Health check loop stopped");
        });

        if let Some(previous) = self.health_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// React to a lost connection: drop the handle and reconnect with
    /// `reconnect_backoff`. Returns whether the connection was restored.
    pub async fn handle_disconnect(&self) -> bool {
        let token = self.shutdown.lock().clone();
        if token.is_cancelled() {
            return false;
        }

        warn!("Database connection lost");
        self.store.write().take();
        self.set_state(ConnectionState::Disconnected);

        while self.retry_count() < self.config.max_retries {
            let attempt = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
            self.set_state(ConnectionState::Reconnecting);

            let delay = self.config.reconnect_backoff.delay_for(
                self.config.retry_delay(),
                attempt,
                self.config.max_retry_delay(),
            );
            info!("Reconnecting in {:?} (attempt {}/{})", delay, attempt, self.config.max_retries);

            tokio::select! {
                _ = token.cancelled() => return false,
                _ = sleep(delay) => {}
            }

            counter!("dbkeeper_connection_attempts_total").increment(1);
            match timeout(self.config.connect_timeout(), self.connector.connect(&self.config)).await {
                Ok(Ok(store)) => {
                    if !self.install_store(store, &token) {
                        return false;
                    }
                    info!("Reconnected to database '{}'", self.config.name);
                    return true;
                }
                Ok(Err(e)) => warn!("Reconnect attempt {} failed: {}", attempt, e),
                Err(_) => warn!("Reconnect attempt {} timed out", attempt),
            }
        }

        error!("Reconnection abandoned after {} attempts", self.config.max_retries);
        self.set_state(ConnectionState::Disconnected);
        false
    }

    /// Stop the health loop and drop the handle. Safe to call repeatedly
    /// and while `connect` is in flight.
    pub async fn graceful_shutdown(&self) {
        let closed = {
            let mut slot = self.store.write();
            self.shutdown.lock().cancel();
            slot.take().is_some()
        };

        let task = self.health_task.lock().take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("Health check loop did not stop within {:?}, aborting", SHUTDOWN_GRACE);
                abort.abort();
            }
        }

        if closed {
            info!("Database connection closed");
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryConnector, MemoryStore};

    fn fast_config(max_retries: u32) -> DatabaseConfig {
        DatabaseConfig {
            max_retries,
            retry_delay_ms: 5,
            max_retry_delay_ms: 20,
            connect_timeout_ms: 500,
            health_check_interval_ms: 20,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connect_retries_then_succeeds() {
        let store = Arc::new(MemoryStore::new("trips"));
        let connector = Arc::new(MemoryConnector::failing_first(store, 2));
        let manager = ConnectionManager::new(fast_config(3), connector.clone());

        manager.connect().await.unwrap();
        assert_eq!(connector.attempts(), 3);
        assert_eq!(manager.state(), ConnectionState::Connected);

        // Idempotent.
        manager.connect().await.unwrap();
        assert_eq!(connector.attempts(), 3);
        manager.graceful_shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_max_retries() {
        let store = Arc::new(MemoryStore::new("trips"));
        let connector = Arc::new(MemoryConnector::failing_first(store, 10));
        let manager = ConnectionManager::new(fast_config(2), connector.clone());

        let err = manager.connect().await.err().unwrap();
        assert!(matches!(err, DbKeeperError::Connection(_)));
        assert_eq!(connector.attempts(), 2);
        assert_eq!(manager.state(), ConnectionState::Error);
        assert!(manager.store().is_err());
    }

    #[tokio::test]
    async fn test_health_check_reports_instead_of_failing() {
        let store = Arc::new(MemoryStore::new("trips"));
        let manager = ConnectionManager::new(fast_config(1), Arc::new(MemoryConnector::new(store.clone())));

        let report = manager.perform_health_check().await;
        assert!(!report.connected);
        assert!(report.error.is_some());

        manager.connect().await.unwrap();
        let report = manager.perform_health_check().await;
        assert!(report.connected);
        assert_eq!(report.database.as_deref(), Some("trips"));

        store.set_available(false);
        let report = manager.perform_health_check().await;
        assert!(!report.connected);
        manager.graceful_shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let store = Arc::new(MemoryStore::new("trips"));
        let manager = ConnectionManager::new(fast_config(1), Arc::new(MemoryConnector::new(store)));
        manager.connect().await.unwrap();

        manager.graceful_shutdown().await;
        manager.graceful_shutdown().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_connected());

        // A fresh connect after shutdown works again.
        manager.connect().await.unwrap();
        assert!(manager.is_connected());
        manager.graceful_shutdown().await;
    }

    #[tokio::test]
    async fn test_handle_is_not_installed_after_shutdown() {
        let store = Arc::new(MemoryStore::new("trips"));
        let manager = ConnectionManager::new(fast_config(1), Arc::new(MemoryConnector::new(store.clone())));

        // A connect that already holds its lifecycle token when shutdown lands.
        let token = manager.lifecycle_token();
        manager.graceful_shutdown().await;
        assert!(!manager.install_store(store, &token));

        assert!(manager.store().is_err());
        assert!(!manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_handle_disconnect_reconnects() {
        let store = Arc::new(MemoryStore::new("trips"));
        let connector = Arc::new(MemoryConnector::new(store));
        let manager = ConnectionManager::new(fast_config(3), connector.clone());
        manager.connect().await.unwrap();

        assert!(manager.handle_disconnect().await);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.retry_count(), 0);
        assert_eq!(connector.attempts(), 2);
        manager.graceful_shutdown().await;
    }
}
