//! Supervises named connections to external resources.
//!
//! The registry validates and admits connections, decrypts their credentials
//! through the vault, and hands transport work to a [`Connector`] picked by the
//! [`ConnectorFactory`]. Each admitted connection gets its own health-check
//! task; a failed check can start a reconnect loop with exponential backoff.
//!
//! Concurrency rules:
//! - the connection table lives behind one lock that is never held across an
//!   `.await`; admission reserves a slot in the same critical section that
//!   checks capacity, so a connection is either pending, registered, or gone;
//! - health checks and reconnects are single-flight per connection;
//! - every task observes the connection's cancel signal, so removal and
//!   shutdown stop timers and backoff sleeps promptly.

pub mod backoff;
pub mod connector;
pub mod error;
pub mod state;
pub mod store;
pub mod types;


use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditLog, SecurityEventKind};
use crate::config::RegistrySettings;
use crate::crypto::tokens;
use crate::vault::VaultManager;

pub use backoff::{Backoff, Sleeper, TokioSleeper};
pub use connector::{ConnectResult, Connector, ConnectorCatalog, ConnectorError, ConnectorFactory, TcpProbeConnector};
pub use error::RegistryError;
pub use state::{ConnectionStatus, ResponseTimeEma};
pub use store::{ConfigStore, StoreError};
pub use types::{
    ConnectionConfig, ConnectionSnapshot, ConnectionTestReport, ConnectionTimeouts, ConnectionType, Credentials,
    HealthReport, RegistryEvent, RegistryOverview, ShutdownReport,
};

use state::ConnectionState;

pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

pub struct RegistryBuilder {
    settings: RegistrySettings,
    vault: Arc<VaultManager>,
    factory: Arc<dyn ConnectorFactory>,
    store: Option<Arc<dyn ConfigStore>>,
    sleeper: Arc<dyn Sleeper>,
}

impl RegistryBuilder {
    pub fn store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the timer used between reconnect attempts.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn build(self) -> ConnectionRegistry {
        let (events, _) = broadcast::channel(self.settings.event_capacity.max(1));
        let audit = Arc::clone(self.vault.audit());
        ConnectionRegistry {
            inner: Arc::new(Inner {
                settings: self.settings,
                vault: self.vault,
                audit,
                factory: self.factory,
                store: self.store,
                sleeper: self.sleeper,
                table: RwLock::new(Table::default()),
                events,
                closed: AtomicBool::new(false),
            }),
        }
    }
}

struct Inner {
    settings: RegistrySettings,
    vault: Arc<VaultManager>,
    audit: Arc<AuditLog>,
    factory: Arc<dyn ConnectorFactory>,
    store: Option<Arc<dyn ConfigStore>>,
    sleeper: Arc<dyn Sleeper>,
    table: RwLock<Table>,
    events: broadcast::Sender<RegistryEvent>,
    closed: AtomicBool,
}

#[derive(Default)]
struct Table {
    connections: HashMap<String, Arc<Entry>>,
    /// Ids admitted but still connecting.
    pending: HashSet<String>,
}

struct Entry {
    config: ConnectionConfig,
    connection_type: ConnectionType,
    connector: Arc<dyn Connector>,
    created_at: DateTime<Utc>,
    state: Mutex<ConnectionState>,
    checking: AtomicBool,
    reconnecting: AtomicBool,
    cancel: watch::Sender<bool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Entry {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    fn cancel(&self) {
        self.cancel.send_replace(true);
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        let state = self.state.lock();
        ConnectionSnapshot {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            connection_type: self.connection_type,
            host: self.config.host.clone(),
            port: self.config.port,
            database: self.config.database.clone(),
            status: state.status,
            created_at: self.created_at,
            last_activity: state.last_activity,
            query_count: state.query_count,
            error_count: state.error_count,
            consecutive_failures: state.consecutive_failures,
            reconnect_attempts: state.reconnect_attempts,
            avg_response_time_ms: state.response_time.value(),
            last_error: state.last_error.clone(),
        }
    }
}

/// Clears a single-flight flag when the guarded operation ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Releases an admission slot unless the connection got registered.
struct Reservation<'a> {
    inner: &'a Inner,
    id: String,
    settled: bool,
}

impl Reservation<'_> {
    /// The slot now belongs to a registered connection.
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.inner.table.write().pending.remove(&self.id);
        }
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}

impl ConnectionRegistry {
    pub fn new(settings: RegistrySettings, vault: Arc<VaultManager>, factory: Arc<dyn ConnectorFactory>) -> Self {
        Self::builder(settings, vault, factory).build()
    }

    pub fn builder(
        settings: RegistrySettings,
        vault: Arc<VaultManager>,
        factory: Arc<dyn ConnectorFactory>,
    ) -> RegistryBuilder {
        RegistryBuilder {
            settings,
            vault,
            factory,
            store: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Receives lifecycle and health events. Slow receivers lose the oldest
    /// events rather than blocking the registry.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    /// Validates, admits, connects and registers a connection, then starts its
    /// health-check timer. The returned snapshot is in `connected` state.
    pub async fn create_connection(&self, mut config: ConnectionConfig) -> Result<ConnectionSnapshot, RegistryError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(RegistryError::ShuttingDown);
        }

        let connection_type = match config.validate() {
            Ok(connection_type) => connection_type,
            Err(err) => {
                inner.record_rejection(&config.id, "validation");
                return Err(err);
            }
        };
        if config.id.trim().is_empty() {
            config.id = tokens::generate_uuid();
        }

        let mut reservation = inner.reserve(&config.id)?;
        let entry = match inner.open(config, connection_type).await {
            Ok(entry) => entry,
            Err((id, err)) => {
                warn!(connection = %id, error = %err, "connection creation failed");
                inner.record_rejection(&id, "connect");
                return Err(err);
            }
        };

        let registered = {
            let mut table = inner.table.write();
            if inner.closed.load(Ordering::Acquire) {
                false
            } else {
                table.pending.remove(entry.id());
                table.connections.insert(entry.id().to_string(), Arc::clone(&entry));
                true
            }
        };
        if !registered {
            if let Err(err) = disconnect(&entry).await {
                warn!(connection = %entry.id(), error = %err, "disconnect after late shutdown failed");
            }
            return Err(RegistryError::ShuttingDown);
        }
        reservation.settle();

        if let Some(store) = &inner.store {
            if let Err(err) = store.save(&entry.config) {
                warn!(connection = %entry.id(), error = %err, "config store save failed");
            }
        }
        inner.spawn_health_timer(&entry);

        info!(
            connection = %entry.id(),
            name = %entry.config.name,
            kind = %connection_type,
            "connection registered"
        );
        inner.audit.record(
            SecurityEventKind::ConnectionCreated,
            [("id", entry.id().to_string()), ("type", connection_type.to_string())],
        );
        inner.emit(RegistryEvent::Created {
            id: entry.id().to_string(),
            connection_type,
        });
        Ok(entry.snapshot())
    }

    /// Connects once and reports latency plus whatever the server told us.
    /// Leaves registry state untouched.
    pub async fn test_connection(
        &self,
        connector: &dyn Connector,
        timeout: Duration,
    ) -> Result<ConnectionTestReport, ConnectorError> {
        probe(connector, timeout).await
    }

    /// Runs one health check now. Skipped when another check for the same
    /// connection is in flight or the connection is reconnecting or failed.
    pub async fn health_check(&self, id: &str) -> Result<HealthReport, RegistryError> {
        let entry = self.inner.entry(id)?;
        Ok(self.inner.check(&entry).await)
    }

    /// Runs the reconnect loop for `id` and returns the status it ended in.
    pub async fn reconnect(&self, id: &str) -> Result<ConnectionStatus, RegistryError> {
        let entry = self.inner.entry(id)?;
        Ok(self.inner.reconnect(&entry).await)
    }

    /// Records one query made by a caller over this connection.
    pub fn record_query(&self, id: &str, elapsed: Duration, success: bool) -> Result<(), RegistryError> {
        let entry = self.inner.entry(id)?;
        let mut state = entry.state.lock();
        state.query_count += 1;
        if success {
            state.response_time.record(millis(elapsed));
            state.last_activity = Utc::now();
        } else {
            state.record_failure(None);
        }
        Ok(())
    }

    pub fn get_status(&self, id: &str) -> Option<ConnectionSnapshot> {
        self.inner.entry(id).ok().map(|entry| entry.snapshot())
    }

    pub fn get_all_statuses(&self) -> RegistryOverview {
        let mut connections: Vec<ConnectionSnapshot> = self
            .inner
            .table
            .read()
            .connections
            .values()
            .map(|entry| entry.snapshot())
            .collect();
        connections.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let averages: Vec<f64> = connections.iter().filter_map(|c| c.avg_response_time_ms).collect();
        let avg_response_time_ms = if averages.is_empty() {
            None
        } else {
            Some(averages.iter().sum::<f64>() / averages.len() as f64)
        };

        RegistryOverview {
            total: connections.len(),
            active: connections.iter().filter(|c| c.status.is_active()).count(),
            healthy: connections
                .iter()
                .filter(|c| c.status == ConnectionStatus::Healthy)
                .count(),
            errored: connections
                .iter()
                .filter(|c| matches!(c.status, ConnectionStatus::Error | ConnectionStatus::Failed))
                .count(),
            avg_response_time_ms,
            connections,
        }
    }

    /// Stops supervising `id`, disconnects it and drops it from the store.
    pub async fn remove_connection(&self, id: &str) -> Result<(), RegistryError> {
        let inner = &self.inner;
        let entry = inner
            .table
            .write()
            .connections
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        entry.cancel();

        if let Err(err) = disconnect(&entry).await {
            warn!(connection = %id, error = %err, "disconnect during removal failed");
        }
        if let Some(store) = &inner.store {
            if let Err(err) = store.remove(id) {
                warn!(connection = %id, error = %err, "config store remove failed");
            }
        }

        info!(connection = %id, "connection removed");
        inner
            .audit
            .record(SecurityEventKind::ConnectionRemoved, [("id", id.to_string())]);
        inner.emit(RegistryEvent::Removed { id: id.to_string() });
        Ok(())
    }

    /// Re-creates every connection the store knows about.
    pub async fn restore(&self) -> Result<Vec<(String, Result<ConnectionSnapshot, RegistryError>)>, RegistryError> {
        let configs = match &self.inner.store {
            Some(store) => store.load_all()?,
            None => return Ok(Vec::new()),
        };

        let mut outcomes = Vec::with_capacity(configs.len());
        for config in configs {
            let label = if config.id.is_empty() { config.name.clone() } else { config.id.clone() };
            let outcome = self.create_connection(config).await;
            if let Err(err) = &outcome {
                warn!(connection = %label, error = %err, "failed to restore connection");
            }
            outcomes.push((label, outcome));
        }
        Ok(outcomes)
    }

    /// Cancels every timer and reconnect loop, disconnects every connector and
    /// clears the table. Disconnect failures are collected, not raised. Safe to
    /// call more than once.
    pub async fn shutdown(&self) -> ShutdownReport {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return ShutdownReport::default();
        }

        let entries: Vec<Arc<Entry>> = {
            let mut table = inner.table.write();
            table.connections.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.cancel();
        }

        let mut report = ShutdownReport::default();
        for entry in &entries {
            match disconnect(entry).await {
                Ok(()) => report.disconnected += 1,
                Err(err) => {
                    warn!(connection = %entry.id(), error = %err, "disconnect during shutdown failed");
                    report.errors.push((entry.id().to_string(), err.to_string()));
                }
            }
        }

        info!(
            disconnected = report.disconnected,
            failed = report.errors.len(),
            "connection registry shut down"
        );
        inner.audit.record(
            SecurityEventKind::RegistryShutdown,
            [
                ("disconnected", report.disconnected.to_string()),
                ("errors", report.errors.len().to_string()),
            ],
        );
        report
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

async fn probe(connector: &dyn Connector, timeout: Duration) -> Result<ConnectionTestReport, ConnectorError> {
    let started = Instant::now();
    let result = tokio::time::timeout(timeout, connector.connect())
        .await
        .map_err(|_| ConnectorError::Timeout(timeout))??;
    Ok(ConnectionTestReport {
        latency_ms: millis(started.elapsed()),
        server_version: result.server_version,
        metadata: result.metadata,
    })
}

async fn disconnect(entry: &Entry) -> Result<(), ConnectorError> {
    disconnect_within(entry.connector.as_ref(), entry.config.connect_timeout()).await
}

async fn disconnect_within(connector: &dyn Connector, timeout: Duration) -> Result<(), ConnectorError> {
    tokio::time::timeout(timeout, connector.disconnect())
        .await
        .map_err(|_| ConnectorError::Timeout(timeout))?
}

impl Inner {
    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn entry(&self, id: &str) -> Result<Arc<Entry>, RegistryError> {
        self.table
            .read()
            .connections
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    fn record_rejection(&self, id: &str, reason: &str) {
        self.audit.record(
            SecurityEventKind::ConnectionRejected,
            [("id", id.to_string()), ("reason", reason.to_string())],
        );
    }

    fn reserve(&self, id: &str) -> Result<Reservation<'_>, RegistryError> {
        let mut table = self.table.write();
        if table.connections.contains_key(id) || table.pending.contains(id) {
            drop(table);
            self.record_rejection(id, "duplicate");
            return Err(RegistryError::Validation(format!("connection id {id} is already registered")));
        }
        let limit = self.settings.max_connections;
        if table.connections.len() + table.pending.len() >= limit {
            drop(table);
            warn!(limit, "connection limit reached");
            self.record_rejection(id, "capacity");
            return Err(RegistryError::CapacityExceeded { limit });
        }
        table.pending.insert(id.to_string());
        Ok(Reservation {
            inner: self,
            id: id.to_string(),
            settled: false,
        })
    }

    /// Everything between admission and registration. Errors carry the id for
    /// the audit trail.
    async fn open(
        &self,
        config: ConnectionConfig,
        connection_type: ConnectionType,
    ) -> Result<Arc<Entry>, (String, RegistryError)> {
        let id = config.id.clone();
        let mut state = ConnectionState::new();
        let _ = state.transition(ConnectionStatus::Connecting);

        let credentials = self.credentials_for(&config).await.map_err(|err| (id.clone(), err))?;
        let connector = self
            .factory
            .create(connection_type, &config, credentials)
            .map_err(|source| {
                (
                    id.clone(),
                    RegistryError::Connector {
                        connection: id.clone(),
                        source,
                    },
                )
            })?;

        match probe(connector.as_ref(), config.connect_timeout()).await {
            Ok(report) => {
                debug!(connection = %id, latency_ms = report.latency_ms, "initial connect succeeded");
                state.last_activity = Utc::now();
                let _ = state.transition(ConnectionStatus::Connected);
            }
            Err(source) => {
                if let Err(err) = disconnect_within(connector.as_ref(), config.connect_timeout()).await {
                    warn!(connection = %id, error = %err, "disconnect after failed connect failed");
                }
                return Err((
                    id.clone(),
                    RegistryError::Connector {
                        connection: id,
                        source,
                    },
                ));
            }
        }

        let (cancel, _) = watch::channel(false);
        Ok(Arc::new(Entry {
            config,
            connection_type,
            connector,
            created_at: Utc::now(),
            state: Mutex::new(state),
            checking: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            cancel,
            timer: Mutex::new(None),
        }))
    }

    /// Key derivation is CPU-bound, so decryption runs on the blocking pool
    /// instead of a runtime worker.
    async fn credentials_for(&self, config: &ConnectionConfig) -> Result<Credentials, RegistryError> {
        let secret = match config.credentials.clone() {
            Some(blob) => {
                let vault = Arc::clone(&self.vault);
                let decrypted = tokio::task::spawn_blocking(move || vault.decrypt_to_string(&blob))
                    .await
                    .map_err(|e| RegistryError::Task(format!("{e}")))??;
                Some(decrypted)
            }
            None => None,
        };
        Ok(Credentials::new(config.username.clone(), secret))
    }

    /// Applies a status change, emitting an event when the status moved.
    fn set_status(&self, entry: &Entry, next: ConnectionStatus) -> bool {
        let previous = match entry.state.lock().transition(next) {
            Ok(previous) => previous,
            Err(invalid) => {
                debug!(
                    connection = %entry.id(),
                    from = %invalid.from,
                    to = %invalid.to,
                    "ignoring status change outside the lifecycle"
                );
                return false;
            }
        };
        if previous != next {
            self.emit(RegistryEvent::StatusChanged {
                id: entry.id().to_string(),
                from: previous,
                to: next,
            });
        }
        true
    }

    fn spawn_health_timer(self: &Arc<Self>, entry: &Arc<Entry>) {
        let period = self.settings.health_check_interval();
        let registry = Arc::downgrade(self);
        let task_entry = Arc::clone(entry);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = task_entry.cancelled() => break,
                }
                let Some(inner) = Weak::upgrade(&registry) else {
                    break;
                };
                inner.check(&task_entry).await;
                if task_entry.status().is_terminal() {
                    debug!(connection = %task_entry.id(), "stopping health checks for failed connection");
                    break;
                }
            }
        });

        *entry.timer.lock() = Some(handle);
        if entry.is_cancelled() {
            // Removed while we were spawning.
            entry.cancel();
        }
    }

    async fn check(self: &Arc<Self>, entry: &Arc<Entry>) -> HealthReport {
        let skipped = |status: ConnectionStatus| HealthReport {
            id: entry.id().to_string(),
            status,
            performed: false,
            healthy: false,
            latency_ms: None,
        };

        let Some(_flight) = FlightGuard::acquire(&entry.checking) else {
            debug!(connection = %entry.id(), "health check already in flight");
            return skipped(entry.status());
        };
        let status = entry.status();
        if entry.is_cancelled() || !status.is_active() {
            return skipped(status);
        }

        let timeout = entry.config.health_check_timeout();
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, entry.connector.health_check()).await;
        let latency_ms = millis(started.elapsed());

        let healthy = match outcome {
            Ok(Ok(true)) => {
                entry.state.lock().record_success(latency_ms);
                self.set_status(entry, ConnectionStatus::Healthy);
                true
            }
            Ok(Ok(false)) => {
                entry.state.lock().record_failure(Some("reported unhealthy".to_string()));
                self.set_status(entry, ConnectionStatus::Unhealthy);
                false
            }
            Ok(Err(err)) => {
                self.health_check_failed(entry, err);
                false
            }
            Err(_) => {
                self.health_check_failed(entry, ConnectorError::Timeout(timeout));
                false
            }
        };

        self.emit(RegistryEvent::HealthChecked {
            id: entry.id().to_string(),
            healthy,
            latency_ms,
        });
        HealthReport {
            id: entry.id().to_string(),
            status: entry.status(),
            performed: true,
            healthy,
            latency_ms: Some(latency_ms),
        }
    }

    fn health_check_failed(self: &Arc<Self>, entry: &Arc<Entry>, err: ConnectorError) {
        warn!(connection = %entry.id(), error = %err, "health check failed");
        entry.state.lock().record_failure(Some(err.to_string()));
        self.set_status(entry, ConnectionStatus::Error);
        self.audit.record(
            SecurityEventKind::HealthCheckFailed,
            [("id", entry.id().to_string())],
        );

        if self.settings.auto_reconnect && !self.closed.load(Ordering::Acquire) {
            let inner = Arc::clone(self);
            let entry = Arc::clone(entry);
            tokio::spawn(async move {
                inner.reconnect(&entry).await;
            });
        }
    }

    /// Retries `connect` with exponential backoff. Ends in `healthy` on
    /// success or `failed` once attempts run out; returns early if the
    /// connection is cancelled.
    async fn reconnect(&self, entry: &Arc<Entry>) -> ConnectionStatus {
        let Some(_flight) = FlightGuard::acquire(&entry.reconnecting) else {
            debug!(connection = %entry.id(), "reconnect already in progress");
            return entry.status();
        };
        let status = entry.status();
        if status.is_terminal() || entry.is_cancelled() {
            return status;
        }
        if status != ConnectionStatus::Error {
            self.set_status(entry, ConnectionStatus::Error);
        }

        let backoff = Backoff::new(self.settings.base_delay(), self.settings.max_retries);
        let timeout = entry.config.connect_timeout();
        for (attempt, delay) in backoff.schedule() {
            self.emit(RegistryEvent::ReconnectScheduled {
                id: entry.id().to_string(),
                attempt,
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            });
            tokio::select! {
                _ = self.sleeper.sleep(delay) => {}
                _ = entry.cancelled() => return entry.status(),
            }
            if entry.is_cancelled() {
                return entry.status();
            }

            self.set_status(entry, ConnectionStatus::Connecting);
            entry.state.lock().reconnect_attempts += 1;
            let outcome = tokio::select! {
                outcome = probe(entry.connector.as_ref(), timeout) => outcome,
                _ = entry.cancelled() => return entry.status(),
            };

            match outcome {
                Ok(report) => {
                    entry.state.lock().record_success(report.latency_ms);
                    self.set_status(entry, ConnectionStatus::Healthy);
                    info!(connection = %entry.id(), attempt, "reconnected");
                    self.audit.record(
                        SecurityEventKind::ReconnectSucceeded,
                        [("id", entry.id().to_string()), ("attempt", attempt.to_string())],
                    );
                    self.emit(RegistryEvent::Reconnected {
                        id: entry.id().to_string(),
                        attempts: attempt,
                    });
                    return ConnectionStatus::Healthy;
                }
                Err(err) => {
                    warn!(connection = %entry.id(), attempt, error = %err, "reconnect attempt failed");
                    entry.state.lock().record_failure(Some(err.to_string()));
                    self.set_status(entry, ConnectionStatus::Error);
                }
            }
        }

        self.set_status(entry, ConnectionStatus::Failed);
        error!(
            connection = %entry.id(),
            attempts = backoff.max_attempts(),
            "reconnect attempts exhausted; connection needs to be recreated"
        );
        self.audit.record(
            SecurityEventKind::ReconnectExhausted,
            [("id", entry.id().to_string()), ("attempts", backoff.max_attempts().to_string())],
        );
        self.emit(RegistryEvent::Failed {
            id: entry.id().to_string(),
            attempts: backoff.max_attempts(),
        });
        ConnectionStatus::Failed
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for entry in self.table.get_mut().connections.values() {
            entry.cancel();
        }
    }
}
