//! Connection pool for one server address.
//!
//! # Architecture
//!
//! ```text
//! grow(target)
//!   → reserve slots under the pool lock
//!     → open socket + run the active credential's handshake (unlocked, one task per slot)
//!       → commit: re-check credential and destroyed flag under the lock → Ready
//!       → or release the slot; transport failures retry, auth failures do not
//!
//! checkout()
//!   → round-robin over Ready connections whose dispatch gate is free
//!   → none ready: wait on `available` until the checkout timeout
//!
//! connection closes → ConnectionEvent::Closed → maintenance task removes it
//!   → pool not destroyed: grow back to size in the background
//! ```
//!
//! All mutations of the connection set and the credential happen under one
//! `tokio::sync::Mutex`. Credential changes (`reauthenticate`, `clear_credential`)
//! are additionally serialized by an operation lock so a logout can never
//! overtake an auth that started before it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use docwire_wire::{Document, DocumentCodec};
use tokio::sync::{Mutex, Notify, OwnedRwLockReadGuard, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::auth::Authenticator;
use crate::config::PoolOptions;
use crate::connection::{Connection, ConnectionEvent, ConnectionId, ConnectionState, PendingReply};
use crate::credential::{Credential, CredentialKey};
use crate::error::{DriverError, DriverResult};
use crate::registry::ConnectionRegistry;
use crate::server::ServerEvent;
use crate::transport::{Address, Transport};

/// Point-in-time pool counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Live connections in the pool, any state.
    pub total: usize,
    pub ready: usize,
    pub authenticating: usize,
    /// Slots reserved by growth that has not committed yet.
    pub connecting: usize,
    /// Checkout leases currently held.
    pub in_flight: usize,
    /// Requests written and awaiting replies, across all connections.
    pub pending: usize,
}

/// A Ready connection borrowed for one dispatch.
///
/// Holds the connection's dispatch gate shared, so re-authentication waits
/// until the lease is dropped.
pub struct ConnectionLease {
    connection: Arc<Connection>,
    _gate: OwnedRwLockReadGuard<()>,
    in_flight: Arc<AtomicUsize>,
}

impl ConnectionLease {
    fn new(
        connection: Arc<Connection>,
        gate: OwnedRwLockReadGuard<()>,
        in_flight: Arc<AtomicUsize>,
    ) -> Self {
        in_flight.fetch_add(1, Ordering::Relaxed);
        Self {
            connection,
            _gate: gate,
            in_flight,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Queue `document` on the leased connection.
    pub fn send(&self, document: Document) -> DriverResult<PendingReply> {
        self.connection.send(document)
    }
}

impl std::ops::Deref for ConnectionLease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("connection", &self.connection.id())
            .finish()
    }
}

struct PoolState {
    connections: Vec<Arc<Connection>>,
    /// Slots reserved by in-progress growth.
    reserved: usize,
    credential: Option<Credential>,
    cursor: usize,
    /// Set once the first connect succeeded; enables replenish-on-checkout.
    connected: bool,
    destroyed: bool,
}

impl PoolState {
    /// Round-robin pick of a Ready connection whose gate is not held exclusively.
    fn select(&mut self, in_flight: &Arc<AtomicUsize>) -> Option<ConnectionLease> {
        let count = self.connections.len();
        for offset in 0..count {
            let index = (self.cursor + offset) % count;
            let connection = &self.connections[index];
            if connection.state() != ConnectionState::Ready {
                continue;
            }
            let Ok(gate) = Arc::clone(connection.dispatch_gate()).try_read_owned() else {
                continue;
            };
            self.cursor = (index + 1) % count;
            return Some(ConnectionLease::new(
                Arc::clone(connection),
                gate,
                Arc::clone(in_flight),
            ));
        }
        None
    }
}

struct PoolShared {
    address: Address,
    options: PoolOptions,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn DocumentCodec>,
    registry: ConnectionRegistry,
    authenticator: Authenticator,
    state: Mutex<PoolState>,
    operations: Mutex<()>,
    /// Signalled when a connection becomes Ready, a slot is released, or the
    /// pool is destroyed.
    available: Notify,
    in_flight: Arc<AtomicUsize>,
    closed_tx: mpsc::UnboundedSender<ConnectionEvent>,
    closed_rx: StdMutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    events: broadcast::Sender<ServerEvent>,
    maintenance: StdMutex<Option<JoinHandle<()>>>,
    background: StdMutex<Vec<JoinHandle<()>>>,
}

/// A bounded set of connections to one server.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    pub fn new(
        address: Address,
        options: PoolOptions,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn DocumentCodec>,
        registry: ConnectionRegistry,
        events: broadcast::Sender<ServerEvent>,
    ) -> Self {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(PoolShared {
                address,
                options,
                transport,
                codec,
                registry,
                authenticator: Authenticator,
                state: Mutex::new(PoolState {
                    connections: Vec::new(),
                    reserved: 0,
                    credential: None,
                    cursor: 0,
                    connected: false,
                    destroyed: false,
                }),
                operations: Mutex::new(()),
                available: Notify::new(),
                in_flight: Arc::new(AtomicUsize::new(0)),
                closed_tx,
                closed_rx: StdMutex::new(Some(closed_rx)),
                events,
                maintenance: StdMutex::new(None),
                background: StdMutex::new(Vec::new()),
            }),
        }
    }

    pub fn address(&self) -> &Address {
        &self.shared.address
    }

    pub fn options(&self) -> &PoolOptions {
        &self.shared.options
    }

    /// Install `credential` and grow to the configured size.
    ///
    /// Succeeds once at least one connection is Ready; slots that failed are
    /// refilled in the background. Zero successful connections is an error,
    /// preferring an authentication failure over a transport one.
    pub async fn connect(&self, credential: Option<Credential>) -> DriverResult<usize> {
        let shared = &self.shared;
        shared.start_maintenance();
        {
            let _op = shared.operations.lock().await;
            let mut state = shared.state.lock().await;
            if state.destroyed {
                return Err(DriverError::PoolDestroyed);
            }
            state.credential = credential;
        }

        shared.grow(shared.options.size).await?;

        let total = {
            let mut state = shared.state.lock().await;
            state.connected = true;
            state.connections.len()
        };
        if total < shared.options.size {
            shared.spawn_replenish();
        }
        tracing::info!(
            address = %shared.address,
            connections = total,
            "pool connected"
        );
        Ok(total)
    }

    /// Open connections until the pool holds `target` (capped at the
    /// configured size). Returns the number added.
    pub async fn grow(&self, target: usize) -> DriverResult<usize> {
        self.shared.grow(target).await
    }

    /// Borrow a Ready connection, waiting up to the checkout timeout.
    pub async fn checkout(&self) -> DriverResult<ConnectionLease> {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.options.checkout_timeout;
        let mut replenish_requested = false;

        loop {
            let notified = shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = shared.state.lock().await;
                if state.destroyed {
                    return Err(DriverError::PoolDestroyed);
                }
                if let Some(lease) = state.select(&shared.in_flight) {
                    tracing::trace!(connection = %lease.id(), "connection checked out");
                    return Ok(lease);
                }
                if !replenish_requested
                    && state.connected
                    && state.connections.is_empty()
                    && state.reserved == 0
                {
                    replenish_requested = true;
                    shared.spawn_replenish();
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::warn!(
                    address = %shared.address,
                    timeout = ?shared.options.checkout_timeout,
                    "checkout timed out"
                );
                return Err(DriverError::PoolExhausted {
                    address: shared.address.to_string(),
                    timeout: shared.options.checkout_timeout,
                });
            }
        }
    }

    /// Replace the active credential and run its handshake on every live
    /// connection.
    ///
    /// Each connection is `Authenticating`, and so skipped by checkout, until
    /// its handshake finishes. Connections that fail are closed and replaced.
    /// If the server rejects the credential the previous one is restored and
    /// the rejection returned.
    pub async fn reauthenticate(&self, credential: Credential) -> DriverResult<()> {
        let shared = &self.shared;
        let _op = shared.operations.lock().await;

        let (targets, previous) = {
            let mut state = shared.state.lock().await;
            if state.destroyed {
                return Err(DriverError::PoolDestroyed);
            }
            let previous = state.credential.replace(credential.clone());
            let targets: Vec<Arc<Connection>> = state
                .connections
                .iter()
                .filter(|c| c.set_state(ConnectionState::Authenticating))
                .cloned()
                .collect();
            (targets, previous)
        };

        tracing::debug!(
            address = %shared.address,
            connections = targets.len(),
            mechanism = %credential.mechanism(),
            user = credential.username(),
            "re-authenticating pool"
        );

        let handles: Vec<_> = targets
            .into_iter()
            .map(|connection| {
                let shared = Arc::clone(shared);
                let credential = credential.clone();
                tokio::spawn(async move {
                    let result = shared.reauthenticate_connection(&connection, &credential).await;
                    (connection, result)
                })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!(error = %e, "re-authentication task failed"),
            }
        }

        let rejection = outcomes
            .iter()
            .find_map(|(_, result)| result.as_ref().err().filter(|e| e.is_auth_failure()).cloned());
        if rejection.is_some() {
            let mut state = shared.state.lock().await;
            if state.credential.as_ref() == Some(&credential) {
                state.credential = previous;
            }
        }

        let mut authenticated = 0;
        let mut last_error = None;
        for (connection, result) in outcomes {
            match result {
                Ok(()) => {
                    connection.set_state(ConnectionState::Ready);
                    authenticated += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        connection = %connection.id(),
                        error = %e,
                        "re-authentication failed, replacing connection"
                    );
                    connection.close();
                    last_error = Some(e);
                }
            }
        }
        shared.available.notify_waiters();

        if let Some(rejection) = rejection {
            return Err(rejection);
        }
        match last_error {
            Some(e) if authenticated == 0 => Err(e),
            _ => Ok(()),
        }
    }

    /// Forget the active credential if it was issued by `source`.
    ///
    /// Open connections stay authenticated; only future growth is affected.
    /// Waits for any in-progress `reauthenticate` to finish first.
    pub async fn clear_credential(&self, source: &str) -> Option<CredentialKey> {
        let _op = self.shared.operations.lock().await;
        let mut state = self.shared.state.lock().await;
        let matches = state
            .credential
            .as_ref()
            .is_some_and(|c| c.source() == source);
        if !matches {
            return None;
        }
        let key = state.credential.take().map(|c| c.key());
        tracing::debug!(address = %self.shared.address, source, "credential cleared");
        key
    }

    /// Key of the active credential.
    pub async fn credential(&self) -> Option<CredentialKey> {
        self.shared.state.lock().await.credential.as_ref().map(Credential::key)
    }

    /// Close every connection and refuse further checkouts.
    ///
    /// With `force`, outstanding requests fail with `ConnectionClosed`
    /// immediately. Otherwise waits up to the drain timeout for them to
    /// complete first.
    pub async fn destroy_all(&self, force: bool) {
        let shared = &self.shared;
        let connections = {
            let mut state = shared.state.lock().await;
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.connections.clone()
        };
        shared.available.notify_waiters();
        tracing::info!(
            address = %shared.address,
            connections = connections.len(),
            force,
            "destroying pool"
        );

        if !force {
            let deadline = Instant::now() + shared.options.drain_timeout;
            let poll_interval = Duration::from_millis(10);
            loop {
                let pending: usize = connections.iter().map(|c| c.pending_count()).sum();
                if pending == 0 {
                    tracing::debug!(address = %shared.address, "in-flight requests drained");
                    break;
                }
                if Instant::now() >= deadline {
                    tracing::warn!(
                        address = %shared.address,
                        pending,
                        "drain timeout expired, force-closing remaining connections"
                    );
                    break;
                }
                tokio::time::sleep(poll_interval).await;
            }
        }

        for connection in &connections {
            connection.close();
        }
        shared.state.lock().await.connections.clear();
        shared.settle_growth().await;
        shared.stop_tasks();

        tracing::info!(address = %shared.address, "pool destroyed");
    }

    /// Close idle Ready connections until at most `max(target, min_size)` remain.
    /// Returns the number closed.
    pub async fn shrink(&self, target: usize) -> usize {
        let floor = target.max(self.shared.options.min_size);
        let victims = {
            let mut state = self.shared.state.lock().await;
            let mut victims = Vec::new();
            let mut index = state.connections.len();
            while state.connections.len() > floor && index > 0 {
                index -= 1;
                let idle = {
                    let connection = &state.connections[index];
                    connection.state() == ConnectionState::Ready
                        && connection.pending_count() == 0
                        && connection.dispatch_gate().try_write().is_ok()
                };
                if idle {
                    victims.push(state.connections.remove(index));
                }
            }
            state.cursor = 0;
            victims
        };

        for connection in &victims {
            connection.close();
        }
        if !victims.is_empty() {
            tracing::debug!(
                address = %self.shared.address,
                closed = victims.len(),
                "pool shrunk"
            );
        }
        victims.len()
    }

    /// Live connections currently owned by the pool.
    pub async fn connection_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .await
            .connections
            .iter()
            .filter(|c| !c.is_closed())
            .count()
    }

    /// Snapshot of the pool's connections.
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.state.lock().await.connections.clone()
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock().await;
        let mut stats = PoolStats {
            connecting: state.reserved,
            in_flight: self.shared.in_flight.load(Ordering::Relaxed),
            ..PoolStats::default()
        };
        for connection in &state.connections {
            match connection.state() {
                ConnectionState::Closed => continue,
                ConnectionState::Ready => stats.ready += 1,
                ConnectionState::Authenticating => stats.authenticating += 1,
                ConnectionState::Connecting | ConnectionState::Connected => {}
            }
            stats.total += 1;
            stats.pending += connection.pending_count();
        }
        stats
    }

    pub async fn is_destroyed(&self) -> bool {
        self.shared.state.lock().await.destroyed
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("address", &self.shared.address)
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}

impl PoolShared {
    async fn grow(self: &Arc<Self>, target: usize) -> DriverResult<usize> {
        let target = target.min(self.options.size);
        let (slots, credential) = {
            let mut state = self.state.lock().await;
            if state.destroyed {
                return Err(DriverError::PoolDestroyed);
            }
            let current = state.connections.len() + state.reserved;
            let slots = target.saturating_sub(current);
            state.reserved += slots;
            (slots, state.credential.clone())
        };
        if slots == 0 {
            return Ok(0);
        }
        tracing::debug!(address = %self.address, slots, "growing pool");

        // Detached tasks: a cancelled grow still commits or releases its slots.
        let handles: Vec<_> = (0..slots)
            .map(|_| {
                let shared = Arc::clone(self);
                let credential = credential.clone();
                tokio::spawn(async move { shared.fill_slot(credential).await })
            })
            .collect();

        let mut added = 0;
        let mut rejection = None;
        let mut last_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => added += 1,
                Ok(Err(e)) if e.is_auth_failure() => {
                    rejection.get_or_insert(e);
                }
                Ok(Err(e)) => last_error = Some(e),
                Err(e) => last_error = Some(DriverError::Transport(format!("grow task failed: {e}"))),
            }
        }

        if added > 0 {
            if added < slots {
                tracing::warn!(
                    address = %self.address,
                    added,
                    failed = slots - added,
                    "pool partially grown"
                );
            }
            return Ok(added);
        }
        Err(rejection
            .or(last_error)
            .unwrap_or_else(|| DriverError::Transport(format!("no connection to {}", self.address))))
    }

    /// Open one connection for a reserved slot, retrying transport failures.
    async fn fill_slot(self: Arc<Self>, mut credential: Option<Credential>) -> DriverResult<()> {
        let attempts = self.options.reconnect_attempts.max(1);
        let mut last_error = DriverError::Transport(format!("no connection to {}", self.address));

        for attempt in 1..=attempts {
            if self.state.lock().await.destroyed {
                last_error = DriverError::PoolDestroyed;
                break;
            }

            let result = match self.open_connection(credential.as_ref()).await {
                Ok(connection) => self.commit(connection, credential.clone()).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => return Ok(()),
                // `commit` already gave the slot back.
                Err(DriverError::PoolDestroyed) => return Err(DriverError::PoolDestroyed),
                Err(e) if e.is_auth_failure() => {
                    let current = self.state.lock().await.credential.clone();
                    if current == credential {
                        last_error = e;
                        break;
                    }
                    // The credential changed while this attempt ran.
                    credential = current;
                    last_error = e;
                }
                Err(e) => {
                    tracing::warn!(
                        address = %self.address,
                        attempt,
                        error = %e,
                        "connection attempt failed"
                    );
                    last_error = e;
                    if attempt < attempts {
                        tokio::time::sleep(self.options.reconnect_interval).await;
                    }
                }
            }
        }

        self.release_slot().await;
        Err(last_error)
    }

    async fn open_connection(&self, credential: Option<&Credential>) -> DriverResult<Arc<Connection>> {
        let stream = tokio::time::timeout(
            self.options.connect_timeout,
            self.transport.open(&self.address),
        )
        .await
        .map_err(|_| DriverError::Transport(format!("connect {}: timed out", self.address)))??;

        let connection = Connection::establish(
            self.address.clone(),
            stream,
            Arc::clone(&self.codec),
            self.registry.clone(),
            Some(self.closed_tx.clone()),
        );
        if let Some(credential) = credential {
            if let Err(e) = self.handshake(&connection, credential).await {
                connection.close();
                return Err(e);
            }
        }
        Ok(connection)
    }

    async fn handshake(&self, connection: &Connection, credential: &Credential) -> DriverResult<()> {
        connection.set_state(ConnectionState::Authenticating);
        tokio::time::timeout(
            self.options.connect_timeout,
            self.authenticator.authenticate(connection, credential),
        )
        .await
        .map_err(|_| {
            DriverError::Transport(format!("handshake with {} timed out", self.address))
        })??;
        connection.record_credential(credential.key());
        Ok(())
    }

    async fn reauthenticate_connection(
        &self,
        connection: &Connection,
        credential: &Credential,
    ) -> DriverResult<()> {
        // Wait out leases already handed out for this connection.
        let _exclusive = connection.dispatch_gate().write().await;
        self.handshake(connection, credential).await
    }

    /// Turn a reserved slot into a Ready connection.
    ///
    /// If the credential changed since the handshake ran, the new one is
    /// applied first. Releases the slot only on success or when the pool was
    /// destroyed meanwhile.
    async fn commit(
        &self,
        connection: Arc<Connection>,
        mut applied: Option<Credential>,
    ) -> DriverResult<()> {
        loop {
            let mut state = self.state.lock().await;
            if state.destroyed {
                state.reserved = state.reserved.saturating_sub(1);
                drop(state);
                connection.close();
                self.available.notify_waiters();
                return Err(DriverError::PoolDestroyed);
            }

            if state.credential != applied {
                let current = state.credential.clone();
                drop(state);
                if let Some(credential) = &current {
                    if let Err(e) = self.handshake(&connection, credential).await {
                        connection.close();
                        return Err(e);
                    }
                }
                applied = current;
                continue;
            }

            if !connection.set_state(ConnectionState::Ready) {
                return Err(DriverError::ConnectionClosed);
            }
            state.reserved = state.reserved.saturating_sub(1);
            tracing::debug!(
                connection = %connection.id(),
                address = %self.address,
                pool_size = state.connections.len() + 1,
                "connection ready"
            );
            state.connections.push(connection);
            drop(state);
            self.available.notify_waiters();
            return Ok(());
        }
    }

    async fn release_slot(&self) {
        {
            let mut state = self.state.lock().await;
            state.reserved = state.reserved.saturating_sub(1);
        }
        self.available.notify_waiters();
    }

    /// Wait for in-progress growth to commit or release its slots.
    async fn settle_growth(&self) {
        let deadline = Instant::now()
            + self.options.connect_timeout * 2
            + self.options.reconnect_interval;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.lock().await.reserved == 0 {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::warn!(address = %self.address, "growth still in progress after destroy");
                return;
            }
        }
    }

    fn spawn_replenish(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move {
            match shared.grow(shared.options.size).await {
                Ok(0) | Err(DriverError::PoolDestroyed) => {}
                Ok(added) => {
                    tracing::info!(address = %shared.address, added, "pool replenished");
                }
                Err(e) => {
                    let ready = shared.ready_count().await;
                    if ready == 0 || e.is_auth_failure() {
                        tracing::error!(address = %shared.address, error = %e, "pool replenish failed");
                        let _ = shared.events.send(ServerEvent::Error(e));
                    } else {
                        tracing::warn!(
                            address = %shared.address,
                            ready,
                            error = %e,
                            "pool replenish failed, still serving"
                        );
                    }
                }
            }
        });

        let mut background = self.background.lock().unwrap();
        background.retain(|task| !task.is_finished());
        background.push(handle);
    }

    async fn ready_count(&self) -> usize {
        self.state
            .lock()
            .await
            .connections
            .iter()
            .filter(|c| c.state() == ConnectionState::Ready)
            .count()
    }

    fn start_maintenance(self: &Arc<Self>) {
        let Some(mut closed) = self.closed_rx.lock().unwrap().take() else {
            return;
        };
        let pool: Weak<PoolShared> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(ConnectionEvent::Closed { id, cause }) = closed.recv().await {
                let Some(shared) = pool.upgrade() else {
                    break;
                };
                shared.on_connection_closed(id, cause).await;
            }
        });
        *self.maintenance.lock().unwrap() = Some(handle);
    }

    async fn on_connection_closed(self: &Arc<Self>, id: ConnectionId, cause: DriverError) {
        let replace = {
            let mut state = self.state.lock().await;
            let before = state.connections.len();
            state.connections.retain(|c| c.id() != id);
            before != state.connections.len() && !state.destroyed
        };
        if replace {
            tracing::info!(
                address = %self.address,
                connection = %id,
                cause = %cause,
                "replacing closed connection"
            );
            self.spawn_replenish();
        }
    }

    fn stop_tasks(&self) {
        if let Some(task) = self.maintenance.lock().unwrap().take() {
            task.abort();
        }
        for task in self.background.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Mechanism;
    use crate::connection::tests::doc;
    use crate::transport::{BoxedStream, OpenFuture};
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use std::sync::atomic::AtomicBool;
    use docwire_wire::{JsonCodec, decode_message, encode_message, read_frame};
    use serde_json::json;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    // ── Mock transport ──────────────────────────────────────────────

    /// In-memory server: echoes commands, rejects every `saslStart` (or
    /// answers it with a malformed challenge), and never answers documents
    /// carrying a `hang` field.
    #[derive(Debug, Default)]
    struct MockTransport {
        attempts: AtomicUsize,
        opened: AtomicUsize,
        failures_remaining: AtomicUsize,
        /// Refuse opens once this many succeeded; 0 means no limit.
        accept_limit: AtomicUsize,
        malformed_challenge: AtomicBool,
    }

    impl MockTransport {
        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }

        fn accept_at_most(&self, count: usize) {
            self.accept_limit.store(count, Ordering::SeqCst);
        }

        fn send_malformed_challenges(&self) {
            self.malformed_challenge.store(true, Ordering::SeqCst);
        }

        fn fail_next(&self, count: usize) {
            self.failures_remaining.store(count, Ordering::SeqCst);
        }
    }

    impl Transport for MockTransport {
        fn open<'a>(&'a self, _address: &'a Address) -> OpenFuture<'a> {
            Box::pin(async move {
                let refuse = self
                    .failures_remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                self.attempts.fetch_add(1, Ordering::SeqCst);
                let limit = self.accept_limit.load(Ordering::SeqCst);
                let refuse = refuse
                    || self
                        .opened
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                            (limit == 0 || n < limit).then_some(n + 1)
                        })
                        .is_err();
                if refuse {
                    return Err(DriverError::Transport("connection refused".into()));
                }
                let (client, server) = tokio::io::duplex(64 * 1024);
                tokio::spawn(serve(server, self.malformed_challenge.load(Ordering::SeqCst)));
                Ok(Box::new(client) as BoxedStream)
            })
        }
    }

    async fn serve(mut stream: DuplexStream, malformed_challenge: bool) {
        while let Ok(frame) = read_frame(&mut stream).await {
            let Ok(message) = decode_message(&frame) else {
                return;
            };
            let Ok(request) = JsonCodec.decode(&message.document) else {
                return;
            };
            if request.contains_key("hang") {
                continue;
            }
            let reply = if request.contains_key("saslStart") && malformed_challenge {
                json!({
                    "ok": 1,
                    "conversationId": 1,
                    "done": false,
                    "payload": BASE64.encode("garbage"),
                })
            } else if request.contains_key("saslStart") {
                json!({ "ok": 0, "errmsg": "Authentication failed.", "code": 18 })
            } else {
                json!({ "ok": 1, "echo": request })
            };
            let body = JsonCodec.encode(&doc(reply)).unwrap();
            let frame = encode_message(0, message.header.request_id, &body).unwrap();
            if stream.write_all(&frame).await.is_err() {
                return;
            }
        }
    }

    fn test_options(size: usize) -> PoolOptions {
        PoolOptions {
            size,
            min_size: 1,
            connect_timeout: Duration::from_secs(1),
            checkout_timeout: Duration::from_millis(200),
            reconnect_attempts: 3,
            reconnect_interval: Duration::from_millis(10),
            drain_timeout: Duration::from_millis(200),
        }
    }

    fn make_pool(
        options: PoolOptions,
    ) -> (Pool, Arc<MockTransport>, ConnectionRegistry, broadcast::Receiver<ServerEvent>) {
        let transport = Arc::new(MockTransport::default());
        let registry = ConnectionRegistry::enabled();
        let (events, rx) = broadcast::channel(16);
        let pool = Pool::new(
            Address::new("mock", 27017),
            options,
            transport.clone(),
            Arc::new(JsonCodec),
            registry.clone(),
            events,
        );
        (pool, transport, registry, rx)
    }

    fn credential() -> Credential {
        Credential::new(Mechanism::ScramSha256, "admin", "user", "pencil")
    }

    async fn wait_for_size(pool: &Pool, size: usize) {
        for _ in 0..200 {
            let stats = pool.stats().await;
            if stats.ready == size && stats.connecting == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never reached {size} ready connections: {:?}", pool.stats().await);
    }

    async fn wait_for_attempts(transport: &MockTransport, attempts: usize) {
        for _ in 0..200 {
            if transport.attempts() >= attempts {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transport saw only {} open attempts", transport.attempts());
    }

    // ── connect / grow ──────────────────────────────────────────────

    #[tokio::test]
    async fn connect_fills_pool_to_size() {
        let (pool, transport, registry, _rx) = make_pool(test_options(3));
        assert_eq!(pool.connect(None).await.unwrap(), 3);
        assert_eq!(pool.connection_count().await, 3);
        assert_eq!(transport.opened(), 3);
        assert_eq!(registry.live_count(), 3);

        let stats = pool.stats().await;
        assert_eq!(stats.ready, 3);
        assert_eq!(stats.connecting, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn grow_is_capped_at_size() {
        let (pool, transport, _registry, _rx) = make_pool(test_options(2));
        pool.connect(None).await.unwrap();
        assert_eq!(pool.grow(10).await.unwrap(), 0);
        assert_eq!(transport.opened(), 2);
    }

    #[tokio::test]
    async fn transient_transport_failures_are_retried() {
        let (pool, transport, _registry, _rx) = make_pool(test_options(1));
        transport.fail_next(2);
        assert_eq!(pool.connect(None).await.unwrap(), 1);
        assert_eq!(transport.opened(), 1);
    }

    #[tokio::test]
    async fn persistent_transport_failure_fails_connect() {
        let (pool, transport, registry, _rx) = make_pool(test_options(2));
        transport.fail_next(usize::MAX);
        let err = pool.connect(None).await.unwrap_err();
        assert!(matches!(err, DriverError::Transport(_)));
        assert_eq!(pool.connection_count().await, 0);
        assert_eq!(pool.stats().await.connecting, 0);
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn rejected_credential_is_not_retried() {
        let (pool, transport, registry, _rx) = make_pool(test_options(3));
        let err = pool.connect(Some(credential())).await.unwrap_err();
        assert!(err.is_auth_failure());
        // One attempt per slot.
        assert_eq!(transport.opened(), 3);
        assert_eq!(pool.connection_count().await, 0);
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn broken_handshake_never_yields_a_connection() {
        let (pool, transport, registry, _rx) = make_pool(test_options(2));
        transport.send_malformed_challenges();

        let err = pool.connect(Some(credential())).await.unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)));
        // Retried like a transport failure: every attempt on every slot.
        assert_eq!(transport.opened(), 6);
        assert_eq!(pool.stats().await, PoolStats::default());
        assert_eq!(registry.live_count(), 0);
        assert!(matches!(
            pool.checkout().await,
            Err(DriverError::PoolExhausted { .. })
        ));
    }

    // ── checkout ────────────────────────────────────────────────────

    #[tokio::test]
    async fn checkout_round_robins() {
        let (pool, _transport, _registry, _rx) = make_pool(test_options(3));
        pool.connect(None).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..6 {
            let lease = pool.checkout().await.unwrap();
            seen.push(lease.id());
        }
        assert_ne!(seen[0], seen[1]);
        assert_ne!(seen[1], seen[2]);
        assert_eq!(seen[0], seen[3]);
        assert_eq!(seen[2], seen[5]);
    }

    #[tokio::test]
    async fn lease_tracks_in_flight() {
        let (pool, _transport, _registry, _rx) = make_pool(test_options(2));
        pool.connect(None).await.unwrap();
        let lease = pool.checkout().await.unwrap();
        assert_eq!(pool.stats().await.in_flight, 1);
        drop(lease);
        assert_eq!(pool.stats().await.in_flight, 0);
    }

    #[tokio::test]
    async fn checkout_before_connect_times_out() {
        let (pool, _transport, _registry, _rx) = make_pool(test_options(2));
        let err = pool.checkout().await.unwrap_err();
        assert!(matches!(err, DriverError::PoolExhausted { .. }));
        assert!(err.is_retryable_checkout());
    }

    #[tokio::test]
    async fn checkout_skips_authenticating_connections() {
        let (pool, _transport, _registry, _rx) = make_pool(test_options(2));
        pool.connect(None).await.unwrap();
        let connections = pool.connections().await;
        connections[0].set_state(ConnectionState::Authenticating);

        for _ in 0..4 {
            let lease = pool.checkout().await.unwrap();
            assert_eq!(lease.id(), connections[1].id());
        }
        assert_eq!(pool.stats().await.authenticating, 1);
    }

    #[tokio::test]
    async fn concurrent_commands_are_not_cross_wired() {
        let (pool, _transport, _registry, _rx) = make_pool(test_options(4));
        pool.connect(None).await.unwrap();

        let tasks: Vec<_> = (0..200)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    let pending = {
                        let lease = pool.checkout().await.unwrap();
                        lease.send(doc(json!({ "marker": i }))).unwrap()
                    };
                    let reply = pending.await.unwrap();
                    assert_eq!(reply["echo"]["marker"], json!(i));
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(pool.stats().await.pending, 0);
    }

    // ── replacement ─────────────────────────────────────────────────

    #[tokio::test]
    async fn closed_connection_is_replaced() {
        let (pool, transport, registry, _rx) = make_pool(test_options(3));
        pool.connect(None).await.unwrap();
        let victim = pool.connections().await[1].clone();

        victim.close();
        wait_for_size(&pool, 3).await;

        assert_eq!(transport.opened(), 4);
        assert_eq!(registry.live_count(), 3);
        assert!(pool.connections().await.iter().all(|c| c.id() != victim.id()));
    }

    #[tokio::test]
    async fn failed_replenish_is_quiet_while_connections_serve() {
        let mut options = test_options(3);
        options.reconnect_attempts = 1;
        let (pool, transport, _registry, mut rx) = make_pool(options);
        transport.accept_at_most(2);

        assert_eq!(pool.connect(None).await.unwrap(), 2);
        // Three attempts from connect, then the background refill.
        wait_for_attempts(&transport, 4).await;
        wait_for_size(&pool, 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert!(pool.checkout().await.is_ok());
    }

    #[tokio::test]
    async fn failed_replenish_of_empty_pool_emits_error() {
        let mut options = test_options(2);
        options.reconnect_attempts = 1;
        let (pool, transport, registry, mut rx) = make_pool(options);
        pool.connect(None).await.unwrap();
        transport.accept_at_most(2);

        for connection in pool.connections().await {
            connection.close();
        }

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ServerEvent::Error(DriverError::Transport(_))));
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn checkout_replenishes_empty_pool() {
        let (pool, _transport, _registry, _rx) = make_pool(test_options(1));
        pool.connect(None).await.unwrap();
        pool.connections().await[0].close();

        let lease = pool.checkout().await.unwrap();
        assert_eq!(lease.state(), ConnectionState::Ready);
    }

    // ── reauthenticate / credential ─────────────────────────────────

    #[tokio::test]
    async fn rejected_reauthentication_restores_credential() {
        let (pool, _transport, registry, _rx) = make_pool(test_options(2));
        pool.connect(None).await.unwrap();

        let err = pool.reauthenticate(credential()).await.unwrap_err();
        assert!(matches!(err, DriverError::AuthenticationFailed { .. }));
        assert_eq!(pool.credential().await, None);

        // The rejected connections are replaced without a credential.
        wait_for_size(&pool, 2).await;
        assert_eq!(registry.live_count(), 2);
    }

    #[tokio::test]
    async fn clear_credential_matches_source() {
        let (pool, _transport, _registry, _rx) = make_pool(test_options(1));
        assert_eq!(pool.clear_credential("admin").await, None);
    }

    // ── destroy / shrink ────────────────────────────────────────────

    #[tokio::test]
    async fn forced_destroy_fails_pending_requests() {
        let (pool, _transport, registry, _rx) = make_pool(test_options(2));
        pool.connect(None).await.unwrap();

        let pending = {
            let lease = pool.checkout().await.unwrap();
            lease.send(doc(json!({ "hang": 1 }))).unwrap()
        };
        assert_eq!(pool.stats().await.pending, 1);

        pool.destroy_all(true).await;
        assert_eq!(pending.await.unwrap_err(), DriverError::ConnectionClosed);
        assert_eq!(registry.live_count(), 0);
        assert_eq!(pool.connection_count().await, 0);
        assert!(matches!(pool.checkout().await, Err(DriverError::PoolDestroyed)));
        assert!(matches!(pool.connect(None).await, Err(DriverError::PoolDestroyed)));
    }

    #[tokio::test]
    async fn graceful_destroy_drains_in_flight() {
        let (pool, _transport, registry, _rx) = make_pool(test_options(2));
        pool.connect(None).await.unwrap();

        let pending = {
            let lease = pool.checkout().await.unwrap();
            lease.send(doc(json!({ "marker": 7 }))).unwrap()
        };
        pool.destroy_all(false).await;
        assert_eq!(pending.await.unwrap()["echo"]["marker"], json!(7));
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn graceful_destroy_gives_up_after_drain_timeout() {
        let (pool, _transport, _registry, _rx) = make_pool(test_options(1));
        pool.connect(None).await.unwrap();

        let pending = {
            let lease = pool.checkout().await.unwrap();
            lease.send(doc(json!({ "hang": 1 }))).unwrap()
        };
        let started = std::time::Instant::now();
        pool.destroy_all(false).await;
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(pending.await.unwrap_err(), DriverError::ConnectionClosed);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let (pool, _transport, _registry, _rx) = make_pool(test_options(1));
        pool.connect(None).await.unwrap();
        pool.destroy_all(true).await;
        pool.destroy_all(true).await;
        assert!(pool.is_destroyed().await);
    }

    #[tokio::test]
    async fn shrink_respects_min_size() {
        let (pool, _transport, registry, _rx) = make_pool(test_options(4));
        pool.connect(None).await.unwrap();

        assert_eq!(pool.shrink(2).await, 2);
        assert_eq!(pool.connection_count().await, 2);
        assert_eq!(pool.shrink(0).await, 1);
        assert_eq!(pool.connection_count().await, 1);
        assert_eq!(registry.live_count(), 1);

        // Shrinking is not a failure: nothing is replaced.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.connection_count().await, 1);
    }

    #[tokio::test]
    async fn shrink_skips_busy_connections() {
        let (pool, _transport, _registry, _rx) = make_pool(test_options(2));
        pool.connect(None).await.unwrap();
        let _hung: Vec<_> = pool
            .connections()
            .await
            .iter()
            .map(|c| c.send(doc(json!({ "hang": 1 }))).unwrap())
            .collect();
        assert_eq!(pool.shrink(1).await, 0);
        assert_eq!(pool.connection_count().await, 2);
    }
}
