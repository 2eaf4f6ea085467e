//! One duplex channel to the server.
//!
//! A [`Connection`] owns two background tasks:
//!
//! ```text
//! send(doc) ─▶ encode ─▶ router.register() ─▶ outbound queue ─▶ writer task ─▶ socket
//! socket ─▶ reader task ─▶ read_frame ─▶ decode ─▶ router.complete(response_to)
//! ```
//!
//! Any transport or framing error tears the connection down: the state moves
//! to `Closed`, every outstanding request fails with `ConnectionClosed`, the
//! registry entry is removed, and only then is the owning pool notified.

pub mod router;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use docwire_wire::{Document, DocumentCodec, decode_message, encode_message, read_frame};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::credential::CredentialKey;
use crate::error::{DriverError, DriverResult};
use crate::registry::ConnectionRegistry;
use crate::transport::{Address, BoxedStream};

pub use router::{CommandRouter, PendingReply};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle. `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Authenticating,
    Ready,
    Closed,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Authenticating => 2,
            ConnectionState::Ready => 3,
            ConnectionState::Closed => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Authenticating,
            3 => ConnectionState::Ready,
            _ => ConnectionState::Closed,
        }
    }
}

/// Notification sent to the owning pool.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    Closed { id: ConnectionId, cause: DriverError },
}

/// An open, possibly authenticated, channel to one server.
pub struct Connection {
    id: ConnectionId,
    address: Address,
    state: AtomicU8,
    router: CommandRouter,
    codec: Arc<dyn DocumentCodec>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    credentials: Mutex<BTreeSet<CredentialKey>>,
    /// Held shared while a command is dispatched, exclusively while
    /// re-authenticating.
    dispatch_gate: Arc<RwLock<()>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    registry: ConnectionRegistry,
    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    created_at: Instant,
}

impl Connection {
    /// Wrap an open stream, register the connection and start its I/O tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn establish(
        address: Address,
        stream: BoxedStream,
        codec: Arc<dyn DocumentCodec>,
        registry: ConnectionRegistry,
        events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    ) -> Arc<Self> {
        let id = ConnectionId::next();
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let connection = Arc::new(Self {
            id,
            address,
            state: AtomicU8::new(ConnectionState::Connecting.to_u8()),
            router: CommandRouter::new(),
            codec,
            outbound: Mutex::new(Some(outbound_tx)),
            credentials: Mutex::new(BTreeSet::new()),
            dispatch_gate: Arc::new(RwLock::new(())),
            tasks: Mutex::new(Vec::with_capacity(2)),
            registry,
            events,
            created_at: Instant::now(),
        });
        connection.registry.register(id);

        let reader = tokio::spawn(read_loop(Arc::downgrade(&connection), read_half));
        let writer = tokio::spawn(write_loop(
            Arc::downgrade(&connection),
            write_half,
            outbound_rx,
        ));
        connection.tasks.lock().unwrap().extend([reader, writer]);
        connection.set_state(ConnectionState::Connected);

        tracing::debug!(
            connection = %id,
            address = %connection.address,
            "connection established"
        );
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` unless already closed.
    pub(crate) fn set_state(&self, next: ConnectionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if ConnectionState::from_u8(current) == ConnectionState::Closed {
                return false;
            }
            match self.state.compare_exchange(
                current,
                next.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Requests written and still awaiting replies.
    pub fn pending_count(&self) -> usize {
        self.router.pending_count()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Keys of every credential applied to this connection so far.
    pub fn applied_credentials(&self) -> Vec<CredentialKey> {
        self.credentials.lock().unwrap().iter().cloned().collect()
    }

    pub fn has_credential(&self, key: &CredentialKey) -> bool {
        self.credentials.lock().unwrap().contains(key)
    }

    pub(crate) fn record_credential(&self, key: CredentialKey) {
        self.credentials.lock().unwrap().insert(key);
    }

    pub(crate) fn dispatch_gate(&self) -> &Arc<RwLock<()>> {
        &self.dispatch_gate
    }

    /// Queue `document` for writing and return a future for its reply.
    ///
    /// Never blocks: the frame is handed to the writer task.
    pub fn send(&self, document: Document) -> DriverResult<PendingReply> {
        if self.is_closed() {
            return Err(DriverError::ConnectionClosed);
        }
        let body = self.codec.encode(&document)?;
        let (request_id, pending) = self.router.register()?;

        let frame = match encode_message(request_id, 0, &body) {
            Ok(frame) => frame,
            Err(e) => {
                self.router.cancel(request_id);
                return Err(e.into());
            }
        };

        let queued = match self.outbound.lock().unwrap().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        };
        if !queued {
            self.router.cancel(request_id);
            return Err(DriverError::ConnectionClosed);
        }

        tracing::trace!(connection = %self.id, request_id, "request queued");
        Ok(pending)
    }

    /// Send `document` and wait for its reply.
    pub async fn execute(&self, document: Document) -> DriverResult<Document> {
        self.send(document)?.await
    }

    /// Route one inbound frame. Framing errors are fatal for the connection;
    /// a reply body the codec cannot decode only fails its own request.
    fn dispatch(&self, frame: &[u8]) -> DriverResult<()> {
        let message = decode_message(frame)?;
        let response_to = message.header.response_to;
        let reply = self.codec.decode(&message.document).map_err(DriverError::from);
        self.router.complete(response_to, reply);
        Ok(())
    }

    /// Close the connection, failing outstanding requests with
    /// `ConnectionClosed`. Idempotent.
    pub fn close(&self) {
        self.teardown(DriverError::ConnectionClosed);
    }

    /// Returns `false` if the connection was already closed.
    fn teardown(&self, cause: DriverError) -> bool {
        let previous = self
            .state
            .swap(ConnectionState::Closed.to_u8(), Ordering::AcqRel);
        if ConnectionState::from_u8(previous) == ConnectionState::Closed {
            return false;
        }

        let swept = self.router.sweep(DriverError::ConnectionClosed);
        // Dropping the sender lets the writer drain and shut the socket down.
        self.outbound.lock().unwrap().take();
        for task in self.tasks.lock().unwrap().drain(..) {
            if !task.is_finished() {
                task.abort();
            }
        }
        self.registry.unregister(self.id);

        tracing::debug!(
            connection = %self.id,
            address = %self.address,
            swept = swept,
            cause = %cause,
            "connection closed"
        );

        if let Some(events) = &self.events {
            let _ = events.send(ConnectionEvent::Closed { id: self.id, cause });
        }
        true
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.teardown(DriverError::ConnectionClosed);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .field("pending", &self.router.pending_count())
            .finish_non_exhaustive()
    }
}

async fn read_loop(connection: Weak<Connection>, mut reader: ReadHalf<BoxedStream>) {
    let cause = loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => break DriverError::from(e),
        };
        let Some(conn) = connection.upgrade() else {
            return;
        };
        if let Err(e) = conn.dispatch(&frame) {
            break e;
        }
    };

    if let Some(conn) = connection.upgrade() {
        if !conn.is_closed() {
            tracing::warn!(connection = %conn.id, error = %cause, "connection read failed");
        }
        conn.teardown(cause);
    }
}

async fn write_loop(
    connection: Weak<Connection>,
    mut writer: WriteHalf<BoxedStream>,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = frames.recv().await {
        let mut result = writer.write_all(&frame).await;
        if result.is_ok() && frames.is_empty() {
            result = writer.flush().await;
        }
        if let Err(e) = result {
            if let Some(conn) = connection.upgrade() {
                tracing::warn!(connection = %conn.id, error = %e, "connection write failed");
                conn.teardown(DriverError::Transport(e.to_string()));
            }
            return;
        }
    }
    let _ = writer.shutdown().await;
}
