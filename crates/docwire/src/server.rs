//! Server façade: one pool, one credential, one event stream.

use std::sync::Arc;

use docwire_wire::{Document, DocumentCodec, JsonCodec};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::auth::{Mechanism, reply_ok};
use crate::config::ServerOptions;
use crate::credential::{Credential, CredentialKey};
use crate::error::{DriverError, DriverResult};
use crate::pool::{Pool, PoolStats};
use crate::registry::ConnectionRegistry;
use crate::transport::{Address, TcpTransport, Transport};

const EVENT_CAPACITY: usize = 64;

/// Lifecycle notifications, delivered to every [`Server::subscribe`] receiver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerEvent {
    /// The pool has at least one Ready connection.
    Connected,
    /// Connect failed, authentication was rejected, or the pool could not
    /// replace lost connections.
    Error(DriverError),
    /// The server was destroyed.
    Closed,
}

#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    /// Applied to every connection before it becomes Ready.
    pub credential: Option<Credential>,
}

impl ConnectOptions {
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            credential: Some(credential),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CommandOptions {
    /// Turn `ok: 0` replies into [`DriverError::Command`] (default: true).
    pub check_ok: bool,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self { check_ok: true }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DestroyOptions {
    /// Fail outstanding requests immediately instead of draining them.
    pub force: bool,
}

/// A driver handle for one server endpoint.
///
/// Cheap to clone; clones share the pool and event stream.
#[derive(Clone)]
pub struct Server {
    options: Arc<ServerOptions>,
    pool: Pool,
    events: broadcast::Sender<ServerEvent>,
}

impl Server {
    /// Server over TCP with the JSON document codec.
    pub fn new(options: ServerOptions) -> DriverResult<Self> {
        let transport = Arc::new(TcpTransport::new(options.pool.connect_timeout));
        Self::with_collaborators(options, transport, Arc::new(JsonCodec))
    }

    /// Server with caller-supplied transport and codec.
    pub fn with_collaborators(
        options: ServerOptions,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn DocumentCodec>,
    ) -> DriverResult<Self> {
        options.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let pool = Pool::new(
            Address::new(&options.host, options.port),
            options.pool.clone(),
            transport,
            codec,
            options.registry.clone(),
            events.clone(),
        );
        Ok(Self {
            options: Arc::new(options),
            pool,
            events,
        })
    }

    pub fn address(&self) -> &Address {
        self.pool.address()
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.options.registry
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Receive lifecycle events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Fill the pool, authenticating each connection with the given credential.
    ///
    /// Emits exactly one of `Connected` or `Error` and returns the same outcome.
    pub async fn connect(&self, options: ConnectOptions) -> DriverResult<()> {
        match self.pool.connect(options.credential).await {
            Ok(connections) => {
                tracing::info!(address = %self.address(), connections, "server connected");
                let _ = self.events.send(ServerEvent::Connected);
                Ok(())
            }
            Err(e) => {
                tracing::error!(address = %self.address(), error = %e, "server connect failed");
                let _ = self.events.send(ServerEvent::Error(e.clone()));
                Err(e)
            }
        }
    }

    /// Run `command` against the database named by `ns` (`"<db>.$cmd"`).
    pub async fn command(
        &self,
        ns: &str,
        command: Document,
        options: CommandOptions,
    ) -> DriverResult<Document> {
        let (db, _) = split_namespace(ns)?;
        self.run_command(db, command, options).await
    }

    /// Insert `documents` into the collection named by `ns` (`"<db>.<collection>"`).
    ///
    /// Returns the server's reply, whose `n` field counts inserted documents.
    pub async fn insert(&self, ns: &str, documents: Vec<Document>) -> DriverResult<Document> {
        let (db, collection) = split_namespace(ns)?;
        let collection = collection
            .filter(|c| !c.is_empty())
            .ok_or_else(|| DriverError::Config(format!("namespace {ns:?} names no collection")))?;

        let mut command = Document::new();
        command.insert("insert".into(), Value::String(collection.to_string()));
        command.insert(
            "documents".into(),
            Value::Array(documents.into_iter().map(Value::Object).collect()),
        );
        command.insert("ordered".into(), Value::Bool(true));
        self.run_command(db, command, CommandOptions::default()).await
    }

    /// Authenticate every pooled connection as `username` and keep the
    /// credential for connections opened later.
    pub async fn auth(
        &self,
        mechanism: Mechanism,
        db: &str,
        username: &str,
        password: &str,
    ) -> DriverResult<()> {
        let credential = Credential::new(mechanism, db, username, password);
        match self.pool.reauthenticate(credential).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_auth_failure() {
                    let _ = self.events.send(ServerEvent::Error(e.clone()));
                }
                Err(e)
            }
        }
    }

    /// Drop the credential issued by `db`.
    ///
    /// Already-open connections stay authenticated until they are replaced;
    /// connections opened afterwards are not authenticated. Runs after any
    /// `auth` already in progress.
    ///
    /// Logging out of a database that issued no credential is a no-op and
    /// returns `Ok(())`.
    pub async fn logout(&self, db: &str) -> DriverResult<()> {
        if self.pool.clear_credential(db).await.is_none() {
            tracing::debug!(address = %self.address(), db, "logout without matching credential");
        }
        Ok(())
    }

    /// Close every connection. See [`DestroyOptions::force`].
    pub async fn destroy(&self, options: DestroyOptions) {
        self.pool.destroy_all(options.force).await;
        let _ = self.events.send(ServerEvent::Closed);
    }

    /// Key of the credential new connections will be authenticated with.
    pub async fn credential(&self) -> Option<CredentialKey> {
        self.pool.credential().await
    }

    pub async fn connection_count(&self) -> usize {
        self.pool.connection_count().await
    }

    pub async fn stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    async fn run_command(
        &self,
        db: &str,
        mut command: Document,
        options: CommandOptions,
    ) -> DriverResult<Document> {
        command.insert("$db".into(), Value::String(db.to_string()));

        // A connection may close between checkout and write; that request
        // never reached the wire, so another connection can take it.
        let attempts = self.options.pool.size + 1;
        let mut attempt = 0;
        let pending = loop {
            attempt += 1;
            let lease = self.pool.checkout().await?;
            match lease.send(command.clone()) {
                Ok(pending) => break pending,
                Err(DriverError::ConnectionClosed) if attempt < attempts => {
                    tracing::debug!(
                        connection = %lease.id(),
                        attempt,
                        "connection closed before dispatch, retrying checkout"
                    );
                }
                Err(e) => return Err(e),
            }
        };

        let reply = pending.await?;
        if options.check_ok && !reply_ok(&reply) {
            return Err(command_error(&reply));
        }
        Ok(reply)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("address", self.address())
            .field("pool", &self.pool)
            .finish()
    }
}

/// Split `"db.collection"` into its database and optional collection.
fn split_namespace(ns: &str) -> DriverResult<(&str, Option<&str>)> {
    let (db, collection) = match ns.split_once('.') {
        Some((db, collection)) => (db, Some(collection)),
        None => (ns, None),
    };
    if db.is_empty() {
        return Err(DriverError::Config(format!("invalid namespace {ns:?}")));
    }
    Ok((db, collection))
}

fn command_error(reply: &Document) -> DriverError {
    DriverError::Command {
        code: reply.get("code").and_then(Value::as_i64).unwrap_or(0),
        code_name: reply
            .get("codeName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        message: reply
            .get("errmsg")
            .and_then(Value::as_str)
            .unwrap_or("command failed")
            .to_string(),
    }
}
