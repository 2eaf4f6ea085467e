//! docwire: a single-server document-database driver.
//!
//! A [`Server`] owns a [`Pool`] of multiplexed connections to one endpoint.
//! Each connection is authenticated with the server's active [`Credential`]
//! (SCRAM-SHA-1 or SCRAM-SHA-256) before it is handed out, and every command
//! is correlated with its reply by request id.
//!
//! ```no_run
//! use docwire::{ConnectOptions, Credential, DestroyOptions, Mechanism, Server, ServerOptions};
//!
//! # async fn run() -> docwire::DriverResult<()> {
//! let server = Server::new(ServerOptions::new("127.0.0.1", 27017))?;
//! let credential = Credential::new(Mechanism::ScramSha256, "admin", "user", "pencil");
//! server.connect(ConnectOptions::with_credential(credential)).await?;
//!
//! let mut doc = docwire::Document::new();
//! doc.insert("a".into(), 1.into());
//! let reply = server.insert("test.inserts", vec![doc]).await?;
//! assert_eq!(reply["n"], 1);
//!
//! server.destroy(DestroyOptions { force: true }).await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod credential;
pub mod error;
pub mod pool;
pub mod registry;
pub mod server;
pub mod transport;

pub use auth::{Authenticator, Mechanism};
pub use config::{PoolOptions, ServerConfig, ServerOptions};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use credential::{Credential, CredentialKey};
pub use docwire_wire::{Document, DocumentCodec, JsonCodec};
pub use error::{DriverError, DriverResult};
pub use pool::{ConnectionLease, Pool, PoolStats};
pub use registry::ConnectionRegistry;
pub use server::{CommandOptions, ConnectOptions, DestroyOptions, Server, ServerEvent};
pub use transport::{Address, TcpTransport, Transport};
