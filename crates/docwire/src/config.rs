//! Pool and server options, plus the `docwire.toml` file format.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::Mechanism;
use crate::credential::Credential;
use crate::error::{DriverError, DriverResult};
use crate::registry::ConnectionRegistry;

/// Configuration for one server's connection pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolOptions {
    /// Target number of connections (default: 5).
    pub size: usize,
    /// Floor below which `shrink` never goes (default: 1).
    pub min_size: usize,
    /// Time allowed to open a socket and complete its handshake (default: 5s).
    pub connect_timeout: Duration,
    /// Maximum wait for a Ready connection before `PoolExhausted` (default: 5s).
    pub checkout_timeout: Duration,
    /// Attempts per connection slot before growth gives up (default: 3).
    pub reconnect_attempts: u32,
    /// Pause between attempts (default: 100ms).
    pub reconnect_interval: Duration,
    /// How long a non-forced destroy waits for in-flight requests (default: 30s).
    pub drain_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 5,
            min_size: 1,
            connect_timeout: Duration::from_secs(5),
            checkout_timeout: Duration::from_secs(5),
            reconnect_attempts: 3,
            reconnect_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolOptions {
    pub fn validate(&self) -> DriverResult<()> {
        if self.size == 0 {
            return Err(DriverError::Config("pool size must be at least 1".into()));
        }
        if self.min_size > self.size {
            return Err(DriverError::Config(format!(
                "pool min_size {} exceeds size {}",
                self.min_size, self.size
            )));
        }
        if self.reconnect_attempts == 0 {
            return Err(DriverError::Config(
                "reconnect_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Everything needed to build a [`Server`](crate::Server).
#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    pub pool: PoolOptions,
    /// Leak-detection registry shared by every connection of this server.
    pub registry: ConnectionRegistry,
}

impl ServerOptions {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            pool: PoolOptions::default(),
            registry: ConnectionRegistry::default(),
        }
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool.size = size;
        self.pool.min_size = self.pool.min_size.min(size);
        self
    }

    pub fn pool_options(mut self, pool: PoolOptions) -> Self {
        self.pool = pool;
        self
    }

    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.pool.checkout_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.pool.connect_timeout = timeout;
        self
    }

    pub fn registry(mut self, registry: ConnectionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn validate(&self) -> DriverResult<()> {
        if self.host.is_empty() {
            return Err(DriverError::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(DriverError::Config("port must be non-zero".into()));
        }
        self.pool.validate()
    }
}

/// On-disk configuration.
///
/// ```toml
/// [server]
/// host = "127.0.0.1"
/// port = 27017
///
/// [pool]
/// size = 5
/// checkout_timeout_ms = 5000
///
/// [auth]
/// mechanism = "scram-sha-256"
/// source = "admin"
/// username = "user"
/// password = "pencil"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: EndpointConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    pub auth: Option<AuthConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
}

/// `[pool]` table; every field is optional and falls back to [`PoolOptions::default`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    pub size: Option<usize>,
    pub min_size: Option<usize>,
    pub connect_timeout_ms: Option<u64>,
    pub checkout_timeout_ms: Option<u64>,
    pub reconnect_attempts: Option<u32>,
    pub reconnect_interval_ms: Option<u64>,
    pub drain_timeout_ms: Option<u64>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub mechanism: String,
    #[serde(default = "default_auth_source")]
    pub source: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("mechanism", &self.mechanism)
            .field("source", &self.source)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn default_auth_source() -> String {
    "admin".to_string()
}

impl ServerConfig {
    pub fn from_toml_str(content: &str) -> DriverResult<Self> {
        let config: ServerConfig =
            toml::from_str(content).map_err(|e| DriverError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> DriverResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DriverError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> DriverResult<()> {
        self.pool_options().validate()?;
        if self.server.port == 0 {
            return Err(DriverError::Config("port must be non-zero".into()));
        }
        if let Some(auth) = &self.auth {
            auth.mechanism.parse::<Mechanism>()?;
        }
        Ok(())
    }

    fn pool_options(&self) -> PoolOptions {
        let defaults = PoolOptions::default();
        let ms = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };
        PoolOptions {
            size: self.pool.size.unwrap_or(defaults.size),
            min_size: self.pool.min_size.unwrap_or(defaults.min_size),
            connect_timeout: ms(self.pool.connect_timeout_ms, defaults.connect_timeout),
            checkout_timeout: ms(self.pool.checkout_timeout_ms, defaults.checkout_timeout),
            reconnect_attempts: self
                .pool
                .reconnect_attempts
                .unwrap_or(defaults.reconnect_attempts),
            reconnect_interval: ms(self.pool.reconnect_interval_ms, defaults.reconnect_interval),
            drain_timeout: ms(self.pool.drain_timeout_ms, defaults.drain_timeout),
        }
    }

    /// Server options described by this file, with accounting disabled.
    pub fn to_options(&self) -> ServerOptions {
        ServerOptions::new(&self.server.host, self.server.port).pool_options(self.pool_options())
    }

    /// The `[auth]` credential, if present.
    pub fn credential(&self) -> DriverResult<Option<Credential>> {
        let Some(auth) = &self.auth else {
            return Ok(None);
        };
        let mechanism: Mechanism = auth.mechanism.parse()?;
        Ok(Some(Credential::new(
            mechanism,
            &auth.source,
            &auth.username,
            &auth.password,
        )))
    }
}
