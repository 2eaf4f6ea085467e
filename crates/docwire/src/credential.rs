//! Credentials applied to pooled connections.

use zeroize::Zeroizing;

use crate::auth::Mechanism;

/// The `(mechanism, source, username)` identity of a credential, without the
/// secret. Connections record the keys of every credential applied to them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CredentialKey {
    pub mechanism: Mechanism,
    pub source: String,
    pub username: String,
}

/// An immutable `(mechanism, authSource db, username, secret)` tuple.
///
/// Replaced, never mutated: `Server::auth` installs a new credential and
/// `Server::logout` clears it.
#[derive(Clone)]
pub struct Credential {
    mechanism: Mechanism,
    source: String,
    username: String,
    password: Zeroizing<String>,
}

impl Credential {
    pub fn new(mechanism: Mechanism, source: &str, username: &str, password: &str) -> Self {
        Self {
            mechanism,
            source: source.to_string(),
            username: username.to_string(),
            password: Zeroizing::new(password.to_string()),
        }
    }

    pub fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    /// Database the credential authenticates against.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }

    pub fn key(&self) -> CredentialKey {
        CredentialKey {
            mechanism: self.mechanism,
            source: self.source.clone(),
            username: self.username.clone(),
        }
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key() && *self.password == *other.password
    }
}

impl Eq for Credential {}

// Manual impl keeps the secret out of logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("mechanism", &self.mechanism)
            .field("source", &self.source)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}
