//! Challenge-response authentication over a single connection.
//!
//! [`Authenticator`] drives a SCRAM conversation through the server's SASL
//! commands:
//!
//! ```text
//! saslStart    { mechanism, payload: client-first }      → { conversationId, payload: server-first, done: false }
//! saslContinue { conversationId, payload: client-final } → { payload: server-final, done: false|true }
//! saslContinue { conversationId, payload: "" }           → { done: true }   (only if not yet done)
//! ```
//!
//! Payloads are base64 strings inside the command document. Failures are
//! returned to the caller without retry; replacing the connection is the
//! pool's job.

pub mod scram;

use std::str::FromStr;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use docwire_wire::Document;
use serde_json::{Value, json};
use zeroize::Zeroizing;

use crate::connection::Connection;
use crate::credential::Credential;
use crate::error::{DriverError, DriverResult};
use scram::{HashKind, ScramConversation};

/// Named challenge-response mechanism.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Mechanism {
    ScramSha1,
    ScramSha256,
}

impl Mechanism {
    /// Canonical name sent in `saslStart`.
    pub fn as_str(self) -> &'static str {
        match self {
            Mechanism::ScramSha1 => "SCRAM-SHA-1",
            Mechanism::ScramSha256 => "SCRAM-SHA-256",
        }
    }

    pub(crate) fn hash(self) -> HashKind {
        match self {
            Mechanism::ScramSha1 => HashKind::Sha1,
            Mechanism::ScramSha256 => HashKind::Sha256,
        }
    }

    /// Secret fed to the key-derivation function.
    pub(crate) fn prepare_password(
        self,
        username: &str,
        password: &str,
    ) -> DriverResult<Zeroizing<String>> {
        match self {
            Mechanism::ScramSha1 => Ok(scram::sha1_password_digest(username, password)),
            Mechanism::ScramSha256 => scram::saslprep(password),
        }
    }
}

impl std::fmt::Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mechanism {
    type Err = DriverError;

    fn from_str(s: &str) -> DriverResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SCRAM-SHA-1" => Ok(Mechanism::ScramSha1),
            "SCRAM-SHA-256" => Ok(Mechanism::ScramSha256),
            _ => Err(DriverError::Config(format!(
                "unknown authentication mechanism: {s}"
            ))),
        }
    }
}

/// Stateless authentication strategy; the mechanism comes from the credential.
#[derive(Clone, Copy, Debug, Default)]
pub struct Authenticator;

impl Authenticator {
    /// Run the full handshake for `credential` on `connection`.
    ///
    /// A malformed or out-of-order conversation, or a server signature that
    /// does not verify, leaves the connection closed. A rejected credential
    /// does not.
    pub async fn authenticate(&self, connection: &Connection, credential: &Credential) -> DriverResult<()> {
        let result = self.converse(connection, credential).await;
        if let Some(e) = result.as_ref().err().filter(|e| e.is_connection_fatal()) {
            tracing::warn!(
                connection = %connection.id(),
                mechanism = %credential.mechanism(),
                error = %e,
                "closing connection after broken handshake"
            );
            connection.close();
        }
        result
    }

    async fn converse(&self, connection: &Connection, credential: &Credential) -> DriverResult<()> {
        let mechanism = credential.mechanism();
        let password = mechanism.prepare_password(credential.username(), credential.password())?;
        let mut conversation = ScramConversation::new(mechanism, credential.username(), password);

        tracing::debug!(
            connection = %connection.id(),
            mechanism = %mechanism,
            source = credential.source(),
            user = credential.username(),
            "starting authentication"
        );

        let client_first = conversation.client_first()?;
        let reply = connection
            .execute(sasl_start(mechanism, credential.source(), &client_first))
            .await?;
        let challenge = SaslStep::parse(mechanism, &reply)?;
        if challenge.done {
            return Err(DriverError::Protocol(format!(
                "{mechanism}: server finished the conversation before sending a challenge"
            )));
        }

        let client_final = conversation.handle_challenge(&challenge.payload)?;
        let reply = connection
            .execute(sasl_continue(
                credential.source(),
                &challenge.conversation_id,
                &client_final,
            ))
            .await?;
        let outcome = SaslStep::parse(mechanism, &reply)?;
        conversation.verify_server_final(&outcome.payload)?;

        if !outcome.done {
            let reply = connection
                .execute(sasl_continue(
                    credential.source(),
                    &challenge.conversation_id,
                    "",
                ))
                .await?;
            if !SaslStep::parse(mechanism, &reply)?.done {
                return Err(DriverError::Protocol(format!(
                    "{mechanism}: conversation did not complete"
                )));
            }
        }

        tracing::debug!(
            connection = %connection.id(),
            mechanism = %mechanism,
            user = credential.username(),
            "authenticated"
        );
        Ok(())
    }
}

fn as_document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

fn sasl_start(mechanism: Mechanism, source: &str, client_first: &str) -> Document {
    as_document(json!({
        "saslStart": 1,
        "mechanism": mechanism.as_str(),
        "payload": BASE64.encode(client_first),
        "autoAuthorize": 1,
        "$db": source,
    }))
}

fn sasl_continue(source: &str, conversation_id: &Value, payload: &str) -> Document {
    as_document(json!({
        "saslContinue": 1,
        "conversationId": conversation_id,
        "payload": BASE64.encode(payload),
        "$db": source,
    }))
}

/// One server reply within the conversation.
struct SaslStep {
    conversation_id: Value,
    payload: String,
    done: bool,
}

impl SaslStep {
    fn parse(mechanism: Mechanism, reply: &Document) -> DriverResult<Self> {
        if !reply_ok(reply) {
            let message = reply
                .get("errmsg")
                .and_then(Value::as_str)
                .unwrap_or("authentication failed")
                .to_string();
            return Err(DriverError::AuthenticationFailed { mechanism, message });
        }

        let conversation_id = reply.get("conversationId").cloned().unwrap_or(Value::Null);
        let done = reply.get("done").and_then(Value::as_bool).unwrap_or(false);
        let encoded = match reply.get("payload") {
            Some(Value::String(s)) => s.as_str(),
            None if done => "",
            _ => {
                return Err(DriverError::Protocol(format!(
                    "{mechanism}: reply missing payload"
                )));
            }
        };
        let bytes = BASE64
            .decode(encoded)
            .map_err(|_| DriverError::Protocol(format!("{mechanism}: payload is not base64")))?;
        let payload = String::from_utf8(bytes)
            .map_err(|_| DriverError::Protocol(format!("{mechanism}: payload is not UTF-8")))?;

        Ok(Self {
            conversation_id,
            payload,
            done,
        })
    }
}

/// `ok` may be a number or a boolean depending on the server.
pub(crate) fn reply_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v == 1.0),
        Some(Value::Bool(b)) => *b,
        _ => false,
    }
}
