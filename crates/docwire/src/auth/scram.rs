//! SCRAM client conversation (RFC 5802 / RFC 7677).
//!
//! One state machine serves every SCRAM mechanism. A mechanism only
//! contributes its [`HashKind`] (hash, HMAC and PBKDF2 primitive) and its
//! password preparation rule; message shapes, proof derivation and server
//! signature verification are shared.
//!
//! ```text
//! Init ─client_first()─▶ AwaitingChallenge ─handle_challenge()─▶ AwaitingServerSignature
//!                                                                   │
//!                                       verify_server_final() ──────┴─▶ Authenticated | Failed
//! ```
//!
//! Calling a step out of order moves the conversation to `Failed` and
//! returns a protocol error.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::Rng;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::Mechanism;
use crate::error::{DriverError, DriverResult};

/// Servers must not ask for fewer PBKDF2 rounds than this.
const MIN_ITERATIONS: u32 = 4096;

/// Base64 of the GS2 header `n,,` (no channel binding).
const CHANNEL_BINDING: &str = "biws";

const CLIENT_NONCE_LEN: usize = 24;

/// Hash primitive behind a SCRAM mechanism.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HashKind {
    Sha1,
    Sha256,
}

impl HashKind {
    fn output_len(self) -> usize {
        match self {
            HashKind::Sha1 => 20,
            HashKind::Sha256 => 32,
        }
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashKind::Sha1 => Sha1::digest(data).to_vec(),
            HashKind::Sha256 => Sha256::digest(data).to_vec(),
        }
    }

    fn hmac(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            HashKind::Sha1 => {
                let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key)
                    .expect("HMAC accepts any key length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            HashKind::Sha256 => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
                    .expect("HMAC accepts any key length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    fn salt_password(self, password: &[u8], salt: &[u8], iterations: u32) -> Zeroizing<Vec<u8>> {
        let mut salted = Zeroizing::new(vec![0u8; self.output_len()]);
        match self {
            HashKind::Sha1 => {
                pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, iterations, salted.as_mut_slice())
            }
            HashKind::Sha256 => {
                pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, salted.as_mut_slice())
            }
        }
        salted
    }
}

/// Escape a username for the `n=` attribute.
pub(crate) fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

/// Secret fed to PBKDF2 for SCRAM-SHA-1: hex MD5 of `user:mongo:password`.
pub(crate) fn sha1_password_digest(username: &str, password: &str) -> Zeroizing<String> {
    let digest = Md5::digest(format!("{username}:mongo:{password}").as_bytes());
    Zeroizing::new(hex::encode(digest))
}

/// Reduced SASLprep (RFC 4013) for passwords.
///
/// Maps non-ASCII spaces to U+0020, removes characters "commonly mapped to
/// nothing", and rejects control characters. Unicode normalization is not
/// applied, so non-ASCII secrets must already be in NFKC form.
pub(crate) fn saslprep(input: &str) -> DriverResult<Zeroizing<String>> {
    let mut out = Zeroizing::new(String::with_capacity(input.len()));
    for c in input.chars() {
        if is_non_ascii_space(c) {
            out.push(' ');
        } else if is_mapped_to_nothing(c) {
            continue;
        } else if c.is_control() {
            return Err(DriverError::Config(format!(
                "password contains prohibited character U+{:04X}",
                c as u32
            )));
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

fn is_non_ascii_space(c: char) -> bool {
    matches!(
        c,
        '\u{00A0}' | '\u{1680}' | '\u{2000}'..='\u{200A}' | '\u{202F}' | '\u{205F}' | '\u{3000}'
    )
}

fn is_mapped_to_nothing(c: char) -> bool {
    matches!(
        c,
        '\u{00AD}'
            | '\u{034F}'
            | '\u{1806}'
            | '\u{180B}'..='\u{180D}'
            | '\u{200B}'..='\u{200D}'
            | '\u{2060}'
            | '\u{FE00}'..='\u{FE0F}'
            | '\u{FEFF}'
    )
}

fn generate_nonce() -> String {
    let bytes: [u8; CLIENT_NONCE_LEN] = rand::thread_rng().r#gen();
    BASE64.encode(bytes)
}

enum ScramState {
    Init,
    AwaitingChallenge {
        client_first_bare: String,
    },
    AwaitingServerSignature {
        expected_signature: Vec<u8>,
    },
    Authenticated,
    Failed,
}

impl ScramState {
    fn name(&self) -> &'static str {
        match self {
            ScramState::Init => "init",
            ScramState::AwaitingChallenge { .. } => "awaiting-challenge",
            ScramState::AwaitingServerSignature { .. } => "awaiting-server-signature",
            ScramState::Authenticated => "authenticated",
            ScramState::Failed => "failed",
        }
    }
}

/// Client side of one SCRAM exchange.
pub(crate) struct ScramConversation {
    mechanism: Mechanism,
    username: String,
    password: Zeroizing<String>,
    client_nonce: String,
    state: ScramState,
}

impl ScramConversation {
    /// Start a conversation with an already-prepared password and a fresh nonce.
    pub(crate) fn new(mechanism: Mechanism, username: &str, password: Zeroizing<String>) -> Self {
        Self::with_nonce(mechanism, username, password, generate_nonce())
    }

    pub(crate) fn with_nonce(
        mechanism: Mechanism,
        username: &str,
        password: Zeroizing<String>,
        client_nonce: String,
    ) -> Self {
        Self {
            mechanism,
            username: escape_username(username),
            password,
            client_nonce,
            state: ScramState::Init,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_authenticated(&self) -> bool {
        matches!(self.state, ScramState::Authenticated)
    }

    fn fail(&mut self, err: DriverError) -> DriverError {
        self.state = ScramState::Failed;
        err
    }

    fn out_of_order(&mut self, step: &str) -> DriverError {
        let msg = format!(
            "{}: {step} not allowed in state {}",
            self.mechanism,
            self.state.name()
        );
        self.fail(DriverError::Protocol(msg))
    }

    fn protocol(&mut self, msg: impl std::fmt::Display) -> DriverError {
        let msg = format!("{}: {msg}", self.mechanism);
        self.fail(DriverError::Protocol(msg))
    }

    /// Step 1: `n,,n=<user>,r=<client nonce>`.
    pub(crate) fn client_first(&mut self) -> DriverResult<String> {
        if !matches!(self.state, ScramState::Init) {
            return Err(self.out_of_order("client-first"));
        }
        let client_first_bare = format!("n={},r={}", self.username, self.client_nonce);
        let message = format!("n,,{client_first_bare}");
        self.state = ScramState::AwaitingChallenge { client_first_bare };
        Ok(message)
    }

    /// Steps 2-3: consume the server challenge and produce the final client
    /// message carrying the proof.
    pub(crate) fn handle_challenge(&mut self, server_first: &str) -> DriverResult<String> {
        let client_first_bare = match &self.state {
            ScramState::AwaitingChallenge { client_first_bare } => client_first_bare.clone(),
            _ => return Err(self.out_of_order("server-first")),
        };

        let challenge = match parse_challenge(server_first) {
            Ok(challenge) => challenge,
            Err(ChallengeError::Rejected(msg)) => {
                let err = DriverError::AuthenticationFailed {
                    mechanism: self.mechanism,
                    message: msg,
                };
                return Err(self.fail(err));
            }
            Err(ChallengeError::Malformed(msg)) => return Err(self.protocol(msg)),
        };

        if !challenge.nonce.starts_with(&self.client_nonce)
            || challenge.nonce.len() == self.client_nonce.len()
        {
            return Err(self.protocol("server nonce does not extend client nonce"));
        }
        if challenge.iterations < MIN_ITERATIONS {
            return Err(self.protocol(format!(
                "iteration count {} below minimum {MIN_ITERATIONS}",
                challenge.iterations
            )));
        }

        let hash = self.mechanism.hash();
        let salted = hash.salt_password(
            self.password.as_bytes(),
            &challenge.salt,
            challenge.iterations,
        );

        let without_proof = format!("c={CHANNEL_BINDING},r={}", challenge.nonce);
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");

        let client_key = hash.hmac(&salted, b"Client Key");
        let stored_key = hash.digest(&client_key);
        let client_signature = hash.hmac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let server_key = hash.hmac(&salted, b"Server Key");
        let expected_signature = hash.hmac(&server_key, auth_message.as_bytes());

        self.state = ScramState::AwaitingServerSignature { expected_signature };
        Ok(format!("{without_proof},p={}", BASE64.encode(proof)))
    }

    /// Step 4: verify the server signature.
    pub(crate) fn verify_server_final(&mut self, server_final: &str) -> DriverResult<()> {
        let expected = match &self.state {
            ScramState::AwaitingServerSignature { expected_signature } => expected_signature.clone(),
            _ => return Err(self.out_of_order("server-final")),
        };

        let mut signature = None;
        for attr in server_final.split(',') {
            if let Some(msg) = attr.strip_prefix("e=") {
                let err = DriverError::AuthenticationFailed {
                    mechanism: self.mechanism,
                    message: msg.to_string(),
                };
                return Err(self.fail(err));
            }
            if let Some(value) = attr.strip_prefix("v=") {
                signature = Some(value.to_string());
            }
        }

        let Some(encoded) = signature else {
            return Err(self.protocol("server-final missing signature"));
        };
        let received = match BASE64.decode(encoded.as_bytes()) {
            Ok(bytes) => bytes,
            Err(_) => return Err(self.protocol("invalid base64 in server signature")),
        };

        if received.ct_eq(&expected).into() {
            self.state = ScramState::Authenticated;
            Ok(())
        } else {
            let err = DriverError::ServerSignatureMismatch {
                mechanism: self.mechanism,
            };
            Err(self.fail(err))
        }
    }
}

struct Challenge {
    nonce: String,
    salt: Vec<u8>,
    iterations: u32,
}

enum ChallengeError {
    Rejected(String),
    Malformed(String),
}

/// Parse `r=<nonce>,s=<salt>,i=<iterations>[,...]`.
fn parse_challenge(msg: &str) -> Result<Challenge, ChallengeError> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for attr in msg.split(',') {
        if let Some(value) = attr.strip_prefix("e=") {
            return Err(ChallengeError::Rejected(value.to_string()));
        } else if attr.starts_with("m=") {
            return Err(ChallengeError::Malformed(
                "unsupported mandatory extension".into(),
            ));
        } else if let Some(value) = attr.strip_prefix("r=") {
            nonce = Some(value.to_string());
        } else if let Some(value) = attr.strip_prefix("s=") {
            salt = Some(
                BASE64
                    .decode(value)
                    .map_err(|_| ChallengeError::Malformed("invalid base64 in salt".into()))?,
            );
        } else if let Some(value) = attr.strip_prefix("i=") {
            iterations = Some(
                value
                    .parse::<u32>()
                    .map_err(|_| ChallengeError::Malformed("invalid iteration count".into()))?,
            );
        }
    }

    match (nonce, salt, iterations) {
        (Some(nonce), Some(salt), Some(iterations)) => Ok(Challenge {
            nonce,
            salt,
            iterations,
        }),
        _ => Err(ChallengeError::Malformed(
            "missing required field in server-first".into(),
        )),
    }
}
