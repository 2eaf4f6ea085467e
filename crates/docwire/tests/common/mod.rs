//! Shared fixtures: a `MockDocumentServer` speaking the wire framing and the
//! server side of SCRAM over real TCP.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use docwire::{Document, DocumentCodec, JsonCodec, Server};
use docwire_wire::{HEADER_LEN, decode_message, encode_message};
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use serde_json::{Value, json};

pub const USER: &str = "user";
pub const PASSWORD: &str = "pencil";

const SALT: &[u8] = b"docwire-mock-salt";
const ITERATIONS: u32 = 4096;

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

// ── MockDocumentServer ──────────────────────────────────────────────

#[derive(Default)]
struct Shared {
    users: Mutex<HashMap<String, String>>,
    streams: Mutex<Vec<TcpStream>>,
    accepted: AtomicUsize,
    inserted: AtomicUsize,
    forge_signatures: AtomicBool,
    interleaved: AtomicUsize,
}

/// A TCP server that:
/// 1. Answers `ping`/`ismaster`/`hello` without authentication
/// 2. Runs SCRAM-SHA-1 and SCRAM-SHA-256 conversations against its user table,
///    reporting `done: false` after the server signature
/// 3. Requires authentication for `insert` and `echo`
/// 4. Never answers `hang`
pub struct MockDocumentServer {
    port: u16,
    shared: Arc<Shared>,
}

impl MockDocumentServer {
    /// Start a server knowing `USER`/`PASSWORD`.
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind to random port");
        let port = listener.local_addr().expect("local addr").port();
        let shared = Arc::new(Shared::default());
        shared
            .users
            .lock()
            .unwrap()
            .insert(USER.to_string(), PASSWORD.to_string());

        let accept_shared = Arc::clone(&shared);
        std::thread::spawn(move || {
            while let Ok((stream, _)) = listener.accept() {
                accept_shared.accepted.fetch_add(1, Ordering::SeqCst);
                if let Ok(clone) = stream.try_clone() {
                    accept_shared.streams.lock().unwrap().push(clone);
                }
                let shared = Arc::clone(&accept_shared);
                std::thread::spawn(move || handle_connection(stream, shared));
            }
        });

        std::thread::sleep(Duration::from_millis(10));
        Self { port, shared }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Documents stored by `insert` so far.
    pub fn inserted(&self) -> usize {
        self.shared.inserted.load(Ordering::SeqCst)
    }

    /// Commands that arrived on a connection in the middle of a SCRAM conversation.
    pub fn interleaved(&self) -> usize {
        self.shared.interleaved.load(Ordering::SeqCst)
    }

    /// Answer client proofs with a signature the client cannot verify.
    pub fn forge_signatures(&self, forge: bool) {
        self.shared.forge_signatures.store(forge, Ordering::SeqCst);
    }

    /// Reset every open connection.
    pub fn kill_connections(&self) {
        for stream in self.shared.streams.lock().unwrap().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Per-connection conversation state.
struct Conversation {
    hash: Hash,
    user: String,
    client_first_bare: String,
    server_first: String,
    salted_password: Vec<u8>,
    proof_verified: bool,
}

fn handle_connection(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut authenticated = false;
    let mut conversation: Option<Conversation> = None;

    loop {
        let mut header = [0u8; 4];
        if stream.read_exact(&mut header).is_err() {
            return;
        }
        let length = i32::from_le_bytes(header) as usize;
        if length < HEADER_LEN {
            return;
        }
        let mut frame = header.to_vec();
        frame.resize(length, 0);
        if stream.read_exact(&mut frame[4..]).is_err() {
            return;
        }

        let Ok(message) = decode_message(&frame) else {
            return;
        };
        let Ok(request) = JsonCodec.decode(&message.document) else {
            return;
        };

        let is_sasl = request.contains_key("saslStart") || request.contains_key("saslContinue");
        if conversation.is_some() && !is_sasl {
            shared.interleaved.fetch_add(1, Ordering::SeqCst);
        }

        let reply = match command_name(&request) {
            "hang" => continue,
            "ping" | "ismaster" | "isMaster" | "hello" => {
                json!({ "ok": 1, "ismaster": true, "maxWireVersion": 17 })
            }
            "saslStart" => sasl_start(&request, &shared, &mut conversation),
            "saslContinue" => sasl_continue(&request, &shared, &mut conversation, &mut authenticated),
            "insert" if authenticated => {
                let n = request
                    .get("documents")
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                shared.inserted.fetch_add(n, Ordering::SeqCst);
                json!({ "ok": 1, "n": n })
            }
            "echo" if authenticated => {
                json!({ "ok": 1, "marker": request.get("marker").cloned().unwrap_or(Value::Null) })
            }
            "insert" | "echo" => json!({
                "ok": 0,
                "code": 13,
                "codeName": "Unauthorized",
                "errmsg": format!("command {} requires authentication", command_name(&request)),
            }),
            other => json!({
                "ok": 0,
                "code": 59,
                "codeName": "CommandNotFound",
                "errmsg": format!("no such command: '{other}'"),
            }),
        };

        let body = JsonCodec.encode(&doc(reply)).unwrap();
        let frame = encode_message(0, message.header.request_id, &body).unwrap();
        if stream.write_all(&frame).is_err() || stream.flush().is_err() {
            return;
        }
    }
}

fn command_name(request: &Document) -> &str {
    request.keys().next().map(String::as_str).unwrap_or("")
}

fn auth_failed() -> Value {
    json!({ "ok": 0, "code": 18, "codeName": "AuthenticationFailed", "errmsg": "Authentication failed." })
}

fn decode_payload(request: &Document) -> String {
    let encoded = request.get("payload").and_then(Value::as_str).unwrap_or("");
    String::from_utf8(BASE64.decode(encoded).unwrap()).unwrap()
}

fn field<'a>(message: &'a str, key: &str) -> Option<&'a str> {
    message
        .split(',')
        .find_map(|part| part.strip_prefix(key)?.strip_prefix('='))
}

fn sasl_start(
    request: &Document,
    shared: &Shared,
    conversation: &mut Option<Conversation>,
) -> Value {
    let hash = match request.get("mechanism").and_then(Value::as_str) {
        Some("SCRAM-SHA-1") => Hash::Sha1,
        Some("SCRAM-SHA-256") => Hash::Sha256,
        _ => return json!({ "ok": 0, "code": 2, "errmsg": "unsupported mechanism" }),
    };

    let client_first = decode_payload(request);
    let Some(client_first_bare) = client_first.strip_prefix("n,,") else {
        return auth_failed();
    };
    let (Some(user), Some(client_nonce)) = (field(client_first_bare, "n"), field(client_first_bare, "r"))
    else {
        return auth_failed();
    };
    let user = user.replace("=2C", ",").replace("=3D", "=");

    let Some(password) = shared.users.lock().unwrap().get(&user).cloned() else {
        return auth_failed();
    };
    let secret = match hash {
        Hash::Sha1 => hex::encode(Md5::digest(format!("{user}:mongo:{password}").as_bytes())),
        Hash::Sha256 => password,
    };

    let server_first = format!(
        "r={client_nonce}mockserver{},s={},i={ITERATIONS}",
        shared.accepted.load(Ordering::SeqCst),
        BASE64.encode(SALT)
    );
    *conversation = Some(Conversation {
        hash,
        user,
        client_first_bare: client_first_bare.to_string(),
        server_first: server_first.clone(),
        salted_password: hash.salt_password(&secret, SALT, ITERATIONS),
        proof_verified: false,
    });

    json!({
        "ok": 1,
        "conversationId": 1,
        "done": false,
        "payload": BASE64.encode(server_first),
    })
}

fn sasl_continue(
    request: &Document,
    shared: &Shared,
    conversation: &mut Option<Conversation>,
    authenticated: &mut bool,
) -> Value {
    let Some(state) = conversation.as_mut() else {
        return json!({ "ok": 0, "code": 17, "errmsg": "no SASL session state found" });
    };

    if state.proof_verified {
        // Final empty round.
        *conversation = None;
        *authenticated = true;
        return json!({ "ok": 1, "conversationId": 1, "done": true, "payload": "" });
    }

    let client_final = decode_payload(request);
    let Some((without_proof, proof)) = client_final.rsplit_once(",p=") else {
        *conversation = None;
        return auth_failed();
    };
    let Ok(proof) = BASE64.decode(proof) else {
        *conversation = None;
        return auth_failed();
    };

    let hash = state.hash;
    let auth_message = format!(
        "{},{},{}",
        state.client_first_bare, state.server_first, without_proof
    );
    let client_key = hash.hmac(&state.salted_password, b"Client Key");
    let stored_key = hash.digest(&client_key);
    let client_signature = hash.hmac(&stored_key, auth_message.as_bytes());
    let recovered: Vec<u8> = proof
        .iter()
        .zip(&client_signature)
        .map(|(a, b)| a ^ b)
        .collect();
    if proof.len() != client_signature.len() || hash.digest(&recovered) != stored_key {
        tracing::debug!(user = %state.user, "mock rejected client proof");
        *conversation = None;
        return auth_failed();
    }

    let server_key = hash.hmac(&state.salted_password, b"Server Key");
    let mut signature = hash.hmac(&server_key, auth_message.as_bytes());
    if shared.forge_signatures.load(Ordering::SeqCst) {
        signature.iter_mut().for_each(|b| *b ^= 0xff);
    }
    state.proof_verified = true;

    json!({
        "ok": 1,
        "conversationId": 1,
        "done": false,
        "payload": BASE64.encode(format!("v={}", BASE64.encode(signature))),
    })
}

#[derive(Clone, Copy)]
enum Hash {
    Sha1,
    Sha256,
}

impl Hash {
    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Hash::Sha1 => Sha1::digest(data).to_vec(),
            Hash::Sha256 => Sha256::digest(data).to_vec(),
        }
    }

    fn hmac(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            Hash::Sha1 => {
                let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key).unwrap();
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            Hash::Sha256 => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).unwrap();
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    fn salt_password(self, secret: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
        match self {
            Hash::Sha1 => {
                let mut out = vec![0u8; 20];
                pbkdf2::pbkdf2_hmac::<Sha1>(secret.as_bytes(), salt, iterations, &mut out);
                out
            }
            Hash::Sha256 => {
                let mut out = vec![0u8; 32];
                pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, iterations, &mut out);
                out
            }
        }
    }
}

// ── Polling helpers ─────────────────────────────────────────────────

/// Wait until the server's pool reports `ready` Ready connections and no
/// growth in progress.
pub async fn wait_for_ready(server: &Server, ready: usize) {
    for _ in 0..300 {
        let stats = server.stats().await;
        if stats.ready == ready && stats.connecting == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "pool never reached {ready} ready connections: {:?}",
        server.stats().await
    );
}

/// Wait until the mock has accepted at least `count` connections.
pub async fn wait_for_accepted(mock: &MockDocumentServer, count: usize) {
    for _ in 0..300 {
        if mock.accepted() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("mock accepted only {} connections", mock.accepted());
}
