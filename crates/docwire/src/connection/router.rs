//! Request-id allocation and reply correlation for one connection.
//!
//! Every outbound message gets the next request id; its caller waits on a
//! [`PendingReply`]. The connection's reader hands each decoded reply to
//! [`CommandRouter::complete`], which looks up the reply's `response_to` and
//! resolves that caller exactly once. Replies are matched by id, never by
//! arrival order.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Instant;

use docwire_wire::Document;
use tokio::sync::oneshot;

use crate::error::{DriverError, DriverResult};

type ReplySender = oneshot::Sender<DriverResult<Document>>;

/// A request written (or about to be written) and awaiting its reply.
#[derive(Debug)]
struct PendingRequest {
    issued_at: Instant,
    reply: ReplySender,
}

#[derive(Debug)]
struct RouterState {
    next_request_id: i32,
    pending: HashMap<i32, PendingRequest>,
    closed: bool,
}

/// Correlates requests and replies on a single connection.
#[derive(Debug)]
pub struct CommandRouter {
    state: Mutex<RouterState>,
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRouter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RouterState {
                next_request_id: 1,
                pending: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Allocate a request id and register its pending reply.
    ///
    /// Ids are positive, increase monotonically, wrap around, and never
    /// collide with an outstanding request. Fails with `ConnectionClosed`
    /// once the router has been swept.
    pub fn register(&self) -> DriverResult<(i32, PendingReply)> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(DriverError::ConnectionClosed);
        }

        let mut request_id = state.next_request_id;
        while state.pending.contains_key(&request_id) {
            request_id = next_id(request_id);
        }
        state.next_request_id = next_id(request_id);

        let (tx, rx) = oneshot::channel();
        state.pending.insert(
            request_id,
            PendingRequest {
                issued_at: Instant::now(),
                reply: tx,
            },
        );
        Ok((request_id, PendingReply { request_id, rx }))
    }

    /// Resolve the request `response_to` with `result`.
    ///
    /// Returns `false` when nothing is waiting for that id, which happens
    /// when a sweep already failed the request. Such replies are dropped.
    pub fn complete(&self, response_to: i32, result: DriverResult<Document>) -> bool {
        let pending = self.state.lock().unwrap().pending.remove(&response_to);
        match pending {
            Some(request) => {
                tracing::trace!(
                    request_id = response_to,
                    elapsed_us = request.issued_at.elapsed().as_micros() as u64,
                    "reply routed"
                );
                // The caller may have stopped waiting; that is not an error.
                let _ = request.reply.send(result);
                true
            }
            None => {
                tracing::warn!(response_to, "dropping reply with no pending request");
                false
            }
        }
    }

    /// Forget a request whose message was never written.
    pub fn cancel(&self, request_id: i32) -> bool {
        self.state.lock().unwrap().pending.remove(&request_id).is_some()
    }

    /// Close the router and fail every outstanding request with `error`.
    ///
    /// Returns the number of requests failed. Later registrations fail with
    /// `ConnectionClosed`.
    pub fn sweep(&self, error: DriverError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            state.pending.drain().map(|(_, request)| request).collect()
        };
        let count = drained.len();
        for request in drained {
            let _ = request.reply.send(Err(error.clone()));
        }
        count
    }

    /// Number of requests awaiting replies.
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

fn next_id(id: i32) -> i32 {
    if id == i32::MAX { 1 } else { id + 1 }
}

/// Resolves to the reply for one request.
///
/// If the router is dropped without completing the request the future
/// resolves to `ConnectionClosed`.
#[derive(Debug)]
pub struct PendingReply {
    request_id: i32,
    rx: oneshot::Receiver<DriverResult<Document>>,
}

impl PendingReply {
    pub fn request_id(&self) -> i32 {
        self.request_id
    }
}

impl Future for PendingReply {
    type Output = DriverResult<Document>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(DriverError::ConnectionClosed)))
    }
}
