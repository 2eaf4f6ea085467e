//! Connection accounting for leak detection.
//!
//! A [`ConnectionRegistry`] records every live connection while accounting
//! is enabled. It is a cheap cloneable handle; clones share state, so one
//! registry can be injected into several servers and checked once they have
//! all been destroyed. Accounting is disabled by default and costs a single
//! uncontended lock per connection open/close when off.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::connection::ConnectionId;

#[derive(Debug, Default)]
struct RegistryState {
    enabled: bool,
    live: BTreeSet<ConnectionId>,
}

/// Shared live-connection accounting.
#[derive(Clone, Debug, Default)]
pub struct ConnectionRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl ConnectionRegistry {
    /// Create a new, disabled registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with accounting already enabled.
    pub fn enabled() -> Self {
        let registry = Self::new();
        registry.enable();
        registry
    }

    /// Start recording connections. Connections opened before this call are
    /// not tracked.
    pub fn enable(&self) {
        self.state.lock().unwrap().enabled = true;
    }

    /// Stop recording and forget every tracked connection.
    pub fn disable(&self) {
        let mut state = self.state.lock().unwrap();
        state.enabled = false;
        state.live.clear();
    }

    /// Forget every tracked connection without changing the enabled flag.
    pub fn reset(&self) {
        self.state.lock().unwrap().live.clear();
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }

    /// Record a newly constructed connection.
    pub(crate) fn register(&self, id: ConnectionId) {
        let mut state = self.state.lock().unwrap();
        if state.enabled {
            state.live.insert(id);
        }
    }

    /// Remove a closed connection. Unknown ids are ignored.
    pub(crate) fn unregister(&self, id: ConnectionId) {
        let mut state = self.state.lock().unwrap();
        if state.enabled {
            state.live.remove(&id);
        }
    }

    /// Number of tracked live connections.
    pub fn live_count(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    /// Ids of the tracked live connections, in ascending order.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.state.lock().unwrap().live.iter().copied().collect()
    }
}
