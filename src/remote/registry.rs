use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::remote::transport::Transport;

/// A concurrent index of the server's live transport sessions, keyed by the peer's address and
///  the session's priority. Multiple sessions to the same peer are legitimate (e.g. a control
///  and a bulk session); they differ in priority.
///
/// Iteration order is deterministic: peers in address order, sessions per peer in ascending
///  priority.
pub struct TransportRegistry {
    inner: Mutex<RegistryState>,
}

struct RegistryState {
    transports: BTreeMap<SocketAddr, BTreeMap<u16, Arc<dyn Transport>>>,
    transport_count: usize,
}

impl TransportRegistry {
    pub fn new() -> TransportRegistry {
        TransportRegistry {
            inner: Mutex::new(RegistryState {
                transports: BTreeMap::new(),
                transport_count: 0,
            }),
        }
    }

    /// Inserts at the transport's `(remote address, priority)`. Re-inserting at an occupied key
    ///  replaces the held reference without changing the count.
    pub fn put(&self, transport: Arc<dyn Transport>) {
        let address = transport.remote_address();
        let priority = transport.priority();

        let mut guard = self.inner.lock().unwrap();
        let state = &mut *guard;
        let priorities = state.transports.entry(address).or_default();
        if priorities.insert(priority, transport).is_none() {
            state.transport_count += 1;
        }
    }

    pub fn get(&self, address: &SocketAddr, priority: u16) -> Option<Arc<dyn Transport>> {
        let state = self.inner.lock().unwrap();
        state.transports
            .get(address)
            .and_then(|priorities| priorities.get(&priority))
            .cloned()
    }

    /// all sessions to this peer, ascending by priority
    pub fn get_all(&self, address: &SocketAddr) -> Option<Vec<Arc<dyn Transport>>> {
        let state = self.inner.lock().unwrap();
        state.transports
            .get(address)
            .map(|priorities| priorities.values().cloned().collect())
    }

    /// Removes the entry at the transport's `(remote address, priority)`, returning the
    ///  previously held reference. The peer's outer entry disappears with its last session.
    pub fn remove(&self, transport: &Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        let address = transport.remote_address();
        let priority = transport.priority();

        let mut guard = self.inner.lock().unwrap();
        let state = &mut *guard;
        let priorities = state.transports.get_mut(&address)?;
        let removed = priorities.remove(&priority)?;
        if priorities.is_empty() {
            state.transports.remove(&address);
        }
        state.transport_count -= 1;
        Some(removed)
    }

    pub fn clear(&self) {
        let mut state = self.inner.lock().unwrap();
        state.transports.clear();
        state.transport_count = 0;
    }

    pub fn number_of_active_transports(&self) -> usize {
        self.inner.lock().unwrap().transport_count
    }

    /// all registered transports as a flat sequence, outer address order, inner priority order
    pub fn to_array(&self) -> Vec<Arc<dyn Transport>> {
        let state = self.inner.lock().unwrap();
        state.transports
            .values()
            .flat_map(|priorities| priorities.values().cloned())
            .collect()
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        TransportRegistry::new()
    }
}
