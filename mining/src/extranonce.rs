//! Per-Connection Extranonce Allocation
//!
//! Every ASIC connection gets a unique extranonce; the extranonce lands in
//! the coinbase, changes the Merkle root, and so gives each device a disjoint
//! hash space. Allocation is strictly monotone: a released value is never
//! reissued, even if the same peer reconnects immediately.

use log::{debug, error};
use std::collections::HashMap;
use std::sync::Mutex;

/// Thread-safe extranonce ledger.
///
/// `allocate` is the only mutator of the counter, so observers of allocated
/// values see a total order.
#[derive(Debug)]
pub struct ExtranonceAllocator {
    inner: Mutex<AllocatorState>,
}

#[derive(Debug)]
struct AllocatorState {
    next: u64,
    by_connection: HashMap<u32, u64>,
}

impl ExtranonceAllocator {
    /// Create an allocator whose first issued value is `start`.
    pub fn new(start: u64) -> Self {
        ExtranonceAllocator {
            inner: Mutex::new(AllocatorState {
                next: start,
                by_connection: HashMap::new(),
            }),
        }
    }

    /// Get the connection's extranonce, allocating the next monotone value if
    /// it does not have one yet.
    pub fn allocate(&self, connection_id: u32) -> u64 {
        let mut state = self.inner.lock().unwrap();

        if let Some(&existing) = state.by_connection.get(&connection_id) {
            return existing;
        }

        let value = state.next;
        state.next += 1;

        // Two live connections sharing an extranonce would silently duplicate
        // work across the whole fleet; that is unrecoverable state.
        if state.by_connection.values().any(|&v| v == value) {
            error!("extranonce {value} already held by a live connection, aborting");
            std::process::abort();
        }

        state.by_connection.insert(connection_id, value);
        debug!("connection {connection_id} assigned extranonce {value}");
        value
    }

    /// Drop a connection's entry. The counter is not decremented.
    pub fn release(&self, connection_id: u32) {
        let mut state = self.inner.lock().unwrap();
        if state.by_connection.remove(&connection_id).is_some() {
            debug!("connection {connection_id} released its extranonce");
        }
    }

    /// Look up a connection's extranonce without allocating.
    pub fn get(&self, connection_id: u32) -> Option<u64> {
        self.inner.lock().unwrap().by_connection.get(&connection_id).copied()
    }

    /// The value the next allocation will return.
    pub fn peek_next(&self) -> u64 {
        self.inner.lock().unwrap().next
    }

    /// Number of connections currently holding an extranonce.
    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().by_connection.len()
    }

    /// Connection ids currently holding an extranonce.
    pub fn active_connections(&self) -> Vec<u32> {
        self.inner.lock().unwrap().by_connection.keys().copied().collect()
    }
}
