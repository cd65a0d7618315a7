//! The live-connection set.
//!
//! Connections are stored in a lockfree map keyed by id, so the loop thread,
//! broadcasting application threads and closing threads never block each
//! other on a registry lock.
//!
//! ```text
//!   LockfreeMap<u32, Arc<Connection>>
//!        ├──> 1 ──> Connection 1
//!        ├──> 2 ──> Connection 2
//!        └──> N ──> Connection N
//! ```
//!
//! Iteration always goes through a point-in-time [`snapshot`], so a connection
//! that closes mid-broadcast cannot disturb the walk or be visited twice. It
//! may or may not receive that particular broadcast.
//!
//! [`snapshot`]: ConnectionRegistry::snapshot

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use lockfree::map::Map as LockfreeMap;
use parking_lot::Mutex;

use crate::connection::{Connection, ConnectionId};

/// First id handed out, and where allocation restarts after wrapping.
pub const FIRST_CONNECTION_ID: u32 = 1;
/// Largest id handed out before wrapping back to [`FIRST_CONNECTION_ID`].
pub const MAX_CONNECTION_ID: u32 = i32::MAX as u32;

pub struct ConnectionRegistry {
    connections: LockfreeMap<u32, Arc<Connection>>,
    live: AtomicUsize,
    next_id: Mutex<u32>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::starting_at(FIRST_CONNECTION_ID)
    }

    fn starting_at(first: u32) -> Self {
        Self {
            connections: LockfreeMap::new(),
            live: AtomicUsize::new(0),
            next_id: Mutex::new(first),
        }
    }

    /// Hands out the next id, wrapping from [`MAX_CONNECTION_ID`] to
    /// [`FIRST_CONNECTION_ID`] and skipping ids that are still live.
    pub fn allocate_id(&self) -> ConnectionId {
        let mut next = self.next_id.lock();
        // at most len() ids are taken, so len() + 1 candidates always hit a free one
        let attempts = self.len() + 1;
        let mut candidate = *next;
        for _ in 0..attempts {
            candidate = *next;
            *next = if *next >= MAX_CONNECTION_ID {
                FIRST_CONNECTION_ID
            } else {
                *next + 1
            };
            if self.connections.get(&candidate).is_none() {
                break;
            }
        }
        ConnectionId(candidate)
    }

    pub fn add(&self, connection: Arc<Connection>) {
        if self
            .connections
            .insert(connection.id().as_u32(), connection)
            .is_none()
        {
            self.live.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Removes `connection`, but only if the entry under its id is this very
    /// connection. Returns whether anything was removed.
    pub fn remove(&self, connection: &Connection) -> bool {
        let removed = self
            .connections
            .remove_with(&connection.id().as_u32(), |(_, live)| {
                std::ptr::eq(Arc::as_ptr(live), connection)
            })
            .is_some();
        if removed {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .get(&id.as_u32())
            .map(|guard| Arc::clone(guard.val()))
    }

    /// Point-in-time copy of the live set, ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut snapshot: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|guard| Arc::clone(guard.val()))
            .collect();
        snapshot.sort_by_key(|connection| connection.id());
        snapshot
    }

    /// Visits every connection of a snapshot taken on entry.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for connection in self.snapshot() {
            f(&connection);
        }
    }

    /// Number of live connections, kept alongside the map so accepts stay O(1).
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
