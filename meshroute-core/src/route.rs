//! Route table: the node's backends, their groups and ids, plus per-connection peer
//! records. One mutex covers both so announcements always see a consistent table.

use std::collections::{BTreeSet, HashMap, TryReserveError};
use std::sync::{Mutex, MutexGuard};

use crate::error::RouteError;
use crate::host::ConnectionId;
use crate::identity::RawId;
use crate::protocol::ProtocolVersion;
use crate::wire::NodeAddress;

/// One local backend slot. Zero-valued until first enabled; never removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendInfo {
    pub activated: bool,
    pub group_id: u32,
    pub ids: Vec<RawId>,
}

/// Grow `backends` so `backend_id` is a valid index and return that slot.
pub(crate) fn slot_mut(
    backends: &mut Vec<BackendInfo>,
    backend_id: u32,
) -> Result<&mut BackendInfo, TryReserveError> {
    let idx = backend_id as usize;
    if idx >= backends.len() {
        backends.try_reserve(idx + 1 - backends.len())?;
        backends.resize_with(idx + 1, BackendInfo::default);
    }
    Ok(&mut backends[idx])
}

/// Join progress of one connection, seen from the accepting side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinState {
    #[default]
    Unjoined,
    Validating,
    Updating,
    Joined,
    Rejected,
}

/// What this node remembers about a peer connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerRecord {
    pub join_state: JoinState,
    /// The peer's address on the network this connection arrived through.
    pub addr: Option<NodeAddress>,
    /// Every address the peer announced, in its order.
    pub addrs: Vec<NodeAddress>,
    pub version: Option<ProtocolVersion>,
}

/// State behind the node lock.
#[derive(Debug, Default)]
pub struct RouteState {
    backends: Vec<BackendInfo>,
    peers: HashMap<ConnectionId, PeerRecord>,
    /// Connections whose ids are currently routed to.
    node_list: BTreeSet<ConnectionId>,
}

impl RouteState {
    pub fn backends(&self) -> &[BackendInfo] {
        &self.backends
    }

    pub(crate) fn enable(
        &mut self,
        backend_id: u32,
        group_id: u32,
        ids: &[RawId],
    ) -> Result<(), RouteError> {
        let backend =
            slot_mut(&mut self.backends, backend_id).map_err(|_| RouteError::OutOfMemory)?;
        backend.activated = true;
        backend.group_id = group_id;
        backend.ids.clear();
        backend.ids.extend_from_slice(ids);
        Ok(())
    }

    pub(crate) fn disable(&mut self, backend_id: u32) {
        if let Some(backend) = self.backends.get_mut(backend_id as usize) {
            backend.activated = false;
        }
    }

    pub fn peer(&self, conn: ConnectionId) -> Option<&PeerRecord> {
        self.peers.get(&conn)
    }

    pub(crate) fn peer_mut(&mut self, conn: ConnectionId) -> &mut PeerRecord {
        self.peers.entry(conn).or_default()
    }

    pub(crate) fn remove_peer(&mut self, conn: ConnectionId) -> Option<PeerRecord> {
        self.node_list.remove(&conn);
        self.peers.remove(&conn)
    }

    /// Take the connection out of the routed list; its ids are about to be replaced.
    pub(crate) fn unlist(&mut self, conn: ConnectionId) {
        self.node_list.remove(&conn);
    }

    pub(crate) fn list(&mut self, conn: ConnectionId) {
        self.node_list.insert(conn);
    }

    pub fn joined_connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.node_list.iter().copied()
    }
}

/// Shared, lock-protected registry of local backends indexed by backend id.
#[derive(Debug, Default)]
pub struct RouteTable {
    state: Mutex<RouteState>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the node lock. Every critical section leaves the state whole before
    /// anything fallible runs, so a poisoned lock is still safe to reuse.
    pub fn lock(&self) -> MutexGuard<'_, RouteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Activate a backend, replacing its group and ids wholesale. Grows the table as needed.
    pub fn enable_backend(
        &self,
        backend_id: u32,
        group_id: u32,
        ids: &[RawId],
    ) -> Result<(), RouteError> {
        self.lock().enable(backend_id, group_id, ids)?;
        tracing::info!(backend_id, group_id, ids = ids.len(), "backend enabled");
        Ok(())
    }

    /// Deactivate a backend, keeping its ids. Unknown backends are ignored.
    pub fn disable_backend(&self, backend_id: u32) {
        self.lock().disable(backend_id);
        tracing::info!(backend_id, "backend disabled");
    }

    /// Consistent copy of every backend slot, in backend id order.
    pub fn snapshot(&self) -> Vec<BackendInfo> {
        self.lock().backends.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn backend(&self, backend_id: u32) -> Option<BackendInfo> {
        self.lock().backends.get(backend_id as usize).cloned()
    }
}
