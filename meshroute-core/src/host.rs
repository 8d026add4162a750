//! Collaborators the host supplies: transport, identifier store, version policy.
//! Also an in-memory identifier store that keeps each peer's announced backends.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::error::RouteError;
use crate::protocol::ProtocolVersion;
use crate::route::{self, BackendInfo};
use crate::wire::{BackendIdBlock, NodeAddress};

/// Host-assigned handle for one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
    #[error("send failed: {0}")]
    Send(String),
}

/// Delivery and addressing, owned by the host.
pub trait Transport: Send + Sync {
    /// Hand a complete frame (header + payload) to the connection.
    fn send(&self, conn: ConnectionId, frame: Vec<u8>) -> Result<(), TransportError>;
    /// This node's address the connection is bound to.
    fn local_addr(&self, conn: ConnectionId) -> Option<NodeAddress>;
    fn peer_addr(&self, conn: ConnectionId) -> Option<NodeAddress>;
    /// Tear the connection down after a failed request.
    fn reset(&self, conn: ConnectionId, err: &RouteError);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("backend id {backend_id} above limit {max}")]
    BackendOutOfRange { backend_id: u32, max: u32 },
    #[error("out of memory")]
    OutOfMemory,
    #[error("{0}")]
    Rejected(String),
}

/// Lower-level per-connection identifier descriptors.
pub trait IdentifierStore: Send + Sync {
    /// Install the ids of one backend announced over `conn`.
    fn update(&self, conn: ConnectionId, block: &BackendIdBlock) -> Result<(), StoreError>;
    /// Drop everything installed for `conn`.
    fn destroy(&self, conn: ConnectionId);
}

/// Decides whether a peer speaking `peer` may exchange routes with us.
pub trait VersionPolicy: Send + Sync {
    fn check(&self, ours: ProtocolVersion, peer: ProtocolVersion) -> Result<(), RouteError>;
}

/// Compatible when major and minor match.
#[derive(Debug, Clone, Copy, Default)]
pub struct SameMajorMinor;

impl VersionPolicy for SameMajorMinor {
    fn check(&self, ours: ProtocolVersion, peer: ProtocolVersion) -> Result<(), RouteError> {
        if ours.major() == peer.major() && ours.minor() == peer.minor() {
            Ok(())
        } else {
            Err(RouteError::IncompatibleVersion(format!(
                "peer {} vs local {}",
                peer, ours
            )))
        }
    }
}

/// In-memory identifier store: each connection's announced backends, indexed by backend id.
#[derive(Debug, Default)]
pub struct PeerRoutes {
    routes: Mutex<HashMap<ConnectionId, Vec<BackendInfo>>>,
    max_backend_id: Option<u32>,
}

impl PeerRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject blocks whose backend id is above `max`.
    pub fn with_max_backend_id(max: u32) -> Self {
        Self {
            routes: Mutex::default(),
            max_backend_id: Some(max),
        }
    }

    /// Backends currently installed for `conn`.
    pub fn routes(&self, conn: ConnectionId) -> Option<Vec<BackendInfo>> {
        self.lock().get(&conn).cloned()
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut out: Vec<_> = self.lock().keys().copied().collect();
        out.sort();
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Vec<BackendInfo>>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl IdentifierStore for PeerRoutes {
    fn update(&self, conn: ConnectionId, block: &BackendIdBlock) -> Result<(), StoreError> {
        if let Some(max) = self.max_backend_id {
            if block.backend_id > max {
                return Err(StoreError::BackendOutOfRange {
                    backend_id: block.backend_id,
                    max,
                });
            }
        }
        let mut routes = self.lock();
        let backends = routes.entry(conn).or_default();
        let slot =
            route::slot_mut(backends, block.backend_id).map_err(|_| StoreError::OutOfMemory)?;
        slot.activated = true;
        slot.group_id = block.group_id;
        slot.ids.clone_from(&block.ids);
        Ok(())
    }

    fn destroy(&self, conn: ConnectionId) {
        self.lock().remove(&conn);
    }
}
