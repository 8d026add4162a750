//! Node-level handlers: join (both sides), reverse lookup, route announcements.
//! Host-driven: the host decodes the command header, hands over the payload,
//! and implements `Transport` / `IdentifierStore` for delivery and id installation.

use std::sync::Arc;

use crate::error::{self, RouteError};
use crate::host::{ConnectionId, IdentifierStore, SameMajorMinor, Transport, VersionPolicy};
use crate::identity::{CommandId, RawId};
use crate::protocol::{
    self, Command, CommandFlags, CommandHeader, ProtocolVersion, PROTOCOL_VERSION,
};
use crate::route::{BackendInfo, JoinState, PeerRecord, RouteTable};
use crate::validator;
use crate::wire::{
    self, NodeAddress, ADDRESS_CONTAINER_HEADER_SIZE, ADDRESS_RECORD_SIZE,
    ID_CONTAINER_HEADER_SIZE,
};

/// Who this node is on the wire.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub id: RawId,
    pub group_id: u32,
    /// Every address this node listens on. Peers must announce the same number.
    pub addresses: Vec<NodeAddress>,
    pub indexes_shard_count: u32,
    pub version: ProtocolVersion,
}

impl NodeIdentity {
    pub fn new(id: RawId, group_id: u32, addresses: Vec<NodeAddress>) -> Self {
        Self {
            id,
            group_id,
            addresses,
            indexes_shard_count: 0,
            version: PROTOCOL_VERSION,
        }
    }

    fn command_id(&self) -> CommandId {
        CommandId::new(self.id, self.group_id)
    }
}

/// One storage node's view of routing: its own backends and what peers told it.
pub struct Node {
    identity: NodeIdentity,
    routes: RouteTable,
    transport: Arc<dyn Transport>,
    store: Arc<dyn IdentifierStore>,
    policy: Box<dyn VersionPolicy>,
}

fn show(addr: Option<NodeAddress>) -> String {
    addr.map(|a| a.to_string())
        .unwrap_or_else(|| "<unknown>".to_string())
}

impl Node {
    pub fn new(
        identity: NodeIdentity,
        transport: Arc<dyn Transport>,
        store: Arc<dyn IdentifierStore>,
    ) -> Self {
        Self {
            identity,
            routes: RouteTable::new(),
            transport,
            store,
            policy: Box::new(SameMajorMinor),
        }
    }

    pub fn with_version_policy(mut self, policy: Box<dyn VersionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn peer(&self, conn: ConnectionId) -> Option<PeerRecord> {
        self.routes.lock().peer(conn).cloned()
    }

    /// Connections whose announced ids are currently installed.
    pub fn joined_connections(&self) -> Vec<ConnectionId> {
        self.routes.lock().joined_connections().collect()
    }

    pub fn enable_backend(
        &self,
        backend_id: u32,
        group_id: u32,
        ids: &[RawId],
    ) -> Result<(), RouteError> {
        error::boundary("enable backend", || {
            self.routes.enable_backend(backend_id, group_id, ids)
        })
    }

    pub fn disable_backend(&self, backend_id: u32) -> Result<(), RouteError> {
        error::boundary("disable backend", || {
            self.routes.disable_backend(backend_id);
            Ok(())
        })
    }

    pub fn snapshot(&self) -> Vec<BackendInfo> {
        self.routes.snapshot()
    }

    /// Route a received command to its handler.
    pub fn dispatch(
        &self,
        conn: ConnectionId,
        header: &CommandHeader,
        payload: &[u8],
    ) -> Result<(), RouteError> {
        match header.cmd {
            Command::ReverseLookup if header.is_reply() => {
                self.handle_route_reply(conn, header, payload)
            }
            Command::ReverseLookup => self.handle_reverse_lookup(conn, header),
            Command::Join if header.is_reply() => {
                // Ack for a join we sent; the peer resets the connection on failure.
                if header.status != 0 {
                    tracing::warn!(%conn, status = header.status, "peer rejected join");
                }
                Ok(())
            }
            Command::Join => self.handle_join(conn, header, payload),
            Command::Other(code) => {
                let err = RouteError::Unexpected(format!("unsupported command {}", code));
                self.finish(conn, header, header.id, Err(err), true)
            }
        }
    }

    /// Server side of a join: validate the peer's addresses and ids, install them,
    /// roll back on partial failure. On error the request is acked and the connection reset.
    pub fn handle_join(
        &self,
        conn: ConnectionId,
        header: &CommandHeader,
        payload: &[u8],
    ) -> Result<(), RouteError> {
        let result = error::boundary("join", || self.accept_routes(conn, header, payload));
        self.finish(conn, header, header.id, result, true)
    }

    /// Requesting side of a reverse lookup: the reply carries the peer's full table.
    pub fn handle_route_reply(
        &self,
        conn: ConnectionId,
        header: &CommandHeader,
        payload: &[u8],
    ) -> Result<(), RouteError> {
        let result = error::boundary("route reply", || {
            if header.status != 0 {
                return Err(RouteError::Unexpected(format!(
                    "peer refused route request: status {}",
                    header.status
                )));
            }
            self.accept_routes(conn, header, payload)
        });
        self.finish(conn, header, header.id, result, false)
    }

    fn accept_routes(
        &self,
        conn: ConnectionId,
        header: &CommandHeader,
        payload: &[u8],
    ) -> Result<(), RouteError> {
        {
            let mut st = self.routes.lock();
            let peer = st.peer_mut(conn);
            // A joined peer keeps serving its old ids until the new set validates.
            if peer.join_state != JoinState::Joined {
                peer.join_state = JoinState::Validating;
            }
        }
        let local = self.transport.local_addr(conn);
        let client = show(self.transport.peer_addr(conn));
        let server = show(local);

        if header.size != payload.len() as u64 {
            return Err(RouteError::Malformed(format!(
                "{} -> {}: header declares {} bytes, got {}",
                client,
                server,
                header.size,
                payload.len()
            )));
        }
        if payload.len() < ADDRESS_CONTAINER_HEADER_SIZE {
            return Err(RouteError::Malformed(format!(
                "{} -> {}: size {} below address container header {}",
                client,
                server,
                payload.len(),
                ADDRESS_CONTAINER_HEADER_SIZE
            )));
        }

        let (cnt, rest) = wire::decode_address_container(payload)?;
        let addr_num = cnt.addrs.len();
        let needed = addr_num
            .checked_mul(ADDRESS_RECORD_SIZE)
            .and_then(|n| n.checked_add(ADDRESS_CONTAINER_HEADER_SIZE))
            .and_then(|n| n.checked_add(ID_CONTAINER_HEADER_SIZE))
            .ok_or_else(|| RouteError::Malformed("address count overflows".to_string()))?;
        if payload.len() < needed {
            return Err(RouteError::Malformed(format!(
                "{} -> {}: size {} below addresses and id container {}, addr-num {}",
                client,
                server,
                payload.len(),
                needed,
                addr_num
            )));
        }

        let local_num = self.identity.addresses.len();
        let idx = local.and_then(|l| self.identity.addresses.iter().position(|a| *a == l));
        let idx = match idx {
            Some(i) if i < addr_num && addr_num == local_num => i,
            _ => {
                return Err(RouteError::AddressMismatch(format!(
                    "{} -> {}: address idx {:?}, received addr-num {}, local addr-num {}",
                    client, server, idx, addr_num, local_num
                )))
            }
        };

        let blocks = validator::validate_id_container(rest)?;

        tracing::debug!(
            %conn, %client, %server, idx, addr_num, backends = blocks.len(),
            "join request validated"
        );
        for (i, block) in blocks.iter().enumerate() {
            for (j, id) in block.ids.iter().enumerate() {
                tracing::trace!(
                    %conn,
                    backend = i,
                    backends = blocks.len(),
                    id_index = j,
                    ids = block.ids.len(),
                    backend_id = block.backend_id,
                    group_id = block.group_id,
                    id = %id,
                    "received id"
                );
            }
        }

        let mut st = self.routes.lock();
        st.unlist(conn);
        let peer = st.peer_mut(conn);
        peer.join_state = JoinState::Updating;
        peer.addr = Some(cnt.addrs[idx]);
        peer.addrs = cnt.addrs;

        for block in &blocks {
            if let Err(e) = self.store.update(conn, block) {
                self.store.destroy(conn);
                st.peer_mut(conn).join_state = JoinState::Rejected;
                return Err(RouteError::backend_update(block.backend_id, e));
            }
        }
        st.list(conn);
        st.peer_mut(conn).join_state = JoinState::Joined;
        drop(st);

        tracing::info!(
            %conn, %client, %server, idx, addr_num, local_num, backends = blocks.len(),
            "join request completed"
        );
        Ok(())
    }

    /// Answer a reverse lookup: swap version info and send our whole table back.
    /// Any failure is acked with our version header and the connection is reset.
    pub fn handle_reverse_lookup(
        &self,
        conn: ConnectionId,
        header: &CommandHeader,
    ) -> Result<(), RouteError> {
        let peer_version = ProtocolVersion::decode_from(&header.id);
        let peer_shards = protocol::decode_shard_count(&header.id);

        let mut reply_id = header.id;
        self.identity.version.encode_into(&mut reply_id);
        protocol::encode_shard_count(&mut reply_id, self.identity.indexes_shard_count);

        let result = error::boundary("reverse lookup", || {
            let mut st = self.routes.lock();
            st.peer_mut(conn).version = Some(peer_version);
            self.policy.check(self.identity.version, peer_version)?;

            tracing::info!(
                %conn,
                peer = %show(self.transport.peer_addr(conn)),
                client_shards = peer_shards,
                server_shards = self.identity.indexes_shard_count,
                "reverse lookup"
            );

            let mut id = reply_id;
            id.group_id = self.identity.group_id;
            let mut template = CommandHeader::new(id, Command::ReverseLookup);
            template.trans = header.trans;
            template.flags = CommandFlags::NOLOCK | CommandFlags::REPLY;
            let frame =
                wire::encode_announcement(&template, &self.identity.addresses, st.backends())?;
            // Sent under the lock so announcements leave in mutation order.
            self.transport.send(conn, frame)?;
            Ok(())
        });
        self.finish(conn, header, reply_id, result, true)
    }

    /// Client side of a join: announce our addresses and every backend to `conn`.
    pub fn initiate_join(&self, conn: ConnectionId) -> Result<(), RouteError> {
        error::boundary("join request", || {
            let mut st = self.routes.lock();
            // Direct send: the group id is informational here.
            let mut template = CommandHeader::new(self.identity.command_id(), Command::Join);
            template.flags = CommandFlags::NOLOCK | CommandFlags::DIRECT;
            let frame =
                wire::encode_announcement(&template, &self.identity.addresses, st.backends())?;
            if let Err(e) = self.transport.send(conn, frame) {
                tracing::error!(
                    %conn,
                    peer = %show(self.transport.peer_addr(conn)),
                    error = %e,
                    "failed to send join request"
                );
                return Err(e.into());
            }
            st.peer_mut(conn).join_state = JoinState::Joined;
            tracing::info!(
                %conn,
                id = %self.identity.command_id(),
                group = self.identity.group_id,
                "successfully joined network"
            );
            Ok(())
        })
    }

    /// Header for a reverse lookup request carrying our version and shard count.
    pub fn reverse_lookup_request(&self, trans: u64) -> CommandHeader {
        let mut id = self.identity.command_id();
        self.identity.version.encode_into(&mut id);
        protocol::encode_shard_count(&mut id, self.identity.indexes_shard_count);
        let mut header = CommandHeader::new(id, Command::ReverseLookup);
        header.trans = trans;
        header.flags = CommandFlags::DIRECT | CommandFlags::NOLOCK;
        header
    }

    /// Forget a closed connection and everything it installed.
    pub fn connection_closed(&self, conn: ConnectionId) {
        let mut st = self.routes.lock();
        if st.remove_peer(conn).is_some() {
            tracing::debug!(%conn, "peer connection closed");
        }
        self.store.destroy(conn);
    }

    fn finish(
        &self,
        conn: ConnectionId,
        request: &CommandHeader,
        ack_id: CommandId,
        result: Result<(), RouteError>,
        ack: bool,
    ) -> Result<(), RouteError> {
        match &result {
            Ok(()) => {
                if ack && request.flags.contains(CommandFlags::NEED_ACK) {
                    self.send_ack(conn, request, ack_id, 0, CommandFlags::empty());
                }
            }
            Err(e) => {
                tracing::error!(
                    %conn,
                    cmd = ?request.cmd,
                    peer = %show(self.transport.peer_addr(conn)),
                    error = %e,
                    "request failed, resetting connection"
                );
                {
                    let mut st = self.routes.lock();
                    let peer = st.peer_mut(conn);
                    if peer.join_state != JoinState::Joined {
                        peer.join_state = JoinState::Rejected;
                    }
                }
                if ack {
                    self.send_ack(conn, request, ack_id, e.errno(), CommandFlags::NEED_ACK);
                }
                self.transport.reset(conn, e);
            }
        }
        result
    }

    fn send_ack(
        &self,
        conn: ConnectionId,
        request: &CommandHeader,
        id: CommandId,
        status: i32,
        extra: CommandFlags,
    ) {
        let mut ack = CommandHeader::new(id, request.cmd);
        ack.trans = request.trans;
        ack.status = status;
        ack.flags = CommandFlags::REPLY | extra;
        if let Err(e) = self.transport.send(conn, ack.encode().to_vec()) {
            tracing::warn!(%conn, error = %e, "failed to send ack");
        }
    }
}
