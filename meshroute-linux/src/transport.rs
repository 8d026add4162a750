//! TCP transport: listeners for inbound peers, outbound lookup + join to configured
//! remotes, and the `Transport` the node answers through. Frames are a command header
//! followed by `size` payload bytes.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use meshroute_core::{
    Command, CommandHeader, ConnectionId, Node, NodeAddress, RouteError, Transport,
    TransportError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Queued for a connection's writer task. `Close` ends it after earlier frames are flushed.
enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

struct PeerLink {
    tx: mpsc::UnboundedSender<Outgoing>,
    local: NodeAddress,
    remote: NodeAddress,
}

/// Live connections keyed by the id handed to the node.
#[derive(Default)]
pub struct TcpTransport {
    links: Mutex<HashMap<ConnectionId, PeerLink>>,
    next_conn: AtomicU64,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, PeerLink>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(
        &self,
        local: NodeAddress,
        remote: NodeAddress,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<Outgoing>) {
        let conn = ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(conn, PeerLink { tx, local, remote });
        (conn, rx)
    }

    fn unregister(&self, conn: ConnectionId) {
        self.lock().remove(&conn);
    }
}

impl Transport for TcpTransport {
    fn send(&self, conn: ConnectionId, frame: Vec<u8>) -> Result<(), TransportError> {
        let links = self.lock();
        let link = links.get(&conn).ok_or(TransportError::Closed(conn))?;
        link.tx
            .send(Outgoing::Frame(frame))
            .map_err(|_| TransportError::Closed(conn))
    }

    fn local_addr(&self, conn: ConnectionId) -> Option<NodeAddress> {
        self.lock().get(&conn).map(|l| l.local)
    }

    fn peer_addr(&self, conn: ConnectionId) -> Option<NodeAddress> {
        self.lock().get(&conn).map(|l| l.remote)
    }

    fn reset(&self, conn: ConnectionId, err: &RouteError) {
        if let Some(link) = self.lock().remove(&conn) {
            tracing::debug!(%conn, errno = err.errno(), "resetting connection");
            let _ = link.tx.send(Outgoing::Close);
        }
    }
}

/// Everything a connection task needs.
#[derive(Clone)]
pub struct Context {
    pub node: Arc<Node>,
    pub transport: Arc<TcpTransport>,
    pub max_payload: u64,
    next_trans: Arc<AtomicU64>,
}

impl Context {
    pub fn new(node: Arc<Node>, transport: Arc<TcpTransport>, max_payload: u64) -> Self {
        Self {
            node,
            transport,
            max_payload,
            next_trans: Arc::new(AtomicU64::new(1)),
        }
    }

    fn next_trans(&self) -> u64 {
        self.next_trans.fetch_add(1, Ordering::Relaxed)
    }

    /// Our announced address for a socket bound to `sock`. Outbound sockets have an
    /// ephemeral port, so the IP decides when there is no exact match.
    fn resolve_local(&self, sock: SocketAddr) -> Option<NodeAddress> {
        let addresses = &self.node.identity().addresses;
        let exact = NodeAddress::from(sock);
        if addresses.contains(&exact) {
            return Some(exact);
        }
        if let Some(a) = addresses.iter().copied().find(|a| a.ip() == Some(sock.ip())) {
            return Some(a);
        }
        let family = exact.family();
        let fallback = addresses.iter().copied().find(|a| a.family() == family);
        if let Some(a) = fallback {
            tracing::warn!(%sock, local = %a, "socket address not announced, using first of its family");
        }
        fallback
    }

    fn has_family_of(&self, remote: SocketAddr) -> bool {
        let family = NodeAddress::from(remote).family();
        self.node
            .identity()
            .addresses
            .iter()
            .any(|a| a.family() == family)
    }
}

/// Bind `addr` and accept peers on it until the listener fails.
pub async fn serve(ctx: Context, addr: SocketAddr) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    accept_loop(ctx, listener).await
}

pub async fn accept_loop(ctx: Context, listener: TcpListener) -> io::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            run_connection(ctx, stream, false).await;
        });
    }
}

/// Keep a connection to `remote` up: look up its table, join, reconnect after `retry`.
pub async fn maintain_remote(ctx: Context, remote: SocketAddr, retry: Duration) {
    if !ctx.has_family_of(remote) {
        tracing::error!(%remote, "no local address of the same family, not joining");
        return;
    }
    loop {
        match TcpStream::connect(remote).await {
            Ok(stream) => run_connection(ctx.clone(), stream, true).await,
            Err(e) => tracing::warn!(%remote, error = %e, "connect failed"),
        }
        tokio::time::sleep(retry).await;
    }
}

async fn run_connection(ctx: Context, stream: TcpStream, outbound: bool) {
    let (remote, sock) = match (stream.peer_addr(), stream.local_addr()) {
        (Ok(r), Ok(l)) => (r, l),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "connection lost before setup");
            return;
        }
    };
    let Some(local) = ctx.resolve_local(sock) else {
        tracing::warn!(%remote, %sock, "no announced address for this socket, dropping");
        return;
    };
    let _ = stream.set_nodelay(true);
    let (conn, mut rx) = ctx.transport.register(local, NodeAddress::from(remote));
    tracing::info!(%conn, %remote, %local, outbound, "connection established");

    let (mut reader, mut writer) = stream.into_split();
    let writer_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outgoing::Frame(bytes) => {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close => break,
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut pending_lookup = None;
    if outbound {
        let trans = ctx.next_trans();
        let request = ctx.node.reverse_lookup_request(trans);
        match ctx.transport.send(conn, request.encode().to_vec()) {
            Ok(()) => pending_lookup = Some(trans),
            Err(e) => tracing::warn!(%conn, error = %e, "failed to send reverse lookup"),
        }
    }

    match read_loop(&ctx, conn, &mut reader, pending_lookup).await {
        Ok(()) => tracing::info!(%conn, %remote, "connection closed"),
        Err(e) => tracing::warn!(%conn, %remote, error = %e, "connection dropped"),
    }
    ctx.node.connection_closed(conn);
    ctx.transport.unregister(conn);
    let _ = writer_task.await;
}

/// Read frames and hand them to the node until EOF or a failed command.
/// On an outbound connection the reply to our lookup triggers the join.
async fn read_loop(
    ctx: &Context,
    conn: ConnectionId,
    reader: &mut OwnedReadHalf,
    mut pending_lookup: Option<u64>,
) -> anyhow::Result<()> {
    loop {
        let mut head = [0u8; CommandHeader::SIZE];
        match reader.read_exact(&mut head).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let header = CommandHeader::decode(&head)?;
        if header.size > ctx.max_payload {
            anyhow::bail!(
                "payload of {} bytes exceeds limit {}",
                header.size,
                ctx.max_payload
            );
        }
        let mut payload = vec![0u8; header.size as usize];
        reader.read_exact(&mut payload).await?;
        tracing::trace!(
            %conn, cmd = ?header.cmd, size = header.size, trans = header.trans,
            "command received"
        );

        ctx.node.dispatch(conn, &header, &payload)?;

        let lookup_answered = header.cmd == Command::ReverseLookup
            && header.is_reply()
            && pending_lookup == Some(header.trans);
        if lookup_answered {
            pending_lookup = None;
            ctx.node.initiate_join(conn)?;
        }
    }
}
