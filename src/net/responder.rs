use crate::{
    Result, TileMeshError,
    meta::TileMeta,
    store::TileStore,
};

use super::{
    message::Message,
    peers::ConnectedPeers,
    transport::{self, MAX_DATAGRAM, PeerStream},
};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Size of each `Data` frame pushed during a `Want` transfer.
pub const PUSH_CHUNK_SIZE: u64 = 1024;

/// Largest `GetTileChunk` limit honoured, so that a reply fits one datagram.
pub const MAX_CHUNK_LIMIT: u32 = 7 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    Idle,
    Transferring,
    LastChunkSent,
    Closed,
}

/// What the driver should do after a message was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Reply(Message),
    Silent,
    Close,
}

/// Everything a responder needs from the hosting peer.
#[derive(Clone)]
pub struct ResponderContext {
    pub store: Arc<dyn TileStore>,
    pub peers: ConnectedPeers,
    pub peer_id: String,
}

impl ResponderContext {
    pub fn new(store: Arc<dyn TileStore>, peers: ConnectedPeers, peer_id: impl Into<String>) -> Self {
        Self {
            store,
            peers,
            peer_id: peer_id.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct Transfer {
    meta: TileMeta,
    total: u64,
    offset: u64,
}

/// Answers the requests of one remote peer. Holds only the tile being
/// pushed and how far the push got; everything else is read from the store
/// per request.
pub struct Responder {
    ctx: ResponderContext,
    remote: SocketAddr,
    state: ResponderState,
    transfer: Option<Transfer>,
}

impl Responder {
    pub fn new(ctx: ResponderContext, remote: SocketAddr) -> Self {
        Self {
            ctx,
            remote,
            state: ResponderState::Idle,
            transfer: None,
        }
    }

    pub fn state(&self) -> ResponderState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ResponderState::Closed
    }

    pub fn handle(&mut self, msg: Message) -> Result<Action> {
        if self.is_closed() {
            return Ok(Action::Close);
        }

        self.ctx.peers.touch(self.remote);
        debug!(peer = %self.remote, state = ?self.state, "Received {}", msg.name());

        let action = match msg {
            Message::Close => {
                debug!(peer = %self.remote, "Closing connection");
                self.close()
            }
            Message::Ping => Action::Reply(Message::Pong),
            Message::PeerId(id) => {
                info!(peer = %self.remote, "Peer ID: {id}");
                self.ctx.peers.register(self.remote, id);
                Action::Reply(Message::PeerId(self.ctx.peer_id.clone()))
            }
            Message::ListLayers => {
                Action::Reply(Message::ListLayersReply(self.ctx.store.list_layer_tms()?))
            }
            Message::DescribeLayer(id) => {
                let meta = self.lookup("layer", self.ctx.store.layer_meta(&id));
                Action::Reply(Message::DescribeLayerReply(meta))
            }
            Message::DescribeTileMatrixSet(id) => {
                let meta = self.lookup("tile matrix set", self.ctx.store.tms_meta(&id));
                Action::Reply(Message::DescribeTileMatrixSetReply(meta))
            }
            Message::TileSize(meta) => Action::Reply(Message::TileSizeReply(self.tile_size(&meta))),
            Message::GetTileChunk {
                meta,
                offset,
                limit,
            } => {
                let bytes = if self.tile_size(&meta) > 0 {
                    let limit = limit.min(MAX_CHUNK_LIMIT) as u64;
                    self.ctx.store.read_tile_range(&meta, offset, limit)?
                } else {
                    Vec::new()
                };
                Action::Reply(Message::TileChunkReply(bytes))
            }
            Message::Have(meta) => Action::Reply(Message::Reply(self.tile_size(&meta) > 0)),
            Message::Want(meta) => self.on_want(meta),
            Message::Reply(true) => self.on_ack()?,
            Message::Reply(false) => {
                debug!(peer = %self.remote, "Transfer refused by requester");
                self.close()
            }
            other => self.violation(&other),
        };

        Ok(action)
    }

    fn on_want(&mut self, meta: TileMeta) -> Action {
        let total = self.tile_size(&meta);
        if total == 0 {
            return Action::Reply(Message::Reply(false));
        }

        debug!(peer = %self.remote, tile = %meta, total, "Starting transfer");
        self.transfer = Some(Transfer {
            meta,
            total,
            offset: 0,
        });
        self.state = ResponderState::Transferring;
        Action::Reply(Message::StartData(total))
    }

    fn on_ack(&mut self) -> Result<Action> {
        match self.state {
            ResponderState::Transferring => {}
            ResponderState::LastChunkSent => {
                debug!(peer = %self.remote, "Transfer complete");
                self.transfer = None;
                self.state = ResponderState::Idle;
                return Ok(Action::Silent);
            }
            _ => return Ok(self.violation(&Message::Reply(true))),
        }

        let Some(transfer) = self.transfer.as_mut() else {
            return Err(TileMeshError::ProtocolViolation(
                "transferring without an active tile".to_string(),
            ));
        };

        let limit = PUSH_CHUNK_SIZE.min(transfer.total.saturating_sub(transfer.offset));
        let chunk = self
            .ctx
            .store
            .read_tile_range(&transfer.meta, transfer.offset, limit)?;
        transfer.offset += chunk.len() as u64;

        if (chunk.len() as u64) < PUSH_CHUNK_SIZE || transfer.offset >= transfer.total {
            self.state = ResponderState::LastChunkSent;
        }

        Ok(Action::Reply(Message::Data(chunk)))
    }

    fn violation(&mut self, msg: &Message) -> Action {
        warn!(
            peer = %self.remote,
            state = ?self.state,
            "Unexpected {}, closing connection",
            msg.name()
        );
        self.close()
    }

    fn close(&mut self) -> Action {
        self.transfer = None;
        self.state = ResponderState::Closed;
        Action::Close
    }

    fn tile_size(&self, meta: &TileMeta) -> u64 {
        self.lookup("tile", self.ctx.store.tile_size(meta))
            .unwrap_or(0)
    }

    fn lookup<T>(&self, what: &str, result: Result<Option<T>>) -> Option<T> {
        result.unwrap_or_else(|e| {
            warn!(peer = %self.remote, "Failed to look up {what}: {e}");
            None
        })
    }
}

/// Sessions quiet for longer than this are forgotten.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(120);

/// Consecutive receive failures after which the socket is given up.
const MAX_RECV_ERRORS: usize = 8;

/// How long a datagram responder keeps running.
#[derive(Debug, Clone, Copy)]
pub struct ServeOptions {
    /// Stop once the session of any remote closes. Used for sockets
    /// obtained by hole punching, which serve exactly one peer.
    pub until_closed: bool,
    /// Stop when nothing arrives for this long.
    pub idle_timeout: Option<Duration>,
    pub session_ttl: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            until_closed: false,
            idle_timeout: None,
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }
}

struct Session {
    responder: Responder,
    last_seen: Instant,
}

/// Answers datagrams arriving on `socket`, one responder per remote address.
/// A failure while talking to one remote only drops that remote's session.
pub async fn serve_datagrams(
    socket: Arc<UdpSocket>,
    ctx: ResponderContext,
    opts: ServeOptions,
    token: CancellationToken,
) -> Result<()> {
    let mut sessions: HashMap<SocketAddr, Session> = HashMap::new();
    let mut last_sweep = Instant::now();
    let mut recv_errors = 0;
    info!(addr = %socket.local_addr()?, "Serving peers over UDP");

    loop {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            r = recv_with_idle(&socket, opts.idle_timeout) => r,
        };

        let (buf, remote) = match received {
            Ok(Some((_, buf, remote))) => {
                recv_errors = 0;
                (buf, remote)
            }
            Ok(None) => {
                debug!("Idle timeout, stopping UDP responder");
                break;
            }
            Err(TileMeshError::ConnectionClosed) => continue,
            Err(e) => {
                recv_errors += 1;
                if recv_errors >= MAX_RECV_ERRORS {
                    return Err(e);
                }
                debug!("Receive failed: {e}");
                continue;
            }
        };

        if last_sweep.elapsed() >= opts.session_ttl {
            let before = sessions.len();
            sessions.retain(|_, s| s.last_seen.elapsed() < opts.session_ttl);
            if sessions.len() < before {
                debug!("Dropped {} idle sessions", before - sessions.len());
            }
            last_sweep = Instant::now();
        }

        let responder = match sessions.remove(&remote) {
            Some(session) => session.responder,
            None => Responder::new(ctx.clone(), remote),
        };

        let msg = match Message::decode(&buf) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = %remote, "Dropping undecodable datagram: {e}");
                if opts.until_closed {
                    break;
                }
                continue;
            }
        };

        let (responder, action) = match handle_blocking(responder, msg).await {
            Ok(handled) => handled,
            Err(e) => {
                warn!(peer = %remote, "Responder task failed: {e}");
                continue;
            }
        };

        match action {
            Ok(Action::Reply(reply)) => {
                if let Err(e) = transport::send_to(&socket, remote, &reply).await {
                    warn!(peer = %remote, "Failed to reply: {e}");
                    continue;
                }
            }
            Ok(Action::Silent) => {}
            Ok(Action::Close) => {
                if opts.until_closed {
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(peer = %remote, "Failed to handle request: {e}");
                continue;
            }
        }

        sessions.insert(
            remote,
            Session {
                responder,
                last_seen: Instant::now(),
            },
        );
    }

    info!("Stopped serving peers over UDP");
    Ok(())
}

/// Runs `handle` on the blocking pool, since stores may read from disk.
async fn handle_blocking(mut responder: Responder, msg: Message) -> Result<(Responder, Result<Action>)> {
    Ok(tokio::task::spawn_blocking(move || {
        let action = responder.handle(msg);
        (responder, action)
    })
    .await?)
}

async fn recv_with_idle(
    socket: &UdpSocket,
    idle: Option<Duration>,
) -> Result<Option<(usize, Vec<u8>, SocketAddr)>> {
    match idle {
        Some(idle) => match tokio::time::timeout(idle, transport::recv_from(socket, MAX_DATAGRAM)).await {
            Ok(r) => r.map(Some),
            Err(_) => Ok(None),
        },
        None => transport::recv_from(socket, MAX_DATAGRAM).await.map(Some),
    }
}

/// Answers one stream connection until the remote closes it.
pub async fn serve_stream(mut stream: PeerStream, ctx: ResponderContext) -> Result<()> {
    let remote = stream.peer();
    let mut responder = Responder::new(ctx, remote);

    loop {
        let msg = match stream.receive().await {
            Ok(msg) => msg,
            Err(TileMeshError::ConnectionClosed) => {
                debug!(peer = %remote, "Stream closed by peer");
                break;
            }
            Err(e) => {
                warn!(peer = %remote, "Dropping stream: {e}");
                break;
            }
        };

        let (next, action) = handle_blocking(responder, msg).await?;
        responder = next;
        match action? {
            Action::Reply(reply) => stream.send(&reply).await?,
            Action::Silent => {}
            Action::Close => break,
        }
    }

    stream.shutdown().await.ok();
    Ok(())
}

/// Accepts stream connections, one task per connection.
pub async fn listen_streams(
    listener: TcpListener,
    ctx: ResponderContext,
    token: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "Serving peers over TCP");

    loop {
        let (socket, remote) = tokio::select! {
            _ = token.cancelled() => break,
            r = listener.accept() => r?,
        };

        let stream = match PeerStream::new(socket) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %remote, "Failed to set up stream: {e}");
                continue;
            }
        };

        let ctx = ctx.clone();
        let token = token.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                r = serve_stream(stream, ctx) => {
                    if let Err(e) = r {
                        warn!(peer = %remote, "Stream responder failed: {e}");
                    }
                }
            }
        });
    }

    info!("Stopped serving peers over TCP");
    Ok(())
}
