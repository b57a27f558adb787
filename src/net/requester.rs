use crate::{
    Result, TileMeshError,
    meta::{LayerMeta, LayerTms, TileMeta, TmsMeta},
};

use super::{
    message::Message,
    transport::{self, MAX_DATAGRAM, PeerStream},
};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};

/// Default size of one `GetTileChunk` request.
pub const PULL_CHUNK_SIZE: u32 = 4096;

/// Most bytes reserved up front for a tile of declared size.
const PREALLOCATE_LIMIT: u64 = 64 * 1024;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_ATTEMPTS: usize = 3;

/// Request/reply client for one remote peer over a UDP socket.
#[derive(Debug, Clone)]
pub struct PeerClient {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    timeout: Duration,
    attempts: usize,
    chunk_size: u32,
}

impl PeerClient {
    pub fn new(socket: Arc<UdpSocket>, addr: SocketAddr) -> Self {
        Self {
            socket,
            addr,
            timeout: DEFAULT_TIMEOUT,
            attempts: DEFAULT_ATTEMPTS,
            chunk_size: PULL_CHUNK_SIZE,
        }
    }

    /// Binds a fresh ephemeral socket for talking to `addr`.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        Ok(Self::new(Arc::new(socket), addr))
    }

    pub fn with_timeout(mut self, timeout: Duration, attempts: usize) -> Self {
        self.timeout = timeout;
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    pub async fn ping(&self) -> Result<()> {
        self.exchange(Message::Ping, "Pong", |m| match m {
            Message::Pong => Ok(()),
            m => Err(m),
        })
        .await
    }

    /// Sends our peer id and returns the remote's.
    pub async fn exchange_peer_ids(&self, local: &str) -> Result<String> {
        self.exchange(Message::PeerId(local.to_string()), "PeerId", |m| match m {
            Message::PeerId(id) => Ok(id),
            m => Err(m),
        })
        .await
    }

    pub async fn request_layers(&self) -> Result<Vec<LayerTms>> {
        self.exchange(Message::ListLayers, "ListLayersReply", |m| match m {
            Message::ListLayersReply(list) => Ok(list),
            m => Err(m),
        })
        .await
    }

    pub async fn request_layer_meta(&self, id: &str) -> Result<Option<LayerMeta>> {
        let msg = Message::DescribeLayer(id.to_string());
        self.exchange(msg, "DescribeLayerReply", |m| match m {
            Message::DescribeLayerReply(meta) => Ok(meta),
            m => Err(m),
        })
        .await
    }

    pub async fn request_tms_meta(&self, id: &str) -> Result<Option<TmsMeta>> {
        let msg = Message::DescribeTileMatrixSet(id.to_string());
        self.exchange(msg, "DescribeTileMatrixSetReply", |m| match m {
            Message::DescribeTileMatrixSetReply(meta) => Ok(meta),
            m => Err(m),
        })
        .await
    }

    pub async fn request_tile_size(&self, meta: &TileMeta) -> Result<u64> {
        self.exchange(Message::TileSize(meta.clone()), "TileSizeReply", |m| match m {
            Message::TileSizeReply(size) => Ok(size),
            m => Err(m),
        })
        .await
    }

    pub async fn have(&self, meta: &TileMeta) -> Result<bool> {
        self.exchange(Message::Have(meta.clone()), "Reply", |m| match m {
            Message::Reply(has) => Ok(has),
            m => Err(m),
        })
        .await
    }

    /// Downloads a whole tile with sequential chunk requests.
    pub async fn request_tile(&self, meta: &TileMeta) -> Result<Vec<u8>> {
        let size = self.request_tile_size(meta).await?;
        if size == 0 {
            return Err(TileMeshError::Unavailable(format!("{meta} not found on {}", self.addr)));
        }

        // The declared size comes from the remote, so it only bounds the loop.
        let mut tile = Vec::with_capacity(size.min(PREALLOCATE_LIMIT) as usize);
        while (tile.len() as u64) < size {
            let offset = tile.len() as u64;
            let msg = Message::GetTileChunk {
                meta: meta.clone(),
                offset,
                limit: self.chunk_size,
            };
            let chunk = self
                .exchange(msg, "TileChunkReply", |m| match m {
                    Message::TileChunkReply(bytes) => Ok(bytes),
                    m => Err(m),
                })
                .await?;

            if chunk.is_empty() {
                return Err(TileMeshError::ProtocolViolation(format!(
                    "Empty chunk at offset {offset} of {size} for {meta}"
                )));
            }

            let take = chunk.len().min((size - offset) as usize);
            tile.extend_from_slice(&chunk[..take]);
            trace!(peer = %self.addr, tile = %meta, "Received {}/{} bytes", tile.len(), size);
        }

        debug!(peer = %self.addr, tile = %meta, size, "Tile received");
        Ok(tile)
    }

    /// Tells the remote we are done. No reply is expected.
    pub async fn close(&self) -> Result<()> {
        transport::send_to(&self.socket, self.addr, &Message::Close).await
    }

    /// Sends `msg` and waits for the reply `extract` accepts, resending on
    /// timeout. `extract` hands back messages it does not accept.
    async fn exchange<T, F>(&self, msg: Message, expected: &str, extract: F) -> Result<T>
    where
        F: Fn(Message) -> std::result::Result<T, Message>,
    {
        for attempt in 1..=self.attempts {
            transport::send_to(&self.socket, self.addr, &msg).await?;

            let deadline = Instant::now() + self.timeout;
            loop {
                let received = match timeout_at(deadline, self.recv_reply()).await {
                    Ok(r) => r?,
                    Err(_) => {
                        debug!(
                            peer = %self.addr,
                            attempt,
                            "No reply to {} within {:?}",
                            msg.name(),
                            self.timeout
                        );
                        break;
                    }
                };

                let reply = match received {
                    Some(reply) => reply,
                    None => continue,
                };

                match extract(reply) {
                    Ok(value) => {
                        if attempt > 1 {
                            // The earlier copies of `msg` may still be answered.
                            self.resync().await?;
                        }
                        return Ok(value);
                    }
                    Err(Message::Reply(false)) => {
                        return Err(TileMeshError::Unavailable(format!(
                            "{} refused {}",
                            self.addr,
                            msg.name()
                        )));
                    }
                    Err(Message::Pong) => {
                        trace!(peer = %self.addr, "Ignoring stale Pong");
                    }
                    Err(Message::Ping) => {
                        transport::send_to(&self.socket, self.addr, &Message::Pong).await?;
                    }
                    Err(other) => {
                        return Err(TileMeshError::ProtocolViolation(format!(
                            "Expected {expected} from {}, got {}",
                            self.addr,
                            other.name()
                        )));
                    }
                }
            }
        }

        Err(TileMeshError::Unreachable(format!(
            "{} did not answer {} after {} attempts",
            self.addr,
            msg.name(),
            self.attempts
        )))
    }

    /// Discards replies to resent requests. The remote answers in order, so
    /// everything it sent before the Pong to our Ping is stale.
    async fn resync(&self) -> Result<()> {
        for attempt in 1..=self.attempts {
            transport::send_to(&self.socket, self.addr, &Message::Ping).await?;

            let deadline = Instant::now() + self.timeout;
            loop {
                let received = match timeout_at(deadline, self.recv_reply()).await {
                    Ok(r) => r?,
                    Err(_) => {
                        debug!(peer = %self.addr, attempt, "No Pong while discarding stale replies");
                        break;
                    }
                };

                match received {
                    Some(Message::Pong) => return Ok(()),
                    Some(Message::Ping) => {
                        transport::send_to(&self.socket, self.addr, &Message::Pong).await?;
                    }
                    Some(stale) => trace!(peer = %self.addr, "Discarding stale {}", stale.name()),
                    None => {}
                }
            }
        }

        Err(TileMeshError::Unreachable(format!(
            "{} stopped answering after a resent request",
            self.addr
        )))
    }

    /// Next datagram from the remote peer. Datagrams from other addresses
    /// yield `None`.
    async fn recv_reply(&self) -> Result<Option<Message>> {
        let (_, buf, from) = transport::recv_from(&self.socket, MAX_DATAGRAM)
            .await
            .map_err(|e| match e {
                TileMeshError::ConnectionClosed => {
                    TileMeshError::Unreachable(format!("{} closed the connection", self.addr))
                }
                TileMeshError::IoError(e) => TileMeshError::Unreachable(format!("{}: {e}", self.addr)),
                e => e,
            })?;

        if from != self.addr {
            trace!(peer = %from, "Ignoring datagram from unexpected address");
            return Ok(None);
        }

        Message::decode(&buf).map(Some)
    }
}

/// How long a stream pull waits for each message.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Pulls a tile over a stream with the Want/StartData/Data exchange.
/// `on_start` receives the declared size, `on_chunk` every pushed chunk.
/// Returns the number of bytes received.
pub async fn pull_whole_tile<S, C>(
    stream: &mut PeerStream,
    meta: &TileMeta,
    mut on_start: S,
    mut on_chunk: C,
) -> Result<u64>
where
    S: FnMut(u64),
    C: FnMut(&[u8]) -> Result<()>,
{
    let peer = stream.peer();
    stream.send(&Message::Want(meta.clone())).await?;

    let size = match receive(stream).await? {
        Message::StartData(size) => size,
        Message::Reply(false) => {
            return Err(TileMeshError::Unavailable(format!("{meta} not found on {peer}")));
        }
        other => {
            return Err(TileMeshError::ProtocolViolation(format!(
                "Expected StartData from {peer}, got {}",
                other.name()
            )));
        }
    };
    on_start(size);

    let mut received = 0u64;
    while received < size {
        stream.send(&Message::Reply(true)).await?;
        match receive(stream).await? {
            Message::Data(bytes) if !bytes.is_empty() => {
                received += bytes.len() as u64;
                on_chunk(&bytes)?;
            }
            other => {
                return Err(TileMeshError::ProtocolViolation(format!(
                    "Expected Data from {peer} at {received}/{size}, got {}",
                    other.name()
                )));
            }
        }
    }

    stream.send(&Message::Reply(true)).await?;
    stream.send(&Message::Close).await?;
    debug!(peer = %peer, tile = %meta, size, "Tile pulled");
    Ok(received)
}

/// Pulls a tile over a stream and collects it in memory.
pub async fn pull_tile(stream: &mut PeerStream, meta: &TileMeta) -> Result<Vec<u8>> {
    let mut tile = Vec::new();
    pull_whole_tile(
        stream,
        meta,
        |_| {},
        |chunk| {
            tile.extend_from_slice(chunk);
            Ok(())
        },
    )
    .await?;
    Ok(tile)
}

async fn receive(stream: &mut PeerStream) -> Result<Message> {
    let peer = stream.peer();
    match tokio::time::timeout(STREAM_TIMEOUT, stream.receive()).await {
        Ok(Err(TileMeshError::ConnectionClosed)) => {
            Err(TileMeshError::Unreachable(format!("{peer} closed the connection")))
        }
        Ok(r) => r,
        Err(_) => Err(TileMeshError::Unreachable(format!(
            "{peer} did not answer within {STREAM_TIMEOUT:?}"
        ))),
    }
}
