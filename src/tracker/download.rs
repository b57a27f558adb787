use crate::{
    Result,
    meta::{LayerMeta, LayerTms, TileMeta, TmsMeta},
    net::{
        peer::PeerAddr,
        rendezvous::{self, PunchConfig},
        requester::{DEFAULT_ATTEMPTS, DEFAULT_TIMEOUT, PeerClient},
    },
    store::{self, TileStore},
};

use super::dto::AskReply;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Opens a request channel to a download candidate.
pub trait Connector: Send + Sync {
    fn connect(&self, candidate: &AskReply) -> impl Future<Output = Result<PeerClient>> + Send;
}

/// Reaches candidates through the tracker's rendezvous endpoint.
#[derive(Debug, Clone)]
pub struct RendezvousConnector {
    /// Fixed rendezvous endpoint. Without it, the candidate's advertised
    /// host and port are used.
    pub rendezvous: Option<String>,
    pub punch: PunchConfig,
    pub timeout: Duration,
    pub attempts: usize,
}

impl Connector for RendezvousConnector {
    async fn connect(&self, candidate: &AskReply) -> Result<PeerClient> {
        let endpoint = match &self.rendezvous {
            Some(addr) => addr.parse::<PeerAddr>()?,
            None => PeerAddr::new(candidate.host.clone(), candidate.port),
        };
        let rendezvous = endpoint.resolve().await?;
        let socket = rendezvous::connect_socket().await?;
        let punched = rendezvous::punch(&candidate.key, socket, rendezvous, &self.punch).await?;

        Ok(PeerClient::new(punched.socket, punched.peer).with_timeout(self.timeout, self.attempts))
    }
}

/// Talks to the candidate's advertised address without hole punching.
#[derive(Debug, Clone)]
pub struct DirectConnector {
    pub timeout: Duration,
    pub attempts: usize,
}

impl Default for DirectConnector {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            attempts: DEFAULT_ATTEMPTS,
        }
    }
}

impl Connector for DirectConnector {
    async fn connect(&self, candidate: &AskReply) -> Result<PeerClient> {
        let addr = PeerAddr::new(candidate.host.clone(), candidate.port)
            .resolve()
            .await?;
        Ok(PeerClient::connect(addr)
            .await?
            .with_timeout(self.timeout, self.attempts))
    }
}

/// Outcome of a download over all candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub candidates: usize,
    pub failed: usize,
    pub tiles_total: usize,
    pub tiles_done: usize,
}

impl DownloadReport {
    pub fn is_complete(&self) -> bool {
        self.tiles_done == self.tiles_total
    }
}

#[derive(Debug, Clone)]
struct Assignment {
    candidate: AskReply,
    tiles: Vec<TileMeta>,
    primary: bool,
}

struct Shared {
    store: Arc<dyn TileStore>,
    peer_id: String,
    tile_delay: Duration,
    done: AtomicUsize,
    total: usize,
    progress: Box<dyn Fn(usize, usize) + Send + Sync>,
}

/// Downloads the tiles offered by a set of candidates, one task per candidate.
pub struct Downloader<C> {
    store: Arc<dyn TileStore>,
    peer_id: String,
    connector: Arc<C>,
    tile_delay: Duration,
}

impl<C> Downloader<C>
where
    C: Connector + 'static,
{
    pub fn new(store: Arc<dyn TileStore>, peer_id: impl Into<String>, connector: C) -> Self {
        Self {
            store,
            peer_id: peer_id.into(),
            connector: Arc::new(connector),
            tile_delay: Duration::ZERO,
        }
    }

    pub fn with_tile_delay(mut self, delay: Duration) -> Self {
        self.tile_delay = delay;
        self
    }

    /// Runs every candidate's batch to completion. The first candidate is the
    /// primary and also provides the layer and tile matrix set descriptors.
    /// A candidate failing in a recoverable way only ends its own batch. Any
    /// other failure, such as a store error, stops the whole download.
    pub async fn run<F>(
        &self,
        layer_tms: &LayerTms,
        candidates: Vec<AskReply>,
        progress: F,
    ) -> Result<DownloadReport>
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        let plan = self.plan(layer_tms, candidates)?;
        let total = plan.iter().map(|a| a.tiles.len()).sum();
        let mut report = DownloadReport {
            candidates: plan.len(),
            tiles_total: total,
            ..DownloadReport::default()
        };

        if plan.is_empty() {
            info!(%layer_tms, "No peers offer this layer");
            progress(0, 0);
            return Ok(report);
        }

        info!(%layer_tms, candidates = plan.len(), tiles = total, "Starting download");
        let shared = Arc::new(Shared {
            store: self.store.clone(),
            peer_id: self.peer_id.clone(),
            tile_delay: self.tile_delay,
            done: AtomicUsize::new(0),
            total,
            progress: Box::new(progress),
        });

        let mut tasks = JoinSet::new();
        for assignment in plan {
            if assignment.tiles.is_empty() && !assignment.primary {
                continue;
            }

            let connector = self.connector.clone();
            let shared = shared.clone();
            let layer_tms = layer_tms.clone();
            tasks.spawn(async move {
                let key = assignment.candidate.key.clone();
                let result: Result<()> = async {
                    let client = connector.connect(&assignment.candidate).await?;
                    let fetched = fetch_batch(&client, &assignment, &layer_tms, &shared).await;
                    if fetched.is_err() {
                        client.close().await.ok();
                    }
                    fetched
                }
                .await;

                if let Err(e) = &result {
                    warn!(%key, "Download from peer failed: {e}");
                }
                result
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_recoverable() => report.failed += 1,
                Ok(Err(e)) => {
                    tasks.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    warn!("Download task aborted: {e}");
                    report.failed += 1;
                }
            }
        }

        report.tiles_done = shared.done.load(Ordering::SeqCst);
        info!(
            %layer_tms,
            done = report.tiles_done,
            total = report.tiles_total,
            failed = report.failed,
            "Download finished"
        );
        Ok(report)
    }

    /// Splits the offered tiles between candidates. A tile is assigned to
    /// the first candidate offering it, and tiles held locally are skipped.
    fn plan(&self, layer_tms: &LayerTms, candidates: Vec<AskReply>) -> Result<Vec<Assignment>> {
        let mut seen = HashSet::new();
        let mut plan = Vec::with_capacity(candidates.len());

        for (idx, candidate) in candidates.into_iter().enumerate() {
            let mut tiles = Vec::new();
            for meta in candidate.tile_metas(layer_tms) {
                if !seen.insert(meta.clone()) || self.store.has_tile(&meta)? {
                    continue;
                }
                tiles.push(meta);
            }

            plan.push(Assignment {
                candidate,
                tiles,
                primary: idx == 0,
            });
        }

        Ok(plan)
    }
}

async fn fetch_batch(
    client: &PeerClient,
    assignment: &Assignment,
    layer_tms: &LayerTms,
    shared: &Shared,
) -> Result<()> {
    let remote_id = client.exchange_peer_ids(&shared.peer_id).await?;
    debug!(peer = %client.addr(), "Connected to peer {remote_id}");

    let (layer_meta, tms_meta) = if assignment.primary {
        fetch_descriptors(client, layer_tms, shared).await?
    } else {
        (None, None)
    };

    for meta in &assignment.tiles {
        let bytes = client.request_tile(meta).await?;
        let tile = meta.clone();
        store::blocking(&shared.store, move |store| store.write_tile(&tile, &bytes)).await?;

        let done = shared.done.fetch_add(1, Ordering::SeqCst) + 1;
        (shared.progress)(done, shared.total);

        if !shared.tile_delay.is_zero() {
            tokio::time::sleep(shared.tile_delay).await;
        }
    }

    if let Some(meta) = layer_meta {
        let id = layer_tms.layer.clone();
        store::blocking(&shared.store, move |store| store.save_layer_meta(&id, &meta)).await?;
    }
    if let Some(meta) = tms_meta {
        let id = layer_tms.tile_matrix_set.clone();
        store::blocking(&shared.store, move |store| store.save_tms_meta(&id, &meta)).await?;
    }

    client.close().await?;
    Ok(())
}

async fn fetch_descriptors(
    client: &PeerClient,
    layer_tms: &LayerTms,
    shared: &Shared,
) -> Result<(Option<LayerMeta>, Option<TmsMeta>)> {
    let layer_meta = if shared.store.layer_meta(&layer_tms.layer)?.is_some() {
        None
    } else {
        let meta = client.request_layer_meta(&layer_tms.layer).await?;
        if meta.is_none() {
            warn!(peer = %client.addr(), "Primary peer has no descriptor for layer {}", layer_tms.layer);
        }
        meta
    };

    let tms_meta = if shared.store.tms_meta(&layer_tms.tile_matrix_set)?.is_some() {
        None
    } else {
        let meta = client.request_tms_meta(&layer_tms.tile_matrix_set).await?;
        if meta.is_none() {
            warn!(
                peer = %client.addr(),
                "Primary peer has no descriptor for tile matrix set {}",
                layer_tms.tile_matrix_set
            );
        }
        meta
    };

    Ok((layer_meta, tms_meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        TileMeshError,
        meta::TileFormat,
        net::{
            message::Message,
            peers::ConnectedPeers,
            responder::{ResponderContext, ServeOptions, serve_datagrams},
            transport,
        },
        store::{
            MemoryStore,
            fixtures::{layer_meta, tile, tile_bytes, tms_meta},
        },
        tracker::dto::AskReplyTile,
    };
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tokio::net::UdpSocket;
    use tokio_util::sync::CancellationToken;

    fn layer_tms() -> LayerTms {
        LayerTms::new("base", "WebMercator")
    }

    fn candidate(key: &str, addr: SocketAddr, cols_and_rows: &[(u32, u32)]) -> AskReply {
        AskReply {
            key: key.to_string(),
            host: addr.ip().to_string(),
            port: addr.port(),
            tiles: vec![AskReplyTile {
                tile_matrix: "1".to_string(),
                format: TileFormat::Png.mime().to_string(),
                tile_cols_and_rows: cols_and_rows.to_vec(),
            }],
        }
    }

    async fn spawn_peer(store: MemoryStore, token: &CancellationToken) -> SocketAddr {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let ctx = ResponderContext::new(Arc::new(store), ConnectedPeers::new(), "remote");
        tokio::spawn(serve_datagrams(socket, ctx, ServeOptions::default(), token.clone()));
        addr
    }

    fn connector() -> DirectConnector {
        DirectConnector {
            timeout: Duration::from_millis(200),
            attempts: 2,
        }
    }

    fn matrix_tile(col: u32, row: u32) -> TileMeta {
        tile("base", "WebMercator", "1", row, col)
    }

    #[tokio::test]
    async fn test_fan_out_with_failing_peer() {
        let token = CancellationToken::new();

        let primary = MemoryStore::with_tiles([
            (matrix_tile(0, 0), tile_bytes(3000)),
            (matrix_tile(1, 0), tile_bytes(100)),
        ]);
        primary.save_layer_meta("base", &layer_meta("base")).unwrap();
        primary.save_tms_meta("WebMercator", &tms_meta("WebMercator")).unwrap();
        let peer1 = spawn_peer(primary, &token).await;

        // Offers two tiles but only holds the first.
        let peer2 = spawn_peer(MemoryStore::with_tiles([(matrix_tile(0, 1), tile_bytes(10))]), &token).await;
        let peer3 = spawn_peer(
            MemoryStore::with_tiles([
                (matrix_tile(1, 1), tile_bytes(5000)),
                (matrix_tile(2, 1), tile_bytes(5000)),
            ]),
            &token,
        )
        .await;

        let local = Arc::new(MemoryStore::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let progress = {
            let seen = seen.clone();
            move |done, total| seen.lock().unwrap().push((done, total))
        };

        let candidates = vec![
            candidate("k1", peer1, &[(0, 0), (1, 0)]),
            candidate("k2", peer2, &[(0, 1), (1, 1)]),
            candidate("k3", peer3, &[(1, 1), (2, 1)]),
        ];

        let downloader = Downloader::new(local.clone(), "local", connector());
        let report = downloader.run(&layer_tms(), candidates, progress).await.unwrap();

        // (1, 1) is assigned to peer 2, which fails on it.
        assert_eq!(report.candidates, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.tiles_total, 5);
        assert_eq!(report.tiles_done, 4);
        assert!(!report.is_complete());

        assert_eq!(local.tile(&matrix_tile(0, 0)), Some(tile_bytes(3000)));
        assert_eq!(local.tile(&matrix_tile(1, 0)), Some(tile_bytes(100)));
        assert_eq!(local.tile(&matrix_tile(0, 1)), Some(tile_bytes(10)));
        assert_eq!(local.tile(&matrix_tile(1, 1)), None);
        assert_eq!(local.tile(&matrix_tile(2, 1)), Some(tile_bytes(5000)));
        assert_eq!(local.layer_meta("base").unwrap(), Some(layer_meta("base")));
        assert_eq!(local.tms_meta("WebMercator").unwrap(), Some(tms_meta("WebMercator")));

        let mut done: Vec<usize> = seen.lock().unwrap().iter().map(|(d, _)| *d).collect();
        done.sort();
        assert_eq!(done, vec![1, 2, 3, 4]);
        assert!(seen.lock().unwrap().iter().all(|(_, total)| *total == 5));

        token.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_peer_does_not_block_others() {
        let token = CancellationToken::new();
        let peer1 = spawn_peer(MemoryStore::with_tiles([(matrix_tile(0, 0), tile_bytes(64))]), &token).await;
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer3 = spawn_peer(MemoryStore::with_tiles([(matrix_tile(1, 1), tile_bytes(64))]), &token).await;

        let local = Arc::new(MemoryStore::new());
        let candidates = vec![
            candidate("k1", peer1, &[(0, 0)]),
            candidate("k2", silent.local_addr().unwrap(), &[(0, 1)]),
            candidate("k3", peer3, &[(1, 1)]),
        ];

        let report = Downloader::new(local.clone(), "local", connector())
            .run(&layer_tms(), candidates, |_, _| {})
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.tiles_done, 2);
        assert_eq!(local.tile_count(), 2);

        token.cancel();
    }

    #[tokio::test]
    async fn test_failed_batch_sends_close() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        // Answers the size request with a message of the wrong kind.
        tokio::spawn(async move {
            loop {
                let (msg, from) = transport::recv_message(&socket).await.unwrap();
                let reply = match &msg {
                    Message::PeerId(_) => Some(Message::PeerId("remote".to_string())),
                    Message::TileSize(_) => Some(Message::Data(vec![1])),
                    _ => None,
                };
                tx.send(msg).unwrap();
                if let Some(reply) = reply {
                    transport::send_to(&socket, from, &reply).await.unwrap();
                }
            }
        });

        let local = Arc::new(MemoryStore::new());
        local.save_layer_meta("base", &layer_meta("base")).unwrap();
        local.save_tms_meta("WebMercator", &tms_meta("WebMercator")).unwrap();

        let report = Downloader::new(local.clone(), "local", connector())
            .run(&layer_tms(), vec![candidate("k1", addr, &[(0, 0)])], |_, _| {})
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.tiles_done, 0);

        let mut last = None;
        while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            last = Some(msg);
        }
        assert_eq!(last, Some(Message::Close));
    }

    /// Holds tiles in memory but refuses to store new ones.
    struct ReadOnlyStore(MemoryStore);

    impl TileStore for ReadOnlyStore {
        fn tile_size(&self, meta: &TileMeta) -> Result<Option<u64>> {
            self.0.tile_size(meta)
        }

        fn read_tile_range(&self, meta: &TileMeta, offset: u64, limit: u64) -> Result<Vec<u8>> {
            self.0.read_tile_range(meta, offset, limit)
        }

        fn write_tile(&self, _meta: &TileMeta, _bytes: &[u8]) -> Result<()> {
            Err(TileMeshError::Store("read-only".to_string()))
        }

        fn list_layer_tms(&self) -> Result<Vec<LayerTms>> {
            self.0.list_layer_tms()
        }

        fn layer_meta(&self, id: &str) -> Result<Option<LayerMeta>> {
            self.0.layer_meta(id)
        }

        fn save_layer_meta(&self, id: &str, meta: &LayerMeta) -> Result<()> {
            self.0.save_layer_meta(id, meta)
        }

        fn tms_meta(&self, id: &str) -> Result<Option<TmsMeta>> {
            self.0.tms_meta(id)
        }

        fn save_tms_meta(&self, id: &str, meta: &TmsMeta) -> Result<()> {
            self.0.save_tms_meta(id, meta)
        }
    }

    #[tokio::test]
    async fn test_store_failure_stops_download() {
        let token = CancellationToken::new();
        let peer1 = spawn_peer(MemoryStore::with_tiles([(matrix_tile(0, 0), tile_bytes(64))]), &token).await;
        let peer2 = spawn_peer(MemoryStore::with_tiles([(matrix_tile(1, 1), tile_bytes(64))]), &token).await;

        let local = Arc::new(ReadOnlyStore(MemoryStore::new()));
        let candidates = vec![
            candidate("k1", peer1, &[(0, 0)]),
            candidate("k2", peer2, &[(1, 1)]),
        ];

        let err = Downloader::new(local, "local", connector())
            .run(&layer_tms(), candidates, |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TileMeshError::Store(_)));

        token.cancel();
    }

    #[tokio::test]
    async fn test_plan_skips_held_and_duplicate_tiles() {
        let token = CancellationToken::new();
        let peer1 = spawn_peer(
            MemoryStore::with_tiles([
                (matrix_tile(0, 0), tile_bytes(8)),
                (matrix_tile(1, 0), tile_bytes(8)),
            ]),
            &token,
        )
        .await;
        let peer2 = spawn_peer(MemoryStore::with_tiles([(matrix_tile(1, 0), tile_bytes(8))]), &token).await;

        let local = Arc::new(MemoryStore::with_tiles([(matrix_tile(0, 0), tile_bytes(8))]));
        let candidates = vec![
            candidate("k1", peer1, &[(0, 0), (1, 0)]),
            candidate("k2", peer2, &[(1, 0)]),
        ];

        let report = Downloader::new(local.clone(), "local", connector())
            .run(&layer_tms(), candidates, |_, _| {})
            .await
            .unwrap();

        assert_eq!(report.tiles_total, 1);
        assert_eq!(report.tiles_done, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(local.tile_count(), 2);

        token.cancel();
    }

    #[tokio::test]
    async fn test_no_candidates() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let progress = {
            let seen = seen.clone();
            move |done, total| seen.lock().unwrap().push((done, total))
        };

        let report = Downloader::new(Arc::new(MemoryStore::new()), "local", connector())
            .run(&layer_tms(), Vec::new(), progress)
            .await
            .unwrap();

        assert_eq!(report, DownloadReport::default());
        assert_eq!(*seen.lock().unwrap(), vec![(0, 0)]);
    }

    #[tokio::test]
    async fn test_rendezvous_connector_fails_without_tracker() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let connector = RendezvousConnector {
            rendezvous: Some(silent.local_addr().unwrap().to_string()),
            punch: PunchConfig {
                reply_timeout: Duration::from_millis(20),
                ..PunchConfig::default()
            },
            timeout: Duration::from_millis(20),
            attempts: 1,
        };

        let offer = candidate("k1", silent.local_addr().unwrap(), &[(0, 0)]);
        let err = connector.connect(&offer).await.unwrap_err();
        assert!(matches!(err, TileMeshError::RendezvousFailed(_)));
    }
}
