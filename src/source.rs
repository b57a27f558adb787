//! Places tiles can be downloaded from.

use crate::{
    Result, TileMeshError,
    config::TimingConfig,
    meta::{LayerTms, TileFormat, TmsMeta},
    net::{peer::PeerAddr, requester::PeerClient},
    store::{self, TileStore},
    tracker::{DownloadReport, TrackerClient},
};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

pub enum RasterSource {
    Tracker(Arc<TrackerClient>),
    Peer(DirectPeerSource),
}

impl RasterSource {
    pub fn name(&self) -> String {
        match self {
            Self::Tracker(tracker) => format!("Tracker {}", tracker.url()),
            Self::Peer(source) => {
                let peers: Vec<String> = source.peers().iter().map(ToString::to_string).collect();
                format!("Peer {}", peers.join(", "))
            }
        }
    }

    pub async fn list_available(&self) -> Result<Vec<LayerTms>> {
        match self {
            Self::Tracker(tracker) => tracker.discover_layers().await,
            Self::Peer(peer) => peer.list_available().await,
        }
    }

    pub async fn download<F>(&self, layer_tms: &LayerTms, progress: F) -> Result<DownloadReport>
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        match self {
            Self::Tracker(tracker) => tracker.download(layer_tms, progress).await,
            Self::Peer(peer) => peer.download(layer_tms, progress).await,
        }
    }

    pub fn is_alive(&self) -> bool {
        match self {
            Self::Tracker(tracker) => tracker.is_alive(),
            Self::Peer(peer) => peer.is_alive(),
        }
    }
}

/// Peers at known addresses, queried without a tracker. They are tried in
/// order until one answers, and every tile of the requested tile matrix set
/// is asked for in turn.
pub struct DirectPeerSource {
    peers: Vec<PeerAddr>,
    store: Arc<dyn TileStore>,
    peer_id: String,
    timing: TimingConfig,
    alive: AtomicBool,
}

impl DirectPeerSource {
    pub fn new(
        peers: Vec<PeerAddr>,
        store: Arc<dyn TileStore>,
        peer_id: impl Into<String>,
        timing: TimingConfig,
    ) -> Self {
        Self {
            peers,
            store,
            peer_id: peer_id.into(),
            timing,
            alive: AtomicBool::new(true),
        }
    }

    pub fn peers(&self) -> &[PeerAddr] {
        &self.peers
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn client(&self, addr: &PeerAddr) -> Result<PeerClient> {
        let addr = addr.resolve().await?;
        Ok(PeerClient::connect(addr)
            .await?
            .with_timeout(self.timing.request_timeout(), self.timing.request_attempts))
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Err(TileMeshError::Unreachable(_)) => self.alive.store(false, Ordering::SeqCst),
            Ok(_) => self.alive.store(true, Ordering::SeqCst),
            Err(_) => {}
        }
        result
    }

    fn no_peers() -> TileMeshError {
        TileMeshError::Config("no direct peers configured".to_string())
    }

    pub async fn list_available(&self) -> Result<Vec<LayerTms>> {
        let mut last = None;
        for addr in &self.peers {
            match self.list_from(addr).await {
                Ok(layers) => return self.track(Ok(layers)),
                Err(e) if e.is_recoverable() => {
                    warn!(peer = %addr, "Listing layers failed: {e}");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        self.track(Err(last.unwrap_or_else(Self::no_peers)))
    }

    async fn list_from(&self, addr: &PeerAddr) -> Result<Vec<LayerTms>> {
        let client = self.client(addr).await?;
        let layers = client.request_layers().await?;
        debug!(peer = %addr, "Received {} layers", layers.len());
        Ok(layers)
    }

    /// Downloads from the first peer that can serve the layer. Tiles stored
    /// by a peer that failed midway are not asked for again.
    pub async fn download<F>(&self, layer_tms: &LayerTms, progress: F) -> Result<DownloadReport>
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        let mut last = None;
        for (tried, addr) in self.peers.iter().enumerate() {
            match self.download_from(addr, layer_tms, &progress).await {
                Ok(mut report) => {
                    report.candidates = tried + 1;
                    report.failed = tried;
                    return self.track(Ok(report));
                }
                Err(e) if e.is_recoverable() => {
                    warn!(peer = %addr, %layer_tms, "Download aborted: {e}");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        self.track(Err(last.unwrap_or_else(Self::no_peers)))
    }

    async fn download_from<F>(
        &self,
        addr: &PeerAddr,
        layer_tms: &LayerTms,
        progress: &F,
    ) -> Result<DownloadReport>
    where
        F: Fn(usize, usize),
    {
        let client = self.client(addr).await?;
        client.exchange_peer_ids(&self.peer_id).await?;

        let (tms, format) = self.descriptors(&client, layer_tms).await?;
        let mut missing = 0;
        for meta in tms.tiles(layer_tms, format) {
            if !self.store.has_tile(&meta)? {
                missing += 1;
            }
        }

        let mut report = DownloadReport {
            candidates: 1,
            tiles_total: missing,
            ..DownloadReport::default()
        };
        info!(
            peer = %addr,
            %layer_tms,
            tiles = missing,
            matrix_set_tiles = tms.total_tiles(),
            "Starting download"
        );

        for meta in tms.tiles(layer_tms, format) {
            if self.store.has_tile(&meta)? {
                continue;
            }

            let fetched = client.request_tile(&meta).await;
            match fetched {
                Ok(bytes) => {
                    store::blocking(&self.store, move |store| store.write_tile(&meta, &bytes)).await?;
                    report.tiles_done += 1;
                    progress(report.tiles_done, report.tiles_total);
                }
                Err(TileMeshError::Unavailable(e)) => {
                    debug!(peer = %addr, "Skipping tile: {e}");
                }
                Err(e) => {
                    client.close().await.ok();
                    return Err(e);
                }
            }
            tokio::time::sleep(self.timing.tile_delay()).await;
        }

        client.close().await?;
        info!(
            peer = %addr,
            %layer_tms,
            done = report.tiles_done,
            total = report.tiles_total,
            "Download finished"
        );
        Ok(report)
    }

    /// The tile matrix set to walk and the tile format to ask for. Missing
    /// descriptors are fetched from the peer and saved.
    async fn descriptors(&self, client: &PeerClient, layer_tms: &LayerTms) -> Result<(TmsMeta, TileFormat)> {
        let layer = match self.store.layer_meta(&layer_tms.layer)? {
            Some(meta) => Some(meta),
            None => {
                let meta = client.request_layer_meta(&layer_tms.layer).await?;
                if let Some(meta) = meta.clone() {
                    let id = layer_tms.layer.clone();
                    store::blocking(&self.store, move |store| store.save_layer_meta(&id, &meta)).await?;
                }
                meta
            }
        };

        let tms = match self.store.tms_meta(&layer_tms.tile_matrix_set)? {
            Some(meta) => meta,
            None => {
                debug!(peer = %client.addr(), "Requesting tile matrix set {}", layer_tms.tile_matrix_set);
                let meta = client
                    .request_tms_meta(&layer_tms.tile_matrix_set)
                    .await?
                    .ok_or_else(|| {
                        TileMeshError::Unavailable(format!(
                            "{} has no tile matrix set {}",
                            client.addr(),
                            layer_tms.tile_matrix_set
                        ))
                    })?;
                let id = layer_tms.tile_matrix_set.clone();
                let saved = meta.clone();
                store::blocking(&self.store, move |store| store.save_tms_meta(&id, &saved)).await?;
                meta
            }
        };

        let format = layer
            .and_then(|l| l.formats.first().copied())
            .unwrap_or(TileFormat::Png);
        Ok((tms, format))
    }
}
