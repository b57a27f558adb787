use crate::{
    Result, TileMeshError,
    config::{Config, TrackerConfig},
    net::{peer::PeerAddr, peers::ConnectedPeers, responder::ResponderContext},
    source::{DirectPeerSource, RasterSource},
    store::{DirStore, TileStore},
    tracker::TrackerClient,
};

use std::net::SocketAddr;
use std::sync::Arc;

pub(crate) fn open_store(config: &Config) -> Result<Arc<dyn TileStore>> {
    Ok(Arc::new(DirStore::open(&config.storage.data_dir)?))
}

pub(crate) fn context(config: &Config, store: Arc<dyn TileStore>) -> ResponderContext {
    ResponderContext::new(store, ConnectedPeers::new(), config.peer.peer_id.clone())
}

pub(crate) fn tracker_client(
    config: &Config,
    tracker: &TrackerConfig,
    ctx: ResponderContext,
) -> Result<TrackerClient> {
    Ok(TrackerClient::new(tracker, ctx, config.timing.clone())?
        .with_link_speed(config.peer.download_speed, config.peer.upload_speed))
}

pub(crate) async fn resolve_peer(peer: &str) -> Result<SocketAddr> {
    peer.parse::<PeerAddr>()?.resolve().await
}

/// The source named on the command line, falling back to the first
/// configured tracker and then the configured peers.
pub(crate) fn source(
    config: &Config,
    store: Arc<dyn TileStore>,
    peer: Option<String>,
    tracker: Option<String>,
) -> Result<RasterSource> {
    if let Some(peer) = peer {
        return Ok(direct_source(config, store, vec![peer.parse()?]));
    }

    let tracker = match tracker {
        Some(url) => Some(TrackerConfig {
            url,
            rendezvous: None,
        }),
        None => config.trackers.first().cloned(),
    };
    if let Some(tracker) = tracker {
        let ctx = context(config, store);
        return Ok(RasterSource::Tracker(Arc::new(tracker_client(config, &tracker, ctx)?)));
    }

    let peers = config.peer_addrs()?;
    if peers.is_empty() {
        return Err(TileMeshError::Config(
            "no --peer or --tracker given and none configured".to_string(),
        ));
    }
    Ok(direct_source(config, store, peers))
}

fn direct_source(config: &Config, store: Arc<dyn TileStore>, peers: Vec<PeerAddr>) -> RasterSource {
    RasterSource::Peer(DirectPeerSource::new(
        peers,
        store,
        config.peer.peer_id.clone(),
        config.timing.clone(),
    ))
}
