//! Client side of a tracker: periodic announces, polling for incoming
//! connection requests, layer discovery and tracker-mediated downloads.

mod capabilities;
mod download;
pub mod dto;

pub use capabilities::parse_capabilities;
pub use download::{Connector, DirectConnector, DownloadReport, Downloader, RendezvousConnector};

use crate::{
    Result,
    config::{TimingConfig, TrackerConfig},
    meta::LayerTms,
    net::{
        peer::PeerAddr,
        rendezvous,
        responder::{ResponderContext, ServeOptions, serve_datagrams},
    },
};

use dto::{AnnouncePeerInfo, AskReply, CheckReply};

use reqwest::StatusCode;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Check,
    AnnounceTms,
    AnnounceLayers,
    AnnouncePeer,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Check => "check",
            Self::AnnounceTms => "announce tms",
            Self::AnnounceLayers => "announce layers",
            Self::AnnouncePeer => "announce peer",
        };
        write!(f, "{name}")
    }
}

pub struct TrackerClient {
    base: Url,
    rendezvous: Option<String>,
    http: reqwest::Client,
    ctx: ResponderContext,
    timing: TimingConfig,
    link_speed: (Option<f64>, Option<f64>),
    alive: AtomicBool,
}

impl TrackerClient {
    pub fn new(config: &TrackerConfig, ctx: ResponderContext, timing: TimingConfig) -> Result<Self> {
        let mut base = Url::parse(&config.url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            base,
            rendezvous: config.rendezvous.clone(),
            http: reqwest::Client::builder()
                .timeout(timing.http_timeout())
                .build()?,
            ctx,
            timing,
            link_speed: (None, None),
            alive: AtomicBool::new(true),
        })
    }

    /// Link speed in Mbit/s reported with the peer announce.
    pub fn with_link_speed(mut self, download: Option<f64>, upload: Option<f64>) -> Self {
        self.link_speed = (download, upload);
        self
    }

    pub fn url(&self) -> &Url {
        &self.base
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn set_alive(&self, alive: bool) {
        if self.alive.swap(alive, Ordering::SeqCst) != alive {
            if alive {
                info!(tracker = %self.base, "Tracker is reachable again");
            } else {
                warn!(tracker = %self.base, "Tracker is unreachable");
            }
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    /// Posts every tile matrix set descriptor held locally.
    pub async fn announce_tms(&self) -> Result<usize> {
        let docs = self.ctx.store.tms_documents()?;
        debug!(tracker = %self.base, "Announcing {} tile matrix sets", docs.len());
        self.announce_documents("announce/tms", docs).await
    }

    /// Posts every layer descriptor held locally.
    pub async fn announce_layers(&self) -> Result<usize> {
        let docs = self.ctx.store.layer_documents()?;
        debug!(tracker = %self.base, "Announcing {} layers", docs.len());
        self.announce_documents("announce/layer", docs).await
    }

    async fn announce_documents(&self, path: &str, docs: Vec<String>) -> Result<usize> {
        let url = self.endpoint(path)?;
        let count = docs.len();

        for (i, doc) in docs.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.timing.announce_delay()).await;
            }
            self.http
                .post(url.clone())
                .query(&[("peerid", self.ctx.peer_id.as_str())])
                .header(reqwest::header::CONTENT_TYPE, "text/xml")
                .body(doc)
                .send()
                .await?
                .error_for_status()?;
        }

        Ok(count)
    }

    /// Reports our id and the ids of peers seen recently.
    pub async fn announce_peer(&self) -> Result<()> {
        self.ctx.peers.prune(self.timing.connected_peer_ttl());

        let info = AnnouncePeerInfo {
            peer_id: self.ctx.peer_id.clone(),
            connected_peers: self.ctx.peers.peer_ids(),
            internet_download_speed: self.link_speed.0,
            internet_upload_speed: self.link_speed.1,
        };
        debug!(tracker = %self.base, connected = info.connected_peers.len(), "Announcing peer info");

        self.http
            .post(self.endpoint("announce/peer")?)
            .json(&info)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Pending connection requests from other peers.
    pub async fn check_requests(&self) -> Result<Vec<CheckReply>> {
        let resp = self
            .http
            .get(self.endpoint("peers/check")?)
            .query(&[("peerid", self.ctx.peer_id.as_str())])
            .send()
            .await?;

        if resp.status() == StatusCode::NO_CONTENT {
            debug!(tracker = %self.base, "No requests from other peers");
            return Ok(Vec::new());
        }

        Ok(resp.error_for_status()?.json().await?)
    }

    /// Peers holding tiles of `layer_tms`. The first one is the primary.
    pub async fn ask_peers(&self, layer_tms: &LayerTms) -> Result<Vec<AskReply>> {
        let replies = self
            .http
            .get(self.endpoint("peers/ask")?)
            .query(&[
                ("peerid", self.ctx.peer_id.as_str()),
                ("layer", layer_tms.layer.as_str()),
                ("tms", layer_tms.tile_matrix_set.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(replies)
    }

    pub async fn capabilities(&self) -> Result<String> {
        Ok(self
            .http
            .get(self.endpoint("layers/GetCapabilities")?)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?)
    }

    /// Layers the tracker knows about, from its capability document.
    pub async fn discover_layers(&self) -> Result<Vec<LayerTms>> {
        let document = self.capabilities().await?;
        Ok(parse_capabilities(&document))
    }

    pub fn connector(&self) -> RendezvousConnector {
        RendezvousConnector {
            rendezvous: self.rendezvous.clone(),
            punch: self.timing.punch_config(),
            timeout: self.timing.request_timeout(),
            attempts: self.timing.request_attempts,
        }
    }

    /// Downloads `layer_tms` from the peers the tracker names.
    pub async fn download<F>(&self, layer_tms: &LayerTms, progress: F) -> Result<DownloadReport>
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        let candidates = match self.ask_peers(layer_tms).await {
            Ok(candidates) => {
                self.set_alive(true);
                candidates
            }
            Err(e) => {
                self.set_alive(false);
                return Err(e);
            }
        };

        Downloader::new(self.ctx.store.clone(), self.ctx.peer_id.clone(), self.connector())
            .with_tile_delay(self.timing.tile_delay())
            .run(layer_tms, candidates, progress)
            .await
    }

    /// Starts the check and announce loops. All of them stop when `token`
    /// is cancelled.
    pub fn start(self: Arc<Self>, token: CancellationToken) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        for task in [Task::Check, Task::AnnounceTms, Task::AnnounceLayers, Task::AnnouncePeer] {
            tasks.spawn(self.clone().run_loop(task, token.clone()));
        }
        tasks
    }

    async fn run_loop(self: Arc<Self>, task: Task, token: CancellationToken) {
        // Announces wait for the first check to settle reachability.
        let (delay, period) = match task {
            Task::Check => (Duration::ZERO, self.timing.check_period()),
            _ => (self.timing.check_period(), self.timing.announce_period()),
        };

        if !pause(delay, &token).await {
            return;
        }

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.run_task(task, &token) => {}
            }

            if !pause(period, &token).await {
                break;
            }
        }
        debug!(tracker = %self.base, "Stopped {task} loop");
    }

    async fn run_task(&self, task: Task, token: &CancellationToken) {
        if task != Task::Check && !self.is_alive() {
            debug!(tracker = %self.base, "Tracker is not alive, skipping {task}");
            return;
        }

        let result = match task {
            Task::Check => self.check_requests().await.map(|requests| {
                for request in requests {
                    self.accept(request, token.child_token());
                }
            }),
            Task::AnnounceTms => self.announce_tms().await.map(|_| ()),
            Task::AnnounceLayers => self.announce_layers().await.map(|_| ()),
            Task::AnnouncePeer => self.announce_peer().await,
        };

        match result {
            Ok(()) => self.set_alive(true),
            Err(e) => {
                warn!(tracker = %self.base, "Failed to {task}: {e}");
                self.set_alive(false);
            }
        }
    }

    /// Punches through to the requesting peer and serves it on the
    /// resulting socket until it closes or goes idle.
    fn accept(&self, request: CheckReply, token: CancellationToken) {
        let ctx = self.ctx.clone();
        let punch = self.timing.punch_config();
        let idle = self.timing.connected_peer_ttl();
        let rendezvous = self.rendezvous.clone();

        tokio::spawn(async move {
            let result: Result<()> = async {
                let endpoint = match rendezvous {
                    Some(addr) => addr.parse::<PeerAddr>()?,
                    None => PeerAddr::new(request.host.clone(), request.port),
                };
                let endpoint = endpoint.resolve().await?;
                let socket = rendezvous::connect_socket().await?;
                let punched = rendezvous::punch(&request.key, socket, endpoint, &punch).await?;
                info!(peer = %punched.peer, "Serving peer after hole punch");

                let opts = ServeOptions {
                    until_closed: true,
                    idle_timeout: Some(idle),
                    session_ttl: idle,
                };
                serve_datagrams(punched.socket, ctx, opts, token).await
            }
            .await;

            if let Err(e) = result {
                warn!(key = %request.key, "Failed to serve requesting peer: {e}");
            }
        });
    }
}

/// Sleeps for `period`. Returns false if cancelled first.
async fn pause(period: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(period) => true,
    }
}
