use crate::{
    Result,
    config::Config,
    net::responder::{ServeOptions, listen_streams, serve_datagrams},
};

use super::utils;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub(crate) async fn run(config: Config) -> Result<()> {
    let store = utils::open_store(&config)?;
    let ctx = utils::context(&config, store);
    let token = CancellationToken::new();

    let socket = Arc::new(UdpSocket::bind(("0.0.0.0", config.peer.listen_port)).await?);
    let listener = TcpListener::bind(("0.0.0.0", config.peer.stream_port)).await?;
    println!("Peer ID: {}", config.peer.peer_id);
    println!("Listening on udp {} and tcp {}", socket.local_addr()?, listener.local_addr()?);

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    let opts = ServeOptions {
        session_ttl: config.timing.connected_peer_ttl(),
        ..ServeOptions::default()
    };
    tasks.spawn(serve_datagrams(socket, ctx.clone(), opts, token.clone()));
    tasks.spawn(listen_streams(listener, ctx.clone(), token.clone()));

    let mut trackers = Vec::new();
    for tracker in &config.trackers {
        let client = Arc::new(utils::tracker_client(&config, tracker, ctx.clone())?);
        info!(tracker = %client.url(), "Starting tracker loops");
        trackers.push(client.start(token.child_token()));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    token.cancel();

    for mut loops in trackers {
        while loops.join_next().await.is_some() {}
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Err(e)) => warn!("Responder stopped with error: {e}"),
            Err(e) => warn!("Responder task failed: {e}"),
            Ok(Ok(())) => {}
        }
    }

    Ok(())
}
