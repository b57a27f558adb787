use crate::{Result, config::Config, net::requester::PeerClient};

use super::utils;
use tokio::time::Instant;

pub(crate) async fn run(config: Config, peer: String) -> Result<()> {
    let addr = utils::resolve_peer(&peer).await?;
    let client = PeerClient::connect(addr)
        .await?
        .with_timeout(config.timing.request_timeout(), config.timing.request_attempts);

    let started = Instant::now();
    client.ping().await?;
    println!("Pong from {addr} in {:?}", started.elapsed());

    let peer_id = client.exchange_peer_ids(&config.peer.peer_id).await?;
    println!("Peer ID: {peer_id}");
    client.close().await?;

    Ok(())
}
