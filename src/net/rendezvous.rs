use crate::{Result, TileMeshError};

use super::{
    message::Message,
    peer::PeerAddr,
    transport::{self, MAX_DATAGRAM},
};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PunchConfig {
    /// How long to wait for the rendezvous endpoint per attempt.
    pub reply_timeout: Duration,
    /// Total number of key datagrams sent before giving up.
    pub attempts: usize,
    pub probes: usize,
    pub probe_timeout: Duration,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(2),
            attempts: 5,
            probes: 5,
            probe_timeout: Duration::from_millis(200),
        }
    }
}

/// A socket with a path opened towards `peer`.
#[derive(Debug, Clone)]
pub struct Punched {
    pub socket: Arc<UdpSocket>,
    pub peer: SocketAddr,
}

/// Binds a UDP socket on an ephemeral port of every interface.
pub async fn connect_socket() -> Result<UdpSocket> {
    Ok(UdpSocket::bind("0.0.0.0:0").await?)
}

/// Opens a UDP path to the peer holding the same connection `key`.
///
/// The key is sent to the rendezvous endpoint, which answers with the
/// counterpart's public `host:port`. Ping probes are then sent to that
/// address so that both NATs see outbound traffic. Probes are best-effort.
pub async fn punch(
    key: &str,
    socket: UdpSocket,
    rendezvous: SocketAddr,
    config: &PunchConfig,
) -> Result<Punched> {
    let peer = resolve_peer(key, &socket, rendezvous, config).await?;
    info!(%peer, "Rendezvous complete, probing");

    if probe(&socket, peer, config).await? {
        debug!(%peer, "Probe answered");
    } else {
        warn!(%peer, "No probe answered, continuing");
    }

    Ok(Punched {
        socket: Arc::new(socket),
        peer,
    })
}

async fn resolve_peer(
    key: &str,
    socket: &UdpSocket,
    rendezvous: SocketAddr,
    config: &PunchConfig,
) -> Result<SocketAddr> {
    for attempt in 1..=config.attempts {
        debug!(%rendezvous, attempt, "Sending connection key");
        socket.send_to(key.as_bytes(), rendezvous).await?;

        let deadline = Instant::now() + config.reply_timeout;
        loop {
            let (buf, from) = match timeout_at(deadline, transport::recv_from(socket, MAX_DATAGRAM)).await {
                Ok(Ok((_, buf, from))) => (buf, from),
                Ok(Err(TileMeshError::ConnectionClosed)) => continue,
                Ok(Err(TileMeshError::IoError(e))) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    debug!(%rendezvous, "Connection reset while waiting: {e}");
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            };

            if from != rendezvous {
                // The counterpart may already be probing.
                if let Ok(Message::Ping) = Message::decode(&buf) {
                    transport::send_to(socket, from, &Message::Pong).await?;
                }
                continue;
            }

            let text = std::str::from_utf8(&buf)
                .map_err(|e| TileMeshError::RendezvousFailed(format!("Invalid reply: {e}")))?;
            let addr: PeerAddr = text
                .trim()
                .parse()
                .map_err(|e| TileMeshError::RendezvousFailed(format!("Invalid peer address {text:?}: {e}")))?;

            return addr
                .resolve()
                .await
                .map_err(|e| TileMeshError::RendezvousFailed(e.to_string()));
        }
    }

    Err(TileMeshError::RendezvousFailed(format!(
        "No reply from {rendezvous} after {} attempts",
        config.attempts
    )))
}

/// Sends Ping probes until one is answered. Pings from the peer are
/// answered with Pong while waiting.
async fn probe(socket: &UdpSocket, peer: SocketAddr, config: &PunchConfig) -> Result<bool> {
    for _ in 0..config.probes {
        transport::send_to(socket, peer, &Message::Ping).await?;

        let deadline = Instant::now() + config.probe_timeout;
        loop {
            let (buf, from) = match timeout_at(deadline, transport::recv_from(socket, MAX_DATAGRAM)).await {
                Ok(Ok((_, buf, from))) => (buf, from),
                Ok(Err(_)) => continue,
                Err(_) => break,
            };
            if from != peer {
                continue;
            }

            match Message::decode(&buf) {
                Ok(Message::Pong) => return Ok(true),
                Ok(Message::Ping) => transport::send_to(socket, peer, &Message::Pong).await?,
                Ok(other) => debug!(%peer, "Ignoring {} while probing", other.name()),
                Err(e) => debug!(%peer, "Ignoring undecodable probe reply: {e}"),
            }
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> PunchConfig {
        PunchConfig {
            reply_timeout: Duration::from_millis(50),
            attempts: 5,
            probes: 5,
            probe_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_punch_two_peers() {
        let tracker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let rendezvous = tracker.local_addr().unwrap();

        tokio::spawn(async move {
            let mut waiting: Vec<SocketAddr> = Vec::new();
            let mut buf = [0u8; 256];
            loop {
                let (n, from) = tracker.recv_from(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"key-1");
                if !waiting.contains(&from) {
                    waiting.push(from);
                }
                if waiting.len() == 2 {
                    let (a, b) = (waiting[0], waiting[1]);
                    tracker.send_to(b.to_string().as_bytes(), a).await.unwrap();
                    tracker.send_to(a.to_string().as_bytes(), b).await.unwrap();
                }
            }
        });

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (a_addr, b_addr) = (a.local_addr().unwrap(), b.local_addr().unwrap());

        let config = fast_config();
        let (pa, pb) = tokio::join!(
            punch("key-1", a, rendezvous, &config),
            punch("key-1", b, rendezvous, &config),
        );
        let (pa, pb) = (pa.unwrap(), pb.unwrap());

        assert_eq!(pa.peer, b_addr);
        assert_eq!(pb.peer, a_addr);
        assert_eq!(pa.socket.local_addr().unwrap(), a_addr);
    }

    #[tokio::test]
    async fn test_silent_rendezvous_fails_after_five_attempts() {
        let tracker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let err = punch("key-2", socket, tracker.local_addr().unwrap(), &fast_config())
            .await
            .unwrap_err();
        assert!(matches!(err, TileMeshError::RendezvousFailed(_)));

        let mut buf = [0u8; 64];
        let mut received = 0;
        while let Ok(Ok((n, _))) =
            tokio::time::timeout(Duration::from_millis(20), tracker.recv_from(&mut buf)).await
        {
            assert_eq!(&buf[..n], b"key-2");
            received += 1;
        }
        assert_eq!(received, 5);
    }

    #[tokio::test]
    async fn test_invalid_rendezvous_reply() {
        let tracker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let rendezvous = tracker.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = tracker.recv_from(&mut buf).await.unwrap();
            tracker.send_to(b"not an address", from).await.unwrap();
        });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let err = punch("key-3", socket, rendezvous, &fast_config()).await.unwrap_err();
        assert!(matches!(err, TileMeshError::RendezvousFailed(_)));
    }
}
