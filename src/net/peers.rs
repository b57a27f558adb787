use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct ConnectedPeer {
    peer_id: String,
    last_seen: Instant,
}

/// Peers that introduced themselves with `PeerId`, keyed by the address
/// they talk from. Shared between responders and the tracker announce loop.
#[derive(Debug, Clone, Default)]
pub struct ConnectedPeers {
    inner: Arc<Mutex<HashMap<SocketAddr, ConnectedPeer>>>,
}

impl ConnectedPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, addr: SocketAddr, peer_id: impl Into<String>) {
        if let Ok(mut peers) = self.inner.lock() {
            peers.insert(
                addr,
                ConnectedPeer {
                    peer_id: peer_id.into(),
                    last_seen: Instant::now(),
                },
            );
        }
    }

    /// Refreshes the last-seen time of a known peer.
    pub fn touch(&self, addr: SocketAddr) {
        if let Ok(mut peers) = self.inner.lock() {
            if let Some(peer) = peers.get_mut(&addr) {
                peer.last_seen = Instant::now();
            }
        }
    }

    /// Drops peers not seen for longer than `ttl`.
    pub fn prune(&self, ttl: Duration) {
        if let Ok(mut peers) = self.inner.lock() {
            peers.retain(|_, peer| peer.last_seen.elapsed() <= ttl);
        }
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .lock()
            .map(|peers| peers.values().map(|p| p.peer_id.clone()).collect())
            .unwrap_or_default();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|peers| peers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_prune() {
        let peers = ConnectedPeers::new();
        let a: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:4000".parse().unwrap();

        peers.register(a, "peer-a");
        peers.register(b, "peer-b");
        peers.register(b, "peer-b");
        assert_eq!(peers.peer_ids(), vec!["peer-a", "peer-b"]);

        peers.prune(Duration::from_secs(60));
        assert_eq!(peers.len(), 2);

        std::thread::sleep(Duration::from_millis(20));
        peers.touch(a);
        peers.prune(Duration::from_millis(10));
        assert_eq!(peers.peer_ids(), vec!["peer-a"]);
    }
}
