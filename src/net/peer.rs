use crate::{Result, TileMeshError};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::net::lookup_host;

/// Network address of a peer as configured or reported by a tracker.
/// Not an identity: the same peer may show up under different addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub async fn resolve(&self) -> Result<SocketAddr> {
        lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| TileMeshError::Unreachable(format!("{self}: {e}")))?
            .next()
            .ok_or_else(|| TileMeshError::Unreachable(format!("{self}: no address")))
    }
}

impl FromStr for PeerAddr {
    type Err = TileMeshError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TileMeshError::InvalidAddress(format!("Expected host:port, got {s}")))?;

        if host.is_empty() {
            return Err(TileMeshError::InvalidAddress(format!("Empty host in {s}")));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| TileMeshError::InvalidAddress(format!("Invalid port in {s}")))?;

        Ok(PeerAddr::new(host, port))
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        PeerAddr::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer_addr() {
        let addr = PeerAddr::from_str("tiles.example.org:7070").unwrap();
        assert_eq!(addr, PeerAddr::new("tiles.example.org", 7070));
        assert_eq!(addr.to_string(), "tiles.example.org:7070");

        assert!(PeerAddr::from_str("no-port").is_err());
        assert!(PeerAddr::from_str("host:99999").is_err());
        assert!(PeerAddr::from_str(":80").is_err());
    }

    #[tokio::test]
    async fn test_resolve_loopback() {
        let addr = PeerAddr::new("127.0.0.1", 4000).resolve().await.unwrap();
        assert_eq!(addr, "127.0.0.1:4000".parse::<SocketAddr>().unwrap());
    }
}
