use crate::{Result, TileMeshError};

use super::message::{AsBytes, Message, MessageCodec};

use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{
    TcpStream, UdpSocket,
    tcp::{OwnedReadHalf, OwnedWriteHalf},
};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::trace;

/// Receive buffer for one datagram. Large enough for a 4096 byte tile chunk
/// plus framing, and for any metadata reply.
pub const MAX_DATAGRAM: usize = 8192;

/// Encodes `msg` and sends it as a single datagram.
pub async fn send_to(socket: &UdpSocket, addr: SocketAddr, msg: &Message) -> Result<()> {
    let bytes = msg.as_bytes()?;
    trace!(peer = %addr, size = bytes.len(), "Sending {}", msg.name());
    socket.send_to(&bytes, addr).await?;
    Ok(())
}

/// Receives at most one datagram of up to `max_bytes`. An empty datagram is
/// reported as a closed remote side.
pub async fn recv_from(socket: &UdpSocket, max_bytes: usize) -> Result<(usize, Vec<u8>, SocketAddr)> {
    let mut buf = vec![0u8; max_bytes];
    let (n, addr) = socket.recv_from(&mut buf).await?;
    if n == 0 {
        return Err(TileMeshError::ConnectionClosed);
    }
    buf.truncate(n);
    Ok((n, buf, addr))
}

/// Receives one datagram and decodes it as a message.
pub async fn recv_message(socket: &UdpSocket) -> Result<(Message, SocketAddr)> {
    let (_, buf, addr) = recv_from(socket, MAX_DATAGRAM).await?;
    let msg = Message::decode(&buf)?;
    trace!(peer = %addr, "Received {}", msg.name());
    Ok((msg, addr))
}

/// A stream connection carrying length-prefixed messages.
#[derive(Debug)]
pub struct PeerStream {
    peer: SocketAddr,
    pub(crate) reader: FramedRead<OwnedReadHalf, MessageCodec>,
    pub(crate) writer: OwnedWriteHalf,
}

impl PeerStream {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TileMeshError::Unreachable(format!("{addr}: {e}")))?;
        Self::new(stream)
    }

    pub fn new(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let reader = FramedRead::new(read_half, MessageCodec);

        Ok(Self {
            peer,
            reader,
            writer: write_half,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        let bytes = msg.as_bytes()?;
        trace!(peer = %self.peer, size = bytes.len(), "Sending {}", msg.name());
        self.writer.write_all(&bytes).await?;
        Ok(())
    }

    /// Next message from the stream. End of stream is `ConnectionClosed`.
    pub async fn receive(&mut self) -> Result<Message> {
        match self.reader.next().await {
            Some(msg) => msg,
            None => Err(TileMeshError::ConnectionClosed),
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_datagram_exchange() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        send_to(&a, b.local_addr().unwrap(), &Message::StartData(42))
            .await
            .unwrap();

        let (msg, from) = recv_message(&b).await.unwrap();
        assert_eq!(msg, Message::StartData(42));
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_empty_datagram_is_closed() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.send_to(&[], b.local_addr().unwrap()).await.unwrap();

        let err = recv_from(&b, MAX_DATAGRAM).await.unwrap_err();
        assert!(matches!(err, TileMeshError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_stream_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = PeerStream::new(stream).unwrap();
            let msg = stream.receive().await.unwrap();
            stream.send(&Message::Data(vec![9; 10])).await.unwrap();
            msg
        });

        let mut client = PeerStream::connect(addr).await.unwrap();
        client.send(&Message::Reply(true)).await.unwrap();
        assert_eq!(client.receive().await.unwrap(), Message::Data(vec![9; 10]));
        assert_eq!(server.await.unwrap(), Message::Reply(true));

        let err = client.receive().await.unwrap_err();
        assert!(matches!(err, TileMeshError::ConnectionClosed));
    }
}
