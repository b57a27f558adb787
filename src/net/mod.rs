pub mod message;
pub mod peer;
pub mod peers;
pub mod rendezvous;
pub mod requester;
pub mod responder;
pub mod transport;

pub use message::{Message, MessageCodec};
pub use peer::PeerAddr;
pub use peers::ConnectedPeers;
pub use requester::PeerClient;
pub use transport::PeerStream;
