//! hycast-net — the multi-stream reliable message transport, the multicast
//! datagram transport, the peer protocol engine, and the multicast codec.

pub mod chunk;
pub mod mcast;
pub mod mcast_sock;
pub mod msrt;
pub mod peer;

pub use chunk::{LatentChunk, PayloadSource};
pub use mcast::{McastContentRcvr, McastReceiver, McastSender};
pub use peer::{Peer, PeerMsgRcvr, PeerReceiver};
