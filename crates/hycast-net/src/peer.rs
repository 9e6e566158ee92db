//! The peer protocol engine — one instance per remote peer.
//!
//! A peer owns one multi-stream connection carrying six fixed streams:
//!
//! ```text
//! 0 VERSION   1 PROD_NOTICE   2 CHUNK_NOTICE
//! 3 PROD_REQ  4 CHUNK_REQ     5 CHUNK
//! ```
//!
//! Construction performs the version handshake on stream 0; after that the
//! send surface is live and the companion `PeerReceiver` can be run on its
//! own task to dispatch incoming messages to a `PeerMsgRcvr`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use hycast_core::prod::{ActualChunk, ChunkInfo, ProdIndex, ProdInfo};
use hycast_core::wire::{chunk_metadata_size, Encoder, VersionMsg, Wire, WireCtx};
use hycast_core::{Error, Result};

use crate::chunk::LatentChunk;
use crate::msrt::{self, IoBox, MsrtReader, MsrtWriter};

// ── Stream layout ─────────────────────────────────────────────────────────────

pub const VERSION_STREAM: u16 = 0;
pub const PROD_NOTICE_STREAM: u16 = 1;
pub const CHUNK_NOTICE_STREAM: u16 = 2;
pub const PROD_REQ_STREAM: u16 = 3;
pub const CHUNK_REQ_STREAM: u16 = 4;
pub const CHUNK_STREAM: u16 = 5;

/// Streams a peer connection is opened with, on both sides.
pub const NUM_STREAMS: u16 = 6;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

// ── Upcall interface ──────────────────────────────────────────────────────────

/// Receiver-facing interface the peer engine drives. Implementors are the
/// shipping responder, the receiving collector, and test doubles.
#[async_trait]
pub trait PeerMsgRcvr: Send + Sync {
    /// A product is available at the remote peer.
    async fn recv_prod_notice(&self, info: ProdInfo, peer: &Peer) -> Result<()>;

    /// A chunk is available at the remote peer.
    async fn recv_chunk_notice(&self, info: ChunkInfo, peer: &Peer) -> Result<()>;

    /// The remote peer wants a product's information.
    async fn recv_prod_request(&self, index: ProdIndex, peer: &Peer) -> Result<()>;

    /// The remote peer wants a chunk.
    async fn recv_chunk_request(&self, info: ChunkInfo, peer: &Peer) -> Result<()>;

    /// A chunk arrived. The implementor must drain or discard it before
    /// returning; the receive loop verifies and treats a still-loaded
    /// handle as a fatal protocol error.
    async fn recv_data(&self, chunk: &mut LatentChunk<'_>, peer: &Peer) -> Result<()>;
}

// ── Peer handle ───────────────────────────────────────────────────────────────

struct PeerShared {
    id: u64,
    ctx: WireCtx,
    remote: Option<SocketAddr>,
    writer: MsrtWriter,
}

/// Cheap-clone handle for sending to one remote peer.
///
/// Every peer instance is unique: equality, hashing, and ordering use a
/// process-unique id assigned at construction.
#[derive(Clone)]
pub struct Peer {
    shared: Arc<PeerShared>,
}

impl Peer {
    /// Connects to a remote peer server and performs the version handshake.
    pub async fn connect(addr: SocketAddr, ctx: WireCtx) -> Result<(Peer, PeerReceiver)> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let remote = stream.peer_addr().ok();
        Self::handshake(Box::new(stream), remote, ctx).await
    }

    /// Wraps an accepted server-side connection.
    pub async fn accept(stream: TcpStream, ctx: WireCtx) -> Result<(Peer, PeerReceiver)> {
        stream.set_nodelay(true)?;
        let remote = stream.peer_addr().ok();
        Self::handshake(Box::new(stream), remote, ctx).await
    }

    /// Wraps any established byte stream (tests use an in-memory duplex).
    pub async fn from_io(io: IoBox, ctx: WireCtx) -> Result<(Peer, PeerReceiver)> {
        Self::handshake(io, None, ctx).await
    }

    /// Exchanges `VersionMsg`s on stream 0. Both sides send, then read;
    /// a mismatch is fatal.
    async fn handshake(
        io: IoBox,
        remote: Option<SocketAddr>,
        ctx: WireCtx,
    ) -> Result<(Peer, PeerReceiver)> {
        let (mut reader, writer) = msrt::split(io, NUM_STREAMS);

        let mut enc = Encoder::new(ctx);
        enc.put(&VersionMsg(ctx.version))?;
        writer.send(VERSION_STREAM, &enc.take()).await?;

        let header = reader
            .peek()
            .await?
            .ok_or_else(|| Error::Runtime("peer closed during version handshake".into()))?;
        if header.stream_id != VERSION_STREAM {
            return Err(Error::Logic(format!(
                "first message arrived on stream {}, not the version stream",
                header.stream_id
            )));
        }
        let mut msg = reader.recv().await?;
        let theirs = VersionMsg::decode(&mut msg, &ctx)?;
        if theirs.0 != ctx.version {
            return Err(Error::UnsupportedVersion(theirs.0));
        }

        let peer = Peer {
            shared: Arc::new(PeerShared {
                id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
                ctx,
                remote,
                writer,
            }),
        };
        tracing::debug!(peer = %peer, version = ctx.version, "peer handshake complete");
        let receiver = PeerReceiver {
            reader,
            peer: peer.clone(),
        };
        Ok((peer, receiver))
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn wire_ctx(&self) -> WireCtx {
        self.shared.ctx
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote
    }

    /// Notifies the remote peer that a product is available.
    pub async fn send_prod_notice(&self, info: &ProdInfo) -> Result<()> {
        self.send_one(PROD_NOTICE_STREAM, info).await
    }

    /// Notifies the remote peer that a chunk is available.
    pub async fn send_chunk_notice(&self, info: &ChunkInfo) -> Result<()> {
        self.send_one(CHUNK_NOTICE_STREAM, info).await
    }

    /// Requests a product's information from the remote peer.
    pub async fn send_prod_request(&self, index: ProdIndex) -> Result<()> {
        self.send_one(PROD_REQ_STREAM, &index).await
    }

    /// Requests a chunk from the remote peer.
    pub async fn send_chunk_request(&self, info: &ChunkInfo) -> Result<()> {
        self.send_one(CHUNK_REQ_STREAM, info).await
    }

    /// Sends a chunk: metadata then payload, gathered into one message.
    pub async fn send_data(&self, chunk: &ActualChunk) -> Result<()> {
        let mut meta = BytesMut::new();
        chunk.info.encode(&mut meta, &self.shared.ctx)?;
        self.shared
            .writer
            .sendv(CHUNK_STREAM, &[meta.as_ref(), chunk.data.as_ref()])
            .await
    }

    /// Closes the connection for sending.
    pub async fn close(&self) -> Result<()> {
        self.shared.writer.close().await
    }

    async fn send_one<T: Wire>(&self, stream_id: u16, value: &T) -> Result<()> {
        let mut enc = Encoder::new(self.shared.ctx);
        enc.put(value)?;
        self.shared.writer.send(stream_id, &enc.take()).await
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
    }
}

impl PartialOrd for Peer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Peer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.shared.id.cmp(&other.shared.id)
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.shared.remote {
            Some(addr) => write!(f, "peer#{}({})", self.shared.id, addr),
            None => write!(f, "peer#{}", self.shared.id),
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

// ── Receive loop ──────────────────────────────────────────────────────────────

/// The receive half of a peer connection. Run on its own task.
pub struct PeerReceiver {
    reader: MsrtReader,
    peer: Peer,
}

impl PeerReceiver {
    pub fn peer(&self) -> Peer {
        self.peer.clone()
    }

    /// Dispatches incoming messages to `rcvr` until the remote closes, a
    /// transport error occurs, or shutdown is signalled.
    ///
    /// The head-of-line wait is the sole cancellation point: once a message
    /// is being consumed, nothing races the payload reads, so the
    /// transport's framing can't be torn mid-message.
    pub async fn run(
        mut self,
        rcvr: Arc<dyn PeerMsgRcvr>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let ctx = self.peer.wire_ctx();
        loop {
            let header = tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!(peer = %self.peer, "peer receiver shutting down");
                    return Ok(());
                }
                header = self.reader.peek() => header?,
            };
            let header = match header {
                Some(header) => header,
                None => {
                    tracing::info!(peer = %self.peer, "remote peer closed the connection");
                    return Ok(());
                }
            };

            match header.stream_id {
                PROD_NOTICE_STREAM => {
                    let mut msg = self.reader.recv().await?;
                    let info = ProdInfo::decode(&mut msg, &ctx)?;
                    rcvr.recv_prod_notice(info, &self.peer).await?;
                }
                CHUNK_NOTICE_STREAM => {
                    let mut msg = self.reader.recv().await?;
                    let info = ChunkInfo::decode(&mut msg, &ctx)?;
                    rcvr.recv_chunk_notice(info, &self.peer).await?;
                }
                PROD_REQ_STREAM => {
                    let mut msg = self.reader.recv().await?;
                    let index = ProdIndex::decode(&mut msg, &ctx)?;
                    rcvr.recv_prod_request(index, &self.peer).await?;
                }
                CHUNK_REQ_STREAM => {
                    let mut msg = self.reader.recv().await?;
                    let info = ChunkInfo::decode(&mut msg, &ctx)?;
                    rcvr.recv_chunk_request(info, &self.peer).await?;
                }
                CHUNK_STREAM => {
                    let meta_len = chunk_metadata_size(ctx.version);
                    if (header.len as usize) < meta_len {
                        return Err(Error::ShortMessage {
                            needed: meta_len,
                            available: header.len as usize,
                        });
                    }
                    let mut meta = vec![0u8; meta_len];
                    self.reader.read_payload(&mut meta).await?;
                    let mut cursor: &[u8] = &meta;
                    let info = ChunkInfo::decode(&mut cursor, &ctx)?;
                    let payload_len = header.len as usize - meta_len;

                    let mut chunk = LatentChunk::new(info, payload_len, &mut self.reader);
                    rcvr.recv_data(&mut chunk, &self.peer).await?;
                    if chunk.has_data() {
                        return Err(Error::Logic(format!(
                            "latent chunk {info} still has data after the upcall"
                        )));
                    }
                }
                other => {
                    tracing::warn!(peer = %self.peer, stream = other, "message on unknown stream; discarding");
                    self.reader.discard().await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn handshaken_pair() -> ((Peer, PeerReceiver), (Peer, PeerReceiver)) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let ctx = WireCtx::new(1);
        let left = tokio::spawn(Peer::from_io(Box::new(a), ctx));
        let right = tokio::spawn(Peer::from_io(Box::new(b), ctx));
        (
            left.await.unwrap().unwrap(),
            right.await.unwrap().unwrap(),
        )
    }

    #[tokio::test]
    async fn handshake_succeeds_on_matching_versions() {
        let ((a, _ra), (b, _rb)) = handshaken_pair().await;
        assert_eq!(a.wire_ctx().version, 1);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn handshake_fails_on_version_mismatch() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let left = tokio::spawn(Peer::from_io(Box::new(a), WireCtx::new(1)));
        let right = tokio::spawn(Peer::from_io(Box::new(b), WireCtx::new(2)));
        assert!(matches!(
            left.await.unwrap(),
            Err(Error::UnsupportedVersion(2))
        ));
        assert!(matches!(
            right.await.unwrap(),
            Err(Error::UnsupportedVersion(1))
        ));
    }

    #[tokio::test]
    async fn peers_are_identity_equal_and_hash_stable() {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let ((a, _ra), (b, _rb)) = handshaken_pair().await;
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert!(a < b || b < a);

        let hash_of = |peer: &Peer| {
            let mut hasher = DefaultHasher::new();
            peer.hash(&mut hasher);
            hasher.finish()
        };
        assert_eq!(hash_of(&a), hash_of(&a));
        assert_eq!(hash_of(&a), hash_of(&a.clone()));
    }
}
