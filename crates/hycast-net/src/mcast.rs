//! Multicast codec — products onto datagrams and back.
//!
//! Send path: one `[PROD_INFO_MSGID][ProdInfo]` datagram, then one
//! `[CHUNK_MSGID][ChunkInfo][payload]` datagram per chunk in index order.
//! Receive path mirrors it, delivering parsed content to an upcall.
//! Each incoming message MUST be fully consumed before the next iteration,
//! otherwise its tail would be parsed as a fresh message; `clear()` after
//! every dispatch enforces that.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use hycast_core::prod::{ProdInfo, Product};
use hycast_core::wire::{chunk_metadata_size, Encoder, WireCtx, CHUNK_MSGID, PROD_INFO_MSGID};
use hycast_core::{Error, Result};

use crate::chunk::LatentChunk;
use crate::mcast_sock::{self, DatagramDecoder, MAX_PAYLOAD};

/// Receiver-facing interface the multicast receiver drives.
#[async_trait]
pub trait McastContentRcvr: Send + Sync {
    async fn receive_info(&self, info: ProdInfo) -> Result<()>;

    /// The implementor must drain or discard the chunk before returning.
    async fn receive_chunk(&self, chunk: &mut LatentChunk<'_>) -> Result<()>;
}

// ── Sender ────────────────────────────────────────────────────────────────────

/// Sends whole products to a multicast group.
pub struct McastSender {
    sock: UdpSocket,
    group: SocketAddr,
    ctx: WireCtx,
}

impl McastSender {
    pub fn new(group: SocketAddr, hop_limit: u8, loop_enabled: bool, ctx: WireCtx) -> Result<Self> {
        let sock = mcast_sock::sender_socket(group, hop_limit, loop_enabled)?;
        Ok(Self { sock, group, ctx })
    }

    /// Multicasts a product: its info, then every chunk in index order.
    pub async fn send(&self, prod: &Product) -> Result<()> {
        let mut enc = Encoder::new(self.ctx);
        enc.put_u8(PROD_INFO_MSGID);
        enc.put(prod.info())?;
        self.send_datagram(&enc.take()).await?;

        let mut dgram = BytesMut::new();
        for index in 0..prod.info().chunk_count() {
            let chunk = prod.chunk(index)?;
            enc.put_u8(CHUNK_MSGID);
            enc.put(&chunk.info)?;
            let meta = enc.take();

            dgram.clear();
            dgram.extend_from_slice(&meta);
            dgram.extend_from_slice(&chunk.data);
            self.send_datagram(&dgram).await?;
        }
        tracing::debug!(
            prod = %prod.info().index(),
            chunks = prod.info().chunk_count(),
            "product multicast"
        );
        Ok(())
    }

    async fn send_datagram(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::InvalidArgument(format!(
                "{}-byte datagram exceeds the {MAX_PAYLOAD}-byte maximum",
                payload.len()
            )));
        }
        self.sock.send_to(payload, self.group).await?;
        Ok(())
    }
}

// ── Receiver ──────────────────────────────────────────────────────────────────

/// Receives multicast products and hands parsed content to an upcall.
pub struct McastReceiver {
    decoder: DatagramDecoder,
    ctx: WireCtx,
}

impl McastReceiver {
    /// Joins `group`, optionally filtered to datagrams from `source`.
    pub fn new(group: SocketAddr, source: Option<IpAddr>, ctx: WireCtx) -> Result<Self> {
        let sock = mcast_sock::receiver_socket(group, source)?;
        Ok(Self {
            decoder: DatagramDecoder::new(sock),
            ctx,
        })
    }

    /// Parses datagrams and drives the upcall until shutdown is signalled.
    ///
    /// The datagram wait is the sole cancellation point; a loaded message
    /// is always consumed in full before the loop comes back around.
    pub async fn run(
        mut self,
        rcvr: Arc<dyn McastContentRcvr>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!("multicast receiver shutting down");
                    return Ok(());
                }
                loaded = self.decoder.fill(1) => loaded?,
            }
            let msg_id = self.decoder.decode_u8()?;
            match msg_id {
                PROD_INFO_MSGID => {
                    self.decoder.fill(0).await?;
                    let info: ProdInfo = self.decoder.decode(&self.ctx)?;
                    rcvr.receive_info(info).await?;
                }
                CHUNK_MSGID => {
                    self.decoder.fill(chunk_metadata_size(self.ctx.version)).await?;
                    let info = self.decoder.decode(&self.ctx)?;
                    let len = self.decoder.remaining();
                    let mut chunk = LatentChunk::new(info, len, &mut self.decoder);
                    rcvr.receive_chunk(&mut chunk).await?;
                    if chunk.has_data() {
                        return Err(Error::Logic(format!(
                            "latent chunk {info} still has data after the upcall"
                        )));
                    }
                }
                other => {
                    return Err(Error::Runtime(format!("invalid message type: {other}")));
                }
            }
            self.decoder.clear();
        }
    }
}
