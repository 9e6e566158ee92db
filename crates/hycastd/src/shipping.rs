//! Publisher façade: multicasts products once and serves backfill
//! requests from the product store over the peer overlay.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use hycast_core::prod::{ChunkInfo, ProdIndex, ProdInfo, Product};
use hycast_core::wire::WireCtx;
use hycast_core::Result;
use hycast_net::{LatentChunk, McastSender, Peer, PeerMsgRcvr};
use hycast_runtime::Completer;
use hycast_store::ProductStore;

struct ShippingInner {
    store: ProductStore,
    sender: McastSender,
    ctx: WireCtx,
    peers: DashMap<u64, Peer>,
    completer: Completer<()>,
    shutdown: broadcast::Sender<()>,
}

/// Publisher side: `ship()` products in, answer peer requests out.
#[derive(Clone)]
pub struct Shipping {
    inner: Arc<ShippingInner>,
}

impl Shipping {
    pub fn new(store: ProductStore, sender: McastSender, ctx: WireCtx) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(ShippingInner {
                store,
                sender,
                ctx,
                peers: DashMap::new(),
                completer: Completer::new(),
                shutdown,
            }),
        }
    }

    /// Ships a product: installs it in the store, multicasts it, and
    /// notifies every connected peer.
    pub async fn ship(&self, prod: Product) -> Result<()> {
        self.inner.store.add_product(&prod).await;
        self.inner.sender.send(&prod).await?;

        for peer in self.inner.peers.iter() {
            if let Err(err) = peer.send_prod_notice(prod.info()).await {
                tracing::warn!(peer = %*peer, error = %err, "product notice failed");
            }
        }
        tracing::info!(
            prod = %prod.info().index(),
            name = prod.info().name(),
            bytes = prod.info().size(),
            "product shipped"
        );
        Ok(())
    }

    /// Accepts subscriber connections and runs one receiver task per peer.
    /// Returns when shutdown is signalled.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            let accepted = tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("peer server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };
            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    continue;
                }
            };
            match Peer::accept(stream, self.inner.ctx).await {
                Ok((peer, receiver)) => {
                    tracing::info!(peer = %peer, "subscriber connected");
                    self.inner.peers.insert(peer.id(), peer);
                    let rcvr: Arc<dyn PeerMsgRcvr> = Arc::new(ShippingRcvr {
                        inner: self.inner.clone(),
                    });
                    let inner = self.inner.clone();
                    let shutdown_rx = self.inner.shutdown.subscribe();
                    let submitted = self.inner.completer.submit(async move {
                        let peer = receiver.peer();
                        let result = receiver.run(rcvr, shutdown_rx).await;
                        inner.peers.remove(&peer.id());
                        if let Err(err) = &result {
                            tracing::warn!(peer = %peer, error = %err, "peer receiver failed");
                        }
                        let _ = peer.close().await;
                        result
                    });
                    if let Err(err) = submitted {
                        tracing::warn!(error = %err, "peer task rejected");
                    }
                }
                Err(err) => {
                    tracing::warn!(%addr, error = %err, "peer handshake failed");
                }
            }
        }
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn store(&self) -> &ProductStore {
        &self.inner.store
    }

    /// Signals every task to stop and waits for them.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(());
        self.inner.completer.shutdown(false);
        if let Err(err) = self.inner.completer.await_termination().await {
            tracing::warn!(error = %err, "peer tasks did not terminate cleanly");
        }
    }
}

/// Upcall implementation answering peer requests from the store.
struct ShippingRcvr {
    inner: Arc<ShippingInner>,
}

#[async_trait]
impl PeerMsgRcvr for ShippingRcvr {
    async fn recv_prod_notice(&self, info: ProdInfo, peer: &Peer) -> Result<()> {
        tracing::trace!(peer = %peer, prod = %info.index(), "ignoring notice on the publisher side");
        Ok(())
    }

    async fn recv_chunk_notice(&self, info: ChunkInfo, peer: &Peer) -> Result<()> {
        tracing::trace!(peer = %peer, chunk = %info, "ignoring notice on the publisher side");
        Ok(())
    }

    async fn recv_prod_request(&self, index: ProdIndex, peer: &Peer) -> Result<()> {
        match self.inner.store.prod_info(index).await {
            Some(info) => peer.send_prod_notice(&info).await,
            None => {
                tracing::debug!(peer = %peer, prod = %index, "requested product unknown");
                Ok(())
            }
        }
    }

    async fn recv_chunk_request(&self, info: ChunkInfo, peer: &Peer) -> Result<()> {
        match self.inner.store.chunk(&info).await {
            Some(chunk) => peer.send_data(&chunk).await,
            None => {
                tracing::debug!(peer = %peer, chunk = %info, "requested chunk not held");
                Ok(())
            }
        }
    }

    async fn recv_data(&self, chunk: &mut LatentChunk<'_>, peer: &Peer) -> Result<()> {
        tracing::debug!(peer = %peer, chunk = %chunk.info(), "unexpected chunk on the publisher side");
        chunk.discard().await
    }
}
