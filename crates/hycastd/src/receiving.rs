//! Subscriber façade: merges the multicast feed and peer backfill into the
//! product store, requests noticed chunks it is missing, and reports every
//! completed product to the application.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;

use hycast_core::prod::{AddStatus, ChunkInfo, ProdIndex, ProdInfo};
use hycast_core::wire::WireCtx;
use hycast_core::Result;
use hycast_net::{
    LatentChunk, McastContentRcvr, McastReceiver, Peer, PeerMsgRcvr,
};
use hycast_runtime::Completer;
use hycast_store::ProductStore;

/// Invoked once per completed product with its info and assembled payload.
pub type CompletionFn = Arc<dyn Fn(ProdInfo, Bytes) + Send + Sync>;

struct ReceivingInner {
    store: ProductStore,
    ctx: WireCtx,
    peers: DashMap<u64, Peer>,
    completer: Completer<()>,
    shutdown: broadcast::Sender<()>,
    on_complete: CompletionFn,
}

/// Subscriber side: accepts multicast and peer input, backfills misses.
#[derive(Clone)]
pub struct Receiving {
    inner: Arc<ReceivingInner>,
}

impl Receiving {
    pub fn new(store: ProductStore, on_complete: CompletionFn, ctx: WireCtx) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(ReceivingInner {
                store,
                ctx,
                peers: DashMap::new(),
                completer: Completer::new(),
                shutdown,
                on_complete,
            }),
        }
    }

    /// Starts the multicast receiver, the store reaper, and one backfill
    /// connection per configured peer server. Connection failures are
    /// logged and skipped.
    pub async fn start(&self, mcast: McastReceiver, peer_addrs: &[SocketAddr]) -> Result<()> {
        let rcvr: Arc<dyn McastContentRcvr> = Arc::new(ReceivingRcvr {
            inner: self.inner.clone(),
        });
        let shutdown_rx = self.inner.shutdown.subscribe();
        self.inner
            .completer
            .submit(async move { mcast.run(rcvr, shutdown_rx).await })?;

        let store = self.inner.store.clone();
        let shutdown_rx = self.inner.shutdown.subscribe();
        self.inner
            .completer
            .submit(async move { store.run_reaper(shutdown_rx).await })?;

        for addr in peer_addrs {
            if let Err(err) = self.connect_peer(*addr).await {
                tracing::warn!(%addr, error = %err, "peer connection failed");
            }
        }
        Ok(())
    }

    /// Connects to a peer server and runs its receive loop.
    pub async fn connect_peer(&self, addr: SocketAddr) -> Result<Peer> {
        let (peer, receiver) = Peer::connect(addr, self.inner.ctx).await?;
        tracing::info!(peer = %peer, "backfill peer connected");
        self.inner.peers.insert(peer.id(), peer.clone());

        let rcvr: Arc<dyn PeerMsgRcvr> = Arc::new(ReceivingRcvr {
            inner: self.inner.clone(),
        });
        let inner = self.inner.clone();
        let shutdown_rx = self.inner.shutdown.subscribe();
        self.inner.completer.submit(async move {
            let peer = receiver.peer();
            let result = receiver.run(rcvr, shutdown_rx).await;
            inner.peers.remove(&peer.id());
            if let Err(err) = &result {
                tracing::warn!(peer = %peer, error = %err, "peer receiver failed");
            }
            let _ = peer.close().await;
            result
        })?;
        Ok(peer)
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
            tracing::warn!(error = %err, "receiver tasks did not terminate cleanly");
        }
    }
}

/// Upcall implementation feeding the store from both input paths.
struct ReceivingRcvr {
    inner: Arc<ReceivingInner>,
}

impl ReceivingRcvr {
    /// Fires the completion callback on a fresh completion.
    async fn after_add(&self, index: ProdIndex, status: AddStatus) {
        if !(status.is_complete && !status.is_duplicate) {
            return;
        }
        match self.inner.store.product(index).await {
            Some(prod) => {
                (self.inner.on_complete)(prod.info().clone(), prod.data().clone());
            }
            None => {
                tracing::warn!(prod = %index, "completed product missing from the store");
            }
        }
    }
}

#[async_trait]
impl McastContentRcvr for ReceivingRcvr {
    async fn receive_info(&self, info: ProdInfo) -> Result<()> {
        let status = self.inner.store.add_info(&info).await;
        self.after_add(info.index(), status).await;
        Ok(())
    }

    async fn receive_chunk(&self, chunk: &mut LatentChunk<'_>) -> Result<()> {
        let index = chunk.info().prod_index;
        let status = self.inner.store.add_latent(chunk).await?;
        self.after_add(index, status).await;
        Ok(())
    }
}

#[async_trait]
impl PeerMsgRcvr for ReceivingRcvr {
    async fn recv_prod_notice(&self, info: ProdInfo, _peer: &Peer) -> Result<()> {
        let status = self.inner.store.add_info(&info).await;
        self.after_add(info.index(), status).await;
        Ok(())
    }

    async fn recv_chunk_notice(&self, info: ChunkInfo, peer: &Peer) -> Result<()> {
        if !self.inner.store.have_chunk(&info).await {
            peer.send_chunk_request(&info).await?;
        }
        Ok(())
    }

    // Peers in the overlay are symmetric: a subscriber serves what it
    // already holds.

    async fn recv_prod_request(&self, index: ProdIndex, peer: &Peer) -> Result<()> {
        if let Some(info) = self.inner.store.prod_info(index).await {
            peer.send_prod_notice(&info).await?;
        }
        Ok(())
    }

    async fn recv_chunk_request(&self, info: ChunkInfo, peer: &Peer) -> Result<()> {
        if let Some(chunk) = self.inner.store.chunk(&info).await {
            peer.send_data(&chunk).await?;
        }
        Ok(())
    }

    async fn recv_data(&self, chunk: &mut LatentChunk<'_>, _peer: &Peer) -> Result<()> {
        let index = chunk.info().prod_index;
        let status = self.inner.store.add_latent(chunk).await?;
        self.after_add(index, status).await;
        Ok(())
    }
}
