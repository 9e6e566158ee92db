//! Peer-driven backfill: a subscriber with nothing but a product request
//! pulls the whole product from a peer that holds it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use hycast_core::prod::{ChunkInfo, ProdIndex, ProdInfo, Product};
use hycast_core::wire::WireCtx;
use hycast_core::Result;
use hycast_net::{LatentChunk, Peer, PeerMsgRcvr};
use hycast_store::{ProductStore, StoreOptions};

/// Serves requests from its store — the publisher half of the overlay.
struct Server {
    store: ProductStore,
}

#[async_trait]
impl PeerMsgRcvr for Server {
    async fn recv_prod_notice(&self, _info: ProdInfo, _peer: &Peer) -> Result<()> {
        Ok(())
    }

    async fn recv_chunk_notice(&self, _info: ChunkInfo, _peer: &Peer) -> Result<()> {
        Ok(())
    }

    async fn recv_prod_request(&self, index: ProdIndex, peer: &Peer) -> Result<()> {
        if let Some(info) = self.store.prod_info(index).await {
            peer.send_prod_notice(&info).await?;
        }
        Ok(())
    }

    async fn recv_chunk_request(&self, info: ChunkInfo, peer: &Peer) -> Result<()> {
        if let Some(chunk) = self.store.chunk(&info).await {
            peer.send_data(&chunk).await?;
        }
        Ok(())
    }

    async fn recv_data(&self, chunk: &mut LatentChunk<'_>, _peer: &Peer) -> Result<()> {
        chunk.discard().await
    }
}

/// Collects into its store and requests whatever is still missing.
struct Client {
    store: ProductStore,
    done: mpsc::UnboundedSender<ProdIndex>,
}

impl Client {
    async fn request_missing(&self, peer: &Peer) -> Result<()> {
        if let Some(missing) = self.store.oldest_missing_chunk().await {
            peer.send_chunk_request(&missing).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerMsgRcvr for Client {
    async fn recv_prod_notice(&self, info: ProdInfo, peer: &Peer) -> Result<()> {
        let status = self.store.add_info(&info).await;
        if status.is_complete {
            let _ = self.done.send(info.index());
        } else {
            // Ask for every missing chunk up front.
            for index in 0..info.chunk_count() {
                let chunk_info = info.chunk_info(index).unwrap();
                if !self.store.have_chunk(&chunk_info).await {
                    peer.send_chunk_request(&chunk_info).await?;
                }
            }
        }
        Ok(())
    }

    async fn recv_chunk_notice(&self, info: ChunkInfo, peer: &Peer) -> Result<()> {
        if !self.store.have_chunk(&info).await {
            peer.send_chunk_request(&info).await?;
        }
        Ok(())
    }

    async fn recv_prod_request(&self, _index: ProdIndex, _peer: &Peer) -> Result<()> {
        Ok(())
    }

    async fn recv_chunk_request(&self, _info: ChunkInfo, _peer: &Peer) -> Result<()> {
        Ok(())
    }

    async fn recv_data(&self, chunk: &mut LatentChunk<'_>, peer: &Peer) -> Result<()> {
        let index = chunk.info().prod_index;
        let status = self.store.add_latent(chunk).await?;
        if status.is_complete && !status.is_duplicate {
            let _ = self.done.send(index);
        } else {
            self.request_missing(peer).await?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn subscriber_backfills_a_whole_product_from_a_peer() {
    let ctx = WireCtx::with_chunk_size(1, 1024);

    // Publisher holds the complete product.
    let server_store = ProductStore::new(StoreOptions::default());
    let data: Bytes = (0..10_000u32).map(|byte| byte as u8).collect();
    let info = ProdInfo::new(ProdIndex(7), "backfilled", 10_000, 1024).unwrap();
    let prod = Product::new(info.clone(), data.clone()).unwrap();
    server_store.add_product(&prod).await;

    let client_store = ProductStore::new(StoreOptions::default());
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let (io_a, io_b) = tokio::io::duplex(512 * 1024);
    let server_side = tokio::spawn(Peer::from_io(Box::new(io_a), ctx));
    let client_side = tokio::spawn(Peer::from_io(Box::new(io_b), ctx));
    let (_server_peer, server_rx) = server_side.await.unwrap().unwrap();
    let (client_peer, client_rx) = client_side.await.unwrap().unwrap();

    let (shutdown_tx, _) = broadcast::channel(1);
    tokio::spawn(server_rx.run(
        Arc::new(Server {
            store: server_store,
        }),
        shutdown_tx.subscribe(),
    ));
    tokio::spawn(client_rx.run(
        Arc::new(Client {
            store: client_store.clone(),
            done: done_tx,
        }),
        shutdown_tx.subscribe(),
    ));

    // The subscriber knows only the index and asks the overlay.
    client_peer.send_prod_request(ProdIndex(7)).await.unwrap();

    let completed = tokio::time::timeout(std::time::Duration::from_secs(10), done_rx.recv())
        .await
        .expect("backfill timed out")
        .expect("done channel closed");
    assert_eq!(completed, ProdIndex(7));

    let assembled = client_store.product(ProdIndex(7)).await.unwrap();
    assert_eq!(assembled.info(), &info);
    assert_eq!(assembled.data(), &data);

    let _ = shutdown_tx.send(());
}
