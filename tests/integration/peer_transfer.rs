//! Two connected peers exchange every message kind the protocol carries.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use hycast_core::prod::{ActualChunk, ChunkInfo, ProdIndex, ProdInfo};
use hycast_core::wire::WireCtx;
use hycast_core::Result;
use hycast_net::{LatentChunk, Peer, PeerMsgRcvr, PeerReceiver};

#[derive(Debug, PartialEq)]
enum Event {
    ProdNotice(ProdInfo),
    ChunkNotice(ChunkInfo),
    ProdRequest(ProdIndex),
    ChunkRequest(ChunkInfo),
    Data(ChunkInfo, Vec<u8>),
}

struct Recorder {
    events: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl PeerMsgRcvr for Recorder {
    async fn recv_prod_notice(&self, info: ProdInfo, _peer: &Peer) -> Result<()> {
        let _ = self.events.send(Event::ProdNotice(info));
        Ok(())
    }

    async fn recv_chunk_notice(&self, info: ChunkInfo, _peer: &Peer) -> Result<()> {
        let _ = self.events.send(Event::ChunkNotice(info));
        Ok(())
    }

    async fn recv_prod_request(&self, index: ProdIndex, _peer: &Peer) -> Result<()> {
        let _ = self.events.send(Event::ProdRequest(index));
        Ok(())
    }

    async fn recv_chunk_request(&self, info: ChunkInfo, _peer: &Peer) -> Result<()> {
        let _ = self.events.send(Event::ChunkRequest(info));
        Ok(())
    }

    async fn recv_data(&self, chunk: &mut LatentChunk<'_>, _peer: &Peer) -> Result<()> {
        let mut payload = vec![0u8; chunk.len()];
        chunk.drain_into(&mut payload).await?;
        let _ = self.events.send(Event::Data(chunk.info(), payload));
        Ok(())
    }
}

async fn connected_pair() -> ((Peer, PeerReceiver), (Peer, PeerReceiver)) {
    let (a, b) = tokio::io::duplex(512 * 1024);
    let ctx = WireCtx::new(1);
    let left = tokio::spawn(Peer::from_io(Box::new(a), ctx));
    let right = tokio::spawn(Peer::from_io(Box::new(b), ctx));
    (
        left.await.unwrap().unwrap(),
        right.await.unwrap().unwrap(),
    )
}

#[tokio::test]
async fn peer_carries_all_five_message_kinds() {
    let ((sender, _sender_rx), (_receiver_peer, receiver_rx)) = connected_pair().await;

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let loop_task = tokio::spawn(receiver_rx.run(
        Arc::new(Recorder { events: events_tx }),
        shutdown_rx,
    ));

    let info = ProdInfo::new(ProdIndex(1), "product", 100_000, 1400).unwrap();
    let chunk_info = ChunkInfo::new(ProdIndex(2), 2000, 3);
    let payload: Vec<u8> = (0..2000u32).map(|byte| byte as u8).collect();

    sender.send_prod_notice(&info).await.unwrap();
    sender.send_chunk_notice(&chunk_info).await.unwrap();
    sender.send_prod_request(ProdIndex(2)).await.unwrap();
    sender.send_chunk_request(&chunk_info).await.unwrap();
    sender
        .send_data(&ActualChunk {
            info: ChunkInfo::new(ProdIndex(2), 2000, 0),
            data: Bytes::from(payload.clone()),
        })
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..5 {
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a peer message")
            .expect("receive loop dropped the event channel");
        seen.push(event);
    }

    assert_eq!(seen[0], Event::ProdNotice(info));
    assert_eq!(seen[1], Event::ChunkNotice(chunk_info));
    assert_eq!(seen[2], Event::ProdRequest(ProdIndex(2)));
    assert_eq!(seen[3], Event::ChunkRequest(chunk_info));
    match &seen[4] {
        Event::Data(info, data) => {
            assert_eq!(*info, ChunkInfo::new(ProdIndex(2), 2000, 0));
            assert_eq!(data.len(), 2000);
            assert_eq!(*data, payload);
        }
        other => panic!("expected chunk data, got {other:?}"),
    }

    shutdown_tx.send(()).unwrap();
    loop_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn receive_loop_ends_cleanly_when_the_remote_closes() {
    let ((sender, _sender_rx), (_receiver_peer, receiver_rx)) = connected_pair().await;

    let (events_tx, _events) = mpsc::unbounded_channel();
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let loop_task = tokio::spawn(receiver_rx.run(
        Arc::new(Recorder { events: events_tx }),
        shutdown_rx,
    ));

    sender.close().await.unwrap();
    drop(sender);
    drop(_sender_rx);

    loop_task.await.unwrap().unwrap();
}
