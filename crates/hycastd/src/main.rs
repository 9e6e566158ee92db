//! hycastd — Hycast dissemination daemon.
//!
//! `hycastd ship` multicasts products named on stdin (one file path per
//! line) and serves backfill requests; `hycastd receive` reassembles them
//! into an output directory. Everything else comes from the config file.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpListener;

use hycast_core::config::HycastConfig;
use hycast_core::prod::{ProdIndex, ProdInfo, Product};
use hycast_core::wire::WireCtx;
use hycast_net::{McastReceiver, McastSender};
use hycast_store::{ProductStore, StoreOptions};
use hycastd::{Receiving, Shipping};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let role = std::env::args().nth(1).unwrap_or_default();
    let config = HycastConfig::load().context("failed to load configuration")?;
    tracing::info!(role, config = %HycastConfig::file_path().display(), "hycastd starting");

    let ctx = WireCtx::with_chunk_size(config.protocol.version, config.protocol.chunk_size);
    let store = ProductStore::new(StoreOptions {
        residence: Duration::from_secs(config.store.residence_secs),
        persistence_path: config.store.persistence_path.clone(),
        early_chunk_cap_bytes: config.store.early_chunk_cap_bytes,
    });

    let group: SocketAddr = config
        .mcast
        .group_addr
        .parse()
        .with_context(|| format!("bad multicast group: {}", config.mcast.group_addr))?;

    match role.as_str() {
        "ship" => ship(config, store, group, ctx).await,
        "receive" => receive(config, store, group, ctx).await,
        other => bail!("usage: hycastd <ship|receive> — got {other:?}"),
    }
}

async fn ship(
    config: HycastConfig,
    store: ProductStore,
    group: SocketAddr,
    ctx: WireCtx,
) -> Result<()> {
    let sender = McastSender::new(group, config.mcast.hop_limit, config.mcast.loop_enabled, ctx)
        .context("failed to create multicast sender")?;
    let shipping = Shipping::new(store.clone(), sender, ctx);

    let listener = TcpListener::bind(config.p2p.listen_addr.as_str())
        .await
        .with_context(|| format!("failed to bind peer server at {}", config.p2p.listen_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "peer server listening");

    let server = {
        let shipping = shipping.clone();
        tokio::spawn(async move { shipping.serve(listener).await })
    };

    // Product feed: one file path per stdin line.
    let next_index = AtomicU32::new(0);
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let path = match line? {
                    Some(line) if !line.trim().is_empty() => PathBuf::from(line.trim()),
                    Some(_) => continue,
                    None => break,
                };
                match load_product(&path, next_index.fetch_add(1, Ordering::Relaxed), ctx) {
                    Ok(prod) => {
                        if let Err(err) = shipping.ship(prod).await {
                            tracing::error!(path = %path.display(), error = %err, "shipping failed");
                        }
                    }
                    Err(err) => tracing::error!(path = %path.display(), error = %err, "unreadable product"),
                }
            }
        }
    }

    tracing::info!("shutting down");
    shipping.shutdown().await;
    server.abort();
    store.close().await;
    Ok(())
}

fn load_product(path: &std::path::Path, index: u32, ctx: WireCtx) -> Result<Product> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("unnamed")
        .to_string();
    let size = u32::try_from(data.len()).context("product larger than 4 GiB")?;
    let info = ProdInfo::new(ProdIndex(index), name, size, ctx.canon_chunk_size)?;
    Ok(Product::new(info, Bytes::from(data))?)
}

async fn receive(
    config: HycastConfig,
    store: ProductStore,
    group: SocketAddr,
    ctx: WireCtx,
) -> Result<()> {
    let source = match &config.mcast.source_addr {
        Some(addr) => Some(
            addr.parse()
                .with_context(|| format!("bad multicast source: {addr}"))?,
        ),
        None => None,
    };
    let mcast = McastReceiver::new(group, source, ctx).context("failed to join multicast group")?;

    let output_dir = std::env::args()
        .nth(2)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp/hycast-received"));
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;

    let on_complete: hycastd::CompletionFn = {
        let output_dir = output_dir.clone();
        Arc::new(move |info: ProdInfo, data: Bytes| {
            let path = output_dir.join(info.name());
            match std::fs::write(&path, &data) {
                Ok(()) => tracing::info!(
                    prod = %info.index(),
                    bytes = info.size(),
                    path = %path.display(),
                    "product received and written"
                ),
                Err(err) => tracing::error!(
                    prod = %info.index(),
                    error = %err,
                    "failed to write completed product"
                ),
            }
        })
    };

    let receiving = Receiving::new(store.clone(), on_complete, ctx);
    let mut peer_addrs = Vec::new();
    for addr in &config.p2p.peer_addrs {
        peer_addrs.push(
            addr.parse::<SocketAddr>()
                .with_context(|| format!("bad peer address: {addr}"))?,
        );
    }
    receiving.start(mcast, &peer_addrs).await?;
    tracing::info!(
        group = %group,
        peers = peer_addrs.len(),
        output = %output_dir.display(),
        "receiving"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    receiving.shutdown().await;
    store.close().await;
    Ok(())
}
