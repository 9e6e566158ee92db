//! The product store — a concurrent cache of in-flight and recently
//! completed products.
//!
//! Chunk arrivals from the multicast feed and any number of peers merge
//! into one entry per product index. Duplicates are dropped, completion is
//! detected exactly once, completed products are evicted after a residency
//! period, and the earliest missing chunk is available for backfill
//! requests.
//!
//! One coarse mutex protects the entry map, the bitmaps, and the
//! missing-chunk cursor. The lock is held across latent-chunk drains so a
//! payload streams from the transport straight into the entry's buffer.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::{broadcast, Mutex};

use hycast_core::prod::{ActualChunk, AddStatus, ChunkInfo, ProdIndex, ProdInfo, Product};
use hycast_core::wire::{self, Wire, WireCtx};
use hycast_core::{Error, Result};
use hycast_net::LatentChunk;
use hycast_runtime::DelayQueue;

use crate::bitmap::ChunkBitmap;

/// Magic and format version leading a persistence snapshot.
const SNAPSHOT_MAGIC: &[u8; 4] = b"HYCS";
const SNAPSHOT_VERSION: u32 = 1;

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Minimum time a completed product stays resident.
    pub residence: Duration,
    /// Snapshot file restored at startup and written by `close()`.
    pub persistence_path: Option<PathBuf>,
    /// Byte budget for chunks that arrive before their product's info.
    pub early_chunk_cap_bytes: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            residence: Duration::from_secs(3600),
            persistence_path: None,
            early_chunk_cap_bytes: 8 * 1024 * 1024,
        }
    }
}

// ── Entry ─────────────────────────────────────────────────────────────────────

enum EntryData {
    /// No ProdInfo yet; chunk payloads wait in the early map.
    Pending,
    /// Buffer allocated from the ProdInfo; chunks land at their offsets.
    Filling(Vec<u8>),
    /// Frozen at completion; chunk reads are zero-copy slices.
    Complete(Bytes),
}

struct ProductEntry {
    info: Option<ProdInfo>,
    present: Option<ChunkBitmap>,
    data: EntryData,
    /// Chunks received before the ProdInfo, keyed by chunk index.
    early: BTreeMap<u32, Bytes>,
    /// Product size the early chunks declared.
    early_size: Option<u32>,
    complete: bool,
    inserted: Instant,
}

impl ProductEntry {
    fn pending() -> Self {
        Self {
            info: None,
            present: None,
            data: EntryData::Pending,
            early: BTreeMap::new(),
            early_size: None,
            complete: false,
            inserted: Instant::now(),
        }
    }
}

struct State {
    entries: BTreeMap<u32, ProductEntry>,
    early_bytes: u64,
    /// Lazily recomputed oldest-missing cursor; None = needs recompute.
    oldest_missing: Option<Option<ChunkInfo>>,
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// Thread-safe product store. Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct ProductStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    state: Mutex<State>,
    options: StoreOptions,
    /// Completed product indices scheduled for eviction.
    reap_queue: DelayQueue<ProdIndex>,
}

impl ProductStore {
    /// Creates the store, restoring the persistence snapshot if one is
    /// configured and present. A restore failure starts empty (reported,
    /// not fatal).
    pub fn new(options: StoreOptions) -> Self {
        let store = Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(State {
                    entries: BTreeMap::new(),
                    early_bytes: 0,
                    oldest_missing: Some(None),
                }),
                options,
                reap_queue: DelayQueue::new(),
            }),
        };
        if let Some(path) = store.inner.options.persistence_path.clone() {
            if path.exists() {
                match store.restore(&path) {
                    Ok(count) => {
                        tracing::info!(path = %path.display(), products = count, "product store restored");
                    }
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "snapshot restore failed; starting empty");
                    }
                }
            }
        }
        store
    }

    /// Adds an entire product. Idempotent: an existing entry transitions to
    /// complete, a complete one reports a duplicate.
    pub async fn add_product(&self, prod: &Product) -> AddStatus {
        let mut state = self.inner.state.lock().await;
        let key = prod.info().index().0;
        let entry = state.entries.entry(key).or_insert_with(ProductEntry::pending);
        let was_new = entry.info.is_none() && entry.early.is_empty();
        if entry.complete {
            return AddStatus::new().set_duplicate().set_complete();
        }

        let freed: u64 = entry.early.values().map(|b| b.len() as u64).sum();
        entry.early.clear();
        entry.info = Some(prod.info().clone());
        entry.present = Some(ChunkBitmap::full(prod.info().chunk_count()));
        entry.data = EntryData::Complete(prod.data().clone());
        entry.complete = true;
        state.early_bytes -= freed;
        state.oldest_missing = None;
        drop(state);

        self.schedule_reap(prod.info().index());
        let status = if was_new {
            AddStatus::new().set_new().set_complete()
        } else {
            AddStatus::new().set_complete()
        };
        tracing::debug!(prod = %prod.info().index(), "whole product added");
        status
    }

    /// Adds product information, creating the entry (and its buffer) if
    /// absent and merging any early chunks. May complete the product.
    pub async fn add_info(&self, info: &ProdInfo) -> AddStatus {
        let mut state = self.inner.state.lock().await;
        let key = info.index().0;
        let entry = state.entries.entry(key).or_insert_with(ProductEntry::pending);

        if let Some(existing) = &entry.info {
            let mut status = AddStatus::new().set_duplicate();
            if existing != info {
                tracing::warn!(prod = %info.index(), "conflicting product info ignored");
            }
            if entry.complete {
                status = status.set_complete();
            }
            return status;
        }

        let was_new = entry.early.is_empty();
        let mut buf = vec![0u8; info.size() as usize];
        let mut present = ChunkBitmap::new(info.chunk_count());

        // Fold in chunks that beat the info here.
        let mut freed = 0u64;
        for (index, data) in std::mem::take(&mut entry.early) {
            freed += data.len() as u64;
            let fits = info
                .chunk_size_at(index)
                .is_ok_and(|want| usize::from(want) == data.len());
            if !fits {
                tracing::warn!(prod = %info.index(), chunk = index, "early chunk inconsistent with product info; dropped");
                continue;
            }
            let offset = index as usize * usize::from(info.chunk_size());
            buf[offset..offset + data.len()].copy_from_slice(&data);
            present.set(index);
        }

        entry.info = Some(info.clone());
        entry.early_size = None;
        let complete = present.is_full();
        if complete {
            entry.data = EntryData::Complete(Bytes::from(buf));
            entry.complete = true;
        } else {
            entry.data = EntryData::Filling(buf);
        }
        entry.present = Some(present);
        state.early_bytes -= freed;
        state.oldest_missing = None;
        drop(state);

        let mut status = if was_new {
            AddStatus::new().set_new()
        } else {
            AddStatus::new()
        };
        if complete {
            status = status.set_complete();
            self.schedule_reap(info.index());
            tracing::info!(prod = %info.index(), name = info.name(), "product complete");
        }
        status
    }

    /// Adds a latent chunk, draining it exactly once into the entry's
    /// buffer at the derived offset. Duplicates and inconsistent chunks are
    /// discarded locally; the handle is empty on every return path.
    pub async fn add_latent(&self, chunk: &mut LatentChunk<'_>) -> Result<AddStatus> {
        let info = chunk.info();
        let key = info.prod_index.0;
        let mut state = self.inner.state.lock().await;
        let entry = state.entries.entry(key).or_insert_with(ProductEntry::pending);
        let was_new = entry.info.is_none() && entry.early.is_empty();

        match (&entry.info, entry.complete) {
            (_, true) => {
                chunk.discard().await?;
                Ok(AddStatus::new().set_duplicate().set_complete())
            }
            (Some(prod_info), false) => {
                if prod_info.size() != info.prod_size {
                    tracing::warn!(prod = %info.prod_index, "chunk declares a different product size; dropped");
                    chunk.discard().await?;
                    return Ok(AddStatus::new());
                }
                let want = match prod_info.chunk_size_at(info.chunk_index) {
                    Ok(want) => usize::from(want),
                    Err(_) => {
                        tracing::warn!(prod = %info.prod_index, chunk = info.chunk_index, "chunk index out of range; dropped");
                        chunk.discard().await?;
                        return Ok(AddStatus::new());
                    }
                };
                if want != chunk.len() {
                    tracing::warn!(
                        prod = %info.prod_index,
                        chunk = info.chunk_index,
                        expected = want,
                        actual = chunk.len(),
                        "chunk payload size mismatch; dropped"
                    );
                    chunk.discard().await?;
                    return Ok(AddStatus::new());
                }
                let present = match entry.present.as_mut() {
                    Some(present) => present,
                    None => {
                        return Err(Error::Logic("entry with info lacks a bitmap".into()));
                    }
                };
                if present.test(info.chunk_index) {
                    chunk.discard().await?;
                    return Ok(AddStatus::new().set_duplicate());
                }
                let offset = info.chunk_index as usize * usize::from(prod_info.chunk_size());
                let buf = match &mut entry.data {
                    EntryData::Filling(buf) => buf,
                    _ => return Err(Error::Logic("incomplete entry without a filling buffer".into())),
                };
                chunk.drain_into(&mut buf[offset..offset + want]).await?;
                present.set(info.chunk_index);

                let mut status = AddStatus::new();
                if present.is_full() {
                    let buf = std::mem::replace(&mut entry.data, EntryData::Pending);
                    if let EntryData::Filling(buf) = buf {
                        entry.data = EntryData::Complete(Bytes::from(buf));
                    }
                    entry.complete = true;
                    status = status.set_complete();
                    let index = info.prod_index;
                    let name = entry.info.as_ref().map(|i| i.name().to_string());
                    state.oldest_missing = None;
                    drop(state);
                    self.schedule_reap(index);
                    tracing::info!(prod = %index, name = name.as_deref().unwrap_or(""), "product complete");
                } else {
                    state.oldest_missing = None;
                }
                Ok(status)
            }
            (None, false) => {
                // Info not seen yet: buffer the payload under the cap.
                if entry.early.contains_key(&info.chunk_index) {
                    chunk.discard().await?;
                    return Ok(AddStatus::new().set_duplicate());
                }
                if entry.early_size.is_some_and(|size| size != info.prod_size) {
                    tracing::warn!(prod = %info.prod_index, "early chunk declares a different product size; dropped");
                    chunk.discard().await?;
                    return Ok(AddStatus::new());
                }
                let len = chunk.len() as u64;
                if state.early_bytes + len > self.inner.options.early_chunk_cap_bytes {
                    tracing::warn!(
                        prod = %info.prod_index,
                        chunk = info.chunk_index,
                        "early-chunk budget exhausted; chunk dropped"
                    );
                    chunk.discard().await?;
                    return Ok(AddStatus::new());
                }
                let mut buf = BytesMut::zeroed(chunk.len());
                chunk.drain_into(&mut buf).await?;
                let entry = state
                    .entries
                    .get_mut(&key)
                    .ok_or_else(|| Error::Logic("entry vanished during a latent add".into()))?;
                entry.early.insert(info.chunk_index, buf.freeze());
                entry.early_size = Some(info.prod_size);
                state.early_bytes += len;
                state.oldest_missing = None;
                Ok(if was_new {
                    AddStatus::new().set_new()
                } else {
                    AddStatus::new()
                })
            }
        }
    }

    /// Product information, iff known.
    pub async fn prod_info(&self, index: ProdIndex) -> Option<ProdInfo> {
        let state = self.inner.state.lock().await;
        state.entries.get(&index.0).and_then(|entry| entry.info.clone())
    }

    /// True iff the referenced chunk is held and consistent.
    pub async fn have_chunk(&self, info: &ChunkInfo) -> bool {
        let state = self.inner.state.lock().await;
        let entry = match state.entries.get(&info.prod_index.0) {
            Some(entry) => entry,
            None => return false,
        };
        match (&entry.info, &entry.present) {
            (Some(prod_info), Some(present)) => {
                prod_info.size() == info.prod_size && present.test(info.chunk_index)
            }
            _ => {
                entry.early_size == Some(info.prod_size)
                    && entry.early.contains_key(&info.chunk_index)
            }
        }
    }

    /// The chunk's payload, if held. Complete entries serve zero-copy
    /// slices; in-flight entries serve a copy.
    pub async fn chunk(&self, info: &ChunkInfo) -> Option<ActualChunk> {
        let state = self.inner.state.lock().await;
        let entry = state.entries.get(&info.prod_index.0)?;
        match (&entry.info, &entry.present) {
            (Some(prod_info), Some(present)) => {
                if prod_info.size() != info.prod_size || !present.test(info.chunk_index) {
                    return None;
                }
                let offset = info.chunk_index as usize * usize::from(prod_info.chunk_size());
                let len = usize::from(prod_info.chunk_size_at(info.chunk_index).ok()?);
                let data = match &entry.data {
                    EntryData::Complete(bytes) => bytes.slice(offset..offset + len),
                    EntryData::Filling(buf) => Bytes::copy_from_slice(&buf[offset..offset + len]),
                    EntryData::Pending => return None,
                };
                Some(ActualChunk { info: *info, data })
            }
            _ => entry.early.get(&info.chunk_index).map(|data| ActualChunk {
                info: *info,
                data: data.clone(),
            }),
        }
    }

    /// The assembled product, iff complete. Zero-copy: the returned payload
    /// shares the entry's frozen buffer.
    pub async fn product(&self, index: ProdIndex) -> Option<Product> {
        let state = self.inner.state.lock().await;
        let entry = state.entries.get(&index.0)?;
        if !entry.complete {
            return None;
        }
        match (&entry.info, &entry.data) {
            (Some(info), EntryData::Complete(bytes)) => {
                Product::new(info.clone(), bytes.clone()).ok()
            }
            _ => None,
        }
    }

    /// The earliest-indexed missing chunk across all incomplete entries, in
    /// (product, chunk) lexicographic order. None when nothing is missing.
    pub async fn oldest_missing_chunk(&self) -> Option<ChunkInfo> {
        let mut state = self.inner.state.lock().await;
        if let Some(cached) = state.oldest_missing {
            return cached;
        }
        let mut found = None;
        for (key, entry) in &state.entries {
            if entry.complete {
                continue;
            }
            let (info, present) = match (&entry.info, &entry.present) {
                (Some(info), Some(present)) => (info, present),
                // Without info the chunk count is unknown; nothing to report.
                _ => continue,
            };
            if let Some(missing) = present.first_clear() {
                found = Some(ChunkInfo::new(ProdIndex(*key), info.size(), missing));
                break;
            }
        }
        state.oldest_missing = Some(found);
        found
    }

    /// Snapshot iterator over present chunks in (product, chunk) order,
    /// starting at or after `start`. Later additions are not observed.
    pub async fn chunk_iter(&self, start: ChunkInfo) -> ChunkInfoIterator {
        let state = self.inner.state.lock().await;
        let mut products = Vec::new();
        for (key, entry) in state.entries.range(start.prod_index.0..) {
            let from = if *key == start.prod_index.0 {
                start.chunk_index
            } else {
                0
            };
            let (size, chunks) = match (&entry.info, &entry.present) {
                (Some(info), Some(present)) => {
                    let mut chunks = Vec::new();
                    let mut next = present.next_set(from);
                    while let Some(index) = next {
                        chunks.push(index);
                        next = present.next_set(index + 1);
                    }
                    (info.size(), chunks)
                }
                _ => {
                    // Early-only entry: the chunk infos carried the size.
                    let chunks: Vec<u32> =
                        entry.early.range(from..).map(|(index, _)| *index).collect();
                    (entry.early_size.unwrap_or(0), chunks)
                }
            };
            if !chunks.is_empty() {
                products.push(ProdChunks {
                    prod_index: ProdIndex(*key),
                    prod_size: size,
                    chunks,
                });
            }
        }
        ChunkInfoIterator {
            products,
            outer: 0,
            inner: 0,
        }
    }

    /// Number of entries, complete and incomplete.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.state.lock().await.entries.is_empty()
    }

    fn schedule_reap(&self, index: ProdIndex) {
        self.inner
            .reap_queue
            .push(index, self.inner.options.residence);
    }

    /// Evicts products past their residency. Complete entries are reaped
    /// when their scheduled time arrives; incomplete entries are swept once
    /// they are older than twice the residence time. Runs until shutdown.
    pub async fn run_reaper(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let residence = self.inner.options.residence;
        let sweep_every = residence.max(Duration::from_secs(1));
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!("store reaper shutting down");
                    return Ok(());
                }
                index = self.inner.reap_queue.pop() => {
                    let mut state = self.inner.state.lock().await;
                    if state.entries.get(&index.0).is_some_and(|entry| entry.complete) {
                        state.entries.remove(&index.0);
                        state.oldest_missing = None;
                        tracing::debug!(prod = %index, "complete product evicted");
                    }
                }
                _ = sweep.tick() => {
                    let cutoff = residence * 2;
                    let mut state = self.inner.state.lock().await;
                    let mut freed = 0u64;
                    state.entries.retain(|key, entry| {
                        let stale = !entry.complete && entry.inserted.elapsed() > cutoff;
                        if stale {
                            freed += entry.early.values().map(|b| b.len() as u64).sum::<u64>();
                            tracing::warn!(prod = *key, "incomplete product evicted after 2x residence");
                        }
                        !stale
                    });
                    state.early_bytes -= freed;
                    if freed > 0 {
                        state.oldest_missing = None;
                    }
                }
            }
        }
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    /// Writes the snapshot (if a path is configured) and logs failures
    /// without disturbing in-memory state.
    pub async fn close(&self) {
        let path = match &self.inner.options.persistence_path {
            Some(path) => path.clone(),
            None => return,
        };
        let state = self.inner.state.lock().await;
        match self.persist(&state, &path) {
            Ok(count) => {
                tracing::info!(path = %path.display(), products = count, "product store persisted");
            }
            Err(err) => {
                tracing::error!(path = %path.display(), error = %err, "product store persistence failed");
            }
        }
    }

    /// Snapshot format: magic, format version, then per entry the ProdInfo,
    /// a length-prefixed bitmap, and the full buffer. Entries without info
    /// can't be framed and are skipped. Written to a temp file, then
    /// atomically renamed.
    fn persist(&self, state: &State, path: &Path) -> Result<usize> {
        let ctx = WireCtx::new(SNAPSHOT_VERSION);
        let tmp_path = path.with_extension("tmp");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::io::BufWriter::new(std::fs::File::create(&tmp_path)?);
        file.write_all(SNAPSHOT_MAGIC)?;
        file.write_all(&SNAPSHOT_VERSION.to_be_bytes())?;

        let mut count = 0;
        for entry in state.entries.values() {
            let (info, present) = match (&entry.info, &entry.present) {
                (Some(info), Some(present)) => (info, present),
                _ => continue,
            };
            let mut header = BytesMut::new();
            info.encode(&mut header, &ctx)?;
            let bitmap = present.to_bytes();
            header.extend_from_slice(&(bitmap.len() as u32).to_be_bytes());
            file.write_all(&header)?;
            file.write_all(&bitmap)?;
            match &entry.data {
                EntryData::Complete(bytes) => file.write_all(bytes)?,
                EntryData::Filling(buf) => file.write_all(buf)?,
                EntryData::Pending => {
                    return Err(Error::Logic("entry with info lacks a buffer".into()));
                }
            }
            count += 1;
        }
        file.into_inner()
            .map_err(|e| Error::Runtime(format!("snapshot flush failed: {e}")))?
            .sync_all()?;
        std::fs::rename(&tmp_path, path)?;
        Ok(count)
    }

    fn restore(&self, path: &Path) -> Result<usize> {
        let ctx = WireCtx::new(SNAPSHOT_VERSION);
        let mut raw = Vec::new();
        std::fs::File::open(path)?.read_to_end(&mut raw)?;
        let mut buf = Bytes::from(raw);

        let mut magic = [0u8; 4];
        if buf.len() < 8 {
            return Err(Error::Runtime("snapshot too short for its header".into()));
        }
        use bytes::Buf;
        buf.copy_to_slice(&mut magic);
        let version = buf.get_u32();
        if &magic != SNAPSHOT_MAGIC || version != SNAPSHOT_VERSION {
            return Err(Error::Runtime(format!(
                "unrecognized snapshot format (version {version})"
            )));
        }

        let mut state = self
            .inner
            .state
            .try_lock()
            .map_err(|_| Error::Logic("restore while the store is in use".into()))?;
        let mut count = 0;
        while buf.has_remaining() {
            let info = ProdInfo::decode(&mut buf, &ctx)?;
            let bitmap_len = wire::get_u32(&mut buf)? as usize;
            if buf.remaining() < bitmap_len + info.size() as usize {
                return Err(Error::ShortMessage {
                    needed: bitmap_len + info.size() as usize,
                    available: buf.remaining(),
                });
            }
            let present = ChunkBitmap::from_bytes(info.chunk_count(), &buf.copy_to_bytes(bitmap_len))?;
            let data = buf.copy_to_bytes(info.size() as usize);
            let complete = present.is_full();

            let entry = ProductEntry {
                data: if complete {
                    EntryData::Complete(data)
                } else {
                    EntryData::Filling(data.to_vec())
                },
                info: Some(info.clone()),
                present: Some(present),
                early: BTreeMap::new(),
                early_size: None,
                complete,
                inserted: Instant::now(),
            };
            state.entries.insert(info.index().0, entry);
            if complete {
                self.schedule_reap(info.index());
            }
            count += 1;
        }
        state.oldest_missing = None;
        Ok(count)
    }
}

// ── Iterator ──────────────────────────────────────────────────────────────────

struct ProdChunks {
    prod_index: ProdIndex,
    prod_size: u32,
    chunks: Vec<u32>,
}

/// Snapshot iterator over present chunks; see
/// [`ProductStore::chunk_iter`].
pub struct ChunkInfoIterator {
    products: Vec<ProdChunks>,
    outer: usize,
    inner: usize,
}

impl Iterator for ChunkInfoIterator {
    type Item = ChunkInfo;

    fn next(&mut self) -> Option<ChunkInfo> {
        while self.outer < self.products.len() {
            let prod = &self.products[self.outer];
            if self.inner < prod.chunks.len() {
                let info = ChunkInfo::new(prod.prod_index, prod.prod_size, prod.chunks[self.inner]);
                self.inner += 1;
                return Some(info);
            }
            self.outer += 1;
            self.inner = 0;
        }
        None
    }
}
