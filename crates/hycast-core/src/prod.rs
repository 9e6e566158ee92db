//! Product data model — the unit of dissemination and its chunk layout.
//!
//! A product is a named byte blob identified by a `ProdIndex` and divided
//! into fixed-size chunks; only the last chunk may be shorter. All layout
//! math lives here so every subsystem derives offsets and sizes the same
//! way.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Total byte length of a product.
pub type ProdSize = u32;

/// Zero-based index of a chunk within its product.
pub type ChunkIndex = u32;

/// Byte count of one chunk.
pub type ChunkSize = u16;

/// The process-default canonical chunk size, in bytes.
pub const DEFAULT_CANON_CHUNK_SIZE: ChunkSize = 32760;

// ── ProdIndex ─────────────────────────────────────────────────────────────────

/// Identifier of a product, compared modulo 2^32.
///
/// The derived `Ord` is plain `u32` order and is what containers key on;
/// [`ProdIndex::precedes`] is the protocol-level wraparound comparison.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProdIndex(pub u32);

impl ProdIndex {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Wraparound ordering: true iff `self` comes before `other` within a
    /// half-window, i.e. `other - self` (mod 2^32) is in `(0, 2^31)`.
    pub fn precedes(self, other: ProdIndex) -> bool {
        let diff = other.0.wrapping_sub(self.0);
        diff != 0 && diff < 1 << 31
    }

    /// The next index, wrapping at 2^32.
    pub fn next(self) -> ProdIndex {
        ProdIndex(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for ProdIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ProdIndex {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

// ── Chunk layout ──────────────────────────────────────────────────────────────

/// Number of chunks a product of `size` bytes has at canonical chunk size
/// `canon`. Zero-byte products have zero chunks.
pub fn chunk_count(size: ProdSize, canon: ChunkSize) -> u32 {
    if size == 0 {
        0
    } else {
        (size - 1) / u32::from(canon) + 1
    }
}

// ── ProdInfo ──────────────────────────────────────────────────────────────────

/// Metadata of a product: identifier, name, total size, and the canonical
/// chunk size its publisher used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProdInfo {
    index: ProdIndex,
    name: String,
    size: ProdSize,
    chunk_size: ChunkSize,
}

impl ProdInfo {
    /// The name must fit a 16-bit length prefix and the chunk size must be
    /// non-zero.
    pub fn new(
        index: ProdIndex,
        name: impl Into<String>,
        size: ProdSize,
        chunk_size: ChunkSize,
    ) -> Result<Self> {
        let name = name.into();
        if name.len() > usize::from(u16::MAX) {
            return Err(Error::InvalidArgument(format!(
                "product name is {} bytes; max is {}",
                name.len(),
                u16::MAX
            )));
        }
        if chunk_size == 0 {
            return Err(Error::InvalidArgument(
                "canonical chunk size must be non-zero".into(),
            ));
        }
        Ok(Self {
            index,
            name,
            size,
            chunk_size,
        })
    }

    pub fn index(&self) -> ProdIndex {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> ProdSize {
        self.size
    }

    pub fn chunk_size(&self) -> ChunkSize {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> u32 {
        chunk_count(self.size, self.chunk_size)
    }

    /// Byte offset of chunk `index` within the product.
    pub fn chunk_offset(&self, index: ChunkIndex) -> Result<u32> {
        self.check_index(index)?;
        Ok(index * u32::from(self.chunk_size))
    }

    /// Actual byte count of chunk `index`: the canonical size except for a
    /// short final chunk.
    pub fn chunk_size_at(&self, index: ChunkIndex) -> Result<ChunkSize> {
        let offset = self.chunk_offset(index)?;
        let remaining = self.size - offset;
        Ok(remaining.min(u32::from(self.chunk_size)) as ChunkSize)
    }

    /// The `ChunkInfo` identifying chunk `index` of this product.
    pub fn chunk_info(&self, index: ChunkIndex) -> Result<ChunkInfo> {
        self.check_index(index)?;
        Ok(ChunkInfo {
            prod_index: self.index,
            prod_size: self.size,
            chunk_index: index,
        })
    }

    fn check_index(&self, index: ChunkIndex) -> Result<()> {
        if index >= self.chunk_count() {
            return Err(Error::OutOfRange(format!(
                "chunk {} of product {} (chunk count {})",
                index,
                self.index,
                self.chunk_count()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for ProdInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ProdInfo{{index={}, name={:?}, size={}, chunkSize={}}}",
            self.index, self.name, self.size, self.chunk_size
        )
    }
}

// ── ChunkInfo ─────────────────────────────────────────────────────────────────

/// Identifies one chunk of one product.
///
/// Carries the product's total size so the chunk's offset and length are
/// derivable given a canonical chunk size; the canonical size itself travels
/// in the product's `ProdInfo` (or the wire context's legacy default when no
/// info has been seen yet).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkInfo {
    pub prod_index: ProdIndex,
    pub prod_size: ProdSize,
    pub chunk_index: ChunkIndex,
}

impl ChunkInfo {
    pub fn new(prod_index: ProdIndex, prod_size: ProdSize, chunk_index: ChunkIndex) -> Self {
        Self {
            prod_index,
            prod_size,
            chunk_index,
        }
    }

    /// Byte offset of this chunk at canonical chunk size `canon`.
    pub fn offset(&self, canon: ChunkSize) -> u32 {
        self.chunk_index * u32::from(canon)
    }

    /// Byte count of this chunk at canonical chunk size `canon`.
    pub fn data_size(&self, canon: ChunkSize) -> Result<ChunkSize> {
        if canon == 0 || self.chunk_index >= chunk_count(self.prod_size, canon) {
            return Err(Error::OutOfRange(format!(
                "chunk {} of {}-byte product {} at chunk size {}",
                self.chunk_index, self.prod_size, self.prod_index, canon
            )));
        }
        let remaining = self.prod_size - self.offset(canon);
        Ok(remaining.min(u32::from(canon)) as ChunkSize)
    }
}

impl std::fmt::Display for ChunkInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.prod_index, self.chunk_index)
    }
}

// ── Product and chunks ────────────────────────────────────────────────────────

/// A complete product: metadata plus its full payload.
#[derive(Debug, Clone)]
pub struct Product {
    info: ProdInfo,
    data: Bytes,
}

impl Product {
    /// The payload length must equal the declared product size.
    pub fn new(info: ProdInfo, data: Bytes) -> Result<Self> {
        if data.len() != info.size() as usize {
            return Err(Error::InvalidArgument(format!(
                "product {} declares {} bytes but payload is {}",
                info.index(),
                info.size(),
                data.len()
            )));
        }
        Ok(Self { info, data })
    }

    pub fn info(&self) -> &ProdInfo {
        &self.info
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Zero-copy view of chunk `index`.
    pub fn chunk(&self, index: ChunkIndex) -> Result<ActualChunk> {
        let info = self.info.chunk_info(index)?;
        let offset = self.info.chunk_offset(index)? as usize;
        let len = usize::from(self.info.chunk_size_at(index)?);
        Ok(ActualChunk {
            info,
            data: self.data.slice(offset..offset + len),
        })
    }
}

/// A chunk whose payload is in memory.
#[derive(Debug, Clone)]
pub struct ActualChunk {
    pub info: ChunkInfo,
    pub data: Bytes,
}

// ── AddStatus ─────────────────────────────────────────────────────────────────

/// Outcome of an addition to the product store.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AddStatus {
    pub is_new: bool,
    pub is_complete: bool,
    pub is_duplicate: bool,
}

impl AddStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_new(mut self) -> Self {
        self.is_new = true;
        self
    }

    pub fn set_complete(mut self) -> Self {
        self.is_complete = true;
        self
    }

    pub fn set_duplicate(mut self) -> Self {
        self.is_duplicate = true;
        self
    }
}
