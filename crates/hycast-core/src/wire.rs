//! Hycast wire format — serialization of every on-wire type.
//!
//! These encodings ARE the protocol: all multi-byte integers are network
//! byte order, strings carry a 16-bit length prefix, and one encoded value
//! follows another with no padding. Changing anything here is a breaking
//! change for every peer on the network.
//!
//! The `WireCtx` threaded through each call carries the negotiated protocol
//! version (an escape hatch for forward evolution — the current codec
//! ignores it) and the legacy canonical chunk size used where a `ChunkInfo`
//! must be interpreted before its product's `ProdInfo` is known.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::prod::{ChunkInfo, ChunkSize, ProdIndex, ProdInfo, DEFAULT_CANON_CHUNK_SIZE};

// ── Message ids (multicast datagrams) ─────────────────────────────────────────

/// First byte of a datagram carrying a `ProdInfo`.
pub const PROD_INFO_MSGID: u8 = 0x01;

/// First byte of a datagram carrying a chunk: `ChunkInfo` then payload.
pub const CHUNK_MSGID: u8 = 0x02;

/// Bytes of chunk metadata (`ChunkInfo`) on the wire for a protocol version.
pub fn chunk_metadata_size(_version: u32) -> usize {
    12
}

// ── Wire context ──────────────────────────────────────────────────────────────

/// Per-connection serialization context.
#[derive(Debug, Clone, Copy)]
pub struct WireCtx {
    /// Negotiated protocol version. Threaded through every call; unused by
    /// the current encodings.
    pub version: u32,
    /// Canonical chunk size assumed when none is known from a `ProdInfo`.
    pub canon_chunk_size: ChunkSize,
}

impl WireCtx {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            canon_chunk_size: DEFAULT_CANON_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(version: u32, canon_chunk_size: ChunkSize) -> Self {
        Self {
            version,
            canon_chunk_size,
        }
    }
}

// ── Primitives ────────────────────────────────────────────────────────────────

fn need(buf: &impl Buf, needed: usize) -> Result<()> {
    let available = buf.remaining();
    if available < needed {
        return Err(Error::ShortMessage { needed, available });
    }
    Ok(())
}

pub fn get_u8(buf: &mut impl Buf) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut impl Buf) -> Result<u16> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn get_u32(buf: &mut impl Buf) -> Result<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn get_u64(buf: &mut impl Buf) -> Result<u64> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

/// 16-bit length prefix, then the raw UTF-8 bytes.
pub fn put_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| {
        Error::InvalidArgument(format!("string of {} bytes exceeds the 16-bit prefix", s.len()))
    })?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

pub fn get_string(buf: &mut impl Buf) -> Result<String> {
    let len = usize::from(get_u16(buf)?);
    need(buf, len)?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|e| Error::Runtime(format!("string is not UTF-8: {e}")))
}

// ── Typed encodings ───────────────────────────────────────────────────────────

/// A value with a wire encoding.
pub trait Wire: Sized {
    fn encode(&self, buf: &mut BytesMut, ctx: &WireCtx) -> Result<()>;
    fn decode<B: Buf>(buf: &mut B, ctx: &WireCtx) -> Result<Self>;
}

/// The protocol-version message exchanged on peer stream 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionMsg(pub u32);

impl Wire for VersionMsg {
    fn encode(&self, buf: &mut BytesMut, _ctx: &WireCtx) -> Result<()> {
        buf.put_u32(self.0);
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B, _ctx: &WireCtx) -> Result<Self> {
        Ok(VersionMsg(get_u32(buf)?))
    }
}

impl Wire for ProdIndex {
    fn encode(&self, buf: &mut BytesMut, _ctx: &WireCtx) -> Result<()> {
        buf.put_u32(self.0);
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B, _ctx: &WireCtx) -> Result<Self> {
        Ok(ProdIndex(get_u32(buf)?))
    }
}

/// ProdIndex (4) + ProdSize (4) + ChunkIndex (4).
impl Wire for ChunkInfo {
    fn encode(&self, buf: &mut BytesMut, ctx: &WireCtx) -> Result<()> {
        self.prod_index.encode(buf, ctx)?;
        buf.put_u32(self.prod_size);
        buf.put_u32(self.chunk_index);
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B, ctx: &WireCtx) -> Result<Self> {
        let prod_index = ProdIndex::decode(buf, ctx)?;
        let prod_size = get_u32(buf)?;
        let chunk_index = get_u32(buf)?;
        Ok(ChunkInfo::new(prod_index, prod_size, chunk_index))
    }
}

/// name (2+n) + ProdIndex (4) + ProdSize (4) + canonical chunk size (2).
impl Wire for ProdInfo {
    fn encode(&self, buf: &mut BytesMut, ctx: &WireCtx) -> Result<()> {
        put_string(buf, self.name())?;
        self.index().encode(buf, ctx)?;
        buf.put_u32(self.size());
        buf.put_u16(self.chunk_size());
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B, ctx: &WireCtx) -> Result<Self> {
        let name = get_string(buf)?;
        let index = ProdIndex::decode(buf, ctx)?;
        let size = get_u32(buf)?;
        let chunk_size = get_u16(buf)?;
        ProdInfo::new(index, name, size, chunk_size)
    }
}

// ── Encoder ───────────────────────────────────────────────────────────────────

/// Builds one outgoing message: append primitives, then `take()` the framed
/// bytes for the transport.
#[derive(Debug)]
pub struct Encoder {
    buf: BytesMut,
    ctx: WireCtx,
}

impl Encoder {
    pub fn new(ctx: WireCtx) -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            ctx,
        }
    }

    pub fn ctx(&self) -> &WireCtx {
        &self.ctx
    }

    pub fn put<T: Wire>(&mut self, value: &T) -> Result<&mut Self> {
        value.encode(&mut self.buf, &self.ctx)?;
        Ok(self)
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Flushes the accumulated message, leaving the encoder empty for reuse.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> WireCtx {
        WireCtx::new(1)
    }

    #[test]
    fn prod_index_round_trip() {
        let mut buf = BytesMut::new();
        ProdIndex(42).encode(&mut buf, &ctx()).unwrap();
        assert_eq!(buf.len(), 4);
        let mut rd = buf.freeze();
        assert_eq!(ProdIndex::decode(&mut rd, &ctx()).unwrap(), ProdIndex(42));
    }

    #[test]
    fn version_msg_round_trip() {
        let mut buf = BytesMut::new();
        VersionMsg(7).encode(&mut buf, &ctx()).unwrap();
        let mut rd = buf.freeze();
        assert_eq!(VersionMsg::decode(&mut rd, &ctx()).unwrap(), VersionMsg(7));
    }

    #[test]
    fn chunk_info_round_trip() {
        let original = ChunkInfo::new(ProdIndex(2), 100_000, 3);
        let mut buf = BytesMut::new();
        original.encode(&mut buf, &ctx()).unwrap();
        assert_eq!(buf.len(), chunk_metadata_size(1));
        let mut rd = buf.freeze();
        assert_eq!(ChunkInfo::decode(&mut rd, &ctx()).unwrap(), original);
    }

    #[test]
    fn prod_info_round_trip() {
        let original = ProdInfo::new(ProdIndex(7), "x", 100_000, 1400).unwrap();
        let mut buf = BytesMut::new();
        original.encode(&mut buf, &ctx()).unwrap();
        // 2 + 1 name bytes, 4 index, 4 size, 2 chunk size
        assert_eq!(buf.len(), 13);
        let mut rd = buf.freeze();
        let recovered = ProdInfo::decode(&mut rd, &ctx()).unwrap();
        assert_eq!(recovered, original);
        assert_eq!(recovered.name(), "x");
        assert_eq!(recovered.chunk_size(), 1400);
    }

    #[test]
    fn truncated_message_reports_short() {
        let original = ChunkInfo::new(ProdIndex(2), 100_000, 3);
        let mut buf = BytesMut::new();
        original.encode(&mut buf, &ctx()).unwrap();
        let mut rd = buf.freeze().slice(0..7);
        match ChunkInfo::decode(&mut rd, &ctx()) {
            Err(Error::ShortMessage { needed, available }) => {
                assert_eq!(needed, 4);
                assert_eq!(available, 3);
            }
            other => panic!("expected ShortMessage, got {other:?}"),
        }
    }

    #[test]
    fn string_length_is_bounded() {
        let mut buf = BytesMut::new();
        let long = "a".repeat(usize::from(u16::MAX) + 1);
        assert!(put_string(&mut buf, &long).is_err());
        assert!(put_string(&mut buf, &"b".repeat(usize::from(u16::MAX))).is_ok());
    }

    #[test]
    fn encoder_take_resets() {
        let mut enc = Encoder::new(ctx());
        enc.put_u8(CHUNK_MSGID);
        enc.put(&ChunkInfo::new(ProdIndex(1), 10, 0)).unwrap();
        let first = enc.take();
        assert_eq!(first.len(), 1 + chunk_metadata_size(1));
        assert_eq!(first[0], CHUNK_MSGID);
        assert!(enc.is_empty());
    }
}
