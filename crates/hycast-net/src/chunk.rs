//! Latent chunks — payloads still sitting in the transport.
//!
//! A `LatentChunk` is a single-use pull handle: the payload is drained
//! directly from the wire into the caller's buffer (or discarded) exactly
//! once. The receive loops assert the handle is empty after every upcall;
//! a handle that still has data there is a fatal protocol error, because an
//! unconsumed payload would corrupt the transport's framing.

use async_trait::async_trait;

use hycast_core::prod::ChunkInfo;
use hycast_core::{Error, Result};

/// Where a latent payload is pulled from: the pending message of an MSRT
/// reader, or the unread remainder of a datagram decoder.
#[async_trait]
pub trait PayloadSource: Send {
    /// Transfers exactly `dst.len()` payload bytes into `dst`.
    async fn pull(&mut self, dst: &mut [u8]) -> Result<()>;

    /// Drops exactly `len` payload bytes.
    async fn skip(&mut self, len: usize) -> Result<()>;
}

/// A chunk whose metadata has been parsed but whose payload has not been
/// read off the transport yet.
pub struct LatentChunk<'a> {
    info: ChunkInfo,
    len: usize,
    source: Option<&'a mut dyn PayloadSource>,
}

impl<'a> LatentChunk<'a> {
    pub fn new(info: ChunkInfo, len: usize, source: &'a mut dyn PayloadSource) -> Self {
        Self {
            info,
            len,
            source: Some(source),
        }
    }

    pub fn info(&self) -> ChunkInfo {
        self.info
    }

    /// Payload byte count.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True until the payload has been drained or discarded.
    pub fn has_data(&self) -> bool {
        self.source.is_some()
    }

    /// Streams the payload into `dst`, which must be exactly the payload
    /// size. Single use; a second call is a logic error.
    pub async fn drain_into(&mut self, dst: &mut [u8]) -> Result<()> {
        if dst.len() != self.len {
            return Err(Error::InvalidArgument(format!(
                "drain buffer is {} bytes for a {}-byte chunk {}",
                dst.len(),
                self.len,
                self.info
            )));
        }
        let source = self
            .source
            .take()
            .ok_or_else(|| Error::Logic(format!("latent chunk {} already consumed", self.info)))?;
        source.pull(dst).await
    }

    /// Drops the payload without copying it anywhere. Single use.
    pub async fn discard(&mut self) -> Result<()> {
        let source = self
            .source
            .take()
            .ok_or_else(|| Error::Logic(format!("latent chunk {} already consumed", self.info)))?;
        source.skip(self.len).await
    }
}

impl std::fmt::Debug for LatentChunk<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatentChunk")
            .field("info", &self.info)
            .field("len", &self.len)
            .field("has_data", &self.has_data())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hycast_core::prod::ProdIndex;

    /// In-memory payload source for exercising the handle contract.
    struct VecSource(Vec<u8>);

    #[async_trait]
    impl PayloadSource for VecSource {
        async fn pull(&mut self, dst: &mut [u8]) -> Result<()> {
            dst.copy_from_slice(&self.0[..dst.len()]);
            self.0.drain(..dst.len());
            Ok(())
        }

        async fn skip(&mut self, len: usize) -> Result<()> {
            self.0.drain(..len);
            Ok(())
        }
    }

    fn info() -> ChunkInfo {
        ChunkInfo::new(ProdIndex(1), 4, 0)
    }

    #[tokio::test]
    async fn drain_is_single_use() {
        let mut source = VecSource(b"data".to_vec());
        let mut chunk = LatentChunk::new(info(), 4, &mut source);
        assert!(chunk.has_data());

        let mut dst = [0u8; 4];
        chunk.drain_into(&mut dst).await.unwrap();
        assert_eq!(&dst, b"data");
        assert!(!chunk.has_data());

        assert!(matches!(
            chunk.drain_into(&mut dst).await,
            Err(Error::Logic(_))
        ));
    }

    #[tokio::test]
    async fn discard_empties_the_handle() {
        let mut source = VecSource(b"data".to_vec());
        let mut chunk = LatentChunk::new(info(), 4, &mut source);
        chunk.discard().await.unwrap();
        assert!(!chunk.has_data());
        assert!(matches!(chunk.discard().await, Err(Error::Logic(_))));
    }

    #[tokio::test]
    async fn wrong_sized_drain_buffer_is_refused() {
        let mut source = VecSource(b"data".to_vec());
        let mut chunk = LatentChunk::new(info(), 4, &mut source);
        let mut wrong = [0u8; 3];
        assert!(matches!(
            chunk.drain_into(&mut wrong).await,
            Err(Error::InvalidArgument(_))
        ));
        // The refusal must not consume the handle.
        assert!(chunk.has_data());
    }
}
