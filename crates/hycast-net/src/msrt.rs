//! Multi-stream reliable message transport.
//!
//! SCTP-shaped semantics over any ordered reliable byte stream (TCP in
//! production, an in-memory duplex in tests): message-preserving, ordered
//! within a stream, with a peekable head-of-line message. Each message is
//! framed by a 6-byte header — stream id (u16) then payload length (u32),
//! network byte order.
//!
//! A connection splits into one exclusive reader (the single receiver task;
//! `peek` must never race another reader) and a writer whose sends are
//! serialized by a mutex so frames can't interleave. Per-stream ordering is
//! therefore preserved; sends on different streams are merely sequenced.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use hycast_core::{Error, Result};

/// Any byte stream a connection can run over.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

/// Owned, type-erased connection.
pub type IoBox = Box<dyn Connection>;

/// Header of the message at the head of the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub stream_id: u16,
    /// Unread payload bytes of this message.
    pub len: u32,
}

/// Splits an established connection into its receive and send halves,
/// opened with `num_streams` outgoing streams.
pub fn split(io: IoBox, num_streams: u16) -> (MsrtReader, MsrtWriter) {
    let (rd, wr) = tokio::io::split(io);
    (
        MsrtReader {
            io: rd,
            pending: None,
        },
        MsrtWriter {
            io: Mutex::new(wr),
            num_streams,
        },
    )
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// The receive half. Exactly one task may drive it.
pub struct MsrtReader {
    io: ReadHalf<IoBox>,
    pending: Option<FrameHeader>,
}

impl MsrtReader {
    /// Blocks until the head-of-line message is known and returns its
    /// header without consuming it. `None` means the remote closed cleanly
    /// (the zero-size indication).
    pub async fn peek(&mut self) -> Result<Option<FrameHeader>> {
        if let Some(header) = self.pending {
            return Ok(Some(header));
        }
        let mut raw = [0u8; 6];
        // A clean close can only land on a message boundary; EOF on the
        // first header byte is the peer hanging up, anywhere later is a
        // truncated frame.
        if self.io.read(&mut raw[..1]).await? == 0 {
            return Ok(None);
        }
        self.io.read_exact(&mut raw[1..]).await?;
        let header = FrameHeader {
            stream_id: u16::from_be_bytes([raw[0], raw[1]]),
            len: u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]),
        };
        self.pending = Some(header);
        Ok(Some(header))
    }

    /// Consumes the head-of-line message in full.
    pub async fn recv(&mut self) -> Result<BytesMut> {
        let header = self
            .peek()
            .await?
            .ok_or_else(|| Error::Runtime("connection closed while a message was expected".into()))?;
        let mut buf = BytesMut::zeroed(header.len as usize);
        self.io.read_exact(&mut buf).await?;
        self.pending = None;
        Ok(buf)
    }

    /// Reads exactly `dst.len()` bytes of the pending message's payload,
    /// advancing past them. The message is consumed once its last byte is.
    pub async fn read_payload(&mut self, dst: &mut [u8]) -> Result<()> {
        let header = self
            .pending
            .as_mut()
            .ok_or_else(|| Error::Logic("no message is pending".into()))?;
        let want = u32::try_from(dst.len())
            .ok()
            .filter(|want| *want <= header.len)
            .ok_or_else(|| {
                Error::OutOfRange(format!(
                    "read of {} bytes from a message with {} remaining",
                    dst.len(),
                    header.len
                ))
            })?;
        self.io.read_exact(dst).await?;
        header.len -= want;
        if header.len == 0 {
            self.pending = None;
        }
        Ok(())
    }

    /// Drops exactly `len` bytes of the pending message's payload.
    pub async fn skip_payload(&mut self, len: usize) -> Result<()> {
        let in_message = match self.pending {
            Some(header) => header.len,
            None => return Err(Error::Logic("no message is pending".into())),
        };
        if len as u64 > u64::from(in_message) {
            return Err(Error::OutOfRange(format!(
                "skip of {len} bytes from a message with {in_message} remaining"
            )));
        }
        let mut remaining = len;
        let mut scratch = [0u8; 4096];
        while remaining > 0 {
            let n = self.io.read(&mut scratch[..remaining.min(4096)]).await?;
            if n == 0 {
                return Err(Error::Runtime("connection closed mid-message".into()));
            }
            remaining -= n;
        }
        if let Some(header) = self.pending.as_mut() {
            header.len -= len as u32;
            if header.len == 0 {
                self.pending = None;
            }
        }
        Ok(())
    }

    /// Consumes and drops whatever remains of the pending message.
    pub async fn discard(&mut self) -> Result<()> {
        let remaining = match self.pending {
            Some(header) => header.len as usize,
            None => return Ok(()),
        };
        self.skip_payload(remaining).await
    }
}

#[async_trait::async_trait]
impl crate::chunk::PayloadSource for MsrtReader {
    async fn pull(&mut self, dst: &mut [u8]) -> Result<()> {
        self.read_payload(dst).await
    }

    async fn skip(&mut self, len: usize) -> Result<()> {
        self.skip_payload(len).await
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// The send half. Callable from any task; a mutex serializes frames.
pub struct MsrtWriter {
    io: Mutex<WriteHalf<IoBox>>,
    num_streams: u16,
}

impl MsrtWriter {
    /// Atomically delivers one message on `stream_id`.
    pub async fn send(&self, stream_id: u16, body: &[u8]) -> Result<()> {
        self.sendv(stream_id, &[body]).await
    }

    /// Gather variant: the parts form one message.
    pub async fn sendv(&self, stream_id: u16, parts: &[&[u8]]) -> Result<()> {
        if stream_id >= self.num_streams {
            return Err(Error::InvalidArgument(format!(
                "stream id {stream_id} on a connection with {} streams",
                self.num_streams
            )));
        }
        let total: usize = parts.iter().map(|part| part.len()).sum();
        let len = u32::try_from(total)
            .map_err(|_| Error::InvalidArgument(format!("{total}-byte message overflows framing")))?;

        let mut header = [0u8; 6];
        header[..2].copy_from_slice(&stream_id.to_be_bytes());
        header[2..].copy_from_slice(&len.to_be_bytes());

        let mut io = self.io.lock().await;
        io.write_all(&header).await?;
        for part in parts {
            io.write_all(part).await?;
        }
        io.flush().await?;
        Ok(())
    }

    /// Closes the underlying transport for sending.
    pub async fn close(&self) -> Result<()> {
        self.io.lock().await.shutdown().await?;
        Ok(())
    }
}
