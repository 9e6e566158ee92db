//! Source-specific multicast datagram transport.
//!
//! Socket construction (group join, source filter, hop limit, loop mode)
//! uses `socket2`; I/O goes through `tokio::net::UdpSocket`. The
//! `DatagramDecoder` realizes the datagram side of the codec contract:
//! `fill` pulls the entire next datagram into a peek buffer, `decode` pulls
//! typed values, and `clear` discards whatever was not consumed.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use hycast_core::wire::{self, Wire, WireCtx};
use hycast_core::{Error, Result};

use crate::chunk::PayloadSource;

/// Largest datagram payload the codec will send or expect: the IPv4 UDP
/// maximum. Real paths fragment above the MTU, but the kernel reassembles.
pub const MAX_PAYLOAD: usize = 65_507;

/// UDP socket for sending to a multicast group.
pub fn sender_socket(group: SocketAddr, hop_limit: u8, loop_enabled: bool) -> Result<UdpSocket> {
    let domain = if group.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    match group.ip() {
        IpAddr::V4(_) => {
            socket.set_multicast_ttl_v4(u32::from(hop_limit))?;
            socket.set_multicast_loop_v4(loop_enabled)?;
            socket.bind(&SocketAddr::from(([0, 0, 0, 0], 0)).into())?;
        }
        IpAddr::V6(_) => {
            socket.set_multicast_hops_v6(u32::from(hop_limit))?;
            socket.set_multicast_loop_v6(loop_enabled)?;
            socket.bind(&SocketAddr::from(([0u16; 8], 0)).into())?;
        }
    }
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// UDP socket joined to a multicast group, optionally filtered to one
/// source (IPv4 only; IPv6 groups join any-source).
pub fn receiver_socket(group: SocketAddr, source: Option<IpAddr>) -> Result<UdpSocket> {
    let domain = if group.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    match group.ip() {
        IpAddr::V4(group_ip) => {
            socket.bind(&SocketAddr::from(([0, 0, 0, 0], group.port())).into())?;
            match source {
                Some(IpAddr::V4(source_ip)) => {
                    socket.join_ssm_v4(&source_ip, &group_ip, &std::net::Ipv4Addr::UNSPECIFIED)?;
                }
                Some(IpAddr::V6(_)) => {
                    return Err(Error::InvalidArgument(
                        "IPv6 source for an IPv4 multicast group".into(),
                    ));
                }
                None => {
                    socket.join_multicast_v4(&group_ip, &std::net::Ipv4Addr::UNSPECIFIED)?;
                }
            }
        }
        IpAddr::V6(group_ip) => {
            if source.is_some() {
                return Err(Error::InvalidArgument(
                    "source-specific joins are supported for IPv4 groups only".into(),
                ));
            }
            socket.bind(&SocketAddr::from(([0u16; 8], group.port())).into())?;
            socket.join_multicast_v6(&group_ip, 0)?;
        }
    }
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

// ── Datagram decoder ──────────────────────────────────────────────────────────

/// Decoder over a datagram socket. One datagram is one message; the decoder
/// holds the current datagram in a peek buffer until `clear`.
pub struct DatagramDecoder {
    sock: UdpSocket,
    scratch: Vec<u8>,
    buf: BytesMut,
    loaded: bool,
}

impl DatagramDecoder {
    pub fn new(sock: UdpSocket) -> Self {
        Self {
            sock,
            scratch: vec![0u8; MAX_PAYLOAD],
            buf: BytesMut::new(),
            loaded: false,
        }
    }

    /// Makes at least `needed` bytes of the current message available,
    /// receiving the next datagram if none is loaded. `needed == 0` merely
    /// ensures a datagram is loaded.
    pub async fn fill(&mut self, needed: usize) -> Result<()> {
        if !self.loaded {
            let (len, _src) = self.sock.recv_from(&mut self.scratch).await?;
            self.buf.clear();
            self.buf.extend_from_slice(&self.scratch[..len]);
            self.loaded = true;
        }
        if self.buf.len() < needed {
            return Err(Error::ShortMessage {
                needed,
                available: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn decode<T: Wire>(&mut self, ctx: &WireCtx) -> Result<T> {
        T::decode(&mut self.buf, ctx)
    }

    pub fn decode_u8(&mut self) -> Result<u8> {
        wire::get_u8(&mut self.buf)
    }

    /// True iff a datagram is loaded and not yet cleared.
    pub fn has_record(&self) -> bool {
        self.loaded
    }

    /// Unread bytes of the current message.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Discards the unread remainder of the current message, so the next
    /// `fill` starts on a fresh datagram.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.loaded = false;
    }
}

#[async_trait]
impl PayloadSource for DatagramDecoder {
    async fn pull(&mut self, dst: &mut [u8]) -> Result<()> {
        if self.buf.len() < dst.len() {
            return Err(Error::ShortMessage {
                needed: dst.len(),
                available: self.buf.len(),
            });
        }
        self.buf.copy_to_slice(dst);
        Ok(())
    }

    async fn skip(&mut self, len: usize) -> Result<()> {
        if self.buf.len() < len {
            return Err(Error::ShortMessage {
                needed: len,
                available: self.buf.len(),
            });
        }
        self.buf.advance(len);
        Ok(())
    }
}
