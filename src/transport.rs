// Copyright (C) 2026 The sanchez developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transport polymorphism: a small send/recv capability set with TCP and
//! UDP (unicast, multicast, broadcast) implementations.
//!
//! One UDP datagram carries exactly one packet. TCP uses the
//! length-delimited [PacketCodec] framing. The server and client are
//! generic over these traits; the TCP path relies on the socket's
//! backpressure for pacing while UDP paths self-pace.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::debug;
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::codec::Framed;

use crate::packet::{Packet, PacketCodec};
use crate::Error;

/// Receive buffer size: large enough for any `MAX_PAYLOAD_LEN` datagram.
const RECV_BUF_LEN: usize = 1 << 16;

/// Something packets can be written to.
#[async_trait]
pub trait PacketSink: Send {
    async fn send(&mut self, pkt: Packet) -> Result<(), Error>;

    /// Whether the server must self-pace emissions. Datagram transports
    /// have no backpressure, so they return true.
    fn needs_pacing(&self) -> bool {
        true
    }
}

/// Something packets can be read from. `Ok(None)` means the transport
/// closed cleanly.
#[async_trait]
pub trait PacketSource: Send {
    async fn recv(&mut self) -> Result<Option<Packet>, Error>;
}

/// TCP transport: ordered, lossless, backpressured.
pub struct TcpTransport {
    inner: Framed<TcpStream, PacketCodec>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        TcpTransport {
            inner: Framed::new(stream, PacketCodec),
        }
    }

    pub async fn connect(addr: SocketAddr) -> Result<Self, Error> {
        Ok(Self::new(TcpStream::connect(addr).await?))
    }
}

#[async_trait]
impl PacketSink for TcpTransport {
    async fn send(&mut self, pkt: Packet) -> Result<(), Error> {
        self.inner.send(pkt).await
    }

    fn needs_pacing(&self) -> bool {
        false
    }
}

#[async_trait]
impl PacketSource for TcpTransport {
    async fn recv(&mut self) -> Result<Option<Packet>, Error> {
        self.inner.next().await.transpose()
    }
}

/// UDP transport. With a `peer`, sends go there; receives accept any
/// source (required for multicast and broadcast).
pub struct UdpTransport {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
    buf: Vec<u8>,
}

impl UdpTransport {
    fn wrap(socket: UdpSocket, peer: Option<SocketAddr>) -> Self {
        UdpTransport {
            socket,
            peer,
            buf: vec![0; RECV_BUF_LEN],
        }
    }

    /// Sender toward one unicast receiver.
    pub async fn unicast(peer: SocketAddr) -> Result<Self, Error> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        Ok(Self::wrap(socket, Some(peer)))
    }

    /// Receiver bound to a local address.
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::wrap(socket, None))
    }

    /// Sender toward a broadcast address.
    pub async fn broadcast(peer: SocketAddr) -> Result<Self, Error> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.set_broadcast(true)?;
        Ok(Self::wrap(socket, Some(peer)))
    }

    /// Sender toward a multicast group.
    pub async fn multicast_sender(group: SocketAddrV4, ttl: u32) -> Result<Self, Error> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.set_multicast_ttl_v4(ttl)?;
        socket.set_multicast_loop_v4(true)?;
        Ok(Self::wrap(socket, Some(SocketAddr::V4(group))))
    }

    /// Receiver joined to a multicast group on all interfaces.
    pub async fn multicast_receiver(group: SocketAddrV4) -> Result<Self, Error> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, group.port())).await?;
        socket.join_multicast_v4(*group.ip(), Ipv4Addr::UNSPECIFIED)?;
        Ok(Self::wrap(socket, None))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl PacketSink for UdpTransport {
    async fn send(&mut self, pkt: Packet) -> Result<(), Error> {
        let wire = pkt.encode();
        let n = match self.peer {
            Some(peer) => self.socket.send_to(&wire, peer).await?,
            None => self.socket.send(&wire).await?,
        };
        if n != wire.len() {
            debug!("short datagram send: {} of {} bytes", n, wire.len());
        }
        Ok(())
    }
}

#[async_trait]
impl PacketSource for UdpTransport {
    async fn recv(&mut self) -> Result<Option<Packet>, Error> {
        let (n, _from) = self.socket.recv_from(&mut self.buf).await?;
        Ok(Some(Packet::decode(&self.buf[..n])?))
    }
}
