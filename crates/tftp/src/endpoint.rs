//! Datagram endpoints
//!
//! An [`Endpoint`] owns one UDP socket. The server's control endpoint lives
//! for the whole process; every transfer gets a fresh data endpoint on an
//! ephemeral port that only its session uses.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket as StdUdpSocket};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::TransferError;
use crate::protocol::{MAX_PACKET_SIZE, Packet, TftpErrorCode};

/// A UDP socket speaking [`Packet`]s, optionally fixed to one peer
#[derive(Debug)]
pub struct Endpoint {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
}

impl Endpoint {
    /// Bind the well-known control endpoint
    ///
    /// The socket is built through socket2 so address reuse can be set
    /// before binding; a restarted server can rebind immediately.
    pub fn bind_control(addr: SocketAddr) -> Result<Self> {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket =
            Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("Failed to create control socket")?;

        socket
            .set_reuse_address(true)
            .context("Failed to set SO_REUSEADDR on control socket")?;
        socket
            .set_nonblocking(true)
            .context("Failed to set control socket non-blocking")?;
        socket
            .bind(&addr.into())
            .with_context(|| format!("Failed to bind control socket to {}", addr))?;

        let std_socket: StdUdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).context("Failed to convert control socket to Tokio")?;

        tracing::debug!("Control endpoint bound to {}", socket.local_addr()?);
        Ok(Self { socket, peer: None })
    }

    /// Bind a data endpoint on an ephemeral port of `local_ip`
    ///
    /// An unspecified `local_ip` follows the address family of `peer`.
    pub async fn ephemeral(local_ip: Option<IpAddr>, peer: SocketAddr) -> io::Result<Self> {
        let ip = match local_ip {
            Some(ip) => ip,
            None if peer.is_ipv4() => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            None => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };

        let socket = UdpSocket::bind(SocketAddr::new(ip, 0)).await?;
        tracing::debug!("Data endpoint bound to {}", socket.local_addr()?);
        Ok(Self { socket, peer: None })
    }

    /// Local address the endpoint is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The peer this endpoint is fixed to, once known
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Fix the peer; datagrams from any other source are refused from now on
    pub fn set_peer(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
    }

    /// Encode and send one packet
    pub async fn send(&self, packet: &Packet, to: SocketAddr) -> Result<(), TransferError> {
        let bytes = packet.encode()?;
        self.socket.send_to(&bytes, to).await?;
        tracing::trace!("-> {} {}", to, packet);
        Ok(())
    }

    /// Send an error packet, logging instead of failing if the send fails
    pub async fn send_error(&self, code: TftpErrorCode, message: &str, to: SocketAddr) {
        if let Err(e) = self.send(&Packet::error(code, message), to).await {
            tracing::debug!("Failed to send error to {}: {}", to, e);
        }
    }

    /// Receive one raw datagram from any source
    ///
    /// The buffer is one byte larger than the biggest legal packet so
    /// oversized datagrams are seen as such by the decoder.
    pub async fn recv_from(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
        let (n, src) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((buf, src))
    }

    /// Receive one datagram from the fixed peer
    ///
    /// If no peer is fixed yet, the first datagram's source becomes the peer.
    /// Datagrams from other sources are answered with an unknown-transfer-ID
    /// error and skipped.
    pub async fn recv_from_peer(&mut self) -> io::Result<Vec<u8>> {
        loop {
            let (buf, src) = self.recv_from().await?;

            match self.peer {
                Some(peer) if peer != src => {
                    tracing::debug!("Ignoring datagram from {} (session peer is {})", src, peer);
                    self.send_error(TftpErrorCode::UnknownTransferId, "Unknown transfer ID", src)
                        .await;
                }
                Some(_) => return Ok(buf),
                None => {
                    self.peer = Some(src);
                    return Ok(buf);
                }
            }
        }
    }
}
