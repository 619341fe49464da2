//! I/O collaborator traits.
//!
//! The engine reaches the virtual network interface and the UDP sockets
//! only through these traits. Real implementations (a TUN device, a bound
//! `tokio::net::UdpSocket`) live outside this crate; [`mock`] provides
//! in-memory stand-ins for tests.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;

pub mod mock;

/// A virtual network interface carrying raw IP frames.
#[async_trait]
pub trait TunTransport: Send + Sync {
    /// Reads one frame into `buf`, returning its length.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes one frame.
    async fn send(&self, frame: &[u8]) -> io::Result<()>;

    fn mtu(&self) -> usize;
}

/// A UDP endpoint.
#[async_trait]
pub trait UdpTransport: Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl UdpTransport for tokio::net::UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        tokio::net::UdpSocket::recv_from(self, buf).await
    }

    async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        tokio::net::UdpSocket::send_to(self, data, addr).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::UdpSocket::local_addr(self)
    }
}
