/**
 * nat_discovery/transport.rs
 *
 * UDP listener setup and the datagram writer used by the engine
 */

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket as StdUdpSocket};
use tokio::net::UdpSocket;

/// Writes one datagram to a target address
#[async_trait]
pub trait DatagramSender: Send + Sync {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
}

#[async_trait]
impl DatagramSender for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }
}

/// Bind the NAT discovery listener on all IPv4 interfaces.
///
/// No address reuse: a port already held by another listener is an error.
pub fn bind_listener(port: u16) -> io::Result<UdpSocket> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: StdUdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Source IP the kernel would pick to reach `destination`.
///
/// Connecting a UDP socket only resolves the route, nothing is sent.
pub fn find_preferred_source_ip(destination: IpAddr) -> io::Result<IpAddr> {
    let unspecified: IpAddr = match destination {
        IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };

    let socket = StdUdpSocket::bind(SocketAddr::new(unspecified, 0))?;
    socket.connect(SocketAddr::new(destination, 9))?;
    Ok(socket.local_addr()?.ip())
}
