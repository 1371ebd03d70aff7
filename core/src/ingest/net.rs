//! Socket construction helpers shared by the ArtNet and sACN listeners.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Builds a non-blocking UDP socket bound to `addr` with `SO_REUSEADDR`
/// (and `SO_REUSEPORT` where available) and `SO_BROADCAST` set, matching
/// the coexistence requirements in spec §6.
pub fn bind_reuse_broadcast(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}
