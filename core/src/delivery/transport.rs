//! UDP/TCP wire send (spec §4.D step 7, grounded on
//! `sender.py::_send_udp`/`_send_tcp`). Any OS error or timeout is a failure
//! of that attempt; neither function ever returns an `Err` to the caller —
//! failures are reported as `false` so the caller's retry loop need not
//! distinguish timeout from refusal.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};

pub async fn send_udp(ip: IpAddr, port: u16, payload: &[u8], timeout: Duration) -> bool {
    let attempt = async {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await.ok()?;
        let sent = socket.send_to(payload, SocketAddr::new(ip, port)).await.ok()?;
        Some(sent == payload.len())
    };
    matches!(tokio::time::timeout(timeout, attempt).await, Ok(Some(true)))
}

pub async fn send_tcp(ip: IpAddr, port: u16, payload: &[u8], timeout: Duration) -> bool {
    let attempt = async {
        let mut stream = TcpStream::connect(SocketAddr::new(ip, port)).await.ok()?;
        stream.write_all(payload).await.ok()?;
        stream.flush().await.ok()?;
        stream.shutdown().await.ok()?;
        Some(true)
    };
    matches!(tokio::time::timeout(timeout, attempt).await, Ok(Some(true)))
}
