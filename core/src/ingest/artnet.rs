//! ArtNet/ArtDMX datagram parsing and listener (spec §4.A).

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, BridgeResult};
use crate::ingest::frame::{DmxFrame, SourceProtocol};
use crate::ingest::net::bind_reuse_broadcast;

const ARTNET_HEADER: &[u8; 8] = b"Art-Net\0";
const OPCODE_ARTDMX: u16 = 0x5000;

/// Parses a single ArtDMX datagram (spec §4.A "ArtNet/ArtDMX framing").
///
/// Layout: 8-byte magic `"Art-Net\0"`, opcode (LE u16, must be `0x5000`),
/// protocol version (BE u16, ignored), sequence (u8), physical (u8),
/// universe (LE u16), length (BE u16), then `length` data bytes.
pub fn parse_artdmx(buf: &[u8]) -> BridgeResult<(u16, u8, u8, Vec<u8>)> {
    if buf.len() < 18 {
        return Err(BridgeError::Protocol("artnet packet too short".into()));
    }
    if &buf[0..8] != ARTNET_HEADER {
        return Err(BridgeError::Protocol("artnet header magic mismatch".into()));
    }
    let opcode = u16::from_le_bytes([buf[8], buf[9]]);
    if opcode != OPCODE_ARTDMX {
        return Err(BridgeError::Protocol(format!(
            "unsupported artnet opcode {:#06x}",
            opcode
        )));
    }
    // buf[10..12] protocol version, big-endian, not validated further.
    let sequence = buf[12];
    let physical = buf[13];
    let universe = u16::from_le_bytes([buf[14], buf[15]]);
    let length = u16::from_be_bytes([buf[16], buf[17]]) as usize;

    if length > 512 {
        return Err(BridgeError::Protocol(format!(
            "artnet length {} exceeds 512",
            length
        )));
    }
    let remaining = buf.len() - 18;
    if remaining != length {
        return Err(BridgeError::Protocol(format!(
            "artnet length {} does not match {} remaining bytes",
            length, remaining
        )));
    }

    Ok((universe, sequence, physical, buf[18..18 + length].to_vec()))
}

/// Serializes an ArtDMX datagram — the inverse of [`parse_artdmx`], used by
/// the round-trip test property (spec §8) and by test fixtures.
pub fn serialize_artdmx(universe: u16, sequence: u8, physical: u8, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(18 + data.len());
    buf.extend_from_slice(ARTNET_HEADER);
    buf.extend_from_slice(&OPCODE_ARTDMX.to_le_bytes());
    buf.extend_from_slice(&14u16.to_be_bytes()); // protocol version 14
    buf.push(sequence);
    buf.push(physical);
    buf.extend_from_slice(&universe.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Counters exposed by the ArtNet listener for the in-process metrics API.
#[derive(Debug, Default)]
pub struct ArtNetCounters {
    pub packets_received: AtomicU64,
    pub packets_malformed: AtomicU64,
}

/// ArtNet UDP listener. One per process when `artnet_enabled`.
///
/// Failure semantics per spec §4.A: socket errors stop the receive loop and
/// are reported to the supervisor for restart with backoff; malformed
/// packets are counted and dropped silently without stopping the listener.
pub struct ArtNetListener {
    socket: UdpSocket,
    default_priority: u8,
    source_id: String,
    counters: Arc<ArtNetCounters>,
}

impl ArtNetListener {
    /// Binds the listener socket with `SO_REUSEADDR`/`SO_REUSEPORT` (where
    /// available) and `SO_BROADCAST` enabled, so multiple receivers on the
    /// same host can coexist (spec §6).
    pub async fn bind(addr: SocketAddr, default_priority: u8) -> BridgeResult<Self> {
        let socket = bind_reuse_broadcast(addr)
            .map_err(|e| BridgeError::TransientIo(format!("artnet bind {addr}: {e}")))?;
        let source_id = format!("artnet-{addr}");
        Ok(Self {
            socket,
            default_priority,
            source_id,
            counters: Arc::new(ArtNetCounters::default()),
        })
    }

    pub fn counters(&self) -> Arc<ArtNetCounters> {
        self.counters.clone()
    }

    /// Runs the receive loop until `cancel` fires, forwarding decoded frames
    /// to `tx`. Returns `Ok(())` on graceful cancellation, `Err` on a socket
    /// failure the supervisor should restart from.
    pub async fn run(
        &self,
        tx: mpsc::Sender<DmxFrame>,
        cancel: CancellationToken,
    ) -> BridgeResult<()> {
        let mut buf = [0u8; 2048];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                recv = self.socket.recv_from(&mut buf) => {
                    let (n, _peer) = recv.map_err(|e| {
                        BridgeError::TransientIo(format!("artnet recv: {e}"))
                    })?;
                    match parse_artdmx(&buf[..n]) {
                        Ok((universe, sequence, _physical, data)) => {
                            self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
                            let frame = DmxFrame::new(
                                universe,
                                &data,
                                sequence,
                                SourceProtocol::ArtNet,
                                self.default_priority,
                                self.source_id.clone(),
                            );
                            if tx.send(frame).await.is_err() {
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            self.counters.packets_malformed.fetch_add(1, Ordering::Relaxed);
                            log::debug!("artnet malformed packet from {_peer}: {e}");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame_bytes() -> Vec<u8> {
        serialize_artdmx(1, 7, 0, &[0x80, 0x40, 0x20])
    }

    #[test]
    fn parse_roundtrips_through_serialize() {
        let bytes = sample_frame_bytes();
        let (universe, sequence, physical, data) = parse_artdmx(&bytes).unwrap();
        assert_eq!(universe, 1);
        assert_eq!(sequence, 7);
        assert_eq!(physical, 0);
        assert_eq!(data, vec![0x80, 0x40, 0x20]);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample_frame_bytes();
        bytes[0] = b'X';
        assert!(parse_artdmx(&bytes).is_err());
    }

    #[test]
    fn rejects_wrong_opcode() {
        let mut bytes = sample_frame_bytes();
        bytes[8] = 0x01;
        bytes[9] = 0x00;
        assert!(parse_artdmx(&bytes).is_err());
    }

    #[test]
    fn rejects_length_over_512() {
        let mut bytes = sample_frame_bytes();
        bytes[16] = 0x02;
        bytes[17] = 0x01; // big-endian length 0x0201 = 513
        assert!(parse_artdmx(&bytes).is_err());
    }

    #[test]
    fn rejects_length_mismatch_with_remaining_bytes() {
        let mut bytes = sample_frame_bytes();
        bytes.push(0xFF); // extra trailing byte not reflected in length field
        assert!(parse_artdmx(&bytes).is_err());
    }

    #[test]
    fn rejects_short_packet() {
        assert!(parse_artdmx(&[0u8; 10]).is_err());
    }
}
