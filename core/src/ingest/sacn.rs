//! sACN / E1.31 datagram parsing and listener (spec §4.A, ANSI E1.31-2018).

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, BridgeResult};
use crate::ingest::frame::{DmxFrame, SourceProtocol};
use crate::ingest::net::bind_reuse_broadcast;

const ACN_PACKET_IDENTIFIER: &[u8; 12] = b"ASC-E1.17\0\0\0";
const VECTOR_ROOT_E131_DATA: u32 = 0x0000_0004;
const VECTOR_E131_DATA_PACKET: u32 = 0x0000_0002;
const VECTOR_DMP_SET_PROPERTY: u8 = 0x02;
const OPTION_STREAM_TERMINATED: u8 = 0b0100_0000;

/// A parsed sACN data packet: universe, priority, sequence, the
/// `stream_terminated` option bit, and the up-to-512-byte DMX payload
/// (start code byte stripped).
#[derive(Debug, PartialEq, Eq)]
pub struct SacnPacket {
    pub universe: u16,
    pub priority: u8,
    pub sequence: u8,
    pub stream_terminated: bool,
    pub data: Vec<u8>,
}

/// Parses an E1.31 datagram (root layer → framing layer → DMP layer).
///
/// Rejects on any fixed vector/identifier mismatch, a zero universe, or an
/// inconsistent DMP property count (spec §4.A).
pub fn parse_sacn(buf: &[u8]) -> BridgeResult<SacnPacket> {
    // Root layer: preamble(2) + postamble(2) + ACN ident(12) + flags/length(2)
    // + root vector(4) + CID(16) = 38 bytes before the framing layer.
    if buf.len() < 38 {
        return Err(BridgeError::Protocol("sacn packet too short (root layer)".into()));
    }
    let preamble_size = u16::from_be_bytes([buf[0], buf[1]]);
    if preamble_size != 0x0010 {
        return Err(BridgeError::Protocol("sacn preamble size mismatch".into()));
    }
    if &buf[4..16] != ACN_PACKET_IDENTIFIER {
        return Err(BridgeError::Protocol("sacn ACN packet identifier mismatch".into()));
    }
    let root_vector = u32::from_be_bytes([buf[18], buf[19], buf[20], buf[21]]);
    if root_vector != VECTOR_ROOT_E131_DATA {
        return Err(BridgeError::Protocol(format!(
            "sacn root vector {:#010x} unsupported",
            root_vector
        )));
    }

    // Framing layer begins at offset 38: flags/length(2) + vector(4) +
    // source name(64) + priority(1) + sync address(2) + sequence(1) +
    // options(1) + universe(2) = 77 bytes.
    let framing_start = 38;
    if buf.len() < framing_start + 77 {
        return Err(BridgeError::Protocol("sacn packet too short (framing layer)".into()));
    }
    let framing_vector = u32::from_be_bytes([
        buf[framing_start + 2],
        buf[framing_start + 3],
        buf[framing_start + 4],
        buf[framing_start + 5],
    ]);
    if framing_vector != VECTOR_E131_DATA_PACKET {
        return Err(BridgeError::Protocol(format!(
            "sacn framing vector {:#010x} unsupported",
            framing_vector
        )));
    }
    let priority = buf[framing_start + 70];
    let sequence = buf[framing_start + 73];
    let options = buf[framing_start + 74];
    let universe = u16::from_be_bytes([buf[framing_start + 75], buf[framing_start + 76]]);
    if universe == 0 {
        return Err(BridgeError::Protocol("sacn universe 0 is invalid".into()));
    }
    let stream_terminated = options & OPTION_STREAM_TERMINATED != 0;

    // DMP layer begins right after the framing layer: flags/length(2) +
    // vector(1) + address type/data type(1) + first property addr(2) +
    // address increment(2) + property value count(2) + start code(1) + data.
    let dmp_start = framing_start + 77;
    if buf.len() < dmp_start + 10 {
        return Err(BridgeError::Protocol("sacn packet too short (dmp layer)".into()));
    }
    let dmp_vector = buf[dmp_start + 2];
    if dmp_vector != VECTOR_DMP_SET_PROPERTY {
        return Err(BridgeError::Protocol(format!(
            "sacn dmp vector {:#04x} unsupported",
            dmp_vector
        )));
    }
    let property_count = u16::from_be_bytes([buf[dmp_start + 8], buf[dmp_start + 9]]) as usize;
    let remaining = buf.len() - (dmp_start + 10);
    // property_count includes the start-code byte (spec §4.A).
    if property_count == 0 || property_count - 1 != remaining {
        return Err(BridgeError::Protocol(format!(
            "sacn dmp property count {} inconsistent with {} remaining bytes",
            property_count, remaining
        )));
    }
    if remaining > 512 {
        return Err(BridgeError::Protocol("sacn dmp data exceeds 512 bytes".into()));
    }

    Ok(SacnPacket {
        universe,
        priority,
        sequence,
        stream_terminated,
        data: buf[dmp_start + 10..].to_vec(),
    })
}

/// Serializes a minimal-but-valid E1.31 data packet, used by tests and by
/// any future collaborator that needs to emit sACN for fixtures.
pub fn serialize_sacn(universe: u16, priority: u8, sequence: u8, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(126 + data.len());
    buf.extend_from_slice(&0x0010u16.to_be_bytes());
    buf.extend_from_slice(&0x0000u16.to_be_bytes());
    buf.extend_from_slice(ACN_PACKET_IDENTIFIER);
    buf.extend_from_slice(&0x0000u16.to_be_bytes()); // root flags/length, not validated
    buf.extend_from_slice(&VECTOR_ROOT_E131_DATA.to_be_bytes());
    buf.extend_from_slice(&[0u8; 16]); // CID

    buf.extend_from_slice(&0x0000u16.to_be_bytes()); // framing flags/length
    buf.extend_from_slice(&VECTOR_E131_DATA_PACKET.to_be_bytes());
    buf.extend_from_slice(&[0u8; 64]); // source name
    buf.push(priority);
    buf.extend_from_slice(&0u16.to_be_bytes()); // sync address
    buf.push(sequence);
    buf.push(0u8); // options
    buf.extend_from_slice(&universe.to_be_bytes());

    buf.extend_from_slice(&0x0000u16.to_be_bytes()); // dmp flags/length
    buf.push(VECTOR_DMP_SET_PROPERTY);
    buf.push(0xa1); // address type / data type, fixed per spec
    buf.extend_from_slice(&0u16.to_be_bytes()); // first property address
    buf.extend_from_slice(&1u16.to_be_bytes()); // address increment
    buf.extend_from_slice(&((data.len() + 1) as u16).to_be_bytes());
    buf.push(0u8); // DMX start code
    buf.extend_from_slice(data);
    buf
}

#[derive(Debug, Default)]
pub struct SacnCounters {
    pub packets_received: AtomicU64,
    pub packets_malformed: AtomicU64,
    pub streams_terminated: AtomicU64,
}

/// sACN UDP listener. Optionally joins per-universe multicast groups
/// `239.255.{hi}.{lo}` when multicast mode is enabled (spec §6).
pub struct SacnListener {
    socket: UdpSocket,
    source_id: String,
    counters: Arc<SacnCounters>,
}

impl SacnListener {
    pub async fn bind(addr: SocketAddr) -> BridgeResult<Self> {
        let socket = bind_reuse_broadcast(addr)
            .map_err(|e| BridgeError::TransientIo(format!("sacn bind {addr}: {e}")))?;
        let source_id = format!("sacn-{addr}");
        Ok(Self {
            socket,
            source_id,
            counters: Arc::new(SacnCounters::default()),
        })
    }

    pub fn counters(&self) -> Arc<SacnCounters> {
        self.counters.clone()
    }

    /// Joins the per-universe multicast group for `universe`.
    pub fn join_universe_multicast(&self, universe: u16) -> BridgeResult<()> {
        let [hi, lo] = universe.to_be_bytes();
        let group = std::net::Ipv4Addr::new(239, 255, hi, lo);
        let socket_ref = socket2::SockRef::from(&self.socket);
        socket_ref
            .join_multicast_v4(&group, &std::net::Ipv4Addr::UNSPECIFIED)
            .map_err(|e| BridgeError::TransientIo(format!("sacn multicast join {group}: {e}")))
    }

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
                    let (n, peer) = recv.map_err(|e| {
                        BridgeError::TransientIo(format!("sacn recv: {e}"))
                    })?;
                    match parse_sacn(&buf[..n]) {
                        Ok(packet) => {
                            self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
                            if packet.stream_terminated || packet.priority == 0 {
                                self.counters.streams_terminated.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                            let frame = DmxFrame::new(
                                packet.universe,
                                &packet.data,
                                packet.sequence,
                                SourceProtocol::Sacn,
                                packet.priority,
                                self.source_id.clone(),
                            );
                            if tx.send(frame).await.is_err() {
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            self.counters.packets_malformed.fetch_add(1, Ordering::Relaxed);
                            log::debug!("sacn malformed packet from {peer}: {e}");
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

    #[test]
    fn parse_roundtrips_through_serialize() {
        let bytes = serialize_sacn(5, 150, 3, &[10, 20, 30]);
        let packet = parse_sacn(&bytes).unwrap();
        assert_eq!(packet.universe, 5);
        assert_eq!(packet.priority, 150);
        assert_eq!(packet.sequence, 3);
        assert!(!packet.stream_terminated);
        assert_eq!(packet.data, vec![10, 20, 30]);
    }

    #[test]
    fn rejects_zero_universe() {
        let bytes = serialize_sacn(0, 100, 0, &[1]);
        assert!(parse_sacn(&bytes).is_err());
    }

    #[test]
    fn priority_zero_is_recognized_as_stream_terminated_equivalent() {
        let bytes = serialize_sacn(1, 0, 0, &[1, 2, 3]);
        let packet = parse_sacn(&bytes).unwrap();
        assert_eq!(packet.priority, 0);
    }

    #[test]
    fn rejects_bad_acn_identifier() {
        let mut bytes = serialize_sacn(1, 100, 0, &[1]);
        bytes[4] = b'X';
        assert!(parse_sacn(&bytes).is_err());
    }

    #[test]
    fn rejects_inconsistent_property_count() {
        let mut bytes = serialize_sacn(1, 100, 0, &[1, 2, 3]);
        let dmp_count_offset = 38 + 77 + 8;
        bytes[dmp_count_offset] = 0;
        bytes[dmp_count_offset + 1] = 1; // claims only start-code, no data
        assert!(parse_sacn(&bytes).is_err());
    }
}
