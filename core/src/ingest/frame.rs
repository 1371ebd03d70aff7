//! Protocol-agnostic DMX frame produced by any ingest listener.

use std::time::Instant;

/// Which wire protocol produced a [`DmxFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceProtocol {
    ArtNet,
    Sacn,
}

impl SourceProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceProtocol::ArtNet => "artnet",
            SourceProtocol::Sacn => "sacn",
        }
    }
}

/// A decoded DMX universe update, independent of the wire protocol that
/// produced it (spec §4.A "Output contract").
#[derive(Debug, Clone)]
pub struct DmxFrame {
    pub universe: u16,
    /// Always exactly 512 bytes, zero-padded by the listener.
    pub data: [u8; 512],
    pub sequence: u8,
    pub source_protocol: SourceProtocol,
    /// 1..200 for sACN; ArtNet carries a configured constant (default 100).
    pub priority: u8,
    pub timestamp: Instant,
    /// Stable per-listener identifier, e.g. `"artnet-0.0.0.0:6454"`.
    pub source_id: String,
}

impl DmxFrame {
    /// Builds a frame, padding `data` with zeros up to 512 bytes.
    pub fn new(
        universe: u16,
        data: &[u8],
        sequence: u8,
        source_protocol: SourceProtocol,
        priority: u8,
        source_id: impl Into<String>,
    ) -> Self {
        let mut buf = [0u8; 512];
        let n = data.len().min(512);
        buf[..n].copy_from_slice(&data[..n]);
        Self {
            universe,
            data: buf,
            sequence,
            source_protocol,
            priority,
            timestamp: Instant::now(),
            source_id: source_id.into(),
        }
    }

    /// Returns the `[channel-1 .. channel-1+length)` slice, or `None` if it
    /// falls outside the 512-byte universe (1-indexed channels, spec §4.B).
    pub fn slice(&self, channel: u16, length: u16) -> Option<&[u8]> {
        let start = (channel as usize).checked_sub(1)?;
        let end = start.checked_add(length as usize)?;
        self.data.get(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pads_short_data_to_512() {
        let frame = DmxFrame::new(1, &[1, 2, 3], 0, SourceProtocol::ArtNet, 100, "artnet-0");
        assert_eq!(frame.data.len(), 512);
        assert_eq!(&frame.data[..3], &[1, 2, 3]);
        assert_eq!(frame.data[3], 0);
    }

    #[test]
    fn slice_is_one_indexed_and_bounds_checked() {
        let mut data = [0u8; 512];
        data[0] = 0x80;
        data[1] = 0x40;
        data[2] = 0x20;
        let frame = DmxFrame {
            universe: 1,
            data,
            sequence: 0,
            source_protocol: SourceProtocol::ArtNet,
            priority: 100,
            timestamp: Instant::now(),
            source_id: "artnet-0".into(),
        };

        assert_eq!(frame.slice(1, 3), Some(&[0x80, 0x40, 0x20][..]));
        assert_eq!(frame.slice(511, 3), None);
        assert_eq!(frame.slice(0, 1), None);
    }
}
