//! IngestListeners: ArtNet and sACN UDP decoders producing [`DmxFrame`]s
//! (spec §4.A).

pub mod artnet;
mod net;
pub mod sacn;

mod frame;

pub use artnet::{parse_artdmx, serialize_artdmx, ArtNetCounters, ArtNetListener};
pub use frame::{DmxFrame, SourceProtocol};
pub use sacn::{parse_sacn, serialize_sacn, SacnCounters, SacnListener, SacnPacket};
