//! MPEG-TS packet parsing and ATSC PSIP section reassembly for the guide
//! scanner. Packet/section shapes follow the `recisdb` TS analyzer; the VCT
//! and EIT field layouts follow the ATSC A/65 byte offsets the original
//! scanner decoded.

pub mod packet;
pub mod psip;
pub mod section;

pub use packet::TsPacket;
pub use psip::{EitEvent, VctEntry};
pub use section::{Demuxer, SectionBuffer};
