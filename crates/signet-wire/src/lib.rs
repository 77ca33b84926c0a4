mod error;
mod header;
mod packer;
mod proto;
mod sections;
mod sink;
mod unpacker;

pub use error::TransporterError;
pub use header::{NodeId, SignalHeader, block_ref_block, block_ref_node, number_to_ref};
pub use packer::Packer;
pub use proto::get_message_length;
pub use sections::{
    GenericSections, LinearSections, SectionIterator, SectionSource, SegmentPool, SegmentedSection,
    SegmentedSections, SliceSectionIterator,
};
pub use sink::{DeliveryOutcome, IoState, SignalSink};
pub use unpacker::{UnpackOutcome, unpack};

/// Largest framed message, in bytes, that a peer may put on the wire.
pub const MAX_MESSAGE_SIZE: u32 = 32 * 1024;
/// Receive-side bound on the message-length field, in words.
pub const MAX_RECV_MESSAGE_WORDS: u32 = MAX_MESSAGE_SIZE / 4;
/// Inline signal payload limit (the length field is 5 bits wide, but the
/// engine never sends more than this).
pub const MAX_SIGNAL_DATA_WORDS: u32 = 25;
/// At most this many trailing sections per signal.
pub const MAX_SECTIONS: usize = 3;
/// Fairness bound: one unpack call delivers at most this many signals.
pub const MAX_RECEIVED_SIGNALS: u32 = 1024;
/// Cluster-management block; always delivered, even under `HaltInput`.
pub const QMGR_BLOCK: u32 = 252;
