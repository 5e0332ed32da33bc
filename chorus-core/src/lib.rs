//! Chorus protocol core.
//! Host-driven: no I/O; host passes messages and ticks, receives actions.

pub mod protocol;
pub mod segment;
pub mod sharing;
pub mod transfer;
pub mod wire;

pub use protocol::{AssignedId, MessageType, PeerId};
pub use segment::{SegmentLayout, SegmentSink, MAX_SEGMENT_SIZE};
pub use sharing::{FileSharing, OpenRequest, ReadRequest, SharingAction, SharingError};
pub use transfer::{PeerStatus, TransferSession, DEFAULT_SEGMENT_TIMEOUT};
pub use wire::{Message, MessageHeader, QueuedMessage, WireError};
