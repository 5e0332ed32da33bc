//! Notifications from the node to whoever drives it.

use std::net::SocketAddr;

use chorus_core::{AssignedId, PeerId, SharingAction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A peer was registered after an accept or a completed connect.
    Connected { peer_id: PeerId, addr: SocketAddr },
    /// A peer was removed. Fires at most once per peer.
    Disconnected { peer_id: PeerId },
    /// A transfer assignment was excluded for good.
    PeerDead {
        assigned_id: AssignedId,
        peer_id: PeerId,
    },
    TransferFinished {
        name: String,
        bytes_written: u64,
        /// Segments that were never written. Empty means the file is complete.
        missing: Vec<u32>,
    },
    TransferStalled {
        name: String,
        bytes_written: u64,
        write_cursor: u32,
    },
}

impl NodeEvent {
    /// Event form of a coordinator action, `None` for sends.
    pub(crate) fn from_action(action: SharingAction) -> Option<Self> {
        match action {
            SharingAction::Send(_) | SharingAction::Open(_) | SharingAction::Read(_) => None,
            SharingAction::PeerDead {
                assigned_id,
                peer_id,
            } => Some(NodeEvent::PeerDead {
                assigned_id,
                peer_id,
            }),
            SharingAction::TransferFinished {
                name,
                bytes_written,
                missing,
            } => Some(NodeEvent::TransferFinished {
                name,
                bytes_written,
                missing,
            }),
            SharingAction::TransferStalled {
                name,
                bytes_written,
                write_cursor,
            } => Some(NodeEvent::TransferStalled {
                name,
                bytes_written,
                write_cursor,
            }),
        }
    }
}
