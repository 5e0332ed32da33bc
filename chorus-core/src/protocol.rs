//! Chorus wire protocol: message type tags and typed message bodies.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::wire::WireError;

/// Identifier of a registered connection. Assigned monotonically, never reused.
pub type PeerId = u32;

/// Dense index of a peer's role within one transfer session. Distinct from [`PeerId`].
pub type AssignedId = u32;

/// All message type tags. The numeric value is the `u32` carried in the header.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Nothing = 0,
    /// Liveness check, answered with `Pong`.
    Ping = 1,
    Pong = 2,
    GetDatabase = 3,
    ReturnDatabase = 4,
    GetTrackInfo = 5,
    NoSuchTrack = 6,
    ReturnTrackInfo = 7,
    GetLyrics = 8,
    NoSuchLyrics = 9,
    ReturnLyrics = 10,
    /// Ask a peer to open a file for segmented sharing.
    PrepareFileSharing = 11,
    /// File opened; carries the segment layout.
    PreparedFileSharing = 12,
    NoSuchFile = 13,
    GetSegment = 14,
    ReturnSegment = 15,
    NoSuchSegment = 16,
}

impl MessageType {
    pub const ALL: [MessageType; 17] = [
        MessageType::Nothing,
        MessageType::Ping,
        MessageType::Pong,
        MessageType::GetDatabase,
        MessageType::ReturnDatabase,
        MessageType::GetTrackInfo,
        MessageType::NoSuchTrack,
        MessageType::ReturnTrackInfo,
        MessageType::GetLyrics,
        MessageType::NoSuchLyrics,
        MessageType::ReturnLyrics,
        MessageType::PrepareFileSharing,
        MessageType::PreparedFileSharing,
        MessageType::NoSuchFile,
        MessageType::GetSegment,
        MessageType::ReturnSegment,
        MessageType::NoSuchSegment,
    ];

    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Nothing => "NOTHING",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
            MessageType::GetDatabase => "GET_DATABASE",
            MessageType::ReturnDatabase => "RETURN_DATABASE",
            MessageType::GetTrackInfo => "GET_TRACK_INFO",
            MessageType::NoSuchTrack => "NO_SUCH_TRACK",
            MessageType::ReturnTrackInfo => "RETURN_TRACK_INFO",
            MessageType::GetLyrics => "GET_LYRICS",
            MessageType::NoSuchLyrics => "NO_SUCH_LYRICS",
            MessageType::ReturnLyrics => "RETURN_LYRICS",
            MessageType::PrepareFileSharing => "PREPARE_FILE_SHARING",
            MessageType::PreparedFileSharing => "PREPARED_FILE_SHARING",
            MessageType::NoSuchFile => "NO_SUCH_FILE",
            MessageType::GetSegment => "GET_SEGMENT",
            MessageType::ReturnSegment => "RETURN_SEGMENT",
            MessageType::NoSuchSegment => "NO_SUCH_SEGMENT",
        }
    }

    /// True for the types handled by the file-sharing coordinator.
    pub fn is_file_sharing(self) -> bool {
        matches!(
            self,
            MessageType::PrepareFileSharing
                | MessageType::PreparedFileSharing
                | MessageType::NoSuchFile
                | MessageType::GetSegment
                | MessageType::ReturnSegment
                | MessageType::NoSuchSegment
        )
    }
}

impl TryFrom<u32> for MessageType {
    type Error = WireError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        MessageType::ALL
            .get(tag as usize)
            .copied()
            .ok_or(WireError::UnknownType(tag))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Body of PREPARE_FILE_SHARING. `name` may be a path or a checksum; the serving side decides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareFileSharing {
    pub name: String,
    pub assigned_id: AssignedId,
    /// Ask the server to split the file into this many segments.
    pub dictated_segment_count: Option<u32>,
}

/// Body of PREPARED_FILE_SHARING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedFileSharing {
    pub total_segments: u32,
    pub assigned_id: AssignedId,
    pub bytes_per_chunk: u32,
    pub total_bytes: u64,
}

/// Body of NO_SUCH_FILE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoSuchFile {
    pub assigned_id: AssignedId,
    pub checksum: String,
}

/// Body of GET_SEGMENT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSegment {
    pub segment_id: u32,
    pub assigned_id: AssignedId,
}

/// Body of RETURN_SEGMENT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnSegment {
    pub segment_id: u32,
    pub assigned_id: AssignedId,
    pub body: Vec<u8>,
}

/// Body of NO_SUCH_SEGMENT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoSuchSegment {
    pub segment_id: u32,
    pub assigned_id: AssignedId,
}
