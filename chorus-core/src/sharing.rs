//! Host-driven file-sharing coordinator: serves files to peers and fetches one file from many.
//!
//! The host hands in decoded file-sharing messages and ticks (with the current time) and
//! gets back [`SharingAction`]s to perform. No sockets, no timers, no file reads: looking a
//! file up and reading a segment are requested through [`SharingAction::Open`] and
//! [`SharingAction::Read`], and the host reports back with [`FileSharing::on_opened`] and
//! [`FileSharing::on_read`].

use std::collections::HashMap;
use std::io;
use std::ops::Range;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::protocol::{
    AssignedId, GetSegment, MessageType, NoSuchFile, NoSuchSegment, PeerId, PrepareFileSharing,
    PreparedFileSharing, ReturnSegment,
};
use crate::segment::{SegmentLayout, SegmentSink};
use crate::transfer::{Delivery, FailureOutcome, TransferSession};
use crate::wire::{Message, QueuedMessage, WireError};

/// A peer asked us to prepare `name`; the host looks up its size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub peer_id: PeerId,
    pub assigned_id: AssignedId,
    pub name: String,
    pub dictated_segment_count: Option<u32>,
}

/// A peer asked for one segment of a prepared file; the host reads `range` of `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub peer_id: PeerId,
    pub assigned_id: AssignedId,
    pub segment_id: u32,
    pub name: String,
    pub range: Range<u64>,
}

/// Something the host must do on behalf of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharingAction {
    /// Queue this message for sending.
    Send(QueuedMessage),
    /// Look up a file, then call [`FileSharing::on_opened`].
    Open(OpenRequest),
    /// Read a segment, then call [`FileSharing::on_read`].
    Read(ReadRequest),
    /// An assignment was excluded from the transfer for good.
    PeerDead {
        assigned_id: AssignedId,
        peer_id: PeerId,
    },
    /// The write cursor reached the end. `missing` lists segments that were skipped.
    TransferFinished {
        name: String,
        bytes_written: u64,
        missing: Vec<u32>,
    },
    /// Every assignment is dead before the end was reached.
    TransferStalled {
        name: String,
        bytes_written: u64,
        write_cursor: u32,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SharingError {
    #[error("no transfer in progress")]
    NoActiveTransfer,
    #[error("no peers to fetch from")]
    NoPeers,
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// A file this node has prepared for a remote requester.
#[derive(Debug, Clone)]
struct Served {
    name: String,
    layout: SegmentLayout,
}

/// The one file this node is fetching.
struct Fetch {
    name: String,
    sink: Box<dyn SegmentSink + Send>,
    layout: Option<SegmentLayout>,
    /// Indexed by assigned id: answered PREPARED_FILE_SHARING with the agreed layout.
    prepared: Vec<bool>,
}

pub struct FileSharing {
    session: TransferSession,
    fetch: Option<Fetch>,
    serving: HashMap<(PeerId, AssignedId), Served>,
}

impl FileSharing {
    pub fn new(segment_timeout: Duration) -> Self {
        Self {
            session: TransferSession::new(segment_timeout),
            fetch: None,
            serving: HashMap::new(),
        }
    }

    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    /// True while a fetch has not yet finished or stalled.
    pub fn is_fetching(&self) -> bool {
        self.fetch.is_some()
    }

    /// Begin fetching `name` from `peers`. Any previous fetch is abandoned.
    ///
    /// Returns one PREPARE_FILE_SHARING per peer.
    pub fn start_fetch(
        &mut self,
        name: &str,
        peers: &[PeerId],
        dictated_segment_count: Option<u32>,
        sink: Box<dyn SegmentSink + Send>,
    ) -> Result<Vec<SharingAction>, SharingError> {
        if peers.is_empty() {
            return Err(SharingError::NoPeers);
        }
        if let Some(prev) = &self.fetch {
            tracing::info!(name = %prev.name, "abandoning previous fetch");
        }
        self.session.reset();
        let mut actions = Vec::with_capacity(peers.len());
        for &peer_id in peers {
            let assigned_id = self.session.add_peer(peer_id);
            let req = PrepareFileSharing {
                name: name.to_string(),
                assigned_id,
                dictated_segment_count,
            };
            let msg = Message::with_body(MessageType::PrepareFileSharing, &req)?;
            actions.push(SharingAction::Send(QueuedMessage::new(peer_id, msg)));
        }
        self.fetch = Some(Fetch {
            name: name.to_string(),
            sink,
            layout: None,
            prepared: vec![false; peers.len()],
        });
        tracing::info!(name, peers = peers.len(), "fetch started");
        Ok(actions)
    }

    /// Stop writing to the sink until [`resume`](Self::resume). Segments keep buffering.
    pub fn pause(&mut self) -> Result<(), SharingError> {
        if self.fetch.is_none() {
            return Err(SharingError::NoActiveTransfer);
        }
        self.session.pause();
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), SharingError> {
        if self.fetch.is_none() {
            return Err(SharingError::NoActiveTransfer);
        }
        self.session.resume();
        Ok(())
    }

    /// Handle one file-sharing message from `from`. Other message types are ignored.
    pub fn on_message(&mut self, from: PeerId, msg: &Message, now: Instant) -> Vec<SharingAction> {
        let Some(kind) = msg.kind() else {
            return Vec::new();
        };
        let result = match kind {
            MessageType::PrepareFileSharing => msg
                .decode_body::<PrepareFileSharing>()
                .map(|req| self.serve_prepare(from, req)),
            MessageType::GetSegment => msg
                .decode_body::<GetSegment>()
                .map(|req| self.serve_segment(from, req)),
            MessageType::PreparedFileSharing => msg
                .decode_body::<PreparedFileSharing>()
                .map(|p| self.on_prepared(from, p, now)),
            MessageType::NoSuchFile => msg
                .decode_body::<NoSuchFile>()
                .map(|n| self.on_no_such_file(from, n)),
            MessageType::ReturnSegment => msg
                .decode_body::<ReturnSegment>()
                .map(|seg| self.on_segment(from, seg, now)),
            MessageType::NoSuchSegment => msg
                .decode_body::<NoSuchSegment>()
                .map(|n| self.on_no_such_segment(from, n, now)),
            _ => Ok(Vec::new()),
        };
        result.unwrap_or_else(|e| {
            tracing::warn!(peer_id = from, kind = %kind, error = %e, "malformed file-sharing message");
            Vec::new()
        })
    }

    /// Periodic work: expire timeouts, release ready segments, task idle peers.
    pub fn on_tick(&mut self, now: Instant) -> Vec<SharingAction> {
        if self.fetch.is_none() {
            return Vec::new();
        }
        let mut actions = Vec::new();
        let outcomes = self.session.expire_timeouts(now);
        actions.extend(dead_actions(&outcomes));
        self.progress(now, &mut actions);
        actions
    }

    /// A connection went away: its assignments die and anything served to it is forgotten.
    pub fn on_peer_disconnected(&mut self, peer_id: PeerId, now: Instant) -> Vec<SharingAction> {
        self.serving.retain(|(p, _), _| *p != peer_id);
        if self.fetch.is_none() {
            return Vec::new();
        }
        let mut actions = Vec::new();
        for assigned_id in self.session.assignments_for_peer(peer_id) {
            if self.session.mark_dead(assigned_id) {
                actions.push(SharingAction::PeerDead {
                    assigned_id,
                    peer_id,
                });
            }
        }
        self.progress(now, &mut actions);
        actions
    }

    /// The host looked up an [`OpenRequest`]: `size` is `None` if the file cannot be served.
    pub fn on_opened(&mut self, req: OpenRequest, size: Option<u64>) -> Vec<SharingAction> {
        let Some(total_bytes) = size else {
            tracing::info!(peer_id = req.peer_id, name = %req.name, "requested file not available");
            let reply = NoSuchFile {
                assigned_id: req.assigned_id,
                checksum: req.name,
            };
            return send(req.peer_id, MessageType::NoSuchFile, &reply).into_iter().collect();
        };
        let layout = SegmentLayout::new(total_bytes, req.dictated_segment_count);
        let reply = PreparedFileSharing {
            total_segments: layout.total_segments,
            assigned_id: req.assigned_id,
            bytes_per_chunk: layout.bytes_per_chunk,
            total_bytes,
        };
        tracing::debug!(
            peer_id = req.peer_id,
            name = %req.name,
            total_bytes,
            segments = layout.total_segments,
            "prepared file for sharing"
        );
        self.serving.insert(
            (req.peer_id, req.assigned_id),
            Served {
                name: req.name,
                layout,
            },
        );
        send(req.peer_id, MessageType::PreparedFileSharing, &reply)
            .into_iter()
            .collect()
    }

    /// The host finished a [`ReadRequest`]. Answers RETURN_SEGMENT, or NO_SUCH_SEGMENT when
    /// the read failed or the segment cannot be framed. Dropped if the peer is gone.
    pub fn on_read(&mut self, req: ReadRequest, result: io::Result<Vec<u8>>) -> Vec<SharingAction> {
        let still_served = self
            .serving
            .get(&(req.peer_id, req.assigned_id))
            .is_some_and(|s| s.name == req.name);
        if !still_served {
            tracing::debug!(peer_id = req.peer_id, segment = req.segment_id, "read for a forgotten file dropped");
            return Vec::new();
        }
        let no_such = NoSuchSegment {
            segment_id: req.segment_id,
            assigned_id: req.assigned_id,
        };
        let body = match result {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(peer_id = req.peer_id, name = %req.name, segment = req.segment_id, error = %e, "segment read failed");
                return send(req.peer_id, MessageType::NoSuchSegment, &no_such)
                    .into_iter()
                    .collect();
            }
        };
        let reply = ReturnSegment {
            segment_id: req.segment_id,
            assigned_id: req.assigned_id,
            body,
        };
        match Message::with_body(MessageType::ReturnSegment, &reply) {
            Ok(msg) => vec![SharingAction::Send(QueuedMessage::new(req.peer_id, msg))],
            Err(e) => {
                tracing::warn!(peer_id = req.peer_id, segment = req.segment_id, error = %e, "segment does not fit in a frame");
                send(req.peer_id, MessageType::NoSuchSegment, &no_such)
                    .into_iter()
                    .collect()
            }
        }
    }

    fn serve_prepare(&mut self, from: PeerId, req: PrepareFileSharing) -> Vec<SharingAction> {
        vec![SharingAction::Open(OpenRequest {
            peer_id: from,
            assigned_id: req.assigned_id,
            name: req.name,
            dictated_segment_count: req.dictated_segment_count,
        })]
    }

    fn serve_segment(&mut self, from: PeerId, req: GetSegment) -> Vec<SharingAction> {
        let served = self.serving.get(&(from, req.assigned_id));
        let Some((name, range)) =
            served.and_then(|s| s.layout.range(req.segment_id).map(|r| (s.name.clone(), r)))
        else {
            let no_such = NoSuchSegment {
                segment_id: req.segment_id,
                assigned_id: req.assigned_id,
            };
            return send(from, MessageType::NoSuchSegment, &no_such)
                .into_iter()
                .collect();
        };
        vec![SharingAction::Read(ReadRequest {
            peer_id: from,
            assigned_id: req.assigned_id,
            segment_id: req.segment_id,
            name,
            range,
        })]
    }

    fn on_prepared(&mut self, from: PeerId, p: PreparedFileSharing, now: Instant) -> Vec<SharingAction> {
        if !self.owns(from, p.assigned_id) {
            return Vec::new();
        }
        let Some(fetch) = self.fetch.as_mut() else {
            return Vec::new();
        };
        let layout = SegmentLayout::from(&p);
        let mut actions = Vec::new();
        match fetch.layout {
            None => {
                fetch.layout = Some(layout);
                self.session.set_layout(layout);
                tracing::info!(
                    name = %fetch.name,
                    total_bytes = layout.total_bytes,
                    segments = layout.total_segments,
                    "transfer layout fixed"
                );
            }
            Some(agreed) if agreed != layout => {
                tracing::warn!(peer_id = from, assigned_id = p.assigned_id, "peer disagrees on file layout");
                if self.session.mark_dead(p.assigned_id) {
                    actions.push(SharingAction::PeerDead {
                        assigned_id: p.assigned_id,
                        peer_id: from,
                    });
                }
                self.progress(now, &mut actions);
                return actions;
            }
            Some(_) => {}
        }
        if let Some(flag) = fetch.prepared.get_mut(p.assigned_id as usize) {
            *flag = true;
        }
        self.progress(now, &mut actions);
        actions
    }

    fn on_no_such_file(&mut self, from: PeerId, n: NoSuchFile) -> Vec<SharingAction> {
        if !self.owns(from, n.assigned_id) {
            return Vec::new();
        }
        tracing::info!(peer_id = from, name = %n.checksum, "peer does not have the file");
        let mut actions = Vec::new();
        if self.session.mark_dead(n.assigned_id) {
            actions.push(SharingAction::PeerDead {
                assigned_id: n.assigned_id,
                peer_id: from,
            });
        }
        self.check_end(&mut actions);
        actions
    }

    fn on_segment(&mut self, from: PeerId, seg: ReturnSegment, now: Instant) -> Vec<SharingAction> {
        if !self.owns(from, seg.assigned_id) {
            return Vec::new();
        }
        let assigned_id = seg.assigned_id;
        if self.session.push_segment(seg) == Delivery::Answered {
            self.session.set_idle(assigned_id);
        }
        let mut actions = Vec::new();
        self.progress(now, &mut actions);
        actions
    }

    fn on_no_such_segment(&mut self, from: PeerId, n: NoSuchSegment, now: Instant) -> Vec<SharingAction> {
        if !self.owns(from, n.assigned_id) {
            return Vec::new();
        }
        let in_flight = self
            .session
            .assignment(n.assigned_id)
            .and_then(|a| a.in_flight());
        if in_flight != Some(n.segment_id) {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if let Some(outcome) = self.session.record_failure(n.assigned_id) {
            actions.extend(dead_actions(&[outcome]));
        }
        self.progress(now, &mut actions);
        actions
    }

    /// True if `assigned_id` belongs to `from` in the active fetch.
    fn owns(&self, from: PeerId, assigned_id: AssignedId) -> bool {
        let owned = self.fetch.is_some() && self.session.peer_id(assigned_id) == Some(from);
        if !owned {
            tracing::debug!(peer_id = from, assigned_id, "reply for unknown assignment ignored");
        }
        owned
    }

    /// Write what is ready, hand out new requests, and report the end if reached.
    fn progress(&mut self, now: Instant, actions: &mut Vec<SharingAction>) {
        let Some(fetch) = self.fetch.as_mut() else {
            return;
        };
        self.session.try_write(fetch.sink.as_mut());
        if !self.session.all_requested() {
            for assigned_id in self.session.idle_peers() {
                if !fetch.prepared.get(assigned_id as usize).copied().unwrap_or(false) {
                    continue;
                }
                let Some(req) = self.session.request_segment(assigned_id, now) else {
                    break;
                };
                let Some(peer_id) = self.session.peer_id(assigned_id) else {
                    continue;
                };
                actions.extend(send(peer_id, MessageType::GetSegment, &req));
            }
        }
        self.check_end(actions);
    }

    /// Report the end of the fetch, if reached, and release the sink.
    fn check_end(&mut self, actions: &mut Vec<SharingAction>) {
        let Some(fetch) = self.fetch.as_mut() else {
            return;
        };
        let bytes_written = self.session.bytes_written();
        let action = if self.session.is_finished() {
            let missing = self.session.missing_segments().to_vec();
            tracing::info!(name = %fetch.name, bytes_written, missing = missing.len(), "transfer finished");
            SharingAction::TransferFinished {
                name: fetch.name.clone(),
                bytes_written,
                missing,
            }
        } else if !self.session.has_live_peers() {
            let write_cursor = self.session.write_cursor();
            tracing::warn!(name = %fetch.name, bytes_written, write_cursor, "transfer stalled, no live peers");
            SharingAction::TransferStalled {
                name: fetch.name.clone(),
                bytes_written,
                write_cursor,
            }
        } else {
            return;
        };
        fetch.sink.finish();
        actions.push(action);
        self.fetch = None;
    }
}

fn dead_actions(outcomes: &[FailureOutcome]) -> impl Iterator<Item = SharingAction> + '_ {
    outcomes
        .iter()
        .filter(|o| o.dead)
        .map(|o| SharingAction::PeerDead {
            assigned_id: o.assigned_id,
            peer_id: o.peer_id,
        })
}

fn send<T: Serialize>(peer_id: PeerId, kind: MessageType, body: &T) -> Option<SharingAction> {
    match Message::with_body(kind, body) {
        Ok(msg) => Some(SharingAction::Send(QueuedMessage::new(peer_id, msg))),
        Err(e) => {
            tracing::error!(peer_id, kind = %kind, error = %e, "failed to encode message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::segment::MAX_SEGMENT_SIZE;
    use crate::transfer::DEFAULT_SEGMENT_TIMEOUT;
    use crate::wire::MAX_BODY_SIZE;

    #[derive(Default)]
    struct MemSource {
        files: HashMap<String, Vec<u8>>,
    }

    impl MemSource {
        fn with(name: &str, data: Vec<u8>) -> Self {
            let mut files = HashMap::new();
            files.insert(name.to_string(), data);
            Self { files }
        }

        fn open(&self, name: &str) -> Option<u64> {
            self.files.get(name).map(|d| d.len() as u64)
        }

        fn read(&self, name: &str, range: Range<u64>) -> io::Result<Vec<u8>> {
            let data = self
                .files
                .get(name)
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
            Ok(data[range.start as usize..range.end as usize].to_vec())
        }
    }

    /// A serving node that performs its file work on the spot.
    struct Server {
        sharing: FileSharing,
        files: MemSource,
    }

    impl Server {
        fn new(files: MemSource) -> Self {
            Self {
                sharing: FileSharing::new(DEFAULT_SEGMENT_TIMEOUT),
                files,
            }
        }

        fn answer(&mut self, from: PeerId, msg: &Message, now: Instant) -> Vec<QueuedMessage> {
            let mut out = Vec::new();
            for action in self.sharing.on_message(from, msg, now) {
                let replies = match action {
                    SharingAction::Open(req) => {
                        let size = self.files.open(&req.name);
                        self.sharing.on_opened(req, size)
                    }
                    SharingAction::Read(req) => {
                        let result = self.files.read(&req.name, req.range.clone());
                        self.sharing.on_read(req, result)
                    }
                    other => vec![other],
                };
                out.extend(sends(&replies));
            }
            out
        }
    }

    #[derive(Clone, Default)]
    struct MemSink {
        data: Arc<Mutex<Vec<u8>>>,
        finals: Arc<Mutex<usize>>,
        finishes: Arc<Mutex<usize>>,
    }

    impl SegmentSink for MemSink {
        fn write_segment(&mut self, range: Range<u64>, bytes: &[u8], is_final: bool) {
            let mut data = self.data.lock().unwrap();
            let end = range.end as usize;
            if data.len() < end {
                data.resize(end, 0);
            }
            data[range.start as usize..end].copy_from_slice(bytes);
            if is_final {
                *self.finals.lock().unwrap() += 1;
            }
        }

        fn finish(&mut self) {
            *self.finishes.lock().unwrap() += 1;
        }
    }

    const ME: PeerId = 1;

    fn file(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn sends(actions: &[SharingAction]) -> Vec<QueuedMessage> {
        actions
            .iter()
            .filter_map(|a| match a {
                SharingAction::Send(q) => Some(q.clone()),
                _ => None,
            })
            .collect()
    }

    /// Shuttle messages between the fetcher and its servers until quiet.
    fn pump(
        fetcher: &mut FileSharing,
        servers: &mut HashMap<PeerId, Server>,
        initial: Vec<SharingAction>,
        now: Instant,
    ) -> Vec<SharingAction> {
        let mut events = Vec::new();
        let mut pending: Vec<SharingAction> = initial;
        while !pending.is_empty() {
            let mut next = Vec::new();
            for action in pending {
                match action {
                    SharingAction::Send(q) => {
                        let server = q.peer_id;
                        if let Some(s) = servers.get_mut(&server) {
                            for reply in s.answer(ME, &q.message, now) {
                                next.extend(fetcher.on_message(server, &reply.message, now));
                            }
                        }
                    }
                    other => events.push(other),
                }
            }
            pending = next;
        }
        events
    }

    fn prepare(name: &str, assigned_id: AssignedId, dictated_segment_count: Option<u32>) -> Message {
        Message::with_body(
            MessageType::PrepareFileSharing,
            &PrepareFileSharing {
                name: name.into(),
                assigned_id,
                dictated_segment_count,
            },
        )
        .unwrap()
    }

    fn get(segment_id: u32, assigned_id: AssignedId) -> Message {
        Message::with_body(
            MessageType::GetSegment,
            &GetSegment {
                segment_id,
                assigned_id,
            },
        )
        .unwrap()
    }

    #[test]
    fn fetch_from_two_servers_reassembles_file() {
        let data = file(1000);
        let mut servers = HashMap::new();
        servers.insert(10, Server::new(MemSource::with("song.flac", data.clone())));
        servers.insert(20, Server::new(MemSource::with("song.flac", data.clone())));
        let mut fetcher = FileSharing::new(DEFAULT_SEGMENT_TIMEOUT);
        let sink = MemSink::default();
        let now = Instant::now();

        let initial = fetcher
            .start_fetch("song.flac", &[10, 20], Some(100), Box::new(sink.clone()))
            .unwrap();
        assert_eq!(sends(&initial).len(), 2);
        let events = pump(&mut fetcher, &mut servers, initial, now);

        assert_eq!(
            events,
            vec![SharingAction::TransferFinished {
                name: "song.flac".into(),
                bytes_written: 1000,
                missing: vec![],
            }]
        );
        assert_eq!(*sink.data.lock().unwrap(), data);
        assert_eq!(*sink.finals.lock().unwrap(), 1);
        assert_eq!(*sink.finishes.lock().unwrap(), 1);
        assert!(!fetcher.is_fetching());
        assert!(fetcher.session().is_complete());
    }

    #[test]
    fn start_fetch_without_peers_fails() {
        let mut fetcher = FileSharing::new(DEFAULT_SEGMENT_TIMEOUT);
        let err = fetcher
            .start_fetch("x", &[], None, Box::new(MemSink::default()))
            .unwrap_err();
        assert!(matches!(err, SharingError::NoPeers));
        assert!(matches!(fetcher.pause(), Err(SharingError::NoActiveTransfer)));
    }

    #[test]
    fn prepare_asks_host_to_open_file() {
        let mut server = FileSharing::new(DEFAULT_SEGMENT_TIMEOUT);
        let actions = server.on_message(ME, &prepare("song.flac", 2, Some(10)), Instant::now());
        assert_eq!(
            actions,
            vec![SharingAction::Open(OpenRequest {
                peer_id: ME,
                assigned_id: 2,
                name: "song.flac".into(),
                dictated_segment_count: Some(10),
            })]
        );
    }

    #[test]
    fn missing_file_answers_no_such_file() {
        let mut server = Server::new(MemSource::default());
        let out = server.answer(ME, &prepare("nope", 4, None), Instant::now());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].peer_id, ME);
        assert_eq!(out[0].message.kind(), Some(MessageType::NoSuchFile));
        let body: NoSuchFile = out[0].message.decode_body().unwrap();
        assert_eq!(body.assigned_id, 4);
        assert_eq!(body.checksum, "nope");
    }

    #[test]
    fn no_such_file_kills_assignment() {
        let mut servers = HashMap::new();
        servers.insert(10, Server::new(MemSource::default()));
        let mut fetcher = FileSharing::new(DEFAULT_SEGMENT_TIMEOUT);
        let sink = MemSink::default();
        let initial = fetcher
            .start_fetch("a", &[10], None, Box::new(sink.clone()))
            .unwrap();
        let events = pump(&mut fetcher, &mut servers, initial, Instant::now());
        assert_eq!(
            events,
            vec![
                SharingAction::PeerDead {
                    assigned_id: 0,
                    peer_id: 10
                },
                SharingAction::TransferStalled {
                    name: "a".into(),
                    bytes_written: 0,
                    write_cursor: 0,
                },
            ]
        );
        assert!(!fetcher.is_fetching());
        assert_eq!(*sink.finishes.lock().unwrap(), 1);
    }

    #[test]
    fn get_segment_without_prepare_is_refused() {
        let mut server = Server::new(MemSource::with("f", file(10)));
        let out = server.answer(ME, &get(0, 0), Instant::now());
        assert_eq!(out[0].message.kind(), Some(MessageType::NoSuchSegment));
    }

    #[test]
    fn out_of_range_segment_is_refused() {
        let mut server = Server::new(MemSource::with("f", file(10)));
        let now = Instant::now();
        let out = server.answer(ME, &prepare("f", 0, Some(5)), now);
        let prepared: PreparedFileSharing = out[0].message.decode_body().unwrap();
        assert_eq!(prepared.total_segments, 5);
        assert_eq!(prepared.bytes_per_chunk, 2);
        assert_eq!(prepared.total_bytes, 10);

        let out = server.answer(ME, &get(4, 0), now);
        let seg: ReturnSegment = out[0].message.decode_body().unwrap();
        assert_eq!(seg.body, vec![8, 9]);
        let out = server.answer(ME, &get(5, 0), now);
        assert_eq!(out[0].message.kind(), Some(MessageType::NoSuchSegment));
        // Another peer never prepared this assignment.
        let out = server.answer(ME + 1, &get(0, 0), now);
        assert_eq!(out[0].message.kind(), Some(MessageType::NoSuchSegment));
    }

    #[test]
    fn huge_file_segments_fit_in_a_frame() {
        let mut server = FileSharing::new(DEFAULT_SEGMENT_TIMEOUT);
        let now = Instant::now();
        let Some(SharingAction::Open(req)) = server
            .on_message(ME, &prepare("big.iso", 0, Some(100)), now)
            .pop()
        else {
            panic!("expected an open request");
        };
        let out = sends(&server.on_opened(req, Some(2_000_000_000)));
        let prepared: PreparedFileSharing = out[0].message.decode_body().unwrap();
        assert_eq!(prepared.bytes_per_chunk, MAX_SEGMENT_SIZE);
        assert!(prepared.total_segments > 100);

        let Some(SharingAction::Read(req)) = server.on_message(ME, &get(0, 0), now).pop() else {
            panic!("expected a read request");
        };
        assert_eq!(req.range, 0..u64::from(MAX_SEGMENT_SIZE));
        let body = vec![7u8; MAX_SEGMENT_SIZE as usize];
        let out = sends(&server.on_read(req, Ok(body)));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message.kind(), Some(MessageType::ReturnSegment));
        assert!(out[0].message.body_size() <= MAX_BODY_SIZE);
        let seg: ReturnSegment = out[0].message.decode_body().unwrap();
        assert_eq!(seg.body.len(), MAX_SEGMENT_SIZE as usize);
    }

    #[test]
    fn failed_or_oversized_read_is_refused() {
        let mut server = Server::new(MemSource::with("f", file(10)));
        let now = Instant::now();
        server.answer(ME, &prepare("f", 0, Some(5)), now);
        let read = |segment_id| ReadRequest {
            peer_id: ME,
            assigned_id: 0,
            segment_id,
            name: "f".into(),
            range: 0..2,
        };

        let out = sends(&server.sharing.on_read(read(0), Err(io::ErrorKind::Other.into())));
        assert_eq!(out[0].message.kind(), Some(MessageType::NoSuchSegment));

        let out = sends(&server.sharing.on_read(read(1), Ok(vec![0u8; MAX_BODY_SIZE as usize])));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message.kind(), Some(MessageType::NoSuchSegment));
        let refused: NoSuchSegment = out[0].message.decode_body().unwrap();
        assert_eq!(refused.segment_id, 1);
    }

    #[test]
    fn read_finishing_after_disconnect_is_dropped() {
        let mut server = Server::new(MemSource::with("f", file(10)));
        let now = Instant::now();
        server.answer(ME, &prepare("f", 0, Some(5)), now);
        let Some(SharingAction::Read(req)) = server.sharing.on_message(ME, &get(1, 0), now).pop()
        else {
            panic!("expected a read request");
        };
        assert!(server.sharing.on_peer_disconnected(ME, now).is_empty());
        assert!(server.sharing.on_read(req, Ok(vec![2, 3])).is_empty());
    }

    /// Drive a fetch by hand against one prepared server, returning the GET_SEGMENTs issued.
    fn prepared_fetch(
        fetcher: &mut FileSharing,
        peers: &[PeerId],
        total: u32,
        sink: MemSink,
        now: Instant,
    ) -> Vec<QueuedMessage> {
        fetcher
            .start_fetch("f", peers, Some(total), Box::new(sink))
            .unwrap();
        let mut gets = Vec::new();
        for (assigned_id, &peer) in peers.iter().enumerate() {
            let prepared = Message::with_body(
                MessageType::PreparedFileSharing,
                &PreparedFileSharing {
                    total_segments: total,
                    assigned_id: assigned_id as AssignedId,
                    bytes_per_chunk: 4,
                    total_bytes: u64::from(total) * 4,
                },
            )
            .unwrap();
            gets.extend(sends(&fetcher.on_message(peer, &prepared, now)));
        }
        gets
    }

    fn reply(seg: &QueuedMessage) -> Message {
        let get: GetSegment = seg.message.decode_body().unwrap();
        Message::with_body(
            MessageType::ReturnSegment,
            &ReturnSegment {
                segment_id: get.segment_id,
                assigned_id: get.assigned_id,
                body: vec![get.segment_id as u8; 4],
            },
        )
        .unwrap()
    }

    #[test]
    fn silent_peer_times_out_and_leaves_gap() {
        let mut fetcher = FileSharing::new(DEFAULT_SEGMENT_TIMEOUT);
        let sink = MemSink::default();
        let now = Instant::now();
        let gets = prepared_fetch(&mut fetcher, &[10, 20], 2, sink.clone(), now);
        assert_eq!(gets.len(), 2);
        assert_eq!(gets[0].peer_id, 10);
        assert_eq!(gets[1].peer_id, 20);

        // Peer 20 answers segment 1; peer 10 stays silent on segment 0.
        let actions = fetcher.on_message(20, &reply(&gets[1]), now);
        assert!(actions.is_empty());
        assert!(fetcher.on_tick(now + Duration::from_secs(1)).is_empty());

        let actions = fetcher.on_tick(now + DEFAULT_SEGMENT_TIMEOUT);
        assert_eq!(
            actions,
            vec![SharingAction::TransferFinished {
                name: "f".into(),
                bytes_written: 4,
                missing: vec![0],
            }]
        );
        assert_eq!(sink.data.lock().unwrap()[4..8], [1, 1, 1, 1]);
    }

    #[test]
    fn trailing_gap_still_finishes_sink() {
        let mut fetcher = FileSharing::new(DEFAULT_SEGMENT_TIMEOUT);
        let sink = MemSink::default();
        let now = Instant::now();
        let gets = prepared_fetch(&mut fetcher, &[10, 20], 2, sink.clone(), now);

        // Peer 10 answers segment 0; peer 20 never answers the last segment.
        fetcher.on_message(10, &reply(&gets[0]), now);
        let actions = fetcher.on_tick(now + DEFAULT_SEGMENT_TIMEOUT);
        assert_eq!(
            actions,
            vec![SharingAction::TransferFinished {
                name: "f".into(),
                bytes_written: 4,
                missing: vec![1],
            }]
        );
        assert_eq!(*sink.finals.lock().unwrap(), 0);
        assert_eq!(*sink.finishes.lock().unwrap(), 1);
    }

    #[test]
    fn no_such_segment_counts_as_failure() {
        let mut fetcher = FileSharing::new(DEFAULT_SEGMENT_TIMEOUT);
        let now = Instant::now();
        let gets = prepared_fetch(&mut fetcher, &[10], 5, MemSink::default(), now);
        let get: GetSegment = gets[0].message.decode_body().unwrap();
        let refusal = Message::with_body(
            MessageType::NoSuchSegment,
            &NoSuchSegment {
                segment_id: get.segment_id,
                assigned_id: get.assigned_id,
            },
        )
        .unwrap();
        let actions = fetcher.on_message(10, &refusal, now);
        // Peer is idle again and gets the next segment.
        let next = sends(&actions);
        assert_eq!(next.len(), 1);
        let get: GetSegment = next[0].message.decode_body().unwrap();
        assert_eq!(get.segment_id, 1);
        assert_eq!(
            fetcher.session().assignment(0).unwrap().status().failures(),
            1
        );
        assert_eq!(fetcher.session().missing_segments(), &[0]);
    }

    #[test]
    fn layout_disagreement_kills_assignment() {
        let mut fetcher = FileSharing::new(DEFAULT_SEGMENT_TIMEOUT);
        let now = Instant::now();
        prepared_fetch(&mut fetcher, &[10], 3, MemSink::default(), now);
        // Not part of the fetch: ignored.
        let stray = Message::with_body(
            MessageType::PreparedFileSharing,
            &PreparedFileSharing {
                total_segments: 7,
                assigned_id: 0,
                bytes_per_chunk: 4,
                total_bytes: 28,
            },
        )
        .unwrap();
        assert!(fetcher.on_message(99, &stray, now).is_empty());

        let mut fetcher = FileSharing::new(DEFAULT_SEGMENT_TIMEOUT);
        fetcher
            .start_fetch("f", &[10, 20], None, Box::new(MemSink::default()))
            .unwrap();
        let prepared = |assigned_id, total_segments| {
            Message::with_body(
                MessageType::PreparedFileSharing,
                &PreparedFileSharing {
                    total_segments,
                    assigned_id,
                    bytes_per_chunk: 4,
                    total_bytes: u64::from(total_segments) * 4,
                },
            )
            .unwrap()
        };
        fetcher.on_message(10, &prepared(0, 3), now);
        let actions = fetcher.on_message(20, &prepared(1, 7), now);
        assert!(actions.contains(&SharingAction::PeerDead {
            assigned_id: 1,
            peer_id: 20
        }));
        assert!(fetcher.session().is_dead(1));
        assert_eq!(fetcher.session().segment_count(), Some(3));
    }

    #[test]
    fn disconnect_marks_assignments_dead() {
        let mut fetcher = FileSharing::new(DEFAULT_SEGMENT_TIMEOUT);
        let now = Instant::now();
        let gets = prepared_fetch(&mut fetcher, &[10, 20], 4, MemSink::default(), now);
        let actions = fetcher.on_peer_disconnected(10, now);
        assert_eq!(
            actions,
            vec![SharingAction::PeerDead {
                assigned_id: 0,
                peer_id: 10
            }]
        );
        // Segment 0 was outstanding on the dead peer; the cursor steps over it.
        assert_eq!(fetcher.session().write_cursor(), 1);
        assert!(fetcher.on_peer_disconnected(10, now).is_empty());

        let actions = fetcher.on_message(20, &reply(&gets[1]), now);
        let next = sends(&actions);
        let get: GetSegment = next[0].message.decode_body().unwrap();
        assert_eq!(get.segment_id, 2);
    }

    #[test]
    fn zero_byte_file_finishes_on_prepare() {
        let mut servers = HashMap::new();
        servers.insert(10, Server::new(MemSource::with("empty", Vec::new())));
        let mut fetcher = FileSharing::new(DEFAULT_SEGMENT_TIMEOUT);
        let initial = fetcher
            .start_fetch("empty", &[10], Some(100), Box::new(MemSink::default()))
            .unwrap();
        let events = pump(&mut fetcher, &mut servers, initial, Instant::now());
        assert_eq!(
            events,
            vec![SharingAction::TransferFinished {
                name: "empty".into(),
                bytes_written: 0,
                missing: vec![],
            }]
        );
    }

    #[test]
    fn paused_fetch_buffers_until_resumed() {
        let mut fetcher = FileSharing::new(DEFAULT_SEGMENT_TIMEOUT);
        let sink = MemSink::default();
        let now = Instant::now();
        let gets = prepared_fetch(&mut fetcher, &[10], 1, sink.clone(), now);
        fetcher.pause().unwrap();
        assert!(fetcher.on_message(10, &reply(&gets[0]), now).is_empty());
        assert!(sink.data.lock().unwrap().is_empty());
        fetcher.resume().unwrap();
        let actions = fetcher.on_tick(now);
        assert!(matches!(
            actions.as_slice(),
            [SharingAction::TransferFinished { bytes_written: 4, .. }]
        ));
        assert_eq!(*sink.data.lock().unwrap(), vec![0, 0, 0, 0]);
    }
}
