//! Segmented transfer engine: per-peer request state, strict-order reassembly, timeouts.
//!
//! Each participating peer gets a [`PeerAssignment`] addressed by a dense [`AssignedId`].
//! Segments land in that assignment's FIFO and are released to the sink strictly in
//! ascending `segment_id` order by [`TransferSession::try_write`].
//!
//! Timeouts are deadlines evaluated by [`TransferSession::expire_timeouts`]; the host calls
//! it on every tick with the current time. A response disarms its deadline in the same
//! call that buffers it, so a response and an expiry never both count.

use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use crate::protocol::{AssignedId, GetSegment, PeerId, ReturnSegment};
use crate::segment::{SegmentLayout, SegmentSink};

/// How long a peer has to answer a GET_SEGMENT.
pub const DEFAULT_SEGMENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive failures after which an assignment is dead.
pub const MAX_CONSECUTIVE_FAILURES: u8 = 3;

/// Passes over all queues per `try_write` call.
const WRITE_PASSES: usize = 2;

/// Request state of one assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Not waiting for anything; eligible for the next request.
    Idle { failures: u8 },
    /// A request is outstanding.
    Busy { failures: u8 },
    /// Permanently excluded from selection.
    Dead,
}

impl PeerStatus {
    pub fn failures(self) -> u8 {
        match self {
            PeerStatus::Idle { failures } | PeerStatus::Busy { failures } => failures,
            PeerStatus::Dead => MAX_CONSECUTIVE_FAILURES,
        }
    }

    pub fn is_idle(self) -> bool {
        matches!(self, PeerStatus::Idle { .. })
    }

    pub fn is_dead(self) -> bool {
        matches!(self, PeerStatus::Dead)
    }

    fn busy(self) -> Self {
        match self {
            PeerStatus::Idle { failures } => PeerStatus::Busy { failures },
            other => other,
        }
    }

    fn idle(self) -> Self {
        match self {
            PeerStatus::Busy { failures } => PeerStatus::Idle { failures },
            other => other,
        }
    }

    fn delivered(self) -> Self {
        match self {
            PeerStatus::Idle { .. } => PeerStatus::Idle { failures: 0 },
            PeerStatus::Busy { .. } => PeerStatus::Busy { failures: 0 },
            PeerStatus::Dead => PeerStatus::Dead,
        }
    }

    fn failed(self) -> Self {
        match self {
            PeerStatus::Idle { failures } | PeerStatus::Busy { failures } => {
                let failures = failures.saturating_add(1);
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    PeerStatus::Dead
                } else {
                    PeerStatus::Idle { failures }
                }
            }
            PeerStatus::Dead => PeerStatus::Dead,
        }
    }
}

impl Default for PeerStatus {
    fn default() -> Self {
        PeerStatus::Idle { failures: 0 }
    }
}

/// One peer's role in the current session.
#[derive(Debug)]
pub struct PeerAssignment {
    assigned_id: AssignedId,
    peer_id: PeerId,
    queue: VecDeque<ReturnSegment>,
    status: PeerStatus,
    /// Armed timeout, if a request is outstanding.
    deadline: Option<Instant>,
    in_flight: Option<u32>,
}

impl PeerAssignment {
    fn new(assigned_id: AssignedId, peer_id: PeerId) -> Self {
        Self {
            assigned_id,
            peer_id,
            queue: VecDeque::new(),
            status: PeerStatus::default(),
            deadline: None,
            in_flight: None,
        }
    }

    pub fn assigned_id(&self) -> AssignedId {
        self.assigned_id
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Segment id of the outstanding request, if any.
    pub fn in_flight(&self) -> Option<u32> {
        self.in_flight
    }

    /// Number of buffered segments waiting for their turn.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

/// What happened to a segment handed to [`TransferSession::push_segment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Answer to the outstanding request: timeout disarmed, segment buffered.
    Answered,
    /// Buffered, but not the outstanding request (late or unsolicited). Timer untouched.
    Unsolicited,
    /// No such assignment in this session; segment dropped.
    UnknownAssignment,
}

/// Result of a timeout expiry or an explicit failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub assigned_id: AssignedId,
    pub peer_id: PeerId,
    /// The segment that was outstanding, now skipped.
    pub segment_id: Option<u32>,
    pub failures: u8,
    /// True if this failure killed the assignment.
    pub dead: bool,
}

/// Global state of the one active segmented transfer.
#[derive(Debug)]
pub struct TransferSession {
    total_segment_count: Option<u32>,
    bytes_per_chunk: Option<u32>,
    next_segment_to_request: u32,
    next_segment_to_write: u32,
    bytes_written: u64,
    paused: bool,
    /// Segments given up on that the write cursor has not reached yet.
    skipped: BTreeSet<u32>,
    /// Segments the write cursor stepped over without writing.
    missing: Vec<u32>,
    assignments: Vec<PeerAssignment>,
    timeout: Duration,
}

impl TransferSession {
    pub fn new(timeout: Duration) -> Self {
        Self {
            total_segment_count: None,
            bytes_per_chunk: None,
            next_segment_to_request: 0,
            next_segment_to_write: 0,
            bytes_written: 0,
            paused: false,
            skipped: BTreeSet::new(),
            missing: Vec::new(),
            assignments: Vec::new(),
            timeout,
        }
    }

    /// Forget everything about the current transfer. The timeout setting is kept.
    pub fn reset(&mut self) {
        *self = Self::new(self.timeout);
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a participating peer. Returns its assigned id (dense, never reused in this session).
    pub fn add_peer(&mut self, peer_id: PeerId) -> AssignedId {
        let assigned_id = self.assignments.len() as AssignedId;
        self.assignments
            .push(PeerAssignment::new(assigned_id, peer_id));
        tracing::debug!(assigned_id, peer_id, "peer joined transfer");
        assigned_id
    }

    pub fn assignment(&self, assigned_id: AssignedId) -> Option<&PeerAssignment> {
        self.assignments.get(assigned_id as usize)
    }

    pub fn assignments(&self) -> &[PeerAssignment] {
        &self.assignments
    }

    pub fn peer_id(&self, assigned_id: AssignedId) -> Option<PeerId> {
        self.assignment(assigned_id).map(|a| a.peer_id)
    }

    /// Assigned ids bound to `peer_id`.
    pub fn assignments_for_peer(&self, peer_id: PeerId) -> Vec<AssignedId> {
        self.assignments
            .iter()
            .filter(|a| a.peer_id == peer_id)
            .map(|a| a.assigned_id)
            .collect()
    }

    /// Fix the number of segments; offsets are then derived from bytes already written.
    pub fn set_segment_count(&mut self, total: u32) {
        self.total_segment_count = Some(total);
    }

    /// Fix the number of segments and their size; offsets are `segment_id * bytes_per_chunk`.
    pub fn set_layout(&mut self, layout: SegmentLayout) {
        self.total_segment_count = Some(layout.total_segments);
        self.bytes_per_chunk = Some(layout.bytes_per_chunk);
    }

    pub fn segment_count(&self) -> Option<u32> {
        self.total_segment_count
    }

    /// Hand out the next segment id to request, advancing the request cursor.
    pub fn next_segment_id(&mut self) -> Option<u32> {
        let total = self.total_segment_count?;
        if self.next_segment_to_request >= total {
            return None;
        }
        let id = self.next_segment_to_request;
        self.next_segment_to_request += 1;
        Some(id)
    }

    /// True once every segment id has been dispatched as a request (not necessarily answered).
    pub fn all_requested(&self) -> bool {
        self.total_segment_count
            .is_some_and(|total| self.next_segment_to_request >= total)
    }

    /// Idle and not dead.
    pub fn is_idle(&self, assigned_id: AssignedId) -> bool {
        self.assignment(assigned_id)
            .is_some_and(|a| a.status.is_idle())
    }

    pub fn is_dead(&self, assigned_id: AssignedId) -> bool {
        self.assignment(assigned_id)
            .is_some_and(|a| a.status.is_dead())
    }

    /// Assignments eligible for a new request, in assigned order.
    pub fn idle_peers(&self) -> Vec<AssignedId> {
        self.assignments
            .iter()
            .filter(|a| a.status.is_idle())
            .map(|a| a.assigned_id)
            .collect()
    }

    /// True if at least one assignment is not dead.
    pub fn has_live_peers(&self) -> bool {
        self.assignments.iter().any(|a| !a.status.is_dead())
    }

    /// Task an idle assignment with the next segment: marks it busy and arms its timeout.
    pub fn request_segment(&mut self, assigned_id: AssignedId, now: Instant) -> Option<GetSegment> {
        if !self.is_idle(assigned_id) {
            return None;
        }
        let segment_id = self.next_segment_id()?;
        let deadline = now + self.timeout;
        let a = &mut self.assignments[assigned_id as usize];
        a.status = a.status.busy();
        a.deadline = Some(deadline);
        a.in_flight = Some(segment_id);
        Some(GetSegment {
            segment_id,
            assigned_id,
        })
    }

    /// Return a busy assignment to idle. Dead assignments stay dead.
    pub fn set_idle(&mut self, assigned_id: AssignedId) {
        if let Some(a) = self.assignments.get_mut(assigned_id as usize) {
            a.status = a.status.idle();
        }
    }

    /// Kill an assignment outright (peer gone, file missing, inconsistent layout).
    /// Its outstanding segment, if any, is skipped. Returns true if it was alive.
    pub fn mark_dead(&mut self, assigned_id: AssignedId) -> bool {
        let Some(a) = self.assignments.get_mut(assigned_id as usize) else {
            return false;
        };
        if a.status.is_dead() {
            return false;
        }
        a.status = PeerStatus::Dead;
        a.deadline = None;
        let in_flight = a.in_flight.take();
        let peer_id = a.peer_id;
        if let Some(segment_id) = in_flight {
            self.skip(segment_id);
        }
        tracing::info!(assigned_id, peer_id, "transfer peer marked dead");
        true
    }

    /// Buffer an arriving segment in its assignment's queue.
    pub fn push_segment(&mut self, segment: ReturnSegment) -> Delivery {
        let Some(a) = self.assignments.get_mut(segment.assigned_id as usize) else {
            return Delivery::UnknownAssignment;
        };
        let answered = a.in_flight == Some(segment.segment_id);
        if answered {
            a.deadline = None;
            a.in_flight = None;
            a.status = a.status.delivered();
        }
        a.queue.push_back(segment);
        if answered {
            Delivery::Answered
        } else {
            Delivery::Unsolicited
        }
    }

    /// Count a failure against an assignment (timeout or explicit refusal).
    ///
    /// The outstanding segment is skipped: the write cursor steps over it once it gets there
    /// rather than waiting for it forever. Nothing is re-requested.
    pub fn record_failure(&mut self, assigned_id: AssignedId) -> Option<FailureOutcome> {
        let a = self.assignments.get_mut(assigned_id as usize)?;
        if a.status.is_dead() {
            return None;
        }
        a.deadline = None;
        a.status = a.status.failed();
        let segment_id = a.in_flight.take();
        let outcome = FailureOutcome {
            assigned_id,
            peer_id: a.peer_id,
            segment_id,
            failures: a.status.failures(),
            dead: a.status.is_dead(),
        };
        if let Some(segment_id) = segment_id {
            self.skip(segment_id);
        }
        if outcome.dead {
            tracing::warn!(assigned_id, peer_id = outcome.peer_id, "transfer peer dead after repeated failures");
        } else {
            tracing::debug!(
                assigned_id,
                peer_id = outcome.peer_id,
                failures = outcome.failures,
                segment = ?segment_id,
                "segment request failed"
            );
        }
        Some(outcome)
    }

    /// Expire every armed deadline at or before `now`.
    pub fn expire_timeouts(&mut self, now: Instant) -> Vec<FailureOutcome> {
        let expired: Vec<AssignedId> = self
            .assignments
            .iter()
            .filter(|a| a.deadline.is_some_and(|d| d <= now))
            .map(|a| a.assigned_id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.record_failure(id))
            .collect()
    }

    /// Release in-order segments to `sink`. Bounded: at most two passes over all queues.
    /// Returns the number of segments written.
    pub fn try_write<S: SegmentSink + ?Sized>(&mut self, sink: &mut S) -> usize {
        if self.paused || self.is_finished() {
            return 0;
        }
        let Some(total) = self.total_segment_count else {
            return 0;
        };
        let mut written = 0;
        for _ in 0..WRITE_PASSES {
            let mut all_empty = true;
            for i in 0..self.assignments.len() {
                let Some(front) = self.assignments[i].queue.front() else {
                    continue;
                };
                all_empty = false;
                if front.segment_id == self.next_segment_to_write {
                    let Some(segment) = self.assignments[i].queue.pop_front() else {
                        continue;
                    };
                    let is_final = self.next_segment_to_write + 1 == total;
                    let len = segment.body.len() as u64;
                    let start = match self.bytes_per_chunk {
                        Some(bpc) => u64::from(segment.segment_id) * u64::from(bpc),
                        None => self.bytes_written,
                    };
                    sink.write_segment(start..start + len, &segment.body, is_final);
                    self.bytes_written += len;
                    self.next_segment_to_write += 1;
                    written += 1;
                    self.advance_past_skipped();
                    if is_final {
                        return written;
                    }
                } else if front.segment_id < self.next_segment_to_write {
                    let stale = front.segment_id;
                    self.assignments[i].queue.pop_front();
                    tracing::debug!(segment = stale, cursor = self.next_segment_to_write, "dropped stale segment");
                }
            }
            if all_empty {
                break;
            }
        }
        written
    }

    fn skip(&mut self, segment_id: u32) {
        if segment_id >= self.next_segment_to_write {
            self.skipped.insert(segment_id);
        }
        self.advance_past_skipped();
    }

    fn advance_past_skipped(&mut self) {
        while self.skipped.remove(&self.next_segment_to_write) {
            self.missing.push(self.next_segment_to_write);
            self.next_segment_to_write += 1;
        }
    }

    /// Suppress writing (sink backpressure). Arrivals keep buffering.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Next segment id eligible to be written.
    pub fn write_cursor(&self) -> u32 {
        self.next_segment_to_write
    }

    /// Segments stepped over without being written.
    pub fn missing_segments(&self) -> &[u32] {
        &self.missing
    }

    /// The write cursor has reached the end of the file.
    pub fn is_finished(&self) -> bool {
        self.total_segment_count
            .is_some_and(|total| self.next_segment_to_write >= total)
    }

    /// Finished with every segment written.
    pub fn is_complete(&self) -> bool {
        self.is_finished() && self.missing.is_empty()
    }
}

impl Default for TransferSession {
    fn default() -> Self {
        Self::new(DEFAULT_SEGMENT_TIMEOUT)
    }
}
