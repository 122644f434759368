use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;

use crate::orientation::{DeviceOrientation, OrientationRange};
use crate::{LockHandle, LockKind, LockState};

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) struct LockRequest {
    pub(crate) handle: LockHandle,
    pub(crate) range: OrientationRange,
    pub(crate) state: LockState,
    /// Taken when the request is granted. Dropping it while the request is
    /// still waiting wakes the waiter with a closed channel.
    pub(crate) signal: Option<oneshot::Sender<()>>,
}

/// A request the scheduler just granted, to be signalled once the table lock
/// has been released.
pub(crate) struct Grant {
    pub(crate) handle: LockHandle,
    pub(crate) signal: Option<oneshot::Sender<()>>,
}

/// All outstanding requests of one lock manager.
///
/// Requests live in `requests` keyed by their sequence number; `waiting` and
/// `granted` only hold sequence numbers, in arrival and grant order.
pub(crate) struct LockTable {
    table_id: u64,
    next_seq: u64,
    pub(crate) orientation: DeviceOrientation,
    pub(crate) closed: bool,
    pub(crate) requests: HashMap<u64, LockRequest>,
    pub(crate) waiting: VecDeque<u64>,
    pub(crate) granted: Vec<u64>,
}

impl LockTable {
    pub(crate) fn new(orientation: DeviceOrientation) -> Self {
        Self {
            table_id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            next_seq: 0,
            orientation,
            closed: false,
            requests: HashMap::new(),
            waiting: VecDeque::new(),
            granted: Vec::new(),
        }
    }

    fn next_handle(&mut self, kind: LockKind) -> LockHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        LockHandle {
            table_id: self.table_id,
            seq,
            kind,
        }
    }

    /// Appends a new waiting request to the back of the queue.
    pub(crate) fn enqueue(
        &mut self,
        range: OrientationRange,
        kind: LockKind,
    ) -> (LockHandle, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let handle = self.next_handle(kind);
        self.requests.insert(
            handle.seq,
            LockRequest {
                handle,
                range,
                state: LockState::Waiting,
                signal: Some(tx),
            },
        );
        self.waiting.push_back(handle.seq);
        (handle, rx)
    }

    /// Inserts a request straight into the grant set, bypassing the queue.
    /// The caller must have checked that a scheduler pass would grant it.
    pub(crate) fn insert_granted(
        &mut self,
        range: OrientationRange,
        kind: LockKind,
    ) -> LockHandle {
        let handle = self.next_handle(kind);
        self.requests.insert(
            handle.seq,
            LockRequest {
                handle,
                range,
                state: LockState::Granted,
                signal: None,
            },
        );
        self.granted.push(handle.seq);
        handle
    }

    pub(crate) fn get(&self, handle: LockHandle) -> Option<&LockRequest> {
        if handle.table_id != self.table_id {
            return None;
        }
        self.requests
            .get(&handle.seq)
            .filter(|request| request.handle.kind == handle.kind)
    }

    pub(crate) fn state(&self, handle: LockHandle) -> LockState {
        self.get(handle)
            .map_or(LockState::Freed, |request| request.state)
    }

    /// Frees a granted request. Returns `false`, changing nothing, if `handle`
    /// is not currently granted.
    pub(crate) fn free_granted(&mut self, handle: LockHandle) -> bool {
        if self.state(handle) != LockState::Granted {
            return false;
        }
        self.granted.retain(|&seq| seq != handle.seq);
        self.requests.remove(&handle.seq);
        true
    }

    /// Frees a waiting request without granting it, dropping its signal.
    /// Returns `false`, changing nothing, if `handle` is not currently waiting.
    pub(crate) fn free_waiting(&mut self, handle: LockHandle) -> bool {
        if self.state(handle) != LockState::Waiting {
            return false;
        }
        self.waiting.retain(|&seq| seq != handle.seq);
        self.requests.remove(&handle.seq);
        true
    }

    /// Frees every waiting request. Their waiters observe a closed channel.
    pub(crate) fn drain_waiting(&mut self) -> usize {
        let drained = self.waiting.len();
        for seq in self.waiting.drain(..) {
            self.requests.remove(&seq);
        }
        drained
    }

    /// The earliest-granted request of `kind` in the group of `range`.
    pub(crate) fn first_granted_in_group(
        &self,
        range: &OrientationRange,
        kind: LockKind,
    ) -> Option<LockHandle> {
        self.granted
            .iter()
            .map(|seq| &self.requests[seq])
            .find(|request| request.handle.kind == kind && request.range == *range)
            .map(|request| request.handle)
    }

    fn granted_in_group(&self, range: &OrientationRange, kind: LockKind) -> bool {
        self.first_granted_in_group(range, kind).is_some()
    }

    pub(crate) fn has_granted_writer(&self, range: &OrientationRange) -> bool {
        self.granted_in_group(range, LockKind::Write)
    }

    pub(crate) fn has_granted_reader(&self, range: &OrientationRange) -> bool {
        self.granted_in_group(range, LockKind::Read)
    }

    /// Whether a writer of the group of `range` that arrived before `before`
    /// is still waiting.
    pub(crate) fn has_earlier_waiting_writer(
        &self,
        range: &OrientationRange,
        before: u64,
    ) -> bool {
        self.waiting
            .iter()
            .take_while(|&&seq| seq < before)
            .map(|seq| &self.requests[seq])
            .any(|request| request.handle.kind == LockKind::Write && request.range == *range)
    }

    /// Whether a new request arriving now would be granted by the next pass.
    pub(crate) fn grantable_now(&self, range: &OrientationRange, kind: LockKind) -> bool {
        range.contains(self.orientation) && self.admits(range, kind, self.next_seq)
    }

    /// The reader/writer part of the grant rule, for a request of the group of
    /// `range` that arrived at `seq`.
    pub(crate) fn admits(&self, range: &OrientationRange, kind: LockKind, seq: u64) -> bool {
        match kind {
            LockKind::Read => {
                !self.has_granted_writer(range) && !self.has_earlier_waiting_writer(range, seq)
            }
            LockKind::Write => !self.has_granted_writer(range) && !self.has_granted_reader(range),
        }
    }
}
