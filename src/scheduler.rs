use crate::table::{Grant, LockTable};
use crate::{LockKind, LockState, OrientationRange};

impl LockTable {
    /// One forward pass over the wait queue in arrival order, granting every
    /// request whose range contains the current orientation and which does not
    /// conflict with the grants made so far.
    ///
    /// A request skipped earlier in the pass is not revisited after a later one
    /// is granted; the next release or orientation update runs a fresh pass.
    pub(crate) fn reevaluate(&mut self) -> Vec<Grant> {
        let mut grants = Vec::new();
        let mut index = 0;
        while let Some(&seq) = self.waiting.get(index) {
            let request = &self.requests[&seq];
            let (range, kind) = (request.range, request.handle.kind);
            if !range.contains(self.orientation) || !self.admits(&range, kind, seq) {
                index += 1;
                continue;
            }
            self.requests.entry(seq).and_modify(|request| {
                request.state = LockState::Granted;
                grants.push(Grant {
                    handle: request.handle,
                    signal: request.signal.take(),
                });
            });
            self.waiting.remove(index);
            self.granted.push(seq);
            debug_assert!(self.group_is_consistent(&range), "conflicting grants in {range:?}");
        }
        grants
    }

    fn group_is_consistent(&self, range: &OrientationRange) -> bool {
        let (mut readers, mut writers) = (0, 0);
        for request in self.granted.iter().map(|seq| &self.requests[seq]) {
            if request.range != *range {
                continue;
            }
            match request.handle.kind {
                LockKind::Read => readers += 1,
                LockKind::Write => writers += 1,
            }
        }
        writers == 0 || (writers == 1 && readers == 0)
    }
}
