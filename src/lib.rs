//! `orientation_lock` provides a reader/writer lock whose grants are gated on
//! the physical orientation of the device. A request names an orientation
//! window and a lock kind, and is only granted while the most recently
//! reported orientation lies inside that window and the usual reader/writer
//! exclusion allows it.
//!
//! # Core Concepts
//!
//! * **OrientationLock**: The lock manager. It holds the current orientation,
//!   the queue of waiting requests and the set of granted ones. Clones share
//!   the same manager.
//!
//! * **OrientationRange**: A center orientation plus a per-axis tolerance.
//!   Requests with equal ranges form a *range group*; reader/writer exclusion
//!   applies within a group only.
//!
//! * **PendingLock**: A queued request. Waiting on it yields a [LockHandle]
//!   once the request is granted; dropping it withdraws the request.
//!
//! * **LockHandle**: Identifies a granted request and must be passed back to
//!   [release_read](OrientationLock::release_read) or
//!   [release_write](OrientationLock::release_write) exactly once.
//!
//! * **OrientationGuard**: Releases its lock when dropped.
//!
//! Every time the orientation changes or a lock is released, the waiting
//! requests are re-examined in arrival order. A waiting writer keeps later
//! readers of the same group from being granted ahead of it.
//!
//! # Example
//! ```
//! use orientation_lock::{DeviceOrientation, OrientationLock, OrientationRange};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let lock = OrientationLock::new();
//!     // Face down: pitch near 180, roll near 0, any azimuth.
//!     let face_down = OrientationRange::new(DeviceOrientation::new(0, 180, 0), 180, 10, 10);
//!
//!     let writer = tokio::spawn({
//!         let lock = lock.clone();
//!         async move {
//!             let guard = lock.write(face_down).await.unwrap();
//!             // Exclusive within the face-down group until `guard` drops.
//!             drop(guard);
//!         }
//!     });
//!     tokio::task::yield_now().await;
//!
//!     // The sensor reports the device has been turned over.
//!     lock.set_orientation(DeviceOrientation::new(90, 182, -3));
//!     writer.await.unwrap();
//!
//!     // Readers of the same window share it.
//!     let first = lock.acquire_read(face_down).await.unwrap();
//!     let second = lock.acquire_read(face_down).await.unwrap();
//!     lock.release_read(first).unwrap();
//!     lock.release_read(second).unwrap();
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use awaitable_bool::AwaitableBool;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use table::{Grant, LockTable};

mod orientation;
mod scheduler;
mod table;

pub use orientation::{DeviceOrientation, OrientationRange};

pub mod error {
    use std::fmt;

    use crate::{LockHandle, LockKind};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Axis {
        Azimuth,
        Pitch,
        Roll,
    }

    impl fmt::Display for Axis {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                Axis::Azimuth => "azimuth",
                Axis::Pitch => "pitch",
                Axis::Roll => "roll",
            })
        }
    }

    /// An orientation or range payload that could not be decoded. Nothing is
    /// changed when one of these is returned.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum InvalidInput {
        #[error("expected {expected} bytes, got {actual}")]
        Length { expected: usize, actual: usize },
        #[error("{axis} tolerance must not be negative, got {value}")]
        NegativeTolerance { axis: Axis, value: i32 },
        #[error("malformed orientation {0:?}, expected `azimuth pitch roll`")]
        Malformed(String),
    }

    /// The handle is unknown, already freed, of the other lock kind, or not in
    /// the state the operation requires.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
    #[error("invalid lock handle {0:?}")]
    pub struct InvalidHandle(pub LockHandle);

    /// No granted lock of `kind` exists for the given range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
    #[error("no {kind} lock is held on this range")]
    pub struct NotHeld {
        pub kind: LockKind,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
    pub enum AcquireError {
        /// The request was withdrawn with
        /// [cancel](super::OrientationLock::cancel) before it was granted.
        #[error("lock request was cancelled")]
        Cancelled,
        /// The deadline passed before the request was granted.
        #[error("lock request timed out")]
        TimedOut,
        /// The [OrientationLock](super::OrientationLock) has been shut down.
        #[error("orientation lock has been shut down")]
        Closed,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
    pub enum TryAcquireError {
        /// The request would have had to wait.
        #[error("lock is not available right now")]
        WouldBlock,
        /// The [OrientationLock](super::OrientationLock) has been shut down.
        #[error("orientation lock has been shut down")]
        Closed,
    }
}

use error::{AcquireError, InvalidHandle, InvalidInput, NotHeld, TryAcquireError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    Read,
    Write,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockKind::Read => "read",
            LockKind::Write => "write",
        })
    }
}

/// A request moves from `Waiting` to `Granted` to `Freed`, or straight from
/// `Waiting` to `Freed` when it is cancelled. It never goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Waiting,
    Granted,
    Freed,
}

/// Identifies one lock request of one [OrientationLock].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockHandle {
    table_id: u64,
    seq: u64,
    kind: LockKind,
}

impl LockHandle {
    /// Arrival sequence number. Lower numbers arrived earlier.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Orientation assumed until the first update arrives.
    pub initial_orientation: DeviceOrientation,
    /// Deadline applied by [acquire](OrientationLock::acquire) and the
    /// functions built on it. `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub handle: LockHandle,
    pub range: OrientationRange,
}

/// A point-in-time copy of a lock manager's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSnapshot {
    pub orientation: DeviceOrientation,
    /// In arrival order.
    pub waiting: Vec<RequestInfo>,
    /// In grant order.
    pub granted: Vec<RequestInfo>,
}

#[derive(Clone)]
pub struct OrientationLock {
    inner: Arc<Inner>,
}

struct Inner {
    table: Mutex<LockTable>,
    closed: AwaitableBool,
    acquire_timeout: Option<Duration>,
}

/// A queued lock request. See [OrientationLock::request].
///
/// Dropping a `PendingLock`, or a future waiting on one, withdraws the
/// request. If it had already been granted, the grant is released.
pub struct PendingLock {
    ticket: Ticket,
    rx: oneshot::Receiver<()>,
}

/// The part of a [PendingLock] responsible for cleaning up after it.
struct Ticket {
    lock: OrientationLock,
    handle: LockHandle,
    settled: bool,
}

/// A granted lock that is released when dropped.
pub struct OrientationGuard {
    lock: OrientationLock,
    handle: LockHandle,
    detached: bool,
}

impl Default for OrientationLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OrientationLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrientationLock")
            .field("orientation", &self.orientation())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl OrientationLock {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(LockTable::new(config.initial_orientation)),
                closed: AwaitableBool::new(false),
                acquire_timeout: config.acquire_timeout,
            }),
        }
    }

    pub fn orientation(&self) -> DeviceOrientation {
        self.inner.table.lock().orientation
    }

    /// Records a new orientation reading and grants whatever waiting requests
    /// it makes eligible before returning.
    pub fn set_orientation(&self, orientation: DeviceOrientation) {
        let grants = {
            let mut table = self.inner.table.lock();
            table.orientation = orientation;
            table.reevaluate()
        };
        info!(%orientation, granted = grants.len(), "orientation updated");
        notify(grants);
    }

    /// Like [set_orientation](Self::set_orientation), for a payload in the
    /// format of [DeviceOrientation::decode].
    pub fn set_orientation_bytes(&self, payload: &[u8]) -> Result<(), InvalidInput> {
        let orientation = DeviceOrientation::decode(payload)
            .inspect_err(|err| warn!(%err, "rejected orientation payload"))?;
        self.set_orientation(orientation);
        Ok(())
    }

    /// Queues a request for `kind` access to the group of `range`.
    ///
    /// The request is considered right away, so it may already be granted by
    /// the time this returns. Use the returned [PendingLock] to wait for the
    /// grant.
    pub fn request(
        &self,
        range: OrientationRange,
        kind: LockKind,
    ) -> Result<PendingLock, AcquireError> {
        let (handle, rx, grants) = {
            let mut table = self.inner.table.lock();
            if table.closed {
                return Err(AcquireError::Closed);
            }
            let (handle, rx) = table.enqueue(range, kind);
            (handle, rx, table.reevaluate())
        };
        debug!(seq = handle.seq, %kind, ?range, "lock requested");
        notify(grants);
        Ok(PendingLock {
            ticket: Ticket {
                lock: self.clone(),
                handle,
                settled: false,
            },
            rx,
        })
    }

    /// Waits until a `kind` lock on `range` is granted, or until the
    /// configured [acquire_timeout](Config::acquire_timeout) passes.
    pub async fn acquire(
        &self,
        range: OrientationRange,
        kind: LockKind,
    ) -> Result<LockHandle, AcquireError> {
        let pending = self.request(range, kind)?;
        match self.inner.acquire_timeout {
            Some(timeout) => pending.wait_timeout(timeout).await,
            None => pending.wait().await,
        }
    }

    pub async fn acquire_read(&self, range: OrientationRange) -> Result<LockHandle, AcquireError> {
        self.acquire(range, LockKind::Read).await
    }

    pub async fn acquire_write(&self, range: OrientationRange) -> Result<LockHandle, AcquireError> {
        self.acquire(range, LockKind::Write).await
    }

    /// Blocks the current thread until the lock is granted. Ignores
    /// [acquire_timeout](Config::acquire_timeout).
    ///
    /// # Panics
    /// Panics if called from within an asynchronous execution context.
    pub fn blocking_acquire(
        &self,
        range: OrientationRange,
        kind: LockKind,
    ) -> Result<LockHandle, AcquireError> {
        self.request(range, kind)?.blocking_wait()
    }

    pub fn blocking_acquire_read(
        &self,
        range: OrientationRange,
    ) -> Result<LockHandle, AcquireError> {
        self.blocking_acquire(range, LockKind::Read)
    }

    pub fn blocking_acquire_write(
        &self,
        range: OrientationRange,
    ) -> Result<LockHandle, AcquireError> {
        self.blocking_acquire(range, LockKind::Write)
    }

    /// Grants the lock only if a request made now would be granted without
    /// waiting. Never queues.
    pub fn try_acquire(
        &self,
        range: OrientationRange,
        kind: LockKind,
    ) -> Result<LockHandle, TryAcquireError> {
        let handle = {
            let mut table = self.inner.table.lock();
            if table.closed {
                return Err(TryAcquireError::Closed);
            }
            if !table.grantable_now(&range, kind) {
                return Err(TryAcquireError::WouldBlock);
            }
            table.insert_granted(range, kind)
        };
        debug!(seq = handle.seq, %kind, "lock granted without waiting");
        Ok(handle)
    }

    /// Acquires a read lock released when the returned guard drops.
    pub async fn read(&self, range: OrientationRange) -> Result<OrientationGuard, AcquireError> {
        self.guarded(range, LockKind::Read).await
    }

    /// Acquires a write lock released when the returned guard drops.
    pub async fn write(&self, range: OrientationRange) -> Result<OrientationGuard, AcquireError> {
        self.guarded(range, LockKind::Write).await
    }

    async fn guarded(
        &self,
        range: OrientationRange,
        kind: LockKind,
    ) -> Result<OrientationGuard, AcquireError> {
        let handle = self.acquire(range, kind).await?;
        Ok(OrientationGuard {
            lock: self.clone(),
            handle,
            detached: false,
        })
    }

    pub fn release_read(&self, handle: LockHandle) -> Result<(), InvalidHandle> {
        self.release(handle, LockKind::Read)
    }

    pub fn release_write(&self, handle: LockHandle) -> Result<(), InvalidHandle> {
        self.release(handle, LockKind::Write)
    }

    fn release(&self, handle: LockHandle, kind: LockKind) -> Result<(), InvalidHandle> {
        if handle.kind != kind {
            return Err(InvalidHandle(handle));
        }
        let grants = {
            let mut table = self.inner.table.lock();
            if !table.free_granted(handle) {
                return Err(InvalidHandle(handle));
            }
            table.reevaluate()
        };
        debug!(seq = handle.seq, %kind, "lock released");
        notify(grants);
        Ok(())
    }

    /// Releases the earliest-granted `kind` lock in the group of `range`, for
    /// callers that identify their lock by its range rather than its handle.
    ///
    /// The grant is freed even if its waiter has not observed it yet; that
    /// waiter still receives the handle, which is then already released.
    pub fn release_matching(
        &self,
        range: &OrientationRange,
        kind: LockKind,
    ) -> Result<LockHandle, NotHeld> {
        let (handle, grants) = {
            let mut table = self.inner.table.lock();
            let handle = table
                .first_granted_in_group(range, kind)
                .ok_or(NotHeld { kind })?;
            table.free_granted(handle);
            (handle, table.reevaluate())
        };
        debug!(seq = handle.seq, %kind, "lock released by range");
        notify(grants);
        Ok(handle)
    }

    /// Withdraws a request that is still waiting. Its waiter fails with
    /// [AcquireError::Cancelled].
    ///
    /// A request that has already been granted belongs to its waiter, which
    /// must release it; cancelling it fails with [InvalidHandle].
    pub fn cancel(&self, handle: LockHandle) -> Result<(), InvalidHandle> {
        let grants = {
            let mut table = self.inner.table.lock();
            if !table.free_waiting(handle) {
                return Err(InvalidHandle(handle));
            }
            table.reevaluate()
        };
        debug!(seq = handle.seq, kind = %handle.kind, "lock request cancelled");
        notify(grants);
        Ok(())
    }

    /// The current state of `handle`. Handles this manager does not know of
    /// are reported as [LockState::Freed].
    pub fn state(&self, handle: LockHandle) -> LockState {
        self.inner.table.lock().state(handle)
    }

    pub fn snapshot(&self) -> TableSnapshot {
        let table = self.inner.table.lock();
        let info = |seq: &u64| {
            let request = &table.requests[seq];
            RequestInfo {
                handle: request.handle,
                range: request.range,
            }
        };
        TableSnapshot {
            orientation: table.orientation,
            waiting: table.waiting.iter().map(info).collect(),
            granted: table.granted.iter().map(info).collect(),
        }
    }

    /// Refuses new requests and fails every waiting one with
    /// [AcquireError::Closed]. Granted locks stay valid until released.
    pub fn shutdown(&self) {
        let drained = {
            let mut table = self.inner.table.lock();
            table.closed = true;
            table.drain_waiting()
        };
        self.inner.closed.set_true();
        info!(drained, "orientation lock shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_true()
    }

    /// Completes once [shutdown](Self::shutdown) has been called.
    pub async fn closed(&self) {
        self.inner.closed.wait_true().await
    }
}

fn notify(grants: Vec<Grant>) {
    for grant in grants {
        debug!(seq = grant.handle.seq, kind = %grant.handle.kind, "lock granted");
        if let Some(signal) = grant.signal {
            // A closed receiver means the waiter gave up; its ticket resolves
            // the grant under the table lock.
            let _ = signal.send(());
        }
    }
}

impl PendingLock {
    pub fn handle(&self) -> LockHandle {
        self.ticket.handle
    }

    /// Waits for the request to be granted.
    pub async fn wait(self) -> Result<LockHandle, AcquireError> {
        let PendingLock { mut ticket, rx } = self;
        let signalled = rx.await.is_ok();
        ticket.settle(signalled, AcquireError::Cancelled)
    }

    /// Waits at most `timeout` for the request to be granted. If it is granted
    /// while the deadline is being handled, the grant wins.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<LockHandle, AcquireError> {
        let PendingLock { mut ticket, rx } = self;
        match tokio::time::timeout(timeout, rx).await {
            Ok(result) => ticket.settle(result.is_ok(), AcquireError::Cancelled),
            Err(_) => ticket.settle(false, AcquireError::TimedOut),
        }
    }

    /// Blocks the current thread until the request is granted.
    ///
    /// # Panics
    /// Panics if called from within an asynchronous execution context.
    pub fn blocking_wait(self) -> Result<LockHandle, AcquireError> {
        let PendingLock { mut ticket, rx } = self;
        let signalled = rx.blocking_recv().is_ok();
        ticket.settle(signalled, AcquireError::Cancelled)
    }
}

impl Ticket {
    /// Decides the outcome of a wait. Without a signal, the table is the
    /// authority: a request found granted is handed to the caller, one still
    /// waiting is withdrawn and fails with `withdrawn`.
    fn settle(
        &mut self,
        signalled: bool,
        withdrawn: AcquireError,
    ) -> Result<LockHandle, AcquireError> {
        self.settled = true;
        if signalled {
            return Ok(self.handle);
        }
        let (state, closed, grants) = {
            let mut table = self.lock.inner.table.lock();
            let state = table.state(self.handle);
            let grants = if table.free_waiting(self.handle) {
                table.reevaluate()
            } else {
                Vec::new()
            };
            (state, table.closed, grants)
        };
        notify(grants);
        match state {
            LockState::Granted => Ok(self.handle),
            LockState::Waiting => {
                debug!(seq = self.handle.seq, %withdrawn, "lock request withdrawn");
                Err(withdrawn)
            }
            LockState::Freed if closed => Err(AcquireError::Closed),
            LockState::Freed => Err(AcquireError::Cancelled),
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let grants = {
            let mut table = self.lock.inner.table.lock();
            if !table.free_waiting(self.handle) && !table.free_granted(self.handle) {
                return;
            }
            table.reevaluate()
        };
        debug!(seq = self.handle.seq, "abandoned lock request freed");
        notify(grants);
    }
}

impl OrientationGuard {
    pub fn handle(&self) -> LockHandle {
        self.handle
    }

    /// Detaches the guard. The caller becomes responsible for releasing the
    /// returned handle.
    pub fn into_handle(mut self) -> LockHandle {
        self.detached = true;
        self.handle
    }
}

impl Drop for OrientationGuard {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Err(err) = self.lock.release(self.handle, self.handle.kind) {
            warn!(%err, "guarded lock was already released");
        }
    }
}
