//! Partition session: one server-granted lease over a partition.
//!
//! The engine creates a session on StartPartitionSessionRequest and is the
//! only one to insert, stop or remove it. Message handles keep an `Arc` to
//! their session and register commits on it from any task; the engine then
//! sends the registered ranges and applies the server's committed offsets.

use std::fmt;
use std::sync::{Mutex, MutexGuard, Weak};
use tokio::sync::oneshot;

use super::ReaderShared;
use crate::error::{ClientError, Result};
use crate::offsets::{CommitTracker, OffsetRange, Registration};

/// Why a partition session stopped accepting commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    StoppedByServer,
    /// The connection that granted the lease was replaced.
    Deactivated,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PartitionStatus {
    Active,
    /// Graceful stop requested. Commits registered before it still resolve.
    Stopping,
    Closed(CloseReason),
}

type CommitWaiter = (i64, oneshot::Sender<Result<()>>);

struct PartitionInner {
    status: PartitionStatus,
    commits: CommitTracker,
    /// Commit completions keyed by the end offset they wait for.
    waiters: Vec<CommitWaiter>,
    /// Start of the commit range of the next message handed out.
    next_commit_start: i64,
}

pub(crate) struct PartitionSession {
    id: i64,
    topic: String,
    partition_id: i64,
    generation: u64,
    reader: Weak<ReaderShared>,
    inner: Mutex<PartitionInner>,
}

impl PartitionSession {
    pub(crate) fn new(
        id: i64,
        topic: String,
        partition_id: i64,
        generation: u64,
        committed_offset: i64,
        reader: Weak<ReaderShared>,
    ) -> Self {
        Self {
            id,
            topic,
            partition_id,
            generation,
            reader,
            inner: Mutex::new(PartitionInner {
                status: PartitionStatus::Active,
                commits: CommitTracker::new(committed_offset),
                waiters: Vec::new(),
                next_commit_start: committed_offset,
            }),
        }
    }

    pub(crate) fn id(&self) -> i64 {
        self.id
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn partition_id(&self) -> i64 {
        self.partition_id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn status(&self) -> PartitionStatus {
        self.lock().status
    }

    pub(crate) fn is_active(&self) -> bool {
        self.status() == PartitionStatus::Active
    }

    pub(crate) fn committed_offset(&self) -> i64 {
        self.lock().commits.committed()
    }

    /// Commit range of the next delivered message at `offset`. It starts
    /// where the previous one ended so that offset gaps are committed too.
    pub(crate) fn next_commit_range(&self, offset: i64) -> OffsetRange {
        let mut inner = self.lock();
        let start = inner.next_commit_start.min(offset);
        inner.next_commit_start = offset + 1;
        OffsetRange::new(start, offset + 1)
    }

    /// Register a commit of `range` and return its completion.
    ///
    /// A range already covered by a pending commit shares that commit's
    /// outcome without being sent again.
    pub(crate) fn commit(&self, range: OffsetRange) -> Result<oneshot::Receiver<Result<()>>> {
        let reader = self.reader.upgrade().ok_or(ClientError::Disposed)?;
        if reader.lifecycle.is_disposing() {
            return Err(ClientError::Disposed);
        }

        let registration = {
            let mut inner = self.lock();
            match inner.status {
                PartitionStatus::Active => {}
                PartitionStatus::Stopping | PartitionStatus::Closed(_) => {
                    return Err(self.closed_error(inner.status));
                }
            }
            let registration = inner.commits.register(range)?;
            let (tx, rx) = oneshot::channel();
            inner.waiters.push((range.end, tx));
            (registration, rx)
        };

        if registration.0 == Registration::Registered {
            reader.wake.notify_one();
        }
        Ok(registration.1)
    }

    /// Ranges registered but not sent yet.
    pub(crate) fn take_unsent(&self) -> Vec<OffsetRange> {
        self.lock().commits.take_unsent()
    }

    /// Apply a committed offset from the server and resolve every commit
    /// whose range it covers.
    pub(crate) fn on_committed(&self, committed_offset: i64) {
        let mut inner = self.lock();
        inner.commits.advance(committed_offset);
        let committed = inner.commits.committed();

        let (done, waiting): (Vec<CommitWaiter>, Vec<CommitWaiter>) = inner
            .waiters
            .drain(..)
            .partition(|(end, _)| *end <= committed);
        inner.waiters = waiting;
        drop(inner);

        for (_, waiter) in done {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Refuse new commits. Commits already registered keep going.
    pub(crate) fn begin_stop(&self) {
        let mut inner = self.lock();
        if inner.status == PartitionStatus::Active {
            inner.status = PartitionStatus::Stopping;
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.status() == PartitionStatus::Stopping
    }

    /// No registered commit is waiting for the server.
    pub(crate) fn is_drained(&self) -> bool {
        self.lock().waiters.is_empty()
    }

    pub(crate) fn has_pending_commits(&self) -> bool {
        !self.is_drained()
    }

    /// Close the session and fail every unresolved commit.
    pub(crate) fn close(&self, reason: CloseReason) {
        let mut inner = self.lock();
        if matches!(inner.status, PartitionStatus::Closed(_)) {
            return;
        }
        inner.status = PartitionStatus::Closed(reason);
        inner.commits.take_unsent();
        let waiters = std::mem::take(&mut inner.waiters);
        let error = self.closed_error(inner.status);
        drop(inner);

        for (_, waiter) in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    fn closed_error(&self, status: PartitionStatus) -> ClientError {
        match status {
            PartitionStatus::Closed(CloseReason::Deactivated) => ClientError::SessionDeactivated,
            PartitionStatus::Closed(CloseReason::Disposed) => ClientError::Disposed,
            _ => ClientError::PartitionClosed {
                partition_session_id: self.id,
            },
        }
    }

    fn lock(&self) -> MutexGuard<'_, PartitionInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for PartitionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionSession")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("partition_id", &self.partition_id)
            .field("generation", &self.generation)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::ReaderShared;
    use std::sync::Arc;

    fn session(reader: &Arc<ReaderShared>, committed: i64) -> PartitionSession {
        PartitionSession::new(7, "/t".to_string(), 0, 1, committed, Arc::downgrade(reader))
    }

    #[test]
    fn test_commit_ranges_cover_gaps() {
        let reader = Arc::new(ReaderShared::new(100));
        let partition = session(&reader, 10);
        assert_eq!(partition.next_commit_range(10), OffsetRange::new(10, 11));
        assert_eq!(partition.next_commit_range(14), OffsetRange::new(11, 15));
    }

    #[tokio::test]
    async fn test_commit_resolves_when_watermark_passes() {
        let reader = Arc::new(ReaderShared::new(100));
        let partition = session(&reader, 0);
        let first = partition.commit(OffsetRange::new(0, 1)).unwrap();
        let second = partition.commit(OffsetRange::new(1, 3)).unwrap();
        assert_eq!(partition.take_unsent(), vec![OffsetRange::new(0, 3)]);

        partition.on_committed(1);
        assert!(first.await.unwrap().is_ok());
        assert!(partition.has_pending_commits());

        partition.on_committed(3);
        assert!(second.await.unwrap().is_ok());
        assert!(partition.is_drained());
    }

    #[tokio::test]
    async fn test_duplicate_commit_shares_outcome() {
        let reader = Arc::new(ReaderShared::new(100));
        let partition = session(&reader, 0);
        let first = partition.commit(OffsetRange::new(0, 2)).unwrap();
        let again = partition.commit(OffsetRange::new(0, 2)).unwrap();
        assert_eq!(partition.take_unsent(), vec![OffsetRange::new(0, 2)]);

        partition.close(CloseReason::Deactivated);
        assert!(matches!(
            first.await.unwrap(),
            Err(ClientError::SessionDeactivated)
        ));
        assert!(matches!(
            again.await.unwrap(),
            Err(ClientError::SessionDeactivated)
        ));
    }

    #[tokio::test]
    async fn test_stopping_refuses_new_commits_but_keeps_pending() {
        let reader = Arc::new(ReaderShared::new(100));
        let partition = session(&reader, 0);
        let pending = partition.commit(OffsetRange::new(0, 1)).unwrap();

        partition.begin_stop();
        assert!(matches!(
            partition.commit(OffsetRange::new(1, 2)),
            Err(ClientError::PartitionClosed {
                partition_session_id: 7
            })
        ));
        assert!(!partition.is_drained());

        partition.on_committed(1);
        assert!(pending.await.unwrap().is_ok());
        assert!(partition.is_drained());
    }

    #[test]
    fn test_commit_after_dispose_fails() {
        let reader = Arc::new(ReaderShared::new(100));
        let partition = session(&reader, 0);
        reader.lifecycle.begin_dispose();
        assert!(matches!(
            partition.commit(OffsetRange::new(0, 1)),
            Err(ClientError::Disposed)
        ));
    }
}
