use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use super::downloader::SchedulerCommand;
use super::io_pool::BlockingPool;
use crate::fetch::{CHUNK_SIZE, ContentRef, OwnerId};

/// Mutable per-task state. Guarded by the task lock, which is never held
/// across an await point.
#[derive(Debug)]
pub(crate) struct TaskState {
    pub(crate) content_ref: ContentRef,
    /// Next unclaimed sequential offset.
    pub(crate) offset: u64,
    /// Offsets whose latest attempt failed; retried before new offsets.
    pub(crate) failed_chunks: BTreeSet<u64>,
    /// Chunk-transfer units in flight.
    pub(crate) active: usize,
    pub(crate) file: Option<Arc<File>>,
    pub(crate) needs_renewal: bool,
    pub(crate) written: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// Every offset is claimed and none failed; only in-flight chunks remain.
    Exhausted,
    NeedsRenewal,
    Ready,
}

/// Offset handed to a chunk-transfer unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkClaim {
    Sequential(u64),
    Retry(u64),
}

impl ChunkClaim {
    pub(crate) fn offset(self) -> u64 {
        match self {
            ChunkClaim::Sequential(offset) | ChunkClaim::Retry(offset) => offset,
        }
    }
}

/// Point-in-time view of a task's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub offset: u64,
    pub written: u64,
    pub in_flight: usize,
    pub failed_chunks: usize,
    pub needs_renewal: bool,
    pub done: bool,
}

pub(crate) struct DownloadTask {
    id: u64,
    owner_id: OwnerId,
    output_path: PathBuf,
    size: u64,
    is_thumbnail: bool,
    high_priority: AtomicBool,
    state: Mutex<TaskState>,
    open_gate: tokio::sync::Mutex<()>,
    done: watch::Sender<bool>,
}

impl DownloadTask {
    pub(crate) fn new(
        id: u64,
        content_ref: ContentRef,
        owner_id: OwnerId,
        output_path: PathBuf,
        size: u64,
        is_thumbnail: bool,
        high_priority: bool,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            id,
            owner_id,
            output_path,
            size,
            is_thumbnail,
            high_priority: AtomicBool::new(high_priority),
            state: Mutex::new(TaskState {
                content_ref,
                offset: 0,
                failed_chunks: BTreeSet::new(),
                active: 0,
                file: None,
                needs_renewal: false,
                written: 0,
            }),
            open_gate: tokio::sync::Mutex::new(()),
            done,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn is_thumbnail(&self) -> bool {
        self.is_thumbnail
    }

    pub(crate) fn is_high_priority(&self) -> bool {
        self.high_priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_high_priority(&self, high: bool) {
        self.high_priority.store(high, Ordering::Release);
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn content_ref(&self) -> ContentRef {
        self.state().content_ref.clone()
    }

    pub(crate) fn readiness(&self) -> Readiness {
        let state = self.state();
        // A zero-sized task still needs one unit to create its file.
        if state.offset >= self.size.max(1) && state.failed_chunks.is_empty() {
            return Readiness::Exhausted;
        }
        if state.needs_renewal {
            return Readiness::NeedsRenewal;
        }
        Readiness::Ready
    }

    /// Picks the next offset for a unit and counts the unit as active in
    /// the same critical section.
    pub(crate) fn claim_chunk(&self) -> ChunkClaim {
        let mut state = self.state();
        state.active += 1;
        if let Some(offset) = state.failed_chunks.pop_first() {
            return ChunkClaim::Retry(offset);
        }
        let offset = state.offset;
        state.offset += CHUNK_SIZE;
        ChunkClaim::Sequential(offset)
    }

    pub(crate) fn release_unit(&self) {
        let mut state = self.state();
        state.active = state.active.saturating_sub(1);
    }

    pub(crate) fn mark_failed(&self, offset: u64) {
        self.state().failed_chunks.insert(offset);
    }

    pub(crate) fn mark_stale(&self, offset: u64) {
        let mut state = self.state();
        state.needs_renewal = true;
        state.failed_chunks.insert(offset);
    }

    pub(crate) fn needs_renewal(&self) -> bool {
        self.state().needs_renewal
    }

    /// Counts `len` freshly written bytes, never beyond `size`.
    pub(crate) fn record_written(&self, len: u64) {
        let mut state = self.state();
        state.written = state.written.saturating_add(len).min(self.size);
    }

    pub(crate) fn renew(&self, content_ref: ContentRef) {
        let mut state = self.state();
        state.content_ref = content_ref;
        state.needs_renewal = false;
    }

    /// Marks a task whose content is gone as complete with whatever bytes
    /// were already written.
    pub(crate) fn force_complete(&self) {
        let mut state = self.state();
        state.offset = self.size + 1;
        state.written = self.size;
        state.failed_chunks.clear();
        state.needs_renewal = false;
    }

    /// Opens and pre-sizes the output file once; later callers get the
    /// same handle.
    pub(crate) async fn open_file(&self, pool: &BlockingPool) -> io::Result<Arc<File>> {
        let _gate = self.open_gate.lock().await;
        let existing = self.state().file.clone();
        if let Some(file) = existing {
            return Ok(file);
        }
        let file = Arc::new(pool.open_sized(self.output_path.clone(), self.size).await?);
        self.state().file = Some(Arc::clone(&file));
        Ok(file)
    }

    /// Closes the file and fires the completion signal if every offset is
    /// claimed, nothing is in flight and nothing failed.
    pub(crate) fn try_finalize(&self) -> bool {
        let file = {
            let mut state = self.state();
            let finalizable = state.offset >= self.size
                && state.active == 0
                && state.failed_chunks.is_empty()
                && state.file.is_some();
            if !finalizable {
                return false;
            }
            state.file.take()
        };
        drop(file);
        self.done.send_replace(true);
        true
    }

    pub(crate) fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    pub(crate) async fn wait(&self) {
        let mut done = self.done.subscribe();
        // The sender lives as long as `self`, so this only ends on completion.
        let _ = done.wait_for(|done| *done).await;
    }

    pub(crate) fn snapshot(&self) -> TaskSnapshot {
        let state = self.state();
        TaskSnapshot {
            offset: state.offset,
            written: state.written,
            in_flight: state.active,
            failed_chunks: state.failed_chunks.len(),
            needs_renewal: state.needs_renewal,
            done: self.is_done(),
        }
    }
}

/// Caller-side handle to a queued download.
#[derive(Clone)]
pub struct TaskHandle {
    task: Arc<DownloadTask>,
    commands: mpsc::UnboundedSender<SchedulerCommand>,
}

impl TaskHandle {
    pub(crate) fn new(
        task: Arc<DownloadTask>,
        commands: mpsc::UnboundedSender<SchedulerCommand>,
    ) -> Self {
        Self { task, commands }
    }

    pub fn id(&self) -> u64 {
        self.task.id
    }

    pub fn owner_id(&self) -> OwnerId {
        self.task.owner_id
    }

    pub fn size(&self) -> u64 {
        self.task.size
    }

    pub fn output_path(&self) -> &Path {
        &self.task.output_path
    }

    pub fn is_thumbnail(&self) -> bool {
        self.task.is_thumbnail
    }

    pub fn is_high_priority(&self) -> bool {
        self.task.is_high_priority()
    }

    /// Moves the task between priority tiers. No-op once it is finalized.
    pub fn set_priority_high(&self, high: bool) {
        let _ = self.commands.send(SchedulerCommand::SetPriority {
            task_id: self.task.id,
            high,
        });
    }

    pub fn is_done(&self) -> bool {
        self.task.is_done()
    }

    pub fn written_bytes(&self) -> u64 {
        self.task.state().written
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.task.snapshot()
    }

    /// Resolves once the task is finalized. A chunk that never succeeds
    /// keeps this pending forever; wrap it in a timeout if that matters.
    pub async fn wait(&self) {
        self.task.wait().await;
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.task.id)
            .field("output_path", &self.task.output_path)
            .field("size", &self.task.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(size: u64) -> DownloadTask {
        DownloadTask::new(1, ContentRef::from("ref"), 10, PathBuf::from("x"), size, false, false)
    }

    #[test]
    fn claims_sequential_offsets_then_exhausts() {
        let task = task(2 * CHUNK_SIZE + 5);
        assert_eq!(task.claim_chunk(), ChunkClaim::Sequential(0));
        assert_eq!(task.claim_chunk(), ChunkClaim::Sequential(CHUNK_SIZE));
        assert_eq!(task.readiness(), Readiness::Ready);
        assert_eq!(task.claim_chunk(), ChunkClaim::Sequential(2 * CHUNK_SIZE));
        assert_eq!(task.readiness(), Readiness::Exhausted);
        assert_eq!(task.state().active, 3);
    }

    #[test]
    fn failed_offsets_are_retried_first() {
        let task = task(3 * CHUNK_SIZE);
        task.claim_chunk();
        task.claim_chunk();
        task.mark_failed(0);
        task.release_unit();

        assert_eq!(task.claim_chunk(), ChunkClaim::Retry(0));
        assert_eq!(task.claim_chunk(), ChunkClaim::Sequential(2 * CHUNK_SIZE));
    }

    #[test]
    fn stale_chunk_routes_to_renewal() {
        let task = task(CHUNK_SIZE);
        task.claim_chunk();
        task.mark_stale(0);
        assert_eq!(task.readiness(), Readiness::NeedsRenewal);

        task.renew(ContentRef::from("fresh"));
        assert_eq!(task.readiness(), Readiness::Ready);
        assert_eq!(task.content_ref(), ContentRef::from("fresh"));
    }

    #[test]
    fn zero_sized_task_is_admitted_once() {
        let task = task(0);
        assert_eq!(task.readiness(), Readiness::Ready);
        task.claim_chunk();
        assert_eq!(task.readiness(), Readiness::Exhausted);
    }

    #[test]
    fn finalize_requires_open_file_and_idle_task() {
        let task = task(10);
        task.claim_chunk();
        assert!(!task.try_finalize());

        task.release_unit();
        assert!(!task.try_finalize(), "file was never opened");

        let dir = tempfile::tempdir().expect("tempdir");
        let file = File::create(dir.path().join("f")).expect("create");
        task.state().file = Some(Arc::new(file));
        assert!(task.try_finalize());
        assert!(task.is_done());
        assert!(task.state().file.is_none());
    }

    #[test]
    fn force_complete_clears_pending_work() {
        let task = task(3 * CHUNK_SIZE);
        task.claim_chunk();
        task.mark_stale(0);
        task.release_unit();

        task.force_complete();

        let snapshot = task.snapshot();
        assert_eq!(snapshot.offset, 3 * CHUNK_SIZE + 1);
        assert_eq!(snapshot.written, 3 * CHUNK_SIZE);
        assert_eq!(snapshot.failed_chunks, 0);
        assert!(!snapshot.needs_renewal);
        assert_eq!(task.readiness(), Readiness::Exhausted);
    }

    #[test]
    fn written_bytes_never_exceed_size() {
        let task = task(100);
        task.record_written(80);
        task.record_written(80);
        assert_eq!(task.state().written, 100);
    }

    #[tokio::test]
    async fn wait_returns_after_finalize() {
        let task = Arc::new(task(0));
        let waiter = {
            let task = Arc::clone(&task);
            tokio::spawn(async move { task.wait().await })
        };
        let dir = tempfile::tempdir().expect("tempdir");
        task.state().file = Some(Arc::new(File::create(dir.path().join("f")).expect("create")));
        assert!(task.try_finalize());
        waiter.await.expect("waiter");
    }
}
