use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Notify, Semaphore};
use tracing::trace;

use super::errors::DownloadError;
use super::io_pool::BlockingPool;
use super::task::{ChunkClaim, DownloadTask};
use crate::fetch::ChunkFetch;

/// Everything a chunk-transfer unit needs besides its task.
pub(crate) struct TransferContext {
    pub(crate) fetcher: Arc<dyn ChunkFetch>,
    pub(crate) pool: BlockingPool,
    /// Caps concurrent wire calls, independently of the unit count.
    pub(crate) wire_permits: Semaphore,
    pub(crate) changed: Arc<Notify>,
    pub(crate) bytes_downloaded: AtomicU64,
}

impl TransferContext {
    pub(crate) fn new(fetcher: Arc<dyn ChunkFetch>, max_concurrent_downloads: usize) -> Self {
        let workers = max_concurrent_downloads.max(1);
        Self {
            fetcher,
            pool: BlockingPool::new(workers),
            wire_permits: Semaphore::new(workers),
            changed: Arc::new(Notify::new()),
            bytes_downloaded: AtomicU64::new(0),
        }
    }
}

/// Releases the unit's slot on the task however the unit ends, including
/// cancellation.
struct UnitGuard<'a> {
    task: &'a DownloadTask,
    changed: &'a Notify,
    offset: u64,
    settled: bool,
}

impl Drop for UnitGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.task.mark_failed(self.offset);
        }
        self.task.release_unit();
        self.changed.notify_one();
    }
}

/// Transfers one chunk of `task`. A stale reference is absorbed here and
/// routes the task to renewal; other failures leave the offset in the
/// retry set and are returned for logging only.
pub(crate) async fn run(
    ctx: Arc<TransferContext>,
    task: Arc<DownloadTask>,
    claim: ChunkClaim,
) -> Result<(), DownloadError> {
    let offset = claim.offset();
    let mut guard = UnitGuard {
        task: &task,
        changed: &ctx.changed,
        offset,
        settled: false,
    };

    let result = match transfer(&ctx, &task, offset).await {
        Err(DownloadError::Fetch(err)) if err.is_stale() => {
            trace!(task = task.id(), offset, "content reference is stale");
            task.mark_stale(offset);
            Ok(())
        }
        Err(err) => {
            task.mark_failed(offset);
            Err(err)
        }
        Ok(()) => Ok(()),
    };
    guard.settled = true;
    drop(guard);
    result
}

async fn transfer(
    ctx: &TransferContext,
    task: &DownloadTask,
    offset: u64,
) -> Result<(), DownloadError> {
    let file = task.open_file(&ctx.pool).await?;
    if offset >= task.size() {
        return Ok(());
    }

    // Read under the task lock so a concurrent renewal is seen whole.
    let content_ref = task.content_ref();
    let mut data = {
        let _permit = ctx
            .wire_permits
            .acquire()
            .await
            .map_err(|_| DownloadError::Closed)?;
        ctx.fetcher.fetch(&content_ref, offset).await?
    };

    let remaining = task.size() - offset;
    if data.len() as u64 > remaining {
        data.truncate(remaining as usize);
    }
    let len = data.len() as u64;
    ctx.pool.write_at(file, offset, data).await?;
    task.record_written(len);
    ctx.bytes_downloaded.fetch_add(len, Ordering::Relaxed);
    trace!(task = task.id(), offset, len, "chunk written");
    Ok(())
}
