use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, trace, warn};

use super::errors::DownloadError;
use super::queue::TaskQueue;
use super::renewal::RenewalQueue;
use super::task::{DownloadTask, Readiness, TaskHandle};
use super::unit::{self, TransferContext};
use crate::fetch::{ChunkFetch, ContentRef, OwnerId, ResolveReferences};

pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 4;
pub const RENEW_BATCH_LIMIT: usize = 100;
pub const RENEW_DEBOUNCE: Duration = Duration::from_secs(5);
pub const WAKEUP_TIMEOUT: Duration = Duration::from_millis(100);
const SCAN_YIELD_EVERY: usize = 10;

const HIGH: usize = 0;
const LOW: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloaderConfig {
    /// Concurrent wire calls and blocking file jobs.
    pub max_concurrent_downloads: usize,
    pub renew_batch_limit: usize,
    pub renew_debounce: Duration,
    /// Longest the scheduler sleeps without a wakeup.
    pub wakeup_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            renew_batch_limit: RENEW_BATCH_LIMIT,
            renew_debounce: RENEW_DEBOUNCE,
            wakeup_timeout: WAKEUP_TIMEOUT,
        }
    }
}

impl DownloaderConfig {
    /// Chunk-transfer units the scheduler keeps in flight. One more than
    /// the wire budget so a unit stuck in a handshake does not idle the
    /// wire.
    pub fn max_units(&self) -> usize {
        self.max_concurrent_downloads.max(1) + 1
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloaderStatus {
    pub running: bool,
    pub queued_high: usize,
    pub queued_low: usize,
    pub active_units: usize,
    pub pending_renewal: usize,
}

pub(crate) enum SchedulerCommand {
    Add(Arc<DownloadTask>),
    SetPriority { task_id: u64, high: bool },
}

enum Lifecycle {
    Idle(Box<Scheduler>),
    Running(JoinHandle<Scheduler>),
    Stopping,
    Failed,
}

/// Concurrent chunked downloader.
///
/// Tasks are queued with [`Downloader::add_task`] and transferred once
/// [`Downloader::start`] has spawned the scheduler. The scheduler is the only
/// owner of the priority queues; callers talk to it over a command channel.
pub struct Downloader {
    ctx: Arc<TransferContext>,
    running: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<SchedulerCommand>,
    status: watch::Receiver<DownloaderStatus>,
    next_id: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
}

impl Downloader {
    pub fn new(
        config: DownloaderConfig,
        fetcher: Arc<dyn ChunkFetch>,
        resolver: Arc<dyn ResolveReferences>,
    ) -> Self {
        let ctx = Arc::new(TransferContext::new(fetcher, config.max_concurrent_downloads));
        let running = Arc::new(AtomicBool::new(false));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(DownloaderStatus::default());

        let scheduler = Scheduler {
            ctx: Arc::clone(&ctx),
            resolver,
            running: Arc::clone(&running),
            commands: command_rx,
            commands_open: true,
            status: status_tx,
            tiers: [TaskQueue::default(), TaskQueue::default()],
            units: JoinSet::new(),
            renewals: RenewalQueue::new(config.renew_batch_limit, config.renew_debounce),
            max_units: config.max_units(),
            wakeup_timeout: config.wakeup_timeout,
        };

        Self {
            ctx,
            running,
            commands,
            status,
            next_id: AtomicU64::new(1),
            lifecycle: Mutex::new(Lifecycle::Idle(Box::new(scheduler))),
        }
    }

    /// Queues a download of `size` bytes into `output_path`. Tasks added
    /// before [`Downloader::start`] wait for it.
    pub fn add_task(
        &self,
        content_ref: ContentRef,
        owner_id: OwnerId,
        output_path: impl Into<PathBuf>,
        high_priority: bool,
        size: u64,
        is_thumbnail: bool,
    ) -> Result<TaskHandle, DownloadError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(DownloadTask::new(
            id,
            content_ref,
            owner_id,
            output_path.into(),
            size,
            is_thumbnail,
            high_priority,
        ));
        self.commands
            .send(SchedulerCommand::Add(Arc::clone(&task)))
            .map_err(|_| DownloadError::Closed)?;
        self.ctx.changed.notify_one();
        Ok(TaskHandle::new(task, self.commands.clone()))
    }

    /// Spawns the scheduler on the current runtime. Calling it again while
    /// running does nothing.
    pub fn start(&self) {
        let mut lifecycle = self.lifecycle();
        match mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
            Lifecycle::Idle(scheduler) => {
                let scheduler = *scheduler;
                self.running.store(true, Ordering::Release);
                *lifecycle = Lifecycle::Running(tokio::spawn(scheduler.run()));
                debug!("downloader started");
            }
            Lifecycle::Stopping => {
                warn!("downloader start ignored while stopping");
            }
            other => *lifecycle = other,
        }
    }

    /// Stops admitting work once the queues drain and waits for the
    /// scheduler to exit. In-flight chunks always run to completion.
    pub async fn stop(&self) -> Result<(), DownloadError> {
        self.running.store(false, Ordering::Release);
        self.ctx.changed.notify_one();

        let handle = {
            let mut lifecycle = self.lifecycle();
            match mem::replace(&mut *lifecycle, Lifecycle::Stopping) {
                Lifecycle::Running(handle) => handle,
                other => {
                    *lifecycle = other;
                    return Ok(());
                }
            }
        };

        match handle.await {
            Ok(scheduler) => {
                *self.lifecycle() = Lifecycle::Idle(Box::new(scheduler));
                debug!("downloader stopped");
                Ok(())
            }
            Err(err) => {
                *self.lifecycle() = Lifecycle::Failed;
                Err(DownloadError::SchedulerJoin(err))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn status(&self) -> DownloaderStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<DownloaderStatus> {
        self.status.clone()
    }

    /// Bytes written across all tasks since the downloader was created.
    pub fn bytes_downloaded(&self) -> u64 {
        self.ctx.bytes_downloaded.load(Ordering::Relaxed)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Downloader {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.ctx.changed.notify_one();
    }
}

enum Wake {
    Changed,
    Command(SchedulerCommand),
    CommandsClosed,
    Unit(Result<Result<(), DownloadError>, JoinError>),
    Timeout,
}

struct Scheduler {
    ctx: Arc<TransferContext>,
    resolver: Arc<dyn ResolveReferences>,
    running: Arc<AtomicBool>,
    commands: mpsc::UnboundedReceiver<SchedulerCommand>,
    commands_open: bool,
    status: watch::Sender<DownloaderStatus>,
    tiers: [TaskQueue; 2],
    units: JoinSet<Result<(), DownloadError>>,
    renewals: RenewalQueue,
    max_units: usize,
    wakeup_timeout: Duration,
}

impl Scheduler {
    async fn run(mut self) -> Self {
        debug!(max_units = self.max_units, "download scheduler running");
        loop {
            self.drain_commands();
            self.reap_units();
            self.renewals.reap();
            self.sweep();
            self.publish_status();

            if !self.running.load(Ordering::Acquire) && self.is_drained() {
                break;
            }

            let mut progressed = false;
            if self.units.len() < self.max_units {
                if let Some(task) = self.select().await {
                    self.admit(task);
                    progressed = true;
                }
            }
            if self.renewals.is_due() {
                self.renewals
                    .spawn(Arc::clone(&self.resolver), Arc::clone(&self.ctx.changed));
                progressed = true;
            }
            if !progressed {
                self.wait().await;
            }
        }
        self.publish_status();
        debug!("download scheduler exited");
        self
    }

    fn is_drained(&self) -> bool {
        self.tiers.iter().all(TaskQueue::is_empty)
            && self.units.is_empty()
            && self.renewals.is_idle()
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
    }

    fn apply(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Add(task) => {
                let tier = if task.is_high_priority() { HIGH } else { LOW };
                trace!(task = task.id(), size = task.size(), tier, "task queued");
                self.tiers[tier].insert(task);
            }
            SchedulerCommand::SetPriority { task_id, high } => {
                let (from, to) = if high { (LOW, HIGH) } else { (HIGH, LOW) };
                if let Some(task) = self.tiers[from].remove(task_id) {
                    task.set_high_priority(high);
                    self.tiers[to].insert(task);
                    trace!(task = task_id, high, "task priority changed");
                }
            }
        }
    }

    /// Picks the next task that can take a chunk: high tier first, each
    /// tier scanned from its round-robin cursor.
    async fn select(&mut self) -> Option<Arc<DownloadTask>> {
        let mut scanned = 0usize;
        for tier in [HIGH, LOW] {
            let len = self.tiers[tier].len();
            let start = self.tiers[tier].cursor();
            for step in 0..len {
                let index = (start + step) % len;
                let task = Arc::clone(self.tiers[tier].get(index)?);
                scanned += 1;
                if scanned % SCAN_YIELD_EVERY == 0 {
                    tokio::task::yield_now().await;
                }
                match task.readiness() {
                    Readiness::Exhausted => {}
                    Readiness::NeedsRenewal => self.renewals.request(&task),
                    Readiness::Ready => {
                        self.tiers[tier].set_cursor(index + 1);
                        return Some(task);
                    }
                }
            }
        }
        None
    }

    fn admit(&mut self, task: Arc<DownloadTask>) {
        let claim = task.claim_chunk();
        trace!(task = task.id(), ?claim, "chunk admitted");
        self.units
            .spawn(unit::run(Arc::clone(&self.ctx), task, claim));
    }

    fn reap_units(&mut self) {
        while let Some(joined) = self.units.try_join_next() {
            settle(joined);
        }
    }

    fn sweep(&mut self) {
        for tier in &mut self.tiers {
            let finalized = tier.drain_finalized();
            if finalized > 0 {
                debug!(finalized, "downloads completed");
            }
        }
    }

    async fn wait(&mut self) {
        let timeout = self
            .renewals
            .until_due()
            .map_or(self.wakeup_timeout, |due| due.min(self.wakeup_timeout));
        let wake = tokio::select! {
            _ = self.ctx.changed.notified() => Wake::Changed,
            command = self.commands.recv(), if self.commands_open => match command {
                Some(command) => Wake::Command(command),
                None => Wake::CommandsClosed,
            },
            Some(joined) = self.units.join_next(), if !self.units.is_empty() => Wake::Unit(joined),
            _ = tokio::time::sleep(timeout) => Wake::Timeout,
        };
        match wake {
            Wake::Command(command) => self.apply(command),
            Wake::CommandsClosed => self.commands_open = false,
            Wake::Unit(joined) => settle(joined),
            Wake::Changed | Wake::Timeout => {}
        }
    }

    fn publish_status(&self) {
        let next = DownloaderStatus {
            running: self.running.load(Ordering::Acquire),
            queued_high: self.tiers[HIGH].len(),
            queued_low: self.tiers[LOW].len(),
            active_units: self.units.len(),
            pending_renewal: self.renewals.pending_len(),
        };
        self.status.send_if_modified(|status| {
            if *status == next {
                return false;
            }
            *status = next;
            true
        });
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.renewals.abort();
    }
}

fn settle(joined: Result<Result<(), DownloadError>, JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = %err, "chunk transfer failed; offset will be retried"),
        Err(err) if err.is_cancelled() => {}
        Err(err) => warn!(error = %err, "chunk transfer panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchError, Resolution};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct NoFetch;

    #[async_trait]
    impl ChunkFetch for NoFetch {
        async fn fetch(&self, _: &ContentRef, _: u64) -> Result<Vec<u8>, FetchError> {
            Err(FetchError::Unavailable("offline".into()))
        }
    }

    #[async_trait]
    impl ResolveReferences for NoFetch {
        async fn resolve(
            &self,
            _: &[OwnerId],
        ) -> Result<HashMap<OwnerId, Resolution>, FetchError> {
            Ok(HashMap::new())
        }
    }

    fn idle_scheduler(downloader: &Downloader) -> Box<Scheduler> {
        match mem::replace(&mut *downloader.lifecycle(), Lifecycle::Failed) {
            Lifecycle::Idle(scheduler) => scheduler,
            _ => panic!("scheduler is not idle"),
        }
    }

    fn downloader() -> Downloader {
        Downloader::new(DownloaderConfig::default(), Arc::new(NoFetch), Arc::new(NoFetch))
    }

    #[tokio::test]
    async fn commands_route_tasks_between_tiers() {
        let downloader = downloader();
        let low = downloader
            .add_task(ContentRef::from("a"), 1, "a", false, 10, false)
            .expect("add");
        let high = downloader
            .add_task(ContentRef::from("b"), 2, "b", true, 10, false)
            .expect("add");
        low.set_priority_high(true);
        high.set_priority_high(false);

        let mut scheduler = idle_scheduler(&downloader);
        scheduler.drain_commands();

        assert!(scheduler.tiers[HIGH].contains(low.id()));
        assert!(scheduler.tiers[LOW].contains(high.id()));
        assert!(low.is_high_priority());
        assert!(!high.is_high_priority());
    }

    #[tokio::test]
    async fn priority_change_for_unknown_task_is_ignored() {
        let downloader = downloader();
        let handle = downloader
            .add_task(ContentRef::from("a"), 1, "a", false, 10, false)
            .expect("add");
        let mut scheduler = idle_scheduler(&downloader);
        scheduler.drain_commands();

        scheduler.apply(SchedulerCommand::SetPriority { task_id: 99, high: true });
        scheduler.apply(SchedulerCommand::SetPriority {
            task_id: handle.id(),
            high: false,
        });

        assert_eq!(scheduler.tiers[LOW].len(), 1);
        assert!(scheduler.tiers[HIGH].is_empty());
    }

    #[tokio::test]
    async fn selection_prefers_high_tier_and_rotates_within_tier() {
        let downloader = downloader();
        let mut handles = Vec::new();
        for owner in 0..3 {
            handles.push(
                downloader
                    .add_task(ContentRef::from("x"), owner, "x", false, 10, false)
                    .expect("add"),
            );
        }
        let mut scheduler = idle_scheduler(&downloader);
        scheduler.drain_commands();

        let first = scheduler.select().await.expect("task");
        let second = scheduler.select().await.expect("task");
        assert_eq!(first.id(), handles[0].id());
        assert_eq!(second.id(), handles[1].id());

        let urgent = downloader
            .add_task(ContentRef::from("y"), 9, "y", true, 10, false)
            .expect("add");
        scheduler.drain_commands();
        assert_eq!(scheduler.select().await.expect("task").id(), urgent.id());
    }

    #[tokio::test]
    async fn selection_skips_exhausted_and_stale_tasks() {
        let downloader = downloader();
        let exhausted = downloader
            .add_task(ContentRef::from("a"), 1, "a", false, 10, false)
            .expect("add");
        let stale = downloader
            .add_task(ContentRef::from("b"), 2, "b", false, 10, false)
            .expect("add");
        let mut scheduler = idle_scheduler(&downloader);
        scheduler.drain_commands();

        let task = scheduler.select().await.expect("first");
        assert_eq!(task.id(), exhausted.id());
        task.claim_chunk();

        let task = scheduler.select().await.expect("second");
        assert_eq!(task.id(), stale.id());
        task.claim_chunk();
        task.mark_stale(0);
        task.release_unit();

        assert!(scheduler.select().await.is_none());
        assert_eq!(scheduler.renewals.pending_len(), 1);
    }

    #[test]
    fn unit_cap_is_one_above_wire_budget() {
        let config = DownloaderConfig {
            max_concurrent_downloads: 0,
            ..DownloaderConfig::default()
        };
        assert_eq!(config.max_units(), 2);
        assert_eq!(DownloaderConfig::default().max_units(), 5);
    }
}
