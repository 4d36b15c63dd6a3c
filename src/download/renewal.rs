use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::task::DownloadTask;
use crate::fetch::{OwnerId, ResolveReferences};

/// Tasks waiting for a fresh content reference.
///
/// A task sits in `pending` until a batch picks it up, then in `renewing`
/// until that batch finishes, so it is submitted at most once per batch.
pub(crate) struct RenewalQueue {
    pending: BTreeMap<u64, Arc<DownloadTask>>,
    renewing: HashMap<u64, Arc<DownloadTask>>,
    marked_at: Option<Instant>,
    in_flight: Option<JoinHandle<()>>,
    batch_limit: usize,
    debounce: Duration,
}

impl RenewalQueue {
    pub(crate) fn new(batch_limit: usize, debounce: Duration) -> Self {
        Self {
            pending: BTreeMap::new(),
            renewing: HashMap::new(),
            marked_at: None,
            in_flight: None,
            batch_limit: batch_limit.max(1),
            debounce,
        }
    }

    pub(crate) fn request(&mut self, task: &Arc<DownloadTask>) {
        if self.renewing.contains_key(&task.id()) || self.pending.contains_key(&task.id()) {
            return;
        }
        if self.pending.is_empty() {
            self.marked_at = Some(Instant::now());
        }
        self.pending.insert(task.id(), Arc::clone(task));
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.renewing.is_empty() && self.in_flight.is_none()
    }

    pub(crate) fn is_due(&self) -> bool {
        if self.in_flight.is_some() || self.pending.is_empty() {
            return false;
        }
        if self.pending.len() >= self.batch_limit {
            return true;
        }
        self.marked_at
            .is_some_and(|marked| marked.elapsed() >= self.debounce)
    }

    /// Time left before the debounce fires, if anything is pending.
    pub(crate) fn until_due(&self) -> Option<Duration> {
        if self.in_flight.is_some() || self.pending.is_empty() {
            return None;
        }
        let marked = self.marked_at?;
        Some(self.debounce.saturating_sub(marked.elapsed()))
    }

    /// Moves up to `batch_limit` pending tasks into a background lookup.
    pub(crate) fn spawn(&mut self, resolver: Arc<dyn ResolveReferences>, changed: Arc<Notify>) {
        let mut batch = Vec::with_capacity(self.batch_limit.min(self.pending.len()));
        while batch.len() < self.batch_limit {
            let Some((id, task)) = self.pending.pop_first() else {
                break;
            };
            self.renewing.insert(id, Arc::clone(&task));
            batch.push(task);
        }
        self.marked_at = (!self.pending.is_empty()).then(Instant::now);
        debug!(
            batch = batch.len(),
            remaining = self.pending.len(),
            "starting reference renewal"
        );
        self.in_flight = Some(tokio::spawn(async move {
            run_batch(resolver.as_ref(), batch).await;
            changed.notify_one();
        }));
    }

    /// Collects a finished batch. Tasks the batch could not refresh still
    /// carry `needs_renewal` and are requested again by the next scan.
    pub(crate) fn reap(&mut self) {
        if self.in_flight.as_ref().is_some_and(JoinHandle::is_finished) {
            self.in_flight = None;
            self.renewing.clear();
        }
    }

    pub(crate) fn abort(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
        self.renewing.clear();
        self.pending.clear();
        self.marked_at = None;
    }
}

pub(crate) async fn run_batch(resolver: &dyn ResolveReferences, batch: Vec<Arc<DownloadTask>>) {
    let mut by_owner: BTreeMap<OwnerId, Vec<Arc<DownloadTask>>> = BTreeMap::new();
    for task in batch {
        by_owner.entry(task.owner_id()).or_default().push(task);
    }
    let owners: Vec<OwnerId> = by_owner.keys().copied().collect();

    let resolved = match resolver.resolve(&owners).await {
        Ok(resolved) => resolved,
        Err(err) => {
            warn!(owners = owners.len(), error = %err, "reference renewal failed");
            return;
        }
    };

    let mut gone = BTreeSet::new();
    for (owner, tasks) in by_owner {
        let Some(resolution) = resolved.get(&owner) else {
            debug!(owner, "owner missing from renewal response");
            continue;
        };
        for task in tasks {
            match resolution.content_for(task.is_thumbnail()) {
                Some(content) => task.renew(content.clone()),
                None => {
                    task.force_complete();
                    gone.insert(owner);
                }
            }
        }
    }
    if !gone.is_empty() {
        warn!(owners = ?gone, "content no longer available; completing with partial data");
    }
}
