use std::sync::Arc;

use super::task::DownloadTask;

/// One priority tier: tasks ordered by id with a round-robin cursor.
#[derive(Default)]
pub(crate) struct TaskQueue {
    tasks: Vec<Arc<DownloadTask>>,
    cursor: usize,
}

impl TaskQueue {
    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn contains(&self, task_id: u64) -> bool {
        self.position(task_id).is_ok()
    }

    pub(crate) fn insert(&mut self, task: Arc<DownloadTask>) {
        if let Err(index) = self.position(task.id()) {
            self.tasks.insert(index, task);
        }
    }

    pub(crate) fn remove(&mut self, task_id: u64) -> Option<Arc<DownloadTask>> {
        let index = self.position(task_id).ok()?;
        Some(self.tasks.remove(index))
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Arc<DownloadTask>> {
        self.tasks.get(index)
    }

    /// Where the next selection scan starts; wraps past the end.
    pub(crate) fn cursor(&self) -> usize {
        if self.tasks.is_empty() {
            0
        } else {
            self.cursor % self.tasks.len()
        }
    }

    pub(crate) fn set_cursor(&mut self, cursor: usize) {
        self.cursor = cursor;
    }

    /// Finalizes whatever can be finalized and drops it from the tier.
    pub(crate) fn drain_finalized(&mut self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|task| !task.try_finalize());
        before - self.tasks.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<DownloadTask>> {
        self.tasks.iter()
    }

    fn position(&self, task_id: u64) -> Result<usize, usize> {
        self.tasks.binary_search_by_key(&task_id, |task| task.id())
    }
}
