use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OnceCell;

use super::FetchError;
use super::transport::{DcId, MediaSession};

type Slot<S> = Arc<OnceCell<Arc<S>>>;

/// Reusable media sessions keyed by datacenter.
///
/// Each datacenter gets one slot. Concurrent acquirers of an empty slot
/// share a single handshake; a failed handshake leaves the slot empty so
/// the next acquirer starts over.
pub struct SessionPool<S> {
    slots: Mutex<HashMap<DcId, Slot<S>>>,
}

impl<S: MediaSession> SessionPool<S> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire<F, Fut>(&self, dc_id: DcId, open: F) -> Result<Arc<S>, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S, FetchError>>,
    {
        let slot = Arc::clone(self.slots().entry(dc_id).or_default());
        let session = slot
            .get_or_try_init(|| async move { open().await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(session))
    }

    /// Number of datacenters with an open session.
    pub fn open_count(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Stops and forgets every cached session.
    pub async fn close_all(&self) {
        let slots: Vec<Slot<S>> = self.slots().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            if let Some(session) = slot.get() {
                session.stop().await;
            }
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<DcId, Slot<S>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: MediaSession> Default for SessionPool<S> {
    fn default() -> Self {
        Self::new()
    }
}
