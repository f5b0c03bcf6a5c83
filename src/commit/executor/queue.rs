use crate::error::EngineError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// One writer at a time per database, granted in arrival order.
///
/// Waiting is a plain future: dropping it before the slot is granted removes the
/// request from the queue without side effects.
#[derive(Default)]
pub(crate) struct WriteQueue {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    depth: Arc<AtomicUsize>,
}

/// Held for the duration of one write unit.
pub(crate) struct WriteSlot {
    _guard: OwnedMutexGuard<()>,
    _depth: DepthGuard,
}

struct DepthGuard(Arc<AtomicUsize>);

impl DepthGuard {
    fn enter(depth: &Arc<AtomicUsize>) -> Self {
        depth.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(depth))
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WriteQueue {
    fn slot(&self, database_id: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock();
        Arc::clone(
            slots
                .entry(database_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    pub(crate) async fn acquire(
        &self,
        database_id: &str,
        wait: Duration,
    ) -> Result<WriteSlot, EngineError> {
        let depth = DepthGuard::enter(&self.depth);
        let slot = self.slot(database_id);
        match tokio::time::timeout(wait, slot.lock_owned()).await {
            Ok(guard) => {
                debug!(database_id, "write slot granted");
                Ok(WriteSlot {
                    _guard: guard,
                    _depth: depth,
                })
            }
            Err(_) => Err(EngineError::Timeout {
                phase: "write queue wait",
            }),
        }
    }

    /// Requests waiting for or holding a slot, across all databases.
    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub(crate) fn forget(&self, database_id: &str) {
        self.slots.lock().remove(database_id);
    }
}
