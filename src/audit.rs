//! Audit records for completed writes and the best-effort dispatcher that delivers them.

use crate::error::EngineError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Edit,
    Transaction,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_id: String,
    pub kind: AuditKind,
    pub database_id: String,
    /// Tables written, in operation order.
    pub tables: Vec<String>,
    /// `insert`, `batch_update`, ... one per operation.
    pub operations: Vec<String>,
    pub rows_affected: u64,
    pub transaction_id: Option<String>,
    pub backup_paths: Vec<String>,
    pub success: bool,
    pub timestamp_micros: u64,
}

impl AuditRecord {
    pub fn new(kind: AuditKind, database_id: &str) -> Self {
        Self {
            audit_id: Uuid::new_v4().to_string(),
            kind,
            database_id: database_id.to_string(),
            tables: Vec::new(),
            operations: Vec::new(),
            rows_affected: 0,
            transaction_id: None,
            backup_paths: Vec::new(),
            success: true,
            timestamp_micros: crate::catalog::now_micros(),
        }
    }
}

/// Receives audit records. Called off the request path on a blocking thread, so a sink
/// may do file or network I/O; failures are logged only.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<(), EngineError>;
}

enum Msg {
    Record(Arc<AuditRecord>, Vec<Arc<dyn AuditSink>>),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    failed: AtomicU64,
}

fn deliver(record: &AuditRecord, sinks: &[Arc<dyn AuditSink>], counters: &Counters) {
    for sink in sinks {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink.record(record))) {
            Ok(Ok(())) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(err)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(audit_id = %record.audit_id, error = %err, "audit sink rejected record");
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(audit_id = %record.audit_id, "audit sink panicked while handling record");
            }
        }
    }
}

/// Fans records out to the registered sinks on a background task, one record at a time.
///
/// Without a tokio runtime the records are delivered inline.
#[derive(Default)]
pub struct AuditDispatcher {
    sinks: Mutex<Vec<Arc<dyn AuditSink>>>,
    worker: Mutex<Option<mpsc::UnboundedSender<Msg>>>,
    counters: Arc<Counters>,
}

impl AuditDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&self, sink: Arc<dyn AuditSink>) {
        self.sinks.lock().push(sink);
    }

    pub fn has_sinks(&self) -> bool {
        !self.sinks.lock().is_empty()
    }

    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Msg>> {
        let mut worker = self.worker.lock();
        if let Some(tx) = worker.as_ref().filter(|tx| !tx.is_closed()) {
            return Some(tx.clone());
        }
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();
        let counters = Arc::clone(&self.counters);
        handle.spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    Msg::Record(record, sinks) => {
                        let counters = Arc::clone(&counters);
                        let delivery = tokio::task::spawn_blocking(move || {
                            deliver(&record, &sinks, &counters)
                        });
                        if let Err(err) = delivery.await {
                            warn!(error = %err, "audit delivery task failed");
                        }
                    }
                    Msg::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        *worker = Some(tx.clone());
        Some(tx)
    }

    /// Queues `record` for delivery and returns its id, or `None` when no sink is registered.
    pub fn emit(&self, record: AuditRecord) -> Option<String> {
        let sinks = self.sinks.lock().clone();
        if sinks.is_empty() {
            return None;
        }
        let audit_id = record.audit_id.clone();
        let record = Arc::new(record);
        let queued = self
            .sender()
            .is_some_and(|tx| tx.send(Msg::Record(Arc::clone(&record), sinks.clone())).is_ok());
        if !queued {
            // The worker's runtime is gone; the next emit spawns a new one.
            self.worker.lock().take();
            deliver(&record, &sinks, &self.counters);
        }
        Some(audit_id)
    }

    /// Waits until every record queued so far has been handed to the sinks.
    pub async fn flush(&self) {
        let tx = self.worker.lock().clone();
        let Some(tx) = tx else {
            return;
        };
        let (done, wait) = oneshot::channel();
        if tx.send(Msg::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<AuditRecord>>);

    impl AuditSink for Collect {
        fn record(&self, record: &AuditRecord) -> Result<(), EngineError> {
            self.0.lock().push(record.clone());
            Ok(())
        }
    }

    struct Broken;

    impl AuditSink for Broken {
        fn record(&self, _record: &AuditRecord) -> Result<(), EngineError> {
            panic!("sink exploded")
        }
    }

    /// Blocks until released, or gives up after a while.
    struct Waits(Mutex<Option<std::sync::mpsc::Receiver<()>>>, Mutex<Option<bool>>);

    impl AuditSink for Waits {
        fn record(&self, _record: &AuditRecord) -> Result<(), EngineError> {
            let release = self.0.lock().take();
            let released = release
                .map(|rx| rx.recv_timeout(std::time::Duration::from_secs(5)).is_ok())
                .unwrap_or(false);
            *self.1.lock() = Some(released);
            Ok(())
        }
    }

    #[tokio::test]
    async fn blocking_sink_does_not_hold_the_runtime() {
        let (release, rx) = std::sync::mpsc::channel();
        let sink = Arc::new(Waits(Mutex::new(Some(rx)), Mutex::new(None)));
        let dispatcher = AuditDispatcher::new();
        dispatcher.add_sink(sink.clone());
        dispatcher.emit(AuditRecord::new(AuditKind::Edit, "db"));
        // Single-threaded runtime: this only runs while the sink is blocked elsewhere.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        release.send(()).unwrap();
        dispatcher.flush().await;
        assert_eq!(*sink.1.lock(), Some(true));
        assert_eq!(dispatcher.delivered(), 1);
    }

    #[test]
    fn no_sinks_means_no_audit_id() {
        let dispatcher = AuditDispatcher::new();
        assert!(dispatcher.emit(AuditRecord::new(AuditKind::Edit, "db")).is_none());
    }

    #[test]
    fn delivers_inline_without_a_runtime() {
        let dispatcher = AuditDispatcher::new();
        let sink = Arc::new(Collect::default());
        dispatcher.add_sink(sink.clone());
        let id = dispatcher.emit(AuditRecord::new(AuditKind::Edit, "db")).unwrap();
        assert_eq!(sink.0.lock()[0].audit_id, id);
    }

    #[tokio::test]
    async fn panicking_sink_is_counted_and_others_still_receive() {
        let dispatcher = AuditDispatcher::new();
        let sink = Arc::new(Collect::default());
        dispatcher.add_sink(Arc::new(Broken));
        dispatcher.add_sink(sink.clone());
        dispatcher.emit(AuditRecord::new(AuditKind::Transaction, "db"));
        dispatcher.flush().await;
        assert_eq!(sink.0.lock().len(), 1);
        assert_eq!(dispatcher.failures(), 1);
        assert_eq!(dispatcher.delivered(), 1);
    }
}
