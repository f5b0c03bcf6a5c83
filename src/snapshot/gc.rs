use crate::catalog::schema::CachedDatabaseSchema;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakWarning {
    pub database_id: String,
    pub schema_version: u64,
    pub age: Duration,
    pub holders: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcResult {
    pub reclaimed_snapshots: usize,
    pub still_held: usize,
}

#[derive(Debug)]
struct RetiredRef {
    database_id: String,
    schema_version: u64,
    snapshot: Weak<CachedDatabaseSchema>,
    retired_at: Instant,
}

/// Tracks snapshots replaced by a refresh until the last in-flight request drops them.
///
/// The cache only holds weak references here; a retired snapshot's memory is owned by
/// whichever requests still hold its `Arc`.
#[derive(Debug, Default)]
pub struct RetiredSnapshots {
    retired: Vec<RetiredRef>,
}

impl RetiredSnapshots {
    pub fn retire(&mut self, snapshot: &Arc<CachedDatabaseSchema>) {
        self.retired.push(RetiredRef {
            database_id: snapshot.database_id.clone(),
            schema_version: snapshot.schema_version,
            snapshot: Arc::downgrade(snapshot),
            retired_at: Instant::now(),
        });
    }

    pub fn gc(&mut self) -> GcResult {
        let before = self.retired.len();
        self.retired.retain(|r| r.snapshot.strong_count() > 0);
        GcResult {
            reclaimed_snapshots: before.saturating_sub(self.retired.len()),
            still_held: self.retired.len(),
        }
    }

    /// Retired snapshots still referenced after `threshold_ms`.
    pub fn check_leaks(&self, threshold_ms: u64) -> Vec<LeakWarning> {
        let threshold = Duration::from_millis(threshold_ms);
        let now = Instant::now();
        self.retired
            .iter()
            .filter_map(|r| {
                let holders = r.snapshot.strong_count();
                if holders == 0 {
                    return None;
                }
                let age = now.duration_since(r.retired_at);
                (age >= threshold).then(|| LeakWarning {
                    database_id: r.database_id.clone(),
                    schema_version: r.schema_version,
                    age,
                    holders,
                })
            })
            .collect()
    }

    pub fn held_versions(&self, database_id: &str) -> Vec<u64> {
        self.retired
            .iter()
            .filter(|r| r.database_id == database_id && r.snapshot.strong_count() > 0)
            .map(|r| r.schema_version)
            .collect()
    }
}
