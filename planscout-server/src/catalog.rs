//! The two append-only tables the pipeline persists into, behind the
//! database's own storage. `plans` is an idempotent upsert on its primary
//! key; `stats` is append-only. Persistence errors propagate to the owning
//! backend and are never swallowed.

use std::collections::BTreeMap;
use std::sync::Mutex;

use planscout_common::NUM_QSS_COUNTERS;
use serde::Serialize;

/// Primary key of the `plans` table.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct PlanKey {
    pub query_id: i64,
    pub generation: i64,
    pub db_id: u32,
    pub pid: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct PlanRow {
    pub query_id: i64,
    pub generation: i64,
    pub db_id: u32,
    pub pid: u32,
    pub timestamp_us: i64,
    pub features_text: String,
}

impl PlanRow {
    pub fn key(&self) -> PlanKey {
        PlanKey {
            query_id: self.query_id,
            generation: self.generation,
            db_id: self.db_id,
            pid: self.pid,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StatsRow {
    pub query_id: i64,
    pub db_id: u32,
    pub pid: u32,
    pub timestamp_us: i64,
    pub plan_node_id: i32,
    pub elapsed_us: u64,
    pub counters: [f64; NUM_QSS_COUNTERS],
    pub payload: Option<String>,
    pub comment: String,
}

/// Storage seam between the pipeline and the database's table machinery.
pub trait Catalog: Send + Sync {
    /// Insert the plan row unless its key already exists. Returns whether
    /// a new row was written.
    fn upsert_plan(&self, row: PlanRow) -> anyhow::Result<bool>;
    fn append_stats(&self, row: StatsRow) -> anyhow::Result<()>;
}

#[derive(Default)]
struct CatalogInner {
    plan_heap: Vec<PlanRow>,
    plan_index: BTreeMap<PlanKey, usize>,
    stats: Vec<StatsRow>,
}

/// In-tree reference catalog: heap vectors guarded by a B-tree unique
/// index, the same existence-check-then-insert-heap-then-insert-index
/// sequence the real tables run under their row locks.
#[derive(Default)]
pub struct BTreeCatalog {
    inner: Mutex<CatalogInner>,
}

impl BTreeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plans(&self) -> Vec<PlanRow> {
        self.inner.lock().unwrap().plan_heap.clone()
    }

    pub fn stats(&self) -> Vec<StatsRow> {
        self.inner.lock().unwrap().stats.clone()
    }
}

impl Catalog for BTreeCatalog {
    fn upsert_plan(&self, row: PlanRow) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let key = row.key();
        if inner.plan_index.contains_key(&key) {
            return Ok(false);
        }
        let slot = inner.plan_heap.len();
        inner.plan_heap.push(row);
        inner.plan_index.insert(key, slot);
        Ok(true)
    }

    fn append_stats(&self, row: StatsRow) -> anyhow::Result<()> {
        self.inner.lock().unwrap().stats.push(row);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_row(query_id: i64, generation: i64) -> PlanRow {
        PlanRow {
            query_id,
            generation,
            db_id: 5,
            pid: 100,
            timestamp_us: 1,
            features_text: "SeqScan [0]\n".into(),
        }
    }

    #[test]
    fn upsert_is_idempotent_on_primary_key() {
        let catalog = BTreeCatalog::new();
        assert!(catalog.upsert_plan(plan_row(9, 1)).unwrap());
        assert!(!catalog.upsert_plan(plan_row(9, 1)).unwrap());
        assert_eq!(catalog.plans().len(), 1);
        // A new generation is a distinct key.
        assert!(catalog.upsert_plan(plan_row(9, 2)).unwrap());
        assert_eq!(catalog.plans().len(), 2);
    }

    #[test]
    fn stats_rows_always_append() {
        let catalog = BTreeCatalog::new();
        for _ in 0..2 {
            catalog
                .append_stats(StatsRow {
                    query_id: 9,
                    db_id: 5,
                    pid: 100,
                    timestamp_us: 1,
                    plan_node_id: 0,
                    elapsed_us: 10,
                    counters: [0.0; NUM_QSS_COUNTERS],
                    payload: None,
                    comment: String::new(),
                })
                .unwrap();
        }
        assert_eq!(catalog.stats().len(), 2);
    }
}
