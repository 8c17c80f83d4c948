//! Executor interception: one frame per nested executor invocation,
//! pushed at executor start and popped at executor end. The frame owns
//! every counter block created during its statement; blocks die with the
//! frame, the way the per-query memory context reclaims them in the host
//! server.

use std::rc::Rc;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use planscout_common::{INDEPENDENT_INSTR_ID_START, INVALID_PLAN_NODE_ID};

use crate::catalog::{Catalog, PlanRow, StatsRow};
use crate::config::Settings;
use crate::counters::{CounterBlock, CounterBlockRef, InstrSlot};
use crate::plan::QueryDesc;
use crate::probes::{emit_flush, MarkerSet};

fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

struct ExecFrame {
    start_ts_us: i64,
    /// Descending allocator for instrumentation attached to non-plan
    /// actions during this statement.
    independent_instr_id: i32,
    blocks: Vec<CounterBlockRef>,
    active: Option<CounterBlockRef>,
    /// Snapshot of the master gate at executor start; a statement keeps
    /// the capture decision it began with.
    capturing: bool,
    timer: Option<crate::probes::TimedSpan>,
}

impl ExecFrame {
    fn next_independent_id(&mut self) -> i32 {
        let id = self.independent_instr_id;
        self.independent_instr_id -= 1;
        id
    }
}

/// Per-backend counter pipeline. Backends are single-threaded within a
/// statement, so the frame stack needs no locking; the settings and
/// catalog handles are the shared process-wide state.
pub struct QssPipeline {
    settings: Arc<Settings>,
    catalog: Arc<dyn Catalog>,
    markers: Option<Arc<MarkerSet>>,
    db_id: u32,
    pid: u32,
    frames: Vec<ExecFrame>,
}

impl QssPipeline {
    pub fn new(
        settings: Arc<Settings>,
        catalog: Arc<dyn Catalog>,
        markers: Option<Arc<MarkerSet>>,
        db_id: u32,
        pid: u32,
    ) -> Self {
        Self {
            settings,
            catalog,
            markers,
            db_id,
            pid,
            frames: Vec::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Statement start timestamp of the innermost frame, as carried by the
    /// features markers.
    pub fn statement_start_ts(&self) -> Option<i64> {
        self.frames.last().map(|f| f.start_ts_us)
    }

    /// Intercept executor start: push a frame, arm the sampling gate (on
    /// the outermost invocation), and swap counter blocks into the plan
    /// tree for the documented node tags.
    pub fn executor_start(&mut self, desc: &mut QueryDesc, _eflags: u32) {
        let capturing = self.settings.capture_enabled();
        let outermost = self.frames.is_empty();

        if outermost {
            if let Some(markers) = &self.markers {
                markers.table().sweep_dead_owner();
                if capturing {
                    markers.gate().arm_sampled(self.settings.sampling_rate());
                } else {
                    markers.gate().disarm();
                }
            }
        }

        let mut frame = ExecFrame {
            start_ts_us: now_us(),
            independent_instr_id: INDEPENDENT_INSTR_ID_START,
            blocks: Vec::new(),
            active: None,
            capturing,
            timer: None,
        };

        if capturing && self.settings.capture_query_runtime() {
            frame.timer = Some(crate::probes::TimedSpan::begin());
        }

        if capturing && self.settings.capture_exec_stats() {
            desc.plan.walk_mut(&mut |node| {
                if let Some(ou) = node.tag.counter_ou() {
                    let block = Rc::new(std::cell::RefCell::new(CounterBlock::new(
                        node.plan_node_id,
                        ou.name(),
                    )));
                    node.instrument = Some(InstrSlot::Counters(Rc::clone(&block)));
                    frame.blocks.push(block);
                }
            });
        }

        self.frames.push(frame);
    }

    /// Allocate a counter block for a non-plan action in the current
    /// statement. Returns `None` when capture is disabled or no statement
    /// is executing; callers treat that as "don't count".
    pub fn alloc_counters(&mut self, ou_name: &'static str) -> Option<CounterBlockRef> {
        if !self.settings.capture_enabled() || !self.settings.capture_exec_stats() {
            return None;
        }
        let frame = self.frames.last_mut()?;
        let id = frame.next_independent_id();
        let block = Rc::new(std::cell::RefCell::new(CounterBlock::new(id, ou_name)));
        frame.blocks.push(Rc::clone(&block));
        Some(block)
    }

    /// Mark the block for `plan_node_id` as the currently executing one.
    pub fn set_active_node(&mut self, plan_node_id: i32) {
        if let Some(frame) = self.frames.last_mut() {
            frame.active = frame
                .blocks
                .iter()
                .find(|b| b.borrow().plan_node_id == plan_node_id)
                .cloned();
        }
    }

    /// Non-blocking increment against the active block; a missing block is
    /// tolerated silently.
    pub fn active_add_counter(&self, index: usize, value: f64) {
        if let Some(frame) = self.frames.last() {
            crate::counters::add_counter(frame.active.as_ref(), index, value);
        }
    }

    /// Intercept executor end: emit flush markers, persist the frame's
    /// rows (outermost frame, or every frame under `capture_nested`), and
    /// pop. Persistence failures propagate to the owning backend; the
    /// frame is popped regardless, so the stack stays balanced.
    pub fn executor_end(&mut self, desc: &QueryDesc) -> anyhow::Result<()> {
        let Some(frame) = self.frames.pop() else {
            bail!("executor_end without a matching executor_start");
        };
        let outermost = self.frames.is_empty();

        let result = self.drain_frame(&frame, desc, outermost);

        if outermost {
            if let Some(markers) = &self.markers {
                markers.gate().disarm();
            }
        }
        result
    }

    /// Drop all outstanding frames, as the surrounding memory-context
    /// teardown does when a statement errors out.
    pub fn reset_frames(&mut self) {
        self.frames.clear();
        if let Some(markers) = &self.markers {
            markers.gate().disarm();
        }
    }

    fn drain_frame(
        &self,
        frame: &ExecFrame,
        desc: &QueryDesc,
        outermost: bool,
    ) -> anyhow::Result<()> {
        if !frame.capturing {
            return Ok(());
        }

        if let Some(markers) = &self.markers {
            desc.plan.walk(&mut |node| {
                if let Some(ou) = node.tag.marker_ou() {
                    emit_flush(markers, ou, node.plan_node_id);
                }
            });
        }

        if !outermost && !self.settings.capture_nested() {
            return Ok(());
        }

        let have_exec_stats = self.settings.capture_exec_stats();
        let have_runtime = frame.timer.is_some();
        if !have_exec_stats && !have_runtime {
            return Ok(());
        }

        let ts = now_us();
        let plan_row = PlanRow {
            query_id: desc.query_id,
            generation: desc.generation,
            db_id: self.db_id,
            pid: self.pid,
            timestamp_us: ts,
            features_text: desc.explain_text(),
        };

        let mut stats_rows = Vec::new();
        if have_exec_stats {
            for block in &frame.blocks {
                let block = block.borrow();
                if !block.signature_valid() {
                    continue;
                }
                stats_rows.push(StatsRow {
                    query_id: desc.query_id,
                    db_id: self.db_id,
                    pid: self.pid,
                    timestamp_us: ts,
                    plan_node_id: block.plan_node_id,
                    elapsed_us: block.base.total_us,
                    counters: block.counters,
                    payload: None,
                    comment: block.ou_name.to_string(),
                });
            }
        }
        if let Some(timer) = &frame.timer {
            stats_rows.push(StatsRow {
                query_id: desc.query_id,
                db_id: self.db_id,
                pid: self.pid,
                timestamp_us: ts,
                plan_node_id: INVALID_PLAN_NODE_ID,
                elapsed_us: timer.elapsed_us(),
                counters: [0.0; planscout_common::NUM_QSS_COUNTERS],
                payload: None,
                comment: "query".to_string(),
            });
        }

        if self.settings.output_noisepage() {
            self.catalog
                .upsert_plan(plan_row)
                .context("persist plan row")?;
            for row in stats_rows {
                self.catalog.append_stats(row).context("persist stats row")?;
            }
        } else {
            log::info!("plan: {}", serde_json::to_string(&plan_row)?);
            for row in stats_rows {
                log::info!("stats: {}", serde_json::to_string(&row)?);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BTreeCatalog;
    use crate::plan::{NodeTag, PlanState};

    fn settings_all_on() -> Arc<Settings> {
        let settings = Settings::new();
        settings.set_capture_enabled(true);
        settings.set_capture_exec_stats(true);
        settings.set_capture_query_runtime(true);
        settings.set_sampling_rate(1.0).unwrap();
        Arc::new(settings)
    }

    fn scan_desc(query_id: i64, generation: i64) -> QueryDesc {
        QueryDesc {
            query_id,
            generation,
            db_id: 5,
            query_text: "select count(*) from t".into(),
            plan: PlanState::new(NodeTag::Agg, 0).with_children(vec![PlanState::new(
                NodeTag::IndexScan,
                1,
            )]),
        }
    }

    fn pipeline(settings: Arc<Settings>, catalog: Arc<BTreeCatalog>) -> QssPipeline {
        QssPipeline::new(settings, catalog, None, 5, 100)
    }

    #[test]
    fn plan_walk_attaches_blocks_to_documented_tags_only() {
        let catalog = Arc::new(BTreeCatalog::new());
        let mut qss = pipeline(settings_all_on(), Arc::clone(&catalog));
        let mut desc = QueryDesc {
            query_id: 1,
            generation: 1,
            db_id: 5,
            query_text: String::new(),
            plan: PlanState::new(NodeTag::Agg, 0).with_children(vec![
                PlanState::new(NodeTag::SeqScan, 1),
                PlanState::new(NodeTag::IndexScan, 2),
            ]),
        };
        qss.executor_start(&mut desc, 0);

        assert!(desc.plan.instrument.as_ref().unwrap().as_counter_block().is_some());
        assert!(desc.plan.children[0].instrument.is_none());
        assert!(desc.plan.children[1].instrument.is_some());

        qss.executor_end(&desc).unwrap();
        // One row per block (Agg + IndexScan) plus the whole-query row.
        assert_eq!(catalog.stats().len(), 3);
    }

    #[test]
    fn repeated_execution_upserts_one_plan_row() {
        let catalog = Arc::new(BTreeCatalog::new());
        let mut qss = pipeline(settings_all_on(), Arc::clone(&catalog));

        for _ in 0..2 {
            let mut desc = scan_desc(9, 1);
            qss.executor_start(&mut desc, 0);
            qss.executor_end(&desc).unwrap();
        }

        assert_eq!(catalog.plans().len(), 1, "plan upsert is idempotent");
        let whole_query: Vec<_> = catalog
            .stats()
            .into_iter()
            .filter(|r| r.plan_node_id == INVALID_PLAN_NODE_ID)
            .collect();
        assert_eq!(whole_query.len(), 2, "one elapsed row per execution");
    }

    #[test]
    fn disabled_master_gate_produces_nothing() {
        let settings = Settings::new();
        settings.set_capture_exec_stats(true);
        settings.set_capture_query_runtime(true);
        settings.set_sampling_rate(1.0).unwrap();
        // capture_enabled stays false.
        let catalog = Arc::new(BTreeCatalog::new());
        let mut qss = pipeline(Arc::new(settings), Arc::clone(&catalog));

        let mut desc = scan_desc(1, 1);
        qss.executor_start(&mut desc, 0);
        assert!(qss.alloc_counters("trigger").is_none());
        qss.executor_end(&desc).unwrap();

        assert!(catalog.plans().is_empty());
        assert!(catalog.stats().is_empty());
        assert!(desc.plan.instrument.is_none());
    }

    #[test]
    fn disabled_master_gate_never_arms_the_sampling_gate() {
        let dir = tempfile::tempdir().unwrap();
        let table =
            crate::probes::SemaphoreTable::create(&dir.path().join("markers.sem")).unwrap();
        table.attach_all(std::process::id());
        let markers = Arc::new(crate::probes::MarkerSet::new(table));

        let settings = Settings::new();
        settings.set_sampling_rate(1.0).unwrap();
        // capture_enabled stays false: no marker may fire, semaphores or not.
        let catalog = Arc::new(BTreeCatalog::new());
        let mut qss = QssPipeline::new(
            Arc::new(settings),
            catalog,
            Some(Arc::clone(&markers)),
            5,
            100,
        );

        let mut desc = scan_desc(1, 1);
        qss.executor_start(&mut desc, 0);
        assert!(!markers.gate().is_set());
        assert!(!markers.armed(
            planscout_common::OuIndex::SeqScan,
            planscout_common::MarkerEvent::Begin
        ));
        qss.executor_end(&desc).unwrap();
    }

    #[test]
    fn nested_frames_persist_only_when_enabled() {
        let catalog = Arc::new(BTreeCatalog::new());
        let settings = settings_all_on();
        let mut qss = pipeline(Arc::clone(&settings), Arc::clone(&catalog));

        let mut outer = scan_desc(1, 1);
        let mut inner = scan_desc(2, 1);
        qss.executor_start(&mut outer, 0);
        qss.executor_start(&mut inner, 0);
        qss.executor_end(&inner).unwrap();
        qss.executor_end(&outer).unwrap();
        // Only the outermost frame persisted.
        assert_eq!(catalog.plans().len(), 1);
        assert_eq!(catalog.plans()[0].query_id, 1);

        settings.set_capture_nested(true);
        let mut outer = scan_desc(3, 1);
        let mut inner = scan_desc(4, 1);
        qss.executor_start(&mut outer, 0);
        qss.executor_start(&mut inner, 0);
        qss.executor_end(&inner).unwrap();
        qss.executor_end(&outer).unwrap();
        let ids: Vec<i64> = catalog.plans().iter().map(|p| p.query_id).collect();
        assert!(ids.contains(&3) && ids.contains(&4));
    }

    #[test]
    fn frames_nest_strictly() {
        let catalog = Arc::new(BTreeCatalog::new());
        let mut qss = pipeline(settings_all_on(), catalog);
        let desc = scan_desc(1, 1);
        assert!(qss.executor_end(&desc).is_err());

        let mut desc = scan_desc(1, 1);
        qss.executor_start(&mut desc, 0);
        assert_eq!(qss.depth(), 1);
        qss.executor_end(&desc).unwrap();
        assert_eq!(qss.depth(), 0);
    }

    #[test]
    fn independent_ids_descend_from_the_documented_start() {
        let catalog = Arc::new(BTreeCatalog::new());
        let mut qss = pipeline(settings_all_on(), catalog);
        let mut desc = scan_desc(1, 1);
        qss.executor_start(&mut desc, 0);

        let first = qss.alloc_counters("trigger").unwrap();
        let second = qss.alloc_counters("trigger").unwrap();
        assert_eq!(first.borrow().plan_node_id, INDEPENDENT_INSTR_ID_START);
        assert_eq!(second.borrow().plan_node_id, INDEPENDENT_INSTR_ID_START - 1);
        qss.executor_end(&desc).unwrap();
    }

    #[test]
    fn active_counter_updates_flow_into_stats() {
        let catalog = Arc::new(BTreeCatalog::new());
        let mut qss = pipeline(settings_all_on(), Arc::clone(&catalog));
        let mut desc = scan_desc(1, 1);
        qss.executor_start(&mut desc, 0);

        qss.set_active_node(1); // the IndexScan block
        qss.active_add_counter(0, 2.0);
        qss.active_add_counter(0, 3.0);
        qss.executor_end(&desc).unwrap();

        let row = catalog
            .stats()
            .into_iter()
            .find(|r| r.plan_node_id == 1)
            .expect("index scan row");
        assert_eq!(row.counters[0], 5.0);
        assert_eq!(row.comment, "index_scan");
    }

    #[test]
    fn json_output_mode_skips_the_catalog() {
        let settings = settings_all_on();
        settings.set_output_noisepage(false);
        let catalog = Arc::new(BTreeCatalog::new());
        let mut qss = pipeline(settings, Arc::clone(&catalog));

        let mut desc = scan_desc(1, 1);
        qss.executor_start(&mut desc, 0);
        qss.executor_end(&desc).unwrap();
        assert!(catalog.plans().is_empty());
        assert!(catalog.stats().is_empty());
    }
}
