//! Per-key collector state machine: BEGIN -> END (one or more) ->
//! FEATURES/FLUSH, with RESET as the recovery action.
//!
//! The transition rules are written once, generic over the backing tables
//! and the counter source, so the kernel collector instantiates them over
//! BPF maps while tests instantiate them over plain hash maps with scripted
//! counter readings. Every map operation on the kernel side is atomic per
//! entry; ordering within a single key matches program order on the backend
//! that produced the events, and nothing is assumed across keys.

use crate::{
    accumulate, finish_pair, unpack_key, CounterSnapshot, RecordHeader, ResourceMetrics,
};

/// Why a transition discarded its data point instead of progressing.
/// The pipeline never degrades the host server: when in doubt, drop.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Perf counter read failed at BEGIN or END.
    CounterRead = 0,
    /// A bounded state map refused the write.
    TableFull = 1,
    /// END or FLUSH arrived with no outstanding BEGIN.
    MissingBegin = 2,
    /// A counter moved backward between BEGIN and END (CPU migration).
    NegativeDelta = 3,
    /// FLUSH arrived but no FEATURES payload was stored.
    MissingFeatures = 4,
    /// FLUSH arrived but no completed metrics exist for the key.
    MissingMetrics = 5,
    /// The per-OU result ring refused the record.
    RingFull = 6,
    /// BEGIN arrived while a BEGIN was already outstanding for the key.
    NestedBegin = 7,
}

pub const NUM_DROP_REASONS: usize = 8;

/// Counter snapshot provider. The kernel side reads perf counters and
/// per-task accounting; tests script the readings.
pub trait CounterSource {
    fn snapshot(&mut self) -> Option<CounterSnapshot>;
}

/// The three bounded maps backing one OU's state machine. All accessors
/// copy values out; an insert over an existing key overwrites it.
pub trait StateTables {
    type Features: Copy;

    fn running_get(&self, key: u64) -> Option<CounterSnapshot>;
    fn running_insert(&mut self, key: u64, snap: &CounterSnapshot) -> bool;
    fn running_remove(&mut self, key: u64);

    fn complete_get(&self, key: u64) -> Option<ResourceMetrics>;
    fn complete_insert(&mut self, key: u64, metrics: &ResourceMetrics) -> bool;
    fn complete_remove(&mut self, key: u64);

    fn features_get(&self, plan_node_id: i32) -> Option<Self::Features>;
    fn features_insert(&mut self, plan_node_id: i32, features: &Self::Features) -> bool;
    fn features_remove(&mut self, plan_node_id: i32);
}

/// Erase all state for a key across the three maps, without emission.
#[inline(always)]
pub fn reset<T: StateTables>(tables: &mut T, key: u64) {
    let (_, plan_node_id) = unpack_key(key);
    tables.running_remove(key);
    tables.complete_remove(key);
    tables.features_remove(plan_node_id);
}

/// BEGIN: snapshot counters and arm the key. A BEGIN while one is already
/// outstanding is a protocol violation and resets the key.
#[inline(always)]
pub fn on_begin<T: StateTables, C: CounterSource>(
    tables: &mut T,
    counters: &mut C,
    key: u64,
) -> Result<(), DropReason> {
    if tables.running_get(key).is_some() {
        reset(tables, key);
        return Err(DropReason::NestedBegin);
    }
    let snap = match counters.snapshot() {
        Some(snap) => snap,
        None => {
            reset(tables, key);
            return Err(DropReason::CounterRead);
        }
    };
    if !tables.running_insert(key, &snap) {
        reset(tables, key);
        return Err(DropReason::TableFull);
    }
    Ok(())
}

/// END: compute deltas against the armed snapshot and move them into the
/// completed map, accumulating across repeated BEGIN/END pairs.
#[inline(always)]
pub fn on_end<T: StateTables, C: CounterSource>(
    tables: &mut T,
    counters: &mut C,
    key: u64,
) -> Result<(), DropReason> {
    let begin = match tables.running_get(key) {
        Some(snap) => snap,
        None => {
            reset(tables, key);
            return Err(DropReason::MissingBegin);
        }
    };
    let end = match counters.snapshot() {
        Some(snap) => snap,
        None => {
            reset(tables, key);
            return Err(DropReason::CounterRead);
        }
    };
    let finished = match finish_pair(&begin, &end) {
        Some(metrics) => metrics,
        None => {
            reset(tables, key);
            return Err(DropReason::NegativeDelta);
        }
    };
    match tables.complete_get(key) {
        Some(mut acc) => {
            accumulate(&mut acc, &finished);
            // Overwrites the existing entry, so capacity cannot fail here.
            let _ = tables.complete_insert(key, &acc);
        }
        None => {
            if !tables.complete_insert(key, &finished) {
                reset(tables, key);
                return Err(DropReason::TableFull);
            }
        }
    }
    tables.running_remove(key);
    Ok(())
}

/// FEATURES: store the payload until FLUSH. Capacity exhaustion drops the
/// write but leaves metric state intact; the eventual FLUSH resets.
#[inline(always)]
pub fn on_features<T: StateTables>(
    tables: &mut T,
    plan_node_id: i32,
    features: &T::Features,
) -> Result<(), DropReason> {
    if tables.features_insert(plan_node_id, features) {
        Ok(())
    } else {
        Err(DropReason::TableFull)
    }
}

/// FLUSH: join features with accumulated metrics, hand the assembled record
/// to `emit`, and reset the key whether or not emission succeeded.
#[inline(always)]
pub fn on_flush<T, E>(tables: &mut T, key: u64, emit: E) -> Result<(), DropReason>
where
    T: StateTables,
    E: FnOnce(RecordHeader, &T::Features, &ResourceMetrics) -> bool,
{
    let (ou_index, plan_node_id) = unpack_key(key);
    let features = match tables.features_get(plan_node_id) {
        Some(features) => features,
        None => {
            reset(tables, key);
            return Err(DropReason::MissingFeatures);
        }
    };
    let metrics = match tables.complete_get(key) {
        Some(metrics) => metrics,
        None => {
            reset(tables, key);
            return Err(DropReason::MissingMetrics);
        }
    };
    let header = RecordHeader {
        ou_index,
        pid: metrics.pid,
    };
    let published = emit(header, &features, &metrics);
    reset(tables, key);
    if published {
        Ok(())
    } else {
        Err(DropReason::RingFull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pack_key, OuIndex, NUM_PERF_COUNTERS};
    use std::collections::{HashMap, VecDeque};

    #[derive(Copy, Clone, Debug, PartialEq)]
    struct SeqScanFeatures {
        plan_node_id: i32,
        query_id: i64,
        plan_ptr: u64,
        left_child_id: i32,
        right_child_id: i32,
        statement_start_ts: i64,
        relid: u32,
    }

    #[derive(Default)]
    struct MemTables {
        running: HashMap<u64, CounterSnapshot>,
        complete: HashMap<u64, ResourceMetrics>,
        features: HashMap<i32, SeqScanFeatures>,
        capacity: usize,
    }

    impl MemTables {
        fn bounded(capacity: usize) -> Self {
            Self {
                capacity,
                ..Default::default()
            }
        }
    }

    impl StateTables for MemTables {
        type Features = SeqScanFeatures;

        fn running_get(&self, key: u64) -> Option<CounterSnapshot> {
            self.running.get(&key).copied()
        }
        fn running_insert(&mut self, key: u64, snap: &CounterSnapshot) -> bool {
            if self.capacity > 0
                && self.running.len() >= self.capacity
                && !self.running.contains_key(&key)
            {
                return false;
            }
            self.running.insert(key, *snap);
            true
        }
        fn running_remove(&mut self, key: u64) {
            self.running.remove(&key);
        }

        fn complete_get(&self, key: u64) -> Option<ResourceMetrics> {
            self.complete.get(&key).copied()
        }
        fn complete_insert(&mut self, key: u64, metrics: &ResourceMetrics) -> bool {
            if self.capacity > 0
                && self.complete.len() >= self.capacity
                && !self.complete.contains_key(&key)
            {
                return false;
            }
            self.complete.insert(key, *metrics);
            true
        }
        fn complete_remove(&mut self, key: u64) {
            self.complete.remove(&key);
        }

        fn features_get(&self, plan_node_id: i32) -> Option<SeqScanFeatures> {
            self.features.get(&plan_node_id).copied()
        }
        fn features_insert(&mut self, plan_node_id: i32, features: &SeqScanFeatures) -> bool {
            self.features.insert(plan_node_id, *features);
            true
        }
        fn features_remove(&mut self, plan_node_id: i32) {
            self.features.remove(&plan_node_id);
        }
    }

    struct ScriptedCounters {
        readings: VecDeque<Option<CounterSnapshot>>,
    }

    impl ScriptedCounters {
        fn new(readings: Vec<Option<CounterSnapshot>>) -> Self {
            Self {
                readings: readings.into(),
            }
        }
    }

    impl CounterSource for ScriptedCounters {
        fn snapshot(&mut self) -> Option<CounterSnapshot> {
            self.readings.pop_front().flatten()
        }
    }

    fn snap(time_us: u64, instructions: u64, cpu_id: u32) -> CounterSnapshot {
        let mut perf = [0u64; NUM_PERF_COUNTERS];
        perf[1] = instructions;
        CounterSnapshot {
            perf,
            time_us,
            cpu_id,
            pid: 4242,
            ..Default::default()
        }
    }

    fn features(plan_node_id: i32) -> SeqScanFeatures {
        SeqScanFeatures {
            plan_node_id,
            query_id: 42,
            plan_ptr: 0xAA,
            left_child_id: -1,
            right_child_id: -1,
            statement_start_ts: 1_000,
            relid: 100,
        }
    }

    fn key_for(id: i32) -> u64 {
        pack_key(OuIndex::SeqScan as u32, id)
    }

    fn assert_empty(tables: &MemTables, key: u64) {
        let (_, id) = unpack_key(key);
        assert!(tables.running_get(key).is_none());
        assert!(tables.complete_get(key).is_none());
        assert!(tables.features_get(id).is_none());
    }

    #[test]
    fn single_pair_emits_one_record() {
        let mut tables = MemTables::default();
        let mut counters =
            ScriptedCounters::new(vec![Some(snap(100, 1_000, 2)), Some(snap(160, 1_250, 2))]);
        let key = key_for(7);

        on_begin(&mut tables, &mut counters, key).unwrap();
        on_features(&mut tables, 7, &features(7)).unwrap();
        on_end(&mut tables, &mut counters, key).unwrap();

        let mut emitted = Vec::new();
        on_flush(&mut tables, key, |header, features, metrics| {
            emitted.push((header, *features, *metrics));
            true
        })
        .unwrap();

        assert_eq!(emitted.len(), 1);
        let (header, feat, metrics) = &emitted[0];
        assert_eq!(header.ou_index, OuIndex::SeqScan as u32);
        assert_eq!(header.pid, 4242);
        assert_eq!(feat.relid, 100);
        assert_eq!(metrics.elapsed_us, metrics.end_time_us - metrics.start_time_us);
        assert_eq!(metrics.instructions, 250);
        assert_empty(&tables, key);
    }

    #[test]
    fn accumulation_across_three_pairs() {
        let mut tables = MemTables::default();
        let mut counters = ScriptedCounters::new(vec![
            Some(snap(100, 0, 1)),
            Some(snap(110, 10, 1)),
            Some(snap(200, 50, 5)),
            Some(snap(215, 70, 5)),
            Some(snap(300, 90, 6)),
            Some(snap(330, 120, 6)),
        ]);
        let key = key_for(7);

        for _ in 0..3 {
            on_begin(&mut tables, &mut counters, key).unwrap();
            on_end(&mut tables, &mut counters, key).unwrap();
        }
        on_features(&mut tables, 7, &features(7)).unwrap();

        let mut emitted = Vec::new();
        on_flush(&mut tables, key, |_, _, metrics| {
            emitted.push(*metrics);
            true
        })
        .unwrap();

        let metrics = emitted[0];
        assert_eq!(metrics.instructions, 10 + 20 + 30);
        assert_eq!(metrics.start_time_us, 100);
        assert_eq!(metrics.end_time_us, 330);
        assert_eq!(metrics.elapsed_us, 10 + 15 + 30);
        // cpu_id is the first END's cpu.
        assert_eq!(metrics.cpu_id, 1);
    }

    #[test]
    fn flush_without_features_drops_and_resets() {
        let mut tables = MemTables::default();
        let mut counters =
            ScriptedCounters::new(vec![Some(snap(10, 0, 0)), Some(snap(20, 5, 0))]);
        let key = key_for(3);

        on_begin(&mut tables, &mut counters, key).unwrap();
        on_end(&mut tables, &mut counters, key).unwrap();

        let mut emitted = 0;
        let err = on_flush(&mut tables, key, |_, _, _| {
            emitted += 1;
            true
        })
        .unwrap_err();

        assert_eq!(err, DropReason::MissingFeatures);
        assert_eq!(emitted, 0);
        assert_empty(&tables, key);
    }

    #[test]
    fn backward_counter_resets_key() {
        let mut tables = MemTables::default();
        // Normalized reading on CPU B is below the snapshot taken on CPU A.
        let mut counters =
            ScriptedCounters::new(vec![Some(snap(10, 900, 0)), Some(snap(30, 850, 1))]);
        let key = key_for(9);

        on_begin(&mut tables, &mut counters, key).unwrap();
        let err = on_end(&mut tables, &mut counters, key).unwrap_err();

        assert_eq!(err, DropReason::NegativeDelta);
        assert_empty(&tables, key);
    }

    #[test]
    fn end_without_begin_is_dropped() {
        let mut tables = MemTables::default();
        let mut counters = ScriptedCounters::new(vec![Some(snap(10, 0, 0))]);
        let key = key_for(1);

        let err = on_end(&mut tables, &mut counters, key).unwrap_err();
        assert_eq!(err, DropReason::MissingBegin);
        assert_empty(&tables, key);
    }

    #[test]
    fn nested_begin_resets_outstanding_state() {
        let mut tables = MemTables::default();
        let mut counters =
            ScriptedCounters::new(vec![Some(snap(10, 0, 0)), Some(snap(20, 5, 0))]);
        let key = key_for(2);

        on_begin(&mut tables, &mut counters, key).unwrap();
        let err = on_begin(&mut tables, &mut counters, key).unwrap_err();
        assert_eq!(err, DropReason::NestedBegin);
        assert_empty(&tables, key);
    }

    #[test]
    fn counter_read_failure_at_begin_resets() {
        let mut tables = MemTables::default();
        let mut counters = ScriptedCounters::new(vec![None]);
        let key = key_for(5);

        let err = on_begin(&mut tables, &mut counters, key).unwrap_err();
        assert_eq!(err, DropReason::CounterRead);
        assert_empty(&tables, key);
    }

    #[test]
    fn full_running_table_drops_new_keys() {
        let mut tables = MemTables::bounded(1);
        let mut counters =
            ScriptedCounters::new(vec![Some(snap(10, 0, 0)), Some(snap(11, 0, 0))]);

        on_begin(&mut tables, &mut counters, key_for(1)).unwrap();
        let err = on_begin(&mut tables, &mut counters, key_for(2)).unwrap_err();
        assert_eq!(err, DropReason::TableFull);
        // The established key is untouched.
        assert!(tables.running_get(key_for(1)).is_some());
    }

    #[test]
    fn ring_full_still_resets_key() {
        let mut tables = MemTables::default();
        let mut counters =
            ScriptedCounters::new(vec![Some(snap(10, 0, 0)), Some(snap(20, 5, 0))]);
        let key = key_for(8);

        on_begin(&mut tables, &mut counters, key).unwrap();
        on_end(&mut tables, &mut counters, key).unwrap();
        on_features(&mut tables, 8, &features(8)).unwrap();

        let err = on_flush(&mut tables, key, |_, _, _| false).unwrap_err();
        assert_eq!(err, DropReason::RingFull);
        assert_empty(&tables, key);
    }

    #[test]
    fn begin_after_end_rearms_without_losing_accumulation() {
        let mut tables = MemTables::default();
        let mut counters = ScriptedCounters::new(vec![
            Some(snap(10, 0, 0)),
            Some(snap(20, 5, 0)),
            Some(snap(30, 100, 0)),
        ]);
        let key = key_for(4);

        on_begin(&mut tables, &mut counters, key).unwrap();
        on_end(&mut tables, &mut counters, key).unwrap();
        // Re-arm: the completed metrics survive and the key runs again.
        on_begin(&mut tables, &mut counters, key).unwrap();
        assert!(tables.complete_get(key).is_some());
        assert!(tables.running_get(key).is_some());
    }
}
