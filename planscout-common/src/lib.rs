#![cfg_attr(all(feature = "bpf", not(feature = "user")), no_std)]

#[cfg(test)]
use core::mem::size_of;

use bytemuck::{Pod, Zeroable};

pub mod protocol;

// =============================================================================
// OPERATING-UNIT TELEMETRY - Shared Protocol Definitions
// =============================================================================
//
// Everything that crosses the kernel/user boundary (or the server/coordinator
// boundary) is defined here, once, with a fixed #[repr(C)] layout:
//
//   - the operating-unit catalog and its stable indices
//   - plan-node identity and the packed 64-bit collector key
//   - the metric structs snapshotted at BEGIN and emitted at FLUSH
//   - the per-OU record header and the lifecycle ring payload
//   - the marker semaphore table layout shared with the coordinator
//
// Producer and consumer run on the same machine, so no endianness conversion
// is performed anywhere; numeric widths are the declared widths below.
// =============================================================================

/// A named kind of work with its own feature schema. Indices are stable and
/// dense; they select the per-OU maps and rings on the kernel side and the
/// per-OU sink on the coordinator side.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum OuIndex {
    SeqScan = 0,
    IndexScan = 1,
    IndexOnlyScan = 2,
    BitmapIndexScan = 3,
    BitmapHeapScan = 4,
    NestLoop = 5,
    HashJoin = 6,
    Hash = 7,
    Agg = 8,
    Sort = 9,
    ModifyTableInsert = 10,
    LockRows = 11,
    SubPlan = 12,
    RemoteReceiver = 13,
}

pub const NUM_OUS: usize = 14;

impl OuIndex {
    pub const ALL: [OuIndex; NUM_OUS] = [
        OuIndex::SeqScan,
        OuIndex::IndexScan,
        OuIndex::IndexOnlyScan,
        OuIndex::BitmapIndexScan,
        OuIndex::BitmapHeapScan,
        OuIndex::NestLoop,
        OuIndex::HashJoin,
        OuIndex::Hash,
        OuIndex::Agg,
        OuIndex::Sort,
        OuIndex::ModifyTableInsert,
        OuIndex::LockRows,
        OuIndex::SubPlan,
        OuIndex::RemoteReceiver,
    ];

    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub const fn name(self) -> &'static str {
        match self {
            OuIndex::SeqScan => "seq_scan",
            OuIndex::IndexScan => "index_scan",
            OuIndex::IndexOnlyScan => "index_only_scan",
            OuIndex::BitmapIndexScan => "bitmap_index_scan",
            OuIndex::BitmapHeapScan => "bitmap_heap_scan",
            OuIndex::NestLoop => "nest_loop",
            OuIndex::HashJoin => "hash_join",
            OuIndex::Hash => "hash",
            OuIndex::Agg => "agg",
            OuIndex::Sort => "sort",
            OuIndex::ModifyTableInsert => "modify_table_insert",
            OuIndex::LockRows => "lock_rows",
            OuIndex::SubPlan => "sub_plan",
            OuIndex::RemoteReceiver => "remote_receiver",
        }
    }
}

// Plan-node identity. Within one query execution a plan node has a signed id;
// negative ids are reserved, and ids at or below INDEPENDENT_INSTR_ID_START
// are handed out downward for instrumentation attached to non-plan actions
// (triggers and the like) during the same execution.
pub const INVALID_PLAN_NODE_ID: i32 = -1;
pub const REMOTE_RECEIVER_PLAN_NODE_ID: i32 = -2;
pub const INDEPENDENT_PLAN_NODE_ID: i32 = -3;
pub const INDEPENDENT_INSTR_ID_START: i32 = INDEPENDENT_PLAN_NODE_ID - 1;

/// Pack `(ou_index, plan_node_id)` into the 64-bit collector state key.
/// The id keeps its two's-complement bits so negative ids round-trip.
#[inline(always)]
pub fn pack_key(ou_index: u32, plan_node_id: i32) -> u64 {
    ((ou_index as u64) << 32) | (plan_node_id as u32 as u64)
}

#[inline(always)]
pub fn unpack_key(key: u64) -> (u32, i32) {
    ((key >> 32) as u32, key as u32 as i32)
}

/// Perf counters sampled at BEGIN and END: cpu-cycles, instructions,
/// cache-references, cache-misses, ref-cpu-cycles, in that order.
pub const NUM_PERF_COUNTERS: usize = 5;

pub const PERF_COUNTER_NAMES: [&str; NUM_PERF_COUNTERS] = [
    "cpu_cycles",
    "instructions",
    "cache_references",
    "cache_misses",
    "ref_cpu_cycles",
];

/// Bounded per-OU state map capacity. Overflowing writes fail silently and
/// are surfaced through the drop counters.
pub const STATE_MAP_CAPACITY: u32 = 4096;

/// Per-OU result ring size in bytes. Must be a power-of-two multiple of the
/// page size.
pub const RESULT_RING_BYTES: u32 = 256 * 1024;

/// Postmaster lifecycle ring size in bytes.
pub const LIFECYCLE_RING_BYTES: u32 = 64 * 1024;

/// Compile-time maximum number of marker payload slots.
pub const MARKER_MAX_ARGS: usize = 12;

/// Correct a multiplexed perf counter reading: `counter * enabled / running`.
/// A counter that never ran is returned unscaled.
#[inline(always)]
pub fn normalize_counter(counter: u64, enabled: u64, running: u64) -> u64 {
    if running == 0 {
        return counter;
    }
    ((counter as u128 * enabled as u128) / running as u128) as u64
}

/// The reading taken at BEGIN (and again at END, to compute deltas).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct CounterSnapshot {
    /// Normalized perf counters, ordered as `PERF_COUNTER_NAMES`.
    pub perf: [u64; NUM_PERF_COUNTERS],
    pub disk_bytes_read: u64,
    pub disk_bytes_written: u64,
    pub network_bytes_read: u64,
    pub network_bytes_written: u64,
    /// Monotonic microseconds (nanosecond clock >> 10; the approximation is
    /// accepted throughout the pipeline).
    pub time_us: u64,
    pub cpu_id: u32,
    pub pid: u32,
}

/// The metric block emitted with every completed record. Field order is the
/// wire order; `METRIC_FIELD_NAMES` must stay in sync.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceMetrics {
    pub start_time_us: u64,
    pub end_time_us: u64,
    pub elapsed_us: u64,
    pub cpu_cycles: u64,
    pub instructions: u64,
    pub cache_references: u64,
    pub cache_misses: u64,
    pub ref_cpu_cycles: u64,
    pub disk_bytes_read: u64,
    pub disk_bytes_written: u64,
    pub network_bytes_read: u64,
    pub network_bytes_written: u64,
    pub cpu_id: u32,
    pub pid: u32,
}

pub const NUM_METRIC_FIELDS: usize = 14;

pub const METRIC_FIELD_NAMES: [&str; NUM_METRIC_FIELDS] = [
    "start_time",
    "end_time",
    "elapsed_us",
    "cpu_cycles",
    "instructions",
    "cache_references",
    "cache_misses",
    "ref_cpu_cycles",
    "disk_bytes_read",
    "disk_bytes_written",
    "network_bytes_read",
    "network_bytes_written",
    "cpu_id",
    "pid",
];

/// Compute the deltas for one BEGIN/END pair. Returns `None` when the clock
/// or any counter moved backward (CPU migration); the caller RESETs the key.
#[inline(always)]
pub fn finish_pair(begin: &CounterSnapshot, end: &CounterSnapshot) -> Option<ResourceMetrics> {
    if end.time_us < begin.time_us {
        return None;
    }
    for i in 0..NUM_PERF_COUNTERS {
        if end.perf[i] < begin.perf[i] {
            return None;
        }
    }
    if end.disk_bytes_read < begin.disk_bytes_read
        || end.disk_bytes_written < begin.disk_bytes_written
        || end.network_bytes_read < begin.network_bytes_read
        || end.network_bytes_written < begin.network_bytes_written
    {
        return None;
    }
    Some(ResourceMetrics {
        start_time_us: begin.time_us,
        end_time_us: end.time_us,
        elapsed_us: end.time_us - begin.time_us,
        cpu_cycles: end.perf[0] - begin.perf[0],
        instructions: end.perf[1] - begin.perf[1],
        cache_references: end.perf[2] - begin.perf[2],
        cache_misses: end.perf[3] - begin.perf[3],
        ref_cpu_cycles: end.perf[4] - begin.perf[4],
        disk_bytes_read: end.disk_bytes_read - begin.disk_bytes_read,
        disk_bytes_written: end.disk_bytes_written - begin.disk_bytes_written,
        network_bytes_read: end.network_bytes_read - begin.network_bytes_read,
        network_bytes_written: end.network_bytes_written - begin.network_bytes_written,
        // The record's cpu_id is that of the first END.
        cpu_id: end.cpu_id,
        pid: begin.pid,
    })
}

/// Fold a later BEGIN/END pair into an accumulated metric block: keep the
/// existing start_time and cpu_id, overwrite end_time, sum everything else.
#[inline(always)]
pub fn accumulate(lhs: &mut ResourceMetrics, rhs: &ResourceMetrics) {
    lhs.end_time_us = rhs.end_time_us;
    lhs.elapsed_us = lhs.elapsed_us.saturating_add(rhs.elapsed_us);
    lhs.cpu_cycles = lhs.cpu_cycles.saturating_add(rhs.cpu_cycles);
    lhs.instructions = lhs.instructions.saturating_add(rhs.instructions);
    lhs.cache_references = lhs.cache_references.saturating_add(rhs.cache_references);
    lhs.cache_misses = lhs.cache_misses.saturating_add(rhs.cache_misses);
    lhs.ref_cpu_cycles = lhs.ref_cpu_cycles.saturating_add(rhs.ref_cpu_cycles);
    lhs.disk_bytes_read = lhs.disk_bytes_read.saturating_add(rhs.disk_bytes_read);
    lhs.disk_bytes_written = lhs.disk_bytes_written.saturating_add(rhs.disk_bytes_written);
    lhs.network_bytes_read = lhs.network_bytes_read.saturating_add(rhs.network_bytes_read);
    lhs.network_bytes_written = lhs
        .network_bytes_written
        .saturating_add(rhs.network_bytes_written);
}

/// Wire prefix of every record published on a per-OU result ring. The full
/// record is `RecordHeader ++ <OU>_features ++ ResourceMetrics`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct RecordHeader {
    pub ou_index: u32,
    pub pid: u32,
}

/// Postmaster lifecycle event kinds.
pub mod lifecycle_kind {
    pub const FORK_BACKEND: i32 = 0;
    pub const FORK_BACKGROUND: i32 = 1;
    pub const REAP_BACKEND: i32 = 2;
    pub const REAP_BACKGROUND: i32 = 3;
}

/// Payload of the postmaster lifecycle ring. `socket_fd` is populated only
/// for `FORK_BACKEND`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct LifecycleEvent {
    pub kind: i32,
    pub pid: i32,
    pub socket_fd: i32,
    pub _pad: i32,
}

/// Kernel struct offsets the collector programs need, discovered from BTF
/// by the coordinator at startup and written into the collector's global
/// data before attach. A zero offset means "unknown, skip that reading".
///
/// The task chain feeds the per-task I/O byte counters; the socket chain
/// (task -> files -> fdt -> fd array -> file -> socket -> sk) feeds the
/// per-socket TCP counters compiled in under the `client-socket` feature.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskOffsets {
    pub task_ioac_offset: u32,
    pub ioac_read_bytes_offset: u32,
    pub ioac_write_bytes_offset: u32,
    pub task_files_offset: u32,
    pub files_fdt_offset: u32,
    pub fdt_fd_offset: u32,
    pub file_private_data_offset: u32,
    pub socket_sk_offset: u32,
    pub tcp_bytes_received_offset: u32,
    pub tcp_bytes_sent_offset: u32,
}

impl TaskOffsets {
    pub const fn zeroed() -> Self {
        Self {
            task_ioac_offset: 0,
            ioac_read_bytes_offset: 0,
            ioac_write_bytes_offset: 0,
            task_files_offset: 0,
            files_fdt_offset: 0,
            fdt_fd_offset: 0,
            file_private_data_offset: 0,
            socket_sk_offset: 0,
            tcp_bytes_received_offset: 0,
            tcp_bytes_sent_offset: 0,
        }
    }
}

/// Signature word carried by every counter block so host code can safely
/// downcast the server's generic instrumentation type. Absence of the
/// signature is not an error: not ours, ignore.
pub const COUNTER_BLOCK_MAGIC: u32 = 0x5153_5342;

/// Number of opaque f64 accumulators in a counter block. Counter semantics
/// are OU-specific and assigned by convention.
pub const NUM_QSS_COUNTERS: usize = 10;

// =============================================================================
// MARKER SEMAPHORE TABLE
// =============================================================================
//
// Marker semaphores live in a small shared-memory file mapped by both the
// server and the coordinator. The coordinator increments every slot on
// attach and decrements on detach; the server skips a marker body whenever
// its slot is zero. The header records the attaching coordinator's pid so
// the server can sweep stale counts if the coordinator died without
// detaching.

pub const SEMAPHORE_TABLE_MAGIC: u32 = 0x5053_454d;

/// begin / end / features / flush per operating unit.
pub const NUM_MARKER_EVENTS: usize = 4;
pub const NUM_MARKERS: usize = NUM_OUS * NUM_MARKER_EVENTS;

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MarkerEvent {
    Begin = 0,
    End = 1,
    Features = 2,
    Flush = 3,
}

impl MarkerEvent {
    pub const ALL: [MarkerEvent; NUM_MARKER_EVENTS] = [
        MarkerEvent::Begin,
        MarkerEvent::End,
        MarkerEvent::Features,
        MarkerEvent::Flush,
    ];

    pub const fn suffix(self) -> &'static str {
        match self {
            MarkerEvent::Begin => "begin",
            MarkerEvent::End => "end",
            MarkerEvent::Features => "features",
            MarkerEvent::Flush => "flush",
        }
    }
}

/// Slot of a marker in the semaphore table.
#[inline(always)]
pub const fn marker_slot(ou_index: u32, event: MarkerEvent) -> usize {
    ou_index as usize * NUM_MARKER_EVENTS + event as usize
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct SemaphoreTableHeader {
    pub magic: u32,
    /// Pid of the attached coordinator; zero when detached.
    pub owner_pid: u32,
}

pub const SEMAPHORE_TABLE_BYTES: usize =
    core::mem::size_of::<SemaphoreTableHeader>() + NUM_MARKERS * core::mem::size_of::<u32>();

// =============================================================================
// FEATURE FIELD PRIMITIVES
// =============================================================================

/// Primitive type of one feature field, as declared in the server's OU
/// catalog header. `ListLen` is the length of a list-valued plan field,
/// carried as a 32-bit count.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum FieldKind {
    Bool,
    Int16,
    Int32,
    Int64,
    Float64,
    Ptr,
    ListLen,
}

impl FieldKind {
    /// Width in bytes inside the feature struct. Natural alignment equals
    /// the width for every kind.
    pub const fn width(self) -> usize {
        match self {
            FieldKind::Bool => 1,
            FieldKind::Int16 => 2,
            FieldKind::Int32 | FieldKind::ListLen => 4,
            FieldKind::Int64 | FieldKind::Float64 | FieldKind::Ptr => 8,
        }
    }

    pub fn from_c_type(ty: &str) -> Option<Self> {
        match ty {
            "bool" => Some(FieldKind::Bool),
            "int16" | "int16_t" | "short" => Some(FieldKind::Int16),
            "int32" | "int32_t" | "int" | "Oid" | "uint32" => Some(FieldKind::Int32),
            "int64" | "int64_t" | "long" | "uint64" | "TimestampTz" | "QueryId" => {
                Some(FieldKind::Int64)
            }
            "double" | "float8" | "Cost" => Some(FieldKind::Float64),
            "Pointer" | "Plan*" | "void*" => Some(FieldKind::Ptr),
            "List*" => Some(FieldKind::ListLen),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_layout_is_aligned() {
        assert_eq!(
            size_of::<ResourceMetrics>() % 8,
            0,
            "wire format should be 8-byte aligned"
        );
        assert_eq!(size_of::<ResourceMetrics>(), 12 * 8 + 2 * 4);
        assert_eq!(size_of::<CounterSnapshot>() % 8, 0);
        assert_eq!(size_of::<RecordHeader>(), 8);
        assert_eq!(size_of::<LifecycleEvent>(), 16);
    }

    #[test]
    fn key_roundtrips_negative_ids() {
        for id in [
            7,
            0,
            INVALID_PLAN_NODE_ID,
            REMOTE_RECEIVER_PLAN_NODE_ID,
            INDEPENDENT_PLAN_NODE_ID,
            INDEPENDENT_INSTR_ID_START,
            -4096,
            i32::MAX,
            i32::MIN,
        ] {
            let key = pack_key(OuIndex::HashJoin as u32, id);
            assert_eq!(unpack_key(key), (OuIndex::HashJoin as u32, id));
        }
    }

    #[test]
    fn independent_ids_descend_below_reserved_range() {
        assert_eq!(INDEPENDENT_INSTR_ID_START, -4);
        assert!(INDEPENDENT_INSTR_ID_START < INDEPENDENT_PLAN_NODE_ID);
    }

    #[test]
    fn normalization_corrects_for_multiplexing() {
        // Counter observed for half of the enabled window scales up 2x.
        assert_eq!(normalize_counter(100, 2_000, 1_000), 200);
        // Never-running counter is returned unscaled.
        assert_eq!(normalize_counter(42, 1_000, 0), 42);
        // Large values must not overflow in the intermediate product.
        assert_eq!(
            normalize_counter(u64::MAX / 2, 1_000_000, 1_000_000),
            u64::MAX / 2
        );
    }

    #[test]
    fn finish_pair_rejects_backward_counters() {
        let mut begin = CounterSnapshot::default();
        begin.perf[1] = 500;
        begin.time_us = 100;
        let mut end = begin;
        end.time_us = 150;
        end.perf[1] = 400; // instructions moved backward, e.g. CPU migration
        assert!(finish_pair(&begin, &end).is_none());

        end.perf[1] = 510;
        let metrics = finish_pair(&begin, &end).expect("forward counters");
        assert_eq!(metrics.instructions, 10);
        assert_eq!(metrics.elapsed_us, 50);
    }

    #[test]
    fn accumulate_keeps_first_start_and_cpu() {
        let mut acc = ResourceMetrics {
            start_time_us: 10,
            end_time_us: 20,
            elapsed_us: 10,
            instructions: 100,
            cpu_id: 3,
            ..Default::default()
        };
        let next = ResourceMetrics {
            start_time_us: 30,
            end_time_us: 45,
            elapsed_us: 15,
            instructions: 50,
            cpu_id: 7,
            ..Default::default()
        };
        accumulate(&mut acc, &next);
        assert_eq!(acc.start_time_us, 10);
        assert_eq!(acc.end_time_us, 45);
        assert_eq!(acc.elapsed_us, 25);
        assert_eq!(acc.instructions, 150);
        assert_eq!(acc.cpu_id, 3);
    }

    #[test]
    fn marker_slots_are_dense_and_unique() {
        let mut seen = std::collections::HashSet::new();
        for ou in OuIndex::ALL {
            for event in MarkerEvent::ALL {
                let slot = marker_slot(ou as u32, event);
                assert!(slot < NUM_MARKERS);
                assert!(seen.insert(slot));
            }
        }
        assert_eq!(seen.len(), NUM_MARKERS);
    }

    #[test]
    fn field_kinds_cover_catalog_c_types() {
        assert_eq!(FieldKind::from_c_type("Oid"), Some(FieldKind::Int32));
        assert_eq!(FieldKind::from_c_type("List*"), Some(FieldKind::ListLen));
        assert_eq!(FieldKind::from_c_type("Cost"), Some(FieldKind::Float64));
        assert_eq!(FieldKind::from_c_type("struct foo"), None);
        assert_eq!(FieldKind::Bool.width(), 1);
        assert_eq!(FieldKind::Ptr.width(), 8);
    }

    #[cfg(feature = "user")]
    #[test]
    fn metrics_serialize_with_field_names() {
        let metrics = ResourceMetrics {
            elapsed_us: 5,
            ..Default::default()
        };
        let json = serde_json::to_value(metrics).expect("serialize metrics");
        assert_eq!(json["elapsed_us"], 5);
        assert!(json.get("cpu_id").is_some());
    }
}
