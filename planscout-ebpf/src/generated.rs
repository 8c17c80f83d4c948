//! Per-OU collector programs. GENERATED from the operating-unit catalog;
//! regenerate with `cargo xtask codegen` after editing the catalog header.
//! Manual edits here are overwritten.
//!
//! END accumulation: keep start_time and cpu_id, overwrite end_time,
//! sum
//! elapsed_us, cpu_cycles, instructions, cache_references,
//! cache_misses, ref_cpu_cycles, disk_bytes_read, disk_bytes_written,
//! network_bytes_read, network_bytes_written.

use planscout_common::ResourceMetrics;

use crate::ou::ou_programs;

const _: () = assert!(core::mem::offset_of!(ResourceMetrics, start_time_us) == 0);

// ---- seq_scan (index 0) ----

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct seq_scan_features {
    pub plan_node_id: i32,
    pub _pad0: [u8; 4],
    pub query_id: i64,
    pub plan_ptr: u64,
    pub left_child_plan_node_id: i32,
    pub right_child_plan_node_id: i32,
    pub statement_start_ts: i64,
    pub relid: i32,
    pub _pad1: [u8; 4],
    pub plan_rows: f64,
    pub plan_width: i32,
    pub _pad2: [u8; 4],
}

const _: () = assert!(core::mem::offset_of!(seq_scan_features, plan_node_id) == 0);

impl seq_scan_features {
    #[inline(always)]
    fn from_args(args: &[u64; planscout_common::MARKER_MAX_ARGS]) -> Self {
        Self {
            plan_node_id: args[0] as u32 as i32,
            _pad0: [0; 4],
            query_id: args[1] as i64,
            plan_ptr: args[2],
            left_child_plan_node_id: args[3] as u32 as i32,
            right_child_plan_node_id: args[4] as u32 as i32,
            statement_start_ts: args[5] as i64,
            relid: args[6] as u32 as i32,
            _pad1: [0; 4],
            plan_rows: f64::from_bits(args[7]),
            plan_width: args[8] as u32 as i32,
            _pad2: [0; 4],
        }
    }
}

ou_programs!(seq_scan, 0, seq_scan_features);

// ---- index_scan (index 1) ----

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct index_scan_features {
    pub plan_node_id: i32,
    pub _pad0: [u8; 4],
    pub query_id: i64,
    pub plan_ptr: u64,
    pub left_child_plan_node_id: i32,
    pub right_child_plan_node_id: i32,
    pub statement_start_ts: i64,
    pub relid: i32,
    pub indexid: i32,
    pub plan_rows: f64,
}

const _: () = assert!(core::mem::offset_of!(index_scan_features, plan_node_id) == 0);

impl index_scan_features {
    #[inline(always)]
    fn from_args(args: &[u64; planscout_common::MARKER_MAX_ARGS]) -> Self {
        Self {
            plan_node_id: args[0] as u32 as i32,
            _pad0: [0; 4],
            query_id: args[1] as i64,
            plan_ptr: args[2],
            left_child_plan_node_id: args[3] as u32 as i32,
            right_child_plan_node_id: args[4] as u32 as i32,
            statement_start_ts: args[5] as i64,
            relid: args[6] as u32 as i32,
            indexid: args[7] as u32 as i32,
            plan_rows: f64::from_bits(args[8]),
        }
    }
}

ou_programs!(index_scan, 1, index_scan_features);

// ---- index_only_scan (index 2) ----

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct index_only_scan_features {
    pub plan_node_id: i32,
    pub _pad0: [u8; 4],
    pub query_id: i64,
    pub plan_ptr: u64,
    pub left_child_plan_node_id: i32,
    pub right_child_plan_node_id: i32,
    pub statement_start_ts: i64,
    pub relid: i32,
    pub indexid: i32,
}

const _: () = assert!(core::mem::offset_of!(index_only_scan_features, plan_node_id) == 0);

impl index_only_scan_features {
    #[inline(always)]
    fn from_args(args: &[u64; planscout_common::MARKER_MAX_ARGS]) -> Self {
        Self {
            plan_node_id: args[0] as u32 as i32,
            _pad0: [0; 4],
            query_id: args[1] as i64,
            plan_ptr: args[2],
            left_child_plan_node_id: args[3] as u32 as i32,
            right_child_plan_node_id: args[4] as u32 as i32,
            statement_start_ts: args[5] as i64,
            relid: args[6] as u32 as i32,
            indexid: args[7] as u32 as i32,
        }
    }
}

ou_programs!(index_only_scan, 2, index_only_scan_features);

// ---- bitmap_index_scan (index 3) ----

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct bitmap_index_scan_features {
    pub plan_node_id: i32,
    pub _pad0: [u8; 4],
    pub query_id: i64,
    pub plan_ptr: u64,
    pub left_child_plan_node_id: i32,
    pub right_child_plan_node_id: i32,
    pub statement_start_ts: i64,
    pub indexid: i32,
    pub _pad1: [u8; 4],
}

const _: () = assert!(core::mem::offset_of!(bitmap_index_scan_features, plan_node_id) == 0);

impl bitmap_index_scan_features {
    #[inline(always)]
    fn from_args(args: &[u64; planscout_common::MARKER_MAX_ARGS]) -> Self {
        Self {
            plan_node_id: args[0] as u32 as i32,
            _pad0: [0; 4],
            query_id: args[1] as i64,
            plan_ptr: args[2],
            left_child_plan_node_id: args[3] as u32 as i32,
            right_child_plan_node_id: args[4] as u32 as i32,
            statement_start_ts: args[5] as i64,
            indexid: args[6] as u32 as i32,
            _pad1: [0; 4],
        }
    }
}

ou_programs!(bitmap_index_scan, 3, bitmap_index_scan_features);

// ---- bitmap_heap_scan (index 4) ----

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct bitmap_heap_scan_features {
    pub plan_node_id: i32,
    pub _pad0: [u8; 4],
    pub query_id: i64,
    pub plan_ptr: u64,
    pub left_child_plan_node_id: i32,
    pub right_child_plan_node_id: i32,
    pub statement_start_ts: i64,
    pub relid: i32,
    pub _pad1: [u8; 4],
}

const _: () = assert!(core::mem::offset_of!(bitmap_heap_scan_features, plan_node_id) == 0);

impl bitmap_heap_scan_features {
    #[inline(always)]
    fn from_args(args: &[u64; planscout_common::MARKER_MAX_ARGS]) -> Self {
        Self {
            plan_node_id: args[0] as u32 as i32,
            _pad0: [0; 4],
            query_id: args[1] as i64,
            plan_ptr: args[2],
            left_child_plan_node_id: args[3] as u32 as i32,
            right_child_plan_node_id: args[4] as u32 as i32,
            statement_start_ts: args[5] as i64,
            relid: args[6] as u32 as i32,
            _pad1: [0; 4],
        }
    }
}

ou_programs!(bitmap_heap_scan, 4, bitmap_heap_scan_features);

// ---- nest_loop (index 5) ----

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct nest_loop_features {
    pub plan_node_id: i32,
    pub _pad0: [u8; 4],
    pub query_id: i64,
    pub plan_ptr: u64,
    pub left_child_plan_node_id: i32,
    pub right_child_plan_node_id: i32,
    pub statement_start_ts: i64,
    pub join_type: i32,
    pub _pad1: [u8; 4],
}

const _: () = assert!(core::mem::offset_of!(nest_loop_features, plan_node_id) == 0);

impl nest_loop_features {
    #[inline(always)]
    fn from_args(args: &[u64; planscout_common::MARKER_MAX_ARGS]) -> Self {
        Self {
            plan_node_id: args[0] as u32 as i32,
            _pad0: [0; 4],
            query_id: args[1] as i64,
            plan_ptr: args[2],
            left_child_plan_node_id: args[3] as u32 as i32,
            right_child_plan_node_id: args[4] as u32 as i32,
            statement_start_ts: args[5] as i64,
            join_type: args[6] as u32 as i32,
            _pad1: [0; 4],
        }
    }
}

ou_programs!(nest_loop, 5, nest_loop_features);

// ---- hash_join (index 6) ----

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct hash_join_features {
    pub plan_node_id: i32,
    pub _pad0: [u8; 4],
    pub query_id: i64,
    pub plan_ptr: u64,
    pub left_child_plan_node_id: i32,
    pub right_child_plan_node_id: i32,
    pub statement_start_ts: i64,
    pub join_type: i32,
    pub hash_clauses_len: u32,
}

const _: () = assert!(core::mem::offset_of!(hash_join_features, plan_node_id) == 0);

impl hash_join_features {
    #[inline(always)]
    fn from_args(args: &[u64; planscout_common::MARKER_MAX_ARGS]) -> Self {
        Self {
            plan_node_id: args[0] as u32 as i32,
            _pad0: [0; 4],
            query_id: args[1] as i64,
            plan_ptr: args[2],
            left_child_plan_node_id: args[3] as u32 as i32,
            right_child_plan_node_id: args[4] as u32 as i32,
            statement_start_ts: args[5] as i64,
            join_type: args[6] as u32 as i32,
            hash_clauses_len: args[7] as u32,
        }
    }
}

ou_programs!(hash_join, 6, hash_join_features);

// ---- hash (index 7) ----

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct hash_features {
    pub plan_node_id: i32,
    pub _pad0: [u8; 4],
    pub query_id: i64,
    pub plan_ptr: u64,
    pub left_child_plan_node_id: i32,
    pub right_child_plan_node_id: i32,
    pub statement_start_ts: i64,
    pub skew_optimized: u8,
    pub _pad1: [u8; 7],
}

const _: () = assert!(core::mem::offset_of!(hash_features, plan_node_id) == 0);

impl hash_features {
    #[inline(always)]
    fn from_args(args: &[u64; planscout_common::MARKER_MAX_ARGS]) -> Self {
        Self {
            plan_node_id: args[0] as u32 as i32,
            _pad0: [0; 4],
            query_id: args[1] as i64,
            plan_ptr: args[2],
            left_child_plan_node_id: args[3] as u32 as i32,
            right_child_plan_node_id: args[4] as u32 as i32,
            statement_start_ts: args[5] as i64,
            skew_optimized: (args[6] != 0) as u8,
            _pad1: [0; 7],
        }
    }
}

ou_programs!(hash, 7, hash_features);

// ---- agg (index 8) ----

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct agg_features {
    pub plan_node_id: i32,
    pub _pad0: [u8; 4],
    pub query_id: i64,
    pub plan_ptr: u64,
    pub left_child_plan_node_id: i32,
    pub right_child_plan_node_id: i32,
    pub statement_start_ts: i64,
    pub strategy: i32,
    pub num_group_cols: i16,
    pub _pad1: [u8; 2],
}

const _: () = assert!(core::mem::offset_of!(agg_features, plan_node_id) == 0);

impl agg_features {
    #[inline(always)]
    fn from_args(args: &[u64; planscout_common::MARKER_MAX_ARGS]) -> Self {
        Self {
            plan_node_id: args[0] as u32 as i32,
            _pad0: [0; 4],
            query_id: args[1] as i64,
            plan_ptr: args[2],
            left_child_plan_node_id: args[3] as u32 as i32,
            right_child_plan_node_id: args[4] as u32 as i32,
            statement_start_ts: args[5] as i64,
            strategy: args[6] as u32 as i32,
            num_group_cols: args[7] as u16 as i16,
            _pad1: [0; 2],
        }
    }
}

ou_programs!(agg, 8, agg_features);

// ---- sort (index 9) ----

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct sort_features {
    pub plan_node_id: i32,
    pub _pad0: [u8; 4],
    pub query_id: i64,
    pub plan_ptr: u64,
    pub left_child_plan_node_id: i32,
    pub right_child_plan_node_id: i32,
    pub statement_start_ts: i64,
    pub num_sort_keys: i16,
    pub bounded: u8,
    pub _pad1: [u8; 5],
}

const _: () = assert!(core::mem::offset_of!(sort_features, plan_node_id) == 0);

impl sort_features {
    #[inline(always)]
    fn from_args(args: &[u64; planscout_common::MARKER_MAX_ARGS]) -> Self {
        Self {
            plan_node_id: args[0] as u32 as i32,
            _pad0: [0; 4],
            query_id: args[1] as i64,
            plan_ptr: args[2],
            left_child_plan_node_id: args[3] as u32 as i32,
            right_child_plan_node_id: args[4] as u32 as i32,
            statement_start_ts: args[5] as i64,
            num_sort_keys: args[6] as u16 as i16,
            bounded: (args[7] != 0) as u8,
            _pad1: [0; 5],
        }
    }
}

ou_programs!(sort, 9, sort_features);

// ---- modify_table_insert (index 10) ----

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct modify_table_insert_features {
    pub plan_node_id: i32,
    pub _pad0: [u8; 4],
    pub query_id: i64,
    pub plan_ptr: u64,
    pub left_child_plan_node_id: i32,
    pub right_child_plan_node_id: i32,
    pub statement_start_ts: i64,
    pub relid: i32,
    pub cmd_type: i32,
}

const _: () = assert!(core::mem::offset_of!(modify_table_insert_features, plan_node_id) == 0);

impl modify_table_insert_features {
    #[inline(always)]
    fn from_args(args: &[u64; planscout_common::MARKER_MAX_ARGS]) -> Self {
        Self {
            plan_node_id: args[0] as u32 as i32,
            _pad0: [0; 4],
            query_id: args[1] as i64,
            plan_ptr: args[2],
            left_child_plan_node_id: args[3] as u32 as i32,
            right_child_plan_node_id: args[4] as u32 as i32,
            statement_start_ts: args[5] as i64,
            relid: args[6] as u32 as i32,
            cmd_type: args[7] as u32 as i32,
        }
    }
}

ou_programs!(modify_table_insert, 10, modify_table_insert_features);

// ---- lock_rows (index 11) ----

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct lock_rows_features {
    pub plan_node_id: i32,
    pub _pad0: [u8; 4],
    pub query_id: i64,
    pub plan_ptr: u64,
    pub left_child_plan_node_id: i32,
    pub right_child_plan_node_id: i32,
    pub statement_start_ts: i64,
    pub wait_policy: i32,
    pub _pad1: [u8; 4],
}

const _: () = assert!(core::mem::offset_of!(lock_rows_features, plan_node_id) == 0);

impl lock_rows_features {
    #[inline(always)]
    fn from_args(args: &[u64; planscout_common::MARKER_MAX_ARGS]) -> Self {
        Self {
            plan_node_id: args[0] as u32 as i32,
            _pad0: [0; 4],
            query_id: args[1] as i64,
            plan_ptr: args[2],
            left_child_plan_node_id: args[3] as u32 as i32,
            right_child_plan_node_id: args[4] as u32 as i32,
            statement_start_ts: args[5] as i64,
            wait_policy: args[6] as u32 as i32,
            _pad1: [0; 4],
        }
    }
}

ou_programs!(lock_rows, 11, lock_rows_features);

// ---- sub_plan (index 12) ----

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct sub_plan_features {
    pub plan_node_id: i32,
    pub _pad0: [u8; 4],
    pub query_id: i64,
    pub plan_ptr: u64,
    pub left_child_plan_node_id: i32,
    pub right_child_plan_node_id: i32,
    pub statement_start_ts: i64,
    pub sub_plan_id: i32,
    pub _pad1: [u8; 4],
}

const _: () = assert!(core::mem::offset_of!(sub_plan_features, plan_node_id) == 0);

impl sub_plan_features {
    #[inline(always)]
    fn from_args(args: &[u64; planscout_common::MARKER_MAX_ARGS]) -> Self {
        Self {
            plan_node_id: args[0] as u32 as i32,
            _pad0: [0; 4],
            query_id: args[1] as i64,
            plan_ptr: args[2],
            left_child_plan_node_id: args[3] as u32 as i32,
            right_child_plan_node_id: args[4] as u32 as i32,
            statement_start_ts: args[5] as i64,
            sub_plan_id: args[6] as u32 as i32,
            _pad1: [0; 4],
        }
    }
}

ou_programs!(sub_plan, 12, sub_plan_features);

// ---- remote_receiver (index 13) ----

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct remote_receiver_features {
    pub plan_node_id: i32,
    pub _pad0: [u8; 4],
    pub query_id: i64,
    pub plan_ptr: u64,
    pub left_child_plan_node_id: i32,
    pub right_child_plan_node_id: i32,
    pub statement_start_ts: i64,
    pub sender_pid: i32,
    pub _pad1: [u8; 4],
}

const _: () = assert!(core::mem::offset_of!(remote_receiver_features, plan_node_id) == 0);

impl remote_receiver_features {
    #[inline(always)]
    fn from_args(args: &[u64; planscout_common::MARKER_MAX_ARGS]) -> Self {
        Self {
            plan_node_id: args[0] as u32 as i32,
            _pad0: [0; 4],
            query_id: args[1] as i64,
            plan_ptr: args[2],
            left_child_plan_node_id: args[3] as u32 as i32,
            right_child_plan_node_id: args[4] as u32 as i32,
            statement_start_ts: args[5] as i64,
            sender_pid: args[6] as u32 as i32,
            _pad1: [0; 4],
        }
    }
}

ou_programs!(remote_receiver, 13, remote_receiver_features);

// ---- postmaster lifecycle probes ----

#[aya_ebpf::macros::map]
static POSTMASTER_LIFECYCLE: aya_ebpf::maps::RingBuf =
    aya_ebpf::maps::RingBuf::with_byte_size(planscout_common::LIFECYCLE_RING_BYTES, 0);

#[inline(always)]
fn emit_lifecycle(ctx: &aya_ebpf::programs::ProbeContext, kind: i32, with_socket: bool) -> u32 {
    let Some(pid): Option<u64> = ctx.arg(0) else {
        return 1;
    };
    let socket_fd = if with_socket {
        ctx.arg::<u64>(1).map(|fd| fd as u32 as i32).unwrap_or(-1)
    } else {
        -1
    };
    let event = planscout_common::LifecycleEvent {
        kind,
        pid: pid as u32 as i32,
        socket_fd,
        _pad: 0,
    };
    aya_log_ebpf::debug!(ctx, "postmaster lifecycle kind {} pid {}", kind, event.pid);
    match POSTMASTER_LIFECYCLE.output(&event, 0) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

#[aya_ebpf::macros::uprobe]
pub fn postmaster_fork_backend(ctx: aya_ebpf::programs::ProbeContext) -> u32 {
    emit_lifecycle(&ctx, planscout_common::lifecycle_kind::FORK_BACKEND, true)
}

#[aya_ebpf::macros::uprobe]
pub fn postmaster_fork_background(ctx: aya_ebpf::programs::ProbeContext) -> u32 {
    emit_lifecycle(&ctx, planscout_common::lifecycle_kind::FORK_BACKGROUND, false)
}

#[aya_ebpf::macros::uprobe]
pub fn postmaster_reap_backend(ctx: aya_ebpf::programs::ProbeContext) -> u32 {
    emit_lifecycle(&ctx, planscout_common::lifecycle_kind::REAP_BACKEND, false)
}

#[aya_ebpf::macros::uprobe]
pub fn postmaster_reap_background(ctx: aya_ebpf::programs::ProbeContext) -> u32 {
    emit_lifecycle(&ctx, planscout_common::lifecycle_kind::REAP_BACKGROUND, false)
}
