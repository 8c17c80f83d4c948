//! Shared machinery behind the generated per-OU programs: marker argument
//! readers, the drop-counter array, and the `ou_programs!` macro that
//! stamps out one set of maps, entry points and a result ring per
//! operating unit over the shared protocol core.

use aya_ebpf::helpers::bpf_probe_read_user;
use aya_ebpf::macros::map;
use aya_ebpf::maps::Array;
use aya_ebpf::programs::ProbeContext;

use planscout_common::protocol::{DropReason, NUM_DROP_REASONS};
use planscout_common::{MARKER_MAX_ARGS, NUM_OUS};

/// One counter per (OU, drop reason), drained by the coordinator.
#[map]
static COLLECTOR_DROPS: Array<u64> = Array::with_max_entries((NUM_OUS * NUM_DROP_REASONS) as u32, 0);

#[inline(always)]
pub fn record_drop(ou_index: u32, reason: DropReason) {
    let idx = ou_index * NUM_DROP_REASONS as u32 + reason as u32;
    if let Some(ptr) = COLLECTOR_DROPS.get_ptr_mut(idx) {
        unsafe { *ptr += 1 };
    }
}

/// Markers hand the probe a pointer to the promoted argument block. The
/// begin/end/flush markers carry a single slot: the plan node id.
#[inline(always)]
pub fn marker_arg0(ctx: &ProbeContext) -> Option<i32> {
    let args: *const u64 = ctx.arg(0)?;
    let raw = unsafe { bpf_probe_read_user(args) }.ok()?;
    Some(raw as u32 as i32)
}

/// The features markers always back their payload with a full 12-slot
/// array, so the whole block can be read in one probe.
#[inline(always)]
pub fn marker_args(ctx: &ProbeContext) -> Option<[u64; MARKER_MAX_ARGS]> {
    let args: *const u64 = ctx.arg(0)?;
    unsafe { bpf_probe_read_user(args as *const [u64; MARKER_MAX_ARGS]) }.ok()
}

/// Stamp out the collector for one operating unit: bounded running /
/// complete / features maps, a per-CPU output scratch slot, the result
/// ring, and the four uprobe entry points driving the shared state
/// machine.
macro_rules! ou_programs {
    ($ou:ident, $index:literal, $features:ident) => {
        ::paste::paste! {
            #[aya_ebpf::macros::map]
            static [<RUNNING_ $ou:upper>]: aya_ebpf::maps::HashMap<u64, planscout_common::CounterSnapshot> =
                aya_ebpf::maps::HashMap::with_max_entries(planscout_common::STATE_MAP_CAPACITY, 0);

            #[aya_ebpf::macros::map]
            static [<COMPLETE_ $ou:upper>]: aya_ebpf::maps::HashMap<u64, planscout_common::ResourceMetrics> =
                aya_ebpf::maps::HashMap::with_max_entries(planscout_common::STATE_MAP_CAPACITY, 0);

            #[aya_ebpf::macros::map]
            static [<FEATURES_ $ou:upper>]: aya_ebpf::maps::HashMap<i32, $features> =
                aya_ebpf::maps::HashMap::with_max_entries(planscout_common::STATE_MAP_CAPACITY, 0);

            #[aya_ebpf::macros::map]
            static [<SCRATCH_ $ou:upper>]: aya_ebpf::maps::PerCpuArray<[<$features Record>]> =
                aya_ebpf::maps::PerCpuArray::with_max_entries(1, 0);

            #[aya_ebpf::macros::map]
            static [<RESULTS_ $ou:upper>]: aya_ebpf::maps::RingBuf =
                aya_ebpf::maps::RingBuf::with_byte_size(planscout_common::RESULT_RING_BYTES, 0);

            #[repr(C)]
            #[derive(Copy, Clone)]
            #[allow(non_camel_case_types)]
            pub struct [<$features Record>] {
                header: planscout_common::RecordHeader,
                features: $features,
                metrics: planscout_common::ResourceMetrics,
            }

            #[allow(non_camel_case_types)]
            struct [<$features Tables>];

            impl planscout_common::protocol::StateTables for [<$features Tables>] {
                type Features = $features;

                #[inline(always)]
                fn running_get(&self, key: u64) -> Option<planscout_common::CounterSnapshot> {
                    [<RUNNING_ $ou:upper>].get_ptr(&key).map(|ptr| unsafe { *ptr })
                }
                #[inline(always)]
                fn running_insert(&mut self, key: u64, snap: &planscout_common::CounterSnapshot) -> bool {
                    [<RUNNING_ $ou:upper>].insert(&key, snap, 0).is_ok()
                }
                #[inline(always)]
                fn running_remove(&mut self, key: u64) {
                    let _ = [<RUNNING_ $ou:upper>].remove(&key);
                }

                #[inline(always)]
                fn complete_get(&self, key: u64) -> Option<planscout_common::ResourceMetrics> {
                    [<COMPLETE_ $ou:upper>].get_ptr(&key).map(|ptr| unsafe { *ptr })
                }
                #[inline(always)]
                fn complete_insert(&mut self, key: u64, metrics: &planscout_common::ResourceMetrics) -> bool {
                    [<COMPLETE_ $ou:upper>].insert(&key, metrics, 0).is_ok()
                }
                #[inline(always)]
                fn complete_remove(&mut self, key: u64) {
                    let _ = [<COMPLETE_ $ou:upper>].remove(&key);
                }

                #[inline(always)]
                fn features_get(&self, plan_node_id: i32) -> Option<$features> {
                    [<FEATURES_ $ou:upper>].get_ptr(&plan_node_id).map(|ptr| unsafe { *ptr })
                }
                #[inline(always)]
                fn features_insert(&mut self, plan_node_id: i32, features: &$features) -> bool {
                    [<FEATURES_ $ou:upper>].insert(&plan_node_id, features, 0).is_ok()
                }
                #[inline(always)]
                fn features_remove(&mut self, plan_node_id: i32) {
                    let _ = [<FEATURES_ $ou:upper>].remove(&plan_node_id);
                }
            }

            #[aya_ebpf::macros::uprobe]
            pub fn [<$ou _begin>](ctx: aya_ebpf::programs::ProbeContext) -> u32 {
                let Some(plan_node_id) = $crate::ou::marker_arg0(&ctx) else {
                    $crate::ou::record_drop($index, planscout_common::protocol::DropReason::CounterRead);
                    return 1;
                };
                let key = planscout_common::pack_key($index, plan_node_id);
                match planscout_common::protocol::on_begin(
                    &mut [<$features Tables>],
                    &mut $crate::counters::BpfCounters,
                    key,
                ) {
                    Ok(()) => 0,
                    Err(reason) => {
                        $crate::ou::record_drop($index, reason);
                        1
                    }
                }
            }

            #[aya_ebpf::macros::uprobe]
            pub fn [<$ou _end>](ctx: aya_ebpf::programs::ProbeContext) -> u32 {
                let Some(plan_node_id) = $crate::ou::marker_arg0(&ctx) else {
                    $crate::ou::record_drop($index, planscout_common::protocol::DropReason::CounterRead);
                    return 1;
                };
                let key = planscout_common::pack_key($index, plan_node_id);
                match planscout_common::protocol::on_end(
                    &mut [<$features Tables>],
                    &mut $crate::counters::BpfCounters,
                    key,
                ) {
                    Ok(()) => 0,
                    Err(reason) => {
                        $crate::ou::record_drop($index, reason);
                        1
                    }
                }
            }

            #[aya_ebpf::macros::uprobe]
            pub fn [<$ou _features>](ctx: aya_ebpf::programs::ProbeContext) -> u32 {
                let Some(args) = $crate::ou::marker_args(&ctx) else {
                    $crate::ou::record_drop($index, planscout_common::protocol::DropReason::CounterRead);
                    return 1;
                };
                let plan_node_id = args[0] as u32 as i32;
                let features = $features::from_args(&args);
                match planscout_common::protocol::on_features(
                    &mut [<$features Tables>],
                    plan_node_id,
                    &features,
                ) {
                    Ok(()) => 0,
                    Err(reason) => {
                        $crate::ou::record_drop($index, reason);
                        1
                    }
                }
            }

            #[aya_ebpf::macros::uprobe]
            pub fn [<$ou _flush>](ctx: aya_ebpf::programs::ProbeContext) -> u32 {
                let Some(plan_node_id) = $crate::ou::marker_arg0(&ctx) else {
                    $crate::ou::record_drop($index, planscout_common::protocol::DropReason::CounterRead);
                    return 1;
                };
                let key = planscout_common::pack_key($index, plan_node_id);
                let result = planscout_common::protocol::on_flush(
                    &mut [<$features Tables>],
                    key,
                    |header, features, metrics| {
                        let Some(slot) = [<SCRATCH_ $ou:upper>].get_ptr_mut(0) else {
                            return false;
                        };
                        unsafe {
                            (*slot).header = header;
                            (*slot).features = *features;
                            (*slot).metrics = *metrics;
                            [<RESULTS_ $ou:upper>].output(&*slot, 0).is_ok()
                        }
                    },
                );
                match result {
                    Ok(()) => 0,
                    Err(reason) => {
                        $crate::ou::record_drop($index, reason);
                        1
                    }
                }
            }
        }
    };
}

pub(crate) use ou_programs;
