//! Hardware counter plumbing. The collector reads five perf counters
//! with `bpf_perf_event_read_value`; the events themselves are opened
//! here, one per counter kind per online CPU, and their fds are seeded
//! into the matching perf-event-array maps before attach.

use std::mem;
use std::os::fd::{AsFd, AsRawFd, RawFd};

use anyhow::{anyhow, bail, Context, Result};
use aya::maps::Map;
use aya::util::online_cpus;
use aya::Ebpf;
use perf_event_open::config::{Cpu, Opts, Proc};
use perf_event_open::count::Counter;
use perf_event_open::event::hw::Hardware;

use planscout_common::NUM_PERF_COUNTERS;

/// Map names in the collector object, ordered as
/// `planscout_common::PERF_COUNTER_NAMES`.
pub const PERF_MAP_NAMES: [&str; NUM_PERF_COUNTERS] = [
    "PERF_CPU_CYCLES",
    "PERF_INSTRUCTIONS",
    "PERF_CACHE_REFERENCES",
    "PERF_CACHE_MISSES",
    "PERF_REF_CPU_CYCLES",
];

fn hardware_event(index: usize) -> Hardware {
    match index {
        0 => Hardware::CpuCycle,
        1 => Hardware::Instr,
        2 => Hardware::CacheAccess,
        3 => Hardware::CacheMiss,
        _ => Hardware::RefCpuCycle,
    }
}

/// Keeps every opened counter alive for the lifetime of the attachment;
/// closing the fds would invalidate the map entries the kernel reads.
pub struct PerfCounters {
    _counters: Vec<Counter>,
}

/// Open all counters and seed the collector's perf-event arrays.
pub fn seed_perf_arrays(bpf: &mut Ebpf) -> Result<PerfCounters> {
    let cpus = online_cpus().map_err(|(_, err)| anyhow!("online cpus: {err}"))?;
    let mut counters = Vec::with_capacity(NUM_PERF_COUNTERS * cpus.len());

    for (kind, map_name) in PERF_MAP_NAMES.iter().enumerate() {
        let map_fd = perf_array_fd(bpf, map_name)?;
        for &cpu in &cpus {
            let counter = Counter::new(
                hardware_event(kind),
                (Proc::ALL, Cpu(cpu)),
                Opts::default(),
            )
            .with_context(|| format!("open {} on cpu {cpu}", map_name))?;
            counter
                .enable()
                .with_context(|| format!("enable {} on cpu {cpu}", map_name))?;
            bpf_map_update(map_fd, cpu, counter.file().as_raw_fd())
                .with_context(|| format!("seed {} for cpu {cpu}", map_name))?;
            counters.push(counter);
        }
    }

    Ok(PerfCounters {
        _counters: counters,
    })
}

fn perf_array_fd(bpf: &Ebpf, name: &str) -> Result<RawFd> {
    let map = bpf
        .map(name)
        .with_context(|| format!("map {name} not found in collector object"))?;
    match map {
        Map::PerfEventArray(data) => Ok(data.fd().as_fd().as_raw_fd()),
        _ => bail!("map {name} is not a perf event array"),
    }
}

// bpf(BPF_MAP_UPDATE_ELEM) attribute layout for plain per-index updates.
#[repr(C)]
struct MapUpdateAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

const BPF_MAP_UPDATE_ELEM: libc::c_long = 2;

fn bpf_map_update(map_fd: RawFd, cpu: u32, perf_fd: RawFd) -> std::io::Result<()> {
    let key = cpu;
    let value = perf_fd as u32;
    let attr = MapUpdateAttr {
        map_fd: map_fd as u32,
        _pad: 0,
        key: &key as *const u32 as u64,
        value: &value as *const u32 as u64,
        flags: 0, // BPF_ANY
    };
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            BPF_MAP_UPDATE_ELEM,
            &attr as *const MapUpdateAttr,
            mem::size_of::<MapUpdateAttr>(),
        )
    };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_names_cover_every_counter_kind() {
        assert_eq!(PERF_MAP_NAMES.len(), NUM_PERF_COUNTERS);
        let unique: std::collections::HashSet<_> = PERF_MAP_NAMES.iter().collect();
        assert_eq!(unique.len(), NUM_PERF_COUNTERS);
    }

    #[test]
    fn update_attr_matches_kernel_layout() {
        assert_eq!(mem::size_of::<MapUpdateAttr>(), 32);
        assert_eq!(mem::align_of::<MapUpdateAttr>(), 8);
    }
}
