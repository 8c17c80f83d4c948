//! Counter sampling in kernel context: the five hardware perf counters
//! (normalized for multiplexing), per-task I/O byte accounting, and the
//! optional per-socket TCP counters. One snapshot is taken at BEGIN and
//! one at END; the shared protocol turns the two into deltas.

use aya_ebpf::bindings::bpf_perf_event_value;
use aya_ebpf::helpers::{
    bpf_get_current_pid_tgid, bpf_get_current_task, bpf_ktime_get_ns, bpf_probe_read,
};
use aya_ebpf::macros::map;
use aya_ebpf::maps::PerfEventArray;

use planscout_common::protocol::CounterSource;
use planscout_common::{normalize_counter, CounterSnapshot, TaskOffsets, NUM_PERF_COUNTERS};

// One perf-event array per counter kind; the coordinator opens one event
// per CPU and seeds the fds before attach. Max entries are fixed up to the
// online CPU count at load time.
#[map]
static PERF_CPU_CYCLES: PerfEventArray<u32> = PerfEventArray::new(0);

#[map]
static PERF_INSTRUCTIONS: PerfEventArray<u32> = PerfEventArray::new(0);

#[map]
static PERF_CACHE_REFERENCES: PerfEventArray<u32> = PerfEventArray::new(0);

#[map]
static PERF_CACHE_MISSES: PerfEventArray<u32> = PerfEventArray::new(0);

#[map]
static PERF_REF_CPU_CYCLES: PerfEventArray<u32> = PerfEventArray::new(0);

/// Client socket fd per backend pid, learned from fork-backend lifecycle
/// events. Only consulted when the socket counters are compiled in.
#[cfg(feature = "client-socket")]
#[map]
static CLIENT_SOCKET_FDS: aya_ebpf::maps::HashMap<u32, i32> =
    aya_ebpf::maps::HashMap::with_max_entries(4096, 0);

#[no_mangle]
static mut TASK_OFFSETS: TaskOffsets = TaskOffsets::zeroed();

const BPF_F_CURRENT_CPU: u64 = 0xffff_ffff;

#[inline(always)]
fn load_offsets() -> TaskOffsets {
    unsafe { core::ptr::read_volatile(&raw const TASK_OFFSETS) }
}

/// Monotonic microseconds: nanosecond clock shifted right by 10. The
/// 2.4% skew against a true division is accepted throughout the pipeline.
#[inline(always)]
pub fn clock_us() -> u64 {
    (unsafe { bpf_ktime_get_ns() }) >> 10
}

#[inline(always)]
fn read_perf<T>(map: &PerfEventArray<T>) -> Option<u64> {
    let mut value = bpf_perf_event_value {
        counter: 0,
        enabled: 0,
        running: 0,
    };
    let ret = unsafe {
        aya_ebpf::helpers::gen::bpf_perf_event_read_value(
            map as *const _ as *mut core::ffi::c_void,
            BPF_F_CURRENT_CPU,
            &mut value,
            core::mem::size_of::<bpf_perf_event_value>() as u32,
        )
    };
    if ret != 0 {
        return None;
    }
    Some(normalize_counter(value.counter, value.enabled, value.running))
}

#[inline(always)]
fn read_field<T: Copy>(base: *const u8, offset: u32) -> Option<T> {
    if base.is_null() {
        return None;
    }
    let ptr = unsafe { base.add(offset as usize) as *const T };
    unsafe { bpf_probe_read(ptr).ok() }
}

#[cfg(feature = "client-socket")]
#[inline(always)]
fn read_ptr(base: *const u8, offset: u32) -> Option<*const u8> {
    let addr: usize = read_field(base, offset)?;
    if addr == 0 {
        None
    } else {
        Some(addr as *const u8)
    }
}

/// Process-wide read/write bytes from the task's I/O accounting.
#[inline(always)]
fn task_io_bytes(task: *const u8, offsets: &TaskOffsets) -> (u64, u64) {
    if offsets.task_ioac_offset == 0 {
        return (0, 0);
    }
    let read = read_field::<u64>(
        task,
        offsets.task_ioac_offset + offsets.ioac_read_bytes_offset,
    )
    .unwrap_or(0);
    let written = read_field::<u64>(
        task,
        offsets.task_ioac_offset + offsets.ioac_write_bytes_offset,
    )
    .unwrap_or(0);
    (read, written)
}

/// Per-socket TCP counters for the backend's client socket, reached
/// through task -> files -> fdt -> fd[fd] -> file -> socket -> sk.
#[cfg(feature = "client-socket")]
#[inline(always)]
fn socket_bytes(task: *const u8, pid: u32, offsets: &TaskOffsets) -> (u64, u64) {
    if offsets.task_files_offset == 0 {
        return (0, 0);
    }
    let fd = match unsafe { CLIENT_SOCKET_FDS.get(&pid) } {
        Some(fd) if *fd >= 0 => *fd as u32,
        _ => return (0, 0),
    };
    let chain = (|| -> Option<(u64, u64)> {
        let files = read_ptr(task, offsets.task_files_offset)?;
        let fdt = read_ptr(files, offsets.files_fdt_offset)?;
        let fd_array = read_ptr(fdt, offsets.fdt_fd_offset)?;
        let file = read_ptr(fd_array, fd.checked_mul(8)?)?;
        let socket = read_ptr(file, offsets.file_private_data_offset)?;
        let sk = read_ptr(socket, offsets.socket_sk_offset)?;
        let received: u64 = read_field(sk, offsets.tcp_bytes_received_offset)?;
        let sent: u64 = read_field(sk, offsets.tcp_bytes_sent_offset)?;
        Some((received, sent))
    })();
    chain.unwrap_or((0, 0))
}

#[cfg(not(feature = "client-socket"))]
#[inline(always)]
fn socket_bytes(_task: *const u8, _pid: u32, _offsets: &TaskOffsets) -> (u64, u64) {
    (0, 0)
}

/// The collector's counter source. A failed perf read surfaces as `None`
/// and the caller RESETs the key; the byte counters degrade to zero
/// instead, so a kernel without the offsets still produces records.
pub struct BpfCounters;

impl CounterSource for BpfCounters {
    #[inline(always)]
    fn snapshot(&mut self) -> Option<CounterSnapshot> {
        let mut perf = [0u64; NUM_PERF_COUNTERS];
        perf[0] = read_perf(&PERF_CPU_CYCLES)?;
        perf[1] = read_perf(&PERF_INSTRUCTIONS)?;
        perf[2] = read_perf(&PERF_CACHE_REFERENCES)?;
        perf[3] = read_perf(&PERF_CACHE_MISSES)?;
        perf[4] = read_perf(&PERF_REF_CPU_CYCLES)?;

        let pid = (bpf_get_current_pid_tgid() >> 32) as u32;
        let offsets = load_offsets();
        let task = unsafe { bpf_get_current_task() } as *const u8;
        let (disk_bytes_read, disk_bytes_written) = task_io_bytes(task, &offsets);
        let (network_bytes_read, network_bytes_written) = socket_bytes(task, pid, &offsets);

        Some(CounterSnapshot {
            perf,
            disk_bytes_read,
            disk_bytes_written,
            network_bytes_read,
            network_bytes_written,
            time_us: clock_us(),
            cpu_id: unsafe { aya_ebpf::helpers::gen::bpf_get_smp_processor_id() },
            pid,
        })
    }
}
