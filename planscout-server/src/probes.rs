//! Tracepoint fabric: static emission points the kernel collector hooks.
//!
//! Every marker compiles down to one relaxed load when nothing is attached.
//! When the coordinator attaches, it bumps the per-marker semaphores in the
//! shared table and plants uprobes on the exported anchor symbols below;
//! the marker body then materializes its payload (every argument promoted
//! to pointer width, at most [`MARKER_MAX_ARGS`] slots) and calls through
//! the anchor, where the probe reads the argument block.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use anyhow::{bail, Context};
use memmap2::MmapMut;
use once_cell::sync::Lazy;
use rand::Rng;

use planscout_common::{
    marker_slot, MarkerEvent, OuIndex, SemaphoreTableHeader, MARKER_MAX_ARGS, NUM_MARKERS,
    SEMAPHORE_TABLE_BYTES, SEMAPHORE_TABLE_MAGIC,
};

const HEADER_BYTES: usize = std::mem::size_of::<SemaphoreTableHeader>();

/// Marker semaphores shared with the coordinator through a mapped file.
/// One u32 counter per marker; a marker body runs only while its counter is
/// nonzero. The header records the attached coordinator's pid so stale
/// counts left by a killed coordinator can be swept back to zero.
pub struct SemaphoreTable {
    mmap: MmapMut,
}

impl SemaphoreTable {
    /// Conventional table location for a given backend pid.
    pub fn default_path(pid: u32) -> PathBuf {
        PathBuf::from(format!("/dev/shm/planscout.{pid}.sem"))
    }

    /// Server side: create (or reinitialize) the table at `path`.
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("create semaphore table {}", path.display()))?;
        file.set_len(SEMAPHORE_TABLE_BYTES as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let table = Self { mmap };
        table.magic_word().store(SEMAPHORE_TABLE_MAGIC, Ordering::Release);
        Ok(table)
    }

    /// Open an existing table, verifying the magic word.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open semaphore table {}", path.display()))?;
        if file.metadata()?.len() < SEMAPHORE_TABLE_BYTES as u64 {
            bail!("semaphore table {} is truncated", path.display());
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let table = Self { mmap };
        if table.magic_word().load(Ordering::Acquire) != SEMAPHORE_TABLE_MAGIC {
            bail!("semaphore table {} has a bad magic word", path.display());
        }
        Ok(table)
    }

    fn magic_word(&self) -> &AtomicU32 {
        unsafe { &*(self.mmap.as_ptr() as *const AtomicU32) }
    }

    fn owner_word(&self) -> &AtomicU32 {
        unsafe { &*(self.mmap.as_ptr().add(4) as *const AtomicU32) }
    }

    fn slot_word(&self, slot: usize) -> &AtomicU32 {
        debug_assert!(slot < NUM_MARKERS);
        unsafe { &*(self.mmap.as_ptr().add(HEADER_BYTES + slot * 4) as *const AtomicU32) }
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_word().load(Ordering::Acquire)
    }

    pub fn count(&self, slot: usize) -> u32 {
        self.slot_word(slot).load(Ordering::Relaxed)
    }

    /// Coordinator attach: record the owner and bump every marker.
    pub fn attach_all(&self, owner_pid: u32) {
        self.owner_word().store(owner_pid, Ordering::Release);
        for slot in 0..NUM_MARKERS {
            self.slot_word(slot).fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Coordinator detach: decrement every marker, never below zero.
    pub fn detach_all(&self) {
        for slot in 0..NUM_MARKERS {
            let _ = self
                .slot_word(slot)
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        }
        self.owner_word().store(0, Ordering::Release);
    }

    /// If the recorded owner died without detaching, sweep all counts back
    /// to zero so markers return to their no-op state.
    pub fn sweep_dead_owner(&self) {
        let owner = self.owner_pid();
        if owner == 0 {
            return;
        }
        let alive = unsafe { libc::kill(owner as libc::pid_t, 0) } == 0
            || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH);
        if !alive {
            for slot in 0..NUM_MARKERS {
                self.slot_word(slot).store(0, Ordering::Release);
            }
            self.owner_word().store(0, Ordering::Release);
        }
    }
}

/// Sampled-execution flag: armed at most once per executor invocation with
/// the configured probability, reset at teardown. All executor markers
/// check it before firing.
pub struct SamplingGate {
    executor_running: AtomicBool,
}

impl SamplingGate {
    pub const fn new() -> Self {
        Self {
            executor_running: AtomicBool::new(false),
        }
    }

    /// Bernoulli draw against `rate`; the caller validates the range.
    pub fn arm_sampled(&self, rate: f64) {
        let armed = rate >= 1.0 || (rate > 0.0 && rand::thread_rng().gen::<f64>() < rate);
        self.executor_running.store(armed, Ordering::Relaxed);
    }

    pub fn disarm(&self) {
        self.executor_running.store(false, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.executor_running.load(Ordering::Relaxed)
    }
}

impl Default for SamplingGate {
    fn default() -> Self {
        Self::new()
    }
}

// Anchor functions, one per marker, in semaphore-slot order. The collector
// attaches uprobes by these symbol names and reads the argument block
// through (args, len). The bodies must survive optimization, hence the
// black_box.
macro_rules! marker_anchors {
    ($($anchor:ident),* $(,)?) => {
        $(
            #[no_mangle]
            #[inline(never)]
            pub extern "C" fn $anchor(args: *const u64, len: u64) {
                std::hint::black_box((args, len));
            }
        )*

        /// Anchors indexed by semaphore slot.
        pub static MARKER_ANCHORS: [extern "C" fn(*const u64, u64); NUM_MARKERS] = [$($anchor),*];
    };
}

marker_anchors!(
    planscout_seq_scan_begin,
    planscout_seq_scan_end,
    planscout_seq_scan_features,
    planscout_seq_scan_flush,
    planscout_index_scan_begin,
    planscout_index_scan_end,
    planscout_index_scan_features,
    planscout_index_scan_flush,
    planscout_index_only_scan_begin,
    planscout_index_only_scan_end,
    planscout_index_only_scan_features,
    planscout_index_only_scan_flush,
    planscout_bitmap_index_scan_begin,
    planscout_bitmap_index_scan_end,
    planscout_bitmap_index_scan_features,
    planscout_bitmap_index_scan_flush,
    planscout_bitmap_heap_scan_begin,
    planscout_bitmap_heap_scan_end,
    planscout_bitmap_heap_scan_features,
    planscout_bitmap_heap_scan_flush,
    planscout_nest_loop_begin,
    planscout_nest_loop_end,
    planscout_nest_loop_features,
    planscout_nest_loop_flush,
    planscout_hash_join_begin,
    planscout_hash_join_end,
    planscout_hash_join_features,
    planscout_hash_join_flush,
    planscout_hash_begin,
    planscout_hash_end,
    planscout_hash_features,
    planscout_hash_flush,
    planscout_agg_begin,
    planscout_agg_end,
    planscout_agg_features,
    planscout_agg_flush,
    planscout_sort_begin,
    planscout_sort_end,
    planscout_sort_features,
    planscout_sort_flush,
    planscout_modify_table_insert_begin,
    planscout_modify_table_insert_end,
    planscout_modify_table_insert_features,
    planscout_modify_table_insert_flush,
    planscout_lock_rows_begin,
    planscout_lock_rows_end,
    planscout_lock_rows_features,
    planscout_lock_rows_flush,
    planscout_sub_plan_begin,
    planscout_sub_plan_end,
    planscout_sub_plan_features,
    planscout_sub_plan_flush,
    planscout_remote_receiver_begin,
    planscout_remote_receiver_end,
    planscout_remote_receiver_features,
    planscout_remote_receiver_flush,
);

/// Symbol name of a marker anchor, as the coordinator attaches it.
pub fn anchor_symbol(ou: OuIndex, event: MarkerEvent) -> String {
    format!("planscout_{}_{}", ou.name(), event.suffix())
}

// Postmaster lifecycle anchors. These are attached unconditionally (no
// semaphore, no sampling gate): the coordinator needs fork/reap events to
// track backends even while nothing is sampled. Arguments ride in
// registers, so the probes read them without touching user memory.

#[no_mangle]
#[inline(never)]
pub extern "C" fn planscout_postmaster_fork_backend(pid: u64, socket_fd: u64) {
    std::hint::black_box((pid, socket_fd));
}

#[no_mangle]
#[inline(never)]
pub extern "C" fn planscout_postmaster_fork_background(pid: u64) {
    std::hint::black_box(pid);
}

#[no_mangle]
#[inline(never)]
pub extern "C" fn planscout_postmaster_reap_backend(pid: u64) {
    std::hint::black_box(pid);
}

#[no_mangle]
#[inline(never)]
pub extern "C" fn planscout_postmaster_reap_background(pid: u64) {
    std::hint::black_box(pid);
}

/// Postmaster-side notification helpers wrapping the lifecycle anchors.
pub mod postmaster {
    pub fn fork_backend(pid: u32, socket_fd: i32) {
        super::planscout_postmaster_fork_backend(pid as u64, socket_fd as u32 as u64);
    }

    pub fn fork_background(pid: u32) {
        super::planscout_postmaster_fork_background(pid as u64);
    }

    pub fn reap_backend(pid: u32) {
        super::planscout_postmaster_reap_backend(pid as u64);
    }

    pub fn reap_background(pid: u32) {
        super::planscout_postmaster_reap_background(pid as u64);
    }
}

type ObserverFn = Box<dyn Fn(usize, &[u64]) + Send + Sync>;

static OBSERVER: Lazy<RwLock<Option<ObserverFn>>> = Lazy::new(|| RwLock::new(None));

/// Install a process-wide marker observer. Test-oriented: production
/// observation happens out of process through the anchors.
pub fn set_observer(observer: Option<ObserverFn>) {
    *OBSERVER.write().unwrap() = observer;
}

/// The full marker surface for one backend: semaphore table plus sampling
/// gate.
pub struct MarkerSet {
    table: SemaphoreTable,
    gate: SamplingGate,
}

impl MarkerSet {
    pub fn new(table: SemaphoreTable) -> Self {
        Self {
            table,
            gate: SamplingGate::new(),
        }
    }

    pub fn gate(&self) -> &SamplingGate {
        &self.gate
    }

    pub fn table(&self) -> &SemaphoreTable {
        &self.table
    }

    /// A marker fires only when the execution is sampled and an observer
    /// holds the marker's semaphore.
    pub fn armed(&self, ou: OuIndex, event: MarkerEvent) -> bool {
        self.gate.is_set() && self.table.count(marker_slot(ou as u32, event)) > 0
    }

    /// Fixed-arity emission; arity is checked at compile time.
    pub fn fire<const N: usize>(&self, ou: OuIndex, event: MarkerEvent, args: [u64; N]) {
        const {
            assert!(N <= MARKER_MAX_ARGS, "marker payload exceeds 12 slots");
        }
        self.fire_dyn(ou, event, &args);
    }

    /// Variable-arity emission for the features markers; payloads beyond
    /// the slot limit are truncated rather than faulting the backend.
    pub fn fire_dyn(&self, ou: OuIndex, event: MarkerEvent, args: &[u64]) {
        if !self.armed(ou, event) {
            return;
        }
        debug_assert!(args.len() <= MARKER_MAX_ARGS);
        let len = args.len().min(MARKER_MAX_ARGS);
        let slot = marker_slot(ou as u32, event);
        if let Some(observer) = OBSERVER.read().unwrap().as_ref() {
            observer(slot, &args[..len]);
        }
        MARKER_ANCHORS[slot](args.as_ptr(), len as u64);
    }
}

/// Emit `<node>_begin` / `<node>_end` around the node's real work. This is
/// the thin outer wrapper every standard executor node type gets; bitmap
/// scans, subplans, hash and hash-join carry nonstandard signatures and are
/// wrapped manually at their call sites with [`MarkerSet::fire_dyn`].
pub fn wrap_node<R>(set: &MarkerSet, ou: OuIndex, plan_node_id: i32, body: impl FnOnce() -> R) -> R {
    set.fire(ou, MarkerEvent::Begin, [plan_node_id as u32 as u64]);
    let out = body();
    set.fire(ou, MarkerEvent::End, [plan_node_id as u32 as u64]);
    out
}

/// The standard features payload prefix shared by every OU.
#[derive(Copy, Clone, Debug)]
pub struct NodeFeatures {
    pub plan_node_id: i32,
    pub query_id: i64,
    pub plan_ptr: u64,
    pub left_child_id: i32,
    pub right_child_id: i32,
    pub statement_start_ts: i64,
}

/// Emit `<node>_features`: the common prefix followed by the OU-specific
/// fields, all promoted to pointer width.
pub fn emit_features(set: &MarkerSet, ou: OuIndex, node: &NodeFeatures, extras: &[u64]) {
    let mut args = [0u64; MARKER_MAX_ARGS];
    args[0] = node.plan_node_id as u32 as u64;
    args[1] = node.query_id as u64;
    args[2] = node.plan_ptr;
    args[3] = node.left_child_id as u32 as u64;
    args[4] = node.right_child_id as u32 as u64;
    args[5] = node.statement_start_ts as u64;
    let extra_len = extras.len().min(MARKER_MAX_ARGS - 6);
    args[6..6 + extra_len].copy_from_slice(&extras[..extra_len]);
    set.fire_dyn(ou, MarkerEvent::Features, &args[..6 + extra_len]);
}

/// Emit the terminal `<node>_flush` marker for a plan node.
pub fn emit_flush(set: &MarkerSet, ou: OuIndex, plan_node_id: i32) {
    set.fire(ou, MarkerEvent::Flush, [plan_node_id as u32 as u64]);
}

/// A correctly paired begin/end interval timer: begin captures the start,
/// end computes the elapsed time against it.
pub struct TimedSpan {
    start: Instant,
}

impl TimedSpan {
    pub fn begin() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    // The observer slot is process-wide; observer tests serialize on this.
    static OBSERVER_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn table() -> SemaphoreTable {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.sem");
        let table = SemaphoreTable::create(&path).unwrap();
        // Keep the file alive past tempdir drop by leaking the dir handle;
        // the mapping itself stays valid either way.
        std::mem::forget(dir);
        table
    }

    #[test]
    fn semaphore_attach_detach_roundtrip() {
        let t = table();
        let slot = marker_slot(OuIndex::SeqScan as u32, MarkerEvent::Begin);
        assert_eq!(t.count(slot), 0);
        t.attach_all(1234);
        assert_eq!(t.count(slot), 1);
        assert_eq!(t.owner_pid(), 1234);
        t.attach_all(1234);
        assert_eq!(t.count(slot), 2);
        t.detach_all();
        t.detach_all();
        assert_eq!(t.count(slot), 0);
        assert_eq!(t.owner_pid(), 0);
        // Detach below zero stays at zero.
        t.detach_all();
        assert_eq!(t.count(slot), 0);
    }

    #[test]
    fn dead_owner_sweep_zeroes_counts() {
        let t = table();
        // Pid 1 is always alive; counts must survive the sweep.
        t.attach_all(1);
        t.sweep_dead_owner();
        assert_eq!(t.owner_pid(), 1);
        // A certainly-dead pid gets swept.
        t.owner_word().store(0x7fff_fff0, Ordering::Release);
        t.sweep_dead_owner();
        assert_eq!(t.owner_pid(), 0);
        let slot = marker_slot(OuIndex::Agg as u32, MarkerEvent::Flush);
        assert_eq!(t.count(slot), 0);
    }

    #[test]
    fn marker_skipped_without_semaphore_or_gate() {
        let _guard = OBSERVER_LOCK.lock().unwrap();
        let set = MarkerSet::new(table());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        set_observer(Some(Box::new(move |_, _| {
            hits_clone.fetch_add(1, Ordering::Relaxed);
        })));

        // Gate armed but no semaphore: skipped.
        set.gate().arm_sampled(1.0);
        set.fire(OuIndex::SeqScan, MarkerEvent::Begin, [7]);
        assert_eq!(hits.load(Ordering::Relaxed), 0);

        // Semaphore held but gate disarmed: skipped.
        set.table().attach_all(std::process::id());
        set.gate().disarm();
        set.fire(OuIndex::SeqScan, MarkerEvent::Begin, [7]);
        assert_eq!(hits.load(Ordering::Relaxed), 0);

        // Both held: fires.
        set.gate().arm_sampled(1.0);
        set.fire(OuIndex::SeqScan, MarkerEvent::Begin, [7]);
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        set_observer(None);
    }

    #[test]
    fn features_payload_layout() {
        let _guard = OBSERVER_LOCK.lock().unwrap();
        let set = MarkerSet::new(table());
        set.table().attach_all(std::process::id());
        set.gate().arm_sampled(1.0);

        let seen: Arc<std::sync::Mutex<Vec<Vec<u64>>>> = Arc::default();
        let seen_clone = Arc::clone(&seen);
        set_observer(Some(Box::new(move |_, args| {
            seen_clone.lock().unwrap().push(args.to_vec());
        })));

        emit_features(
            &set,
            OuIndex::SeqScan,
            &NodeFeatures {
                plan_node_id: 7,
                query_id: 42,
                plan_ptr: 0xAA,
                left_child_id: -1,
                right_child_id: -1,
                statement_start_ts: 99,
            },
            &[100],
        );
        set_observer(None);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let args = &seen[0];
        assert_eq!(args.len(), 7);
        assert_eq!(args[0], 7);
        assert_eq!(args[1], 42);
        assert_eq!(args[2], 0xAA);
        assert_eq!(args[3] as u32 as i32, -1);
        assert_eq!(args[6], 100);
    }

    #[test]
    fn gate_probabilities_at_the_extremes() {
        let gate = SamplingGate::new();
        gate.arm_sampled(1.0);
        assert!(gate.is_set());
        gate.arm_sampled(0.0);
        assert!(!gate.is_set());
    }

    #[test]
    fn anchor_symbols_match_slot_order() {
        // The semaphore-slot order and the anchor table must agree; spot
        // check both ends and the arithmetic in between.
        assert_eq!(
            anchor_symbol(OuIndex::SeqScan, MarkerEvent::Begin),
            "planscout_seq_scan_begin"
        );
        assert_eq!(
            anchor_symbol(OuIndex::RemoteReceiver, MarkerEvent::Flush),
            "planscout_remote_receiver_flush"
        );
        assert_eq!(
            marker_slot(OuIndex::RemoteReceiver as u32, MarkerEvent::Flush),
            NUM_MARKERS - 1
        );
    }

    #[test]
    fn timed_span_pairs_begin_with_end() {
        let span = TimedSpan::begin();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(span.elapsed_us() >= 1_000);
    }
}
