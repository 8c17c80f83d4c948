use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

use planscout_common::protocol::NUM_DROP_REASONS;
use planscout_common::NUM_OUS;

/// Global counters for the coordinator. Everything is updated from the
/// consumer hot paths, so all fields are atomic. The pipeline drops data
/// under pressure; these counters are how the losses stay visible.
pub struct Metrics {
    records_total: AtomicU64,
    records_by_ou: [AtomicU64; NUM_OUS],
    decode_failures: AtomicU64,
    ring_drops: AtomicU64,
    kernel_drops: [AtomicU64; NUM_OUS * NUM_DROP_REASONS],
    backends_attached: AtomicUsize,
    pub start_time: SystemTime,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            records_total: AtomicU64::new(0),
            records_by_ou: std::array::from_fn(|_| AtomicU64::new(0)),
            decode_failures: AtomicU64::new(0),
            ring_drops: AtomicU64::new(0),
            kernel_drops: std::array::from_fn(|_| AtomicU64::new(0)),
            backends_attached: AtomicUsize::new(0),
            start_time: SystemTime::now(),
        }
    }

    pub fn record_record(&self, ou_index: u32) {
        self.records_total.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = self.records_by_ou.get(ou_index as usize) {
            slot.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn records_total(&self) -> u64 {
        self.records_total.load(Ordering::Relaxed)
    }

    pub fn records_for(&self, ou_index: u32) -> u64 {
        self.records_by_ou
            .get(ou_index as usize)
            .map(|slot| slot.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn inc_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    pub fn inc_ring_drop(&self) {
        self.ring_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ring_drops(&self) -> u64 {
        self.ring_drops.load(Ordering::Relaxed)
    }

    /// Refresh one kernel-side drop counter from the collector's map.
    /// Values are absolute; the kernel only ever increments them.
    pub fn set_kernel_drop(&self, ou_index: u32, reason: u32, value: u64) {
        let idx = ou_index as usize * NUM_DROP_REASONS + reason as usize;
        if let Some(slot) = self.kernel_drops.get(idx) {
            slot.store(value, Ordering::Relaxed);
        }
    }

    pub fn kernel_drops_for(&self, ou_index: u32) -> u64 {
        let base = ou_index as usize * NUM_DROP_REASONS;
        self.kernel_drops[base..base + NUM_DROP_REASONS]
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .sum()
    }

    pub fn kernel_drops_total(&self) -> u64 {
        self.kernel_drops
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .sum()
    }

    pub fn set_backends_attached(&self, count: usize) {
        self.backends_attached.store(count, Ordering::Relaxed);
    }

    pub fn backends_attached(&self) -> usize {
        self.backends_attached.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planscout_common::OuIndex;

    #[test]
    fn per_ou_records_roll_up_into_the_total() {
        let m = Metrics::new();
        m.record_record(OuIndex::SeqScan as u32);
        m.record_record(OuIndex::SeqScan as u32);
        m.record_record(OuIndex::Agg as u32);
        assert_eq!(m.records_total(), 3);
        assert_eq!(m.records_for(OuIndex::SeqScan as u32), 2);
        assert_eq!(m.records_for(OuIndex::Agg as u32), 1);
        // Out-of-range indices are tolerated, not counted per-OU.
        m.record_record(999);
        assert_eq!(m.records_total(), 4);
    }

    #[test]
    fn kernel_drops_are_absolute_snapshots() {
        let m = Metrics::new();
        m.set_kernel_drop(0, 4, 3);
        m.set_kernel_drop(0, 4, 5);
        m.set_kernel_drop(1, 0, 2);
        assert_eq!(m.kernel_drops_for(0), 5);
        assert_eq!(m.kernel_drops_total(), 7);
    }
}
