//! Counter blocks: the server's generic instrumentation record, augmented
//! with ten opaque f64 accumulators and a signature word. Everything that
//! downcasts an instrumentation slot MUST go through the signature check;
//! a slot without the signature is not ours and is ignored, never an
//! error.

use std::cell::RefCell;
use std::rc::Rc;

use planscout_common::{COUNTER_BLOCK_MAGIC, NUM_QSS_COUNTERS};

/// The host server's generic per-node instrumentation shape.
#[derive(Clone, Debug, Default)]
pub struct Instrumentation {
    pub running: bool,
    /// Wall time attributed to the node, microseconds.
    pub total_us: u64,
    pub tuple_count: f64,
}

/// Instrumentation extended with QSS counters. Counter semantics are
/// OU-specific and assigned by convention; this layer treats them as
/// opaque accumulators.
#[derive(Clone, Debug)]
pub struct CounterBlock {
    pub base: Instrumentation,
    signature: u32,
    pub plan_node_id: i32,
    pub ou_name: &'static str,
    pub counters: [f64; NUM_QSS_COUNTERS],
}

impl CounterBlock {
    pub fn new(plan_node_id: i32, ou_name: &'static str) -> Self {
        Self {
            base: Instrumentation::default(),
            signature: COUNTER_BLOCK_MAGIC,
            plan_node_id,
            ou_name,
            counters: [0.0; NUM_QSS_COUNTERS],
        }
    }

    /// Construct with an arbitrary signature word. Exists so the rejection
    /// path is testable; production blocks always carry the magic.
    pub fn with_signature(plan_node_id: i32, ou_name: &'static str, signature: u32) -> Self {
        let mut block = Self::new(plan_node_id, ou_name);
        block.signature = signature;
        block
    }

    pub fn signature_valid(&self) -> bool {
        self.signature == COUNTER_BLOCK_MAGIC
    }
}

/// Shared handle to a counter block: owned by the executor frame, also
/// reachable from the plan node it instruments. Backends are
/// single-threaded within a statement, so Rc/RefCell is the ownership
/// story.
pub type CounterBlockRef = Rc<RefCell<CounterBlock>>;

/// What sits in a plan node's instrumentation slot.
#[derive(Debug)]
pub enum InstrSlot {
    /// The executor's own instrumentation; not ours.
    Standard(Instrumentation),
    Counters(CounterBlockRef),
}

impl InstrSlot {
    /// Signature-checked downcast. Foreign instrumentation and blocks with
    /// a clobbered signature both come back `None`.
    pub fn as_counter_block(&self) -> Option<&CounterBlockRef> {
        match self {
            InstrSlot::Counters(block) if block.borrow().signature_valid() => Some(block),
            _ => None,
        }
    }
}

/// Non-blocking, null-safe increment of `counters[index]`.
pub fn add_counter(block: Option<&CounterBlockRef>, index: usize, value: f64) {
    let Some(block) = block else { return };
    let mut block = block.borrow_mut();
    if !block.signature_valid() || index >= NUM_QSS_COUNTERS {
        return;
    }
    block.counters[index] += value;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_counter_tolerates_missing_block() {
        add_counter(None, 0, 1.0);
    }

    #[test]
    fn add_counter_ignores_out_of_range_index() {
        let block = Rc::new(RefCell::new(CounterBlock::new(3, "agg")));
        add_counter(Some(&block), NUM_QSS_COUNTERS, 5.0);
        assert!(block.borrow().counters.iter().all(|c| *c == 0.0));
        add_counter(Some(&block), 2, 5.0);
        assert_eq!(block.borrow().counters[2], 5.0);
    }

    #[test]
    fn foreign_instrumentation_is_never_miscounted() {
        let standard = InstrSlot::Standard(Instrumentation::default());
        assert!(standard.as_counter_block().is_none());

        let clobbered = Rc::new(RefCell::new(CounterBlock::with_signature(
            1,
            "index_scan",
            0xdead_beef,
        )));
        let slot = InstrSlot::Counters(Rc::clone(&clobbered));
        assert!(slot.as_counter_block().is_none());
        add_counter(Some(&clobbered), 0, 1.0);
        assert_eq!(clobbered.borrow().counters[0], 0.0);
    }

    #[test]
    fn valid_block_downcasts() {
        let block = Rc::new(RefCell::new(CounterBlock::new(9, "nest_loop")));
        let slot = InstrSlot::Counters(Rc::clone(&block));
        let got = slot.as_counter_block().expect("signature is ours");
        add_counter(Some(got), 0, 2.5);
        add_counter(Some(got), 0, 0.5);
        assert_eq!(block.borrow().counters[0], 3.0);
    }
}
