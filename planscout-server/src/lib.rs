//! In-server half of the query-execution telemetry core.
//!
//! A backend embeds this crate to get two things:
//!
//!   - the **marker fabric**: near-zero-cost static emission points wrapped
//!     around every executor node, gated by a sampled-execution flag and by
//!     per-marker semaphores the out-of-process collector toggles;
//!   - the **counter pipeline** (QSS): per-plan-node counter blocks
//!     allocated at executor start, drained at executor end into the
//!     database's own `plans`/`stats` tables, plus statistics spoofing for
//!     planner experimentation.
//!
//! Nothing here may degrade correctness of the host server: allocation
//! failures return `None`, counter helpers tolerate missing blocks, and
//! only catalog persistence surfaces errors to the owning backend.

pub mod catalog;
pub mod config;
pub mod counters;
pub mod frames;
pub mod hooks;
pub mod plan;
pub mod probes;
pub mod spoof;

pub use catalog::{BTreeCatalog, Catalog, PlanKey, PlanRow, StatsRow};
pub use config::{CaptureConfig, Settings};
pub use counters::{add_counter, CounterBlock, CounterBlockRef, InstrSlot, Instrumentation};
pub use frames::QssPipeline;
pub use plan::{NodeTag, PlanState, QueryDesc};
pub use probes::{MarkerSet, SamplingGate, SemaphoreTable, TimedSpan};
pub use spoof::{RelOptInfo, RelStats, SpoofTable};
