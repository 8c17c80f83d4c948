//! The server's function-pointer hook slots, modeled as a capability
//! table. A module registers its table at init and gets the prior
//! occupants back; restoring the guard at teardown reinstates them.
//! A registrant that wants to chain keeps the prior table and calls
//! through it from its own hooks.

use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::counters::CounterBlockRef;
use crate::plan::QueryDesc;
use crate::spoof::RelOptInfo;

pub type AllocInstrumentationHook = fn(plan_node_id: i32) -> Option<CounterBlockRef>;
pub type QssClearHook = fn();
pub type ExecutorStartHook = fn(&mut QueryDesc, eflags: u32);
pub type ExecutorEndHook = fn(&mut QueryDesc);
pub type ExplainOneQueryHook = fn(&QueryDesc) -> String;
pub type ExplainOneUtilityHook = fn(&QueryDesc) -> String;
pub type GetRelationInfoHook = fn(rel_oid: u32, inhparent: bool, rel: &mut RelOptInfo);

#[derive(Copy, Clone, Default)]
pub struct HookTable {
    pub alloc_instrumentation: Option<AllocInstrumentationHook>,
    pub qss_clear: Option<QssClearHook>,
    pub executor_start: Option<ExecutorStartHook>,
    pub executor_end: Option<ExecutorEndHook>,
    pub explain_one_query: Option<ExplainOneQueryHook>,
    pub explain_one_utility: Option<ExplainOneUtilityHook>,
    pub get_relation_info: Option<GetRelationInfoHook>,
}

static HOOKS: Lazy<RwLock<HookTable>> = Lazy::new(|| RwLock::new(HookTable::default()));

/// Restores the displaced hook table when dropped.
pub struct HookGuard {
    prior: HookTable,
    restored: bool,
}

impl HookGuard {
    /// The occupants displaced by the install, for chaining.
    pub fn prior(&self) -> HookTable {
        self.prior
    }

    pub fn restore(mut self) {
        self.restore_inner();
    }

    fn restore_inner(&mut self) {
        if !self.restored {
            *HOOKS.write().unwrap() = self.prior;
            self.restored = true;
        }
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        self.restore_inner();
    }
}

/// Swap in a new hook table, returning a guard holding the prior one.
pub fn install(table: HookTable) -> HookGuard {
    let mut hooks = HOOKS.write().unwrap();
    let prior = *hooks;
    *hooks = table;
    HookGuard {
        prior,
        restored: false,
    }
}

pub fn current() -> HookTable {
    *HOOKS.read().unwrap()
}
