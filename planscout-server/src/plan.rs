//! The slice of the executor's plan-state tree the pipeline reads. The
//! tree is owned by the executor; the pipeline only walks it, swaps
//! instrumentation slots, and formats the plan text for persistence.

use planscout_common::OuIndex;

use crate::counters::InstrSlot;

/// Executor node kinds the pipeline distinguishes. `Other` stands in for
/// every tag the pipeline walks past without touching.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeTag {
    SeqScan,
    IndexScan,
    IndexOnlyScan,
    BitmapIndexScan,
    BitmapHeapScan,
    NestLoop,
    HashJoin,
    Hash,
    Agg,
    Sort,
    ModifyTable,
    LockRows,
    SubPlan,
    Result,
    Material,
    Other,
}

impl NodeTag {
    /// The node tags whose instrumentation is replaced with a counter
    /// block at executor start. Everything else keeps whatever the
    /// executor put there.
    pub fn counter_ou(self) -> Option<OuIndex> {
        match self {
            NodeTag::IndexScan => Some(OuIndex::IndexScan),
            NodeTag::IndexOnlyScan => Some(OuIndex::IndexOnlyScan),
            NodeTag::ModifyTable => Some(OuIndex::ModifyTableInsert),
            NodeTag::LockRows => Some(OuIndex::LockRows),
            NodeTag::NestLoop => Some(OuIndex::NestLoop),
            NodeTag::Agg => Some(OuIndex::Agg),
            NodeTag::BitmapIndexScan => Some(OuIndex::BitmapIndexScan),
            NodeTag::BitmapHeapScan => Some(OuIndex::BitmapHeapScan),
            _ => None,
        }
    }

    /// The operating unit whose markers observe this node, for every tag
    /// that has one. Pass-through tags (Result, Material) are unobserved.
    pub fn marker_ou(self) -> Option<OuIndex> {
        match self {
            NodeTag::SeqScan => Some(OuIndex::SeqScan),
            NodeTag::IndexScan => Some(OuIndex::IndexScan),
            NodeTag::IndexOnlyScan => Some(OuIndex::IndexOnlyScan),
            NodeTag::BitmapIndexScan => Some(OuIndex::BitmapIndexScan),
            NodeTag::BitmapHeapScan => Some(OuIndex::BitmapHeapScan),
            NodeTag::NestLoop => Some(OuIndex::NestLoop),
            NodeTag::HashJoin => Some(OuIndex::HashJoin),
            NodeTag::Hash => Some(OuIndex::Hash),
            NodeTag::Agg => Some(OuIndex::Agg),
            NodeTag::Sort => Some(OuIndex::Sort),
            NodeTag::ModifyTable => Some(OuIndex::ModifyTableInsert),
            NodeTag::LockRows => Some(OuIndex::LockRows),
            NodeTag::SubPlan => Some(OuIndex::SubPlan),
            _ => None,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            NodeTag::SeqScan => "SeqScan",
            NodeTag::IndexScan => "IndexScan",
            NodeTag::IndexOnlyScan => "IndexOnlyScan",
            NodeTag::BitmapIndexScan => "BitmapIndexScan",
            NodeTag::BitmapHeapScan => "BitmapHeapScan",
            NodeTag::NestLoop => "NestLoop",
            NodeTag::HashJoin => "HashJoin",
            NodeTag::Hash => "Hash",
            NodeTag::Agg => "Agg",
            NodeTag::Sort => "Sort",
            NodeTag::ModifyTable => "ModifyTable",
            NodeTag::LockRows => "LockRows",
            NodeTag::SubPlan => "SubPlan",
            NodeTag::Result => "Result",
            NodeTag::Material => "Material",
            NodeTag::Other => "Other",
        }
    }
}

/// One node of the executor's plan-state tree.
#[derive(Debug)]
pub struct PlanState {
    pub tag: NodeTag,
    pub plan_node_id: i32,
    pub instrument: Option<InstrSlot>,
    pub children: Vec<PlanState>,
}

impl PlanState {
    pub fn new(tag: NodeTag, plan_node_id: i32) -> Self {
        Self {
            tag,
            plan_node_id,
            instrument: None,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<PlanState>) -> Self {
        self.children = children;
        self
    }

    /// Depth-first preorder walk with mutable access to each node.
    pub fn walk_mut(&mut self, visit: &mut impl FnMut(&mut PlanState)) {
        visit(self);
        for child in &mut self.children {
            child.walk_mut(visit);
        }
    }

    pub fn walk(&self, visit: &mut impl FnMut(&PlanState)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

/// What the pipeline needs to know about one executor invocation.
#[derive(Debug)]
pub struct QueryDesc {
    pub query_id: i64,
    pub generation: i64,
    pub db_id: u32,
    pub query_text: String,
    pub plan: PlanState,
}

impl QueryDesc {
    /// Format the plan text persisted into the `plans` table. Formatted
    /// once per upsert, at executor end.
    pub fn explain_text(&self) -> String {
        let mut out = String::new();
        fn emit(node: &PlanState, depth: usize, out: &mut String) {
            for _ in 0..depth {
                out.push_str("  ");
            }
            out.push_str(node.tag.label());
            out.push_str(" [");
            out.push_str(&node.plan_node_id.to_string());
            out.push_str("]\n");
            for child in &node.children {
                emit(child, depth + 1, out);
            }
        }
        emit(&self.plan, 0, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_tags_match_the_documented_set() {
        let tagged: Vec<NodeTag> = [
            NodeTag::IndexScan,
            NodeTag::IndexOnlyScan,
            NodeTag::ModifyTable,
            NodeTag::LockRows,
            NodeTag::NestLoop,
            NodeTag::Agg,
            NodeTag::BitmapIndexScan,
            NodeTag::BitmapHeapScan,
        ]
        .into_iter()
        .filter(|t| t.counter_ou().is_some())
        .collect();
        assert_eq!(tagged.len(), 8);
        // Sequential scans are observed through markers only.
        assert!(NodeTag::SeqScan.counter_ou().is_none());
        assert!(NodeTag::Sort.counter_ou().is_none());
    }

    #[test]
    fn explain_text_indents_children() {
        let desc = QueryDesc {
            query_id: 1,
            generation: 1,
            db_id: 1,
            query_text: "select 1".into(),
            plan: PlanState::new(NodeTag::Agg, 0).with_children(vec![PlanState::new(
                NodeTag::SeqScan,
                1,
            )]),
        };
        let text = desc.explain_text();
        assert!(text.starts_with("Agg [0]\n"));
        assert!(text.contains("\n  SeqScan [1]\n"));
    }
}
