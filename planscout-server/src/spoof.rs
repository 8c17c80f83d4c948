//! Table-size spoofing for planner experimentation: a registered entry
//! overrides pages, tuples and (for indexes) tree height before any
//! subsequent cost computation sees them.

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RelStats {
    pub pages: u32,
    pub tuples: f64,
    /// B-tree height; applied only when the relation is an index.
    pub tree_height: i32,
}

/// The planner-visible slice of a relation's optimizer info.
#[derive(Clone, Debug)]
pub struct RelOptInfo {
    pub rel_oid: u32,
    pub is_index: bool,
    pub pages: u32,
    pub tuples: f64,
    pub tree_height: i32,
}

#[derive(Default)]
pub struct SpoofTable {
    entries: RwLock<HashMap<u32, RelStats>>,
}

impl SpoofTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, rel_oid: u32, stats: RelStats) {
        self.entries.write().unwrap().insert(rel_oid, stats);
    }

    pub fn clear(&self, rel_oid: u32) {
        self.entries.write().unwrap().remove(&rel_oid);
    }

    pub fn get(&self, rel_oid: u32) -> Option<RelStats> {
        self.entries.read().unwrap().get(&rel_oid).copied()
    }

    /// The get-relation-info hook body: override the optimizer info in
    /// place when a spoofed entry exists for the oid.
    pub fn get_relation_info(&self, rel_oid: u32, _inhparent: bool, rel: &mut RelOptInfo) {
        let Some(stats) = self.get(rel_oid) else {
            return;
        };
        rel.pages = stats.pages;
        rel.tuples = stats.tuples;
        if rel.is_index {
            rel.tree_height = stats.tree_height;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(oid: u32, is_index: bool) -> RelOptInfo {
        RelOptInfo {
            rel_oid: oid,
            is_index,
            pages: 10,
            tuples: 1_000.0,
            tree_height: 2,
        }
    }

    #[test]
    fn spoofed_entry_overrides_sizes() {
        let table = SpoofTable::new();
        table.set(
            16384,
            RelStats {
                pages: 1_000_000,
                tuples: 5e8,
                tree_height: 4,
            },
        );

        let mut heap = rel(16384, false);
        table.get_relation_info(16384, false, &mut heap);
        assert_eq!(heap.pages, 1_000_000);
        assert_eq!(heap.tuples, 5e8);
        // Heap relations keep their tree height.
        assert_eq!(heap.tree_height, 2);

        let mut index = rel(16384, true);
        table.get_relation_info(16384, false, &mut index);
        assert_eq!(index.tree_height, 4);
    }

    #[test]
    fn unspoofed_oid_is_untouched() {
        let table = SpoofTable::new();
        let mut r = rel(1, false);
        table.get_relation_info(1, false, &mut r);
        assert_eq!(r.pages, 10);
        table.set(
            1,
            RelStats {
                pages: 7,
                tuples: 7.0,
                tree_height: 7,
            },
        );
        table.clear(1);
        table.get_relation_info(1, false, &mut r);
        assert_eq!(r.pages, 10);
    }
}
