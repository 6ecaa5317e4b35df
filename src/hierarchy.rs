//! Rebuilds the category forest from flat records.
//!
//! The source data is scraped and inconsistent: parent references can be
//! missing, point at the record itself, form cycles, or repeat. [`build`]
//! turns any such input into a structurally sound, deterministically ordered
//! forest and reports every correction it made as a [`Warning`].
//!
//! Pure and synchronous: no I/O, no shared state, input is never mutated.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

use crate::category::{CategoryNode, CategoryRecord};

/// Reason code attached to each corrective action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WarningCode {
    DuplicateId,
    UnresolvableParent,
    SelfParent,
    CycleDetected,
    DuplicateEdge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub code: WarningCode,
    pub id: String,
    pub detail: String,
}

/// Output of one [`build`] call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildResult {
    pub forest: Vec<CategoryNode>,
    pub orphans: Vec<CategoryRecord>,
    pub warnings: Vec<Warning>,
}

impl BuildResult {
    /// Number of records placed in the forest.
    pub fn node_count(&self) -> usize {
        self.forest.iter().map(CategoryNode::subtree_len).sum()
    }

    pub fn count(&self, code: WarningCode) -> usize {
        self.warnings.iter().filter(|w| w.code == code).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Pending,
    Root,
    Attached,
    Orphan,
}

/// Arena entry. Edges are slot indices, never references.
struct Slot<'a> {
    record: &'a CategoryRecord,
    children: Vec<usize>,
    placement: Placement,
}

/// Union-find over the realized trees. A child's set always joins its
/// parent's, so each set's representative is the root of that tree.
struct Realized {
    link: Vec<usize>,
}

impl Realized {
    fn new(len: usize) -> Self {
        Self {
            link: (0..len).collect(),
        }
    }

    fn root_of(&mut self, mut slot: usize) -> usize {
        while self.link[slot] != slot {
            self.link[slot] = self.link[self.link[slot]];
            slot = self.link[slot];
        }
        slot
    }

    /// `child` must still be the root of its own tree.
    fn attach(&mut self, child: usize, parent: usize) {
        let root = self.root_of(parent);
        self.link[child] = root;
    }
}

/// Build the forest for `records`.
///
/// Every input id ends up in exactly one place: a forest node or the orphan
/// list. Later records that reuse an id are dropped with a `DuplicateId`
/// warning.
pub fn build(records: &[CategoryRecord]) -> BuildResult {
    let mut warnings = Vec::new();
    let mut slots: Vec<Slot<'_>> = Vec::with_capacity(records.len());
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(records.len());
    // (slot, is_duplicate) for every input position
    let mut entries: Vec<(usize, bool)> = Vec::with_capacity(records.len());

    for record in records {
        match index.get(record.id.as_str()) {
            Some(&kept) => {
                warnings.push(Warning {
                    code: WarningCode::DuplicateId,
                    id: record.id.clone(),
                    detail: "id already used by an earlier record; first occurrence kept"
                        .to_string(),
                });
                entries.push((kept, true));
            }
            None => {
                let slot = slots.len();
                index.insert(record.id.as_str(), slot);
                slots.push(Slot {
                    record,
                    children: Vec::new(),
                    placement: Placement::Pending,
                });
                entries.push((slot, false));
            }
        }
    }

    let mut realized = Realized::new(slots.len());

    for (record, &(slot, duplicate)) in records.iter().zip(&entries) {
        let parent_id = match record.parent_id.as_deref() {
            None => {
                if !duplicate {
                    slots[slot].placement = Placement::Root;
                }
                continue;
            }
            Some(pid) => pid,
        };

        if parent_id == record.id {
            if !duplicate {
                warnings.push(Warning {
                    code: WarningCode::SelfParent,
                    id: record.id.clone(),
                    detail: "parentId references the record itself; treated as root".to_string(),
                });
                slots[slot].placement = Placement::Root;
            }
            continue;
        }

        let Some(&parent) = index.get(parent_id) else {
            if !duplicate {
                let as_root = record.level == 1;
                warnings.push(Warning {
                    code: WarningCode::UnresolvableParent,
                    id: record.id.clone(),
                    detail: if as_root {
                        format!("parent '{}' not found; level 1 record kept as root", parent_id)
                    } else {
                        format!("parent '{}' not found; record excluded as orphan", parent_id)
                    },
                });
                slots[slot].placement = if as_root {
                    Placement::Root
                } else {
                    Placement::Orphan
                };
            }
            continue;
        };

        if slots[parent].children.contains(&slot) {
            warnings.push(Warning {
                code: WarningCode::DuplicateEdge,
                id: record.id.clone(),
                detail: format!("already attached under '{}'", parent_id),
            });
            continue;
        }

        // A dropped duplicate only gets to report a repeated edge.
        if duplicate {
            continue;
        }

        // Not yet attached, so `slot` is the root of its realized tree. The
        // edge closes a loop exactly when `parent` already hangs below it.
        if realized.root_of(parent) == slot {
            warnings.push(Warning {
                code: WarningCode::CycleDetected,
                id: record.id.clone(),
                detail: format!(
                    "attaching under '{}' would create a cycle; promoted to root",
                    parent_id
                ),
            });
            slots[slot].placement = Placement::Root;
            continue;
        }

        realized.attach(slot, parent);
        slots[slot].placement = Placement::Attached;
        slots[parent].children.push(slot);
    }

    for i in 0..slots.len() {
        let mut children = std::mem::take(&mut slots[i].children);
        sort_slots(&slots, &mut children);
        slots[i].children = children;
    }

    let mut roots: Vec<usize> = Vec::new();
    let mut orphan_heads: Vec<usize> = Vec::new();
    for (i, slot) in slots.iter().enumerate() {
        match slot.placement {
            Placement::Root | Placement::Pending => roots.push(i),
            Placement::Orphan => orphan_heads.push(i),
            Placement::Attached => {}
        }
    }

    sort_slots(&slots, &mut roots);
    let forest = materialize(&slots, &roots);

    // Descendants of an orphan leave the forest together with it.
    let mut orphans = Vec::new();
    for head in orphan_heads {
        collect_subtree(&slots, head, &mut orphans);
    }

    BuildResult {
        forest,
        orphans,
        warnings,
    }
}

fn sort_key_cmp(a: &CategoryRecord, b: &CategoryRecord) -> Ordering {
    a.level
        .cmp(&b.level)
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.id.cmp(&b.id))
}

fn sort_slots(slots: &[Slot<'_>], ids: &mut [usize]) {
    ids.sort_by(|&a, &b| sort_key_cmp(slots[a].record, slots[b].record));
}

/// Pre-order slot indices under `heads`, children in their stored order.
fn pre_order(slots: &[Slot<'_>], heads: &[usize]) -> Vec<usize> {
    let mut order = Vec::new();
    let mut stack: Vec<usize> = heads.iter().rev().copied().collect();
    while let Some(slot) = stack.pop() {
        order.push(slot);
        stack.extend(slots[slot].children.iter().rev());
    }
    order
}

/// Build nodes bottom-up: in reverse pre-order every slot comes after all of
/// its descendants, whose finished nodes sit on top of `built`.
fn materialize(slots: &[Slot<'_>], roots: &[usize]) -> Vec<CategoryNode> {
    let order = pre_order(slots, roots);
    let mut built: Vec<CategoryNode> = Vec::with_capacity(order.len());
    for &slot in order.iter().rev() {
        let split = built.len() - slots[slot].children.len();
        let mut children = built.split_off(split);
        children.reverse();
        built.push(CategoryNode {
            record: slots[slot].record.clone(),
            children,
        });
    }
    built.reverse();
    built
}

fn collect_subtree(slots: &[Slot<'_>], head: usize, out: &mut Vec<CategoryRecord>) {
    out.extend(
        pre_order(slots, &[head])
            .into_iter()
            .map(|slot| slots[slot].record.clone()),
    );
}

/// Flatten a forest back into records, pre-order.
///
/// `parentId` is rewritten to the realized parent, so cycle-break and
/// level-1 roots come out with `None`. Rebuilding the output reproduces the
/// same forest without warnings.
pub fn flatten(forest: &[CategoryNode]) -> Vec<CategoryRecord> {
    let mut out = Vec::new();
    let mut stack: Vec<(&CategoryNode, Option<&str>)> =
        forest.iter().rev().map(|root| (root, None)).collect();
    while let Some((node, parent)) = stack.pop() {
        let mut record = node.record.clone();
        record.parent_id = parent.map(str::to_string);
        out.push(record);
        stack.extend(node.children.iter().rev().map(|child| (child, Some(node.id()))));
    }
    out
}

/// Breadcrumb names from the root down to each node, keyed by id.
pub fn index_paths(forest: &[CategoryNode]) -> HashMap<String, Vec<String>> {
    let mut out = HashMap::new();
    let mut stack: Vec<(&CategoryNode, Vec<String>)> =
        forest.iter().map(|root| (root, Vec::new())).collect();
    while let Some((node, mut path)) = stack.pop() {
        path.push(node.record.name.clone());
        for child in &node.children {
            stack.push((child, path.clone()));
        }
        out.insert(node.record.id.clone(), path);
    }
    out
}

/// Find a node by id together with its breadcrumb path.
pub fn locate<'a>(
    forest: &'a [CategoryNode],
    id: &str,
) -> Option<(&'a CategoryNode, Vec<String>)> {
    let mut path: Vec<&str> = Vec::new();
    let mut stack: Vec<(&CategoryNode, usize)> =
        forest.iter().rev().map(|root| (root, 0)).collect();
    while let Some((node, depth)) = stack.pop() {
        path.truncate(depth);
        path.push(&node.record.name);
        if node.id() == id {
            return Some((node, path.into_iter().map(str::to_string).collect()));
        }
        stack.extend(node.children.iter().rev().map(|child| (child, depth + 1)));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::CategoryType;

    fn rec(id: &str, parent: Option<&str>, level: u32) -> CategoryRecord {
        CategoryRecord::new(id, parent, level)
    }

    fn ids(nodes: &[CategoryNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.id()).collect()
    }

    #[test]
    fn test_empty_input() {
        let result = build(&[]);
        assert!(result.forest.is_empty());
        assert!(result.orphans.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_single_root() {
        let result = build(&[rec("a", None, 1)]);
        assert_eq!(ids(&result.forest), vec!["a"]);
        assert!(result.forest[0].children.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_parent_and_child() {
        let result = build(&[rec("a", None, 1), rec("b", Some("a"), 2)]);
        assert_eq!(ids(&result.forest), vec!["a"]);
        assert_eq!(ids(&result.forest[0].children), vec!["b"]);
        assert!(result.forest[0].children[0].children.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_child_before_parent() {
        let result = build(&[rec("b", Some("a"), 2), rec("a", None, 1)]);
        assert_eq!(ids(&result.forest), vec!["a"]);
        assert_eq!(ids(&result.forest[0].children), vec!["b"]);
    }

    #[test]
    fn test_self_parent_is_root() {
        let result = build(&[rec("a", Some("a"), 3)]);
        assert_eq!(ids(&result.forest), vec!["a"]);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].code, WarningCode::SelfParent);
        assert_eq!(result.warnings[0].id, "a");
    }

    #[test]
    fn test_mutual_cycle() {
        let result = build(&[rec("a", Some("b"), 2), rec("b", Some("a"), 2)]);

        // a attaches under b; b's attempt would close the loop and is promoted.
        assert_eq!(result.count(WarningCode::CycleDetected), 1);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].id, "b");
        assert_eq!(ids(&result.forest), vec!["b"]);
        assert_eq!(ids(&result.forest[0].children), vec!["a"]);
        assert!(result.orphans.is_empty());
    }

    #[test]
    fn test_long_cycle_broken_once() {
        let records = vec![
            rec("a", Some("d"), 2),
            rec("b", Some("a"), 3),
            rec("c", Some("b"), 4),
            rec("d", Some("c"), 5),
        ];
        let result = build(&records);
        assert_eq!(result.count(WarningCode::CycleDetected), 1);
        assert_eq!(result.node_count(), 4);
        assert_eq!(ids(&result.forest), vec!["d"]);
    }

    #[test]
    fn test_unresolvable_parent_orphan() {
        let result = build(&[rec("x", Some("missing"), 3)]);
        assert!(result.forest.is_empty());
        assert_eq!(result.orphans.len(), 1);
        assert_eq!(result.orphans[0].id, "x");
        assert_eq!(result.warnings[0].code, WarningCode::UnresolvableParent);
    }

    #[test]
    fn test_unresolvable_parent_level_one_is_root() {
        let result = build(&[rec("x", Some("missing"), 1)]);
        assert_eq!(ids(&result.forest), vec!["x"]);
        assert!(result.orphans.is_empty());
        assert_eq!(result.warnings[0].code, WarningCode::UnresolvableParent);
    }

    #[test]
    fn test_orphan_takes_descendants() {
        let result = build(&[
            rec("root", None, 1),
            rec("x", Some("missing"), 2),
            rec("y", Some("x"), 3),
            rec("z", Some("y"), 4),
        ]);
        assert_eq!(ids(&result.forest), vec!["root"]);
        let orphan_ids: Vec<&str> = result.orphans.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(orphan_ids, vec!["x", "y", "z"]);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_duplicate_id_first_wins() {
        let first = rec("a", None, 1).with_name("First");
        let second = rec("a", None, 1).with_name("Second");
        let result = build(&[first, second]);

        assert_eq!(result.forest.len(), 1);
        assert_eq!(result.forest[0].record.name, "First");
        assert_eq!(result.count(WarningCode::DuplicateId), 1);
    }

    #[test]
    fn test_duplicate_edge_suppressed() {
        let result = build(&[
            rec("p", None, 1),
            rec("c", Some("p"), 2),
            rec("c", Some("p"), 2),
        ]);

        assert_eq!(result.forest[0].children.len(), 1);
        assert_eq!(result.count(WarningCode::DuplicateEdge), 1);
        assert_eq!(result.count(WarningCode::DuplicateId), 1);
        assert_eq!(result.node_count(), 2);
    }

    #[test]
    fn test_duplicate_with_other_parent_is_dropped() {
        let result = build(&[
            rec("p", None, 1),
            rec("q", None, 1),
            rec("c", Some("p"), 2),
            rec("c", Some("q"), 2),
        ]);
        let (p, _) = locate(&result.forest, "p").unwrap();
        let (q, _) = locate(&result.forest, "q").unwrap();
        assert_eq!(ids(&p.children), vec!["c"]);
        assert!(q.children.is_empty());
        assert_eq!(result.count(WarningCode::DuplicateEdge), 0);
    }

    #[test]
    fn test_sorted_by_level_then_name_at_every_depth() {
        let result = build(&[
            rec("z", None, 1).with_name("Zeta"),
            rec("a", None, 1).with_name("alpha"),
            rec("m", None, 1).with_name("Mu"),
            rec("c2", Some("m"), 3).with_name("Apple"),
            rec("c1", Some("m"), 2).with_name("Pear"),
            rec("c3", Some("m"), 2).with_name("Banana"),
            rec("g2", Some("c3"), 3).with_name("b"),
            rec("g1", Some("c3"), 3).with_name("B"),
        ]);

        // Case-sensitive: uppercase sorts before lowercase.
        assert_eq!(ids(&result.forest), vec!["m", "z", "a"]);
        let m = &result.forest[0];
        assert_eq!(ids(&m.children), vec!["c3", "c1", "c2"]);
        assert_eq!(ids(&m.children[0].children), vec!["g1", "g2"]);
    }

    #[test]
    fn test_level_disagreeing_with_depth_is_kept() {
        let result = build(&[rec("a", None, 1), rec("b", Some("a"), 4)]);
        assert_eq!(result.forest[0].children[0].record.level, 4);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_input_not_mutated_and_fields_pass_through() {
        let records = vec![
            rec("a", None, 1)
                .with_size("Size: 1,045,931")
                .with_type(CategoryType::Demographics),
            rec("b", Some("a"), 2),
        ];
        let before = records.clone();
        let result = build(&records);
        assert_eq!(records, before);
        assert_eq!(result.forest[0].record.size, "Size: 1,045,931");
        assert_eq!(
            result.forest[0].record.category_type,
            Some(CategoryType::Demographics)
        );
    }

    #[test]
    fn test_flatten_rewrites_realized_parents() {
        let result = build(&[rec("a", Some("b"), 2), rec("b", Some("a"), 2)]);
        let flat = flatten(&result.forest);
        assert_eq!(flat[0].id, "b");
        assert_eq!(flat[0].parent_id, None);
        assert_eq!(flat[1].id, "a");
        assert_eq!(flat[1].parent_id.as_deref(), Some("b"));

        let rebuilt = build(&flat);
        assert!(rebuilt.warnings.is_empty());
        assert_eq!(flatten(&rebuilt.forest), flat);
    }

    #[test]
    fn test_index_paths() {
        let result = build(&[
            rec("i", None, 1).with_name("Interests"),
            rec("f", Some("i"), 2).with_name("Fitness"),
            rec("y", Some("f"), 3).with_name("Yoga"),
        ]);
        let paths = index_paths(&result.forest);
        assert_eq!(paths["y"], vec!["Interests", "Fitness", "Yoga"]);
        assert_eq!(paths["i"], vec!["Interests"]);

        let (node, path) = locate(&result.forest, "f").unwrap();
        assert_eq!(ids(&node.children), vec!["y"]);
        assert_eq!(path, vec!["Interests", "Fitness"]);
        assert!(locate(&result.forest, "missing").is_none());
    }

    fn chain(len: usize) -> Vec<CategoryRecord> {
        (0..len)
            .map(|i| {
                let parent = (i > 0).then(|| format!("n{}", i - 1));
                CategoryRecord::new(format!("n{}", i), parent.as_deref(), 1)
            })
            .collect()
    }

    #[test]
    fn test_deep_chain_leaf_first() {
        let mut records = chain(100_000);
        records.reverse();
        let result = build(&records);

        assert!(result.warnings.is_empty());
        assert_eq!(ids(&result.forest), vec!["n0"]);
        assert_eq!(result.node_count(), 100_000);

        let flat = flatten(&result.forest);
        assert_eq!(flat.len(), 100_000);
        assert_eq!(flat[99_999].id, "n99999");
        assert_eq!(flat[99_999].parent_id.as_deref(), Some("n99998"));

        let (leaf, path) = locate(&result.forest, "n99999").unwrap();
        assert!(leaf.children.is_empty());
        assert_eq!(path.len(), 100_000);
    }

    #[test]
    fn test_deep_chain_root_first_and_closing_cycle() {
        let mut records = chain(100_000);
        records[0].parent_id = Some("n99999".to_string());
        let result = build(&records);

        // n0 goes first and attaches under n99999; the chain then closes the
        // loop at n99999, which becomes the root.
        assert_eq!(result.count(WarningCode::CycleDetected), 1);
        assert_eq!(result.warnings[0].id, "n99999");
        assert_eq!(ids(&result.forest), vec!["n99999"]);
        assert_eq!(result.node_count(), 100_000);
    }

    #[test]
    fn test_deep_orphan_chain() {
        let mut records = chain(100_000);
        records[0].parent_id = Some("missing".to_string());
        records[0].level = 2;
        let result = build(&records);

        assert!(result.forest.is_empty());
        assert_eq!(result.orphans.len(), 100_000);
        assert_eq!(result.orphans[0].id, "n0");
        assert_eq!(result.orphans[99_999].id, "n99999");
        assert_eq!(result.count(WarningCode::UnresolvableParent), 1);
    }

    #[test]
    fn test_blank_parent_reference_is_orphan() {
        let input = serde_json::json!([{"id": "x", "parentId": "", "level": 3}]);
        let records = crate::category::parse_records(&input).unwrap();
        let result = build(&records);

        assert!(result.forest.is_empty());
        assert_eq!(result.orphans.len(), 1);
        assert_eq!(result.orphans[0].id, "x");
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].code, WarningCode::UnresolvableParent);
    }

    #[test]
    fn test_whitespace_ids_stay_distinct() {
        let result = build(&[rec(" a", None, 1), rec("a", None, 1)]);
        assert!(result.warnings.is_empty());
        assert_eq!(result.node_count(), 2);
    }
}
