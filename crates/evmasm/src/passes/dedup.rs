//! Unification of blocks with identical code.
//!
//! The code of a block is everything after its tag up to and including the first item that
//! alters control flow (other than `JUMPI`); tags in between are skipped, so falling through
//! into another block is part of the comparison. Pushes of a block's own tag are replaced by a
//! marker, so loops that only differ in their own tag compare equal.
//!
//! All pushes of a duplicate tag are redirected to the first block with the same code. The
//! duplicate itself is left in place for the other passes to remove.

use crate::{AssemblyItem, Instruction, semantic};
use alloy_primitives::U256;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

/// Tag number standing for "the tag of the current block".
const SELF_TAG: U256 = U256::from_limbs([u64::MAX - 3, u64::MAX, u64::MAX, u64::MAX]);

/// Finds blocks with identical code and redirects the jumps to them.
#[derive(Debug)]
pub struct BlockDeduplicator<'a> {
    items: &'a mut Vec<AssemblyItem>,
    replaced_tags: BTreeMap<usize, usize>,
}

impl<'a> BlockDeduplicator<'a> {
    pub fn new(items: &'a mut Vec<AssemblyItem>) -> Self {
        Self { items, replaced_tags: BTreeMap::new() }
    }

    /// Redirects pushes of duplicate blocks to their first occurrence, until no more
    /// duplicates are found. Returns `true` if any push was changed.
    #[instrument(level = "debug", skip_all)]
    pub fn deduplicate(&mut self) -> bool {
        if self
            .items
            .iter()
            .any(|item| (item.is_tag() || item.is_push_tag()) && item.data() == SELF_TAG)
        {
            return false;
        }

        let mut iterations = 0;
        loop {
            let mut blocks_seen = FxHashMap::<Vec<AssemblyItem>, usize>::default();
            for (index, item) in self.items.iter().enumerate() {
                if !item.is_tag() {
                    continue;
                }
                let tag = item.tag_number();
                let code = self.block_code(index);
                match blocks_seen.get(&code) {
                    Some(&canonical) => {
                        self.replaced_tags.insert(tag, canonical);
                    }
                    None => {
                        blocks_seen.insert(code, tag);
                    }
                }
            }
            if !apply_tag_replacement(self.items, &self.replaced_tags, None) {
                break;
            }
            iterations += 1;
        }
        debug!(iterations, replaced = self.replaced_tags.len(), "deduplicated blocks");
        iterations > 0
    }

    /// Maps every duplicate tag to the tag it was unified with.
    #[inline]
    pub fn replaced_tags(&self) -> &BTreeMap<usize, usize> {
        &self.replaced_tags
    }

    /// Returns the code of the block starting with the tag at `start`.
    fn block_code(&self, start: usize) -> Vec<AssemblyItem> {
        let own_push = self.items[start].to_push_tag();
        let marker = AssemblyItem::new(crate::ItemKind::PushTag, SELF_TAG);
        let mut code = Vec::new();
        for item in &self.items[start + 1..] {
            if item.is_tag() {
                continue;
            }
            code.push(if *item == own_push { marker.clone() } else { item.clone() });
            if semantic::alters_control_flow(item) && !item.is(Instruction::JUMPI) {
                break;
            }
        }
        code
    }
}

/// Redirects the `PUSHTAG`s of `sub_id` in `items` according to `replacements`, following
/// chains of replacements. Returns `true` if any item changed.
pub fn apply_tag_replacement(
    items: &mut [AssemblyItem],
    replacements: &BTreeMap<usize, usize>,
    sub_id: Option<usize>,
) -> bool {
    let mut changed = false;
    for item in items.iter_mut().filter(|item| item.is_push_tag()) {
        let (sub, tag) = item.split_foreign_push_tag();
        if sub != sub_id {
            continue;
        }
        let mut target = tag;
        // Replacements always point to an earlier block, so chains are bounded by their count.
        for _ in 0..=replacements.len() {
            match replacements.get(&target) {
                Some(&next) if next != target => target = next,
                _ => break,
            }
        }
        if target != tag {
            item.set_push_tag_sub_id_and_tag(sub, target);
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(instruction: Instruction) -> AssemblyItem {
        AssemblyItem::operation(instruction)
    }

    #[test]
    fn test_identical_blocks_unified() {
        let mut items = vec![
            AssemblyItem::push_tag(1),
            AssemblyItem::push_tag(2),
            op(Instruction::JUMPI),
            AssemblyItem::push_tag(3),
            op(Instruction::JUMP),
            AssemblyItem::tag(1),
            op(Instruction::CALLVALUE),
            op(Instruction::STOP),
            AssemblyItem::tag(2),
            op(Instruction::CALLVALUE),
            op(Instruction::STOP),
            AssemblyItem::tag(3),
            op(Instruction::CALLER),
            op(Instruction::STOP),
        ];
        let mut dedup = BlockDeduplicator::new(&mut items);
        assert!(dedup.deduplicate());
        assert_eq!(dedup.replaced_tags(), &BTreeMap::from([(2, 1)]));
        assert_eq!(items[1], AssemblyItem::push_tag(1));
        assert_eq!(items[3], AssemblyItem::push_tag(3));
    }

    #[test]
    fn test_loops_unified() {
        let mut items = vec![
            AssemblyItem::push_tag(1),
            AssemblyItem::push_tag(2),
            op(Instruction::JUMPI),
            AssemblyItem::tag(1),
            op(Instruction::CALLVALUE),
            AssemblyItem::push_tag(1),
            op(Instruction::JUMPI),
            op(Instruction::STOP),
            AssemblyItem::tag(2),
            op(Instruction::CALLVALUE),
            AssemblyItem::push_tag(2),
            op(Instruction::JUMPI),
            op(Instruction::STOP),
        ];
        let mut dedup = BlockDeduplicator::new(&mut items);
        assert!(dedup.deduplicate());
        assert_eq!(dedup.replaced_tags(), &BTreeMap::from([(2, 1)]));
        assert_eq!(items[1], AssemblyItem::push_tag(1));
        assert_eq!(items[10], AssemblyItem::push_tag(1));
    }

    #[test]
    fn test_different_blocks_kept() {
        let mut items = vec![
            AssemblyItem::push_tag(1),
            AssemblyItem::push_tag(2),
            op(Instruction::JUMPI),
            AssemblyItem::tag(1),
            AssemblyItem::push(1u64),
            AssemblyItem::assign_immutable(U256::from(1)),
            op(Instruction::STOP),
            AssemblyItem::tag(2),
            AssemblyItem::push(1u64),
            AssemblyItem::assign_immutable(U256::from(2)),
            op(Instruction::STOP),
        ];
        let before = items.clone();
        assert!(!BlockDeduplicator::new(&mut items).deduplicate());
        assert_eq!(items, before);
    }

    #[test]
    fn test_marker_in_code_aborts() {
        let mut items = vec![
            AssemblyItem::new(crate::ItemKind::PushTag, SELF_TAG),
            AssemblyItem::tag(1),
            op(Instruction::STOP),
            AssemblyItem::tag(2),
            op(Instruction::STOP),
        ];
        assert!(!BlockDeduplicator::new(&mut items).deduplicate());
    }

    #[test]
    fn test_replacement_chains() {
        let mut foreign = AssemblyItem::push_tag(0);
        foreign.set_push_tag_sub_id_and_tag(Some(1), 5);
        let mut items = vec![AssemblyItem::push_tag(5), foreign];
        let replacements = BTreeMap::from([(5, 4), (4, 2)]);

        assert!(apply_tag_replacement(&mut items, &replacements, Some(1)));
        assert_eq!(items[0], AssemblyItem::push_tag(5));
        assert_eq!(items[1].split_foreign_push_tag(), (Some(1), 2));

        assert!(apply_tag_replacement(&mut items, &replacements, None));
        assert_eq!(items[0], AssemblyItem::push_tag(2));
        assert!(!apply_tag_replacement(&mut items, &replacements, None));
    }
}
