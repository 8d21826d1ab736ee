//! Inlining of small blocks and function bodies at their jump sites.
//!
//! A block is an inlining candidate if it starts at a tag, contains no other CSE-breaking item
//! than its last one, ends in a `JUMP` or a terminating instruction and does not push its own
//! tag. At a call site `PUSHTAG t JUMP` the body of `t` is copied in place of the jump if that
//! is cheaper:
//!
//! - function bodies (`JUMP [in]` into a block ending in `JUMP [out]`) are weighed by their
//!   execution cost over the expected number of runs against the additional code size;
//! - other blocks are only copied if they are not larger than the jump they replace.

use crate::{AssemblyItem, Instruction, JumpType, gas::GasMeter, semantic};
use alloy_primitives::U256;
use solgen_config::EvmVersion;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument};

/// Width of a code address assumed when estimating code size.
const ADDRESS_LENGTH: usize = 2;

#[derive(Debug)]
struct InlinableBlock {
    items: Vec<AssemblyItem>,
    push_tag_count: u64,
}

/// Inlines blocks at the sites that jump to them.
#[derive(Debug)]
pub struct Inliner<'a> {
    items: &'a mut Vec<AssemblyItem>,
    tags_referenced_from_outside: &'a BTreeSet<usize>,
    runs: usize,
    is_creation: bool,
    evm_version: EvmVersion,
}

impl<'a> Inliner<'a> {
    pub fn new(
        items: &'a mut Vec<AssemblyItem>,
        tags_referenced_from_outside: &'a BTreeSet<usize>,
        runs: usize,
        is_creation: bool,
        evm_version: EvmVersion,
    ) -> Self {
        Self { items, tags_referenced_from_outside, runs, is_creation, evm_version }
    }

    /// Inlines all profitable call sites. Returns the number of inlined sites.
    #[instrument(level = "debug", skip_all)]
    pub fn optimise(&mut self) -> usize {
        let mut inlinable = self.determine_inlinable_blocks();
        if inlinable.is_empty() {
            return 0;
        }

        let mut inlined = 0;
        let mut new_items = Vec::with_capacity(self.items.len());
        let mut iter = self.items.iter().peekable();
        while let Some(item) = iter.next() {
            if let Some(tag) = push_tag_of(item)
                && let Some(&jump) = iter.peek()
                && jump.is(Instruction::JUMP)
                && let Some(block) = inlinable.get(&tag)
                && let Some(exit) = self.should_inline(tag, jump, block)
            {
                let body = &block.items[..block.items.len() - 1];
                let pushed: Vec<usize> = body.iter().filter_map(push_tag_of).collect();
                let location = item.location();
                new_items.extend(body.iter().cloned().map(|mut item| {
                    if item.location().is_empty() {
                        item.set_location(location);
                    }
                    item
                }));
                new_items.push(exit);
                iter.next();
                inlined += 1;

                if let Some(block) = inlinable.get_mut(&tag) {
                    block.push_tag_count = block.push_tag_count.saturating_sub(1);
                }
                for pushed in pushed {
                    if let Some(block) = inlinable.get_mut(&pushed) {
                        block.push_tag_count += 1;
                    }
                }
                continue;
            }
            new_items.push(item.clone());
        }

        debug!(inlined, "inlined call sites");
        if inlined > 0 {
            *self.items = new_items;
        }
        inlined
    }

    /// Finds all blocks that are candidates for inlining, keyed by their tag.
    fn determine_inlinable_blocks(&self) -> BTreeMap<usize, InlinableBlock> {
        let mut push_counts = BTreeMap::<usize, u64>::new();
        let mut candidates = BTreeMap::new();
        let mut last_tag: Option<usize> = None;
        for (index, item) in self.items.iter().enumerate() {
            if let Some(tag) = push_tag_of(item) {
                *push_counts.entry(tag).or_default() += 1;
            }
            if let Some(tag_index) = last_tag
                && semantic::breaks_cse_analysis_block(item, false)
            {
                let tag = self.items[tag_index].tag_number();
                let block = &self.items[tag_index + 1..=index];
                if is_inline_candidate(tag, block) {
                    candidates.insert(tag, block.to_vec());
                }
                last_tag = None;
            }
            if item.is_tag() {
                last_tag = Some(index);
            }
        }

        candidates
            .into_iter()
            .filter_map(|(tag, items)| {
                let push_tag_count = *push_counts.get(&tag)?;
                Some((tag, InlinableBlock { items, push_tag_count }))
            })
            .collect()
    }

    /// Returns the exit item to use if `jump` to `block` should be replaced by its body.
    fn should_inline(
        &self,
        tag: usize,
        jump: &AssemblyItem,
        block: &InlinableBlock,
    ) -> Option<AssemblyItem> {
        let exit = block.items.last()?;
        if jump.jump_type() == JumpType::IntoFunction
            && exit.is(Instruction::JUMP)
            && exit.jump_type() == JumpType::OutOfFunction
        {
            if self.should_inline_full_function_body(tag, block) {
                return Some(exit.clone().with_jump_type(JumpType::Ordinary));
            }
            return None;
        }

        if jump.jump_type() == JumpType::Ordinary || semantic::terminates_control_flow(exit) {
            let jump_pattern =
                [AssemblyItem::push_tag(0), AssemblyItem::operation(Instruction::JUMP)];
            if self.data_gas(code_size(&block.items)) <= self.data_gas(code_size(&jump_pattern)) {
                return Some(exit.clone());
            }
        }
        None
    }

    /// Weighs the execution cost of calling a function against the code size of inlining it
    /// at every call site.
    fn should_inline_full_function_body(&self, tag: usize, block: &InlinableBlock) -> bool {
        let body = &block.items[..block.items.len() - 1];
        let body_size = code_size(body);
        let calls = U256::from(block.push_tag_count);

        let call_site_pattern = [
            AssemblyItem::push_tag(0),
            AssemblyItem::push_tag(0),
            AssemblyItem::operation(Instruction::JUMP),
            AssemblyItem::tag(0),
        ];
        let function_pattern =
            [AssemblyItem::tag(0), AssemblyItem::operation(Instruction::JUMP)];

        let uninlined_execution = calls.saturating_mul(
            self.execution_cost(&call_site_pattern)
                .saturating_add(self.execution_cost(&function_pattern)),
        );
        let uninlined_size = block
            .push_tag_count
            .saturating_mul(code_size(&call_site_pattern))
            .saturating_add(code_size(&function_pattern))
            .saturating_add(body_size);
        let uninlined_deposit = self.data_gas(uninlined_size);

        let mut inlined_deposit = self.data_gas(block.push_tag_count.saturating_mul(body_size));
        if self.tags_referenced_from_outside.contains(&tag) {
            inlined_deposit = inlined_deposit
                .saturating_add(self.data_gas(code_size(&function_pattern) + body_size));
        }

        U256::from(self.runs).saturating_mul(uninlined_execution).saturating_add(uninlined_deposit)
            > inlined_deposit
    }

    fn execution_cost(&self, items: &[AssemblyItem]) -> U256 {
        let gas = GasMeter::new(self.evm_version).estimate_items(items, false);
        if gas.is_infinite { U256::MAX } else { gas.value }
    }

    fn data_gas(&self, size: u64) -> U256 {
        crate::gas::GasCosts::new(self.evm_version).data_gas_for_size(size, self.is_creation)
    }
}

/// A block can be inlined if it ends in a jump or terminates, and does not push its own tag.
fn is_inline_candidate(tag: usize, block: &[AssemblyItem]) -> bool {
    let Some(last) = block.last() else { return false };
    if !(last.is(Instruction::JUMP) || semantic::terminates_control_flow(last)) {
        return false;
    }
    !block.iter().any(|item| push_tag_of(item) == Some(tag))
}

fn code_size(items: &[AssemblyItem]) -> u64 {
    items.iter().map(|item| item.bytes_required(ADDRESS_LENGTH) as u64).sum()
}

/// Returns the tag of a local `PUSHTAG`.
fn push_tag_of(item: &AssemblyItem) -> Option<usize> {
    if !item.is_push_tag() {
        return None;
    }
    match item.split_foreign_push_tag() {
        (None, tag) => Some(tag),
        (Some(_), _) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(instruction: Instruction) -> AssemblyItem {
        AssemblyItem::operation(instruction)
    }

    fn run(items: &mut Vec<AssemblyItem>, runs: usize) -> usize {
        let outside = BTreeSet::new();
        Inliner::new(items, &outside, runs, false, EvmVersion::default()).optimise()
    }

    #[test]
    fn test_inline_function_body() {
        let mut items = vec![
            AssemblyItem::push_tag(1),
            AssemblyItem::push_tag(2),
            op(Instruction::JUMP).with_jump_type(JumpType::IntoFunction),
            AssemblyItem::tag(1),
            op(Instruction::STOP),
            AssemblyItem::tag(2),
            op(Instruction::CALLVALUE),
            op(Instruction::SWAP1),
            op(Instruction::JUMP).with_jump_type(JumpType::OutOfFunction),
        ];
        assert_eq!(run(&mut items, 200), 1);
        assert_eq!(
            items,
            vec![
                AssemblyItem::push_tag(1),
                op(Instruction::CALLVALUE),
                op(Instruction::SWAP1),
                op(Instruction::JUMP),
                AssemblyItem::tag(1),
                op(Instruction::STOP),
                AssemblyItem::tag(2),
                op(Instruction::CALLVALUE),
                op(Instruction::SWAP1),
                op(Instruction::JUMP),
            ]
        );
        assert_eq!(items[3].jump_type(), JumpType::Ordinary);
        assert_eq!(items[9].jump_type(), JumpType::OutOfFunction);
    }

    #[test]
    fn test_inline_small_terminating_block() {
        let mut items = vec![
            op(Instruction::CALLVALUE),
            AssemblyItem::push_tag(1),
            op(Instruction::JUMPI),
            AssemblyItem::push_tag(2),
            op(Instruction::JUMP),
            AssemblyItem::tag(1),
            op(Instruction::STOP),
            AssemblyItem::tag(2),
            op(Instruction::INVALID),
        ];
        assert_eq!(run(&mut items, 200), 1);
        assert_eq!(&items[3..5], &[op(Instruction::INVALID), AssemblyItem::tag(1)]);
    }

    #[test]
    fn test_large_block_not_inlined_for_ordinary_jump() {
        let mut items = vec![
            AssemblyItem::push_tag(1),
            op(Instruction::JUMP),
            AssemblyItem::tag(1),
            AssemblyItem::push(0x1234_5678u64),
            AssemblyItem::push(0u64),
            op(Instruction::RETURN),
        ];
        let before = items.clone();
        assert_eq!(run(&mut items, 200), 0);
        assert_eq!(items, before);
    }

    #[test]
    fn test_self_referencing_block_not_inlined() {
        let mut items = vec![
            AssemblyItem::push_tag(1),
            op(Instruction::JUMP),
            AssemblyItem::tag(1),
            AssemblyItem::push_tag(1),
            op(Instruction::JUMP),
        ];
        let before = items.clone();
        assert_eq!(run(&mut items, 200), 0);
        assert_eq!(items, before);
    }

    #[test]
    fn test_function_not_inlined_without_runs() {
        let body = [
            AssemblyItem::push(0x1111_1111_1111_1111u64),
            op(Instruction::SLOAD),
            AssemblyItem::push(0x2222_2222_2222_2222u64),
            op(Instruction::SSTORE),
        ];
        let mut items = Vec::new();
        for ret in 10..13 {
            items.push(AssemblyItem::push_tag(ret));
            items.push(AssemblyItem::push_tag(1));
            items.push(op(Instruction::JUMP).with_jump_type(JumpType::IntoFunction));
            items.push(AssemblyItem::tag(ret));
        }
        items.push(op(Instruction::STOP));
        items.push(AssemblyItem::tag(1));
        items.extend(body);
        items.push(op(Instruction::JUMP).with_jump_type(JumpType::OutOfFunction));

        // Without runs, copying the body to every call site costs more deposit than calling it.
        let before = items.clone();
        assert_eq!(run(&mut items, 0), 0);
        assert_eq!(items, before);
    }
}
