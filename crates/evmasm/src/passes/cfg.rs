//! Basic-block graph of an item list and removal of unreachable blocks.
//!
//! The items are split into basic blocks at tags and at control-flow altering items. Blocks
//! are kept if they are reachable from the first block through fall-through or through a tag
//! pushed in a kept block. A block that ends in `PUSHTAG t JUMP` is linked directly to the
//! block of `t` if no other block falls through into it, which removes the jump when the code
//! is rebuilt.
//!
//! Knowledge about the machine state is then propagated along the edges to find the targets
//! of jumps; blocks that are never entered are dropped as well.

use crate::{
    AssemblyItem, Instruction, OptimiserError,
    analysis::{ExpressionClasses, KnownState},
    semantic,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument};

type Result<T, E = OptimiserError> = std::result::Result<T, E>;

/// Identifier of a basic block: the number of its tag, or a generated number for blocks that
/// do not start with a tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(u32);

impl BlockId {
    /// The block at the start of the code.
    pub const INITIAL: Self = Self(u32::MAX - 1);

    fn from_tag(tag: usize) -> Result<Self> {
        match u32::try_from(tag) {
            Ok(id) if id < Self::INITIAL.0 => Ok(Self(id)),
            _ => Err(OptimiserError::Invariant("tag number too large")),
        }
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }
}

/// How a basic block ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlockEnd {
    /// Execution continues with the next block.
    #[default]
    Handover,
    Jump,
    Jumpi,
    Stop,
}

/// A range of items with a single entry and a single exit.
#[derive(Clone, Debug, Default)]
pub struct BasicBlock {
    /// Index of the first item.
    pub begin: usize,
    /// Index one past the last item.
    pub end: usize,
    /// Tags pushed inside the block.
    pub pushed_tags: Vec<BlockId>,
    pub end_type: BlockEnd,
    /// The block that is executed after this one for [`BlockEnd::Handover`] and the
    /// fall-through of [`BlockEnd::Jumpi`].
    pub next: Option<BlockId>,
    /// The block that hands over to this one.
    pub prev: Option<BlockId>,
    /// Knowledge at the start of the block, joined over all predecessors.
    pub start_state: Option<KnownState>,
    /// Knowledge at the end of the block.
    pub end_state: Option<KnownState>,
}

struct WorkItem {
    block: BlockId,
    state: KnownState,
    blocks_seen: BTreeSet<BlockId>,
}

/// Control-flow graph of a list of items.
pub struct ControlFlowGraph<'a> {
    items: &'a [AssemblyItem],
    /// Join the knowledge of all predecessors instead of resetting it at join points.
    join_knowledge: bool,
    blocks: BTreeMap<BlockId, BasicBlock>,
    last_used_id: u32,
    classes: ExpressionClasses,
}

impl<'a> ControlFlowGraph<'a> {
    pub fn new(items: &'a [AssemblyItem], join_knowledge: bool) -> Self {
        Self {
            items,
            join_knowledge,
            blocks: BTreeMap::new(),
            last_used_id: 0,
            classes: ExpressionClasses::new(),
        }
    }

    /// The expression classes the block states refer to.
    #[inline]
    pub fn classes(&self) -> &ExpressionClasses {
        &self.classes
    }

    /// Returns the kept basic blocks in the order in which they should be emitted.
    ///
    /// Items outside of the returned ranges are unreachable.
    #[instrument(name = "cfg", level = "debug", skip_all)]
    pub fn optimise(&mut self) -> Result<Vec<BasicBlock>> {
        if self.items.is_empty() {
            return Ok(Vec::new());
        }
        self.find_largest_tag()?;
        self.split_blocks()?;
        self.resolve_next_links()?;
        self.remove_unused_blocks();
        self.set_prev_links()?;
        self.gather_knowledge()?;
        let blocks = self.rebuild_code();
        debug!(blocks = blocks.len(), "rebuilt control-flow graph");
        Ok(blocks)
    }

    fn find_largest_tag(&mut self) -> Result<()> {
        self.last_used_id = 0;
        for item in self.items {
            if let Some(tag) = local_tag(item) {
                self.last_used_id = self.last_used_id.max(BlockId::from_tag(tag)?.0);
            }
        }
        Ok(())
    }

    fn generate_new_id(&mut self) -> Result<BlockId> {
        self.last_used_id += 1;
        if self.last_used_id >= BlockId::INITIAL.0 {
            return Err(OptimiserError::Invariant("out of block ids"));
        }
        Ok(BlockId(self.last_used_id))
    }

    fn split_blocks(&mut self) -> Result<()> {
        self.blocks.clear();
        let mut current = Some(BlockId::INITIAL);
        self.blocks.entry(BlockId::INITIAL).or_default().begin = 0;

        let items = self.items;
        for (index, item) in items.iter().enumerate() {
            if item.is_tag() {
                if let Some(id) = current {
                    self.block_mut(id).end = index;
                }
                current = None;
            }
            let id = match current {
                Some(id) => id,
                None => {
                    let id = if item.is_tag() {
                        BlockId::from_tag(item.tag_number())?
                    } else {
                        self.generate_new_id()?
                    };
                    self.block_mut(id).begin = index;
                    id
                }
            };
            current = Some(id);

            if item.is_push_tag()
                && let Some(tag) = local_tag(item)
            {
                let tag = BlockId::from_tag(tag)?;
                self.block_mut(id).pushed_tags.push(tag);
            }
            if semantic::alters_control_flow(item) {
                let block = self.block_mut(id);
                block.end = index + 1;
                block.end_type = if item.is(Instruction::JUMP) {
                    BlockEnd::Jump
                } else if item.is(Instruction::JUMPI) {
                    BlockEnd::Jumpi
                } else {
                    BlockEnd::Stop
                };
                current = None;
            }
        }

        if let Some(id) = current {
            let end = items.len();
            let block = self.block_mut(id);
            block.end = end;
            if block.end_type == BlockEnd::Handover {
                block.end_type = BlockEnd::Stop;
            }
        }
        Ok(())
    }

    fn resolve_next_links(&mut self) -> Result<()> {
        let block_by_begin: BTreeMap<usize, BlockId> = self
            .blocks
            .iter()
            .filter(|(_, block)| block.begin != block.end)
            .map(|(&id, block)| (block.begin, id))
            .collect();
        for block in self.blocks.values_mut() {
            if matches!(block.end_type, BlockEnd::Jumpi | BlockEnd::Handover) {
                let next = block_by_begin
                    .get(&block.end)
                    .ok_or(OptimiserError::Invariant("successor block not found"))?;
                block.next = Some(*next);
            }
        }
        Ok(())
    }

    fn remove_unused_blocks(&mut self) {
        let mut to_process = vec![BlockId::INITIAL];
        let mut needed = BTreeSet::from([BlockId::INITIAL]);
        while let Some(id) = to_process.pop() {
            let Some(block) = self.blocks.get(&id) else { continue };
            for &tag in &block.pushed_tags {
                if self.blocks.contains_key(&tag) && needed.insert(tag) {
                    to_process.push(tag);
                }
            }
            if let Some(next) = block.next
                && needed.insert(next)
            {
                to_process.push(next);
            }
        }
        self.blocks.retain(|id, _| needed.contains(id));
    }

    fn set_prev_links(&mut self) -> Result<()> {
        let handovers: Vec<(BlockId, BlockId)> = self
            .blocks
            .iter()
            .filter(|(_, block)| matches!(block.end_type, BlockEnd::Jumpi | BlockEnd::Handover))
            .filter_map(|(&id, block)| Some((id, block.next?)))
            .collect();
        for (id, next) in handovers {
            let next = self
                .blocks
                .get_mut(&next)
                .ok_or(OptimiserError::Invariant("successor block not found"))?;
            if next.prev.is_some() {
                return Err(OptimiserError::Invariant("successor already has a predecessor"));
            }
            next.prev = Some(id);
        }

        // Link blocks ending in a jump to a block that has no predecessor yet.
        let ids: Vec<BlockId> = self.blocks.keys().copied().collect();
        for block_id in ids {
            let block = &self.blocks[&block_id];
            if block.end_type != BlockEnd::Jump || block.end - block.begin < 2 {
                continue;
            }
            let push = &self.items[block.end - 2];
            if !push.is_push_tag() {
                continue;
            }
            let Some(tag) = local_tag(push) else { continue };
            let next_id = BlockId::from_tag(tag)?;
            match self.blocks.get(&next_id) {
                Some(next) if next.prev.is_none() => {}
                _ => continue,
            }
            let mut has_loop = false;
            let mut cursor = Some(next_id);
            while let Some(id) = cursor
                && !has_loop
            {
                has_loop = id == block_id;
                cursor = self.blocks.get(&id).and_then(|block| block.next);
            }
            if has_loop {
                continue;
            }

            self.block_mut(next_id).prev = Some(block_id);
            let block = self.block_mut(block_id);
            block.next = Some(next_id);
            block.end -= 2;
            if block.pushed_tags.last() != Some(&next_id) {
                return Err(OptimiserError::Invariant("last pushed tag not at end of pushed list"));
            }
            block.pushed_tags.pop();
            block.end_type = BlockEnd::Handover;
        }
        Ok(())
    }

    fn gather_knowledge(&mut self) -> Result<()> {
        let items = self.items;
        let mut unknown_jump_encountered = false;
        let mut queue = vec![WorkItem {
            block: BlockId::INITIAL,
            state: KnownState::new(),
            blocks_seen: BTreeSet::new(),
        }];
        let follow = |item: &WorkItem, to: BlockId, state: &KnownState| {
            let mut blocks_seen = item.blocks_seen.clone();
            blocks_seen.insert(item.block);
            WorkItem { block: to, state: state.clone(), blocks_seen }
        };

        while let Some(item) = queue.pop() {
            // Unknown tags are probably invalid jumps.
            let Some(block) = self.blocks.get(&item.block) else { continue };
            let (begin, end, end_type, next) = (block.begin, block.end, block.end_type, block.next);

            let mut state = item.state.clone();
            if let Some(start) = &block.start_state {
                // Joining even without `join_knowledge` gets the sequence number right.
                if !self.join_knowledge {
                    state.reset();
                }
                let first_visit = !item.blocks_seen.contains(&item.block);
                state.reduce_to_common_knowledge(&mut self.classes, start, first_visit);
                if state == *start {
                    continue;
                }
            }
            self.block_mut(item.block).start_state = Some(state.clone());

            // The final jump is fed separately since it removes the target from the stack.
            let mut pc = begin;
            while pc < end && !semantic::alters_control_flow(&items[pc]) {
                state.feed_item(&mut self.classes, &items[pc]);
                pc += 1;
            }

            if matches!(end_type, BlockEnd::Jump | BlockEnd::Jumpi) {
                if !(begin <= pc && pc + 1 == end) {
                    return Err(OptimiserError::Invariant("jump is not at the end of its block"));
                }
                let target = state.relative_stack_element(&mut self.classes, 0);
                let tags = state.tags_in_expression(&self.classes, target);
                state.feed_item(&mut self.classes, &items[pc]);
                pc += 1;
                if tags.is_empty() {
                    if !unknown_jump_encountered {
                        // Any tag can be the target, so all of them start from scratch.
                        unknown_jump_encountered = true;
                        for (&id, block) in &self.blocks {
                            if block.begin < block.end && items[block.begin].is_tag() {
                                queue.push(WorkItem {
                                    block: id,
                                    state: KnownState::new(),
                                    blocks_seen: BTreeSet::new(),
                                });
                            }
                        }
                    }
                } else {
                    for tag in tags {
                        // Foreign tags are never jump targets.
                        let Some(to) = usize::try_from(tag).ok().and_then(|t| BlockId::from_tag(t).ok())
                        else {
                            continue;
                        };
                        queue.push(follow(&item, to, &state));
                    }
                }
            } else if begin <= pc && pc < end {
                state.feed_item(&mut self.classes, &items[pc]);
                pc += 1;
            }
            if !(end <= begin || pc == end) {
                return Err(OptimiserError::Invariant("block not fully processed"));
            }

            if matches!(end_type, BlockEnd::Handover | BlockEnd::Jumpi)
                && let Some(next) = next
            {
                queue.push(follow(&item, next, &state));
            }
            self.block_mut(item.block).end_state = Some(state);
        }

        // Blocks that are never entered are dropped, unless a kept block still pushes their tag.
        let mut kept: BTreeSet<BlockId> = self
            .blocks
            .iter()
            .filter(|(_, block)| block.start_state.is_some())
            .map(|(&id, _)| id)
            .collect();
        let mut pending: Vec<BlockId> = kept.iter().copied().collect();
        while let Some(id) = pending.pop() {
            let Some(block) = self.blocks.get(&id) else { continue };
            let falls_through = matches!(block.end_type, BlockEnd::Handover | BlockEnd::Jumpi);
            let next = block.next.filter(|_| falls_through);
            let successors = block.pushed_tags.iter().copied().chain(next);
            for successor in successors {
                if self.blocks.contains_key(&successor) && kept.insert(successor) {
                    pending.push(successor);
                }
            }
        }
        self.blocks.retain(|id, _| kept.contains(id));
        Ok(())
    }

    fn rebuild_code(&mut self) -> Vec<BasicBlock> {
        let mut pushes: BTreeMap<BlockId, usize> = BTreeMap::new();
        for block in self.blocks.values() {
            for tag in &block.pushed_tags {
                if self.blocks.contains_key(tag) {
                    *pushes.entry(*tag).or_default() += 1;
                }
            }
        }

        let mut to_add: BTreeSet<BlockId> = self.blocks.keys().copied().collect();
        let mut blocks = Vec::new();
        let mut chain_start = self.blocks.contains_key(&BlockId::INITIAL).then_some(BlockId::INITIAL);
        if chain_start.is_none() {
            chain_start = to_add.first().copied();
        }

        while let Some(mut id) = chain_start {
            let mut previous_handed_over = id == BlockId::INITIAL;
            while let Some(prev) = self.blocks.get(&id).and_then(|block| block.prev)
                && self.blocks.contains_key(&prev)
            {
                id = prev;
            }

            let mut cursor = Some(id);
            while let Some(id) = cursor {
                let Some(block) = self.blocks.get_mut(&id) else { break };
                to_add.remove(&id);
                cursor = block.next;
                if block.begin == block.end {
                    continue;
                }
                // Drop the tag if it is only reached by falling through.
                if previous_handed_over
                    && pushes.get(&id).copied().unwrap_or_default() == 0
                    && self.items[block.begin].is_tag()
                {
                    block.begin += 1;
                }
                if block.begin < block.end {
                    let mut kept = block.clone();
                    if let Some(state) = &mut kept.start_state {
                        state.clear_tag_unions();
                    }
                    if let Some(state) = &mut kept.end_state {
                        state.clear_tag_unions();
                    }
                    blocks.push(kept);
                }
                previous_handed_over = block.end_type == BlockEnd::Handover;
            }
            chain_start = to_add.first().copied();
        }
        blocks
    }

    fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        self.blocks.entry(id).or_default()
    }
}

/// The tag number of a `Tag` or of a `PushTag` into this assembly.
fn local_tag(item: &AssemblyItem) -> Option<usize> {
    if item.is_tag() {
        return Some(item.tag_number());
    }
    if item.is_push_tag() {
        let (sub, tag) = item.split_foreign_push_tag();
        return sub.is_none().then_some(tag);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AssemblyItem as Item;

    fn op(instruction: Instruction) -> Item {
        Item::operation(instruction)
    }

    fn ranges(items: &[Item]) -> Vec<(usize, usize)> {
        let mut cfg = ControlFlowGraph::new(items, true);
        cfg.optimise().unwrap().iter().map(|block| (block.begin, block.end)).collect()
    }

    #[test]
    fn test_empty() {
        assert!(ranges(&[]).is_empty());
    }

    #[test]
    fn test_unreachable_block_removed() {
        let items = [
            Item::push(1u64),
            op(Instruction::STOP),
            Item::tag(2),
            Item::push(2u64),
            op(Instruction::STOP),
        ];
        assert_eq!(ranges(&items), [(0, 2)]);
    }

    #[test]
    fn test_jump_merged_and_dead_code_removed() {
        let items = [
            Item::push_tag(1),
            Item::push_tag(1),
            op(Instruction::JUMP),
            Item::push(5u64),
            op(Instruction::POP),
            Item::tag(1),
            op(Instruction::STOP),
        ];
        // `PUSHTAG 1`, then the block of tag 1 which is still referenced.
        assert_eq!(ranges(&items), [(0, 1), (5, 7)]);
    }

    #[test]
    fn test_unreferenced_fallthrough_tag_dropped() {
        let items = [Item::push(1u64), Item::tag(3), op(Instruction::STOP)];
        assert_eq!(ranges(&items), [(0, 1), (2, 3)]);
    }

    #[test]
    fn test_loop_kept() {
        let items = [Item::tag(1), Item::push_tag(1), op(Instruction::JUMP)];
        assert_eq!(ranges(&items), [(0, 3)]);
    }

    #[test]
    fn test_pushed_tag_without_jump_kept() {
        let items = [
            Item::push_tag(1),
            Item::push(0u64),
            op(Instruction::SSTORE),
            op(Instruction::STOP),
            Item::tag(1),
            op(Instruction::CALLER),
            Item::push(0u64),
            op(Instruction::SSTORE),
            op(Instruction::STOP),
        ];
        let mut cfg = ControlFlowGraph::new(&items, true);
        let blocks = cfg.optimise().unwrap();
        let ranges: Vec<_> = blocks.iter().map(|block| (block.begin, block.end)).collect();
        assert_eq!(ranges, [(0, 4), (4, 9)]);
        assert!(blocks[1].start_state.is_none());
    }

    #[test]
    fn test_conditional_jump_targets_kept() {
        let items = [
            op(Instruction::CALLVALUE),
            Item::push_tag(2),
            op(Instruction::JUMPI),
            op(Instruction::STOP),
            Item::tag(2),
            Item::push(0u64),
            Item::push(0u64),
            op(Instruction::REVERT),
        ];
        let mut cfg = ControlFlowGraph::new(&items, true);
        let blocks = cfg.optimise().unwrap();
        let ranges: Vec<_> = blocks.iter().map(|block| (block.begin, block.end)).collect();
        assert_eq!(ranges, [(0, 3), (3, 4), (4, 8)]);
        assert!(blocks.iter().all(|block| block.start_state.is_some()));
    }
}
