//! The assembly container: items, sub-assemblies and data, plus the optimiser driver.

use crate::{
    AssemblyItem, Instruction, JumpType, OptimiserError, OptimiserSettings, SourceLocation,
    analysis::{ExpressionClasses, KnownState},
    gas::GasCosts,
    passes::{
        BlockDeduplicator, CommonSubexpressionEliminator, ConstantOptimiser, ControlFlowGraph,
        Inliner, JumpdestRemover, PeepholeOptimiser, apply_tag_replacement, referenced_tags,
    },
};
use alloy_primitives::{U256, hex, keccak256};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};
use tracing::{debug, instrument, trace};

mod assembler;
pub use assembler::LinkerObject;

/// A list of assembly items together with the sub-assemblies and data they refer to.
///
/// Tags are allocated per assembly; `PUSHTAG`s into a sub-assembly carry the sub id.
#[derive(Clone, Debug)]
pub struct Assembly {
    items: Vec<AssemblyItem>,
    subs: Vec<Assembly>,
    data: BTreeMap<U256, Vec<u8>>,
    auxiliary_data: Vec<u8>,
    /// Number of allocated tags. Tag `0` is never handed out.
    used_tags: usize,
    /// Current stack height relative to the start.
    deposit: i32,
    current_location: SourceLocation,
}

impl Default for Assembly {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembly {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            subs: Vec::new(),
            data: BTreeMap::new(),
            auxiliary_data: Vec::new(),
            used_tags: 1,
            deposit: 0,
            current_location: SourceLocation::default(),
        }
    }

    #[inline]
    pub fn items(&self) -> &[AssemblyItem] {
        &self.items
    }

    #[inline]
    pub fn items_mut(&mut self) -> &mut Vec<AssemblyItem> {
        &mut self.items
    }

    #[inline]
    pub fn subs(&self) -> &[Self] {
        &self.subs
    }

    #[inline]
    pub fn sub(&self, id: usize) -> Option<&Self> {
        self.subs.get(id)
    }

    #[inline]
    pub fn sub_mut(&mut self, id: usize) -> Option<&mut Self> {
        self.subs.get_mut(id)
    }

    /// Returns the data blob pushed by a `PUSHDATA` of `hash`.
    pub fn data(&self, hash: U256) -> Option<&[u8]> {
        self.data.get(&hash).map(Vec::as_slice)
    }

    /// Allocates a new tag and returns the `Tag` item for it.
    pub fn new_tag(&mut self) -> AssemblyItem {
        let tag = self.used_tags;
        self.used_tags += 1;
        AssemblyItem::tag(tag)
    }

    /// Allocates a new tag and returns the `PUSHTAG` item for it.
    pub fn new_push_tag(&mut self) -> AssemblyItem {
        self.new_tag().to_push_tag()
    }

    /// Number of tags allocated so far.
    #[inline]
    pub fn used_tags(&self) -> usize {
        self.used_tags
    }

    /// Sets the location assigned to appended items that have none.
    pub fn set_source_location(&mut self, location: SourceLocation) {
        self.current_location = location;
    }

    /// Appends an item and updates the stack height.
    pub fn append(&mut self, item: impl Into<AssemblyItem>) -> &AssemblyItem {
        let mut item = item.into();
        self.deposit += item.deposit();
        if item.location().is_empty() {
            item.set_location(self.current_location);
        }
        self.items.push(item);
        &self.items[self.items.len() - 1]
    }

    /// Appends `PUSHTAG tag JUMP`.
    pub fn append_jump(&mut self, tag: &AssemblyItem, jump_type: JumpType) {
        self.append(tag.to_push_tag());
        self.append(AssemblyItem::operation(Instruction::JUMP).with_jump_type(jump_type));
    }

    /// Appends `PUSHTAG tag JUMPI`.
    pub fn append_jumpi(&mut self, tag: &AssemblyItem) {
        self.append(tag.to_push_tag());
        self.append(Instruction::JUMPI);
    }

    /// Adds a sub-assembly and returns the `PUSHSUB` item referring to it.
    pub fn new_sub(&mut self, sub: Self) -> AssemblyItem {
        self.subs.push(sub);
        AssemblyItem::push_sub(self.subs.len() - 1)
    }

    /// Adds a sub-assembly and appends a push of its offset.
    pub fn append_sub(&mut self, sub: Self) -> &AssemblyItem {
        let item = self.new_sub(sub);
        self.append(item)
    }

    /// Adds a data blob and returns the `PUSHDATA` item referring to it.
    pub fn new_data(&mut self, data: Vec<u8>) -> AssemblyItem {
        let hash = U256::from_be_bytes(keccak256(&data).0);
        self.data.insert(hash, data);
        AssemblyItem::push_data(hash)
    }

    /// Adds a data blob and appends a push of its offset.
    pub fn append_data(&mut self, data: Vec<u8>) -> &AssemblyItem {
        let item = self.new_data(data);
        self.append(item)
    }

    /// Appends data after all code, sub-assemblies and data blobs.
    pub fn append_auxiliary_data(&mut self, data: &[u8]) {
        self.auxiliary_data.extend_from_slice(data);
    }

    /// Appends a push of the immutable called `name`.
    pub fn push_immutable(&mut self, name: &str) -> &AssemblyItem {
        self.append(AssemblyItem::push_immutable(immutable_id(name)))
    }

    /// Appends the assignment of the immutable called `name`.
    ///
    /// Expects the value and the memory offset of the runtime code on the stack.
    pub fn assign_immutable(&mut self, name: &str) -> &AssemblyItem {
        self.append(AssemblyItem::assign_immutable(immutable_id(name)))
    }

    /// The current stack height relative to the start.
    #[inline]
    pub fn deposit(&self) -> i32 {
        self.deposit
    }

    #[inline]
    pub fn set_deposit(&mut self, deposit: i32) {
        self.deposit = deposit;
    }

    /// Adjusts the stack height for code whose effect is not visible from the items, such as
    /// jumps into and out of functions.
    #[inline]
    pub fn adjust_deposit(&mut self, adjustment: i32) {
        self.deposit += adjustment;
    }

    /// Optimises this assembly and all sub-assemblies in place.
    #[instrument(level = "debug", skip_all)]
    pub fn optimise(&mut self, settings: &OptimiserSettings) -> Result<(), OptimiserError> {
        self.optimise_internal(settings, &BTreeSet::new()).map(drop)
    }

    /// Optimises the sub-assemblies and then this one. Returns the replacements of the tags
    /// that were unified, so that references from the parent can be updated.
    fn optimise_internal(
        &mut self,
        settings: &OptimiserSettings,
        tags_referenced_from_outside: &BTreeSet<usize>,
    ) -> Result<BTreeMap<usize, usize>, OptimiserError> {
        for sub_id in 0..self.subs.len() {
            let mut referenced = referenced_tags(&self.items, Some(sub_id));
            for sub in &self.subs {
                referenced.extend(referenced_tags(&sub.items, Some(sub_id)));
            }
            let sub_settings = OptimiserSettings { is_creation: false, ..settings.clone() };
            let replacements = self.subs[sub_id].optimise_internal(&sub_settings, &referenced)?;
            apply_tag_replacement(&mut self.items, &replacements, Some(sub_id));
        }

        let mut tag_replacements = BTreeMap::new();
        let mut round = 0;
        loop {
            if round >= settings.max_rounds {
                debug!(round, "optimiser stopped at the round limit");
                break;
            }
            round += 1;
            let before = self.items.len();
            let count =
                self.optimise_round(settings, tags_referenced_from_outside, &mut tag_replacements)?;
            debug!(round, before, after = self.items.len(), count, "optimiser round");
            if count == 0 {
                break;
            }
        }

        if settings.run_constant_optimiser {
            ConstantOptimiser::new(
                settings.expected_executions,
                settings.is_creation,
                settings.evm_version,
            )
            .optimise(self);
        }
        Ok(tag_replacements)
    }

    /// Runs every enabled pass once. Returns the number of changes.
    fn optimise_round(
        &mut self,
        settings: &OptimiserSettings,
        tags_referenced_from_outside: &BTreeSet<usize>,
        tag_replacements: &mut BTreeMap<usize, usize>,
    ) -> Result<usize, OptimiserError> {
        let mut count = 0;

        if settings.run_inliner {
            count += Inliner::new(
                &mut self.items,
                tags_referenced_from_outside,
                settings.expected_executions,
                settings.is_creation,
                settings.evm_version,
            )
            .optimise();
        }

        if settings.run_jumpdest_remover
            && JumpdestRemover::new(&mut self.items).optimise(tags_referenced_from_outside)
        {
            count += 1;
        }

        if settings.run_peephole {
            let mut peephole =
                PeepholeOptimiser::new(&mut self.items, GasCosts::new(settings.evm_version));
            while peephole.optimise() {
                count += 1;
            }
        }

        // This only changes pushes; later rounds remove the code.
        if settings.run_deduplicate {
            let mut dedup = BlockDeduplicator::new(&mut self.items);
            if dedup.deduplicate() {
                tag_replacements.extend(dedup.replaced_tags());
                count += 1;
            }
        }

        if settings.run_cse || settings.run_cfg {
            let msize_important = self.items.iter().any(|item| {
                item.is(Instruction::MSIZE)
                    || matches!(item.kind(), crate::ItemKind::VerbatimBytecode(_))
            });
            let ranges = if settings.run_cfg && self.cfg_applicable(tags_referenced_from_outside) {
                ControlFlowGraph::new(&self.items, false)
                    .optimise()?
                    .into_iter()
                    .map(|block| block.begin..block.end)
                    .collect()
            } else {
                vec![0..self.items.len()]
            };

            let mut optimised = Vec::with_capacity(self.items.len());
            for range in ranges {
                let block = &self.items[range];
                if settings.run_cse {
                    count += optimise_chunks(block, msize_important, &mut optimised)?;
                } else {
                    optimised.extend_from_slice(block);
                }
            }
            if optimised.len() < self.items.len() {
                self.items = optimised;
                count += 1;
            }
        }

        Ok(count)
    }

    /// The graph only knows jumps to pushed tags; tags used by the parent assembly and code
    /// that ends in a conditional jump are left alone.
    fn cfg_applicable(&self, tags_referenced_from_outside: &BTreeSet<usize>) -> bool {
        let applicable = tags_referenced_from_outside.is_empty()
            && !self.items.last().is_some_and(|item| item.is(Instruction::JUMPI));
        if !applicable {
            trace!("skipping control-flow graph");
        }
        applicable
    }

    fn fmt_with_indent(&self, f: &mut fmt::Formatter<'_>, indent: &str) -> fmt::Result {
        for item in &self.items {
            if item.is_tag() {
                writeln!(f, "{indent}tag_{}:", item.data())?;
            } else {
                writeln!(f, "{indent}  {item}")?;
            }
        }
        if self.subs.is_empty() && self.data.is_empty() && self.auxiliary_data.is_empty() {
            return Ok(());
        }
        writeln!(f, "{indent}stop")?;
        writeln!(f)?;
        writeln!(f, "{indent}data:")?;
        let nested = format!("{indent}    ");
        for (id, sub) in self.subs.iter().enumerate() {
            writeln!(f, "{indent}  sub_{id}: assembly {{")?;
            sub.fmt_with_indent(f, &nested)?;
            writeln!(f, "{indent}  }}")?;
        }
        for (hash, data) in &self.data {
            writeln!(f, "{indent}  {hash:#x}: {}", hex::encode(data))?;
        }
        if !self.auxiliary_data.is_empty() {
            writeln!(f, "{indent}  auxdata: {}", hex::encode(&self.auxiliary_data))?;
        }
        Ok(())
    }
}

impl fmt::Display for Assembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with_indent(f, "")
    }
}

/// Identifier of an immutable variable in `PUSHIMMUTABLE` and `ASSIGNIMMUTABLE`.
pub fn immutable_id(name: &str) -> U256 {
    U256::from_be_bytes(keccak256(name.as_bytes()).0)
}

/// Runs the common subexpression eliminator over consecutive chunks of `items` and appends the
/// result to `out`. A chunk is only replaced if the result is shorter.
///
/// Returns the number of replaced chunks.
fn optimise_chunks(
    items: &[AssemblyItem],
    msize_important: bool,
    out: &mut Vec<AssemblyItem>,
) -> Result<usize, OptimiserError> {
    let mut replaced = 0;
    let mut pos = 0;
    while pos < items.len() {
        let mut classes = ExpressionClasses::new();
        let mut eliminator = CommonSubexpressionEliminator::new(&mut classes, KnownState::new());
        let consumed = eliminator.feed_items(&items[pos..], msize_important)?;
        let original = &items[pos..pos + consumed];
        pos += consumed;
        match eliminator.get_optimized_items() {
            Ok(chunk) if chunk.len() < original.len() => {
                trace!(before = original.len(), after = chunk.len(), "replaced chunk");
                out.extend(chunk);
                replaced += 1;
            }
            Ok(_) => out.extend_from_slice(original),
            Err(err) if err.is_recoverable() => {
                debug!(%err, "skipping chunk");
                out.extend_from_slice(original);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(replaced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use solgen_config::OptLevel;

    #[test]
    fn test_tags_and_stack_height() {
        let mut assembly = Assembly::new();
        let tag = assembly.new_tag();
        assert_eq!(tag, AssemblyItem::tag(1));
        assert_eq!(assembly.new_push_tag(), AssemblyItem::push_tag(2));

        assembly.append(AssemblyItem::push(1u64));
        assembly.append(AssemblyItem::push(2u64));
        assert_eq!(assembly.deposit(), 2);
        assembly.append_jumpi(&tag);
        assert_eq!(assembly.deposit(), 1);
        assembly.append(tag);
        assembly.adjust_deposit(-1);
        assert_eq!(assembly.deposit(), 0);
    }

    #[test]
    fn test_locations_of_appended_items() {
        let mut assembly = Assembly::new();
        let location = SourceLocation::new(0, 4, 8);
        assembly.set_source_location(location);
        assert_eq!(assembly.append(Instruction::CALLER).location(), location);
        let other = SourceLocation::new(1, 0, 1);
        let item = AssemblyItem::operation(Instruction::CALLER).with_location(other);
        assert_eq!(assembly.append(item).location(), other);
    }

    #[test]
    fn test_immutables_and_data() {
        let mut assembly = Assembly::new();
        let push = assembly.push_immutable("x").clone();
        assert_eq!(push, AssemblyItem::push_immutable(immutable_id("x")));
        let data = assembly.append_data(vec![1, 2, 3]).clone();
        assert_eq!(assembly.data(data.data()), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_optimise_folds_constants() {
        let mut assembly = Assembly::new();
        assembly.append(AssemblyItem::push(7u64));
        assembly.append(AssemblyItem::push(8u64));
        assembly.append(Instruction::ADD);
        assembly.append(AssemblyItem::push(0u64));
        assembly.append(Instruction::SSTORE);
        assembly.optimise(&OptimiserSettings::default()).unwrap();
        assert_eq!(
            assembly.items(),
            &[
                AssemblyItem::push(15u64),
                AssemblyItem::push(0u64),
                AssemblyItem::operation(Instruction::SSTORE),
            ]
        );
    }

    #[test]
    fn test_optimise_disabled_keeps_items() {
        let mut assembly = Assembly::new();
        assembly.append(AssemblyItem::push(7u64));
        assembly.append(Instruction::POP);
        let before = assembly.items().to_vec();
        assembly.optimise(&OptimiserSettings::none()).unwrap();
        assert_eq!(assembly.items(), &before[..]);

        assembly.optimise(&OptimiserSettings::for_opt_level(OptLevel::O0)).unwrap();
        assert!(assembly.items().is_empty());
    }

    #[test]
    fn test_sub_tag_replacements_reach_parent() {
        let mut runtime = Assembly::new();
        let first = runtime.new_tag();
        let second = runtime.new_tag();
        runtime.append(Instruction::CALLVALUE);
        runtime.append_jumpi(&first);
        runtime.append_jump(&second, JumpType::Ordinary);
        runtime.append(first.clone());
        runtime.append(Instruction::CALLER);
        runtime.append(Instruction::STOP);
        runtime.append(second.clone());
        runtime.append(Instruction::CALLER);
        runtime.append(Instruction::STOP);

        let mut creation = Assembly::new();
        let sub = creation.new_sub(runtime);
        let mut foreign = AssemblyItem::push_tag(0);
        foreign.set_push_tag_sub_id_and_tag(Some(0), second.tag_number());
        creation.append(sub);
        creation.append(foreign);
        creation.append(Instruction::STOP);

        let settings = OptimiserSettings {
            run_inliner: false,
            run_cse: false,
            run_cfg: false,
            run_constant_optimiser: false,
            ..Default::default()
        };
        creation.optimise(&settings).unwrap();
        assert_eq!(creation.items()[1].split_foreign_push_tag(), (Some(0), first.tag_number()));
    }

    #[test]
    fn test_display() {
        let mut runtime = Assembly::new();
        runtime.append(Instruction::STOP);
        let mut assembly = Assembly::new();
        let tag = assembly.new_tag();
        assembly.append_sub(runtime);
        assembly.append(tag);
        assembly.append(Instruction::STOP);
        assert_eq!(
            assembly.to_string(),
            "  PUSH [$] 0x0\ntag_1:\n  STOP\nstop\n\ndata:\n  sub_0: assembly {\n      STOP\n  }\n"
        );
    }
}
