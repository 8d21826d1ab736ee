//! Peephole optimiser for assembly items.
//!
//! Replaces short windows of adjacent items with cheaper equivalents. A single call to
//! [`PeepholeOptimiser::optimise`] is one left-to-right pass; rewrites can enable further
//! rewrites, so the pass is repeated until it reports no change.

use crate::{AssemblyItem, Instruction, ItemKind, gas::GasCosts, semantic};
use alloy_primitives::U256;
use tracing::trace;

/// Address width used when comparing code sizes.
const ADDRESS_LENGTH: usize = 3;

/// Mask of the low 160 bits.
const ADDRESS_MASK: U256 = U256::from_limbs([u64::MAX, u64::MAX, u32::MAX as u64, 0]);

/// A pattern match: number of consumed items and their replacement.
type Rewrite = (usize, Vec<AssemblyItem>);

/// Window rewrites, tried in order at every position.
const PATTERNS: &[fn(&[AssemblyItem]) -> Option<Rewrite>] = &[
    push_pop,
    op_pop,
    double_push,
    double_swap,
    commutative_swap,
    swap_comparison,
    is_zero_is_zero_jumpi,
    jump_to_next,
    unreachable_code,
    tag_conjunctions,
    truthy_and,
    address_mask,
];

/// Peephole optimiser over an item list.
#[derive(Debug)]
pub struct PeepholeOptimiser<'a> {
    items: &'a mut Vec<AssemblyItem>,
    costs: GasCosts,
}

impl<'a> PeepholeOptimiser<'a> {
    pub fn new(items: &'a mut Vec<AssemblyItem>, costs: GasCosts) -> Self {
        Self { items, costs }
    }

    /// Runs one pass over the items.
    ///
    /// The result is only kept if it has fewer items, or as many items but fewer bytes or a
    /// lower static gas cost. Returns `true` if the items were replaced.
    pub fn optimise(&mut self) -> bool {
        let items = &**self.items;
        let mut optimised = Vec::with_capacity(items.len());
        let mut i = 0;
        while i < items.len() {
            if let Some((skip, replacement)) = try_pattern(&items[i..]) {
                trace!(at = i, skip, "peephole rewrite");
                let location = items[i].location();
                optimised.extend(replacement.into_iter().map(|mut item| {
                    if item.location().is_empty() {
                        item.set_location(location);
                    }
                    item
                }));
                i += skip;
            } else {
                optimised.push(items[i].clone());
                i += 1;
            }
        }

        let better = optimised.len() < items.len()
            || (optimised.len() == items.len()
                && (code_size(&optimised) < code_size(items)
                    || self.static_gas(&optimised) < self.static_gas(items)));
        if better {
            *self.items = optimised;
        }
        better
    }

    /// Sum of the fixed execution costs; dynamic costs are ignored.
    fn static_gas(&self, items: &[AssemblyItem]) -> u64 {
        items
            .iter()
            .map(|item| {
                let instruction = match item.kind() {
                    ItemKind::Operation(instruction) => *instruction,
                    ItemKind::Tag => Instruction::JUMPDEST,
                    _ if item.is_push_like() => Instruction::PUSH1,
                    _ => return 0,
                };
                self.costs.run_gas(instruction).unwrap_or(0)
            })
            .sum()
    }
}

fn code_size(items: &[AssemblyItem]) -> usize {
    items.iter().map(|item| item.bytes_required(ADDRESS_LENGTH)).sum()
}

fn try_pattern(items: &[AssemblyItem]) -> Option<Rewrite> {
    PATTERNS.iter().find_map(|pattern| pattern(items))
}

fn op(instruction: Instruction) -> AssemblyItem {
    AssemblyItem::operation(instruction)
}

/// `PUSH x POP` and `DUPn POP` are removed.
fn push_pop(items: &[AssemblyItem]) -> Option<Rewrite> {
    let [push, pop, ..] = items else { return None };
    let removable = semantic::is_dup_instruction(push)
        || (push.is_push_like() && *push.kind() != ItemKind::PushImmutable);
    (removable && pop.is(Instruction::POP)).then(|| (2, vec![]))
}

/// A side-effect free operation whose result is popped is replaced by popping its arguments.
fn op_pop(items: &[AssemblyItem]) -> Option<Rewrite> {
    let [operation, pop, ..] = items else { return None };
    let instruction = operation.instruction()?;
    // Memory reads can change `MSIZE`.
    if !pop.is(Instruction::POP)
        || !semantic::is_removable_producer(instruction)
        || matches!(instruction, Instruction::MLOAD | Instruction::KECCAK256)
    {
        return None;
    }
    let location = operation.location();
    let pops = (0..instruction.info().args)
        .map(|_| op(Instruction::POP).with_location(location))
        .collect();
    Some((2, pops))
}

/// `PUSH x PUSH x` becomes `PUSH x DUP1`.
fn double_push(items: &[AssemblyItem]) -> Option<Rewrite> {
    let [first, second, ..] = items else { return None };
    (first.is_push() && second.is_push() && first.data() == second.data()).then(|| {
        (2, vec![first.clone(), op(Instruction::dup(1)).with_location(second.location())])
    })
}

/// `SWAPn SWAPn` is removed.
fn double_swap(items: &[AssemblyItem]) -> Option<Rewrite> {
    let [first, second, ..] = items else { return None };
    (semantic::is_swap_instruction(first) && first == second).then(|| (2, vec![]))
}

/// `SWAP1` before a commutative operation is removed.
fn commutative_swap(items: &[AssemblyItem]) -> Option<Rewrite> {
    let [swap, operation, ..] = items else { return None };
    (swap.is(Instruction::swap(1)) && semantic::is_commutative_operation(operation))
        .then(|| (2, vec![operation.clone()]))
}

/// `SWAP1 LT` becomes `GT` and likewise for the other ordered comparisons.
fn swap_comparison(items: &[AssemblyItem]) -> Option<Rewrite> {
    let [swap, comparison, ..] = items else { return None };
    if !swap.is(Instruction::swap(1)) {
        return None;
    }
    let mirrored = semantic::mirrored_comparison(comparison.instruction()?)?;
    Some((2, vec![op(mirrored).with_location(comparison.location())]))
}

/// `ISZERO ISZERO PUSHTAG JUMPI` jumps on the original value.
fn is_zero_is_zero_jumpi(items: &[AssemblyItem]) -> Option<Rewrite> {
    let [first, second, push_tag, jumpi, ..] = items else { return None };
    (first.is(Instruction::ISZERO)
        && second.is(Instruction::ISZERO)
        && push_tag.is_push_tag()
        && jumpi.is(Instruction::JUMPI))
    .then(|| (4, vec![push_tag.clone(), jumpi.clone()]))
}

/// A jump to the immediately following tag is removed.
fn jump_to_next(items: &[AssemblyItem]) -> Option<Rewrite> {
    let [push_tag, jump, tag, ..] = items else { return None };
    if !push_tag.is_push_tag() || !tag.is_tag() || push_tag.data() != tag.data() {
        return None;
    }
    if jump.is(Instruction::JUMP) {
        Some((3, vec![tag.clone()]))
    } else if jump.is(Instruction::JUMPI) {
        Some((3, vec![op(Instruction::POP).with_location(jump.location()), tag.clone()]))
    } else {
        None
    }
}

/// Items between an unconditional jump or terminator and the next tag are removed.
fn unreachable_code(items: &[AssemblyItem]) -> Option<Rewrite> {
    let [first, rest @ ..] = items else { return None };
    if !first.is(Instruction::JUMP) && !semantic::terminates_control_flow(first) {
        return None;
    }
    let dead = rest.iter().take_while(|item| !item.is_tag()).count();
    (dead > 0).then(|| (1 + dead, vec![first.clone()]))
}

/// `PUSHTAG` and-ed with a mask of at least 32 low bits is the tag itself.
fn tag_conjunctions(items: &[AssemblyItem]) -> Option<Rewrite> {
    let [a, b, and, ..] = items else { return None };
    if !and.is(Instruction::AND) {
        return None;
    }
    let (push_tag, mask) = match (a.is_push_tag(), b.is_push_tag()) {
        (true, false) => (a, b),
        (false, true) => (b, a),
        _ => return None,
    };
    let low = U256::from(u32::MAX);
    (mask.is_push() && mask.data() & low == low).then(|| (3, vec![push_tag.clone()]))
}

/// `PUSH 0 NOT AND` is the identity.
fn truthy_and(items: &[AssemblyItem]) -> Option<Rewrite> {
    let [push, not, and, ..] = items else { return None };
    let matches = push.is_push()
        && push.data().is_zero()
        && not.is(Instruction::NOT)
        && and.is(Instruction::AND);
    matches.then(|| (3, vec![]))
}

/// Masking the result of an address-producing instruction with the address mask is removed.
fn address_mask(items: &[AssemblyItem]) -> Option<Rewrite> {
    let [a, b, and, ..] = items else { return None };
    if !and.is(Instruction::AND) {
        return None;
    }
    let is_mask = |item: &AssemblyItem| item.is_push() && item.data() == ADDRESS_MASK;
    let producer = if is_mask(a) {
        b
    } else if is_mask(b) {
        a
    } else {
        return None;
    };
    let produces_address = producer.instruction().is_some_and(|instruction| {
        matches!(
            instruction,
            Instruction::ADDRESS | Instruction::CALLER | Instruction::ORIGIN | Instruction::COINBASE
        )
    });
    produces_address.then(|| (3, vec![producer.clone()]))
}
