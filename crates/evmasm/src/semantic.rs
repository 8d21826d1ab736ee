//! Semantic classification of assembly items used by the optimiser passes.

use crate::{AssemblyItem, Instruction, ItemKind};

/// Returns `true` if the item cannot be handled inside a CSE block, i.e. the symbolic
/// state has to be flushed before it.
pub fn breaks_cse_analysis_block(item: &AssemblyItem, msize_important: bool) -> bool {
    let instruction = match item.kind() {
        ItemKind::Push
        | ItemKind::PushTag
        | ItemKind::PushSub
        | ItemKind::PushSubSize
        | ItemKind::PushProgramSize
        | ItemKind::PushData
        | ItemKind::PushImmutable => return false,
        ItemKind::Operation(instruction) => *instruction,
        ItemKind::Undefined
        | ItemKind::Tag
        | ItemKind::AssignImmutable
        | ItemKind::VerbatimBytecode(_) => return true,
    };
    if instruction.is_swap() || instruction.is_dup() {
        return false;
    }
    // These depend on the exact position in the code or on memory accesses.
    if matches!(instruction, Instruction::GAS | Instruction::PC | Instruction::MSIZE) {
        return true;
    }
    if matches!(instruction, Instruction::SSTORE | Instruction::MSTORE) {
        return false;
    }
    if !msize_important && matches!(instruction, Instruction::MLOAD | Instruction::KECCAK256) {
        return false;
    }
    let info = instruction.info();
    info.side_effects || info.args > 2
}

/// Returns `true` for binary operations whose operands can be swapped.
pub fn is_commutative_operation(item: &AssemblyItem) -> bool {
    item.instruction().is_some_and(|instruction| {
        matches!(
            instruction,
            Instruction::ADD
                | Instruction::MUL
                | Instruction::EQ
                | Instruction::AND
                | Instruction::OR
                | Instruction::XOR
        )
    })
}

pub fn is_dup_instruction(item: &AssemblyItem) -> bool {
    item.instruction().is_some_and(Instruction::is_dup)
}

pub fn is_swap_instruction(item: &AssemblyItem) -> bool {
    item.instruction().is_some_and(Instruction::is_swap)
}

pub fn is_jump_instruction(item: &AssemblyItem) -> bool {
    item.is(Instruction::JUMP) || item.is(Instruction::JUMPI)
}

/// Returns `true` if execution does not simply continue with the next item.
pub fn alters_control_flow(item: &AssemblyItem) -> bool {
    item.instruction().is_some_and(|instruction| {
        instruction == Instruction::JUMP
            || instruction == Instruction::JUMPI
            || terminates(instruction)
    })
}

/// Returns `true` if the item ends execution of the current call frame.
pub fn terminates_control_flow(item: &AssemblyItem) -> bool {
    item.instruction().is_some_and(terminates)
}

fn terminates(instruction: Instruction) -> bool {
    matches!(
        instruction,
        Instruction::RETURN
            | Instruction::SELFDESTRUCT
            | Instruction::STOP
            | Instruction::INVALID
            | Instruction::REVERT
    )
}

/// Returns `true` if the item always produces the same outputs given the same inputs and
/// the same memory and storage contents.
pub fn is_deterministic(item: &AssemblyItem) -> bool {
    let Some(instruction) = item.instruction() else { return true };
    !matches!(
        instruction,
        Instruction::CALL
            | Instruction::CALLCODE
            | Instruction::DELEGATECALL
            | Instruction::STATICCALL
            | Instruction::CREATE
            | Instruction::CREATE2
            | Instruction::GAS
            | Instruction::PC
            // Depends on previous memory accesses, not only on content.
            | Instruction::MSIZE
            // Depend on previous calls.
            | Instruction::BALANCE
            | Instruction::SELFBALANCE
            | Instruction::EXTCODESIZE
            | Instruction::EXTCODEHASH
            | Instruction::RETURNDATACOPY
            | Instruction::RETURNDATASIZE
    )
}

/// Returns `true` if the instruction may write to memory at unknown locations.
pub fn invalidates_memory(instruction: Instruction) -> bool {
    matches!(
        instruction,
        Instruction::CALLDATACOPY
            | Instruction::CODECOPY
            | Instruction::EXTCODECOPY
            | Instruction::RETURNDATACOPY
            | Instruction::MSTORE
            | Instruction::MSTORE8
            | Instruction::CALL
            | Instruction::CALLCODE
            | Instruction::DELEGATECALL
            | Instruction::STATICCALL
    )
}

/// Returns `true` if the instruction may write to storage at unknown locations.
pub fn invalidates_storage(instruction: Instruction) -> bool {
    matches!(
        instruction,
        Instruction::CALL
            | Instruction::CALLCODE
            | Instruction::DELEGATECALL
            | Instruction::CREATE
            | Instruction::CREATE2
            | Instruction::SSTORE
    )
}

/// Returns `true` if the item only produces a value and can be dropped together with a
/// following `POP` (after popping its arguments).
pub fn is_removable_producer(instruction: Instruction) -> bool {
    let info = instruction.info();
    info.ret == 1 && !info.side_effects
}

/// Mirror of a comparison for swapped operands.
pub fn mirrored_comparison(instruction: Instruction) -> Option<Instruction> {
    Some(match instruction {
        Instruction::LT => Instruction::GT,
        Instruction::GT => Instruction::LT,
        Instruction::SLT => Instruction::SGT,
        Instruction::SGT => Instruction::SLT,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;

    #[test]
    fn test_cse_breaking_items() {
        let op = AssemblyItem::operation;
        assert!(!breaks_cse_analysis_block(&op(Instruction::ADD), false));
        assert!(!breaks_cse_analysis_block(&op(Instruction::SSTORE), false));
        assert!(!breaks_cse_analysis_block(&op(Instruction::MLOAD), false));
        assert!(breaks_cse_analysis_block(&op(Instruction::MLOAD), true));
        assert!(breaks_cse_analysis_block(&op(Instruction::CALL), false));
        assert!(breaks_cse_analysis_block(&op(Instruction::GAS), false));
        assert!(breaks_cse_analysis_block(&op(Instruction::ADDMOD), false));
        assert!(breaks_cse_analysis_block(&AssemblyItem::tag(1), false));
        assert!(breaks_cse_analysis_block(&AssemblyItem::assign_immutable(U256::ZERO), false));
        assert!(!breaks_cse_analysis_block(&AssemblyItem::push_immutable(U256::ZERO), false));
    }

    #[test]
    fn test_control_flow() {
        let op = AssemblyItem::operation;
        assert!(alters_control_flow(&op(Instruction::JUMPI)));
        assert!(!terminates_control_flow(&op(Instruction::JUMP)));
        assert!(terminates_control_flow(&op(Instruction::REVERT)));
        assert!(!alters_control_flow(&AssemblyItem::push_tag(1)));
    }

    #[test]
    fn test_determinism() {
        assert!(is_deterministic(&AssemblyItem::operation(Instruction::KECCAK256)));
        assert!(!is_deterministic(&AssemblyItem::operation(Instruction::GAS)));
        assert!(is_deterministic(&AssemblyItem::push(1u64)));
    }
}
