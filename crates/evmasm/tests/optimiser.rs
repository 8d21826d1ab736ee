//! End-to-end tests of the assembly optimiser and assembler.
#![allow(unused_crate_dependencies)]

use alloy_primitives::U256;
use snapbox::assert_data_eq;
use solgen_evmasm::{
    Assembly, AssemblyItem, Instruction, JumpType, OptimiserSettings, passes::Inliner,
};
use std::collections::BTreeSet;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn assembly(items: Vec<AssemblyItem>) -> Assembly {
    let mut assembly = Assembly::new();
    for item in items {
        assembly.append(item);
    }
    assembly
}

fn op(instruction: Instruction) -> AssemblyItem {
    AssemblyItem::operation(instruction)
}

#[test]
fn test_constant_expression_is_folded() {
    init_tracing();
    let mut assembly = assembly(vec![
        AssemblyItem::push(7u64),
        AssemblyItem::push(8u64),
        op(Instruction::ADD),
        AssemblyItem::push(0u64),
        op(Instruction::SSTORE),
    ]);
    assembly.optimise(&OptimiserSettings::standard()).unwrap();
    assert_data_eq!(assembly.to_string(), "  PUSH 0xf\n  PUSH 0x0\n  SSTORE\n");
    assert_eq!(assembly.assemble().unwrap().bytecode, vec![0x60, 0x0f, 0x60, 0x00, 0x55]);
}

#[test]
fn test_discarded_comparison_is_removed() {
    init_tracing();
    let mut assembly = assembly(vec![
        AssemblyItem::push(4u64),
        op(Instruction::CALLDATASIZE),
        op(Instruction::LT),
        op(Instruction::POP),
    ]);
    assembly.optimise(&OptimiserSettings::minimal()).unwrap();
    assert!(assembly.items().is_empty());
}

#[test]
fn test_duplicate_blocks_are_unified_and_removed() {
    init_tracing();
    let settings = OptimiserSettings {
        run_deduplicate: true,
        run_jumpdest_remover: true,
        ..OptimiserSettings::none()
    };
    let mut assembly = assembly(vec![
        op(Instruction::CALLVALUE),
        AssemblyItem::push_tag(1),
        op(Instruction::JUMPI),
        AssemblyItem::push_tag(2),
        op(Instruction::JUMP),
        AssemblyItem::tag(1),
        op(Instruction::CALLER),
        op(Instruction::STOP),
        AssemblyItem::tag(2),
        op(Instruction::CALLER),
        op(Instruction::STOP),
    ]);
    assembly.optimise(&settings).unwrap();
    assert_data_eq!(
        assembly.to_string(),
        "  CALLVALUE
  PUSH [tag] 1
  JUMPI
  PUSH [tag] 1
  JUMP
tag_1:
  CALLER
  STOP
  CALLER
  STOP
"
    );
}

#[test]
fn test_function_call_is_inlined() {
    init_tracing();
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
    let inlined = Inliner::new(&mut items, &BTreeSet::new(), 200, false, Default::default())
        .optimise();
    assert_eq!(inlined, 1);
    assert_eq!(
        &items[..4],
        &[
            AssemblyItem::push_tag(1),
            op(Instruction::CALLVALUE),
            op(Instruction::SWAP1),
            op(Instruction::JUMP),
        ]
    );
    assert_eq!(items[3].jump_type(), JumpType::Ordinary);
}

#[test]
fn test_optimisation_is_deterministic() {
    init_tracing();
    let build = || {
        let mut assembly = Assembly::new();
        let end = assembly.new_tag();
        let body = assembly.new_tag();
        assembly.append(AssemblyItem::push(0u64));
        assembly.append(op(Instruction::SLOAD));
        assembly.append(AssemblyItem::push(0u64));
        assembly.append(op(Instruction::SLOAD));
        assembly.append(op(Instruction::ADD));
        assembly.append(AssemblyItem::push(0u64));
        assembly.append(op(Instruction::SSTORE));
        assembly.append(op(Instruction::CALLVALUE));
        assembly.append_jumpi(&body);
        assembly.append_jump(&end, JumpType::Ordinary);
        assembly.append(body);
        assembly.append(AssemblyItem::push(0u64));
        assembly.append(AssemblyItem::push(0u64));
        assembly.append(op(Instruction::REVERT));
        assembly.append(end);
        assembly.append(op(Instruction::STOP));
        assembly
    };

    let mut first = build();
    first.optimise(&OptimiserSettings::full()).unwrap();
    let mut second = build();
    second.optimise(&OptimiserSettings::full()).unwrap();
    assert_eq!(first.items(), second.items());
    assert_eq!(first.assemble().unwrap(), second.assemble().unwrap());
    assert!(first.items().len() <= build().items().len());

    let mut again = first.clone();
    again.optimise(&OptimiserSettings::full()).unwrap();
    assert!(again.items().len() <= first.items().len());
}

#[test]
fn test_runtime_code_is_deployed() {
    init_tracing();
    let mut runtime = Assembly::new();
    runtime.append(AssemblyItem::push(1u64));
    runtime.append(AssemblyItem::push(2u64));
    runtime.append(op(Instruction::ADD));
    runtime.append(op(Instruction::POP));
    runtime.append(op(Instruction::STOP));

    let mut creation = Assembly::new();
    let sub = creation.new_sub(runtime);
    creation.append(AssemblyItem::push_sub_size(0));
    creation.append(op(Instruction::DUP1));
    creation.append(sub);
    creation.append(AssemblyItem::push(0u64));
    creation.append(op(Instruction::CODECOPY));
    creation.append(AssemblyItem::push(0u64));
    creation.append(op(Instruction::RETURN));
    creation.optimise(&OptimiserSettings::standard()).unwrap();

    assert_eq!(creation.sub(0).unwrap().items(), &[op(Instruction::STOP)]);
    let object = creation.assemble().unwrap();
    assert_eq!(object.bytecode.last(), Some(&0x00));
    assert_eq!(object.bytecode[object.bytecode.len() - 2], 0x00);
}

#[test]
fn test_stored_tag_keeps_its_block() {
    init_tracing();
    let mut assembly = assembly(vec![
        AssemblyItem::push_tag(1),
        AssemblyItem::push(0u64),
        op(Instruction::SSTORE),
        op(Instruction::STOP),
        AssemblyItem::tag(1),
        op(Instruction::CALLER),
        AssemblyItem::push(0u64),
        op(Instruction::SSTORE),
        op(Instruction::STOP),
    ]);
    assembly.optimise(&OptimiserSettings::standard()).unwrap();
    let listing = assembly.to_string();
    assert!(listing.contains("PUSH [tag] 1"), "{listing}");
    assert!(listing.contains("tag_1:"), "{listing}");
    let object = assembly.assemble().unwrap();
    assert!(object.bytecode.contains(&0x5b));
}

#[test]
fn test_negated_constant_is_computed() {
    init_tracing();
    let mut value = [0xff; 32];
    value[31] = 0;
    let mut assembly = assembly(vec![
        AssemblyItem::push(U256::from_be_bytes(value)),
        AssemblyItem::push(0u64),
        op(Instruction::SSTORE),
    ]);
    assembly.optimise(&OptimiserSettings::standard()).unwrap();
    assert_data_eq!(assembly.to_string(), "  PUSH 0xff\n  NOT\n  PUSH 0x0\n  SSTORE\n");
    assert!(assembly.assemble().unwrap().bytecode.starts_with(&[0x60, 0xff, 0x19]));

    let mut literal = self::assembly(vec![
        AssemblyItem::push(U256::from_be_bytes(value)),
        AssemblyItem::push(0u64),
        op(Instruction::SSTORE),
    ]);
    let settings = OptimiserSettings { run_constant_optimiser: false, ..Default::default() };
    literal.optimise(&settings).unwrap();
    assert_eq!(literal.items()[0], AssemblyItem::push(U256::from_be_bytes(value)));
}
