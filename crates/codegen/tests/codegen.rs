//! End-to-end tests of contract compilation.
#![allow(unused_crate_dependencies)]

use alloy_primitives::U256;
use snapbox::assert_data_eq;
use solgen_codegen::{
    Ast, CompileError, CompilerSettings, ContractCompiler, Type,
    ast::{
        BinOpKind, Builtin, CallExpr, Contract, Event, EventParam, ExprId, ExprKind, Function,
        FunctionKind, Lit, Res, StateMutability, StmtKind, TypeId, UnOpKind, Variable, Visibility,
    },
    types::{FunctionType, FunctionTypeKind, MagicKind},
};
use solgen_config::OptLevel;
use solgen_evmasm::Instruction;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn number(ast: &mut Ast, uint: TypeId, value: u64) -> ExprId {
    ast.add_expr(ExprKind::Lit(Lit::Number(U256::from(value))), uint)
}

/// ```solidity
/// contract Sum {
///     function sum(uint n) external pure returns (uint s) {
///         for (uint i = 0; i < n; i++) s += i;
///     }
/// }
/// ```
fn sum() -> Ast {
    let mut ast = Ast::new();
    let contract = ast.add_contract(Contract::new("Sum"));
    let uint = ast.intern(Type::uint(256));
    let boolean = ast.intern(Type::Bool);
    let n = ast.add_variable(Variable::new("n", uint));
    let s = ast.add_variable(Variable::new("s", uint));
    let i = ast.add_variable(Variable::new("i", uint));

    let zero = number(&mut ast, uint, 0);
    let init = ast.add_stmt(StmtKind::VarDecl(vec![Some(i)], Some(zero)));
    let lhs = ast.add_expr(ExprKind::Ident(Res::Variable(i)), uint);
    let rhs = ast.add_expr(ExprKind::Ident(Res::Variable(n)), uint);
    let cond = ast.add_expr(ExprKind::Binary(lhs, BinOpKind::Lt, rhs), boolean);
    let counter = ast.add_expr(ExprKind::Ident(Res::Variable(i)), uint);
    let next = ast.add_expr(ExprKind::Unary(UnOpKind::PostInc, counter), uint);
    let target = ast.add_expr(ExprKind::Ident(Res::Variable(s)), uint);
    let value = ast.add_expr(ExprKind::Ident(Res::Variable(i)), uint);
    let add = ast.add_expr(ExprKind::Assign(target, Some(BinOpKind::Add), value), uint);
    let body = ast.add_stmt(StmtKind::Expr(add));
    let for_loop =
        ast.add_stmt(StmtKind::For { init: Some(init), cond: Some(cond), next: Some(next), body });
    let body = ast.add_stmt(StmtKind::Block(vec![for_loop]));
    ast.add_function(
        contract,
        Function {
            visibility: Visibility::External,
            mutability: StateMutability::Pure,
            params: vec![n],
            returns: vec![s],
            body: Some(body),
            ..Function::new("sum")
        },
    );
    ast
}

#[test]
fn test_loop_with_checked_addition() {
    init_tracing();
    let ast = sum();
    let contract = ast.contracts().next().unwrap().0;

    let settings = CompilerSettings::default();
    let compiled = ContractCompiler::new(&ast, &settings).compile(contract).unwrap();
    let runtime = compiled.runtime.to_string();
    assert!(runtime.contains("PUSH 0x4e487b71"), "{runtime}");
    assert!(runtime.contains("JUMP [in]"), "{runtime}");
    let (&selector, function) = compiled.external_functions.iter().next().unwrap();
    assert_eq!(function.signature, "sum(uint256)");
    assert_eq!(selector, solgen_codegen::selector("sum(uint256)"));
    let unoptimised = compiled.creation.assemble().unwrap();

    let settings = CompilerSettings::for_opt_level(OptLevel::O2);
    let optimised = ContractCompiler::new(&ast, &settings).compile(contract).unwrap();
    let object = optimised.creation.assemble().unwrap();
    let runtime = optimised.runtime.assemble().unwrap();
    assert!(object.bytecode.ends_with(&runtime.bytecode));
    assert!(!unoptimised.bytecode.is_empty());
}

/// ```solidity
/// contract Fallback {
///     fallback() external {}
/// }
/// ```
#[test]
fn test_fallback_only_contract() {
    init_tracing();
    let mut ast = Ast::new();
    let contract = ast.add_contract(Contract::new("Fallback"));
    let body = ast.add_stmt(StmtKind::Block(vec![]));
    ast.add_function(
        contract,
        Function {
            kind: FunctionKind::Fallback,
            visibility: Visibility::External,
            body: Some(body),
            ..Function::new("")
        },
    );

    let settings = CompilerSettings::default();
    let compiled = ContractCompiler::new(&ast, &settings).compile(contract).unwrap();
    assert!(compiled.external_functions.is_empty());
    assert_data_eq!(
        compiled.runtime.to_string(),
        "  PUSH 0x80
  PUSH 0x40
  MSTORE
tag_1:
  CALLVALUE
  PUSH [tag] 2
  JUMPI
  PUSH [tag] 3
  PUSH [tag] 4
  JUMP [in]
tag_3:
  STOP
tag_4:
tag_5:
  JUMP [out]
tag_2:
  PUSH 0x0
  DUP1
  REVERT
"
    );
}

/// ```solidity
/// contract A {}
/// contract B {
///     function make() external returns (A) { return new A(); }
/// }
/// ```
fn factory() -> Ast {
    let mut ast = Ast::new();
    let a = ast.add_contract(Contract::new("A"));
    let b = ast.add_contract(Contract::new("B"));
    let a_type = ast.intern(Type::Contract(a));
    let creation = ast.intern(Type::Function(FunctionType::new(FunctionTypeKind::Creation)));
    let callee = ast.add_expr(ExprKind::New(a_type), creation);
    let call = ast.add_expr(ExprKind::Call(CallExpr::new(callee, vec![])), a_type);
    let ret = ast.add_stmt(StmtKind::Return(Some(call)));
    let body = ast.add_stmt(StmtKind::Block(vec![ret]));
    let result = ast.add_variable(Variable::new("", a_type));
    ast.add_function(
        b,
        Function {
            visibility: Visibility::External,
            returns: vec![result],
            body: Some(body),
            ..Function::new("make")
        },
    );
    ast
}

#[test]
fn test_contract_creation_embeds_creation_code() {
    init_tracing();
    let ast = factory();
    let settings = CompilerSettings::default();
    let contracts = ContractCompiler::new(&ast, &settings).compile_all().unwrap();
    let [a, b] = &contracts[..] else { panic!("expected two contracts") };
    assert_eq!(a.name, "A");
    assert_eq!(b.name, "B");
    assert_eq!(b.runtime.subs().len(), 1);
    assert_eq!(b.runtime.subs()[0].to_string(), a.creation.to_string());
    assert!(b.runtime.items().iter().any(|item| item.instruction() == Some(Instruction::CREATE)));
    assert!(b.creation.assemble().is_ok());
    assert_eq!(b.external_functions.values().next().unwrap().signature, "make()");
}

#[test]
fn test_created_contract_must_be_compiled_first() {
    init_tracing();
    let ast = factory();
    let b = ast.contracts().nth(1).unwrap().0;
    let settings = CompilerSettings::default();
    let err = ContractCompiler::new(&ast, &settings).compile(b).unwrap_err();
    assert!(matches!(err, CompileError::InternalCompilerError(_)), "{err}");
}

/// ```solidity
/// contract Token {
///     event Transfer(address indexed from, uint amount);
///     function ping() external { emit Transfer(msg.sender, 1); }
/// }
/// ```
#[test]
fn test_event_with_indexed_parameter() {
    init_tracing();
    let mut ast = Ast::new();
    let contract = ast.add_contract(Contract::new("Token"));
    let uint = ast.intern(Type::uint(256));
    let address = ast.intern(Type::address());
    let unit = ast.intern(Type::Tuple(vec![]));
    let msg = ast.intern(Type::Magic(MagicKind::Msg));
    let event = ast.add_event(Event {
        name: "Transfer".into(),
        params: vec![
            EventParam { name: "from".into(), ty: address, indexed: true },
            EventParam { name: "amount".into(), ty: uint, indexed: false },
        ],
        anonymous: false,
    });

    let mut event_type =
        FunctionType::new(FunctionTypeKind::Event).with_signature(vec![address, uint], vec![]);
    event_type.event = Some(event);
    let event_type = ast.intern(Type::Function(event_type));
    let callee = ast.add_expr(ExprKind::Ident(Res::Event(event)), event_type);
    let msg = ast.add_expr(ExprKind::Ident(Res::Builtin(Builtin::Msg)), msg);
    let sender = ast.add_expr(ExprKind::Member(msg, "sender".into()), address);
    let amount = number(&mut ast, uint, 1);
    let call = ast.add_expr(ExprKind::Call(CallExpr::new(callee, vec![sender, amount])), unit);
    let emit = ast.add_stmt(StmtKind::Emit(call));
    let body = ast.add_stmt(StmtKind::Block(vec![emit]));
    ast.add_function(
        contract,
        Function { visibility: Visibility::External, body: Some(body), ..Function::new("ping") },
    );

    let settings = CompilerSettings::default();
    let compiled = ContractCompiler::new(&ast, &settings).compile(contract).unwrap();
    let items = compiled.runtime.items();
    assert!(items.iter().any(|item| item.instruction() == Some(Instruction::LOG2)));
    assert!(items.iter().any(|item| item.instruction() == Some(Instruction::CALLER)));
    let hash = ast.event_signature_hash(event).unwrap();
    assert!(compiled.runtime.to_string().contains(&format!("PUSH {hash:#x}")));
}

/// ```solidity
/// contract Pointer {
///     function one() internal pure returns (uint) { return 1; }
///     function call() external pure returns (uint) {
///         function() internal pure returns (uint) f = one;
///         return f();
///     }
/// }
/// ```
#[test]
fn test_call_through_function_value_is_dispatched() {
    init_tracing();
    let mut ast = Ast::new();
    let contract = ast.add_contract(Contract::new("Pointer"));
    let uint = ast.intern(Type::uint(256));
    let pointer = ast.intern(Type::Function(
        FunctionType::new(FunctionTypeKind::Internal).with_signature(vec![], vec![uint]),
    ));

    let value = number(&mut ast, uint, 1);
    let ret = ast.add_stmt(StmtKind::Return(Some(value)));
    let body = ast.add_stmt(StmtKind::Block(vec![ret]));
    let result = ast.add_variable(Variable::new("", uint));
    let one = ast.add_function(
        contract,
        Function {
            mutability: StateMutability::Pure,
            returns: vec![result],
            body: Some(body),
            ..Function::new("one")
        },
    );

    let f = ast.add_variable(Variable::new("f", pointer));
    let init = ast.add_expr(ExprKind::Ident(Res::Function(one)), pointer);
    let decl = ast.add_stmt(StmtKind::VarDecl(vec![Some(f)], Some(init)));
    let callee = ast.add_expr(ExprKind::Ident(Res::Variable(f)), pointer);
    let call = ast.add_expr(ExprKind::Call(CallExpr::new(callee, vec![])), uint);
    let ret = ast.add_stmt(StmtKind::Return(Some(call)));
    let body = ast.add_stmt(StmtKind::Block(vec![decl, ret]));
    let result = ast.add_variable(Variable::new("", uint));
    ast.add_function(
        contract,
        Function {
            visibility: Visibility::External,
            mutability: StateMutability::Pure,
            returns: vec![result],
            body: Some(body),
            ..Function::new("call")
        },
    );

    let settings = CompilerSettings::default();
    let compiled = ContractCompiler::new(&ast, &settings).compile(contract).unwrap();
    let dispatched = compiled.internal_dispatch.get(&(0, 1)).unwrap();
    assert_eq!(dispatched.iter().copied().collect::<Vec<_>>(), vec![one]);

    let entry = compiled.function_entry_tags[&one].tag_number();
    let runtime = compiled.runtime.to_string();
    assert!(runtime.contains(&format!("  DUP1\n  PUSH [tag] {entry}\n  EQ\n")), "{runtime}");
    assert!(runtime.contains("  PUSH 0x51\n"), "{runtime}");
    assert!(compiled.creation.assemble().is_ok());

    let settings = CompilerSettings::for_opt_level(OptLevel::O2);
    let optimised = ContractCompiler::new(&ast, &settings).compile(contract).unwrap();
    let runtime = optimised.runtime.assemble().unwrap();
    assert!(optimised.creation.assemble().unwrap().bytecode.ends_with(&runtime.bytecode));
}
