//! Compiles a small counter contract and prints its assembly and bytecode.
//!
//! Run with: cargo run -p solgen-codegen --example compile [-- --optimize]
#![allow(unused_crate_dependencies)]

use alloy_primitives::{U256, hex};
use solgen_codegen::{
    Ast, CompilerSettings, ContractCompiler, Type,
    ast::{BinOpKind, Contract, ExprKind, Function, Lit, Res, StmtKind, Variable, Visibility},
};
use solgen_config::OptLevel;

/// ```solidity
/// contract Counter {
///     uint public count;
///     function increment(uint by) external returns (uint) {
///         count += by;
///         return count;
///     }
/// }
/// ```
fn counter() -> Ast {
    let mut ast = Ast::new();
    let contract = ast.add_contract(Contract::new("Counter"));
    let uint = ast.intern(Type::uint(256));
    let count = ast.add_state_variable(
        contract,
        Variable { visibility: Visibility::Public, ..Variable::new("count", uint) },
    );
    let by = ast.add_variable(Variable::new("by", uint));
    let result = ast.add_variable(Variable::new("", uint));

    let target = ast.add_expr(ExprKind::Ident(Res::Variable(count)), uint);
    let amount = ast.add_expr(ExprKind::Ident(Res::Variable(by)), uint);
    let add = ast.add_expr(ExprKind::Assign(target, Some(BinOpKind::Add), amount), uint);
    let add = ast.add_stmt(StmtKind::Expr(add));
    let read = ast.add_expr(ExprKind::Ident(Res::Variable(count)), uint);
    let ret = ast.add_stmt(StmtKind::Return(Some(read)));
    let body = ast.add_stmt(StmtKind::Block(vec![add, ret]));
    ast.add_function(
        contract,
        Function {
            visibility: Visibility::External,
            params: vec![by],
            returns: vec![result],
            body: Some(body),
            ..Function::new("increment")
        },
    );

    // constructor() { count = 1; }
    let target = ast.add_expr(ExprKind::Ident(Res::Variable(count)), uint);
    let one = ast.add_expr(ExprKind::Lit(Lit::Number(U256::from(1))), uint);
    let init = ast.add_expr(ExprKind::Assign(target, None, one), uint);
    let init = ast.add_stmt(StmtKind::Expr(init));
    let body = ast.add_stmt(StmtKind::Block(vec![init]));
    ast.add_function(
        contract,
        Function {
            kind: solgen_codegen::ast::FunctionKind::Constructor,
            body: Some(body),
            ..Function::new("")
        },
    );
    ast
}

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let optimize = std::env::args().any(|arg| arg == "--optimize");
    let settings = if optimize {
        CompilerSettings::for_opt_level(OptLevel::O2)
    } else {
        CompilerSettings::default()
    };

    let ast = counter();
    let contracts = match ContractCompiler::new(&ast, &settings).compile_all() {
        Ok(contracts) => contracts,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };
    for contract in contracts {
        println!("=== {} ===", contract.name);
        print!("{}", contract.creation);
        for (selector, function) in &contract.external_functions {
            println!("{selector:#010x}: {}", function.signature);
        }
        match contract.creation.assemble() {
            Ok(object) => println!("bytecode: 0x{}", hex::encode(&object.bytecode)),
            Err(err) => eprintln!("error: {err}"),
        }
    }
}
