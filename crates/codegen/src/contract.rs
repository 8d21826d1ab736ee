//! Compilation of whole contracts: creation code, selector dispatcher and function bodies.

use crate::{
    CompilerSettings, Result,
    array_utils::ArrayUtils,
    ast::{Ast, ContractId, DeclId, FunctionId, FunctionKind},
    context::{Callable, CompilerContext, LowLevelFunction},
    error::{CompileError, ensure},
    expr::ExpressionCompiler,
    stmt::StatementCompiler,
    types::{ArrayType, DataLocation, Type, selector},
    utils::{CompilerUtils, DATA_START_OFFSET, GENERAL_PURPOSE_MEMORY_START},
};
use alloy_primitives::U256;
use rustc_hash::FxHashMap;
use solgen_evmasm::{Assembly, AssemblyItem, Instruction, ItemKind, JumpType, immutable_id};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument};

/// A function reachable through the selector dispatcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalFunction {
    /// The canonical signature the selector is derived from.
    pub signature: String,
    /// ABI types of the parameters.
    pub params: Vec<Type>,
    /// ABI types of the return values.
    pub returns: Vec<Type>,
    /// Entry tag of the code decoding the arguments, in the runtime assembly.
    pub entry: AssemblyItem,
    /// The function or getter called with the decoded arguments.
    pub callable: Callable,
}

/// The output of compiling one contract.
///
/// Tags refer to the assemblies before optimisation.
#[derive(Clone, Debug)]
pub struct CompiledContract {
    pub name: String,
    /// Runs the constructor and returns the runtime code, which is sub-assembly 0.
    pub creation: Assembly,
    pub runtime: Assembly,
    /// Entry tags of the internal functions in the runtime code.
    pub function_entry_tags: BTreeMap<FunctionId, AssemblyItem>,
    /// The dispatcher table, by selector.
    pub external_functions: BTreeMap<u32, ExternalFunction>,
    /// Functions whose entry tag is used as a value in the runtime code, by parameter and
    /// return count.
    pub internal_dispatch: BTreeMap<(usize, usize), BTreeSet<FunctionId>>,
}

/// Compiles the contracts of an [`Ast`].
///
/// The creation code of every compiled contract is kept so that later contracts can create
/// it with `new`.
#[derive(Debug)]
pub struct ContractCompiler<'a> {
    ast: &'a Ast,
    settings: &'a CompilerSettings,
    creation_code: FxHashMap<ContractId, Assembly>,
}

impl<'a> ContractCompiler<'a> {
    pub fn new(ast: &'a Ast, settings: &'a CompilerSettings) -> Self {
        Self { ast, settings, creation_code: FxHashMap::default() }
    }

    /// Compiles every contract in declaration order. Contracts must come after the contracts
    /// they create.
    pub fn compile_all(&mut self) -> Result<Vec<CompiledContract>> {
        let ids: Vec<ContractId> = self.ast.contracts().map(|(id, _)| id).collect();
        ids.into_iter().map(|id| self.compile(id)).collect()
    }

    /// Compiles one contract.
    #[instrument(level = "debug", skip_all)]
    pub fn compile(&mut self, contract: ContractId) -> Result<CompiledContract> {
        let ast = self.ast;
        let name = ast[contract].name.clone();
        debug!(%name, "compiling contract");
        let layout = ast.storage_layout(contract);

        let interface = self.interface(contract)?;
        let mut runtime =
            CompilerContext::new(ast, self.settings, contract, &layout, &self.creation_code, true);
        let external_functions = append_runtime(&mut runtime, interface)?;
        let function_entry_tags = runtime
            .entry_tags()
            .iter()
            .filter_map(|(callable, tag)| match callable {
                Callable::Function(id) => Some((*id, tag.clone())),
                Callable::Accessor(_) => None,
            })
            .collect();
        let internal_dispatch = runtime.internal_dispatch().clone();
        let runtime = runtime.into_assembly();

        let mut creation =
            CompilerContext::new(ast, self.settings, contract, &layout, &self.creation_code, false);
        append_creation(&mut creation, runtime)?;
        let mut creation = creation.into_assembly();
        if self.settings.optimise {
            creation.optimise(&self.settings.optimiser_settings(true))?;
        }
        let runtime = creation
            .sub(0)
            .cloned()
            .ok_or_else(|| CompileError::internal("creation code without runtime code"))?;
        debug!(
            %name,
            creation = creation.items().len(),
            runtime = runtime.items().len(),
            "compiled contract"
        );

        self.creation_code.insert(contract, creation.clone());
        Ok(CompiledContract {
            name,
            creation,
            runtime,
            function_entry_tags,
            external_functions,
            internal_dispatch,
        })
    }

    /// The functions and getters callable from outside, by selector.
    fn interface(&self, contract: ContractId) -> Result<BTreeMap<u32, ExternalFunction>> {
        let ast = self.ast;
        let mut interface = BTreeMap::new();
        let mut add = |signature: String, params, returns, callable| {
            let selector = selector(&signature);
            let function = ExternalFunction {
                signature,
                params,
                returns,
                // assigned with the dispatcher
                entry: AssemblyItem::new(ItemKind::Undefined, U256::ZERO),
                callable,
            };
            if let Some(other) = interface.insert(selector, function) {
                return Err(CompileError::internal(format!(
                    "selector {selector:#010x} of {} clashes",
                    other.signature
                )));
            }
            Ok(())
        };
        for &id in &ast[contract].functions {
            let function = &ast[id];
            if !function.is_dispatched() {
                continue;
            }
            let params = function.params.iter().map(|&p| ast[ast[p].ty].clone()).collect();
            let returns = function.returns.iter().map(|&r| ast[ast[r].ty].clone()).collect();
            add(ast.function_signature(id)?, params, returns, Callable::Function(id))?;
        }
        for &decl in &ast[contract].state_variables {
            let var = &ast[decl];
            if !var.visibility.is_external() {
                continue;
            }
            let (params, returns) = ast.accessor_signature(decl);
            let signature = ast.signature(&var.name, &params)?;
            add(signature, params, returns, Callable::Accessor(decl))?;
        }
        Ok(interface)
    }
}

/// The runtime code: dispatcher, fallback and receive, argument decoding stubs and functions.
fn append_runtime(
    ctx: &mut CompilerContext<'_>,
    mut interface: BTreeMap<u32, ExternalFunction>,
) -> Result<BTreeMap<u32, ExternalFunction>> {
    let ast = ctx.ast();
    let contract = &ast[ctx.contract()];
    let special = |kind: FunctionKind| {
        contract.functions.iter().copied().find(|&f| ast[f].kind == kind)
    };
    let fallback = special(FunctionKind::Fallback);
    let receive = special(FunctionKind::Receive);

    CompilerUtils::new(ctx).initialise_free_memory_pointer(0);

    let not_found = ctx.new_tag();
    if !interface.is_empty() {
        ctx.push(DATA_START_OFFSET)
            .op(Instruction::CALLDATASIZE)
            .op(Instruction::LT)
            .append_conditional_jump_to(&not_found);
        ctx.push(0u64).op(Instruction::CALLDATALOAD);
        CompilerUtils::new(ctx).right_shift_number_on_stack(224);
        for (&selector, function) in &mut interface {
            function.entry = ctx.new_tag();
            ctx.op(Instruction::DUP1)
                .push(selector)
                .op(Instruction::EQ)
                .append_conditional_jump_to(&function.entry);
        }
        ctx.op(Instruction::POP);
    }
    ctx.append(not_found);

    let receive_tag = receive.map(|_| ctx.new_tag());
    if let Some(tag) = &receive_tag {
        ctx.op(Instruction::CALLDATASIZE).op(Instruction::ISZERO).append_conditional_jump_to(tag);
    }
    match fallback {
        Some(fallback) => {
            if !ast[fallback].is_payable() {
                append_callvalue_check(ctx);
            }
            append_call_and_stop(ctx, fallback);
        }
        None => {
            ctx.append_revert();
        }
    }
    if let (Some(receive), Some(tag)) = (receive, receive_tag) {
        ctx.set_stack_offset(0);
        ctx.append(tag);
        append_call_and_stop(ctx, receive);
    }

    for function in interface.values() {
        append_external_stub(ctx, function)?;
    }

    append_missing_functions(ctx)?;
    ctx.append_shared_blocks();
    Ok(interface)
}

/// Decodes the arguments of an external call, calls the function and returns the
/// ABI-encoded results. The selector is on the stack on entry.
fn append_external_stub(ctx: &mut CompilerContext<'_>, function: &ExternalFunction) -> Result<()> {
    let ast = ctx.ast();
    let payable = match function.callable {
        Callable::Function(id) => ast[id].is_payable(),
        Callable::Accessor(_) => false,
    };
    ctx.set_stack_offset(1);
    ctx.append(function.entry.clone()).op(Instruction::POP);
    if !payable {
        append_callvalue_check(ctx);
    }

    let return_tag = ctx.push_new_tag();
    if !function.params.is_empty() {
        ctx.push(DATA_START_OFFSET)
            .push(DATA_START_OFFSET)
            .op(Instruction::CALLDATASIZE)
            .op(Instruction::SUB);
        CompilerUtils::new(ctx).abi_decode(&function.params, false)?;
    }
    let entry = ctx.function_entry_label(function.callable);
    ctx.append(entry.to_push_tag()).append_jump(JumpType::IntoFunction);
    let param_size = ast.sizes_on_stack(&function.params);
    let return_size = ast.sizes_on_stack(&function.returns);
    ctx.adjust_stack_offset(return_size as i32 - param_size as i32 - 1);
    ctx.append(return_tag);

    let targets: Vec<Type> =
        function.returns.iter().map(|ty| ty.with_location(DataLocation::Memory)).collect();
    let mut utils = CompilerUtils::new(ctx);
    utils.fetch_free_memory_pointer();
    utils.abi_encode(&function.returns, &targets)?;
    utils.to_size_after_free_memory_pointer();
    ctx.op(Instruction::RETURN);
    Ok(())
}

/// The creation code: initialisers and constructor, then returns the runtime code with the
/// immutables filled in.
fn append_creation(ctx: &mut CompilerContext<'_>, runtime: Assembly) -> Result<()> {
    let ast = ctx.ast();
    let contract = &ast[ctx.contract()];
    let runtime_sub = ctx.add_runtime_sub(runtime);
    ensure!(runtime_sub == 0, "runtime code is sub-assembly {runtime_sub}");

    let immutables: Vec<DeclId> =
        contract.state_variables.iter().copied().filter(|&v| ast[v].is_immutable()).collect();
    for (i, &decl) in immutables.iter().enumerate() {
        let offset = GENERAL_PURPOSE_MEMORY_START + 32 * i as u64;
        ctx.register_immutable(decl, U256::from(offset));
    }
    CompilerUtils::new(ctx).initialise_free_memory_pointer(32 * immutables.len() as u64);

    let constructor = contract.functions.iter().copied().find(|&f| ast[f].is_constructor());
    if !constructor.is_some_and(|c| ast[c].is_payable()) {
        append_callvalue_check(ctx);
    }
    for &decl in &contract.state_variables {
        ExpressionCompiler::new(ctx).append_state_variable_initialisation(decl)?;
    }
    if let Some(constructor) = constructor {
        append_constructor_call(ctx, constructor)?;
    }

    for &decl in &immutables {
        let offset = ctx.immutable_memory_offset(decl)?;
        ctx.push(offset).op(Instruction::MLOAD);
    }
    ctx.append(AssemblyItem::push_sub_size(runtime_sub))
        .op(Instruction::DUP1)
        .append(AssemblyItem::push_sub(runtime_sub))
        .push(0u64)
        .op(Instruction::CODECOPY);
    // value... size
    for &decl in immutables.iter().rev() {
        let id = immutable_id(&ctx.immutable_name(decl));
        ctx.op(Instruction::SWAP1).push(0u64).append(AssemblyItem::assign_immutable(id));
    }
    ctx.push(0u64).op(Instruction::RETURN);

    append_missing_functions(ctx)?;
    ctx.append_shared_blocks();
    Ok(())
}

/// Decodes the constructor arguments appended to the creation code and calls the constructor.
fn append_constructor_call(ctx: &mut CompilerContext<'_>, constructor: FunctionId) -> Result<()> {
    let ast = ctx.ast();
    let function = &ast[constructor];
    let params: Vec<Type> = function.params.iter().map(|&p| ast[ast[p].ty].clone()).collect();

    let return_tag = ctx.push_new_tag();
    if !params.is_empty() {
        ctx.append_program_size().op(Instruction::CODESIZE).op(Instruction::SUB);
        CompilerUtils::new(ctx).fetch_free_memory_pointer();
        // length memory
        ctx.op(Instruction::DUP2)
            .append_program_size()
            .op(Instruction::DUP3)
            .op(Instruction::CODECOPY);
        ctx.op(Instruction::DUP2).op(Instruction::DUP2).op(Instruction::ADD);
        CompilerUtils::new(ctx).store_free_memory_pointer();
        ctx.op(Instruction::SWAP1);
        CompilerUtils::new(ctx).abi_decode(&params, true)?;
    }
    let entry = ctx.function_entry_label(Callable::Function(constructor));
    ctx.append(entry.to_push_tag()).append_jump(JumpType::IntoFunction);
    ctx.adjust_stack_offset(-(ast.sizes_on_stack(&params) as i32) - 1);
    ctx.append(return_tag);
    Ok(())
}

/// Reverts if ether was sent.
fn append_callvalue_check(ctx: &mut CompilerContext<'_>) {
    ctx.op(Instruction::CALLVALUE).append_conditional_revert(false);
}

/// Calls a function without parameters or return values and stops.
fn append_call_and_stop(ctx: &mut CompilerContext<'_>, function: FunctionId) {
    let return_tag = ctx.push_new_tag();
    let entry = ctx.function_entry_label(Callable::Function(function));
    ctx.append(entry.to_push_tag()).append_jump(JumpType::IntoFunction);
    ctx.adjust_stack_offset(-1);
    ctx.append(return_tag).op(Instruction::STOP);
}

/// Compiles the functions and low-level helpers referenced so far, until none is left.
fn append_missing_functions(ctx: &mut CompilerContext<'_>) -> Result<()> {
    loop {
        if let Some(callable) = ctx.next_function_to_compile() {
            match callable {
                Callable::Function(id) => StatementCompiler::new(ctx).compile_function(id)?,
                Callable::Accessor(decl) => append_accessor(ctx, decl)?,
            }
        } else if let Some((function, tag)) = ctx.next_low_level_function() {
            append_low_level_function(ctx, &function, tag)?;
        } else {
            // Dispatch routines only jump to functions whose entry tags exist already.
            ctx.append_internal_dispatch();
            return Ok(());
        }
    }
}

fn append_accessor(ctx: &mut CompilerContext<'_>, decl: DeclId) -> Result<()> {
    let ast = ctx.ast();
    let (params, _) = ast.accessor_signature(decl);
    let entry = ctx.function_entry_label(Callable::Accessor(decl));
    ctx.set_stack_offset(ast.sizes_on_stack(&params) as i32 + 1);
    ctx.append(entry);
    ExpressionCompiler::new(ctx).append_state_variable_accessor(decl)
}

fn append_low_level_function(
    ctx: &mut CompilerContext<'_>,
    function: &LowLevelFunction,
    tag: AssemblyItem,
) -> Result<()> {
    let (inputs, outputs) = function.arity();
    ctx.set_stack_offset(inputs as i32 + 1);
    ctx.append(tag);
    match function {
        LowLevelFunction::CopyArrayToStorage { target, source } => {
            let (Type::Array(target), Type::Array(source)) = (target, source) else {
                return Err(CompileError::internal("array copy between non-array types"));
            };
            ArrayUtils::new(ctx).copy_array_to_storage_body(target, source)?;
        }
        LowLevelFunction::ClearArray(ty) => ArrayUtils::new(ctx).clear_array_body(array_of(ty)?)?,
        LowLevelFunction::ResizeDynamicArray(ty) => {
            ArrayUtils::new(ctx).resize_dynamic_array_body(array_of(ty)?)?;
        }
        LowLevelFunction::ClearStorageLoop(ty) => {
            ArrayUtils::new(ctx).clear_storage_loop_body(ty)?;
        }
        LowLevelFunction::MemoryCopy => CompilerUtils::new(ctx).memory_copy_body()?,
        LowLevelFunction::AbiEncodeBytes => CompilerUtils::new(ctx).abi_encode_bytes_body()?,
    }
    ensure!(
        ctx.stack_height() == outputs + 1,
        "{function:?} left {} slots instead of {outputs}",
        ctx.stack_height().saturating_sub(1)
    );
    CompilerUtils::new(ctx).move_to_stack_top(outputs, 1)?;
    ctx.append_jump(JumpType::OutOfFunction);
    Ok(())
}

fn array_of(ty: &Type) -> Result<&ArrayType> {
    match ty {
        Type::Array(array) => Ok(array),
        _ => Err(CompileError::internal(format!("{ty:?} is not an array"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{
        Contract, ExprKind, Function, Res, StateMutability, StmtKind, Variable, Visibility,
    };

    /// `contract Store { uint public x; function set(uint v) external { x = v; } }`
    fn store() -> (Ast, ContractId) {
        let mut ast = Ast::new();
        let contract = ast.add_contract(Contract::new("Store"));
        let uint = ast.intern(Type::uint(256));
        let x = ast.add_state_variable(
            contract,
            Variable { visibility: Visibility::Public, ..Variable::new("x", uint) },
        );
        let v = ast.add_variable(Variable::new("v", uint));
        let lhs = ast.add_expr(ExprKind::Ident(Res::Variable(x)), uint);
        let rhs = ast.add_expr(ExprKind::Ident(Res::Variable(v)), uint);
        let assign = ast.add_expr(ExprKind::Assign(lhs, None, rhs), uint);
        let stmt = ast.add_stmt(StmtKind::Expr(assign));
        let body = ast.add_stmt(StmtKind::Block(vec![stmt]));
        ast.add_function(
            contract,
            Function {
                visibility: Visibility::External,
                params: vec![v],
                body: Some(body),
                ..Function::new("set")
            },
        );
        (ast, contract)
    }

    fn compile(ast: &Ast, contract: ContractId, settings: &CompilerSettings) -> CompiledContract {
        ContractCompiler::new(ast, settings).compile(contract).unwrap()
    }

    #[test]
    fn test_dispatcher_lists_functions_and_getters() {
        let (ast, contract) = store();
        let compiled = compile(&ast, contract, &CompilerSettings::default());
        let getter = selector("x()");
        let setter = selector("set(uint256)");
        assert_eq!(compiled.external_functions.keys().copied().collect::<Vec<_>>(), {
            let mut selectors = vec![getter, setter];
            selectors.sort_unstable();
            selectors
        });
        assert_eq!(compiled.external_functions[&setter].params, vec![Type::uint(256)]);
        assert_eq!(compiled.external_functions[&getter].returns, vec![Type::uint(256)]);

        let (first, second) = (getter.min(setter), getter.max(setter));
        let expected = format!(
            "  PUSH 0x80
  PUSH 0x40
  MSTORE
  PUSH 0x4
  CALLDATASIZE
  LT
  PUSH [tag] 1
  JUMPI
  PUSH 0x0
  CALLDATALOAD
  PUSH 0xe0
  SHR
  DUP1
  PUSH {first:#x}
  EQ
  PUSH [tag] 2
  JUMPI
  DUP1
  PUSH {second:#x}
  EQ
  PUSH [tag] 3
  JUMPI
  POP
tag_1:
  PUSH 0x0
  DUP1
  REVERT
tag_2:
  POP
  CALLVALUE
"
        );
        let runtime = compiled.runtime.to_string();
        assert!(runtime.starts_with(&expected), "{runtime}");
        assert!(runtime.contains("JUMP [out]"));
        assert!(runtime.contains("SSTORE"));
    }

    #[test]
    fn test_creation_code_returns_runtime() {
        let (ast, contract) = store();
        let compiled = compile(&ast, contract, &CompilerSettings::default());
        let creation = compiled.creation.to_string();
        assert!(creation.starts_with("  PUSH 0x80\n  PUSH 0x40\n  MSTORE\n  CALLVALUE\n"));
        let copy = "  PUSH #[$] 0x0\n  DUP1\n  PUSH [$] 0x0\n  PUSH 0x0\n  CODECOPY\n";
        assert!(creation.contains(copy));
        assert_eq!(compiled.creation.subs().len(), 1);

        let object = compiled.creation.assemble().unwrap();
        assert_eq!(&object.bytecode[..5], &[0x60, 0x80, 0x60, 0x40, 0x52]);
        let runtime = compiled.runtime.assemble().unwrap();
        let tail = &object.bytecode[object.bytecode.len() - runtime.bytecode.len()..];
        assert_eq!(tail, runtime.bytecode.as_slice());
    }

    #[test]
    fn test_optimised_contract_still_assembles() {
        let (ast, contract) = store();
        let settings = CompilerSettings::for_opt_level(solgen_config::OptLevel::O2);
        let optimised = compile(&ast, contract, &settings);
        assert_eq!(optimised.external_functions.len(), 2);
        let object = optimised.creation.assemble().unwrap();
        let runtime = optimised.runtime.assemble().unwrap();
        assert!(object.bytecode.ends_with(&runtime.bytecode));
    }

    #[test]
    fn test_payable_constructor_skips_callvalue_check() {
        let (mut ast, contract) = store();
        let body = ast.add_stmt(StmtKind::Block(vec![]));
        ast.add_function(
            contract,
            Function {
                kind: FunctionKind::Constructor,
                mutability: StateMutability::Payable,
                body: Some(body),
                ..Function::new("")
            },
        );
        let compiled = compile(&ast, contract, &CompilerSettings::default());
        let items = compiled.creation.items();
        assert!(!items.contains(&AssemblyItem::operation(Instruction::CALLVALUE)));
        assert!(items.iter().any(|item| item.jump_type() == JumpType::IntoFunction));
    }

    #[test]
    fn test_immutable_is_assigned_from_constructor_argument() {
        let mut ast = Ast::new();
        let contract = ast.add_contract(Contract::new("Fixed"));
        let uint = ast.intern(Type::uint(256));
        let k = ast.add_state_variable(
            contract,
            Variable {
                mutability: crate::ast::VarMutability::Immutable,
                visibility: Visibility::Public,
                ..Variable::new("k", uint)
            },
        );
        let a = ast.add_variable(Variable::new("a", uint));
        let lhs = ast.add_expr(ExprKind::Ident(Res::Variable(k)), uint);
        let rhs = ast.add_expr(ExprKind::Ident(Res::Variable(a)), uint);
        let assign = ast.add_expr(ExprKind::Assign(lhs, None, rhs), uint);
        let stmt = ast.add_stmt(StmtKind::Expr(assign));
        let body = ast.add_stmt(StmtKind::Block(vec![stmt]));
        ast.add_function(
            contract,
            Function {
                kind: FunctionKind::Constructor,
                params: vec![a],
                body: Some(body),
                ..Function::new("")
            },
        );

        let compiled = compile(&ast, contract, &CompilerSettings::default());
        let creation = compiled.creation.to_string();
        assert!(creation.contains("PUSHSIZE\n  CODESIZE\n  SUB\n"), "{creation}");
        assert!(creation.contains("ASSIGNIMMUTABLE"));
        assert!(compiled.runtime.to_string().contains("PUSHIMMUTABLE"));

        let object = compiled.creation.assemble().unwrap();
        assert!(object.immutable_references.is_empty());
        let runtime = compiled.runtime.assemble().unwrap();
        assert_eq!(runtime.immutable_references.len(), 1);
    }

    #[test]
    fn test_missing_fallback_reverts() {
        let mut ast = Ast::new();
        let contract = ast.add_contract(Contract::new("Empty"));
        let compiled = compile(&ast, contract, &CompilerSettings::default());
        assert_eq!(
            compiled.runtime.to_string(),
            "  PUSH 0x80\n  PUSH 0x40\n  MSTORE\ntag_1:\n  PUSH 0x0\n  DUP1\n  REVERT\n"
        );
        assert!(compiled.external_functions.is_empty());
    }

    #[test]
    fn test_selector_clash_is_reported() {
        let (mut ast, contract) = store();
        let uint = ast.intern(Type::uint(256));
        ast.add_state_variable(
            contract,
            Variable { visibility: Visibility::Public, ..Variable::new("x", uint) },
        );
        let err = ContractCompiler::new(&ast, &CompilerSettings::default())
            .compile(contract)
            .unwrap_err();
        assert!(matches!(err, CompileError::InternalCompilerError(_)), "{err}");
    }
}
