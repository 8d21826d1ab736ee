//! The state shared by all parts of the code generator while one assembly is produced.

use crate::{
    CompilerSettings, Result,
    ast::{Ast, ContractId, DeclId, FunctionId},
    error::{CompileError, ensure},
    panic::PanicCode,
    types::{StorageLayout, Type},
    utils::CompilerUtils,
};
use alloy_primitives::{U256, ruint::UintTryFrom};
use rustc_hash::FxHashMap;
use solgen_config::EvmVersion;
use solgen_evmasm::{Assembly, AssemblyItem, Instruction, ItemKind, JumpType, SourceLocation};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, trace};

/// Something with a function entry tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Callable {
    Function(FunctionId),
    /// The getter of a public state variable.
    Accessor(DeclId),
}

/// Helper routines that are emitted at most once per assembly and called through a jump.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LowLevelFunction {
    /// `target_ref source_ref source_length -> target_ref`
    CopyArrayToStorage { target: Type, source: Type },
    /// `ref offset -> `
    ClearArray(Type),
    /// `ref new_length -> `
    ResizeDynamicArray(Type),
    /// `end_ref start_ref -> end_ref`
    ClearStorageLoop(Type),
    /// `length target source -> `
    MemoryCopy,
    /// `target source -> new_target`: writes a memory byte array as length, data and padding.
    AbiEncodeBytes,
}

impl LowLevelFunction {
    /// Number of stack slots consumed and produced.
    pub fn arity(&self) -> (usize, usize) {
        match self {
            Self::CopyArrayToStorage { .. } => (3, 1),
            Self::ClearArray(_) | Self::ResizeDynamicArray(_) => (2, 0),
            Self::ClearStorageLoop(_) => (2, 1),
            Self::MemoryCopy => (3, 0),
            Self::AbiEncodeBytes => (2, 1),
        }
    }
}

/// Code generation context of one assembly: the creation or the runtime code of a contract.
#[derive(Debug)]
pub struct CompilerContext<'a> {
    ast: &'a Ast,
    settings: &'a CompilerSettings,
    contract: ContractId,
    storage_layout: &'a StorageLayout,
    /// Creation code of the contracts that can be created with `new`.
    creation_code: &'a FxHashMap<ContractId, Assembly>,
    runtime: bool,
    assembly: Assembly,
    location: SourceLocation,

    /// Stack index of the lowest slot of every local variable in scope.
    local_variables: FxHashMap<DeclId, usize>,
    /// Memory offsets of immutables while the constructor runs.
    immutable_slots: FxHashMap<DeclId, U256>,

    entry_tags: FxHashMap<Callable, AssemblyItem>,
    function_queue: VecDeque<Callable>,
    low_level_functions: FxHashMap<LowLevelFunction, AssemblyItem>,
    low_level_queue: VecDeque<(LowLevelFunction, AssemblyItem)>,
    panic_tags: BTreeMap<PanicCode, AssemblyItem>,
    revert_tag: Option<AssemblyItem>,
    forwarding_revert_tag: Option<AssemblyItem>,
    sub_ids: FxHashMap<ContractId, usize>,
    internal_dispatch: BTreeMap<(usize, usize), BTreeSet<FunctionId>>,
    /// Entry tags of the dispatch routines for calls through function values, by arity.
    dispatch_tags: BTreeMap<(usize, usize), AssemblyItem>,
}

impl<'a> CompilerContext<'a> {
    pub fn new(
        ast: &'a Ast,
        settings: &'a CompilerSettings,
        contract: ContractId,
        storage_layout: &'a StorageLayout,
        creation_code: &'a FxHashMap<ContractId, Assembly>,
        runtime: bool,
    ) -> Self {
        Self {
            ast,
            settings,
            contract,
            storage_layout,
            creation_code,
            runtime,
            assembly: Assembly::new(),
            location: SourceLocation::default(),
            local_variables: FxHashMap::default(),
            immutable_slots: FxHashMap::default(),
            entry_tags: FxHashMap::default(),
            function_queue: VecDeque::new(),
            low_level_functions: FxHashMap::default(),
            low_level_queue: VecDeque::new(),
            panic_tags: BTreeMap::new(),
            revert_tag: None,
            forwarding_revert_tag: None,
            sub_ids: FxHashMap::default(),
            internal_dispatch: BTreeMap::new(),
            dispatch_tags: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn ast(&self) -> &'a Ast {
        self.ast
    }

    #[inline]
    pub fn settings(&self) -> &'a CompilerSettings {
        self.settings
    }

    #[inline]
    pub fn evm_version(&self) -> EvmVersion {
        self.settings.evm_version
    }

    #[inline]
    pub fn contract(&self) -> ContractId {
        self.contract
    }

    /// Whether the runtime code is generated, as opposed to the creation code.
    #[inline]
    pub fn is_runtime(&self) -> bool {
        self.runtime
    }

    #[inline]
    pub fn assembly(&self) -> &Assembly {
        &self.assembly
    }

    #[inline]
    pub fn assembly_mut(&mut self) -> &mut Assembly {
        &mut self.assembly
    }

    pub fn into_assembly(self) -> Assembly {
        self.assembly
    }

    /// Sets the source location attached to the items appended from now on.
    pub fn set_location(&mut self, location: SourceLocation) -> SourceLocation {
        self.assembly.set_source_location(location);
        std::mem::replace(&mut self.location, location)
    }

    #[inline]
    pub fn location(&self) -> SourceLocation {
        self.location
    }

    /// The error for an access beyond the reach of `DUP16`/`SWAP16`.
    pub fn stack_too_deep(&self) -> CompileError {
        CompileError::StackTooDeep { location: self.location }
    }

    // ---- emission ----

    pub fn append(&mut self, item: impl Into<AssemblyItem>) -> &mut Self {
        self.assembly.append(item);
        self
    }

    #[inline]
    pub fn op(&mut self, instruction: Instruction) -> &mut Self {
        self.append(instruction)
    }

    #[inline]
    pub fn push<T>(&mut self, value: T) -> &mut Self
    where
        U256: UintTryFrom<T>,
    {
        self.append(AssemblyItem::push(value))
    }

    /// Appends `DUPn`, failing if `n` is out of reach.
    pub fn dup(&mut self, n: usize) -> Result<&mut Self> {
        ensure!(n > 0, "DUP0 requested");
        if n > 16 {
            return Err(self.stack_too_deep());
        }
        Ok(self.op(Instruction::dup(n as u8)))
    }

    /// Appends `SWAPn`, failing if `n` is out of reach.
    pub fn swap(&mut self, n: usize) -> Result<&mut Self> {
        ensure!(n > 0, "SWAP0 requested");
        if n > 16 {
            return Err(self.stack_too_deep());
        }
        Ok(self.op(Instruction::swap(n as u8)))
    }

    /// Appends `count` `POP`s.
    pub fn pop(&mut self, count: usize) -> &mut Self {
        for _ in 0..count {
            self.op(Instruction::POP);
        }
        self
    }

    pub fn new_tag(&mut self) -> AssemblyItem {
        self.assembly.new_tag()
    }

    /// Pushes a new tag and returns the tag.
    pub fn push_new_tag(&mut self) -> AssemblyItem {
        let tag = self.assembly.new_tag();
        self.append(tag.to_push_tag());
        tag
    }

    pub fn append_jump_to(&mut self, tag: &AssemblyItem, jump_type: JumpType) -> &mut Self {
        self.assembly.append_jump(tag, jump_type);
        self
    }

    /// Appends a `JUMP` to the tag on the stack.
    pub fn append_jump(&mut self, jump_type: JumpType) -> &mut Self {
        self.append(AssemblyItem::operation(Instruction::JUMP).with_jump_type(jump_type))
    }

    pub fn append_conditional_jump_to(&mut self, tag: &AssemblyItem) -> &mut Self {
        self.assembly.append_jumpi(tag);
        self
    }

    /// Appends a jump to a new tag taken if the top of the stack is non-zero.
    pub fn append_conditional_jump(&mut self) -> AssemblyItem {
        let tag = self.new_tag();
        self.append_conditional_jump_to(&tag);
        tag
    }

    /// Appends `PUSHSIZE`, the size of the whole program including sub-assemblies and data.
    pub fn append_program_size(&mut self) -> &mut Self {
        self.append(AssemblyItem::new(ItemKind::PushProgramSize, U256::ZERO))
    }

    /// Reverts without data.
    pub fn append_revert(&mut self) -> &mut Self {
        self.push(0u64).op(Instruction::DUP1).op(Instruction::REVERT)
    }

    /// Reverts if the top of the stack is non-zero, consuming it. With `forward_return_data`
    /// the return data of the last call is used as revert data.
    pub fn append_conditional_revert(&mut self, forward_return_data: bool) -> &mut Self {
        let tag = if forward_return_data && self.evm_version().supports_returndata() {
            self.forwarding_revert_tag.get_or_insert_with(|| self.assembly.new_tag()).clone()
        } else {
            self.revert_tag.get_or_insert_with(|| self.assembly.new_tag()).clone()
        };
        self.append_conditional_jump_to(&tag)
    }

    /// The tag of the shared block panicking with `code`.
    pub fn panic_tag(&mut self, code: PanicCode) -> AssemblyItem {
        self.panic_tags.entry(code).or_insert_with(|| self.assembly.new_tag()).clone()
    }

    /// Panics with `code` if the top of the stack is non-zero, consuming it.
    pub fn append_conditional_panic(&mut self, code: PanicCode) -> &mut Self {
        let tag = self.panic_tag(code);
        self.append_conditional_jump_to(&tag)
    }

    /// Panics with `code`.
    pub fn append_panic(&mut self, code: PanicCode) -> &mut Self {
        let tag = self.panic_tag(code);
        self.append_jump_to(&tag, JumpType::Ordinary)
    }

    /// Appends the shared panic and revert blocks that were jumped to.
    pub fn append_shared_blocks(&mut self) {
        let panics = std::mem::take(&mut self.panic_tags);
        for (code, tag) in panics {
            self.set_stack_offset(0);
            self.append(tag)
                .push(PanicCode::selector_word())
                .push(0u64)
                .op(Instruction::MSTORE)
                .push(code.code())
                .push(4u64)
                .op(Instruction::MSTORE)
                .push(0x24u64)
                .push(0u64)
                .op(Instruction::REVERT);
        }
        if let Some(tag) = self.revert_tag.take() {
            self.set_stack_offset(0);
            self.append(tag).append_revert();
        }
        if let Some(tag) = self.forwarding_revert_tag.take() {
            self.set_stack_offset(0);
            self.append(tag)
                .op(Instruction::RETURNDATASIZE)
                .push(0u64)
                .op(Instruction::DUP1)
                .op(Instruction::RETURNDATACOPY)
                .op(Instruction::RETURNDATASIZE)
                .push(0u64)
                .op(Instruction::REVERT);
        }
    }

    // ---- stack bookkeeping ----

    /// The number of stack slots in use.
    #[inline]
    pub fn stack_height(&self) -> usize {
        self.assembly.deposit().max(0) as usize
    }

    /// Adjusts the stack height for effects the items do not show, like jumps.
    #[inline]
    pub fn adjust_stack_offset(&mut self, adjustment: i32) {
        self.assembly.adjust_deposit(adjustment);
    }

    #[inline]
    pub fn set_stack_offset(&mut self, height: i32) {
        self.assembly.set_deposit(height);
    }

    /// Converts a stack index into a distance from the top, `0` being the top slot.
    pub fn base_to_current_stack_offset(&self, base: usize) -> usize {
        self.stack_height().saturating_sub(base + 1)
    }

    /// Converts a distance from the top into a stack index.
    pub fn current_to_base_stack_offset(&self, offset: usize) -> usize {
        self.stack_height().saturating_sub(offset + 1)
    }

    // ---- variables ----

    /// Registers a local variable whose lowest slot is `offset_to_current` slots below the
    /// current height.
    pub fn add_variable(&mut self, decl: DeclId, offset_to_current: usize) {
        let base = self.stack_height().saturating_sub(offset_to_current);
        trace!(?decl, base, "added local variable");
        self.local_variables.insert(decl, base);
    }

    pub fn remove_variable(&mut self, decl: DeclId) {
        self.local_variables.remove(&decl);
    }

    #[inline]
    pub fn is_local_variable(&self, decl: DeclId) -> bool {
        self.local_variables.contains_key(&decl)
    }

    /// Number of local variables in scope.
    #[inline]
    pub fn number_of_local_variables(&self) -> usize {
        self.local_variables.len()
    }

    pub fn base_stack_offset_of_variable(&self, decl: DeclId) -> Result<usize> {
        self.local_variables.get(&decl).copied().ok_or_else(|| {
            CompileError::internal(format!("variable {decl:?} is not on the stack"))
        })
    }

    pub fn storage_location_of_variable(&self, decl: DeclId) -> Result<(U256, u8)> {
        self.storage_layout.get(&decl).copied().ok_or_else(|| {
            CompileError::internal(format!("variable {decl:?} is not in storage"))
        })
    }

    /// Reserves the memory slot of an immutable during construction.
    pub fn register_immutable(&mut self, decl: DeclId, offset: U256) {
        self.immutable_slots.insert(decl, offset);
    }

    /// The memory offset holding an immutable during construction.
    pub fn immutable_memory_offset(&self, decl: DeclId) -> Result<U256> {
        ensure!(!self.runtime, "immutable {} read from memory at runtime", self.ast[decl].name);
        self.immutable_slots.get(&decl).copied().ok_or_else(|| {
            CompileError::internal(format!("immutable {} has no slot", self.ast[decl].name))
        })
    }

    /// The name an immutable is referred to by in `PUSHIMMUTABLE` and `ASSIGNIMMUTABLE`.
    pub fn immutable_name(&self, decl: DeclId) -> String {
        format!("{}_{}", self.ast[decl].name, decl.index())
    }

    // ---- functions ----

    /// The entry tag of a function, queueing it for compilation on first use.
    pub fn function_entry_label(&mut self, callable: Callable) -> AssemblyItem {
        if let Some(tag) = self.entry_tags.get(&callable) {
            return tag.clone();
        }
        let tag = self.assembly.new_tag();
        self.entry_tags.insert(callable, tag.clone());
        self.function_queue.push_back(callable);
        tag
    }

    /// Pops the next function whose entry tag was handed out but that was not compiled yet.
    pub fn next_function_to_compile(&mut self) -> Option<Callable> {
        self.function_queue.pop_front()
    }

    /// Entry tags of the functions referenced so far.
    pub fn entry_tags(&self) -> &FxHashMap<Callable, AssemblyItem> {
        &self.entry_tags
    }

    /// Records an internal function whose entry tag is used as a value.
    pub fn record_internal_pointer(&mut self, function: FunctionId) {
        let f = &self.ast[function];
        let key = (f.params.len(), f.returns.len());
        self.internal_dispatch.entry(key).or_default().insert(function);
    }

    pub fn internal_dispatch(&self) -> &BTreeMap<(usize, usize), BTreeSet<FunctionId>> {
        &self.internal_dispatch
    }

    /// The entry tag of the routine that calls function values with the given numbers of
    /// parameters and return values.
    pub fn internal_dispatch_label(&mut self, params: usize, returns: usize) -> AssemblyItem {
        self.dispatch_tags
            .entry((params, returns))
            .or_insert_with(|| self.assembly.new_tag())
            .clone()
    }

    /// Appends the dispatch routines whose labels were handed out.
    ///
    /// Stack pre: `<return tag> <args> <function value>`. The value is compared against the
    /// entry of every function of matching arity that is used as a value; a value that matches
    /// none panics.
    pub fn append_internal_dispatch(&mut self) {
        let routines = std::mem::take(&mut self.dispatch_tags);
        for (arity, tag) in routines {
            let functions = self.internal_dispatch.get(&arity).cloned().unwrap_or_default();
            debug!(?arity, functions = functions.len(), "internal dispatch");
            self.set_stack_offset(1);
            self.append(tag);
            let mut cases = Vec::with_capacity(functions.len());
            for function in functions {
                let entry = self.function_entry_label(Callable::Function(function));
                let case = self.new_tag();
                self.op(Instruction::DUP1)
                    .append(entry.to_push_tag())
                    .op(Instruction::EQ)
                    .append_conditional_jump_to(&case);
                cases.push((case, entry));
            }
            self.append_panic(PanicCode::ZeroInitialisedFunction);
            for (case, entry) in cases {
                self.set_stack_offset(1);
                self.append(case).op(Instruction::POP);
                self.append_jump_to(&entry, JumpType::Ordinary);
            }
        }
    }

    /// Calls a low-level function, generating it later if this is its first use.
    ///
    /// Stack pre: inputs; post: outputs.
    pub fn call_low_level_function(&mut self, function: LowLevelFunction) -> Result<()> {
        let (inputs, outputs) = function.arity();
        let return_tag = self.push_new_tag();
        CompilerUtils::new(self).move_into_stack(inputs, 1)?;
        let entry = match self.low_level_functions.get(&function) {
            Some(tag) => tag.clone(),
            None => {
                let tag = self.assembly.new_tag();
                self.low_level_functions.insert(function.clone(), tag.clone());
                self.low_level_queue.push_back((function, tag.clone()));
                tag
            }
        };
        self.append_jump_to(&entry, JumpType::IntoFunction);
        self.adjust_stack_offset(outputs as i32 - 1 - inputs as i32);
        self.append(return_tag);
        Ok(())
    }

    /// Pops the next low-level function that was called but not generated yet.
    pub fn next_low_level_function(&mut self) -> Option<(LowLevelFunction, AssemblyItem)> {
        self.low_level_queue.pop_front()
    }

    // ---- sub-assemblies ----

    /// The sub-assembly holding the creation code of `contract`, added on first use.
    pub fn creation_code_sub(&mut self, contract: ContractId) -> Result<usize> {
        if let Some(&id) = self.sub_ids.get(&contract) {
            return Ok(id);
        }
        ensure!(contract != self.contract, "contract {} creates itself", self.ast[contract].name);
        let code = self.creation_code.get(&contract).ok_or_else(|| {
            CompileError::internal(format!("no code for contract {}", self.ast[contract].name))
        })?;
        let id = self.assembly.new_sub(code.clone()).data().saturating_to::<usize>();
        self.sub_ids.insert(contract, id);
        Ok(id)
    }

    /// Adds the runtime code as a sub-assembly and returns its id.
    pub fn add_runtime_sub(&mut self, runtime: Assembly) -> usize {
        self.assembly.new_sub(runtime).data().saturating_to::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Contract;

    fn with_context(f: impl FnOnce(&mut CompilerContext<'_>)) {
        let mut ast = Ast::new();
        let contract = ast.add_contract(Contract::new("C"));
        let settings = CompilerSettings::default();
        let layout = StorageLayout::default();
        let code = FxHashMap::default();
        let mut ctx = CompilerContext::new(&ast, &settings, contract, &layout, &code, true);
        f(&mut ctx);
    }

    #[test]
    fn test_stack_offsets() {
        with_context(|ctx| {
            ctx.push(1u64).push(2u64);
            ctx.add_variable(DeclId::from_usize(0), 1);
            assert_eq!(ctx.base_stack_offset_of_variable(DeclId::from_usize(0)).unwrap(), 1);
            assert_eq!(ctx.base_to_current_stack_offset(1), 0);
            ctx.push(3u64);
            assert_eq!(ctx.base_to_current_stack_offset(1), 1);
            assert_eq!(ctx.current_to_base_stack_offset(1), 1);
            assert!(ctx.base_stack_offset_of_variable(DeclId::from_usize(1)).is_err());
        });
    }

    #[test]
    fn test_dup_out_of_reach() {
        with_context(|ctx| {
            assert!(ctx.dup(16).is_ok());
            assert!(matches!(ctx.dup(17), Err(CompileError::StackTooDeep { .. })));
            assert!(matches!(ctx.swap(17), Err(CompileError::StackTooDeep { .. })));
            assert!(matches!(ctx.swap(0), Err(CompileError::InternalCompilerError(_))));
            assert!(matches!(ctx.dup(0), Err(CompileError::InternalCompilerError(_))));
        });
    }

    #[test]
    fn test_panic_blocks_are_shared() {
        with_context(|ctx| {
            ctx.push(1u64).append_conditional_panic(PanicCode::DivisionByZero);
            ctx.push(1u64).append_conditional_panic(PanicCode::DivisionByZero);
            ctx.append_shared_blocks();
            let items = ctx.assembly().items();
            assert_eq!(items.iter().filter(|item| item.is_tag()).count(), 1);
            assert_eq!(items[1], items[4]);
            assert!(items.last().unwrap().is(Instruction::REVERT));
        });
    }

    #[test]
    fn test_dispatch_without_candidates_panics() {
        with_context(|ctx| {
            let label = ctx.internal_dispatch_label(1, 0);
            assert_eq!(ctx.internal_dispatch_label(1, 0), label);
            ctx.append_internal_dispatch();
            ctx.append_shared_blocks();
            let items = ctx.assembly().items();
            assert_eq!(items[0], label);
            assert!(items[1].is_push_tag());
            assert!(items[2].is(Instruction::JUMP));
            assert!(items.contains(&AssemblyItem::push(0x51u64)));
            assert!(!items.iter().any(|item| item.is(Instruction::EQ)));
        });
    }

    #[test]
    fn test_low_level_function_is_queued_once() {
        with_context(|ctx| {
            ctx.push(1u64).push(2u64).push(3u64);
            ctx.call_low_level_function(LowLevelFunction::MemoryCopy).unwrap();
            assert_eq!(ctx.stack_height(), 0);
            ctx.push(1u64).push(2u64);
            ctx.call_low_level_function(LowLevelFunction::AbiEncodeBytes).unwrap();
            assert_eq!(ctx.stack_height(), 1);
            ctx.pop(1).push(1u64).push(2u64).push(3u64);
            ctx.call_low_level_function(LowLevelFunction::MemoryCopy).unwrap();
            assert!(ctx.next_low_level_function().is_some());
            assert!(ctx.next_low_level_function().is_some());
            assert!(ctx.next_low_level_function().is_none());
        });
    }
}
