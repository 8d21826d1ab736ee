//! Assignable locations.
//!
//! An [`LValue`] is created for an expression on the left of an assignment (or one that is
//! read through its location, like `x++`). The code for the expression leaves the reference of
//! the location on the stack: nothing for stack variables and immutables, `<slot> <offset>` for
//! storage, a pointer for memory and calldata.

use crate::{
    Result,
    array_utils::ArrayUtils,
    ast::DeclId,
    context::CompilerContext,
    error::{CompileError, ensure},
    types::{ArrayType, DataLocation, FunctionTypeKind, Type},
    utils::CompilerUtils,
};
use alloy_primitives::U256;
use solgen_evmasm::{AssemblyItem, Instruction, immutable_id};

/// A location a value can be read from and written to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LValue {
    /// A local variable on the stack.
    StackVariable { decl: DeclId, ty: Type },
    /// A value at a memory pointer. Unpadded items are single bytes written with `MSTORE8`.
    MemoryItem { ty: Type, padded: bool },
    /// A value in storage, referenced by slot and byte offset.
    StorageItem { ty: Type },
    /// A single byte of a storage `bytes` array, referenced by slot and byte number.
    StorageByteArrayElement,
    /// The length of a dynamic storage array.
    StorageArrayLength(ArrayType),
    /// A value in calldata. Read-only.
    CalldataItem { ty: Type },
    /// An immutable: memory during construction, a placeholder at runtime.
    Immutable { decl: DeclId, ty: Type },
    /// The components of a tuple on the left of an assignment. Empty components are skipped.
    Tuple(Vec<Option<LValue>>),
}

impl LValue {
    /// A storage value whose reference is already on the stack.
    pub fn storage(ty: Type) -> Self {
        Self::StorageItem { ty }
    }

    /// A memory value whose pointer is already on the stack.
    pub fn memory(ty: Type) -> Self {
        Self::MemoryItem { ty, padded: true }
    }

    /// A state variable. Pushes its slot and byte offset.
    pub fn state_variable(ctx: &mut CompilerContext<'_>, decl: DeclId) -> Result<Self> {
        let ast = ctx.ast();
        let (slot, offset) = ctx.storage_location_of_variable(decl)?;
        ctx.push(slot).push(offset);
        Ok(Self::StorageItem { ty: ast[ast[decl].ty].clone() })
    }

    /// A local variable.
    pub fn stack_variable(ctx: &CompilerContext<'_>, decl: DeclId) -> Self {
        let ast = ctx.ast();
        Self::StackVariable { decl, ty: ast[ast[decl].ty].clone() }
    }

    /// Number of stack slots taken by the reference.
    pub fn size_on_stack(&self) -> usize {
        match self {
            Self::StackVariable { .. } | Self::Immutable { .. } => 0,
            Self::MemoryItem { .. } | Self::CalldataItem { .. } | Self::StorageArrayLength(_) => 1,
            Self::StorageItem { .. } | Self::StorageByteArrayElement => 2,
            Self::Tuple(components) => components.iter().flatten().map(Self::size_on_stack).sum(),
        }
    }

    /// Pushes the value, consuming the reference if `remove`.
    pub fn retrieve_value(&self, ctx: &mut CompilerContext<'_>, remove: bool) -> Result<()> {
        match self {
            Self::StackVariable { decl, ty } => {
                let size = ctx.ast().size_on_stack(ty);
                let base = ctx.base_stack_offset_of_variable(*decl)?;
                let position = ctx.base_to_current_stack_offset(base);
                if position + 1 > 16 {
                    return Err(ctx.stack_too_deep());
                }
                ensure!(position + 1 >= size, "stack variable size mismatch");
                for _ in 0..size {
                    ctx.dup(position + 1)?;
                }
            }
            Self::MemoryItem { ty, padded } => {
                if !remove {
                    ctx.op(Instruction::DUP1);
                }
                if ty.is_value_type() {
                    CompilerUtils::new(ctx).load_from_memory_dynamic(ty, false, *padded, false)?;
                } else {
                    ctx.op(Instruction::MLOAD);
                }
            }
            Self::CalldataItem { ty } => {
                if ty.is_value_type() {
                    if !remove {
                        ctx.op(Instruction::DUP1);
                    }
                    CompilerUtils::new(ctx).load_from_memory_dynamic(ty, true, true, false)?;
                } else if !remove {
                    ctx.op(Instruction::DUP1);
                }
            }
            Self::StorageItem { ty } => retrieve_storage_value(ctx, ty, remove)?,
            Self::StorageByteArrayElement => {
                if remove {
                    ctx.op(Instruction::SWAP1).op(Instruction::SLOAD);
                    ctx.op(Instruction::SWAP1).op(Instruction::BYTE);
                } else {
                    ctx.op(Instruction::DUP2).op(Instruction::SLOAD);
                    ctx.op(Instruction::DUP2).op(Instruction::BYTE);
                }
                ctx.push(U256::from(1) << 248).op(Instruction::MUL);
            }
            Self::StorageArrayLength(array) => {
                ArrayUtils::new(ctx).retrieve_length(array, 0)?;
                if remove {
                    ctx.op(Instruction::SWAP1).op(Instruction::POP);
                }
            }
            Self::Immutable { decl, .. } => {
                if ctx.is_runtime() {
                    let id = immutable_id(&ctx.immutable_name(*decl));
                    ctx.append(AssemblyItem::push_immutable(id));
                } else {
                    let offset = ctx.immutable_memory_offset(*decl)?;
                    ctx.push(offset).op(Instruction::MLOAD);
                }
            }
            Self::Tuple(_) => return Err(CompileError::internal("tried to retrieve a tuple")),
        }
        Ok(())
    }

    /// Stores the value below the reference, consuming both if `move_`. Otherwise the value
    /// stays on the stack.
    ///
    /// Stack pre: `<value> <reference>`; post: `[<value>]`
    pub fn store_value(
        &self,
        ctx: &mut CompilerContext<'_>,
        source: &Type,
        move_: bool,
    ) -> Result<()> {
        match self {
            Self::StackVariable { decl, ty } => {
                let size = ctx.ast().size_on_stack(ty);
                let base = ctx.base_stack_offset_of_variable(*decl)?;
                let difference = ctx.base_to_current_stack_offset(base) + 1 - size;
                if difference > 16 {
                    return Err(ctx.stack_too_deep());
                }
                if difference > 0 {
                    for _ in 0..size {
                        ctx.swap(difference)?.op(Instruction::POP);
                    }
                }
                if !move_ {
                    self.retrieve_value(ctx, false)?;
                }
            }
            Self::MemoryItem { ty, padded } => {
                let source_size = ctx.ast().size_on_stack(source);
                let mut utils = CompilerUtils::new(ctx);
                if ty.is_value_type() {
                    ensure!(source.is_value_type(), "reference type stored as value type");
                    utils.move_into_stack(source_size, 1)?;
                    utils.convert_type(source, ty, true)?;
                    if !move_ {
                        utils.move_to_stack_top(1, 1)?;
                        utils.copy_to_stack_top(2, 1)?;
                    }
                    if *padded {
                        utils.store_in_memory_dynamic(ty, true)?;
                        ctx.op(Instruction::POP);
                    } else {
                        if matches!(ty, Type::FixedBytes(_)) {
                            ctx.push(0u64).op(Instruction::BYTE);
                        }
                        ctx.op(Instruction::SWAP1).op(Instruction::MSTORE8);
                    }
                } else {
                    if source != ty {
                        return Err(CompileError::unimplemented(
                            "conversion on assignment to memory",
                        ));
                    }
                    if !move_ {
                        ctx.op(Instruction::DUP2).op(Instruction::SWAP1);
                    }
                    // only the pointer is stored
                    ctx.op(Instruction::MSTORE);
                }
            }
            Self::StorageItem { ty } => store_storage_value(ctx, ty, source, move_)?,
            Self::StorageByteArrayElement => {
                // value ref byte_number
                ctx.push(31u64).op(Instruction::SUB).push(0x100u64).op(Instruction::EXP);
                ctx.op(Instruction::DUP2).op(Instruction::SLOAD);
                // clear the byte in the old value
                ctx.op(Instruction::DUP2).push(0xffu64).op(Instruction::MUL);
                ctx.op(Instruction::NOT).op(Instruction::AND);
                ctx.op(Instruction::SWAP1);
                ctx.push(U256::from(1) << 248).op(Instruction::DUP5).op(Instruction::DIV);
                ctx.op(Instruction::MUL).op(Instruction::OR);
                // value ref new_full_value
                ctx.op(Instruction::SWAP1).op(Instruction::SSTORE);
                if move_ {
                    ctx.op(Instruction::POP);
                }
            }
            Self::StorageArrayLength(array) => {
                if move_ {
                    ctx.op(Instruction::SWAP1);
                } else {
                    ctx.op(Instruction::DUP2);
                }
                ArrayUtils::new(ctx).resize_dynamic_array(array)?;
            }
            Self::CalldataItem { .. } => {
                return Err(CompileError::internal("assignment to calldata"));
            }
            Self::Immutable { decl, ty } => {
                let offset = ctx.immutable_memory_offset(*decl)?;
                CompilerUtils::new(ctx).convert_type(source, ty, true)?;
                if !move_ {
                    ctx.op(Instruction::DUP1);
                }
                ctx.push(offset).op(Instruction::MSTORE);
            }
            Self::Tuple(components) => store_tuple(ctx, components, source)?,
        }
        Ok(())
    }

    /// Writes the zero value of the type, consuming the reference if `remove_reference`.
    pub fn set_to_zero(&self, ctx: &mut CompilerContext<'_>, remove_reference: bool) -> Result<()> {
        match self {
            Self::StackVariable { decl, ty } => {
                let base = ctx.base_stack_offset_of_variable(*decl)?;
                if ctx.base_to_current_stack_offset(base) > 16 {
                    return Err(ctx.stack_too_deep());
                }
                CompilerUtils::new(ctx).push_zero_value(ty)?;
                self.store_value(ctx, ty, true)?;
            }
            Self::MemoryItem { ty, padded } => {
                ensure!(remove_reference, "memory reference kept when zeroing");
                let mut utils = CompilerUtils::new(ctx);
                utils.push_zero_value(ty)?;
                utils.store_in_memory_dynamic(ty, *padded)?;
                ctx.op(Instruction::POP);
            }
            Self::StorageItem { ty } => zero_storage_value(ctx, ty, remove_reference)?,
            Self::StorageByteArrayElement => {
                ensure!(remove_reference, "byte array reference kept when zeroing");
                ctx.push(31u64).op(Instruction::SUB).push(0x100u64).op(Instruction::EXP);
                ctx.op(Instruction::DUP2).op(Instruction::SLOAD);
                ctx.op(Instruction::SWAP1).push(0xffu64).op(Instruction::MUL);
                ctx.op(Instruction::NOT).op(Instruction::AND);
                ctx.op(Instruction::SWAP1).op(Instruction::SSTORE);
            }
            Self::StorageArrayLength(array) => {
                ensure!(remove_reference, "array reference kept when zeroing");
                ArrayUtils::new(ctx).clear_dynamic_array(array)?;
            }
            Self::Immutable { ty, .. } => {
                CompilerUtils::new(ctx).push_zero_value(ty)?;
                self.store_value(ctx, ty, true)?;
            }
            Self::CalldataItem { .. } => {
                return Err(CompileError::internal("deletion of calldata"));
            }
            Self::Tuple(_) => return Err(CompileError::internal("tried to delete a tuple")),
        }
        Ok(())
    }
}

fn mask(bytes: usize) -> U256 {
    (U256::from(1) << (8 * bytes)) - U256::from(1)
}

/// Stack pre: `<slot> <offset>`; post: `[<slot> <offset>] <value>`
fn retrieve_storage_value(ctx: &mut CompilerContext<'_>, ty: &Type, remove: bool) -> Result<()> {
    if !ty.is_value_type() {
        // the reference is the value, the byte offset is zero
        if remove {
            ctx.op(Instruction::POP);
        } else {
            ctx.op(Instruction::DUP2);
        }
        return Ok(());
    }
    if !remove {
        CompilerUtils::new(ctx).copy_to_stack_top(2, 2)?;
    }
    let bytes = ctx.ast().storage_bytes(ty);
    if bytes == 32 {
        ctx.op(Instruction::POP).op(Instruction::SLOAD);
        return Ok(());
    }
    ctx.op(Instruction::SWAP1).op(Instruction::SLOAD).op(Instruction::SWAP1);
    ctx.push(0x100u64).op(Instruction::EXP).op(Instruction::SWAP1).op(Instruction::DIV);
    match ty {
        Type::FixedBytes(_) => {
            CompilerUtils::new(ctx).left_shift_number_on_stack(256 - 8 * bytes);
        }
        Type::Integer { signed: true, .. } => {
            ctx.push((bytes - 1) as u64).op(Instruction::SIGNEXTEND);
        }
        Type::Function(f) if f.kind == FunctionTypeKind::External => {
            return Err(CompileError::unimplemented("external function types in storage"));
        }
        _ => {
            ctx.push(mask(bytes)).op(Instruction::AND);
        }
    }
    Ok(())
}

/// Stack pre: `<value> <slot> <offset>`; post: `[<value>]`
fn store_storage_value(
    ctx: &mut CompilerContext<'_>,
    ty: &Type,
    source: &Type,
    move_: bool,
) -> Result<()> {
    let ast = ctx.ast();
    if ty.is_value_type() {
        let bytes = ast.storage_bytes(ty);
        ensure!(bytes > 0 && bytes <= 32, "invalid storage size {bytes}");
        if bytes == 32 {
            // the offset is zero
            ctx.op(Instruction::POP);
            if !move_ {
                ctx.op(Instruction::DUP2).op(Instruction::SWAP1);
            }
            ctx.op(Instruction::SWAP1);
            CompilerUtils::new(ctx).convert_type(source, ty, true)?;
            ctx.op(Instruction::SWAP1).op(Instruction::SSTORE);
            return Ok(());
        }
        // OR the value into the other values of the slot
        ctx.push(0x100u64).op(Instruction::EXP);
        // value slot multiplier
        ctx.op(Instruction::DUP2).op(Instruction::SLOAD);
        ctx.op(Instruction::DUP2).push(mask(bytes)).op(Instruction::MUL);
        ctx.op(Instruction::NOT).op(Instruction::AND).op(Instruction::SWAP1);
        // value slot cleared_value multiplier
        CompilerUtils::new(ctx).copy_to_stack_top(4, 1)?;
        match ty {
            Type::Function(f) => {
                ensure!(source == ty, "function stored with a different type");
                if f.kind == FunctionTypeKind::External {
                    return Err(CompileError::unimplemented("external function types in storage"));
                }
                ctx.push(mask(bytes)).op(Instruction::AND);
            }
            Type::FixedBytes(_) => {
                ensure!(matches!(source, Type::FixedBytes(_)), "fixed bytes from non-bytes");
                CompilerUtils::new(ctx).right_shift_number_on_stack(256 - 8 * bytes);
            }
            _ => CompilerUtils::new(ctx).convert_type_full(source, ty, true, true, false)?,
        }
        ctx.op(Instruction::MUL).op(Instruction::OR);
        // value slot updated_value
        ctx.op(Instruction::SWAP1).op(Instruction::SSTORE);
        if move_ {
            CompilerUtils::new(ctx).pop_stack_element(ty);
        }
        return Ok(());
    }

    match (ty, source) {
        (Type::Array(target), Type::Array(source)) => {
            // the byte offset is zero
            ctx.op(Instruction::POP);
            ArrayUtils::new(ctx).copy_array_to_storage(target, source)?;
            if move_ {
                ctx.op(Instruction::POP);
            }
        }
        (
            Type::Struct { id, .. },
            Type::Struct { id: source_id, location: source_location },
        ) => {
            ensure!(id == source_id, "struct assignment with conversion");
            if *source_location == DataLocation::Calldata {
                return Err(CompileError::unimplemented("copying calldata structs to storage"));
            }
            // source_ref target_ref
            ctx.op(Instruction::POP);
            let (target_offsets, _) = ast.struct_storage_layout(*id);
            for (index, member) in ast[*id].members.iter().enumerate() {
                let member_type = &ast[member.ty];
                if matches!(member_type, Type::Mapping { .. }) {
                    continue;
                }
                let source_member = ast.struct_member_type(*id, *source_location, index);
                if *source_location == DataLocation::Storage {
                    let (slot, offset) = target_offsets[index];
                    ctx.push(slot).op(Instruction::DUP3).op(Instruction::ADD).push(offset);
                    LValue::storage(source_member.clone()).retrieve_value(ctx, true)?;
                } else {
                    let offset = ast.memory_offset_of_member(*id, index);
                    ctx.push(offset as u64).op(Instruction::DUP3).op(Instruction::ADD);
                    LValue::memory(source_member.clone()).retrieve_value(ctx, true)?;
                }
                // source_ref target_ref source_value...
                let size = ast.size_on_stack(&source_member);
                let (slot, offset) = target_offsets[index];
                ctx.dup(1 + size)?.push(slot).op(Instruction::ADD).push(offset);
                let target_member = member_type.with_location(DataLocation::Storage);
                LValue::storage(target_member).store_value(ctx, &source_member, true)?;
            }
            if move_ {
                ctx.pop(2);
            } else {
                ctx.op(Instruction::SWAP1).op(Instruction::POP);
            }
        }
        _ => return Err(CompileError::internal(format!("invalid assignment of {source:?} to {ty:?}"))),
    }
    Ok(())
}

/// Stack pre: `<slot> <offset>`; post: `[<slot> <offset>]`
fn zero_storage_value(
    ctx: &mut CompilerContext<'_>,
    ty: &Type,
    remove_reference: bool,
) -> Result<()> {
    let ast = ctx.ast();
    match ty {
        Type::Array(array) => {
            if !remove_reference {
                CompilerUtils::new(ctx).copy_to_stack_top(2, 2)?;
            }
            ArrayUtils::new(ctx).clear_array(array)?;
        }
        Type::Struct { id, .. } => {
            let (offsets, _) = ast.struct_storage_layout(*id);
            for (index, member) in ast[*id].members.iter().enumerate() {
                let member_type = &ast[member.ty];
                if matches!(member_type, Type::Mapping { .. }) {
                    continue;
                }
                let (slot, offset) = offsets[index];
                ctx.push(slot).op(Instruction::DUP3).op(Instruction::ADD).push(offset);
                let member_type = member_type.with_location(DataLocation::Storage);
                zero_storage_value(ctx, &member_type, true)?;
            }
            if remove_reference {
                ctx.pop(2);
            }
        }
        Type::Mapping { .. } => {
            if remove_reference {
                ctx.pop(2);
            }
        }
        _ => {
            ensure!(ty.is_value_type(), "clearing {ty:?} in storage");
            if !remove_reference {
                CompilerUtils::new(ctx).copy_to_stack_top(2, 2)?;
            }
            let bytes = ast.storage_bytes(ty);
            if bytes == 32 {
                ctx.op(Instruction::POP).push(0u64).op(Instruction::SWAP1).op(Instruction::SSTORE);
            } else {
                ctx.push(0x100u64).op(Instruction::EXP);
                // slot multiplier
                ctx.op(Instruction::DUP2).op(Instruction::SLOAD);
                ctx.op(Instruction::SWAP1).push(mask(bytes)).op(Instruction::MUL);
                ctx.op(Instruction::NOT).op(Instruction::AND);
                // slot cleared_value
                ctx.op(Instruction::SWAP1).op(Instruction::SSTORE);
            }
        }
    }
    Ok(())
}

/// Assigns from right to left. The values lie below the references.
fn store_tuple(
    ctx: &mut CompilerContext<'_>,
    components: &[Option<LValue>],
    source: &Type,
) -> Result<()> {
    let ast = ctx.ast();
    let Type::Tuple(values) = source else {
        return Err(CompileError::internal("tuple assigned from a non-tuple"));
    };
    ensure!(values.len() == components.len(), "tuple assignment with different arity");
    let mut value_position = components.iter().flatten().map(LValue::size_on_stack).sum::<usize>();
    for (lvalue, &value) in components.iter().zip(values).rev() {
        let value_type = &ast[value];
        let height = ctx.stack_height() as isize;
        let value_size = ast.size_on_stack(value_type);
        value_position += value_size;
        let Some(lvalue) = lvalue else { continue };
        let mut utils = CompilerUtils::new(ctx);
        utils.copy_to_stack_top(value_position, value_size)?;
        utils.move_to_stack_top(value_size, lvalue.size_on_stack())?;
        lvalue.store_value(ctx, value_type, true)?;
        let change = ctx.stack_height() as isize - height;
        value_position = value_position.checked_add_signed(change).ok_or_else(|| {
            CompileError::internal("tuple assignment stack underflow")
        })?;
    }
    // the assignment itself has no value
    CompilerUtils::new(ctx).pop_stack_element(source);
    Ok(())
}
