//! Code generation for arrays: length handling, element access, copying and clearing.
//!
//! Storage layout of dynamic arrays: the slot holds the length and the data starts at
//! `keccak256(slot)`. `bytes` and `string` shorter than 32 bytes are stored together with
//! their length in the slot, whose lowest byte then holds `2 * length`; longer ones hold
//! `2 * length + 1` in the slot.

use crate::{
    Result,
    context::{CompilerContext, LowLevelFunction},
    error::{CompileError, ensure},
    lvalue::LValue,
    panic::PanicCode,
    types::{ArrayType, DataLocation, Type},
    utils::CompilerUtils,
};
use alloy_primitives::U256;
use solgen_evmasm::{Instruction, JumpType};

/// Array helpers operating on a [`CompilerContext`].
#[derive(Debug)]
pub struct ArrayUtils<'c, 'a> {
    ctx: &'c mut CompilerContext<'a>,
}

impl<'c, 'a> ArrayUtils<'c, 'a> {
    pub fn new(ctx: &'c mut CompilerContext<'a>) -> Self {
        Self { ctx }
    }

    fn utils(&mut self) -> CompilerUtils<'_, 'a> {
        CompilerUtils::new(self.ctx)
    }

    /// The element type used for copying: `uint256` words for byte arrays.
    fn copy_base_type(&self, array: &ArrayType) -> Type {
        if array.is_byte_array() { Type::uint(256) } else { self.ctx.ast().array_base_type(array) }
    }

    /// Copies an array into storage, clearing what is left of the target.
    ///
    /// Stack pre: `<source ref> [<source length>] <target ref>`; post: `<target ref>`
    pub fn copy_array_to_storage(&mut self, target: &ArrayType, source: &ArrayType) -> Result<()> {
        ensure!(target.location == DataLocation::Storage, "copy to non-storage array");
        let source_size = self.ctx.ast().size_on_stack(&Type::Array(source.clone()));
        for i in (1..=source_size).rev() {
            self.ctx.swap(i)?;
        }
        // target_ref source_ref [source_length]
        if source.location != DataLocation::Calldata || !source.is_dynamically_sized() {
            self.retrieve_length(source, 0)?;
        }
        if source.location == DataLocation::Memory && source.is_dynamically_sized() {
            self.ctx.op(Instruction::SWAP1).push(32u64).op(Instruction::ADD).op(Instruction::SWAP1);
        }
        // target_ref source_ref source_length
        self.ctx.call_low_level_function(LowLevelFunction::CopyArrayToStorage {
            target: Type::Array(target.clone()),
            source: Type::Array(source.clone()),
        })
    }

    /// Body of [`LowLevelFunction::CopyArrayToStorage`].
    ///
    /// Stack pre: `<target ref> <source ref> <source length>`; post: `<target ref>`
    pub(crate) fn copy_array_to_storage_body(
        &mut self,
        target: &ArrayType,
        source: &ArrayType,
    ) -> Result<()> {
        let ast = self.ctx.ast();
        let target_base = self.copy_base_type(target);
        let source_base = self.copy_base_type(source);
        let source_is_storage = source.location == DataLocation::Storage;
        let from_calldata = source.location == DataLocation::Calldata;
        let direct_copy =
            source_is_storage && source_base.is_value_type() && source_base == target_base;
        let byte_offset_source =
            !direct_copy && source_is_storage && ast.storage_bytes(&source_base) <= 16;
        let byte_offset_target = !direct_copy && ast.storage_bytes(&target_base) <= 16;
        let byte_offset_size = usize::from(byte_offset_source) + usize::from(byte_offset_target);

        self.ctx.op(Instruction::DUP3);
        self.retrieve_length(target, 0)?;
        // target_ref source_ref source_length target_ref target_length
        if target.is_dynamically_sized() && !target.is_byte_array() {
            self.ctx.op(Instruction::DUP3).op(Instruction::DUP3).op(Instruction::SSTORE);
        }
        if matches!(source_base, Type::Mapping { .. }) {
            ensure!(matches!(target_base, Type::Mapping { .. }), "mapping copied to non-mapping");
            self.ctx.pop(4);
            return Ok(());
        }
        self.ctx.op(Instruction::SWAP1);
        if target.is_dynamically_sized() {
            self.utils().compute_hash_static();
        }
        // target_ref source_ref source_length target_length target_data_pos
        self.ctx.op(Instruction::SWAP1);
        self.convert_length_to_size(target, false)?;
        self.ctx.op(Instruction::DUP2).op(Instruction::ADD);
        // target_ref source_ref source_length target_data_pos target_data_end
        self.ctx.op(Instruction::SWAP3);
        // target_ref target_data_end source_length target_data_pos source_ref

        let loop_end_without_byte_offset = self.ctx.new_tag();

        if target.is_byte_array() {
            self.ctx.op(Instruction::DUP3).push(31u64).op(Instruction::LT);
            let long_byte_array = self.ctx.append_conditional_jump();
            ensure!(source.is_byte_array(), "byte array copied from non-byte array");
            if source_is_storage {
                // the slot holds both length and data
                self.ctx.op(Instruction::DUP1).op(Instruction::SLOAD);
                self.ctx.op(Instruction::DUP6).op(Instruction::SSTORE);
            } else {
                self.ctx.op(Instruction::DUP1);
                self.utils().load_from_memory_dynamic(&source_base, from_calldata, true, false)?;
                self.ctx.push(0xffu64).op(Instruction::NOT).op(Instruction::AND);
                self.ctx.op(Instruction::DUP4).op(Instruction::DUP1).op(Instruction::ADD);
                self.ctx.op(Instruction::OR).op(Instruction::DUP6).op(Instruction::SSTORE);
            }
            self.ctx.append_jump_to(&loop_end_without_byte_offset, JumpType::Ordinary);
            self.ctx.append(long_byte_array);
            // 2 * length + 1
            self.ctx.op(Instruction::DUP3).op(Instruction::DUP1).op(Instruction::ADD);
            self.ctx.push(1u64).op(Instruction::ADD);
            self.ctx.op(Instruction::DUP6).op(Instruction::SSTORE);
        }

        self.ctx.op(Instruction::DUP3).op(Instruction::ISZERO);
        self.ctx.append_conditional_jump_to(&loop_end_without_byte_offset);

        if source_is_storage && source.is_dynamically_sized() {
            self.utils().compute_hash_static();
        }
        // target_ref target_data_end source_length target_data_pos source_data_pos
        self.ctx.op(Instruction::SWAP2);
        self.convert_length_to_size(source, false)?;
        self.ctx.op(Instruction::DUP3).op(Instruction::ADD);
        // target_ref target_data_end source_data_pos target_data_pos source_data_end
        if byte_offset_target {
            self.ctx.push(0u64);
        }
        if byte_offset_source {
            self.ctx.push(0u64);
        }
        // ... [target_byte_offset] [source_byte_offset]
        let loop_start = self.ctx.new_tag();
        self.ctx.append(loop_start.clone());
        self.ctx.dup(3 + byte_offset_size)?.dup(2 + byte_offset_size)?;
        self.ctx.op(Instruction::GT).op(Instruction::ISZERO);
        let loop_end = self.ctx.append_conditional_jump();

        if let Type::Array(source_base_array) = &source_base {
            ensure!(byte_offset_size == 0, "byte offset for nested arrays");
            let Type::Array(target_base_array) = &target_base else {
                return Err(CompileError::internal("nested array copied to non-array"));
            };
            self.ctx.op(Instruction::DUP3);
            if source_base_array.location == DataLocation::Memory {
                self.ctx.op(Instruction::MLOAD);
            }
            self.ctx.op(Instruction::DUP3);
            self.copy_array_to_storage(target_base_array, source_base_array)?;
            self.ctx.op(Instruction::POP);
        } else if direct_copy {
            ensure!(byte_offset_size == 0, "byte offset for direct copy");
            self.ctx
                .op(Instruction::DUP3)
                .op(Instruction::SLOAD)
                .op(Instruction::DUP3)
                .op(Instruction::SSTORE);
        } else {
            // elements are copied one by one in case a conversion is involved
            self.ctx.dup(3 + byte_offset_size)?;
            if source_is_storage {
                if byte_offset_source {
                    self.ctx.op(Instruction::DUP2);
                } else {
                    self.ctx.push(0u64);
                }
                LValue::storage(source_base.clone()).retrieve_value(self.ctx, true)?;
            } else if source_base.is_value_type() {
                self.utils().load_from_memory_dynamic(&source_base, from_calldata, true, false)?;
            } else {
                return Err(CompileError::unimplemented(format!(
                    "copying {source_base:?} arrays to storage"
                )));
            }
            let value_size = ast.size_on_stack(&source_base);
            self.ctx.dup(2 + byte_offset_size + value_size)?;
            if byte_offset_target {
                self.ctx.dup(1 + byte_offset_size + value_size)?;
            } else {
                self.ctx.push(0u64);
            }
            LValue::storage(target_base.clone()).store_value(self.ctx, &source_base, true)?;
        }

        // increment source
        if byte_offset_source {
            let bytes = ast.storage_bytes(&source_base);
            self.increment_byte_offset(bytes, 1, if byte_offset_target { 5 } else { 4 })?;
        } else {
            self.ctx.swap(2 + byte_offset_size)?;
            let step = match source.location {
                DataLocation::Storage => ast.storage_size(&source_base),
                DataLocation::Memory => U256::from(ast.memory_head_size(&source_base)),
                DataLocation::Calldata => U256::from(ast.calldata_encoded_size(&source_base)),
            };
            self.ctx.push(step).op(Instruction::ADD);
            self.ctx.swap(2 + byte_offset_size)?;
        }
        // increment target
        if byte_offset_target {
            let bytes = ast.storage_bytes(&target_base);
            self.increment_byte_offset(bytes, byte_offset_size, byte_offset_size + 2)?;
        } else {
            self.ctx.swap(1 + byte_offset_size)?;
            self.ctx.push(ast.storage_size(&target_base)).op(Instruction::ADD);
            self.ctx.swap(1 + byte_offset_size)?;
        }
        self.ctx.append_jump_to(&loop_start, JumpType::Ordinary);
        self.ctx.append(loop_end.clone());
        if byte_offset_target {
            // clear what is left of the current target slot
            self.ctx.dup(byte_offset_size)?.op(Instruction::ISZERO);
            let cleanup_end = self.ctx.append_conditional_jump();
            self.ctx.dup(2 + byte_offset_size)?.dup(1 + byte_offset_size)?;
            LValue::storage(target_base.clone()).set_to_zero(self.ctx, true)?;
            let bytes = ast.storage_bytes(&target_base);
            self.increment_byte_offset(bytes, byte_offset_size, byte_offset_size + 2)?;
            self.ctx.append_jump_to(&loop_end, JumpType::Ordinary);
            self.ctx.append(cleanup_end);
            self.ctx.op(Instruction::POP);
        }
        if byte_offset_source {
            self.ctx.op(Instruction::POP);
        }
        self.ctx.append(loop_end_without_byte_offset);

        // target_ref target_data_end source_data_pos target_data_pos_updated source_data_end
        self.ctx.op(Instruction::POP).op(Instruction::SWAP1).op(Instruction::POP);
        self.clear_storage_loop(&target_base)?;
        self.ctx.op(Instruction::POP);
        Ok(())
    }

    /// Copies an array into memory in its ABI encoding without the length.
    ///
    /// Stack pre: `<memory offset> <source ref> [<source length>]`; post: `<memory end>`
    pub fn copy_array_to_memory(&mut self, source: &ArrayType, pad: bool) -> Result<()> {
        let ast = self.ctx.ast();
        let base = ast.array_base_type(source);
        if !source.is_byte_array() && base.is_dynamically_sized() {
            return Err(CompileError::unimplemented("copying nested dynamic arrays to memory"));
        }
        let base_size = if source.is_byte_array() { 1 } else { ast.calldata_encoded_size(&base) };
        ensure!(source.is_byte_array() || base_size >= 32, "unpadded array elements");

        match source.location {
            DataLocation::Calldata => {
                if let Some(length) = source.length {
                    self.ctx.push(length);
                }
                if base_size > 1 {
                    self.ctx.push(base_size as u64).op(Instruction::MUL);
                }
                // target source size
                self.ctx
                    .op(Instruction::DUP1)
                    .op(Instruction::DUP3)
                    .op(Instruction::DUP5)
                    .op(Instruction::CALLDATACOPY);
                if pad {
                    self.pad_after_copy();
                }
                self.ctx.op(Instruction::SWAP1).op(Instruction::POP).op(Instruction::ADD);
            }
            DataLocation::Memory => {
                if !base.is_value_type() {
                    return Err(CompileError::unimplemented(
                        "copying memory arrays of reference types",
                    ));
                }
                self.retrieve_length(source, 0)?;
                if source.is_dynamically_sized() {
                    self.ctx
                        .op(Instruction::SWAP1)
                        .push(32u64)
                        .op(Instruction::ADD)
                        .op(Instruction::SWAP1);
                }
                if base_size > 1 {
                    self.ctx.push(base_size as u64).op(Instruction::MUL);
                }
                // target source size
                self.ctx.op(Instruction::DUP1).op(Instruction::DUP4).op(Instruction::DUP4);
                self.utils().memory_copy()?;
                if pad && base_size % 32 != 0 {
                    self.pad_after_copy();
                }
                self.ctx.op(Instruction::SWAP1).op(Instruction::POP).op(Instruction::ADD);
            }
            DataLocation::Storage => self.copy_storage_array_to_memory(source, &base, base_size, pad)?,
        }
        Ok(())
    }

    /// Zeroes the word after the copied data and rounds the size up to whole words.
    ///
    /// Stack pre: `<target> <source> <size>`; post: `<target> <source> <padded size>`
    fn pad_after_copy(&mut self) {
        self.ctx
            .push(0u64)
            .op(Instruction::DUP2)
            .op(Instruction::DUP5)
            .op(Instruction::ADD)
            .op(Instruction::MSTORE);
        self.utils().round_up_to_words();
    }

    fn copy_storage_array_to_memory(
        &mut self,
        source: &ArrayType,
        base: &Type,
        base_size: usize,
        pad: bool,
    ) -> Result<()> {
        let ast = self.ctx.ast();
        let storage_bytes = ast.storage_bytes(base);
        let storage_size = ast.storage_size(base);

        self.retrieve_length(source, 0)?;
        // memory_offset storage_offset length
        self.ctx.op(Instruction::DUP1).op(Instruction::ISZERO);
        let loop_end = self.ctx.append_conditional_jump();
        if source.is_byte_array() {
            self.ctx.op(Instruction::DUP1).push(31u64).op(Instruction::LT);
            let long_byte_array = self.ctx.append_conditional_jump();
            // short byte array, without the length byte
            self.ctx.push(0x100u64).op(Instruction::DUP1);
            self.ctx.op(Instruction::DUP4).op(Instruction::SLOAD);
            self.ctx.op(Instruction::DIV).op(Instruction::MUL);
            self.ctx.op(Instruction::DUP4).op(Instruction::MSTORE);
            self.ctx.op(Instruction::SWAP2);
            if pad {
                self.ctx.push(32u64);
            } else {
                self.ctx.op(Instruction::DUP3);
            }
            self.ctx.op(Instruction::ADD).op(Instruction::SWAP2);
            self.ctx.append_jump_to(&loop_end, JumpType::Ordinary);
            self.ctx.append(long_byte_array);
        }
        if base_size > 1 {
            self.ctx.push(base_size as u64).op(Instruction::MUL);
        }
        self.ctx.op(Instruction::DUP3).op(Instruction::ADD).op(Instruction::SWAP2);
        if source.is_dynamically_sized() {
            self.ctx.op(Instruction::SWAP1);
            self.utils().compute_hash_static();
            self.ctx.op(Instruction::SWAP1);
        }
        // memory_end_offset storage_data_offset memory_offset
        let byte_offset = !source.is_byte_array() && storage_bytes <= 16;
        if byte_offset {
            self.ctx.push(0u64).op(Instruction::SWAP1);
        }
        // memory_end_offset storage_data_offset [storage_byte_offset] memory_offset
        let loop_start = self.ctx.new_tag();
        self.ctx.append(loop_start.clone());
        if source.is_byte_array() {
            self.ctx.op(Instruction::DUP2).op(Instruction::SLOAD);
            self.ctx.op(Instruction::DUP2).op(Instruction::MSTORE);
            self.ctx.op(Instruction::SWAP1).push(1u64).op(Instruction::ADD);
            self.ctx.op(Instruction::SWAP1).push(32u64).op(Instruction::ADD);
        } else {
            if byte_offset {
                self.ctx.op(Instruction::DUP3).op(Instruction::DUP3);
            } else {
                self.ctx.op(Instruction::DUP2).push(0u64);
            }
            LValue::storage(base.clone()).retrieve_value(self.ctx, true)?;
            if let Type::Array(base_array) = base {
                self.copy_array_to_memory(base_array, pad)?;
            } else {
                self.utils().store_in_memory_dynamic(base, true)?;
            }
            if byte_offset {
                self.increment_byte_offset(storage_bytes, 2, 3)?;
            } else {
                self.ctx.op(Instruction::SWAP1).push(storage_size).op(Instruction::ADD);
                self.ctx.op(Instruction::SWAP1);
            }
        }
        self.ctx.op(Instruction::DUP1).dup(if byte_offset { 5 } else { 4 })?;
        self.ctx.op(Instruction::GT);
        self.ctx.append_conditional_jump_to(&loop_start);
        if byte_offset {
            self.ctx.op(Instruction::SWAP1).op(Instruction::POP);
        }
        if pad && base_size % 32 != 0 {
            // round the end up by the distance between the write position and the end
            self.ctx.op(Instruction::DUP3).op(Instruction::SWAP1).op(Instruction::SUB);
            self.ctx.push(31u64).op(Instruction::AND);
            self.ctx.op(Instruction::DUP3).op(Instruction::ADD);
            self.ctx.op(Instruction::SWAP2);
        }
        self.ctx.append(loop_end);
        self.ctx.op(Instruction::POP).op(Instruction::POP);
        Ok(())
    }

    /// Clears a storage array.
    ///
    /// Stack pre: `<ref> <byte offset>`; post:
    pub fn clear_array(&mut self, array: &ArrayType) -> Result<()> {
        self.ctx.call_low_level_function(LowLevelFunction::ClearArray(Type::Array(array.clone())))
    }

    /// Body of [`LowLevelFunction::ClearArray`].
    pub(crate) fn clear_array_body(&mut self, array: &ArrayType) -> Result<()> {
        let ast = self.ctx.ast();
        ensure!(array.location == DataLocation::Storage, "clearing non-storage array");
        let height = self.ctx.stack_height();
        let base = ast.array_base_type(array);
        let base_bytes = ast.storage_bytes(&base);
        let base_slots = ast.storage_size(&base);
        if base.is_value_type() {
            ensure!(base_slots <= U256::from(1), "value type in several slots");
        }

        // byte offset
        self.ctx.op(Instruction::POP);
        let length = array.length.unwrap_or_default();
        let slots = ast.storage_size(&Type::Array(array.clone()));
        if array.is_dynamically_sized() {
            self.clear_dynamic_array(array)?;
        } else if length.is_zero() || matches!(base, Type::Mapping { .. }) {
            self.ctx.op(Instruction::POP);
        } else if base.is_value_type() && slots <= U256::from(5) {
            // loops over slots, not elements
            for _ in 1..slots.saturating_to::<usize>() {
                self.ctx.push(0u64).op(Instruction::DUP2).op(Instruction::SSTORE);
                self.ctx.push(1u64).op(Instruction::ADD);
            }
            self.ctx.push(0u64).op(Instruction::SWAP1).op(Instruction::SSTORE);
        } else if !base.is_value_type() && length <= U256::from(4) {
            ensure!(base_bytes >= 32, "packed reference type");
            for _ in 1..length.saturating_to::<usize>() {
                self.ctx.push(0u64);
                LValue::storage(base.clone()).set_to_zero(self.ctx, false)?;
                self.ctx.op(Instruction::POP).push(base_slots).op(Instruction::ADD);
            }
            self.ctx.push(0u64);
            LValue::storage(base.clone()).set_to_zero(self.ctx, true)?;
        } else {
            self.ctx.op(Instruction::DUP1).push(length);
            self.convert_length_to_size(array, false)?;
            self.ctx.op(Instruction::ADD).op(Instruction::SWAP1);
            let cleared = if base_bytes < 32 { Type::uint(256) } else { base };
            self.clear_storage_loop(&cleared)?;
            self.ctx.op(Instruction::POP);
        }
        ensure!(self.ctx.stack_height() + 2 == height, "clearing an array is not stack neutral");
        Ok(())
    }

    /// Clears a dynamic storage array and sets its length to zero.
    ///
    /// Stack pre: `<ref>`; post:
    pub fn clear_dynamic_array(&mut self, array: &ArrayType) -> Result<()> {
        ensure!(
            array.location == DataLocation::Storage && array.is_dynamically_sized(),
            "clearing a non-dynamic storage array"
        );
        self.retrieve_length(array, 0)?;
        self.ctx.push(0u64).op(Instruction::DUP3).op(Instruction::SSTORE);
        let end = self.ctx.new_tag();
        if array.is_byte_array() {
            // ref old_length
            self.ctx.op(Instruction::DUP1).push(31u64).op(Instruction::LT);
            let long_byte_array = self.ctx.append_conditional_jump();
            self.ctx.op(Instruction::POP);
            self.ctx.append_jump_to(&end, JumpType::Ordinary);
            self.ctx.adjust_stack_offset(1);
            self.ctx.append(long_byte_array);
        }
        // ref old_length
        self.convert_length_to_size(array, false)?;
        self.ctx.op(Instruction::SWAP1);
        self.utils().compute_hash_static();
        // size data_pos
        self.ctx
            .op(Instruction::SWAP1)
            .op(Instruction::DUP2)
            .op(Instruction::ADD)
            .op(Instruction::SWAP1);
        // data_pos_end data_pos
        let cleared = self.clear_loop_type(array);
        self.clear_storage_loop(&cleared)?;
        self.ctx.append(end);
        self.ctx.op(Instruction::POP);
        Ok(())
    }

    fn clear_loop_type(&self, array: &ArrayType) -> Type {
        let base = self.ctx.ast().array_base_type(array);
        if array.is_byte_array() || self.ctx.ast().storage_bytes(&base) < 32 {
            Type::uint(256)
        } else {
            base
        }
    }

    /// Changes the length of a dynamic storage array, clearing removed elements.
    ///
    /// Stack pre: `<ref> <new length>`; post:
    pub fn resize_dynamic_array(&mut self, array: &ArrayType) -> Result<()> {
        self.ctx.call_low_level_function(LowLevelFunction::ResizeDynamicArray(Type::Array(
            array.clone(),
        )))
    }

    /// Body of [`LowLevelFunction::ResizeDynamicArray`].
    pub(crate) fn resize_dynamic_array_body(&mut self, array: &ArrayType) -> Result<()> {
        ensure!(
            array.location == DataLocation::Storage && array.is_dynamically_sized(),
            "resizing a non-dynamic storage array"
        );
        let height = self.ctx.stack_height();
        let resize_end = self.ctx.new_tag();

        // ref new_length
        self.retrieve_length(array, 1)?;
        // ref new_length old_length

        if array.is_byte_array() {
            let regular_path = self.ctx.new_tag();
            self.ctx.op(Instruction::DUP3).op(Instruction::SLOAD);
            // ref new_length current_length ref_value
            self.ctx.op(Instruction::DUP2).push(31u64).op(Instruction::LT);
            let current_is_long = self.ctx.append_conditional_jump();
            self.ctx.op(Instruction::DUP3).push(31u64).op(Instruction::LT);
            let new_is_long = self.ctx.append_conditional_jump();

            // short to short: clear the bytes beyond the new length and insert 2 * length
            let short_to_short = self.ctx.new_tag();
            self.ctx.append(short_to_short.clone());
            self.ctx.op(Instruction::DUP3).push(8u64).op(Instruction::MUL);
            self.ctx.push(0x100u64).op(Instruction::SUB);
            self.ctx.push(2u64).op(Instruction::EXP);
            self.ctx.op(Instruction::DUP1).op(Instruction::SWAP2);
            self.ctx.op(Instruction::DIV).op(Instruction::MUL);
            self.ctx.op(Instruction::DUP3).op(Instruction::DUP1).op(Instruction::ADD);
            self.ctx.op(Instruction::OR);
            self.ctx.op(Instruction::DUP4).op(Instruction::SSTORE);
            self.ctx.append_jump_to(&resize_end, JumpType::Ordinary);
            self.ctx.adjust_stack_offset(1);

            // short to long: move the data out of the slot
            self.ctx.append(new_is_long);
            self.ctx.push(0xffu64).op(Instruction::NOT).op(Instruction::AND);
            self.ctx.op(Instruction::DUP4);
            self.utils().compute_hash_static();
            self.ctx.op(Instruction::SSTORE);
            self.ctx.op(Instruction::DUP2).op(Instruction::DUP1).op(Instruction::ADD);
            self.ctx.push(1u64).op(Instruction::ADD);
            self.ctx.op(Instruction::DUP4).op(Instruction::SSTORE);
            self.ctx.append_jump_to(&resize_end, JumpType::Ordinary);
            self.ctx.adjust_stack_offset(1);

            self.ctx.append(current_is_long);
            self.ctx.op(Instruction::DUP3).push(31u64).op(Instruction::LT);
            self.ctx.append_conditional_jump_to(&regular_path);

            // long to short: keep the first data word, clear the data area and continue
            // like short to short
            self.ctx.op(Instruction::POP).op(Instruction::DUP3);
            self.utils().compute_hash_static();
            self.ctx.op(Instruction::DUP1).op(Instruction::SLOAD).op(Instruction::SWAP1);
            // ref new_length current_length first_word data_location
            self.ctx.op(Instruction::DUP3);
            self.convert_length_to_size(array, false)?;
            self.ctx.op(Instruction::DUP2).op(Instruction::ADD).op(Instruction::SWAP1);
            self.clear_storage_loop(&Type::uint(256))?;
            self.ctx.op(Instruction::POP);
            self.ctx.append_jump_to(&short_to_short, JumpType::Ordinary);

            self.ctx.append(regular_path);
            self.ctx.op(Instruction::POP);
        }

        // ref new_length old_length
        self.ctx.op(Instruction::DUP2);
        if array.is_byte_array() {
            self.ctx.op(Instruction::DUP1).op(Instruction::ADD).push(1u64).op(Instruction::ADD);
        }
        self.ctx.op(Instruction::DUP4).op(Instruction::SSTORE);
        // done unless the array shrinks
        self.ctx
            .op(Instruction::DUP2)
            .op(Instruction::DUP2)
            .op(Instruction::GT)
            .op(Instruction::ISZERO);
        self.ctx.append_conditional_jump_to(&resize_end);

        self.convert_length_to_size(array, false)?;
        self.ctx.op(Instruction::DUP2);
        self.convert_length_to_size(array, false)?;
        // ref new_length old_size new_size
        self.ctx.op(Instruction::DUP4);
        self.utils().compute_hash_static();
        self.ctx.op(Instruction::SWAP2).op(Instruction::DUP3).op(Instruction::ADD);
        self.ctx.op(Instruction::SWAP2).op(Instruction::ADD);
        // ref new_length delete_end delete_start
        let cleared = self.clear_loop_type(array);
        self.clear_storage_loop(&cleared)?;

        self.ctx.append(resize_end);
        self.ctx.pop(3);
        ensure!(self.ctx.stack_height() + 2 == height, "resizing an array is not stack neutral");
        Ok(())
    }

    /// Increments the length of a dynamic storage array.
    ///
    /// Stack pre: `<ref>`; post: `<new length>`
    pub fn increment_dynamic_array_size(&mut self, array: &ArrayType) -> Result<()> {
        ensure!(
            array.location == DataLocation::Storage && array.is_dynamically_sized(),
            "push on a non-dynamic storage array"
        );
        if array.is_byte_array() {
            return Err(CompileError::unimplemented("push on storage byte arrays"));
        }
        self.ctx
            .op(Instruction::DUP1)
            .op(Instruction::SLOAD)
            .push(1u64)
            .op(Instruction::ADD)
            .op(Instruction::DUP1)
            .op(Instruction::SWAP2)
            .op(Instruction::SSTORE);
        Ok(())
    }

    /// Removes the last element of a dynamic storage array, panicking if it is empty.
    ///
    /// Stack pre: `<ref>`; post:
    pub fn pop_storage_array_element(&mut self, array: &ArrayType) -> Result<()> {
        ensure!(
            array.location == DataLocation::Storage && array.is_dynamically_sized(),
            "pop on a non-dynamic storage array"
        );
        if array.is_byte_array() {
            return Err(CompileError::unimplemented("pop on storage byte arrays"));
        }
        self.retrieve_length(array, 0)?;
        self.ctx.op(Instruction::DUP1).op(Instruction::ISZERO);
        self.ctx.append_conditional_panic(PanicCode::EmptyArrayPop);
        // ref old_length
        self.ctx.push(1u64).op(Instruction::SWAP1).op(Instruction::SUB);
        self.ctx.op(Instruction::DUP2).op(Instruction::DUP2);
        self.access_index(array, false)?;
        // ref new_length slot byte_offset
        let base = self.ctx.ast().array_base_type(array);
        LValue::storage(base).set_to_zero(self.ctx, true)?;
        self.ctx.op(Instruction::SWAP1).op(Instruction::SSTORE);
        Ok(())
    }

    /// Zeroes the slots from `start` up to `end`.
    ///
    /// Stack pre: `<end> <start>`; post: `<end>`
    pub fn clear_storage_loop(&mut self, ty: &Type) -> Result<()> {
        self.ctx.call_low_level_function(LowLevelFunction::ClearStorageLoop(ty.clone()))
    }

    /// Body of [`LowLevelFunction::ClearStorageLoop`].
    pub(crate) fn clear_storage_loop_body(&mut self, ty: &Type) -> Result<()> {
        if matches!(ty, Type::Mapping { .. }) {
            self.ctx.op(Instruction::POP);
            return Ok(());
        }
        // end_pos pos
        let loop_start = self.ctx.new_tag();
        let loop_end = self.ctx.new_tag();
        self.ctx.append(loop_start.clone());
        self.ctx
            .op(Instruction::DUP1)
            .op(Instruction::DUP3)
            .op(Instruction::GT)
            .op(Instruction::ISZERO);
        self.ctx.append_conditional_jump_to(&loop_end);
        self.ctx.push(0u64);
        LValue::storage(ty.clone()).set_to_zero(self.ctx, false)?;
        self.ctx.op(Instruction::POP);
        let size = self.ctx.ast().storage_size(ty);
        self.ctx.push(size).op(Instruction::ADD);
        self.ctx.append_jump_to(&loop_start, JumpType::Ordinary);
        self.ctx.append(loop_end);
        self.ctx.op(Instruction::POP);
        Ok(())
    }

    /// Converts a length into the size of the data: slots in storage, bytes elsewhere.
    ///
    /// Stack pre: `<length>`; post: `<size>`
    pub fn convert_length_to_size(&mut self, array: &ArrayType, pad: bool) -> Result<()> {
        let ast = self.ctx.ast();
        let base = ast.array_base_type(array);
        if array.location == DataLocation::Storage {
            let slots = ast.storage_size(&base);
            if slots <= U256::from(1) {
                let bytes = ast.storage_bytes(&base);
                if bytes == 0 {
                    self.ctx.op(Instruction::POP).push(1u64);
                } else if bytes <= 16 {
                    let per_slot = (32 / bytes) as u64;
                    self.ctx
                        .push(per_slot - 1)
                        .op(Instruction::ADD)
                        .push(per_slot)
                        .op(Instruction::SWAP1)
                        .op(Instruction::DIV);
                }
            } else {
                self.ctx.push(slots).op(Instruction::MUL);
            }
        } else if !array.is_byte_array() {
            let size = if array.location == DataLocation::Memory {
                ast.memory_head_size(&base)
            } else {
                ast.calldata_encoded_size(&base)
            };
            self.ctx.push(size as u64).op(Instruction::MUL);
        } else if pad {
            self.ctx
                .push(31u64)
                .op(Instruction::ADD)
                .push(32u64)
                .op(Instruction::DUP1)
                .op(Instruction::SWAP2)
                .op(Instruction::DIV)
                .op(Instruction::MUL);
        }
        Ok(())
    }

    /// Pushes the length of an array whose reference is `depth` slots below the top.
    ///
    /// Stack pre: `<ref> <depth slots>`; post: `<ref> <depth slots> <length>`
    pub fn retrieve_length(&mut self, array: &ArrayType, depth: usize) -> Result<()> {
        let Some(length) = array.length else {
            self.ctx.dup(1 + depth)?;
            match array.location {
                // the length is on the stack
                DataLocation::Calldata => {}
                DataLocation::Memory => {
                    self.ctx.op(Instruction::MLOAD);
                }
                DataLocation::Storage => {
                    self.ctx.op(Instruction::SLOAD);
                    if array.is_byte_array() {
                        // (x & (0x100 * iszero(x & 1) - 1)) / 2
                        self.ctx
                            .push(1u64)
                            .op(Instruction::DUP2)
                            .push(1u64)
                            .op(Instruction::AND)
                            .op(Instruction::ISZERO)
                            .push(0x100u64)
                            .op(Instruction::MUL)
                            .op(Instruction::SUB)
                            .op(Instruction::AND)
                            .push(2u64)
                            .op(Instruction::SWAP1)
                            .op(Instruction::DIV);
                    }
                }
            }
            return Ok(());
        };
        self.ctx.push(length);
        Ok(())
    }

    /// Computes the location of an element.
    ///
    /// Stack pre: `<ref> [<length>] <index>`; post: `<element ref>`, or
    /// `<slot> <byte offset>` in storage.
    pub fn access_index(&mut self, array: &ArrayType, bounds_check: bool) -> Result<()> {
        let ast = self.ctx.ast();
        let location = array.location;
        if bounds_check {
            self.retrieve_length(array, 1)?;
            // ref [length] index length
            self.ctx.op(Instruction::DUP2).op(Instruction::LT).op(Instruction::ISZERO);
            self.ctx.append_conditional_panic(PanicCode::ArrayOutOfBounds);
        }
        if location == DataLocation::Calldata && array.is_dynamically_sized() {
            self.ctx.op(Instruction::SWAP1).op(Instruction::POP);
        }
        // ref index
        self.ctx.op(Instruction::SWAP1);
        let base = ast.array_base_type(array);
        match location {
            DataLocation::Memory | DataLocation::Calldata => {
                if location == DataLocation::Memory && array.is_dynamically_sized() {
                    self.ctx.push(32u64).op(Instruction::ADD);
                }
                if !array.is_byte_array() {
                    self.ctx.op(Instruction::SWAP1);
                    let size = if location == DataLocation::Calldata {
                        ast.calldata_encoded_size(&base)
                    } else {
                        ast.memory_head_size(&base)
                    };
                    self.ctx.push(size as u64).op(Instruction::MUL);
                }
                self.ctx.op(Instruction::ADD);
            }
            DataLocation::Storage => {
                let end = self.ctx.new_tag();
                if array.is_byte_array() {
                    // short byte arrays address bytes within the slot itself
                    self.ctx.op(Instruction::SWAP1);
                    self.ctx.op(Instruction::DUP2).op(Instruction::SLOAD);
                    self.ctx.push(1u64).op(Instruction::AND).op(Instruction::ISZERO);
                    self.ctx.append_conditional_jump_to(&end);
                    self.ctx.op(Instruction::SWAP1);
                }
                if array.is_dynamically_sized() {
                    self.utils().compute_hash_static();
                }
                self.ctx.op(Instruction::SWAP1);
                let byte_size = ast.storage_bytes(&base);
                if byte_size <= 16 {
                    // <data_ref + index / items_per_slot> <(index % items_per_slot) * byte_size>
                    ensure!(byte_size != 0, "zero-sized storage element");
                    let per_slot = (32 / byte_size) as u64;
                    self.ctx.push(per_slot).op(Instruction::SWAP2);
                    self.ctx
                        .op(Instruction::DUP3)
                        .op(Instruction::DUP3)
                        .op(Instruction::DIV)
                        .op(Instruction::ADD)
                        .op(Instruction::SWAP2)
                        .op(Instruction::SWAP1)
                        .op(Instruction::MOD);
                    if byte_size != 1 {
                        self.ctx.push(byte_size as u64).op(Instruction::MUL);
                    }
                } else {
                    let slots = ast.storage_size(&base);
                    if slots != U256::from(1) {
                        self.ctx.push(slots).op(Instruction::MUL);
                    }
                    self.ctx.op(Instruction::ADD).push(0u64);
                }
                self.ctx.append(end);
            }
        }
        Ok(())
    }

    /// Advances a byte offset within a slot, moving to the next slot when the next element
    /// would not fit.
    ///
    /// `byte_offset_position` and `storage_offset_position` are the stack depths of both
    /// offsets, 1 being the top.
    pub fn increment_byte_offset(
        &mut self,
        byte_size: usize,
        byte_offset_position: usize,
        storage_offset_position: usize,
    ) -> Result<()> {
        ensure!(byte_size > 0 && byte_size < 32, "invalid packed element size {byte_size}");
        // byte_offset += byte_size; if byte_offset + byte_size > 32 move to the next slot
        if byte_offset_position > 1 {
            self.ctx.swap(byte_offset_position - 1)?;
        }
        self.ctx.push(byte_size as u64).op(Instruction::ADD);
        if byte_offset_position > 1 {
            self.ctx.swap(byte_offset_position - 1)?;
        }
        // x = (byte_offset + byte_size - 1) / 32
        self.ctx.push(32u64);
        self.ctx.dup(1 + byte_offset_position)?;
        self.ctx.push((byte_size - 1) as u64).op(Instruction::ADD).op(Instruction::DIV);
        // storage_offset += x
        self.ctx.swap(storage_offset_position)?;
        self.ctx.dup(storage_offset_position + 1)?;
        self.ctx.op(Instruction::ADD);
        self.ctx.swap(storage_offset_position)?;
        // byte_offset *= 1 - x
        self.ctx.push(1u64).op(Instruction::SUB);
        if byte_offset_position == 1 {
            self.ctx.op(Instruction::MUL);
        } else {
            self.ctx.dup(byte_offset_position + 1)?.op(Instruction::MUL);
            self.ctx.swap(byte_offset_position)?.op(Instruction::POP);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CompilerSettings,
        ast::{Ast, Contract},
        types::{ArrayKind, StorageLayout},
    };
    use rustc_hash::FxHashMap;

    fn with_context(ast: &Ast, f: impl FnOnce(&mut CompilerContext<'_>) -> Result<()>) {
        let settings = CompilerSettings::default();
        let layout = StorageLayout::default();
        let code = FxHashMap::default();
        let (contract, _) = ast.contracts().next().unwrap();
        let mut ctx = CompilerContext::new(ast, &settings, contract, &layout, &code, true);
        f(&mut ctx).unwrap();
    }

    fn storage_array(bits: u16, length: Option<u64>) -> (Ast, ArrayType) {
        let mut ast = Ast::new();
        ast.add_contract(Contract::new("C"));
        let base = ast.intern(Type::uint(bits));
        let array = ArrayType {
            kind: ArrayKind::Elements(base),
            length: length.map(U256::from),
            location: DataLocation::Storage,
        };
        (ast, array)
    }

    #[test]
    fn test_byte_array_length_decoding() {
        let (ast, _) = storage_array(8, None);
        let bytes =
            ArrayType { kind: ArrayKind::Bytes, length: None, location: DataLocation::Storage };
        with_context(&ast, |ctx| {
            ctx.push(0u64);
            ArrayUtils::new(ctx).retrieve_length(&bytes, 0)?;
            assert_eq!(ctx.stack_height(), 2);
            snapbox::assert_data_eq!(
                ctx.assembly().to_string(),
                "  PUSH 0x0
  DUP1
  SLOAD
  PUSH 0x1
  DUP2
  PUSH 0x1
  AND
  ISZERO
  PUSH 0x100
  MUL
  SUB
  AND
  PUSH 0x2
  SWAP1
  DIV
"
            );
            Ok(())
        });
    }

    #[test]
    fn test_packed_index_access() {
        let (ast, array) = storage_array(64, None);
        with_context(&ast, |ctx| {
            ctx.push(3u64).push(1u64);
            ArrayUtils::new(ctx).access_index(&array, true)?;
            let listing = ctx.assembly().to_string();
            assert!(listing.contains("  PUSH 0x4\n  SWAP2\n  DUP3\n  DUP3\n  DIV\n  ADD\n"));
            assert!(listing.contains("  MOD\n  PUSH 0x8\n  MUL\n"), "{listing}");
            // slot and byte offset
            assert_eq!(ctx.stack_height(), 2);
            Ok(())
        });
    }

    #[test]
    fn test_static_array_length_is_pushed() {
        let (ast, array) = storage_array(256, Some(3));
        with_context(&ast, |ctx| {
            ctx.push(0u64);
            let mut utils = ArrayUtils::new(ctx);
            utils.retrieve_length(&array, 0)?;
            utils.convert_length_to_size(&array, false)?;
            assert_eq!(ctx.assembly().to_string(), "  PUSH 0x0\n  PUSH 0x3\n");
            Ok(())
        });
    }

    #[test]
    fn test_length_to_size_packs_elements() {
        let (ast, array) = storage_array(8, None);
        with_context(&ast, |ctx| {
            ctx.push(40u64);
            ArrayUtils::new(ctx).convert_length_to_size(&array, false)?;
            assert_eq!(
                ctx.assembly().to_string(),
                "  PUSH 0x28\n  PUSH 0x1f\n  ADD\n  PUSH 0x20\n  SWAP1\n  DIV\n"
            );
            Ok(())
        });
    }

    #[test]
    fn test_pop_checks_for_empty_array() {
        let (ast, array) = storage_array(256, None);
        with_context(&ast, |ctx| {
            ctx.push(5u64);
            ArrayUtils::new(ctx).pop_storage_array_element(&array)?;
            assert_eq!(ctx.stack_height(), 0);
            ctx.append_shared_blocks();
            let listing = ctx.assembly().to_string();
            assert!(listing.contains("PUSH 0x31"), "{listing}");
            Ok(())
        });
    }

    #[test]
    fn test_low_level_helpers_are_queued() {
        let (ast, array) = storage_array(128, None);
        with_context(&ast, |ctx| {
            ctx.push(0u64).push(7u64);
            ArrayUtils::new(ctx).resize_dynamic_array(&array)?;
            assert_eq!(ctx.stack_height(), 0);
            let (function, _) = ctx.next_low_level_function().unwrap();
            assert_eq!(function, LowLevelFunction::ResizeDynamicArray(Type::Array(array)));
            assert!(ctx.next_low_level_function().is_none());
            Ok(())
        });
    }
}
