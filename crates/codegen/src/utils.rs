//! Stack, memory and conversion helpers used throughout the code generator.

use crate::{
    Result,
    array_utils::ArrayUtils,
    context::{CompilerContext, LowLevelFunction},
    error::{CompileError, ensure},
    panic::{ERROR_SELECTOR, PanicCode},
    types::{ArrayType, DataLocation, FunctionTypeKind, Type},
};
use alloy_primitives::U256;
use solgen_evmasm::{Instruction, JumpType};

/// Memory slot holding the free memory pointer.
pub const FREE_MEMORY_POINTER: u64 = 0x40;
/// Memory slot that is always zero, used as the empty dynamic memory array.
pub const ZERO_POINTER: u64 = 0x60;
/// First memory address not reserved for scratch space and pointers.
pub const GENERAL_PURPOSE_MEMORY_START: u64 = 0x80;
/// Offset of the arguments in calldata, after the selector.
pub const DATA_START_OFFSET: u64 = 4;

/// Code generation helpers operating on a [`CompilerContext`].
#[derive(Debug)]
pub struct CompilerUtils<'c, 'a> {
    ctx: &'c mut CompilerContext<'a>,
}

impl<'c, 'a> CompilerUtils<'c, 'a> {
    pub fn new(ctx: &'c mut CompilerContext<'a>) -> Self {
        Self { ctx }
    }

    /// Stack pre: ; post: `0x80`'s initial content stored at `0x40`.
    pub fn initialise_free_memory_pointer(&mut self, reserved: u64) {
        self.ctx.push(GENERAL_PURPOSE_MEMORY_START + reserved);
        self.store_free_memory_pointer();
    }

    /// Stack post: `<free memory pointer>`
    pub fn fetch_free_memory_pointer(&mut self) {
        self.ctx.push(FREE_MEMORY_POINTER).op(Instruction::MLOAD);
    }

    /// Stack pre: `<new free memory pointer>`
    pub fn store_free_memory_pointer(&mut self) {
        self.ctx.push(FREE_MEMORY_POINTER).op(Instruction::MSTORE);
    }

    /// Allocates a memory area of the size on the stack.
    ///
    /// Stack pre: `<size>`; post: `<memory pointer>`
    pub fn allocate_memory(&mut self) {
        self.fetch_free_memory_pointer();
        self.ctx.op(Instruction::SWAP1).op(Instruction::DUP2).op(Instruction::ADD);
        self.store_free_memory_pointer();
    }

    /// Allocates `size` bytes of memory.
    ///
    /// Stack post: `<memory pointer>`
    pub fn allocate_memory_static(&mut self, size: U256) {
        self.fetch_free_memory_pointer();
        self.ctx.op(Instruction::DUP1).push(size).op(Instruction::ADD);
        self.store_free_memory_pointer();
    }

    /// Stack pre: `<mem_end>`; post: `<size> <mem_start>`
    pub fn to_size_after_free_memory_pointer(&mut self) {
        self.fetch_free_memory_pointer();
        self.ctx
            .op(Instruction::DUP1)
            .op(Instruction::SWAP2)
            .op(Instruction::SUB)
            .op(Instruction::SWAP1);
    }

    /// Number of bytes of a value type in an unpadded encoding.
    fn encoded_size(&self, ty: &Type, pad: bool) -> usize {
        if pad { 32 } else { self.ctx.ast().storage_bytes(ty) }
    }

    /// Loads a value type from memory or calldata.
    ///
    /// Stack pre: `<offset>`; post: `<value>`, or `<value> <updated offset>` if
    /// `keep_updated_offset`.
    pub fn load_from_memory_dynamic(
        &mut self,
        ty: &Type,
        from_calldata: bool,
        pad: bool,
        keep_updated_offset: bool,
    ) -> Result<()> {
        if !ty.is_value_type() {
            return Err(CompileError::unimplemented("loading reference types from memory"));
        }
        if keep_updated_offset {
            self.ctx.op(Instruction::DUP1);
        }
        let bytes = self.load_from_memory_helper(ty, from_calldata, pad)?;
        if keep_updated_offset {
            self.move_to_stack_top(1, 1)?;
            self.ctx.push(bytes as u64).op(Instruction::ADD);
        }
        Ok(())
    }

    fn load_from_memory_helper(
        &mut self,
        ty: &Type,
        from_calldata: bool,
        pad: bool,
    ) -> Result<usize> {
        let bytes = self.encoded_size(ty, pad);
        if bytes == 0 {
            self.ctx.op(Instruction::POP).push(0u64);
            return Ok(0);
        }
        self.ctx.op(if from_calldata { Instruction::CALLDATALOAD } else { Instruction::MLOAD });
        let mut cleanup = true;
        if bytes != 32 {
            let shift = (32 - bytes) * 8;
            self.right_shift_number_on_stack(shift);
            if matches!(ty, Type::FixedBytes(_)) {
                self.left_shift_number_on_stack(shift);
                cleanup = false;
            } else if matches!(ty, Type::Integer { signed: false, .. }) {
                cleanup = false;
            }
        }
        if from_calldata {
            self.convert_type_full(ty, ty, cleanup, false, true)?;
        }
        Ok(bytes)
    }

    /// Cleans a value type and shifts it into position for a store of `encoded_size` bytes.
    ///
    /// Returns the number of bytes to store.
    fn prepare_memory_store(&mut self, ty: &Type, pad: bool) -> Result<usize> {
        let bytes = self.encoded_size(ty, pad);
        if bytes == 0 {
            self.ctx.op(Instruction::POP);
            return Ok(0);
        }
        ensure!(bytes <= 32, "memory store of more than 32 bytes");
        self.convert_type(ty, ty, true)?;
        if bytes != 32 && !matches!(ty, Type::FixedBytes(_)) && !pad {
            self.left_shift_number_on_stack((32 - bytes) * 8);
        }
        Ok(bytes)
    }

    /// Stores a value at a memory offset and advances the offset.
    ///
    /// Stack pre: `<offset> <value...>`; post: `<updated offset>`
    pub fn store_in_memory_dynamic(&mut self, ty: &Type, pad: bool) -> Result<()> {
        match ty {
            Type::StringLiteral(data) => {
                let data = data.clone();
                self.store_string_data(&data);
                let written = if pad { data.len().div_ceil(32) * 32 } else { data.len() };
                self.ctx.push(written as u64).op(Instruction::ADD);
            }
            _ if ty.location() == Some(DataLocation::Memory) => {
                self.ctx.op(Instruction::DUP2).op(Instruction::MSTORE);
                self.ctx.push(32u64).op(Instruction::ADD);
            }
            _ if ty.is_value_type() => {
                let bytes = self.prepare_memory_store(ty, pad)?;
                if bytes > 0 {
                    self.ctx.op(Instruction::DUP2).op(Instruction::MSTORE);
                    self.ctx.push(bytes as u64).op(Instruction::ADD);
                }
            }
            _ => return Err(CompileError::unimplemented(format!("storing {ty:?} in memory"))),
        }
        Ok(())
    }

    /// Stores a value type at a constant memory offset.
    ///
    /// Stack pre: `<value>`; post:
    pub fn store_in_memory(&mut self, offset: u64, ty: &Type) -> Result<()> {
        if self.prepare_memory_store(ty, true)? > 0 {
            self.ctx.push(offset).op(Instruction::MSTORE);
        }
        Ok(())
    }

    /// Writes the bytes of a literal without its length.
    ///
    /// Stack pre: `<offset>`; post: `<offset>`
    pub fn store_string_data(&mut self, data: &[u8]) {
        for (i, chunk) in data.chunks(32).enumerate() {
            let mut word = [0u8; 32];
            word[..chunk.len()].copy_from_slice(chunk);
            self.ctx.push(U256::from_be_bytes(word)).op(Instruction::DUP2);
            if i > 0 {
                self.ctx.push((i * 32) as u64).op(Instruction::ADD);
            }
            self.ctx.op(Instruction::MSTORE);
        }
    }

    /// Writes a literal as a memory byte array: the length followed by the data.
    ///
    /// Stack pre: `<offset>`; post: `<offset>`
    pub fn store_string_literal(&mut self, data: &[u8]) {
        self.ctx.push(data.len() as u64).op(Instruction::DUP2).op(Instruction::MSTORE);
        self.ctx.op(Instruction::DUP1).push(32u64).op(Instruction::ADD);
        self.store_string_data(data);
        self.ctx.op(Instruction::POP);
    }

    /// Hashes the 32-byte value on the stack.
    ///
    /// Stack pre: `<value>`; post: `<keccak256(value)>`
    pub fn compute_hash_static(&mut self) {
        self.ctx.push(0u64).op(Instruction::MSTORE);
        self.ctx.push(32u64).push(0u64).op(Instruction::KECCAK256);
    }

    // ---- stack manipulation ----

    /// Moves the value on top of the stack into the slots of a local variable.
    pub fn move_to_stack_variable(&mut self, decl: crate::ast::DeclId) -> Result<()> {
        let ast = self.ctx.ast();
        let base = self.ctx.base_stack_offset_of_variable(decl)?;
        let position = self.ctx.base_to_current_stack_offset(base);
        let size = ast.size_on_stack(&ast[ast[decl].ty]);
        ensure!(position >= size, "variable size and position mismatch");
        for _ in 0..size {
            self.ctx.swap(position - size + 1)?.op(Instruction::POP);
        }
        Ok(())
    }

    /// Copies an item of `item_size` slots whose lowest slot is `stack_depth` slots deep.
    pub fn copy_to_stack_top(&mut self, stack_depth: usize, item_size: usize) -> Result<()> {
        for _ in 0..item_size {
            self.ctx.dup(stack_depth)?;
        }
        Ok(())
    }

    /// Moves an item of `item_size` slots lying below the top `stack_depth` slots to the top.
    pub fn move_to_stack_top(&mut self, stack_depth: usize, item_size: usize) -> Result<()> {
        self.move_into_stack(item_size, stack_depth)
    }

    /// Moves the top `item_size` slots below the `stack_depth` slots under them.
    pub fn move_into_stack(&mut self, stack_depth: usize, item_size: usize) -> Result<()> {
        if stack_depth <= item_size {
            for _ in 0..stack_depth {
                self.rotate_stack_down(stack_depth + item_size)?;
            }
        } else {
            for _ in 0..item_size {
                self.rotate_stack_up(stack_depth + item_size)?;
            }
        }
        Ok(())
    }

    /// Moves the top slot `items - 1` slots down.
    pub fn rotate_stack_up(&mut self, items: usize) -> Result<()> {
        for i in 1..items {
            self.ctx.swap(items - i)?;
        }
        Ok(())
    }

    /// Moves the slot `items - 1` deep to the top.
    pub fn rotate_stack_down(&mut self, items: usize) -> Result<()> {
        for i in 1..items {
            self.ctx.swap(i)?;
        }
        Ok(())
    }

    pub fn pop_stack_element(&mut self, ty: &Type) {
        let size = self.ctx.ast().size_on_stack(ty);
        self.pop_stack_slots(size);
    }

    pub fn pop_stack_slots(&mut self, amount: usize) {
        self.ctx.pop(amount);
    }

    /// Pops down to `height` and jumps to `tag`, keeping the height bookkeeping of the code
    /// after the jump.
    pub fn pop_and_jump(&mut self, height: usize, tag: &solgen_evmasm::AssemblyItem) -> Result<()> {
        let current = self.ctx.stack_height();
        ensure!(current >= height, "jump target stack height above current height");
        let amount = current - height;
        self.pop_stack_slots(amount);
        self.ctx.append_jump_to(tag, JumpType::Ordinary);
        self.ctx.adjust_stack_offset(amount as i32);
        Ok(())
    }

    /// Pushes the zero value of `ty`.
    pub fn push_zero_value(&mut self, ty: &Type) -> Result<()> {
        match ty {
            Type::Function(f) if f.kind == FunctionTypeKind::Internal => {
                let tag = self.ctx.panic_tag(PanicCode::ZeroInitialisedFunction);
                self.ctx.append(tag.to_push_tag());
            }
            Type::Function(f) if f.kind == FunctionTypeKind::External => {
                self.ctx.push(0u64).push(0u64);
            }
            Type::Array(array) if array.location == DataLocation::Calldata => {
                self.ctx.op(Instruction::CALLDATASIZE);
                if array.is_dynamically_sized() {
                    self.ctx.push(0u64);
                }
            }
            _ if ty.location() == Some(DataLocation::Storage) || ty.is_value_type() => {
                self.ctx.push(0u64);
            }
            Type::Array(array) if array.is_dynamically_sized() => {
                self.ctx.push(ZERO_POINTER);
            }
            Type::Array(array) => {
                let length = array.length.unwrap_or_default();
                self.allocate_memory_static(length * U256::from(32));
                self.ctx.op(Instruction::DUP1);
                if !length.is_zero() {
                    self.ctx.push(length).op(Instruction::SWAP1);
                    self.zero_initialise_memory_array(array)?;
                }
                self.ctx.op(Instruction::POP);
            }
            Type::Struct { id, location: DataLocation::Memory } => {
                let ast = self.ctx.ast();
                let size = ast.memory_data_size(ty)?.max(U256::from(32));
                self.allocate_memory_static(size);
                self.ctx.op(Instruction::DUP1);
                for (index, member) in ast[*id].members.iter().enumerate() {
                    if matches!(ast[member.ty], Type::Mapping { .. }) {
                        continue;
                    }
                    let member_type = ast.struct_member_type(*id, DataLocation::Memory, index);
                    self.push_zero_value(&member_type)?;
                    self.store_in_memory_dynamic(&member_type, true)?;
                }
                self.ctx.op(Instruction::POP);
            }
            _ => return Err(CompileError::internal(format!("no zero value for {ty:?}"))),
        }
        Ok(())
    }

    /// Fills a memory array with zero values.
    ///
    /// Stack pre: `<length> <memory offset>`; post: `<updated memory offset>`
    pub fn zero_initialise_memory_array(&mut self, array: &ArrayType) -> Result<()> {
        let base = self.ctx.ast().array_base_type(array);
        if base.is_value_type() {
            self.ctx
                .op(Instruction::DUP2)
                .push(32u64)
                .op(Instruction::MUL)
                .op(Instruction::DUP1)
                .op(Instruction::CALLDATASIZE)
                .op(Instruction::DUP4)
                .op(Instruction::CALLDATACOPY)
                .op(Instruction::ADD)
                .op(Instruction::SWAP1)
                .op(Instruction::POP);
            return Ok(());
        }
        let start = self.ctx.new_tag();
        let end = self.ctx.new_tag();
        self.ctx.append(start.clone());
        self.ctx.op(Instruction::DUP2).op(Instruction::ISZERO).append_conditional_jump_to(&end);
        self.push_zero_value(&base)?;
        self.store_in_memory_dynamic(&base, true)?;
        self.ctx
            .op(Instruction::SWAP1)
            .push(1u64)
            .op(Instruction::SWAP1)
            .op(Instruction::SUB)
            .op(Instruction::SWAP1);
        self.ctx.append_jump_to(&start, JumpType::Ordinary);
        self.ctx.append(end);
        self.ctx.op(Instruction::SWAP1).op(Instruction::POP);
        Ok(())
    }

    /// Copies `length` bytes in words of 32 bytes; may write up to 31 bytes past the end.
    ///
    /// Stack pre: `<length> <target> <source>`; post:
    pub fn memory_copy(&mut self) -> Result<()> {
        self.ctx.call_low_level_function(LowLevelFunction::MemoryCopy)
    }

    /// Body of [`LowLevelFunction::MemoryCopy`].
    pub(crate) fn memory_copy_body(&mut self) -> Result<()> {
        let start = self.ctx.new_tag();
        let end = self.ctx.new_tag();
        // length target source i
        self.ctx.push(0u64);
        self.ctx.append(start.clone());
        self.ctx
            .op(Instruction::DUP4)
            .op(Instruction::DUP2)
            .op(Instruction::LT)
            .op(Instruction::ISZERO)
            .append_conditional_jump_to(&end);
        self.ctx
            .op(Instruction::DUP2)
            .op(Instruction::DUP2)
            .op(Instruction::ADD)
            .op(Instruction::MLOAD)
            .op(Instruction::DUP4)
            .op(Instruction::DUP3)
            .op(Instruction::ADD)
            .op(Instruction::MSTORE)
            .push(32u64)
            .op(Instruction::ADD);
        self.ctx.append_jump_to(&start, JumpType::Ordinary);
        self.ctx.append(end);
        self.ctx.pop(4);
        Ok(())
    }

    /// Body of [`LowLevelFunction::AbiEncodeBytes`].
    ///
    /// Stack pre: `<target> <memory byte array>`; post: `<end of the padded data>`
    pub(crate) fn abi_encode_bytes_body(&mut self) -> Result<()> {
        // target source length
        self.ctx.op(Instruction::DUP1).op(Instruction::MLOAD);
        self.ctx.op(Instruction::DUP1).op(Instruction::DUP4).op(Instruction::MSTORE);
        self.ctx.op(Instruction::DUP1);
        self.ctx.op(Instruction::DUP4).push(32u64).op(Instruction::ADD);
        self.ctx.op(Instruction::DUP4).push(32u64).op(Instruction::ADD);
        self.memory_copy()?;
        // zero the rest of the last word
        self.ctx
            .push(0u64)
            .op(Instruction::DUP2)
            .op(Instruction::DUP5)
            .op(Instruction::ADD)
            .push(32u64)
            .op(Instruction::ADD)
            .op(Instruction::MSTORE);
        self.round_up_to_words();
        self.ctx
            .op(Instruction::SWAP1)
            .op(Instruction::POP)
            .op(Instruction::ADD)
            .push(32u64)
            .op(Instruction::ADD);
        Ok(())
    }

    /// Stack pre: `<n>`; post: `<n rounded up to a multiple of 32>`
    pub fn round_up_to_words(&mut self) {
        self.ctx.push(31u64).op(Instruction::ADD).push(31u64).op(Instruction::NOT);
        self.ctx.op(Instruction::AND);
    }

    // ---- shifts and cleanup ----

    /// Stack pre: `<value>`; post: `<value << bits>`
    pub fn left_shift_number_on_stack(&mut self, bits: usize) {
        if bits == 0 {
            return;
        }
        if self.ctx.evm_version().has_bitwise_shifting() {
            self.ctx.push(bits as u64).op(Instruction::SHL);
        } else {
            self.ctx.push(U256::from(1) << bits).op(Instruction::MUL);
        }
    }

    /// Stack pre: `<value>`; post: `<value >> bits>`
    pub fn right_shift_number_on_stack(&mut self, bits: usize) {
        if bits == 0 {
            return;
        }
        if self.ctx.evm_version().has_bitwise_shifting() {
            self.ctx.push(bits as u64).op(Instruction::SHR);
        } else {
            self.ctx.push(U256::from(1) << bits).op(Instruction::SWAP1).op(Instruction::DIV);
        }
    }

    /// Clears the bits above `bits`, sign extending for signed integers.
    pub fn clean_higher_order_bits(&mut self, bits: u16, signed: bool) {
        if bits >= 256 {
            return;
        }
        if signed {
            self.ctx.push(u64::from(bits / 8 - 1)).op(Instruction::SIGNEXTEND);
        } else {
            self.ctx.push((U256::from(1) << bits) - U256::from(1)).op(Instruction::AND);
        }
    }

    // ---- conversions ----

    /// Converts the value on the stack from `from` to `to`, cleaning it if `cleanup`.
    pub fn convert_type(&mut self, from: &Type, to: &Type, cleanup: bool) -> Result<()> {
        self.convert_type_full(from, to, cleanup, false, false)
    }

    /// Converts the value on the stack from `from` to `to`.
    ///
    /// `chop` clears the bits of signed values above the target width. With
    /// `as_part_of_argument_decoding` an invalid enum value reverts instead of panicking.
    pub fn convert_type_full(
        &mut self,
        from: &Type,
        to: &Type,
        cleanup: bool,
        chop: bool,
        as_part_of_argument_decoding: bool,
    ) -> Result<()> {
        if from == to && !cleanup {
            return Ok(());
        }
        let ast = self.ctx.ast();
        let mut enum_check = matches!(to, Type::Enum(_)) && (from != to || cleanup);
        let mut chop = chop && matches!(to, Type::Integer { .. });

        match from {
            Type::FixedBytes(n) => match to {
                Type::Integer { bits, signed } => {
                    self.right_shift_number_on_stack(256 - usize::from(*n) * 8);
                    if usize::from(*bits) < usize::from(*n) * 8 {
                        let source = Type::Integer { bits: u16::from(*n) * 8, signed: false };
                        let target = Type::Integer { bits: *bits, signed: *signed };
                        self.convert_type(&source, &target, cleanup)?;
                    }
                }
                Type::Address { .. } => {
                    self.right_shift_number_on_stack(256 - usize::from(*n) * 8);
                    if *n > 20 || cleanup {
                        self.clean_higher_order_bits(160, false);
                    }
                }
                Type::FixedBytes(m) => {
                    if *n == 0 || *m == 0 {
                        self.ctx.op(Instruction::POP).push(0u64);
                    } else if m > n || cleanup {
                        let bytes = (*n).min(*m) as usize;
                        let mask = (U256::from(1) << (256 - bytes * 8)) - U256::from(1);
                        self.ctx.push(mask).op(Instruction::NOT).op(Instruction::AND);
                    }
                }
                _ => return Err(invalid_conversion(from, to)),
            },
            Type::Enum(_) => {
                ensure!(from == to || matches!(to, Type::Integer { .. }), "invalid enum conversion");
            }
            Type::Integer { .. } | Type::Address { .. } | Type::Contract(_) => match to {
                Type::FixedBytes(n) => {
                    if let Type::Integer { bits, signed } = from
                        && u16::from(*n) * 8 > *bits
                    {
                        self.clean_higher_order_bits(*bits, *signed);
                    }
                    self.left_shift_number_on_stack(256 - usize::from(*n) * 8);
                }
                Type::Enum(id) => {
                    self.convert_type(from, from, true)?;
                    let members = ast[*id].variants.len();
                    ensure!(members > 0, "empty enum");
                    self.ctx.push((members - 1) as u64).op(Instruction::DUP2).op(Instruction::GT);
                    self.ctx.append_conditional_panic(PanicCode::EnumConversionError);
                    enum_check = false;
                }
                Type::Integer { .. } | Type::Address { .. } | Type::Contract(_) => {
                    let (target_bits, target_signed) = integer_bits(to);
                    let (source_bits, source_signed) = integer_bits(from);
                    if target_bits > source_bits {
                        self.clean_higher_order_bits(source_bits, source_signed);
                    } else if cleanup {
                        self.clean_higher_order_bits(target_bits, target_signed);
                    }
                    if chop {
                        if target_bits < 256 {
                            let mask = (U256::from(1) << target_bits) - U256::from(1);
                            self.ctx.push(mask).op(Instruction::AND);
                        }
                        chop = false;
                    }
                }
                _ => return Err(invalid_conversion(from, to)),
            },
            Type::Bool => {
                ensure!(from == to, "invalid conversion for bool");
                if cleanup {
                    self.ctx.op(Instruction::ISZERO).op(Instruction::ISZERO);
                }
            }
            Type::Function(f) => {
                ensure!(
                    matches!(to, Type::Function(g) if g.kind == f.kind),
                    "invalid function type conversion"
                );
                if cleanup && f.kind == FunctionTypeKind::Internal {
                    self.clean_higher_order_bits(64, false);
                }
            }
            Type::StringLiteral(data) => match to {
                Type::FixedBytes(n) => {
                    let mut word = [0u8; 32];
                    let len = data.len().min(usize::from(*n));
                    word[..len].copy_from_slice(&data[..len]);
                    self.ctx.push(U256::from_be_bytes(word));
                }
                Type::Array(array)
                    if array.is_byte_array() && array.location == DataLocation::Memory =>
                {
                    let size = 32 + data.len().div_ceil(32) * 32;
                    self.allocate_memory_static(U256::from(size));
                    self.store_string_literal(data);
                }
                Type::StringLiteral(_) => {}
                _ => return Err(invalid_conversion(from, to)),
            },
            Type::Array(source) => {
                let Type::Array(target) = to else {
                    return Err(invalid_conversion(from, to));
                };
                match (source.location, target.location) {
                    (DataLocation::Storage, DataLocation::Memory) => {
                        self.convert_storage_array_to_memory(source, target)?;
                    }
                    (DataLocation::Memory, DataLocation::Memory)
                    | (DataLocation::Storage, DataLocation::Storage)
                    | (DataLocation::Calldata, DataLocation::Calldata) => {}
                    _ => {
                        return Err(CompileError::unimplemented(format!(
                            "conversion of arrays from {} to {}",
                            source.location, target.location
                        )));
                    }
                }
            }
            Type::Struct { location: source, .. } => {
                let Type::Struct { location: target, .. } = to else {
                    return Err(invalid_conversion(from, to));
                };
                if source != target {
                    return Err(CompileError::unimplemented(format!(
                        "conversion of structs from {source} to {target}"
                    )));
                }
            }
            Type::Tuple(sources) => {
                let Type::Tuple(targets) = to else {
                    return Err(invalid_conversion(from, to));
                };
                ensure!(sources.len() == targets.len(), "tuple conversion with different arity");
                let mut depth = ast.size_on_stack(from);
                for (&source, &target) in sources.iter().zip(targets) {
                    let (source, target) = (&ast[source], &ast[target]);
                    let source_size = ast.size_on_stack(source);
                    let target_size = ast.size_on_stack(target);
                    if source != target || cleanup {
                        if source_size > 0 {
                            self.copy_to_stack_top(depth, source_size)?;
                        }
                        self.convert_type(source, target, cleanup)?;
                        for _ in 0..source_size.min(target_size) {
                            self.ctx.swap(depth + target_size - source_size)?.op(Instruction::POP);
                        }
                        for _ in target_size..source_size {
                            self.move_to_stack_top(depth - 1, 1)?;
                            self.ctx.op(Instruction::POP);
                        }
                        if target_size > source_size {
                            self.move_into_stack(
                                depth + target_size - source_size - 1,
                                target_size - source_size,
                            )?;
                        }
                    }
                    depth -= source_size;
                }
            }
            _ => {
                ensure!(from == to, "invalid conversion from {from:?} to {to:?}");
            }
        }

        if enum_check && let Type::Enum(id) = to {
            let members = ast[*id].variants.len();
            ensure!(members > 0, "empty enum");
            self.ctx.push((members - 1) as u64).op(Instruction::DUP2).op(Instruction::GT);
            if as_part_of_argument_decoding {
                self.ctx.append_conditional_revert(false);
            } else {
                self.ctx.append_conditional_panic(PanicCode::EnumConversionError);
            }
        }
        ensure!(!chop, "sign bits were not chopped");
        Ok(())
    }

    /// Copies a storage array into newly allocated memory.
    ///
    /// Stack pre: `<storage ref>`; post: `<memory pointer>`
    fn convert_storage_array_to_memory(
        &mut self,
        source: &ArrayType,
        target: &ArrayType,
    ) -> Result<()> {
        let base = self.ctx.ast().array_base_type(target);
        if !source.is_byte_array() && !base.is_value_type() {
            return Err(CompileError::unimplemented("copying nested arrays from storage to memory"));
        }
        ArrayUtils::new(self.ctx).retrieve_length(source, 0)?;
        // ref length
        self.ctx.op(Instruction::DUP1);
        ArrayUtils::new(self.ctx).convert_length_to_size(target, true)?;
        if target.is_dynamically_sized() {
            self.ctx.push(32u64).op(Instruction::ADD);
        }
        self.allocate_memory();
        // ref length mem_start
        self.ctx.op(Instruction::DUP1);
        self.move_into_stack(3, 1)?;
        // mem_start ref length mem_start
        if target.is_dynamically_sized() {
            self.ctx.op(Instruction::DUP2);
            self.store_in_memory_dynamic(&Type::uint(256), true)?;
        }
        // mem_start ref length data_pos
        self.copy_to_stack_top(3, 1)?;
        ArrayUtils::new(self.ctx).copy_array_to_memory(source, true)?;
        self.pop_stack_slots(3);
        Ok(())
    }

    // ---- ABI ----

    /// ABI-encodes values into memory.
    ///
    /// Stack pre: `<v1> ... <vn> <memory start>`; post: `<memory end>`
    pub fn abi_encode(&mut self, given: &[Type], targets: &[Type]) -> Result<()> {
        ensure!(given.len() == targets.len(), "ABI encoding with mismatched types");
        let ast = self.ctx.ast();
        let sizes: Vec<usize> = given.iter().map(|ty| ast.size_on_stack(ty)).collect();
        let total: usize = sizes.iter().sum();
        let head_size: usize = targets.iter().map(|ty| ast.calldata_encoded_size(ty)).sum();

        // values start tail
        self.ctx.op(Instruction::DUP1).push(head_size as u64).op(Instruction::ADD);
        let mut head = 0usize;
        for (i, (source, target)) in given.iter().zip(targets).enumerate() {
            let above: usize = sizes[i + 1..].iter().sum();
            let depth = above + 2 + sizes[i];
            if target.is_value_type() {
                self.copy_to_stack_top(depth, sizes[i])?;
                self.convert_type(source, target, true)?;
                self.ctx.op(Instruction::DUP3).push(head as u64).op(Instruction::ADD);
                self.ctx.op(Instruction::MSTORE);
            } else if target.is_byte_array() {
                self.ctx
                    .op(Instruction::DUP2)
                    .op(Instruction::DUP2)
                    .op(Instruction::SUB)
                    .op(Instruction::DUP3)
                    .push(head as u64)
                    .op(Instruction::ADD)
                    .op(Instruction::MSTORE);
                match source {
                    Type::StringLiteral(data) => {
                        self.store_string_literal(data);
                        let size = 32 + data.len().div_ceil(32) * 32;
                        self.ctx.push(size as u64).op(Instruction::ADD);
                    }
                    Type::Array(array) if array.is_byte_array() => {
                        self.copy_to_stack_top(depth, sizes[i])?;
                        if array.location != DataLocation::Memory {
                            self.convert_type(source, target, false)?;
                        }
                        self.ctx.call_low_level_function(LowLevelFunction::AbiEncodeBytes)?;
                    }
                    _ => return Err(invalid_conversion(source, target)),
                }
            } else {
                return Err(CompileError::unimplemented(format!("ABI encoding of {target:?}")));
            }
            head += ast.calldata_encoded_size(target);
        }
        // values start end
        self.ctx.op(Instruction::SWAP1).op(Instruction::POP);
        for _ in 0..total {
            self.ctx.op(Instruction::SWAP1).op(Instruction::POP);
        }
        Ok(())
    }

    /// Encodes values tightly packed, without padding or length words.
    ///
    /// Stack pre: `<v1> ... <vn> <memory start>`; post: `<memory end>`
    pub fn packed_encode(&mut self, given: &[Type]) -> Result<()> {
        let ast = self.ctx.ast();
        let sizes: Vec<usize> = given.iter().map(|ty| ast.size_on_stack(ty)).collect();
        let total: usize = sizes.iter().sum();
        for (i, ty) in given.iter().enumerate() {
            let above: usize = sizes[i + 1..].iter().sum();
            // values position
            match ty {
                Type::Array(array)
                    if array.is_byte_array() && array.location == DataLocation::Memory =>
                {
                    self.copy_to_stack_top(above + 1 + sizes[i], 1)?;
                    // pos array
                    self.ctx.op(Instruction::DUP1).op(Instruction::MLOAD);
                    // pos array length
                    self.ctx.op(Instruction::DUP1);
                    self.ctx.op(Instruction::DUP4);
                    self.ctx.op(Instruction::DUP4).push(32u64).op(Instruction::ADD);
                    // pos array length length pos data
                    self.memory_copy()?;
                    self.ctx.op(Instruction::SWAP1).op(Instruction::POP).op(Instruction::ADD);
                }
                _ if ty.is_value_type() => {
                    self.copy_to_stack_top(above + 1 + sizes[i], sizes[i])?;
                    self.store_in_memory_dynamic(ty, false)?;
                }
                Type::StringLiteral(_) => self.store_in_memory_dynamic(ty, false)?,
                _ => return Err(CompileError::unimplemented(format!("packed encoding of {ty:?}"))),
            }
        }
        for _ in 0..total {
            self.ctx.op(Instruction::SWAP1).op(Instruction::POP);
        }
        Ok(())
    }

    /// Decodes static value types, reverting if the data is too short.
    ///
    /// Stack pre: `<offset> <length>`; post: `<v1> ... <vn>`
    pub fn abi_decode(&mut self, types: &[Type], from_memory: bool) -> Result<()> {
        let ast = self.ctx.ast();
        let mut head_size = 0u64;
        for ty in types {
            if !ty.is_value_type() {
                return Err(CompileError::unimplemented(format!("ABI decoding of {ty:?}")));
            }
            head_size += ast.calldata_encoded_size(ty) as u64;
        }
        self.ctx.push(head_size).op(Instruction::DUP2).op(Instruction::LT);
        self.ctx.append_conditional_revert(false);
        self.ctx.op(Instruction::POP);
        for (i, ty) in types.iter().enumerate() {
            self.ctx.dup(i + 1)?;
            if i > 0 {
                self.ctx.push((i * 32) as u64).op(Instruction::ADD);
            }
            self.load_from_memory_helper(ty, !from_memory, true)?;
            if from_memory {
                self.convert_type_full(ty, ty, true, false, true)?;
            }
        }
        self.move_to_stack_top(types.len(), 1)?;
        self.ctx.op(Instruction::POP);
        Ok(())
    }

    /// Reverts with `Error(string)` carrying the value on the stack.
    ///
    /// Stack pre: `<reason>`
    pub fn revert_with_string_data(&mut self, reason: &Type) -> Result<()> {
        self.fetch_free_memory_pointer();
        self.ctx
            .push(U256::from(ERROR_SELECTOR) << 224)
            .op(Instruction::DUP2)
            .op(Instruction::MSTORE)
            .push(4u64)
            .op(Instruction::ADD);
        let target = Type::bytes(DataLocation::Memory, true);
        self.abi_encode(std::slice::from_ref(reason), std::slice::from_ref(&target))?;
        self.to_size_after_free_memory_pointer();
        self.ctx.op(Instruction::REVERT);
        Ok(())
    }
}

fn integer_bits(ty: &Type) -> (u16, bool) {
    match ty {
        Type::Integer { bits, signed } => (*bits, *signed),
        _ => (160, false),
    }
}

fn invalid_conversion(from: &Type, to: &Type) -> CompileError {
    CompileError::internal(format!("invalid conversion from {from:?} to {to:?}"))
}
