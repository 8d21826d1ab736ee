//! Expression compilation.
//!
//! Every expression leaves exactly `size_on_stack` slots of its type on the stack. Expressions
//! that denote a location are compiled to an [`LValue`] whose reference stays on the stack; the
//! caller either reads through it or stores to it.

use crate::{
    Result,
    array_utils::ArrayUtils,
    ast::{
        BinOpKind, Builtin, CallExpr, CallKind, DeclId, ExprId, ExprKind, FunctionId, Lit, Res,
        StateMutability, UnOpKind,
    },
    context::{Callable, CompilerContext},
    error::{CompileError, ensure},
    lvalue::LValue,
    panic::PanicCode,
    types::{
        ArrayKind, ArrayType, DataLocation, FunctionType, FunctionTypeKind, MagicKind, Type,
        is_getter_member, selector,
    },
    utils::{CompilerUtils, ZERO_POINTER},
};
use alloy_primitives::{U256, keccak256};
use solgen_evmasm::{AssemblyItem, Instruction, JumpType};

/// Gas forwarded by `send` and `transfer` when no value is sent. The EVM adds the same stipend
/// to calls with value.
const CALL_STIPEND: u64 = 2300;

/// Compiles expressions into the assembly of a [`CompilerContext`].
pub struct ExpressionCompiler<'c, 'a> {
    ctx: &'c mut CompilerContext<'a>,
    /// Evaluate literal operands of commutative operators last.
    reorder_literals: bool,
}

impl<'c, 'a> ExpressionCompiler<'c, 'a> {
    pub fn new(ctx: &'c mut CompilerContext<'a>) -> Self {
        let reorder_literals = ctx.settings().optimise;
        Self { ctx, reorder_literals }
    }

    fn utils(&mut self) -> CompilerUtils<'_, 'a> {
        CompilerUtils::new(self.ctx)
    }

    fn arrays(&mut self) -> ArrayUtils<'_, 'a> {
        ArrayUtils::new(self.ctx)
    }

    /// Compiles `expr`, leaving its value on the stack.
    pub fn compile(&mut self, expr: ExprId) -> Result<()> {
        if let Some(lvalue) = self.visit(expr, false)? {
            lvalue.retrieve_value(self.ctx, true)?;
        }
        Ok(())
    }

    /// Compiles `expr` and converts its value to `target`.
    pub fn compile_and_convert(
        &mut self,
        expr: ExprId,
        target: &Type,
        cleanup: bool,
    ) -> Result<()> {
        self.compile(expr)?;
        let ty = self.ctx.ast().type_of(expr);
        self.utils().convert_type(ty, target, cleanup)
    }

    /// Compiles `expr` as an assignable location, leaving its reference on the stack.
    pub fn compile_lvalue(&mut self, expr: ExprId) -> Result<LValue> {
        self.visit(expr, true)?
            .ok_or_else(|| CompileError::internal("expression is not assignable"))
    }

    fn visit(&mut self, expr: ExprId, want_lvalue: bool) -> Result<Option<LValue>> {
        let ast = self.ctx.ast();
        let node = &ast[expr];
        let previous = self.ctx.set_location(node.location);
        let result = self.visit_kind(&node.kind, &ast[node.ty], want_lvalue);
        self.ctx.set_location(previous);
        result
    }

    fn visit_kind(
        &mut self,
        kind: &ExprKind,
        ty: &'a Type,
        want_lvalue: bool,
    ) -> Result<Option<LValue>> {
        match kind {
            ExprKind::Lit(lit) => {
                self.literal(lit, ty)?;
                Ok(None)
            }
            ExprKind::Ident(res) => self.identifier(*res, ty),
            ExprKind::Type(_) | ExprKind::New(_) => Ok(None),
            ExprKind::Assign(lhs, op, rhs) => {
                self.assignment(*lhs, *op, *rhs)?;
                Ok(None)
            }
            ExprKind::Tuple(components) => self.tuple(components, want_lvalue),
            ExprKind::Unary(op, operand) => {
                self.unary(*op, *operand, ty)?;
                Ok(None)
            }
            ExprKind::Binary(lhs, op, rhs) => {
                self.binary(*lhs, *op, *rhs, ty)?;
                Ok(None)
            }
            ExprKind::Ternary(cond, then, otherwise) => {
                self.conditional(*cond, *then, *otherwise, ty)?;
                Ok(None)
            }
            ExprKind::Delete(operand) => {
                let lvalue = self.compile_lvalue(*operand)?;
                lvalue.set_to_zero(self.ctx, true)?;
                Ok(None)
            }
            ExprKind::Call(call) => self.call(call, ty),
            ExprKind::Member(base, name) => self.member(*base, name, ty),
            ExprKind::Index(base, index) => self.index(*base, *index),
        }
    }

    fn literal(&mut self, lit: &Lit, ty: &Type) -> Result<()> {
        match lit {
            Lit::Number(value) => {
                let value = match ty {
                    Type::FixedBytes(n) => *value << (256 - usize::from(*n) * 8),
                    _ => *value,
                };
                self.ctx.push(value);
            }
            Lit::Bool(value) => {
                self.ctx.push(u64::from(*value));
            }
            Lit::Str(data) => {
                if !matches!(ty, Type::StringLiteral(_)) {
                    self.utils().convert_type(&Type::StringLiteral(data.clone()), ty, false)?;
                }
            }
        }
        Ok(())
    }

    fn identifier(&mut self, res: Res, ty: &Type) -> Result<Option<LValue>> {
        match res {
            Res::Variable(decl) => self.variable(decl),
            Res::Function(function) => {
                self.push_function_pointer(function, ty);
                Ok(None)
            }
            Res::Builtin(Builtin::This) => {
                self.ctx.op(Instruction::ADDRESS);
                Ok(None)
            }
            Res::Builtin(Builtin::Now) => {
                self.ctx.op(Instruction::TIMESTAMP);
                Ok(None)
            }
            // type names, events, magic objects and builtin functions have no value
            Res::Contract(_) | Res::Struct(_) | Res::Enum(_) | Res::Event(_) | Res::Builtin(_) => {
                Ok(None)
            }
        }
    }

    fn variable(&mut self, decl: DeclId) -> Result<Option<LValue>> {
        let ast = self.ctx.ast();
        let var = &ast[decl];
        if self.ctx.is_local_variable(decl) {
            return Ok(Some(LValue::stack_variable(self.ctx, decl)));
        }
        if var.is_constant() {
            let init = var.initializer.ok_or_else(|| {
                CompileError::internal(format!("constant {} without a value", var.name))
            })?;
            self.compile_and_convert(init, &ast[var.ty], false)?;
            return Ok(None);
        }
        if var.is_immutable() {
            return Ok(Some(LValue::Immutable { decl, ty: ast[var.ty].clone() }));
        }
        ensure!(var.is_state, "variable {} is not in scope", var.name);
        Ok(Some(LValue::state_variable(self.ctx, decl)?))
    }

    /// Pushes the entry tag of an internal function used as a value.
    fn push_function_pointer(&mut self, function: FunctionId, ty: &Type) {
        if matches!(ty, Type::Function(f) if f.kind == FunctionTypeKind::Internal) {
            let tag = self.ctx.function_entry_label(Callable::Function(function));
            self.ctx.record_internal_pointer(function);
            self.ctx.append(tag.to_push_tag());
        }
    }

    fn tuple(
        &mut self,
        components: &[Option<ExprId>],
        want_lvalue: bool,
    ) -> Result<Option<LValue>> {
        if let [Some(inner)] = components {
            return self.visit(*inner, want_lvalue);
        }
        if want_lvalue {
            let mut lvalues = Vec::with_capacity(components.len());
            for component in components {
                lvalues.push(match component {
                    Some(expr) => Some(self.compile_lvalue(*expr)?),
                    None => None,
                });
            }
            return Ok(Some(LValue::Tuple(lvalues)));
        }
        for &component in components {
            let expr = component
                .ok_or_else(|| CompileError::internal("empty tuple component used as a value"))?;
            self.compile(expr)?;
        }
        Ok(None)
    }

    // ---- assignments ----

    fn assignment(&mut self, lhs: ExprId, op: Option<BinOpKind>, rhs: ExprId) -> Result<()> {
        let ast = self.ctx.ast();
        let left_type = ast.type_of(lhs);
        let right_type = ast.type_of(rhs);
        let intermediate = match op {
            Some(op) if op.is_shift() || op == BinOpKind::Pow => right_type.clone(),
            _ if left_type.is_value_type() => left_type.clone(),
            _ => match right_type {
                Type::StringLiteral(_) => {
                    let is_string =
                        matches!(left_type, Type::Array(a) if a.kind == ArrayKind::String);
                    Type::bytes(DataLocation::Memory, is_string)
                }
                _ => right_type.clone(),
            },
        };
        let cleanup = op.is_some_and(|op| self.cleanup_needed(op, left_type));

        self.compile(rhs)?;
        self.utils().convert_type(right_type, &intermediate, cleanup)?;
        let lvalue = self.compile_lvalue(lhs)?;

        let Some(op) = op else {
            return lvalue.store_value(self.ctx, &intermediate, false);
        };
        ensure!(left_type.is_value_type(), "compound assignment to a reference type");
        let lvalue_size = lvalue.size_on_stack();
        let item_size = ast.size_on_stack(&intermediate);
        if lvalue_size > 0 {
            let mut utils = self.utils();
            utils.copy_to_stack_top(lvalue_size + item_size, item_size)?;
            utils.copy_to_stack_top(item_size + lvalue_size, lvalue_size)?;
        }
        // value [ref] [value] [ref]
        lvalue.retrieve_value(self.ctx, true)?;
        if cleanup {
            self.utils().convert_type(left_type, left_type, true)?;
        }
        if !op.is_commutative() {
            self.ctx.op(Instruction::SWAP1);
        }
        if op.is_shift() {
            self.shift_operator(op, left_type)?;
        } else {
            self.binary_operator(op, left_type)?;
        }
        if lvalue_size > 0 {
            // drop the copy of the right-hand side below the reference
            for _ in 0..item_size {
                self.ctx.swap(item_size + lvalue_size)?.op(Instruction::POP);
            }
        }
        lvalue.store_value(self.ctx, left_type, false)
    }

    // ---- operators ----

    fn unary(&mut self, op: UnOpKind, operand: ExprId, ty: &Type) -> Result<()> {
        if op.is_modifying() {
            return self.increment(op, operand, ty);
        }
        self.compile(operand)?;
        match op {
            UnOpKind::Not => {
                self.ctx.op(Instruction::ISZERO);
            }
            UnOpKind::BitNot => {
                self.ctx.op(Instruction::NOT);
            }
            UnOpKind::Neg => {
                if let Some((bits, true)) = self.checked_integer(ty) {
                    self.utils().convert_type(ty, ty, true)?;
                    self.ctx.op(Instruction::DUP1).push(signed_min(bits)).op(Instruction::EQ);
                    self.ctx.append_conditional_panic(PanicCode::UnderOverflow);
                }
                self.ctx.push(0u64).op(Instruction::SUB);
            }
            _ => return Err(CompileError::internal(format!("{op:?} is not a pure operator"))),
        }
        Ok(())
    }

    /// `++x`, `x++`, `--x` and `x--`.
    fn increment(&mut self, op: UnOpKind, operand: ExprId, ty: &Type) -> Result<()> {
        let lvalue = self.compile_lvalue(operand)?;
        let lvalue_size = lvalue.size_on_stack();
        lvalue.retrieve_value(self.ctx, false)?;
        if self.checked_integer(ty).is_some() {
            self.utils().convert_type(ty, ty, true)?;
        }
        if !op.is_prefix() {
            ensure!(self.ctx.ast().size_on_stack(ty) == 1, "postfix operator on a multi-slot value");
            // keep the old value below the reference
            self.ctx.op(Instruction::DUP1);
            if lvalue_size > 0 {
                for i in (1..=lvalue_size + 1).rev() {
                    self.ctx.swap(i)?;
                }
            }
        }
        self.ctx.push(1u64);
        let operator = match op {
            UnOpKind::PreInc | UnOpKind::PostInc => BinOpKind::Add,
            _ => BinOpKind::Sub,
        };
        self.binary_operator(operator, ty)?;
        // [old] [ref] new
        for i in (1..=lvalue_size).rev() {
            self.ctx.swap(i)?;
        }
        lvalue.store_value(self.ctx, ty, !op.is_prefix())
    }

    fn binary(&mut self, lhs: ExprId, op: BinOpKind, rhs: ExprId, ty: &Type) -> Result<()> {
        if op.is_short_circuit() {
            return self.short_circuit(lhs, op, rhs);
        }
        let ast = self.ctx.ast();
        if op.is_shift() || op == BinOpKind::Pow {
            let cleanup = self.cleanup_needed(op, ty);
            self.compile_and_convert(lhs, ty, cleanup)?;
            let amount = ast.type_of(rhs);
            self.compile_and_convert(rhs, amount, true)?;
            return if op == BinOpKind::Pow {
                self.ctx.op(Instruction::SWAP1).op(Instruction::EXP);
                Ok(())
            } else {
                self.shift_operator(op, ty)
            };
        }

        let operand_type = if op.is_comparison() {
            if is_literal(ast.type_of(lhs), &ast[lhs].kind) { ast.type_of(rhs) } else { ast.type_of(lhs) }
        } else {
            ty
        };
        let cleanup = self.cleanup_needed(op, operand_type);
        let literal_first = matches!(ast[lhs].kind, ExprKind::Lit(_))
            && !matches!(ast[rhs].kind, ExprKind::Lit(_));
        if self.reorder_literals && op.is_commutative() && literal_first {
            self.compile_and_convert(rhs, operand_type, cleanup)?;
            self.compile_and_convert(lhs, operand_type, cleanup)?;
        } else {
            self.compile_and_convert(lhs, operand_type, cleanup)?;
            self.compile_and_convert(rhs, operand_type, cleanup)?;
        }
        if op.is_comparison() {
            self.comparison_operator(op, operand_type)
        } else {
            self.binary_operator(op, operand_type)
        }
    }

    /// `&&` and `||`: the right operand is skipped once the result is known.
    fn short_circuit(&mut self, lhs: ExprId, op: BinOpKind, rhs: ExprId) -> Result<()> {
        self.compile_and_convert(lhs, &Type::Bool, false)?;
        self.ctx.op(Instruction::DUP1);
        if op == BinOpKind::And {
            self.ctx.op(Instruction::ISZERO);
        }
        let end = self.ctx.append_conditional_jump();
        self.ctx.op(Instruction::POP);
        self.compile_and_convert(rhs, &Type::Bool, false)?;
        self.ctx.append(end);
        Ok(())
    }

    fn conditional(
        &mut self,
        cond: ExprId,
        then: ExprId,
        otherwise: ExprId,
        ty: &Type,
    ) -> Result<()> {
        self.compile_and_convert(cond, &Type::Bool, false)?;
        let true_tag = self.ctx.append_conditional_jump();
        self.compile_and_convert(otherwise, ty, false)?;
        let end = self.ctx.new_tag();
        self.ctx.append_jump_to(&end, JumpType::Ordinary);
        let size = self.ctx.ast().size_on_stack(ty);
        self.ctx.adjust_stack_offset(-(size as i32));
        self.ctx.append(true_tag);
        self.compile_and_convert(then, ty, false)?;
        self.ctx.append(end);
        Ok(())
    }

    /// Whether operands of `op` must have clean high-order bits.
    fn cleanup_needed(&self, op: BinOpKind, ty: &Type) -> bool {
        if op.is_comparison() || op.is_shift() {
            return true;
        }
        if !matches!(ty, Type::Integer { .. }) {
            return false;
        }
        match op {
            BinOpKind::Div | BinOpKind::Rem | BinOpKind::Pow => true,
            BinOpKind::Add | BinOpKind::Sub | BinOpKind::Mul => self.ctx.settings().checked_arithmetic,
            _ => false,
        }
    }

    /// The width and signedness of `ty` if arithmetic on it is overflow checked.
    fn checked_integer(&self, ty: &Type) -> Option<(u16, bool)> {
        match ty {
            Type::Integer { bits, signed } if self.ctx.settings().checked_arithmetic => {
                Some((*bits, *signed))
            }
            _ => None,
        }
    }

    /// Stack pre: `<left> <right>`; post: `<result>`
    fn comparison_operator(&mut self, op: BinOpKind, ty: &Type) -> Result<()> {
        let signed = ty.is_signed();
        let (lt, gt) = if signed {
            (Instruction::SLT, Instruction::SGT)
        } else {
            (Instruction::LT, Instruction::GT)
        };
        match op {
            BinOpKind::Eq => {
                self.ctx.op(Instruction::EQ);
            }
            BinOpKind::Ne => {
                self.ctx.op(Instruction::EQ).op(Instruction::ISZERO);
            }
            BinOpKind::Lt => {
                self.ctx.op(gt);
            }
            BinOpKind::Gt => {
                self.ctx.op(lt);
            }
            BinOpKind::Le => {
                self.ctx.op(lt).op(Instruction::ISZERO);
            }
            BinOpKind::Ge => {
                self.ctx.op(gt).op(Instruction::ISZERO);
            }
            _ => return Err(CompileError::internal(format!("{op:?} is not a comparison"))),
        }
        Ok(())
    }

    /// Arithmetic and bitwise operators.
    ///
    /// Stack pre: `<left> <right>`; post: `<result>`
    fn binary_operator(&mut self, op: BinOpKind, ty: &Type) -> Result<()> {
        let checked = self.checked_integer(ty);
        let signed = ty.is_signed();
        match op {
            BinOpKind::Add => match checked {
                Some((bits, signed)) => self.checked_add(bits, signed)?,
                None => {
                    self.ctx.op(Instruction::ADD);
                }
            },
            BinOpKind::Sub => match checked {
                Some((bits, signed)) => self.checked_sub(bits, signed)?,
                None => {
                    self.ctx.op(Instruction::SWAP1).op(Instruction::SUB);
                }
            },
            BinOpKind::Mul => match checked {
                Some((bits, signed)) => self.checked_mul(bits, signed)?,
                None => {
                    self.ctx.op(Instruction::MUL);
                }
            },
            BinOpKind::Div | BinOpKind::Rem => {
                self.ctx.op(Instruction::DUP1).op(Instruction::ISZERO);
                self.ctx.append_conditional_panic(PanicCode::DivisionByZero);
                if op == BinOpKind::Div
                    && let Some((bits, true)) = checked
                {
                    // MIN / -1
                    self.ctx.op(Instruction::DUP1).push(0u64).op(Instruction::NOT).op(Instruction::EQ);
                    self.ctx.op(Instruction::DUP3).push(signed_min(bits)).op(Instruction::EQ);
                    self.ctx.op(Instruction::AND);
                    self.ctx.append_conditional_panic(PanicCode::UnderOverflow);
                }
                let instruction = match (op, signed) {
                    (BinOpKind::Div, false) => Instruction::DIV,
                    (BinOpKind::Div, true) => Instruction::SDIV,
                    (_, false) => Instruction::MOD,
                    (_, true) => Instruction::SMOD,
                };
                self.ctx.op(Instruction::SWAP1).op(instruction);
            }
            BinOpKind::Pow => {
                self.ctx.op(Instruction::SWAP1).op(Instruction::EXP);
            }
            BinOpKind::BitAnd => {
                self.ctx.op(Instruction::AND);
            }
            BinOpKind::BitOr => {
                self.ctx.op(Instruction::OR);
            }
            BinOpKind::BitXor => {
                self.ctx.op(Instruction::XOR);
            }
            _ => return Err(CompileError::internal(format!("{op:?} is not an arithmetic operator"))),
        }
        Ok(())
    }

    fn checked_add(&mut self, bits: u16, signed: bool) -> Result<()> {
        match (signed, bits) {
            (false, 256) => {
                // overflow iff the sum wrapped below an operand
                self.ctx.op(Instruction::DUP2).op(Instruction::ADD);
                self.ctx.op(Instruction::DUP1).op(Instruction::DUP3).op(Instruction::GT);
                self.ctx.append_conditional_panic(PanicCode::UnderOverflow);
                self.ctx.op(Instruction::SWAP1).op(Instruction::POP);
            }
            (false, _) => {
                self.ctx.op(Instruction::ADD);
                self.ctx.op(Instruction::DUP1).push(unsigned_max(bits)).op(Instruction::LT);
                self.ctx.append_conditional_panic(PanicCode::UnderOverflow);
            }
            (true, 256) => {
                self.ctx.op(Instruction::DUP2).op(Instruction::DUP2).op(Instruction::ADD);
                // sum < left differs from right < 0
                self.ctx.op(Instruction::DUP3).op(Instruction::DUP2).op(Instruction::SLT);
                self.ctx.push(0u64).op(Instruction::DUP4).op(Instruction::SLT);
                self.ctx.op(Instruction::XOR);
                self.ctx.append_conditional_panic(PanicCode::UnderOverflow);
                self.ctx.op(Instruction::SWAP2).op(Instruction::POP).op(Instruction::POP);
            }
            (true, _) => {
                self.ctx.op(Instruction::ADD);
                self.check_signed_range(bits);
            }
        }
        Ok(())
    }

    fn checked_sub(&mut self, bits: u16, signed: bool) -> Result<()> {
        match (signed, bits) {
            (false, _) => {
                self.ctx.op(Instruction::DUP2).op(Instruction::DUP2).op(Instruction::GT);
                self.ctx.append_conditional_panic(PanicCode::UnderOverflow);
                self.ctx.op(Instruction::SWAP1).op(Instruction::SUB);
            }
            (true, 256) => {
                self.ctx.op(Instruction::DUP1).op(Instruction::DUP3).op(Instruction::SUB);
                // difference > left differs from right < 0
                self.ctx.op(Instruction::DUP3).op(Instruction::DUP2).op(Instruction::SGT);
                self.ctx.push(0u64).op(Instruction::DUP4).op(Instruction::SLT);
                self.ctx.op(Instruction::XOR);
                self.ctx.append_conditional_panic(PanicCode::UnderOverflow);
                self.ctx.op(Instruction::SWAP2).op(Instruction::POP).op(Instruction::POP);
            }
            (true, _) => {
                self.ctx.op(Instruction::SWAP1).op(Instruction::SUB);
                self.check_signed_range(bits);
            }
        }
        Ok(())
    }

    fn checked_mul(&mut self, bits: u16, signed: bool) -> Result<()> {
        self.ctx.op(Instruction::DUP2).op(Instruction::DUP2).op(Instruction::MUL);
        // left right product
        if bits > 128 {
            // left != 0 && product / left != right
            self.ctx
                .op(Instruction::DUP3)
                .op(Instruction::DUP2)
                .op(if signed { Instruction::SDIV } else { Instruction::DIV })
                .op(Instruction::DUP3)
                .op(Instruction::EQ)
                .op(Instruction::ISZERO)
                .op(Instruction::DUP4)
                .op(Instruction::ISZERO)
                .op(Instruction::ISZERO)
                .op(Instruction::AND);
            if signed && bits == 256 {
                // -1 * MIN is not caught by the division
                self.ctx.push(signed_min(256)).op(Instruction::DUP4).op(Instruction::EQ);
                self.ctx.push(0u64).op(Instruction::NOT).op(Instruction::DUP6).op(Instruction::EQ);
                self.ctx.op(Instruction::AND).op(Instruction::OR);
            }
            self.ctx.append_conditional_panic(PanicCode::UnderOverflow);
        }
        if bits < 256 {
            if signed {
                self.check_signed_range(bits);
            } else {
                self.ctx.op(Instruction::DUP1).push(unsigned_max(bits)).op(Instruction::LT);
                self.ctx.append_conditional_panic(PanicCode::UnderOverflow);
            }
        }
        self.ctx.op(Instruction::SWAP2).op(Instruction::POP).op(Instruction::POP);
        Ok(())
    }

    /// Panics unless the signed value on the stack fits into `bits`.
    fn check_signed_range(&mut self, bits: u16) {
        self.ctx
            .op(Instruction::DUP1)
            .push(u64::from(bits / 8 - 1))
            .op(Instruction::SIGNEXTEND)
            .op(Instruction::DUP2)
            .op(Instruction::EQ)
            .op(Instruction::ISZERO);
        self.ctx.append_conditional_panic(PanicCode::UnderOverflow);
    }

    /// Stack pre: `<value> <shift amount>`; post: `<result>`
    fn shift_operator(&mut self, op: BinOpKind, ty: &Type) -> Result<()> {
        let native = self.ctx.evm_version().has_bitwise_shifting();
        match op {
            BinOpKind::Shl if native => {
                self.ctx.op(Instruction::SHL);
            }
            BinOpKind::Shl => {
                self.ctx.push(2u64).op(Instruction::EXP).op(Instruction::MUL);
            }
            BinOpKind::Shr if native => {
                self.ctx.op(if ty.is_signed() { Instruction::SAR } else { Instruction::SHR });
            }
            BinOpKind::Shr if !ty.is_signed() => {
                self.ctx.push(2u64).op(Instruction::EXP).op(Instruction::SWAP1).op(Instruction::DIV);
            }
            BinOpKind::Shr => {
                // negative values are shifted as ~(~value / 2**amount) to round down
                self.ctx.push(2u64).op(Instruction::EXP);
                self.ctx
                    .op(Instruction::DUP2)
                    .push(0u64)
                    .op(Instruction::SWAP1)
                    .op(Instruction::SLT)
                    .push(0u64)
                    .op(Instruction::SUB);
                // value factor mask
                self.ctx.op(Instruction::DUP1).op(Instruction::DUP4).op(Instruction::XOR);
                self.ctx.op(Instruction::DUP3).op(Instruction::SWAP1).op(Instruction::DIV);
                self.ctx.op(Instruction::XOR);
                self.ctx.op(Instruction::SWAP2).op(Instruction::POP).op(Instruction::POP);
            }
            _ => return Err(CompileError::internal(format!("{op:?} is not a shift"))),
        }
        Ok(())
    }

    // ---- member and index access ----

    fn member(&mut self, base: ExprId, name: &str, ty: &'a Type) -> Result<Option<LValue>> {
        let ast = self.ctx.ast();
        let base_type = ast.type_of(base);
        match base_type {
            Type::Magic(kind) => self.magic_member(*kind, name)?,
            Type::TypeType(inner) => match &ast[*inner] {
                Type::Enum(id) => {
                    let index = ast[*id].variants.iter().position(|v| v == name).ok_or_else(|| {
                        CompileError::internal(format!("no member {name} in enum"))
                    })?;
                    self.ctx.push(index as u64);
                }
                Type::Contract(_) => match ty {
                    Type::Function(f) if f.kind == FunctionTypeKind::Internal => {
                        let function = f.declaration.ok_or_else(|| {
                            CompileError::internal("base function without declaration")
                        })?;
                        self.push_function_pointer(function, ty);
                    }
                    _ => return Err(CompileError::unimplemented(format!("contract member {name}"))),
                },
                _ => return Err(CompileError::unimplemented(format!("type member {name}"))),
            },
            Type::Contract(_) => {
                self.compile(base)?;
                match ty {
                    Type::Function(f) if f.kind == FunctionTypeKind::External => {
                        let function = f.declaration.ok_or_else(|| {
                            CompileError::unimplemented("external calls of getters")
                        })?;
                        let signature = ast.function_signature(function)?;
                        self.ctx.push(selector(&signature));
                    }
                    _ => self.address_member(name)?,
                }
            }
            Type::Address { .. } => {
                if name == "balance" && self.is_this(base) && self.ctx.evm_version().has_self_balance()
                {
                    self.ctx.op(Instruction::SELFBALANCE);
                    return Ok(None);
                }
                self.compile(base)?;
                self.address_member(name)?;
            }
            Type::Struct { id, location } => {
                self.compile(base)?;
                let index = ast.struct_member_index(*id, name)?;
                let member_type = ast.struct_member_type(*id, *location, index);
                return match location {
                    DataLocation::Storage => {
                        let (slot, offset) = ast.storage_offsets_of_member(*id, index);
                        self.ctx.push(slot).op(Instruction::ADD).push(offset);
                        Ok(Some(LValue::storage(member_type)))
                    }
                    DataLocation::Memory => {
                        let offset = ast.memory_offset_of_member(*id, index);
                        self.ctx.push(offset as u64).op(Instruction::ADD);
                        Ok(Some(LValue::memory(member_type)))
                    }
                    DataLocation::Calldata => {
                        Err(CompileError::unimplemented("calldata struct members"))
                    }
                };
            }
            Type::Array(array) => {
                self.compile(base)?;
                match name {
                    "length" => match (array.location, array.length) {
                        (_, Some(length)) => {
                            self.utils().pop_stack_element(base_type);
                            self.ctx.push(length);
                        }
                        (DataLocation::Storage, None) => {
                            return Ok(Some(LValue::StorageArrayLength(array.clone())));
                        }
                        (DataLocation::Memory, None) => {
                            self.ctx.op(Instruction::MLOAD);
                        }
                        (DataLocation::Calldata, None) => {
                            self.ctx.op(Instruction::SWAP1).op(Instruction::POP);
                        }
                    },
                    // the array reference is the bound argument
                    "push" | "pop" => {}
                    _ => return Err(CompileError::internal(format!("no array member {name}"))),
                }
            }
            Type::FixedBytes(n) if name == "length" => {
                self.compile(base)?;
                self.ctx.op(Instruction::POP).push(u64::from(*n));
            }
            Type::Function(f) if name == "selector" => {
                ensure!(f.kind == FunctionTypeKind::External, "selector of a non-external function");
                self.compile(base)?;
                self.ctx.op(Instruction::SWAP1).op(Instruction::POP);
                self.utils().left_shift_number_on_stack(224);
            }
            _ => return Err(CompileError::unimplemented(format!("member {name} of {base_type:?}"))),
        }
        Ok(None)
    }

    /// Whether `expr` is `this` or `address(this)`.
    fn is_this(&self, expr: ExprId) -> bool {
        let ast = self.ctx.ast();
        match &ast[expr].kind {
            ExprKind::Ident(Res::Builtin(Builtin::This)) => true,
            ExprKind::Call(call) if call.kind == CallKind::TypeConversion => {
                matches!(call.args[..], [arg] if self.is_this(arg))
            }
            _ => false,
        }
    }

    /// Stack pre: `<address>`; post: the member, or the address for bound call members.
    fn address_member(&mut self, name: &str) -> Result<()> {
        match name {
            "balance" => {
                self.ctx.op(Instruction::BALANCE);
            }
            "codehash" => {
                ensure!(self.ctx.evm_version().has_ext_code_hash(), "codehash before Constantinople");
                self.ctx.op(Instruction::EXTCODEHASH);
            }
            "send" | "transfer" | "call" | "delegatecall" | "staticcall" => {}
            _ => return Err(CompileError::unimplemented(format!("address member {name}"))),
        }
        Ok(())
    }

    fn magic_member(&mut self, kind: MagicKind, name: &str) -> Result<()> {
        let instruction = match (kind, name) {
            (MagicKind::Msg, "sender") => Instruction::CALLER,
            (MagicKind::Msg, "value") => Instruction::CALLVALUE,
            (MagicKind::Msg, "gas") => Instruction::GAS,
            (MagicKind::Msg, "data") => {
                self.ctx.push(0u64).op(Instruction::CALLDATASIZE);
                return Ok(());
            }
            (MagicKind::Msg, "sig") => {
                self.ctx.push(0u64).op(Instruction::CALLDATALOAD);
                self.ctx.push(!(U256::MAX >> 32usize)).op(Instruction::AND);
                return Ok(());
            }
            (MagicKind::Block, "coinbase") => Instruction::COINBASE,
            (MagicKind::Block, "timestamp") => Instruction::TIMESTAMP,
            (MagicKind::Block, "number") => Instruction::NUMBER,
            (MagicKind::Block, "difficulty" | "prevrandao") => Instruction::PREVRANDAO,
            (MagicKind::Block, "gaslimit") => Instruction::GASLIMIT,
            (MagicKind::Block, "chainid") => {
                ensure!(self.ctx.evm_version().has_chain_id(), "chainid before Istanbul");
                Instruction::CHAINID
            }
            (MagicKind::Block, "basefee") => {
                ensure!(self.ctx.evm_version().has_base_fee(), "basefee before London");
                Instruction::BASEFEE
            }
            (MagicKind::Tx, "origin") => Instruction::ORIGIN,
            (MagicKind::Tx, "gasprice") => Instruction::GASPRICE,
            _ => return Err(CompileError::unimplemented(format!("member {name} of {kind:?}"))),
        };
        self.ctx.op(instruction);
        Ok(())
    }

    fn index(&mut self, base: ExprId, index: Option<ExprId>) -> Result<Option<LValue>> {
        let ast = self.ctx.ast();
        let base_type = ast.type_of(base);
        // `T[]` in a type position
        let Some(index) = index else { return Ok(None) };
        let uint256 = Type::uint(256);
        match base_type {
            Type::Mapping { key, value } => {
                self.compile(base)?;
                let key_type = &ast[*key];
                if key_type.is_dynamically_sized() {
                    let key_type = key_type.with_location(DataLocation::Memory);
                    self.compile_and_convert(index, &key_type, false)?;
                    let mut utils = self.utils();
                    utils.fetch_free_memory_pointer();
                    utils.packed_encode(std::slice::from_ref(&key_type))?;
                    // slot end
                    self.ctx.op(Instruction::SWAP1);
                    let mut utils = self.utils();
                    utils.store_in_memory_dynamic(&uint256, true)?;
                    utils.to_size_after_free_memory_pointer();
                    self.ctx.op(Instruction::KECCAK256);
                } else {
                    self.compile_and_convert(index, key_type, true)?;
                    let mut utils = self.utils();
                    utils.store_in_memory(0, key_type)?;
                    utils.store_in_memory(32, &uint256)?;
                    self.ctx.push(64u64).push(0u64).op(Instruction::KECCAK256);
                }
                self.ctx.push(0u64);
                Ok(Some(LValue::storage(ast[*value].with_location(DataLocation::Storage))))
            }
            Type::Array(array) => {
                self.compile(base)?;
                self.compile_and_convert(index, &uint256, true)?;
                self.arrays().access_index(array, true)?;
                let element = ast.array_base_type(array);
                Ok(Some(match array.location {
                    DataLocation::Storage if array.is_byte_array() => LValue::StorageByteArrayElement,
                    DataLocation::Storage => LValue::storage(element),
                    DataLocation::Memory => {
                        LValue::MemoryItem { ty: element, padded: !array.is_byte_array() }
                    }
                    DataLocation::Calldata => {
                        if ast.is_dynamically_encoded(&element) {
                            return Err(CompileError::unimplemented(
                                "access to dynamically encoded calldata elements",
                            ));
                        }
                        LValue::CalldataItem { ty: element }
                    }
                }))
            }
            Type::FixedBytes(n) => {
                self.compile(base)?;
                self.compile_and_convert(index, &uint256, true)?;
                self.ctx
                    .push(u64::from(*n))
                    .op(Instruction::DUP2)
                    .op(Instruction::LT)
                    .op(Instruction::ISZERO);
                self.ctx.append_conditional_panic(PanicCode::ArrayOutOfBounds);
                self.ctx.op(Instruction::BYTE);
                self.utils().left_shift_number_on_stack(248);
                Ok(None)
            }
            Type::TypeType(_) => Ok(None),
            _ => Err(CompileError::unimplemented(format!("index access on {base_type:?}"))),
        }
    }

    // ---- calls ----

    fn call(&mut self, call: &CallExpr, ty: &Type) -> Result<Option<LValue>> {
        let ast = self.ctx.ast();
        match call.kind {
            CallKind::TypeConversion => {
                let [arg] = call.args[..] else {
                    return Err(CompileError::internal("type conversion with more than one argument"));
                };
                self.compile(arg)?;
                self.utils().convert_type(ast.type_of(arg), ty, false)?;
                Ok(None)
            }
            CallKind::StructConstructor => {
                self.struct_constructor(call, ty)?;
                Ok(None)
            }
            CallKind::FunctionCall => {
                let Type::Function(function) = ast.type_of(call.callee) else {
                    return Err(CompileError::internal("call of a non-function"));
                };
                self.function_call(function, call, ty)
            }
        }
    }

    fn struct_constructor(&mut self, call: &CallExpr, ty: &Type) -> Result<()> {
        let ast = self.ctx.ast();
        let Type::Struct { id, .. } = ty else {
            return Err(CompileError::internal("struct constructor of a non-struct"));
        };
        let size = ast.memory_data_size(ty)?.max(U256::from(32));
        self.ctx.push(size);
        self.utils().allocate_memory();
        self.ctx.op(Instruction::DUP1);
        let members = ast[*id]
            .members
            .iter()
            .enumerate()
            .filter(|(_, m)| !matches!(ast[m.ty], Type::Mapping { .. }));
        for ((index, _), &arg) in members.zip(&call.args) {
            let member_type = ast.struct_member_type(*id, DataLocation::Memory, index);
            self.compile_and_convert(arg, &member_type, false)?;
            self.utils().store_in_memory_dynamic(&member_type, true)?;
        }
        self.ctx.op(Instruction::POP);
        Ok(())
    }

    fn function_call(
        &mut self,
        function: &FunctionType,
        call: &CallExpr,
        ty: &Type,
    ) -> Result<Option<LValue>> {
        let ast = self.ctx.ast();
        let uint256 = Type::uint(256);
        match function.kind {
            FunctionTypeKind::Internal => self.internal_call(function, call)?,
            FunctionTypeKind::External
            | FunctionTypeKind::BareCall
            | FunctionTypeKind::BareDelegateCall
            | FunctionTypeKind::BareStaticCall
            | FunctionTypeKind::Send
            | FunctionTypeKind::Transfer => self.external_call(function, call)?,
            FunctionTypeKind::Creation => self.contract_creation(function, call, ty)?,
            FunctionTypeKind::Sha256 => self.precompile_call(function, call, 2)?,
            FunctionTypeKind::Ripemd160 => self.precompile_call(function, call, 3)?,
            FunctionTypeKind::ECRecover => self.precompile_call(function, call, 1)?,
            FunctionTypeKind::Selfdestruct => {
                let [beneficiary] = call.args[..] else {
                    return Err(CompileError::internal("selfdestruct takes one argument"));
                };
                self.compile_and_convert(beneficiary, &Type::Address { payable: true }, true)?;
                self.ctx.op(Instruction::SELFDESTRUCT);
            }
            FunctionTypeKind::Revert => self.revert_call(call)?,
            FunctionTypeKind::Require => self.require_call(call)?,
            FunctionTypeKind::Assert => {
                let [cond] = call.args[..] else {
                    return Err(CompileError::internal("assert takes one argument"));
                };
                self.compile_and_convert(cond, &Type::Bool, false)?;
                self.ctx.op(Instruction::ISZERO);
                self.ctx.append_conditional_panic(PanicCode::Assert);
            }
            FunctionTypeKind::Keccak256 => self.keccak256_call(call)?,
            FunctionTypeKind::Log(topics) => {
                let (data, topic_args) = call
                    .args
                    .split_first()
                    .ok_or_else(|| CompileError::internal("log without data"))?;
                ensure!(topic_args.len() == usize::from(topics), "log{topics} with wrong arity");
                for &topic in topic_args.iter().rev() {
                    self.compile_and_convert(topic, &Type::FixedBytes(32), true)?;
                }
                self.compile(*data)?;
                let data_type = ast.type_of(*data).clone();
                let mut utils = self.utils();
                utils.fetch_free_memory_pointer();
                utils.packed_encode(std::slice::from_ref(&data_type))?;
                utils.to_size_after_free_memory_pointer();
                self.ctx.op(Instruction::log(topics));
            }
            FunctionTypeKind::Event => self.emit_event(function, call)?,
            FunctionTypeKind::BlockHash => {
                let [number] = call.args[..] else {
                    return Err(CompileError::internal("blockhash takes one argument"));
                };
                self.compile_and_convert(number, &uint256, true)?;
                self.ctx.op(Instruction::BLOCKHASH);
            }
            FunctionTypeKind::AddMod | FunctionTypeKind::MulMod => {
                let [x, y, k] = call.args[..] else {
                    return Err(CompileError::internal("addmod and mulmod take three arguments"));
                };
                for arg in [x, y, k] {
                    self.compile_and_convert(arg, &uint256, true)?;
                }
                self.ctx.op(Instruction::DUP1).op(Instruction::ISZERO);
                self.ctx.append_conditional_panic(PanicCode::DivisionByZero);
                // x y k -> k y x
                self.ctx.op(Instruction::SWAP2);
                self.ctx.op(if function.kind == FunctionTypeKind::AddMod {
                    Instruction::ADDMOD
                } else {
                    Instruction::MULMOD
                });
            }
            FunctionTypeKind::GasLeft => {
                self.ctx.op(Instruction::GAS);
            }
            FunctionTypeKind::ArrayPush => return self.array_push(call),
            FunctionTypeKind::ArrayPop => {
                let array = self.bound_array(call.callee)?;
                self.compile(call.callee)?;
                self.arrays().pop_storage_array_element(array)?;
            }
            FunctionTypeKind::ObjectCreation => self.memory_array_creation(call, ty)?,
        }
        Ok(None)
    }

    /// Calls a function of this contract.
    ///
    /// The callee returns to the label pushed below the arguments, leaving its return values.
    fn internal_call(&mut self, function: &FunctionType, call: &CallExpr) -> Result<()> {
        let ast = self.ctx.ast();
        ensure!(function.params.len() == call.args.len(), "internal call with wrong arity");
        let return_label = self.ctx.push_new_tag();
        for (&arg, &param) in call.args.iter().zip(&function.params) {
            self.compile_and_convert(arg, &ast[param], false)?;
        }
        match self.direct_callee(call.callee, function) {
            Some(callee) => {
                let tag = self.ctx.function_entry_label(Callable::Function(callee));
                self.ctx.append(tag.to_push_tag());
            }
            None => {
                self.compile(call.callee)?;
                let dispatch =
                    self.ctx.internal_dispatch_label(function.params.len(), function.returns.len());
                self.ctx.append(dispatch.to_push_tag());
            }
        }
        self.ctx.append_jump(JumpType::IntoFunction);
        self.ctx.append(return_label);
        let params = ast.sizes_on_stack(function.params.iter().map(|&p| &ast[p]));
        let returns = ast.sizes_on_stack(function.returns.iter().map(|&r| &ast[r]));
        self.ctx.adjust_stack_offset(returns as i32 - params as i32 - 1);
        Ok(())
    }

    /// The function a callee statically names, as opposed to a function pointer value.
    fn direct_callee(&self, callee: ExprId, function: &FunctionType) -> Option<FunctionId> {
        let ast = self.ctx.ast();
        match &ast[callee].kind {
            ExprKind::Ident(Res::Function(id)) => Some(*id),
            ExprKind::Member(base, _) if matches!(ast.type_of(*base), Type::TypeType(_)) => {
                function.declaration
            }
            _ => None,
        }
    }

    /// Gas for a call without an explicit gas option.
    fn push_call_gas(&mut self, value_transfer: bool, existence_checked: bool) {
        if self.ctx.evm_version().can_overcharge_gas_for_call() {
            self.ctx.op(Instruction::GAS);
            return;
        }
        // keep enough gas for the call itself
        let mut needed = 40 + 10;
        if value_transfer {
            needed += 9000;
        }
        if !existence_checked {
            needed += 25000;
        }
        self.ctx.push(needed as u64).op(Instruction::GAS).op(Instruction::SUB);
    }

    /// Message calls: external functions, bare calls, `send` and `transfer`.
    fn external_call(&mut self, function: &FunctionType, call: &CallExpr) -> Result<()> {
        let ast = self.ctx.ast();
        let evm = self.ctx.evm_version();
        let kind = function.kind;
        let uint256 = Type::uint(256);
        let has_selector = kind == FunctionTypeKind::External;

        // <address> [<selector>] [<gas>] [<value>]
        self.compile(call.callee)?;
        let height = self.ctx.stack_height();
        let address_position = height - if has_selector { 2 } else { 1 };
        let selector_position = has_selector.then(|| height - 1);
        let mut gas_position = None;
        let mut value_position = None;
        if matches!(kind, FunctionTypeKind::Send | FunctionTypeKind::Transfer) {
            let [amount] = call.args[..] else {
                return Err(CompileError::internal("send and transfer take one argument"));
            };
            self.ctx.push(CALL_STIPEND);
            gas_position = Some(height);
            self.compile_and_convert(amount, &uint256, true)?;
            value_position = Some(height + 1);
            // gas = stipend * (value == 0)
            self.ctx
                .op(Instruction::SWAP1)
                .op(Instruction::DUP2)
                .op(Instruction::ISZERO)
                .op(Instruction::MUL)
                .op(Instruction::SWAP1);
        } else {
            if let Some(gas) = call.gas {
                self.compile_and_convert(gas, &uint256, true)?;
                gas_position = Some(self.ctx.stack_height() - 1);
            }
            if let Some(value) = call.value {
                self.compile_and_convert(value, &uint256, true)?;
                value_position = Some(self.ctx.stack_height() - 1);
            }
        }

        // arguments
        let mut given = Vec::new();
        match kind {
            FunctionTypeKind::External => {
                for &arg in &call.args {
                    self.compile(arg)?;
                    given.push(ast.type_of(arg).clone());
                }
            }
            FunctionTypeKind::Send | FunctionTypeKind::Transfer => {}
            _ => {
                if let [payload] = call.args[..] {
                    let bytes = Type::bytes(DataLocation::Memory, false);
                    self.compile_and_convert(payload, &bytes, false)?;
                    given.push(bytes);
                }
            }
        }

        // encode the call data at the free memory pointer
        self.utils().fetch_free_memory_pointer();
        if let Some(position) = selector_position {
            self.ctx.dup(self.ctx.stack_height() - position)?;
            self.utils().left_shift_number_on_stack(224);
            self.ctx.op(Instruction::DUP2).op(Instruction::MSTORE).push(4u64).op(Instruction::ADD);
        }
        if has_selector {
            let params: Vec<Type> = function.params.iter().map(|&p| ast[p].clone()).collect();
            self.utils().abi_encode(&given, &params)?;
        } else if !given.is_empty() {
            self.utils().packed_encode(&given)?;
        }
        // <address> [<selector>] [<gas>] [<value>] <input end>

        let returns: Vec<Type> = function.returns.iter().map(|&r| ast[r].clone()).collect();
        let mut return_size = 0;
        if has_selector {
            for ty in &returns {
                if !ty.is_value_type() {
                    return Err(CompileError::unimplemented("decoding dynamic return data"));
                }
                return_size += ast.calldata_encoded_size(ty);
            }
            self.ctx.dup(self.ctx.stack_height() - address_position)?;
            self.ctx.op(Instruction::EXTCODESIZE).op(Instruction::ISZERO);
            self.ctx.append_conditional_revert(false);
        }

        // output size and offset, then input size and offset
        self.ctx.push(return_size as u64);
        self.utils().fetch_free_memory_pointer();
        self.ctx.op(Instruction::DUP1).op(Instruction::DUP4).op(Instruction::SUB).op(Instruction::DUP2);

        let is_delegate = kind == FunctionTypeKind::BareDelegateCall;
        let is_static = kind == FunctionTypeKind::BareStaticCall
            || (has_selector && function.mutability <= StateMutability::View && evm.has_static_call());
        ensure!(!is_static || evm.has_static_call(), "staticcall before Byzantium");
        if !is_delegate && !is_static {
            match value_position {
                Some(position) => {
                    self.ctx.dup(self.ctx.stack_height() - position)?;
                }
                None => {
                    self.ctx.push(0u64);
                }
            }
        }
        self.ctx.dup(self.ctx.stack_height() - address_position)?;
        match gas_position {
            Some(position) => {
                self.ctx.dup(self.ctx.stack_height() - position)?;
            }
            None => self.push_call_gas(value_position.is_some(), has_selector),
        }
        self.ctx.op(if is_delegate {
            Instruction::DELEGATECALL
        } else if is_static {
            Instruction::STATICCALL
        } else {
            Instruction::CALL
        });

        // <address> [<selector>] [<gas>] [<value>] <input end> <success>
        let below = 2
            + usize::from(has_selector)
            + usize::from(gas_position.is_some())
            + usize::from(value_position.is_some());
        if matches!(kind, FunctionTypeKind::External | FunctionTypeKind::Transfer) {
            self.ctx.op(Instruction::ISZERO);
            self.ctx.append_conditional_revert(true);
            self.ctx.pop(below);
        } else {
            for _ in 0..below {
                self.ctx.op(Instruction::SWAP1).op(Instruction::POP);
            }
        }

        if has_selector && !returns.is_empty() {
            self.utils().fetch_free_memory_pointer();
            if evm.supports_returndata() {
                self.ctx.op(Instruction::RETURNDATASIZE);
            } else {
                self.ctx.push(return_size as u64);
            }
            self.utils().abi_decode(&returns, true)?;
        } else if kind.is_bare_call() && returns.len() == 2 {
            self.return_data_to_memory();
        }
        Ok(())
    }

    /// Copies the return data of the last call into a new memory byte array.
    ///
    /// Stack post: `<memory pointer>`
    fn return_data_to_memory(&mut self) {
        if !self.ctx.evm_version().supports_returndata() {
            self.ctx.push(ZERO_POINTER);
            return;
        }
        self.ctx.op(Instruction::RETURNDATASIZE);
        self.ctx.op(Instruction::DUP1).op(Instruction::ISZERO);
        let empty = self.ctx.append_conditional_jump();
        self.ctx.op(Instruction::POP);
        let mut utils = self.utils();
        utils.fetch_free_memory_pointer();
        self.ctx.op(Instruction::RETURNDATASIZE).push(0x3fu64).op(Instruction::ADD);
        self.ctx.push(0x1fu64).op(Instruction::NOT).op(Instruction::AND);
        self.ctx.op(Instruction::DUP2).op(Instruction::ADD);
        self.utils().store_free_memory_pointer();
        self.ctx.op(Instruction::RETURNDATASIZE).op(Instruction::DUP2).op(Instruction::MSTORE);
        self.ctx
            .op(Instruction::RETURNDATASIZE)
            .push(0u64)
            .op(Instruction::DUP3)
            .push(32u64)
            .op(Instruction::ADD)
            .op(Instruction::RETURNDATACOPY);
        let end = self.ctx.new_tag();
        self.ctx.append_jump_to(&end, JumpType::Ordinary);
        self.ctx.append(empty);
        self.ctx.op(Instruction::POP).push(ZERO_POINTER);
        self.ctx.append(end);
    }

    /// Calls a precompiled contract and loads its single output word.
    fn precompile_call(
        &mut self,
        function: &FunctionType,
        call: &CallExpr,
        address: u64,
    ) -> Result<()> {
        let ast = self.ctx.ast();
        let evm = self.ctx.evm_version();
        let mut given = Vec::with_capacity(call.args.len());
        for &arg in &call.args {
            self.compile(arg)?;
            given.push(ast.type_of(arg).clone());
        }
        // the output word at the free memory pointer, the input after it
        let mut utils = self.utils();
        utils.fetch_free_memory_pointer();
        self.ctx.push(0u64).op(Instruction::DUP2).op(Instruction::MSTORE);
        self.ctx.push(32u64).op(Instruction::ADD);
        if function.kind == FunctionTypeKind::ECRecover {
            let params: Vec<Type> = function.params.iter().map(|&p| ast[p].clone()).collect();
            self.utils().abi_encode(&given, &params)?;
        } else {
            self.utils().packed_encode(&given)?;
        }
        // in_end out_size out_offset in_size in_offset
        self.ctx.push(32u64);
        self.utils().fetch_free_memory_pointer();
        self.ctx.op(Instruction::DUP1).push(32u64).op(Instruction::ADD);
        self.ctx.op(Instruction::DUP1).op(Instruction::DUP5).op(Instruction::SUB).op(Instruction::SWAP1);
        if !evm.has_static_call() {
            self.ctx.push(0u64);
        }
        self.ctx.push(address);
        self.push_call_gas(false, false);
        self.ctx.op(if evm.has_static_call() { Instruction::STATICCALL } else { Instruction::CALL });
        self.ctx.op(Instruction::ISZERO);
        self.ctx.append_conditional_revert(true);
        self.ctx.op(Instruction::POP);
        self.utils().fetch_free_memory_pointer();
        self.ctx.op(Instruction::MLOAD);
        if function.kind == FunctionTypeKind::Ripemd160 {
            self.utils().left_shift_number_on_stack(96);
        }
        Ok(())
    }

    /// `new C(...)`: copies the creation code of `C` into memory, appends the encoded
    /// arguments and runs `CREATE`.
    fn contract_creation(
        &mut self,
        function: &FunctionType,
        call: &CallExpr,
        ty: &Type,
    ) -> Result<()> {
        let ast = self.ctx.ast();
        let Type::Contract(contract) = ty else {
            return Err(CompileError::internal("creation of a non-contract"));
        };
        let mut value_position = None;
        if let Some(value) = call.value {
            self.compile_and_convert(value, &Type::uint(256), true)?;
            value_position = Some(self.ctx.stack_height() - 1);
        }
        let mut given = Vec::with_capacity(call.args.len());
        for &arg in &call.args {
            self.compile(arg)?;
            given.push(ast.type_of(arg).clone());
        }
        let sub = self.ctx.creation_code_sub(*contract)?;
        self.utils().fetch_free_memory_pointer();
        self.ctx
            .append(AssemblyItem::push_sub_size(sub))
            .op(Instruction::DUP1)
            .append(AssemblyItem::push_sub(sub))
            .op(Instruction::DUP4)
            .op(Instruction::CODECOPY)
            .op(Instruction::ADD);
        let params: Vec<Type> = function.params.iter().map(|&p| ast[p].clone()).collect();
        let mut utils = self.utils();
        utils.abi_encode(&given, &params)?;
        utils.to_size_after_free_memory_pointer();
        match value_position {
            Some(position) => {
                self.ctx.dup(self.ctx.stack_height() - position)?;
            }
            None => {
                self.ctx.push(0u64);
            }
        }
        self.ctx.op(Instruction::CREATE);
        self.ctx.op(Instruction::DUP1).op(Instruction::ISZERO);
        self.ctx.append_conditional_revert(true);
        if value_position.is_some() {
            self.ctx.op(Instruction::SWAP1).op(Instruction::POP);
        }
        Ok(())
    }

    fn revert_call(&mut self, call: &CallExpr) -> Result<()> {
        match call.args[..] {
            [] => {
                self.ctx.append_revert();
            }
            [message] if self.ctx.settings().revert_strings => {
                let message_type = self.message_type(message);
                if !matches!(message_type, Type::StringLiteral(_)) {
                    self.compile_and_convert(message, &message_type, false)?;
                }
                self.utils().revert_with_string_data(&message_type)?;
            }
            [message] => {
                self.compile(message)?;
                let ty = self.ctx.ast().type_of(message);
                self.utils().pop_stack_element(ty);
                self.ctx.append_revert();
            }
            _ => return Err(CompileError::internal("revert takes at most one argument")),
        }
        Ok(())
    }

    fn require_call(&mut self, call: &CallExpr) -> Result<()> {
        let (&cond, message) = call
            .args
            .split_first()
            .ok_or_else(|| CompileError::internal("require without a condition"))?;
        self.compile_and_convert(cond, &Type::Bool, false)?;
        let Some(&message) = message.first() else {
            self.ctx.op(Instruction::ISZERO);
            self.ctx.append_conditional_revert(false);
            return Ok(());
        };
        if !self.ctx.settings().revert_strings {
            let ty = self.ctx.ast().type_of(message);
            if !matches!(ty, Type::StringLiteral(_)) {
                self.compile(message)?;
                self.utils().pop_stack_element(ty);
            }
            self.ctx.op(Instruction::ISZERO);
            self.ctx.append_conditional_revert(false);
            return Ok(());
        }

        let message_type = self.message_type(message);
        if matches!(message_type, Type::StringLiteral(_)) {
            // the literal is only materialised on the failure path
            let success = self.ctx.append_conditional_jump();
            let height = self.ctx.stack_height();
            self.utils().revert_with_string_data(&message_type)?;
            self.ctx.set_stack_offset(height as i32);
            self.ctx.append(success);
            return Ok(());
        }
        self.compile_and_convert(message, &message_type, false)?;
        self.ctx.op(Instruction::SWAP1);
        let success = self.ctx.append_conditional_jump();
        let height = self.ctx.stack_height();
        self.utils().revert_with_string_data(&message_type)?;
        self.ctx.set_stack_offset(height as i32);
        self.ctx.append(success);
        self.ctx.op(Instruction::POP);
        Ok(())
    }

    /// The type an error message is encoded from.
    fn message_type(&self, message: ExprId) -> Type {
        match self.ctx.ast().type_of(message) {
            ty @ Type::StringLiteral(_) => ty.clone(),
            _ => Type::bytes(DataLocation::Memory, true),
        }
    }

    fn keccak256_call(&mut self, call: &CallExpr) -> Result<()> {
        let ast = self.ctx.ast();
        if let [arg] = call.args[..] {
            match (&ast[arg].kind, ast.type_of(arg)) {
                (ExprKind::Lit(Lit::Str(data)), _) => {
                    self.ctx.push(U256::from_be_bytes(keccak256(data).0));
                    return Ok(());
                }
                (_, Type::Array(array))
                    if array.is_byte_array() && array.location == DataLocation::Memory =>
                {
                    self.compile(arg)?;
                    self.ctx
                        .op(Instruction::DUP1)
                        .push(32u64)
                        .op(Instruction::ADD)
                        .op(Instruction::SWAP1)
                        .op(Instruction::MLOAD)
                        .op(Instruction::SWAP1)
                        .op(Instruction::KECCAK256);
                    return Ok(());
                }
                _ => {}
            }
        }
        let mut given = Vec::with_capacity(call.args.len());
        for &arg in &call.args {
            self.compile(arg)?;
            given.push(ast.type_of(arg).clone());
        }
        let mut utils = self.utils();
        utils.fetch_free_memory_pointer();
        utils.packed_encode(&given)?;
        utils.to_size_after_free_memory_pointer();
        self.ctx.op(Instruction::KECCAK256);
        Ok(())
    }

    fn emit_event(&mut self, function: &FunctionType, call: &CallExpr) -> Result<()> {
        let ast = self.ctx.ast();
        let event_id =
            function.event.ok_or_else(|| CompileError::internal("event call without event"))?;
        let event = &ast[event_id];
        ensure!(event.params.len() == call.args.len(), "event {} with wrong arity", event.name);

        // indexed arguments become topics, the last one deepest
        let mut topics = 0u8;
        for (param, &arg) in event.params.iter().zip(&call.args).rev() {
            if !param.indexed {
                continue;
            }
            topics += 1;
            let param_type = &ast[param.ty];
            if param_type.is_value_type() {
                self.compile_and_convert(arg, param_type, true)?;
            } else {
                // reference types are hashed
                self.compile(arg)?;
                let arg_type = ast.type_of(arg);
                let packed = match arg_type {
                    Type::StringLiteral(_) => arg_type.clone(),
                    _ => arg_type.with_location(DataLocation::Memory),
                };
                let mut utils = self.utils();
                utils.convert_type(arg_type, &packed, false)?;
                utils.fetch_free_memory_pointer();
                utils.packed_encode(std::slice::from_ref(&packed))?;
                utils.to_size_after_free_memory_pointer();
                self.ctx.op(Instruction::KECCAK256);
            }
        }
        if !event.anonymous {
            self.ctx.push(ast.event_signature_hash(event_id)?);
            topics += 1;
        }
        ensure!(topics <= 4, "event {} with more than four topics", event.name);

        let mut given = Vec::new();
        let mut targets = Vec::new();
        for (param, &arg) in event.params.iter().zip(&call.args) {
            if param.indexed {
                continue;
            }
            self.compile(arg)?;
            given.push(ast.type_of(arg).clone());
            targets.push(ast[param.ty].with_location(DataLocation::Memory));
        }
        let mut utils = self.utils();
        utils.fetch_free_memory_pointer();
        utils.abi_encode(&given, &targets)?;
        utils.to_size_after_free_memory_pointer();
        self.ctx.op(Instruction::log(topics));
        Ok(())
    }

    /// The array a `push` or `pop` member is bound to.
    fn bound_array(&self, callee: ExprId) -> Result<&'a ArrayType> {
        let ast = self.ctx.ast();
        match &ast[callee].kind {
            ExprKind::Member(base, _) => match ast.type_of(*base) {
                Type::Array(array) => Ok(array),
                _ => Err(CompileError::internal("push or pop on a non-array")),
            },
            _ => Err(CompileError::internal("push or pop without a bound array")),
        }
    }

    fn array_push(&mut self, call: &CallExpr) -> Result<Option<LValue>> {
        let ast = self.ctx.ast();
        let array = self.bound_array(call.callee)?;
        if array.is_byte_array() {
            return Err(CompileError::unimplemented("push on storage byte arrays"));
        }
        let element = ast.array_base_type(array);
        self.compile(call.callee)?;
        let Some(&arg) = call.args.first() else {
            // `push()` yields a reference to the new element
            self.ctx.push(1u64).op(Instruction::DUP2);
            self.arrays().increment_dynamic_array_size(array)?;
            self.ctx.op(Instruction::SUB);
            self.arrays().access_index(array, false)?;
            return Ok(Some(LValue::storage(element)));
        };

        self.compile(arg)?;
        let arg_type = ast.type_of(arg);
        let arg_size = ast.size_on_stack(arg_type);
        // ref value -> value ref
        self.utils().move_to_stack_top(arg_size, 1)?;
        self.ctx.op(Instruction::DUP1);
        self.arrays().increment_dynamic_array_size(array)?;
        self.ctx.push(1u64).op(Instruction::SWAP1).op(Instruction::SUB);
        self.arrays().access_index(array, false)?;
        // value slot offset
        let stored = if element.is_value_type() { element.clone() } else { arg_type.clone() };
        let stored_size = ast.size_on_stack(&stored);
        let mut utils = self.utils();
        utils.move_to_stack_top(2, arg_size)?;
        utils.convert_type(arg_type, &stored, false)?;
        // slot offset value -> value slot offset
        utils.move_to_stack_top(stored_size + 1, 1)?;
        utils.move_to_stack_top(stored_size + 1, 1)?;
        LValue::storage(element).store_value(self.ctx, &stored, true)?;
        Ok(None)
    }

    /// `new T[](length)`: allocates a zeroed memory array.
    fn memory_array_creation(&mut self, call: &CallExpr, ty: &Type) -> Result<()> {
        let ast = self.ctx.ast();
        let Type::Array(array) = ty else {
            return Err(CompileError::internal("memory allocation of a non-array"));
        };
        let [length] = call.args[..] else {
            return Err(CompileError::internal("array allocation takes one argument"));
        };
        self.compile_and_convert(length, &Type::uint(256), true)?;
        let mut utils = self.utils();
        utils.fetch_free_memory_pointer();
        // pointer length
        self.ctx.op(Instruction::SWAP1);
        self.ctx.op(Instruction::DUP1).op(Instruction::DUP3).op(Instruction::MSTORE);
        self.ctx.op(Instruction::DUP1);
        if array.is_byte_array() {
            self.utils().round_up_to_words();
        } else {
            let element = ast.array_base_type(array);
            self.ctx.push(ast.memory_head_size(&element) as u64).op(Instruction::MUL);
        }
        self.ctx.push(32u64).op(Instruction::ADD).op(Instruction::DUP3).op(Instruction::ADD);
        self.utils().store_free_memory_pointer();
        // memory may be dirty, zero it unless the array is empty
        self.ctx.op(Instruction::DUP1).op(Instruction::ISZERO);
        let skip = self.ctx.append_conditional_jump();
        self.ctx.op(Instruction::DUP2).push(32u64).op(Instruction::ADD);
        self.utils().zero_initialise_memory_array(array)?;
        self.ctx.append(skip);
        self.ctx.op(Instruction::POP);
        Ok(())
    }

    // ---- state variables ----

    /// Stores the initial value of a state variable or immutable, if it has one.
    pub fn append_state_variable_initialisation(&mut self, decl: DeclId) -> Result<()> {
        let ast = self.ctx.ast();
        let var = &ast[decl];
        let Some(init) = var.initializer else { return Ok(()) };
        if var.is_constant() {
            return Ok(());
        }
        let ty = &ast[var.ty];
        let previous = self.ctx.set_location(var.location);
        let stored = if ty.is_value_type() {
            ty.clone()
        } else {
            match ast.type_of(init) {
                Type::StringLiteral(_) => ty.with_location(DataLocation::Memory),
                other => other.clone(),
            }
        };
        self.compile_and_convert(init, &stored, false)?;
        let lvalue = if var.is_immutable() {
            LValue::Immutable { decl, ty: ty.clone() }
        } else {
            LValue::state_variable(self.ctx, decl)?
        };
        lvalue.store_value(self.ctx, &stored, true)?;
        self.ctx.set_location(previous);
        Ok(())
    }

    /// The body of the getter of a public state variable.
    ///
    /// Stack pre: `<return address> <index 1> ... <index n>`; jumps back to the return address
    /// leaving the values.
    pub fn append_state_variable_accessor(&mut self, decl: DeclId) -> Result<()> {
        let ast = self.ctx.ast();
        let var = &ast[decl];
        let previous = self.ctx.set_location(var.location);
        let (params, returns) = ast.accessor_signature(decl);
        let return_size = ast.sizes_on_stack(&returns);
        if return_size > 15 {
            return Err(self.ctx.stack_too_deep());
        }

        if var.is_constant() || var.is_immutable() {
            ensure!(params.is_empty() && returns.len() == 1, "getter of a constant with parameters");
            let value = self.variable(decl)?;
            if let Some(lvalue) = value {
                lvalue.retrieve_value(self.ctx, true)?;
            }
            self.utils().convert_type(&ast[var.ty], &returns[0], false)?;
        } else {
            self.storage_accessor(decl, params.len(), &returns)?;
        }

        self.utils().move_to_stack_top(return_size, 1)?;
        self.ctx.append_jump(JumpType::OutOfFunction);
        self.ctx.set_location(previous);
        Ok(())
    }

    fn storage_accessor(&mut self, decl: DeclId, indices: usize, returns: &[Type]) -> Result<()> {
        let ast = self.ctx.ast();
        let (slot, offset) = self.ctx.storage_location_of_variable(decl)?;
        self.ctx.push(slot).push(offset);
        let mut ty = &ast[ast[decl].ty];
        for i in 0..indices {
            match ty {
                Type::Mapping { key, value } => {
                    let key_type = &ast[*key];
                    if key_type.is_dynamically_sized() {
                        return Err(CompileError::unimplemented(
                            "getters for mappings with dynamically sized keys",
                        ));
                    }
                    self.ctx.op(Instruction::POP);
                    let mut utils = self.utils();
                    utils.store_in_memory(32, &Type::uint(256))?;
                    utils.copy_to_stack_top(indices - i, 1)?;
                    utils.store_in_memory(0, key_type)?;
                    self.ctx.push(64u64).push(0u64).op(Instruction::KECCAK256).push(0u64);
                    ty = &ast[*value];
                }
                Type::Array(array) => {
                    self.ctx.op(Instruction::POP);
                    self.utils().copy_to_stack_top(indices - i + 1, 1)?;
                    self.arrays().access_index(array, true)?;
                    let ArrayKind::Elements(base) = array.kind else {
                        return Err(CompileError::internal("getter indexes into a byte array"));
                    };
                    ty = &ast[base];
                }
                _ => return Err(CompileError::internal("getter index into a non-indexable type")),
            }
        }
        // drop the indices below the reference
        match indices {
            0 => {}
            1 => {
                self.ctx.op(Instruction::SWAP2).op(Instruction::POP).op(Instruction::SWAP1);
            }
            _ => {
                self.ctx.swap(indices)?.op(Instruction::POP);
                self.ctx.swap(indices)?;
                self.utils().pop_stack_slots(indices - 1);
            }
        }

        // <slot> <offset>
        if let Type::Struct { id, .. } = ty {
            self.ctx.op(Instruction::POP);
            let mut returned = returns.iter();
            for (index, member) in ast[*id].members.iter().enumerate() {
                if !is_getter_member(&ast[member.ty]) {
                    continue;
                }
                let target = returned
                    .next()
                    .ok_or_else(|| CompileError::internal("getter return types out of sync"))?;
                let (slot, offset) = ast.storage_offsets_of_member(*id, index);
                self.ctx.op(Instruction::DUP1).push(slot).op(Instruction::ADD).push(offset);
                let member_type = ast.struct_member_type(*id, DataLocation::Storage, index);
                LValue::storage(member_type.clone()).retrieve_value(self.ctx, true)?;
                let mut utils = self.utils();
                utils.convert_type(&member_type, target, false)?;
                utils.move_to_stack_top(ast.size_on_stack(target), 1)?;
            }
            self.ctx.op(Instruction::POP);
        } else {
            let stored = ty.with_location(DataLocation::Storage);
            LValue::storage(stored.clone()).retrieve_value(self.ctx, true)?;
            let [target] = returns else {
                return Err(CompileError::internal("getter of a single value with several returns"));
            };
            self.utils().convert_type(&stored, target, false)?;
        }
        Ok(())
    }
}

fn is_literal(ty: &Type, kind: &ExprKind) -> bool {
    matches!(kind, ExprKind::Lit(_)) || matches!(ty, Type::StringLiteral(_))
}

/// The smallest value of `intN`, sign-extended to a word.
fn signed_min(bits: u16) -> U256 {
    U256::MAX << (usize::from(bits) - 1)
}

/// The largest value of `uintN`.
fn unsigned_max(bits: u16) -> U256 {
    U256::MAX >> (256 - usize::from(bits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CompilerSettings,
        ast::{
            Ast, Contract, ContractId, Function, Struct, StructMember, TypeId, Variable, Visibility,
        },
        types::StorageLayout,
    };
    use rustc_hash::FxHashMap;
    use solgen_evmasm::SourceLocation;

    struct Fixture {
        ast: Ast,
        contract: ContractId,
        uint: TypeId,
        boolean: TypeId,
    }

    impl Fixture {
        fn new() -> Self {
            let mut ast = Ast::new();
            let contract = ast.add_contract(Contract::new("C"));
            let uint = ast.intern(Type::uint(256));
            let boolean = ast.intern(Type::Bool);
            Self { ast, contract, uint, boolean }
        }

        fn number(&mut self, value: u64) -> ExprId {
            self.ast.add_expr(ExprKind::Lit(Lit::Number(U256::from(value))), self.uint)
        }

        fn callvalue(&mut self) -> ExprId {
            let msg = self.ast.intern(Type::Magic(MagicKind::Msg));
            let base = self.ast.add_expr(ExprKind::Ident(Res::Builtin(Builtin::Msg)), msg);
            self.ast.add_expr(ExprKind::Member(base, "value".into()), self.uint)
        }

        fn binary(&mut self, lhs: ExprId, op: BinOpKind, rhs: ExprId) -> ExprId {
            let ty = if op.is_comparison() || op.is_short_circuit() { self.boolean } else { self.uint };
            self.ast.add_expr(ExprKind::Binary(lhs, op, rhs), ty)
        }

        fn state_variable(&mut self, name: &str, ty: Type) -> (DeclId, ExprId) {
            let ty = self.ast.intern(ty);
            let mut var = Variable::new(name, ty);
            var.visibility = Visibility::Public;
            let decl = self.ast.add_state_variable(self.contract, var);
            let expr = self.ast.add_expr(ExprKind::Ident(Res::Variable(decl)), ty);
            (decl, expr)
        }

        fn run(
            &self,
            settings: &CompilerSettings,
            f: impl FnOnce(&mut ExpressionCompiler<'_, '_>) -> Result<()>,
        ) -> Result<(String, usize)> {
            let layout: StorageLayout = self.ast.storage_layout(self.contract);
            let code = FxHashMap::default();
            let mut ctx =
                CompilerContext::new(&self.ast, settings, self.contract, &layout, &code, true);
            f(&mut ExpressionCompiler::new(&mut ctx))?;
            Ok((ctx.assembly().to_string(), ctx.stack_height()))
        }

        fn compile(&self, expr: ExprId, settings: &CompilerSettings) -> (String, usize) {
            self.run(settings, |c| c.compile(expr)).unwrap()
        }
    }

    fn unchecked() -> CompilerSettings {
        CompilerSettings { checked_arithmetic: false, ..Default::default() }
    }

    fn listing(items: &[&str]) -> String {
        items.iter().map(|item| format!("  {item}\n")).collect()
    }

    #[test]
    fn test_literal_operand_evaluated_last_when_optimising() {
        let mut f = Fixture::new();
        let one = f.number(1);
        let value = f.callvalue();
        let sum = f.binary(one, BinOpKind::Add, value);

        let (items, height) = f.compile(sum, &unchecked());
        assert_eq!(items, listing(&["PUSH 0x1", "CALLVALUE", "ADD"]));
        assert_eq!(height, 1);

        let settings = CompilerSettings { optimise: true, ..unchecked() };
        let (items, _) = f.compile(sum, &settings);
        assert_eq!(items, listing(&["CALLVALUE", "PUSH 0x1", "ADD"]));
    }

    #[test]
    fn test_non_commutative_operands_keep_source_order() {
        let mut f = Fixture::new();
        let value = f.callvalue();
        let one = f.number(1);
        let settings = CompilerSettings { optimise: true, ..unchecked() };

        let difference = f.binary(value, BinOpKind::Sub, one);
        let (items, _) = f.compile(difference, &settings);
        assert_eq!(items, listing(&["CALLVALUE", "PUSH 0x1", "SWAP1", "SUB"]));

        let less = f.binary(value, BinOpKind::Lt, one);
        let (items, _) = f.compile(less, &settings);
        assert_eq!(items, listing(&["CALLVALUE", "PUSH 0x1", "GT"]));
    }

    #[test]
    fn test_checked_addition_panics_on_overflow() {
        let mut f = Fixture::new();
        let value = f.callvalue();
        let one = f.number(1);
        let sum = f.binary(value, BinOpKind::Add, one);
        let (items, height) = f.compile(sum, &CompilerSettings::default());
        assert_eq!(
            items,
            listing(&[
                "CALLVALUE",
                "PUSH 0x1",
                "DUP2",
                "ADD",
                "DUP1",
                "DUP3",
                "GT",
                "PUSH [tag] 1",
                "JUMPI",
                "SWAP1",
                "POP",
            ])
        );
        assert_eq!(height, 1);
    }

    #[test]
    fn test_division_checks_for_zero() {
        let mut f = Fixture::new();
        let value = f.callvalue();
        let two = f.number(2);
        let quotient = f.binary(value, BinOpKind::Div, two);
        let (items, height) = f.compile(quotient, &unchecked());
        assert!(items.ends_with(&listing(&["DUP1", "ISZERO", "PUSH [tag] 1", "JUMPI", "SWAP1", "DIV"])));
        assert_eq!(height, 1);
    }

    #[test]
    fn test_short_circuit_skips_right_operand() {
        let mut f = Fixture::new();
        let yes = f.ast.add_expr(ExprKind::Lit(Lit::Bool(true)), f.boolean);
        let value = f.callvalue();
        let zero = f.number(0);
        let cmp = f.binary(value, BinOpKind::Eq, zero);
        let and = f.binary(yes, BinOpKind::And, cmp);
        let (items, height) = f.compile(and, &unchecked());
        let expected = listing(&[
            "PUSH 0x1",
            "DUP1",
            "ISZERO",
            "PUSH [tag] 1",
            "JUMPI",
            "POP",
            "CALLVALUE",
            "PUSH 0x0",
            "EQ",
        ]) + "tag_1:\n";
        assert_eq!(items, expected);
        assert_eq!(height, 1);
    }

    #[test]
    fn test_mapping_access_hashes_key_and_slot() {
        let mut f = Fixture::new();
        let (key, value) = (f.uint, f.uint);
        let (_, mapping) = f.state_variable("balances", Type::Mapping { key, value });
        let caller = f.callvalue();
        let access = f.ast.add_expr(ExprKind::Index(mapping, Some(caller)), f.uint);
        let (items, height) = f.compile(access, &unchecked());
        assert_eq!(
            items,
            listing(&[
                "PUSH 0x0",
                "PUSH 0x0",
                "POP",
                "CALLVALUE",
                "PUSH 0x0",
                "MSTORE",
                "PUSH 0x20",
                "MSTORE",
                "PUSH 0x40",
                "PUSH 0x0",
                "KECCAK256",
                "PUSH 0x0",
                "POP",
                "SLOAD",
            ])
        );
        assert_eq!(height, 1);
    }

    #[test]
    fn test_compound_assignment_to_storage() {
        let mut f = Fixture::new();
        let (_, x) = f.state_variable("x", Type::uint(256));
        let value = f.callvalue();
        let assign = f.ast.add_expr(ExprKind::Assign(x, Some(BinOpKind::Add), value), f.uint);
        let (items, height) = f.compile(assign, &unchecked());
        assert_eq!(
            items,
            listing(&[
                "CALLVALUE",
                "PUSH 0x0",
                "PUSH 0x0",
                "DUP3",
                "DUP3",
                "DUP3",
                "POP",
                "SLOAD",
                "ADD",
                "SWAP3",
                "POP",
                "POP",
                "DUP2",
                "SWAP1",
                "SWAP1",
                "SWAP1",
                "SSTORE",
            ])
        );
        assert_eq!(height, 1);
    }

    #[test]
    fn test_postfix_increment_leaves_old_value() {
        let mut f = Fixture::new();
        let (_, x) = f.state_variable("x", Type::uint(256));
        let inc = f.ast.add_expr(ExprKind::Unary(UnOpKind::PostInc, x), f.uint);
        let (_, height) = f.compile(inc, &CompilerSettings::default());
        assert_eq!(height, 1);
        let (items, height) = f.compile(inc, &unchecked());
        assert!(items.contains(&listing(&["SWAP3", "SWAP2", "SWAP1", "PUSH 0x1", "ADD", "SWAP2", "SWAP1"])));
        assert_eq!(height, 1);
    }

    #[test]
    fn test_require_with_literal_message() {
        let mut f = Fixture::new();
        let value = f.callvalue();
        let zero = f.number(0);
        let cond = f.binary(value, BinOpKind::Eq, zero);
        let message = f.ast.intern(Type::StringLiteral(b"no value".to_vec()));
        let message = f.ast.add_expr(ExprKind::Lit(Lit::Str(b"no value".to_vec())), message);
        let require = f.ast.intern(Type::Function(FunctionType::new(FunctionTypeKind::Require)));
        let callee = f.ast.add_expr(ExprKind::Ident(Res::Builtin(Builtin::Require)), require);
        let unit = f.ast.intern(Type::unit());
        let call = f.ast.add_expr(ExprKind::Call(CallExpr::new(callee, vec![cond, message])), unit);

        let (items, height) = f.compile(call, &unchecked());
        assert!(items.contains("REVERT"));
        assert!(items.contains("PUSH 0x6e6f2076616c7565"));
        assert_eq!(height, 0);

        let settings = CompilerSettings { revert_strings: false, ..unchecked() };
        let (items, height) = f.compile(call, &settings);
        assert!(!items.contains("0x6e6f2076616c7565"));
        assert_eq!(height, 0);
    }

    #[test]
    fn test_internal_call_adjusts_stack() {
        let mut f = Fixture::new();
        let function = f.ast.add_function(f.contract, Function::new("g"));
        let uint = f.uint;
        let fn_type = FunctionType::new(FunctionTypeKind::Internal)
            .with_signature(vec![uint, uint], vec![uint])
            .with_declaration(function);
        let fn_type = f.ast.intern(Type::Function(fn_type));
        let callee = f.ast.add_expr(ExprKind::Ident(Res::Function(function)), fn_type);
        let a = f.number(1);
        let b = f.number(2);
        let call = f.ast.add_expr(ExprKind::Call(CallExpr::new(callee, vec![a, b])), uint);

        let layout = StorageLayout::default();
        let code = FxHashMap::default();
        let settings = CompilerSettings::default();
        let mut ctx = CompilerContext::new(&f.ast, &settings, f.contract, &layout, &code, true);
        ExpressionCompiler::new(&mut ctx).compile(call).unwrap();
        assert_eq!(ctx.stack_height(), 1);
        assert!(ctx.assembly().to_string().contains("JUMP [in]"));
        assert_eq!(ctx.next_function_to_compile(), Some(Callable::Function(function)));
        // a direct call does not make the function escape
        assert!(ctx.internal_dispatch().is_empty());
    }

    #[test]
    fn test_fixed_bytes_index_is_bounds_checked() {
        let mut f = Fixture::new();
        let (_, word) = f.state_variable("word", Type::FixedBytes(4));
        let index = f.number(1);
        let byte = f.ast.intern(Type::FixedBytes(1));
        let access = f.ast.add_expr(ExprKind::Index(word, Some(index)), byte);
        let (items, height) = f.compile(access, &unchecked());
        assert!(items.contains(&listing(&[
            "PUSH 0x4",
            "DUP2",
            "LT",
            "ISZERO",
            "PUSH [tag] 1",
            "JUMPI",
            "BYTE",
        ])));
        assert_eq!(height, 1);
    }

    #[test]
    fn test_getter_of_public_mapping() {
        let mut f = Fixture::new();
        let (key, value) = (f.uint, f.boolean);
        let (decl, _) = f.state_variable("allowed", Type::Mapping { key, value });
        let (items, _) = f
            .run(&unchecked(), |c| {
                c.ctx.push_new_tag();
                c.ctx.push(7u64);
                c.append_state_variable_accessor(decl)
            })
            .unwrap();
        assert!(items.contains("KECCAK256"));
        assert!(items.ends_with(&listing(&["SWAP1", "JUMP [out]"])));
    }

    /// `struct T { uint a; mapping(uint => uint) m; uint[] list; <last> z; }`
    fn struct_with_reference_members(f: &mut Fixture, last: Type) -> DeclId {
        let uint = f.uint;
        let mapping = f.ast.intern(Type::Mapping { key: uint, value: uint });
        let list = f.ast.intern(Type::array(uint, None, DataLocation::Storage));
        let last = f.ast.intern(last);
        let members = [("a", uint), ("m", mapping), ("list", list), ("z", last)]
            .into_iter()
            .map(|(name, ty)| StructMember { name: name.into(), ty })
            .collect();
        let id = f.ast.add_struct(Struct { name: "T".into(), members });
        f.state_variable("t", Type::Struct { id, location: DataLocation::Storage }).0
    }

    #[test]
    fn test_struct_getter_loads_value_members() {
        let mut f = Fixture::new();
        let decl = struct_with_reference_members(&mut f, Type::uint(256));
        let (_, returns) = f.ast.accessor_signature(decl);
        assert_eq!(returns, [Type::uint(256), Type::uint(256)]);

        let (items, _) = f
            .run(&unchecked(), |c| {
                c.ctx.push_new_tag();
                c.append_state_variable_accessor(decl)
            })
            .unwrap();
        assert!(items.contains(&listing(&["DUP1", "PUSH 0x0", "ADD", "PUSH 0x0"])), "{items}");
        assert!(items.contains(&listing(&["DUP1", "PUSH 0x3", "ADD", "PUSH 0x0"])), "{items}");
        assert!(!items.contains(&listing(&["DUP1", "PUSH 0x1", "ADD"])), "{items}");
        assert!(!items.contains(&listing(&["DUP1", "PUSH 0x2", "ADD"])), "{items}");
        assert_eq!(items.matches("SLOAD").count(), 2, "{items}");
        assert!(items.ends_with(&listing(&["JUMP [out]"])));
    }

    #[test]
    fn test_struct_getter_copies_bytes_member() {
        let mut f = Fixture::new();
        let decl = struct_with_reference_members(&mut f, Type::bytes(DataLocation::Storage, false));
        let (_, returns) = f.ast.accessor_signature(decl);
        assert_eq!(returns, [Type::uint(256), Type::bytes(DataLocation::Memory, false)]);

        let (items, _) = f
            .run(&unchecked(), |c| {
                c.ctx.push_new_tag();
                c.append_state_variable_accessor(decl)
            })
            .unwrap();
        assert!(items.contains(&listing(&["DUP1", "PUSH 0x3", "ADD", "PUSH 0x0"])), "{items}");
        // the bytes are copied into newly allocated memory
        assert!(items.contains(&listing(&["PUSH 0x40", "MLOAD"])), "{items}");
        assert!(items.ends_with(&listing(&["JUMP [out]"])));
    }

    #[test]
    fn test_unassignable_expression() {
        let mut f = Fixture::new();
        let one = f.number(1);
        let err = f.run(&unchecked(), |c| c.compile_lvalue(one).map(drop)).unwrap_err();
        assert!(matches!(err, CompileError::InternalCompilerError(_)));
    }

    #[test]
    fn test_location_is_restored() {
        let mut f = Fixture::new();
        let one = f.number(1);
        let not = ExprKind::Unary(UnOpKind::Not, one);
        let located = f.ast.add_expr_at(not, f.boolean, SourceLocation::new(0, 3, 7));
        f.run(&unchecked(), |c| {
            c.compile(located)?;
            assert_eq!(c.ctx.location(), SourceLocation::default());
            Ok(())
        })
        .unwrap();
    }
}
