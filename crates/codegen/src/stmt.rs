//! Compilation of statements and function bodies.

use crate::{
    Result,
    ast::{DeclId, ExprId, FunctionId, StmtId, StmtKind},
    context::{Callable, CompilerContext},
    error::{CompileError, ensure},
    expr::ExpressionCompiler,
    types::Type,
    utils::CompilerUtils,
};
use smallvec::SmallVec;
use solgen_evmasm::{AssemblyItem, Instruction, JumpType};
use tracing::{instrument, trace};

/// Number of slots reachable when rearranging the stack on return: `SWAP16` plus the top.
const MAX_RETURN_LAYOUT: usize = 17;

#[derive(Debug)]
struct LoopTargets {
    continue_tag: AssemblyItem,
    break_tag: AssemblyItem,
    /// Stack height at the start of every iteration.
    height: usize,
}

/// Compiles the body of one function.
///
/// Functions are called with the return address below the arguments. The body zero-initialises
/// the return variables, runs, and jumps back with only the return values on the stack.
pub struct StatementCompiler<'c, 'a> {
    ctx: &'c mut CompilerContext<'a>,
    returns: &'a [DeclId],
    return_tag: Option<AssemblyItem>,
    /// Stack height at the return tag.
    return_height: usize,
    loops: Vec<LoopTargets>,
    /// Variables declared in every open block.
    scopes: Vec<SmallVec<[DeclId; 4]>>,
}

impl<'c, 'a> StatementCompiler<'c, 'a> {
    pub fn new(ctx: &'c mut CompilerContext<'a>) -> Self {
        Self {
            ctx,
            returns: &[],
            return_tag: None,
            return_height: 0,
            loops: Vec::new(),
            scopes: Vec::new(),
        }
    }

    fn expressions(&mut self) -> ExpressionCompiler<'_, 'a> {
        ExpressionCompiler::new(self.ctx)
    }

    fn utils(&mut self) -> CompilerUtils<'_, 'a> {
        CompilerUtils::new(self.ctx)
    }

    /// Appends the entry tag and the body of `id`.
    ///
    /// Stack pre: `<return address> <arguments>`; post: `<return values>` after jumping back.
    #[instrument(level = "debug", skip(self))]
    pub fn compile_function(mut self, id: FunctionId) -> Result<()> {
        let ast = self.ctx.ast();
        let function = &ast[id];
        if !function.modifiers.is_empty() {
            return Err(CompileError::unimplemented("modifiers"));
        }
        let Some(body) = function.body else {
            return Err(CompileError::internal(format!("function {} has no body", function.name)));
        };
        let previous = self.ctx.set_location(function.location);

        let entry = self.ctx.function_entry_label(Callable::Function(id));
        self.ctx.set_stack_offset(1);
        self.ctx.append(entry);
        for &param in &function.params {
            let size = ast.size_on_stack(&ast[ast[param].ty]);
            self.ctx.adjust_stack_offset(size as i32);
            self.ctx.add_variable(param, size);
        }
        for &ret in &function.returns {
            let ty = &ast[ast[ret].ty];
            self.utils().push_zero_value(ty)?;
            self.ctx.add_variable(ret, ast.size_on_stack(ty));
        }

        let return_tag = self.ctx.new_tag();
        self.returns = &function.returns;
        self.return_tag = Some(return_tag.clone());
        self.return_height = self.ctx.stack_height();
        self.compile_stmt(body)?;
        ensure!(
            self.ctx.stack_height() == self.return_height,
            "stack height {} at the end of {}, expected {}",
            self.ctx.stack_height(),
            function.name,
            self.return_height
        );
        self.ctx.append(return_tag);

        let param_size = ast.sizes_on_stack(function.params.iter().map(|&p| &ast[ast[p].ty]));
        let return_size = ast.sizes_on_stack(function.returns.iter().map(|&r| &ast[ast[r].ty]));
        self.append_return_shuffle(param_size, return_size)?;
        for &decl in function.params.iter().chain(&function.returns) {
            self.ctx.remove_variable(decl);
        }
        self.ctx.append_jump(JumpType::OutOfFunction);
        self.ctx.set_location(previous);
        Ok(())
    }

    /// Rearranges `<return address> <params> <returns>` into `<returns> <return address>`.
    fn append_return_shuffle(&mut self, param_size: usize, return_size: usize) -> Result<()> {
        // target position of every slot counted from the bottom, `None` for discarded slots
        let mut layout = Vec::with_capacity(1 + param_size + return_size);
        layout.push(Some(return_size));
        layout.extend(std::iter::repeat_n(None, param_size));
        layout.extend((0..return_size).map(Some));
        if layout.len() > MAX_RETURN_LAYOUT {
            return Err(self.ctx.stack_too_deep());
        }
        while let Some(&last) = layout.last() {
            let top = layout.len() - 1;
            match last {
                Some(target) if target == top => break,
                Some(target) => {
                    self.ctx.swap(top - target)?;
                    layout.swap(target, top);
                }
                None => {
                    self.ctx.op(Instruction::POP);
                    layout.pop();
                }
            }
        }
        ensure!(
            layout.iter().enumerate().all(|(i, &target)| target == Some(i)),
            "invalid stack layout on return"
        );
        Ok(())
    }

    fn compile_stmt(&mut self, id: StmtId) -> Result<()> {
        let ast = self.ctx.ast();
        let stmt = &ast[id];
        let previous = self.ctx.set_location(stmt.location);
        trace!(?id, height = self.ctx.stack_height(), "statement");
        match &stmt.kind {
            StmtKind::Block(stmts) => {
                self.scopes.push(SmallVec::new());
                for &stmt in stmts {
                    self.compile_stmt(stmt)?;
                }
                self.close_scope()?;
            }
            StmtKind::VarDecl(decls, init) => self.var_decl(decls, *init)?,
            StmtKind::Expr(expr) | StmtKind::Emit(expr) | StmtKind::Revert(expr) => {
                self.expression_statement(*expr)?;
            }
            StmtKind::If(cond, then, otherwise) => {
                self.condition(*cond)?;
                self.ctx.op(Instruction::ISZERO);
                let else_tag = self.ctx.append_conditional_jump();
                self.compile_stmt(*then)?;
                if let Some(otherwise) = otherwise {
                    let end = self.ctx.new_tag();
                    self.ctx.append_jump_to(&end, JumpType::Ordinary);
                    self.ctx.append(else_tag);
                    self.compile_stmt(*otherwise)?;
                    self.ctx.append(end);
                } else {
                    self.ctx.append(else_tag);
                }
            }
            StmtKind::While(cond, body) => {
                let start = self.ctx.new_tag();
                let end = self.ctx.new_tag();
                self.ctx.append(start.clone());
                self.condition(*cond)?;
                self.ctx.op(Instruction::ISZERO).append_conditional_jump_to(&end);
                self.loop_body(*body, start.clone(), end.clone())?;
                self.ctx.append_jump_to(&start, JumpType::Ordinary);
                self.ctx.append(end);
            }
            StmtKind::DoWhile(body, cond) => {
                let start = self.ctx.new_tag();
                let check = self.ctx.new_tag();
                let end = self.ctx.new_tag();
                self.ctx.append(start.clone());
                self.loop_body(*body, check.clone(), end.clone())?;
                self.ctx.append(check);
                self.condition(*cond)?;
                self.ctx.append_conditional_jump_to(&start);
                self.ctx.append(end);
            }
            StmtKind::For { init, cond, next, body } => {
                self.scopes.push(SmallVec::new());
                if let Some(init) = init {
                    self.compile_stmt(*init)?;
                }
                let start = self.ctx.new_tag();
                let step = self.ctx.new_tag();
                let end = self.ctx.new_tag();
                self.ctx.append(start.clone());
                if let Some(cond) = cond {
                    self.condition(*cond)?;
                    self.ctx.op(Instruction::ISZERO).append_conditional_jump_to(&end);
                }
                self.loop_body(*body, step.clone(), end.clone())?;
                self.ctx.append(step);
                if let Some(next) = next {
                    self.expression_statement(*next)?;
                }
                self.ctx.append_jump_to(&start, JumpType::Ordinary);
                self.ctx.append(end);
                self.close_scope()?;
            }
            StmtKind::Break | StmtKind::Continue => {
                let targets = self
                    .loops
                    .last()
                    .ok_or_else(|| CompileError::internal("break or continue outside of a loop"))?;
                let tag = if matches!(stmt.kind, StmtKind::Break) {
                    targets.break_tag.clone()
                } else {
                    targets.continue_tag.clone()
                };
                let height = targets.height;
                self.utils().pop_and_jump(height, &tag)?;
            }
            StmtKind::Return(value) => self.return_stmt(*value)?,
            StmtKind::Placeholder => return Err(CompileError::unimplemented("modifiers")),
        }
        self.ctx.set_location(previous);
        Ok(())
    }

    fn loop_body(
        &mut self,
        body: StmtId,
        continue_tag: AssemblyItem,
        break_tag: AssemblyItem,
    ) -> Result<()> {
        let height = self.ctx.stack_height();
        self.loops.push(LoopTargets { continue_tag, break_tag, height });
        self.compile_stmt(body)?;
        self.loops.pop();
        Ok(())
    }

    /// Stack post: `<bool>`
    fn condition(&mut self, cond: ExprId) -> Result<()> {
        self.expressions().compile_and_convert(cond, &Type::Bool, false)
    }

    fn expression_statement(&mut self, expr: ExprId) -> Result<()> {
        self.expressions().compile(expr)?;
        let ty = self.ctx.ast().type_of(expr);
        self.utils().pop_stack_element(ty);
        Ok(())
    }

    fn var_decl(&mut self, decls: &[Option<DeclId>], init: Option<ExprId>) -> Result<()> {
        let ast = self.ctx.ast();
        for &decl in decls.iter().flatten() {
            let ty = &ast[ast[decl].ty];
            let size = ast.size_on_stack(ty);
            if init.is_some() {
                // overwritten right away
                for _ in 0..size {
                    self.ctx.push(0u64);
                }
            } else {
                self.utils().push_zero_value(ty)?;
            }
            self.ctx.add_variable(decl, size);
            self.scopes
                .last_mut()
                .ok_or_else(|| CompileError::internal("variable declared outside of a block"))?
                .push(decl);
        }

        let Some(init) = init else { return Ok(()) };
        self.expressions().compile(init)?;
        let value_types: Vec<&Type> = match ast.type_of(init) {
            Type::Tuple(components) if decls.len() != 1 => {
                components.iter().map(|&c| &ast[c]).collect()
            }
            ty => vec![ty],
        };
        ensure!(
            value_types.len() == decls.len(),
            "declaration of {} values from {}",
            decls.len(),
            value_types.len()
        );
        // the last value is on top
        for (decl, ty) in decls.iter().zip(value_types).rev() {
            let mut utils = self.utils();
            match *decl {
                Some(decl) => {
                    utils.convert_type(ty, &ast[ast[decl].ty], false)?;
                    utils.move_to_stack_variable(decl)?;
                }
                None => utils.pop_stack_element(ty),
            }
        }
        Ok(())
    }

    fn return_stmt(&mut self, value: Option<ExprId>) -> Result<()> {
        let ast = self.ctx.ast();
        let tag = self
            .return_tag
            .clone()
            .ok_or_else(|| CompileError::internal("return outside of a function"))?;
        let returns = self.returns;
        if let Some(value) = value {
            let target = match returns {
                [single] => ast[ast[*single].ty].clone(),
                returns => Type::Tuple(returns.iter().map(|&r| ast[r].ty).collect()),
            };
            self.expressions().compile_and_convert(value, &target, false)?;
            for &ret in returns.iter().rev() {
                self.utils().move_to_stack_variable(ret)?;
            }
        }
        let height = self.return_height;
        self.utils().pop_and_jump(height, &tag)
    }

    /// Pops the variables of the innermost block.
    fn close_scope(&mut self) -> Result<()> {
        let scope = self.scopes.pop().ok_or_else(|| CompileError::internal("unbalanced scopes"))?;
        let ast = self.ctx.ast();
        let size = ast.sizes_on_stack(scope.iter().map(|&d| &ast[ast[d].ty]));
        self.utils().pop_stack_slots(size);
        for decl in scope {
            self.ctx.remove_variable(decl);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CompilerSettings,
        ast::{Ast, Contract, ContractId, ExprKind, Function, Lit, Res, Variable},
        types::StorageLayout,
    };
    use rustc_hash::FxHashMap;

    fn listing(items: &[&str]) -> String {
        items
            .iter()
            .map(|item| {
                if item.starts_with("tag_") { format!("{item}\n") } else { format!("  {item}\n") }
            })
            .collect()
    }

    fn compile(ast: &Ast, contract: ContractId, function: FunctionId) -> Result<String> {
        let settings = CompilerSettings::default();
        let layout = StorageLayout::default();
        let code = FxHashMap::default();
        let mut ctx = CompilerContext::new(ast, &settings, contract, &layout, &code, true);
        StatementCompiler::new(&mut ctx).compile_function(function)?;
        Ok(ctx.assembly().to_string())
    }

    #[test]
    fn test_return_moves_value_below_return_address() {
        let mut ast = Ast::new();
        let contract = ast.add_contract(Contract::new("C"));
        let uint = ast.intern(Type::uint(256));
        let a = ast.add_variable(Variable::new("a", uint));
        let r = ast.add_variable(Variable::new("r", uint));
        let read = ast.add_expr(ExprKind::Ident(Res::Variable(a)), uint);
        let ret = ast.add_stmt(StmtKind::Return(Some(read)));
        let body = ast.add_stmt(StmtKind::Block(vec![ret]));
        let function = ast.add_function(
            contract,
            Function { params: vec![a], returns: vec![r], body: Some(body), ..Function::new("f") },
        );

        let items = compile(&ast, contract, function).unwrap();
        assert_eq!(
            items,
            listing(&[
                "tag_1:",
                "PUSH 0x0",
                "DUP2",
                "SWAP1",
                "POP",
                "PUSH [tag] 2",
                "JUMP",
                "tag_2:",
                "SWAP2",
                "SWAP1",
                "POP",
                "JUMP [out]",
            ])
        );
    }

    #[test]
    fn test_break_pops_block_variables() {
        let mut ast = Ast::new();
        let contract = ast.add_contract(Contract::new("C"));
        let uint = ast.intern(Type::uint(256));
        let boolean = ast.intern(Type::Bool);
        let yes = ast.add_expr(ExprKind::Lit(Lit::Bool(true)), boolean);
        let y = ast.add_variable(Variable::new("y", uint));
        let decl = ast.add_stmt(StmtKind::VarDecl(vec![Some(y)], None));
        let exit = ast.add_stmt(StmtKind::Break);
        let inner = ast.add_stmt(StmtKind::Block(vec![decl, exit]));
        let lp = ast.add_stmt(StmtKind::While(yes, inner));
        let body = ast.add_stmt(StmtKind::Block(vec![lp]));
        let function =
            ast.add_function(contract, Function { body: Some(body), ..Function::new("g") });

        let items = compile(&ast, contract, function).unwrap();
        assert_eq!(
            items,
            listing(&[
                "tag_1:",
                "tag_3:",
                "PUSH 0x1",
                "ISZERO",
                "PUSH [tag] 4",
                "JUMPI",
                "PUSH 0x0",
                "POP",
                "PUSH [tag] 4",
                "JUMP",
                "POP",
                "PUSH [tag] 3",
                "JUMP",
                "tag_4:",
                "tag_2:",
                "JUMP [out]",
            ])
        );
    }

    #[test]
    fn test_tuple_declaration_skips_empty_components() {
        let mut ast = Ast::new();
        let contract = ast.add_contract(Contract::new("C"));
        let uint = ast.intern(Type::uint(256));
        let pair = ast.intern(Type::Tuple(vec![uint, uint]));
        let one = ast.add_expr(ExprKind::Lit(Lit::Number(alloy_primitives::U256::from(1))), uint);
        let two = ast.add_expr(ExprKind::Lit(Lit::Number(alloy_primitives::U256::from(2))), uint);
        let tuple = ast.add_expr(ExprKind::Tuple(vec![Some(one), Some(two)]), pair);
        let b = ast.add_variable(Variable::new("b", uint));
        let decl = ast.add_stmt(StmtKind::VarDecl(vec![None, Some(b)], Some(tuple)));
        let body = ast.add_stmt(StmtKind::Block(vec![decl]));
        let function =
            ast.add_function(contract, Function { body: Some(body), ..Function::new("h") });

        let items = compile(&ast, contract, function).unwrap();
        assert_eq!(
            items,
            listing(&[
                "tag_1:",
                "PUSH 0x0",
                "PUSH 0x1",
                "PUSH 0x2",
                "SWAP2",
                "POP",
                "POP",
                "POP",
                "tag_2:",
                "JUMP [out]",
            ])
        );
    }

    #[test]
    fn test_modifiers_are_unimplemented() {
        let mut ast = Ast::new();
        let contract = ast.add_contract(Contract::new("C"));
        let boolean = ast.intern(Type::Bool);
        let modifier = ast.add_expr(ExprKind::Lit(Lit::Bool(true)), boolean);
        let body = ast.add_stmt(StmtKind::Block(vec![]));
        let function = ast.add_function(
            contract,
            Function { modifiers: vec![modifier], body: Some(body), ..Function::new("m") },
        );
        let err = compile(&ast, contract, function).unwrap_err();
        assert!(matches!(err, CompileError::Unimplemented(_)), "{err}");
    }

    #[test]
    fn test_too_many_slots_on_return() {
        let mut ast = Ast::new();
        let contract = ast.add_contract(Contract::new("C"));
        let uint = ast.intern(Type::uint(256));
        let params =
            (0..17).map(|i| ast.add_variable(Variable::new(format!("p{i}"), uint))).collect();
        let body = ast.add_stmt(StmtKind::Block(vec![]));
        let function = ast.add_function(
            contract,
            Function { params, body: Some(body), ..Function::new("wide") },
        );
        let err = compile(&ast, contract, function).unwrap_err();
        assert!(matches!(err, CompileError::StackTooDeep { .. }), "{err}");
    }
}
