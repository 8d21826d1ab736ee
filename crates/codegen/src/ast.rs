//! The typed syntax tree consumed by the code generator.
//!
//! All nodes live in arenas owned by [`Ast`] and refer to each other through index handles.
//! The tree is produced by an external front end after name resolution and type checking: every
//! expression carries its type, and every identifier its resolved declaration.

use crate::types::Type;
use alloy_primitives::U256;
use index_vec::IndexVec;
use rustc_hash::FxHashMap;
use solgen_evmasm::SourceLocation;
use std::ops::{Index, IndexMut};

index_vec::define_index_type! {
    /// A contract definition.
    pub struct ContractId = u32;
}

index_vec::define_index_type! {
    /// A function definition.
    pub struct FunctionId = u32;
}

index_vec::define_index_type! {
    /// A struct definition.
    pub struct StructId = u32;
}

index_vec::define_index_type! {
    /// An enum definition.
    pub struct EnumId = u32;
}

index_vec::define_index_type! {
    /// An event definition.
    pub struct EventId = u32;
}

index_vec::define_index_type! {
    /// A variable declaration: state variable, local variable, parameter or return variable.
    pub struct DeclId = u32;
}

index_vec::define_index_type! {
    /// An expression.
    pub struct ExprId = u32;
}

index_vec::define_index_type! {
    /// A statement.
    pub struct StmtId = u32;
}

index_vec::define_index_type! {
    /// An interned type.
    pub struct TypeId = u32;
}

/// The arenas of a compilation unit.
#[derive(Clone, Debug, Default)]
pub struct Ast {
    contracts: IndexVec<ContractId, Contract>,
    functions: IndexVec<FunctionId, Function>,
    structs: IndexVec<StructId, Struct>,
    enums: IndexVec<EnumId, Enum>,
    events: IndexVec<EventId, Event>,
    variables: IndexVec<DeclId, Variable>,
    exprs: IndexVec<ExprId, Expr>,
    stmts: IndexVec<StmtId, Stmt>,
    types: IndexVec<TypeId, Type>,
    type_ids: FxHashMap<Type, TypeId>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle of `ty`, interning it if it was not seen before.
    pub fn intern(&mut self, ty: Type) -> TypeId {
        if let Some(&id) = self.type_ids.get(&ty) {
            return id;
        }
        let id = self.types.push(ty.clone());
        self.type_ids.insert(ty, id);
        id
    }

    pub fn add_contract(&mut self, contract: Contract) -> ContractId {
        self.contracts.push(contract)
    }

    /// Adds a function and registers it with its contract.
    pub fn add_function(&mut self, contract: ContractId, function: Function) -> FunctionId {
        let id = self.functions.push(function);
        self.contracts[contract].functions.push(id);
        id
    }

    pub fn add_struct(&mut self, definition: Struct) -> StructId {
        self.structs.push(definition)
    }

    pub fn add_enum(&mut self, definition: Enum) -> EnumId {
        self.enums.push(definition)
    }

    pub fn add_event(&mut self, event: Event) -> EventId {
        self.events.push(event)
    }

    pub fn add_variable(&mut self, variable: Variable) -> DeclId {
        self.variables.push(variable)
    }

    /// Adds a state variable and registers it with its contract.
    pub fn add_state_variable(&mut self, contract: ContractId, variable: Variable) -> DeclId {
        let id = self.variables.push(Variable { is_state: true, ..variable });
        self.contracts[contract].state_variables.push(id);
        id
    }

    pub fn add_expr(&mut self, kind: ExprKind, ty: TypeId) -> ExprId {
        self.exprs.push(Expr { kind, ty, location: SourceLocation::default() })
    }

    pub fn add_expr_at(&mut self, kind: ExprKind, ty: TypeId, location: SourceLocation) -> ExprId {
        self.exprs.push(Expr { kind, ty, location })
    }

    pub fn add_stmt(&mut self, kind: StmtKind) -> StmtId {
        self.stmts.push(Stmt { kind, location: SourceLocation::default() })
    }

    pub fn add_stmt_at(&mut self, kind: StmtKind, location: SourceLocation) -> StmtId {
        self.stmts.push(Stmt { kind, location })
    }

    /// The type of an expression.
    #[inline]
    pub fn type_of(&self, expr: ExprId) -> &Type {
        &self.types[self.exprs[expr].ty]
    }

    /// Returns the contracts of the unit.
    pub fn contracts(&self) -> impl ExactSizeIterator<Item = (ContractId, &Contract)> {
        self.contracts.iter_enumerated()
    }
}

macro_rules! arena_index {
    ($($id:ty => $node:ty, $field:ident;)*) => {$(
        impl Index<$id> for Ast {
            type Output = $node;

            #[inline]
            fn index(&self, id: $id) -> &$node {
                &self.$field[id]
            }
        }

        impl IndexMut<$id> for Ast {
            #[inline]
            fn index_mut(&mut self, id: $id) -> &mut $node {
                &mut self.$field[id]
            }
        }
    )*};
}

arena_index! {
    ContractId => Contract, contracts;
    FunctionId => Function, functions;
    StructId => Struct, structs;
    EnumId => Enum, enums;
    EventId => Event, events;
    DeclId => Variable, variables;
    ExprId => Expr, exprs;
    StmtId => Stmt, stmts;
}

impl Index<TypeId> for Ast {
    type Output = Type;

    #[inline]
    fn index(&self, id: TypeId) -> &Type {
        &self.types[id]
    }
}

/// A contract after inheritance has been flattened.
#[derive(Clone, Debug, Default)]
pub struct Contract {
    pub name: String,
    /// State variables, constants and immutables in declaration order.
    pub state_variables: Vec<DeclId>,
    /// All functions including the constructor, `fallback` and `receive`.
    pub functions: Vec<FunctionId>,
}

impl Contract {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }
}

/// The kind of a function definition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    Constructor,
    #[default]
    Function,
    Fallback,
    Receive,
}

/// Visibility of a function or state variable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Visibility {
    Private,
    #[default]
    Internal,
    Public,
    External,
}

impl Visibility {
    /// Whether the declaration is reachable through the selector dispatcher.
    #[inline]
    pub fn is_external(self) -> bool {
        self >= Self::Public
    }
}

/// State mutability of a function.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StateMutability {
    Pure,
    View,
    #[default]
    NonPayable,
    Payable,
}

/// A function definition.
#[derive(Clone, Debug, Default)]
pub struct Function {
    pub name: String,
    pub kind: FunctionKind,
    pub visibility: Visibility,
    pub mutability: StateMutability,
    pub params: Vec<DeclId>,
    pub returns: Vec<DeclId>,
    /// Modifier invocations.
    pub modifiers: Vec<ExprId>,
    /// The body block. `None` for unimplemented functions.
    pub body: Option<StmtId>,
    pub location: SourceLocation,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    /// Whether this is the constructor.
    #[inline]
    pub fn is_constructor(&self) -> bool {
        self.kind == FunctionKind::Constructor
    }

    #[inline]
    pub fn is_payable(&self) -> bool {
        self.mutability == StateMutability::Payable
    }

    /// Whether this function gets an entry in the selector dispatcher.
    #[inline]
    pub fn is_dispatched(&self) -> bool {
        self.kind == FunctionKind::Function && self.visibility.is_external()
    }
}

/// Whether a variable can be assigned after construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum VarMutability {
    #[default]
    Mutable,
    /// Evaluated from its initial value at every use.
    Constant,
    /// Assigned during construction and embedded into the runtime code.
    Immutable,
}

/// A variable declaration.
#[derive(Clone, Debug)]
pub struct Variable {
    pub name: String,
    pub ty: TypeId,
    pub mutability: VarMutability,
    pub visibility: Visibility,
    /// Whether this is a state variable.
    pub is_state: bool,
    /// Initial value of state variables and constants.
    pub initializer: Option<ExprId>,
    pub location: SourceLocation,
}

impl Variable {
    /// A local variable or parameter.
    pub fn new(name: impl Into<String>, ty: TypeId) -> Self {
        Self {
            name: name.into(),
            ty,
            mutability: VarMutability::Mutable,
            visibility: Visibility::Internal,
            is_state: false,
            initializer: None,
            location: SourceLocation::default(),
        }
    }

    #[inline]
    pub fn is_constant(&self) -> bool {
        self.mutability == VarMutability::Constant
    }

    #[inline]
    pub fn is_immutable(&self) -> bool {
        self.mutability == VarMutability::Immutable
    }

    /// Whether the variable occupies storage.
    #[inline]
    pub fn is_stored(&self) -> bool {
        self.is_state && self.mutability == VarMutability::Mutable
    }
}

/// A struct definition.
#[derive(Clone, Debug)]
pub struct Struct {
    pub name: String,
    pub members: Vec<StructMember>,
}

/// A member of a struct.
#[derive(Clone, Debug)]
pub struct StructMember {
    pub name: String,
    pub ty: TypeId,
}

/// An enum definition.
#[derive(Clone, Debug)]
pub struct Enum {
    pub name: String,
    pub variants: Vec<String>,
}

/// An event definition.
#[derive(Clone, Debug)]
pub struct Event {
    pub name: String,
    pub params: Vec<EventParam>,
    pub anonymous: bool,
}

/// A parameter of an event.
#[derive(Clone, Debug)]
pub struct EventParam {
    pub name: String,
    pub ty: TypeId,
    pub indexed: bool,
}

/// An expression.
#[derive(Clone, Debug)]
pub struct Expr {
    pub kind: ExprKind,
    /// The type assigned by the type checker.
    pub ty: TypeId,
    pub location: SourceLocation,
}

/// The kind of an expression.
#[derive(Clone, Debug)]
pub enum ExprKind {
    /// A literal. Negative numbers are given in two's complement.
    Lit(Lit),
    /// A resolved identifier.
    Ident(Res),
    /// A type name used as an expression, as in `uint8(x)`.
    Type(TypeId),
    /// `a = b` or the compound `a op= b`.
    Assign(ExprId, Option<BinOpKind>, ExprId),
    /// A parenthesized list `(a, , b)`. Components may be empty on the left of an assignment.
    Tuple(Vec<Option<ExprId>>),
    /// A unary operation.
    Unary(UnOpKind, ExprId),
    /// A binary operation.
    Binary(ExprId, BinOpKind, ExprId),
    /// `cond ? a : b`.
    Ternary(ExprId, ExprId, ExprId),
    /// `delete x`.
    Delete(ExprId),
    /// A function call, type conversion or struct constructor.
    Call(CallExpr),
    /// `a.name`.
    Member(ExprId, String),
    /// `a[index]`.
    Index(ExprId, Option<ExprId>),
    /// `new T`, the callee of a contract creation or memory array allocation.
    New(TypeId),
}

/// A literal value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lit {
    Number(U256),
    Bool(bool),
    /// A string or hex literal.
    Str(Vec<u8>),
}

/// The declaration an identifier refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Res {
    Variable(DeclId),
    Function(FunctionId),
    Contract(ContractId),
    Struct(StructId),
    Enum(EnumId),
    Event(EventId),
    Builtin(Builtin),
}

/// Globally available names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
    This,
    Now,
    Msg,
    Block,
    Tx,
    Keccak256,
    Sha256,
    Ripemd160,
    Ecrecover,
    AddMod,
    MulMod,
    Blockhash,
    Gasleft,
    Require,
    Assert,
    Revert,
    Selfdestruct,
    /// `log0` to `log4`.
    Log(u8),
}

/// A call expression.
#[derive(Clone, Debug)]
pub struct CallExpr {
    pub callee: ExprId,
    pub args: Vec<ExprId>,
    pub kind: CallKind,
    /// `{value: ...}` option.
    pub value: Option<ExprId>,
    /// `{gas: ...}` option.
    pub gas: Option<ExprId>,
}

impl CallExpr {
    pub fn new(callee: ExprId, args: Vec<ExprId>) -> Self {
        Self { callee, args, kind: CallKind::FunctionCall, value: None, gas: None }
    }
}

/// What a call expression does.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CallKind {
    #[default]
    FunctionCall,
    TypeConversion,
    StructConstructor,
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOpKind {
    /// `++x`
    PreInc,
    /// `--x`
    PreDec,
    /// `!x`
    Not,
    /// `-x`
    Neg,
    /// `~x`
    BitNot,
    /// `x++`
    PostInc,
    /// `x--`
    PostDec,
}

impl UnOpKind {
    #[inline]
    pub fn is_modifying(self) -> bool {
        matches!(self, Self::PreInc | Self::PreDec | Self::PostInc | Self::PostDec)
    }

    #[inline]
    pub fn is_prefix(self) -> bool {
        !matches!(self, Self::PostInc | Self::PostDec)
    }
}

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOpKind {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    /// `||`
    Or,
    /// `&&`
    And,
    BitOr,
    BitXor,
    BitAnd,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
}

impl BinOpKind {
    #[inline]
    pub fn is_comparison(self) -> bool {
        matches!(self, Self::Lt | Self::Le | Self::Gt | Self::Ge | Self::Eq | Self::Ne)
    }

    #[inline]
    pub fn is_shift(self) -> bool {
        matches!(self, Self::Shl | Self::Shr)
    }

    #[inline]
    pub fn is_short_circuit(self) -> bool {
        matches!(self, Self::Or | Self::And)
    }

    #[inline]
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Mul | Self::Eq | Self::Ne | Self::BitOr | Self::BitXor | Self::BitAnd
        )
    }
}

/// A statement.
#[derive(Clone, Debug)]
pub struct Stmt {
    pub kind: StmtKind,
    pub location: SourceLocation,
}

/// The kind of a statement.
#[derive(Clone, Debug)]
pub enum StmtKind {
    /// A block; its variables go out of scope at the end.
    Block(Vec<StmtId>),
    /// `T a = e;` or `(T a, , T b) = e;`.
    VarDecl(Vec<Option<DeclId>>, Option<ExprId>),
    Expr(ExprId),
    If(ExprId, StmtId, Option<StmtId>),
    While(ExprId, StmtId),
    DoWhile(StmtId, ExprId),
    For { init: Option<StmtId>, cond: Option<ExprId>, next: Option<ExprId>, body: StmtId },
    Break,
    Continue,
    Return(Option<ExprId>),
    /// `emit E(...)`; the expression is the event call.
    Emit(ExprId),
    /// `revert(...)` in statement position; the expression is the call.
    Revert(ExprId),
    /// The `_` of a modifier body.
    Placeholder,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_types_are_interned() {
        let mut ast = Ast::new();
        let a = ast.intern(Type::uint(256));
        let b = ast.intern(Type::Bool);
        assert_ne!(a, b);
        assert_eq!(ast.intern(Type::uint(256)), a);
        assert_eq!(ast[a], Type::uint(256));
    }

    #[test]
    fn test_contract_registration() {
        let mut ast = Ast::new();
        let c = ast.add_contract(Contract::new("C"));
        let uint = ast.intern(Type::uint(256));
        let x = ast.add_state_variable(c, Variable::new("x", uint));
        let f = ast.add_function(c, Function::new("f"));
        assert_eq!(ast[c].state_variables, [x]);
        assert_eq!(ast[c].functions, [f]);
        assert!(ast[x].is_stored());
        assert!(!ast[f].is_dispatched());
        ast[f].visibility = Visibility::External;
        assert!(ast[f].is_dispatched());
    }

    #[test]
    fn test_operator_classes() {
        assert!(BinOpKind::Add.is_commutative());
        assert!(!BinOpKind::Sub.is_commutative());
        assert!(BinOpKind::Shl.is_shift());
        assert!(UnOpKind::PostInc.is_modifying());
        assert!(!UnOpKind::PostInc.is_prefix());
    }
}
