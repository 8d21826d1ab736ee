//! The type model and its stack, memory and storage layout.

use crate::{
    Result,
    ast::{Ast, ContractId, DeclId, EnumId, EventId, FunctionId, StateMutability, StructId, TypeId},
    error::CompileError,
};
use alloy_primitives::{U256, keccak256};
use rustc_hash::FxHashMap;
use std::fmt::Write;

/// Where a reference type lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::Display)]
pub enum DataLocation {
    #[display("storage")]
    Storage,
    #[display("memory")]
    Memory,
    #[display("calldata")]
    Calldata,
}

/// The globally available objects with members.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MagicKind {
    Block,
    Msg,
    Tx,
}

/// The element type of an array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArrayKind {
    Elements(TypeId),
    /// `bytes`: packed single bytes.
    Bytes,
    /// `string`: laid out like `bytes`.
    String,
}

/// An array, `bytes` or `string`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArrayType {
    pub kind: ArrayKind,
    /// Static length, `None` for dynamically sized arrays.
    pub length: Option<U256>,
    pub location: DataLocation,
}

impl ArrayType {
    #[inline]
    pub fn is_byte_array(&self) -> bool {
        !matches!(self.kind, ArrayKind::Elements(_))
    }

    #[inline]
    pub fn is_dynamically_sized(&self) -> bool {
        self.length.is_none()
    }
}

/// What calling a function value does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FunctionTypeKind {
    /// Jump to a function of the current contract.
    Internal,
    /// Message call through the ABI.
    External,
    /// `address.call`
    BareCall,
    /// `address.delegatecall`
    BareDelegateCall,
    /// `address.staticcall`
    BareStaticCall,
    /// `new C(...)`
    Creation,
    Send,
    Transfer,
    Selfdestruct,
    Revert,
    Require,
    Assert,
    Keccak256,
    Sha256,
    Ripemd160,
    ECRecover,
    /// `log0` to `log4`.
    Log(u8),
    Event,
    BlockHash,
    AddMod,
    MulMod,
    GasLeft,
    ArrayPush,
    ArrayPop,
    /// `new T[](n)`
    ObjectCreation,
}

impl FunctionTypeKind {
    /// Whether the call result is the success flag instead of decoded return data.
    #[inline]
    pub fn is_bare_call(self) -> bool {
        matches!(
            self,
            Self::BareCall
                | Self::BareDelegateCall
                | Self::BareStaticCall
                | Self::Send
                | Self::Transfer
                | Self::ECRecover
                | Self::Sha256
                | Self::Ripemd160
        )
    }
}

/// The type of a function value or of a callee.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FunctionType {
    pub kind: FunctionTypeKind,
    pub params: Vec<TypeId>,
    pub returns: Vec<TypeId>,
    pub mutability: StateMutability,
    /// The function this value refers to, if statically known.
    pub declaration: Option<FunctionId>,
    /// The event of an `Event` callee.
    pub event: Option<EventId>,
}

impl FunctionType {
    pub fn new(kind: FunctionTypeKind) -> Self {
        Self {
            kind,
            params: Vec::new(),
            returns: Vec::new(),
            mutability: StateMutability::NonPayable,
            declaration: None,
            event: None,
        }
    }

    pub fn with_signature(mut self, params: Vec<TypeId>, returns: Vec<TypeId>) -> Self {
        self.params = params;
        self.returns = returns;
        self
    }

    pub fn with_declaration(mut self, declaration: FunctionId) -> Self {
        self.declaration = Some(declaration);
        self
    }

    pub fn with_mutability(mut self, mutability: StateMutability) -> Self {
        self.mutability = mutability;
        self
    }
}

/// A type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    /// `uintN` or `intN`.
    Integer { bits: u16, signed: bool },
    Bool,
    Address { payable: bool },
    /// `bytesN`
    FixedBytes(u8),
    Enum(EnumId),
    Array(ArrayType),
    Mapping { key: TypeId, value: TypeId },
    Struct { id: StructId, location: DataLocation },
    Function(FunctionType),
    Contract(ContractId),
    Magic(MagicKind),
    /// The type of a tuple expression or of a call with zero or several return values.
    Tuple(Vec<TypeId>),
    /// The type of a type name.
    TypeType(TypeId),
    /// The type of a string literal before conversion.
    StringLiteral(Vec<u8>),
}

impl Type {
    /// `uintN`
    pub const fn uint(bits: u16) -> Self {
        Self::Integer { bits, signed: false }
    }

    /// `intN`
    pub const fn int(bits: u16) -> Self {
        Self::Integer { bits, signed: true }
    }

    pub const fn address() -> Self {
        Self::Address { payable: false }
    }

    /// `bytes` or `string` at `location`.
    pub fn bytes(location: DataLocation, is_string: bool) -> Self {
        let kind = if is_string { ArrayKind::String } else { ArrayKind::Bytes };
        Self::Array(ArrayType { kind, length: None, location })
    }

    /// `base[]` or `base[length]` at `location`.
    pub fn array(base: TypeId, length: Option<U256>, location: DataLocation) -> Self {
        Self::Array(ArrayType { kind: ArrayKind::Elements(base), length, location })
    }

    /// The empty tuple, the type of expressions without a value.
    pub fn unit() -> Self {
        Self::Tuple(Vec::new())
    }

    /// Whether values of this type are held entirely on the stack.
    pub fn is_value_type(&self) -> bool {
        matches!(
            self,
            Self::Integer { .. }
                | Self::Bool
                | Self::Address { .. }
                | Self::FixedBytes(_)
                | Self::Enum(_)
                | Self::Contract(_)
        ) || matches!(self, Self::Function(f) if f.kind == FunctionTypeKind::Internal)
    }

    /// The data location of a reference type.
    pub fn location(&self) -> Option<DataLocation> {
        match self {
            Self::Array(array) => Some(array.location),
            Self::Struct { location, .. } => Some(*location),
            Self::Mapping { .. } => Some(DataLocation::Storage),
            _ => None,
        }
    }

    /// Returns `true` for dynamically sized arrays, `bytes` and `string`.
    pub fn is_dynamically_sized(&self) -> bool {
        matches!(self, Self::Array(array) if array.is_dynamically_sized())
    }

    /// Returns `true` for `bytes` and `string`.
    pub fn is_byte_array(&self) -> bool {
        matches!(self, Self::Array(array) if array.is_byte_array())
    }

    /// Whether the value is a signed integer.
    pub fn is_signed(&self) -> bool {
        matches!(self, Self::Integer { signed: true, .. })
    }

    /// The same type at another data location. Value types are returned unchanged.
    pub fn with_location(&self, location: DataLocation) -> Self {
        match self {
            Self::Array(array) => Self::Array(ArrayType { location, ..array.clone() }),
            Self::Struct { id, .. } => Self::Struct { id: *id, location },
            _ => self.clone(),
        }
    }

    /// Number of bits of a value type once cleaned, `None` for full-word values.
    pub fn value_bits(&self) -> Option<u16> {
        match self {
            Self::Integer { bits, .. } if *bits < 256 => Some(*bits),
            Self::Address { .. } | Self::Contract(_) => Some(160),
            Self::Bool | Self::Enum(_) => Some(8),
            Self::Function(f) if f.kind == FunctionTypeKind::Internal => Some(64),
            _ => None,
        }
    }
}

/// Slot and byte offset of every stored variable of a contract.
pub type StorageLayout = FxHashMap<DeclId, (U256, u8)>;

impl Ast {
    /// The element type of an array, at the array's location.
    pub fn array_base_type(&self, array: &ArrayType) -> Type {
        match array.kind {
            ArrayKind::Elements(base) => self[base].with_location(array.location),
            ArrayKind::Bytes | ArrayKind::String => Type::FixedBytes(1),
        }
    }

    /// The type of the `index`-th member of a struct, at the struct's location.
    pub fn struct_member_type(&self, id: StructId, location: DataLocation, index: usize) -> Type {
        self[self[id].members[index].ty].with_location(location)
    }

    /// Number of stack slots taken by a value of `ty`.
    pub fn size_on_stack(&self, ty: &Type) -> usize {
        match ty {
            Type::Function(f) => match f.kind {
                FunctionTypeKind::Internal => 1,
                FunctionTypeKind::External => 2,
                FunctionTypeKind::BareCall
                | FunctionTypeKind::BareDelegateCall
                | FunctionTypeKind::BareStaticCall
                | FunctionTypeKind::Send
                | FunctionTypeKind::Transfer
                | FunctionTypeKind::Selfdestruct
                | FunctionTypeKind::ArrayPush
                | FunctionTypeKind::ArrayPop => 1,
                _ => 0,
            },
            Type::Array(array) if array.location == DataLocation::Calldata => {
                if array.is_dynamically_sized() {
                    2
                } else {
                    1
                }
            }
            Type::Tuple(components) => {
                components.iter().map(|&c| self.size_on_stack(&self[c])).sum()
            }
            Type::TypeType(_) | Type::Magic(_) | Type::StringLiteral(_) => 0,
            _ => 1,
        }
    }

    /// Total number of stack slots of `types`.
    pub fn sizes_on_stack<'t>(&self, types: impl IntoIterator<Item = &'t Type>) -> usize {
        types.into_iter().map(|ty| self.size_on_stack(ty)).sum()
    }

    /// Number of bytes a value occupies in storage. Anything larger than 16 bytes takes whole
    /// slots.
    pub fn storage_bytes(&self, ty: &Type) -> usize {
        match ty {
            Type::Integer { bits, .. } => usize::from(*bits) / 8,
            Type::Bool | Type::Enum(_) => 1,
            Type::Address { .. } | Type::Contract(_) => 20,
            Type::FixedBytes(n) => usize::from(*n),
            Type::Function(f) if f.kind == FunctionTypeKind::Internal => 8,
            Type::Function(f) if f.kind == FunctionTypeKind::External => 24,
            _ => 32,
        }
    }

    /// Number of storage slots a value occupies.
    pub fn storage_size(&self, ty: &Type) -> U256 {
        match ty {
            Type::Array(array) => match array.length {
                None => U256::from(1),
                Some(length) => {
                    let base = self.array_base_type(array);
                    let bytes = self.storage_bytes(&base);
                    if bytes <= 16 {
                        let per_slot = U256::from(32 / bytes);
                        length.div_ceil(per_slot)
                    } else {
                        length.saturating_mul(self.storage_size(&base))
                    }
                }
            },
            Type::Struct { id, .. } => self.struct_storage_layout(*id).1,
            _ => U256::from(1),
        }
    }

    /// Size of the head of a value in memory: values and pointers take one word.
    #[inline]
    pub fn memory_head_size(&self, _ty: &Type) -> usize {
        32
    }

    /// Size of a value in memory, with arrays and structs stored inline.
    pub fn memory_data_size(&self, ty: &Type) -> Result<U256> {
        match ty {
            Type::Array(array) if !array.is_byte_array() => match array.length {
                Some(length) => Ok(length * U256::from(32)),
                None => Err(CompileError::internal("memory data size of a dynamic array")),
            },
            Type::Struct { id, .. } => {
                let words = self[*id]
                    .members
                    .iter()
                    .filter(|m| !matches!(self[m.ty], Type::Mapping { .. }))
                    .count();
                Ok(U256::from(words * 32))
            }
            _ => Ok(U256::from(32)),
        }
    }

    /// Size of the head of a value in the ABI encoding.
    pub fn calldata_encoded_size(&self, ty: &Type) -> usize {
        match ty {
            Type::Array(array) if !array.is_dynamically_sized() => {
                let base = self.array_base_type(array);
                let length: usize = array.length.map_or(0, |l| l.saturating_to());
                length.saturating_mul(self.calldata_encoded_size(&base))
            }
            Type::Struct { id, .. } if !self.is_dynamically_encoded(ty) => self[*id]
                .members
                .iter()
                .map(|m| self.calldata_encoded_size(&self[m.ty]))
                .sum(),
            _ => 32,
        }
    }

    /// Whether the ABI encoding of `ty` has a dynamic tail.
    pub fn is_dynamically_encoded(&self, ty: &Type) -> bool {
        match ty {
            Type::Array(array) => {
                array.is_dynamically_sized()
                    || self.is_dynamically_encoded(&self.array_base_type(array))
            }
            Type::Struct { id, .. } => {
                self[*id].members.iter().any(|m| self.is_dynamically_encoded(&self[m.ty]))
            }
            Type::StringLiteral(_) => true,
            _ => false,
        }
    }

    /// Slot and byte offsets of a sequence of types laid out in storage, plus the number of
    /// slots used. Values are packed into a slot while they fit.
    pub fn storage_offsets<'t>(
        &self,
        types: impl IntoIterator<Item = &'t Type>,
    ) -> (Vec<(U256, u8)>, U256) {
        let mut offsets = Vec::new();
        let mut slot = U256::ZERO;
        let mut byte_offset = 0usize;
        for ty in types {
            let bytes = self.storage_bytes(ty);
            let size = self.storage_size(ty);
            if byte_offset + bytes > 32 {
                slot += U256::from(1);
                byte_offset = 0;
            }
            offsets.push((slot, byte_offset as u8));
            if size == U256::from(1) && byte_offset + bytes <= 32 {
                byte_offset += bytes;
            } else {
                slot = slot.saturating_add(size);
                byte_offset = 0;
            }
        }
        if byte_offset > 0 {
            slot += U256::from(1);
        }
        (offsets, slot)
    }

    /// Member offsets and slot count of a struct.
    pub fn struct_storage_layout(&self, id: StructId) -> (Vec<(U256, u8)>, U256) {
        let members: Vec<Type> = self[id].members.iter().map(|m| self[m.ty].clone()).collect();
        self.storage_offsets(&members)
    }

    /// Slot and byte offset of a struct member relative to the struct's slot.
    pub fn storage_offsets_of_member(&self, id: StructId, member: usize) -> (U256, u8) {
        self.struct_storage_layout(id).0[member]
    }

    /// Offset of a struct member in memory. Mappings are skipped in memory.
    pub fn memory_offset_of_member(&self, id: StructId, member: usize) -> usize {
        self[id].members[..member]
            .iter()
            .filter(|m| !matches!(self[m.ty], Type::Mapping { .. }))
            .count()
            * 32
    }

    /// Index of the member called `name`.
    pub fn struct_member_index(&self, id: StructId, name: &str) -> Result<usize> {
        self[id]
            .members
            .iter()
            .position(|m| m.name == name)
            .ok_or_else(|| CompileError::internal(format!("no member {name} in struct")))
    }

    /// Storage locations of the stored state variables of `contract`.
    pub fn storage_layout(&self, contract: ContractId) -> StorageLayout {
        let vars: Vec<DeclId> = self[contract]
            .state_variables
            .iter()
            .copied()
            .filter(|&v| self[v].is_stored())
            .collect();
        let types: Vec<Type> = vars.iter().map(|&v| self[self[v].ty].clone()).collect();
        let (offsets, _) = self.storage_offsets(&types);
        vars.into_iter().zip(offsets).collect()
    }

    /// The canonical ABI name of a type.
    pub fn canonical_name(&self, ty: &Type) -> Result<String> {
        Ok(match ty {
            Type::Integer { bits, signed: false } => format!("uint{bits}"),
            Type::Integer { bits, signed: true } => format!("int{bits}"),
            Type::Bool => "bool".into(),
            Type::Address { .. } | Type::Contract(_) => "address".into(),
            Type::FixedBytes(n) => format!("bytes{n}"),
            Type::Enum(_) => "uint8".into(),
            Type::Array(array) => match array.kind {
                ArrayKind::Bytes => "bytes".into(),
                ArrayKind::String => "string".into(),
                ArrayKind::Elements(base) => {
                    let mut name = self.canonical_name(&self[base])?;
                    match array.length {
                        Some(length) => write!(name, "[{length}]").unwrap_or_default(),
                        None => name.push_str("[]"),
                    }
                    name
                }
            },
            Type::Struct { id, .. } => {
                let members = self[*id]
                    .members
                    .iter()
                    .map(|m| self.canonical_name(&self[m.ty]))
                    .collect::<Result<Vec<_>>>()?;
                format!("({})", members.join(","))
            }
            Type::Function(f) if f.kind == FunctionTypeKind::External => "function".into(),
            _ => {
                return Err(CompileError::internal(format!("type {ty:?} has no ABI name")));
            }
        })
    }

    /// `name(type1,type2,...)`
    pub fn signature<'t>(
        &self,
        name: &str,
        params: impl IntoIterator<Item = &'t Type>,
    ) -> Result<String> {
        let params =
            params.into_iter().map(|ty| self.canonical_name(ty)).collect::<Result<Vec<_>>>()?;
        Ok(format!("{name}({})", params.join(",")))
    }

    /// The external signature of a function definition.
    pub fn function_signature(&self, function: FunctionId) -> Result<String> {
        let f = &self[function];
        let params: Vec<Type> = f.params.iter().map(|&p| self[self[p].ty].clone()).collect();
        self.signature(&f.name, &params)
    }

    /// Parameter and return types of the getter of a public state variable.
    ///
    /// Every mapping level takes its key and every array level an index. Structs return their
    /// members except mappings, arrays and nested structs.
    pub fn accessor_signature(&self, decl: DeclId) -> (Vec<Type>, Vec<Type>) {
        let mut params = Vec::new();
        let mut ty = &self[self[decl].ty];
        loop {
            match ty {
                Type::Mapping { key, value } => {
                    params.push(self[*key].with_location(DataLocation::Memory));
                    ty = &self[*value];
                }
                Type::Array(ArrayType { kind: ArrayKind::Elements(base), .. }) => {
                    params.push(Type::uint(256));
                    ty = &self[*base];
                }
                _ => break,
            }
        }
        let returns = match ty {
            Type::Struct { id, .. } => self[*id]
                .members
                .iter()
                .map(|m| &self[m.ty])
                .filter(|ty| is_getter_member(ty))
                .map(|ty| ty.with_location(DataLocation::Memory))
                .collect(),
            _ => vec![ty.with_location(DataLocation::Memory)],
        };
        (params, returns)
    }

    /// The event topic: the hash of the event signature.
    pub fn event_signature_hash(&self, event: EventId) -> Result<U256> {
        let e = &self[event];
        let params: Vec<Type> = e.params.iter().map(|p| self[p.ty].clone()).collect();
        let signature = self.signature(&e.name, &params)?;
        Ok(U256::from_be_bytes(keccak256(signature.as_bytes()).0))
    }
}

/// Whether a struct member is returned by the getter of its struct.
pub(crate) fn is_getter_member(ty: &Type) -> bool {
    ty.is_value_type() || ty.is_byte_array()
}

/// The first four bytes of the hash of `signature`, as a number.
pub fn selector(signature: &str) -> u32 {
    let hash = keccak256(signature.as_bytes());
    u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Struct, StructMember};

    fn packed_struct(ast: &mut Ast) -> StructId {
        let u128 = ast.intern(Type::uint(128));
        let u256 = ast.intern(Type::uint(256));
        let addr = ast.intern(Type::address());
        let b = ast.intern(Type::Bool);
        let members = [("a", u128), ("b", u128), ("c", u256), ("d", addr), ("e", b)]
            .into_iter()
            .map(|(name, ty)| StructMember { name: name.into(), ty })
            .collect();
        ast.add_struct(Struct { name: "S".into(), members })
    }

    #[test]
    fn test_storage_packing() {
        let mut ast = Ast::new();
        let s = packed_struct(&mut ast);
        let (offsets, slots) = ast.struct_storage_layout(s);
        assert_eq!(
            offsets,
            vec![
                (U256::ZERO, 0),
                (U256::ZERO, 16),
                (U256::from(1), 0),
                (U256::from(2), 0),
                (U256::from(2), 20),
            ]
        );
        assert_eq!(slots, U256::from(3));
        assert_eq!(ast.memory_offset_of_member(s, 3), 96);
    }

    #[test]
    fn test_static_array_storage_size() {
        let mut ast = Ast::new();
        let u8_ = ast.intern(Type::uint(8));
        let u256 = ast.intern(Type::uint(256));
        let small = Type::array(u8_, Some(U256::from(33)), DataLocation::Storage);
        let big = Type::array(u256, Some(U256::from(3)), DataLocation::Storage);
        assert_eq!(ast.storage_size(&small), U256::from(2));
        assert_eq!(ast.storage_size(&big), U256::from(3));
        assert_eq!(ast.storage_bytes(&big), 32);
        assert_eq!(ast.calldata_encoded_size(&big), 96);
    }

    #[test]
    fn test_size_on_stack() {
        let ast = Ast::new();
        assert_eq!(ast.size_on_stack(&Type::uint(8)), 1);
        assert_eq!(ast.size_on_stack(&Type::bytes(DataLocation::Calldata, false)), 2);
        assert_eq!(ast.size_on_stack(&Type::Function(FunctionType::new(FunctionTypeKind::External))), 2);
        assert_eq!(ast.size_on_stack(&Type::Function(FunctionType::new(FunctionTypeKind::Require))), 0);
        assert_eq!(ast.size_on_stack(&Type::StringLiteral(b"abc".to_vec())), 0);
        assert_eq!(ast.size_on_stack(&Type::unit()), 0);
    }

    #[test]
    fn test_accessor_signature() {
        let mut ast = Ast::new();
        let s = packed_struct(&mut ast);
        let c = ast.add_contract(crate::ast::Contract::new("C"));
        let addr = ast.intern(Type::address());
        let value = ast.intern(Type::Struct { id: s, location: DataLocation::Storage });
        let elements = ast.intern(Type::array(value, None, DataLocation::Storage));
        let ty = ast.intern(Type::Mapping { key: addr, value: elements });
        let decl = ast.add_state_variable(c, crate::ast::Variable::new("m", ty));
        let (params, returns) = ast.accessor_signature(decl);
        assert_eq!(params, [Type::address(), Type::uint(256)]);
        assert_eq!(returns.len(), 5);
        assert_eq!(returns[3], Type::address());
    }

    #[test]
    fn test_struct_getter_skips_mappings_and_arrays() {
        let mut ast = Ast::new();
        let u256 = ast.intern(Type::uint(256));
        let mapping = ast.intern(Type::Mapping { key: u256, value: u256 });
        let array = ast.intern(Type::array(u256, None, DataLocation::Storage));
        let bytes = ast.intern(Type::bytes(DataLocation::Storage, false));
        let flag = ast.intern(Type::Bool);
        let members = [("a", u256), ("m", mapping), ("list", array), ("data", bytes), ("f", flag)]
            .into_iter()
            .map(|(name, ty)| StructMember { name: name.into(), ty })
            .collect();
        let s = ast.add_struct(Struct { name: "T".into(), members });
        let c = ast.add_contract(crate::ast::Contract::new("C"));
        let ty = ast.intern(Type::Struct { id: s, location: DataLocation::Storage });
        let decl = ast.add_state_variable(c, crate::ast::Variable::new("t", ty));

        let (params, returns) = ast.accessor_signature(decl);
        assert!(params.is_empty());
        assert_eq!(
            returns,
            [Type::uint(256), Type::bytes(DataLocation::Memory, false), Type::Bool]
        );
        assert_eq!(ast.signature("t", &params).unwrap(), "t()");
        assert!(!is_getter_member(&ast[mapping]));
        assert!(!is_getter_member(&ast[array]));
        assert!(is_getter_member(&ast[bytes]));
    }

    #[test]
    fn test_signatures() {
        let mut ast = Ast::new();
        let s = packed_struct(&mut ast);
        let u256 = ast.intern(Type::uint(256));
        let params = [
            Type::uint(256),
            Type::array(u256, None, DataLocation::Memory),
            Type::bytes(DataLocation::Memory, true),
            Type::Struct { id: s, location: DataLocation::Memory },
        ];
        assert_eq!(
            ast.signature("f", &params).unwrap(),
            "f(uint256,uint256[],string,(uint128,uint128,uint256,address,bool))"
        );
        assert_eq!(selector("transfer(address,uint256)"), 0xa905_9cbb);
        assert!(ast.canonical_name(&Type::Magic(MagicKind::Msg)).is_err());
    }
}
