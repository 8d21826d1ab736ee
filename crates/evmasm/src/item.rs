//! Assembly items: the unit of code handled by every optimiser pass.

use crate::Instruction;
use alloy_primitives::{U256, hex, ruint::UintTryFrom};
use std::{cmp::Ordering, fmt, hash::Hash, sync::Arc};

/// Source range an item was generated from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{source}:{start}..{end}")]
pub struct SourceLocation {
    /// Index of the source unit.
    pub source: u32,
    /// Start byte offset.
    pub start: u32,
    /// End byte offset.
    pub end: u32,
}

impl SourceLocation {
    /// Creates a new location.
    pub const fn new(source: u32, start: u32, end: u32) -> Self {
        Self { source, start, end }
    }

    /// Returns `true` if this is the default, empty location.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Annotation on `JUMP`s used by the inliner and for stack-height bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, derive_more::Display)]
pub enum JumpType {
    #[default]
    #[display("")]
    Ordinary,
    #[display("[in]")]
    IntoFunction,
    #[display("[out]")]
    OutOfFunction,
}

/// Opaque bytecode with a declared stack signature.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Verbatim {
    /// Number of consumed stack slots.
    pub args: usize,
    /// Number of produced stack slots.
    pub ret: usize,
    /// The raw bytecode.
    pub code: Arc<[u8]>,
}

/// The kind of an [`AssemblyItem`].
///
/// Variant order is significant: items are ordered by kind first.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ItemKind {
    Undefined,
    Operation(Instruction),
    Push,
    PushTag,
    PushSub,
    PushSubSize,
    PushProgramSize,
    Tag,
    PushData,
    PushImmutable,
    AssignImmutable,
    VerbatimBytecode(Verbatim),
}

/// A single item of an assembly.
///
/// Equality, ordering and hashing only consider the kind and the data. The source location
/// and the jump type are annotations.
#[derive(Clone)]
pub struct AssemblyItem {
    kind: ItemKind,
    data: U256,
    location: SourceLocation,
    jump_type: JumpType,
}

impl AssemblyItem {
    /// Creates an item of the given kind with the given data.
    pub fn new(kind: ItemKind, data: U256) -> Self {
        Self { kind, data, location: SourceLocation::default(), jump_type: JumpType::Ordinary }
    }

    pub fn operation(instruction: Instruction) -> Self {
        Self::new(ItemKind::Operation(instruction), U256::ZERO)
    }

    pub fn push<T>(value: T) -> Self
    where
        U256: UintTryFrom<T>,
    {
        Self::new(ItemKind::Push, U256::from(value))
    }

    pub fn push_tag(tag: usize) -> Self {
        Self::new(ItemKind::PushTag, U256::from(tag))
    }

    pub fn tag(tag: usize) -> Self {
        Self::new(ItemKind::Tag, U256::from(tag))
    }

    pub fn push_sub(sub: usize) -> Self {
        Self::new(ItemKind::PushSub, U256::from(sub))
    }

    pub fn push_sub_size(sub: usize) -> Self {
        Self::new(ItemKind::PushSubSize, U256::from(sub))
    }

    pub fn push_data(hash: U256) -> Self {
        Self::new(ItemKind::PushData, hash)
    }

    pub fn push_immutable(id: U256) -> Self {
        Self::new(ItemKind::PushImmutable, id)
    }

    pub fn assign_immutable(id: U256) -> Self {
        Self::new(ItemKind::AssignImmutable, id)
    }

    pub fn verbatim(code: impl Into<Arc<[u8]>>, args: usize, ret: usize) -> Self {
        Self::new(ItemKind::VerbatimBytecode(Verbatim { args, ret, code: code.into() }), U256::ZERO)
    }

    /// Returns `self` with the given source location.
    #[must_use]
    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.location = location;
        self
    }

    /// Returns `self` with the given jump type.
    #[must_use]
    pub fn with_jump_type(mut self, jump_type: JumpType) -> Self {
        self.jump_type = jump_type;
        self
    }

    #[inline]
    pub fn kind(&self) -> &ItemKind {
        &self.kind
    }

    #[inline]
    pub fn data(&self) -> U256 {
        self.data
    }

    #[inline]
    pub fn set_data(&mut self, data: U256) {
        self.data = data;
    }

    #[inline]
    pub fn location(&self) -> SourceLocation {
        self.location
    }

    #[inline]
    pub fn set_location(&mut self, location: SourceLocation) {
        self.location = location;
    }

    #[inline]
    pub fn jump_type(&self) -> JumpType {
        self.jump_type
    }

    #[inline]
    pub fn set_jump_type(&mut self, jump_type: JumpType) {
        self.jump_type = jump_type;
    }

    /// Returns the instruction if this is an operation.
    #[inline]
    pub fn instruction(&self) -> Option<Instruction> {
        match self.kind {
            ItemKind::Operation(instruction) => Some(instruction),
            _ => None,
        }
    }

    /// Returns `true` if this is the given operation.
    #[inline]
    pub fn is(&self, instruction: Instruction) -> bool {
        self.kind == ItemKind::Operation(instruction)
    }

    #[inline]
    pub fn is_operation(&self) -> bool {
        matches!(self.kind, ItemKind::Operation(_))
    }

    #[inline]
    pub fn is_push(&self) -> bool {
        self.kind == ItemKind::Push
    }

    #[inline]
    pub fn is_tag(&self) -> bool {
        self.kind == ItemKind::Tag
    }

    #[inline]
    pub fn is_push_tag(&self) -> bool {
        self.kind == ItemKind::PushTag
    }

    /// Returns `true` for items that only push a value without side effects.
    pub fn is_push_like(&self) -> bool {
        matches!(
            self.kind,
            ItemKind::Push
                | ItemKind::PushTag
                | ItemKind::PushSub
                | ItemKind::PushSubSize
                | ItemKind::PushProgramSize
                | ItemKind::PushData
                | ItemKind::PushImmutable
        )
    }

    /// Converts a `Tag` into the corresponding `PushTag`.
    pub fn to_push_tag(&self) -> Self {
        debug_assert!(matches!(self.kind, ItemKind::Tag | ItemKind::PushTag));
        Self::new(ItemKind::PushTag, self.data)
    }

    /// Converts a `PushTag` into the corresponding `Tag`.
    pub fn to_tag(&self) -> Self {
        debug_assert!(matches!(self.kind, ItemKind::Tag | ItemKind::PushTag));
        Self::new(ItemKind::Tag, self.data)
    }

    /// Splits the data of a (possibly foreign) `PushTag` into `(sub assembly, tag)`.
    ///
    /// Local tags return `None` as sub assembly.
    pub fn split_foreign_push_tag(&self) -> (Option<usize>, usize) {
        let combined = self.data;
        let sub = (combined >> 64usize).saturating_to::<usize>();
        let tag = (combined & U256::from(u64::MAX)).saturating_to::<usize>();
        (sub.checked_sub(1), tag)
    }

    /// Sets the sub assembly id of a push tag, making it foreign.
    pub fn set_push_tag_sub_id_and_tag(&mut self, sub: Option<usize>, tag: usize) {
        debug_assert!(self.kind == ItemKind::PushTag);
        let sub = sub.map_or(U256::ZERO, |sub| U256::from(sub + 1));
        self.data = (sub << 64) | U256::from(tag);
    }

    /// Returns the tag number of a local `Tag` or `PushTag`.
    pub fn tag_number(&self) -> usize {
        self.data.saturating_to()
    }

    /// Number of stack items consumed.
    pub fn arguments(&self) -> usize {
        match &self.kind {
            ItemKind::Operation(instruction) => instruction.info().args as usize,
            ItemKind::AssignImmutable => 2,
            ItemKind::VerbatimBytecode(verbatim) => verbatim.args,
            _ => 0,
        }
    }

    /// Number of stack items produced.
    pub fn return_values(&self) -> usize {
        match &self.kind {
            ItemKind::Operation(instruction) => instruction.info().ret as usize,
            ItemKind::Push
            | ItemKind::PushTag
            | ItemKind::PushData
            | ItemKind::PushSub
            | ItemKind::PushSubSize
            | ItemKind::PushProgramSize
            | ItemKind::PushImmutable => 1,
            ItemKind::VerbatimBytecode(verbatim) => verbatim.ret,
            ItemKind::Tag | ItemKind::AssignImmutable | ItemKind::Undefined => 0,
        }
    }

    /// Net change of the stack height.
    pub fn deposit(&self) -> i32 {
        self.return_values() as i32 - self.arguments() as i32
    }

    /// Number of bytes this item occupies in the bytecode, given the width of a code address.
    pub fn bytes_required(&self, address_length: usize) -> usize {
        match &self.kind {
            ItemKind::Operation(_) | ItemKind::Tag => 1,
            ItemKind::Push => 1 + bytes_required(self.data).max(1),
            ItemKind::PushSubSize | ItemKind::PushProgramSize => 1 + 4,
            ItemKind::PushTag | ItemKind::PushData | ItemKind::PushSub => 1 + address_length,
            ItemKind::PushImmutable => 1 + 32,
            // Estimated: two `DUP2`s, a push, `ADD` and `MSTORE` per reference.
            ItemKind::AssignImmutable => 8,
            ItemKind::VerbatimBytecode(verbatim) => verbatim.code.len(),
            ItemKind::Undefined => 0,
        }
    }
}

/// Number of bytes needed to represent `value`.
pub fn bytes_required(value: U256) -> usize {
    value.byte_len()
}

impl PartialEq for AssemblyItem {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.data == other.data
    }
}

impl Eq for AssemblyItem {}

impl PartialOrd for AssemblyItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AssemblyItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind.cmp(&other.kind).then_with(|| self.data.cmp(&other.data))
    }
}

impl Hash for AssemblyItem {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.data.hash(state);
    }
}

impl From<Instruction> for AssemblyItem {
    fn from(instruction: Instruction) -> Self {
        Self::operation(instruction)
    }
}

impl From<U256> for AssemblyItem {
    fn from(value: U256) -> Self {
        Self::push(value)
    }
}

impl fmt::Debug for AssemblyItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for AssemblyItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ItemKind::Operation(instruction) => {
                f.write_str(instruction.name())?;
                if instruction == &Instruction::JUMP && self.jump_type != JumpType::Ordinary {
                    write!(f, " {}", self.jump_type)?;
                }
                Ok(())
            }
            ItemKind::Push => write!(f, "PUSH {:#x}", self.data),
            ItemKind::PushTag => match self.split_foreign_push_tag() {
                (None, tag) => write!(f, "PUSH [tag] {tag}"),
                (Some(sub), tag) => write!(f, "PUSH [tag] {sub}:{tag}"),
            },
            ItemKind::Tag => write!(f, "tag {}", self.data),
            ItemKind::PushSub => write!(f, "PUSH [$] {:#x}", self.data),
            ItemKind::PushSubSize => write!(f, "PUSH #[$] {:#x}", self.data),
            ItemKind::PushProgramSize => f.write_str("PUSHSIZE"),
            ItemKind::PushData => write!(f, "PUSH data {:#x}", self.data),
            ItemKind::PushImmutable => write!(f, "PUSHIMMUTABLE {:#x}", self.data),
            ItemKind::AssignImmutable => write!(f, "ASSIGNIMMUTABLE {:#x}", self.data),
            ItemKind::VerbatimBytecode(verbatim) => {
                write!(f, "VERBATIM {}", hex::encode_prefixed(&verbatim.code))
            }
            ItemKind::Undefined => f.write_str("UNDEFINED"),
        }
    }
}

/// Renders a list of items, one per line.
pub fn format_items(items: &[AssemblyItem]) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    for item in items {
        let _ = writeln!(out, "{item}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_annotations() {
        let a = AssemblyItem::operation(Instruction::JUMP).with_jump_type(JumpType::IntoFunction);
        let b = AssemblyItem::operation(Instruction::JUMP)
            .with_location(SourceLocation::new(0, 1, 2));
        assert_eq!(a, b);
        assert_ne!(AssemblyItem::push(1u64), AssemblyItem::push_tag(1));
    }

    #[test]
    fn test_ordering_by_kind_then_data() {
        let mut items = vec![
            AssemblyItem::tag(1),
            AssemblyItem::push(5u64),
            AssemblyItem::operation(Instruction::ADD),
            AssemblyItem::push(2u64),
        ];
        items.sort();
        assert_eq!(
            items,
            vec![
                AssemblyItem::operation(Instruction::ADD),
                AssemblyItem::push(2u64),
                AssemblyItem::push(5u64),
                AssemblyItem::tag(1),
            ]
        );
    }

    #[test]
    fn test_foreign_push_tags() {
        let mut item = AssemblyItem::push_tag(7);
        assert_eq!(item.split_foreign_push_tag(), (None, 7));
        item.set_push_tag_sub_id_and_tag(Some(0), 7);
        assert_eq!(item.split_foreign_push_tag(), (Some(0), 7));
        assert_eq!(item.to_string(), "PUSH [tag] 0:7");
    }

    #[test]
    fn test_stack_effects() {
        assert_eq!(AssemblyItem::operation(Instruction::ADD).deposit(), -1);
        assert_eq!(AssemblyItem::push(1u64).deposit(), 1);
        assert_eq!(AssemblyItem::tag(1).deposit(), 0);
        assert_eq!(AssemblyItem::assign_immutable(U256::from(1)).deposit(), -2);
        assert_eq!(AssemblyItem::verbatim(vec![0x01, 0x02], 3, 2).deposit(), -1);
    }

    #[test]
    fn test_bytes_required() {
        assert_eq!(AssemblyItem::push(0u64).bytes_required(2), 2);
        assert_eq!(AssemblyItem::push(0x1234u64).bytes_required(2), 3);
        assert_eq!(AssemblyItem::push_tag(1).bytes_required(3), 4);
        assert_eq!(AssemblyItem::operation(Instruction::ADD).bytes_required(3), 1);
    }

    #[test]
    fn test_display() {
        let items = [
            AssemblyItem::push(0x2au64),
            AssemblyItem::push_tag(3),
            AssemblyItem::operation(Instruction::JUMP).with_jump_type(JumpType::IntoFunction),
            AssemblyItem::tag(3),
        ];
        assert_eq!(format_items(&items), "PUSH 0x2a\nPUSH [tag] 3\nJUMP [in]\ntag 3\n");
    }
}
