//! Equivalence classes of symbolic expressions.
//!
//! Every value the optimiser reasons about is an expression `item(arguments...)` over other
//! classes. Structurally equal deterministic expressions share a class, and the rules in
//! [`rules`](super::rules) map expressions to simpler, already known classes where possible.

use super::rules::{self, Template};
use crate::{AssemblyItem, Instruction, ItemKind, SourceLocation, semantic};
use alloy_primitives::U256;
use index_vec::IndexVec;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt::Write;

index_vec::define_index_type! {
    /// Identifier of an expression equivalence class.
    pub struct ClassId = u32;
    DISPLAY_FORMAT = "{}";
    DEBUG_FORMAT = "#{}";
}

/// Argument classes of an expression.
pub type ClassIds = SmallVec<[ClassId; 3]>;

/// The representative expression of a class.
#[derive(Clone, Debug)]
pub struct Expression {
    pub id: ClassId,
    pub item: AssemblyItem,
    pub arguments: ClassIds,
    /// Storage and memory modification sequence, only used for storage and memory operations.
    pub sequence_number: u32,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct ExpressionKey {
    item: AssemblyItem,
    arguments: ClassIds,
    sequence_number: u32,
}

/// Collection of classes of equivalent expressions.
///
/// Class ids are assigned contiguously starting from zero.
#[derive(Clone, Debug, Default)]
pub struct ExpressionClasses {
    representatives: IndexVec<ClassId, Expression>,
    expressions: FxHashMap<ExpressionKey, ClassId>,
}

impl std::fmt::Debug for ExpressionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:?}@{}", self.item, self.arguments, self.sequence_number)
    }
}

impl ExpressionClasses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the class of `item` applied to `arguments`, creating it if needed.
    ///
    /// `sequence_number` is the storage/memory access sequence at the time of the operation.
    pub fn find(
        &mut self,
        item: &AssemblyItem,
        arguments: &[ClassId],
        sequence_number: u32,
    ) -> ClassId {
        let mut arguments = ClassIds::from_slice(arguments);
        if semantic::is_commutative_operation(item) {
            arguments.sort_unstable();
        }
        let key = ExpressionKey { item: item.clone(), arguments, sequence_number };

        if semantic::is_deterministic(item)
            && let Some(&id) = self.expressions.get(&key)
        {
            return id;
        }

        let id = match self.try_to_simplify(&key.item, &key.arguments) {
            Some(id) => id,
            None => self.representatives.push(Expression {
                id: self.representatives.next_idx(),
                item: key.item.clone(),
                arguments: key.arguments.clone(),
                sequence_number,
            }),
        };
        self.expressions.insert(key, id);
        id
    }

    /// Shorthand for `find` on a plain instruction without sequence number.
    pub fn find_op(&mut self, instruction: Instruction, arguments: &[ClassId]) -> ClassId {
        self.find(&AssemblyItem::operation(instruction), arguments, 0)
    }

    /// Shorthand for the class of a constant.
    pub fn find_constant(&mut self, value: U256) -> ClassId {
        self.find(&AssemblyItem::push(value), &[], 0)
    }

    /// Forces `item(arguments)` into the class `id`.
    ///
    /// Has no effect on lookups if the expression already exists.
    pub fn force_equal(&mut self, id: ClassId, item: &AssemblyItem, arguments: &[ClassId]) {
        let mut arguments = ClassIds::from_slice(arguments);
        if semantic::is_commutative_operation(item) {
            arguments.sort_unstable();
        }
        self.expressions
            .entry(ExpressionKey { item: item.clone(), arguments, sequence_number: 0 })
            .or_insert(id);
    }

    /// Returns a new class that is different from all other classes.
    pub fn new_class(&mut self, location: SourceLocation) -> ClassId {
        let id = self.representatives.next_idx();
        let marker = (U256::from(1) << 255) + U256::from(id.index());
        let item = AssemblyItem::new(ItemKind::Undefined, marker).with_location(location);
        let key =
            ExpressionKey { item: item.clone(), arguments: ClassIds::new(), sequence_number: 0 };
        self.representatives.push(Expression {
            id,
            item,
            arguments: ClassIds::new(),
            sequence_number: 0,
        });
        self.expressions.insert(key, id);
        id
    }

    /// Returns the canonical representative of a class.
    #[inline]
    pub fn representative(&self, id: ClassId) -> &Expression {
        &self.representatives[id]
    }

    /// Returns the number of classes.
    #[inline]
    pub fn len(&self) -> usize {
        self.representatives.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.representatives.is_empty()
    }

    /// Returns the value if the class is known to be a constant.
    pub fn known_constant(&self, id: ClassId) -> Option<U256> {
        let expr = &self.representatives[id];
        expr.item.is_push().then(|| expr.item.data())
    }

    /// Returns `true` if the class is known to be zero.
    ///
    /// This is not the negation of [`known_non_zero`](Self::known_non_zero).
    pub fn known_zero(&self, id: ClassId) -> bool {
        self.known_constant(id) == Some(U256::ZERO)
    }

    /// Returns `true` if the class is known to be non-zero.
    pub fn known_non_zero(&mut self, id: ClassId) -> bool {
        let is_zero = self.find_op(Instruction::ISZERO, &[id]);
        self.known_zero(is_zero)
    }

    /// Returns `true` if the classes are known to hold different values on every input.
    pub fn known_to_be_different(&mut self, a: ClassId, b: ClassId) -> bool {
        let difference = self.find_op(Instruction::SUB, &[a, b]);
        self.known_non_zero(difference)
    }

    /// Like [`known_to_be_different`](Self::known_to_be_different), but requires the values
    /// to be at least 32 apart.
    pub fn known_to_be_different_by_32(&mut self, a: ClassId, b: ClassId) -> bool {
        let difference = self.find_op(Instruction::SUB, &[a, b]);
        // The forbidden interval is [-31, 31].
        self.known_constant(difference)
            .is_some_and(|value| value.wrapping_add(U256::from(31)) > U256::from(62))
    }

    /// Renders the full expression DAG of a class, for debugging.
    pub fn full_dag_to_string(&self, id: ClassId) -> String {
        let mut out = String::new();
        self.write_dag(&mut out, id);
        out
    }

    fn write_dag(&self, out: &mut String, id: ClassId) {
        let expr = &self.representatives[id];
        let _ = write!(out, "{}:", expr.id);
        if expr.item.kind() == &ItemKind::Undefined {
            out.push_str(" UNIQUE");
            return;
        }
        let _ = write!(out, "{}(", expr.item);
        for &argument in &expr.arguments {
            self.write_dag(out, argument);
            out.push(',');
        }
        out.push(')');
    }

    fn try_to_simplify(&mut self, item: &AssemblyItem, arguments: &[ClassId]) -> Option<ClassId> {
        let instruction = item.instruction()?;
        if !semantic::is_deterministic(item) {
            return None;
        }
        let template = rules::simplify(self, instruction, arguments).or_else(|| {
            match arguments {
                [a, b] if semantic::is_commutative_operation(item) => {
                    rules::simplify(self, instruction, &[*b, *a])
                }
                _ => None,
            }
        })?;
        Some(self.rebuild(&template, item.location()))
    }

    fn rebuild(&mut self, template: &Template, location: SourceLocation) -> ClassId {
        match template {
            Template::Class(id) => *id,
            Template::Constant(value) => {
                self.find(&AssemblyItem::push(*value).with_location(location), &[], 0)
            }
            Template::Op(instruction, arguments) => {
                let arguments: ClassIds =
                    arguments.iter().map(|argument| self.rebuild(argument, location)).collect();
                let item = AssemblyItem::operation(*instruction).with_location(location);
                self.find(&item, &arguments, 0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(classes: &mut ExpressionClasses, value: u64) -> ClassId {
        classes.find_constant(U256::from(value))
    }

    #[test]
    fn test_structural_sharing() {
        let mut classes = ExpressionClasses::new();
        let x = classes.find_op(Instruction::CALLER, &[]);
        let y = classes.find_op(Instruction::CALLVALUE, &[]);
        let a = classes.find_op(Instruction::ADD, &[x, y]);
        let b = classes.find_op(Instruction::ADD, &[y, x]);
        assert_eq!(a, b);
        let c = classes.find_op(Instruction::SUB, &[x, y]);
        let d = classes.find_op(Instruction::SUB, &[y, x]);
        assert_ne!(c, d);
    }

    #[test]
    fn test_non_deterministic_never_shared() {
        let mut classes = ExpressionClasses::new();
        let a = classes.find_op(Instruction::GAS, &[]);
        let b = classes.find_op(Instruction::GAS, &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_constant_folding() {
        let mut classes = ExpressionClasses::new();
        let seven = constant(&mut classes, 7);
        let eight = constant(&mut classes, 8);
        let sum = classes.find_op(Instruction::ADD, &[seven, eight]);
        assert_eq!(classes.known_constant(sum), Some(U256::from(15)));
    }

    #[test]
    fn test_known_values() {
        let mut classes = ExpressionClasses::new();
        let x = classes.find_op(Instruction::CALLER, &[]);
        let zero = constant(&mut classes, 0);
        let one = constant(&mut classes, 1);
        assert!(classes.known_zero(zero));
        assert!(classes.known_non_zero(one));
        assert!(!classes.known_non_zero(x));
        assert!(!classes.known_zero(x));

        let x_plus_1 = classes.find_op(Instruction::ADD, &[x, one]);
        assert!(classes.known_to_be_different(x, x_plus_1));
        assert!(!classes.known_to_be_different_by_32(x, x_plus_1));
        let offset = constant(&mut classes, 32);
        let x_plus_32 = classes.find_op(Instruction::ADD, &[x, offset]);
        assert!(classes.known_to_be_different_by_32(x, x_plus_32));
        assert!(classes.known_to_be_different_by_32(x_plus_32, x));
    }

    #[test]
    fn test_new_class_is_unique() {
        let mut classes = ExpressionClasses::new();
        let a = classes.new_class(SourceLocation::default());
        let b = classes.new_class(SourceLocation::default());
        assert_ne!(a, b);
        assert!(!classes.known_to_be_different(a, b));
        assert_eq!(classes.full_dag_to_string(a), "0: UNIQUE");
    }

    #[test]
    fn test_dag_rendering() {
        let mut classes = ExpressionClasses::new();
        let x = classes.find_op(Instruction::CALLER, &[]);
        let y = classes.find_op(Instruction::NOT, &[x]);
        assert_eq!(classes.full_dag_to_string(y), "1:NOT(0:CALLER(),)");
    }
}
