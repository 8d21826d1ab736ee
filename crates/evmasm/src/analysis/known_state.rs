//! Symbolic knowledge about the machine state at a point in the code.
//!
//! For each item that is fed, an equivalence class is derived from the operation and the
//! classes of its arguments. `DUPn`/`SWAPn` only move classes around the symbolic stack, and
//! storage and memory accesses update the known contents.
//!
//! The state does not own its [`ExpressionClasses`]: several states (e.g. one per basic block)
//! share one collection so that class ids are comparable between them.

use super::{ClassId, ExpressionClasses};
use crate::{AssemblyItem, Instruction, ItemKind, SourceLocation, semantic};
use alloy_primitives::{U256, keccak256};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};

/// Which part of the state a store operation writes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StoreTarget {
    Memory,
    Storage,
}

/// A write to storage or memory recorded while feeding items.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreOperation {
    pub target: StoreTarget,
    pub slot: ClassId,
    pub sequence_number: u32,
    /// The class of the store expression itself.
    pub expression: ClassId,
}

/// Inferred knowledge about stack, storage and memory.
#[derive(Clone, Debug)]
pub struct KnownState {
    /// Current stack height, can be negative.
    stack_height: i32,
    /// Stack height -> equivalence class.
    stack_elements: BTreeMap<i32, ClassId>,
    /// Incremented with each modification of storage or memory.
    sequence_number: u32,
    storage_content: BTreeMap<ClassId, ClassId>,
    /// Keys are memory addresses. Overlapping values are not recorded unless fully known.
    memory_content: BTreeMap<ClassId, ClassId>,
    /// Memory words and length of every hash computed so far.
    known_keccak_hashes: FxHashMap<(Vec<ClassId>, U256), ClassId>,
    tag_unions: BTreeMap<BTreeSet<U256>, ClassId>,
}

impl Default for KnownState {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for KnownState {
    /// Returns `true` if the knowledge of both states is known to be equal.
    fn eq(&self, other: &Self) -> bool {
        if self.storage_content != other.storage_content
            || self.memory_content != other.memory_content
        {
            return false;
        }
        let stack_diff = self.stack_height - other.stack_height;
        self.stack_elements.len() == other.stack_elements.len()
            && self
                .stack_elements
                .iter()
                .zip(&other.stack_elements)
                .all(|((&h1, &c1), (&h2, &c2))| h1 - stack_diff == h2 && c1 == c2)
    }
}

impl KnownState {
    pub fn new() -> Self {
        Self {
            stack_height: 0,
            stack_elements: BTreeMap::new(),
            sequence_number: 1,
            storage_content: BTreeMap::new(),
            memory_content: BTreeMap::new(),
            known_keccak_hashes: FxHashMap::default(),
            tag_unions: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn stack_height(&self) -> i32 {
        self.stack_height
    }

    /// The current stack layout, by absolute stack height.
    #[inline]
    pub fn stack_elements(&self) -> &BTreeMap<i32, ClassId> {
        &self.stack_elements
    }

    #[inline]
    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    #[inline]
    pub fn storage_content(&self) -> &BTreeMap<ClassId, ClassId> {
        &self.storage_content
    }

    #[inline]
    pub fn memory_content(&self) -> &BTreeMap<ClassId, ClassId> {
        &self.memory_content
    }

    pub fn reset_storage(&mut self) {
        self.storage_content.clear();
    }

    pub fn reset_memory(&mut self) {
        self.memory_content.clear();
    }

    pub fn reset_stack(&mut self) {
        self.stack_elements.clear();
        self.stack_height = 0;
    }

    pub fn reset(&mut self) {
        self.reset_storage();
        self.reset_memory();
        self.reset_stack();
    }

    /// Feeds an item into the state.
    ///
    /// Returns the store operation the item performs, if any.
    pub fn feed_item(
        &mut self,
        classes: &mut ExpressionClasses,
        item: &AssemblyItem,
    ) -> Option<StoreOperation> {
        let location = item.location();
        let instruction = match item.kind() {
            ItemKind::Tag | ItemKind::Undefined => return None,
            ItemKind::AssignImmutable => {
                // Expands to memory writes in the creation code.
                self.invalidate(true, true);
                self.pop(item.arguments() as i32);
                return None;
            }
            ItemKind::VerbatimBytecode(verbatim) => {
                self.invalidate(true, true);
                self.known_keccak_hashes.clear();
                self.pop(verbatim.args as i32);
                for _ in 0..verbatim.ret {
                    self.stack_height += 1;
                    let id = classes.new_class(location);
                    self.stack_elements.insert(self.stack_height, id);
                }
                return None;
            }
            ItemKind::Operation(instruction) => *instruction,
            _ => {
                debug_assert_eq!(item.deposit(), 1);
                self.stack_height += 1;
                let id = classes.find(item, &[], 0);
                self.stack_elements.insert(self.stack_height, id);
                return None;
            }
        };

        let mut operation = None;
        if instruction.is_dup() {
            let source = self.stack_height + 1 - i32::from(instruction.dup_number());
            let id = self.stack_element(classes, source, location);
            self.stack_elements.insert(self.stack_height + 1, id);
        } else if instruction.is_swap() {
            let other = self.stack_height - i32::from(instruction.swap_number());
            self.swap_stack_elements(classes, self.stack_height, other, location);
        } else if instruction != Instruction::POP {
            let info = instruction.info();
            let arguments: Vec<ClassId> = (0..i32::from(info.args))
                .map(|i| self.stack_element(classes, self.stack_height - i, location))
                .collect();
            let target_height = self.stack_height + item.deposit();
            match instruction {
                Instruction::SSTORE => {
                    operation = self.store_in_storage(classes, arguments[0], arguments[1], location);
                }
                Instruction::SLOAD => {
                    let id = self.load_from_storage(classes, arguments[0], location);
                    self.stack_elements.insert(target_height, id);
                }
                Instruction::MSTORE => {
                    operation = self.store_in_memory(classes, arguments[0], arguments[1], location);
                }
                Instruction::MLOAD => {
                    let id = self.load_from_memory(classes, arguments[0], location);
                    self.stack_elements.insert(target_height, id);
                }
                Instruction::KECCAK256 => {
                    let id = self.apply_keccak256(classes, arguments[0], arguments[1], location);
                    self.stack_elements.insert(target_height, id);
                }
                _ => {
                    self.invalidate(
                        semantic::invalidates_memory(instruction),
                        semantic::invalidates_storage(instruction),
                    );
                    debug_assert!(info.ret <= 1);
                    if info.ret == 1 {
                        let id = classes.find(item, &arguments, 0);
                        self.stack_elements.insert(target_height, id);
                    }
                }
            }
        }
        self.stack_height += item.deposit();
        let _ = self.stack_elements.split_off(&(self.stack_height + 1));
        operation
    }

    fn invalidate(&mut self, memory: bool, storage: bool) {
        if memory {
            self.reset_memory();
        }
        if storage {
            self.reset_storage();
        }
        if memory || storage {
            // Incremented by two because the operation can both read and write.
            self.sequence_number += 2;
        }
    }

    fn pop(&mut self, count: i32) {
        self.stack_height -= count;
        let _ = self.stack_elements.split_off(&(self.stack_height + 1));
    }

    /// Replaces the state by its intersection with `other`.
    ///
    /// Stacks of different heights are compared relative to their tops and the smaller height
    /// is kept. Differing stack slots that both hold tags become a tag union.
    pub fn reduce_to_common_knowledge(
        &mut self,
        classes: &mut ExpressionClasses,
        other: &Self,
        combine_sequence_numbers: bool,
    ) {
        let stack_diff = self.stack_height - other.stack_height;
        let elements = std::mem::take(&mut self.stack_elements);
        for (height, id) in elements {
            let Some(&other_id) = other.stack_elements.get(&(height - stack_diff)) else {
                continue;
            };
            if id == other_id {
                self.stack_elements.insert(height, id);
                continue;
            }
            let mut these_tags = self.tags_in_expression(classes, id);
            let other_tags = other.tags_in_expression(classes, other_id);
            if !these_tags.is_empty() && !other_tags.is_empty() {
                these_tags.extend(other_tags);
                let union = self.tag_union(classes, these_tags);
                self.stack_elements.insert(height, union);
            }
        }

        // Use the smaller stack height, which makes loops terminate.
        if self.stack_height > other.stack_height {
            self.stack_elements = std::mem::take(&mut self.stack_elements)
                .into_iter()
                .map(|(height, id)| (height - stack_diff, id))
                .collect();
            self.stack_height = other.stack_height;
        }

        self.storage_content.retain(|slot, value| other.storage_content.get(slot) == Some(value));
        self.memory_content.retain(|slot, value| other.memory_content.get(slot) == Some(value));
        for (union, id) in &other.tag_unions {
            self.tag_unions.entry(union.clone()).or_insert(*id);
        }
        if combine_sequence_numbers {
            self.sequence_number = self.sequence_number.max(other.sequence_number);
        }
    }

    /// Returns the class of the element at the given absolute stack height, creating an
    /// unknown class if it was not assigned yet.
    pub fn stack_element(
        &mut self,
        classes: &mut ExpressionClasses,
        height: i32,
        location: SourceLocation,
    ) -> ClassId {
        *self.stack_elements.entry(height).or_insert_with(|| {
            let marker = AssemblyItem::new(ItemKind::Undefined, height_marker(height))
                .with_location(location);
            classes.find(&marker, &[], 0)
        })
    }

    /// Returns the class of the element at the given offset from the stack top.
    pub fn relative_stack_element(
        &mut self,
        classes: &mut ExpressionClasses,
        offset: i32,
    ) -> ClassId {
        self.stack_element(classes, self.stack_height + offset, SourceLocation::default())
    }

    /// Returns the tags a class can hold: the members of a tag union, the tag of a `PushTag`
    /// or nothing.
    pub fn tags_in_expression(&self, classes: &ExpressionClasses, id: ClassId) -> BTreeSet<U256> {
        if let Some((tags, _)) = self.tag_unions.iter().find(|(_, union)| **union == id) {
            return tags.clone();
        }
        let expr = classes.representative(id);
        if expr.item.is_push_tag() { BTreeSet::from([expr.item.data()]) } else { BTreeSet::new() }
    }

    /// Removes stack elements that are tag unions, which only make sense during analysis.
    pub fn clear_tag_unions(&mut self) {
        let unions: BTreeSet<ClassId> = self.tag_unions.values().copied().collect();
        self.stack_elements.retain(|_, id| !unions.contains(id));
    }

    fn tag_union(&mut self, classes: &mut ExpressionClasses, tags: BTreeSet<U256>) -> ClassId {
        *self
            .tag_unions
            .entry(tags)
            .or_insert_with(|| classes.new_class(SourceLocation::default()))
    }

    fn swap_stack_elements(
        &mut self,
        classes: &mut ExpressionClasses,
        a: i32,
        b: i32,
        location: SourceLocation,
    ) {
        debug_assert_ne!(a, b, "swap on the same stack element");
        let class_a = self.stack_element(classes, a, location);
        let class_b = self.stack_element(classes, b, location);
        self.stack_elements.insert(a, class_b);
        self.stack_elements.insert(b, class_a);
    }

    fn store_in_storage(
        &mut self,
        classes: &mut ExpressionClasses,
        slot: ClassId,
        value: ClassId,
        location: SourceLocation,
    ) -> Option<StoreOperation> {
        if self.storage_content.get(&slot) == Some(&value) {
            // The value is already there.
            return None;
        }
        self.sequence_number += 1;
        // Keep what this store cannot overwrite: other slots, or the same value.
        let content = std::mem::take(&mut self.storage_content);
        self.storage_content = content
            .into_iter()
            .filter(|&(other, stored)| classes.known_to_be_different(other, slot) || stored == value)
            .collect();

        let item = AssemblyItem::operation(Instruction::SSTORE).with_location(location);
        let expression = classes.find(&item, &[slot, value], self.sequence_number);
        let operation = StoreOperation {
            target: StoreTarget::Storage,
            slot,
            sequence_number: self.sequence_number,
            expression,
        };
        self.storage_content.insert(slot, value);
        // Writes get unique sequence numbers.
        self.sequence_number += 1;
        Some(operation)
    }

    fn load_from_storage(
        &mut self,
        classes: &mut ExpressionClasses,
        slot: ClassId,
        location: SourceLocation,
    ) -> ClassId {
        if let Some(&value) = self.storage_content.get(&slot) {
            return value;
        }
        let item = AssemblyItem::operation(Instruction::SLOAD).with_location(location);
        let value = classes.find(&item, &[slot], self.sequence_number);
        self.storage_content.insert(slot, value);
        value
    }

    fn store_in_memory(
        &mut self,
        classes: &mut ExpressionClasses,
        slot: ClassId,
        value: ClassId,
        location: SourceLocation,
    ) -> Option<StoreOperation> {
        if self.memory_content.get(&slot) == Some(&value) {
            return None;
        }
        self.sequence_number += 1;
        // Only words at least 32 bytes away survive.
        let content = std::mem::take(&mut self.memory_content);
        self.memory_content = content
            .into_iter()
            .filter(|&(other, _)| classes.known_to_be_different_by_32(other, slot))
            .collect();

        let item = AssemblyItem::operation(Instruction::MSTORE).with_location(location);
        let expression = classes.find(&item, &[slot, value], self.sequence_number);
        let operation = StoreOperation {
            target: StoreTarget::Memory,
            slot,
            sequence_number: self.sequence_number,
            expression,
        };
        self.memory_content.insert(slot, value);
        self.sequence_number += 1;
        Some(operation)
    }

    fn load_from_memory(
        &mut self,
        classes: &mut ExpressionClasses,
        slot: ClassId,
        location: SourceLocation,
    ) -> ClassId {
        if let Some(&value) = self.memory_content.get(&slot) {
            return value;
        }
        let item = AssemblyItem::operation(Instruction::MLOAD).with_location(location);
        let value = classes.find(&item, &[slot], self.sequence_number);
        self.memory_content.insert(slot, value);
        value
    }

    /// Hashes of at most 128 bytes whose memory words are all known constants are evaluated.
    fn apply_keccak256(
        &mut self,
        classes: &mut ExpressionClasses,
        start: ClassId,
        length: ClassId,
        location: SourceLocation,
    ) -> ClassId {
        let item = AssemblyItem::operation(Instruction::KECCAK256).with_location(location);
        let len = match classes.known_constant(length) {
            Some(len) if len <= U256::from(128) => len.to::<usize>(),
            _ => return classes.find(&item, &[start, length], self.sequence_number),
        };

        let mut words = Vec::with_capacity(len.div_ceil(32));
        for offset in (0..len).step_by(32) {
            let offset = classes.find_constant(U256::from(offset));
            let add = AssemblyItem::operation(Instruction::ADD).with_location(location);
            let slot = classes.find(&add, &[start, offset], 0);
            words.push(self.load_from_memory(classes, slot, location));
        }
        let key = (words, U256::from(len));
        if let Some(&id) = self.known_keccak_hashes.get(&key) {
            return id;
        }

        let constants: Option<Vec<U256>> =
            key.0.iter().map(|&word| classes.known_constant(word)).collect();
        let id = match constants {
            Some(constants) => {
                let mut data: Vec<u8> =
                    constants.iter().flat_map(|word| word.to_be_bytes::<32>()).collect();
                data.truncate(len);
                let hash = U256::from_be_bytes(keccak256(&data).0);
                classes.find(&AssemblyItem::push(hash).with_location(location), &[], 0)
            }
            None => classes.find(&item, &[start, length], self.sequence_number),
        };
        self.known_keccak_hashes.insert(key, id);
        id
    }

    /// Renders the state for debugging.
    pub fn dump(&self, classes: &ExpressionClasses) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "=== State ===");
        let _ = writeln!(out, "Stack height: {}", self.stack_height);
        let _ = writeln!(out, "Stack:");
        for (height, &id) in &self.stack_elements {
            let _ = writeln!(out, "  {height}: {}", classes.full_dag_to_string(id));
        }
        let _ = writeln!(out, "Storage:");
        for (&slot, &value) in &self.storage_content {
            let _ = writeln!(out, "  {slot}: {value}");
        }
        let _ = writeln!(out, "Memory:");
        for (&slot, &value) in &self.memory_content {
            let _ = writeln!(out, "  {slot}: {value}");
        }
        out
    }
}

/// Data of the `Undefined` item standing for the initial value of a stack slot.
fn height_marker(height: i32) -> U256 {
    if height >= 0 {
        U256::from(height)
    } else {
        U256::ZERO.wrapping_sub(U256::from(height.unsigned_abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AssemblyItem as Item;

    fn feed(state: &mut KnownState, classes: &mut ExpressionClasses, items: &[Item]) {
        for item in items {
            state.feed_item(classes, item);
        }
    }

    fn op(instruction: Instruction) -> Item {
        Item::operation(instruction)
    }

    #[test]
    fn test_dup_and_swap_move_classes() {
        let mut classes = ExpressionClasses::new();
        let mut state = KnownState::new();
        feed(&mut state, &mut classes, &[Item::push(1u64), Item::push(2u64), op(Instruction::SWAP1)]);
        assert_eq!(state.stack_height(), 2);
        assert_eq!(classes.known_constant(state.stack_elements()[&2]), Some(U256::from(1)));
        assert_eq!(classes.known_constant(state.stack_elements()[&1]), Some(U256::from(2)));
        feed(&mut state, &mut classes, &[op(Instruction::DUP2)]);
        assert_eq!(classes.known_constant(state.stack_elements()[&3]), Some(U256::from(2)));
    }

    #[test]
    fn test_storage_knowledge() {
        let mut classes = ExpressionClasses::new();
        let mut state = KnownState::new();
        let items = [
            Item::push(5u64),
            Item::push(0u64),
            op(Instruction::SSTORE),
            Item::push(0u64),
            op(Instruction::SLOAD),
        ];
        feed(&mut state, &mut classes, &items);
        let top = state.stack_elements()[&1];
        assert_eq!(classes.known_constant(top), Some(U256::from(5)));
    }

    #[test]
    fn test_storing_known_value_is_no_operation() {
        let mut classes = ExpressionClasses::new();
        let mut state = KnownState::new();
        feed(&mut state, &mut classes, &[Item::push(0u64), op(Instruction::SLOAD)]);
        let sequence = state.sequence_number();
        feed(&mut state, &mut classes, &[Item::push(0u64)]);
        let store = state.feed_item(&mut classes, &op(Instruction::SSTORE));
        assert!(store.is_none());
        assert_eq!(state.sequence_number(), sequence);
    }

    #[test]
    fn test_unknown_slot_store_invalidates() {
        let mut classes = ExpressionClasses::new();
        let mut state = KnownState::new();
        let items = [
            Item::push(5u64),
            Item::push(0u64),
            op(Instruction::SSTORE),
            Item::push(6u64),
            op(Instruction::CALLER),
            op(Instruction::SSTORE),
        ];
        feed(&mut state, &mut classes, &items);
        assert_eq!(state.storage_content().len(), 1);
        let memory = [Item::push(1u64), Item::push(0u64), op(Instruction::MSTORE)];
        feed(&mut state, &mut classes, &memory);
        feed(&mut state, &mut classes, &[Item::push(2u64), Item::push(0x20u64), op(Instruction::MSTORE)]);
        assert_eq!(state.memory_content().len(), 2);
        feed(&mut state, &mut classes, &[Item::push(2u64), Item::push(0x10u64), op(Instruction::MSTORE)]);
        assert_eq!(state.memory_content().len(), 1);
    }

    #[test]
    fn test_call_resets_knowledge() {
        let mut classes = ExpressionClasses::new();
        let mut state = KnownState::new();
        feed(&mut state, &mut classes, &[Item::push(5u64), Item::push(0u64), op(Instruction::SSTORE)]);
        let sequence = state.sequence_number();
        let call = [
            Item::push(0u64),
            Item::push(0u64),
            Item::push(0u64),
            Item::push(0u64),
            Item::push(0u64),
            op(Instruction::CALLER),
            op(Instruction::GAS),
            op(Instruction::CALL),
        ];
        feed(&mut state, &mut classes, &call);
        assert!(state.storage_content().is_empty());
        assert_eq!(state.sequence_number(), sequence + 2);
        assert_eq!(state.stack_height(), 1);
    }

    #[test]
    fn test_constant_keccak() {
        let mut classes = ExpressionClasses::new();
        let mut state = KnownState::new();
        let items = [
            Item::push(0x1234u64),
            Item::push(0u64),
            op(Instruction::MSTORE),
            Item::push(32u64),
            Item::push(0u64),
            op(Instruction::KECCAK256),
        ];
        feed(&mut state, &mut classes, &items);
        let expected = keccak256(U256::from(0x1234).to_be_bytes::<32>());
        let top = state.stack_elements()[&1];
        assert_eq!(classes.known_constant(top), Some(U256::from_be_bytes(expected.0)));
    }

    #[test]
    fn test_empty_keccak() {
        let mut classes = ExpressionClasses::new();
        let mut state = KnownState::new();
        feed(&mut state, &mut classes, &[Item::push(0u64), Item::push(0u64), op(Instruction::KECCAK256)]);
        let top = state.stack_elements()[&1];
        assert_eq!(classes.known_constant(top), Some(U256::from_be_bytes(keccak256(b"").0)));
    }

    #[test]
    fn test_verbatim_outputs_are_fresh() {
        let mut classes = ExpressionClasses::new();
        let mut state = KnownState::new();
        feed(&mut state, &mut classes, &[Item::push(1u64), Item::push(2u64), Item::push(3u64)]);
        let bottom = state.stack_elements()[&1];
        feed(&mut state, &mut classes, &[Item::verbatim(vec![0x5b], 2, 2)]);
        assert_eq!(state.stack_height(), 3);
        let (a, b) = (state.stack_elements()[&2], state.stack_elements()[&3]);
        assert_ne!(a, b);
        assert_eq!(classes.known_constant(a), None);
        assert_eq!(state.stack_elements()[&1], bottom);
    }

    #[test]
    fn test_common_knowledge_with_tag_union() {
        let mut classes = ExpressionClasses::new();
        let mut a = KnownState::new();
        let mut b = KnownState::new();
        feed(&mut a, &mut classes, &[Item::push(7u64), Item::push_tag(1)]);
        feed(&mut b, &mut classes, &[Item::push(7u64), Item::push_tag(2)]);
        a.reduce_to_common_knowledge(&mut classes, &b, true);
        assert_eq!(a.stack_height(), 2);
        let union = a.stack_elements()[&2];
        let tags = a.tags_in_expression(&classes, union);
        assert_eq!(tags, BTreeSet::from([U256::from(1), U256::from(2)]));
        assert_eq!(classes.known_constant(a.stack_elements()[&1]), Some(U256::from(7)));
        a.clear_tag_unions();
        assert!(!a.stack_elements().contains_key(&2));
    }

    #[test]
    fn test_common_knowledge_smaller_stack() {
        let mut classes = ExpressionClasses::new();
        let mut a = KnownState::new();
        let mut b = KnownState::new();
        feed(&mut a, &mut classes, &[Item::push(1u64), Item::push(2u64)]);
        feed(&mut b, &mut classes, &[Item::push(2u64)]);
        a.reduce_to_common_knowledge(&mut classes, &b, false);
        assert_eq!(a.stack_height(), 1);
        assert_eq!(classes.known_constant(a.stack_elements()[&1]), Some(U256::from(2)));
        assert_eq!(a, b);
    }
}
