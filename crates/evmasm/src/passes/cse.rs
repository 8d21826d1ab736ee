//! Common subexpression elimination.
//!
//! Items of a basic block are fed into a [`KnownState`] until the first item that breaks the
//! analysis. The final stack layout and the storage and memory writes are then expressed as
//! equivalence classes, and code is re-generated from those classes using `DUP`/`SWAP` to
//! reuse values that are already on the stack.
//!
//! ## Example
//!
//! ```text
//! Before:                              After:
//!   PUSH 0                               PUSH 0
//!   SLOAD                                DUP1
//!   PUSH 0                               SLOAD
//!   SLOAD                                DUP1
//!   ADD                                  ADD
//!   PUSH 0                               SWAP1
//!   SSTORE                               SSTORE
//! ```
//!
//! The second load of slot 0 is the known content of the first one, so only one `SLOAD` is
//! generated.
//!
//! Loads from storage and memory depend on all earlier writes to locations not known to be
//! different, and all sequenced operations are emitted in their original order.

use crate::{
    AssemblyItem, Instruction, ItemKind, OptimiserError, SourceLocation,
    analysis::{ClassId, ExpressionClasses, KnownState, StoreOperation, StoreTarget},
    semantic,
};
use alloy_primitives::U256;
use std::collections::{BTreeMap, BTreeSet};

type Result<T, E = OptimiserError> = std::result::Result<T, E>;

/// Optimises a linear sequence of items by re-generating it from its symbolic effect.
///
/// Usage: [`feed_items`](Self::feed_items) until a breaking item, then
/// [`get_optimized_items`](Self::get_optimized_items). The eliminator continues with the state
/// after the breaking item and can be fed again.
pub struct CommonSubexpressionEliminator<'a> {
    classes: &'a mut ExpressionClasses,
    initial_state: KnownState,
    state: KnownState,
    store_operations: Vec<StoreOperation>,
    breaking_item: Option<AssemblyItem>,
}

impl<'a> CommonSubexpressionEliminator<'a> {
    pub fn new(classes: &'a mut ExpressionClasses, state: KnownState) -> Self {
        Self {
            classes,
            initial_state: state.clone(),
            state,
            store_operations: Vec::new(),
            breaking_item: None,
        }
    }

    /// Feeds items until the first one that breaks the analysis, which is consumed as well.
    ///
    /// Returns the number of consumed items.
    pub fn feed_items(&mut self, items: &[AssemblyItem], msize_important: bool) -> Result<usize> {
        if self.breaking_item.is_some() {
            return Err(OptimiserError::Invariant("items fed after a breaking item"));
        }
        let mut consumed = 0;
        for item in items {
            consumed += 1;
            if semantic::breaks_cse_analysis_block(item, msize_important) {
                self.breaking_item = Some(item.clone());
                break;
            }
            self.feed_item(item);
        }
        Ok(consumed)
    }

    /// Returns the optimised replacement of the items fed so far, including the breaking item.
    ///
    /// The eliminator is reset to the state after the breaking item even if generation fails.
    pub fn get_optimized_items(&mut self) -> Result<Vec<AssemblyItem>> {
        self.optimize_breaking_item();

        let mut next_state = self.state.clone();
        if let Some(item) = &self.breaking_item {
            next_state.feed_item(self.classes, item);
        }

        let generated = self.generate();

        let breaking_item = self.breaking_item.take();
        self.store_operations.clear();
        self.initial_state = next_state.clone();
        self.state = next_state;

        let mut items = generated?;
        items.extend(breaking_item);
        Ok(items)
    }

    /// The state after the items fed so far.
    #[inline]
    pub fn state(&self) -> &KnownState {
        &self.state
    }

    fn feed_item(&mut self, item: &AssemblyItem) {
        if let Some(operation) = self.state.feed_item(self.classes, item) {
            self.store_operations.push(operation);
        }
    }

    /// Resolves conditional jumps with a known condition and returns of zero size.
    fn optimize_breaking_item(&mut self) {
        let Some(item) = &self.breaking_item else { return };
        let location = item.location();
        let jump_type = item.jump_type();
        let is_jumpi = item.is(Instruction::JUMPI);
        let is_return = item.is(Instruction::RETURN);
        let op = |instruction| AssemblyItem::operation(instruction).with_location(location);

        if is_jumpi {
            let height = self.state.stack_height() - 1;
            let condition = self.state.stack_element(self.classes, height, location);
            if self.classes.known_non_zero(condition) {
                self.feed_item(&op(Instruction::SWAP1));
                self.feed_item(&op(Instruction::POP));
                self.breaking_item = Some(op(Instruction::JUMP).with_jump_type(jump_type));
            } else if self.classes.known_zero(condition) {
                self.feed_item(&op(Instruction::POP));
                self.feed_item(&op(Instruction::POP));
                self.breaking_item = None;
            }
        } else if is_return {
            let height = self.state.stack_height() - 1;
            let size = self.state.stack_element(self.classes, height, location);
            if self.classes.known_zero(size) {
                self.feed_item(&op(Instruction::POP));
                self.feed_item(&op(Instruction::POP));
                self.breaking_item = Some(op(Instruction::STOP));
            }
        }
    }

    fn generate(&mut self) -> Result<Vec<AssemblyItem>> {
        let mut min_height = self.state.stack_height() + 1;
        if let Some((&lowest, _)) = self.state.stack_elements().first_key_value() {
            min_height = min_height.min(lowest);
        }

        let mut initial_stack = BTreeMap::new();
        for height in min_height..=self.initial_state.stack_height() {
            let id = self.initial_state.stack_element(self.classes, height, SourceLocation::default());
            initial_stack.insert(height, id);
        }
        let mut target_stack = BTreeMap::new();
        for height in min_height..=self.state.stack_height() {
            let id = self.state.stack_element(self.classes, height, SourceLocation::default());
            target_stack.insert(height, id);
        }

        CseCodeGenerator::new(self.classes, &self.store_operations).generate_code(
            self.initial_state.sequence_number(),
            self.initial_state.stack_height(),
            &initial_stack,
            target_stack,
        )
    }
}

/// Generates code that turns an initial stack layout into a target layout and performs the
/// given store operations.
pub struct CseCodeGenerator<'a> {
    classes: &'a mut ExpressionClasses,
    /// Store operations grouped by target and slot, in sequence order.
    store_operations: BTreeMap<(StoreTarget, ClassId), Vec<StoreOperation>>,
    generated_items: Vec<AssemblyItem>,
    stack_height: i32,
    stack: BTreeMap<i32, ClassId>,
    /// Argument -> consumers.
    needed_by: BTreeMap<ClassId, Vec<ClassId>>,
    /// Stack positions of generated classes. An empty set marks a class that was generated
    /// and consumed.
    class_positions: BTreeMap<ClassId, BTreeSet<i32>>,
    final_classes: BTreeSet<ClassId>,
    target_stack: BTreeMap<i32, ClassId>,
}

impl<'a> CseCodeGenerator<'a> {
    pub fn new(classes: &'a mut ExpressionClasses, store_operations: &[StoreOperation]) -> Self {
        let mut grouped: BTreeMap<_, Vec<_>> = BTreeMap::new();
        for &operation in store_operations {
            grouped.entry((operation.target, operation.slot)).or_default().push(operation);
        }
        Self {
            classes,
            store_operations: grouped,
            generated_items: Vec::new(),
            stack_height: 0,
            stack: BTreeMap::new(),
            needed_by: BTreeMap::new(),
            class_positions: BTreeMap::new(),
            final_classes: BTreeSet::new(),
            target_stack: BTreeMap::new(),
        }
    }

    /// Generates the code.
    ///
    /// `initial_stack` and `target_stack` map absolute stack heights to classes; the final
    /// height is the largest target height.
    pub fn generate_code(
        mut self,
        initial_sequence_number: u32,
        initial_stack_height: i32,
        initial_stack: &BTreeMap<i32, ClassId>,
        target_stack: BTreeMap<i32, ClassId>,
    ) -> Result<Vec<AssemblyItem>> {
        self.stack_height = initial_stack_height;
        self.stack = initial_stack.clone();
        self.target_stack = target_stack;
        for (&height, &id) in &self.stack {
            self.class_positions.entry(id).or_default().insert(height);
        }

        // Dependency graph, starting from the final writes and the target stack.
        let last_stores: Vec<ClassId> = self
            .store_operations
            .values()
            .filter_map(|operations| operations.last())
            .map(|operation| operation.expression)
            .collect();
        for id in last_stores {
            self.add_dependencies(id)?;
        }
        let targets: Vec<(i32, ClassId)> =
            self.target_stack.iter().map(|(&height, &id)| (height, id)).collect();
        for &(_, id) in &targets {
            self.final_classes.insert(id);
            self.add_dependencies(id)?;
        }

        let mut sequenced = BTreeSet::new();
        for (&argument, consumers) in &self.needed_by {
            for &consumer in consumers {
                for id in [argument, consumer] {
                    let sequence_number = self.classes.representative(id).sequence_number;
                    if sequence_number == 0 {
                        continue;
                    }
                    if sequence_number < initial_sequence_number {
                        // The operation was recorded before this block started.
                        return Err(OptimiserError::StackTooDeep);
                    }
                    sequenced.insert((sequence_number, id));
                }
            }
        }

        // Storage and memory operations in their original order.
        for (_, id) in sequenced {
            if !self.class_positions.contains_key(&id) {
                self.generate_class_element(id, true)?;
            }
        }

        for (height, id) in targets {
            if self.stack.get(&height) == Some(&id) {
                continue;
            }
            self.generate_class_element(id, false)?;
            let positions = self.class_positions.entry(id).or_default();
            if positions.is_empty() {
                return Err(OptimiserError::Invariant("target class not generated"));
            }
            if positions.contains(&height) {
                continue;
            }
            let location = self.classes.representative(id).item.location();
            let position = self.class_element_position(id)?;
            if position < height {
                self.append_dup(position, location)?;
            } else {
                self.append_or_remove_swap(position, location)?;
            }
            self.append_or_remove_swap(height, location)?;
        }

        while self.remove_stack_top_if_possible()? {}

        let final_height = if let Some((&height, _)) = self.target_stack.last_key_value() {
            height
        } else if let Some((&height, _)) = initial_stack.first_key_value() {
            height - 1
        } else {
            initial_stack_height
        };
        if final_height != self.stack_height {
            return Err(OptimiserError::Invariant("incorrect final stack height"));
        }
        Ok(self.generated_items)
    }

    fn add_dependencies(&mut self, id: ClassId) -> Result<()> {
        if self.class_positions.contains_key(&id) || self.needed_by.contains_key(&id) {
            return Ok(());
        }
        let expr = self.classes.representative(id).clone();
        if expr.item.kind() == &ItemKind::Undefined {
            return Err(OptimiserError::ItemNotAvailable);
        }
        for &argument in &expr.arguments {
            self.add_dependencies(argument)?;
            self.needed_by.entry(argument).or_default().push(id);
        }

        let Some(instruction) = expr.item.instruction() else { return Ok(()) };
        let target = match instruction {
            Instruction::SLOAD => StoreTarget::Storage,
            Instruction::MLOAD | Instruction::KECCAK256 => StoreTarget::Memory,
            _ => return Ok(()),
        };

        // A load depends on all earlier stores to locations not known to be different.
        let load_slot = expr.arguments[0];
        let groups: Vec<(ClassId, Vec<StoreOperation>)> = self
            .store_operations
            .iter()
            .filter(|((store_target, _), _)| *store_target == target)
            .map(|(&(_, slot), operations)| (slot, operations.clone()))
            .collect();
        for (slot, operations) in groups {
            let Some(first) = operations.first() else { continue };
            if first.sequence_number > expr.sequence_number {
                continue;
            }
            let independent = match instruction {
                Instruction::SLOAD => self.classes.known_to_be_different(slot, load_slot),
                Instruction::MLOAD => self.classes.known_to_be_different_by_32(slot, load_slot),
                _ => {
                    let length = expr.arguments[1];
                    let sub = AssemblyItem::operation(Instruction::SUB)
                        .with_location(expr.item.location());
                    let offset = self.classes.find(&sub, &[slot, load_slot], 0);
                    hash_independent_of_store(
                        self.classes.known_constant(offset),
                        self.classes.known_constant(length),
                    )
                }
            };
            if independent {
                continue;
            }
            // Stores and loads never share a sequence number.
            let mut latest = first.expression;
            for operation in &operations[1..] {
                if operation.sequence_number < expr.sequence_number {
                    latest = operation.expression;
                }
            }
            self.add_dependencies(latest)?;
            self.needed_by.entry(latest).or_default().push(id);
        }
        Ok(())
    }

    fn generate_class_element(&mut self, id: ClassId, allow_sequenced: bool) -> Result<()> {
        if self.class_positions.values().flatten().any(|&position| position > self.stack_height) {
            return Err(OptimiserError::Invariant("class position above the stack top"));
        }

        self.remove_stack_top_if_possible()?;
        if let Some(positions) = self.class_positions.get(&id) {
            if positions.is_empty() {
                return Err(OptimiserError::Invariant("element already removed but still needed"));
            }
            return Ok(());
        }

        let expr = self.classes.representative(id).clone();
        if !allow_sequenced && expr.sequence_number != 0 {
            return Err(OptimiserError::Invariant("sequenced operation requested out of sequence"));
        }
        if expr.item.kind() == &ItemKind::Undefined {
            return Err(OptimiserError::Invariant("undefined item requested"));
        }

        let arguments = &expr.arguments;
        for &argument in arguments.iter().rev() {
            self.generate_class_element(argument, false)?;
        }

        // Move the arguments into place, consuming values that are no longer needed.
        let location = expr.item.location();
        match arguments.as_slice() {
            [] => {}
            &[a] => {
                let position = self.class_element_position(a)?;
                if self.can_be_removed(a, Some(id), None)? {
                    self.append_or_remove_swap(position, location)?;
                } else {
                    self.append_dup(position, location)?;
                }
            }
            &[a, b] => {
                if self.can_be_removed(b, Some(id), None)? {
                    let position = self.class_element_position(b)?;
                    self.append_or_remove_swap(position, location)?;
                    if a == b {
                        self.append_dup(self.stack_height, location)?;
                    } else if self.can_be_removed(a, Some(id), None)? {
                        self.append_or_remove_swap(self.stack_height - 1, location)?;
                        let position = self.class_element_position(a)?;
                        self.append_or_remove_swap(position, location)?;
                    } else {
                        let position = self.class_element_position(a)?;
                        self.append_dup(position, location)?;
                    }
                } else if a == b {
                    let position = self.class_element_position(a)?;
                    self.append_dup(position, location)?;
                    self.append_dup(self.stack_height, location)?;
                } else if self.can_be_removed(a, Some(id), None)? {
                    let position = self.class_element_position(a)?;
                    self.append_or_remove_swap(position, location)?;
                    let position = self.class_element_position(b)?;
                    self.append_dup(position, location)?;
                    self.append_or_remove_swap(self.stack_height - 1, location)?;
                } else {
                    let position = self.class_element_position(b)?;
                    self.append_dup(position, location)?;
                    let position = self.class_element_position(a)?;
                    self.append_dup(position, location)?;
                }
            }
            _ => return Err(OptimiserError::Invariant("operations with more than two arguments")),
        }

        for (i, &argument) in arguments.iter().enumerate() {
            if self.stack.get(&(self.stack_height - i as i32)) != Some(&argument) {
                return Err(OptimiserError::Invariant("expected arguments not present"));
            }
        }

        while semantic::is_commutative_operation(&expr.item)
            && self.generated_items.last().is_some_and(|item| item.is(Instruction::SWAP1))
        {
            // Cancels the swap that is already there.
            self.append_or_remove_swap(self.stack_height - 1, location)?;
        }

        for i in 0..arguments.len() {
            let height = self.stack_height - i as i32;
            if let Some(argument) = self.stack.remove(&height) {
                self.class_positions.entry(argument).or_default().remove(&height);
            }
        }

        self.append_item(expr.item.clone());
        let returns_value = match expr.item.instruction() {
            Some(instruction) => match instruction.info().ret {
                0 => false,
                1 => true,
                _ => return Err(OptimiserError::Invariant("invalid number of return values")),
            },
            None => true,
        };
        if returns_value {
            self.stack.insert(self.stack_height, id);
            self.class_positions.entry(id).or_default().insert(self.stack_height);
        } else {
            // Marks the expression as generated.
            self.class_positions.entry(id).or_default();
        }
        Ok(())
    }

    /// Returns the topmost stack position of the class.
    fn class_element_position(&self, id: ClassId) -> Result<i32> {
        self.class_positions
            .get(&id)
            .and_then(|positions| positions.last().copied())
            .ok_or(OptimiserError::Invariant("element requested but not present"))
    }

    /// Returns `true` if the copy of `element` at `from_position` (default: its topmost
    /// position) can be consumed when generating `result`.
    fn can_be_removed(
        &self,
        element: ClassId,
        result: Option<ClassId>,
        from_position: Option<i32>,
    ) -> Result<bool> {
        let from_position = match from_position {
            Some(position) => position,
            None => self.class_element_position(element)?,
        };
        let have_copy = self.class_positions.get(&element).is_some_and(|p| p.len() > 1);
        if self.final_classes.contains(&element) {
            // Copies that are not at their target position are surplus.
            return Ok(have_copy && self.target_stack.get(&from_position) != Some(&element));
        }
        if !have_copy {
            let consumers = self.needed_by.get(&element).map(Vec::as_slice).unwrap_or_default();
            let still_needed = consumers.iter().any(|&consumer| {
                Some(consumer) != result && !self.class_positions.contains_key(&consumer)
            });
            return Ok(!still_needed);
        }
        Ok(true)
    }

    fn remove_stack_top_if_possible(&mut self) -> Result<bool> {
        if self.stack.is_empty() {
            return Ok(false);
        }
        let Some(&top) = self.stack.get(&self.stack_height) else {
            return Err(OptimiserError::Invariant("stack top not tracked"));
        };
        if !self.can_be_removed(top, None, Some(self.stack_height))? {
            return Ok(false);
        }
        self.class_positions.entry(top).or_default().remove(&self.stack_height);
        self.stack.remove(&self.stack_height);
        self.append_item(AssemblyItem::operation(Instruction::POP));
        Ok(true)
    }

    fn append_dup(&mut self, from_position: i32, location: SourceLocation) -> Result<()> {
        let n = 1 + self.stack_height - from_position;
        if n > 16 {
            return Err(OptimiserError::StackTooDeep);
        }
        if n < 1 {
            return Err(OptimiserError::Invariant("invalid stack access"));
        }
        let id = self.stack_at(from_position)?;
        self.append_item(AssemblyItem::operation(Instruction::dup(n as u8)).with_location(location));
        self.stack.insert(self.stack_height, id);
        self.class_positions.entry(id).or_default().insert(self.stack_height);
        Ok(())
    }

    /// Swaps the element at `from_position` to the top. Two equal consecutive swaps cancel.
    fn append_or_remove_swap(
        &mut self,
        from_position: i32,
        location: SourceLocation,
    ) -> Result<()> {
        if from_position == self.stack_height {
            return Ok(());
        }
        let n = self.stack_height - from_position;
        if n > 16 {
            return Err(OptimiserError::StackTooDeep);
        }
        if n < 1 {
            return Err(OptimiserError::Invariant("invalid stack access"));
        }
        self.append_item(AssemblyItem::operation(Instruction::swap(n as u8)).with_location(location));

        let top = self.stack_at(self.stack_height)?;
        let other = self.stack_at(from_position)?;
        if top != other {
            let positions = self.class_positions.entry(top).or_default();
            positions.remove(&self.stack_height);
            positions.insert(from_position);
            let positions = self.class_positions.entry(other).or_default();
            positions.remove(&from_position);
            positions.insert(self.stack_height);
            self.stack.insert(self.stack_height, other);
            self.stack.insert(from_position, top);
        }

        if let [.., previous, last] = self.generated_items.as_slice()
            && semantic::is_swap_instruction(last)
            && previous == last
        {
            self.generated_items.truncate(self.generated_items.len() - 2);
        }
        Ok(())
    }

    fn stack_at(&self, height: i32) -> Result<ClassId> {
        self.stack
            .get(&height)
            .copied()
            .ok_or(OptimiserError::Invariant("stack element not tracked"))
    }

    fn append_item(&mut self, item: AssemblyItem) {
        self.stack_height += item.deposit();
        self.generated_items.push(item);
    }
}

/// Whether a `KECCAK256` over `length` bytes reads nothing a store at `offset` bytes before
/// its start has written, where `offset = store slot - hash start`.
fn hash_independent_of_store(offset: Option<U256>, length: Option<U256>) -> bool {
    if length == Some(U256::ZERO) {
        return true;
    }
    let Some(offset) = offset else { return false };
    let negative = offset.bit(255);
    if negative {
        // The store ends before the hashed area.
        offset.wrapping_neg() >= U256::from(32)
    } else {
        length.is_some_and(|length| offset >= length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AssemblyItem as Item, JumpType};

    fn op(instruction: Instruction) -> Item {
        Item::operation(instruction)
    }

    fn cse(items: &[Item]) -> Vec<Item> {
        let mut classes = ExpressionClasses::new();
        let mut eliminator = CommonSubexpressionEliminator::new(&mut classes, KnownState::new());
        let consumed = eliminator.feed_items(items, false).unwrap();
        assert_eq!(consumed, items.len());
        eliminator.get_optimized_items().unwrap()
    }

    /// Checks that the output reaches the same symbolic state as the input.
    fn check_equivalent(input: &[Item]) -> Vec<Item> {
        let output = cse(input);
        let mut classes = ExpressionClasses::new();
        let mut before = KnownState::new();
        for item in input {
            before.feed_item(&mut classes, item);
        }
        let mut after = KnownState::new();
        for item in &output {
            after.feed_item(&mut classes, item);
        }
        assert_eq!(before.stack_height(), after.stack_height());
        assert!(before == after, "{}\n{}", before.dump(&classes), after.dump(&classes));
        output
    }

    #[test]
    fn test_self_subtraction() {
        let output = check_equivalent(&[op(Instruction::DUP1), op(Instruction::SUB)]);
        assert_eq!(output, [op(Instruction::POP), Item::push(0u64)]);
    }

    #[test]
    fn test_constant_folding() {
        let output = check_equivalent(&[Item::push(7u64), Item::push(8u64), op(Instruction::ADD)]);
        assert_eq!(output, [Item::push(15u64)]);
    }

    #[test]
    fn test_storage_load_reuse() {
        let input = [
            Item::push(0u64),
            op(Instruction::SLOAD),
            Item::push(0u64),
            op(Instruction::SLOAD),
            op(Instruction::ADD),
            Item::push(0u64),
            op(Instruction::SSTORE),
        ];
        let output = check_equivalent(&input);
        let expected = [
            Item::push(0u64),
            op(Instruction::DUP1),
            op(Instruction::SLOAD),
            op(Instruction::DUP1),
            op(Instruction::ADD),
            op(Instruction::SWAP1),
            op(Instruction::SSTORE),
        ];
        assert_eq!(output, expected);
    }

    #[test]
    fn test_unchanged_stack_access() {
        let input = [op(Instruction::DUP2), Item::push(0u64)];
        assert_eq!(cse(&input), input);
        assert_eq!(cse(&[op(Instruction::ADD)]), [op(Instruction::ADD)]);
        assert_eq!(cse(&[op(Instruction::POP)]), [op(Instruction::POP)]);
    }

    #[test]
    fn test_known_true_jumpi_becomes_jump() {
        let input = [
            Item::push(1u64),
            Item::push_tag(4),
            op(Instruction::JUMPI).with_jump_type(JumpType::IntoFunction),
        ];
        let output = cse(&input);
        assert_eq!(output, [Item::push_tag(4), op(Instruction::JUMP)]);
        assert_eq!(output[1].jump_type(), JumpType::IntoFunction);
    }

    #[test]
    fn test_known_false_jumpi_is_removed() {
        let input = [Item::push(0u64), Item::push_tag(4), op(Instruction::JUMPI)];
        assert!(cse(&input).is_empty());
    }

    #[test]
    fn test_empty_return_becomes_stop() {
        let input = [Item::push(0u64), Item::push(0x40u64), op(Instruction::RETURN)];
        assert_eq!(cse(&input), [op(Instruction::STOP)]);
    }

    #[test]
    fn test_feeding_stops_at_breaking_item() {
        let mut classes = ExpressionClasses::new();
        let mut eliminator = CommonSubexpressionEliminator::new(&mut classes, KnownState::new());
        let items = [Item::push(1u64), Item::tag(1), Item::push(2u64)];
        assert_eq!(eliminator.feed_items(&items, false).unwrap(), 2);
        assert_eq!(eliminator.get_optimized_items().unwrap(), [Item::push(1u64), Item::tag(1)]);
        assert_eq!(eliminator.feed_items(&items[2..], false).unwrap(), 1);
        assert_eq!(eliminator.get_optimized_items().unwrap(), [Item::push(2u64)]);
    }

    #[test]
    fn test_overwritten_memory_store_is_dropped() {
        let input = [
            op(Instruction::CALLVALUE),
            Item::push(0u64),
            op(Instruction::MSTORE),
            Item::push(0u64),
            op(Instruction::MLOAD),
            op(Instruction::CALLER),
            Item::push(0u64),
            op(Instruction::MSTORE),
        ];
        let output = check_equivalent(&input);
        let expected = [
            op(Instruction::CALLER),
            Item::push(0u64),
            op(Instruction::MSTORE),
            op(Instruction::CALLVALUE),
        ];
        assert_eq!(output, expected);
    }

    #[test]
    fn test_hash_independence() {
        let minus = |value: u64| U256::ZERO.wrapping_sub(U256::from(value));
        assert!(hash_independent_of_store(None, Some(U256::ZERO)));
        assert!(hash_independent_of_store(Some(minus(32)), None));
        assert!(!hash_independent_of_store(Some(minus(31)), None));
        assert!(hash_independent_of_store(Some(U256::from(64)), Some(U256::from(64))));
        assert!(!hash_independent_of_store(Some(U256::from(32)), Some(U256::from(64))));
        assert!(!hash_independent_of_store(None, Some(U256::from(32))));
    }
}
