//! Replacement of expensive constants by cheaper ways to produce them.
//!
//! Every pushed value of at least two bytes is priced in three ways, weighted by how often it is
//! pushed and how often the code is expected to run:
//!
//! - as a literal `PUSH`;
//! - copied with `CODECOPY` from a data blob appended to the code;
//! - computed from shorter literals with `NOT`, shifts (`EXP` before Constantinople), `ADD` and
//!   `SUB`.
//!
//! All pushes of the value are replaced by the cheapest method.

use crate::{Assembly, AssemblyItem, Instruction, ItemKind, gas::GasCosts, item::bytes_required};
use alloy_primitives::U256;
use solgen_config::EvmVersion;
use std::collections::BTreeMap;
use tracing::{debug, instrument, trace};

/// Width of a code address assumed when estimating code size.
const ADDRESS_LENGTH: usize = 3;

/// Upper bound on the number of decompositions tried for one value.
const MAX_STEPS: usize = 10_000;

/// Values below this are never computed.
const COMPUTE_THRESHOLD: u64 = 0x10000;

/// A computation of a constant from shorter literals.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Routine {
    Literal(U256),
    Not(Box<Routine>),
    /// `value << bits`
    Shl(usize, Box<Routine>),
    /// `2 ** bits`
    Exp2(usize),
    Mul(Box<Routine>, Box<Routine>),
    Add(Box<Routine>, Box<Routine>),
    /// `lhs - rhs`
    Sub(Box<Routine>, Box<Routine>),
}

impl Routine {
    fn to_items(&self) -> Vec<AssemblyItem> {
        let mut items = Vec::new();
        self.append_to(&mut items);
        items
    }

    fn append_to(&self, items: &mut Vec<AssemblyItem>) {
        let op = AssemblyItem::operation;
        match self {
            Self::Literal(value) => items.push(AssemblyItem::push(*value)),
            Self::Not(inner) => {
                inner.append_to(items);
                items.push(op(Instruction::NOT));
            }
            Self::Shl(bits, inner) => {
                inner.append_to(items);
                items.push(AssemblyItem::push(*bits));
                items.push(op(Instruction::SHL));
            }
            Self::Exp2(bits) => {
                items.push(AssemblyItem::push(*bits));
                items.push(AssemblyItem::push(2u64));
                items.push(op(Instruction::EXP));
            }
            Self::Mul(lhs, rhs) | Self::Add(lhs, rhs) | Self::Sub(lhs, rhs) => {
                rhs.append_to(items);
                lhs.append_to(items);
                items.push(op(match self {
                    Self::Mul(..) => Instruction::MUL,
                    Self::Add(..) => Instruction::ADD,
                    _ => Instruction::SUB,
                }));
            }
        }
    }
}

/// Rewrites pushes of large constants.
#[derive(Debug)]
pub struct ConstantOptimiser {
    runs: usize,
    is_creation: bool,
    gas: GasCosts,
}

impl ConstantOptimiser {
    /// Creates an optimiser for code that runs `runs` times. Creation code only runs once.
    pub fn new(runs: usize, is_creation: bool, evm_version: EvmVersion) -> Self {
        let runs = if is_creation { 1 } else { runs };
        Self { runs, is_creation, gas: GasCosts::new(evm_version) }
    }

    /// Replaces the constants of `assembly` whose pushes are not the cheapest option. Returns
    /// the number of replaced values.
    #[instrument(level = "debug", skip_all)]
    pub fn optimise(&self, assembly: &mut Assembly) -> usize {
        let mut pushes = BTreeMap::<U256, usize>::new();
        for item in assembly.items() {
            if matches!(item.kind(), ItemKind::Push) {
                *pushes.entry(item.data()).or_default() += 1;
            }
        }

        let mut replacements = BTreeMap::new();
        for (value, multiplicity) in pushes {
            if let Some(replacement) = self.optimise_single(value, multiplicity, assembly) {
                replacements.insert(value, replacement);
            }
        }
        if replacements.is_empty() {
            return 0;
        }

        let items = assembly.items_mut();
        let mut replaced = Vec::with_capacity(items.len());
        for item in std::mem::take(items) {
            if matches!(item.kind(), ItemKind::Push)
                && let Some(replacement) = replacements.get(&item.data())
            {
                let location = item.location();
                replaced.extend(replacement.iter().map(|r| r.clone().with_location(location)));
                continue;
            }
            replaced.push(item);
        }
        *items = replaced;
        debug!(count = replacements.len(), "replaced constants");
        replacements.len()
    }

    fn optimise_single(
        &self,
        value: U256,
        multiplicity: usize,
        assembly: &mut Assembly,
    ) -> Option<Vec<AssemblyItem>> {
        if value < U256::from(0x100) {
            return None;
        }

        let literal = self.literal_gas(value, multiplicity);
        let copy = self.copy_gas(value, multiplicity);
        let mut steps = MAX_STEPS;
        let routine = self.find_representation(value, &mut steps);
        let computed = routine.to_items();
        let compute = if self.check_representation(value, &computed) {
            self.compute_gas(&computed, multiplicity)
        } else {
            U256::MAX
        };
        trace!(%value, multiplicity, %literal, %copy, %compute, "constant costs");

        if copy < literal && copy < compute {
            let data = assembly.new_data(value.to_be_bytes::<32>().to_vec());
            Some(copy_routine(data))
        } else if compute < literal && compute <= copy {
            Some(computed)
        } else {
            None
        }
    }

    fn literal_gas(&self, value: U256, multiplicity: usize) -> U256 {
        let bytes = value.to_be_bytes::<32>();
        let compact = &bytes[32 - bytes_required(value).max(1)..];
        self.combine_gas(
            self.simple_run_gas(&[AssemblyItem::push(value)]),
            self.gas.data_gas_for_size(1, self.is_creation) + self.data_gas(compact),
            U256::ZERO,
            multiplicity,
        )
    }

    fn copy_gas(&self, value: U256, multiplicity: usize) -> U256 {
        let routine = copy_routine(AssemblyItem::push_data(U256::from(1) << 16));
        self.combine_gas(
            // Memory expansion is ignored.
            self.simple_run_gas(&routine) + U256::from(GasCosts::COPY_GAS),
            self.code_gas(&routine),
            self.data_gas(&value.to_be_bytes::<32>()),
            multiplicity,
        )
    }

    fn compute_gas(&self, routine: &[AssemblyItem], multiplicity: usize) -> U256 {
        let exps = routine.iter().filter(|item| item.is(Instruction::EXP)).count();
        let exp_gas = GasCosts::EXP_GAS + self.gas.exp_byte_gas();
        self.combine_gas(
            self.simple_run_gas(routine) + U256::from(exps as u64 * exp_gas),
            self.code_gas(routine),
            U256::ZERO,
            multiplicity,
        )
    }

    /// Finds a cheap computation of `value`, trying decompositions into
    /// `upper * 2 ** bits +- lower` with a small `lower`.
    fn find_representation(&self, value: U256, steps: &mut usize) -> Routine {
        if value < U256::from(COMPUTE_THRESHOLD) {
            return Routine::Literal(value);
        }
        if bytes_required(!value) < bytes_required(value) {
            return Routine::Not(Box::new(self.find_representation(!value, steps)));
        }

        let mut routine = Routine::Literal(value);
        let mut best_gas = self.compute_gas(&routine.to_items(), 1);
        for bits in (9..=255usize).rev() {
            if *steps == 0 {
                break;
            }
            let gap = (value >> (bits - 8)) & U256::from(0x1ff);
            if gap != U256::from(0xff) && gap != U256::from(0x100) {
                continue;
            }

            let power = U256::from(1) << bits;
            let mut upper = value >> bits;
            let mut lower = value & (power - U256::from(1));
            let negative = power - lower < lower;
            if negative {
                lower = power - lower;
                upper += U256::from(1);
            }
            if upper.is_zero() || lower >= power >> 8 {
                continue;
            }

            let shifted = if self.gas.evm_version().has_bitwise_shifting() {
                Routine::Shl(bits, Box::new(self.find_representation(upper, steps)))
            } else if upper == U256::from(1) {
                Routine::Exp2(bits)
            } else {
                let upper = self.find_representation(upper, steps);
                Routine::Mul(Box::new(upper), Box::new(Routine::Exp2(bits)))
            };
            let candidate = if lower.is_zero() {
                shifted
            } else {
                let lower = Box::new(self.find_representation(lower, steps));
                if negative {
                    Routine::Sub(Box::new(shifted), lower)
                } else {
                    Routine::Add(Box::new(shifted), lower)
                }
            };

            *steps = steps.saturating_sub(1);
            let gas = self.compute_gas(&candidate.to_items(), 1);
            if gas < best_gas {
                best_gas = gas;
                routine = candidate;
            }
        }
        routine
    }

    /// Evaluates `routine` and checks that it leaves exactly `value` on the stack.
    fn check_representation(&self, value: U256, routine: &[AssemblyItem]) -> bool {
        let mut stack = Vec::<U256>::new();
        for item in routine {
            if matches!(item.kind(), ItemKind::Push) {
                stack.push(item.data());
                continue;
            }
            let Some(instruction) = item.instruction() else { return false };
            if instruction == Instruction::NOT {
                let Some(top) = stack.last_mut() else { return false };
                *top = !*top;
                continue;
            }
            let (Some(a), Some(b)) = (stack.pop(), stack.pop()) else { return false };
            let result = match instruction {
                Instruction::ADD => a.wrapping_add(b),
                Instruction::SUB => a.wrapping_sub(b),
                Instruction::MUL => a.wrapping_mul(b),
                Instruction::EXP if b <= U256::from(0xff) => a.wrapping_pow(b),
                Instruction::SHL
                    if self.gas.evm_version().has_bitwise_shifting() && a <= U256::from(255) =>
                {
                    b << a.to::<usize>()
                }
                _ => return false,
            };
            stack.push(result);
        }
        stack == [value]
    }

    fn combine_gas(
        &self,
        run_gas: U256,
        repeated_data_gas: U256,
        unique_data_gas: U256,
        multiplicity: usize,
    ) -> U256 {
        let multiplicity = U256::from(multiplicity);
        U256::from(self.runs)
            .saturating_mul(run_gas)
            .saturating_mul(multiplicity)
            .saturating_add(repeated_data_gas.saturating_mul(multiplicity))
            .saturating_add(unique_data_gas)
    }

    fn simple_run_gas(&self, items: &[AssemblyItem]) -> U256 {
        let gas: u64 = items
            .iter()
            .map(|item| match item.instruction() {
                Some(Instruction::EXP) => GasCosts::EXP_GAS,
                Some(instruction) => self.gas.run_gas(instruction).unwrap_or_default(),
                None if item.is_push_like() => GasCosts::TIER_GAS[2],
                None => 0,
            })
            .sum();
        U256::from(gas)
    }

    /// Data gas for the code of `items`, counting every byte as non-zero.
    fn code_gas(&self, items: &[AssemblyItem]) -> U256 {
        let size: usize = items.iter().map(|item| item.bytes_required(ADDRESS_LENGTH)).sum();
        self.gas.data_gas_for_size(size as u64, self.is_creation)
    }

    fn data_gas(&self, data: &[u8]) -> U256 {
        self.gas.data_gas(data, self.is_creation)
    }
}

/// Loads 32 bytes at the offset pushed by `data` through scratch memory, restoring the memory
/// word it uses.
fn copy_routine(data: AssemblyItem) -> Vec<AssemblyItem> {
    let op = AssemblyItem::operation;
    vec![
        AssemblyItem::push(0u64),
        op(Instruction::DUP1),
        op(Instruction::MLOAD),
        AssemblyItem::push(32u64),
        data,
        op(Instruction::DUP4),
        op(Instruction::CODECOPY),
        op(Instruction::DUP2),
        op(Instruction::MLOAD),
        op(Instruction::SWAP2),
        op(Instruction::MSTORE),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembly(pushes: &[U256]) -> Assembly {
        let mut assembly = Assembly::new();
        for &value in pushes {
            assembly.append(AssemblyItem::push(value));
            assembly.append(Instruction::POP);
        }
        assembly
    }

    #[test]
    fn test_negated_value_is_computed() {
        let value = !U256::from(0xff);
        let mut assembly = assembly(&[value]);
        let optimiser = ConstantOptimiser::new(200, false, EvmVersion::Cancun);
        assert_eq!(optimiser.optimise(&mut assembly), 1);
        assert_eq!(
            assembly.items(),
            &[
                AssemblyItem::push(0xffu64),
                AssemblyItem::operation(Instruction::NOT),
                AssemblyItem::operation(Instruction::POP),
            ]
        );
    }

    #[test]
    fn test_small_values_are_kept() {
        let mut assembly = assembly(&[U256::from(0xff), U256::from(0x1234)]);
        let before = assembly.items().to_vec();
        let optimiser = ConstantOptimiser::new(200, false, EvmVersion::Cancun);
        assert_eq!(optimiser.optimise(&mut assembly), 0);
        assert_eq!(assembly.items(), &before[..]);
    }

    #[test]
    fn test_shifted_selector() {
        let value = U256::from(0x4e487b71u64) << 224;
        let optimiser = ConstantOptimiser::new(200, false, EvmVersion::Cancun);
        let routine = optimiser.find_representation(value, &mut { MAX_STEPS });
        assert_eq!(
            routine,
            Routine::Shl(224, Box::new(Routine::Literal(U256::from(0x4e487b71u64))))
        );
        assert!(optimiser.check_representation(value, &routine.to_items()));

        // Without shifts the decomposition needs `EXP`, which costs more than the literal.
        let mut assembly = assembly(&[value]);
        let optimiser = ConstantOptimiser::new(200, false, EvmVersion::Byzantium);
        assert_eq!(optimiser.optimise(&mut assembly), 0);
    }

    #[test]
    fn test_subtracted_lower_part() {
        let value = (U256::from(3) << 200) - U256::from(5);
        let optimiser = ConstantOptimiser::new(200, false, EvmVersion::Cancun);
        let routine = optimiser.find_representation(value, &mut { MAX_STEPS });
        assert!(matches!(routine, Routine::Sub(..)), "{routine:?}");
        assert!(optimiser.check_representation(value, &routine.to_items()));
    }

    #[test]
    fn test_exp_decomposition_evaluates() {
        let value = U256::from(1) << 100;
        let optimiser = ConstantOptimiser::new(200, false, EvmVersion::Byzantium);
        let items = Routine::Exp2(100).to_items();
        assert!(optimiser.check_representation(value, &items));
        assert!(!optimiser.check_representation(value + U256::from(1), &items));
        let shift = Routine::Shl(100, Box::new(Routine::Literal(U256::from(1)))).to_items();
        assert!(!optimiser.check_representation(value, &shift));
    }

    #[test]
    fn test_repeated_constant_in_creation_is_copied() {
        let value = U256::from_be_bytes([0x11; 32]);
        let mut assembly = assembly(&[value; 10]);
        let optimiser = ConstantOptimiser::new(200, true, EvmVersion::Cancun);
        assert_eq!(optimiser.optimise(&mut assembly), 1);

        let items = assembly.items();
        let codecopies = items.iter().filter(|item| item.is(Instruction::CODECOPY)).count();
        assert_eq!(codecopies, 10);
        let data = items.iter().find(|item| matches!(item.kind(), ItemKind::PushData)).unwrap();
        assert_eq!(assembly.data(data.data()), Some(&[0x11; 32][..]));
        assert!(!items.iter().any(|item| item.is_push() && item.data() == value));
    }
}
