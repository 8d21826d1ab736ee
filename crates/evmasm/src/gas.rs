//! Static gas estimation.

use crate::{
    AssemblyItem, Instruction, ItemKind,
    analysis::{ClassId, ExpressionClasses, KnownState},
    instruction::Tier,
};
use alloy_primitives::{U256, ruint::UintTryFrom};
use solgen_config::EvmVersion;
use std::{fmt, ops};

/// Gas prices, selected by EVM version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GasCosts {
    evm_version: EvmVersion,
}

impl GasCosts {
    pub const TIER_GAS: [u64; 7] = [0, 2, 3, 5, 8, 10, 20];
    pub const JUMPDEST_GAS: u64 = 1;
    pub const EXP_GAS: u64 = 10;
    pub const SSTORE_SET_GAS: u64 = 20000;
    pub const SSTORE_RESET_GAS: u64 = 5000;
    pub const KECCAK256_GAS: u64 = 30;
    pub const KECCAK256_WORD_GAS: u64 = 6;
    pub const COPY_GAS: u64 = 3;
    pub const MEMORY_GAS: u64 = 3;
    pub const QUAD_COEFF_DIV: u64 = 512;
    pub const LOG_GAS: u64 = 375;
    pub const LOG_TOPIC_GAS: u64 = 375;
    pub const LOG_DATA_GAS: u64 = 8;
    pub const CREATE_GAS: u64 = 32000;
    pub const CALL_STIPEND: u64 = 2300;
    pub const CALL_NEW_ACCOUNT_GAS: u64 = 25000;
    pub const CALL_VALUE_TRANSFER_GAS: u64 = 9000;
    pub const CREATE_DATA_GAS: u64 = 200;
    pub const TX_DATA_ZERO_GAS: u64 = 4;

    pub const fn new(evm_version: EvmVersion) -> Self {
        Self { evm_version }
    }

    #[inline]
    pub fn evm_version(&self) -> EvmVersion {
        self.evm_version
    }

    pub fn sload_gas(&self) -> u64 {
        match self.evm_version {
            v if v >= EvmVersion::Berlin => 2100,
            v if v >= EvmVersion::Istanbul => 800,
            v if v >= EvmVersion::TangerineWhistle => 200,
            _ => 50,
        }
    }

    pub fn balance_gas(&self) -> u64 {
        match self.evm_version {
            v if v >= EvmVersion::Berlin => 2600,
            v if v >= EvmVersion::Istanbul => 700,
            v if v >= EvmVersion::TangerineWhistle => 400,
            _ => 20,
        }
    }

    pub fn ext_code_gas(&self) -> u64 {
        match self.evm_version {
            v if v >= EvmVersion::Berlin => 2600,
            v if v >= EvmVersion::TangerineWhistle => 700,
            _ => 20,
        }
    }

    pub fn call_gas(&self) -> u64 {
        match self.evm_version {
            v if v >= EvmVersion::Berlin => 2600,
            v if v >= EvmVersion::TangerineWhistle => 700,
            _ => 40,
        }
    }

    pub fn exp_byte_gas(&self) -> u64 {
        if self.evm_version >= EvmVersion::SpuriousDragon { 50 } else { 10 }
    }

    pub fn selfdestruct_gas(&self) -> u64 {
        if self.evm_version >= EvmVersion::TangerineWhistle { 5000 } else { 0 }
    }

    pub fn tx_data_non_zero_gas(&self) -> u64 {
        if self.evm_version >= EvmVersion::Istanbul { 16 } else { 68 }
    }

    /// Static execution cost of an instruction, `None` for instructions whose cost depends
    /// on their operands.
    pub fn run_gas(&self, instruction: Instruction) -> Option<u64> {
        if instruction == Instruction::JUMPDEST {
            return Some(Self::JUMPDEST_GAS);
        }
        Some(match instruction.info().tier {
            Tier::Zero => Self::TIER_GAS[0],
            Tier::Base => Self::TIER_GAS[1],
            Tier::VeryLow => Self::TIER_GAS[2],
            Tier::Low => Self::TIER_GAS[3],
            Tier::Mid => Self::TIER_GAS[4],
            Tier::High => Self::TIER_GAS[5],
            Tier::Ext => Self::TIER_GAS[6],
            Tier::Balance => self.balance_gas(),
            Tier::ExtCode => self.ext_code_gas(),
            Tier::Special | Tier::Invalid => return None,
        })
    }

    /// Gas for storing `data` as code or transaction data.
    ///
    /// In a creation context the data is part of the deploying transaction, otherwise it is
    /// deposited as code.
    pub fn data_gas(&self, data: &[u8], in_creation: bool) -> U256 {
        let gas: u64 = if in_creation {
            data.iter()
                .map(|&b| if b == 0 { Self::TX_DATA_ZERO_GAS } else { self.tx_data_non_zero_gas() })
                .sum()
        } else {
            Self::CREATE_DATA_GAS * data.len() as u64
        };
        U256::from(gas)
    }

    /// Like [`data_gas`](Self::data_gas) for `size` bytes of unknown content, assumed to be
    /// non-zero.
    pub fn data_gas_for_size(&self, size: u64, in_creation: bool) -> U256 {
        let per_byte =
            if in_creation { self.tx_data_non_zero_gas() } else { Self::CREATE_DATA_GAS };
        U256::from(size).saturating_mul(U256::from(per_byte))
    }
}

impl Default for GasCosts {
    fn default() -> Self {
        Self::new(EvmVersion::default())
    }
}

/// An amount of gas that may be unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct GasConsumption {
    pub value: U256,
    pub is_infinite: bool,
}

impl GasConsumption {
    pub fn new<T>(value: T) -> Self
    where
        U256: UintTryFrom<T>,
    {
        Self { value: U256::from(value), is_infinite: false }
    }

    pub const fn infinite() -> Self {
        Self { value: U256::ZERO, is_infinite: true }
    }
}

impl From<u64> for GasConsumption {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl ops::AddAssign for GasConsumption {
    fn add_assign(&mut self, other: Self) {
        if self.is_infinite || other.is_infinite {
            *self = Self::infinite();
            return;
        }
        *self = match self.value.checked_add(other.value) {
            Some(value) => Self::new(value),
            None => Self::infinite(),
        };
    }
}

impl ops::Add for GasConsumption {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

impl fmt::Display for GasConsumption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite { f.write_str("[???]") } else { self.value.fmt(f) }
    }
}

/// Estimates the maximum gas consumption of a sequence of items, tracking the symbolic state
/// to resolve memory sizes and other operands where they are constant.
#[derive(Debug)]
pub struct GasMeter {
    state: KnownState,
    classes: ExpressionClasses,
    costs: GasCosts,
    largest_memory_access: U256,
}

impl GasMeter {
    /// Creates a meter starting from an empty state.
    pub fn new(evm_version: EvmVersion) -> Self {
        Self::with_state(KnownState::new(), ExpressionClasses::new(), evm_version)
    }

    /// Creates a meter starting from the given state.
    pub fn with_state(
        state: KnownState,
        classes: ExpressionClasses,
        evm_version: EvmVersion,
    ) -> Self {
        Self { state, classes, costs: GasCosts::new(evm_version), largest_memory_access: U256::ZERO }
    }

    #[inline]
    pub fn costs(&self) -> &GasCosts {
        &self.costs
    }

    #[inline]
    pub fn state(&self) -> &KnownState {
        &self.state
    }

    /// Returns an upper bound for the gas consumed by `item` and feeds it into the state.
    ///
    /// Calls and creations are infinite if `include_external_costs` is set, since the code
    /// they execute is unknown.
    pub fn estimate_max(
        &mut self,
        item: &AssemblyItem,
        include_external_costs: bool,
    ) -> GasConsumption {
        let gas = self.estimate(item, include_external_costs);
        self.state.feed_item(&mut self.classes, item);
        gas
    }

    /// Sums [`estimate_max`](Self::estimate_max) over `items`.
    pub fn estimate_items<'a>(
        &mut self,
        items: impl IntoIterator<Item = &'a AssemblyItem>,
        include_external_costs: bool,
    ) -> GasConsumption {
        items
            .into_iter()
            .fold(GasConsumption::default(), |gas, item| {
                gas + self.estimate_max(item, include_external_costs)
            })
    }

    fn estimate(&mut self, item: &AssemblyItem, include_external_costs: bool) -> GasConsumption {
        let costs = self.costs;
        let run = |instruction| {
            costs.run_gas(instruction).map_or(GasConsumption::infinite(), GasConsumption::from)
        };
        let instruction = match item.kind() {
            ItemKind::Push
            | ItemKind::PushTag
            | ItemKind::PushData
            | ItemKind::PushSub
            | ItemKind::PushSubSize
            | ItemKind::PushProgramSize
            | ItemKind::PushImmutable => return run(Instruction::PUSH1),
            ItemKind::Tag => return run(Instruction::JUMPDEST),
            ItemKind::Operation(instruction) => *instruction,
            _ => return GasConsumption::infinite(),
        };

        match instruction {
            Instruction::SSTORE => {
                let slot = self.element(0);
                let value = self.element(-1);
                let already_set = self
                    .state
                    .storage_content()
                    .get(&slot)
                    .copied()
                    .is_some_and(|current| self.classes.known_non_zero(current));
                if self.classes.known_zero(value) || already_set {
                    GasConsumption::from(GasCosts::SSTORE_RESET_GAS)
                } else {
                    GasConsumption::from(GasCosts::SSTORE_SET_GAS)
                }
            }
            Instruction::SLOAD => costs.sload_gas().into(),
            Instruction::RETURN | Instruction::REVERT => run(instruction) + self.memory_gas_range(0, -1),
            Instruction::MLOAD | Instruction::MSTORE => {
                run(instruction) + self.memory_gas_at_offset(32)
            }
            Instruction::MSTORE8 => run(instruction) + self.memory_gas_at_offset(1),
            Instruction::KECCAK256 => {
                GasConsumption::from(GasCosts::KECCAK256_GAS)
                    + self.memory_gas_range(0, -1)
                    + self.word_gas(GasCosts::KECCAK256_WORD_GAS, -1)
            }
            Instruction::CALLDATACOPY | Instruction::CODECOPY | Instruction::RETURNDATACOPY => {
                run(instruction) + self.memory_gas_range(0, -2) + self.word_gas(GasCosts::COPY_GAS, -2)
            }
            Instruction::EXTCODESIZE | Instruction::EXTCODEHASH => costs.ext_code_gas().into(),
            Instruction::EXTCODECOPY => {
                GasConsumption::from(costs.ext_code_gas())
                    + self.memory_gas_range(-1, -3)
                    + self.word_gas(GasCosts::COPY_GAS, -3)
            }
            _ if instruction.is_log() => {
                let topics = u64::from(instruction.log_number());
                let mut gas = GasConsumption::from(GasCosts::LOG_GAS + GasCosts::LOG_TOPIC_GAS * topics);
                gas += self.memory_gas_range(0, -1);
                let size = self.element(-1);
                match self.classes.known_constant(size) {
                    Some(size) => {
                        let data = U256::from(GasCosts::LOG_DATA_GAS).saturating_mul(size);
                        gas += GasConsumption::new(data);
                    }
                    None => gas = GasConsumption::infinite(),
                }
                gas
            }
            Instruction::CALL
            | Instruction::CALLCODE
            | Instruction::DELEGATECALL
            | Instruction::STATICCALL => {
                if include_external_costs {
                    return GasConsumption::infinite();
                }
                let mut gas = GasConsumption::from(costs.call_gas());
                let call_gas = self.element(0);
                match self.classes.known_constant(call_gas) {
                    Some(value) => gas += GasConsumption::new(value),
                    None => gas = GasConsumption::infinite(),
                }
                if instruction == Instruction::CALL {
                    // Whether the account exists is rarely known.
                    gas += GasCosts::CALL_NEW_ACCOUNT_GAS.into();
                }
                let value_size = match instruction {
                    Instruction::DELEGATECALL | Instruction::STATICCALL => 0,
                    _ => 1,
                };
                if value_size == 1 {
                    let value = self.element(-2);
                    if !self.classes.known_zero(value) {
                        gas += GasCosts::CALL_VALUE_TRANSFER_GAS.into();
                    }
                }
                gas += self.memory_gas_range(-2 - value_size, -3 - value_size);
                gas += self.memory_gas_range(-4 - value_size, -5 - value_size);
                gas
            }
            Instruction::SELFDESTRUCT => {
                GasConsumption::from(costs.selfdestruct_gas()) + GasCosts::CALL_NEW_ACCOUNT_GAS.into()
            }
            Instruction::CREATE | Instruction::CREATE2 => {
                if include_external_costs {
                    return GasConsumption::infinite();
                }
                GasConsumption::from(GasCosts::CREATE_GAS) + self.memory_gas_range(-1, -2)
            }
            Instruction::EXP => {
                let exponent = self.element(-1);
                let bytes = self
                    .classes
                    .known_constant(exponent)
                    .map_or(32, |exponent| exponent.byte_len() as u64);
                GasConsumption::from(GasCosts::EXP_GAS + costs.exp_byte_gas() * bytes)
            }
            Instruction::BALANCE => costs.balance_gas().into(),
            _ => run(instruction),
        }
    }

    fn element(&mut self, offset: i32) -> ClassId {
        self.state.relative_stack_element(&mut self.classes, offset)
    }

    /// Memory expansion cost for accessing `size` bytes at the stack top address.
    fn memory_gas_at_offset(&mut self, size: u64) -> GasConsumption {
        let start = self.element(0);
        let size = self.classes.find_constant(U256::from(size));
        let end = self.classes.find_op(Instruction::ADD, &[start, size]);
        self.memory_gas(end)
    }

    /// Memory expansion cost for the range given by offset and size stack slots.
    fn memory_gas_range(&mut self, offset: i32, size: i32) -> GasConsumption {
        let size = self.element(size);
        if self.classes.known_zero(size) {
            return GasConsumption::default();
        }
        let start = self.element(offset);
        let end = self.classes.find_op(Instruction::ADD, &[start, size]);
        self.memory_gas(end)
    }

    fn memory_gas(&mut self, position: ClassId) -> GasConsumption {
        let Some(position) = self.classes.known_constant(position) else {
            return GasConsumption::infinite();
        };
        if position < self.largest_memory_access {
            return GasConsumption::default();
        }
        let previous = std::mem::replace(&mut self.largest_memory_access, position);
        let memory_gas = |position: U256| -> Option<U256> {
            let words = position.checked_add(U256::from(31))? / U256::from(32);
            let linear = words.checked_mul(U256::from(GasCosts::MEMORY_GAS))?;
            let quadratic = words.checked_mul(words)? / U256::from(GasCosts::QUAD_COEFF_DIV);
            linear.checked_add(quadratic)
        };
        match (memory_gas(position), memory_gas(previous)) {
            (Some(now), Some(before)) => GasConsumption::new(now - before),
            _ => GasConsumption::infinite(),
        }
    }

    fn word_gas(&mut self, multiplier: u64, size: i32) -> GasConsumption {
        let size = self.element(size);
        let Some(size) = self.classes.known_constant(size) else {
            return GasConsumption::infinite();
        };
        let words = size.saturating_add(U256::from(31)) / U256::from(32);
        match words.checked_mul(U256::from(multiplier)) {
            Some(gas) => GasConsumption::new(gas),
            None => GasConsumption::infinite(),
        }
    }
}
