use solgen_config::{EvmVersion, OptLevel};

/// Selection and parameters of the assembly optimiser passes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OptimiserSettings {
    /// Inline small blocks and functions.
    pub run_inliner: bool,
    /// Remove unreferenced tags.
    pub run_jumpdest_remover: bool,
    /// Run the peephole optimiser to a fixed point.
    pub run_peephole: bool,
    /// Merge structurally equal blocks.
    pub run_deduplicate: bool,
    /// Run the common subexpression eliminator on basic blocks.
    pub run_cse: bool,
    /// Remove unreachable blocks using the control-flow graph.
    pub run_cfg: bool,
    /// Replace expensive constants by cheaper computations or code copies.
    pub run_constant_optimiser: bool,
    pub evm_version: EvmVersion,
    /// How often the code is expected to be executed, used to weigh runtime gas against
    /// deployment gas.
    pub expected_executions: usize,
    /// Whether the code is creation code, which changes the data gas price.
    pub is_creation: bool,
    /// Upper bound on the number of optimisation rounds.
    pub max_rounds: usize,
}

impl Default for OptimiserSettings {
    fn default() -> Self {
        Self::standard()
    }
}

impl OptimiserSettings {
    /// All passes disabled.
    #[must_use]
    pub fn none() -> Self {
        Self {
            run_inliner: false,
            run_jumpdest_remover: false,
            run_peephole: false,
            run_deduplicate: false,
            run_cse: false,
            run_cfg: false,
            run_constant_optimiser: false,
            evm_version: EvmVersion::default(),
            expected_executions: 200,
            is_creation: false,
            max_rounds: 20,
        }
    }

    /// Only the cheap and always beneficial passes.
    #[must_use]
    pub fn minimal() -> Self {
        Self { run_jumpdest_remover: true, run_peephole: true, ..Self::none() }
    }

    /// All passes enabled.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            run_inliner: true,
            run_jumpdest_remover: true,
            run_peephole: true,
            run_deduplicate: true,
            run_cse: true,
            run_cfg: true,
            run_constant_optimiser: true,
            ..Self::none()
        }
    }

    /// Same as [`standard`](Self::standard).
    #[must_use]
    pub fn full() -> Self {
        Self::standard()
    }

    /// Settings for the given optimisation level.
    #[must_use]
    pub fn for_opt_level(level: OptLevel) -> Self {
        match level {
            OptLevel::O0 => Self::minimal(),
            OptLevel::O1 => Self { run_inliner: level.inline_enabled(), ..Self::standard() },
            OptLevel::O2 => Self::standard(),
            OptLevel::O3 => Self { expected_executions: 10_000, ..Self::full() },
        }
    }

    #[must_use]
    pub fn with_evm_version(mut self, evm_version: EvmVersion) -> Self {
        self.evm_version = evm_version;
        self
    }

    /// Returns `true` if any pass is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.run_inliner
            || self.run_jumpdest_remover
            || self.run_peephole
            || self.run_deduplicate
            || self.run_cse
            || self.run_cfg
            || self.run_constant_optimiser
    }
}
