use solgen_config::{EvmVersion, OptLevel};
use solgen_evmasm::OptimiserSettings;

/// Settings of a contract compilation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompilerSettings {
    /// The EVM version instructions are selected for.
    pub evm_version: EvmVersion,
    /// Evaluate literal operands of commutative operators last and run the assembly optimiser
    /// on the produced code.
    pub optimise: bool,
    /// Settings for the optimiser passes, used when `optimise` is set.
    pub optimiser: OptimiserSettings,
    /// Include the reason string of `require` and `revert` in the revert data.
    pub revert_strings: bool,
    /// Revert with an overflow panic on wrapping integer `+`, `-` and `*`.
    pub checked_arithmetic: bool,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilerSettings {
    /// Unoptimised settings for the default EVM version.
    pub fn new() -> Self {
        Self {
            evm_version: EvmVersion::default(),
            optimise: false,
            optimiser: OptimiserSettings::none(),
            revert_strings: true,
            checked_arithmetic: true,
        }
    }

    /// Settings for the given optimisation level.
    #[must_use]
    pub fn for_opt_level(level: OptLevel) -> Self {
        Self {
            optimise: level.is_optimizing(),
            optimiser: OptimiserSettings::for_opt_level(level),
            ..Self::new()
        }
    }

    #[must_use]
    pub fn with_evm_version(mut self, evm_version: EvmVersion) -> Self {
        self.evm_version = evm_version;
        self.optimiser.evm_version = evm_version;
        self
    }

    /// The optimiser settings for the creation or the runtime code.
    pub(crate) fn optimiser_settings(&self, is_creation: bool) -> OptimiserSettings {
        OptimiserSettings {
            evm_version: self.evm_version,
            is_creation,
            ..self.optimiser.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = CompilerSettings::default();
        assert!(!settings.optimise);
        assert!(!settings.optimiser.is_enabled());
        assert!(settings.checked_arithmetic);
    }

    #[test]
    fn test_evm_version_is_forwarded() {
        let settings =
            CompilerSettings::for_opt_level(OptLevel::O2).with_evm_version(EvmVersion::Byzantium);
        assert!(settings.optimise);
        let optimiser = settings.optimiser_settings(true);
        assert_eq!(optimiser.evm_version, EvmVersion::Byzantium);
        assert!(optimiser.is_creation);
        assert!(optimiser.run_cse);
    }
}
