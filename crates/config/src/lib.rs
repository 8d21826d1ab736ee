//! Configuration shared by the solgen code generator and optimiser crates.
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
mod macros;

str_enum! {
    /// The EVM version code is generated for. Selects the available instructions and the gas
    /// prices the optimiser weighs.
    ///
    /// Versions are ordered by activation, so features are checked with comparisons.
    #[derive(Default)]
    #[strum(serialize_all = "camelCase")]
    pub enum EvmVersion {
        Homestead,
        TangerineWhistle,
        SpuriousDragon,
        Byzantium,
        Constantinople,
        Petersburg,
        Istanbul,
        Berlin,
        London,
        Paris,
        Shanghai,
        #[default]
        Cancun,
    }
}

impl EvmVersion {
    pub fn supports_returndata(self) -> bool {
        self >= Self::Byzantium
    }
    pub fn has_static_call(self) -> bool {
        self >= Self::Byzantium
    }
    pub fn has_bitwise_shifting(self) -> bool {
        self >= Self::Constantinople
    }
    pub fn has_ext_code_hash(self) -> bool {
        self >= Self::Constantinople
    }
    pub fn has_chain_id(self) -> bool {
        self >= Self::Istanbul
    }
    pub fn has_self_balance(self) -> bool {
        self >= Self::Istanbul
    }
    pub fn has_base_fee(self) -> bool {
        self >= Self::London
    }
    /// Whether `CALL` may be given more gas than is available (EIP-150).
    pub fn can_overcharge_gas_for_call(self) -> bool {
        self >= Self::TangerineWhistle
    }
}

str_enum! {
    /// Optimisation level, mapped to a selection of assembly optimiser passes.
    #[derive(Default)]
    #[strum(serialize_all = "UPPERCASE")]
    pub enum OptLevel {
        /// Only the peephole optimiser and unused tag removal.
        O0,
        /// Every pass but the inliner.
        #[default]
        O1,
        /// Every pass.
        O2,
        /// Every pass, weighing runtime gas for frequently executed code.
        O3,
    }
}

impl OptLevel {
    /// Returns true above [`O0`](Self::O0).
    #[must_use]
    pub fn is_optimizing(self) -> bool {
        self != Self::O0
    }

    /// Returns true if the assembly inliner runs at this optimization level.
    #[must_use]
    pub fn inline_enabled(self) -> bool {
        self >= Self::O2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_evm_version_round_trip_names() {
        assert_eq!(EvmVersion::TangerineWhistle.to_str(), "tangerineWhistle");
        assert_eq!(EvmVersion::from_str("byzantium").unwrap(), EvmVersion::Byzantium);
        for version in EvmVersion::iter() {
            assert_eq!(EvmVersion::from_str(version.to_str()).unwrap(), version);
        }
    }

    #[test]
    fn test_evm_version_features() {
        assert!(!EvmVersion::Homestead.has_static_call());
        assert!(EvmVersion::Byzantium.supports_returndata());
        assert!(!EvmVersion::Byzantium.has_bitwise_shifting());
        assert!(EvmVersion::Constantinople.has_bitwise_shifting());
        assert!(EvmVersion::default().has_base_fee());
        assert!(!EvmVersion::Berlin.has_base_fee());
        assert!(EvmVersion::TangerineWhistle.can_overcharge_gas_for_call());
        assert!(!EvmVersion::Homestead.can_overcharge_gas_for_call());
    }

    #[test]
    fn test_opt_level() {
        assert!(!OptLevel::O0.is_optimizing());
        assert!(!OptLevel::default().inline_enabled());
        assert!(OptLevel::O2.inline_enabled());
        assert_eq!(OptLevel::O2.to_string(), "O2");
        assert!(OptLevel::O3 > OptLevel::O1);
    }
}
