#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(test, allow(unused_crate_dependencies))]

pub mod instruction;
pub use instruction::{Instruction, InstructionInfo, Tier};

pub mod item;
pub use item::{AssemblyItem, ItemKind, JumpType, SourceLocation, Verbatim, format_items};

pub mod semantic;

pub mod gas;
pub use gas::{GasConsumption, GasCosts, GasMeter};

mod error;
pub use error::{AssemblyError, OptimiserError};

mod settings;
pub use settings::OptimiserSettings;

pub mod analysis;
pub use analysis::{ExpressionClasses, KnownState};

pub mod passes;

mod assembly;
pub use assembly::{Assembly, LinkerObject, immutable_id};

pub use solgen_config::{EvmVersion, OptLevel};
