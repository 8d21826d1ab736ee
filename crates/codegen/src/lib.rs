#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(test, allow(unused_crate_dependencies))]

pub use rustc_hash::FxHashMap;

pub mod ast;
pub use ast::Ast;

pub mod types;
pub use types::{DataLocation, Type, selector};

mod error;
pub use error::{CompileError, Result};

mod settings;
pub use settings::CompilerSettings;

pub mod panic;
pub use panic::PanicCode;

pub mod context;
pub use context::{Callable, CompilerContext, LowLevelFunction};

pub mod utils;
pub use utils::CompilerUtils;

pub mod array_utils;
pub use array_utils::ArrayUtils;

pub mod lvalue;
pub use lvalue::LValue;

pub mod expr;
pub use expr::ExpressionCompiler;

pub mod stmt;
pub use stmt::StatementCompiler;

pub mod contract;
pub use contract::{CompiledContract, ContractCompiler, ExternalFunction};
