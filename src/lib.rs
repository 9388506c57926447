pub mod config;
pub mod error;
pub mod flags;
pub mod ir;
pub mod lower;
pub mod op;
pub mod parallel;
pub mod parser;

pub use config::TargetDescriptor;
pub use error::{LowerError, Result};
pub use ir::{Instruction, Lowered, LoweredBlock, Mem, Operand, Reg};
pub use lower::Lowerer;
