//! Control flow and value analysis over decoded instruction segments.

pub mod cfg;
pub mod register;
pub mod stack;
pub mod value_set;

pub use cfg::{BasicBlock, BranchType, ControlFlowGraph, InstructionRef};
pub use register::register_value;
pub use stack::stack_value;
pub use value_set::{Resolution, ValueSet};
