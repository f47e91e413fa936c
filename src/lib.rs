//! conch - a bytecode virtual machine for a small shell-oriented language
//!
//! This library provides the interpreter: a stack-based, frame-based
//! engine over a typed opcode stream, with a mark-sweep object heap and
//! host process integration (fork/exec/pipe/redirect/wait). Bytecode is
//! produced elsewhere; conch loads a unit image and runs its `<main>`.

pub mod config;
pub mod vm;

// Re-export commonly used types
pub use config::RuntimeConfig;
pub use vm::{load_unit, BytecodeUnit, Interpreter, Op, VmError};
