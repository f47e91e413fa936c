use std::fmt;

/// Error type for everything that can go wrong while executing a unit.
///
/// All variants are fatal to the current unit: they unwind out of the
/// interpreter loop and are reported by the driver. `RuntimeException` is
/// the one user-raised variant (via `std::panic`); the driver maps it to
/// the panic exit code instead of a diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    /// Unknown opcode or malformed immediate
    InvalidBytecode(String),
    /// Structurally broken unit (missing `<main>`, size mismatches)
    InvalidBytecodeStructure(String),
    /// `INVOKE` identifier resolves to neither bytecode nor native
    FunctionNotFound(String),
    /// Pop past the start of the current operand window
    OperandStackUnderflow,
    /// Push past the call-stack arena capacity
    StackOverflow,
    /// Locals access beyond the declared locals size
    LocalsOutOfBound(String),
    /// Integer division or modulo by zero
    ArithmeticError(String),
    /// Raised by `std::panic`; carries the user message
    RuntimeException(String),
}

impl VmError {
    /// Returns the error kind name used in driver diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            VmError::InvalidBytecode(_) => "InvalidBytecode",
            VmError::InvalidBytecodeStructure(_) => "InvalidBytecodeStructure",
            VmError::FunctionNotFound(_) => "FunctionNotFound",
            VmError::OperandStackUnderflow => "OperandStackUnderflow",
            VmError::StackOverflow => "StackOverflow",
            VmError::LocalsOutOfBound(_) => "LocalsOutOfBound",
            VmError::ArithmeticError(_) => "ArithmeticError",
            VmError::RuntimeException(_) => "RuntimeException",
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::InvalidBytecode(msg) => write!(f, "invalid bytecode: {}", msg),
            VmError::InvalidBytecodeStructure(msg) => write!(f, "invalid bytecode structure: {}", msg),
            VmError::FunctionNotFound(name) => write!(f, "could not find function {}", name),
            VmError::OperandStackUnderflow => write!(f, "operand stack is empty"),
            VmError::StackOverflow => write!(f, "exceeded stack capacity"),
            VmError::LocalsOutOfBound(msg) => write!(f, "locals out of bound: {}", msg),
            VmError::ArithmeticError(msg) => write!(f, "{}", msg),
            VmError::RuntimeException(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for VmError {}
