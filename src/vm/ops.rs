/// Bytecode operations for the conch VM.
///
/// Opcodes are a single byte; their wire value is the declaration order
/// below, starting at 0. Every multi-byte immediate in the instruction
/// stream is big-endian. Operand slots are untyped at rest: the opcode
/// dictates the width read or written (1-byte `Byte`, 8-byte `QWord` /
/// float, reference-width `Ref`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    // ========================================
    // Push literals
    // ========================================
    /// 8-byte immediate, pushes a qword
    PushInt,
    /// 1-byte immediate, pushes a byte
    PushByte,
    /// 8-byte immediate (IEEE-754 bits), pushes a double
    PushFloat,
    /// 4-byte constant index, pushes the constant's heap reference
    PushString,

    // ========================================
    // Locals
    // ========================================
    /// 4-byte local offset, pushes the byte stored there
    GetByte,
    /// 4-byte local offset, pops a byte into it
    SetByte,
    /// 4-byte local offset, pushes the qword stored there
    GetQWord,
    /// 4-byte local offset, pops a qword into it
    SetQWord,
    /// 4-byte local offset, pushes the reference stored there
    GetRef,
    /// 4-byte local offset, pops a reference into it
    SetRef,

    // ========================================
    // Invocation and process control
    // ========================================
    /// 4-byte identifier constant index; calls a bytecode or native function
    Invoke,
    /// 4-byte parent-resume offset; child continues after the immediate,
    /// parent jumps to the immediate with the child pid pushed
    Fork,
    /// 1-byte argc; pops that many string refs and replaces the process image
    Exec,
    /// pops a pid, waits for it, pushes its exit status byte
    Wait,
    /// 4-byte open flags; pops a path ref, pushes the new fd as a qword
    Open,
    /// pops an fd and closes it
    Close,
    /// pops fd2 then fd1, records a restore entry, dup2(fd1, fd2), pushes fd1
    SetupRedirect,
    /// pops fd2 then fd1, dup2(fd1, fd2), pushes fd1 (no restore entry)
    Redirect,
    /// restores the most recent redirection entry
    PopRedirect,
    /// creates a pipe, pushes the read fd then the write fd
    Pipe,
    /// pops an fd, drains it to EOF, pushes the contents as a string ref
    Read,
    /// pops a string ref then an fd, writes the string, closes the fd
    Write,
    /// terminates the process with the popped byte as exit code
    Exit,

    // ========================================
    // Stack shuffles
    // ========================================
    /// duplicates the top qword-width slot
    Dup,
    /// duplicates the top byte
    DupByte,
    /// swaps the top two qword-width slots
    Swap,
    /// rotates the top three qword-width slots
    Swap2,
    PopByte,
    PopQWord,
    PopRef,

    // ========================================
    // Control flow (4-byte absolute offsets)
    // ========================================
    /// branches when the popped byte equals 1
    IfJump,
    /// branches when the popped byte equals 0
    IfNotJump,
    Jump,

    /// stops the current frame's interpretation
    Return,

    // ========================================
    // Conversions
    // ========================================
    /// sign-extends the top byte to a qword
    ByteToInt,
    /// truncates the top qword to a byte
    IntToByte,

    // ========================================
    // Arithmetic (pop b, pop a, push a OP b)
    // ========================================
    ByteXor,
    IntAdd,
    IntSub,
    IntMul,
    IntDiv,
    IntMod,
    FloatAdd,
    FloatSub,
    FloatMul,
    FloatDiv,

    // ========================================
    // Comparisons (pop b, pop a, push a CMP b as a byte)
    // ========================================
    IntEq,
    IntLt,
    IntLe,
    IntGt,
    IntGe,
    FloatEq,
    FloatLt,
    FloatLe,
    FloatGt,
    FloatGe,
}

/// Wire table: `OPS[n]` is the opcode with byte value `n`.
const OPS: [Op; 56] = [
    Op::PushInt,
    Op::PushByte,
    Op::PushFloat,
    Op::PushString,
    Op::GetByte,
    Op::SetByte,
    Op::GetQWord,
    Op::SetQWord,
    Op::GetRef,
    Op::SetRef,
    Op::Invoke,
    Op::Fork,
    Op::Exec,
    Op::Wait,
    Op::Open,
    Op::Close,
    Op::SetupRedirect,
    Op::Redirect,
    Op::PopRedirect,
    Op::Pipe,
    Op::Read,
    Op::Write,
    Op::Exit,
    Op::Dup,
    Op::DupByte,
    Op::Swap,
    Op::Swap2,
    Op::PopByte,
    Op::PopQWord,
    Op::PopRef,
    Op::IfJump,
    Op::IfNotJump,
    Op::Jump,
    Op::Return,
    Op::ByteToInt,
    Op::IntToByte,
    Op::ByteXor,
    Op::IntAdd,
    Op::IntSub,
    Op::IntMul,
    Op::IntDiv,
    Op::IntMod,
    Op::FloatAdd,
    Op::FloatSub,
    Op::FloatMul,
    Op::FloatDiv,
    Op::IntEq,
    Op::IntLt,
    Op::IntLe,
    Op::IntGt,
    Op::IntGe,
    Op::FloatEq,
    Op::FloatLt,
    Op::FloatLe,
    Op::FloatGt,
    Op::FloatGe,
];

impl Op {
    /// Decodes a wire byte, or `None` for an unknown opcode.
    pub fn decode(byte: u8) -> Option<Op> {
        OPS.get(byte as usize).copied()
    }

    /// The opcode's wire byte.
    pub fn encode(self) -> u8 {
        self as u8
    }

    /// Returns the name of the opcode for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Op::PushInt => "PushInt",
            Op::PushByte => "PushByte",
            Op::PushFloat => "PushFloat",
            Op::PushString => "PushString",
            Op::GetByte => "GetByte",
            Op::SetByte => "SetByte",
            Op::GetQWord => "GetQWord",
            Op::SetQWord => "SetQWord",
            Op::GetRef => "GetRef",
            Op::SetRef => "SetRef",
            Op::Invoke => "Invoke",
            Op::Fork => "Fork",
            Op::Exec => "Exec",
            Op::Wait => "Wait",
            Op::Open => "Open",
            Op::Close => "Close",
            Op::SetupRedirect => "SetupRedirect",
            Op::Redirect => "Redirect",
            Op::PopRedirect => "PopRedirect",
            Op::Pipe => "Pipe",
            Op::Read => "Read",
            Op::Write => "Write",
            Op::Exit => "Exit",
            Op::Dup => "Dup",
            Op::DupByte => "DupByte",
            Op::Swap => "Swap",
            Op::Swap2 => "Swap2",
            Op::PopByte => "PopByte",
            Op::PopQWord => "PopQWord",
            Op::PopRef => "PopRef",
            Op::IfJump => "IfJump",
            Op::IfNotJump => "IfNotJump",
            Op::Jump => "Jump",
            Op::Return => "Return",
            Op::ByteToInt => "ByteToInt",
            Op::IntToByte => "IntToByte",
            Op::ByteXor => "ByteXor",
            Op::IntAdd => "IntAdd",
            Op::IntSub => "IntSub",
            Op::IntMul => "IntMul",
            Op::IntDiv => "IntDiv",
            Op::IntMod => "IntMod",
            Op::FloatAdd => "FloatAdd",
            Op::FloatSub => "FloatSub",
            Op::FloatMul => "FloatMul",
            Op::FloatDiv => "FloatDiv",
            Op::IntEq => "IntEq",
            Op::IntLt => "IntLt",
            Op::IntLe => "IntLe",
            Op::IntGt => "IntGt",
            Op::IntGe => "IntGe",
            Op::FloatEq => "FloatEq",
            Op::FloatLt => "FloatLt",
            Op::FloatLe => "FloatLe",
            Op::FloatGt => "FloatGt",
            Op::FloatGe => "FloatGe",
        }
    }
}
