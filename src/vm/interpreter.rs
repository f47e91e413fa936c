//! The interpreter: fetch/decode/dispatch over the current frame.
//!
//! The outer loop (`run_function`) drives whole frames: it runs the top
//! frame until it either returns (explicit `Return` or the instruction
//! pointer walking off the end) or suspends by pushing a callee's frame.
//! On return, the frame's declared return bytes move to the caller's
//! operand stack. The inner loop (`step`) executes one opcode at a time,
//! which makes every instruction boundary a GC safe point.

use std::os::unix::io::RawFd;

use super::bytecode::{BytecodeUnit, ConstantIndex};
use super::call_stack::CallStack;
use super::errors::VmError;
use super::heap::Heap;
use super::natives::{default_natives, NativeFn, NativeRegistry, RuntimeMemory};
use super::operand_stack::QWORD_SIZE;
use super::ops::Op;
use super::process::{self, FdTable, ForkResult};
use crate::config::RuntimeConfig;

/// Why the inner loop handed control back for the current frame.
#[derive(Debug, PartialEq, Eq)]
enum FrameOutcome {
    /// The frame ended; its return bytes await transfer to the caller.
    Returned,
    /// A bytecode callee's frame was pushed; the top of stack changed.
    Invoked,
}

/// What a single executed opcode asks of the frame loop.
enum Flow {
    Continue,
    Return,
    Invoke(ConstantIndex),
}

/// The virtual machine state for one unit execution.
pub struct Interpreter {
    call_stack: CallStack,
    heap: Heap,
    natives: NativeRegistry,
    redirections: FdTable,
}

impl Interpreter {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            call_stack: CallStack::new(config.call_stack_capacity),
            heap: Heap::with_config(config.gc_enabled, config.trace_gc),
            natives: default_natives(),
            redirections: FdTable::new(),
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Registers an additional native, shadowing any previous binding of
    /// the same qualified name.
    pub fn register_native(&mut self, name: &str, function: NativeFn) {
        self.natives.register(name, function);
    }

    /// Runs the unit's `<main>` entry point to completion and returns its
    /// return bytes.
    pub fn run(&mut self, unit: &BytecodeUnit) -> Result<Vec<u8>, VmError> {
        let entry = unit.entry_point()?;
        self.run_function(unit, entry)
    }

    /// Runs `entry` as the root frame and returns its return bytes.
    pub fn run_function(&mut self, unit: &BytecodeUnit, entry: usize) -> Result<Vec<u8>, VmError> {
        self.call_stack.push_frame(entry, unit.function(entry))?;

        loop {
            match self.run_frame(unit)? {
                FrameOutcome::Invoked => continue,
                FrameOutcome::Returned => {
                    let (bytes, flags) = {
                        let mut frame = self.call_stack.peek_frame().unwrap();
                        let returned = unit.function(frame.function).return_byte_count;
                        let (bytes, flags) = frame.operands.pop_bytes(returned)?;
                        (bytes.to_vec(), flags.to_vec())
                    };

                    self.call_stack.pop_frame();

                    if self.call_stack.is_empty() {
                        // The root function has returned.
                        return Ok(bytes);
                    }
                    let mut caller = self.call_stack.peek_frame().unwrap();
                    caller.operands.push_bytes(&bytes, &flags)?;
                }
            }
        }
    }

    /// Runs the top frame until it returns or pushes a callee's frame.
    fn run_frame(&mut self, unit: &BytecodeUnit) -> Result<FrameOutcome, VmError> {
        loop {
            // Safe point: between opcodes, with no frame view held.
            if self.heap.should_gc() {
                self.collect_garbage(unit);
            }

            match self.step(unit)? {
                Flow::Continue => {}
                Flow::Return => return Ok(FrameOutcome::Returned),
                Flow::Invoke(identifier_idx) => {
                    if self.invoke(unit, identifier_idx)? {
                        return Ok(FrameOutcome::Invoked);
                    }
                }
            }
        }
    }

    /// Mark-sweep rooted in the constant pool and every live window.
    fn collect_garbage(&mut self, unit: &BytecodeUnit) {
        let mut roots = unit.pool.roots().to_vec();
        self.call_stack.collect_roots(&mut roots);
        self.heap.collect(&roots);
    }

    /// Resolves and performs an `Invoke`.
    ///
    /// Bytecode functions shadow natives: if the identifier is in the
    /// unit's table, the callee's frame is pushed (returning `true`, which
    /// suspends the caller); a native runs inline to completion.
    fn invoke(&mut self, unit: &BytecodeUnit, identifier_idx: ConstantIndex) -> Result<bool, VmError> {
        let identifier_ref = unit.pool.get_ref(identifier_idx)?;
        let identifier = self.heap.string(identifier_ref)?.to_string();

        if let Some(callee) = unit.find(&identifier) {
            self.call_stack.push_frame(callee, unit.function(callee))?;
            return Ok(true);
        }

        let Some(native) = self.natives.get(&identifier) else {
            return Err(VmError::FunctionNotFound(identifier));
        };
        let (mut operands, frame_roots) = self.call_stack.split_native().unwrap();
        let mut mem = RuntimeMemory {
            heap: &mut self.heap,
            pool: &unit.pool,
            frame_roots,
        };
        native(&mut operands, &mut mem)?;
        Ok(false)
    }

    /// Executes a single opcode of the top frame.
    fn step(&mut self, unit: &BytecodeUnit) -> Result<Flow, VmError> {
        let frame = self.call_stack.peek_frame().unwrap();
        let function = unit.function(frame.function);
        let code = function.instructions.as_slice();

        if *frame.ip >= code.len() {
            // Walking off the end of the function ends the frame.
            return Ok(Flow::Return);
        }

        let byte = code[*frame.ip];
        *frame.ip += 1;
        let op = Op::decode(byte)
            .ok_or_else(|| VmError::InvalidBytecode(format!("unknown opcode {}", byte)))?;

        let ip = frame.ip;
        let mut locals = frame.locals;
        let mut operands = frame.operands;

        match op {
            // ========================================
            // Push literals
            // ========================================
            Op::PushInt => {
                let value = read_u64(code, ip)? as i64;
                operands.push_int(value)?;
            }
            Op::PushByte => {
                let value = read_u8(code, ip)? as i8;
                operands.push_byte(value)?;
            }
            Op::PushFloat => {
                let bits = read_u64(code, ip)?;
                operands.push_double(f64::from_bits(bits))?;
            }
            Op::PushString => {
                let index = read_u32(code, ip)?;
                let constant = unit.pool.get_ref(index)?;
                operands.push_ref(constant)?;
            }

            // ========================================
            // Locals
            // ========================================
            Op::GetByte => {
                let at = read_u32(code, ip)? as usize;
                operands.push_byte(locals.get_byte(at)?)?;
            }
            Op::SetByte => {
                let at = read_u32(code, ip)? as usize;
                let value = operands.pop_byte()?;
                locals.set_byte(at, value)?;
            }
            Op::GetQWord => {
                let at = read_u32(code, ip)? as usize;
                operands.push_int(locals.get_qword(at)?)?;
            }
            Op::SetQWord => {
                let at = read_u32(code, ip)? as usize;
                let value = operands.pop_int()?;
                locals.set_qword(at, value)?;
            }
            Op::GetRef => {
                let at = read_u32(code, ip)? as usize;
                operands.push_ref(locals.get_ref(at)?)?;
            }
            Op::SetRef => {
                let at = read_u32(code, ip)? as usize;
                let value = operands.pop_ref()?;
                locals.set_ref(at, value)?;
            }

            // ========================================
            // Invocation and process control
            // ========================================
            Op::Invoke => {
                let identifier_idx = read_u32(code, ip)?;
                return Ok(Flow::Invoke(identifier_idx));
            }
            Op::Fork => {
                let parent_jump = read_u32(code, ip)? as usize;
                match process::fork() {
                    Err(err) => process::fatal("fork", err, process::EX_OSERR),
                    // The child continues at the next instruction.
                    Ok(ForkResult::Child) => {}
                    Ok(ForkResult::Parent { child }) => {
                        *ip = parent_jump;
                        operands.push_int(child as i64)?;
                    }
                }
            }
            Op::Exec => {
                let argc = read_u8(code, ip)? as usize;
                let mut argv = vec![String::new(); argc];
                for slot in argv.iter_mut().rev() {
                    let arg = operands.pop_ref()?;
                    *slot = self.heap.string(arg)?.to_string();
                }
                let err = process::exec(&argv);
                eprintln!("execvp: {}", err);
                std::process::exit(process::COMMAND_NOT_RUNNABLE);
            }
            Op::Wait => {
                let pid = operands.pop_int()? as libc::pid_t;
                let status = match process::wait_pid(pid) {
                    Ok(status) => status,
                    Err(err) => {
                        eprintln!("waitpid: {}", err);
                        0
                    }
                };
                operands.push_byte(status as i8)?;
            }
            Op::Open => {
                let path_ref = operands.pop_ref()?;
                let flags = read_u32(code, ip)? as i32;
                let path = self.heap.string(path_ref)?;
                let fd = match process::open(path, flags) {
                    Ok(fd) => fd,
                    Err(err) => process::fatal("open", err, process::EX_IOERR),
                };
                operands.push_int(fd as i64)?;
            }
            Op::Close => {
                let fd = operands.pop_int()? as RawFd;
                process::close(fd);
            }
            Op::SetupRedirect => {
                let fd2 = operands.pop_int()? as RawFd;
                let fd1 = operands.pop_int()? as RawFd;
                if let Err(err) = self.redirections.push_redirection(fd1, fd2) {
                    process::fatal("dup2", err, process::EX_OSERR);
                }
                operands.push_int(fd1 as i64)?;
            }
            Op::Redirect => {
                let fd2 = operands.pop_int()? as RawFd;
                let fd1 = operands.pop_int()? as RawFd;
                if let Err(err) = process::dup2(fd1, fd2) {
                    process::fatal("dup2", err, process::EX_OSERR);
                }
                operands.push_int(fd1 as i64)?;
            }
            Op::PopRedirect => {
                self.redirections.pop_redirection();
            }
            Op::Pipe => {
                let (read_fd, write_fd) = match process::pipe() {
                    Ok(fds) => fds,
                    Err(err) => process::fatal("pipe", err, process::EX_OSERR),
                };
                operands.push_int(read_fd as i64)?;
                operands.push_int(write_fd as i64)?;
            }
            Op::Read => {
                let fd = operands.pop_int()? as RawFd;
                let data = match process::read_to_end(fd) {
                    Ok(data) => data,
                    Err(err) => process::fatal("read", err, process::EX_IOERR),
                };
                let mut text = String::from_utf8_lossy(&data).into_owned();
                if text.ends_with('\n') {
                    text.pop();
                }
                let r = self.heap.alloc_string(text);
                operands.push_ref(r)?;
            }
            Op::Write => {
                let text_ref = operands.pop_ref()?;
                let fd = operands.pop_int()? as RawFd;
                let text = self.heap.string(text_ref)?;
                if let Err(err) = process::write_all(fd, text.as_bytes()) {
                    process::fatal("write", err, process::EX_IOERR);
                }
                process::close(fd);
            }
            Op::Exit => {
                let code = operands.pop_byte()?;
                std::process::exit((code as u8) as i32);
            }

            // ========================================
            // Stack shuffles (qword-width slots carry their ref flag)
            // ========================================
            Op::Dup => {
                let (value, flags) = pop_slot(&mut operands)?;
                operands.push_bytes(&value, &flags)?;
                operands.push_bytes(&value, &flags)?;
            }
            Op::DupByte => {
                let value = operands.pop_byte()?;
                operands.push_byte(value)?;
                operands.push_byte(value)?;
            }
            Op::Swap => {
                let (a, fa) = pop_slot(&mut operands)?;
                let (b, fb) = pop_slot(&mut operands)?;
                operands.push_bytes(&a, &fa)?;
                operands.push_bytes(&b, &fb)?;
            }
            Op::Swap2 => {
                let (a, fa) = pop_slot(&mut operands)?;
                let (b, fb) = pop_slot(&mut operands)?;
                let (c, fc) = pop_slot(&mut operands)?;
                operands.push_bytes(&b, &fb)?;
                operands.push_bytes(&a, &fa)?;
                operands.push_bytes(&c, &fc)?;
            }
            Op::PopByte => {
                operands.pop_byte()?;
            }
            Op::PopQWord => {
                operands.pop_int()?;
            }
            Op::PopRef => {
                operands.pop_ref()?;
            }

            // ========================================
            // Control flow
            // ========================================
            Op::IfJump => {
                let target = read_u32(code, ip)? as usize;
                if operands.pop_byte()? == 1 {
                    *ip = target;
                }
            }
            Op::IfNotJump => {
                let target = read_u32(code, ip)? as usize;
                if operands.pop_byte()? == 0 {
                    *ip = target;
                }
            }
            Op::Jump => {
                *ip = read_u32(code, ip)? as usize;
            }

            Op::Return => return Ok(Flow::Return),

            // ========================================
            // Conversions
            // ========================================
            Op::ByteToInt => {
                let value = operands.pop_byte()?;
                operands.push_int(value as i64)?;
            }
            Op::IntToByte => {
                let value = operands.pop_int()?;
                operands.push_byte(value as i8)?;
            }

            // ========================================
            // Arithmetic
            // ========================================
            Op::ByteXor => {
                let a = operands.pop_byte()?;
                let b = operands.pop_byte()?;
                operands.push_byte(a ^ b)?;
            }
            Op::IntAdd | Op::IntSub | Op::IntMul | Op::IntDiv | Op::IntMod => {
                let b = operands.pop_int()?;
                let a = operands.pop_int()?;
                operands.push_int(int_arithmetic(op, a, b)?)?;
            }
            Op::FloatAdd | Op::FloatSub | Op::FloatMul | Op::FloatDiv => {
                let b = operands.pop_double()?;
                let a = operands.pop_double()?;
                operands.push_double(float_arithmetic(op, a, b))?;
            }

            // ========================================
            // Comparisons
            // ========================================
            Op::IntEq | Op::IntLt | Op::IntLe | Op::IntGt | Op::IntGe => {
                let b = operands.pop_int()?;
                let a = operands.pop_int()?;
                operands.push_byte(int_comparison(op, a, b) as i8)?;
            }
            Op::FloatEq | Op::FloatLt | Op::FloatLe | Op::FloatGt | Op::FloatGe => {
                let b = operands.pop_double()?;
                let a = operands.pop_double()?;
                operands.push_byte(float_comparison(op, a, b) as i8)?;
            }
        }

        Ok(Flow::Continue)
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new(&RuntimeConfig::default())
    }
}

/// Pops one qword-width slot together with its ref flags.
fn pop_slot(
    operands: &mut super::operand_stack::OperandStack<'_>,
) -> Result<([u8; QWORD_SIZE], [bool; QWORD_SIZE]), VmError> {
    let mut value = [0u8; QWORD_SIZE];
    let mut flags = [false; QWORD_SIZE];
    let (bytes, refs) = operands.pop_bytes(QWORD_SIZE)?;
    value.copy_from_slice(bytes);
    flags.copy_from_slice(refs);
    Ok((value, flags))
}

fn int_arithmetic(op: Op, a: i64, b: i64) -> Result<i64, VmError> {
    match op {
        Op::IntAdd => Ok(a.wrapping_add(b)),
        Op::IntSub => Ok(a.wrapping_sub(b)),
        Op::IntMul => Ok(a.wrapping_mul(b)),
        Op::IntDiv => {
            if b == 0 {
                return Err(VmError::ArithmeticError(
                    "integer division by zero".to_string(),
                ));
            }
            Ok(a.wrapping_div(b))
        }
        Op::IntMod => {
            if b == 0 {
                return Err(VmError::ArithmeticError(
                    "integer modulo by zero".to_string(),
                ));
            }
            Ok(a.wrapping_rem(b))
        }
        _ => unreachable!("not an integer arithmetic opcode"),
    }
}

fn float_arithmetic(op: Op, a: f64, b: f64) -> f64 {
    match op {
        Op::FloatAdd => a + b,
        Op::FloatSub => a - b,
        Op::FloatMul => a * b,
        Op::FloatDiv => a / b,
        _ => unreachable!("not a float arithmetic opcode"),
    }
}

fn int_comparison(op: Op, a: i64, b: i64) -> bool {
    match op {
        Op::IntEq => a == b,
        Op::IntLt => a < b,
        Op::IntLe => a <= b,
        Op::IntGt => a > b,
        Op::IntGe => a >= b,
        _ => unreachable!("not an integer comparison opcode"),
    }
}

fn float_comparison(op: Op, a: f64, b: f64) -> bool {
    match op {
        Op::FloatEq => a == b,
        Op::FloatLt => a < b,
        Op::FloatLe => a <= b,
        Op::FloatGt => a > b,
        Op::FloatGe => a >= b,
        _ => unreachable!("not a float comparison opcode"),
    }
}

// =============================================================================
// Immediate decoding (big-endian)
// =============================================================================

fn read_u8(code: &[u8], ip: &mut usize) -> Result<u8, VmError> {
    let byte = *code
        .get(*ip)
        .ok_or_else(|| VmError::InvalidBytecode("truncated immediate".to_string()))?;
    *ip += 1;
    Ok(byte)
}

fn read_u32(code: &[u8], ip: &mut usize) -> Result<u32, VmError> {
    let end = *ip + 4;
    let bytes = code
        .get(*ip..end)
        .ok_or_else(|| VmError::InvalidBytecode("truncated immediate".to_string()))?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    *ip = end;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(code: &[u8], ip: &mut usize) -> Result<u64, VmError> {
    let end = *ip + 8;
    let bytes = code
        .get(*ip..end)
        .ok_or_else(|| VmError::InvalidBytecode("truncated immediate".to_string()))?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    *ip = end;
    Ok(u64::from_be_bytes(buf))
}
