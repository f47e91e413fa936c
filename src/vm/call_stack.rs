use super::bytecode::Function;
use super::errors::VmError;
use super::heap::ObjRef;
use super::locals::Locals;
use super::operand_stack::{OperandStack, REF_SIZE};

// =============================================================================
// Arena Layout
// =============================================================================
//
// +----------+------------+----------+------------+-----
// | locals 0 | operands 0 | locals 1 | operands 1 | ...
// +----------+------------+----------+------------+-----
//
// One contiguous byte tape holds every frame back-to-back. A frame's
// operand window starts where its locals end and may grow to the end of
// the tape until the next frame is pushed: that frame's locals begin at
// the caller's current operand top. Pushing a callee therefore pins the
// caller's operand size, and the argument block the caller just pushed
// becomes, in place, the head of the callee's locals.
//
// A parallel per-byte flag map records which slots hold heap references
// so the collector can walk every window at once without type tags.

/// Bookkeeping for one in-progress call, kept outside the tape.
#[derive(Debug)]
struct FrameHeader {
    /// Index of the executing function in the unit's function table.
    function: usize,
    /// Byte offset of the next instruction to execute.
    ip: usize,
    locals_start: usize,
    locals_size: usize,
    operands_len: usize,
}

/// A mutable view of the top frame, split out of the arena.
pub struct StackFrame<'a> {
    pub function: usize,
    pub ip: &'a mut usize,
    pub locals: Locals<'a>,
    pub operands: OperandStack<'a>,
}

/// A read view of every window below the top frame's operands, handed to
/// natives (alongside the operand view) for GC root discovery.
pub struct FrameRoots<'a> {
    frames: &'a [FrameHeader],
    top_locals: (usize, usize),
    tape: &'a [u8],
    refs: &'a [bool],
}

impl FrameRoots<'_> {
    /// Appends every flagged reference in the covered windows to `roots`.
    pub fn collect(&self, roots: &mut Vec<ObjRef>) {
        for header in self.frames {
            let ops_start = header.locals_start + header.locals_size;
            scan_region(self.tape, self.refs, header.locals_start, ops_start, roots);
            scan_region(
                self.tape,
                self.refs,
                ops_start,
                ops_start + header.operands_len,
                roots,
            );
        }
        let (start, size) = self.top_locals;
        scan_region(self.tape, self.refs, start, start + size, roots);
    }
}

fn scan_region(tape: &[u8], refs: &[bool], start: usize, end: usize, roots: &mut Vec<ObjRef>) {
    for at in start..end {
        if refs[at] {
            let mut buf = [0u8; REF_SIZE];
            buf.copy_from_slice(&tape[at..at + REF_SIZE]);
            roots.push(ObjRef::from_raw(u64::from_ne_bytes(buf) as usize));
        }
    }
}

/// The call stack: a fixed-capacity arena of stacked frames.
pub struct CallStack {
    tape: Vec<u8>,
    refs: Vec<bool>,
    frames: Vec<FrameHeader>,
}

impl CallStack {
    /// Creates an empty call stack with the given byte capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            tape: vec![0; capacity],
            refs: vec![false; capacity],
            frames: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of frames currently on the stack.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Pushes a frame for `callee`.
    ///
    /// When a caller exists, its top `parameters_byte_count` operand bytes
    /// are popped and become the head of the callee's locals in place,
    /// flags included; the rest of the locals window is zeroed. Fails with
    /// `StackOverflow` when the new frame does not fit the arena, and with
    /// `OperandStackUnderflow` when the caller's operands cannot cover the
    /// parameter block.
    pub fn push_frame(&mut self, function: usize, callee: &Function) -> Result<(), VmError> {
        let params = callee.parameters_byte_count;
        let locals_start = match self.frames.last_mut() {
            Some(caller) => {
                if caller.operands_len < params {
                    return Err(VmError::OperandStackUnderflow);
                }
                caller.operands_len -= params;
                caller.locals_start + caller.locals_size + caller.operands_len
            }
            None => {
                if params != 0 {
                    return Err(VmError::OperandStackUnderflow);
                }
                0
            }
        };

        let values_start = locals_start + callee.locals_size;
        if values_start > self.tape.len() {
            return Err(VmError::StackOverflow);
        }

        // Non-parameter locals start zeroed and unflagged.
        self.tape[locals_start + params..values_start].fill(0);
        self.refs[locals_start + params..values_start].fill(false);

        self.frames.push(FrameHeader {
            function,
            ip: 0,
            locals_start,
            locals_size: callee.locals_size,
            operands_len: 0,
        });
        Ok(())
    }

    /// Releases the top frame's space.
    pub fn pop_frame(&mut self) {
        self.frames.pop();
    }

    /// A mutable view of the top frame, or `None` when the stack is empty.
    pub fn peek_frame(&mut self) -> Option<StackFrame<'_>> {
        let header = self.frames.last_mut()?;
        let ops_start = header.locals_start + header.locals_size;
        let (lo_tape, hi_tape) = self.tape.split_at_mut(ops_start);
        let (lo_refs, hi_refs) = self.refs.split_at_mut(ops_start);
        Some(StackFrame {
            function: header.function,
            ip: &mut header.ip,
            locals: Locals::new(
                &mut lo_tape[header.locals_start..],
                &mut lo_refs[header.locals_start..],
            ),
            operands: OperandStack::new(hi_tape, hi_refs, &mut header.operands_len),
        })
    }

    /// Splits the top frame's operand view from a root-scanning view of
    /// everything below it, so a native can run the collector while
    /// holding the operands.
    pub fn split_native(&mut self) -> Option<(OperandStack<'_>, FrameRoots<'_>)> {
        let n = self.frames.len();
        if n == 0 {
            return None;
        }
        let (lower, top) = self.frames.split_at_mut(n - 1);
        let top = &mut top[0];
        let ops_start = top.locals_start + top.locals_size;
        let (lo_tape, hi_tape) = self.tape.split_at_mut(ops_start);
        let (lo_refs, hi_refs) = self.refs.split_at_mut(ops_start);
        Some((
            OperandStack::new(hi_tape, hi_refs, &mut top.operands_len),
            FrameRoots {
                frames: lower,
                top_locals: (top.locals_start, top.locals_size),
                tape: lo_tape,
                refs: lo_refs,
            },
        ))
    }

    /// Appends every reference held by any live frame's locals or
    /// operands to `roots`. Used at interpreter safe points.
    pub fn collect_roots(&self, roots: &mut Vec<ObjRef>) {
        for header in &self.frames {
            let ops_start = header.locals_start + header.locals_size;
            scan_region(&self.tape, &self.refs, header.locals_start, ops_start, roots);
            scan_region(
                &self.tape,
                &self.refs,
                ops_start,
                ops_start + header.operands_len,
                roots,
            );
        }
    }
}
