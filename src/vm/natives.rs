//! Host-implemented standard library functions.
//!
//! A native is invoked inline by `Invoke` when the identifier misses the
//! unit's function table. It receives the caller's operand stack and the
//! runtime memory handle, pops its arguments and pushes its result within
//! one dispatch step; natives never suspend. The registry maps the exact
//! qualified name found in the constant pool to the implementation.

use std::collections::HashMap;
use std::io::BufRead;

use super::bytecode::ConstantPool;
use super::call_stack::FrameRoots;
use super::errors::VmError;
use super::heap::{Heap, ObjData, ObjRef};
use super::operand_stack::OperandStack;
use super::process;

/// What a native can reach besides the caller's operands: the heap, the
/// unit's constants, and a root view of the suspended frames so a
/// collection can run mid-call.
pub struct RuntimeMemory<'a> {
    pub heap: &'a mut Heap,
    pub pool: &'a ConstantPool,
    pub frame_roots: FrameRoots<'a>,
}

impl RuntimeMemory<'_> {
    /// Runs a mark-sweep cycle rooted in the constants, every suspended
    /// frame, and the operand stack handed alongside this handle.
    pub fn run_gc(&mut self, operands: &OperandStack<'_>) {
        let mut roots = self.pool.roots().to_vec();
        self.frame_roots.collect(&mut roots);
        operands.collect_refs(&mut roots);
        self.heap.collect(&roots);
    }
}

pub type NativeFn = fn(&mut OperandStack<'_>, &mut RuntimeMemory<'_>) -> Result<(), VmError>;

/// Mapping from qualified function name to host implementation.
#[derive(Default)]
pub struct NativeRegistry {
    entries: HashMap<String, NativeFn>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, function: NativeFn) {
        self.entries.insert(name.to_string(), function);
    }

    pub fn get(&self, name: &str) -> Option<NativeFn> {
        self.entries.get(name).copied()
    }
}

/// The standard registry every interpreter starts from.
pub fn default_natives() -> NativeRegistry {
    let mut registry = NativeRegistry::new();

    registry.register("lang::Int::to_string", int_to_string);
    registry.register("lang::Float::to_string", float_to_string);
    registry.register("lang::Float::ceil", float_ceil);
    registry.register("lang::Float::floor", float_floor);
    registry.register("lang::Float::round", float_round);
    registry.register("std::parse_int_radix", parse_int_radix);

    registry.register("lang::String::concat", str_concat);
    registry.register("lang::String::eq", str_eq);
    registry.register("lang::String::split", str_split);
    registry.register("lang::String::bytes", str_bytes);

    registry.register("std::new_vec", new_vec);
    registry.register("lang::Vec::len", vec_len);
    registry.register("lang::Vec::push", vec_push);
    registry.register("lang::Vec::pop", vec_pop);
    registry.register("lang::Vec::pop_head", vec_pop_head);
    registry.register("lang::Vec::[]", vec_index);
    registry.register("lang::Vec::[]=", vec_index_set);

    registry.register("std::env", env);
    registry.register("std::set_env", set_env);
    registry.register("std::read_line", read_line);
    registry.register("std::exit", exit);
    registry.register("std::panic", panic);
    registry.register("std::program_arguments", program_arguments);

    registry.register("std::some", some);
    registry.register("std::none", none);

    registry.register("std::empty_operands", empty_operands);
    registry.register("std::memory::gc", memory_gc);

    registry
}

// =============================================================================
// Numeric
// =============================================================================

fn int_to_string(
    operands: &mut OperandStack<'_>,
    mem: &mut RuntimeMemory<'_>,
) -> Result<(), VmError> {
    let value = operands.pop_int()?;
    let r = mem.heap.alloc_string(value.to_string());
    operands.push_ref(r)
}

fn float_to_string(
    operands: &mut OperandStack<'_>,
    mem: &mut RuntimeMemory<'_>,
) -> Result<(), VmError> {
    let value = operands.pop_double()?;
    let r = mem.heap.alloc_string(value.to_string());
    operands.push_ref(r)
}

fn float_ceil(operands: &mut OperandStack<'_>, _: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    let value = operands.pop_double()?;
    operands.push_int(value.ceil() as i64)
}

fn float_floor(operands: &mut OperandStack<'_>, _: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    let value = operands.pop_double()?;
    operands.push_int(value.floor() as i64)
}

fn float_round(operands: &mut OperandStack<'_>, _: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    let value = operands.pop_double()?;
    operands.push_int(value.round() as i64)
}

/// Parses a string in the given radix, leaving a boxed int reference on
/// success and the null reference on failure.
fn parse_int_radix(
    operands: &mut OperandStack<'_>,
    mem: &mut RuntimeMemory<'_>,
) -> Result<(), VmError> {
    let radix = operands.pop_int()?;
    let text_ref = operands.pop_ref()?;
    if !(2..=36).contains(&radix) {
        return Err(VmError::RuntimeException(format!(
            "parse_int_radix: invalid radix {}",
            radix
        )));
    }
    let text = mem.heap.string(text_ref)?;
    match i64::from_str_radix(text, radix as u32) {
        Ok(value) => {
            let r = mem.heap.emplace(ObjData::Int(value));
            operands.push_ref(r)
        }
        Err(_) => operands.push_ref(ObjRef::NULL),
    }
}

// =============================================================================
// Strings
// =============================================================================

fn str_concat(operands: &mut OperandStack<'_>, mem: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    let right_ref = operands.pop_ref()?;
    let left_ref = operands.pop_ref()?;

    let mut result = mem.heap.string(left_ref)?.to_string();
    result.push_str(mem.heap.string(right_ref)?);

    let r = mem.heap.alloc_string(result);
    operands.push_ref(r)
}

fn str_eq(operands: &mut OperandStack<'_>, mem: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    let b = operands.pop_ref()?;
    let a = operands.pop_ref()?;
    let equal = mem.heap.string(a)? == mem.heap.string(b)?;
    operands.push_byte(equal as i8)
}

fn str_split(operands: &mut OperandStack<'_>, mem: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    let delimiter_ref = operands.pop_ref()?;
    let text_ref = operands.pop_ref()?;

    let delimiter = mem.heap.string(delimiter_ref)?.to_string();
    if delimiter.is_empty() {
        return Err(VmError::RuntimeException(
            "split: empty delimiter".to_string(),
        ));
    }
    let parts: Vec<String> = mem
        .heap
        .string(text_ref)?
        .split(&delimiter)
        .map(str::to_string)
        .collect();

    let items: Vec<ObjRef> = parts
        .into_iter()
        .map(|part| mem.heap.alloc_string(part))
        .collect();
    let r = mem.heap.emplace(ObjData::Vec(items));
    operands.push_ref(r)
}

fn str_bytes(operands: &mut OperandStack<'_>, mem: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    let text_ref = operands.pop_ref()?;
    let bytes: Vec<u8> = mem.heap.string(text_ref)?.bytes().collect();
    let items: Vec<ObjRef> = bytes
        .into_iter()
        .map(|b| mem.heap.emplace(ObjData::Int(b as i64)))
        .collect();
    let r = mem.heap.emplace(ObjData::Vec(items));
    operands.push_ref(r)
}

// =============================================================================
// Vectors
// =============================================================================

fn new_vec(operands: &mut OperandStack<'_>, mem: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    let r = mem.heap.emplace(ObjData::Vec(Vec::new()));
    operands.push_ref(r)
}

fn vec_len(operands: &mut OperandStack<'_>, mem: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    let vec_ref = operands.pop_ref()?;
    let len = mem.heap.vec(vec_ref)?.len();
    operands.push_int(len as i64)
}

fn vec_push(operands: &mut OperandStack<'_>, mem: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    let value = operands.pop_ref()?;
    let vec_ref = operands.pop_ref()?;
    mem.heap.vec_mut(vec_ref)?.push(value);
    Ok(())
}

fn vec_pop(operands: &mut OperandStack<'_>, mem: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    let vec_ref = operands.pop_ref()?;
    match mem.heap.vec_mut(vec_ref)?.pop() {
        Some(value) => operands.push_ref(value),
        None => Err(VmError::RuntimeException(
            "pop on an empty vector".to_string(),
        )),
    }
}

fn vec_pop_head(
    operands: &mut OperandStack<'_>,
    mem: &mut RuntimeMemory<'_>,
) -> Result<(), VmError> {
    let vec_ref = operands.pop_ref()?;
    let items = mem.heap.vec_mut(vec_ref)?;
    if items.is_empty() {
        return Err(VmError::RuntimeException(
            "pop_head on an empty vector".to_string(),
        ));
    }
    let value = items.remove(0);
    operands.push_ref(value)
}

fn vec_index(operands: &mut OperandStack<'_>, mem: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    let index = operands.pop_int()?;
    let vec_ref = operands.pop_ref()?;
    let items = mem.heap.vec(vec_ref)?;
    let value = usize::try_from(index)
        .ok()
        .and_then(|at| items.get(at).copied())
        .ok_or_else(|| {
            VmError::RuntimeException(format!(
                "vector index {} out of bounds (len {})",
                index,
                items.len()
            ))
        })?;
    operands.push_ref(value)
}

fn vec_index_set(
    operands: &mut OperandStack<'_>,
    mem: &mut RuntimeMemory<'_>,
) -> Result<(), VmError> {
    let value = operands.pop_ref()?;
    let index = operands.pop_int()?;
    let vec_ref = operands.pop_ref()?;
    let items = mem.heap.vec_mut(vec_ref)?;
    let len = items.len();
    let slot = usize::try_from(index)
        .ok()
        .and_then(|at| items.get_mut(at))
        .ok_or_else(|| {
            VmError::RuntimeException(format!(
                "vector index {} out of bounds (len {})",
                index, len
            ))
        })?;
    *slot = value;
    Ok(())
}

// =============================================================================
// Environment and process
// =============================================================================

fn env(operands: &mut OperandStack<'_>, mem: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    let name_ref = operands.pop_ref()?;
    let name = mem.heap.string(name_ref)?.to_string();
    match std::env::var(&name) {
        Ok(value) => {
            let r = mem.heap.alloc_string(value);
            operands.push_ref(r)
        }
        Err(_) => operands.push_ref(ObjRef::NULL),
    }
}

fn set_env(operands: &mut OperandStack<'_>, mem: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    let value_ref = operands.pop_ref()?;
    let name_ref = operands.pop_ref()?;
    let value = mem.heap.string(value_ref)?.to_string();
    let name = mem.heap.string(name_ref)?.to_string();
    std::env::set_var(name, value);
    Ok(())
}

fn read_line(operands: &mut OperandStack<'_>, mem: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|err| VmError::RuntimeException(format!("read_line: {}", err)))?;
    if line.ends_with('\n') {
        line.pop();
    }
    let r = mem.heap.alloc_string(line);
    operands.push_ref(r)
}

fn exit(operands: &mut OperandStack<'_>, _: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    let code = operands.pop_byte()?;
    std::process::exit((code as u8) as i32)
}

fn panic(operands: &mut OperandStack<'_>, mem: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    let message_ref = operands.pop_ref()?;
    let message = mem.heap.string(message_ref)?.to_string();
    Err(VmError::RuntimeException(message))
}

fn program_arguments(
    operands: &mut OperandStack<'_>,
    mem: &mut RuntimeMemory<'_>,
) -> Result<(), VmError> {
    let bytes = process::cmdline_bytes()
        .map_err(|err| VmError::RuntimeException(format!("program_arguments: {}", err)))?;
    let items: Vec<ObjRef> = bytes
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| {
            let arg = String::from_utf8_lossy(arg).into_owned();
            mem.heap.alloc_string(arg)
        })
        .collect();
    let r = mem.heap.emplace(ObjData::Vec(items));
    operands.push_ref(r)
}

// =============================================================================
// Option helpers and introspection
// =============================================================================

/// `some` wraps an already-boxed value: the reference on the stack is the
/// option itself.
fn some(_: &mut OperandStack<'_>, _: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    Ok(())
}

fn none(operands: &mut OperandStack<'_>, _: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    operands.push_ref(ObjRef::NULL)
}

/// Compiler sanity probe: fails unless the operand stack is empty.
fn empty_operands(
    operands: &mut OperandStack<'_>,
    _: &mut RuntimeMemory<'_>,
) -> Result<(), VmError> {
    if operands.size() != 0 {
        return Err(VmError::RuntimeException(format!(
            "operand stack is not empty: {} bytes remain",
            operands.size()
        )));
    }
    Ok(())
}

fn memory_gc(operands: &mut OperandStack<'_>, mem: &mut RuntimeMemory<'_>) -> Result<(), VmError> {
    mem.run_gc(operands);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::bytecode::Function;
    use crate::vm::call_stack::CallStack;

    fn scratch_frame() -> (CallStack, Heap, ConstantPool) {
        let mut stack = CallStack::new(1024);
        stack
            .push_frame(
                0,
                &Function {
                    identifier: "test::<main>".to_string(),
                    locals_size: 0,
                    parameters_byte_count: 0,
                    return_byte_count: 0,
                    instructions: Vec::new(),
                },
            )
            .unwrap();
        (stack, Heap::new(), ConstantPool::new(Vec::new()))
    }

    fn with_native<R>(
        stack: &mut CallStack,
        heap: &mut Heap,
        pool: &ConstantPool,
        run: impl FnOnce(&mut OperandStack<'_>, &mut RuntimeMemory<'_>) -> R,
    ) -> R {
        let (mut operands, frame_roots) = stack.split_native().unwrap();
        let mut mem = RuntimeMemory {
            heap,
            pool,
            frame_roots,
        };
        run(&mut operands, &mut mem)
    }

    #[test]
    fn test_int_to_string() {
        let (mut stack, mut heap, pool) = scratch_frame();
        let result = with_native(&mut stack, &mut heap, &pool, |operands, mem| {
            operands.push_int(-42).unwrap();
            int_to_string(operands, mem).unwrap();
            operands.pop_ref().unwrap()
        });
        assert_eq!(heap.string(result).unwrap(), "-42");
    }

    #[test]
    fn test_str_concat_and_eq() {
        let (mut stack, mut heap, pool) = scratch_frame();
        let foo = heap.alloc_string("foo".to_string());
        let bar = heap.alloc_string("bar".to_string());

        let result = with_native(&mut stack, &mut heap, &pool, |operands, mem| {
            operands.push_ref(foo).unwrap();
            operands.push_ref(bar).unwrap();
            str_concat(operands, mem).unwrap();
            operands.pop_ref().unwrap()
        });
        assert_eq!(heap.string(result).unwrap(), "foobar");

        let expected = heap.alloc_string("foobar".to_string());
        let equal = with_native(&mut stack, &mut heap, &pool, |operands, mem| {
            operands.push_ref(result).unwrap();
            operands.push_ref(expected).unwrap();
            str_eq(operands, mem).unwrap();
            operands.pop_byte().unwrap()
        });
        assert_eq!(equal, 1);
    }

    #[test]
    fn test_str_split() {
        let (mut stack, mut heap, pool) = scratch_frame();
        let text = heap.alloc_string("a:b:c".to_string());
        let delim = heap.alloc_string(":".to_string());

        let parts = with_native(&mut stack, &mut heap, &pool, |operands, mem| {
            operands.push_ref(text).unwrap();
            operands.push_ref(delim).unwrap();
            str_split(operands, mem).unwrap();
            operands.pop_ref().unwrap()
        });

        let items = heap.vec(parts).unwrap().clone();
        let values: Vec<&str> = items.iter().map(|r| heap.string(*r).unwrap()).collect();
        assert_eq!(values, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_parse_int_radix() {
        let (mut stack, mut heap, pool) = scratch_frame();
        let hex = heap.alloc_string("ff".to_string());
        let bogus = heap.alloc_string("zz".to_string());

        let parsed = with_native(&mut stack, &mut heap, &pool, |operands, mem| {
            operands.push_ref(hex).unwrap();
            operands.push_int(16).unwrap();
            parse_int_radix(operands, mem).unwrap();
            operands.pop_ref().unwrap()
        });
        assert_eq!(heap.int(parsed).unwrap(), 255);

        let failed = with_native(&mut stack, &mut heap, &pool, |operands, mem| {
            operands.push_ref(bogus).unwrap();
            operands.push_int(10).unwrap();
            parse_int_radix(operands, mem).unwrap();
            operands.pop_ref().unwrap()
        });
        assert_eq!(failed, ObjRef::NULL);
    }

    #[test]
    fn test_vec_natives() {
        let (mut stack, mut heap, pool) = scratch_frame();
        let one = heap.emplace(ObjData::Int(1));
        let two = heap.emplace(ObjData::Int(2));

        with_native(&mut stack, &mut heap, &pool, |operands, mem| {
            new_vec(operands, mem).unwrap();
            let vec_ref = operands.pop_ref().unwrap();

            operands.push_ref(vec_ref).unwrap();
            operands.push_ref(one).unwrap();
            vec_push(operands, mem).unwrap();
            operands.push_ref(vec_ref).unwrap();
            operands.push_ref(two).unwrap();
            vec_push(operands, mem).unwrap();

            operands.push_ref(vec_ref).unwrap();
            vec_len(operands, mem).unwrap();
            assert_eq!(operands.pop_int().unwrap(), 2);

            operands.push_ref(vec_ref).unwrap();
            operands.push_int(0).unwrap();
            vec_index(operands, mem).unwrap();
            assert_eq!(operands.pop_ref().unwrap(), one);

            operands.push_ref(vec_ref).unwrap();
            vec_pop_head(operands, mem).unwrap();
            assert_eq!(operands.pop_ref().unwrap(), one);

            operands.push_ref(vec_ref).unwrap();
            vec_pop(operands, mem).unwrap();
            assert_eq!(operands.pop_ref().unwrap(), two);

            operands.push_ref(vec_ref).unwrap();
            let err = vec_pop(operands, mem).unwrap_err();
            assert!(matches!(err, VmError::RuntimeException(_)));
        });
    }

    #[test]
    fn test_gc_native_keeps_operand_rooted_objects() {
        let (mut stack, mut heap, pool) = scratch_frame();
        let kept = heap.alloc_string("kept".to_string());
        let _garbage = heap.alloc_string("garbage".to_string());

        with_native(&mut stack, &mut heap, &pool, |operands, mem| {
            operands.push_ref(kept).unwrap();
            memory_gc(operands, mem).unwrap();
        });

        assert_eq!(heap.size(), 1);
        assert_eq!(heap.string(kept).unwrap(), "kept");
    }

    #[test]
    fn test_empty_operands_probe() {
        let (mut stack, mut heap, pool) = scratch_frame();
        with_native(&mut stack, &mut heap, &pool, |operands, mem| {
            assert!(empty_operands(operands, mem).is_ok());
            operands.push_byte(1).unwrap();
            assert!(empty_operands(operands, mem).is_err());
        });
    }
}
