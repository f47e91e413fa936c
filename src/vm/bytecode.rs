//! Bytecode unit format and loader for conch.
//!
//! Binary format (all integers big-endian):
//! - Constant pool: u32 count, then per constant a u64 byte length
//!   followed by that many UTF-8 bytes
//! - Function table: u32 count, then per function:
//!   u32 identifier constant index, u32 locals size,
//!   u32 parameters byte count, u8 return byte count,
//!   u32 instruction byte count, instruction bytes
//!
//! Constants are interned into the heap at load time; the pool holds
//! their references for the lifetime of the unit (and roots them for the
//! collector). The entry point of a unit is any function whose
//! identifier ends in `::<main>` and takes no parameters.

use std::collections::HashMap;

use super::errors::VmError;
use super::heap::{Heap, ObjRef};

/// Index into the constant pool, as embedded in bytecode.
pub type ConstantIndex = u32;

// =============================================================================
// ConstantPool
// =============================================================================

/// The string constants of a unit, interned in the heap at load time.
#[derive(Debug)]
pub struct ConstantPool {
    constants: Vec<ObjRef>,
}

impl ConstantPool {
    pub fn new(constants: Vec<ObjRef>) -> Self {
        Self { constants }
    }

    /// The heap reference behind a constant index.
    pub fn get_ref(&self, at: ConstantIndex) -> Result<ObjRef, VmError> {
        self.constants
            .get(at as usize)
            .copied()
            .ok_or_else(|| {
                VmError::InvalidBytecode(format!(
                    "constant index {} exceeds constant pool size ({})",
                    at,
                    self.constants.len()
                ))
            })
    }

    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    /// Every constant is a GC root for the lifetime of the unit.
    pub fn roots(&self) -> &[ObjRef] {
        &self.constants
    }
}

// =============================================================================
// Function / BytecodeUnit
// =============================================================================

/// The information needed to execute one function.
#[derive(Debug, Clone)]
pub struct Function {
    /// Qualified name, e.g. `lang::Int::to_string` or `mod::<main>`.
    pub identifier: String,
    /// Size in bytes of the frame's locals area.
    pub locals_size: usize,
    /// Length in bytes of the leading locals space that receives the
    /// caller's argument block. Never exceeds `locals_size`.
    pub parameters_byte_count: usize,
    /// Length in bytes of the value left on the operand stack for the
    /// caller when the frame returns. Never exceeds `locals_size`.
    pub return_byte_count: usize,
    /// Immutable instruction bytes.
    pub instructions: Vec<u8>,
}

/// A loaded, immutable bytecode unit: constants plus functions.
#[derive(Debug)]
pub struct BytecodeUnit {
    pub pool: ConstantPool,
    functions: Vec<Function>,
    names: HashMap<String, usize>,
}

impl BytecodeUnit {
    pub fn new(pool: ConstantPool, functions: Vec<Function>) -> Self {
        let names = functions
            .iter()
            .enumerate()
            .map(|(index, function)| (function.identifier.clone(), index))
            .collect();
        Self {
            pool,
            functions,
            names,
        }
    }

    /// Looks up a function index by its qualified identifier.
    pub fn find(&self, identifier: &str) -> Option<usize> {
        self.names.get(identifier).copied()
    }

    pub fn function(&self, index: usize) -> &Function {
        &self.functions[index]
    }

    /// The unit's entry point: a zero-parameter function whose identifier
    /// ends in `::<main>`.
    pub fn entry_point(&self) -> Result<usize, VmError> {
        self.functions
            .iter()
            .position(|f| f.identifier.ends_with("::<main>") && f.parameters_byte_count == 0)
            .ok_or_else(|| {
                VmError::InvalidBytecodeStructure(
                    "unit does not contain any `<main>()` function".to_string(),
                )
            })
    }
}

// =============================================================================
// ByteReader - cursor over a unit image
// =============================================================================

/// Reader over a fixed byte array; all multi-byte reads are big-endian.
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Current byte position in the image.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], VmError> {
        if self.pos + n > self.bytes.len() {
            return Err(VmError::InvalidBytecode(
                "ran out of bytes while reading the unit".to_string(),
            ));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, VmError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, VmError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    pub fn read_u64(&mut self) -> Result<u64, VmError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], VmError> {
        self.take(n)
    }
}

// =============================================================================
// Loader
// =============================================================================

fn read_string(reader: &mut ByteReader<'_>, heap: &mut Heap) -> Result<ObjRef, VmError> {
    let length = reader.read_u64()? as usize;
    let bytes = reader.read_bytes(length)?;
    let value = String::from_utf8(bytes.to_vec())
        .map_err(|_| VmError::InvalidBytecode("constant is not valid UTF-8".to_string()))?;
    Ok(heap.alloc_string(value))
}

fn load_constant_pool(
    reader: &mut ByteReader<'_>,
    heap: &mut Heap,
) -> Result<ConstantPool, VmError> {
    let count = reader.read_u32()?;
    let mut constants = Vec::with_capacity(count as usize);
    for _ in 0..count {
        constants.push(read_string(reader, heap)?);
    }
    Ok(ConstantPool::new(constants))
}

fn load_function(
    reader: &mut ByteReader<'_>,
    pool: &ConstantPool,
    heap: &Heap,
) -> Result<Function, VmError> {
    let identifier_idx = reader.read_u32()?;
    let identifier = heap.string(pool.get_ref(identifier_idx)?)?.to_string();

    let locals_size = reader.read_u32()? as usize;
    let parameters_byte_count = reader.read_u32()? as usize;
    let return_byte_count = reader.read_u8()? as usize;

    if parameters_byte_count > locals_size {
        return Err(VmError::InvalidBytecodeStructure(format!(
            "function {}: parameters byte count {} exceeds locals size {}",
            identifier, parameters_byte_count, locals_size
        )));
    }
    if return_byte_count > locals_size {
        return Err(VmError::InvalidBytecodeStructure(format!(
            "function {}: return byte count {} exceeds locals size {}",
            identifier, return_byte_count, locals_size
        )));
    }

    let instruction_count = reader.read_u32()? as usize;
    let instructions = reader.read_bytes(instruction_count)?.to_vec();

    Ok(Function {
        identifier,
        locals_size,
        parameters_byte_count,
        return_byte_count,
        instructions,
    })
}

/// Loads a unit image, interning its string constants into `heap`.
pub fn load_unit(bytes: &[u8], heap: &mut Heap) -> Result<BytecodeUnit, VmError> {
    let mut reader = ByteReader::new(bytes);

    let pool = load_constant_pool(&mut reader, heap)?;

    let count = reader.read_u32()?;
    let mut functions = Vec::with_capacity(count as usize);
    for _ in 0..count {
        functions.push(load_function(&mut reader, &pool, heap)?);
    }

    let unit = BytecodeUnit::new(pool, functions);
    // A unit without an entry point is rejected at load time.
    unit.entry_point()?;
    Ok(unit)
}
