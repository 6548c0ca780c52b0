//! Memory marshalling across the guest boundary.
//!
//! Everything that crosses between host and guest travels as integers: a
//! pointer and a length into the guest's linear memory. The free functions in
//! this module operate on a borrowed byte slice of that memory and enforce
//! `ptr + len <= memory.len()` before touching a single byte. [`GuestMemory`]
//! adds the one operation that needs the guest itself: allocating a buffer
//! through the guest's exported allocator.
//!
//! Strings returned to the guest are length-prefixed: a 4-byte little-endian
//! length followed by that many UTF-8 bytes.

use std::ops::Range;

use wasmtime::{AsContext, AsContextMut, Caller, Extern, Instance, Memory, TypedFunc};

use guest_runtime_common::MemoryError;

/// Name of the exported linear memory.
pub const MEMORY_EXPORT: &str = "memory";

/// Allocator export names, in lookup order.
pub const ALLOCATOR_EXPORTS: [&str; 2] = ["malloc", "alloc"];

/// Deallocator export names, in lookup order.
pub const DEALLOCATOR_EXPORTS: [&str; 2] = ["free", "dealloc"];

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Resolve `ptr..ptr+len` against a memory of `memory_size` bytes.
fn span(memory_size: usize, ptr: i64, len: i64) -> Result<Range<usize>, MemoryError> {
    let out_of_bounds = || MemoryError::OutOfBounds {
        ptr,
        len,
        memory_size,
    };

    let start = usize::try_from(ptr).map_err(|_| out_of_bounds())?;
    let length = usize::try_from(len).map_err(|_| out_of_bounds())?;
    let end = start.checked_add(length).ok_or_else(out_of_bounds)?;

    if end > memory_size {
        return Err(out_of_bounds());
    }

    Ok(start..end)
}

/// Borrow `len` bytes at `ptr`.
///
/// A null pointer or a zero length yields an empty slice.
pub fn read_bytes(memory: &[u8], ptr: i32, len: i32) -> Result<&[u8], MemoryError> {
    if ptr == 0 || len == 0 {
        return Ok(&[]);
    }

    let range = span(memory.len(), i64::from(ptr), i64::from(len))?;
    Ok(&memory[range])
}

/// Decode `len` bytes at `ptr` as UTF-8.
///
/// Invalid sequences are replaced with U+FFFD.
pub fn read_text(memory: &[u8], ptr: i32, len: i32) -> Result<String, MemoryError> {
    read_bytes(memory, ptr, len).map(|bytes| String::from_utf8_lossy(bytes).into_owned())
}

/// Decode a length-prefixed string addressed by a single pointer.
pub fn read_length_prefixed_text(memory: &[u8], ptr: i32) -> Result<String, MemoryError> {
    if ptr == 0 {
        return Ok(String::new());
    }

    let len = read_u32(memory, ptr)?;
    let range = span(
        memory.len(),
        i64::from(ptr) + LENGTH_PREFIX_SIZE as i64,
        i64::from(len),
    )?;

    Ok(String::from_utf8_lossy(&memory[range]).into_owned())
}

fn read_u32(memory: &[u8], ptr: i32) -> Result<u32, MemoryError> {
    let range = span(memory.len(), i64::from(ptr), 4)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&memory[range]);
    Ok(u32::from_le_bytes(buf))
}

/// Read a little-endian `i32` at `ptr`.
pub fn read_i32(memory: &[u8], ptr: i32) -> Result<i32, MemoryError> {
    let range = span(memory.len(), i64::from(ptr), 4)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&memory[range]);
    Ok(i32::from_le_bytes(buf))
}

/// Write a little-endian `i32` at `ptr`.
pub fn write_i32(memory: &mut [u8], ptr: i32, value: i32) -> Result<(), MemoryError> {
    write_bytes(memory, ptr, &value.to_le_bytes())
}

/// Read a little-endian `f64` at `ptr`.
pub fn read_f64(memory: &[u8], ptr: i32) -> Result<f64, MemoryError> {
    let range = span(memory.len(), i64::from(ptr), 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&memory[range]);
    Ok(f64::from_le_bytes(buf))
}

/// Write a little-endian `f64` at `ptr`.
pub fn write_f64(memory: &mut [u8], ptr: i32, value: f64) -> Result<(), MemoryError> {
    write_bytes(memory, ptr, &value.to_le_bytes())
}

/// Copy `bytes` into memory at `ptr`.
pub fn write_bytes(memory: &mut [u8], ptr: i32, bytes: &[u8]) -> Result<(), MemoryError> {
    let len = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
    let range = span(memory.len(), i64::from(ptr), len)?;
    memory[range].copy_from_slice(bytes);
    Ok(())
}

/// Encode `text` as a length-prefixed buffer.
pub fn encode_length_prefixed(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + bytes.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    buf
}

/// Look up the guest's exported linear memory from a host function.
pub fn caller_memory<T>(caller: &mut Caller<'_, T>) -> Result<Memory, MemoryError> {
    caller
        .get_export(MEMORY_EXPORT)
        .and_then(Extern::into_memory)
        .ok_or_else(|| MemoryError::MissingExport {
            name: MEMORY_EXPORT.to_string(),
        })
}

/// A guest's memory together with its allocation exports.
#[derive(Clone)]
pub struct GuestMemory {
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    dealloc: Option<TypedFunc<i32, ()>>,
}

impl GuestMemory {
    /// Resolve memory and allocator exports from inside a host function.
    pub fn from_caller<T>(caller: &mut Caller<'_, T>) -> Result<Self, MemoryError> {
        let memory = caller_memory(caller)?;

        let alloc = ALLOCATOR_EXPORTS
            .iter()
            .find_map(|name| caller.get_export(name).and_then(Extern::into_func))
            .ok_or_else(missing_allocator)?
            .typed::<i32, i32>(&*caller)
            .map_err(guest_call)?;

        let dealloc = DEALLOCATOR_EXPORTS
            .iter()
            .find_map(|name| caller.get_export(name).and_then(Extern::into_func))
            .and_then(|func| func.typed::<i32, ()>(&*caller).ok());

        Ok(Self {
            memory,
            alloc,
            dealloc,
        })
    }

    /// Resolve memory and allocator exports from an instance.
    pub fn from_instance(
        mut store: impl AsContextMut,
        instance: &Instance,
    ) -> Result<Self, MemoryError> {
        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or_else(|| MemoryError::MissingExport {
                name: MEMORY_EXPORT.to_string(),
            })?;

        let alloc = ALLOCATOR_EXPORTS
            .iter()
            .find_map(|name| instance.get_typed_func::<i32, i32>(&mut store, name).ok())
            .ok_or_else(missing_allocator)?;

        let dealloc = DEALLOCATOR_EXPORTS
            .iter()
            .find_map(|name| instance.get_typed_func::<i32, ()>(&mut store, name).ok());

        Ok(Self {
            memory,
            alloc,
            dealloc,
        })
    }

    /// The underlying linear memory.
    pub fn memory(&self) -> Memory {
        self.memory
    }

    /// Whether the guest exports a deallocator.
    pub fn can_deallocate(&self) -> bool {
        self.dealloc.is_some()
    }

    /// Call the guest allocator for `size` bytes.
    ///
    /// A null pointer is reported as [`MemoryError::AllocationFailed`].
    pub async fn allocate<S>(&self, store: S, size: usize) -> Result<i32, MemoryError>
    where
        S: AsContextMut,
        S::Data: Send,
    {
        let request =
            i32::try_from(size).map_err(|_| MemoryError::AllocationFailed { size })?;

        let ptr = self
            .alloc
            .call_async(store, request)
            .await
            .map_err(guest_call)?;

        if ptr == 0 {
            return Err(MemoryError::AllocationFailed { size });
        }

        Ok(ptr)
    }

    /// Hand `ptr` back to the guest deallocator, if one is exported.
    pub async fn deallocate<S>(&self, store: S, ptr: i32) -> Result<(), MemoryError>
    where
        S: AsContextMut,
        S::Data: Send,
    {
        match &self.dealloc {
            Some(dealloc) if ptr != 0 => {
                dealloc.call_async(store, ptr).await.map_err(guest_call)
            }
            _ => Ok(()),
        }
    }

    /// Allocate a length-prefixed buffer holding `text` and return its pointer.
    pub async fn write_text<S>(&self, mut store: S, text: &str) -> Result<i32, MemoryError>
    where
        S: AsContextMut,
        S::Data: Send,
    {
        let encoded = encode_length_prefixed(text);
        let ptr = self.allocate(&mut store, encoded.len()).await?;

        write_bytes(self.memory.data_mut(&mut store), ptr, &encoded)?;

        Ok(ptr)
    }

    /// Decode `len` bytes at `ptr` as UTF-8.
    pub fn read_text(&self, store: impl AsContext, ptr: i32, len: i32) -> Result<String, MemoryError> {
        read_text(self.memory.data(&store), ptr, len)
    }

    /// Decode a length-prefixed string at `ptr`.
    pub fn read_length_prefixed_text(
        &self,
        store: impl AsContext,
        ptr: i32,
    ) -> Result<String, MemoryError> {
        read_length_prefixed_text(self.memory.data(&store), ptr)
    }
}

impl std::fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemory")
            .field("dealloc", &self.dealloc.is_some())
            .finish_non_exhaustive()
    }
}

fn missing_allocator() -> MemoryError {
    MemoryError::MissingExport {
        name: ALLOCATOR_EXPORTS.join(" | "),
    }
}

fn guest_call(error: wasmtime::Error) -> MemoryError {
    MemoryError::GuestCall {
        message: error.root_cause().to_string(),
    }
}
