//! Native memory access
//!
//! `Pointer` is an address with optional bounds and an optional owning
//! allocation. Reads and writes go through a [`Type`] so the same encode
//! and decode rules apply here as for call arguments.

use std::alloc::{self, Layout};
use std::ffi::CStr;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::converter::ConvertContext;
use crate::error::{Expected, FfiError, FfiResult};
use crate::layout::StructValue;
use crate::types::{PointerKind, Type};
use crate::value::Value;

const ALLOC_ALIGN: usize = 16;

/// Zeroed heap block freed when the last `Pointer` into it drops.
struct Allocation {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The block is plain bytes; synchronization of concurrent writers is the
// caller's concern, as with any native memory.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Allocation {
    fn new(size: usize) -> FfiResult<Self> {
        let layout = Layout::from_size_align(size.max(1), ALLOC_ALIGN)
            .map_err(|e| FfiError::Memory(format!("cannot allocate {} bytes: {}", size, e)))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| FfiError::Memory(format!("allocation of {} bytes failed", size)))?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// A native address.
#[derive(Clone)]
pub struct Pointer {
    address: usize,
    /// Accessible bytes from `address`, when known
    size: Option<usize>,
    owner: Option<Arc<Allocation>>,
}

impl Pointer {
    pub fn null() -> Self {
        Self {
            address: 0,
            size: None,
            owner: None,
        }
    }

    /// Wrap a foreign address; accesses through it are unchecked.
    pub fn from_address(address: usize) -> Self {
        Self {
            address,
            size: None,
            owner: None,
        }
    }

    /// Allocate `size` zeroed bytes, 16-byte aligned, owned by the pointer.
    pub fn allocate(size: usize) -> FfiResult<Self> {
        let owner = Arc::new(Allocation::new(size)?);
        Ok(Self {
            address: owner.ptr.as_ptr() as usize,
            size: Some(size),
            owner: Some(owner),
        })
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn size(&self) -> Option<usize> {
        self.size
    }

    pub fn is_null(&self) -> bool {
        self.address == 0
    }

    /// A pointer `n` bytes further on, sharing ownership.
    pub fn offset(&self, n: usize) -> FfiResult<Self> {
        let size = match self.size {
            Some(size) if n > size => {
                return Err(FfiError::Memory(format!(
                    "offset {} beyond end of {}-byte region",
                    n, size
                )))
            }
            Some(size) => Some(size - n),
            None => None,
        };
        Ok(Self {
            address: self.address.wrapping_add(n),
            size,
            owner: self.owner.clone(),
        })
    }

    fn check(&self, offset: usize, len: usize) -> FfiResult<*mut u8> {
        if self.is_null() {
            return Err(FfiError::Memory("access through null pointer".into()));
        }
        if let Some(size) = self.size {
            if offset.checked_add(len).map_or(true, |end| end > size) {
                return Err(FfiError::Memory(format!(
                    "access of {} bytes at offset {} exceeds {}-byte region",
                    len, offset, size
                )));
            }
        }
        Ok(self.address.wrapping_add(offset) as *mut u8)
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> FfiResult<Vec<u8>> {
        let src = self.check(offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: bounds checked for owned regions; foreign regions are the
        // caller's contract.
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len) };
        Ok(out)
    }

    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> FfiResult<()> {
        let dst = self.check(offset, bytes.len())?;
        // SAFETY: as for `read_bytes`.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
        Ok(())
    }

    /// NUL-terminated string starting at `offset`.
    pub fn read_string(&self, offset: usize) -> FfiResult<String> {
        let start = self.check(offset, 0)?;
        if let Some(size) = self.size {
            let bytes = self.read_bytes(offset, size - offset)?;
            let end = bytes
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| FfiError::Memory("unterminated string in region".into()))?;
            return Ok(String::from_utf8_lossy(&bytes[..end]).into_owned());
        }
        // SAFETY: unbounded foreign pointer, caller guarantees termination.
        let s = unsafe { CStr::from_ptr(start as *const libc::c_char) };
        Ok(s.to_string_lossy().into_owned())
    }

    /// Decode a value of type `ty` stored at `offset`.
    pub fn read(&self, ty: &Type, offset: usize) -> FfiResult<Value> {
        match ty {
            Type::Primitive(p) => Ok(p.decode(&self.read_bytes(offset, p.size)?)),
            Type::Pointer(kind) => {
                let addr = self.read_address(offset)?;
                match kind {
                    PointerKind::String if addr == 0 => Ok(Value::Nil),
                    PointerKind::String => Pointer::from_address(addr).read_string(0).map(Value::String),
                    _ => Ok(Value::Pointer(Pointer::from_address(addr))),
                }
            }
            Type::Struct(layout) => Ok(Value::Struct(StructValue::at(
                Arc::clone(layout),
                self.offset(offset)?,
            ))),
            Type::StructByReference(layout) => {
                let addr = self.read_address(offset)?;
                if addr == 0 {
                    return Ok(Value::Nil);
                }
                Ok(Value::Struct(StructValue::at(
                    Arc::clone(layout),
                    Pointer::from_address(addr),
                )))
            }
            Type::Mapped(mapped) => {
                let native = self.read(&mapped.native_type()?, offset)?;
                mapped
                    .converter()
                    .from_native(&native, &ConvertContext::Standalone)
            }
            Type::Void | Type::Varargs => Err(FfiError::Unsupported(format!(
                "cannot read a value of type {}",
                ty
            ))),
        }
    }

    /// Encode `value` as type `ty` at `offset`.
    pub fn write(&self, ty: &Type, offset: usize, value: &Value) -> FfiResult<()> {
        match ty {
            Type::Primitive(p) => {
                let mut buf = [0u8; 16];
                p.encode(value, &mut buf)?;
                self.write_bytes(offset, &buf[..p.size])
            }
            Type::Pointer(PointerKind::String) if value.as_name().is_some() => {
                Err(FfiError::Unsupported(
                    "storing a string requires an allocated pointer".into(),
                ))
            }
            Type::Pointer(_) | Type::StructByReference(_) => {
                self.write_address(offset, address_of(value)?)
            }
            Type::Struct(layout) => match value {
                Value::Struct(sv) if sv.layout().size() == layout.size() => {
                    let bytes = sv.to_bytes()?;
                    self.write_bytes(offset, &bytes)
                }
                other => Err(FfiError::conversion(other.kind_name(), Expected::Struct)),
            },
            Type::Mapped(mapped) => {
                let native = mapped
                    .converter()
                    .to_native(value, &ConvertContext::Standalone)?;
                self.write(&mapped.native_type()?, offset, &native)
            }
            Type::Void | Type::Varargs => Err(FfiError::Unsupported(format!(
                "cannot write a value of type {}",
                ty
            ))),
        }
    }

    fn read_address(&self, offset: usize) -> FfiResult<usize> {
        let bytes = self.read_bytes(offset, std::mem::size_of::<usize>())?;
        let mut raw = [0u8; std::mem::size_of::<usize>()];
        raw.copy_from_slice(&bytes);
        Ok(usize::from_ne_bytes(raw))
    }

    fn write_address(&self, offset: usize, address: usize) -> FfiResult<()> {
        self.write_bytes(offset, &address.to_ne_bytes())
    }
}

/// Native address carried by a host value passed where a pointer is expected.
pub(crate) fn address_of(value: &Value) -> FfiResult<usize> {
    match value {
        Value::Nil => Ok(0),
        Value::Pointer(p) => Ok(p.address()),
        Value::Struct(s) => Ok(s.pointer().address()),
        Value::LibrarySymbol(sym) => sym.address(),
        Value::Integer(v) => usize::try_from(*v)
            .map_err(|_| FfiError::conversion("Integer", Expected::Pointer)),
        Value::Unsigned(v) => usize::try_from(*v)
            .map_err(|_| FfiError::conversion("Integer", Expected::Pointer)),
        other => Err(FfiError::conversion(other.kind_name(), Expected::Pointer)),
    }
}

impl PartialEq for Pointer {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.size == other.size
    }
}

impl fmt::Debug for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pointer")
            .field("address", &format_args!("0x{:x}", self.address))
            .field("size", &self.size)
            .field("owned", &self.owner.is_some())
            .finish()
    }
}

impl Default for Pointer {
    fn default() -> Self {
        Self::null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PrimitiveKind;

    #[test]
    fn test_allocate_is_zeroed_and_aligned() {
        let p = Pointer::allocate(32).unwrap();
        assert_eq!(p.address() % ALLOC_ALIGN, 0);
        assert_eq!(p.read_bytes(0, 32).unwrap(), vec![0u8; 32]);
    }

    #[test]
    fn test_typed_read_write() {
        let p = Pointer::allocate(16).unwrap();
        let int32 = Type::primitive(PrimitiveKind::Int32);
        p.write(&int32, 4, &Value::Integer(-7)).unwrap();
        assert_eq!(p.read(&int32, 4).unwrap(), Value::Integer(-7));

        let f64_ty = Type::primitive(PrimitiveKind::Float64);
        p.write(&f64_ty, 8, &Value::Float(2.5)).unwrap();
        assert_eq!(p.read(&f64_ty, 8).unwrap(), Value::Float(2.5));
    }

    #[test]
    fn test_bounds_are_enforced() {
        let p = Pointer::allocate(4).unwrap();
        let int64 = Type::primitive(PrimitiveKind::Int64);
        assert!(matches!(
            p.write(&int64, 0, &Value::Integer(1)),
            Err(FfiError::Memory(_))
        ));
        assert!(p.offset(5).is_err());
        assert_eq!(p.offset(4).unwrap().size(), Some(0));
    }

    #[test]
    fn test_null_access_fails() {
        let p = Pointer::null();
        assert!(matches!(p.read_bytes(0, 1), Err(FfiError::Memory(_))));
    }

    #[test]
    fn test_read_string() {
        let p = Pointer::allocate(8).unwrap();
        p.write_bytes(0, b"hi\0").unwrap();
        assert_eq!(p.read_string(0).unwrap(), "hi");
        p.write_bytes(0, b"abcdefgh").unwrap();
        assert!(p.read_string(0).is_err());
    }

    #[test]
    fn test_pointer_roundtrip_through_memory() {
        let p = Pointer::allocate(16).unwrap();
        let target = Pointer::allocate(1).unwrap();
        p.write(&Type::pointer(), 0, &Value::Pointer(target.clone()))
            .unwrap();
        match p.read(&Type::pointer(), 0).unwrap() {
            Value::Pointer(read) => assert_eq!(read.address(), target.address()),
            other => panic!("expected pointer, got {:?}", other),
        }
    }
}
