//! Argument and return-value marshaling.
//!
//! A [`CallFrame`] owns every temporary a call needs: aligned slots holding
//! each encoded argument, NUL-terminated copies of strings, and scratch
//! copies of host buffers that are written back once the call returns.
//! Nothing in a frame moves while the call is in flight.

use std::borrow::Cow;
use std::ffi::CString;
use std::os::raw::c_void;
use std::sync::Arc;

use libffi::raw::ffi_arg;

use crate::converter::{ConvertContext, DataConverter};
use crate::error::{Expected, FfiError, FfiResult};
use crate::layout::StructValue;
use crate::memory::{address_of, Pointer};
use crate::types::{Direction, PointerKind, Type};
use crate::value::{Buffer, Value};

/// Width libffi widens small integer returns to.
const RET_WORD: usize = std::mem::size_of::<ffi_arg>();

#[derive(Clone, Copy)]
#[repr(C, align(16))]
struct Chunk([u8; 16]);

/// Zeroed, 16-byte aligned storage of at least `len` bytes.
pub(crate) struct Slot(Vec<Chunk>);

impl Slot {
    pub(crate) fn new(len: usize) -> Self {
        Slot(vec![Chunk([0; 16]); len.div_ceil(16).max(1)])
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut c_void {
        self.0.as_mut_ptr() as *mut c_void
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        // SAFETY: Chunk is plain bytes with no padding.
        unsafe { std::slice::from_raw_parts(self.0.as_ptr() as *const u8, self.0.len() * 16) }
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above.
        unsafe { std::slice::from_raw_parts_mut(self.0.as_mut_ptr() as *mut u8, self.0.len() * 16) }
    }
}

/// Storage for one in-flight call.
pub(crate) struct CallFrame<'f> {
    function: &'f str,
    enums: Option<&'f Arc<dyn DataConverter>>,
    slots: Vec<Slot>,
    strings: Vec<CString>,
    scratch: Vec<Vec<u8>>,
    writebacks: Vec<(Buffer, usize)>,
}

impl<'f> CallFrame<'f> {
    pub(crate) fn new(function: &'f str, enums: Option<&'f Arc<dyn DataConverter>>, nargs: usize) -> Self {
        Self {
            function,
            enums,
            slots: Vec::with_capacity(nargs),
            strings: Vec::new(),
            scratch: Vec::new(),
            writebacks: Vec::new(),
        }
    }

    /// Encode `value` as argument `index` of type `ty`.
    pub(crate) fn push(&mut self, index: usize, ty: &Type, value: &Value) -> FfiResult<()> {
        let size = ty.size_align().map_or(0, |(size, _)| size);
        let mut slot = Slot::new(size);
        self.encode(index, ty, value, slot.bytes_mut())
            .map_err(|e| e.at_argument(index))?;
        self.slots.push(slot);
        Ok(())
    }

    fn encode(&mut self, index: usize, ty: &Type, value: &Value, out: &mut [u8]) -> FfiResult<()> {
        match ty {
            Type::Primitive(p) => {
                let mapped;
                let value = match (self.enums, value) {
                    (Some(enums), Value::Symbol(_)) if ty.is_integer() => {
                        mapped = enums.to_native(value, &self.context(index))?;
                        &mapped
                    }
                    _ => value,
                };
                p.encode(value, out)
            }
            Type::Pointer(PointerKind::String) => {
                let addr = match value {
                    Value::String(s) | Value::Symbol(s) => {
                        let c = CString::new(s.as_str()).map_err(|_| {
                            FfiError::marshal(index, "string contains an interior NUL byte")
                        })?;
                        let addr = c.as_ptr() as usize;
                        self.strings.push(c);
                        addr
                    }
                    Value::Buffer(buf) => self.stage_buffer(buf, Direction::In),
                    other => address_of(other)?,
                };
                write_address(out, addr);
                Ok(())
            }
            Type::Pointer(PointerKind::Buffer(direction)) => {
                let addr = match value {
                    Value::Buffer(buf) => self.stage_buffer(buf, *direction),
                    Value::String(s) if !direction.copies_out() => {
                        let mut bytes = s.as_bytes().to_vec();
                        bytes.push(0);
                        let addr = bytes.as_ptr() as usize;
                        self.scratch.push(bytes);
                        addr
                    }
                    Value::String(_) => {
                        return Err(FfiError::conversion("String", Expected::Buffer))
                    }
                    other => address_of(other)?,
                };
                write_address(out, addr);
                Ok(())
            }
            Type::Pointer(PointerKind::Address) => {
                write_address(out, address_of(value)?);
                Ok(())
            }
            Type::StructByReference(_) => {
                let addr = match value {
                    Value::Struct(sv) => sv.pointer().address(),
                    Value::Nil => 0,
                    other => return Err(FfiError::conversion(other.kind_name(), Expected::Struct)),
                };
                write_address(out, addr);
                Ok(())
            }
            Type::Struct(layout) => match value {
                Value::Struct(sv) if sv.layout().size() == layout.size() => {
                    let bytes = sv.to_bytes()?;
                    out[..bytes.len()].copy_from_slice(&bytes);
                    Ok(())
                }
                other => Err(FfiError::conversion(other.kind_name(), Expected::Struct)),
            },
            Type::Mapped(mapped) => {
                let native = mapped
                    .converter()
                    .to_native(value, &self.context(index))?;
                self.encode(index, &mapped.native_type()?, &native, out)
            }
            Type::Void | Type::Varargs => Err(FfiError::InvalidSignature(format!(
                "argument {} has type {}",
                index, ty
            ))),
        }
    }

    /// Copy a host buffer into frame-owned scratch; returns its address.
    fn stage_buffer(&mut self, buf: &Buffer, direction: Direction) -> usize {
        let bytes = if direction.copies_in() {
            buf.to_vec()
        } else {
            vec![0; buf.len()]
        };
        let addr = bytes.as_ptr() as usize;
        self.scratch.push(bytes);
        if direction.copies_out() {
            self.writebacks.push((buf.clone(), self.scratch.len() - 1));
        }
        addr
    }

    fn context(&self, index: usize) -> ConvertContext<'f> {
        ConvertContext::Argument {
            function: self.function,
            index,
        }
    }

    /// One pointer per encoded argument, for `ffi_call`.
    pub(crate) fn arg_pointers(&mut self) -> Vec<*mut c_void> {
        self.slots.iter_mut().map(Slot::as_mut_ptr).collect()
    }

    /// Copy `BUFFER_OUT`/`BUFFER_INOUT` contents back to the host buffers.
    pub(crate) fn finish(self) {
        for (buf, i) in &self.writebacks {
            buf.copy_from(&self.scratch[*i]);
        }
    }
}

fn write_address(out: &mut [u8], addr: usize) {
    let bytes = addr.to_ne_bytes();
    out[..bytes.len()].copy_from_slice(&bytes);
}

/// Return-slot storage for `ty`.
pub(crate) fn return_slot(ty: &Type) -> Slot {
    Slot::new(ty.size().max(RET_WORD))
}

/// Decode the return slot as `ty`.
pub(crate) fn decode_return(
    ty: &Type,
    slot: &Slot,
    function: &str,
    enums: Option<&Arc<dyn DataConverter>>,
) -> FfiResult<Value> {
    let bytes = slot.bytes();
    let context = ConvertContext::Return { function };
    match ty {
        Type::Void => Ok(Value::Nil),
        Type::Primitive(p) => {
            let value = if p.kind.is_integer() && p.size < RET_WORD {
                p.decode(&narrow(bytes, p.size))
            } else {
                p.decode(bytes)
            };
            match enums {
                Some(enums) if ty.is_integer() => enums.from_native(&value, &context),
                _ => Ok(value),
            }
        }
        Type::Pointer(kind) => {
            let addr = read_address(bytes);
            match kind {
                PointerKind::String if addr == 0 => Ok(Value::Nil),
                PointerKind::String => Pointer::from_address(addr).read_string(0).map(Value::String),
                _ => Ok(Value::Pointer(Pointer::from_address(addr))),
            }
        }
        Type::StructByReference(layout) => match read_address(bytes) {
            0 => Ok(Value::Nil),
            addr => Ok(Value::Struct(StructValue::at(
                Arc::clone(layout),
                Pointer::from_address(addr),
            ))),
        },
        Type::Struct(layout) => Ok(Value::Struct(StructValue::from_bytes(
            Arc::clone(layout),
            &bytes[..layout.size()],
        )?)),
        Type::Mapped(mapped) => {
            let native = decode_return(&mapped.native_type()?, slot, function, None)?;
            mapped.converter().from_native(&native, &context)
        }
        Type::Varargs => Err(FfiError::InvalidSignature(
            "VARARGS cannot be a return type".into(),
        )),
    }
}

/// libffi stores integer returns narrower than a word as a full `ffi_arg`;
/// pick the native-width bytes back out of it.
fn narrow(bytes: &[u8], size: usize) -> Vec<u8> {
    let mut word = [0u8; 8];
    word[..RET_WORD].copy_from_slice(&bytes[..RET_WORD]);
    let wide = if RET_WORD == 8 {
        u64::from_ne_bytes(word)
    } else {
        let mut half = [0u8; 4];
        half.copy_from_slice(&bytes[..4]);
        u32::from_ne_bytes(half) as u64
    };
    let all = wide.to_ne_bytes();
    if cfg!(target_endian = "little") {
        all[..size].to_vec()
    } else {
        all[8 - size..].to_vec()
    }
}

fn read_address(bytes: &[u8]) -> usize {
    const WIDTH: usize = std::mem::size_of::<usize>();
    let mut raw = [0u8; WIDTH];
    raw.copy_from_slice(&bytes[..WIDTH]);
    usize::from_ne_bytes(raw)
}

/// Native type for a trailing variadic argument, chosen from its value.
pub(crate) fn vararg_type(value: &Value, registry: &crate::types::TypeRegistry) -> FfiResult<Type> {
    let name = match value {
        Value::Integer(_) => "LONG",
        Value::Unsigned(_) => "ULONG",
        Value::Float(_) => "FLOAT64",
        Value::Bool(_) => "INT32",
        Value::String(_) | Value::Symbol(_) => "STRING",
        Value::Buffer(_) => "BUFFER_INOUT",
        Value::Nil | Value::Pointer(_) | Value::Struct(_) | Value::LibrarySymbol(_) => "POINTER",
        other => return Err(FfiError::conversion(other.kind_name(), Expected::Type)),
    };
    registry.resolve_name(name)
}

/// Value actually encoded for a trailing variadic argument: booleans go
/// through the C default promotion to `int`.
pub(crate) fn promote_vararg(value: &Value) -> Cow<'_, Value> {
    match value {
        Value::Bool(b) => Cow::Owned(Value::Integer(i64::from(*b))),
        other => Cow::Borrowed(other),
    }
}
