//! Host values as the embedding runtime hands them to the engine.
//!
//! The runtime's own object model is out of reach here; this enum is the
//! boundary representation every marshaling rule is written against.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::layout::StructValue;
use crate::loader::{DynamicLibrary, Symbol};
use crate::memory::Pointer;
use crate::types::Type;

/// A value crossing the host/native boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The host "no value" sentinel
    Nil,
    Bool(bool),
    Integer(i64),
    /// Unsigned results that do not fit in `i64`
    Unsigned(u64),
    Float(f64),
    String(String),
    /// Name-like value (an interned identifier in the host runtime)
    Symbol(String),
    Buffer(Buffer),
    Pointer(Pointer),
    Struct(StructValue),
    Type(Type),
    Array(Vec<Value>),
    Library(DynamicLibrary),
    /// A symbol handle produced by a [`DynamicLibrary`]
    LibrarySymbol(Symbol),
}

impl Value {
    /// Shorthand for a name-like value.
    pub fn sym(name: impl Into<String>) -> Self {
        Value::Symbol(name.into())
    }

    /// Concrete kind name used in coercion failures.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "NilClass",
            Value::Bool(_) => "Bool",
            Value::Integer(_) | Value::Unsigned(_) => "Integer",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::Symbol(_) => "Symbol",
            Value::Buffer(_) => "Buffer",
            Value::Pointer(_) => "Pointer",
            Value::Struct(_) => "Struct",
            Value::Type(_) => "Type",
            Value::Array(_) => "Array",
            Value::Library(_) => "DynamicLibrary",
            Value::LibrarySymbol(_) => "DynamicLibrary::Symbol",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// The text of a string or name-like value.
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view, accepting either signedness.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Integer(v) => Some(*v as i128),
            Value::Unsigned(v) => Some(*v as i128),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            Value::Unsigned(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Build an integer value, keeping values above `i64::MAX` unsigned.
    pub fn from_u64(v: u64) -> Self {
        i64::try_from(v)
            .map(Value::Integer)
            .unwrap_or(Value::Unsigned(v))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Unsigned(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{:?}", v),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Symbol(s) => write!(f, ":{}", s),
            Value::Buffer(b) => write!(f, "#<Buffer size={}>", b.len()),
            Value::Pointer(p) => write!(f, "#<Pointer address=0x{:x}>", p.address()),
            Value::Struct(s) => write!(f, "#<Struct size={}>", s.layout().size()),
            Value::Type(t) => write!(f, "#<Type {}>", t),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Library(lib) => write!(f, "#<DynamicLibrary {}>", lib.name()),
            Value::LibrarySymbol(sym) => write!(f, "#<DynamicLibrary::Symbol {}>", sym.name()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Type> for Value {
    fn from(v: Type) -> Self {
        Value::Type(v)
    }
}

impl From<Pointer> for Value {
    fn from(v: Pointer) -> Self {
        Value::Pointer(v)
    }
}

impl From<Symbol> for Value {
    fn from(v: Symbol) -> Self {
        Value::LibrarySymbol(v)
    }
}

impl From<StructValue> for Value {
    fn from(v: StructValue) -> Self {
        Value::Struct(v)
    }
}

impl From<Buffer> for Value {
    fn from(v: Buffer) -> Self {
        Value::Buffer(v)
    }
}

/// Mutable host byte buffer shared between the caller and a pending call.
///
/// `BUFFER_OUT`/`BUFFER_INOUT` arguments write the native contents back
/// into this buffer once the call returns.
#[derive(Clone, Default)]
pub struct Buffer(Arc<Mutex<Vec<u8>>>);

impl Buffer {
    /// A zero-filled buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0; len])
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Buffer(Arc::new(Mutex::new(bytes)))
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    /// Contents up to the first NUL, lossily decoded.
    pub fn to_string_lossy(&self) -> String {
        let bytes = self.0.lock();
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }

    /// Overwrite the buffer from the start with `bytes`, keeping its length.
    pub(crate) fn copy_from(&self, bytes: &[u8]) {
        let mut guard = self.0.lock();
        let n = guard.len().min(bytes.len());
        guard[..n].copy_from_slice(&bytes[..n]);
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || *self.0.lock() == *other.0.lock()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Buffer").field(&self.0.lock()).finish()
    }
}
