//! Type System
//!
//! The closed set of native types a signature can mention, and the
//! registry that resolves host type specifications to them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::config::FfiConfig;
use crate::converter::DataConverter;
use crate::error::{Expected, FfiError, FfiResult};
use crate::layout::StructLayout;
use crate::platform::{decode_long_double, encode_long_double, Platform, PrimitiveKind};
use crate::value::Value;

/// A canonical native type.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    /// No value
    Void,
    /// Fixed-width scalar passed by value
    Primitive(Primitive),
    /// Address-sized value with a marshaling flavour
    Pointer(PointerKind),
    /// Representation supplied by a [`DataConverter`]
    Mapped(Mapped),
    /// Struct passed and returned by value
    Struct(Arc<StructLayout>),
    /// Struct passed and returned through its address
    StructByReference(Arc<StructLayout>),
    /// Marker for "any number of further arguments"; never a value type
    Varargs,
}

/// How a pointer-typed argument is marshaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerKind {
    /// Raw address
    Address,
    /// NUL-terminated string copied for the duration of the call
    String,
    /// Host buffer copied in and/or back out around the call
    Buffer(Direction),
}

/// Copy direction of a buffer argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
    InOut,
}

impl Direction {
    pub fn copies_in(self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }

    pub fn copies_out(self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

/// A scalar type with its host-platform size and alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Primitive {
    pub kind: PrimitiveKind,
    pub size: usize,
    pub alignment: usize,
}

impl Primitive {
    pub fn new(kind: PrimitiveKind) -> Self {
        let platform = Platform::host();
        Self {
            kind,
            size: platform.size_of(kind),
            alignment: platform.align_of(kind),
        }
    }

    /// Write `value` as this primitive's native bit pattern into `out`.
    pub fn encode(&self, value: &Value, out: &mut [u8]) -> FfiResult<()> {
        let out = &mut out[..self.size];
        match self.kind {
            PrimitiveKind::Bool => match value {
                Value::Bool(b) => {
                    out[0] = *b as u8;
                    Ok(())
                }
                other => Err(FfiError::conversion(other.kind_name(), Expected::Bool)),
            },
            PrimitiveKind::Float32 => {
                let v = float_arg(value)?;
                out.copy_from_slice(&(v as f32).to_ne_bytes());
                Ok(())
            }
            PrimitiveKind::Float64 => {
                let v = float_arg(value)?;
                out.copy_from_slice(&v.to_ne_bytes());
                Ok(())
            }
            PrimitiveKind::LongDouble => {
                let v = float_arg(value)?;
                encode_long_double(v, Platform::host().long_double_format, out);
                Ok(())
            }
            _ => {
                let v = value
                    .as_i128()
                    .ok_or_else(|| FfiError::conversion(value.kind_name(), Expected::Integer))?;
                let bits = self.size * 8;
                let min = -(1i128 << (bits - 1));
                let max = (1i128 << bits) - 1;
                if v < min || v > max {
                    return Err(FfiError::marshal(
                        0,
                        format!("integer {} out of range for {}", v, self.kind.name()),
                    ));
                }
                let wide = (v as u128 as u64).to_ne_bytes();
                if cfg!(target_endian = "little") {
                    out.copy_from_slice(&wide[..self.size]);
                } else {
                    out.copy_from_slice(&wide[8 - self.size..]);
                }
                Ok(())
            }
        }
    }

    /// Read this primitive's native bit pattern from `bytes`.
    pub fn decode(&self, bytes: &[u8]) -> Value {
        let bytes = &bytes[..self.size];
        match self.kind {
            PrimitiveKind::Bool => Value::Bool(bytes[0] != 0),
            PrimitiveKind::Float32 => {
                Value::Float(f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64)
            }
            PrimitiveKind::Float64 => Value::Float(f64::from_ne_bytes(array8(bytes))),
            PrimitiveKind::LongDouble => {
                Value::Float(decode_long_double(bytes, Platform::host().long_double_format))
            }
            kind => {
                let mut wide = [0u8; 8];
                if cfg!(target_endian = "little") {
                    wide[..self.size].copy_from_slice(bytes);
                } else {
                    wide[8 - self.size..].copy_from_slice(bytes);
                }
                let raw = u64::from_ne_bytes(wide);
                let shift = 64 - self.size * 8;
                if kind.is_signed() {
                    Value::Integer(((raw << shift) as i64) >> shift)
                } else {
                    Value::from_u64(raw)
                }
            }
        }
    }
}

fn float_arg(value: &Value) -> FfiResult<f64> {
    value
        .as_f64()
        .ok_or_else(|| FfiError::conversion(value.kind_name(), Expected::Float))
}

fn array8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}

/// A type whose native form comes from a user converter.
#[derive(Clone)]
pub struct Mapped {
    converter: Arc<dyn DataConverter>,
}

impl Mapped {
    pub fn new(converter: Arc<dyn DataConverter>) -> Self {
        Self { converter }
    }

    pub fn converter(&self) -> &Arc<dyn DataConverter> {
        &self.converter
    }

    /// The backing native type; fails if the converter never declared one.
    pub fn native_type(&self) -> FfiResult<Type> {
        match self.converter.native_type() {
            Some(Type::Mapped(_)) | Some(Type::Varargs) | None => {
                Err(FfiError::conversion("Mapped", Expected::Type))
            }
            Some(ty) => Ok(ty),
        }
    }
}

impl PartialEq for Mapped {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.converter, &other.converter)
    }
}

impl fmt::Debug for Mapped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapped")
            .field("converter", &self.converter)
            .finish()
    }
}

impl Type {
    pub fn primitive(kind: PrimitiveKind) -> Self {
        Type::Primitive(Primitive::new(kind))
    }

    pub fn pointer() -> Self {
        Type::Pointer(PointerKind::Address)
    }

    pub fn string() -> Self {
        Type::Pointer(PointerKind::String)
    }

    pub fn buffer(direction: Direction) -> Self {
        Type::Pointer(PointerKind::Buffer(direction))
    }

    pub fn mapped(converter: Arc<dyn DataConverter>) -> Self {
        Type::Mapped(Mapped::new(converter))
    }

    pub fn by_value(layout: Arc<StructLayout>) -> Self {
        Type::Struct(layout)
    }

    pub fn by_reference(layout: Arc<StructLayout>) -> Self {
        Type::StructByReference(layout)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_varargs(&self) -> bool {
        matches!(self, Type::Varargs)
    }

    /// Integer primitive (excluding `BOOL`)
    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Primitive(p) if p.kind.is_integer() && p.kind != PrimitiveKind::Bool)
    }

    /// Native byte size and alignment, `None` for types without storage.
    pub fn size_align(&self) -> Option<(usize, usize)> {
        let platform = Platform::host();
        match self {
            Type::Void | Type::Varargs => None,
            Type::Primitive(p) => Some((p.size, p.alignment)),
            Type::Pointer(_) | Type::StructByReference(_) => {
                Some((platform.address_size, platform.address_align()))
            }
            Type::Mapped(m) => m.native_type().ok()?.size_align(),
            Type::Struct(layout) => Some((layout.size(), layout.alignment())),
        }
    }

    pub fn size(&self) -> usize {
        self.size_align().map_or(0, |(size, _)| size)
    }

    pub fn alignment(&self) -> usize {
        self.size_align().map_or(1, |(_, align)| align)
    }

    /// Canonical constant-style name.
    pub fn name(&self) -> String {
        match self {
            Type::Void => "VOID".to_string(),
            Type::Varargs => "VARARGS".to_string(),
            Type::Primitive(p) => p.kind.name().to_string(),
            Type::Pointer(PointerKind::Address) => "POINTER".to_string(),
            Type::Pointer(PointerKind::String) => "STRING".to_string(),
            Type::Pointer(PointerKind::Buffer(Direction::In)) => "BUFFER_IN".to_string(),
            Type::Pointer(PointerKind::Buffer(Direction::Out)) => "BUFFER_OUT".to_string(),
            Type::Pointer(PointerKind::Buffer(Direction::InOut)) => "BUFFER_INOUT".to_string(),
            Type::Mapped(m) => format!("Mapped({:?})", m.converter),
            Type::Struct(layout) => format!("Struct({})", layout.describe()),
            Type::StructByReference(layout) => {
                format!("StructByReference({})", layout.describe())
            }
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Primitive constants in declaration order.
const BUILTIN: &[(&str, BuiltinSpec)] = &[
    ("INT8", BuiltinSpec::Prim(PrimitiveKind::Int8)),
    ("UINT8", BuiltinSpec::Prim(PrimitiveKind::UInt8)),
    ("INT16", BuiltinSpec::Prim(PrimitiveKind::Int16)),
    ("UINT16", BuiltinSpec::Prim(PrimitiveKind::UInt16)),
    ("INT32", BuiltinSpec::Prim(PrimitiveKind::Int32)),
    ("UINT32", BuiltinSpec::Prim(PrimitiveKind::UInt32)),
    ("INT64", BuiltinSpec::Prim(PrimitiveKind::Int64)),
    ("UINT64", BuiltinSpec::Prim(PrimitiveKind::UInt64)),
    ("LONG", BuiltinSpec::Prim(PrimitiveKind::Long)),
    ("ULONG", BuiltinSpec::Prim(PrimitiveKind::ULong)),
    ("FLOAT32", BuiltinSpec::Prim(PrimitiveKind::Float32)),
    ("FLOAT64", BuiltinSpec::Prim(PrimitiveKind::Float64)),
    ("LONGDOUBLE", BuiltinSpec::Prim(PrimitiveKind::LongDouble)),
    ("BOOL", BuiltinSpec::Prim(PrimitiveKind::Bool)),
    ("VOID", BuiltinSpec::Void),
    ("POINTER", BuiltinSpec::Pointer(PointerKind::Address)),
];

/// Alias name -> canonical constant name.
const ALIASES: &[(&str, &str)] = &[
    ("SCHAR", "INT8"),
    ("CHAR", "INT8"),
    ("UCHAR", "UINT8"),
    ("SHORT", "INT16"),
    ("SSHORT", "INT16"),
    ("USHORT", "UINT16"),
    ("INT", "INT32"),
    ("SINT", "INT32"),
    ("UINT", "UINT32"),
    ("LONG_LONG", "INT64"),
    ("SLONG_LONG", "INT64"),
    ("ULONG_LONG", "UINT64"),
    ("SLONG", "LONG"),
    ("FLOAT", "FLOAT32"),
    ("DOUBLE", "FLOAT64"),
    ("LONG_DOUBLE", "LONGDOUBLE"),
];

#[derive(Clone, Copy)]
enum BuiltinSpec {
    Prim(PrimitiveKind),
    Void,
    Pointer(PointerKind),
}

impl BuiltinSpec {
    fn to_type(self) -> Type {
        match self {
            BuiltinSpec::Prim(kind) => Type::primitive(kind),
            BuiltinSpec::Void => Type::Void,
            BuiltinSpec::Pointer(kind) => Type::Pointer(kind),
        }
    }
}

/// Immutable name table resolving type specifications to canonical types.
///
/// Built once and shared by reference; nothing mutates it afterwards, so
/// concurrent readers need no locking.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    /// Primitive constants (`INT32`, `POINTER`, ...)
    types: BTreeMap<String, Type>,
    /// Every resolvable name, in both upper- and lower-case spelling
    typedefs: HashMap<String, Type>,
}

static GLOBAL: Lazy<TypeRegistry> = Lazy::new(TypeRegistry::new);

impl TypeRegistry {
    /// Registry holding the fixed alias table.
    pub fn new() -> Self {
        let mut types = BTreeMap::new();
        let mut typedefs = HashMap::new();

        for (name, spec) in BUILTIN {
            let ty = spec.to_type();
            types.insert(name.to_string(), ty.clone());
            insert_both(&mut typedefs, name, ty);
        }
        for (alias, target) in ALIASES {
            if let Some(ty) = types.get(*target) {
                insert_both(&mut typedefs, alias, ty.clone());
            }
        }
        insert_both(&mut typedefs, "STRING", Type::string());
        insert_both(&mut typedefs, "BUFFER_IN", Type::buffer(Direction::In));
        insert_both(&mut typedefs, "BUFFER_OUT", Type::buffer(Direction::Out));
        insert_both(&mut typedefs, "BUFFER_INOUT", Type::buffer(Direction::InOut));
        insert_both(&mut typedefs, "VARARGS", Type::Varargs);

        Self { types, typedefs }
    }

    /// The process-wide registry with the fixed table only.
    pub fn global() -> &'static TypeRegistry {
        &GLOBAL
    }

    /// Fixed table plus the `[typedefs]` section of a config.
    pub fn from_config(config: &FfiConfig) -> FfiResult<Self> {
        let mut registry = Self::new();
        for (name, target) in &config.typedefs {
            registry = registry.with_typedef(name, target)?;
        }
        Ok(registry)
    }

    /// Add an alias for an already-resolvable name. Consumes the registry so
    /// additions only happen while it is still being built.
    pub fn with_typedef(mut self, name: &str, target: &str) -> FfiResult<Self> {
        let ty = self
            .find(target)
            .cloned()
            .ok_or_else(|| FfiError::conversion("Symbol", Expected::Type))?;
        tracing::debug!(alias = name, target, "registered typedef");
        self.typedefs.insert(name.to_string(), ty);
        Ok(self)
    }

    /// Add an alias for an arbitrary type (struct, mapped) while building.
    pub fn with_type(mut self, name: &str, ty: Type) -> Self {
        self.typedefs.insert(name.to_string(), ty);
        self
    }

    /// Case-sensitive name lookup.
    pub fn find(&self, name: &str) -> Option<&Type> {
        self.typedefs.get(name)
    }

    /// Resolve a type specification.
    ///
    /// A `Type` passes through unchanged; a name-like value is looked up in
    /// the alias table; anything else fails naming its concrete kind.
    pub fn resolve(&self, spec: &Value) -> FfiResult<Type> {
        match spec {
            Value::Type(ty) => Ok(ty.clone()),
            Value::Symbol(name) | Value::String(name) => self
                .find(name)
                .cloned()
                .ok_or_else(|| FfiError::conversion(spec.kind_name(), Expected::Type)),
            other => Err(FfiError::conversion(other.kind_name(), Expected::Type)),
        }
    }

    /// Resolve a name given as plain text.
    pub fn resolve_name(&self, name: &str) -> FfiResult<Type> {
        self.resolve(&Value::sym(name))
    }

    /// Primitive constants, sorted by name.
    pub fn types(&self) -> impl Iterator<Item = (&str, &Type)> {
        self.types.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// All resolvable names, sorted.
    pub fn typedef_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.typedefs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_both(map: &mut HashMap<String, Type>, name: &str, ty: Type) {
    map.insert(name.to_ascii_lowercase(), ty.clone());
    map.insert(name.to_string(), ty);
}
