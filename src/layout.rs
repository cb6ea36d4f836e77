//! Struct Layout
//!
//! Computes field offsets, total size and alignment for composite types
//! described at runtime, following the host C ABI's sequential layout rules.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{Expected, FfiError, FfiResult};
use crate::memory::Pointer;
use crate::types::{Type, TypeRegistry};
use crate::value::Value;

/// A placed field.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    name: String,
    ty: Type,
    offset: usize,
}

impl Field {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.ty.size()
    }
}

/// One requested field before placement.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub ty: Type,
    pub offset: Option<usize>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            offset: None,
        }
    }

    /// Pin the field to an explicit byte offset.
    pub fn at(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Computed layout of a composite type.
#[derive(Debug, Clone, PartialEq)]
pub struct StructLayout {
    fields: Vec<Field>,
    size: usize,
    alignment: usize,
    /// Placement matches what the C ABI would compute on its own
    natural: bool,
    union: bool,
}

impl StructLayout {
    /// Sequential layout of `fields`, strict about overlap.
    pub fn new(fields: impl IntoIterator<Item = FieldSpec>) -> FfiResult<Arc<Self>> {
        let mut builder = StructLayoutBuilder::new();
        builder.fields.extend(fields);
        builder.build()
    }

    pub fn builder() -> StructLayoutBuilder {
        StructLayoutBuilder::new()
    }

    /// Layout from a host array of `[name, type]` or `[name, type, offset]`.
    pub fn from_value(spec: &Value, registry: &TypeRegistry) -> FfiResult<Arc<Self>> {
        let items = match spec {
            Value::Array(items) => items,
            other => return Err(FfiError::conversion(other.kind_name(), Expected::Struct)),
        };
        let mut builder = StructLayoutBuilder::new();
        for item in items {
            let parts = match item {
                Value::Array(parts) if parts.len() == 2 || parts.len() == 3 => parts,
                other => return Err(FfiError::conversion(other.kind_name(), Expected::Struct)),
            };
            let name = parts[0]
                .as_name()
                .ok_or_else(|| FfiError::conversion(parts[0].kind_name(), Expected::Symbol))?;
            let ty = registry.resolve(&parts[1])?;
            builder = match parts.get(2) {
                Some(offset) => {
                    let offset = offset
                        .as_i128()
                        .and_then(|v| usize::try_from(v).ok())
                        .ok_or_else(|| FfiError::conversion(offset.kind_name(), Expected::Integer))?;
                    builder.field_at(name, ty, offset)
                }
                None => builder.field(name, ty),
            };
        }
        builder.build()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn offset_of(&self, name: &str) -> Option<usize> {
        self.field(name).map(Field::offset)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Whether the struct can be passed by value through the call interface.
    pub fn is_natural(&self) -> bool {
        self.natural
    }

    pub fn is_union(&self) -> bool {
        self.union
    }

    /// Compact one-line form, e.g. `{x:INT32@0, y:FLOAT64@8}`.
    pub fn describe(&self) -> String {
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|f| format!("{}:{}@{}", f.name, f.ty, f.offset))
            .collect();
        format!("{{{}}}", fields.join(", "))
    }
}

impl fmt::Display for StructLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "size {} align {}", self.size, self.alignment)?;
        for field in &self.fields {
            writeln!(
                f,
                "  {:>4}  {:<16} {} ({} bytes)",
                field.offset,
                field.name,
                field.ty,
                field.size()
            )?;
        }
        Ok(())
    }
}

/// Incremental construction of a [`StructLayout`].
#[derive(Debug, Clone, Default)]
pub struct StructLayoutBuilder {
    fields: Vec<FieldSpec>,
    union: bool,
    allow_overlap: bool,
    packed: Option<usize>,
}

impl StructLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, ty: Type) -> Self {
        self.fields.push(FieldSpec::new(name, ty));
        self
    }

    pub fn field_at(mut self, name: impl Into<String>, ty: Type, offset: usize) -> Self {
        self.fields.push(FieldSpec::new(name, ty).at(offset));
        self
    }

    /// Every field defaults to offset 0 and overlap is permitted.
    pub fn union(mut self) -> Self {
        self.union = true;
        self.allow_overlap = true;
        self
    }

    /// Permit explicit offsets to overlap earlier fields.
    pub fn allow_overlap(mut self) -> Self {
        self.allow_overlap = true;
        self
    }

    /// Cap every field's alignment at `n` bytes (`n` a power of two).
    pub fn packed(mut self, n: usize) -> Self {
        self.packed = Some(n);
        self
    }

    pub fn build(self) -> FfiResult<Arc<StructLayout>> {
        if let Some(n) = self.packed {
            if !n.is_power_of_two() {
                return Err(FfiError::layout(format!(
                    "packing {} is not a power of two",
                    n
                )));
            }
        }

        let mut seen = HashSet::new();
        let mut fields = Vec::with_capacity(self.fields.len());
        let mut cursor = 0usize;
        let mut end = 0usize;
        let mut prev_offset = 0usize;
        let mut alignment = 1usize;
        let mut natural = !self.union && self.packed.is_none();

        for spec in self.fields {
            if !seen.insert(spec.name.clone()) {
                return Err(FfiError::layout(format!(
                    "duplicate field '{}'",
                    spec.name
                )));
            }
            let (size, natural_align) = spec.ty.size_align().ok_or_else(|| {
                FfiError::layout(format!(
                    "field '{}' has type {} with no size",
                    spec.name, spec.ty
                ))
            })?;
            let align = self.packed.map_or(natural_align, |n| natural_align.min(n));
            let computed = if self.union {
                0
            } else {
                round_up(cursor, align)?
            };

            let offset = match spec.offset {
                Some(explicit) => {
                    if explicit % align != 0 {
                        return Err(FfiError::layout(format!(
                            "field '{}' at offset {} is not {}-byte aligned",
                            spec.name, explicit, align
                        )));
                    }
                    if explicit < prev_offset {
                        return Err(FfiError::layout(format!(
                            "field '{}' at offset {} precedes the previous field at {}",
                            spec.name, explicit, prev_offset
                        )));
                    }
                    if explicit < end && !self.allow_overlap {
                        return Err(FfiError::layout(format!(
                            "field '{}' at offset {} overlaps bytes up to {}",
                            spec.name, explicit, end
                        )));
                    }
                    if explicit != computed {
                        natural = false;
                    }
                    explicit
                }
                None if computed < prev_offset => {
                    return Err(FfiError::layout(format!(
                        "field '{}' would be placed at {} before the previous field at {}",
                        spec.name, computed, prev_offset
                    )));
                }
                None => computed,
            };

            prev_offset = offset;
            cursor = offset.checked_add(size).ok_or_else(|| {
                FfiError::layout(format!(
                    "field '{}' at offset {} extends past the address space",
                    spec.name, offset
                ))
            })?;
            end = end.max(cursor);
            alignment = alignment.max(align);
            fields.push(Field {
                name: spec.name,
                ty: spec.ty,
                offset,
            });
        }

        let layout = StructLayout {
            fields,
            size: round_up(end, alignment)?,
            alignment,
            natural,
            union: self.union,
        };
        tracing::trace!(layout = %layout.describe(), size = layout.size, "computed struct layout");
        Ok(Arc::new(layout))
    }
}

fn round_up(value: usize, align: usize) -> FfiResult<usize> {
    value
        .div_ceil(align)
        .checked_mul(align)
        .ok_or_else(|| FfiError::layout(format!("offset {} overflows when aligned to {}", value, align)))
}

/// A struct instance: a layout over a block of memory.
#[derive(Clone)]
pub struct StructValue {
    layout: Arc<StructLayout>,
    memory: Pointer,
}

impl StructValue {
    /// Fresh zeroed instance.
    pub fn new(layout: Arc<StructLayout>) -> FfiResult<Self> {
        let memory = Pointer::allocate(layout.size())?;
        Ok(Self { layout, memory })
    }

    /// View existing memory through `layout`.
    pub fn at(layout: Arc<StructLayout>, memory: Pointer) -> Self {
        Self { layout, memory }
    }

    /// Fresh instance initialised from raw bytes.
    pub fn from_bytes(layout: Arc<StructLayout>, bytes: &[u8]) -> FfiResult<Self> {
        let value = Self::new(layout)?;
        let n = bytes.len().min(value.layout.size());
        value.memory.write_bytes(0, &bytes[..n])?;
        Ok(value)
    }

    pub fn layout(&self) -> &Arc<StructLayout> {
        &self.layout
    }

    pub fn pointer(&self) -> &Pointer {
        &self.memory
    }

    fn lookup(&self, name: &str) -> FfiResult<&Field> {
        self.layout
            .field(name)
            .ok_or_else(|| FfiError::layout(format!("no field '{}'", name)))
    }

    pub fn get(&self, name: &str) -> FfiResult<Value> {
        let field = self.lookup(name)?;
        self.memory.read(&field.ty, field.offset)
    }

    pub fn set(&self, name: &str, value: &Value) -> FfiResult<()> {
        let field = self.lookup(name)?;
        self.memory.write(&field.ty, field.offset, value)
    }

    pub fn to_bytes(&self) -> FfiResult<Vec<u8>> {
        self.memory.read_bytes(0, self.layout.size())
    }
}

impl PartialEq for StructValue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.layout, &other.layout) && self.memory == other.memory
    }
}

impl fmt::Debug for StructValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructValue")
            .field("layout", &self.layout.describe())
            .field("memory", &self.memory)
            .finish()
    }
}
