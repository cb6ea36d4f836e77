//! Custom marshaling hooks.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Expected, FfiError, FfiResult};
use crate::platform::PrimitiveKind;
use crate::types::Type;
use crate::value::Value;

/// Where a conversion is happening, handed to converters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertContext<'a> {
    /// Argument `index` of the named function
    Argument { function: &'a str, index: usize },
    /// Return value of the named function
    Return { function: &'a str },
    /// A struct field read or write
    Field { name: &'a str },
    /// Direct use outside of any call
    Standalone,
}

/// Capability a type adopts to take over its own marshaling.
///
/// Every method has a no-op default returning [`Value::Nil`] (or no native
/// type), so an implementation can adopt the contract one method at a time.
pub trait DataConverter: Send + Sync + fmt::Debug {
    /// Native type backing values of this kind.
    fn native_type(&self) -> Option<Type> {
        None
    }

    /// Host value to a value the native type can encode.
    fn to_native(&self, _value: &Value, _context: &ConvertContext<'_>) -> FfiResult<Value> {
        Ok(Value::Nil)
    }

    /// Decoded native value back to the host representation.
    fn from_native(&self, _native: &Value, _context: &ConvertContext<'_>) -> FfiResult<Value> {
        Ok(Value::Nil)
    }
}

/// Bidirectional table of symbolic names and integer values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enums {
    by_name: HashMap<String, i64>,
    by_value: HashMap<i64, String>,
    order: Vec<String>,
}

impl Enums {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a name; the first name bound to a value wins reverse lookups.
    pub fn with(mut self, name: impl Into<String>, value: i64) -> Self {
        self.insert(name.into(), value);
        self
    }

    fn insert(&mut self, name: String, value: i64) {
        if !self.by_name.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.by_value.entry(value).or_insert_with(|| name.clone());
        self.by_name.insert(name, value);
    }

    /// Build from a host array.
    ///
    /// Elements are either `[name, value]` pairs or bare names, which take
    /// the previous value plus one (starting at zero).
    pub fn from_value(spec: &Value) -> FfiResult<Self> {
        let items = match spec {
            Value::Array(items) => items,
            other => return Err(FfiError::conversion(other.kind_name(), Expected::Symbol)),
        };
        let mut enums = Self::new();
        let mut next = 0i64;
        for item in items {
            let (name, value) = match item {
                Value::Array(pair) if pair.len() == 2 => {
                    let name = pair[0]
                        .as_name()
                        .ok_or_else(|| FfiError::conversion(pair[0].kind_name(), Expected::Symbol))?;
                    let value = pair[1]
                        .as_i128()
                        .and_then(|v| i64::try_from(v).ok())
                        .ok_or_else(|| FfiError::conversion(pair[1].kind_name(), Expected::Integer))?;
                    (name.to_string(), value)
                }
                Value::Symbol(name) | Value::String(name) => (name.clone(), next),
                other => return Err(FfiError::conversion(other.kind_name(), Expected::Symbol)),
            };
            next = value.wrapping_add(1);
            enums.insert(name, value);
        }
        Ok(enums)
    }

    pub fn value_of(&self, name: &str) -> Option<i64> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, value: i64) -> Option<&str> {
        self.by_value.get(&value).map(String::as_str)
    }

    /// Names in insertion order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl DataConverter for Enums {
    fn native_type(&self) -> Option<Type> {
        Some(Type::primitive(PrimitiveKind::Int32))
    }

    fn to_native(&self, value: &Value, _context: &ConvertContext<'_>) -> FfiResult<Value> {
        match value {
            Value::Symbol(name) => self
                .value_of(name)
                .map(Value::Integer)
                .ok_or_else(|| FfiError::conversion("Symbol", Expected::Integer)),
            Value::Integer(_) | Value::Unsigned(_) => Ok(value.clone()),
            other => Err(FfiError::conversion(other.kind_name(), Expected::Integer)),
        }
    }

    fn from_native(&self, native: &Value, _context: &ConvertContext<'_>) -> FfiResult<Value> {
        let name = match native {
            Value::Integer(v) => self.name_of(*v),
            _ => None,
        };
        Ok(name.map(Value::sym).unwrap_or_else(|| native.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Nothing;

    impl DataConverter for Nothing {}

    #[test]
    fn test_defaults_return_nil() {
        let conv = Nothing;
        assert!(conv.native_type().is_none());
        let ctx = ConvertContext::Standalone;
        assert_eq!(conv.to_native(&Value::Integer(1), &ctx).unwrap(), Value::Nil);
        assert_eq!(conv.from_native(&Value::Integer(1), &ctx).unwrap(), Value::Nil);
    }

    #[test]
    fn test_enums_auto_numbering() {
        let spec = Value::Array(vec![
            Value::sym("red"),
            Value::sym("green"),
            Value::Array(vec![Value::sym("blue"), Value::Integer(10)]),
            Value::sym("alpha"),
        ]);
        let enums = Enums::from_value(&spec).unwrap();
        assert_eq!(enums.value_of("red"), Some(0));
        assert_eq!(enums.value_of("green"), Some(1));
        assert_eq!(enums.value_of("blue"), Some(10));
        assert_eq!(enums.value_of("alpha"), Some(11));
        assert_eq!(enums.names().len(), 4);
    }

    #[test]
    fn test_enums_convert_both_ways() {
        let enums = Enums::new().with("ok", 0).with("err", -1);
        let ctx = ConvertContext::Standalone;
        assert_eq!(
            enums.to_native(&Value::sym("err"), &ctx).unwrap(),
            Value::Integer(-1)
        );
        assert_eq!(
            enums.from_native(&Value::Integer(0), &ctx).unwrap(),
            Value::sym("ok")
        );
        assert_eq!(
            enums.from_native(&Value::Integer(7), &ctx).unwrap(),
            Value::Integer(7)
        );
        let err = enums.to_native(&Value::sym("nope"), &ctx).unwrap_err();
        assert_eq!(err.to_string(), "can't convert Symbol into Integer");
    }
}
