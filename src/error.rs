//! Error types shared by every part of the binding engine.

use std::fmt;

use thiserror::Error;

/// The kind a value was expected to be coerced into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Expected {
    Type,
    Symbol,
    String,
    Integer,
    Float,
    Bool,
    Pointer,
    Buffer,
    Struct,
}

impl fmt::Display for Expected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Expected::Type => "Type",
            Expected::Symbol => "Symbol",
            Expected::String => "String",
            Expected::Integer => "Integer",
            Expected::Float => "Float",
            Expected::Bool => "Bool",
            Expected::Pointer => "Pointer",
            Expected::Buffer => "Buffer",
            Expected::Struct => "Struct",
        };
        f.write_str(name)
    }
}

/// Errors raised while resolving types, opening libraries, laying out
/// structs or calling into native code.
///
/// A fault inside the native callee itself (bad address, mismatched ABI,
/// stack corruption) is never reported through this type: it is a
/// precondition violation of [`crate::Function::call`] and takes the
/// process down.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FfiError {
    /// Uniform coercion failure.
    #[error("can't convert {from} into {into}")]
    Conversion { from: String, into: Expected },

    /// A name has no match in its library or in the process symbol table.
    #[error("{}", unresolved_message(.name, .library.as_deref()))]
    UnresolvedSymbol {
        name: String,
        library: Option<String>,
    },

    /// Duplicate field name, overlapping or misaligned explicit offset.
    #[error("struct layout error: {0}")]
    StructLayout(String),

    /// The dynamic linker refused to open a library.
    #[error("could not open library '{library}': {reason}")]
    Load { library: String, reason: String },

    /// Argument count does not match the bound signature.
    #[error("{}", arg_count_message(.expected, .got, .variadic))]
    ArgCount {
        expected: usize,
        got: usize,
        variadic: bool,
    },

    /// A signature that can never be called.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// A value of an acceptable kind that has no native representation.
    #[error("argument {index}: {reason}")]
    Marshal { index: usize, reason: String },

    /// Out-of-bounds or null access through a pointer.
    #[error("memory access error: {0}")]
    Memory(String),

    /// A construct the call interface cannot express.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

fn unresolved_message(name: &str, library: Option<&str>) -> String {
    match library {
        Some(lib) => format!("unresolved symbol '{}' in '{}'", name, lib),
        None => format!("unresolved symbol '{}'", name),
    }
}

fn arg_count_message(expected: &usize, got: &usize, variadic: &bool) -> String {
    if *variadic {
        format!("wrong number of arguments ({} for at least {})", got, expected)
    } else {
        format!("wrong number of arguments ({} for {})", got, expected)
    }
}

impl FfiError {
    /// Build the uniform "can't convert X into Y" failure.
    pub fn conversion(from: impl Into<String>, into: Expected) -> Self {
        FfiError::Conversion {
            from: from.into(),
            into,
        }
    }

    pub fn unresolved(name: impl Into<String>, library: Option<&str>) -> Self {
        FfiError::UnresolvedSymbol {
            name: name.into(),
            library: library.map(str::to_string),
        }
    }

    pub fn layout(reason: impl Into<String>) -> Self {
        FfiError::StructLayout(reason.into())
    }

    pub fn marshal(index: usize, reason: impl Into<String>) -> Self {
        FfiError::Marshal {
            index,
            reason: reason.into(),
        }
    }

    /// Attribute a marshaling failure to argument `index`.
    pub fn at_argument(self, index: usize) -> Self {
        match self {
            FfiError::Marshal { reason, .. } => FfiError::Marshal { index, reason },
            other => other,
        }
    }

    /// Whether this is the uniform coercion failure.
    pub fn is_conversion(&self) -> bool {
        matches!(self, FfiError::Conversion { .. })
    }
}

/// Result type for binding operations.
pub type FfiResult<T> = Result<T, FfiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_message() {
        let err = FfiError::conversion("Float", Expected::String);
        assert_eq!(err.to_string(), "can't convert Float into String");
        assert!(err.is_conversion());
    }

    #[test]
    fn test_unresolved_message() {
        let err = FfiError::unresolved("missing_fn", Some("libm.so.6"));
        assert_eq!(
            err.to_string(),
            "unresolved symbol 'missing_fn' in 'libm.so.6'"
        );
        let err = FfiError::unresolved("missing_fn", None);
        assert_eq!(err.to_string(), "unresolved symbol 'missing_fn'");
    }

    #[test]
    fn test_arg_count_message() {
        let err = FfiError::ArgCount {
            expected: 2,
            got: 3,
            variadic: false,
        };
        assert_eq!(err.to_string(), "wrong number of arguments (3 for 2)");

        let err = FfiError::ArgCount {
            expected: 1,
            got: 0,
            variadic: true,
        };
        assert_eq!(
            err.to_string(),
            "wrong number of arguments (0 for at least 1)"
        );
    }
}
