//! Nativebind - data-driven foreign function binding
//!
//! Calls into native shared libraries from signatures, argument types and
//! struct layouts described at runtime. No per-function glue is generated:
//! types resolve through a [`TypeRegistry`], libraries open as
//! [`DynamicLibrary`] handles, and a [`Function`] marshals host [`Value`]s
//! through a cached libffi call descriptor.
//!
//! # Architecture
//!
//! ```text
//! TypeRegistry ──► Type ◄── StructLayout
//!                   │
//! DynamicLibrary ──► Symbol
//!                   │
//!                   ▼
//!               Function ──attach──► Namespace (Module)
//!                   │
//!                   ▼
//!     CallFrame ─► CallDescriptor (libffi) ─► native code
//! ```
//!
//! # Example
//!
//! ```no_run
//! use nativebind::{DynamicLibrary, Function, FunctionOptions, Value};
//!
//! let libm = DynamicLibrary::open(&Value::from("libm.so.6"), &Value::Integer(DynamicLibrary::LAZY as i64))?;
//! let pow = Function::new(
//!     &Value::sym("double"),
//!     &[Value::sym("double"), Value::sym("double")],
//!     &Value::LibrarySymbol(libm.find_symbol("pow")?),
//!     &FunctionOptions::new(),
//! )?;
//! assert_eq!(pow.call(&[Value::Float(3.0), Value::Integer(2)])?, Value::Float(9.0));
//! # Ok::<(), nativebind::FfiError>(())
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod converter;
pub mod descriptor;
pub mod error;
pub mod function;
pub mod layout;
pub mod loader;
pub mod logging;
mod marshal;
pub mod memory;
pub mod namespace;
pub mod platform;
pub mod signature;
pub mod types;
pub mod value;

pub use config::{ConfigError, FfiConfig};
pub use converter::{ConvertContext, DataConverter, Enums};
pub use descriptor::{CallDescriptor, CallingConvention};
pub use error::{Expected, FfiError, FfiResult};
pub use function::{Function, FunctionOptions};
pub use layout::{Field, FieldSpec, StructLayout, StructLayoutBuilder, StructValue};
pub use loader::{DynamicLibrary, Symbol, SymbolState};
pub use memory::Pointer;
pub use namespace::{AttachedFunction, LibraryList, Module, Namespace};
pub use platform::{LongDoubleFormat, Platform, PrimitiveKind};
pub use signature::Signature;
pub use types::{Direction, Mapped, PointerKind, Primitive, Type, TypeRegistry};
pub use value::{Buffer, Value};
