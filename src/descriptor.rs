//! Call-interface descriptors built on libffi.

use std::fmt;
use std::os::raw::c_void;

use libffi::middle::{Cif, CodePtr, Type as FfiType};
use libffi::raw;

use crate::error::{FfiError, FfiResult};
use crate::platform::PrimitiveKind;
use crate::types::Type;

/// Calling convention override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallingConvention {
    /// Platform C convention
    #[default]
    Default,
    /// Win32 `__stdcall`; identical to the default on every other target
    Stdcall,
}

impl CallingConvention {
    pub fn from_name(name: &str) -> FfiResult<Self> {
        match name {
            "default" | "c" | "cdecl" => Ok(CallingConvention::Default),
            "stdcall" => Ok(CallingConvention::Stdcall),
            other => Err(FfiError::InvalidSignature(format!(
                "unknown calling convention '{}'",
                other
            ))),
        }
    }

    fn abi(self) -> raw::ffi_abi {
        match self {
            #[cfg(all(windows, target_arch = "x86"))]
            CallingConvention::Stdcall => raw::ffi_abi_FFI_STDCALL,
            _ => raw::ffi_abi_FFI_DEFAULT_ABI,
        }
    }
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallingConvention::Default => write!(f, "default"),
            CallingConvention::Stdcall => write!(f, "stdcall"),
        }
    }
}

/// A prepared `ffi_cif` for one exact signature.
pub struct CallDescriptor {
    cif: Cif,
    nargs: usize,
}

// The cif is only read after preparation; libffi's call path does not
// mutate it.
unsafe impl Send for CallDescriptor {}
unsafe impl Sync for CallDescriptor {}

impl CallDescriptor {
    /// Prepare a descriptor. `fixed` is the number of named parameters of a
    /// variadic function, `None` for a fixed-arity one.
    pub fn new(
        ret: &Type,
        args: &[Type],
        fixed: Option<usize>,
        convention: CallingConvention,
    ) -> FfiResult<Self> {
        let ret_ty = ffi_type(ret)?;
        let arg_tys = args.iter().map(ffi_type).collect::<FfiResult<Vec<_>>>()?;
        let mut cif = match fixed {
            Some(nfixed) => Cif::new_variadic(arg_tys, nfixed, ret_ty),
            None => Cif::new(arg_tys, ret_ty),
        };
        cif.set_abi(convention.abi());
        tracing::debug!(
            ret = %ret,
            args = ?args.iter().map(Type::name).collect::<Vec<_>>(),
            variadic = fixed.is_some(),
            %convention,
            "built call descriptor"
        );
        Ok(Self {
            cif,
            nargs: args.len(),
        })
    }

    pub fn arg_count(&self) -> usize {
        self.nargs
    }

    /// Perform the foreign call.
    ///
    /// # Safety
    ///
    /// `code` must be a function whose real signature matches this
    /// descriptor; `ret` must point to at least `max(ret size, word)` bytes
    /// suitably aligned; `args` must hold one pointer per argument, each to
    /// a correctly encoded value. A violation is undefined behaviour and is
    /// not reported as an error.
    pub unsafe fn call(&self, code: usize, ret: *mut c_void, args: &mut [*mut c_void]) {
        debug_assert_eq!(args.len(), self.nargs);
        let code = CodePtr(code as *mut c_void);
        raw::ffi_call(
            self.cif.as_raw_ptr(),
            Some(*code.as_safe_fun()),
            ret,
            args.as_mut_ptr(),
        );
    }
}

impl fmt::Debug for CallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallDescriptor")
            .field("nargs", &self.nargs)
            .finish()
    }
}

/// libffi type for a resolved type.
fn ffi_type(ty: &Type) -> FfiResult<FfiType> {
    match ty {
        Type::Void => Ok(FfiType::void()),
        Type::Primitive(p) => Ok(match p.kind {
            PrimitiveKind::Int8 => FfiType::i8(),
            PrimitiveKind::UInt8 => FfiType::u8(),
            PrimitiveKind::Int16 => FfiType::i16(),
            PrimitiveKind::UInt16 => FfiType::u16(),
            PrimitiveKind::Int32 => FfiType::i32(),
            PrimitiveKind::UInt32 => FfiType::u32(),
            PrimitiveKind::Int64 => FfiType::i64(),
            PrimitiveKind::UInt64 => FfiType::u64(),
            PrimitiveKind::Long => FfiType::c_long(),
            PrimitiveKind::ULong => FfiType::c_ulong(),
            PrimitiveKind::Float32 => FfiType::f32(),
            PrimitiveKind::Float64 => FfiType::f64(),
            PrimitiveKind::LongDouble => FfiType::longdouble(),
            PrimitiveKind::Bool => FfiType::u8(),
        }),
        Type::Pointer(_) | Type::StructByReference(_) => Ok(FfiType::pointer()),
        Type::Mapped(m) => ffi_type(&m.native_type()?),
        Type::Struct(layout) => {
            if !layout.is_natural() {
                return Err(FfiError::Unsupported(format!(
                    "struct {} has a packed, union or explicit-offset layout and cannot be passed by value",
                    layout.describe()
                )));
            }
            if layout.fields().is_empty() {
                return Err(FfiError::Unsupported(
                    "empty struct cannot be passed by value".into(),
                ));
            }
            let fields = layout
                .fields()
                .iter()
                .map(|f| ffi_type(f.ty()))
                .collect::<FfiResult<Vec<_>>>()?;
            Ok(FfiType::structure(fields))
        }
        Type::Varargs => Err(FfiError::InvalidSignature(
            "VARARGS has no native representation".into(),
        )),
    }
}
