//! Function binding and invocation
//!
//! A [`Function`] pairs a [`Signature`] with a target symbol. Calling it
//! checks arity, marshals arguments into a [`CallFrame`], dispatches through
//! a cached [`CallDescriptor`] and decodes the result.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::converter::{DataConverter, Enums};
use crate::descriptor::{CallDescriptor, CallingConvention};
use crate::error::{Expected, FfiError, FfiResult};
use crate::loader::Symbol;
use crate::marshal::{decode_return, promote_vararg, return_slot, vararg_type, CallFrame};
use crate::namespace::{AttachedFunction, Namespace};
use crate::signature::Signature;
use crate::types::{Type, TypeRegistry};
use crate::value::Value;

/// Per-function options.
#[derive(Debug, Clone, Default)]
pub struct FunctionOptions {
    pub convention: CallingConvention,
    /// Symbolic names for integer arguments and results
    pub enums: Option<Arc<dyn DataConverter>>,
}

impl FunctionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn convention(mut self, convention: CallingConvention) -> Self {
        self.convention = convention;
        self
    }

    pub fn enums(mut self, enums: Enums) -> Self {
        self.enums = Some(Arc::new(enums));
        self
    }

    /// Read options from `[key, value]` pairs; unknown keys are ignored.
    ///
    /// `convention` takes a name (`default`, `c`, `stdcall`); `enums` takes
    /// an enum table or a mapped type carrying one.
    pub fn from_value(spec: &Value) -> FfiResult<Self> {
        let mut options = Self::default();
        let items = match spec {
            Value::Nil => return Ok(options),
            Value::Array(items) => items,
            other => return Err(FfiError::conversion(other.kind_name(), Expected::Symbol)),
        };
        for item in items {
            let (key, value) = match item {
                Value::Array(pair) if pair.len() == 2 => (&pair[0], &pair[1]),
                other => return Err(FfiError::conversion(other.kind_name(), Expected::Symbol)),
            };
            match key.as_name() {
                Some("convention") => {
                    let name = value
                        .as_name()
                        .ok_or_else(|| FfiError::conversion(value.kind_name(), Expected::Symbol))?;
                    options.convention = CallingConvention::from_name(name)?;
                }
                Some("enums") => {
                    options.enums = Some(match value {
                        Value::Type(Type::Mapped(m)) => Arc::clone(m.converter()),
                        other => Arc::new(Enums::from_value(other)?),
                    });
                }
                Some(key) => tracing::trace!(key, "ignoring unknown function option"),
                None => return Err(FfiError::conversion(key.kind_name(), Expected::Symbol)),
            }
        }
        Ok(options)
    }
}

struct FunctionInner {
    signature: Signature,
    symbol: Symbol,
    options: FunctionOptions,
    /// Descriptor for the fixed parameter list
    descriptor: OnceCell<Arc<CallDescriptor>>,
    /// Descriptors per distinct trailing-argument type list
    variadic: Mutex<HashMap<Vec<String>, Arc<CallDescriptor>>>,
}

/// A native function bound to a signature.
///
/// Cheap to clone; clones share the descriptor cache.
#[derive(Clone)]
pub struct Function {
    inner: Arc<FunctionInner>,
}

impl Function {
    /// Bind from host values, resolving types through the global registry.
    pub fn new(
        ret_spec: &Value,
        arg_specs: &[Value],
        name_or_symbol: &Value,
        options: &FunctionOptions,
    ) -> FfiResult<Self> {
        Self::new_in(TypeRegistry::global(), ret_spec, arg_specs, name_or_symbol, options)
    }

    /// Bind from host values, resolving types through `registry`.
    pub fn new_in(
        registry: &TypeRegistry,
        ret_spec: &Value,
        arg_specs: &[Value],
        name_or_symbol: &Value,
        options: &FunctionOptions,
    ) -> FfiResult<Self> {
        let ret = registry.resolve(ret_spec)?;
        let args = arg_specs
            .iter()
            .map(|spec| registry.resolve(spec))
            .collect::<FfiResult<Vec<_>>>()?;
        let symbol = match name_or_symbol {
            Value::LibrarySymbol(sym) => sym.clone(),
            Value::String(name) | Value::Symbol(name) => Symbol::new(name.as_str()),
            other => return Err(FfiError::conversion(other.kind_name(), Expected::Symbol)),
        };
        Self::from_signature(Signature::new(ret, args)?, symbol, options.clone())
    }

    /// Bind already-resolved types.
    pub fn from_signature(
        signature: Signature,
        symbol: Symbol,
        options: FunctionOptions,
    ) -> FfiResult<Self> {
        Ok(Self {
            inner: Arc::new(FunctionInner {
                signature,
                symbol,
                options,
                descriptor: OnceCell::new(),
                variadic: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Name of the native function this binds.
    pub fn target_name(&self) -> &str {
        self.inner.symbol.name()
    }

    pub fn symbol(&self) -> &Symbol {
        &self.inner.symbol
    }

    pub fn signature(&self) -> &Signature {
        &self.inner.signature
    }

    pub fn ret_type(&self) -> &Type {
        &self.inner.signature.ret
    }

    /// Declared parameter types, including a trailing `VARARGS` marker.
    pub fn arg_types(&self) -> Vec<Type> {
        self.inner.signature.arg_types()
    }

    pub fn options(&self) -> &FunctionOptions {
        &self.inner.options
    }

    /// Install this function on `namespace` as `exposed_name`.
    ///
    /// The native address is not looked up here: the first call scans the
    /// namespace's libraries in registration order.
    pub fn attach<N: Namespace + ?Sized>(&self, namespace: &mut N, exposed_name: &str) {
        let attached = AttachedFunction::new(self.clone(), namespace.ffi_libraries());
        tracing::debug!(
            name = exposed_name,
            target = self.target_name(),
            "attached function"
        );
        namespace.install(exposed_name, attached);
    }

    /// Call the bound symbol.
    pub fn call(&self, args: &[Value]) -> FfiResult<Value> {
        self.invoke(args, || self.inner.symbol.address())
    }

    /// Arity check, marshal, resolve through `resolve`, dispatch, unmarshal.
    pub(crate) fn invoke(
        &self,
        args: &[Value],
        resolve: impl FnOnce() -> FfiResult<usize>,
    ) -> FfiResult<Value> {
        let sig = &self.inner.signature;
        sig.check_arity(args.len())?;

        let name = self.target_name();
        let enums = self.inner.options.enums.as_ref();
        let mut frame = CallFrame::new(name, enums, args.len());
        let mut extra = Vec::new();
        for (i, value) in args.iter().enumerate() {
            match sig.params.get(i) {
                Some(ty) => frame.push(i, ty, value)?,
                None => {
                    let ty = vararg_type(value, TypeRegistry::global()).map_err(|e| e.at_argument(i))?;
                    frame.push(i, &ty, &promote_vararg(value))?;
                    extra.push(ty);
                }
            }
        }

        let descriptor = self.descriptor(&extra)?;
        let address = resolve()?;

        let mut slot = return_slot(&sig.ret);
        let mut arg_ptrs = frame.arg_pointers();
        tracing::trace!(function = name, nargs = args.len(), "calling native function");
        // SAFETY: the descriptor was built from this signature and every
        // argument pointer refers to a frame slot encoded for its type. A
        // mismatch with the real native signature is the caller's contract.
        unsafe { descriptor.call(address, slot.as_mut_ptr(), &mut arg_ptrs) };

        // A returned string may point into a frame-owned argument copy.
        let result = decode_return(&sig.ret, &slot, name, enums);
        frame.finish();
        result
    }

    /// Descriptor for the fixed parameters plus `extra` trailing types.
    fn descriptor(&self, extra: &[Type]) -> FfiResult<Arc<CallDescriptor>> {
        let sig = &self.inner.signature;
        let convention = self.inner.options.convention;
        if !sig.variadic {
            return self
                .inner
                .descriptor
                .get_or_try_init(|| {
                    CallDescriptor::new(&sig.ret, &sig.params, None, convention).map(Arc::new)
                })
                .cloned();
        }

        let key: Vec<String> = extra.iter().map(Type::name).collect();
        let mut cache = self.inner.variadic.lock();
        if let Some(desc) = cache.get(&key) {
            return Ok(Arc::clone(desc));
        }
        let mut all = sig.params.clone();
        all.extend_from_slice(extra);
        let desc = Arc::new(CallDescriptor::new(
            &sig.ret,
            &all,
            Some(sig.params.len()),
            convention,
        )?);
        cache.insert(key, Arc::clone(&desc));
        Ok(desc)
    }

    /// Number of descriptors built so far.
    pub fn cached_descriptors(&self) -> usize {
        usize::from(self.inner.descriptor.get().is_some()) + self.inner.variadic.lock().len()
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("target", &self.target_name())
            .field("signature", &self.inner.signature.to_string())
            .field("convention", &self.inner.options.convention)
            .finish()
    }
}
