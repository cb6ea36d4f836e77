//! Namespaces that expose bound functions by name.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::config::FfiConfig;
use crate::error::{FfiError, FfiResult};
use crate::function::{Function, FunctionOptions};
use crate::loader::DynamicLibrary;
use crate::types::TypeRegistry;
use crate::value::Value;

/// Libraries registered on a namespace, shared with the functions attached
/// to it so later registrations are seen at first call.
pub type LibraryList = Arc<RwLock<Vec<DynamicLibrary>>>;

/// A container that bound functions can be installed on.
pub trait Namespace {
    /// Live list of libraries to search, in registration order.
    fn ffi_libraries(&self) -> LibraryList;

    /// Make `function` callable as `name`.
    fn install(&mut self, name: &str, function: AttachedFunction);
}

/// A [`Function`] installed on a namespace, resolved against that
/// namespace's libraries on first call.
#[derive(Clone)]
pub struct AttachedFunction {
    function: Function,
    libraries: LibraryList,
    address: Arc<OnceCell<FfiResult<usize>>>,
}

impl AttachedFunction {
    pub(crate) fn new(function: Function, libraries: LibraryList) -> Self {
        Self {
            function,
            libraries,
            address: Arc::new(OnceCell::new()),
        }
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    /// Address of the first library exposing the target name, scanning the
    /// namespace's libraries as registered at the time of the first call.
    /// With none registered the process-wide table is searched. The outcome
    /// is cached, failures included.
    pub fn address(&self) -> FfiResult<usize> {
        self.address
            .get_or_init(|| self.resolve())
            .clone()
    }

    fn resolve(&self) -> FfiResult<usize> {
        let name = self.function.target_name();
        let libraries = self.libraries.read().clone();
        if libraries.is_empty() {
            let process = DynamicLibrary::process()?;
            return process.find_symbol(name)?.address();
        }
        for lib in &libraries {
            let found = lib.find_symbol(name).and_then(|sym| sym.address());
            if let Ok(addr) = found {
                tracing::debug!(symbol = name, library = lib.name(), "attached function resolved");
                return Ok(addr);
            }
        }
        let searched: Vec<&str> = libraries.iter().map(DynamicLibrary::name).collect();
        tracing::warn!(symbol = name, libraries = ?searched, "attached function unresolved");
        Err(FfiError::unresolved(name, Some(searched.join(", ").as_str())))
    }

    pub fn call(&self, args: &[Value]) -> FfiResult<Value> {
        self.function.invoke(args, || self.address())
    }
}

impl fmt::Debug for AttachedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedFunction")
            .field("function", &self.function)
            .field("libraries", &self.libraries.read().len())
            .finish()
    }
}

/// A plain namespace: an ordered library list and a table of functions.
#[derive(Debug)]
pub struct Module {
    name: String,
    libraries: LibraryList,
    functions: BTreeMap<String, AttachedFunction>,
    search_paths: Vec<PathBuf>,
    default_flags: i32,
    registry: TypeRegistry,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            libraries: LibraryList::default(),
            functions: BTreeMap::new(),
            search_paths: Vec::new(),
            default_flags: DynamicLibrary::LAZY,
            registry: TypeRegistry::global().clone(),
        }
    }

    /// Module using the search paths, open flags and typedefs of `config`.
    pub fn with_config(name: impl Into<String>, config: &FfiConfig) -> FfiResult<Self> {
        let mut module = Self::new(name);
        module.search_paths = config.library.search_paths.clone();
        module.default_flags = config.library.default_flags;
        module.registry = TypeRegistry::from_config(config)?;
        Ok(module)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Open `library` with the module's default flags and register it.
    pub fn ffi_lib(&mut self, library: &str) -> FfiResult<DynamicLibrary> {
        let lib = DynamicLibrary::open_in(Some(library), self.default_flags, &self.search_paths)?;
        self.add_library(lib.clone());
        Ok(lib)
    }

    /// Register `library` after those already present. Functions attached
    /// earlier still see it if they have not been called yet.
    pub fn add_library(&mut self, library: DynamicLibrary) {
        self.libraries.write().push(library);
    }

    /// Registered libraries, in search order.
    pub fn libraries(&self) -> Vec<DynamicLibrary> {
        self.libraries.read().clone()
    }

    /// Bind `target` with the given signature and attach it as `exposed`.
    pub fn attach_function(
        &mut self,
        exposed: &str,
        target: &str,
        ret: &Value,
        args: &[Value],
        options: &FunctionOptions,
    ) -> FfiResult<Function> {
        let function = Function::new_in(&self.registry, ret, args, &Value::from(target), options)?;
        function.attach(self, exposed);
        Ok(function)
    }

    pub fn function(&self, name: &str) -> Option<&AttachedFunction> {
        self.functions.get(name)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn call(&self, name: &str, args: &[Value]) -> FfiResult<Value> {
        self.functions
            .get(name)
            .ok_or_else(|| FfiError::unresolved(name, Some(self.name.as_str())))?
            .call(args)
    }
}

impl Namespace for Module {
    fn ffi_libraries(&self) -> LibraryList {
        Arc::clone(&self.libraries)
    }

    fn install(&mut self, name: &str, function: AttachedFunction) {
        self.functions.insert(name.to_string(), function);
    }
}
