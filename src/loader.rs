//! Dynamic Library Loader
//!
//! Opens shared objects (or the running process itself) and hands out
//! [`Symbol`] handles whose addresses resolve eagerly or on first use
//! depending on the open flags.

use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::{Expected, FfiError, FfiResult};
use crate::memory::Pointer;
use crate::value::Value;

/// Display name of the process-wide handle.
pub const PROCESS_WIDE: &str = "[process]";

#[cfg(unix)]
mod sys {
    use std::os::raw::{c_int, c_void};

    pub(super) type Handle = libloading::os::unix::Library;

    pub(super) fn open(name: Option<&str>, flags: i32) -> Result<Handle, libloading::Error> {
        // SAFETY: running library initialisers is inherent to loading code.
        unsafe { Handle::open(name, native_flags(flags)) }
    }

    pub(super) fn lookup(handle: &Handle, name: &[u8]) -> Result<usize, libloading::Error> {
        // SAFETY: only the address is taken; it is never called here.
        unsafe { handle.get::<*mut c_void>(name).map(|sym| *sym as usize) }
    }

    /// The open-mode values are the Linux `RTLD_*` values; other systems
    /// get the same bits translated to their own constants.
    #[cfg(target_os = "linux")]
    fn native_flags(flags: i32) -> c_int {
        flags as c_int
    }

    #[cfg(not(target_os = "linux"))]
    fn native_flags(flags: i32) -> c_int {
        let mut out = 0;
        if flags & super::DynamicLibrary::LAZY != 0 {
            out |= libc::RTLD_LAZY;
        }
        if flags & super::DynamicLibrary::NOW != 0 {
            out |= libc::RTLD_NOW;
        }
        if flags & 0x100 != 0 {
            out |= libc::RTLD_GLOBAL;
        } else {
            out |= libc::RTLD_LOCAL;
        }
        out
    }
}

#[cfg(windows)]
mod sys {
    use std::os::raw::c_void;

    pub(super) type Handle = libloading::os::windows::Library;

    pub(super) fn open(name: Option<&str>, _flags: i32) -> Result<Handle, libloading::Error> {
        match name {
            // SAFETY: running library initialisers is inherent to loading code.
            Some(name) => unsafe { Handle::new(name) },
            None => Handle::this(),
        }
    }

    pub(super) fn lookup(handle: &Handle, name: &[u8]) -> Result<usize, libloading::Error> {
        // SAFETY: only the address is taken; it is never called here.
        unsafe { handle.get::<*mut c_void>(name).map(|sym| *sym as usize) }
    }
}

struct LibraryInner {
    /// `None` for the process-wide handle
    name: Option<String>,
    flags: i32,
    /// `Err` holds the linker's message for a lazily opened library that
    /// could not be found; every lookup in it fails.
    handle: Result<sys::Handle, String>,
    symbols: Mutex<HashMap<String, Symbol>>,
}

/// An opened shared object, or the running process's own symbol table.
///
/// Cloning shares the handle and its symbol cache. Handles are never
/// closed while a clone or a [`Symbol`] produced from it is alive.
#[derive(Clone)]
pub struct DynamicLibrary {
    inner: Arc<LibraryInner>,
}

static PROCESS: OnceCell<DynamicLibrary> = OnceCell::new();

impl DynamicLibrary {
    pub const LAZY: i32 = 1;
    pub const NOW: i32 = 2;
    pub const LOCAL: i32 = 0;
    /// Kept as the literal observed value rather than decomposed into bits.
    pub const GLOBAL: i32 = 257;

    /// Open from host values: `name` is nil (process-wide) or string-like,
    /// `flags` an integer. Both are validated before anything is opened.
    pub fn open(name: &Value, flags: &Value) -> FfiResult<Self> {
        let name = match name {
            Value::Nil => None,
            Value::String(s) | Value::Symbol(s) => Some(s.as_str()),
            other => return Err(FfiError::conversion(other.kind_name(), Expected::String)),
        };
        let flags = match flags {
            Value::Integer(_) | Value::Unsigned(_) => flags
                .as_i128()
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| {
                    FfiError::marshal(1, format!("open flags {} do not fit a C int", flags))
                })?,
            other => return Err(FfiError::conversion(other.kind_name(), Expected::Integer)),
        };
        Self::open_with(name, flags)
    }

    /// Open `name` (or the process itself for `None`) with `flags`.
    pub fn open_with(name: Option<&str>, flags: i32) -> FfiResult<Self> {
        Self::open_in(name, flags, &[])
    }

    /// Like [`open_with`](Self::open_with), falling back to the platform
    /// file name under each of `search_paths` when the bare name fails.
    ///
    /// A library that cannot be found is a `Load` error when `NOW` is set.
    /// Otherwise the handle is still returned and every symbol looked up in
    /// it fails with `UnresolvedSymbol` at resolution time.
    pub fn open_in(name: Option<&str>, flags: i32, search_paths: &[PathBuf]) -> FfiResult<Self> {
        let flags = effective_flags(flags);
        let lib_name = name.unwrap_or(PROCESS_WIDE);
        let handle = match sys::open(name, flags) {
            Ok(handle) => Ok(handle),
            Err(first) => match search(lib_name, flags, search_paths) {
                Some(handle) => Ok(handle),
                None if flags & Self::NOW != 0 => {
                    return Err(FfiError::Load {
                        library: lib_name.to_string(),
                        reason: first.to_string(),
                    })
                }
                None => {
                    tracing::warn!(library = lib_name, error = %first, "library not found, lookups will fail");
                    Err(first.to_string())
                }
            },
        };
        tracing::debug!(
            library = lib_name,
            flags,
            loaded = handle.is_ok(),
            "opened library"
        );
        Ok(Self {
            inner: Arc::new(LibraryInner {
                name: name.map(str::to_string),
                flags,
                handle,
                symbols: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Shared lazily-bound handle on the running process.
    pub fn process() -> FfiResult<Self> {
        PROCESS
            .get_or_try_init(|| Self::open_with(None, Self::LAZY))
            .cloned()
    }

    pub fn name(&self) -> &str {
        self.inner.name.as_deref().unwrap_or(PROCESS_WIDE)
    }

    pub fn is_process_wide(&self) -> bool {
        self.inner.name.is_none()
    }

    pub fn flags(&self) -> i32 {
        self.inner.flags
    }

    /// Whether the linker actually found this library.
    pub fn is_loaded(&self) -> bool {
        self.inner.handle.is_ok()
    }

    /// The linker's message when the library could not be found.
    pub fn load_error(&self) -> Option<&str> {
        self.inner.handle.as_ref().err().map(String::as_str)
    }

    fn binds_now(&self) -> bool {
        self.inner.flags & Self::NOW != 0
    }

    /// Symbol handle for a function.
    ///
    /// Libraries opened with `NOW` resolve immediately and fail here when
    /// the name is absent; otherwise resolution waits for first use.
    pub fn find_symbol(&self, name: &str) -> FfiResult<Symbol> {
        let mut symbols = self.inner.symbols.lock();
        if let Some(sym) = symbols.get(name) {
            return Ok(sym.clone());
        }
        let sym = Symbol::bound(name, self.clone());
        if self.binds_now() {
            sym.address()?;
        }
        symbols.insert(name.to_string(), sym.clone());
        Ok(sym)
    }

    /// Symbol handle for a variable; same resolution rules as functions.
    pub fn find_variable(&self, name: &str) -> FfiResult<Symbol> {
        self.find_symbol(name)
    }

    /// Host-facing lookup accepting any string-like value.
    pub fn find_symbol_value(&self, name: &Value) -> FfiResult<Symbol> {
        let name = name
            .as_name()
            .ok_or_else(|| FfiError::conversion(name.kind_name(), Expected::String))?;
        self.find_symbol(name)
    }

    /// Raw lookup, no caching.
    fn lookup(&self, name: &str) -> FfiResult<usize> {
        let c_name = CString::new(name)
            .map_err(|_| FfiError::unresolved(name, Some(self.name())))?;
        let handle = match &self.inner.handle {
            Ok(handle) => handle,
            Err(_) => return Err(FfiError::unresolved(name, Some(self.name()))),
        };
        match sys::lookup(handle, c_name.as_bytes_with_nul()) {
            Ok(0) => Err(FfiError::unresolved(name, Some(self.name()))),
            Ok(addr) => Ok(addr),
            Err(e) => {
                tracing::trace!(symbol = name, library = self.name(), error = %e, "lookup failed");
                Err(FfiError::unresolved(name, Some(self.name())))
            }
        }
    }

    /// Number of cached symbols.
    pub fn cached_symbols(&self) -> usize {
        self.inner.symbols.lock().len()
    }
}

/// Neither `LAZY` nor `NOW` set means `LAZY`; `dlopen` rejects a bare mode.
fn effective_flags(flags: i32) -> i32 {
    if flags & (DynamicLibrary::LAZY | DynamicLibrary::NOW) == 0 {
        flags | DynamicLibrary::LAZY
    } else {
        flags
    }
}

fn search(name: &str, flags: i32, search_paths: &[PathBuf]) -> Option<sys::Handle> {
    if name.contains(std::path::MAIN_SEPARATOR) || search_paths.is_empty() {
        return None;
    }
    let file = library_filename(name);
    for dir in search_paths {
        for candidate in [dir.join(name), dir.join(&file)] {
            if !candidate.exists() {
                continue;
            }
            if let Some(path) = candidate.to_str() {
                if let Ok(handle) = sys::open(Some(path), flags) {
                    tracing::debug!(library = name, path = %candidate.display(), "found via search path");
                    return Some(handle);
                }
            }
        }
    }
    None
}

/// Platform file name for a bare library name (`m` -> `libm.so`).
pub fn library_filename(name: &str) -> String {
    let path = Path::new(name);
    if path.extension().is_some() {
        return name.to_string();
    }
    #[cfg(target_os = "macos")]
    {
        if name.starts_with("lib") {
            format!("{}.dylib", name)
        } else {
            format!("lib{}.dylib", name)
        }
    }
    #[cfg(windows)]
    {
        format!("{}.dll", name)
    }
    #[cfg(not(any(target_os = "macos", windows)))]
    {
        if name.starts_with("lib") {
            format!("{}.so", name)
        } else {
            format!("lib{}.so", name)
        }
    }
}

impl PartialEq for DynamicLibrary {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for DynamicLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicLibrary")
            .field("name", &self.name())
            .field("flags", &self.inner.flags)
            .finish()
    }
}

/// Observable resolution state of a [`Symbol`].
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolState {
    Unresolved,
    Resolved(usize),
    /// Terminal; the same error is returned on every later use
    Failed(FfiError),
}

struct SymbolInner {
    name: String,
    /// `None` resolves against the process-wide table
    library: Option<DynamicLibrary>,
    address: OnceCell<FfiResult<usize>>,
}

/// A named reference into a library whose address resolves at most once.
#[derive(Clone)]
pub struct Symbol {
    inner: Arc<SymbolInner>,
}

impl Symbol {
    /// A symbol not tied to a particular library.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_library(name.into(), None)
    }

    fn bound(name: &str, library: DynamicLibrary) -> Self {
        Self::with_library(name.to_string(), Some(library))
    }

    fn with_library(name: String, library: Option<DynamicLibrary>) -> Self {
        Self {
            inner: Arc::new(SymbolInner {
                name,
                library,
                address: OnceCell::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn library(&self) -> Option<&DynamicLibrary> {
        self.inner.library.as_ref()
    }

    pub fn state(&self) -> SymbolState {
        match self.inner.address.get() {
            None => SymbolState::Unresolved,
            Some(Ok(addr)) => SymbolState::Resolved(*addr),
            Some(Err(e)) => SymbolState::Failed(e.clone()),
        }
    }

    /// Resolve on first use; later calls return the cached outcome.
    pub fn address(&self) -> FfiResult<usize> {
        self.inner
            .address
            .get_or_init(|| {
                let result = match &self.inner.library {
                    Some(lib) => lib.lookup(&self.inner.name),
                    None => DynamicLibrary::process()
                        .and_then(|lib| lib.lookup(&self.inner.name))
                        .map_err(|_| FfiError::unresolved(self.inner.name.as_str(), None)),
                };
                match &result {
                    Ok(addr) => tracing::debug!(symbol = %self.inner.name, address = format_args!("0x{:x}", addr), "resolved symbol"),
                    Err(e) => tracing::debug!(symbol = %self.inner.name, error = %e, "symbol resolution failed"),
                }
                result
            })
            .clone()
    }

    /// Address as a pointer, for reading variables.
    pub fn to_pointer(&self) -> FfiResult<Pointer> {
        self.address().map(Pointer::from_address)
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.name == other.inner.name && self.inner.library == other.inner.library)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Symbol")
            .field("name", &self.inner.name)
            .field(
                "library",
                &self.inner.library.as_ref().map_or(PROCESS_WIDE, |l| l.name()),
            )
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_constants() {
        assert_eq!(DynamicLibrary::LAZY, 1);
        assert_eq!(DynamicLibrary::NOW, 2);
        assert_eq!(DynamicLibrary::LOCAL, 0);
        assert_eq!(DynamicLibrary::GLOBAL, 257);
    }

    #[test]
    fn test_effective_flags() {
        assert_eq!(effective_flags(0), DynamicLibrary::LAZY);
        assert_eq!(effective_flags(DynamicLibrary::NOW), DynamicLibrary::NOW);
        assert_eq!(effective_flags(DynamicLibrary::GLOBAL), DynamicLibrary::GLOBAL);
    }

    #[test]
    fn test_open_rejects_bad_name_before_flags() {
        let err = DynamicLibrary::open(&Value::Float(3.142), &Value::Float(1.0)).unwrap_err();
        assert_eq!(err.to_string(), "can't convert Float into String");
        let err = DynamicLibrary::open(&Value::Nil, &Value::from("1")).unwrap_err();
        assert_eq!(err.to_string(), "can't convert String into Integer");
    }

    #[test]
    fn test_library_filename() {
        #[cfg(target_os = "linux")]
        {
            assert_eq!(library_filename("m"), "libm.so");
            assert_eq!(library_filename("libz"), "libz.so");
            assert_eq!(library_filename("libc.so.6"), "libc.so.6");
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_process_symbol_resolves_lazily() {
        let lib = DynamicLibrary::process().unwrap();
        let sym = lib.find_variable("malloc").unwrap();
        assert_eq!(sym.state(), SymbolState::Unresolved);
        assert!(sym.address().unwrap() != 0);
        assert!(matches!(sym.state(), SymbolState::Resolved(_)));
        assert!(lib.find_variable("malloc").unwrap() == sym);
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_symbol_failure_is_terminal() {
        let lib = DynamicLibrary::process().unwrap();
        let sym = lib.find_symbol("nativebind_no_such_symbol").unwrap();
        let first = sym.address().unwrap_err();
        assert!(matches!(first, FfiError::UnresolvedSymbol { .. }));
        assert_eq!(sym.address().unwrap_err(), first);
        assert!(matches!(sym.state(), SymbolState::Failed(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_now_library_fails_eagerly() {
        let lib = DynamicLibrary::open_with(None, DynamicLibrary::NOW).unwrap();
        assert!(lib.find_symbol("nativebind_no_such_symbol").is_err());
        assert_eq!(lib.cached_symbols(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_concurrent_now_lookups_share_one_symbol() {
        let lib = DynamicLibrary::open_with(None, DynamicLibrary::NOW).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lib = lib.clone();
                std::thread::spawn(move || lib.find_symbol("malloc").unwrap())
            })
            .collect();
        let symbols: Vec<Symbol> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for sym in &symbols {
            assert!(Arc::ptr_eq(&sym.inner, &symbols[0].inner));
        }
        assert_eq!(lib.cached_symbols(), 1);
    }

    #[test]
    fn test_missing_library_fails_at_resolution_when_lazy() {
        let lib = DynamicLibrary::open(&Value::from("something"), &Value::Integer(1)).unwrap();
        assert!(!lib.is_loaded());
        assert!(lib.load_error().is_some());
        assert_eq!(lib.name(), "something");

        let sym = lib.find_symbol("anything").unwrap();
        let err = sym.address().unwrap_err();
        assert_eq!(
            err,
            FfiError::unresolved("anything", Some("something"))
        );
    }

    #[test]
    fn test_missing_library_is_load_error_when_now() {
        let err = DynamicLibrary::open_with(Some("nativebind-missing-lib"), DynamicLibrary::NOW)
            .unwrap_err();
        assert!(matches!(err, FfiError::Load { .. }));
    }

    #[test]
    fn test_flags_accept_unsigned_and_reject_overflow() {
        let lib = DynamicLibrary::open(&Value::from("something"), &Value::Unsigned(1)).unwrap();
        assert_eq!(lib.flags(), DynamicLibrary::LAZY);

        let err = DynamicLibrary::open(&Value::from("something"), &Value::Integer(1 << 40))
            .unwrap_err();
        assert!(matches!(err, FfiError::Marshal { .. }));
        assert!(err.to_string().contains("do not fit"));
    }
}
