//! Runtime loading of native plugin modules.
//!
//! A loadable module is a shared library exporting
//! `seawire_module_init(&Arc<Module>, &mut ModuleContexts)`. The loader
//! opens the library, resolves its identity (canonical path and base
//! address, via the init symbol's location), runs the init function, and
//! registers the [`Module`] record. Records are deduplicated by load
//! handle: loading a path that is already resident returns the existing
//! record.
//!
//! Plugin-owned context objects live inside the `Module` record, declared
//! before the library handle, so their destructors always run before the
//! image is unmapped.
//!
//! The `dl*` family is not reentrancy-safe; every call the loader makes
//! goes through the registry mutex. The init function itself runs with
//! that mutex released so a module may load further modules while
//! initializing.

use std::{
    any::Any,
    collections::HashMap,
    ffi::CStr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use libloading::os::unix::{Library, Symbol, RTLD_NOW};
use thiserror::Error;

/// Symbol every loadable module must export.
pub const MODULE_INIT_SYMBOL: &[u8] = b"seawire_module_init";

/// Signature of the module init function.
///
/// The loader supplies a strong reference to the freshly created record
/// and an empty context collection for the module to populate.
pub type ModuleInitFn = unsafe extern "C" fn(&Arc<Module>, &mut ModuleContexts);

#[cfg(target_os = "linux")]
const DEEP_BIND: libc::c_int = libc::RTLD_DEEPBIND;
#[cfg(not(target_os = "linux"))]
const DEEP_BIND: libc::c_int = 0;

/// Errors produced by the module loader.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// The library could not be opened.
    #[error("failed to load {path}: {source}")]
    Open {
        /// Requested path.
        path: PathBuf,
        /// Loader diagnostic.
        source: libloading::Error,
    },

    /// The library does not export the init symbol.
    #[error("no module init symbol in {path}: {source}")]
    MissingInit {
        /// Requested path.
        path: PathBuf,
        /// Loader diagnostic.
        source: libloading::Error,
    },

    /// The library's identity could not be resolved.
    #[error("failed to resolve module identity for {path}")]
    Resolve {
        /// Requested path.
        path: PathBuf,
    },

    /// A record with the same handle or base address already exists.
    #[error("duplicate module: {path}")]
    Duplicate {
        /// Real path of the offending module.
        path: PathBuf,
    },

    /// The given address belongs to no managed module.
    #[error("address {addr:#x} does not belong to a managed module")]
    NotCurrent {
        /// The code address that was looked up.
        addr: usize,
    },
}

/// Ordered collection of plugin-owned objects.
///
/// Destruction is LIFO with respect to insertion, and always happens
/// before the owning module's library is unmapped.
#[derive(Default)]
pub struct ModuleContexts(Vec<Box<dyn Any + Send>>);

impl ModuleContexts {
    /// Append an owned object.
    pub fn push(&mut self, context: impl Any + Send) { self.0.push(Box::new(context)); }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize { self.0.len() }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl Drop for ModuleContexts {
    fn drop(&mut self) {
        while self.0.pop().is_some() {}
    }
}

/// A loaded plugin library.
pub struct Module {
    // Declared before `library`: Rust drops fields in declaration order,
    // which guarantees contexts are destroyed while the image is still
    // mapped.
    contexts: Mutex<ModuleContexts>,
    real_path: PathBuf,
    base_addr: usize,
    handle_addr: usize,
    library: Library,
}

impl Module {
    /// Canonical filesystem path of the library.
    #[must_use]
    pub fn real_path(&self) -> &Path { &self.real_path }

    /// Base address of the mapped image.
    #[must_use]
    pub fn base_addr(&self) -> usize { self.base_addr }

    /// Append a context object after init, LIFO-destroyed before unmap.
    pub fn add_context(&self, context: impl Any + Send) {
        self.contexts
            .lock()
            .expect("module contexts poisoned")
            .push(context);
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        log::info!("unmapping module: {}", self.real_path.display());
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("real_path", &self.real_path)
            .field("base_addr", &format_args!("{:#x}", self.base_addr))
            .finish_non_exhaustive()
    }
}

/// One row of the module listing.
#[derive(Clone, Debug)]
pub struct ModuleSnapshot {
    /// Canonical path of the library.
    pub real_path: PathBuf,
    /// Base address of the mapped image.
    pub base_addr: usize,
    /// Outstanding strong references to the record.
    pub ref_count: usize,
}

/// Registry and lifecycle manager for plugin modules.
#[derive(Default)]
pub struct ModuleLoader {
    // Serializes registry access and every dl* call the loader makes.
    registry: Mutex<Vec<Arc<Module>>>,
    // Reverse map consulted by `module_at`; weak on purpose, it must
    // never extend a module's lifetime.
    by_base_addr: Mutex<HashMap<usize, Weak<Module>>>,
}

impl ModuleLoader {
    /// An empty loader.
    #[must_use]
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// Load the library at `path`, or return the existing record if the
    /// library is already resident.
    ///
    /// # Errors
    ///
    /// Returns a [`ModuleError`] when the library cannot be opened, lacks
    /// the init symbol, cannot be identified, or collides with a
    /// registered record.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Arc<Module>, ModuleError> {
        let path = path.as_ref();
        let registry = self.registry.lock().expect("module registry poisoned");

        log::info!("checking whether module is already loaded: {}", path.display());
        if let Ok(probe) = unsafe { Library::open(Some(path), RTLD_NOW | libc::RTLD_NOLOAD) } {
            let handle_addr = probe.into_raw() as usize;
            // Rebalance the probe's reference on the library.
            drop(unsafe { Library::from_raw(handle_addr as *mut libc::c_void) });
            if let Some(existing) = registry.iter().find(|m| m.handle_addr == handle_addr) {
                log::debug!("module already loaded: {}", existing.real_path.display());
                return Ok(Arc::clone(existing));
            }
        }

        log::info!("loading new module: {}", path.display());
        let library =
            unsafe { Library::open(Some(path), RTLD_NOW | DEEP_BIND) }.map_err(|source| {
                ModuleError::Open {
                    path: path.to_owned(),
                    source,
                }
            })?;
        let handle_addr = library.into_raw() as usize;
        let library = unsafe { Library::from_raw(handle_addr as *mut libc::c_void) };

        let init_fn = {
            let symbol: Symbol<ModuleInitFn> =
                unsafe { library.get(MODULE_INIT_SYMBOL) }.map_err(|source| {
                    ModuleError::MissingInit {
                        path: path.to_owned(),
                        source,
                    }
                })?;
            *symbol
        };

        let (real_path, base_addr) = resolve_identity(init_fn as usize, path)?;
        let module = Arc::new(Module {
            contexts: Mutex::new(ModuleContexts::default()),
            real_path,
            base_addr,
            handle_addr,
            library,
        });

        // Run init outside the registry lock so a module may load other
        // modules while initializing.
        drop(registry);
        log::info!("initializing module: {}", module.real_path.display());
        let mut contexts = ModuleContexts::default();
        unsafe { init_fn(&module, &mut contexts) };
        *module.contexts.lock().expect("module contexts poisoned") = contexts;
        log::info!("done initializing module: {}", module.real_path.display());

        let mut registry = self.registry.lock().expect("module registry poisoned");
        if registry.iter().any(|m| {
            m.handle_addr == module.handle_addr
                || m.base_addr == module.base_addr
                || Arc::ptr_eq(m, &module)
        }) {
            return Err(ModuleError::Duplicate {
                path: module.real_path.clone(),
            });
        }
        self.by_base_addr
            .lock()
            .expect("module reverse map poisoned")
            .insert(module.base_addr, Arc::downgrade(&module));
        registry.push(Arc::clone(&module));
        Ok(module)
    }

    /// [`load`](Self::load) with errors swallowed.
    pub fn load_no_throw(&self, path: impl AsRef<Path>) -> Option<Arc<Module>> {
        match self.load(path.as_ref()) {
            Ok(module) => Some(module),
            Err(e) => {
                log::warn!("failed to load module {}: {e}", path.as_ref().display());
                None
            }
        }
    }

    /// Remove a specific record. Returns whether it was registered.
    pub fn unload(&self, module: &Arc<Module>) -> bool {
        self.remove_matching(|m| Arc::ptr_eq(m, module)) > 0
    }

    /// Remove every record whose real path matches. Returns whether any
    /// was registered.
    pub fn unload_by_real_path(&self, real_path: impl AsRef<Path>) -> bool {
        self.remove_matching(|m| m.real_path == real_path.as_ref()) > 0
    }

    /// Remove the record at the given base address.
    pub fn unload_by_base_addr(&self, base_addr: usize) -> bool {
        self.remove_matching(|m| m.base_addr == base_addr) > 0
    }

    fn remove_matching(&self, predicate: impl Fn(&Arc<Module>) -> bool) -> usize {
        let mut registry = self.registry.lock().expect("module registry poisoned");
        let before = registry.len();
        registry.retain(|m| !predicate(m));
        before - registry.len()
    }

    /// Resolve the managed module containing a code address.
    ///
    /// Plugin code obtains its own record through the
    /// [`assert_current!`](crate::assert_current) macro, which passes the
    /// address of a local anchor function.
    ///
    /// # Errors
    ///
    /// Returns [`ModuleError::NotCurrent`] when the address was not loaded
    /// by this manager.
    pub fn module_at(&self, addr: usize) -> Result<Arc<Module>, ModuleError> {
        let base_addr = {
            let _registry = self.registry.lock().expect("module registry poisoned");
            let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
            if unsafe { libc::dladdr(addr as *const libc::c_void, &mut info) } == 0 {
                return Err(ModuleError::NotCurrent { addr });
            }
            info.dli_fbase as usize
        };
        let mut map = self
            .by_base_addr
            .lock()
            .expect("module reverse map poisoned");
        match map.get(&base_addr).and_then(Weak::upgrade) {
            Some(module) => Ok(module),
            None => {
                map.remove(&base_addr);
                Err(ModuleError::NotCurrent { addr })
            }
        }
    }

    /// Point-in-time listing of registered modules.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ModuleSnapshot> {
        self.registry
            .lock()
            .expect("module registry poisoned")
            .iter()
            .map(|m| ModuleSnapshot {
                real_path: m.real_path.clone(),
                base_addr: m.base_addr,
                ref_count: Arc::strong_count(m),
            })
            .collect()
    }

    /// Unload everything and wait for outstanding references to drain.
    ///
    /// Plugin destructors may call back into the framework, so the
    /// registry is cleared first and each record is then polled until its
    /// last reference drops.
    pub async fn stop(&self) {
        log::info!("unloading all modules");
        let drained: Vec<(Weak<Module>, PathBuf)> = {
            let mut registry = self.registry.lock().expect("module registry poisoned");
            let drained = registry
                .iter()
                .map(|m| (Arc::downgrade(m), m.real_path.clone()))
                .collect();
            registry.clear();
            drained
        };
        for (weak, real_path) in drained {
            while weak.strong_count() > 0 {
                log::info!("waiting for module to unload: {}", real_path.display());
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        self.by_base_addr
            .lock()
            .expect("module reverse map poisoned")
            .retain(|_, weak| weak.strong_count() > 0);
    }
}

fn resolve_identity(symbol_addr: usize, path: &Path) -> Result<(PathBuf, usize), ModuleError> {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    if unsafe { libc::dladdr(symbol_addr as *const libc::c_void, &mut info) } == 0
        || info.dli_fbase.is_null()
    {
        return Err(ModuleError::Resolve {
            path: path.to_owned(),
        });
    }
    let reported = if info.dli_fname.is_null() {
        path.to_owned()
    } else {
        PathBuf::from(
            unsafe { CStr::from_ptr(info.dli_fname) }
                .to_string_lossy()
                .into_owned(),
        )
    };
    let real_path = std::fs::canonicalize(&reported).unwrap_or(reported);
    Ok((real_path, info.dli_fbase as usize))
}

/// Resolve the [`Module`](crate::module::Module) containing the calling
/// code.
///
/// Expands to a `Result<Arc<Module>, ModuleError>`; fails when the caller
/// was not loaded through the given loader.
#[macro_export]
macro_rules! assert_current {
    ($loader:expr) => {{
        fn __seawire_module_anchor() {}
        $loader.module_at(__seawire_module_anchor as usize)
    }};
}
