//! CLAP format adapter: C entry-point factory model.
//!
//! A bundle is loaded once per path and reference-counted; `clap_entry.init`
//! runs on first load and `deinit` when the last instance lets go. The
//! adapter speaks `clap-sys` directly so event spaces, port flags and flush
//! ordering stay bit-exact.

mod events;
mod host;
mod instance;

pub use instance::ClapPluginInstance;

use std::collections::HashMap;
use std::ffi::{c_char, CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use clap_sys::entry::clap_plugin_entry;
use clap_sys::plugin_factory::{clap_plugin_factory, CLAP_PLUGIN_FACTORY_ID};

use crate::catalog::{clap_search_paths, PluginCatalogEntry};
use crate::error::HostError;
use crate::plugin::{PluginFormat, PluginInstance};

pub const CLAP_FORMAT_NAME: &str = "CLAP";

/// A loaded CLAP bundle: the shared library plus its initialized entry
/// point. Dropped when the last referencing instance goes away.
pub struct ClapBundle {
    path: PathBuf,
    entry: *const clap_plugin_entry,
    _library: libloading::Library,
}

unsafe impl Send for ClapBundle {}
unsafe impl Sync for ClapBundle {}

impl ClapBundle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The bundle's plugin factory, if it exposes one.
    pub fn plugin_factory(&self) -> Option<*const clap_plugin_factory> {
        unsafe {
            let get_factory = (*self.entry).get_factory?;
            let factory = get_factory(CLAP_PLUGIN_FACTORY_ID.as_ptr());
            if factory.is_null() {
                None
            } else {
                Some(factory as *const clap_plugin_factory)
            }
        }
    }
}

impl Drop for ClapBundle {
    fn drop(&mut self) {
        unsafe {
            if let Some(deinit) = (*self.entry).deinit {
                deinit();
            }
        }
    }
}

fn bundle_pool() -> &'static Mutex<HashMap<PathBuf, Weak<ClapBundle>>> {
    static POOL: OnceLock<Mutex<HashMap<PathBuf, Weak<ClapBundle>>>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Bundle directories hold the binary under a platform subdirectory on
/// macOS; plain shared objects elsewhere.
fn bundle_binary_path(bundle_path: &Path) -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if bundle_path.is_dir() {
            if let Some(stem) = bundle_path.file_stem() {
                return bundle_path
                    .join("Contents/MacOS")
                    .join(stem);
            }
        }
    }
    bundle_path.to_path_buf()
}

/// Load (or re-use) the bundle at `path` and run its entry-point init once.
pub fn load_bundle(path: &Path) -> Result<Arc<ClapBundle>, HostError> {
    let mut pool = bundle_pool().lock().unwrap();
    if let Some(existing) = pool.get(path).and_then(Weak::upgrade) {
        return Ok(existing);
    }

    let binary = bundle_binary_path(path);
    let library = unsafe { libloading::Library::new(&binary) }
        .map_err(|e| HostError::FailedToInstantiate(format!("{}: {e}", binary.display())))?;
    let entry = unsafe {
        let symbol = library
            .get::<*const clap_plugin_entry>(b"clap_entry\0")
            .map_err(|e| {
                HostError::FailedToInstantiate(format!("missing clap_entry: {e}"))
            })?;
        *symbol
    };
    if entry.is_null() {
        return Err(HostError::FailedToInstantiate(
            "clap_entry is null".to_string(),
        ));
    }

    let path_cstr = CString::new(path.to_string_lossy().as_bytes())
        .map_err(|_| HostError::FailedToInstantiate("bundle path not encodable".to_string()))?;
    let initialized = unsafe {
        match (*entry).init {
            Some(init) => init(path_cstr.as_ptr()),
            None => false,
        }
    };
    if !initialized {
        return Err(HostError::FailedToInstantiate(format!(
            "clap_entry.init failed for {}",
            path.display()
        )));
    }

    let bundle = Arc::new(ClapBundle {
        path: path.to_path_buf(),
        entry,
        _library: library,
    });
    pool.insert(path.to_path_buf(), Arc::downgrade(&bundle));
    Ok(bundle)
}

unsafe fn cstr_field(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

pub struct ClapPluginFormat;

impl ClapPluginFormat {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ClapPluginFormat {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginFormat for ClapPluginFormat {
    fn name(&self) -> &str {
        CLAP_FORMAT_NAME
    }

    fn search_paths(&self) -> Vec<PathBuf> {
        clap_search_paths()
    }

    fn scan_bundle(&self, bundle_path: &Path) -> Vec<PluginCatalogEntry> {
        let bundle = match load_bundle(bundle_path) {
            Ok(bundle) => bundle,
            Err(err) => {
                log::warn!("skipping {}: {err}", bundle_path.display());
                return Vec::new();
            }
        };
        let Some(factory) = bundle.plugin_factory() else {
            log::warn!("{}: no plugin factory", bundle_path.display());
            return Vec::new();
        };

        let mut entries = Vec::new();
        unsafe {
            let count = (*factory)
                .get_plugin_count
                .map(|f| f(factory))
                .unwrap_or(0);
            for index in 0..count {
                let Some(get_descriptor) = (*factory).get_plugin_descriptor else {
                    break;
                };
                let descriptor = get_descriptor(factory, index);
                if descriptor.is_null() {
                    continue;
                }
                let mut entry = PluginCatalogEntry::new(
                    CLAP_FORMAT_NAME,
                    cstr_field((*descriptor).id),
                    bundle_path,
                    cstr_field((*descriptor).name),
                );
                entry.vendor = cstr_field((*descriptor).vendor);
                entry.product_url = cstr_field((*descriptor).url);
                entries.push(entry);
            }
        }
        entries
    }

    fn create_instance(
        &self,
        entry: &PluginCatalogEntry,
    ) -> Result<Box<dyn PluginInstance>, HostError> {
        let instance = ClapPluginInstance::create(entry)?;
        Ok(Box::new(instance))
    }
}
