//! VST3 format adapter: vtable-based component/controller model.
//!
//! Modules are loaded once per bundle path and reference-counted; the
//! platform module entry runs on first load and the exit on last release.
//! Plugins are identified by the hex form of their 16-byte class id.

mod host_classes;
mod instance;

pub use instance::Vst3PluginInstance;

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use vst3::Steinberg::{
    kResultOk, IPluginFactory, IPluginFactoryTrait, PClassInfo, TUID,
};
use vst3::{ComPtr, Interface};

use crate::catalog::{vst3_search_paths, PluginCatalogEntry};
use crate::error::HostError;
use crate::plugin::{PluginFormat, PluginInstance};

pub const VST3_FORMAT_NAME: &str = "VST3";

const AUDIO_MODULE_CLASS: &str = "Audio Module Class";

pub(crate) fn tuid_to_hex(tuid: &TUID) -> String {
    tuid.iter()
        .map(|byte| format!("{:02X}", *byte as u8))
        .collect()
}

pub(crate) fn hex_to_tuid(hex: &str) -> Option<TUID> {
    if hex.len() != 32 {
        return None;
    }
    let mut tuid: TUID = [0; 16];
    for (index, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let text = std::str::from_utf8(chunk).ok()?;
        let value = u8::from_str_radix(text, 16).ok()?;
        tuid[index] = value as _;
    }
    Some(tuid)
}

fn cstr_bytes_to_string(bytes: &[std::ffi::c_char]) -> String {
    let raw: Vec<u8> = bytes
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect();
    String::from_utf8_lossy(&raw).into_owned()
}

/// A loaded VST3 module: shared library, module entry ran, factory fetched.
pub struct Vst3Module {
    path: PathBuf,
    factory: ComPtr<IPluginFactory>,
    library: libloading::Library,
}

unsafe impl Send for Vst3Module {}
unsafe impl Sync for Vst3Module {}

impl Vst3Module {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn factory(&self) -> &ComPtr<IPluginFactory> {
        &self.factory
    }
}

impl Drop for Vst3Module {
    fn drop(&mut self) {
        unsafe {
            #[cfg(target_os = "linux")]
            let exit_name: &[u8] = b"ModuleExit\0";
            #[cfg(target_os = "macos")]
            let exit_name: &[u8] = b"bundleExit\0";
            #[cfg(target_os = "windows")]
            let exit_name: &[u8] = b"ExitDll\0";
            if let Ok(exit) = self
                .library
                .get::<unsafe extern "C" fn() -> bool>(exit_name)
            {
                exit();
            }
        }
    }
}

fn module_pool() -> &'static Mutex<HashMap<PathBuf, Weak<Vst3Module>>> {
    static POOL: OnceLock<Mutex<HashMap<PathBuf, Weak<Vst3Module>>>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Resolve the binary inside a `.vst3` bundle directory; plain files load
/// as-is (single-file bundles are still common on Windows and Linux).
fn module_binary_path(bundle_path: &Path) -> PathBuf {
    if !bundle_path.is_dir() {
        return bundle_path.to_path_buf();
    }
    let stem = bundle_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    #[cfg(target_os = "linux")]
    {
        let arch = if cfg!(target_arch = "x86_64") {
            "x86_64-linux"
        } else {
            "aarch64-linux"
        };
        return bundle_path
            .join("Contents")
            .join(arch)
            .join(format!("{stem}.so"));
    }
    #[cfg(target_os = "macos")]
    {
        return bundle_path.join("Contents/MacOS").join(stem);
    }
    #[cfg(target_os = "windows")]
    {
        let arch = if cfg!(target_arch = "x86_64") {
            "x86_64-win"
        } else {
            "arm64-win"
        };
        return bundle_path
            .join("Contents")
            .join(arch)
            .join(format!("{stem}.vst3"));
    }
    #[allow(unreachable_code)]
    bundle_path.to_path_buf()
}

/// Load (or re-use) the module at `path`, run its platform entry and fetch
/// the plugin factory.
pub fn load_module(path: &Path) -> Result<Arc<Vst3Module>, HostError> {
    let mut pool = module_pool().lock().unwrap();
    if let Some(existing) = pool.get(path).and_then(Weak::upgrade) {
        return Ok(existing);
    }

    let binary = module_binary_path(path);
    let library = unsafe { libloading::Library::new(&binary) }
        .map_err(|e| HostError::FailedToInstantiate(format!("{}: {e}", binary.display())))?;

    unsafe {
        #[cfg(target_os = "linux")]
        {
            if let Ok(entry) = library.get::<unsafe extern "C" fn(*mut c_void) -> bool>(b"ModuleEntry\0") {
                if !entry(std::ptr::null_mut()) {
                    return Err(HostError::FailedToInstantiate(
                        "ModuleEntry returned false".to_string(),
                    ));
                }
            }
        }
        #[cfg(target_os = "macos")]
        {
            if let Ok(entry) = library.get::<unsafe extern "C" fn(*mut c_void) -> bool>(b"bundleEntry\0") {
                if !entry(std::ptr::null_mut()) {
                    return Err(HostError::FailedToInstantiate(
                        "bundleEntry returned false".to_string(),
                    ));
                }
            }
        }
        #[cfg(target_os = "windows")]
        {
            if let Ok(entry) = library.get::<unsafe extern "C" fn() -> bool>(b"InitDll\0") {
                if !entry() {
                    return Err(HostError::FailedToInstantiate(
                        "InitDll returned false".to_string(),
                    ));
                }
            }
        }
    }

    let factory = unsafe {
        type GetPluginFactory = unsafe extern "C" fn() -> *mut IPluginFactory;
        let get_factory = library
            .get::<GetPluginFactory>(b"GetPluginFactory\0")
            .map_err(|e| {
                HostError::FailedToInstantiate(format!("missing GetPluginFactory: {e}"))
            })?;
        let raw = get_factory();
        ComPtr::from_raw(raw).ok_or_else(|| {
            HostError::FailedToInstantiate("GetPluginFactory returned null".to_string())
        })?
    };

    let module = Arc::new(Vst3Module {
        path: path.to_path_buf(),
        factory,
        library,
    });
    pool.insert(path.to_path_buf(), Arc::downgrade(&module));
    Ok(module)
}

/// Classes of the factory whose category marks an audio plugin, as
/// `(class id, name)` pairs.
pub(crate) fn audio_module_classes(module: &Vst3Module) -> Vec<(TUID, String)> {
    let mut classes = Vec::new();
    unsafe {
        let factory = module.factory();
        let count = factory.countClasses();
        for index in 0..count {
            let mut info: PClassInfo = std::mem::zeroed();
            if factory.getClassInfo(index, &mut info) != kResultOk {
                continue;
            }
            let category = cstr_bytes_to_string(&info.category);
            if !category.contains(AUDIO_MODULE_CLASS) {
                continue;
            }
            classes.push((info.cid, cstr_bytes_to_string(&info.name)));
        }
    }
    classes
}

pub struct Vst3PluginFormat;

impl Vst3PluginFormat {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Vst3PluginFormat {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginFormat for Vst3PluginFormat {
    fn name(&self) -> &str {
        VST3_FORMAT_NAME
    }

    fn search_paths(&self) -> Vec<PathBuf> {
        vst3_search_paths()
    }

    fn scan_bundle(&self, bundle_path: &Path) -> Vec<PluginCatalogEntry> {
        let module = match load_module(bundle_path) {
            Ok(module) => module,
            Err(err) => {
                log::warn!("skipping {}: {err}", bundle_path.display());
                return Vec::new();
            }
        };
        audio_module_classes(&module)
            .into_iter()
            .map(|(cid, name)| {
                PluginCatalogEntry::new(VST3_FORMAT_NAME, tuid_to_hex(&cid), bundle_path, name)
            })
            .collect()
    }

    fn create_instance(
        &self,
        entry: &PluginCatalogEntry,
    ) -> Result<Box<dyn PluginInstance>, HostError> {
        let instance = Vst3PluginInstance::create(entry)?;
        Ok(Box::new(instance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuid_hex_round_trip() {
        let tuid: TUID = [
            0x01, 0x23, 0x45, 0x67, 0x89u8 as _, 0xABu8 as _, 0xCDu8 as _, 0xEFu8 as _, 0x00,
            0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
        ];
        let hex = tuid_to_hex(&tuid);
        assert_eq!(hex.len(), 32);
        assert_eq!(hex_to_tuid(&hex), Some(tuid));
        assert_eq!(hex_to_tuid("short"), None);
    }
}
