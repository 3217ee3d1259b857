//! The uniform plugin contract all format adapters implement.
//!
//! The sequencer holds `Box<dyn PluginInstance>` values and never touches an
//! ABI directly; the adapters translate this contract into their format's
//! lifecycle, processing and eventing calls. Lifecycle transitions other
//! than `process` happen on the main thread.

pub mod params;

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;

use crate::bus::AudioBusesInfo;
use crate::catalog::PluginCatalogEntry;
use crate::context::{AudioContentType, AudioProcessContext};
use crate::error::HostError;
use crate::plugin::params::{ParameterEventHub, PerNoteControllerContext, PluginParameter};

/// Processing configuration requested by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationRequest {
    pub sample_rate: u32,
    pub buffer_size_frames: usize,
    pub content_type: AudioContentType,
    pub offline_mode: bool,
    /// Requested main input channel count, when the host wants to override
    /// the plugin's default layout.
    pub main_input_channels: Option<u32>,
    pub main_output_channels: Option<u32>,
}

impl Default for ConfigurationRequest {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            buffer_size_frames: 1024,
            content_type: AudioContentType::Float32,
            offline_mode: false,
            main_input_channels: None,
            main_output_channels: None,
        }
    }
}

/// Which operations an instance needs on the main (UI) thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiThreadRequirement {
    /// All lifecycle operations except `process` must run on the main thread.
    AllNonAudioOperations,
    /// Lifecycle may run on any single non-audio thread.
    None,
}

/// Opaque handle to a plugin-provided UI surface.
pub struct PluginUiHandle {
    pub native_view: *mut c_void,
    pub width: u32,
    pub height: u32,
}

/// One loaded plugin behind the uniform host contract.
///
/// Lifecycle: created → configured → processing-active → processing-stopped
/// → destroyed. `process` is the only operation the audio thread may call.
pub trait PluginInstance: Send {
    fn catalog_entry(&self) -> &PluginCatalogEntry;

    fn requires_ui_thread_on(&self) -> UiThreadRequirement;

    fn configure(&mut self, request: &ConfigurationRequest) -> Result<(), HostError>;

    fn start_processing(&mut self) -> Result<(), HostError>;

    fn stop_processing(&mut self) -> Result<(), HostError>;

    /// Process one audio block. Audio-thread only; must not allocate.
    fn process(&mut self, context: &mut AudioProcessContext) -> Result<(), HostError>;

    /// Current parameter metadata, rebuilt on demand after a plugin-requested
    /// parameter-list refresh.
    fn parameters(&mut self) -> Result<Vec<PluginParameter>, HostError>;

    /// Read a parameter's plain value by host-assigned index.
    fn get_parameter(&self, index: u32) -> Result<f64, HostError>;

    /// Set a parameter's plain value by host-assigned index. `timestamp` is
    /// the intra-block sample offset for sample-positioned automation.
    fn set_parameter(&mut self, index: u32, plain_value: f64, timestamp: u64)
        -> Result<(), HostError>;

    fn set_per_note_controller(
        &mut self,
        context: PerNoteControllerContext,
        controller_index: u32,
        value: f64,
        timestamp: u64,
    ) -> Result<(), HostError>;

    /// The instance's parameter-change / metadata-change signal hub.
    fn parameter_events(&self) -> &Arc<ParameterEventHub>;

    fn save_state(&mut self) -> Result<Vec<u8>, HostError>;

    fn load_state(&mut self, data: &[u8]) -> Result<(), HostError>;

    fn preset_count(&mut self) -> Result<u32, HostError> {
        Err(HostError::NotImplemented)
    }

    fn load_preset(&mut self, _index: u32) -> Result<(), HostError> {
        Err(HostError::NotImplemented)
    }

    fn audio_buses(&self) -> &AudioBusesInfo;

    fn create_ui(&mut self) -> Result<PluginUiHandle, HostError> {
        Err(HostError::NotImplemented)
    }

    fn destroy_ui(&mut self) {}
}

/// One plugin format family (VST3, CLAP, AU).
pub trait PluginFormat: Send + Sync {
    /// Format tag as used in catalog entries ("VST3", "CLAP", "AU").
    fn name(&self) -> &str;

    /// Default bundle search paths on this platform.
    fn search_paths(&self) -> Vec<std::path::PathBuf>;

    /// Enumerate the plugins of one bundle into catalog entries. Errors log
    /// and yield an empty list so scanning never aborts on one bad bundle.
    fn scan_bundle(&self, bundle_path: &std::path::Path) -> Vec<PluginCatalogEntry>;

    /// Instantiate a plugin. Runs on the main thread; the returned instance
    /// is not yet configured.
    fn create_instance(
        &self,
        entry: &PluginCatalogEntry,
    ) -> Result<Box<dyn PluginInstance>, HostError>;
}

/// Registry of the plugin formats available in this process. Formats are
/// registered at startup and live for the process lifetime.
#[derive(Default)]
pub struct PluginFormatRegistry {
    formats: HashMap<String, Arc<dyn PluginFormat>>,
}

impl PluginFormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every format adapter compiled into this build.
    pub fn with_default_formats() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::formats::vst3::Vst3PluginFormat::new()));
        registry.register(Arc::new(crate::formats::clap::ClapPluginFormat::new()));
        registry.register(Arc::new(crate::formats::au::AuPluginFormat::new()));
        registry
    }

    pub fn register(&mut self, format: Arc<dyn PluginFormat>) {
        self.formats.insert(format.name().to_string(), format);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn PluginFormat>> {
        self.formats.get(name)
    }

    pub fn formats(&self) -> impl Iterator<Item = &Arc<dyn PluginFormat>> {
        self.formats.values()
    }

    pub fn create_instance(
        &self,
        entry: &PluginCatalogEntry,
    ) -> Result<Box<dyn PluginInstance>, HostError> {
        let format = self.formats.get(&entry.format).ok_or_else(|| {
            HostError::FailedToInstantiate(format!("unknown plugin format {}", entry.format))
        })?;
        format.create_instance(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_rejects_unknown_format() {
        let registry = PluginFormatRegistry::new();
        let entry = PluginCatalogEntry::new("NOPE", "id", "/tmp/x", "X");
        let err = registry.create_instance(&entry).err().unwrap();
        assert!(matches!(err, HostError::FailedToInstantiate(_)));
    }

    #[test]
    fn test_configuration_request_defaults() {
        let request = ConfigurationRequest::default();
        assert_eq!(request.sample_rate, 48000);
        assert_eq!(request.content_type, AudioContentType::Float32);
        assert!(!request.offline_mode);
        assert!(request.main_input_channels.is_none());
    }
}
