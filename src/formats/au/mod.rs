//! Audio Unit format adapter (platform audio-unit model).
//!
//! Only compiled in full on macOS, where plugins are reached through the
//! `AUAudioUnit` Objective-C API: render blocks with linked-list render
//! events for processing, schedule blocks for MIDI input, and parameter
//! observer tokens for change notifications. On other platforms the format
//! registers but advertises no plugins.

#[cfg(target_os = "macos")]
mod instance;

#[cfg(target_os = "macos")]
pub use instance::AuPluginInstance;

use std::path::{Path, PathBuf};

use crate::catalog::PluginCatalogEntry;
use crate::error::HostError;
use crate::plugin::{PluginFormat, PluginInstance};

pub const AU_FORMAT_NAME: &str = "AU";

/// Component identity encoded in catalog entries as
/// `type:subtype:manufacturer` four-char codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuComponentId {
    pub component_type: u32,
    pub subtype: u32,
    pub manufacturer: u32,
}

fn fourcc(code: &str) -> Option<u32> {
    let bytes = code.as_bytes();
    if bytes.len() != 4 {
        return None;
    }
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

impl AuComponentId {
    pub fn parse(plugin_id: &str) -> Option<Self> {
        let mut parts = plugin_id.split(':');
        let component_type = fourcc(parts.next()?)?;
        let subtype = fourcc(parts.next()?)?;
        let manufacturer = fourcc(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            component_type,
            subtype,
            manufacturer,
        })
    }
}

pub struct AuPluginFormat;

impl AuPluginFormat {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AuPluginFormat {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginFormat for AuPluginFormat {
    fn name(&self) -> &str {
        AU_FORMAT_NAME
    }

    fn search_paths(&self) -> Vec<PathBuf> {
        // Audio Units register through the component system, not the file
        // system; discovery goes through the component manager instead.
        Vec::new()
    }

    fn scan_bundle(&self, _bundle_path: &Path) -> Vec<PluginCatalogEntry> {
        Vec::new()
    }

    #[cfg(target_os = "macos")]
    fn create_instance(
        &self,
        entry: &PluginCatalogEntry,
    ) -> Result<Box<dyn PluginInstance>, HostError> {
        let component = AuComponentId::parse(&entry.plugin_id).ok_or_else(|| {
            HostError::FailedToInstantiate(format!(
                "invalid audio unit id {}",
                entry.plugin_id
            ))
        })?;
        let instance = AuPluginInstance::create(entry, component)?;
        Ok(Box::new(instance))
    }

    #[cfg(not(target_os = "macos"))]
    fn create_instance(
        &self,
        entry: &PluginCatalogEntry,
    ) -> Result<Box<dyn PluginInstance>, HostError> {
        Err(HostError::FailedToInstantiate(format!(
            "audio units are unavailable on this platform ({})",
            entry.plugin_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_id_parsing() {
        let id = AuComponentId::parse("aumu:Smpl:Acme").unwrap();
        assert_eq!(id.component_type, u32::from_be_bytes(*b"aumu"));
        assert_eq!(id.subtype, u32::from_be_bytes(*b"Smpl"));
        assert_eq!(id.manufacturer, u32::from_be_bytes(*b"Acme"));
        assert!(AuComponentId::parse("bad").is_none());
        assert!(AuComponentId::parse("toolong:Smpl:Acme").is_none());
    }
}
