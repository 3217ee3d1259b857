//! Plugin catalog records and standard search paths.
//!
//! The catalog scanner itself is an external collaborator; the core consumes
//! `PluginCatalogEntry` records through this module and can cache them as
//! JSON between runs. The per-format directory conventions live here so the
//! scanner and the adapters agree on where bundles are found.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::HostError;

/// Identity record for one installed plugin. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginCatalogEntry {
    pub format: String,
    pub plugin_id: String,
    pub bundle_path: PathBuf,
    pub display_name: String,
    pub vendor: String,
    pub product_url: String,
}

impl PluginCatalogEntry {
    pub fn new(
        format: impl Into<String>,
        plugin_id: impl Into<String>,
        bundle_path: impl Into<PathBuf>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            format: format.into(),
            plugin_id: plugin_id.into(),
            bundle_path: bundle_path.into(),
            display_name: display_name.into(),
            vendor: String::new(),
            product_url: String::new(),
        }
    }
}

/// The set of known plugins, with a JSON cache.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PluginCatalog {
    entries: Vec<PluginCatalogEntry>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: PluginCatalogEntry) {
        if !self
            .entries
            .iter()
            .any(|e| e.format == entry.format && e.plugin_id == entry.plugin_id)
        {
            self.entries.push(entry);
        }
    }

    pub fn plugins(&self) -> &[PluginCatalogEntry] {
        &self.entries
    }

    pub fn find(&self, format: &str, plugin_id: &str) -> Option<&PluginCatalogEntry> {
        self.entries
            .iter()
            .find(|e| e.format == format && e.plugin_id == plugin_id)
    }

    pub fn display_name_for(&self, format: &str, plugin_id: &str) -> Option<&str> {
        self.find(format, plugin_id).map(|e| e.display_name.as_str())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn load(path: &Path) -> Result<Self, HostError> {
        let data = std::fs::read(path)
            .map_err(|e| HostError::FailedToInstantiate(format!("catalog read: {e}")))?;
        serde_json::from_slice(&data)
            .map_err(|e| HostError::FailedToInstantiate(format!("catalog parse: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<(), HostError> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| HostError::FailedToInstantiate(format!("catalog encode: {e}")))?;
        std::fs::write(path, data)
            .map_err(|e| HostError::FailedToInstantiate(format!("catalog write: {e}")))
    }
}

/// Standard VST3 plugin directories for the current platform.
pub fn vst3_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    #[cfg(target_os = "windows")]
    {
        if let Some(local_app_data) = std::env::var_os("LOCALAPPDATA") {
            paths.push(PathBuf::from(local_app_data).join("Programs/Common/VST3"));
        }
        if let Some(program_files) = std::env::var_os("PROGRAMFILES") {
            paths.push(PathBuf::from(program_files).join("Common Files/VST3"));
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join("Library/Audio/Plug-Ins/VST3"));
        }
        paths.push(PathBuf::from("/Library/Audio/Plug-Ins/VST3"));
    }

    #[cfg(target_os = "linux")]
    {
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".vst3"));
        }
        paths.push(PathBuf::from("/usr/lib/vst3"));
        paths.push(PathBuf::from("/usr/local/lib/vst3"));
    }

    paths
}

/// Standard CLAP plugin directories for the current platform.
pub fn clap_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    #[cfg(target_os = "windows")]
    {
        if let Some(common) = std::env::var_os("COMMONPROGRAMFILES") {
            paths.push(PathBuf::from(common).join("CLAP"));
        }
    }

    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/Library/Audio/Plug-Ins/CLAP"));
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join("Library/Audio/Plug-Ins/CLAP"));
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".clap"));
        }
        paths.push(PathBuf::from("/usr/lib/clap"));
    }

    paths
}

/// Find bundle paths with the given extension under the standard directories.
/// Bad directories are skipped; discovery never aborts on one bad entry.
pub fn find_bundles(roots: &[PathBuf], extension: &str) -> Vec<PathBuf> {
    let mut bundles = Vec::new();
    for root in roots {
        if !root.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(root)
            .max_depth(3)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if path.extension().map(|e| e == extension).unwrap_or(false) {
                bundles.push(path.to_path_buf());
            }
        }
    }
    bundles.sort();
    bundles.dedup();
    bundles
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(format: &str, id: &str) -> PluginCatalogEntry {
        PluginCatalogEntry::new(format, id, format!("/tmp/{id}.bin"), id.to_uppercase())
    }

    #[test]
    fn test_catalog_dedup_and_lookup() {
        let mut catalog = PluginCatalog::new();
        catalog.add(entry("CLAP", "com.example.synth"));
        catalog.add(entry("CLAP", "com.example.synth"));
        catalog.add(entry("VST3", "com.example.synth"));
        assert_eq!(catalog.plugins().len(), 2);
        assert!(catalog.find("CLAP", "com.example.synth").is_some());
        assert!(catalog.find("CLAP", "missing").is_none());
        assert_eq!(
            catalog.display_name_for("VST3", "com.example.synth"),
            Some("COM.EXAMPLE.SYNTH")
        );
    }

    #[test]
    fn test_catalog_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let mut catalog = PluginCatalog::new();
        catalog.add(entry("CLAP", "com.example.fx"));
        catalog.save(&path).unwrap();
        let loaded = PluginCatalog::load(&path).unwrap();
        assert_eq!(loaded.plugins(), catalog.plugins());
    }

    #[test]
    fn test_find_bundles_skips_missing_roots() {
        let bundles = find_bundles(&[PathBuf::from("/definitely/not/here")], "clap");
        assert!(bundles.is_empty());
    }
}
