//! In-process mock plugin format.
//!
//! Hosts are awkward to test against real bundles, so this module provides a
//! fully scripted format adapter behind the same `PluginInstance` contract
//! the ABI adapters implement. Tests (and headless tools) register a
//! [`MockPluginFormat`], then observe what each instance received and inject
//! output events for the next processed block.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::bus::{
    AudioBusConfiguration, AudioBusDefinition, AudioBusesInfo, BusRole, ChannelLayout,
};
use crate::catalog::PluginCatalogEntry;
use crate::context::AudioProcessContext;
use crate::error::HostError;
use crate::plugin::params::{
    ParameterEventHub, ParameterFlags, PerNoteControllerContext, PluginParameter,
};
use crate::plugin::{
    ConfigurationRequest, PluginFormat, PluginInstance, UiThreadRequirement,
};
use crate::ump::Ump;

pub const MOCK_FORMAT_NAME: &str = "MOCK";

/// Everything a test can observe or script about one mock instance.
#[derive(Default)]
pub struct MockShared {
    pub configured: AtomicBool,
    pub processing: AtomicBool,
    pub processed_blocks: AtomicU32,
    /// Every UMP message the instance consumed from its input sequence.
    pub received_events: Mutex<Vec<Ump>>,
    /// Events to append to the output sequence on the next process call.
    pub pending_output: Mutex<Vec<Ump>>,
    /// `(index, plain value)` pairs from `set_parameter`.
    pub parameter_writes: Mutex<Vec<(u32, f64)>>,
    /// Per-note controller writes as `(note, controller, value)`.
    pub per_note_writes: Mutex<Vec<(u8, u32, f64)>>,
    pub loaded_presets: Mutex<Vec<u32>>,
    pub hub: Arc<ParameterEventHub>,
    /// Constant sample value written to the main output each block.
    pub output_level: Mutex<f32>,
}

impl MockShared {
    pub fn received_notes(&self) -> Vec<(bool, u8, u8, u8)> {
        self.received_events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|u| {
                u.note_semantics()
                    .map(|(on, channel, note)| (on, u.group(), channel, note))
            })
            .collect()
    }

    pub fn received_groups(&self) -> Vec<u8> {
        self.received_events
            .lock()
            .unwrap()
            .iter()
            .map(|u| u.group())
            .collect()
    }

    pub fn queue_output_event(&self, ump: Ump) {
        self.pending_output.lock().unwrap().push(ump);
    }
}

/// Scripted plugin instance backing the mock format.
pub struct MockPluginInstance {
    entry: PluginCatalogEntry,
    shared: Arc<MockShared>,
    buses: AudioBusesInfo,
    parameters: Vec<PluginParameter>,
    values: Vec<f64>,
}

impl MockPluginInstance {
    pub fn instrument(plugin_id: &str) -> Self {
        Self::with_shared(plugin_id, Arc::new(MockShared::default()))
    }

    pub fn with_shared(plugin_id: &str, shared: Arc<MockShared>) -> Self {
        let entry = PluginCatalogEntry::new(
            MOCK_FORMAT_NAME,
            plugin_id,
            format!("/dev/null/{plugin_id}.mock"),
            plugin_id,
        );
        let stereo = ChannelLayout::STEREO;
        let buses = AudioBusesInfo {
            input_buses: vec![AudioBusConfiguration::new(
                AudioBusDefinition::new("Input", BusRole::Main, vec![stereo]),
                stereo,
            )],
            output_buses: vec![AudioBusConfiguration::new(
                AudioBusDefinition::new("Output", BusRole::Main, vec![stereo]),
                stereo,
            )],
            has_event_input: true,
            has_event_output: true,
        };
        let parameters = vec![
            PluginParameter {
                index: 0,
                stable_id: 0,
                name: "Gain".to_string(),
                path: String::new(),
                default_plain: 1.0,
                min_plain: 0.0,
                max_plain: 1.0,
                flags: ParameterFlags {
                    automatable: true,
                    readable: true,
                    ..Default::default()
                },
                enumerations: Vec::new(),
            },
            PluginParameter {
                index: 1,
                stable_id: 396,
                name: "Cutoff".to_string(),
                path: "Filter".to_string(),
                default_plain: 0.5,
                min_plain: 0.0,
                max_plain: 1.0,
                flags: ParameterFlags {
                    automatable: true,
                    readable: true,
                    ..Default::default()
                },
                enumerations: Vec::new(),
            },
        ];
        let values = parameters.iter().map(|p| p.default_plain).collect();
        Self {
            entry,
            shared,
            buses,
            parameters,
            values,
        }
    }

    pub fn shared(&self) -> Arc<MockShared> {
        self.shared.clone()
    }
}

impl PluginInstance for MockPluginInstance {
    fn catalog_entry(&self) -> &PluginCatalogEntry {
        &self.entry
    }

    fn requires_ui_thread_on(&self) -> UiThreadRequirement {
        UiThreadRequirement::None
    }

    fn configure(&mut self, _request: &ConfigurationRequest) -> Result<(), HostError> {
        self.shared.configured.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn start_processing(&mut self) -> Result<(), HostError> {
        self.shared.processing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_processing(&mut self) -> Result<(), HostError> {
        self.shared.processing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn process(&mut self, context: &mut AudioProcessContext) -> Result<(), HostError> {
        self.shared.processed_blocks.fetch_add(1, Ordering::SeqCst);
        let consumed: Vec<Ump> = context.event_in().iter().collect();
        self.shared
            .received_events
            .lock()
            .unwrap()
            .extend_from_slice(&consumed);

        let level = *self.shared.output_level.lock().unwrap();
        for bus in 0..context.audio_out_bus_count() {
            for channel in 0..context.output_channel_count(bus) {
                if let Some(samples) = context.output_f32_mut(bus, channel) {
                    samples.fill(level);
                }
            }
        }

        let queued: Vec<Ump> = self.shared.pending_output.lock().unwrap().drain(..).collect();
        for ump in queued {
            context.event_out_mut().append(&ump)?;
        }
        Ok(())
    }

    fn parameters(&mut self) -> Result<Vec<PluginParameter>, HostError> {
        Ok(self.parameters.clone())
    }

    fn get_parameter(&self, index: u32) -> Result<f64, HostError> {
        self.values
            .get(index as usize)
            .copied()
            .ok_or_else(|| HostError::InvalidParameterOperation(format!("index {index}")))
    }

    fn set_parameter(
        &mut self,
        index: u32,
        plain_value: f64,
        _timestamp: u64,
    ) -> Result<(), HostError> {
        let slot = self
            .values
            .get_mut(index as usize)
            .ok_or_else(|| HostError::InvalidParameterOperation(format!("index {index}")))?;
        *slot = plain_value;
        self.shared
            .parameter_writes
            .lock()
            .unwrap()
            .push((index, plain_value));
        Ok(())
    }

    fn set_per_note_controller(
        &mut self,
        context: PerNoteControllerContext,
        controller_index: u32,
        value: f64,
        _timestamp: u64,
    ) -> Result<(), HostError> {
        self.shared
            .per_note_writes
            .lock()
            .unwrap()
            .push((context.note, controller_index, value));
        Ok(())
    }

    fn parameter_events(&self) -> &Arc<ParameterEventHub> {
        &self.shared.hub
    }

    fn save_state(&mut self) -> Result<Vec<u8>, HostError> {
        serde_json::to_vec(&self.values)
            .map_err(|e| HostError::InvalidParameterOperation(e.to_string()))
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), HostError> {
        let values: Vec<f64> = serde_json::from_slice(data)
            .map_err(|e| HostError::InvalidParameterOperation(e.to_string()))?;
        if values.len() == self.values.len() {
            self.values = values;
        }
        Ok(())
    }

    fn preset_count(&mut self) -> Result<u32, HostError> {
        Ok(3)
    }

    fn load_preset(&mut self, index: u32) -> Result<(), HostError> {
        self.shared.loaded_presets.lock().unwrap().push(index);
        Ok(())
    }

    fn audio_buses(&self) -> &AudioBusesInfo {
        &self.buses
    }
}

/// Format adapter that manufactures [`MockPluginInstance`]s and hands tests
/// the shared observation state keyed by plugin id.
#[derive(Default)]
pub struct MockPluginFormat {
    shared: Mutex<HashMap<String, Arc<MockShared>>>,
}

impl MockPluginFormat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observation handle for a plugin id; created on demand so it can be
    /// fetched before or after instantiation.
    pub fn shared_for(&self, plugin_id: &str) -> Arc<MockShared> {
        self.shared
            .lock()
            .unwrap()
            .entry(plugin_id.to_string())
            .or_default()
            .clone()
    }

    pub fn entry_for(&self, plugin_id: &str) -> PluginCatalogEntry {
        PluginCatalogEntry::new(
            MOCK_FORMAT_NAME,
            plugin_id,
            format!("/dev/null/{plugin_id}.mock"),
            plugin_id,
        )
    }
}

impl PluginFormat for MockPluginFormat {
    fn name(&self) -> &str {
        MOCK_FORMAT_NAME
    }

    fn search_paths(&self) -> Vec<std::path::PathBuf> {
        Vec::new()
    }

    fn scan_bundle(&self, _bundle_path: &std::path::Path) -> Vec<PluginCatalogEntry> {
        Vec::new()
    }

    fn create_instance(
        &self,
        entry: &PluginCatalogEntry,
    ) -> Result<Box<dyn PluginInstance>, HostError> {
        let shared = self.shared_for(&entry.plugin_id);
        Ok(Box::new(MockPluginInstance::with_shared(
            &entry.plugin_id,
            shared,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MasterContext;

    #[test]
    fn test_mock_records_received_events_and_emits_output() {
        let mut instance = MockPluginInstance::instrument("test");
        let shared = instance.shared();
        shared.queue_output_event(Ump::midi2_nrpn(0, 0, 1, 2, 3));

        let master = Arc::new(MasterContext::new(48000));
        let mut ctx = AudioProcessContext::new(master, 256);
        ctx.configure_main_bus(2, 2, 64);
        ctx.event_in_mut()
            .append(&Ump::midi2_note_on(0, 0, 60, 0, 100, 0))
            .unwrap();

        instance.configure(&ConfigurationRequest::default()).unwrap();
        instance.start_processing().unwrap();
        instance.process(&mut ctx).unwrap();

        assert_eq!(shared.received_notes(), vec![(true, 0, 0, 60)]);
        assert_eq!(ctx.event_out().iter().count(), 1);
        assert_eq!(shared.processed_blocks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mock_state_round_trip() {
        let mut instance = MockPluginInstance::instrument("state");
        instance.set_parameter(1, 0.25, 0).unwrap();
        let blob = instance.save_state().unwrap();
        let mut other = MockPluginInstance::instrument("state2");
        other.load_state(&blob).unwrap();
        assert_eq!(other.get_parameter(1).unwrap(), 0.25);
        // Save → load → save yields an identical blob.
        assert_eq!(other.save_state().unwrap(), blob);
    }
}
