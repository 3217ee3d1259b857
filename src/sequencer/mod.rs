//! Sequencer engine: tracks, transport, group routing and parameter fan-in.
//!
//! The engine owns the tracks and their process contexts, drives them from
//! the device callback, fans UMP input out to plugin instances by 4-bit
//! group, and collects plugin-side parameter changes (native listeners and
//! NRPN reflection) into per-instance update queues the UI can drain.
//!
//! Threading: control operations take `&mut self` and run on the main
//! thread; `process_audio` runs on the audio thread. The embedding decides
//! how the two meet (the device dispatcher wraps the engine in a mutex and
//! try-locks from the callback). The fine-grained state shared with graph
//! callbacks lives behind its own short-lived mutexes and is never held
//! across plugin calls.

use std::cell::UnsafeCell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::catalog::{PluginCatalog, PluginCatalogEntry};
use crate::context::{AudioProcessContext, MasterContext, SequenceProcessContext};
use crate::error::HostError;
use crate::node_graph::{AudioPluginNode, AudioPluginTrack, MidiOutputSink};
use crate::plugin::{ConfigurationRequest, PluginFormatRegistry};
use crate::ump::{self, iter_ump_bytes, status, Ump, GROUP_WILDCARD};

/// Number of bars in the exported input/output spectra.
pub const SPECTRUM_BARS: usize = 32;

/// A parameter change reported by a plugin: plain value for native
/// listeners, `raw / u32::MAX` for NRPN reflection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterUpdate {
    pub parameter_index: i32,
    pub value: f64,
}

/// Identity of one plugin node for UI listings.
#[derive(Debug, Clone)]
pub struct PluginNodeInfo {
    pub instance_id: i32,
    pub plugin_id: String,
    pub format: String,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub track_index: usize,
    pub nodes: Vec<PluginNodeInfo>,
}

#[derive(Default)]
struct GroupTable {
    plugin_groups: HashMap<i32, u8>,
    group_to_instance: HashMap<u8, i32>,
    free_groups: Vec<u8>,
    next_group: u8,
}

impl GroupTable {
    fn assign(&mut self, instance_id: i32) -> u8 {
        if let Some(group) = self.plugin_groups.get(&instance_id) {
            return *group;
        }
        let group = if let Some(free) = self.free_groups.pop() {
            free
        } else if self.next_group <= 0x0F {
            let group = self.next_group;
            self.next_group += 1;
            group
        } else {
            log::error!("No available UMP groups for plugin instance {instance_id}");
            GROUP_WILDCARD
        };
        if group != GROUP_WILDCARD {
            self.plugin_groups.insert(instance_id, group);
            self.group_to_instance.insert(group, instance_id);
        }
        group
    }

    fn release(&mut self, instance_id: i32) {
        if let Some(group) = self.plugin_groups.remove(&instance_id) {
            if group != GROUP_WILDCARD {
                self.group_to_instance.remove(&group);
                if group <= 0x0F {
                    self.free_groups.push(group);
                }
            }
        }
    }
}

#[derive(Default)]
struct ParamStore {
    pending_updates: HashMap<i32, Vec<ParameterUpdate>>,
    metadata_refresh: HashSet<i32>,
}

type OutputHandler = Box<dyn Fn(&[u8]) + Send>;

/// State reachable from the per-track graph callbacks (group resolution and
/// plugin-output dispatch) as well as from the engine's control surface.
#[derive(Default)]
struct EngineRouter {
    groups: Mutex<GroupTable>,
    params: Mutex<ParamStore>,
    output_handlers: Mutex<HashMap<i32, OutputHandler>>,
    process_error_count: AtomicU32,
}

impl EngineRouter {
    fn group_for(&self, instance_id: i32) -> Option<u8> {
        self.groups
            .lock()
            .unwrap()
            .plugin_groups
            .get(&instance_id)
            .copied()
    }

    fn instance_for(&self, group: u8) -> Option<i32> {
        self.groups
            .lock()
            .unwrap()
            .group_to_instance
            .get(&group)
            .copied()
    }

    fn push_update(&self, instance_id: i32, update: ParameterUpdate) {
        self.params
            .lock()
            .unwrap()
            .pending_updates
            .entry(instance_id)
            .or_default()
            .push(update);
    }

    /// Group-rewrite a plugin's output buffer, extract NRPN parameter
    /// reflections, and forward the rewritten bytes to any registered
    /// output handler. Audio thread.
    fn dispatch_plugin_output(&self, instance_id: i32, bytes: &[u8], scratch: &mut Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let Some(group) = self.group_for(instance_id) else {
            return;
        };
        if bytes.len() > scratch.capacity() {
            return;
        }
        scratch.clear();
        scratch.extend_from_slice(bytes);

        for message in iter_ump_bytes(scratch) {
            if message.message_type() == ump::message_type::MIDI2_CHANNEL_VOICE
                && message.status_code() == status::NRPN
            {
                let bank = message.data1();
                let index = message.data2();
                let parameter_index = bank as i32 * 128 + index as i32;
                let value = message.data_word() as f64 / u32::MAX as f64;
                self.push_update(
                    instance_id,
                    ParameterUpdate {
                        parameter_index,
                        value,
                    },
                );
            }
        }
        ump::rewrite_group(scratch, group);

        if let Some(handler) = self.output_handlers.lock().unwrap().get(&instance_id) {
            handler(scratch);
        }
    }
}

/// Spectrum hand-off between the RT writer and UI readers. A single atomic
/// flag arbitrates: a reader sets it while copying out, the writer skips its
/// copy whenever the flag is observed set, so readers always see a complete
/// buffer (either the previous one or the new one, never a torn mix).
struct SpectrumShared {
    reading: AtomicBool,
    input: UnsafeCell<[f32; SPECTRUM_BARS]>,
    output: UnsafeCell<[f32; SPECTRUM_BARS]>,
}

unsafe impl Sync for SpectrumShared {}

impl SpectrumShared {
    fn new() -> Self {
        Self {
            reading: AtomicBool::new(false),
            input: UnsafeCell::new([0.0; SPECTRUM_BARS]),
            output: UnsafeCell::new([0.0; SPECTRUM_BARS]),
        }
    }

    fn publish(&self, input: &[f32; SPECTRUM_BARS], output: &[f32; SPECTRUM_BARS]) {
        if self
            .reading
            .compare_exchange(false, false, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            // No reader active; safe to overwrite.
            unsafe {
                *self.input.get() = *input;
                *self.output.get() = *output;
            }
        }
    }

    fn read(&self, input: bool, dest: &mut [f32]) {
        self.reading.store(true, Ordering::Release);
        let source = unsafe {
            if input {
                &*self.input.get()
            } else {
                &*self.output.get()
            }
        };
        let bars = dest.len().min(SPECTRUM_BARS);
        dest[..bars].copy_from_slice(&source[..bars]);
        self.reading.store(false, Ordering::Release);
    }
}

/// Cloneable UI-side handle for reading the exported spectra without
/// touching the engine lock.
#[derive(Clone)]
pub struct SpectrumReader {
    shared: Arc<SpectrumShared>,
}

impl SpectrumReader {
    pub fn input_spectrum(&self, dest: &mut [f32]) {
        self.shared.read(true, dest);
    }

    pub fn output_spectrum(&self, dest: &mut [f32]) {
        self.shared.read(false, dest);
    }
}

pub struct SequencerEngine {
    sample_rate: u32,
    buffer_size_frames: usize,
    ump_buffer_size_bytes: usize,
    default_input_channels: u32,
    default_output_channels: u32,
    registry: Arc<PluginFormatRegistry>,
    catalog: PluginCatalog,
    master: Arc<MasterContext>,
    tracks: Vec<AudioPluginTrack>,
    sequence: SequenceProcessContext,
    instance_id_serial: i32,
    is_playback_active: AtomicBool,
    playback_position_samples: AtomicI64,
    offline_rendering: AtomicBool,
    router: Arc<EngineRouter>,
    track_for_instance: HashMap<i32, usize>,
    bypassed_instances: HashMap<i32, bool>,
    listener_tokens: HashMap<i32, (u64, u64)>,
    preprocess_callback: Option<Box<dyn FnMut(&mut AudioProcessContext) + Send>>,
    rt_input_spectrum: [f32; SPECTRUM_BARS],
    rt_output_spectrum: [f32; SPECTRUM_BARS],
    spectrum: Arc<SpectrumShared>,
}

impl SequencerEngine {
    pub fn new(
        sample_rate: u32,
        buffer_size_frames: usize,
        ump_buffer_size_bytes: usize,
        registry: Arc<PluginFormatRegistry>,
    ) -> Self {
        let master = Arc::new(MasterContext::new(sample_rate));
        Self {
            sample_rate,
            buffer_size_frames,
            ump_buffer_size_bytes,
            default_input_channels: 2,
            default_output_channels: 2,
            registry,
            catalog: PluginCatalog::new(),
            master: master.clone(),
            tracks: Vec::new(),
            sequence: SequenceProcessContext::new(master),
            instance_id_serial: 0,
            is_playback_active: AtomicBool::new(false),
            playback_position_samples: AtomicI64::new(0),
            offline_rendering: AtomicBool::new(false),
            router: Arc::new(EngineRouter::default()),
            track_for_instance: HashMap::new(),
            bypassed_instances: HashMap::new(),
            listener_tokens: HashMap::new(),
            preprocess_callback: None,
            rt_input_spectrum: [0.0; SPECTRUM_BARS],
            rt_output_spectrum: [0.0; SPECTRUM_BARS],
            spectrum: Arc::new(SpectrumShared::new()),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn master(&self) -> &Arc<MasterContext> {
        &self.master
    }

    pub fn catalog(&self) -> &PluginCatalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut PluginCatalog {
        &mut self.catalog
    }

    /// Re-scan every registered format's search paths into the catalog.
    pub fn perform_plugin_scanning(&mut self, rescan: bool) {
        if rescan {
            self.catalog.clear();
        }
        for format in self.registry.formats() {
            for path in format.search_paths() {
                for bundle in crate::catalog::find_bundles(&[path], bundle_extension(format.name()))
                {
                    for entry in format.scan_bundle(&bundle) {
                        self.catalog.add(entry);
                    }
                }
            }
        }
    }

    /// Default channel configuration applied to new tracks; called when the
    /// device changes.
    pub fn set_default_channels(&mut self, input_channels: u32, output_channels: u32) {
        self.default_input_channels = input_channels;
        self.default_output_channels = output_channels;
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn spectrum_reader(&self) -> SpectrumReader {
        SpectrumReader {
            shared: self.spectrum.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Track and plugin management (main thread)
    // ------------------------------------------------------------------

    pub fn add_empty_track(&mut self) -> usize {
        let mut track = AudioPluginTrack::new(self.event_capacity());
        self.configure_track_routing(&mut track);
        self.tracks.push(track);
        let mut context = AudioProcessContext::new(self.master.clone(), self.ump_buffer_size_bytes);
        context.configure_main_bus(
            self.default_input_channels,
            self.default_output_channels,
            self.buffer_size_frames,
        );
        self.sequence.tracks.push(context);
        self.tracks.len() - 1
    }

    /// Create a new track preloaded with one plugin.
    pub fn add_simple_track(
        &mut self,
        format: &str,
        plugin_id: &str,
    ) -> Result<(i32, usize), HostError> {
        let track_index = self.add_empty_track();
        match self.add_plugin_to_track(track_index, format, plugin_id) {
            Ok(instance_id) => Ok((instance_id, track_index)),
            Err(err) => {
                self.tracks.pop();
                self.sequence.tracks.pop();
                Err(err)
            }
        }
    }

    /// Instantiate a plugin and append it to an existing track's chain.
    pub fn add_plugin_to_track(
        &mut self,
        track_index: usize,
        format: &str,
        plugin_id: &str,
    ) -> Result<i32, HostError> {
        if track_index >= self.tracks.len() {
            return Err(HostError::FailedToInstantiate(format!(
                "invalid track index {track_index}"
            )));
        }

        let entry = self
            .catalog
            .find(format, plugin_id)
            .cloned()
            .unwrap_or_else(|| PluginCatalogEntry::new(format, plugin_id, "", plugin_id));
        let mut instance = self.registry.create_instance(&entry)?;

        let request = ConfigurationRequest {
            sample_rate: self.sample_rate,
            buffer_size_frames: self.buffer_size_frames,
            offline_mode: self.offline_rendering(),
            main_input_channels: Some(self.default_input_channels),
            main_output_channels: Some(self.default_output_channels),
            ..Default::default()
        };
        instance.configure(&request)?;
        instance.start_processing()?;

        let instance_id = self.instance_id_serial;
        self.instance_id_serial += 1;

        let node = AudioPluginNode::new(instance_id, instance, self.event_capacity());
        self.register_parameter_listener(instance_id, &node);
        self.tracks[track_index].graph_mut().append_node(node);

        self.router.groups.lock().unwrap().assign(instance_id);
        self.track_for_instance.insert(instance_id, track_index);
        self.bypassed_instances.insert(instance_id, false);
        Ok(instance_id)
    }

    /// Tear a plugin out of its track; emits synthesized note-offs for every
    /// still-active note before removal. Returns `false` when the id is
    /// unknown.
    pub fn remove_plugin_instance(&mut self, instance_id: i32) -> bool {
        self.unregister_parameter_listener(instance_id);
        self.router
            .output_handlers
            .lock()
            .unwrap()
            .remove(&instance_id);
        self.router.groups.lock().unwrap().release(instance_id);
        self.track_for_instance.remove(&instance_id);
        self.bypassed_instances.remove(&instance_id);

        for track_index in 0..self.tracks.len() {
            if let Some(mut node) = self.tracks[track_index].graph_mut().remove_node(instance_id) {
                node.stop_all_notes();
                node.instance_mut().destroy_ui();
                if let Err(err) = node.instance_mut().stop_processing() {
                    if !err.is_not_implemented() {
                        log::warn!("stop_processing on removal failed: {err}");
                    }
                }
                drop(node);
                if self.tracks[track_index].graph().is_empty() {
                    self.tracks.remove(track_index);
                    self.sequence.tracks.remove(track_index);
                }
                self.refresh_instance_routes();
                return true;
            }
        }
        false
    }

    pub fn remove_track(&mut self, track_index: usize) -> bool {
        if track_index >= self.tracks.len() {
            return false;
        }
        let instance_ids = self.tracks[track_index].graph().instance_ids();
        for instance_id in instance_ids {
            self.unregister_parameter_listener(instance_id);
            self.router.groups.lock().unwrap().release(instance_id);
            self.router
                .output_handlers
                .lock()
                .unwrap()
                .remove(&instance_id);
            self.track_for_instance.remove(&instance_id);
            self.bypassed_instances.remove(&instance_id);
        }
        self.tracks.remove(track_index);
        self.sequence.tracks.remove(track_index);
        self.refresh_instance_routes();
        true
    }

    /// Drop tracks whose chains became empty. Must run from a non-audio
    /// thread.
    pub fn cleanup_empty_tracks(&mut self) {
        let mut index = 0;
        while index < self.tracks.len() {
            if self.tracks[index].graph().is_empty() {
                self.tracks.remove(index);
                self.sequence.tracks.remove(index);
            } else {
                index += 1;
            }
        }
        self.refresh_instance_routes();
    }

    fn refresh_instance_routes(&mut self) {
        self.track_for_instance.clear();
        for (track_index, track) in self.tracks.iter().enumerate() {
            for instance_id in track.graph().instance_ids() {
                self.track_for_instance.insert(instance_id, track_index);
                self.router.groups.lock().unwrap().assign(instance_id);
            }
        }
    }

    fn configure_track_routing(&self, track: &mut AudioPluginTrack) {
        let router = self.router.clone();
        track.graph_mut().set_group_resolver(Box::new(move |id| {
            router.group_for(id).unwrap_or(GROUP_WILDCARD)
        }));
        let router = self.router.clone();
        let mut scratch: Vec<u8> = Vec::with_capacity(self.ump_buffer_size_bytes);
        track
            .graph_mut()
            .set_event_output_sink(Box::new(move |id, bytes| {
                router.dispatch_plugin_output(id, bytes, &mut scratch);
            }));
    }

    fn event_capacity(&self) -> usize {
        (self.ump_buffer_size_bytes / 8).max(64)
    }

    pub fn track_infos(&self) -> Vec<TrackInfo> {
        self.tracks
            .iter()
            .enumerate()
            .map(|(track_index, track)| TrackInfo {
                track_index,
                nodes: track
                    .graph()
                    .nodes()
                    .iter()
                    .map(|node| {
                        let entry = node.instance().catalog_entry();
                        PluginNodeInfo {
                            instance_id: node.instance_id(),
                            plugin_id: entry.plugin_id.clone(),
                            format: entry.format.clone(),
                            display_name: self
                                .catalog
                                .display_name_for(&entry.format, &entry.plugin_id)
                                .unwrap_or(&entry.display_name)
                                .to_string(),
                        }
                    })
                    .collect(),
            })
            .collect()
    }

    pub fn plugin_name(&self, instance_id: i32) -> String {
        self.find_node(instance_id)
            .map(|node| {
                let entry = node.instance().catalog_entry();
                self.catalog
                    .display_name_for(&entry.format, &entry.plugin_id)
                    .unwrap_or(&entry.display_name)
                    .to_string()
            })
            .unwrap_or_else(|| format!("Plugin {instance_id}"))
    }

    fn find_node(&self, instance_id: i32) -> Option<&AudioPluginNode> {
        self.tracks
            .iter()
            .flat_map(|t| t.graph().nodes())
            .find(|n| n.instance_id() == instance_id)
    }

    fn find_node_mut(&mut self, instance_id: i32) -> Option<&mut AudioPluginNode> {
        self.tracks
            .iter_mut()
            .flat_map(|t| t.graph_mut().nodes_mut().iter_mut())
            .find(|n| n.instance_id() == instance_id)
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    pub fn is_playback_active(&self) -> bool {
        self.is_playback_active.load(Ordering::Acquire)
    }

    pub fn playback_position(&self) -> i64 {
        self.playback_position_samples.load(Ordering::Acquire)
    }

    pub fn set_playback_position(&self, samples: i64) {
        self.playback_position_samples
            .store(samples, Ordering::Release);
    }

    pub fn start_playback(&self) {
        self.playback_position_samples.store(0, Ordering::Release);
        self.is_playback_active.store(true, Ordering::Release);
    }

    pub fn stop_playback(&self) {
        self.is_playback_active.store(false, Ordering::Release);
        self.playback_position_samples.store(0, Ordering::Release);
    }

    pub fn pause_playback(&self) {
        self.is_playback_active.store(false, Ordering::Release);
    }

    pub fn resume_playback(&self) {
        self.is_playback_active.store(true, Ordering::Release);
    }

    pub fn offline_rendering(&self) -> bool {
        self.offline_rendering.load(Ordering::Acquire)
    }

    /// Flips render mode on supported adapters at their next configuration.
    pub fn set_offline_rendering(&self, enabled: bool) {
        self.offline_rendering.store(enabled, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Event routing
    // ------------------------------------------------------------------

    /// Route UMP input to the track containing `instance_id`, rewriting the
    /// group nibble of every contained message to the instance's assigned
    /// group first. Virtual MIDI devices can post with group 0 and still
    /// route correctly.
    pub fn enqueue_ump(&mut self, instance_id: i32, bytes: &mut [u8], timestamp: u64) {
        let Some(track_index) = self.track_for_instance.get(&instance_id).copied() else {
            return;
        };
        if let Some(group) = self.router.group_for(instance_id) {
            ump::rewrite_group(bytes, group);
        }
        if let Some(track) = self.tracks.get_mut(track_index) {
            if !track.schedule_events(timestamp, bytes) {
                log::warn!("track {track_index} event intake full; UMP input dropped");
            }
        }
    }

    pub fn send_note_on(&mut self, instance_id: i32, note: u8) {
        self.send_ump(instance_id, Ump::midi2_note_on(0, 0, note, 0, 0xF800, 0));
    }

    pub fn send_note_off(&mut self, instance_id: i32, note: u8) {
        self.send_ump(instance_id, Ump::midi2_note_off(0, 0, note, 0, 0xF800, 0));
    }

    pub fn send_pitch_bend(&mut self, instance_id: i32, normalized_value: f32) {
        let clamped = ((normalized_value + 1.0) * 0.5).clamp(0.0, 1.0);
        let data = (clamped as f64 * u32::MAX as f64) as u32;
        self.send_ump(instance_id, Ump::midi2_pitch_bend(0, 0, data));
    }

    pub fn send_channel_pressure(&mut self, instance_id: i32, pressure: f32) {
        let clamped = pressure.clamp(0.0, 1.0);
        let data = (clamped as f64 * u32::MAX as f64) as u32;
        self.send_ump(instance_id, Ump::midi2_channel_pressure(0, 0, data));
    }

    fn send_ump(&mut self, instance_id: i32, message: Ump) {
        let mut buffer = [0u8; 16];
        ump::write_ump(&mut buffer, 0, &message);
        let size = message.size_in_bytes();
        self.enqueue_ump(instance_id, &mut buffer[..size], 0);
    }

    /// Set a parameter's plain value directly on the instance.
    pub fn set_parameter_value(&mut self, instance_id: i32, index: u32, value: f64) {
        match self.find_node_mut(instance_id) {
            Some(node) => {
                if let Err(err) = node.instance_mut().set_parameter(index, value, 0) {
                    log::error!("set_parameter_value({instance_id}, {index}): {err}");
                }
            }
            None => log::error!("set_parameter_value: invalid instance {instance_id}"),
        }
    }

    /// Register a sink receiving the group-rewritten UMP output of one
    /// instance (virtual MIDI device or host callback).
    pub fn set_plugin_output_handler(
        &mut self,
        instance_id: i32,
        handler: Option<Box<dyn Fn(&[u8]) + Send>>,
    ) {
        let mut handlers = self.router.output_handlers.lock().unwrap();
        match handler {
            Some(handler) => {
                handlers.insert(instance_id, handler);
            }
            None => {
                handlers.remove(&instance_id);
            }
        }
    }

    /// Attach a MIDI output device to an instance: parameter and per-note
    /// changes are reflected as UMP to the device.
    pub fn assign_midi_device_to_plugin(&mut self, instance_id: i32, sink: MidiOutputSink) {
        if let Some(node) = self.find_node_mut(instance_id) {
            node.set_output_sink(Some(sink));
        }
    }

    pub fn clear_midi_device_from_plugin(&mut self, instance_id: i32) {
        if let Some(node) = self.find_node_mut(instance_id) {
            node.set_output_sink(None);
        }
    }

    // ------------------------------------------------------------------
    // Group queries
    // ------------------------------------------------------------------

    pub fn group_for_instance(&self, instance_id: i32) -> Option<u8> {
        self.router.group_for(instance_id)
    }

    pub fn instance_for_group(&self, group: u8) -> Option<i32> {
        self.router.instance_for(group)
    }

    pub fn find_track_index_for_instance(&self, instance_id: i32) -> Option<usize> {
        self.track_for_instance.get(&instance_id).copied()
    }

    // ------------------------------------------------------------------
    // Bypass
    // ------------------------------------------------------------------

    pub fn is_plugin_bypassed(&self, instance_id: i32) -> bool {
        self.bypassed_instances
            .get(&instance_id)
            .copied()
            .unwrap_or(false)
    }

    pub fn set_plugin_bypassed(&mut self, instance_id: i32, bypassed: bool) {
        self.bypassed_instances.insert(instance_id, bypassed);
    }

    pub fn is_track_bypassed(&self, track_index: usize) -> bool {
        self.tracks
            .get(track_index)
            .map(|t| t.bypassed())
            .unwrap_or(false)
    }

    pub fn set_track_bypassed(&mut self, track_index: usize, bypassed: bool) {
        if let Some(track) = self.tracks.get_mut(track_index) {
            track.set_bypassed(bypassed);
        }
    }

    // ------------------------------------------------------------------
    // Parameter listening
    // ------------------------------------------------------------------

    fn register_parameter_listener(&mut self, instance_id: i32, node: &AudioPluginNode) {
        let hub = node.parameter_events();
        let router = self.router.clone();
        let value_token = hub.add_value_listener(move |parameter_index, plain_value| {
            router.push_update(
                instance_id,
                ParameterUpdate {
                    parameter_index: parameter_index as i32,
                    value: plain_value,
                },
            );
        });
        let router = self.router.clone();
        let metadata_token = hub.add_metadata_listener(move || {
            router
                .params
                .lock()
                .unwrap()
                .metadata_refresh
                .insert(instance_id);
        });
        self.listener_tokens
            .insert(instance_id, (value_token, metadata_token));
    }

    fn unregister_parameter_listener(&mut self, instance_id: i32) {
        if let Some((value_token, metadata_token)) = self.listener_tokens.remove(&instance_id) {
            if let Some(node) = self.find_node(instance_id) {
                let hub = node.parameter_events();
                hub.remove_value_listener(value_token);
                hub.remove_metadata_listener(metadata_token);
            }
        }
        let mut params = self.router.params.lock().unwrap();
        params.pending_updates.remove(&instance_id);
        params.metadata_refresh.remove(&instance_id);
    }

    /// Drain the coalesced parameter updates for one instance.
    pub fn get_parameter_updates(&self, instance_id: i32) -> Vec<ParameterUpdate> {
        self.router
            .params
            .lock()
            .unwrap()
            .pending_updates
            .remove(&instance_id)
            .unwrap_or_default()
    }

    /// Test-and-clear the metadata-refresh flag; rebuilds the node's input
    /// map on consumption so NRPN addressing stays aligned with the new
    /// parameter list.
    pub fn consume_parameter_metadata_refresh(&mut self, instance_id: i32) -> bool {
        let refreshed = self
            .router
            .params
            .lock()
            .unwrap()
            .metadata_refresh
            .remove(&instance_id);
        if refreshed {
            if let Some(node) = self.find_node_mut(instance_id) {
                node.refresh_input_map();
            }
        }
        refreshed
    }

    pub fn set_audio_preprocess_callback(
        &mut self,
        callback: Option<Box<dyn FnMut(&mut AudioProcessContext) + Send>>,
    ) {
        self.preprocess_callback = callback;
    }

    // ------------------------------------------------------------------
    // Audio processing (audio thread)
    // ------------------------------------------------------------------

    /// Process one device block: copy device input into every track, run
    /// each track's chain, mix main-bus outputs additively into the device
    /// output and apply tanh soft clipping. Advances the playback position
    /// when the transport is running.
    pub fn process_audio(&mut self, process: &mut AudioProcessContext) -> Result<(), HostError> {
        if self.tracks.len() != self.sequence.tracks.len() {
            return Err(HostError::FailedToProcess(
                "track/context count mismatch".to_string(),
            ));
        }

        let is_playing = self.is_playback_active.load(Ordering::Acquire);
        self.master.set_playback_position_samples(
            self.playback_position_samples.load(Ordering::Acquire),
        );
        self.master.set_playing(is_playing);
        self.master.set_sample_rate(self.sample_rate);

        let frame_count = process.frame_count();

        // Device input into every track's input buffers (zero-filled when
        // the device has fewer channels).
        for context in self.sequence.tracks.iter_mut() {
            context.event_out_mut().set_position(0);
            context.set_frame_count(frame_count);
            for bus in 0..context.audio_in_bus_count() {
                for channel in 0..context.input_channel_count(bus) {
                    match process.input_f32(0, channel) {
                        Some(source) => {
                            if let Some(dest) = context.input_f32_mut(bus, channel) {
                                let frames = source.len().min(dest.len());
                                dest[..frames].copy_from_slice(&source[..frames]);
                            }
                        }
                        None => {
                            if let Some(dest) = context.input_f32_mut(bus, channel) {
                                dest.fill(0.0);
                            }
                        }
                    }
                }
            }
        }

        if let Some(callback) = self.preprocess_callback.as_mut() {
            callback(process);
        }

        let mut first_error: Option<HostError> = None;
        for (track, context) in self.tracks.iter_mut().zip(self.sequence.tracks.iter_mut()) {
            if let Err(err) = track.process_audio(context) {
                let count = self
                    .router
                    .process_error_count
                    .fetch_add(1, Ordering::Relaxed);
                if count % 512 == 0 {
                    log::error!("track processing failed: {err}");
                }
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
            context.event_in_mut().set_position(0);
        }

        // Additive mix of every track's main output bus into the device
        // output.
        if process.audio_out_bus_count() > 0 {
            for channel in 0..process.output_channel_count(0) {
                if let Some(dest) = process.output_f32_mut(0, channel) {
                    dest.fill(0.0);
                }
            }
            for context in self.sequence.tracks.iter() {
                if context.audio_out_bus_count() == 0 {
                    continue;
                }
                let channels = context
                    .output_channel_count(0)
                    .min(process.output_channel_count(0));
                for channel in 0..channels {
                    let Some(source) = context.output_f32(0, channel) else {
                        continue;
                    };
                    if let Some(dest) = process.output_f32_mut(0, channel) {
                        for (d, s) in dest.iter_mut().zip(source.iter()) {
                            *d += *s;
                        }
                    }
                }
            }
            for channel in 0..process.output_channel_count(0) {
                if let Some(dest) = process.output_f32_mut(0, channel) {
                    for sample in dest.iter_mut() {
                        *sample = sample.tanh();
                    }
                }
            }
        }

        self.export_spectrum(process);

        if is_playing {
            self.playback_position_samples
                .fetch_add(frame_count as i64, Ordering::AcqRel);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Bin absolute sample values into 32 bars for input and output and
    /// publish them through the lock-free spectrum hand-off.
    fn export_spectrum(&mut self, process: &AudioProcessContext) {
        let frame_count = process.frame_count();
        let samples_per_bar = frame_count / SPECTRUM_BARS;

        for bar in 0..SPECTRUM_BARS {
            let mut sum = 0.0f32;
            let mut count = 0usize;
            if process.audio_in_bus_count() > 0 && samples_per_bar > 0 {
                let start = bar * samples_per_bar;
                let end = ((bar + 1) * samples_per_bar).min(frame_count);
                for channel in 0..process.input_channel_count(0) {
                    if let Some(samples) = process.input_f32(0, channel) {
                        for sample in &samples[start..end] {
                            sum += sample.abs();
                            count += 1;
                        }
                    }
                }
            }
            self.rt_input_spectrum[bar] = if count > 0 { sum / count as f32 } else { 0.0 };
        }

        for bar in 0..SPECTRUM_BARS {
            let mut sum = 0.0f32;
            let mut count = 0usize;
            if process.audio_out_bus_count() > 0 && samples_per_bar > 0 {
                let start = bar * samples_per_bar;
                let end = ((bar + 1) * samples_per_bar).min(frame_count);
                for channel in 0..process.output_channel_count(0) {
                    if let Some(samples) = process.output_f32(0, channel) {
                        for sample in &samples[start..end] {
                            sum += sample.abs();
                            count += 1;
                        }
                    }
                }
            }
            self.rt_output_spectrum[bar] = if count > 0 { sum / count as f32 } else { 0.0 };
        }

        self.spectrum
            .publish(&self.rt_input_spectrum, &self.rt_output_spectrum);
    }

    pub fn input_spectrum(&self, dest: &mut [f32]) {
        self.spectrum.read(true, dest);
    }

    pub fn output_spectrum(&self, dest: &mut [f32]) {
        self.spectrum.read(false, dest);
    }
}

fn bundle_extension(format_name: &str) -> &'static str {
    match format_name {
        "VST3" => "vst3",
        "CLAP" => "clap",
        "AU" => "appex",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockPluginFormat, MOCK_FORMAT_NAME};

    fn engine_with_mock() -> (SequencerEngine, Arc<MockPluginFormat>) {
        let format = Arc::new(MockPluginFormat::new());
        let mut registry = PluginFormatRegistry::new();
        registry.register(format.clone());
        let engine = SequencerEngine::new(48000, 256, 4096, Arc::new(registry));
        (engine, format)
    }

    fn device_context(engine: &SequencerEngine) -> AudioProcessContext {
        let mut ctx = AudioProcessContext::new(engine.master().clone(), 4096);
        ctx.configure_main_bus(2, 2, 256);
        ctx
    }

    #[test]
    fn test_group_allocation_lowest_free_first() {
        let (mut engine, _format) = engine_with_mock();
        let (a, _) = engine.add_simple_track(MOCK_FORMAT_NAME, "a").unwrap();
        let (b, _) = engine.add_simple_track(MOCK_FORMAT_NAME, "b").unwrap();
        assert_eq!(engine.group_for_instance(a), Some(0));
        assert_eq!(engine.group_for_instance(b), Some(1));
        assert_eq!(engine.instance_for_group(1), Some(b));

        engine.remove_plugin_instance(a);
        let (c, _) = engine.add_simple_track(MOCK_FORMAT_NAME, "c").unwrap();
        // Freed group 0 is reused.
        assert_eq!(engine.group_for_instance(c), Some(0));
    }

    #[test]
    fn test_group_exhaustion_yields_no_group() {
        let (mut engine, _format) = engine_with_mock();
        let mut last = 0;
        for i in 0..17 {
            let (id, _) = engine
                .add_simple_track(MOCK_FORMAT_NAME, &format!("p{i}"))
                .unwrap();
            last = id;
        }
        assert_eq!(engine.group_for_instance(last), None);
    }

    #[test]
    fn test_transport_position_accumulates_only_while_playing() {
        let (mut engine, _format) = engine_with_mock();
        engine.add_simple_track(MOCK_FORMAT_NAME, "x").unwrap();
        let mut ctx = device_context(&engine);

        engine.start_playback();
        for _ in 0..4 {
            engine.process_audio(&mut ctx).unwrap();
        }
        assert_eq!(engine.playback_position(), 1024);

        engine.pause_playback();
        engine.process_audio(&mut ctx).unwrap();
        assert_eq!(engine.playback_position(), 1024);

        engine.resume_playback();
        engine.process_audio(&mut ctx).unwrap();
        assert_eq!(engine.playback_position(), 1280);

        engine.stop_playback();
        assert_eq!(engine.playback_position(), 0);
    }

    #[test]
    fn test_mixing_applies_soft_clip() {
        let (mut engine, format) = engine_with_mock();
        engine.add_simple_track(MOCK_FORMAT_NAME, "loud").unwrap();
        *format.shared_for("loud").output_level.lock().unwrap() = 4.0;
        let mut ctx = device_context(&engine);
        engine.process_audio(&mut ctx).unwrap();
        let sample = ctx.output_f32(0, 0).unwrap()[0];
        assert!((sample - 4.0f32.tanh()).abs() < 1e-6);
        assert!(sample < 1.0);
    }

    #[test]
    fn test_nrpn_output_reflected_into_parameter_updates() {
        let (mut engine, format) = engine_with_mock();
        let (id, _) = engine.add_simple_track(MOCK_FORMAT_NAME, "emitter").unwrap();
        format
            .shared_for("emitter")
            .queue_output_event(Ump::midi2_nrpn(0, 0, 3, 12, 0x8000_0000));
        let mut ctx = device_context(&engine);
        engine.process_audio(&mut ctx).unwrap();

        let updates = engine.get_parameter_updates(id);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].parameter_index, 396);
        assert!((updates[0].value - 0.5).abs() < 2e-10);
        // Drained: a second read returns nothing.
        assert!(engine.get_parameter_updates(id).is_empty());
    }

    #[test]
    fn test_plugin_output_handler_sees_rewritten_group() {
        let (mut engine, format) = engine_with_mock();
        let (_a, _) = engine.add_simple_track(MOCK_FORMAT_NAME, "first").unwrap();
        let (b, _) = engine.add_simple_track(MOCK_FORMAT_NAME, "second").unwrap();
        format
            .shared_for("second")
            .queue_output_event(Ump::midi2_note_on(0, 0, 60, 0, 100, 0));

        let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        engine.set_plugin_output_handler(
            b,
            Some(Box::new(move |bytes| {
                captured
                    .lock()
                    .unwrap()
                    .extend(iter_ump_bytes(bytes).map(|u| u.group()));
            })),
        );

        let mut ctx = device_context(&engine);
        engine.process_audio(&mut ctx).unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[1]);
    }

    #[test]
    fn test_enqueue_ump_rewrites_group_for_instance() {
        let (mut engine, format) = engine_with_mock();
        engine.add_simple_track(MOCK_FORMAT_NAME, "one").unwrap();
        let (two, _) = engine.add_simple_track(MOCK_FORMAT_NAME, "two").unwrap();

        let message = Ump::midi2_note_on(0, 0, 60, 0, 0xFFFF, 0);
        let mut bytes = [0u8; 8];
        ump::write_ump(&mut bytes, 0, &message);
        engine.enqueue_ump(two, &mut bytes, 0);

        let mut ctx = device_context(&engine);
        engine.process_audio(&mut ctx).unwrap();
        assert_eq!(format.shared_for("two").received_groups(), vec![1]);
        assert!(format.shared_for("one").received_groups().is_empty());
    }

    #[test]
    fn test_parameter_listener_and_metadata_refresh() {
        let (mut engine, format) = engine_with_mock();
        let (id, _) = engine.add_simple_track(MOCK_FORMAT_NAME, "p").unwrap();
        let hub = format.shared_for("p").hub.clone();

        hub.notify_value(2, 0.75);
        let updates = engine.get_parameter_updates(id);
        assert_eq!(
            updates,
            vec![ParameterUpdate {
                parameter_index: 2,
                value: 0.75
            }]
        );

        assert!(!engine.consume_parameter_metadata_refresh(id));
        hub.notify_metadata_changed();
        assert!(engine.consume_parameter_metadata_refresh(id));
        assert!(!engine.consume_parameter_metadata_refresh(id));
    }

    #[test]
    fn test_spectrum_published_after_block() {
        let (mut engine, format) = engine_with_mock();
        engine.add_simple_track(MOCK_FORMAT_NAME, "dc").unwrap();
        *format.shared_for("dc").output_level.lock().unwrap() = 0.5;
        let mut ctx = device_context(&engine);
        engine.process_audio(&mut ctx).unwrap();

        let reader = engine.spectrum_reader();
        let mut bars = [0.0f32; SPECTRUM_BARS];
        reader.output_spectrum(&mut bars);
        let expected = 0.5f32.tanh();
        for bar in bars {
            assert!((bar - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn test_remove_plugin_removes_empty_track() {
        let (mut engine, _format) = engine_with_mock();
        let (id, _) = engine.add_simple_track(MOCK_FORMAT_NAME, "gone").unwrap();
        assert_eq!(engine.track_count(), 1);
        assert!(engine.remove_plugin_instance(id));
        assert_eq!(engine.track_count(), 0);
        assert!(!engine.remove_plugin_instance(id));
    }
}
