//! One CLAP plugin instance behind the uniform host contract.

use std::collections::HashMap;
use std::ffi::{c_void, CStr, CString};
use std::pin::Pin;
use std::ptr::{null, null_mut};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap_sys::audio_buffer::clap_audio_buffer;
use clap_sys::events::{
    clap_event_transport, CLAP_EVENT_NOTE_CHOKE, CLAP_EVENT_NOTE_END, CLAP_EVENT_NOTE_OFF,
    CLAP_EVENT_NOTE_ON, CLAP_EVENT_TRANSPORT, CLAP_TRANSPORT_HAS_BEATS_TIMELINE,
    CLAP_TRANSPORT_HAS_SECONDS_TIMELINE, CLAP_TRANSPORT_HAS_TEMPO,
    CLAP_TRANSPORT_HAS_TIME_SIGNATURE, CLAP_TRANSPORT_IS_PLAYING,
};
use clap_sys::events::clap_event_header;
use clap_sys::ext::audio_ports::{
    clap_audio_port_info, clap_plugin_audio_ports, CLAP_AUDIO_PORT_IS_MAIN,
    CLAP_AUDIO_PORT_PREFERS_64BITS, CLAP_AUDIO_PORT_REQUIRES_COMMON_SAMPLE_SIZE,
    CLAP_AUDIO_PORT_SUPPORTS_64BITS, CLAP_EXT_AUDIO_PORTS,
};
use clap_sys::ext::note_ports::{clap_plugin_note_ports, CLAP_EXT_NOTE_PORTS};
use clap_sys::ext::params::{
    clap_param_info, clap_plugin_params, CLAP_EXT_PARAMS, CLAP_PARAM_IS_AUTOMATABLE,
    CLAP_PARAM_IS_AUTOMATABLE_PER_CHANNEL, CLAP_PARAM_IS_AUTOMATABLE_PER_KEY,
    CLAP_PARAM_IS_AUTOMATABLE_PER_NOTE_ID, CLAP_PARAM_IS_HIDDEN, CLAP_PARAM_IS_READONLY,
    CLAP_PARAM_IS_STEPPED,
};
use clap_sys::ext::state::{clap_plugin_state, CLAP_EXT_STATE};
use clap_sys::fixedpoint::{CLAP_BEATTIME_FACTOR, CLAP_SECTIME_FACTOR};
use clap_sys::plugin::clap_plugin;
use clap_sys::process::{clap_process, CLAP_PROCESS_ERROR};
use clap_sys::stream::{clap_istream, clap_ostream};

use crate::bus::{
    AudioBusConfiguration, AudioBusDefinition, AudioBusesInfo, BusRole, ChannelLayout,
};
use crate::catalog::PluginCatalogEntry;
use crate::context::{AudioContentType, AudioProcessContext};
use crate::error::HostError;
use crate::formats::clap::events::{
    param_value_event, ClapEvent, ClapEventTranslator, EventQueue,
};
use crate::formats::clap::host::ClapHostShell;
use crate::formats::clap::{load_bundle, ClapBundle};
use crate::plugin::params::{
    ParameterEventHub, ParameterFlags, PerNoteControllerContext, PluginParameter,
};
use crate::plugin::{ConfigurationRequest, PluginInstance, UiThreadRequirement};
use crate::ump::{dispatch_ump_bytes, Ump};

#[derive(Clone)]
struct ClapParamInfo {
    id: u32,
    cookie: *mut c_void,
    name: String,
    module: String,
    min_value: f64,
    max_value: f64,
    default_value: f64,
    flags: u32,
}

impl ClapParamInfo {
    fn plain_from_normalized(&self, normalized: f64) -> f64 {
        self.min_value + normalized.clamp(0.0, 1.0) * (self.max_value - self.min_value)
    }

    fn normalized_from_plain(&self, plain: f64) -> f64 {
        if (self.max_value - self.min_value).abs() < f64::EPSILON {
            0.0
        } else {
            ((plain - self.min_value) / (self.max_value - self.min_value)).clamp(0.0, 1.0)
        }
    }
}

pub struct ClapPluginInstance {
    entry: PluginCatalogEntry,
    _bundle: Arc<ClapBundle>,
    shell: Pin<Box<ClapHostShell>>,
    plugin: *const clap_plugin,
    ext_params: *const clap_plugin_params,
    ext_state: *const clap_plugin_state,
    ext_audio_ports: *const clap_plugin_audio_ports,
    ext_note_ports: *const clap_plugin_note_ports,
    buses: AudioBusesInfo,
    params: Vec<ClapParamInfo>,
    param_index_by_id: HashMap<u32, u32>,
    hub: Arc<ParameterEventHub>,
    input_events: Pin<Box<EventQueue>>,
    output_events: Pin<Box<EventQueue>>,
    clap_inputs: Vec<clap_audio_buffer>,
    clap_outputs: Vec<clap_audio_buffer>,
    input_ptrs: Vec<Vec<*mut f32>>,
    output_ptrs: Vec<Vec<*mut f32>>,
    input_ptrs64: Vec<Vec<*mut f64>>,
    output_ptrs64: Vec<Vec<*mut f64>>,
    fallback_input: Vec<f32>,
    fallback_outputs: Vec<Vec<f32>>,
    fallback_input64: Vec<f64>,
    fallback_outputs64: Vec<Vec<f64>>,
    use_f64: bool,
    activated: bool,
    processing: bool,
    configuration: Option<ConfigurationRequest>,
    steady_time: i64,
}

// The raw plugin pointers are only touched per the CLAP threading contract:
// lifecycle on the main thread, `process` on the audio thread, never both at
// once (the engine serializes access).
unsafe impl Send for ClapPluginInstance {}

impl ClapPluginInstance {
    pub fn create(entry: &PluginCatalogEntry) -> Result<Self, HostError> {
        let bundle = load_bundle(&entry.bundle_path)?;
        let factory = bundle.plugin_factory().ok_or_else(|| {
            HostError::FailedToInstantiate(format!(
                "{}: no plugin factory",
                entry.bundle_path.display()
            ))
        })?;

        let shell = ClapHostShell::new(&entry.display_name);
        let plugin_id = CString::new(entry.plugin_id.as_str())
            .map_err(|_| HostError::FailedToInstantiate("plugin id not encodable".to_string()))?;

        let plugin = unsafe {
            let create = (*factory).create_plugin.ok_or_else(|| {
                HostError::FailedToInstantiate("factory.create_plugin missing".to_string())
            })?;
            create(factory, shell.as_clap_host(), plugin_id.as_ptr())
        };
        if plugin.is_null() {
            return Err(HostError::FailedToInstantiate(format!(
                "factory refused to create {}",
                entry.plugin_id
            )));
        }

        let initialized = unsafe {
            match (*plugin).init {
                Some(init) => init(plugin),
                None => false,
            }
        };
        if !initialized {
            unsafe {
                if let Some(destroy) = (*plugin).destroy {
                    destroy(plugin);
                }
            }
            return Err(HostError::FailedToInstantiate(format!(
                "{} failed to init",
                entry.plugin_id
            )));
        }
        shell.set_main_thread_target(plugin);

        let mut instance = Self {
            entry: entry.clone(),
            _bundle: bundle,
            shell,
            plugin,
            ext_params: null(),
            ext_state: null(),
            ext_audio_ports: null(),
            ext_note_ports: null(),
            buses: AudioBusesInfo::default(),
            params: Vec::new(),
            param_index_by_id: HashMap::new(),
            hub: Arc::new(ParameterEventHub::new()),
            input_events: EventQueue::new(),
            output_events: EventQueue::new(),
            clap_inputs: Vec::new(),
            clap_outputs: Vec::new(),
            input_ptrs: Vec::new(),
            output_ptrs: Vec::new(),
            input_ptrs64: Vec::new(),
            output_ptrs64: Vec::new(),
            fallback_input: Vec::new(),
            fallback_outputs: Vec::new(),
            fallback_input64: Vec::new(),
            fallback_outputs64: Vec::new(),
            use_f64: false,
            activated: false,
            processing: false,
            configuration: None,
            steady_time: 0,
        };
        instance.query_extensions();
        instance.inspect_buses(None, None);
        instance.rebuild_param_cache();
        Ok(instance)
    }

    fn query_extensions(&mut self) {
        unsafe {
            let Some(get_extension) = (*self.plugin).get_extension else {
                return;
            };
            self.ext_params =
                get_extension(self.plugin, CLAP_EXT_PARAMS.as_ptr()) as *const clap_plugin_params;
            self.ext_state =
                get_extension(self.plugin, CLAP_EXT_STATE.as_ptr()) as *const clap_plugin_state;
            self.ext_audio_ports = get_extension(self.plugin, CLAP_EXT_AUDIO_PORTS.as_ptr())
                as *const clap_plugin_audio_ports;
            self.ext_note_ports = get_extension(self.plugin, CLAP_EXT_NOTE_PORTS.as_ptr())
                as *const clap_plugin_note_ports;
        }
    }

    /// Enumerate audio and note ports into the generic bus model. The port
    /// flagged main (or port 0) becomes the main bus.
    fn inspect_buses(&mut self, requested_in: Option<u32>, requested_out: Option<u32>) {
        let mut info = AudioBusesInfo::default();
        unsafe {
            if !self.ext_audio_ports.is_null() {
                let ports = &*self.ext_audio_ports;
                for (is_input, buses) in [
                    (true, &mut info.input_buses),
                    (false, &mut info.output_buses),
                ] {
                    let count = ports.count.map(|f| f(self.plugin, is_input)).unwrap_or(0);
                    for index in 0..count {
                        let mut port: clap_audio_port_info = std::mem::zeroed();
                        let valid = ports
                            .get
                            .map(|f| f(self.plugin, index, is_input, &mut port))
                            .unwrap_or(false);
                        if !valid {
                            continue;
                        }
                        let role = if port.flags & CLAP_AUDIO_PORT_IS_MAIN != 0 || index == 0 {
                            BusRole::Main
                        } else {
                            BusRole::Aux
                        };
                        let name = CStr::from_ptr(port.name.as_ptr())
                            .to_string_lossy()
                            .into_owned();
                        let layout = ChannelLayout::new(port.channel_count);
                        buses.push(AudioBusConfiguration::new(
                            AudioBusDefinition::new(name, role, vec![layout]),
                            layout,
                        ));
                    }
                }
            }
            if !self.ext_note_ports.is_null() {
                let ports = &*self.ext_note_ports;
                info.has_event_input = ports.count.map(|f| f(self.plugin, true)).unwrap_or(0) > 0;
                info.has_event_output =
                    ports.count.map(|f| f(self.plugin, false)).unwrap_or(0) > 0;
            }
        }

        if let Some(channels) = requested_in {
            if let Some(main) = info.input_buses.iter().find(|b| b.is_main()) {
                if main.channels() != channels {
                    log::warn!(
                        "{}: requested {channels} input channels, plugin provides {}",
                        self.entry.display_name,
                        main.channels()
                    );
                }
            }
        }
        if let Some(channels) = requested_out {
            if let Some(main) = info.output_buses.iter().find(|b| b.is_main()) {
                if main.channels() != channels {
                    log::warn!(
                        "{}: requested {channels} output channels, plugin provides {}",
                        self.entry.display_name,
                        main.channels()
                    );
                }
            }
        }
        self.buses = info;
    }

    /// Decide the processing precision from the port flags: a port that
    /// requires a common sample size and prefers 64-bit forces a promotion;
    /// 64-bit support alone only applies when the host asked for it.
    fn discover_precision(&self, requested: AudioContentType) -> bool {
        let mut prefers = false;
        let mut requires = false;
        unsafe {
            if self.ext_audio_ports.is_null() {
                return false;
            }
            let ports = &*self.ext_audio_ports;
            for is_input in [true, false] {
                let count = ports.count.map(|f| f(self.plugin, is_input)).unwrap_or(0);
                for index in 0..count {
                    let mut port: clap_audio_port_info = std::mem::zeroed();
                    let valid = ports
                        .get
                        .map(|f| f(self.plugin, index, is_input, &mut port))
                        .unwrap_or(false);
                    if !valid {
                        continue;
                    }
                    if port.flags & CLAP_AUDIO_PORT_REQUIRES_COMMON_SAMPLE_SIZE != 0
                        && port.flags & CLAP_AUDIO_PORT_SUPPORTS_64BITS != 0
                    {
                        prefers = true;
                        if port.flags & CLAP_AUDIO_PORT_PREFERS_64BITS != 0 {
                            requires = true;
                        }
                    }
                }
            }
        }
        if requires && requested == AudioContentType::Float32 {
            log::warn!(
                "{}: plugin requires 64-bit processing, overriding host request",
                self.entry.display_name
            );
            return true;
        }
        prefers && requested == AudioContentType::Float64
    }

    fn rebuild_param_cache(&mut self) {
        self.params.clear();
        self.param_index_by_id.clear();
        unsafe {
            if self.ext_params.is_null() {
                return;
            }
            let params = &*self.ext_params;
            let count = params.count.map(|f| f(self.plugin)).unwrap_or(0);
            for index in 0..count {
                let mut info: clap_param_info = std::mem::zeroed();
                let valid = params
                    .get_info
                    .map(|f| f(self.plugin, index, &mut info))
                    .unwrap_or(false);
                if !valid {
                    continue;
                }
                let cached = ClapParamInfo {
                    id: info.id,
                    cookie: info.cookie,
                    name: CStr::from_ptr(info.name.as_ptr()).to_string_lossy().into_owned(),
                    module: CStr::from_ptr(info.module.as_ptr())
                        .to_string_lossy()
                        .into_owned(),
                    min_value: info.min_value,
                    max_value: info.max_value,
                    default_value: info.default_value,
                    flags: info.flags,
                };
                self.param_index_by_id
                    .insert(cached.id, self.params.len() as u32);
                self.params.push(cached);
            }
        }
    }

    fn param_info(&self, index: u32) -> Result<&ClapParamInfo, HostError> {
        self.params
            .get(index as usize)
            .ok_or_else(|| HostError::InvalidParameterOperation(format!("index {index}")))
    }

    /// The configuration applied by the last successful `configure` call.
    pub fn configuration(&self) -> Option<&ConfigurationRequest> {
        self.configuration.as_ref()
    }

    /// Honour a pending `params_flush` request while no block is in flight.
    fn flush_params_if_requested(&mut self) {
        if !self.shell.requests.flush.swap(false, Ordering::SeqCst) {
            return;
        }
        if self.processing {
            // The next process call delivers the queued events anyway.
            return;
        }
        unsafe {
            if self.ext_params.is_null() {
                return;
            }
            if let Some(flush) = (*self.ext_params).flush {
                flush(
                    self.plugin,
                    self.input_events.as_input(),
                    self.output_events.as_output(),
                );
            }
        }
        self.input_events.clear();
        self.drain_output_notifications(None);
    }

    fn fill_transport(&self, context: &AudioProcessContext) -> clap_event_transport {
        let master = context.master();
        let sample_rate = master.sample_rate().max(1) as f64;
        let seconds = master.playback_position_samples() as f64 / sample_rate;
        let tempo = master.tempo_bpm();
        let beats = seconds * tempo / 60.0;
        let (numerator, denominator) = master.time_signature();
        let mut flags = CLAP_TRANSPORT_HAS_TEMPO
            | CLAP_TRANSPORT_HAS_BEATS_TIMELINE
            | CLAP_TRANSPORT_HAS_SECONDS_TIMELINE
            | CLAP_TRANSPORT_HAS_TIME_SIGNATURE;
        if master.is_playing() {
            flags |= CLAP_TRANSPORT_IS_PLAYING;
        }
        clap_event_transport {
            header: clap_event_header {
                size: std::mem::size_of::<clap_event_transport>() as u32,
                time: 0,
                space_id: clap_sys::events::CLAP_CORE_EVENT_SPACE_ID,
                type_: CLAP_EVENT_TRANSPORT,
                flags: 0,
            },
            flags,
            song_pos_beats: (beats * CLAP_BEATTIME_FACTOR as f64).round() as i64,
            song_pos_seconds: (seconds * CLAP_SECTIME_FACTOR as f64).round() as i64,
            tempo,
            tempo_inc: 0.0,
            loop_start_beats: 0,
            loop_end_beats: 0,
            loop_start_seconds: 0,
            loop_end_seconds: 0,
            bar_start: 0,
            bar_number: 0,
            tsig_num: numerator as u16,
            tsig_denom: denominator as u16,
        }
    }

    /// Update the per-port channel pointer tables from the context, with
    /// zero-filled fallbacks for channels the host did not supply. When the
    /// instance was promoted to 64-bit and the context carries 64-bit
    /// buffers, the double-precision pointer set is presented instead.
    fn refresh_audio_pointers(&mut self, context: &mut AudioProcessContext) {
        let frames = context.frame_count();
        let double = self.use_f64 && context.content_type() == AudioContentType::Float64;
        if double {
            if self.fallback_input64.len() < frames {
                self.fallback_input64.resize(frames, 0.0);
            }
            self.fallback_input64[..frames].fill(0.0);
        } else {
            if self.fallback_input.len() < frames {
                self.fallback_input.resize(frames, 0.0);
            }
            self.fallback_input[..frames].fill(0.0);
        }

        for (port_index, bus) in self.buses.input_buses.iter().enumerate() {
            let channel_count = bus.channels();
            let buffer = if double {
                let ptrs = &mut self.input_ptrs64[port_index];
                ptrs.clear();
                for channel in 0..channel_count as usize {
                    let supplied = if port_index < context.audio_in_bus_count() {
                        context.input_channel_ptr_f64(port_index, channel)
                    } else {
                        None
                    };
                    ptrs.push(supplied.unwrap_or(self.fallback_input64.as_mut_ptr()));
                }
                clap_audio_buffer {
                    data32: null_mut(),
                    data64: ptrs.as_ptr() as *const *const f64,
                    channel_count,
                    latency: 0,
                    constant_mask: 0,
                }
            } else {
                let ptrs = &mut self.input_ptrs[port_index];
                ptrs.clear();
                for channel in 0..channel_count as usize {
                    let supplied = if port_index < context.audio_in_bus_count() {
                        context.input_channel_ptr_f32(port_index, channel)
                    } else {
                        None
                    };
                    ptrs.push(supplied.unwrap_or(self.fallback_input.as_mut_ptr()));
                }
                clap_audio_buffer {
                    data32: ptrs.as_ptr() as *const *const f32,
                    data64: null_mut(),
                    channel_count,
                    latency: 0,
                    constant_mask: 0,
                }
            };
            self.clap_inputs[port_index] = buffer;
        }

        let mut fallback_index = 0;
        for (port_index, bus) in self.buses.output_buses.iter().enumerate() {
            let channel_count = bus.channels();
            let buffer = if double {
                let ptrs = &mut self.output_ptrs64[port_index];
                ptrs.clear();
                for channel in 0..channel_count as usize {
                    let supplied = if port_index < context.audio_out_bus_count() {
                        context.output_channel_ptr_f64(port_index, channel)
                    } else {
                        None
                    };
                    let ptr = match supplied {
                        Some(ptr) => ptr,
                        None => {
                            let fallback = &mut self.fallback_outputs64[fallback_index];
                            fallback_index += 1;
                            if fallback.len() < frames {
                                fallback.resize(frames, 0.0);
                            }
                            fallback.as_mut_ptr()
                        }
                    };
                    ptrs.push(ptr);
                }
                clap_audio_buffer {
                    data32: null_mut(),
                    data64: ptrs.as_ptr() as *const *const f64,
                    channel_count,
                    latency: 0,
                    constant_mask: 0,
                }
            } else {
                let ptrs = &mut self.output_ptrs[port_index];
                ptrs.clear();
                for channel in 0..channel_count as usize {
                    let supplied = if port_index < context.audio_out_bus_count() {
                        context.output_channel_ptr_f32(port_index, channel)
                    } else {
                        None
                    };
                    let ptr = match supplied {
                        Some(ptr) => ptr,
                        None => {
                            let fallback = &mut self.fallback_outputs[fallback_index];
                            fallback_index += 1;
                            if fallback.len() < frames {
                                fallback.resize(frames, 0.0);
                            }
                            fallback.as_mut_ptr()
                        }
                    };
                    ptrs.push(ptr);
                }
                clap_audio_buffer {
                    data32: ptrs.as_ptr() as *const *const f32,
                    data64: null_mut(),
                    channel_count,
                    latency: 0,
                    constant_mask: 0,
                }
            };
            self.clap_outputs[port_index] = buffer;
        }
    }

    /// Walk the plugin's output events, notify listeners and reflect them as
    /// UMP into the context's output sequence when one is given.
    fn drain_output_notifications(&self, mut context: Option<&mut AudioProcessContext>) {
        for event in self.output_events.drain() {
            match event {
                ClapEvent::Note(note) => {
                    let velocity = (note.velocity.clamp(0.0, 1.0) * u16::MAX as f64) as u16;
                    let channel = note.channel.max(0) as u8;
                    let key = note.key.max(0) as u8;
                    let ump = match note.header.type_ {
                        CLAP_EVENT_NOTE_ON => Ump::midi2_note_on(0, channel, key, 0, velocity, 0),
                        CLAP_EVENT_NOTE_OFF | CLAP_EVENT_NOTE_END | CLAP_EVENT_NOTE_CHOKE => {
                            Ump::midi2_note_off(0, channel, key, 0, velocity, 0)
                        }
                        _ => continue,
                    };
                    if let Some(context) = context.as_deref_mut() {
                        let _ = context.event_out_mut().append(&ump);
                    }
                }
                ClapEvent::ParamValue(param) => {
                    let Some(index) = self.param_index_by_id.get(&param.param_id).copied() else {
                        continue;
                    };
                    let info = &self.params[index as usize];
                    self.hub.notify_value(index, param.value);
                    // Parameter changes reflect as assignable-controller
                    // NRPNs: bank = index >> 7, index = low 7 bits, value
                    // scaled to 32-bit unsigned.
                    if index < 1 << 14 {
                        let normalized = info.normalized_from_plain(param.value);
                        let data = (normalized * u32::MAX as f64) as u32;
                        let bank = ((index >> 7) & 0x7F) as u8;
                        let low = (index & 0x7F) as u8;
                        if let Some(context) = context.as_deref_mut() {
                            let _ = context
                                .event_out_mut()
                                .append(&Ump::midi2_nrpn(0, 0, bank, low, data));
                        }
                    }
                }
                ClapEvent::NoteExpression(expression) => {
                    let index = expression.expression_id as u32;
                    let context_info = PerNoteControllerContext {
                        group: 0,
                        channel: expression.channel.max(0) as u8,
                        note: expression.key.max(0) as u8,
                    };
                    let value = expression.value.clamp(0.0, 1.0);
                    self.hub.notify_per_note(context_info, index, value);
                    let data = (value * u32::MAX as f64) as u32;
                    if let Some(context) = context.as_deref_mut() {
                        let _ = context.event_out_mut().append(&Ump::midi2_per_note_acc(
                            0,
                            context_info.channel,
                            context_info.note,
                            (index & 0x7F) as u8,
                            data,
                        ));
                    }
                }
                ClapEvent::Midi(_) | ClapEvent::ParamMod(_) | ClapEvent::Unknown(_) => {}
            }
        }
    }

    fn deactivate(&mut self) {
        if self.activated {
            unsafe {
                if let Some(deactivate) = (*self.plugin).deactivate {
                    deactivate(self.plugin);
                }
            }
            self.activated = false;
        }
    }
}

impl PluginInstance for ClapPluginInstance {
    fn catalog_entry(&self) -> &PluginCatalogEntry {
        &self.entry
    }

    fn requires_ui_thread_on(&self) -> UiThreadRequirement {
        UiThreadRequirement::None
    }

    fn configure(&mut self, request: &ConfigurationRequest) -> Result<(), HostError> {
        if self.processing {
            return Err(HostError::FailedToConfigure(
                "cannot configure while processing".to_string(),
            ));
        }
        self.deactivate();

        self.inspect_buses(request.main_input_channels, request.main_output_channels);
        self.use_f64 = self.discover_precision(request.content_type);

        let input_ports = self.buses.input_buses.len();
        let output_ports = self.buses.output_buses.len();
        self.input_ptrs = vec![Vec::new(); input_ports];
        self.output_ptrs = vec![Vec::new(); output_ports];
        self.input_ptrs64 = vec![Vec::new(); input_ports];
        self.output_ptrs64 = vec![Vec::new(); output_ports];
        self.clap_inputs = (0..input_ports)
            .map(|_| unsafe { std::mem::zeroed() })
            .collect();
        self.clap_outputs = (0..output_ports)
            .map(|_| unsafe { std::mem::zeroed() })
            .collect();
        let fallback_out_channels: usize = self
            .buses
            .output_buses
            .iter()
            .map(|b| b.channels() as usize)
            .sum();
        self.fallback_input = vec![0.0; request.buffer_size_frames];
        self.fallback_outputs =
            vec![vec![0.0; request.buffer_size_frames]; fallback_out_channels];
        self.fallback_input64 = vec![0.0; request.buffer_size_frames];
        self.fallback_outputs64 =
            vec![vec![0.0; request.buffer_size_frames]; fallback_out_channels];

        let activated = unsafe {
            match (*self.plugin).activate {
                Some(activate) => activate(
                    self.plugin,
                    request.sample_rate as f64,
                    1,
                    request.buffer_size_frames as u32,
                ),
                None => false,
            }
        };
        if !activated {
            return Err(HostError::FailedToConfigure(format!(
                "{} refused activation",
                self.entry.plugin_id
            )));
        }
        self.activated = true;
        self.configuration = Some(request.clone());
        self.steady_time = 0;
        Ok(())
    }

    fn start_processing(&mut self) -> Result<(), HostError> {
        if !self.activated {
            return Err(HostError::FailedToStartProcessing(
                "start_processing before configure".to_string(),
            ));
        }
        let started = unsafe {
            match (*self.plugin).start_processing {
                Some(start) => start(self.plugin),
                None => true,
            }
        };
        if !started {
            return Err(HostError::FailedToStartProcessing(
                self.entry.plugin_id.clone(),
            ));
        }
        self.processing = true;
        Ok(())
    }

    fn stop_processing(&mut self) -> Result<(), HostError> {
        if self.processing {
            unsafe {
                if let Some(stop) = (*self.plugin).stop_processing {
                    stop(self.plugin);
                }
            }
            self.processing = false;
        }
        self.flush_params_if_requested();
        Ok(())
    }

    fn process(&mut self, context: &mut AudioProcessContext) -> Result<(), HostError> {
        if !self.processing {
            return Err(HostError::FailedToProcess("not processing".to_string()));
        }
        if self
            .shell
            .requests
            .rescan_params
            .swap(false, Ordering::SeqCst)
        {
            self.hub.notify_metadata_changed();
        }
        // A pending flush folds into this block's event delivery.
        self.shell.requests.flush.store(false, Ordering::SeqCst);

        self.refresh_audio_pointers(context);

        {
            let mut translator = ClapEventTranslator {
                queue: &self.input_events,
            };
            dispatch_ump_bytes(context.event_in().bytes(), &mut translator);
        }

        let transport = self.fill_transport(context);
        let process_data = clap_process {
            steady_time: self.steady_time,
            frames_count: context.frame_count() as u32,
            transport: &transport,
            audio_inputs: if self.clap_inputs.is_empty() {
                null()
            } else {
                self.clap_inputs.as_ptr()
            },
            audio_outputs: if self.clap_outputs.is_empty() {
                null_mut()
            } else {
                self.clap_outputs.as_mut_ptr()
            },
            audio_inputs_count: self.clap_inputs.len() as u32,
            audio_outputs_count: self.clap_outputs.len() as u32,
            in_events: self.input_events.as_input(),
            out_events: self.output_events.as_output(),
        };

        let status = unsafe {
            match (*self.plugin).process {
                Some(process) => process(self.plugin, &process_data),
                None => CLAP_PROCESS_ERROR,
            }
        };
        self.input_events.clear();

        if status == CLAP_PROCESS_ERROR {
            self.output_events.clear();
            return Err(HostError::FailedToProcess(self.entry.plugin_id.clone()));
        }

        self.drain_output_notifications(Some(context));
        self.steady_time += context.frame_count() as i64;
        Ok(())
    }

    fn parameters(&mut self) -> Result<Vec<PluginParameter>, HostError> {
        self.rebuild_param_cache();
        Ok(self
            .params
            .iter()
            .enumerate()
            .map(|(index, info)| PluginParameter {
                index: index as u32,
                stable_id: info.id,
                name: info.name.clone(),
                path: info.module.clone(),
                default_plain: info.default_value,
                min_plain: info.min_value,
                max_plain: info.max_value,
                flags: ParameterFlags {
                    automatable: info.flags & CLAP_PARAM_IS_AUTOMATABLE != 0,
                    readable: info.flags & CLAP_PARAM_IS_READONLY == 0,
                    hidden: info.flags & CLAP_PARAM_IS_HIDDEN != 0,
                    enumerated: info.flags & CLAP_PARAM_IS_STEPPED != 0,
                },
                enumerations: Vec::new(),
            })
            .collect())
    }

    fn get_parameter(&self, index: u32) -> Result<f64, HostError> {
        let info = self.param_info(index)?;
        unsafe {
            if self.ext_params.is_null() {
                return Err(HostError::NotImplemented);
            }
            let mut value = 0.0f64;
            let valid = (*self.ext_params)
                .get_value
                .map(|f| f(self.plugin, info.id, &mut value))
                .unwrap_or(false);
            if valid {
                Ok(value)
            } else {
                Err(HostError::InvalidParameterOperation(format!(
                    "read of parameter {index} failed"
                )))
            }
        }
    }

    fn set_parameter(
        &mut self,
        index: u32,
        plain_value: f64,
        _timestamp: u64,
    ) -> Result<(), HostError> {
        let info = self.param_info(index)?.clone();
        self.input_events.push(ClapEvent::ParamValue(param_value_event(
            info.id,
            info.cookie,
            -1,
            -1,
            plain_value,
        )));
        self.hub.notify_value(index, plain_value);
        Ok(())
    }

    fn set_per_note_controller(
        &mut self,
        context: PerNoteControllerContext,
        controller_index: u32,
        value: f64,
        _timestamp: u64,
    ) -> Result<(), HostError> {
        let info = self.param_info(controller_index)?.clone();
        let plain = info.plain_from_normalized(value);
        let per_note = info.flags
            & (CLAP_PARAM_IS_AUTOMATABLE_PER_NOTE_ID | CLAP_PARAM_IS_AUTOMATABLE_PER_KEY)
            != 0;
        let per_channel = info.flags & CLAP_PARAM_IS_AUTOMATABLE_PER_CHANNEL != 0;
        let key = if per_note { context.note as i16 } else { -1 };
        let channel = if per_note || per_channel {
            context.channel as i16
        } else {
            -1
        };
        self.input_events.push(ClapEvent::ParamValue(param_value_event(
            info.id,
            info.cookie,
            channel,
            key,
            plain,
        )));
        Ok(())
    }

    fn parameter_events(&self) -> &Arc<ParameterEventHub> {
        &self.hub
    }

    fn save_state(&mut self) -> Result<Vec<u8>, HostError> {
        unsafe {
            if self.ext_state.is_null() {
                return Err(HostError::NotImplemented);
            }
            let Some(save) = (*self.ext_state).save else {
                return Err(HostError::NotImplemented);
            };
            let mut buffer: Vec<u8> = Vec::new();
            let stream = clap_ostream {
                ctx: &mut buffer as *mut Vec<u8> as *mut c_void,
                write: Some(ostream_write),
            };
            if save(self.plugin, &stream) {
                Ok(buffer)
            } else {
                log::error!("{}: state save failed", self.entry.display_name);
                Ok(Vec::new())
            }
        }
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), HostError> {
        unsafe {
            if self.ext_state.is_null() {
                return Err(HostError::NotImplemented);
            }
            let Some(load) = (*self.ext_state).load else {
                return Err(HostError::NotImplemented);
            };
            let mut cursor = StreamCursor { data, position: 0 };
            let stream = clap_istream {
                ctx: &mut cursor as *mut StreamCursor as *mut c_void,
                read: Some(istream_read),
            };
            if load(self.plugin, &stream) {
                Ok(())
            } else {
                log::error!("{}: state load failed", self.entry.display_name);
                Ok(())
            }
        }
    }

    fn audio_buses(&self) -> &AudioBusesInfo {
        &self.buses
    }
}

impl Drop for ClapPluginInstance {
    fn drop(&mut self) {
        self.shell.clear_main_thread_target();
        if self.processing {
            unsafe {
                if let Some(stop) = (*self.plugin).stop_processing {
                    stop(self.plugin);
                }
            }
            self.processing = false;
        }
        self.deactivate();
        unsafe {
            if let Some(destroy) = (*self.plugin).destroy {
                destroy(self.plugin);
            }
        }
    }
}

struct StreamCursor<'a> {
    data: &'a [u8],
    position: usize,
}

unsafe extern "C" fn ostream_write(
    stream: *const clap_ostream,
    buffer: *const c_void,
    size: u64,
) -> i64 {
    if stream.is_null() || (*stream).ctx.is_null() || buffer.is_null() {
        return -1;
    }
    let out = &mut *((*stream).ctx as *mut Vec<u8>);
    let bytes = std::slice::from_raw_parts(buffer as *const u8, size as usize);
    out.extend_from_slice(bytes);
    size as i64
}

unsafe extern "C" fn istream_read(
    stream: *const clap_istream,
    buffer: *mut c_void,
    size: u64,
) -> i64 {
    if stream.is_null() || (*stream).ctx.is_null() || buffer.is_null() {
        return -1;
    }
    let cursor = &mut *((*stream).ctx as *mut StreamCursor);
    let remaining = cursor.data.len() - cursor.position;
    let to_copy = remaining.min(size as usize);
    std::ptr::copy_nonoverlapping(
        cursor.data.as_ptr().add(cursor.position),
        buffer as *mut u8,
        to_copy,
    );
    cursor.position += to_copy;
    to_copy as i64
}
