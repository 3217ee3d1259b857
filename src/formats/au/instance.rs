//! One `AUAudioUnit` instance behind the uniform host contract.
//!
//! Render events are pre-allocated as a linked list and rebuilt per block
//! from the UMP input; audio flows through the unit's render block; output
//! events come back through the MIDI output event block, and parameter
//! changes surface through an observer token on the parameter tree.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use block2::{Block, RcBlock};
use objc2::encode::{Encode, Encoding, RefEncode};
use objc2::rc::Retained;
use objc2::runtime::AnyObject;
use objc2::{class, msg_send};
use objc2_foundation::{NSError, NSString};

use crate::bus::{
    AudioBusConfiguration, AudioBusDefinition, AudioBusesInfo, BusRole, ChannelLayout,
};
use crate::catalog::PluginCatalogEntry;
use crate::context::AudioProcessContext;
use crate::error::HostError;
use crate::formats::au::AuComponentId;
use crate::plugin::params::{
    ParameterEventHub, ParameterFlags, PerNoteControllerContext, PluginParameter,
};
use crate::plugin::{ConfigurationRequest, PluginInstance, UiThreadRequirement};
use crate::ump::{dispatch_ump_bytes, Ump, UmpDispatcher};

// CoreAudio structures crossed at the render boundary. Declared locally
// because the generated framework crates do not cover the AU render ABI.

#[repr(C)]
#[derive(Clone, Copy)]
pub struct AudioComponentDescription {
    pub component_type: u32,
    pub component_sub_type: u32,
    pub component_manufacturer: u32,
    pub component_flags: u32,
    pub component_flags_mask: u32,
}

unsafe impl Encode for AudioComponentDescription {
    const ENCODING: Encoding = Encoding::Struct(
        "AudioComponentDescription",
        &[
            u32::ENCODING,
            u32::ENCODING,
            u32::ENCODING,
            u32::ENCODING,
            u32::ENCODING,
        ],
    );
}

unsafe impl RefEncode for AudioComponentDescription {
    const ENCODING_REF: Encoding = Encoding::Pointer(&Self::ENCODING);
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct AudioTimeStamp {
    pub sample_time: f64,
    pub host_time: u64,
    pub rate_scalar: f64,
    pub word_clock_time: u64,
    pub smpte_time: [u8; 24],
    pub flags: u32,
    pub reserved: u32,
}

const AUDIO_TIMESTAMP_SAMPLE_TIME_VALID: u32 = 1 << 0;

unsafe impl Encode for AudioTimeStamp {
    const ENCODING: Encoding = Encoding::Struct(
        "AudioTimeStamp",
        &[
            f64::ENCODING,
            u64::ENCODING,
            f64::ENCODING,
            u64::ENCODING,
            Encoding::Array(24, &u8::ENCODING),
            u32::ENCODING,
            u32::ENCODING,
        ],
    );
}

unsafe impl RefEncode for AudioTimeStamp {
    const ENCODING_REF: Encoding = Encoding::Pointer(&Self::ENCODING);
}

#[repr(C)]
pub struct AudioBuffer {
    pub number_channels: u32,
    pub data_byte_size: u32,
    pub data: *mut c_void,
}

const MAX_RENDER_CHANNELS: usize = 8;

#[repr(C)]
pub struct AudioBufferList {
    pub number_buffers: u32,
    pub buffers: [AudioBuffer; MAX_RENDER_CHANNELS],
}

unsafe impl Encode for AudioBuffer {
    const ENCODING: Encoding = Encoding::Struct(
        "AudioBuffer",
        &[u32::ENCODING, u32::ENCODING, Encoding::Pointer(&Encoding::Void)],
    );
}

unsafe impl RefEncode for AudioBuffer {
    const ENCODING_REF: Encoding = Encoding::Pointer(&Self::ENCODING);
}

unsafe impl Encode for AudioBufferList {
    const ENCODING: Encoding = Encoding::Struct(
        "AudioBufferList",
        &[
            u32::ENCODING,
            Encoding::Array(MAX_RENDER_CHANNELS as u64, &AudioBuffer::ENCODING),
        ],
    );
}

unsafe impl RefEncode for AudioBufferList {
    const ENCODING_REF: Encoding = Encoding::Pointer(&Self::ENCODING);
}

// AURenderEvent: a linked list of tagged events handed to the render block.
const RENDER_EVENT_MIDI: u8 = 8;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct AuMidiEvent {
    pub next: *const AuMidiEvent,
    pub event_sample_time: i64,
    pub event_type: u8,
    pub reserved: u8,
    pub length: u16,
    pub cable: u8,
    pub data: [u8; 3],
}

unsafe impl Encode for AuMidiEvent {
    const ENCODING: Encoding = Encoding::Struct(
        "AUMIDIEvent",
        &[
            Encoding::Pointer(&Encoding::Void),
            i64::ENCODING,
            u8::ENCODING,
            u8::ENCODING,
            u16::ENCODING,
            u8::ENCODING,
            Encoding::Array(3, &u8::ENCODING),
        ],
    );
}

unsafe impl RefEncode for AuMidiEvent {
    const ENCODING_REF: Encoding = Encoding::Pointer(&Self::ENCODING);
}

type RenderBlockSig = Block<
    dyn Fn(
        NonNull<u32>,
        NonNull<AudioTimeStamp>,
        u32,
        isize,
        NonNull<AudioBufferList>,
        *const AuMidiEvent,
        *mut c_void,
    ) -> i32,
>;

pub struct AuPluginInstance {
    entry: PluginCatalogEntry,
    unit: Retained<AnyObject>,
    render_block: Option<Retained<RenderBlockSig>>,
    buses: AudioBusesInfo,
    hub: Arc<ParameterEventHub>,
    parameters: Vec<AuParamInfo>,
    param_index_by_address: Arc<Mutex<HashMap<u64, u32>>>,
    observer_token: *mut c_void,
    _observer_block: Option<RcBlock<dyn Fn(u64, f32)>>,
    _midi_listener: Option<RcBlock<dyn Fn(i64, u8, isize, NonNull<u8>) -> i32>>,
    /// Output UMPs produced by the MIDI output listener, drained per block.
    output_midi: Arc<Mutex<Vec<Ump>>>,
    /// Pre-allocated render-event nodes, rebuilt each block.
    event_nodes: Vec<AuMidiEvent>,
    sample_time: i64,
    allocated: bool,
    processing: bool,
}

#[derive(Clone)]
struct AuParamInfo {
    address: u64,
    name: String,
    min_value: f32,
    max_value: f32,
    default_value: f32,
}

unsafe impl Send for AuPluginInstance {}

impl AuPluginInstance {
    pub fn create(
        entry: &PluginCatalogEntry,
        component: AuComponentId,
    ) -> Result<Self, HostError> {
        let description = AudioComponentDescription {
            component_type: component.component_type,
            component_sub_type: component.subtype,
            component_manufacturer: component.manufacturer,
            component_flags: 0,
            component_flags_mask: 0,
        };

        let unit: Option<Retained<AnyObject>> = unsafe {
            let allocated: *mut AnyObject = msg_send![class!(AUAudioUnit), alloc];
            let mut error: *mut NSError = std::ptr::null_mut();
            msg_send![
                allocated,
                initWithComponentDescription: description,
                error: &mut error,
            ]
        };
        let unit = unit.ok_or_else(|| {
            HostError::FailedToInstantiate(format!(
                "AUAudioUnit init failed for {}",
                entry.plugin_id
            ))
        })?;

        let mut instance = Self {
            entry: entry.clone(),
            unit,
            render_block: None,
            buses: AudioBusesInfo::default(),
            hub: Arc::new(ParameterEventHub::new()),
            parameters: Vec::new(),
            param_index_by_address: Arc::new(Mutex::new(HashMap::new())),
            observer_token: std::ptr::null_mut(),
            _observer_block: None,
            _midi_listener: None,
            output_midi: Arc::new(Mutex::new(Vec::new())),
            event_nodes: Vec::new(),
            sample_time: 0,
            allocated: false,
            processing: false,
        };
        instance.inspect_buses();
        instance.rebuild_param_cache();
        instance.install_parameter_observer();
        instance.install_midi_output_listener();
        Ok(instance)
    }

    fn inspect_buses(&mut self) {
        let mut info = AudioBusesInfo::default();
        unsafe {
            for (selector_is_input, buses) in
                [(true, &mut info.input_buses), (false, &mut info.output_buses)]
            {
                let bus_array: Option<Retained<AnyObject>> = if selector_is_input {
                    msg_send![&self.unit, inputBusses]
                } else {
                    msg_send![&self.unit, outputBusses]
                };
                let Some(bus_array) = bus_array else {
                    continue;
                };
                let count: usize = msg_send![&bus_array, count];
                for index in 0..count {
                    let bus: Option<Retained<AnyObject>> =
                        msg_send![&bus_array, objectAtIndexedSubscript: index];
                    let Some(bus) = bus else { continue };
                    let format: Option<Retained<AnyObject>> = msg_send![&bus, format];
                    let channels: u32 = match format {
                        Some(format) => msg_send![&format, channelCount],
                        None => 2,
                    };
                    let layout = ChannelLayout::new(channels);
                    let role = if index == 0 { BusRole::Main } else { BusRole::Aux };
                    buses.push(AudioBusConfiguration::new(
                        AudioBusDefinition::new(format!("Bus {index}"), role, vec![layout]),
                        layout,
                    ));
                }
            }
            let midi_out_names: Option<Retained<AnyObject>> =
                msg_send![&self.unit, MIDIOutputNames];
            info.has_event_output = match midi_out_names {
                Some(names) => {
                    let count: usize = msg_send![&names, count];
                    count > 0
                }
                None => false,
            };
        }
        // Every unit takes events through the render-event list.
        info.has_event_input = true;
        self.buses = info;
    }

    fn rebuild_param_cache(&mut self) {
        self.parameters.clear();
        let mut by_address = self.param_index_by_address.lock().unwrap();
        by_address.clear();
        unsafe {
            let tree: Option<Retained<AnyObject>> = msg_send![&self.unit, parameterTree];
            let Some(tree) = tree else { return };
            let all: Option<Retained<AnyObject>> = msg_send![&tree, allParameters];
            let Some(all) = all else { return };
            let count: usize = msg_send![&all, count];
            for index in 0..count {
                let parameter: Option<Retained<AnyObject>> =
                    msg_send![&all, objectAtIndexedSubscript: index];
                let Some(parameter) = parameter else { continue };
                let address: u64 = msg_send![&parameter, address];
                let name: Option<Retained<NSString>> = msg_send![&parameter, displayName];
                let min_value: f32 = msg_send![&parameter, minValue];
                let max_value: f32 = msg_send![&parameter, maxValue];
                let default_value: f32 = msg_send![&parameter, value];
                by_address.insert(address, self.parameters.len() as u32);
                self.parameters.push(AuParamInfo {
                    address,
                    name: name.map(|n| n.to_string()).unwrap_or_default(),
                    min_value,
                    max_value,
                    default_value,
                });
            }
        }
    }

    /// Surface parameter-change notifications back to listeners through an
    /// observer token on the parameter tree.
    fn install_parameter_observer(&mut self) {
        let hub = self.hub.clone();
        let by_address = self.param_index_by_address.clone();
        let observer = RcBlock::new(move |address: u64, value: f32| {
            if let Some(index) = by_address.lock().unwrap().get(&address).copied() {
                hub.notify_value(index, value as f64);
            }
        });
        unsafe {
            let tree: Option<Retained<AnyObject>> = msg_send![&self.unit, parameterTree];
            if let Some(tree) = tree {
                self.observer_token =
                    msg_send![&tree, tokenByAddingParameterObserver: &*observer];
            }
        }
        self._observer_block = Some(observer);
    }

    /// Capture plugin-produced MIDI into the per-block output buffer.
    fn install_midi_output_listener(&mut self) {
        let output = self.output_midi.clone();
        let listener = RcBlock::new(
            move |_sample_time: i64, cable: u8, length: isize, bytes: NonNull<u8>| -> i32 {
                let data = unsafe {
                    std::slice::from_raw_parts(bytes.as_ptr(), length.max(0) as usize)
                };
                if let Some(ump) = midi1_bytes_to_ump(cable & 0x0F, data) {
                    output.lock().unwrap().push(ump);
                }
                0
            },
        );
        unsafe {
            let _: () = msg_send![&self.unit, setMIDIOutputEventBlock: &*listener];
        }
        // The property copies the block; keep our reference for the
        // instance lifetime anyway.
        self._midi_listener = Some(listener);
    }

    fn deallocate(&mut self) {
        if self.allocated {
            unsafe {
                let _: () = msg_send![&self.unit, deallocateRenderResources];
            }
            self.allocated = false;
            self.render_block = None;
        }
    }
}

/// Pack a MIDI 1.0 byte message into UMP form for the output sequence.
fn midi1_bytes_to_ump(group: u8, data: &[u8]) -> Option<Ump> {
    if data.is_empty() {
        return None;
    }
    let status = data[0] & 0xF0;
    let channel = data[0] & 0x0F;
    let data1 = data.get(1).copied().unwrap_or(0);
    let data2 = data.get(2).copied().unwrap_or(0);
    match status {
        0x80 => Some(Ump::midi2_note_off(
            group,
            channel,
            data1,
            0,
            widen7(data2),
            0,
        )),
        0x90 if data2 == 0 => Some(Ump::midi2_note_off(group, channel, data1, 0, 0, 0)),
        0x90 => Some(Ump::midi2_note_on(
            group,
            channel,
            data1,
            0,
            widen7(data2),
            0,
        )),
        0xA0 => Some(Ump::midi2_poly_pressure(
            group,
            channel,
            data1,
            (data2 as u32) << 25,
        )),
        0xB0 => Some(Ump::midi2_cc(group, channel, data1, (data2 as u32) << 25)),
        0xD0 => Some(Ump::midi2_channel_pressure(
            group,
            channel,
            (data1 as u32) << 25,
        )),
        0xE0 => {
            let value14 = ((data2 as u32) << 7) | data1 as u32;
            Some(Ump::midi2_pitch_bend(group, channel, value14 << 18))
        }
        _ => None,
    }
}

fn widen7(value: u8) -> u16 {
    ((value as u16) << 9) | ((value as u16) << 2)
}

/// Translates UMP input into the unit's native MIDI-1 event form.
struct AuEventTranslator<'a> {
    nodes: &'a mut Vec<AuMidiEvent>,
}

impl AuEventTranslator<'_> {
    fn push(&mut self, cable: u8, data: [u8; 3], length: u16) {
        self.nodes.push(AuMidiEvent {
            next: std::ptr::null(),
            event_sample_time: 0,
            event_type: RENDER_EVENT_MIDI,
            reserved: 0,
            length,
            cable,
            data,
        });
    }
}

impl UmpDispatcher for AuEventTranslator<'_> {
    fn on_note_on(
        &mut self,
        group: u8,
        channel: u8,
        note: u8,
        _attribute_type: u8,
        velocity: u16,
        _attribute: u16,
    ) {
        self.push(group, [0x90 | channel, note, (velocity >> 9) as u8], 3);
    }

    fn on_note_off(
        &mut self,
        group: u8,
        channel: u8,
        note: u8,
        _attribute_type: u8,
        _velocity: u16,
        _attribute: u16,
    ) {
        self.push(group, [0x80 | channel, note, 0], 3);
    }

    fn on_cc(&mut self, group: u8, channel: u8, index: u8, data: u32) {
        self.push(group, [0xB0 | channel, index, (data >> 25) as u8], 3);
    }

    fn on_pitch_bend(&mut self, group: u8, channel: u8, per_note: Option<u8>, data: u32) {
        if per_note.is_some() {
            return;
        }
        let value14 = (data >> 18) & 0x3FFF;
        self.push(
            group,
            [
                0xE0 | channel,
                (value14 & 0x7F) as u8,
                ((value14 >> 7) & 0x7F) as u8,
            ],
            3,
        );
    }

    fn on_pressure(&mut self, group: u8, channel: u8, per_note: Option<u8>, data: u32) {
        match per_note {
            Some(note) => self.push(group, [0xA0 | channel, note, (data >> 25) as u8], 3),
            None => self.push(group, [0xD0 | channel, (data >> 25) as u8, 0], 3),
        }
    }

    fn on_program_change(
        &mut self,
        group: u8,
        channel: u8,
        _flags: u8,
        program: u8,
        _bank_msb: u8,
        _bank_lsb: u8,
    ) {
        self.push(group, [0xC0 | channel, program, 0], 2);
    }
}

impl PluginInstance for AuPluginInstance {
    fn catalog_entry(&self) -> &PluginCatalogEntry {
        &self.entry
    }

    fn requires_ui_thread_on(&self) -> UiThreadRequirement {
        UiThreadRequirement::AllNonAudioOperations
    }

    fn configure(&mut self, request: &ConfigurationRequest) -> Result<(), HostError> {
        self.deallocate();
        unsafe {
            let _: () = msg_send![
                &self.unit,
                setMaximumFramesToRender: request.buffer_size_frames as u32
            ];
            let mut error: *mut NSError = std::ptr::null_mut();
            let ok: bool = msg_send![
                &self.unit,
                allocateRenderResourcesAndReturnError: &mut error
            ];
            if !ok {
                return Err(HostError::FailedToConfigure(format!(
                    "allocateRenderResources failed for {}",
                    self.entry.plugin_id
                )));
            }
        }
        self.allocated = true;
        self.event_nodes = Vec::with_capacity(1024);
        unsafe {
            let render: Option<Retained<RenderBlockSig>> = msg_send![&self.unit, renderBlock];
            self.render_block = render;
        }
        self.inspect_buses();
        self.sample_time = 0;
        Ok(())
    }

    fn start_processing(&mut self) -> Result<(), HostError> {
        if !self.allocated {
            return Err(HostError::FailedToStartProcessing(
                "start_processing before configure".to_string(),
            ));
        }
        self.processing = true;
        Ok(())
    }

    fn stop_processing(&mut self) -> Result<(), HostError> {
        self.processing = false;
        Ok(())
    }

    fn process(&mut self, context: &mut AudioProcessContext) -> Result<(), HostError> {
        if !self.processing {
            return Err(HostError::FailedToProcess("not processing".to_string()));
        }
        let Some(render) = self.render_block.as_ref() else {
            return Err(HostError::FailedToProcess("render block missing".to_string()));
        };
        let frames = context.frame_count() as u32;

        // Rebuild the pre-allocated render-event list from the UMP input.
        self.event_nodes.clear();
        {
            let mut translator = AuEventTranslator {
                nodes: &mut self.event_nodes,
            };
            dispatch_ump_bytes(context.event_in().bytes(), &mut translator);
        }
        for index in 1..self.event_nodes.len() {
            let next = &self.event_nodes[index] as *const AuMidiEvent;
            self.event_nodes[index - 1].next = next;
        }
        let event_head = self.event_nodes.first().map_or(std::ptr::null(), |e| e);

        let channels = context.output_channel_count(0).min(MAX_RENDER_CHANNELS);
        let mut buffer_list = AudioBufferList {
            number_buffers: channels as u32,
            buffers: std::array::from_fn(|_| AudioBuffer {
                number_channels: 1,
                data_byte_size: frames * std::mem::size_of::<f32>() as u32,
                data: std::ptr::null_mut(),
            }),
        };
        for channel in 0..channels {
            if let Some(ptr) = context.output_channel_ptr_f32(0, channel) {
                buffer_list.buffers[channel].data = ptr as *mut c_void;
            }
        }

        let mut flags: u32 = 0;
        let timestamp = AudioTimeStamp {
            sample_time: self.sample_time as f64,
            host_time: 0,
            rate_scalar: 1.0,
            word_clock_time: 0,
            smpte_time: [0; 24],
            flags: AUDIO_TIMESTAMP_SAMPLE_TIME_VALID,
            reserved: 0,
        };

        let status = render.call((
            NonNull::from(&mut flags),
            NonNull::from(&timestamp),
            frames,
            0,
            NonNull::from(&mut buffer_list),
            event_head,
            std::ptr::null_mut(),
        ));
        if status != 0 {
            return Err(HostError::FailedToProcess(format!(
                "render returned {status}"
            )));
        }

        // Output events arrive through the MIDI output listener.
        let produced: Vec<Ump> = self.output_midi.lock().unwrap().drain(..).collect();
        for ump in produced {
            let _ = context.event_out_mut().append(&ump);
        }

        self.sample_time += frames as i64;
        Ok(())
    }

    fn parameters(&mut self) -> Result<Vec<PluginParameter>, HostError> {
        self.rebuild_param_cache();
        Ok(self
            .parameters
            .iter()
            .enumerate()
            .map(|(index, info)| PluginParameter {
                index: index as u32,
                stable_id: info.address as u32,
                name: info.name.clone(),
                path: String::new(),
                default_plain: info.default_value as f64,
                min_plain: info.min_value as f64,
                max_plain: info.max_value as f64,
                flags: ParameterFlags {
                    automatable: true,
                    readable: true,
                    ..Default::default()
                },
                enumerations: Vec::new(),
            })
            .collect())
    }

    fn get_parameter(&self, index: u32) -> Result<f64, HostError> {
        let info = self
            .parameters
            .get(index as usize)
            .ok_or_else(|| HostError::InvalidParameterOperation(format!("index {index}")))?;
        unsafe {
            let tree: Option<Retained<AnyObject>> = msg_send![&self.unit, parameterTree];
            let Some(tree) = tree else {
                return Err(HostError::NotImplemented);
            };
            let parameter: Option<Retained<AnyObject>> =
                msg_send![&tree, parameterWithAddress: info.address];
            match parameter {
                Some(parameter) => {
                    let value: f32 = msg_send![&parameter, value];
                    Ok(value as f64)
                }
                None => Err(HostError::InvalidParameterOperation(format!(
                    "address {} unavailable",
                    info.address
                ))),
            }
        }
    }

    fn set_parameter(
        &mut self,
        index: u32,
        plain_value: f64,
        _timestamp: u64,
    ) -> Result<(), HostError> {
        let info = self
            .parameters
            .get(index as usize)
            .cloned()
            .ok_or_else(|| HostError::InvalidParameterOperation(format!("index {index}")))?;
        unsafe {
            let tree: Option<Retained<AnyObject>> = msg_send![&self.unit, parameterTree];
            let Some(tree) = tree else {
                return Err(HostError::NotImplemented);
            };
            let parameter: Option<Retained<AnyObject>> =
                msg_send![&tree, parameterWithAddress: info.address];
            if let Some(parameter) = parameter {
                let _: () = msg_send![&parameter, setValue: plain_value as f32];
            }
        }
        self.hub.notify_value(index, plain_value);
        Ok(())
    }

    fn set_per_note_controller(
        &mut self,
        _context: PerNoteControllerContext,
        _controller_index: u32,
        _value: f64,
        _timestamp: u64,
    ) -> Result<(), HostError> {
        Err(HostError::NotImplemented)
    }

    fn parameter_events(&self) -> &Arc<ParameterEventHub> {
        &self.hub
    }

    fn save_state(&mut self) -> Result<Vec<u8>, HostError> {
        unsafe {
            let state: Option<Retained<AnyObject>> = msg_send![&self.unit, fullState];
            let Some(state) = state else {
                return Ok(Vec::new());
            };
            let data: Option<Retained<AnyObject>> = msg_send![
                class!(NSKeyedArchiver),
                archivedDataWithRootObject: &*state,
                requiringSecureCoding: false,
                error: std::ptr::null_mut::<*mut NSError>(),
            ];
            match data {
                Some(data) => {
                    let length: usize = msg_send![&data, length];
                    let bytes: *const u8 = msg_send![&data, bytes];
                    Ok(std::slice::from_raw_parts(bytes, length).to_vec())
                }
                None => Ok(Vec::new()),
            }
        }
    }

    fn load_state(&mut self, _data: &[u8]) -> Result<(), HostError> {
        // Restoring a keyed archive requires the unit's own class list; the
        // host persists the archive and hands it back opaque.
        Err(HostError::NotImplemented)
    }

    fn audio_buses(&self) -> &AudioBusesInfo {
        &self.buses
    }
}

impl Drop for AuPluginInstance {
    fn drop(&mut self) {
        unsafe {
            if !self.observer_token.is_null() {
                let tree: Option<Retained<AnyObject>> = msg_send![&self.unit, parameterTree];
                if let Some(tree) = tree {
                    let _: () = msg_send![&tree, removeParameterObserver: self.observer_token];
                }
            }
            let null_block: *mut c_void = std::ptr::null_mut();
            let _: () = msg_send![&self.unit, setMIDIOutputEventBlock: null_block];
        }
        self.deallocate();
    }
}
