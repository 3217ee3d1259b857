//! One VST3 plugin instance behind the uniform host contract.
//!
//! Lifecycle follows the component/controller split: the component and (when
//! distinct) the controller are initialized separately, cross-linked through
//! connection points on the main thread, and the controller gets the host's
//! component handler. Parameter values cross the boundary normalized; the
//! adapter converts to plain values through the controller's conversion
//! functions. MIDI mappings from both interface generations are cached into
//! plain vectors for RT-safe lookup.

#![allow(non_snake_case)]

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use vst3::Steinberg::Vst::Event_::EventTypes_::{
    kLegacyMIDICCOutEvent, kNoteExpressionValueEvent, kNoteOffEvent, kNoteOnEvent,
    kPolyPressureEvent,
};
use vst3::Steinberg::Vst::ProcessContext_::StatesAndFlags_::{
    kPlaying, kTempoValid, kTimeSigValid,
};
use vst3::Steinberg::Vst::{
    AudioBusBuffers, BusDirections_, BusInfo, BusTypes_, Event, IAudioProcessor,
    IAudioProcessorTrait, IComponent, IComponentTrait, IConnectionPoint, IConnectionPointTrait,
    IEditController, IEditControllerTrait, IEventList, IMidiMapping, IMidiMapping2,
    IMidiMapping2Trait, IMidiMappingTrait, INoteExpressionController,
    INoteExpressionControllerTrait, IParameterChanges, MediaTypes_,
    Midi1ControllerParamIDAssignment, Midi1ControllerParamIDAssignmentList,
    Midi2ControllerParamIDAssignment, Midi2ControllerParamIDAssignmentList,
    NoteExpressionTypeInfo, ParameterInfo, ParameterInfo_, ProcessContext, ProcessData,
    ProcessModes_, ProcessSetup, SpeakerArrangement, SymbolicSampleSizes_,
};
use vst3::Steinberg::{
    kNoInterface, kNotImplemented, kResultOk, IBStreamTrait, IPlugViewTrait, IPluginBaseTrait,
    IPluginFactoryTrait, TUID,
};
use vst3::{ComPtr, ComWrapper, Interface};

use crate::bus::{
    AudioBusConfiguration, AudioBusDefinition, AudioBusesInfo, BusRole, ChannelLayout,
};
use crate::catalog::PluginCatalogEntry;
use crate::context::{AudioContentType, AudioProcessContext};
use crate::error::HostError;
use crate::event_loop::run_task_on_main_thread;
use crate::formats::vst3::host_classes::{
    wstring_to_string, ComponentHandlerImpl, HostApplicationImpl, HostEventList,
    ParameterChangesImpl, VectorStream,
};
use crate::formats::vst3::{audio_module_classes, hex_to_tuid, load_module, Vst3Module};
use crate::plugin::params::{
    ParameterEventHub, ParameterFlags, PerNoteControllerContext, PluginParameter,
};
use crate::plugin::{ConfigurationRequest, PluginInstance, PluginUiHandle, UiThreadRequirement};
use crate::ump::{dispatch_ump_bytes, Ump, UmpDispatcher};

// restartComponent flag bits, as laid down by the ABI.
const RESTART_RELOAD_COMPONENT: i32 = 1 << 0;
const RESTART_IO_CHANGED: i32 = 1 << 1;
const RESTART_PARAM_VALUES_CHANGED: i32 = 1 << 2;
const RESTART_LATENCY_CHANGED: i32 = 1 << 3;
const RESTART_PARAM_TITLES_CHANGED: i32 = 1 << 4;
const RESTART_MIDI_CC_ASSIGNMENT_CHANGED: i32 = 1 << 5;
const RESTART_NOTE_EXPRESSION_CHANGED: i32 = 1 << 6;
const RESTART_PARAM_ID_MAPPING_CHANGED: i32 = 1 << 11;

// MIDI 1.0 controller numbers beyond the CC range.
const CTRL_AFTERTOUCH: i16 = 128;
const CTRL_PITCHBEND: i16 = 129;

// Speaker arrangement bits; stereo is L|R, mono the dedicated M speaker.
const SPEAKER_ARR_MONO: SpeakerArrangement = 1 << 19;
const SPEAKER_ARR_STEREO: SpeakerArrangement = 0x3;

fn arrangement_for_channels(channels: u32) -> SpeakerArrangement {
    match channels {
        0 => 0,
        1 => SPEAKER_ARR_MONO,
        2 => SPEAKER_ARR_STEREO,
        n => (1u64 << n) - 1,
    }
}

/// State blob header carrying separate component and controller blobs.
/// When the controller state is empty, the bare component blob is stored
/// without a header; the read path detects the magic.
const STATE_MAGIC: [u8; 4] = *b"RST3";
const STATE_VERSION: u32 = 1;
const STATE_HEADER_LEN: usize = 16;

#[derive(Clone)]
struct Vst3ParamInfo {
    id: u32,
    name: String,
    path: String,
    default_normalized: f64,
    step_count: i32,
    flags: i32,
}

#[derive(Clone, Copy)]
struct Midi1Assignment {
    bus_index: i32,
    channel: i16,
    controller: i16,
    param_id: u32,
}

#[derive(Clone, Copy)]
struct Midi2Assignment {
    bus_index: i32,
    channel: i16,
    registered: bool,
    bank: u8,
    index: u8,
    param_id: u32,
}

/// Parameter edits and restarts arrive through host-callback objects that
/// cannot borrow the instance, so they land here and the instance drains
/// them at safe points.
#[derive(Default)]
struct HandlerInbox {
    pending_edits: Mutex<Vec<(u32, f64)>>,
    pending_restart_flags: AtomicI32,
}

pub struct Vst3PluginInstance {
    entry: PluginCatalogEntry,
    _module: Arc<Vst3Module>,
    component: ComPtr<IComponent>,
    processor: ComPtr<IAudioProcessor>,
    controller: ComPtr<IEditController>,
    controller_distinct: bool,
    connection_component: Option<ComPtr<IConnectionPoint>>,
    connection_controller: Option<ComPtr<IConnectionPoint>>,
    handler: ComWrapper<ComponentHandlerImpl>,
    _host_app: ComWrapper<HostApplicationImpl>,
    host_context_raw: *mut vst3::Steinberg::FUnknown,
    inbox: Arc<HandlerInbox>,
    hub: Arc<ParameterEventHub>,

    input_events: ComWrapper<HostEventList>,
    output_events: ComWrapper<HostEventList>,
    input_events_raw: *mut IEventList,
    output_events_raw: *mut IEventList,
    input_param_changes: ComWrapper<ParameterChangesImpl>,
    output_param_changes: ComWrapper<ParameterChangesImpl>,
    input_param_changes_raw: *mut IParameterChanges,
    output_param_changes_raw: *mut IParameterChanges,

    process_data: ProcessData,
    process_context: ProcessContext,
    process_setup: ProcessSetup,
    has_process_setup: bool,

    buses: AudioBusesInfo,
    bus_buffers_in: Vec<AudioBusBuffers>,
    bus_buffers_out: Vec<AudioBusBuffers>,
    channel_ptrs_in: Vec<Vec<*mut f32>>,
    channel_ptrs_out: Vec<Vec<*mut f32>>,
    fallback_input: Vec<f32>,
    fallback_outputs: Vec<Vec<f32>>,

    params: Vec<Vst3ParamInfo>,
    param_index_by_id: HashMap<u32, u32>,
    midi1_mappings: Vec<Midi1Assignment>,
    midi2_mappings: Vec<Midi2Assignment>,
    /// `type id -> per-note controller index` from the note-expression
    /// controller, plus the reverse direction for input mapping.
    note_expression_index_by_type: HashMap<u32, u32>,
    note_expression_type_by_index: HashMap<u32, u32>,

    component_active: bool,
    processing_active: bool,
    continuous_time_samples: i64,
    ui_view: Option<ComPtr<vst3::Steinberg::IPlugView>>,
}

// The COM pointers are only used per the VST3 threading contract: lifecycle
// on the main thread, `process` on the audio thread, serialized by the
// engine.
unsafe impl Send for Vst3PluginInstance {}

impl Vst3PluginInstance {
    pub fn create(entry: &PluginCatalogEntry) -> Result<Self, HostError> {
        let module = load_module(&entry.bundle_path)?;
        let class_id = hex_to_tuid(&entry.plugin_id)
            .or_else(|| {
                // Entries scanned by display name fall back to the first
                // matching audio class.
                audio_module_classes(&module)
                    .into_iter()
                    .find(|(_, name)| *name == entry.display_name)
                    .map(|(cid, _)| cid)
            })
            .ok_or_else(|| {
                HostError::FailedToInstantiate(format!("unknown class id {}", entry.plugin_id))
            })?;

        let host_app = ComWrapper::new(HostApplicationImpl);
        let host_context_raw = host_app
            .to_com_ptr::<vst3::Steinberg::FUnknown>()
            .map(|ptr| ptr.into_raw())
            .unwrap_or(std::ptr::null_mut());

        let component = unsafe {
            let mut raw: *mut IComponent = std::ptr::null_mut();
            let result = module.factory().createInstance(
                class_id.as_ptr() as *const _,
                IComponent::IID.as_ptr() as *const _,
                &mut raw as *mut *mut IComponent as *mut *mut c_void,
            );
            if result != kResultOk || raw.is_null() {
                return Err(HostError::FailedToInstantiate(format!(
                    "createInstance failed: {result:#x}"
                )));
            }
            ComPtr::from_raw(raw).ok_or_else(|| {
                HostError::FailedToInstantiate("component wrap failed".to_string())
            })?
        };

        unsafe {
            let result = component.initialize(host_context_raw);
            if result != kResultOk && result != kNotImplemented {
                return Err(HostError::FailedToInstantiate(format!(
                    "component initialize failed: {result:#x}"
                )));
            }
        }

        // Partially initialised objects release in reverse order on failure.
        let terminate_component = |component: &ComPtr<IComponent>| unsafe {
            component.terminate();
        };

        let Some(processor) = component.cast::<IAudioProcessor>() else {
            terminate_component(&component);
            return Err(HostError::NoInterface("IAudioProcessor".to_string()));
        };

        // The controller is either the same object or a distinct class the
        // component names.
        let (controller, controller_distinct) = match component.cast::<IEditController>() {
            Some(controller) => (controller, false),
            None => unsafe {
                let mut controller_cid: TUID = [0; 16];
                if component.getControllerClassId(&mut controller_cid) != kResultOk {
                    terminate_component(&component);
                    return Err(HostError::NoInterface("IEditController".to_string()));
                }
                let mut raw: *mut IEditController = std::ptr::null_mut();
                let result = module.factory().createInstance(
                    controller_cid.as_ptr() as *const _,
                    IEditController::IID.as_ptr() as *const _,
                    &mut raw as *mut *mut IEditController as *mut *mut c_void,
                );
                if result != kResultOk || raw.is_null() {
                    terminate_component(&component);
                    return Err(HostError::NoInterface("IEditController".to_string()));
                }
                let Some(controller) = ComPtr::from_raw(raw) else {
                    terminate_component(&component);
                    return Err(HostError::NoInterface("IEditController".to_string()));
                };
                let result = controller.initialize(host_context_raw);
                if result != kResultOk && result != kNotImplemented {
                    terminate_component(&component);
                    return Err(HostError::FailedToInstantiate(format!(
                        "controller initialize failed: {result:#x}"
                    )));
                }
                (controller, true)
            },
        };

        let handler = ComWrapper::new(ComponentHandlerImpl::default());
        unsafe {
            let handler_raw = handler
                .to_com_ptr::<vst3::Steinberg::Vst::IComponentHandler>()
                .map(|ptr| ptr.into_raw())
                .unwrap_or(std::ptr::null_mut());
            let result = controller.setComponentHandler(handler_raw);
            if result != kResultOk && result != kNoInterface && result != kNotImplemented {
                log::error!(
                    "{}: setComponentHandler failed: {result:#x}",
                    entry.display_name
                );
            }
        }

        let connection_component = component.cast::<IConnectionPoint>();
        let connection_controller = controller.cast::<IConnectionPoint>();

        // Cross-link the two halves; connection-point traffic must run on
        // the main thread.
        if controller_distinct {
            if let (Some(conn_comp), Some(conn_edit)) =
                (&connection_component, &connection_controller)
            {
                let comp = conn_comp.clone();
                let edit = conn_edit.clone();
                let name = entry.display_name.clone();
                let wrapped = crate::event_loop::MainThreadSafe((comp, edit, name));
                run_task_on_main_thread(move || {
                    let (comp, edit, name) = &wrapped.0;
                    unsafe {
                        if comp.connect(edit.as_ptr()) != kResultOk {
                            log::warn!("{name}: component connection point refused link");
                        }
                        if edit.connect(comp.as_ptr()) != kResultOk {
                            log::warn!("{name}: controller connection point refused link");
                        }
                    }
                });
            }
        }

        let input_events = ComWrapper::new(HostEventList::default());
        let output_events = ComWrapper::new(HostEventList::default());
        let input_events_raw = input_events
            .to_com_ptr::<IEventList>()
            .map(|ptr| ptr.into_raw())
            .unwrap_or(std::ptr::null_mut());
        let output_events_raw = output_events
            .to_com_ptr::<IEventList>()
            .map(|ptr| ptr.into_raw())
            .unwrap_or(std::ptr::null_mut());
        let input_param_changes = ComWrapper::new(ParameterChangesImpl::default());
        let output_param_changes = ComWrapper::new(ParameterChangesImpl::default());
        let input_param_changes_raw = input_param_changes
            .to_com_ptr::<IParameterChanges>()
            .map(|ptr| ptr.into_raw())
            .unwrap_or(std::ptr::null_mut());
        let output_param_changes_raw = output_param_changes
            .to_com_ptr::<IParameterChanges>()
            .map(|ptr| ptr.into_raw())
            .unwrap_or(std::ptr::null_mut());

        let mut instance = Self {
            entry: entry.clone(),
            _module: module,
            component,
            processor,
            controller,
            controller_distinct,
            connection_component,
            connection_controller,
            handler,
            _host_app: host_app,
            host_context_raw,
            inbox: Arc::new(HandlerInbox::default()),
            hub: Arc::new(ParameterEventHub::new()),
            input_events,
            output_events,
            input_events_raw,
            output_events_raw,
            input_param_changes,
            output_param_changes,
            input_param_changes_raw,
            output_param_changes_raw,
            process_data: unsafe { std::mem::zeroed() },
            process_context: unsafe { std::mem::zeroed() },
            process_setup: unsafe { std::mem::zeroed() },
            has_process_setup: false,
            buses: AudioBusesInfo::default(),
            bus_buffers_in: Vec::new(),
            bus_buffers_out: Vec::new(),
            channel_ptrs_in: Vec::new(),
            channel_ptrs_out: Vec::new(),
            fallback_input: Vec::new(),
            fallback_outputs: Vec::new(),
            params: Vec::new(),
            param_index_by_id: HashMap::new(),
            midi1_mappings: Vec::new(),
            midi2_mappings: Vec::new(),
            note_expression_index_by_type: HashMap::new(),
            note_expression_type_by_index: HashMap::new(),
            component_active: false,
            processing_active: false,
            continuous_time_samples: 0,
            ui_view: None,
        };

        // Wire the handler callbacks into the inbox and the listener hub.
        let inbox = instance.inbox.clone();
        instance
            .handler
            .set_parameter_edit_handler(Box::new(move |id, normalized| {
                inbox.pending_edits.lock().unwrap().push((id, normalized));
            }));
        let inbox = instance.inbox.clone();
        instance.handler.set_restart_handler(Box::new(move |flags| {
            inbox.pending_restart_flags.fetch_or(flags, Ordering::SeqCst);
        }));

        instance.synchronize_controller_state();
        instance.rebuild_param_cache();
        instance.refresh_midi_mappings();
        instance.refresh_note_expression_table();
        instance.inspect_buses();
        Ok(instance)
    }

    /// Push the component state into a freshly created distinct controller
    /// so both halves agree before the first parameter read.
    fn synchronize_controller_state(&mut self) {
        if !self.controller_distinct {
            return;
        }
        let component = self.component.clone();
        let controller = self.controller.clone();
        let wrapped = crate::event_loop::MainThreadSafe((component, controller));
        run_task_on_main_thread(move || {
            let (component, controller) = &wrapped.0;
            let stream = ComWrapper::new(VectorStream::default());
            unsafe {
                let Some(stream_ptr) = stream.to_com_ptr::<vst3::Steinberg::IBStream>() else {
                    return;
                };
                if component.getState(stream_ptr.as_ptr()) != kResultOk {
                    return;
                }
                // Rewind and hand the same bytes to the controller.
                stream_ptr.seek(0, 0, std::ptr::null_mut());
                controller.setComponentState(stream_ptr.as_ptr());
            }
        });
    }

    fn rebuild_param_cache(&mut self) {
        self.params.clear();
        self.param_index_by_id.clear();
        unsafe {
            let count = self.controller.getParameterCount();
            for index in 0..count {
                let mut info: ParameterInfo = std::mem::zeroed();
                if self.controller.getParameterInfo(index, &mut info) != kResultOk {
                    continue;
                }
                let cached = Vst3ParamInfo {
                    id: info.id,
                    name: wstring_to_string(&info.title),
                    path: wstring_to_string(&info.units),
                    default_normalized: info.defaultNormalizedValue,
                    step_count: info.stepCount,
                    flags: info.flags,
                };
                self.param_index_by_id
                    .insert(cached.id, self.params.len() as u32);
                self.params.push(cached);
            }
        }
    }

    /// Cache MIDI mappings from both interface generations for RT-safe
    /// lookup during event translation. The list interface is read directly;
    /// the older query interface is probed for the CC range plus aftertouch
    /// and pitch bend on every channel of bus 0. Main thread.
    fn refresh_midi_mappings(&mut self) {
        self.midi1_mappings.clear();
        self.midi2_mappings.clear();

        if let Some(mapping2) = self.controller.cast::<IMidiMapping2>() {
            unsafe {
                let count1 = mapping2.getNumMidi1ControllerAssignments(BusDirections_::kInput);
                if count1 > 0 {
                    let mut buffer: Vec<Midi1ControllerParamIDAssignment> =
                        (0..count1).map(|_| std::mem::zeroed()).collect();
                    let list = Midi1ControllerParamIDAssignmentList {
                        count: count1,
                        map: buffer.as_mut_ptr(),
                    };
                    if mapping2.getMidi1ControllerAssignments(BusDirections_::kInput, &list)
                        == kResultOk
                    {
                        for assignment in &buffer {
                            self.midi1_mappings.push(Midi1Assignment {
                                bus_index: assignment.busIndex as i32,
                                channel: assignment.channel as i16,
                                controller: assignment.controller as i16,
                                param_id: assignment.pId,
                            });
                        }
                    }
                }

                let count2 = mapping2.getNumMidi2ControllerAssignments(BusDirections_::kInput);
                if count2 > 0 {
                    let mut buffer: Vec<Midi2ControllerParamIDAssignment> =
                        (0..count2).map(|_| std::mem::zeroed()).collect();
                    let list = Midi2ControllerParamIDAssignmentList {
                        count: count2,
                        map: buffer.as_mut_ptr(),
                    };
                    if mapping2.getMidi2ControllerAssignments(BusDirections_::kInput, &list)
                        == kResultOk
                    {
                        for assignment in &buffer {
                            self.midi2_mappings.push(Midi2Assignment {
                                bus_index: assignment.busIndex as i32,
                                channel: assignment.channel as i16,
                                registered: assignment.controller.registered != 0,
                                bank: assignment.controller.bank as u8,
                                index: assignment.controller.index as u8,
                                param_id: assignment.pId,
                            });
                        }
                    }
                }
            }
        }

        // The pre-list generation is not an "else": both caches fill when
        // both interfaces exist.
        if let Some(mapping) = self.controller.cast::<IMidiMapping>() {
            unsafe {
                let mut controllers: Vec<i16> = vec![CTRL_AFTERTOUCH, CTRL_PITCHBEND];
                controllers.extend(0..128i16);
                for channel in 0..16i16 {
                    for controller_number in &controllers {
                        let mut param_id: u32 = 0;
                        if mapping.getMidiControllerAssignment(
                            0,
                            channel,
                            *controller_number,
                            &mut param_id,
                        ) == kResultOk
                        {
                            self.midi1_mappings.push(Midi1Assignment {
                                bus_index: 0,
                                channel,
                                controller: *controller_number,
                                param_id,
                            });
                        }
                    }
                }
            }
        }
    }

    fn resolve_midi2_mapping(
        &self,
        channel: u8,
        registered: bool,
        bank: u8,
        index: u8,
    ) -> Option<u32> {
        self.midi2_mappings
            .iter()
            .find(|assignment| {
                assignment.bus_index == 0
                    && assignment.channel == channel as i16
                    && assignment.registered == registered
                    && assignment.bank == bank
                    && assignment.index == index
            })
            .map(|assignment| assignment.param_id)
    }

    /// Note-expression types map to per-note controller indices through a
    /// `(type id, index)` table built from the controller.
    fn refresh_note_expression_table(&mut self) {
        self.note_expression_index_by_type.clear();
        self.note_expression_type_by_index.clear();
        let Some(expression) = self.controller.cast::<INoteExpressionController>() else {
            return;
        };
        unsafe {
            let count = expression.getNoteExpressionCount(0, 0);
            for index in 0..count.max(0) {
                let mut info: NoteExpressionTypeInfo = std::mem::zeroed();
                if expression.getNoteExpressionInfo(0, 0, index, &mut info) != kResultOk {
                    continue;
                }
                self.note_expression_index_by_type
                    .insert(info.typeId, index as u32);
                self.note_expression_type_by_index
                    .insert(index as u32, info.typeId);
            }
        }
    }

    /// Enumerate the component's buses into the generic model. The bus
    /// flagged main (or index 0) becomes the main bus.
    fn inspect_buses(&mut self) {
        let mut info = AudioBusesInfo::default();
        unsafe {
            for (direction, buses) in [
                (BusDirections_::kInput, &mut info.input_buses),
                (BusDirections_::kOutput, &mut info.output_buses),
            ] {
                let count = self
                    .component
                    .getBusCount(MediaTypes_::kAudio as i32, direction as i32);
                for index in 0..count {
                    let mut bus: BusInfo = std::mem::zeroed();
                    if self.component.getBusInfo(
                        MediaTypes_::kAudio as i32,
                        direction as i32,
                        index,
                        &mut bus,
                    ) != kResultOk
                    {
                        continue;
                    }
                    let role = if bus.busType == BusTypes_::kMain as i32 || index == 0 {
                        BusRole::Main
                    } else {
                        BusRole::Aux
                    };
                    let layout = ChannelLayout::new(bus.channelCount.max(0) as u32);
                    buses.push(AudioBusConfiguration::new(
                        AudioBusDefinition::new(wstring_to_string(&bus.name), role, vec![layout]),
                        layout,
                    ));
                }
            }
            info.has_event_input = self
                .component
                .getBusCount(MediaTypes_::kEvent as i32, BusDirections_::kInput as i32)
                > 0;
            info.has_event_output = self
                .component
                .getBusCount(MediaTypes_::kEvent as i32, BusDirections_::kOutput as i32)
                > 0;
        }
        self.buses = info;
    }

    fn activate_all_buses(&mut self, state: bool) {
        unsafe {
            for (direction, count) in [
                (BusDirections_::kInput, self.buses.input_buses.len()),
                (BusDirections_::kOutput, self.buses.output_buses.len()),
            ] {
                for index in 0..count {
                    self.component.activateBus(
                        MediaTypes_::kAudio as i32,
                        direction as i32,
                        index as i32,
                        state as u8,
                    );
                }
            }
        }
    }

    /// Allocate bus-buffer descriptors and fallback storage matching the
    /// inspected topology.
    fn allocate_process_buffers(&mut self, frames: usize) {
        self.bus_buffers_in = self
            .buses
            .input_buses
            .iter()
            .map(|bus| {
                let mut buffers: AudioBusBuffers = unsafe { std::mem::zeroed() };
                buffers.numChannels = bus.channels() as i32;
                buffers
            })
            .collect();
        self.bus_buffers_out = self
            .buses
            .output_buses
            .iter()
            .map(|bus| {
                let mut buffers: AudioBusBuffers = unsafe { std::mem::zeroed() };
                buffers.numChannels = bus.channels() as i32;
                buffers
            })
            .collect();
        self.channel_ptrs_in = self
            .buses
            .input_buses
            .iter()
            .map(|bus| vec![std::ptr::null_mut(); bus.channels() as usize])
            .collect();
        self.channel_ptrs_out = self
            .buses
            .output_buses
            .iter()
            .map(|bus| vec![std::ptr::null_mut(); bus.channels() as usize])
            .collect();
        self.fallback_input = vec![0.0; frames];
        let fallback_out_channels: usize = self
            .buses
            .output_buses
            .iter()
            .map(|bus| bus.channels() as usize)
            .sum();
        self.fallback_outputs = vec![vec![0.0; frames]; fallback_out_channels];
    }

    fn param_info(&self, index: u32) -> Result<&Vst3ParamInfo, HostError> {
        self.params
            .get(index as usize)
            .ok_or_else(|| HostError::InvalidParameterOperation(format!("index {index}")))
    }

    fn resolve_midi1_mapping(&self, channel: u8, controller: i16) -> Option<u32> {
        self.midi1_mappings
            .iter()
            .find(|assignment| {
                assignment.bus_index == 0
                    && assignment.channel == channel as i16
                    && assignment.controller == controller
            })
            .map(|assignment| assignment.param_id)
    }

    /// Apply a restartComponent request. Main thread.
    fn handle_restart_flags(&mut self, flags: i32) {
        let name = self.entry.display_name.clone();

        if flags & RESTART_RELOAD_COMPONENT != 0 && self.component_active {
            // Reset without re-instantiating; a full reload would recreate
            // the instance.
            log::info!("{name}: reload component requested; resetting activation");
            unsafe {
                if self.component.setActive(0) == kResultOk {
                    self.component_active = false;
                    if self.component.setActive(1) == kResultOk {
                        self.component_active = true;
                    } else {
                        log::error!("{name}: reactivation after reload failed");
                    }
                }
            }
        }

        if flags & RESTART_IO_CHANGED != 0 {
            log::info!("{name}: bus configuration changed; reconfiguring I/O");
            if self.has_process_setup {
                unsafe {
                    if self.component.setActive(0) == kResultOk {
                        self.component_active = false;
                    }
                }
                self.inspect_buses();
                self.allocate_process_buffers(self.process_setup.maxSamplesPerBlock.max(0) as usize);
                unsafe {
                    if self.processor.setupProcessing(&mut self.process_setup) == kResultOk {
                        if self.component.setActive(1) == kResultOk {
                            self.component_active = true;
                        } else {
                            log::error!("{name}: reactivation after I/O change failed");
                        }
                    } else {
                        log::error!("{name}: setupProcessing after I/O change failed");
                    }
                }
            }
        }

        if flags & RESTART_LATENCY_CHANGED != 0 {
            let latency = unsafe { self.processor.getLatencySamples() };
            log::info!("{name}: latency changed to {latency} samples");
        }

        if flags & RESTART_MIDI_CC_ASSIGNMENT_CHANGED != 0 {
            self.refresh_midi_mappings();
        }

        if flags & RESTART_NOTE_EXPRESSION_CHANGED != 0 {
            self.refresh_note_expression_table();
        }

        if flags & RESTART_PARAM_VALUES_CHANGED != 0 {
            // Re-read every parameter and notify listeners with current
            // values.
            for index in 0..self.params.len() as u32 {
                if let Ok(value) = self.get_parameter(index) {
                    self.hub.notify_value(index, value);
                }
            }
        }

        if flags & (RESTART_PARAM_TITLES_CHANGED | RESTART_PARAM_ID_MAPPING_CHANGED) != 0 {
            self.rebuild_param_cache();
            self.hub.notify_metadata_changed();
        }
    }

    /// Drain handler requests at a main-thread checkpoint.
    fn service_handler_inbox(&mut self) {
        let flags = self.inbox.pending_restart_flags.swap(0, Ordering::SeqCst);
        if flags != 0 {
            self.handle_restart_flags(flags);
        }
    }

    /// Move plugin-initiated edits into the next block's parameter changes.
    fn drain_pending_edits(&mut self) {
        let edits: Vec<(u32, f64)> = {
            let mut pending = self.inbox.pending_edits.lock().unwrap();
            pending.drain(..).collect()
        };
        for (id, normalized) in edits {
            self.input_param_changes.add_point(id, 0, normalized);
            if let Some(index) = self.param_index_by_id.get(&id).copied() {
                let plain = unsafe { self.controller.normalizedParamToPlain(id, normalized) };
                self.hub.notify_value(index, plain);
            }
        }
    }

    fn refresh_audio_pointers(&mut self, context: &mut AudioProcessContext) {
        let frames = context.frame_count();
        if self.fallback_input.len() < frames {
            self.fallback_input.resize(frames, 0.0);
        }
        self.fallback_input[..frames].fill(0.0);

        for (bus_index, bus) in self.bus_buffers_in.iter_mut().enumerate() {
            let ptrs = &mut self.channel_ptrs_in[bus_index];
            for (channel, slot) in ptrs.iter_mut().enumerate() {
                let supplied = if bus_index < context.audio_in_bus_count() {
                    context.input_channel_ptr_f32(bus_index, channel)
                } else {
                    None
                };
                *slot = supplied.unwrap_or(self.fallback_input.as_mut_ptr());
            }
            unsafe {
                bus.__field0.channelBuffers32 = ptrs.as_mut_ptr();
            }
        }

        let mut fallback_index = 0;
        for (bus_index, bus) in self.bus_buffers_out.iter_mut().enumerate() {
            let ptrs = &mut self.channel_ptrs_out[bus_index];
            for (channel, slot) in ptrs.iter_mut().enumerate() {
                let supplied = if bus_index < context.audio_out_bus_count() {
                    context.output_channel_ptr_f32(bus_index, channel)
                } else {
                    None
                };
                *slot = match supplied {
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
            }
            unsafe {
                bus.__field0.channelBuffers32 = ptrs.as_mut_ptr();
            }
        }
    }

    fn update_process_context(&mut self, context: &AudioProcessContext) {
        let master = context.master();
        self.process_context.sampleRate = master.sample_rate() as f64;
        self.process_context.projectTimeSamples = master.playback_position_samples();
        self.process_context.continousTimeSamples = self.continuous_time_samples;
        self.process_context.tempo = master.tempo_bpm();
        let (numerator, denominator) = master.time_signature();
        self.process_context.timeSigNumerator = numerator as i32;
        self.process_context.timeSigDenominator = denominator as i32;
        self.process_context.projectTimeMusic = master.ppq_position();
        let mut state = kTempoValid as u32 | kTimeSigValid as u32;
        if master.is_playing() {
            state |= kPlaying as u32;
        }
        self.process_context.state = state;
    }

    /// Convert the plugin's output events and parameter changes into UMP on
    /// the context's output sequence, notifying listeners along the way.
    fn reflect_outputs(&mut self, context: &mut AudioProcessContext) {
        for event in self.output_events.drain() {
            let group = (event.busIndex.max(0) & 0x0F) as u8;
            match event.r#type as u32 {
                t if t == kNoteOnEvent as u32 => unsafe {
                    let note = event.__field0.noteOn;
                    let velocity = (note.velocity.clamp(0.0, 1.0) * 65535.0) as u16;
                    let _ = context.event_out_mut().append(&Ump::midi2_note_on(
                        group,
                        note.channel.max(0) as u8,
                        note.pitch.max(0) as u8,
                        0,
                        velocity,
                        0,
                    ));
                },
                t if t == kNoteOffEvent as u32 => unsafe {
                    let note = event.__field0.noteOff;
                    let velocity = (note.velocity.clamp(0.0, 1.0) * 65535.0) as u16;
                    let _ = context.event_out_mut().append(&Ump::midi2_note_off(
                        group,
                        note.channel.max(0) as u8,
                        note.pitch.max(0) as u8,
                        0,
                        velocity,
                        0,
                    ));
                },
                t if t == kPolyPressureEvent as u32 => unsafe {
                    let pressure = event.__field0.polyPressure;
                    let data = (pressure.pressure.clamp(0.0, 1.0) as f64 * u32::MAX as f64) as u32;
                    let _ = context.event_out_mut().append(&Ump::midi2_poly_pressure(
                        group,
                        pressure.channel.max(0) as u8,
                        pressure.pitch.max(0) as u8,
                        data,
                    ));
                },
                t if t == kNoteExpressionValueEvent as u32 => unsafe {
                    let expression = event.__field0.noteExpressionValue;
                    let Some(index) = self
                        .note_expression_index_by_type
                        .get(&expression.typeId)
                        .copied()
                    else {
                        continue;
                    };
                    let value = expression.value.clamp(0.0, 1.0);
                    let note = (expression.noteId.max(0) & 0x7F) as u8;
                    self.hub.notify_per_note(
                        PerNoteControllerContext {
                            group,
                            channel: 0,
                            note,
                        },
                        index,
                        value,
                    );
                    let data = (value * u32::MAX as f64) as u32;
                    let _ = context.event_out_mut().append(&Ump::midi2_per_note_acc(
                        group,
                        0,
                        note,
                        (index & 0x7F) as u8,
                        data,
                    ));
                },
                t if t == kLegacyMIDICCOutEvent as u32 => unsafe {
                    let cc = event.__field0.midiCCOut;
                    let channel = cc.channel.max(0) as u8;
                    let control = cc.controlNumber;
                    let value = cc.value as u8 as u32;
                    let ump = if control as i16 == CTRL_PITCHBEND {
                        let value14 = ((cc.value2 as u8 as u32) << 7) | value;
                        Ump::midi2_pitch_bend(group, channel, value14 << 18)
                    } else if control as i16 == CTRL_AFTERTOUCH {
                        Ump::midi2_channel_pressure(group, channel, value << 25)
                    } else {
                        Ump::midi2_cc(group, channel, control & 0x7F, value << 25)
                    };
                    let _ = context.event_out_mut().append(&ump);
                },
                _ => {}
            }
        }

        // Output parameter changes reflect as assignable-controller NRPNs
        // with bank = id >> 7 and index = id & 0x7F; the value scales to
        // 32-bit unsigned.
        for (param_id, normalized) in self.output_param_changes.last_points() {
            if let Some(index) = self.param_index_by_id.get(&param_id).copied() {
                let plain = unsafe { self.controller.normalizedParamToPlain(param_id, normalized) };
                self.hub.notify_value(index, plain);
            }
            let bank = ((param_id >> 7) & 0x7F) as u8;
            let low = (param_id & 0x7F) as u8;
            let data = (normalized.clamp(0.0, 1.0) * u32::MAX as f64) as u32;
            let _ = context
                .event_out_mut()
                .append(&Ump::midi2_nrpn(0, 0, bank, low, data));
        }
        self.output_param_changes.clear();
    }
}

/// Translates a block's UMP input into native VST3 events and parameter
/// changes using the cached MIDI mappings.
struct Vst3EventTranslator<'a> {
    events: &'a HostEventList,
    param_changes: &'a ParameterChangesImpl,
    instance: &'a Vst3PluginInstance,
    ppq_position: f64,
}

impl Vst3EventTranslator<'_> {
    fn base_event(&self, group: u8) -> Event {
        let mut event: Event = unsafe { std::mem::zeroed() };
        event.busIndex = group as i32;
        event.sampleOffset = 0;
        event.ppqPosition = self.ppq_position;
        event.flags = 0;
        event
    }
}

impl UmpDispatcher for Vst3EventTranslator<'_> {
    fn on_note_on(
        &mut self,
        group: u8,
        channel: u8,
        note: u8,
        _attribute_type: u8,
        velocity: u16,
        _attribute: u16,
    ) {
        let mut event = self.base_event(group);
        event.r#type = kNoteOnEvent as u16;
        event.__field0.noteOn.channel = channel as i16;
        event.__field0.noteOn.pitch = note as i16;
        event.__field0.noteOn.tuning = 0.0;
        event.__field0.noteOn.velocity = velocity as f32 / 65535.0;
        event.__field0.noteOn.length = 0;
        event.__field0.noteOn.noteId = -1;
        self.events.push(event);
    }

    fn on_note_off(
        &mut self,
        group: u8,
        channel: u8,
        note: u8,
        _attribute_type: u8,
        velocity: u16,
        _attribute: u16,
    ) {
        let mut event = self.base_event(group);
        event.r#type = kNoteOffEvent as u16;
        event.__field0.noteOff.channel = channel as i16;
        event.__field0.noteOff.pitch = note as i16;
        event.__field0.noteOff.tuning = 0.0;
        event.__field0.noteOff.velocity = velocity as f32 / 65535.0;
        event.__field0.noteOff.noteId = -1;
        self.events.push(event);
    }

    fn on_cc(&mut self, _group: u8, channel: u8, index: u8, data: u32) {
        let value = data as f64 / u32::MAX as f64;
        // CC can be mapped as a MIDI 2.0 assignable controller with bank 0
        // or through the legacy table; the first cache hit wins.
        let param_id = self
            .instance
            .resolve_midi2_mapping(channel, false, 0, index)
            .or_else(|| self.instance.resolve_midi1_mapping(channel, index as i16));
        match param_id {
            Some(param_id) => self.param_changes.add_point(param_id, 0, value),
            None => log::debug!(
                "no MIDI mapping for CC {index}; channel {channel} message dropped"
            ),
        }
    }

    fn on_ac(&mut self, _group: u8, channel: u8, bank: u8, index: u8, data: u32, relative: bool) {
        // Assignable controllers reach mapped parameters here; unmapped
        // NRPNs are handled by the node-level input mapper.
        if relative {
            return;
        }
        if let Some(param_id) = self.instance.resolve_midi2_mapping(channel, false, bank, index) {
            self.param_changes
                .add_point(param_id, 0, data as f64 / u32::MAX as f64);
        }
    }

    fn on_rc(&mut self, _group: u8, channel: u8, bank: u8, index: u8, data: u32, relative: bool) {
        if relative {
            return;
        }
        if let Some(param_id) = self.instance.resolve_midi2_mapping(channel, true, bank, index) {
            self.param_changes
                .add_point(param_id, 0, data as f64 / u32::MAX as f64);
        }
    }

    fn on_pitch_bend(&mut self, _group: u8, channel: u8, per_note: Option<u8>, data: u32) {
        if per_note.is_some() {
            return;
        }
        let value = data as f64 / u32::MAX as f64;
        if let Some(param_id) = self.instance.resolve_midi1_mapping(channel, CTRL_PITCHBEND) {
            self.param_changes.add_point(param_id, 0, value);
        }
    }

    fn on_pressure(&mut self, group: u8, channel: u8, per_note: Option<u8>, data: u32) {
        match per_note {
            Some(note) => {
                // Native poly-pressure path; formats without a dedicated
                // per-note route still receive the event.
                let mut event = self.base_event(group);
                event.r#type = kPolyPressureEvent as u16;
                unsafe {
                    event.__field0.polyPressure.channel = channel as i16;
                    event.__field0.polyPressure.pitch = note as i16;
                    event.__field0.polyPressure.pressure = (data as f64 / u32::MAX as f64) as f32;
                    event.__field0.polyPressure.noteId = -1;
                }
                self.events.push(event);
            }
            None => {
                let value = data as f64 / u32::MAX as f64;
                if let Some(param_id) =
                    self.instance.resolve_midi1_mapping(channel, CTRL_AFTERTOUCH)
                {
                    self.param_changes.add_point(param_id, 0, value);
                }
            }
        }
    }

    fn on_pnac(&mut self, group: u8, _channel: u8, note: u8, index: u8, data: u32) {
        // Per-note controllers map to note-expression events through the
        // cached type table.
        let Some(type_id) = self
            .instance
            .note_expression_type_by_index
            .get(&(index as u32))
            .copied()
        else {
            return;
        };
        let mut event = self.base_event(group);
        event.r#type = kNoteExpressionValueEvent as u16;
        unsafe {
            event.__field0.noteExpressionValue.typeId = type_id;
            event.__field0.noteExpressionValue.noteId = note as i32;
            event.__field0.noteExpressionValue.value = data as f64 / u32::MAX as f64;
        }
        self.events.push(event);
    }

    fn on_program_change(
        &mut self,
        _group: u8,
        _channel: u8,
        _flags: u8,
        program: u8,
        _bank_msb: u8,
        _bank_lsb: u8,
    ) {
        // The best a VST3 host can do is drive a program-change parameter.
        if let Some(info) = self
            .instance
            .params
            .iter()
            .find(|p| p.flags & ParameterInfo_::ParameterFlags_::kIsProgramChange as i32 != 0)
        {
            let steps = info.step_count.max(1) as f64;
            self.param_changes
                .add_point(info.id, 0, (program as f64 / steps).clamp(0.0, 1.0));
        }
    }
}

impl PluginInstance for Vst3PluginInstance {
    fn catalog_entry(&self) -> &PluginCatalogEntry {
        &self.entry
    }

    fn requires_ui_thread_on(&self) -> UiThreadRequirement {
        UiThreadRequirement::AllNonAudioOperations
    }

    fn configure(&mut self, request: &ConfigurationRequest) -> Result<(), HostError> {
        self.service_handler_inbox();

        let mut setup: ProcessSetup = unsafe { std::mem::zeroed() };
        setup.processMode = if request.offline_mode {
            ProcessModes_::kOffline as i32
        } else {
            ProcessModes_::kRealtime as i32
        };
        setup.symbolicSampleSize = match request.content_type {
            AudioContentType::Float64 => SymbolicSampleSizes_::kSample64 as i32,
            AudioContentType::Float32 => SymbolicSampleSizes_::kSample32 as i32,
        };
        if setup.symbolicSampleSize == SymbolicSampleSizes_::kSample64 as i32 {
            let supported = unsafe {
                self.processor
                    .canProcessSampleSize(SymbolicSampleSizes_::kSample64 as i32)
            };
            if supported != kResultOk {
                log::warn!(
                    "{}: 64-bit processing unsupported; falling back to 32-bit",
                    self.entry.display_name
                );
                setup.symbolicSampleSize = SymbolicSampleSizes_::kSample32 as i32;
            }
        }
        setup.maxSamplesPerBlock = request.buffer_size_frames as i32;
        setup.sampleRate = request.sample_rate as f64;

        // Try to pin the main buses to the requested channel counts; on
        // refusal log and re-inspect whatever the plugin kept.
        if request.main_input_channels.is_some() || request.main_output_channels.is_some() {
            let mut inputs: Vec<SpeakerArrangement> = self
                .buses
                .input_buses
                .iter()
                .map(|bus| arrangement_for_channels(bus.channels()))
                .collect();
            let mut outputs: Vec<SpeakerArrangement> = self
                .buses
                .output_buses
                .iter()
                .map(|bus| arrangement_for_channels(bus.channels()))
                .collect();
            if let (Some(channels), Some(first)) =
                (request.main_input_channels, inputs.first_mut())
            {
                *first = arrangement_for_channels(channels);
            }
            if let (Some(channels), Some(first)) =
                (request.main_output_channels, outputs.first_mut())
            {
                *first = arrangement_for_channels(channels);
            }
            let result = unsafe {
                self.processor.setBusArrangements(
                    inputs.as_mut_ptr(),
                    inputs.len() as i32,
                    outputs.as_mut_ptr(),
                    outputs.len() as i32,
                )
            };
            if result != kResultOk {
                log::warn!(
                    "{}: setBusArrangements refused ({result:#x}); keeping plugin layout",
                    self.entry.display_name
                );
            }
        }
        self.inspect_buses();
        self.activate_all_buses(true);
        self.allocate_process_buffers(request.buffer_size_frames);

        self.process_data = unsafe { std::mem::zeroed() };
        self.process_data.processMode = setup.processMode;
        self.process_data.symbolicSampleSize = setup.symbolicSampleSize;

        self.process_setup = setup;
        self.has_process_setup = true;
        Ok(())
    }

    fn start_processing(&mut self) -> Result<(), HostError> {
        if !self.has_process_setup {
            return Err(HostError::FailedToStartProcessing(
                "start_processing before configure".to_string(),
            ));
        }
        self.service_handler_inbox();

        let mut setup_result = kResultOk;
        let mut activation_result = kResultOk;
        {
            let wrapped = crate::event_loop::MainThreadSafe((
                self.processor.clone(),
                self.component.clone(),
            ));
            let mut setup = self.process_setup;
            run_task_on_main_thread(|| {
                let (processor, component) = &wrapped.0;
                unsafe {
                    setup_result = processor.setupProcessing(&mut setup as *mut ProcessSetup);
                    if setup_result == kResultOk {
                        activation_result = component.setActive(1);
                    }
                }
            });
        }
        if setup_result != kResultOk {
            return Err(HostError::FailedToStartProcessing(format!(
                "setupProcessing: {setup_result:#x}"
            )));
        }
        if activation_result != kResultOk {
            return Err(HostError::FailedToStartProcessing(format!(
                "setActive: {activation_result:#x}"
            )));
        }
        self.component_active = true;

        let result = unsafe { self.processor.setProcessing(1) };
        // Some plugins do not implement setProcessing; that is not a
        // reason to refuse them.
        if result != kResultOk && result != kNotImplemented {
            unsafe {
                self.component.setActive(0);
            }
            self.component_active = false;
            return Err(HostError::FailedToStartProcessing(format!(
                "setProcessing: {result:#x}"
            )));
        }
        self.processing_active = result == kResultOk;
        Ok(())
    }

    fn stop_processing(&mut self) -> Result<(), HostError> {
        let result = unsafe { self.processor.setProcessing(0) };
        if result == kResultOk {
            self.processing_active = false;
        } else if result != kNotImplemented {
            return Err(HostError::FailedToStopProcessing(format!(
                "setProcessing(false): {result:#x}"
            )));
        }

        let mut deactivation = kResultOk;
        {
            let wrapped = crate::event_loop::MainThreadSafe(self.component.clone());
            run_task_on_main_thread(|| {
                let component = &wrapped.0;
                unsafe {
                    deactivation = component.setActive(0);
                }
            });
        }
        if deactivation == kResultOk {
            self.component_active = false;
        } else {
            log::warn!(
                "{}: setActive(false) failed: {deactivation:#x}",
                self.entry.display_name
            );
        }
        self.service_handler_inbox();
        Ok(())
    }

    fn process(&mut self, context: &mut AudioProcessContext) -> Result<(), HostError> {
        let frames = context.frame_count();
        self.refresh_audio_pointers(context);
        self.update_process_context(context);

        self.input_events.clear();
        {
            let translator_ppq = context.master().ppq_position();
            let mut translator = Vst3EventTranslator {
                events: &self.input_events,
                param_changes: &self.input_param_changes,
                instance: self,
                ppq_position: translator_ppq,
            };
            dispatch_ump_bytes(context.event_in().bytes(), &mut translator);
        }
        self.drain_pending_edits();

        self.process_data.numSamples = frames as i32;
        self.process_data.numInputs = self.bus_buffers_in.len() as i32;
        self.process_data.numOutputs = self.bus_buffers_out.len() as i32;
        self.process_data.inputs = if self.bus_buffers_in.is_empty() {
            std::ptr::null_mut()
        } else {
            self.bus_buffers_in.as_mut_ptr()
        };
        self.process_data.outputs = if self.bus_buffers_out.is_empty() {
            std::ptr::null_mut()
        } else {
            self.bus_buffers_out.as_mut_ptr()
        };
        self.process_data.inputEvents = self.input_events_raw;
        self.process_data.outputEvents = self.output_events_raw;
        self.process_data.inputParameterChanges = self.input_param_changes_raw;
        self.process_data.outputParameterChanges = self.output_param_changes_raw;
        self.process_data.processContext = &mut self.process_context;

        let result = unsafe { self.processor.process(&mut self.process_data) };

        self.input_param_changes.clear();
        self.input_events.clear();

        if result != kResultOk {
            self.output_events.clear();
            self.output_param_changes.clear();
            return Err(HostError::FailedToProcess(format!(
                "process: {result:#x}"
            )));
        }

        self.reflect_outputs(context);
        self.continuous_time_samples += frames as i64;
        Ok(())
    }

    fn parameters(&mut self) -> Result<Vec<PluginParameter>, HostError> {
        self.service_handler_inbox();
        self.rebuild_param_cache();
        let mut out = Vec::with_capacity(self.params.len());
        for (index, info) in self.params.iter().enumerate() {
            let (min_plain, max_plain, default_plain) = unsafe {
                (
                    self.controller.normalizedParamToPlain(info.id, 0.0),
                    self.controller.normalizedParamToPlain(info.id, 1.0),
                    self.controller
                        .normalizedParamToPlain(info.id, info.default_normalized),
                )
            };
            let flags = info.flags;
            let enumerations = Vec::new();
            out.push(PluginParameter {
                index: index as u32,
                stable_id: info.id,
                name: info.name.clone(),
                path: info.path.clone(),
                default_plain,
                min_plain,
                max_plain,
                flags: ParameterFlags {
                    automatable: flags & ParameterInfo_::ParameterFlags_::kCanAutomate as i32 != 0,
                    readable: flags & ParameterInfo_::ParameterFlags_::kIsReadOnly as i32 == 0,
                    hidden: flags & ParameterInfo_::ParameterFlags_::kIsHidden as i32 != 0,
                    enumerated: flags & ParameterInfo_::ParameterFlags_::kIsList as i32 != 0,
                },
                enumerations,
            });
        }
        Ok(out)
    }

    fn get_parameter(&self, index: u32) -> Result<f64, HostError> {
        let info = self.param_info(index)?;
        unsafe {
            let normalized = self.controller.getParamNormalized(info.id);
            Ok(self.controller.normalizedParamToPlain(info.id, normalized))
        }
    }

    fn set_parameter(
        &mut self,
        index: u32,
        plain_value: f64,
        timestamp: u64,
    ) -> Result<(), HostError> {
        let info = self.param_info(index)?.clone();
        let normalized = unsafe {
            self.controller
                .plainParamToNormalized(info.id, plain_value)
        };
        self.input_param_changes
            .add_point(info.id, timestamp as i32, normalized);
        unsafe {
            self.controller.setParamNormalized(info.id, normalized);
        }
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
        let Some(type_id) = self
            .note_expression_type_by_index
            .get(&controller_index)
            .copied()
        else {
            return Err(HostError::NotImplemented);
        };
        let mut event: Event = unsafe { std::mem::zeroed() };
        event.busIndex = context.group as i32;
        event.r#type = kNoteExpressionValueEvent as u16;
        unsafe {
            event.__field0.noteExpressionValue.typeId = type_id;
            event.__field0.noteExpressionValue.noteId = context.note as i32;
            event.__field0.noteExpressionValue.value = value.clamp(0.0, 1.0);
        }
        self.input_events.push(event);
        Ok(())
    }

    fn parameter_events(&self) -> &Arc<ParameterEventHub> {
        &self.hub
    }

    fn save_state(&mut self) -> Result<Vec<u8>, HostError> {
        let mut component_state = Vec::new();
        let mut controller_state = Vec::new();
        {
            let wrapped = crate::event_loop::MainThreadSafe((
                self.component.clone(),
                self.controller.clone(),
            ));
            let component_state = &mut component_state;
            let controller_state = &mut controller_state;
            run_task_on_main_thread(move || {
                let (component, controller) = &wrapped.0;
                let stream = ComWrapper::new(VectorStream::default());
                unsafe {
                    let Some(stream_ptr) = stream.to_com_ptr::<vst3::Steinberg::IBStream>() else {
                        return;
                    };
                    if component.getState(stream_ptr.as_ptr()) != kResultOk {
                        log::error!("component state save failed");
                        return;
                    }
                    *component_state = stream.take_data();

                    let controller_stream = ComWrapper::new(VectorStream::default());
                    let Some(controller_ptr) =
                        controller_stream.to_com_ptr::<vst3::Steinberg::IBStream>()
                    else {
                        return;
                    };
                    let result = controller.getState(controller_ptr.as_ptr());
                    if result == kResultOk {
                        *controller_state = controller_stream.take_data();
                    } else if result != kNotImplemented {
                        log::error!("controller state save failed: {result:#x}");
                    }
                }
            });
        }

        if controller_state.is_empty() {
            return Ok(component_state);
        }

        let mut combined =
            Vec::with_capacity(STATE_HEADER_LEN + component_state.len() + controller_state.len());
        combined.extend_from_slice(&STATE_MAGIC);
        combined.extend_from_slice(&STATE_VERSION.to_le_bytes());
        combined.extend_from_slice(&(component_state.len() as u32).to_le_bytes());
        combined.extend_from_slice(&(controller_state.len() as u32).to_le_bytes());
        combined.extend_from_slice(&component_state);
        combined.extend_from_slice(&controller_state);
        Ok(combined)
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), HostError> {
        let (component_state, controller_state) = split_state_blob(data);

        let component = self.component.clone();
        let controller = self.controller.clone();
        let component_state = component_state.to_vec();
        let controller_state = controller_state.map(|s| s.to_vec());
        let wrapped = crate::event_loop::MainThreadSafe((component, controller));
        run_task_on_main_thread(move || {
            let (component, controller) = &wrapped.0;
            unsafe {
                let stream = ComWrapper::new(VectorStream::with_data(component_state.clone()));
                if let Some(stream_ptr) = stream.to_com_ptr::<vst3::Steinberg::IBStream>() {
                    if component.setState(stream_ptr.as_ptr()) != kResultOk {
                        log::error!("component state load failed");
                    }
                }
                let sync = ComWrapper::new(VectorStream::with_data(component_state));
                if let Some(sync_ptr) = sync.to_com_ptr::<vst3::Steinberg::IBStream>() {
                    controller.setComponentState(sync_ptr.as_ptr());
                }
                if let Some(controller_state) = controller_state {
                    let stream = ComWrapper::new(VectorStream::with_data(controller_state));
                    if let Some(stream_ptr) = stream.to_com_ptr::<vst3::Steinberg::IBStream>() {
                        controller.setState(stream_ptr.as_ptr());
                    }
                }
            }
        });
        Ok(())
    }

    fn audio_buses(&self) -> &AudioBusesInfo {
        &self.buses
    }

    fn create_ui(&mut self) -> Result<PluginUiHandle, HostError> {
        unsafe {
            let view_ptr = self.controller.createView(c"editor".as_ptr());
            if view_ptr.is_null() {
                return Err(HostError::NotImplemented);
            }
            let view = ComPtr::from_raw(view_ptr)
                .ok_or_else(|| HostError::NoInterface("IPlugView".to_string()))?;
            let mut rect = vst3::Steinberg::ViewRect {
                left: 0,
                top: 0,
                right: 0,
                bottom: 0,
            };
            let _ = view.getSize(&mut rect);
            let handle = PluginUiHandle {
                native_view: view.as_ptr() as *mut c_void,
                width: (rect.right - rect.left).max(0) as u32,
                height: (rect.bottom - rect.top).max(0) as u32,
            };
            self.ui_view = Some(view);
            Ok(handle)
        }
    }

    fn destroy_ui(&mut self) {
        if let Some(view) = self.ui_view.take() {
            unsafe {
                view.removed();
            }
        }
    }
}

fn split_state_blob(data: &[u8]) -> (&[u8], Option<&[u8]>) {
    if data.len() >= STATE_HEADER_LEN && data[0..4] == STATE_MAGIC {
        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let component_len =
            u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
        let controller_len =
            u32::from_le_bytes([data[12], data[13], data[14], data[15]]) as usize;
        let total = STATE_HEADER_LEN + component_len + controller_len;
        if version == STATE_VERSION && data.len() >= total {
            let component = &data[STATE_HEADER_LEN..STATE_HEADER_LEN + component_len];
            let controller = if controller_len > 0 {
                Some(&data[STATE_HEADER_LEN + component_len..total])
            } else {
                None
            };
            return (component, controller);
        }
        log::warn!("truncated state blob; loading as bare component state");
    }
    (data, None)
}

impl Drop for Vst3PluginInstance {
    fn drop(&mut self) {
        self.handler.disarm();
        if self.processing_active {
            unsafe {
                self.processor.setProcessing(0);
            }
            self.processing_active = false;
        }

        let component = self.component.clone();
        let controller = self.controller.clone();
        let controller_distinct = self.controller_distinct;
        let connection_component = self.connection_component.take();
        let connection_controller = self.connection_controller.take();
        let wrapped = crate::event_loop::MainThreadSafe((
            component,
            controller,
            connection_component,
            connection_controller,
        ));
        run_task_on_main_thread(move || {
            let (component, controller, connection_component, connection_controller) = &wrapped.0;
            unsafe {
                component.setActive(0);
                if controller_distinct {
                    if let (Some(conn_comp), Some(conn_edit)) =
                        (connection_component, connection_controller)
                    {
                        conn_edit.disconnect(conn_comp.as_ptr());
                        conn_comp.disconnect(conn_edit.as_ptr());
                    }
                }
                controller.setComponentHandler(std::ptr::null_mut());
                if controller_distinct {
                    controller.terminate();
                }
                component.terminate();
            }
        });

        unsafe {
            // Release the refs taken for the process-data wiring.
            for raw in [
                self.input_events_raw as *mut c_void,
                self.output_events_raw as *mut c_void,
            ] {
                if !raw.is_null() {
                    drop(ComPtr::<IEventList>::from_raw(raw as *mut IEventList));
                }
            }
            for raw in [self.input_param_changes_raw, self.output_param_changes_raw] {
                if !raw.is_null() {
                    drop(ComPtr::<IParameterChanges>::from_raw(raw));
                }
            }
            if !self.host_context_raw.is_null() {
                drop(ComPtr::<vst3::Steinberg::FUnknown>::from_raw(
                    self.host_context_raw,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_blob_header_round_trip() {
        let component = vec![1u8, 2, 3, 4, 5];
        let controller = vec![9u8, 8, 7];
        let mut blob = Vec::new();
        blob.extend_from_slice(&STATE_MAGIC);
        blob.extend_from_slice(&STATE_VERSION.to_le_bytes());
        blob.extend_from_slice(&(component.len() as u32).to_le_bytes());
        blob.extend_from_slice(&(controller.len() as u32).to_le_bytes());
        blob.extend_from_slice(&component);
        blob.extend_from_slice(&controller);

        let (parsed_component, parsed_controller) = split_state_blob(&blob);
        assert_eq!(parsed_component, component.as_slice());
        assert_eq!(parsed_controller, Some(controller.as_slice()));
    }

    #[test]
    fn test_bare_component_blob_reads_without_header() {
        let bare = vec![0x10u8, 0x20, 0x30];
        let (component, controller) = split_state_blob(&bare);
        assert_eq!(component, bare.as_slice());
        assert!(controller.is_none());
    }

    #[test]
    fn test_arrangements() {
        assert_eq!(arrangement_for_channels(0), 0);
        assert_eq!(arrangement_for_channels(1), SPEAKER_ARR_MONO);
        assert_eq!(arrangement_for_channels(2), SPEAKER_ARR_STEREO);
        assert_eq!(arrangement_for_channels(4), 0xF);
    }
}
