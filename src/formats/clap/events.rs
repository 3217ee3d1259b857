//! CLAP event lists and UMP ↔ CLAP event translation.
//!
//! The host owns one input and one output event queue per instance; both are
//! pinned so the `clap_input_events` / `clap_output_events` vtables can hand
//! the plugin stable context pointers. Events are stored as a tagged enum,
//! trading memory for simple and correct header handling.

use std::ffi::c_void;
use std::pin::Pin;
use std::ptr::null_mut;
use std::sync::Mutex;

use clap_sys::events::{
    clap_event_header, clap_event_midi, clap_event_note, clap_event_note_expression,
    clap_event_param_mod, clap_event_param_value, clap_input_events, clap_output_events,
    CLAP_CORE_EVENT_SPACE_ID, CLAP_EVENT_MIDI, CLAP_EVENT_NOTE_CHOKE, CLAP_EVENT_NOTE_END,
    CLAP_EVENT_NOTE_EXPRESSION, CLAP_EVENT_NOTE_OFF, CLAP_EVENT_NOTE_ON, CLAP_EVENT_PARAM_MOD,
    CLAP_EVENT_PARAM_VALUE, CLAP_NOTE_EXPRESSION_PRESSURE,
};

use crate::ump::UmpDispatcher;

/// An event sent to or received from the plugin.
#[derive(Clone, Copy)]
#[repr(C, align(8))]
pub enum ClapEvent {
    Note(clap_event_note),
    NoteExpression(clap_event_note_expression),
    Midi(clap_event_midi),
    ParamValue(clap_event_param_value),
    ParamMod(clap_event_param_mod),
    Unknown(clap_event_header),
}

impl ClapEvent {
    pub fn header(&self) -> &clap_event_header {
        match self {
            ClapEvent::Note(event) => &event.header,
            ClapEvent::NoteExpression(event) => &event.header,
            ClapEvent::Midi(event) => &event.header,
            ClapEvent::ParamValue(event) => &event.header,
            ClapEvent::ParamMod(event) => &event.header,
            ClapEvent::Unknown(header) => header,
        }
    }

    /// Copy a plugin-provided event out of its header pointer.
    ///
    /// # Safety
    /// `ptr` must point at a valid event whose size matches its type.
    pub unsafe fn from_header_ptr(ptr: *const clap_event_header) -> Option<Self> {
        if ptr.is_null() {
            return None;
        }
        let header = *ptr;
        if header.space_id != CLAP_CORE_EVENT_SPACE_ID {
            return Some(ClapEvent::Unknown(header));
        }
        Some(match header.type_ {
            CLAP_EVENT_NOTE_ON | CLAP_EVENT_NOTE_OFF | CLAP_EVENT_NOTE_CHOKE
            | CLAP_EVENT_NOTE_END => ClapEvent::Note(*(ptr as *const clap_event_note)),
            CLAP_EVENT_NOTE_EXPRESSION => {
                ClapEvent::NoteExpression(*(ptr as *const clap_event_note_expression))
            }
            CLAP_EVENT_MIDI => ClapEvent::Midi(*(ptr as *const clap_event_midi)),
            CLAP_EVENT_PARAM_VALUE => {
                ClapEvent::ParamValue(*(ptr as *const clap_event_param_value))
            }
            CLAP_EVENT_PARAM_MOD => ClapEvent::ParamMod(*(ptr as *const clap_event_param_mod)),
            _ => ClapEvent::Unknown(header),
        })
    }
}

fn header(size: usize, type_: u16) -> clap_event_header {
    clap_event_header {
        size: size as u32,
        time: 0,
        space_id: CLAP_CORE_EVENT_SPACE_ID,
        type_,
        flags: 0,
    }
}

pub fn note_event(type_: u16, channel: u8, key: u8, velocity: f64) -> clap_event_note {
    clap_event_note {
        header: header(std::mem::size_of::<clap_event_note>(), type_),
        note_id: -1,
        port_index: 0,
        channel: channel as i16,
        key: key as i16,
        velocity,
    }
}

pub fn note_expression_event(
    expression_id: i32,
    channel: i16,
    key: i16,
    value: f64,
) -> clap_event_note_expression {
    clap_event_note_expression {
        header: header(
            std::mem::size_of::<clap_event_note_expression>(),
            CLAP_EVENT_NOTE_EXPRESSION,
        ),
        expression_id,
        note_id: -1,
        port_index: 0,
        channel,
        key,
        value,
    }
}

pub fn midi_event(data: [u8; 3]) -> clap_event_midi {
    clap_event_midi {
        header: header(std::mem::size_of::<clap_event_midi>(), CLAP_EVENT_MIDI),
        port_index: 0,
        data,
    }
}

pub fn param_value_event(
    param_id: u32,
    cookie: *mut c_void,
    channel: i16,
    key: i16,
    value: f64,
) -> clap_event_param_value {
    clap_event_param_value {
        header: header(
            std::mem::size_of::<clap_event_param_value>(),
            CLAP_EVENT_PARAM_VALUE,
        ),
        param_id,
        cookie,
        note_id: -1,
        port_index: 0,
        channel,
        key,
        value,
    }
}

/// Event queue usable as both a `clap_input_events` and a
/// `clap_output_events`. Pinned so the vtable context pointers stay valid.
pub struct EventQueue {
    vtable_input: clap_input_events,
    vtable_output: clap_output_events,
    events: Mutex<Vec<ClapEvent>>,
}

// The queue is only shared with the plugin through the vtables, whose
// callbacks take the mutex.
unsafe impl Send for EventQueue {}
unsafe impl Sync for EventQueue {}

impl EventQueue {
    pub fn new() -> Pin<Box<Self>> {
        let mut queue = Box::pin(Self {
            vtable_input: clap_input_events {
                ctx: null_mut(),
                size: Some(Self::size),
                get: Some(Self::get),
            },
            vtable_output: clap_output_events {
                ctx: null_mut(),
                try_push: Some(Self::try_push),
            },
            events: Mutex::new(Vec::with_capacity(256)),
        });
        let ctx = &*queue as *const Self as *mut c_void;
        // Safety: only the vtable context pointers are mutated; the data is
        // not moved.
        unsafe {
            let inner = Pin::get_unchecked_mut(queue.as_mut());
            inner.vtable_input.ctx = ctx;
            inner.vtable_output.ctx = ctx;
        }
        queue
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn push(&self, event: ClapEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn drain(&self) -> Vec<ClapEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn as_input(self: &Pin<Box<Self>>) -> *const clap_input_events {
        &self.vtable_input
    }

    pub fn as_output(self: &Pin<Box<Self>>) -> *const clap_output_events {
        &self.vtable_output
    }

    unsafe extern "C" fn size(list: *const clap_input_events) -> u32 {
        if list.is_null() || (*list).ctx.is_null() {
            return 0;
        }
        let this = &*((*list).ctx as *const Self);
        this.events.lock().unwrap().len() as u32
    }

    unsafe extern "C" fn get(
        list: *const clap_input_events,
        index: u32,
    ) -> *const clap_event_header {
        if list.is_null() || (*list).ctx.is_null() {
            return std::ptr::null();
        }
        let this = &*((*list).ctx as *const Self);
        let events = this.events.lock().unwrap();
        match events.get(index as usize) {
            Some(event) => event.header() as *const clap_event_header,
            None => std::ptr::null(),
        }
    }

    unsafe extern "C" fn try_push(
        list: *const clap_output_events,
        event: *const clap_event_header,
    ) -> bool {
        if list.is_null() || (*list).ctx.is_null() || event.is_null() {
            return false;
        }
        let this = &*((*list).ctx as *const Self);
        match ClapEvent::from_header_ptr(event) {
            Some(event) => {
                this.events.lock().unwrap().push(event);
                true
            }
            None => false,
        }
    }
}

/// Translates a block's UMP input into CLAP events. Assignable controllers
/// are handled by the node-level input mapper through the uniform contract,
/// so only notes, CC, pitch bend and pressure are converted here.
pub struct ClapEventTranslator<'a> {
    pub queue: &'a EventQueue,
}

impl UmpDispatcher for ClapEventTranslator<'_> {
    fn on_note_on(
        &mut self,
        _group: u8,
        channel: u8,
        note: u8,
        _attribute_type: u8,
        velocity: u16,
        _attribute: u16,
    ) {
        self.queue.push(ClapEvent::Note(note_event(
            CLAP_EVENT_NOTE_ON,
            channel,
            note,
            velocity as f64 / u16::MAX as f64,
        )));
    }

    fn on_note_off(
        &mut self,
        _group: u8,
        channel: u8,
        note: u8,
        _attribute_type: u8,
        velocity: u16,
        _attribute: u16,
    ) {
        self.queue.push(ClapEvent::Note(note_event(
            CLAP_EVENT_NOTE_OFF,
            channel,
            note,
            velocity as f64 / u16::MAX as f64,
        )));
    }

    fn on_cc(&mut self, _group: u8, channel: u8, index: u8, data: u32) {
        self.queue.push(ClapEvent::Midi(midi_event([
            0xB0 | (channel & 0x0F),
            index & 0x7F,
            (data >> 25) as u8,
        ])));
    }

    fn on_pitch_bend(&mut self, _group: u8, channel: u8, per_note: Option<u8>, data: u32) {
        if per_note.is_some() {
            // Per-note tuning needs a semitone range contract the UMP side
            // does not carry; dropped until the host grows one.
            return;
        }
        let value14 = (data >> 18) & 0x3FFF;
        self.queue.push(ClapEvent::Midi(midi_event([
            0xE0 | (channel & 0x0F),
            (value14 & 0x7F) as u8,
            ((value14 >> 7) & 0x7F) as u8,
        ])));
    }

    fn on_pressure(&mut self, _group: u8, channel: u8, per_note: Option<u8>, data: u32) {
        let value = data as f64 / u32::MAX as f64;
        match per_note {
            Some(note) => self.queue.push(ClapEvent::NoteExpression(
                note_expression_event(
                    CLAP_NOTE_EXPRESSION_PRESSURE,
                    channel as i16,
                    note as i16,
                    value,
                ),
            )),
            None => self.queue.push(ClapEvent::Midi(midi_event([
                0xD0 | (channel & 0x0F),
                (data >> 25) as u8,
                0,
            ]))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ump::{dispatch_ump_bytes, write_ump, Ump};

    fn translate(umps: &[Ump]) -> Vec<ClapEvent> {
        let queue = EventQueue::new();
        let mut bytes = Vec::new();
        for ump in umps {
            let mut buf = [0u8; 16];
            write_ump(&mut buf, 0, ump);
            bytes.extend_from_slice(&buf[..ump.size_in_bytes()]);
        }
        let mut translator = ClapEventTranslator { queue: &queue };
        dispatch_ump_bytes(&bytes, &mut translator);
        queue.drain()
    }

    #[test]
    fn test_note_translation() {
        let events = translate(&[
            Ump::midi2_note_on(0, 3, 60, 0, 0xFFFF, 0),
            Ump::midi2_note_off(0, 3, 60, 0, 0, 0),
        ]);
        assert_eq!(events.len(), 2);
        match &events[0] {
            ClapEvent::Note(note) => {
                assert_eq!(note.header.type_, CLAP_EVENT_NOTE_ON);
                assert_eq!(note.key, 60);
                assert_eq!(note.channel, 3);
                assert!((note.velocity - 1.0).abs() < 1e-9);
            }
            _ => panic!("expected note event"),
        }
        match &events[1] {
            ClapEvent::Note(note) => assert_eq!(note.header.type_, CLAP_EVENT_NOTE_OFF),
            _ => panic!("expected note event"),
        }
    }

    #[test]
    fn test_poly_pressure_becomes_note_expression() {
        let events = translate(&[Ump::midi2_poly_pressure(0, 0, 64, u32::MAX / 2)]);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ClapEvent::NoteExpression(expression) => {
                assert_eq!(expression.expression_id, CLAP_NOTE_EXPRESSION_PRESSURE);
                assert_eq!(expression.key, 64);
                assert!((expression.value - 0.5).abs() < 1e-6);
            }
            _ => panic!("expected note expression"),
        }
    }

    #[test]
    fn test_queue_vtable_round_trip() {
        let queue = EventQueue::new();
        queue.push(ClapEvent::Note(note_event(CLAP_EVENT_NOTE_ON, 0, 61, 0.5)));
        unsafe {
            let input = queue.as_input();
            assert_eq!(((*input).size.unwrap())(input), 1);
            let header = ((*input).get.unwrap())(input, 0);
            assert_eq!((*header).type_, CLAP_EVENT_NOTE_ON);
            assert!(((*input).get.unwrap())(input, 5).is_null());
        }
    }

    #[test]
    fn test_output_try_push() {
        let queue = EventQueue::new();
        let note = note_event(CLAP_EVENT_NOTE_ON, 1, 70, 0.25);
        unsafe {
            let output = queue.as_output();
            assert!(((*output).try_push.unwrap())(
                output,
                &note.header as *const clap_event_header
            ));
        }
        let events = queue.drain();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ClapEvent::Note(event) => assert_eq!(event.key, 70),
            _ => panic!("expected note event"),
        }
    }
}
