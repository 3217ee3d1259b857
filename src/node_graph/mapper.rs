//! UMP ↔ uniform-contract mapping at the node boundary.
//!
//! The input mapper turns assignable-controller traffic into parameter and
//! preset operations on the uniform contract: an NRPN with bank/index forms
//! the parameter index `bank * 128 + index`, a per-note AC becomes a
//! per-note controller write, a program change loads a preset. Notes, CC,
//! pitch bend and pressure stay with the format adapters, which translate
//! them into native events during `process`.
//!
//! The output mapper is the reverse direction: it subscribes to a plugin's
//! parameter and per-note-controller signals and encodes each notification
//! as an NRPN or per-note AC handed to an external MIDI sink.

use std::sync::Arc;

use crate::plugin::params::{ParameterEventHub, PerNoteControllerContext, PluginParameter};
use crate::plugin::PluginInstance;
use crate::ump::{dispatch_ump_bytes, EventSequence, Ump, UmpDispatcher};

/// Cached parameter metadata used to convert between the 32-bit controller
/// domain and plain parameter values.
#[derive(Default)]
pub struct NodeUmpInputMapper {
    parameters: Vec<PluginParameter>,
}

impl NodeUmpInputMapper {
    pub fn new(parameters: Vec<PluginParameter>) -> Self {
        Self { parameters }
    }

    /// Rebuild the metadata cache; call after a parameter-list rebuild.
    pub fn refresh(&mut self, parameters: Vec<PluginParameter>) {
        self.parameters = parameters;
    }

    /// Apply every mappable message in `sequence` to `instance`.
    pub fn apply(
        &self,
        instance: &mut dyn PluginInstance,
        sequence: &EventSequence,
        timestamp: u64,
    ) {
        let mut sink = MapperSink {
            instance,
            parameters: &self.parameters,
            timestamp,
        };
        dispatch_ump_bytes(sequence.bytes(), &mut sink);
    }
}

struct MapperSink<'a> {
    instance: &'a mut dyn PluginInstance,
    parameters: &'a [PluginParameter],
    timestamp: u64,
}

impl MapperSink<'_> {
    fn plain_from_normalized(&self, index: u32, normalized: f64) -> f64 {
        match self.parameters.iter().find(|p| p.index == index) {
            Some(param) => param.normalized_to_plain(normalized),
            None => normalized,
        }
    }

    fn normalized_from_plain(&self, index: u32, plain: f64) -> f64 {
        match self.parameters.iter().find(|p| p.index == index) {
            Some(param) => param.plain_to_normalized(plain),
            None => plain,
        }
    }
}

impl UmpDispatcher for MapperSink<'_> {
    fn on_ac(&mut self, _group: u8, _channel: u8, bank: u8, index: u8, data: u32, relative: bool) {
        // The assignable-controller address space carries 14 bits; parameter
        // index = bank * 128 + index.
        let parameter_index = (bank as u32) * 128 + index as u32;
        let normalized = if relative {
            let current = match self.instance.get_parameter(parameter_index) {
                Ok(plain) => self.normalized_from_plain(parameter_index, plain),
                Err(_) => return,
            };
            (current + (data as i32) as f64 / i32::MAX as f64).clamp(0.0, 1.0)
        } else {
            data as f64 / u32::MAX as f64
        };
        let plain = self.plain_from_normalized(parameter_index, normalized);
        if let Err(err) = self
            .instance
            .set_parameter(parameter_index, plain, self.timestamp)
        {
            log::debug!("assignable controller ignored: {err}");
        }
    }

    fn on_pnac(&mut self, group: u8, channel: u8, note: u8, index: u8, data: u32) {
        let context = PerNoteControllerContext {
            group,
            channel,
            note,
        };
        let value = data as f64 / u32::MAX as f64;
        if let Err(err) =
            self.instance
                .set_per_note_controller(context, index as u32, value, self.timestamp)
        {
            log::debug!("per-note controller ignored: {err}");
        }
    }

    fn on_program_change(
        &mut self,
        _group: u8,
        _channel: u8,
        flags: u8,
        program: u8,
        bank_msb: u8,
        bank_lsb: u8,
    ) {
        // Bank MSB/LSB and program form a 21-bit preset index; without the
        // bank-valid flag only the program number counts.
        let index = if flags & 0x01 != 0 {
            (((bank_msb as u32) << 7 | bank_lsb as u32) << 7) | program as u32
        } else {
            program as u32
        };
        if let Err(err) = self.instance.load_preset(index) {
            if !err.is_not_implemented() {
                log::debug!("program change ignored: {err}");
            }
        }
    }
}

/// External sink for host-produced UMP bytes (a virtual MIDI device or a
/// host callback).
pub type MidiOutputSink = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Subscribes to a plugin's parameter signals and reflects them as UMP.
pub struct NodeUmpOutputMapper {
    hub: Arc<ParameterEventHub>,
    sink: MidiOutputSink,
    value_token: u64,
    per_note_token: u64,
}

impl NodeUmpOutputMapper {
    pub fn new(hub: Arc<ParameterEventHub>, sink: MidiOutputSink) -> Self {
        let value_sink = sink.clone();
        let value_token = hub.add_value_listener(move |index, value| {
            if index >= 1 << 14 {
                return;
            }
            let bank = ((index >> 7) & 0x7F) as u8;
            let controller = (index & 0x7F) as u8;
            let data = (value.clamp(0.0, 1.0) * u32::MAX as f64) as u32;
            send_ump(&value_sink, Ump::midi2_nrpn(0, 0, bank, controller, data));
        });
        let per_note_sink = sink.clone();
        let per_note_token = hub.add_per_note_listener(move |context, index, value| {
            if index >= 1 << 7 {
                return;
            }
            let data = (value.clamp(0.0, 1.0) * u32::MAX as f64) as u32;
            send_ump(
                &per_note_sink,
                Ump::midi2_per_note_acc(context.group, context.channel, context.note, index as u8, data),
            );
        });
        Self {
            hub,
            sink,
            value_token,
            per_note_token,
        }
    }

    /// Emit a MIDI 2.0 program change for a preset load.
    pub fn send_preset_index(&self, index: u32) {
        let program = (index & 0x7F) as u8;
        let bank_index = index >> 7;
        let bank_msb = ((bank_index >> 7) & 0x7F) as u8;
        let bank_lsb = (bank_index & 0x7F) as u8;
        send_ump(
            &self.sink,
            Ump::midi2_program_change(0, 0, 0x01, program, bank_msb, bank_lsb),
        );
    }
}

impl Drop for NodeUmpOutputMapper {
    fn drop(&mut self) {
        self.hub.remove_value_listener(self.value_token);
        self.hub.remove_per_note_listener(self.per_note_token);
    }
}

fn send_ump(sink: &MidiOutputSink, ump: Ump) {
    let mut buf = [0u8; 16];
    crate::ump::write_ump(&mut buf, 0, &ump);
    sink(&buf[..ump.size_in_bytes()]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPluginInstance;
    use crate::ump::iter_ump_bytes;
    use std::sync::Mutex;

    #[test]
    fn test_nrpn_sets_parameter_by_bank_index() {
        let mut instance = MockPluginInstance::instrument("m");
        let shared = instance.shared();
        let mapper = NodeUmpInputMapper::new(instance.parameters().unwrap());
        let mut seq = EventSequence::with_capacity(64);
        // bank 0, index 1 → parameter index 1; mid-scale value.
        seq.append(&Ump::midi2_nrpn(0, 0, 0, 1, u32::MAX / 2)).unwrap();
        mapper.apply(&mut instance, &seq, 0);
        let writes = shared.parameter_writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, 1);
        assert!((writes[0].1 - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_relative_nrpn_adds_to_current() {
        let mut instance = MockPluginInstance::instrument("m");
        instance.set_parameter(1, 0.5, 0).unwrap();
        let shared = instance.shared();
        shared.parameter_writes.lock().unwrap().clear();
        let mapper = NodeUmpInputMapper::new(instance.parameters().unwrap());
        let mut seq = EventSequence::with_capacity(64);
        let delta = (i32::MAX / 4) as u32;
        seq.append(&Ump::midi2_relative_nrpn(0, 0, 0, 1, delta)).unwrap();
        mapper.apply(&mut instance, &seq, 0);
        let writes = shared.parameter_writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert!((writes[0].1 - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_pnac_reaches_per_note_controller() {
        let mut instance = MockPluginInstance::instrument("m");
        let shared = instance.shared();
        let mapper = NodeUmpInputMapper::default();
        let mut seq = EventSequence::with_capacity(64);
        seq.append(&Ump::midi2_per_note_acc(0, 0, 61, 3, u32::MAX)).unwrap();
        mapper.apply(&mut instance, &seq, 0);
        let writes = shared.per_note_writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, 61);
        assert_eq!(writes[0].1, 3);
        assert!((writes[0].2 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_output_mapper_encodes_nrpn() {
        let instance = MockPluginInstance::instrument("m");
        let hub = instance.parameter_events().clone();
        let seen: Arc<Mutex<Vec<Ump>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let sink: MidiOutputSink = Arc::new(move |bytes| {
            captured.lock().unwrap().extend(iter_ump_bytes(bytes));
        });
        let _mapper = NodeUmpOutputMapper::new(hub.clone(), sink);
        hub.notify_value(396, 0.5);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status_code(), crate::ump::status::NRPN);
        assert_eq!(seen[0].data1(), 3);
        assert_eq!(seen[0].data2(), 12);
        let value = seen[0].data_word() as f64 / u32::MAX as f64;
        assert!((value - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_output_mapper_unsubscribes_on_drop() {
        let instance = MockPluginInstance::instrument("m");
        let hub = instance.parameter_events().clone();
        let seen: Arc<Mutex<Vec<Ump>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let sink: MidiOutputSink = Arc::new(move |bytes| {
            captured.lock().unwrap().extend(iter_ump_bytes(bytes));
        });
        let mapper = NodeUmpOutputMapper::new(hub.clone(), sink);
        drop(mapper);
        hub.notify_value(1, 0.5);
        assert!(seen.lock().unwrap().is_empty());
    }
}
