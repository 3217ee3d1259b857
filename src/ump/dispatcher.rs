//! Format-agnostic UMP input decoding.
//!
//! The adapters drain a block's input event sequence through
//! [`dispatch_ump_bytes`], which decodes each message and invokes the
//! matching category callback on a [`UmpDispatcher`]. Each adapter implements
//! the trait on a short-lived translator that borrows whatever ABI state it
//! needs (event lists, cached controller mappings), keeping the decode loop
//! in one place.

use crate::ump::{iter_ump_bytes, message_type, status, Ump};

/// Per-category sink for decoded MIDI 2.0 channel-voice messages. All
/// callbacks default to no-ops so translators only override what their
/// format can express.
#[allow(unused_variables)]
pub trait UmpDispatcher {
    fn on_note_on(
        &mut self,
        group: u8,
        channel: u8,
        note: u8,
        attribute_type: u8,
        velocity: u16,
        attribute: u16,
    ) {
    }

    fn on_note_off(
        &mut self,
        group: u8,
        channel: u8,
        note: u8,
        attribute_type: u8,
        velocity: u16,
        attribute: u16,
    ) {
    }

    /// Assignable controller (NRPN). `relative` marks RELATIVE_NRPN.
    fn on_ac(&mut self, group: u8, channel: u8, bank: u8, index: u8, data: u32, relative: bool) {}

    /// Registered controller (RPN). `relative` marks RELATIVE_RPN.
    fn on_rc(&mut self, group: u8, channel: u8, bank: u8, index: u8, data: u32, relative: bool) {}

    fn on_cc(&mut self, group: u8, channel: u8, index: u8, data: u32) {}

    /// Per-note assignable controller.
    fn on_pnac(&mut self, group: u8, channel: u8, note: u8, index: u8, data: u32) {}

    /// Per-note registered controller.
    fn on_pnrc(&mut self, group: u8, channel: u8, note: u8, index: u8, data: u32) {}

    /// Channel pitch bend, or per-note pitch bend when `per_note` is set.
    fn on_pitch_bend(&mut self, group: u8, channel: u8, per_note: Option<u8>, data: u32) {}

    /// Channel pressure, or polyphonic pressure when `per_note` is set.
    fn on_pressure(&mut self, group: u8, channel: u8, per_note: Option<u8>, data: u32) {}

    fn on_program_change(
        &mut self,
        group: u8,
        channel: u8,
        flags: u8,
        program: u8,
        bank_msb: u8,
        bank_lsb: u8,
    ) {
    }
}

/// Decode every complete message in `bytes` and dispatch it to `sink`.
/// MIDI 1.0 channel-voice messages are widened to MIDI 2.0 semantics so
/// translators only deal with one value range.
pub fn dispatch_ump_bytes(bytes: &[u8], sink: &mut dyn UmpDispatcher) {
    for ump in iter_ump_bytes(bytes) {
        dispatch_one(&ump, sink);
    }
}

fn dispatch_one(ump: &Ump, sink: &mut dyn UmpDispatcher) {
    match ump.message_type() {
        message_type::MIDI2_CHANNEL_VOICE => dispatch_midi2(ump, sink),
        message_type::MIDI1_CHANNEL_VOICE => dispatch_midi1(ump, sink),
        _ => {}
    }
}

fn dispatch_midi2(ump: &Ump, sink: &mut dyn UmpDispatcher) {
    let group = ump.group();
    let channel = ump.channel();
    match ump.status_code() {
        status::NOTE_ON => {
            // A MIDI 2.0 note on with zero velocity is a note off.
            if ump.midi2_velocity() == 0 {
                sink.on_note_off(
                    group,
                    channel,
                    ump.data1(),
                    ump.midi2_attribute_type(),
                    0,
                    ump.midi2_note_attribute(),
                );
            } else {
                sink.on_note_on(
                    group,
                    channel,
                    ump.data1(),
                    ump.midi2_attribute_type(),
                    ump.midi2_velocity(),
                    ump.midi2_note_attribute(),
                );
            }
        }
        status::NOTE_OFF => sink.on_note_off(
            group,
            channel,
            ump.data1(),
            ump.midi2_attribute_type(),
            ump.midi2_velocity(),
            ump.midi2_note_attribute(),
        ),
        status::NRPN => sink.on_ac(group, channel, ump.data1(), ump.data2(), ump.data_word(), false),
        status::RELATIVE_NRPN => {
            sink.on_ac(group, channel, ump.data1(), ump.data2(), ump.data_word(), true)
        }
        status::RPN => sink.on_rc(group, channel, ump.data1(), ump.data2(), ump.data_word(), false),
        status::RELATIVE_RPN => {
            sink.on_rc(group, channel, ump.data1(), ump.data2(), ump.data_word(), true)
        }
        status::CC => sink.on_cc(group, channel, ump.data1(), ump.data_word()),
        status::PER_NOTE_ACC => {
            sink.on_pnac(group, channel, ump.data1(), ump.data2(), ump.data_word())
        }
        status::PER_NOTE_RCC => {
            sink.on_pnrc(group, channel, ump.data1(), ump.data2(), ump.data_word())
        }
        status::PITCH_BEND => sink.on_pitch_bend(group, channel, None, ump.data_word()),
        status::PER_NOTE_PITCH_BEND => {
            sink.on_pitch_bend(group, channel, Some(ump.data1()), ump.data_word())
        }
        status::CHANNEL_PRESSURE => sink.on_pressure(group, channel, None, ump.data_word()),
        status::POLY_PRESSURE => {
            sink.on_pressure(group, channel, Some(ump.data1()), ump.data_word())
        }
        status::PROGRAM_CHANGE => {
            let data = ump.data_word();
            sink.on_program_change(
                group,
                channel,
                ump.data2(),
                ((data >> 24) & 0x7F) as u8,
                ((data >> 8) & 0x7F) as u8,
                (data & 0x7F) as u8,
            );
        }
        _ => {}
    }
}

fn dispatch_midi1(ump: &Ump, sink: &mut dyn UmpDispatcher) {
    let group = ump.group();
    let channel = ump.channel();
    let data1 = ump.data1();
    let data2 = ump.data2();
    match ump.status_code() {
        status::NOTE_ON => {
            if data2 == 0 {
                sink.on_note_off(group, channel, data1, 0, 0, 0);
            } else {
                sink.on_note_on(group, channel, data1, 0, widen7_to_16(data2), 0);
            }
        }
        status::NOTE_OFF => sink.on_note_off(group, channel, data1, 0, widen7_to_16(data2), 0),
        status::CC => sink.on_cc(group, channel, data1, widen7_to_32(data2)),
        status::POLY_PRESSURE => {
            sink.on_pressure(group, channel, Some(data1), widen7_to_32(data2))
        }
        status::CHANNEL_PRESSURE => sink.on_pressure(group, channel, None, widen7_to_32(data1)),
        status::PITCH_BEND => {
            let value14 = ((data2 as u32) << 7) | data1 as u32;
            sink.on_pitch_bend(group, channel, None, value14 << 18);
        }
        status::PROGRAM_CHANGE => sink.on_program_change(group, channel, 0, data1, 0, 0),
        _ => {}
    }
}

fn widen7_to_16(value: u8) -> u16 {
    ((value as u16) << 9) | ((value as u16) << 2)
}

fn widen7_to_32(value: u8) -> u32 {
    (value as u32) << 25
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ump::write_ump;

    #[derive(Default)]
    struct Recorder {
        notes_on: Vec<(u8, u8, u8, u16)>,
        notes_off: Vec<(u8, u8, u8)>,
        acs: Vec<(u8, u8, u32, bool)>,
        pnacs: Vec<(u8, u8, u32)>,
        programs: Vec<(u8, u8, u8)>,
        pressures: Vec<(Option<u8>, u32)>,
    }

    impl UmpDispatcher for Recorder {
        fn on_note_on(&mut self, group: u8, channel: u8, note: u8, _t: u8, vel: u16, _a: u16) {
            self.notes_on.push((group, channel, note, vel));
        }
        fn on_note_off(&mut self, group: u8, channel: u8, note: u8, _t: u8, _v: u16, _a: u16) {
            self.notes_off.push((group, channel, note));
        }
        fn on_ac(&mut self, _g: u8, _c: u8, bank: u8, index: u8, data: u32, relative: bool) {
            self.acs.push((bank, index, data, relative));
        }
        fn on_pnac(&mut self, _g: u8, _c: u8, note: u8, index: u8, data: u32) {
            self.pnacs.push((note, index, data));
        }
        fn on_pressure(&mut self, _g: u8, _c: u8, per_note: Option<u8>, data: u32) {
            self.pressures.push((per_note, data));
        }
        fn on_program_change(&mut self, _g: u8, _c: u8, _f: u8, program: u8, msb: u8, lsb: u8) {
            self.programs.push((program, msb, lsb));
        }
    }

    fn bytes_of(umps: &[Ump]) -> Vec<u8> {
        let mut out = Vec::new();
        for ump in umps {
            let mut buf = [0u8; 16];
            write_ump(&mut buf, 0, ump);
            out.extend_from_slice(&buf[..ump.size_in_bytes()]);
        }
        out
    }

    #[test]
    fn test_dispatch_note_and_nrpn() {
        let bytes = bytes_of(&[
            Ump::midi2_note_on(0, 0, 60, 0, 0xFFFF, 0),
            Ump::midi2_nrpn(0, 0, 3, 12, 0x8000_0000),
            Ump::midi2_note_off(0, 0, 60, 0, 0, 0),
        ]);
        let mut rec = Recorder::default();
        dispatch_ump_bytes(&bytes, &mut rec);
        assert_eq!(rec.notes_on, vec![(0, 0, 60, 0xFFFF)]);
        assert_eq!(rec.notes_off, vec![(0, 0, 60)]);
        assert_eq!(rec.acs, vec![(3, 12, 0x8000_0000, false)]);
    }

    #[test]
    fn test_zero_velocity_note_on_dispatches_as_off() {
        let bytes = bytes_of(&[Ump::midi2_note_on(0, 1, 64, 0, 0, 0)]);
        let mut rec = Recorder::default();
        dispatch_ump_bytes(&bytes, &mut rec);
        assert!(rec.notes_on.is_empty());
        assert_eq!(rec.notes_off, vec![(0, 1, 64)]);
    }

    #[test]
    fn test_relative_nrpn_flag() {
        let bytes = bytes_of(&[Ump::midi2_relative_nrpn(0, 0, 1, 2, 55)]);
        let mut rec = Recorder::default();
        dispatch_ump_bytes(&bytes, &mut rec);
        assert_eq!(rec.acs, vec![(1, 2, 55, true)]);
    }

    #[test]
    fn test_per_note_categories() {
        let bytes = bytes_of(&[
            Ump::midi2_per_note_acc(0, 0, 71, 3, 99),
            Ump::midi2_poly_pressure(0, 0, 71, 500),
            Ump::midi2_channel_pressure(0, 0, 600),
        ]);
        let mut rec = Recorder::default();
        dispatch_ump_bytes(&bytes, &mut rec);
        assert_eq!(rec.pnacs, vec![(71, 3, 99)]);
        assert_eq!(rec.pressures, vec![(Some(71), 500), (None, 600)]);
    }

    #[test]
    fn test_program_change_decoding() {
        let bytes = bytes_of(&[Ump::midi2_program_change(0, 0, 1, 9, 4, 5)]);
        let mut rec = Recorder::default();
        dispatch_ump_bytes(&bytes, &mut rec);
        assert_eq!(rec.programs, vec![(9, 4, 5)]);
    }
}
