//! End-to-end sequencer scenarios driven through the mock plugin format.

use std::sync::Arc;

use approx::assert_relative_eq;

use uniplug::plugin::PluginFormatRegistry;
use uniplug::sequencer::SequencerEngine;
use uniplug::testing::{MockPluginFormat, MOCK_FORMAT_NAME};
use uniplug::ump::{self, Ump};
use uniplug::AudioProcessContext;

const SAMPLE_RATE: u32 = 48000;
const BLOCK_FRAMES: usize = 256;

fn engine_with_mock() -> (SequencerEngine, Arc<MockPluginFormat>) {
    let format = Arc::new(MockPluginFormat::new());
    let mut registry = PluginFormatRegistry::new();
    registry.register(format.clone());
    let engine = SequencerEngine::new(SAMPLE_RATE, BLOCK_FRAMES, 4096, Arc::new(registry));
    (engine, format)
}

fn device_context(engine: &SequencerEngine) -> AudioProcessContext {
    let mut ctx = AudioProcessContext::new(engine.master().clone(), 4096);
    ctx.configure_main_bus(2, 2, BLOCK_FRAMES);
    ctx
}

fn ump_bytes(message: Ump) -> Vec<u8> {
    let mut buffer = [0u8; 16];
    ump::write_ump(&mut buffer, 0, &message);
    buffer[..message.size_in_bytes()].to_vec()
}

#[test]
fn note_on_off_routing() {
    let (mut engine, format) = engine_with_mock();
    let (synth, _track) = engine.add_simple_track(MOCK_FORMAT_NAME, "synth").unwrap();
    let shared = format.shared_for("synth");

    // Group 0, channel 0, note 60, velocity 0xFFFF: words 0x40903C00
    // 0xFFFF0000 on the wire.
    let note_on = Ump::midi2_note_on(0, 0, 60, 0, 0xFFFF, 0);
    assert_eq!(note_on.words()[1], 0xFFFF_0000);
    let mut bytes = ump_bytes(note_on);
    engine.enqueue_ump(synth, &mut bytes, 0);

    let mut ctx = device_context(&engine);
    engine.process_audio(&mut ctx).unwrap();
    assert_eq!(shared.received_notes(), vec![(true, 0, 0, 60)]);

    let mut bytes = ump_bytes(Ump::midi2_note_off(0, 0, 60, 0, 0, 0));
    engine.enqueue_ump(synth, &mut bytes, 0);
    engine.process_audio(&mut ctx).unwrap();
    assert_eq!(shared.received_notes().len(), 2);
    assert_eq!(shared.received_notes()[1].0, false);
}

#[test]
fn group_rewriting_routes_to_second_instance() {
    let (mut engine, format) = engine_with_mock();
    let (_first, _) = engine.add_simple_track(MOCK_FORMAT_NAME, "first").unwrap();
    let (second, _) = engine.add_simple_track(MOCK_FORMAT_NAME, "second").unwrap();
    assert_eq!(engine.group_for_instance(second), Some(1));

    // Posted with group nibble 0; the engine rewrites to the assigned
    // group before scheduling.
    let mut bytes = ump_bytes(Ump::midi2_note_on(0, 0, 64, 0, 0x8000, 0));
    engine.enqueue_ump(second, &mut bytes, 0);

    let mut ctx = device_context(&engine);
    engine.process_audio(&mut ctx).unwrap();

    assert_eq!(format.shared_for("second").received_groups(), vec![1]);
    assert!(format.shared_for("first").received_groups().is_empty());
}

#[test]
fn parameter_nrpn_reflection() {
    let (mut engine, format) = engine_with_mock();
    let (instance, _) = engine.add_simple_track(MOCK_FORMAT_NAME, "fx").unwrap();

    // Plugin emits NRPN bank=3, index=12, value=0x80000000.
    format
        .shared_for("fx")
        .queue_output_event(Ump::midi2_nrpn(0, 0, 3, 12, 0x8000_0000));

    let mut ctx = device_context(&engine);
    engine.process_audio(&mut ctx).unwrap();

    let updates = engine.get_parameter_updates(instance);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].parameter_index, 3 * 128 + 12);
    assert_relative_eq!(updates[0].value, 0.5, epsilon = 2e-10);
}

#[test]
fn stuck_note_recovery() {
    let (mut engine, format) = engine_with_mock();
    let (synth, track) = engine.add_simple_track(MOCK_FORMAT_NAME, "stuck").unwrap();
    let shared = format.shared_for("stuck");
    let group = engine.group_for_instance(synth).unwrap();

    // Three note ons for (group, 0, 64) with no note offs.
    for _ in 0..3 {
        let mut bytes = ump_bytes(Ump::midi2_note_on(group, 0, 64, 0, 0x4000, 0));
        engine.enqueue_ump(synth, &mut bytes, 0);
    }
    let mut ctx = device_context(&engine);
    engine.process_audio(&mut ctx).unwrap();
    assert_eq!(shared.received_notes().len(), 3);

    // Pull the plugin: the node synthesizes one note off per refcount unit
    // before it goes away, and its empty track is reclaimed.
    assert!(engine.remove_plugin_instance(synth));
    assert_eq!(engine.find_track_index_for_instance(synth), None);
    assert_eq!(engine.track_count(), track);
}

#[test]
fn stuck_note_recovery_via_stop_all_notes() {
    use uniplug::node_graph::AudioPluginNode;
    use uniplug::testing::MockPluginInstance;
    use uniplug::ump::EventSequence;

    let instance = MockPluginInstance::instrument("direct");
    let mut node = AudioPluginNode::new(1, Box::new(instance), 128);

    let bytes = ump_bytes(Ump::midi2_note_on(0, 0, 64, 0, 0x4000, 0));
    for _ in 0..3 {
        assert!(node.schedule_events(0, &bytes));
    }
    node.stop_all_notes();
    assert!(node.active_note_counts().is_empty());

    // On the next block the plugin receives the three synthesized offs.
    node.drain_queue_to_pending();
    let mut seq = EventSequence::with_capacity(1024);
    node.fill_event_buffer_for_group(&mut seq, ump::GROUP_WILDCARD);
    let offs = seq
        .iter()
        .filter(|u| u.note_semantics() == Some((false, 0, 64)))
        .count();
    assert_eq!(offs, 3);
}

#[test]
fn transport_position_across_blocks() {
    let (mut engine, _format) = engine_with_mock();
    engine.add_simple_track(MOCK_FORMAT_NAME, "t").unwrap();
    let mut ctx = device_context(&engine);

    engine.start_playback();
    for _ in 0..4 {
        engine.process_audio(&mut ctx).unwrap();
    }
    assert_eq!(engine.playback_position(), 1024);

    engine.pause_playback();
    engine.process_audio(&mut ctx).unwrap();
    assert_eq!(engine.playback_position(), 1024);
}

#[test]
fn parameter_values_refresh_notifies_each_parameter() {
    // A plugin-requested value refresh reaches the engine's update queue
    // with one notification per parameter.
    let (mut engine, format) = engine_with_mock();
    let (instance, _) = engine.add_simple_track(MOCK_FORMAT_NAME, "rst").unwrap();
    let shared = format.shared_for("rst");

    // The adapter-side refresh walks the parameter list and notifies the
    // hub with current values; emulate that contract here.
    shared.hub.notify_value(0, 1.0);
    shared.hub.notify_value(1, 0.5);

    let updates = engine.get_parameter_updates(instance);
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].parameter_index, 0);
    assert_eq!(updates[1].parameter_index, 1);
}

#[test]
fn event_capacity_truncation_keeps_remainder_pending() {
    use uniplug::node_graph::AudioPluginNode;
    use uniplug::testing::MockPluginInstance;
    use uniplug::ump::EventSequence;

    let mut node = AudioPluginNode::new(9, Box::new(MockPluginInstance::instrument("cap")), 256);
    let bytes = ump_bytes(Ump::midi2_cc(4, 0, 7, 77));
    for _ in 0..10 {
        assert!(node.schedule_events(0, &bytes));
    }
    node.drain_queue_to_pending();

    // Room for four 8-byte messages only.
    let mut seq = EventSequence::with_capacity(32);
    node.fill_event_buffer_for_group(&mut seq, 4);
    assert_eq!(seq.position(), 32);
    assert_eq!(node.pending_event_count(), 6);

    let mut seq2 = EventSequence::with_capacity(1024);
    node.fill_event_buffer_for_group(&mut seq2, 4);
    assert_eq!(seq2.iter().count(), 6);
    assert_eq!(node.pending_event_count(), 0);
}

#[test]
fn bypassed_track_passes_input_through() {
    let (mut engine, format) = engine_with_mock();
    let (_id, track) = engine.add_simple_track(MOCK_FORMAT_NAME, "byp").unwrap();
    *format.shared_for("byp").output_level.lock().unwrap() = 0.9;
    engine.set_track_bypassed(track, true);

    let mut ctx = device_context(&engine);
    ctx.input_f32_mut(0, 0).unwrap().fill(0.25);
    engine.process_audio(&mut ctx).unwrap();

    // The track copied its input; the mix then soft-clips it.
    let expected = 0.25f32.tanh();
    assert_relative_eq!(ctx.output_f32(0, 0).unwrap()[0], expected, epsilon = 1e-6);
}
