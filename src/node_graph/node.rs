//! Per-plugin audio node: instance + lock-free event ingress + note tracker.
//!
//! Producers (main thread or another audio-producing thread) write UMP
//! messages into a wait-free SPSC ring; the audio thread drains the ring
//! into a pending vector at the start of each block and copies group-matched
//! messages into the process context. An active-note refcount map makes
//! stuck-note recovery possible when a plugin is removed or transport stops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rtrb::{Consumer, Producer, RingBuffer};

use crate::node_graph::mapper::{MidiOutputSink, NodeUmpInputMapper, NodeUmpOutputMapper};
use crate::plugin::params::ParameterEventHub;
use crate::plugin::PluginInstance;
use crate::ump::{iter_ump_bytes, EventSequence, Ump, GROUP_WILDCARD};

/// Encode `(group, channel, note)` into the note-map key.
fn note_key(group: u8, channel: u8, note: u8) -> u16 {
    (((group as u16) & 0x0F) << 12) | (((channel as u16) & 0x0F) << 8) | ((note as u16) & 0x7F)
}

fn decode_note_key(key: u16) -> (u8, u8, u8) {
    (
        ((key >> 12) & 0x0F) as u8,
        ((key >> 8) & 0x0F) as u8,
        (key & 0x7F) as u8,
    )
}

struct NoteUpdate {
    note_on: bool,
    key: u16,
}

fn extract_note_update(ump: &Ump) -> Option<NoteUpdate> {
    ump.note_semantics().map(|(on, channel, note)| NoteUpdate {
        note_on: on,
        key: note_key(ump.group(), channel, note),
    })
}

/// One plugin instance wired into a track chain.
pub struct AudioPluginNode {
    instance_id: i32,
    instance: Box<dyn PluginInstance>,
    queue_producer: Producer<Ump>,
    queue_consumer: Consumer<Ump>,
    pending_events: Vec<Ump>,
    active_notes: Mutex<HashMap<u16, u32>>,
    input_mapper: NodeUmpInputMapper,
    output_mapper: Option<NodeUmpOutputMapper>,
}

impl AudioPluginNode {
    /// `event_capacity` is the maximum number of queued UMP messages.
    pub fn new(
        instance_id: i32,
        mut instance: Box<dyn PluginInstance>,
        event_capacity: usize,
    ) -> Self {
        let (queue_producer, queue_consumer) = RingBuffer::new(event_capacity.max(16));
        let input_mapper = NodeUmpInputMapper::new(instance.parameters().unwrap_or_default());
        Self {
            instance_id,
            instance,
            queue_producer,
            queue_consumer,
            // Pending may hold a full queue plus capacity-truncation leftovers.
            pending_events: Vec::with_capacity(event_capacity.max(16) * 2),
            active_notes: Mutex::new(HashMap::new()),
            input_mapper,
            output_mapper: None,
        }
    }

    /// Route the block's assignable-controller traffic into the uniform
    /// contract before the native process call.
    pub fn apply_input_mappings(&mut self, sequence: &EventSequence, timestamp: u64) {
        self.input_mapper
            .apply(self.instance.as_mut(), sequence, timestamp);
    }

    /// Rebuild the input mapper's metadata cache after a parameter-list
    /// rebuild. Main thread.
    pub fn refresh_input_map(&mut self) {
        let parameters = self.instance.parameters().unwrap_or_default();
        self.input_mapper.refresh(parameters);
    }

    /// Install (or clear) the UMP output mapper reflecting parameter and
    /// per-note changes to an external MIDI sink.
    pub fn set_output_sink(&mut self, sink: Option<MidiOutputSink>) {
        self.output_mapper = sink.map(|sink| {
            NodeUmpOutputMapper::new(self.instance.parameter_events().clone(), sink)
        });
    }

    pub fn instance_id(&self) -> i32 {
        self.instance_id
    }

    pub fn instance(&self) -> &dyn PluginInstance {
        self.instance.as_ref()
    }

    pub fn instance_mut(&mut self) -> &mut dyn PluginInstance {
        self.instance.as_mut()
    }

    pub fn parameter_events(&self) -> Arc<ParameterEventHub> {
        self.instance.parameter_events().clone()
    }

    /// Enqueue raw UMP bytes for this node. Note on/off messages update the
    /// active-note refcounts (under a short mutex) before the enqueue so an
    /// interleaved `stop_all_notes` observes them. Returns `false` when the
    /// queue is full; the caller may back-pressure or drop.
    pub fn schedule_events(&mut self, _timestamp: u64, events: &[u8]) -> bool {
        let mut updates = Vec::new();
        let mut messages = Vec::new();
        for ump in iter_ump_bytes(events) {
            if let Some(update) = extract_note_update(&ump) {
                updates.push(update);
            }
            messages.push(ump);
        }
        if !updates.is_empty() {
            let mut notes = self.active_notes.lock().unwrap();
            for update in &updates {
                apply_note_update(&mut notes, update);
            }
        }
        for ump in messages {
            if self.queue_producer.push(ump).is_err() {
                return false;
            }
        }
        true
    }

    /// Route events that arrived through the track's intake. Same note
    /// bookkeeping as `schedule_events`, but the messages land directly in
    /// the pending vector (audio thread, no queue hop).
    pub(crate) fn push_routed_events(&mut self, events: &[Ump]) {
        let mut updates = Vec::new();
        for ump in events {
            if let Some(update) = extract_note_update(ump) {
                updates.push(update);
            }
        }
        if !updates.is_empty() {
            let mut notes = self.active_notes.lock().unwrap();
            for update in &updates {
                apply_note_update(&mut notes, update);
            }
        }
        self.pending_events.extend_from_slice(events);
    }

    /// Move all queued messages into the pending vector. Audio thread only;
    /// the vector capacity is reserved at construction.
    pub fn drain_queue_to_pending(&mut self) {
        while let Ok(ump) = self.queue_consumer.pop() {
            self.pending_events.push(ump);
        }
    }

    /// Copy pending messages whose group matches into `sequence` (all of
    /// them when `group` is [`GROUP_WILDCARD`]). Truncates at the sequence's
    /// capacity and keeps the remainder pending for the next block. Returns
    /// the sequence position after filling.
    pub fn fill_event_buffer_for_group(&mut self, sequence: &mut EventSequence, group: u8) -> usize {
        let mut i = 0;
        while i < self.pending_events.len() {
            let ump = self.pending_events[i];
            if group != GROUP_WILDCARD && ump.group() != group {
                i += 1;
                continue;
            }
            if sequence.remaining() < ump.size_in_bytes() {
                break;
            }
            // Capacity was checked above, the append cannot fail.
            let _ = sequence.append(&ump);
            self.pending_events.remove(i);
        }
        sequence.position()
    }

    /// Synthesize a MIDI 2.0 note off for every active refcount unit and
    /// enqueue them. Entries that do not fit in the queue are put back into
    /// the refcount map so a later call can retry. This is the recovery
    /// mechanism for stuck notes on plugin removal or transport stop.
    pub fn stop_all_notes(&mut self) {
        let snapshot: Vec<(u16, u32)> = {
            let mut notes = self.active_notes.lock().unwrap();
            if notes.is_empty() {
                return;
            }
            notes.drain().collect()
        };
        for (key, count) in snapshot {
            let (group, channel, note) = decode_note_key(key);
            let mut remaining = count;
            while remaining > 0 {
                let note_off = Ump::midi2_note_off(group, channel, note, 0, 0, 0);
                let mut enqueued = false;
                for _ in 0..4 {
                    if self.queue_producer.push(note_off).is_ok() {
                        enqueued = true;
                        break;
                    }
                    std::thread::yield_now();
                }
                if !enqueued {
                    *self.active_notes.lock().unwrap().entry(key).or_insert(0) += remaining;
                    break;
                }
                remaining -= 1;
            }
        }
    }

    /// Snapshot of `(group, channel, note) -> refcount`, for diagnostics and
    /// tests.
    pub fn active_note_counts(&self) -> HashMap<(u8, u8, u8), u32> {
        self.active_notes
            .lock()
            .unwrap()
            .iter()
            .map(|(key, count)| (decode_note_key(*key), *count))
            .collect()
    }

    pub fn pending_event_count(&self) -> usize {
        self.pending_events.len()
    }
}

fn apply_note_update(notes: &mut HashMap<u16, u32>, update: &NoteUpdate) {
    if update.note_on {
        *notes.entry(update.key).or_insert(0) += 1;
        return;
    }
    if let Some(count) = notes.get_mut(&update.key) {
        if *count <= 1 {
            notes.remove(&update.key);
        } else {
            *count -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPluginInstance;
    use crate::ump::write_ump;

    fn bytes_of(umps: &[Ump]) -> Vec<u8> {
        let mut out = Vec::new();
        for ump in umps {
            let mut buf = [0u8; 16];
            write_ump(&mut buf, 0, ump);
            out.extend_from_slice(&buf[..ump.size_in_bytes()]);
        }
        out
    }

    fn test_node(capacity: usize) -> AudioPluginNode {
        AudioPluginNode::new(1, Box::new(MockPluginInstance::instrument("mock")), capacity)
    }

    #[test]
    fn test_note_refcounts_follow_on_off() {
        let mut node = test_node(64);
        let on = bytes_of(&[Ump::midi2_note_on(0, 0, 60, 0, 0xFFFF, 0)]);
        let off = bytes_of(&[Ump::midi2_note_off(0, 0, 60, 0, 0, 0)]);
        assert!(node.schedule_events(0, &on));
        assert!(node.schedule_events(0, &on));
        assert_eq!(node.active_note_counts().get(&(0, 0, 60)), Some(&2));
        assert!(node.schedule_events(0, &off));
        assert_eq!(node.active_note_counts().get(&(0, 0, 60)), Some(&1));
        assert!(node.schedule_events(0, &off));
        assert!(node.active_note_counts().is_empty());
    }

    #[test]
    fn test_schedule_returns_false_when_full() {
        let mut node = test_node(16);
        let message = bytes_of(&[Ump::midi2_cc(0, 0, 1, 2)]);
        for _ in 0..16 {
            assert!(node.schedule_events(0, &message));
        }
        assert!(!node.schedule_events(0, &message));
    }

    #[test]
    fn test_fill_filters_by_group_and_truncates() {
        let mut node = test_node(64);
        let events = bytes_of(&[
            Ump::midi2_note_on(2, 0, 60, 0, 100, 0),
            Ump::midi2_note_on(5, 0, 61, 0, 100, 0),
            Ump::midi2_note_on(2, 0, 62, 0, 100, 0),
        ]);
        assert!(node.schedule_events(0, &events));
        node.drain_queue_to_pending();

        let mut seq = EventSequence::with_capacity(8);
        // Capacity fits only one two-word message; the second group-2 event
        // must stay pending.
        node.fill_event_buffer_for_group(&mut seq, 2);
        assert_eq!(seq.position(), 8);
        assert_eq!(node.pending_event_count(), 2);

        let mut seq2 = EventSequence::with_capacity(64);
        node.fill_event_buffer_for_group(&mut seq2, 2);
        let groups: Vec<u8> = seq2.iter().map(|u| u.group()).collect();
        assert_eq!(groups, vec![2]);
        // Only the group-5 event is left.
        assert_eq!(node.pending_event_count(), 1);
    }

    #[test]
    fn test_fill_wildcard_takes_everything() {
        let mut node = test_node(64);
        let events = bytes_of(&[
            Ump::midi2_note_on(1, 0, 60, 0, 100, 0),
            Ump::midi2_note_on(9, 0, 61, 0, 100, 0),
        ]);
        assert!(node.schedule_events(0, &events));
        node.drain_queue_to_pending();
        let mut seq = EventSequence::with_capacity(64);
        node.fill_event_buffer_for_group(&mut seq, GROUP_WILDCARD);
        assert_eq!(seq.iter().count(), 2);
        assert_eq!(node.pending_event_count(), 0);
    }

    #[test]
    fn test_stop_all_notes_synthesizes_per_refcount() {
        let mut node = test_node(64);
        let on = bytes_of(&[Ump::midi2_note_on(0, 0, 64, 0, 0x8000, 0)]);
        for _ in 0..3 {
            assert!(node.schedule_events(0, &on));
        }
        node.stop_all_notes();
        assert!(node.active_note_counts().is_empty());
        node.drain_queue_to_pending();
        // Three note ons followed by three synthesized note offs.
        let offs = node
            .pending_events
            .iter()
            .filter(|u| u.note_semantics() == Some((false, 0, 64)))
            .count();
        assert_eq!(offs, 3);
    }

    #[test]
    fn test_stop_all_notes_puts_back_on_full_queue() {
        let mut node = test_node(16);
        let on = bytes_of(&[Ump::midi2_note_on(0, 0, 64, 0, 0x8000, 0)]);
        // Fill the queue completely with note ons.
        for _ in 0..16 {
            assert!(node.schedule_events(0, &on));
        }
        // No room for any synthesized note off: refcounts must be restored.
        node.stop_all_notes();
        assert_eq!(node.active_note_counts().get(&(0, 0, 64)), Some(&16));
    }
}
