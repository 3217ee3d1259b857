//! One sequencer track: a plugin chain plus scheduled-event intake.
//!
//! The track owns a second SPSC ring for events posted against the track as
//! a whole (the sequencer's `enqueue_ump` path lands here after group
//! rewriting). At each block the intake is drained and distributed to the
//! chain by group before the graph runs.

use rtrb::{Consumer, Producer, RingBuffer};

use crate::context::AudioProcessContext;
use crate::error::HostError;
use crate::node_graph::graph::AudioPluginGraph;
use crate::ump::{iter_ump_bytes, Ump};

pub struct AudioPluginTrack {
    graph: AudioPluginGraph,
    bypass: bool,
    frozen: bool,
    intake_producer: Producer<Ump>,
    intake_consumer: Consumer<Ump>,
    intake_pending: Vec<Ump>,
}

impl AudioPluginTrack {
    /// `event_capacity` bounds the number of queued intake messages.
    pub fn new(event_capacity: usize) -> Self {
        let capacity = event_capacity.max(16);
        let (intake_producer, intake_consumer) = RingBuffer::new(capacity);
        Self {
            graph: AudioPluginGraph::new(),
            bypass: false,
            frozen: false,
            intake_producer,
            intake_consumer,
            intake_pending: Vec::with_capacity(capacity),
        }
    }

    pub fn graph(&self) -> &AudioPluginGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut AudioPluginGraph {
        &mut self.graph
    }

    pub fn bypassed(&self) -> bool {
        self.bypass
    }

    pub fn set_bypassed(&mut self, value: bool) {
        self.bypass = value;
    }

    pub fn frozen(&self) -> bool {
        self.frozen
    }

    pub fn set_frozen(&mut self, value: bool) {
        self.frozen = value;
    }

    /// Post raw UMP bytes to the track. Returns `false` when the intake ring
    /// is full.
    pub fn schedule_events(&mut self, _timestamp: u64, events: &[u8]) -> bool {
        for ump in iter_ump_bytes(events) {
            if self.intake_producer.push(ump).is_err() {
                return false;
            }
        }
        true
    }

    /// Process one block: drain the intake, route it into the chain, run the
    /// graph. A bypassed track passes its input through unchanged.
    pub fn process_audio(&mut self, context: &mut AudioProcessContext) -> Result<(), HostError> {
        self.intake_pending.clear();
        while let Ok(ump) = self.intake_consumer.pop() {
            self.intake_pending.push(ump);
        }

        if self.bypass {
            pass_through(context);
            return Ok(());
        }

        self.graph.route_track_events(&self.intake_pending);
        self.intake_pending.clear();
        self.graph.process_audio(context)
    }
}

fn pass_through(context: &mut AudioProcessContext) {
    let buses = context
        .audio_in_bus_count()
        .min(context.audio_out_bus_count());
    for bus in 0..buses {
        let channels = context
            .input_channel_count(bus)
            .min(context.output_channel_count(bus));
        for channel in 0..channels {
            let frames = context.frame_count();
            let src_ptr = context.input_channel_ptr_f32(bus, channel);
            if let Some(src_ptr) = src_ptr {
                if let Some(dst) = context.output_f32_mut(bus, channel) {
                    // Safety: src and dst come from different buffer vectors
                    // of the same context; they never alias.
                    let src = unsafe { std::slice::from_raw_parts(src_ptr, frames) };
                    dst.copy_from_slice(src);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MasterContext;
    use crate::node_graph::node::AudioPluginNode;
    use crate::testing::MockPluginInstance;
    use crate::ump::write_ump;
    use std::sync::Arc;

    fn bytes_of(ump: &Ump) -> Vec<u8> {
        let mut buf = [0u8; 16];
        write_ump(&mut buf, 0, ump);
        buf[..ump.size_in_bytes()].to_vec()
    }

    fn context() -> AudioProcessContext {
        let master = Arc::new(MasterContext::new(48000));
        let mut ctx = AudioProcessContext::new(master, 256);
        ctx.configure_main_bus(2, 2, 32);
        ctx
    }

    #[test]
    fn test_intake_routes_to_chain() {
        let mut track = AudioPluginTrack::new(64);
        let inst = MockPluginInstance::instrument("synth");
        let shared = inst.shared();
        track
            .graph_mut()
            .append_node(AudioPluginNode::new(1, Box::new(inst), 64));
        track.graph_mut().set_group_resolver(Box::new(|_| 2));

        assert!(track.schedule_events(0, &bytes_of(&Ump::midi2_note_on(2, 0, 60, 0, 9000, 0))));
        let mut ctx = context();
        track.process_audio(&mut ctx).unwrap();
        assert_eq!(shared.received_notes(), vec![(true, 2, 0, 60)]);
    }

    #[test]
    fn test_bypass_passes_audio_through() {
        let mut track = AudioPluginTrack::new(16);
        let inst = MockPluginInstance::instrument("fx");
        *inst.shared().output_level.lock().unwrap() = 0.9;
        let shared = inst.shared();
        track
            .graph_mut()
            .append_node(AudioPluginNode::new(1, Box::new(inst), 16));
        track.set_bypassed(true);

        let mut ctx = context();
        ctx.input_f32_mut(0, 0).unwrap().fill(0.25);
        track.process_audio(&mut ctx).unwrap();
        // Input copied to output; plugin never ran.
        assert_eq!(ctx.output_f32(0, 0).unwrap()[0], 0.25);
        assert_eq!(shared.processed_blocks.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_intake_full_returns_false() {
        let mut track = AudioPluginTrack::new(16);
        let bytes = bytes_of(&Ump::midi2_cc(0, 0, 1, 1));
        for _ in 0..16 {
            assert!(track.schedule_events(0, &bytes));
        }
        assert!(!track.schedule_events(0, &bytes));
    }
}
