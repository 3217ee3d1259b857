//! Ordered chain of plugin nodes within one track.
//!
//! Within one process call the nodes execute in order; between nodes the
//! context advances so one node's outputs become the next node's inputs.
//! The graph itself knows nothing about UMP groups: a resolver callback maps
//! instance ids to groups, and an output sink receives whatever a node wrote
//! into the output event sequence.

use crate::context::AudioProcessContext;
use crate::error::HostError;
use crate::node_graph::node::AudioPluginNode;
use crate::ump::{Ump, GROUP_WILDCARD};

pub type GroupResolver = Box<dyn Fn(i32) -> u8 + Send>;
pub type EventOutputSink = Box<dyn FnMut(i32, &[u8]) + Send>;

#[derive(Default)]
pub struct AudioPluginGraph {
    nodes: Vec<AudioPluginNode>,
    group_resolver: Option<GroupResolver>,
    event_output_sink: Option<EventOutputSink>,
}

impl AudioPluginGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_group_resolver(&mut self, resolver: GroupResolver) {
        self.group_resolver = Some(resolver);
    }

    pub fn set_event_output_sink(&mut self, sink: EventOutputSink) {
        self.event_output_sink = Some(sink);
    }

    pub fn append_node(&mut self, node: AudioPluginNode) {
        self.nodes.push(node);
    }

    pub fn remove_node(&mut self, instance_id: i32) -> Option<AudioPluginNode> {
        let index = self.nodes.iter().position(|n| n.instance_id() == instance_id)?;
        Some(self.nodes.remove(index))
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[AudioPluginNode] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [AudioPluginNode] {
        &mut self.nodes
    }

    pub fn node_mut(&mut self, instance_id: i32) -> Option<&mut AudioPluginNode> {
        self.nodes
            .iter_mut()
            .find(|n| n.instance_id() == instance_id)
    }

    pub fn instance_ids(&self) -> Vec<i32> {
        self.nodes.iter().map(|n| n.instance_id()).collect()
    }

    /// Distribute track-intake events to the nodes whose group matches.
    /// Events with no matching node fall through to the first node, so a
    /// track with a single unassigned plugin still receives input.
    pub(crate) fn route_track_events(&mut self, events: &[Ump]) {
        if self.nodes.is_empty() || events.is_empty() {
            return;
        }
        let groups: Vec<u8> = self
            .nodes
            .iter()
            .map(|n| {
                self.group_resolver
                    .as_ref()
                    .map(|r| r(n.instance_id()))
                    .unwrap_or(GROUP_WILDCARD)
            })
            .collect();
        for ump in events {
            let target = groups
                .iter()
                .position(|g| *g == GROUP_WILDCARD || *g == ump.group())
                .unwrap_or(0);
            self.nodes[target].push_routed_events(std::slice::from_ref(ump));
        }
    }

    /// Execute the chain for one block. Returns the first failing node's
    /// error; further nodes are skipped.
    pub fn process_audio(&mut self, context: &mut AudioProcessContext) -> Result<(), HostError> {
        if self.nodes.is_empty() {
            return Ok(());
        }
        context.clear_audio_outputs();

        let node_count = self.nodes.len();
        for i in 0..node_count {
            let node = &mut self.nodes[i];
            let instance_id = node.instance_id();

            node.drain_queue_to_pending();

            let group = self
                .group_resolver
                .as_ref()
                .map(|r| r(instance_id))
                .unwrap_or(GROUP_WILDCARD);

            context.event_in_mut().set_position(0);
            node.fill_event_buffer_for_group(context.event_in_mut(), group);

            node.apply_input_mappings(context.event_in(), 0);

            node.instance_mut().process(context)?;

            if context.event_out().position() > 0 {
                if let Some(sink) = self.event_output_sink.as_mut() {
                    sink(instance_id, context.event_out().bytes());
                }
                context.event_out_mut().set_position(0);
            }

            if i + 1 < node_count {
                context.advance_to_next_node();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MasterContext;
    use crate::testing::MockPluginInstance;
    use crate::ump::write_ump;
    use std::sync::{Arc, Mutex};

    fn bytes_of(ump: &Ump) -> Vec<u8> {
        let mut buf = [0u8; 16];
        write_ump(&mut buf, 0, ump);
        buf[..ump.size_in_bytes()].to_vec()
    }

    fn context() -> AudioProcessContext {
        let master = Arc::new(MasterContext::new(48000));
        let mut ctx = AudioProcessContext::new(master, 256);
        ctx.configure_main_bus(2, 2, 64);
        ctx
    }

    #[test]
    fn test_chain_processes_in_order_with_group_filter() {
        let mut graph = AudioPluginGraph::new();
        let first = MockPluginInstance::instrument("first");
        let first_shared = first.shared();
        let second = MockPluginInstance::instrument("second");
        let second_shared = second.shared();
        graph.append_node(AudioPluginNode::new(10, Box::new(first), 64));
        graph.append_node(AudioPluginNode::new(20, Box::new(second), 64));
        graph.set_group_resolver(Box::new(|id| if id == 10 { 0 } else { 1 }));

        let on_g0 = Ump::midi2_note_on(0, 0, 60, 0, 100, 0);
        let on_g1 = Ump::midi2_note_on(1, 0, 61, 0, 100, 0);
        graph.node_mut(10).unwrap().schedule_events(0, &bytes_of(&on_g0));
        graph.node_mut(20).unwrap().schedule_events(0, &bytes_of(&on_g1));

        let mut ctx = context();
        graph.process_audio(&mut ctx).unwrap();

        assert_eq!(first_shared.received_notes(), vec![(true, 0, 0, 60)]);
        assert_eq!(second_shared.received_notes(), vec![(true, 1, 0, 61)]);
        // Input position is whatever the last node's fill left behind.
        assert_eq!(ctx.event_in().position(), 8);
    }

    #[test]
    fn test_output_sink_receives_node_events() {
        let mut graph = AudioPluginGraph::new();
        let inst = MockPluginInstance::instrument("emitter");
        let shared = inst.shared();
        shared.queue_output_event(Ump::midi2_nrpn(0, 0, 3, 12, 500));
        graph.append_node(AudioPluginNode::new(7, Box::new(inst), 64));

        let seen: Arc<Mutex<Vec<(i32, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        graph.set_event_output_sink(Box::new(move |id, bytes| {
            captured.lock().unwrap().push((id, bytes.len()));
        }));

        let mut ctx = context();
        graph.process_audio(&mut ctx).unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[(7, 8)]);
        // The output sequence was reset after the sink ran.
        assert_eq!(ctx.event_out().position(), 0);
    }

    #[test]
    fn test_route_track_events_by_group() {
        let mut graph = AudioPluginGraph::new();
        let a = MockPluginInstance::instrument("a");
        let b = MockPluginInstance::instrument("b");
        let b_shared = b.shared();
        graph.append_node(AudioPluginNode::new(1, Box::new(a), 64));
        graph.append_node(AudioPluginNode::new(2, Box::new(b), 64));
        graph.set_group_resolver(Box::new(|id| if id == 1 { 3 } else { 4 }));

        graph.route_track_events(&[Ump::midi2_note_on(4, 0, 70, 0, 100, 0)]);
        let mut ctx = context();
        graph.process_audio(&mut ctx).unwrap();
        assert_eq!(b_shared.received_notes(), vec![(true, 4, 0, 70)]);
    }
}
