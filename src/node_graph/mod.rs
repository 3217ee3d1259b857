//! Node graph: per-plugin nodes arranged in serial chains per track.

pub mod graph;
pub mod mapper;
pub mod node;
pub mod track;

pub use graph::{AudioPluginGraph, EventOutputSink, GroupResolver};
pub use mapper::{MidiOutputSink, NodeUmpInputMapper, NodeUmpOutputMapper};
pub use node::AudioPluginNode;
pub use track::AudioPluginTrack;
