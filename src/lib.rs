//! uniplug - a universal audio plugin host runtime.
//!
//! Loads VST3, CLAP and Audio Unit plugins behind one uniform instance
//! contract and composes them into a realtime sequencer: per-plugin nodes
//! with lock-free UMP event ingress, serial chains per track, group-based
//! MIDI 2.0 routing, and a bidirectional parameter/event surface.

pub mod bus;
pub mod catalog;
pub mod context;
pub mod device;
pub mod error;
pub mod event_loop;
pub mod formats;
pub mod node_graph;
pub mod plugin;
pub mod sequencer;
pub mod testing;
pub mod ump;

pub use bus::{AudioBusConfiguration, AudioBusDefinition, AudioBusesInfo, BusRole, ChannelLayout};
pub use catalog::{PluginCatalog, PluginCatalogEntry};
pub use context::{AudioContentType, AudioProcessContext, MasterContext, SequenceProcessContext};
pub use device::DeviceIODispatcher;
pub use error::HostError;
pub use node_graph::{AudioPluginGraph, AudioPluginNode, AudioPluginTrack};
pub use plugin::{
    ConfigurationRequest, PluginFormat, PluginFormatRegistry, PluginInstance, UiThreadRequirement,
};
pub use sequencer::{ParameterUpdate, SequencerEngine, SpectrumReader, SPECTRUM_BARS};
pub use ump::{EventSequence, Ump};
