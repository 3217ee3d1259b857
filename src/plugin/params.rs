//! Plugin parameter metadata and change-notification plumbing.
//!
//! Adapters publish parameter metadata as [`PluginParameter`] records with a
//! host-assigned index and the plugin's stable native id. Value changes and
//! metadata rebuilds flow through a [`ParameterEventHub`] so the sequencer
//! (and any UMP output mapper) can subscribe without knowing the ABI.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Capability flags of one parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParameterFlags {
    pub automatable: bool,
    pub readable: bool,
    pub hidden: bool,
    pub enumerated: bool,
}

/// One `(name, plain value)` pair of an enumerated parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterEnumeration {
    pub name: String,
    pub plain_value: f64,
}

/// Host-facing description of one plugin parameter.
///
/// The `index` is host-assigned (0..N-1) and the `index` ↔ `stable_id`
/// mapping is stable for the lifetime of the instance unless the plugin
/// requests a parameter-list rebuild.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginParameter {
    pub index: u32,
    /// Opaque 32-bit native id, stable across sessions.
    pub stable_id: u32,
    pub name: String,
    /// Module path ("Filter/Cutoff" style), empty when the plugin has none.
    pub path: String,
    pub default_plain: f64,
    pub min_plain: f64,
    pub max_plain: f64,
    pub flags: ParameterFlags,
    /// Ordered choices for enumerated parameters, empty otherwise.
    pub enumerations: Vec<ParameterEnumeration>,
}

impl PluginParameter {
    pub fn normalized_to_plain(&self, normalized: f64) -> f64 {
        self.min_plain + normalized.clamp(0.0, 1.0) * (self.max_plain - self.min_plain)
    }

    pub fn plain_to_normalized(&self, plain: f64) -> f64 {
        if (self.max_plain - self.min_plain).abs() < f64::EPSILON {
            0.0
        } else {
            ((plain - self.min_plain) / (self.max_plain - self.min_plain)).clamp(0.0, 1.0)
        }
    }
}

/// Addressing for a per-note controller event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerNoteControllerContext {
    pub group: u8,
    pub channel: u8,
    pub note: u8,
}

/// Token returned by the hub's `add_*` methods; pass it back to remove.
pub type ListenerId = u64;

type ValueListener = Box<dyn Fn(u32, f64) + Send + Sync>;
type MetadataListener = Box<dyn Fn() + Send + Sync>;
type PerNoteListener = Box<dyn Fn(PerNoteControllerContext, u32, f64) + Send + Sync>;

/// Listener fan-out for one plugin instance's parameter signals.
///
/// Notifications may arrive from the audio thread (output parameter changes)
/// or the main thread (restart-driven refreshes); the mutexes here are held
/// only while iterating listeners and never across plugin calls.
#[derive(Default)]
pub struct ParameterEventHub {
    next_id: AtomicU64,
    value_listeners: Mutex<Vec<(ListenerId, ValueListener)>>,
    metadata_listeners: Mutex<Vec<(ListenerId, MetadataListener)>>,
    per_note_listeners: Mutex<Vec<(ListenerId, PerNoteListener)>>,
}

impl ParameterEventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> ListenerId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Subscribe to `(parameter index, plain value)` changes.
    pub fn add_value_listener(
        &self,
        listener: impl Fn(u32, f64) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.next_id();
        self.value_listeners
            .lock()
            .unwrap()
            .push((id, Box::new(listener)));
        id
    }

    pub fn remove_value_listener(&self, id: ListenerId) {
        self.value_listeners.lock().unwrap().retain(|(i, _)| *i != id);
    }

    /// Subscribe to parameter-metadata rebuild requests.
    pub fn add_metadata_listener(
        &self,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.next_id();
        self.metadata_listeners
            .lock()
            .unwrap()
            .push((id, Box::new(listener)));
        id
    }

    pub fn remove_metadata_listener(&self, id: ListenerId) {
        self.metadata_listeners
            .lock()
            .unwrap()
            .retain(|(i, _)| *i != id);
    }

    /// Subscribe to per-note controller changes.
    pub fn add_per_note_listener(
        &self,
        listener: impl Fn(PerNoteControllerContext, u32, f64) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.next_id();
        self.per_note_listeners
            .lock()
            .unwrap()
            .push((id, Box::new(listener)));
        id
    }

    pub fn remove_per_note_listener(&self, id: ListenerId) {
        self.per_note_listeners
            .lock()
            .unwrap()
            .retain(|(i, _)| *i != id);
    }

    pub fn notify_value(&self, parameter_index: u32, plain_value: f64) {
        for (_, listener) in self.value_listeners.lock().unwrap().iter() {
            listener(parameter_index, plain_value);
        }
    }

    pub fn notify_metadata_changed(&self) {
        for (_, listener) in self.metadata_listeners.lock().unwrap().iter() {
            listener();
        }
    }

    pub fn notify_per_note(
        &self,
        context: PerNoteControllerContext,
        controller_index: u32,
        value: f64,
    ) {
        for (_, listener) in self.per_note_listeners.lock().unwrap().iter() {
            listener(context, controller_index, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn test_normalized_plain_round_trip() {
        let param = PluginParameter {
            index: 0,
            stable_id: 10,
            name: "Cutoff".to_string(),
            path: String::new(),
            default_plain: 1000.0,
            min_plain: 20.0,
            max_plain: 20020.0,
            flags: ParameterFlags::default(),
            enumerations: Vec::new(),
        };
        for x in [0.0, 0.25, 0.5, 1.0] {
            let plain = param.normalized_to_plain(x);
            assert!((param.plain_to_normalized(plain) - x).abs() < 1e-12);
        }
    }

    #[test]
    fn test_hub_value_listener_add_remove() {
        let hub = ParameterEventHub::new();
        let count = Arc::new(AtomicU32::new(0));
        let captured = count.clone();
        let id = hub.add_value_listener(move |_, _| {
            captured.fetch_add(1, Ordering::SeqCst);
        });
        hub.notify_value(3, 0.5);
        hub.remove_value_listener(id);
        hub.notify_value(3, 0.7);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hub_metadata_listener() {
        let hub = ParameterEventHub::new();
        let hit = Arc::new(AtomicU32::new(0));
        let captured = hit.clone();
        hub.add_metadata_listener(move || {
            captured.fetch_add(1, Ordering::SeqCst);
        });
        hub.notify_metadata_changed();
        hub.notify_metadata_changed();
        assert_eq!(hit.load(Ordering::SeqCst), 2);
    }
}
