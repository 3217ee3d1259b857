//! Generic audio-bus model shared by all format adapters.
//!
//! A bus definition lists the channel layouts a plugin port can take; a
//! configuration pins one layout and an enabled flag. After instantiation
//! every adapter inspects its plugin's ports into this model so the
//! sequencer can allocate matching buffers without knowing the ABI.

/// Role of a bus. The first bus flagged as primary by the plugin (or port 0)
/// becomes the main bus; the sequencer mixes main-bus outputs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusRole {
    Main,
    Aux,
}

/// A channel layout, identified by its channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    channels: u32,
}

impl ChannelLayout {
    pub const MONO: ChannelLayout = ChannelLayout { channels: 1 };
    pub const STEREO: ChannelLayout = ChannelLayout { channels: 2 };

    pub fn new(channels: u32) -> Self {
        Self { channels }
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    /// Nominal label for the layout; empty for layouts without a common name.
    pub fn label(&self) -> &'static str {
        match self.channels {
            1 => "Mono",
            2 => "Stereo",
            _ => "",
        }
    }
}

/// A named audio port with its candidate layouts.
#[derive(Debug, Clone)]
pub struct AudioBusDefinition {
    name: String,
    role: BusRole,
    layouts: Vec<ChannelLayout>,
}

impl AudioBusDefinition {
    pub fn new(name: impl Into<String>, role: BusRole, layouts: Vec<ChannelLayout>) -> Self {
        Self {
            name: name.into(),
            role,
            layouts,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> BusRole {
        self.role
    }

    pub fn layouts(&self) -> &[ChannelLayout] {
        &self.layouts
    }
}

/// A definition with one pinned layout and an enabled flag.
///
/// Invariant: the pinned layout's channel count equals the number of audio
/// channel pointers the adapter presents for this bus during processing.
#[derive(Debug, Clone)]
pub struct AudioBusConfiguration {
    definition: AudioBusDefinition,
    layout: ChannelLayout,
    enabled: bool,
}

impl AudioBusConfiguration {
    pub fn new(definition: AudioBusDefinition, layout: ChannelLayout) -> Self {
        Self {
            definition,
            layout,
            enabled: true,
        }
    }

    pub fn definition(&self) -> &AudioBusDefinition {
        &self.definition
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    pub fn set_layout(&mut self, layout: ChannelLayout) {
        self.layout = layout;
    }

    pub fn channels(&self) -> u32 {
        self.layout.channels()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_main(&self) -> bool {
        self.definition.role() == BusRole::Main
    }
}

/// Inspected bus topology of one plugin instance.
#[derive(Debug, Clone, Default)]
pub struct AudioBusesInfo {
    pub input_buses: Vec<AudioBusConfiguration>,
    pub output_buses: Vec<AudioBusConfiguration>,
    pub has_event_input: bool,
    pub has_event_output: bool,
}

impl AudioBusesInfo {
    pub fn main_input_channels(&self) -> u32 {
        self.input_buses
            .iter()
            .find(|b| b.is_main())
            .map(|b| b.channels())
            .unwrap_or(0)
    }

    pub fn main_output_channels(&self) -> u32 {
        self.output_buses
            .iter()
            .find(|b| b.is_main())
            .map(|b| b.channels())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_labels() {
        assert_eq!(ChannelLayout::MONO.label(), "Mono");
        assert_eq!(ChannelLayout::STEREO.label(), "Stereo");
        assert_eq!(ChannelLayout::new(6).label(), "");
    }

    #[test]
    fn test_main_bus_channels() {
        let mut info = AudioBusesInfo::default();
        info.output_buses.push(AudioBusConfiguration::new(
            AudioBusDefinition::new("Aux Out", BusRole::Aux, vec![ChannelLayout::MONO]),
            ChannelLayout::MONO,
        ));
        info.output_buses.push(AudioBusConfiguration::new(
            AudioBusDefinition::new("Out", BusRole::Main, vec![ChannelLayout::STEREO]),
            ChannelLayout::STEREO,
        ));
        assert_eq!(info.main_output_channels(), 2);
        assert_eq!(info.main_input_channels(), 0);
    }
}
