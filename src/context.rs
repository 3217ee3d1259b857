//! Process-context ownership model.
//!
//! The sequencer owns one [`AudioProcessContext`] per track plus one for the
//! device side, and lends buffer pointers to the adapters for the duration
//! of each process call. Plugins may neither retain the pointers nor write
//! to inputs. The [`MasterContext`] carries transport state as atomics so
//! the RT thread and control threads share it without locking.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use crate::bus::{AudioBusConfiguration, AudioBusDefinition, BusRole, ChannelLayout};
use crate::ump::EventSequence;

/// Symbolic sample type for a processing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioContentType {
    #[default]
    Float32,
    Float64,
}

/// Shared transport and timing state.
///
/// Tempo is stored in microseconds per quarter note (500000 = 120 BPM).
pub struct MasterContext {
    sample_rate: AtomicU32,
    playback_position_samples: AtomicI64,
    is_playing: AtomicBool,
    tempo_us_per_quarter: AtomicU32,
    time_signature_numerator: AtomicU32,
    time_signature_denominator: AtomicU32,
    float64_mode: AtomicBool,
}

impl MasterContext {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: AtomicU32::new(sample_rate),
            playback_position_samples: AtomicI64::new(0),
            is_playing: AtomicBool::new(false),
            tempo_us_per_quarter: AtomicU32::new(500_000),
            time_signature_numerator: AtomicU32::new(4),
            time_signature_denominator: AtomicU32::new(4),
            float64_mode: AtomicBool::new(false),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    pub fn set_sample_rate(&self, value: u32) {
        self.sample_rate.store(value, Ordering::Release);
    }

    pub fn playback_position_samples(&self) -> i64 {
        self.playback_position_samples.load(Ordering::Acquire)
    }

    pub fn set_playback_position_samples(&self, value: i64) {
        self.playback_position_samples.store(value, Ordering::Release);
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing.load(Ordering::Acquire)
    }

    pub fn set_playing(&self, value: bool) {
        self.is_playing.store(value, Ordering::Release);
    }

    pub fn tempo_us_per_quarter(&self) -> u32 {
        self.tempo_us_per_quarter.load(Ordering::Acquire)
    }

    pub fn set_tempo_us_per_quarter(&self, value: u32) {
        self.tempo_us_per_quarter.store(value, Ordering::Release);
    }

    pub fn tempo_bpm(&self) -> f64 {
        60_000_000.0 / self.tempo_us_per_quarter() as f64
    }

    pub fn time_signature(&self) -> (u32, u32) {
        (
            self.time_signature_numerator.load(Ordering::Acquire),
            self.time_signature_denominator.load(Ordering::Acquire),
        )
    }

    pub fn set_time_signature(&self, numerator: u32, denominator: u32) {
        self.time_signature_numerator
            .store(numerator, Ordering::Release);
        self.time_signature_denominator
            .store(denominator, Ordering::Release);
    }

    pub fn audio_content_type(&self) -> AudioContentType {
        if self.float64_mode.load(Ordering::Acquire) {
            AudioContentType::Float64
        } else {
            AudioContentType::Float32
        }
    }

    pub fn set_audio_content_type(&self, content: AudioContentType) {
        self.float64_mode
            .store(content == AudioContentType::Float64, Ordering::Release);
    }

    /// Playback position in quarter notes at the current tempo.
    pub fn ppq_position(&self) -> f64 {
        let seconds = self.playback_position_samples() as f64 / self.sample_rate().max(1) as f64;
        seconds * self.tempo_bpm() / 60.0
    }
}

/// Channel buffers for one audio bus. Both precisions are allocated only
/// when the context is configured for 64-bit content.
pub struct AudioBusBuffers {
    configuration: AudioBusConfiguration,
    f32_channels: Vec<Vec<f32>>,
    f64_channels: Vec<Vec<f64>>,
}

impl AudioBusBuffers {
    fn new(configuration: AudioBusConfiguration, frames: usize, content: AudioContentType) -> Self {
        let channels = configuration.channels() as usize;
        let f64_channels = match content {
            AudioContentType::Float64 => vec![vec![0.0f64; frames]; channels],
            AudioContentType::Float32 => Vec::new(),
        };
        Self {
            configuration,
            f32_channels: vec![vec![0.0f32; frames]; channels],
            f64_channels,
        }
    }

    pub fn configuration(&self) -> &AudioBusConfiguration {
        &self.configuration
    }

    pub fn channel_count(&self) -> usize {
        self.f32_channels.len()
    }
}

/// A per-invocation snapshot handed to format adapters.
pub struct AudioProcessContext {
    master: Arc<MasterContext>,
    frame_count: usize,
    capacity_frames: usize,
    content_type: AudioContentType,
    inputs: Vec<AudioBusBuffers>,
    outputs: Vec<AudioBusBuffers>,
    event_in: EventSequence,
    event_out: EventSequence,
}

impl AudioProcessContext {
    pub fn new(master: Arc<MasterContext>, event_buffer_size_bytes: usize) -> Self {
        Self {
            master,
            frame_count: 0,
            capacity_frames: 0,
            content_type: AudioContentType::Float32,
            inputs: Vec::new(),
            outputs: Vec::new(),
            event_in: EventSequence::with_capacity(event_buffer_size_bytes),
            event_out: EventSequence::with_capacity(event_buffer_size_bytes),
        }
    }

    /// Allocate one main input bus and one main output bus with the given
    /// channel counts. Existing buses are replaced.
    pub fn configure_main_bus(
        &mut self,
        input_channels: u32,
        output_channels: u32,
        frames: usize,
    ) {
        self.configure_main_bus_with_content(
            input_channels,
            output_channels,
            frames,
            AudioContentType::Float32,
        );
    }

    pub fn configure_main_bus_with_content(
        &mut self,
        input_channels: u32,
        output_channels: u32,
        frames: usize,
        content: AudioContentType,
    ) {
        self.capacity_frames = frames;
        self.frame_count = frames;
        self.content_type = content;
        let layout_in = ChannelLayout::new(input_channels);
        let layout_out = ChannelLayout::new(output_channels);
        self.inputs = vec![AudioBusBuffers::new(
            AudioBusConfiguration::new(
                AudioBusDefinition::new("Input", BusRole::Main, vec![layout_in]),
                layout_in,
            ),
            frames,
            content,
        )];
        self.outputs = vec![AudioBusBuffers::new(
            AudioBusConfiguration::new(
                AudioBusDefinition::new("Output", BusRole::Main, vec![layout_out]),
                layout_out,
            ),
            frames,
            content,
        )];
    }

    pub fn master(&self) -> &Arc<MasterContext> {
        &self.master
    }

    pub fn content_type(&self) -> AudioContentType {
        self.content_type
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn set_frame_count(&mut self, frames: usize) {
        self.frame_count = if self.capacity_frames == 0 {
            frames
        } else {
            frames.min(self.capacity_frames)
        };
    }

    pub fn audio_in_bus_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn audio_out_bus_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn input_channel_count(&self, bus: usize) -> usize {
        self.inputs.get(bus).map_or(0, |b| b.channel_count())
    }

    pub fn output_channel_count(&self, bus: usize) -> usize {
        self.outputs.get(bus).map_or(0, |b| b.channel_count())
    }

    pub fn input_f32(&self, bus: usize, channel: usize) -> Option<&[f32]> {
        self.inputs
            .get(bus)?
            .f32_channels
            .get(channel)
            .map(|c| &c[..self.frame_count])
    }

    pub fn input_f32_mut(&mut self, bus: usize, channel: usize) -> Option<&mut [f32]> {
        let frames = self.frame_count;
        self.inputs
            .get_mut(bus)?
            .f32_channels
            .get_mut(channel)
            .map(|c| &mut c[..frames])
    }

    pub fn output_f32(&self, bus: usize, channel: usize) -> Option<&[f32]> {
        self.outputs
            .get(bus)?
            .f32_channels
            .get(channel)
            .map(|c| &c[..self.frame_count])
    }

    pub fn output_f32_mut(&mut self, bus: usize, channel: usize) -> Option<&mut [f32]> {
        let frames = self.frame_count;
        self.outputs
            .get_mut(bus)?
            .f32_channels
            .get_mut(channel)
            .map(|c| &mut c[..frames])
    }

    pub fn input_f64_mut(&mut self, bus: usize, channel: usize) -> Option<&mut [f64]> {
        let frames = self.frame_count;
        self.inputs
            .get_mut(bus)?
            .f64_channels
            .get_mut(channel)
            .map(|c| &mut c[..frames])
    }

    pub fn output_f64_mut(&mut self, bus: usize, channel: usize) -> Option<&mut [f64]> {
        let frames = self.frame_count;
        self.outputs
            .get_mut(bus)?
            .f64_channels
            .get_mut(channel)
            .map(|c| &mut c[..frames])
    }

    /// Raw channel pointers for ABI calls. Only valid while `self` is
    /// mutably borrowed by the caller; adapters must not retain them.
    pub fn input_channel_ptr_f32(&mut self, bus: usize, channel: usize) -> Option<*mut f32> {
        self.inputs
            .get_mut(bus)?
            .f32_channels
            .get_mut(channel)
            .map(|c| c.as_mut_ptr())
    }

    pub fn output_channel_ptr_f32(&mut self, bus: usize, channel: usize) -> Option<*mut f32> {
        self.outputs
            .get_mut(bus)?
            .f32_channels
            .get_mut(channel)
            .map(|c| c.as_mut_ptr())
    }

    pub fn input_channel_ptr_f64(&mut self, bus: usize, channel: usize) -> Option<*mut f64> {
        self.inputs
            .get_mut(bus)?
            .f64_channels
            .get_mut(channel)
            .map(|c| c.as_mut_ptr())
    }

    pub fn output_channel_ptr_f64(&mut self, bus: usize, channel: usize) -> Option<*mut f64> {
        self.outputs
            .get_mut(bus)?
            .f64_channels
            .get_mut(channel)
            .map(|c| c.as_mut_ptr())
    }

    pub fn clear_audio_outputs(&mut self) {
        for bus in &mut self.outputs {
            for channel in &mut bus.f32_channels {
                channel.fill(0.0);
            }
            for channel in &mut bus.f64_channels {
                channel.fill(0.0);
            }
        }
    }

    pub fn clear_audio_inputs(&mut self) {
        for bus in &mut self.inputs {
            for channel in &mut bus.f32_channels {
                channel.fill(0.0);
            }
            for channel in &mut bus.f64_channels {
                channel.fill(0.0);
            }
        }
    }

    /// Make this node's outputs the next node's inputs within one chain.
    pub fn advance_to_next_node(&mut self) {
        std::mem::swap(&mut self.inputs, &mut self.outputs);
    }

    pub fn event_in(&self) -> &EventSequence {
        &self.event_in
    }

    pub fn event_in_mut(&mut self) -> &mut EventSequence {
        &mut self.event_in
    }

    pub fn event_out(&self) -> &EventSequence {
        &self.event_out
    }

    pub fn event_out_mut(&mut self) -> &mut EventSequence {
        &mut self.event_out
    }
}

/// The sequencer's per-track contexts plus the shared master context.
pub struct SequenceProcessContext {
    master: Arc<MasterContext>,
    pub tracks: Vec<AudioProcessContext>,
}

impl SequenceProcessContext {
    pub fn new(master: Arc<MasterContext>) -> Self {
        Self {
            master,
            tracks: Vec::new(),
        }
    }

    pub fn master(&self) -> &Arc<MasterContext> {
        &self.master
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ump::Ump;

    #[test]
    fn test_master_context_defaults() {
        let master = MasterContext::new(48000);
        assert_eq!(master.sample_rate(), 48000);
        assert_eq!(master.tempo_us_per_quarter(), 500_000);
        assert!((master.tempo_bpm() - 120.0).abs() < 1e-9);
        assert_eq!(master.time_signature(), (4, 4));
        assert!(!master.is_playing());
    }

    #[test]
    fn test_ppq_position() {
        let master = MasterContext::new(48000);
        // One second at 120 BPM is two quarter notes.
        master.set_playback_position_samples(48000);
        assert!((master.ppq_position() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_configure_main_bus() {
        let master = Arc::new(MasterContext::new(48000));
        let mut ctx = AudioProcessContext::new(master, 1024);
        ctx.configure_main_bus(2, 2, 256);
        assert_eq!(ctx.audio_in_bus_count(), 1);
        assert_eq!(ctx.audio_out_bus_count(), 1);
        assert_eq!(ctx.output_channel_count(0), 2);
        assert_eq!(ctx.output_f32(0, 0).unwrap().len(), 256);
        assert!(ctx.output_f32(0, 2).is_none());
    }

    #[test]
    fn test_advance_to_next_node_swaps_buffers() {
        let master = Arc::new(MasterContext::new(48000));
        let mut ctx = AudioProcessContext::new(master, 1024);
        ctx.configure_main_bus(2, 2, 64);
        ctx.output_f32_mut(0, 0).unwrap()[0] = 0.5;
        ctx.advance_to_next_node();
        assert_eq!(ctx.input_f32(0, 0).unwrap()[0], 0.5);
    }

    #[test]
    fn test_event_sequences_are_independent() {
        let master = Arc::new(MasterContext::new(48000));
        let mut ctx = AudioProcessContext::new(master, 64);
        ctx.event_in_mut()
            .append(&Ump::midi2_note_on(0, 0, 60, 0, 10, 0))
            .unwrap();
        assert_eq!(ctx.event_in().position(), 8);
        assert_eq!(ctx.event_out().position(), 0);
    }
}
