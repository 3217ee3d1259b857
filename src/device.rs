//! Device-callback dispatcher.
//!
//! Bridges a cpal output stream to the sequencer engine. The callback
//! try-locks the engine and outputs silence on contention rather than
//! blocking the device thread; the engine's own event queues carry input
//! posted while a block was in flight into the next block.

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};

use crate::context::AudioProcessContext;
use crate::error::HostError;
use crate::sequencer::SequencerEngine;

pub struct DeviceIODispatcher {
    _stream: Stream,
    engine: Arc<Mutex<SequencerEngine>>,
    sample_rate: u32,
    channels: usize,
}

impl DeviceIODispatcher {
    /// Open the default output device and start dispatching into `engine`.
    /// `event_buffer_size_bytes` sizes the device-side UMP sequences.
    pub fn open_default(
        engine: Arc<Mutex<SequencerEngine>>,
        event_buffer_size_bytes: usize,
    ) -> Result<Self, HostError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| HostError::FailedToConfigure("no output device found".to_string()))?;
        let config = device
            .default_output_config()
            .map_err(|e| HostError::FailedToConfigure(e.to_string()))?;

        let sample_rate = config.sample_rate().0;
        let channels = config.channels() as usize;

        {
            let mut engine = engine.lock().unwrap();
            engine.set_default_channels(channels as u32, channels as u32);
        }

        let master = engine.lock().unwrap().master().clone();
        let mut context = AudioProcessContext::new(master, event_buffer_size_bytes);
        // Sized generously; the callback clamps to the device block length.
        context.configure_main_bus(channels as u32, channels as u32, 8192);

        let stream = match config.sample_format() {
            SampleFormat::F32 => Self::build_stream::<f32>(
                &device,
                &config.into(),
                engine.clone(),
                context,
            ),
            SampleFormat::I16 => Self::build_stream::<i16>(
                &device,
                &config.into(),
                engine.clone(),
                context,
            ),
            SampleFormat::U16 => Self::build_stream::<u16>(
                &device,
                &config.into(),
                engine.clone(),
                context,
            ),
            other => {
                return Err(HostError::FailedToConfigure(format!(
                    "unsupported sample format {other:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| HostError::FailedToStartProcessing(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            engine,
            sample_rate,
            channels,
        })
    }

    fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
        device: &cpal::Device,
        config: &StreamConfig,
        engine: Arc<Mutex<SequencerEngine>>,
        mut context: AudioProcessContext,
    ) -> Result<Stream, HostError> {
        let channels = config.channels as usize;
        let stream = device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    Self::device_callback(data, channels, &engine, &mut context);
                },
                |err| log::error!("audio stream error: {err}"),
                None,
            )
            .map_err(|e| HostError::FailedToConfigure(e.to_string()))?;
        Ok(stream)
    }

    fn device_callback<T: cpal::SizedSample + cpal::FromSample<f32>>(
        data: &mut [T],
        channels: usize,
        engine: &Arc<Mutex<SequencerEngine>>,
        context: &mut AudioProcessContext,
    ) {
        // Never block the device thread: silence when the engine is busy.
        let Ok(mut engine) = engine.try_lock() else {
            for sample in data.iter_mut() {
                *sample = T::EQUILIBRIUM;
            }
            return;
        };

        let frames = data.len() / channels.max(1);
        context.set_frame_count(frames);
        context.clear_audio_inputs();
        context.event_in_mut().set_position(0);
        context.event_out_mut().set_position(0);

        if engine.process_audio(context).is_err() {
            // The block is discarded but the stream continues.
            for sample in data.iter_mut() {
                *sample = T::EQUILIBRIUM;
            }
            return;
        }

        for frame in 0..frames {
            for channel in 0..channels {
                let value = context
                    .output_f32(0, channel)
                    .map(|samples| samples[frame])
                    .unwrap_or(0.0);
                data[frame * channels + channel] = T::from_sample(value);
            }
        }
    }

    pub fn engine(&self) -> &Arc<Mutex<SequencerEngine>> {
        &self.engine
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}
