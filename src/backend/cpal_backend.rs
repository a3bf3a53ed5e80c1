//! cpal-backed output stream.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::{MixerCallback, OutputBackend, StreamConfig, StreamError, StreamHandle};

/// Opens streams on the host's default output device.
#[derive(Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl OutputBackend for CpalBackend {
    type Stream = CpalStream;

    fn open_stream(
        &mut self,
        config: StreamConfig,
        mut callback: MixerCallback,
    ) -> Result<CpalStream, StreamError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(StreamError::NoDevice)?;
        let device_config = device
            .default_output_config()
            .map_err(|e| StreamError::OpenFailed(e.to_string()))?;

        let buffer_frames =
            (config.target_latency_ms as u64 * config.sample_rate as u64 / 1000).max(64) as u32;
        let stream_config = cpal::StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(buffer_frames),
        };

        // Software volume, applied after the mix so the device format
        // conversion sees the final samples.
        let volume = Arc::new(AtomicU32::new(1.0f32.to_bits()));
        let err_fn = |err| log::warn!("output stream error: {err}");

        let stream = match device_config.sample_format() {
            cpal::SampleFormat::F32 => {
                let vol = Arc::clone(&volume);
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        callback(data);
                        let v = f32::from_bits(vol.load(Ordering::Relaxed));
                        if v != 1.0 {
                            for s in data.iter_mut() {
                                *s *= v;
                            }
                        }
                    },
                    err_fn,
                    None,
                )
            }
            cpal::SampleFormat::I16 => {
                let vol = Arc::clone(&volume);
                let mut scratch: Vec<f32> = Vec::new();
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        scratch.resize(data.len(), 0.0);
                        callback(&mut scratch);
                        let v = f32::from_bits(vol.load(Ordering::Relaxed));
                        for (d, s) in data.iter_mut().zip(&scratch) {
                            *d = ((s * v).clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                        }
                    },
                    err_fn,
                    None,
                )
            }
            cpal::SampleFormat::U16 => {
                let vol = Arc::clone(&volume);
                let mut scratch: Vec<f32> = Vec::new();
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                        scratch.resize(data.len(), 0.0);
                        callback(&mut scratch);
                        let v = f32::from_bits(vol.load(Ordering::Relaxed));
                        for (d, s) in data.iter_mut().zip(&scratch) {
                            let clamped = (s * v).clamp(-1.0, 1.0);
                            *d = ((clamped * 0.5 + 0.5) * u16::MAX as f32) as u16;
                        }
                    },
                    err_fn,
                    None,
                )
            }
            other => {
                return Err(StreamError::OpenFailed(format!(
                    "unsupported sample format {other:?}"
                )))
            }
        }
        .map_err(|e| StreamError::OpenFailed(e.to_string()))?;

        stream
            .play()
            .map_err(|e| StreamError::OpenFailed(e.to_string()))?;

        Ok(CpalStream {
            stream,
            volume,
            sample_rate: config.sample_rate,
            channels: config.channels,
        })
    }
}

pub struct CpalStream {
    stream: cpal::Stream,
    volume: Arc<AtomicU32>,
    sample_rate: u32,
    channels: u16,
}

impl StreamHandle for CpalStream {
    fn resume(&mut self) -> Result<(), StreamError> {
        self.stream
            .play()
            .map_err(|e| StreamError::OpenFailed(e.to_string()))
    }

    fn suspend(&mut self) -> Result<(), StreamError> {
        self.stream
            .pause()
            .map_err(|e| StreamError::OpenFailed(e.to_string()))
    }

    fn set_volume(&mut self, volume: f32) -> Result<(), StreamError> {
        self.volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}
