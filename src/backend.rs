//! The device driver seam.
//!
//! The mixer talks to hardware through [`OutputBackend`] so the core
//! (and its tests) never needs a real device. [`MockBackend`] lets
//! tests pump the mix callback by hand; the cpal implementation lives
//! behind the `cpal-backend` feature.

use std::sync::{Arc, Mutex};

use thiserror::Error;

#[cfg(feature = "cpal-backend")]
mod cpal_backend;
#[cfg(feature = "cpal-backend")]
pub use cpal_backend::CpalBackend;

#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("no output device available")]
    NoDevice,
    #[error("failed to open output stream: {0}")]
    OpenFailed(String),
    #[error("output stream is not running")]
    NotStarted,
    #[error("producer frame stride {0} is not a positive multiple of 4")]
    BadFrameStride(u32),
    #[error("stream operation was abandoned before completion")]
    Abandoned,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Requested device buffering; drivers treat it as a hint.
    pub target_latency_ms: u32,
}

/// Fills an interleaved f32 buffer. Invoked on the device thread.
pub type MixerCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

pub trait OutputBackend {
    type Stream: StreamHandle;

    fn open_stream(
        &mut self,
        config: StreamConfig,
        callback: MixerCallback,
    ) -> Result<Self::Stream, StreamError>;
}

pub trait StreamHandle {
    fn resume(&mut self) -> Result<(), StreamError>;
    fn suspend(&mut self) -> Result<(), StreamError>;
    fn set_volume(&mut self, volume: f32) -> Result<(), StreamError>;
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
}

struct MockShared {
    callback: Option<MixerCallback>,
    playing: bool,
    volume: f32,
    channels: u16,
}

/// Backend for tests: the "device" only runs when the controller
/// pumps it.
pub struct MockBackend {
    shared: Arc<Mutex<MockShared>>,
}

/// Test-side handle for driving a [`MockBackend`] after it has been
/// moved into the mixer.
#[derive(Clone)]
pub struct MockController {
    shared: Arc<Mutex<MockShared>>,
}

impl MockBackend {
    pub fn new() -> (Self, MockController) {
        let shared = Arc::new(Mutex::new(MockShared {
            callback: None,
            playing: false,
            volume: 1.0,
            channels: 0,
        }));
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MockController { shared },
        )
    }
}

impl MockController {
    /// Run the mix callback for `frames` device frames and return the
    /// interleaved output, with the stream volume applied.
    pub fn pump(&self, frames: usize) -> Vec<f32> {
        let mut shared = self.shared.lock().unwrap();
        let channels = shared.channels as usize;
        let mut out = vec![0.0f32; frames * channels];
        if shared.playing {
            let volume = shared.volume;
            if let Some(callback) = shared.callback.as_mut() {
                callback(&mut out);
            }
            for s in &mut out {
                *s *= volume;
            }
        }
        out
    }

    pub fn is_playing(&self) -> bool {
        self.shared.lock().unwrap().playing
    }

    pub fn volume(&self) -> f32 {
        self.shared.lock().unwrap().volume
    }
}

pub struct MockStream {
    shared: Arc<Mutex<MockShared>>,
    sample_rate: u32,
    channels: u16,
}

impl OutputBackend for MockBackend {
    type Stream = MockStream;

    fn open_stream(
        &mut self,
        config: StreamConfig,
        callback: MixerCallback,
    ) -> Result<Self::Stream, StreamError> {
        let mut shared = self.shared.lock().unwrap();
        shared.callback = Some(callback);
        shared.playing = true;
        shared.channels = config.channels;
        Ok(MockStream {
            shared: Arc::clone(&self.shared),
            sample_rate: config.sample_rate,
            channels: config.channels,
        })
    }
}

impl StreamHandle for MockStream {
    fn resume(&mut self) -> Result<(), StreamError> {
        self.shared.lock().unwrap().playing = true;
        Ok(())
    }

    fn suspend(&mut self) -> Result<(), StreamError> {
        self.shared.lock().unwrap().playing = false;
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) -> Result<(), StreamError> {
        self.shared.lock().unwrap().volume = volume.clamp(0.0, 1.0);
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}
