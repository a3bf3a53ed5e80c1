//! Source nodes: no audio inputs, schedulable start/stop.

use std::f64::consts::TAU;

use super::{RenderContext, RenderNode};
use crate::bus::AudioBus;
use crate::graph::{GraphNodeDescription, OscillatorDescription, Waveform};

/// Absolute-frame start/stop window shared by source nodes.
///
/// Activity is decided per sample against absolute frame indices, so
/// a stop command delivered a quantum early renders bit-identically
/// to one delivered on time.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SourceClock {
    start: Option<u64>,
    stop: Option<u64>,
}

impl SourceClock {
    pub fn schedule_start(&mut self, frame: u64) {
        self.start = Some(frame);
    }

    pub fn schedule_stop(&mut self, frame: u64) {
        self.stop = Some(frame);
    }

    #[inline]
    pub fn is_active(&self, frame: u64) -> bool {
        match self.start {
            Some(start) if frame >= start => self.stop.map_or(true, |stop| frame < stop),
            _ => false,
        }
    }
}

/// Emits its `offset` parameter while started.
#[derive(Default)]
pub(crate) struct ConstantSourceNode {
    clock: SourceClock,
}

impl RenderNode for ConstantSourceNode {
    fn process(
        &mut self,
        cx: &mut RenderContext,
        _inputs: &[AudioBus],
        params: &[AudioBus],
        output: &mut AudioBus,
    ) {
        let offset = params[0].channel(0);
        let start = cx.current_frame;
        let mut active = false;

        let out = output.channel_mut(0);
        for i in 0..cx.quantum {
            if self.clock.is_active(start + i as u64) {
                out[i] = offset[i];
                active = true;
            } else {
                out[i] = 0.0;
            }
        }
        output.is_silent = !active;
    }

    fn schedule_start(&mut self, frame: u64) {
        self.clock.schedule_start(frame);
    }

    fn schedule_stop(&mut self, frame: u64) {
        self.clock.schedule_stop(frame);
    }
}

/// Naive periodic waveform generator.
///
/// Frequency and detune are audio-rate parameters. The phase
/// accumulator is f64 and survives in-place updates, and it keeps
/// advancing while the source is started even if nothing downstream
/// listens, so rewiring the graph never changes what the oscillator
/// would have produced.
pub(crate) struct OscillatorNode {
    waveform: Waveform,
    phase: f64,
    clock: SourceClock,
}

impl OscillatorNode {
    pub fn new(desc: &OscillatorDescription) -> Self {
        Self {
            waveform: desc.waveform,
            phase: 0.0,
            clock: SourceClock::default(),
        }
    }
}

impl RenderNode for OscillatorNode {
    fn process(
        &mut self,
        cx: &mut RenderContext,
        _inputs: &[AudioBus],
        params: &[AudioBus],
        output: &mut AudioBus,
    ) {
        let frequency = params[0].channel(0);
        let detune = params[1].channel(0);
        let start = cx.current_frame;
        let mut active = false;

        let out = output.channel_mut(0);
        for i in 0..cx.quantum {
            if !self.clock.is_active(start + i as u64) {
                out[i] = 0.0;
                continue;
            }

            let freq = frequency[i] as f64 * (detune[i] as f64 / 1200.0).exp2();
            out[i] = match self.waveform {
                Waveform::Sine => (self.phase * TAU).sin() as f32,
                Waveform::Square => {
                    if self.phase < 0.5 {
                        1.0
                    } else {
                        -1.0
                    }
                }
                Waveform::Sawtooth => (2.0 * self.phase - 1.0) as f32,
                Waveform::Triangle => (4.0 * (self.phase - 0.5).abs() - 1.0) as f32,
            };
            active = true;

            self.phase += freq * cx.sample_rate_recip as f64;
            self.phase -= self.phase.floor();
        }
        output.is_silent = !active;
    }

    fn apply_description(&mut self, description: &GraphNodeDescription) {
        if let GraphNodeDescription::Oscillator(d) = description {
            self.waveform = d.waveform;
        }
    }

    fn schedule_start(&mut self, frame: u64) {
        self.clock.schedule_start(frame);
    }

    fn schedule_stop(&mut self, frame: u64) {
        self.clock.schedule_stop(frame);
    }
}
