//! In-line processing nodes: gain, panning, filtering.

use std::f32::consts::FRAC_PI_2;

use super::{RenderContext, RenderNode};
use crate::bus::AudioBus;
use crate::graph::IirFilterDescription;

/// Multiplies its input by the audio-rate `gain` parameter.
pub(crate) struct GainNode;

impl RenderNode for GainNode {
    fn process(
        &mut self,
        _cx: &mut RenderContext,
        inputs: &[AudioBus],
        params: &[AudioBus],
        output: &mut AudioBus,
    ) {
        let input = &inputs[0];
        if input.is_silent {
            output.clear();
            return;
        }

        let gain = &params[0];
        for ch in 0..output.channels().min(input.channels()) {
            let src = input.channel(ch);
            let g = gain.channel(0);
            let dst = output.channel_mut(ch);
            for i in 0..dst.len() {
                dst[i] = src[i] * g[i];
            }
        }
        output.is_silent = false;
    }
}

/// Equal-power stereo panner. Mono input pans across the stereo
/// field; stereo input keeps the opposite channel untouched and pans
/// the near channel into it.
pub(crate) struct StereoPannerNode;

impl RenderNode for StereoPannerNode {
    fn process(
        &mut self,
        _cx: &mut RenderContext,
        inputs: &[AudioBus],
        params: &[AudioBus],
        output: &mut AudioBus,
    ) {
        let input = &inputs[0];
        if input.is_silent {
            output.clear();
            return;
        }

        let pan = params[0].channel(0);
        let frames = output.frames();
        let stereo_in = input.channels() >= 2;

        {
            let (out_l, out_r) = output.channel_pair_mut(0, 1);
            for i in 0..frames {
                let p = pan[i].clamp(-1.0, 1.0);
                if stereo_in {
                    let l = input.channel(0)[i];
                    let r = input.channel(1)[i];
                    // Positive pan folds the left channel rightwards,
                    // negative pan folds the right channel leftwards.
                    let x = if p <= 0.0 { p + 1.0 } else { p };
                    let gain_l = (x * FRAC_PI_2).cos();
                    let gain_r = (x * FRAC_PI_2).sin();
                    if p <= 0.0 {
                        out_l[i] = l + r * gain_l;
                        out_r[i] = r * gain_r;
                    } else {
                        out_l[i] = l * gain_l;
                        out_r[i] = r + l * gain_r;
                    }
                } else {
                    let x = (p + 1.0) * 0.5;
                    let s = input.channel(0)[i];
                    out_l[i] = s * (x * FRAC_PI_2).cos();
                    out_r[i] = s * (x * FRAC_PI_2).sin();
                }
            }
        }
        output.is_silent = false;
    }
}

/// Arbitrary-order IIR filter in direct form II transposed, with f64
/// state per channel. Coefficients are fixed for the node's lifetime;
/// any coefficient change rebuilds the node.
pub(crate) struct IirFilterNode {
    feedforward: Vec<f64>,
    feedback: Vec<f64>,
    state: Vec<Vec<f64>>,
}

impl IirFilterNode {
    pub fn new(desc: &IirFilterDescription) -> Self {
        // Normalize so feedback[0] == 1.
        let a0 = desc.feedback[0] as f64;
        let feedforward: Vec<f64> = desc.feedforward.iter().map(|&b| b as f64 / a0).collect();
        let feedback: Vec<f64> = desc.feedback.iter().map(|&a| a as f64 / a0).collect();
        Self {
            feedforward,
            feedback,
            state: Vec::new(),
        }
    }

    pub(crate) fn ensure_channels(&mut self, channels: usize) {
        let order = self.feedforward.len().max(self.feedback.len());
        self.state
            .resize_with(channels, || vec![0.0; order.saturating_sub(1).max(1)]);
    }
}

impl RenderNode for IirFilterNode {
    fn configure(&mut self, input_channels: usize, output_channels: usize) {
        self.ensure_channels(input_channels.min(output_channels).max(1));
    }

    fn process(
        &mut self,
        _cx: &mut RenderContext,
        inputs: &[AudioBus],
        _params: &[AudioBus],
        output: &mut AudioBus,
    ) {
        let input = &inputs[0];
        let channels = output.channels().min(input.channels());
        let order = self.feedforward.len().max(self.feedback.len());

        for ch in 0..channels {
            let src = input.channel(ch);
            let dst = output.channel_mut(ch);
            let state = &mut self.state[ch];

            for i in 0..dst.len() {
                let x = src[i] as f64;
                let y = self.feedforward[0] * x + state[0];

                for k in 1..order {
                    let b = self.feedforward.get(k).copied().unwrap_or(0.0);
                    let a = self.feedback.get(k).copied().unwrap_or(0.0);
                    let next = if k < order - 1 { state[k] } else { 0.0 };
                    state[k - 1] = b * x - a * y + next;
                }

                dst[i] = y as f32;
            }
        }
        output.is_silent = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono_input(samples: &[f32]) -> AudioBus {
        let mut bus = AudioBus::new(1, samples.len());
        bus.channel_mut(0).copy_from_slice(samples);
        bus.is_silent = false;
        bus
    }

    fn mono_param(value: f32, frames: usize) -> AudioBus {
        let mut bus = AudioBus::new(1, frames);
        bus.channel_mut(0).fill(value);
        bus.is_silent = false;
        bus
    }

    #[test]
    fn gain_scales_per_sample() {
        let mut cx = RenderContext::new(48_000.0, 4);
        let inputs = [mono_input(&[1.0, 2.0, 3.0, 4.0])];
        let mut gain = AudioBus::new(1, 4);
        gain.channel_mut(0).copy_from_slice(&[1.0, 0.5, 0.5, 0.0]);
        gain.is_silent = false;
        let mut out = AudioBus::new(1, 4);

        GainNode.process(&mut cx, &inputs, &[gain], &mut out);
        assert_eq!(out.channel(0), &[1.0, 1.0, 1.5, 0.0]);
    }

    #[test]
    fn panner_hard_left_and_right() {
        let mut cx = RenderContext::new(48_000.0, 2);
        let inputs = [mono_input(&[1.0, 1.0])];
        let mut out = AudioBus::new(2, 2);

        StereoPannerNode.process(&mut cx, &inputs, &[mono_param(-1.0, 2)], &mut out);
        assert!((out.channel(0)[0] - 1.0).abs() < 1e-6);
        assert!(out.channel(1)[0].abs() < 1e-6);

        StereoPannerNode.process(&mut cx, &inputs, &[mono_param(1.0, 2)], &mut out);
        assert!(out.channel(0)[0].abs() < 1e-6);
        assert!((out.channel(1)[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn panner_center_is_equal_power() {
        let mut cx = RenderContext::new(48_000.0, 1);
        let inputs = [mono_input(&[1.0])];
        let mut out = AudioBus::new(2, 1);
        StereoPannerNode.process(&mut cx, &inputs, &[mono_param(0.0, 1)], &mut out);

        let expected = (0.5f32).sqrt();
        assert!((out.channel(0)[0] - expected).abs() < 1e-6);
        assert!((out.channel(1)[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn first_order_lowpass_impulse_response() {
        // y[n] = 0.5 x[n] + 0.5 y[n-1]
        let desc = IirFilterDescription {
            feedforward: vec![0.5],
            feedback: vec![1.0, -0.5],
        };
        let mut node = IirFilterNode::new(&desc);
        node.ensure_channels(1);

        let mut cx = RenderContext::new(48_000.0, 4);
        let inputs = [mono_input(&[1.0, 0.0, 0.0, 0.0])];
        let mut out = AudioBus::new(1, 4);
        node.process(&mut cx, &inputs, &[], &mut out);

        let got = out.channel(0);
        for (i, expected) in [0.5, 0.25, 0.125, 0.0625].iter().enumerate() {
            assert!((got[i] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn filter_history_carries_across_blocks() {
        let desc = IirFilterDescription {
            feedforward: vec![0.5],
            feedback: vec![1.0, -0.5],
        };
        let mut node = IirFilterNode::new(&desc);
        node.ensure_channels(1);
        let mut cx = RenderContext::new(48_000.0, 2);

        let mut out = AudioBus::new(1, 2);
        node.process(&mut cx, &[mono_input(&[1.0, 0.0])], &[], &mut out);
        node.process(&mut cx, &[mono_input(&[0.0, 0.0])], &[], &mut out);

        // The tail continues from the first block's state.
        assert!((out.channel(0)[0] - 0.125).abs() < 1e-6);
        assert!((out.channel(0)[1] - 0.0625).abs() < 1e-6);
    }
}
