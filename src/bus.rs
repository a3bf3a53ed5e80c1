//! Planar audio blocks and channel conversion utilities.

use crate::MAX_CHANNELS;

/// A block of planar audio samples with a fixed frame count.
///
/// All channels have the same length. The `is_silent` flag lets
/// consumers skip work for buses that are known to contain only
/// zeros; it is an optimization hint, not a guarantee that a silent
/// bus was never written to.
pub struct AudioBus {
    samples: Vec<f32>,
    channels: usize,
    frames: usize,
    pub is_silent: bool,
}

impl AudioBus {
    pub fn new(channels: usize, frames: usize) -> Self {
        let channels = channels.min(MAX_CHANNELS);
        Self {
            samples: vec![0.0; channels * frames],
            channels,
            frames,
            is_silent: true,
        }
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    #[inline]
    pub fn channel(&self, ch: usize) -> &[f32] {
        &self.samples[ch * self.frames..(ch + 1) * self.frames]
    }

    #[inline]
    pub fn channel_mut(&mut self, ch: usize) -> &mut [f32] {
        &mut self.samples[ch * self.frames..(ch + 1) * self.frames]
    }

    /// Mutably borrow two distinct channels at the same time.
    #[inline]
    pub fn channel_pair_mut(&mut self, a: usize, b: usize) -> (&mut [f32], &mut [f32]) {
        assert!(a < b);
        let (lo, hi) = self.samples.split_at_mut(b * self.frames);
        (
            &mut lo[a * self.frames..(a + 1) * self.frames],
            &mut hi[..self.frames],
        )
    }

    /// Zero every channel and mark the bus silent.
    pub fn clear(&mut self) {
        if !self.is_silent {
            self.samples.fill(0.0);
            self.is_silent = true;
        }
    }

    /// Sum a source bus into this one, applying the channel layout
    /// rules: mono fans out to both stereo channels, stereo folds
    /// down to mono at half gain, anything else is matched channel
    /// for channel with the surplus ignored.
    pub fn mix_from(&mut self, src: &AudioBus) {
        if src.is_silent {
            return;
        }
        let frames = self.frames.min(src.frames);

        match (src.channels, self.channels) {
            (_, 0) | (0, _) => return,
            (1, 2) => {
                let s = src.channel(0);
                let (l, r) = self.channel_pair_mut(0, 1);
                for i in 0..frames {
                    l[i] += s[i];
                    r[i] += s[i];
                }
            }
            (2, 1) => {
                let l = src.channel(0);
                let r = src.channel(1);
                let d = self.channel_mut(0);
                for i in 0..frames {
                    d[i] += 0.5 * (l[i] + r[i]);
                }
            }
            (s_ch, d_ch) => {
                for ch in 0..s_ch.min(d_ch) {
                    let s = src.channel(ch);
                    let d = self.channel_mut(ch);
                    for i in 0..frames {
                        d[i] += s[i];
                    }
                }
            }
        }

        self.is_silent = false;
    }

    /// Sum a single channel of a source bus into this one as a mono
    /// signal. Used for edges that select one output port of a
    /// multi-port source (channel splitters, worklets).
    pub fn mix_from_channel(&mut self, src: &AudioBus, ch: usize) {
        if src.is_silent || ch >= src.channels || self.channels == 0 {
            return;
        }
        let frames = self.frames.min(src.frames);
        let s = src.channel(ch);

        if self.channels == 2 {
            let (l, r) = self.channel_pair_mut(0, 1);
            for i in 0..frames {
                l[i] += s[i];
                r[i] += s[i];
            }
        } else {
            let d = self.channel_mut(0);
            for i in 0..frames {
                d[i] += s[i];
            }
        }

        self.is_silent = false;
    }

    /// Sum a source bus down to mono into channel 0. Parameter buses
    /// are mono, so connected modulation sources fold down first.
    pub fn mix_down_from(&mut self, src: &AudioBus) {
        if src.is_silent || self.channels == 0 {
            return;
        }
        let frames = self.frames.min(src.frames);
        let gain = 1.0 / src.channels as f32;
        for ch in 0..src.channels {
            let s = src.channel(ch);
            let d = self.channel_mut(0);
            if src.channels == 1 {
                for i in 0..frames {
                    d[i] += s[i];
                }
            } else {
                for i in 0..frames {
                    d[i] += s[i] * gain;
                }
            }
        }
        self.is_silent = false;
    }

    /// Copy another bus into this one, adapting the channel count the
    /// same way [`AudioBus::mix_from`] does.
    pub fn copy_from(&mut self, src: &AudioBus) {
        self.clear();
        self.mix_from(src);
    }
}

/// Efficiently interleave a bus into a frame-major buffer.
pub fn interleave(bus: &AudioBus, interleaved: &mut [f32]) {
    let frames = bus.frames().min(interleaved.len() / bus.channels().max(1));

    match bus.channels() {
        0 => {}
        1 => {
            interleaved[..frames].copy_from_slice(&bus.channel(0)[..frames]);
        }
        2 => {
            let ch0 = &bus.channel(0)[..frames];
            let ch1 = &bus.channel(1)[..frames];
            for (out, (s0, s1)) in interleaved
                .chunks_exact_mut(2)
                .zip(ch0.iter().zip(ch1.iter()))
            {
                out[0] = *s0;
                out[1] = *s1;
            }
        }
        n => {
            for ch in 0..n {
                for (out, s) in interleaved
                    .iter_mut()
                    .skip(ch)
                    .step_by(n)
                    .zip(bus.channel(ch).iter())
                {
                    *out = *s;
                }
            }
        }
    }
}

/// Efficiently deinterleave a frame-major buffer into a bus.
pub fn deinterleave(interleaved: &[f32], bus: &mut AudioBus) {
    let frames = bus.frames().min(interleaved.len() / bus.channels().max(1));

    match bus.channels() {
        0 => return,
        1 => {
            bus.channel_mut(0)[..frames].copy_from_slice(&interleaved[..frames]);
        }
        2 => {
            let (ch0, ch1) = bus.channel_pair_mut(0, 1);
            for (input, (s0, s1)) in interleaved
                .chunks_exact(2)
                .zip(ch0.iter_mut().zip(ch1.iter_mut()))
            {
                *s0 = input[0];
                *s1 = input[1];
            }
        }
        n => {
            for ch in 0..n {
                for (input, out) in interleaved
                    .iter()
                    .skip(ch)
                    .step_by(n)
                    .zip(bus.channel_mut(ch).iter_mut())
                {
                    *out = *input;
                }
            }
        }
    }

    bus.is_silent = false;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_fans_out_to_stereo() {
        let mut src = AudioBus::new(1, 4);
        src.channel_mut(0).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        src.is_silent = false;

        let mut dst = AudioBus::new(2, 4);
        dst.mix_from(&src);

        assert_eq!(dst.channel(0), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(dst.channel(1), &[1.0, 2.0, 3.0, 4.0]);
        assert!(!dst.is_silent);
    }

    #[test]
    fn stereo_folds_down_to_mono() {
        let mut src = AudioBus::new(2, 2);
        src.channel_mut(0).copy_from_slice(&[1.0, 1.0]);
        src.channel_mut(1).copy_from_slice(&[0.0, 1.0]);
        src.is_silent = false;

        let mut dst = AudioBus::new(1, 2);
        dst.mix_from(&src);

        assert_eq!(dst.channel(0), &[0.5, 1.0]);
    }

    #[test]
    fn silent_source_is_skipped() {
        let src = AudioBus::new(2, 4);
        let mut dst = AudioBus::new(2, 4);
        dst.mix_from(&src);
        assert!(dst.is_silent);
    }

    #[test]
    fn interleave_round_trip_stereo() {
        let mut bus = AudioBus::new(2, 3);
        bus.channel_mut(0).copy_from_slice(&[1.0, 2.0, 3.0]);
        bus.channel_mut(1).copy_from_slice(&[4.0, 5.0, 6.0]);
        bus.is_silent = false;

        let mut buf = [0.0f32; 6];
        interleave(&bus, &mut buf);
        assert_eq!(buf, [1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

        let mut back = AudioBus::new(2, 3);
        deinterleave(&buf, &mut back);
        assert_eq!(back.channel(0), bus.channel(0));
        assert_eq!(back.channel(1), bus.channel(1));
    }

    #[test]
    fn mix_sums_into_existing_content() {
        let mut a = AudioBus::new(1, 2);
        a.channel_mut(0).copy_from_slice(&[1.0, 1.0]);
        a.is_silent = false;

        let mut dst = AudioBus::new(1, 2);
        dst.mix_from(&a);
        dst.mix_from(&a);
        assert_eq!(dst.channel(0), &[2.0, 2.0]);
    }
}
