//! Channel routing nodes and the graph terminals.

use super::{RenderContext, RenderNode};
use crate::bus::AudioBus;

/// The graph terminal. Its output bus is what the session pushes
/// into its transport ring.
pub(crate) struct DestinationNode;

impl RenderNode for DestinationNode {
    fn process(
        &mut self,
        _cx: &mut RenderContext,
        inputs: &[AudioBus],
        _params: &[AudioBus],
        output: &mut AudioBus,
    ) {
        output.copy_from(&inputs[0]);
    }
}

/// Fans the channels of its input out as one mono port per channel.
/// Downstream edges select a port via their source-output index.
pub(crate) struct ChannelSplitterNode;

impl RenderNode for ChannelSplitterNode {
    fn process(
        &mut self,
        _cx: &mut RenderContext,
        inputs: &[AudioBus],
        _params: &[AudioBus],
        output: &mut AudioBus,
    ) {
        let input = &inputs[0];
        if input.is_silent {
            output.clear();
            return;
        }

        for ch in 0..output.channels() {
            if ch < input.channels() {
                let frames = output.frames();
                let src = input.channel(ch);
                output.channel_mut(ch)[..frames].copy_from_slice(&src[..frames]);
            } else {
                output.channel_mut(ch).fill(0.0);
            }
        }
        output.is_silent = false;
    }
}

/// Merges N mono input ports into one N-channel bus. Port buses that
/// arrive with more than one channel are taken by their first
/// channel.
pub(crate) struct ChannelMergerNode;

impl RenderNode for ChannelMergerNode {
    fn process(
        &mut self,
        _cx: &mut RenderContext,
        inputs: &[AudioBus],
        _params: &[AudioBus],
        output: &mut AudioBus,
    ) {
        output.is_silent = true;
        for ch in 0..output.channels() {
            match inputs.get(ch) {
                Some(port) if !port.is_silent => {
                    let frames = output.frames();
                    let src = port.channel(0);
                    output.channel_mut(ch)[..frames].copy_from_slice(&src[..frames]);
                    output.is_silent = false;
                }
                _ => output.channel_mut(ch).fill(0.0),
            }
        }
    }
}

/// Publishes its pose parameters into the render context for
/// downstream spatializers. Produces no audio.
pub(crate) struct ListenerNode;

impl RenderNode for ListenerNode {
    fn process(
        &mut self,
        cx: &mut RenderContext,
        _inputs: &[AudioBus],
        params: &[AudioBus],
        output: &mut AudioBus,
    ) {
        // Last value of the quantum wins, matching control-rate pose
        // updates.
        let last = cx.quantum - 1;
        let at = |i: usize| params[i].channel(0)[last];
        cx.listener.position = [at(0), at(1), at(2)];
        cx.listener.forward = [at(3), at(4), at(5)];
        cx.listener.up = [at(6), at(7), at(8)];
        output.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitter_copies_channels_and_silences_surplus_ports() {
        let mut cx = RenderContext::new(48_000.0, 2);
        let mut input = AudioBus::new(2, 2);
        input.channel_mut(0).copy_from_slice(&[1.0, 2.0]);
        input.channel_mut(1).copy_from_slice(&[3.0, 4.0]);
        input.is_silent = false;

        let mut out = AudioBus::new(3, 2);
        ChannelSplitterNode.process(&mut cx, &[input], &[], &mut out);
        assert_eq!(out.channel(0), &[1.0, 2.0]);
        assert_eq!(out.channel(1), &[3.0, 4.0]);
        assert_eq!(out.channel(2), &[0.0, 0.0]);
    }

    #[test]
    fn merger_builds_a_multichannel_bus() {
        let mut cx = RenderContext::new(48_000.0, 2);
        let mut a = AudioBus::new(1, 2);
        a.channel_mut(0).copy_from_slice(&[1.0, 1.0]);
        a.is_silent = false;
        let b = AudioBus::new(1, 2);

        let mut out = AudioBus::new(2, 2);
        ChannelMergerNode.process(&mut cx, &[a, b], &[], &mut out);
        assert_eq!(out.channel(0), &[1.0, 1.0]);
        assert_eq!(out.channel(1), &[0.0, 0.0]);
        assert!(!out.is_silent);
    }

    #[test]
    fn listener_updates_the_context_pose() {
        let mut cx = RenderContext::new(48_000.0, 4);
        let params: Vec<AudioBus> = (0..9)
            .map(|i| {
                let mut bus = AudioBus::new(1, 4);
                bus.channel_mut(0).fill(i as f32);
                bus.is_silent = false;
                bus
            })
            .collect();
        let mut out = AudioBus::new(1, 4);

        ListenerNode.process(&mut cx, &[], &params, &mut out);
        assert_eq!(cx.listener.position, [0.0, 1.0, 2.0]);
        assert_eq!(cx.listener.forward, [3.0, 4.0, 5.0]);
        assert_eq!(cx.listener.up, [6.0, 7.0, 8.0]);
    }
}
