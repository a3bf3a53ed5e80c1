//! The render-thread half of the engine: node processors and the
//! graph that drives them.
//!
//! Everything in this module obeys the render-thread contract: after
//! construction (which happens on the control thread), processing a
//! quantum performs no allocation, takes no locks, and does no I/O.

mod effects;
mod graph;
mod routing;
mod session;
mod sources;
mod worklet;

pub use graph::RenderGraph;
pub use session::RenderSession;
pub use worklet::{NullResolver, ResourceResolver, WorkletProcessor};

use crate::bus::AudioBus;
use crate::graph::{GraphNodeDescription, ListenerDescription};

/// Listener pose shared with spatializing nodes during a quantum.
#[derive(Debug, Clone, Copy)]
pub struct ListenerState {
    pub position: [f32; 3],
    pub forward: [f32; 3],
    pub up: [f32; 3],
}

impl Default for ListenerState {
    fn default() -> Self {
        let d = ListenerDescription::default();
        Self {
            position: d.position,
            forward: d.forward,
            up: d.up,
        }
    }
}

pub struct RenderContext {
    pub sample_rate: f32,
    pub sample_rate_recip: f32,
    /// Frames per processing block.
    pub quantum: usize,
    /// Absolute frame index of the first frame of this quantum.
    pub current_frame: u64,
    pub listener: ListenerState,
}

impl RenderContext {
    pub(crate) fn new(sample_rate: f32, quantum: usize) -> Self {
        Self {
            sample_rate,
            sample_rate_recip: sample_rate.recip(),
            quantum,
            current_frame: 0,
            listener: ListenerState::default(),
        }
    }
}

/// The real-time counterpart to a [`GraphNodeDescription`].
///
/// `inputs` holds one pre-mixed bus per input port and `params` one
/// mono bus per parameter, both filled by the graph before the call.
pub trait RenderNode: Send + 'static {
    fn process(
        &mut self,
        cx: &mut RenderContext,
        inputs: &[AudioBus],
        params: &[AudioBus],
        output: &mut AudioBus,
    );

    /// Size internal state for the bus layout chosen at build time.
    /// Called once on the control thread before the node is handed to
    /// the render thread.
    #[allow(unused)]
    fn configure(&mut self, input_channels: usize, output_channels: usize) {}

    /// Apply an in-place description update. Only called for changes
    /// classified as not disturbing DSP state.
    #[allow(unused)]
    fn apply_description(&mut self, description: &GraphNodeDescription) {}

    /// Begin producing at the given absolute frame. Only meaningful
    /// for source nodes.
    #[allow(unused)]
    fn schedule_start(&mut self, frame: u64) {}

    /// Become silent at or after the given absolute frame.
    #[allow(unused)]
    fn schedule_stop(&mut self, frame: u64) {}
}

pub(crate) fn make_render_node(
    desc: &GraphNodeDescription,
    resolver: &mut dyn ResourceResolver,
) -> Box<dyn RenderNode> {
    match desc {
        GraphNodeDescription::Destination(_) => Box::new(routing::DestinationNode),
        GraphNodeDescription::Gain(_) => Box::new(effects::GainNode),
        GraphNodeDescription::ConstantSource(_) => {
            Box::new(sources::ConstantSourceNode::default())
        }
        GraphNodeDescription::Oscillator(d) => Box::new(sources::OscillatorNode::new(d)),
        GraphNodeDescription::ChannelSplitter(_) => Box::new(routing::ChannelSplitterNode),
        GraphNodeDescription::ChannelMerger(_) => Box::new(routing::ChannelMergerNode),
        GraphNodeDescription::StereoPanner(_) => Box::new(effects::StereoPannerNode),
        GraphNodeDescription::IirFilter(d) => Box::new(effects::IirFilterNode::new(d)),
        GraphNodeDescription::Listener(_) => Box::new(routing::ListenerNode),
        GraphNodeDescription::Worklet(d) => Box::new(worklet::WorkletNode::new(
            resolver.create_worklet(&d.processor_name, d),
        )),
    }
}
