//! Host-provided processors.
//!
//! The engine itself never loads code; the embedder supplies a
//! [`ResourceResolver`] that maps a processor name from a worklet
//! description to a concrete [`WorkletProcessor`]. An unresolved name
//! renders silence, so a half-configured page cannot stall or crash
//! the render thread.

use super::{RenderContext, RenderNode};
use crate::bus::AudioBus;
use crate::graph::WorkletDescription;

/// A processor implemented outside the engine. Same real-time
/// contract as [`RenderNode`]: no allocation, locks, or I/O in
/// `process`.
pub trait WorkletProcessor: Send + 'static {
    fn process(
        &mut self,
        cx: &RenderContext,
        inputs: &[AudioBus],
        params: &[AudioBus],
        output: &mut AudioBus,
    );
}

/// Resolves worklet processor names at graph build time, on the
/// control thread.
pub trait ResourceResolver {
    fn create_worklet(
        &mut self,
        name: &str,
        desc: &WorkletDescription,
    ) -> Option<Box<dyn WorkletProcessor>>;
}

/// Resolver for graphs that use no worklets.
pub struct NullResolver;

impl ResourceResolver for NullResolver {
    fn create_worklet(
        &mut self,
        name: &str,
        _desc: &WorkletDescription,
    ) -> Option<Box<dyn WorkletProcessor>> {
        log::warn!("no resolver registered, worklet '{name}' will render silence");
        None
    }
}

pub(crate) struct WorkletNode {
    processor: Option<Box<dyn WorkletProcessor>>,
}

impl WorkletNode {
    pub fn new(processor: Option<Box<dyn WorkletProcessor>>) -> Self {
        Self { processor }
    }
}

impl RenderNode for WorkletNode {
    fn process(
        &mut self,
        cx: &mut RenderContext,
        inputs: &[AudioBus],
        params: &[AudioBus],
        output: &mut AudioBus,
    ) {
        match &mut self.processor {
            Some(p) => p.process(cx, inputs, params, output),
            None => output.clear(),
        }
    }
}
