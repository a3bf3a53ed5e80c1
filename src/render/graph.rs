//! The compiled render graph.
//!
//! Built on the control thread from a [`GraphDescription`], then
//! moved to the render thread whole. Nodes are stored in dependency
//! order (Kahn's algorithm), every bus is preallocated at build time,
//! and edges are mixed into per-port input buses before each node
//! runs, so a quantum is rendered with no allocation and no locks.

use std::collections::VecDeque;
use std::mem;

use ahash::AHashMap;
use arrayvec::ArrayVec;
use smallvec::SmallVec;

use super::{make_render_node, RenderContext, RenderNode, ResourceResolver};
use crate::bus::AudioBus;
use crate::graph::{GraphDescription, GraphError, GraphNodeDescription, NodeId};

const MAX_PENDING_PARAM_EVENTS: usize = 32;

#[derive(Debug, Clone, Copy)]
struct ParamEvent {
    frame: u64,
    value: f32,
}

struct ParamState {
    value: f32,
    pending: ArrayVec<ParamEvent, MAX_PENDING_PARAM_EVENTS>,
}

#[derive(Clone, Copy)]
struct InEdge {
    source: usize,
    source_output: u32,
    dest_input: u32,
}

#[derive(Clone, Copy)]
struct ParamEdge {
    source: usize,
    source_output: u32,
    param_index: u32,
}

struct RenderNodeEntry {
    id: NodeId,
    node: Box<dyn RenderNode>,
    /// One pre-mixed bus per input port.
    inputs: Vec<AudioBus>,
    output: AudioBus,
    param_states: Vec<ParamState>,
    /// Mono automation buses, parallel to `param_states`.
    param_buses: Vec<AudioBus>,
    /// Audio edges into this node; sources are earlier in the order.
    in_edges: SmallVec<[InEdge; 4]>,
    param_edges: SmallVec<[ParamEdge; 2]>,
    /// Output ports are modeled as channels of the output bus.
    multi_port: bool,
    is_source: bool,
    reaches_destination: bool,
}

pub struct RenderGraph {
    entries: Vec<RenderNodeEntry>,
    index_of: AHashMap<NodeId, usize>,
    destination: usize,
    context: RenderContext,
}

impl RenderGraph {
    pub fn build(
        desc: &GraphDescription,
        quantum: usize,
        resolver: &mut dyn ResourceResolver,
    ) -> Result<Box<Self>, GraphError> {
        let n = desc.nodes.len();

        let pos_of: AHashMap<NodeId, usize> = desc
            .nodes
            .iter()
            .enumerate()
            .map(|(i, (id, _))| (*id, i))
            .collect();
        let lookup = |id: NodeId| pos_of.get(&id).copied().ok_or(GraphError::UnknownNode(id));

        let dest_pos = *pos_of
            .get(&desc.destination)
            .ok_or(GraphError::MissingDestination(desc.destination))?;

        // Validate edges and build adjacency.
        let mut in_degree = vec![0usize; n];
        let mut outgoing: Vec<SmallVec<[usize; 4]>> = vec![SmallVec::new(); n];
        let mut incoming: Vec<SmallVec<[usize; 4]>> = vec![SmallVec::new(); n];

        for c in &desc.connections {
            let s = lookup(c.source)?;
            let d = lookup(c.dest)?;
            if c.source_output >= desc.nodes[s].1.output_ports() {
                return Err(GraphError::BadOutputPort {
                    node: c.source,
                    port: c.source_output,
                });
            }
            if c.dest_input >= desc.nodes[d].1.input_ports() {
                return Err(GraphError::BadInputPort {
                    node: c.dest,
                    port: c.dest_input,
                });
            }
            outgoing[s].push(d);
            incoming[d].push(s);
            in_degree[d] += 1;
        }
        for c in &desc.param_connections {
            let s = lookup(c.source)?;
            let d = lookup(c.dest)?;
            if c.source_output >= desc.nodes[s].1.output_ports() {
                return Err(GraphError::BadOutputPort {
                    node: c.source,
                    port: c.source_output,
                });
            }
            if c.param_index >= desc.nodes[d].1.param_count() {
                return Err(GraphError::BadParamIndex {
                    node: c.dest,
                    index: c.param_index,
                });
            }
            outgoing[s].push(d);
            incoming[d].push(s);
            in_degree[d] += 1;
        }

        // Dependency order. Ready nodes are taken in description
        // order so equal graphs compile to equal schedules.
        let mut ready: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut topo: Vec<usize> = Vec::with_capacity(n);
        let mut remaining = in_degree.clone();
        while let Some(i) = ready.pop_front() {
            topo.push(i);
            for &d in &outgoing[i] {
                remaining[d] -= 1;
                if remaining[d] == 0 {
                    ready.push_back(d);
                }
            }
        }
        if topo.len() != n {
            let stuck = (0..n)
                .find(|&i| remaining[i] > 0)
                .map(|i| desc.nodes[i].0)
                .unwrap_or(desc.destination);
            return Err(GraphError::Cycle(stuck));
        }

        let mut topo_pos = vec![0usize; n];
        for (t, &p) in topo.iter().enumerate() {
            topo_pos[p] = t;
        }

        // Static channel layout, propagated in dependency order. The
        // effective width of an edge from a multi-port source is one
        // channel.
        let mut out_channels = vec![1usize; n];
        let mut in_port_channels: Vec<Vec<usize>> = desc
            .nodes
            .iter()
            .map(|(_, d)| vec![1usize; d.input_ports() as usize])
            .collect();

        let widest_in = |out_channels: &[usize], p: usize, port: u32| -> usize {
            desc.connections
                .iter()
                .filter(|c| pos_of[&c.dest] == p && c.dest_input == port)
                .map(|c| {
                    let s = pos_of[&c.source];
                    if desc.nodes[s].1.output_ports() > 1 {
                        1
                    } else {
                        out_channels[s]
                    }
                })
                .max()
                .unwrap_or(1)
        };

        for &p in &topo {
            let node_desc = &desc.nodes[p].1;
            match node_desc {
                GraphNodeDescription::Destination(d) => {
                    in_port_channels[p][0] = d.channel_count as usize;
                    out_channels[p] = d.channel_count as usize;
                }
                GraphNodeDescription::Gain(_) | GraphNodeDescription::IirFilter(_) => {
                    let ch = widest_in(&out_channels, p, 0);
                    in_port_channels[p][0] = ch;
                    out_channels[p] = ch;
                }
                GraphNodeDescription::ConstantSource(_)
                | GraphNodeDescription::Oscillator(_) => {
                    out_channels[p] = 1;
                }
                GraphNodeDescription::ChannelSplitter(d) => {
                    in_port_channels[p][0] = widest_in(&out_channels, p, 0);
                    out_channels[p] = d.output_count as usize;
                }
                GraphNodeDescription::ChannelMerger(d) => {
                    out_channels[p] = d.input_count as usize;
                }
                GraphNodeDescription::StereoPanner(_) => {
                    in_port_channels[p][0] = widest_in(&out_channels, p, 0).min(2);
                    out_channels[p] = 2;
                }
                GraphNodeDescription::Listener(_) => {
                    out_channels[p] = 1;
                }
                GraphNodeDescription::Worklet(d) => {
                    for port in 0..d.input_count {
                        in_port_channels[p][port as usize] = widest_in(&out_channels, p, port);
                    }
                    out_channels[p] = d.output_count.max(1) as usize;
                }
            }
        }

        // Nodes with no path to the destination are skipped at render
        // time unless they are running sources.
        let mut reaches = vec![false; n];
        let mut bfs = VecDeque::from([dest_pos]);
        reaches[dest_pos] = true;
        while let Some(i) = bfs.pop_front() {
            for &s in &incoming[i] {
                if !reaches[s] {
                    reaches[s] = true;
                    bfs.push_back(s);
                }
            }
        }

        let mut entries = Vec::with_capacity(n);
        let mut index_of = AHashMap::with_capacity(n);
        for (t, &p) in topo.iter().enumerate() {
            let (id, node_desc) = &desc.nodes[p];
            let mut node = make_render_node(node_desc, resolver);
            node.configure(
                in_port_channels[p].first().copied().unwrap_or(0),
                out_channels[p],
            );

            let param_count = node_desc.param_count() as usize;
            let param_states = (0..param_count)
                .map(|i| ParamState {
                    value: node_desc.param_default(i as u32),
                    pending: ArrayVec::new(),
                })
                .collect();
            let param_buses = (0..param_count).map(|_| AudioBus::new(1, quantum)).collect();

            let in_edges = desc
                .connections
                .iter()
                .filter(|c| pos_of[&c.dest] == p)
                .map(|c| InEdge {
                    source: topo_pos[pos_of[&c.source]],
                    source_output: c.source_output,
                    dest_input: c.dest_input,
                })
                .collect();
            let param_edges = desc
                .param_connections
                .iter()
                .filter(|c| pos_of[&c.dest] == p)
                .map(|c| ParamEdge {
                    source: topo_pos[pos_of[&c.source]],
                    source_output: c.source_output,
                    param_index: c.param_index,
                })
                .collect();

            index_of.insert(*id, t);
            entries.push(RenderNodeEntry {
                id: *id,
                node,
                inputs: in_port_channels[p]
                    .iter()
                    .map(|&ch| AudioBus::new(ch, quantum))
                    .collect(),
                output: AudioBus::new(out_channels[p], quantum),
                param_states,
                param_buses,
                in_edges,
                param_edges,
                multi_port: node_desc.output_ports() > 1,
                is_source: node_desc.is_source(),
                reaches_destination: reaches[p],
            });
        }

        Ok(Box::new(Self {
            entries,
            index_of,
            destination: topo_pos[dest_pos],
            context: RenderContext::new(desc.sample_rate, quantum),
        }))
    }

    pub fn sample_rate(&self) -> f32 {
        self.context.sample_rate
    }

    pub fn current_frame(&self) -> u64 {
        self.context.current_frame
    }

    pub fn output_channels(&self) -> usize {
        self.entries[self.destination].output.channels()
    }

    /// The destination node's bus for the quantum rendered last.
    pub fn destination_output(&self) -> &AudioBus {
        &self.entries[self.destination].output
    }

    /// Render exactly one quantum and advance the frame counter.
    pub fn process_quantum(&mut self) {
        let frame = self.context.current_frame;

        for i in 0..self.entries.len() {
            let (done, rest) = self.entries.split_at_mut(i);
            let entry = &mut rest[0];

            if !entry.reaches_destination && !entry.is_source {
                entry.output.clear();
                continue;
            }

            // Mix audio edges into the per-port input buses. Every
            // edge source is earlier in the dependency order.
            for bus in &mut entry.inputs {
                bus.clear();
            }
            for e in &entry.in_edges {
                let src = &done[e.source];
                let dst = &mut entry.inputs[e.dest_input as usize];
                if src.multi_port {
                    dst.mix_from_channel(&src.output, e.source_output as usize);
                } else {
                    dst.mix_from(&src.output);
                }
            }

            // Fill automation buses: intrinsic value plus pending
            // events, then summed modulation edges.
            for (state, bus) in entry
                .param_states
                .iter_mut()
                .zip(entry.param_buses.iter_mut())
            {
                fill_param_bus(state, bus, frame);
            }
            for e in &entry.param_edges {
                let src = &done[e.source];
                let bus = &mut entry.param_buses[e.param_index as usize];
                if src.multi_port {
                    bus.mix_from_channel(&src.output, e.source_output as usize);
                } else {
                    bus.mix_down_from(&src.output);
                }
            }

            let RenderNodeEntry {
                node,
                inputs,
                param_buses,
                output,
                ..
            } = entry;
            node.process(&mut self.context, inputs, param_buses, output);
        }

        self.context.current_frame += self.context.quantum as u64;
    }

    pub(crate) fn schedule_start(&mut self, node: NodeId, when_frame: Option<u64>) {
        let frame = when_frame.unwrap_or(self.context.current_frame);
        if let Some(&i) = self.index_of.get(&node) {
            self.entries[i].node.schedule_start(frame);
        }
    }

    pub(crate) fn schedule_stop(&mut self, node: NodeId, when_frame: Option<u64>) {
        let frame = when_frame.unwrap_or(self.context.current_frame);
        if let Some(&i) = self.index_of.get(&node) {
            self.entries[i].node.schedule_stop(frame);
        }
    }

    pub(crate) fn set_param(&mut self, node: NodeId, param_index: u32, value: f32, when_frame: u64) {
        let Some(&i) = self.index_of.get(&node) else {
            return;
        };
        let Some(state) = self.entries[i].param_states.get_mut(param_index as usize) else {
            return;
        };
        let event = ParamEvent {
            frame: when_frame,
            value,
        };
        if state.pending.try_push(event).is_err() {
            // Saturated; the change takes effect at the next quantum
            // start instead of its exact frame.
            state.value = value;
        }
    }

    pub(crate) fn apply_description(&mut self, node: NodeId, desc: &GraphNodeDescription) {
        let Some(&i) = self.index_of.get(&node) else {
            return;
        };
        let entry = &mut self.entries[i];
        for (idx, state) in entry.param_states.iter_mut().enumerate() {
            state.value = desc.param_default(idx as u32);
        }
        entry.node.apply_description(desc);
    }

    /// Move DSP state (node internals, parameter values, pending
    /// automation) from `old` into this graph for every id both
    /// share. Swaps instead of clones, so the displaced fresh state
    /// rides `old` back to the control thread for deallocation.
    pub(crate) fn adopt_state_from(&mut self, old: &mut RenderGraph) {
        for entry in &mut self.entries {
            if let Some(&oi) = old.index_of.get(&entry.id) {
                let old_entry = &mut old.entries[oi];
                mem::swap(&mut entry.node, &mut old_entry.node);
                if entry.param_states.len() == old_entry.param_states.len() {
                    mem::swap(&mut entry.param_states, &mut old_entry.param_states);
                }
            }
        }
        self.context.current_frame = old.context.current_frame;
        self.context.listener = old.context.listener;
    }
}

/// Fill a mono automation bus: the control-rate value steps at the
/// frames of any due events, and overdue events apply at the quantum
/// start.
fn fill_param_bus(state: &mut ParamState, bus: &mut AudioBus, start_frame: u64) {
    let frames = bus.frames();
    let end_frame = start_frame + frames as u64;
    let mut value = state.value;

    let samples = bus.channel_mut(0);
    for (i, sample) in samples.iter_mut().enumerate() {
        let frame = start_frame + i as u64;
        for event in &state.pending {
            if event.frame == frame || (i == 0 && event.frame < start_frame) {
                value = event.value;
            }
        }
        *sample = value;
    }
    bus.is_silent = false;

    state.value = value;
    state.pending.retain(|event| event.frame >= end_frame);
}
