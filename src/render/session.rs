//! Render-thread driver for one producer session.
//!
//! Owns the session's current graph and the receiving end of its
//! control queue. Each quantum: drain every queued command, apply it,
//! render, and hand the destination bus to the caller (typically to
//! push into the session's transport ring). Commands enqueued before
//! a quantum is requested are guaranteed visible to that quantum.

use super::graph::RenderGraph;
use crate::bus::{self, AudioBus};
use crate::message::{ControlMessage, ControlReceiver, Retired};
use crate::ring::RingProducer;
use crate::MAX_CHANNELS;

pub struct RenderSession {
    graph: Option<Box<RenderGraph>>,
    receiver: ControlReceiver,
    /// Returned while no graph is installed.
    silence: AudioBus,
    interleave_scratch: Vec<f32>,
    quantum: usize,
}

impl RenderSession {
    pub fn new(receiver: ControlReceiver, output_channels: usize, quantum: usize) -> Self {
        Self {
            graph: None,
            receiver,
            silence: AudioBus::new(output_channels, quantum),
            // Sized for the widest destination so a replacement graph
            // with more channels never reallocates (or panics) on the
            // render thread.
            interleave_scratch: vec![0.0; MAX_CHANNELS * quantum],
            quantum,
        }
    }

    pub fn current_frame(&self) -> u64 {
        self.graph.as_ref().map_or(0, |g| g.current_frame())
    }

    /// Apply all pending commands, render one quantum, and return the
    /// destination bus.
    pub fn render_quantum(&mut self) -> &AudioBus {
        self.drain_messages();
        match &mut self.graph {
            Some(graph) => {
                graph.process_quantum();
                graph.destination_output()
            }
            None => &self.silence,
        }
    }

    /// Render one quantum and push it, interleaved, into the
    /// session's ring. Returns the frames accepted; on a full ring
    /// the newest frames are dropped.
    pub fn render_quantum_to_ring(&mut self, producer: &mut RingProducer) -> usize {
        self.drain_messages();
        let bus = match &mut self.graph {
            Some(graph) => {
                graph.process_quantum();
                graph.destination_output()
            }
            None => &self.silence,
        };
        let channels = bus.channels();
        bus::interleave(bus, &mut self.interleave_scratch);

        let samples = producer
            .try_write_frames(&self.interleave_scratch[..self.quantum * channels], channels);
        samples / channels.max(1)
    }

    fn drain_messages(&mut self) {
        while let Some(msg) = self.receiver.pop() {
            match msg {
                ControlMessage::ReplaceGraph(new_graph) => {
                    if let Some(old) = self.graph.replace(new_graph) {
                        self.receiver.retire(Retired::Graph(old));
                    }
                }
                ControlMessage::ReplaceTopology(mut new_graph) => {
                    if let Some(mut old) = self.graph.take() {
                        new_graph.adopt_state_from(&mut old);
                        self.receiver.retire(Retired::Graph(old));
                    }
                    self.graph = Some(new_graph);
                }
                ControlMessage::UpdateNode { node, description } => {
                    if let Some(graph) = &mut self.graph {
                        graph.apply_description(node, &description);
                    }
                    self.receiver.retire(Retired::Description(description));
                }
                ControlMessage::StartSource { node, when_frame } => {
                    if let Some(graph) = &mut self.graph {
                        graph.schedule_start(node, when_frame);
                    }
                }
                ControlMessage::StopSource { node, when_frame } => {
                    if let Some(graph) = &mut self.graph {
                        graph.schedule_stop(node, when_frame);
                    }
                }
                ControlMessage::SetParam {
                    node,
                    param_index,
                    value,
                    when_frame,
                } => {
                    if let Some(graph) = &mut self.graph {
                        graph.set_param(node, param_index, value, when_frame);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{
        Connection, ConstantSourceDescription, DestinationDescription, GraphDescription,
        GraphNodeDescription, NodeId,
    };
    use crate::message::control_queue;
    use crate::render::NullResolver;
    use crate::ring::{RingFormat, RingTransport};

    const QUANTUM: usize = 16;

    fn simple_graph(channels: u32) -> Box<RenderGraph> {
        let desc = GraphDescription {
            sample_rate: 48_000.0,
            destination: NodeId(1),
            nodes: vec![
                (
                    NodeId(1),
                    GraphNodeDescription::Destination(DestinationDescription {
                        channel_count: channels,
                    }),
                ),
                (
                    NodeId(2),
                    GraphNodeDescription::ConstantSource(ConstantSourceDescription {
                        offset: 0.5,
                    }),
                ),
            ],
            connections: vec![Connection {
                source: NodeId(2),
                source_output: 0,
                dest: NodeId(1),
                dest_input: 0,
            }],
            param_connections: Vec::new(),
        };
        RenderGraph::build(&desc, QUANTUM, &mut NullResolver).unwrap()
    }

    #[test]
    fn renders_silence_without_a_graph() {
        let (_tx, rx) = control_queue(8);
        let mut session = RenderSession::new(rx, 1, QUANTUM);
        let bus = session.render_quantum();
        assert!(bus.is_silent);
    }

    #[test]
    fn commands_enqueued_before_a_quantum_are_visible_to_it() {
        let (mut tx, rx) = control_queue(8);
        let mut session = RenderSession::new(rx, 1, QUANTUM);

        tx.push(ControlMessage::ReplaceGraph(simple_graph(1)))
            .ok()
            .unwrap();
        tx.push(ControlMessage::StartSource {
            node: NodeId(2),
            when_frame: None,
        })
        .ok()
        .unwrap();

        let bus = session.render_quantum();
        assert_eq!(bus.channel(0)[0], 0.5);
    }

    #[test]
    fn replaced_graphs_come_back_on_the_retired_lane() {
        let (mut tx, rx) = control_queue(8);
        let mut session = RenderSession::new(rx, 1, QUANTUM);

        tx.push(ControlMessage::ReplaceGraph(simple_graph(1)))
            .ok()
            .unwrap();
        session.render_quantum();
        tx.push(ControlMessage::ReplaceGraph(simple_graph(1)))
            .ok()
            .unwrap();
        session.render_quantum();

        assert_eq!(tx.collect_retired(), 1);
    }

    #[test]
    fn quantum_lands_in_the_ring_interleaved() {
        let (mut tx, rx) = control_queue(8);
        let mut session = RenderSession::new(rx, 1, QUANTUM);
        tx.push(ControlMessage::ReplaceGraph(simple_graph(1)))
            .ok()
            .unwrap();
        tx.push(ControlMessage::StartSource {
            node: NodeId(2),
            when_frame: None,
        })
        .ok()
        .unwrap();

        let (mut producer, consumer) = RingTransport::create(
            4096,
            RingFormat {
                sample_rate: 48_000,
                channel_count: 1,
                channel_capacity: 1,
            },
        )
        .unwrap()
        .split();

        assert_eq!(session.render_quantum_to_ring(&mut producer), QUANTUM);

        let mut out = [0.0f32; QUANTUM];
        assert_eq!(consumer.try_read_samples(&mut out), QUANTUM);
        assert!(out.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn topology_swap_to_a_wider_destination_keeps_rendering() {
        let (mut tx, rx) = control_queue(8);
        let mut session = RenderSession::new(rx, 1, QUANTUM);
        tx.push(ControlMessage::ReplaceGraph(simple_graph(1)))
            .ok()
            .unwrap();
        tx.push(ControlMessage::StartSource {
            node: NodeId(2),
            when_frame: None,
        })
        .ok()
        .unwrap();

        let (mut producer, consumer) = RingTransport::create(
            4096,
            RingFormat {
                sample_rate: 48_000,
                channel_count: 2,
                channel_capacity: 2,
            },
        )
        .unwrap()
        .split();

        assert_eq!(session.render_quantum_to_ring(&mut producer), QUANTUM);

        // Widening the destination is a topology pass; the session
        // must keep rendering at the new width.
        tx.push(ControlMessage::ReplaceTopology(simple_graph(2)))
            .ok()
            .unwrap();
        assert_eq!(session.render_quantum_to_ring(&mut producer), QUANTUM);

        let mut mono = [0.0f32; QUANTUM];
        assert_eq!(consumer.try_read_samples(&mut mono), QUANTUM);

        let mut stereo = [0.0f32; QUANTUM * 2];
        assert_eq!(consumer.try_read_samples(&mut stereo), QUANTUM * 2);
        assert!(stereo.iter().all(|&s| s == 0.5));
    }
}
