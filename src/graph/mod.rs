//! The control-plane graph model: node descriptions, connections,
//! update classification, and the wire codec.

use thiserror::Error;

pub mod codec;
mod describe;

pub use describe::{
    ChannelMergerDescription, ChannelSplitterDescription, ConstantSourceDescription,
    DestinationDescription, GainDescription, GraphNodeDescription, GraphUpdateKind,
    IirFilterDescription, ListenerDescription, NodeId, OscillatorDescription,
    StereoPannerDescription, Waveform, WorkletDescription,
};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph contains a cycle through node {0:?}")]
    Cycle(NodeId),
    #[error("connection references unknown node {0:?}")]
    UnknownNode(NodeId),
    #[error("destination node {0:?} is not in the node table")]
    MissingDestination(NodeId),
    #[error("node {node:?} has no input port {port}")]
    BadInputPort { node: NodeId, port: u32 },
    #[error("node {node:?} has no output port {port}")]
    BadOutputPort { node: NodeId, port: u32 },
    #[error("node {node:?} has no parameter {index}")]
    BadParamIndex { node: NodeId, index: u32 },
}

/// An audio edge: one output port of a source node feeding one input
/// port of a destination node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Connection {
    pub source: NodeId,
    pub source_output: u32,
    pub dest: NodeId,
    pub dest_input: u32,
}

/// A modulation edge: one output port of a source node feeding a
/// parameter bus of a destination node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamConnection {
    pub source: NodeId,
    pub source_output: u32,
    pub dest: NodeId,
    pub param_index: u32,
}

/// A complete, self-contained description of a page's audio graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphDescription {
    pub sample_rate: f32,
    pub destination: NodeId,
    pub nodes: Vec<(NodeId, GraphNodeDescription)>,
    pub connections: Vec<Connection>,
    pub param_connections: Vec<ParamConnection>,
}

impl GraphDescription {
    pub fn node(&self, id: NodeId) -> Option<&GraphNodeDescription> {
        self.nodes
            .iter()
            .find(|(node_id, _)| *node_id == id)
            .map(|(_, desc)| desc)
    }

    /// Classify what replacing this description with `new` requires
    /// of a running render graph.
    ///
    /// Changes to the node set or the destination rebuild everything,
    /// per-node changes classify individually, and edge changes alone
    /// are a topology pass.
    pub fn classify_update(&self, new: &GraphDescription) -> GraphUpdateKind {
        if self.destination != new.destination || self.nodes.len() != new.nodes.len() {
            return GraphUpdateKind::RebuildRequired;
        }

        let new_by_id: ahash::AHashMap<NodeId, &GraphNodeDescription> = new
            .nodes
            .iter()
            .map(|(id, desc)| (*id, desc))
            .collect();

        let mut kind = GraphUpdateKind::None;
        for (id, desc) in &self.nodes {
            let Some(new_desc) = new_by_id.get(id) else {
                return GraphUpdateKind::RebuildRequired;
            };
            kind = kind.max(desc.classify_update(new_desc));
            if kind == GraphUpdateKind::RebuildRequired {
                return kind;
            }
        }

        if !same_edge_set(&self.connections, &new.connections)
            || !same_edge_set(&self.param_connections, &new.param_connections)
        {
            kind = kind.max(GraphUpdateKind::Topology);
        }

        kind
    }
}

fn same_edge_set<T: Ord + Copy>(a: &[T], b: &[T]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a: Vec<T> = a.to_vec();
    let mut b: Vec<T> = b.to_vec();
    a.sort_unstable();
    b.sort_unstable();
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_graph(gain: f32) -> GraphDescription {
        GraphDescription {
            sample_rate: 48_000.0,
            destination: NodeId(1),
            nodes: vec![
                (
                    NodeId(1),
                    GraphNodeDescription::Destination(DestinationDescription {
                        channel_count: 2,
                    }),
                ),
                (
                    NodeId(2),
                    GraphNodeDescription::Gain(GainDescription { gain }),
                ),
            ],
            connections: vec![Connection {
                source: NodeId(2),
                source_output: 0,
                dest: NodeId(1),
                dest_input: 0,
            }],
            param_connections: Vec::new(),
        }
    }

    #[test]
    fn scalar_change_is_in_place() {
        let a = two_node_graph(1.0);
        let b = two_node_graph(0.5);
        assert_eq!(a.classify_update(&b), GraphUpdateKind::None);
    }

    #[test]
    fn edge_change_is_topology() {
        let a = two_node_graph(1.0);
        let mut b = two_node_graph(1.0);
        b.connections.clear();
        assert_eq!(a.classify_update(&b), GraphUpdateKind::Topology);
    }

    #[test]
    fn edge_order_does_not_matter() {
        let mut a = two_node_graph(1.0);
        a.nodes.push((
            NodeId(3),
            GraphNodeDescription::Gain(GainDescription { gain: 1.0 }),
        ));
        a.connections.push(Connection {
            source: NodeId(3),
            source_output: 0,
            dest: NodeId(1),
            dest_input: 0,
        });
        let mut b = a.clone();
        b.connections.reverse();
        assert_eq!(a.classify_update(&b), GraphUpdateKind::None);
    }

    #[test]
    fn node_set_change_rebuilds() {
        let a = two_node_graph(1.0);
        let mut b = two_node_graph(1.0);
        b.nodes.push((
            NodeId(3),
            GraphNodeDescription::Gain(GainDescription { gain: 1.0 }),
        ));
        assert_eq!(a.classify_update(&b), GraphUpdateKind::RebuildRequired);
    }

    #[test]
    fn destination_change_rebuilds() {
        let a = two_node_graph(1.0);
        let mut b = two_node_graph(1.0);
        b.destination = NodeId(2);
        assert_eq!(a.classify_update(&b), GraphUpdateKind::RebuildRequired);
    }

    #[test]
    fn per_node_severity_escalates() {
        let mut a = two_node_graph(1.0);
        a.nodes.push((
            NodeId(3),
            GraphNodeDescription::IirFilter(IirFilterDescription {
                feedforward: vec![1.0],
                feedback: vec![1.0, -0.1],
            }),
        ));
        let mut b = a.clone();
        b.nodes[1].1 = GraphNodeDescription::Gain(GainDescription { gain: 0.1 });
        b.nodes[2].1 = GraphNodeDescription::IirFilter(IirFilterDescription {
            feedforward: vec![1.0],
            feedback: vec![1.0],
        });
        assert_eq!(a.classify_update(&b), GraphUpdateKind::RebuildRequired);
    }
}
