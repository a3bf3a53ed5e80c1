//! Whole-graph wire codec.
//!
//! Layout: a fixed header (magic, version, sample rate, destination
//! id) followed by tagged sections. Decoders skip sections with tags
//! they do not recognize, so new tables can be added without breaking
//! older peers. Truncated payloads and unknown node kinds are decode
//! errors. Decoding happens on the control thread; the render thread
//! never sees an invalid graph.

use ahash::AHashSet;

use super::{
    Connection, GraphDescription, GraphNodeDescription, NodeId, ParamConnection,
};
use crate::wire::{WireError, WireReader, WireWriter};

pub const GRAPH_MAGIC: u32 = u32::from_le_bytes(*b"SAGD");
pub const GRAPH_VERSION: u32 = 1;

const SECTION_NODE_TABLE: u32 = 1;
const SECTION_CONNECTION_TABLE: u32 = 2;
const SECTION_PARAM_CONNECTION_TABLE: u32 = 3;

pub fn encode_graph(graph: &GraphDescription) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_u32(GRAPH_MAGIC);
    w.put_u32(GRAPH_VERSION);
    w.put_f32(graph.sample_rate);
    w.put_u64(graph.destination.0);

    // Nodes are written in id order so equal graphs encode
    // identically regardless of construction order.
    let mut nodes: Vec<&(NodeId, GraphNodeDescription)> = graph.nodes.iter().collect();
    nodes.sort_by_key(|(id, _)| *id);

    w.section(SECTION_NODE_TABLE, |w| {
        w.put_u32(nodes.len() as u32);
        for (id, desc) in nodes {
            w.put_u64(id.0);
            w.put_u8(desc.kind_tag());
            let mut payload = WireWriter::new();
            desc.encode_payload(&mut payload);
            let payload = payload.finish();
            w.put_u32(payload.len() as u32);
            w.put_bytes(&payload);
        }
    });

    w.section(SECTION_CONNECTION_TABLE, |w| {
        w.put_u32(graph.connections.len() as u32);
        for c in &graph.connections {
            w.put_u64(c.source.0);
            w.put_u32(c.source_output);
            w.put_u64(c.dest.0);
            w.put_u32(c.dest_input);
        }
    });

    w.section(SECTION_PARAM_CONNECTION_TABLE, |w| {
        w.put_u32(graph.param_connections.len() as u32);
        for c in &graph.param_connections {
            w.put_u64(c.source.0);
            w.put_u32(c.source_output);
            w.put_u64(c.dest.0);
            w.put_u32(c.param_index);
        }
    });

    w.finish()
}

pub fn decode_graph(bytes: &[u8]) -> Result<GraphDescription, WireError> {
    let mut r = WireReader::new(bytes);

    let magic = r.get_u32()?;
    if magic != GRAPH_MAGIC {
        return Err(WireError::BadMagic(magic));
    }
    let version = r.get_u32()?;
    if version != GRAPH_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let sample_rate = r.get_f32()?;
    if !sample_rate.is_finite() || sample_rate <= 0.0 {
        return Err(WireError::InvalidValue("sample rate"));
    }
    let destination = NodeId(r.get_u64()?);

    let mut graph = GraphDescription {
        sample_rate,
        destination,
        nodes: Vec::new(),
        connections: Vec::new(),
        param_connections: Vec::new(),
    };

    while !r.is_at_end() {
        let tag = r.get_u32()?;
        let len = r.get_u32()? as usize;
        let mut body = r.slice(len)?;

        match tag {
            SECTION_NODE_TABLE => decode_node_table(&mut body, &mut graph)?,
            SECTION_CONNECTION_TABLE => {
                let count = body.get_u32()?;
                for _ in 0..count {
                    graph.connections.push(Connection {
                        source: NodeId(body.get_u64()?),
                        source_output: body.get_u32()?,
                        dest: NodeId(body.get_u64()?),
                        dest_input: body.get_u32()?,
                    });
                }
            }
            SECTION_PARAM_CONNECTION_TABLE => {
                let count = body.get_u32()?;
                for _ in 0..count {
                    graph.param_connections.push(ParamConnection {
                        source: NodeId(body.get_u64()?),
                        source_output: body.get_u32()?,
                        dest: NodeId(body.get_u64()?),
                        param_index: body.get_u32()?,
                    });
                }
            }
            other => {
                log::debug!("skipping unknown graph section {other}");
            }
        }
    }

    Ok(graph)
}

fn decode_node_table(
    body: &mut WireReader,
    graph: &mut GraphDescription,
) -> Result<(), WireError> {
    let count = body.get_u32()?;
    let mut seen = AHashSet::with_capacity(count as usize);
    for _ in 0..count {
        let id = body.get_u64()?;
        if !seen.insert(id) {
            return Err(WireError::DuplicateNode(id));
        }
        let kind = body.get_u8()?;
        let payload_len = body.get_u32()? as usize;
        let mut payload = body.slice(payload_len)?;
        let desc = GraphNodeDescription::decode_payload(kind, &mut payload)?;
        graph.nodes.push((NodeId(id), desc));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{
        DestinationDescription, GainDescription, OscillatorDescription, Waveform,
    };

    fn sample_graph() -> GraphDescription {
        GraphDescription {
            sample_rate: 44_100.0,
            destination: NodeId(1),
            nodes: vec![
                (
                    NodeId(3),
                    GraphNodeDescription::Oscillator(OscillatorDescription {
                        waveform: Waveform::Sine,
                        frequency: 440.0,
                        detune: 0.0,
                    }),
                ),
                (
                    NodeId(1),
                    GraphNodeDescription::Destination(DestinationDescription {
                        channel_count: 2,
                    }),
                ),
                (
                    NodeId(2),
                    GraphNodeDescription::Gain(GainDescription { gain: 0.25 }),
                ),
            ],
            connections: vec![
                Connection {
                    source: NodeId(3),
                    source_output: 0,
                    dest: NodeId(2),
                    dest_input: 0,
                },
                Connection {
                    source: NodeId(2),
                    source_output: 0,
                    dest: NodeId(1),
                    dest_input: 0,
                },
            ],
            param_connections: vec![ParamConnection {
                source: NodeId(3),
                source_output: 0,
                dest: NodeId(2),
                param_index: 0,
            }],
        }
    }

    #[test]
    fn graph_round_trip() {
        let graph = sample_graph();
        let decoded = decode_graph(&encode_graph(&graph)).unwrap();

        assert_eq!(decoded.sample_rate, graph.sample_rate);
        assert_eq!(decoded.destination, graph.destination);
        // Encoding sorts the node table by id.
        assert_eq!(decoded.nodes.len(), 3);
        assert_eq!(decoded.nodes[0].0, NodeId(1));
        assert_eq!(decoded.node(NodeId(3)), graph.node(NodeId(3)));
        assert_eq!(decoded.connections, graph.connections);
        assert_eq!(decoded.param_connections, graph.param_connections);
    }

    #[test]
    fn unknown_sections_are_skipped() {
        let mut bytes = encode_graph(&sample_graph());
        // Append a section with an unassigned tag.
        bytes.extend_from_slice(&99u32.to_le_bytes());
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&[0xAA; 4]);

        let decoded = decode_graph(&bytes).unwrap();
        assert_eq!(decoded.nodes.len(), 3);
    }

    #[test]
    fn truncation_is_rejected() {
        let bytes = encode_graph(&sample_graph());
        for cut in [1, bytes.len() / 2, bytes.len() - 1] {
            assert!(decode_graph(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = encode_graph(&sample_graph());
        bytes[0] ^= 0xFF;
        assert!(matches!(
            decode_graph(&bytes),
            Err(WireError::BadMagic(_))
        ));
    }

    #[test]
    fn duplicate_node_ids_are_rejected() {
        let mut graph = sample_graph();
        graph.nodes.push((
            NodeId(2),
            GraphNodeDescription::Gain(GainDescription { gain: 1.0 }),
        ));
        assert_eq!(
            decode_graph(&encode_graph(&graph)),
            Err(WireError::DuplicateNode(2))
        );
    }

    #[test]
    fn nonsense_sample_rate_is_rejected() {
        let mut graph = sample_graph();
        graph.sample_rate = -1.0;
        assert_eq!(
            decode_graph(&encode_graph(&graph)),
            Err(WireError::InvalidValue("sample rate"))
        );
    }
}
