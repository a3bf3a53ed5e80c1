//! Per-kind node descriptions and their wire payloads.
//!
//! Descriptions are the control-plane view of a node: everything a
//! peer needs to rebuild the node, and nothing about its render-time
//! state (filter history, oscillator phase). Each kind knows how to
//! encode itself, decode itself, and classify an update against a
//! newer description of the same node.

use crate::wire::{WireError, WireReader, WireWriter};
use crate::MAX_CHANNELS;

/// Stable identifier for a node within a graph description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

/// What a description change requires of the running render graph.
///
/// Variants are ordered by severity so updates across many nodes can
/// be folded with `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GraphUpdateKind {
    /// Apply in place; DSP state is untouched.
    None,
    /// Rewire the graph; nodes keep their state.
    Topology,
    /// Tear down and rebuild the affected nodes.
    RebuildRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Square,
    Sawtooth,
    Triangle,
}

impl Waveform {
    fn tag(self) -> u8 {
        match self {
            Waveform::Sine => 0,
            Waveform::Square => 1,
            Waveform::Sawtooth => 2,
            Waveform::Triangle => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, WireError> {
        Ok(match tag {
            0 => Waveform::Sine,
            1 => Waveform::Square,
            2 => Waveform::Sawtooth,
            3 => Waveform::Triangle,
            _ => return Err(WireError::InvalidValue("oscillator waveform")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DestinationDescription {
    pub channel_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainDescription {
    pub gain: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantSourceDescription {
    pub offset: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OscillatorDescription {
    pub waveform: Waveform,
    pub frequency: f32,
    pub detune: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSplitterDescription {
    pub output_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelMergerDescription {
    pub input_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoPannerDescription {
    pub pan: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IirFilterDescription {
    pub feedforward: Vec<f32>,
    pub feedback: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListenerDescription {
    pub position: [f32; 3],
    pub forward: [f32; 3],
    pub up: [f32; 3],
}

impl Default for ListenerDescription {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            forward: [0.0, 0.0, -1.0],
            up: [0.0, 1.0, 0.0],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkletDescription {
    pub processor_name: String,
    pub input_count: u32,
    pub output_count: u32,
    pub param_names: Vec<String>,
}

const MAX_IIR_ORDER: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub enum GraphNodeDescription {
    Destination(DestinationDescription),
    Gain(GainDescription),
    ConstantSource(ConstantSourceDescription),
    Oscillator(OscillatorDescription),
    ChannelSplitter(ChannelSplitterDescription),
    ChannelMerger(ChannelMergerDescription),
    StereoPanner(StereoPannerDescription),
    IirFilter(IirFilterDescription),
    Listener(ListenerDescription),
    Worklet(WorkletDescription),
}

impl GraphNodeDescription {
    pub fn kind_tag(&self) -> u8 {
        match self {
            Self::Destination(_) => 0,
            Self::Gain(_) => 1,
            Self::ConstantSource(_) => 2,
            Self::Oscillator(_) => 3,
            Self::ChannelSplitter(_) => 4,
            Self::ChannelMerger(_) => 5,
            Self::StereoPanner(_) => 6,
            Self::IirFilter(_) => 7,
            Self::Listener(_) => 8,
            Self::Worklet(_) => 9,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Destination(_) => "destination",
            Self::Gain(_) => "gain",
            Self::ConstantSource(_) => "constant-source",
            Self::Oscillator(_) => "oscillator",
            Self::ChannelSplitter(_) => "channel-splitter",
            Self::ChannelMerger(_) => "channel-merger",
            Self::StereoPanner(_) => "stereo-panner",
            Self::IirFilter(_) => "iir-filter",
            Self::Listener(_) => "listener",
            Self::Worklet(_) => "worklet",
        }
    }

    pub fn encode_payload(&self, w: &mut WireWriter) {
        match self {
            Self::Destination(d) => w.put_u32(d.channel_count),
            Self::Gain(d) => w.put_f32(d.gain),
            Self::ConstantSource(d) => w.put_f32(d.offset),
            Self::Oscillator(d) => {
                w.put_u8(d.waveform.tag());
                w.put_f32(d.frequency);
                w.put_f32(d.detune);
            }
            Self::ChannelSplitter(d) => w.put_u32(d.output_count),
            Self::ChannelMerger(d) => w.put_u32(d.input_count),
            Self::StereoPanner(d) => w.put_f32(d.pan),
            Self::IirFilter(d) => {
                w.put_f32_array(&d.feedforward);
                w.put_f32_array(&d.feedback);
            }
            Self::Listener(d) => {
                for v in d.position.iter().chain(&d.forward).chain(&d.up) {
                    w.put_f32(*v);
                }
            }
            Self::Worklet(d) => {
                w.put_string(&d.processor_name);
                w.put_u32(d.input_count);
                w.put_u32(d.output_count);
                w.put_u32(d.param_names.len() as u32);
                for name in &d.param_names {
                    w.put_string(name);
                }
            }
        }
    }

    pub fn decode_payload(kind: u8, r: &mut WireReader) -> Result<Self, WireError> {
        Ok(match kind {
            0 => Self::Destination(DestinationDescription {
                channel_count: decode_channel_count(r, "destination channel count")?,
            }),
            1 => Self::Gain(GainDescription { gain: r.get_f32()? }),
            2 => Self::ConstantSource(ConstantSourceDescription {
                offset: r.get_f32()?,
            }),
            3 => Self::Oscillator(OscillatorDescription {
                waveform: Waveform::from_tag(r.get_u8()?)?,
                frequency: r.get_f32()?,
                detune: r.get_f32()?,
            }),
            4 => Self::ChannelSplitter(ChannelSplitterDescription {
                output_count: decode_channel_count(r, "splitter output count")?,
            }),
            5 => Self::ChannelMerger(ChannelMergerDescription {
                input_count: decode_channel_count(r, "merger input count")?,
            }),
            6 => Self::StereoPanner(StereoPannerDescription { pan: r.get_f32()? }),
            7 => {
                let feedforward = r.get_f32_array()?;
                let feedback = r.get_f32_array()?;
                if feedforward.is_empty() || feedforward.len() > MAX_IIR_ORDER {
                    return Err(WireError::InvalidValue("iir feedforward coefficients"));
                }
                if feedback.is_empty() || feedback.len() > MAX_IIR_ORDER {
                    return Err(WireError::InvalidValue("iir feedback coefficients"));
                }
                if feedback[0] == 0.0 {
                    return Err(WireError::InvalidValue("iir feedback[0]"));
                }
                Self::IirFilter(IirFilterDescription {
                    feedforward,
                    feedback,
                })
            }
            8 => {
                let mut values = [0.0f32; 9];
                for v in &mut values {
                    *v = r.get_f32()?;
                }
                Self::Listener(ListenerDescription {
                    position: [values[0], values[1], values[2]],
                    forward: [values[3], values[4], values[5]],
                    up: [values[6], values[7], values[8]],
                })
            }
            9 => {
                let processor_name = r.get_string()?;
                let input_count = r.get_u32()?;
                let output_count = r.get_u32()?;
                if input_count as usize > MAX_CHANNELS || output_count as usize > MAX_CHANNELS {
                    return Err(WireError::InvalidValue("worklet port count"));
                }
                let name_count = r.get_u32()?;
                if name_count as usize > r.remaining() {
                    return Err(WireError::OversizedArray(name_count));
                }
                let mut param_names = Vec::with_capacity(name_count as usize);
                for _ in 0..name_count {
                    param_names.push(r.get_string()?);
                }
                Self::Worklet(WorkletDescription {
                    processor_name,
                    input_count,
                    output_count,
                    param_names,
                })
            }
            other => return Err(WireError::UnknownNodeKind(other)),
        })
    }

    /// Classify what applying `new` over this description requires.
    ///
    /// Routing-affecting fields force a topology pass, changes to
    /// large value arrays force a rebuild, and everything else is
    /// applied in place. A kind change is always a rebuild.
    pub fn classify_update(&self, new: &Self) -> GraphUpdateKind {
        use GraphNodeDescription as D;
        use GraphUpdateKind as K;

        match (self, new) {
            (D::Destination(a), D::Destination(b)) => {
                if a.channel_count != b.channel_count {
                    K::Topology
                } else {
                    K::None
                }
            }
            (D::Gain(_), D::Gain(_)) => K::None,
            (D::ConstantSource(_), D::ConstantSource(_)) => K::None,
            (D::Oscillator(_), D::Oscillator(_)) => K::None,
            (D::ChannelSplitter(a), D::ChannelSplitter(b)) => {
                if a.output_count != b.output_count {
                    K::Topology
                } else {
                    K::None
                }
            }
            (D::ChannelMerger(a), D::ChannelMerger(b)) => {
                if a.input_count != b.input_count {
                    K::Topology
                } else {
                    K::None
                }
            }
            (D::StereoPanner(_), D::StereoPanner(_)) => K::None,
            (D::IirFilter(a), D::IirFilter(b)) => {
                if a.feedforward != b.feedforward || a.feedback != b.feedback {
                    K::RebuildRequired
                } else {
                    K::None
                }
            }
            (D::Listener(_), D::Listener(_)) => K::None,
            (D::Worklet(a), D::Worklet(b)) => {
                if a.processor_name != b.processor_name || a.param_names != b.param_names {
                    K::RebuildRequired
                } else if a.input_count != b.input_count || a.output_count != b.output_count {
                    K::Topology
                } else {
                    K::None
                }
            }
            _ => K::RebuildRequired,
        }
    }

    /// Number of distinct input ports edges may target.
    pub fn input_ports(&self) -> u32 {
        match self {
            Self::Destination(_) => 1,
            Self::Gain(_) => 1,
            Self::ConstantSource(_) | Self::Oscillator(_) => 0,
            Self::ChannelSplitter(_) => 1,
            Self::ChannelMerger(d) => d.input_count,
            Self::StereoPanner(_) => 1,
            Self::IirFilter(_) => 1,
            Self::Listener(_) => 0,
            Self::Worklet(d) => d.input_count,
        }
    }

    /// Number of distinct output ports edges may select.
    pub fn output_ports(&self) -> u32 {
        match self {
            Self::Destination(_) => 0,
            Self::Gain(_) => 1,
            Self::ConstantSource(_) | Self::Oscillator(_) => 1,
            Self::ChannelSplitter(d) => d.output_count,
            Self::ChannelMerger(_) => 1,
            Self::StereoPanner(_) => 1,
            Self::IirFilter(_) => 1,
            Self::Listener(_) => 0,
            Self::Worklet(d) => d.output_count,
        }
    }

    pub fn param_count(&self) -> u32 {
        match self {
            Self::Gain(_) => 1,
            Self::ConstantSource(_) => 1,
            Self::Oscillator(_) => 2,
            Self::StereoPanner(_) => 1,
            Self::Listener(_) => 9,
            Self::Worklet(d) => d.param_names.len() as u32,
            _ => 0,
        }
    }

    /// Control-rate value a parameter bus carries when nothing is
    /// connected to it and no automation is pending.
    pub fn param_default(&self, index: u32) -> f32 {
        match (self, index) {
            (Self::Gain(d), 0) => d.gain,
            (Self::ConstantSource(d), 0) => d.offset,
            (Self::Oscillator(d), 0) => d.frequency,
            (Self::Oscillator(d), 1) => d.detune,
            (Self::StereoPanner(d), 0) => d.pan,
            (Self::Listener(d), i) if i < 9 => {
                let all = [
                    d.position[0],
                    d.position[1],
                    d.position[2],
                    d.forward[0],
                    d.forward[1],
                    d.forward[2],
                    d.up[0],
                    d.up[1],
                    d.up[2],
                ];
                all[i as usize]
            }
            _ => 0.0,
        }
    }

    /// Sources honor start/stop scheduling and keep running even when
    /// nothing downstream listens.
    pub fn is_source(&self) -> bool {
        matches!(self, Self::ConstantSource(_) | Self::Oscillator(_))
    }
}

fn decode_channel_count(r: &mut WireReader, what: &'static str) -> Result<u32, WireError> {
    let count = r.get_u32()?;
    if count == 0 || count as usize > MAX_CHANNELS {
        return Err(WireError::InvalidValue(what));
    }
    Ok(count)
}
