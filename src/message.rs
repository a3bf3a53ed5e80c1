//! Control-to-render message queue.
//!
//! Commands flow control→render over an SPSC ring; anything the
//! render thread replaces (graphs, descriptions) flows back over a
//! retired lane so it is deallocated on the control thread. Both
//! ends assert their thread affinity in debug builds: the first call
//! binds the end to the calling thread.

use crate::graph::{GraphNodeDescription, NodeId};
use crate::render::RenderGraph;

pub enum ControlMessage {
    /// Begin producing at `when_frame` (or immediately when `None`).
    StartSource {
        node: NodeId,
        when_frame: Option<u64>,
    },
    /// Become silent at or after `when_frame`. A stop delivered a
    /// quantum early renders identically to one delivered on time.
    StopSource {
        node: NodeId,
        when_frame: Option<u64>,
    },
    /// Sample-accurate parameter change at an absolute frame.
    SetParam {
        node: NodeId,
        param_index: u32,
        value: f32,
        when_frame: u64,
    },
    /// In-place description update; only valid for changes classified
    /// as applying in place.
    UpdateNode {
        node: NodeId,
        description: GraphNodeDescription,
    },
    /// Rewire to a rebuilt graph, adopting DSP state from nodes whose
    /// ids survive.
    ReplaceTopology(Box<RenderGraph>),
    /// Swap in a freshly built graph wholesale.
    ReplaceGraph(Box<RenderGraph>),
}

/// Heap-carrying payloads displaced on the render thread, shipped
/// back for deallocation.
pub enum Retired {
    Description(GraphNodeDescription),
    Graph(Box<RenderGraph>),
}

#[derive(Default)]
struct ThreadAffinity {
    #[cfg(debug_assertions)]
    bound: Option<std::thread::ThreadId>,
}

impl ThreadAffinity {
    #[inline]
    fn assert_bound(&mut self) {
        #[cfg(debug_assertions)]
        {
            let current = std::thread::current().id();
            match self.bound {
                None => self.bound = Some(current),
                Some(bound) => debug_assert_eq!(
                    bound, current,
                    "queue end used from more than one thread"
                ),
            }
        }
    }
}

pub fn control_queue(capacity: usize) -> (ControlSender, ControlReceiver) {
    let (msg_tx, msg_rx) = rtrb::RingBuffer::new(capacity);
    // The retired lane is oversized so returning payloads cannot
    // stall behind a full lane.
    let (retired_tx, retired_rx) = rtrb::RingBuffer::new(capacity * 2);
    (
        ControlSender {
            msg_tx,
            retired_rx,
            affinity: ThreadAffinity::default(),
        },
        ControlReceiver {
            msg_rx,
            retired_tx,
            affinity: ThreadAffinity::default(),
        },
    )
}

/// The control thread's end.
pub struct ControlSender {
    msg_tx: rtrb::Producer<ControlMessage>,
    retired_rx: rtrb::Consumer<Retired>,
    affinity: ThreadAffinity,
}

impl ControlSender {
    /// Enqueue a command. On a full queue the message is handed back
    /// so the caller can retry after the render thread catches up.
    pub fn push(&mut self, msg: ControlMessage) -> Result<(), ControlMessage> {
        self.affinity.assert_bound();
        self.msg_tx.push(msg).map_err(|rtrb::PushError::Full(m)| m)
    }

    /// Drop everything the render thread has retired. Call from the
    /// control thread's housekeeping loop.
    pub fn collect_retired(&mut self) -> usize {
        self.affinity.assert_bound();
        let mut n = 0;
        while self.retired_rx.pop().is_ok() {
            n += 1;
        }
        n
    }
}

/// The render thread's end.
pub struct ControlReceiver {
    msg_rx: rtrb::Consumer<ControlMessage>,
    retired_tx: rtrb::Producer<Retired>,
    affinity: ThreadAffinity,
}

impl ControlReceiver {
    /// Pop the next command in FIFO order.
    pub fn pop(&mut self) -> Option<ControlMessage> {
        self.affinity.assert_bound();
        self.msg_rx.pop().ok()
    }

    /// Ship a displaced allocation back to the control thread. If the
    /// lane is somehow full the payload is dropped here rather than
    /// stalling the render thread.
    pub fn retire(&mut self, retired: Retired) {
        let _ = self.retired_tx.push(retired);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GainDescription;

    #[test]
    fn messages_drain_in_fifo_order() {
        let (mut tx, mut rx) = control_queue(8);
        for i in 0..3u64 {
            tx.push(ControlMessage::StartSource {
                node: NodeId(i),
                when_frame: None,
            })
            .ok()
            .unwrap();
        }

        for i in 0..3u64 {
            match rx.pop() {
                Some(ControlMessage::StartSource { node, .. }) => assert_eq!(node, NodeId(i)),
                _ => panic!("expected StartSource"),
            }
        }
        assert!(rx.pop().is_none());
    }

    #[test]
    fn full_queue_returns_the_message() {
        let (mut tx, _rx) = control_queue(1);
        tx.push(ControlMessage::StartSource {
            node: NodeId(1),
            when_frame: None,
        })
        .ok()
        .unwrap();

        let rejected = tx.push(ControlMessage::StopSource {
            node: NodeId(2),
            when_frame: None,
        });
        assert!(matches!(
            rejected,
            Err(ControlMessage::StopSource { .. })
        ));
    }

    #[test]
    fn retired_payloads_come_back_to_the_sender() {
        let (mut tx, mut rx) = control_queue(4);
        rx.retire(Retired::Description(GraphNodeDescription::Gain(
            GainDescription { gain: 1.0 },
        )));
        assert_eq!(tx.collect_retired(), 1);
        assert_eq!(tx.collect_retired(), 0);
    }
}
