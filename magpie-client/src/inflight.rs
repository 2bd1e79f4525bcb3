use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::message::{Message, Publication};
use crate::packet::{PacketId, QoS};

/// Largest assignable packet identifier; 0 is never used.
pub(crate) const MAX_MSG_ID: PacketId = 65535;

/// The packet that must arrive next for an in-flight message's handshake to
/// make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expected {
    /// QoS 1 publish awaiting PUBACK.
    PubAck,
    /// QoS 2 publish awaiting PUBREC.
    PubRec,
    /// QoS 2 publish whose PUBREL went out, awaiting PUBCOMP.
    PubComp,
    /// Inbound QoS 2 publish awaiting the broker's PUBREL.
    PubRel,
}

/// One message whose acknowledgment handshake is incomplete.
#[derive(Debug, Clone)]
pub(crate) struct Inflight {
    pub packet_id: PacketId,
    pub qos: QoS,
    pub retain: bool,
    pub publication: Arc<Publication>,
    /// `None` forces a resend on the next retry pass.
    pub last_touch: Option<Instant>,
    pub next: Expected,
    /// Persisted wire length, kept for the memory accounting.
    pub len: usize,
}

/// An ordered collection of in-flight messages keyed by packet identifier.
///
/// Kept in ascending id order, except immediately after an id wrap where
/// [`rotate_for_wrap`](InflightTable::rotate_for_wrap) restores
/// oldest-first iteration.
#[derive(Debug, Default)]
pub(crate) struct InflightTable {
    msgs: VecDeque<Inflight>,
    bytes: usize,
}

impl InflightTable {
    pub fn new() -> Self {
        InflightTable {
            msgs: VecDeque::new(),
            bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn contains(&self, packet_id: PacketId) -> bool {
        self.msgs.iter().any(|msg| msg.packet_id == packet_id)
    }

    pub fn find_mut(&mut self, packet_id: PacketId) -> Option<&mut Inflight> {
        self.msgs.iter_mut().find(|msg| msg.packet_id == packet_id)
    }

    /// Appends a freshly assigned message; ids grow monotonically between
    /// wraps, so appending preserves the order invariant.
    pub fn push_back(&mut self, msg: Inflight) {
        self.bytes += msg.len;
        self.msgs.push_back(msg);
    }

    /// Inserts keeping ascending id order; used when rebuilding the table
    /// from persistence, where keys arrive in arbitrary order.
    pub fn insert_in_order(&mut self, msg: Inflight) {
        self.bytes += msg.len;
        let at = self
            .msgs
            .iter()
            .position(|cur| msg.packet_id < cur.packet_id)
            .unwrap_or(self.msgs.len());
        self.msgs.insert(at, msg);
    }

    pub fn remove(&mut self, packet_id: PacketId) -> Option<Inflight> {
        let at = self.msgs.iter().position(|msg| msg.packet_id == packet_id)?;
        let msg = self.msgs.remove(at);
        if let Some(ref msg) = msg {
            self.bytes -= msg.len;
        }
        msg
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Inflight> {
        self.msgs.iter_mut()
    }

    /// Packet identifiers in table order.
    pub fn ids(&self) -> Vec<PacketId> {
        self.msgs.iter().map(|msg| msg.packet_id).collect()
    }

    pub fn clear(&mut self) {
        self.msgs.clear();
        self.bytes = 0;
    }

    /// Restores oldest-first order after the id space wrapped: the element
    /// following the largest gap between successive ids becomes the new head.
    pub fn rotate_for_wrap(&mut self) {
        if self.msgs.len() < 2 {
            return;
        }

        let first = u32::from(self.msgs[0].packet_id);
        let last = u32::from(self.msgs[self.msgs.len() - 1].packet_id);
        let mut gap = u32::from(MAX_MSG_ID) - last + first;
        let mut head = None;

        for i in 1..self.msgs.len() {
            let cur = u32::from(self.msgs[i].packet_id) - u32::from(self.msgs[i - 1].packet_id);
            if cur > gap {
                gap = cur;
                head = Some(i);
            }
        }

        if let Some(head) = head {
            self.msgs.rotate_left(head);
        }
    }
}

/// Arrived messages ready to be handed to the application, in receive order.
#[derive(Debug, Default)]
pub(crate) struct ReceivedQueue {
    msgs: VecDeque<Message>,
    bytes: usize,
}

impl ReceivedQueue {
    pub fn new() -> Self {
        ReceivedQueue {
            msgs: VecDeque::new(),
            bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn push_back(&mut self, msg: Message) {
        self.bytes += msg.payload.len() + msg.topic.len();
        self.msgs.push_back(msg);
    }

    /// Puts a message back at the head after the application declined it.
    pub fn push_front(&mut self, msg: Message) {
        self.bytes += msg.payload.len() + msg.topic.len();
        self.msgs.push_front(msg);
    }

    pub fn pop_front(&mut self) -> Option<Message> {
        let msg = self.msgs.pop_front();
        if let Some(ref msg) = msg {
            self.bytes -= msg.payload.len() + msg.topic.len();
        }
        msg
    }

    pub fn clear(&mut self) {
        self.msgs.clear();
        self.bytes = 0;
    }
}
