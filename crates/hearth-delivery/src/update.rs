//! What one transaction wants to tell one session.

use std::collections::VecDeque;

use bytes::Bytes;
use hearth_protocol::Delivery;

/// A session message waiting to be flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// The protocol message body, opcode included.
    pub body: Bytes,
    pub delivery: Delivery,
}

/// The messages and disconnect request a single transaction produced for a
/// single session.
///
/// Messages keep insertion order; [`push_front`](Self::push_front) places a
/// message ahead of everything queued so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    messages: VecDeque<OutboundMessage>,
    disconnect: bool,
}

impl Update {
    pub fn push_back(&mut self, message: OutboundMessage) {
        self.messages.push_back(message);
    }

    pub fn push_front(&mut self, message: OutboundMessage) {
        self.messages.push_front(message);
    }

    /// Asks for the session to be disconnected after its messages are sent.
    pub fn request_disconnect(&mut self) {
        self.disconnect = true;
    }

    pub fn disconnect(&self) -> bool {
        self.disconnect
    }

    pub fn messages(&self) -> impl Iterator<Item = &OutboundMessage> {
        self.messages.iter()
    }

    /// `true` if flushing this update would do nothing.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && !self.disconnect
    }

    pub fn into_parts(self) -> (Vec<OutboundMessage>, bool) {
        (self.messages.into(), self.disconnect)
    }
}
