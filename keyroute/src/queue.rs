//! Outgoing coalescing queues.
//!
//! Each entry carries a deadline (enqueue time plus a fixed delay). Until the
//! head's deadline passes, the transport may hold entries back so that several
//! can share one packet.

use std::collections::VecDeque;

use crate::message::Message;
use crate::time::{Duration, Timestamp};
use crate::types::ACK_SIZE;

/// Pending acknowledgements.
#[derive(Debug, Default)]
pub struct AckQueue {
    entries: VecDeque<(u32, Timestamp)>,
    delay: Duration,
}

impl AckQueue {
    pub fn new(delay: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            delay,
        }
    }

    pub fn push(&mut self, seq: u32, now: Timestamp) {
        self.entries.push_back((seq, now + self.delay));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.entries.len() * ACK_SIZE
    }

    /// Deadline of the oldest ack.
    pub fn deadline(&self) -> Option<Timestamp> {
        self.entries.front().map(|&(_, deadline)| deadline)
    }

    /// Take up to `max` acks, oldest first.
    pub fn drain(&mut self, max: usize) -> Vec<u32> {
        let n = max.min(self.entries.len());
        self.entries.drain(..n).map(|(seq, _)| seq).collect()
    }
}

/// Pending messages of one class (search or transfer).
#[derive(Debug, Default)]
pub struct MessageQueue {
    entries: VecDeque<(Message, Timestamp)>,
    bytes: usize,
    delay: Duration,
}

impl MessageQueue {
    pub fn new(delay: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            bytes: 0,
            delay,
        }
    }

    pub fn push(&mut self, message: Message, now: Timestamp) {
        self.bytes += message.size();
        self.entries.push_back((message, now + self.delay));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total declared size of queued messages.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        self.entries.front().map(|&(_, deadline)| deadline)
    }

    pub fn head_size(&self) -> Option<usize> {
        self.entries.front().map(|(message, _)| message.size())
    }

    /// Pop the head if it fits in `room` bytes.
    pub fn pop_if_fits(&mut self, room: usize) -> Option<Message> {
        if self.head_size()? > room {
            return None;
        }
        let (message, _) = self.entries.pop_front()?;
        self.bytes -= message.size();
        Some(message)
    }
}
