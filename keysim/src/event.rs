//! Event types and priority queue ordering for the discrete event loop.

use std::cmp::Ordering;

use keyroute::{Address, Key, Packet, Timer, Timestamp};

/// Unique sequence number for deterministic event ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Link changes that can be scheduled during a run.
#[derive(Debug, Clone)]
pub enum ScenarioAction {
    DisableLink { a: Address, b: Address },
    EnableLink { a: Address, b: Address },
    SetLossRate { a: Address, b: Address, rate: f64 },
}

/// A search the driver asks a node to originate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    ChkRequest(Key),
    ChkInsert(Key),
    SskRequest(Key),
    SskInsert { key: Key, value: u64 },
}

impl Request {
    pub fn key(&self) -> Key {
        match *self {
            Request::ChkRequest(key)
            | Request::ChkInsert(key)
            | Request::SskRequest(key)
            | Request::SskInsert { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    /// Hand a packet to its destination node.
    PacketDelivery { packet: Packet },
    /// Fire a timer the node asked for.
    Timer { node: Address, timer: Timer },
    /// Originate a search at a node.
    Generate { node: Address, request: Request },
    ScenarioAction(ScenarioAction),
}

/// A scheduled event with timestamp and sequence number for ordering.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub time: Timestamp,
    /// Breaks ties between events at the same time in scheduling order.
    pub seq: SequenceNumber,
    pub event: Event,
}

impl ScheduledEvent {
    pub fn new(time: Timestamp, seq: SequenceNumber, event: Event) -> Self {
        Self { time, seq, event }
    }
}

// BinaryHeap is a max-heap; the earliest event must compare greatest.
impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BinaryHeap;

    use super::*;

    fn timer(at: u64, seq: u64) -> ScheduledEvent {
        ScheduledEvent::new(
            Timestamp::from_millis(at),
            SequenceNumber::new(seq),
            Event::Timer {
                node: Address(0),
                timer: Timer::Transport,
            },
        )
    }

    #[test]
    fn test_event_ordering() {
        // Earlier time is "greater" in min-heap terms
        assert!(timer(5, 2) > timer(10, 1));
    }

    #[test]
    fn test_same_time_fifo() {
        assert!(timer(10, 1) > timer(10, 2));

        let mut heap = BinaryHeap::new();
        for (at, seq) in [(20, 0), (10, 1), (10, 2), (5, 3)] {
            heap.push(timer(at, seq));
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop())
            .map(|e| e.seq.value())
            .collect();
        assert_eq!(order, vec![3, 1, 2, 0]);
    }

    #[test]
    fn test_request_key() {
        let key = Key(7);
        assert_eq!(Request::SskInsert { key, value: 1 }.key(), key);
        assert_eq!(Request::ChkRequest(key).key(), key);
    }
}
