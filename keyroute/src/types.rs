//! Core identifiers and protocol constants.

use core::fmt;

// Wire sizes (bytes)
pub const MAX_PACKET_SIZE: usize = 1500; // MTU
pub const PACKET_HEADER_SIZE: usize = 80; // addresses, seq and ack-count fields
pub const MAX_PAYLOAD: usize = MAX_PACKET_SIZE - PACKET_HEADER_SIZE;
pub const ACK_SIZE: usize = 4;
pub const SENSIBLE_PAYLOAD: usize = 1000; // send without waiting once this much is queued
pub const MESSAGE_HEADER_SIZE: usize = 12;
pub const KEY_SIZE: usize = 32;
pub const PUB_KEY_SIZE: usize = 256;
pub const BLOCK_SIZE: usize = 1024;
pub const SSK_DATA_SIZE: usize = 1024;

/// Number of fixed-size blocks making up one CHK.
pub const BLOCKS_PER_CHK: usize = 32;

// Congestion window (bytes)
pub const MIN_CWIND: f64 = 3000.0;
pub const MAX_CWIND: f64 = 1_000_000.0;
pub const ALPHA: f64 = 0.3125; // additive increase
pub const BETA: f64 = 0.875; // multiplicative decrease
pub const GAMMA: f64 = 3.0; // slow start divisor

// Retransmission and coalescing, as multiples of the RTT estimate
pub const RTO: f64 = 4.0;
pub const FRTO: f64 = 1.5;
pub const LINK_IDLE: f64 = 8.0;
pub const RTT_DECAY: f64 = 0.9;
pub const MAX_DELAY_MS: u64 = 100; // coalescing delay for search and transfer messages
pub const ACK_DELAY_MS: u64 = 10; // coalescing delay for acks

// Sequence tracking
pub const SEQ_RANGE: u32 = 1000;
pub const RX_REORDER_LIMIT: usize = 256;

/// Network address of a simulated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub u32);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Index of a connection in its node's connection arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub usize);

/// Network-wide unique identifier of one search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SearchId(pub u64);

impl fmt::Display for SearchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Generator for search IDs, owned by whoever drives the simulation.
#[derive(Debug, Default)]
pub struct SearchIds {
    next: u64,
}

impl SearchIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> SearchId {
        let id = SearchId(self.next);
        self.next += 1;
        id
    }
}

/// Point on the circular `[0, 1)` routing keyspace.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Location(f64);

impl Location {
    /// Wraps any finite value into `[0, 1)`.
    pub fn new(value: f64) -> Self {
        let wrapped = value.rem_euclid(1.0);
        // rem_euclid can round up to exactly 1.0 for tiny negative inputs
        Location(if wrapped >= 1.0 { 0.0 } else { wrapped })
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// Circular distance, in `[0, 0.5]`.
    pub fn distance(self, other: Location) -> f64 {
        let d = (self.0 - other.0).abs();
        d.min(1.0 - d)
    }
}

/// Routing key of a CHK or SSK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(pub u64);

impl Key {
    /// Location of the key on the keyspace: `key / 2^64`.
    pub fn location(self) -> Location {
        Location::new(self.0 as f64 / 18_446_744_073_709_551_616.0)
    }

    /// Key whose location is (approximately) `location`.
    pub fn at(location: f64) -> Self {
        let loc = Location::new(location).value();
        Key((loc * 18_446_744_073_709_551_616.0) as u64)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_distance_is_circular() {
        let a = Location::new(0.05);
        let b = Location::new(0.95);
        assert!((a.distance(b) - 0.1).abs() < 1e-9);
        assert!((b.distance(a) - 0.1).abs() < 1e-9);
        assert_eq!(a.distance(a), 0.0);
        assert!(Location::new(0.0).distance(Location::new(0.5)) <= 0.5);
    }

    #[test]
    fn test_location_wraps() {
        assert!((Location::new(1.25).value() - 0.25).abs() < 1e-9);
        assert!((Location::new(-0.25).value() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_key_location_roundtrip() {
        let key = Key::at(0.3);
        assert!((key.location().value() - 0.3).abs() < 1e-9);
        assert_eq!(Key(0).location().value(), 0.0);
    }

    #[test]
    fn test_search_ids_are_unique() {
        let mut ids = SearchIds::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_wire_constants_consistent() {
        assert!(MESSAGE_HEADER_SIZE + BLOCK_SIZE <= MAX_PAYLOAD);
        assert!(MESSAGE_HEADER_SIZE + SSK_DATA_SIZE + PUB_KEY_SIZE <= MAX_PAYLOAD);
        assert!(SENSIBLE_PAYLOAD <= MAX_PAYLOAD);
        assert!(MIN_CWIND < MAX_CWIND);
    }
}
