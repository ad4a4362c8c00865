#![forbid(unsafe_code)]
//! keyroute - Key routing and reliable transport for a simulated overlay
//!
//! Nodes sit on a circular `[0, 1)` keyspace and route searches for keys
//! greedily toward the key's location, backtracking under a hops-to-live budget.
//! Content is either a content-addressed CHK (32 fixed-size blocks) or an
//! owner-signed SSK (a single value subject to collision detection).
//!
//! Between directly connected nodes runs a reliable transport: sequence
//! numbered packets, coalescing of small messages, AIMD congestion control,
//! a shared bandwidth limiter, and retransmission on timeout or on evidence of
//! loss from later acknowledgements.
//!
//! # Key Properties
//!
//! - Sans-IO: nothing here reads a clock, opens a socket or spawns a thread
//! - Deterministic: given the same seeds and inputs, a node behaves identically
//! - Every timer carries enough state to recognize itself as stale
//!
//! # Example
//!
//! ```
//! use keyroute::{Address, Key, Location, Node, Outgoing, SearchIds, SmallConfig, Timestamp};
//!
//! let mut ids = SearchIds::new();
//! let mut node = Node::<SmallConfig>::new(Address(7), Location::new(0.3), None, 42);
//!
//! // A node without peers can still answer from its own datastore.
//! let key = Key::at(0.3);
//! node.datastore_mut().put_chk(key, true);
//! node.generate_chk_request(key, &mut ids, Timestamp::ZERO);
//!
//! let finished = node
//!     .take_outgoing()
//!     .into_iter()
//!     .any(|o| matches!(o, Outgoing::Finished(report) if report.outcome.is_success()));
//! assert!(finished);
//! ```
//!
//! # Module Structure
//!
//! - [`types`] - Identifiers, locations and protocol constants
//! - [`message`] - Messages and packets with their declared sizes
//! - [`bandwidth`] - Token bucket shared by a node's connections
//! - [`congestion`] - AIMD congestion window
//! - [`queue`] - Coalescing queues
//! - [`connection`] - Reliable transport to one peer
//! - [`datastore`] - LRU store and cache tiers
//! - [`search`] - Per-search handler state
//! - [`node`] - Node struct and driver API
//! - [`routing`] - Forwarding, backtracking and timeouts
//! - [`reply`] - Replies and insert data transfer
//! - [`time`] - Timestamp and Duration types
//! - [`config`] - Compile-time node configuration

pub mod bandwidth;
pub mod config;
pub mod congestion;
pub mod connection;
pub mod datastore;
pub mod error;
pub mod message;
pub mod node;
pub mod queue;
pub mod reply;
pub mod routing;
pub mod search;
pub mod time;
pub mod types;

// Re-export main types at crate root
pub use config::{DefaultConfig, NodeConfig, SmallConfig};
pub use connection::{Connection, ConnectionStats};
pub use error::{ProtocolError, TimeoutKind};
pub use message::{Message, Packet, Search};
pub use node::{Node, NodeStats, Outgoing, Timer};
pub use search::{SearchHandler, SearchKind, SearchOutcome, SearchReport, SearchState};
pub use time::{Duration, Timestamp};
pub use types::{Address, Key, Location, PeerId, SearchId, SearchIds};

// Re-export constants
pub use types::{BLOCKS_PER_CHK, MAX_CWIND, MAX_PACKET_SIZE, MIN_CWIND, SEQ_RANGE};
