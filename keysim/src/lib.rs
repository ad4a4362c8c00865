//! keysim - Discrete event simulator for keyroute overlay networks.
//!
//! Runs many [`keyroute::Node`]s in one process against a single,
//! deterministic event queue. No real time passes: the clock jumps from one
//! event to the next.
//!
//! # Features
//!
//! - **Deterministic**: events at the same time run in scheduling order; loss
//!   decisions come from a seeded RNG
//! - **Link model**: per-link latency, loss rate, enable/disable at runtime
//! - **Scenario builder**: fully connected, chain, star or custom topologies;
//!   even, random or explicit node locations; scheduled searches and link changes
//! - **Metrics**: packet counters and a report for every finished search
//!
//! # Example
//!
//! ```
//! use keysim::{Duration, Key, Request, ScenarioBuilder};
//!
//! let (mut sim, nodes) = ScenarioBuilder::new(3).chain_topology().build();
//! let key = Key::at(0.6);
//! sim.node_mut(nodes[2]).unwrap().datastore_mut().put_chk(key, true);
//!
//! let id = sim.generate(nodes[0], Request::ChkRequest(key)).unwrap();
//! let result = sim.run_for(Duration::from_secs(10));
//! assert!(result.report(id).unwrap().outcome.is_success());
//! ```
//!
//! # Architecture
//!
//! The main loop pops the earliest event, advances the clock, hands the event
//! to the node it targets (`handle_packet`, `handle_timer`, `generate_*`) and
//! turns everything the node put in its outbox into new events: packets become
//! deliveries after the link latency (unless lost), timers become timer events,
//! and finished searches are recorded in the metrics.

pub mod error;
pub mod event;
pub mod metrics;
pub mod scenario;
pub mod sim;
pub mod topology;

// Re-export main types
pub use error::SimError;
pub use event::{Event, Request, ScenarioAction, ScheduledEvent};
pub use keyroute::{Address, Duration, Key, Location, SearchId, Timestamp};
pub use metrics::{SimMetrics, SimulationResult};
pub use scenario::ScenarioBuilder;
pub use sim::Simulator;
pub use topology::{Link, Topology};
