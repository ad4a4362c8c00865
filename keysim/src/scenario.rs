//! Scenario builder for setting up and running simulations.

use keyroute::{Address, DefaultConfig, Duration, Location, NodeConfig, Timestamp};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::event::{Event, Request, ScenarioAction};
use crate::metrics::SimulationResult;
use crate::sim::Simulator;
use crate::topology::Topology;

#[derive(Debug, Clone)]
enum TopologyType {
    FullyConnected,
    Chain,
    /// First node is the hub.
    Star,
    /// Built by the caller over addresses `0..n`.
    Custom(Topology),
}

/// Where nodes sit on the keyspace.
#[derive(Debug, Clone)]
enum Locations {
    /// Node `i` of `n` at `i / n`.
    Even,
    /// Uniform, from the scenario seed.
    Random,
    Explicit(Vec<f64>),
}

/// Builder for simulation scenarios.
///
/// Nodes get addresses `0..n` in creation order.
pub struct ScenarioBuilder {
    num_nodes: usize,
    seed: u64,
    topology_type: TopologyType,
    locations: Locations,
    loss_rate: f64,
    /// Overrides every link's latency when set.
    latency: Option<Duration>,
    /// Bytes per second per node; `None` is unlimited.
    bandwidth: Option<u32>,
    max_duration: Option<Duration>,
    actions: Vec<(Timestamp, ScenarioAction)>,
    requests: Vec<(Timestamp, usize, Request)>,
}

impl ScenarioBuilder {
    /// `num_nodes` fully connected nodes, evenly spaced, 10ms links.
    pub fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            seed: 42,
            topology_type: TopologyType::FullyConnected,
            locations: Locations::Even,
            loss_rate: 0.0,
            latency: None,
            bandwidth: None,
            max_duration: None,
            actions: Vec::new(),
            requests: Vec::new(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn fully_connected(mut self) -> Self {
        self.topology_type = TopologyType::FullyConnected;
        self
    }

    pub fn chain_topology(mut self) -> Self {
        self.topology_type = TopologyType::Chain;
        self
    }

    pub fn star_topology(mut self) -> Self {
        self.topology_type = TopologyType::Star;
        self
    }

    /// Use a custom topology over addresses `0..num_nodes`.
    ///
    /// Links keep their own latency and loss unless overridden with
    /// [`ScenarioBuilder::with_latency`] or [`ScenarioBuilder::with_loss_rate`].
    pub fn topology(mut self, topo: Topology) -> Self {
        self.topology_type = TopologyType::Custom(topo);
        self
    }

    pub fn evenly_spaced(mut self) -> Self {
        self.locations = Locations::Even;
        self
    }

    pub fn random_locations(mut self) -> Self {
        self.locations = Locations::Random;
        self
    }

    /// Explicit locations; nodes beyond the list fall back to even spacing.
    pub fn with_locations(mut self, locations: Vec<f64>) -> Self {
        self.locations = Locations::Explicit(locations);
        self
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_bandwidth(mut self, bytes_per_sec: u32) -> Self {
        self.bandwidth = Some(bytes_per_sec);
        self
    }

    pub fn with_max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = Some(duration);
        self
    }

    /// Disable the link between nodes `a` and `b` at `time`.
    pub fn disable_link_at(mut self, time: Timestamp, a: usize, b: usize) -> Self {
        self.actions.push((
            time,
            ScenarioAction::DisableLink {
                a: address(a),
                b: address(b),
            },
        ));
        self
    }

    pub fn enable_link_at(mut self, time: Timestamp, a: usize, b: usize) -> Self {
        self.actions.push((
            time,
            ScenarioAction::EnableLink {
                a: address(a),
                b: address(b),
            },
        ));
        self
    }

    /// Originate `request` at node `node` at `time`.
    pub fn request_at(mut self, time: Timestamp, node: usize, request: Request) -> Self {
        self.requests.push((time, node, request));
        self
    }

    /// Build with the default node configuration.
    pub fn build(self) -> (Simulator, Vec<Address>) {
        self.build_with::<DefaultConfig>()
    }

    pub fn build_with<Cfg: NodeConfig>(self) -> (Simulator<Cfg>, Vec<Address>) {
        let mut sim = Simulator::new(self.seed);
        if let Some(max) = self.max_duration {
            sim = sim.with_max_duration(max);
        }

        let locations = self.node_locations();
        let nodes: Vec<Address> = locations
            .iter()
            .enumerate()
            .map(|(i, &loc)| {
                let node_seed = self.seed.wrapping_add(i as u64 * 1000);
                sim.add_node(Location::new(loc), self.bandwidth, node_seed)
            })
            .collect();

        let mut topo = match self.topology_type {
            TopologyType::FullyConnected => Topology::fully_connected(&nodes),
            TopologyType::Chain => Topology::chain(&nodes),
            TopologyType::Star => Topology::star(&nodes),
            TopologyType::Custom(topo) => topo,
        };
        if self.loss_rate > 0.0 {
            topo.set_global_loss_rate(self.loss_rate);
        }
        if let Some(latency) = self.latency {
            topo.set_global_latency(latency);
        }
        for (a, b, link) in topo.links() {
            sim.link_nodes(a, b, link.clone());
        }

        for (time, action) in self.actions {
            sim.schedule_action(time, action);
        }
        for (time, node, request) in self.requests {
            sim.schedule(
                time,
                Event::Generate {
                    node: address(node),
                    request,
                },
            );
        }
        (sim, nodes)
    }

    /// Build and run for the specified duration.
    pub fn run_for(self, duration: Duration) -> SimulationResult {
        let (mut sim, _) = self.build();
        sim.run_for(duration)
    }

    fn node_locations(&self) -> Vec<f64> {
        let n = self.num_nodes;
        let even = |i: usize| i as f64 / n as f64;
        match &self.locations {
            Locations::Even => (0..n).map(even).collect(),
            Locations::Random => {
                let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
                (0..n).map(|_| rng.gen::<f64>()).collect()
            }
            Locations::Explicit(list) => (0..n)
                .map(|i| list.get(i).copied().unwrap_or_else(|| even(i)))
                .collect(),
        }
    }
}

fn address(index: usize) -> Address {
    Address(index as u32)
}

#[cfg(test)]
mod tests {
    use keyroute::{Key, SmallConfig};

    use super::*;

    #[test]
    fn test_scenario_builder_basic() {
        let (sim, nodes) = ScenarioBuilder::new(3).with_seed(123).build();
        assert_eq!(nodes, vec![Address(0), Address(1), Address(2)]);
        assert_eq!(sim.node_ids().len(), 3);
        assert_eq!(sim.node(nodes[0]).unwrap().peers().count(), 2);
    }

    #[test]
    fn test_even_and_explicit_locations() {
        let (sim, nodes) = ScenarioBuilder::new(4).build();
        let loc = |i: usize| sim.node(nodes[i]).unwrap().location().value();
        assert_eq!(loc(0), 0.0);
        assert_eq!(loc(2), 0.5);

        let (sim, nodes) = ScenarioBuilder::new(2)
            .with_locations(vec![0.3])
            .build_with::<SmallConfig>();
        assert_eq!(sim.node(nodes[0]).unwrap().location().value(), 0.3);
        assert_eq!(sim.node(nodes[1]).unwrap().location().value(), 0.5);
    }

    #[test]
    fn test_random_locations_follow_seed() {
        let locations = |seed| {
            let (sim, nodes) = ScenarioBuilder::new(5)
                .with_seed(seed)
                .random_locations()
                .build();
            nodes
                .iter()
                .map(|&n| sim.node(n).unwrap().location().value())
                .collect::<Vec<_>>()
        };
        assert_eq!(locations(7), locations(7));
        assert_ne!(locations(7), locations(8));
    }

    #[test]
    fn test_link_settings_applied() {
        let (sim, nodes) = ScenarioBuilder::new(3)
            .chain_topology()
            .with_loss_rate(0.5)
            .with_latency(Duration::from_millis(40))
            .build();
        let link = sim.topology().get_link(nodes[0], nodes[1]).unwrap();
        assert_eq!(link.loss_rate, 0.5);
        assert_eq!(link.latency, Duration::from_millis(40));
        assert!(!sim.topology().is_connected(nodes[0], nodes[2]));
        let conn = sim.node(nodes[0]).unwrap().connection(nodes[1]).unwrap();
        assert_eq!(conn.latency(), Duration::from_millis(40));
    }

    #[test]
    fn test_star_and_link_actions() {
        let (mut sim, nodes) = ScenarioBuilder::new(4)
            .star_topology()
            .disable_link_at(Timestamp::from_millis(500), 0, 1)
            .build();
        assert_eq!(sim.topology().neighbors(nodes[0]).len(), 3);
        assert!(sim.topology().is_connected(nodes[0], nodes[1]));

        sim.run_for(Duration::from_secs(1));
        assert!(!sim.topology().is_connected(nodes[0], nodes[1]));
        assert!(sim.topology().is_connected(nodes[0], nodes[2]));
    }

    #[test]
    fn test_scheduled_requests_reported() {
        let result = ScenarioBuilder::new(3)
            .request_at(Timestamp::from_millis(10), 0, Request::ChkRequest(Key::at(0.7)))
            .request_at(Timestamp::from_millis(20), 1, Request::SskRequest(Key::at(0.2)))
            .run_for(Duration::from_secs(30));
        assert_eq!(result.metrics.reports.len(), 2);
    }
}
