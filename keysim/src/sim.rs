//! Discrete event simulator for keyroute networks.

use std::collections::BinaryHeap;

use hashbrown::HashMap;
use keyroute::{
    Address, DefaultConfig, Duration, Location, Message, Node, NodeConfig, Outgoing, Packet,
    SearchId, SearchIds, Timestamp,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace};

use crate::error::SimError;
use crate::event::{Event, Request, ScenarioAction, ScheduledEvent, SequenceNumber};
use crate::metrics::{SimMetrics, SimulationResult};
use crate::topology::{Link, Topology};

/// Runs a set of nodes against a time-ordered event queue.
///
/// Every event runs to completion before the next is popped; events at the
/// same time run in the order they were scheduled.
pub struct Simulator<Cfg: NodeConfig = DefaultConfig> {
    nodes: HashMap<Address, Node<Cfg>>,
    topology: Topology,
    current_time: Timestamp,
    event_queue: BinaryHeap<ScheduledEvent>,
    metrics: SimMetrics,
    next_seq: u64,
    /// Link loss decisions.
    rng: ChaCha8Rng,
    ids: SearchIds,
    /// Upper bound for [`Simulator::run`].
    max_duration: Option<Duration>,
}

impl<Cfg: NodeConfig> Simulator<Cfg> {
    pub fn new(seed: u64) -> Self {
        Self {
            nodes: HashMap::new(),
            topology: Topology::new(),
            current_time: Timestamp::ZERO,
            event_queue: BinaryHeap::new(),
            metrics: SimMetrics::new(),
            next_seq: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
            ids: SearchIds::new(),
            max_duration: None,
        }
    }

    /// Stop [`Simulator::run`] at this simulated time even if events remain.
    pub fn with_max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = Some(duration);
        self
    }

    /// Add an unconnected node. Addresses are assigned in order from 0.
    pub fn add_node(&mut self, location: Location, bandwidth: Option<u32>, seed: u64) -> Address {
        let address = Address(self.nodes.len() as u32);
        self.nodes
            .insert(address, Node::new(address, location, bandwidth, seed));
        debug!(node = %address, location = location.value(), "node added");
        address
    }

    /// Link two nodes and open a connection in each direction.
    pub fn connect(&mut self, a: Address, b: Address, link: Link) -> Result<(), SimError> {
        for node in [a, b] {
            if !self.nodes.contains_key(&node) {
                return Err(SimError::UnknownNode(node));
            }
        }
        self.link_nodes(a, b, link);
        Ok(())
    }

    /// Like [`Simulator::connect`] for nodes known to exist.
    pub(crate) fn link_nodes(&mut self, a: Address, b: Address, link: Link) {
        let now = self.current_time;
        let latency = link.latency;
        self.topology.add_link(a, b, link);

        let locations = (
            self.nodes.get(&a).map(|n| n.location()),
            self.nodes.get(&b).map(|n| n.location()),
        );
        let (Some(loc_a), Some(loc_b)) = locations else {
            return;
        };
        if let Some(node) = self.nodes.get_mut(&a) {
            node.connect(b, loc_b, latency, now);
        }
        if let Some(node) = self.nodes.get_mut(&b) {
            node.connect(a, loc_a, latency, now);
        }
    }

    pub fn node(&self, address: Address) -> Option<&Node<Cfg>> {
        self.nodes.get(&address)
    }

    pub fn node_mut(&mut self, address: Address) -> Option<&mut Node<Cfg>> {
        self.nodes.get_mut(&address)
    }

    /// All node addresses, sorted.
    pub fn node_ids(&self) -> Vec<Address> {
        let mut ids: Vec<_> = self.nodes.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn now(&self) -> Timestamp {
        self.current_time
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn metrics(&self) -> &SimMetrics {
        &self.metrics
    }

    pub fn pending_events(&self) -> usize {
        self.event_queue.len()
    }

    pub fn schedule(&mut self, time: Timestamp, event: Event) {
        let seq = SequenceNumber::new(self.next_seq);
        self.next_seq += 1;
        self.event_queue.push(ScheduledEvent::new(time, seq, event));
    }

    pub fn schedule_in(&mut self, delay: Duration, event: Event) {
        self.schedule(self.current_time + delay, event);
    }

    pub fn schedule_action(&mut self, time: Timestamp, action: ScenarioAction) {
        self.schedule(time, Event::ScenarioAction(action));
    }

    /// Originate a search at `node` now.
    pub fn generate(&mut self, node: Address, request: Request) -> Result<SearchId, SimError> {
        let now = self.current_time;
        let ids = &mut self.ids;
        let target = self
            .nodes
            .get_mut(&node)
            .ok_or(SimError::UnknownNode(node))?;
        let id = match request {
            Request::ChkRequest(key) => target.generate_chk_request(key, ids, now),
            Request::ChkInsert(key) => target.generate_chk_insert(key, ids, now),
            Request::SskRequest(key) => target.generate_ssk_request(key, ids, now),
            Request::SskInsert { key, value } => target.generate_ssk_insert(key, value, ids, now),
        };
        self.collect_outgoing(node);
        Ok(id)
    }

    /// Send a message from `from` to its peer `to` outside any search.
    pub fn send_message(
        &mut self,
        from: Address,
        to: Address,
        message: Message,
    ) -> Result<(), SimError> {
        let now = self.current_time;
        let node = self
            .nodes
            .get_mut(&from)
            .ok_or(SimError::UnknownNode(from))?;
        if !node.send_to(to, message, now) {
            return Err(SimError::NotConnected { from, to });
        }
        self.collect_outgoing(from);
        Ok(())
    }

    /// Run until the queue is empty, or until the configured maximum duration.
    pub fn run(&mut self) -> SimulationResult {
        if let Some(max) = self.max_duration {
            return self.run_until(Timestamp::ZERO + max);
        }
        while let Some(event) = self.event_queue.pop() {
            self.advance_time(event.time);
            self.process_event(event.event);
        }
        self.result()
    }

    pub fn run_until(&mut self, end_time: Timestamp) -> SimulationResult {
        while self
            .event_queue
            .peek()
            .is_some_and(|event| event.time <= end_time)
        {
            let Some(event) = self.event_queue.pop() else {
                break;
            };
            self.advance_time(event.time);
            self.process_event(event.event);
        }
        self.advance_time(end_time);
        self.result()
    }

    pub fn run_for(&mut self, duration: Duration) -> SimulationResult {
        self.run_until(self.current_time + duration)
    }

    fn result(&self) -> SimulationResult {
        SimulationResult {
            end_time: self.current_time,
            metrics: self.metrics.clone(),
            queue_exhausted: self.event_queue.is_empty(),
        }
    }

    fn advance_time(&mut self, time: Timestamp) {
        if time > self.current_time {
            self.current_time = time;
        }
    }

    fn process_event(&mut self, event: Event) {
        let now = self.current_time;
        match event {
            Event::PacketDelivery { packet } => {
                let to = packet.dst;
                if let Some(node) = self.nodes.get_mut(&to) {
                    node.handle_packet(packet, now);
                    self.metrics.packets_delivered += 1;
                }
                self.collect_outgoing(to);
            }
            Event::Timer { node, timer } => {
                if let Some(target) = self.nodes.get_mut(&node) {
                    target.handle_timer(timer, now);
                    self.metrics.timers_fired += 1;
                }
                self.collect_outgoing(node);
            }
            Event::Generate { node, request } => {
                if let Err(err) = self.generate(node, request) {
                    debug!(%err, "scheduled search not generated");
                }
            }
            Event::ScenarioAction(action) => self.execute_action(action),
        }
    }

    /// Turn a node's outbox into scheduled events.
    fn collect_outgoing(&mut self, sender: Address) {
        let outgoing = match self.nodes.get_mut(&sender) {
            Some(node) => node.take_outgoing(),
            None => return,
        };
        for item in outgoing {
            match item {
                Outgoing::Packet { packet, latency } => self.route_packet(packet, latency),
                Outgoing::Timer { at, timer } => {
                    self.schedule(at, Event::Timer { node: sender, timer })
                }
                Outgoing::Finished(report) => {
                    debug!(
                        node = %sender,
                        search = %report.id,
                        outcome = ?report.outcome,
                        "search report"
                    );
                    self.metrics.reports.push(report);
                }
            }
        }
    }

    fn route_packet(&mut self, packet: Packet, latency: Duration) {
        self.metrics.packets_sent += 1;
        self.metrics.bytes_sent += packet.size() as u64;

        let loss_rate = match self.topology.get_link(packet.src, packet.dst) {
            Some(link) if link.active => link.loss_rate,
            _ => {
                trace!(from = %packet.src, to = %packet.dst, "no active link");
                self.metrics.packets_dropped += 1;
                return;
            }
        };
        if loss_rate > 0.0 && self.rng.gen::<f64>() < loss_rate {
            trace!(from = %packet.src, to = %packet.dst, seq = ?packet.seq, "packet lost");
            self.metrics.packets_dropped += 1;
            return;
        }
        self.schedule_in(latency, Event::PacketDelivery { packet });
    }

    fn execute_action(&mut self, action: ScenarioAction) {
        debug!(?action, "scenario action");
        match action {
            ScenarioAction::DisableLink { a, b } => {
                if let Some(link) = self.topology.get_link_mut(a, b) {
                    link.active = false;
                }
            }
            ScenarioAction::EnableLink { a, b } => {
                if let Some(link) = self.topology.get_link_mut(a, b) {
                    link.active = true;
                }
            }
            ScenarioAction::SetLossRate { a, b, rate } => {
                if let Some(link) = self.topology.get_link_mut(a, b) {
                    link.loss_rate = rate.clamp(0.0, 1.0);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use keyroute::Key;

    use super::*;

    fn pair() -> (Simulator, Address, Address) {
        let mut sim = Simulator::new(42);
        let a = sim.add_node(Location::new(0.1), None, 1);
        let b = sim.add_node(Location::new(0.6), None, 2);
        sim.connect(a, b, Link::new()).unwrap();
        (sim, a, b)
    }

    #[test]
    fn test_simulator_creation() {
        let sim: Simulator = Simulator::new(42);
        assert_eq!(sim.now(), Timestamp::ZERO);
        assert!(sim.node_ids().is_empty());
        assert_eq!(sim.pending_events(), 0);
    }

    #[test]
    fn test_connect_both_directions() {
        let (sim, a, b) = pair();
        assert!(sim.topology().is_connected(a, b));
        assert!(sim.node(a).unwrap().connection(b).is_some());
        assert!(sim.node(b).unwrap().connection(a).is_some());
    }

    #[test]
    fn test_driver_errors() {
        let (mut sim, a, _) = pair();
        let c = sim.add_node(Location::new(0.9), None, 3);
        assert_eq!(
            sim.connect(a, Address(9), Link::new()),
            Err(SimError::UnknownNode(Address(9)))
        );
        assert_eq!(
            sim.generate(Address(9), Request::ChkRequest(Key(1))),
            Err(SimError::UnknownNode(Address(9)))
        );
        assert_eq!(
            sim.send_message(a, c, Message::Token { count: 1 }),
            Err(SimError::NotConnected { from: a, to: c })
        );
    }

    #[test]
    fn test_run_until_advances_clock() {
        let (mut sim, _, _) = pair();
        let result = sim.run_until(Timestamp::from_secs(3));
        assert_eq!(result.end_time, Timestamp::from_secs(3));
        assert!(result.queue_exhausted);
    }

    #[test]
    fn test_scheduled_generate() {
        let (mut sim, a, _) = pair();
        sim.schedule(
            Timestamp::from_secs(1),
            Event::Generate {
                node: a,
                request: Request::ChkRequest(Key::at(0.6)),
            },
        );
        let result = sim.run_for(Duration::from_millis(999));
        assert!(result.metrics.reports.is_empty());
        assert_eq!(sim.node(a).unwrap().active_searches(), 0);

        let result = sim.run_for(Duration::from_secs(30));
        assert_eq!(result.metrics.reports.len(), 1);
        assert_eq!(sim.node(a).unwrap().active_searches(), 0);
    }

    #[test]
    fn test_disabled_link_drops_packets() {
        let (mut sim, a, b) = pair();
        sim.schedule_action(Timestamp::ZERO, ScenarioAction::DisableLink { a, b });
        sim.run_for(Duration::from_millis(1));
        sim.send_message(a, b, Message::Token { count: 1 }).unwrap();
        let result = sim.run_for(Duration::from_millis(500));
        assert!(result.metrics.packets_dropped >= 1);
        assert_eq!(result.metrics.packets_delivered, 0);

        sim.schedule_in(Duration::ZERO, Event::ScenarioAction(ScenarioAction::EnableLink { a, b }));
        let result = sim.run_for(Duration::from_secs(5));
        // The retransmission gets through once the link is back.
        assert!(result.metrics.packets_delivered >= 1);
    }

    #[test]
    fn test_total_loss() {
        let (mut sim, a, b) = pair();
        sim.schedule_action(
            Timestamp::ZERO,
            ScenarioAction::SetLossRate { a, b, rate: 1.0 },
        );
        sim.run_for(Duration::from_millis(1));
        sim.send_message(a, b, Message::Token { count: 1 }).unwrap();
        let result = sim.run_for(Duration::from_secs(2));
        assert_eq!(result.metrics.packets_delivered, 0);
        assert_eq!(result.metrics.packets_sent, result.metrics.packets_dropped);
    }
}
