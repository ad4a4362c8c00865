//! Node implementation: connections, datastore and the table of searches.
//!
//! A node is a sans-IO state machine. The driver feeds it packets and timer
//! firings together with the current time, and drains what it wants to do next
//! with [`Node::take_outgoing`]:
//!
//! - [`Outgoing::Packet`] - hand the packet to the link toward `packet.dst`
//! - [`Outgoing::Timer`] - call [`Node::handle_timer`] at the given time
//! - [`Outgoing::Finished`] - a locally originated search has ended
//!
//! # Usage
//!
//! ```
//! use keyroute::{Address, DefaultConfig, Duration, Key, Location, Node, SearchIds, Timestamp};
//!
//! let mut ids = SearchIds::new();
//! let mut node = Node::<DefaultConfig>::new(Address(0), Location::new(0.25), None, 1);
//! node.connect(Address(1), Location::new(0.75), Duration::from_millis(50), Timestamp::ZERO);
//!
//! let id = node.generate_chk_request(Key::at(0.8), &mut ids, Timestamp::ZERO);
//! assert!(node.search(id).is_some());
//! assert!(!node.take_outgoing().is_empty());
//! ```

use core::marker::PhantomData;
use std::collections::VecDeque;
use std::num::NonZeroUsize;

use hashbrown::HashMap;
use lru::LruCache;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace, warn};

use crate::bandwidth::TokenBucket;
use crate::config::{DefaultConfig, NodeConfig};
use crate::connection::Connection;
use crate::datastore::Datastore;
use crate::error::ProtocolError;
use crate::message::{Message, Packet};
use crate::search::{SearchHandler, SearchKind, SearchOutcome, SearchReport, SearchState};
use crate::time::{Duration, Timestamp};
use crate::types::{Address, Key, Location, PeerId, SearchId, SearchIds, MAX_PACKET_SIZE};

/// Something the driver must do on the node's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Packet { packet: Packet, latency: Duration },
    Timer { at: Timestamp, timer: Timer },
    Finished(SearchReport),
}

/// Timers a node asks the driver to fire.
///
/// Search timers carry the handler epoch they were armed in; a timer whose
/// epoch no longer matches is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// Coalescing, bandwidth and retransmission deadlines of all connections.
    Transport,
    Accepted { id: SearchId, epoch: u32 },
    Search { id: SearchId, epoch: u32 },
    Transfer { id: SearchId, epoch: u32 },
    /// Release the next throttled local search.
    Throttle,
}

/// Node-wide counters.
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub searches_started: u64,
    pub searches_forwarded: u64,
    pub loops_rejected: u64,
    pub overloads_rejected: u64,
    pub unknown_packets: u64,
    pub stale_messages: u64,
}

/// Pacing of locally generated searches.
#[derive(Debug)]
pub(crate) struct Throttle {
    pub interval: Duration,
    pub next_release: Timestamp,
    pub armed: Option<Timestamp>,
    pub pending: VecDeque<SearchId>,
}

/// A participant in the overlay.
///
/// Generic over `Cfg`, the compile-time configuration. Use `DefaultConfig`
/// unless a scenario needs different capacities or policies.
pub struct Node<Cfg: NodeConfig = DefaultConfig> {
    // Identity
    pub(crate) address: Address,
    pub(crate) location: Location,

    // Connections, indexed by `PeerId`
    pub(crate) peers: Vec<Connection>,
    pub(crate) peer_index: HashMap<Address, PeerId>,
    pub(crate) bandwidth: TokenBucket,

    pub(crate) store: Datastore,

    // Searches
    pub(crate) searches: HashMap<SearchId, SearchHandler>,
    pub(crate) recent: LruCache<SearchId, ()>,
    pub(crate) throttle: Throttle,

    pub(crate) rng: ChaCha8Rng,

    // Scheduling
    pub(crate) outgoing: Vec<Outgoing>,
    pub(crate) transport_wake: Option<Timestamp>,

    pub(crate) stats: NodeStats,
    _config: PhantomData<Cfg>,
}

impl<Cfg: NodeConfig> Node<Cfg> {
    /// Create a node. `bandwidth` is the outgoing limit in bytes per second,
    /// `None` for unlimited.
    pub fn new(address: Address, location: Location, bandwidth: Option<u32>, seed: u64) -> Self {
        let bandwidth = match bandwidth {
            // One second of burst, and always room for a full packet.
            Some(rate) => TokenBucket::new(
                rate,
                rate.max(MAX_PACKET_SIZE as u32),
                Timestamp::ZERO,
            ),
            None => TokenBucket::unlimited(),
        };
        let recent = NonZeroUsize::new(Cfg::MAX_RECENT_SEARCHES).unwrap_or(NonZeroUsize::MIN);
        Self {
            address,
            location,
            peers: Vec::new(),
            peer_index: HashMap::new(),
            bandwidth,
            store: Datastore::new(Cfg::STORE_SIZE, Cfg::CACHE_SIZE),
            searches: HashMap::new(),
            recent: LruCache::new(recent),
            throttle: Throttle {
                interval: Cfg::MIN_THROTTLE,
                next_release: Timestamp::ZERO,
                armed: None,
                pending: VecDeque::new(),
            },
            rng: ChaCha8Rng::seed_from_u64(seed),
            outgoing: Vec::new(),
            transport_wake: None,
            stats: NodeStats::default(),
            _config: PhantomData,
        }
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    pub fn datastore(&self) -> &Datastore {
        &self.store
    }

    pub fn datastore_mut(&mut self) -> &mut Datastore {
        &mut self.store
    }

    pub fn peer_id(&self, address: Address) -> Option<PeerId> {
        self.peer_index.get(&address).copied()
    }

    pub fn peer(&self, peer: PeerId) -> Option<&Connection> {
        self.peers.get(peer.0)
    }

    pub fn connection(&self, address: Address) -> Option<&Connection> {
        self.peer_id(address).and_then(|p| self.peer(p))
    }

    pub fn peers(&self) -> impl Iterator<Item = &Connection> {
        self.peers.iter()
    }

    pub fn search(&self, id: SearchId) -> Option<&SearchHandler> {
        self.searches.get(&id)
    }

    pub fn active_searches(&self) -> usize {
        self.searches.len()
    }

    /// Current pacing interval for local searches.
    pub fn throttle_interval(&self) -> Duration {
        self.throttle.interval
    }

    /// Drain everything the node produced since the last call.
    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        core::mem::take(&mut self.outgoing)
    }

    // ---------------------------------------------------------------------
    // Setup
    // ---------------------------------------------------------------------

    /// Open a connection to `remote`. Connecting twice returns the existing peer.
    pub fn connect(
        &mut self,
        remote: Address,
        location: Location,
        latency: Duration,
        now: Timestamp,
    ) -> PeerId {
        if let Some(peer) = self.peer_id(remote) {
            return peer;
        }
        let peer = PeerId(self.peers.len());
        let mut connection = Connection::new(self.address, remote, location, latency, now);
        if Cfg::USE_TOKENS || Cfg::USE_BACKOFF {
            connection = connection.with_load_limits(Cfg::FLOW_TOKENS, Cfg::INITIAL_BACKOFF);
        }
        self.peers.push(connection);
        self.peer_index.insert(remote, peer);
        debug!(node = %self.address, peer = %remote, latency_ms = latency.as_millis(), "connected");
        peer
    }

    // ---------------------------------------------------------------------
    // Driver entry points
    // ---------------------------------------------------------------------

    /// Process a packet delivered by the link.
    pub fn handle_packet(&mut self, packet: Packet, now: Timestamp) {
        let Some(peer) = self.peer_id(packet.src) else {
            warn!(node = %self.address, from = %packet.src, "packet from unknown peer");
            self.stats.unknown_packets += 1;
            return;
        };
        let mut packets = Vec::new();
        let messages = self.peers[peer.0].receive(packet, now, &mut self.bandwidth, &mut packets);
        self.emit_packets(peer, packets);
        for message in messages {
            self.handle_message(peer, message, now);
        }
        self.schedule_transport(now);
    }

    /// Process a timer previously requested through [`Outgoing::Timer`].
    pub fn handle_timer(&mut self, timer: Timer, now: Timestamp) {
        match timer {
            Timer::Transport => self.handle_transport_timer(now),
            Timer::Accepted { id, epoch } => self.handle_accepted_timeout(id, epoch, now),
            Timer::Search { id, epoch } => self.handle_search_timeout(id, epoch, now),
            Timer::Transfer { id, epoch } => self.handle_transfer_timeout(id, epoch, now),
            Timer::Throttle => {
                self.throttle.armed = None;
                self.release_throttled(now);
            }
        }
        self.schedule_transport(now);
    }

    /// Queue a raw message to `remote` outside any search.
    ///
    /// Returns `false` if `remote` is not a peer.
    pub fn send_to(&mut self, remote: Address, message: Message, now: Timestamp) -> bool {
        let Some(peer) = self.peer_id(remote) else {
            return false;
        };
        self.send(peer, message, now);
        self.schedule_transport(now);
        true
    }

    pub fn generate_chk_request(&mut self, key: Key, ids: &mut SearchIds, now: Timestamp) -> SearchId {
        self.generate(SearchKind::ChkRequest, key, None, ids, now)
    }

    pub fn generate_chk_insert(&mut self, key: Key, ids: &mut SearchIds, now: Timestamp) -> SearchId {
        self.generate(SearchKind::ChkInsert, key, None, ids, now)
    }

    pub fn generate_ssk_request(&mut self, key: Key, ids: &mut SearchIds, now: Timestamp) -> SearchId {
        self.generate(SearchKind::SskRequest, key, None, ids, now)
    }

    pub fn generate_ssk_insert(
        &mut self,
        key: Key,
        value: u64,
        ids: &mut SearchIds,
        now: Timestamp,
    ) -> SearchId {
        self.generate(SearchKind::SskInsert, key, Some(value), ids, now)
    }

    fn generate(
        &mut self,
        kind: SearchKind,
        key: Key,
        value: Option<u64>,
        ids: &mut SearchIds,
        now: Timestamp,
    ) -> SearchId {
        let id = ids.next_id();
        let candidates = (0..self.peers.len()).map(PeerId).collect();
        let mut handler = SearchHandler::new(
            id,
            kind,
            key,
            self.location,
            Cfg::MAX_HTL,
            None,
            candidates,
            now,
        );
        handler.value = value;
        self.recent.put(id, ());
        self.stats.searches_started += 1;
        debug!(node = %self.address, search = %id, ?kind, %key, "search generated");

        if self.searches.len() >= Cfg::MAX_ACTIVE_SEARCHES {
            self.searches.insert(id, handler);
            self.finish(id, SearchOutcome::Failed(ProtocolError::Overloaded(id)), now);
        } else {
            self.searches.insert(id, handler);
            if Cfg::USE_THROTTLE {
                self.throttle.pending.push_back(id);
                self.release_throttled(now);
            } else {
                self.start_local(id, now);
            }
        }
        self.schedule_transport(now);
        id
    }

    // ---------------------------------------------------------------------
    // Throttle
    // ---------------------------------------------------------------------

    fn release_throttled(&mut self, now: Timestamp) {
        while now >= self.throttle.next_release {
            let Some(id) = self.throttle.pending.pop_front() else {
                return;
            };
            if !self.searches.contains_key(&id) {
                continue;
            }
            self.throttle.next_release = now + self.throttle.interval;
            self.start_local(id, now);
        }
        if !self.throttle.pending.is_empty() && self.throttle.armed.is_none() {
            let at = self.throttle.next_release;
            self.throttle.armed = Some(at);
            self.set_timer(at, Timer::Throttle);
        }
    }

    /// An overload reached the originator: slow down.
    pub(crate) fn throttle_overloaded(&mut self) {
        if Cfg::USE_THROTTLE {
            self.throttle.interval = self.throttle.interval.saturating_mul(2).min(Cfg::MAX_THROTTLE);
            trace!(node = %self.address, interval_ms = self.throttle.interval.as_millis(), "throttle up");
        }
    }

    fn throttle_succeeded(&mut self) {
        if Cfg::USE_THROTTLE {
            self.throttle.interval = self.throttle.interval.mul_f64(0.9).max(Cfg::MIN_THROTTLE);
        }
    }

    // ---------------------------------------------------------------------
    // Transport plumbing
    // ---------------------------------------------------------------------

    pub(crate) fn send(&mut self, peer: PeerId, message: Message, now: Timestamp) {
        trace!(
            node = %self.address,
            peer = %self.peers[peer.0].remote(),
            ?message,
            "queueing message"
        );
        let mut packets = Vec::new();
        self.peers[peer.0].send_message(message, now, &mut self.bandwidth, &mut packets);
        self.emit_packets(peer, packets);
    }

    fn emit_packets(&mut self, peer: PeerId, packets: Vec<Packet>) {
        let latency = self.peers[peer.0].latency();
        self.outgoing.extend(
            packets
                .into_iter()
                .map(|packet| Outgoing::Packet { packet, latency }),
        );
    }

    pub(crate) fn set_timer(&mut self, at: Timestamp, timer: Timer) {
        self.outgoing.push(Outgoing::Timer { at, timer });
    }

    fn handle_transport_timer(&mut self, now: Timestamp) {
        if self.transport_wake != Some(now) {
            return;
        }
        self.transport_wake = None;
        for index in 0..self.peers.len() {
            let mut packets = Vec::new();
            self.peers[index].check_timeouts(now, &mut self.bandwidth, &mut packets);
            self.emit_packets(PeerId(index), packets);
        }
    }

    /// Re-arm the transport timer if some connection needs attention earlier
    /// than the wake already scheduled.
    fn schedule_transport(&mut self, now: Timestamp) {
        let bandwidth = &mut self.bandwidth;
        let Some(wake) = self
            .peers
            .iter()
            .filter_map(|c| c.next_wake(now, bandwidth))
            .min()
        else {
            return;
        };
        let wake = wake.max(now);
        // A recorded wake in the past has already fired.
        if self
            .transport_wake
            .map_or(true, |current| wake < current || current < now)
        {
            self.transport_wake = Some(wake);
            self.set_timer(wake, Timer::Transport);
        }
    }

    // ---------------------------------------------------------------------
    // Search bookkeeping
    // ---------------------------------------------------------------------

    /// Whether this node should keep content for `key` in its store tier:
    /// only if it is at least as close to the key as all of its peers.
    pub(crate) fn should_store(&self, key: Key) -> bool {
        let target = key.location();
        let own = self.location.distance(target);
        self.peers
            .iter()
            .all(|peer| own <= peer.location().distance(target))
    }

    pub(crate) fn remember_chk(&mut self, key: Key) {
        let store = self.should_store(key);
        self.store.put_chk(key, store);
    }

    pub(crate) fn remember_ssk(&mut self, key: Key, value: u64) {
        let store = self.should_store(key);
        self.store.put_ssk(key, value, store);
        self.store.put_pub_key(key, store);
    }

    /// Remove a handler, return flow credit upstream and report local searches.
    pub(crate) fn finish(&mut self, id: SearchId, outcome: SearchOutcome, now: Timestamp) {
        let Some(mut handler) = self.searches.remove(&id) else {
            return;
        };
        handler.state = SearchState::Completed;
        debug!(
            node = %self.address,
            search = %id,
            kind = ?handler.kind,
            ?outcome,
            "search finished"
        );
        match handler.prev {
            Some(prev) => {
                if Cfg::USE_TOKENS {
                    self.peers[prev.0].grant_token();
                    self.send(prev, Message::Token { count: 1 }, now);
                }
            }
            None => {
                match &outcome {
                    SearchOutcome::Success => self.throttle_succeeded(),
                    SearchOutcome::Failed(ProtocolError::Overloaded(_)) => {
                        self.throttle_overloaded()
                    }
                    _ => {}
                }
                self.outgoing.push(Outgoing::Finished(SearchReport {
                    id,
                    kind: handler.kind,
                    key: handler.key,
                    outcome,
                    value: handler.value,
                    started: handler.started,
                    finished: now,
                }));
            }
        }
    }

    pub(crate) fn remote(&self, peer: PeerId) -> Address {
        self.peers[peer.0].remote()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SmallConfig;

    fn node(addr: u32, loc: f64) -> Node {
        Node::new(Address(addr), Location::new(loc), None, addr as u64)
    }

    fn timers(out: &[Outgoing]) -> Vec<(Timestamp, Timer)> {
        out.iter()
            .filter_map(|o| match o {
                Outgoing::Timer { at, timer } => Some((*at, *timer)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_is_idempotent() {
        let mut n = node(0, 0.1);
        let a = n.connect(Address(1), Location::new(0.2), Duration::from_millis(10), Timestamp::ZERO);
        let b = n.connect(Address(1), Location::new(0.2), Duration::from_millis(10), Timestamp::ZERO);
        assert_eq!(a, b);
        assert_eq!(n.peers().count(), 1);
        assert_eq!(n.peer_id(Address(1)), Some(a));
    }

    #[test]
    fn test_local_search_without_peers_fails() {
        let mut n = node(0, 0.1);
        let mut ids = SearchIds::new();
        let id = n.generate_chk_request(Key::at(0.5), &mut ids, Timestamp::ZERO);
        let out = n.take_outgoing();
        let report = out
            .iter()
            .find_map(|o| match o {
                Outgoing::Finished(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(report.id, id);
        assert_eq!(
            report.outcome,
            SearchOutcome::Failed(ProtocolError::RouteNotFound(id))
        );
        assert_eq!(n.active_searches(), 0);
    }

    #[test]
    fn test_local_request_hits_own_store() {
        let mut n = node(0, 0.1);
        let key = Key::at(0.1);
        n.datastore_mut().put_chk(key, true);
        let mut ids = SearchIds::new();
        n.generate_chk_request(key, &mut ids, Timestamp::ZERO);
        let out = n.take_outgoing();
        assert!(out.iter().any(|o| matches!(
            o,
            Outgoing::Finished(SearchReport { outcome: SearchOutcome::Success, .. })
        )));
    }

    #[test]
    fn test_transport_timer_armed_once_and_stale_fire_ignored() {
        let mut n = node(0, 0.1);
        n.connect(Address(1), Location::new(0.5), Duration::from_millis(50), Timestamp::ZERO);
        let mut ids = SearchIds::new();
        n.generate_chk_request(Key::at(0.5), &mut ids, Timestamp::ZERO);
        let out = n.take_outgoing();
        let transport: Vec<_> = timers(&out)
            .into_iter()
            .filter(|(_, t)| *t == Timer::Transport)
            .collect();
        assert_eq!(transport.len(), 1);
        let (at, _) = transport[0];
        assert_eq!(at, Timestamp::from_millis(100), "coalescing deadline");

        // Firing at some other time does nothing.
        n.handle_timer(Timer::Transport, Timestamp::from_millis(40));
        assert!(n
            .take_outgoing()
            .iter()
            .all(|o| !matches!(o, Outgoing::Packet { .. })));

        n.handle_timer(Timer::Transport, at);
        let out = n.take_outgoing();
        assert_eq!(
            out.iter()
                .filter(|o| matches!(o, Outgoing::Packet { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_placement_rule() {
        let mut n = node(0, 0.5);
        n.connect(Address(1), Location::new(0.1), Duration::from_millis(10), Timestamp::ZERO);
        n.connect(Address(2), Location::new(0.9), Duration::from_millis(10), Timestamp::ZERO);
        assert!(n.should_store(Key::at(0.5)));
        assert!(!n.should_store(Key::at(0.05)));
    }

    #[test]
    fn test_concurrency_limit_rejects_local_search() {
        let mut n: Node<SmallConfig> = Node::new(Address(0), Location::new(0.1), None, 0);
        n.connect(Address(1), Location::new(0.5), Duration::from_millis(10), Timestamp::ZERO);
        let mut ids = SearchIds::new();
        for _ in 0..SmallConfig::MAX_ACTIVE_SEARCHES {
            n.generate_chk_request(Key::at(0.6), &mut ids, Timestamp::ZERO);
        }
        n.take_outgoing();
        let id = n.generate_chk_request(Key::at(0.6), &mut ids, Timestamp::ZERO);
        let out = n.take_outgoing();
        assert!(out.iter().any(|o| matches!(
            o,
            Outgoing::Finished(SearchReport { id: rid, outcome: SearchOutcome::Failed(_), .. }) if *rid == id
        )));
        assert_eq!(n.active_searches(), SmallConfig::MAX_ACTIVE_SEARCHES);
    }
}
