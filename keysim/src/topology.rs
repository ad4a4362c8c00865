//! Network topology and link properties.

use hashbrown::HashMap;
use keyroute::{Address, Duration};

/// Properties of a link between two nodes.
#[derive(Debug, Clone)]
pub struct Link {
    /// Packet loss rate (0.0 to 1.0).
    pub loss_rate: f64,
    /// One-way propagation delay.
    pub latency: Duration,
    /// Whether the link currently carries packets.
    pub active: bool,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            latency: Duration::from_millis(10),
            active: true,
        }
    }
}

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// Which pairs of nodes are connected, and how.
///
/// Links are bidirectional: both directions share loss rate and latency.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    links: HashMap<(Address, Address), Link>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every pair of nodes linked.
    pub fn fully_connected(nodes: &[Address]) -> Self {
        let mut topo = Self::new();
        for (i, &a) in nodes.iter().enumerate() {
            for &b in nodes.iter().skip(i + 1) {
                topo.add_link(a, b, Link::default());
            }
        }
        topo
    }

    /// Each node linked to its neighbors in the slice.
    pub fn chain(nodes: &[Address]) -> Self {
        let mut topo = Self::new();
        for pair in nodes.windows(2) {
            topo.add_link(pair[0], pair[1], Link::default());
        }
        topo
    }

    /// First node is the hub, linked to all others.
    pub fn star(nodes: &[Address]) -> Self {
        let mut topo = Self::new();
        let Some((&hub, spokes)) = nodes.split_first() else {
            return topo;
        };
        for &spoke in spokes {
            topo.add_link(hub, spoke, Link::default());
        }
        topo
    }

    pub fn add_link(&mut self, a: Address, b: Address, link: Link) {
        self.links.insert(Self::canonical_pair(a, b), link);
    }

    pub fn get_link(&self, a: Address, b: Address) -> Option<&Link> {
        self.links.get(&Self::canonical_pair(a, b))
    }

    pub fn get_link_mut(&mut self, a: Address, b: Address) -> Option<&mut Link> {
        self.links.get_mut(&Self::canonical_pair(a, b))
    }

    /// Link exists and is active.
    pub fn is_connected(&self, a: Address, b: Address) -> bool {
        self.get_link(a, b).is_some_and(|link| link.active)
    }

    /// Nodes reachable from `node` over active links, in address order.
    pub fn neighbors(&self, node: Address) -> Vec<Address> {
        let mut result: Vec<_> = self
            .links
            .iter()
            .filter(|(_, link)| link.active)
            .filter_map(|(&(a, b), _)| match node {
                n if n == a => Some(b),
                n if n == b => Some(a),
                _ => None,
            })
            .collect();
        result.sort();
        result
    }

    /// All links, each pair once, in address order.
    pub fn links(&self) -> Vec<(Address, Address, &Link)> {
        let mut result: Vec<_> = self
            .links
            .iter()
            .map(|(&(a, b), link)| (a, b, link))
            .collect();
        result.sort_by_key(|&(a, b, _)| (a, b));
        result
    }

    pub fn set_global_loss_rate(&mut self, rate: f64) {
        let rate = rate.clamp(0.0, 1.0);
        for link in self.links.values_mut() {
            link.loss_rate = rate;
        }
    }

    pub fn set_global_latency(&mut self, latency: Duration) {
        for link in self.links.values_mut() {
            link.latency = latency;
        }
    }

    fn canonical_pair(a: Address, b: Address) -> (Address, Address) {
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }
}
