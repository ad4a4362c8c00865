//! Metrics collection for simulation analysis.

use keyroute::{SearchId, SearchReport, Timestamp};

/// Link-level counters and finished searches.
#[derive(Debug, Clone, Default)]
pub struct SimMetrics {
    /// Packets handed to the link layer.
    pub packets_sent: u64,
    /// Packets lost to loss rate or disabled links.
    pub packets_dropped: u64,
    /// Packets handed to their destination node.
    pub packets_delivered: u64,
    pub bytes_sent: u64,
    pub timers_fired: u64,
    /// Reports of every finished locally originated search, in finishing order.
    pub reports: Vec<SearchReport>,
}

impl SimMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, id: SearchId) -> Option<&SearchReport> {
        self.reports.iter().find(|r| r.id == id)
    }

    pub fn successes(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.outcome.is_success())
            .count()
    }

    pub fn failures(&self) -> usize {
        self.reports.len() - self.successes()
    }
}

/// Result of running a simulation.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub end_time: Timestamp,
    pub metrics: SimMetrics,
    /// Whether the run ended because nothing was left to do.
    pub queue_exhausted: bool,
}

impl SimulationResult {
    pub fn report(&self, id: SearchId) -> Option<&SearchReport> {
        self.metrics.report(id)
    }

    /// At least one search finished and none failed.
    pub fn all_succeeded(&self) -> bool {
        !self.metrics.reports.is_empty() && self.metrics.failures() == 0
    }
}
