use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

/// Network-wide counters gathered from the relays, the handhelds and the
/// transport at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimulationMetrics {
    pub steps: usize,
    pub simulated_seconds: f64,
    /// Packets handed to the transport by `submit`.
    pub submitted: usize,
    pub rejected_submits: usize,
    /// Submissions that reached a relay queue.
    pub queued_at_relays: usize,
    pub forwarded: usize,
    pub undeliverable: usize,
    pub delivered: usize,
    pub lost_in_flight: usize,
    pub promotions: usize,
    pub disconnects: usize,
    pub stale_bindings: usize,
    pub dropped_packets: usize,
    pub election_violations: usize,
    pub packets_sent: usize,
    pub packets_unreachable: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountSummary {
    pub min: Option<usize>,
    pub max: Option<usize>,
    pub average: Option<f64>,
}

impl CountSummary {
    pub(crate) fn from_counts<I: IntoIterator<Item = usize>>(counts: I) -> Self {
        let mut min: Option<usize> = None;
        let mut max: Option<usize> = None;
        let mut total = 0usize;
        let mut samples = 0usize;
        for count in counts {
            min = Some(min.map_or(count, |current| current.min(count)));
            max = Some(max.map_or(count, |current| current.max(count)));
            total = total.saturating_add(count);
            samples = samples.saturating_add(1);
        }
        let average = if samples > 0 {
            Some(total as f64 / samples as f64)
        } else {
            None
        };
        Self { min, max, average }
    }
}

/// Milliseconds from `sent_at` to the message landing in a conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub average: Option<f64>,
    pub samples: usize,
    #[serde(skip)]
    total: u64,
}

impl LatencySummary {
    pub(crate) fn from_samples<'a, I: IntoIterator<Item = &'a u64>>(latencies: I) -> Self {
        let mut summary = Self::default();
        for latency in latencies {
            summary.record(*latency);
        }
        summary
    }

    pub fn record(&mut self, latency: u64) {
        self.min = Some(self.min.map_or(latency, |current| current.min(latency)));
        self.max = Some(self.max.map_or(latency, |current| current.max(latency)));
        self.total = self.total.saturating_add(latency);
        self.samples = self.samples.saturating_add(1);
        self.average = Some(self.total as f64 / self.samples as f64);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandheldSummary {
    pub address: String,
    pub owner_name: String,
    pub group: Option<String>,
    pub connected_relay: Option<String>,
    pub known_peers: usize,
    pub conversations: usize,
    pub sent: usize,
    pub delivered: usize,
    pub stale_bindings: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub metrics: SimulationMetrics,
    pub delivery_latency_ms: LatencySummary,
    pub conversations_per_handheld: CountSummary,
    /// Active relay per relay group at the end of the run.
    pub active_relays: BTreeMap<String, Option<String>>,
    pub handhelds: Vec<HandheldSummary>,
}

#[derive(Debug, Clone)]
pub struct RollingLatencySnapshot {
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub average: Option<f64>,
    pub samples: usize,
    pub window: usize,
}

#[derive(Debug, Clone)]
pub struct SimulationStepUpdate {
    pub step: usize,
    pub total_steps: usize,
    pub simulated_seconds: f64,
    pub submitted: usize,
    pub delivered: usize,
    pub active_relays: usize,
    pub queued_at_relays: usize,
    pub rolling_latency: RollingLatencySnapshot,
}

#[derive(Debug)]
pub struct RollingLatencyTracker {
    window: usize,
    samples: VecDeque<u64>,
}

impl RollingLatencyTracker {
    pub(crate) fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::with_capacity(window.max(1)),
        }
    }

    pub fn record(&mut self, latency: u64) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
    }

    pub(crate) fn snapshot(&self) -> RollingLatencySnapshot {
        let summary = LatencySummary::from_samples(&self.samples);
        RollingLatencySnapshot {
            min: summary.min,
            max: summary.max,
            average: summary.average,
            samples: summary.samples,
            window: self.window,
        }
    }
}
