//! Single tick source driving every relay and handheld over an in-memory
//! transport.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::handheld::{DeviceProfile, DisplayState, HandheldConfig, HandheldSession, SubmitError};
use crate::protocol::Timestamp;
use crate::relay::{RelayConfig, RelayManager};
use crate::transport::{DeviceLink, Frequency, SimTransport, Transport};

pub mod config;
pub mod metrics;
pub mod random;
pub mod scenario;

pub use config::{
    HandheldConfigToml, HandheldDefinition, MessageSizeDistribution, NetworkConfig,
    OutageConfig, PlannedSend, RelayConfigToml, RelayDefinition, ScenarioError, ScenarioEvent,
    SimulationConfig, SimulationScenarioConfig, TrafficConfig,
};
pub use metrics::{
    CountSummary, HandheldSummary, LatencySummary, RollingLatencySnapshot, RollingLatencyTracker,
    SimulationMetrics, SimulationReport, SimulationStepUpdate,
};
pub use random::{
    generate_message_body, sample_bernoulli, sample_message_size, sample_poisson,
    sample_recipients,
};
pub use scenario::{
    build_outage_events, build_planned_sends, build_simulation_inputs, run_simulation_scenario,
    run_simulation_scenario_with_progress, SimulationInputs,
};

pub const ROLLING_LATENCY_WINDOW: usize = 32;

/// What one step changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub submitted: usize,
    pub delivered: usize,
    pub packets_delivered: usize,
}

pub struct SimulationHarness {
    transport: SimTransport,
    relays: RelayManager,
    handhelds: Vec<HandheldSession>,
    network_id: String,
    frequency: Frequency,
    step_duration: Duration,
    clock: Duration,
    steps: usize,
    rejected_submits: usize,
    election_violations: usize,
    rolling_latency: RollingLatencyTracker,
    delivery_latency: LatencySummary,
    log_sink: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

impl SimulationHarness {
    pub fn new(step_duration: Duration, relay_config: RelayConfig) -> Self {
        Self {
            transport: SimTransport::new(),
            relays: RelayManager::new(relay_config),
            handhelds: Vec::new(),
            network_id: crate::transport::DEFAULT_NETWORK.to_string(),
            frequency: crate::transport::DEFAULT_FREQUENCY,
            step_duration,
            clock: Duration::ZERO,
            steps: 0,
            rejected_submits: 0,
            election_violations: 0,
            rolling_latency: RollingLatencyTracker::new(ROLLING_LATENCY_WINDOW),
            delivery_latency: LatencySummary::default(),
            log_sink: None,
        }
    }

    pub fn with_network(mut self, network_id: impl Into<String>, frequency: Frequency) -> Self {
        self.network_id = network_id.into();
        self.frequency = frequency;
        self
    }

    /// Keep every datagram sent on the transport.  Call before adding
    /// devices.
    pub fn with_transport_history(mut self) -> Self {
        self.transport = SimTransport::with_history();
        self
    }

    /// Route harness events to `log_sink` instead of [`crate::tlog!`].
    pub fn with_log_sink(mut self, log_sink: Arc<dyn Fn(String) + Send + Sync>) -> Self {
        self.log_sink = Some(log_sink);
        self
    }

    /// Build the device population declared by `config`.  Relays join the
    /// network disconnected and handhelds connected.
    pub fn from_scenario(config: &SimulationScenarioConfig) -> Result<Self, ScenarioError> {
        let mut harness = Self::new(
            config.simulation.step_duration()?,
            config.relay.relay_config()?,
        )
        .with_network(config.network.network_id.clone(), config.network.frequency);
        let handheld_config = config.handheld.handheld_config()?;

        for relay in &config.relays {
            if !harness.add_relay(&relay.address, &relay.group) {
                return Err(ScenarioError::DuplicateAddress(relay.address.clone()));
            }
        }
        for handheld in &config.handhelds {
            let added = harness.add_handheld(
                &handheld.address,
                handheld.name.as_deref(),
                handheld.group.as_deref(),
                handheld_config.clone(),
            );
            if !added {
                return Err(ScenarioError::DuplicateAddress(handheld.address.clone()));
            }
            harness.set_profile(&handheld.address, handheld.profile.clone());
        }
        Ok(harness)
    }

    fn link(&self, address: &str) -> DeviceLink {
        DeviceLink::new(address).with_network(self.network_id.clone(), self.frequency)
    }

    fn is_known(&self, address: &str) -> bool {
        self.relays.contains(address) || self.handheld(address).is_some()
    }

    pub fn add_relay(&mut self, address: &str, group: &str) -> bool {
        if self.is_known(address) {
            return false;
        }
        let link = self.link(address);
        self.transport
            .register_device(link.clone(), Some(group.to_string()), false);
        self.relays.add_relay(link)
    }

    pub fn remove_relay(&mut self, address: &str) -> bool {
        if self.relays.remove_relay(address, &mut self.transport).is_none() {
            return false;
        }
        self.transport.unregister_device(address);
        self.log_action(format!("relay {} removed", crate::logging::addr(address)));
        true
    }

    pub fn add_handheld(
        &mut self,
        address: &str,
        owner_name: Option<&str>,
        group: Option<&str>,
        config: HandheldConfig,
    ) -> bool {
        if self.is_known(address) {
            return false;
        }
        let link = self.link(address);
        self.transport
            .register_device(link.clone(), group.map(str::to_string), true);
        self.handhelds
            .push(HandheldSession::new(link, owner_name, config));
        true
    }

    pub fn set_relay_power(&mut self, address: &str, powered: bool) {
        self.log_action(format!(
            "relay {} power {}",
            crate::logging::addr(address),
            if powered { "on" } else { "off" }
        ));
        self.relays
            .on_power_changed(address, powered, &mut self.transport);
    }

    pub fn rename_handheld(&mut self, address: &str, owner_name: &str) -> bool {
        let Some(handheld) = self.handheld_mut(address) else {
            return false;
        };
        handheld.set_owner(owner_name);
        true
    }

    pub fn set_profile(&mut self, address: &str, profile: DeviceProfile) -> bool {
        let Some(handheld) = self.handheld_mut(address) else {
            return false;
        };
        handheld.set_profile(profile);
        true
    }

    pub fn assign_group(&mut self, address: &str, group: Option<&str>) -> bool {
        if !self.is_known(address) {
            return false;
        }
        if self.transport.owning_group(address).as_deref() == group {
            return true;
        }
        self.transport.set_group(address, group.map(str::to_string));
        if self.relays.contains(address) {
            self.log_action(format!(
                "relay {} moved to group {}",
                crate::logging::addr(address),
                group.unwrap_or("none")
            ));
            self.relays.on_group_changed(address, &mut self.transport);
        }
        true
    }

    /// Submit from the handheld at `from`, stamped with the current clock.
    /// `None` when no such handheld exists.
    pub fn submit(
        &mut self,
        from: &str,
        to: &[impl AsRef<str>],
        body: &str,
    ) -> Option<Result<usize, SubmitError>> {
        let now = self.now();
        let handheld = self
            .handhelds
            .iter_mut()
            .find(|handheld| handheld.address() == from)?;
        let result = handheld.submit(to, body, now, &mut self.transport);
        if let Err(error) = &result {
            self.rejected_submits += 1;
            self.log_action(format!(
                "submit from {} rejected: {error}",
                crate::logging::addr(from)
            ));
        }
        Some(result)
    }

    pub fn apply_event(&mut self, event: &ScenarioEvent) {
        match event {
            ScenarioEvent::Power { relay, powered, .. } => self.set_relay_power(relay, *powered),
            ScenarioEvent::RemoveRelay { relay, .. } => {
                self.remove_relay(relay);
            }
            ScenarioEvent::Rename { handheld, name, .. } => {
                self.rename_handheld(handheld, name);
            }
            ScenarioEvent::AssignGroup { address, group, .. } => {
                self.assign_group(address, group.as_deref());
            }
        }
    }

    /// Simulated milliseconds since the start of the run.
    pub fn now(&self) -> Timestamp {
        u64::try_from(self.clock.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn clock(&self) -> Duration {
        self.clock
    }

    pub fn steps_run(&self) -> usize {
        self.steps
    }

    pub fn transport(&self) -> &SimTransport {
        &self.transport
    }

    pub fn relays(&self) -> &RelayManager {
        &self.relays
    }

    pub fn handhelds(&self) -> &[HandheldSession] {
        &self.handhelds
    }

    pub fn handheld(&self, address: &str) -> Option<&HandheldSession> {
        self.handhelds
            .iter()
            .find(|handheld| handheld.address() == address)
    }

    fn handheld_mut(&mut self, address: &str) -> Option<&mut HandheldSession> {
        self.handhelds
            .iter_mut()
            .find(|handheld| handheld.address() == address)
    }

    pub fn display_state(&self, address: &str) -> Option<DisplayState> {
        self.handheld(address).map(HandheldSession::display_state)
    }

    /// Relay groups known to the transport right now.
    pub fn relay_groups(&self) -> BTreeSet<String> {
        self.relays
            .relays()
            .iter()
            .filter_map(|relay| self.transport.owning_group(relay.address()))
            .collect()
    }

    pub fn active_relay(&self, group: &str) -> Option<String> {
        self.relays
            .active_relays(group, &self.transport)
            .first()
            .map(|address| address.to_string())
    }

    pub fn step(&mut self) -> StepOutcome {
        self.step_with(&[], &[])
    }

    /// Advance the clock, apply this step's events and sends, tick the relays
    /// then every handheld, and deliver what was sent before delivery began.
    pub fn step_with(&mut self, events: &[ScenarioEvent], sends: &[PlannedSend]) -> StepOutcome {
        self.steps += 1;
        self.clock = self.clock.saturating_add(self.step_duration);
        crate::logging::set_sim_time(self.clock);

        for event in events {
            self.apply_event(event);
        }
        let mut outcome = StepOutcome::default();
        for send in sends {
            if let Some(Ok(sent)) = self.submit(&send.from, &send.to, &send.body) {
                outcome.submitted += sent;
            }
        }

        self.relays.tick(self.step_duration, &mut self.transport);

        let now = self.now();
        for handheld in self.handhelds.iter_mut() {
            let latencies =
                handheld.tick(self.step_duration, now, &mut self.relays, &mut self.transport);
            for latency in latencies {
                self.rolling_latency.record(latency);
                self.delivery_latency.record(latency);
                outcome.delivered += 1;
            }
        }

        outcome.packets_delivered = self.deliver();
        self.check_election();
        outcome
    }

    /// Deliver every queued datagram.  Replies sent while delivering wait for
    /// the next step.
    fn deliver(&mut self) -> usize {
        let deliveries = self.transport.take_deliveries();
        let count = deliveries.len();
        for delivery in deliveries {
            if self.relays.contains(&delivery.to) {
                self.relays
                    .handle_datagram(&delivery.to, &delivery.datagram, &mut self.transport);
            } else if let Some(handheld) = self
                .handhelds
                .iter_mut()
                .find(|handheld| handheld.address() == delivery.to)
            {
                handheld.handle_datagram(&delivery.datagram, &mut self.transport);
            }
        }
        count
    }

    fn check_election(&mut self) {
        for group in self.relay_groups() {
            let active = self.relays.active_relays(&group, &self.transport);
            if active.len() > 1 {
                let listed = active.join(", ");
                self.election_violations += 1;
                self.log_action(format!("group {group} has {} active relays: {listed}", active.len()));
            }
        }
    }

    pub fn run(&mut self, steps: usize, inputs: &SimulationInputs) {
        self.run_with_progress(steps, inputs, |_| {});
    }

    pub fn run_with_progress<F>(&mut self, steps: usize, inputs: &SimulationInputs, mut on_step: F)
    where
        F: FnMut(SimulationStepUpdate),
    {
        for _ in 0..steps {
            let step = self.steps + 1;
            let outcome = self.step_with(inputs.events_at(step), inputs.sends_at(step));
            let groups = self.relay_groups();
            on_step(SimulationStepUpdate {
                step,
                total_steps: steps,
                simulated_seconds: self.clock.as_secs_f64(),
                submitted: outcome.submitted,
                delivered: outcome.delivered,
                active_relays: groups
                    .iter()
                    .filter(|group| self.active_relay(group).is_some())
                    .count(),
                queued_at_relays: self
                    .relays
                    .relays()
                    .iter()
                    .map(|relay| relay.queue_len())
                    .sum(),
                rolling_latency: self.rolling_latency.snapshot(),
            });
        }
    }

    pub fn metrics(&self) -> SimulationMetrics {
        let relay = self.relays.metrics();
        let transport = self.transport.stats();
        let mut metrics = SimulationMetrics {
            steps: self.steps,
            simulated_seconds: self.clock.as_secs_f64(),
            rejected_submits: self.rejected_submits,
            queued_at_relays: relay.submitted,
            forwarded: relay.forwarded,
            undeliverable: relay.undeliverable,
            lost_in_flight: relay.lost_in_flight,
            promotions: relay.promotions,
            disconnects: relay.disconnects,
            dropped_packets: relay.dropped_packets,
            election_violations: self.election_violations,
            packets_sent: transport.sent,
            packets_unreachable: transport.unreachable,
            ..SimulationMetrics::default()
        };
        for handheld in &self.handhelds {
            let counters = handheld.metrics();
            metrics.submitted += counters.sent;
            metrics.delivered += counters.delivered;
            metrics.stale_bindings += counters.stale_bindings;
            metrics.dropped_packets += counters.dropped_packets;
        }
        metrics
    }

    pub fn report(&self) -> SimulationReport {
        let active_relays = self
            .relay_groups()
            .into_iter()
            .map(|group| {
                let active = self.active_relay(&group);
                (group, active)
            })
            .collect::<BTreeMap<_, _>>();
        let handhelds = self
            .handhelds
            .iter()
            .map(|handheld| HandheldSummary {
                address: handheld.address().to_string(),
                owner_name: handheld.owner_name().to_string(),
                group: handheld.group().map(str::to_string),
                connected_relay: handheld.connected_relay().map(str::to_string),
                known_peers: handheld.directory().len(),
                conversations: handheld.conversations().len(),
                sent: handheld.metrics().sent,
                delivered: handheld.metrics().delivered,
                stale_bindings: handheld.metrics().stale_bindings,
            })
            .collect();
        SimulationReport {
            metrics: self.metrics(),
            delivery_latency_ms: self.delivery_latency.clone(),
            conversations_per_handheld: CountSummary::from_counts(
                self.handhelds
                    .iter()
                    .map(|handheld| handheld.conversations().len()),
            ),
            active_relays,
            handhelds,
        }
    }

    fn log_action(&self, message: String) {
        if let Some(log_sink) = &self.log_sink {
            log_sink(message);
        } else {
            crate::tlog!("{message}");
        }
    }
}
