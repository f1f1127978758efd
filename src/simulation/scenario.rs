use std::collections::BTreeMap;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use super::random::{generate_message_body, sample_bernoulli, sample_poisson, sample_recipients};
use super::{
    OutageConfig, PlannedSend, ScenarioError, ScenarioEvent, SimulationHarness, SimulationReport,
    SimulationScenarioConfig, SimulationStepUpdate, TrafficConfig,
};

/// Everything scheduled for a run, keyed by step.
#[derive(Debug, Clone, Default)]
pub struct SimulationInputs {
    pub events: BTreeMap<usize, Vec<ScenarioEvent>>,
    pub sends: BTreeMap<usize, Vec<PlannedSend>>,
}

impl SimulationInputs {
    pub fn events_at(&self, step: usize) -> &[ScenarioEvent] {
        self.events.get(&step).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn sends_at(&self, step: usize) -> &[PlannedSend] {
        self.sends.get(&step).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn push_event(&mut self, event: ScenarioEvent) {
        self.events.entry(event.step()).or_default().push(event);
    }

    pub fn push_send(&mut self, send: PlannedSend) {
        self.sends.entry(send.step).or_default().push(send);
    }

    pub fn total_sends(&self) -> usize {
        self.sends.values().map(Vec::len).sum()
    }
}

/// Merge the declared events and sends with seeded random traffic and
/// outages.  The same scenario always yields the same inputs.
pub fn build_simulation_inputs(config: &SimulationScenarioConfig) -> SimulationInputs {
    let mut rng = ChaCha8Rng::seed_from_u64(config.simulation.seed);
    let mut inputs = SimulationInputs::default();

    for event in &config.events {
        inputs.push_event(event.clone());
    }
    if let Some(outages) = &config.outages {
        for event in build_outage_events(config, outages, &mut rng) {
            inputs.push_event(event);
        }
    }

    for send in &config.sends {
        inputs.push_send(send.clone());
    }
    if let Some(traffic) = &config.traffic {
        for send in build_planned_sends(config, traffic, &mut rng) {
            inputs.push_send(send);
        }
    }
    inputs
}

/// Two-state power model per relay, flipped once per step.
pub fn build_outage_events(
    config: &SimulationScenarioConfig,
    outages: &OutageConfig,
    rng: &mut ChaCha8Rng,
) -> Vec<ScenarioEvent> {
    let mut powered: Vec<bool> = vec![true; config.relays.len()];
    let mut events = Vec::new();
    for step in 1..=config.simulation.steps {
        for (relay, is_powered) in config.relays.iter().zip(powered.iter_mut()) {
            let probability = if *is_powered {
                outages.failure_probability
            } else {
                outages.recovery_probability
            };
            if !sample_bernoulli(rng, probability) {
                continue;
            }
            *is_powered = !*is_powered;
            events.push(ScenarioEvent::Power {
                step,
                relay: relay.address.clone(),
                powered: *is_powered,
            });
        }
    }
    events
}

/// Poisson traffic from every named handheld to other named handhelds.
pub fn build_planned_sends(
    config: &SimulationScenarioConfig,
    traffic: &TrafficConfig,
    rng: &mut ChaCha8Rng,
) -> Vec<PlannedSend> {
    let named: Vec<String> = config
        .handhelds
        .iter()
        .filter(|handheld| {
            handheld
                .name
                .as_deref()
                .is_some_and(|name| name != config.handheld.placeholder_name)
        })
        .map(|handheld| handheld.address.clone())
        .collect();
    if named.len() < 2 {
        return Vec::new();
    }

    let lambda = traffic.messages_per_minute * config.simulation.seconds_per_step / 60.0;
    let mut sends = Vec::new();
    for step in traffic.start_step.max(1)..=config.simulation.steps {
        for from in &named {
            let others: Vec<String> = named
                .iter()
                .filter(|address| *address != from)
                .cloned()
                .collect();
            for _ in 0..sample_poisson(rng, lambda) {
                let to = sample_recipients(rng, &others, traffic.recipients_per_message.max(1));
                let body = generate_message_body(rng, &traffic.message_size_distribution);
                sends.push(PlannedSend {
                    step,
                    from: from.clone(),
                    to,
                    body,
                });
            }
        }
    }
    sends
}

pub fn run_simulation_scenario(
    config: SimulationScenarioConfig,
) -> Result<SimulationReport, ScenarioError> {
    run_simulation_scenario_with_progress(config, |_| {})
}

pub fn run_simulation_scenario_with_progress<F>(
    config: SimulationScenarioConfig,
    on_step: F,
) -> Result<SimulationReport, ScenarioError>
where
    F: FnMut(SimulationStepUpdate),
{
    config.validate()?;
    let inputs = build_simulation_inputs(&config);
    let mut harness = SimulationHarness::from_scenario(&config)?;
    harness.run_with_progress(config.simulation.steps, &inputs, on_step);
    Ok(harness.report())
}
