use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::handheld::{
    DeviceProfile, HandheldConfig, DEFAULT_DOWNLOAD_LATENCY, DEFAULT_OWNER_NAME,
    DEFAULT_POLL_INTERVAL,
};
use crate::relay::{RelayConfig, DEFAULT_RELAY_UPDATE_PERIOD};
use crate::transport::{Frequency, DEFAULT_FREQUENCY, DEFAULT_NETWORK};

fn default_seconds_per_step() -> f64 {
    0.5
}

fn default_update_period_seconds() -> f64 {
    DEFAULT_RELAY_UPDATE_PERIOD.as_secs_f64()
}

fn default_poll_interval_seconds() -> f64 {
    DEFAULT_POLL_INTERVAL.as_secs_f64()
}

fn default_download_latency_seconds() -> f64 {
    DEFAULT_DOWNLOAD_LATENCY.as_secs_f64()
}

fn default_placeholder_name() -> String {
    DEFAULT_OWNER_NAME.to_string()
}

fn default_network_id() -> String {
    DEFAULT_NETWORK.to_string()
}

fn default_frequency() -> Frequency {
    DEFAULT_FREQUENCY
}

fn default_recipients_per_message() -> usize {
    1
}

fn default_message_size_distribution() -> MessageSizeDistribution {
    MessageSizeDistribution::Uniform { min: 16, max: 64 }
}

#[derive(Debug)]
pub enum ScenarioError {
    Toml(toml::de::Error),
    Io(std::io::Error),
    DuplicateAddress(String),
    UnknownRelay { step: usize, address: String },
    UnknownHandheld { step: usize, address: String },
    InvalidTiming { field: &'static str, value: f64 },
}

impl std::fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScenarioError::Toml(error) => write!(f, "scenario parse error: {error}"),
            ScenarioError::Io(error) => write!(f, "scenario read error: {error}"),
            ScenarioError::DuplicateAddress(address) => {
                write!(f, "address {address} is declared more than once")
            }
            ScenarioError::UnknownRelay { step, address } => {
                write!(f, "step {step}: unknown relay {address}")
            }
            ScenarioError::UnknownHandheld { step, address } => {
                write!(f, "step {step}: unknown handheld {address}")
            }
            ScenarioError::InvalidTiming { field, value } => {
                write!(f, "{field} must be a positive number of seconds, got {value}")
            }
        }
    }
}

impl std::error::Error for ScenarioError {}

impl From<toml::de::Error> for ScenarioError {
    fn from(error: toml::de::Error) -> Self {
        ScenarioError::Toml(error)
    }
}

impl From<std::io::Error> for ScenarioError {
    fn from(error: std::io::Error) -> Self {
        ScenarioError::Io(error)
    }
}

fn seconds(field: &'static str, value: f64) -> Result<Duration, ScenarioError> {
    if value.is_nan() || value <= 0.0 {
        return Err(ScenarioError::InvalidTiming { field, value });
    }
    Duration::try_from_secs_f64(value).map_err(|_| ScenarioError::InvalidTiming { field, value })
}

/// `[simulation]`.  Steps are numbered from 1; events and sends scheduled
/// for step `n` are applied at the start of step `n`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub steps: usize,
    #[serde(default = "default_seconds_per_step")]
    pub seconds_per_step: f64,
    #[serde(default)]
    pub seed: u64,
}

impl SimulationConfig {
    pub fn step_duration(&self) -> Result<Duration, ScenarioError> {
        seconds("simulation.seconds_per_step", self.seconds_per_step)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfigToml {
    #[serde(default = "default_update_period_seconds")]
    pub update_period_seconds: f64,
}

impl Default for RelayConfigToml {
    fn default() -> Self {
        Self {
            update_period_seconds: default_update_period_seconds(),
        }
    }
}

impl RelayConfigToml {
    pub fn relay_config(&self) -> Result<RelayConfig, ScenarioError> {
        Ok(RelayConfig {
            update_period: seconds("relay.update_period_seconds", self.update_period_seconds)?,
            log_sink: None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandheldConfigToml {
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: f64,
    #[serde(default = "default_download_latency_seconds")]
    pub download_latency_seconds: f64,
    #[serde(default = "default_placeholder_name")]
    pub placeholder_name: String,
}

impl Default for HandheldConfigToml {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval_seconds(),
            download_latency_seconds: default_download_latency_seconds(),
            placeholder_name: default_placeholder_name(),
        }
    }
}

impl HandheldConfigToml {
    pub fn handheld_config(&self) -> Result<HandheldConfig, ScenarioError> {
        Ok(HandheldConfig {
            poll_interval: seconds("handheld.poll_interval_seconds", self.poll_interval_seconds)?,
            download_latency: seconds(
                "handheld.download_latency_seconds",
                self.download_latency_seconds,
            )?,
            placeholder_name: self.placeholder_name.clone(),
            log_sink: None,
        })
    }
}

/// Radio medium shared by every device of the scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_network_id")]
    pub network_id: String,
    #[serde(default = "default_frequency")]
    pub frequency: Frequency,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network_id: default_network_id(),
            frequency: default_frequency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayDefinition {
    pub address: String,
    pub group: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandheldDefinition {
    pub address: String,
    /// Absent means the placeholder owner name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub profile: DeviceProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScenarioEvent {
    Power {
        step: usize,
        relay: String,
        powered: bool,
    },
    RemoveRelay {
        step: usize,
        relay: String,
    },
    Rename {
        step: usize,
        handheld: String,
        name: String,
    },
    /// Move any device to another group, or out of every group.
    AssignGroup {
        step: usize,
        address: String,
        #[serde(default)]
        group: Option<String>,
    },
}

impl ScenarioEvent {
    pub fn step(&self) -> usize {
        match self {
            ScenarioEvent::Power { step, .. }
            | ScenarioEvent::RemoveRelay { step, .. }
            | ScenarioEvent::Rename { step, .. }
            | ScenarioEvent::AssignGroup { step, .. } => *step,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedSend {
    pub step: usize,
    pub from: String,
    pub to: Vec<String>,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageSizeDistribution {
    Uniform {
        min: usize,
        max: usize,
    },
    Normal {
        mean: f64,
        std_dev: f64,
        min: usize,
        max: usize,
    },
    LogNormal {
        mean: f64,
        std_dev: f64,
        min: usize,
        max: usize,
    },
}

/// Seeded random traffic between the named handhelds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficConfig {
    /// Poisson rate per named handheld.
    pub messages_per_minute: f64,
    #[serde(default = "default_recipients_per_message")]
    pub recipients_per_message: usize,
    #[serde(default = "default_message_size_distribution")]
    pub message_size_distribution: MessageSizeDistribution,
    /// First step that may carry generated traffic.
    #[serde(default)]
    pub start_step: usize,
}

/// Seeded relay power failures.  Each relay flips with these probabilities
/// once per step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutageConfig {
    pub failure_probability: f64,
    #[serde(default)]
    pub recovery_probability: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationScenarioConfig {
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub relay: RelayConfigToml,
    #[serde(default)]
    pub handheld: HandheldConfigToml,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub relays: Vec<RelayDefinition>,
    #[serde(default)]
    pub handhelds: Vec<HandheldDefinition>,
    #[serde(default)]
    pub events: Vec<ScenarioEvent>,
    #[serde(default)]
    pub sends: Vec<PlannedSend>,
    #[serde(default)]
    pub traffic: Option<TrafficConfig>,
    #[serde(default)]
    pub outages: Option<OutageConfig>,
}

impl SimulationScenarioConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ScenarioError> {
        let scenario: SimulationScenarioConfig = toml::from_str(contents)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Reject timings that cannot drive the tick source, duplicate device
    /// addresses, and events or sends naming devices the scenario never
    /// declares.
    pub fn validate(&self) -> Result<(), ScenarioError> {
        self.simulation.step_duration()?;
        self.relay.relay_config()?;
        self.handheld.handheld_config()?;

        let mut addresses = HashSet::new();
        for address in self
            .relays
            .iter()
            .map(|relay| &relay.address)
            .chain(self.handhelds.iter().map(|handheld| &handheld.address))
        {
            if !addresses.insert(address.as_str()) {
                return Err(ScenarioError::DuplicateAddress(address.clone()));
            }
        }

        let is_relay = |address: &str| self.relays.iter().any(|relay| relay.address == address);
        let is_handheld =
            |address: &str| self.handhelds.iter().any(|handheld| handheld.address == address);

        for event in &self.events {
            match event {
                ScenarioEvent::Power { step, relay, .. }
                | ScenarioEvent::RemoveRelay { step, relay } => {
                    if !is_relay(relay) {
                        return Err(ScenarioError::UnknownRelay {
                            step: *step,
                            address: relay.clone(),
                        });
                    }
                }
                ScenarioEvent::Rename { step, handheld, .. } => {
                    if !is_handheld(handheld) {
                        return Err(ScenarioError::UnknownHandheld {
                            step: *step,
                            address: handheld.clone(),
                        });
                    }
                }
                ScenarioEvent::AssignGroup { step, address, .. } => {
                    if !is_relay(address) && !is_handheld(address) {
                        return Err(ScenarioError::UnknownHandheld {
                            step: *step,
                            address: address.clone(),
                        });
                    }
                }
            }
        }

        for send in &self.sends {
            if !is_handheld(&send.from) {
                return Err(ScenarioError::UnknownHandheld {
                    step: send.step,
                    address: send.from.clone(),
                });
            }
        }
        Ok(())
    }
}
