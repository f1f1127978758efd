use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::election::{self, Elected, RelayState, Sweep};
use crate::protocol::{Message, Packet};
use crate::scheduler::Scheduler;
use crate::transport::{Datagram, Destination, DeviceLink, Transport};

pub const DEFAULT_RELAY_UPDATE_PERIOD: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct RelayConfig {
    pub update_period: Duration,
    pub log_sink: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            update_period: DEFAULT_RELAY_UPDATE_PERIOD,
            log_sink: None,
        }
    }
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("update_period", &self.update_period)
            .field("log_sink", &self.log_sink.is_some())
            .finish()
    }
}

/// Answers "which relay serves this group right now".
pub trait GroupResolver {
    fn resolve_active_address(&mut self, group: &str, transport: &mut dyn Transport)
        -> Option<String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayMetrics {
    pub submitted: usize,
    pub forwarded: usize,
    pub undeliverable: usize,
    pub lost_in_flight: usize,
    pub promotions: usize,
    pub disconnects: usize,
    pub pings_answered: usize,
    pub announcements: usize,
    pub dropped_packets: usize,
}

/// Runs every relay node: the shared update tick, election, discovery and
/// store-and-forward of submitted messages.
pub struct RelayManager {
    config: RelayConfig,
    scheduler: Scheduler,
    relays: Vec<RelayState>,
    metrics: RelayMetrics,
}

impl RelayManager {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            scheduler: Scheduler::new(config.update_period),
            config,
            relays: Vec::new(),
            metrics: RelayMetrics::default(),
        }
    }

    /// Register a relay node.  It starts available and inactive; the caller
    /// owns its transport registration.  Returns `false` for a duplicate
    /// address.
    pub fn add_relay(&mut self, link: DeviceLink) -> bool {
        if self.contains(&link.address) {
            return false;
        }
        self.relays.push(RelayState::new(link));
        true
    }

    /// Destroy a relay: its directory and queue are discarded and it leaves
    /// the election.
    pub fn remove_relay(
        &mut self,
        address: &str,
        transport: &mut dyn Transport,
    ) -> Option<RelayState> {
        let index = self.index_of(address)?;
        self.on_removed(address);
        let lost = election::disconnect(&mut self.relays[index], transport);
        self.record_sweep(Sweep {
            disconnected: vec![address.to_string()],
            lost_in_flight: lost,
        });
        Some(self.relays.remove(index))
    }

    pub fn contains(&self, address: &str) -> bool {
        self.index_of(address).is_some()
    }

    pub fn relay(&self, address: &str) -> Option<&RelayState> {
        self.relays.iter().find(|relay| relay.address() == address)
    }

    pub fn relays(&self) -> &[RelayState] {
        &self.relays
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn active_relays(&self, group: &str, transport: &dyn Transport) -> Vec<&str> {
        election::active_in_group(&self.relays, group, transport)
    }

    fn index_of(&self, address: &str) -> Option<usize> {
        self.relays
            .iter()
            .position(|relay| relay.address() == address)
    }

    /// Advance the shared update accumulator.  When it fires, unavailable
    /// relays are swept, then every available active relay announces itself
    /// and flushes its queue.  Returns whether the update fired.
    pub fn tick(&mut self, elapsed: Duration, transport: &mut dyn Transport) -> bool {
        if !self.scheduler.advance(elapsed) {
            return false;
        }

        let sweep = election::sweep_unavailable(&mut self.relays, transport);
        self.record_sweep(sweep);

        for relay in self.relays.iter_mut() {
            if !relay.available || !relay.active {
                continue;
            }
            let link = &relay.link;
            if send(&self.config, link, Destination::Broadcast, &Packet::Ping, transport) {
                self.metrics.announcements += 1;
            }
            let (forwarded, undeliverable) = flush_queue(&self.config, relay, transport);
            self.metrics.forwarded += forwarded;
            self.metrics.undeliverable += undeliverable;
        }
        true
    }

    /// Entry point for packets the transport delivers to `relay_address`.
    /// Anything that does not decode is dropped.
    pub fn handle_datagram(
        &mut self,
        relay_address: &str,
        datagram: &Datagram,
        transport: &mut dyn Transport,
    ) {
        if datagram.from.is_empty() || !self.contains(relay_address) {
            self.metrics.dropped_packets += 1;
            return;
        }
        let packet = match Packet::decode(&datagram.payload) {
            Ok(packet) => packet,
            Err(error) => {
                self.metrics.dropped_packets += 1;
                log_message(
                    &self.config,
                    format!(
                        "relay {}: dropped packet from {}: {error}",
                        crate::logging::addr(relay_address),
                        crate::logging::addr(&datagram.from)
                    ),
                );
                return;
            }
        };
        match packet {
            Packet::Ping => self.on_discovery_ping(relay_address, &datagram.from, transport),
            Packet::Pong { from_name } => {
                self.on_discovery_reply(relay_address, &datagram.from, &from_name)
            }
            Packet::Tx(mut message) => {
                message.sender_address = datagram.from.clone();
                self.on_submit(relay_address, message);
            }
            Packet::PeerSnapshot { .. } => {}
        }
    }

    /// Reply to `from` with the relay's current directory.
    pub fn on_discovery_ping(
        &mut self,
        relay_address: &str,
        from: &str,
        transport: &mut dyn Transport,
    ) {
        let Some(relay) = self.relays.iter().find(|r| r.address() == relay_address) else {
            return;
        };
        let snapshot = Packet::PeerSnapshot {
            peers: relay.directory.snapshot(),
        };
        if send(
            &self.config,
            &relay.link,
            Destination::Unicast(from.to_string()),
            &snapshot,
            transport,
        ) {
            self.metrics.pings_answered += 1;
        }
    }

    /// Record a handheld's announced name.
    pub fn on_discovery_reply(&mut self, relay_address: &str, from: &str, name: &str) {
        let Some(index) = self.index_of(relay_address) else {
            return;
        };
        self.relays[index].directory.upsert(from, name);
    }

    /// Queue a message for the next flush.  Reachability is checked then.
    pub fn on_submit(&mut self, relay_address: &str, message: Message) {
        let Some(index) = self.index_of(relay_address) else {
            return;
        };
        self.relays[index].queue.push_back(message);
        self.metrics.submitted += 1;
    }

    /// Power signal.  Losing power disconnects the relay immediately.
    pub fn on_power_changed(
        &mut self,
        relay_address: &str,
        powered: bool,
        transport: &mut dyn Transport,
    ) {
        let Some(index) = self.index_of(relay_address) else {
            return;
        };
        let relay = &mut self.relays[index];
        relay.available = powered;
        if powered {
            return;
        }
        let was_active = relay.active;
        let lost = election::disconnect(relay, transport);
        if was_active || lost > 0 {
            self.record_sweep(Sweep {
                disconnected: vec![relay_address.to_string()],
                lost_in_flight: lost,
            });
        }
    }

    /// Group signal.  A relay that moves to another group leaves its old
    /// election disconnected and inactive, so it can never sit beside the
    /// active relay of its new group.
    pub fn on_group_changed(&mut self, relay_address: &str, transport: &mut dyn Transport) {
        let Some(index) = self.index_of(relay_address) else {
            return;
        };
        let relay = &mut self.relays[index];
        let was_live = relay.active || transport.is_device_connected(relay_address);
        let lost = election::disconnect(relay, transport);
        if was_live || lost > 0 {
            self.record_sweep(Sweep {
                disconnected: vec![relay_address.to_string()],
                lost_in_flight: lost,
            });
        }
    }

    pub fn on_removed(&mut self, relay_address: &str) {
        if let Some(index) = self.index_of(relay_address) {
            self.relays[index].directory.clear();
        }
    }

    /// Resolve (and if needed elect) the active relay of `group`.  A freshly
    /// promoted relay announces itself to the group.
    pub fn resolve_active_address(
        &mut self,
        group: &str,
        transport: &mut dyn Transport,
    ) -> Option<String> {
        let resolution = election::resolve_active(&mut self.relays, group, transport);
        self.record_sweep(resolution.sweep);

        match resolution.elected? {
            Elected::Existing(address) => Some(address),
            Elected::Promoted(address) => {
                self.metrics.promotions += 1;
                log_message(
                    &self.config,
                    format!(
                        "relay {}: promoted to active for {group}",
                        crate::logging::addr(&address)
                    ),
                );
                if let Some(relay) = self.relays.iter().find(|r| r.address() == address) {
                    let ping = Packet::Ping;
                    if send(&self.config, &relay.link, Destination::Broadcast, &ping, transport) {
                        self.metrics.announcements += 1;
                    }
                }
                Some(address)
            }
        }
    }

    fn record_sweep(&mut self, sweep: Sweep) {
        for address in &sweep.disconnected {
            log_message(
                &self.config,
                format!("relay {}: disconnected", crate::logging::addr(address)),
            );
        }
        if sweep.lost_in_flight > 0 {
            log_message(
                &self.config,
                format!(
                    "relay: {} queued message(s) lost in flight",
                    sweep.lost_in_flight
                ),
            );
        }
        self.metrics.disconnects += sweep.disconnected.len();
        self.metrics.lost_in_flight += sweep.lost_in_flight;
    }
}

impl GroupResolver for RelayManager {
    fn resolve_active_address(
        &mut self,
        group: &str,
        transport: &mut dyn Transport,
    ) -> Option<String> {
        RelayManager::resolve_active_address(self, group, transport)
    }
}

/// Forward every queued message to its receiver in FIFO order, one packet
/// each.  Receivers missing from the network lose the message.
fn flush_queue(
    config: &RelayConfig,
    relay: &mut RelayState,
    transport: &mut dyn Transport,
) -> (usize, usize) {
    let mut forwarded = 0;
    let mut undeliverable = 0;
    while let Some(message) = relay.queue.pop_front() {
        if !transport.is_address_present(&relay.link.network, &message.receiver_address) {
            undeliverable += 1;
            log_message(
                config,
                format!(
                    "relay {}: receiver {} not on network, message dropped",
                    crate::logging::addr(&relay.link.address),
                    crate::logging::addr(&message.receiver_address)
                ),
            );
            continue;
        }
        let to = Destination::Unicast(message.receiver_address.clone());
        if send(config, &relay.link, to, &Packet::Tx(message), transport) {
            forwarded += 1;
        }
    }
    if forwarded + undeliverable > 0 {
        log_message(
            config,
            format!(
                "relay {}: flushed {forwarded} message(s), {undeliverable} undeliverable",
                crate::logging::addr(&relay.link.address)
            ),
        );
    }
    (forwarded, undeliverable)
}

fn send(
    config: &RelayConfig,
    link: &DeviceLink,
    to: Destination,
    packet: &Packet,
    transport: &mut dyn Transport,
) -> bool {
    match packet.encode() {
        Ok(payload) => {
            transport.send_packet(&link.address, to, payload, link.frequency);
            true
        }
        Err(error) => {
            log_message(
                config,
                format!(
                    "relay {}: {} not sent: {error}",
                    crate::logging::addr(&link.address),
                    packet.command()
                ),
            );
            false
        }
    }
}

fn log_message(config: &RelayConfig, message: String) {
    if let Some(log_sink) = &config.log_sink {
        log_sink(message);
    } else {
        crate::tlog!("{message}");
    }
}
