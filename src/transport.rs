//! Radio transport seam.
//!
//! The relay and handheld logic only ever talk to the network through the
//! [`Transport`] trait: fire-and-forget packet sends, address presence checks,
//! device (dis)connection and group resolution.  [`SimTransport`] is the
//! in-memory implementation the simulation harness drives; it queues packets
//! when they are sent and hands them out for delivery between ticks.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

pub type Frequency = u32;
pub type GroupId = String;

pub const DEFAULT_NETWORK: &str = "wireless";
pub const DEFAULT_FREQUENCY: Frequency = 2202;

/// Where a node sits on the radio medium.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLink {
    pub address: String,
    pub network: String,
    pub frequency: Frequency,
}

impl DeviceLink {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            network: DEFAULT_NETWORK.to_string(),
            frequency: DEFAULT_FREQUENCY,
        }
    }

    pub fn with_network(mut self, network: impl Into<String>, frequency: Frequency) -> Self {
        self.network = network.into();
        self.frequency = frequency;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    Unicast(String),
    Broadcast,
}

/// A packet in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub from: String,
    pub to: Destination,
    pub frequency: Frequency,
    pub payload: Vec<u8>,
}

/// Consumed transport contract.  Sends never report delivery.
pub trait Transport {
    fn send_packet(&mut self, from: &str, to: Destination, payload: Vec<u8>, frequency: Frequency);

    fn is_address_present(&self, network: &str, address: &str) -> bool;

    fn is_device_connected(&self, address: &str) -> bool;

    fn connect_device(&mut self, address: &str);

    fn disconnect_device(&mut self, address: &str, clear_queued: bool);

    fn owning_group(&self, address: &str) -> Option<GroupId>;
}

#[derive(Debug, Clone)]
struct SimDevice {
    link: DeviceLink,
    group: Option<GroupId>,
    connected: bool,
}

/// A datagram resolved to one receiving address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: String,
    pub datagram: Datagram,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub sent: usize,
    pub delivered: usize,
    pub unreachable: usize,
    pub dropped_from_disconnected: usize,
}

#[derive(Debug, Default)]
pub struct SimTransport {
    devices: HashMap<String, SimDevice>,
    pending: VecDeque<Datagram>,
    history: Option<Vec<Datagram>>,
    stats: TransportStats,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Like [`SimTransport::new`], but keeps every accepted datagram for
    /// later inspection.
    pub fn with_history() -> Self {
        Self {
            history: Some(Vec::new()),
            ..Self::default()
        }
    }

    /// Add (or re-add) a device.  A re-added device keeps nothing of its
    /// previous registration.
    pub fn register_device(&mut self, link: DeviceLink, group: Option<GroupId>, connected: bool) {
        self.devices.insert(
            link.address.clone(),
            SimDevice {
                link,
                group,
                connected,
            },
        );
    }

    pub fn unregister_device(&mut self, address: &str) {
        self.devices.remove(address);
        self.pending.retain(|datagram| datagram.from != address);
    }

    pub fn set_group(&mut self, address: &str, group: Option<GroupId>) {
        if let Some(device) = self.devices.get_mut(address) {
            device.group = group;
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn history(&self) -> &[Datagram] {
        self.history.as_deref().unwrap_or(&[])
    }

    pub fn clear_history(&mut self) {
        if let Some(history) = self.history.as_mut() {
            history.clear();
        }
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Take every queued datagram and resolve it against the device table as
    /// it stands now.  Packets sent while the caller dispatches these wait for
    /// the next call.
    pub fn take_deliveries(&mut self) -> Vec<Delivery> {
        let queued: Vec<Datagram> = self.pending.drain(..).collect();
        let mut deliveries = Vec::with_capacity(queued.len());
        for datagram in queued {
            let Some(sender) = self.devices.get(&datagram.from) else {
                self.stats.unreachable += 1;
                continue;
            };
            let network = sender.link.network.clone();
            match &datagram.to {
                Destination::Unicast(address) => {
                    let reachable = self.devices.get(address).is_some_and(|device| {
                        device.connected && device.link.network == network
                    });
                    if reachable {
                        deliveries.push(Delivery {
                            to: address.clone(),
                            datagram: datagram.clone(),
                        });
                    } else {
                        self.stats.unreachable += 1;
                    }
                }
                Destination::Broadcast => {
                    let mut receivers: Vec<&String> = self
                        .devices
                        .iter()
                        .filter(|(address, device)| {
                            **address != datagram.from
                                && device.connected
                                && device.link.network == network
                                && device.link.frequency == datagram.frequency
                        })
                        .map(|(address, _)| address)
                        .collect();
                    receivers.sort();
                    for address in receivers {
                        deliveries.push(Delivery {
                            to: address.clone(),
                            datagram: datagram.clone(),
                        });
                    }
                }
            }
        }
        self.stats.delivered += deliveries.len();
        deliveries
    }
}

impl Transport for SimTransport {
    fn send_packet(&mut self, from: &str, to: Destination, payload: Vec<u8>, frequency: Frequency) {
        if !self.is_device_connected(from) {
            self.stats.dropped_from_disconnected += 1;
            return;
        }
        let datagram = Datagram {
            from: from.to_string(),
            to,
            frequency,
            payload,
        };
        if let Some(history) = self.history.as_mut() {
            history.push(datagram.clone());
        }
        self.stats.sent += 1;
        self.pending.push_back(datagram);
    }

    fn is_address_present(&self, network: &str, address: &str) -> bool {
        self.devices
            .get(address)
            .is_some_and(|device| device.connected && device.link.network == network)
    }

    fn is_device_connected(&self, address: &str) -> bool {
        self.devices
            .get(address)
            .is_some_and(|device| device.connected)
    }

    fn connect_device(&mut self, address: &str) {
        if let Some(device) = self.devices.get_mut(address) {
            device.connected = true;
        }
    }

    fn disconnect_device(&mut self, address: &str, clear_queued: bool) {
        if let Some(device) = self.devices.get_mut(address) {
            device.connected = false;
        }
        if clear_queued {
            self.pending.retain(|datagram| datagram.from != address);
        }
    }

    fn owning_group(&self, address: &str) -> Option<GroupId> {
        self.devices
            .get(address)
            .and_then(|device| device.group.clone())
    }
}
