//! Active relay election and failover.
//!
//! At most one relay per group is active.  Unavailable relays are
//! disconnected (directory and queue discarded) either eagerly on the relay
//! tick or lazily while resolving.  When no available relay of a group is
//! active, the last available one seen in registration order is promoted.

use std::collections::VecDeque;

use crate::directory::Directory;
use crate::protocol::Message;
use crate::transport::{DeviceLink, Transport};

/// Per-relay election and buffering state.
#[derive(Debug, Clone)]
pub struct RelayState {
    pub(crate) link: DeviceLink,
    pub(crate) available: bool,
    pub(crate) active: bool,
    pub(crate) directory: Directory,
    pub(crate) queue: VecDeque<Message>,
}

impl RelayState {
    pub fn new(link: DeviceLink) -> Self {
        Self {
            link,
            available: true,
            active: false,
            directory: Directory::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.link.address
    }

    pub fn link(&self) -> &DeviceLink {
        &self.link
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queued(&self) -> impl Iterator<Item = &Message> {
        self.queue.iter()
    }
}

/// Result of taking a relay off the network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sweep {
    pub disconnected: Vec<String>,
    pub lost_in_flight: usize,
}

impl Sweep {
    fn absorb(&mut self, address: &str, lost: usize) {
        self.disconnected.push(address.to_string());
        self.lost_in_flight += lost;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Elected {
    Existing(String),
    Promoted(String),
}

impl Elected {
    pub fn address(&self) -> &str {
        match self {
            Elected::Existing(address) | Elected::Promoted(address) => address,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub elected: Option<Elected>,
    pub sweep: Sweep,
}

/// Clear a relay's directory and queue, revoke its active flag and drop it
/// from the network.  Returns the number of queued messages discarded.
pub fn disconnect(relay: &mut RelayState, transport: &mut dyn Transport) -> usize {
    let lost = relay.queue.len();
    relay.directory.clear();
    relay.queue.clear();
    relay.active = false;
    transport.disconnect_device(&relay.link.address, false);
    lost
}

fn is_live(relay: &RelayState, transport: &dyn Transport) -> bool {
    relay.active || !relay.queue.is_empty() || transport.is_device_connected(&relay.link.address)
}

/// Disconnect every unavailable relay that is still active.
pub fn sweep_unavailable(relays: &mut [RelayState], transport: &mut dyn Transport) -> Sweep {
    let mut sweep = Sweep::default();
    for relay in relays.iter_mut() {
        if relay.available || !relay.active {
            continue;
        }
        let lost = disconnect(relay, transport);
        sweep.absorb(&relay.link.address, lost);
    }
    sweep
}

/// Find the active relay of `group`, promoting one if none is active.
///
/// The first active relay in iteration order wins.  Promotion registers the
/// relay on the transport when it is not connected yet; announcing it is up
/// to the caller.
pub fn resolve_active(
    relays: &mut [RelayState],
    group: &str,
    transport: &mut dyn Transport,
) -> Resolution {
    let mut resolution = Resolution::default();
    let mut last_available: Option<usize> = None;

    for (index, relay) in relays.iter_mut().enumerate() {
        if transport.owning_group(&relay.link.address).as_deref() != Some(group) {
            continue;
        }
        if !relay.available {
            if is_live(relay, transport) {
                let lost = disconnect(relay, transport);
                resolution.sweep.absorb(&relay.link.address, lost);
            }
            continue;
        }
        last_available = Some(index);
        if relay.active {
            resolution.elected = Some(Elected::Existing(relay.link.address.clone()));
            return resolution;
        }
    }

    if let Some(index) = last_available {
        let relay = &mut relays[index];
        relay.active = true;
        if !transport.is_device_connected(&relay.link.address) {
            transport.connect_device(&relay.link.address);
        }
        resolution.elected = Some(Elected::Promoted(relay.link.address.clone()));
    }
    resolution
}

/// Active relays of `group`; more than one is an election fault.
pub fn active_in_group<'a>(
    relays: &'a [RelayState],
    group: &str,
    transport: &dyn Transport,
) -> Vec<&'a str> {
    relays
        .iter()
        .filter(|relay| relay.active)
        .filter(|relay| transport.owning_group(&relay.link.address).as_deref() == Some(group))
        .map(|relay| relay.link.address.as_str())
        .collect()
}
