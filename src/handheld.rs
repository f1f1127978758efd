use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conversation::{fold_received, Conversation};
use crate::directory::Directory;
use crate::protocol::{KnownPeer, Message, Packet, PacketError, Timestamp};
use crate::relay::GroupResolver;
use crate::scheduler::{Countdown, Scheduler};
use crate::transport::{Datagram, Destination, DeviceLink, GroupId, Transport};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_DOWNLOAD_LATENCY: Duration = Duration::from_millis(300);
pub const DEFAULT_OWNER_NAME: &str = "Unknown";

#[derive(Clone)]
pub struct HandheldConfig {
    pub poll_interval: Duration,
    pub download_latency: Duration,
    /// Owner name of a device nobody has claimed yet.  Such devices never
    /// announce themselves.
    pub placeholder_name: String,
    pub log_sink: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

impl Default for HandheldConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            download_latency: DEFAULT_DOWNLOAD_LATENCY,
            placeholder_name: DEFAULT_OWNER_NAME.to_string(),
            log_sink: None,
        }
    }
}

impl std::fmt::Debug for HandheldConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandheldConfig")
            .field("poll_interval", &self.poll_interval)
            .field("download_latency", &self.download_latency)
            .field("placeholder_name", &self.placeholder_name)
            .field("log_sink", &self.log_sink.is_some())
            .finish()
    }
}

/// Device features shown next to the messenger.  The session only carries
/// them into [`DisplayState`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    #[serde(default)]
    pub flashlight_enabled: bool,
    #[serde(default)]
    pub has_pen: bool,
    #[serde(default)]
    pub has_uplink: bool,
    #[serde(default)]
    pub can_play_music: bool,
    #[serde(default)]
    pub id_owner: Option<String>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub station_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnerInfo {
    pub actual_owner_name: Option<String>,
    pub id_owner: Option<String>,
    pub job_title: Option<String>,
}

/// Snapshot handed to whatever renders the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayState {
    pub flashlight_enabled: bool,
    pub has_pen: bool,
    pub owner_info: OwnerInfo,
    pub station_name: Option<String>,
    pub has_uplink: bool,
    pub can_play_music: bool,
    pub address: String,
    pub conversations: Vec<Conversation>,
    pub known_peers: Vec<KnownPeer>,
}

#[derive(Debug)]
pub enum SubmitError {
    Unnamed,
    NotConnected,
    NoRecipients,
    Encode(PacketError),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Unnamed => write!(f, "handheld has no owner name"),
            SubmitError::NotConnected => write!(f, "handheld is not bound to a relay"),
            SubmitError::NoRecipients => write!(f, "no recipient is in the peer directory"),
            SubmitError::Encode(error) => write!(f, "encode error: {error}"),
        }
    }
}

impl std::error::Error for SubmitError {}

impl From<PacketError> for SubmitError {
    fn from(error: PacketError) -> Self {
        SubmitError::Encode(error)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HandheldMetrics {
    pub sent: usize,
    pub received: usize,
    pub delivered: usize,
    pub polls: usize,
    pub pongs_sent: usize,
    pub stale_bindings: usize,
    pub dropped_packets: usize,
    /// Sum of `sent_at` to conversation over every delivered message.
    pub total_delivery_latency_ms: u64,
    pub max_delivery_latency_ms: Option<u64>,
}

impl HandheldMetrics {
    pub fn average_delivery_latency_ms(&self) -> Option<f64> {
        if self.delivered == 0 {
            return None;
        }
        Some(self.total_delivery_latency_ms as f64 / self.delivered as f64)
    }
}

/// One handheld's messenger: relay binding, discovery, submission and the
/// delayed download of forwarded messages into conversations.
pub struct HandheldSession {
    link: DeviceLink,
    config: HandheldConfig,
    owner_name: String,
    profile: DeviceProfile,
    group: Option<GroupId>,
    connected_relay: Option<String>,
    poll: Scheduler,
    incoming: VecDeque<Message>,
    download: Countdown,
    conversations: Vec<Conversation>,
    directory: Directory,
    display_revision: u64,
    metrics: HandheldMetrics,
}

impl HandheldSession {
    pub fn new(link: DeviceLink, owner_name: Option<&str>, config: HandheldConfig) -> Self {
        let owner_name = owner_name
            .map(str::to_string)
            .unwrap_or_else(|| config.placeholder_name.clone());
        Self {
            link,
            owner_name,
            profile: DeviceProfile::default(),
            group: None,
            connected_relay: None,
            poll: Scheduler::primed(config.poll_interval),
            incoming: VecDeque::new(),
            download: Countdown::default(),
            conversations: Vec::new(),
            directory: Directory::new(),
            display_revision: 0,
            metrics: HandheldMetrics::default(),
            config,
        }
    }

    pub fn address(&self) -> &str {
        &self.link.address
    }

    pub fn link(&self) -> &DeviceLink {
        &self.link
    }

    pub fn owner_name(&self) -> &str {
        &self.owner_name
    }

    /// Whether the owner name is set to something other than the placeholder.
    pub fn is_named(&self) -> bool {
        !self.owner_name.is_empty() && self.owner_name != self.config.placeholder_name
    }

    pub fn set_owner(&mut self, owner_name: &str) {
        if self.owner_name != owner_name {
            self.owner_name = owner_name.to_string();
            self.touch();
        }
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn set_profile(&mut self, profile: DeviceProfile) {
        self.profile = profile;
        self.touch();
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn connected_relay(&self) -> Option<&str> {
        self.connected_relay.as_deref()
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn incoming_len(&self) -> usize {
        self.incoming.len()
    }

    pub fn download_remaining(&self) -> Option<Duration> {
        self.download.remaining()
    }

    /// Bumped whenever something shown in [`DisplayState`] changes.
    pub fn display_revision(&self) -> u64 {
        self.display_revision
    }

    pub fn metrics(&self) -> &HandheldMetrics {
        &self.metrics
    }

    pub fn display_state(&self) -> DisplayState {
        DisplayState {
            flashlight_enabled: self.profile.flashlight_enabled,
            has_pen: self.profile.has_pen,
            owner_info: OwnerInfo {
                actual_owner_name: Some(self.owner_name.clone()),
                id_owner: self.profile.id_owner.clone(),
                job_title: self.profile.job_title.clone(),
            },
            station_name: self.profile.station_name.clone(),
            has_uplink: self.profile.has_uplink,
            can_play_music: self.profile.can_play_music,
            address: self.link.address.clone(),
            conversations: self.conversations.clone(),
            known_peers: self.directory.snapshot(),
        }
    }

    fn touch(&mut self) {
        self.display_revision += 1;
    }

    /// Advance the download countdown, then poll the relay when the poll
    /// interval has elapsed.  Returns the delivery latency, in milliseconds,
    /// of every message that landed in a conversation during this tick.
    pub fn tick(
        &mut self,
        elapsed: Duration,
        now: Timestamp,
        resolver: &mut dyn GroupResolver,
        transport: &mut dyn Transport,
    ) -> Vec<u64> {
        let latencies = self.advance_download(elapsed, now);
        if self.poll.advance(elapsed) {
            self.poll_relay(resolver, transport);
        }
        latencies
    }

    /// Ping the bound relay outside the poll schedule.
    pub fn refresh(&mut self, transport: &mut dyn Transport) -> bool {
        let Some(relay) = self.connected_relay.clone() else {
            return false;
        };
        if !transport.is_address_present(&self.link.network, &relay) {
            return false;
        }
        self.send(Destination::Unicast(relay), &Packet::Ping, transport)
    }

    fn poll_relay(&mut self, resolver: &mut dyn GroupResolver, transport: &mut dyn Transport) {
        let Some(group) = transport.owning_group(&self.link.address) else {
            self.group = None;
            return;
        };
        if self.group.as_deref() != Some(group.as_str()) {
            if self.connected_relay.take().is_some() {
                self.touch();
            }
            self.group = Some(group.clone());
        }
        let Some(relay) = self.bind_relay(&group, resolver, transport) else {
            return;
        };
        if self.send(Destination::Unicast(relay), &Packet::Ping, transport) {
            self.metrics.polls += 1;
        }
    }

    /// The relay to ping this poll.  A cached binding whose address left the
    /// network is cleared and resolution is retried once.
    fn bind_relay(
        &mut self,
        group: &str,
        resolver: &mut dyn GroupResolver,
        transport: &mut dyn Transport,
    ) -> Option<String> {
        if let Some(cached) = self.connected_relay.clone() {
            if transport.is_address_present(&self.link.network, &cached) {
                return Some(cached);
            }
            self.connected_relay = None;
            self.metrics.stale_bindings += 1;
            self.touch();
            self.log(format!(
                "handheld {}: relay {} left the network, unbinding",
                crate::logging::addr(&self.link.address),
                crate::logging::addr(&cached)
            ));
        }

        let resolved = resolver.resolve_active_address(group, transport)?;
        if !transport.is_address_present(&self.link.network, &resolved) {
            return None;
        }
        self.log(format!(
            "handheld {}: bound to relay {}",
            crate::logging::addr(&self.link.address),
            crate::logging::addr(&resolved)
        ));
        self.connected_relay = Some(resolved.clone());
        self.touch();
        Some(resolved)
    }

    /// Entry point for packets the transport delivers to this handheld.
    pub fn handle_datagram(&mut self, datagram: &Datagram, transport: &mut dyn Transport) {
        if datagram.from.is_empty() {
            self.metrics.dropped_packets += 1;
            return;
        }
        let packet = match Packet::decode(&datagram.payload) {
            Ok(packet) => packet,
            Err(error) => {
                self.metrics.dropped_packets += 1;
                self.log(format!(
                    "handheld {}: dropped packet from {}: {error}",
                    crate::logging::addr(&self.link.address),
                    crate::logging::addr(&datagram.from)
                ));
                return;
            }
        };
        match packet {
            Packet::Ping => self.on_discovery_ping_from_relay(transport),
            Packet::PeerSnapshot { peers } => self.on_discovery_reply(peers),
            Packet::Tx(message) => self.on_message_received(message),
            Packet::Pong { .. } => {}
        }
    }

    /// Take the relay's directory as the whole truth.
    pub fn on_discovery_reply(&mut self, peers: Vec<KnownPeer>) {
        let before = self.directory.snapshot();
        self.directory.replace(peers);
        if self.directory.snapshot() != before {
            self.touch();
        }
    }

    /// Announce the owner name to the bound relay.  Relay pings are broadcast
    /// across groups, so the pong never goes to the pinging relay itself.
    /// Unnamed or unbound devices stay silent.
    pub fn on_discovery_ping_from_relay(&mut self, transport: &mut dyn Transport) {
        if !self.is_named() {
            return;
        }
        let Some(relay) = self.connected_relay.clone() else {
            return;
        };
        let pong = Packet::Pong {
            from_name: self.owner_name.clone(),
        };
        if self.send(Destination::Unicast(relay), &pong, transport) {
            self.metrics.pongs_sent += 1;
        }
    }

    /// Queue a forwarded message for download.  The download delay starts
    /// with the first message to land in an idle queue.
    pub fn on_message_received(&mut self, message: Message) {
        self.incoming.push_back(message);
        self.metrics.received += 1;
        if !self.download.is_running() {
            self.download.start(self.config.download_latency);
        }
    }

    fn advance_download(&mut self, elapsed: Duration, now: Timestamp) -> Vec<u64> {
        if !self.download.is_running() {
            if !self.incoming.is_empty() {
                self.download.start(self.config.download_latency);
            }
            return Vec::new();
        }
        if !self.download.advance(elapsed) {
            return Vec::new();
        }
        self.drain_incoming(now)
    }

    /// Everything that arrived during one latency window lands in a single
    /// pass.
    fn drain_incoming(&mut self, now: Timestamp) -> Vec<u64> {
        let mut latencies = Vec::with_capacity(self.incoming.len());
        while let Some(message) = self.incoming.pop_front() {
            let latency = now.saturating_sub(message.sent_at);
            self.metrics.total_delivery_latency_ms =
                self.metrics.total_delivery_latency_ms.saturating_add(latency);
            self.metrics.max_delivery_latency_ms = Some(
                self.metrics
                    .max_delivery_latency_ms
                    .map_or(latency, |max| max.max(latency)),
            );
            fold_received(&mut self.conversations, &message, &self.link.address);
            latencies.push(latency);
        }
        if latencies.is_empty() {
            return latencies;
        }
        self.metrics.delivered += latencies.len();
        self.touch();
        self.log(format!(
            "handheld {}: downloaded {} message(s)",
            crate::logging::addr(&self.link.address),
            latencies.len()
        ));
        latencies
    }

    /// Send `body` to every listed address found in the peer directory, one
    /// packet per recipient, through the bound relay.  Unknown addresses are
    /// skipped.  Returns the number of packets sent.
    pub fn submit(
        &mut self,
        recipient_addresses: &[impl AsRef<str>],
        body: &str,
        now: Timestamp,
        transport: &mut dyn Transport,
    ) -> Result<usize, SubmitError> {
        if !self.is_named() {
            return Err(SubmitError::Unnamed);
        }
        let relay = self
            .connected_relay
            .clone()
            .ok_or(SubmitError::NotConnected)?;

        let mut recipients: Vec<KnownPeer> = Vec::new();
        for address in recipient_addresses {
            let Some(peer) = self.directory.get(address.as_ref()) else {
                continue;
            };
            if !recipients.iter().any(|known| known.address == peer.address) {
                recipients.push(peer.clone());
            }
        }
        if recipients.is_empty() {
            return Err(SubmitError::NoRecipients);
        }

        let mut payloads = Vec::with_capacity(recipients.len());
        for receiver in &recipients {
            let message = Message {
                recipients: recipients.clone(),
                receiver_name: receiver.name.clone(),
                receiver_address: receiver.address.clone(),
                body: body.to_string(),
                sent_at: now,
                sender_name: self.owner_name.clone(),
                sender_address: self.link.address.clone(),
            };
            payloads.push(Packet::Tx(message).encode()?);
        }
        let sent = payloads.len();
        for payload in payloads {
            transport.send_packet(
                &self.link.address,
                Destination::Unicast(relay.clone()),
                payload,
                self.link.frequency,
            );
        }
        self.metrics.sent += sent;
        Ok(sent)
    }

    fn send(&mut self, to: Destination, packet: &Packet, transport: &mut dyn Transport) -> bool {
        match packet.encode() {
            Ok(payload) => {
                transport.send_packet(&self.link.address, to, payload, self.link.frequency);
                true
            }
            Err(error) => {
                self.log(format!(
                    "handheld {}: {} not sent: {error}",
                    crate::logging::addr(&self.link.address),
                    packet.command()
                ));
                false
            }
        }
    }

    fn log(&self, message: String) {
        if let Some(log_sink) = &self.config.log_sink {
            log_sink(message);
        } else {
            crate::tlog!("{message}");
        }
    }
}
