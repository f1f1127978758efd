use std::sync::Arc;
use std::time::Duration;

use pda_relay::handheld::{DeviceProfile, HandheldConfig, HandheldSession, SubmitError};
use pda_relay::protocol::{KnownPeer, Message, Packet};
use pda_relay::relay::GroupResolver;
use pda_relay::transport::{
    Datagram, Delivery, Destination, DeviceLink, SimTransport, Transport,
};

const GROUP: &str = "station";
const TICK: Duration = Duration::from_millis(100);

/// Resolver that answers from a fixed script.
struct ScriptedResolver {
    answer: Option<String>,
    calls: usize,
}

impl ScriptedResolver {
    fn new(answer: Option<&str>) -> Self {
        Self {
            answer: answer.map(str::to_string),
            calls: 0,
        }
    }
}

impl GroupResolver for ScriptedResolver {
    fn resolve_active_address(
        &mut self,
        _group: &str,
        _transport: &mut dyn Transport,
    ) -> Option<String> {
        self.calls += 1;
        self.answer.clone()
    }
}

fn config() -> HandheldConfig {
    HandheldConfig {
        log_sink: Some(Arc::new(|_: String| {})),
        ..HandheldConfig::default()
    }
}

fn transport() -> SimTransport {
    let mut transport = SimTransport::with_history();
    transport.register_device(DeviceLink::new("A1"), Some(GROUP.to_string()), true);
    transport.register_device(DeviceLink::new("R1"), Some(GROUP.to_string()), true);
    transport.register_device(DeviceLink::new("R2"), Some(GROUP.to_string()), true);
    transport
}

fn alice() -> HandheldSession {
    HandheldSession::new(DeviceLink::new("A1"), Some("Alice"), config())
}

fn from_alice(body: &str, sent_at: u64) -> Message {
    Message {
        recipients: vec![KnownPeer::new("Bob", "B1")],
        receiver_name: "Bob".to_string(),
        receiver_address: "B1".to_string(),
        body: body.to_string(),
        sent_at,
        sender_name: "Alice".to_string(),
        sender_address: "A1".to_string(),
    }
}

fn pings_to(transport: &SimTransport, address: &str) -> usize {
    transport
        .history()
        .iter()
        .filter(|datagram| datagram.to == Destination::Unicast(address.to_string()))
        .filter(|datagram| matches!(Packet::decode(&datagram.payload), Ok(Packet::Ping)))
        .count()
}

#[test]
fn first_tick_binds_and_pings_the_active_relay() {
    let mut transport = transport();
    let mut resolver = ScriptedResolver::new(Some("R1"));
    let mut session = alice();

    session.tick(TICK, 100, &mut resolver, &mut transport);
    assert_eq!(session.connected_relay(), Some("R1"));
    assert_eq!(session.group(), Some(GROUP));
    assert_eq!(pings_to(&transport, "R1"), 1);

    session.tick(TICK, 200, &mut resolver, &mut transport);
    assert_eq!(pings_to(&transport, "R1"), 1);
    assert_eq!(resolver.calls, 1);
}

#[test]
fn handheld_without_group_does_not_poll() {
    let mut transport = transport();
    transport.set_group("A1", None);
    let mut resolver = ScriptedResolver::new(Some("R1"));
    let mut session = alice();

    session.tick(Duration::from_secs(2), 0, &mut resolver, &mut transport);
    assert_eq!(resolver.calls, 0);
    assert_eq!(session.connected_relay(), None);
}

#[test]
fn unresolvable_group_skips_the_tick() {
    let mut transport = transport();
    let mut resolver = ScriptedResolver::new(None);
    let mut session = alice();

    session.tick(TICK, 0, &mut resolver, &mut transport);
    assert_eq!(session.connected_relay(), None);
    assert!(transport.history().is_empty());
}

#[test]
fn stale_binding_is_cleared_and_re_resolved() {
    let mut transport = transport();
    let mut resolver = ScriptedResolver::new(Some("R1"));
    let mut session = alice();
    session.tick(TICK, 0, &mut resolver, &mut transport);
    assert_eq!(session.connected_relay(), Some("R1"));

    transport.disconnect_device("R1", true);
    resolver.answer = Some("R2".to_string());
    transport.clear_history();

    session.tick(Duration::from_secs(2), 2_000, &mut resolver, &mut transport);
    assert_eq!(session.metrics().stale_bindings, 1);
    assert_eq!(session.connected_relay(), Some("R2"));
    assert_eq!(pings_to(&transport, "R1"), 0);
    assert_eq!(pings_to(&transport, "R2"), 1);
}

#[test]
fn stale_binding_without_replacement_stays_unbound() {
    let mut transport = transport();
    let mut resolver = ScriptedResolver::new(Some("R1"));
    let mut session = alice();
    session.tick(TICK, 0, &mut resolver, &mut transport);

    transport.disconnect_device("R1", false);
    resolver.answer = Some("R1".to_string());
    transport.clear_history();

    session.tick(Duration::from_secs(2), 2_000, &mut resolver, &mut transport);
    assert_eq!(session.connected_relay(), None);
    assert!(transport.history().is_empty());
}

#[test]
fn moving_to_another_group_drops_the_binding() {
    let mut transport = transport();
    let mut resolver = ScriptedResolver::new(Some("R1"));
    let mut session = alice();
    session.tick(TICK, 0, &mut resolver, &mut transport);

    transport.set_group("A1", Some("station-2".to_string()));
    resolver.answer = Some("R2".to_string());
    session.tick(Duration::from_secs(2), 2_000, &mut resolver, &mut transport);
    assert_eq!(session.group(), Some("station-2"));
    assert_eq!(session.connected_relay(), Some("R2"));
    assert_eq!(session.metrics().stale_bindings, 0);
}

#[test]
fn message_is_invisible_until_download_latency_passes() {
    let mut transport = transport();
    let mut resolver = ScriptedResolver::new(None);
    let mut session = alice();

    session.on_message_received(from_alice("hi", 0));
    assert!(session.tick(TICK, 100, &mut resolver, &mut transport).is_empty());
    assert!(session.tick(TICK, 200, &mut resolver, &mut transport).is_empty());
    assert!(session.conversations().is_empty());
    assert_eq!(session.incoming_len(), 1);

    let latencies = session.tick(TICK, 300, &mut resolver, &mut transport);
    assert_eq!(latencies, vec![300]);
    assert_eq!(session.conversations().len(), 1);
    assert_eq!(session.incoming_len(), 0);
    assert_eq!(session.metrics().max_delivery_latency_ms, Some(300));
    assert_eq!(session.metrics().average_delivery_latency_ms(), Some(300.0));
}

#[test]
fn messages_arriving_in_one_window_land_together() {
    let mut transport = transport();
    let mut resolver = ScriptedResolver::new(None);
    let mut session = alice();

    session.on_message_received(from_alice("one", 0));
    session.tick(TICK, 100, &mut resolver, &mut transport);
    session.on_message_received(from_alice("two", 100));
    assert_eq!(session.download_remaining(), Some(Duration::from_millis(200)));

    let latencies = session.tick(Duration::from_millis(200), 300, &mut resolver, &mut transport);
    assert_eq!(latencies, vec![300, 200]);
    assert_eq!(session.metrics().delivered, 2);
    assert_eq!(session.metrics().total_delivery_latency_ms, 500);
    assert_eq!(session.conversations()[0].len(), 2);
    assert_eq!(session.download_remaining(), None);
}

fn pongs(deliveries: &[Delivery]) -> Vec<(&str, Packet)> {
    deliveries
        .iter()
        .filter_map(|delivery| match Packet::decode(&delivery.datagram.payload) {
            Ok(packet @ Packet::Pong { .. }) => Some((delivery.to.as_str(), packet)),
            _ => None,
        })
        .collect()
}

#[test]
fn named_handheld_answers_any_relay_ping_to_its_bound_relay() {
    let mut transport = transport();
    let mut resolver = ScriptedResolver::new(Some("R1"));
    let mut session = alice();
    session.tick(TICK, 0, &mut resolver, &mut transport);
    transport.take_deliveries();

    let ping = Datagram {
        from: "R2".to_string(),
        to: Destination::Broadcast,
        frequency: session.link().frequency,
        payload: Packet::Ping.encode().expect("encode"),
    };
    session.handle_datagram(&ping, &mut transport);

    let deliveries = transport.take_deliveries();
    assert_eq!(
        pongs(&deliveries),
        vec![(
            "R1",
            Packet::Pong {
                from_name: "Alice".to_string()
            }
        )]
    );
    assert_eq!(session.metrics().pongs_sent, 1);
}

#[test]
fn unbound_handheld_does_not_announce_itself() {
    let mut transport = transport();
    let mut session = alice();
    session.on_discovery_ping_from_relay(&mut transport);
    assert!(transport.history().is_empty());
    assert_eq!(session.metrics().pongs_sent, 0);
}

#[test]
fn placeholder_named_handheld_stays_silent() {
    let mut transport = transport();
    let mut resolver = ScriptedResolver::new(Some("R1"));
    let mut session = HandheldSession::new(DeviceLink::new("A1"), None, config());
    assert_eq!(session.owner_name(), "Unknown");
    session.tick(TICK, 0, &mut resolver, &mut transport);
    transport.take_deliveries();

    session.on_discovery_ping_from_relay(&mut transport);
    assert!(pongs(&transport.take_deliveries()).is_empty());

    session.set_owner("Alice");
    session.on_discovery_ping_from_relay(&mut transport);
    assert_eq!(pongs(&transport.take_deliveries()).len(), 1);
}

#[test]
fn discovery_reply_replaces_the_directory() {
    let mut session = alice();
    session.on_discovery_reply(vec![KnownPeer::new("Bob", "B1"), KnownPeer::new("Cara", "C1")]);
    session.on_discovery_reply(vec![KnownPeer::new("Dan", "D1")]);
    assert_eq!(session.directory().snapshot(), vec![KnownPeer::new("Dan", "D1")]);
}

#[test]
fn submit_requires_name_binding_and_known_recipient() {
    let mut transport = transport();
    let mut resolver = ScriptedResolver::new(Some("R1"));

    let mut unnamed = HandheldSession::new(DeviceLink::new("A1"), None, config());
    assert!(matches!(
        unnamed.submit(&["B1"], "hi", 0, &mut transport),
        Err(SubmitError::Unnamed)
    ));

    let mut session = alice();
    assert!(matches!(
        session.submit(&["B1"], "hi", 0, &mut transport),
        Err(SubmitError::NotConnected)
    ));

    session.tick(TICK, 0, &mut resolver, &mut transport);
    assert!(matches!(
        session.submit(&["B1"], "hi", 0, &mut transport),
        Err(SubmitError::NoRecipients)
    ));
}

#[test]
fn submit_sends_one_tx_per_recipient_without_local_echo() {
    let mut transport = transport();
    let mut resolver = ScriptedResolver::new(Some("R1"));
    let mut session = alice();
    session.tick(TICK, 0, &mut resolver, &mut transport);
    session.on_discovery_reply(vec![KnownPeer::new("Bob", "B1"), KnownPeer::new("Cara", "C1")]);
    transport.clear_history();

    let sent = session
        .submit(&["B1", "C1", "Z9", "B1"], "lunch?", 1_234, &mut transport)
        .expect("submit");
    assert_eq!(sent, 2);
    assert!(session.conversations().is_empty());

    let receivers: Vec<String> = transport
        .history()
        .iter()
        .map(|datagram| {
            assert_eq!(datagram.to, Destination::Unicast("R1".to_string()));
            match Packet::decode(&datagram.payload).expect("decode") {
                Packet::Tx(message) => {
                    assert_eq!(message.recipients.len(), 2);
                    assert_eq!(message.sent_at, 1_234);
                    assert_eq!(message.sender_name, "Alice");
                    message.receiver_address
                }
                other => panic!("unexpected packet {other:?}"),
            }
        })
        .collect();
    assert_eq!(receivers, vec!["B1", "C1"]);
}

#[test]
fn refresh_pings_bound_relay_only() {
    let mut transport = transport();
    let mut resolver = ScriptedResolver::new(Some("R1"));
    let mut session = alice();
    assert!(!session.refresh(&mut transport));

    session.tick(TICK, 0, &mut resolver, &mut transport);
    assert!(session.refresh(&mut transport));
    assert_eq!(pings_to(&transport, "R1"), 2);
}

#[test]
fn display_state_tracks_core_changes() {
    let mut transport = transport();
    let mut resolver = ScriptedResolver::new(Some("R1"));
    let mut session = alice();
    session.set_profile(DeviceProfile {
        flashlight_enabled: true,
        job_title: Some("Engineer".to_string()),
        station_name: Some("Outpost".to_string()),
        ..DeviceProfile::default()
    });

    let before = session.display_revision();
    session.tick(TICK, 0, &mut resolver, &mut transport);
    let bound = session.display_revision();
    assert!(bound > before);

    session.on_discovery_reply(vec![KnownPeer::new("Bob", "B1")]);
    let discovered = session.display_revision();
    assert!(discovered > bound);
    session.on_discovery_reply(vec![KnownPeer::new("Bob", "B1")]);
    assert_eq!(session.display_revision(), discovered);

    let state = session.display_state();
    assert!(state.flashlight_enabled);
    assert_eq!(state.address, "A1");
    assert_eq!(state.owner_info.actual_owner_name.as_deref(), Some("Alice"));
    assert_eq!(state.owner_info.job_title.as_deref(), Some("Engineer"));
    assert_eq!(state.station_name.as_deref(), Some("Outpost"));
    assert_eq!(state.known_peers, vec![KnownPeer::new("Bob", "B1")]);
}

#[test]
fn undecodable_packet_is_dropped() {
    let mut transport = transport();
    let mut session = alice();
    let garbage = Datagram {
        from: "R1".to_string(),
        to: Destination::Unicast("A1".to_string()),
        frequency: session.link().frequency,
        payload: b"\x00\x01".to_vec(),
    };
    session.handle_datagram(&garbage, &mut transport);
    assert_eq!(session.metrics().dropped_packets, 1);
    assert_eq!(session.incoming_len(), 0);
}
