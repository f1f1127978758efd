use std::time::Duration;

use pda_relay::protocol::{KnownPeer, Message, Packet};
use pda_relay::relay::{RelayConfig, RelayManager};
use pda_relay::transport::{
    Datagram, Delivery, Destination, DeviceLink, SimTransport, Transport, DEFAULT_FREQUENCY,
};

const GROUP: &str = "station";

fn quiet_config() -> RelayConfig {
    RelayConfig {
        log_sink: Some(std::sync::Arc::new(|_: String| {})),
        ..RelayConfig::default()
    }
}

fn setup(relays: &[&str]) -> (RelayManager, SimTransport) {
    let mut transport = SimTransport::with_history();
    let mut manager = RelayManager::new(quiet_config());
    for address in relays {
        let link = DeviceLink::new(*address);
        transport.register_device(link.clone(), Some(GROUP.to_string()), false);
        assert!(manager.add_relay(link));
    }
    for handheld in ["A1", "B1"] {
        transport.register_device(DeviceLink::new(handheld), Some(GROUP.to_string()), true);
    }
    (manager, transport)
}

fn datagram(from: &str, to: &str, packet: &Packet) -> Datagram {
    Datagram {
        from: from.to_string(),
        to: Destination::Unicast(to.to_string()),
        frequency: DEFAULT_FREQUENCY,
        payload: packet.encode().expect("encode"),
    }
}

fn message(body: &str, receiver: &str) -> Message {
    Message {
        recipients: vec![KnownPeer::new("Bob", receiver)],
        receiver_name: "Bob".to_string(),
        receiver_address: receiver.to_string(),
        body: body.to_string(),
        sent_at: 0,
        sender_name: "Alice".to_string(),
        sender_address: "A1".to_string(),
    }
}

fn forwarded_bodies(deliveries: &[Delivery]) -> Vec<String> {
    deliveries
        .iter()
        .filter_map(|delivery| match Packet::decode(&delivery.datagram.payload) {
            Ok(Packet::Tx(message)) => Some(message.body),
            _ => None,
        })
        .collect()
}

#[test]
fn failover_promotes_exactly_one_surviving_relay() {
    let (mut manager, mut transport) = setup(&["R1", "R2", "R3"]);
    let first = manager
        .resolve_active_address(GROUP, &mut transport)
        .expect("first election");
    assert_eq!(manager.active_relays(GROUP, &transport), vec![first.as_str()]);

    manager.on_power_changed(&first, false, &mut transport);
    assert!(manager.active_relays(GROUP, &transport).is_empty());

    let second = manager
        .resolve_active_address(GROUP, &mut transport)
        .expect("failover");
    assert_ne!(first, second);
    assert_eq!(manager.active_relays(GROUP, &transport), vec![second.as_str()]);
    assert_eq!(manager.metrics().promotions, 2);
    assert!(transport.is_device_connected(&second));
    assert!(!transport.is_device_connected(&first));
}

#[test]
fn promotion_announces_the_relay() {
    let (mut manager, mut transport) = setup(&["R1"]);
    manager.resolve_active_address(GROUP, &mut transport);
    let pings: Vec<&Datagram> = transport
        .history()
        .iter()
        .filter(|datagram| datagram.from == "R1" && datagram.to == Destination::Broadcast)
        .collect();
    assert_eq!(pings.len(), 1);
    assert_eq!(
        Packet::decode(&pings[0].payload).expect("decode"),
        Packet::Ping
    );
}

#[test]
fn no_available_relay_leaves_nothing_active() {
    let (mut manager, mut transport) = setup(&["R1", "R2"]);
    manager.resolve_active_address(GROUP, &mut transport);
    manager.on_power_changed("R1", false, &mut transport);
    manager.on_power_changed("R2", false, &mut transport);

    assert_eq!(manager.resolve_active_address(GROUP, &mut transport), None);
    assert!(manager.active_relays(GROUP, &transport).is_empty());
    assert!(manager.relays().iter().all(|relay| !relay.is_active()));
}

#[test]
fn repeated_pong_keeps_one_entry_with_latest_name() {
    let (mut manager, mut transport) = setup(&["R1"]);
    let pong = |name: &str| Packet::Pong {
        from_name: name.to_string(),
    };
    manager.handle_datagram("R1", &datagram("A1", "R1", &pong("Alice")), &mut transport);
    manager.handle_datagram("R1", &datagram("A1", "R1", &pong("Alice")), &mut transport);
    manager.handle_datagram("R1", &datagram("A1", "R1", &pong("Alicia")), &mut transport);

    let directory = manager.relay("R1").expect("relay").directory();
    assert_eq!(directory.len(), 1);
    assert_eq!(directory.name_of("A1"), Some("Alicia"));
}

#[test]
fn ping_is_answered_with_a_directory_snapshot() {
    let (mut manager, mut transport) = setup(&["R1"]);
    manager.resolve_active_address(GROUP, &mut transport);
    transport.take_deliveries();

    manager.on_discovery_reply("R1", "B1", "Bob");
    manager.handle_datagram("R1", &datagram("A1", "R1", &Packet::Ping), &mut transport);

    let deliveries = transport.take_deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].to, "A1");
    assert_eq!(
        Packet::decode(&deliveries[0].datagram.payload).expect("decode"),
        Packet::PeerSnapshot {
            peers: vec![KnownPeer::new("Bob", "B1")]
        }
    );
}

#[test]
fn queue_is_flushed_in_submission_order() {
    let (mut manager, mut transport) = setup(&["R1"]);
    manager.resolve_active_address(GROUP, &mut transport);
    transport.take_deliveries();

    for body in ["m1", "m2", "m3"] {
        let packet = Packet::Tx(message(body, "B1"));
        manager.handle_datagram("R1", &datagram("A1", "R1", &packet), &mut transport);
    }
    assert_eq!(manager.relay("R1").expect("relay").queue_len(), 3);

    assert!(manager.tick(Duration::from_secs(3), &mut transport));
    let deliveries = transport.take_deliveries();
    assert_eq!(forwarded_bodies(&deliveries), vec!["m1", "m2", "m3"]);
    for delivery in &deliveries {
        if let Ok(Packet::Tx(_)) = Packet::decode(&delivery.datagram.payload) {
            assert_eq!(delivery.to, "B1");
        }
    }
    assert_eq!(manager.relay("R1").expect("relay").queue_len(), 0);
    assert_eq!(manager.metrics().forwarded, 3);
}

#[test]
fn relay_stamps_sender_address_from_packet_source() {
    let (mut manager, mut transport) = setup(&["R1"]);
    manager.resolve_active_address(GROUP, &mut transport);
    let mut forged = message("hi", "B1");
    forged.sender_address = "Z9".to_string();
    manager.handle_datagram("R1", &datagram("A1", "R1", &Packet::Tx(forged)), &mut transport);

    let queued: Vec<&Message> = manager.relay("R1").expect("relay").queued().collect();
    assert_eq!(queued[0].sender_address, "A1");
}

#[test]
fn tick_fires_on_period_and_carries_the_remainder() {
    let (mut manager, mut transport) = setup(&["R1"]);
    assert!(!manager.tick(Duration::from_secs(2), &mut transport));
    assert!(manager.tick(Duration::from_secs(2), &mut transport));
    assert!(manager.tick(Duration::from_secs(2), &mut transport));
    assert!(!manager.tick(Duration::from_secs(2), &mut transport));
}

#[test]
fn power_loss_discards_queue_and_directory() {
    let (mut manager, mut transport) = setup(&["R1", "R2"]);
    let active = manager
        .resolve_active_address(GROUP, &mut transport)
        .expect("active");
    manager.on_discovery_reply(&active, "A1", "Alice");
    manager.on_submit(&active, message("doomed", "B1"));

    manager.on_power_changed(&active, false, &mut transport);
    let relay = manager.relay(&active).expect("relay");
    assert_eq!(relay.queue_len(), 0);
    assert!(relay.directory().is_empty());
    assert!(!relay.is_active());
    assert_eq!(manager.metrics().lost_in_flight, 1);
    assert_eq!(manager.metrics().disconnects, 1);
}

#[test]
fn unavailable_relay_is_swept_on_tick() {
    let (mut manager, mut transport) = setup(&["R1"]);
    manager.resolve_active_address(GROUP, &mut transport);
    manager.on_submit("R1", message("held", "B1"));

    manager.on_power_changed("R1", false, &mut transport);
    assert!(manager.tick(Duration::from_secs(3), &mut transport));
    assert!(forwarded_bodies(&transport.take_deliveries()).is_empty());
    assert_eq!(manager.metrics().forwarded, 0);
}

#[test]
fn absent_receiver_makes_message_undeliverable() {
    let (mut manager, mut transport) = setup(&["R1"]);
    manager.resolve_active_address(GROUP, &mut transport);
    manager.on_submit("R1", message("nobody home", "Q7"));
    manager.on_submit("R1", message("hi", "B1"));

    assert!(manager.tick(Duration::from_secs(3), &mut transport));
    assert_eq!(manager.metrics().undeliverable, 1);
    assert_eq!(forwarded_bodies(&transport.take_deliveries()), vec!["hi"]);
}

#[test]
fn garbage_payload_is_dropped_and_counted() {
    let (mut manager, mut transport) = setup(&["R1"]);
    let garbage = Datagram {
        from: "A1".to_string(),
        to: Destination::Unicast("R1".to_string()),
        frequency: DEFAULT_FREQUENCY,
        payload: b"{\"command\":\"tx\"}".to_vec(),
    };
    manager.handle_datagram("R1", &garbage, &mut transport);
    assert_eq!(manager.metrics().dropped_packets, 1);
    assert_eq!(manager.relay("R1").expect("relay").queue_len(), 0);
}

#[test]
fn removed_relay_leaves_the_election() {
    let (mut manager, mut transport) = setup(&["R1", "R2"]);
    let active = manager
        .resolve_active_address(GROUP, &mut transport)
        .expect("active");
    let removed = manager
        .remove_relay(&active, &mut transport)
        .expect("removed");
    assert!(removed.directory().is_empty());
    assert!(!manager.contains(&active));

    let next = manager
        .resolve_active_address(GROUP, &mut transport)
        .expect("next");
    assert_ne!(next, active);
}

#[test]
fn relay_changing_group_is_demoted_before_rejoining() {
    let (mut manager, mut transport) = setup(&["R1", "R2"]);
    let moved = manager
        .resolve_active_address(GROUP, &mut transport)
        .expect("active");
    manager.on_submit(&moved, message("in flight", "B1"));

    transport.set_group(&moved, Some("annex".to_string()));
    manager.on_group_changed(&moved, &mut transport);
    let relay = manager.relay(&moved).expect("relay");
    assert!(!relay.is_active());
    assert_eq!(relay.queue_len(), 0);
    assert!(!transport.is_device_connected(&moved));
    assert_eq!(manager.metrics().lost_in_flight, 1);

    let station = manager
        .resolve_active_address(GROUP, &mut transport)
        .expect("station relay");
    assert_ne!(station, moved);
    assert_eq!(
        manager.resolve_active_address("annex", &mut transport),
        Some(moved.clone())
    );
    assert_eq!(manager.active_relays(GROUP, &transport), vec![station.as_str()]);
    assert_eq!(manager.active_relays("annex", &transport), vec![moved.as_str()]);
}
