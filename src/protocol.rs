//! Relay protocol message types.
//!
//! ## Wire summary
//! - Every packet is a JSON object carrying a `version` and a `command`
//!   discriminator plus the command's fields; the transport treats it as an
//!   opaque byte payload.
//! - `ping` carries nothing, `pong` carries the announcing handheld's name,
//!   `peer_snapshot` carries a relay's full directory, `tx` carries a
//!   [`Message`].
//! - Decoding distinguishes unknown commands from known commands with missing
//!   or mistyped fields so receivers can drop both without failing a tick.
//!
//! Conversation identity is content-addressed: [`ConversationId`] is the
//! URL-safe base64 SHA-256 of the canonical recipient address set.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Simulated milliseconds since the simulation started.
pub type Timestamp = u64;

/// A discovered counterpart; unique by `address`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KnownPeer {
    pub name: String,
    pub address: String,
}

impl KnownPeer {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// A point-to-point hop of a (possibly group) message.
///
/// `recipients` is the full addressee list; `receiver_*` names the handheld
/// this copy is forwarded to.  `sender_address` is stamped by the relay from
/// the packet source, so it may be absent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub recipients: Vec<KnownPeer>,
    pub receiver_name: String,
    pub receiver_address: String,
    pub body: String,
    pub sent_at: Timestamp,
    pub sender_name: String,
    #[serde(default)]
    pub sender_address: String,
}

impl Message {
    pub fn meta(&self) -> MessageMeta {
        MessageMeta {
            body: self.body.clone(),
            sent_at: self.sent_at,
            sender_name: self.sender_name.clone(),
        }
    }

    pub fn sender(&self) -> KnownPeer {
        KnownPeer::new(self.sender_name.clone(), self.sender_address.clone())
    }

    /// Everyone taking part in the exchange except `own_address`: the
    /// recipients plus the sender.
    pub fn counterparts(&self, own_address: &str) -> Vec<KnownPeer> {
        let mut peers: Vec<KnownPeer> = Vec::with_capacity(self.recipients.len() + 1);
        for peer in self.recipients.iter().cloned().chain([self.sender()]) {
            if peer.address == own_address || peer.address.is_empty() {
                continue;
            }
            if peers.iter().any(|known| known.address == peer.address) {
                continue;
            }
            peers.push(peer);
        }
        peers
    }
}

/// Display-relevant part of a delivered [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMeta {
    pub body: String,
    pub sent_at: Timestamp,
    pub sender_name: String,
}

/// Supported protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolVersion {
    V1,
}

impl ProtocolVersion {
    pub const CURRENT: ProtocolVersion = ProtocolVersion::V1;

    fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "v1",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "v1" => Some(ProtocolVersion::V1),
            _ => None,
        }
    }
}

pub const CMD_PING: &str = "ping";
pub const CMD_PONG: &str = "pong";
pub const CMD_PEER_SNAPSHOT: &str = "peer_snapshot";
pub const CMD_TX: &str = "tx";

const KNOWN_COMMANDS: [&str; 4] = [CMD_PING, CMD_PONG, CMD_PEER_SNAPSHOT, CMD_TX];

/// Typed wire commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Packet {
    Ping,
    Pong { from_name: String },
    PeerSnapshot { peers: Vec<KnownPeer> },
    Tx(Message),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    NotJson(String),
    UnsupportedVersion(String),
    MissingCommand,
    UnknownCommand(String),
    Malformed { command: String, reason: String },
    Encode(String),
}

impl std::fmt::Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketError::NotJson(reason) => write!(f, "payload is not a json object: {reason}"),
            PacketError::UnsupportedVersion(version) => {
                write!(f, "unsupported protocol version {version}")
            }
            PacketError::MissingCommand => write!(f, "payload has no command"),
            PacketError::UnknownCommand(command) => write!(f, "unknown command {command}"),
            PacketError::Malformed { command, reason } => {
                write!(f, "malformed {command} packet: {reason}")
            }
            PacketError::Encode(reason) => write!(f, "failed to encode packet: {reason}"),
        }
    }
}

impl std::error::Error for PacketError {}

impl Packet {
    pub fn command(&self) -> &'static str {
        match self {
            Packet::Ping => CMD_PING,
            Packet::Pong { .. } => CMD_PONG,
            Packet::PeerSnapshot { .. } => CMD_PEER_SNAPSHOT,
            Packet::Tx(_) => CMD_TX,
        }
    }

    /// Serialize into the versioned wire form.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let mut value =
            serde_json::to_value(self).map_err(|e| PacketError::Encode(e.to_string()))?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| PacketError::Encode("packet is not an object".to_string()))?;
        object.insert(
            "version".to_string(),
            Value::String(ProtocolVersion::CURRENT.as_str().to_string()),
        );
        serde_json::to_vec(&value).map_err(|e| PacketError::Encode(e.to_string()))
    }

    /// Parse a wire payload.  A missing `version` is read as the current one.
    pub fn decode(bytes: &[u8]) -> Result<Packet, PacketError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| PacketError::NotJson(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| PacketError::NotJson("expected an object".to_string()))?;

        if let Some(version) = object.get("version") {
            let raw = version.as_str().unwrap_or_default();
            if ProtocolVersion::parse(raw).is_none() {
                return Err(PacketError::UnsupportedVersion(version.to_string()));
            }
        }

        let command = object
            .get("command")
            .and_then(Value::as_str)
            .ok_or(PacketError::MissingCommand)?;
        if !KNOWN_COMMANDS.contains(&command) {
            return Err(PacketError::UnknownCommand(command.to_string()));
        }
        let command = command.to_string();

        serde_json::from_value(value).map_err(|e| PacketError::Malformed {
            command,
            reason: e.to_string(),
        })
    }
}

/// Content-addressed conversation key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        ConversationId(URL_SAFE_NO_PAD.encode(digest))
    }

    /// Derive the id for a recipient set.  Order and duplicates do not matter.
    pub fn for_recipients(recipients: &[KnownPeer]) -> Self {
        Self::from_bytes(canonical_recipient_key(recipients).as_bytes())
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sorted, de-duplicated recipient addresses joined with `\n`.
pub fn canonical_recipient_key(recipients: &[KnownPeer]) -> String {
    let mut addresses: Vec<&str> = recipients.iter().map(|p| p.address.as_str()).collect();
    addresses.sort_unstable();
    addresses.dedup();
    addresses.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        Message {
            recipients: vec![KnownPeer::new("Bob", "B1"), KnownPeer::new("Cara", "C1")],
            receiver_name: "Bob".to_string(),
            receiver_address: "B1".to_string(),
            body: "hi".to_string(),
            sent_at: 1_500,
            sender_name: "Alice".to_string(),
            sender_address: "A1".to_string(),
        }
    }

    #[test]
    fn encoded_packets_carry_version_and_command() {
        let bytes = Packet::Pong {
            from_name: "Alice".to_string(),
        }
        .encode()
        .expect("encode pong");
        let value: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["version"], "v1");
        assert_eq!(value["command"], "pong");
        assert_eq!(value["from_name"], "Alice");
    }

    #[test]
    fn tx_without_sender_address_decodes() {
        let raw = br#"{"command":"tx","recipients":[{"name":"Bob","address":"B1"}],
            "receiver_name":"Bob","receiver_address":"B1","body":"hi","sent_at":5,
            "sender_name":"Alice"}"#;
        match Packet::decode(raw).expect("decode tx") {
            Packet::Tx(message) => {
                assert_eq!(message.sender_address, "");
                assert_eq!(message.body, "hi");
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn decode_separates_unknown_from_malformed() {
        assert_eq!(
            Packet::decode(br#"{"command":"reboot"}"#),
            Err(PacketError::UnknownCommand("reboot".to_string()))
        );
        assert!(matches!(
            Packet::decode(br#"{"command":"pong"}"#),
            Err(PacketError::Malformed { .. })
        ));
        assert_eq!(
            Packet::decode(br#"{"from_name":"x"}"#),
            Err(PacketError::MissingCommand)
        );
        assert!(matches!(
            Packet::decode(b"not json"),
            Err(PacketError::NotJson(_))
        ));
        assert!(matches!(
            Packet::decode(br#"{"version":"v9","command":"ping"}"#),
            Err(PacketError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn counterparts_exclude_self_and_include_sender() {
        let message = sample_message();
        let seen_by_bob = message.counterparts("B1");
        assert_eq!(
            seen_by_bob,
            vec![KnownPeer::new("Cara", "C1"), KnownPeer::new("Alice", "A1")]
        );
    }

    #[test]
    fn conversation_id_ignores_order_and_names() {
        let a = ConversationId::for_recipients(&[
            KnownPeer::new("Bob", "B1"),
            KnownPeer::new("Cara", "C1"),
        ]);
        let b = ConversationId::for_recipients(&[
            KnownPeer::new("Cara Renamed", "C1"),
            KnownPeer::new("Bob", "B1"),
        ]);
        let c = ConversationId::for_recipients(&[KnownPeer::new("Bob", "B1")]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
