//! Address → display name mapping built from discovery replies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::protocol::KnownPeer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryChange {
    Inserted,
    Renamed,
    Unchanged,
}

/// Known peers keyed by address.  Snapshots come out address-ordered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    peers: BTreeMap<String, KnownPeer>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `address`, or rename it if already known (latest name wins).
    pub fn upsert(&mut self, address: &str, name: &str) -> DirectoryChange {
        match self.peers.get_mut(address) {
            Some(peer) if peer.name == name => DirectoryChange::Unchanged,
            Some(peer) => {
                peer.name = name.to_string();
                DirectoryChange::Renamed
            }
            None => {
                self.peers
                    .insert(address.to_string(), KnownPeer::new(name, address));
                DirectoryChange::Inserted
            }
        }
    }

    /// Replace the whole directory with a relay-supplied snapshot.  Duplicate
    /// addresses in the snapshot collapse to the last entry.
    pub fn replace(&mut self, peers: Vec<KnownPeer>) {
        self.peers = peers
            .into_iter()
            .map(|peer| (peer.address.clone(), peer))
            .collect();
    }

    pub fn snapshot(&self) -> Vec<KnownPeer> {
        self.peers.values().cloned().collect()
    }

    pub fn get(&self, address: &str) -> Option<&KnownPeer> {
        self.peers.get(address)
    }

    pub fn name_of(&self, address: &str) -> Option<&str> {
        self.peers.get(address).map(|peer| peer.name.as_str())
    }

    pub fn contains(&self, address: &str) -> bool {
        self.peers.contains_key(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KnownPeer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_upsert_keeps_one_entry_with_latest_name() {
        let mut directory = Directory::new();
        assert_eq!(directory.upsert("B1", "Bob"), DirectoryChange::Inserted);
        assert_eq!(directory.upsert("B1", "Bob"), DirectoryChange::Unchanged);
        assert_eq!(directory.len(), 1);

        assert_eq!(directory.upsert("B1", "Robert"), DirectoryChange::Renamed);
        assert_eq!(directory.len(), 1);
        assert_eq!(directory.name_of("B1"), Some("Robert"));
    }

    #[test]
    fn replace_discards_previous_entries() {
        let mut directory = Directory::new();
        directory.upsert("A1", "Alice");
        directory.replace(vec![
            KnownPeer::new("Cara", "C1"),
            KnownPeer::new("Bob", "B1"),
            KnownPeer::new("Bobby", "B1"),
        ]);

        assert!(!directory.contains("A1"));
        assert_eq!(
            directory.snapshot(),
            vec![KnownPeer::new("Bobby", "B1"), KnownPeer::new("Cara", "C1")]
        );
    }
}
