//! The per-user registry of logged-in peers.

use crate::network::messages::PeerAddress;
use serde::{Deserialize, Serialize};

/// One logged-in peer of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationEntry {
    pub peer: PeerAddress,
    pub since_ms: u64,
    pub initial: bool,
}

/// The DHT-stored set of a user's currently-logged-in peers. At most one
/// entry is marked initial; when the initial peer leaves, the role moves to
/// the oldest remaining entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Locations {
    user_id: String,
    entries: Vec<LocationEntry>,
}

impl Locations {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn entries(&self) -> &[LocationEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, peer: &PeerAddress) -> bool {
        self.entries.iter().any(|e| &e.peer == peer)
    }

    /// Register a peer. The first registered peer becomes initial.
    pub fn add_peer(&mut self, peer: PeerAddress, since_ms: u64) {
        if self.contains(&peer) {
            return;
        }
        let initial = self.entries.is_empty();
        self.entries.push(LocationEntry {
            peer,
            since_ms,
            initial,
        });
    }

    /// Deregister a peer, transferring the initial role if needed.
    pub fn remove_peer(&mut self, peer: &PeerAddress) {
        self.entries.retain(|e| &e.peer != peer);
        self.ensure_initial();
    }

    /// Drop every peer in `denied` (unfriendly-logout cleanup).
    pub fn prune(&mut self, denied: &[PeerAddress]) {
        self.entries.retain(|e| !denied.contains(&e.peer));
        self.ensure_initial();
    }

    pub fn initial_peer(&self) -> Option<&LocationEntry> {
        self.entries.iter().find(|e| e.initial)
    }

    /// All peers, initial first, the rest by registration time.
    pub fn ordered_peers(&self) -> Vec<PeerAddress> {
        let mut peers: Vec<&LocationEntry> = self.entries.iter().collect();
        peers.sort_by_key(|e| (!e.initial, e.since_ms));
        peers.into_iter().map(|e| e.peer.clone()).collect()
    }

    fn ensure_initial(&mut self) {
        if self.entries.iter().any(|e| e.initial) {
            return;
        }
        if let Some(oldest) = self
            .entries
            .iter_mut()
            .min_by_key(|e| e.since_ms)
        {
            oldest.initial = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerAddress {
        PeerAddress::new(name)
    }

    #[test]
    fn test_first_peer_becomes_initial() {
        let mut locations = Locations::new("alice");
        locations.add_peer(peer("p0"), 10);
        locations.add_peer(peer("p1"), 20);

        assert_eq!(locations.initial_peer().unwrap().peer, peer("p0"));
        assert_eq!(locations.entries().len(), 2);
    }

    #[test]
    fn test_initial_role_transfers_on_removal() {
        let mut locations = Locations::new("alice");
        locations.add_peer(peer("p0"), 10);
        locations.add_peer(peer("p1"), 20);
        locations.add_peer(peer("p2"), 30);

        locations.remove_peer(&peer("p0"));

        let initial: Vec<_> = locations.entries().iter().filter(|e| e.initial).collect();
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].peer, peer("p1"));
    }

    #[test]
    fn test_ordered_peers_put_initial_first() {
        let mut locations = Locations::new("alice");
        locations.add_peer(peer("p0"), 10);
        locations.add_peer(peer("p1"), 20);
        locations.remove_peer(&peer("p0"));
        locations.add_peer(peer("p2"), 30);

        assert_eq!(
            locations.ordered_peers(),
            vec![peer("p1"), peer("p2")]
        );
    }

    #[test]
    fn test_prune_keeps_an_initial_peer() {
        let mut locations = Locations::new("alice");
        locations.add_peer(peer("p0"), 10);
        locations.add_peer(peer("p1"), 20);

        locations.prune(&[peer("p0")]);

        assert_eq!(locations.entries().len(), 1);
        assert!(locations.entries()[0].initial);
    }

    #[test]
    fn test_duplicate_add_is_ignored() {
        let mut locations = Locations::new("alice");
        locations.add_peer(peer("p0"), 10);
        locations.add_peer(peer("p0"), 99);
        assert_eq!(locations.entries().len(), 1);
        assert_eq!(locations.entries()[0].since_ms, 10);
    }
}
