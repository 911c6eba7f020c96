use std::collections::HashMap;
use std::net::SocketAddr;

/// A known remote participant.
///
/// `mindiff`/`maxdiff` bracket the estimated clock offset of this peer
/// relative to the local clock (milliseconds), used only for tempo gossip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub name: String,
    /// Newest address first (index 0 is the primary / most recent rendezvous
    /// address).
    pub addrs: Vec<SocketAddr>,
    pub mindiff: i64,
    pub maxdiff: i64,
}

impl Peer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addrs: Vec::new(),
            mindiff: i64::MIN,
            maxdiff: i64::MAX,
        }
    }

    /// Approximate local-to-peer offset for a remote timestamp:
    /// `t_peer - (mindiff + maxdiff) / 2`.
    pub fn to_local_time(&self, t_peer: i64) -> i64 {
        t_peer - (self.mindiff + self.maxdiff) / 2
    }

    /// Update the clock-offset bracket from a peer-to-peer pong.
    pub fn receive_pong(&mut self, ping_time: i64, pong_time: i64, now: i64) {
        self.mindiff = self.mindiff.max(pong_time - now);
        self.maxdiff = self.maxdiff.min(pong_time - ping_time);
    }
}

/// Bidirectional mapping between peer names and socket addresses.
///
/// One name may own several addresses (e.g. a peer reachable from more than
/// one local network interface); one address resolves to at most one name.
#[derive(Debug, Clone, Default)]
pub struct PeerIndex {
    by_name: HashMap<String, Peer>,
    by_addr: HashMap<SocketAddr, String>,
}

impl PeerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `addr` with `name`.
    ///
    /// No-op if `addr` already maps to `name`. If `addr` belonged to a
    /// different peer, it is removed from that peer's address list first.
    pub fn set_assoc(&mut self, name: &str, addr: SocketAddr) {
        if self.by_addr.get(&addr).map(String::as_str) == Some(name) {
            return;
        }

        if let Some(prev_owner) = self.by_addr.remove(&addr) {
            if let Some(prev_peer) = self.by_name.get_mut(&prev_owner) {
                prev_peer.addrs.retain(|a| *a != addr);
            }
        }

        let peer = self
            .by_name
            .entry(name.to_string())
            .or_insert_with(|| Peer::new(name));
        peer.addrs.retain(|a| *a != addr);
        peer.addrs.insert(0, addr);
        self.by_addr.insert(addr, name.to_string());
    }

    /// The peer's primary (most recently associated) address, if it has any.
    pub fn get_addr(&self, name: &str) -> Option<SocketAddr> {
        self.by_name.get(name).and_then(|p| p.addrs.first().copied())
    }

    pub fn name_for(&self, addr: SocketAddr) -> Option<&str> {
        self.by_addr.get(&addr).map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&Peer> {
        self.by_name.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Peer> {
        self.by_name.get_mut(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn remove(&mut self, name: &str) {
        if let Some(peer) = self.by_name.remove(name) {
            for addr in peer.addrs {
                self.by_addr.remove(&addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn set_assoc_is_idempotent() {
        let mut idx = PeerIndex::new();
        idx.set_assoc("alice", addr(9000));
        idx.set_assoc("alice", addr(9000));
        assert_eq!(idx.get("alice").unwrap().addrs, vec![addr(9000)]);
    }

    #[test]
    fn set_assoc_reassigns_address_between_peers() {
        let mut idx = PeerIndex::new();
        idx.set_assoc("alice", addr(9000));
        idx.set_assoc("bob", addr(9000));

        assert!(idx.get("alice").unwrap().addrs.is_empty());
        assert_eq!(idx.get("bob").unwrap().addrs, vec![addr(9000)]);
        assert_eq!(idx.name_for(addr(9000)), Some("bob"));
    }

    #[test]
    fn get_addr_returns_most_recent_first() {
        let mut idx = PeerIndex::new();
        idx.set_assoc("alice", addr(9000));
        idx.set_assoc("alice", addr(9001));
        assert_eq!(idx.get_addr("alice"), Some(addr(9001)));
    }

    #[test]
    fn peer_with_no_addresses_is_logically_absent() {
        let mut idx = PeerIndex::new();
        idx.set_assoc("alice", addr(9000));
        idx.set_assoc("bob", addr(9000));
        assert_eq!(idx.get_addr("alice"), None);
    }

    #[test]
    fn receive_pong_narrows_the_bracket() {
        let mut peer = Peer::new("alice");
        peer.receive_pong(100, 150, 120);
        // mindiff = max(MIN, 150-120=30) = 30
        // maxdiff = min(MAX, 150-100=50) = 50
        assert_eq!(peer.mindiff, 30);
        assert_eq!(peer.maxdiff, 50);
    }

    #[test]
    fn receive_pong_bracket_only_ever_narrows() {
        let mut peer = Peer::new("alice");
        peer.receive_pong(100, 150, 120);
        peer.receive_pong(200, 240, 230);
        // mindiff = max(30, 240-230=10) = 30 (no widening)
        // maxdiff = min(50, 240-200=40) = 40 (narrows further)
        assert_eq!(peer.mindiff, 30);
        assert_eq!(peer.maxdiff, 40);
    }
}
