//! Per-peer connection bookkeeping.
//!
//! The directory is the single source of truth for who we are talking to and
//! how far the handshake has progressed. It is a plain data structure: the
//! coordinator owns it behind one mutex and never holds that lock across an
//! `.await`.

use std::collections::{HashMap, HashSet};
use std::fmt;

use parley_common::{Error, Result};

/// Handshake progress for one peer.
///
/// `Idle` means there is no record. `Failed` is terminal: entering it
/// discards the record and the peer reports `Failed` until the next request
/// in either direction starts a fresh record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    /// We sent a connection request and are waiting for the answer.
    Requesting,
    /// The peer asked to connect and the local decision is pending.
    Accepting,
    /// Accepted; public keys are being exchanged.
    KeyExchanging,
    /// Keys exchanged; messages and files may flow.
    Connected,
    Failed,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal handshake transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Requesting)
                | (Idle, Accepting)
                | (Requesting, KeyExchanging)
                | (Accepting, KeyExchanging)
                | (KeyExchanging, Connected)
                | (Connected, Idle)
                | (Idle | Requesting | Accepting | KeyExchanging | Connected, Failed)
        )
    }

    /// Handshake still running.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            ConnectionState::Requesting
                | ConnectionState::Accepting
                | ConnectionState::KeyExchanging
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Requesting => "requesting",
            ConnectionState::Accepting => "accepting",
            ConnectionState::KeyExchanging => "key_exchanging",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a peer's listener can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub username: String,
    pub address: PeerAddress,
    pub state: ConnectionState,
    /// PEM public key, present once the peer is `Connected`.
    pub public_key: Option<String>,
}

/// At most one record per (case-sensitive) username.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: HashMap<String, PeerRecord>,
    /// Peers whose last handshake failed and that have no record since.
    failed: HashSet<String>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outbound request: `Idle -> Requesting`.
    pub fn begin_request(&mut self, username: &str, address: PeerAddress) -> Result<()> {
        self.begin(username, address, ConnectionState::Requesting)
    }

    /// Record an inbound request awaiting a decision: `Idle -> Accepting`.
    pub fn begin_accepting(&mut self, username: &str, address: PeerAddress) -> Result<()> {
        self.begin(username, address, ConnectionState::Accepting)
    }

    fn begin(&mut self, username: &str, address: PeerAddress, state: ConnectionState) -> Result<()> {
        if let Some(existing) = self.peers.get(username) {
            return Err(Error::DuplicateOperation(format!(
                "{} is already {}",
                username, existing.state
            )));
        }
        self.failed.remove(username);
        self.peers.insert(
            username.to_string(),
            PeerRecord {
                username: username.to_string(),
                address,
                state,
                public_key: None,
            },
        );
        Ok(())
    }

    /// Move a peer to `next`, returning the state it left.
    ///
    /// Moving to `Idle` or `Failed` discards the record.
    pub fn transition(&mut self, username: &str, next: ConnectionState) -> Result<ConnectionState> {
        let current = self.state_of(username);
        if !current.can_transition_to(next) {
            return Err(invalid(username, current, next));
        }

        match next {
            ConnectionState::Idle => {
                self.peers.remove(username);
            }
            ConnectionState::Failed => {
                self.fail(username);
            }
            ConnectionState::Requesting | ConnectionState::Accepting => {
                // Only reachable from Idle, which has no record to update.
                return Err(invalid(username, current, next));
            }
            _ => {
                if let Some(record) = self.peers.get_mut(username) {
                    record.state = next;
                }
            }
        }
        Ok(current)
    }

    /// Store the peer's key and promote it to `Connected`.
    ///
    /// Returns `Ok(true)` only for the call that performed the promotion.
    /// A key that is already known is left untouched and yields `Ok(false)`.
    /// A key arriving while we are still `Requesting` counts as acceptance.
    pub fn store_public_key_and_promote(&mut self, username: &str, public_key: &str) -> Result<bool> {
        let record = self
            .peers
            .get_mut(username)
            .ok_or_else(|| Error::UnknownPeer(username.to_string()))?;

        if record.public_key.is_some() {
            return Ok(false);
        }

        match record.state {
            ConnectionState::Requesting | ConnectionState::KeyExchanging => {
                record.public_key = Some(public_key.to_string());
                record.state = ConnectionState::Connected;
                Ok(true)
            }
            other => Err(invalid(username, other, ConnectionState::Connected)),
        }
    }

    /// Move a peer in any state to `Failed`, discarding its record.
    ///
    /// Returns the record that was discarded, if any.
    pub fn fail(&mut self, username: &str) -> Option<PeerRecord> {
        let record = self.peers.remove(username)?;
        self.failed.insert(username.to_string());
        Some(record)
    }

    /// `Connected -> Idle`: drop the record and its cached key.
    pub fn remove_connected(&mut self, username: &str) -> Result<PeerRecord> {
        let state = self.state_of(username);
        if state != ConnectionState::Connected {
            return Err(Error::NotConnected(format!("{username} is {state}")));
        }
        self.peers
            .remove(username)
            .ok_or_else(|| Error::UnknownPeer(username.to_string()))
    }

    pub fn get(&self, username: &str) -> Option<&PeerRecord> {
        self.peers.get(username)
    }

    pub fn state_of(&self, username: &str) -> ConnectionState {
        match self.peers.get(username) {
            Some(record) => record.state,
            None if self.failed.contains(username) => ConnectionState::Failed,
            None => ConnectionState::Idle,
        }
    }

    /// All records, sorted by username.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut records: Vec<_> = self.peers.values().cloned().collect();
        records.sort_by(|a, b| a.username.cmp(&b.username));
        records
    }

    pub fn connected_peers(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .peers
            .values()
            .filter(|r| r.state == ConnectionState::Connected)
            .map(|r| r.username.clone())
            .collect();
        names.sort();
        names
    }

    /// Drop every record and failure marker, returning how many records went.
    pub fn clear(&mut self) -> usize {
        let count = self.peers.len();
        self.peers.clear();
        self.failed.clear();
        count
    }
}

fn invalid(username: &str, from: ConnectionState, to: ConnectionState) -> Error {
    Error::InvalidTransition {
        username: username.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    const ALL: [ConnectionState; 6] = [Idle, Requesting, Accepting, KeyExchanging, Connected, Failed];

    fn addr() -> PeerAddress {
        PeerAddress::new("127.0.0.1", 5555)
    }

    #[test]
    fn test_transition_table() {
        let legal = [
            (Idle, Requesting),
            (Idle, Accepting),
            (Requesting, KeyExchanging),
            (Accepting, KeyExchanging),
            (KeyExchanging, Connected),
            (Connected, Idle),
            (Idle, Failed),
            (Requesting, Failed),
            (Accepting, Failed),
            (KeyExchanging, Failed),
            (Connected, Failed),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_failed_is_terminal() {
        for next in ALL {
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn test_request_handshake_lifecycle() {
        let mut dir = PeerDirectory::new();
        dir.begin_request("bob", addr()).unwrap();
        assert_eq!(dir.state_of("bob"), Requesting);

        assert_eq!(dir.transition("bob", KeyExchanging).unwrap(), Requesting);
        assert!(dir.store_public_key_and_promote("bob", "PEM").unwrap());
        assert_eq!(dir.state_of("bob"), Connected);
        assert_eq!(dir.connected_peers(), vec!["bob".to_string()]);

        let removed = dir.remove_connected("bob").unwrap();
        assert_eq!(removed.public_key.as_deref(), Some("PEM"));
        assert_eq!(dir.state_of("bob"), Idle);
        assert!(dir.get("bob").is_none());
    }

    #[test]
    fn test_promotion_happens_once() {
        let mut dir = PeerDirectory::new();
        dir.begin_accepting("alice", addr()).unwrap();
        dir.transition("alice", KeyExchanging).unwrap();

        assert!(dir.store_public_key_and_promote("alice", "FIRST").unwrap());
        assert!(!dir.store_public_key_and_promote("alice", "SECOND").unwrap());
        assert_eq!(dir.get("alice").unwrap().public_key.as_deref(), Some("FIRST"));
    }

    #[test]
    fn test_early_key_counts_as_acceptance() {
        let mut dir = PeerDirectory::new();
        dir.begin_request("bob", addr()).unwrap();
        assert!(dir.store_public_key_and_promote("bob", "PEM").unwrap());
        assert_eq!(dir.state_of("bob"), Connected);
    }

    #[test]
    fn test_key_rejected_before_decision() {
        let mut dir = PeerDirectory::new();
        dir.begin_accepting("mallory", addr()).unwrap();
        assert!(matches!(
            dir.store_public_key_and_promote("mallory", "PEM"),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(
            dir.store_public_key_and_promote("nobody", "PEM"),
            Err(Error::UnknownPeer(_))
        ));
        assert_eq!(dir.get("mallory").unwrap().public_key, None);
    }

    #[test]
    fn test_duplicate_begin_is_rejected() {
        let mut dir = PeerDirectory::new();
        dir.begin_request("bob", addr()).unwrap();
        assert!(matches!(
            dir.begin_accepting("bob", addr()),
            Err(Error::DuplicateOperation(_))
        ));
        assert_eq!(dir.snapshot().len(), 1);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut dir = PeerDirectory::new();
        assert!(dir.transition("ghost", Connected).is_err());

        dir.begin_request("bob", addr()).unwrap();
        assert!(matches!(
            dir.transition("bob", Connected),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(dir.remove_connected("bob").is_err());
        assert_eq!(dir.state_of("bob"), Requesting);
    }

    #[test]
    fn test_fail_discards_record() {
        let mut dir = PeerDirectory::new();
        dir.begin_request("bob", addr()).unwrap();
        assert_eq!(dir.transition("bob", Failed).unwrap(), Requesting);
        assert!(dir.snapshot().is_empty());
        assert_eq!(dir.state_of("bob"), Failed);

        // A new attempt starts over and clears the marker.
        dir.begin_request("bob", addr()).unwrap();
        assert_eq!(dir.state_of("bob"), Requesting);
        assert_eq!(dir.fail("bob").unwrap().state, Requesting);
        assert!(dir.fail("bob").is_none());
        assert_eq!(dir.state_of("bob"), Failed);

        // Failing a peer we never knew leaves it Idle.
        assert!(dir.fail("carol").is_none());
        assert_eq!(dir.state_of("carol"), Idle);
    }

    #[test]
    fn test_failed_peer_can_be_asked_again() {
        let mut dir = PeerDirectory::new();
        dir.begin_accepting("alice", addr()).unwrap();
        dir.fail("alice");
        assert_eq!(dir.state_of("alice"), Failed);
        assert!(dir.transition("alice", KeyExchanging).is_err());

        dir.begin_accepting("alice", addr()).unwrap();
        assert_eq!(dir.state_of("alice"), Accepting);

        dir.fail("alice");
        assert_eq!(dir.clear(), 0);
        assert_eq!(dir.state_of("alice"), Idle);
    }

    #[test]
    fn test_snapshot_sorted_and_clear() {
        let mut dir = PeerDirectory::new();
        dir.begin_request("carol", addr()).unwrap();
        dir.begin_accepting("alice", addr()).unwrap();
        let names: Vec<_> = dir.snapshot().into_iter().map(|r| r.username).collect();
        assert_eq!(names, vec!["alice", "carol"]);
        assert_eq!(dir.clear(), 2);
        assert!(dir.snapshot().is_empty());
    }

    #[test]
    fn test_address_display() {
        assert_eq!(PeerAddress::new("10.0.0.1", 6000).to_string(), "10.0.0.1:6000");
        assert_eq!(PeerAddress::new("::1", 6000).to_string(), "[::1]:6000");
    }
}
