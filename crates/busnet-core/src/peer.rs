//! Tracking of reachable peer nodes.
//!
//! Every packet receipt refreshes the sender's entry; entries that go silent
//! for longer than the table's timeout are dropped by the periodic prune.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A peer we have recently heard from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: u16,
    pub last_seen: Instant,
}

/// Last-seen table keyed on peer address.
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<u16, Instant>,
    timeout: Duration,
}

impl PeerTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            timeout,
        }
    }

    /// Insert or refresh the entry for `address`.
    pub fn observe(&mut self, address: u16, now: Instant) {
        self.peers.insert(address, now);
    }

    /// Whether `address` is currently in the table. Due to the prune
    /// interval it can take up to one tick past the timeout for a silent
    /// peer to become unreachable.
    pub fn is_reachable(&self, address: u16) -> bool {
        self.peers.contains_key(&address)
    }

    /// Drop entries not heard from within the timeout. Returns how many
    /// were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.peers.len();
        self.peers
            .retain(|_, last_seen| now.saturating_duration_since(*last_seen) <= timeout);
        before - self.peers.len()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Addresses of all current entries, in no particular order.
    pub fn addresses(&self) -> Vec<u16> {
        self.peers.keys().copied().collect()
    }

    /// Snapshot of all current entries.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers
            .iter()
            .map(|(address, last_seen)| PeerInfo {
                address: *address,
                last_seen: *last_seen,
            })
            .collect()
    }
}
