//! Discovery registry: actors a controller can currently reach.
//!
//! Bounded, insertion-ordered, compacting on removal. Positions shift when a
//! peer expires, so callers look peers up by id and never hold an index across ticks.

use std::time::{Duration, Instant};

use crate::protocol::PeerId;
use crate::security::SessionKey;
use crate::transport::LinkAddress;

/// Maximum concurrently tracked peers.
pub const MAX_PEERS: usize = 10;

/// Default liveness timeout.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Outcome of the challenge/response identity proof for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAuth {
    /// Beacon seen, but no verified response yet (or no session key to verify with).
    IdentityUnverified,
    Authenticated { session_key: SessionKey },
}

/// Per-peer progress of a coordinated firmware update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaReadiness {
    Idle,
    /// OtaPrepare sent, no acknowledgement yet.
    Requested,
    /// Peer acknowledged.
    Ready,
}

#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub id: PeerId,
    pub link_address: LinkAddress,
    pub relay_state: bool,
    pub signal_quality: i8,
    pub last_seen: Instant,
    pub auth: PeerAuth,
    pub ota: OtaReadiness,
}

impl DiscoveredPeer {
    pub fn is_authenticated(&self) -> bool {
        matches!(self.auth, PeerAuth::Authenticated { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    /// Known peer beaconed from a new address; its verified identity was dropped.
    Moved,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("discovery registry full ({0} peers)")]
    Full(usize),
}

pub struct DiscoveryRegistry {
    peers: Vec<DiscoveredPeer>,
    capacity: usize,
    timeout: Duration,
}

impl DiscoveryRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self::with_capacity(MAX_PEERS, timeout)
    }

    pub fn with_capacity(capacity: usize, timeout: Duration) -> Self {
        Self {
            peers: Vec::with_capacity(capacity),
            capacity,
            timeout,
        }
    }

    /// Insert a new peer or refresh an existing one in place.
    /// A new peer beyond capacity is rejected; nobody is evicted.
    /// An address change resets the peer to `IdentityUnverified`.
    pub fn register_or_update(
        &mut self,
        id: PeerId,
        link_address: LinkAddress,
        relay_state: bool,
        signal_quality: i8,
        now: Instant,
    ) -> Result<Upsert, RegistryError> {
        if let Some(peer) = self.find_mut(id) {
            let moved = peer.link_address != link_address;
            if moved {
                peer.link_address = link_address;
                peer.auth = PeerAuth::IdentityUnverified;
            }
            peer.relay_state = relay_state;
            peer.signal_quality = signal_quality;
            peer.last_seen = now;
            return Ok(if moved { Upsert::Moved } else { Upsert::Updated });
        }
        if self.peers.len() >= self.capacity {
            return Err(RegistryError::Full(self.capacity));
        }
        self.peers.push(DiscoveredPeer {
            id,
            link_address,
            relay_state,
            signal_quality,
            last_seen: now,
            auth: PeerAuth::IdentityUnverified,
            ota: OtaReadiness::Idle,
        });
        Ok(Upsert::Inserted)
    }

    /// Remove every peer not seen for longer than the timeout. Returns their ids.
    pub fn expire_stale(&mut self, now: Instant) -> Vec<PeerId> {
        let timeout = self.timeout;
        let mut expired = Vec::new();
        self.peers.retain(|p| {
            let stale = now.saturating_duration_since(p.last_seen) > timeout;
            if stale {
                expired.push(p.id);
            }
            !stale
        });
        expired
    }

    pub fn find(&self, id: PeerId) -> Option<&DiscoveredPeer> {
        self.peers.iter().find(|p| p.id == id)
    }

    fn find_mut(&mut self, id: PeerId) -> Option<&mut DiscoveredPeer> {
        self.peers.iter_mut().find(|p| p.id == id)
    }

    /// Record a verified identity proof. Returns false if the peer is unknown.
    pub fn mark_authenticated(&mut self, id: PeerId, session_key: SessionKey) -> bool {
        match self.find_mut(id) {
            Some(peer) => {
                peer.auth = PeerAuth::Authenticated { session_key };
                true
            }
            None => false,
        }
    }

    /// Update relay state from a status report; also counts as a sign of life.
    pub fn update_relay_state(&mut self, id: PeerId, relay_state: bool, now: Instant) -> bool {
        match self.find_mut(id) {
            Some(peer) => {
                peer.relay_state = relay_state;
                peer.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Refresh liveness only.
    pub fn touch(&mut self, id: PeerId, now: Instant) -> bool {
        match self.find_mut(id) {
            Some(peer) => {
                peer.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn set_ota(&mut self, id: PeerId, ota: OtaReadiness) -> bool {
        match self.find_mut(id) {
            Some(peer) => {
                peer.ota = ota;
                true
            }
            None => false,
        }
    }

    pub fn reset_ota(&mut self) {
        for peer in &mut self.peers {
            peer.ota = OtaReadiness::Idle;
        }
    }

    /// Peers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &DiscoveredPeer> {
        self.peers.iter()
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

impl Default for DiscoveryRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_DISCOVERY_TIMEOUT)
    }
}
