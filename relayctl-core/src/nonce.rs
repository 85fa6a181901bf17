//! Replay cache: fixed ring of recently seen (peer, nonce) pairs.
//!
//! Volatile by design; a reboot forgets everything. The window is bounded both by
//! the ring size and by the entry lifetime, whichever is hit first.

use std::time::{Duration, Instant};

use crate::protocol::PeerId;

/// Default number of ring slots.
pub const NONCE_SLOTS: usize = 50;

/// Default lifetime of a recorded nonce.
pub const DEFAULT_NONCE_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
struct NonceEntry {
    peer_id: PeerId,
    nonce: u32,
    recorded_at: Instant,
}

/// Ring buffer of `N` slots. Insertion always overwrites the oldest slot.
#[derive(Debug)]
pub struct NonceRegistry<const N: usize = NONCE_SLOTS> {
    slots: [Option<NonceEntry>; N],
    next: usize,
    ttl: Duration,
}

impl<const N: usize> NonceRegistry<N> {
    const NON_EMPTY: () = assert!(N > 0, "nonce registry needs at least one slot");

    pub fn new(ttl: Duration) -> Self {
        let () = Self::NON_EMPTY;
        Self {
            slots: [None; N],
            next: 0,
            ttl,
        }
    }

    /// Record `(peer_id, nonce)` if it is not already live. Returns false on replay.
    ///
    /// Every call first invalidates entries older than the TTL. No allocation.
    pub fn record_if_new(&mut self, peer_id: PeerId, nonce: u32, now: Instant) -> bool {
        self.sweep(now);
        let seen = self
            .slots
            .iter()
            .flatten()
            .any(|e| e.peer_id == peer_id && e.nonce == nonce);
        if seen {
            return false;
        }
        self.slots[self.next] = Some(NonceEntry {
            peer_id,
            nonce,
            recorded_at: now,
        });
        self.next = (self.next + 1) % N;
        true
    }

    fn sweep(&mut self, now: Instant) {
        for slot in self.slots.iter_mut() {
            if let Some(entry) = slot {
                if now.saturating_duration_since(entry.recorded_at) > self.ttl {
                    *slot = None;
                }
            }
        }
    }

    /// Number of occupied slots (expired entries count until the next sweep).
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        N
    }

    pub fn clear(&mut self) {
        self.slots = [None; N];
        self.next = 0;
    }
}

impl Default for NonceRegistry<NONCE_SLOTS> {
    fn default() -> Self {
        Self::new(DEFAULT_NONCE_TTL)
    }
}
