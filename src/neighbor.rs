//! IPv6 neighbor cache — address-to-MAC mapping populated by Neighbor
//! Discovery.
//!
//! Lookup is a bounded linear scan with a stamp refresh on hit.
//! Insertion takes a free slot when one exists, otherwise it evicts the
//! entry with the oldest confirmation stamp (LRU).  There is no
//! solicitation state machine here beyond the reachability tag: an
//! entry ages `Reachable` → `Stale`, a stale entry used for egress is
//! tagged `Probe`, and anything unconfirmed past
//! [`NEIGHBOR_MAX_AGE_MS`](crate::config::NEIGHBOR_MAX_AGE_MS) is
//! invalidated by the periodic sweep.  Re-confirmation happens when a
//! neighbor advertisement is processed.

use log::debug;

use crate::config::{MAX_NEIGHBOR_CACHE, NEIGHBOR_MAX_AGE_MS, NEIGHBOR_STALE_MS};
use crate::types::{Ipv6Addr, MacAddr};

// =============================================================================
// NeighborState
// =============================================================================

/// Reachability tag of a cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NeighborState {
    /// Confirmed recently; usable without qualification.
    Reachable,
    /// Unconfirmed past [`NEIGHBOR_STALE_MS`](crate::config::NEIGHBOR_STALE_MS);
    /// still usable, due for re-confirmation.
    Stale,
    /// A stale entry that egress traffic is actively using; a full
    /// implementation would be soliciting it right now.
    Probe,
}

// =============================================================================
// NeighborEntry
// =============================================================================

/// One neighbor cache slot.
#[derive(Clone, Copy, Debug)]
pub struct NeighborEntry {
    pub ipv6: Ipv6Addr,
    pub mac: MacAddr,
    pub state: NeighborState,
    /// Stamp of the most recent confirmation or use.
    pub last_confirmed_ms: u32,
    pub valid: bool,
}

impl NeighborEntry {
    const EMPTY: Self = Self {
        ipv6: Ipv6Addr::UNSPECIFIED,
        mac: MacAddr::ZERO,
        state: NeighborState::Reachable,
        last_confirmed_ms: 0,
        valid: false,
    };
}

// =============================================================================
// NeighborCache
// =============================================================================

/// Fixed array of [`MAX_NEIGHBOR_CACHE`] neighbor slots.
pub struct NeighborCache {
    entries: [NeighborEntry; MAX_NEIGHBOR_CACHE],
}

impl NeighborCache {
    /// An empty cache.
    pub const fn new() -> Self {
        Self {
            entries: [NeighborEntry::EMPTY; MAX_NEIGHBOR_CACHE],
        }
    }

    /// Look up the MAC for `addr`, refreshing the hit's stamp.
    ///
    /// A hit on a `Stale` entry tags it `Probe`: the mapping is still
    /// returned, the tag records that it is being used unconfirmed.
    pub fn lookup(&mut self, addr: &Ipv6Addr, now: u32) -> Option<MacAddr> {
        for entry in self.entries.iter_mut() {
            if entry.valid && entry.ipv6 == *addr {
                entry.last_confirmed_ms = now;
                if entry.state == NeighborState::Stale {
                    entry.state = NeighborState::Probe;
                }
                return Some(entry.mac);
            }
        }
        None
    }

    /// Insert or refresh the mapping `addr` → `mac` as `Reachable`.
    ///
    /// An existing entry for `addr` is overwritten in place.  Otherwise
    /// the first free slot is taken; with no free slot, the entry with
    /// the oldest confirmation stamp is evicted.
    pub fn insert(&mut self, addr: &Ipv6Addr, mac: &MacAddr, now: u32) {
        // Refresh in place if the address is already cached.
        for entry in self.entries.iter_mut() {
            if entry.valid && entry.ipv6 == *addr {
                entry.mac = *mac;
                entry.state = NeighborState::Reachable;
                entry.last_confirmed_ms = now;
                return;
            }
        }

        // Free slot, else oldest confirmation stamp.
        let mut slot = 0usize;
        let mut oldest = u32::MAX;
        for (i, entry) in self.entries.iter().enumerate() {
            if !entry.valid {
                slot = i;
                break;
            }
            if entry.last_confirmed_ms < oldest {
                oldest = entry.last_confirmed_ms;
                slot = i;
            }
        }

        if self.entries[slot].valid {
            debug!("neighbor: evicting {} for {}", self.entries[slot].ipv6, addr);
        }

        self.entries[slot] = NeighborEntry {
            ipv6: *addr,
            mac: *mac,
            state: NeighborState::Reachable,
            last_confirmed_ms: now,
            valid: true,
        };
        debug!("neighbor: {} -> {}", addr, mac);
    }

    /// Age the cache: tag entries `Stale` past
    /// [`NEIGHBOR_STALE_MS`](crate::config::NEIGHBOR_STALE_MS) and
    /// invalidate entries past
    /// [`NEIGHBOR_MAX_AGE_MS`](crate::config::NEIGHBOR_MAX_AGE_MS).
    pub fn age(&mut self, now: u32) {
        for entry in self.entries.iter_mut() {
            if !entry.valid {
                continue;
            }
            let idle = now.wrapping_sub(entry.last_confirmed_ms);
            if idle > NEIGHBOR_MAX_AGE_MS {
                debug!("neighbor: aged out {}", entry.ipv6);
                entry.valid = false;
            } else if idle > NEIGHBOR_STALE_MS && entry.state == NeighborState::Reachable {
                entry.state = NeighborState::Stale;
            }
        }
    }

    /// State of the entry for `addr`, if cached (diagnostic).
    pub fn state_of(&self, addr: &Ipv6Addr) -> Option<NeighborState> {
        self.entries
            .iter()
            .find(|e| e.valid && e.ipv6 == *addr)
            .map(|e| e.state)
    }

    /// Number of valid entries (diagnostic).
    pub fn entry_count(&self) -> usize {
        self.entries.iter().filter(|e| e.valid).count()
    }

    /// Clear every slot.
    pub fn reset(&mut self) {
        self.entries = [NeighborEntry::EMPTY; MAX_NEIGHBOR_CACHE];
    }
}
