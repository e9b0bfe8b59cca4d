//! Fixed-capacity IPv6 routing table with longest-prefix-match lookup.
//!
//! A single linear pass over all valid entries finds the winner: the
//! candidate with the strictly longest matching prefix, ties broken by
//! strictly lower metric.  No equal-cost multipath.  With 32 slots the
//! scan is bounded and branch-predictable — no buckets, no hashing.
//!
//! Entries age out implicitly: a successful lookup refreshes the
//! winner's `last_used_ms` stamp, and the periodic sweep invalidates
//! entries idle past [`ROUTE_MAX_IDLE_MS`](crate::config::ROUTE_MAX_IDLE_MS).
//! The `fe80::/10` link-local route installed at init is exempt from
//! aging.

use log::debug;

use crate::config::{MAX_ROUTING_ENTRIES, ROUTE_MAX_IDLE_MS};
use crate::types::{Ipv6Addr, NetError};

/// Prefix length of the link-local route installed at init.
pub const LINK_LOCAL_PREFIX_LEN: u8 = 10;

/// Metric of the link-local route installed at init.
pub const LINK_LOCAL_METRIC: u16 = 1;

// =============================================================================
// RouteEntry
// =============================================================================

/// One routing table slot.
#[derive(Clone, Copy, Debug)]
pub struct RouteEntry {
    /// Destination prefix in network byte order.
    pub destination: Ipv6Addr,
    /// Next-hop address; [`Ipv6Addr::UNSPECIFIED`] means directly
    /// connected (the destination itself is the next hop).
    pub next_hop: Ipv6Addr,
    /// Prefix length in bits, 0–128.
    pub prefix_len: u8,
    /// Route metric — lower is preferred at equal prefix length.
    pub metric: u16,
    /// Stamp of the last successful lookup that selected this route.
    pub last_used_ms: u32,
    /// Slot occupancy flag.
    pub valid: bool,
}

impl RouteEntry {
    const EMPTY: Self = Self {
        destination: Ipv6Addr::UNSPECIFIED,
        next_hop: Ipv6Addr::UNSPECIFIED,
        prefix_len: 0,
        metric: 0,
        last_used_ms: 0,
        valid: false,
    };

    /// `true` if `dst` falls under this route's prefix.
    #[inline]
    pub fn matches(&self, dst: &Ipv6Addr) -> bool {
        dst.matches_prefix(&self.destination, self.prefix_len)
    }

    /// Next hop for a destination matched by this route: the gateway if
    /// one is configured, otherwise `dst` itself (directly connected).
    #[inline]
    pub fn next_hop_for(&self, dst: &Ipv6Addr) -> Ipv6Addr {
        if self.next_hop.is_unspecified() {
            *dst
        } else {
            self.next_hop
        }
    }

    /// `true` for the link-local route installed at init — never aged.
    #[inline]
    fn is_link_local_default(&self) -> bool {
        self.prefix_len == LINK_LOCAL_PREFIX_LEN
            && self.destination == Ipv6Addr::LINK_LOCAL_PREFIX
    }
}

// =============================================================================
// RouteTable
// =============================================================================

/// Fixed array of [`MAX_ROUTING_ENTRIES`] route slots.
pub struct RouteTable {
    entries: [RouteEntry; MAX_ROUTING_ENTRIES],
}

impl RouteTable {
    /// An empty table.
    pub const fn new() -> Self {
        Self {
            entries: [RouteEntry::EMPTY; MAX_ROUTING_ENTRIES],
        }
    }

    /// Insert a route into the first free slot.
    ///
    /// `next_hop` of `None` records a directly connected prefix.
    /// Returns [`NetError::InvalidParam`] for a prefix length above 128
    /// and [`NetError::Overflow`] when every slot is occupied.
    pub fn add(
        &mut self,
        destination: &Ipv6Addr,
        prefix_len: u8,
        next_hop: Option<&Ipv6Addr>,
        metric: u16,
        now: u32,
    ) -> Result<(), NetError> {
        if prefix_len > 128 {
            return Err(NetError::InvalidParam);
        }

        for entry in self.entries.iter_mut() {
            if !entry.valid {
                entry.destination = *destination;
                entry.prefix_len = prefix_len;
                entry.next_hop = match next_hop {
                    Some(hop) => *hop,
                    None => Ipv6Addr::UNSPECIFIED,
                };
                entry.metric = metric;
                entry.last_used_ms = now;
                entry.valid = true;

                debug!(
                    "route: added {}/{} metric {}",
                    destination, prefix_len, metric
                );
                return Ok(());
            }
        }

        debug!("route: table full, rejecting {}/{}", destination, prefix_len);
        Err(NetError::Overflow)
    }

    /// Longest-prefix-match lookup.
    ///
    /// One pass over all valid entries; the winner is the entry with the
    /// strictly longest matching prefix, ties broken by strictly lower
    /// metric.  A hit refreshes the winner's `last_used_ms` and returns
    /// a copy of the entry.
    pub fn lookup(&mut self, dst: &Ipv6Addr, now: u32) -> Option<RouteEntry> {
        let mut best: Option<usize> = None;
        let mut best_prefix_len = 0u8;
        let mut best_metric = u16::MAX;

        for (i, entry) in self.entries.iter().enumerate() {
            if !entry.valid || !entry.matches(dst) {
                continue;
            }
            if best.is_none()
                || entry.prefix_len > best_prefix_len
                || (entry.prefix_len == best_prefix_len && entry.metric < best_metric)
            {
                best = Some(i);
                best_prefix_len = entry.prefix_len;
                best_metric = entry.metric;
            }
        }

        let idx = best?;
        self.entries[idx].last_used_ms = now;
        Some(self.entries[idx])
    }

    /// Explicitly invalidate the first route matching
    /// `(destination, prefix_len)`.  Returns `true` if one was removed.
    pub fn invalidate(&mut self, destination: &Ipv6Addr, prefix_len: u8) -> bool {
        for entry in self.entries.iter_mut() {
            if entry.valid && entry.prefix_len == prefix_len && entry.destination == *destination {
                entry.valid = false;
                debug!("route: invalidated {}/{}", destination, prefix_len);
                return true;
            }
        }
        false
    }

    /// Invalidate routes idle longer than
    /// [`ROUTE_MAX_IDLE_MS`](crate::config::ROUTE_MAX_IDLE_MS), skipping
    /// the link-local route.
    pub fn age(&mut self, now: u32) {
        for entry in self.entries.iter_mut() {
            if entry.valid
                && !entry.is_link_local_default()
                && now.wrapping_sub(entry.last_used_ms) > ROUTE_MAX_IDLE_MS
            {
                debug!("route: aged out {}/{}", entry.destination, entry.prefix_len);
                entry.valid = false;
            }
        }
    }

    /// Number of valid routes (diagnostic).
    pub fn route_count(&self) -> usize {
        self.entries.iter().filter(|e| e.valid).count()
    }

    /// Clear every slot.
    pub fn reset(&mut self) {
        self.entries = [RouteEntry::EMPTY; MAX_ROUTING_ENTRIES];
    }
}
