//! Tests for the neighbor cache: lookup refresh, LRU eviction, aging.

use crate::config::{MAX_NEIGHBOR_CACHE, NEIGHBOR_MAX_AGE_MS, NEIGHBOR_STALE_MS};
use crate::neighbor::{NeighborCache, NeighborState};
use crate::types::{Ipv6Addr, MacAddr};

fn addr(last: u8) -> Ipv6Addr {
    let mut bytes = [0u8; 16];
    bytes[0] = 0xfe;
    bytes[1] = 0x80;
    bytes[15] = last;
    Ipv6Addr(bytes)
}

fn mac(last: u8) -> MacAddr {
    MacAddr([0x02, 0, 0, 0, 0, last])
}

#[test]
fn insert_then_lookup_returns_mac() {
    let mut cache = NeighborCache::new();
    cache.insert(&addr(1), &mac(1), 100);

    assert_eq!(cache.lookup(&addr(1), 200), Some(mac(1)), "mapping found");
    assert_eq!(cache.lookup(&addr(2), 200), None, "unknown address misses");
    assert_eq!(cache.entry_count(), 1, "one entry cached");
}

#[test]
fn insert_overwrites_existing_entry() {
    let mut cache = NeighborCache::new();
    cache.insert(&addr(1), &mac(1), 100);
    cache.insert(&addr(1), &mac(9), 200);

    assert_eq!(cache.lookup(&addr(1), 300), Some(mac(9)), "newer MAC wins");
    assert_eq!(cache.entry_count(), 1, "no duplicate entry");
}

#[test]
fn full_cache_evicts_oldest_confirmation() {
    let mut cache = NeighborCache::new();
    for i in 0..MAX_NEIGHBOR_CACHE {
        // Entry i confirmed at time i; entry 0 is the oldest.
        cache.insert(&addr(i as u8), &mac(i as u8), i as u32);
    }
    assert_eq!(cache.entry_count(), MAX_NEIGHBOR_CACHE, "cache full");

    cache.insert(&addr(0xf0), &mac(0xf0), 1_000);
    assert_eq!(cache.entry_count(), MAX_NEIGHBOR_CACHE, "capacity unchanged");
    assert_eq!(cache.lookup(&addr(0), 1_001), None, "oldest entry evicted");
    assert_eq!(
        cache.lookup(&addr(0xf0), 1_001),
        Some(mac(0xf0)),
        "new entry present"
    );
}

#[test]
fn lookup_refreshes_the_confirmation_stamp() {
    let mut cache = NeighborCache::new();
    cache.insert(&addr(1), &mac(1), 0);

    // Touch just before the horizon, then age past the original stamp.
    let touch = NEIGHBOR_MAX_AGE_MS;
    assert!(cache.lookup(&addr(1), touch).is_some(), "touch refreshes");
    cache.age(NEIGHBOR_MAX_AGE_MS + 1);
    assert!(
        cache.lookup(&addr(1), NEIGHBOR_MAX_AGE_MS + 2).is_some(),
        "refreshed entry survives the sweep"
    );
}

#[test]
fn aging_tags_stale_then_invalidates() {
    let mut cache = NeighborCache::new();
    cache.insert(&addr(1), &mac(1), 0);
    assert_eq!(
        cache.state_of(&addr(1)),
        Some(NeighborState::Reachable),
        "fresh entry reachable"
    );

    cache.age(NEIGHBOR_STALE_MS + 1);
    assert_eq!(
        cache.state_of(&addr(1)),
        Some(NeighborState::Stale),
        "half-aged entry tagged stale"
    );

    cache.age(NEIGHBOR_MAX_AGE_MS + 1);
    assert_eq!(cache.state_of(&addr(1)), None, "expired entry invalidated");
    assert_eq!(cache.entry_count(), 0, "cache empty after expiry");
}

#[test]
fn stale_entry_used_for_egress_is_tagged_probe() {
    let mut cache = NeighborCache::new();
    cache.insert(&addr(1), &mac(1), 0);
    cache.age(NEIGHBOR_STALE_MS + 1);

    assert_eq!(
        cache.lookup(&addr(1), NEIGHBOR_STALE_MS + 2),
        Some(mac(1)),
        "stale mapping still usable"
    );
    assert_eq!(
        cache.state_of(&addr(1)),
        Some(NeighborState::Probe),
        "use of a stale entry marks it probing"
    );
}

#[test]
fn reconfirmation_returns_entry_to_reachable() {
    let mut cache = NeighborCache::new();
    cache.insert(&addr(1), &mac(1), 0);
    cache.age(NEIGHBOR_STALE_MS + 1);
    cache.insert(&addr(1), &mac(1), NEIGHBOR_STALE_MS + 2);

    assert_eq!(
        cache.state_of(&addr(1)),
        Some(NeighborState::Reachable),
        "advertisement re-confirms the entry"
    );
}
