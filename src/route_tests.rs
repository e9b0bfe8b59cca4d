//! Tests for the longest-prefix-match routing table.

use crate::config::{MAX_ROUTING_ENTRIES, ROUTE_MAX_IDLE_MS};
use crate::route::{RouteTable, LINK_LOCAL_METRIC, LINK_LOCAL_PREFIX_LEN};
use crate::types::{Ipv6Addr, NetError};

fn addr(last: u8) -> Ipv6Addr {
    let mut bytes = [0u8; 16];
    bytes[0] = 0x20;
    bytes[1] = 0x01;
    bytes[2] = 0x0d;
    bytes[3] = 0xb8;
    bytes[15] = last;
    Ipv6Addr(bytes)
}

/// `2001:db8::/32`
fn db8_prefix() -> Ipv6Addr {
    let mut bytes = [0u8; 16];
    bytes[0] = 0x20;
    bytes[1] = 0x01;
    bytes[2] = 0x0d;
    bytes[3] = 0xb8;
    Ipv6Addr(bytes)
}

#[test]
fn add_then_lookup_returns_route() {
    let mut table = RouteTable::new();
    table
        .add(&addr(1), 128, None, 1, 0)
        .expect("add into empty table");

    let hit = table.lookup(&addr(1), 10).expect("host route found");
    assert_eq!(hit.prefix_len, 128, "host route selected");
    assert_eq!(
        hit.next_hop_for(&addr(1)),
        addr(1),
        "directly connected next hop is the destination"
    );
    assert!(table.lookup(&addr(2), 10).is_none(), "sibling address misses a /128");
}

#[test]
fn lookup_misses_on_empty_table() {
    let mut table = RouteTable::new();
    assert!(table.lookup(&addr(7), 0).is_none(), "empty table has no routes");
}

#[test]
fn longest_prefix_wins() {
    let mut table = RouteTable::new();
    let gateway = addr(0xfe);
    table
        .add(&db8_prefix(), 32, Some(&gateway), 10, 0)
        .expect("covering /32");
    table.add(&addr(5), 128, None, 10, 0).expect("host /128");

    let hit = table.lookup(&addr(5), 1).expect("match");
    assert_eq!(hit.prefix_len, 128, "/128 beats /32 regardless of order");

    let other = table.lookup(&addr(6), 1).expect("covered by /32");
    assert_eq!(other.prefix_len, 32, "/32 covers the rest");
    assert_eq!(
        other.next_hop_for(&addr(6)),
        gateway,
        "gateway route forwards through the gateway"
    );
}

#[test]
fn metric_breaks_prefix_ties() {
    let mut table = RouteTable::new();
    table
        .add(&db8_prefix(), 32, Some(&addr(0xaa)), 20, 0)
        .expect("first");
    table
        .add(&db8_prefix(), 32, Some(&addr(0xbb)), 5, 0)
        .expect("second");

    let hit = table.lookup(&addr(1), 1).expect("match");
    assert_eq!(hit.metric, 5, "lower metric wins the tie");
    assert_eq!(hit.next_hop, addr(0xbb), "winning route's gateway returned");
}

#[test]
fn prefix_len_zero_is_default_route() {
    let mut table = RouteTable::new();
    table
        .add(&Ipv6Addr::UNSPECIFIED, 0, Some(&addr(1)), 100, 0)
        .expect("default route");

    assert!(table.lookup(&addr(9), 1).is_some(), "default matches anything");
    assert!(
        table.lookup(&Ipv6Addr::ALL_NODES, 1).is_some(),
        "default matches multicast too"
    );
}

#[test]
fn invalid_prefix_len_rejected() {
    let mut table = RouteTable::new();
    assert_eq!(
        table.add(&addr(1), 129, None, 1, 0),
        Err(NetError::InvalidParam),
        "prefix length above 128 rejected"
    );
    assert_eq!(table.route_count(), 0, "nothing inserted");
}

#[test]
fn overflow_after_exactly_capacity_adds() {
    let mut table = RouteTable::new();
    for i in 0..MAX_ROUTING_ENTRIES {
        table
            .add(&addr(i as u8), 128, None, 1, 0)
            .expect("adds up to capacity succeed");
    }
    assert_eq!(
        table.add(&addr(0xff), 128, None, 1, 0),
        Err(NetError::Overflow),
        "capacity + 1 overflows"
    );
    assert_eq!(table.route_count(), MAX_ROUTING_ENTRIES, "table is full");
}

#[test]
fn explicit_invalidation_frees_slot() {
    let mut table = RouteTable::new();
    table.add(&addr(1), 128, None, 1, 0).expect("add");
    assert!(table.invalidate(&addr(1), 128), "route removed");
    assert!(!table.invalidate(&addr(1), 128), "second removal is a no-op");
    assert!(table.lookup(&addr(1), 1).is_none(), "route gone");
}

#[test]
fn aging_invalidates_idle_routes_only() {
    let mut table = RouteTable::new();
    table.add(&addr(1), 128, None, 1, 0).expect("idle route");
    table.add(&addr(2), 128, None, 1, 0).expect("busy route");

    // Touch the busy route late, then age just past the idle horizon of
    // the first.
    let late = ROUTE_MAX_IDLE_MS;
    assert!(table.lookup(&addr(2), late).is_some(), "refresh stamp");

    table.age(ROUTE_MAX_IDLE_MS + 1);
    assert!(table.lookup(&addr(1), 0).is_none(), "idle route aged out");
    assert!(table.lookup(&addr(2), 0).is_some(), "refreshed route survives");
}

#[test]
fn link_local_route_is_never_aged() {
    let mut table = RouteTable::new();
    table
        .add(
            &Ipv6Addr::LINK_LOCAL_PREFIX,
            LINK_LOCAL_PREFIX_LEN,
            None,
            LINK_LOCAL_METRIC,
            0,
        )
        .expect("link-local route");

    table.age(u32::MAX / 2);
    let mut fe80_host = [0u8; 16];
    fe80_host[0] = 0xfe;
    fe80_host[1] = 0x80;
    fe80_host[15] = 0x42;
    assert!(
        table.lookup(&Ipv6Addr(fe80_host), 0).is_some(),
        "link-local route survives any idle period"
    );
}
