//! Compile-time configuration knobs.
//!
//! Every table in the stack is a fixed-size array sized by one of these
//! constants.  Changing a value here changes the static RAM footprint and
//! nothing else; no code path allocates.  Defaults match a small
//! single-interface device (a handful of flows, a /64 on one link).

/// Number of receive staging buffers.
pub const MAX_RX_BUFFERS: usize = 8;

/// Number of transmit buffers.
pub const MAX_TX_BUFFERS: usize = 8;

/// Number of simultaneous TCP-Lite connections.
pub const MAX_TCP_CONNECTIONS: usize = 4;

/// Number of routing table entries.
pub const MAX_ROUTING_ENTRIES: usize = 32;

/// Number of neighbor cache entries.
pub const MAX_NEIGHBOR_CACHE: usize = 16;

/// Number of mDNS service records (local announcements + learned).
pub const MAX_MDNS_CACHE: usize = 8;

/// Number of UDP port bindings (receive-delivery callbacks).
pub const MAX_UDP_BINDINGS: usize = 8;

/// Link MTU in bytes — the largest IPv6 packet we emit or accept.
pub const MTU_SIZE: usize = 1500;

/// Size of each pool buffer slot.
///
/// Must hold a full frame: Ethernet (14) + IPv6 (40) + UDP (8) + MTU
/// payload (1500) = 1562 bytes, rounded up for slack.
pub const BUFFER_SIZE: usize = 1600;

/// TCP maximum segment size (IPv6 minimum MTU 1280, already below the
/// link MTU minus headers).
pub const TCP_MSS: usize = 1280;

/// Advertised TCP receive window.
pub const TCP_WINDOW_SIZE: u16 = 4096;

/// Retransmissions of an unacknowledged segment before the connection
/// is torn down.
pub const TCP_MAX_RETRIES: u8 = 3;

/// Retransmit / inactivity timeout for TCP-Lite connections (ms).
pub const TCP_TIMEOUT_MS: u32 = 5000;

/// Neighbor entries unconfirmed for longer than this are invalidated (ms).
pub const NEIGHBOR_MAX_AGE_MS: u32 = 30_000;

/// Neighbor entries unconfirmed for longer than this are tagged stale (ms).
pub const NEIGHBOR_STALE_MS: u32 = 15_000;

/// Routes unused for longer than this are invalidated (ms).  The
/// link-local route installed at init is exempt.
pub const ROUTE_MAX_IDLE_MS: u32 = 300_000;

/// First ephemeral port; the allocator wraps back here after 65535.
pub const EPHEMERAL_PORT_BASE: u16 = 49152;
