//! The stack context: every table and pool, the receive pipeline, the
//! transmit pipeline, and the periodic maintenance sweep.
//!
//! [`Stack`] is the explicit handle that replaces a process-wide global:
//! construct it (const, so a `static` works), call
//! [`init`](Stack::init), and thread it through every operation.  All
//! mutable state sits behind one [`CritMutex`]; the buffer byte storage
//! sits outside the mutex under the pool ownership discipline so frames
//! can be handed to hardware (and delivery callbacks invoked) *after*
//! the critical section is released.  Because no I/O happens under the
//! lock, a loopback platform may feed [`transmit`](Platform::transmit)
//! straight back into [`process_rx`](Stack::process_rx).
//!
//! Every loop in this module is bounded by a table or pool capacity.

use log::debug;

use crate::config::{
    BUFFER_SIZE, EPHEMERAL_PORT_BASE, MAX_MDNS_CACHE, MAX_RX_BUFFERS, MAX_TCP_CONNECTIONS,
    MAX_TX_BUFFERS, MTU_SIZE,
};
use crate::icmpv6;
use crate::mdns::{self, MdnsCache, MdnsRecord, MDNS_GROUP, MDNS_PORT, SERVICE_NAME_MAX};
use crate::neighbor::NeighborCache;
use crate::platform::{CritMutex, Platform};
use crate::pool::{BufferPool, BufferStorage};
use crate::route::{RouteTable, LINK_LOCAL_METRIC, LINK_LOCAL_PREFIX_LEN};
use crate::tcp::{RetransmitPoll, SegmentOut, TcpState, TcpTable};
use crate::types::{Ipv6Addr, MacAddr, NetError, QosClass, Statistics, TcpHandle};
use crate::udp::{UdpBindings, UdpHandler};
use crate::wire::{
    self, EthHeader, Ipv6Header, NextHeader, TcpFlags, TcpHeader, UdpHeader, ETHERTYPE_IPV6,
    ETH_HEADER_LEN, ICMPV6_CHECKSUM_OFFSET, IPV6_DEFAULT_HOP_LIMIT, IPV6_HEADER_LEN,
    TCP_CHECKSUM_OFFSET, TCP_HEADER_LEN, UDP_CHECKSUM_OFFSET, UDP_HEADER_LEN,
};

/// Byte offset of the IPv6 header within a frame.
const L3_OFFSET: usize = ETH_HEADER_LEN;
/// Byte offset of the upper-layer header within a frame.
const L4_OFFSET: usize = ETH_HEADER_LEN + IPV6_HEADER_LEN;
/// Hop limit required on NDP messages (RFC 4861 §7.1).
const NDP_HOP_LIMIT: u8 = 255;
/// ISN stride between connections.
const ISN_STRIDE: u32 = 64_000;

// =============================================================================
// StackInner
// =============================================================================

/// Everything behind the critical section.
struct StackInner {
    rx_pool: BufferPool<MAX_RX_BUFFERS>,
    tx_pool: BufferPool<MAX_TX_BUFFERS>,
    routes: RouteTable,
    neighbors: NeighborCache,
    tcp: TcpTable,
    mdns: MdnsCache,
    udp_bindings: UdpBindings,

    local_ipv6: Ipv6Addr,
    local_mac: MacAddr,

    stats: Statistics,

    next_ephemeral_port: u16,
    sequence_seed: u32,
    initialized: bool,
}

impl StackInner {
    const fn new() -> Self {
        Self {
            rx_pool: BufferPool::new(),
            tx_pool: BufferPool::new(),
            routes: RouteTable::new(),
            neighbors: NeighborCache::new(),
            tcp: TcpTable::new(),
            mdns: MdnsCache::new(),
            udp_bindings: UdpBindings::new(),
            local_ipv6: Ipv6Addr::UNSPECIFIED,
            local_mac: MacAddr::ZERO,
            stats: Statistics::new(),
            next_ephemeral_port: EPHEMERAL_PORT_BASE,
            sequence_seed: 0,
            initialized: false,
        }
    }

    /// Sweep every table and counter back to the zeroed state.
    fn reset(&mut self) {
        self.rx_pool.reset();
        self.tx_pool.reset();
        self.routes.reset();
        self.neighbors.reset();
        self.tcp.reset();
        self.mdns.reset();
        self.udp_bindings.reset();
        self.local_ipv6 = Ipv6Addr::UNSPECIFIED;
        self.local_mac = MacAddr::ZERO;
        self.stats = Statistics::new();
        self.next_ephemeral_port = EPHEMERAL_PORT_BASE;
        self.sequence_seed = 0;
        self.initialized = false;
    }

    /// Next ephemeral port: starts at 49152, never yields 0, wraps back
    /// to 49152 after 65535.
    fn alloc_ephemeral(&mut self) -> u16 {
        let port = self.next_ephemeral_port;
        self.next_ephemeral_port = self.next_ephemeral_port.wrapping_add(1);
        if self.next_ephemeral_port == 0 {
            self.next_ephemeral_port = EPHEMERAL_PORT_BASE;
        }
        port
    }

    /// Next initial sequence number; the seed advances per connection.
    fn next_isn(&mut self) -> u32 {
        let isn = self.sequence_seed;
        self.sequence_seed = self.sequence_seed.wrapping_add(ISN_STRIDE);
        isn
    }
}

/// Next-hop resolution result.
enum Resolved {
    /// Link-layer address known; proceed with transmission.
    Mac(MacAddr),
    /// Cache miss — caller should emit a neighbor solicitation for this
    /// address and report the send as transiently unroutable.
    Solicit(Ipv6Addr),
}

/// Deferred work to execute after the critical section is released.
enum RxAction {
    None,
    /// Hand a built reply frame to hardware.
    Transmit { tx_idx: usize, len: usize },
    /// Invoke a UDP delivery callback over the staged frame.
    Deliver {
        handler: UdpHandler,
        src: Ipv6Addr,
        src_port: u16,
        payload_off: usize,
        payload_len: usize,
    },
}

// =============================================================================
// Stack
// =============================================================================

/// The network stack instance.
///
/// ```ignore
/// static NET: Stack<Board> = Stack::new();
///
/// NET.init(&local_ipv6, &local_mac)?;
/// NET.udp_send(&dst, 4000, 0, b"hello", QosClass::Normal)?;
/// ```
pub struct Stack<P: Platform> {
    inner: CritMutex<P, StackInner>,
    rx_storage: BufferStorage<MAX_RX_BUFFERS>,
    tx_storage: BufferStorage<MAX_TX_BUFFERS>,
}

impl<P: Platform> Stack<P> {
    /// A stack with zeroed state; call [`init`](Self::init) before use.
    pub const fn new() -> Self {
        Self {
            inner: CritMutex::new(StackInner::new()),
            rx_storage: BufferStorage::new(),
            tx_storage: BufferStorage::new(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Initialize (or re-initialize) the stack.
    ///
    /// Zeroes every table and counter, stores the local addresses, seeds
    /// the ephemeral-port counter and the TCP sequence seed, and
    /// installs the `fe80::/10` link-local route.
    pub fn init(&self, local_ipv6: &Ipv6Addr, local_mac: &MacAddr) -> Result<(), NetError> {
        if local_ipv6.is_unspecified() || local_mac.is_zero() {
            return Err(NetError::InvalidParam);
        }

        let mut inner = self.inner.lock();
        inner.reset();
        inner.local_ipv6 = *local_ipv6;
        inner.local_mac = *local_mac;
        inner.sequence_seed = P::time_ms();

        let now = P::time_ms();
        // The table is empty here, so this insertion cannot fail.
        let _ = inner.routes.add(
            &Ipv6Addr::LINK_LOCAL_PREFIX,
            LINK_LOCAL_PREFIX_LEN,
            None,
            LINK_LOCAL_METRIC,
            now,
        );
        inner.initialized = true;

        debug!("stack: initialized as [{}] {}", local_ipv6, local_mac);
        Ok(())
    }

    /// Tear the stack down with the same zero sweep as [`init`](Self::init).
    pub fn deinit(&self) {
        self.inner.lock().reset();
        debug!("stack: deinitialized");
    }

    /// Snapshot of the statistics counters.
    pub fn statistics(&self) -> Statistics {
        self.inner.lock().stats
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Insert a static route.  `next_hop` of `None` marks the prefix
    /// directly connected.
    pub fn add_route(
        &self,
        destination: &Ipv6Addr,
        prefix_len: u8,
        next_hop: Option<&Ipv6Addr>,
        metric: u16,
    ) -> Result<(), NetError> {
        let mut inner = self.inner.lock();
        let now = P::time_ms();
        inner.routes.add(destination, prefix_len, next_hop, metric, now)
    }

    // =========================================================================
    // UDP
    // =========================================================================

    /// Register a receive-delivery callback for `port`.
    pub fn udp_bind(&self, port: u16, handler: UdpHandler) -> Result<(), NetError> {
        let mut inner = self.inner.lock();
        if !inner.initialized {
            return Err(NetError::InvalidParam);
        }
        inner.udp_bindings.bind(port, handler)
    }

    /// Remove the receive-delivery callback for `port`.
    pub fn udp_unbind(&self, port: u16) {
        self.inner.lock().udp_bindings.unbind(port);
    }

    /// Send a UDP datagram.
    ///
    /// `src_port` of 0 draws the next ephemeral port.  The datagram
    /// travels the full egress pipeline: route lookup, neighbor
    /// resolution, QoS-preferring buffer allocation, header assembly,
    /// pseudo-header checksum, hardware hand-off, buffer release.
    pub fn udp_send(
        &self,
        dst: &Ipv6Addr,
        dst_port: u16,
        src_port: u16,
        payload: &[u8],
        qos: QosClass,
    ) -> Result<(), NetError> {
        let work = {
            let mut inner = self.inner.lock();
            if !inner.initialized {
                return Err(NetError::InvalidParam);
            }
            if dst_port == 0 || payload.is_empty() || payload.len() > MTU_SIZE {
                return Err(NetError::InvalidParam);
            }

            let now = P::time_ms();
            let src_port = if src_port == 0 {
                inner.alloc_ephemeral()
            } else {
                src_port
            };

            match Self::resolve_next_hop(&mut inner, dst, now)? {
                Resolved::Solicit(target) => Err(target),
                Resolved::Mac(dst_mac) => {
                    let Some(tx_idx) = inner.tx_pool.allocate(qos, now) else {
                        inner.stats.tx_dropped = inner.stats.tx_dropped.wrapping_add(1);
                        return Err(NetError::NoBuffer);
                    };
                    // SAFETY: tx_idx was just allocated under the lock;
                    // this operation owns the slot until it is freed.
                    let frame = unsafe { self.tx_storage.slot_mut(tx_idx) };
                    let len = build_udp_frame(
                        frame,
                        &inner.local_mac,
                        &dst_mac,
                        &inner.local_ipv6,
                        dst,
                        src_port,
                        dst_port,
                        payload,
                    );
                    inner.tx_pool.set_length(tx_idx, len as u16);
                    Ok((tx_idx, len))
                }
            }
        };

        match work {
            Ok((tx_idx, len)) => {
                self.transmit_release(tx_idx, len);
                Ok(())
            }
            Err(target) => {
                self.emit_solicit(&target);
                Err(NetError::NoRoute)
            }
        }
    }

    // =========================================================================
    // TCP-Lite
    // =========================================================================

    /// Open a connection: route check, neighbor resolution, slot claim,
    /// SYN emission.  Returns the connection handle; the connection
    /// reaches `Established` when the peer's SYN+ACK is processed by
    /// [`process_rx`](Self::process_rx).
    pub fn tcp_connect(&self, dst: &Ipv6Addr, dst_port: u16) -> Result<TcpHandle, NetError> {
        let work = {
            let mut inner = self.inner.lock();
            if !inner.initialized {
                return Err(NetError::InvalidParam);
            }
            if dst_port == 0 {
                return Err(NetError::InvalidParam);
            }

            let now = P::time_ms();
            match Self::resolve_next_hop(&mut inner, dst, now)? {
                Resolved::Solicit(target) => Err(target),
                Resolved::Mac(dst_mac) => {
                    let local_port = inner.alloc_ephemeral();
                    let isn = inner.next_isn();
                    let local = inner.local_ipv6;
                    let (idx, seg) =
                        inner
                            .tcp
                            .open(&local, dst, local_port, dst_port, &dst_mac, isn, now)?;

                    let Some(tx_idx) = inner.tx_pool.allocate(QosClass::High, now) else {
                        inner.tcp.release(idx);
                        inner.stats.tx_dropped = inner.stats.tx_dropped.wrapping_add(1);
                        return Err(NetError::NoBuffer);
                    };
                    // SAFETY: freshly allocated slot, owned by this call.
                    let frame = unsafe { self.tx_storage.slot_mut(tx_idx) };
                    let len = build_tcp_frame(
                        frame,
                        &inner.local_mac,
                        &dst_mac,
                        &local,
                        dst,
                        local_port,
                        dst_port,
                        &seg,
                        &[],
                    );
                    inner.tx_pool.set_length(tx_idx, len as u16);
                    Ok((TcpHandle(idx as u8), tx_idx, len))
                }
            }
        };

        match work {
            Ok((handle, tx_idx, len)) => {
                self.transmit_release(tx_idx, len);
                Ok(handle)
            }
            Err(target) => {
                self.emit_solicit(&target);
                Err(NetError::NoRoute)
            }
        }
    }

    /// Claim a slot listening on `port`; an inbound SYN turns it into a
    /// connection (SYN_RCVD, then ESTABLISHED on the handshake ACK).
    pub fn tcp_listen(&self, port: u16) -> Result<TcpHandle, NetError> {
        let mut inner = self.inner.lock();
        if !inner.initialized {
            return Err(NetError::InvalidParam);
        }
        if port == 0 {
            return Err(NetError::InvalidParam);
        }
        let now = P::time_ms();
        let local = inner.local_ipv6;
        let idx = inner.tcp.listen(&local, port, now)?;
        Ok(TcpHandle(idx as u8))
    }

    /// Send data on a connection in `ESTABLISHED` or `CLOSE_WAIT`.
    ///
    /// The payload is cut into MSS-sized segments; each is transmitted
    /// immediately and the most recent one is armed for retransmission
    /// by the periodic task.
    pub fn tcp_send(&self, handle: TcpHandle, data: &[u8]) -> Result<(), NetError> {
        if handle.index() >= MAX_TCP_CONNECTIONS {
            return Err(NetError::InvalidParam);
        }
        if data.is_empty() {
            return Err(NetError::InvalidParam);
        }

        let idx = handle.index();
        let mut offset = 0usize;
        while offset < data.len() {
            let chunk_end = (offset + crate::config::TCP_MSS).min(data.len());
            let chunk = &data[offset..chunk_end];

            let (tx_idx, len) = {
                let mut inner = self.inner.lock();
                if !inner.initialized {
                    return Err(NetError::InvalidParam);
                }
                let now = P::time_ms();

                let Some(conn) = inner.tcp.conn(idx) else {
                    return Err(NetError::Connection);
                };
                if !conn.state.can_send() {
                    return Err(NetError::Connection);
                }
                let remote = conn.remote_addr;
                let (local, local_port, remote_port, cached_mac) = (
                    conn.local_addr,
                    conn.local_port,
                    conn.remote_port,
                    conn.remote_mac,
                );

                // Prefer a fresh neighbor mapping, fall back to the MAC
                // resolved when the connection was opened.
                let dst_mac = inner
                    .neighbors
                    .lookup(&remote, now)
                    .unwrap_or(cached_mac);

                let Some(tx_idx) = inner.tx_pool.allocate(QosClass::High, now) else {
                    inner.stats.tx_dropped = inner.stats.tx_dropped.wrapping_add(1);
                    return Err(NetError::NoBuffer);
                };

                let seg =
                    inner
                        .tcp
                        .record_segment(idx, chunk, TcpFlags::PSH | TcpFlags::ACK, now);
                // SAFETY: freshly allocated slot, owned by this call.
                let frame = unsafe { self.tx_storage.slot_mut(tx_idx) };
                let len = build_tcp_frame(
                    frame,
                    &inner.local_mac,
                    &dst_mac,
                    &local,
                    &remote,
                    local_port,
                    remote_port,
                    &seg,
                    chunk,
                );
                inner.tx_pool.set_length(tx_idx, len as u16);
                (tx_idx, len)
            };

            self.transmit_release(tx_idx, len);
            offset = chunk_end;
        }

        Ok(())
    }

    /// Close a connection.
    ///
    /// `ESTABLISHED` and `CLOSE_WAIT` emit a FIN and walk the teardown
    /// states; every other state drops straight to `CLOSED` and frees
    /// the slot.  The handle is invalid once `CLOSED` is reached.
    pub fn tcp_close(&self, handle: TcpHandle) -> Result<(), NetError> {
        if handle.index() >= MAX_TCP_CONNECTIONS {
            return Err(NetError::InvalidParam);
        }
        let idx = handle.index();

        let work = {
            let mut inner = self.inner.lock();
            if !inner.initialized {
                return Err(NetError::InvalidParam);
            }
            if inner.tcp.conn(idx).is_none() {
                return Err(NetError::Connection);
            }
            let now = P::time_ms();

            match inner.tcp.begin_close(idx, now) {
                None => None,
                Some(seg) => self.build_conn_segment(&mut inner, idx, &seg, &[], now),
            }
        };

        if let Some((tx_idx, len)) = work {
            self.transmit_release(tx_idx, len);
        }
        Ok(())
    }

    // =========================================================================
    // mDNS façade
    // =========================================================================

    /// Look up a service by exact name.
    ///
    /// A cache miss emits a best-effort multicast query and returns
    /// [`NetError::Timeout`] — the responder that would populate the
    /// cache is an external collaborator.
    pub fn mdns_query(&self, service_name: &str) -> Result<MdnsRecord, NetError> {
        if service_name.is_empty() || service_name.len() > SERVICE_NAME_MAX {
            return Err(NetError::InvalidParam);
        }

        let work = {
            let mut inner = self.inner.lock();
            if !inner.initialized {
                return Err(NetError::InvalidParam);
            }
            if let Some(record) = inner.mdns.lookup(service_name) {
                return Ok(record);
            }
            let now = P::time_ms();
            self.build_mdns_payload(&mut inner, now, |payload| {
                mdns::build_query(service_name, payload)
            })
        };

        if let Some((tx_idx, len)) = work {
            self.transmit_release(tx_idx, len);
        }
        Err(NetError::Timeout)
    }

    /// Register a local service for periodic multicast advertisement and
    /// emit the first announcement immediately.
    pub fn mdns_announce(
        &self,
        service_name: &str,
        port: u16,
        ttl_sec: u32,
    ) -> Result<(), NetError> {
        if service_name.is_empty()
            || service_name.len() > SERVICE_NAME_MAX
            || port == 0
            || ttl_sec == 0
        {
            return Err(NetError::InvalidParam);
        }

        let work = {
            let mut inner = self.inner.lock();
            if !inner.initialized {
                return Err(NetError::InvalidParam);
            }
            let now = P::time_ms();
            let local = inner.local_ipv6;
            let ttl_ms = ttl_sec.saturating_mul(1000);
            let slot = inner
                .mdns
                .insert(service_name, &local, port, ttl_ms, true, now);
            match inner.mdns.due_announcement(slot, now) {
                Some(record) => self.build_mdns_payload(&mut inner, now, |payload| {
                    mdns::build_announcement(&record, payload)
                }),
                None => None,
            }
        };

        if let Some((tx_idx, len)) = work {
            self.transmit_release(tx_idx, len);
        }
        Ok(())
    }

    // =========================================================================
    // Receive pipeline
    // =========================================================================

    /// Process one received Ethernet frame.
    ///
    /// The frame is staged into an RX pool buffer, validated, checksum-
    /// verified, and demultiplexed under the critical section; any reply
    /// transmission or delivery callback then runs outside it.
    pub fn process_rx(&self, frame: &[u8]) -> Result<(), NetError> {
        if frame.is_empty() {
            return Err(NetError::InvalidParam);
        }

        let (rx_idx, action, result) = {
            let mut inner = self.inner.lock();
            if !inner.initialized {
                return Err(NetError::InvalidParam);
            }
            if frame.len() > BUFFER_SIZE {
                inner.stats.rx_errors = inner.stats.rx_errors.wrapping_add(1);
                return Err(NetError::InvalidParam);
            }
            let now = P::time_ms();

            let Some(rx_idx) = inner.rx_pool.allocate(QosClass::Normal, now) else {
                inner.stats.rx_dropped = inner.stats.rx_dropped.wrapping_add(1);
                return Err(NetError::NoBuffer);
            };
            // SAFETY: freshly allocated slot, owned by this call.
            let slot = unsafe { self.rx_storage.slot_mut(rx_idx) };
            slot[..frame.len()].copy_from_slice(frame);
            inner.rx_pool.set_length(rx_idx, frame.len() as u16);

            let data: &[u8] = &slot[..frame.len()];
            let (action, result) = self.rx_classify(&mut inner, data, now);
            (rx_idx, action, result)
        };

        // I/O outside the critical section.
        let transmitted = match action {
            RxAction::None => None,
            RxAction::Transmit { tx_idx, len } => {
                // SAFETY: the slot was allocated by rx_classify and is
                // owned by this call until freed below.
                let reply = unsafe { &self.tx_storage.slot(tx_idx)[..len] };
                P::transmit(reply);
                Some(tx_idx)
            }
            RxAction::Deliver {
                handler,
                src,
                src_port,
                payload_off,
                payload_len,
            } => {
                // SAFETY: the staged slot is owned by this call.
                let staged = unsafe { self.rx_storage.slot(rx_idx) };
                handler(&src, src_port, &staged[payload_off..payload_off + payload_len]);
                None
            }
        };

        let mut inner = self.inner.lock();
        inner.rx_pool.free(rx_idx);
        if let Some(tx_idx) = transmitted {
            inner.tx_pool.free(tx_idx);
            inner.stats.tx_packets = inner.stats.tx_packets.wrapping_add(1);
        }

        result
    }

    /// Validate and demultiplex a staged frame.  Returns the deferred
    /// action plus the result to report.  Never returns early after the
    /// staging buffer was allocated — the caller owns cleanup.
    fn rx_classify(
        &self,
        inner: &mut StackInner,
        data: &[u8],
        now: u32,
    ) -> (RxAction, Result<(), NetError>) {
        let stats = &mut inner.stats;

        // Steps 1-3: length, EtherType, version.  Failures here are not
        // classified packets and only count rx_errors.
        if data.len() < L4_OFFSET {
            stats.rx_errors = stats.rx_errors.wrapping_add(1);
            return (RxAction::None, Err(NetError::InvalidParam));
        }
        let Some(eth) = EthHeader::parse(data) else {
            stats.rx_errors = stats.rx_errors.wrapping_add(1);
            return (RxAction::None, Err(NetError::InvalidParam));
        };
        if eth.ethertype != ETHERTYPE_IPV6 {
            stats.rx_errors = stats.rx_errors.wrapping_add(1);
            return (RxAction::None, Err(NetError::InvalidParam));
        }
        let Some(ip) = Ipv6Header::parse(&data[L3_OFFSET..]) else {
            stats.rx_errors = stats.rx_errors.wrapping_add(1);
            return (RxAction::None, Err(NetError::InvalidParam));
        };

        // Past length + version: the frame is classified.
        stats.rx_packets = stats.rx_packets.wrapping_add(1);

        // Step 4: hop limit — silent drop.
        if ip.hop_limit == 0 {
            stats.rx_errors = stats.rx_errors.wrapping_add(1);
            return (RxAction::None, Ok(()));
        }

        // Payload length must fit the frame (shorter is fine — the
        // link layer pads small frames).
        let l4_end = L4_OFFSET + ip.payload_len as usize;
        if l4_end > data.len() {
            stats.rx_errors = stats.rx_errors.wrapping_add(1);
            return (RxAction::None, Err(NetError::InvalidParam));
        }

        // Step 5: destination filter.  Forwarding is off.
        let local = inner.local_ipv6;
        let for_us = ip.dst == local
            || ip.dst == local.solicited_node()
            || ip.dst == Ipv6Addr::ALL_NODES
            || ip.dst == MDNS_GROUP;
        if !for_us {
            inner.stats.rx_dropped = inner.stats.rx_dropped.wrapping_add(1);
            return (RxAction::None, Ok(()));
        }

        let l4 = &data[L4_OFFSET..l4_end];

        // Steps 6-7: upper-layer checksum, then demultiplex.
        match NextHeader::from_u8(ip.next_header) {
            Some(NextHeader::Icmpv6) => self.rx_icmpv6(inner, &eth, &ip, l4, now),
            Some(NextHeader::Udp) => Self::rx_udp(inner, &ip, l4),
            Some(NextHeader::Tcp) => self.rx_tcp(inner, &eth, &ip, l4, now),
            None => {
                inner.stats.rx_errors = inner.stats.rx_errors.wrapping_add(1);
                (RxAction::None, Err(NetError::InvalidParam))
            }
        }
    }

    /// ICMPv6: echo request and the NDP subset.
    fn rx_icmpv6(
        &self,
        inner: &mut StackInner,
        eth: &EthHeader,
        ip: &Ipv6Header,
        l4: &[u8],
        now: u32,
    ) -> (RxAction, Result<(), NetError>) {
        if l4.len() < wire::ICMPV6_HEADER_LEN {
            inner.stats.rx_errors = inner.stats.rx_errors.wrapping_add(1);
            return (RxAction::None, Err(NetError::InvalidParam));
        }
        if !wire::verify_transport_checksum(&ip.src, &ip.dst, NextHeader::Icmpv6, l4) {
            inner.stats.checksum_errors = inner.stats.checksum_errors.wrapping_add(1);
            return (RxAction::None, Err(NetError::Checksum));
        }

        let local = inner.local_ipv6;
        match l4[0] {
            icmpv6::TYPE_ECHO_REQUEST if ip.dst == local => {
                let action = self.build_icmpv6_reply(
                    inner,
                    &eth.src,
                    &ip.src,
                    IPV6_DEFAULT_HOP_LIMIT,
                    now,
                    |msg| icmpv6::build_echo_reply(msg, l4),
                );
                (action, Ok(()))
            }

            icmpv6::TYPE_NEIGHBOR_SOLICIT => {
                let Some(target) = icmpv6::parse_target(l4) else {
                    inner.stats.rx_errors = inner.stats.rx_errors.wrapping_add(1);
                    return (RxAction::None, Err(NetError::InvalidParam));
                };
                // Glean the solicitor's mapping.
                if let Some(mac) = icmpv6::parse_link_addr_option(l4, icmpv6::OPT_SOURCE_LINK_ADDR)
                {
                    inner.neighbors.insert(&ip.src, &mac, now);
                }
                if target == local {
                    let local_mac = inner.local_mac;
                    let action =
                        self.build_icmpv6_advert(inner, &eth.src, &ip.src, &local, &local_mac, now);
                    (action, Ok(()))
                } else {
                    (RxAction::None, Ok(()))
                }
            }

            icmpv6::TYPE_NEIGHBOR_ADVERT => {
                let Some(target) = icmpv6::parse_target(l4) else {
                    inner.stats.rx_errors = inner.stats.rx_errors.wrapping_add(1);
                    return (RxAction::None, Err(NetError::InvalidParam));
                };
                let mac = icmpv6::parse_link_addr_option(l4, icmpv6::OPT_TARGET_LINK_ADDR)
                    .unwrap_or(eth.src);
                inner.neighbors.insert(&target, &mac, now);
                (RxAction::None, Ok(()))
            }

            _ => (RxAction::None, Ok(())),
        }
    }

    /// UDP: verify, then hand to the bound port's callback.
    fn rx_udp(inner: &mut StackInner, ip: &Ipv6Header, l4: &[u8]) -> (RxAction, Result<(), NetError>) {
        let Some(udp) = UdpHeader::parse(l4) else {
            inner.stats.rx_errors = inner.stats.rx_errors.wrapping_add(1);
            return (RxAction::None, Err(NetError::InvalidParam));
        };
        // A zero checksum is illegal over IPv6 (RFC 8200 §8.1).
        if udp.checksum == 0
            || !wire::verify_transport_checksum(
                &ip.src,
                &ip.dst,
                NextHeader::Udp,
                &l4[..udp.length as usize],
            )
        {
            inner.stats.checksum_errors = inner.stats.checksum_errors.wrapping_add(1);
            return (RxAction::None, Err(NetError::Checksum));
        }

        match inner.udp_bindings.lookup(udp.dst_port) {
            Some(handler) => (
                RxAction::Deliver {
                    handler,
                    src: ip.src,
                    src_port: udp.src_port,
                    payload_off: L4_OFFSET + UDP_HEADER_LEN,
                    payload_len: udp.length as usize - UDP_HEADER_LEN,
                },
                Ok(()),
            ),
            None => {
                inner.stats.rx_dropped = inner.stats.rx_dropped.wrapping_add(1);
                (RxAction::None, Ok(()))
            }
        }
    }

    /// TCP: verify, find the owning connection, drive the state machine.
    fn rx_tcp(
        &self,
        inner: &mut StackInner,
        eth: &EthHeader,
        ip: &Ipv6Header,
        l4: &[u8],
        now: u32,
    ) -> (RxAction, Result<(), NetError>) {
        let Some(tcp) = TcpHeader::parse(l4) else {
            inner.stats.rx_errors = inner.stats.rx_errors.wrapping_add(1);
            return (RxAction::None, Err(NetError::InvalidParam));
        };
        if !wire::verify_transport_checksum(&ip.src, &ip.dst, NextHeader::Tcp, l4) {
            inner.stats.checksum_errors = inner.stats.checksum_errors.wrapping_add(1);
            return (RxAction::None, Err(NetError::Checksum));
        }

        let payload_len = l4.len() - tcp.header_len();

        match inner.tcp.lookup_segment(tcp.dst_port, &ip.src, tcp.src_port) {
            Some(idx) => {
                let isn = if inner.tcp.conn(idx).map(|c| c.state) == Some(TcpState::Listen) {
                    inner.next_isn()
                } else {
                    0
                };
                let reply = inner
                    .tcp
                    .on_segment(idx, &ip.src, &eth.src, &tcp, payload_len, isn, now);
                match reply {
                    Some(seg) => {
                        let action = self
                            .build_conn_segment(inner, idx, &seg, &[], now)
                            .map_or(RxAction::None, |(tx_idx, len)| RxAction::Transmit {
                                tx_idx,
                                len,
                            });
                        (action, Ok(()))
                    }
                    None => (RxAction::None, Ok(())),
                }
            }
            None => {
                // No owner: answer non-RST segments with a RST.
                inner.stats.rx_dropped = inner.stats.rx_dropped.wrapping_add(1);
                if tcp.flags.contains(TcpFlags::RST) {
                    return (RxAction::None, Ok(()));
                }
                let (seq, ack, flags) = if tcp.flags.contains(TcpFlags::ACK) {
                    (tcp.ack_num, 0, TcpFlags::RST)
                } else {
                    let mut advance = payload_len as u32;
                    if tcp.flags.contains(TcpFlags::SYN) {
                        advance = advance.wrapping_add(1);
                    }
                    (
                        0,
                        tcp.seq_num.wrapping_add(advance),
                        TcpFlags::RST | TcpFlags::ACK,
                    )
                };
                let seg = SegmentOut {
                    seq,
                    ack,
                    flags,
                    window: 0,
                };
                let local = inner.local_ipv6;
                let action = self
                    .build_tcp_reply(
                        inner,
                        &eth.src,
                        &ip.src,
                        &local,
                        tcp.dst_port,
                        tcp.src_port,
                        &seg,
                        &[],
                        now,
                    )
                    .map_or(RxAction::None, |(tx_idx, len)| RxAction::Transmit {
                        tx_idx,
                        len,
                    });
                (action, Ok(()))
            }
        }
    }

    // =========================================================================
    // Periodic maintenance
    // =========================================================================

    /// Periodic maintenance, invoked externally at roughly 100 ms
    /// cadence: ages every table, drives pending TCP retransmissions,
    /// and emits mDNS announcements on the TTL schedule.  Work is
    /// bounded by the sum of the table sizes.
    pub fn periodic_task(&self) {
        // TCP retransmissions, one lock cycle per connection slot.
        for idx in 0..MAX_TCP_CONNECTIONS {
            let work = {
                let mut inner = self.inner.lock();
                if !inner.initialized {
                    return;
                }
                let now = P::time_ms();
                match inner.tcp.retransmit_poll(idx, now) {
                    RetransmitPoll::Idle => None,
                    RetransmitPoll::GaveUp => {
                        inner.stats.tx_errors = inner.stats.tx_errors.wrapping_add(1);
                        None
                    }
                    RetransmitPoll::Emit(seg) => {
                        let mut payload = [0u8; crate::config::TCP_MSS];
                        let rtx_payload = inner.tcp.rtx(idx).payload();
                        let payload_len = rtx_payload.len();
                        payload[..payload_len].copy_from_slice(rtx_payload);
                        self.build_conn_segment(&mut inner, idx, &seg, &payload[..payload_len], now)
                    }
                }
            };
            if let Some((tx_idx, len)) = work {
                self.transmit_release(tx_idx, len);
            }
        }

        // mDNS announcements on the TTL schedule.
        for idx in 0..MAX_MDNS_CACHE {
            let work = {
                let mut inner = self.inner.lock();
                if !inner.initialized {
                    return;
                }
                let now = P::time_ms();
                match inner.mdns.due_announcement(idx, now) {
                    Some(record) => self.build_mdns_payload(&mut inner, now, |payload| {
                        mdns::build_announcement(&record, payload)
                    }),
                    None => None,
                }
            };
            if let Some((tx_idx, len)) = work {
                self.transmit_release(tx_idx, len);
            }
        }

        // Table aging.
        let mut inner = self.inner.lock();
        if !inner.initialized {
            return;
        }
        let now = P::time_ms();
        inner.neighbors.age(now);
        inner.routes.age(now);
        let forced = inner.tcp.age(now);
        inner.stats.tx_errors = inner.stats.tx_errors.wrapping_add(forced);
        inner.mdns.age(now);
    }

    // =========================================================================
    // Internal egress helpers
    // =========================================================================

    /// Resolve the next hop for `dst`: multicast maps straight to its
    /// derived MAC; unicast walks route lookup then the neighbor cache.
    fn resolve_next_hop(
        inner: &mut StackInner,
        dst: &Ipv6Addr,
        now: u32,
    ) -> Result<Resolved, NetError> {
        if dst.is_multicast() {
            return Ok(Resolved::Mac(MacAddr::for_multicast(dst)));
        }

        let Some(route) = inner.routes.lookup(dst, now) else {
            inner.stats.routing_errors = inner.stats.routing_errors.wrapping_add(1);
            return Err(NetError::NoRoute);
        };
        let next_hop = route.next_hop_for(dst);

        match inner.neighbors.lookup(&next_hop, now) {
            Some(mac) => Ok(Resolved::Mac(mac)),
            None => {
                inner.stats.routing_errors = inner.stats.routing_errors.wrapping_add(1);
                Ok(Resolved::Solicit(next_hop))
            }
        }
    }

    /// Transmit a built TX frame and release its buffer.
    /// Must be called without the lock held.
    fn transmit_release(&self, tx_idx: usize, len: usize) {
        // SAFETY: the slot was allocated by the calling operation and is
        // owned by it until freed below.
        let frame = unsafe { &self.tx_storage.slot(tx_idx)[..len] };
        P::transmit(frame);

        let mut inner = self.inner.lock();
        inner.tx_pool.free(tx_idx);
        inner.stats.tx_packets = inner.stats.tx_packets.wrapping_add(1);
    }

    /// Best-effort neighbor solicitation for `target`, sent to its
    /// solicited-node multicast group.
    fn emit_solicit(&self, target: &Ipv6Addr) {
        let work = {
            let mut inner = self.inner.lock();
            let now = P::time_ms();
            let group = target.solicited_node();
            let local_mac = inner.local_mac;
            let local = inner.local_ipv6;

            match inner.tx_pool.allocate(QosClass::High, now) {
                None => {
                    inner.stats.tx_dropped = inner.stats.tx_dropped.wrapping_add(1);
                    None
                }
                Some(tx_idx) => {
                    // SAFETY: freshly allocated slot, owned by this call.
                    let frame = unsafe { self.tx_storage.slot_mut(tx_idx) };
                    let msg_len =
                        icmpv6::build_neighbor_solicit(&mut frame[L4_OFFSET..], target, &local_mac);
                    match msg_len {
                        None => {
                            inner.tx_pool.free(tx_idx);
                            None
                        }
                        Some(msg_len) => {
                            let len = finish_icmpv6_frame(
                                frame,
                                &local_mac,
                                &MacAddr::for_multicast(&group),
                                &local,
                                &group,
                                NDP_HOP_LIMIT,
                                msg_len,
                            );
                            inner.tx_pool.set_length(tx_idx, len as u16);
                            debug!("ndp: soliciting {}", target);
                            Some((tx_idx, len))
                        }
                    }
                }
            }
        };

        if let Some((tx_idx, len)) = work {
            self.transmit_release(tx_idx, len);
        }
    }

    /// Build an ICMPv6 reply frame whose message is produced by `fill`.
    fn build_icmpv6_reply(
        &self,
        inner: &mut StackInner,
        dst_mac: &MacAddr,
        dst_ip: &Ipv6Addr,
        hop_limit: u8,
        now: u32,
        fill: impl FnOnce(&mut [u8]) -> Option<usize>,
    ) -> RxAction {
        let Some(tx_idx) = inner.tx_pool.allocate(QosClass::Normal, now) else {
            inner.stats.tx_dropped = inner.stats.tx_dropped.wrapping_add(1);
            return RxAction::None;
        };
        // SAFETY: freshly allocated slot, owned by this call.
        let frame = unsafe { self.tx_storage.slot_mut(tx_idx) };
        let Some(msg_len) = fill(&mut frame[L4_OFFSET..]) else {
            inner.tx_pool.free(tx_idx);
            return RxAction::None;
        };
        let local_mac = inner.local_mac;
        let local = inner.local_ipv6;
        let len = finish_icmpv6_frame(frame, &local_mac, dst_mac, &local, dst_ip, hop_limit, msg_len);
        inner.tx_pool.set_length(tx_idx, len as u16);
        RxAction::Transmit { tx_idx, len }
    }

    /// Build a solicited neighbor advertisement for `target` to the
    /// solicitor at `dst_ip`/`dst_mac`.
    fn build_icmpv6_advert(
        &self,
        inner: &mut StackInner,
        dst_mac: &MacAddr,
        dst_ip: &Ipv6Addr,
        target: &Ipv6Addr,
        target_mac: &MacAddr,
        now: u32,
    ) -> RxAction {
        let target = *target;
        let target_mac = *target_mac;
        self.build_icmpv6_reply(inner, dst_mac, dst_ip, NDP_HOP_LIMIT, now, move |msg| {
            icmpv6::build_neighbor_advert(msg, &target, &target_mac, true)
        })
    }

    /// Build a TCP segment frame for connection `idx` from a
    /// [`SegmentOut`].  Returns the TX slot and frame length, or `None`
    /// when no buffer is available (counted as a drop; a pending
    /// retransmission will re-emit armed segments later).
    fn build_conn_segment(
        &self,
        inner: &mut StackInner,
        idx: usize,
        seg: &SegmentOut,
        payload: &[u8],
        now: u32,
    ) -> Option<(usize, usize)> {
        let conn = inner.tcp.conn(idx)?;
        let (local, remote, local_port, remote_port, cached_mac) = (
            conn.local_addr,
            conn.remote_addr,
            conn.local_port,
            conn.remote_port,
            conn.remote_mac,
        );
        let dst_mac = inner.neighbors.lookup(&remote, now).unwrap_or(cached_mac);
        self.build_tcp_reply(
            inner, &dst_mac, &remote, &local, local_port, remote_port, seg, payload, now,
        )
    }

    /// Build a raw TCP segment frame (connection-less path used for
    /// RSTs as well).
    #[allow(clippy::too_many_arguments)]
    fn build_tcp_reply(
        &self,
        inner: &mut StackInner,
        dst_mac: &MacAddr,
        dst_ip: &Ipv6Addr,
        src_ip: &Ipv6Addr,
        src_port: u16,
        dst_port: u16,
        seg: &SegmentOut,
        payload: &[u8],
        now: u32,
    ) -> Option<(usize, usize)> {
        let Some(tx_idx) = inner.tx_pool.allocate(QosClass::High, now) else {
            inner.stats.tx_dropped = inner.stats.tx_dropped.wrapping_add(1);
            return None;
        };
        // SAFETY: freshly allocated slot, owned by this call.
        let frame = unsafe { self.tx_storage.slot_mut(tx_idx) };
        let len = build_tcp_frame(
            frame,
            &inner.local_mac,
            dst_mac,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            seg,
            payload,
        );
        inner.tx_pool.set_length(tx_idx, len as u16);
        Some((tx_idx, len))
    }

    /// Build an mDNS datagram (announcement or query) whose UDP payload
    /// is produced by `fill`, addressed to the mDNS multicast group.
    fn build_mdns_payload(
        &self,
        inner: &mut StackInner,
        now: u32,
        fill: impl FnOnce(&mut [u8]) -> Option<usize>,
    ) -> Option<(usize, usize)> {
        let Some(tx_idx) = inner.tx_pool.allocate(QosClass::Low, now) else {
            inner.stats.tx_dropped = inner.stats.tx_dropped.wrapping_add(1);
            return None;
        };
        // SAFETY: freshly allocated slot, owned by this call.
        let frame = unsafe { self.tx_storage.slot_mut(tx_idx) };
        let Some(payload_len) = fill(&mut frame[L4_OFFSET + UDP_HEADER_LEN..]) else {
            inner.tx_pool.free(tx_idx);
            return None;
        };

        let len = finish_udp_frame(
            frame,
            &inner.local_mac,
            &MacAddr::for_multicast(&MDNS_GROUP),
            &inner.local_ipv6,
            &MDNS_GROUP,
            MDNS_PORT,
            MDNS_PORT,
            payload_len,
        );
        inner.tx_pool.set_length(tx_idx, len as u16);
        Some((tx_idx, len))
    }
}

impl<P: Platform> Default for Stack<P> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Frame assembly
// =============================================================================

/// Write Ethernet + IPv6 headers for a frame carrying `upper_len` bytes
/// of `next_header` payload.
#[allow(clippy::too_many_arguments)]
fn fill_headers(
    frame: &mut [u8],
    src_mac: &MacAddr,
    dst_mac: &MacAddr,
    src_ip: &Ipv6Addr,
    dst_ip: &Ipv6Addr,
    next_header: NextHeader,
    hop_limit: u8,
    upper_len: usize,
) {
    let eth = EthHeader {
        dst: *dst_mac,
        src: *src_mac,
        ethertype: ETHERTYPE_IPV6,
    };
    let ip = Ipv6Header {
        traffic_class: 0,
        flow_label: 0,
        payload_len: upper_len as u16,
        next_header: next_header.as_u8(),
        hop_limit,
        src: *src_ip,
        dst: *dst_ip,
    };
    let _ = eth.write(frame);
    let _ = ip.write(&mut frame[L3_OFFSET..]);
}

/// Assemble a complete UDP frame with payload copied in and the
/// checksum patched.  Returns the frame length.
#[allow(clippy::too_many_arguments)]
fn build_udp_frame(
    frame: &mut [u8],
    src_mac: &MacAddr,
    dst_mac: &MacAddr,
    src_ip: &Ipv6Addr,
    dst_ip: &Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> usize {
    frame[L4_OFFSET + UDP_HEADER_LEN..L4_OFFSET + UDP_HEADER_LEN + payload.len()]
        .copy_from_slice(payload);
    finish_udp_frame(
        frame,
        src_mac,
        dst_mac,
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        payload.len(),
    )
}

/// Finish a UDP frame whose payload already sits after the header
/// space: write all headers and patch the checksum.
#[allow(clippy::too_many_arguments)]
fn finish_udp_frame(
    frame: &mut [u8],
    src_mac: &MacAddr,
    dst_mac: &MacAddr,
    src_ip: &Ipv6Addr,
    dst_ip: &Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    payload_len: usize,
) -> usize {
    let udp_len = UDP_HEADER_LEN + payload_len;
    fill_headers(
        frame,
        src_mac,
        dst_mac,
        src_ip,
        dst_ip,
        NextHeader::Udp,
        IPV6_DEFAULT_HOP_LIMIT,
        udp_len,
    );

    let udp = UdpHeader {
        src_port,
        dst_port,
        length: udp_len as u16,
        checksum: 0,
    };
    let _ = udp.write(&mut frame[L4_OFFSET..]);

    let mut csum = wire::transport_checksum(
        src_ip,
        dst_ip,
        NextHeader::Udp,
        &frame[L4_OFFSET..L4_OFFSET + udp_len],
    );
    // RFC 768 / 8200: a computed zero is transmitted as 0xFFFF.
    if csum == 0 {
        csum = 0xffff;
    }
    frame[L4_OFFSET + UDP_CHECKSUM_OFFSET..L4_OFFSET + UDP_CHECKSUM_OFFSET + 2]
        .copy_from_slice(&csum.to_be_bytes());

    L4_OFFSET + udp_len
}

/// Assemble a complete TCP segment frame.  Returns the frame length.
#[allow(clippy::too_many_arguments)]
fn build_tcp_frame(
    frame: &mut [u8],
    src_mac: &MacAddr,
    dst_mac: &MacAddr,
    src_ip: &Ipv6Addr,
    dst_ip: &Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    seg: &SegmentOut,
    payload: &[u8],
) -> usize {
    let seg_len = TCP_HEADER_LEN + payload.len();
    fill_headers(
        frame,
        src_mac,
        dst_mac,
        src_ip,
        dst_ip,
        NextHeader::Tcp,
        IPV6_DEFAULT_HOP_LIMIT,
        seg_len,
    );

    let tcp = TcpHeader {
        src_port,
        dst_port,
        seq_num: seg.seq,
        ack_num: seg.ack,
        data_offset: 5,
        flags: seg.flags,
        window_size: seg.window,
        checksum: 0,
        urgent_ptr: 0,
    };
    let _ = tcp.write(&mut frame[L4_OFFSET..]);
    frame[L4_OFFSET + TCP_HEADER_LEN..L4_OFFSET + seg_len].copy_from_slice(payload);

    let csum = wire::transport_checksum(
        src_ip,
        dst_ip,
        NextHeader::Tcp,
        &frame[L4_OFFSET..L4_OFFSET + seg_len],
    );
    frame[L4_OFFSET + TCP_CHECKSUM_OFFSET..L4_OFFSET + TCP_CHECKSUM_OFFSET + 2]
        .copy_from_slice(&csum.to_be_bytes());

    L4_OFFSET + seg_len
}

/// Finish an ICMPv6 frame whose message (checksum zeroed) already sits
/// at the upper-layer offset.  Returns the frame length.
fn finish_icmpv6_frame(
    frame: &mut [u8],
    src_mac: &MacAddr,
    dst_mac: &MacAddr,
    src_ip: &Ipv6Addr,
    dst_ip: &Ipv6Addr,
    hop_limit: u8,
    msg_len: usize,
) -> usize {
    fill_headers(
        frame,
        src_mac,
        dst_mac,
        src_ip,
        dst_ip,
        NextHeader::Icmpv6,
        hop_limit,
        msg_len,
    );

    let csum = wire::transport_checksum(
        src_ip,
        dst_ip,
        NextHeader::Icmpv6,
        &frame[L4_OFFSET..L4_OFFSET + msg_len],
    );
    frame[L4_OFFSET + ICMPV6_CHECKSUM_OFFSET..L4_OFFSET + ICMPV6_CHECKSUM_OFFSET + 2]
        .copy_from_slice(&csum.to_be_bytes());

    L4_OFFSET + msg_len
}
