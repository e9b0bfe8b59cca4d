//! Shared test fixtures: a host-side platform with a controllable clock
//! and captured transmissions, plus builders for inbound test frames.
//!
//! Clock and capture state are thread-local so parallel test threads
//! stay isolated.

use std::cell::{Cell, RefCell};

use crate::platform::Platform;
use crate::stack::Stack;
use crate::types::{Ipv6Addr, MacAddr};
use crate::wire::{
    self, EthHeader, Ipv6Header, NextHeader, TcpFlags, TcpHeader, UdpHeader, ETHERTYPE_IPV6,
    ETH_HEADER_LEN, IPV6_HEADER_LEN, TCP_HEADER_LEN, UDP_HEADER_LEN,
};

thread_local! {
    static CLOCK_MS: Cell<u32> = const { Cell::new(1_000) };
    static SENT: RefCell<Vec<Vec<u8>>> = const { RefCell::new(Vec::new()) };
}

/// Test platform: no-op critical sections, settable clock, transmit
/// capture.
pub struct TestPlatform;

impl Platform for TestPlatform {
    fn critical_enter() -> u32 {
        0
    }

    fn critical_exit(_token: u32) {}

    fn time_ms() -> u32 {
        CLOCK_MS.with(|c| c.get())
    }

    fn transmit(frame: &[u8]) {
        SENT.with(|s| s.borrow_mut().push(frame.to_vec()));
    }
}

pub fn set_time(ms: u32) {
    CLOCK_MS.with(|c| c.set(ms));
}

pub fn advance_time(ms: u32) {
    CLOCK_MS.with(|c| c.set(c.get().wrapping_add(ms)));
}

pub fn sent_frames() -> Vec<Vec<u8>> {
    SENT.with(|s| s.borrow().clone())
}

pub fn clear_sent() {
    SENT.with(|s| s.borrow_mut().clear());
}

pub fn last_frame() -> Option<Vec<u8>> {
    SENT.with(|s| s.borrow().last().cloned())
}

// =============================================================================
// Well-known test addresses
// =============================================================================

/// `fe80::10`
pub const LOCAL_IP: Ipv6Addr = Ipv6Addr([
    0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x10,
]);

pub const LOCAL_MAC: MacAddr = MacAddr([0x00, 0xde, 0xad, 0xbe, 0xef, 0x01]);

/// `2001:db8::1`
pub const REMOTE_IP: Ipv6Addr = Ipv6Addr([
    0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01,
]);

pub const REMOTE_MAC: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

/// A fresh, initialized stack with a reset clock and empty capture.
pub fn fresh_stack() -> Stack<TestPlatform> {
    set_time(1_000);
    clear_sent();
    let stack = Stack::new();
    stack
        .init(&LOCAL_IP, &LOCAL_MAC)
        .expect("init should succeed");
    stack
}

/// A fresh stack with a directly connected host route and resolved
/// neighbor entry for [`REMOTE_IP`] — ready for egress tests.
pub fn stack_with_remote() -> Stack<TestPlatform> {
    let stack = fresh_stack();
    stack
        .add_route(&REMOTE_IP, 128, None, 1)
        .expect("route add should succeed");
    // Teach the neighbor cache via an inbound advertisement.
    let na = build_neighbor_advert_frame(&REMOTE_IP, &REMOTE_MAC);
    stack.process_rx(&na).expect("NA should process");
    clear_sent();
    stack
}

// =============================================================================
// Inbound frame builders
// =============================================================================

fn frame_shell(src_mac: &MacAddr, next_header: NextHeader, hop_limit: u8) -> Vec<u8> {
    let mut frame = vec![0u8; ETH_HEADER_LEN + IPV6_HEADER_LEN];
    EthHeader {
        dst: LOCAL_MAC,
        src: *src_mac,
        ethertype: ETHERTYPE_IPV6,
    }
    .write(&mut frame)
    .expect("eth header fits");
    // Payload length is patched by the caller once the payload is known.
    Ipv6Header {
        traffic_class: 0,
        flow_label: 0,
        payload_len: 0,
        next_header: next_header.as_u8(),
        hop_limit,
        src: REMOTE_IP,
        dst: LOCAL_IP,
    }
    .write(&mut frame[ETH_HEADER_LEN..])
    .expect("ipv6 header fits");
    frame
}

fn patch_lengths_and_checksum(
    frame: &mut [u8],
    next_header: NextHeader,
    checksum_offset: usize,
) {
    let upper_len = frame.len() - ETH_HEADER_LEN - IPV6_HEADER_LEN;
    frame[ETH_HEADER_LEN + 4..ETH_HEADER_LEN + 6]
        .copy_from_slice(&(upper_len as u16).to_be_bytes());

    let src = {
        let mut b = [0u8; 16];
        b.copy_from_slice(&frame[ETH_HEADER_LEN + 8..ETH_HEADER_LEN + 24]);
        Ipv6Addr(b)
    };
    let dst = {
        let mut b = [0u8; 16];
        b.copy_from_slice(&frame[ETH_HEADER_LEN + 24..ETH_HEADER_LEN + 40]);
        Ipv6Addr(b)
    };
    let l4_start = ETH_HEADER_LEN + IPV6_HEADER_LEN;
    let csum = wire::transport_checksum(&src, &dst, next_header, &frame[l4_start..]);
    let csum = if csum == 0 && next_header == NextHeader::Udp {
        0xffff
    } else {
        csum
    };
    frame[l4_start + checksum_offset..l4_start + checksum_offset + 2]
        .copy_from_slice(&csum.to_be_bytes());
}

/// A checksummed UDP datagram from [`REMOTE_IP`] to the local address.
pub fn build_udp_frame_to_local(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = frame_shell(&REMOTE_MAC, NextHeader::Udp, 64);
    let mut udp = vec![0u8; UDP_HEADER_LEN];
    UdpHeader {
        src_port,
        dst_port,
        length: (UDP_HEADER_LEN + payload.len()) as u16,
        checksum: 0,
    }
    .write(&mut udp)
    .expect("udp header fits");
    frame.extend_from_slice(&udp);
    frame.extend_from_slice(payload);
    patch_lengths_and_checksum(&mut frame, NextHeader::Udp, wire::UDP_CHECKSUM_OFFSET);
    frame
}

/// A checksummed TCP segment from [`REMOTE_IP`] to the local address.
pub fn build_tcp_frame_to_local(
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = frame_shell(&REMOTE_MAC, NextHeader::Tcp, 64);
    let mut tcp = vec![0u8; TCP_HEADER_LEN];
    TcpHeader {
        src_port,
        dst_port,
        seq_num: seq,
        ack_num: ack,
        data_offset: 5,
        flags,
        window_size: 4096,
        checksum: 0,
        urgent_ptr: 0,
    }
    .write(&mut tcp)
    .expect("tcp header fits");
    frame.extend_from_slice(&tcp);
    frame.extend_from_slice(payload);
    patch_lengths_and_checksum(&mut frame, NextHeader::Tcp, wire::TCP_CHECKSUM_OFFSET);
    frame
}

/// A checksummed ICMPv6 echo request addressed to the local unicast.
pub fn build_echo_request_frame(ident: u16, seq: u16, data: &[u8]) -> Vec<u8> {
    let mut frame = frame_shell(&REMOTE_MAC, NextHeader::Icmpv6, 64);
    let mut msg = vec![0u8; 8];
    msg[0] = crate::icmpv6::TYPE_ECHO_REQUEST;
    msg[4..6].copy_from_slice(&ident.to_be_bytes());
    msg[6..8].copy_from_slice(&seq.to_be_bytes());
    msg.extend_from_slice(data);
    frame.extend_from_slice(&msg);
    patch_lengths_and_checksum(&mut frame, NextHeader::Icmpv6, wire::ICMPV6_CHECKSUM_OFFSET);
    frame
}

/// A checksummed neighbor advertisement teaching `addr -> mac`.
pub fn build_neighbor_advert_frame(addr: &Ipv6Addr, mac: &MacAddr) -> Vec<u8> {
    let mut frame = frame_shell(mac, NextHeader::Icmpv6, 255);
    // NA source is the advertised neighbor itself.
    frame[ETH_HEADER_LEN + 8..ETH_HEADER_LEN + 24].copy_from_slice(&addr.0);
    let mut msg = vec![0u8; crate::icmpv6::NDP_MESSAGE_LEN];
    crate::icmpv6::build_neighbor_advert(&mut msg, addr, mac, false).expect("NA fits");
    frame.extend_from_slice(&msg);
    patch_lengths_and_checksum(&mut frame, NextHeader::Icmpv6, wire::ICMPV6_CHECKSUM_OFFSET);
    frame
}

/// A checksummed neighbor solicitation from [`REMOTE_IP`] asking for
/// `target`, carrying the sender's MAC in a source link-layer option.
pub fn build_neighbor_solicit_frame(target: &Ipv6Addr) -> Vec<u8> {
    let mut frame = frame_shell(&REMOTE_MAC, NextHeader::Icmpv6, 255);
    let mut msg = vec![0u8; crate::icmpv6::NDP_MESSAGE_LEN];
    crate::icmpv6::build_neighbor_solicit(&mut msg, target, &REMOTE_MAC).expect("NS fits");
    frame.extend_from_slice(&msg);
    patch_lengths_and_checksum(&mut frame, NextHeader::Icmpv6, wire::ICMPV6_CHECKSUM_OFFSET);
    frame
}

/// Parse the TCP header of a captured frame.
pub fn parse_sent_tcp(frame: &[u8]) -> TcpHeader {
    TcpHeader::parse(&frame[ETH_HEADER_LEN + IPV6_HEADER_LEN..]).expect("captured TCP parses")
}
