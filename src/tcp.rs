//! TCP-Lite — fixed connection table and reduced RFC 793 state machine.
//!
//! The simplifications that make this "Lite": no window scaling, no
//! SACK, no delayed ACK, no congestion control, segmentation capped at
//! one MSS, and a single retransmission timer per connection backed by
//! one MSS-sized slot holding the most recent unacknowledged segment.
//! TIME_WAIT is collapsed into the connection inactivity timeout that
//! the periodic sweep enforces.
//!
//! This module is pure protocol logic: state transitions consume parsed
//! headers and produce [`SegmentOut`] descriptors.  The stack layer
//! renders those into wire frames and drives the transmit hook — the
//! table never performs I/O.
//!
//! A connection handle is the slot index.  A slot is reused only after
//! its occupant reaches `Closed`; every public operation re-validates
//! the handle against the slot's `in_use` flag.

use log::debug;

use crate::config::{MAX_TCP_CONNECTIONS, TCP_MAX_RETRIES, TCP_MSS, TCP_TIMEOUT_MS, TCP_WINDOW_SIZE};
use crate::types::{Ipv6Addr, MacAddr, NetError};
use crate::wire::{TcpFlags, TcpHeader};

// =============================================================================
// Sequence arithmetic (RFC 793 §3.3, wrapping)
// =============================================================================

/// `a` is strictly before `b` in sequence space.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a` is at or before `b` in sequence space.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// `a` is strictly after `b` in sequence space.
#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// `a` is at or after `b` in sequence space.
#[inline]
pub fn seq_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

// =============================================================================
// TcpState
// =============================================================================

/// Connection state, reduced RFC 793 graph.
///
/// `FinWait` covers both FIN_WAIT_1 and FIN_WAIT_2; `Closing` also
/// covers the LAST_ACK role after a close from `CloseWait`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait,
    CloseWait,
    Closing,
    TimeWait,
}

impl TcpState {
    /// Human-readable name for logging.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynRcvd => "SYN_RCVD",
            Self::Established => "ESTABLISHED",
            Self::FinWait => "FIN_WAIT",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::TimeWait => "TIME_WAIT",
        }
    }

    /// `true` if the connection may carry outbound data.
    #[inline]
    pub const fn can_send(self) -> bool {
        matches!(self, Self::Established | Self::CloseWait)
    }
}

// =============================================================================
// TcpConnection
// =============================================================================

/// One connection table slot.
#[derive(Clone, Copy, Debug)]
pub struct TcpConnection {
    pub local_addr: Ipv6Addr,
    pub remote_addr: Ipv6Addr,
    pub local_port: u16,
    pub remote_port: u16,

    pub state: TcpState,

    /// Next sequence number to send.
    pub send_next: u32,
    /// Oldest unacknowledged sequence number.
    pub send_unacked: u32,
    /// Next expected receive sequence number.
    pub recv_next: u32,

    /// Peer's advertised window.
    pub send_window: u16,
    /// Window we advertise.
    pub recv_window: u16,

    /// Retransmissions of the armed segment so far.
    pub retransmit_count: u8,
    /// Stamp of the last send, receive, or state change.
    pub last_activity_ms: u32,

    /// Next-hop MAC resolved when the connection was opened (or gleaned
    /// from the peer's SYN); egress falls back to this when the neighbor
    /// cache has aged the entry out.
    pub remote_mac: MacAddr,

    /// Slot occupancy flag.
    pub in_use: bool,
}

impl TcpConnection {
    const EMPTY: Self = Self {
        local_addr: Ipv6Addr::UNSPECIFIED,
        remote_addr: Ipv6Addr::UNSPECIFIED,
        local_port: 0,
        remote_port: 0,
        state: TcpState::Closed,
        send_next: 0,
        send_unacked: 0,
        recv_next: 0,
        send_window: 0,
        recv_window: TCP_WINDOW_SIZE,
        retransmit_count: 0,
        last_activity_ms: 0,
        remote_mac: MacAddr::ZERO,
        in_use: false,
    };
}

// =============================================================================
// RetransmitSlot
// =============================================================================

/// The single retransmission slot of a connection: the most recent
/// unacknowledged segment (control or data), re-emitted by the periodic
/// task until acknowledged or the retry cap is hit.
pub struct RetransmitSlot {
    data: [u8; TCP_MSS],
    len: u16,
    pub seq: u32,
    pub flags: TcpFlags,
    pub pending: bool,
    pub sent_ms: u32,
}

impl RetransmitSlot {
    const fn new() -> Self {
        Self {
            data: [0; TCP_MSS],
            len: 0,
            seq: 0,
            flags: TcpFlags::empty(),
            pending: false,
            sent_ms: 0,
        }
    }

    /// Arm the slot with a freshly transmitted segment.
    fn arm(&mut self, seq: u32, flags: TcpFlags, payload: &[u8], now: u32) {
        let len = payload.len().min(TCP_MSS);
        self.data[..len].copy_from_slice(&payload[..len]);
        self.len = len as u16;
        self.seq = seq;
        self.flags = flags;
        self.pending = true;
        self.sent_ms = now;
    }

    fn clear(&mut self) {
        self.len = 0;
        self.pending = false;
        self.flags = TcpFlags::empty();
    }

    /// Buffered payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// First sequence number *after* this segment (SYN and FIN each
    /// consume one).
    pub fn end_seq(&self) -> u32 {
        let mut consumed = self.len as u32;
        if self.flags.contains(TcpFlags::SYN) {
            consumed = consumed.wrapping_add(1);
        }
        if self.flags.contains(TcpFlags::FIN) {
            consumed = consumed.wrapping_add(1);
        }
        self.seq.wrapping_add(consumed)
    }
}

// =============================================================================
// SegmentOut
// =============================================================================

/// A segment the state machine wants transmitted.  The stack layer
/// attaches addresses from the connection and renders the frame.
#[derive(Clone, Copy, Debug)]
pub struct SegmentOut {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
}

/// Outcome of polling a connection's retransmission timer.
pub enum RetransmitPoll {
    /// Nothing due.
    Idle,
    /// Re-emit the armed segment (payload read from the slot).
    Emit(SegmentOut),
    /// Retry cap exceeded — the connection was torn down.
    GaveUp,
}

// =============================================================================
// TcpTable
// =============================================================================

/// Fixed table of [`MAX_TCP_CONNECTIONS`] connections with their
/// retransmission slots (kept in a parallel array so the connection
/// struct stays copyable and cheap to reset).
pub struct TcpTable {
    conns: [TcpConnection; MAX_TCP_CONNECTIONS],
    rtx: [RetransmitSlot; MAX_TCP_CONNECTIONS],
}

impl TcpTable {
    /// An empty table.
    pub const fn new() -> Self {
        Self {
            conns: [TcpConnection::EMPTY; MAX_TCP_CONNECTIONS],
            rtx: [const { RetransmitSlot::new() }; MAX_TCP_CONNECTIONS],
        }
    }

    // =========================================================================
    // Slot access
    // =========================================================================

    /// The connection in slot `idx`, if occupied.
    pub fn conn(&self, idx: usize) -> Option<&TcpConnection> {
        self.conns.get(idx).filter(|c| c.in_use)
    }

    /// Mutable access to the connection in slot `idx`, if occupied.
    pub fn conn_mut(&mut self, idx: usize) -> Option<&mut TcpConnection> {
        self.conns.get_mut(idx).filter(|c| c.in_use)
    }

    /// Retransmission slot for connection `idx`.
    pub fn rtx(&self, idx: usize) -> &RetransmitSlot {
        &self.rtx[idx]
    }

    fn find_free(&self) -> Option<usize> {
        self.conns.iter().position(|c| !c.in_use)
    }

    /// Release slot `idx` back to `Closed`.
    pub fn release(&mut self, idx: usize) {
        if let Some(conn) = self.conns.get_mut(idx) {
            if conn.in_use {
                debug!("tcp: conn {} {} -> CLOSED (released)", idx, conn.state.name());
            }
            *conn = TcpConnection::EMPTY;
        }
        if let Some(slot) = self.rtx.get_mut(idx) {
            slot.clear();
        }
    }

    /// Number of occupied slots (diagnostic).
    pub fn active_count(&self) -> usize {
        self.conns.iter().filter(|c| c.in_use).count()
    }

    /// Clear every slot.
    pub fn reset(&mut self) {
        for i in 0..MAX_TCP_CONNECTIONS {
            self.conns[i] = TcpConnection::EMPTY;
            self.rtx[i].clear();
        }
    }

    /// Find the connection owning an inbound segment: exact four-tuple
    /// match first, then a listening slot on the destination port.
    pub fn lookup_segment(
        &self,
        local_port: u16,
        remote_addr: &Ipv6Addr,
        remote_port: u16,
    ) -> Option<usize> {
        for (i, conn) in self.conns.iter().enumerate() {
            if conn.in_use
                && conn.state != TcpState::Listen
                && conn.local_port == local_port
                && conn.remote_port == remote_port
                && conn.remote_addr == *remote_addr
            {
                return Some(i);
            }
        }
        for (i, conn) in self.conns.iter().enumerate() {
            if conn.in_use && conn.state == TcpState::Listen && conn.local_port == local_port {
                return Some(i);
            }
        }
        None
    }

    fn tuple_in_use(&self, local_port: u16, remote_addr: &Ipv6Addr, remote_port: u16) -> bool {
        self.conns.iter().any(|c| {
            c.in_use
                && c.local_port == local_port
                && c.remote_port == remote_port
                && c.remote_addr == *remote_addr
        })
    }

    // =========================================================================
    // Active and passive open
    // =========================================================================

    /// Active open: claim a slot, populate it, transition
    /// `Closed -> SynSent`, and return the slot with the SYN to emit.
    ///
    /// The SYN is armed in the retransmission slot so the periodic task
    /// re-emits it until the SYN+ACK arrives or the retry cap closes the
    /// connection.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &mut self,
        local_addr: &Ipv6Addr,
        remote_addr: &Ipv6Addr,
        local_port: u16,
        remote_port: u16,
        remote_mac: &MacAddr,
        isn: u32,
        now: u32,
    ) -> Result<(usize, SegmentOut), NetError> {
        if self.tuple_in_use(local_port, remote_addr, remote_port) {
            return Err(NetError::InvalidParam);
        }
        let idx = self.find_free().ok_or(NetError::NoBuffer)?;

        let conn = &mut self.conns[idx];
        *conn = TcpConnection {
            local_addr: *local_addr,
            remote_addr: *remote_addr,
            local_port,
            remote_port,
            state: TcpState::SynSent,
            send_next: isn.wrapping_add(1),
            send_unacked: isn,
            recv_next: 0,
            send_window: 0,
            recv_window: TCP_WINDOW_SIZE,
            retransmit_count: 0,
            last_activity_ms: now,
            remote_mac: *remote_mac,
            in_use: true,
        };
        self.rtx[idx].arm(isn, TcpFlags::SYN, &[], now);

        debug!(
            "tcp: conn {} CLOSED -> SYN_SENT [{}]:{} -> [{}]:{}",
            idx, local_addr, local_port, remote_addr, remote_port
        );

        Ok((
            idx,
            SegmentOut {
                seq: isn,
                ack: 0,
                flags: TcpFlags::SYN,
                window: TCP_WINDOW_SIZE,
            },
        ))
    }

    /// Passive open: claim a slot in `Listen` on `local_port`.
    pub fn listen(
        &mut self,
        local_addr: &Ipv6Addr,
        local_port: u16,
        now: u32,
    ) -> Result<usize, NetError> {
        if self
            .conns
            .iter()
            .any(|c| c.in_use && c.local_port == local_port)
        {
            return Err(NetError::InvalidParam);
        }
        let idx = self.find_free().ok_or(NetError::NoBuffer)?;

        let conn = &mut self.conns[idx];
        *conn = TcpConnection {
            local_addr: *local_addr,
            local_port,
            state: TcpState::Listen,
            last_activity_ms: now,
            ..TcpConnection::EMPTY
        };
        conn.in_use = true;

        debug!("tcp: conn {} LISTEN on port {}", idx, local_port);
        Ok(idx)
    }

    // =========================================================================
    // Outbound data bookkeeping
    // =========================================================================

    /// Record an outbound segment: advance `send_next` past the payload
    /// (plus SYN/FIN consumption), stamp activity, arm the
    /// retransmission slot, and return the segment descriptor.
    pub fn record_segment(
        &mut self,
        idx: usize,
        payload: &[u8],
        flags: TcpFlags,
        now: u32,
    ) -> SegmentOut {
        let conn = &mut self.conns[idx];
        let seq = conn.send_next;

        let mut consumed = payload.len() as u32;
        if flags.contains(TcpFlags::SYN) {
            consumed = consumed.wrapping_add(1);
        }
        if flags.contains(TcpFlags::FIN) {
            consumed = consumed.wrapping_add(1);
        }
        conn.send_next = seq.wrapping_add(consumed);
        conn.last_activity_ms = now;
        conn.retransmit_count = 0;

        self.rtx[idx].arm(seq, flags, payload, now);

        SegmentOut {
            seq,
            ack: conn.recv_next,
            flags,
            window: conn.recv_window,
        }
    }

    // =========================================================================
    // Inbound segment processing
    // =========================================================================

    /// Drive the state machine for an inbound segment owned by slot
    /// `idx`.  Returns the reply segment to emit, if any.
    ///
    /// Payload bytes are acknowledged and discarded: TCP-Lite has no
    /// receive delivery surface, inbound data only advances `recv_next`.
    pub fn on_segment(
        &mut self,
        idx: usize,
        src_addr: &Ipv6Addr,
        src_mac: &MacAddr,
        hdr: &TcpHeader,
        payload_len: usize,
        isn: u32,
        now: u32,
    ) -> Option<SegmentOut> {
        let conn = &mut self.conns[idx];
        conn.last_activity_ms = now;

        // A valid RST kills everything except a listener.
        if hdr.flags.contains(TcpFlags::RST) {
            if conn.state != TcpState::Listen {
                debug!("tcp: conn {} {} -> CLOSED (RST)", idx, conn.state.name());
                self.release(idx);
            }
            return None;
        }

        conn.send_window = hdr.window_size;

        match conn.state {
            TcpState::Listen => {
                if !hdr.flags.contains(TcpFlags::SYN) || hdr.flags.contains(TcpFlags::ACK) {
                    return None;
                }
                // The listener becomes the connection (single-slot
                // accept — no backlog in a four-slot table).
                conn.remote_addr = *src_addr;
                conn.remote_port = hdr.src_port;
                conn.remote_mac = *src_mac;
                conn.recv_next = hdr.seq_num.wrapping_add(1);
                conn.send_unacked = isn;
                conn.send_next = isn.wrapping_add(1);
                conn.state = TcpState::SynRcvd;
                debug!(
                    "tcp: conn {} LISTEN -> SYN_RCVD from [{}]:{}",
                    idx, src_addr, hdr.src_port
                );
                self.rtx[idx].arm(isn, TcpFlags::SYN | TcpFlags::ACK, &[], now);
                Some(SegmentOut {
                    seq: isn,
                    ack: hdr.seq_num.wrapping_add(1),
                    flags: TcpFlags::SYN | TcpFlags::ACK,
                    window: TCP_WINDOW_SIZE,
                })
            }

            TcpState::SynSent => {
                if !(hdr.flags.contains(TcpFlags::SYN) && hdr.flags.contains(TcpFlags::ACK)) {
                    return None;
                }
                if hdr.ack_num != conn.send_next {
                    debug!("tcp: conn {} SYN_SENT bad ack {}", idx, hdr.ack_num);
                    return None;
                }
                conn.send_unacked = hdr.ack_num;
                conn.recv_next = hdr.seq_num.wrapping_add(1);
                conn.state = TcpState::Established;
                let reply = SegmentOut {
                    seq: conn.send_next,
                    ack: conn.recv_next,
                    flags: TcpFlags::ACK,
                    window: conn.recv_window,
                };
                self.rtx[idx].clear();
                self.conns[idx].retransmit_count = 0;
                debug!("tcp: conn {} SYN_SENT -> ESTABLISHED", idx);
                Some(reply)
            }

            TcpState::SynRcvd => {
                if hdr.flags.contains(TcpFlags::ACK) && hdr.ack_num == conn.send_next {
                    conn.send_unacked = hdr.ack_num;
                    conn.state = TcpState::Established;
                    self.rtx[idx].clear();
                    self.conns[idx].retransmit_count = 0;
                    debug!("tcp: conn {} SYN_RCVD -> ESTABLISHED", idx);
                }
                None
            }

            TcpState::Established | TcpState::CloseWait => {
                let mut need_ack = false;
                Self::process_ack(&mut self.conns[idx], &mut self.rtx[idx], hdr);

                let conn = &mut self.conns[idx];
                if payload_len > 0 {
                    if hdr.seq_num == conn.recv_next {
                        conn.recv_next = conn.recv_next.wrapping_add(payload_len as u32);
                    }
                    // In-order data is acknowledged; anything else gets a
                    // duplicate ACK carrying the expected sequence.
                    need_ack = true;
                }

                if hdr.flags.contains(TcpFlags::FIN) {
                    if conn.state == TcpState::Established {
                        conn.recv_next = conn.recv_next.wrapping_add(1);
                        conn.state = TcpState::CloseWait;
                        debug!("tcp: conn {} ESTABLISHED -> CLOSE_WAIT (FIN)", idx);
                    }
                    // A retransmitted FIN in CloseWait is re-acknowledged.
                    need_ack = true;
                }

                need_ack.then(|| SegmentOut {
                    seq: conn.send_next,
                    ack: conn.recv_next,
                    flags: TcpFlags::ACK,
                    window: conn.recv_window,
                })
            }

            TcpState::FinWait => {
                Self::process_ack(&mut self.conns[idx], &mut self.rtx[idx], hdr);
                let conn = &mut self.conns[idx];
                let fin_acked = seq_ge(conn.send_unacked, conn.send_next);

                if hdr.flags.contains(TcpFlags::FIN) {
                    if payload_len > 0 && hdr.seq_num == conn.recv_next {
                        conn.recv_next = conn.recv_next.wrapping_add(payload_len as u32);
                    }
                    conn.recv_next = conn.recv_next.wrapping_add(1);
                    conn.state = if fin_acked {
                        TcpState::TimeWait
                    } else {
                        TcpState::Closing
                    };
                    debug!("tcp: conn {} FIN_WAIT -> {}", idx, conn.state.name());
                    return Some(SegmentOut {
                        seq: conn.send_next,
                        ack: conn.recv_next,
                        flags: TcpFlags::ACK,
                        window: conn.recv_window,
                    });
                }
                None
            }

            TcpState::Closing => {
                Self::process_ack(&mut self.conns[idx], &mut self.rtx[idx], hdr);
                let conn = &mut self.conns[idx];
                if seq_ge(conn.send_unacked, conn.send_next) {
                    conn.state = TcpState::TimeWait;
                    debug!("tcp: conn {} CLOSING -> TIME_WAIT", idx);
                }
                None
            }

            TcpState::TimeWait => {
                // Re-ACK retransmitted FINs until the idle timeout
                // collapses the slot.
                hdr.flags.contains(TcpFlags::FIN).then(|| SegmentOut {
                    seq: conn.send_next,
                    ack: conn.recv_next,
                    flags: TcpFlags::ACK,
                    window: conn.recv_window,
                })
            }

            TcpState::Closed => None,
        }
    }

    /// Advance `send_unacked` for an acceptable ACK and retire the armed
    /// retransmission segment once it is fully covered.
    fn process_ack(conn: &mut TcpConnection, rtx: &mut RetransmitSlot, hdr: &TcpHeader) {
        if !hdr.flags.contains(TcpFlags::ACK) {
            return;
        }
        if seq_gt(hdr.ack_num, conn.send_unacked) && seq_le(hdr.ack_num, conn.send_next) {
            conn.send_unacked = hdr.ack_num;
            if rtx.pending && seq_ge(hdr.ack_num, rtx.end_seq()) {
                rtx.clear();
                conn.retransmit_count = 0;
            }
        }
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Begin teardown of slot `idx`.
    ///
    /// `Established -> FinWait` and `CloseWait -> Closing` emit a FIN
    /// (returned for the stack to transmit and armed for retransmission);
    /// every other state drops straight to `Closed` and releases the
    /// slot.
    pub fn begin_close(&mut self, idx: usize, now: u32) -> Option<SegmentOut> {
        let state = self.conns[idx].state;
        match state {
            TcpState::Established | TcpState::CloseWait => {
                let next = if state == TcpState::Established {
                    TcpState::FinWait
                } else {
                    TcpState::Closing
                };
                self.conns[idx].state = next;
                debug!("tcp: conn {} {} -> {}", idx, state.name(), next.name());
                let seg = self.record_segment(idx, &[], TcpFlags::FIN | TcpFlags::ACK, now);
                Some(seg)
            }
            _ => {
                self.release(idx);
                None
            }
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Tear down connections idle past
    /// [`TCP_TIMEOUT_MS`](crate::config::TCP_TIMEOUT_MS).  Returns the
    /// number of forced closes.
    pub fn age(&mut self, now: u32) -> u32 {
        let mut closed = 0;
        for idx in 0..MAX_TCP_CONNECTIONS {
            let conn = &self.conns[idx];
            if conn.in_use
                && conn.state != TcpState::Listen
                && now.wrapping_sub(conn.last_activity_ms) > TCP_TIMEOUT_MS
            {
                debug!("tcp: conn {} {} timed out", idx, conn.state.name());
                self.release(idx);
                closed += 1;
            }
        }
        closed
    }

    /// Poll the retransmission timer of slot `idx`.
    ///
    /// A due segment is re-emitted until acknowledged; past
    /// [`TCP_MAX_RETRIES`](crate::config::TCP_MAX_RETRIES) the
    /// connection is torn down.
    pub fn retransmit_poll(&mut self, idx: usize, now: u32) -> RetransmitPoll {
        if !self.conns[idx].in_use || !self.rtx[idx].pending {
            return RetransmitPoll::Idle;
        }
        if now.wrapping_sub(self.rtx[idx].sent_ms) <= TCP_TIMEOUT_MS {
            return RetransmitPoll::Idle;
        }

        if self.conns[idx].retransmit_count >= TCP_MAX_RETRIES {
            debug!("tcp: conn {} retry cap hit, closing", idx);
            self.release(idx);
            return RetransmitPoll::GaveUp;
        }

        let conn = &mut self.conns[idx];
        conn.retransmit_count += 1;
        conn.last_activity_ms = now;
        let rtx = &mut self.rtx[idx];
        rtx.sent_ms = now;

        debug!(
            "tcp: conn {} retransmit {}/{} seq {}",
            idx, conn.retransmit_count, TCP_MAX_RETRIES, rtx.seq
        );

        RetransmitPoll::Emit(SegmentOut {
            seq: rtx.seq,
            ack: conn.recv_next,
            flags: rtx.flags,
            window: conn.recv_window,
        })
    }
}
