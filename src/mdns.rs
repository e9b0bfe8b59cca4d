//! mDNS service-discovery façade — TTL-indexed record cache plus
//! minimal announcement/query wire encoding.
//!
//! The actual DNS-SD responder is an external collaborator: nothing
//! here parses received mDNS traffic.  The façade caches announced
//! (local) and learned (remote) records, answers queries from that
//! cache, and emits periodic multicast announcements for local records
//! on the TTL schedule.  A query that misses the cache times out — by
//! design, not as a stopgap.

use log::debug;

use crate::config::MAX_MDNS_CACHE;
use crate::types::Ipv6Addr;

/// mDNS UDP port (RFC 6762).
pub const MDNS_PORT: u16 = 5353;

/// `ff02::fb` — the IPv6 mDNS multicast group.
pub const MDNS_GROUP: Ipv6Addr = Ipv6Addr([
    0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xfb,
]);

/// Longest service name accepted (bytes, unencoded).
pub const SERVICE_NAME_MAX: usize = 63;

/// DNS message header length.
const DNS_HEADER_LEN: usize = 12;
/// DNS header flags for an authoritative response (QR | AA).
const DNS_FLAGS_RESPONSE_AA: u16 = 0x8400;

/// Resource record types the façade emits or queries.
const TYPE_PTR: u16 = 12;
const TYPE_AAAA: u16 = 28;
const TYPE_SRV: u16 = 33;
/// Class IN.
const CLASS_IN: u16 = 0x0001;
/// Class IN with the mDNS cache-flush bit.
const CLASS_IN_FLUSH: u16 = 0x8001;

// =============================================================================
// MdnsRecord
// =============================================================================

/// One service record slot.
#[derive(Clone, Copy)]
pub struct MdnsRecord {
    name: [u8; SERVICE_NAME_MAX + 1],
    name_len: u8,
    /// Address the service resolves to.
    pub ipv6: Ipv6Addr,
    /// Service port.
    pub port: u16,
    /// Record lifetime in milliseconds.
    pub ttl_ms: u32,
    /// Stamp of the last sighting (announcement emission for local
    /// records).
    pub last_seen_ms: u32,
    /// Stamp of the last announcement emitted for this record.
    last_announced_ms: u32,
    /// `true` for services this node announced.
    pub local: bool,
    /// Slot occupancy flag.
    pub valid: bool,
}

impl MdnsRecord {
    const EMPTY: Self = Self {
        name: [0; SERVICE_NAME_MAX + 1],
        name_len: 0,
        ipv6: Ipv6Addr::UNSPECIFIED,
        port: 0,
        ttl_ms: 0,
        last_seen_ms: 0,
        last_announced_ms: 0,
        local: false,
        valid: false,
    };

    /// Service name.
    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }
}

// =============================================================================
// MdnsCache
// =============================================================================

/// Fixed cache of [`MAX_MDNS_CACHE`] service records.
pub struct MdnsCache {
    records: [MdnsRecord; MAX_MDNS_CACHE],
}

impl MdnsCache {
    /// An empty cache.
    pub const fn new() -> Self {
        Self {
            records: [MdnsRecord::EMPTY; MAX_MDNS_CACHE],
        }
    }

    /// Exact-name lookup among valid records.
    pub fn lookup(&self, name: &str) -> Option<MdnsRecord> {
        self.records
            .iter()
            .find(|r| r.valid && r.name() == name)
            .copied()
    }

    /// Insert or refresh a record; returns its slot index.
    ///
    /// An existing record with the same name is overwritten in place;
    /// otherwise the first free slot is taken, and with no free slot the
    /// record with the oldest `last_seen_ms` is evicted.  Names longer
    /// than [`SERVICE_NAME_MAX`] are truncated by the caller's
    /// validation before this point.
    pub fn insert(
        &mut self,
        name: &str,
        ipv6: &Ipv6Addr,
        port: u16,
        ttl_ms: u32,
        local: bool,
        now: u32,
    ) -> usize {
        let slot = self
            .records
            .iter()
            .position(|r| r.valid && r.name() == name)
            .or_else(|| self.records.iter().position(|r| !r.valid))
            .unwrap_or_else(|| {
                let mut oldest_idx = 0;
                let mut oldest = u32::MAX;
                for (i, r) in self.records.iter().enumerate() {
                    if r.last_seen_ms < oldest {
                        oldest = r.last_seen_ms;
                        oldest_idx = i;
                    }
                }
                oldest_idx
            });

        let record = &mut self.records[slot];
        let bytes = name.as_bytes();
        let len = bytes.len().min(SERVICE_NAME_MAX);
        record.name = [0; SERVICE_NAME_MAX + 1];
        record.name[..len].copy_from_slice(&bytes[..len]);
        record.name_len = len as u8;
        record.ipv6 = *ipv6;
        record.port = port;
        record.ttl_ms = ttl_ms;
        record.last_seen_ms = now;
        record.last_announced_ms = 0;
        record.local = local;
        record.valid = true;

        debug!("mdns: cached '{}' port {} ttl {}ms", name, port, ttl_ms);
        slot
    }

    /// Invalidate records whose TTL has lapsed.  Local records stay
    /// alive as long as the announcement schedule keeps refreshing
    /// `last_seen_ms`.
    pub fn age(&mut self, now: u32) {
        for record in self.records.iter_mut() {
            if record.valid && now.wrapping_sub(record.last_seen_ms) > record.ttl_ms {
                debug!("mdns: record '{}' expired", record.name());
                record.valid = false;
            }
        }
    }

    /// If slot `idx` holds a local record due for re-announcement
    /// (half its TTL since the last emission), stamp it announced and
    /// return a copy for the caller to put on the wire.
    pub fn due_announcement(&mut self, idx: usize, now: u32) -> Option<MdnsRecord> {
        let record = self.records.get_mut(idx)?;
        if !record.valid || !record.local {
            return None;
        }
        if record.last_announced_ms != 0
            && now.wrapping_sub(record.last_announced_ms) < record.ttl_ms / 2
        {
            return None;
        }
        record.last_announced_ms = now;
        record.last_seen_ms = now;
        Some(*record)
    }

    /// Number of valid records (diagnostic).
    pub fn record_count(&self) -> usize {
        self.records.iter().filter(|r| r.valid).count()
    }

    /// Clear every slot.
    pub fn reset(&mut self) {
        self.records = [MdnsRecord::EMPTY; MAX_MDNS_CACHE];
    }
}

// =============================================================================
// Wire encoding
// =============================================================================

/// Encode `name` as DNS labels (split on `.`, no compression).
/// Returns the encoded length including the root terminator.
fn encode_name(name: &str, out: &mut [u8]) -> Option<usize> {
    let mut pos = 0usize;
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        let bytes = label.as_bytes();
        if bytes.len() > 63 || pos + 1 + bytes.len() + 1 > out.len() {
            return None;
        }
        out[pos] = bytes.len() as u8;
        out[pos + 1..pos + 1 + bytes.len()].copy_from_slice(bytes);
        pos += 1 + bytes.len();
    }
    if pos >= out.len() {
        return None;
    }
    out[pos] = 0;
    Some(pos + 1)
}

fn write_u16(out: &mut [u8], pos: usize, val: u16) {
    out[pos..pos + 2].copy_from_slice(&val.to_be_bytes());
}

fn write_u32(out: &mut [u8], pos: usize, val: u32) {
    out[pos..pos + 4].copy_from_slice(&val.to_be_bytes());
}

/// Build the UDP payload of a service announcement: an authoritative
/// DNS response carrying an SRV record (port) and an AAAA record
/// (address) for the service name.  Returns the payload length.
pub fn build_announcement(record: &MdnsRecord, out: &mut [u8]) -> Option<usize> {
    if out.len() < DNS_HEADER_LEN {
        return None;
    }

    // Header: response, authoritative, two answers.
    write_u16(out, 0, 0);
    write_u16(out, 2, DNS_FLAGS_RESPONSE_AA);
    write_u16(out, 4, 0);
    write_u16(out, 6, 2);
    write_u16(out, 8, 0);
    write_u16(out, 10, 0);
    let mut pos = DNS_HEADER_LEN;

    let ttl_sec = record.ttl_ms / 1000;

    // SRV answer: priority 0, weight 0, port, target = service name.
    pos += encode_name(record.name(), out.get_mut(pos..)?)?;
    let mut target = [0u8; SERVICE_NAME_MAX + 2];
    let target_len = encode_name(record.name(), &mut target)?;
    if pos + 10 + 6 + target_len > out.len() {
        return None;
    }
    write_u16(out, pos, TYPE_SRV);
    write_u16(out, pos + 2, CLASS_IN_FLUSH);
    write_u32(out, pos + 4, ttl_sec);
    write_u16(out, pos + 8, (6 + target_len) as u16);
    pos += 10;
    write_u16(out, pos, 0);
    write_u16(out, pos + 2, 0);
    write_u16(out, pos + 4, record.port);
    pos += 6;
    out[pos..pos + target_len].copy_from_slice(&target[..target_len]);
    pos += target_len;

    // AAAA answer.
    pos += encode_name(record.name(), out.get_mut(pos..)?)?;
    if pos + 10 + 16 > out.len() {
        return None;
    }
    write_u16(out, pos, TYPE_AAAA);
    write_u16(out, pos + 2, CLASS_IN_FLUSH);
    write_u32(out, pos + 4, ttl_sec);
    write_u16(out, pos + 8, 16);
    pos += 10;
    out[pos..pos + 16].copy_from_slice(&record.ipv6.0);
    pos += 16;

    Some(pos)
}

/// Build the UDP payload of a one-shot PTR query for `name`.
/// Returns the payload length.
pub fn build_query(name: &str, out: &mut [u8]) -> Option<usize> {
    if out.len() < DNS_HEADER_LEN {
        return None;
    }

    write_u16(out, 0, 0);
    write_u16(out, 2, 0);
    write_u16(out, 4, 1);
    write_u16(out, 6, 0);
    write_u16(out, 8, 0);
    write_u16(out, 10, 0);
    let mut pos = DNS_HEADER_LEN;

    pos += encode_name(name, out.get_mut(pos..)?)?;
    if pos + 4 > out.len() {
        return None;
    }
    write_u16(out, pos, TYPE_PTR);
    write_u16(out, pos + 2, CLASS_IN);
    Some(pos + 4)
}
