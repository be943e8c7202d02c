//! IPv4 (layer 3) dispatch
//!
//! Validates the header (version, IHL, checksum, TTL, length), reassembles
//! in-order fragments, and demuxes by protocol number. This is a host
//! path: datagrams for other destinations are counted and dropped. The
//! TTL-decrement/incremental-checksum primitive for a forwarding plane is
//! provided on [Header].

use alloc::vec::Vec;
use arrayvec::ArrayVec;

use super::eth::ETYPE_IPV4;
use super::route::Table;
use super::{Dispatch as NetDispatch, DispatchStats, Handle, HandlerList, Protocol, SourceInfo, Type};
use crate::io::{ArrayRead, LimitedRead, Readable, Writeable};

/// IP protocol numbers used by this crate.
pub const PROTO_ICMP: u8 = 1;
pub const PROTO_UDP: u8 = 17;

pub const HDR_MIN: usize = 20;
const HDR_MAX: usize = 60;
const REASM_SLOTS: usize = 4;
const REASM_MAX: usize = 4096;
const TTL_DEFAULT: u8 = 64;

/// IPv4 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, PartialOrd, Ord)]
pub struct Addr(pub u32);

impl Addr {
    pub const ANY: Addr = Addr(0);
    pub const BROADCAST: Addr = Addr(0xFFFF_FFFF);

    pub const fn from_octets(o: [u8; 4]) -> Self {
        Addr(u32::from_be_bytes(o))
    }

    pub const fn octets(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        (self.0 >> 28) == 0xE
    }

    pub fn is_unicast(&self) -> bool {
        !self.is_broadcast() && !self.is_multicast() && self.0 != 0
    }
}

impl core::fmt::Display for Addr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let o = self.octets();
        write!(f, "{}.{}.{}.{}", o[0], o[1], o[2], o[3])
    }
}

/// Address plus prefix length, e.g. `10.1.0.0/16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    pub addr: Addr,
    pub prefix: u8,
}

impl Subnet {
    pub const fn new(addr: Addr, prefix: u8) -> Self {
        Subnet { addr, prefix }
    }

    pub fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix as u32)
        }
    }

    pub fn contains(&self, ip: Addr) -> bool {
        (ip.0 & self.mask()) == (self.addr.0 & self.mask())
    }
}

impl core::fmt::Display for Subnet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Accumulate the RFC 1071 ones-complement sum. Chunks must be
/// even-length except the final one.
pub fn checksum_add(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in chunks.by_ref() {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

/// Fold carries and complement.
pub fn checksum_finish(mut sum: u32) -> u16 {
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Internet checksum of a byte block.
pub fn checksum(data: &[u8]) -> u16 {
    checksum_finish(checksum_add(0, data))
}

/// Parsed IPv4 header. Options are accepted but opaque (skipped).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub ihl: u8,
    pub total_len: u16,
    pub ident: u16,
    pub flags_frag: u16,
    pub ttl: u8,
    pub proto: u8,
    pub checksum: u16,
    pub src: Addr,
    pub dst: Addr,
}

impl Header {
    pub fn new(proto: u8, src: Addr, dst: Addr, payload_len: usize, ident: u16, ttl: u8) -> Self {
        Header {
            ihl: 5,
            total_len: (HDR_MIN + payload_len) as u16,
            ident,
            flags_frag: 0,
            ttl,
            proto,
            checksum: 0,
            src,
            dst,
        }
    }

    pub const fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    pub const fn payload_len(&self) -> usize {
        self.total_len as usize - self.header_len()
    }

    pub const fn frag_offset_bytes(&self) -> usize {
        (self.flags_frag & 0x1FFF) as usize * 8
    }

    pub const fn more_fragments(&self) -> bool {
        self.flags_frag & 0x2000 != 0
    }

    pub const fn is_fragment(&self) -> bool {
        self.more_fragments() || self.frag_offset_bytes() != 0
    }

    fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < HDR_MIN {
            return None;
        }
        let ihl = raw[0] & 0x0F;
        if raw[0] >> 4 != 4 || ihl < 5 {
            return None;
        }
        Some(Header {
            ihl,
            total_len: u16::from_be_bytes([raw[2], raw[3]]),
            ident: u16::from_be_bytes([raw[4], raw[5]]),
            flags_frag: u16::from_be_bytes([raw[6], raw[7]]),
            ttl: raw[8],
            proto: raw[9],
            checksum: u16::from_be_bytes([raw[10], raw[11]]),
            src: Addr(u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]])),
            dst: Addr(u32::from_be_bytes([raw[16], raw[17], raw[18], raw[19]])),
        })
    }

    /// 20-byte options-free header with a valid checksum.
    pub fn to_bytes(&self) -> [u8; HDR_MIN] {
        let mut b = [0u8; HDR_MIN];
        b[0] = 0x45;
        b[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        b[4..6].copy_from_slice(&self.ident.to_be_bytes());
        b[6..8].copy_from_slice(&self.flags_frag.to_be_bytes());
        b[8] = self.ttl;
        b[9] = self.proto;
        b[12..16].copy_from_slice(&self.src.octets());
        b[16..20].copy_from_slice(&self.dst.octets());
        let sum = checksum(&b);
        b[10..12].copy_from_slice(&sum.to_be_bytes());
        b
    }

    pub fn write_to(&self, dst: &mut dyn Writeable) {
        dst.write_bytes(&self.to_bytes());
    }

    /// One forwarding hop: decrement TTL and update the checksum
    /// incrementally (RFC 1624) instead of recomputing it.
    pub fn forward_hop(&mut self) {
        self.ttl -= 1;
        // The TTL is the high byte of header word 4: the word decreases
        // by 0x0100, so the complement checksum increases by the same,
        // with end-around carry.
        let mut fixed = (self.checksum as u32) + 0x0100;
        while fixed > 0xFFFF {
            fixed = (fixed & 0xFFFF) + (fixed >> 16);
        }
        self.checksum = fixed as u16;
    }
}

#[derive(Debug)]
struct ReasmSlot {
    src: Addr,
    dst: Addr,
    id: u16,
    proto: u8,
    buf: Vec<u8>,
    next_offset: usize,
}

/// In-order reassembly: one in-flight datagram per (source, ident); any
/// out-of-order or overlapping fragment abandons the whole datagram.
#[derive(Debug, Default)]
struct Reassembly {
    slots: ArrayVec<ReasmSlot, REASM_SLOTS>,
}

enum ReasmVerdict {
    Incomplete,
    Complete(ReasmSlot),
    Dropped,
}

impl Reassembly {
    fn push(&mut self, hdr: &Header, payload: &[u8]) -> ReasmVerdict {
        let key = |s: &ReasmSlot| s.src == hdr.src && s.id == hdr.ident;
        let offset = hdr.frag_offset_bytes();

        let slot_idx = self.slots.iter().position(key);
        match (slot_idx, offset) {
            (None, 0) => {
                if payload.len() + offset > REASM_MAX || self.slots.is_full() {
                    return ReasmVerdict::Dropped;
                }
                let mut buf = Vec::with_capacity(REASM_MAX.min(hdr.total_len as usize * 2));
                buf.extend_from_slice(payload);
                self.slots.push(ReasmSlot {
                    src: hdr.src,
                    dst: hdr.dst,
                    id: hdr.ident,
                    proto: hdr.proto,
                    buf,
                    next_offset: payload.len(),
                });
                ReasmVerdict::Incomplete
            }
            (None, _) => ReasmVerdict::Dropped, // Tail without a head.
            (Some(i), offset) => {
                let slot = &mut self.slots[i];
                if offset != slot.next_offset
                    || hdr.proto != slot.proto
                    || slot.buf.len() + payload.len() > REASM_MAX
                {
                    // Out-of-order, overlapping, or oversized: abandon.
                    self.slots.remove(i);
                    return ReasmVerdict::Dropped;
                }
                slot.buf.extend_from_slice(payload);
                slot.next_offset += payload.len();
                if hdr.more_fragments() {
                    ReasmVerdict::Incomplete
                } else {
                    ReasmVerdict::Complete(self.slots.remove(i))
                }
            }
        }
    }
}

/// Reply context the IP layer presents to its handlers.
struct IpIface<'a> {
    lower: &'a mut dyn NetDispatch,
    local: Addr,
    remote: Addr,
    dst: Addr,
    ident: u16,
    ttl: u8,
}

impl NetDispatch for IpIface<'_> {
    fn open_reply(&mut self, rtype: Type, len: usize) -> Option<&mut dyn Writeable> {
        let total = HDR_MIN + len;
        let hdr = Header::new(
            rtype.value() as u8,
            self.local,
            self.remote,
            len,
            self.ident,
            self.ttl,
        );
        let wr = self.lower.open_reply(Type::from_u16(ETYPE_IPV4), total)?;
        hdr.write_to(wr);
        Some(wr)
    }

    fn source(&self) -> SourceInfo {
        SourceInfo {
            ip: Some((self.remote, self.dst)),
            local_ip: Some(self.local),
            ..self.lower.source()
        }
    }
}

/// IPv4 datagram demultiplexer; a [Protocol] child of the Ethernet
/// dispatch.
pub struct Dispatch {
    local: Addr,
    routes: Table,
    handlers: HandlerList,
    reasm: Reassembly,
    stats: DispatchStats,
    ident: u16,
    ttl_default: u8,
}

impl Dispatch {
    pub fn new(local: Addr) -> Self {
        Dispatch {
            local,
            routes: Table::new(),
            handlers: HandlerList::new(),
            reasm: Reassembly::default(),
            stats: DispatchStats::default(),
            ident: 1,
            ttl_default: TTL_DEFAULT,
        }
    }

    pub fn addr(&self) -> Addr {
        self.local
    }

    pub fn set_addr(&mut self, addr: Addr) {
        self.local = addr;
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn routes(&self) -> &Table {
        &self.routes
    }

    pub fn routes_mut(&mut self) -> &mut Table {
        &mut self.routes
    }

    pub fn register<P: Protocol>(&mut self, proto: P) -> Handle<P> {
        self.handlers.register(proto)
    }

    pub fn unregister<P>(&mut self, handle: Handle<P>) -> bool {
        self.handlers.unregister(handle)
    }

    pub fn protocol_mut<P: Protocol>(&mut self, handle: Handle<P>) -> Option<&mut P> {
        self.handlers.get_mut(handle)
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerList {
        &mut self.handlers
    }

    /// Next ident value for an outgoing datagram.
    pub fn next_ident(&mut self) -> u16 {
        let id = self.ident;
        self.ident = self.ident.wrapping_add(1);
        id
    }

    pub fn ttl_default(&self) -> u8 {
        self.ttl_default
    }

    fn accept(&self, dst: Addr) -> bool {
        dst == self.local || dst.is_broadcast() || dst.is_multicast()
    }
}

impl Protocol for Dispatch {
    fn net_type(&self) -> Type {
        Type::from_u16(ETYPE_IPV4)
    }

    fn frame_rcvd(&mut self, src: &mut LimitedRead<'_>, iface: &mut dyn NetDispatch) {
        let mut raw = [0u8; HDR_MAX];
        if !src.read_bytes(&mut raw[..HDR_MIN]) {
            self.stats.count_malformed();
            return;
        }
        let ihl_bytes = ((raw[0] & 0x0F) as usize) * 4;
        if ihl_bytes > HDR_MIN && !src.read_bytes(&mut raw[HDR_MIN..ihl_bytes]) {
            self.stats.count_malformed();
            return;
        }
        let Some(hdr) = Header::parse(&raw[..ihl_bytes.max(HDR_MIN)]) else {
            self.stats.count_malformed();
            return;
        };
        if checksum(&raw[..ihl_bytes]) != 0
            || hdr.ttl == 0
            || (hdr.total_len as usize) < ihl_bytes
            || hdr.payload_len() > src.get_read_ready()
        {
            self.stats.count_malformed();
            return;
        }
        if !self.accept(hdr.dst) {
            self.stats.count_filtered();
            return;
        }

        let payload_len = hdr.payload_len();
        if hdr.is_fragment() {
            // Stage the fragment payload, then reassemble.
            let mut chunk = [0u8; 1600];
            if payload_len > chunk.len() || !src.read_bytes(&mut chunk[..payload_len]) {
                self.stats.count_malformed();
                return;
            }
            match self.reasm.push(&hdr, &chunk[..payload_len]) {
                ReasmVerdict::Incomplete => {}
                ReasmVerdict::Dropped => {
                    log::debug!("Reassembly dropped datagram from {}", hdr.src);
                    self.stats.count_malformed();
                }
                ReasmVerdict::Complete(slot) => {
                    let mut rd = ArrayRead::new(&slot.buf);
                    let len = slot.buf.len();
                    let mut payload = LimitedRead::new(&mut rd, len);
                    let mut up = IpIface {
                        lower: iface,
                        local: self.local,
                        remote: slot.src,
                        dst: slot.dst,
                        ident: self.ident,
                        ttl: self.ttl_default,
                    };
                    self.ident = self.ident.wrapping_add(1);
                    if self
                        .handlers
                        .deliver(&[Type::from_u8(slot.proto)], &mut payload, &mut up)
                    {
                        self.stats.count_delivered();
                    } else {
                        self.stats.count_no_match();
                    }
                }
            }
            return;
        }

        let mut payload = LimitedRead::new(src, payload_len);
        let mut up = IpIface {
            lower: iface,
            local: self.local,
            remote: hdr.src,
            dst: hdr.dst,
            ident: self.ident,
            ttl: self.ttl_default,
        };
        self.ident = self.ident.wrapping_add(1);
        if self
            .handlers
            .deliver(&[Type::from_u8(hdr.proto)], &mut payload, &mut up)
        {
            self.stats.count_delivered();
        } else {
            self.stats.count_no_match();
        }
        payload.read_finalize();
    }

    fn as_any(&mut self) -> &mut dyn core::any::Any {
        self
    }
}
