//! Ethernet (layer 2) dispatch
//!
//! Parses destination/source MAC, an optional 802.1Q tag, and the
//! EtherType, then demuxes to registered protocols by EtherType (VLAN
//! handlers may register on the (VID, EtherType) pair, which wins over a
//! plain EtherType registration only by being registered later). Frames
//! not addressed to this node are filtered unless promiscuous mode is on.

use alloc::boxed::Box;
use arrayvec::ArrayVec;

use super::{Dispatch as NetDispatch, DispatchStats, Handle, HandlerList, Protocol, SourceInfo, Type};
use crate::io::{LimitedRead, Readable, Writeable};

/// Well-known EtherType values used by this crate.
pub const ETYPE_IPV4: u16 = 0x0800;
pub const ETYPE_ARP: u16 = 0x0806;
pub const ETYPE_VLAN: u16 = 0x8100;
pub const ETYPE_PTP: u16 = 0x88F7;
/// ConfigBus remote command / acknowledge frames.
pub const ETYPE_CFGBUS_CMD: u16 = 0x5C01;
pub const ETYPE_CFGBUS_ACK: u16 = 0x5C02;

const HDR_LEN: usize = 14;
const VLAN_HDR_LEN: usize = 18;
const MAX_MCAST: usize = 8;

/// 48-bit hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group bit set, broadcast included.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_unicast(&self) -> bool {
        !self.is_multicast()
    }
}

impl core::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// 802.1Q tag control word (PCP + DEI + VID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct VlanTag(pub u16);

impl VlanTag {
    pub fn new(vid: u16, pcp: u8) -> Self {
        VlanTag(((pcp as u16) << 13) | (vid & 0x0FFF))
    }

    pub fn vid(&self) -> u16 {
        self.0 & 0x0FFF
    }

    pub fn pcp(&self) -> u8 {
        (self.0 >> 13) as u8
    }
}

/// Parsed Ethernet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub vlan: Option<VlanTag>,
    pub etype: u16,
}

impl Header {
    pub fn read_from(src: &mut dyn Readable) -> Option<Self> {
        let mut addrs = [0u8; 12];
        if !src.read_bytes(&mut addrs) {
            return None;
        }
        let dst = MacAddr(addrs[0..6].try_into().unwrap());
        let sa = MacAddr(addrs[6..12].try_into().unwrap());
        let mut etype = src.read_u16()?;
        let mut vlan = None;
        if etype == ETYPE_VLAN {
            vlan = Some(VlanTag(src.read_u16()?));
            etype = src.read_u16()?;
        }
        Some(Header { dst, src: sa, vlan, etype })
    }

    pub fn write_to(&self, dst: &mut dyn Writeable) {
        dst.write_bytes(&self.dst.0);
        dst.write_bytes(&self.src.0);
        if let Some(tag) = self.vlan {
            dst.write_u16(ETYPE_VLAN);
            dst.write_u16(tag.0);
        }
        dst.write_u16(self.etype);
    }

    pub fn wire_len(&self) -> usize {
        if self.vlan.is_some() {
            VLAN_HDR_LEN
        } else {
            HDR_LEN
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ReplyLatch {
    mac: MacAddr,
    vlan: Option<VlanTag>,
}

/// Transmit half of the Ethernet dispatch: the port writer, the local
/// address, and the latched reply state. Split from the handler registry
/// so replies can be opened while a delivery walk is in progress.
pub struct TxCore {
    mac: MacAddr,
    port: Box<dyn Writeable>,
    reply: ReplyLatch,
    stats: DispatchStats,
}

impl TxCore {
    /// Open a writer for one frame. Fails when the port cannot take the
    /// full frame right now.
    pub fn open_write(
        &mut self,
        dst: MacAddr,
        vlan: Option<VlanTag>,
        etype: u16,
        len: usize,
    ) -> Option<&mut dyn Writeable> {
        let hdr = Header { dst, src: self.mac, vlan, etype };
        if self.port.get_write_space() < hdr.wire_len() + len {
            return None;
        }
        hdr.write_to(self.port.as_mut());
        Some(self.port.as_mut())
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }
}

struct EthIface<'a> {
    core: &'a mut TxCore,
}

impl NetDispatch for EthIface<'_> {
    fn open_reply(&mut self, rtype: Type, len: usize) -> Option<&mut dyn Writeable> {
        let ReplyLatch { mac, vlan } = self.core.reply;
        self.core.open_write(mac, vlan, rtype.value() as u16, len)
    }

    fn source(&self) -> SourceInfo {
        SourceInfo {
            mac: self.core.reply.mac,
            vlan: self.core.reply.vlan,
            ..SourceInfo::default()
        }
    }
}

/// Ethernet frame demultiplexer bound to one port.
pub struct Dispatch {
    core: TxCore,
    handlers: HandlerList,
    mcast: ArrayVec<MacAddr, MAX_MCAST>,
    promiscuous: bool,
}

impl Dispatch {
    /// `port` is the transmit side of the underlying link; received
    /// frames are pushed in through [Dispatch::deliver].
    pub fn new(mac: MacAddr, port: Box<dyn Writeable>) -> Self {
        Dispatch {
            core: TxCore {
                mac,
                port,
                reply: ReplyLatch::default(),
                stats: DispatchStats::default(),
            },
            handlers: HandlerList::new(),
            mcast: ArrayVec::new(),
            promiscuous: false,
        }
    }

    pub fn mac(&self) -> MacAddr {
        self.core.mac
    }

    pub fn stats(&self) -> DispatchStats {
        self.core.stats
    }

    pub fn set_promiscuous(&mut self, on: bool) {
        self.promiscuous = on;
    }

    /// Accept frames sent to an additional multicast group address.
    pub fn mcast_join(&mut self, addr: MacAddr) -> bool {
        if self.mcast.contains(&addr) {
            return true;
        }
        self.mcast.try_push(addr).is_ok()
    }

    pub fn mcast_leave(&mut self, addr: MacAddr) {
        self.mcast.retain(|a| *a != addr);
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

    /// Both halves at once, for transmit paths that go through a
    /// registered protocol (routing, ARP) and then the port.
    pub fn split(&mut self) -> (&mut TxCore, &mut HandlerList) {
        (&mut self.core, &mut self.handlers)
    }

    /// Open a transmit writer outside of any delivery context.
    pub fn open_write(
        &mut self,
        dst: MacAddr,
        vlan: Option<VlanTag>,
        etype: u16,
        len: usize,
    ) -> Option<&mut dyn Writeable> {
        self.core.open_write(dst, vlan, etype, len)
    }

    fn accept(&self, dst: MacAddr) -> bool {
        self.promiscuous
            || dst == self.core.mac
            || dst.is_broadcast()
            || (dst.is_multicast() && self.mcast.contains(&dst))
    }

    /// Parse and deliver one received frame. The caller finalizes `rx`
    /// afterwards (and owns the framing that produced the packet).
    pub fn deliver(&mut self, rx: &mut dyn Readable) {
        let Some(hdr) = Header::read_from(rx) else {
            self.core.stats.count_malformed();
            return;
        };
        if !self.accept(hdr.dst) {
            self.core.stats.count_filtered();
            return;
        }
        self.core.reply = ReplyLatch { mac: hdr.src, vlan: hdr.vlan };

        let mut keys = ArrayVec::<Type, 2>::new();
        if let Some(tag) = hdr.vlan {
            keys.push(Type::from_pair(tag.vid(), hdr.etype));
        }
        keys.push(Type::from_u16(hdr.etype));

        let mut payload = LimitedRead::remainder(rx);
        let mut iface = EthIface { core: &mut self.core };
        if self.handlers.deliver(&keys, &mut payload, &mut iface) {
            self.core.stats.count_delivered();
        } else {
            self.core.stats.count_no_match();
        }
        payload.read_finalize();
    }

    /// Drain every complete frame from a packetized source.
    pub fn poll(&mut self, rx: &mut dyn Readable) -> usize {
        let mut n = 0;
        while rx.get_read_ready() > 0 {
            self.deliver(rx);
            rx.read_finalize();
            n += 1;
        }
        n
    }
}

/// Destination for raw Ethernet transmit: remembers where one peer
/// lives so callers can open pre-addressed frame writers repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub dst: MacAddr,
    pub vlan: Option<VlanTag>,
    pub etype: u16,
}

impl Address {
    pub fn new(dst: MacAddr, etype: u16) -> Self {
        Address { dst, vlan: None, etype }
    }

    pub fn with_vlan(dst: MacAddr, vlan: VlanTag, etype: u16) -> Self {
        Address { dst, vlan: Some(vlan), etype }
    }

    /// Open a writer for one frame to this peer, header pre-filled.
    pub fn open_write<'a>(
        &self,
        iface: &'a mut Dispatch,
        len: usize,
    ) -> Option<&'a mut dyn Writeable> {
        iface.open_write(self.dst, self.vlan, self.etype, len)
    }
}

/// CRC-32 used by the Ethernet FCS (reflected, poly 0xEDB88320).
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
        }
    }
    !crc
}

/// Appends the frame check sequence to each outgoing frame, for links
/// whose hardware does not insert it.
pub struct ChecksumTx<W> {
    dst: W,
    crc: u32,
    ovr: bool,
}

impl<W: Writeable> ChecksumTx<W> {
    pub fn new(dst: W) -> Self {
        ChecksumTx { dst, crc: 0xFFFF_FFFF, ovr: false }
    }

    pub fn dst_mut(&mut self) -> &mut W {
        &mut self.dst
    }
}

impl<W: Writeable> Writeable for ChecksumTx<W> {
    fn get_write_space(&self) -> usize {
        self.dst.get_write_space().saturating_sub(4)
    }

    fn write_next(&mut self, byte: u8) {
        self.crc ^= byte as u32;
        for _ in 0..8 {
            self.crc = if self.crc & 1 != 0 {
                (self.crc >> 1) ^ 0xEDB8_8320
            } else {
                self.crc >> 1
            };
        }
        self.dst.write_next(byte);
    }

    fn write_overflow(&mut self) {
        self.ovr = true;
    }

    fn write_finalize(&mut self) -> bool {
        let crc = !self.crc;
        self.crc = 0xFFFF_FFFF;
        if self.ovr {
            self.ovr = false;
            self.dst.write_abort();
            return false;
        }
        // FCS is transmitted least-significant byte first.
        self.dst.write_bytes(&crc.to_le_bytes());
        self.dst.write_finalize()
    }

    fn write_abort(&mut self) {
        self.crc = 0xFFFF_FFFF;
        self.ovr = false;
        self.dst.write_abort();
    }
}

/// Verifies and strips the FCS from each incoming frame; frames that fail
/// the check are dropped and counted.
pub struct ChecksumRx<W> {
    dst: W,
    buf: alloc::vec::Vec<u8>,
    max_frame: usize,
    drop_count: u32,
}

impl<W: Writeable> ChecksumRx<W> {
    pub fn new(dst: W, max_frame: usize) -> Self {
        ChecksumRx {
            dst,
            buf: alloc::vec::Vec::with_capacity(max_frame),
            max_frame,
            drop_count: 0,
        }
    }

    pub fn dst_mut(&mut self) -> &mut W {
        &mut self.dst
    }

    pub fn drop_count(&self) -> u32 {
        self.drop_count
    }
}

impl<W: Writeable> Writeable for ChecksumRx<W> {
    fn get_write_space(&self) -> usize {
        self.max_frame - self.buf.len()
    }

    fn write_next(&mut self, byte: u8) {
        if self.buf.len() < self.max_frame {
            self.buf.push(byte);
        }
    }

    fn write_overflow(&mut self) {
        // Oversize frames fail the length check at finalize.
        self.buf.clear();
        self.drop_count = self.drop_count.wrapping_add(1);
    }

    fn write_finalize(&mut self) -> bool {
        let frame = &self.buf[..];
        if frame.len() < 4 {
            if !frame.is_empty() {
                self.drop_count = self.drop_count.wrapping_add(1);
            }
            self.buf.clear();
            return false;
        }
        let (body, fcs) = frame.split_at(frame.len() - 4);
        let want = u32::from_le_bytes([fcs[0], fcs[1], fcs[2], fcs[3]]);
        let ok = crc32(body) == want;
        if ok {
            self.dst.write_bytes(body);
            self.buf.clear();
            self.dst.write_finalize()
        } else {
            log::debug!("FCS mismatch, dropping {} byte frame", frame.len());
            self.drop_count = self.drop_count.wrapping_add(1);
            self.buf.clear();
            false
        }
    }

    fn write_abort(&mut self) {
        self.buf.clear();
    }
}
