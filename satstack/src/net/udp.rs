//! UDP (layer 4) dispatch and sockets
//!
//! Demuxes by destination port, with connected sockets narrowing on the
//! remote (address, port). Transmit always carries a checksum over the
//! pseudo-header; receive verifies it, with the RFC 768 exception that a
//! zero checksum field means "not computed" and is accepted.

use alloc::vec::Vec;

use super::ip::{checksum_add, checksum_finish, Addr, PROTO_UDP};
use super::{Dispatch as NetDispatch, DispatchStats, Handle, HandlerList, Protocol, SourceInfo, Type};
use crate::io::{ArrayRead, LimitedRead, PacketBuffer, Readable, SharedBuffer, Writeable};

/// Well-known ports used by this crate.
pub const PORT_ECHO: u16 = 7;
pub const PORT_PTP_EVENT: u16 = 319;
pub const PORT_PTP_GENERAL: u16 = 320;
pub const PORT_CFGBUS: u16 = 0x5C01;

pub const HDR_LEN: usize = 8;
const MAX_DATAGRAM: usize = 1600;

/// Ones-complement partial sum of the UDP pseudo-header.
fn pseudo_sum(src: Addr, dst: Addr, udp_len: u16) -> u32 {
    let mut sum = checksum_add(0, &src.octets());
    sum = checksum_add(sum, &dst.octets());
    sum += PROTO_UDP as u32;
    sum += udp_len as u32;
    sum
}

/// Checksum of a complete outgoing datagram. Never returns zero: the
/// all-ones substitute is used, as the zero field means "no checksum".
pub fn datagram_checksum(
    src: Addr,
    dst: Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> u16 {
    let udp_len = (HDR_LEN + payload.len()) as u16;
    let mut sum = pseudo_sum(src, dst, udp_len);
    sum += src_port as u32;
    sum += dst_port as u32;
    sum += udp_len as u32;
    sum = checksum_add(sum, payload);
    match checksum_finish(sum) {
        0 => 0xFFFF,
        c => c,
    }
}

/// Compose a full UDP datagram (header + payload) onto a writer.
pub fn write_datagram(
    wr: &mut dyn Writeable,
    src: Addr,
    dst: Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) {
    wr.write_u16(src_port);
    wr.write_u16(dst_port);
    wr.write_u16((HDR_LEN + payload.len()) as u16);
    wr.write_u16(datagram_checksum(src, dst, src_port, dst_port, payload));
    wr.write_bytes(payload);
}

/// Reply context for UDP handlers. Replies are staged in a scratch
/// buffer so the mandatory checksum can be computed before the lower
/// layers see a single byte.
struct UdpIface<'a> {
    lower: &'a mut dyn NetDispatch,
    remote_port: u16,
    local_port: u16,
    scratch: &'a mut Vec<u8>,
    open: bool,
    ovr: bool,
}

impl NetDispatch for UdpIface<'_> {
    /// The reply's ports are always the received ports swapped; `rtype`
    /// is accepted for interface uniformity.
    fn open_reply(&mut self, _rtype: Type, len: usize) -> Option<&mut dyn Writeable> {
        if len + HDR_LEN > MAX_DATAGRAM {
            return None;
        }
        self.scratch.clear();
        self.open = true;
        self.ovr = false;
        Some(self)
    }

    fn source(&self) -> SourceInfo {
        SourceInfo {
            ports: Some((self.remote_port, self.local_port)),
            ..self.lower.source()
        }
    }
}

impl Writeable for UdpIface<'_> {
    fn get_write_space(&self) -> usize {
        MAX_DATAGRAM - HDR_LEN - self.scratch.len()
    }

    fn write_next(&mut self, byte: u8) {
        if self.scratch.len() + HDR_LEN < MAX_DATAGRAM {
            self.scratch.push(byte);
        } else {
            self.ovr = true;
        }
    }

    fn write_overflow(&mut self) {
        self.ovr = true;
    }

    fn write_finalize(&mut self) -> bool {
        if !self.open {
            return false;
        }
        self.open = false;
        if self.ovr {
            self.ovr = false;
            self.scratch.clear();
            return false;
        }
        let (remote_ip, local_ip) = {
            let info = self.lower.source();
            let Some((remote, _)) = info.ip else { return false };
            let Some(local) = info.local_ip else { return false };
            (remote, local)
        };
        let total = HDR_LEN + self.scratch.len();
        let Some(wr) = self.lower.open_reply(Type::from_u8(PROTO_UDP), total) else {
            self.scratch.clear();
            return false;
        };
        write_datagram(
            wr,
            local_ip,
            remote_ip,
            self.local_port,
            self.remote_port,
            self.scratch,
        );
        let ok = wr.write_finalize();
        self.scratch.clear();
        ok
    }

    fn write_abort(&mut self) {
        self.open = false;
        self.ovr = false;
        self.scratch.clear();
    }
}

/// UDP datagram demultiplexer; a [Protocol] child of the IP dispatch.
pub struct Dispatch {
    handlers: HandlerList,
    tx_scratch: Vec<u8>,
    stats: DispatchStats,
}

impl Default for Dispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatch {
    pub fn new() -> Self {
        Dispatch {
            handlers: HandlerList::new(),
            tx_scratch: Vec::with_capacity(MAX_DATAGRAM),
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
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

    /// Open an unconnected socket receiving on `port`.
    pub fn bind(&mut self, port: u16) -> Socket {
        self.bind_inner(port, None)
    }

    /// Open a connected socket: receives only from the given remote and
    /// remembers it as the default send destination.
    pub fn connect(&mut self, local_port: u16, remote: Addr, remote_port: u16) -> Socket {
        self.bind_inner(local_port, Some((remote, remote_port)))
    }

    fn bind_inner(&mut self, port: u16, remote: Option<(Addr, u16)>) -> Socket {
        let rx = SharedBuffer::new(4 * MAX_DATAGRAM);
        let handle = self.handlers.register(SocketPort {
            rx: rx.clone(),
            local: port,
            remote,
            drop_count: 0,
        });
        Socket {
            rx,
            tx: PacketBuffer::new(4 * MAX_DATAGRAM),
            handle,
            local: port,
            remote,
        }
    }

    /// Release a socket's registration.
    #[cfg(feature = "teardown")]
    pub fn close(&mut self, socket: Socket) {
        self.handlers.unregister(socket.handle);
    }
}

impl Protocol for Dispatch {
    fn net_type(&self) -> Type {
        Type::from_u8(PROTO_UDP)
    }

    fn frame_rcvd(&mut self, src: &mut LimitedRead<'_>, iface: &mut dyn NetDispatch) {
        let (Some(src_port), Some(dst_port), Some(udp_len), Some(ck)) =
            (src.read_u16(), src.read_u16(), src.read_u16(), src.read_u16())
        else {
            self.stats.count_malformed();
            return;
        };
        let payload_len = match (udp_len as usize).checked_sub(HDR_LEN) {
            Some(n) if n <= src.get_read_ready() && n <= MAX_DATAGRAM => n,
            _ => {
                self.stats.count_malformed();
                return;
            }
        };

        let mut payload = [0u8; MAX_DATAGRAM];
        let payload = &mut payload[..payload_len];
        if !src.read_bytes(payload) {
            self.stats.count_malformed();
            return;
        }

        // Zero means the sender did not compute one (RFC 768).
        if ck != 0 {
            let Some((ip_src, ip_dst)) = iface.source().ip else {
                self.stats.count_malformed();
                return;
            };
            let mut sum = pseudo_sum(ip_src, ip_dst, udp_len);
            sum += src_port as u32;
            sum += dst_port as u32;
            sum += udp_len as u32;
            sum += ck as u32;
            sum = checksum_add(sum, payload);
            if checksum_finish(sum) != 0 {
                log::debug!("UDP checksum mismatch on port {dst_port}");
                self.stats.count_malformed();
                return;
            }
        }

        let keys = [Type::from_pair(src_port, dst_port), Type::from_u16(dst_port)];
        let mut rd = ArrayRead::new(payload);
        let mut lim = LimitedRead::new(&mut rd, payload_len);
        let mut up = UdpIface {
            lower: iface,
            remote_port: src_port,
            local_port: dst_port,
            scratch: &mut self.tx_scratch,
            open: false,
            ovr: false,
        };
        if self.handlers.deliver(&keys, &mut lim, &mut up) {
            self.stats.count_delivered();
        } else {
            self.stats.count_filtered();
        }
    }

    fn as_any(&mut self) -> &mut dyn core::any::Any {
        self
    }
}

/// Destination for UDP transmit: a fixed remote plus the local source
/// port. Sending goes through [crate::net::stack::Stack::send_to], which
/// resolves the route and the link address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub dst: Addr,
    pub dst_port: u16,
    pub src_port: u16,
}

impl Address {
    pub fn new(dst: Addr, dst_port: u16, src_port: u16) -> Self {
        Address { dst, dst_port, src_port }
    }
}

/// Receive side of a socket, registered with the dispatch.
struct SocketPort {
    rx: SharedBuffer,
    local: u16,
    remote: Option<(Addr, u16)>,
    drop_count: u32,
}

impl Protocol for SocketPort {
    fn net_type(&self) -> Type {
        match self.remote {
            Some((_, rport)) => Type::from_pair(rport, self.local),
            None => Type::from_u16(self.local),
        }
    }

    fn frame_rcvd(&mut self, src: &mut LimitedRead<'_>, iface: &mut dyn NetDispatch) {
        if let Some((want, _)) = self.remote {
            match iface.source().ip {
                Some((from, _)) if from == want => {}
                _ => {
                    self.drop_count = self.drop_count.wrapping_add(1);
                    return;
                }
            }
        }
        let len = src.get_read_ready();
        self.rx.with(|pb| {
            if pb.get_write_space() < len {
                self.drop_count = self.drop_count.wrapping_add(1);
                return;
            }
            src.copy_to(pb);
            pb.write_finalize();
        });
    }

    fn as_any(&mut self) -> &mut dyn core::any::Any {
        self
    }
}

/// User side of a socket: a [Readable] queue of received payloads plus
/// the binding needed to transmit.
pub struct Socket {
    rx: SharedBuffer,
    tx: PacketBuffer,
    #[cfg_attr(not(feature = "teardown"), allow(dead_code))]
    handle: Handle<SocketPort>,
    local: u16,
    remote: Option<(Addr, u16)>,
}

impl Socket {
    pub fn local_port(&self) -> u16 {
        self.local
    }

    pub fn remote(&self) -> Option<(Addr, u16)> {
        self.remote
    }

    /// Received datagram payloads, one packet each.
    pub fn rx(&mut self) -> &mut SharedBuffer {
        &mut self.rx
    }

    /// Datagrams staged for transmit; drained by
    /// [crate::net::stack::Stack::flush_socket].
    pub fn tx(&mut self) -> &mut PacketBuffer {
        &mut self.tx
    }

    /// Pop the next received payload into `buf`.
    pub fn recv(&mut self, buf: &mut [u8]) -> Option<usize> {
        let n = self.rx.get_read_ready();
        if n == 0 || n > buf.len() {
            return None;
        }
        self.rx.read_bytes(&mut buf[..n]);
        self.rx.read_finalize();
        Some(n)
    }
}

/// The receive half of the socket's stream pair.
impl Readable for Socket {
    fn get_read_ready(&self) -> usize {
        self.rx.get_read_ready()
    }

    fn read_next(&mut self) -> u8 {
        self.rx.read_next()
    }

    fn read_finalize(&mut self) {
        self.rx.read_finalize()
    }

    fn set_callback(&mut self, notify: Option<crate::poll::Notify>) {
        self.rx.set_callback(notify)
    }
}

/// The transmit half: each finalized packet is one staged datagram for a
/// connected socket, sent when the stack flushes it.
impl Writeable for Socket {
    fn get_write_space(&self) -> usize {
        self.tx.get_write_space()
    }

    fn write_next(&mut self, byte: u8) {
        self.tx.write_next(byte)
    }

    fn write_overflow(&mut self) {
        self.tx.write_overflow()
    }

    fn write_finalize(&mut self) -> bool {
        self.tx.write_finalize()
    }

    fn write_abort(&mut self) {
        self.tx.write_abort()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::PacketBuffer;
    use alloc::vec::Vec;

    const SRC_IP: Addr = Addr::from_octets([10, 0, 0, 5]);
    const DST_IP: Addr = Addr::from_octets([10, 0, 0, 1]);

    /// Stand-in for the IP layer: records replies, reports addressing.
    struct FakeIp {
        out: PacketBuffer,
        src: Addr,
        dst: Addr,
        local: Addr,
    }

    impl FakeIp {
        fn new() -> Self {
            FakeIp {
                out: PacketBuffer::new(4096),
                src: SRC_IP,
                dst: DST_IP,
                local: DST_IP,
            }
        }
    }

    impl NetDispatch for FakeIp {
        fn open_reply(&mut self, _rtype: Type, _len: usize) -> Option<&mut dyn Writeable> {
            Some(&mut self.out)
        }

        fn source(&self) -> SourceInfo {
            SourceInfo {
                ip: Some((self.src, self.dst)),
                local_ip: Some(self.local),
                ..SourceInfo::default()
            }
        }
    }

    fn deliver(disp: &mut Dispatch, ip: &mut FakeIp, datagram: &[u8]) {
        let mut rd = ArrayRead::new(datagram);
        let mut lim = LimitedRead::remainder(&mut rd);
        disp.frame_rcvd(&mut lim, ip);
    }

    fn build(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = PacketBuffer::new(2048);
        write_datagram(&mut out, SRC_IP, DST_IP, src_port, dst_port, payload);
        assert!(out.write_finalize());
        let mut v = alloc::vec![0u8; out.get_read_ready()];
        out.read_bytes(&mut v);
        v
    }

    #[test]
    fn socket_receives_bound_port() {
        let mut disp = Dispatch::new();
        let mut ip = FakeIp::new();
        let mut sock = disp.bind(4000);

        deliver(&mut disp, &mut ip, &build(5555, 4000, b"HELLO"));
        let mut buf = [0u8; 32];
        assert_eq!(sock.recv(&mut buf), Some(5));
        assert_eq!(&buf[..5], b"HELLO");
        assert_eq!(disp.stats().delivered, 1);
    }

    #[test]
    fn wrong_port_filtered() {
        let mut disp = Dispatch::new();
        let mut ip = FakeIp::new();
        let mut sock = disp.bind(4000);
        deliver(&mut disp, &mut ip, &build(5555, 4001, b"nope"));
        let mut buf = [0u8; 8];
        assert_eq!(sock.recv(&mut buf), None);
        assert_eq!(disp.stats().filtered, 1);
    }

    #[test]
    fn bad_checksum_dropped_zero_accepted() {
        let mut disp = Dispatch::new();
        let mut ip = FakeIp::new();
        let mut sock = disp.bind(9);

        let mut dg = build(1, 9, b"data");
        dg[6] ^= 0x5A; // corrupt the checksum
        deliver(&mut disp, &mut ip, &dg);
        assert_eq!(disp.stats().malformed, 1);
        assert_eq!(sock.recv(&mut [0u8; 16]), None);

        // Zero checksum field: accepted unverified.
        let mut dg = build(1, 9, b"data");
        dg[6] = 0;
        dg[7] = 0;
        deliver(&mut disp, &mut ip, &dg);
        assert_eq!(sock.recv(&mut [0u8; 16]), Some(4));
    }

    #[test]
    fn connected_socket_narrows_remote() {
        let mut disp = Dispatch::new();
        let mut ip = FakeIp::new();
        let mut sock = disp.connect(4000, SRC_IP, 5555);

        // Right port pair, right address.
        deliver(&mut disp, &mut ip, &build(5555, 4000, b"yes"));
        assert_eq!(sock.recv(&mut [0u8; 8]), Some(3));

        // Same ports, different remote address.
        ip.src = Addr::from_octets([10, 0, 0, 66]);
        deliver(&mut disp, &mut ip, &build(5555, 4000, b"no"));
        assert_eq!(sock.recv(&mut [0u8; 8]), None);

        // Unconnected port: no match at all.
        deliver(&mut disp, &mut ip, &build(5556, 4000, b"no"));
        assert_eq!(sock.recv(&mut [0u8; 8]), None);
    }

    #[test]
    fn truncated_header_and_length_lies() {
        let mut disp = Dispatch::new();
        let mut ip = FakeIp::new();
        let _sock = disp.bind(9);

        deliver(&mut disp, &mut ip, &[0x00, 0x09, 0x00]);
        assert_eq!(disp.stats().malformed, 1);

        // Length field larger than the actual payload.
        let mut dg = build(1, 9, b"ab");
        dg[4..6].copy_from_slice(&100u16.to_be_bytes());
        deliver(&mut disp, &mut ip, &dg);
        assert_eq!(disp.stats().malformed, 2);
    }

    struct Echoer;

    impl Protocol for Echoer {
        fn net_type(&self) -> Type {
            Type::from_u16(PORT_ECHO)
        }

        fn frame_rcvd(&mut self, src: &mut LimitedRead<'_>, iface: &mut dyn NetDispatch) {
            let len = src.get_read_ready();
            let Some(wr) = iface.open_reply(Type::from_u16(PORT_ECHO), len) else {
                return;
            };
            src.copy_to(wr);
            assert!(wr.write_finalize());
        }

        fn as_any(&mut self) -> &mut dyn core::any::Any {
            self
        }
    }

    #[test]
    fn reply_swaps_ports_and_checksums() {
        let mut disp = Dispatch::new();
        let mut ip = FakeIp::new();
        disp.register(Echoer);

        deliver(&mut disp, &mut ip, &build(4000, PORT_ECHO, b"HELLO"));

        // One reply datagram arrived at the IP layer.
        let n = ip.out.get_read_ready();
        assert_eq!(n, HDR_LEN + 5);
        let mut reply = alloc::vec![0u8; n];
        assert!(ip.out.read_bytes(&mut reply));
        assert_eq!(u16::from_be_bytes([reply[0], reply[1]]), PORT_ECHO);
        assert_eq!(u16::from_be_bytes([reply[2], reply[3]]), 4000);
        assert_eq!(&reply[HDR_LEN..], b"HELLO");
        // Checksum verifies against the reply direction's pseudo-header.
        let want = datagram_checksum(DST_IP, SRC_IP, PORT_ECHO, 4000, b"HELLO");
        assert_eq!(u16::from_be_bytes([reply[6], reply[7]]), want);
    }
}
