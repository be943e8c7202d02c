//! Pre-wired host network stack
//!
//! Bundles an Ethernet dispatch with ARP, IPv4, ICMP, and UDP in the
//! canonical tree, and provides the transmit paths that need several of
//! them at once (route lookup, ARP resolution, then the port writer).

use alloc::boxed::Box;

use super::arp::ProtoArp;
use super::eth::{self, MacAddr};
use super::icmp::ProtoIcmp;
use super::ip::{self, Addr, PROTO_ICMP, PROTO_UDP};
use super::udp::{self, Socket};
use super::Handle;
use crate::io::{Readable, Writeable};
use crate::time::Time;

/// Outcome of a transmit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Handed to the link.
    Sent,
    /// Address unresolved; parked on the ARP probe.
    Queued,
    /// No route, or probing already gave up.
    Unreachable,
    /// The link or a queue had no room; try again later.
    NoBuffer,
}

impl SendResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, SendResult::Sent | SendResult::Queued)
    }
}

/// One interface's worth of host networking.
pub struct Stack {
    eth: eth::Dispatch,
    h_arp: Handle<ProtoArp>,
    h_ip: Handle<ip::Dispatch>,
    h_udp: Handle<udp::Dispatch>,
    h_icmp: Handle<ProtoIcmp>,
}

impl Stack {
    pub fn new(mac: MacAddr, addr: Addr, port_tx: Box<dyn Writeable>) -> Self {
        let mut eth = eth::Dispatch::new(mac, port_tx);
        let h_arp = eth.register(ProtoArp::new(mac, addr));
        let mut ipd = ip::Dispatch::new(addr);
        let h_icmp = ipd.register(ProtoIcmp::new());
        let h_udp = ipd.register(udp::Dispatch::new());
        let h_ip = eth.register(ipd);
        Stack {
            eth,
            h_arp,
            h_ip,
            h_udp,
            h_icmp,
        }
    }

    pub fn mac(&self) -> MacAddr {
        self.eth.mac()
    }

    pub fn eth_mut(&mut self) -> &mut eth::Dispatch {
        &mut self.eth
    }

    pub fn arp_mut(&mut self) -> &mut ProtoArp {
        self.eth.protocol_mut(self.h_arp).unwrap()
    }

    pub fn ip_mut(&mut self) -> &mut ip::Dispatch {
        self.eth.protocol_mut(self.h_ip).unwrap()
    }

    pub fn udp_mut(&mut self) -> &mut udp::Dispatch {
        let h_udp = self.h_udp;
        self.ip_mut().protocol_mut(h_udp).unwrap()
    }

    pub fn icmp_mut(&mut self) -> &mut ProtoIcmp {
        let h_icmp = self.h_icmp;
        self.ip_mut().protocol_mut(h_icmp).unwrap()
    }

    pub fn routes_mut(&mut self) -> &mut super::route::Table {
        self.ip_mut().routes_mut()
    }

    /// Open an unconnected UDP socket.
    pub fn udp_bind(&mut self, port: u16) -> Socket {
        self.udp_mut().bind(port)
    }

    /// Open a connected UDP socket.
    pub fn udp_connect(&mut self, local_port: u16, remote: Addr, remote_port: u16) -> Socket {
        self.udp_mut().connect(local_port, remote, remote_port)
    }

    /// Drain received frames and run the periodic services. Call once per
    /// poll cycle with frames from the link and the current time.
    pub fn poll(&mut self, rx: &mut dyn Readable, now: Time) -> usize {
        let n = self.eth.poll(rx);
        let h_arp = self.h_arp;
        let (core, handlers) = self.eth.split();
        if let Some(arp) = handlers.get_mut(h_arp) {
            arp.service(now, core);
        }
        self.icmp_mut().service(now);
        n
    }

    /// Send one UDP datagram. The checksum is always computed.
    pub fn udp_send(
        &mut self,
        dst: Addr,
        dst_port: u16,
        src_port: u16,
        payload: &[u8],
    ) -> SendResult {
        let local = self.ip_mut().addr();
        let mut dgram = [0u8; 1608];
        let mut wr = crate::io::ArrayWrite::new(&mut dgram);
        udp::write_datagram(&mut wr, local, dst, src_port, dst_port, payload);
        if !wr.write_finalize() {
            return SendResult::NoBuffer;
        }
        let len = wr.written();
        self.ip_send(dst, PROTO_UDP, &dgram[..len])
    }

    /// Send one datagram to a [udp::Address] destination.
    pub fn send_to(&mut self, addr: &udp::Address, payload: &[u8]) -> SendResult {
        self.udp_send(addr.dst, addr.dst_port, addr.src_port, payload)
    }

    /// Transmit every datagram a connected socket has staged. Stops at
    /// the first failure; unconnected sockets have nothing to flush.
    pub fn flush_socket(&mut self, socket: &mut Socket) -> usize {
        let Some((remote, remote_port)) = socket.remote() else {
            return 0;
        };
        let local_port = socket.local_port();
        let mut sent = 0;
        loop {
            let tx = socket.tx();
            let len = tx.get_read_ready();
            if len == 0 || len > 1600 {
                break;
            }
            let mut payload = [0u8; 1600];
            tx.read_bytes(&mut payload[..len]);
            tx.read_finalize();
            if !self
                .udp_send(remote, remote_port, local_port, &payload[..len])
                .is_ok()
            {
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Send an ICMP echo request; responses arrive via
    /// [super::icmp::PingListener].
    pub fn ping(&mut self, dst: Addr) -> SendResult {
        let msg = self.icmp_mut().make_ping();
        self.ip_send(dst, PROTO_ICMP, &msg)
    }

    /// Wrap a payload in an IPv4 header and transmit it toward `dst`,
    /// resolving the next hop through the routing table and ARP.
    pub fn ip_send(&mut self, dst: Addr, proto: u8, payload: &[u8]) -> SendResult {
        let h_ip = self.h_ip;
        let h_arp = self.h_arp;
        let (core, handlers) = self.eth.split();
        let Some((ipd, arp)) = handlers.get_pair_mut(h_ip, h_arp) else {
            return SendResult::NoBuffer;
        };

        let local = ipd.addr();
        let ident = ipd.next_ident();
        let hdr = ip::Header::new(proto, local, dst, payload.len(), ident, ipd.ttl_default());

        let mut packet = [0u8; 1628];
        let mut wr = crate::io::ArrayWrite::new(&mut packet);
        hdr.write_to(&mut wr);
        wr.write_bytes(payload);
        if !wr.write_finalize() {
            return SendResult::NoBuffer;
        }
        let len = wr.written();
        let packet = &packet[..len];

        // Link-level broadcast goes straight out.
        if dst.is_broadcast() {
            return match core.open_write(MacAddr::BROADCAST, None, eth::ETYPE_IPV4, packet.len()) {
                Some(w) => {
                    w.write_bytes(packet);
                    if w.write_finalize() {
                        SendResult::Sent
                    } else {
                        SendResult::NoBuffer
                    }
                }
                None => SendResult::NoBuffer,
            };
        }

        let Some(next_hop) = ipd.routes().next_hop(dst) else {
            log::debug!("No route to {dst}");
            return SendResult::Unreachable;
        };
        if let Some(_mac) = arp.lookup(next_hop) {
            if arp.send_or_queue(next_hop, packet, core) {
                SendResult::Sent
            } else {
                SendResult::NoBuffer
            }
        } else if arp.send_or_queue(next_hop, packet, core) {
            SendResult::Queued
        } else {
            SendResult::Unreachable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{PacketBuffer, Readable, SharedBuffer};
    use crate::net::echo::ProtoEcho;
    use crate::net::ip::checksum;
    use crate::net::ip::Subnet;
    use crate::net::route::Table;
    use alloc::vec::Vec;

    const MAC_A: MacAddr = MacAddr([2, 0, 0, 0, 0, 0xA]);
    const MAC_B: MacAddr = MacAddr([2, 0, 0, 0, 0, 0xB]);
    const IP_A: Addr = Addr::from_octets([10, 0, 0, 1]);
    const IP_B: Addr = Addr::from_octets([10, 0, 0, 5]);

    fn stack_a() -> (Stack, SharedBuffer) {
        let wire = SharedBuffer::new(4096);
        let mut stack = Stack::new(MAC_A, IP_A, Box::new(wire.clone()));
        stack
            .routes_mut()
            .add(Subnet::new(Addr::from_octets([10, 0, 0, 0]), 8), Addr::ANY);
        (stack, wire)
    }

    /// Hand-build the frame from spec scenario form: Ethernet + IPv4 +
    /// UDP from 10.0.0.5:4000 to 10.0.0.1:7, payload "HELLO".
    fn udp_frame(payload: &[u8], src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut f = PacketBuffer::new(2048);
        eth::Header { dst: MAC_A, src: MAC_B, vlan: None, etype: eth::ETYPE_IPV4 }
            .write_to(&mut f);
        let mut udp_bytes = PacketBuffer::new(2048);
        udp::write_datagram(&mut udp_bytes, IP_B, IP_A, src_port, dst_port, payload);
        assert!(udp_bytes.write_finalize());
        let udp_len = udp_bytes.get_read_ready();
        ip::Header::new(PROTO_UDP, IP_B, IP_A, udp_len, 77, 64).write_to(&mut f);
        udp_bytes.copy_to(&mut f);
        assert!(f.write_finalize());
        let mut v = alloc::vec![0u8; f.get_read_ready()];
        f.read_bytes(&mut v);
        v
    }

    #[test]
    fn udp_echo_scenario() {
        let (mut stack, wire) = stack_a();
        stack.udp_mut().register(ProtoEcho::udp(7));

        let mut rx = PacketBuffer::new(2048);
        rx.write_bytes(&udp_frame(b"HELLO", 4000, 7));
        assert!(rx.write_finalize());
        stack.poll(&mut rx, Time::ZERO);

        // Exactly one frame out, addresses and ports swapped, checksums good.
        assert_eq!(wire.stored_packets(), 1);
        wire.with(|pb| {
            let ehdr = eth::Header::read_from(pb).unwrap();
            assert_eq!(ehdr.dst, MAC_B);
            assert_eq!(ehdr.src, MAC_A);
            assert_eq!(ehdr.etype, eth::ETYPE_IPV4);

            let mut raw = [0u8; 2048];
            let n = pb.get_read_ready();
            assert!(pb.read_bytes(&mut raw[..n]));
            pb.read_finalize();
            let raw = &raw[..n];

            // IPv4: src/dst swapped, header checksum valid.
            assert_eq!(checksum(&raw[..20]), 0);
            let ihdr = &raw[..20];
            assert_eq!(&ihdr[12..16], &IP_A.octets());
            assert_eq!(&ihdr[16..20], &IP_B.octets());
            assert_eq!(ihdr[9], PROTO_UDP);

            // UDP: ports swapped, payload intact, checksum valid.
            let udp_raw = &raw[20..];
            assert_eq!(u16::from_be_bytes([udp_raw[0], udp_raw[1]]), 7);
            assert_eq!(u16::from_be_bytes([udp_raw[2], udp_raw[3]]), 4000);
            assert_eq!(&udp_raw[8..], b"HELLO");
            let want = udp::datagram_checksum(IP_A, IP_B, 7, 4000, b"HELLO");
            assert_eq!(u16::from_be_bytes([udp_raw[6], udp_raw[7]]), want);
        });
    }

    #[test]
    fn udp_send_resolves_and_flushes() {
        let (mut stack, wire) = stack_a();

        // First send: no ARP entry, so a probe goes out and the datagram
        // parks.
        assert_eq!(stack.udp_send(IP_B, 9000, 9001, b"payload"), SendResult::Queued);
        assert_eq!(wire.stored_packets(), 1); // the ARP request
        wire.with(|pb| {
            let hdr = eth::Header::read_from(pb).unwrap();
            assert_eq!(hdr.etype, eth::ETYPE_ARP);
            assert_eq!(hdr.dst, MacAddr::BROADCAST);
            pb.read_finalize();
        });

        // Deliver the ARP reply; the parked datagram flushes.
        let mut reply = PacketBuffer::new(256);
        eth::Header { dst: MAC_A, src: MAC_B, vlan: None, etype: eth::ETYPE_ARP }
            .write_to(&mut reply);
        for chunk in [
            &1u16.to_be_bytes()[..],
            &eth::ETYPE_IPV4.to_be_bytes(),
            &[6u8, 4][..],
            &2u16.to_be_bytes(),
            &MAC_B.0,
            &IP_B.octets(),
            &MAC_A.0,
            &IP_A.octets(),
        ] {
            reply.write_bytes(chunk);
        }
        assert!(reply.write_finalize());
        stack.poll(&mut reply, Time::ZERO);

        assert_eq!(wire.stored_packets(), 1);
        wire.with(|pb| {
            let hdr = eth::Header::read_from(pb).unwrap();
            assert_eq!(hdr.dst, MAC_B);
            assert_eq!(hdr.etype, eth::ETYPE_IPV4);
            let mut raw = [0u8; 2048];
            let n = pb.get_read_ready();
            assert!(pb.read_bytes(&mut raw[..n]));
            pb.read_finalize();
            assert_eq!(checksum(&raw[..20]), 0);
            assert_eq!(&raw[n - 7..], b"payload");
        });

        // Second send goes straight through the warm cache.
        assert_eq!(stack.udp_send(IP_B, 9000, 9001, b"again"), SendResult::Sent);
        assert_eq!(wire.stored_packets(), 1);
    }

    #[test]
    fn no_route_is_unreachable() {
        let wire = SharedBuffer::new(1024);
        let mut stack = Stack::new(MAC_A, IP_A, Box::new(wire.clone()));
        // Empty routing table.
        assert_eq!(
            stack.udp_send(Addr::from_octets([192, 168, 9, 9]), 1, 2, b"x"),
            SendResult::Unreachable
        );
        assert_eq!(wire.stored_packets(), 0);
        let _t: &Table = stack.ip_mut().routes();
    }

    #[test]
    fn address_objects_reach_their_peer() {
        let (mut stack, wire) = stack_a();
        // Warm the ARP cache through a normal exchange first.
        let mut reply = PacketBuffer::new(256);
        eth::Header { dst: MAC_A, src: MAC_B, vlan: None, etype: eth::ETYPE_ARP }
            .write_to(&mut reply);
        for chunk in [
            &1u16.to_be_bytes()[..],
            &eth::ETYPE_IPV4.to_be_bytes(),
            &[6u8, 4][..],
            &2u16.to_be_bytes(),
            &MAC_B.0,
            &IP_B.octets(),
            &MAC_A.0,
            &IP_A.octets(),
        ] {
            reply.write_bytes(chunk);
        }
        assert!(reply.write_finalize());
        stack.poll(&mut reply, Time::ZERO);

        let peer = udp::Address::new(IP_B, 2000, 2001);
        assert_eq!(stack.send_to(&peer, b"addressed"), SendResult::Sent);
        assert_eq!(wire.stored_packets(), 1);
        wire.with(|pb| {
            let hdr = eth::Header::read_from(pb).unwrap();
            assert_eq!(hdr.dst, MAC_B);
            assert_eq!(hdr.etype, eth::ETYPE_IPV4);
            pb.read_finalize();
        });

        // Raw Ethernet addresses open pre-filled writers directly.
        let raw = eth::Address::new(MAC_B, 0x4242);
        let wr = raw.open_write(stack.eth_mut(), 5).unwrap();
        wr.write_bytes(b"named");
        assert!(wr.write_finalize());
        wire.with(|pb| {
            let hdr = eth::Header::read_from(pb).unwrap();
            assert_eq!(hdr.dst, MAC_B);
            assert_eq!(hdr.etype, 0x4242);
            pb.read_finalize();
        });
    }

    #[test]
    fn broadcast_bypasses_arp() {
        let (mut stack, wire) = stack_a();
        assert_eq!(
            stack.udp_send(Addr::BROADCAST, 67, 68, b"discover"),
            SendResult::Sent
        );
        assert_eq!(wire.stored_packets(), 1);
        wire.with(|pb| {
            let hdr = eth::Header::read_from(pb).unwrap();
            assert_eq!(hdr.dst, MacAddr::BROADCAST);
            pb.read_finalize();
        });
    }

    #[test]
    fn connected_socket_stages_and_flushes() {
        let (mut stack, wire) = stack_a();
        let mut sock = stack.udp_connect(7000, IP_B, 7001);

        use crate::io::Writeable;
        sock.write_bytes(b"staged-one");
        assert!(sock.write_finalize());
        sock.write_bytes(b"staged-two");
        assert!(sock.write_finalize());

        // First flush: ARP is cold, the first datagram parks on the
        // probe and the second stays staged.
        assert_eq!(stack.flush_socket(&mut sock), 1);
        assert_eq!(sock.tx().stored_packets(), 1);
        let _probe = wire.with(|pb| {
            let hdr = eth::Header::read_from(pb).unwrap();
            assert_eq!(hdr.etype, eth::ETYPE_ARP);
            pb.read_finalize();
        });
    }

    #[test]
    fn socket_roundtrip_through_stack() {
        let (mut stack, _wire) = stack_a();
        let mut sock = stack.udp_bind(5005);

        let mut rx = PacketBuffer::new(2048);
        rx.write_bytes(&udp_frame(b"to-socket", 6006, 5005));
        assert!(rx.write_finalize());
        stack.poll(&mut rx, Time::ZERO);

        let mut buf = [0u8; 64];
        assert_eq!(sock.recv(&mut buf), Some(9));
        assert_eq!(&buf[..9], b"to-socket");
    }
}
