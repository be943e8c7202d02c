//! Generic echo service
//!
//! Attachable to any dispatch layer: every received frame is copied back
//! to its sender. On raw Ethernet, use distinct request and reply
//! EtherTypes so two echo nodes cannot ping-pong a frame forever; on UDP
//! the port swap already breaks the loop.

use super::{Dispatch as NetDispatch, Protocol, Type};
use crate::io::{LimitedRead, Readable, Writeable};

pub struct ProtoEcho {
    req_type: Type,
    reply_type: Type,
    echo_count: u32,
}

impl ProtoEcho {
    pub fn new(req_type: Type, reply_type: Type) -> Self {
        ProtoEcho {
            req_type,
            reply_type,
            echo_count: 0,
        }
    }

    /// Echo on a single UDP port.
    pub fn udp(port: u16) -> Self {
        Self::new(Type::from_u16(port), Type::from_u16(port))
    }

    pub fn echo_count(&self) -> u32 {
        self.echo_count
    }
}

impl Protocol for ProtoEcho {
    fn net_type(&self) -> Type {
        self.req_type
    }

    fn frame_rcvd(&mut self, src: &mut LimitedRead<'_>, iface: &mut dyn NetDispatch) {
        let len = src.get_read_ready();
        let Some(wr) = iface.open_reply(self.reply_type, len) else {
            return; // No room downstream; the sender can retry.
        };
        src.copy_to(wr);
        if wr.write_finalize() {
            self.echo_count = self.echo_count.wrapping_add(1);
        }
    }

    fn as_any(&mut self) -> &mut dyn core::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{ArrayRead, SharedBuffer};
    use crate::net::eth::{self, MacAddr};
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    #[test]
    fn ethernet_echo_swaps_addresses() {
        let local = MacAddr([2, 0, 0, 0, 0, 1]);
        let peer = MacAddr([2, 0, 0, 0, 0, 2]);
        let wire = SharedBuffer::new(256);
        let mut disp = eth::Dispatch::new(local, Box::new(wire.clone()));
        let h = disp.register(ProtoEcho::new(Type::from_u16(0x4141), Type::from_u16(0x4142)));

        let mut frame = Vec::new();
        frame.extend_from_slice(&local.0);
        frame.extend_from_slice(&peer.0);
        frame.extend_from_slice(&0x4141u16.to_be_bytes());
        frame.extend_from_slice(b"bounce");
        let mut rd = ArrayRead::new(&frame);
        disp.deliver(&mut rd);

        assert_eq!(disp.protocol_mut(h).unwrap().echo_count(), 1);
        wire.with(|pb| {
            let hdr = eth::Header::read_from(pb).unwrap();
            assert_eq!(hdr.dst, peer);
            assert_eq!(hdr.src, local);
            assert_eq!(hdr.etype, 0x4142);
            assert_eq!(pb.read_array::<6>(), Some(*b"bounce"));
            pb.read_finalize();
        });
    }
}
