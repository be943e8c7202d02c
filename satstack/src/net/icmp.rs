//! Internet Control Message Protocol
//!
//! Echo reply is built in: every valid echo request is answered with the
//! type word rewritten and the checksum fixed up incrementally, without
//! copying the payload twice. Outgoing error messages (destination
//! unreachable, time exceeded, redirect) are composed by
//! [write_error]; echo replies to our own pings are reported through
//! [PingListener].

use alloc::boxed::Box;

use super::ip::{checksum, checksum_add, checksum_finish, Addr, PROTO_ICMP};
use super::{Dispatch as NetDispatch, Protocol, Type};
use crate::io::{LimitedRead, Readable, Writeable};
use crate::time::Time;
use crate::util::RegistryList;

/// Combined ICMP message codes (type in the high byte, code in the low).
pub const ICMP_ECHO_REPLY: u16 = 0x0000;
pub const ICMP_UNREACHABLE_NET: u16 = 0x0300;
pub const ICMP_UNREACHABLE_HOST: u16 = 0x0301;
pub const ICMP_UNREACHABLE_PROTO: u16 = 0x0302;
pub const ICMP_UNREACHABLE_PORT: u16 = 0x0303;
pub const ICMP_REDIRECT_NET: u16 = 0x0500;
pub const ICMP_REDIRECT_HOST: u16 = 0x0501;
pub const ICMP_ECHO_REQUEST: u16 = 0x0800;
pub const ICMP_TTL_EXPIRED: u16 = 0x0B00;
pub const ICMP_FRAG_TIMEOUT: u16 = 0x0B01;

const ECHO_HDR: usize = 8;
const MAX_MSG: usize = 1600;

/// Callback for echo responses to pings we initiated.
pub trait PingListener: 'static {
    fn ping_event(&mut self, from: Addr, elapsed: Time);
}

/// ICMP protocol handler; a child of the IP dispatch.
pub struct ProtoIcmp {
    listeners: RegistryList<Box<dyn PingListener>>,
    ping_ident: u16,
    ping_seq: u16,
    now: Time,
    echo_count: u32,
    drop_count: u32,
}

impl Default for ProtoIcmp {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtoIcmp {
    pub fn new() -> Self {
        ProtoIcmp {
            listeners: RegistryList::new(),
            ping_ident: 0x5A01,
            ping_seq: 0,
            now: Time::ZERO,
            echo_count: 0,
            drop_count: 0,
        }
    }

    pub fn add_listener(&mut self, listener: Box<dyn PingListener>) {
        self.listeners.add(listener);
    }

    /// Echo requests answered so far.
    pub fn echo_count(&self) -> u32 {
        self.echo_count
    }

    pub fn drop_count(&self) -> u32 {
        self.drop_count
    }

    /// Update the notion of "now" used for round-trip measurement; call
    /// once per poll cycle.
    pub fn service(&mut self, now: Time) {
        self.now = now;
    }

    /// Compose the body of an echo request carrying the transmit time.
    /// The caller sends it as an IPv4 payload with protocol 1.
    pub fn make_ping(&mut self) -> [u8; ECHO_HDR + 8] {
        self.ping_seq = self.ping_seq.wrapping_add(1);
        let mut msg = [0u8; ECHO_HDR + 8];
        msg[0] = (ICMP_ECHO_REQUEST >> 8) as u8;
        msg[4..6].copy_from_slice(&self.ping_ident.to_be_bytes());
        msg[6..8].copy_from_slice(&self.ping_seq.to_be_bytes());
        msg[8..16].copy_from_slice(&self.now.delta_usec().to_be_bytes());
        let sum = checksum(&msg);
        msg[2..4].copy_from_slice(&sum.to_be_bytes());
        msg
    }
}

/// Compose an ICMP error message: `combined` type/code word, the 4-byte
/// argument (unused/next-hop per type), and the offending datagram's
/// header plus first eight payload bytes in `original`.
pub fn write_error(wr: &mut dyn Writeable, combined: u16, arg: u32, original: &[u8]) {
    let mut sum = checksum_add(0, &combined.to_be_bytes());
    sum = checksum_add(sum, &arg.to_be_bytes());
    sum = checksum_add(sum, original);
    wr.write_u16(combined);
    wr.write_u16(checksum_finish(sum));
    wr.write_u32(arg);
    wr.write_bytes(original);
}

/// Wire size of an error message for the given original-header slice.
pub fn error_len(original: &[u8]) -> usize {
    ECHO_HDR + original.len()
}

impl Protocol for ProtoIcmp {
    fn net_type(&self) -> Type {
        Type::from_u8(PROTO_ICMP)
    }

    fn frame_rcvd(&mut self, src: &mut LimitedRead<'_>, iface: &mut dyn NetDispatch) {
        let len = src.get_read_ready();
        let mut msg = [0u8; MAX_MSG];
        if len < ECHO_HDR || len > MAX_MSG || !src.read_bytes(&mut msg[..len]) {
            self.drop_count = self.drop_count.wrapping_add(1);
            return;
        }
        let msg = &msg[..len];
        if checksum(msg) != 0 {
            log::debug!("ICMP checksum mismatch");
            self.drop_count = self.drop_count.wrapping_add(1);
            return;
        }
        let combined = u16::from_be_bytes([msg[0], msg[1]]);

        match combined {
            ICMP_ECHO_REQUEST => {
                let Some(wr) = iface.open_reply(Type::from_u8(PROTO_ICMP), len) else {
                    return;
                };
                // Only the type word changes (0x0800 -> 0x0000); patch the
                // checksum incrementally instead of re-summing the payload.
                let old = u16::from_be_bytes([msg[2], msg[3]]);
                let mut fixed = old as u32 + ICMP_ECHO_REQUEST as u32;
                while fixed > 0xFFFF {
                    fixed = (fixed & 0xFFFF) + (fixed >> 16);
                }
                wr.write_u16(ICMP_ECHO_REPLY);
                wr.write_u16(fixed as u16);
                wr.write_bytes(&msg[4..]);
                if wr.write_finalize() {
                    self.echo_count = self.echo_count.wrapping_add(1);
                }
            }
            ICMP_ECHO_REPLY => {
                if len < ECHO_HDR + 8 {
                    return;
                }
                let ident = u16::from_be_bytes([msg[4], msg[5]]);
                if ident != self.ping_ident {
                    return; // Someone else's ping.
                }
                let sent_usec = u64::from_be_bytes(msg[8..16].try_into().unwrap());
                let elapsed = self.now - Time::from_micros(sent_usec as i64);
                let from = iface.source().ip.map(|(src, _)| src).unwrap_or(Addr::ANY);
                for l in self.listeners.iter_mut() {
                    l.ping_event(from, elapsed);
                }
            }
            _ => {
                // Unreachable / time-exceeded / redirect and friends are
                // informational here.
                log::debug!("ICMP type 0x{combined:04X} ignored");
            }
        }
    }

    fn as_any(&mut self) -> &mut dyn core::any::Any {
        self
    }
}
