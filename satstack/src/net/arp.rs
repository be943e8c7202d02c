//! Address Resolution Protocol
//!
//! Maintains a bounded LRU cache of IPv4-to-MAC bindings. Cache misses
//! trigger a broadcast probe, retried up to [PROBE_RETRY_MAX] times one
//! second apart before the target is declared unreachable. One pending
//! frame may be parked per unresolved destination and is transmitted when
//! the answer arrives; callers that would rather not wait just treat the
//! miss as a send failure.

use alloc::boxed::Box;
use alloc::vec::Vec;
use arrayvec::ArrayVec;

use super::eth::{MacAddr, TxCore, ETYPE_ARP, ETYPE_IPV4};
use super::ip::Addr;
use super::{Dispatch as NetDispatch, Protocol, Type};
use crate::io::{LimitedRead, Readable, Writeable};
use crate::time::{Time, ONE_SECOND};
use crate::util::RegistryList;

pub const CACHE_SIZE: usize = 16;
pub const PROBE_RETRY_MAX: u8 = 3;
const PENDING_MAX: usize = 4;
const ARP_LEN: usize = 28;
const OPER_REQUEST: u16 = 1;
const OPER_REPLY: u16 = 2;

/// Cache lifetime of a resolved binding.
const CACHE_TTL: Time = Time::from_secs(60);

/// Callbacks for resolution results.
pub trait ArpListener: 'static {
    /// A binding was learned or refreshed.
    fn arp_resolved(&mut self, ip: Addr, mac: MacAddr);

    /// Probing gave up on this address.
    fn arp_unreachable(&mut self, _ip: Addr) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    /// Awaiting a reply; retry when the deadline passes.
    Probing { attempts: u8, deadline: Time },
    /// Bound; valid until the TTL expires or it is invalidated.
    Resolved { since: Time },
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    ip: Addr,
    mac: MacAddr,
    state: EntryState,
    last_used: u64,
}

/// ARP protocol handler; a child of the Ethernet dispatch.
pub struct ProtoArp {
    local_mac: MacAddr,
    local_ip: Addr,
    cache: ArrayVec<Entry, CACHE_SIZE>,
    pending: ArrayVec<(Addr, Vec<u8>), PENDING_MAX>,
    listeners: RegistryList<Box<dyn ArpListener>>,
    lru_tick: u64,
    now: Time,
    unreachable_count: u32,
}

impl ProtoArp {
    pub fn new(local_mac: MacAddr, local_ip: Addr) -> Self {
        ProtoArp {
            local_mac,
            local_ip,
            cache: ArrayVec::new(),
            pending: ArrayVec::new(),
            listeners: RegistryList::new(),
            lru_tick: 0,
            now: Time::ZERO,
            unreachable_count: 0,
        }
    }

    pub fn set_addr(&mut self, ip: Addr) {
        self.local_ip = ip;
    }

    pub fn add_listener(&mut self, listener: Box<dyn ArpListener>) {
        self.listeners.add(listener);
    }

    /// Probes that exhausted their retries.
    pub fn unreachable_count(&self) -> u32 {
        self.unreachable_count
    }

    /// Look up a binding, refreshing its LRU position.
    pub fn lookup(&mut self, ip: Addr) -> Option<MacAddr> {
        let now = self.now;
        self.lru_tick += 1;
        let tick = self.lru_tick;
        let entry = self.cache.iter_mut().find(|e| e.ip == ip)?;
        match entry.state {
            EntryState::Resolved { since } if now - since <= CACHE_TTL => {
                entry.last_used = tick;
                Some(entry.mac)
            }
            _ => None,
        }
    }

    /// Drop a binding, e.g. after a link change.
    pub fn invalidate(&mut self, ip: Addr) {
        self.cache.retain(|e| e.ip != ip);
    }

    /// Resolve an address: a cached answer comes back directly; otherwise
    /// a probe goes out and the answer arrives via [ArpListener].
    pub fn resolve(&mut self, ip: Addr, eth: &mut TxCore) -> Option<MacAddr> {
        if let Some(mac) = self.lookup(ip) {
            return Some(mac);
        }
        self.start_probe(ip, eth);
        None
    }

    /// Resolve and send in one step: transmit `payload` (an IPv4 packet)
    /// to `next_hop` as soon as its address is known. When unresolved,
    /// the frame is parked -- one per destination; a second frame for the
    /// same unresolved destination reports failure (fail-fast).
    pub fn send_or_queue(&mut self, next_hop: Addr, payload: &[u8], eth: &mut TxCore) -> bool {
        if let Some(mac) = self.lookup(next_hop) {
            return send_ipv4(eth, mac, payload);
        }
        self.start_probe(next_hop, eth);
        if self.pending.iter().any(|(ip, _)| *ip == next_hop) {
            return false;
        }
        if self.pending.is_full() {
            return false;
        }
        self.pending.push((next_hop, payload.to_vec()));
        true
    }

    /// Drive probe retries; call once per poll cycle with the current
    /// monotonic time.
    pub fn service(&mut self, now: Time, eth: &mut TxCore) {
        self.now = now;
        let local_ip = self.local_ip;
        let local_mac = eth.mac();
        let mut expired: ArrayVec<Addr, CACHE_SIZE> = ArrayVec::new();
        for entry in self.cache.iter_mut() {
            if let EntryState::Probing { attempts, deadline } = entry.state {
                if now < deadline {
                    continue;
                }
                if attempts < PROBE_RETRY_MAX {
                    entry.state = EntryState::Probing {
                        attempts: attempts + 1,
                        deadline: now + ONE_SECOND,
                    };
                    send_request(eth, local_mac, local_ip, entry.ip);
                } else {
                    expired.push(entry.ip);
                }
            }
        }
        for ip in expired {
            log::info!("ARP: {ip} unreachable");
            self.unreachable_count = self.unreachable_count.wrapping_add(1);
            self.cache.retain(|e| e.ip != ip);
            self.pending.retain(|(p, _)| *p != ip);
            for l in self.listeners.iter_mut() {
                l.arp_unreachable(ip);
            }
        }
    }

    fn start_probe(&mut self, ip: Addr, eth: &mut TxCore) {
        if self.cache.iter().any(|e| e.ip == ip) {
            return; // Probe already in flight (or entry stale-probing).
        }
        self.insert(Entry {
            ip,
            mac: MacAddr::default(),
            state: EntryState::Probing {
                attempts: 0,
                deadline: self.now + ONE_SECOND,
            },
            last_used: self.lru_tick,
        });
        send_request(eth, eth.mac(), self.local_ip, ip);
    }

    fn insert(&mut self, entry: Entry) {
        if let Some(existing) = self.cache.iter_mut().find(|e| e.ip == entry.ip) {
            *existing = entry;
            return;
        }
        if self.cache.is_full() {
            // Evict the least recently used binding.
            if let Some(idx) = self
                .cache
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(i, _)| i)
            {
                self.cache.remove(idx);
            }
        }
        self.cache.push(entry);
    }

    fn learn(&mut self, ip: Addr, mac: MacAddr, iface: &mut dyn NetDispatch) {
        if !ip.is_unicast() || !mac.is_unicast() {
            return;
        }
        self.lru_tick += 1;
        self.insert(Entry {
            ip,
            mac,
            state: EntryState::Resolved { since: self.now },
            last_used: self.lru_tick,
        });
        for l in self.listeners.iter_mut() {
            l.arp_resolved(ip, mac);
        }
        // Release any frame parked on this destination.
        if let Some(idx) = self.pending.iter().position(|(p, _)| *p == ip) {
            let (_, frame) = self.pending.remove(idx);
            if let Some(wr) = iface.open_reply(Type::from_u16(ETYPE_IPV4), frame.len()) {
                wr.write_bytes(&frame);
                wr.write_finalize();
            }
        }
    }
}

fn send_request(eth: &mut TxCore, local_mac: MacAddr, local_ip: Addr, target: Addr) {
    if let Some(wr) = eth.open_write(MacAddr::BROADCAST, None, ETYPE_ARP, ARP_LEN) {
        write_arp(wr, OPER_REQUEST, local_mac, local_ip, MacAddr::default(), target);
        wr.write_finalize();
    }
}

fn send_ipv4(eth: &mut TxCore, dst: MacAddr, payload: &[u8]) -> bool {
    match eth.open_write(dst, None, ETYPE_IPV4, payload.len()) {
        Some(wr) => {
            wr.write_bytes(payload);
            wr.write_finalize()
        }
        None => false,
    }
}

fn write_arp(wr: &mut dyn Writeable, oper: u16, sha: MacAddr, spa: Addr, tha: MacAddr, tpa: Addr) {
    wr.write_u16(1); // Ethernet
    wr.write_u16(ETYPE_IPV4);
    wr.write_u8(6);
    wr.write_u8(4);
    wr.write_u16(oper);
    wr.write_bytes(&sha.0);
    wr.write_bytes(&spa.octets());
    wr.write_bytes(&tha.0);
    wr.write_bytes(&tpa.octets());
}

impl Protocol for ProtoArp {
    fn net_type(&self) -> Type {
        Type::from_u16(ETYPE_ARP)
    }

    fn frame_rcvd(&mut self, src: &mut LimitedRead<'_>, iface: &mut dyn NetDispatch) {
        let (Some(htype), Some(ptype), Some(hlen), Some(plen), Some(oper)) = (
            src.read_u16(),
            src.read_u16(),
            src.read_u8(),
            src.read_u8(),
            src.read_u16(),
        ) else {
            return;
        };
        if htype != 1 || ptype != ETYPE_IPV4 || hlen != 6 || plen != 4 {
            return;
        }
        let (Some(sha), Some(spa), Some(_tha), Some(tpa)) = (
            src.read_array::<6>().map(MacAddr),
            src.read_array::<4>().map(Addr::from_octets),
            src.read_array::<6>().map(MacAddr),
            src.read_array::<4>().map(Addr::from_octets),
        ) else {
            return;
        };

        // Any valid sender binding updates the cache (gratuitous included).
        self.learn(spa, sha, iface);

        if oper == OPER_REQUEST && tpa == self.local_ip && self.local_ip != Addr::ANY {
            if let Some(wr) = iface.open_reply(Type::from_u16(ETYPE_ARP), ARP_LEN) {
                write_arp(wr, OPER_REPLY, self.local_mac, self.local_ip, sha, spa);
                wr.write_finalize();
            }
        }
    }

    fn as_any(&mut self) -> &mut dyn core::any::Any {
        self
    }
}
