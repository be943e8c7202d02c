//! Reference-counted packet fan-out
//!
//! A [MultiBuffer] stores each committed packet once and delivers it to
//! every attached reader; storage is recycled when the last reader has
//! consumed the packet. Writers carry a priority, and priority-aware
//! readers drain higher-priority traffic first. This is the building block
//! for software switch ports and test taps.

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use super::{Readable, Writeable};

const DEFAULT_POOL: usize = 8;

#[derive(Debug)]
struct Packet {
    seq: u64,
    prio: u8,
    data: Vec<u8>,
    refs: usize,
}

#[derive(Debug, Default)]
struct Core {
    packets: VecDeque<Packet>,
    freelist: Vec<Vec<u8>>,
    next_seq: u64,
    readers: usize,
    max_frame: usize,
}

impl Core {
    fn take_buffer(&mut self) -> Vec<u8> {
        self.freelist.pop().unwrap_or_else(|| Vec::with_capacity(self.max_frame))
    }

    fn recycle(&mut self) {
        while let Some(front) = self.packets.front() {
            if front.refs > 0 {
                break;
            }
            let mut pkt = self.packets.pop_front().unwrap();
            pkt.data.clear();
            self.freelist.push(pkt.data);
        }
    }
}

/// Shared packet pool; create writers and readers from this handle.
#[derive(Debug, Clone)]
pub struct MultiBuffer {
    core: Rc<RefCell<Core>>,
}

impl MultiBuffer {
    /// `max_frame` bounds each packet; `pool` buffers are preallocated so
    /// steady-state operation does not allocate.
    pub fn new(max_frame: usize) -> Self {
        let mut core = Core {
            max_frame,
            ..Core::default()
        };
        for _ in 0..DEFAULT_POOL {
            core.freelist.push(Vec::with_capacity(max_frame));
        }
        MultiBuffer {
            core: Rc::new(RefCell::new(core)),
        }
    }

    pub fn add_writer(&self, prio: u8) -> MultiWriter {
        let scratch = self.core.borrow_mut().take_buffer();
        MultiWriter {
            core: self.core.clone(),
            prio,
            scratch,
            ovr: false,
        }
    }

    /// A plain reader sees packets in commit order.
    pub fn add_reader(&self) -> MultiReader {
        self.attach(false)
    }

    /// A priority reader sees higher-priority packets first, FIFO within
    /// one priority level.
    pub fn add_reader_priority(&self) -> MultiReader {
        self.attach(true)
    }

    fn attach(&self, priority: bool) -> MultiReader {
        let mut core = self.core.borrow_mut();
        core.readers += 1;
        MultiReader {
            core: self.core.clone(),
            joined_seq: core.next_seq,
            consumed: Vec::new(),
            cur: None,
            pos: 0,
            priority,
        }
    }
}

/// One ingress into a [MultiBuffer].
#[derive(Debug)]
pub struct MultiWriter {
    core: Rc<RefCell<Core>>,
    prio: u8,
    scratch: Vec<u8>,
    ovr: bool,
}

impl Writeable for MultiWriter {
    fn get_write_space(&self) -> usize {
        self.core.borrow().max_frame - self.scratch.len()
    }

    fn write_next(&mut self, byte: u8) {
        if self.scratch.len() < self.core.borrow().max_frame {
            self.scratch.push(byte);
        } else {
            self.ovr = true;
        }
    }

    fn write_overflow(&mut self) {
        self.ovr = true;
    }

    fn write_finalize(&mut self) -> bool {
        if self.ovr || self.scratch.is_empty() {
            let failed = self.ovr;
            self.scratch.clear();
            self.ovr = false;
            return !failed;
        }
        let mut core = self.core.borrow_mut();
        let mut data = core.take_buffer();
        core::mem::swap(&mut data, &mut self.scratch);
        let seq = core.next_seq;
        core.next_seq += 1;
        let refs = core.readers;
        core.packets.push_back(Packet {
            seq,
            prio: self.prio,
            data,
            refs,
        });
        if refs == 0 {
            // Nobody listening: recycle immediately.
            drop(core);
            self.core.borrow_mut().recycle();
        }
        true
    }

    fn write_abort(&mut self) {
        self.scratch.clear();
        self.ovr = false;
    }
}

/// One egress from a [MultiBuffer]; sees every packet committed after it
/// attached. Packets are read in place from the shared pool.
#[derive(Debug)]
pub struct MultiReader {
    core: Rc<RefCell<Core>>,
    joined_seq: u64,
    consumed: Vec<u64>,
    cur: Option<u64>,
    pos: usize,
    priority: bool,
}

impl MultiReader {
    /// Pick the sequence number of the next pending packet.
    fn next_seq(&self, core: &Core) -> Option<u64> {
        let mut best: Option<(u8, u64)> = None;
        for pkt in core.packets.iter() {
            if pkt.seq < self.joined_seq || self.consumed.contains(&pkt.seq) {
                continue;
            }
            match best {
                None => best = Some((pkt.prio, pkt.seq)),
                Some((bp, _)) if self.priority && pkt.prio > bp => {
                    best = Some((pkt.prio, pkt.seq))
                }
                _ => {}
            }
            if best.is_some() && !self.priority {
                break; // FIFO: first match wins.
            }
        }
        best.map(|(_, seq)| seq)
    }

    fn select(&mut self) {
        if self.cur.is_none() {
            self.cur = self.next_seq(&self.core.borrow());
            self.pos = 0;
        }
    }
}

impl Readable for MultiReader {
    fn get_read_ready(&self) -> usize {
        let core = self.core.borrow();
        let seq = match self.cur {
            Some(seq) => Some(seq),
            None => self.next_seq(&core),
        };
        seq.and_then(|seq| core.packets.iter().find(|p| p.seq == seq))
            .map_or(0, |pkt| pkt.data.len() - self.pos)
    }

    fn read_next(&mut self) -> u8 {
        self.select();
        let core = self.core.borrow();
        let seq = self.cur.expect("read_next without ready data");
        let pkt = core.packets.iter().find(|p| p.seq == seq).unwrap();
        let b = pkt.data[self.pos];
        self.pos += 1;
        b
    }

    fn read_finalize(&mut self) {
        self.select();
        let Some(seq) = self.cur.take() else { return };
        self.pos = 0;
        let mut core = self.core.borrow_mut();
        if let Some(pkt) = core.packets.iter_mut().find(|p| p.seq == seq) {
            pkt.refs -= 1;
            self.consumed.push(seq);
        }
        core.recycle();
        let floor = core.packets.front().map(|front| front.seq);
        self.consumed.retain(|&s| floor.map_or(false, |f| s >= f));
    }
}

impl Drop for MultiReader {
    fn drop(&mut self) {
        #[cfg(feature = "teardown")]
        {
            let mut core = self.core.borrow_mut();
            core.readers -= 1;
            let joined = self.joined_seq;
            for pkt in core.packets.iter_mut() {
                if pkt.seq >= joined && !self.consumed.contains(&pkt.seq) {
                    pkt.refs -= 1;
                }
            }
            core.recycle();
        }
    }
}
