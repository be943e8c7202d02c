//! FIFO of length-delimited packets over a byte ring

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

use super::{Readable, Writeable};
use crate::poll::Notify;

/// A FIFO queue of packets over a fixed byte ring.
///
/// The backing storage is allocated once at construction; enqueue and
/// dequeue never allocate. A finalize that does not fit is rejected as a
/// whole: either every byte of the packet is committed or none are.
///
/// In stream mode (`max_packets == 0` at construction in the original;
/// here [PacketBuffer::new_stream]) bytes become readable at finalize but
/// carry no packet boundaries, which suits byte pipes such as UARTs.
#[derive(Debug)]
pub struct PacketBuffer {
    buf: Vec<u8>,
    rd_pos: usize,
    rd_rem: usize,
    cur_active: bool,
    wr_pos: usize,
    wr_len: usize,
    committed: usize,
    ovr: bool,
    stream: bool,
    lens: VecDeque<usize>,
    notify: Option<Notify>,
}

impl PacketBuffer {
    /// Packet-mode buffer with the given byte capacity.
    pub fn new(capacity: usize) -> Self {
        PacketBuffer {
            buf: vec![0; capacity],
            rd_pos: 0,
            rd_rem: 0,
            cur_active: false,
            wr_pos: 0,
            wr_len: 0,
            committed: 0,
            ovr: false,
            stream: false,
            lens: VecDeque::new(),
            notify: None,
        }
    }

    /// Stream-mode buffer: no packet boundaries on the read side.
    pub fn new_stream(capacity: usize) -> Self {
        let mut b = Self::new(capacity);
        b.stream = true;
        b
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Total committed bytes waiting to be read.
    pub fn stored_bytes(&self) -> usize {
        self.committed
    }

    /// Number of complete packets waiting, including the one being read.
    pub fn stored_packets(&self) -> usize {
        self.lens.len() + usize::from(self.cur_active)
    }

    fn free_space(&self) -> usize {
        self.buf.len() - self.committed - self.wr_len
    }

    fn pop_packet(&mut self) {
        if !self.cur_active {
            if let Some(len) = self.lens.pop_front() {
                self.rd_rem = len;
                self.cur_active = true;
            }
        }
    }
}

impl Writeable for PacketBuffer {
    fn get_write_space(&self) -> usize {
        if self.ovr {
            0
        } else {
            self.free_space()
        }
    }

    fn write_next(&mut self, byte: u8) {
        if self.free_space() == 0 {
            self.ovr = true;
            return;
        }
        let pos = (self.wr_pos + self.wr_len) % self.buf.len();
        self.buf[pos] = byte;
        self.wr_len += 1;
    }

    fn write_overflow(&mut self) {
        self.ovr = true;
    }

    fn write_finalize(&mut self) -> bool {
        if self.ovr {
            self.wr_len = 0;
            self.ovr = false;
            return false;
        }
        if self.wr_len == 0 && !self.stream {
            return true; // Empty packets are not queued.
        }
        self.committed += self.wr_len;
        self.wr_pos = (self.wr_pos + self.wr_len) % self.buf.len();
        if !self.stream {
            self.lens.push_back(self.wr_len);
        }
        self.wr_len = 0;
        if let Some(n) = &self.notify {
            n.raise();
        }
        true
    }

    fn write_abort(&mut self) {
        self.wr_len = 0;
        self.ovr = false;
    }
}

impl Readable for PacketBuffer {
    fn get_read_ready(&self) -> usize {
        if self.stream {
            self.committed
        } else if self.cur_active {
            self.rd_rem
        } else {
            self.lens.front().copied().unwrap_or(0)
        }
    }

    fn read_next(&mut self) -> u8 {
        if !self.stream {
            self.pop_packet();
            self.rd_rem -= 1;
        }
        let b = self.buf[self.rd_pos];
        self.rd_pos = (self.rd_pos + 1) % self.buf.len();
        self.committed -= 1;
        b
    }

    fn read_finalize(&mut self) {
        if self.stream {
            return;
        }
        self.pop_packet();
        self.rd_pos = (self.rd_pos + self.rd_rem) % self.buf.len();
        self.committed -= self.rd_rem;
        self.rd_rem = 0;
        self.cur_active = false;
    }

    fn set_callback(&mut self, notify: Option<Notify>) {
        self.notify = notify;
    }
}
