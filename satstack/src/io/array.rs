//! Single-packet streams over caller-provided buffers

use super::{Readable, Writeable};

/// Reads a single packet from a borrowed byte slice.
pub struct ArrayRead<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ArrayRead<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ArrayRead { buf, pos: 0 }
    }

    /// Restart reading from the beginning of the slice.
    pub fn read_reset(&mut self) {
        self.pos = 0;
    }
}

impl Readable for ArrayRead<'_> {
    fn get_read_ready(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_next(&mut self) -> u8 {
        let b = self.buf[self.pos];
        self.pos += 1;
        b
    }

    fn read_finalize(&mut self) {
        self.pos = self.buf.len();
    }
}

/// Writes a single packet into a borrowed byte slice.
///
/// After a successful finalize, [ArrayWrite::written] reports the committed
/// length and the cursor rewinds for the next packet.
pub struct ArrayWrite<'a> {
    buf: &'a mut [u8],
    pos: usize,
    ovr: bool,
    written: usize,
}

impl<'a> ArrayWrite<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        ArrayWrite {
            buf,
            pos: 0,
            ovr: false,
            written: 0,
        }
    }

    /// Length of the most recently finalized packet.
    pub fn written(&self) -> usize {
        self.written
    }

    /// The bytes of the most recently finalized packet.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.written]
    }
}

impl Writeable for ArrayWrite<'_> {
    fn get_write_space(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn write_next(&mut self, byte: u8) {
        self.buf[self.pos] = byte;
        self.pos += 1;
    }

    fn write_overflow(&mut self) {
        self.ovr = true;
    }

    fn write_finalize(&mut self) -> bool {
        let ok = !self.ovr;
        self.written = if ok { self.pos } else { 0 };
        self.pos = 0;
        self.ovr = false;
        ok
    }

    fn write_abort(&mut self) {
        self.pos = 0;
        self.ovr = false;
    }
}
