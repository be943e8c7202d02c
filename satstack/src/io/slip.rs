//! SLIP framing (RFC 1055) between byte pipes and packet streams

use super::Writeable;

const SLIP_END: u8 = 0xC0;
const SLIP_ESC: u8 = 0xDB;
const SLIP_ESC_END: u8 = 0xDC;
const SLIP_ESC_ESC: u8 = 0xDD;

/// Encodes packets onto a byte-oriented sink.
///
/// Each finalized packet is emitted with SLIP escaping and a trailing END
/// delimiter, committed to the sink as one unit.
#[derive(Debug)]
pub struct SlipEncoder<W> {
    dst: W,
    ovr: bool,
}

impl<W: Writeable> SlipEncoder<W> {
    pub fn new(dst: W) -> Self {
        SlipEncoder { dst, ovr: false }
    }

    pub fn dst_mut(&mut self) -> &mut W {
        &mut self.dst
    }
}

impl<W: Writeable> Writeable for SlipEncoder<W> {
    fn get_write_space(&self) -> usize {
        // Worst case every remaining byte needs an escape, plus END.
        self.dst.get_write_space().saturating_sub(1) / 2
    }

    fn write_next(&mut self, byte: u8) {
        match byte {
            SLIP_END => {
                self.dst.write_next(SLIP_ESC);
                self.dst.write_next(SLIP_ESC_END);
            }
            SLIP_ESC => {
                self.dst.write_next(SLIP_ESC);
                self.dst.write_next(SLIP_ESC_ESC);
            }
            other => self.dst.write_next(other),
        }
    }

    fn write_overflow(&mut self) {
        self.ovr = true;
    }

    fn write_finalize(&mut self) -> bool {
        if self.ovr {
            self.ovr = false;
            self.dst.write_abort();
            return false;
        }
        self.dst.write_next(SLIP_END);
        self.dst.write_finalize()
    }

    fn write_abort(&mut self) {
        self.ovr = false;
        self.dst.write_abort();
    }
}

/// Decodes a SLIP byte stream into packets.
///
/// Push raw bytes in with the [Writeable] interface (finalize after each
/// chunk; chunk boundaries are meaningless); complete frames come out on
/// the inner sink. A malformed escape drops the frame and counts it.
#[derive(Debug)]
pub struct SlipDecoder<W> {
    dst: W,
    esc: bool,
    bad: bool,
    drop_count: u32,
}

impl<W: Writeable> SlipDecoder<W> {
    pub fn new(dst: W) -> Self {
        SlipDecoder {
            dst,
            esc: false,
            bad: false,
            drop_count: 0,
        }
    }

    pub fn dst_mut(&mut self) -> &mut W {
        &mut self.dst
    }

    /// Frames discarded due to code violations.
    pub fn drop_count(&self) -> u32 {
        self.drop_count
    }

    fn push(&mut self, byte: u8) {
        match (self.esc, byte) {
            (false, SLIP_END) => {
                if self.bad {
                    self.bad = false;
                    self.drop_count = self.drop_count.wrapping_add(1);
                    self.dst.write_abort();
                } else if !self.dst.write_finalize() {
                    self.drop_count = self.drop_count.wrapping_add(1);
                }
            }
            (false, SLIP_ESC) => self.esc = true,
            (false, b) => self.dst.write_bytes(&[b]),
            (true, SLIP_ESC_END) => {
                self.esc = false;
                self.dst.write_bytes(&[SLIP_END]);
            }
            (true, SLIP_ESC_ESC) => {
                self.esc = false;
                self.dst.write_bytes(&[SLIP_ESC]);
            }
            (true, b) => {
                // Code violation: discard frame through the next END.
                log::debug!("SLIP decode error (0x{b:02X})");
                self.esc = false;
                self.bad = true;
            }
        }
    }
}

impl<W: Writeable> Writeable for SlipDecoder<W> {
    fn get_write_space(&self) -> usize {
        usize::MAX
    }

    fn write_next(&mut self, byte: u8) {
        self.push(byte);
    }

    fn write_overflow(&mut self) {}

    fn write_finalize(&mut self) -> bool {
        true // Chunk boundaries carry no meaning.
    }

    fn write_abort(&mut self) {}
}
