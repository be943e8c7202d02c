//! Forwarding helpers between sources and sinks

use super::{PacketBuffer, Readable, Writeable};
use crate::poll::Notify;

/// Forwards complete packets from a source to a sink.
///
/// Service from the poll loop: register the source's callback with an
/// OnDemand task and call [BufferedCopy::poll] when it fires (or every
/// cycle; polling an empty source is cheap).
#[derive(Debug)]
pub struct BufferedCopy<R, W> {
    src: R,
    dst: W,
}

impl<R: Readable, W: Writeable> BufferedCopy<R, W> {
    pub fn new(src: R, dst: W) -> Self {
        BufferedCopy { src, dst }
    }

    pub fn src_mut(&mut self) -> &mut R {
        &mut self.src
    }

    pub fn dst_mut(&mut self) -> &mut W {
        &mut self.dst
    }

    /// Forward every complete packet currently queued. Returns the number
    /// of packets forwarded; packets that do not fit downstream are kept
    /// for a later attempt.
    pub fn poll(&mut self) -> usize {
        let mut forwarded = 0;
        loop {
            let len = self.src.get_read_ready();
            if len == 0 {
                break;
            }
            if self.dst.get_write_space() < len {
                break; // Retry after the sink drains.
            }
            self.src.copy_to(&mut self.dst);
            self.src.read_finalize();
            if self.dst.write_finalize() {
                forwarded += 1;
            }
        }
        forwarded
    }
}

/// Adds an elastic buffer in front of any sink.
///
/// Writers see a [PacketBuffer]; [BufferedWriter::poll] drains it to the
/// sink when the sink has room.
#[derive(Debug)]
pub struct BufferedWriter<W> {
    buff: PacketBuffer,
    dst: W,
}

impl<W: Writeable> BufferedWriter<W> {
    pub fn new(dst: W, capacity: usize) -> Self {
        BufferedWriter {
            buff: PacketBuffer::new(capacity),
            dst,
        }
    }

    pub fn dst_mut(&mut self) -> &mut W {
        &mut self.dst
    }

    pub fn poll(&mut self) -> usize {
        let mut forwarded = 0;
        loop {
            let len = self.buff.get_read_ready();
            if len == 0 || self.dst.get_write_space() < len {
                break;
            }
            self.buff.copy_to(&mut self.dst);
            self.buff.read_finalize();
            if self.dst.write_finalize() {
                forwarded += 1;
            }
        }
        forwarded
    }
}

impl<W: Writeable> Writeable for BufferedWriter<W> {
    fn get_write_space(&self) -> usize {
        self.buff.get_write_space()
    }

    fn write_next(&mut self, byte: u8) {
        self.buff.write_next(byte)
    }

    fn write_overflow(&mut self) {
        self.buff.write_overflow()
    }

    fn write_finalize(&mut self) -> bool {
        self.buff.write_finalize()
    }

    fn write_abort(&mut self) {
        self.buff.write_abort()
    }
}

impl<W> BufferedWriter<W> {
    pub fn set_callback(&mut self, notify: Option<Notify>) {
        self.buff.set_callback(notify);
    }
}
