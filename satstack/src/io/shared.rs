use alloc::rc::Rc;
use core::cell::RefCell;

use super::{PacketBuffer, Readable, Writeable};
use crate::poll::Notify;

/// A clonable handle to a [PacketBuffer], for wiring one buffer between an
/// owner on each side (e.g. a dispatch's transmit port and the test or
/// driver loop that drains it).
///
/// Single-threaded by construction; the poll loop is the only execution
/// context, so `RefCell` borrows never overlap.
#[derive(Debug, Clone)]
pub struct SharedBuffer(Rc<RefCell<PacketBuffer>>);

impl SharedBuffer {
    pub fn new(capacity: usize) -> Self {
        SharedBuffer(Rc::new(RefCell::new(PacketBuffer::new(capacity))))
    }

    pub fn new_stream(capacity: usize) -> Self {
        SharedBuffer(Rc::new(RefCell::new(PacketBuffer::new_stream(capacity))))
    }

    pub fn stored_packets(&self) -> usize {
        self.0.borrow().stored_packets()
    }

    pub fn stored_bytes(&self) -> usize {
        self.0.borrow().stored_bytes()
    }

    /// Run a closure with direct access to the buffer.
    pub fn with<R>(&self, f: impl FnOnce(&mut PacketBuffer) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }
}

impl Readable for SharedBuffer {
    fn get_read_ready(&self) -> usize {
        self.0.borrow().get_read_ready()
    }

    fn read_next(&mut self) -> u8 {
        self.0.borrow_mut().read_next()
    }

    fn read_finalize(&mut self) {
        self.0.borrow_mut().read_finalize()
    }

    fn set_callback(&mut self, notify: Option<Notify>) {
        self.0.borrow_mut().set_callback(notify)
    }
}

impl Writeable for SharedBuffer {
    fn get_write_space(&self) -> usize {
        self.0.borrow().get_write_space()
    }

    fn write_next(&mut self, byte: u8) {
        self.0.borrow_mut().write_next(byte)
    }

    fn write_overflow(&mut self) {
        self.0.borrow_mut().write_overflow()
    }

    fn write_finalize(&mut self) -> bool {
        self.0.borrow_mut().write_finalize()
    }

    fn write_abort(&mut self) {
        self.0.borrow_mut().write_abort()
    }
}
