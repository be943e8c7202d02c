//! Shared-interrupt demultiplexing
//!
//! Every ConfigBus peripheral shares one physical interrupt line. When it
//! fires, [IrqDispatch::irq_poll] walks the registered handlers, reads
//! each one's interrupt-status register, acknowledges by writing the bits
//! back, and invokes the handler. Status bits that become set during the
//! walk trigger another pass; the caller re-arms the line only after
//! `irq_poll` returns.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::ConfigBus;
use crate::util::RegistryList;

/// One peripheral's slice of the shared interrupt.
pub trait IrqHandler {
    /// Combined address of the peripheral's interrupt-status register.
    fn status_regaddr(&self) -> u32;

    /// Called after a non-zero status was read and acknowledged.
    fn irq_event(&mut self, status: u32, bus: &mut dyn ConfigBus);
}

struct Entry {
    handler: Box<dyn IrqHandler>,
}

/// Registry and poll loop for the shared ConfigBus interrupt.
#[derive(Default)]
pub struct IrqDispatch {
    handlers: RegistryList<Entry>,
    event_count: u32,
}

impl IrqDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Mutations of this set must not race the poll;
    /// take an [AtomicLock] when calling from outside the poll context.
    pub fn register(&mut self, handler: Box<dyn IrqHandler>) {
        self.handlers.add(Entry { handler });
    }

    /// Remove the handler watching the given status register.
    #[cfg(feature = "teardown")]
    pub fn unregister(&mut self, status_regaddr: u32) -> bool {
        self.handlers
            .remove_where(|e| e.handler.status_regaddr() == status_regaddr)
            .is_some()
    }

    pub fn count_irq(&self) -> usize {
        self.handlers.len()
    }

    /// Total handler callbacks issued.
    pub fn event_count(&self) -> u32 {
        self.event_count
    }

    /// Service every pending peripheral interrupt.
    ///
    /// Repeats the walk until a pass finds nothing pending, so a status
    /// bit raised between acknowledge and return is not lost. Bus faults
    /// on the status read skip that handler for the pass.
    pub fn irq_poll(&mut self, bus: &mut dyn ConfigBus) {
        loop {
            let mut fired = false;
            for entry in self.handlers.iter_mut() {
                let addr = entry.handler.status_regaddr();
                let status = match bus.read(addr) {
                    Ok(s) => s,
                    Err(e) => {
                        log::error!("IRQ status read failed at {addr}: {e:?}");
                        continue;
                    }
                };
                if status == 0 {
                    continue;
                }
                // Acknowledge before dispatch: edges during the handler
                // re-assert and are caught on the follow-up pass.
                if let Err(e) = bus.write(addr, status) {
                    log::error!("IRQ acknowledge failed at {addr}: {e:?}");
                    continue;
                }
                self.event_count = self.event_count.wrapping_add(1);
                entry.handler.irq_event(status, bus);
                fired = true;
            }
            if !fired {
                break;
            }
        }
    }
}

static IRQ_DISABLE: AtomicUsize = AtomicUsize::new(0);
static IRQ_ENABLE: AtomicUsize = AtomicUsize::new(0);
static IRQ_DEPTH: AtomicU32 = AtomicU32::new(0);

/// Install the platform's interrupt mask/unmask hooks. Hosted builds and
/// tests may leave these unset; [AtomicLock] is then a no-op.
pub fn set_irq_hooks(disable: fn(), enable: fn()) {
    IRQ_DISABLE.store(disable as usize, Ordering::Release);
    IRQ_ENABLE.store(enable as usize, Ordering::Release);
}

/// Scoped critical section against the hardware interrupt.
///
/// Nests: interrupts are re-enabled when the outermost guard drops. Hold
/// one around handler-list mutations and anything else shared with ISRs.
pub struct AtomicLock(());

impl AtomicLock {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        if IRQ_DEPTH.fetch_add(1, Ordering::AcqRel) == 0 {
            let f = IRQ_DISABLE.load(Ordering::Acquire);
            if f != 0 {
                let f: fn() = unsafe { core::mem::transmute(f) };
                f();
            }
        }
        AtomicLock(())
    }
}

impl Drop for AtomicLock {
    fn drop(&mut self) {
        if IRQ_DEPTH.fetch_sub(1, Ordering::AcqRel) == 1 {
            let f = IRQ_ENABLE.load(Ordering::Acquire);
            if f != 0 {
                let f: fn() = unsafe { core::mem::transmute(f) };
                f();
            }
        }
    }
}
