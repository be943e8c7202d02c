//! ConfigBus: uniform memory-mapped register access
//!
//! ConfigBus is the multipurpose register interface shared by all
//! peripherals. A bus presents up to 256 devices of 1024 registers each,
//! addressed by a combined index; the backend may be a direct memory map
//! ([Mmap]) or a command/acknowledge exchange with a remote host
//! ([Remote]). Peripherals are written against the [ConfigBus] trait and
//! work over either.

mod irq;
mod mmap;
mod remote;

pub use irq::{set_irq_hooks, AtomicLock, IrqDispatch, IrqHandler};
pub use mmap::Mmap;
pub use remote::{Remote, RemoteServer, RemoteTransport};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Fixed bus geometry.
pub const REGS_PER_DEVICE: u32 = 1024;
pub const MAX_DEVICES: u32 = 256;
pub const MAX_TOTAL_REGS: u32 = REGS_PER_DEVICE * MAX_DEVICES;

/// Combined register address: `1024 * device + register`.
pub const fn regaddr(dev: u32, reg: u32) -> u32 {
    REGS_PER_DEVICE * dev + reg
}

/// Status of a single bus operation.
///
/// The discriminants are the wire encoding used by the remote transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum IoStatus {
    Ok = 0,
    BusError = 1,
    CmdError = 2,
    Timeout = 3,
}

/// Bus operations return the failing status in the error position;
/// `IoStatus::Ok` never appears there.
pub type IoResult<T> = Result<T, IoStatus>;

/// Uniform register access, local or remote.
///
/// The bulk operations exist because a remote transport amortizes its
/// per-packet overhead across many registers; the default implementations
/// are the trivial loops a local bus needs.
pub trait ConfigBus {
    /// Read one register at a combined address.
    fn read(&mut self, regaddr: u32) -> IoResult<u32>;

    /// Write one register at a combined address.
    fn write(&mut self, regaddr: u32, val: u32) -> IoResult<()>;

    /// Read `out.len()` registers at consecutive addresses.
    fn read_array(&mut self, regaddr: u32, out: &mut [u32]) -> IoResult<()> {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.read(regaddr + i as u32)?;
        }
        Ok(())
    }

    /// Read the same register `out.len()` times (e.g. draining a FIFO).
    fn read_repeat(&mut self, regaddr: u32, out: &mut [u32]) -> IoResult<()> {
        for slot in out.iter_mut() {
            *slot = self.read(regaddr)?;
        }
        Ok(())
    }

    /// Write `data.len()` registers at consecutive addresses.
    fn write_array(&mut self, regaddr: u32, data: &[u32]) -> IoResult<()> {
        for (i, &val) in data.iter().enumerate() {
            self.write(regaddr + i as u32, val)?;
        }
        Ok(())
    }

    /// Write the same register `data.len()` times (e.g. filling a FIFO).
    fn write_repeat(&mut self, regaddr: u32, data: &[u32]) -> IoResult<()> {
        for &val in data {
            self.write(regaddr, val)?;
        }
        Ok(())
    }
}

/// Address-only handle for a device's register window.
///
/// The handle carries no bus reference; callers pass the bus at each
/// access. `read(bus, n)` / `write(bus, n, v)` are the indexed accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrappedRegister {
    base: u32,
}

impl WrappedRegister {
    pub const fn new(dev: u32, reg: u32) -> Self {
        WrappedRegister { base: regaddr(dev, reg) }
    }

    pub const fn at(base: u32) -> Self {
        WrappedRegister { base }
    }

    pub const fn addr(&self) -> u32 {
        self.base
    }

    /// Handle offset by `idx` registers.
    pub const fn offset(&self, idx: u32) -> Self {
        WrappedRegister { base: self.base + idx }
    }

    pub fn read(&self, bus: &mut dyn ConfigBus, idx: u32) -> IoResult<u32> {
        bus.read(self.base + idx)
    }

    pub fn write(&self, bus: &mut dyn ConfigBus, idx: u32, val: u32) -> IoResult<()> {
        bus.write(self.base + idx, val)
    }
}

/// Volatile-pointer register handle, available when every bus in the
/// system is memory-mapped. The bus argument is accepted and ignored so
/// peripheral code compiles identically either way.
#[cfg(feature = "cfgbus-direct")]
#[derive(Debug, Clone, Copy)]
pub struct DirectRegister {
    ptr: *mut u32,
}

#[cfg(feature = "cfgbus-direct")]
impl DirectRegister {
    /// Safety: `ptr` must point at a mapped register window valid for the
    /// life of the handle.
    pub const unsafe fn new(ptr: *mut u32) -> Self {
        DirectRegister { ptr }
    }

    pub fn offset(&self, idx: u32) -> Self {
        DirectRegister { ptr: self.ptr.wrapping_add(idx as usize) }
    }

    pub fn read(&self, _bus: &mut dyn ConfigBus, idx: u32) -> IoResult<u32> {
        Ok(unsafe { self.ptr.add(idx as usize).read_volatile() })
    }

    pub fn write(&self, _bus: &mut dyn ConfigBus, idx: u32, val: u32) -> IoResult<()> {
        unsafe { self.ptr.add(idx as usize).write_volatile(val) };
        Ok(())
    }
}

#[cfg(not(feature = "cfgbus-direct"))]
pub type Register = WrappedRegister;
#[cfg(feature = "cfgbus-direct")]
pub type Register = DirectRegister;

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    /// In-memory bus with a fault window for error-path tests.
    pub struct TestBus {
        pub regs: Vec<u32>,
        pub fault_at: Option<u32>,
    }

    impl TestBus {
        pub fn new(nregs: usize) -> Self {
            TestBus { regs: vec![0; nregs], fault_at: None }
        }
    }

    impl ConfigBus for TestBus {
        fn read(&mut self, regaddr: u32) -> IoResult<u32> {
            if self.fault_at == Some(regaddr) {
                return Err(IoStatus::BusError);
            }
            self.regs
                .get(regaddr as usize)
                .copied()
                .ok_or(IoStatus::CmdError)
        }

        fn write(&mut self, regaddr: u32, val: u32) -> IoResult<()> {
            if self.fault_at == Some(regaddr) {
                return Err(IoStatus::BusError);
            }
            match self.regs.get_mut(regaddr as usize) {
                Some(slot) => {
                    *slot = val;
                    Ok(())
                }
                None => Err(IoStatus::CmdError),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::TestBus;
    use super::*;

    #[test]
    fn combined_addressing() {
        assert_eq!(regaddr(0, 0), 0);
        assert_eq!(regaddr(1, 0), 1024);
        assert_eq!(regaddr(3, 7), 3079);
        assert_eq!(MAX_TOTAL_REGS, 262_144);
    }

    #[test]
    fn register_handle() {
        let mut bus = TestBus::new(4096);
        let reg = WrappedRegister::new(2, 16);
        reg.write(&mut bus, 0, 0xAA55).unwrap();
        reg.write(&mut bus, 3, 0x1234).unwrap();
        assert_eq!(bus.regs[2064], 0xAA55);
        assert_eq!(reg.read(&mut bus, 3).unwrap(), 0x1234);
        assert_eq!(reg.offset(3).read(&mut bus, 0).unwrap(), 0x1234);
    }

    #[test]
    fn bulk_defaults() {
        let mut bus = TestBus::new(64);
        bus.write_array(8, &[1, 2, 3, 4]).unwrap();
        assert_eq!(&bus.regs[8..12], &[1, 2, 3, 4]);

        let mut out = [0u32; 4];
        bus.read_array(8, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        bus.write_repeat(20, &[7, 8]).unwrap();
        assert_eq!(bus.regs[20], 8); // Last write wins on a plain register.

        bus.read_repeat(8, &mut out[..2]).unwrap();
        assert_eq!(&out[..2], &[1, 1]);
    }

    #[test]
    fn errors_surface_synchronously() {
        let mut bus = TestBus::new(16);
        bus.fault_at = Some(5);
        assert_eq!(bus.read(5), Err(IoStatus::BusError));
        // A bulk op stops at the fault.
        let mut out = [0u32; 8];
        assert_eq!(bus.read_array(2, &mut out), Err(IoStatus::BusError));
        assert_eq!(bus.write(9999, 0), Err(IoStatus::CmdError));
    }

    #[test]
    fn iostatus_wire_encoding() {
        assert_eq!(u8::from(IoStatus::Ok), 0);
        assert_eq!(u8::from(IoStatus::BusError), 1);
        assert_eq!(u8::from(IoStatus::CmdError), 2);
        assert_eq!(u8::from(IoStatus::Timeout), 3);
        assert_eq!(IoStatus::try_from(3u8), Ok(IoStatus::Timeout));
        assert!(IoStatus::try_from(4u8).is_err());
    }
}
