//! ConfigBus over a network transport
//!
//! Commands and acknowledgements are small frames carried by any packet
//! transport (raw Ethernet, UDP, a serial link). One transaction is
//! outstanding at a time; a lost acknowledgement surfaces as
//! [IoStatus::Timeout] and is never retried here — the caller decides.

use crate::cfg::{ConfigBus, IoResult, IoStatus};
use crate::io::{ArrayRead, ArrayWrite, Readable, Writeable};
use crate::time::Time;

const OPCODE_READ: u8 = 0x52;
const OPCODE_READ_RPT: u8 = 0x72;
const OPCODE_WRITE: u8 = 0x57;
const OPCODE_WRITE_RPT: u8 = 0x77;
const OPCODE_ACK: u8 = 0x80;

/// Registers per bulk transaction; larger requests are split.
pub const MAX_BULK_REGS: usize = 64;

const CMD_HDR: usize = 8; // opcode, seq, addr, count
const FRAME_MAX: usize = CMD_HDR + 4 * MAX_BULK_REGS;

/// The wire seam under a [Remote] bus.
///
/// `recv` is polled while a transaction waits for its acknowledgement; an
/// implementation over an in-process link services the far end there. The
/// time source only needs to be monotonic.
pub trait RemoteTransport {
    /// Transmit one command frame. False if the link cannot accept it.
    fn send(&mut self, frame: &[u8]) -> bool;

    /// Fetch the next received frame into `buf`, if any.
    fn recv(&mut self, buf: &mut [u8]) -> Option<usize>;

    /// Monotonic time for timeout bookkeeping.
    fn now(&mut self) -> Time;
}

/// ConfigBus backend that forwards every operation to a remote host.
#[derive(Debug)]
pub struct Remote<T> {
    transport: T,
    timeout: Time,
    seq: u8,
}

impl<T: RemoteTransport> Remote<T> {
    pub fn new(transport: T) -> Self {
        Remote {
            transport,
            timeout: Time::from_millis(100),
            seq: 0,
        }
    }

    pub fn with_timeout(transport: T, timeout: Time) -> Self {
        Remote { transport, timeout, seq: 0 }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// One command/ack exchange. `wr` and `rd` are mutually exclusive.
    fn transaction(
        &mut self,
        opcode: u8,
        regaddr: u32,
        wr: &[u32],
        rd: &mut [u32],
    ) -> IoResult<()> {
        debug_assert!(wr.len() <= MAX_BULK_REGS && rd.len() <= MAX_BULK_REGS);
        let count = wr.len().max(rd.len()) as u16;
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;

        let mut frame = [0u8; FRAME_MAX];
        let len = {
            let mut cmd = ArrayWrite::new(&mut frame);
            cmd.write_u8(opcode);
            cmd.write_u8(seq);
            cmd.write_u32(regaddr);
            cmd.write_u16(count);
            for &val in wr {
                cmd.write_u32(val);
            }
            if !cmd.write_finalize() {
                return Err(IoStatus::CmdError);
            }
            cmd.written()
        };
        if !self.transport.send(&frame[..len]) {
            return Err(IoStatus::BusError);
        }

        let deadline = self.transport.now() + self.timeout;
        let mut ack = [0u8; FRAME_MAX];
        loop {
            while let Some(n) = self.transport.recv(&mut ack) {
                if let Some(result) = parse_ack(&ack[..n], opcode, seq, rd) {
                    return result;
                }
                // Stale or foreign frame; keep waiting.
            }
            if self.transport.now() >= deadline {
                log::warn!("ConfigBus remote timeout (op 0x{opcode:02X})");
                return Err(IoStatus::Timeout);
            }
        }
    }
}

fn parse_ack(frame: &[u8], opcode: u8, seq: u8, rd: &mut [u32]) -> Option<IoResult<()>> {
    let mut ack = ArrayRead::new(frame);
    if ack.read_u8()? != (opcode | OPCODE_ACK) || ack.read_u8()? != seq {
        return None;
    }
    let status = ack.read_u8()?;
    if status != u8::from(IoStatus::Ok) {
        let status = IoStatus::try_from(status).unwrap_or(IoStatus::BusError);
        return Some(Err(status));
    }
    for slot in rd.iter_mut() {
        match ack.read_u32() {
            Some(v) => *slot = v,
            None => return Some(Err(IoStatus::BusError)), // Truncated ack.
        }
    }
    Some(Ok(()))
}

impl<T: RemoteTransport> ConfigBus for Remote<T> {
    fn read(&mut self, regaddr: u32) -> IoResult<u32> {
        let mut out = [0u32; 1];
        self.transaction(OPCODE_READ, regaddr, &[], &mut out)?;
        Ok(out[0])
    }

    fn write(&mut self, regaddr: u32, val: u32) -> IoResult<()> {
        self.transaction(OPCODE_WRITE, regaddr, &[val], &mut [])
    }

    fn read_array(&mut self, regaddr: u32, out: &mut [u32]) -> IoResult<()> {
        let mut addr = regaddr;
        for chunk in out.chunks_mut(MAX_BULK_REGS) {
            self.transaction(OPCODE_READ, addr, &[], chunk)?;
            addr += chunk.len() as u32;
        }
        Ok(())
    }

    fn read_repeat(&mut self, regaddr: u32, out: &mut [u32]) -> IoResult<()> {
        for chunk in out.chunks_mut(MAX_BULK_REGS) {
            self.transaction(OPCODE_READ_RPT, regaddr, &[], chunk)?;
        }
        Ok(())
    }

    fn write_array(&mut self, regaddr: u32, data: &[u32]) -> IoResult<()> {
        let mut addr = regaddr;
        for chunk in data.chunks(MAX_BULK_REGS) {
            self.transaction(OPCODE_WRITE, addr, chunk, &mut [])?;
            addr += chunk.len() as u32;
        }
        Ok(())
    }

    fn write_repeat(&mut self, regaddr: u32, data: &[u32]) -> IoResult<()> {
        for chunk in data.chunks(MAX_BULK_REGS) {
            self.transaction(OPCODE_WRITE_RPT, regaddr, chunk, &mut [])?;
        }
        Ok(())
    }
}

/// Host-side command processor: applies received command frames to a local
/// bus and emits the acknowledgement.
#[derive(Debug, Default)]
pub struct RemoteServer {
    cmd_count: u32,
}

impl RemoteServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cmd_count(&self) -> u32 {
        self.cmd_count
    }

    /// Process one command frame; the acknowledgement is finalized onto
    /// `reply`. Returns false for frames too mangled to acknowledge.
    pub fn handle(
        &mut self,
        cmd: &[u8],
        bus: &mut dyn ConfigBus,
        reply: &mut dyn Writeable,
    ) -> bool {
        let mut rd = ArrayRead::new(cmd);
        let (Some(opcode), Some(seq), Some(addr), Some(count)) =
            (rd.read_u8(), rd.read_u8(), rd.read_u32(), rd.read_u16())
        else {
            return false;
        };
        self.cmd_count = self.cmd_count.wrapping_add(1);

        reply.write_u8(opcode | OPCODE_ACK);
        reply.write_u8(seq);

        if count as usize > MAX_BULK_REGS {
            reply.write_u8(IoStatus::CmdError.into());
            return reply.write_finalize();
        }

        let status = match opcode {
            OPCODE_READ | OPCODE_READ_RPT => {
                let mut vals = [0u32; MAX_BULK_REGS];
                let vals = &mut vals[..count as usize];
                let res = if opcode == OPCODE_READ {
                    bus.read_array(addr, vals)
                } else {
                    bus.read_repeat(addr, vals)
                };
                match res {
                    Ok(()) => {
                        reply.write_u8(IoStatus::Ok.into());
                        for &v in vals.iter() {
                            reply.write_u32(v);
                        }
                        return reply.write_finalize();
                    }
                    Err(e) => e,
                }
            }
            OPCODE_WRITE | OPCODE_WRITE_RPT => {
                let mut vals = [0u32; MAX_BULK_REGS];
                let vals = &mut vals[..count as usize];
                let mut ok = true;
                for slot in vals.iter_mut() {
                    match rd.read_u32() {
                        Some(v) => *slot = v,
                        None => {
                            ok = false;
                            break;
                        }
                    }
                }
                if !ok {
                    IoStatus::CmdError
                } else {
                    let res = if opcode == OPCODE_WRITE {
                        bus.write_array(addr, vals)
                    } else {
                        bus.write_repeat(addr, vals)
                    };
                    match res {
                        Ok(()) => IoStatus::Ok,
                        Err(e) => e,
                    }
                }
            }
            _ => IoStatus::CmdError,
        };
        reply.write_u8(status.into());
        reply.write_finalize()
    }
}
