//! Hosted (POSIX-ish) adapters for the satstack core
//!
//! Bridges `std::fs` files into the core's [Readable]/[Writeable] stream
//! traits, adds open-by-path packet-capture helpers, and provides clock
//! sources backed by the operating system.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use satstack::io::{Readable, Writeable};
use satstack::pcap::{PcapReader, PcapWriter, LINKTYPE_ETHERNET};
use satstack::poll::TimeRef;
use satstack::time::{Time, WallClock};

/// Byte-stream view of a file. `get_read_ready` reports the bytes left
/// to the end of the file; `read_finalize` is a no-op (files carry no
/// packet boundaries).
pub struct FileReader {
    inner: BufReader<File>,
    remaining: usize,
}

impl FileReader {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let remaining = file.metadata()?.len() as usize;
        Ok(FileReader {
            inner: BufReader::new(file),
            remaining,
        })
    }
}

impl Readable for FileReader {
    fn get_read_ready(&self) -> usize {
        self.remaining
    }

    fn read_next(&mut self) -> u8 {
        let mut byte = [0u8; 1];
        match self.inner.read_exact(&mut byte) {
            Ok(()) => {
                self.remaining -= 1;
                byte[0]
            }
            Err(e) => {
                log::error!("File read failed: {e}");
                self.remaining = 0;
                0
            }
        }
    }

    fn read_finalize(&mut self) {}
}

/// Byte-stream sink onto a file. Each finalize flushes, so a capture is
/// intact on disk after every packet.
pub struct FileWriter {
    inner: BufWriter<File>,
    ok: bool,
}

impl FileWriter {
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(FileWriter {
            inner: BufWriter::new(File::create(path)?),
            ok: true,
        })
    }
}

impl Writeable for FileWriter {
    fn get_write_space(&self) -> usize {
        usize::MAX
    }

    fn write_next(&mut self, byte: u8) {
        if self.inner.write_all(&[byte]).is_err() {
            self.ok = false;
        }
    }

    fn write_overflow(&mut self) {
        self.ok = false;
    }

    fn write_finalize(&mut self) -> bool {
        if self.inner.flush().is_err() {
            self.ok = false;
        }
        core::mem::replace(&mut self.ok, true)
    }

    fn write_abort(&mut self) {
        // Bytes already written to the OS cannot be recalled; the caller
        // sees the failure through the next finalize.
        self.ok = false;
    }
}

/// Open a capture file for reading, autodetecting its format.
pub fn open_pcap_reader(path: impl AsRef<Path>) -> std::io::Result<PcapReader<FileReader>> {
    Ok(PcapReader::new(FileReader::open(path)?))
}

/// Create a PCAPNG capture file with the given clock and link type.
pub fn open_pcap_writer<C: WallClock>(
    path: impl AsRef<Path>,
    clock: C,
    link_type: u16,
) -> std::io::Result<PcapWriter<FileWriter, C>> {
    Ok(PcapWriter::with_mode(
        FileWriter::create(path)?,
        clock,
        true,
        link_type,
    ))
}

/// Create a PCAPNG capture of Ethernet frames stamped with system time.
pub fn open_pcap_writer_default(
    path: impl AsRef<Path>,
) -> std::io::Result<PcapWriter<FileWriter, SystemClock>> {
    open_pcap_writer(path, SystemClock, LINKTYPE_ETHERNET)
}

/// Monotonic time source for the poll scheduler.
pub struct InstantRef {
    start: Instant,
}

impl Default for InstantRef {
    fn default() -> Self {
        InstantRef { start: Instant::now() }
    }
}

impl InstantRef {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeRef for InstantRef {
    fn now(&mut self) -> Time {
        let d = self.start.elapsed();
        Time::from_nanos(d.as_nanos() as i64)
    }
}

/// Wall-clock timestamps from the operating system.
///
/// Reports seconds since the Unix epoch; no UTC-to-TAI correction is
/// applied, matching the convention of packet-capture tooling.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn wall_now(&mut self) -> Time {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Time::from_fields(d.as_secs(), d.subsec_nanos(), 0),
            Err(_) => Time::ZERO,
        }
    }
}
