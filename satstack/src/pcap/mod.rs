//! Packet-capture file formats (PCAP, PCAPNG)
//!
//! A [PcapReader] autodetects classic PCAP (either byte order, micro- or
//! nanosecond variant) and PCAPNG, presenting the stored frames through
//! the packetized [Readable] interface. A [PcapWriter] emits PCAPNG by
//! default (or classic v2.4), with timestamps drawn from a supplied
//! [WallClock]. Neither touches the filesystem: the byte stream on the
//! other side is any `Readable`/`Writeable`, so captures can come from
//! files, memory, or the network alike.

use alloc::boxed::Box;

use crate::io::{Readable, Writeable};
use crate::time::{Time, WallClock, NSEC_PER_SEC};

/// Selected LinkType codes from the registry.
pub const LINKTYPE_ETHERNET: u16 = 1;
pub const LINKTYPE_USER0: u16 = 147;
pub const LINKTYPE_AOS: u16 = 222;

/// User-defined LinkType #0-15, reserved for private use.
pub const fn linktype_user(x: u16) -> u16 {
    LINKTYPE_USER0 + x
}

/// Default bound on a captured frame.
pub const PCAP_BUFFSIZE: usize = 1600;

const MAGIC_USEC: u32 = 0xA1B2_C3D4;
const MAGIC_NSEC: u32 = 0xA1B2_3C4D;
const BYTE_ORDER_MAGIC: u32 = 0x1A2B_3C4D;
const BLOCK_SHB: u32 = 0x0A0D_0D0A;
const BLOCK_IDB: u32 = 0x0000_0001;
const BLOCK_SPB: u32 = 0x0000_0003;
const BLOCK_EPB: u32 = 0x0000_0006;

const fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

/// Reads a capture stream, one frame per packet.
///
/// The source must deliver the complete capture as a byte stream; a
/// record truncated by end-of-stream ends the capture.
pub struct PcapReader<R, const BUFSIZE: usize = PCAP_BUFFSIZE> {
    src: R,
    mode_be: bool,
    mode_ng: bool,
    /// Timestamp ticks per second (classic: 1e6 or 1e9; PCAPNG: from
    /// if_tsresol).
    ts_per_sec: u64,
    link_type: u16,
    buf: [u8; BUFSIZE],
    len: usize,
    pos: usize,
    time: Option<Time>,
    done: bool,
    drop_count: u32,
}

impl<R: Readable, const BUFSIZE: usize> PcapReader<R, BUFSIZE> {
    /// Open a capture and autodetect its format by magic number.
    pub fn new(src: R) -> Self {
        let mut rd = PcapReader {
            src,
            mode_be: false,
            mode_ng: false,
            ts_per_sec: 1_000_000,
            link_type: LINKTYPE_ETHERNET,
            buf: [0; BUFSIZE],
            len: 0,
            pos: 0,
            time: None,
            done: false,
            drop_count: 0,
        };
        rd.file_hdr();
        rd.advance();
        rd
    }

    /// Timestamp of the current frame.
    pub fn packet_time(&self) -> Option<Time> {
        self.time
    }

    pub fn link_type(&self) -> u16 {
        self.link_type
    }

    /// Frames skipped (oversized or truncated records).
    pub fn drop_count(&self) -> u32 {
        self.drop_count
    }

    fn rd16(&mut self) -> Option<u16> {
        if self.mode_be {
            self.src.read_u16()
        } else {
            self.src.read_u16l()
        }
    }

    fn rd32(&mut self) -> Option<u32> {
        if self.mode_be {
            self.src.read_u32()
        } else {
            self.src.read_u32l()
        }
    }

    fn file_hdr(&mut self) {
        let Some(magic) = self.src.read_u32() else {
            self.done = true;
            return;
        };
        match magic {
            BLOCK_SHB => {
                self.mode_ng = true;
                self.pcapng_shb();
            }
            MAGIC_USEC => self.classic_hdr(true, 1_000_000),
            MAGIC_NSEC => self.classic_hdr(true, NSEC_PER_SEC as u64),
            m if m.swap_bytes() == MAGIC_USEC => self.classic_hdr(false, 1_000_000),
            m if m.swap_bytes() == MAGIC_NSEC => self.classic_hdr(false, NSEC_PER_SEC as u64),
            other => {
                log::warn!("Unrecognized capture magic 0x{other:08X}");
                self.done = true;
            }
        }
    }

    fn classic_hdr(&mut self, big_endian: bool, ts_per_sec: u64) {
        self.mode_be = big_endian;
        self.ts_per_sec = ts_per_sec;
        // version, thiszone, sigfigs, snaplen, network
        let ver_major = self.rd16();
        let _ver_minor = self.rd16();
        let _thiszone = self.rd32();
        let _sigfigs = self.rd32();
        let _snaplen = self.rd32();
        let network = self.rd32();
        if ver_major != Some(2) || network.is_none() {
            self.done = true;
            return;
        }
        self.link_type = network.unwrap() as u16;
    }

    /// Section header: establishes byte order for the section.
    fn pcapng_shb(&mut self) {
        // total_length (endianness unknown yet), then the byte-order magic.
        let Some(raw_len) = self.src.read_u32() else {
            self.done = true;
            return;
        };
        let Some(bom) = self.src.read_u32() else {
            self.done = true;
            return;
        };
        self.mode_be = bom == BYTE_ORDER_MAGIC;
        if !self.mode_be && bom.swap_bytes() != BYTE_ORDER_MAGIC {
            log::warn!("Bad PCAPNG byte-order magic");
            self.done = true;
            return;
        }
        let total = if self.mode_be { raw_len } else { raw_len.swap_bytes() } as usize;
        // Consumed so far: type + length + BOM.
        self.skip_block_tail(total, 12);
    }

    fn skip_block_tail(&mut self, total: usize, consumed: usize) {
        if total < consumed + 4 || !self.src.read_consume(total - consumed) {
            self.done = true;
        }
    }

    /// Load the next frame into the working buffer.
    fn advance(&mut self) {
        self.len = 0;
        self.pos = 0;
        self.time = None;
        if self.done {
            return;
        }
        if self.mode_ng {
            self.pcapng_next();
        } else {
            self.classic_next();
        }
    }

    fn classic_next(&mut self) {
        let (Some(ts_sec), Some(ts_frac), Some(incl), Some(_orig)) =
            (self.rd32(), self.rd32(), self.rd32(), self.rd32())
        else {
            self.done = true;
            return;
        };
        let incl = incl as usize;
        if incl > BUFSIZE {
            self.drop_count = self.drop_count.wrapping_add(1);
            if !self.src.read_consume(incl) {
                self.done = true;
                return;
            }
            return self.classic_next();
        }
        if !self.src.read_bytes(&mut self.buf[..incl]) {
            self.done = true;
            return;
        }
        self.len = incl;
        self.time = Some(self.make_time(ts_sec as u64, ts_frac as u64));
    }

    fn make_time(&self, secs: u64, frac_ticks: u64) -> Time {
        let subns =
            frac_ticks as i128 * crate::time::SUBNS_PER_SEC as i128 / self.ts_per_sec as i128;
        Time::from_secs(secs as i64) + Time::from_subns(subns as i64)
    }

    fn pcapng_next(&mut self) {
        loop {
            let (Some(btype), Some(total)) = (self.rd32(), self.rd32()) else {
                self.done = true;
                return;
            };
            let total = total as usize;
            if total < 12 || total % 4 != 0 {
                self.done = true;
                return;
            }
            match btype {
                BLOCK_SHB => {
                    // A new section: re-read its byte order.
                    // Already consumed type and length; BOM is next.
                    let Some(bom) = self.src.read_u32() else {
                        self.done = true;
                        return;
                    };
                    self.mode_be = bom == BYTE_ORDER_MAGIC;
                    self.skip_block_tail(total, 12);
                }
                BLOCK_IDB => {
                    if !self.pcapng_idb(total) {
                        return;
                    }
                }
                BLOCK_EPB => {
                    if self.pcapng_epb(total) {
                        return;
                    }
                }
                BLOCK_SPB => {
                    if self.pcapng_spb(total) {
                        return;
                    }
                }
                other => {
                    log::debug!("Skipping PCAPNG block type 0x{other:08X}");
                    self.skip_block_tail(total, 8);
                }
            }
            if self.done {
                return;
            }
        }
    }

    fn pcapng_idb(&mut self, total: usize) -> bool {
        if total < 20 {
            self.done = true;
            return false;
        }
        let (Some(link), Some(_reserved), Some(_snaplen)) =
            (self.rd16(), self.rd16(), self.rd32())
        else {
            self.done = true;
            return false;
        };
        self.link_type = link;
        // Scan options for if_tsresol; default is microseconds.
        self.ts_per_sec = 1_000_000;
        let mut remaining = total - 16 - 4; // header+body consumed, trailer pending
        while remaining >= 4 {
            let (Some(code), Some(olen)) = (self.rd16(), self.rd16()) else {
                self.done = true;
                return false;
            };
            let olen = olen as usize;
            remaining -= 4;
            if code == 0 {
                break;
            }
            let padded = pad4(olen);
            if padded > remaining {
                self.done = true;
                return false;
            }
            if code == 9 && olen >= 1 {
                let mut val = [0u8; 1];
                if !self.src.read_bytes(&mut val) || !self.src.read_consume(padded - 1) {
                    self.done = true;
                    return false;
                }
                if val[0] & 0x80 == 0 && val[0] <= 9 {
                    self.ts_per_sec = 10u64.pow(val[0] as u32);
                }
            } else if !self.src.read_consume(padded) {
                self.done = true;
                return false;
            }
            remaining -= padded;
        }
        // Trailer and any unread option bytes.
        if !self.src.read_consume(remaining + 4) {
            self.done = true;
            return false;
        }
        true
    }

    fn pcapng_epb(&mut self, total: usize) -> bool {
        if total < 32 {
            self.done = true;
            return false;
        }
        let (Some(_iface), Some(ts_hi), Some(ts_lo), Some(cap), Some(_orig)) =
            (self.rd32(), self.rd32(), self.rd32(), self.rd32(), self.rd32())
        else {
            self.done = true;
            return false;
        };
        let cap = cap as usize;
        let body_used = 28; // type, length, iface, ts*2, cap, orig
        let tail = total - body_used;
        if cap > BUFSIZE || pad4(cap) + 4 > tail {
            self.drop_count = self.drop_count.wrapping_add(1);
            self.skip_block_tail(total, body_used);
            return false; // Caller loops to the next block.
        }
        if !self.src.read_bytes(&mut self.buf[..cap]) {
            self.done = true;
            return false;
        }
        if !self.src.read_consume(tail - cap) {
            self.done = true;
            return false;
        }
        self.len = cap;
        let ticks = ((ts_hi as u64) << 32) | ts_lo as u64;
        let secs = ticks / self.ts_per_sec;
        let frac = ticks % self.ts_per_sec;
        self.time = Some(self.make_time(secs, frac));
        true
    }

    fn pcapng_spb(&mut self, total: usize) -> bool {
        if total < 16 {
            self.done = true;
            return false;
        }
        let Some(orig) = self.rd32() else {
            self.done = true;
            return false;
        };
        let body = total - 12 - 4; // minus headers/trailer
        let cap = (orig as usize).min(body);
        if cap > BUFSIZE {
            self.drop_count = self.drop_count.wrapping_add(1);
            self.skip_block_tail(total, 12);
            return false;
        }
        if !self.src.read_bytes(&mut self.buf[..cap]) {
            self.done = true;
            return false;
        }
        if !self.src.read_consume(body - cap + 4) {
            self.done = true;
            return false;
        }
        self.len = cap;
        self.time = None; // Simple packets carry no timestamp.
        true
    }
}

impl<R: Readable, const BUFSIZE: usize> Readable for PcapReader<R, BUFSIZE> {
    fn get_read_ready(&self) -> usize {
        self.len - self.pos
    }

    fn read_next(&mut self) -> u8 {
        let b = self.buf[self.pos];
        self.pos += 1;
        b
    }

    fn read_finalize(&mut self) {
        self.advance();
    }
}

/// Writes a capture stream: PCAPNG by default, classic v2.4 on request.
/// Each packet written and finalized becomes one capture record, stamped
/// from the supplied clock.
pub struct PcapWriter<W, C, const BUFSIZE: usize = PCAP_BUFFSIZE> {
    dst: W,
    clock: C,
    mode_ng: bool,
    link_type: u16,
    buf: [u8; BUFSIZE],
    len: usize,
    ovr: bool,
    started: bool,
    pass: Option<Box<dyn Writeable>>,
    packet_count: u32,
}

impl<W: Writeable, C: WallClock, const BUFSIZE: usize> PcapWriter<W, C, BUFSIZE> {
    /// PCAPNG capture with the default Ethernet link type.
    pub fn new(dst: W, clock: C) -> Self {
        Self::with_mode(dst, clock, true, LINKTYPE_ETHERNET)
    }

    /// Classic PCAP v2.4 (nanosecond magic).
    pub fn new_classic(dst: W, clock: C) -> Self {
        Self::with_mode(dst, clock, false, LINKTYPE_ETHERNET)
    }

    pub fn with_mode(dst: W, clock: C, pcapng: bool, link_type: u16) -> Self {
        PcapWriter {
            dst,
            clock,
            mode_ng: pcapng,
            link_type,
            buf: [0; BUFSIZE],
            len: 0,
            ovr: false,
            started: false,
            pass: None,
            packet_count: 0,
        }
    }

    /// Carbon-copy every finalized packet to another sink, reusing the
    /// internal working buffer (no second copy of the payload is made).
    pub fn set_passthrough(&mut self, pass: Option<Box<dyn Writeable>>) {
        self.pass = pass;
    }

    pub fn packet_count(&self) -> u32 {
        self.packet_count
    }

    pub fn dst_mut(&mut self) -> &mut W {
        &mut self.dst
    }

    fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        if self.mode_ng {
            // Section Header Block.
            self.dst.write_u32l(BLOCK_SHB);
            self.dst.write_u32l(28);
            self.dst.write_u32l(BYTE_ORDER_MAGIC);
            self.dst.write_u16l(1); // major
            self.dst.write_u16l(0); // minor
            self.dst.write_u64l(u64::MAX); // section length unknown
            self.dst.write_u32l(28);
            // Interface Description Block with nanosecond timestamps.
            self.dst.write_u32l(BLOCK_IDB);
            self.dst.write_u32l(28);
            self.dst.write_u16l(self.link_type);
            self.dst.write_u16l(0);
            self.dst.write_u32l(BUFSIZE as u32); // snaplen
            self.dst.write_u16l(9); // if_tsresol
            self.dst.write_u16l(1);
            self.dst.write_bytes(&[9, 0, 0, 0]); // 10^-9, padded
            self.dst.write_u32l(28);
        } else {
            self.dst.write_u32l(MAGIC_NSEC);
            self.dst.write_u16l(2); // version 2.4
            self.dst.write_u16l(4);
            self.dst.write_u32l(0); // thiszone
            self.dst.write_u32l(0); // sigfigs
            self.dst.write_u32l(BUFSIZE as u32);
            self.dst.write_u32l(self.link_type as u32);
        }
    }

    fn emit(&mut self) -> bool {
        self.start();
        let now = self.clock.wall_now();
        let len = self.len;
        if self.mode_ng {
            let ticks = now.field_secs() as u64 * NSEC_PER_SEC as u64 + now.field_nsec() as u64;
            let total = 32 + pad4(len);
            self.dst.write_u32l(BLOCK_EPB);
            self.dst.write_u32l(total as u32);
            self.dst.write_u32l(0); // interface id
            self.dst.write_u32l((ticks >> 32) as u32);
            self.dst.write_u32l(ticks as u32);
            self.dst.write_u32l(len as u32);
            self.dst.write_u32l(len as u32);
            self.dst.write_bytes(&self.buf[..len]);
            for _ in len..pad4(len) {
                self.dst.write_u8(0);
            }
            self.dst.write_u32l(total as u32);
        } else {
            self.dst.write_u32l(now.field_secs() as u32);
            self.dst.write_u32l(now.field_nsec());
            self.dst.write_u32l(len as u32);
            self.dst.write_u32l(len as u32);
            self.dst.write_bytes(&self.buf[..len]);
        }
        let ok = self.dst.write_finalize();
        if let Some(pass) = &mut self.pass {
            pass.write_bytes(&self.buf[..len]);
            pass.write_finalize();
        }
        ok
    }
}

impl<W: Writeable, C: WallClock, const BUFSIZE: usize> Writeable for PcapWriter<W, C, BUFSIZE> {
    fn get_write_space(&self) -> usize {
        BUFSIZE - self.len
    }

    fn write_next(&mut self, byte: u8) {
        if self.len < BUFSIZE {
            self.buf[self.len] = byte;
            self.len += 1;
        } else {
            self.ovr = true;
        }
    }

    fn write_overflow(&mut self) {
        self.ovr = true;
    }

    fn write_finalize(&mut self) -> bool {
        let ok = if self.ovr {
            false
        } else if self.len == 0 {
            true
        } else {
            let ok = self.emit();
            if ok {
                self.packet_count = self.packet_count.wrapping_add(1);
            }
            ok
        };
        self.len = 0;
        self.ovr = false;
        ok
    }

    fn write_abort(&mut self) {
        self.len = 0;
        self.ovr = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::PacketBuffer;
    use crate::ptp::SimulatedClock;
    use crate::time::{ONE_MILLISECOND, ONE_SECOND};
    use alloc::vec::Vec;

    fn frame(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    /// Scenario: three Ethernet frames at T, T+1ms, T+2ms survive a
    /// PCAPNG round trip byte-for-byte with their timestamps.
    #[test]
    fn pcapng_roundtrip() {
        let mut clock = SimulatedClock::new(1e8, 1e8);
        clock.run(ONE_SECOND * 1000);
        let t0 = {
            let mut c = clock.clone();
            crate::time::WallClock::wall_now(&mut c)
        };

        let file = PacketBuffer::new_stream(8192);
        let mut writer: PcapWriter<_, _> = PcapWriter::new(file, clock);
        let frames = [frame(1, 64), frame(2, 128), frame(3, 256)];
        for (i, f) in frames.iter().enumerate() {
            writer.write_bytes(f);
            assert!(writer.write_finalize(), "frame {i}");
            writer.clock.run(ONE_MILLISECOND);
        }
        assert_eq!(writer.packet_count(), 3);

        let mut reader: PcapReader<_> = PcapReader::new(writer.dst);
        assert_eq!(reader.link_type(), LINKTYPE_ETHERNET);
        for (i, f) in frames.iter().enumerate() {
            assert_eq!(reader.get_read_ready(), f.len(), "frame {i}");
            let want_time = t0 + ONE_MILLISECOND * i as u32;
            let got = reader.packet_time().unwrap();
            // Nanosecond resolution: sub-ns residue may be lost.
            assert!((got - want_time).abs() < Time::from_nanos(2), "frame {i}");
            let mut data = alloc::vec![0u8; f.len()];
            assert!(reader.read_bytes(&mut data));
            assert_eq!(&data, f, "frame {i}");
            reader.read_finalize();
        }
        assert_eq!(reader.get_read_ready(), 0);
    }

    #[test]
    fn classic_roundtrip() {
        let mut clock = SimulatedClock::new(1e8, 1e8);
        clock.run(ONE_SECOND * 5);
        let file = PacketBuffer::new_stream(4096);
        let mut writer: PcapWriter<_, _> = PcapWriter::new_classic(file, clock);
        writer.write_bytes(b"classic-frame");
        assert!(writer.write_finalize());

        let mut reader: PcapReader<_> = PcapReader::new(writer.dst);
        assert_eq!(reader.get_read_ready(), 13);
        assert_eq!(reader.packet_time(), Some(Time::from_secs(5)));
        let mut data = [0u8; 13];
        assert!(reader.read_bytes(&mut data));
        assert_eq!(&data, b"classic-frame");
        reader.read_finalize();
        assert_eq!(reader.get_read_ready(), 0);
    }

    #[test]
    fn classic_big_endian_microseconds() {
        // Hand-built big-endian classic file with one 4-byte packet.
        let mut file = PacketBuffer::new_stream(256);
        file.write_u32(MAGIC_USEC);
        file.write_u16(2);
        file.write_u16(4);
        file.write_u32(0);
        file.write_u32(0);
        file.write_u32(65535);
        file.write_u32(LINKTYPE_AOS as u32);
        // Record at 3.5 s.
        file.write_u32(3);
        file.write_u32(500_000);
        file.write_u32(4);
        file.write_u32(4);
        file.write_bytes(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(file.write_finalize());

        let mut reader: PcapReader<_> = PcapReader::new(file);
        assert_eq!(reader.link_type(), LINKTYPE_AOS);
        assert_eq!(reader.packet_time(), Some(Time::from_millis(3500)));
        assert_eq!(reader.read_u32(), Some(0xDEAD_BEEF));
    }

    #[test]
    fn unknown_blocks_skipped() {
        // Writer output with an alien block spliced between packets.
        let clock = SimulatedClock::new(1e8, 1e8);
        let file = PacketBuffer::new_stream(4096);
        let mut writer: PcapWriter<_, _> = PcapWriter::new(file, clock);
        writer.write_bytes(b"one");
        assert!(writer.write_finalize());

        // Custom block: type, len 16, 4 bytes payload, trailer.
        let dst = writer.dst_mut();
        dst.write_u32l(0x0BAD_F00D);
        dst.write_u32l(16);
        dst.write_u32l(0x1234_5678);
        dst.write_u32l(16);
        assert!(dst.write_finalize());

        writer.write_bytes(b"two");
        assert!(writer.write_finalize());

        let mut reader: PcapReader<_> = PcapReader::new(writer.dst);
        assert_eq!(reader.read_array::<3>(), Some(*b"one"));
        reader.read_finalize();
        assert_eq!(reader.read_array::<3>(), Some(*b"two"));
        reader.read_finalize();
        assert_eq!(reader.get_read_ready(), 0);
    }

    #[test]
    fn passthrough_carbon_copies() {
        let clock = SimulatedClock::new(1e8, 1e8);
        let file = PacketBuffer::new_stream(4096);
        let tap = crate::io::SharedBuffer::new(256);
        let mut writer: PcapWriter<_, _> = PcapWriter::new(file, clock);
        writer.set_passthrough(Some(Box::new(tap.clone())));
        for _ in 0..3 {
            writer.write_bytes(b"data");
            assert!(writer.write_finalize());
        }
        assert_eq!(writer.packet_count(), 3);
        // The passthrough sink saw every packet once, payload only.
        assert_eq!(tap.stored_packets(), 3);
        tap.with(|pb| {
            assert_eq!(pb.read_array::<4>(), Some(*b"data"));
            pb.read_finalize();
        });
    }

    #[test]
    fn oversized_write_rejected() {
        let clock = SimulatedClock::new(1e8, 1e8);
        let file = PacketBuffer::new_stream(8192);
        let mut writer: PcapWriter<_, _, 64> = PcapWriter::with_mode(file, clock, true, LINKTYPE_ETHERNET);
        writer.write_bytes(&[0u8; 100]);
        assert!(!writer.write_finalize());
        assert_eq!(writer.packet_count(), 0);
        // The writer recovers for the next packet.
        writer.write_bytes(&[1u8; 32]);
        assert!(writer.write_finalize());
    }

    #[test]
    fn empty_stream_is_empty() {
        let file = PacketBuffer::new_stream(64);
        let reader: PcapReader<_> = PcapReader::new(file);
        assert_eq!(reader.get_read_ready(), 0);
        assert_eq!(reader.packet_time(), None);
    }
}
