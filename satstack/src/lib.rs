//! Layered packet/stream networking core with IEEE 1588 timekeeping.
//!
//! This crate is the software heart of a mixed hardware/software platform
//! for small spacecraft and other embedded Ethernet systems. The same
//! code runs on bare-metal microcontrollers and in hosted simulation, so
//! everything is built on three portable contracts:
//!
//! - **Streams** ([io]): packetized [io::Readable] / [io::Writeable]
//!   byte streams with atomic finalize semantics, plus the buffers and
//!   framing codecs that move packets between them.
//! - **Polling** ([poll]): a single-threaded cooperative scheduler. All
//!   protocol work runs to completion on one logical context; interrupt
//!   handlers only raise atomic flags.
//! - **Registers** ([cfg]): the ConfigBus memory-mapped register
//!   interface, reachable directly or over the network, with a shared
//!   interrupt demultiplexer.
//!
//! On top of those sit the network dispatch tree ([net]: Ethernet, ARP,
//! IPv4 + ICMP, UDP, and a pre-wired [net::stack::Stack]), the PTP
//! subsystem ([ptp]: message codecs, the Sync/Delay exchange, and the
//! tracking-clock servo), and packet-capture file I/O ([pcap]).
//!
//! The crate is `no_std` (with `alloc` for once-at-setup buffer and
//! registry storage); the `std` feature adds error-trait impls. Nothing
//! here spawns threads or blocks: the embedding provides the event loop,
//! the transports, and the clocks.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod cfg;
pub mod io;
pub mod net;
pub mod pcap;
pub mod poll;
pub mod ptp;
pub mod time;
pub mod util;

pub use time::Time;
