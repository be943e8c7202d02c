//! Precision Time Protocol (IEEE 1588)
//!
//! Message codecs, the two-step Sync / Delay-Req exchange, and the servo
//! loop that steers a [TrackingClock] from the resulting measurements.
//! The client is sans-io: received frames and transmit timestamps are
//! pushed in, frames to send come back as actions, and the caller owns
//! the transport (raw Ethernet 0x88F7 or UDP 319/320 -- the exchange is
//! identical).

pub mod client;
pub mod clock;
pub mod filters;
pub mod measurement;
pub mod messages;
pub mod simclock;

pub use client::{Client, ClientAction, ClientConfig, Role, TimestampContext};
pub use clock::{TrackingClock, TrackingController, RATE_ONE_PPB, RATE_ONE_PPM, RATE_UNITY};
pub use filters::{CoeffLR, CoeffPI, CoeffPII, ControlOutput, Controller, ControllerLR, ControllerPI, ControllerPII};
pub use measurement::{Measurement, MeasurementCache};
pub use messages::{ClockIdentity, Header, Message, MessageBody, MessageType, PortIdentity, WireError};
pub use simclock::SimulatedClock;
