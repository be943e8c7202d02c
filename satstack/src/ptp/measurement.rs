//! Timestamp bookkeeping for the delay-request exchange

use arrayvec::ArrayVec;

use super::messages::PortIdentity;
use crate::time::Time;

/// In-flight exchanges tracked at once.
pub const CACHE_WINDOW: usize = 8;

/// One completed Sync / Delay-Req exchange.
///
/// t1 = master's Sync transmit time, t2 = our Sync receive time,
/// t3 = our Delay-Req transmit time, t4 = master's Delay-Req receive
/// time. All four carry their correction-field adjustments already.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pub t1: Time,
    pub t2: Time,
    pub t3: Time,
    pub t4: Time,
    pub sequence_id: u16,
    pub peer: PortIdentity,
}

impl Measurement {
    /// Mean of the two path directions: ((t2-t1) + (t4-t3)) / 2.
    pub fn mean_path_delay(&self) -> Time {
        ((self.t2 - self.t1) + (self.t4 - self.t3)) / 2
    }

    /// Offset of our clock from the master: ((t2-t1) - (t4-t3)) / 2.
    pub fn offset_from_master(&self) -> Time {
        ((self.t2 - self.t1) - (self.t4 - self.t3)) / 2
    }

    /// The local event time this measurement is anchored to.
    pub fn event_time(&self) -> Time {
        self.t3
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Builder {
    pub seq: u16,
    pub t1: Option<Time>,
    pub t2: Option<Time>,
    pub t3: Option<Time>,
    pub t4: Option<Time>,
    pub peer: PortIdentity,
    age: u32,
}

impl Builder {
    fn complete(&self) -> Option<Measurement> {
        Some(Measurement {
            t1: self.t1?,
            t2: self.t2?,
            t3: self.t3?,
            t4: self.t4?,
            sequence_id: self.seq,
            peer: self.peer,
        })
    }
}

/// Bounded window of partially-filled exchanges, keyed by sequence id.
/// When the window is full the oldest entry is recycled; a straggler for
/// a recycled exchange is simply not found and the caller drops it.
#[derive(Debug, Default)]
pub struct MeasurementCache {
    slots: ArrayVec<Builder, CACHE_WINDOW>,
    tick: u32,
}

impl MeasurementCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn insert(&mut self, seq: u16, peer: PortIdentity) -> &mut Builder {
        self.tick += 1;
        let tick = self.tick;
        if let Some(i) = self.slots.iter().position(|b| b.seq == seq) {
            // Reuse of a live sequence id restarts that exchange.
            self.slots[i] = Builder {
                seq,
                t1: None,
                t2: None,
                t3: None,
                t4: None,
                peer,
                age: tick,
            };
            return &mut self.slots[i];
        }
        if self.slots.is_full() {
            let oldest = self
                .slots
                .iter()
                .enumerate()
                .min_by_key(|(_, b)| b.age)
                .map(|(i, _)| i)
                .unwrap();
            self.slots.remove(oldest);
        }
        self.slots.push(Builder {
            seq,
            t1: None,
            t2: None,
            t3: None,
            t4: None,
            peer,
            age: tick,
        });
        self.slots.last_mut().unwrap()
    }

    pub(crate) fn get_mut(&mut self, seq: u16) -> Option<&mut Builder> {
        self.slots.iter_mut().find(|b| b.seq == seq)
    }

    /// If the exchange is complete, remove and return it.
    pub(crate) fn take_complete(&mut self, seq: u16) -> Option<Measurement> {
        let i = self.slots.iter().position(|b| b.seq == seq)?;
        let m = self.slots[i].complete()?;
        self.slots.remove(i);
        Some(m)
    }

    /// Drop an exchange outright.
    pub(crate) fn discard(&mut self, seq: u16) {
        self.slots.retain(|b| b.seq != seq);
    }
}
