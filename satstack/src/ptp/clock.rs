//! Tracked clock interface and the servo that steers it

use super::filters::Controller;
use super::measurement::Measurement;
use crate::time::{Time, ONE_MILLISECOND, ONE_SECOND};

/// Scale of the [TrackingClock::clock_rate] argument: one unit is 2^-40
/// of the nominal frequency. `clock_rate(RATE_ONE_PPM)` speeds the clock
/// up by one part per million.
pub const RATE_UNITY: i64 = 1 << 40;
pub const RATE_ONE_PPM: i64 = RATE_UNITY / 1_000_000;
pub const RATE_ONE_PPB: i64 = RATE_UNITY / 1_000_000_000;

/// A clock the servo can observe and steer: a hardware counter, the
/// system clock, or a simulation.
pub trait TrackingClock {
    /// Current time of the tracked clock.
    fn clock_now(&self) -> Time;

    /// Apply a coarse step of the given amount.
    fn clock_adjust(&mut self, amount: Time);

    /// Trim the frequency by `offset`, in units of 2^-40 of nominal
    /// (see [RATE_UNITY]). Replaces, not accumulates, the previous trim.
    fn clock_rate(&mut self, offset: i64);
}

/// Default coarse-step threshold: inside this band the servo slews only.
pub const STEP_THRESHOLD_DEFAULT: Time = ONE_MILLISECOND;

/// Feeds measurements to a control filter and applies its output to the
/// clock.
///
/// Offsets beyond the step threshold bypass the filter: the clock is
/// stepped at once and the filter state is reset, so the loop never
/// integrates across a discontinuity.
#[derive(Debug)]
pub struct TrackingController<C, F> {
    clock: C,
    ctrl: F,
    step_threshold: Time,
    last_event: Option<Time>,
    step_count: u32,
    slew_count: u32,
}

impl<C: TrackingClock, F: Controller> TrackingController<C, F> {
    pub fn new(clock: C, ctrl: F) -> Self {
        TrackingController {
            clock,
            ctrl,
            step_threshold: STEP_THRESHOLD_DEFAULT,
            last_event: None,
            step_count: 0,
            slew_count: 0,
        }
    }

    pub fn set_step_threshold(&mut self, threshold: Time) {
        self.step_threshold = threshold;
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    pub fn slew_count(&self) -> u32 {
        self.slew_count
    }

    /// Consume one measurement and update the clock.
    pub fn update(&mut self, m: &Measurement) {
        let offset = m.offset_from_master();
        let event = m.event_time();

        if offset.abs() > self.step_threshold {
            log::info!("Clock step: offset {offset}");
            self.clock.clock_adjust(-offset);
            self.ctrl.reset();
            self.last_event = Some(event - offset);
            self.step_count = self.step_count.wrapping_add(1);
            return;
        }

        let elapsed = match self.last_event {
            Some(prev) if event > prev => event - prev,
            _ => ONE_SECOND,
        };
        self.last_event = Some(event);

        let out = self.ctrl.update(elapsed, offset);
        if let Some(step) = out.step {
            self.clock.clock_adjust(-step);
        }
        self.clock.clock_rate(out.rate);
        self.slew_count = self.slew_count.wrapping_add(1);
        log::debug!("Servo: offset {offset}, rate {}", out.rate);
    }
}
