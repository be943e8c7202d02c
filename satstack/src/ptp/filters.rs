//! Rate-control filters for the tracking servo
//!
//! Each controller consumes the measured offset-from-master and produces
//! the next frequency-trim command in [RATE_UNITY](super::RATE_UNITY)
//! units. Float math goes through `libm` so the servo runs without the
//! standard library.

use arrayvec::ArrayVec;

use super::clock::RATE_UNITY;
use crate::time::Time;

/// Output of one controller update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlOutput {
    /// Frequency-trim command for [super::TrackingClock::clock_rate].
    pub rate: i64,
    /// Optional residual phase step (regression intercept).
    pub step: Option<Time>,
}

/// A rate-control law.
pub trait Controller {
    /// Forget all accumulated state (after a coarse step).
    fn reset(&mut self);

    /// One update: `elapsed` since the previous update, `offset` the
    /// measured offset-from-master.
    fn update(&mut self, elapsed: Time, offset: Time) -> ControlOutput;
}

fn clamp_rate(rate_f: f64, max_ppm: f64) -> i64 {
    let limit = max_ppm * 1e-6;
    let clamped = rate_f.clamp(-limit, limit);
    (clamped * RATE_UNITY as f64) as i64
}

/// Proportional-integral gains. `kp` is per second, `ki` per second
/// squared; `rate_max_ppm` saturates the output.
#[derive(Debug, Clone, Copy)]
pub struct CoeffPI {
    pub kp: f64,
    pub ki: f64,
    pub rate_max_ppm: f64,
}

impl Default for CoeffPI {
    /// Loop bandwidth around 0.1 Hz at a one-second update rate.
    fn default() -> Self {
        CoeffPI { kp: 0.1, ki: 0.01, rate_max_ppm: 500.0 }
    }
}

/// Classic PI servo: rate = -(Kp e + Ki integral(e)).
#[derive(Debug)]
pub struct ControllerPI {
    coeff: CoeffPI,
    acc: f64,
}

impl ControllerPI {
    pub fn new(coeff: CoeffPI) -> Self {
        ControllerPI { coeff, acc: 0.0 }
    }
}

impl Controller for ControllerPI {
    fn reset(&mut self) {
        self.acc = 0.0;
    }

    fn update(&mut self, elapsed: Time, offset: Time) -> ControlOutput {
        let dt = elapsed.secs_lossy();
        let e = offset.secs_lossy();
        self.acc += e * dt;
        // The integrator saturates with the output.
        let max_acc = self.coeff.rate_max_ppm * 1e-6 / self.coeff.ki;
        self.acc = self.acc.clamp(-max_acc, max_acc);
        let rate = -(self.coeff.kp * e + self.coeff.ki * self.acc);
        ControlOutput {
            rate: clamp_rate(rate, self.coeff.rate_max_ppm),
            step: None,
        }
    }
}

/// PI plus a second integrator, tracking frequency drift (e.g. the
/// Doppler ramp of a pass over a moving platform).
#[derive(Debug, Clone, Copy)]
pub struct CoeffPII {
    pub kp: f64,
    pub ki: f64,
    pub kii: f64,
    pub rate_max_ppm: f64,
}

impl Default for CoeffPII {
    fn default() -> Self {
        CoeffPII { kp: 0.1, ki: 0.01, kii: 0.0005, rate_max_ppm: 500.0 }
    }
}

#[derive(Debug)]
pub struct ControllerPII {
    coeff: CoeffPII,
    acc1: f64,
    acc2: f64,
}

impl ControllerPII {
    pub fn new(coeff: CoeffPII) -> Self {
        ControllerPII { coeff, acc1: 0.0, acc2: 0.0 }
    }
}

impl Controller for ControllerPII {
    fn reset(&mut self) {
        self.acc1 = 0.0;
        self.acc2 = 0.0;
    }

    fn update(&mut self, elapsed: Time, offset: Time) -> ControlOutput {
        let dt = elapsed.secs_lossy();
        let e = offset.secs_lossy();
        self.acc1 += e * dt;
        self.acc2 += self.acc1 * dt;
        let max1 = self.coeff.rate_max_ppm * 1e-6 / self.coeff.ki;
        self.acc1 = self.acc1.clamp(-max1, max1);
        let max2 = self.coeff.rate_max_ppm * 1e-6 / self.coeff.kii;
        self.acc2 = self.acc2.clamp(-max2, max2);
        let rate = -(self.coeff.kp * e + self.coeff.ki * self.acc1 + self.coeff.kii * self.acc2);
        ControlOutput {
            rate: clamp_rate(rate, self.coeff.rate_max_ppm),
            step: None,
        }
    }
}

/// Window size bound for the regression controller.
pub const LR_WINDOW_MAX: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct CoeffLR {
    /// Samples per fit; at least 2, at most [LR_WINDOW_MAX].
    pub window: usize,
    pub rate_max_ppm: f64,
}

impl Default for CoeffLR {
    fn default() -> Self {
        CoeffLR { window: 8, rate_max_ppm: 500.0 }
    }
}

/// Linear-regression controller: fits offset-vs-time over the last N
/// samples; the slope trims the rate, the intercept at the newest sample
/// is emitted as a residual step.
#[derive(Debug)]
pub struct ControllerLR {
    coeff: CoeffLR,
    samples: ArrayVec<(f64, f64), LR_WINDOW_MAX>,
    t_origin: Option<Time>,
    elapsed: f64,
    rate_accum: f64,
}

impl ControllerLR {
    pub fn new(coeff: CoeffLR) -> Self {
        let window = coeff.window.clamp(2, LR_WINDOW_MAX);
        ControllerLR {
            coeff: CoeffLR { window, ..coeff },
            samples: ArrayVec::new(),
            t_origin: None,
            elapsed: 0.0,
            rate_accum: 0.0,
        }
    }

    fn fit(&self) -> (f64, f64) {
        // Least-squares slope and intercept over (t, offset).
        let n = self.samples.len() as f64;
        let (mut st, mut so, mut stt, mut sto) = (0.0, 0.0, 0.0, 0.0);
        for &(t, o) in &self.samples {
            st += t;
            so += o;
            stt += t * t;
            sto += t * o;
        }
        let denom = n * stt - st * st;
        if libm::fabs(denom) < 1e-30 {
            return (0.0, so / n);
        }
        let slope = (n * sto - st * so) / denom;
        let intercept = (so - slope * st) / n;
        (slope, intercept)
    }
}

impl Controller for ControllerLR {
    fn reset(&mut self) {
        self.samples.clear();
        self.t_origin = None;
        self.elapsed = 0.0;
        self.rate_accum = 0.0;
    }

    fn update(&mut self, elapsed: Time, offset: Time) -> ControlOutput {
        if self.t_origin.is_none() {
            self.t_origin = Some(Time::ZERO);
            self.elapsed = 0.0;
        } else {
            self.elapsed += elapsed.secs_lossy();
        }
        self.samples.push((self.elapsed, offset.secs_lossy()));

        if self.samples.len() < self.coeff.window {
            return ControlOutput {
                rate: clamp_rate(self.rate_accum, self.coeff.rate_max_ppm),
                step: None,
            };
        }

        let (slope, intercept) = self.fit();
        // The slope is the residual frequency error under the current
        // trim; fold it into the accumulated command.
        self.rate_accum -= slope;
        let limit = self.coeff.rate_max_ppm * 1e-6;
        self.rate_accum = self.rate_accum.clamp(-limit, limit);
        // Offset estimate at the newest sample: the residual phase step.
        let residual = intercept + slope * self.elapsed;
        self.samples.clear();
        self.t_origin = None;

        ControlOutput {
            rate: clamp_rate(self.rate_accum, self.coeff.rate_max_ppm),
            step: Some(Time::from_subns(
                (residual * crate::time::SUBNS_PER_SEC as f64) as i64,
            )),
        }
    }
}
