//! Cooperative polling scheduler
//!
//! Everything in the core runs on one logical context: a poll loop calls
//! [Scheduler::service] with the current time, gets back the list of due
//! tasks, and services each one to completion. Tasks are registered as
//! `Always` (every cycle), `OnDemand` (when their [Notify] flag is raised,
//! which is safe from an ISR), or `Timer` (periodic deadline).
//!
//! One service cycle yields: requested OnDemand tasks in request order,
//! then Always tasks in registration order, then Timer tasks in deadline
//! order. A flag raised during a cycle is picked up on the next cycle, so
//! no task can starve the rest of the queue.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::time::Time;

/// Monotonic time source driving the poll loop.
///
/// Only differences matter; the origin is arbitrary. The source must never
/// step backwards.
pub trait TimeRef {
    fn now(&mut self) -> Time;
}

/// Identifies a registered task. Stale ids (after unregister) are inert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u32);

/// Cloneable wakeup handle for an OnDemand task.
///
/// Raising is a pair of atomic operations, safe from interrupt context.
/// Raising an already-raised flag is a no-op.
#[derive(Debug, Clone)]
pub struct Notify {
    flag: Arc<AtomicU64>,
    counter: Arc<AtomicU64>,
}

impl Notify {
    /// Request service for the associated task on the next cycle.
    pub fn raise(&self) {
        if self.flag.load(Ordering::Acquire) == 0 {
            let seq = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
            self.flag.store(seq, Ordering::Release);
        }
    }

    /// True if service has been requested and not yet delivered.
    pub fn requested(&self) -> bool {
        self.flag.load(Ordering::Acquire) != 0
    }
}

#[derive(Debug)]
enum Kind {
    Always,
    OnDemand { flag: Arc<AtomicU64> },
    Timer { interval: Time, deadline: Option<Time>, one_shot: bool },
}

#[derive(Debug)]
struct Slot {
    kind: Kind,
    live: bool,
}

/// Registry and sequencer for polled tasks.
#[derive(Debug, Default)]
pub struct Scheduler {
    slots: Vec<Slot>,
    counter: Arc<AtomicU64>,
    due: Vec<TaskId>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task serviced on every cycle.
    pub fn register_always(&mut self) -> TaskId {
        self.push(Kind::Always)
    }

    /// Register a task serviced when its [Notify] flag is raised.
    pub fn register_on_demand(&mut self) -> TaskId {
        let flag = Arc::new(AtomicU64::new(0));
        self.push(Kind::OnDemand { flag })
    }

    /// Register a periodic task. The first deadline is one interval after
    /// the first service cycle that sees the registration.
    pub fn register_timer(&mut self, interval: Time) -> TaskId {
        self.push(Kind::Timer { interval, deadline: None, one_shot: false })
    }

    /// Register a timer that is not yet armed. Arm it with [Scheduler::timer_once].
    pub fn register_timer_stopped(&mut self) -> TaskId {
        self.push(Kind::Timer { interval: Time::ZERO, deadline: None, one_shot: true })
    }

    fn push(&mut self, kind: Kind) -> TaskId {
        self.slots.push(Slot { kind, live: true });
        TaskId((self.slots.len() - 1) as u32)
    }

    /// Remove a task. Safe at any point outside the task's own callback;
    /// a removal requested during the callback takes effect afterwards
    /// because the due-list for the cycle is already built.
    pub fn unregister(&mut self, id: TaskId) {
        if let Some(slot) = self.slots.get_mut(id.0 as usize) {
            slot.live = false;
        }
    }

    /// Wakeup handle for an OnDemand task.
    pub fn notify(&self, id: TaskId) -> Option<Notify> {
        match &self.slots.get(id.0 as usize)?.kind {
            Kind::OnDemand { flag } => Some(Notify {
                flag: flag.clone(),
                counter: self.counter.clone(),
            }),
            _ => None,
        }
    }

    /// Raise an OnDemand task's flag directly.
    pub fn request_poll(&self, id: TaskId) {
        if let Some(n) = self.notify(id) {
            n.raise();
        }
    }

    /// Re-arm a timer for a single shot at `now + delay`, where `now` is
    /// the time of the next service cycle.
    pub fn timer_once(&mut self, id: TaskId, now: Time, delay: Time) {
        if let Some(slot) = self.slots.get_mut(id.0 as usize) {
            if let Kind::Timer { interval, deadline, one_shot } = &mut slot.kind {
                *interval = Time::ZERO;
                *deadline = Some(now + delay);
                *one_shot = true;
            }
        }
    }

    /// Disarm a timer without unregistering it.
    pub fn timer_stop(&mut self, id: TaskId) {
        if let Some(slot) = self.slots.get_mut(id.0 as usize) {
            if let Kind::Timer { interval, deadline, one_shot } = &mut slot.kind {
                *interval = Time::ZERO;
                *deadline = None;
                *one_shot = true;
            }
        }
    }

    /// Change a periodic timer's interval, keeping its phase.
    pub fn timer_every(&mut self, id: TaskId, interval: Time) {
        if let Some(slot) = self.slots.get_mut(id.0 as usize) {
            if let Kind::Timer { interval: i, one_shot, .. } = &mut slot.kind {
                *i = interval;
                *one_shot = false;
            }
        }
    }

    /// Build the list of tasks due at `now`.
    ///
    /// The caller services every returned id before calling again. Flags
    /// raised while servicing land in the next cycle.
    pub fn service(&mut self, now: Time) -> &[TaskId] {
        self.due.clear();

        // OnDemand, in request order.
        let mut requested: Vec<(u64, TaskId)> = Vec::new();
        for (i, slot) in self.slots.iter().enumerate() {
            if !slot.live {
                continue;
            }
            if let Kind::OnDemand { flag } = &slot.kind {
                let seq = flag.swap(0, Ordering::AcqRel);
                if seq != 0 {
                    requested.push((seq, TaskId(i as u32)));
                }
            }
        }
        requested.sort_unstable_by_key(|&(seq, _)| seq);
        self.due.extend(requested.into_iter().map(|(_, id)| id));

        // Always, in registration order.
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.live && matches!(slot.kind, Kind::Always) {
                self.due.push(TaskId(i as u32));
            }
        }

        // Timers, in deadline order.
        let mut fired: Vec<(Time, TaskId)> = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if !slot.live {
                continue;
            }
            if let Kind::Timer { interval, deadline, one_shot } = &mut slot.kind {
                match *deadline {
                    None if !*one_shot => *deadline = Some(now + *interval),
                    Some(d) if d <= now => {
                        fired.push((d, TaskId(i as u32)));
                        if *one_shot {
                            *deadline = None;
                        } else {
                            // Keep phase; skip periods missed while stalled.
                            let mut next = d + *interval;
                            while next <= now {
                                next += *interval;
                            }
                            *deadline = Some(next);
                        }
                    }
                    _ => {}
                }
            }
        }
        fired.sort_by_key(|&(d, _)| d);
        self.due.extend(fired.into_iter().map(|(_, id)| id));

        &self.due
    }
}

/// Drives a [Scheduler] from a monotonic time source.
#[derive(Debug)]
pub struct Timekeeper<T: TimeRef> {
    source: T,
}

impl<T: TimeRef> Timekeeper<T> {
    pub fn new(source: T) -> Self {
        Timekeeper { source }
    }

    pub fn now(&mut self) -> Time {
        self.source.now()
    }

    /// One service cycle at the source's current time.
    pub fn service<'s>(&mut self, sched: &'s mut Scheduler) -> &'s [TaskId] {
        let now = self.source.now();
        sched.service(now)
    }
}

/// A stopped timer plus its arming surface, for one-shot deadlines.
#[derive(Debug, Clone, Copy)]
pub struct VirtualTimer {
    id: TaskId,
}

impl VirtualTimer {
    pub fn new(sched: &mut Scheduler) -> Self {
        VirtualTimer { id: sched.register_timer_stopped() }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn arm(&self, sched: &mut Scheduler, now: Time, delay: Time) {
        sched.timer_once(self.id, now, delay);
    }

    pub fn cancel(&self, sched: &mut Scheduler) {
        sched.timer_stop(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{ONE_MILLISECOND, ONE_SECOND};

    #[test]
    fn service_order() {
        let mut sched = Scheduler::new();
        let always = sched.register_always();
        let od_a = sched.register_on_demand();
        let od_b = sched.register_on_demand();
        let timer = sched.register_timer(ONE_SECOND);

        // Raise B before A: request order must hold.
        sched.request_poll(od_b);
        sched.request_poll(od_a);

        let t0 = Time::ZERO;
        let due = sched.service(t0);
        assert_eq!(due, &[od_b, od_a, always]);

        // Timer fires once its first interval elapses.
        let due = sched.service(t0 + ONE_SECOND);
        assert_eq!(due, &[always, timer]);
        let _ = timer;
    }

    #[test]
    fn on_demand_fires_once_per_request() {
        let mut sched = Scheduler::new();
        let od = sched.register_on_demand();
        let n = sched.notify(od).unwrap();
        n.raise();
        n.raise();
        assert_eq!(sched.service(Time::ZERO), &[od]);
        assert_eq!(sched.service(Time::ZERO), &[] as &[TaskId]);
        // Raised again mid-"cycle": next service picks it up.
        n.raise();
        assert_eq!(sched.service(Time::ZERO), &[od]);
    }

    #[test]
    fn timer_deadlines_do_not_accumulate() {
        let mut sched = Scheduler::new();
        let t = sched.register_timer(ONE_MILLISECOND * 10);
        sched.service(Time::ZERO);
        // Stall for 35 ms: one catch-up fire, then back in phase.
        let due = sched.service(ONE_MILLISECOND * 35);
        assert_eq!(due, &[t]);
        let due = sched.service(ONE_MILLISECOND * 39);
        assert!(due.is_empty());
        let due = sched.service(ONE_MILLISECOND * 40);
        assert_eq!(due, &[t]);
    }

    #[test]
    fn one_shot_timer() {
        let mut sched = Scheduler::new();
        let vt = VirtualTimer::new(&mut sched);
        assert!(sched.service(Time::ZERO).is_empty());
        vt.arm(&mut sched, Time::ZERO, ONE_MILLISECOND * 5);
        assert!(sched.service(ONE_MILLISECOND * 4).is_empty());
        assert_eq!(sched.service(ONE_MILLISECOND * 5), &[vt.id()]);
        assert!(sched.service(ONE_MILLISECOND * 100).is_empty());
    }

    #[test]
    fn unregister_is_inert() {
        let mut sched = Scheduler::new();
        let a = sched.register_always();
        sched.unregister(a);
        assert!(sched.service(Time::ZERO).is_empty());
    }
}
