//! Cooperative periodic task driver.
//!
//! The stack is single-threaded: every layer exposes a [`Task`] that the
//! scheduler ticks at a bounded interval, or earlier whenever the task's
//! `check` predicate reports pending work (readable bytes, writable room
//! with a pending transmission, a non-empty queue). No task blocks inside a
//! tick; between ticks control stays with the caller.
//!
//! Time is passed in rather than read from a global clock, so tests can
//! drive a stepped clock and the real driver passes `Instant::now()`.

use std::rc::Rc;
use std::time::{Duration, Instant};

/// A periodically driven unit of work.
pub trait Task {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Called once before the first tick.
    fn init(&self, now: Instant) {
        let _ = now;
    }

    /// Advance the task's state machines.
    fn tick(&self, now: Instant);

    /// Fast predicate: `true` pulls the next tick forward to the current
    /// poll instead of waiting out the period.
    fn check(&self) -> bool {
        false
    }
}

struct Entry {
    task: Rc<dyn Task>,
    period: Duration,
    next_due: Instant,
    initialized: bool,
}

/// Runs registered tasks at their periods.
pub struct Scheduler {
    entries: Vec<Entry>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register `task` to be ticked every `period` (or sooner on demand).
    pub fn add_task(&mut self, task: Rc<dyn Task>, period: Duration) {
        self.entries.push(Entry {
            task,
            period,
            next_due: Instant::now(),
            initialized: false,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every task that is due at `now` or reports pending work.
    /// Returns how many tasks ran.
    pub fn poll(&mut self, now: Instant) -> usize {
        let mut ran = 0;
        for entry in &mut self.entries {
            if !entry.initialized {
                entry.task.init(now);
                entry.initialized = true;
                entry.next_due = now;
            }
            if now >= entry.next_due || entry.task.check() {
                entry.task.tick(now);
                entry.next_due = now + entry.period;
                ran += 1;
            }
        }
        ran
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
