//! Deferred execution of retry continuations.
//!
//! ## Implementations
//!
//! - `TokioScheduler`: sleeps on a runtime handle, then runs the task
//! - `DirectScheduler`: runs the task inline and ignores the delay
//! - `ManualScheduler`: timer queue driven by a `SimulatedClock`
//!
//! `ManualScheduler` mirrors a discrete event loop: tasks are ordered by due
//! time, then by submission order, and only run when the test advances time.

use crate::clock::{Clock, SimulatedClock, Timestamp};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::runtime::Handle;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Scheduler: Send + Sync + 'static {
    /// Run `task` once `delay` has passed. Must not run it on the caller's
    /// stack unless the implementation says so.
    fn schedule(&self, delay: Duration, task: Task);
}

/// Production scheduler backed by a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        TokioScheduler { handle }
    }

    /// Scheduler for the runtime the caller is running on.
    ///
    /// Panics outside a runtime, like `Handle::current`.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task();
        });
    }
}

/// Runs every task immediately on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectScheduler;

impl Scheduler for DirectScheduler {
    fn schedule(&self, _delay: Duration, task: Task) {
        task();
    }
}

struct ScheduledTask {
    due: Timestamp,
    seq: u64,
    task: Task,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse for min-heap
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct ManualQueue {
    heap: BinaryHeap<ScheduledTask>,
    next_seq: u64,
}

/// Deterministic scheduler for simulation.
///
/// Tasks never run inside `schedule`; they run from `run_due`, `advance`,
/// or `run_until_idle`, one at a time with no lock held.
pub struct ManualScheduler {
    clock: SimulatedClock,
    queue: Mutex<ManualQueue>,
}

impl ManualScheduler {
    pub fn new(clock: SimulatedClock) -> Self {
        ManualScheduler {
            clock,
            queue: Mutex::new(ManualQueue::default()),
        }
    }

    pub fn clock(&self) -> &SimulatedClock {
        &self.clock
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().heap.len()
    }

    /// Due time of the earliest queued task
    pub fn next_due(&self) -> Option<Timestamp> {
        self.queue.lock().heap.peek().map(|t| t.due)
    }

    fn pop_due(&self, now: Timestamp) -> Option<Task> {
        let mut queue = self.queue.lock();
        match queue.heap.peek() {
            Some(next) if next.due <= now => queue.heap.pop().map(|t| t.task),
            _ => None,
        }
    }

    /// Run every task due at the current time. Returns how many ran.
    pub fn run_due(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.pop_due(self.clock.now()) {
            task();
            ran += 1;
        }
        ran
    }

    /// Move time forward by `duration`, running tasks at their due times.
    pub fn advance(&self, duration: Duration) -> usize {
        let target = self.clock.now() + duration;
        let mut ran = self.run_due();
        while let Some(due) = self.next_due() {
            if due > target {
                break;
            }
            if due > self.clock.now() {
                self.clock.set(due.as_millis());
            }
            ran += self.run_due();
        }
        if target > self.clock.now() {
            self.clock.set(target.as_millis());
        }
        ran
    }

    /// Jump to each queued task in order until none remain or `max_tasks` ran.
    pub fn run_until_idle(&self, max_tasks: usize) -> usize {
        let mut ran = 0;
        while ran < max_tasks {
            let Some(due) = self.next_due() else {
                break;
            };
            if due > self.clock.now() {
                self.clock.set(due.as_millis());
            }
            match self.pop_due(self.clock.now()) {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        let due = self.clock.now() + delay;
        let mut queue = self.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(ScheduledTask { due, seq, task });
    }
}
