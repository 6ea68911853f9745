//! Deadline scheduler on an 8-bit compare timer.
//!
//! Deadlines live on a 16-bit tick line that wraps; the hardware only gives
//! us an 8-bit free-running counter with one compare register. The scheduler
//! bridges the two by never programming a compare more than
//! `TIMER_INTERVAL_MAX` ticks out and tracking the 16-bit tick value at
//! which the programmed compare will fire (`next_interrupt_tick`). The
//! current tick is always recoverable as that value minus the distance the
//! counter still has to travel.
//!
//! Nodes come from a fixed pool threaded by index. Three lists share it:
//! free nodes, waiting nodes sorted by deadline, and ready nodes in FIFO
//! order awaiting delivery by the run loop.

use core::cell::RefCell;

use critical_section::Mutex;

use crate::config::{SCHED_TASKS_MAX, TIMER_INTERVAL_MAX};
use crate::hal::TickTimer;
use crate::process::TaskRef;
use crate::types::{Event, EventKind, RunStatus, SchedError, Ticks};

/// Half the tick line; offsets below this are "in the past or now".
const TICK_WINDOW: Ticks = 0x8000;

#[derive(Copy, Clone)]
struct Node {
    tick: Ticks,
    task: Option<TaskRef>,
    event: Event,
    next: Option<u8>,
}

impl Node {
    const EMPTY: Self = Self {
        tick: 0,
        task: None,
        event: Event::of(EventKind::Init),
        next: None,
    };
}

struct Inner {
    pool: [Node; SCHED_TASKS_MAX],
    free: Option<u8>,
    waiting: Option<u8>,
    ready_head: Option<u8>,
    ready_tail: Option<u8>,
    /// Tick value at which the currently programmed compare fires.
    next_interrupt_tick: Ticks,
}

impl Inner {
    fn alloc(&mut self) -> Option<u8> {
        let idx = self.free?;
        self.free = self.pool[idx as usize].next;
        self.pool[idx as usize].next = None;
        Some(idx)
    }

    fn release(&mut self, idx: u8) {
        let node = &mut self.pool[idx as usize];
        node.task = None;
        node.next = self.free;
        self.free = Some(idx);
    }

    fn ready_push(&mut self, idx: u8) {
        self.pool[idx as usize].next = None;
        match self.ready_tail {
            Some(tail) => self.pool[tail as usize].next = Some(idx),
            None => self.ready_head = Some(idx),
        }
        self.ready_tail = Some(idx);
    }

    fn ready_pop(&mut self) -> Option<u8> {
        let idx = self.ready_head?;
        self.ready_head = self.pool[idx as usize].next;
        if self.ready_head.is_none() {
            self.ready_tail = None;
        }
        Some(idx)
    }
}

/// Fixed-pool deadline scheduler. One per tick timer.
pub struct Scheduler {
    timer: &'static dyn TickTimer,
    inner: Mutex<RefCell<Inner>>,
}

impl Scheduler {
    pub const fn new(timer: &'static dyn TickTimer) -> Self {
        Self {
            timer,
            inner: Mutex::new(RefCell::new(Inner {
                pool: [Node::EMPTY; SCHED_TASKS_MAX],
                free: None,
                waiting: None,
                ready_head: None,
                ready_tail: None,
                next_interrupt_tick: 0,
            })),
        }
    }

    /// Threads the free list and arms the first compare a full interval
    /// out. Must run before the timer interrupt is enabled.
    pub fn init(&self) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            inner.free = Some(0);
            for i in 0..SCHED_TASKS_MAX {
                inner.pool[i].next = if i + 1 < SCHED_TASKS_MAX {
                    Some((i + 1) as u8)
                } else {
                    None
                };
            }
            let counter = self.timer.counter();
            self.timer.set_compare(counter.wrapping_add(TIMER_INTERVAL_MAX));
            inner.next_interrupt_tick = TIMER_INTERVAL_MAX as Ticks;
        });
    }

    /// Maps a counter snapshot onto the 16-bit tick line. The caller must
    /// reuse the same snapshot for any compare reprogramming, otherwise a
    /// counter increment between reads skews the tick base for good.
    fn current_tick(&self, inner: &Inner, counter: u8) -> Ticks {
        let remaining = self.timer.compare().wrapping_sub(counter);
        inner.next_interrupt_tick.wrapping_sub(remaining as Ticks)
    }

    /// Arranges for `task` to be resumed with `event` once `delay` ticks
    /// have elapsed. A zero delay goes straight to the ready list.
    ///
    /// Delays must stay below half the tick line; beyond that a deadline is
    /// indistinguishable from one in the past.
    pub fn schedule(&self, delay: Ticks, task: TaskRef, event: Event) -> Result<(), SchedError> {
        debug_assert!(delay < TICK_WINDOW);
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let idx = inner.alloc().ok_or(SchedError::QueueFull)?;
            inner.pool[idx as usize].task = Some(task);
            inner.pool[idx as usize].event = event;

            if delay == 0 {
                inner.ready_push(idx);
                return Ok(());
            }

            let counter = self.timer.counter();
            let current = self.current_tick(&inner, counter);
            let due = current.wrapping_add(delay);
            inner.pool[idx as usize].tick = due;

            // Sorted insert by offset from now; equal deadlines keep
            // scheduling order.
            let mut prev: Option<u8> = None;
            let mut cursor = inner.waiting;
            while let Some(j) = cursor {
                if inner.pool[j as usize].tick.wrapping_sub(current) <= delay {
                    prev = Some(j);
                    cursor = inner.pool[j as usize].next;
                } else {
                    break;
                }
            }
            inner.pool[idx as usize].next = cursor;
            match prev {
                Some(p) => inner.pool[p as usize].next = Some(idx),
                None => {
                    inner.waiting = Some(idx);
                    // New earliest deadline; pull the compare in if it
                    // currently fires later than this node needs.
                    let until_next = inner.next_interrupt_tick.wrapping_sub(current);
                    if delay < until_next {
                        let step = delay.min(TIMER_INTERVAL_MAX as Ticks) as u8;
                        self.timer.set_compare(counter.wrapping_add(step));
                        inner.next_interrupt_tick = current.wrapping_add(step as Ticks);
                    }
                }
            }
            Ok(())
        })
    }

    /// Compare-match interrupt body. Promotes every due node to the ready
    /// list and programs the next compare.
    pub fn on_timer_interrupt(&self) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let current = inner.next_interrupt_tick;

            while let Some(head) = inner.waiting {
                if current.wrapping_sub(inner.pool[head as usize].tick) < TICK_WINDOW {
                    inner.waiting = inner.pool[head as usize].next;
                    inner.ready_push(head);
                } else {
                    break;
                }
            }

            let step = match inner.waiting {
                Some(head) => inner.pool[head as usize]
                    .tick
                    .wrapping_sub(current)
                    .min(TIMER_INTERVAL_MAX as Ticks),
                None => TIMER_INTERVAL_MAX as Ticks,
            };
            // `current` is the tick of the compare that just matched, so the
            // matched compare value is the anchor for the next one. Reading
            // the counter here instead would shift the base whenever entry
            // into the handler is delayed.
            self.timer
                .set_compare(self.timer.compare().wrapping_add(step as u8));
            inner.next_interrupt_tick = current.wrapping_add(step);
        });
    }

    /// Delivers at most one expired deadline; never blocks.
    pub fn run_one(&self) -> RunStatus {
        let due = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let idx = inner.ready_pop()?;
            let task = inner.pool[idx as usize].task;
            let event = inner.pool[idx as usize].event;
            inner.release(idx);
            task.map(|t| (t, event))
        });
        match due {
            Some((task, event)) => {
                task.resume(event);
                RunStatus::Executed
            }
            None => RunStatus::Idle,
        }
    }

    /// Deadlines not yet delivered, waiting or ready.
    pub fn pending(&self) -> usize {
        critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            let mut n = 0;
            let mut cursor = inner.waiting;
            while let Some(j) = cursor {
                n += 1;
                cursor = inner.pool[j as usize].next;
            }
            cursor = inner.ready_head;
            while let Some(j) = cursor {
                n += 1;
                cursor = inner.pool[j as usize].next;
            }
            n
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::MockTickTimer;
    use crate::test_utils::{leak, RecordingTask};
    use crate::types::EventData;

    fn fixture() -> (&'static MockTickTimer, &'static Scheduler) {
        let timer = leak(MockTickTimer::new());
        let sched = leak(Scheduler::new(timer));
        sched.init();
        (timer, sched)
    }

    fn tick(timer: &MockTickTimer, sched: &Scheduler) {
        if timer.step() {
            sched.on_timer_interrupt();
        }
    }

    fn app(n: usize) -> Event {
        Event::new(EventKind::App(0), EventData(n))
    }

    #[test]
    fn zero_delay_is_ready_immediately() {
        let (_, sched) = fixture();
        let task = leak(RecordingTask::new());
        sched.schedule(0, task, app(7)).unwrap();
        assert_eq!(sched.run_one(), RunStatus::Executed);
        assert_eq!(task.events().as_slice(), [app(7)]);
    }

    #[test]
    fn deadline_fires_after_exact_delay() {
        let (timer, sched) = fixture();
        let task = leak(RecordingTask::new());
        sched.schedule(3, task, app(1)).unwrap();
        for _ in 0..2 {
            tick(timer, sched);
            assert_eq!(sched.run_one(), RunStatus::Idle);
        }
        tick(timer, sched);
        assert_eq!(sched.run_one(), RunStatus::Executed);
        assert_eq!(task.events().as_slice(), [app(1)]);
    }

    #[test]
    fn deadlines_fire_in_order_regardless_of_insertion() {
        let (timer, sched) = fixture();
        let task = leak(RecordingTask::new());
        sched.schedule(9, task, app(3)).unwrap();
        sched.schedule(2, task, app(1)).unwrap();
        sched.schedule(5, task, app(2)).unwrap();
        for _ in 0..10 {
            tick(timer, sched);
            while sched.run_one() == RunStatus::Executed {}
        }
        assert_eq!(task.events().as_slice(), [app(1), app(2), app(3)]);
    }

    #[test]
    fn equal_deadlines_keep_scheduling_order() {
        let (timer, sched) = fixture();
        let task = leak(RecordingTask::new());
        sched.schedule(4, task, app(1)).unwrap();
        sched.schedule(4, task, app(2)).unwrap();
        for _ in 0..4 {
            tick(timer, sched);
        }
        while sched.run_one() == RunStatus::Executed {}
        assert_eq!(task.events().as_slice(), [app(1), app(2)]);
    }

    #[test]
    fn pool_exhaustion_reports_queue_full() {
        let (_, sched) = fixture();
        let task = leak(RecordingTask::new());
        for n in 0..SCHED_TASKS_MAX {
            sched.schedule(10, task, app(n)).unwrap();
        }
        assert_eq!(sched.schedule(10, task, app(99)), Err(SchedError::QueueFull));
        assert_eq!(sched.pending(), SCHED_TASKS_MAX);
    }

    #[test]
    fn nodes_recycle_after_delivery() {
        let (timer, sched) = fixture();
        let task = leak(RecordingTask::new());
        for round in 0..3 {
            for n in 0..SCHED_TASKS_MAX {
                sched.schedule(1, task, app(round * 100 + n)).unwrap();
            }
            tick(timer, sched);
            while sched.run_one() == RunStatus::Executed {}
        }
        assert_eq!(task.events().len(), 3 * SCHED_TASKS_MAX);
    }

    #[test]
    fn survives_counter_wrap() {
        let (timer, sched) = fixture();
        let task = leak(RecordingTask::new());
        // Push the 8-bit counter through several wraps with deadlines
        // straddling them.
        let mut fired = 0;
        for round in 0..6 {
            sched.schedule(200, task, app(round)).unwrap();
            for _ in 0..200 {
                tick(timer, sched);
                if sched.run_one() == RunStatus::Executed {
                    fired += 1;
                }
            }
        }
        assert_eq!(fired, 6);
        assert_eq!(
            task.events().as_slice(),
            [app(0), app(1), app(2), app(3), app(4), app(5)]
        );
    }

    #[test]
    fn counter_running_during_schedule_keeps_tick_base() {
        let (timer, sched) = fixture();
        let task = leak(RecordingTask::new());
        // The counter keeps ticking while schedule() executes; the compare
        // must still land on the deadline computed from the snapshot.
        timer.tick_on_read(true);
        sched.schedule(5, task, app(9)).unwrap();
        timer.tick_on_read(false);
        // One tick elapsed inside schedule() itself, so five steps reach
        // the deadline at counter 6.
        for _ in 0..4 {
            tick(timer, sched);
            assert_eq!(sched.run_one(), RunStatus::Idle);
        }
        tick(timer, sched);
        assert_eq!(sched.run_one(), RunStatus::Executed);
        assert_eq!(timer.counter(), 6);
        assert_eq!(task.events().as_slice(), [app(9)]);
    }

    #[test]
    fn deadlines_stay_exact_across_tick_line_wrap() {
        let (timer, sched) = fixture();
        let task = leak(RecordingTask::new());
        // 80 rounds of 900 ticks pushes the 16-bit tick line through its
        // wrap at 65536 partway through round 73.
        for round in 0..80 {
            sched.schedule(900, task, app(round)).unwrap();
            for t in 0..900 {
                tick(timer, sched);
                let status = sched.run_one();
                if t < 899 {
                    assert_eq!(status, RunStatus::Idle);
                } else {
                    assert_eq!(status, RunStatus::Executed);
                }
            }
        }
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn long_delay_spans_multiple_compare_intervals() {
        let (timer, sched) = fixture();
        let task = leak(RecordingTask::new());
        sched.schedule(700, task, app(42)).unwrap();
        for _ in 0..699 {
            tick(timer, sched);
            assert_eq!(sched.run_one(), RunStatus::Idle);
        }
        tick(timer, sched);
        assert_eq!(sched.run_one(), RunStatus::Executed);
        assert_eq!(task.events().as_slice(), [app(42)]);
    }
}
