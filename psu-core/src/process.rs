//! Cooperative tasks and the posted-event dispatcher.
//!
//! A task is a stackless state machine with a single capability: being
//! resumed with an event. Tasks never block; they record where to continue
//! and return to the run loop. The dispatcher owns a bounded FIFO of posted
//! events and delivers exactly one per `run_one` call.
//!
//! `post` may be called from interrupt handlers; every queue mutation is
//! bracketed by a critical section so interrupt and foreground producers
//! cannot interleave with delivery.

use core::cell::RefCell;

use critical_section::Mutex;
use heapless::Vec;

use crate::config::{EVENT_QUEUE_SIZE, TASKS_MAX};
use crate::types::{Event, EventKind, PostError, RegisterError, RunStatus, UnregisterError};

/// A resumable unit of cooperative concurrency.
///
/// Implementations keep their own state behind interior mutability; `resume`
/// runs only from the foreground run loop, but the object is shared with
/// interrupt context through the queues that reference it.
pub trait Task: Sync {
    fn resume(&self, event: Event);
}

/// How tasks are addressed. Identity is the object's address.
pub type TaskRef = &'static dyn Task;

/// Address comparison; trait objects compare by their data pointer.
pub(crate) fn task_eq(a: TaskRef, b: TaskRef) -> bool {
    core::ptr::eq(a as *const dyn Task as *const (), b as *const dyn Task as *const ())
}

#[derive(Copy, Clone)]
struct Posted {
    task: TaskRef,
    event: Event,
}

struct Inner {
    tasks: Vec<TaskRef, TASKS_MAX>,
    queue: [Option<Posted>; EVENT_QUEUE_SIZE],
    first: usize,
    count: usize,
}

impl Inner {
    fn enqueue(&mut self, task: TaskRef, event: Event) -> Result<(), PostError> {
        if self.count == EVENT_QUEUE_SIZE {
            return Err(PostError::QueueFull);
        }
        let slot = (self.first + self.count) % EVENT_QUEUE_SIZE;
        self.queue[slot] = Some(Posted { task, event });
        self.count += 1;
        Ok(())
    }
}

/// Bounded event queue plus task registry.
pub struct Dispatcher {
    inner: Mutex<RefCell<Inner>>,
}

impl Dispatcher {
    const EMPTY_SLOT: Option<Posted> = None;

    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                tasks: Vec::new(),
                queue: [Self::EMPTY_SLOT; EVENT_QUEUE_SIZE],
                first: 0,
                count: 0,
            })),
        }
    }

    /// Adds a task and posts its `Init` event.
    ///
    /// Fails if the same object is already registered or the registry is
    /// full. A full event queue is tolerated here; the task simply starts
    /// without its init notification.
    pub fn register(&self, task: TaskRef) -> Result<(), RegisterError> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.tasks.iter().any(|t| task_eq(*t, task)) {
                return Err(RegisterError::AlreadyRegistered);
            }
            inner
                .tasks
                .push(task)
                .map_err(|_| RegisterError::TooManyTasks)?;
            if inner.enqueue(task, Event::of(EventKind::Init)).is_err() {
                #[cfg(feature = "defmt")]
                defmt::warn!("dispatcher: init event dropped, queue full");
            }
            Ok(())
        })
    }

    /// Removes a task from the registry.
    ///
    /// Events already queued for the task are not purged; they are dropped
    /// at delivery time.
    pub fn unregister(&self, task: TaskRef) -> Result<(), UnregisterError> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let pos = inner.tasks.iter().position(|t| task_eq(*t, task));
            match pos {
                Some(pos) => {
                    inner.tasks.remove(pos);
                    Ok(())
                }
                None => Err(UnregisterError::NotRegistered),
            }
        })
    }

    /// Appends an event for `task`. Safe to call from interrupt context.
    ///
    /// On `QueueFull` the queue is left untouched and the caller decides
    /// whether to retry or drop the work.
    pub fn post(&self, task: TaskRef, event: Event) -> Result<(), PostError> {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).enqueue(task, event))
    }

    /// Delivers at most one event; never blocks.
    ///
    /// The resume itself runs outside the critical section so interrupt
    /// handlers can keep posting while a task executes. An event addressed
    /// to a task that has been unregistered since posting is discarded.
    pub fn run_one(&self) -> RunStatus {
        let next = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.count == 0 {
                return None;
            }
            let slot = inner.first;
            let posted = inner.queue[slot].take();
            inner.first = (inner.first + 1) % EVENT_QUEUE_SIZE;
            inner.count -= 1;
            posted.map(|p| {
                let registered = inner.tasks.iter().any(|t| task_eq(*t, p.task));
                (p, registered)
            })
        });

        match next {
            None => RunStatus::Idle,
            Some((posted, true)) => {
                posted.task.resume(posted.event);
                RunStatus::Executed
            }
            Some((_posted, false)) => {
                #[cfg(feature = "defmt")]
                defmt::trace!("dispatcher: dropped event for unregistered task");
                RunStatus::Executed
            }
        }
    }

    /// Number of undelivered events.
    pub fn pending(&self) -> usize {
        critical_section::with(|cs| self.inner.borrow_ref(cs).count)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
