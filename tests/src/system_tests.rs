//! Dispatcher and scheduler working together, the way the firmware main
//! loop drives them.

use core::cell::Cell;

use critical_section::Mutex;
use psu_core::test_utils::{leak, LinkHarness, RecordingTask, ResponderMode};
use psu_core::{
    run_once, Dispatcher, Event, EventData, EventKind, RunStatus, Scheduler, Task, TaskRef,
};

/// Task that re-arms its own deadline a fixed number of times.
struct Periodic {
    scheduler: &'static Scheduler,
    period: u16,
    remaining: Mutex<Cell<u8>>,
    fired: Mutex<Cell<u8>>,
    me: Mutex<Cell<Option<TaskRef>>>,
}

impl Periodic {
    fn new(scheduler: &'static Scheduler, period: u16, times: u8) -> Self {
        Self {
            scheduler,
            period,
            remaining: Mutex::new(Cell::new(times)),
            fired: Mutex::new(Cell::new(0)),
            me: Mutex::new(Cell::new(None)),
        }
    }

    fn arm(&self, me: TaskRef) {
        critical_section::with(|cs| self.me.borrow(cs).set(Some(me)));
        self.scheduler
            .schedule(self.period, me, Event::of(EventKind::App(0)))
            .unwrap();
    }

    fn fire_count(&self) -> u8 {
        critical_section::with(|cs| self.fired.borrow(cs).get())
    }
}

impl Task for Periodic {
    fn resume(&self, event: Event) {
        if event.kind != EventKind::App(0) {
            return;
        }
        critical_section::with(|cs| {
            self.fired.borrow(cs).set(self.fired.borrow(cs).get() + 1);
            let left = self.remaining.borrow(cs).get() - 1;
            self.remaining.borrow(cs).set(left);
            if left > 0 {
                if let Some(me) = self.me.borrow(cs).get() {
                    self.scheduler
                        .schedule(self.period, me, Event::of(EventKind::App(0)))
                        .unwrap();
                }
            }
        });
    }
}

#[test]
fn run_once_prefers_posted_events_over_deadlines() {
    let h = LinkHarness::new(ResponderMode::Silent);
    let task = leak(RecordingTask::new());
    h.dispatcher.register(task).unwrap();
    // Drain the init events of the harness tasks registered before ours.
    h.dispatcher.run_one();
    h.dispatcher.run_one();
    h.dispatcher.run_one();

    h.scheduler
        .schedule(0, task, Event::new(EventKind::App(1), EventData(1)))
        .unwrap();
    h.dispatcher
        .post(task, Event::new(EventKind::App(2), EventData(2)))
        .unwrap();

    // Our init, the posted event, then the expired deadline.
    assert_eq!(run_once(h.dispatcher, h.scheduler), RunStatus::Executed);
    assert_eq!(run_once(h.dispatcher, h.scheduler), RunStatus::Executed);
    assert_eq!(run_once(h.dispatcher, h.scheduler), RunStatus::Executed);
    assert_eq!(run_once(h.dispatcher, h.scheduler), RunStatus::Idle);

    let kinds: Vec<EventKind> = task.events().iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        [EventKind::Init, EventKind::App(2), EventKind::App(1)]
    );
}

#[test]
fn periodic_task_re_arms_itself() {
    let h = LinkHarness::new(ResponderMode::Silent);
    let periodic = leak(Periodic::new(h.scheduler, 10, 5));
    h.dispatcher.register(periodic).unwrap();
    periodic.arm(periodic);

    h.run(60);
    assert_eq!(periodic.fire_count(), 5);

    // No further deadlines pending once the series is done.
    h.run(40);
    assert_eq!(periodic.fire_count(), 5);
    assert_eq!(h.scheduler.pending(), 0);
}

#[test]
fn link_traffic_and_periodic_work_share_the_loop() {
    use psu_core::{SpimTrx, SpimTrxStatus};

    let h = LinkHarness::new(ResponderMode::Reply {
        msg_type: 0x05,
        payload: &[0x0A],
    });
    let periodic = leak(Periodic::new(h.scheduler, 7, 4));
    h.dispatcher.register(periodic).unwrap();
    periodic.arm(periodic);

    let trx = leak(SpimTrx::framed(h.select, 0x01, &[0x01], 8, Some(h.owner as TaskRef)).unwrap());
    let status = h.run_until_done(trx, 400);
    assert_eq!(status, SpimTrxStatus::CompletedSuccessfully);

    h.run(100);
    assert_eq!(periodic.fire_count(), 4);
}

#[test]
fn two_tasks_exchange_posted_events() {
    let dispatcher = leak(Dispatcher::new());
    let a = leak(RecordingTask::new());
    let b = leak(RecordingTask::new());
    dispatcher.register(a).unwrap();
    dispatcher.register(b).unwrap();

    for n in 0..3 {
        dispatcher
            .post(a, Event::new(EventKind::App(0), EventData(n)))
            .unwrap();
        dispatcher
            .post(b, Event::new(EventKind::App(1), EventData(n)))
            .unwrap();
    }
    while dispatcher.run_one() == RunStatus::Executed {}

    let a_data: Vec<usize> = a
        .events()
        .iter()
        .filter_map(|e| (e.kind == EventKind::App(0)).then_some(e.data.0))
        .collect();
    let b_data: Vec<usize> = b
        .events()
        .iter()
        .filter_map(|e| (e.kind == EventKind::App(1)).then_some(e.data.0))
        .collect();
    assert_eq!(a_data, [0, 1, 2]);
    assert_eq!(b_data, [0, 1, 2]);
}
