//! Host-test support: event recorders, a canned responder task and a full
//! master-to-slave loopback rig.

use core::cell::RefCell;

use critical_section::Mutex;
use heapless::Vec;

use crate::hal::mock::{MockMasterBus, MockSelectLine, MockSlaveBus, MockTickTimer};
use crate::process::{Dispatcher, Task};
use crate::sched::Scheduler;
use crate::spi_master::{SpimEngine, SpimTrx};
use crate::spi_slave::SpisEngine;
use crate::types::{Event, EventKind, SpimTrxStatus, SpisSendError};

/// Engines and tasks are wired by `&'static` reference; on hardware those
/// live in statics, on the host we just leak them.
pub fn leak<T>(value: T) -> &'static T {
    std::boxed::Box::leak(std::boxed::Box::new(value))
}

/// Task that records every event it is resumed with.
pub struct RecordingTask {
    events: Mutex<RefCell<Vec<Event, 32>>>,
}

impl RecordingTask {
    pub const fn new() -> Self {
        Self {
            events: Mutex::new(RefCell::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Vec<Event, 32> {
        critical_section::with(|cs| self.events.borrow_ref(cs).clone())
    }

    pub fn last(&self) -> Option<Event> {
        critical_section::with(|cs| self.events.borrow_ref(cs).last().copied())
    }

    pub fn saw(&self, kind: EventKind) -> bool {
        critical_section::with(|cs| self.events.borrow_ref(cs).iter().any(|e| e.kind == kind))
    }
}

impl Default for RecordingTask {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for RecordingTask {
    fn resume(&self, event: Event) {
        critical_section::with(|cs| {
            let _ = self.events.borrow_ref_mut(cs).push(event);
        });
    }
}

/// What the responder does when a frame arrives.
#[derive(Copy, Clone)]
pub enum ResponderMode {
    /// Never answer; the master has to time out.
    Silent,
    /// Answer every frame with this type and payload.
    Reply {
        msg_type: u8,
        payload: &'static [u8],
    },
}

struct ResponderLog {
    events: Vec<Event, 32>,
    mode: ResponderMode,
    last_send: Option<Result<(), SpisSendError>>,
}

/// Slave-owner task that answers received frames according to its mode.
pub struct Responder {
    slave: &'static SpisEngine,
    log: Mutex<RefCell<ResponderLog>>,
}

impl Responder {
    pub fn new(slave: &'static SpisEngine, mode: ResponderMode) -> Self {
        Self {
            slave,
            log: Mutex::new(RefCell::new(ResponderLog {
                events: Vec::new(),
                mode,
                last_send: None,
            })),
        }
    }

    pub fn set_mode(&self, mode: ResponderMode) {
        critical_section::with(|cs| self.log.borrow_ref_mut(cs).mode = mode);
    }

    pub fn saw(&self, kind: EventKind) -> bool {
        critical_section::with(|cs| self.log.borrow_ref(cs).events.iter().any(|e| e.kind == kind))
    }

    pub fn last_send(&self) -> Option<Result<(), SpisSendError>> {
        critical_section::with(|cs| self.log.borrow_ref(cs).last_send)
    }
}

impl Task for Responder {
    fn resume(&self, event: Event) {
        let mode = critical_section::with(|cs| {
            let mut log = self.log.borrow_ref_mut(cs);
            let _ = log.events.push(event);
            log.mode
        });
        if event.kind == EventKind::SpisMessageReceived {
            if let ResponderMode::Reply { msg_type, payload } = mode {
                let result = self.slave.send_response(msg_type, payload);
                critical_section::with(|cs| {
                    self.log.borrow_ref_mut(cs).last_send = Some(result);
                });
            }
        }
    }
}

/// Complete two-node rig: a master engine wired through the loopback bus
/// to a slave engine, sharing one dispatcher and one stepped timer.
pub struct LinkHarness {
    pub dispatcher: &'static Dispatcher,
    pub timer: &'static MockTickTimer,
    pub scheduler: &'static Scheduler,
    pub master_bus: &'static MockMasterBus,
    pub master: &'static SpimEngine,
    pub select: &'static MockSelectLine,
    pub slave_bus: &'static MockSlaveBus,
    pub slave: &'static SpisEngine,
    pub owner: &'static RecordingTask,
    pub responder: &'static Responder,
}

impl LinkHarness {
    pub fn new(mode: ResponderMode) -> Self {
        let dispatcher = leak(Dispatcher::new());
        let timer = leak(MockTickTimer::new());
        let scheduler = leak(Scheduler::new(timer));
        scheduler.init();

        let slave_bus = leak(MockSlaveBus::new());
        let slave = leak(SpisEngine::new());
        let responder = leak(Responder::new(slave, mode));
        dispatcher.register(responder).unwrap();
        slave.init(slave_bus, dispatcher, responder);

        let select = leak(MockSelectLine::new());
        select.wire_slave(slave);

        let master_bus = leak(MockMasterBus::new());
        master_bus.wire_loopback(slave, slave_bus);
        let master = leak(SpimEngine::new());
        master.init(master_bus, dispatcher, scheduler).unwrap();

        let owner = leak(RecordingTask::new());
        dispatcher.register(owner).unwrap();

        Self {
            dispatcher,
            timer,
            scheduler,
            master_bus,
            master,
            select,
            slave_bus,
            slave,
            owner,
            responder,
        }
    }

    /// One scheduling quantum: deliver one posted event, deliver one
    /// expired deadline, advance the timer one tick.
    pub fn step(&self) {
        self.dispatcher.run_one();
        self.scheduler.run_one();
        if self.timer.step() {
            self.scheduler.on_timer_interrupt();
        }
    }

    pub fn run(&self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Queues `trx` and steps until it reports an outcome.
    pub fn run_until_done(&self, trx: &'static SpimTrx, max_steps: usize) -> SpimTrxStatus {
        self.master.queue(trx).unwrap();
        for _ in 0..max_steps {
            self.step();
            if let Some(status) = trx.status() {
                return status;
            }
        }
        panic!("transaction never completed");
    }
}
