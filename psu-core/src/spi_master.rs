//! SPI master transaction engine.
//!
//! Transactions are queued as `&'static` descriptors and clocked out one
//! byte per pacing deadline, so the bus never busy-waits the run loop. The
//! engine is itself a task: a wake event starts the next queued transfer
//! and pacing events advance the byte state machine.
//!
//! Framed transfers follow the link protocol: the master sends
//! `[type][size][payload][crc]`, then polls with dummy bytes until the
//! slave's preloaded response type appears, and clocks the response frame
//! back in. While transmitting, the byte clocked back on each exchange is
//! inspected; a reserved-range byte means the slave already gave up on the
//! frame and the transfer is aborted early instead of running to the end.

use core::cell::RefCell;

use critical_section::Mutex;
use portable_atomic::{AtomicU8, Ordering};
use heapless::{Deque, Vec};

use crate::config::{
    LLP_RX_DELAY_TICKS, LLP_RX_POLL_LIMIT, LLP_TX_DELAY_TICKS, SPIM_RX_BUF_SIZE, SPIM_TRX_QUEUE_SIZE,
    SPIM_TX_BUF_SIZE,
};
use crate::hal::{SelectLine, SpiMasterBus};
use crate::link::{
    is_error_type, FrameCrc, TYPE_ERR_CRC_FAILURE, TYPE_ERR_MESSAGE_TOO_LARGE,
    TYPE_ERR_SLAVE_NOT_READY, TYPE_PREPARING_RESPONSE,
};
use crate::process::{Dispatcher, Task, TaskRef};
use crate::sched::Scheduler;
use crate::types::{
    Event, EventKind, SpimQueueError, SpimTrxError, SpimTrxStatus, Ticks,
};

const FLAG_QUEUED: u8 = 1 << 7;
const FLAG_IN_TRANSMISSION: u8 = 1 << 6;

struct TrxIo {
    tx: Vec<u8, SPIM_TX_BUF_SIZE>,
    rx: Vec<u8, SPIM_RX_BUF_SIZE>,
    rx_capacity: usize,
    rx_type: Option<u8>,
    status: Option<SpimTrxStatus>,
}

/// One SPI transaction. Built once, wired to a select line and optionally
/// an owner task, then handed to [`SpimEngine::queue`] by `&'static`
/// reference. The same descriptor can be re-queued after it completes.
pub struct SpimTrx {
    ss: &'static dyn SelectLine,
    owner: Option<TaskRef>,
    llp: bool,
    tx_type: u8,
    rx_delay_budget: u8,
    flags: AtomicU8,
    io: Mutex<RefCell<TrxIo>>,
}

impl SpimTrx {
    /// Raw full-duplex exchange: clocks the payload out and keeps up to
    /// `rx_len` clocked-in bytes, padding with zeroes if the read side is
    /// longer than the write side.
    pub fn simple(
        ss: &'static dyn SelectLine,
        tx: &[u8],
        rx_len: usize,
        owner: Option<TaskRef>,
    ) -> Result<Self, SpimTrxError> {
        if rx_len > SPIM_RX_BUF_SIZE {
            return Err(SpimTrxError::RxTooLarge);
        }
        let tx = Vec::from_slice(tx).map_err(|_| SpimTrxError::TxTooLarge)?;
        Ok(Self {
            ss,
            owner,
            llp: false,
            tx_type: 0,
            rx_delay_budget: LLP_RX_POLL_LIMIT,
            flags: AtomicU8::new(0),
            io: Mutex::new(RefCell::new(TrxIo {
                tx,
                rx: Vec::new(),
                rx_capacity: rx_len,
                rx_type: None,
                status: None,
            })),
        })
    }

    /// Framed request with up to `rx_capacity` bytes of response payload.
    pub fn framed(
        ss: &'static dyn SelectLine,
        msg_type: u8,
        payload: &[u8],
        rx_capacity: usize,
        owner: Option<TaskRef>,
    ) -> Result<Self, SpimTrxError> {
        if rx_capacity > SPIM_RX_BUF_SIZE {
            return Err(SpimTrxError::RxTooLarge);
        }
        let tx = Vec::from_slice(payload).map_err(|_| SpimTrxError::TxTooLarge)?;
        Ok(Self {
            ss,
            owner,
            llp: true,
            tx_type: msg_type,
            rx_delay_budget: LLP_RX_POLL_LIMIT,
            flags: AtomicU8::new(0),
            io: Mutex::new(RefCell::new(TrxIo {
                tx,
                rx: Vec::new(),
                rx_capacity,
                rx_type: None,
                status: None,
            })),
        })
    }

    /// How many poll exchanges to grant the slave before giving up on a
    /// response. Slaves with slow handlers need more.
    pub fn with_rx_delay_budget(mut self, polls: u8) -> Self {
        self.rx_delay_budget = polls;
        self
    }

    pub fn is_queued(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_QUEUED != 0
    }

    pub fn is_in_transmission(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_IN_TRANSMISSION != 0
    }

    /// Outcome of the last completed run, if any.
    pub fn status(&self) -> Option<SpimTrxStatus> {
        critical_section::with(|cs| self.io.borrow_ref(cs).status)
    }

    /// Response type byte of the last framed run.
    pub fn rx_type(&self) -> Option<u8> {
        critical_section::with(|cs| self.io.borrow_ref(cs).rx_type)
    }

    /// Clocked-in bytes of the last run.
    pub fn rx(&self) -> Vec<u8, SPIM_RX_BUF_SIZE> {
        critical_section::with(|cs| self.io.borrow_ref(cs).rx.clone())
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Phase {
    Idle,
    Simple,
    SendSize,
    SendPayload,
    SendCrcHi,
    SendCrcLo,
    Poll,
    RecvSize,
    RecvPayload,
    RecvCrcHi,
    RecvCrcLo,
}

struct EngineInner {
    bus: Option<&'static dyn SpiMasterBus>,
    dispatcher: Option<&'static Dispatcher>,
    scheduler: Option<&'static Scheduler>,
    self_ref: Option<TaskRef>,
    queue: Deque<&'static SpimTrx, SPIM_TRX_QUEUE_SIZE>,
    phase: Phase,
    crc: Option<FrameCrc>,
    tx_idx: usize,
    poll_remaining: u8,
    rx_expected: u8,
    rx_crc_hi: u8,
}

/// Master-side engine; one per SPI peripheral.
pub struct SpimEngine {
    inner: Mutex<RefCell<EngineInner>>,
}

impl SpimEngine {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(EngineInner {
                bus: None,
                dispatcher: None,
                scheduler: None,
                self_ref: None,
                queue: Deque::new(),
                phase: Phase::Idle,
                crc: None,
                tx_idx: 0,
                poll_remaining: 0,
                rx_expected: 0,
                rx_crc_hi: 0,
            })),
        }
    }

    /// Wires the engine to its peripheral and registers it as a task.
    pub fn init(
        &'static self,
        bus: &'static dyn SpiMasterBus,
        dispatcher: &'static Dispatcher,
        scheduler: &'static Scheduler,
    ) -> Result<(), crate::types::RegisterError> {
        bus.configure();
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            inner.bus = Some(bus);
            inner.dispatcher = Some(dispatcher);
            inner.scheduler = Some(scheduler);
            inner.self_ref = Some(self as TaskRef);
        });
        dispatcher.register(self)
    }

    /// Appends a transaction. Transfers run strictly in queue order; a
    /// descriptor can only sit in the queue once at a time.
    pub fn queue(&self, trx: &'static SpimTrx) -> Result<(), SpimQueueError> {
        let prev = trx.flags.fetch_or(FLAG_QUEUED, Ordering::AcqRel);
        if prev & FLAG_QUEUED != 0 {
            return Err(SpimQueueError::AlreadyQueued);
        }
        critical_section::with(|cs| {
            {
                let mut io = trx.io.borrow_ref_mut(cs);
                io.rx.clear();
                io.rx_type = None;
                io.status = None;
            }
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.queue.push_back(trx).is_err() {
                trx.flags.fetch_and(!FLAG_QUEUED, Ordering::AcqRel);
                return Err(SpimQueueError::QueueFull);
            }
            if let (Some(dispatcher), Some(me)) = (inner.dispatcher, inner.self_ref) {
                let _ = dispatcher.post(me, Event::of(EventKind::TrxQueued));
            }
            Ok(())
        })
    }

    /// Transactions queued or in flight.
    pub fn backlog(&self) -> usize {
        critical_section::with(|cs| self.inner.borrow_ref(cs).queue.len())
    }

    fn pump(&self) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.phase != Phase::Idle {
                return;
            }
            let Some(trx) = inner.queue.front().copied() else {
                return;
            };
            let Some(bus) = inner.bus else { return };
            trx.flags.fetch_or(FLAG_IN_TRANSMISSION, Ordering::AcqRel);
            trx.ss.select();
            if trx.llp {
                bus.write_byte(trx.tx_type);
                let mut crc = FrameCrc::new();
                crc.update(trx.tx_type);
                inner.crc = Some(crc);
                inner.tx_idx = 0;
                inner.phase = Phase::SendSize;
                self.pace(cs, &mut inner, trx, LLP_TX_DELAY_TICKS);
            } else {
                let (first, total) = {
                    let io = trx.io.borrow_ref(cs);
                    (io.tx.first().copied(), io.tx.len().max(io.rx_capacity))
                };
                if total == 0 {
                    self.finish(cs, &mut inner, trx, SpimTrxStatus::CompletedSuccessfully);
                    return;
                }
                bus.write_byte(first.unwrap_or(0));
                inner.tx_idx = 1;
                inner.phase = Phase::Simple;
                self.pace(cs, &mut inner, trx, LLP_TX_DELAY_TICKS);
            }
        });
    }

    fn on_pacing(&self) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let Some(trx) = inner.queue.front().copied() else {
                return;
            };
            let Some(bus) = inner.bus else { return };
            // Byte clocked in by the previous write.
            let rx = bus.read_byte();

            match inner.phase {
                Phase::Idle => {}
                Phase::Simple => {
                    let (done, next) = {
                        let mut io = trx.io.borrow_ref_mut(cs);
                        if io.rx.len() < io.rx_capacity {
                            let _ = io.rx.push(rx);
                        }
                        let total = io.tx.len().max(io.rx_capacity);
                        (inner.tx_idx >= total, io.tx.get(inner.tx_idx).copied())
                    };
                    if done {
                        self.finish(cs, &mut inner, trx, SpimTrxStatus::CompletedSuccessfully);
                    } else {
                        bus.write_byte(next.unwrap_or(0));
                        inner.tx_idx += 1;
                        self.pace(cs, &mut inner, trx, LLP_TX_DELAY_TICKS);
                    }
                }
                Phase::SendSize => {
                    if self.abort_on_flow_error(cs, &mut inner, trx, rx) {
                        return;
                    }
                    let (size, empty) = {
                        let io = trx.io.borrow_ref(cs);
                        (io.tx.len() as u8, io.tx.is_empty())
                    };
                    bus.write_byte(size);
                    if let Some(crc) = inner.crc.as_mut() {
                        crc.update(size);
                    }
                    inner.phase = if empty {
                        Phase::SendCrcHi
                    } else {
                        Phase::SendPayload
                    };
                    self.pace(cs, &mut inner, trx, LLP_TX_DELAY_TICKS);
                }
                Phase::SendPayload => {
                    if self.abort_on_flow_error(cs, &mut inner, trx, rx) {
                        return;
                    }
                    let (byte, last) = {
                        let io = trx.io.borrow_ref(cs);
                        (io.tx[inner.tx_idx], inner.tx_idx + 1 == io.tx.len())
                    };
                    bus.write_byte(byte);
                    if let Some(crc) = inner.crc.as_mut() {
                        crc.update(byte);
                    }
                    inner.tx_idx += 1;
                    if last {
                        inner.phase = Phase::SendCrcHi;
                    }
                    self.pace(cs, &mut inner, trx, LLP_TX_DELAY_TICKS);
                }
                Phase::SendCrcHi => {
                    if self.abort_on_flow_error(cs, &mut inner, trx, rx) {
                        return;
                    }
                    let high = inner.crc.as_ref().map(|c| c.high()).unwrap_or(0);
                    bus.write_byte(high);
                    inner.phase = Phase::SendCrcLo;
                    self.pace(cs, &mut inner, trx, LLP_TX_DELAY_TICKS);
                }
                Phase::SendCrcLo => {
                    if self.abort_on_flow_error(cs, &mut inner, trx, rx) {
                        return;
                    }
                    let low = inner.crc.as_ref().map(|c| c.low()).unwrap_or(0);
                    bus.write_byte(low);
                    inner.poll_remaining = trx.rx_delay_budget;
                    inner.phase = Phase::Poll;
                    self.pace(cs, &mut inner, trx, LLP_RX_DELAY_TICKS);
                }
                Phase::Poll => {
                    if rx == TYPE_PREPARING_RESPONSE {
                        if inner.poll_remaining == 0 {
                            self.finish(cs, &mut inner, trx, SpimTrxStatus::NoResponse);
                        } else {
                            inner.poll_remaining -= 1;
                            bus.write_byte(0);
                            self.pace(cs, &mut inner, trx, LLP_RX_DELAY_TICKS);
                        }
                    } else if is_error_type(rx) {
                        self.finish(cs, &mut inner, trx, reported_error(rx));
                    } else {
                        trx.io.borrow_ref_mut(cs).rx_type = Some(rx);
                        let mut crc = FrameCrc::new();
                        crc.update(rx);
                        inner.crc = Some(crc);
                        bus.write_byte(0);
                        inner.phase = Phase::RecvSize;
                        self.pace(cs, &mut inner, trx, LLP_RX_DELAY_TICKS);
                    }
                }
                Phase::RecvSize => {
                    let capacity = trx.io.borrow_ref(cs).rx_capacity;
                    if rx as usize > capacity {
                        self.finish(cs, &mut inner, trx, SpimTrxStatus::ResponseTooLarge);
                        return;
                    }
                    if let Some(crc) = inner.crc.as_mut() {
                        crc.update(rx);
                    }
                    inner.rx_expected = rx;
                    inner.phase = if rx == 0 {
                        Phase::RecvCrcHi
                    } else {
                        Phase::RecvPayload
                    };
                    bus.write_byte(0);
                    self.pace(cs, &mut inner, trx, LLP_RX_DELAY_TICKS);
                }
                Phase::RecvPayload => {
                    let received = {
                        let mut io = trx.io.borrow_ref_mut(cs);
                        let _ = io.rx.push(rx);
                        io.rx.len()
                    };
                    if let Some(crc) = inner.crc.as_mut() {
                        crc.update(rx);
                    }
                    if received == inner.rx_expected as usize {
                        inner.phase = Phase::RecvCrcHi;
                    }
                    bus.write_byte(0);
                    self.pace(cs, &mut inner, trx, LLP_RX_DELAY_TICKS);
                }
                Phase::RecvCrcHi => {
                    inner.rx_crc_hi = rx;
                    inner.phase = Phase::RecvCrcLo;
                    bus.write_byte(0);
                    self.pace(cs, &mut inner, trx, LLP_RX_DELAY_TICKS);
                }
                Phase::RecvCrcLo => {
                    let received = u16::from(inner.rx_crc_hi) << 8 | u16::from(rx);
                    let expected = inner.crc.as_ref().map(|c| c.value());
                    let status = if expected == Some(received) {
                        SpimTrxStatus::CompletedSuccessfully
                    } else {
                        SpimTrxStatus::ResponseCrcFailure
                    };
                    self.finish(cs, &mut inner, trx, status);
                }
            }
        });
    }

    /// During transmission a reserved-range byte clocked back means the
    /// slave rejected the frame; stop sending the rest of it.
    fn abort_on_flow_error(
        &self,
        cs: critical_section::CriticalSection,
        inner: &mut EngineInner,
        trx: &'static SpimTrx,
        rx: u8,
    ) -> bool {
        if is_error_type(rx) {
            self.finish(cs, inner, trx, reported_error(rx));
            true
        } else {
            false
        }
    }

    fn pace(
        &self,
        cs: critical_section::CriticalSection,
        inner: &mut EngineInner,
        trx: &'static SpimTrx,
        delay: Ticks,
    ) {
        let scheduled = match (inner.scheduler, inner.self_ref) {
            (Some(scheduler), Some(me)) => scheduler
                .schedule(delay, me, Event::of(EventKind::SpimPacing))
                .is_ok(),
            _ => false,
        };
        if !scheduled {
            #[cfg(feature = "defmt")]
            defmt::warn!("spim: pacing slot unavailable, aborting transfer");
            self.finish(cs, inner, trx, SpimTrxStatus::NoResponse);
        }
    }

    fn finish(
        &self,
        cs: critical_section::CriticalSection,
        inner: &mut EngineInner,
        trx: &'static SpimTrx,
        status: SpimTrxStatus,
    ) {
        trx.io.borrow_ref_mut(cs).status = Some(status);
        trx.ss.deselect();
        trx.flags
            .fetch_and(!(FLAG_QUEUED | FLAG_IN_TRANSMISSION), Ordering::AcqRel);
        let _ = inner.queue.pop_front();
        inner.phase = Phase::Idle;
        inner.crc = None;
        if let Some(dispatcher) = inner.dispatcher {
            if let Some(owner) = trx.owner {
                let _ = dispatcher.post(owner, Event::of(EventKind::SpimTrxDone(status)));
            }
            if let (false, Some(me)) = (inner.queue.is_empty(), inner.self_ref) {
                if dispatcher.post(me, Event::of(EventKind::TrxQueued)).is_err() {
                    // Event queue momentarily full; wake via a deadline so
                    // the remaining transactions do not stall.
                    let rearmed = inner
                        .scheduler
                        .map(|s| s.schedule(1, me, Event::of(EventKind::TrxQueued)).is_ok())
                        .unwrap_or(false);
                    if !rearmed {
                        #[cfg(feature = "defmt")]
                        defmt::warn!("spim: wake dropped, backlog resumes on next queue()");
                    }
                }
            }
        }
    }
}

impl Default for SpimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for SpimEngine {
    fn resume(&self, event: Event) {
        match event.kind {
            EventKind::TrxQueued => self.pump(),
            EventKind::SpimPacing => self.on_pacing(),
            _ => {}
        }
    }
}

fn reported_error(byte: u8) -> SpimTrxStatus {
    match byte {
        TYPE_ERR_CRC_FAILURE => SpimTrxStatus::CrcFailure,
        TYPE_ERR_MESSAGE_TOO_LARGE => SpimTrxStatus::MessageTooLarge,
        TYPE_ERR_SLAVE_NOT_READY => SpimTrxStatus::SlaveNotReady,
        _ => SpimTrxStatus::SlaveResponseInvalid,
    }
}
