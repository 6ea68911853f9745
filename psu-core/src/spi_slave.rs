//! SPI slave transaction engine.
//!
//! The slave never initiates anything; it runs entirely from two interrupt
//! entry points, one per received byte and one per select-line edge. The
//! data register is always preloaded with the byte the master's next clock
//! burst will shift out, so each received byte doubles as the trigger for
//! staging the following response byte.
//!
//! While no response is staged the preload is the reserved "preparing"
//! marker; the master polls until something else appears. A frame the
//! slave cannot accept flips the preload to the matching reserved error
//! code, which is then re-staged for every remaining byte of the transfer
//! so the master sees it no matter when it samples.

use core::cell::RefCell;

use critical_section::Mutex;
use heapless::Vec;

use crate::config::{SPIS_RX_BUF_SIZE, SPIS_TX_BUF_SIZE};
use crate::hal::SpiSlaveBus;
use crate::link::{
    is_reserved_type, FrameCrc, TYPE_ERR_CRC_FAILURE, TYPE_ERR_MESSAGE_TOO_LARGE,
    TYPE_ERR_SLAVE_NOT_READY, TYPE_ERR_SLAVE_RESPONSE_INVALID, TYPE_PREPARING_RESPONSE,
};
use crate::process::{Dispatcher, TaskRef};
use crate::types::{Event, EventKind, SpisSendError};

/// Where the slave is within a transfer.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpisState {
    /// Selected or idle, next byte starts a frame.
    Ready,
    ReceivingSize,
    ReceivingPayload,
    ReceivingFooter0,
    ReceivingFooter1,
    /// Frame accepted, response not yet staged by the owner.
    WaitingForCallback,
    SendResponseSize,
    SendResponsePayload,
    SendFooter0,
    SendFooter1,
    /// Last response byte staged, one more exchange clocks it out.
    Completed,
    /// Transfer is a lost cause; re-stage `error_code` until deselect.
    WaitingForTransferToEnd,
    /// Master deselected while the owner still owed a response.
    AbortedWhileWaitingForCallback,
}

struct SlaveInner {
    bus: Option<&'static dyn SpiSlaveBus>,
    dispatcher: Option<&'static Dispatcher>,
    owner: Option<TaskRef>,
    state: SpisState,
    rx_type: u8,
    rx: Vec<u8, SPIS_RX_BUF_SIZE>,
    rx_declared: u8,
    rx_crc_hi: u8,
    crc: Option<FrameCrc>,
    tx: Vec<u8, SPIS_TX_BUF_SIZE>,
    tx_sent: usize,
    error_code: u8,
    transfer_in_progress: bool,
}

impl SlaveInner {
    fn post(&self, kind: EventKind) {
        if let (Some(dispatcher), Some(owner)) = (self.dispatcher, self.owner) {
            if dispatcher.post(owner, Event::of(kind)).is_err() {
                #[cfg(feature = "defmt")]
                defmt::warn!("spis: owner event dropped, queue full");
            }
        }
    }

    fn end_transfer(&mut self, bus: &dyn SpiSlaveBus, code: u8) {
        self.error_code = code;
        bus.write_data(code);
        self.state = SpisState::WaitingForTransferToEnd;
    }
}

/// Slave-side engine; one per SPI peripheral.
pub struct SpisEngine {
    inner: Mutex<RefCell<SlaveInner>>,
}

impl SpisEngine {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(SlaveInner {
                bus: None,
                dispatcher: None,
                owner: None,
                state: SpisState::Ready,
                rx_type: 0,
                rx: Vec::new(),
                rx_declared: 0,
                rx_crc_hi: 0,
                crc: None,
                tx: Vec::new(),
                tx_sent: 0,
                error_code: 0,
                transfer_in_progress: false,
            })),
        }
    }

    /// Wires the engine to its peripheral and the task that handles
    /// received frames. Stages the "preparing" marker so the first
    /// exchange of a transfer never clocks out garbage.
    pub fn init(
        &self,
        bus: &'static dyn SpiSlaveBus,
        dispatcher: &'static Dispatcher,
        owner: TaskRef,
    ) {
        bus.configure();
        bus.write_data(TYPE_PREPARING_RESPONSE);
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            inner.bus = Some(bus);
            inner.dispatcher = Some(dispatcher);
            inner.owner = Some(owner);
        });
    }

    /// Receive-interrupt body; call for every byte clocked in.
    pub fn on_byte_received(&self) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let Some(bus) = inner.bus else { return };
            let byte = bus.read_data();

            match inner.state {
                SpisState::Ready => {
                    inner.rx_type = byte;
                    inner.rx.clear();
                    let mut crc = FrameCrc::new();
                    crc.update(byte);
                    inner.crc = Some(crc);
                    inner.state = SpisState::ReceivingSize;
                    bus.write_data(TYPE_PREPARING_RESPONSE);
                }
                SpisState::ReceivingSize => {
                    if byte as usize > SPIS_RX_BUF_SIZE {
                        inner.end_transfer(bus, TYPE_ERR_MESSAGE_TOO_LARGE);
                    } else {
                        inner.rx_declared = byte;
                        if let Some(crc) = inner.crc.as_mut() {
                            crc.update(byte);
                        }
                        inner.state = if byte == 0 {
                            SpisState::ReceivingFooter0
                        } else {
                            SpisState::ReceivingPayload
                        };
                        bus.write_data(TYPE_PREPARING_RESPONSE);
                    }
                }
                SpisState::ReceivingPayload => {
                    let _ = inner.rx.push(byte);
                    if let Some(crc) = inner.crc.as_mut() {
                        crc.update(byte);
                    }
                    if inner.rx.len() == inner.rx_declared as usize {
                        inner.state = SpisState::ReceivingFooter0;
                    }
                    bus.write_data(TYPE_PREPARING_RESPONSE);
                }
                SpisState::ReceivingFooter0 => {
                    inner.rx_crc_hi = byte;
                    inner.state = SpisState::ReceivingFooter1;
                    bus.write_data(TYPE_PREPARING_RESPONSE);
                }
                SpisState::ReceivingFooter1 => {
                    let received = u16::from(inner.rx_crc_hi) << 8 | u16::from(byte);
                    let expected = inner.crc.as_ref().map(|c| c.value());
                    if expected == Some(received) {
                        inner.state = SpisState::WaitingForCallback;
                        bus.write_data(TYPE_PREPARING_RESPONSE);
                        inner.post(EventKind::SpisMessageReceived);
                    } else {
                        inner.end_transfer(bus, TYPE_ERR_CRC_FAILURE);
                    }
                }
                SpisState::WaitingForCallback => {
                    // Master is polling; keep it waiting.
                    bus.write_data(TYPE_PREPARING_RESPONSE);
                }
                SpisState::SendResponseSize => {
                    let size = inner.tx.len() as u8;
                    bus.write_data(size);
                    if let Some(crc) = inner.crc.as_mut() {
                        crc.update(size);
                    }
                    inner.tx_sent = 0;
                    inner.state = if inner.tx.is_empty() {
                        SpisState::SendFooter0
                    } else {
                        SpisState::SendResponsePayload
                    };
                }
                SpisState::SendResponsePayload => {
                    let staged = inner.tx[inner.tx_sent];
                    bus.write_data(staged);
                    if let Some(crc) = inner.crc.as_mut() {
                        crc.update(staged);
                    }
                    inner.tx_sent += 1;
                    if inner.tx_sent == inner.tx.len() {
                        inner.state = SpisState::SendFooter0;
                    }
                }
                SpisState::SendFooter0 => {
                    let high = inner.crc.as_ref().map(|c| c.high()).unwrap_or(0);
                    bus.write_data(high);
                    inner.state = SpisState::SendFooter1;
                }
                SpisState::SendFooter1 => {
                    let low = inner.crc.as_ref().map(|c| c.low()).unwrap_or(0);
                    bus.write_data(low);
                    inner.state = SpisState::Completed;
                }
                SpisState::Completed => {
                    // The exchange that delivered this byte clocked the
                    // footer out; the response is on the wire.
                    bus.write_data(TYPE_PREPARING_RESPONSE);
                    inner.error_code = TYPE_PREPARING_RESPONSE;
                    inner.state = SpisState::WaitingForTransferToEnd;
                    inner.post(EventKind::SpisResponseTransmitted);
                }
                SpisState::WaitingForTransferToEnd => {
                    let code = inner.error_code;
                    bus.write_data(code);
                }
                SpisState::AbortedWhileWaitingForCallback => {
                    bus.write_data(TYPE_ERR_SLAVE_NOT_READY);
                }
            }
            bus.clear_flags();
        });
    }

    /// Select-edge interrupt body.
    pub fn on_select_changed(&self, selected: bool) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let Some(bus) = inner.bus else { return };
            inner.transfer_in_progress = selected;

            if selected {
                if inner.state == SpisState::AbortedWhileWaitingForCallback {
                    // Still owe a callback from the aborted transfer; the
                    // new one gets a not-ready answer.
                    bus.write_data(TYPE_ERR_SLAVE_NOT_READY);
                } else {
                    inner.state = SpisState::Ready;
                    inner.rx.clear();
                    inner.crc = None;
                    bus.write_data(TYPE_PREPARING_RESPONSE);
                }
            } else {
                match inner.state {
                    SpisState::WaitingForCallback => {
                        inner.error_code = TYPE_ERR_SLAVE_NOT_READY;
                        bus.write_data(TYPE_ERR_SLAVE_NOT_READY);
                        inner.state = SpisState::AbortedWhileWaitingForCallback;
                        inner.post(EventKind::SpisResponseError);
                    }
                    SpisState::SendResponseSize
                    | SpisState::SendResponsePayload
                    | SpisState::SendFooter0
                    | SpisState::SendFooter1
                    | SpisState::Completed => {
                        // Master walked away mid-response.
                        inner.state = SpisState::Ready;
                        bus.write_data(TYPE_PREPARING_RESPONSE);
                        inner.post(EventKind::SpisResponseError);
                    }
                    SpisState::AbortedWhileWaitingForCallback => {}
                    _ => {
                        inner.state = SpisState::Ready;
                        bus.write_data(TYPE_PREPARING_RESPONSE);
                    }
                }
            }
            bus.clear_flags();
        });
    }

    /// Stages the response to the frame currently waiting on a callback.
    ///
    /// Must be called exactly once per `SpisMessageReceived` event, from
    /// task context. A call after the master already gave up clears the
    /// stale obligation and reports `NoTrxInProgress`.
    pub fn send_response(&self, msg_type: u8, payload: &[u8]) -> Result<(), SpisSendError> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let Some(bus) = inner.bus else {
                return Err(SpisSendError::NoTrxInProgress);
            };

            if inner.state != SpisState::WaitingForCallback {
                if inner.state == SpisState::AbortedWhileWaitingForCallback {
                    if inner.transfer_in_progress {
                        // A new transfer is underway and already being
                        // answered not-ready; let it run out.
                        inner.error_code = TYPE_ERR_SLAVE_NOT_READY;
                        inner.state = SpisState::WaitingForTransferToEnd;
                    } else {
                        inner.state = SpisState::Ready;
                        bus.write_data(TYPE_PREPARING_RESPONSE);
                    }
                    bus.clear_flags();
                }
                return Err(SpisSendError::NoTrxInProgress);
            }

            if is_reserved_type(msg_type) {
                inner.end_transfer(bus, TYPE_ERR_SLAVE_RESPONSE_INVALID);
                return Err(SpisSendError::InvalidType);
            }
            let Ok(tx) = Vec::from_slice(payload) else {
                inner.end_transfer(bus, TYPE_ERR_SLAVE_RESPONSE_INVALID);
                return Err(SpisSendError::PayloadTooLarge);
            };

            inner.tx = tx;
            inner.tx_sent = 0;
            let mut crc = FrameCrc::new();
            crc.update(msg_type);
            inner.crc = Some(crc);
            bus.write_data(msg_type);
            inner.state = SpisState::SendResponseSize;
            bus.clear_flags();
            Ok(())
        })
    }

    pub fn state(&self) -> SpisState {
        critical_section::with(|cs| self.inner.borrow_ref(cs).state)
    }

    /// Type byte of the frame currently held for the owner.
    pub fn rx_type(&self) -> u8 {
        critical_section::with(|cs| self.inner.borrow_ref(cs).rx_type)
    }

    /// Payload of the frame currently held for the owner.
    pub fn rx(&self) -> Vec<u8, SPIS_RX_BUF_SIZE> {
        critical_section::with(|cs| self.inner.borrow_ref(cs).rx.clone())
    }
}

impl Default for SpisEngine {
    fn default() -> Self {
        Self::new()
    }
}
