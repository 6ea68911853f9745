//! Hardware abstraction seams.
//!
//! The core never touches registers. Each peripheral the engines need is a
//! narrow trait, implemented once per board in the firmware crate and once
//! as a mock for host tests. Traits are object safe; the engines hold
//! `&'static dyn` references so wiring happens at init without generics
//! leaking through the whole crate.

use core::cell::RefCell;

use critical_section::Mutex;
use embedded_hal::digital::OutputPin;

/// Free-running 8-bit tick timer with a compare interrupt.
///
/// The counter wraps at 0xFF. The scheduler programs `set_compare` and the
/// board arranges for the compare-match interrupt to call
/// [`Scheduler::on_timer_interrupt`](crate::sched::Scheduler::on_timer_interrupt).
pub trait TickTimer: Sync {
    fn counter(&self) -> u8;
    fn compare(&self) -> u8;
    fn set_compare(&self, value: u8);
}

/// Active-low slave-select line, one per attached slave.
pub trait SelectLine: Sync {
    fn select(&self);
    fn deselect(&self);
}

/// SPI master shift register.
///
/// `write_byte` starts clocking a byte out; `read_byte` returns the byte
/// clocked in by the previous write. Pacing between the two is the master
/// engine's job, not the bus's.
pub trait SpiMasterBus: Sync {
    fn configure(&self);
    fn write_byte(&self, byte: u8);
    fn read_byte(&self) -> u8;
}

/// SPI slave data register, driven entirely from interrupt context.
///
/// `write_data` preloads the byte the next master clock cycle will read
/// out; `read_data` fetches the byte the master just clocked in.
pub trait SpiSlaveBus: Sync {
    fn configure(&self);
    fn read_data(&self) -> u8;
    fn write_data(&self, byte: u8);
    fn clear_flags(&self);
}

/// Adapts any `embedded-hal` output pin to a [`SelectLine`].
///
/// Pin errors are infallible on the targets this runs on; others are
/// ignored since a select line has no error path to report into.
pub struct EmbeddedHalSelect<P: OutputPin + Send> {
    pin: Mutex<RefCell<P>>,
}

impl<P: OutputPin + Send> EmbeddedHalSelect<P> {
    pub const fn new(pin: P) -> Self {
        Self {
            pin: Mutex::new(RefCell::new(pin)),
        }
    }
}

impl<P: OutputPin + Send> SelectLine for EmbeddedHalSelect<P> {
    fn select(&self) {
        critical_section::with(|cs| {
            let _ = self.pin.borrow_ref_mut(cs).set_low();
        });
    }

    fn deselect(&self) {
        critical_section::with(|cs| {
            let _ = self.pin.borrow_ref_mut(cs).set_high();
        });
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    //! Host-side peripheral doubles.
    //!
    //! The mocks simulate full-duplex SPI: the master mock can be looped
    //! back onto a slave engine so a byte written by the master latches the
    //! slave's preloaded data register as the master's read value, then
    //! fires the slave's receive interrupt, all synchronously.

    use core::cell::{Cell, RefCell};
    use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

    use critical_section::Mutex;
    use heapless::{Deque, Vec};

    use super::{SelectLine, SpiMasterBus, SpiSlaveBus, TickTimer};
    use crate::link::TYPE_PREPARING_RESPONSE;
    use crate::spi_slave::SpisEngine;

    /// Manually stepped 8-bit timer.
    pub struct MockTickTimer {
        counter: AtomicU8,
        compare: AtomicU8,
        tick_on_read: AtomicBool,
    }

    impl MockTickTimer {
        pub const fn new() -> Self {
            Self {
                counter: AtomicU8::new(0),
                compare: AtomicU8::new(0),
                tick_on_read: AtomicBool::new(false),
            }
        }

        /// Advances the counter one tick; true on compare match.
        pub fn step(&self) -> bool {
            let next = self.counter.load(Ordering::Relaxed).wrapping_add(1);
            self.counter.store(next, Ordering::Relaxed);
            next == self.compare.load(Ordering::Relaxed)
        }

        /// Models a counter that keeps running while code executes: every
        /// read advances it one tick before returning.
        pub fn tick_on_read(&self, enabled: bool) {
            self.tick_on_read.store(enabled, Ordering::Relaxed);
        }
    }

    impl Default for MockTickTimer {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TickTimer for MockTickTimer {
        fn counter(&self) -> u8 {
            if self.tick_on_read.load(Ordering::Relaxed) {
                self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
            } else {
                self.counter.load(Ordering::Relaxed)
            }
        }

        fn compare(&self) -> u8 {
            self.compare.load(Ordering::Relaxed)
        }

        fn set_compare(&self, value: u8) {
            self.compare.store(value, Ordering::Relaxed);
        }
    }

    /// Select line that can forward edges to a slave engine, the way a
    /// pin-change interrupt would on hardware.
    pub struct MockSelectLine {
        selected: AtomicBool,
        slave: Mutex<Cell<Option<&'static SpisEngine>>>,
    }

    impl MockSelectLine {
        pub const fn new() -> Self {
            Self {
                selected: AtomicBool::new(false),
                slave: Mutex::new(Cell::new(None)),
            }
        }

        pub fn wire_slave(&self, slave: &'static SpisEngine) {
            critical_section::with(|cs| self.slave.borrow(cs).set(Some(slave)));
        }

        pub fn is_selected(&self) -> bool {
            self.selected.load(Ordering::Relaxed)
        }

        fn edge(&self, selected: bool) {
            self.selected.store(selected, Ordering::Relaxed);
            let slave = critical_section::with(|cs| self.slave.borrow(cs).get());
            if let Some(slave) = slave {
                slave.on_select_changed(selected);
            }
        }
    }

    impl Default for MockSelectLine {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SelectLine for MockSelectLine {
        fn select(&self) {
            self.edge(true);
        }

        fn deselect(&self) {
            self.edge(false);
        }
    }

    /// Slave-side data register pair.
    pub struct MockSlaveBus {
        /// Byte preloaded for the master to clock out next.
        data_reg: AtomicU8,
        /// Byte most recently clocked in from the master.
        rx_reg: AtomicU8,
    }

    impl MockSlaveBus {
        pub const fn new() -> Self {
            Self {
                data_reg: AtomicU8::new(0),
                rx_reg: AtomicU8::new(0),
            }
        }

        /// Clocks one full-duplex byte through the slave: returns the
        /// preloaded response byte and delivers `byte` to the engine's
        /// receive interrupt.
        pub fn exchange(&self, engine: &SpisEngine, byte: u8) -> u8 {
            let out = self.data_reg.load(Ordering::Relaxed);
            self.rx_reg.store(byte, Ordering::Relaxed);
            engine.on_byte_received();
            out
        }

        pub fn preloaded(&self) -> u8 {
            self.data_reg.load(Ordering::Relaxed)
        }
    }

    impl Default for MockSlaveBus {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SpiSlaveBus for MockSlaveBus {
        fn configure(&self) {}

        fn read_data(&self) -> u8 {
            self.rx_reg.load(Ordering::Relaxed)
        }

        fn write_data(&self, byte: u8) {
            self.data_reg.store(byte, Ordering::Relaxed);
        }

        fn clear_flags(&self) {}
    }

    struct MasterState {
        loopback: Option<(&'static SpisEngine, &'static MockSlaveBus)>,
        scripted: Deque<u8, 64>,
        written: Vec<u8, 128>,
        last_rx: u8,
        corrupt_at: Option<usize>,
    }

    /// Master shift register, either looped back onto a slave engine or
    /// replaying a scripted byte sequence.
    pub struct MockMasterBus {
        state: Mutex<RefCell<MasterState>>,
    }

    impl MockMasterBus {
        pub const fn new() -> Self {
            Self {
                state: Mutex::new(RefCell::new(MasterState {
                    loopback: None,
                    scripted: Deque::new(),
                    written: Vec::new(),
                    last_rx: 0,
                    corrupt_at: None,
                })),
            }
        }

        pub fn wire_loopback(&self, slave: &'static SpisEngine, bus: &'static MockSlaveBus) {
            critical_section::with(|cs| {
                self.state.borrow_ref_mut(cs).loopback = Some((slave, bus));
            });
        }

        /// Queues bytes the master will read when no loopback is wired.
        pub fn script(&self, bytes: &[u8]) {
            critical_section::with(|cs| {
                let mut state = self.state.borrow_ref_mut(cs);
                for &b in bytes {
                    let _ = state.scripted.push_back(b);
                }
            });
        }

        /// Flips all bits of the nth byte the master writes, counted from
        /// transfer start. Models a glitched wire.
        pub fn corrupt_write_at(&self, index: usize) {
            critical_section::with(|cs| {
                self.state.borrow_ref_mut(cs).corrupt_at = Some(index);
            });
        }

        /// Every byte written since construction, post-corruption.
        pub fn written(&self) -> Vec<u8, 128> {
            critical_section::with(|cs| self.state.borrow_ref(cs).written.clone())
        }
    }

    impl Default for MockMasterBus {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SpiMasterBus for MockMasterBus {
        fn configure(&self) {}

        fn write_byte(&self, byte: u8) {
            // Latch the slave response first, then deliver the corrupted
            // byte by the receive interrupt; both halves of the exchange
            // happen in the same clock burst on hardware.
            let (byte, loopback) = critical_section::with(|cs| {
                let mut state = self.state.borrow_ref_mut(cs);
                let mut byte = byte;
                if state.corrupt_at == Some(state.written.len()) {
                    byte ^= 0xFF;
                }
                let _ = state.written.push(byte);
                (byte, state.loopback)
            });
            let rx = match loopback {
                Some((engine, bus)) => bus.exchange(engine, byte),
                None => critical_section::with(|cs| {
                    self.state
                        .borrow_ref_mut(cs)
                        .scripted
                        .pop_front()
                        .unwrap_or(TYPE_PREPARING_RESPONSE)
                }),
            };
            critical_section::with(|cs| self.state.borrow_ref_mut(cs).last_rx = rx);
        }

        fn read_byte(&self) -> u8 {
            critical_section::with(|cs| self.state.borrow_ref(cs).last_rx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;

    #[test]
    fn mock_timer_steps_to_compare() {
        let timer = MockTickTimer::new();
        timer.set_compare(3);
        assert!(!timer.step());
        assert!(!timer.step());
        assert!(timer.step());
        assert_eq!(timer.counter(), 3);
    }

    #[test]
    fn mock_timer_wraps() {
        let timer = MockTickTimer::new();
        timer.set_compare(1);
        for _ in 0..256 {
            timer.step();
        }
        assert_eq!(timer.counter(), 0);
        assert!(timer.step());
    }

    #[test]
    fn scripted_master_replays_then_idles() {
        let bus = MockMasterBus::new();
        bus.script(&[0x11, 0x22]);
        bus.write_byte(0x00);
        assert_eq!(bus.read_byte(), 0x11);
        bus.write_byte(0x00);
        assert_eq!(bus.read_byte(), 0x22);
        bus.write_byte(0x00);
        assert_eq!(bus.read_byte(), crate::link::TYPE_PREPARING_RESPONSE);
    }

    #[test]
    fn corrupt_write_flips_selected_byte() {
        let bus = MockMasterBus::new();
        bus.corrupt_write_at(1);
        bus.write_byte(0xAA);
        bus.write_byte(0xAA);
        bus.write_byte(0xAA);
        assert_eq!(bus.written().as_slice(), [0xAA, 0x55, 0xAA]);
    }
}
