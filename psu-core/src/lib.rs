//! Event-driven firmware core for a bench power-supply family.
//!
//! The crate provides the pieces the boards share: a cooperative task
//! dispatcher ([`process`]), a deadline scheduler driven by an 8-bit
//! compare timer ([`sched`]), and master/slave engines for the framed SPI
//! link between the main unit and its channel boards ([`spi_master`],
//! [`spi_slave`], [`link`]).
//!
//! Everything is allocation-free and interrupt-safe: services are
//! const-constructible so they can live in statics, and shared state sits
//! behind `critical_section::Mutex`. With the `std` feature (pulled in by
//! `test-utils`) the whole core runs on a host, with mock peripherals
//! standing in for the hardware.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod config;
pub mod hal;
pub mod link;
pub mod process;
pub mod sched;
pub mod spi_master;
pub mod spi_slave;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use process::{Dispatcher, Task, TaskRef};
pub use sched::Scheduler;
pub use spi_master::{SpimEngine, SpimTrx};
pub use spi_slave::{SpisEngine, SpisState};
pub use types::{
    Event, EventData, EventKind, PostError, RegisterError, RunStatus, SchedError, SpimQueueError,
    SpimTrxError, SpimTrxStatus, SpisSendError, Ticks, UnregisterError,
};

/// One pass of the foreground loop: a posted event takes priority over an
/// expired deadline so interrupt-side work drains first.
pub fn run_once(dispatcher: &Dispatcher, scheduler: &Scheduler) -> RunStatus {
    if dispatcher.run_one() == RunStatus::Executed {
        return RunStatus::Executed;
    }
    scheduler.run_one()
}
