//! Compile-time configuration for the PSU core.
//!
//! Everything here is a build-time constant so that all storage can be
//! statically allocated. The defaults match a small 8-bit target with a
//! single SPI peripheral and an 8-bit tick timer.

use crate::types::Ticks;

/// Capacity of the dispatcher's pending-event ring. Should be a power of 2.
pub const EVENT_QUEUE_SIZE: usize = 16;

/// Maximum number of tasks that can be registered with the dispatcher.
pub const TASKS_MAX: usize = 8;

/// Number of deadline-node slots in the scheduler pool.
pub const SCHED_TASKS_MAX: usize = 8;

/// Longest interval, in ticks, the 8-bit compare timer can be programmed for.
pub const TIMER_INTERVAL_MAX: u8 = 0xFF;

/// Capacity of the SPI master transaction queue.
pub const SPIM_TRX_QUEUE_SIZE: usize = 4;

/// Size of a master transaction's transmit buffer.
pub const SPIM_TX_BUF_SIZE: usize = 64;

/// Size of a master transaction's receive buffer.
pub const SPIM_RX_BUF_SIZE: usize = 64;

/// Size of the slave engine's receive buffer. Must fit in a `u8`.
pub const SPIS_RX_BUF_SIZE: usize = 32;

/// Size of the slave engine's response buffer. Must fit in a `u8`.
pub const SPIS_TX_BUF_SIZE: usize = 32;

/// Minimum delay between transmitted link-layer bytes, in ticks.
pub const LLP_TX_DELAY_TICKS: Ticks = 1;

/// Delay between response poll bytes, in ticks.
pub const LLP_RX_DELAY_TICKS: Ticks = 2;

/// Default number of poll attempts before a transfer is abandoned with
/// `NoResponse`.
pub const LLP_RX_POLL_LIMIT: u8 = 15;
