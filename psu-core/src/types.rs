//! Core data types shared across the kernel and the SPI link layer.

/// Scheduler time, derived from a free-running hardware counter.
///
/// Ticks wrap around; all comparisons on them must use modular arithmetic.
pub type Ticks = u16;

/// Opaque word-sized event payload.
///
/// The interpretation is event-kind specific. The payload never transfers
/// ownership; when it refers to a structure, the producer guarantees the
/// structure outlives the event.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventData(pub usize);

impl EventData {
    /// Payload for events that carry no data.
    pub const NONE: EventData = EventData(0);
}

/// Discriminates what an event means to the receiving task.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventKind {
    /// Delivered once, right after a task is registered.
    Init,
    /// A transaction was appended to the SPI master queue.
    TrxQueued,
    /// An inter-byte delay of the master engine elapsed.
    SpimPacing,
    /// A master transaction finished, successfully or not.
    SpimTrxDone(SpimTrxStatus),
    /// The slave engine received a complete, valid message.
    SpisMessageReceived,
    /// The slave engine finished clocking out a response.
    SpisResponseTransmitted,
    /// A slave transfer ended before the response completed.
    SpisResponseError,
    /// Application-defined event.
    App(u8),
}

/// A notification delivered at most once to exactly one task.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Event {
    pub kind: EventKind,
    pub data: EventData,
}

impl Event {
    pub const fn new(kind: EventKind, data: EventData) -> Self {
        Self { kind, data }
    }

    /// An event without payload.
    pub const fn of(kind: EventKind) -> Self {
        Self::new(kind, EventData::NONE)
    }
}

/// Outcome of a single `run_one` invocation, for power-management callers.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RunStatus {
    /// One event was delivered or one ready deadline executed.
    Executed,
    /// There was nothing to do.
    Idle,
}

/// Failure to append to the bounded event queue.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PostError {
    QueueFull,
}

/// Failure to register a task with the dispatcher.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegisterError {
    AlreadyRegistered,
    TooManyTasks,
}

/// Failure to unregister a task from the dispatcher.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UnregisterError {
    NotRegistered,
}

/// Failure to allocate a deadline node.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SchedError {
    QueueFull,
}

/// Rejected master transaction parameters.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpimTrxError {
    /// Transmit data does not fit the transaction buffer.
    TxTooLarge,
    /// Requested receive capacity exceeds the transaction buffer.
    RxTooLarge,
}

/// Failure to enqueue a master transaction.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpimQueueError {
    /// The transaction is already queued or in transmission.
    AlreadyQueued,
    /// The transaction queue is at capacity.
    QueueFull,
}

/// Final status of a master transaction, delivered to the owner task.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpimTrxStatus {
    CompletedSuccessfully,
    /// The slave rejected the request because its CRC check failed.
    CrcFailure,
    /// The request did not fit the slave's receive buffer.
    MessageTooLarge,
    /// The slave was not ready to accept a transfer.
    SlaveNotReady,
    /// The slave reported an invalid or unclassified error.
    SlaveResponseInvalid,
    /// The slave never produced a response within the poll budget.
    NoResponse,
    /// The response did not fit the caller-provided receive capacity.
    ResponseTooLarge,
    /// The response trailer did not match the received bytes.
    ResponseCrcFailure,
}

/// Failure of the slave-side response API.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpisSendError {
    /// No transfer is waiting for a response.
    NoTrxInProgress,
    /// The response type falls in the reserved error range.
    InvalidType,
    /// The payload does not fit the response buffer.
    PayloadTooLarge,
}
