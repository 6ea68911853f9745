//! Link-layer protocol (LLP) wire constants shared by both SPI engines.
//!
//! A frame is `[type][size][payload...][crc_hi][crc_lo]` with the CRC-16
//! computed over type, size and payload. Requests and responses use the
//! same framing. Type values in the reserved high range never appear in
//! application messages; they carry error reports and the "response not
//! ready yet" sentinel.

use crc16::{State, CCITT_FALSE};

/// Lowest reserved type value. Everything at or above is protocol-internal.
pub const ERR_TYPE_MIN: u8 = 0xF0;

/// The receiver's CRC check failed.
pub const TYPE_ERR_CRC_FAILURE: u8 = 0xF0;

/// The declared message size exceeds the receiver's buffer.
pub const TYPE_ERR_MESSAGE_TOO_LARGE: u8 = 0xF1;

/// The slave could not accept a transfer.
pub const TYPE_ERR_SLAVE_NOT_READY: u8 = 0xF2;

/// The slave application produced an unusable response.
pub const TYPE_ERR_SLAVE_RESPONSE_INVALID: u8 = 0xF3;

/// Sentinel: the slave is still preparing its response, keep polling.
pub const TYPE_PREPARING_RESPONSE: u8 = 0xFF;

/// True for reserved error-report types. The preparing sentinel is reserved
/// but is not an error.
pub const fn is_error_type(value: u8) -> bool {
    value >= ERR_TYPE_MIN && value != TYPE_PREPARING_RESPONSE
}

/// True for any reserved type, errors and sentinel alike. Application
/// message types must stay below this range.
pub const fn is_reserved_type(value: u8) -> bool {
    value >= ERR_TYPE_MIN
}

/// Running CRC-16 over frame header and payload bytes.
///
/// Wraps the CRC-16/CCITT-FALSE state so both engines agree on the variant.
pub struct FrameCrc(State<CCITT_FALSE>);

impl FrameCrc {
    pub fn new() -> Self {
        Self(State::new())
    }

    pub fn update(&mut self, byte: u8) {
        self.0.update(&[byte]);
    }

    pub fn value(&self) -> u16 {
        self.0.get()
    }

    pub fn high(&self) -> u8 {
        (self.value() >> 8) as u8
    }

    pub fn low(&self) -> u8 {
        (self.value() & 0x00FF) as u8
    }
}

impl Default for FrameCrc {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC-16 of a whole frame header plus payload, as carried in the trailer.
pub fn frame_crc(msg_type: u8, payload: &[u8]) -> u16 {
    let mut crc = FrameCrc::new();
    crc.update(msg_type);
    crc.update(payload.len() as u8);
    for byte in payload {
        crc.update(*byte);
    }
    crc.value()
}
