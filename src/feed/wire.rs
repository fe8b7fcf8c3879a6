//! Wire Protocol for the Market Data Feed
//!
//! Fixed 18-byte binary frame, one frame per WebSocket message.
//! All multi-byte fields are unsigned big-endian; bytes past offset 18 are ignored.

use serde::Serialize;

/// Minimum frame size in bytes
/// 1+1+4+4+4+4 = 18 bytes
pub const FRAME_LEN: usize = 18;

/// Decoded market update for a single instrument
///
/// Layout (all fields big-endian):
/// ```text
/// Offset  Size  Field
/// 0       1     mode
/// 1       1     exchange_code
/// 2       4     instrument_token
/// 6       4     last_traded_price
/// 10      4     last_traded_time (unix seconds)
/// 14      4     last_traded_qty
/// Total: 18 bytes
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tick {
    pub mode: u8,
    pub exchange_code: u8,
    pub instrument_token: u32,
    pub last_traded_price: u32,
    pub last_traded_time: u32,
    pub last_traded_qty: u32,
}

impl Tick {
    /// Serialize to the 18-byte wire layout
    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0] = self.mode;
        buf[1] = self.exchange_code;
        buf[2..6].copy_from_slice(&self.instrument_token.to_be_bytes());
        buf[6..10].copy_from_slice(&self.last_traded_price.to_be_bytes());
        buf[10..14].copy_from_slice(&self.last_traded_time.to_be_bytes());
        buf[14..18].copy_from_slice(&self.last_traded_qty.to_be_bytes());
        buf
    }
}

/// Errors during frame decoding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame too short: {0} bytes (expected at least 18)")]
    FrameTooShort(usize),
}

/// Decode one frame into a [`Tick`].
///
/// Frames shorter than [`FRAME_LEN`] are rejected; trailing bytes are ignored.
pub fn decode(frame: &[u8]) -> Result<Tick, DecodeError> {
    let Some(head) = frame.get(..FRAME_LEN) else {
        return Err(DecodeError::FrameTooShort(frame.len()));
    };

    Ok(Tick {
        mode: head[0],
        exchange_code: head[1],
        instrument_token: read_u32(head, 2),
        last_traded_price: read_u32(head, 6),
        last_traded_time: read_u32(head, 10),
        last_traded_qty: read_u32(head, 14),
    })
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}
