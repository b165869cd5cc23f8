//! Fixed-header binary framing.
//!
//! Every frame starts with a 6-byte header:
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------+
//! | opcode (u16 LE) | param1 | param2 |  dest  | source |
//! +--------+--------+--------+--------+--------+--------+
//! ```
//!
//! followed by an optional payload. Where the payload length comes from is an
//! instrument-family decision, captured by [`PayloadLength`]. A payload byte
//! equal to some text terminator has no meaning here; only the declared length
//! ends a frame.

use super::{Decoded, FrameCodec};
use crate::command::{Reply, Signature};
use std::collections::HashMap;

/// Size of the fixed header.
pub const HEADER_LEN: usize = 6;

/// Bit in the destination byte announcing a payload (APT convention).
const DATA_FLAG: u8 = 0x80;

/// Default upper bound on a declared payload.
const DEFAULT_MAX_PAYLOAD: usize = 255;

/// How the payload length of a frame is determined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadLength {
    /// param1/param2 always hold the payload length (`u16` LE).
    Explicit,
    /// A payload follows only when bit 7 of the destination byte is set; its
    /// length is then in param1/param2. Otherwise both params are free.
    DataFlag,
    /// Length implied by the opcode; unknown opcodes carry no payload.
    ByOpcode(HashMap<u16, usize>),
}

/// One binary frame, used both as request and as decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFrame {
    pub opcode: u16,
    pub param1: u8,
    pub param2: u8,
    /// Destination byte as on the wire (including any data flag).
    pub destination: u8,
    pub source: u8,
    pub payload: Vec<u8>,
}

impl BinaryFrame {
    /// Header-only frame with both parameter bytes in use.
    pub fn header(opcode: u16, param1: u8, param2: u8, destination: u8, source: u8) -> Self {
        Self {
            opcode,
            param1,
            param2,
            destination,
            source,
            payload: Vec::new(),
        }
    }

    /// Frame carrying `payload`; the length fields are filled in on encode.
    pub fn with_payload(opcode: u16, destination: u8, source: u8, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            param1: 0,
            param2: 0,
            destination,
            source,
            payload,
        }
    }

    /// Destination address without the data flag.
    pub fn address(&self) -> u8 {
        self.destination & !DATA_FLAG
    }

    /// Little-endian `u16` at `offset` in the payload.
    pub fn payload_u16(&self, offset: usize) -> Option<u16> {
        let bytes = self.payload.get(offset..offset + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Little-endian `i32` at `offset` in the payload.
    pub fn payload_i32(&self, offset: usize) -> Option<i32> {
        let bytes = self.payload.get(offset..offset + 4)?;
        Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl Reply for BinaryFrame {
    fn signature(&self) -> Signature {
        Signature::Opcode(self.opcode)
    }
}

/// Codec for fixed-header binary frames.
#[derive(Debug, Clone)]
pub struct BinaryCodec {
    length: PayloadLength,
    max_payload: usize,
    #[cfg(feature = "crc")]
    crc_trailer: bool,
}

impl BinaryCodec {
    /// Codec with the given payload-length policy.
    pub fn new(length: PayloadLength) -> Self {
        Self {
            length,
            max_payload: DEFAULT_MAX_PAYLOAD,
            #[cfg(feature = "crc")]
            crc_trailer: false,
        }
    }

    /// APT-style framing (`DataFlag`).
    pub fn apt() -> Self {
        Self::new(PayloadLength::DataFlag)
    }

    /// Reject declared payloads longer than `max`.
    #[must_use]
    pub fn with_max_payload(mut self, max: usize) -> Self {
        self.max_payload = max;
        self
    }

    /// Append (and require) a CRC-16/Modbus trailer over header and payload.
    #[cfg(feature = "crc")]
    #[must_use]
    pub fn with_crc16(mut self) -> Self {
        self.crc_trailer = true;
        self
    }

    fn trailer_len(&self) -> usize {
        #[cfg(feature = "crc")]
        if self.crc_trailer {
            return 2;
        }
        0
    }

    fn declared_len(&self, opcode: u16, param1: u8, param2: u8, destination: u8) -> usize {
        let field = u16::from_le_bytes([param1, param2]) as usize;
        match &self.length {
            PayloadLength::Explicit => field,
            PayloadLength::DataFlag if destination & DATA_FLAG != 0 => field,
            PayloadLength::DataFlag => 0,
            PayloadLength::ByOpcode(table) => table.get(&opcode).copied().unwrap_or(0),
        }
    }
}

impl FrameCodec for BinaryCodec {
    type Request = BinaryFrame;
    type Reply = BinaryFrame;

    fn check_request(&self, frame: &BinaryFrame) -> Result<(), String> {
        let limit = self.max_payload.min(u16::MAX as usize);
        if frame.payload.len() > limit {
            return Err(format!(
                "opcode 0x{:04X} payload of {} bytes exceeds {}",
                frame.opcode,
                frame.payload.len(),
                limit
            ));
        }
        Ok(())
    }

    fn encode(&self, frame: &BinaryFrame) -> Vec<u8> {
        let len = u16::try_from(frame.payload.len()).unwrap_or(u16::MAX).to_le_bytes();
        let (param1, param2, destination) = match &self.length {
            PayloadLength::Explicit => (len[0], len[1], frame.destination),
            PayloadLength::DataFlag if !frame.payload.is_empty() => {
                (len[0], len[1], frame.destination | DATA_FLAG)
            }
            _ => (frame.param1, frame.param2, frame.destination),
        };

        let mut out = Vec::with_capacity(HEADER_LEN + frame.payload.len() + self.trailer_len());
        out.extend_from_slice(&frame.opcode.to_le_bytes());
        out.extend_from_slice(&[param1, param2, destination, frame.source]);
        out.extend_from_slice(&frame.payload);

        #[cfg(feature = "crc")]
        if self.crc_trailer {
            let crc = super::checksum::crc16_modbus(&out);
            out.extend_from_slice(&crc.to_le_bytes());
        }
        out
    }

    fn try_decode(&self, buffer: &[u8]) -> Decoded<BinaryFrame> {
        if buffer.len() < HEADER_LEN {
            return Decoded::Incomplete;
        }

        let opcode = u16::from_le_bytes([buffer[0], buffer[1]]);
        let (param1, param2, destination, source) = (buffer[2], buffer[3], buffer[4], buffer[5]);

        let declared = self.declared_len(opcode, param1, param2, destination);
        if declared > self.max_payload {
            return Decoded::Invalid(format!(
                "opcode 0x{:04X} declares {} payload bytes (max {})",
                opcode, declared, self.max_payload
            ));
        }

        let body_end = HEADER_LEN + declared;
        let total = body_end + self.trailer_len();
        if buffer.len() < total {
            return Decoded::Incomplete;
        }

        #[cfg(feature = "crc")]
        if self.crc_trailer {
            let expected = super::checksum::crc16_modbus(&buffer[..body_end]);
            let received = u16::from_le_bytes([buffer[body_end], buffer[body_end + 1]]);
            if expected != received {
                return Decoded::Invalid(format!(
                    "CRC mismatch: computed 0x{:04X}, received 0x{:04X}",
                    expected, received
                ));
            }
        }

        Decoded::Frame {
            consumed: total,
            reply: BinaryFrame {
                opcode,
                param1,
                param2,
                destination,
                source,
                payload: buffer[HEADER_LEN..body_end].to_vec(),
            },
        }
    }
}
