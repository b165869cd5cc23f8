//! Frame codecs.
//!
//! A codec is pure and stateless: it turns a request into wire bytes and
//! recognizes one complete reply at the front of an accumulation buffer. It
//! never performs I/O and never blocks.
//!
//! | Codec | Family |
//! |-------|--------|
//! | [`BinaryCodec`] | fixed 6-byte header + declared payload |
//! | [`FixedLengthCodec`] | header-less replies of a fixed size |
//! | [`LineCodec`] | delimiter-terminated text with optional checksum |
//! | [`AsciiCodec`] | address/axis ASCII protocol built on [`LineCodec`] |

pub mod ascii;
pub mod binary;
pub mod checksum;
pub mod fixed;
pub mod line;

pub use ascii::{AsciiCodec, AsciiReply, AsciiRequest, DeviceStatus, MessageKind, ReplyFlag};
pub use binary::{BinaryCodec, BinaryFrame, PayloadLength, HEADER_LEN};
pub use checksum::Checksum;
pub use fixed::{FixedLengthCodec, FixedReply};
pub use line::{LineCodec, TextLine};

use crate::command::Reply;
use std::fmt::Debug;

/// Outcome of scanning an accumulation buffer for one reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<R> {
    /// More bytes are needed.
    Incomplete,
    /// A complete reply occupying the first `consumed` bytes.
    Frame {
        /// Bytes to drop from the front of the buffer.
        consumed: usize,
        /// The decoded reply.
        reply: R,
    },
    /// The buffer can never become a valid frame.
    Invalid(String),
}

/// Encodes requests and splits replies out of a byte stream.
pub trait FrameCodec: Send + Sync + 'static {
    /// Logical command payload.
    type Request: Debug + Send + Sync + 'static;
    /// Decoded reply.
    type Reply: Reply;

    /// Why `request` cannot be put on the wire, if it cannot.
    fn check_request(&self, _request: &Self::Request) -> Result<(), String> {
        Ok(())
    }

    /// Wire bytes for `request`. Only called once
    /// [`check_request`](Self::check_request) has passed.
    fn encode(&self, request: &Self::Request) -> Vec<u8>;

    /// Try to decode one reply from the front of `buffer`.
    fn try_decode(&self, buffer: &[u8]) -> Decoded<Self::Reply>;
}

/// Compact hex rendering for debug logs.
pub(crate) struct Hex<'a>(pub &'a [u8]);

impl std::fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}
