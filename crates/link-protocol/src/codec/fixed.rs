//! Header-less binary replies of a fixed size.
//!
//! Echo-acknowledged controllers (filter wheels, shutters) answer a command
//! with a fixed number of bytes, the first of which identifies the reply.

use super::{Decoded, FrameCodec};
use crate::command::{Reply, Signature};

/// A fixed-size reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedReply {
    pub bytes: Vec<u8>,
}

impl FixedReply {
    /// First byte of the reply.
    pub fn lead(&self) -> u8 {
        self.bytes.first().copied().unwrap_or_default()
    }
}

impl Reply for FixedReply {
    fn signature(&self) -> Signature {
        Signature::Byte(self.lead())
    }
}

/// Codec whose requests are raw bytes and whose replies are `reply_len` bytes.
#[derive(Debug, Clone, Copy)]
pub struct FixedLengthCodec {
    reply_len: usize,
}

impl FixedLengthCodec {
    /// Replies of `reply_len` bytes (at least one).
    pub fn new(reply_len: usize) -> Self {
        Self {
            reply_len: reply_len.max(1),
        }
    }
}

impl FrameCodec for FixedLengthCodec {
    type Request = Vec<u8>;
    type Reply = FixedReply;

    fn encode(&self, request: &Vec<u8>) -> Vec<u8> {
        request.clone()
    }

    fn try_decode(&self, buffer: &[u8]) -> Decoded<FixedReply> {
        if buffer.len() < self.reply_len {
            return Decoded::Incomplete;
        }
        Decoded::Frame {
            consumed: self.reply_len,
            reply: FixedReply {
                bytes: buffer[..self.reply_len].to_vec(),
            },
        }
    }
}
