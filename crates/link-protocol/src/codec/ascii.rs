//! Address/axis ASCII protocol.
//!
//! Requests:
//!
//! ```text
//! /<address> <axis> <command...>[:<checksum>]\n
//! ```
//!
//! Messages from the device, one per line:
//!
//! ```text
//! @<address> <axis> <flag> <status> <warning> <data...>[:<checksum>]\r\n   reply
//! #<address> <axis> <text...>\r\n                                          info
//! !<address> <axis> <status> <warning> <data...>\r\n                       alert
//! ```
//!
//! The checksum is an LRC over everything between the type character and the
//! colon, as two upper-case hex digits.

use super::{Checksum, Decoded, FrameCodec, LineCodec};
use crate::command::{Reply, Signature};
use std::fmt;

/// A command addressed to one device axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciiRequest {
    pub address: u8,
    pub axis: u8,
    /// Command words and arguments, e.g. `move abs 1000`.
    pub command: String,
}

impl AsciiRequest {
    pub fn new(address: u8, axis: u8, command: impl Into<String>) -> Self {
        Self {
            address,
            axis,
            command: command.into(),
        }
    }
}

/// Type of a device message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Reply,
    Info,
    Alert,
}

impl MessageKind {
    fn prefix(self) -> char {
        match self {
            MessageKind::Reply => '@',
            MessageKind::Info => '#',
            MessageKind::Alert => '!',
        }
    }

    fn from_prefix(c: char) -> Option<Self> {
        match c {
            '@' => Some(MessageKind::Reply),
            '#' => Some(MessageKind::Info),
            '!' => Some(MessageKind::Alert),
            _ => None,
        }
    }
}

/// Whether the device accepted the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFlag {
    Ok,
    Rejected,
}

/// Motion status reported in replies and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Busy,
    Idle,
}

impl fmt::Display for ReplyFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReplyFlag::Ok => "OK",
            ReplyFlag::Rejected => "RJ",
        })
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceStatus::Busy => "BUSY",
            DeviceStatus::Idle => "IDLE",
        })
    }
}

/// A tokenized device message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciiReply {
    pub kind: MessageKind,
    pub address: u8,
    pub axis: u8,
    /// Replies only.
    pub flag: Option<ReplyFlag>,
    /// Replies and alerts.
    pub status: Option<DeviceStatus>,
    /// Highest-priority warning flag, `--` when none. Replies and alerts.
    pub warning: Option<String>,
    pub data: Vec<String>,
}

impl AsciiReply {
    /// A `@` reply.
    pub fn reply(
        address: u8,
        axis: u8,
        flag: ReplyFlag,
        status: DeviceStatus,
        data: impl Into<String>,
    ) -> Self {
        Self {
            kind: MessageKind::Reply,
            address,
            axis,
            flag: Some(flag),
            status: Some(status),
            warning: Some("--".to_string()),
            data: data.into().split_whitespace().map(str::to_string).collect(),
        }
    }

    /// Data token `index` parsed as an integer.
    pub fn data_i64(&self, index: usize) -> Option<i64> {
        self.data.get(index)?.parse().ok()
    }

    pub fn is_idle(&self) -> bool {
        self.status == Some(DeviceStatus::Idle)
    }

    pub fn is_busy(&self) -> bool {
        self.status == Some(DeviceStatus::Busy)
    }

    /// The line as sent by the device, without checksum or terminator.
    pub fn to_line(&self) -> String {
        let mut words = vec![format!("{}{:02} {}", self.kind.prefix(), self.address, self.axis)];
        if let Some(flag) = self.flag {
            words.push(flag.to_string());
        }
        if let Some(status) = self.status {
            words.push(status.to_string());
        }
        if let Some(warning) = &self.warning {
            words.push(warning.clone());
        }
        words.extend(self.data.iter().cloned());
        words.join(" ")
    }

    fn parse(line: &str) -> Result<Self, String> {
        let mut chars = line.chars();
        let kind = chars
            .next()
            .and_then(MessageKind::from_prefix)
            .ok_or_else(|| format!("unknown message type in '{}'", line))?;
        let mut tokens = chars.as_str().split_whitespace();

        let address = next_number(&mut tokens, "address", line)?;
        let axis = next_number(&mut tokens, "axis", line)?;

        let (flag, status, warning) = match kind {
            MessageKind::Reply => {
                let flag = match tokens.next() {
                    Some("OK") => ReplyFlag::Ok,
                    Some("RJ") => ReplyFlag::Rejected,
                    other => return Err(format!("bad reply flag {:?} in '{}'", other, line)),
                };
                let status = parse_status(tokens.next(), line)?;
                let warning = tokens
                    .next()
                    .ok_or_else(|| format!("missing warning flag in '{}'", line))?;
                (Some(flag), Some(status), Some(warning.to_string()))
            }
            MessageKind::Alert => {
                let status = parse_status(tokens.next(), line)?;
                let warning = tokens
                    .next()
                    .ok_or_else(|| format!("missing warning flag in '{}'", line))?;
                (None, Some(status), Some(warning.to_string()))
            }
            MessageKind::Info => (None, None, None),
        };

        Ok(Self {
            kind,
            address,
            axis,
            flag,
            status,
            warning,
            data: tokens.map(str::to_string).collect(),
        })
    }
}

fn next_number<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    field: &str,
    line: &str,
) -> Result<u8, String> {
    tokens
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| format!("bad {} in '{}'", field, line))
}

fn parse_status(token: Option<&str>, line: &str) -> Result<DeviceStatus, String> {
    match token {
        Some("BUSY") => Ok(DeviceStatus::Busy),
        Some("IDLE") => Ok(DeviceStatus::Idle),
        other => Err(format!("bad status {:?} in '{}'", other, line)),
    }
}

impl Reply for AsciiReply {
    fn signature(&self) -> Signature {
        Signature::Text(format!("{}{:02} {}", self.kind.prefix(), self.address, self.axis))
    }

    fn rejection(&self) -> Option<String> {
        (self.flag == Some(ReplyFlag::Rejected)).then(|| self.data.join(" "))
    }
}

/// Signature of a `@` reply from `address`/`axis`.
pub fn reply_signature(address: u8, axis: u8) -> Signature {
    Signature::Text(format!("@{:02} {}", address, axis))
}

/// Codec for the address/axis ASCII protocol.
#[derive(Debug, Clone)]
pub struct AsciiCodec {
    line: LineCodec,
    checksums: bool,
}

impl Default for AsciiCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl AsciiCodec {
    /// Codec without checksums. Checksummed replies are still verified.
    pub fn new() -> Self {
        Self {
            line: LineCodec::new(b"\n".to_vec())
                .with_checksum(Checksum::Lrc8, 1)
                .with_checksummed_types(b"@!".to_vec()),
            checksums: false,
        }
    }

    /// Append checksums to outgoing requests.
    #[must_use]
    pub fn with_checksums(mut self) -> Self {
        self.checksums = true;
        self
    }

    /// Wire form of a device message; used by simulators and tests.
    pub fn encode_reply(&self, reply: &AsciiReply) -> Vec<u8> {
        let text = reply.to_line();
        let mut out = if self.checksums {
            self.line.frame_line(&text)
        } else {
            let mut raw = text.into_bytes();
            raw.push(b'\n');
            raw
        };
        out.insert(out.len() - 1, b'\r');
        out
    }
}

impl FrameCodec for AsciiCodec {
    type Request = AsciiRequest;
    type Reply = AsciiReply;

    fn encode(&self, request: &AsciiRequest) -> Vec<u8> {
        let text = format!("/{} {} {}", request.address, request.axis, request.command);
        let text = text.trim_end();
        if self.checksums {
            self.line.frame_line(text)
        } else {
            let mut out = text.as_bytes().to_vec();
            out.push(b'\n');
            out
        }
    }

    fn try_decode(&self, buffer: &[u8]) -> Decoded<AsciiReply> {
        match self.line.take_line(buffer) {
            Decoded::Incomplete => Decoded::Incomplete,
            Decoded::Invalid(reason) => Decoded::Invalid(reason),
            Decoded::Frame { consumed, reply } => match AsciiReply::parse(&reply) {
                Ok(reply) => Decoded::Frame { consumed, reply },
                Err(reason) => Decoded::Invalid(reason),
            },
        }
    }
}
