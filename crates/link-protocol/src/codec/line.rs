//! Delimiter-terminated text records.

use super::{Checksum, Decoded, FrameCodec};
use crate::command::{Reply, Signature};

const DEFAULT_MAX_LINE: usize = 1024;

/// A decoded text line with terminator and checksum removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextLine {
    pub text: String,
}

impl Reply for TextLine {
    fn signature(&self) -> Signature {
        Signature::Text(self.text.split_whitespace().next().unwrap_or_default().to_string())
    }
}

/// Codec for text records ending in a terminator, with an optional `:XX`
/// checksum suffix.
///
/// A configured checksum is always appended on encode. On decode it is
/// verified when present; a line without one is accepted as is, since many
/// devices only echo checksums once told to.
#[derive(Debug, Clone)]
pub struct LineCodec {
    terminator: Vec<u8>,
    checksum: Option<(Checksum, usize)>,
    /// Leading bytes of lines whose checksum must match. `None` means all.
    checksummed: Option<Vec<u8>>,
    max_line: usize,
}

impl LineCodec {
    /// Lines ending in `terminator`. A `\r` before the terminator is dropped.
    pub fn new(terminator: impl Into<Vec<u8>>) -> Self {
        Self {
            terminator: terminator.into(),
            checksum: None,
            checksummed: None,
            max_line: DEFAULT_MAX_LINE,
        }
    }

    /// Use `checksum`, computed over the text after its first `skip` bytes.
    #[must_use]
    pub fn with_checksum(mut self, checksum: Checksum, skip: usize) -> Self {
        self.checksum = Some((checksum, skip));
        self
    }

    /// Only lines starting with one of `types` fail on a checksum mismatch.
    /// On other lines a suffix that does not verify is kept as text, so
    /// `#01 1 time 12:34` decodes with its data intact.
    #[must_use]
    pub fn with_checksummed_types(mut self, types: impl Into<Vec<u8>>) -> Self {
        self.checksummed = Some(types.into());
        self
    }

    /// Lines longer than `max` without a terminator are invalid.
    #[must_use]
    pub fn with_max_line(mut self, max: usize) -> Self {
        self.max_line = max;
        self
    }

    /// Wire bytes for `text`: checksum suffix (if any) plus terminator.
    pub fn frame_line(&self, text: &str) -> Vec<u8> {
        let mut out = text.as_bytes().to_vec();
        if let Some((kind, skip)) = self.checksum {
            let covered = out.get(skip..).unwrap_or_default();
            let sum = kind.compute(covered);
            out.extend_from_slice(format!(":{:02X}", sum).as_bytes());
        }
        out.extend_from_slice(&self.terminator);
        out
    }

    /// Split one line off the front of `buffer`, verifying and stripping the
    /// checksum.
    pub fn take_line(&self, buffer: &[u8]) -> Decoded<String> {
        let Some(end) = find(buffer, &self.terminator) else {
            if buffer.len() > self.max_line {
                return Decoded::Invalid(format!(
                    "no terminator within {} bytes",
                    self.max_line
                ));
            }
            return Decoded::Incomplete;
        };
        let consumed = end + self.terminator.len();

        let mut line = &buffer[..end];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }

        let line = match std::str::from_utf8(line) {
            Ok(text) => text,
            Err(e) => return Decoded::Invalid(format!("line is not UTF-8: {}", e)),
        };

        let text = match self.strip_checksum(line) {
            Ok(text) => text,
            Err(reason) => return Decoded::Invalid(reason),
        };

        Decoded::Frame {
            consumed,
            reply: text.to_string(),
        }
    }

    fn strip_checksum<'a>(&self, line: &'a str) -> Result<&'a str, String> {
        let Some((kind, skip)) = self.checksum else {
            return Ok(line);
        };
        let Some((body, suffix)) = line.rsplit_once(':') else {
            return Ok(line);
        };
        if suffix.len() != 2 || !suffix.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Ok(line);
        }
        let Ok(received) = u8::from_str_radix(suffix, 16) else {
            return Ok(line);
        };
        let covered = body.as_bytes().get(skip..).unwrap_or_default();
        let computed = kind.compute(covered);
        if computed != received {
            let strict = match &self.checksummed {
                Some(types) => line.as_bytes().first().is_some_and(|lead| types.contains(lead)),
                None => true,
            };
            if !strict {
                return Ok(line);
            }
            return Err(format!(
                "checksum mismatch: computed {:02X}, received {:02X}",
                computed, received
            ));
        }
        Ok(body)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl FrameCodec for LineCodec {
    type Request = String;
    type Reply = TextLine;

    fn encode(&self, request: &String) -> Vec<u8> {
        self.frame_line(request)
    }

    fn try_decode(&self, buffer: &[u8]) -> Decoded<TextLine> {
        match self.take_line(buffer) {
            Decoded::Incomplete => Decoded::Incomplete,
            Decoded::Invalid(reason) => Decoded::Invalid(reason),
            Decoded::Frame { consumed, reply } => Decoded::Frame {
                consumed,
                reply: TextLine { text: reply },
            },
        }
    }
}
