//! Commands and the signatures used to recognize their replies.

use std::fmt;

/// The leading byte(s) or token identifying which logical reply a frame is.
///
/// Signatures are compared by exact equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Signature {
    /// Binary message id from a fixed header.
    Opcode(u16),
    /// Single leading byte (echo-acknowledged controllers).
    Byte(u8),
    /// Leading text token(s) of an ASCII reply, e.g. `@01 1`.
    Text(String),
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signature::Opcode(op) => write!(f, "0x{:04X}", op),
            Signature::Byte(b) => write!(f, "0x{:02X}", b),
            Signature::Text(t) => write!(f, "'{}'", t),
        }
    }
}

/// Primary signature plus any alternates that are also acceptable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureSet {
    primary: Signature,
    alternates: Vec<Signature>,
}

impl SignatureSet {
    /// Accept only `primary`.
    pub fn new(primary: Signature) -> Self {
        Self {
            primary,
            alternates: Vec::new(),
        }
    }

    /// Also accept `alternate`.
    #[must_use]
    pub fn or(mut self, alternate: Signature) -> Self {
        if alternate != self.primary && !self.alternates.contains(&alternate) {
            self.alternates.push(alternate);
        }
        self
    }

    /// Also accept every signature of `other`.
    #[must_use]
    pub fn or_any(self, other: &SignatureSet) -> Self {
        other.iter().cloned().fold(self, SignatureSet::or)
    }

    /// The signature a well-behaved device answers with.
    pub fn primary(&self) -> &Signature {
        &self.primary
    }

    /// Whether `signature` is the primary or one of the alternates.
    pub fn matches(&self, signature: &Signature) -> bool {
        self.iter().any(|s| s == signature)
    }

    /// Primary first, then alternates.
    pub fn iter(&self) -> impl Iterator<Item = &Signature> {
        std::iter::once(&self.primary).chain(self.alternates.iter())
    }
}

impl From<Signature> for SignatureSet {
    fn from(primary: Signature) -> Self {
        Self::new(primary)
    }
}

impl fmt::Display for SignatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary)?;
        for alt in &self.alternates {
            write!(f, " or {}", alt)?;
        }
        Ok(())
    }
}

/// One logical command: the request to encode, the reply signatures that
/// answer it, and a label for logs and errors.
#[derive(Debug, Clone)]
pub struct Command<Req> {
    /// Codec-specific request.
    pub request: Req,
    /// Reply signatures that complete the round trip.
    pub expect: SignatureSet,
    /// Human-readable name, e.g. `move_abs` or `get pos`.
    pub label: String,
}

impl<Req> Command<Req> {
    /// Build a command.
    pub fn new(label: impl Into<String>, request: Req, expect: impl Into<SignatureSet>) -> Self {
        Self {
            request,
            expect: expect.into(),
            label: label.into(),
        }
    }

    /// Additionally accept `alternate` as the reply.
    #[must_use]
    pub fn or_reply(mut self, alternate: Signature) -> Self {
        self.expect = self.expect.or(alternate);
        self
    }
}

/// A decoded reply frame.
pub trait Reply: Clone + fmt::Debug + Send + Sync + 'static {
    /// Signature used to match this reply against a command.
    fn signature(&self) -> Signature;

    /// Device-provided reason if this well-formed reply is a refusal.
    fn rejection(&self) -> Option<String> {
        None
    }
}
