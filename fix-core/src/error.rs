use thiserror::Error;

use crate::tags::{SessionRejectReason, Tag};

/// Failures the wire codec can raise while decoding a buffered byte stream.
///
/// Partial buffers are never an error — `get_message` simply returns
/// `Ok(None)` until enough bytes have arrived. Only genuinely malformed
/// framing reaches this type.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("checksum mismatch: expected {expected:03}, computed {computed:03}")]
    ChecksumMismatch { expected: u8, computed: u8 },

    #[error("missing or malformed BeginString<8>")]
    MissingBeginString,

    #[error("missing or malformed BodyLength<9>")]
    MissingBodyLength,

    #[error("field at byte offset {offset} is not valid printable ASCII")]
    InvalidFieldValue { offset: usize },

    #[error("malformed tag=value field near byte offset {offset}")]
    MalformedField { offset: usize },
}

/// Outcome of validating one inbound message's header, per the per-message
/// processing rules: local recoveries continue the poll loop, fatal errors
/// close the session.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("required tag {0} missing")]
    RequiredTagMissing(Tag),

    #[error("tag {tag} has an incorrect value: {reason}")]
    IncorrectTagValue { tag: Tag, reason: SessionRejectReason },

    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u32, got: u32 },

    #[error("fatal sequence gap: expected {expected}, got {got}")]
    FatalSequenceGap { expected: u32, got: u32 },
}

/// DSN / settings parsing failures, raised synchronously at setup and never
/// from the poll loop.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed connection DSN: {0}")]
    MalformedDsn(String),

    #[error("unsupported FIX version {0:?}")]
    UnsupportedVersion(String),

    #[error("missing required DSN field {0:?}")]
    MissingField(&'static str),

    #[error("unsupported store DSN scheme {0:?}")]
    UnsupportedStoreScheme(String),
}
