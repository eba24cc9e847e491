//! Wire-level types shared by the session engine: validated FIX strings,
//! tag constants, timestamps, and the primitive error taxonomy. Business
//! message bodies stay opaque `Vec<(Tag, FixString)>` pairs here; only the
//! session layer gives them meaning.

mod error;
mod fix_string;
mod tags;
mod time;

pub use error::{CodecError, ConfigError, ValidationError};
pub use fix_string::{FixStr, FixString, FixStringError};
pub use tags::{tags, MsgType, SessionRejectReason, Tag};
pub use time::{TimestampError, UtcTimestamp};

/// Sequence number. 1-based; the first message in a session uses `1`.
pub type SeqNum = u32;

/// Locally-assigned, monotonic storage key. Not a UUID: the store indexes
/// messages by this counter, separately from `SeqNum`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Uid(u64);

impl Uid {
    pub const fn new(value: u64) -> Uid {
        Uid(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

/// One decoded FIX message: header fields plus an opaque ordered body.
///
/// The body is never reinterpreted structurally — repeating groups are just
/// further `(Tag, FixString)` pairs in order, exactly as they arrived on the
/// wire. Only the handful of session-layer tags the header tracks are ever
/// read by this crate.
#[derive(Clone, Debug)]
pub struct FixMessage {
    pub uid: Uid,
    pub header: Header,
    pub body: Vec<(Tag, FixString)>,
}

/// Header fields the session layer reads or writes on every message.
///
/// `begin_string`/`body_length` are guaranteed by the codec: a message
/// without them never successfully frames. The remaining fields are
/// `Option` because a malformed-but-framed message (missing MsgSeqNum, say)
/// is a session-level validation failure, not a codec error — it still
/// decodes, so the session can emit a targeted `Reject<3>` instead of
/// dropping the message outright. `PossDupFlag`/`OrigSendingTime` are
/// absent on first-sent messages and present only on resends.
#[derive(Clone, Debug)]
pub struct Header {
    pub begin_string: FixString,
    pub body_length: u32,
    pub msg_type: Option<MsgType>,
    pub msg_seq_num: Option<SeqNum>,
    pub sender_comp_id: Option<FixString>,
    pub target_comp_id: Option<FixString>,
    pub sending_time: Option<UtcTimestamp>,
    pub poss_dup_flag: bool,
    pub orig_sending_time: Option<UtcTimestamp>,
}

impl FixMessage {
    /// Looks up a body tag; returns `None` if absent. Header tags are never
    /// found here — read them off `self.header` instead.
    pub fn get(&self, tag: Tag) -> Option<&FixStr> {
        self.body
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_fix_str())
    }

    /// All body occurrences of `tag`, in wire order. Used for repeating
    /// group members and any tag that may legally repeat.
    pub fn get_all(&self, tag: Tag) -> impl Iterator<Item = &FixStr> {
        self.body
            .iter()
            .filter(move |(t, _)| *t == tag)
            .map(|(_, v)| v.as_fix_str())
    }
}
