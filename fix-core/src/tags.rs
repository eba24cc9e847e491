use std::fmt;

use crate::fix_string::{FixStr, FixString};

/// A FIX tag number.
pub type Tag = u16;

/// Session-layer tags the engine itself reads or writes. Business-payload
/// tags are opaque and never appear here; they pass through [`crate::Body`]
/// untouched.
pub mod tags {
    use super::Tag;

    pub const BEGIN_SEQ_NO: Tag = 7;
    pub const BEGIN_STRING: Tag = 8;
    pub const BODY_LENGTH: Tag = 9;
    pub const CHECK_SUM: Tag = 10;
    pub const END_SEQ_NO: Tag = 16;
    pub const MSG_SEQ_NUM: Tag = 34;
    pub const MSG_TYPE: Tag = 35;
    pub const NEW_SEQ_NUM: Tag = 36;
    pub const REF_SEQ_NUM: Tag = 45;
    pub const SENDER_COMP_ID: Tag = 49;
    pub const SENDING_TIME: Tag = 52;
    pub const TARGET_COMP_ID: Tag = 56;
    pub const TEXT: Tag = 58;
    pub const POSS_DUP_FLAG: Tag = 43;
    pub const ENCRYPT_METHOD: Tag = 98;
    pub const HEART_BT_INT: Tag = 108;
    pub const TEST_REQ_ID: Tag = 112;
    pub const ORIG_SENDING_TIME: Tag = 122;
    pub const GAP_FILL_FLAG: Tag = 123;
    pub const RESET_SEQ_NUM_FLAG: Tag = 141;
    pub const REF_TAG_ID: Tag = 371;
    pub const REF_MSG_TYPE: Tag = 372;
    pub const SESSION_REJECT_REASON: Tag = 373;
    pub const NEXT_EXPECTED_MSG_SEQ_NUM: Tag = 789;
}

/// MsgType<35>. Session-layer (admin) values are named; everything else is
/// opaque business-message payload the engine never interprets.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum MsgType {
    Heartbeat,
    TestRequest,
    ResendRequest,
    Reject,
    SequenceReset,
    Logout,
    Logon,
    App(FixString),
}

impl MsgType {
    pub fn from_fix_str(s: &FixStr) -> MsgType {
        match s.as_utf8() {
            "0" => MsgType::Heartbeat,
            "1" => MsgType::TestRequest,
            "2" => MsgType::ResendRequest,
            "3" => MsgType::Reject,
            "4" => MsgType::SequenceReset,
            "5" => MsgType::Logout,
            "A" => MsgType::Logon,
            _ => MsgType::App(s.to_owned()),
        }
    }

    pub fn as_fix_str(&self) -> &str {
        match self {
            MsgType::Heartbeat => "0",
            MsgType::TestRequest => "1",
            MsgType::ResendRequest => "2",
            MsgType::Reject => "3",
            MsgType::SequenceReset => "4",
            MsgType::Logout => "5",
            MsgType::Logon => "A",
            MsgType::App(s) => s.as_utf8(),
        }
    }

    /// True for the seven session-layer (administrative) message types.
    pub fn is_admin(&self) -> bool {
        !matches!(self, MsgType::App(_))
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_fix_str())
    }
}

/// SessionRejectReason<373>, restricted to the subset this engine generates
/// itself (per FIX 4.2 Volume 2 Appendix).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionRejectReason {
    RequiredTagMissing,
    ValueIsIncorrect,
    CompIdProblem,
    SendingTimeAccuracyProblem,
    InvalidMsgType,
    Other(u16),
}

impl fmt::Display for SessionRejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.text(), self.code())
    }
}

impl SessionRejectReason {
    pub fn code(&self) -> u16 {
        match self {
            SessionRejectReason::RequiredTagMissing => 1,
            SessionRejectReason::ValueIsIncorrect => 5,
            SessionRejectReason::CompIdProblem => 9,
            SessionRejectReason::SendingTimeAccuracyProblem => 10,
            SessionRejectReason::InvalidMsgType => 11,
            SessionRejectReason::Other(code) => *code,
        }
    }

    pub fn text(&self) -> &'static str {
        match self {
            SessionRejectReason::RequiredTagMissing => "Required tag missing",
            SessionRejectReason::ValueIsIncorrect => "Value is incorrect (out of range) for this tag",
            SessionRejectReason::CompIdProblem => "CompID problem",
            SessionRejectReason::SendingTimeAccuracyProblem => "SendingTime accuracy problem",
            SessionRejectReason::InvalidMsgType => "Invalid MsgType",
            SessionRejectReason::Other(_) => "Session-level rejection",
        }
    }
}
