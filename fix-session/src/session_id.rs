use core::fmt;

use fix_core::{FixMessage, FixStr, FixString, Header};

/// A 4-tuple `(BeginString, SenderCompID, TargetCompID, Qualifier?)`,
/// symmetric under role swap: the acceptor's view of a session swaps sender
/// and target relative to the initiator's.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct SessionId {
    begin_string: FixString,
    sender_comp_id: FixString,
    target_comp_id: FixString,
    #[cfg_attr(feature = "serde", serde(default))]
    session_qualifier: String,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.session_qualifier.is_empty() {
            write!(
                f,
                "{}: {} -> {}",
                self.begin_string, self.sender_comp_id, self.target_comp_id
            )
        } else {
            write!(
                f,
                "{}: {} -> {} ({})",
                self.begin_string, self.sender_comp_id, self.target_comp_id, self.session_qualifier
            )
        }
    }
}

impl SessionId {
    pub fn new(
        begin_string: FixString,
        sender_comp_id: FixString,
        target_comp_id: FixString,
    ) -> SessionId {
        SessionId {
            begin_string,
            sender_comp_id,
            target_comp_id,
            session_qualifier: String::new(),
        }
    }

    pub fn with_session_qualifier(
        begin_string: FixString,
        sender_comp_id: FixString,
        target_comp_id: FixString,
        session_qualifier: String,
    ) -> SessionId {
        SessionId {
            begin_string,
            sender_comp_id,
            target_comp_id,
            session_qualifier,
        }
    }

    /// The id as seen by the *receiver* of `msg`: sender/target swapped
    /// relative to the wire header, since our target sent it to us.
    ///
    /// Only meaningful once header validation has confirmed both CompIDs
    /// are present; called on any other message is a logic error.
    pub fn from_input_msg(msg: &FixMessage) -> SessionId {
        SessionId::from_input_header(&msg.header)
    }

    pub fn from_input_header(header: &Header) -> SessionId {
        SessionId::new(
            header.begin_string.clone(),
            header
                .target_comp_id
                .clone()
                .expect("header validated before routing by session id"),
            header
                .sender_comp_id
                .clone()
                .expect("header validated before routing by session id"),
        )
    }

    /// The id as seen by the *sender* of `msg`: matches the wire header.
    pub fn from_output_msg(msg: &FixMessage) -> SessionId {
        SessionId::from_output_header(&msg.header)
    }

    pub fn from_output_header(header: &Header) -> SessionId {
        SessionId::new(
            header.begin_string.clone(),
            header
                .sender_comp_id
                .clone()
                .expect("header validated before routing by session id"),
            header
                .target_comp_id
                .clone()
                .expect("header validated before routing by session id"),
        )
    }

    pub fn reverse_route(mut self) -> SessionId {
        std::mem::swap(&mut self.sender_comp_id, &mut self.target_comp_id);
        self
    }

    pub fn begin_string(&self) -> &FixStr {
        &self.begin_string
    }

    pub fn sender_comp_id(&self) -> &FixStr {
        &self.sender_comp_id
    }

    pub fn target_comp_id(&self) -> &FixStr {
        &self.target_comp_id
    }

    pub fn session_qualifier(&self) -> &str {
        &self.session_qualifier
    }

    pub fn is_fixt(&self) -> bool {
        self.begin_string.as_utf8().starts_with("FIXT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_qualifier_only_when_present() {
        let plain = SessionId::new(
            FixString::try_from("FIX.4.2").unwrap(),
            FixString::try_from("BUYER").unwrap(),
            FixString::try_from("SELLER").unwrap(),
        );
        assert_eq!(plain.to_string(), "FIX.4.2: BUYER -> SELLER");

        let qualified = SessionId::with_session_qualifier(
            FixString::try_from("FIX.4.2").unwrap(),
            FixString::try_from("BUYER").unwrap(),
            FixString::try_from("SELLER").unwrap(),
            "backup".to_owned(),
        );
        assert_eq!(qualified.to_string(), "FIX.4.2: BUYER -> SELLER (backup)");
    }

    #[test]
    fn reverse_route_swaps_sender_and_target() {
        let id = SessionId::new(
            FixString::try_from("FIX.4.2").unwrap(),
            FixString::try_from("BUYER").unwrap(),
            FixString::try_from("SELLER").unwrap(),
        );
        let reversed = id.reverse_route();
        assert_eq!(reversed.sender_comp_id().as_utf8(), "SELLER");
        assert_eq!(reversed.target_comp_id().as_utf8(), "BUYER");
    }
}
