//! Session-layer engine: wire codec, per-session state machine, durable
//! storage, transport abstraction, and the acceptor/initiator connection
//! loops built on top of them.
//!
//! Message construction and validation live in `session.rs`; this module
//! owns the outward-facing `Sender` handle and the small set of
//! cross-cutting types every other module depends on.

pub mod acceptor;
pub mod application;
pub mod codec;
pub mod dsn;
pub mod initiator;
pub mod io;
mod session;
pub mod session_id;
mod session_state;
pub mod settings;
pub mod store;
pub mod transport;

use fix_core::{FixMessage, FixString, Header, MsgType, Uid};
use tokio::sync::mpsc;
use tracing::error;

pub use store::{MessageStore, StoreError};
pub use transport::{Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum AcceptorError {
    #[error("unknown session")]
    UnknownSession,
    #[error("session active")]
    SessionActive,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("never received logon from new connection")]
    LogonNeverReceived,
    #[error("message does not point to any known session")]
    UnknownSession,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("codec error: {0}")]
    Codec(#[from] fix_core::CodecError),
    #[error("config error: {0}")]
    Config(#[from] fix_core::ConfigError),
}

/// Disconnection reasons, surfaced to applications via `FixEvent::Logout`.
#[derive(Clone, Copy, Debug)]
pub enum DisconnectReason {
    LocalRequestedLogout,
    RemoteRequestedLogout,
    UserForcedDisconnect,
    ApplicationForcedDisconnect,
    MsgSeqNumNotFound,
    MsgSeqNumTooLow,
    InvalidLogonState,
    LogoutTimeout,
    Disconnected,
    IoError,
}

/// Multiplier applied to the heartbeat interval to get the inbound idle
/// timeout: a `TestRequest<1>` is due once this much time has passed
/// without hearing from the peer, per the FIX heartbeat monitoring rules.
pub(crate) const TEST_REQUEST_THRESHOLD: f32 = 1.2;

/// Extra slack added on top of `auto_disconnect_after_no_logon_received`
/// before the first-message wait is abandoned, absorbing scheduling jitter
/// so a peer that sends its Logon right at the deadline isn't punished for it.
pub(crate) const NO_INBOUND_TIMEOUT_PADDING: tokio::time::Duration =
    tokio::time::Duration::from_secs(1);

#[derive(Debug)]
pub(crate) enum SenderMsg {
    Msg(Box<FixMessage>),
    Disconnect(DisconnectReason),
}

/// Handle an application uses to push messages onto a live session's output
/// queue. Cloneable; every `FixEvent::Logon` carries one.
#[derive(Clone, Debug)]
pub struct Sender {
    inner: mpsc::UnboundedSender<SenderMsg>,
}

impl Sender {
    pub(crate) fn new(writer: mpsc::UnboundedSender<SenderMsg>) -> Sender {
        Sender { inner: writer }
    }

    /// Queues `msg` for the output loop. BeginString/SenderCompID/
    /// TargetCompID/MsgSeqNum/SendingTime are filled in by the session
    /// before serialization if left unset; CheckSum is always recomputed.
    pub fn send_raw(&self, msg: Box<FixMessage>) -> Result<(), Box<FixMessage>> {
        if let Err(e) = self.inner.send(SenderMsg::Msg(msg)) {
            match e.0 {
                SenderMsg::Msg(msg) => {
                    error!(msg_type = ?msg.header.msg_type, "failed to send, receiver closed or dropped");
                    Err(msg)
                }
                SenderMsg::Disconnect(_) => unreachable!(),
            }
        } else {
            Ok(())
        }
    }

    pub(crate) fn disconnect(&self, reason: DisconnectReason) {
        if self.inner.send(SenderMsg::Disconnect(reason)).is_err() {
            error!("failed to disconnect, receiver closed or dropped");
        }
    }
}

/// A header with only `msg_type` set; the session fills CompIDs, MsgSeqNum
/// and SendingTime in at send time, right before handing off to the codec.
pub fn new_header(msg_type: MsgType) -> Header {
    Header {
        begin_string: FixString::new(),
        body_length: 0,
        msg_type: Some(msg_type),
        msg_seq_num: None,
        sender_comp_id: None,
        target_comp_id: None,
        sending_time: None,
        poss_dup_flag: false,
        orig_sending_time: None,
    }
}

/// Builds a not-yet-persisted outbound message. `Uid(0)` is never assigned
/// by the store (sequence numbers there start at 1), so it unambiguously
/// marks "constructed locally, not yet written to the store".
pub(crate) fn new_message(header: Header, body: Vec<(fix_core::Tag, FixString)>) -> FixMessage {
    FixMessage {
        uid: Uid::new(0),
        header,
        body,
    }
}
