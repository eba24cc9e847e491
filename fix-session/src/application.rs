//! Event channel between a running session and its application: the
//! session emits `FixEventInternal` on an internal `mpsc` channel, and
//! `AsEvent::as_event` narrows each variant into the public, borrow-shaped
//! `FixEvent` the caller actually sees.

use std::fmt;

use fix_core::{FixMessage, SessionRejectReason, Tag};
use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::{session_id::SessionId, DisconnectReason, Sender};

/// What the caller decided to do with an inbound message that failed
/// session-level verification, expressed as the reply sent back over the
/// `InputResponder`'s oneshot channel.
#[derive(Debug)]
pub(crate) enum InputResponderMsg {
    Reject {
        ref_msg_type: String,
        ref_seq_num: u32,
        reason: SessionRejectReason,
        text: String,
        ref_tag_id: Option<Tag>,
    },
    Logout {
        text: Option<String>,
        disconnect: bool,
    },
    Disconnect,
}

/// Handed to the application alongside an inbound message; lets it force a
/// `Reject<3>`, a `Logout<5>`, or an immediate disconnect instead of the
/// session's own verification outcome.
#[derive(Debug)]
pub struct InputResponder {
    sender: oneshot::Sender<InputResponderMsg>,
}

impl InputResponder {
    pub(crate) fn new(sender: oneshot::Sender<InputResponderMsg>) -> InputResponder {
        InputResponder { sender }
    }

    pub fn reject(
        self,
        ref_msg_type: String,
        ref_seq_num: u32,
        reason: SessionRejectReason,
        text: String,
        ref_tag_id: Option<Tag>,
    ) {
        let _ = self.sender.send(InputResponderMsg::Reject {
            ref_msg_type,
            ref_seq_num,
            reason,
            text,
            ref_tag_id,
        });
    }

    pub fn logout(self, text: Option<String>, disconnect: bool) {
        let _ = self
            .sender
            .send(InputResponderMsg::Logout { text, disconnect });
    }

    pub fn disconnect(self) {
        let _ = self.sender.send(InputResponderMsg::Disconnect);
    }
}

/// Handed to the application alongside an outbound message right before
/// it's serialized; lets it suppress the send entirely.
pub struct Responder {
    sender: Option<oneshot::Sender<Box<FixMessage>>>,
}

impl Responder {
    pub(crate) fn new(sender: oneshot::Sender<Box<FixMessage>>) -> Responder {
        Responder { sender: Some(sender) }
    }

    pub fn do_not_send(&mut self) {
        self.sender.take();
    }
}

#[derive(Debug)]
pub(crate) enum FixEventInternal {
    Created(SessionId),
    Logon(SessionId, Option<Sender>),
    Logout(SessionId, DisconnectReason),
    AppMsgIn(
        Option<Box<FixMessage>>,
        Option<oneshot::Sender<InputResponderMsg>>,
    ),
    AdmMsgIn(
        Option<Box<FixMessage>>,
        Option<oneshot::Sender<InputResponderMsg>>,
    ),
    AppMsgOut(Option<Box<FixMessage>>, Responder),
    AdmMsgOut(Option<Box<FixMessage>>, Responder),
    CodecError(SessionId, String),
}

impl Drop for FixEventInternal {
    fn drop(&mut self) {
        if let FixEventInternal::AppMsgOut(ref mut msg, ref mut responder)
        | FixEventInternal::AdmMsgOut(ref mut msg, ref mut responder) = self
        {
            if let Some(sender) = responder.sender.take() {
                if let Some(msg) = msg.take() {
                    let _ = sender.send(msg);
                }
            }
        }
    }
}

/// FIX protocol events, as seen by an application.
#[derive(Debug)]
pub enum FixEvent<'a> {
    /// Session created.
    Created(&'a SessionId),

    /// Successful Logon<A> exchange. Use `Sender` to push messages onto
    /// this session's output queue.
    Logon(&'a SessionId, Sender),

    /// Session disconnected.
    Logout(&'a SessionId, DisconnectReason),

    /// New application message received. Use `InputResponder` to reject
    /// the message or force a logout/disconnect.
    AppMsgIn(Box<FixMessage>, InputResponder),

    /// New administrative message received.
    AdmMsgIn(Box<FixMessage>, InputResponder),

    /// Application message about to be sent. Use `Responder` to suppress it.
    AppMsgOut(&'a mut FixMessage, &'a mut Responder),

    /// Administrative message about to be sent.
    AdmMsgOut(&'a mut FixMessage),

    /// A buffered byte stream failed to decode into a FIX message.
    CodecError(&'a SessionId, &'a str),
}

#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::Receiver<FixEventInternal>,
}

#[derive(Debug, Clone)]
pub(crate) struct Emitter {
    inner: mpsc::Sender<FixEventInternal>,
}

impl Emitter {
    pub(crate) async fn send(&self, event: FixEventInternal) {
        if self.inner.send(event).await.is_err() {
            error!("failed to deliver session event: application channel closed");
        }
    }
}

pub(crate) fn events_channel() -> (Emitter, EventStream) {
    let (sender, receiver) = mpsc::channel(16);
    (Emitter { inner: sender }, EventStream { receiver })
}

mod private {
    pub trait Sealed {}
    impl Sealed for super::FixEventInternal {}
}

/// Sealed: implemented only by this crate's internal event representation.
pub trait AsEvent: private::Sealed {
    fn as_event(&mut self) -> FixEvent<'_>;
}

impl AsEvent for FixEventInternal {
    fn as_event(&mut self) -> FixEvent<'_> {
        match self {
            FixEventInternal::Created(id) => FixEvent::Created(id),
            FixEventInternal::Logon(id, sender) => FixEvent::Logon(id, sender.take().expect("logon event sender set once")),
            FixEventInternal::Logout(id, reason) => FixEvent::Logout(id, *reason),
            FixEventInternal::AppMsgIn(msg, sender) => FixEvent::AppMsgIn(
                msg.take().expect("event message taken once"),
                InputResponder::new(sender.take().expect("responder taken once")),
            ),
            FixEventInternal::AdmMsgIn(msg, sender) => FixEvent::AdmMsgIn(
                msg.take().expect("event message taken once"),
                InputResponder::new(sender.take().expect("responder taken once")),
            ),
            FixEventInternal::AppMsgOut(msg, resp) => {
                FixEvent::AppMsgOut(msg.as_mut().expect("event message present until drop"), resp)
            }
            FixEventInternal::AdmMsgOut(msg, _) => {
                FixEvent::AdmMsgOut(msg.as_mut().expect("event message present until drop"))
            }
            FixEventInternal::CodecError(session_id, text) => {
                FixEvent::CodecError(session_id, text)
            }
        }
    }
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<impl AsEvent> {
        self.receiver.recv().await
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder").finish_non_exhaustive()
    }
}
