//! Adapts a session's outbound `SenderMsg` queue into a byte-producing
//! stream. Each queued message passes through `Session::on_message_out`
//! for a last application veto, has its sequence number assigned and the
//! encoded bytes persisted if it doesn't carry one already (a resend
//! replay or gap-fill sets its own), and is encoded to wire bytes. A
//! heartbeat-interval idle timeout is interleaved as `OutputEvent::Timeout`,
//! matching the inbound side's `TestRequest` trigger.

use std::rc::Rc;

use async_stream::stream;
use futures_util::Stream;
use tokio::{sync::mpsc, time::Duration};
use tracing::error;

use fix_core::UtcTimestamp;

use crate::{codec, session::Session, store::MessageStore, DisconnectReason, SenderMsg};

pub(crate) enum OutputEvent {
    Message(Vec<u8>),
    Timeout,
    Disconnect(DisconnectReason),
}

/// Fills in any header field a caller of `Sender::send_raw` left unset
/// (BeginString/SenderCompID/TargetCompID/SendingTime), assigns
/// `msg_seq_num` via the store and persists the encoded bytes, unless the
/// message already carries one — set by `resend_stored_message` or
/// `send_sequence_reset_gap_fill` for a sequence slot that was already
/// reserved when it was first sent or skipped.
async fn assign_and_encode<S: MessageStore>(
    session: &Session<S>,
    mut msg: Box<fix_core::FixMessage>,
) -> Vec<u8> {
    let session_id = session.session_id();
    if msg.header.begin_string.as_utf8().is_empty() {
        msg.header.begin_string = session_id.begin_string().to_owned();
    }
    if msg.header.sender_comp_id.is_none() {
        msg.header.sender_comp_id = Some(session_id.sender_comp_id().to_owned());
    }
    if msg.header.target_comp_id.is_none() {
        msg.header.target_comp_id = Some(session_id.target_comp_id().to_owned());
    }
    if msg.header.sending_time.is_none() {
        msg.header.sending_time = Some(UtcTimestamp::now());
    }

    let needs_assignment = msg.header.msg_seq_num.is_none();
    if needs_assignment {
        let seq_num = session.state().borrow_mut().incr_local().await.unwrap_or(1);
        msg.header.msg_seq_num = Some(seq_num);
    }

    let bytes = codec::encode(&msg.header, &msg.body);

    if needs_assignment {
        let seq_num = msg.header.msg_seq_num.expect("assigned above");
        let mut state = session.state().borrow_mut();
        if let Err(error) = state.store_mut().store_sent(seq_num, bytes.clone()).await {
            error!(%error, seq_num, "failed to persist sent message");
        }
    }

    bytes
}

pub(crate) fn output_stream<S: MessageStore + 'static>(
    session: Rc<Session<S>>,
    heartbeat_interval: Duration,
    mut receiver: mpsc::UnboundedReceiver<SenderMsg>,
) -> impl Stream<Item = OutputEvent> {
    stream! {
        loop {
            match tokio::time::timeout(heartbeat_interval, receiver.recv()).await {
                Ok(Some(SenderMsg::Msg(msg))) => {
                    if let Some(msg) = session.on_message_out(msg).await {
                        yield OutputEvent::Message(assign_and_encode(&session, msg).await);
                    }
                }
                Ok(Some(SenderMsg::Disconnect(reason))) => {
                    yield OutputEvent::Disconnect(reason);
                    return;
                }
                Ok(None) => {
                    yield OutputEvent::Disconnect(DisconnectReason::Disconnected);
                    return;
                }
                Err(_) => yield OutputEvent::Timeout,
            }
        }
    }
}
