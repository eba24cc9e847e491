//! Connection driver: a pair of loops — one reading and decoding inbound
//! bytes, one consuming a session's outbound queue and writing encoded
//! bytes — each instrumented under its own span and joined for the
//! lifetime of one TCP connection.
//!
//! Message construction and per-message verification live in `session.rs`;
//! this module's job is purely the I/O plumbing around it: framing,
//! timeouts, and registering/unregistering the session's `Sender` handle
//! so an application can look a session up by id and push messages onto it.

use std::{
    cell::RefCell,
    collections::{hash_map::Entry, HashMap},
    rc::Rc,
    sync::Mutex,
};

use futures_util::{pin_mut, Stream};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::Duration,
};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, info_span, Instrument};

use crate::{
    acceptor::{ActiveSessionsMap, SessionsMap},
    application::{Emitter, FixEventInternal},
    session::{Disconnect, Session},
    session_id::SessionId,
    session_state::State,
    settings::{SessionSettings, Settings},
    store::MessageStore,
    Error, Sender, SessionError, NO_INBOUND_TIMEOUT_PADDING, TEST_REQUEST_THRESHOLD,
};

mod input_stream;
pub(crate) use input_stream::{input_stream, InputEvent};

mod output_stream;
use output_stream::{output_stream, OutputEvent};

pub mod time;
use time::{timeout, timeout_stream};

static SENDERS: Mutex<Option<HashMap<SessionId, Sender>>> = Mutex::new(None);

pub fn register_sender(session_id: SessionId, sender: Sender) {
    if let Entry::Vacant(entry) = SENDERS
        .lock()
        .unwrap()
        .get_or_insert_with(HashMap::new)
        .entry(session_id)
    {
        entry.insert(sender);
    }
}

pub fn unregister_sender(session_id: &SessionId) {
    SENDERS
        .lock()
        .unwrap()
        .get_or_insert_with(HashMap::new)
        .remove(session_id);
}

pub fn sender(session_id: &SessionId) -> Option<Sender> {
    SENDERS
        .lock()
        .unwrap()
        .get_or_insert_with(HashMap::new)
        .get(session_id)
        .cloned()
}

/// Looks the target session up by the `SessionId` its own header implies
/// and queues it there. Returns the message back if no such session is
/// currently registered.
pub fn send_raw(msg: Box<fix_core::FixMessage>) -> Result<(), Box<fix_core::FixMessage>> {
    if let Some(sender) = sender(&SessionId::from_output_msg(&msg)) {
        sender.send_raw(msg)
    } else {
        Err(msg)
    }
}

async fn first_msg(
    stream: &mut (impl Stream<Item = InputEvent> + Unpin),
    logon_timeout: Duration,
) -> Result<Box<fix_core::FixMessage>, Error> {
    match timeout(logon_timeout, stream.next()).await {
        Ok(Some(InputEvent::Message(msg))) => Ok(msg),
        Ok(Some(InputEvent::IoError(error))) => Err(error.into()),
        Ok(Some(InputEvent::CodecError(error))) => {
            error!(%error, "failed to decode first message");
            Err(Error::Session(SessionError::LogonNeverReceived))
        }
        _ => Err(Error::Session(SessionError::LogonNeverReceived)),
    }
}

pub(crate) async fn acceptor_connection<S>(
    reader: impl AsyncRead + Unpin,
    writer: impl AsyncWrite + Unpin,
    settings: Settings,
    sessions: Rc<RefCell<SessionsMap<S>>>,
    active_sessions: Rc<RefCell<ActiveSessionsMap<S>>>,
    emitter: Emitter,
) where
    S: MessageStore + 'static,
{
    let reader_stream = input_stream(reader);
    pin_mut!(reader_stream);

    let logon_timeout =
        settings.auto_disconnect_after_no_logon_received + NO_INBOUND_TIMEOUT_PADDING;
    let msg = match first_msg(&mut reader_stream, logon_timeout).await {
        Ok(msg) => msg,
        Err(error) => {
            error!(%error, "failed to establish new session");
            return;
        }
    };
    let session_id = SessionId::from_input_msg(&msg);
    debug!(?msg, "first message");

    let Some((session_settings, state)) = sessions.borrow().get_session(&session_id) else {
        error!(%session_id, "failed to establish new session: unknown session id");
        return;
    };
    if active_sessions.borrow().contains_key(&session_id) {
        error!(%session_id, "session already active");
        return;
    }

    let (sender_tx, receiver) = mpsc::unbounded_channel();
    let sender = Sender::new(sender_tx);
    register_sender(session_id.clone(), sender.clone());
    let session = Rc::new(Session::new(settings, session_settings, state, sender, emitter.clone()));
    active_sessions.borrow_mut().insert(session_id.clone(), session.clone());

    let session_span = info_span!("session", id = %session_id);
    let input_loop_span = info_span!(parent: &session_span, "in");
    let output_loop_span = info_span!(parent: &session_span, "out");

    let first_disconnect = session
        .on_message_in(msg)
        .instrument(input_loop_span.clone())
        .await;

    emitter.send(FixEventInternal::Created(session_id.clone())).await;

    let input_timeout = session.heartbeat_interval().mul_f32(TEST_REQUEST_THRESHOLD);
    let input_events =
        timeout_stream(input_timeout, reader_stream).map(|res| res.unwrap_or(InputEvent::Timeout));

    let output_events = output_stream(session.clone(), session.heartbeat_interval(), receiver);
    pin_mut!(output_events);

    let connection = Connection::new(session);
    let (input_closed_tx, input_closed_rx) = tokio::sync::oneshot::channel();

    tokio::join!(
        connection
            .input_loop(input_events, input_closed_tx, first_disconnect)
            .instrument(input_loop_span),
        connection
            .output_loop(writer, output_events, input_closed_rx)
            .instrument(output_loop_span),
    );

    session_span.in_scope(|| info!("connection closed"));
    unregister_sender(&session_id);
    active_sessions.borrow_mut().remove(&session_id);
}

pub(crate) async fn initiator_connection<S>(
    tcp_stream: TcpStream,
    settings: Settings,
    session_settings: SessionSettings,
    state: Rc<RefCell<State<S>>>,
    active_sessions: Rc<RefCell<ActiveSessionsMap<S>>>,
    emitter: Emitter,
) where
    S: MessageStore + 'static,
{
    let (source, sink) = tcp_stream.into_split();
    let session_id = session_settings.session_id.clone();

    let (sender_tx, receiver) = mpsc::unbounded_channel();
    let sender = Sender::new(sender_tx);
    register_sender(session_id.clone(), sender.clone());
    let session = Rc::new(Session::new(settings, session_settings, state, sender, emitter.clone()));
    active_sessions.borrow_mut().insert(session_id.clone(), session.clone());

    let session_span = info_span!("session", id = %session_id);
    let input_loop_span = info_span!(parent: &session_span, "in");
    let output_loop_span = info_span!(parent: &session_span, "out");

    emitter.send(FixEventInternal::Created(session_id.clone())).await;

    let reader_stream = input_stream(source);
    pin_mut!(reader_stream);
    let input_timeout = session.heartbeat_interval().mul_f32(TEST_REQUEST_THRESHOLD);
    let input_events =
        timeout_stream(input_timeout, reader_stream).map(|res| res.unwrap_or(InputEvent::Timeout));

    let output_events = output_stream(session.clone(), session.heartbeat_interval(), receiver);
    pin_mut!(output_events);

    session.send_logon_request().await;

    let connection = Connection::new(session);
    let (input_closed_tx, input_closed_rx) = tokio::sync::oneshot::channel();

    tokio::join!(
        connection
            .input_loop(input_events, input_closed_tx, None)
            .instrument(input_loop_span),
        connection
            .output_loop(sink, output_events, input_closed_rx)
            .instrument(output_loop_span),
    );

    session_span.in_scope(|| info!("connection closed"));
    unregister_sender(&session_id);
    active_sessions.borrow_mut().remove(&session_id);
}

struct Connection<S> {
    session: Rc<Session<S>>,
}

impl<S: MessageStore> Connection<S> {
    fn new(session: Rc<Session<S>>) -> Connection<S> {
        Connection { session }
    }

    /// Drives inbound messages into the session. `first_disconnect` carries
    /// the outcome of dispatching the Logon already consumed by `first_msg`
    /// before this loop starts — if it already tore the session down there
    /// is nothing left to read.
    async fn input_loop(
        &self,
        mut input_events: impl Stream<Item = InputEvent> + Unpin,
        input_closed_tx: tokio::sync::oneshot::Sender<()>,
        first_disconnect: Option<Disconnect>,
    ) {
        if first_disconnect.is_none() {
            while let Some(event) = input_events.next().await {
                match event {
                    InputEvent::Message(msg) => {
                        if self.session.on_message_in(msg).await.is_some() {
                            info!("disconnect, exit input processing");
                            break;
                        }
                    }
                    InputEvent::CodecError(error) => {
                        self.session.on_codec_error(error).await;
                    }
                    InputEvent::IoError(error) => {
                        error!(%error, "input error");
                        self.session.on_disconnect(crate::DisconnectReason::IoError).await;
                        break;
                    }
                    InputEvent::Timeout => {
                        self.session.on_in_timeout().await;
                    }
                }
            }
        }
        let _ = input_closed_tx.send(());
    }

    async fn output_loop(
        &self,
        mut sink: impl AsyncWrite + Unpin,
        mut output_events: impl Stream<Item = OutputEvent> + Unpin,
        input_closed_rx: tokio::sync::oneshot::Receiver<()>,
    ) {
        let mut sink_closed = false;
        while let Some(event) = output_events.next().await {
            match event {
                OutputEvent::Message(bytes) => {
                    if !sink_closed {
                        if let Err(error) = sink.write_all(&bytes).await {
                            sink_closed = true;
                            error!(%error, "output write error");
                            // The input loop observes the same broken pipe on
                            // its next read and drives the disconnect; we
                            // just stop writing rather than race it here.
                        }
                    }
                }
                OutputEvent::Timeout => self.session.on_out_timeout().await,
                OutputEvent::Disconnect(_) => {
                    if !sink_closed {
                        if let Err(error) = sink.flush().await {
                            error!(%error, "final flush failed");
                        }
                    }
                    break;
                }
            }
        }

        let _ = input_closed_rx.await;
        if let Err(error) = sink.shutdown().await {
            error!(%error, "connection shutdown failed");
        }
        info!("disconnect, exit output processing");
    }
}
