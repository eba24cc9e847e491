//! Dialer side: owns one session's settings/state and opens the TCP
//! connection to its counterparty, handing the rest to
//! `io::initiator_connection`.

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use tracing::{info, info_span, Instrument};

use crate::{
    application::{events_channel, AsEvent, Emitter, EventStream},
    io::initiator_connection,
    session::Session,
    session_id::SessionId,
    session_state::State,
    settings::{SessionSettings, Settings},
    store::MessageStore,
    transport::TcpTransport,
    Error,
};

pub(crate) type ActiveSessionsMap<S> = HashMap<SessionId, Rc<Session<S>>>;

pub struct Initiator<S> {
    id: SessionId,
    settings: Settings,
    session_settings: SessionSettings,
    state: Rc<RefCell<State<S>>>,
    active_sessions: Rc<RefCell<ActiveSessionsMap<S>>>,
    emitter: Emitter,
    event_stream: EventStream,
}

impl<S: MessageStore + 'static> Initiator<S> {
    pub fn new(settings: Settings, session_settings: SessionSettings, store: S) -> Initiator<S> {
        let (emitter, event_stream) = events_channel();
        Initiator {
            id: session_settings.session_id.clone(),
            settings,
            session_settings,
            state: Rc::new(RefCell::new(State::new(store, true))),
            active_sessions: Rc::new(RefCell::new(HashMap::new())),
            emitter,
            event_stream,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.id
    }

    /// Next FIX event for this session: created, logon, logout, inbound/
    /// outbound message, or decode error.
    pub async fn recv(&mut self) -> Option<impl AsEvent + '_> {
        self.event_stream.recv().await
    }

    pub async fn connect(&self) -> Result<(), Error> {
        info!("initiator started");

        let host = self.settings.host.to_string();
        let transport = TcpTransport::connect(&host, self.settings.port).await?;
        let tcp_stream = transport.into_stream();
        tcp_stream.set_nodelay(true)?;
        let emitter = self.emitter.clone();
        let settings = self.settings.clone();
        let session_settings = self.session_settings.clone();
        let active_sessions = self.active_sessions.clone();
        let state = self.state.clone();

        let connection_span = info_span!("connection", %host, port = self.settings.port);

        tokio::task::spawn_local(async move {
            initiator_connection(
                tcp_stream,
                settings,
                session_settings,
                state,
                active_sessions,
                emitter,
            )
            .instrument(connection_span.clone())
            .await;
            connection_span.in_scope(|| info!("connection closed"));
        });
        Ok(())
    }
}
