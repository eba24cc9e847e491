//! Listener side: accepts TCP connections, maps each to a registered
//! `SessionSettings`/store pair by the `SessionId` carried in its first
//! Logon, and drives it through `io::acceptor_connection`.

use std::{cell::RefCell, collections::HashMap, future::Future, io, net::SocketAddr, rc::Rc};

use fix_core::{FixString, SeqNum};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    task::JoinHandle,
};
use tracing::{error, info, info_span, instrument, Instrument};

use crate::{
    application::{events_channel, AsEvent, Emitter, EventStream},
    io::acceptor_connection,
    session::Session,
    session_id::SessionId,
    session_state::State as SessionState,
    settings::{SessionSettings, Settings},
    store::MessageStore,
    AcceptorError, DisconnectReason,
};

#[allow(async_fn_in_trait)]
pub trait Connection {
    async fn accept(
        &mut self,
    ) -> Result<
        (
            impl AsyncRead + Unpin + 'static,
            impl AsyncWrite + Unpin + 'static,
            SocketAddr,
        ),
        io::Error,
    >;
}

pub struct TcpConnection {
    listener: TcpListener,
}

impl TcpConnection {
    pub async fn new(socket_addr: impl Into<SocketAddr>) -> Result<TcpConnection, io::Error> {
        let socket_addr = socket_addr.into();
        let listener = TcpListener::bind(&socket_addr).await?;
        Ok(TcpConnection { listener })
    }

    /// The address actually bound, useful when `new` was given port `0`.
    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.listener.local_addr()
    }
}

impl Connection for TcpConnection {
    async fn accept(
        &mut self,
    ) -> Result<
        (
            impl AsyncRead + Unpin + 'static,
            impl AsyncWrite + Unpin + 'static,
            SocketAddr,
        ),
        io::Error,
    > {
        let (tcp_stream, peer_addr) = self.listener.accept().await?;
        tcp_stream.set_nodelay(true)?;
        let (reader, writer) = tcp_stream.into_split();
        Ok((reader, writer, peer_addr))
    }
}

type SessionMapInternal<S> = HashMap<SessionId, (SessionSettings, Rc<RefCell<SessionState<S>>>)>;

pub struct SessionsMap<S> {
    map: SessionMapInternal<S>,
    store_builder: Box<dyn Fn(&SessionId) -> S>,
}

impl<S: MessageStore> SessionsMap<S> {
    fn new(store_builder: Box<dyn Fn(&SessionId) -> S>) -> SessionsMap<S> {
        SessionsMap {
            map: HashMap::new(),
            store_builder,
        }
    }

    pub fn register_session(&mut self, session_id: SessionId, session_settings: SessionSettings) {
        let store = (self.store_builder)(&session_id);
        self.map.insert(
            session_id.clone(),
            (session_settings, Rc::new(RefCell::new(SessionState::new(store, false)))),
        );
    }

    pub(crate) fn get_session(
        &self,
        session_id: &SessionId,
    ) -> Option<(SessionSettings, Rc<RefCell<SessionState<S>>>)> {
        self.map.get(session_id).cloned()
    }

    fn contains(&self, session_id: &SessionId) -> bool {
        self.map.contains_key(session_id)
    }
}

#[derive(Clone)]
pub struct SessionTask<S> {
    settings: Settings,
    sessions: Rc<RefCell<SessionsMap<S>>>,
    active_sessions: Rc<RefCell<ActiveSessionsMap<S>>>,
    emitter: Emitter,
}

impl<S: MessageStore + 'static> SessionTask<S> {
    fn new(
        settings: Settings,
        sessions: Rc<RefCell<SessionsMap<S>>>,
        active_sessions: Rc<RefCell<ActiveSessionsMap<S>>>,
        emitter: Emitter,
    ) -> SessionTask<S> {
        SessionTask {
            settings,
            sessions,
            active_sessions,
            emitter,
        }
    }

    pub async fn run(
        self,
        peer_addr: SocketAddr,
        reader: impl AsyncRead + Unpin + 'static,
        writer: impl AsyncWrite + Unpin + 'static,
    ) {
        let span = info_span!("connection", %peer_addr);
        span.in_scope(|| info!("new connection"));

        acceptor_connection(
            reader,
            writer,
            self.settings,
            self.sessions,
            self.active_sessions,
            self.emitter,
        )
        .instrument(span.clone())
        .await;

        span.in_scope(|| info!("connection closed"));
    }
}

pub(crate) type ActiveSessionsMap<S> = HashMap<SessionId, Rc<Session<S>>>;

pub struct Acceptor<S> {
    sessions: Rc<RefCell<SessionsMap<S>>>,
    active_sessions: Rc<RefCell<ActiveSessionsMap<S>>>,
    session_task: SessionTask<S>,
    event_stream: EventStream,
}

impl<S: MessageStore + 'static> Acceptor<S> {
    pub fn new(settings: Settings, store_builder: Box<dyn Fn(&SessionId) -> S>) -> Acceptor<S> {
        let (emitter, event_stream) = events_channel();
        let sessions = Rc::new(RefCell::new(SessionsMap::new(store_builder)));
        let active_sessions = Rc::new(RefCell::new(HashMap::new()));
        let session_task =
            SessionTask::new(settings, sessions.clone(), active_sessions.clone(), emitter);

        Acceptor {
            sessions,
            active_sessions,
            session_task,
            event_stream,
        }
    }

    pub fn register_session(&mut self, session_id: SessionId, session_settings: SessionSettings) {
        self.sessions
            .borrow_mut()
            .register_session(session_id, session_settings);
    }

    pub fn sessions_map(&self) -> Rc<RefCell<SessionsMap<S>>> {
        self.sessions.clone()
    }

    pub fn start(&self, connection: impl Connection + 'static) -> JoinHandle<()> {
        tokio::task::spawn_local(Self::server_task(connection, self.session_task.clone()))
    }

    /// Next FIX event: session created, logon, logout, inbound/outbound
    /// message, or decode error. Poll this in a loop to drive the
    /// application side of every session registered on this acceptor.
    pub async fn recv(&mut self) -> Option<impl AsEvent + '_> {
        self.event_stream.recv().await
    }

    pub fn is_session_active(&self, session_id: &SessionId) -> Result<bool, AcceptorError> {
        if self.active_sessions.borrow().contains_key(session_id) {
            Ok(true)
        } else if self.sessions.borrow().contains(session_id) {
            Ok(false)
        } else {
            Err(AcceptorError::UnknownSession)
        }
    }

    /// Sends a `Logout<5>` and tears the session down. A no-op if the
    /// session is already inactive.
    pub async fn logout(
        &self,
        session_id: &SessionId,
        reason: Option<FixString>,
    ) -> Result<(), AcceptorError> {
        if let Some(session) = self.active_sessions.borrow().get(session_id).cloned() {
            session.request_logout(reason).await;
            Ok(())
        } else if self.sessions.borrow().contains(session_id) {
            Ok(())
        } else {
            Err(AcceptorError::UnknownSession)
        }
    }

    /// Tears the session down without exchanging `Logout<5>`. A no-op if
    /// the session is already inactive.
    pub async fn disconnect(&self, session_id: &SessionId) -> Result<(), AcceptorError> {
        if let Some(session) = self.active_sessions.borrow_mut().remove(session_id) {
            session
                .force_disconnect(DisconnectReason::ApplicationForcedDisconnect)
                .await;
            Ok(())
        } else if self.sessions.borrow().contains(session_id) {
            Ok(())
        } else {
            Err(AcceptorError::UnknownSession)
        }
    }

    /// Equivalent to `reset_on_logon`/`reset_on_logout`/`reset_on_disconnect`,
    /// triggered manually. Returns [`AcceptorError::SessionActive`] if the
    /// session is still active — disconnect or log it out first.
    #[instrument(skip_all, fields(session_id=%session_id), ret)]
    pub async fn reset(&self, session_id: &SessionId) -> Result<(), AcceptorError> {
        if self.active_sessions.borrow().contains_key(session_id) {
            return Err(AcceptorError::SessionActive);
        }
        let Some((_, session_state)) = self.sessions.borrow().get_session(session_id) else {
            return Err(AcceptorError::UnknownSession);
        };
        session_state.borrow_mut().reset().await?;
        Ok(())
    }

    #[instrument(skip_all, fields(session_id=%session_id), ret)]
    pub async fn next_sender_msg_seq_num(
        &self,
        session_id: &SessionId,
    ) -> Result<SeqNum, AcceptorError> {
        if let Some(session) = self.active_sessions.borrow().get(session_id) {
            Ok(session.state().borrow_mut().get_local().await?)
        } else if let Some((_, session_state)) = self.sessions.borrow().get_session(session_id) {
            Ok(session_state.borrow_mut().get_local().await?)
        } else {
            Err(AcceptorError::UnknownSession)
        }
    }

    #[instrument(skip_all, fields(session_id=%session_id, seq_num), ret)]
    pub async fn set_next_sender_msg_seq_num(
        &self,
        session_id: &SessionId,
        seq_num: SeqNum,
    ) -> Result<(), AcceptorError> {
        if let Some(session) = self.active_sessions.borrow().get(session_id) {
            session.state().borrow_mut().set_local(seq_num).await?;
            Ok(())
        } else if let Some((_, session_state)) = self.sessions.borrow().get_session(session_id) {
            session_state.borrow_mut().set_local(seq_num).await?;
            Ok(())
        } else {
            Err(AcceptorError::UnknownSession)
        }
    }

    async fn server_task(mut connection: impl Connection, session_task: SessionTask<S>) {
        info!("acceptor started");
        loop {
            match connection.accept().await {
                Ok((reader, writer, peer_addr)) => {
                    tokio::task::spawn_local(session_task.clone().run(peer_addr, reader, writer));
                }
                Err(error) => error!(%error, "acceptor failed to accept incoming connection"),
            }
        }
    }

    pub fn session_task(&self) -> SessionTask<S> {
        self.session_task.clone()
    }

    pub fn run_session_task(
        &self,
        peer_addr: SocketAddr,
        reader: impl AsyncRead + Unpin + 'static,
        writer: impl AsyncWrite + Unpin + 'static,
    ) -> impl Future<Output = ()> {
        self.session_task.clone().run(peer_addr, reader, writer)
    }
}

#[cfg(test)]
mod tests {
    use std::ops::RangeInclusive;

    use chrono::NaiveTime;
    use tokio::time::Duration;

    use super::*;
    use crate::store::InMemoryStore;

    fn fstr(s: &str) -> FixString {
        FixString::try_from(s).unwrap()
    }

    fn full_day() -> RangeInclusive<NaiveTime> {
        NaiveTime::from_hms_opt(0, 0, 0).unwrap()..=NaiveTime::from_hms_opt(23, 59, 59).unwrap()
    }

    fn test_acceptor() -> (Acceptor<InMemoryStore>, SessionId) {
        let settings = Settings {
            host: "127.0.0.1".parse().unwrap(),
            port: 0,
            sender_comp_id: fstr("SERVER"),
            sender_sub_id: None,
            heartbeat_interval: Duration::from_secs(30),
            auto_disconnect_after_no_logon_received: Duration::from_secs(10),
            auto_disconnect_after_no_heartbeat: 3,
        };
        let mut acceptor = Acceptor::new(settings, Box::new(|_| InMemoryStore::new()));
        let session_id = SessionId::new(fstr("FIX.4.2"), fstr("SERVER"), fstr("CLIENT"));
        acceptor.register_session(
            session_id.clone(),
            SessionSettings {
                session_id: session_id.clone(),
                session_time: full_day(),
                logon_time: full_day(),
                send_redundant_resend_requests: false,
                check_comp_id: true,
                check_latency: false,
                max_latency: Duration::from_secs(120),
                reset_on_logon: false,
                reset_on_logout: false,
                reset_on_disconnect: false,
                refresh_on_logon: false,
                sender_default_appl_ver_id: FixString::new(),
                target_default_appl_ver_id: FixString::new(),
                enable_next_expected_msg_seq_num: false,
                persist: true,
                verify_logout: false,
            },
        );
        (acceptor, session_id)
    }

    #[tokio::test]
    async fn unregistered_session_is_unknown() {
        let (acceptor, _) = test_acceptor();
        let unknown = SessionId::new(fstr("FIX.4.2"), fstr("SERVER"), fstr("NOBODY"));
        assert!(matches!(
            acceptor.is_session_active(&unknown),
            Err(AcceptorError::UnknownSession)
        ));
    }

    #[tokio::test]
    async fn registered_session_starts_inactive() {
        let (acceptor, session_id) = test_acceptor();
        assert!(!acceptor.is_session_active(&session_id).unwrap());
    }

    #[tokio::test]
    async fn sequence_number_accessors_operate_on_the_idle_store() {
        let (acceptor, session_id) = test_acceptor();
        assert_eq!(acceptor.next_sender_msg_seq_num(&session_id).await.unwrap(), 1);
        acceptor.set_next_sender_msg_seq_num(&session_id, 7).await.unwrap();
        assert_eq!(acceptor.next_sender_msg_seq_num(&session_id).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn logout_and_disconnect_are_noops_when_inactive() {
        let (acceptor, session_id) = test_acceptor();
        acceptor.logout(&session_id, None).await.unwrap();
        acceptor.disconnect(&session_id).await.unwrap();
    }

    #[tokio::test]
    async fn reset_clears_the_idle_stores_sequence_numbers() {
        let (acceptor, session_id) = test_acceptor();
        acceptor.set_next_sender_msg_seq_num(&session_id, 9).await.unwrap();
        acceptor.reset(&session_id).await.unwrap();
        assert_eq!(acceptor.next_sender_msg_seq_num(&session_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_session_operations_fail() {
        let (acceptor, _) = test_acceptor();
        let unknown = SessionId::new(fstr("FIX.4.2"), fstr("SERVER"), fstr("NOBODY"));
        assert!(matches!(
            acceptor.next_sender_msg_seq_num(&unknown).await,
            Err(AcceptorError::UnknownSession)
        ));
        assert!(matches!(acceptor.reset(&unknown).await, Err(AcceptorError::UnknownSession)));
        assert!(matches!(acceptor.logout(&unknown, None).await, Err(AcceptorError::UnknownSession)));
    }
}
