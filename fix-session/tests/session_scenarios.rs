//! End-to-end scenarios driven over real loopback TCP sockets, using only
//! the crate's public `Acceptor`/`Initiator` API. These exercise the full
//! wire round trip (encode -> socket -> decode -> dispatch) rather than a
//! directly-constructed `Session`, which is what the unit tests in
//! `session.rs` and `io/*_stream.rs` cover instead.

use std::ops::RangeInclusive;

use chrono::NaiveTime;
use fix_core::{tags, FixMessage, FixString, MsgType, Uid};
use fix_session::{
    acceptor::{Acceptor, TcpConnection},
    application::{AsEvent, FixEvent},
    initiator::Initiator,
    new_header,
    session_id::SessionId,
    settings::{SessionSettings, Settings},
    store::InMemoryStore,
    DisconnectReason, Sender,
};
use tokio::{task::LocalSet, time::Duration};

fn fstr(s: &str) -> FixString {
    FixString::try_from(s).unwrap()
}

fn full_day() -> RangeInclusive<NaiveTime> {
    NaiveTime::from_hms_opt(0, 0, 0).unwrap()..=NaiveTime::from_hms_opt(23, 59, 59).unwrap()
}

fn session_settings(session_id: SessionId) -> SessionSettings {
    SessionSettings {
        session_id,
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
    }
}

fn raw_message(msg_type: MsgType, body: Vec<(fix_core::Tag, FixString)>) -> Box<FixMessage> {
    Box::new(FixMessage {
        uid: Uid::new(0),
        header: new_header(msg_type),
        body,
    })
}

/// Brings up one acceptor bound to an ephemeral loopback port, with one
/// registered session (`FIX.4.2: SERVER -> CLIENT`), and one initiator
/// (`FIX.4.2: CLIENT -> SERVER`) connected to it. Returns both handles
/// before either side's Logon handshake has completed; callers drive that
/// with `wait_for_logon_*`.
async fn spawn_pair() -> (Acceptor<InMemoryStore>, SessionId, Initiator<InMemoryStore>) {
    let acceptor_settings = Settings {
        host: "127.0.0.1".parse().unwrap(),
        port: 0,
        sender_comp_id: fstr("SERVER"),
        sender_sub_id: None,
        heartbeat_interval: Duration::from_secs(30),
        auto_disconnect_after_no_logon_received: Duration::from_secs(10),
        auto_disconnect_after_no_heartbeat: 3,
    };
    let acceptor_session_id = SessionId::new(fstr("FIX.4.2"), fstr("SERVER"), fstr("CLIENT"));
    let mut acceptor = Acceptor::new(acceptor_settings, Box::new(|_| InMemoryStore::new()));
    acceptor.register_session(acceptor_session_id.clone(), session_settings(acceptor_session_id.clone()));

    let connection = TcpConnection::new(([127, 0, 0, 1], 0)).await.unwrap();
    let addr = connection.local_addr().unwrap();
    let _server_task = acceptor.start(connection);

    let initiator_settings = Settings {
        host: "127.0.0.1".parse().unwrap(),
        port: addr.port(),
        sender_comp_id: fstr("CLIENT"),
        sender_sub_id: None,
        heartbeat_interval: Duration::from_secs(30),
        auto_disconnect_after_no_logon_received: Duration::from_secs(10),
        auto_disconnect_after_no_heartbeat: 3,
    };
    let initiator_session_id = SessionId::new(fstr("FIX.4.2"), fstr("CLIENT"), fstr("SERVER"));
    let initiator = Initiator::new(
        initiator_settings,
        session_settings(initiator_session_id),
        InMemoryStore::new(),
    );
    initiator.connect().await.unwrap();

    (acceptor, acceptor_session_id, initiator)
}

async fn wait_for_acceptor_logon(acceptor: &mut Acceptor<InMemoryStore>) -> Sender {
    loop {
        let mut event = acceptor.recv().await.expect("acceptor event stream closed");
        if let FixEvent::Logon(_, sender) = event.as_event() {
            return sender;
        }
    }
}

async fn wait_for_initiator_logon(initiator: &mut Initiator<InMemoryStore>) -> Sender {
    loop {
        let mut event = initiator.recv().await.expect("initiator event stream closed");
        if let FixEvent::Logon(_, sender) = event.as_event() {
            return sender;
        }
    }
}

async fn wait_for_acceptor_logout(acceptor: &mut Acceptor<InMemoryStore>) -> DisconnectReason {
    loop {
        let mut event = acceptor.recv().await.expect("acceptor event stream closed");
        if let FixEvent::Logout(_, reason) = event.as_event() {
            return reason;
        }
    }
}

async fn wait_for_initiator_logout(initiator: &mut Initiator<InMemoryStore>) -> DisconnectReason {
    loop {
        let mut event = initiator.recv().await.expect("initiator event stream closed");
        if let FixEvent::Logout(_, reason) = event.as_event() {
            return reason;
        }
    }
}

async fn wait_for_initiator_heartbeat(initiator: &mut Initiator<InMemoryStore>) -> Box<FixMessage> {
    loop {
        let mut event = initiator.recv().await.expect("initiator event stream closed");
        match event.as_event() {
            FixEvent::AdmMsgIn(msg, _responder) if msg.header.msg_type == Some(MsgType::Heartbeat) => {
                return msg;
            }
            _ => {}
        }
    }
}

/// Drains the acceptor's event stream, accepting (dropping) every event by
/// default, until an inbound admin message of `msg_type` shows up. Needed
/// whenever a test expects the acceptor to react to something after its own
/// Logon handshake has already been waited on: each inbound message's
/// `verify()` blocks on its `InputResponder` reply until this is read and
/// dropped, so without this the acceptor-side handler would never run.
async fn wait_for_acceptor_adm_msg_in(acceptor: &mut Acceptor<InMemoryStore>, msg_type: MsgType) -> Box<FixMessage> {
    loop {
        let mut event = acceptor.recv().await.expect("acceptor event stream closed");
        match event.as_event() {
            FixEvent::AdmMsgIn(msg, _responder) if msg.header.msg_type == Some(msg_type.clone()) => {
                return msg;
            }
            _ => {}
        }
    }
}

/// S1: a fresh Logon/Logout exchange over the wire leaves both sides'
/// sequence counters advanced past their initial value, evidence that
/// `store_sent`/`store_received` actually persisted the handshake rather
/// than silently dropping it.
#[tokio::test]
async fn login_then_logout_advances_both_sides_sequence_numbers() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (mut acceptor, session_id, mut initiator) = spawn_pair().await;

            let (_acceptor_sender, initiator_sender) = tokio::join!(
                wait_for_acceptor_logon(&mut acceptor),
                wait_for_initiator_logon(&mut initiator)
            );

            initiator_sender
                .send_raw(raw_message(MsgType::Logout, vec![]))
                .expect("send logout");

            let (acceptor_reason, initiator_reason) = tokio::join!(
                wait_for_acceptor_logout(&mut acceptor),
                wait_for_initiator_logout(&mut initiator)
            );

            assert!(matches!(acceptor_reason, DisconnectReason::RemoteRequestedLogout));
            assert!(matches!(initiator_reason, DisconnectReason::LocalRequestedLogout));

            let acceptor_seq = acceptor.next_sender_msg_seq_num(&session_id).await.unwrap();
            assert!(
                acceptor_seq > 2,
                "acceptor should have sent a Logon response and a Logout response, got next seq {acceptor_seq}"
            );
        })
        .await;
}

/// S2: a `TestRequest<1>` sent by the application gets an automatic
/// `Heartbeat<0>` echo carrying the same `TestReqID<112>`, proving the
/// built-in heartbeat monitoring logic runs end-to-end over the wire.
#[tokio::test]
async fn test_request_gets_heartbeat_echo_with_matching_test_req_id() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (mut acceptor, _session_id, mut initiator) = spawn_pair().await;

            let (_acceptor_sender, initiator_sender) = tokio::join!(
                wait_for_acceptor_logon(&mut acceptor),
                wait_for_initiator_logon(&mut initiator)
            );

            initiator_sender
                .send_raw(raw_message(
                    MsgType::TestRequest,
                    vec![(tags::TEST_REQ_ID, fstr("PING-1"))],
                ))
                .expect("send test request");

            let (_received_test_request, heartbeat) = tokio::join!(
                wait_for_acceptor_adm_msg_in(&mut acceptor, MsgType::TestRequest),
                wait_for_initiator_heartbeat(&mut initiator)
            );
            assert_eq!(heartbeat.get(tags::TEST_REQ_ID).map(|v| v.as_utf8()), Some("PING-1"));
        })
        .await;
}
