//! Minimal echo acceptor: registers a handful of sessions, logs every event,
//! and reflects each inbound application message back to its sender with
//! the route reversed.

use std::{collections::HashMap, time::Duration};

use chrono::NaiveTime;
use fix_core::FixString;
use fix_session::{
    acceptor::{Acceptor, TcpConnection},
    application::AsEvent,
    session_id::SessionId,
    settings::{SessionSettings, Settings},
    store::InMemoryStore,
    Sender,
};
use tracing::{error, info};

fn fix_string(s: &str) -> FixString {
    FixString::try_from(s).expect("valid FIX string")
}

fn register_session(acceptor: &mut Acceptor<InMemoryStore>, begin_string: &FixString, sender_comp_id: &FixString, target_id: &str) {
    let session_id = SessionId::new(begin_string.clone(), sender_comp_id.clone(), fix_string(target_id));
    acceptor.register_session(
        session_id.clone(),
        SessionSettings {
            session_id,
            session_time: NaiveTime::from_hms_opt(0, 0, 0).unwrap()..=NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
            logon_time: NaiveTime::from_hms_opt(0, 0, 0).unwrap()..=NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
            send_redundant_resend_requests: false,
            check_comp_id: true,
            check_latency: true,
            max_latency: Duration::from_secs(120),
            reset_on_logon: false,
            reset_on_logout: false,
            reset_on_disconnect: false,
            refresh_on_logon: false,
            sender_default_appl_ver_id: fix_string("9"),
            target_default_appl_ver_id: fix_string("9"),
            enable_next_expected_msg_seq_num: true,
            persist: false,
            verify_logout: true,
        },
    );
}

async fn run() {
    let settings = Settings {
        host: "127.0.0.1".parse().unwrap(),
        port: 10050,
        sender_comp_id: fix_string("DEMO_ACCEPTOR"),
        sender_sub_id: None,
        heartbeat_interval: Duration::from_secs(10),
        auto_disconnect_after_no_logon_received: Duration::from_secs(3),
        auto_disconnect_after_no_heartbeat: 3,
    };

    let begin_string = fix_string("FIX.4.4");
    let sender_comp_id = settings.sender_comp_id.clone();
    let mut acceptor = Acceptor::new(settings.clone(), Box::new(|_| InMemoryStore::new()));
    register_session(&mut acceptor, &begin_string, &sender_comp_id, "CLIENT1");
    register_session(&mut acceptor, &begin_string, &sender_comp_id, "CLIENT2");

    let connection = TcpConnection::new((settings.host, settings.port))
        .await
        .expect("bind acceptor socket");
    acceptor.start(connection);
    info!(addr = %settings.host, port = settings.port, "acceptor listening");

    let mut senders: HashMap<SessionId, Sender> = HashMap::new();
    while let Some(mut event) = acceptor.recv().await {
        use fix_session::application::FixEvent;
        match event.as_event() {
            FixEvent::Created(session_id) => info!(%session_id, "session created"),
            FixEvent::Logon(session_id, sender) => {
                info!(%session_id, "logon");
                senders.insert(session_id.clone(), sender);
            }
            FixEvent::Logout(session_id, reason) => {
                info!(%session_id, ?reason, "logout");
                senders.remove(session_id);
            }
            FixEvent::AppMsgIn(mut msg, responder) => {
                info!(msg_type = ?msg.header.msg_type, "app message in");
                let reply_to = SessionId::from_input_msg(&msg).reverse_route();
                std::mem::swap(&mut msg.header.sender_comp_id, &mut msg.header.target_comp_id);
                if let Some(sender) = senders.get(&reply_to) {
                    let _ = sender.send_raw(msg);
                } else {
                    error!(%reply_to, "no active session to echo to");
                }
                drop(responder);
            }
            FixEvent::AdmMsgIn(msg, responder) => {
                info!(msg_type = ?msg.header.msg_type, "admin message in");
                drop(responder);
            }
            FixEvent::AppMsgOut(msg, _responder) => {
                info!(msg_type = ?msg.header.msg_type, "app message out");
            }
            FixEvent::AdmMsgOut(msg) => info!(msg_type = ?msg.header.msg_type, "admin message out"),
            FixEvent::CodecError(session_id, error) => {
                error!(%session_id, %error, "failed to decode inbound bytes");
            }
        }
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("build runtime");

    let local_set = tokio::task::LocalSet::new();
    local_set.block_on(&runtime, run());
}
