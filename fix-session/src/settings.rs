use std::{net::IpAddr, ops::RangeInclusive};

use chrono::NaiveTime;
use fix_core::FixString;
use serde::{Deserialize, Deserializer};
use tokio::time::Duration;

use crate::session_id::SessionId;

fn duration_from_seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Duration::from_secs(u64::deserialize(deserializer)?))
}

/// Listener-side configuration: one acceptor binds one `Settings`, serving
/// any number of registered `SessionSettings`.
#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    pub host: IpAddr,
    pub port: u16,
    /// SenderCompID<49> for outgoing messages.
    pub sender_comp_id: FixString,
    pub sender_sub_id: Option<FixString>,
    /// Timeout for inbound/outbound messages: a `TestRequest<1>` is sent
    /// when an inbound message is overdue, a `Heartbeat<0>` when outbound is.
    #[serde(deserialize_with = "duration_from_seconds")]
    pub heartbeat_interval: Duration,
    /// Timeout for the first `Logon<A>`; past it the connection is dropped.
    #[serde(deserialize_with = "duration_from_seconds")]
    pub auto_disconnect_after_no_logon_received: Duration,
    /// How many unanswered `TestRequest<1>`s are tolerated before the
    /// connection is dropped.
    pub auto_disconnect_after_no_heartbeat: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SessionSettings {
    pub session_id: SessionId,
    pub session_time: RangeInclusive<NaiveTime>,
    pub logon_time: RangeInclusive<NaiveTime>,

    pub send_redundant_resend_requests: bool,
    pub check_comp_id: bool,
    pub check_latency: bool,
    pub max_latency: Duration,

    pub reset_on_logon: bool,
    pub reset_on_logout: bool,
    pub reset_on_disconnect: bool,

    pub refresh_on_logon: bool,

    pub sender_default_appl_ver_id: FixString,
    pub target_default_appl_ver_id: FixString,

    /// Enable NextExpectedMsgSeqNum<789> on sent Logon and synchronize off
    /// of it on received Logon.
    pub enable_next_expected_msg_seq_num: bool,

    pub persist: bool,
    pub verify_logout: bool,
}

impl Default for SessionSettings {
    fn default() -> SessionSettings {
        SessionSettings {
            session_id: SessionId::new(
                FixString::try_from("FIX.4.2").unwrap(),
                FixString::new(),
                FixString::new(),
            ),
            session_time: NaiveTime::from_hms_opt(0, 0, 0).unwrap()
                ..=NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
            logon_time: NaiveTime::from_hms_opt(0, 0, 0).unwrap()
                ..=NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
            send_redundant_resend_requests: false,
            check_comp_id: true,
            check_latency: true,
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
}
