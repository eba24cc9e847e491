//! Per-session mutable state: the flag set from the data model (§3) plus
//! the pending-message queue and counters. One `State<S>` is owned by
//! exactly one session task, wrapped in `Rc<RefCell<...>>` by `Session`.

use std::{collections::BTreeMap, collections::HashSet, ops::RangeInclusive};

use fix_core::{FixMessage, FixString, SeqNum};
use tokio::time::Instant;

use crate::store::MessageStore;

/// Messages received while a sequence gap is open, buffered until catch-up
/// delivers them in order.
#[derive(Debug, Default)]
struct PendingQueue(BTreeMap<SeqNum, FixMessage>);

impl PendingQueue {
    fn enqueue(&mut self, seq_num: SeqNum, msg: FixMessage) {
        self.0.insert(seq_num, msg);
    }

    fn retrieve(&mut self, seq_num: SeqNum) -> Option<FixMessage> {
        self.0.remove(&seq_num)
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}

/// Session flags from the data model: `DEFAULT` is the absence of the
/// others. `WAIT_RESEND` is represented by `resend_range` being `Some`
/// rather than a separate bool, since the range itself is the state a
/// resend-in-progress needs.
pub(crate) struct State<S> {
    enabled: bool,
    received_logon: bool,
    sent_logon: bool,
    sent_logout: bool,
    wait_logout: bool,
    /// Peer sent Logout while we were still backfilling a gap; our own
    /// Logout reply is deferred until catch-up finishes (`LOGOUT_RESEND`).
    logout_resend: bool,
    sent_reset: bool,
    reset_received: bool,
    initiate: bool,
    closing: bool,
    closed: bool,
    logout_reason: Option<FixString>,

    test_request_counter: u32,
    resend_range: Option<RangeInclusive<SeqNum>>,
    heart_bt_int: u32,
    last_sent_time: Instant,
    last_received_time: Instant,

    /// Tag 789/NextExpectedMsgSeqNum value sent on our last Logon, used to
    /// populate `resend_range` without waiting for an explicit ResendRequest.
    next_expected_msg_seq_num: SeqNum,

    queue: PendingQueue,
    store: S,

    grace_period_test_req_ids: HashSet<FixString>,
}

impl<S: MessageStore> State<S> {
    pub(crate) fn new(store: S, initiate: bool) -> State<S> {
        State {
            enabled: true,
            received_logon: false,
            sent_logon: false,
            sent_logout: false,
            wait_logout: false,
            logout_resend: false,
            sent_reset: false,
            reset_received: false,
            initiate,
            closing: false,
            closed: false,
            logout_reason: None,
            test_request_counter: 0,
            resend_range: None,
            heart_bt_int: 30,
            last_sent_time: Instant::now(),
            last_received_time: Instant::now(),
            next_expected_msg_seq_num: 0,
            queue: PendingQueue::default(),
            store,
            grace_period_test_req_ids: HashSet::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn logon_received(&self) -> bool {
        self.received_logon
    }

    pub fn set_logon_received(&mut self, v: bool) {
        self.received_logon = v;
    }

    pub fn logon_sent(&self) -> bool {
        self.sent_logon
    }

    pub fn set_logon_sent(&mut self, v: bool) {
        self.sent_logon = v;
    }

    /// `LOGGED_ON`: set once both directions have exchanged Logon.
    pub fn is_logged_on(&self) -> bool {
        self.sent_logon && self.received_logon
    }

    pub fn logout_sent(&self) -> bool {
        self.sent_logout
    }

    pub fn set_logout_sent(&mut self, v: bool) {
        self.sent_logout = v;
    }

    /// `WAIT_LOGOUT`: we initiated logout and are awaiting the peer's reply.
    pub fn wait_logout(&self) -> bool {
        self.wait_logout
    }

    pub fn set_wait_logout(&mut self, v: bool) {
        self.wait_logout = v;
    }

    pub fn logout_resend(&self) -> bool {
        self.logout_resend
    }

    pub fn set_logout_resend(&mut self, v: bool) {
        self.logout_resend = v;
    }

    pub fn reset_received(&self) -> bool {
        self.reset_received
    }

    pub fn set_reset_received(&mut self, v: bool) {
        self.reset_received = v;
    }

    pub fn reset_sent(&self) -> bool {
        self.sent_reset
    }

    pub fn set_reset_sent(&mut self, v: bool) {
        self.sent_reset = v;
    }

    pub fn is_initiator(&self) -> bool {
        self.initiate
    }

    pub fn logout_reason(&self) -> Option<&FixString> {
        self.logout_reason.as_ref()
    }

    pub fn set_logout_reason(&mut self, reason: Option<FixString>) {
        self.logout_reason = reason;
    }

    pub fn closing(&self) -> bool {
        self.closing
    }

    pub fn set_closing(&mut self, v: bool) {
        self.closing = v;
    }

    /// `CLOSED`: the session has fully torn down; no further I/O occurs.
    pub fn closed(&self) -> bool {
        self.closed
    }

    pub fn set_closed(&mut self, v: bool) {
        self.closed = v;
    }

    pub fn test_request_counter(&self) -> u32 {
        self.test_request_counter
    }

    pub fn set_test_request_counter(&mut self, v: u32) {
        self.test_request_counter = v;
    }

    /// `WAIT_RESEND`: a ResendRequest is outstanding, or we are replaying
    /// one for the peer. No application message is delivered while set.
    pub fn resend_range(&self) -> Option<RangeInclusive<SeqNum>> {
        self.resend_range.clone()
    }

    pub fn set_resend_range(&mut self, range: Option<RangeInclusive<SeqNum>>) {
        self.resend_range = range;
    }

    pub fn is_wait_resend(&self) -> bool {
        self.resend_range.is_some()
    }

    pub fn heart_bt_int(&self) -> u32 {
        self.heart_bt_int
    }

    pub fn set_heart_bt_int(&mut self, v: u32) {
        self.heart_bt_int = v;
    }

    pub fn last_sent_time(&self) -> Instant {
        self.last_sent_time
    }

    pub fn set_last_sent_time(&mut self, v: Instant) {
        self.last_sent_time = v;
    }

    pub fn last_received_time(&self) -> Instant {
        self.last_received_time
    }

    pub fn set_last_received_time(&mut self, v: Instant) {
        self.last_received_time = v;
    }

    pub fn should_send_logon(&self) -> bool {
        self.is_initiator() && !self.logon_sent()
    }

    /// Populates `resend_range` from the NextExpectedMsgSeqNum we sent on
    /// our last Logon, for when the peer turns out to be target-too-high
    /// on logon and tag 789 is in play — equivalent to having already
    /// requested everything from that point to infinity.
    pub fn set_resend_range_from_last_expected_logon_next_seq_num(&mut self) {
        self.set_resend_range(Some(
            self.next_expected_msg_seq_num..=crate::store::SEQ_NUM_INFINITY,
        ));
        self.next_expected_msg_seq_num = 0;
    }

    pub fn set_last_expected_logon_next_seq_num(&mut self, seq_num: SeqNum) {
        self.next_expected_msg_seq_num = seq_num;
    }

    pub fn is_expected_logon_next_seq_num_sent(&self) -> bool {
        self.next_expected_msg_seq_num != 0
    }

    pub fn enqueue_msg(&mut self, msg: FixMessage) {
        let seq_num = msg.header.msg_seq_num.expect("sequenced message");
        self.queue.enqueue(seq_num, msg);
    }

    pub async fn retrieve_next_queued_msg(&mut self) -> Option<FixMessage> {
        let expected = self.get_remote().await.ok()?;
        self.queue.retrieve(expected)
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    pub async fn get_local(&mut self) -> Result<SeqNum, crate::store::StoreError> {
        self.store.get_local().await
    }

    pub async fn get_remote(&mut self) -> Result<SeqNum, crate::store::StoreError> {
        self.store.get_remote().await
    }

    pub async fn incr_local(&mut self) -> Result<SeqNum, crate::store::StoreError> {
        self.store.incr_local().await
    }

    pub async fn incr_remote(&mut self) -> Result<SeqNum, crate::store::StoreError> {
        self.store.incr_remote().await
    }

    pub async fn set_local(&mut self, seq_num: SeqNum) -> Result<(), crate::store::StoreError> {
        self.store.set_local(seq_num).await
    }

    pub async fn set_remote(&mut self, seq_num: SeqNum) -> Result<(), crate::store::StoreError> {
        self.store.set_remote(seq_num).await
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub async fn reset(&mut self) -> Result<(), crate::store::StoreError> {
        self.queue.clear();
        self.store.reset().await
    }

    pub fn input_timeout_count(&self) -> usize {
        self.grace_period_test_req_ids.len()
    }

    pub fn register_grace_period_test_req_id(&mut self, test_req_id: FixString) {
        self.grace_period_test_req_ids.insert(test_req_id);
    }

    pub fn validate_grace_period_test_req_id(&mut self, test_req_id: &FixString) -> bool {
        if self.grace_period_test_req_ids.contains(test_req_id) {
            self.reset_grace_period();
            true
        } else {
            false
        }
    }

    pub fn reset_grace_period(&mut self) {
        self.grace_period_test_req_ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn wait_resend_tracks_resend_range() {
        let mut state = State::new(InMemoryStore::new(), true);
        assert!(!state.is_wait_resend());
        state.set_resend_range(Some(2..=5));
        assert!(state.is_wait_resend());
        state.set_resend_range(None);
        assert!(!state.is_wait_resend());
    }

    #[tokio::test]
    async fn logged_on_requires_both_directions() {
        let mut state = State::new(InMemoryStore::new(), true);
        assert!(!state.is_logged_on());
        state.set_logon_sent(true);
        assert!(!state.is_logged_on());
        state.set_logon_received(true);
        assert!(state.is_logged_on());
    }

    #[tokio::test]
    async fn reset_clears_queue_and_crosses_counters() {
        let mut state = State::new(InMemoryStore::new(), true);
        state.set_local(5).await.unwrap();
        state.set_remote(7).await.unwrap();
        state.reset().await.unwrap();
        assert_eq!(state.get_local().await.unwrap(), 1);
        assert_eq!(state.get_remote().await.unwrap(), 2);
    }
}
