//! Per-session durable storage: sequence counters plus a sent/received
//! message log, keyed by an in-process `Uid` and indexed by `SeqNum`.

use std::{collections::BTreeMap, ops::RangeInclusive};

use fix_core::{SeqNum, Uid};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate sequence number {0} in {1} index")]
    DuplicateSeqNum(SeqNum, &'static str),

    #[cfg(feature = "redis-store")]
    #[error("redis store error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Ascending or descending retrieval order for [`MessageStore::get_msgs`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Which index to query: messages this session sent, or received.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Sent,
    Received,
}

/// `EndSeqNo=0` on the wire means "through infinity"; this constant is the
/// sentinel internal callers pass instead of special-casing zero at every
/// call site (per the mandate that `0 ⇒ ∞` on both sides of a resend).
pub const SEQ_NUM_INFINITY: SeqNum = SeqNum::MAX;

/// Durable per-session record of sent/received messages and sequence
/// counters. One store instance is bound to exactly one session.
///
/// Counters never decrease except via [`reset`](MessageStore::reset) or an
/// explicit `set_*`. The remote counter's increment is conditional-
/// initializing: unset becomes 1, otherwise it increments.
#[allow(async_fn_in_trait)]
pub trait MessageStore {
    async fn get_local(&mut self) -> Result<SeqNum, StoreError>;
    async fn get_remote(&mut self) -> Result<SeqNum, StoreError>;

    async fn incr_local(&mut self) -> Result<SeqNum, StoreError>;
    async fn incr_remote(&mut self) -> Result<SeqNum, StoreError>;

    async fn set_local(&mut self, seq_num: SeqNum) -> Result<(), StoreError>;
    async fn set_remote(&mut self, seq_num: SeqNum) -> Result<(), StoreError>;

    /// Persists an encoded sent message under `seq_num`, returning its
    /// storage key. A conflicting `seq_num` is dropped silently (duplicates
    /// are not re-indexed).
    async fn store_sent(&mut self, seq_num: SeqNum, encoded: Vec<u8>) -> Result<Uid, StoreError>;

    /// Persists an encoded received message under `seq_num`.
    async fn store_received(&mut self, seq_num: SeqNum, encoded: Vec<u8>) -> Result<Uid, StoreError>;

    async fn get_sent(
        &mut self,
        range: RangeInclusive<SeqNum>,
        limit: Option<usize>,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        self.get_msgs(Direction::Sent, range, limit, SortOrder::Ascending).await
    }

    async fn get_received(
        &mut self,
        range: RangeInclusive<SeqNum>,
        limit: Option<usize>,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        self.get_msgs(Direction::Received, range, limit, SortOrder::Ascending).await
    }

    async fn get_msgs(
        &mut self,
        direction: Direction,
        range: RangeInclusive<SeqNum>,
        limit: Option<usize>,
        order: SortOrder,
    ) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Deletes all message and index entries for this session; sets
    /// `local = 1`, `remote = 2` (the reset handshake's own Logon already
    /// crossed the counters).
    async fn reset(&mut self) -> Result<(), StoreError>;

    async fn close(&mut self) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Counters {
    local: Option<SeqNum>,
    remote: Option<SeqNum>,
}

/// Process-local, `BTreeMap`-indexed store. Default backend; data does not
/// survive a process restart.
#[derive(Default)]
pub struct InMemoryStore {
    counters: Counters,
    sent: BTreeMap<SeqNum, Vec<u8>>,
    received: BTreeMap<SeqNum, Vec<u8>>,
}

impl InMemoryStore {
    pub fn new() -> InMemoryStore {
        InMemoryStore::default()
    }

    fn index(&self, direction: Direction) -> &BTreeMap<SeqNum, Vec<u8>> {
        match direction {
            Direction::Sent => &self.sent,
            Direction::Received => &self.received,
        }
    }
}

impl MessageStore for InMemoryStore {
    async fn get_local(&mut self) -> Result<SeqNum, StoreError> {
        Ok(*self.counters.local.get_or_insert(1))
    }

    async fn get_remote(&mut self) -> Result<SeqNum, StoreError> {
        Ok(*self.counters.remote.get_or_insert(1))
    }

    async fn incr_local(&mut self) -> Result<SeqNum, StoreError> {
        let next = self.counters.local.map_or(1, |n| n + 1);
        self.counters.local = Some(next);
        Ok(next)
    }

    async fn incr_remote(&mut self) -> Result<SeqNum, StoreError> {
        let next = self.counters.remote.map_or(1, |n| n + 1);
        self.counters.remote = Some(next);
        Ok(next)
    }

    async fn set_local(&mut self, seq_num: SeqNum) -> Result<(), StoreError> {
        self.counters.local = Some(seq_num);
        Ok(())
    }

    async fn set_remote(&mut self, seq_num: SeqNum) -> Result<(), StoreError> {
        self.counters.remote = Some(seq_num);
        Ok(())
    }

    async fn store_sent(&mut self, seq_num: SeqNum, encoded: Vec<u8>) -> Result<Uid, StoreError> {
        self.sent.entry(seq_num).or_insert(encoded);
        Ok(Uid::new(seq_num as u64))
    }

    async fn store_received(&mut self, seq_num: SeqNum, encoded: Vec<u8>) -> Result<Uid, StoreError> {
        self.received.entry(seq_num).or_insert(encoded);
        Ok(Uid::new(seq_num as u64))
    }

    async fn get_msgs(
        &mut self,
        direction: Direction,
        range: RangeInclusive<SeqNum>,
        limit: Option<usize>,
        order: SortOrder,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let index = self.index(direction);
        let mut items: Vec<Vec<u8>> = index.range(range).map(|(_, v)| v.clone()).collect();
        if order == SortOrder::Descending {
            items.reverse();
        }
        if let Some(limit) = limit {
            items.truncate(limit);
        }
        Ok(items)
    }

    async fn reset(&mut self) -> Result<(), StoreError> {
        self.sent.clear();
        self.received.clear();
        self.counters.local = Some(1);
        self.counters.remote = Some(2);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Redis-backed store. Keys are prefixed with the session id so multiple
/// sessions can share one Redis instance without collision.
#[cfg(feature = "redis-store")]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
    prefix: String,
}

#[cfg(feature = "redis-store")]
impl RedisStore {
    pub async fn connect(host: &str, port: u16, prefix: String) -> Result<RedisStore, StoreError> {
        let client = redis::Client::open(format!("redis://{host}:{port}"))?;
        let conn = client.get_connection_manager().await?;
        Ok(RedisStore { conn, prefix })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn msg_key(&self, direction: Direction) -> String {
        match direction {
            Direction::Sent => self.key("sent"),
            Direction::Received => self.key("received"),
        }
    }
}

#[cfg(feature = "redis-store")]
impl MessageStore for RedisStore {
    async fn get_local(&mut self) -> Result<SeqNum, StoreError> {
        use redis::AsyncCommands;
        let key = self.key("local");
        match self.conn.get::<_, Option<SeqNum>>(&key).await? {
            Some(n) => Ok(n),
            None => {
                self.conn.set::<_, _, ()>(&key, 1).await?;
                Ok(1)
            }
        }
    }

    async fn get_remote(&mut self) -> Result<SeqNum, StoreError> {
        use redis::AsyncCommands;
        let key = self.key("remote");
        match self.conn.get::<_, Option<SeqNum>>(&key).await? {
            Some(n) => Ok(n),
            None => {
                self.conn.set::<_, _, ()>(&key, 1).await?;
                Ok(1)
            }
        }
    }

    async fn incr_local(&mut self) -> Result<SeqNum, StoreError> {
        use redis::AsyncCommands;
        self.get_local().await?;
        let key = self.key("local");
        Ok(self.conn.incr(&key, 1).await?)
    }

    async fn incr_remote(&mut self) -> Result<SeqNum, StoreError> {
        use redis::AsyncCommands;
        self.get_remote().await?;
        let key = self.key("remote");
        Ok(self.conn.incr(&key, 1).await?)
    }

    async fn set_local(&mut self, seq_num: SeqNum) -> Result<(), StoreError> {
        use redis::AsyncCommands;
        let key = self.key("local");
        Ok(self.conn.set(&key, seq_num).await?)
    }

    async fn set_remote(&mut self, seq_num: SeqNum) -> Result<(), StoreError> {
        use redis::AsyncCommands;
        let key = self.key("remote");
        Ok(self.conn.set(&key, seq_num).await?)
    }

    async fn store_sent(&mut self, seq_num: SeqNum, encoded: Vec<u8>) -> Result<Uid, StoreError> {
        use redis::AsyncCommands;
        let key = self.msg_key(Direction::Sent);
        let _: () = self
            .conn
            .hset_nx(&key, seq_num, encoded)
            .await?;
        Ok(Uid::new(seq_num as u64))
    }

    async fn store_received(&mut self, seq_num: SeqNum, encoded: Vec<u8>) -> Result<Uid, StoreError> {
        use redis::AsyncCommands;
        let key = self.msg_key(Direction::Received);
        let _: () = self
            .conn
            .hset_nx(&key, seq_num, encoded)
            .await?;
        Ok(Uid::new(seq_num as u64))
    }

    async fn get_msgs(
        &mut self,
        direction: Direction,
        range: RangeInclusive<SeqNum>,
        limit: Option<usize>,
        order: SortOrder,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        use redis::AsyncCommands;
        let key = self.msg_key(direction);
        let all: std::collections::HashMap<SeqNum, Vec<u8>> = self.conn.hgetall(&key).await?;
        let mut items: Vec<(SeqNum, Vec<u8>)> =
            all.into_iter().filter(|(n, _)| range.contains(n)).collect();
        items.sort_by_key(|(n, _)| *n);
        if order == SortOrder::Descending {
            items.reverse();
        }
        let mut items: Vec<Vec<u8>> = items.into_iter().map(|(_, v)| v).collect();
        if let Some(limit) = limit {
            items.truncate(limit);
        }
        Ok(items)
    }

    async fn reset(&mut self) -> Result<(), StoreError> {
        use redis::AsyncCommands;
        let _: () = self.conn.del(self.msg_key(Direction::Sent)).await?;
        let _: () = self.conn.del(self.msg_key(Direction::Received)).await?;
        self.conn.set::<_, _, ()>(self.key("local"), 1).await?;
        self.conn.set::<_, _, ()>(self.key("remote"), 2).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_initialize_to_one() {
        let mut store = InMemoryStore::new();
        assert_eq!(store.get_local().await.unwrap(), 1);
        assert_eq!(store.get_remote().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn incr_is_conditional_initializing() {
        let mut store = InMemoryStore::new();
        assert_eq!(store.incr_remote().await.unwrap(), 1);
        assert_eq!(store.incr_remote().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reset_crosses_counters_and_clears_messages() {
        let mut store = InMemoryStore::new();
        store.store_sent(1, b"logon".to_vec()).await.unwrap();
        store.set_local(5).await.unwrap();
        store.set_remote(7).await.unwrap();

        store.reset().await.unwrap();

        assert_eq!(store.get_local().await.unwrap(), 1);
        assert_eq!(store.get_remote().await.unwrap(), 2);
        assert!(store.get_sent(1..=SEQ_NUM_INFINITY, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_seq_num_keeps_first_write() {
        let mut store = InMemoryStore::new();
        store.store_sent(1, b"first".to_vec()).await.unwrap();
        store.store_sent(1, b"second".to_vec()).await.unwrap();
        let msgs = store.get_sent(1..=1, None).await.unwrap();
        assert_eq!(msgs, vec![b"first".to_vec()]);
    }

    #[tokio::test]
    async fn range_query_respects_limit_and_order() {
        let mut store = InMemoryStore::new();
        for n in 1..=5 {
            store.store_received(n, vec![n as u8]).await.unwrap();
        }
        let asc = store.get_received(1..=5, Some(2)).await.unwrap();
        assert_eq!(asc, vec![vec![1], vec![2]]);

        let desc = store
            .get_msgs(Direction::Received, 1..=5, None, SortOrder::Descending)
            .await
            .unwrap();
        assert_eq!(desc, vec![vec![5], vec![4], vec![3], vec![2], vec![1]]);
    }
}
