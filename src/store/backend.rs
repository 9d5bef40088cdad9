use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
#[cfg(test)]
use mockall::automock;

use super::WriteBatch;
use crate::ConnectionRole;
use crate::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Expiry and existence conditions for SET
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Expiry, millisecond precision
    pub ttl: Option<Duration>,
    /// Only set if the key does not exist
    pub nx: bool,
    /// Only set if the key already exists
    pub xx: bool,
}

impl SetOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Default::default()
        }
    }

    pub fn nx() -> Self {
        Self {
            nx: true,
            ..Default::default()
        }
    }

    pub fn xx() -> Self {
        Self {
            xx: true,
            ..Default::default()
        }
    }
}

/// A message received on a pattern subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// Pattern the channel matched
    pub pattern: Option<String>,
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Per-command result of a batch execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Ok,
    Int(i64),
    Data(Vec<u8>),
}

/// Wire seam between the store client and a Redis-protocol service.
///
/// Every handle is bound to one logical connection and reports it in its
/// errors.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    fn role(&self) -> ConnectionRole;

    async fn get(
        &self,
        key: &str,
    ) -> StoreResult<Option<Vec<u8>>>;

    async fn mget(
        &self,
        keys: &[String],
    ) -> StoreResult<Vec<Option<Vec<u8>>>>;

    /// `false` when an NX/XX condition prevented the write
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        options: SetOptions,
    ) -> StoreResult<bool>;

    async fn del(
        &self,
        keys: &[String],
    ) -> StoreResult<u64>;

    async fn exists(
        &self,
        keys: &[String],
    ) -> StoreResult<u64>;

    async fn rename(
        &self,
        from: &str,
        to: &str,
    ) -> StoreResult<()>;

    async fn hset(
        &self,
        key: &str,
        fields: Vec<(String, Vec<u8>)>,
    ) -> StoreResult<u64>;

    async fn hget(
        &self,
        key: &str,
        field: &str,
    ) -> StoreResult<Option<Vec<u8>>>;

    async fn hgetall(
        &self,
        key: &str,
    ) -> StoreResult<Vec<(String, Vec<u8>)>>;

    async fn hdel(
        &self,
        key: &str,
        fields: &[String],
    ) -> StoreResult<u64>;

    async fn rpush(
        &self,
        key: &str,
        values: Vec<Vec<u8>>,
    ) -> StoreResult<u64>;

    async fn lpop(
        &self,
        key: &str,
    ) -> StoreResult<Option<Vec<u8>>>;

    async fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> StoreResult<Vec<Vec<u8>>>;

    /// Full SCAN iteration for `pattern`
    async fn scan(
        &self,
        pattern: &str,
        count: usize,
    ) -> StoreResult<Vec<String>>;

    async fn zadd(
        &self,
        key: &str,
        member: &str,
        score: f64,
        nx: bool,
    ) -> StoreResult<bool>;

    async fn zscore(
        &self,
        key: &str,
        member: &str,
    ) -> StoreResult<Option<f64>>;

    /// Members with scores by rank, ascending
    async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> StoreResult<Vec<(String, f64)>>;

    /// Members with scores in `[min, max]`, ascending
    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StoreResult<Vec<(String, f64)>>;

    async fn zrem(
        &self,
        key: &str,
        members: &[String],
    ) -> StoreResult<u64>;

    async fn publish(
        &self,
        channel: &str,
        message: Vec<u8>,
    ) -> StoreResult<u64>;

    /// SET NX PX with an owner token
    async fn lock_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Deletes the key only when it still holds `token`
    async fn lock_release(
        &self,
        key: &str,
        token: &str,
    ) -> StoreResult<bool>;

    /// Adds `ttl` to the remaining lease, or resets the lease to `ttl` when
    /// `replace` is set. Only when the key still holds `token`.
    async fn lock_extend(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
        replace: bool,
    ) -> StoreResult<bool>;

    /// Current owner token and remaining lease
    async fn lock_owner(
        &self,
        key: &str,
    ) -> StoreResult<Option<(String, Option<Duration>)>>;

    /// Runs a batch as one pipeline, inside MULTI/EXEC when atomic
    async fn execute(
        &self,
        batch: WriteBatch,
    ) -> StoreResult<Vec<Reply>>;

    /// Opens a dedicated subscription for `patterns`. The stream ends when
    /// the connection is lost.
    async fn psubscribe(
        &self,
        patterns: Vec<String>,
    ) -> StoreResult<BoxStream<'static, PubSubMessage>>;
}
