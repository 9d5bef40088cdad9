use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::Cmd;
use redis::FromRedisValue;
use redis::RedisError;
use redis::Script;
use tracing::debug;
use tracing::warn;

use super::BatchOp;
use super::KvBackend;
use super::PubSubMessage;
use super::RedisPool;
use super::Reply;
use super::SetOptions;
use super::StoreResult;
use super::WriteBatch;
use crate::ConnectionRole;
use crate::EndpointConfig;
use crate::PoolConfig;
use crate::StoreError;

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
end
return 0
"#;

// ARGV: token, ttl ms, replace flag
const EXTEND_SCRIPT: &str = r#"
local token = redis.call('get', KEYS[1])
if not token or token ~= ARGV[1] then
    return 0
end
local remaining = redis.call('pttl', KEYS[1])
if remaining < 0 then
    remaining = 0
end
local ttl = tonumber(ARGV[2])
if ARGV[3] == '0' then
    ttl = ttl + remaining
end
redis.call('pexpire', KEYS[1], ttl)
return 1
"#;

/// `KvBackend` over a Redis-protocol service
#[derive(Debug, Clone)]
pub struct RedisBackend {
    pool: Arc<RedisPool>,
}

impl RedisBackend {
    /// Creates the pool for `endpoint`. Connections are opened on demand.
    pub fn new(
        role: ConnectionRole,
        endpoint: &EndpointConfig,
        pool: &PoolConfig,
    ) -> StoreResult<Self> {
        if !endpoint.enabled {
            return Err(StoreError::Disabled(role));
        }
        Ok(Self {
            pool: RedisPool::new(role, endpoint, pool)?,
        })
    }

    pub fn pool(&self) -> &Arc<RedisPool> {
        &self.pool
    }

    pub fn close(&self) {
        self.pool.close();
    }

    async fn query<T: FromRedisValue>(
        &self,
        operation: &'static str,
        cmd: &Cmd,
    ) -> StoreResult<T> {
        let mut conn = self.pool.get().await?;
        match cmd.query_async(&mut *conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if is_connection_error(&e) {
                    conn.discard();
                }
                Err(map_error(self.role(), operation, e))
            }
        }
    }

    async fn invoke<T: FromRedisValue>(
        &self,
        operation: &'static str,
        script: &str,
        key: &str,
        args: &[String],
    ) -> StoreResult<T> {
        let script = Script::new(script);
        let mut invocation = script.key(key);
        for arg in args {
            invocation.arg(arg);
        }
        let mut conn = self.pool.get().await?;
        match invocation.invoke_async(&mut *conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if is_connection_error(&e) {
                    conn.discard();
                }
                Err(map_error(self.role(), operation, e))
            }
        }
    }
}

fn is_connection_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

fn map_error(
    role: ConnectionRole,
    operation: &'static str,
    e: RedisError,
) -> StoreError {
    if is_connection_error(&e) {
        warn!(%role, operation, "connection failure: {}", e);
        StoreError::connectivity(role, operation, e)
    } else {
        StoreError::Command {
            connection: role,
            operation,
            reason: e.to_string(),
        }
    }
}

fn set_cmd(
    key: &str,
    value: &[u8],
    options: SetOptions,
) -> Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    if let Some(ttl) = options.ttl {
        cmd.arg("PX").arg(ttl.as_millis() as u64);
    }
    if options.nx {
        cmd.arg("NX");
    }
    if options.xx {
        cmd.arg("XX");
    }
    cmd
}

fn hset_cmd(
    key: &str,
    fields: &[(String, Vec<u8>)],
) -> Cmd {
    let mut cmd = redis::cmd("HSET");
    cmd.arg(key);
    for (field, value) in fields {
        cmd.arg(field).arg(value.as_slice());
    }
    cmd
}

fn zadd_cmd(
    key: &str,
    member: &str,
    score: f64,
    nx: bool,
) -> Cmd {
    let mut cmd = redis::cmd("ZADD");
    cmd.arg(key);
    if nx {
        cmd.arg("NX");
    }
    cmd.arg(score).arg(member);
    cmd
}

fn batch_cmd(op: &BatchOp) -> Cmd {
    match op {
        BatchOp::Set { key, value, options } => set_cmd(key, value, *options),
        BatchOp::Del { keys } => redis::cmd("DEL").arg(keys).clone(),
        BatchOp::Rename { from, to } => redis::cmd("RENAME").arg(from).arg(to).clone(),
        BatchOp::HSet { key, fields } => hset_cmd(key, fields),
        BatchOp::HDel { key, fields } => redis::cmd("HDEL").arg(key).arg(fields).clone(),
        BatchOp::RPush { key, values } => redis::cmd("RPUSH").arg(key).arg(values).clone(),
        BatchOp::ZAdd {
            key,
            member,
            score,
            nx,
        } => zadd_cmd(key, member, *score, *nx),
        BatchOp::ZRem { key, members } => redis::cmd("ZREM").arg(key).arg(members).clone(),
        BatchOp::Publish { channel, message } => redis::cmd("PUBLISH").arg(channel).arg(message.as_slice()).clone(),
    }
}

fn to_reply(value: redis::Value) -> Reply {
    match value {
        redis::Value::Nil => Reply::Nil,
        redis::Value::Int(i) => Reply::Int(i),
        redis::Value::Data(bytes) => Reply::Data(bytes),
        redis::Value::Okay | redis::Value::Status(_) | redis::Value::Bulk(_) => Reply::Ok,
    }
}

fn score_arg(score: f64) -> String {
    if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if score == f64::INFINITY {
        "+inf".to_string()
    } else {
        score.to_string()
    }
}

/// Pairs a flat `member score member score ...` reply
fn with_scores(flat: Vec<String>) -> Vec<(String, f64)> {
    flat.chunks_exact(2)
        .filter_map(|pair| pair[1].parse::<f64>().ok().map(|score| (pair[0].clone(), score)))
        .collect()
}

#[async_trait]
impl KvBackend for RedisBackend {
    fn role(&self) -> ConnectionRole {
        self.pool.role()
    }

    async fn get(
        &self,
        key: &str,
    ) -> StoreResult<Option<Vec<u8>>> {
        self.query("GET", redis::cmd("GET").arg(key)).await
    }

    async fn mget(
        &self,
        keys: &[String],
    ) -> StoreResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.query("MGET", redis::cmd("MGET").arg(keys)).await
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        options: SetOptions,
    ) -> StoreResult<bool> {
        let reply: redis::Value = self.query("SET", &set_cmd(key, &value, options)).await?;
        Ok(reply != redis::Value::Nil)
    }

    async fn del(
        &self,
        keys: &[String],
    ) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.query("DEL", redis::cmd("DEL").arg(keys)).await
    }

    async fn exists(
        &self,
        keys: &[String],
    ) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.query("EXISTS", redis::cmd("EXISTS").arg(keys)).await
    }

    async fn rename(
        &self,
        from: &str,
        to: &str,
    ) -> StoreResult<()> {
        self.query("RENAME", redis::cmd("RENAME").arg(from).arg(to)).await
    }

    async fn hset(
        &self,
        key: &str,
        fields: Vec<(String, Vec<u8>)>,
    ) -> StoreResult<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        self.query("HSET", &hset_cmd(key, &fields)).await
    }

    async fn hget(
        &self,
        key: &str,
        field: &str,
    ) -> StoreResult<Option<Vec<u8>>> {
        self.query("HGET", redis::cmd("HGET").arg(key).arg(field)).await
    }

    async fn hgetall(
        &self,
        key: &str,
    ) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let flat: Vec<Vec<u8>> = self.query("HGETALL", redis::cmd("HGETALL").arg(key)).await?;
        Ok(flat
            .chunks_exact(2)
            .map(|pair| (String::from_utf8_lossy(&pair[0]).into_owned(), pair[1].clone()))
            .collect())
    }

    async fn hdel(
        &self,
        key: &str,
        fields: &[String],
    ) -> StoreResult<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        self.query("HDEL", redis::cmd("HDEL").arg(key).arg(fields)).await
    }

    async fn rpush(
        &self,
        key: &str,
        values: Vec<Vec<u8>>,
    ) -> StoreResult<u64> {
        if values.is_empty() {
            return Ok(0);
        }
        self.query("RPUSH", redis::cmd("RPUSH").arg(key).arg(values)).await
    }

    async fn lpop(
        &self,
        key: &str,
    ) -> StoreResult<Option<Vec<u8>>> {
        self.query("LPOP", redis::cmd("LPOP").arg(key)).await
    }

    async fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> StoreResult<Vec<Vec<u8>>> {
        self.query("LRANGE", redis::cmd("LRANGE").arg(key).arg(start).arg(stop))
            .await
    }

    async fn scan(
        &self,
        pattern: &str,
        count: usize,
    ) -> StoreResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let mut cmd = redis::cmd("SCAN");
        cmd.cursor_arg(0).arg("MATCH").arg(pattern).arg("COUNT").arg(count);
        let e = match cmd.iter_async::<String>(&mut *conn).await {
            Ok(mut iter) => {
                let mut keys = Vec::new();
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
                debug!(pattern, found = keys.len(), "scan complete");
                return Ok(keys);
            }
            Err(e) => e,
        };
        if is_connection_error(&e) {
            conn.discard();
        }
        Err(map_error(self.role(), "SCAN", e))
    }

    async fn zadd(
        &self,
        key: &str,
        member: &str,
        score: f64,
        nx: bool,
    ) -> StoreResult<bool> {
        let added: u64 = self.query("ZADD", &zadd_cmd(key, member, score, nx)).await?;
        Ok(added > 0)
    }

    async fn zscore(
        &self,
        key: &str,
        member: &str,
    ) -> StoreResult<Option<f64>> {
        self.query("ZSCORE", redis::cmd("ZSCORE").arg(key).arg(member)).await
    }

    async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> StoreResult<Vec<(String, f64)>> {
        let flat: Vec<String> = self
            .query(
                "ZRANGE",
                redis::cmd("ZRANGE").arg(key).arg(start).arg(stop).arg("WITHSCORES"),
            )
            .await?;
        Ok(with_scores(flat))
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StoreResult<Vec<(String, f64)>> {
        let flat: Vec<String> = self
            .query(
                "ZRANGEBYSCORE",
                redis::cmd("ZRANGEBYSCORE")
                    .arg(key)
                    .arg(score_arg(min))
                    .arg(score_arg(max))
                    .arg("WITHSCORES"),
            )
            .await?;
        Ok(with_scores(flat))
    }

    async fn zrem(
        &self,
        key: &str,
        members: &[String],
    ) -> StoreResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        self.query("ZREM", redis::cmd("ZREM").arg(key).arg(members)).await
    }

    async fn publish(
        &self,
        channel: &str,
        message: Vec<u8>,
    ) -> StoreResult<u64> {
        self.query("PUBLISH", redis::cmd("PUBLISH").arg(channel).arg(message))
            .await
    }

    async fn lock_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let options = SetOptions {
            ttl: Some(ttl),
            nx: true,
            xx: false,
        };
        let reply: redis::Value = self
            .query("LOCK ACQUIRE", &set_cmd(key, token.as_bytes(), options))
            .await?;
        Ok(reply != redis::Value::Nil)
    }

    async fn lock_release(
        &self,
        key: &str,
        token: &str,
    ) -> StoreResult<bool> {
        let removed: i64 = self
            .invoke("LOCK RELEASE", RELEASE_SCRIPT, key, &[token.to_string()])
            .await?;
        Ok(removed == 1)
    }

    async fn lock_extend(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
        replace: bool,
    ) -> StoreResult<bool> {
        let args = [
            token.to_string(),
            (ttl.as_millis() as u64).to_string(),
            if replace { "1" } else { "0" }.to_string(),
        ];
        let extended: i64 = self.invoke("LOCK EXTEND", EXTEND_SCRIPT, key, &args).await?;
        Ok(extended == 1)
    }

    async fn lock_owner(
        &self,
        key: &str,
    ) -> StoreResult<Option<(String, Option<Duration>)>> {
        let mut pipe = redis::pipe();
        pipe.cmd("GET").arg(key).cmd("PTTL").arg(key);
        let mut conn = self.pool.get().await?;
        let (token, pttl): (Option<String>, i64) = match pipe.query_async(&mut *conn).await {
            Ok(reply) => reply,
            Err(e) => {
                if is_connection_error(&e) {
                    conn.discard();
                }
                return Err(map_error(self.role(), "LOCK OWNER", e));
            }
        };
        let remaining = (pttl > 0).then(|| Duration::from_millis(pttl as u64));
        Ok(token.map(|t| (t, remaining)))
    }

    async fn execute(
        &self,
        batch: WriteBatch,
    ) -> StoreResult<Vec<Reply>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        if batch.is_atomic() {
            pipe.atomic();
        }
        for op in batch.ops() {
            pipe.add_command(batch_cmd(op));
        }
        let mut conn = self.pool.get().await?;
        let replies: Vec<redis::Value> = match pipe.query_async(&mut *conn).await {
            Ok(replies) => replies,
            Err(e) => {
                if is_connection_error(&e) {
                    conn.discard();
                }
                return Err(map_error(self.role(), "EXEC", e));
            }
        };
        debug!(commands = batch.len(), atomic = batch.is_atomic(), "batch executed");
        Ok(replies.into_iter().map(to_reply).collect())
    }

    async fn psubscribe(
        &self,
        patterns: Vec<String>,
    ) -> StoreResult<BoxStream<'static, PubSubMessage>> {
        let (mut pubsub, permit) = self.pool.subscribe().await?;
        for pattern in &patterns {
            pubsub
                .psubscribe(pattern)
                .await
                .map_err(|e| map_error(self.role(), "PSUBSCRIBE", e))?;
        }
        debug!(?patterns, "pattern subscription opened");

        let stream = pubsub.into_on_message().map(move |msg| {
            // Subscription slot is freed when the stream is dropped
            let _slot = &permit;
            PubSubMessage {
                pattern: msg.get_pattern().ok(),
                channel: msg.get_channel_name().to_string(),
                payload: msg.get_payload_bytes().to_vec(),
            }
        });
        Ok(stream.boxed())
    }
}
