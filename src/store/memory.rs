//! In-process Redis-protocol emulation.
//!
//! Supports the command subset used by the store client and locks, lazy key
//! expiry on the tokio clock and keyspace notifications on
//! `__keyspace@0__:<key>`. All logical connections of a context may share
//! one instance through `handle`.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;
use tracing::warn;

use super::BatchOp;
use super::KvBackend;
use super::PubSubMessage;
use super::Reply;
use super::SetOptions;
use super::StoreResult;
use super::WriteBatch;
use crate::codec::glob::glob_match;
use crate::constants::KEYSPACE_PREFIX;
use crate::ConnectionRole;
use crate::StoreError;

const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";
const NO_SUCH_KEY: &str = "ERR no such key";
const EVENT_CAPACITY: usize = 1024;

type KsResult<T> = std::result::Result<T, &'static str>;
type Events = Vec<(String, &'static str)>;

#[derive(Debug, Clone)]
enum Entry {
    Str(Vec<u8>),
    Hash(BTreeMap<String, Vec<u8>>),
    List(VecDeque<Vec<u8>>),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Slot {
    entry: Entry,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Keyspace {
    slots: HashMap<String, Slot>,
}

impl Keyspace {
    fn purge(
        &mut self,
        key: &str,
        events: &mut Events,
    ) {
        let expired = matches!(
            self.slots.get(key),
            Some(Slot { expires_at: Some(at), .. }) if *at <= Instant::now()
        );
        if expired {
            self.slots.remove(key);
            events.push((key.to_string(), "expired"));
        }
    }

    fn purge_all(
        &mut self,
        events: &mut Events,
    ) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.expires_at.is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.slots.remove(&key);
            events.push((key, "expired"));
        }
    }

    fn live(
        &mut self,
        key: &str,
        events: &mut Events,
    ) -> Option<&mut Slot> {
        self.purge(key, events);
        self.slots.get_mut(key)
    }

    fn get(
        &mut self,
        key: &str,
        events: &mut Events,
    ) -> KsResult<Option<Vec<u8>>> {
        match self.live(key, events) {
            None => Ok(None),
            Some(Slot {
                entry: Entry::Str(v), ..
            }) => Ok(Some(v.clone())),
            Some(_) => Err(WRONG_TYPE),
        }
    }

    fn set(
        &mut self,
        key: &str,
        value: Vec<u8>,
        options: SetOptions,
        events: &mut Events,
    ) -> bool {
        let exists = self.live(key, events).is_some();
        if (options.nx && exists) || (options.xx && !exists) {
            return false;
        }
        self.slots.insert(
            key.to_string(),
            Slot {
                entry: Entry::Str(value),
                expires_at: options.ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        events.push((key.to_string(), "set"));
        true
    }

    fn del(
        &mut self,
        keys: &[String],
        events: &mut Events,
    ) -> u64 {
        let mut removed = 0;
        for key in keys {
            self.purge(key, events);
            if self.slots.remove(key).is_some() {
                removed += 1;
                events.push((key.clone(), "del"));
            }
        }
        removed
    }

    fn rename(
        &mut self,
        from: &str,
        to: &str,
        events: &mut Events,
    ) -> KsResult<()> {
        self.purge(from, events);
        let slot = self.slots.remove(from).ok_or(NO_SUCH_KEY)?;
        self.slots.insert(to.to_string(), slot);
        events.push((from.to_string(), "rename_from"));
        events.push((to.to_string(), "rename_to"));
        Ok(())
    }

    fn hash_mut(
        &mut self,
        key: &str,
        events: &mut Events,
    ) -> KsResult<&mut BTreeMap<String, Vec<u8>>> {
        self.purge(key, events);
        let slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            entry: Entry::Hash(BTreeMap::new()),
            expires_at: None,
        });
        match &mut slot.entry {
            Entry::Hash(map) => Ok(map),
            _ => Err(WRONG_TYPE),
        }
    }

    fn hset(
        &mut self,
        key: &str,
        fields: Vec<(String, Vec<u8>)>,
        events: &mut Events,
    ) -> KsResult<u64> {
        let map = self.hash_mut(key, events)?;
        let mut added = 0;
        for (field, value) in fields {
            if map.insert(field, value).is_none() {
                added += 1;
            }
        }
        let empty = map.is_empty();
        if empty {
            self.slots.remove(key);
        } else {
            events.push((key.to_string(), "hset"));
        }
        Ok(added)
    }

    fn hash(
        &mut self,
        key: &str,
        events: &mut Events,
    ) -> KsResult<Option<&BTreeMap<String, Vec<u8>>>> {
        match self.live(key, events) {
            None => Ok(None),
            Some(Slot {
                entry: Entry::Hash(map), ..
            }) => Ok(Some(map)),
            Some(_) => Err(WRONG_TYPE),
        }
    }

    fn hdel(
        &mut self,
        key: &str,
        fields: &[String],
        events: &mut Events,
    ) -> KsResult<u64> {
        let Some(Slot {
            entry: Entry::Hash(map), ..
        }) = self.live(key, events)
        else {
            return match self.slots.get(key) {
                None => Ok(0),
                Some(_) => Err(WRONG_TYPE),
            };
        };
        let removed = fields.iter().filter(|f| map.remove(*f).is_some()).count() as u64;
        let empty = map.is_empty();
        if removed > 0 {
            events.push((key.to_string(), "hdel"));
        }
        if empty {
            self.slots.remove(key);
            events.push((key.to_string(), "del"));
        }
        Ok(removed)
    }

    fn rpush(
        &mut self,
        key: &str,
        values: Vec<Vec<u8>>,
        events: &mut Events,
    ) -> KsResult<u64> {
        self.purge(key, events);
        let slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            entry: Entry::List(VecDeque::new()),
            expires_at: None,
        });
        let Entry::List(list) = &mut slot.entry else {
            return Err(WRONG_TYPE);
        };
        list.extend(values);
        let len = list.len() as u64;
        events.push((key.to_string(), "rpush"));
        Ok(len)
    }

    fn lpop(
        &mut self,
        key: &str,
        events: &mut Events,
    ) -> KsResult<Option<Vec<u8>>> {
        let Some(slot) = self.live(key, events) else {
            return Ok(None);
        };
        let Entry::List(list) = &mut slot.entry else {
            return Err(WRONG_TYPE);
        };
        let value = list.pop_front();
        let empty = list.is_empty();
        if value.is_some() {
            events.push((key.to_string(), "lpop"));
        }
        if empty {
            self.slots.remove(key);
            events.push((key.to_string(), "del"));
        }
        Ok(value)
    }

    fn lrange(
        &mut self,
        key: &str,
        start: i64,
        stop: i64,
        events: &mut Events,
    ) -> KsResult<Vec<Vec<u8>>> {
        match self.live(key, events) {
            None => Ok(Vec::new()),
            Some(Slot {
                entry: Entry::List(list), ..
            }) => {
                let (from, to) = rank_window(list.len(), start, stop);
                Ok(list.iter().skip(from).take(to.saturating_sub(from)).cloned().collect())
            }
            Some(_) => Err(WRONG_TYPE),
        }
    }

    fn zset(
        &mut self,
        key: &str,
        events: &mut Events,
    ) -> KsResult<Vec<(String, f64)>> {
        match self.live(key, events) {
            None => Ok(Vec::new()),
            Some(Slot {
                entry: Entry::ZSet(set), ..
            }) => {
                let mut members: Vec<(String, f64)> = set.iter().map(|(m, s)| (m.clone(), *s)).collect();
                members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                Ok(members)
            }
            Some(_) => Err(WRONG_TYPE),
        }
    }

    fn zadd(
        &mut self,
        key: &str,
        member: &str,
        score: f64,
        nx: bool,
        events: &mut Events,
    ) -> KsResult<bool> {
        self.purge(key, events);
        let slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            entry: Entry::ZSet(HashMap::new()),
            expires_at: None,
        });
        let Entry::ZSet(set) = &mut slot.entry else {
            return Err(WRONG_TYPE);
        };
        let added = match set.get_mut(member) {
            Some(_) if nx => return Ok(false),
            Some(existing) => {
                *existing = score;
                false
            }
            None => {
                set.insert(member.to_string(), score);
                true
            }
        };
        events.push((key.to_string(), "zadd"));
        Ok(added)
    }

    fn zrem(
        &mut self,
        key: &str,
        members: &[String],
        events: &mut Events,
    ) -> KsResult<u64> {
        let Some(slot) = self.live(key, events) else {
            return Ok(0);
        };
        let Entry::ZSet(set) = &mut slot.entry else {
            return Err(WRONG_TYPE);
        };
        let removed = members.iter().filter(|m| set.remove(*m).is_some()).count() as u64;
        let empty = set.is_empty();
        if removed > 0 {
            events.push((key.to_string(), "zrem"));
        }
        if empty {
            self.slots.remove(key);
            events.push((key.to_string(), "del"));
        }
        Ok(removed)
    }

    fn apply(
        &mut self,
        op: BatchOp,
        events: &mut Events,
    ) -> KsResult<Reply> {
        let reply = match op {
            BatchOp::Set { key, value, options } => {
                if self.set(&key, value, options, events) {
                    Reply::Ok
                } else {
                    Reply::Nil
                }
            }
            BatchOp::Del { keys } => Reply::Int(self.del(&keys, events) as i64),
            BatchOp::Rename { from, to } => {
                self.rename(&from, &to, events)?;
                Reply::Ok
            }
            BatchOp::HSet { key, fields } => Reply::Int(self.hset(&key, fields, events)? as i64),
            BatchOp::HDel { key, fields } => Reply::Int(self.hdel(&key, &fields, events)? as i64),
            BatchOp::RPush { key, values } => Reply::Int(self.rpush(&key, values, events)? as i64),
            BatchOp::ZAdd {
                key,
                member,
                score,
                nx,
            } => Reply::Int(self.zadd(&key, &member, score, nx, events)? as i64),
            BatchOp::ZRem { key, members } => Reply::Int(self.zrem(&key, &members, events)? as i64),
            // Delivered by the backend once the keyspace lock is released
            BatchOp::Publish { .. } => Reply::Int(0),
        };
        Ok(reply)
    }
}

/// Redis rank window: negative indices count from the end, `stop` inclusive.
fn rank_window(
    len: usize,
    start: i64,
    stop: i64,
) -> (usize, usize) {
    let len = len as i64;
    let norm = |i: i64| if i < 0 { (len + i).max(0) } else { i };
    let from = norm(start).min(len);
    let to = (norm(stop) + 1).min(len);
    if to <= from {
        return (0, 0);
    }
    (from as usize, to as usize)
}

struct Shared {
    keyspace: Mutex<Keyspace>,
    events: broadcast::Sender<PubSubMessage>,
}

/// In-process store. Clones share the same data.
#[derive(Clone)]
pub struct InMemoryBackend {
    shared: Arc<Shared>,
    role: ConnectionRole,
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend").field("role", &self.role).finish()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                keyspace: Mutex::new(Keyspace::default()),
                events,
            }),
            role: ConnectionRole::Local,
        }
    }

    /// Another handle on the same data, reporting `role` in errors
    pub fn handle(
        &self,
        role: ConnectionRole,
    ) -> Self {
        Self {
            shared: self.shared.clone(),
            role,
        }
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let mut events = Vec::new();
        let len = {
            let mut keyspace = self.shared.keyspace.lock();
            keyspace.purge_all(&mut events);
            keyspace.slots.len()
        };
        self.notify(events);
        len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_keyspace<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut Keyspace, &mut Events) -> KsResult<T>,
    ) -> StoreResult<T> {
        let mut events = Vec::new();
        let result = {
            let mut keyspace = self.shared.keyspace.lock();
            f(&mut keyspace, &mut events)
        };
        self.notify(events);
        result.map_err(|reason| StoreError::Command {
            connection: self.role,
            operation,
            reason: reason.to_string(),
        })
    }

    fn notify(
        &self,
        events: Events,
    ) {
        for (key, op) in events {
            trace!(%key, op, "keyspace event");
            let _ = self.shared.events.send(PubSubMessage {
                pattern: None,
                channel: format!("{KEYSPACE_PREFIX}0__:{key}"),
                payload: op.as_bytes().to_vec(),
            });
        }
    }

    fn send_published(
        &self,
        channel: String,
        message: Vec<u8>,
    ) -> u64 {
        let receivers = self.shared.events.receiver_count() as u64;
        let _ = self.shared.events.send(PubSubMessage {
            pattern: None,
            channel,
            payload: message,
        });
        receivers
    }
}

#[async_trait]
impl KvBackend for InMemoryBackend {
    fn role(&self) -> ConnectionRole {
        self.role
    }

    async fn get(
        &self,
        key: &str,
    ) -> StoreResult<Option<Vec<u8>>> {
        self.with_keyspace("GET", |ks, ev| ks.get(key, ev))
    }

    async fn mget(
        &self,
        keys: &[String],
    ) -> StoreResult<Vec<Option<Vec<u8>>>> {
        self.with_keyspace("MGET", |ks, ev| Ok(keys.iter().map(|k| ks.get(k, ev).ok().flatten()).collect()))
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        options: SetOptions,
    ) -> StoreResult<bool> {
        self.with_keyspace("SET", |ks, ev| Ok(ks.set(key, value, options, ev)))
    }

    async fn del(
        &self,
        keys: &[String],
    ) -> StoreResult<u64> {
        self.with_keyspace("DEL", |ks, ev| Ok(ks.del(keys, ev)))
    }

    async fn exists(
        &self,
        keys: &[String],
    ) -> StoreResult<u64> {
        self.with_keyspace("EXISTS", |ks, ev| {
            Ok(keys.iter().filter(|k| ks.live(k, ev).is_some()).count() as u64)
        })
    }

    async fn rename(
        &self,
        from: &str,
        to: &str,
    ) -> StoreResult<()> {
        self.with_keyspace("RENAME", |ks, ev| ks.rename(from, to, ev))
    }

    async fn hset(
        &self,
        key: &str,
        fields: Vec<(String, Vec<u8>)>,
    ) -> StoreResult<u64> {
        self.with_keyspace("HSET", |ks, ev| ks.hset(key, fields, ev))
    }

    async fn hget(
        &self,
        key: &str,
        field: &str,
    ) -> StoreResult<Option<Vec<u8>>> {
        self.with_keyspace("HGET", |ks, ev| Ok(ks.hash(key, ev)?.and_then(|m| m.get(field).cloned())))
    }

    async fn hgetall(
        &self,
        key: &str,
    ) -> StoreResult<Vec<(String, Vec<u8>)>> {
        self.with_keyspace("HGETALL", |ks, ev| {
            Ok(ks
                .hash(key, ev)?
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default())
        })
    }

    async fn hdel(
        &self,
        key: &str,
        fields: &[String],
    ) -> StoreResult<u64> {
        self.with_keyspace("HDEL", |ks, ev| ks.hdel(key, fields, ev))
    }

    async fn rpush(
        &self,
        key: &str,
        values: Vec<Vec<u8>>,
    ) -> StoreResult<u64> {
        self.with_keyspace("RPUSH", |ks, ev| ks.rpush(key, values, ev))
    }

    async fn lpop(
        &self,
        key: &str,
    ) -> StoreResult<Option<Vec<u8>>> {
        self.with_keyspace("LPOP", |ks, ev| ks.lpop(key, ev))
    }

    async fn lrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> StoreResult<Vec<Vec<u8>>> {
        self.with_keyspace("LRANGE", |ks, ev| ks.lrange(key, start, stop, ev))
    }

    async fn scan(
        &self,
        pattern: &str,
        _count: usize,
    ) -> StoreResult<Vec<String>> {
        self.with_keyspace("SCAN", |ks, ev| {
            ks.purge_all(ev);
            Ok(ks.slots.keys().filter(|k| glob_match(pattern, k)).cloned().collect())
        })
    }

    async fn zadd(
        &self,
        key: &str,
        member: &str,
        score: f64,
        nx: bool,
    ) -> StoreResult<bool> {
        self.with_keyspace("ZADD", |ks, ev| ks.zadd(key, member, score, nx, ev))
    }

    async fn zscore(
        &self,
        key: &str,
        member: &str,
    ) -> StoreResult<Option<f64>> {
        self.with_keyspace("ZSCORE", |ks, ev| {
            Ok(ks.zset(key, ev)?.into_iter().find(|(m, _)| m == member).map(|(_, s)| s))
        })
    }

    async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.with_keyspace("ZRANGE", |ks, ev| {
            let members = ks.zset(key, ev)?;
            let (from, to) = rank_window(members.len(), start, stop);
            Ok(members.into_iter().skip(from).take(to.saturating_sub(from)).collect())
        })
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.with_keyspace("ZRANGEBYSCORE", |ks, ev| {
            Ok(ks
                .zset(key, ev)?
                .into_iter()
                .filter(|(_, s)| *s >= min && *s <= max)
                .collect())
        })
    }

    async fn zrem(
        &self,
        key: &str,
        members: &[String],
    ) -> StoreResult<u64> {
        self.with_keyspace("ZREM", |ks, ev| ks.zrem(key, members, ev))
    }

    async fn publish(
        &self,
        channel: &str,
        message: Vec<u8>,
    ) -> StoreResult<u64> {
        Ok(self.send_published(channel.to_string(), message))
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
        self.with_keyspace("LOCK ACQUIRE", |ks, ev| {
            Ok(ks.set(key, token.as_bytes().to_vec(), options, ev))
        })
    }

    async fn lock_release(
        &self,
        key: &str,
        token: &str,
    ) -> StoreResult<bool> {
        self.with_keyspace("LOCK RELEASE", |ks, ev| {
            if ks.get(key, ev)?.as_deref() != Some(token.as_bytes()) {
                return Ok(false);
            }
            Ok(ks.del(&[key.to_string()], ev) == 1)
        })
    }

    async fn lock_extend(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
        replace: bool,
    ) -> StoreResult<bool> {
        self.with_keyspace("LOCK EXTEND", |ks, ev| {
            if ks.get(key, ev)?.as_deref() != Some(token.as_bytes()) {
                return Ok(false);
            }
            let Some(slot) = ks.slots.get_mut(key) else {
                return Ok(false);
            };
            let now = Instant::now();
            slot.expires_at = Some(match slot.expires_at {
                Some(at) if !replace => at.max(now) + ttl,
                _ => now + ttl,
            });
            ev.push((key.to_string(), "expire"));
            Ok(true)
        })
    }

    async fn lock_owner(
        &self,
        key: &str,
    ) -> StoreResult<Option<(String, Option<Duration>)>> {
        self.with_keyspace("LOCK OWNER", |ks, ev| {
            let Some(token) = ks.get(key, ev)? else {
                return Ok(None);
            };
            let remaining = ks
                .slots
                .get(key)
                .and_then(|slot| slot.expires_at)
                .map(|at| at.saturating_duration_since(Instant::now()));
            Ok(Some((String::from_utf8_lossy(&token).into_owned(), remaining)))
        })
    }

    async fn execute(
        &self,
        batch: WriteBatch,
    ) -> StoreResult<Vec<Reply>> {
        let mut published = Vec::new();
        let replies = self.with_keyspace("EXEC", |ks, ev| {
            let mut replies = Vec::with_capacity(batch.len());
            for op in batch.into_ops() {
                if let BatchOp::Publish { channel, message } = &op {
                    published.push((channel.clone(), message.clone()));
                }
                replies.push(ks.apply(op, ev)?);
            }
            Ok(replies)
        })?;
        for (channel, message) in published {
            self.send_published(channel, message);
        }
        Ok(replies)
    }

    async fn psubscribe(
        &self,
        patterns: Vec<String>,
    ) -> StoreResult<BoxStream<'static, PubSubMessage>> {
        let receiver = self.shared.events.subscribe();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| {
            let matched = match item {
                Ok(mut message) => patterns.iter().find(|p| glob_match(p, &message.channel)).map(|p| {
                    message.pattern = Some(p.clone());
                    message
                }),
                Err(e) => {
                    warn!("in-memory subscriber lagged: {:?}", e);
                    None
                }
            };
            futures::future::ready(matched)
        });
        Ok(stream.boxed())
    }
}
