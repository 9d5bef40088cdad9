//! Document-level operations over a `KvBackend`.
//!
//! Documents are turned into flat keys by the schema codec, search
//! documents into patterns by the query builder. Reads run against the
//! scope's read connection and are retried on connectivity failures; writes
//! go to the write connection exactly once.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::future::Future;

use tracing::debug;
use tracing::trace;

use super::BatchOp;
use super::KvBackend;
use super::Reply;
use super::ScopedBackends;
use super::SetOptions;
use super::StoreResult;
use super::WriteBatch;
use crate::codec::glob;
use crate::codec::value_codec;
use crate::codec::Document;
use crate::codec::KeyTriple;
use crate::codec::PathCodec;
use crate::codec::QueryBuilder;
use crate::codec::SearchPattern;
use crate::codec::Value;
use crate::constants::FIELD_SEPARATOR;
use crate::constants::ID_SEPARATOR;
use crate::constants::SCAN_COUNT;
use crate::constants::WILDCARD;
use crate::schema::TypeKind;
use crate::utils::async_task::task_with_timeout_and_exponential_backoff;
use crate::BackoffPolicy;
use crate::Error;
use crate::Result;
use crate::SchemaError;
use crate::StoreError;

#[derive(Debug, Clone)]
pub struct StoreClient {
    backends: ScopedBackends,
    query: QueryBuilder,
    retry: BackoffPolicy,
}

impl StoreClient {
    pub fn new(
        backends: ScopedBackends,
        query: QueryBuilder,
        retry: BackoffPolicy,
    ) -> Self {
        Self {
            backends,
            query,
            retry,
        }
    }

    pub fn codec(&self) -> &PathCodec {
        self.query.codec()
    }

    pub fn query_builder(&self) -> &QueryBuilder {
        &self.query
    }

    pub fn backends(&self) -> &ScopedBackends {
        &self.backends
    }

    async fn read<'a, P, F, Fut>(
        &'a self,
        task: F,
    ) -> Result<P>
    where
        F: Fn(&'a dyn KvBackend) -> Fut,
        Fut: Future<Output = StoreResult<P>>,
    {
        let backend = self.backends.read.as_ref();
        task_with_timeout_and_exponential_backoff(
            || {
                let fut = task(backend);
                async move { fut.await.map_err(Error::from) }
            },
            self.retry,
        )
        .await
    }

    // ---------------------------------------------------------------
    // Search

    /// Keys matching a search document, case-insensitively sorted
    pub async fn search(
        &self,
        pattern: &Document,
    ) -> Result<Vec<String>> {
        let patterns = self.query.patterns(pattern)?;
        self.search_patterns(&patterns).await
    }

    /// Exact patterns are checked with EXISTS, the rest are scanned.
    pub async fn search_patterns(
        &self,
        patterns: &[SearchPattern],
    ) -> Result<Vec<String>> {
        let mut found = BTreeSet::new();
        for pattern in patterns {
            match pattern {
                SearchPattern::Exact(key) => {
                    let keys = std::slice::from_ref(key);
                    if self.read(|b| b.exists(keys)).await? > 0 {
                        found.insert(key.clone());
                    }
                }
                other => {
                    let glob = other.as_glob();
                    found.extend(self.read(|b| b.scan(&glob, SCAN_COUNT)).await?);
                }
            }
        }
        trace!(patterns = patterns.len(), found = found.len(), "search complete");
        Ok(sort_keys(found))
    }

    /// Raw glob search: every key of the partial document is scanned with a
    /// trailing `*`.
    pub async fn search_wild(
        &self,
        pattern: &Document,
    ) -> Result<Vec<String>> {
        let mut found = BTreeSet::new();
        for key in self.exact_keys(pattern)? {
            let glob = if key.ends_with(WILDCARD) {
                key
            } else {
                format!("{key}{WILDCARD}")
            };
            found.extend(self.read(|b| b.scan(&glob, SCAN_COUNT)).await?);
        }
        Ok(sort_keys(found))
    }

    /// Structure of the keys matching the arguments, with empty leaf
    /// values, and the number of keys found
    pub async fn search_by_args(
        &self,
        scope: &str,
        args: &[(&str, &str)],
    ) -> Result<(Document, usize)> {
        let keys = self.keys_by_args(scope, args).await?;
        let count = keys.len();
        Ok((skeleton(keys)?, count))
    }

    async fn keys_by_args(
        &self,
        scope: &str,
        args: &[(&str, &str)],
    ) -> Result<Vec<String>> {
        let patterns = self.query.patterns_by_args(scope, args)?;
        self.search_patterns(&patterns).await
    }

    /// Structure of the matching keys, with empty leaf values
    pub async fn find(
        &self,
        pattern: &Document,
    ) -> Result<Document> {
        let keys = self.search(pattern).await?;
        skeleton(keys)
    }

    // ---------------------------------------------------------------
    // Reads

    /// Matching keys with their stored values, decoded by schema type
    pub async fn get(
        &self,
        pattern: &Document,
    ) -> Result<Document> {
        let keys = self.search(pattern).await?;
        self.fetch(&keys).await
    }

    pub async fn get_by_args(
        &self,
        scope: &str,
        args: &[(&str, &str)],
    ) -> Result<Document> {
        let keys = self.keys_by_args(scope, args).await?;
        self.fetch(&keys).await
    }

    /// Value of the first matching key. Value-in-key leaves yield the value
    /// carried by the key.
    pub async fn get_value(
        &self,
        pattern: &Document,
    ) -> Result<Option<Value>> {
        let keys = self.search(pattern).await?;
        let Some(key) = keys.first() else {
            return Ok(None);
        };

        let tag = self.codec().leaf_tag(key);
        if let Some(tag) = tag.filter(|t| t.value_in_key) {
            return Ok(Some(value_codec::parse_key_value(trailing_segment(key), Some(tag))));
        }

        self.get_key(key).await
    }

    /// Stored value of one concrete key, decoded by its schema tag
    pub async fn get_key(
        &self,
        key: &str,
    ) -> Result<Option<Value>> {
        let single = [key.to_string()];
        let raw = self.read(|b| b.mget(&single)).await?;
        match raw.into_iter().next().flatten() {
            Some(bytes) => Ok(Some(value_codec::decode_typed(&bytes, self.codec().leaf_tag(key)))),
            None => self.fetch_container(key).await,
        }
    }

    pub async fn exists(
        &self,
        pattern: &Document,
    ) -> Result<bool> {
        let keys = self.exact_keys(pattern)?;
        if keys.is_empty() {
            return Err(SchemaError::EmptyDocument(pattern.to_string()).into());
        }
        let count = self.read(|b| b.exists(&keys)).await?;
        Ok(count as usize == keys.len())
    }

    pub async fn exists_by_args(
        &self,
        scope: &str,
        args: &[(&str, &str)],
    ) -> Result<bool> {
        Ok(!self.keys_by_args(scope, args).await?.is_empty())
    }

    async fn fetch(
        &self,
        keys: &[String],
    ) -> Result<Document> {
        if keys.is_empty() {
            return Ok(Document::new());
        }

        let values = self.read(|b| b.mget(keys)).await?;
        let mut entries = Vec::with_capacity(keys.len());
        for (key, raw) in keys.iter().zip(values) {
            let value = match raw {
                Some(bytes) => value_codec::decode_typed(&bytes, self.codec().leaf_tag(key)),
                None => match self.fetch_container(key).await? {
                    Some(value) => value,
                    None => {
                        trace!(%key, "key vanished before it was read");
                        continue;
                    }
                },
            };
            entries.push((key.as_str(), value));
        }

        let mut document = PathCodec::decode(entries)?;
        self.retype_key_values(&mut document, keys);
        Ok(document)
    }

    /// Hash, then list, for keys GET could not read
    async fn fetch_container(
        &self,
        key: &str,
    ) -> Result<Option<Value>> {
        let kind = self.codec().leaf_tag(key).map(|tag| tag.kind);
        if kind != Some(TypeKind::List) {
            match self.read(|b| b.hgetall(key)).await {
                Ok(fields) if !fields.is_empty() => return Ok(Some(decode_hash(fields))),
                // Wrong type: not a hash
                Ok(_) | Err(Error::Store(StoreError::Command { .. })) => {}
                Err(e) => return Err(e),
            }
        }
        if kind == Some(TypeKind::Hash) {
            return Ok(None);
        }
        let items = self.read(|b| b.lrange(key, 0, -1)).await?;
        if !items.is_empty() {
            return Ok(Some(decode_list(&items)));
        }
        Ok(None)
    }

    /// Replaces in-key values decoded as text with their typed form
    fn retype_key_values(
        &self,
        document: &mut Document,
        keys: &[String],
    ) {
        for key in keys {
            let Some(tag) = self.codec().leaf_tag(key) else {
                continue;
            };
            if !tag.value_in_key || tag.kind == TypeKind::Str {
                continue;
            }
            let mut segments: Vec<&str> = key.split([FIELD_SEPARATOR, ID_SEPARATOR]).collect();
            let Some(text) = segments.pop() else {
                continue;
            };
            document.insert_path(&segments, value_codec::parse_key_value(text, Some(tag)));
        }
    }

    // ---------------------------------------------------------------
    // Writes

    /// Writes every leaf of `document`.
    ///
    /// Returns `false` when an NX/XX condition skipped a scalar write. When
    /// `batch` is given the commands are queued there and `true` is
    /// returned.
    pub async fn set(
        &self,
        document: &Document,
        options: SetOptions,
        batch: Option<&mut WriteBatch>,
    ) -> Result<bool> {
        let triples = self.codec().encode(document, true)?;
        if triples.is_empty() {
            return Err(SchemaError::EmptyDocument(document.to_string()).into());
        }

        let mut local = WriteBatch::new();
        let deferred = batch.is_some();
        let target = match batch {
            Some(batch) => batch,
            None => &mut local,
        };
        for triple in &triples {
            self.stage_set(triple, options, target).await?;
        }
        if deferred {
            return Ok(true);
        }

        let replies = self.backends.write.execute(local).await?;
        debug!(keys = triples.len(), "document written");
        Ok(!replies.contains(&Reply::Nil))
    }

    async fn stage_set(
        &self,
        triple: &KeyTriple,
        options: SetOptions,
        batch: &mut WriteBatch,
    ) -> Result<()> {
        if triple.tag.value_in_key {
            return self.stage_key_value(triple, options, batch).await;
        }

        // `any` leaves are never split into Redis containers
        let key = triple.key.clone();
        match (triple.tag.kind, &triple.value) {
            (TypeKind::Hash, Value::Map(fields)) => {
                batch.del(vec![key.clone()]);
                if !fields.is_empty() {
                    batch.hset(key, encode_fields(fields)?);
                }
            }
            (TypeKind::List, Value::List(items)) => {
                batch.del(vec![key.clone()]);
                if !items.is_empty() {
                    batch.rpush(key, encode_items(items)?);
                }
            }
            (_, value) => {
                batch.set(key, value_codec::encode_for(triple.tag, value)?, options);
            }
        }
        Ok(())
    }

    /// A value-in-key leaf has at most one stored key per parent: write it
    /// fresh, or rename the previous one.
    async fn stage_key_value(
        &self,
        triple: &KeyTriple,
        options: SetOptions,
        batch: &mut WriteBatch,
    ) -> Result<()> {
        let pattern = format!("{}{WILDCARD}", glob::escape(triple.base_key()));
        let matches = self.backends.write.scan(&pattern, SCAN_COUNT).await?;
        let previous: Vec<String> = matches.iter().filter(|k| **k != triple.key).cloned().collect();
        let holds_key = matches.contains(&triple.key);

        match (previous.as_slice(), holds_key) {
            ([], _) => {
                batch.set(triple.key.clone(), Vec::new(), options);
            }
            ([from], false) => {
                trace!(%from, to = %triple.key, "moving value-in-key");
                batch.rename(from.clone(), triple.key.clone());
            }
            _ => {
                return Err(SchemaError::AmbiguousValueKey { pattern, matches }.into());
            }
        }
        Ok(())
    }

    /// Deletes the keys the document encodes to, without searching
    pub async fn delete(
        &self,
        pattern: &Document,
        batch: Option<&mut WriteBatch>,
    ) -> Result<u64> {
        let keys = self.exact_keys(pattern)?;
        self.delete_keys(keys, batch).await
    }

    /// Deletes every key the search document matches
    pub async fn unsafe_delete(
        &self,
        pattern: &Document,
        batch: Option<&mut WriteBatch>,
    ) -> Result<u64> {
        let keys = self.search(pattern).await?;
        self.delete_keys(keys, batch).await
    }

    pub async fn delete_by_args(
        &self,
        scope: &str,
        args: &[(&str, &str)],
        batch: Option<&mut WriteBatch>,
    ) -> Result<u64> {
        let keys = self.keys_by_args(scope, args).await?;
        self.delete_keys(keys, batch).await
    }

    async fn delete_keys(
        &self,
        keys: Vec<String>,
        batch: Option<&mut WriteBatch>,
    ) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        if let Some(batch) = batch {
            batch.del(keys);
            return Ok(0);
        }
        let removed = self.backends.write.del(&keys).await?;
        debug!(requested = keys.len(), removed, "keys deleted");
        Ok(removed)
    }

    /// Moves every key of `old` to the matching key of `new`.
    ///
    /// Both documents must encode to the same number of keys. Returns
    /// `false` without writing when a source key is missing.
    pub async fn rename(
        &self,
        old: &Document,
        new: &Document,
        batch: Option<&mut WriteBatch>,
    ) -> Result<bool> {
        let old_keys: Vec<String> = self.codec().encode(old, false)?.into_iter().map(|t| t.key).collect();
        let new_keys: Vec<String> = self.codec().encode(new, true)?.into_iter().map(|t| t.key).collect();
        if old_keys.len() != new_keys.len() {
            return Err(SchemaError::RenameMismatch {
                old_keys: old_keys.len(),
                new_keys: new_keys.len(),
            }
            .into());
        }

        let pairs: Vec<(String, String)> = old_keys.into_iter().zip(new_keys).filter(|(a, b)| a != b).collect();
        if pairs.is_empty() {
            return Ok(true);
        }
        let sources: Vec<String> = pairs.iter().map(|(from, _)| from.clone()).collect();
        if self.backends.write.exists(&sources).await? as usize != sources.len() {
            debug!(?sources, "rename source missing");
            return Ok(false);
        }

        let mut local = WriteBatch::new();
        let deferred = batch.is_some();
        let target = match batch {
            Some(batch) => batch,
            None => &mut local,
        };
        for (from, to) in pairs {
            target.rename(from, to);
        }
        if !deferred {
            self.backends.write.execute(local).await?;
        }
        Ok(true)
    }

    // ---------------------------------------------------------------
    // Lists and hashes

    /// Appends to list leaves. A list value appends every element.
    pub async fn push(
        &self,
        document: &Document,
        mut batch: Option<&mut WriteBatch>,
    ) -> Result<u64> {
        let mut length = 0;
        for triple in self.codec().encode(document, false)? {
            let values = match &triple.value {
                Value::List(items) => encode_items(items)?,
                other => vec![value_codec::encode_element(other)?],
            };
            match batch.as_deref_mut() {
                Some(batch) => {
                    batch.rpush(triple.key, values);
                }
                None => length = self.backends.write.rpush(&triple.key, values).await?,
            }
        }
        Ok(length)
    }

    /// Removes and returns the first element of the list leaf
    pub async fn pop(
        &self,
        document: &Document,
    ) -> Result<Option<Value>> {
        let Some(key) = self.target_key(document).await? else {
            return Ok(None);
        };
        let raw = self.backends.write.lpop(&key).await?;
        Ok(raw.map(|bytes| value_codec::decode(&bytes)))
    }

    pub async fn get_list(
        &self,
        document: &Document,
    ) -> Result<Vec<Value>> {
        let Some(key) = self.target_key(document).await? else {
            return Ok(Vec::new());
        };
        let items = self.read(|b| b.lrange(&key, 0, -1)).await?;
        Ok(items.iter().map(|item| value_codec::decode(item)).collect())
    }

    /// Merges fields into hash leaves; existing fields not named are kept
    pub async fn hset(
        &self,
        document: &Document,
        mut batch: Option<&mut WriteBatch>,
    ) -> Result<u64> {
        let mut added = 0;
        for (key, fields) in self.hash_updates(document)? {
            match batch.as_deref_mut() {
                Some(batch) => {
                    batch.hset(key, fields);
                }
                None => added += self.backends.write.hset(&key, fields).await?,
            }
        }
        Ok(added)
    }

    /// HSET followed by a PUBLISH of the changed field names, space
    /// separated, on the key's own channel
    pub async fn hset_pub(
        &self,
        document: &Document,
    ) -> Result<()> {
        let mut batch = WriteBatch::new();
        for (key, fields) in self.hash_updates(document)? {
            let names: Vec<&str> = fields.iter().map(|(name, _)| name.as_str()).collect();
            let message = names.join(" ").into_bytes();
            batch.hset(key.clone(), fields.clone());
            batch.publish(key, message);
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.backends.write.execute(batch).await?;
        Ok(())
    }

    pub async fn hget(
        &self,
        document: &Document,
        field: &str,
    ) -> Result<Option<Value>> {
        let Some(key) = self.target_key(document).await? else {
            return Ok(None);
        };
        let raw = self.read(|b| b.hget(&key, field)).await?;
        Ok(raw.map(|bytes| value_codec::decode(&bytes)))
    }

    pub async fn hdel(
        &self,
        document: &Document,
        fields: &[String],
        batch: Option<&mut WriteBatch>,
    ) -> Result<u64> {
        let Some(key) = self.target_key(document).await? else {
            return Ok(0);
        };
        if let Some(batch) = batch {
            batch.push(BatchOp::HDel {
                key,
                fields: fields.to_vec(),
            });
            return Ok(0);
        }
        Ok(self.backends.write.hdel(&key, fields).await?)
    }

    pub async fn get_hash(
        &self,
        document: &Document,
    ) -> Result<BTreeMap<String, Value>> {
        let Some(key) = self.target_key(document).await? else {
            return Ok(BTreeMap::new());
        };
        let fields = self.read(|b| b.hgetall(&key)).await?;
        match decode_hash(fields) {
            Value::Map(map) => Ok(map),
            _ => Ok(BTreeMap::new()),
        }
    }

    fn hash_updates(
        &self,
        document: &Document,
    ) -> Result<Vec<(String, Vec<(String, Vec<u8>)>)>> {
        let mut updates = Vec::new();
        for triple in self.codec().encode(document, false)? {
            let Value::Map(fields) = &triple.value else {
                return Err(SchemaError::WrongType {
                    path: triple.key,
                    expected: "map".to_string(),
                    found: triple.value.kind_name(),
                }
                .into());
            };
            updates.push((triple.key.clone(), encode_fields(fields)?));
        }
        Ok(updates)
    }

    // ---------------------------------------------------------------
    // Batches

    pub fn create_batch(
        &self,
        atomic: bool,
    ) -> WriteBatch {
        if atomic {
            WriteBatch::atomic()
        } else {
            WriteBatch::new()
        }
    }

    pub async fn execute_batch(
        &self,
        batch: WriteBatch,
    ) -> Result<Vec<Reply>> {
        let commands = batch.len();
        let replies = self.backends.write.execute(batch).await?;
        debug!(commands, "batch executed");
        Ok(replies)
    }

    // ---------------------------------------------------------------

    /// Distinct keys of the search-mode encoding, in traversal order
    fn exact_keys(
        &self,
        document: &Document,
    ) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        Ok(self
            .codec()
            .encode(document, false)?
            .into_iter()
            .map(|triple| triple.key)
            .filter(|key| seen.insert(key.clone()))
            .collect())
    }

    /// Target of single-key operations: the document's first key, or the
    /// first stored key it matches when it holds wildcards
    async fn target_key(
        &self,
        document: &Document,
    ) -> Result<Option<String>> {
        let pattern = self
            .query
            .patterns(document)?
            .into_iter()
            .next()
            .ok_or_else(|| SchemaError::EmptyDocument(document.to_string()))?;
        match pattern {
            SearchPattern::Exact(key) => Ok(Some(key)),
            pattern => {
                let keys = self.search_patterns(std::slice::from_ref(&pattern)).await?;
                Ok(keys.into_iter().next())
            }
        }
    }
}

fn skeleton(keys: Vec<String>) -> Result<Document> {
    Ok(PathCodec::decode(
        keys.into_iter().map(|key| (key, Value::placeholder())),
    )?)
}

fn sort_keys(keys: BTreeSet<String>) -> Vec<String> {
    let mut keys: Vec<String> = keys.into_iter().collect();
    keys.sort_by_cached_key(|key| key.to_lowercase());
    keys
}

fn trailing_segment(key: &str) -> &str {
    key.rsplit([FIELD_SEPARATOR, ID_SEPARATOR]).next().unwrap_or(key)
}

fn encode_fields(fields: &BTreeMap<String, Value>) -> StoreResult<Vec<(String, Vec<u8>)>> {
    fields
        .iter()
        .map(|(name, value)| Ok((name.clone(), value_codec::encode_element(value)?)))
        .collect()
}

fn encode_items(items: &[Value]) -> StoreResult<Vec<Vec<u8>>> {
    items.iter().map(value_codec::encode_element).collect()
}

fn decode_hash(fields: Vec<(String, Vec<u8>)>) -> Value {
    Value::Map(
        fields
            .into_iter()
            .map(|(name, raw)| (name, value_codec::decode(&raw)))
            .collect(),
    )
}

fn decode_list(items: &[Vec<u8>]) -> Value {
    Value::List(items.iter().map(|item| value_codec::decode(item)).collect())
}
