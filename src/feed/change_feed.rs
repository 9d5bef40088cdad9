//! Keyspace and channel subscriptions turned into document events.
//!
//! ```text
//! PSUBSCRIBE __keyspace@*__:<pattern>
//!      │ (channel, op)
//!      ▼
//! decode key ─► re-read value ─► ChangeEvent ─► handler
//! ```
//!
//! Each subscription owns one pub/sub connection and one background task.
//! The task ends when the subscription is cancelled or dropped, or when the
//! connection is lost; the connection is released with it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::FutureExt;
use futures::StreamExt;
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::ChangeEvent;
use super::ChangeHandler;
use super::KeyspaceOp;
use crate::codec::Document;
use crate::codec::PathCodec;
use crate::codec::Value;
use crate::constants::KEYSPACE_ANY_DB;
use crate::constants::WILDCARD;
use crate::store::PubSubMessage;
use crate::store::StoreClient;
use crate::utils::async_task::spawn_task;
use crate::utils::async_task::task_with_timeout_and_exponential_backoff;
use crate::BackoffPolicy;
use crate::Error;
use crate::Result;
use crate::RetryPolicies;
use crate::SchemaError;

/// Subscribes handlers to changes under search documents
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    client: StoreClient,
    /// Policy for opening the pub/sub connection
    retry: BackoffPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedKind {
    /// Keyspace notifications, channel carries the key
    Keyspace,
    /// Explicit publishes on key channels, payload carries field names
    Channel,
}

impl ChangeFeed {
    pub fn new(client: StoreClient) -> Self {
        Self {
            client,
            retry: RetryPolicies::default().subscribe,
        }
    }

    pub fn with_retry(
        mut self,
        retry: BackoffPolicy,
    ) -> Self {
        self.retry = retry;
        self
    }

    pub fn client(&self) -> &StoreClient {
        &self.client
    }

    /// Keyspace notifications for every key the search document matches
    pub async fn subscribe(
        &self,
        pattern: &Document,
        handler: impl ChangeHandler,
    ) -> Result<Subscription> {
        let globs: Vec<String> = self
            .client
            .query_builder()
            .patterns(pattern)?
            .iter()
            .map(|p| format!("{KEYSPACE_ANY_DB}{}", p.as_glob()))
            .collect();
        if globs.is_empty() {
            return Err(SchemaError::EmptyDocument(pattern.to_string()).into());
        }
        self.open(FeedKind::Keyspace, globs, Arc::new(handler)).await
    }

    pub async fn subscribe_by_args(
        &self,
        scope: &str,
        args: &[(&str, &str)],
        handler: impl ChangeHandler,
    ) -> Result<Subscription> {
        let document = self.client.query_builder().search_document(scope, args)?;
        self.subscribe(&document, handler).await
    }

    /// Messages published on the channels of the document's keys, as sent by
    /// `StoreClient::hset_pub`
    pub async fn subscribe_channel(
        &self,
        pattern: &Document,
        handler: impl ChangeHandler,
    ) -> Result<Subscription> {
        let mut globs = Vec::new();
        for triple in self.client.codec().encode(pattern, false)? {
            let glob = if triple.key.ends_with(WILDCARD) {
                triple.key
            } else {
                format!("{}{WILDCARD}", triple.key)
            };
            if !globs.contains(&glob) {
                globs.push(glob);
            }
        }
        if globs.is_empty() {
            return Err(SchemaError::EmptyDocument(pattern.to_string()).into());
        }
        self.open(FeedKind::Channel, globs, Arc::new(handler)).await
    }

    async fn open(
        &self,
        kind: FeedKind,
        patterns: Vec<String>,
        handler: Arc<dyn ChangeHandler>,
    ) -> Result<Subscription> {
        let backend = &self.client.backends().subscribe;
        let stream = task_with_timeout_and_exponential_backoff(
            || {
                let patterns = patterns.clone();
                async move { backend.psubscribe(patterns).await.map_err(Error::from) }
            },
            self.retry,
        )
        .await?;
        info!(?kind, ?patterns, "subscription opened");

        let token = CancellationToken::new();
        let dispatcher = Dispatcher {
            kind,
            client: self.client.clone(),
            handler,
            patterns: patterns.clone(),
        };
        let handle = spawn_task("change_feed", {
            let token = token.clone();
            move || dispatcher.run(stream, token)
        });

        Ok(Subscription {
            patterns,
            token,
            handle: Some(handle),
        })
    }
}

/// A running subscription. Dropping it cancels the subscription.
#[derive(Debug)]
pub struct Subscription {
    patterns: Vec<String>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Patterns the pub/sub connection is subscribed to
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Cancels and waits for the background task to release its connection
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("subscription task ended abnormally: {:?}", e);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Dispatcher {
    kind: FeedKind,
    client: StoreClient,
    handler: Arc<dyn ChangeHandler>,
    patterns: Vec<String>,
}

impl Dispatcher {
    async fn run(
        self,
        mut stream: BoxStream<'static, PubSubMessage>,
        token: CancellationToken,
    ) -> Result<()> {
        loop {
            select! {
                _ = token.cancelled() => {
                    debug!(patterns = ?self.patterns, "subscription cancelled");
                    break;
                }
                message = stream.next() => {
                    let Some(message) = message else {
                        warn!(patterns = ?self.patterns, "subscription connection closed");
                        break;
                    };
                    self.dispatch(message).await;
                }
            }
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        message: PubSubMessage,
    ) {
        let event = match self.kind {
            FeedKind::Keyspace => self.keyspace_event(message).await,
            FeedKind::Channel => self.channel_event(message).await,
        };
        match event {
            Ok(Some(event)) => self.deliver(event).await,
            Ok(None) => {}
            Err(e) => warn!("dropping change notification: {}", e),
        }
    }

    async fn keyspace_event(
        &self,
        message: PubSubMessage,
    ) -> Result<Option<ChangeEvent>> {
        let Some((_, key)) = message.channel.split_once("__:") else {
            trace!(channel = %message.channel, "not a keyspace channel");
            return Ok(None);
        };
        let key = key.to_string();
        let operation = KeyspaceOp::parse(&String::from_utf8_lossy(&message.payload));

        let value = if operation.is_removal() {
            Value::Null
        } else {
            self.client.get_key(&key).await?.unwrap_or_default()
        };

        // Keyspace notifications carry no field names
        self.event(key, value, Vec::new(), operation).map(Some)
    }

    async fn channel_event(
        &self,
        message: PubSubMessage,
    ) -> Result<Option<ChangeEvent>> {
        let key = message.channel;
        let changed_fields: Vec<String> = String::from_utf8_lossy(&message.payload)
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let value = self.client.get_key(&key).await?.unwrap_or_default();
        self.event(key, value, changed_fields, KeyspaceOp::Publish).map(Some)
    }

    fn event(
        &self,
        key: String,
        value: Value,
        changed_fields: Vec<String>,
        operation: KeyspaceOp,
    ) -> Result<ChangeEvent> {
        let document = PathCodec::decode([(key.as_str(), value)])?;
        Ok(ChangeEvent {
            document,
            changed_fields,
            operation,
            key,
            patterns: self.patterns.clone(),
        })
    }

    /// Handler errors and panics are contained here
    async fn deliver(
        &self,
        event: ChangeEvent,
    ) {
        let key = event.key.clone();
        let operation = event.operation.clone();
        trace!(%key, %operation, "delivering change");
        match AssertUnwindSafe(self.handler.on_change(event)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%key, %operation, "change handler failed: {}", e),
            Err(_) => error!(%key, %operation, "change handler panicked"),
        }
    }
}
