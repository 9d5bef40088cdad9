use std::fmt;

use async_trait::async_trait;

use crate::codec::Document;
use crate::BoxError;

/// Operation named by a keyspace notification
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyspaceOp {
    Set,
    HSet,
    HDel,
    Del,
    Expired,
    RenameFrom,
    RenameTo,
    RPush,
    LPop,
    /// Explicit PUBLISH on a key channel
    Publish,
    Other(String),
}

impl KeyspaceOp {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "set" => KeyspaceOp::Set,
            "hset" => KeyspaceOp::HSet,
            "hdel" => KeyspaceOp::HDel,
            "del" => KeyspaceOp::Del,
            "expired" => KeyspaceOp::Expired,
            "rename_from" => KeyspaceOp::RenameFrom,
            "rename_to" => KeyspaceOp::RenameTo,
            "rpush" => KeyspaceOp::RPush,
            "lpop" => KeyspaceOp::LPop,
            other => KeyspaceOp::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            KeyspaceOp::Set => "set",
            KeyspaceOp::HSet => "hset",
            KeyspaceOp::HDel => "hdel",
            KeyspaceOp::Del => "del",
            KeyspaceOp::Expired => "expired",
            KeyspaceOp::RenameFrom => "rename_from",
            KeyspaceOp::RenameTo => "rename_to",
            KeyspaceOp::RPush => "rpush",
            KeyspaceOp::LPop => "lpop",
            KeyspaceOp::Publish => "publish",
            KeyspaceOp::Other(raw) => raw,
        }
    }

    /// The key no longer exists after this operation
    pub fn is_removal(&self) -> bool {
        matches!(self, KeyspaceOp::Del | KeyspaceOp::Expired | KeyspaceOp::RenameFrom)
    }
}

impl fmt::Display for KeyspaceOp {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded change delivered to a handler
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Partial document rooted at the changed key. Removed keys carry a
    /// null leaf.
    pub document: Document,
    /// Hash field names named by a channel message. Empty for keyspace
    /// notifications, which do not carry them; `document` holds the whole
    /// hash instead.
    pub changed_fields: Vec<String>,
    pub operation: KeyspaceOp,
    pub key: String,
    /// Subscription patterns of the feed that produced the event
    pub patterns: Vec<String>,
}

/// Receives change events. Failures are logged by the feed and never end the
/// subscription.
#[async_trait]
pub trait ChangeHandler: Send + Sync + 'static {
    async fn on_change(
        &self,
        event: ChangeEvent,
    ) -> std::result::Result<(), BoxError>;
}

#[async_trait]
impl<F> ChangeHandler for F
where
    F: Fn(ChangeEvent) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
{
    async fn on_change(
        &self,
        event: ChangeEvent,
    ) -> std::result::Result<(), BoxError> {
        (self)(event)
    }
}
