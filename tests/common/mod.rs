#![allow(dead_code)]

use std::time::Duration;

use d_keyspace::codec::Document;
use d_keyspace::DalConfig;
use d_keyspace::DalContext;

pub const WAIT: Duration = Duration::from_secs(2);

/// In-memory context with a short lock poll interval
pub fn context() -> DalContext {
    let mut config = DalConfig::default();
    config.lock.poll_interval_ms = 10;
    DalContext::in_memory(config).unwrap()
}

pub fn doc(value: serde_json::Value) -> Document {
    Document::try_from(value).unwrap()
}
