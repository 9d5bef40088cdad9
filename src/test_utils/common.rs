use std::sync::Arc;

use crate::codec::Document;
use crate::codec::PathCodec;
use crate::codec::QueryBuilder;
use crate::schema::SchemaCatalog;
use crate::schema::SchemaTemplate;
use crate::store::InMemoryBackend;
use crate::store::ScopedBackends;
use crate::store::StoreClient;
use crate::BackoffPolicy;

pub(crate) fn builtin_template() -> Arc<SchemaTemplate> {
    SchemaCatalog::builtin().unwrap().latest().unwrap()
}

pub(crate) fn query_builder() -> QueryBuilder {
    QueryBuilder::new(PathCodec::new(builtin_template()))
}

pub(crate) fn doc(value: serde_json::Value) -> Document {
    Document::try_from(value).unwrap()
}

/// Short delays so retry paths stay quick
pub(crate) fn fast_retry() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 3,
        timeout_ms: 1000,
        base_delay_ms: 1,
        max_delay_ms: 5,
    }
}

/// Client whose connections all share one in-memory store
pub(crate) fn memory_client() -> (StoreClient, InMemoryBackend) {
    let backend = InMemoryBackend::new();
    let client = StoreClient::new(
        ScopedBackends::single(Arc::new(backend.clone())),
        query_builder(),
        fast_retry(),
    );
    (client, backend)
}
