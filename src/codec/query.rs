use tracing::trace;

use super::glob;
use super::Document;
use super::PathCodec;
use crate::constants::WILDCARD;
use crate::SchemaError;

/// How a key pattern is resolved against the store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SearchPattern {
    /// Fully concrete key, checked with EXISTS
    Exact(String),
    /// Concrete prefix followed by a single trailing `*`; holds the prefix
    Prefix(String),
    /// Anything else with glob metacharacters
    Glob(String),
}

impl SearchPattern {
    pub fn classify(key: String) -> Self {
        if !glob::has_wildcards(&key) {
            return SearchPattern::Exact(key);
        }
        if let Some(prefix) = key.strip_suffix(WILDCARD) {
            if !glob::has_wildcards(prefix) && !prefix.ends_with('\\') {
                return SearchPattern::Prefix(prefix.to_string());
            }
        }
        SearchPattern::Glob(key)
    }

    /// Pattern in glob syntax, suitable for SCAN MATCH or PSUBSCRIBE
    pub fn as_glob(&self) -> String {
        match self {
            SearchPattern::Exact(key) => glob::escape(key),
            SearchPattern::Prefix(prefix) => format!("{prefix}{WILDCARD}"),
            SearchPattern::Glob(pattern) => pattern.clone(),
        }
    }

    pub fn matches(
        &self,
        key: &str,
    ) -> bool {
        match self {
            SearchPattern::Exact(exact) => exact == key,
            SearchPattern::Prefix(prefix) => key.starts_with(prefix.as_str()),
            SearchPattern::Glob(pattern) => glob::glob_match(pattern, key),
        }
    }
}

/// Turns partial documents and named arguments into search patterns
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    codec: PathCodec,
}

impl QueryBuilder {
    pub fn new(codec: PathCodec) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &PathCodec {
        &self.codec
    }

    /// One pattern per distinct key of the search-mode encoding, in
    /// traversal order.
    pub fn patterns(
        &self,
        document: &Document,
    ) -> Result<Vec<SearchPattern>, SchemaError> {
        let mut seen = std::collections::HashSet::new();
        let patterns: Vec<SearchPattern> = self
            .codec
            .encode(document, false)?
            .into_iter()
            .filter(|triple| seen.insert(triple.key.clone()))
            .map(|triple| SearchPattern::classify(triple.key))
            .collect();
        trace!(count = patterns.len(), "derived search patterns");
        Ok(patterns)
    }

    pub fn search_document(
        &self,
        scope: &str,
        args: &[(&str, &str)],
    ) -> Result<Document, SchemaError> {
        self.codec.args_to_search_template(scope, args)
    }

    pub fn patterns_by_args(
        &self,
        scope: &str,
        args: &[(&str, &str)],
    ) -> Result<Vec<SearchPattern>, SchemaError> {
        let document = self.search_document(scope, args)?;
        self.patterns(&document)
    }
}
