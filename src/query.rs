//! Query Executor: exact-term search over transcript tokens.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{with_timeout, Error, Result};
use crate::indexer::COLLECTION;
use crate::search::{SearchBackend, SearchHit, TRANSCRIPT_TERM_FIELD};

/// Longest term accepted, in bytes.
pub const MAX_TERM_LEN: usize = 256;

pub struct QueryExecutor<B> {
    backend: Arc<B>,
    timeout: Duration,
}

impl<B: SearchBackend> QueryExecutor<B> {
    pub fn new(backend: Arc<B>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// Hashes of every video whose transcript contains `term` as a whole
    /// token, in the backend's order. No match is an empty list.
    pub async fn search(&self, term: &str) -> Result<Vec<String>> {
        Ok(self.search_hits(term).await?.into_iter().map(|h| h.id).collect())
    }

    pub async fn search_hits(&self, term: &str) -> Result<Vec<SearchHit>> {
        validate_term(term)?;
        let query = self.backend.term_query(COLLECTION, TRANSCRIPT_TERM_FIELD, term);
        match with_timeout("search", self.timeout, query).await {
            Err(Error::Index(msg)) => Err(Error::Query(msg)),
            other => other,
        }
    }
}

fn validate_term(term: &str) -> Result<()> {
    if term.is_empty() {
        return Err(Error::MalformedQuery("search term must not be empty".into()));
    }
    if term.chars().any(char::is_whitespace) {
        return Err(Error::MalformedQuery(format!("search term {:?} must be a single token", term)));
    }
    if term.len() > MAX_TERM_LEN {
        return Err(Error::MalformedQuery(format!(
            "search term is {} bytes, limit is {}",
            term.len(),
            MAX_TERM_LEN
        )));
    }
    Ok(())
}
