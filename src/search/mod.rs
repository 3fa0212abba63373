//! Search backends the indexer writes to and the query executor reads from.

pub mod elastic;
pub mod memory;

use std::collections::BTreeSet;
use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{Transcript, Video};

pub use elastic::{ElasticClient, ElasticConfig};
pub use memory::MemoryIndex;

/// Field the term query runs against: the token of every transcript word.
pub const TRANSCRIPT_TERM_FIELD: &str = "transcript.words.token";

/// What gets indexed for a video. Same fields as the stored record, with the
/// transcript nested structurally so its tokens are addressable.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SearchDocument {
    pub title: String,
    pub url: String,
    pub hash: String,
    pub creator: String,
    pub timestamp: DateTime<Utc>,
    pub private: bool,
    pub views: u64,
    #[serde(default)]
    pub likes: BTreeSet<String>,
    #[serde(default)]
    pub dislikes: BTreeSet<String>,
    #[serde(default)]
    pub comments: Vec<i64>,
    #[serde(default)]
    pub transcript: Transcript,
}

impl From<&Video> for SearchDocument {
    fn from(v: &Video) -> Self {
        Self {
            title: v.title.clone(),
            url: v.url.clone(),
            hash: v.hash.clone(),
            creator: v.creator.clone(),
            timestamp: v.timestamp,
            private: v.private,
            views: v.views,
            likes: v.likes.clone(),
            dislikes: v.dislikes.clone(),
            comments: v.comments.clone(),
            transcript: v.transcript.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    pub document: SearchDocument,
}

/// A full-text index holding named collections of JSON documents.
///
/// Failures are reported as `Error::Index`; callers on the query path
/// re-label them.
pub trait SearchBackend: Send + Sync + 'static {
    /// Creates `collection` if it does not exist yet.
    fn ensure_collection(&self, collection: &str) -> impl Future<Output = Result<()>> + Send;

    /// Inserts or fully replaces document `id`.
    fn upsert(
        &self,
        collection: &str,
        id: &str,
        doc: &SearchDocument,
    ) -> impl Future<Output = Result<()>> + Send;

    fn fetch(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = Result<Option<SearchDocument>>> + Send;

    /// Documents whose `field` holds exactly `term`, in the backend's order.
    fn term_query(
        &self,
        collection: &str,
        field: &str,
        term: &str,
    ) -> impl Future<Output = Result<Vec<SearchHit>>> + Send;

    /// Version string reported by the backend.
    fn version(&self) -> impl Future<Output = Result<String>> + Send;
}
