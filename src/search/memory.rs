use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use ordered_float::OrderedFloat;

use super::{SearchBackend, SearchDocument, SearchHit, TRANSCRIPT_TERM_FIELD};
use crate::error::{Error, Result};

#[derive(Default)]
struct Collection {
    docs: HashMap<String, SearchDocument>,
    /// token -> (document id -> occurrences)
    postings: HashMap<String, BTreeMap<String, u32>>,
}

impl Collection {
    fn unindex(&mut self, id: &str) {
        let Some(old) = self.docs.get(id) else { return };
        for token in old.transcript.tokens() {
            if let Some(ids) = self.postings.get_mut(token) {
                ids.remove(id);
                if ids.is_empty() {
                    self.postings.remove(token);
                }
            }
        }
    }
}

/// In-process inverted index over transcript tokens.
///
/// Only `TRANSCRIPT_TERM_FIELD` is indexed. Hits are ranked by how often the
/// term occurs relative to transcript length, ties broken by id.
#[derive(Default)]
pub struct MemoryIndex {
    collections: RwLock<HashMap<String, Collection>>,
}

fn poisoned<T>(_: T) -> Error {
    Error::Index("Poisoned Lock".into())
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .map(|c| c.get(collection).map_or(0, |col| col.docs.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

impl SearchBackend for MemoryIndex {
    async fn ensure_collection(&self, collection: &str) -> Result<()> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        collections.entry(collection.to_string()).or_default();
        Ok(())
    }

    async fn upsert(&self, collection: &str, id: &str, doc: &SearchDocument) -> Result<()> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        let col = collections.entry(collection.to_string()).or_default();

        col.unindex(id);
        for token in doc.transcript.tokens() {
            *col.postings
                .entry(token.to_string())
                .or_default()
                .entry(id.to_string())
                .or_insert(0) += 1;
        }
        col.docs.insert(id.to_string(), doc.clone());
        Ok(())
    }

    async fn fetch(&self, collection: &str, id: &str) -> Result<Option<SearchDocument>> {
        let collections = self.collections.read().map_err(poisoned)?;
        Ok(collections.get(collection).and_then(|c| c.docs.get(id)).cloned())
    }

    async fn term_query(&self, collection: &str, field: &str, term: &str) -> Result<Vec<SearchHit>> {
        if field != TRANSCRIPT_TERM_FIELD {
            return Err(Error::Index(format!("field {:?} is not indexed", field)));
        }
        let collections = self.collections.read().map_err(poisoned)?;
        let Some(col) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let Some(ids) = col.postings.get(term) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<SearchHit> = ids
            .iter()
            .filter_map(|(id, count)| {
                let document = col.docs.get(id)?;
                let total = document.transcript.words.len().max(1) as f64;
                Some(SearchHit { id: id.clone(), score: *count as f64 / total, document: document.clone() })
            })
            .collect();
        // Stable sort keeps the BTreeMap's id order among equal scores
        hits.sort_by_key(|h| std::cmp::Reverse(OrderedFloat(h.score)));
        Ok(hits)
    }

    async fn version(&self) -> Result<String> {
        Ok(format!("memory-{}", env!("CARGO_PKG_VERSION")))
    }
}
