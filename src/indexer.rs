//! Search Indexer: projects stored records into the search collection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::StoreClient;
use crate::codec;
use crate::error::{with_timeout, Error, Result};
use crate::search::{SearchBackend, SearchDocument};

/// The one collection every video is indexed into.
pub const COLLECTION: &str = "videos";

pub struct Indexer<B> {
    store: StoreClient,
    backend: Arc<B>,
    timeout: Duration,
    /// Set once the collection exists with its term mapping. Left unset
    /// after a failure so the next caller tries again.
    collection_ready: OnceCell<()>,
}

impl<B: SearchBackend> Indexer<B> {
    pub fn new(store: StoreClient, backend: Arc<B>, timeout: Duration) -> Self {
        Self { store, backend, timeout, collection_ready: OnceCell::new() }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Creates the collection (with its term mapping) if it is missing.
    /// Succeeds at most once; later calls return immediately.
    pub async fn ensure_collection(&self) -> Result<()> {
        self.collection_ready
            .get_or_try_init(|| async {
                with_timeout("ensure_collection", self.timeout, self.backend.ensure_collection(COLLECTION)).await?;
                info!("Collection {:?} ready", COLLECTION);
                Ok::<_, Error>(())
            })
            .await
            .map(|_| ())
    }

    /// Pulls the record last written with `hash` and upserts its projection
    /// under id `hash`. Running it twice leaves the index unchanged.
    pub async fn sync(&self, hash: &str) -> Result<()> {
        with_timeout("sync", self.timeout, async {
            let url = self.store.resolve_hash(hash).await?;
            let bytes = self.store.get(&url).await?;
            let video = codec::decode(&bytes)?;

            // The url was re-written under another hash since the alias was set
            if video.hash != hash {
                return Err(Error::NotFound(format!(
                    "record for hash {:?} now carries hash {:?}",
                    hash, video.hash
                )));
            }

            // An upsert into a missing collection would create it with a
            // dynamic mapping, where tokens are analysed text
            self.ensure_collection().await?;

            let doc = SearchDocument::from(&video);
            self.backend.upsert(COLLECTION, hash, &doc).await?;
            debug!("Indexed {} ({})", hash, url);
            Ok(())
        })
        .await
    }

    /// The indexed projection for `hash`.
    pub async fn document(&self, hash: &str) -> Result<SearchDocument> {
        with_timeout("document", self.timeout, self.backend.fetch(COLLECTION, hash))
            .await?
            .ok_or_else(|| Error::NotFound(format!("no document indexed for hash {:?}", hash)))
    }
}

/// Hands hashes to a background task that syncs them one at a time.
#[derive(Clone)]
pub struct SyncQueue {
    tx: mpsc::Sender<String>,
}

impl SyncQueue {
    /// The queue and the receiving end its worker drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel::<String>(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Starts the worker. It exits once every `SyncQueue` clone is dropped.
    pub fn spawn<B: SearchBackend>(indexer: Arc<Indexer<B>>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (queue, mut rx) = Self::channel(capacity);
        let worker = tokio::spawn(async move {
            info!("Sync worker started");
            while let Some(hash) = rx.recv().await {
                if let Err(e) = indexer.sync(&hash).await {
                    warn!("Background sync of {} failed: {}", hash, e);
                }
            }
            info!("Sync worker stopped");
        });
        (queue, worker)
    }

    /// Never waits: a full queue is reported instead.
    pub fn enqueue(&self, hash: &str) -> Result<()> {
        self.tx.try_send(hash.to_string()).map_err(|e| match e {
            TrySendError::Full(h) => Error::Index(format!("sync queue full, dropped {}", h)),
            TrySendError::Closed(h) => Error::Index(format!("sync worker gone, dropped {}", h)),
        })
    }
}
