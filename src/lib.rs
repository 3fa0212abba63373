pub mod api;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod filter;
pub mod indexer;
pub mod manager;
pub mod model;
pub mod parser;
pub mod pool;
pub mod protocol;
pub mod query;
pub mod search;
pub mod server;
pub mod storage;

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;
use uuid::Uuid;

use crate::filter::BloomFilter;
use crate::model::{Batch, Entry};
use crate::storage::Segment;

pub use crate::error::{Error, Result};

const BLOOM_EXPECTED_KEYS: usize = 1_000_000;
const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Location of the newest value of a key.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Slot {
    offset: u64,
    position: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CompactionStats {
    pub live_keys: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// The record store's key-value engine: one append-only segment, an
/// in-memory key index and a bloom filter for misses.
///
/// Lock order is always index, then segment.
pub struct StoreEngine {
    active_segment: Mutex<Segment>,
    index: RwLock<HashMap<String, Slot>>,
    bloom_filter: RwLock<BloomFilter>,
}

impl fmt::Debug for StoreEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreEngine")
            .field("keys", &self.len())
            .finish()
    }
}

fn poisoned<T>(_: T) -> io::Error {
    io::Error::new(io::ErrorKind::Other, "poisoned lock")
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl StoreEngine {
    /// Opens the segment at `path` and rebuilds the key index from it.
    pub fn open(path: &Path, strict_durability: bool) -> io::Result<Self> {
        let mut segment = Segment::new(path, strict_durability)?;
        let batches = segment.scan()?;

        let mut index = HashMap::new();
        let mut bloom_filter = BloomFilter::new(BLOOM_EXPECTED_KEYS, BLOOM_FALSE_POSITIVE_RATE);
        for batch in &batches {
            for (position, key) in batch.keys.iter().enumerate() {
                bloom_filter.insert(key);
                index.insert(key.clone(), Slot { offset: batch.offset, position: position as u32 });
            }
        }
        info!("Recovered {} keys from {} batches in {:?}", index.len(), batches.len(), path);

        Ok(Self {
            active_segment: Mutex::new(segment),
            index: RwLock::new(index),
            bloom_filter: RwLock::new(bloom_filter),
        })
    }

    pub fn len(&self) -> usize {
        self.index.read().map(|idx| idx.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes all pairs as one batch. Each key is fully overwritten.
    pub fn set_many(&self, pairs: Vec<(String, Vec<u8>)>) -> io::Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = pairs.iter().map(|(k, _)| k.clone()).collect();
        let batch = Batch::new(
            pairs.into_iter().map(|(key, value)| Entry { key, value }).collect(),
            now_secs(),
        );

        // Holding the index lock across the append keeps per-key order equal
        // to append order.
        let mut idx = self.index.write().map_err(poisoned)?;
        let offset = {
            let mut segment = self.active_segment.lock().map_err(poisoned)?;
            segment.append(&batch)?
        };

        {
            let mut bf = self.bloom_filter.write().map_err(poisoned)?;
            for key in &keys {
                bf.insert(key);
            }
        }

        for (position, key) in keys.into_iter().enumerate() {
            idx.insert(key, Slot { offset, position: position as u32 });
        }
        Ok(())
    }

    pub fn set(&self, key: &str, value: Vec<u8>) -> io::Result<()> {
        self.set_many(vec![(key.to_string(), value)])
    }

    pub fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        {
            let bf = self.bloom_filter.read().map_err(poisoned)?;
            if !bf.might_contain(key) {
                return Ok(None);
            }
        }

        let idx = self.index.read().map_err(poisoned)?;
        let slot = match idx.get(key) {
            Some(slot) => *slot,
            None => return Ok(None),
        };
        let mut segment = self.active_segment.lock().map_err(poisoned)?;
        segment.read_value(slot.offset, slot.position as usize).map(Some)
    }

    /// Rewrites the segment keeping only the newest value of every key.
    /// Stop-the-world: reads and writes wait until the swap is done.
    pub fn compact(&self) -> io::Result<CompactionStats> {
        info!("[GC] Starting compaction");

        let mut idx = self.index.write().map_err(poisoned)?;
        let mut segment = self.active_segment.lock().map_err(poisoned)?;

        let old_path = segment.file_path.clone();
        let new_path = old_path.with_extension(format!("compact-{}", Uuid::new_v4().simple()));
        let bytes_before = segment.len();
        let strict = segment.is_strict();

        let mut new_segment = Segment::new(&new_path, strict)?;
        let mut new_index = HashMap::with_capacity(idx.len());

        let result = (|| -> io::Result<()> {
            for (key, slot) in idx.iter() {
                let value = segment.read_value(slot.offset, slot.position as usize)?;
                let batch = Batch::new(vec![Entry { key: key.clone(), value }], now_secs());
                let offset = new_segment.append(&batch)?;
                new_index.insert(key.clone(), Slot { offset, position: 0 });
            }
            Ok(())
        })();

        if let Err(e) = result {
            drop(new_segment);
            let _ = fs::remove_file(&new_path);
            return Err(e);
        }

        let bytes_after = new_segment.len();
        drop(new_segment);
        fs::rename(&new_path, &old_path)?;
        *segment = Segment::new(&old_path, strict)?;
        *idx = new_index;

        // Built aside and swapped in, so lock-free readers of the filter never
        // see it half filled.
        let mut fresh = BloomFilter::new(BLOOM_EXPECTED_KEYS, BLOOM_FALSE_POSITIVE_RATE);
        for key in idx.keys() {
            fresh.insert(key);
        }
        *self.bloom_filter.write().map_err(poisoned)? = fresh;

        let stats = CompactionStats { live_keys: idx.len(), bytes_before, bytes_after };
        info!(
            "[GC] Compaction complete: {} live keys, {} -> {} bytes",
            stats.live_keys, stats.bytes_before, stats.bytes_after
        );
        Ok(stats)
    }
}
