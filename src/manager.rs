use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::StoreEngine;

/// Runtime sizing picked from the host.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemProfile {
    pub logical_cores: usize,
    pub worker_threads: usize,
    /// true = fsync every batch, false = leave flushing to the OS
    pub strict_durability: bool,
}

impl SystemProfile {
    pub fn detect() -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::for_cores(cores)
    }

    pub fn for_cores(cores: usize) -> Self {
        if cores <= 1 {
            warn!("Single core host, disabling fsync on writes");
            // 1 compute + 1 I/O
            Self { logical_cores: cores, worker_threads: 2, strict_durability: false }
        } else {
            Self { logical_cores: cores, worker_threads: cores, strict_durability: true }
        }
    }

    pub fn log(&self) {
        info!("--- [Resource Manager] ---");
        info!("Detected Cores: {}", self.logical_cores);
        info!("Worker Threads: {}", self.worker_threads);
        info!(
            "Durability Mode: {}",
            if self.strict_durability { "Strict (Fsync)" } else { "High Throughput (Async)" }
        );
    }
}

/// Compacts the store segment every `interval` on a dedicated thread.
pub fn start_gc_thread(engine: Arc<StoreEngine>, interval: Duration) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        info!("[GC] Background compaction thread started, every {:?}", interval);
        loop {
            thread::sleep(interval);
            if let Err(e) = engine.compact() {
                error!("[GC] Compaction Failed: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_core_gets_two_workers_and_async_writes() {
        let p = SystemProfile::for_cores(1);
        assert_eq!(p.worker_threads, 2);
        assert!(!p.strict_durability);
    }

    #[test]
    fn multi_core_uses_every_core() {
        let p = SystemProfile::for_cores(8);
        assert_eq!(p.worker_threads, 8);
        assert!(p.strict_durability);
    }

    #[test]
    fn gc_thread_compacts() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(StoreEngine::open(&dir.path().join("store.dat"), false).unwrap());
        for i in 0..20 {
            engine.set("video:a", format!("{}", i).into_bytes()).unwrap();
        }
        let path = dir.path().join("store.dat");
        let before = std::fs::metadata(&path).unwrap().len();

        start_gc_thread(engine.clone(), Duration::from_millis(20));
        let mut shrunk = false;
        for _ in 0..100 {
            thread::sleep(Duration::from_millis(20));
            if std::fs::metadata(&path).map(|m| m.len() < before).unwrap_or(false) {
                shrunk = true;
                break;
            }
        }
        assert!(shrunk);
        assert_eq!(engine.get("video:a").unwrap().unwrap(), b"19");
    }
}
