//! Bounded connection pool.
//!
//! At most `max_active` connections are checked out at once (callers beyond
//! that wait for a permit) and at most `max_idle` are kept for reuse. A
//! checked-out connection is returned by its guard's `Drop`, so release
//! happens on every exit path: success, error, cancellation or panic.

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{Error, Result};

/// Opens new connections for a `Pool`.
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolConfig {
    pub max_idle: usize,
    pub max_active: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_idle: 80, max_active: 12_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolState {
    pub idle: usize,
    pub active: usize,
}

struct Shared<M: ManageConnection> {
    manager: M,
    idle: Mutex<Vec<M::Connection>>,
    permits: Arc<Semaphore>,
    config: PoolConfig,
    closed: AtomicBool,
}

pub struct Pool<M: ManageConnection> {
    shared: Arc<Shared<M>>,
}

impl<M: ManageConnection> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<M: ManageConnection> Pool<M> {
    pub fn new(manager: M, config: PoolConfig) -> Self {
        let config = PoolConfig {
            max_active: config.max_active.max(1),
            max_idle: config.max_idle.min(config.max_active.max(1)),
        };
        Self {
            shared: Arc::new(Shared {
                manager,
                idle: Mutex::new(Vec::with_capacity(config.max_idle)),
                permits: Arc::new(Semaphore::new(config.max_active)),
                config,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Checks out a connection, reusing an idle one when available.
    /// Waits while `max_active` connections are already out.
    pub async fn get(&self) -> Result<PooledConnection<M>> {
        let permit = self
            .shared
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Store("connection pool is closed".into()))?;

        let reused = self.shared.lock_idle().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => self.shared.manager.connect().await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            shared: self.shared.clone(),
            reusable: false,
            _permit: permit,
        })
    }

    pub fn state(&self) -> PoolState {
        let available = self.shared.permits.available_permits();
        PoolState {
            idle: self.shared.lock_idle().len(),
            active: self.shared.config.max_active.saturating_sub(available),
        }
    }

    /// Stops handing out connections and drops the idle ones. Connections
    /// still checked out are closed when their guards drop.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.permits.close();
        let drained = std::mem::take(&mut *self.shared.lock_idle());
        debug!("Pool closed, dropped {} idle connections", drained.len());
    }
}

impl<M: ManageConnection> Shared<M> {
    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<M::Connection>> {
        // A panic while holding this lock cannot leave the Vec inconsistent
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A checked-out connection.
///
/// It goes back to the idle list only if `mark_reusable` was called, i.e.
/// the last exchange finished cleanly. Anything else (an I/O error, a
/// cancelled future halfway through a frame) discards it.
pub struct PooledConnection<M: ManageConnection> {
    conn: Option<M::Connection>,
    shared: Arc<Shared<M>>,
    reusable: bool,
    _permit: OwnedSemaphorePermit,
}

impl<M: ManageConnection> PooledConnection<M> {
    pub fn mark_reusable(&mut self) {
        self.reusable = true;
    }

    pub fn mark_broken(&mut self) {
        self.reusable = false;
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };
        if !self.reusable || self.shared.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut idle = self.shared.lock_idle();
        if idle.len() < self.shared.config.max_idle {
            idle.push(conn);
        }
        // _permit is released after this, freeing the active slot
    }
}
