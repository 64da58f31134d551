//! Bounded cache of ready relay sessions.
//!
//! The pool amortises the TLS + WebSocket + PSK handshake cost across flows:
//! idle sessions are kept up to a fixed capacity, health-checked on acquire,
//! and created on demand when none are available. Session construction never
//! happens under the pool mutex.

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::session::SecureSession;
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default number of idle sessions the pool retains.
pub const DEFAULT_POOL_CAPACITY: usize = 5;

/// Source of new relay sessions. The production connector dials the relay
/// from config; tests substitute one that talks to an in-process relay.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self) -> Result<SecureSession>;
}

/// Connector dialing the configured relay over TLS.
pub struct RelayConnector {
    config: ProxyConfig,
}

impl RelayConnector {
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionConnector for RelayConnector {
    async fn connect(&self) -> Result<SecureSession> {
        SecureSession::connect(&self.config).await
    }
}

#[derive(Default)]
struct PoolInner {
    idle: Vec<Arc<SecureSession>>,
    in_use: Vec<Weak<SecureSession>>,
    initialised: bool,
}

/// Bounded session pool. The capacity limits idle slots only; outstanding
/// in-use sessions are unbounded.
pub struct SessionPool {
    connector: Arc<dyn SessionConnector>,
    capacity: usize,
    inner: Mutex<PoolInner>,
}

impl SessionPool {
    pub fn new(connector: Arc<dyn SessionConnector>) -> Self {
        Self::with_capacity(connector, DEFAULT_POOL_CAPACITY)
    }

    pub fn with_capacity(connector: Arc<dyn SessionConnector>, capacity: usize) -> Self {
        Self {
            connector,
            capacity,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Eagerly create up to `capacity` sessions. Individual handshake
    /// failures are tolerated; the pool may start with fewer.
    pub async fn init(&self) -> usize {
        let mut created = Vec::new();
        for i in 0..self.capacity {
            match self.connector.connect().await {
                Ok(session) => created.push(Arc::new(session)),
                Err(e) => warn!("pool warm-up session {} failed: {}", i + 1, e),
            }
        }

        let mut inner = self.inner.lock().await;
        let count = created.len();
        inner.idle = created;
        inner.initialised = true;
        info!("session pool initialised with {}/{} sessions", count, self.capacity);
        count
    }

    /// Take a ready session: an idle one if available and healthy, a fresh
    /// one otherwise.
    pub async fn acquire(&self) -> Result<Arc<SecureSession>> {
        let mut stale = Vec::new();
        let reused = {
            let mut inner = self.inner.lock().await;
            let mut found = None;
            while let Some(session) = inner.idle.pop() {
                if session.is_connected() {
                    found = Some(session);
                    break;
                }
                stale.push(session);
            }
            if let Some(ref session) = found {
                inner.in_use.push(Arc::downgrade(session));
            }
            found
        };

        for session in stale {
            debug!("discarding unhealthy idle session");
            session.close().await;
        }

        if let Some(session) = reused {
            return Ok(session);
        }

        // Nothing idle: create outside the lock.
        let session = Arc::new(self.connector.connect().await?);
        let mut inner = self.inner.lock().await;
        inner.in_use.push(Arc::downgrade(&session));
        Ok(session)
    }

    /// Return a session. Ready sessions go back to the idle set while it has
    /// room; everything else is closed.
    pub async fn release(&self, session: Arc<SecureSession>) {
        let keep = {
            let mut inner = self.inner.lock().await;
            inner
                .in_use
                .retain(|weak| !weak.ptr_eq(&Arc::downgrade(&session)));
            if session.is_connected() && inner.idle.len() < self.capacity {
                inner.idle.push(session.clone());
                true
            } else {
                false
            }
        };

        if !keep {
            session.close().await;
        }
    }

    /// Close every idle and tracked in-use session and reset the pool.
    pub async fn cleanup(&self) {
        let (idle, in_use) = {
            let mut inner = self.inner.lock().await;
            inner.initialised = false;
            (
                std::mem::take(&mut inner.idle),
                std::mem::take(&mut inner.in_use),
            )
        };

        for session in idle {
            session.close().await;
        }
        for weak in in_use {
            if let Some(session) = weak.upgrade() {
                session.close().await;
            }
        }
        info!("session pool cleaned up");
    }

    pub async fn idle_count(&self) -> usize {
        self.inner.lock().await.idle.len()
    }

    pub async fn in_use_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.in_use.retain(|weak| weak.strong_count() > 0);
        inner.in_use.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
