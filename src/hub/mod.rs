//! Connection hub
//!
//! Owns the session → connection map. A session has at most one live
//! connection; registering a new one evicts the previous owner. Outbound
//! delivery is best effort: each connection has a bounded queue and
//! payloads that do not fit are dropped.

pub mod connection;
pub mod reply;
pub mod server;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::session::SessionKey;

pub use reply::ReplyRouter;
pub use server::{router, HubState};

/// Hub-side half of a registered connection
#[derive(Debug)]
struct ConnectionHandle {
    conn_id: u64,
    outbound: mpsc::Sender<String>,
    closed: CancellationToken,
}

/// Connection-side half returned by [`Hub::register`]
#[derive(Debug)]
pub struct Registration {
    pub conn_id: u64,
    /// Payloads dispatched to this connection
    pub outbound: mpsc::Receiver<String>,
    /// Fires when the connection is evicted or torn down
    pub closed: CancellationToken,
}

/// Result of [`Hub::dispatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Queued,
    /// Queue full; payload discarded
    Dropped,
    /// No live connection for the session
    NotConnected,
}

/// Session → connection registry
pub struct Hub {
    connections: Mutex<HashMap<SessionKey, ConnectionHandle>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Hub {
    /// Creates a hub whose connections queue up to `capacity` payloads
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<SessionKey, ConnectionHandle>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs a new connection as the sole owner of `key`, closing the
    /// previous owner if there was one
    pub fn register(&self, key: &SessionKey) -> Registration {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.capacity);
        let closed = CancellationToken::new();

        let previous = self.connections().insert(
            key.clone(),
            ConnectionHandle {
                conn_id,
                outbound: outbound_tx,
                closed: closed.clone(),
            },
        );

        if let Some(previous) = previous {
            tracing::info!(
                user_id = %key.user_id,
                chat_id = %key.chat_id,
                evicted = previous.conn_id,
                conn_id,
                "Evicting previous connection"
            );
            previous.closed.cancel();
        }

        Registration {
            conn_id,
            outbound: outbound_rx,
            closed,
        }
    }

    /// Removes the mapping if `conn_id` still owns `key`; returns true when
    /// it did
    pub fn unregister(&self, key: &SessionKey, conn_id: u64) -> bool {
        let removed = {
            let mut connections = self.connections();
            match connections.get(key) {
                Some(handle) if handle.conn_id == conn_id => connections.remove(key),
                _ => None,
            }
        };

        match removed {
            Some(handle) => {
                handle.closed.cancel();
                true
            }
            None => false,
        }
    }

    /// Enqueues `payload` for the session's connection without waiting
    pub fn dispatch(&self, key: &SessionKey, payload: String) -> Dispatch {
        let connections = self.connections();
        let Some(handle) = connections.get(key) else {
            return Dispatch::NotConnected;
        };
        match handle.outbound.try_send(payload) {
            Ok(()) => Dispatch::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Dispatch::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Dispatch::NotConnected,
        }
    }

    /// Id of the connection currently owning `key`
    pub fn owner(&self, key: &SessionKey) -> Option<u64> {
        self.connections().get(key).map(|h| h.conn_id)
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
