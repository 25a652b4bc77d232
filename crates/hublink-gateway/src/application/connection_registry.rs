//! Registry of live WebSocket connections.
//!
//! Every accepted socket is registered here under a fresh [`ConnectionId`].
//! Once it authenticates it is also indexed by its [`ClientId`]; at most one
//! connection per client is ever indexed, so a client that reconnects
//! supersedes its previous connection.
//!
//! The registry never touches a socket.  Each connection is represented by a
//! [`ConnectionHandle`]: a bounded queue of [`Outbound`] items drained by the
//! connection's writer task, plus a close signal.  That keeps every lock
//! section short and free of I/O.
//!
//! # Fan-out
//!
//! [`ConnectionRegistry::broadcast`] takes a snapshot of the matching handles
//! under the lock, releases it, and then enqueues without waiting.  A
//! connection whose queue is full is closed as a slow consumer instead of
//! stalling delivery to everyone else.
//!
//! # Liveness
//!
//! [`ConnectionRegistry::sweep_liveness`] runs once per probe interval:
//!
//! ```text
//! alive?  ── yes ──► mark not-alive, enqueue Probe (WebSocket ping)
//!    └──── no ───► remove from both indexes, close
//! ```
//!
//! A pong frame or an application `ping` marks the connection alive again,
//! so a silent peer is gone after at most two intervals.

use std::collections::HashMap;
use std::sync::Arc;

use hublink_core::{ClientId, EntityChangeEvent, EntityFilter, ServerMessage};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifier of one accepted socket.
pub type ConnectionId = Uuid;

/// An item on a connection's outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Encode and send as a text frame.
    Message(ServerMessage),
    /// Send a WebSocket ping frame.
    Probe,
}

/// Why a connection was closed from the server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The same client authenticated on a newer connection.
    Superseded,
    /// No pong or `ping` within a probe interval.
    LivenessTimeout,
    /// The outbound queue was full.
    SlowConsumer,
    /// The gateway is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Short reason sent in the WebSocket close frame.
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Superseded => "superseded by a newer connection",
            CloseReason::LivenessTimeout => "liveness timeout",
            CloseReason::SlowConsumer => "slow consumer",
            CloseReason::Shutdown => "server shutting down",
        }
    }
}

/// Failure to enqueue onto a connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue is full")]
    Full,
    #[error("connection is closed")]
    Closed,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

// ── ConnectionHandle ──────────────────────────────────────────────────────────

/// The receiving ends owned by a connection's I/O tasks.
#[derive(Debug)]
pub struct ConnectionChannels {
    pub outbound: mpsc::Receiver<Outbound>,
    pub close: watch::Receiver<Option<CloseReason>>,
}

/// Sending side of one connection.  Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    close_tx: Arc<watch::Sender<Option<CloseReason>>>,
}

impl ConnectionHandle {
    /// Creates a handle with a fresh id and an outbound queue of `capacity`.
    pub fn new(capacity: usize) -> (Self, ConnectionChannels) {
        let (tx, outbound) = mpsc::channel(capacity.max(1));
        let (close_tx, close) = watch::channel(None);
        let handle = Self {
            id: Uuid::new_v4(),
            tx,
            close_tx: Arc::new(close_tx),
        };
        (handle, ConnectionChannels { outbound, close })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueues without waiting.
    pub fn try_send(&self, item: Outbound) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Signals the connection's tasks to stop.  Items still queued are
    /// discarded.  Only the first reason is kept.
    pub fn close(&self, reason: CloseReason) {
        self.close_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_tx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason().is_some() || self.tx.is_closed()
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Entry {
    handle: ConnectionHandle,
    client_id: Option<ClientId>,
    alive: bool,
    filter: EntityFilter,
}

#[derive(Debug, Default)]
struct Inner {
    connections: HashMap<ConnectionId, Entry>,
    by_client: HashMap<ClientId, ConnectionId>,
}

impl Inner {
    /// Removes `id` from both indexes.
    fn remove(&mut self, id: ConnectionId) -> Option<Entry> {
        let entry = self.connections.remove(&id)?;
        if let Some(client_id) = entry.client_id {
            if self.by_client.get(&client_id) == Some(&id) {
                self.by_client.remove(&client_id);
            }
        }
        Some(entry)
    }
}

/// Result of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the event was enqueued on.
    pub delivered: usize,
    /// Connections closed because they could not accept the event.
    pub dropped: Vec<ConnectionId>,
}

/// Result of one liveness sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessReport {
    /// Connections probed this round.
    pub probed: usize,
    /// Connections removed because they never answered the last probe.
    pub terminated: Vec<ConnectionId>,
}

/// Owner of every live connection.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an unauthenticated connection.
    pub async fn register(&self, handle: ConnectionHandle) {
        let id = handle.id();
        let mut inner = self.inner.lock().await;
        inner.connections.insert(
            id,
            Entry {
                handle,
                client_id: None,
                alive: true,
                filter: EntityFilter::all(),
            },
        );
        debug!("connection {id} registered ({} total)", inner.connections.len());
    }

    /// Binds `conn_id` to `client_id`.
    ///
    /// Returns the handle of the connection previously bound to the same
    /// client, which the caller must close.  The old connection is removed
    /// from the registry before this returns, so it never receives another
    /// broadcast.
    pub async fn authenticate(
        &self,
        conn_id: ConnectionId,
        client_id: ClientId,
    ) -> Result<Option<ConnectionHandle>, RegistryError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .connections
            .get_mut(&conn_id)
            .ok_or(RegistryError::UnknownConnection(conn_id))?;
        entry.client_id = Some(client_id);
        entry.alive = true;

        let previous = inner.by_client.insert(client_id, conn_id);
        let evicted = match previous {
            Some(old) if old != conn_id => inner.remove(old).map(|e| e.handle),
            _ => None,
        };
        if evicted.is_some() {
            info!("client {client_id} superseded its previous connection");
        }
        Ok(evicted)
    }

    /// Replaces the entity filter of a connection.  Returns `false` if the
    /// connection is gone.
    pub async fn set_filter(&self, conn_id: ConnectionId, filter: EntityFilter) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.connections.get_mut(&conn_id) {
            Some(entry) => {
                entry.filter = filter;
                true
            }
            None => false,
        }
    }

    /// Records that the peer answered.
    pub async fn mark_alive(&self, conn_id: ConnectionId) {
        if let Some(entry) = self.inner.lock().await.connections.get_mut(&conn_id) {
            entry.alive = true;
        }
    }

    /// Removes a connection.  Returns the client it was authenticated as
    /// when removing it left that client with no live connection; a
    /// superseded connection returns `None`.
    pub async fn unregister(&self, conn_id: ConnectionId) -> Option<ClientId> {
        let mut inner = self.inner.lock().await;
        let client_id = inner.connections.get(&conn_id)?.client_id;
        let vacated = client_id.filter(|c| inner.by_client.get(c) == Some(&conn_id));
        inner.remove(conn_id);
        debug!("connection {conn_id} unregistered ({} remaining)", inner.connections.len());
        vacated
    }

    pub async fn is_authenticated(&self, conn_id: ConnectionId) -> bool {
        let inner = self.inner.lock().await;
        inner
            .connections
            .get(&conn_id)
            .map(|e| e.client_id.is_some())
            .unwrap_or(false)
    }

    /// `true` when some live connection is authenticated as `client_id`.
    pub async fn has_client(&self, client_id: ClientId) -> bool {
        self.inner.lock().await.by_client.contains_key(&client_id)
    }

    /// Sends `msg` to the connection authenticated as `client_id`.
    ///
    /// Returns `false` when the client has no live connection or its queue
    /// cannot take the message.
    pub async fn send_to_client(&self, client_id: ClientId, msg: ServerMessage) -> bool {
        let handle = {
            let inner = self.inner.lock().await;
            let Some(conn_id) = inner.by_client.get(&client_id) else {
                return false;
            };
            match inner.connections.get(conn_id) {
                Some(entry) => entry.handle.clone(),
                None => return false,
            }
        };

        match handle.try_send(Outbound::Message(msg)) {
            Ok(()) => true,
            Err(SendError::Full) => {
                warn!("connection {} queue full; closing slow consumer", handle.id());
                handle.close(CloseReason::SlowConsumer);
                self.unregister(handle.id()).await;
                false
            }
            Err(SendError::Closed) => {
                self.unregister(handle.id()).await;
                false
            }
        }
    }

    /// Enqueues `event` as an `entity_update` on every authenticated
    /// connection whose filter matches it.
    pub async fn broadcast(&self, event: &EntityChangeEvent) -> BroadcastReport {
        let targets: Vec<ConnectionHandle> = {
            let inner = self.inner.lock().await;
            inner
                .connections
                .values()
                .filter(|e| e.client_id.is_some() && e.filter.matches(&event.entity_id))
                .map(|e| e.handle.clone())
                .collect()
        };

        let msg = ServerMessage::EntityUpdate {
            entity_id: event.entity_id.clone(),
            state: event.new_state.clone(),
        };

        let mut report = BroadcastReport::default();
        for handle in &targets {
            match handle.try_send(Outbound::Message(msg.clone())) {
                Ok(()) => report.delivered += 1,
                Err(SendError::Full) => {
                    warn!("connection {} queue full; closing slow consumer", handle.id());
                    handle.close(CloseReason::SlowConsumer);
                    report.dropped.push(handle.id());
                }
                Err(SendError::Closed) => report.dropped.push(handle.id()),
            }
        }

        if !report.dropped.is_empty() {
            let mut inner = self.inner.lock().await;
            for id in &report.dropped {
                inner.remove(*id);
            }
        }
        report
    }

    /// Runs one liveness round.
    pub async fn sweep_liveness(&self) -> LivenessReport {
        let mut probes = Vec::new();
        let mut dead = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            let stale: Vec<ConnectionId> = inner
                .connections
                .iter()
                .filter(|(_, e)| !e.alive)
                .map(|(id, _)| *id)
                .collect();
            for id in stale {
                if let Some(entry) = inner.remove(id) {
                    dead.push(entry.handle);
                }
            }
            for entry in inner.connections.values_mut() {
                entry.alive = false;
                probes.push(entry.handle.clone());
            }
        }

        let mut report = LivenessReport {
            probed: 0,
            terminated: Vec::with_capacity(dead.len()),
        };
        for handle in dead {
            info!("connection {} missed its liveness probe; terminating", handle.id());
            handle.close(CloseReason::LivenessTimeout);
            report.terminated.push(handle.id());
        }
        for handle in probes {
            // A full queue is left for the next round to judge.
            if handle.try_send(Outbound::Probe).is_ok() {
                report.probed += 1;
            }
        }
        report
    }

    /// Closes and removes every connection.
    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let entries: Vec<Entry> = {
            let mut inner = self.inner.lock().await;
            inner.by_client.clear();
            inner.connections.drain().map(|(_, e)| e).collect()
        };
        for entry in &entries {
            entry.handle.close(reason);
        }
        entries.len()
    }

    /// Number of registered connections, authenticated or not.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn authenticated_count(&self) -> usize {
        self.inner.lock().await.by_client.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
