use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures_util::stream::AbortHandle;
use tokio::net::tcp::OwnedWriteHalf;

pub type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

pub struct ClientConnection {
    /// Unique per accepted socket, unlike `context` which may be recycled.
    pub id: u64,
    pub context: u64,
    pub peer: SocketAddr,
    pub connected_at: i64,
    pub writer: SharedWriter,
    /// Ends the connection's read stream in the gateway reader.
    pub reading: AbortHandle,
}

impl ClientConnection {
    /// Stop reading from this socket. Its stream then yields its final `Closed` frame.
    pub fn stop_reading(&self) {
        self.reading.abort();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub context: u64,
    pub peer: SocketAddr,
    pub connected_at: i64,
}

/// Live remote connections, keyed by the context each was assigned.
#[derive(Default)]
pub struct ClientTable {
    /// context -> ClientConnection
    clients: Mutex<HashMap<u64, ClientConnection>>,
    next_id: AtomicU64,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<u64, ClientConnection>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection under `context`. Returns its connection id.
    pub fn register(
        &self,
        context: u64,
        peer: SocketAddr,
        writer: OwnedWriteHalf,
        reading: AbortHandle,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = ClientConnection {
            id,
            context,
            peer,
            connected_at: Utc::now().timestamp(),
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            reading,
        };
        if let Some(old) = self.clients().insert(context, connection) {
            old.stop_reading();
            tracing::warn!(context, "context was already registered, replaced old connection");
        }
        tracing::info!(context, id, peer = %peer, "client registered");
        id
    }

    /// Remove connection `id` from `context`.
    ///
    /// Returns `None` when the context is gone or now belongs to another connection.
    pub fn unregister(&self, context: u64, id: u64) -> Option<ClientConnection> {
        let mut clients = self.clients();
        if clients.get(&context).is_none_or(|c| c.id != id) {
            return None;
        }
        let removed = clients.remove(&context);
        drop(clients);
        tracing::info!(context, id, "client unregistered");
        removed
    }

    /// Connection id and write half of the client owning `context`.
    pub fn writer_for(&self, context: u64) -> Option<(u64, SharedWriter)> {
        self.clients()
            .get(&context)
            .map(|c| (c.id, c.writer.clone()))
    }

    pub fn contains(&self, context: u64) -> bool {
        self.clients().contains_key(&context)
    }

    /// True while `context` is still owned by connection `id`.
    pub fn is_current(&self, context: u64, id: u64) -> bool {
        self.clients().get(&context).is_some_and(|c| c.id == id)
    }

    pub fn count(&self) -> usize {
        self.clients().len()
    }

    /// Connected clients ordered by context.
    pub fn list(&self) -> Vec<ClientInfo> {
        let mut list: Vec<ClientInfo> = self
            .clients()
            .values()
            .map(|c| ClientInfo {
                context: c.context,
                peer: c.peer,
                connected_at: c.connected_at,
            })
            .collect();
        list.sort_by_key(|c| c.context);
        list
    }

    pub fn drain(&self) -> Vec<ClientConnection> {
        self.clients().drain().map(|(_, c)| c).collect()
    }
}
