//! Bounded pool of live connections with available/blocked accounting.
//!
//! Connections are owned values: `get_available_connection` moves one out of
//! the pool and records its id as blocked, and `free_connection` takes it back.
//! A blocked connection therefore lives with exactly one worker at a time.
use std::collections::BTreeSet;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::Backend;
use super::connection::Connection;
use crate::config::{CONNECT_RETRIES, ConnectionConfig};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to connect to {backend} database '{database}' after {attempts} attempts")]
    Connect {
        backend: Backend,
        database: String,
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("Connection {0} is not blocked and cannot be freed")]
    NotBlocked(usize),
}

pub struct ConnectionPool {
    config: ConnectionConfig,
    runtime: Handle,
    available: Vec<Connection>,
    blocked: BTreeSet<usize>,
    next_id: usize,
}

impl ConnectionPool {
    /// Create an empty pool; connections are opened lazily by `add_connection`
    pub fn new(config: ConnectionConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            available: Vec::new(),
            blocked: BTreeSet::new(),
            next_id: 0,
        }
    }

    pub fn backend(&self) -> Backend {
        self.config.backend
    }

    pub fn max_connections(&self) -> usize {
        self.config.max_connections
    }

    /// Number of live connections, available and blocked
    pub fn len(&self) -> usize {
        self.available.len() + self.blocked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    pub fn has_room(&self) -> bool {
        self.len() < self.config.max_connections
    }

    /// Open one more connection if the pool has room.
    ///
    /// Returns `Ok(false)` without connecting when the pool is already full.
    pub fn add_connection(&mut self) -> Result<bool, PoolError> {
        if !self.has_room() {
            warn!(
                max_connections = self.config.max_connections,
                "Connection pool is full, not adding a connection"
            );
            return Ok(false);
        }

        let id = self.next_id;
        let conn = Connection::open(id, &self.config, &self.runtime).map_err(|source| {
            PoolError::Connect {
                backend: self.config.backend,
                database: self.config.database.clone(),
                attempts: CONNECT_RETRIES,
                source,
            }
        })?;
        self.next_id += 1;
        self.available.push(conn);
        debug!(id, size = self.len(), "added connection to pool");
        Ok(true)
    }

    /// Take an available connection, marking it blocked
    pub fn get_available_connection(&mut self) -> Option<Connection> {
        let conn = self.available.pop()?;
        self.blocked.insert(conn.id());
        Some(conn)
    }

    /// Return a blocked connection to the available set
    pub fn free_connection(&mut self, conn: Connection) -> Result<(), PoolError> {
        if !self.blocked.remove(&conn.id()) {
            return Err(PoolError::NotBlocked(conn.id()));
        }
        self.available.push(conn);
        Ok(())
    }

    /// Forget a blocked connection whose owner could not hand it back
    pub fn discard_connection(&mut self, id: usize) {
        if self.blocked.remove(&id) {
            warn!(id, "discarding connection that was not returned");
        }
    }

    /// Backpressure signal: every permitted connection is in use
    pub fn all_connections_blocked(&self) -> bool {
        self.blocked.len() == self.config.max_connections
    }

    /// Change the pool bound; rejected when below the current pool size
    pub fn set_max_connections(&mut self, max_connections: usize) -> bool {
        if max_connections < self.len() {
            warn!(
                requested = max_connections,
                size = self.len(),
                "Cannot set max connections below the current pool size"
            );
            return false;
        }
        self.config.max_connections = max_connections;
        true
    }

    /// Target database for connections opened from now on
    pub fn set_database(&mut self, database: &str) {
        self.config.database = database.to_string();
    }

    pub fn database(&self) -> &str {
        &self.config.database
    }

    /// Close and discard every connection
    pub fn clear(&mut self) {
        if !self.blocked.is_empty() {
            warn!(
                blocked = self.blocked.len(),
                "Clearing pool while connections are still blocked"
            );
        }
        let closed = self.available.len();
        for conn in self.available.drain(..) {
            let id = conn.id();
            if let Err(err) = conn.close() {
                warn!(id, error = %err, "error closing connection");
            }
        }
        self.blocked.clear();
        info!(closed, "closed pooled connections");
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if !self.is_empty() {
            self.clear();
        }
    }
}
