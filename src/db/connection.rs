//! Blocking wrapper over the sqlx driver connections.
//!
//! The dispatcher and worker threads are plain OS threads. Every database call
//! is driven to completion on a shared tokio runtime through its [`Handle`],
//! so no async code leaks out of this module.
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection as _};
use std::fmt;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::Backend;
use crate::config::{
    CONNECT_RETRIES, CONNECT_TIMEOUT, ConnectionConfig, ENTRY_COLUMN, RETRY_BASE_DELAY,
    SQLITE_BUSY_TIMEOUT,
};

/// Anything that can run a single SQL statement.
///
/// Implemented by [`Connection`]; the retry loop is written against this trait
/// so it can be exercised without a database.
pub trait Execute {
    /// Run `sql`, returning the number of rows affected
    fn execute(&mut self, sql: &str) -> Result<u64, sqlx::Error>;
}

enum Inner {
    Postgres(PgConnection),
    MySql(MySqlConnection),
    Sqlite(SqliteConnection),
}

/// One live database connection, identified within its pool by `id`
pub struct Connection {
    id: usize,
    backend: Backend,
    inner: Inner,
    runtime: Handle,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .finish()
    }
}

impl Connection {
    /// Open a connection, retrying up to `CONNECT_RETRIES` times
    pub fn open(id: usize, config: &ConnectionConfig, runtime: &Handle) -> Result<Self, sqlx::Error> {
        let mut attempt = 1;
        loop {
            match Self::connect_once(config, runtime) {
                Ok(inner) => {
                    debug!(id, backend = %config.backend, attempt, "opened connection");
                    return Ok(Self {
                        id,
                        backend: config.backend,
                        inner,
                        runtime: runtime.clone(),
                    });
                }
                Err(err) if attempt < CONNECT_RETRIES => {
                    warn!(id, attempt, error = %err, "connection attempt failed, retrying");
                    std::thread::sleep(RETRY_BASE_DELAY * attempt);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn connect_once(config: &ConnectionConfig, runtime: &Handle) -> Result<Inner, sqlx::Error> {
        runtime.block_on(async {
            let connect = async {
                match config.backend {
                    Backend::Postgres => {
                        let mut options = PgConnectOptions::new()
                            .host(&config.host)
                            .username(&config.username)
                            .password(&config.password)
                            .database(&config.database);
                        if let Some(port) = config.port {
                            options = options.port(port);
                        }
                        options.connect().await.map(Inner::Postgres)
                    }
                    Backend::MySql => {
                        let mut options = MySqlConnectOptions::new()
                            .host(&config.host)
                            .username(&config.username)
                            .password(&config.password)
                            .database(&config.database);
                        if let Some(port) = config.port {
                            options = options.port(port);
                        }
                        options.connect().await.map(Inner::MySql)
                    }
                    Backend::Sqlite => SqliteConnectOptions::new()
                        .filename(&config.database)
                        .create_if_missing(true)
                        .journal_mode(SqliteJournalMode::Wal)
                        .busy_timeout(SQLITE_BUSY_TIMEOUT)
                        .connect()
                        .await
                        .map(Inner::Sqlite),
                }
            };

            tokio::time::timeout(CONNECT_TIMEOUT, connect)
                .await
                .map_err(|_| sqlx::Error::PoolTimedOut)?
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Smallest and largest surrogate key present in a staging table, or
    /// `None` when the table is empty
    pub fn fetch_entry_bounds(&mut self, qualified_stage: &str) -> Result<Option<(i64, i64)>, sqlx::Error> {
        let entry = self.backend.quote_ident(ENTRY_COLUMN);
        let sql = format!("SELECT MIN({entry}), MAX({entry}) FROM {qualified_stage}");
        let bounds = self.fetch_pair(&sql)?;
        Ok(match bounds {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        })
    }

    fn fetch_pair(&mut self, sql: &str) -> Result<(Option<i64>, Option<i64>), sqlx::Error> {
        let runtime = &self.runtime;
        match &mut self.inner {
            Inner::Postgres(conn) => runtime.block_on(sqlx::query_as(sql).fetch_one(conn)),
            Inner::MySql(conn) => runtime.block_on(sqlx::query_as(sql).fetch_one(conn)),
            Inner::Sqlite(conn) => runtime.block_on(sqlx::query_as(sql).fetch_one(conn)),
        }
    }

    /// Row count of a table
    #[cfg(test)]
    pub fn count_rows(&mut self, qualified_table: &str) -> Result<i64, sqlx::Error> {
        let sql = format!("SELECT COUNT(*) FROM {qualified_table}");
        let runtime = &self.runtime;
        let (count,): (i64,) = match &mut self.inner {
            Inner::Postgres(conn) => runtime.block_on(sqlx::query_as(&sql).fetch_one(conn))?,
            Inner::MySql(conn) => runtime.block_on(sqlx::query_as(&sql).fetch_one(conn))?,
            Inner::Sqlite(conn) => runtime.block_on(sqlx::query_as(&sql).fetch_one(conn))?,
        };
        Ok(count)
    }

    /// Close the connection gracefully
    pub fn close(self) -> Result<(), sqlx::Error> {
        let Connection {
            id, inner, runtime, ..
        } = self;
        debug!(id, "closing connection");
        match inner {
            Inner::Postgres(conn) => runtime.block_on(conn.close()),
            Inner::MySql(conn) => runtime.block_on(conn.close()),
            Inner::Sqlite(conn) => runtime.block_on(conn.close()),
        }
    }
}

impl Execute for Connection {
    fn execute(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
        let runtime = &self.runtime;
        match &mut self.inner {
            Inner::Postgres(conn) => {
                runtime.block_on(sqlx::Executor::execute(conn, sql)).map(|r| r.rows_affected())
            }
            Inner::MySql(conn) => {
                runtime.block_on(sqlx::Executor::execute(conn, sql)).map(|r| r.rows_affected())
            }
            Inner::Sqlite(conn) => {
                runtime.block_on(sqlx::Executor::execute(conn, sql)).map(|r| r.rows_affected())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfigBuilder;

    fn sqlite_config(dir: &tempfile::TempDir) -> ConnectionConfig {
        ConnectionConfigBuilder::default()
            .backend(Backend::Sqlite)
            .database(dir.path().join("test.db").to_string_lossy().to_string())
            .build()
            .unwrap()
    }

    #[test]
    fn test_execute_and_entry_bounds() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut conn = Connection::open(7, &sqlite_config(&dir), runtime.handle()).unwrap();
        assert_eq!(conn.id(), 7);

        conn.execute("CREATE TABLE stage_t (entry INTEGER PRIMARY KEY, v TEXT)")
            .unwrap();
        assert_eq!(conn.fetch_entry_bounds("stage_t").unwrap(), None);

        let inserted = conn
            .execute("INSERT INTO stage_t (v) VALUES ('a'), ('b'), ('c')")
            .unwrap();
        assert_eq!(inserted, 3);
        assert_eq!(conn.fetch_entry_bounds("stage_t").unwrap(), Some((1, 3)));
        assert_eq!(conn.count_rows("stage_t").unwrap(), 3);

        assert!(conn.execute("INSERT INTO missing VALUES (1)").is_err());
        conn.close().unwrap();
    }
}
