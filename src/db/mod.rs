//! Database layer - dialects, blocking connections, pooling, and DDL

pub mod connection;
pub mod dialect;
pub mod pool;
pub mod schema;

pub use connection::{Connection, Execute};
pub use dialect::Backend;
pub use pool::ConnectionPool;
pub use schema::SqlType;
