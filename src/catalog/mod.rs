//! Import-type catalogs: the destination tables of each supported dataset and
//! the DDL that creates them.

mod crime_index;
mod hcdc;
mod hpd;
mod json;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::RetryPolicy;
use crate::coordination::scheduler::{Schema, SchedulerError};
use crate::coordination::worker::{ExecutionError, execute_sql};
use crate::db::schema::{final_table_ddl, stage_table_ddl};
use crate::db::{Backend, Execute};
use crate::formats::Conversion;

pub use crime_index::CrimeIndex;
pub use hcdc::HcdcSnapshot;
pub use hpd::HpdIncidents;
pub use json::JsonCatalog;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Unknown import type '{0}'. Supported types: hcdc, hpd, ci, or a --catalog file")]
    UnknownType(String),

    #[error("Failed to read catalog {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse catalog {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Table '{table}' lists unknown prerequisite '{prereq}'")]
    UnknownPrereq { table: String, prereq: String },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// The capabilities of one kind of import
pub trait ImportType: Send + Sync {
    /// Short identifier used on the command line
    fn key(&self) -> &str;

    /// Human-readable dataset name
    fn name(&self) -> &str;

    /// Build the table DAG for this import
    fn schema(&self) -> Result<Schema, CatalogError>;

    /// Raw column -> conversion mapping applied to every loaded file
    fn conversion_map(&self) -> Result<BTreeMap<String, Conversion>, CatalogError> {
        Ok(self.schema()?.conversion_map()?)
    }

    /// Create the database schema, final tables, and (when staging is
    /// required) staging tables, prerequisites first
    fn create(
        &self,
        conn: &mut dyn Execute,
        backend: Backend,
        schema_name: &str,
        retry: &RetryPolicy,
    ) -> Result<usize, CreateError> {
        let schema = self.schema()?;
        create_tables(conn, backend, schema_name, &schema, retry)
    }
}

#[derive(Debug, Error)]
pub enum CreateError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// Issue the DDL for every table of `schema`, returning the number of
/// statements executed
pub fn create_tables(
    conn: &mut dyn Execute,
    backend: Backend,
    schema_name: &str,
    schema: &Schema,
    retry: &RetryPolicy,
) -> Result<usize, CreateError> {
    let mut statements = Vec::new();
    statements.extend(backend.create_schema_statement(schema_name));
    for id in schema.topological_order() {
        let Some(table) = schema.table(id) else {
            continue;
        };
        statements.push(final_table_ddl(backend, schema_name, &table));
        if schema.staging_required() {
            statements.push(stage_table_ddl(backend, schema_name, &table));
        }
    }

    for statement in &statements {
        debug!(statement = %statement, "creating table");
        execute_sql(conn, statement, retry)?;
    }
    info!(
        schema = schema.name(),
        target = schema_name,
        statements = statements.len(),
        "Created tables"
    );
    Ok(statements.len())
}

/// Resolve an import type by key, or load a JSON catalog when a path is
/// given. A key given alongside a catalog must match the catalog's key.
pub fn resolve(key: Option<&str>, catalog: Option<&Path>) -> Result<Box<dyn ImportType>, CatalogError> {
    if let Some(path) = catalog {
        let custom = JsonCatalog::from_path(path)?;
        return match key {
            Some(key) if key != custom.key() => Err(CatalogError::UnknownType(key.to_string())),
            _ => Ok(Box::new(custom)),
        };
    }

    let key = key.unwrap_or_default();
    match key.trim().to_lowercase().as_str() {
        "hcdc" => Ok(Box::new(HcdcSnapshot)),
        "hpd" => Ok(Box::new(HpdIncidents)),
        "ci" | "crime-index" => Ok(Box::new(CrimeIndex)),
        _ => Err(CatalogError::UnknownType(key.to_string())),
    }
}
