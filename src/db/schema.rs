//! SQL column types and DDL generation for final and staging tables.

use serde::{Deserialize, Serialize};

use super::Backend;
use crate::config::stage_table_name;
use crate::coordination::scheduler::Table;

/// SQL data type of a destination column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    SmallInt,
    Integer,
    BigInt,
    Real,
    DoublePrecision,
    Text,
    Varchar(u32),
    Date,
}

impl SqlType {
    /// Returns the type name in the given backend's dialect
    pub fn to_sql(&self, backend: Backend) -> String {
        match (self, backend) {
            // SQLite integer affinity keeps foreign key comparisons exact
            (SqlType::SmallInt | SqlType::Integer | SqlType::BigInt, Backend::Sqlite) => {
                "INTEGER".to_string()
            }
            (SqlType::SmallInt, _) => "SMALLINT".to_string(),
            (SqlType::Integer, Backend::MySql) => "INT".to_string(),
            (SqlType::Integer, _) => "INTEGER".to_string(),
            (SqlType::BigInt, _) => "BIGINT".to_string(),
            (SqlType::Real, Backend::MySql) => "FLOAT".to_string(),
            (SqlType::Real, _) => "REAL".to_string(),
            (SqlType::DoublePrecision, Backend::MySql) => "DOUBLE".to_string(),
            (SqlType::DoublePrecision, Backend::Sqlite) => "REAL".to_string(),
            (SqlType::DoublePrecision, Backend::Postgres) => "DOUBLE PRECISION".to_string(),
            (SqlType::Text, _) => "TEXT".to_string(),
            (SqlType::Varchar(n), _) => format!("VARCHAR({n})"),
            (SqlType::Date, Backend::Sqlite) => "TEXT".to_string(),
            (SqlType::Date, _) => "DATE".to_string(),
        }
    }
}

/// Generate `CREATE TABLE IF NOT EXISTS` for a final table, with its primary
/// and foreign keys
pub fn final_table_ddl(backend: Backend, schema: &str, table: &Table) -> String {
    let mut defs: Vec<String> = table
        .columns()
        .iter()
        .map(|col| {
            let not_null = !col.nullable || table.primary_key_columns().contains(&col.name);
            format!(
                "  {} {}{}",
                backend.quote_ident(&col.name),
                col.sql_type.to_sql(backend),
                if not_null { " NOT NULL" } else { "" }
            )
        })
        .collect();

    if !table.primary_key_columns().is_empty() {
        defs.push(format!("  PRIMARY KEY ({})", quote_list(backend, table.primary_key_columns())));
    }

    for fk in table.foreign_keys() {
        // SQLite only resolves references within the referencing table's schema
        let referenced = match backend {
            Backend::Sqlite => backend.quote_ident(&fk.references_table),
            Backend::Postgres | Backend::MySql => backend.qualify(schema, &fk.references_table),
        };
        defs.push(format!(
            "  FOREIGN KEY ({}) REFERENCES {} ({})",
            quote_list(backend, &fk.columns),
            referenced,
            quote_list(backend, &fk.references_columns)
        ));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        backend.qualify(schema, table.name()),
        defs.join(",\n")
    )
}

/// Generate `CREATE TABLE IF NOT EXISTS` for a staging table: the final
/// table's columns, all nullable, behind a surrogate `entry` key
pub fn stage_table_ddl(backend: Backend, schema: &str, table: &Table) -> String {
    let mut defs = vec![format!("  {}", backend.entry_column_definition())];
    defs.extend(table.columns().iter().map(|col| {
        format!(
            "  {} {}",
            backend.quote_ident(&col.name),
            col.sql_type.to_sql(backend)
        )
    }));

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        backend.qualify(schema, &stage_table_name(table.name())),
        defs.join(",\n")
    )
}

fn quote_list(backend: Backend, names: &[String]) -> String {
    names
        .iter()
        .map(|n| backend.quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}
