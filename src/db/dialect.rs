//! SQL dialect differences between the supported database backends.

use anyhow::Result;
use std::fmt;

use crate::config::ENTRY_COLUMN;

/// Database backend, which also selects the SQL dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Postgres,
    MySql,
    Sqlite,
}

impl Backend {
    /// Parse a driver name (case-insensitive)
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Backend::Postgres),
            "mysql" | "mariadb" => Ok(Backend::MySql),
            "sqlite" | "sqlite3" => Ok(Backend::Sqlite),
            _ => Err(anyhow::anyhow!(
                "Unsupported driver: {}. Supported drivers: postgres, mysql, sqlite",
                s
            )),
        }
    }

    /// Schema used when none is configured
    pub fn default_schema(&self, database: &str) -> String {
        match self {
            Backend::Postgres => "public".to_string(),
            Backend::MySql => database.to_string(),
            Backend::Sqlite => "main".to_string(),
        }
    }

    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            Backend::MySql => format!("`{}`", ident.replace('`', "``")),
            Backend::Postgres | Backend::Sqlite => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Schema-qualified, quoted table name
    pub fn qualify(&self, schema: &str, table: &str) -> String {
        format!("{}.{}", self.quote_ident(schema), self.quote_ident(table))
    }

    /// Clause appended to an INSERT so that conflicting rows are left untouched.
    ///
    /// MySQL has no `DO NOTHING`; assigning a column to itself is the no-op
    /// form, qualified so it stays unambiguous inside `INSERT ... SELECT`.
    pub fn ignore_conflict_clause(&self, qualified_target: &str, first_column: &str) -> String {
        match self {
            Backend::MySql => {
                let col = format!("{}.{}", qualified_target, self.quote_ident(first_column));
                format!("ON DUPLICATE KEY UPDATE {col} = {col}")
            }
            Backend::Postgres | Backend::Sqlite => "ON CONFLICT DO NOTHING".to_string(),
        }
    }

    /// Statements that empty a staging table and restart its surrogate counter
    pub fn reset_stage_statements(&self, schema: &str, stage_table: &str) -> Vec<String> {
        let table = self.qualify(schema, stage_table);
        match self {
            Backend::MySql => {
                let temp = self.qualify(schema, &format!("{stage_table}_temp"));
                vec![
                    format!("RENAME TABLE {table} TO {temp}"),
                    format!("CREATE TABLE {table} LIKE {temp}"),
                    format!("DROP TABLE {temp}"),
                    format!("ALTER TABLE {table} AUTO_INCREMENT = 1"),
                ]
            }
            Backend::Postgres => vec![format!("TRUNCATE TABLE {table} RESTART IDENTITY")],
            // Without AUTOINCREMENT the rowid restarts at 1 once the table is empty
            Backend::Sqlite => vec![format!("DELETE FROM {table}")],
        }
    }

    /// Statement that creates the target schema, where the backend has one
    pub fn create_schema_statement(&self, schema: &str) -> Option<String> {
        match self {
            Backend::Postgres => Some(format!("CREATE SCHEMA IF NOT EXISTS {}", self.quote_ident(schema))),
            Backend::MySql => Some(format!("CREATE DATABASE IF NOT EXISTS {}", self.quote_ident(schema))),
            Backend::Sqlite => None,
        }
    }

    /// Column definition of the staging surrogate key
    pub fn entry_column_definition(&self) -> String {
        let entry = self.quote_ident(ENTRY_COLUMN);
        match self {
            Backend::Postgres => format!("{entry} BIGSERIAL PRIMARY KEY"),
            Backend::MySql => format!("{entry} BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY"),
            Backend::Sqlite => format!("{entry} INTEGER PRIMARY KEY"),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Postgres => "postgres",
            Backend::MySql => "mysql",
            Backend::Sqlite => "sqlite",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
