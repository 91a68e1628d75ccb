use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{CatalogError, ImportType};
use crate::coordination::scheduler::{Column, ForeignKey, Schema, Table};
use crate::db::SqlType;
use crate::formats::Conversion;

/// Column definition (JSON serialization format)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnJson {
    /// Header of the column in the source file
    pub raw_name: String,
    pub name: String,
    #[serde(rename = "type")]
    pub sql_type: SqlType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Overrides the conversion implied by `type`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion: Option<Conversion>,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyJson {
    pub columns: Vec<String>,
    pub references: String,
    pub references_columns: Vec<String>,
}

/// Table definition (JSON serialization format)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableJson {
    pub name: String,
    pub columns: Vec<ColumnJson>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyJson>,
    /// Tables that must be populated before this one
    #[serde(default)]
    pub prereqs: Vec<String>,
}

/// A whole import type (JSON serialization format)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogJson {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub staging_required: bool,
    pub tables: Vec<TableJson>,
}

impl From<&ColumnJson> for Column {
    fn from(json: &ColumnJson) -> Self {
        let mut column = Column::new(&json.raw_name, &json.name, json.sql_type.clone());
        column.nullable = json.nullable;
        match &json.conversion {
            Some(conversion) => column.with_conversion(conversion.clone()),
            None => column,
        }
    }
}

impl From<&TableJson> for Table {
    fn from(json: &TableJson) -> Self {
        let primary_key: Vec<&str> = json.primary_key.iter().map(String::as_str).collect();
        let mut table = json
            .columns
            .iter()
            .fold(Table::new(&json.name), |table, col| table.column(col.into()))
            .primary_key(&primary_key);
        for fk in &json.foreign_keys {
            let columns: Vec<&str> = fk.columns.iter().map(String::as_str).collect();
            let references: Vec<&str> = fk.references_columns.iter().map(String::as_str).collect();
            table = table.foreign_key(ForeignKey::new(&columns, &fk.references, &references));
        }
        table
    }
}

/// An import type declared in a JSON catalog file
#[derive(Debug, Clone)]
pub struct JsonCatalog {
    catalog: CatalogJson,
}

impl JsonCatalog {
    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = serde_json::from_str(&content).map_err(|source| CatalogError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let custom = Self::new(catalog);
        // Surface structural errors at load time rather than mid-run
        custom.schema()?;
        Ok(custom)
    }

    pub fn new(catalog: CatalogJson) -> Self {
        Self { catalog }
    }
}

impl ImportType for JsonCatalog {
    fn key(&self) -> &str {
        &self.catalog.key
    }

    fn name(&self) -> &str {
        &self.catalog.name
    }

    fn schema(&self) -> Result<Schema, CatalogError> {
        let mut schema = Schema::new(&self.catalog.key, self.catalog.staging_required);
        let mut ids = Vec::with_capacity(self.catalog.tables.len());
        for table in &self.catalog.tables {
            ids.push(schema.add_table(table.into())?);
        }

        for (table, id) in self.catalog.tables.iter().zip(ids) {
            for prereq in &table.prereqs {
                let prereq_id = schema.table_id(prereq).ok_or_else(|| CatalogError::UnknownPrereq {
                    table: table.name.clone(),
                    prereq: prereq.clone(),
                })?;
                schema.add_prereq(id, prereq_id)?;
            }
        }
        Ok(schema)
    }
}
