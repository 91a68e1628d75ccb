//! Dependency-ordered table scheduler.
//!
//! A [`Schema`] holds the destination tables of one import type as a DAG of
//! prerequisite edges. Tables move PENDING -> PROCESSING -> COMPLETED, and a
//! table can only be claimed once every one of its prerequisites has
//! completed. Claiming is pull-based ([`Schema::get_available_table`]) so the
//! dispatcher can interleave it with connection availability.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::db::schema::SqlType;
use crate::formats::conversion::Conversion;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Table '{0}' is already registered in the schema")]
    DuplicateTable(String),

    #[error("Table '{table}' declares column '{column}' more than once")]
    DuplicateColumn { table: String, column: String },

    #[error("Unknown table id {0}")]
    UnknownTable(usize),

    #[error("Prerequisite '{prereq}' -> '{table}' would create a dependency cycle")]
    Cycle { table: String, prereq: String },

    #[error("Raw column '{column}' is converted differently by table '{table}'")]
    ConversionConflict { table: String, column: String },
}

/// Processing state of a table within one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableStatus {
    Pending,
    Processing,
    Completed,
}

/// Maps a raw file column onto a destination column
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub raw_name: String,
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub conversion: Conversion,
}

impl Column {
    /// A nullable column converted with the default conversion for its type
    pub fn new(raw_name: &str, name: &str, sql_type: SqlType) -> Self {
        Self {
            raw_name: raw_name.to_string(),
            name: name.to_string(),
            conversion: Conversion::for_type(&sql_type),
            sql_type,
            nullable: true,
        }
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_conversion(mut self, conversion: Conversion) -> Self {
        self.conversion = conversion;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub references_table: String,
    pub references_columns: Vec<String>,
}

impl ForeignKey {
    pub fn new(columns: &[&str], references_table: &str, references_columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            references_table: references_table.to_string(),
            references_columns: references_columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// A destination table definition
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    name: String,
    columns: Vec<Column>,
    primary_key: Vec<String>,
    foreign_keys: Vec<ForeignKey>,
}

impl Table {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn primary_key_columns(&self) -> &[String] {
        &self.primary_key
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    fn duplicate_column(&self) -> Option<&str> {
        let mut seen = BTreeSet::new();
        self.columns
            .iter()
            .find(|c| !seen.insert(c.name.as_str()))
            .map(|c| c.name.as_str())
    }
}

/// Index of a table within its schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(usize);

/// A claimed table, cheap to clone and send to a worker thread
#[derive(Debug, Clone)]
pub struct TableHandle {
    pub id: TableId,
    pub table: Arc<Table>,
}

impl Deref for TableHandle {
    type Target = Table;

    fn deref(&self) -> &Table {
        &self.table
    }
}

/// The tables of one import type and their progress through a phase
#[derive(Debug, Clone)]
pub struct Schema {
    name: String,
    staging_required: bool,
    tables: Vec<Arc<Table>>,
    prereqs: Vec<BTreeSet<TableId>>,
    status: Vec<TableStatus>,
    pending: BTreeSet<TableId>,
    processing: BTreeSet<TableId>,
    completed: BTreeSet<TableId>,
}

impl Schema {
    pub fn new(name: &str, staging_required: bool) -> Self {
        Self {
            name: name.to_string(),
            staging_required,
            tables: Vec::new(),
            prereqs: Vec::new(),
            status: Vec::new(),
            pending: BTreeSet::new(),
            processing: BTreeSet::new(),
            completed: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn staging_required(&self) -> bool {
        self.staging_required
    }

    /// Register a table as pending
    pub fn add_table(&mut self, table: Table) -> Result<TableId, SchedulerError> {
        if self.table_id(table.name()).is_some() {
            return Err(SchedulerError::DuplicateTable(table.name.clone()));
        }
        if let Some(column) = table.duplicate_column() {
            return Err(SchedulerError::DuplicateColumn {
                table: table.name.clone(),
                column: column.to_string(),
            });
        }

        let id = TableId(self.tables.len());
        self.tables.push(Arc::new(table));
        self.prereqs.push(BTreeSet::new());
        self.status.push(TableStatus::Pending);
        self.pending.insert(id);
        Ok(id)
    }

    /// Declare that `table` may only be claimed after `prereq` completes.
    ///
    /// Edges that would close a cycle are rejected here, so the scheduler never
    /// has to discover an unsatisfiable table at runtime.
    pub fn add_prereq(&mut self, table: TableId, prereq: TableId) -> Result<(), SchedulerError> {
        self.check(table)?;
        self.check(prereq)?;

        if table == prereq || self.depends_on(prereq, table) {
            return Err(SchedulerError::Cycle {
                table: self.tables[table.0].name.clone(),
                prereq: self.tables[prereq.0].name.clone(),
            });
        }

        self.prereqs[table.0].insert(prereq);
        Ok(())
    }

    /// True if `table` transitively requires `target`
    fn depends_on(&self, table: TableId, target: TableId) -> bool {
        let mut stack = vec![table];
        let mut visited = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if visited.insert(current) {
                stack.extend(self.prereqs[current.0].iter().copied());
            }
        }
        false
    }

    fn check(&self, id: TableId) -> Result<(), SchedulerError> {
        if id.0 < self.tables.len() {
            Ok(())
        } else {
            Err(SchedulerError::UnknownTable(id.0))
        }
    }

    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.tables
            .iter()
            .position(|t| t.name == name)
            .map(TableId)
    }

    pub fn table(&self, id: TableId) -> Option<TableHandle> {
        self.tables.get(id.0).map(|table| TableHandle {
            id,
            table: Arc::clone(table),
        })
    }

    #[cfg(test)]
    pub fn tables(&self) -> impl Iterator<Item = TableHandle> + '_ {
        (0..self.tables.len()).filter_map(|i| self.table(TableId(i)))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn prereqs(&self, id: TableId) -> impl Iterator<Item = TableId> + '_ {
        self.prereqs
            .get(id.0)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    #[cfg(test)]
    pub fn status(&self, id: TableId) -> Option<TableStatus> {
        self.status.get(id.0).copied()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn processing_count(&self) -> usize {
        self.processing.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Claim the first pending table whose prerequisites have all completed,
    /// moving it to PROCESSING.
    ///
    /// Returns `None` when nothing is currently claimable, whether or not
    /// pending tables remain.
    pub fn get_available_table(&mut self) -> Option<TableHandle> {
        debug!(
            pending = ?self.names(&self.pending),
            processing = ?self.names(&self.processing),
            "looking for an available table"
        );

        if self.pending.is_empty() {
            debug!("There are no pending tables");
            return None;
        }

        let ready = self
            .pending
            .iter()
            .copied()
            .find(|id| self.prereqs[id.0].is_subset(&self.completed));

        match ready {
            Some(id) => {
                self.pending.remove(&id);
                self.processing.insert(id);
                self.status[id.0] = TableStatus::Processing;
                debug!(table = %self.tables[id.0].name, "claimed table");
                self.table(id)
            }
            None => {
                debug!("There are no tables whose prerequisites are completed");
                None
            }
        }
    }

    /// Advance a table one state forward. Advancing a completed table is a
    /// logged no-op.
    pub fn advance_table_state(&mut self, id: TableId) -> Result<TableStatus, SchedulerError> {
        self.check(id)?;
        let next = match self.status[id.0] {
            TableStatus::Pending => {
                self.pending.remove(&id);
                self.processing.insert(id);
                TableStatus::Processing
            }
            TableStatus::Processing => {
                self.processing.remove(&id);
                self.completed.insert(id);
                TableStatus::Completed
            }
            TableStatus::Completed => {
                warn!(
                    table = %self.tables[id.0].name,
                    "Advancing table status when already completed"
                );
                TableStatus::Completed
            }
        };
        self.status[id.0] = next;
        Ok(next)
    }

    /// True once every table has completed (trivially true when empty)
    pub fn is_completed(&self) -> bool {
        self.completed.len() == self.tables.len()
    }

    /// Return every table to PENDING, keeping tables and prerequisite edges
    pub fn reset_schema(&mut self) {
        self.status.iter_mut().for_each(|s| *s = TableStatus::Pending);
        self.processing.clear();
        self.completed.clear();
        self.pending = (0..self.tables.len()).map(TableId).collect();
    }

    /// Tables ordered so that every table follows its prerequisites
    pub fn topological_order(&self) -> Vec<TableId> {
        let mut placed = BTreeSet::new();
        let mut order = Vec::with_capacity(self.tables.len());
        while order.len() < self.tables.len() {
            let before = order.len();
            for i in 0..self.tables.len() {
                let id = TableId(i);
                if !placed.contains(&id) && self.prereqs[i].is_subset(&placed) {
                    placed.insert(id);
                    order.push(id);
                }
            }
            // Unreachable while add_prereq rejects cycles
            if order.len() == before {
                break;
            }
        }
        order
    }

    /// Merged raw-column -> conversion mapping across all tables
    pub fn conversion_map(&self) -> Result<BTreeMap<String, Conversion>, SchedulerError> {
        let mut map: BTreeMap<String, Conversion> = BTreeMap::new();
        for table in &self.tables {
            for column in &table.columns {
                match map.get(&column.raw_name) {
                    Some(existing) if *existing != column.conversion => {
                        return Err(SchedulerError::ConversionConflict {
                            table: table.name.clone(),
                            column: column.raw_name.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        map.insert(column.raw_name.clone(), column.conversion.clone());
                    }
                }
            }
        }
        Ok(map)
    }

    fn names(&self, ids: &BTreeSet<TableId>) -> Vec<&str> {
        ids.iter().map(|id| self.tables[id.0].name.as_str()).collect()
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Schema '{}' (staging required: {})", self.name, self.staging_required)?;
        for id in self.topological_order() {
            let prereqs: Vec<&str> = self.prereqs[id.0]
                .iter()
                .map(|p| self.tables[p.0].name.as_str())
                .collect();
            if prereqs.is_empty() {
                writeln!(f, "  {}", self.tables[id.0].name)?;
            } else {
                writeln!(f, "  {} (after {})", self.tables[id.0].name, prereqs.join(", "))?;
            }
        }
        Ok(())
    }
}
