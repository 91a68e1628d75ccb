//! Table actions run by worker threads: retrying statement execution, staging
//! reset, batched staged and direct inserts, and ranged merges from staging.
use anyhow::{Context, Result, anyhow, bail};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::coordinator::InsertionState;
use super::scheduler::{TableHandle, TableId};
use crate::config::{ENTRY_COLUMN, LoadConfig, RetryPolicy, stage_table_name};
use crate::db::{Backend, Connection, Execute};
use crate::formats::TypedFrame;
use crate::formats::value::render_row;
use crate::telemetry::TelemetryEvent;

/// Longest statement prefix shown in error messages
const STATEMENT_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Error)]
#[error("Statement failed after {attempts} attempts: {preview}")]
pub struct ExecutionError {
    pub statement: String,
    pub attempts: u32,
    preview: String,
    #[source]
    pub source: sqlx::Error,
}

impl ExecutionError {
    fn new(statement: &str, attempts: u32, source: sqlx::Error) -> Self {
        let preview = if statement.chars().count() > STATEMENT_PREVIEW_CHARS {
            let head: String = statement.chars().take(STATEMENT_PREVIEW_CHARS).collect();
            format!("{head}...")
        } else {
            statement.to_string()
        };
        Self {
            statement: statement.to_string(),
            attempts,
            preview,
            source,
        }
    }
}

/// Execute one statement, retrying any failure up to `retry.max_retries`
/// times before giving up.
pub fn execute_sql<E: Execute + ?Sized>(
    conn: &mut E,
    statement: &str,
    retry: &RetryPolicy,
) -> Result<u64, ExecutionError> {
    let mut attempt = 0;
    loop {
        match conn.execute(statement) {
            Ok(rows) => return Ok(rows),
            Err(err) if attempt < retry.max_retries => {
                attempt += 1;
                warn!(
                    attempt,
                    max_retries = retry.max_retries,
                    error = %err,
                    "Statement failed, retrying"
                );
                thread::sleep(retry.delay_for(attempt));
            }
            Err(err) => return Err(ExecutionError::new(statement, attempt + 1, err)),
        }
    }
}

/// Split the inclusive key range `[min, max]` into consecutive inclusive
/// ranges of at most `limit` keys
pub fn merge_ranges(min: i64, max: i64, limit: usize) -> Vec<(i64, i64)> {
    let span = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
    let mut ranges = Vec::new();
    if min > max {
        return ranges;
    }

    let mut start = min;
    loop {
        let end = start.saturating_add(span - 1).min(max);
        ranges.push((start, end));
        if end == max {
            break;
        }
        start = end + 1;
    }
    ranges
}

/// Everything a worker needs to run one table action
#[derive(Debug, Clone)]
pub struct TableTask {
    pub table: TableHandle,
    pub phase: InsertionState,
    /// Database schema the tables live in
    pub schema_name: String,
    pub frame: Arc<TypedFrame>,
    pub config: LoadConfig,
    pub telemetry: Sender<TelemetryEvent>,
}

impl TableTask {
    fn send(&self, event: TelemetryEvent) {
        let _ = self.telemetry.send(event);
    }

    fn batch_done(&self, completed: usize, total: usize, rows_affected: u64, started: Instant) {
        self.send(TelemetryEvent::BatchCompleted {
            table: self.table.name().to_string(),
            completed,
            total,
            rows_affected,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }
}

/// Outcome of a successful table action
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ActionSummary {
    pub statements: usize,
    pub rows_affected: u64,
}

/// Empty a staging table and restart its surrogate key
pub fn reset_stage_table<E: Execute + ?Sized>(
    conn: &mut E,
    backend: Backend,
    schema_name: &str,
    table: &str,
    retry: &RetryPolicy,
) -> Result<(), ExecutionError> {
    for statement in backend.reset_stage_statements(schema_name, &stage_table_name(table)) {
        execute_sql(conn, &statement, retry)?;
    }
    Ok(())
}

/// Reset the staging table, then land every non-empty row in it
pub fn insert_to_stage_table<E: Execute + ?Sized>(
    conn: &mut E,
    backend: Backend,
    task: &TableTask,
) -> Result<ActionSummary> {
    reset_stage_table(conn, backend, &task.schema_name, task.table.name(), &task.config.retry)
        .with_context(|| format!("Failed to reset staging table for '{}'", task.table.name()))?;
    insert_rows(conn, backend, task, &stage_table_name(task.table.name()))
}

/// Insert every non-empty row directly into the final table
pub fn insert_to_table<E: Execute + ?Sized>(
    conn: &mut E,
    backend: Backend,
    task: &TableTask,
) -> Result<ActionSummary> {
    insert_rows(conn, backend, task, task.table.name())
}

fn insert_rows<E: Execute + ?Sized>(
    conn: &mut E,
    backend: Backend,
    task: &TableTask,
    target: &str,
) -> Result<ActionSummary> {
    let table = &task.table;
    let projection = task
        .frame
        .projection(table)
        .with_context(|| format!("Cannot project rows for table '{}'", table.name()))?;

    let rows: Vec<Vec<_>> = task
        .frame
        .rows
        .iter()
        .map(|row| projection.iter().map(|&i| row[i].clone()).collect::<Vec<_>>())
        .filter(|values| !values.iter().all(|v| v.is_empty()))
        .collect();

    let batch_size = task.config.batch_size.max(1);
    let total = rows.len().div_ceil(batch_size);
    task.send(TelemetryEvent::TableStarted {
        table: table.name().to_string(),
        total_batches: total,
    });
    debug!(
        table = table.name(),
        target,
        rows = rows.len(),
        batches = total,
        "inserting rows"
    );

    let qualified = backend.qualify(&task.schema_name, target);
    let columns = column_list(backend, table);
    let first_column = table
        .columns()
        .first()
        .map(|c| c.name.as_str())
        .ok_or_else(|| anyhow!("Table '{}' has no columns", table.name()))?;
    let conflict = backend.ignore_conflict_clause(&qualified, first_column);

    let mut summary = ActionSummary::default();
    for (i, batch) in rows.chunks(batch_size).enumerate() {
        let started = Instant::now();
        let values = batch
            .iter()
            .map(|row| render_row(row, backend))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Cannot render rows for table '{}'", table.name()))?;

        let statement = format!(
            "INSERT INTO {qualified} ({columns}) VALUES {} {conflict}",
            values.join(", ")
        );
        let affected = execute_sql(conn, &statement, &task.config.retry)?;

        summary.statements += 1;
        summary.rows_affected += affected;
        task.batch_done(i + 1, total, affected, started);
    }
    Ok(summary)
}

/// Move staged rows into the final table in surrogate-key ranges of at most
/// `batch_size` keys
pub fn merge_from_stage_table(conn: &mut Connection, task: &TableTask) -> Result<ActionSummary> {
    let backend = conn.backend();
    let table = &task.table;
    let stage = backend.qualify(&task.schema_name, &stage_table_name(table.name()));
    let target = backend.qualify(&task.schema_name, table.name());

    let ranges = match conn
        .fetch_entry_bounds(&stage)
        .with_context(|| format!("Failed to read key range of {stage}"))?
    {
        Some((min, max)) => merge_ranges(min, max, task.config.batch_size),
        None => Vec::new(),
    };

    task.send(TelemetryEvent::TableStarted {
        table: table.name().to_string(),
        total_batches: ranges.len(),
    });

    let columns = column_list(backend, table);
    let first_column = table
        .columns()
        .first()
        .map(|c| c.name.as_str())
        .ok_or_else(|| anyhow!("Table '{}' has no columns", table.name()))?;
    let conflict = backend.ignore_conflict_clause(&target, first_column);
    let entry = backend.quote_ident(ENTRY_COLUMN);

    let mut summary = ActionSummary::default();
    for (i, (start, end)) in ranges.iter().enumerate() {
        let started = Instant::now();
        let statement = format!(
            "INSERT INTO {target} ({columns}) SELECT {columns} FROM {stage} \
             WHERE {entry} BETWEEN {start} AND {end} {conflict}"
        );
        let affected = execute_sql(conn, &statement, &task.config.retry)?;

        summary.statements += 1;
        summary.rows_affected += affected;
        task.batch_done(i + 1, ranges.len(), affected, started);
    }
    Ok(summary)
}

fn column_list(backend: Backend, table: &TableHandle) -> String {
    table
        .columns()
        .iter()
        .map(|c| backend.quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Run the action that `task.phase` calls for
pub fn run_table_action(conn: &mut Connection, task: &TableTask) -> Result<ActionSummary> {
    let backend = conn.backend();
    let summary = match task.phase {
        InsertionState::Staging => insert_to_stage_table(conn, backend, task)?,
        InsertionState::Merging => merge_from_stage_table(conn, task)?,
        InsertionState::Insertion => insert_to_table(conn, backend, task)?,
        other => bail!("No table action runs in the {other} state"),
    };

    task.send(TelemetryEvent::TableCompleted {
        table: task.table.name().to_string(),
    });
    info!(
        table = task.table.name(),
        phase = %task.phase,
        statements = summary.statements,
        rows = summary.rows_affected,
        "table action completed"
    );
    Ok(summary)
}

/// Completion report a worker sends back to the dispatcher
#[derive(Debug)]
pub struct WorkerMessage {
    pub table: TableId,
    pub connection: Connection,
    pub result: Result<ActionSummary>,
}

/// Spawn a worker thread that owns `conn` for the duration of the action and
/// hands it back in its completion message, even if the action panics
pub fn spawn_worker(
    mut conn: Connection,
    task: TableTask,
    completions: Sender<WorkerMessage>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("{}-{}", task.phase, task.table.name()))
        .spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_table_action(&mut conn, &task)));
            let result = outcome.unwrap_or_else(|payload| {
                Err(anyhow!("Worker panicked: {}", panic_message(payload.as_ref())))
            });
            let _ = completions.send(WorkerMessage {
                table: task.table.id,
                connection: conn,
                result,
            });
        })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
