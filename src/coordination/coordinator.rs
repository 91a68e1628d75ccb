use anyhow::{Context, Result, anyhow};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::scheduler::{Schema, TableHandle, TableId};
use super::worker::{ActionSummary, TableTask, WorkerMessage, spawn_worker};
use crate::config::LoadConfig;
use crate::db::ConnectionPool;
use crate::formats::TypedFrame;
use crate::telemetry::TelemetryEvent;

/// Phase of the insertion state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InsertionState {
    Initialization,
    Staging,
    Insertion,
    Merging,
    End,
}

impl InsertionState {
    /// The state that follows this one
    pub fn next(self, staging_required: bool) -> Self {
        match self {
            InsertionState::Initialization if staging_required => InsertionState::Staging,
            InsertionState::Initialization => InsertionState::Insertion,
            InsertionState::Staging => InsertionState::Merging,
            InsertionState::Merging | InsertionState::Insertion | InsertionState::End => {
                InsertionState::End
            }
        }
    }

    /// Phases in the order they run for a schema
    pub fn phases(staging_required: bool) -> Vec<InsertionState> {
        let mut phases = Vec::new();
        let mut state = InsertionState::Initialization.next(staging_required);
        while state != InsertionState::End {
            phases.push(state);
            state = state.next(staging_required);
        }
        phases
    }
}

impl fmt::Display for InsertionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InsertionState::Initialization => "initialization",
            InsertionState::Staging => "staging",
            InsertionState::Insertion => "insertion",
            InsertionState::Merging => "merging",
            InsertionState::End => "end",
        };
        f.write_str(name)
    }
}

/// Totals for one completed phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: InsertionState,
    pub tables: usize,
    pub statements: usize,
    pub rows_affected: u64,
    pub duration: Duration,
}

impl PhaseReport {
    fn new(phase: InsertionState) -> Self {
        Self {
            phase,
            tables: 0,
            statements: 0,
            rows_affected: 0,
            duration: Duration::ZERO,
        }
    }

    fn record(&mut self, summary: &ActionSummary) {
        self.tables += 1;
        self.statements += summary.statements;
        self.rows_affected += summary.rows_affected;
    }
}

/// Drives one file's rows through the phases of a schema.
///
/// The coordinator is the only owner of the scheduler and the pool while a
/// phase runs. Workers report completion over a channel and return their
/// connection with it, so neither aggregate is shared across threads.
pub struct Coordinator {
    config: LoadConfig,
    schema_name: String,
    telemetry: Sender<TelemetryEvent>,
    state: InsertionState,
}

impl Coordinator {
    pub fn new(config: LoadConfig, schema_name: &str, telemetry: Sender<TelemetryEvent>) -> Self {
        Self {
            config,
            schema_name: schema_name.to_string(),
            telemetry,
            state: InsertionState::Initialization,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> InsertionState {
        self.state
    }

    fn advance(&mut self, staging_required: bool) {
        let next = self.state.next(staging_required);
        info!(from = %self.state, to = %next, "Advancing insertion state");
        self.state = next;
    }

    /// Run every phase for `frame`, leaving the schema reset and the pool
    /// empty on success
    pub fn run(
        &mut self,
        schema: &mut Schema,
        pool: &mut ConnectionPool,
        frame: Arc<TypedFrame>,
    ) -> Result<Vec<PhaseReport>> {
        self.state = InsertionState::Initialization;
        let mut reports = Vec::new();

        loop {
            match self.state {
                InsertionState::Initialization => {}
                InsertionState::End => break,
                phase => {
                    let report = self
                        .run_phase(phase, schema, pool, &frame)
                        .with_context(|| format!("{} phase of schema '{}' failed", phase, schema.name()))?;
                    reports.push(report);
                }
            }
            self.advance(schema.staging_required());
        }

        Ok(reports)
    }

    /// Dispatch every table of the schema for one phase, then close the pool
    /// and reset table states.
    ///
    /// On failure no further tables are claimed; in-flight workers are drained
    /// before the first error is returned.
    pub fn run_phase(
        &self,
        phase: InsertionState,
        schema: &mut Schema,
        pool: &mut ConnectionPool,
        frame: &Arc<TypedFrame>,
    ) -> Result<PhaseReport> {
        let started = Instant::now();
        info!(phase = %phase, tables = schema.len(), "Starting phase");
        let _ = self.telemetry.send(TelemetryEvent::PhaseStarted {
            phase,
            tables: schema.len(),
        });

        let result = self.dispatch(phase, schema, pool, frame);
        pool.clear();

        let mut report = result?;
        schema.reset_schema();
        report.duration = started.elapsed();
        info!(
            phase = %phase,
            tables = report.tables,
            statements = report.statements,
            rows = report.rows_affected,
            elapsed = ?report.duration,
            "Phase complete"
        );
        Ok(report)
    }

    fn dispatch(
        &self,
        phase: InsertionState,
        schema: &mut Schema,
        pool: &mut ConnectionPool,
        frame: &Arc<TypedFrame>,
    ) -> Result<PhaseReport> {
        let (completions_tx, completions_rx) = mpsc::channel::<WorkerMessage>();
        let mut in_flight: HashMap<TableId, JoinHandle<()>> = HashMap::new();
        let mut failure: Option<anyhow::Error> = None;
        let mut report = PhaseReport::new(phase);

        while !schema.is_completed() {
            if failure.is_none() && !pool.all_connections_blocked() {
                if let Some(table) = schema.get_available_table() {
                    match self.dispatch_table(phase, &table, schema, pool, frame, &completions_tx) {
                        Ok(handle) => {
                            in_flight.insert(table.id, handle);
                        }
                        Err(err) => {
                            failure = Some(err.context(format!("Cannot dispatch table '{}'", table.name())));
                        }
                    }
                    continue;
                }
            }

            if in_flight.is_empty() {
                return Err(failure.unwrap_or_else(|| {
                    anyhow!(
                        "Scheduler stalled: {} tables pending, none claimable and none in flight",
                        schema.pending_count()
                    )
                }));
            }

            // Backpressure: wait for any worker to report back
            let message = completions_rx
                .recv()
                .context("Worker completion channel closed")?;
            if let Some(handle) = in_flight.remove(&message.table) {
                if handle.join().is_err() {
                    warn!(table = ?message.table, "worker thread panicked after reporting");
                }
            }
            if let Err(err) = self.handle_completion(phase, message, schema, pool, &mut report) {
                failure.get_or_insert(err);
            }
        }

        failure.map_or(Ok(report), Err)
    }

    /// Take back a worker's connection and advance its table.
    ///
    /// A table whose action succeeded is advanced even when its connection
    /// cannot be returned to the pool; that error is still reported.
    fn handle_completion(
        &self,
        phase: InsertionState,
        message: WorkerMessage,
        schema: &mut Schema,
        pool: &mut ConnectionPool,
        report: &mut PhaseReport,
    ) -> Result<()> {
        let WorkerMessage {
            table,
            connection,
            result,
        } = message;
        let name = schema
            .table(table)
            .map(|t| t.name().to_string())
            .unwrap_or_default();
        let freed = pool.free_connection(connection);

        let summary = match result {
            Ok(summary) => summary,
            Err(err) => {
                error!(table = %name, phase = %phase, error = ?err, "Table action failed");
                return Err(err.context(format!("Table '{name}' failed during {phase}")));
            }
        };
        schema.advance_table_state(table)?;
        report.record(&summary);
        debug!(
            table = %name,
            completed = schema.completed_count(),
            total = schema.len(),
            "table completed"
        );
        freed.with_context(|| format!("Cannot return the connection of '{name}'"))
    }

    /// Hand a claimed table to a new worker thread along with a pooled
    /// connection, opening one if the pool has room
    fn dispatch_table(
        &self,
        phase: InsertionState,
        table: &TableHandle,
        schema: &Schema,
        pool: &mut ConnectionPool,
        frame: &Arc<TypedFrame>,
        completions: &Sender<WorkerMessage>,
    ) -> Result<JoinHandle<()>> {
        if pool.available_count() == 0 && pool.has_room() {
            pool.add_connection()?;
        }
        let conn = pool
            .get_available_connection()
            .ok_or_else(|| anyhow!("No connection available for '{}'", table.name()))?;
        let conn_id = conn.id();
        debug!(
            table = table.name(),
            connection = conn_id,
            phase = %phase,
            blocked = pool.blocked_count(),
            processing = schema.processing_count(),
            "dispatching table"
        );

        let task = TableTask {
            table: table.clone(),
            phase,
            schema_name: self.schema_name.clone(),
            frame: Arc::clone(frame),
            config: self.config.clone(),
            telemetry: self.telemetry.clone(),
        };
        spawn_worker(conn, task, completions.clone())
            .map_err(|err| {
                pool.discard_connection(conn_id);
                err
            })
            .context("Failed to spawn worker thread")
    }
}
