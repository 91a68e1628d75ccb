use crate::coordination::InsertionState;

/// Telemetry events sent from workers and the dispatcher for progress tracking
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// Dispatcher entered a phase that processes `tables` tables
    PhaseStarted { phase: InsertionState, tables: usize },
    /// Worker started a table action with `total_batches` statements to run
    TableStarted { table: String, total_batches: usize },
    /// One batch statement of a table action succeeded
    BatchCompleted {
        table: String,
        completed: usize,
        total: usize,
        rows_affected: u64,
        duration_ms: u64,
    },
    /// Worker finished a table action
    TableCompleted { table: String },
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone)]
pub struct ProgressStats {
    pub phases_started: usize,
    pub tables_started: usize,
    pub tables_completed: usize,
    pub batches_planned: usize,
    pub batches_completed: usize,
    pub rows_affected: u64,
    pub batch_durations_ms: Vec<u64>,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::PhaseStarted { .. } => {
                self.phases_started += 1;
            }
            TelemetryEvent::TableStarted { total_batches, .. } => {
                self.tables_started += 1;
                self.batches_planned += total_batches;
            }
            TelemetryEvent::BatchCompleted {
                rows_affected,
                duration_ms,
                ..
            } => {
                self.batches_completed += 1;
                self.rows_affected += rows_affected;
                self.batch_durations_ms.push(*duration_ms);
            }
            TelemetryEvent::TableCompleted { .. } => {
                self.tables_completed += 1;
            }
        }
    }

    /// Calculate percentile from batch durations
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.batch_durations_ms.is_empty() {
            return None;
        }

        let mut sorted = self.batch_durations_ms.clone();
        sorted.sort_unstable();

        let index = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let index = index.saturating_sub(1).min(sorted.len() - 1);

        Some(sorted[index])
    }

    /// Get p50, p90, p99 percentiles
    pub fn get_percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        (
            self.percentile(50.0),
            self.percentile(90.0),
            self.percentile(99.0),
        )
    }
}
