//! High-level runner API for the court data loader.
//!
//! This module wraps the internal pieces (import catalogs, file reading,
//! connection pool, insertion coordinator) behind a small public interface
//! used by the CLI and by embedding programs.

use anyhow::{Context, Result, bail};
use encoding_rs::Encoding;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::catalog::{self, ImportType};
use crate::config::{
    ConnectionConfigBuilder, DEFAULT_BATCH_SIZE, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_RETRIES,
    LoadConfigBuilder, RetryPolicy,
};
use crate::coordination::{Coordinator, InsertionState, Schema};
use crate::db::{Backend, ConnectionPool};
use crate::formats::{DelimitedConfig, Format, Frame, TypedFrame, encoding_for_label};
use crate::telemetry::{ProgressStats, TelemetryEvent};

/// Arguments for running a load
#[derive(Debug, Clone)]
pub struct LoadArgs {
    // Source files, loaded in order
    pub files: Vec<PathBuf>,

    // Import type: a built-in key, or a JSON catalog file
    pub import_type: Option<String>,
    pub catalog: Option<PathBuf>,

    // Connection configuration
    pub driver: String,
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    pub database: String,
    /// Destination schema; the backend's default when absent
    pub schema_name: Option<String>,

    // Performance tuning
    pub max_connections: usize,
    pub batch_size: usize,
    pub max_retries: u32,

    // Options
    /// Field delimiter overriding the one implied by each file's extension
    pub delimiter: Option<String>,
    /// Encoding label of every source file, e.g. `utf-8` or `latin1`
    pub encoding: String,
    pub create_tables: bool,
    pub quiet: bool,
}

impl Default for LoadArgs {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            import_type: None,
            catalog: None,
            driver: "postgres".to_string(),
            host: "localhost".to_string(),
            port: None,
            username: String::new(),
            password: String::new(),
            database: String::new(),
            schema_name: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            delimiter: None,
            encoding: "utf-8".to_string(),
            create_tables: false,
            quiet: false,
        }
    }
}

/// Result of a completed load
#[derive(Debug)]
pub struct LoadResult {
    pub run_id: String,
    pub import_type: String,
    pub files_loaded: usize,
    pub rows_read: usize,
    pub tables_created: usize,
    pub statements: usize,
    pub rows_affected: u64,
    pub duration: Duration,
    /// p50, p90 and p99 statement latencies in milliseconds
    pub batch_percentiles: (Option<u64>, Option<u64>, Option<u64>),
}

/// What a load would do, produced without connecting to the database
#[derive(Debug, Clone)]
pub struct LoadPlan {
    pub import_type: String,
    pub import_name: String,
    pub phases: Vec<String>,
    /// Tables in dependency order, each with its prerequisites
    pub tables: Vec<(String, Vec<String>)>,
    /// Files and the number of rows each would load
    pub files: Vec<(PathBuf, usize)>,
}

impl fmt::Display for LoadPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Import type: {} ({})", self.import_type, self.import_name)?;
        writeln!(f, "Phases: {}", self.phases.join(" -> "))?;
        writeln!(f, "Tables:")?;
        for (table, prereqs) in &self.tables {
            if prereqs.is_empty() {
                writeln!(f, "  {table}")?;
            } else {
                writeln!(f, "  {table} (after {})", prereqs.join(", "))?;
            }
        }
        writeln!(f, "Files:")?;
        for (path, rows) in &self.files {
            writeln!(f, "  {} ({rows} rows)", path.display())?;
        }
        Ok(())
    }
}

/// Validate the import type and every file, returning the load plan
pub fn plan_load(args: &LoadArgs) -> Result<LoadPlan> {
    let import = resolve_import(args)?;
    let schema = import.schema()?;
    let conversions = import.conversion_map()?;
    let delimited = delimiter_override(args)?;
    let encoding = encoding_for_label(&args.encoding)?;

    let mut files = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let frame = read_file(path, delimited.as_ref(), encoding)?
            .convert(&conversions)
            .with_context(|| format!("Failed to convert {}", path.display()))?;
        files.push((path.clone(), frame.len()));
    }

    Ok(LoadPlan {
        import_type: import.key().to_string(),
        import_name: import.name().to_string(),
        phases: InsertionState::phases(schema.staging_required())
            .iter()
            .map(ToString::to_string)
            .collect(),
        tables: dependency_listing(&schema),
        files,
    })
}

/// Run a load with the specified arguments
///
/// Files are loaded one after another through the same pool and scheduler;
/// the first failing file aborts the run.
///
/// # Example
///
/// ```no_run
/// use court_loader::runner::{LoadArgs, run_load};
///
/// # fn example() -> anyhow::Result<()> {
/// let args = LoadArgs {
///     files: vec!["snapshot.txt".into()],
///     import_type: Some("hcdc".to_string()),
///     driver: "postgres".to_string(),
///     database: "court".to_string(),
///     delimiter: Some("\\t".to_string()),
///     create_tables: true,
///     ..LoadArgs::default()
/// };
///
/// let result = run_load(args)?;
/// println!("Loaded {} rows in {:?}", result.rows_read, result.duration);
/// # Ok(())
/// # }
/// ```
pub fn run_load(args: LoadArgs) -> Result<LoadResult> {
    let started = Instant::now();
    let run_id = Uuid::new_v4().to_string();

    // Resolve everything that can fail before any connection is opened
    let import = resolve_import(&args)?;
    let mut schema = import.schema()?;
    let conversions = import.conversion_map()?;
    let delimited = delimiter_override(&args)?;
    let encoding = encoding_for_label(&args.encoding)?;
    let backend = Backend::parse(&args.driver)?;
    if args.max_connections == 0 {
        bail!("--max-connections must be at least 1");
    }
    if args.batch_size == 0 {
        bail!("--batch-size must be at least 1");
    }

    let schema_name = args
        .schema_name
        .clone()
        .unwrap_or_else(|| backend.default_schema(&args.database));
    let connection_config = ConnectionConfigBuilder::default()
        .backend(backend)
        .host(args.host.clone())
        .port(args.port)
        .username(args.username.clone())
        .password(args.password.clone())
        .database(args.database.clone())
        .max_connections(args.max_connections)
        .build()?;
    let load_config = LoadConfigBuilder::default()
        .batch_size(args.batch_size)
        .retry(RetryPolicy::new(args.max_retries))
        .build()?;

    debug!("{schema}");
    info!(
        run_id = %run_id,
        import = import.key(),
        backend = ?backend,
        schema = %schema_name,
        files = args.files.len(),
        "Starting load"
    );

    // Declared before the pool so it outlives every connection
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let mut pool = ConnectionPool::new(connection_config, runtime.handle().clone());

    let (telemetry_tx, telemetry_rx) = mpsc::channel();
    let progress = setup_progress_tracking(args.quiet, telemetry_rx)?;

    let mut totals = Totals::default();
    let outcome = (|| -> Result<()> {
        if args.create_tables {
            totals.tables_created = create_tables(import.as_ref(), &mut pool, &schema_name, &load_config.retry)?;
        }
        // MySQL schemas are databases; later connections default to the target
        if backend == Backend::MySql && pool.database() != schema_name {
            pool.set_database(&schema_name);
        }

        let mut coordinator = Coordinator::new(load_config.clone(), &schema_name, telemetry_tx.clone());
        for path in &args.files {
            let frame = read_file(path, delimited.as_ref(), encoding)?
                .convert(&conversions)
                .with_context(|| format!("Failed to convert {}", path.display()))?;
            totals.rows_read += frame.len();
            load_file(&mut coordinator, &mut schema, &mut pool, path, frame, &mut totals)?;
            totals.files_loaded += 1;
        }
        Ok(())
    })();

    // Close the channel so the progress thread can finish
    drop(telemetry_tx);
    let stats = progress
        .join()
        .map_err(|_| anyhow::anyhow!("Progress thread panicked"))?;
    pool.clear();
    outcome?;

    let duration = started.elapsed();
    info!(
        run_id = %run_id,
        files = totals.files_loaded,
        rows = totals.rows_read,
        statements = totals.statements,
        elapsed = ?duration,
        "Load complete"
    );

    Ok(LoadResult {
        run_id,
        import_type: import.key().to_string(),
        files_loaded: totals.files_loaded,
        rows_read: totals.rows_read,
        tables_created: totals.tables_created,
        statements: totals.statements,
        rows_affected: totals.rows_affected,
        duration,
        batch_percentiles: stats.get_percentiles(),
    })
}

#[derive(Debug, Default)]
struct Totals {
    files_loaded: usize,
    rows_read: usize,
    tables_created: usize,
    statements: usize,
    rows_affected: u64,
}

fn resolve_import(args: &LoadArgs) -> Result<Box<dyn ImportType>> {
    if args.import_type.is_none() && args.catalog.is_none() {
        bail!("Either --type or --catalog must be given");
    }
    let import = catalog::resolve(args.import_type.as_deref(), args.catalog.as_deref())?;
    Ok(import)
}

fn delimiter_override(args: &LoadArgs) -> Result<Option<DelimitedConfig>> {
    args.delimiter
        .as_deref()
        .map(|d| DelimitedConfig::from_strings(d, "\""))
        .transpose()
}

fn read_file(
    path: &Path,
    delimited: Option<&DelimitedConfig>,
    encoding: &'static Encoding,
) -> Result<Frame> {
    let format = Format::from_path(path)?;
    let config = format.delimited_config(delimited).with_encoding(encoding);
    Frame::read_delimited(path, &config)
}

/// Create the import's tables over a single pooled connection
fn create_tables(
    import: &dyn ImportType,
    pool: &mut ConnectionPool,
    schema_name: &str,
    retry: &RetryPolicy,
) -> Result<usize> {
    let limit = pool.max_connections();
    pool.set_max_connections(1);
    pool.add_connection()?;
    let mut conn = pool
        .get_available_connection()
        .context("No connection available to create tables")?;
    let created = import.create(&mut conn, pool.backend(), schema_name, retry);
    pool.free_connection(conn)?;
    pool.clear();
    if !pool.set_max_connections(limit) {
        bail!("Cannot restore the connection limit of {limit}");
    }
    created.with_context(|| format!("Failed to create tables for '{}'", import.key()))
}

fn load_file(
    coordinator: &mut Coordinator,
    schema: &mut Schema,
    pool: &mut ConnectionPool,
    path: &Path,
    frame: TypedFrame,
    totals: &mut Totals,
) -> Result<()> {
    info!(file = %path.display(), rows = frame.len(), "Loading file");
    let reports = coordinator
        .run(schema, pool, Arc::new(frame))
        .with_context(|| format!("Failed to load {}", path.display()))?;
    for report in reports {
        totals.statements += report.statements;
        totals.rows_affected += report.rows_affected;
    }
    Ok(())
}

fn dependency_listing(schema: &Schema) -> Vec<(String, Vec<String>)> {
    schema
        .topological_order()
        .into_iter()
        .filter_map(|id| schema.table(id))
        .map(|table| {
            let prereqs = schema
                .prereqs(table.id)
                .filter_map(|p| schema.table(p))
                .map(|p| p.name().to_string())
                .collect();
            (table.name().to_string(), prereqs)
        })
        .collect()
}

/// Name of the table an event concerns, with its statement progress
fn table_progress(event: &TelemetryEvent) -> String {
    match event {
        TelemetryEvent::PhaseStarted { phase, .. } => phase.to_string(),
        TelemetryEvent::TableStarted { table, total_batches } => format!("{table} 0/{total_batches}"),
        TelemetryEvent::BatchCompleted {
            table, completed, total, ..
        } => format!("{table} {completed}/{total}"),
        TelemetryEvent::TableCompleted { table } => format!("(last: {table})"),
    }
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

/// Consume telemetry until every sender is gone, drawing progress bars unless
/// `quiet`, and return the aggregated statistics
fn setup_progress_tracking(
    quiet: bool,
    telemetry_rx: Receiver<TelemetryEvent>,
) -> Result<JoinHandle<ProgressStats>> {
    let bars = (!quiet).then(|| {
        let multi_progress = MultiProgress::new();
        let table_bar = multi_progress.add(ProgressBar::new(0));
        table_bar.set_style(bar_style(
            "[{elapsed_precise}] {prefix:>9} tables:  [{bar:30.cyan/blue}] {pos}/{len} {msg}",
        ));
        let batch_bar = multi_progress.add(ProgressBar::new(0));
        batch_bar.set_style(bar_style(
            "[{elapsed_precise}] Statements:       [{bar:30.green/blue}] {pos}/{len} | {per_sec} {msg}",
        ));
        let stats_bar = multi_progress.add(ProgressBar::new(0));
        stats_bar.set_style(bar_style("[{elapsed_precise}] Batch Time: {msg}"));
        (table_bar, batch_bar, stats_bar)
    });

    let handle = thread::Builder::new()
        .name("progress".to_string())
        .spawn(move || {
            let mut stats = ProgressStats::new();
            let mut phase_tables_done = 0;

            for event in telemetry_rx {
                stats.update(&event);
                let Some((table_bar, batch_bar, stats_bar)) = &bars else {
                    continue;
                };

                match &event {
                    TelemetryEvent::PhaseStarted { phase, tables } => {
                        phase_tables_done = stats.tables_completed;
                        table_bar.set_prefix(phase.to_string());
                        table_bar.set_length(*tables as u64);
                        table_bar.set_position(0);
                    }
                    TelemetryEvent::TableCompleted { .. } => {
                        table_bar.set_position((stats.tables_completed - phase_tables_done) as u64);
                        table_bar.set_message(table_progress(&event));
                    }
                    TelemetryEvent::TableStarted { .. } | TelemetryEvent::BatchCompleted { .. } => {
                        batch_bar.set_length(stats.batches_planned as u64);
                        batch_bar.set_position(stats.batches_completed as u64);
                        batch_bar.set_message(table_progress(&event));
                    }
                }

                if let (Some(p50), Some(p90), Some(p99)) = stats.get_percentiles() {
                    stats_bar.set_message(format!("p50: {}ms, p90: {}ms, p99: {}ms", p50, p90, p99));
                }
            }

            if let Some((table_bar, batch_bar, stats_bar)) = bars {
                table_bar.finish();
                batch_bar.finish();
                stats_bar.finish();
            }
            stats
        })
        .context("Failed to spawn progress thread")?;

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_requires_an_import_type() {
        let err = plan_load(&LoadArgs::default()).unwrap_err();
        assert!(err.to_string().contains("--type"));
    }

    #[test]
    fn test_run_rejects_bad_settings_before_connecting() {
        let args = LoadArgs {
            import_type: Some("hpd".to_string()),
            driver: "oracle".to_string(),
            ..LoadArgs::default()
        };
        assert!(run_load(args).unwrap_err().to_string().contains("Unsupported driver"));

        let args = LoadArgs {
            import_type: Some("hpd".to_string()),
            driver: "sqlite".to_string(),
            max_connections: 0,
            ..LoadArgs::default()
        };
        assert!(run_load(args).unwrap_err().to_string().contains("max-connections"));

        let args = LoadArgs {
            import_type: Some("hpd".to_string()),
            driver: "sqlite".to_string(),
            encoding: "klingon".to_string(),
            ..LoadArgs::default()
        };
        assert!(run_load(args).unwrap_err().to_string().contains("Unknown encoding"));
    }

    #[test]
    fn test_progress_names_the_current_table() {
        let started = TelemetryEvent::TableStarted {
            table: "defendant".to_string(),
            total_batches: 3,
        };
        assert_eq!(table_progress(&started), "defendant 0/3");

        let batch = TelemetryEvent::BatchCompleted {
            table: "defendant".to_string(),
            completed: 2,
            total: 3,
            rows_affected: 500,
            duration_ms: 12,
        };
        assert_eq!(table_progress(&batch), "defendant 2/3");

        let done = TelemetryEvent::TableCompleted {
            table: "cases".to_string(),
        };
        assert_eq!(table_progress(&done), "(last: cases)");
    }

    #[test]
    fn test_progress_tracking_aggregates_events() {
        let (tx, rx) = mpsc::channel();
        let handle = setup_progress_tracking(true, rx).unwrap();
        tx.send(TelemetryEvent::PhaseStarted {
            phase: InsertionState::Insertion,
            tables: 1,
        })
        .unwrap();
        tx.send(TelemetryEvent::TableCompleted {
            table: "data".to_string(),
        })
        .unwrap();
        drop(tx);

        let stats = handle.join().unwrap();
        assert_eq!(stats.phases_started, 1);
        assert_eq!(stats.tables_completed, 1);
    }
}
