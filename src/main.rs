use clap::{Parser, Subcommand};
use court_loader::runner::{LoadArgs, plan_load, run_load};
use std::path::PathBuf;

#[derive(Parser, Clone)]
#[command(version, about = "Load court and police extracts into a relational database")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Subcommand)]
enum Command {
    Load {
        /// Source files (.csv, .tsv, .txt), loaded in order
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Import type (hcdc, hpd, ci)
        #[arg(short = 't', long = "type")]
        import_type: Option<String>,

        /// JSON catalog describing a custom import type
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Database driver (postgres, mysql, sqlite)
        #[arg(long, env = "LOADER_DRIVER", default_value = "postgres")]
        driver: String,

        /// Database host
        #[arg(long, env = "LOADER_HOST", default_value = "localhost")]
        host: String,

        /// Database port (driver default if not specified)
        #[arg(long, env = "LOADER_PORT")]
        port: Option<u16>,

        /// Database username
        #[arg(short, long, env = "LOADER_USERNAME", default_value = "")]
        username: String,

        /// Database password
        #[arg(long, env = "LOADER_PASSWORD", default_value = "", hide_env_values = true)]
        password: String,

        /// Database name, or the database file for sqlite
        #[arg(short, long, env = "LOADER_DATABASE")]
        database: String,

        /// Destination schema (driver default if not specified)
        #[arg(short, long)]
        schema_name: Option<String>,

        /// Maximum number of concurrent connections
        #[arg(short, long, default_value = "5")]
        max_connections: usize,

        /// Rows per INSERT statement
        #[arg(short, long, default_value = "500")]
        batch_size: usize,

        /// Retries per statement after the first attempt
        #[arg(long, default_value = "5")]
        max_retries: u32,

        /// Field delimiter (a single character or \t), overriding the file extension
        #[arg(long)]
        delimiter: Option<String>,

        /// Encoding of the source files (utf-8, latin1, windows-1252, ...)
        #[arg(long, env = "LOADER_ENCODING", default_value = "utf-8")]
        encoding: String,

        /// Create the schema and tables if they don't exist
        #[arg(long)]
        create_tables: bool,

        /// Validate the import type and files and show the plan without loading data
        #[arg(long)]
        dry_run: bool,

        /// Quiet mode - minimal output, only show summary
        #[arg(short, long)]
        quiet: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Load {
            files,
            import_type,
            catalog,
            driver,
            host,
            port,
            username,
            password,
            database,
            schema_name,
            max_connections,
            batch_size,
            max_retries,
            delimiter,
            encoding,
            create_tables,
            dry_run,
            quiet,
        } => {
            init_tracing(quiet);

            let load_args = LoadArgs {
                files,
                import_type,
                catalog,
                driver,
                host,
                port,
                username,
                password,
                database,
                schema_name,
                max_connections,
                batch_size,
                max_retries,
                delimiter,
                encoding,
                create_tables,
                quiet,
            };

            if dry_run {
                run_dry(&load_args)
            } else {
                run_loader(load_args)
            }
        }
    }
}

fn init_tracing(quiet: bool) {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let default = if quiet {
        "court_loader=warn,sqlx=off"
    } else {
        "court_loader=info,sqlx=off"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run_dry(args: &LoadArgs) -> anyhow::Result<()> {
    let plan = plan_load(args)?;

    println!("DRY RUN MODE - No data will be loaded");
    println!();
    print!("{plan}");
    println!();
    println!("Configuration:");
    println!("  Driver: {}", args.driver);
    println!("  Database: {}", args.database);
    println!("  Max connections: {}", args.max_connections);
    println!("  Batch size: {}", args.batch_size);
    println!("  Encoding: {}", args.encoding);
    println!("  Max retries: {}", args.max_retries);
    println!("  Create tables: {}", args.create_tables);
    println!();
    println!("To execute, run without --dry-run");
    Ok(())
}

fn run_loader(args: LoadArgs) -> anyhow::Result<()> {
    if !args.quiet {
        println!("Court Data Loader");
        println!("=================");
        println!("Driver: {}", args.driver);
        println!("Database: {}", args.database);
        println!("Files: {}", args.files.len());
        println!("Max connections: {}", args.max_connections);
        println!();
    }

    let result = run_load(args)?;

    println!();
    println!("Load Summary");
    println!("============");
    println!("Run ID: {}", result.run_id);
    println!("Import type: {}", result.import_type);
    println!("Files loaded: {}", result.files_loaded);
    println!("Rows read: {}", result.rows_read);
    if result.tables_created > 0 {
        println!("DDL statements: {}", result.tables_created);
    }
    println!("Statements executed: {}", result.statements);
    println!("Rows affected: {}", result.rows_affected);
    println!("Duration: {:.2}s", result.duration.as_secs_f64());
    if let (Some(p50), Some(p90), Some(p99)) = result.batch_percentiles {
        println!("Statement time: p50 {}ms, p90 {}ms, p99 {}ms", p50, p90, p99);
    }
    println!(
        "Throughput: {:.2} rows/sec",
        result.rows_read as f64 / result.duration.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}
