use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use edge_infra::config::env::ProcessEnv;
use edge_infra::{
    build_handle, detect_current, parse_config, run_command, validate, DatabaseConfig,
    DatabaseKind, InfraError, RuntimeKind,
};
use migration::{MigrationCommand, MigrationError, MigrationJob, MigrationReport};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "edge=info,migration=info,sqlx=warn,sea_orm=warn";
const LOCK_TIMEOUT_ENV: &str = "EDGE_MIGRATE_LOCK_TIMEOUT_MS";

#[derive(Clone, Copy, ValueEnum)]
enum Command {
    /// Apply pending migrations
    Up,
    /// List applied and pending migrations
    Status,
    /// Always fails: migrations are forward-only
    Rollback,
    /// Show the resolved configuration and try to connect
    Check,
}

#[derive(Clone, Copy, ValueEnum)]
enum Runtime {
    Node,
    Cloudflare,
    VercelEdge,
    Deno,
}

impl From<Runtime> for RuntimeKind {
    fn from(runtime: Runtime) -> Self {
        match runtime {
            Runtime::Node => RuntimeKind::Node,
            Runtime::Cloudflare => RuntimeKind::Cloudflare,
            Runtime::VercelEdge => RuntimeKind::VercelEdge,
            Runtime::Deno => RuntimeKind::Deno,
        }
    }
}

#[derive(Parser)]
#[command(name = "edge-migrate")]
#[command(about = "Resolve the configured database and run SQL migrations against it")]
struct Args {
    #[arg(value_enum)]
    command: Command,

    /// Folder of .sql migration files
    #[arg(long, default_value = "./migrations")]
    dir: PathBuf,

    /// Tracking table name
    #[arg(long, default_value = migration::DEFAULT_MIGRATIONS_TABLE)]
    table: String,

    /// Runtime to resolve for (detected when omitted)
    #[arg(long, value_enum)]
    runtime: Option<Runtime>,

    /// Validate configuration and list files without connecting
    #[arg(long)]
    dry_run: bool,

    /// Env file loaded before resolving; a missing file is ignored
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,
}

#[tokio::main]
async fn main() {
    // clap exits with 2 on usage errors and 0 for --help.
    let args = Args::try_parse().unwrap_or_else(|e| e.exit());

    dotenvy::from_path(&args.env_file).ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .without_time()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(false)
        .with_file(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let lock_timeout = match lock_timeout_from_env() {
        Ok(timeout) => timeout,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };

    let runtime = args.runtime.map(RuntimeKind::from).unwrap_or_else(detect_current);
    let job = MigrationJob::new(&args.dir)
        .with_table(&args.table)
        .with_lock_timeout(lock_timeout);

    if let Err(e) = run(&args, runtime, &job).await {
        eprintln!("edge-migrate failed: {e}");
        std::process::exit(1);
    }
}

fn lock_timeout_from_env() -> Result<Duration, String> {
    match std::env::var(LOCK_TIMEOUT_ENV) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| format!("{LOCK_TIMEOUT_ENV} must be a whole number of milliseconds, got '{raw}'")),
        Err(_) => Ok(migration::DEFAULT_LOCK_TIMEOUT),
    }
}

async fn run(args: &Args, runtime: RuntimeKind, job: &MigrationJob) -> Result<(), InfraError> {
    let command = match args.command {
        Command::Check => return check(runtime, args.dry_run).await,
        Command::Rollback => return Err(MigrationError::RollbackUnsupported.into()),
        Command::Up => MigrationCommand::Up,
        Command::Status => MigrationCommand::Status,
    };

    let config = parse_config(&ProcessEnv)?;
    validate(&config, runtime)?;
    job.validate()?;

    if args.dry_run {
        let files = job.files()?;
        println!(
            "dry run: {} migration(s) in {} for {} ({} runtime)",
            files.len(),
            job.migrations_folder.display(),
            config.kind,
            runtime
        );
        for file in files {
            println!("  {}", file.name);
        }
        return Ok(());
    }

    let handle = build_handle(&config, runtime).await?;
    let report = run_command(&handle, job, config.kind, command).await?;
    print_report(command, &report);
    Ok(())
}

async fn check(runtime: RuntimeKind, dry_run: bool) -> Result<(), InfraError> {
    let config = parse_config(&ProcessEnv)?;
    describe(&config, runtime);

    if config.kind == DatabaseKind::Sqlite {
        println!("warning: sqlite is intended for local development only");
    }
    if config.kind == DatabaseKind::D1 && runtime != RuntimeKind::Cloudflare {
        println!("warning: d1 requires the cloudflare runtime");
    }

    validate(&config, runtime)?;
    if dry_run {
        println!("configuration valid (connection not attempted)");
        return Ok(());
    }

    let handle = build_handle(&config, runtime).await?;
    handle.ping().await?;
    println!("connection ok: {}", handle.target());
    Ok(())
}

fn describe(config: &DatabaseConfig, runtime: RuntimeKind) {
    println!("runtime:  {runtime}");
    println!("database: {}", config.kind);
    if let Some(url) = config.masked_url() {
        println!("url:      {url}");
    }
    if let Some(hint) = config.token_hint() {
        println!("token:    {hint}");
    }
}

fn print_report(command: MigrationCommand, report: &MigrationReport) {
    match command {
        MigrationCommand::Status => {
            for name in &report.already_applied {
                println!("applied  {name}");
            }
            for name in &report.pending {
                println!("pending  {name}");
            }
        }
        _ => {
            for name in &report.applied_now {
                println!("applied  {name}");
            }
            if report.applied_now.is_empty() {
                println!("nothing to apply");
            }
        }
    }
}
