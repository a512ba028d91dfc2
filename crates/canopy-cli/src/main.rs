//! Canopy CLI - sync hierarchical resource inventories into typed rows.

use anyhow::{Context, Result, bail};
use canopy::{
    CancellationToken, OutputRow, Scheduler, SyncConfig, SyncOutcome, TableTree,
};
use canopy_openstack::{DEFAULT_INSTALLATION, FixtureProvider};
use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Exit code of a sync interrupted by Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

/// Rows buffered between the scheduler and the writer.
const ROW_BUFFER: usize = 256;

#[derive(Parser)]
#[command(name = "canopy")]
#[command(author, version, about = "Hierarchical resource synchronization", long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (.toml, .yaml or .json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the active tables, relations indented under their parent
    Tables {
        #[command(flatten)]
        selection: Selection,

        /// Print table definitions as JSON
        #[arg(long)]
        json: bool,
    },

    /// Sync the active tables, writing one JSON row per line
    Sync {
        #[command(flatten)]
        selection: Selection,

        /// Directory of `<kind>.json` listings to sync from
        #[arg(long)]
        fixtures: Option<PathBuf>,

        /// Fail listings of kinds that have no fixture
        #[arg(long)]
        strict: bool,

        /// Write rows to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Maximum number of collectors polled at once
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Hide the progress spinner
        #[arg(short, long)]
        quiet: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Which tables a command works on.
#[derive(Args)]
struct Selection {
    /// Only tables matching these glob patterns (and their relations)
    #[arg(short, long)]
    include: Vec<String>,

    /// Skip tables matching these glob patterns (and their relations)
    #[arg(short, long)]
    exclude: Vec<String>,

    /// Installation suffix of the table names
    #[arg(long)]
    installation: Option<String>,
}

/// Contents of the config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CliConfig {
    sync: SyncConfig,
    openstack: OpenStackConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct OpenStackConfig {
    installation: Option<String>,
    fixtures: Option<PathBuf>,
}

/// Settings after merging the config file, environment and flags.
struct Resolved {
    sync: SyncConfig,
    installation: String,
    fixtures: Option<PathBuf>,
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    // RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<CliConfig> {
    match path {
        Some(path) => canopy::load_document(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(CliConfig::default()),
    }
}

fn resolve(config: CliConfig, selection: Selection) -> Result<Resolved> {
    let mut sync = config
        .sync
        .with_env_overrides()
        .context("Invalid environment override")?;
    if !selection.include.is_empty() {
        sync.included_tables = selection.include;
    }
    sync.excluded_tables.extend(selection.exclude);
    sync.validate().context("Invalid sync configuration")?;

    Ok(Resolved {
        sync,
        installation: selection
            .installation
            .or(config.openstack.installation)
            .unwrap_or_else(|| DEFAULT_INSTALLATION.to_string()),
        fixtures: config.openstack.fixtures,
    })
}

fn active_tree(resolved: &Resolved) -> Result<TableTree> {
    let tree = TableTree::new(canopy_openstack::tables(&resolved.installation))
        .context("Invalid table declarations")?;
    let patterns = resolved.sync.pattern_set()?;
    Ok(tree.filter(&patterns))
}

// ============================================
// tables
// ============================================

#[derive(Serialize)]
struct TableInfo<'a> {
    name: &'a str,
    parent: Option<&'a str>,
    description: Option<&'a str>,
    primary_keys: &'a [String],
    columns: Vec<ColumnInfo<'a>>,
}

#[derive(Serialize)]
struct ColumnInfo<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    ty: canopy::ColumnType,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

fn cmd_tables(resolved: &Resolved, json: bool) -> Result<()> {
    let tree = active_tree(resolved)?;

    if json {
        let tables: Vec<TableInfo> = tree
            .iter()
            .map(|node| TableInfo {
                name: node.name(),
                parent: tree.parent_name(node.id()),
                description: node.description(),
                primary_keys: node.primary_keys(),
                columns: node
                    .columns()
                    .iter()
                    .map(|c| ColumnInfo {
                        name: &c.name,
                        ty: c.ty,
                        description: c.description.as_deref(),
                    })
                    .collect(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&tables)?);
        return Ok(());
    }

    if tree.is_empty() {
        eprintln!("No tables match the selection.");
        return Ok(());
    }
    for node in tree.iter() {
        println!("{}{}", "  ".repeat(tree.depth(node.id())), node.name());
    }
    Ok(())
}

// ============================================
// sync
// ============================================

struct SyncArgs {
    fixtures: Option<PathBuf>,
    strict: bool,
    output: Option<PathBuf>,
    max_concurrency: Option<usize>,
    quiet: bool,
}

async fn cmd_sync(mut resolved: Resolved, args: SyncArgs) -> Result<ExitCode> {
    if let Some(n) = args.max_concurrency {
        resolved.sync.max_concurrency = n;
    }
    let scheduler = Scheduler::from_config(&resolved.sync).context("Invalid concurrency bound")?;
    let tree = active_tree(&resolved)?;

    let Some(fixtures) = args.fixtures.or(resolved.fixtures) else {
        bail!("No provider configured: pass --fixtures or set openstack.fixtures in the config");
    };
    if !fixtures.is_dir() {
        bail!("Fixture directory {} does not exist", fixtures.display());
    }
    let provider = FixtureProvider::from_dir(&fixtures).strict(args.strict);

    let out: Box<dyn AsyncWrite + Unpin + Send> = match &args.output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let progress = if args.quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new_spinner();
        bar.set_style(ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")?);
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_message("starting");
        bar
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping sync");
            interrupt.cancel();
        }
    });

    let (tx, rx) = mpsc::channel(ROW_BUFFER);
    let writer = tokio::spawn(write_rows(rx, out, progress.clone()));

    let result = scheduler.sync(&cancel, &provider, &tree, &tx).await;
    drop(tx);
    let written = writer.await.context("Row writer panicked")??;
    progress.finish_and_clear();

    match result.context("Sync failed")? {
        SyncOutcome::Completed(stats) => {
            tracing::info!(
                rows = written,
                tables = stats.per_table.len(),
                elapsed = ?stats.duration,
                "sync complete"
            );
            Ok(ExitCode::SUCCESS)
        }
        SyncOutcome::Cancelled(stats) => {
            tracing::warn!(rows = stats.rows, "sync cancelled");
            Ok(ExitCode::from(EXIT_CANCELLED))
        }
    }
}

/// Drain rows into `out` as NDJSON, in emission order.
async fn write_rows(
    mut rx: mpsc::Receiver<OutputRow>,
    out: Box<dyn AsyncWrite + Unpin + Send>,
    progress: ProgressBar,
) -> Result<u64> {
    let mut out = BufWriter::new(out);
    let mut line = Vec::new();
    let mut written = 0u64;
    while let Some(row) = rx.recv().await {
        line.clear();
        serde_json::to_writer(&mut line, &row)?;
        line.push(b'\n');
        out.write_all(&line).await.context("Failed to write row")?;
        written += 1;
        if written == 1 || written % 64 == 0 {
            progress.set_message(format!("rows: {written}"));
        }
    }
    progress.set_message(format!("rows: {written}"));
    out.flush().await.context("Failed to flush rows")?;
    Ok(written)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "canopy", &mut std::io::stdout());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Tables { selection, json } => {
            let config = load_config(cli.config.as_deref())?;
            cmd_tables(&resolve(config, selection)?, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sync {
            selection,
            fixtures,
            strict,
            output,
            max_concurrency,
            quiet,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let resolved = resolve(config, selection)?;
            cmd_sync(
                resolved,
                SyncArgs {
                    fixtures,
                    strict,
                    output,
                    max_concurrency,
                    quiet,
                },
            )
            .await
        }
    }
}
