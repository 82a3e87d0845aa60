//! ctrmeta: inspect containerd metadata without a running daemon
//!
//! Every command is read-only. Store files are opened under a shared lock,
//! copied into memory and released before decoding, so pointing this at a
//! live host never blocks containerd for longer than one read.
//!
//! # Locating State
//!
//! The installation root comes from, in order of precedence:
//! - `--root`
//! - `$CTRMETA_ROOT`
//! - `root` in the configuration file (`--config`, `$CTRMETA_CONFIG` or
//!   `/etc/ctrmeta/config.toml`)
//! - `/var/lib/containerd`
//!
//! Task pids are only reported when a state directory is known (`--state`
//! or `state` in the configuration file).

mod output;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ctrmeta_rs::{Explorer, ExplorerConfig};
use output::{OutputFormat, View};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ctrmeta")]
#[command(about = "Read-only inspection of containerd metadata stores", long_about = None)]
struct Cli {
    /// Path to the containerd root (default: auto-discover)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Path to the containerd state directory
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List records from the metadata store
    #[command(visible_alias = "ls")]
    List {
        #[command(subcommand)]
        kind: ListKind,

        /// Output format (table or json)
        #[arg(short, long, value_enum, default_value = "table", global = true)]
        output: OutputFormat,

        /// Show a labels column
        #[arg(long, global = true)]
        labels: bool,

        /// Show a row for namespaces with nothing to list
        #[arg(long, global = true)]
        show_empty: bool,

        /// Show an updated-at column where records carry one
        #[arg(long, global = true)]
        updated: bool,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum ListKind {
    /// List namespaces
    #[command(visible_alias = "ns")]
    Namespaces,
    /// List containers
    #[command(visible_alias = "c")]
    Containers {
        /// Hide containers running known platform support images
        #[arg(long)]
        skip_known_containers: bool,
    },
    /// List images
    #[command(visible_alias = "i")]
    Images {
        /// Hide known platform support images
        #[arg(long)]
        skip_known_images: bool,
    },
    /// List content blobs
    Content,
    /// List unfinished content ingests
    Ingests,
    /// List snapshots with their filesystem paths
    #[command(visible_alias = "snapshot")]
    Snapshots,
    /// List leases
    #[command(visible_alias = "lease")]
    Leases,
    /// List tasks and their recorded pids
    #[command(visible_alias = "task")]
    Tasks,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<ExplorerConfig> {
    let mut config = match &cli.config {
        Some(path) => ExplorerConfig::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => ExplorerConfig::discover().context("Failed to discover configuration")?,
    };
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    if let Some(state) = &cli.state {
        config.state = Some(state.clone());
    }
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    tracing::debug!(root = %config.root.display(), "using containerd root");
    let explorer = Explorer::open(config).context("Failed to open metadata store")?;

    match cli.command {
        Commands::List {
            kind,
            output,
            labels,
            show_empty,
            updated,
        } => {
            let view = View {
                labels,
                placeholders: show_empty,
                updated,
            };
            list(&explorer, kind, output, view)?
        }
    }
    Ok(())
}

fn list(explorer: &Explorer, kind: ListKind, format: OutputFormat, view: View) -> Result<()> {
    match kind {
        ListKind::Namespaces => {
            let namespaces = explorer
                .list_namespaces()
                .context("Failed to list namespaces")?;
            match format {
                OutputFormat::Json => output::output_json(&namespaces)?,
                OutputFormat::Table => println!("{}", output::namespaces_table(&namespaces, view)),
            }
        }
        ListKind::Containers {
            skip_known_containers,
        } => {
            let scan = explorer
                .list_containers()
                .context("Failed to list containers")?;
            let tasks = explorer.tasks_of(&scan.records);
            let records: Vec<_> = scan
                .records
                .iter()
                .zip(&tasks)
                .filter(|(c, _)| !(skip_known_containers && c.support_container))
                .collect();
            match format {
                OutputFormat::Json => {
                    let containers: Vec<_> = records.iter().map(|(c, _)| c).collect();
                    output::output_json(&containers)?
                }
                OutputFormat::Table => {
                    println!("{}", output::containers_table(&scan, &records, view))
                }
            }
        }
        ListKind::Images { skip_known_images } => {
            let scan = explorer.list_images().context("Failed to list images")?;
            let records: Vec<_> = scan
                .records
                .iter()
                .filter(|i| !(skip_known_images && i.support_image))
                .collect();
            match format {
                OutputFormat::Json => output::output_json(&records)?,
                OutputFormat::Table => println!("{}", output::images_table(&scan, &records, view)),
            }
        }
        ListKind::Content => {
            let scan = explorer.list_content().context("Failed to list content")?;
            match format {
                OutputFormat::Json => output::output_json(&scan.records)?,
                OutputFormat::Table => println!("{}", output::content_table(&scan, view)),
            }
        }
        ListKind::Ingests => {
            let scan = explorer.list_ingests().context("Failed to list ingests")?;
            match format {
                OutputFormat::Json => output::output_json(&scan.records)?,
                OutputFormat::Table => println!("{}", output::ingests_table(&scan.records)),
            }
        }
        ListKind::Snapshots => {
            let scan = explorer
                .list_snapshots()
                .context("Failed to list snapshots")?;
            match format {
                OutputFormat::Json => output::output_json(&scan.records)?,
                OutputFormat::Table => println!("{}", output::snapshots_table(&scan, view)),
            }
        }
        ListKind::Leases => {
            let scan = explorer.list_leases().context("Failed to list leases")?;
            match format {
                OutputFormat::Json => output::output_json(&scan.records)?,
                OutputFormat::Table => println!("{}", output::leases_table(&scan)),
            }
        }
        ListKind::Tasks => {
            let scan = explorer.list_tasks().context("Failed to list tasks")?;
            let records: Vec<_> = scan.records.iter().collect();
            match format {
                OutputFormat::Json => output::output_json(&records)?,
                OutputFormat::Table => println!("{}", output::tasks_table(&records)),
            }
        }
    }
    Ok(())
}
