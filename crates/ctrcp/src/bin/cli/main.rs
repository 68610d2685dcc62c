//! ctrcp: copy files between the host and containers.
//!
//! ```text
//! ctrcp cp web:/etc/hosts ./hosts        # container -> host
//! ctrcp cp web:/var/log - | tar -tvf -   # container -> tar on stdout
//! ctrcp cp ./config.toml web:/etc/app/   # host -> container
//! ctrcp resolve web /etc/resolv.conf     # where does this path live?
//! ```
//!
//! Logs go to stderr so that `cp ... -` keeps stdout a clean archive.
//! `RUST_LOG` overrides `-v`.

mod output;

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ctrcp::*;
use output::{
    ContainerListEntry, MountEntry, OutputFormat, ResolveOutput, output_item, output_slice,
    truncate_id,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "ctrcp")]
#[command(about = "Copy files between the host and container filesystems", long_about = None)]
struct Cli {
    /// Path to the container store (default: auto-discover)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Configuration file (default: search standard locations)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy between a container and the host
    ///
    /// Exactly one of SRC and DEST is CONTAINER:PATH. A DEST of `-` writes a
    /// tar stream to stdout; a SRC of `-` reads one from stdin.
    Cp {
        /// Preserve uid/gid of copied entries
        #[arg(short, long)]
        archive: bool,
        /// Do not apply archived mode bits
        #[arg(long)]
        no_preserve_permissions: bool,
        /// Source: CONTAINER:PATH, a host path, or `-`
        source: String,
        /// Destination: CONTAINER:PATH, a host path, or `-`
        destination: String,
    },

    /// Show where a container path lives on the host
    Resolve {
        /// Container id, id prefix, or name
        container: String,
        /// Path inside the container
        path: String,
        /// Output format (table or json)
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Show a container's mount table
    Mounts {
        /// Container id, id prefix, or name
        container: String,
        /// Output format (table or json)
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// List containers in the store
    #[command(visible_alias = "ls")]
    List {
        /// Output format (table or json)
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
        /// Don't truncate container IDs
        #[arg(long)]
        no_trunc: bool,
    },
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none())
        .with_filter(filter);

    tracing_subscriber::registry().with(stderr_layer).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = CopyConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let root = config.store_root(cli.root.as_deref());
    tracing::debug!("using store {}", root.display());
    let store = DirectoryStore::open(&root)
        .with_context(|| format!("Failed to open container store {}", root.display()))?;

    match cli.command {
        Commands::Cp {
            archive,
            no_preserve_permissions,
            source,
            destination,
        } => {
            let mut options = config.transfer_options();
            options.extraction.preserve_ownership |= archive;
            options.extraction.preserve_permissions &= !no_preserve_permissions;
            copy(&store, options, &source, &destination)?
        }
        Commands::Resolve {
            container,
            path,
            format,
        } => resolve(&store, config.transfer_options(), &container, &path, format)?,
        Commands::Mounts { container, format } => list_mounts(&store, &container, format)?,
        Commands::List { format, no_trunc } => list_containers(&store, format, no_trunc)?,
    }

    Ok(())
}

fn copy(store: &DirectoryStore, options: TransferOptions, source: &str, destination: &str) -> Result<()> {
    let report = Transfer::new(store)
        .with_options(options)
        .run(source, destination, TransferIo::inherit())?;

    tracing::info!(
        "{} {} ({}): {} entries archived, {} files, {} directories, {} symlinks",
        report.direction,
        report.container_path,
        truncate_id(&report.container_id),
        report.entries_archived,
        report.stats.files_extracted,
        report.stats.directories_created,
        report.stats.symlinks_created,
    );
    if report.special_files_skipped > 0 {
        tracing::warn!(
            "{} sockets, FIFOs or devices were not copied",
            report.special_files_skipped
        );
    }
    if report.stats.permission_failures + report.stats.ownership_failures > 0 {
        tracing::warn!(
            "{} permission and {} ownership changes could not be applied",
            report.stats.permission_failures,
            report.stats.ownership_failures
        );
    }
    Ok(())
}

fn resolve(
    store: &DirectoryStore,
    options: TransferOptions,
    container: &str,
    path: &str,
    format: OutputFormat,
) -> Result<()> {
    let (metadata, resolved) = Transfer::new(store).with_options(options).resolve(container, path)?;

    let output = ResolveOutput {
        container: metadata.id,
        requested: resolved.requested.clone(),
        container_path: resolved.container.to_string(),
        host_path: resolved.real.to_string(),
        mount: resolved
            .via_mount
            .as_ref()
            .map(|m| format!("{} ({})", m.container_path, m.kind)),
        exists: resolved.exists(),
    };
    output_item(&output, format).context("Failed to output resolution")?;
    Ok(())
}

fn list_mounts(store: &DirectoryStore, container: &str, format: OutputFormat) -> Result<()> {
    let metadata = store
        .lookup(container)
        .with_context(|| format!("Failed to find container {}", container))?;
    let table = metadata
        .mount_table()
        .with_context(|| format!("Invalid mounts for container {}", metadata.id))?;

    let mut entries: Vec<MountEntry> = table
        .iter()
        .map(|m| MountEntry {
            container_path: m.container_path.to_string(),
            host_path: m.host_path.to_string(),
            kind: m.kind.to_string(),
            read_only: m.read_only,
        })
        .collect();
    entries.sort_by(|a, b| a.container_path.cmp(&b.container_path));

    output_slice(&entries, format).context("Failed to output mounts")?;
    Ok(())
}

fn list_containers(store: &DirectoryStore, format: OutputFormat, no_trunc: bool) -> Result<()> {
    let containers = store.list().context("Failed to list containers")?;

    let entries: Vec<ContainerListEntry> = containers
        .into_iter()
        .map(|c| ContainerListEntry {
            id: if no_trunc {
                c.id.clone()
            } else {
                truncate_id(&c.id)
            },
            full_id: c.id,
            name: c.name,
            rootfs: c.rootfs.display().to_string(),
            mounts: c.mounts.len(),
        })
        .collect();

    output_slice(&entries, format).context("Failed to output containers")?;
    Ok(())
}
