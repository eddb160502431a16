//! flux - run fileflux operations against a host directory.
//!
//! Usage:
//!   flux ls [PATH]              List a directory
//!   flux stat PATH              Show metadata
//!   flux cp SRC DEST            Copy a file or tree
//!   flux mv SRC DEST            Move a file or tree
//!   flux rm [-r] PATH           Remove a file or directory
//!   flux --help                 Show help
//!
//! Every path is relative to `--root` (default: the current directory).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use tracing_subscriber::EnvFilter;

use fileflux_backend::LocalBackend;
use fileflux_core::{CopyOrMoveOptions, EngineConfig, FileInfo, LogicalPath, ObserverSet};
use fileflux_ops::{BackendRegistry, MemoryQuota, OperationProgress, OperationRunner, QuotaGate};

/// Scope name the host directory is registered under.
const SCOPE: &str = "host";

#[derive(Parser)]
#[command(
    name = "flux",
    version,
    about = "Run virtual filesystem operations against a host directory",
    long_about = "flux drives the fileflux operation engine over a local directory.\n\n\
                  Every path argument is interpreted inside --root; paths cannot \
                  escape it."
)]
struct Cli {
    /// Directory that backs the virtual filesystem
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Limit on bytes the command may add to the directory
    #[arg(long)]
    quota: Option<i64>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Engine settings in TOML
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Show metadata for a file or directory
    Stat { path: String },

    /// Create a directory
    Mkdir {
        path: String,

        /// Create missing parents
        #[arg(short, long)]
        parents: bool,
    },

    /// Create a file if missing and set its times to now
    Touch { path: String },

    /// Copy a file or directory tree
    Cp {
        src: String,
        dest: String,

        /// Keep source modification times
        #[arg(short, long)]
        preserve: bool,
    },

    /// Move a file or directory tree
    Mv { src: String, dest: String },

    /// Remove a file or directory
    Rm {
        path: String,

        /// Remove directories and their contents
        #[arg(short, long)]
        recursive: bool,
    },

    /// Set a file's length
    Truncate { path: String, length: u64 },

    /// Copy a file from anywhere on the host into the directory
    Import { native: PathBuf, dest: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    let backend = Arc::new(LocalBackend::new(&cli.root));
    let quota: Arc<dyn QuotaGate> = match cli.quota {
        Some(limit) => Arc::new(MemoryQuota::with_default_quota(limit)),
        None => Arc::new(MemoryQuota::unlimited()),
    };
    let registry = BackendRegistry::new().with_backend(SCOPE, backend);
    let runner = OperationRunner::new(registry, quota, ObserverSet::new(), config);

    match cli.command {
        Command::Ls { path } => run_ls(&runner, &path, cli.json).await?,
        Command::Stat { path } => run_stat(&runner, &path, cli.json).await?,
        Command::Mkdir { path, parents } => {
            runner
                .create_directory(logical(&path), false, parents)
                .await
                .wrap_err_with(|| format!("mkdir {path}"))?;
        }
        Command::Touch { path } => {
            let now = SystemTime::now();
            runner
                .create_file(logical(&path), false)
                .await
                .wrap_err_with(|| format!("create {path}"))?;
            runner
                .touch_file(logical(&path), now, now)
                .await
                .wrap_err_with(|| format!("touch {path}"))?;
        }
        Command::Cp {
            src,
            dest,
            preserve,
        } => {
            let options = if preserve {
                CopyOrMoveOptions::preserving_last_modified()
            } else {
                CopyOrMoveOptions::default()
            };
            run_transfer(&runner, &src, &dest, options, false, cli.json).await?;
        }
        Command::Mv { src, dest } => {
            run_transfer(&runner, &src, &dest, CopyOrMoveOptions::default(), true, cli.json)
                .await?;
        }
        Command::Rm { path, recursive } => {
            runner
                .remove(logical(&path), recursive)
                .await
                .wrap_err_with(|| format!("remove {path}"))?;
        }
        Command::Truncate { path, length } => {
            runner
                .truncate(logical(&path), length)
                .await
                .wrap_err_with(|| format!("truncate {path}"))?;
        }
        Command::Import { native, dest } => {
            runner
                .copy_in_foreign_file(native.clone(), logical(&dest))
                .await
                .wrap_err_with(|| format!("import {}", native.display()))?;
        }
    }

    Ok(())
}

fn logical(path: &str) -> LogicalPath {
    LogicalPath::new(SCOPE, path)
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading {}", path.display()))?;
    toml::from_str(&raw).wrap_err_with(|| format!("parsing {}", path.display()))
}

async fn run_ls(runner: &OperationRunner, path: &str, json: bool) -> Result<()> {
    let entries = runner
        .read_directory(logical(path))
        .await
        .wrap_err_with(|| format!("list {path}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    let dir = logical(path);
    for entry in &entries {
        let info = runner.get_metadata(dir.join(&entry.name)).await?;
        let marker = if entry.is_directory { "/" } else { "" };
        println!(
            "{:>10}  {}  {}{}",
            if info.is_directory {
                "-".to_string()
            } else {
                format_size(info.size)
            },
            format_time(info.modified),
            entry.name,
            marker
        );
    }
    Ok(())
}

async fn run_stat(runner: &OperationRunner, path: &str, json: bool) -> Result<()> {
    let info = runner
        .get_metadata(logical(path))
        .await
        .wrap_err_with(|| format!("stat {path}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stat_json(path, &info))?);
    } else {
        println!("  Path: {}", logical(path));
        println!("  Type: {}", if info.is_directory { "directory" } else { "file" });
        println!("  Size: {} ({} bytes)", format_size(info.size), info.size);
        println!("Modify: {}", format_time(info.modified));
    }
    Ok(())
}

fn stat_json(path: &str, info: &FileInfo) -> serde_json::Value {
    serde_json::json!({
        "path": logical(path).to_string(),
        "is_directory": info.is_directory,
        "size": info.size,
        "modified": DateTime::<Local>::from(info.modified).to_rfc3339(),
    })
}

async fn run_transfer(
    runner: &OperationRunner,
    src: &str,
    dest: &str,
    options: CopyOrMoveOptions,
    is_move: bool,
    json: bool,
) -> Result<()> {
    let (sink, mut rx) = runner.progress_channel();
    let pending = if is_move {
        runner.move_with_progress(logical(src), logical(dest), options, sink)
    } else {
        runner.copy_with_progress(logical(src), logical(dest), options, sink)
    };
    let kind = if is_move {
        fileflux_ops::OperationKind::Move
    } else {
        fileflux_ops::OperationKind::Copy
    };

    // The sink is dropped with the operation, which ends the stream.
    let collector = tokio::spawn(async move {
        let mut progress = OperationProgress::new(kind, 0);
        while let Some(event) = rx.recv().await {
            tracing::trace!(?event, "progress");
            progress.apply(&event);
        }
        progress
    });

    pending
        .await
        .wrap_err_with(|| format!("{kind} {src} -> {dest}"))?;
    let progress = collector.await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "operation": kind,
                "files": progress.files_completed,
                "directories": progress.directories_completed,
                "bytes": progress.bytes_processed,
            }))?
        );
    } else {
        println!(
            "{} ({})",
            progress.summary(),
            format_size(progress.bytes_processed)
        );
    }
    Ok(())
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

fn format_time(time: SystemTime) -> String {
    DateTime::<Local>::from(time)
        .format("%Y-%m-%d %H:%M")
        .to_string()
}
