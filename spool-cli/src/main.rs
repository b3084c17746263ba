//! CLI for the spool buffering pipeline.
//!
//! Provides commands for inspecting store directories, decoding pending
//! files, syncing them to a directory sink, and benchmarking the write path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use spool::compression::CompressionMode;
use spool::config::SpoolConfig;
use spool::datum::{DataKind, DataUnit};
use spool::local::LocalStore;
use spool::pending::PendingFile;
use spool::remote::{CommitMode, RemoteStoreCoordinator};
use spool::sink::DirectorySink;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// spool — Durable local buffering with batched remote sync.
#[derive(Parser)]
#[command(name = "spool", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// List pending and open files in a store directory.
    Info {
        /// Path to the store directory.
        store_path: PathBuf,
    },

    /// Decode a pending file and print its records as JSON lines.
    Dump {
        /// Path to a pending file.
        file: PathBuf,
    },

    /// Commit every pending file in a store to a directory sink.
    ///
    /// Files still open for writing are left alone, so this is safe to run
    /// next to a live producer.
    Sync {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Root directory of the sink.
        #[arg(long)]
        target: PathBuf,

        /// Route a kind to a table, as `kind=table`. Repeatable.
        #[arg(long = "table", value_parser = parse_table)]
        tables: Vec<(DataKind, String)>,

        /// Table for kinds without a `--table` entry.
        #[arg(long)]
        default_table: Option<String>,

        /// JSON config file; the store path and routing flags override it.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run a concurrent write-path benchmark.
    Bench {
        /// Number of records to write in total.
        #[arg(long, default_value = "100000")]
        records: u64,

        /// Number of producer threads.
        #[arg(long, default_value = "4")]
        threads: u64,

        /// Compression mode for the benchmark store.
        #[arg(long, default_value = "fast")]
        compression: Compression,
    },
}

/// Compression mode names accepted on the command line.
#[derive(Clone, Copy, ValueEnum)]
enum Compression {
    /// Raw newline-delimited JSON.
    None,
    /// zstd, fastest level.
    Fast,
    /// zstd, highest non-ultra level.
    Optimal,
}

impl From<Compression> for CompressionMode {
    fn from(value: Compression) -> Self {
        match value {
            Compression::None => Self::None,
            Compression::Fast => Self::Fast,
            Compression::Optimal => Self::Optimal,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info { store_path } => cmd_info(&store_path),
        Commands::Dump { file } => cmd_dump(&file),
        Commands::Sync {
            store_path,
            target,
            tables,
            default_table,
            config,
        } => cmd_sync(store_path, target, tables, default_table, config.as_deref()).await,
        Commands::Bench {
            records,
            threads,
            compression,
        } => cmd_bench(records, threads, compression.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `spool info <store_path>`.
fn cmd_info(store_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !store_path.is_dir() {
        return Err(format!("No store found at '{}'", store_path.display()).into());
    }

    let pending = PendingFile::scan(store_path)?;
    let mut open = Vec::new();
    for entry in std::fs::read_dir(store_path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".open") {
            open.push((name, entry.metadata()?.len()));
        }
    }
    open.sort();

    println!("Store: {}", store_path.display());
    println!();
    println!("Pending files: {}", pending.len());

    let mut total = 0;
    for file in &pending {
        let size = file.size_on_disk();
        total += size;
        println!(
            "  gen {:>6}  {:<8} {:>10}",
            file.generation(),
            file.mode().tag(),
            format_bytes(size)
        );
    }
    if !pending.is_empty() {
        println!("  Total: {}", format_bytes(total));
    }

    println!();
    println!("Open files: {}", open.len());
    for (name, size) in &open {
        println!("  {name}  {}", format_bytes(*size));
    }
    if open.len() > 1 {
        println!("  (more than one open file: a previous run did not stop cleanly)");
    }

    Ok(())
}

/// Implements `spool dump <file>`.
fn cmd_dump(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let pending = PendingFile::from_path(file)?;
    let outcome = pending.read_units()?;

    for unit in &outcome.units {
        println!("{}", serde_json::to_string(unit)?);
    }

    eprintln!("{} records from '{}'", outcome.units.len(), file.display());
    if let Some(reason) = outcome.truncated {
        eprintln!("warning: unreadable tail dropped ({reason})");
    }

    Ok(())
}

/// Implements `spool sync <store_path> --target <dir>`.
async fn cmd_sync(
    store_path: PathBuf,
    target: PathBuf,
    tables: Vec<(DataKind, String)>,
    default_table: Option<String>,
    config_path: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match config_path {
        Some(path) => SpoolConfig::load(path)?,
        None => SpoolConfig::default(),
    };
    config.directory = store_path;
    for (kind, table) in tables {
        config.tables.insert(kind, table);
    }
    if default_table.is_some() {
        config.default_table = default_table;
    }

    config.validate()?;

    // The store is never started: a producer may still own its open file.
    // Only files already in the pending set are committed.
    let local = LocalStore::new(&config, "sync");
    let remote = RemoteStoreCoordinator::new(&config, Arc::new(DirectorySink::new(&target)), "sync");
    remote.start().await?;
    info!(
        store = %config.directory.display(),
        target = %target.display(),
        "syncing pending files"
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });
    let result = remote.commit_pending(&local, &cancel, CommitMode::Forced).await;
    remote.stop().await?;
    let report = result?;

    println!("Sync finished: {:?}", report.outcome);
    println!("  Files committed: {}", report.files_committed);
    println!("  Files retained:  {}", report.files_retained);
    println!("  Records committed: {}", report.records_committed);
    println!("  Duplicates:        {}", report.duplicates);
    println!("  Rejected:          {}", report.rejected);
    println!("  Left for retry:    {}", report.retried);
    if report.data_loss_files > 0 {
        println!("  Files with unreadable tails: {}", report.data_loss_files);
    }

    Ok(())
}

/// Implements `spool bench`.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)] // Benchmark figures are display-only
fn cmd_bench(records: u64, threads: u64, mode: CompressionMode) -> Result<(), Box<dyn std::error::Error>> {
    let threads = threads.max(1);
    println!("spool write benchmark");
    println!("  Records: {records}");
    println!("  Threads: {threads}");
    println!("  Compression: {mode}");
    println!();

    let temp_dir = std::env::temp_dir().join(format!("spool_bench_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&temp_dir);

    let config = SpoolConfig::new(&temp_dir).with_compression(mode);
    let store = Arc::new(LocalStore::new(&config, "bench"));
    store.start()?;

    let kinds = [
        DataKind::new("location")?,
        DataKind::new("battery")?,
        DataKind::new("wifi")?,
    ];
    let per_thread = records / threads;
    debug!(per_thread, "spawning producers");

    let start = Instant::now();
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let store = Arc::clone(&store);
            let kinds = kinds.clone();
            thread::spawn(move || -> Result<u64, String> {
                let mut bytes = 0;
                for i in 0..per_thread {
                    let kind = kinds[(i % 3) as usize].clone();
                    let unit = DataUnit::new(
                        "bench",
                        kind,
                        serde_json::json!({ "producer": t, "seq": i, "value": i as f64 * 0.5 }),
                    )
                    .map_err(|e| e.to_string())?;
                    bytes += store.write(&unit).map_err(|e| e.to_string())?.bytes;
                }
                Ok(bytes)
            })
        })
        .collect();

    let mut logical_bytes = 0;
    for handle in handles {
        logical_bytes += handle.join().map_err(|_| "producer thread panicked")??;
    }
    store.stop()?;
    let elapsed = start.elapsed();

    let files = store.pending_files()?;
    let on_disk: u64 = files.iter().map(PendingFile::size_on_disk).sum();
    let total_writes = per_thread * threads;
    let ns_per_write = elapsed.as_nanos() as f64 / total_writes.max(1) as f64;
    let writes_per_sec = total_writes as f64 / elapsed.as_secs_f64();

    println!("Results:");
    println!("  Total writes: {total_writes}");
    println!("  Elapsed: {elapsed:.3?}");
    println!("  Avg latency: {ns_per_write:.1} ns/write");
    println!("  Throughput: {writes_per_sec:.0} writes/sec");
    println!("  Files: {}", files.len());
    println!("  Logical size: {}", format_bytes(logical_bytes));
    println!("  On disk: {}", format_bytes(on_disk));
    if on_disk > 0 {
        println!("  Ratio: {:.2}x", logical_bytes as f64 / on_disk as f64);
    }
    println!();

    // Clean up
    let _ = std::fs::remove_dir_all(&temp_dir);

    Ok(())
}

/// Parses a `kind=table` routing flag.
fn parse_table(s: &str) -> Result<(DataKind, String), String> {
    let (kind, table) = s
        .split_once('=')
        .ok_or_else(|| format!("expected kind=table, got '{s}'"))?;
    let kind = DataKind::new(kind.trim()).map_err(|e| e.to_string())?;
    let table = table.trim();
    if table.is_empty() {
        return Err(format!("empty table name in '{s}'"));
    }
    Ok((kind, table.to_string()))
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}
