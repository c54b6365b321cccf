//! tierstore - command-line access to a tiered block store
//!
//! Each invocation opens the store, runs one command and closes it again.
//! Closing drains every resident block to the disk target, so a block that
//! was `put` is readable with `get` afterwards either way.
//!
//! ```text
//! ┌──────────┐     ┌───────────────────────┐     ┌──────────────────────┐
//! │   CLI    │────▶│      TieredStore      │────▶│      DiskTarget      │
//! │ command  │     │ <data-dir>/.mmap_...  │     │ <target-dir>/ab/cd/… │
//! └──────────┘     └───────────────────────┘     └──────────────────────┘
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tierstore::tiered::{DiskTarget, StoreConfig, TieredStore, FINAL_VERSION};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tierstore - mmap-staged block store with background sync
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the mapped cache file [default: ./data]
    #[arg(long, env = "TIERSTORE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Capacity of the mapped file in bytes
    #[arg(long, env = "TIERSTORE_CAPACITY")]
    capacity: Option<u64>,

    /// YAML configuration file; flags override its values
    #[arg(long, env = "TIERSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Root of the disk target (defaults to <data-dir>/blocks)
    #[arg(long, env = "TIERSTORE_TARGET_DIR")]
    target_dir: Option<PathBuf>,

    /// Storage id the disk target is registered under
    #[arg(long, env = "TIERSTORE_STORAGE_ID", default_value = "default")]
    storage_id: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store the contents of a file as a block
    Put {
        block_id: String,
        file: PathBuf,

        /// Block version
        #[arg(long, default_value_t = 1)]
        version: i32,

        /// Mark the block as final
        #[arg(long = "final")]
        is_final: bool,
    },

    /// Write a block (or part of it) to stdout or a file
    Get {
        block_id: String,

        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Bytes to read; 0 reads to the end
        #[arg(long, default_value_t = 0)]
        length: u64,

        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Remove a block
    Rm { block_id: String },

    /// List resident blocks
    Ls,

    /// Print store statistics
    Stats {
        #[arg(long, value_enum, default_value_t = StatsFormat::Json)]
        format: StatsFormat,
    },

    /// Sync every resident block to the target
    Drain,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatsFormat {
    Json,
    Prometheus,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = load_config(&args)?;
    let target_dir = args
        .target_dir
        .clone()
        .unwrap_or_else(|| config.data_dir.join("blocks"));

    info!(
        "Opening store at {} ({} bytes), target {}",
        config.data_dir.display(),
        config.capacity,
        target_dir.display()
    );

    let store = TieredStore::open(config)
        .await
        .context("failed to open store")?;
    store.register_target(args.storage_id.clone(), Arc::new(DiskTarget::new(target_dir)));

    let outcome = run(&store, &args).await;

    if let Err(e) = store.close().await {
        warn!("Close reported errors: {}", e);
        if outcome.is_ok() {
            return Err(e).context("failed to close store");
        }
    }

    outcome
}

async fn run(store: &TieredStore, args: &Args) -> anyhow::Result<()> {
    let storage_id = args.storage_id.as_str();

    match &args.command {
        Command::Put {
            block_id,
            file,
            version,
            is_final,
        } => {
            let data = tokio::fs::read(file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let version = if *is_final { FINAL_VERSION } else { *version };
            store
                .write(storage_id, block_id, &[data], version)
                .await
                .with_context(|| format!("failed to write block {}", block_id))?;
        }

        Command::Get {
            block_id,
            offset,
            length,
            output,
        } => {
            let data = store
                .read(storage_id, block_id, *offset, *length)
                .await
                .with_context(|| format!("failed to read block {}", block_id))?;
            match output {
                Some(path) => tokio::fs::write(path, &data)
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => std::io::stdout().lock().write_all(&data)?,
            }
        }

        Command::Rm { block_id } => {
            store
                .remove(storage_id, block_id)
                .await
                .with_context(|| format!("failed to remove block {}", block_id))?;
        }

        Command::Ls => {
            let mut out = std::io::stdout().lock();
            for file in store.list_files() {
                writeln!(
                    out,
                    "{}\t{}\tv{}\t{}\t[{}, {})",
                    file.storage_id,
                    file.block_id,
                    file.version,
                    file.size(),
                    file.start(),
                    file.end()
                )?;
            }
        }

        Command::Stats { format } => {
            let snapshot = store.stats();
            let rendered = match format {
                StatsFormat::Json => serde_json::to_string_pretty(&snapshot)?,
                StatsFormat::Prometheus => snapshot.to_prometheus()?,
            };
            println!("{}", rendered);
        }

        Command::Drain => {
            store.sync_all().await.context("failed to drain store")?;
        }
    }

    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<StoreConfig> {
    let mut config = match &args.config {
        Some(path) => StoreConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => StoreConfig::default(),
    };

    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(capacity) = args.capacity {
        config.capacity = capacity;
    }
    config.validate()?;
    Ok(config)
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so `get` output on stdout stays clean
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
