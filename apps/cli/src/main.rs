//! Shetab CLI - Command-line segmented downloader
//!
//! Downloads one or more URLs in parallel byte-range segments and shows
//! live progress for each of them.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use shetab_types::EngineConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Shetab - Segmented Download Manager
#[derive(Parser)]
#[command(name = "shetab")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output (debug logging)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Download URLs and wait for them to finish
    Get {
        /// URLs to download
        #[arg(required = true)]
        urls: Vec<String>,

        /// Destination directory
        #[arg(short, long, env = "SHETAB_DIR")]
        dir: Option<PathBuf>,

        /// File name to save as (single URL only)
        #[arg(short, long)]
        filename: Option<String>,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Probe URLs for size, range support and file name
    Probe {
        /// URLs to probe
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

/// Engine tuning shared by download commands
#[derive(Args)]
struct EngineArgs {
    /// Maximum parallel segments per download
    #[arg(short, long, env = "SHETAB_SEGMENTS", default_value_t = 5)]
    segments: u32,

    /// Smallest segment worth its own connection, in bytes
    #[arg(long, env = "SHETAB_MIN_SEGMENT_SIZE", default_value_t = 1024 * 1024)]
    min_segment_size: u64,

    /// Maximum downloads running at once
    #[arg(short = 'j', long, env = "SHETAB_MAX_CONCURRENT", default_value_t = 3)]
    max_concurrent: usize,

    /// Bytes read per network read
    #[arg(long, env = "SHETAB_CHUNK_SIZE", default_value_t = 1024 * 1024)]
    chunk_size: usize,

    /// Seconds to wait for data before a segment fails
    #[arg(long, env = "SHETAB_READ_TIMEOUT", default_value_t = 30)]
    read_timeout: u64,

    /// Directory for part files
    #[arg(long, env = "SHETAB_TEMP_DIR")]
    temp_dir: Option<PathBuf>,
}

impl EngineArgs {
    fn into_config(self) -> EngineConfig {
        EngineConfig {
            max_concurrent_downloads: self.max_concurrent,
            max_segments_per_download: self.segments,
            min_segment_size: self.min_segment_size,
            chunk_size: self.chunk_size,
            read_timeout_secs: self.read_timeout,
            temp_dir: self.temp_dir,
            ..EngineConfig::default()
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "shetab_core=debug,info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Get {
            urls,
            dir,
            filename,
            engine,
        } => {
            let dir = dir.unwrap_or_else(|| {
                dirs::download_dir()
                    .or_else(|| std::env::current_dir().ok())
                    .unwrap_or_else(|| PathBuf::from("."))
            });
            commands::get(urls, dir, filename, engine.into_config(), cli.output).await?
        }

        Commands::Probe { urls } => commands::probe_urls(urls, cli.output).await?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "shetab", &mut std::io::stdout());
        }
    }

    Ok(())
}
