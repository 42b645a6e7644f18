use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use mot_history::commands::bulk;
use mot_history::commands::lookup::{lookup_vehicle, VehicleQuery};
use mot_history::config::{
    Credentials, HttpSettings, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS,
};
use mot_history::dvsa::{ApiClient, LoggingMode};
use mot_history::pipeline::{latest_bulk_archive, BulkPipeline, PipelineOptions};
use mot_history::streaming::{Downloader, DEFAULT_BATCH_SIZE};
use mot_history::AppError;

#[derive(Parser)]
#[command(name = "mot-history")]
#[command(about = "Look up MOT history and export DVSA bulk data to Parquet")]
#[command(version)]
struct Cli {
    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Load environment variables from this file instead of ./.env
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Per-request timeout in seconds
    #[arg(
        long,
        global = true,
        env = "MOT_HISTORY_TIMEOUT_SECS",
        default_value_t = DEFAULT_TIMEOUT_SECS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    timeout_secs: u64,

    /// Retries for failed bulk downloads
    #[arg(long, global = true, env = "MOT_HISTORY_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Look up a vehicle by registration mark
    Vrm {
        /// Registration mark, e.g. "AB12 CDE"
        vrm: String,
    },

    /// Look up a vehicle by VIN
    Vin {
        /// Vehicle identification number
        vin: String,
    },

    /// Print the bulk download manifest as JSON
    BulkUrls,

    /// Download bulk files and convert them to Parquet
    Download(DownloadArgs),

    /// Convert a bulk file already on disk to Parquet
    Convert {
        /// Zip, gzip or NDJSON bulk file. Defaults to the newest
        /// bulk-light-vehicle_*.zip in --data-dir
        input: Option<PathBuf>,

        /// Where to look for a bulk archive when no input is given
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,

        #[arg(long, default_value = "data/parquet")]
        output_dir: PathBuf,

        /// Rows per row group
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
    },

    /// Print row count and schema of a Parquet file
    Inspect {
        parquet: PathBuf,
    },
}

#[derive(Args)]
struct DownloadArgs {
    /// Where downloaded bulk files are kept
    #[arg(long, default_value = "data")]
    download_dir: PathBuf,

    /// Where Parquet files are written
    #[arg(long, default_value = "data/parquet")]
    output_dir: PathBuf,

    /// Skip delta files
    #[arg(long)]
    no_delta: bool,

    /// Only process files whose name matches this glob, e.g. "bulk-*"
    #[arg(long, value_name = "GLOB")]
    only: Option<String>,

    /// Rows per row group
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, _) => "debug",
    };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();
}

fn load_env_file(path: Option<&PathBuf>) -> Result<()> {
    match path {
        Some(path) => {
            dotenv::from_path(path)
                .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path.display(), e))?;
        }
        None => {
            dotenv::dotenv().ok();
        }
    }
    Ok(())
}

fn report(err: &AppError) {
    let presentation = err.to_presentation();
    eprintln!("error: {}", presentation.title);
    eprintln!("  {}", presentation.message);
    if let Some(action) = presentation.action {
        eprintln!("  hint: {}", action);
    }
    debug!("{}", err);
}

fn api_client(settings: &HttpSettings, logging_mode: LoggingMode) -> Result<ApiClient, AppError> {
    let creds = Credentials::from_env()?;
    Ok(ApiClient::new(&creds, settings)?.with_logging_mode(logging_mode))
}

async fn run(cli: Cli) -> Result<bool, AppError> {
    let settings = HttpSettings {
        timeout: Duration::from_secs(cli.timeout_secs),
        max_retries: cli.max_retries,
        ..HttpSettings::default()
    };
    let logging_mode = if cli.verbose >= 2 {
        LoggingMode::PathAndQueryRedacted
    } else {
        LoggingMode::PathOnly
    };

    let mut out = io::stdout();

    match cli.command {
        Commands::Vrm { vrm } => {
            let client = api_client(&settings, logging_mode)?;
            lookup_vehicle(&client, &VehicleQuery::Registration(vrm), &mut out).await?;
            Ok(true)
        }
        Commands::Vin { vin } => {
            let client = api_client(&settings, logging_mode)?;
            lookup_vehicle(&client, &VehicleQuery::Vin(vin), &mut out).await?;
            Ok(true)
        }
        Commands::BulkUrls => {
            let client = api_client(&settings, logging_mode)?;
            bulk::print_bulk_urls(&client, &mut out).await?;
            Ok(true)
        }
        Commands::Download(args) => {
            let only = args
                .only
                .as_deref()
                .map(glob::Pattern::new)
                .transpose()
                .map_err(|e| AppError::InvalidInput(format!("invalid --only pattern: {}", e)))?;

            let client = api_client(&settings, logging_mode)?;
            let downloader = Downloader::new(&settings)?
                .with_logging_mode(logging_mode)
                .with_progress(!cli.quiet && io::stderr().is_terminal());

            let pipeline = BulkPipeline::new(
                client,
                downloader,
                PipelineOptions {
                    download_dir: args.download_dir,
                    output_dir: args.output_dir,
                    include_delta: !args.no_delta,
                    only,
                    batch_size: args.batch_size,
                },
            );

            let summary = bulk::download(&pipeline, &mut out).await?;
            Ok(summary.is_success())
        }
        Commands::Convert {
            input,
            data_dir,
            output_dir,
            batch_size,
        } => {
            let input = match input {
                Some(input) => input,
                None => latest_bulk_archive(&data_dir)?,
            };
            bulk::convert(&input, &output_dir, batch_size, &mut out).await?;
            Ok(true)
        }
        Commands::Inspect { parquet } => {
            bulk::print_inspection(&parquet, &mut out)?;
            Ok(true)
        }
    }
}

/// Parses the command line, loads the env file it names, then parses again
/// so env-backed flags see the file's values.
fn parse_with_env_file(args: &[OsString]) -> Result<Cli> {
    let cli = Cli::parse_from(args);
    load_env_file(cli.env_file.as_ref())?;
    Ok(Cli::parse_from(args))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args: Vec<OsString> = std::env::args_os().collect();
    let cli = parse_with_env_file(&args)?;
    init_logging(cli.verbose, cli.quiet);

    match run(cli).await {
        Ok(true) => Ok(ExitCode::SUCCESS),
        Ok(false) => Ok(ExitCode::FAILURE),
        Err(err) => {
            report(&err);
            Ok(ExitCode::FAILURE)
        }
    }
}
