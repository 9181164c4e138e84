//! Preweave - upload client for Preweave storage nodes
//!
//! Uploads files and directories and manages transactions. Results are
//! printed as JSON on stdout; logs go to stderr.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use preweave_uploadr::upload::UploadOptions;
use preweave_uploadr::{config::Config, metrics, telemetry, Preweave};
use std::path::PathBuf;
use tracing::info;

/// Preweave - chunked and atomic uploads to a Preweave node
#[derive(Parser, Debug)]
#[command(name = "preweave")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node URL; overrides the configuration file
    #[arg(short, long)]
    url: Option<String>,

    /// API key; overrides the configuration file
    #[arg(short = 'k', long)]
    api_key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Print collected metrics to stderr on exit
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file
    Upload {
        file: PathBuf,

        /// Content type; detected from the extension when omitted
        #[arg(long)]
        content_type: Option<String>,

        /// Server-side soak period
        #[arg(long)]
        soak_period: Option<u64>,
    },

    /// Upload a directory as one atomic group
    UploadDir {
        dir: PathBuf,

        /// Also upload a path manifest for the group
        #[arg(long)]
        manifest: bool,
    },

    /// Make transactions permanent
    Confirm {
        #[arg(required = true)]
        tx_ids: Vec<String>,
    },

    /// Hide transactions
    Hide {
        #[arg(required = true)]
        tx_ids: Vec<String>,
    },

    /// Unhide transactions
    Unhide {
        #[arg(required = true)]
        tx_ids: Vec<String>,
    },

    /// Remove transactions
    Remove {
        #[arg(required = true)]
        tx_ids: Vec<String>,
    },
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match (&args.config, &args.url) {
        (Some(path), _) => Config::load(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        (None, Some(url)) => Config::new(url.clone(), None),
        (None, None) => bail!("either --config or --url is required"),
    };

    if let Some(url) = &args.url {
        config.node.url = url.clone();
    }
    if let Some(api_key) = &args.api_key {
        config.node.api_key = Some(api_key.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn run(client: &Preweave, command: Command) -> anyhow::Result<serde_json::Value> {
    let output = match command {
        Command::Upload {
            file,
            content_type,
            soak_period,
        } => {
            let options = UploadOptions {
                content_type,
                soak_period,
            };
            let response = client.upload_file(&file, &options).await?;
            serde_json::to_value(response)?
        }
        Command::UploadDir { dir, manifest } => {
            let pool = client.upload_atomic_dir(&dir, manifest).await?;
            serde_json::to_value(pool)?
        }
        Command::Confirm { tx_ids } => serde_json::to_value(client.make_txs_permanent(&tx_ids).await?)?,
        Command::Hide { tx_ids } => serde_json::to_value(client.hide_txs(&tx_ids).await?)?,
        Command::Unhide { tx_ids } => serde_json::to_value(client.unhide_txs(&tx_ids).await?)?,
        Command::Remove { tx_ids } => serde_json::to_value(client.remove_txs(&tx_ids).await?)?,
    };
    Ok(output)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    telemetry::init_subscriber(&args.log_level, args.json_logs)?;
    info!("Starting Preweave Uploadr v{}", preweave_uploadr::VERSION);

    let config = load_config(&args)?;
    metrics::set_enabled(config.metrics.enabled);
    info!(node = %config.node.url, "Loaded configuration");

    let client = Preweave::new(config)?;
    let print_metrics = args.metrics;
    let result = run(&client, args.command).await;

    if print_metrics {
        eprint!("{}", metrics::encode_text());
    }

    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
