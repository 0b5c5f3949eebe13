use anyhow::Context;
use cassnap::{
    backup, connect, download_snapshot, restore_apply, restore_prepare, ring, transfer_progress_bar,
    BackupRequest, CloudConfig, CloudProvider, NodeConfig, Nodetool, TransferEngine,
    TransferOptions,
};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the OAuth2 access token for GCS.
const GCS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

#[derive(Parser, Debug)]
#[command(name = "cassnap")]
#[command(about = "Back up Cassandra snapshots to S3/GCS and restore them onto a new cluster", long_about = None)]
#[command(version)]
struct Cli {
    /// Debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Path to cassandra.yaml (searched for in the usual locations by default)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the nodetool executable (searched for in the usual locations by default)
    #[arg(long, global = true)]
    nodetool: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Snapshot this node and upload it to the bucket
    Backup {
        /// Snapshot id (defaults to the current UTC time, YYYY-MM-DD_HHMMSS)
        #[arg(short, long)]
        snapshot_id: Option<String>,

        /// Keyspaces to back up (comma-separated, all when omitted)
        #[arg(short, long, value_delimiter = ',')]
        keyspaces: Vec<String>,

        /// Upload again even if the snapshot is marked complete
        #[arg(long)]
        force: bool,

        #[command(flatten)]
        cloud: CloudArgs,
    },

    /// Restore a snapshot onto a new cluster
    #[command(subcommand)]
    Restore(RestoreCommand),
}

#[derive(Subcommand, Debug)]
enum RestoreCommand {
    /// Capture source token ranges and write the node mapping file
    Prepare {
        /// Name of the cluster being restored
        #[arg(long)]
        cluster_name: String,

        /// Source nodes (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        source_nodes: Vec<String>,

        /// Destination nodes, paired with source nodes by position (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        destination_nodes: Vec<String>,

        /// Mapping file to write (defaults to <cluster-name>-mapping.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write the source node's token range into this node's cassandra.yaml
    Apply {
        /// Address of this node in the mapping (defaults to listen_address)
        #[arg(short, long)]
        node: Option<String>,

        /// Mapping file written by `restore prepare`
        #[arg(short, long)]
        mapping: PathBuf,
    },

    /// Download the source node's snapshot into this node's data directories
    Download {
        /// Address of this node in the mapping (defaults to listen_address)
        #[arg(short, long)]
        node: Option<String>,

        /// Snapshot id to restore
        #[arg(short, long)]
        snapshot_id: String,

        /// Mapping file written by `restore prepare`
        #[arg(short, long)]
        mapping: PathBuf,

        /// Skip tables missing locally instead of aborting
        #[arg(long)]
        skip_tables: bool,

        #[command(flatten)]
        cloud: CloudArgs,
    },
}

#[derive(Args, Debug)]
struct CloudArgs {
    /// Bucket region
    #[arg(short, long, default_value = "us-east-1")]
    region: String,

    /// Bucket name
    #[arg(short, long)]
    bucket: String,

    /// Cloud provider
    #[arg(short = 'c', long = "cloud-provider", value_enum, default_value = "aws")]
    provider: CloudProvider,

    /// Bandwidth cap in megabits per second (0 = unlimited)
    #[arg(short, long, default_value_t = 200)]
    throttle: u64,

    /// Custom endpoint for S3-compatible stores
    #[arg(long)]
    endpoint: Option<String>,

    /// Maximum number of concurrent transfers
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Retries per object on transient errors
    #[arg(long, default_value_t = 3)]
    retries: usize,

    /// Compare MD5 checksums before skipping files that already exist
    #[arg(long)]
    verify_checksums: bool,
}

impl CloudArgs {
    fn into_config(self) -> CloudConfig {
        CloudConfig {
            provider: self.provider,
            region: self.region,
            bucket: self.bucket,
            endpoint: self.endpoint,
            throttle_mbps: self.throttle,
            max_concurrent_transfers: self.concurrency,
            retry_attempts: self.retries,
            verify_checksums: self.verify_checksums,
            gcs_access_token: std::env::var(GCS_TOKEN_ENV).ok(),
            ..CloudConfig::default()
        }
    }
}

fn load_node_config(path: Option<&PathBuf>) -> anyhow::Result<NodeConfig> {
    let config = match path {
        Some(path) => NodeConfig::load(path),
        None => NodeConfig::discover(),
    };
    config.context("could not load cassandra configuration")
}

fn find_nodetool(path: Option<&PathBuf>) -> anyhow::Result<Nodetool> {
    match path {
        Some(path) => Ok(Nodetool::new(path)),
        None => Nodetool::discover().context("could not find nodetool"),
    }
}

async fn engine(cloud: CloudArgs, message: &str) -> anyhow::Result<TransferEngine> {
    let config = cloud.into_config();
    info!("Bucket: {} ({}, {})", config.bucket, config.provider, config.region);
    let store = connect(&config)
        .await
        .with_context(|| format!("could not open bucket {}", config.bucket))?;
    Ok(TransferEngine::new(store, TransferOptions::from(&config)).with_progress(transfer_progress_bar(message)))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Backup {
            snapshot_id,
            keyspaces,
            force,
            cloud,
        } => {
            let node = load_node_config(cli.config.as_ref())?;
            let nodetool = find_nodetool(cli.nodetool.as_ref())?;
            let engine = engine(cloud, "📦 Uploading snapshot").await?;
            let request = BackupRequest {
                snapshot_id,
                keyspaces,
                force,
            };
            let report = backup(&engine, &node, &nodetool, &request)
                .await
                .context("backup failed")?;
            info!("Snapshot id: {}", report.snapshot_id);
        }
        Command::Restore(RestoreCommand::Prepare {
            cluster_name,
            source_nodes,
            destination_nodes,
            output,
        }) => {
            let nodetool = find_nodetool(cli.nodetool.as_ref())?;
            restore_prepare(
                &nodetool,
                &cluster_name,
                &source_nodes,
                &destination_nodes,
                output.as_deref(),
            )
            .await
            .context("restore prepare failed")?;
        }
        Command::Restore(RestoreCommand::Apply { node, mapping }) => {
            let config = load_node_config(cli.config.as_ref())?;
            let destination = match node {
                Some(node) => node,
                None => config.node_address()?,
            };
            let applied = restore_apply(&config, &mapping, &destination)
                .with_context(|| format!("could not apply {}", mapping.display()))?;
            info!(
                "✅ {} now owns the token range of {}; start it with auto_bootstrap disabled",
                destination, applied.source
            );
        }
        Command::Restore(RestoreCommand::Download {
            node,
            snapshot_id,
            mapping,
            skip_tables,
            cloud,
        }) => {
            let config = load_node_config(cli.config.as_ref())?;
            let destination = match node {
                Some(node) => node,
                None => config.node_address()?,
            };
            let mapping = ring::load_mapping(&mapping)
                .with_context(|| format!("could not read mapping file {}", mapping.display()))?;
            let engine = engine(cloud, "📥 Downloading snapshot").await?;
            download_snapshot(&engine, &config, &mapping, &destination, &snapshot_id, skip_tables)
                .await
                .context("restore download failed")?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing; RUST_LOG takes precedence over --debug
    let log_level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cassnap={}", log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚀 Cassnap - Cassandra snapshot backup and restore");

    if let Err(e) = run(cli).await {
        eprintln!("❌ Error: {:#}", e);
        std::process::exit(1);
    }
}
