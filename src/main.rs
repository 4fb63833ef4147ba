use anyhow::Context;
use clap::Parser;
use serverlist_sync::{
    CommonListOutcome, CommonListSynchronizer, FileDataStore, HttpTransport,
    RemoteServerListConfig, SyncContext,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "serverlist-sync")]
#[command(about = "Fetch, verify, and merge a signed remote server list", long_about = None)]
#[command(version)]
struct Args {
    /// Common remote server list URL
    #[arg(short, long)]
    url: String,

    /// Base64 ed25519 public key that signs the list
    #[arg(short = 'k', long)]
    public_key: String,

    /// Directory for downloaded lists
    #[arg(short, long, default_value = ".serverlist")]
    download_dir: PathBuf,

    /// Data store directory holding ETags and merged server entries
    #[arg(long, default_value = ".serverlist/datastore")]
    data_store: PathBuf,

    /// Per-fetch timeout (e.g. "30s", "2m")
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Re-run the sync at this interval instead of exiting after one pass
    #[arg(long, value_parser = humantime::parse_duration)]
    interval: Option<Duration>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("serverlist_sync={}", log_level))
        .init();

    info!("Remote server list: {}", args.url);
    info!("Data store: {:?}", args.data_store);

    std::fs::create_dir_all(&args.download_dir)
        .with_context(|| format!("creating {:?}", args.download_dir))?;

    let config = RemoteServerListConfig {
        remote_server_list_url: args.url,
        remote_server_list_signature_public_key: args.public_key,
        remote_server_list_download_filename: args.download_dir.join("remote_server_list"),
        obfuscated_server_list_root_url: None,
        obfuscated_server_list_download_directory: args.download_dir.join("osl"),
        fetch_timeout: args.timeout,
        ..Default::default()
    };

    let store = Arc::new(
        FileDataStore::open(&args.data_store)
            .with_context(|| format!("opening data store {:?}", args.data_store))?,
    );
    let transport = Arc::new(HttpTransport::new().context("building HTTP client")?);
    let ctx = Arc::new(SyncContext::with_file_store(config, transport, store));
    let synchronizer = CommonListSynchronizer::new(ctx);

    let Some(interval) = args.interval else {
        let outcome = synchronizer.sync().await?;
        report(&outcome);
        return Ok(());
    };

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => match synchronizer.sync().await {
                Ok(outcome) => report(&outcome),
                Err(e) => error!("Sync failed: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}

fn report(outcome: &CommonListOutcome) {
    match outcome {
        CommonListOutcome::Unchanged => info!("Remote server list unchanged"),
        CommonListOutcome::Updated {
            entries,
            etag_committed,
        } => {
            info!("Merged {} server entries", entries);
            if !etag_committed {
                info!("ETag not stored; the list will be downloaded again next time");
            }
        }
    }
}
