use std::path::PathBuf;

use clap::Parser;
use request_capture::{external::dotenv::dotenv, Options, SendableError, Server};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Accepts raw TCP requests and stores them, plus any uploaded file, on disk.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON file with options; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    address: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Seconds without data before a request counts as complete
    #[arg(long)]
    idle_timeout: Option<f64>,

    /// Stop reading once more than this many bytes arrived
    #[arg(long)]
    max_bytes: Option<usize>,

    #[arg(long)]
    storage_dir: Option<PathBuf>,
}

impl Args {
    fn into_options(self) -> Result<Options, SendableError> {
        let mut options = match &self.config {
            Some(path) => Options::from_json_file(path)?,
            None => Options::new(),
        };

        if let Some(address) = self.address {
            options.address = address;
        }
        if let Some(port) = self.port {
            options.port = port;
        }
        if let Some(idle_timeout) = self.idle_timeout {
            options.idle_timeout_seconds = idle_timeout;
        }
        if let Some(max_bytes) = self.max_bytes {
            options.max_bytes = max_bytes;
        }
        if let Some(storage_dir) = self.storage_dir {
            options.storage_dir = storage_dir;
        }
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "request_capture=info,capture_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = Args::parse().into_options()?;
    let server = Server::new(options).await?;

    info!(
        storage_dir = %server.options.storage_dir.display(),
        "start the socket server, Ctrl+C stops it"
    );
    server.serve_until_ctrl_c().await;
    Ok(())
}
