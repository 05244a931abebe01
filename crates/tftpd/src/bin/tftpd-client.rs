//! TFTP client binary (§4.7): a single get/put against a server, driving
//! the same session engine the server uses with roles mirrored.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tftpd::address;
use tftpd::client::{self, RequestOptions};
use tftpd::Result;
use tracing_subscriber::EnvFilter;

/// TFTP client for firmware distribution (RFC 1350/2347/2348/2349/7440).
#[derive(Parser, Debug)]
#[command(name = "tftpd-client", about = "TFTP client", long_about = None)]
struct Cli {
    /// Server endpoint, `v4[:port]`/`[v6]:port`/bare v6 (port defaults to 69).
    server: String,

    /// Download `remote` from the server (mutually exclusive with --put).
    #[arg(short, long, conflicts_with = "put")]
    get: Option<String>,

    /// Upload `local` to the server (mutually exclusive with --get).
    #[arg(short, long, conflicts_with = "get")]
    put: Option<PathBuf>,

    /// Local path for --get's destination or the remote name for --put;
    /// defaults to the basename of the other side's argument.
    #[arg(short, long)]
    file: Option<String>,

    /// blksize option to offer (RFC 2348); omit to use the server default.
    #[arg(long)]
    blksize: Option<u16>,

    /// windowsize option to offer (RFC 7440); omit for stop-and-wait.
    #[arg(long)]
    windowsize: Option<u16>,

    /// Offer tsize (RFC 2349) so the server learns the expected size.
    #[arg(long)]
    tsize: bool,

    /// Per-packet timeout in seconds before a retransmit.
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Retransmit attempts before giving up.
    #[arg(long, default_value_t = 5)]
    retransmit: u32,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    let server = address::parse_endpoint(&cli.server)?;
    let options = RequestOptions {
        blksize: cli.blksize,
        timeout: None,
        request_tsize: cli.tsize,
        windowsize: cli.windowsize,
    };
    let timeout = Duration::from_secs(cli.timeout);

    if let Some(remote) = &cli.get {
        let local = cli
            .file
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(remote));
        tracing::info!(%server, remote, local = %local.display(), "starting download");
        let stats = client::get(server, remote, &local, &options, timeout, cli.retransmit).await?;
        tracing::info!(bytes = stats.bytes, blocks = stats.blocks, "download complete");
    } else if let Some(local) = &cli.put {
        let remote = cli.file.clone().unwrap_or_else(|| {
            local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| local.display().to_string())
        });
        tracing::info!(%server, local = %local.display(), remote, "starting upload");
        let stats = client::put(server, local, &remote, &options, timeout, cli.retransmit).await?;
        tracing::info!(bytes = stats.bytes, blocks = stats.blocks, "upload complete");
    } else {
        eprintln!("must specify either --get <remote> or --put <local>");
        std::process::exit(2);
    }

    Ok(())
}
