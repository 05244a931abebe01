//! TFTP server binary: loads configuration, applies CLI overrides, starts
//! tracing, and runs every configured listener until interrupted (§4.6, §6).

use std::path::PathBuf;

use clap::Parser;
use tftpd::config::{self, LogFormat, TftpConfig};
use tftpd::{Result, Settings};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// TFTP server for firmware distribution (RFC 1350/2347/2348/2349/7440).
#[derive(Parser, Debug)]
#[command(name = "tftpd-server", about = "TFTP server", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen endpoint, `v4[:port]`/`[v6]:port`/bare v6; repeatable.
    #[arg(long = "listen", alias = "ip")]
    listen: Vec<String>,

    /// Filesystem root served for reads and written for writes.
    #[arg(long = "root-dir")]
    root_dir: Option<PathBuf>,

    /// Additional read-side search root, tried after root-dir; repeatable.
    #[arg(long = "search")]
    search: Vec<PathBuf>,

    /// Run detached from the controlling terminal.
    #[arg(long)]
    daemon: bool,

    /// Log verbosity 0 (silent) through 7 (debug), syslog-style.
    #[arg(long = "syslog", alias = "verb")]
    verbosity: Option<u8>,

    /// Maximum retransmits before a session gives up.
    #[arg(long)]
    retransmit: Option<u32>,

    /// Owner user applied to newly written files.
    #[arg(long = "file-chuser")]
    file_chuser: Option<String>,

    /// Owner group applied to newly written files.
    #[arg(long = "file-chgrp")]
    file_chgrp: Option<String>,

    /// Octal mode applied to newly written files (masked to 0o666).
    #[arg(long = "file-chmod")]
    file_chmod: Option<String>,

    /// Validate configuration and exit without binding any socket.
    #[arg(long = "check-config")]
    check_config: bool,
}

/// syslog-style verbosity (0 silent .. 7 debug) mapped onto a `tracing`
/// filter directive, matching the source's `--syslog`/`--verb` knob.
fn verbosity_to_filter(v: u8) -> &'static str {
    match v {
        0 => "off",
        1 => "error",
        2 | 3 => "warn",
        4 | 5 => "info",
        6 => "debug",
        _ => "trace",
    }
}

fn init_tracing(config: &TftpConfig, verbosity: Option<u8>) {
    let filter = verbosity
        .map(verbosity_to_filter)
        .map(String::from)
        .unwrap_or_else(|| config.logging.level.clone());
    let env_filter = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn apply_overrides(mut config: TftpConfig, cli: &Cli) -> TftpConfig {
    if !cli.listen.is_empty() {
        config.server.listen = cli.listen.clone();
    }
    if let Some(root) = &cli.root_dir {
        config.server.root_dir = root.clone();
    }
    if !cli.search.is_empty() {
        config.server.search_dirs = cli.search.clone();
    }
    if let Some(cap) = cli.retransmit {
        config.server.retransmit_cap = cap;
    }
    if let Some(user) = &cli.file_chuser {
        config.write.chown_user = user.clone();
    }
    if let Some(group) = &cli.file_chgrp {
        config.write.chown_group = group.clone();
    }
    if let Some(mode) = &cli.file_chmod {
        if let Ok(parsed) = u32::from_str_radix(mode.trim_start_matches("0o"), 8) {
            config.write.chmod_mode = parsed;
        } else {
            eprintln!("warning: ignoring unparseable --file-chmod value '{mode}'");
        }
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match config::load_config(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("failed to load config {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => TftpConfig::default(),
    };
    config = apply_overrides(config, &cli);

    init_tracing(&config, cli.verbosity);

    if let Err(e) = config::validate_config(&config, !cli.check_config) {
        tftpd::audit::AuditLogger::configuration_error(
            cli.config.as_deref().unwrap_or_else(|| std::path::Path::new("<defaults>")),
            &e.to_string(),
        );
        eprintln!("invalid configuration: {e}");
        std::process::exit(1);
    }
    if let Some(path) = &cli.config {
        tftpd::audit::AuditLogger::configuration_loaded(path);
    }

    if cli.check_config {
        println!("configuration OK");
        return Ok(());
    }

    if cli.daemon {
        daemonize();
    }

    let settings = Settings::from_config(&config);
    let shutdown = CancellationToken::new();
    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_for_signal.cancel();
    });

    let listen_addrs = config.server.listen.clone();
    tftpd::listener::serve(settings, &listen_addrs, shutdown).await
}

/// Detaches from the controlling terminal. A real daemonization also
/// forks, closes stdio, and writes a pidfile; those steps are a
/// collaborator surface outside this crate's scope (§1 "Out of scope"),
/// so this only does the one piece that lives in-process: dropping the
/// controlling terminal's session association.
#[cfg(unix)]
fn daemonize() {
    use nix::unistd::setsid;
    if let Err(e) = setsid() {
        tracing::warn!(error = %e, "failed to detach from controlling terminal");
    }
}

#[cfg(not(unix))]
fn daemonize() {
    tracing::warn!("--daemon is only supported on unix targets");
}
