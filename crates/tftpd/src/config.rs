use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Result, TftpError};

/// Write-path policy: which leaf names may be created and what ownership
/// a newly written file receives once the transfer completes (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    /// Glob patterns a WRQ filename must match against to be accepted.
    /// Empty means no writes are allowed.
    pub allowed_patterns: Vec<String>,

    /// User name applied via chown on close; empty leaves ownership alone.
    pub chown_user: String,

    /// Group name applied via chown on close; empty leaves group alone.
    pub chown_group: String,

    /// Octal mode applied via chmod on close; always masked to 0o666
    /// (read/write bits only, execute and setuid never honored).
    pub chmod_mode: u32,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            allowed_patterns: vec!["*".to_string()],
            chown_user: String::new(),
            chown_group: String::new(),
            chmod_mode: 0o644,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen endpoints; one listener task per address (§4.6).
    pub listen: Vec<String>,
    pub root_dir: PathBuf,
    /// Additional read-side search roots, tried in order after root_dir.
    pub search_dirs: Vec<PathBuf>,
    pub retransmit_cap: u32,
    pub default_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: vec!["0.0.0.0:69".to_string()],
            root_dir: PathBuf::from("/var/lib/tftpd"),
            search_dirs: Vec::new(),
            retransmit_cap: 5,
            default_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TftpConfig {
    pub server: ServerConfig,
    pub write: WriteConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

pub fn load_config(path: &std::path::Path) -> Result<TftpConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TftpConfig = toml::from_str(&contents)
        .map_err(|e| TftpError::Tftp(format!("Invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_default_config(path: &std::path::Path) -> Result<()> {
    write_config(path, &TftpConfig::default())
}

pub fn write_config(path: &std::path::Path, config: &TftpConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Tftp(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Validate a loaded configuration before the listeners start. `validate_bind`
/// additionally probes that every listen address is actually bindable right
/// now; callers doing a config dry-run (`--check-config`) pass `false`.
pub fn validate_config(config: &TftpConfig, validate_bind: bool) -> Result<()> {
    if !config.server.root_dir.is_absolute() {
        return Err(TftpError::Tftp(
            "server.root_dir must be an absolute path".to_string(),
        ));
    }

    match std::fs::metadata(&config.server.root_dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(TftpError::Tftp(
                    "server.root_dir must be a directory".to_string(),
                ));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TftpError::Tftp(
                "server.root_dir does not exist; create it or adjust config".to_string(),
            ));
        }
        Err(e) => return Err(TftpError::Io(e)),
    }

    for dir in &config.server.search_dirs {
        match std::fs::metadata(dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(TftpError::Tftp(format!(
                    "search dir {} is not a directory",
                    dir.display()
                )));
            }
            Err(e) => {
                return Err(TftpError::Tftp(format!(
                    "search dir {} is not accessible: {}",
                    dir.display(),
                    e
                )));
            }
        }
    }

    if config.server.listen.is_empty() {
        return Err(TftpError::Tftp(
            "server.listen must name at least one address".to_string(),
        ));
    }

    if config.server.retransmit_cap < 1 {
        return Err(TftpError::Tftp(
            "server.retransmit_cap must be at least 1".to_string(),
        ));
    }

    if validate_bind {
        for addr in &config.server.listen {
            let endpoint = crate::address::parse_endpoint(addr)?;
            if let Err(e) = std::net::UdpSocket::bind(endpoint) {
                return Err(TftpError::Tftp(format!(
                    "listen address {addr} is not available: {e}"
                )));
            }
        }
    }

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            TftpError::Tftp("logging.file must include a parent directory".to_string())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(TftpError::Tftp(
                        "logging.file parent must be a directory".to_string(),
                    ));
                }
            }
            Err(e) => return Err(TftpError::Tftp(format!("logging.file parent error: {}", e))),
        }
    }

    validate_write_config(&config.write)?;
    Ok(())
}

pub fn validate_write_config(config: &WriteConfig) -> Result<()> {
    for pattern in &config.allowed_patterns {
        if pattern.trim().is_empty() {
            return Err(TftpError::Tftp(
                "write.allowed_patterns cannot contain empty patterns".to_string(),
            ));
        }
        glob::Pattern::new(pattern)
            .map_err(|e| TftpError::Tftp(format!("invalid write pattern '{pattern}': {e}")))?;
    }
    Ok(())
}

/// chmod_mode is never rejected by validation; it is masked to the
/// read/write bits the write path is allowed to set (§4.3, §9 supplement G).
pub fn masked_chmod_mode(requested: u32) -> u32 {
    requested & 0o666
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> std::io::Result<PathBuf> {
        let mut dir = std::env::temp_dir();
        dir.push(format!("tftpd_test_{}_{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    #[test]
    fn parses_minimal_toml() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let root_dir = temp_dir("parse")?;
        let toml = format!(
            r#"
[server]
listen = ["127.0.0.1:6969"]
root_dir = "{}"
"#,
            root_dir.display()
        );
        let config: TftpConfig = toml::from_str(&toml)?;
        validate_config(&config, false)?;
        Ok(())
    }

    #[test]
    fn rejects_non_absolute_root_dir() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.server.root_dir = PathBuf::from("relative/path");
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for relative root_dir".into()),
            Err(err) => assert!(format!("{err}").contains("must be an absolute path")),
        }
        Ok(())
    }

    #[test]
    fn rejects_missing_root_dir() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.server.root_dir = PathBuf::from("/nonexistent/tftpd-root");
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for missing root_dir".into()),
            Err(err) => assert!(format!("{err}").contains("does not exist")),
        }
        Ok(())
    }

    #[test]
    fn rejects_empty_listen_list() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.server.root_dir = temp_dir("listen")?;
        config.server.listen = vec![];
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for empty listen list".into()),
            Err(err) => assert!(format!("{err}").contains("at least one address")),
        }
        Ok(())
    }

    #[test]
    fn rejects_zero_retransmit_cap() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.server.root_dir = temp_dir("retransmit")?;
        config.server.retransmit_cap = 0;
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for zero retransmit cap".into()),
            Err(err) => assert!(format!("{err}").contains("retransmit_cap must be at least 1")),
        }
        Ok(())
    }

    #[test]
    fn rejects_empty_write_pattern() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.server.root_dir = temp_dir("empty-pattern")?;
        config.write.allowed_patterns = vec!["".to_string()];
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for empty pattern".into()),
            Err(err) => assert!(format!("{err}").contains("cannot contain empty patterns")),
        }
        Ok(())
    }

    #[test]
    fn validates_bind_addr_availability_on_free_port()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
        let port = socket.local_addr()?.port();
        drop(socket);

        let mut config = TftpConfig::default();
        config.server.root_dir = temp_dir("bind-available")?;
        config.server.listen = vec![format!("127.0.0.1:{port}")];
        validate_config(&config, true)?;
        Ok(())
    }

    #[test]
    fn rejects_bind_addr_when_in_use() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
        let port = socket.local_addr()?.port();

        let mut config = TftpConfig::default();
        config.server.root_dir = temp_dir("bind-in-use")?;
        config.server.listen = vec![format!("127.0.0.1:{port}")];
        match validate_config(&config, true) {
            Ok(()) => return Err("expected error for bind_addr in use".into()),
            Err(err) => assert!(format!("{err}").contains("is not available")),
        }
        Ok(())
    }

    #[test]
    fn masks_chmod_to_read_write_bits() {
        assert_eq!(masked_chmod_mode(0o7777), 0o666);
        assert_eq!(masked_chmod_mode(0o644), 0o644);
        assert_eq!(masked_chmod_mode(0o100644), 0o644);
    }
}
