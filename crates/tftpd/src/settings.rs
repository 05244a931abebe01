//! Read-only settings view handed to every session (§3 "Settings
//! surface", §5 "Shared state"). Frozen once at listener startup and
//! shared via `Arc`, so sessions never take a lock on the hot path —
//! the source's reader/writer-locked settings pointer is collapsed to an
//! immutable value per §9's own suggested simplification.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::TftpConfig;

#[derive(Debug, Clone)]
pub struct WriteSettings {
    pub allowed_patterns: Vec<String>,
    pub chown_user: String,
    pub chown_group: String,
    pub chmod_mode: u32,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub root_dir: PathBuf,
    pub search_dirs: Vec<PathBuf>,
    pub retransmit_cap: u32,
    pub default_timeout_secs: u64,
    pub write: WriteSettings,
}

pub type SharedSettings = Arc<Settings>;

impl Settings {
    pub fn from_config(config: &TftpConfig) -> SharedSettings {
        Arc::new(Self {
            root_dir: config.server.root_dir.clone(),
            search_dirs: config.server.search_dirs.clone(),
            retransmit_cap: config.server.retransmit_cap,
            default_timeout_secs: config.server.default_timeout_secs,
            write: WriteSettings {
                allowed_patterns: config.write.allowed_patterns.clone(),
                chown_user: config.write.chown_user.clone(),
                chown_group: config.write.chown_group.clone(),
                chmod_mode: crate::config::masked_chmod_mode(config.write.chmod_mode),
            },
        })
    }

    /// Does `filename` match at least one configured write-allow glob?
    pub fn write_allowed(&self, filename: &str) -> bool {
        self.write
            .allowed_patterns
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .any(|p| p.matches(filename))
    }
}
