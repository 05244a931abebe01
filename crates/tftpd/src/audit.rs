/// Structured audit events for SIEM-style ingestion, layered on top of
/// ordinary `tracing` line logging. Each event serializes to one JSON
/// object per occurrence; `tracing::event!` carries it into whatever
/// subscriber the process configured (text or JSON formatter, file or
/// stdout) so operators get one log stream instead of two.
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::{Level, event};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        bind_addrs: Vec<String>,
        root_dir: String,
    },

    ListenerBound {
        #[serde(flatten)]
        common: CommonFields,
        bind_addr: String,
    },

    ListenerBindFailed {
        #[serde(flatten)]
        common: CommonFields,
        bind_addr: String,
        error: String,
    },

    ReadRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
        options: serde_json::Value,
    },

    ReadDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        reason: String,
    },

    WriteRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
        options: serde_json::Value,
    },

    WriteDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        reason: String,
    },

    TransferStarted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
        block_size: usize,
        window_size: u16,
    },

    TransferCompleted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        bytes_transferred: u64,
        blocks: u64,
        duration_ms: u64,
    },

    TransferFailed {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        error: String,
        blocks: u64,
    },

    PathTraversalAttempt {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        requested_path: String,
    },

    SymlinkAccessDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        requested_path: String,
    },

    IntrusionAttempt {
        #[serde(flatten)]
        common: CommonFields,
        session_peer: String,
        offending_addr: String,
    },

    Md5Resolved {
        #[serde(flatten)]
        common: CommonFields,
        digest: String,
        payload_path: String,
    },

    Md5ResolutionFailed {
        #[serde(flatten)]
        common: CommonFields,
        digest: String,
    },

    RetransmitExceeded {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        attempts: u32,
    },

    ConfigurationLoaded {
        #[serde(flatten)]
        common: CommonFields,
        config_file: String,
    },

    ConfigurationError {
        #[serde(flatten)]
        common: CommonFields,
        config_file: String,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    pub timestamp: String,
    pub hostname: String,
    pub service: String,
    pub severity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl CommonFields {
    pub fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            service: "tftpd".to_string(),
            severity: severity.to_string(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(severity: &str, correlation_id: String) -> Self {
        let mut fields = Self::new(severity);
        fields.correlation_id = Some(correlation_id);
        fields
    }
}

impl AuditEvent {
    pub fn log(&self) {
        let severity = self.common().severity.clone();
        let json = serde_json::to_string(self)
            .unwrap_or_else(|e| format!("{{\"error\":\"audit serialize failed: {e}\"}}"));

        match severity.as_str() {
            "error" => event!(Level::ERROR, audit_event = %json),
            "warn" => event!(Level::WARN, audit_event = %json),
            _ => event!(Level::INFO, audit_event = %json),
        }
    }

    fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::ListenerBound { common, .. }
            | AuditEvent::ListenerBindFailed { common, .. }
            | AuditEvent::ReadRequest { common, .. }
            | AuditEvent::ReadDenied { common, .. }
            | AuditEvent::WriteRequest { common, .. }
            | AuditEvent::WriteDenied { common, .. }
            | AuditEvent::TransferStarted { common, .. }
            | AuditEvent::TransferCompleted { common, .. }
            | AuditEvent::TransferFailed { common, .. }
            | AuditEvent::PathTraversalAttempt { common, .. }
            | AuditEvent::SymlinkAccessDenied { common, .. }
            | AuditEvent::IntrusionAttempt { common, .. }
            | AuditEvent::Md5Resolved { common, .. }
            | AuditEvent::Md5ResolutionFailed { common, .. }
            | AuditEvent::RetransmitExceeded { common, .. }
            | AuditEvent::ConfigurationLoaded { common, .. }
            | AuditEvent::ConfigurationError { common, .. } => common,
        }
    }
}

/// Static-method facade over `AuditEvent` construction, kept so call
/// sites read as one-line verbs instead of building enum variants inline.
pub struct AuditLogger;

impl AuditLogger {
    pub fn server_started(bind_addrs: &[String], root_dir: &str) {
        AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            bind_addrs: bind_addrs.to_vec(),
            root_dir: root_dir.to_string(),
        }
        .log();
    }

    pub fn listener_bound(bind_addr: &str) {
        AuditEvent::ListenerBound {
            common: CommonFields::new("info"),
            bind_addr: bind_addr.to_string(),
        }
        .log();
    }

    pub fn listener_bind_failed(bind_addr: &str, error: &str) {
        AuditEvent::ListenerBindFailed {
            common: CommonFields::new("error"),
            bind_addr: bind_addr.to_string(),
            error: error.to_string(),
        }
        .log();
    }

    pub fn generate_correlation_id(client_addr: SocketAddr, filename: &str) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        filename.hash(&mut hasher);
        let hash = hasher.finish();

        format!(
            "{:x}-{}-{:x}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis(),
            client_addr.to_string().replace(':', "-"),
            hash
        )
    }

    pub fn read_request(client_addr: SocketAddr, filename: &str, mode: &str, options: serde_json::Value) {
        AuditEvent::ReadRequest {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            mode: mode.to_string(),
            options,
        }
        .log();
    }

    pub fn read_denied(client_addr: SocketAddr, filename: &str, reason: &str) {
        AuditEvent::ReadDenied {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn write_request(client_addr: SocketAddr, filename: &str, mode: &str, options: serde_json::Value) {
        AuditEvent::WriteRequest {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            mode: mode.to_string(),
            options,
        }
        .log();
    }

    pub fn write_denied(client_addr: SocketAddr, filename: &str, reason: &str) {
        AuditEvent::WriteDenied {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn transfer_started(
        client_addr: SocketAddr,
        filename: &str,
        mode: &str,
        block_size: usize,
        window_size: u16,
    ) {
        AuditEvent::TransferStarted {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            mode: mode.to_string(),
            block_size,
            window_size,
        }
        .log();
    }

    pub fn transfer_completed(
        client_addr: SocketAddr,
        filename: &str,
        bytes_transferred: u64,
        blocks: u64,
        duration_ms: u64,
    ) {
        AuditEvent::TransferCompleted {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            bytes_transferred,
            blocks,
            duration_ms,
        }
        .log();
    }

    pub fn transfer_failed(client_addr: SocketAddr, filename: &str, error: &str, blocks: u64) {
        AuditEvent::TransferFailed {
            common: CommonFields::new("error"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            error: error.to_string(),
            blocks,
        }
        .log();
    }

    pub fn path_traversal_attempt(client_addr: SocketAddr, requested_path: &str) {
        AuditEvent::PathTraversalAttempt {
            common: CommonFields::new("error"),
            client_addr: client_addr.to_string(),
            requested_path: requested_path.to_string(),
        }
        .log();
    }

    pub fn symlink_access_denied(client_addr: SocketAddr, requested_path: &str) {
        AuditEvent::SymlinkAccessDenied {
            common: CommonFields::new("error"),
            client_addr: client_addr.to_string(),
            requested_path: requested_path.to_string(),
        }
        .log();
    }

    pub fn intrusion_attempt(session_peer: SocketAddr, offending_addr: SocketAddr) {
        AuditEvent::IntrusionAttempt {
            common: CommonFields::new("warn"),
            session_peer: session_peer.to_string(),
            offending_addr: offending_addr.to_string(),
        }
        .log();
    }

    pub fn md5_resolved(digest: &str, payload_path: &str) {
        AuditEvent::Md5Resolved {
            common: CommonFields::new("info"),
            digest: digest.to_string(),
            payload_path: payload_path.to_string(),
        }
        .log();
    }

    pub fn md5_resolution_failed(digest: &str) {
        AuditEvent::Md5ResolutionFailed {
            common: CommonFields::new("warn"),
            digest: digest.to_string(),
        }
        .log();
    }

    pub fn retransmit_exceeded(client_addr: SocketAddr, filename: &str, attempts: u32) {
        AuditEvent::RetransmitExceeded {
            common: CommonFields::new("error"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            attempts,
        }
        .log();
    }

    pub fn configuration_loaded(config_file: &Path) {
        AuditEvent::ConfigurationLoaded {
            common: CommonFields::new("info"),
            config_file: config_file.display().to_string(),
        }
        .log();
    }

    pub fn configuration_error(config_file: &Path, error: &str) {
        AuditEvent::ConfigurationError {
            common: CommonFields::new("error"),
            config_file: config_file.display().to_string(),
            error: error.to_string(),
        }
        .log();
    }
}
