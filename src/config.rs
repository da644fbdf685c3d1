//! Daemon configuration: CLI/env > `{data_dir}/config.toml` > built-in
//! default, matching `clawd::config::DaemonConfig`'s priority order.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 8787;
const DEFAULT_HISTORY_MAX_ENTRIES: usize = 100;
const DEFAULT_SYNC_ANOMALY_THRESHOLD: u32 = 5;
const DEFAULT_IDLE_EMPTY_GRACE_SECS: u64 = 60;
const DEFAULT_IDLE_ACTIVE_GRACE_SECS: u64 = 300;
const DEFAULT_TERMINATED_GRACE_SECS: u64 = 15;
const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;
const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024;
const DEFAULT_MAX_OPERATION_BYTES: usize = 50 * 1024;
const DEFAULT_DRAIN_INTERVAL_MS: u64 = 100;
const DEFAULT_READ_DEADLINE_SECS: u64 = 60;
const DEFAULT_WRITE_DEADLINE_SECS: u64 = 10;
const DEFAULT_PING_INTERVAL_SECS: u64 = 30;

/// `{data_dir}/config.toml` — every field is an optional override.
#[derive(Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    log: Option<String>,
    dev_mode: Option<bool>,
    tls_subject: Option<String>,
    history_max_entries: Option<usize>,
    sync_anomaly_threshold: Option<u32>,
    idle_empty_grace_secs: Option<u64>,
    idle_active_grace_secs: Option<u64>,
    terminated_grace_secs: Option<u64>,
    send_queue_capacity: Option<usize>,
    max_frame_bytes: Option<usize>,
    max_operation_bytes: Option<usize>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

/// Resolved daemon configuration, shared read-only across the hub,
/// sessions, and the HTTP/WS server via [`std::sync::Arc`].
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// Disables the Origin header check on WebSocket upgrade (spec §5).
    pub dev_mode: bool,
    /// Origin host this process is willing to accept besides the request's
    /// own Host header and localhost/127.0.0.1.
    pub tls_subject: Option<String>,
    pub history_max_entries: usize,
    pub sync_anomaly_threshold: u32,
    pub idle_empty_grace: std::time::Duration,
    pub idle_active_grace: std::time::Duration,
    pub terminated_grace: std::time::Duration,
    pub send_queue_capacity: usize,
    pub max_frame_bytes: usize,
    pub max_operation_bytes: usize,
    pub drain_interval: std::time::Duration,
    pub read_deadline: std::time::Duration,
    pub write_deadline: std::time::Duration,
    pub ping_interval: std::time::Duration,
}

impl HubConfig {
    pub fn new(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>, dev_mode: bool) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let dev_mode = dev_mode || toml.dev_mode.unwrap_or(false);

        Self {
            port,
            data_dir,
            log,
            dev_mode,
            tls_subject: toml.tls_subject,
            history_max_entries: toml.history_max_entries.unwrap_or(DEFAULT_HISTORY_MAX_ENTRIES),
            sync_anomaly_threshold: toml
                .sync_anomaly_threshold
                .unwrap_or(DEFAULT_SYNC_ANOMALY_THRESHOLD),
            idle_empty_grace: std::time::Duration::from_secs(
                toml.idle_empty_grace_secs.unwrap_or(DEFAULT_IDLE_EMPTY_GRACE_SECS),
            ),
            idle_active_grace: std::time::Duration::from_secs(
                toml.idle_active_grace_secs.unwrap_or(DEFAULT_IDLE_ACTIVE_GRACE_SECS),
            ),
            terminated_grace: std::time::Duration::from_secs(
                toml.terminated_grace_secs.unwrap_or(DEFAULT_TERMINATED_GRACE_SECS),
            ),
            send_queue_capacity: toml.send_queue_capacity.unwrap_or(DEFAULT_SEND_QUEUE_CAPACITY),
            max_frame_bytes: toml.max_frame_bytes.unwrap_or(DEFAULT_MAX_FRAME_BYTES),
            max_operation_bytes: toml.max_operation_bytes.unwrap_or(DEFAULT_MAX_OPERATION_BYTES),
            drain_interval: std::time::Duration::from_millis(DEFAULT_DRAIN_INTERVAL_MS),
            read_deadline: std::time::Duration::from_secs(DEFAULT_READ_DEADLINE_SECS),
            write_deadline: std::time::Duration::from_secs(DEFAULT_WRITE_DEADLINE_SECS),
            ping_interval: std::time::Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
        }
    }
}

fn default_data_dir() -> PathBuf {
    directories_data_dir().unwrap_or_else(|| PathBuf::from(".diagramd"))
}

/// Best-effort `~/.local/share/diagramd`-style path without pulling in a
/// directories crate the rest of the ambient stack has no other use for.
fn directories_data_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".diagramd"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_overridden() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = HubConfig::new(None, Some(dir.path().to_path_buf()), None, false);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.history_max_entries, DEFAULT_HISTORY_MAX_ENTRIES);
        assert!(!cfg.dev_mode);
    }

    #[test]
    fn cli_port_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = HubConfig::new(Some(9999), Some(dir.path().to_path_buf()), None, false);
        assert_eq!(cfg.port, 9999);
    }

    #[test]
    fn toml_file_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "port = 7000\ndev_mode = true\n").unwrap();
        let cfg = HubConfig::new(None, Some(dir.path().to_path_buf()), None, false);
        assert_eq!(cfg.port, 7000);
        assert!(cfg.dev_mode);
    }

    #[test]
    fn cli_wins_over_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "port = 7000\n").unwrap();
        let cfg = HubConfig::new(Some(1234), Some(dir.path().to_path_buf()), None, false);
        assert_eq!(cfg.port, 1234);
    }
}
