use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_heatmap::core::{BroadcastConfig, PushCadence};
use lib_heatmap::ingestors::{HttpPollConfig, WsFeedConfig};
use lib_heatmap::loggers::LogSettings;

const DEFAULT_CONFIG_FILE: &str = "server_heatmap.conf";

/// Raw configuration as it comes from one source. Every field is optional so
/// sources can be layered with [`Config::merge`].
#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[command(about = "Heating-network map state aggregation server", version)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    #[arg(long, env = "HEATMAP_PORT", help = "Port to listen on for map clients.")]
    pub port: Option<u16>,

    #[arg(long, env = "HEATMAP_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "HEATMAP_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "HEATMAP_LOG_LEVEL", help = "Log filter (trace, debug, info, warn, error). RUST_LOG wins when set.")]
    pub log_level: Option<String>,

    #[arg(long, env = "HEATMAP_LOG_JSON", help = "Emit JSON lines on the console.")]
    pub log_json: Option<bool>,

    #[arg(long, env = "HEATMAP_LOG_KEEP_FILES", help = "Number of log files kept at startup.")]
    pub log_keep_files: Option<usize>,

    #[arg(long, env = "HEATMAP_CONTRACTS_PATH", help = "Path to the JSON contract book.")]
    pub contracts_path: Option<PathBuf>,

    #[arg(long, env = "HEATMAP_WS_FEEDS", value_delimiter = ',', help = "Upstream WebSocket feed URLs (comma separated).")]
    pub ws_feeds: Option<Vec<String>>,

    #[arg(long, env = "HEATMAP_POLL_FEEDS", value_delimiter = ',', help = "Upstream HTTP poll feed URLs (comma separated).")]
    pub poll_feeds: Option<Vec<String>>,

    #[arg(long, env = "HEATMAP_PUSH_CADENCE", help = "Snapshot push cadence: 'coalesce' or 'on-change'.")]
    pub push_cadence: Option<String>,

    #[arg(long, env = "HEATMAP_COALESCE_MS", help = "Coalescing window in milliseconds.")]
    pub coalesce_ms: Option<u64>,

    #[arg(long, env = "HEATMAP_BACKLOG_LIMIT", help = "Frames a subscriber may have queued before it is dropped.")]
    pub backlog_limit: Option<usize>,

    #[arg(long, env = "HEATMAP_WRITE_TIMEOUT_MS", help = "Timeout in milliseconds for one write to a map client.")]
    pub write_timeout_ms: Option<u64>,

    #[arg(long, env = "HEATMAP_STALE_AFTER_SECONDS", help = "Age after which a device is flagged stale (0 disables).")]
    pub stale_after_seconds: Option<u64>,

    #[arg(long, env = "HEATMAP_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for upstream reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[arg(long, env = "HEATMAP_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for upstream reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[arg(long, env = "HEATMAP_SILENT_FAILURE_TIMEOUT_SECONDS", help = "Seconds without frames before an upstream socket is considered dead.")]
    pub silent_failure_timeout_seconds: Option<u64>,

    #[arg(long, env = "HEATMAP_POLL_INTERVAL_SECONDS", help = "Interval in seconds between HTTP feed polls.")]
    pub poll_interval_seconds: Option<u64>,

    #[arg(long, env = "HEATMAP_DATAFLOW_CHECK_INTERVAL_SECONDS", help = "Interval in seconds between monitor checks.")]
    pub dataflow_check_interval_seconds: Option<u64>,

    #[arg(long, env = "HEATMAP_DATAFLOW_INACTIVITY_THRESHOLD_SECONDS", help = "Seconds without an applied reading before warning.")]
    pub dataflow_inactivity_threshold_seconds: Option<u64>,
}

impl Config {
    /// Built-in defaults, the lowest layer.
    pub fn defaults() -> Self {
        Config {
            port: Some(8050),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            log_json: Some(false),
            log_keep_files: Some(7),
            ws_feeds: Some(Vec::new()),
            poll_feeds: Some(Vec::new()),
            push_cadence: Some("coalesce".to_string()),
            coalesce_ms: Some(250),
            backlog_limit: Some(16),
            write_timeout_ms: Some(5000),
            stale_after_seconds: Some(900),
            reconnect_base_delay_ms: Some(1000),
            reconnect_max_delay_ms: Some(60000),
            silent_failure_timeout_seconds: Some(30),
            poll_interval_seconds: Some(10),
            dataflow_check_interval_seconds: Some(10),
            dataflow_inactivity_threshold_seconds: Some(120),
            ..Default::default()
        }
    }

    // Merge two Config structs, where 'other' overrides 'self' for Some values
    pub fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_json: other.log_json.or(self.log_json),
            log_keep_files: other.log_keep_files.or(self.log_keep_files),
            contracts_path: other.contracts_path.or(self.contracts_path),
            ws_feeds: other.ws_feeds.or(self.ws_feeds),
            poll_feeds: other.poll_feeds.or(self.poll_feeds),
            push_cadence: other.push_cadence.or(self.push_cadence),
            coalesce_ms: other.coalesce_ms.or(self.coalesce_ms),
            backlog_limit: other.backlog_limit.or(self.backlog_limit),
            write_timeout_ms: other.write_timeout_ms.or(self.write_timeout_ms),
            stale_after_seconds: other.stale_after_seconds.or(self.stale_after_seconds),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            silent_failure_timeout_seconds: other.silent_failure_timeout_seconds.or(self.silent_failure_timeout_seconds),
            poll_interval_seconds: other.poll_interval_seconds.or(self.poll_interval_seconds),
            dataflow_check_interval_seconds: other.dataflow_check_interval_seconds.or(self.dataflow_check_interval_seconds),
            dataflow_inactivity_threshold_seconds: other
                .dataflow_inactivity_threshold_seconds
                .or(self.dataflow_inactivity_threshold_seconds),
        }
    }

    /// Reads a JSON config file. A missing file is not an error.
    pub fn from_file(path: &Path) -> Result<Option<Config>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = serde_json::from_str::<Config>(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(Some(config))
    }

    /// Turns the merged layers into concrete settings.
    pub fn resolve(self) -> Result<Settings> {
        let merged = Config::defaults().merge(self);

        let cadence = match merged.push_cadence.as_deref().unwrap_or("coalesce") {
            "coalesce" => PushCadence::Coalesce(Duration::from_millis(merged.coalesce_ms.unwrap_or(250).max(1))),
            "on-change" | "on_change" | "onchange" => PushCadence::OnChange,
            other => bail!("unknown push cadence '{}'", other),
        };

        let reconnect_base = Duration::from_millis(merged.reconnect_base_delay_ms.unwrap_or(1000));
        let reconnect_max = Duration::from_millis(merged.reconnect_max_delay_ms.unwrap_or(60000));
        if reconnect_max < reconnect_base {
            bail!("reconnect max delay must not be below the base delay");
        }

        let backlog_limit = merged.backlog_limit.unwrap_or(16);
        if backlog_limit == 0 {
            bail!("backlog limit must be at least 1");
        }

        Ok(Settings {
            port: merged.port.unwrap_or(8050),
            log_dir: merged.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: merged.log_level.unwrap_or_else(|| "info".to_string()),
            log_json: merged.log_json.unwrap_or(false),
            log_keep_files: merged.log_keep_files.unwrap_or(7),
            contracts_path: merged.contracts_path,
            ws_feeds: merged.ws_feeds.unwrap_or_default(),
            poll_feeds: merged.poll_feeds.unwrap_or_default(),
            cadence,
            backlog_limit,
            write_timeout: Duration::from_millis(merged.write_timeout_ms.unwrap_or(5000)),
            stale_after: match merged.stale_after_seconds.unwrap_or(900) {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            reconnect_base,
            reconnect_max,
            silent_failure_timeout: Duration::from_secs(merged.silent_failure_timeout_seconds.unwrap_or(30)),
            poll_interval: Duration::from_secs(merged.poll_interval_seconds.unwrap_or(10).max(1)),
            monitor_interval: Duration::from_secs(merged.dataflow_check_interval_seconds.unwrap_or(10).max(1)),
            inactivity_threshold: Duration::from_secs(merged.dataflow_inactivity_threshold_seconds.unwrap_or(120)),
        })
    }
}

/// Fully resolved server settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub log_json: bool,
    pub log_keep_files: usize,
    pub contracts_path: Option<PathBuf>,
    pub ws_feeds: Vec<String>,
    pub poll_feeds: Vec<String>,
    pub cadence: PushCadence,
    pub backlog_limit: usize,
    pub write_timeout: Duration,
    pub stale_after: Option<Duration>,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub silent_failure_timeout: Duration,
    pub poll_interval: Duration,
    pub monitor_interval: Duration,
    pub inactivity_threshold: Duration,
}

impl Settings {
    pub fn log_settings(&self) -> LogSettings {
        LogSettings {
            dir: self.log_dir.clone(),
            file_prefix: "server_heatmap".to_string(),
            level: self.log_level.clone(),
            json_console: self.log_json,
            keep_files: self.log_keep_files,
        }
    }

    pub fn broadcast_config(&self) -> BroadcastConfig {
        BroadcastConfig {
            cadence: self.cadence,
            backlog_limit: self.backlog_limit,
            stale_after: self.stale_after,
        }
    }

    pub fn ws_feed_configs(&self) -> Vec<WsFeedConfig> {
        self.ws_feeds
            .iter()
            .enumerate()
            .map(|(i, url)| WsFeedConfig {
                name: format!("ws-{}", i),
                url: url.clone(),
                reconnect_base: self.reconnect_base,
                reconnect_max: self.reconnect_max,
                silent_failure_timeout: self.silent_failure_timeout,
            })
            .collect()
    }

    pub fn poll_feed_configs(&self) -> Vec<HttpPollConfig> {
        self.poll_feeds
            .iter()
            .enumerate()
            .map(|(i, url)| {
                let mut config = HttpPollConfig::new(format!("poll-{}", i), url.clone());
                config.interval = self.poll_interval;
                config
            })
            .collect()
    }
}

/// Layers defaults, the config file and CLI/env, in rising precedence.
pub fn load_config() -> Result<Settings> {
    let cli = Config::parse();
    layer(cli)
}

fn layer(cli: Config) -> Result<Settings> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let file_config = Config::from_file(&config_file_path)?.unwrap_or_default();
    file_config.merge(cli).resolve()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_resolve() {
        let settings = Config::default().resolve().unwrap();
        assert_eq!(settings.port, 8050);
        assert_eq!(settings.cadence, PushCadence::Coalesce(Duration::from_millis(250)));
        assert_eq!(settings.backlog_limit, 16);
        assert_eq!(settings.write_timeout, Duration::from_secs(5));
        assert_eq!(settings.stale_after, Some(Duration::from_secs(900)));
        assert_eq!(settings.inactivity_threshold, Duration::from_secs(120));
        assert!(settings.ws_feeds.is_empty());
    }

    #[test]
    fn test_cli_overrides_file_overrides_defaults() {
        // 1. File sets port and cadence
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"port": 9100, "pushCadence": "on-change", "wsFeeds": ["ws://feed.local/a"], "staleAfterSeconds": 0}}"#
        )
        .unwrap();

        // 2. CLI overrides the port only
        let cli = Config::try_parse_from([
            "server_heatmap",
            "--config-path",
            file.path().to_str().unwrap(),
            "--port",
            "9200",
        ])
        .unwrap();

        let settings = layer(cli).unwrap();
        assert_eq!(settings.port, 9200);
        assert_eq!(settings.cadence, PushCadence::OnChange);
        assert_eq!(settings.ws_feeds, vec!["ws://feed.local/a".to_string()]);
        assert_eq!(settings.stale_after, None);
    }

    #[test]
    fn test_feed_lists_split_on_comma() {
        let cli = Config::try_parse_from([
            "server_heatmap",
            "--config-path",
            "/nonexistent/server_heatmap.conf",
            "--poll-feeds",
            "http://a/devices,http://b/devices",
        ])
        .unwrap();
        let settings = layer(cli).unwrap();
        let polls = settings.poll_feed_configs();
        assert_eq!(polls.len(), 2);
        assert_eq!(polls[1].name, "poll-1");
        assert_eq!(polls[1].interval, Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_cadence = Config { push_cadence: Some("hourly".to_string()), ..Default::default() };
        assert!(bad_cadence.resolve().is_err());

        let bad_backoff = Config {
            reconnect_base_delay_ms: Some(5000),
            reconnect_max_delay_ms: Some(10),
            ..Default::default()
        };
        assert!(bad_backoff.resolve().is_err());
    }

    #[test]
    fn test_unparsable_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not json").unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }
}
