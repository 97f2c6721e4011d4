// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Invalid numeric values fall back to their defaults; only an
// unreadable rate-limit file is fatal.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::rate_limit::RateTable;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MEMORY_CEILING_MB: u64 = 512;
const DEFAULT_MAX_USERS: usize = 50;
const DEFAULT_MAX_SNAPSHOT_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_MAX_STROKE_POINTS: usize = 1_000;
const DEFAULT_MAX_POINT_MOVEMENT: f64 = 0.2;
const DEFAULT_BACKUP_RETENTION: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read rate limit file `{path}`: {source}")]
    RateFileIo { path: PathBuf, source: std::io::Error },
    #[error("failed to parse rate limit file `{path}`: {source}")]
    RateFileParse { path: PathBuf, source: toml::de::Error },
}

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Log filter directive (e.g. `info`, `canvasync_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Root for canvas files and backups.
    pub data_dir: PathBuf,
    pub memory_ceiling_bytes: u64,
    pub memory_sample_interval: Duration,
    /// Maximum identified members in the session.
    pub max_users: usize,
    /// Members idle for longer than this are removed.
    pub session_timeout: Duration,
    pub max_snapshot_bytes: usize,
    pub max_stroke_points: usize,
    /// Largest normalized distance allowed between consecutive points.
    pub max_point_movement: f64,
    pub backup_retention: usize,
    pub backup_interval: Duration,
    /// Cadence of idle-session and rate-bucket sweeps.
    pub cleanup_interval: Duration,
    /// Quiescence window before a dirty canvas is flushed.
    pub flush_debounce: Duration,
    /// Hard ceiling on the shutdown drain.
    pub shutdown_timeout: Duration,
    pub blocked_users: Vec<String>,
    pub rate_limits_file: Option<PathBuf>,
    /// Allowed origins for the introspection endpoints (`*` or a comma list).
    pub cors_origins: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CANVASYNC_HOST` | `0.0.0.0` |
    /// | `CANVASYNC_PORT` | `3000` |
    /// | `CANVASYNC_LOG_FILTER` | `info` |
    /// | `CANVASYNC_LOG_FORMAT` | `text` |
    /// | `CANVASYNC_DATA_DIR` | `./data` |
    /// | `CANVASYNC_MEMORY_CEILING_MB` | `512` |
    /// | `CANVASYNC_MEMORY_SAMPLE_SECS` | `30` |
    /// | `CANVASYNC_MAX_USERS` | `50` |
    /// | `CANVASYNC_SESSION_TIMEOUT_SECS` | `1800` |
    /// | `CANVASYNC_MAX_SNAPSHOT_BYTES` | `10485760` |
    /// | `CANVASYNC_MAX_STROKE_POINTS` | `1000` |
    /// | `CANVASYNC_MAX_POINT_MOVEMENT` | `0.2` |
    /// | `CANVASYNC_BACKUP_RETENTION` | `10` |
    /// | `CANVASYNC_BACKUP_INTERVAL_SECS` | `3600` |
    /// | `CANVASYNC_CLEANUP_INTERVAL_SECS` | `300` |
    /// | `CANVASYNC_FLUSH_DEBOUNCE_MS` | `2000` |
    /// | `CANVASYNC_SHUTDOWN_TIMEOUT_SECS` | `10` |
    /// | `CANVASYNC_BLOCKED_USERS` | *(none)* |
    /// | `CANVASYNC_RATE_LIMITS_FILE` | *(none)* |
    /// | `CANVASYNC_CORS_ORIGINS` | *(local dev origins)* |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let parsed = |key: &str| env(key).ok().map(|value| value.trim().to_string());

        let host = parsed("CANVASYNC_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 =
            parsed("CANVASYNC_PORT").and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let log_filter = parsed("CANVASYNC_LOG_FILTER").unwrap_or_else(|| "info".into());
        let log_format = match parsed("CANVASYNC_LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let data_dir = parsed("CANVASYNC_DATA_DIR")
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));

        let number = |key: &str, default: u64| -> u64 {
            parsed(key).and_then(|v| v.parse::<u64>().ok()).unwrap_or(default)
        };
        let positive = |key: &str, default: u64| -> u64 {
            match number(key, default) {
                0 => default,
                value => value,
            }
        };

        let max_point_movement = parsed("CANVASYNC_MAX_POINT_MOVEMENT")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(DEFAULT_MAX_POINT_MOVEMENT);

        let blocked_users = parsed("CANVASYNC_BLOCKED_USERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let rate_limits_file = parsed("CANVASYNC_RATE_LIMITS_FILE")
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        let cors_origins = parsed("CANVASYNC_CORS_ORIGINS").filter(|value| !value.is_empty());

        Self {
            listen_addr,
            log_filter,
            log_format,
            data_dir,
            memory_ceiling_bytes: positive("CANVASYNC_MEMORY_CEILING_MB", DEFAULT_MEMORY_CEILING_MB)
                .saturating_mul(1024 * 1024),
            memory_sample_interval: Duration::from_secs(positive("CANVASYNC_MEMORY_SAMPLE_SECS", 30)),
            max_users: positive("CANVASYNC_MAX_USERS", DEFAULT_MAX_USERS as u64) as usize,
            session_timeout: Duration::from_secs(positive("CANVASYNC_SESSION_TIMEOUT_SECS", 1_800)),
            max_snapshot_bytes: positive(
                "CANVASYNC_MAX_SNAPSHOT_BYTES",
                DEFAULT_MAX_SNAPSHOT_BYTES as u64,
            ) as usize,
            max_stroke_points: positive(
                "CANVASYNC_MAX_STROKE_POINTS",
                DEFAULT_MAX_STROKE_POINTS as u64,
            ) as usize,
            max_point_movement,
            backup_retention: positive("CANVASYNC_BACKUP_RETENTION", DEFAULT_BACKUP_RETENTION as u64)
                as usize,
            backup_interval: Duration::from_secs(positive("CANVASYNC_BACKUP_INTERVAL_SECS", 3_600)),
            cleanup_interval: Duration::from_secs(positive("CANVASYNC_CLEANUP_INTERVAL_SECS", 300)),
            flush_debounce: Duration::from_millis(number("CANVASYNC_FLUSH_DEBOUNCE_MS", 2_000)),
            shutdown_timeout: Duration::from_secs(positive("CANVASYNC_SHUTDOWN_TIMEOUT_SECS", 10)),
            blocked_users,
            rate_limits_file,
            cors_origins,
        }
    }

    /// Load the rate table, reading the override file when configured.
    pub fn rate_table(&self) -> Result<RateTable, ConfigError> {
        let Some(path) = &self.rate_limits_file else {
            return Ok(RateTable::default());
        };
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::RateFileIo { path: path.clone(), source })?;
        RateTable::from_toml_str(&raw)
            .map_err(|source| ConfigError::RateFileParse { path: path.clone(), source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 3000);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.memory_ceiling_bytes, 512 * 1024 * 1024);
        assert_eq!(cfg.max_users, 50);
        assert_eq!(cfg.session_timeout, Duration::from_secs(1_800));
        assert_eq!(cfg.max_stroke_points, 1_000);
        assert!((cfg.max_point_movement - 0.2).abs() < f64::EPSILON);
        assert_eq!(cfg.backup_retention, 10);
        assert_eq!(cfg.flush_debounce, Duration::from_millis(2_000));
        assert!(cfg.blocked_users.is_empty());
        assert!(cfg.rate_limits_file.is_none());
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("CANVASYNC_HOST", "127.0.0.1");
        m.insert("CANVASYNC_PORT", "8088");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:8088");
    }

    #[test]
    fn invalid_numbers_use_defaults() {
        let mut m = HashMap::new();
        m.insert("CANVASYNC_PORT", "not_a_number");
        m.insert("CANVASYNC_MAX_USERS", "0");
        m.insert("CANVASYNC_MAX_POINT_MOVEMENT", "-1");
        m.insert("CANVASYNC_MEMORY_CEILING_MB", "lots");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 3000);
        assert_eq!(cfg.max_users, 50);
        assert!((cfg.max_point_movement - 0.2).abs() < f64::EPSILON);
        assert_eq!(cfg.memory_ceiling_bytes, 512 * 1024 * 1024);
    }

    #[test]
    fn huge_memory_ceiling_saturates() {
        let mut m = HashMap::new();
        m.insert("CANVASYNC_MEMORY_CEILING_MB", "18446744073709551615");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.memory_ceiling_bytes, u64::MAX);
    }

    #[test]
    fn limits_are_overridable() {
        let mut m = HashMap::new();
        m.insert("CANVASYNC_MAX_USERS", "5");
        m.insert("CANVASYNC_MAX_STROKE_POINTS", "64");
        m.insert("CANVASYNC_MAX_POINT_MOVEMENT", "0.5");
        m.insert("CANVASYNC_BACKUP_RETENTION", "3");
        m.insert("CANVASYNC_FLUSH_DEBOUNCE_MS", "0");
        m.insert("CANVASYNC_LOG_FORMAT", "json");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.max_users, 5);
        assert_eq!(cfg.max_stroke_points, 64);
        assert!((cfg.max_point_movement - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.backup_retention, 3);
        assert_eq!(cfg.flush_debounce, Duration::ZERO);
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn blocked_users_are_split_and_trimmed() {
        let mut m = HashMap::new();
        m.insert("CANVASYNC_BLOCKED_USERS", " spammer , ,troll");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.blocked_users, vec!["spammer".to_string(), "troll".to_string()]);
    }

    #[test]
    fn data_dir_and_cors_origins_are_read() {
        let mut m = HashMap::new();
        m.insert("CANVASYNC_DATA_DIR", "/var/lib/canvasync");
        m.insert("CANVASYNC_CORS_ORIGINS", "https://board.example.com");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/canvasync"));
        assert_eq!(cfg.cors_origins.as_deref(), Some("https://board.example.com"));

        let mut m = HashMap::new();
        m.insert("CANVASYNC_CORS_ORIGINS", "  ");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(cfg.cors_origins.is_none());
    }

    #[test]
    fn rate_table_defaults_without_file() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.rate_table().expect("defaults"), RateTable::default());
    }

    #[test]
    fn rate_table_reads_override_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "[events.chat-message]\nmax_events = 2\nwindow_secs = 60\nburst = 1\nblock_secs = 30"
        )
        .expect("write");
        let mut cfg = RelayConfig::default();
        cfg.rate_limits_file = Some(file.path().to_path_buf());

        let table = cfg.rate_table().expect("file should parse");
        assert_eq!(table.rule_for("chat-message").max_events, 2);
    }

    #[test]
    fn missing_rate_file_is_an_error() {
        let mut cfg = RelayConfig::default();
        cfg.rate_limits_file = Some(PathBuf::from("/definitely/not/here.toml"));
        assert!(matches!(cfg.rate_table(), Err(ConfigError::RateFileIo { .. })));
    }
}
