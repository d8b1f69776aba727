//! Server configuration loaded from a TOML file.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub initialization: InitializationConfig,
    #[serde(default)]
    pub authentication: AuthenticationConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct InitializationConfig {
    /// URLs of existing cluster members to join on first start.
    /// Empty means bootstrap a new cluster.
    #[serde(rename = "join-urls", default)]
    pub join_urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AuthenticationConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    pub dir: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            dir: "/var/lib/meridian/broker".to_string(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    pub dir: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// URL peers use to reach this node. When a data node registers with
    /// this URL, the server adopts its id.
    #[serde(rename = "advertise-url", default)]
    pub advertise_url: Option<String>,
    /// How often expired shard groups are checked for removal.
    #[serde(
        rename = "retention-check-period",
        default = "default_retention_check_period",
        deserialize_with = "deserialize_duration"
    )]
    pub retention_check_period: Duration,
    /// Writes with timestamps further than this ahead of the server
    /// clock are rejected.
    #[serde(
        rename = "write-skew-window",
        default = "default_write_skew_window",
        deserialize_with = "deserialize_duration"
    )]
    pub write_skew_window: Duration,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: "/var/lib/meridian/data".to_string(),
            port: default_port(),
            advertise_url: None,
            retention_check_period: default_retention_check_period(),
            write_skew_window: default_write_skew_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub dir: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            dir: "/var/lib/meridian/cluster".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// "stderr", "stdout", or a file path.
    #[serde(default = "default_log_file")]
    pub file: String,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: default_log_file(),
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminConfig {
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            port: default_admin_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(rename = "ssl-port", default)]
    pub ssl_port: u16,
    #[serde(rename = "ssl-cert", default)]
    pub ssl_cert: String,
}

fn default_port() -> u16 {
    8086
}

fn default_admin_port() -> u16 {
    8083
}

fn default_log_file() -> String {
    "stderr".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_retention_check_period() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_write_skew_window() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        Self::from_str(&text)
    }

    /// Parse configuration from TOML text.
    pub fn from_str(text: &str) -> Result<Config> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Parse a Go-style duration string: `"500ms"`, `"10s"`, `"10m"`, `"1h30m"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(format!("invalid duration: {s:?}"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|e| format!("invalid duration {s:?}: {e}"))?;
        rest = &rest[digits..];
        let unit_len = rest
            .bytes()
            .take_while(|b| b.is_ascii_alphabetic())
            .count();
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        let step = match unit {
            "ns" => Duration::from_nanos(value),
            "us" => Duration::from_micros(value),
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            "d" => Duration::from_secs(value * 86400),
            other => return Err(format!("unknown duration unit {other:?} in {s:?}")),
        };
        total += step;
    }
    Ok(total)
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let text = r#"
            [initialization]
            join-urls = ["http://peer:8086"]

            [authentication]
            enabled = true

            [broker]
            dir = "/tmp/broker"
            port = 9096

            [data]
            dir = "/tmp/data"
            port = 9096
            retention-check-period = "30m"

            [cluster]
            dir = "/tmp/cluster"

            [logging]
            file = "stderr"
            level = "debug"

            [admin]
            port = 9083

            [api]
            ssl-port = 8087
            ssl-cert = "/etc/ssl/meridian.pem"
        "#;
        let config = Config::from_str(text).unwrap();
        assert_eq!(config.initialization.join_urls, vec!["http://peer:8086"]);
        assert!(config.authentication.enabled);
        assert_eq!(config.broker.port, 9096);
        assert_eq!(config.data.retention_check_period, Duration::from_secs(1800));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.admin.port, 9083);
        assert_eq!(config.api.ssl_port, 8087);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_str("").unwrap();
        assert!(!config.authentication.enabled);
        assert_eq!(config.broker.port, 8086);
        assert_eq!(config.admin.port, 8083);
        assert_eq!(config.data.write_skew_window, Duration::from_secs(300));
        assert!(config.initialization.join_urls.is_empty());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_str("[broker]\ndir = \"/tmp\"\nbogus = 1\n").unwrap_err();
        assert!(err.to_string().contains("bogus"), "unexpected error: {err}");
    }

    #[test]
    fn duration_strings() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604800));
        assert!(parse_duration("10 parsecs").is_err());
        assert!(parse_duration("").is_err());
    }
}
