//! Server configuration.
//!
//! Loaded from a TOML file or built in code; every field has a default so
//! `Config::default()` is a working single-reactor setup.

use serde::Deserialize;
use std::path::Path;

use crate::error::ConfigError;

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Number of reactor threads (>= 1). Reactor 0 is the leader: it owns
    /// every listener and, when it is the only reactor, also services
    /// connections itself.
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,

    /// Worker pool size. 0 disables offload and `process` runs inline on
    /// the reactor.
    #[serde(default)]
    pub worker_threads: usize,

    /// Apply TCP_NODELAY to every accepted socket.
    #[serde(default)]
    pub tcp_nodelay: bool,

    /// CPU cores to pin threads to, Linux-style (e.g. "0-3,6-8").
    /// Reactors are pinned first, workers after them. Best-effort.
    #[serde(default)]
    pub cpu_affinity: Option<String>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_io_threads() -> usize {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            io_threads: default_io_threads(),
            worker_threads: 0,
            tcp_nodelay: false,
            cpu_affinity: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io_threads == 0 {
            return Err(ConfigError::Invalid(
                "io_threads must be at least 1".to_string(),
            ));
        }
        if let Some(ref list) = self.cpu_affinity {
            parse_cpu_list(list).map_err(ConfigError::Invalid)?;
        }
        Ok(())
    }

    /// Get the parsed CPU affinity list.
    pub fn cpu_affinity(&self) -> Option<Vec<usize>> {
        self.cpu_affinity
            .as_ref()
            .and_then(|s| parse_cpu_list(s).ok())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter when RUST_LOG is not set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include thread names in output.
    #[serde(default = "default_true")]
    pub thread_names: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            thread_names: true,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output with ANSI colors.
    #[default]
    Pretty,
    /// Single-line compact output.
    Compact,
    /// Structured JSON output.
    Json,
}

/// Parse a Linux-style CPU list ("0-3,6,8-14:2") into sorted unique ids.
pub fn parse_cpu_list(list: &str) -> Result<Vec<usize>, String> {
    let mut cpus = Vec::new();

    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let (range, stride) = match part.split_once(':') {
            Some((range, stride_str)) => {
                let stride: usize = stride_str
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid stride: {stride_str}"))?;
                if stride == 0 {
                    return Err("stride cannot be zero".to_string());
                }
                (range, stride)
            }
            None => (part, 1),
        };

        match range.split_once('-') {
            Some((lo_str, hi_str)) => {
                let lo: usize = lo_str
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid CPU number: {lo_str}"))?;
                let hi: usize = hi_str
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid CPU number: {hi_str}"))?;
                if lo > hi {
                    return Err(format!("invalid range: {range}"));
                }
                cpus.extend((lo..=hi).step_by(stride));
            }
            None => {
                if stride != 1 {
                    return Err(format!("stride requires a range (e.g. 0-15:2): {part}"));
                }
                let cpu: usize = range
                    .parse()
                    .map_err(|_| format!("invalid CPU number: {range}"))?;
                cpus.push(cpu);
            }
        }
    }

    if cpus.is_empty() {
        return Err("CPU list cannot be empty".to_string());
    }

    cpus.sort_unstable();
    cpus.dedup();

    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.io_threads, 1);
        assert_eq!(config.worker_threads, 0);
        assert!(!config.tcp_nodelay);
        assert!(config.cpu_affinity.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            io_threads = 4
            worker_threads = 8
            tcp_nodelay = true
            cpu_affinity = "0-3"

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.io_threads, 4);
        assert_eq!(config.worker_threads, 8);
        assert!(config.tcp_nodelay);
        assert_eq!(config.cpu_affinity(), Some(vec![0, 1, 2, 3]));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_parse_toml_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.io_threads, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(toml::from_str::<Config>("io_thread = 2").is_err());
    }

    #[test]
    fn test_zero_io_threads_invalid() {
        let config = Config {
            io_threads: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_affinity_invalid() {
        let config = Config {
            cpu_affinity: Some("8-2".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cpu_list_single_and_ranges() {
        assert_eq!(parse_cpu_list("3").unwrap(), vec![3]);
        assert_eq!(parse_cpu_list("0-3").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list("0-2,6,4").unwrap(), vec![0, 1, 2, 4, 6]);
    }

    #[test]
    fn test_cpu_list_stride() {
        assert_eq!(parse_cpu_list("0-6:2").unwrap(), vec![0, 2, 4, 6]);
        assert!(parse_cpu_list("0-6:0").is_err());
        assert!(parse_cpu_list("4:2").is_err());
    }

    #[test]
    fn test_cpu_list_dedup() {
        assert_eq!(parse_cpu_list("1,1,0-1").unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_cpu_list_errors() {
        assert!(parse_cpu_list("").is_err());
        assert!(parse_cpu_list("a").is_err());
        assert!(parse_cpu_list("3-1").is_err());
    }
}
