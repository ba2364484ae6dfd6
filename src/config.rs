use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::Ms;
use crate::scheduler::SchedulerOptions;

/// Daemon settings, read from `APRON_*` environment variables.
/// Missing or unparseable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub retention_ms: Ms,
    pub one_active_per_flight: bool,
    pub reap_interval: Duration,
    pub compact_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7878,
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            max_connections: 256,
            compact_threshold: 1000,
            retention_ms: 7 * 24 * 3_600_000,
            one_active_per_flight: false,
            reap_interval: Duration::from_secs(60),
            compact_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let lookup = &lookup;
        Self {
            bind: lookup("APRON_BIND").unwrap_or(d.bind),
            port: parsed(lookup, "APRON_PORT").unwrap_or(d.port),
            data_dir: lookup("APRON_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            metrics_port: parsed(lookup, "APRON_METRICS_PORT"),
            max_connections: parsed(lookup, "APRON_MAX_CONNECTIONS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(d.max_connections),
            compact_threshold: parsed(lookup, "APRON_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            retention_ms: parsed(lookup, "APRON_RETENTION_MS")
                .filter(|ms: &Ms| *ms >= 0)
                .unwrap_or(d.retention_ms),
            one_active_per_flight: lookup("APRON_ONE_ACTIVE_PER_FLIGHT")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(d.one_active_per_flight),
            ..d
        }
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            one_active_per_flight: self.one_active_per_flight,
        }
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("assignments.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
