use std::{env, fs, path::Path, thread};

use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_PINGS_PER_SEC: u64 = 4800;

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Connection string for the document store. Overridable with the
    /// `MONGO_URL` environment variable.
    #[serde(default = "default_mongodb_uri")]
    pub mongodb_uri: String,

    #[serde(default)]
    pub logging_dir: Option<String>,

    #[serde(default)]
    pub scan: ScanConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub control: ControlConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ScanConfig {
    /// Aggregate packet rate across the whole worker pool. Each masscan
    /// child gets `pings_per_sec / max_active` as its `--max-rate`.
    #[serde(default = "default_pings_per_sec")]
    pub pings_per_sec: u64,

    /// Worker pool cap. Defaults to the detected CPU parallelism.
    #[serde(default)]
    pub max_active: Option<usize>,

    /// Minimum v4 prefix; inputs shorter than this are chunked down to it so
    /// a single subnet can't hold a worker for hours. Absent means no
    /// chunking.
    #[serde(default)]
    pub chunk_prefix_v4: Option<u8>,

    #[serde(default = "default_port_start")]
    pub port_start: u16,
    #[serde(default = "default_port_end")]
    pub port_end: u16,

    #[serde(default = "default_masscan_path")]
    pub masscan_path: String,

    /// Fallback targets for `copescan scan` when no subnets are given.
    #[serde(default = "default_subnets")]
    pub default_subnets: Vec<String>,
}

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    /// Protocol version sent in the status handshake. Servers answer the
    /// status request regardless, so this rarely needs changing.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: i32,

    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ControlConfig {
    #[serde(default = "default_control_port")]
    pub port: u16,
}

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Base URL of the control plane, used by the catalog API's scan proxy
    /// routes.
    #[serde(default = "default_control_url")]
    pub control_url: String,
}

/// Log newly discovered servers to a Discord-style webhook.
#[derive(Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            pings_per_sec: default_pings_per_sec(),
            max_active: None,
            chunk_prefix_v4: None,
            port_start: default_port_start(),
            port_end: default_port_end(),
            masscan_path: default_masscan_path(),
            default_subnets: default_subnets(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
            timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            port: default_control_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            control_url: default_control_url(),
        }
    }
}

fn default_mongodb_uri() -> String {
    "mongodb://localhost:27017".to_string()
}
fn default_pings_per_sec() -> u64 {
    DEFAULT_PINGS_PER_SEC
}
fn default_port_start() -> u16 {
    25565
}
fn default_port_end() -> u16 {
    25577
}
fn default_masscan_path() -> String {
    "masscan".to_string()
}
fn default_protocol_version() -> i32 {
    767
}
fn default_probe_timeout_secs() -> u64 {
    5
}
fn default_control_port() -> u16 {
    8081
}
fn default_api_port() -> u16 {
    8080
}
fn default_control_url() -> String {
    "http://127.0.0.1:8081".to_string()
}

fn default_subnets() -> Vec<String> {
    [
        "103.112.60.0/24",
        "62.115.0.0/16",
        "206.148.24.0/22",
        "99.82.128.0/18",
        "99.83.64.0/18",
        "4.0.0.0/9",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

impl Config {
    /// Parse the config file if it exists (every field has a default, so a
    /// missing file is fine) and fold the environment overrides on top.
    pub fn load(path: &str) -> eyre::Result<Self> {
        let mut config: Config = if Path::new(path).exists() {
            toml::from_str(&fs::read_to_string(path)?)?
        } else {
            toml::from_str("")?
        };
        config.apply_env_overrides();

        if config.scan.port_start > config.scan.port_end {
            eyre::bail!(
                "scan.port_start {} is greater than scan.port_end {}",
                config.scan.port_start,
                config.scan.port_end
            );
        }

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("MONGO_URL") {
            if !url.trim().is_empty() {
                self.mongodb_uri = url;
            }
        }

        self.scan.pings_per_sec = env_int(
            "SCAN_PINGS_PER_SEC",
            self.scan.pings_per_sec as i64,
            Some(1),
            None,
        ) as u64;

        if let Some(value) = env_value("SCAN_MAX_ACTIVE") {
            let fallback = self.scan.max_active.unwrap_or_else(detected_cpus) as i64;
            self.scan.max_active = Some(int_from_env_value(
                "SCAN_MAX_ACTIVE",
                Some(&value),
                fallback,
                Some(1),
                None,
            ) as usize);
        }

        if let Some(value) = env_value("SCAN_CHUNK_PREFIX_V4") {
            self.scan.chunk_prefix_v4 = chunk_prefix_from_env_value(Some(&value));
        }

        self.control.port = env_int(
            "SCANNER_CONTROL_PORT",
            self.control.port as i64,
            Some(1),
            Some(u16::MAX as i64),
        ) as u16;

        self.api.port = env_int(
            "SCANNER_API_PORT",
            self.api.port as i64,
            Some(1),
            Some(u16::MAX as i64),
        ) as u16;
    }

    /// Resolve the worker pool size for one scan: explicit request argument,
    /// then config/environment, then detected CPUs. Request values above the
    /// detected count are clamped down, never raised.
    pub fn resolve_max_active(&self, requested: Option<usize>) -> usize {
        let detected = detected_cpus();
        match requested {
            Some(requested) if requested > detected => {
                warn!("Requested maxActive {requested} exceeds available CPUs {detected}; clamping");
                detected
            }
            Some(requested) => requested.max(1),
            None => self.scan.max_active.unwrap_or(detected).max(1),
        }
    }

    /// Per-child masscan packet rate so the pool's aggregate rate stays at
    /// `pings_per_sec` regardless of pool size.
    pub fn masscan_rate(&self, max_active: usize) -> f64 {
        self.scan.pings_per_sec as f64 / max_active.max(1) as f64
    }
}

pub fn detected_cpus() -> usize {
    thread::available_parallelism().map(usize::from).unwrap_or(1)
}

fn env_value(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_int(name: &str, default: i64, min: Option<i64>, max: Option<i64>) -> i64 {
    int_from_env_value(name, env_value(name).as_deref(), default, min, max)
}

fn int_from_env_value(
    name: &str,
    raw: Option<&str>,
    default: i64,
    min: Option<i64>,
    max: Option<i64>,
) -> i64 {
    let Some(raw) = raw else {
        return default;
    };
    let Ok(value) = raw.trim().parse::<i64>() else {
        warn!("Invalid {name}={raw}; using default {default}");
        return default;
    };
    if let Some(min) = min {
        if value < min {
            warn!("{name}={value} below min {min}; using {min}");
            return min;
        }
    }
    if let Some(max) = max {
        if value > max {
            warn!("{name}={value} above max {max}; using {max}");
            return max;
        }
    }
    value
}

/// `SCAN_CHUNK_PREFIX_V4` is unusual in that a bad value disables chunking
/// instead of clamping.
fn chunk_prefix_from_env_value(raw: Option<&str>) -> Option<u8> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    let Ok(value) = raw.parse::<i64>() else {
        warn!("Invalid SCAN_CHUNK_PREFIX_V4={raw}; chunking disabled");
        return None;
    };
    if !(0..=32).contains(&value) {
        warn!("SCAN_CHUNK_PREFIX_V4={value} out of range; chunking disabled");
        return None;
    }
    Some(value as u8)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_env_int_parsing() {
        assert_eq!(int_from_env_value("X", None, 7, None, None), 7);
        assert_eq!(int_from_env_value("X", Some("12"), 7, None, None), 12);
        assert_eq!(int_from_env_value("X", Some("oops"), 7, None, None), 7);
        assert_eq!(int_from_env_value("X", Some("0"), 7, Some(1), None), 1);
        assert_eq!(int_from_env_value("X", Some("99"), 7, None, Some(10)), 10);
    }

    #[test]
    fn test_chunk_prefix_parsing() {
        assert_eq!(chunk_prefix_from_env_value(None), None);
        assert_eq!(chunk_prefix_from_env_value(Some("")), None);
        assert_eq!(chunk_prefix_from_env_value(Some("24")), Some(24));
        assert_eq!(chunk_prefix_from_env_value(Some("0")), Some(0));
        assert_eq!(chunk_prefix_from_env_value(Some("32")), Some(32));
        assert_eq!(chunk_prefix_from_env_value(Some("33")), None);
        assert_eq!(chunk_prefix_from_env_value(Some("-1")), None);
        assert_eq!(chunk_prefix_from_env_value(Some("abc")), None);
    }

    #[test]
    fn test_empty_config_has_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.scan.pings_per_sec, DEFAULT_PINGS_PER_SEC);
        assert_eq!(config.scan.port_start, 25565);
        assert_eq!(config.scan.port_end, 25577);
        assert_eq!(config.control.port, 8081);
        assert!(config.scan.chunk_prefix_v4.is_none());
    }

    #[test]
    fn test_request_clamped_to_detected_cpus() {
        let config: Config = toml::from_str("").unwrap();
        let detected = detected_cpus();
        assert_eq!(config.resolve_max_active(Some(detected + 100)), detected);
        assert_eq!(config.resolve_max_active(Some(1)), 1);
    }
}
