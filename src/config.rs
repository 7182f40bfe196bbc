//! Configuration management for asic2mqtt
//!
//! Command line arguments select the config file (also settable through the
//! `CONFIG_PATH` environment variable) and console verbosity. The file
//! itself (JSON, or YAML by extension) describes the ASICs to poll, the
//! MQTT broker, logging and polling intervals. Every field has a default.

use crate::miner::AsicKind;
use crate::{Error, Result};
use clap::{ArgAction, Parser};
use indexmap::IndexMap;
use serde::Deserialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config_secrets.json";

/// Default port of the cgminer-style miner API
pub const DEFAULT_API_PORT: u16 = 4028;

/// Command line arguments
#[derive(Debug, Clone, Parser)]
#[command(
    name = "asic2mqtt",
    version = env!("CARGO_PKG_VERSION"),
    about = "Collect ASIC miner statistics and publish them to MQTT"
)]
pub struct Args {
    /// Console log verbosity (-v warnings, -vv info, -vvv debug)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path (JSON or YAML)
    #[arg(short, long, value_name = "FILE", env = "CONFIG_PATH", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Run a single poll cycle and exit
    #[arg(long)]
    pub once: bool,

    /// Validate the configuration, print a summary and exit
    #[arg(long)]
    pub check_config: bool,

    /// Print program info and exit
    #[arg(long)]
    pub info: bool,
}

/// Complete file configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// ASICs to poll, in file order
    pub asics: IndexMap<String, AsicConfig>,
    pub mqtt: MqttConfig,
    pub logging: LoggingConfig,
    pub polling: PollingConfig,
}

/// A single ASIC entry
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AsicConfig {
    pub ip: Option<String>,
    /// Base topic; readings go to `<topic>/<command>`
    pub topic: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub port: u16,
    /// Overrides detection from the entry name
    pub kind: Option<AsicKind>,
}

impl Default for AsicConfig {
    fn default() -> Self {
        Self {
            ip: None,
            topic: None,
            username: None,
            password: None,
            port: DEFAULT_API_PORT,
            kind: None,
        }
    }
}

impl AsicConfig {
    /// Explicit kind, or the one implied by the entry name
    pub fn resolve_kind(&self, name: &str) -> Option<AsicKind> {
        self.kind.or_else(|| AsicKind::detect(name))
    }

    /// Both an address and a topic are present and non-empty
    pub fn is_complete(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        present(&self.ip) && present(&self.topic)
    }
}

/// MQTT broker settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_address: String,
    pub broker_port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    #[serde(with = "humantime_duration")]
    pub keep_alive: Duration,
    /// Bound on waiting for the broker (CONNACK, queueing a publish)
    #[serde(with = "humantime_duration")]
    pub connect_timeout: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_address: "localhost".to_string(),
            broker_port: 1883,
            username: String::new(),
            password: String::new(),
            client_id: "asic2mqtt".to_string(),
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl MqttConfig {
    /// Credentials are only used when both are set
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if self.username.is_empty() || self.password.is_empty() {
            None
        } else {
            Some((&self.username, &self.password))
        }
    }

    /// `host:port` of the broker
    pub fn broker(&self) -> String {
        format!("{}:{}", self.broker_address, self.broker_port)
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Console level when no -v flag is given
    pub level: String,
    /// Log file receiving everything at debug and above
    pub file: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "ERROR".to_string(),
            file: PathBuf::from("/var/log/asic2mqtt.log"),
        }
    }
}

/// Poll loop timing
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Pause after each polled ASIC
    #[serde(with = "humantime_duration")]
    pub asic_delay: Duration,
    /// Pause between cycles
    #[serde(with = "humantime_duration")]
    pub cycle_delay: Duration,
    #[serde(with = "humantime_duration")]
    pub ping_timeout: Duration,
    /// Bound on a single miner API request
    #[serde(with = "humantime_duration")]
    pub request_timeout: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            asic_delay: Duration::from_secs(1),
            cycle_delay: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from a JSON or YAML file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ConfigNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                Error::Io(e)
            }
        })?;

        let config = Self::parse(path, &content)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(path: &Path, content: &str) -> Result<Self> {
        match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(content).map_err(Error::from),
            _ => serde_json::from_str(content).map_err(Error::from),
        }
    }

    /// Validate settings the daemon cannot run without
    pub fn validate(&self) -> Result<()> {
        if self.mqtt.broker_address.is_empty() {
            return Err(Error::config("MQTT broker address must not be empty"));
        }

        if self.mqtt.broker_port == 0 {
            return Err(Error::config("MQTT broker port must be greater than 0"));
        }

        if self.mqtt.client_id.trim().is_empty() {
            return Err(Error::config("MQTT client id must not be empty"));
        }

        if !self.mqtt.keep_alive.is_zero() && self.mqtt.keep_alive < Duration::from_secs(1) {
            return Err(Error::config("MQTT keep alive must be 0 or at least 1s"));
        }

        if self.polling.cycle_delay.is_zero() {
            return Err(Error::config("Cycle delay must be greater than 0"));
        }

        Ok(())
    }

    /// Stricter validation for `--check-config`: every ASIC must be usable
    pub fn check(&self) -> Result<()> {
        self.validate()?;

        if self.asics.is_empty() {
            return Err(Error::config("The 'asics' section is missing or empty"));
        }

        for (name, asic) in &self.asics {
            if !asic.is_complete() {
                return Err(Error::config(format!(
                    "Incomplete configuration for ASIC {}: 'ip' and 'topic' are required",
                    name
                )));
            }
            if asic.resolve_kind(name).is_none() {
                return Err(Error::config(format!(
                    "Cannot tell the type of ASIC {}: name it after its vendor or set 'kind'",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Human-readable summary, without passwords
    pub fn summary(&self) -> String {
        let na = |v: &Option<String>| v.clone().unwrap_or_else(|| "N/A".to_string());
        let mut out = String::from("Configured ASICs:\n");

        for (name, asic) in &self.asics {
            let kind = asic
                .resolve_kind(name)
                .map(|k| k.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let _ = writeln!(out, "  {} ({}):", name, kind);
            let _ = writeln!(out, "    IP: {}:{}", na(&asic.ip), asic.port);
            let _ = writeln!(out, "    Topic: {}", na(&asic.topic));
            if let Some(username) = &asic.username {
                let _ = writeln!(out, "    Username: {}", username);
            }
        }

        let _ = writeln!(out, "\nMQTT:");
        let _ = writeln!(out, "  Broker: {}", self.mqtt.broker());
        let username = if self.mqtt.username.is_empty() {
            "N/A"
        } else {
            self.mqtt.username.as_str()
        };
        let _ = writeln!(out, "  Username: {}", username);
        let _ = writeln!(out, "  Client id: {}", self.mqtt.client_id);
        out
    }
}

/// Serde adapter for human-readable durations ("1s", "500ms", "2m")
mod humantime_duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"{
        "asics": {
            "whatsminer1": { "ip": "192.168.3.34", "topic": "asic/wm1" },
            "antminer3": { "ip": "192.168.3.73", "topic": "asic/am3", "username": "root", "password": "root" },
            "shed": { "ip": "192.168.3.90", "topic": "asic/shed", "kind": "antminer", "port": 4029 }
        },
        "mqtt": { "broker_address": "broker.lan", "broker_port": 1884, "username": "u", "password": "p" },
        "logging": { "level": "info", "file": "/tmp/asic2mqtt.log" },
        "polling": { "asic_delay": "250ms", "cycle_delay": "10s" }
    }"#;

    fn temp_file(suffix: &str, content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["asic2mqtt"]).unwrap();
        assert_eq!(args.verbose, 0);
        assert!(!args.once);
        assert!(!args.check_config);
        // CONFIG_PATH may be set in the environment running the tests
        if std::env::var_os("CONFIG_PATH").is_none() {
            assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        }
    }

    #[test]
    fn test_args_verbosity_counts() {
        let args = Args::try_parse_from(["asic2mqtt", "-vvv", "--config", "x.json", "--once"]).unwrap();
        assert_eq!(args.verbose, 3);
        assert_eq!(args.config, PathBuf::from("x.json"));
        assert!(args.once);
    }

    #[tokio::test]
    async fn test_load_json() {
        let file = temp_file(".json", SAMPLE);
        let config = Config::load(file.path()).await.unwrap();

        let names: Vec<&str> = config.asics.keys().map(String::as_str).collect();
        assert_eq!(names, ["whatsminer1", "antminer3", "shed"]);
        assert_eq!(config.asics["whatsminer1"].port, DEFAULT_API_PORT);
        assert_eq!(config.asics["shed"].port, 4029);
        assert_eq!(config.mqtt.broker(), "broker.lan:1884");
        assert_eq!(config.mqtt.client_id, "asic2mqtt");
        assert_eq!(config.mqtt.keep_alive, Duration::from_secs(60));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.polling.asic_delay, Duration::from_millis(250));
        assert_eq!(config.polling.cycle_delay, Duration::from_secs(10));
        assert_eq!(config.polling.request_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_load_yaml() {
        let yaml = r#"
asics:
  antminer1:
    ip: 10.0.0.5
    topic: farm/am1
mqtt:
  broker_port: 1883
polling:
  cycle_delay: 1m
"#;
        let file = temp_file(".yaml", yaml);
        let config = Config::load(file.path()).await.unwrap();

        assert_eq!(config.asics["antminer1"].ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(config.mqtt.broker_address, "localhost");
        assert_eq!(config.polling.cycle_delay, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_empty_object_uses_defaults() {
        let file = temp_file(".json", "{}");
        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.logging.level, "ERROR");
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let err = Config::load(&path).await.unwrap_err();
        assert_matches!(err, Error::ConfigNotFound { path: p } if p == path);
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let file = temp_file(".json", "{ \"asics\": ");
        assert_matches!(Config::load(file.path()).await, Err(Error::Json(_)));
    }

    #[tokio::test]
    async fn test_bad_duration_is_rejected() {
        let file = temp_file(".json", r#"{ "polling": { "cycle_delay": "soon" } }"#);
        assert_matches!(Config::load(file.path()).await, Err(Error::Json(_)));
    }

    #[test]
    fn test_validate_rejects_zero_port_and_delay() {
        let mut config = Config::default();
        config.mqtt.broker_port = 0;
        assert_matches!(config.validate(), Err(Error::Config { .. }));

        let mut config = Config::default();
        config.polling.cycle_delay = Duration::ZERO;
        assert_matches!(config.validate(), Err(Error::Config { .. }));

        let mut config = Config::default();
        config.mqtt.client_id = "   ".to_string();
        assert_matches!(config.validate(), Err(Error::Config { .. }));

        let mut config = Config::default();
        config.mqtt.keep_alive = Duration::from_millis(500);
        assert_matches!(config.validate(), Err(Error::Config { .. }));
    }

    #[test]
    fn test_check_requires_complete_asics() {
        let config: Config = serde_json::from_str(SAMPLE).unwrap();
        assert!(config.check().is_ok());

        assert_matches!(Config::default().check(), Err(Error::Config { .. }));

        let incomplete: Config =
            serde_json::from_str(r#"{ "asics": { "antminer1": { "ip": "10.0.0.1" } } }"#).unwrap();
        assert_matches!(incomplete.check(), Err(Error::Config { message }) if message.contains("antminer1"));

        let unknown: Config =
            serde_json::from_str(r#"{ "asics": { "rig": { "ip": "10.0.0.1", "topic": "t" } } }"#).unwrap();
        assert_matches!(unknown.check(), Err(Error::Config { .. }));
    }

    #[test]
    fn test_resolve_kind() {
        let config: Config = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(config.asics["whatsminer1"].resolve_kind("whatsminer1"), Some(AsicKind::Whatsminer));
        assert_eq!(config.asics["antminer3"].resolve_kind("antminer3"), Some(AsicKind::Antminer));
        assert_eq!(config.asics["shed"].resolve_kind("shed"), Some(AsicKind::Antminer));
    }

    #[test]
    fn test_is_complete() {
        let asic = AsicConfig {
            ip: Some("10.0.0.1".to_string()),
            topic: Some(String::new()),
            ..AsicConfig::default()
        };
        assert!(!asic.is_complete());
        assert!(!AsicConfig::default().is_complete());
    }

    #[test]
    fn test_credentials_need_both_fields() {
        let mut mqtt = MqttConfig::default();
        assert_eq!(mqtt.credentials(), None);
        mqtt.username = "user".to_string();
        assert_eq!(mqtt.credentials(), None);
        mqtt.password = "secret".to_string();
        assert_eq!(mqtt.credentials(), Some(("user", "secret")));
    }

    #[test]
    fn test_summary_hides_passwords() {
        let config: Config = serde_json::from_str(SAMPLE).unwrap();
        let summary = config.summary();

        assert!(summary.contains("whatsminer1 (whatsminer)"));
        assert!(summary.contains("IP: 192.168.3.73:4028"));
        assert!(summary.contains("Username: root"));
        assert!(summary.contains("Broker: broker.lan:1884"));
        assert!(!summary.contains("\"p\""));
        assert!(!summary.contains("Password"));
    }

    #[test]
    fn test_bundled_example_passes_check() {
        let config = Config::parse(Path::new("config_example.json"), include_str!("../config_example.json")).unwrap();

        config.check().unwrap();
        assert_eq!(config.asics.len(), 3);
        assert_eq!(config.asics["rack3_unit7"].resolve_kind("rack3_unit7"), Some(AsicKind::Antminer));
        assert_eq!(config.asics["rack3_unit7"].port, 4029);
    }
}
