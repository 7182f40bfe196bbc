//! ASIC miner APIs
//!
//! Antminer and Whatsminer firmware both expose a cgminer-style JSON API on
//! TCP port 4028. The two only differ in the request key and in which
//! commands carry the telemetry we republish:
//!
//! | kind       | telemetry          | firmware version |
//! |------------|--------------------|------------------|
//! | Antminer   | `stats`, `devs`    | `version`        |
//! | Whatsminer | `summary`, `edevs` | `get_version`    |
//!
//! Only read-only commands are issued; Whatsminer's token-based privileged
//! API is not used.

use crate::{version, Result};
use async_trait::async_trait;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::debug;

pub mod cgminer;

pub use cgminer::CgminerClient;

/// Supported miner families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsicKind {
    Antminer,
    Whatsminer,
}

impl AsicKind {
    /// Infer the kind from a configured name such as `whatsminer1`
    pub fn detect(name: &str) -> Option<Self> {
        let name = name.to_lowercase();
        if name.contains("whatsminer") {
            Some(AsicKind::Whatsminer)
        } else if name.contains("antminer") {
            Some(AsicKind::Antminer)
        } else {
            None
        }
    }

    /// Commands whose responses are republished, each under `<topic>/<command>`
    pub fn telemetry_commands(&self) -> &'static [&'static str] {
        match self {
            AsicKind::Antminer => &["stats", "devs"],
            AsicKind::Whatsminer => &["summary", "edevs"],
        }
    }

    /// Command reporting the firmware version
    pub fn version_command(&self) -> &'static str {
        match self {
            AsicKind::Antminer => "version",
            AsicKind::Whatsminer => "get_version",
        }
    }

    /// JSON key carrying the command name in a request
    pub fn request_key(&self) -> &'static str {
        match self {
            AsicKind::Antminer => "command",
            AsicKind::Whatsminer => "cmd",
        }
    }

    /// Pull the raw firmware version string out of a version response
    pub fn extract_version(&self, response: &Value) -> Option<String> {
        let found = match self {
            AsicKind::Antminer => ["CGMiner", "BMMiner", "Miner", "API"]
                .iter()
                .find_map(|key| response.pointer(&format!("/VERSION/0/{}", key))?.as_str()),
            AsicKind::Whatsminer => response.pointer("/Msg/fw_ver").and_then(Value::as_str),
        };
        found.map(str::to_string)
    }
}

impl fmt::Display for AsicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsicKind::Antminer => write!(f, "antminer"),
            AsicKind::Whatsminer => write!(f, "whatsminer"),
        }
    }
}

/// A reachable, fully configured ASIC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsicEndpoint {
    pub name: String,
    pub kind: AsicKind,
    pub host: String,
    pub port: u16,
}

impl AsicEndpoint {
    /// `host:port` of the miner API
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One command response
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub command: &'static str,
    pub payload: Value,
}

/// Firmware version as reported and as normalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareVersion {
    /// Empty when the response carried no version field
    pub raw: String,
    pub version: Version,
}

/// Miner API transport
#[async_trait]
pub trait AsicApi: Send + Sync {
    /// Send a single command and return the decoded JSON response
    async fn query(&self, endpoint: &AsicEndpoint, command: &str) -> Result<Value>;
}

/// Query every telemetry command of the endpoint's kind.
///
/// All-or-nothing: if one command fails no readings are returned, so a
/// half-answered cycle never publishes a partial picture.
pub async fn fetch_telemetry<A: AsicApi + ?Sized>(
    api: &A,
    endpoint: &AsicEndpoint,
) -> Result<Vec<Reading>> {
    let mut readings = Vec::new();
    for &command in endpoint.kind.telemetry_commands() {
        debug!("Requesting {} from {} {}", command, endpoint.kind, endpoint.host);
        let payload = api.query(endpoint, command).await?;
        readings.push(Reading { command, payload });
    }
    Ok(readings)
}

/// Query and normalize the firmware version; `None` if the query failed
pub async fn firmware_version<A: AsicApi + ?Sized>(
    api: &A,
    endpoint: &AsicEndpoint,
) -> Option<FirmwareVersion> {
    let response = match api.query(endpoint, endpoint.kind.version_command()).await {
        Ok(response) => response,
        Err(e) => {
            debug!("No firmware version from {}: {}", endpoint.name, e);
            return None;
        }
    };

    let raw = endpoint.kind.extract_version(&response);
    let version = version::normalize(raw.as_deref());
    Some(FirmwareVersion {
        raw: raw.unwrap_or_default(),
        version,
    })
}
