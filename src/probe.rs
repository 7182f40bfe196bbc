//! Host reachability checks
//!
//! Before talking to a miner the poller pings it once, so a powered-off
//! machine costs a one-second ping instead of a full API timeout.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Decides whether a host is worth querying this cycle
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn is_available(&self, host: &str) -> bool;
}

/// Single ICMP echo through the system `ping` binary
#[derive(Debug, Clone)]
pub struct PingProbe {
    program: String,
    timeout: Duration,
}

impl PingProbe {
    /// Create a probe waiting at most `timeout` for the reply
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: "ping".to_string(),
            timeout,
        }
    }

    /// Use a different ping executable
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Arguments for one echo request; `-W` takes whole seconds, at least 1
    pub fn args(&self, host: &str) -> Vec<String> {
        let wait = self.timeout.as_secs_f64().ceil().max(1.0) as u64;
        vec![
            "-c".to_string(),
            "1".to_string(),
            "-W".to_string(),
            wait.to_string(),
            host.to_string(),
        ]
    }
}

#[async_trait]
impl HostProbe for PingProbe {
    async fn is_available(&self, host: &str) -> bool {
        let status = Command::new(&self.program)
            .args(self.args(host))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) => {
                let available = status.success();
                debug!(
                    "Ping {}: {}",
                    host,
                    if available { "reachable" } else { "unreachable" }
                );
                available
            }
            Err(e) => {
                debug!("Ping {} could not run: {}", host, e);
                false
            }
        }
    }
}
