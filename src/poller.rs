//! The poll loop
//!
//! ASICs are visited one after another in config order. Each visit is
//! probe, query, publish, pause; a cycle ends with a longer pause before
//! the next one starts. Failures are logged and never end the loop, only
//! cancellation does.

use crate::config::{AsicConfig, Config, PollingConfig};
use crate::miner::{self, AsicApi, AsicEndpoint};
use crate::probe::HostProbe;
use crate::publish::{self, Publisher, VersionPayload};
use crate::{Error, Result};
use chrono::Utc;
use indexmap::IndexMap;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Outcome counters for one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// ASICs that answered
    pub polled: usize,
    /// Incomplete, unknown or unreachable entries
    pub skipped: usize,
    /// Failed queries and failed publishes
    pub failed: usize,
    /// Messages published
    pub published: usize,
}

/// Sequential poller over the configured ASICs
pub struct Poller<A, P, H> {
    asics: IndexMap<String, AsicConfig>,
    polling: PollingConfig,
    api: A,
    publisher: P,
    probe: H,
}

impl<A, P, H> Poller<A, P, H>
where
    A: AsicApi,
    P: Publisher,
    H: HostProbe,
{
    pub fn new(config: &Config, api: A, publisher: P, probe: H) -> Self {
        Self {
            asics: config.asics.clone(),
            polling: config.polling.clone(),
            api,
            publisher,
            probe,
        }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Poll until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Polling {} configured ASICs", self.asics.len());

        loop {
            match self.run_cycle(&cancel).await {
                Ok(report) => debug!(?report, "Cycle report"),
                Err(_) => break,
            }

            info!(
                "Cycle finished, waiting {}",
                humantime::format_duration(self.polling.cycle_delay)
            );
            if pause(self.polling.cycle_delay, &cancel).await.is_err() {
                break;
            }
        }

        info!("Poller stopped");
    }

    /// Single cycle, logging its outcome
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let report = self.run_cycle(cancel).await?;
        info!(
            "Polled {}, skipped {}, published {}, failed {}",
            report.polled, report.skipped, report.published, report.failed
        );
        Ok(report)
    }

    /// Visit every ASIC once. Only fails when cancelled.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        for (name, asic) in &self.asics {
            // In-flight pings, queries and publishes are abandoned on cancel
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::cancelled("poll cycle")),
                polled = self.visit(name, asic, &mut report) => polled,
            };

            if polled {
                pause(self.polling.asic_delay, cancel).await?;
            }
        }

        Ok(report)
    }

    /// Probe and poll one entry; false when it was skipped
    async fn visit(&self, name: &str, asic: &AsicConfig, report: &mut CycleReport) -> bool {
        let Some(endpoint) = self.endpoint(name, asic, report).await else {
            return false;
        };

        let topic = asic.topic.as_deref().unwrap_or_default();
        let span = info_span!("asic", name = %endpoint.name, kind = %endpoint.kind);
        self.poll_asic(&endpoint, topic, report).instrument(span).await;
        true
    }

    /// Resolve a config entry into something pollable, or log why not
    async fn endpoint(
        &self,
        name: &str,
        asic: &AsicConfig,
        report: &mut CycleReport,
    ) -> Option<AsicEndpoint> {
        if !asic.is_complete() {
            warn!("Incomplete configuration for ASIC {}", name);
            report.skipped += 1;
            return None;
        }

        let host = asic.ip.clone().unwrap_or_default();
        if !self.probe.is_available(&host).await {
            warn!("ASIC {} ({}) is unavailable", name, host);
            report.skipped += 1;
            return None;
        }

        info!("Processing ASIC {} ({})", name, host);

        let Some(kind) = asic.resolve_kind(name) else {
            warn!("Unknown type of ASIC {}; name it after its vendor or set 'kind'", name);
            report.skipped += 1;
            return None;
        };

        Some(AsicEndpoint {
            name: name.to_string(),
            kind,
            host,
            port: asic.port,
        })
    }

    async fn poll_asic(&self, endpoint: &AsicEndpoint, topic: &str, report: &mut CycleReport) {
        let readings = match miner::fetch_telemetry(&self.api, endpoint).await {
            Ok(readings) => readings,
            Err(e) => {
                error!(
                    category = e.category(),
                    "Failed to get data from {} {}: {}", endpoint.kind, endpoint.host, e
                );
                report.failed += 1;
                return;
            }
        };
        report.polled += 1;

        for reading in readings {
            if !publish::is_publishable(&reading.payload) {
                debug!("Nothing to publish for {}", reading.command);
                continue;
            }
            let subtopic = format!("{}/{}", topic, reading.command);
            self.send(&subtopic, &reading.payload.to_string(), report).await;
        }

        if let Some(firmware) = miner::firmware_version(&self.api, endpoint).await {
            debug!("Firmware {:?} normalized to {}", firmware.raw, firmware.version);
            match serde_json::to_string(&VersionPayload::new(&firmware, Utc::now())) {
                Ok(payload) => {
                    self.send(&format!("{}/version", topic), &payload, report)
                        .await
                }
                Err(e) => error!("Cannot encode version payload: {}", e),
            }
        }
    }

    async fn send(&self, topic: &str, payload: &str, report: &mut CycleReport) {
        match self.publisher.publish(topic, payload).await {
            Ok(()) => {
                debug!("Published {}", topic);
                report.published += 1;
            }
            Err(e) if e.is_retryable() => {
                warn!("Publishing to {} failed, will retry next cycle: {}", topic, e);
                report.failed += 1;
            }
            Err(e) => {
                error!("Publishing to {} failed: {}", topic, e);
                report.failed += 1;
            }
        }
    }
}

/// Sleep unless cancelled first
async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::cancelled("poll pause")),
        _ = sleep(duration) => Ok(()),
    }
}
