//! asic2mqtt
//!
//! Polls ASIC miners (Antminer and Whatsminer) over their JSON APIs and
//! republishes the raw telemetry, plus a normalized firmware version, to an
//! MQTT broker.

pub mod config;
pub mod error;
pub mod logging;
pub mod miner;
pub mod poller;
pub mod probe;
pub mod publish;
pub mod version;

pub use config::{Args, Config};
pub use error::{Error, Result};
pub use poller::{CycleReport, Poller};

/// Application information
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
