//! asic2mqtt - ASIC telemetry to MQTT bridge

use anyhow::Context;
use asic2mqtt::{
    logging,
    miner::CgminerClient,
    probe::PingProbe,
    publish::{MqttPublisher, Publisher},
    Args, Config, Error, Poller, APP_DESCRIPTION, APP_NAME, APP_VERSION,
};
use clap::Parser;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    if args.info {
        print_info();
        return Ok(ExitCode::SUCCESS);
    }

    let config = match Config::load(&args.config).await {
        Ok(config) => config,
        Err(e @ Error::ConfigNotFound { .. }) => {
            eprintln!("{}", e);
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => {
            eprintln!("Error loading {}: {}", args.config.display(), e);
            return Ok(ExitCode::FAILURE);
        }
    };

    if args.check_config {
        println!("{}", config.summary());
        return Ok(match config.check() {
            Ok(()) => {
                println!("Configuration OK");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Configuration invalid: {}", e);
                ExitCode::FAILURE
            }
        });
    }

    let _logging = logging::init(&config.logging, args.verbose);
    info!("Starting {} v{}", APP_NAME, APP_VERSION);

    let publisher = MqttPublisher::new(&config.mqtt);
    if let Err(e) = publisher.connect().await {
        error!("Failed to connect to MQTT broker: {}", e);
        return Ok(ExitCode::FAILURE);
    }

    let poller = Poller::new(
        &config,
        CgminerClient::new(config.polling.request_timeout),
        publisher,
        PingProbe::new(config.polling.ping_timeout),
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupted, shutting down"),
                Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
            }
            cancel.cancel();
        }
    });

    if args.once {
        if let Err(e) = poller.run_once(&cancel).await {
            info!("Cycle interrupted: {}", e);
        }
    } else {
        poller.run(cancel).await;
    }

    poller
        .publisher()
        .disconnect()
        .await
        .context("disconnecting from MQTT broker")?;
    info!("Shutdown complete");

    Ok(ExitCode::SUCCESS)
}

fn print_info() {
    println!("{} v{}", APP_NAME, APP_VERSION);
    println!("{}", APP_DESCRIPTION);
}
