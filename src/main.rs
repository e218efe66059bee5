//! CLI Entry Point for the control loop service
//!
//! Runs the service over simulated controller channels so the sampling and
//! dispatch path can be exercised without a vendor SDK.
//!
//! # Usage
//!
//! Run with the channels from a config file, logging every pushed value:
//! ```bash
//! control-loop-service run --config config/control_loop.toml
//! ```
//!
//! Channels are grouped into devices and each device gets its own service.
//!
//! Print server identity, the devices and their channel-scoped operations:
//! ```bash
//! control-loop-service describe --channels 3
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use control_loop_service::config::{ServiceConfig, SimulatedChannelConfig, DEFAULT_CONFIG_PATH};
use control_loop_service::hardware::{ControllerDevice, HasControllerChannels, TrackedValue};
use control_loop_service::logging::{self, OutputFormat, TracingConfig};
use control_loop_service::metadata::{CallMetadata, CHANNEL_INDEX_METADATA};
use control_loop_service::ControlLoopService;
use futures::StreamExt;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "control-loop-service")]
#[command(about = "Remote control of laboratory controller channels", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Number of simulated channels when the config defines none
    #[arg(long, global = true, default_value_t = 2)]
    channels: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start sampling and log every value pushed to the delivery queues
    Run {
        /// Log output format (pretty, compact, json)
        #[arg(long, default_value = "compact")]
        log_format: OutputFormat,

        /// Start every control loop after startup
        #[arg(long)]
        run_loops: bool,
    },

    /// Print server identity and operation catalogue as JSON
    Describe,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServiceConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if config.simulation.channels.is_empty() {
        config.simulation.channels = default_channels(cli.channels);
    }
    config.validate()?;

    match cli.command {
        Commands::Run {
            log_format,
            run_loops,
        } => run(config, log_format, run_loops).await,
        Commands::Describe => describe(config).await,
    }
}

fn default_channels(count: usize) -> Vec<SimulatedChannelConfig> {
    (0..count)
        .map(|i| SimulatedChannelConfig {
            name: format!("Simulated_Ctrl{}", i),
            set_point: 25.0 + 5.0 * i as f64,
            actual_value: 20.0,
            response: 0.05,
            noise: 0.0,
        })
        .collect()
}

/// One running service per grouped device
async fn start_devices(config: &ServiceConfig) -> Result<Vec<(ControllerDevice, ControlLoopService)>> {
    let mut services = Vec::new();
    for device in config.simulation.build_devices() {
        info!(device = %device.name(), channels = device.controller_channels().len(), "Creating service");
        let service =
            ControlLoopService::start(device.controller_channels().to_vec(), config.sampling)
                .await
                .with_context(|| format!("starting service for {}", device.name()))?;
        services.push((device, service));
    }
    Ok(services)
}

async fn run(config: ServiceConfig, log_format: OutputFormat, run_loops: bool) -> Result<()> {
    let tracing_config = TracingConfig::from_service_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(log_format);
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    info!(
        server = %config.server.name,
        uuid = %config.server.uuid_or_random(),
        version = %config.server.version,
        "Starting"
    );

    let services = start_devices(&config).await?;

    let mut drains = Vec::new();
    for (device, service) in &services {
        for index in 0..service.channel_count() {
            let metadata = CallMetadata::channel(index as i64);
            if run_loops {
                service.run_control_loop(&metadata).await?;
            }
            for kind in TrackedValue::ALL {
                let stream = service.bind_subscription(kind, &metadata, None)?.into_stream();
                let device_name = device.name().to_string();
                drains.push(tokio::spawn(async move {
                    futures::pin_mut!(stream);
                    while let Some(value) = stream.next().await {
                        info!(device = %device_name, channel = index, property = kind.property_name(), value, "Update");
                    }
                }));
            }
        }
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutting down");

    for (device, service) in &services {
        for fault in service.shutdown().await {
            warn!(device = %device.name(), %fault, "Sampler fault");
        }
    }
    for drain in drains {
        drain.abort();
    }
    Ok(())
}

async fn describe(config: ServiceConfig) -> Result<()> {
    let services = start_devices(&config).await?;

    let devices: Vec<serde_json::Value> = services
        .iter()
        .map(|(device, service)| {
            let scoped: Vec<String> = service
                .metadata_scoped_operations()
                .into_iter()
                .map(|op| op.fully_qualified_identifier())
                .collect();
            let channels: Vec<String> = device.controller_channels().iter().map(|c| c.name()).collect();
            serde_json::json!({
                "name": device.name(),
                "hosted": device.is_hosted(),
                "channels": channels,
                "number_of_channels": service.channel_count(),
                "affected_by_metadata": scoped,
            })
        })
        .collect();

    let description = serde_json::json!({
        "server": config.server,
        "metadata": CHANNEL_INDEX_METADATA,
        "devices": devices,
    });

    for (_, service) in &services {
        service.stop();
    }
    println!("{}", serde_json::to_string_pretty(&description)?);
    Ok(())
}
