//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/control_loop.toml`)
//! 2. Environment variables prefixed with `CONTROL_LOOP_`, nested keys
//!    separated by `__` (e.g. `CONTROL_LOOP_SAMPLING__POLL_INTERVAL_MS=50`)
//!
//! Every section has defaults, so an empty file is a valid configuration.
//!
//! # Example
//! ```no_run
//! use control_loop_service::config::ServiceConfig;
//!
//! let config = ServiceConfig::load_from("config/control_loop.toml")?;
//! config.validate()?;
//! println!("Server: {}", config.server.name);
//! # Ok::<(), control_loop_service::error::ControlLoopError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ControlLoopError, ServiceResult};
use crate::hardware::capabilities::ControllerChannel;
use crate::hardware::device::{group_channels, ControllerDevice};
use crate::hardware::mock::SimulatedControllerChannel;
use crate::sampler::Tolerance;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/control_loop.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Server identity reported to clients
    pub server: ServerInfo,
    /// Background sampling
    pub sampling: SamplingConfig,
    /// Simulated channels used when no vendor SDK is available
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Server identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    /// Server name
    pub name: String,
    /// Server type
    pub server_type: String,
    /// Free-text description
    pub description: String,
    /// Server version
    pub version: String,
    /// Vendor URL
    pub vendor_url: String,
    /// Stable server UUID; a random one is generated when absent
    pub uuid: Option<Uuid>,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: "Control Loop Service".to_string(),
            server_type: "TestServer".to_string(),
            description: "Remote control of reaction module controller channels".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            vendor_url: "https://www.cetoni.com".to_string(),
            uuid: None,
        }
    }
}

impl ServerInfo {
    /// Configured UUID or a freshly generated one
    pub fn uuid_or_random(&self) -> Uuid {
        self.uuid.unwrap_or_else(Uuid::new_v4)
    }
}

/// Background sampling configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Interval between two polls of the same value in milliseconds
    pub poll_interval_ms: u64,
    /// Relative tolerance for change detection
    pub relative_tolerance: f64,
    /// Absolute tolerance for change detection
    pub absolute_tolerance: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        let tolerance = Tolerance::default();
        Self {
            poll_interval_ms: 100,
            relative_tolerance: tolerance.relative,
            absolute_tolerance: tolerance.absolute,
        }
    }
}

impl SamplingConfig {
    /// Poll interval as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Change detection tolerance
    pub fn tolerance(&self) -> Tolerance {
        Tolerance {
            relative: self.relative_tolerance,
            absolute: self.absolute_tolerance,
        }
    }
}

/// Simulated hardware
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Channels in index order
    pub channels: Vec<SimulatedChannelConfig>,
    /// Names of already known devices (e.g. pumps) that may own channels
    pub host_devices: Vec<String>,
}

/// One simulated controller channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedChannelConfig {
    /// Channel name
    pub name: String,
    /// Initial set point
    #[serde(default)]
    pub set_point: f64,
    /// Initial actual value
    #[serde(default)]
    pub actual_value: f64,
    /// Fraction of the error corrected per read while the loop runs
    #[serde(default = "default_response")]
    pub response: f64,
    /// Read noise amplitude
    #[serde(default)]
    pub noise: f64,
}

fn default_response() -> f64 {
    0.1
}

impl SimulationConfig {
    /// Build the configured simulated channels
    pub fn build_channels(&self) -> Vec<Arc<dyn ControllerChannel>> {
        self.channels
            .iter()
            .map(|c| {
                Arc::new(
                    SimulatedControllerChannel::new(c.name.clone(), c.set_point, c.actual_value)
                        .with_response(c.response)
                        .with_noise(c.noise),
                ) as Arc<dyn ControllerChannel>
            })
            .collect()
    }

    /// Build the configured channels grouped into devices
    pub fn build_devices(&self) -> Vec<ControllerDevice> {
        let hosts: Vec<&str> = self.host_devices.iter().map(String::as_str).collect();
        group_channels(self.build_channels(), &hosts)
    }
}

impl ServiceConfig {
    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ServiceResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CONTROL_LOOP_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> ServiceResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ControlLoopError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.sampling.poll_interval_ms == 0 {
            return Err(ControlLoopError::Configuration(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("relative_tolerance", self.sampling.relative_tolerance),
            ("absolute_tolerance", self.sampling.absolute_tolerance),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ControlLoopError::Configuration(format!(
                    "{name} must be a finite, non-negative number, got {value}"
                )));
            }
        }

        let mut names = HashSet::new();
        for channel in &self.simulation.channels {
            if !names.insert(channel.name.as_str()) {
                return Err(ControlLoopError::Configuration(format!(
                    "Duplicate channel name: {}",
                    channel.name
                )));
            }
        }

        Ok(())
    }
}
