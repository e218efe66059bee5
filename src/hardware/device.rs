//! Composite controller devices.
//!
//! Channels arrive already enumerated from the vendor SDK as a flat list. A
//! physical device may own several of them, and some channels belong to a
//! device that is already known under another role (a pump with an integrated
//! pressure controller). [`group_channels`] assigns each channel to a device by
//! name:
//!
//! 1. The standalone devices created so far, then the known host devices, are
//!    searched in that order for one whose name (minus a trailing `_Pump`)
//!    occurs in the channel name. The channel joins the first match, so
//!    `Reactor2_Ctrl` joins an existing `Reactor` device.
//! 2. Without a match a new standalone device is created, named after the
//!    channel with its controller suffix (`_Temperature`, `_ReactionLoop`,
//!    `_ReactorZone`, `_Ctrl` with an optional digit) stripped.

use regex::Regex;
use std::sync::{Arc, OnceLock};

use crate::hardware::capabilities::ControllerChannel;

/// Capability: owns zero or more controller channels
pub trait HasControllerChannels {
    /// Device name
    fn name(&self) -> &str;

    /// Channels in the order they were enumerated
    fn controller_channels(&self) -> &[Arc<dyn ControllerChannel>];
}

/// A device that exposes controller channels
#[derive(Clone)]
pub enum ControllerDevice {
    /// Channels attached to a device known under another role (e.g. a pump)
    Hosted {
        /// Name of the host device
        name: String,
        /// Channels found for the host
        channels: Vec<Arc<dyn ControllerChannel>>,
    },
    /// A device that only consists of controller channels
    Standalone {
        /// Name derived from the channel names
        name: String,
        /// Channels of the device
        channels: Vec<Arc<dyn ControllerChannel>>,
    },
}

impl ControllerDevice {
    fn channels_mut(&mut self) -> &mut Vec<Arc<dyn ControllerChannel>> {
        match self {
            ControllerDevice::Hosted { channels, .. }
            | ControllerDevice::Standalone { channels, .. } => channels,
        }
    }

    /// Whether the device was created from a known host device
    pub fn is_hosted(&self) -> bool {
        matches!(self, ControllerDevice::Hosted { .. })
    }
}

impl HasControllerChannels for ControllerDevice {
    fn name(&self) -> &str {
        match self {
            ControllerDevice::Hosted { name, .. } | ControllerDevice::Standalone { name, .. } => {
                name
            }
        }
    }

    fn controller_channels(&self) -> &[Arc<dyn ControllerChannel>] {
        match self {
            ControllerDevice::Hosted { channels, .. }
            | ControllerDevice::Standalone { channels, .. } => channels,
        }
    }
}

impl std::fmt::Debug for ControllerDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.controller_channels().iter().map(|c| c.name()).collect();
        f.debug_struct(if self.is_hosted() { "Hosted" } else { "Standalone" })
            .field("name", &self.name())
            .field("channels", &names)
            .finish()
    }
}

#[allow(clippy::expect_used)]
fn suffix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(.*)(?:_Temperature|_ReactionLoop|_ReactorZone|_Ctrl\d?$)")
            .expect("static controller suffix pattern")
    })
}

/// Device name for a channel that matches no host device
pub fn standalone_device_name(channel_name: &str) -> &str {
    suffix_pattern()
        .captures(channel_name)
        .and_then(|caps| caps.get(1))
        .map_or(channel_name, |m| m.as_str())
}

/// Name stem matched against channel names
fn device_stem(device_name: &str) -> &str {
    device_name
        .rsplit_once("_Pump")
        .map_or(device_name, |(stem, _)| stem)
}

/// Group enumerated channels into devices
///
/// `host_names` are the names of devices already known to the application.
/// Hosted devices come first (in `host_names` order, only those that received
/// a channel), followed by standalone devices in order of creation.
pub fn group_channels(
    channels: Vec<Arc<dyn ControllerChannel>>,
    host_names: &[&str],
) -> Vec<ControllerDevice> {
    let mut hosted: Vec<ControllerDevice> = host_names
        .iter()
        .map(|name| ControllerDevice::Hosted {
            name: (*name).to_string(),
            channels: Vec::new(),
        })
        .collect();
    let mut standalone: Vec<ControllerDevice> = Vec::new();

    for channel in channels {
        let channel_name = channel.name();

        let owner = standalone
            .iter_mut()
            .chain(hosted.iter_mut())
            .find(|device| channel_name.contains(device_stem(device.name())));
        if let Some(device) = owner {
            tracing::debug!(channel = %channel_name, device = %device.name(), "Channel belongs to device");
            device.channels_mut().push(channel);
            continue;
        }

        let device_name = standalone_device_name(&channel_name).to_string();
        tracing::debug!(channel = %channel_name, device = %device_name, "Standalone controller device");
        standalone.push(ControllerDevice::Standalone {
            name: device_name,
            channels: vec![channel],
        });
    }

    hosted.retain(|device| !device.controller_channels().is_empty());
    hosted.extend(standalone);
    hosted
}
