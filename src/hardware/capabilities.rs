//! Controller Channel Capabilities
//!
//! A controller channel is one independently controllable control loop on a
//! device (a thermostat zone, a reaction loop, a dosing controller). The loop
//! itself runs on the device; this crate only reads its live values and sends
//! it commands. Vendor SDK handles implement [`ControllerChannel`]; everything
//! above this seam works against `Arc<dyn ControllerChannel>`.
//!
//! # Design Philosophy
//!
//! Like the other capability traits in this crate, the channel trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for hardware errors
//!
//! Vendor SDK calls are usually synchronous; implementations wrapping them
//! should hop onto `tokio::task::spawn_blocking` if a call can stall.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability: Control Loop Channel
///
/// # Contract
/// - `get_set_point` returns the set point currently active on the device
/// - `read_actual_value` performs a fresh reading of the controlled quantity
/// - `write_set_point` takes effect on the device immediately
/// - `enable_control_loop(false)` on a stopped loop is a no-op, not an error
///
/// # Thread Safety
/// - All methods take `&self`; use interior mutability for state
#[async_trait]
pub trait ControllerChannel: Send + Sync {
    /// Channel name as reported by the device (e.g. `Reactor_Temperature`)
    fn name(&self) -> String;

    /// Current set point
    async fn get_set_point(&self) -> Result<f64>;

    /// Current measured (actual) value
    async fn read_actual_value(&self) -> Result<f64>;

    /// Write a new set point
    async fn write_set_point(&self, value: f64) -> Result<()>;

    /// Start (`true`) or stop (`false`) the on-device control loop
    async fn enable_control_loop(&self, enable: bool) -> Result<()>;
}

/// The two live values sampled for every channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrackedValue {
    /// The set point the loop regulates towards
    SetPoint,
    /// The measured value of the controlled quantity
    Measured,
}

impl TrackedValue {
    /// Both kinds, in sampler start order
    pub const ALL: [TrackedValue; 2] = [TrackedValue::SetPoint, TrackedValue::Measured];

    /// Read this value from `channel`
    pub async fn read_from(self, channel: &dyn ControllerChannel) -> Result<f64> {
        match self {
            TrackedValue::SetPoint => channel.get_set_point().await,
            TrackedValue::Measured => channel.read_actual_value().await,
        }
    }

    /// Name of the observable property that publishes this value
    pub fn property_name(self) -> &'static str {
        match self {
            TrackedValue::SetPoint => "SetPointValue",
            TrackedValue::Measured => "ControllerValue",
        }
    }

    /// Name of the channel operation used to read this value
    pub fn read_operation(self) -> &'static str {
        match self {
            TrackedValue::SetPoint => "get_set_point",
            TrackedValue::Measured => "read_actual_value",
        }
    }
}

impl fmt::Display for TrackedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackedValue::SetPoint => write!(f, "set point"),
            TrackedValue::Measured => write!(f, "measured value"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FixedChannel {
        set_point: Mutex<f64>,
        loop_enabled: Mutex<bool>,
    }

    #[async_trait]
    impl ControllerChannel for FixedChannel {
        fn name(&self) -> String {
            "Fixed_Ctrl".to_string()
        }

        async fn get_set_point(&self) -> Result<f64> {
            Ok(*self.set_point.lock().unwrap())
        }

        async fn read_actual_value(&self) -> Result<f64> {
            Ok(21.5)
        }

        async fn write_set_point(&self, value: f64) -> Result<()> {
            *self.set_point.lock().unwrap() = value;
            Ok(())
        }

        async fn enable_control_loop(&self, enable: bool) -> Result<()> {
            *self.loop_enabled.lock().unwrap() = enable;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_tracked_value_reads_matching_getter() {
        let channel = FixedChannel {
            set_point: Mutex::new(40.0),
            loop_enabled: Mutex::new(false),
        };

        assert_eq!(TrackedValue::SetPoint.read_from(&channel).await.unwrap(), 40.0);
        assert_eq!(TrackedValue::Measured.read_from(&channel).await.unwrap(), 21.5);

        channel.write_set_point(55.0).await.unwrap();
        assert_eq!(TrackedValue::SetPoint.read_from(&channel).await.unwrap(), 55.0);

        channel.enable_control_loop(true).await.unwrap();
        assert!(*channel.loop_enabled.lock().unwrap());
    }

    #[test]
    fn test_property_names() {
        assert_eq!(TrackedValue::SetPoint.property_name(), "SetPointValue");
        assert_eq!(TrackedValue::Measured.property_name(), "ControllerValue");
    }
}
