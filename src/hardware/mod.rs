//! Hardware seam: controller channel capability, composite devices and a
//! simulated channel for running without a vendor SDK.

pub mod capabilities;
pub mod device;
pub mod mock;

pub use capabilities::{ControllerChannel, TrackedValue};
pub use device::{group_channels, ControllerDevice, HasControllerChannels};
pub use mock::SimulatedControllerChannel;
