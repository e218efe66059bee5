//! # Control Loop Service
//!
//! Exposes the controller channels of a laboratory device (thermostat zones,
//! reaction loops, pressure controllers) to a remote procedure layer. The
//! control loops themselves run on the device; this crate:
//!
//! - samples the set point and the measured value of every channel in the
//!   background and queues each change for subscribers,
//! - routes channel-scoped commands (write set point, run/stop loop) to the
//!   channel selected by the caller's `ChannelIndex` metadata,
//! - shuts its samplers down through one shared stop signal.
//!
//! Wire encoding, sessions and the command catalogue are the protocol layer's
//! job; it calls into [`service::ControlLoopService`] and drains the
//! [`queue::DeliveryQueue`]s it receives.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: the `ControllerChannel` capability trait, composite
//!   devices and a simulated channel.
//! - **`sampler`**: generic poll/compare/push sampler, tolerance and stop signal.
//! - **`queue`**: delivery queues and their rebindable slots.
//! - **`metadata`**: channel index resolution and the operation catalogue.
//! - **`service`**: the dispatcher and sampler lifecycle.
//! - **`config`** / **`logging`** / **`error`**: ambient configuration (figment),
//!   tracing setup and the crate error type.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use control_loop_service::config::SamplingConfig;
//! use control_loop_service::hardware::{ControllerChannel, SimulatedControllerChannel};
//! use control_loop_service::metadata::CallMetadata;
//! use control_loop_service::service::ControlLoopService;
//!
//! # async fn demo() -> control_loop_service::error::ServiceResult<()> {
//! let channels: Vec<Arc<dyn ControllerChannel>> = vec![
//!     Arc::new(SimulatedControllerChannel::new("Reactor_Temperature", 25.0, 20.0)),
//! ];
//! let service = ControlLoopService::start(channels, SamplingConfig::default()).await?;
//!
//! let updates = service.bind_measured_value_subscription(&CallMetadata::channel(0))?;
//! service.write_set_point(40.0, &CallMetadata::channel(0)).await?;
//! service.run_control_loop(&CallMetadata::channel(0)).await?;
//! println!("current value: {}", updates.recv().await);
//!
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod metadata;
pub mod queue;
pub mod sampler;
pub mod service;

pub use error::{ControlLoopError, ServiceResult};
pub use metadata::CallMetadata;
pub use service::ControlLoopService;
