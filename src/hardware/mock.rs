//! Simulated Controller Channel
//!
//! Provides a controller channel for running the service without hardware.
//! All state lives behind a `parking_lot::Mutex`; no call ever sleeps.
//!
//! # Behavior
//!
//! - Set point writes take effect immediately
//! - While the control loop is enabled every `read_actual_value` moves the
//!   actual value a fixed fraction (`response`) towards the set point
//! - Optional uniform read noise on the actual value (`noise`)
//! - Optional fault injection: reads fail after N successful reads

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;

use crate::hardware::capabilities::ControllerChannel;

#[derive(Debug)]
struct SimulatedState {
    set_point: f64,
    actual: f64,
    loop_enabled: bool,
    reads: u64,
}

/// Simulated controller channel with a first-order loop response
///
/// # Example
///
/// ```rust,ignore
/// let channel = SimulatedControllerChannel::new("Reactor_Temperature", 25.0, 20.0)
///     .with_response(0.2);
/// channel.enable_control_loop(true).await?;
/// let actual = channel.read_actual_value().await?; // 21.0
/// ```
#[derive(Debug)]
pub struct SimulatedControllerChannel {
    name: String,
    state: Mutex<SimulatedState>,
    response: f64,
    noise: f64,
    fail_after_reads: Option<u64>,
}

impl SimulatedControllerChannel {
    /// Create a channel with the given initial set point and actual value
    pub fn new(name: impl Into<String>, set_point: f64, actual: f64) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SimulatedState {
                set_point,
                actual,
                loop_enabled: false,
                reads: 0,
            }),
            response: 0.1,
            noise: 0.0,
            fail_after_reads: None,
        }
    }

    /// Fraction of the remaining error corrected per read (clamped to 0..=1)
    pub fn with_response(mut self, response: f64) -> Self {
        self.response = response.clamp(0.0, 1.0);
        self
    }

    /// Peak amplitude of uniform noise added to each actual value reading
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude.abs();
        self
    }

    /// Make every read fail once `count` reads have succeeded
    pub fn fail_after_reads(mut self, count: u64) -> Self {
        self.fail_after_reads = Some(count);
        self
    }

    /// Whether the simulated control loop is running
    pub fn is_loop_enabled(&self) -> bool {
        self.state.lock().loop_enabled
    }

    /// Force the actual value (simulates a process disturbance)
    pub fn set_actual_value(&self, value: f64) {
        self.state.lock().actual = value;
    }

    fn count_read(&self, state: &mut SimulatedState) -> Result<()> {
        if let Some(limit) = self.fail_after_reads {
            if state.reads >= limit {
                return Err(anyhow!("{}: communication lost", self.name));
            }
        }
        state.reads += 1;
        Ok(())
    }
}

#[async_trait]
impl ControllerChannel for SimulatedControllerChannel {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn get_set_point(&self) -> Result<f64> {
        let mut state = self.state.lock();
        self.count_read(&mut state)?;
        Ok(state.set_point)
    }

    async fn read_actual_value(&self) -> Result<f64> {
        let mut state = self.state.lock();
        self.count_read(&mut state)?;

        if state.loop_enabled {
            state.actual += (state.set_point - state.actual) * self.response;
        }

        if self.noise > 0.0 {
            let jitter = rand::thread_rng().gen_range(-self.noise..=self.noise);
            Ok(state.actual + jitter)
        } else {
            Ok(state.actual)
        }
    }

    async fn write_set_point(&self, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(anyhow!("{}: set point must be finite, got {}", self.name, value));
        }
        self.state.lock().set_point = value;
        Ok(())
    }

    async fn enable_control_loop(&self, enable: bool) -> Result<()> {
        self.state.lock().loop_enabled = enable;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loop_converges_toward_set_point() {
        let channel = SimulatedControllerChannel::new("Reactor_Temperature", 30.0, 20.0)
            .with_response(0.5);

        // Loop disabled: actual value stays put
        assert_eq!(channel.read_actual_value().await.unwrap(), 20.0);

        channel.enable_control_loop(true).await.unwrap();
        assert!(channel.is_loop_enabled());
        assert_eq!(channel.read_actual_value().await.unwrap(), 25.0);
        assert_eq!(channel.read_actual_value().await.unwrap(), 27.5);

        channel.enable_control_loop(false).await.unwrap();
        assert_eq!(channel.read_actual_value().await.unwrap(), 27.5);
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let channel = SimulatedControllerChannel::new("Idle_Ctrl", 0.0, 0.0);
        channel.enable_control_loop(false).await.unwrap();
        channel.enable_control_loop(false).await.unwrap();
        assert!(!channel.is_loop_enabled());
    }

    #[tokio::test]
    async fn test_noise_stays_within_amplitude() {
        let channel = SimulatedControllerChannel::new("Noisy_Ctrl", 10.0, 10.0).with_noise(0.01);
        for _ in 0..50 {
            let value = channel.read_actual_value().await.unwrap();
            assert!((value - 10.0).abs() <= 0.01);
        }
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let channel = SimulatedControllerChannel::new("Flaky_Ctrl", 1.0, 1.0).fail_after_reads(2);
        assert!(channel.get_set_point().await.is_ok());
        assert!(channel.read_actual_value().await.is_ok());
        let err = channel.get_set_point().await.unwrap_err();
        assert!(err.to_string().contains("communication lost"));
    }

    #[tokio::test]
    async fn test_rejects_non_finite_set_point() {
        let channel = SimulatedControllerChannel::new("Reactor_Temperature", 1.0, 1.0);
        assert!(channel.write_set_point(f64::NAN).await.is_err());
        assert_eq!(channel.get_set_point().await.unwrap(), 1.0);
    }
}
