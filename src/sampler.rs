//! Change-detecting samplers.
//!
//! The controller SDK only offers synchronous getters, so value changes are
//! detected by polling: a [`Sampler`] reads its [`PolledSource`] at a fixed
//! interval, compares the reading with the last observed value using a
//! [`Tolerance`], and pushes the reading into its [`DeliverySlot`] when the two
//! differ. The sampler is generic over the source; the service runs one per
//! (channel, [`TrackedValue`]).
//!
//! # Cancellation
//!
//! All samplers share one [`StopSignal`]. It is checked once at the top of each
//! iteration; a sampler may finish the poll that is in flight when the signal
//! is set, and exits at the next poll boundary. Setting the signal also wakes a
//! sampler sleeping between polls.
//!
//! # Failure
//!
//! A failed read ends that sampler with [`ControlLoopError::Hardware`]. There is
//! no retry; other samplers are unaffected. A sampler given a [`SamplerStatus`]
//! records how it ended there, readable while the rest of the service runs.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, trace};

use crate::error::{ControlLoopError, ServiceResult};
use crate::hardware::capabilities::{ControllerChannel, TrackedValue};
use crate::queue::DeliverySlot;

/// Default interval between two polls of the same value
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Approximate floating-point equality, `math.isclose` style.
///
/// Two values are close when `|a - b| <= max(relative * max(|a|, |b|), absolute)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    /// Relative tolerance
    pub relative: f64,
    /// Absolute tolerance (matters for values near zero)
    pub absolute: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            relative: 1e-9,
            absolute: 0.0,
        }
    }
}

impl Tolerance {
    /// Purely relative tolerance
    pub fn relative(relative: f64) -> Self {
        Self {
            relative,
            absolute: 0.0,
        }
    }

    /// Whether `a` and `b` count as the same value
    pub fn is_close(&self, a: f64, b: f64) -> bool {
        if a == b {
            return true;
        }
        if !a.is_finite() || !b.is_finite() {
            return false;
        }
        let diff = (a - b).abs();
        diff <= (self.relative * a.abs().max(b.abs())).max(self.absolute)
    }
}

/// A value that can be polled.
#[async_trait]
pub trait PolledSource: Send + Sync {
    /// Take one reading
    async fn sample(&self) -> anyhow::Result<f64>;
}

/// One tracked value of one controller channel.
#[derive(Clone)]
pub struct ChannelSource {
    channel: Arc<dyn ControllerChannel>,
    kind: TrackedValue,
}

impl ChannelSource {
    /// Source reading `kind` from `channel`
    pub fn new(channel: Arc<dyn ControllerChannel>, kind: TrackedValue) -> Self {
        Self { channel, kind }
    }
}

#[async_trait]
impl PolledSource for ChannelSource {
    async fn sample(&self) -> anyhow::Result<f64> {
        self.kind.read_from(self.channel.as_ref()).await
    }
}

/// Process-wide cooperative stop signal.
#[derive(Debug, Clone)]
pub struct StopSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// Create an unset signal
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Set the signal. Returns `true` only for the call that set it.
    pub fn set(&self) -> bool {
        self.sender.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        })
    }

    /// Whether the signal has been set
    pub fn is_set(&self) -> bool {
        *self.sender.borrow()
    }

    /// Receiver for tasks that want to wait on the signal
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

/// Lifecycle state of one sampler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SamplerState {
    /// Polling
    #[default]
    Running,
    /// Exited after the stop signal
    Stopped,
    /// Ended by an error; holds its message
    Faulted(String),
}

impl SamplerState {
    /// Whether the sampler ended with an error
    pub fn is_faulted(&self) -> bool {
        matches!(self, SamplerState::Faulted(_))
    }
}

/// Shared cell holding a sampler's current [`SamplerState`].
#[derive(Debug, Default)]
pub struct SamplerStatus {
    state: RwLock<SamplerState>,
}

impl SamplerStatus {
    /// New status in the `Running` state
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn get(&self) -> SamplerState {
        self.state.read().clone()
    }

    /// Record a terminal state. A fault is never overwritten.
    pub fn finish(&self, state: SamplerState) {
        let mut current = self.state.write();
        if !current.is_faulted() {
            *current = state;
        }
    }
}

/// Background poll-compare-push loop for one value.
pub struct Sampler<S> {
    source: S,
    target: Arc<DeliverySlot>,
    tolerance: Tolerance,
    interval: Duration,
    last: Option<f64>,
    channel: usize,
    kind: TrackedValue,
    status: Option<Arc<SamplerStatus>>,
}

impl<S: PolledSource> Sampler<S> {
    /// Create a sampler for `kind` of channel `channel` pushing into `target`
    pub fn new(source: S, target: Arc<DeliverySlot>, channel: usize, kind: TrackedValue) -> Self {
        Self {
            source,
            target,
            tolerance: Tolerance::default(),
            interval: DEFAULT_POLL_INTERVAL,
            last: None,
            channel,
            kind,
            status: None,
        }
    }

    /// Comparison tolerance
    pub fn with_tolerance(mut self, tolerance: Tolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Interval between polls
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Last value already delivered, so the first poll only pushes on change
    pub fn with_baseline(mut self, value: f64) -> Self {
        self.last = Some(value);
        self
    }

    /// Cell that receives the sampler's terminal state
    pub fn with_status(mut self, status: Arc<SamplerStatus>) -> Self {
        self.status = Some(status);
        self
    }

    /// Last observed value
    pub fn last_observed(&self) -> Option<f64> {
        self.last
    }

    /// Take one reading and push it if it differs from the last one.
    ///
    /// The very first reading without a baseline only sets the baseline.
    /// Returns whether a value was pushed.
    pub async fn poll_once(&mut self) -> ServiceResult<bool> {
        let value = self.source.sample().await.map_err(|source| {
            ControlLoopError::hardware(self.channel, self.kind.read_operation(), source)
        })?;

        match self.last {
            None => {
                self.last = Some(value);
                Ok(false)
            }
            Some(previous) if self.tolerance.is_close(previous, value) => Ok(false),
            Some(_) => {
                self.last = Some(value);
                self.target.push(value);
                trace!(channel = self.channel, kind = %self.kind, value, "Pushed changed value");
                Ok(true)
            }
        }
    }

    /// Poll until `stop` is set or a read fails.
    pub async fn run(mut self, stop: StopSignal) -> ServiceResult<()> {
        let mut stopped = stop.subscribe();
        while !stop.is_set() {
            if let Err(err) = self.poll_once().await {
                error!(channel = self.channel, kind = %self.kind, error = %err, "Sampler stopped after read failure");
                self.finish(SamplerState::Faulted(err.to_string()));
                return Err(err);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = stopped.changed() => {}
            }
        }
        trace!(channel = self.channel, kind = %self.kind, "Sampler observed stop signal");
        self.finish(SamplerState::Stopped);
        Ok(())
    }

    fn finish(&self, state: SamplerState) {
        if let Some(status) = &self.status {
            status.finish(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Source replaying a fixed script, repeating its last value afterwards
    struct Scripted {
        values: Mutex<VecDeque<f64>>,
        last: Mutex<f64>,
    }

    impl Scripted {
        fn new(values: &[f64]) -> Self {
            Self {
                values: Mutex::new(values.iter().copied().collect()),
                last: Mutex::new(values.last().copied().unwrap_or(0.0)),
            }
        }
    }

    #[async_trait]
    impl PolledSource for Scripted {
        async fn sample(&self) -> anyhow::Result<f64> {
            match self.values.lock().pop_front() {
                Some(v) => Ok(v),
                None => Ok(*self.last.lock()),
            }
        }
    }

    struct Broken;

    #[async_trait]
    impl PolledSource for Broken {
        async fn sample(&self) -> anyhow::Result<f64> {
            anyhow::bail!("device unplugged")
        }
    }

    #[test]
    fn test_tolerance() {
        let tol = Tolerance::relative(1e-6);
        assert!(tol.is_close(1.0000001, 1.0000002));
        assert!(!tol.is_close(1.0, 1.001));

        let default = Tolerance::default();
        assert!(default.is_close(5.0, 5.0));
        assert!(!default.is_close(0.0, 1e-12));

        let with_abs = Tolerance {
            relative: 1e-9,
            absolute: 1e-6,
        };
        assert!(with_abs.is_close(0.0, 1e-7));
        assert!(!Tolerance::default().is_close(f64::NAN, f64::NAN));
    }

    #[tokio::test]
    async fn test_first_poll_without_baseline_is_silent() {
        let slot = Arc::new(DeliverySlot::new());
        let mut sampler = Sampler::new(Scripted::new(&[3.0, 3.0, 4.0]), slot.clone(), 0, TrackedValue::SetPoint);

        assert!(!sampler.poll_once().await.unwrap());
        assert_eq!(sampler.last_observed(), Some(3.0));
        assert!(!sampler.poll_once().await.unwrap());
        assert!(sampler.poll_once().await.unwrap());
        assert_eq!(slot.queue().drain(), vec![4.0]);
    }

    #[tokio::test]
    async fn test_repeated_reads_push_once() {
        let slot = Arc::new(DeliverySlot::new());
        let mut sampler = Sampler::new(
            Scripted::new(&[1.0, 2.0, 2.0, 2.0, 3.0]),
            slot.clone(),
            0,
            TrackedValue::Measured,
        )
        .with_baseline(1.0);

        for _ in 0..8 {
            sampler.poll_once().await.unwrap();
        }
        assert_eq!(slot.queue().drain(), vec![2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_jitter_within_tolerance_is_ignored() {
        let slot = Arc::new(DeliverySlot::new());
        let mut sampler = Sampler::new(
            Scripted::new(&[1.0000002, 1.0000001, 1.0000002]),
            slot.clone(),
            0,
            TrackedValue::Measured,
        )
        .with_tolerance(Tolerance::relative(1e-6))
        .with_baseline(1.0000001);

        for _ in 0..3 {
            assert!(!sampler.poll_once().await.unwrap());
        }
        assert!(slot.queue().is_empty());
    }

    #[tokio::test]
    async fn test_run_returns_read_failure() {
        let slot = Arc::new(DeliverySlot::new());
        let sampler = Sampler::new(Broken, slot, 3, TrackedValue::SetPoint).with_baseline(0.0);

        let err = sampler.run(StopSignal::new()).await.unwrap_err();
        match err {
            ControlLoopError::Hardware { channel, operation, .. } => {
                assert_eq!(channel, 3);
                assert_eq!(operation, "get_set_point");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_status_records_fault() {
        let status = Arc::new(SamplerStatus::new());
        let sampler = Sampler::new(Broken, Arc::new(DeliverySlot::new()), 1, TrackedValue::Measured)
            .with_baseline(0.0)
            .with_status(status.clone());
        assert_eq!(status.get(), SamplerState::Running);

        assert!(sampler.run(StopSignal::new()).await.is_err());
        match status.get() {
            SamplerState::Faulted(message) => assert!(message.contains("device unplugged"), "{message}"),
            other => panic!("unexpected state: {other:?}"),
        }

        status.finish(SamplerState::Stopped);
        assert!(status.get().is_faulted());
    }

    #[tokio::test]
    async fn test_stop_interrupts_sleep() {
        let stop = StopSignal::new();
        let status = Arc::new(SamplerStatus::new());
        let sampler = Sampler::new(Scripted::new(&[1.0]), Arc::new(DeliverySlot::new()), 0, TrackedValue::SetPoint)
            .with_interval(Duration::from_secs(3600))
            .with_status(status.clone());

        let handle = tokio::spawn(sampler.run(stop.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.set();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(status.get(), SamplerState::Stopped);
    }

    #[tokio::test]
    async fn test_run_exits_on_stop() {
        let slot = Arc::new(DeliverySlot::new());
        let stop = StopSignal::new();
        let sampler = Sampler::new(Scripted::new(&[1.0]), slot, 0, TrackedValue::SetPoint)
            .with_interval(Duration::from_millis(5));

        let handle = tokio::spawn(sampler.run(stop.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(stop.set());
        assert!(!stop.set());
        assert!(stop.is_set());

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
