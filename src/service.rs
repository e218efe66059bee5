//! Control loop service: request dispatch and sampler lifecycle.
//!
//! [`ControlLoopService`] is what the protocol layer talks to. It owns the
//! ordered list of controller channels, one [`DeliverySlot`] per channel and
//! tracked value, and the `2 * channel_count` background samplers feeding them.
//!
//! # Data Flow
//!
//! ```text
//! request + CallMetadata ──resolve──▶ channel handle ──▶ write / enable loop
//!                          └────────▶ delivery queue ◀── sampler (poll, compare, push)
//!                                           │
//!                                           ▼
//!                                protocol layer drains to subscriber
//! ```
//!
//! # Lifecycle
//!
//! [`ControlLoopService::start`] reads every value once and queues it, then
//! spawns the samplers. [`ControlLoopService::stop`] sets the shared stop
//! signal and returns immediately; samplers exit at their next poll boundary.
//! [`ControlLoopService::shutdown`] additionally waits for them and reports
//! which ones had failed. Dropping the service sets the stop signal.
//!
//! A sampler that fails while the service runs no longer feeds its queue.
//! [`ControlLoopService::sampler_state`] and
//! [`ControlLoopService::faulted_samplers`] report this without shutting down.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SamplingConfig;
use crate::error::{ControlLoopError, SamplerFault, ServiceResult};
use crate::hardware::capabilities::{ControllerChannel, TrackedValue};
use crate::metadata::{resolve, CallMetadata, Operation};
use crate::queue::{DeliveryQueue, DeliverySlot};
use crate::sampler::{ChannelSource, Sampler, SamplerState, SamplerStatus, StopSignal};

struct ChannelEntry {
    handle: Arc<dyn ControllerChannel>,
    set_point: Arc<DeliverySlot>,
    measured: Arc<DeliverySlot>,
    set_point_status: Arc<SamplerStatus>,
    measured_status: Arc<SamplerStatus>,
}

impl ChannelEntry {
    fn new(handle: Arc<dyn ControllerChannel>) -> Self {
        Self {
            handle,
            set_point: Arc::new(DeliverySlot::new()),
            measured: Arc::new(DeliverySlot::new()),
            set_point_status: Arc::new(SamplerStatus::new()),
            measured_status: Arc::new(SamplerStatus::new()),
        }
    }

    fn slot(&self, kind: TrackedValue) -> &Arc<DeliverySlot> {
        match kind {
            TrackedValue::SetPoint => &self.set_point,
            TrackedValue::Measured => &self.measured,
        }
    }

    fn status(&self, kind: TrackedValue) -> &Arc<SamplerStatus> {
        match kind {
            TrackedValue::SetPoint => &self.set_point_status,
            TrackedValue::Measured => &self.measured_status,
        }
    }
}

struct SamplerTask {
    channel: usize,
    kind: TrackedValue,
    status: Arc<SamplerStatus>,
    handle: JoinHandle<ServiceResult<()>>,
}

/// Multi-channel control loop service.
pub struct ControlLoopService {
    channels: Vec<ChannelEntry>,
    stop: StopSignal,
    samplers: Mutex<Vec<SamplerTask>>,
}

impl ControlLoopService {
    /// Build the service over already-enumerated channels and start sampling.
    ///
    /// Each tracked value of each channel is read once and queued before any
    /// sampler starts, so the first subscriber always sees the current state.
    /// Must be called from within a tokio runtime.
    pub async fn start(
        channels: Vec<Arc<dyn ControllerChannel>>,
        sampling: SamplingConfig,
    ) -> ServiceResult<Self> {
        let mut entries = Vec::with_capacity(channels.len());
        let mut baselines = Vec::with_capacity(channels.len());

        for (index, handle) in channels.into_iter().enumerate() {
            let entry = ChannelEntry::new(handle);

            let mut initial = [0.0; 2];
            for (slot_value, kind) in initial.iter_mut().zip(TrackedValue::ALL) {
                let value = kind
                    .read_from(entry.handle.as_ref())
                    .await
                    .map_err(|e| ControlLoopError::hardware(index, kind.read_operation(), e))?;
                entry.slot(kind).push(value);
                *slot_value = value;
            }
            debug!(
                channel = index,
                name = %entry.handle.name(),
                set_point = initial[0],
                measured = initial[1],
                "Registered controller channel"
            );

            entries.push(entry);
            baselines.push(initial);
        }

        let stop = StopSignal::new();
        let mut samplers = Vec::with_capacity(entries.len() * 2);
        for (index, (entry, initial)) in entries.iter().zip(&baselines).enumerate() {
            for (kind, baseline) in TrackedValue::ALL.into_iter().zip(initial.iter().copied()) {
                let sampler = Sampler::new(
                    ChannelSource::new(entry.handle.clone(), kind),
                    entry.slot(kind).clone(),
                    index,
                    kind,
                )
                .with_tolerance(sampling.tolerance())
                .with_interval(sampling.poll_interval())
                .with_baseline(baseline)
                .with_status(entry.status(kind).clone());

                samplers.push(SamplerTask {
                    channel: index,
                    kind,
                    status: entry.status(kind).clone(),
                    handle: tokio::spawn(sampler.run(stop.clone())),
                });
            }
        }

        info!(
            channels = entries.len(),
            samplers = samplers.len(),
            poll_interval_ms = sampling.poll_interval_ms,
            "Control loop service started"
        );

        Ok(Self {
            channels: entries,
            stop,
            samplers: Mutex::new(samplers),
        })
    }

    // =========================================================================
    // Dispatcher
    // =========================================================================

    /// Number of controller channels, fixed at construction
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn entry(&self, metadata: &CallMetadata) -> ServiceResult<(usize, &ChannelEntry)> {
        let index = resolve(metadata.requested_index(), self.channels.len())?;
        Ok((index, &self.channels[index]))
    }

    /// Write a set point to the selected channel
    pub async fn write_set_point(&self, value: f64, metadata: &CallMetadata) -> ServiceResult<()> {
        let (index, entry) = self.entry(metadata)?;
        debug!(channel = index, value, "WriteSetPoint");
        entry
            .handle
            .write_set_point(value)
            .await
            .map_err(|e| ControlLoopError::hardware(index, "write_set_point", e))
    }

    /// Start the on-device control loop of the selected channel
    ///
    /// Progress reporting for the observable command belongs to the protocol
    /// layer; this returns once the loop has been enabled.
    pub async fn run_control_loop(&self, metadata: &CallMetadata) -> ServiceResult<()> {
        self.enable_control_loop(metadata, true).await
    }

    /// Stop the control loop of the selected channel (no-op if not running)
    pub async fn stop_control_loop(&self, metadata: &CallMetadata) -> ServiceResult<()> {
        self.enable_control_loop(metadata, false).await
    }

    async fn enable_control_loop(&self, metadata: &CallMetadata, enable: bool) -> ServiceResult<()> {
        let (index, entry) = self.entry(metadata)?;
        debug!(channel = index, enable, "EnableControlLoop");
        entry
            .handle
            .enable_control_loop(enable)
            .await
            .map_err(|e| ControlLoopError::hardware(index, "enable_control_loop", e))
    }

    /// Queue delivering set point changes of the selected channel
    pub fn bind_set_point_subscription(&self, metadata: &CallMetadata) -> ServiceResult<DeliveryQueue> {
        self.bind_subscription(TrackedValue::SetPoint, metadata, None)
    }

    /// Queue delivering measured value changes of the selected channel
    pub fn bind_measured_value_subscription(
        &self,
        metadata: &CallMetadata,
    ) -> ServiceResult<DeliveryQueue> {
        self.bind_subscription(TrackedValue::Measured, metadata, None)
    }

    /// Route future set point changes of the selected channel into `queue`
    pub fn bind_set_point_subscription_with(
        &self,
        metadata: &CallMetadata,
        queue: DeliveryQueue,
    ) -> ServiceResult<DeliveryQueue> {
        self.bind_subscription(TrackedValue::SetPoint, metadata, Some(queue))
    }

    /// Route future measured value changes of the selected channel into `queue`
    pub fn bind_measured_value_subscription_with(
        &self,
        metadata: &CallMetadata,
        queue: DeliveryQueue,
    ) -> ServiceResult<DeliveryQueue> {
        self.bind_subscription(TrackedValue::Measured, metadata, Some(queue))
    }

    /// Bind a subscription to `kind` of the selected channel.
    ///
    /// Without a replacement the currently bound queue is returned. With one,
    /// the replacement becomes the channel's delivery target for every later
    /// push and is returned; the previous queue receives nothing further.
    /// Concurrent subscribers of the same queue compete for its items.
    /// Binding succeeds even if the value's sampler has faulted; check
    /// [`sampler_state`](Self::sampler_state) to tell a quiet value from a dead one.
    pub fn bind_subscription(
        &self,
        kind: TrackedValue,
        metadata: &CallMetadata,
        replacement: Option<DeliveryQueue>,
    ) -> ServiceResult<DeliveryQueue> {
        let (index, entry) = self.entry(metadata)?;
        let slot = entry.slot(kind);
        if let SamplerState::Faulted(message) = self.state_of(index, entry, kind) {
            warn!(channel = index, property = kind.property_name(), %message, "Binding to a faulted sampler");
        }
        match replacement {
            Some(queue) => {
                debug!(channel = index, property = kind.property_name(), "Rebinding subscription queue");
                slot.rebind(queue.clone());
                Ok(queue)
            }
            None => {
                debug!(channel = index, property = kind.property_name(), "Binding subscription queue");
                Ok(slot.queue())
            }
        }
    }

    /// Operations whose behavior depends on the channel index metadata
    ///
    /// Empty for a single-channel service, where the index is irrelevant.
    pub fn metadata_scoped_operations(&self) -> BTreeSet<Operation> {
        if self.channels.len() == 1 {
            BTreeSet::new()
        } else {
            Operation::CHANNEL_SCOPED.into_iter().collect()
        }
    }

    /// Current state of the sampler tracking `kind` on the selected channel
    pub fn sampler_state(
        &self,
        kind: TrackedValue,
        metadata: &CallMetadata,
    ) -> ServiceResult<SamplerState> {
        let (index, entry) = self.entry(metadata)?;
        Ok(self.state_of(index, entry, kind))
    }

    /// Every (channel, value) whose sampler has ended with an error, with its message
    pub fn faulted_samplers(&self) -> Vec<(usize, TrackedValue, String)> {
        let mut faulted = Vec::new();
        for (index, entry) in self.channels.iter().enumerate() {
            for kind in TrackedValue::ALL {
                if let SamplerState::Faulted(message) = self.state_of(index, entry, kind) {
                    faulted.push((index, kind, message));
                }
            }
        }
        faulted
    }

    fn state_of(&self, index: usize, entry: &ChannelEntry, kind: TrackedValue) -> SamplerState {
        let status = entry.status(kind);
        if status.get() != SamplerState::Running {
            return status.get();
        }
        let ended = self
            .samplers
            .lock()
            .iter()
            .any(|task| task.channel == index && task.kind == kind && task.handle.is_finished());
        // Re-read: the task may have recorded its end just before finishing.
        // A panicked task never records one.
        match status.get() {
            SamplerState::Running if ended => {
                SamplerState::Faulted("sampler task ended abnormally".to_string())
            }
            state => state,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Signal all samplers to stop. Does not wait; safe to call repeatedly.
    pub fn stop(&self) {
        if self.stop.set() {
            info!("Stop signal set for all samplers");
        }
    }

    /// Whether [`stop`](Self::stop) has been called
    pub fn is_stopped(&self) -> bool {
        self.stop.is_set()
    }

    /// Number of sampler tasks that have not terminated
    pub fn running_samplers(&self) -> usize {
        self.samplers
            .lock()
            .iter()
            .filter(|task| !task.handle.is_finished())
            .count()
    }

    /// Stop, wait for every sampler and return the ones that failed.
    ///
    /// A second call returns an empty list.
    pub async fn shutdown(&self) -> Vec<SamplerFault> {
        self.stop();

        let tasks = std::mem::take(&mut *self.samplers.lock());
        let mut faults = Vec::new();
        for task in tasks {
            let error = match task.handle.await {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(join_err) => {
                    let err = ControlLoopError::SamplerTask {
                        channel: task.channel,
                        kind: task.kind,
                        message: join_err.to_string(),
                    };
                    task.status.finish(SamplerState::Faulted(err.to_string()));
                    err
                }
            };
            warn!(channel = task.channel, kind = %task.kind, error = %error, "Sampler ended with fault");
            faults.push(SamplerFault {
                channel: task.channel,
                kind: task.kind,
                error,
            });
        }
        faults
    }
}

impl Drop for ControlLoopService {
    fn drop(&mut self) {
        self.stop.set();
    }
}

impl std::fmt::Debug for ControlLoopService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLoopService")
            .field("channels", &self.channels.len())
            .field("stopped", &self.stop.is_set())
            .finish_non_exhaustive()
    }
}
