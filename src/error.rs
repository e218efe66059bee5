//! Custom error types for the service.
//!
//! `ControlLoopError` is the single error type surfaced by the dispatcher, the
//! samplers and the configuration layer. Hardware calls use `anyhow::Result` at
//! the capability seam (see [`crate::hardware::capabilities`]); those errors are
//! wrapped into [`ControlLoopError::Hardware`] together with the channel and the
//! operation that failed.
//!
//! ## Error Taxonomy
//!
//! - **`InvalidChannelIndex`**: the caller supplied a channel index outside
//!   `[0, channel_count - 1]`. Recoverable; the protocol layer must report it as
//!   the defined error `InvalidChannelIndex` (see [`ControlLoopError::defined_error`]).
//! - **`Hardware`**: a read or write against a controller channel failed. Fatal
//!   to that one call or sampler only; other channels keep running.
//! - **`SamplerTask`**: a sampler task panicked or was aborted. A software
//!   fault, not a device fault.
//! - **`Config`** / **`Configuration`**: loading or validating the service
//!   configuration failed.

use thiserror::Error;

use crate::hardware::capabilities::TrackedValue;

/// Convenience alias for results using the service error type.
pub type ServiceResult<T> = std::result::Result<T, ControlLoopError>;

/// Identifier of the defined execution error reported for bad channel indices.
pub const INVALID_CHANNEL_INDEX: &str = "InvalidChannelIndex";

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum ControlLoopError {
    #[error(
        "The sent channel index {index} is invalid. The index must be between 0 and {}.",
        max_index(.channel_count)
    )]
    InvalidChannelIndex { index: i64, channel_count: usize },

    #[error("Hardware error on channel {channel} during {operation}: {source}")]
    Hardware {
        channel: usize,
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Sampler task for {kind} of channel {channel} ended abnormally: {message}")]
    SamplerTask {
        channel: usize,
        kind: TrackedValue,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

fn max_index(channel_count: &usize) -> i64 {
    *channel_count as i64 - 1
}

/// Error as it should appear on the wire: a named, feature-level error the
/// protocol layer reports instead of a generic fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinedError {
    /// Identifier of the defined error (e.g. `InvalidChannelIndex`)
    pub identifier: &'static str,
    /// Human-readable message
    pub message: String,
}

impl ControlLoopError {
    pub(crate) fn hardware(channel: usize, operation: &'static str, source: anyhow::Error) -> Self {
        Self::Hardware {
            channel,
            operation,
            source,
        }
    }

    /// Whether the caller can recover by correcting its request.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidChannelIndex { .. })
    }

    /// The defined error this maps to, or `None` for undefined errors that the
    /// protocol layer should surface as generic execution faults.
    pub fn defined_error(&self) -> Option<DefinedError> {
        match self {
            Self::InvalidChannelIndex { .. } => Some(DefinedError {
                identifier: INVALID_CHANNEL_INDEX,
                message: self.to_string(),
            }),
            _ => None,
        }
    }
}

/// Terminal failure of one background sampler.
#[derive(Debug)]
pub struct SamplerFault {
    /// Channel whose sampler stopped
    pub channel: usize,
    /// Which value the sampler was tracking
    pub kind: TrackedValue,
    /// Cause of the failure
    pub error: ControlLoopError,
}

impl std::fmt::Display for SamplerFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} sampler for channel {} failed: {}",
            self.kind, self.channel, self.error
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_channel_index_message_names_index_and_range() {
        let err = ControlLoopError::InvalidChannelIndex {
            index: 7,
            channel_count: 3,
        };
        assert_eq!(
            err.to_string(),
            "The sent channel index 7 is invalid. The index must be between 0 and 2."
        );
        assert!(err.is_recoverable());

        let defined = err.defined_error().unwrap();
        assert_eq!(defined.identifier, INVALID_CHANNEL_INDEX);
        assert!(defined.message.contains('7'));
    }

    #[test]
    fn sampler_task_failure_is_not_a_hardware_fault() {
        let err = ControlLoopError::SamplerTask {
            channel: 2,
            kind: TrackedValue::SetPoint,
            message: "task panicked".to_string(),
        };
        assert!(!matches!(err, ControlLoopError::Hardware { .. }));
        assert!(err.defined_error().is_none());
        assert!(err.to_string().contains("channel 2"));
    }

    #[test]
    fn hardware_errors_are_not_defined_errors() {
        let err = ControlLoopError::hardware(1, "write_set_point", anyhow::anyhow!("bus timeout"));
        assert!(!err.is_recoverable());
        assert!(err.defined_error().is_none());
        assert!(err.to_string().contains("bus timeout"));
        assert!(err.to_string().contains("channel 1"));
    }
}
