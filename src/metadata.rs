//! Channel index call metadata and the operation catalogue.
//!
//! The protocol layer attaches an optional `ChannelIndex` to every call. All
//! index-taking operations resolve it through [`resolve`] so that the bounds
//! check and its error message are identical everywhere.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ControlLoopError, ServiceResult};

/// Fully qualified identifier of the control loop feature
pub const FEATURE_IDENTIFIER: &str = "de.cetoni/controllers/ControlLoopService/v1";

/// Identifier of the channel index metadata
pub const CHANNEL_INDEX_METADATA: &str = "ChannelIndex";

/// Per-call metadata supplied by the protocol layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMetadata {
    /// Requested channel; `None` when the client sent no index
    pub channel_index: Option<i64>,
}

impl CallMetadata {
    /// Metadata without a channel index
    pub fn none() -> Self {
        Self::default()
    }

    /// Metadata selecting `index`
    pub fn channel(index: i64) -> Self {
        Self {
            channel_index: Some(index),
        }
    }

    /// Requested index; a missing index selects channel 0
    pub fn requested_index(&self) -> i64 {
        self.channel_index.unwrap_or(0)
    }
}

/// Validate `index` against `channel_count`.
///
/// Valid iff `0 <= index < channel_count`.
pub fn resolve(index: i64, channel_count: usize) -> ServiceResult<usize> {
    usize::try_from(index)
        .ok()
        .filter(|&i| i < channel_count)
        .ok_or(ControlLoopError::InvalidChannelIndex {
            index,
            channel_count,
        })
}

/// Calls exposed by the control loop feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Operation {
    /// Property: number of controller channels
    GetNumberOfChannels,
    /// Command: write a set point
    WriteSetPoint,
    /// Observable command: start the control loop
    RunControlLoop,
    /// Command: stop the control loop
    StopControlLoop,
    /// Observable property: measured value
    ControllerValue,
    /// Observable property: set point
    SetPointValue,
}

impl Operation {
    /// Operations whose behavior depends on the channel index
    pub const CHANNEL_SCOPED: [Operation; 5] = [
        Operation::WriteSetPoint,
        Operation::RunControlLoop,
        Operation::StopControlLoop,
        Operation::ControllerValue,
        Operation::SetPointValue,
    ];

    /// Name used on the wire
    pub fn identifier(self) -> &'static str {
        match self {
            Operation::GetNumberOfChannels => "NumberOfChannels",
            Operation::WriteSetPoint => "WriteSetPoint",
            Operation::RunControlLoop => "RunControlLoop",
            Operation::StopControlLoop => "StopControlLoop",
            Operation::ControllerValue => "ControllerValue",
            Operation::SetPointValue => "SetPointValue",
        }
    }

    fn category(self) -> &'static str {
        match self {
            Operation::WriteSetPoint | Operation::RunControlLoop | Operation::StopControlLoop => {
                "Command"
            }
            Operation::GetNumberOfChannels
            | Operation::ControllerValue
            | Operation::SetPointValue => "Property",
        }
    }

    /// Fully qualified identifier, e.g. `.../ControlLoopService/v1/Command/WriteSetPoint`
    pub fn fully_qualified_identifier(self) -> String {
        format!("{}/{}/{}", FEATURE_IDENTIFIER, self.category(), self.identifier())
    }

    /// Whether clients subscribe to this call instead of calling it once
    pub fn is_observable(self) -> bool {
        matches!(
            self,
            Operation::RunControlLoop | Operation::ControllerValue | Operation::SetPointValue
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_bounds() {
        assert_eq!(resolve(0, 3).unwrap(), 0);
        assert_eq!(resolve(2, 3).unwrap(), 2);
        assert!(resolve(3, 3).is_err());
        assert!(resolve(-1, 3).is_err());
        assert!(resolve(0, 0).is_err());
    }

    #[test]
    fn test_resolve_error_message() {
        let err = resolve(-4, 2).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("-4"), "{msg}");
        assert!(msg.contains("between 0 and 1"), "{msg}");
    }

    #[test]
    fn test_missing_index_defaults_to_zero() {
        assert_eq!(CallMetadata::none().requested_index(), 0);
        assert_eq!(CallMetadata::channel(5).requested_index(), 5);
    }

    #[test]
    fn test_fully_qualified_identifiers() {
        assert_eq!(
            Operation::WriteSetPoint.fully_qualified_identifier(),
            "de.cetoni/controllers/ControlLoopService/v1/Command/WriteSetPoint"
        );
        assert_eq!(
            Operation::ControllerValue.fully_qualified_identifier(),
            "de.cetoni/controllers/ControlLoopService/v1/Property/ControllerValue"
        );
        assert!(Operation::RunControlLoop.is_observable());
        assert!(!Operation::StopControlLoop.is_observable());
    }
}
