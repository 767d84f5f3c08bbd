//! Allocation state machine values.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// State of an allocation as seen by clients.
///
/// ```text
/// (none) -> queued -> active -> removed | timedout | overtime | restart-needed
///           queued (queue=false, not satisfiable) -> busy
///           validation / policy failure           -> rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationState {
    /// Unknown or already removed allocation.
    Invalid,
    /// Waiting for targets.
    Queued,
    /// Not satisfiable right now and the caller did not want to queue.
    Busy,
    /// Removed by a user.
    Removed,
    /// Refused by validation or policy.
    Rejected,
    /// A group of targets is held.
    Active,
    /// Maximum lifetime exceeded.
    Overtime,
    /// Lost a target to a higher priority allocation; request again.
    RestartNeeded,
    /// Idle for too long.
    Timedout,
}

impl AllocationState {
    /// Wire/persisted name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Queued => "queued",
            Self::Busy => "busy",
            Self::Removed => "removed",
            Self::Rejected => "rejected",
            Self::Active => "active",
            Self::Overtime => "overtime",
            Self::RestartNeeded => "restart-needed",
            Self::Timedout => "timedout",
        }
    }

    /// Human readable explanation.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Invalid => "allocation is not valid",
            Self::Queued => "allocation is queued",
            Self::Busy => "targets cannot be allocated right now and queuing not allowed",
            Self::Removed => "allocation has been removed by the user",
            Self::Rejected => "user has no privilege for this operation",
            Self::Active => "allocation is being actively used",
            Self::Overtime => "maximum time-to-live exceeded",
            Self::RestartNeeded => "allocation has been changed by a higher priority allocator",
            Self::Timedout => "allocation was idle for too long",
        }
    }
}

impl fmt::Display for AllocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "invalid" => Self::Invalid,
            "queued" => Self::Queued,
            "busy" => Self::Busy,
            "removed" => Self::Removed,
            "rejected" => Self::Rejected,
            "active" => Self::Active,
            "overtime" => Self::Overtime,
            "restart-needed" => Self::RestartNeeded,
            "timedout" => Self::Timedout,
            other => return Err(format!("unknown allocation state `{other}`")),
        })
    }
}
