//! Replies handed back to API callers.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::state::AllocationState;
use crate::infra::fsdb::Value;

/// Everything a permitted reader may see about an allocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationView {
    /// User the allocation is for.
    pub user: Option<String>,
    /// Caller that created it.
    pub creator: Option<String>,
    /// Scaled priority.
    pub priority: Option<i64>,
    /// Preemption requested.
    pub preempt: bool,
    /// Free-form reason.
    pub reason: Option<String>,
    /// Guest user ids.
    pub guests: Vec<String>,
    /// Union of all groups.
    pub targets_all: Vec<String>,
    /// Groups by name.
    pub target_group: BTreeMap<String, Vec<String>>,
    /// Last activity.
    pub timestamp: Option<String>,
    /// `static`, a stamp, or nothing.
    pub endtime: Option<String>,
    /// Opaque client data.
    pub extra_data: BTreeMap<String, Value>,
}

/// Reply to every allocation operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationReply {
    /// Resulting state.
    pub state: AllocationState,
    /// Explanation.
    #[serde(rename = "_message")]
    pub message: String,
    /// Allocation id, when there is one the caller may use.
    #[serde(rename = "allocid", skip_serializing_if = "Option::is_none")]
    pub alloc_id: Option<String>,
    /// Allocated group, once active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_allocated: Option<Vec<String>>,
    /// Full record, for `get` and `query`.
    #[serde(flatten)]
    pub details: Option<AllocationView>,
}

impl AllocationReply {
    /// Reply carrying the canned message for `state`.
    #[must_use]
    pub fn new(state: AllocationState) -> Self {
        Self {
            state,
            message: state.message().to_owned(),
            alloc_id: None,
            group_allocated: None,
            details: None,
        }
    }

    /// `rejected` with a specific reason.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(AllocationState::Rejected).with_message(message)
    }

    /// `invalid` reply.
    #[must_use]
    pub fn invalid() -> Self {
        Self::new(AllocationState::Invalid)
    }

    /// Replace the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Attach the allocation id.
    #[must_use]
    pub fn with_alloc_id(mut self, alloc_id: impl Into<String>) -> Self {
        self.alloc_id = Some(alloc_id.into());
        self
    }

    /// Attach the allocated group.
    #[must_use]
    pub fn with_group(mut self, group: Option<Vec<String>>) -> Self {
        self.group_allocated = group;
        self
    }

    /// Attach the full record.
    #[must_use]
    pub fn with_details(mut self, view: AllocationView) -> Self {
        self.details = Some(view);
        self
    }
}
