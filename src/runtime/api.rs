//! API-facing request/response models and thin entry points for an HTTP
//! front end.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::wait_queue;
use crate::core::{AllocResult, AllocationReply, AllocationRequest, AllocationState, Allocator, Identity};

/// Body of a keepalive call covering several allocations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeepaliveRequest {
    /// Allocation id to the state the client last saw.
    #[serde(default)]
    pub allocations: BTreeMap<String, Option<AllocationState>>,
    /// Client pressure hint.
    #[serde(default)]
    pub pressure: i64,
}

/// Target snapshot data for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSnapshot {
    /// Target name.
    pub name: String,
    /// Owning allocation.
    pub owner: Option<String>,
    /// User of the owning allocation.
    pub owner_user: Option<String>,
    /// Number of queued waiters.
    pub queue_len: usize,
}

/// Parse a JSON request body and submit it.
pub fn submit_request_json(
    allocator: &Allocator,
    body: &str,
    caller: &dyn Identity,
) -> Result<AllocationReply, String> {
    let request: AllocationRequest =
        serde_json::from_str(body).map_err(|e| format!("parse error: {e}"))?;
    allocator.request(&request, caller).map_err(|e| e.to_string())
}

/// Keep several allocations alive at once; one reply per allocation.
pub fn keepalive_many(
    allocator: &Allocator,
    request: &KeepaliveRequest,
    caller: &dyn Identity,
) -> AllocResult<BTreeMap<String, AllocationReply>> {
    request
        .allocations
        .iter()
        .map(|(alloc_id, expected)| {
            allocator
                .keepalive(alloc_id, *expected, request.pressure, caller)
                .map(|reply| (alloc_id.clone(), reply))
        })
        .collect()
}

/// Ownership and queue length of every target.
pub fn list_targets(allocator: &Allocator) -> AllocResult<Vec<TargetSnapshot>> {
    allocator
        .registry()
        .iter()
        .map(|target| {
            let (waiters, _) = wait_queue::load(target, |id| allocator.store().exists(id))?;
            Ok(TargetSnapshot {
                name: target.id().to_owned(),
                owner: target.owner_id()?,
                owner_user: target.owner_user()?,
                queue_len: waiters.len(),
            })
        })
        .collect()
}
