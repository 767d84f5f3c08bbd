//! Per-target wait queue, stored as keys in the target's fsdb.
//!
//! Each waiting allocation has one key on every target it may use:
//!
//! ```text
//! _alloc.queue.PPPPPP-TTTTTTTTTTTTTT-FF-ALLOCID  =  ALLOCID
//! ```
//!
//! `PPPPPP` is the scaled priority, `TTTTTTTTTTTTTT` the UTC creation stamp,
//! `FF` the flags (`P`/`N` preempt, `S`/`E` shared/exclusive) and `ALLOCID`
//! the allocation id. All fields are fixed width, so sorting the keys sorts
//! the waiters by priority and then by arrival; every process sees the same
//! order. Changing a field width breaks that and needs a migration of the
//! persisted queues.

use crate::core::target::Target;
use crate::core::{AllocResult, AllocatorError};
use crate::util::clock::parse_stamp;
use crate::util::ids::{is_valid_alloc_id, ALLOC_ID_LEN};

/// Prefix of every queue key.
pub const QUEUE_PREFIX: &str = "_alloc.queue.";

/// Largest priority the key can carry.
pub const QUEUE_PRIORITY_MAX: u32 = 999_999;

/// One parsed queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waiter {
    /// Full key, including the prefix.
    pub key: String,
    /// Scaled priority; lower goes first.
    pub priority: u32,
    /// Creation stamp.
    pub timestamp: String,
    /// Preemption requested.
    pub preempt: bool,
    /// Reserved sharing flag.
    pub shared: bool,
    /// Waiting allocation.
    pub alloc_id: String,
}

/// Queue key for the given fields.
///
/// Priorities beyond [`QUEUE_PRIORITY_MAX`] are queued at that value; the
/// scheduler orders that bucket by the priority on the allocation record.
/// `timestamp` has one-second resolution, so two equal-priority requests
/// made within the same second sort by flags and then by their (random)
/// allocation id, not by arrival.
#[must_use]
pub fn encode_key(priority: u32, timestamp: &str, preempt: bool, shared: bool, alloc_id: &str) -> String {
    format!(
        "{QUEUE_PREFIX}{:06}-{timestamp}-{}{}-{alloc_id}",
        priority.min(QUEUE_PRIORITY_MAX),
        if preempt { 'P' } else { 'N' },
        if shared { 'S' } else { 'E' },
    )
}

impl Waiter {
    /// Parse a queue entry, checking every field and that the value matches
    /// the id in the key.
    pub fn parse(key: &str, value: Option<&str>) -> Result<Self, String> {
        let rest = key
            .strip_prefix(QUEUE_PREFIX)
            .ok_or_else(|| "missing queue prefix".to_owned())?;
        let fields: Vec<&str> = rest.splitn(4, '-').collect();
        let [prio, stamp, flags, alloc_id] = fields.as_slice() else {
            return Err("expected four fields".into());
        };
        if prio.len() != 6 || !prio.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("bad priority field {prio:?}"));
        }
        let priority: u32 = prio.parse().map_err(|e| format!("bad priority: {e}"))?;
        if parse_stamp(stamp).is_none() {
            return Err(format!("bad timestamp field {stamp:?}"));
        }
        let flags = flags.as_bytes();
        let preempt = match flags.first() {
            Some(b'P') => true,
            Some(b'N') => false,
            _ => return Err("bad preempt flag".into()),
        };
        let shared = match flags.get(1) {
            Some(b'S') => true,
            Some(b'E') => false,
            _ => return Err("bad shared flag".into()),
        };
        if flags.len() != 2 {
            return Err("flags must be two characters".into());
        }
        if alloc_id.len() != ALLOC_ID_LEN || !is_valid_alloc_id(alloc_id) {
            return Err(format!("bad allocation id {alloc_id:?}"));
        }
        if value != Some(*alloc_id) {
            return Err(format!("value {value:?} does not match key"));
        }
        Ok(Self {
            key: key.to_owned(),
            priority,
            timestamp: (*stamp).to_owned(),
            preempt,
            shared,
            alloc_id: (*alloc_id).to_owned(),
        })
    }
}

/// Queue `alloc_id` on `target`; returns the key written.
pub fn enqueue(
    target: &Target,
    priority: u32,
    timestamp: &str,
    preempt: bool,
    shared: bool,
    alloc_id: &str,
) -> AllocResult<String> {
    let key = encode_key(priority, timestamp, preempt, shared, alloc_id);
    target.fsdb().put(&key, alloc_id)?;
    Ok(key)
}

/// Load the queue sorted by scheduling order, plus whether any valid waiter
/// asked for preemption.
///
/// Entries that do not parse, or whose allocation `exists` says is gone,
/// are removed on the way.
pub fn load(
    target: &Target,
    exists: impl Fn(&str) -> bool,
) -> AllocResult<(Vec<Waiter>, bool)> {
    let mut waiters = Vec::new();
    let mut preempt = false;
    for key in target.fsdb().keys(&format!("{QUEUE_PREFIX}*"))? {
        let value = match target.fsdb().get_str(&key) {
            Ok(value) => value,
            Err(err @ AllocatorError::Corrupt { .. }) => {
                tracing::warn!(target_name = %target.id(), %key, %err, "removing unreadable queue entry");
                target.fsdb().remove(&key)?;
                continue;
            }
            Err(err) => return Err(err),
        };
        if value.is_none() {
            // dequeued since listing
            continue;
        }
        match Waiter::parse(&key, value.as_deref()) {
            Ok(waiter) if exists(&waiter.alloc_id) => {
                preempt |= waiter.preempt;
                waiters.push(waiter);
            }
            Ok(waiter) => {
                tracing::info!(target_name = %target.id(), alloc_id = %waiter.alloc_id, "removing queue entry of vanished allocation");
                target.fsdb().remove(&key)?;
            }
            Err(reason) => {
                tracing::warn!(target_name = %target.id(), %key, %reason, "removing corrupt queue entry");
                target.fsdb().remove(&key)?;
            }
        }
    }
    waiters.sort_by(|a, b| a.key.cmp(&b.key));
    Ok((waiters, preempt))
}

/// Remove one entry.
pub fn dequeue(target: &Target, key: &str) -> AllocResult<()> {
    target.fsdb().remove(key)
}

/// Remove every entry `alloc_id` has on `target`.
pub fn remove_alloc(target: &Target, alloc_id: &str) -> AllocResult<usize> {
    let keys = target.fsdb().keys(&format!("{QUEUE_PREFIX}*-{alloc_id}"))?;
    for key in &keys {
        target.fsdb().remove(key)?;
    }
    Ok(keys.len())
}
