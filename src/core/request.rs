//! Allocation requests and their validation.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::target::TargetRegistry;
use crate::infra::fsdb::{is_valid_key, Value};
use crate::util::clock::{format_stamp, parse_stamp};
use crate::util::ids::is_valid_identifier;

/// Lowest (numerically largest) priority a caller may ask for.
pub const PRIORITY_MAX: i64 = 9999;

/// Factor user priorities are scaled by; the low digits are headroom.
pub const PRIORITY_SCALE: u32 = 1000;

/// Sentinel end time: never expires except by explicit removal.
pub const ENDTIME_STATIC: &str = "static";

/// How far out an explicit end time has to be.
pub const ENDTIME_MIN_LEAD_SECS: i64 = 60;

/// A request for one of several target groups.
///
/// Deserializes from the JSON body clients send; unset fields take their
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationRequest {
    /// Named groups of target names; any one of them satisfies the request.
    pub groups: BTreeMap<String, Vec<String>>,
    /// Allocate on behalf of this user instead of the caller.
    pub obo_user: Option<String>,
    /// Users allowed to use the allocation.
    pub guests: Vec<String>,
    /// 0 (highest) to [`PRIORITY_MAX`]; defaults from configuration.
    pub priority: Option<i64>,
    /// Evict lower priority owners.
    pub preempt: bool,
    /// Wait if the targets are busy instead of answering `busy`.
    pub queue: bool,
    /// Reserved; recorded but not acted on.
    pub shared: bool,
    /// Opaque scalars stored with the allocation (`uuid` is checked).
    pub extra_data: BTreeMap<String, Value>,
    /// Free-form reason, truncated to the configured length.
    pub reason: Option<String>,
    /// `static` or a `YYYYmmddHHMMSS` UTC stamp at least a minute out.
    pub endtime: Option<String>,
}

impl AllocationRequest {
    /// Empty request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a group.
    #[must_use]
    pub fn group<I, S>(mut self, name: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups
            .insert(name.into(), targets.into_iter().map(Into::into).collect());
        self
    }

    /// Set the priority.
    #[must_use]
    pub const fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Ask for preemption.
    #[must_use]
    pub const fn preempt(mut self, preempt: bool) -> Self {
        self.preempt = preempt;
        self
    }

    /// Allow queuing.
    #[must_use]
    pub const fn queue(mut self, queue: bool) -> Self {
        self.queue = queue;
        self
    }

    /// Add a guest.
    #[must_use]
    pub fn guest(mut self, user_id: impl Into<String>) -> Self {
        self.guests.push(user_id.into());
        self
    }

    /// Allocate for somebody else.
    #[must_use]
    pub fn on_behalf_of(mut self, user_id: impl Into<String>) -> Self {
        self.obo_user = Some(user_id.into());
        self
    }

    /// Set the reason.
    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Set the end time.
    #[must_use]
    pub fn endtime(mut self, endtime: impl Into<String>) -> Self {
        self.endtime = Some(endtime.into());
        self
    }

    /// Add an extra data entry.
    #[must_use]
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra_data.insert(key.into(), value.into());
        self
    }

    /// Check everything that does not need shared state.
    ///
    /// `Err` carries the rejection message.
    pub fn validate(
        &self,
        registry: &TargetRegistry,
        default_priority: u32,
        reason_len_max: usize,
        now: DateTime<Utc>,
    ) -> Result<ValidatedRequest, String> {
        let groups = validate_groups(&self.groups, registry)?;

        for (index, guest) in self.guests.iter().enumerate() {
            if !is_valid_identifier(guest) {
                return Err(format!("guest #{index} ({guest:?}) is not a valid user name"));
            }
        }

        let priority = match self.priority {
            None => i64::from(default_priority),
            Some(p) if (0..=PRIORITY_MAX).contains(&p) => p,
            Some(p) => return Err(format!("invalid priority {p} (expected 0-{PRIORITY_MAX})")),
        };
        let priority = u32::try_from(priority)
            .map_err(|_| format!("invalid priority {priority}"))?
            .saturating_mul(PRIORITY_SCALE);

        let endtime = match self.endtime.as_deref() {
            None => None,
            Some(ENDTIME_STATIC) => Some(ENDTIME_STATIC.to_owned()),
            Some(raw) => {
                let at = parse_stamp(raw).ok_or_else(|| {
                    format!("endtime: invalid date/time {raw:?}, expected YYYYmmddHHMMSS")
                })?;
                let lead = at.signed_duration_since(now).num_seconds();
                if lead < ENDTIME_MIN_LEAD_SECS {
                    return Err(format!(
                        "endtime: needs to be at least one minute ahead of current time; got {lead}s"
                    ));
                }
                Some(format_stamp(at))
            }
        };

        for key in self.extra_data.keys() {
            if !is_valid_key(&format!("extra_data.{key}")) || key.contains('.') {
                return Err(format!("extra_data: invalid key {key:?}"));
            }
        }
        let uuid = match self.extra_data.get("uuid") {
            None => None,
            Some(Value::Str(uuid)) => Some(uuid.clone()),
            Some(other) => return Err(format!("extra_data.uuid: expected a string, got {other:?}")),
        };

        let reason = self
            .reason
            .as_deref()
            .filter(|r| !r.is_empty())
            .map(|r| r.chars().take(reason_len_max).collect());

        Ok(ValidatedRequest {
            groups,
            priority,
            endtime,
            reason,
            uuid,
        })
    }
}

fn validate_groups(
    groups: &BTreeMap<String, Vec<String>>,
    registry: &TargetRegistry,
) -> Result<BTreeMap<String, BTreeSet<String>>, String> {
    if groups.is_empty() {
        return Err("no target groups given".into());
    }
    let mut clean: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (name, targets) in groups {
        if !is_valid_key(&format!("group.{name}")) || name.contains('.') {
            return Err(format!("group name {name:?} is not valid"));
        }
        if targets.is_empty() {
            return Err(format!("group '{name}' has no targets"));
        }
        for target in targets {
            if !registry.contains(target) {
                return Err(format!("target {target} in group '{name}' does not exist"));
            }
        }
        let set: BTreeSet<String> = targets.iter().cloned().collect();
        if set.len() < targets.len() {
            let mut seen = BTreeSet::new();
            let duplicates: BTreeSet<&str> = targets
                .iter()
                .filter(|t| !seen.insert(t.as_str()))
                .map(String::as_str)
                .collect();
            return Err(format!(
                "targets {} in group '{name}' are duplicated",
                duplicates.into_iter().collect::<Vec<_>>().join(",")
            ));
        }
        if let Some((original, _)) = clean.iter().find(|(_, other)| **other == set) {
            return Err(format!(
                "targets in group '{name}' are the same as in '{original}'"
            ));
        }
        clean.insert(name.clone(), set);
    }
    Ok(clean)
}

/// Request after validation, ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    /// Deduplicated groups.
    pub groups: BTreeMap<String, BTreeSet<String>>,
    /// Scaled priority.
    pub priority: u32,
    /// Normalized end time.
    pub endtime: Option<String>,
    /// Truncated reason.
    pub reason: Option<String>,
    /// Client supplied UUID, still to be checked against replays.
    pub uuid: Option<String>,
}
