//! Allocation records.
//!
//! Each allocation is a directory named after its id under the allocations
//! root, holding an fsdb with:
//!
//! `state`, `user`, `creator`, `priority`, `preempt`, `shared`, `reason`,
//! `endtime`, `ttl`, `timestamp`, `timestamp_start`, `targets_all`,
//! `group.<name>`, `group_allocated`, `guest.<hash>` and `extra_data.<key>`.
//!
//! Lists are stored comma separated. [`Allocation`] is a handle: it caches
//! nothing but the id and the group layout (which never changes after
//! creation), everything else is read from disk on demand.

use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::identity::Identity;
use crate::core::reply::AllocationView;
use crate::core::state::AllocationState;
use crate::core::target::TargetRegistry;
use crate::core::{AllocResult, AllocatorError};
use crate::infra::fsdb::{Fsdb, Value};
use crate::infra::lock::{FileLock, FileLockGuard};
use crate::util::clock::{now_stamp, EPOCH_STAMP};
use crate::util::ids::guest_key;

const KEY_STATE: &str = "state";
const KEY_USER: &str = "user";
const KEY_CREATOR: &str = "creator";
const KEY_PRIORITY: &str = "priority";
const KEY_PREEMPT: &str = "preempt";
const KEY_SHARED: &str = "shared";
const KEY_REASON: &str = "reason";
const KEY_ENDTIME: &str = "endtime";
const KEY_TTL: &str = "ttl";
const KEY_TIMESTAMP: &str = "timestamp";
const KEY_TIMESTAMP_START: &str = "timestamp_start";
const KEY_TARGETS_ALL: &str = "targets_all";
const KEY_GROUP_ALLOCATED: &str = "group_allocated";
const PREFIX_GROUP: &str = "group.";
const PREFIX_GUEST: &str = "guest.";
const PREFIX_EXTRA: &str = "extra_data.";

fn join_list<'a>(items: impl IntoIterator<Item = &'a str>) -> String {
    items.into_iter().collect::<Vec<_>>().join(",")
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Result of checking whether an allocation's groups are complete.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupOutcome {
    /// A group became fully owned; the allocation is now active and the
    /// targets in `release` are owned but not needed.
    Activated {
        /// Group that was completed.
        group: String,
        /// Surplus targets to give back.
        release: BTreeSet<String>,
    },
    /// Already active; targets in `release` are owned but outside the
    /// allocated group.
    Surplus {
        /// Surplus targets to give back.
        release: BTreeSet<String>,
    },
    /// Still waiting. For every missing target, the best ownership ratio of
    /// any group needing it.
    Pending {
        /// `missing target -> owned fraction of its best group`.
        ratios: BTreeMap<String, f64>,
    },
    /// Neither queued nor active: nothing to do.
    Inactive,
}

/// Fields written when an allocation is created.
#[derive(Debug, Clone)]
pub struct NewAllocation<'a> {
    /// User the allocation is for.
    pub user: &'a str,
    /// Caller that created it.
    pub creator: &'a str,
    /// Scaled priority.
    pub priority: u32,
    /// Preemption requested.
    pub preempt: bool,
    /// Reserved sharing flag.
    pub shared: bool,
    /// Already truncated reason.
    pub reason: Option<&'a str>,
    /// `static` or a stamp.
    pub endtime: Option<&'a str>,
    /// Maximum lifetime once active, seconds; 0 disables.
    pub ttl_secs: u64,
    /// Guest user ids.
    pub guests: &'a [String],
    /// Opaque client data.
    pub extra_data: &'a BTreeMap<String, Value>,
    /// Groups of target names.
    pub groups: &'a BTreeMap<String, BTreeSet<String>>,
    /// Creation stamp.
    pub stamp: &'a str,
}

impl NewAllocation<'_> {
    /// Persist into a fresh record. `state` goes last, so a record without
    /// one is still being created (or its creator died).
    pub(crate) fn write(&self, fsdb: &Fsdb) -> AllocResult<()> {
        fsdb.put(KEY_TIMESTAMP, self.stamp)?;
        fsdb.put(KEY_USER, self.user)?;
        fsdb.put(KEY_CREATOR, self.creator)?;
        fsdb.put(KEY_PRIORITY, self.priority)?;
        fsdb.put(KEY_PREEMPT, self.preempt)?;
        fsdb.put(KEY_SHARED, self.shared)?;
        if let Some(reason) = self.reason {
            fsdb.put(KEY_REASON, reason)?;
        }
        if let Some(endtime) = self.endtime {
            fsdb.put(KEY_ENDTIME, endtime)?;
        }
        if self.ttl_secs > 0 {
            fsdb.put(KEY_TTL, i64::try_from(self.ttl_secs).unwrap_or(i64::MAX))?;
        }
        for guest in self.guests {
            fsdb.put(&format!("{PREFIX_GUEST}{}", guest_key(guest)), guest.as_str())?;
        }
        for (key, value) in self.extra_data {
            fsdb.put(&format!("{PREFIX_EXTRA}{key}"), value.clone())?;
        }
        let mut all = BTreeSet::new();
        for (name, members) in self.groups {
            fsdb.put(
                &format!("{PREFIX_GROUP}{name}"),
                join_list(members.iter().map(String::as_str)),
            )?;
            all.extend(members.iter().map(String::as_str));
        }
        fsdb.put(KEY_TARGETS_ALL, join_list(all))?;
        fsdb.put(KEY_STATE, AllocationState::Queued.as_str())
    }
}

/// Handle over one allocation record.
#[derive(Debug, Clone)]
pub struct Allocation {
    id: String,
    fsdb: Fsdb,
    lock: FileLock,
    groups: BTreeMap<String, BTreeSet<String>>,
}

impl Allocation {
    /// Attach to the record in `dir`.
    ///
    /// Fails with [`AllocatorError::Invalid`] if the record is gone or
    /// references a target that is not registered anymore.
    pub(crate) fn open(
        dir: &Path,
        id: &str,
        registry: &TargetRegistry,
        lock_timeout: Duration,
        lock_wait: Duration,
    ) -> AllocResult<Self> {
        let fsdb = Fsdb::attach(dir)?;
        let mut groups = BTreeMap::new();
        for (key, value) in fsdb.entries(&format!("{PREFIX_GROUP}*"))? {
            let Some(name) = key.strip_prefix(PREFIX_GROUP) else {
                continue;
            };
            let Some(list) = value.as_str() else {
                return Err(AllocatorError::Corrupt {
                    key,
                    reason: "group is not a string list".into(),
                });
            };
            let members: BTreeSet<String> = split_list(list).into_iter().collect();
            if let Some(gone) = members.iter().find(|t| !registry.contains(t)) {
                return Err(AllocatorError::Invalid(format!(
                    "{id}: target {gone} is not available anymore"
                )));
            }
            groups.insert(name.to_owned(), members);
        }
        let lock = FileLock::in_dir(fsdb.location(), lock_timeout, lock_wait);
        Ok(Self {
            id: id.to_owned(),
            fsdb,
            lock,
            groups,
        })
    }

    /// Allocation id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Target groups by name.
    #[must_use]
    pub const fn groups(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.groups
    }

    /// Union of all groups.
    #[must_use]
    pub fn targets_all(&self) -> BTreeSet<String> {
        self.groups.values().flatten().cloned().collect()
    }

    /// Map a vanished-directory I/O error to [`AllocatorError::Invalid`].
    fn gone(&self, err: AllocatorError) -> AllocatorError {
        match err {
            AllocatorError::Io(io) if io.kind() == ErrorKind::NotFound => {
                AllocatorError::Invalid(format!("{}: allocation was removed", self.id))
            }
            other => other,
        }
    }

    fn put(&self, key: &str, value: impl Into<Value>) -> AllocResult<()> {
        self.fsdb.put(key, value).map_err(|e| self.gone(e))
    }

    /// Take the allocation lock.
    pub fn lock(&self) -> AllocResult<FileLockGuard> {
        self.lock.acquire().map_err(|e| self.gone(e))
    }

    /// True while the record exists on disk.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.fsdb.location().is_dir()
    }

    /// Last change to the record directory.
    pub fn modified(&self) -> AllocResult<DateTime<Utc>> {
        let modified = std::fs::metadata(self.fsdb.location())
            .and_then(|meta| meta.modified())
            .map_err(|e| self.gone(e.into()))?;
        Ok(DateTime::<Utc>::from(modified))
    }

    /// Current state; `None` while the record is being created.
    pub fn state(&self) -> AllocResult<Option<AllocationState>> {
        let Some(raw) = self.fsdb.get_str(KEY_STATE)? else {
            if !self.exists() {
                return Err(self.gone(std::io::Error::from(ErrorKind::NotFound).into()));
            }
            return Ok(None);
        };
        raw.parse()
            .map(Some)
            .map_err(|reason| AllocatorError::Corrupt {
                key: KEY_STATE.into(),
                reason,
            })
    }

    /// Set the state.
    pub fn set_state(&self, state: AllocationState) -> AllocResult<()> {
        self.put(KEY_STATE, state.as_str())
    }

    /// User the allocation is for.
    pub fn user(&self) -> AllocResult<Option<String>> {
        self.fsdb.get_str(KEY_USER)
    }

    /// Caller that created it.
    pub fn creator(&self) -> AllocResult<Option<String>> {
        self.fsdb.get_str(KEY_CREATOR)
    }

    /// Scaled priority.
    pub fn priority(&self) -> AllocResult<Option<i64>> {
        self.fsdb.get_int(KEY_PRIORITY)
    }

    /// Preemption requested.
    pub fn preempt(&self) -> AllocResult<bool> {
        Ok(self.fsdb.get_bool(KEY_PREEMPT)?.unwrap_or(false))
    }

    /// `static`, a stamp, or nothing.
    pub fn endtime(&self) -> AllocResult<Option<String>> {
        self.fsdb.get_str(KEY_ENDTIME)
    }

    /// Maximum lifetime once active, seconds.
    pub fn ttl_secs(&self) -> AllocResult<Option<u64>> {
        Ok(self
            .fsdb
            .get_int(KEY_TTL)?
            .and_then(|ttl| u64::try_from(ttl).ok())
            .filter(|ttl| *ttl > 0))
    }

    /// Last activity stamp, epoch if never set.
    pub fn timestamp(&self) -> AllocResult<String> {
        Ok(self
            .fsdb
            .get_str(KEY_TIMESTAMP)?
            .unwrap_or_else(|| EPOCH_STAMP.to_owned()))
    }

    /// Record activity now; returns the stamp written.
    pub fn touch(&self) -> AllocResult<String> {
        let stamp = now_stamp();
        self.put(KEY_TIMESTAMP, stamp.as_str())?;
        Ok(stamp)
    }

    /// When the allocation became active.
    pub fn timestamp_start(&self) -> AllocResult<Option<String>> {
        self.fsdb.get_str(KEY_TIMESTAMP_START)
    }

    /// The group that was allocated, once active.
    pub fn group_allocated(&self) -> AllocResult<Option<Vec<String>>> {
        Ok(self.fsdb.get_str(KEY_GROUP_ALLOCATED)?.map(|g| split_list(&g)))
    }

    /// Guest user ids, sorted.
    pub fn guests(&self) -> AllocResult<Vec<String>> {
        let mut guests: Vec<String> = self
            .fsdb
            .entries(&format!("{PREFIX_GUEST}*"))?
            .into_iter()
            .filter_map(|(_, v)| v.as_str().map(str::to_owned))
            .collect();
        guests.sort();
        Ok(guests)
    }

    /// True if `user_id` is a guest.
    pub fn is_guest(&self, user_id: &str) -> AllocResult<bool> {
        Ok(self
            .fsdb
            .get_str(&format!("{PREFIX_GUEST}{}", guest_key(user_id)))?
            .as_deref()
            == Some(user_id))
    }

    /// Add a guest.
    pub fn add_guest(&self, user_id: &str) -> AllocResult<()> {
        self.put(&format!("{PREFIX_GUEST}{}", guest_key(user_id)), user_id)
    }

    /// Remove a guest; unknown guests are ignored.
    pub fn remove_guest(&self, user_id: &str) -> AllocResult<()> {
        if self.is_guest(user_id)? {
            self.fsdb.remove(&format!("{PREFIX_GUEST}{}", guest_key(user_id)))?;
        }
        Ok(())
    }

    /// Opaque client data.
    pub fn extra_data(&self) -> AllocResult<BTreeMap<String, Value>> {
        Ok(self
            .fsdb
            .entries(&format!("{PREFIX_EXTRA}*"))?
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix(PREFIX_EXTRA).map(|k| (k.to_owned(), v)))
            .collect())
    }

    /// True if `user_id` created the allocation or it is for them.
    pub fn is_owner(&self, user_id: &str) -> AllocResult<bool> {
        Ok(self.creator()?.as_deref() == Some(user_id) || self.user()?.as_deref() == Some(user_id))
    }

    /// Caller may change or remove the allocation.
    pub fn may_manage(&self, caller: &dyn Identity) -> AllocResult<bool> {
        Ok(caller.is_admin() || self.is_owner(caller.id())?)
    }

    /// Caller may look at the allocation.
    pub fn may_read(&self, caller: &dyn Identity) -> AllocResult<bool> {
        Ok(self.may_manage(caller)? || self.is_guest(caller.id())?)
    }

    /// Check whether some group is fully owned and act on it.
    ///
    /// Runs under the allocation lock. Target ownership is read without the
    /// target locks: a target lock is never held while taking an allocation
    /// lock, so taking them here would invert the order.
    pub(crate) fn complete_groups(&self, registry: &TargetRegistry) -> AllocResult<GroupOutcome> {
        let _guard = self.lock()?;
        let mut owned = BTreeSet::new();
        for name in self.targets_all() {
            let Some(target) = registry.get(&name) else {
                continue;
            };
            if target.owner_id()?.as_deref() == Some(self.id.as_str()) {
                owned.insert(name);
            }
        }

        match self.state()? {
            Some(AllocationState::Active) => {
                let allocated: BTreeSet<String> =
                    self.group_allocated()?.unwrap_or_default().into_iter().collect();
                Ok(GroupOutcome::Surplus {
                    release: owned.difference(&allocated).cloned().collect(),
                })
            }
            Some(AllocationState::Queued) => {
                for (name, members) in &self.groups {
                    if !members.is_subset(&owned) {
                        continue;
                    }
                    self.put(
                        KEY_GROUP_ALLOCATED,
                        join_list(members.iter().map(String::as_str)),
                    )?;
                    self.put(KEY_TIMESTAMP_START, now_stamp())?;
                    self.set_state(AllocationState::Active)?;
                    return Ok(GroupOutcome::Activated {
                        group: name.clone(),
                        release: owned.difference(members).cloned().collect(),
                    });
                }
                let mut ratios: BTreeMap<String, f64> = BTreeMap::new();
                for members in self.groups.values() {
                    #[allow(clippy::cast_precision_loss)]
                    let ratio =
                        members.intersection(&owned).count() as f64 / members.len().max(1) as f64;
                    for missing in members.difference(&owned) {
                        let best = ratios.entry(missing.clone()).or_insert(0.0);
                        if ratio > *best {
                            *best = ratio;
                        }
                    }
                }
                Ok(GroupOutcome::Pending { ratios })
            }
            _ => Ok(GroupOutcome::Inactive),
        }
    }

    /// Snapshot for `get`/`query`.
    pub fn view(&self) -> AllocResult<AllocationView> {
        Ok(AllocationView {
            user: self.user()?,
            creator: self.creator()?,
            priority: self.priority()?,
            preempt: self.preempt()?,
            reason: self.fsdb.get_str(KEY_REASON)?,
            guests: self.guests()?,
            targets_all: self.targets_all().into_iter().collect(),
            target_group: self
                .groups
                .iter()
                .map(|(name, members)| (name.clone(), members.iter().cloned().collect()))
                .collect(),
            timestamp: self.fsdb.get_str(KEY_TIMESTAMP)?,
            endtime: self.endtime()?,
            extra_data: self.extra_data()?,
        })
    }
}
