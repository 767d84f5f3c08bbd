//! Allocatable targets and the registry holding them.
//!
//! A target's persistent state lives in its own fsdb directory:
//!
//! | key                      | meaning                                   |
//! |--------------------------|-------------------------------------------|
//! | `_alloc.id`              | owning allocation                         |
//! | `_alloc.priority`        | scaled priority the owner was granted at  |
//! | `_alloc.timestamp_start` | when the current owner got it             |
//! | `owner`                  | user of the owning allocation             |
//! | `timestamp`              | last time anybody touched the target      |
//! | `_alloc.queue.*`         | wait queue, see [`crate::core::wait_queue`] |
//!
//! The ownership keys are only written with the target lock held. Callers
//! prove that by passing the [`FileLockGuard`] they got from [`Target::lock`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::core::allocation::Allocation;
use crate::core::{AllocResult, AllocatorError};
use crate::infra::fsdb::{is_valid_key, Fsdb};
use crate::infra::lock::{FileLock, FileLockGuard};
use crate::util::clock::EPOCH_STAMP;

const KEY_OWNER_ID: &str = "_alloc.id";
const KEY_OWNER_PRIORITY: &str = "_alloc.priority";
const KEY_OWNER_START: &str = "_alloc.timestamp_start";
const KEY_OWNER_USER: &str = "owner";
const KEY_TIMESTAMP: &str = "timestamp";

/// Runs when a target is handed to an allocation, once per interface.
pub trait AssignHook: Send + Sync {
    /// Called after `target` was assigned to `allocation`.
    fn on_assigned(&self, target: &Target, allocation: &Allocation);
}

/// Runs when a target is released.
pub trait ReleaseHook: Send + Sync {
    /// Called after ownership is dropped; `force` is set when the owner is
    /// going away for good rather than being shuffled around.
    fn on_release(&self, target: &Target, force: bool);
}

/// Power state as reported by a [`PowerControl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Everything on.
    On,
    /// Some components on.
    Partial,
    /// Off, except components that only go off explicitly.
    Off,
    /// Every component off.
    FullyOff,
}

/// Power control interface used by the idle power-off sweep.
pub trait PowerControl: Send + Sync {
    /// Current power state.
    fn state(&self, target: &Target) -> AllocResult<PowerState>;

    /// Power off; `explicit` also turns off components that are normally
    /// left on.
    fn power_off(&self, target: &Target, explicit: bool) -> AllocResult<()>;
}

/// Per-target knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetProperties {
    /// Never power this target off when idle.
    pub skip_cleanup: bool,
    /// Override for the idle soft power-off threshold (seconds, 0 disables).
    pub idle_power_off_secs: Option<u64>,
    /// Override for the idle full power-off threshold (seconds, 0 disables).
    pub idle_power_fully_off_secs: Option<u64>,
}

/// A lab resource that can be allocated.
pub struct Target {
    id: String,
    fsdb: Fsdb,
    lock: FileLock,
    properties: TargetProperties,
    assign_hooks: BTreeMap<String, Arc<dyn AssignHook>>,
    release_hooks: Vec<Arc<dyn ReleaseHook>>,
    power: Option<Arc<dyn PowerControl>>,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id)
            .field("location", &self.fsdb.location())
            .field("properties", &self.properties)
            .field("assign_hooks", &self.assign_hooks.keys().collect::<Vec<_>>())
            .field("release_hooks", &self.release_hooks.len())
            .field("power", &self.power.is_some())
            .finish()
    }
}

/// True if `id` can name a target.
///
/// Target names end up in file names and in comma separated lists.
#[must_use]
pub fn is_valid_target_id(id: &str) -> bool {
    is_valid_key(id) && !id.contains(',') && !id.chars().any(char::is_whitespace)
}

impl Target {
    /// Open (creating if needed) the state directory `state_dir` for target `id`.
    pub fn open(
        id: impl Into<String>,
        state_dir: impl AsRef<Path>,
        lock_timeout: Duration,
        lock_wait: Duration,
        properties: TargetProperties,
    ) -> AllocResult<Self> {
        let id = id.into();
        if !is_valid_target_id(&id) {
            return Err(AllocatorError::Config(format!("{id:?}: invalid target name")));
        }
        let fsdb = Fsdb::open(state_dir)?;
        let lock = FileLock::in_dir(fsdb.location(), lock_timeout, lock_wait);
        Ok(Self {
            id,
            fsdb,
            lock,
            properties,
            assign_hooks: BTreeMap::new(),
            release_hooks: Vec::new(),
            power: None,
        })
    }

    /// Register an assign hook for interface `interface`.
    #[must_use]
    pub fn with_assign_hook(mut self, interface: impl Into<String>, hook: Arc<dyn AssignHook>) -> Self {
        self.assign_hooks.insert(interface.into(), hook);
        self
    }

    /// Register a release hook.
    #[must_use]
    pub fn with_release_hook(mut self, hook: Arc<dyn ReleaseHook>) -> Self {
        self.release_hooks.push(hook);
        self
    }

    /// Attach power control.
    #[must_use]
    pub fn with_power(mut self, power: Arc<dyn PowerControl>) -> Self {
        self.power = Some(power);
        self
    }

    /// Target name.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Backing store.
    #[must_use]
    pub const fn fsdb(&self) -> &Fsdb {
        &self.fsdb
    }

    /// Per-target knobs.
    #[must_use]
    pub const fn properties(&self) -> &TargetProperties {
        &self.properties
    }

    /// Power control, if any.
    #[must_use]
    pub fn power(&self) -> Option<&Arc<dyn PowerControl>> {
        self.power.as_ref()
    }

    /// Take the target lock.
    pub fn lock(&self) -> AllocResult<FileLockGuard> {
        self.lock.acquire()
    }

    fn assert_locked(&self, guard: &FileLockGuard) {
        debug_assert_eq!(guard.path(), self.lock.path(), "{}: foreign lock guard", self.id);
    }

    /// Owning allocation id (unlocked read).
    pub fn owner_id(&self) -> AllocResult<Option<String>> {
        self.fsdb.get_str(KEY_OWNER_ID)
    }

    /// Priority the owner was granted at.
    pub fn owner_priority(&self) -> AllocResult<Option<i64>> {
        self.fsdb.get_int(KEY_OWNER_PRIORITY)
    }

    /// User owning the target.
    pub fn owner_user(&self) -> AllocResult<Option<String>> {
        self.fsdb.get_str(KEY_OWNER_USER)
    }

    /// When the current owner got the target.
    pub fn owner_since(&self) -> AllocResult<Option<String>> {
        self.fsdb.get_str(KEY_OWNER_START)
    }

    /// Last time the target was touched, epoch if never.
    pub fn timestamp(&self) -> AllocResult<String> {
        Ok(self
            .fsdb
            .get_str(KEY_TIMESTAMP)?
            .unwrap_or_else(|| EPOCH_STAMP.to_owned()))
    }

    /// Record activity on the target.
    pub fn set_timestamp(&self, stamp: &str) -> AllocResult<()> {
        self.fsdb.put(KEY_TIMESTAMP, stamp)
    }

    /// Hand the target to `allocation`.
    pub(crate) fn assign_locked(
        &self,
        guard: &FileLockGuard,
        allocation: &Allocation,
        priority: u32,
        stamp: &str,
    ) -> AllocResult<()> {
        self.assert_locked(guard);
        let user = allocation.user()?.unwrap_or_default();
        self.fsdb.put(KEY_OWNER_PRIORITY, priority)?;
        self.fsdb.put(KEY_OWNER_USER, user)?;
        self.fsdb.put(KEY_OWNER_START, stamp)?;
        self.fsdb.put(KEY_TIMESTAMP, stamp)?;
        // written last: a crash before here leaves the target unowned
        self.fsdb.put(KEY_OWNER_ID, allocation.id())
    }

    /// Drop ownership records.
    pub(crate) fn wipe_owner_locked(&self, guard: &FileLockGuard) -> AllocResult<()> {
        self.assert_locked(guard);
        self.fsdb.remove(KEY_OWNER_ID)?;
        self.fsdb.remove(KEY_OWNER_PRIORITY)?;
        self.fsdb.remove(KEY_OWNER_START)?;
        self.fsdb.remove(KEY_OWNER_USER)
    }

    /// Release the target if `alloc_id` still owns it. Release hooks are not
    /// run; the next owner's assign hooks reset what matters.
    pub(crate) fn release_if_owner_locked(
        &self,
        guard: &FileLockGuard,
        alloc_id: &str,
    ) -> AllocResult<bool> {
        if self.owner_id()?.as_deref() != Some(alloc_id) {
            return Ok(false);
        }
        self.wipe_owner_locked(guard)?;
        Ok(true)
    }

    /// Restore the activity stamp unless somebody owns the target by now.
    pub(crate) fn restore_timestamp(&self, stamp: &str) -> AllocResult<()> {
        let guard = self.lock()?;
        self.assert_locked(&guard);
        if self.owner_id()?.is_none() {
            self.set_timestamp(stamp)?;
        }
        Ok(())
    }

    /// Run the release hooks.
    pub(crate) fn run_release_hooks(&self, force: bool) {
        for hook in &self.release_hooks {
            hook.on_release(self, force);
        }
    }

    /// Run the assign hooks, interface by interface.
    pub(crate) fn run_assign_hooks(&self, allocation: &Allocation) {
        for (interface, hook) in &self.assign_hooks {
            tracing::debug!(target_name = %self.id, %interface, alloc_id = %allocation.id(), "running assign hook");
            hook.on_assigned(self, allocation);
        }
    }
}

/// Every known target, by name.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: BTreeMap<String, Arc<Target>>,
}

impl TargetRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a target; names must be unique.
    pub fn insert(&mut self, target: Target) -> AllocResult<()> {
        if self.targets.contains_key(target.id()) {
            return Err(AllocatorError::Config(format!(
                "{}: duplicate target",
                target.id()
            )));
        }
        self.targets.insert(target.id().to_owned(), Arc::new(target));
        Ok(())
    }

    /// Look a target up.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<Target>> {
        self.targets.get(id)
    }

    /// True if `id` is known.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.targets.contains_key(id)
    }

    /// Targets in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Target>> {
        self.targets.values()
    }

    /// Target names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    /// Number of targets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// True if no target is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
