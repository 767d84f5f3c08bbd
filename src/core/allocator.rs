//! Public allocation API.
//!
//! Every operation answers with an [`AllocationReply`]. Caller mistakes and
//! missing rights are `rejected` replies, unknown allocations are `invalid`
//! replies; `Err` is kept for lock timeouts, I/O failures and corruption
//! that could not be repaired on the spot.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use crate::config::AllocatorConfig;
use crate::core::allocation::{Allocation, NewAllocation};
use crate::core::audit::{build_audit_event, record_audit, AuditSink, SharedAuditSink};
use crate::core::identity::{AdminPreemptPolicy, AllocationPolicy, Identity, PolicyRequest};
use crate::core::reply::AllocationReply;
use crate::core::request::AllocationRequest;
use crate::core::scheduler::Scheduler;
use crate::core::state::AllocationState;
use crate::core::store::AllocationStore;
use crate::core::target::TargetRegistry;
use crate::core::wait_queue;
use crate::core::{AllocResult, AllocatorError};
use crate::infra::replay::ReplayGuard;
use crate::util::clock::format_stamp;
use crate::util::ids::is_valid_identifier;

/// The allocation engine.
///
/// Any number of `Allocator`s, in any number of processes, may share one
/// state directory; all coordination goes through file locks.
pub struct Allocator {
    config: AllocatorConfig,
    store: AllocationStore,
    replay: ReplayGuard,
    policy: Arc<dyn AllocationPolicy>,
    audit: Option<SharedAuditSink>,
}

impl Allocator {
    /// Allocator over `registry`, keeping state under `config.state_path`.
    pub fn new(config: AllocatorConfig, registry: Arc<TargetRegistry>) -> AllocResult<Self> {
        config.validate().map_err(AllocatorError::Config)?;
        let store = AllocationStore::open(
            config.allocations_path(),
            registry,
            config.cache_ttl(),
            config.cache_max_entries,
            config.lock_timeout(),
            config.lock_wait(),
        )?;
        let replay = ReplayGuard::open(
            config.uuid_db_path(),
            config.lock_timeout(),
            config.lock_wait(),
            config.uuid_max_age(),
            config.uuid_max_entries,
        )?;
        Ok(Self {
            config,
            store,
            replay,
            policy: Arc::new(AdminPreemptPolicy),
            audit: None,
        })
    }

    /// Replace the request policy.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn AllocationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Report state transitions to `sink`.
    #[must_use]
    pub fn with_audit_sink(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.audit = Some(Arc::new(parking_lot::Mutex::new(sink)));
        self
    }

    /// Report state transitions to an already shared sink.
    #[must_use]
    pub fn with_shared_audit_sink(mut self, sink: SharedAuditSink) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Registered targets.
    #[must_use]
    pub fn registry(&self) -> &Arc<TargetRegistry> {
        self.store.registry()
    }

    /// Allocation records.
    #[must_use]
    pub const fn store(&self) -> &AllocationStore {
        &self.store
    }

    /// Scheduler bound to this allocator's store and audit sink.
    #[must_use]
    pub fn scheduler(&self) -> Scheduler<'_> {
        Scheduler::new(&self.store, self.audit.as_ref())
    }

    pub(crate) fn audit(&self, alloc_id: &str, user: &str, action: &str, payload: Option<String>) {
        record_audit(
            self.audit.as_ref(),
            build_audit_event(alloc_id, None, user, action, payload),
        );
    }

    /// Ask for one of the request's target groups.
    ///
    /// The allocation is created `queued` and the scheduler is run over its
    /// targets. If it did not become active and the caller does not want to
    /// queue, it is removed again and `busy` is returned.
    pub fn request(
        &self,
        request: &AllocationRequest,
        caller: &dyn Identity,
    ) -> AllocResult<AllocationReply> {
        let now = Utc::now();
        let validated = match request.validate(
            self.store.registry(),
            self.config.default_priority,
            self.config.reason_len_max,
            now,
        ) {
            Ok(validated) => validated,
            Err(message) => return Ok(AllocationReply::rejected(message)),
        };
        let obo_user = request.obo_user.as_deref().unwrap_or_else(|| caller.id());
        if !is_valid_identifier(obo_user) {
            return Ok(AllocationReply::rejected(format!(
                "{obo_user:?} is not a valid user name"
            )));
        }
        if let Some(message) = self.policy.check(
            caller,
            &PolicyRequest {
                on_behalf_of: obo_user,
                guests: &request.guests,
                priority: validated.priority,
                preempt: request.preempt,
                queue: request.queue,
                shared: request.shared,
            },
        ) {
            return Ok(AllocationReply::rejected(message));
        }
        // claimed last: nothing below rejects, and every failure forgets it
        let uuid = validated.uuid.as_deref();
        if let Some(uuid) = uuid {
            if let Some(message) = self.replay.claim(uuid, now)? {
                return Ok(AllocationReply::rejected(message));
            }
        }

        let (alloc_id, fsdb) = match self.store.create() {
            Ok(created) => created,
            Err(err) => {
                self.abandon(None, uuid);
                return Err(err);
            }
        };
        let stamp = format_stamp(now);
        let mut extra_data = request.extra_data.clone();
        if let (Some(uuid), Some(slot)) = (uuid, extra_data.get_mut("uuid")) {
            *slot = ReplayGuard::normalize(uuid).unwrap_or_else(|| uuid.to_owned()).into();
        }
        let written = NewAllocation {
            user: obo_user,
            creator: caller.id(),
            priority: validated.priority,
            preempt: request.preempt,
            shared: request.shared,
            reason: validated.reason.as_deref(),
            endtime: validated.endtime.as_deref(),
            ttl_secs: self.config.max_ttl_secs,
            guests: &request.guests,
            extra_data: &extra_data,
            groups: &validated.groups,
            stamp: &stamp,
        }
        .write(&fsdb)
        .and_then(|()| self.store.get(&alloc_id));
        let allocation = match written {
            Ok(allocation) => allocation,
            Err(err) => {
                self.abandon(Some(alloc_id.as_str()), uuid);
                return Err(err);
            }
        };

        let targets = allocation.targets_all();
        for name in &targets {
            let Some(target) = self.store.registry().get(name) else {
                continue;
            };
            if let Err(err) = wait_queue::enqueue(
                target,
                validated.priority,
                &stamp,
                request.preempt,
                request.shared,
                &alloc_id,
            ) {
                self.abandon(Some(alloc_id.as_str()), uuid);
                return Err(err);
            }
        }
        tracing::info!(%alloc_id, user = %obo_user, creator = %caller.id(), priority = validated.priority, preempt = request.preempt, "allocation requested");
        self.audit(&alloc_id, obo_user, "request", None);

        self.scheduler().run(&targets, request.preempt)?;

        let state = match allocation.state() {
            Ok(state) => state.unwrap_or(AllocationState::Invalid),
            Err(AllocatorError::Invalid(_)) => return Ok(AllocationReply::invalid()),
            Err(err) => return Err(err),
        };
        match state {
            AllocationState::Active => Ok(AllocationReply::new(state)
                .with_alloc_id(alloc_id)
                .with_group(allocation.group_allocated()?)),
            AllocationState::Queued if request.queue => {
                Ok(AllocationReply::new(state).with_alloc_id(alloc_id))
            }
            AllocationState::Queued => {
                self.remove(&allocation, AllocationState::Busy)?;
                Ok(AllocationReply::new(AllocationState::Busy))
            }
            other => {
                self.remove(&allocation, other)?;
                Ok(AllocationReply::new(other))
            }
        }
    }

    /// Refresh an allocation's activity stamp and report its state.
    ///
    /// The allocated group is included when the allocation is active and
    /// the caller's `expected` state is not `active` already. A
    /// `restart-needed` allocation is removed after being reported.
    /// `pressure` is a client hint that is currently ignored.
    pub fn keepalive(
        &self,
        alloc_id: &str,
        expected: Option<AllocationState>,
        pressure: i64,
        caller: &dyn Identity,
    ) -> AllocResult<AllocationReply> {
        let allocation = match self.store.get(alloc_id) {
            Ok(allocation) => allocation,
            Err(AllocatorError::Invalid(_)) => return Ok(AllocationReply::invalid()),
            Err(err) => return Err(err),
        };
        if !allocation.may_manage(caller)? {
            return Ok(AllocationReply::rejected(
                "guests can't keepalive an allocation they do not own",
            ));
        }
        tracing::trace!(%alloc_id, pressure, "keepalive");
        let state = match allocation
            .touch()
            .and_then(|_| allocation.state())
        {
            Ok(state) => state.unwrap_or(AllocationState::Invalid),
            Err(AllocatorError::Invalid(_)) => return Ok(AllocationReply::invalid()),
            Err(err) => return Err(err),
        };
        let mut reply = AllocationReply::new(state);
        match state {
            AllocationState::Active if expected != Some(AllocationState::Active) => {
                reply = reply.with_group(allocation.group_allocated()?);
            }
            AllocationState::RestartNeeded => {
                self.remove(&allocation, AllocationState::RestartNeeded)?;
            }
            _ => {}
        }
        Ok(reply)
    }

    /// Every allocation the caller may see, by id.
    pub fn query(&self, caller: &dyn Identity) -> AllocResult<BTreeMap<String, AllocationReply>> {
        let mut out = BTreeMap::new();
        for alloc_id in self.store.ids()? {
            let allocation = match self.store.get(&alloc_id) {
                Ok(allocation) => allocation,
                Err(AllocatorError::Invalid(_) | AllocatorError::Corrupt { .. }) => {
                    if caller.is_admin() {
                        out.insert(alloc_id, AllocationReply::invalid());
                    }
                    continue;
                }
                Err(err) => return Err(err),
            };
            match self.describe(&allocation, caller) {
                Ok(Some(reply)) => {
                    out.insert(alloc_id, reply);
                }
                Ok(None) => {}
                Err(AllocatorError::Invalid(_) | AllocatorError::Corrupt { .. }) => {
                    out.insert(alloc_id, AllocationReply::invalid());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    /// One allocation, in full.
    pub fn get(&self, alloc_id: &str, caller: &dyn Identity) -> AllocResult<AllocationReply> {
        let allocation = match self.store.get(alloc_id) {
            Ok(allocation) => allocation,
            Err(AllocatorError::Invalid(_)) => return Ok(AllocationReply::invalid()),
            Err(err) => return Err(err),
        };
        match self.describe(&allocation, caller) {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Ok(AllocationReply::rejected(
                "not allowed to read this allocation",
            )),
            Err(AllocatorError::Invalid(_)) => Ok(AllocationReply::invalid()),
            Err(err) => Err(err),
        }
    }

    fn describe(
        &self,
        allocation: &Allocation,
        caller: &dyn Identity,
    ) -> AllocResult<Option<AllocationReply>> {
        if !allocation.may_read(caller)? {
            return Ok(None);
        }
        let state = allocation.state()?.unwrap_or(AllocationState::Invalid);
        let group = if state == AllocationState::Active {
            allocation.group_allocated()?
        } else {
            None
        };
        Ok(Some(
            AllocationReply::new(state)
                .with_alloc_id(allocation.id())
                .with_group(group)
                .with_details(allocation.view()?),
        ))
    }

    /// Remove an allocation, releasing whatever it holds. Removing an
    /// unknown allocation answers `invalid`; doing it twice is harmless.
    pub fn delete(&self, alloc_id: &str, caller: &dyn Identity) -> AllocResult<AllocationReply> {
        let allocation = match self.store.get(alloc_id) {
            Ok(allocation) => allocation,
            Err(AllocatorError::Invalid(_)) => return Ok(AllocationReply::invalid()),
            Err(err) => return Err(err),
        };
        if !allocation.may_manage(caller)? {
            let message = if allocation.is_guest(caller.id())? {
                "guests can't remove an allocation; remove yourself as guest instead"
            } else {
                "no permission to remove other's allocation"
            };
            return Ok(AllocationReply::rejected(message));
        }
        self.remove(&allocation, AllocationState::Removed)?;
        Ok(AllocationReply::new(AllocationState::Removed))
    }

    /// Let `guest` use the allocation.
    pub fn guest_add(
        &self,
        alloc_id: &str,
        caller: &dyn Identity,
        guest: &str,
    ) -> AllocResult<AllocationReply> {
        if !is_valid_identifier(guest) {
            return Ok(AllocationReply::rejected(format!(
                "{guest:?} is not a valid user name"
            )));
        }
        let allocation = match self.store.get(alloc_id) {
            Ok(allocation) => allocation,
            Err(AllocatorError::Invalid(_)) => return Ok(AllocationReply::invalid()),
            Err(err) => return Err(err),
        };
        if !allocation.may_manage(caller)? {
            return Ok(AllocationReply::rejected(
                "only the creator, user or an admin can add guests",
            ));
        }
        self.guest_update(&allocation, caller, guest, true)
    }

    /// Stop letting `guest` use the allocation. Guests may remove themselves.
    pub fn guest_remove(
        &self,
        alloc_id: &str,
        caller: &dyn Identity,
        guest: &str,
    ) -> AllocResult<AllocationReply> {
        if !is_valid_identifier(guest) {
            return Ok(AllocationReply::rejected(format!(
                "{guest:?} is not a valid user name"
            )));
        }
        let allocation = match self.store.get(alloc_id) {
            Ok(allocation) => allocation,
            Err(AllocatorError::Invalid(_)) => return Ok(AllocationReply::invalid()),
            Err(err) => return Err(err),
        };
        if caller.id() != guest && !allocation.may_manage(caller)? {
            return Ok(AllocationReply::rejected(
                "only the creator, user, an admin or the guest itself can remove a guest",
            ));
        }
        self.guest_update(&allocation, caller, guest, false)
    }

    fn guest_update(
        &self,
        allocation: &Allocation,
        caller: &dyn Identity,
        guest: &str,
        add: bool,
    ) -> AllocResult<AllocationReply> {
        let updated = if add {
            allocation.add_guest(guest)
        } else {
            allocation.remove_guest(guest)
        };
        let state = match updated.and_then(|()| allocation.state()) {
            Ok(state) => state.unwrap_or(AllocationState::Invalid),
            Err(AllocatorError::Invalid(_)) => return Ok(AllocationReply::invalid()),
            Err(err) => return Err(err),
        };
        let action = if add { "guest_add" } else { "guest_remove" };
        tracing::info!(alloc_id = %allocation.id(), %guest, by = %caller.id(), action, "guest list changed");
        self.audit(allocation.id(), caller.id(), action, Some(guest.to_owned()));
        Ok(AllocationReply::new(state)
            .with_alloc_id(allocation.id())
            .with_message(format!(
                "{guest} {}",
                if add { "added as guest" } else { "removed as guest" }
            )))
    }

    /// Tear an allocation down, recording `reason` as the final state.
    ///
    /// Every target the allocation still owns is released under the
    /// target's lock; release hooks run in force mode if it was active.
    /// The record is wiped even if releasing failed, and the scheduler is
    /// run over the targets it was interested in.
    pub(crate) fn remove(&self, allocation: &Allocation, reason: AllocationState) -> AllocResult<()> {
        let user = allocation.user().ok().flatten().unwrap_or_default();
        let released = self.release_targets(allocation);
        self.store.wipe(allocation.id())?;
        tracing::info!(alloc_id = %allocation.id(), state = %reason, "allocation removed");
        let action = match reason {
            AllocationState::Timedout => "timedout",
            AllocationState::Overtime => "overtime",
            _ => "delete",
        };
        self.audit(allocation.id(), &user, action, Some(reason.as_str().to_owned()));
        let targets = released?;
        self.scheduler().run(&targets, false)
    }

    /// Undo a request that failed half way: its queue entries, its record
    /// and its UUID claim. Cleanup failures are only logged; the caller
    /// reports the error that got it here.
    fn abandon(&self, alloc_id: Option<&str>, uuid: Option<&str>) {
        if let Some(alloc_id) = alloc_id {
            for target in self.store.registry().iter() {
                if let Err(err) = wait_queue::remove_alloc(target, alloc_id) {
                    tracing::warn!(target_name = %target.id(), %alloc_id, %err, "cannot drop queue entries of failed request");
                }
            }
            if let Err(err) = self.store.wipe(alloc_id) {
                tracing::warn!(%alloc_id, %err, "cannot wipe record of failed request");
            }
        }
        if let Some(uuid) = uuid {
            if let Err(err) = self.replay.forget(uuid) {
                tracing::warn!(%uuid, %err, "cannot release uuid of failed request");
            }
        }
    }

    fn release_targets(&self, allocation: &Allocation) -> AllocResult<Vec<String>> {
        let _guard = match allocation.lock() {
            Ok(guard) => Some(guard),
            Err(AllocatorError::Invalid(_)) => None,
            Err(err) => return Err(err),
        };
        let state = match allocation.state() {
            Ok(state) => state,
            Err(AllocatorError::Invalid(_)) => None,
            Err(err) => return Err(err),
        };
        // partial holdings of a queued allocation go back quietly
        let force = state == Some(AllocationState::Active);
        let targets: Vec<String> = allocation.targets_all().into_iter().collect();
        for name in &targets {
            let Some(target) = self.store.registry().get(name) else {
                continue;
            };
            let guard = target.lock()?;
            if target.release_if_owner_locked(&guard, allocation.id())? {
                tracing::debug!(target_name = %name, alloc_id = %allocation.id(), force, "target released");
                target.run_release_hooks(force);
            }
        }
        Ok(targets)
    }
}
