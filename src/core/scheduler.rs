//! Target assignment.
//!
//! The scheduler never blocks waiting for a target: it looks at each
//! target's queue, decides whether the best waiter gets it, and moves on.
//! Whoever changes something that may free or want a target (a request, a
//! removal, the maintenance sweep) runs it over the affected targets, and
//! every decision re-reads the queue from disk, so the grant order is the
//! same no matter which process makes it.
//!
//! Locking order: an allocation lock may be held while taking a target
//! lock, never the other way around. Only one target lock is held at a time.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::core::allocation::{Allocation, GroupOutcome};
use crate::core::audit::{build_audit_event, record_audit, SharedAuditSink};
use crate::core::state::AllocationState;
use crate::core::store::AllocationStore;
use crate::core::target::Target;
use crate::core::wait_queue::{self, Waiter, QUEUE_PRIORITY_MAX};
use crate::core::{AllocResult, AllocatorError};
use crate::infra::lock::FileLockGuard;
use crate::util::clock::now_stamp;

/// Priority assumed for an owner that has none recorded.
pub const FALLBACK_OWNER_PRIORITY: i64 = 500_000;

/// Runs assignment decisions over targets.
pub struct Scheduler<'a> {
    store: &'a AllocationStore,
    audit: Option<&'a SharedAuditSink>,
}

impl<'a> Scheduler<'a> {
    /// Scheduler over `store`'s allocations and targets.
    #[must_use]
    pub const fn new(store: &'a AllocationStore, audit: Option<&'a SharedAuditSink>) -> Self {
        Self { store, audit }
    }

    fn audit(&self, alloc_id: &str, target: Option<&str>, action: &str, payload: Option<String>) {
        if self.audit.is_some() {
            let user = self
                .store
                .get(alloc_id)
                .ok()
                .and_then(|a| a.user().ok().flatten())
                .unwrap_or_default();
            record_audit(
                self.audit,
                build_audit_event(alloc_id, target.map(str::to_owned), user, action, payload),
            );
        }
    }

    /// Run over `targets`, and again over any target released on the way.
    ///
    /// `preempt` forces preemption on even if no waiter asked for it.
    pub fn run<I, S>(&self, targets: I, preempt: bool) -> AllocResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut pending: VecDeque<String> =
            targets.into_iter().map(|t| t.as_ref().to_owned()).collect();
        while let Some(name) = pending.pop_front() {
            let Some(target) = self.store.registry().get(&name) else {
                tracing::warn!(target_name = %name, "skipping unknown target");
                continue;
            };
            for released in self.run_target(target, preempt)? {
                if !pending.contains(&released) {
                    pending.push_back(released);
                }
            }
        }
        Ok(())
    }

    /// Hand `target` out for as long as its queue allows; returns targets
    /// that winners gave back.
    pub fn run_target(&self, target: &Target, preempt: bool) -> AllocResult<Vec<String>> {
        let mut released = Vec::new();
        loop {
            let granted = {
                let guard = target.lock()?;
                let current = self.current_owner_locked(target, &guard)?;
                let (waiters, queue_preempt) =
                    wait_queue::load(target, |id| self.store.exists(id))?;
                if waiters.is_empty() {
                    tracing::trace!(target_name = %target.id(), "queue empty");
                    break;
                }
                self.allocate_locked(
                    target,
                    &guard,
                    current.as_ref(),
                    &waiters,
                    preempt || queue_preempt,
                )?
            };
            let Some(allocation) = granted else {
                break;
            };
            released.extend(self.settle(&allocation)?);
        }
        Ok(released)
    }

    /// Owner of `target`, cleaning up ownership by an allocation that is gone.
    fn current_owner_locked(
        &self,
        target: &Target,
        guard: &FileLockGuard,
    ) -> AllocResult<Option<Arc<Allocation>>> {
        let Some(owner) = target.owner_id()? else {
            return Ok(None);
        };
        match self.store.get(&owner) {
            Ok(allocation) => Ok(Some(allocation)),
            Err(AllocatorError::Invalid(reason)) => {
                tracing::info!(target_name = %target.id(), alloc_id = %owner, %reason, "releasing target held by vanished allocation");
                target.wipe_owner_locked(guard)?;
                target.run_release_hooks(false);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Best waiter still queued, with the scaled priority it competes at.
    ///
    /// Keys order waiters exactly up to [`QUEUE_PRIORITY_MAX`]. Waiters
    /// whose key saturated at that value are ordered by the priority on
    /// their allocation record, then by key. Stale entries are dropped on
    /// the way.
    fn first_valid_waiter<'w>(
        &self,
        target: &Target,
        waiters: &'w [Waiter],
        current: Option<&Arc<Allocation>>,
    ) -> AllocResult<Option<(&'w Waiter, Arc<Allocation>, u32)>> {
        let mut best: Option<(&'w Waiter, Arc<Allocation>, u32)> = None;
        for waiter in waiters {
            if best
                .as_ref()
                .is_some_and(|(w, _, _)| w.priority < QUEUE_PRIORITY_MAX)
            {
                break;
            }
            let Some(allocation) = self.queued_allocation(target, waiter, current)? else {
                continue;
            };
            let priority = if waiter.priority < QUEUE_PRIORITY_MAX {
                waiter.priority
            } else {
                allocation
                    .priority()?
                    .and_then(|p| u32::try_from(p).ok())
                    .unwrap_or(waiter.priority)
            };
            if best.as_ref().is_none_or(|(_, _, p)| priority < *p) {
                best = Some((waiter, allocation, priority));
            }
        }
        Ok(best)
    }

    /// The allocation behind `waiter` if it is still queued; otherwise the
    /// entry is dropped.
    fn queued_allocation(
        &self,
        target: &Target,
        waiter: &Waiter,
        current: Option<&Arc<Allocation>>,
    ) -> AllocResult<Option<Arc<Allocation>>> {
        if current.is_some_and(|c| c.id() == waiter.alloc_id) {
            wait_queue::dequeue(target, &waiter.key)?;
            return Ok(None);
        }
        let allocation = match self.store.get(&waiter.alloc_id) {
            Ok(allocation) => allocation,
            Err(AllocatorError::Invalid(_)) => {
                wait_queue::dequeue(target, &waiter.key)?;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        match allocation.state() {
            Ok(Some(AllocationState::Queued)) => Ok(Some(allocation)),
            Ok(state) => {
                tracing::debug!(target_name = %target.id(), alloc_id = %waiter.alloc_id, ?state, "dropping waiter that is not queued");
                wait_queue::dequeue(target, &waiter.key)?;
                Ok(None)
            }
            Err(AllocatorError::Invalid(_)) => {
                wait_queue::dequeue(target, &waiter.key)?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Decide who holds `target` next, with its lock held.
    ///
    /// Returns the allocation that was just granted the target, if any.
    pub(crate) fn allocate_locked(
        &self,
        target: &Target,
        guard: &FileLockGuard,
        current: Option<&Arc<Allocation>>,
        waiters: &[Waiter],
        preempt: bool,
    ) -> AllocResult<Option<Arc<Allocation>>> {
        let Some((waiter, allocation, priority)) =
            self.first_valid_waiter(target, waiters, current)?
        else {
            return Ok(None);
        };

        if let Some(owner) = current {
            let owner_priority = target.owner_priority()?.unwrap_or_else(|| {
                tracing::error!(target_name = %target.id(), alloc_id = %owner.id(), "owner has no recorded priority");
                FALLBACK_OWNER_PRIORITY
            });
            if owner_priority <= i64::from(priority) {
                tracing::debug!(target_name = %target.id(), owner = %owner.id(), waiter = %waiter.alloc_id, "owner keeps target");
                return Ok(None);
            }
            if !preempt {
                tracing::debug!(target_name = %target.id(), owner = %owner.id(), waiter = %waiter.alloc_id, "higher priority waiter, preemption off");
                return Ok(None);
            }
            tracing::info!(target_name = %target.id(), owner = %owner.id(), waiter = %waiter.alloc_id, "preempting");
            target.wipe_owner_locked(guard)?;
            target.run_release_hooks(false);
            match owner.set_state(AllocationState::RestartNeeded) {
                Ok(()) | Err(AllocatorError::Invalid(_)) => {}
                Err(err) => return Err(err),
            }
            self.audit(
                owner.id(),
                Some(target.id()),
                "preempt",
                Some(format!("preempted by {}", waiter.alloc_id)),
            );
        }

        target.assign_locked(guard, &allocation, priority, &now_stamp())?;
        wait_queue::dequeue(target, &waiter.key)?;
        target.run_assign_hooks(&allocation);
        tracing::info!(target_name = %target.id(), alloc_id = %allocation.id(), priority, "target assigned");
        self.audit(allocation.id(), Some(target.id()), "assign", None);
        Ok(Some(allocation))
    }

    /// After a grant, see whether the allocation is complete; returns the
    /// targets it gave back.
    fn settle(&self, allocation: &Allocation) -> AllocResult<Vec<String>> {
        let registry = self.store.registry();
        let outcome = match allocation.complete_groups(registry) {
            Ok(outcome) => outcome,
            Err(AllocatorError::Invalid(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let release = match outcome {
            GroupOutcome::Activated { group, release } => {
                tracing::info!(alloc_id = %allocation.id(), %group, "allocation active");
                self.audit(allocation.id(), None, "active", Some(group));
                for name in allocation.targets_all() {
                    if let Some(target) = registry.get(&name) {
                        wait_queue::remove_alloc(target, allocation.id())?;
                    }
                }
                release
            }
            GroupOutcome::Surplus { release } => release,
            GroupOutcome::Pending { ratios } => {
                for (name, ratio) in ratios {
                    self.starvation_recalculate(&name, allocation.id(), ratio);
                }
                return Ok(Vec::new());
            }
            GroupOutcome::Inactive => return Ok(Vec::new()),
        };

        let mut released = Vec::new();
        for name in release {
            let Some(target) = registry.get(&name) else {
                continue;
            };
            let guard = target.lock()?;
            if target.release_if_owner_locked(&guard, allocation.id())? {
                tracing::debug!(target_name = %name, alloc_id = %allocation.id(), "releasing surplus target");
                released.push(name);
            }
        }
        Ok(released)
    }

    /// Extension point for boosting waiters that keep losing a target.
    fn starvation_recalculate(&self, target: &str, alloc_id: &str, ratio: f64) {
        let _ = self;
        tracing::debug!(target_name = %target, %alloc_id, ratio, "starvation recalculation not implemented");
    }
}
