//! Periodic cleanup: expiring allocations and powering off idle targets.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::allocation::Allocation;
use crate::core::allocator::Allocator;
use crate::core::identity::Identity;
use crate::core::request::{AllocationRequest, ENDTIME_STATIC};
use crate::core::state::AllocationState;
use crate::core::target::{PowerState, Target};
use crate::core::{AllocResult, AllocatorError};
use crate::util::clock::parse_stamp;

/// What a sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Allocations removed, with the state they were removed as.
    pub expired: Vec<(String, AllocationState)>,
    /// Targets powered off.
    pub powered_off: Vec<String>,
    /// Targets fully powered off.
    pub fully_powered_off: Vec<String>,
}

/// Power action the idle check decided on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PowerAction {
    Off,
    FullyOff,
}

fn seconds_since(now: DateTime<Utc>, stamp: &str) -> Option<i64> {
    parse_stamp(stamp).map(|at| now.signed_duration_since(at).num_seconds())
}

fn exceeds(elapsed: i64, limit_secs: u64) -> bool {
    u64::try_from(elapsed).is_ok_and(|elapsed| elapsed > limit_secs)
}

impl Allocator {
    /// Expire allocations, power off idle free targets, then reschedule
    /// every target.
    ///
    /// Idle power-off probes acquire targets through [`Allocator::request`]
    /// as `caller`. Failures on one allocation or target are logged and the
    /// sweep goes on; only the final scheduler run can fail the call.
    pub fn maintenance(
        &self,
        now: DateTime<Utc>,
        caller: &dyn Identity,
    ) -> AllocResult<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        tracing::debug!(%now, "maintenance sweep");

        for alloc_id in self.store().ids()? {
            let allocation = match self.store().get(&alloc_id) {
                Ok(allocation) => allocation,
                Err(AllocatorError::Invalid(reason)) => {
                    tracing::info!(%alloc_id, %reason, "removing unusable allocation record");
                    if let Err(err) = self.store().wipe(&alloc_id) {
                        tracing::error!(%alloc_id, %err, "cannot remove allocation record");
                    }
                    continue;
                }
                Err(err) => {
                    tracing::error!(%alloc_id, %err, "cannot load allocation");
                    continue;
                }
            };
            match self.expire(&allocation, now) {
                Ok(Some(state)) => report.expired.push((alloc_id, state)),
                Ok(None) => {}
                Err(AllocatorError::Invalid(_)) => {}
                Err(err) => tracing::error!(%alloc_id, %err, "cannot expire allocation"),
            }
        }

        for target in self.registry().iter() {
            match target.owner_id() {
                Ok(Some(owner)) => {
                    tracing::trace!(target_name = %target.id(), %owner, "target in use");
                }
                Ok(None) => match self.maintain_free_target(target, now, caller) {
                    Ok(Some(PowerAction::Off)) => report.powered_off.push(target.id().to_owned()),
                    Ok(Some(PowerAction::FullyOff)) => {
                        report.fully_powered_off.push(target.id().to_owned());
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::error!(target_name = %target.id(), %err, "idle power-off failed");
                    }
                },
                Err(err) => tracing::error!(target_name = %target.id(), %err, "cannot read owner"),
            }
        }

        let names: Vec<String> = self.registry().names().map(str::to_owned).collect();
        self.scheduler().run(&names, false)?;
        Ok(report)
    }

    /// Remove `allocation` if it ran past its end time, its TTL or the idle
    /// limit.
    fn expire(&self, allocation: &Allocation, now: DateTime<Utc>) -> AllocResult<Option<AllocationState>> {
        if allocation.state()?.is_none() {
            // still being created, unless it has sat like this for too long
            let age = now.signed_duration_since(allocation.modified()?).num_seconds();
            if !exceeds(age, self.config().max_idle_secs) {
                tracing::debug!(alloc_id = %allocation.id(), age, "skipping record being created");
                return Ok(None);
            }
        }
        let endtime = allocation.endtime()?;
        match endtime.as_deref() {
            Some(ENDTIME_STATIC) => return Ok(None),
            Some(stamp) => match parse_stamp(stamp) {
                Some(end) if now >= end => {
                    tracing::info!(alloc_id = %allocation.id(), endtime = %stamp, "end time reached");
                    self.remove(allocation, AllocationState::Overtime)?;
                    return Ok(Some(AllocationState::Overtime));
                }
                Some(_) => {}
                None => {
                    tracing::warn!(alloc_id = %allocation.id(), endtime = %stamp, "ignoring unreadable end time");
                }
            },
            None => {}
        }

        let has_endtime = endtime.as_deref().and_then(parse_stamp).is_some();
        if !has_endtime {
            let idle = seconds_since(now, &allocation.timestamp()?).unwrap_or(i64::MAX);
            if exceeds(idle, self.config().max_idle_secs) {
                tracing::info!(alloc_id = %allocation.id(), idle, "allocation idle for too long");
                self.remove(allocation, AllocationState::Timedout)?;
                return Ok(Some(AllocationState::Timedout));
            }
        }

        if let (Some(ttl), Some(start)) = (allocation.ttl_secs()?, allocation.timestamp_start()?) {
            let lived = seconds_since(now, &start).unwrap_or(0);
            if exceeds(lived, ttl) {
                tracing::info!(alloc_id = %allocation.id(), lived, ttl, "allocation exceeded its time to live");
                self.remove(allocation, AllocationState::Overtime)?;
                return Ok(Some(AllocationState::Overtime));
            }
        }
        Ok(None)
    }

    fn maintain_free_target(
        &self,
        target: &Target,
        now: DateTime<Utc>,
        caller: &dyn Identity,
    ) -> AllocResult<Option<PowerAction>> {
        let Some(power) = target.power() else {
            return Ok(None);
        };
        let props = target.properties();
        if props.skip_cleanup {
            tracing::debug!(target_name = %target.id(), "skipping idle power-off");
            return Ok(None);
        }
        let soft = props
            .idle_power_off_secs
            .unwrap_or(self.config().idle_power_off_secs);
        let hard = props
            .idle_power_fully_off_secs
            .unwrap_or(self.config().idle_power_fully_off_secs);
        if soft == 0 && hard == 0 {
            return Ok(None);
        }

        let stamp = target.timestamp()?;
        let idle = seconds_since(now, &stamp).unwrap_or(i64::MAX);
        let wanted = if hard > 0 && exceeds(idle, hard) {
            PowerAction::FullyOff
        } else if soft > 0 && exceeds(idle, soft) {
            PowerAction::Off
        } else {
            return Ok(None);
        };

        let probe = AllocationRequest::new()
            .group("target", [target.id()])
            .reason("checking if need to power off due to idleness");
        let reply = self.request(&probe, caller)?;
        let Some(alloc_id) = reply
            .alloc_id
            .filter(|_| reply.state == AllocationState::Active)
        else {
            tracing::debug!(target_name = %target.id(), state = %reply.state, "target taken, not powering off");
            return Ok(None);
        };

        let outcome = (|| -> AllocResult<Option<PowerAction>> {
            let state = power.state(target)?;
            let done = match (wanted, state) {
                (PowerAction::FullyOff, PowerState::FullyOff)
                | (PowerAction::Off, PowerState::Off | PowerState::FullyOff) => return Ok(None),
                (PowerAction::FullyOff, _) => {
                    power.power_off(target, true)?;
                    PowerAction::FullyOff
                }
                (PowerAction::Off, _) => {
                    power.power_off(target, false)?;
                    PowerAction::Off
                }
            };
            tracing::info!(target_name = %target.id(), idle, action = ?done, "powered off idle target");
            Ok(Some(done))
        })();

        match self.store().get(&alloc_id) {
            Ok(allocation) => self.remove(&allocation, AllocationState::Removed)?,
            Err(AllocatorError::Invalid(_)) => {}
            Err(err) => return Err(err),
        }
        target.restore_timestamp(&stamp)?;
        if let Ok(Some(action)) = &outcome {
            self.audit(
                &alloc_id,
                caller.id(),
                "power_off",
                Some(format!("{}: {action:?}", target.id())),
            );
        }
        outcome
    }
}
