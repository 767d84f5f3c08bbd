//! Replay guard for client supplied allocation UUIDs.
//!
//! Clients coordinating one setup across several servers tag each request
//! with the same RFC 4122 v4 UUID (`extra_data.uuid`); drivers derive shared
//! identifiers (tunnel ids and the like) from it. A UUID must not come back
//! while infrastructure keyed on its previous use may still be around, so
//! every accepted UUID is remembered with the time it was seen. The record
//! is bounded both in age and in number of entries.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::AllocResult;
use crate::infra::fsdb::Fsdb;
use crate::infra::lock::FileLock;
use crate::util::clock::{format_stamp, parse_stamp};

/// File-backed `uuid -> last seen` record shared by all processes.
#[derive(Debug, Clone)]
pub struct ReplayGuard {
    db: Fsdb,
    lock: FileLock,
    max_age: Duration,
    max_entries: usize,
}

impl ReplayGuard {
    /// Open (creating if needed) the guard database in `dir`.
    pub fn open(
        dir: impl AsRef<Path>,
        lock_timeout: Duration,
        lock_wait: Duration,
        max_age: Duration,
        max_entries: usize,
    ) -> AllocResult<Self> {
        let db = Fsdb::open(dir)?;
        let lock = FileLock::in_dir(db.location(), lock_timeout, lock_wait);
        Ok(Self {
            db,
            lock,
            max_age,
            max_entries,
        })
    }

    /// Normalize `candidate` to its hyphenated lowercase form if it is a
    /// valid v4 UUID.
    #[must_use]
    pub fn normalize(candidate: &str) -> Option<String> {
        let parsed = uuid::Uuid::parse_str(candidate).ok()?;
        (parsed.get_version_num() == 4).then(|| parsed.hyphenated().to_string())
    }

    /// Check `candidate` and, if it may be used, record it at `now`; both
    /// under the guard lock, so of several concurrent claims across
    /// processes exactly one wins.
    ///
    /// Returns the reason on refusal.
    pub fn claim(&self, candidate: &str, now: DateTime<Utc>) -> AllocResult<Option<String>> {
        let Some(key) = Self::normalize(candidate) else {
            return Ok(Some(format!("{candidate}: invalid RFC 4122 v4 UUID supplied")));
        };
        let _guard = self.lock.acquire()?;
        if let Some(reason) = self.refusal(candidate, &key, now)? {
            return Ok(Some(reason));
        }
        self.db.put(&key, format_stamp(now))?;
        self.trim_locked()?;
        Ok(None)
    }

    /// Drop a claim whose request never got persisted.
    pub fn forget(&self, candidate: &str) -> AllocResult<()> {
        let Some(key) = Self::normalize(candidate) else {
            return Ok(());
        };
        let _guard = self.lock.acquire()?;
        self.db.remove(&key)
    }

    fn refusal(&self, candidate: &str, key: &str, now: DateTime<Utc>) -> AllocResult<Option<String>> {
        let Some(seen) = self.db.get_str(key)? else {
            return Ok(None);
        };
        let Some(seen_at) = parse_stamp(&seen) else {
            tracing::warn!(uuid = %key, stamp = %seen, "dropping unreadable replay record");
            self.db.remove(key)?;
            return Ok(None);
        };
        let age = now.signed_duration_since(seen_at);
        if age < chrono::Duration::zero() {
            return Ok(Some(format!(
                "{candidate}: UUID has been used already (timestamp {seen} is in the future)"
            )));
        }
        let age = age.to_std().unwrap_or_default();
        if age < self.max_age {
            return Ok(Some(format!(
                "{candidate}: UUID has been used already at {seen}, {}s ago",
                age.as_secs()
            )));
        }
        Ok(None)
    }

    fn trim_locked(&self) -> AllocResult<()> {
        let mut seen = self.db.entries("*")?;
        if seen.len() <= self.max_entries {
            return Ok(());
        }
        seen.sort_by(|a, b| a.1.as_str().cmp(&b.1.as_str()));
        let excess = seen.len() - self.max_entries;
        for (key, _) in seen.into_iter().take(excess) {
            self.db.remove(&key)?;
        }
        Ok(())
    }

    /// Number of remembered UUIDs.
    pub fn len(&self) -> AllocResult<usize> {
        Ok(self.db.keys("*")?.len())
    }
}
