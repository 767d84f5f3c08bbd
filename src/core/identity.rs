//! Caller identities and the allocation policy seam.
//!
//! Authentication lives outside this crate; whatever authenticates a
//! caller hands us something implementing [`Identity`].

use std::collections::BTreeSet;

/// An authenticated caller.
pub trait Identity: Send + Sync {
    /// Stable user identifier.
    fn id(&self) -> &str;

    /// True if the caller holds `role`.
    fn has_role(&self, role: &str) -> bool;

    /// True if the caller may act on anybody's allocations.
    fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }
}

/// Role that grants administrative rights.
pub const ADMIN_ROLE: &str = "admin";

/// Plain in-process identity, for embedders and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    id: String,
    roles: BTreeSet<String>,
}

impl LocalUser {
    /// User without any role.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: BTreeSet::new(),
        }
    }

    /// User holding the admin role.
    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id).with_role(ADMIN_ROLE)
    }

    /// Add a role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }
}

impl Identity for LocalUser {
    fn id(&self) -> &str {
        &self.id
    }

    fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// What a policy gets to look at when vetting a request.
#[derive(Debug, Clone)]
pub struct PolicyRequest<'a> {
    /// User the allocation is made for.
    pub on_behalf_of: &'a str,
    /// Guests to be added.
    pub guests: &'a [String],
    /// Scaled priority.
    pub priority: u32,
    /// Preemption requested.
    pub preempt: bool,
    /// Caller is willing to queue.
    pub queue: bool,
    /// Reserved sharing flag.
    pub shared: bool,
}

/// Permission engine consulted on every request.
pub trait AllocationPolicy: Send + Sync {
    /// `Some(reason)` to reject the request.
    fn check(&self, caller: &dyn Identity, request: &PolicyRequest<'_>) -> Option<String>;
}

/// Default policy: only admins may ask for preemption.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdminPreemptPolicy;

impl AllocationPolicy for AdminPreemptPolicy {
    fn check(&self, caller: &dyn Identity, request: &PolicyRequest<'_>) -> Option<String> {
        if request.preempt && !caller.is_admin() {
            return Some(format!(
                "user {} cannot request preemption, need '{ADMIN_ROLE}' role",
                caller.id()
            ));
        }
        None
    }
}
