//! Worker versions: one immutable script snapshot with a mutable status.

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

use crate::registration::RegistrationId;
use crate::ClientId;

/// Unique identifier for a worker version. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionId(u64);

impl VersionId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Lifecycle status of a version.
///
/// Transitions only move forward; `Redundant` is reachable from any
/// non-terminal status and is terminal. `Installed` is skipped when a
/// version is promoted straight from `Installing` to `Activating`
/// (no previous active version).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionStatus {
    /// Created, nothing dispatched yet.
    New,
    /// Install sequence running (fetch, start, install event).
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activate event dispatched.
    Activating,
    /// Active and eligible to control clients.
    Activated,
    /// Evicted, superseded, or failed. Terminal.
    Redundant,
}

impl VersionStatus {
    fn rank(self) -> u8 {
        match self {
            VersionStatus::New => 0,
            VersionStatus::Installing => 1,
            VersionStatus::Installed => 2,
            VersionStatus::Activating => 3,
            VersionStatus::Activated => 4,
            VersionStatus::Redundant => 5,
        }
    }

    /// Check if this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, VersionStatus::Redundant)
    }

    /// Whether a transition to `next` is a legal forward move.
    pub fn can_advance_to(self, next: VersionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VersionStatus::New => "new",
            VersionStatus::Installing => "installing",
            VersionStatus::Installed => "installed",
            VersionStatus::Activating => "activating",
            VersionStatus::Activated => "activated",
            VersionStatus::Redundant => "redundant",
        };
        write!(f, "{name}")
    }
}

/// One worker script at a point in time.
///
/// Identity is immutable; only the status, the fetch-handler flag, and the
/// controllee set change over the version's life.
#[derive(Debug, Clone)]
pub struct Version {
    /// Unique id.
    pub id: VersionId,

    /// Owning registration.
    pub registration: RegistrationId,

    /// Script URL this version was created for.
    pub script_url: Url,

    /// Current status.
    status: VersionStatus,

    /// Whether the script registered a fetch handler (discovered during
    /// install, reported by the execution host).
    pub has_fetch_handler: bool,

    /// Clients currently depending on this version.
    controllees: HashSet<ClientId>,
}

impl Version {
    /// Create a new version in `New` status.
    pub fn new(registration: RegistrationId, script_url: Url) -> Self {
        Self {
            id: VersionId::next(),
            registration,
            script_url,
            status: VersionStatus::New,
            has_fetch_handler: false,
            controllees: HashSet::new(),
        }
    }

    /// Get the current status.
    pub fn status(&self) -> VersionStatus {
        self.status
    }

    /// Advance to `next` if the move is forward. Returns whether the status
    /// changed; re-entering `Redundant` is a no-op.
    pub(crate) fn advance(&mut self, next: VersionStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Check if this version is redundant.
    pub fn is_redundant(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if this version reached `Activated`.
    pub fn is_active(&self) -> bool {
        self.status == VersionStatus::Activated
    }

    /// Add a controllee. Returns false if it was already present.
    pub(crate) fn add_controllee(&mut self, client: ClientId) -> bool {
        self.controllees.insert(client)
    }

    /// Remove a controllee. Returns false if it was not present.
    pub(crate) fn remove_controllee(&mut self, client: &ClientId) -> bool {
        self.controllees.remove(client)
    }

    /// Number of controllees.
    pub fn controllee_count(&self) -> usize {
        self.controllees.len()
    }

    /// Check if any client depends on this version.
    pub fn has_controllees(&self) -> bool {
        !self.controllees.is_empty()
    }
}
