//! Registrations: the scope-to-version binding with three slots.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use url::Url;

use crate::version::VersionId;

/// Unique identifier for a registration, used for storage correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationId(u64);

impl RegistrationId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A live registration: at most one per scope at a time.
///
/// Slots hold version ids; the owning table lives in [`crate::store::SwStore`].
/// A version id occupies at most one slot of one registration.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Unique id.
    pub id: RegistrationId,

    /// Scope URL pattern this registration controls.
    pub scope: Url,

    /// Version currently running its install sequence.
    installing: Option<VersionId>,

    /// Installed version waiting for the incumbent to release.
    waiting: Option<VersionId>,

    /// Version controlling clients.
    active: Option<VersionId>,

    /// Set when an unregister job committed; teardown may still be deferred.
    pub is_uninstalling: bool,

    /// When the script was last fetched over the network.
    last_update_check: Option<Instant>,
}

impl Registration {
    /// Create a new registration for a scope.
    pub fn new(scope: Url) -> Self {
        Self {
            id: RegistrationId::next(),
            scope,
            installing: None,
            waiting: None,
            active: None,
            is_uninstalling: false,
            last_update_check: None,
        }
    }

    /// Get the installing slot.
    pub fn installing(&self) -> Option<VersionId> {
        self.installing
    }

    /// Get the waiting slot.
    pub fn waiting(&self) -> Option<VersionId> {
        self.waiting
    }

    /// Get the active slot.
    pub fn active(&self) -> Option<VersionId> {
        self.active
    }

    /// The most recent version: installing, else waiting, else active.
    pub fn newest_version(&self) -> Option<VersionId> {
        self.installing.or(self.waiting).or(self.active)
    }

    /// Put a version into the installing slot. Returns a displaced version,
    /// which the caller must mark redundant.
    pub(crate) fn set_installing(&mut self, version: VersionId) -> Option<VersionId> {
        self.installing.replace(version)
    }

    /// Move the installing version to the waiting slot.
    pub(crate) fn promote_installing_to_waiting(&mut self) -> Option<VersionId> {
        let version = self.installing.take()?;
        self.waiting = Some(version);
        Some(version)
    }

    /// Take the incumbent out of the active slot.
    pub(crate) fn take_incumbent(&mut self) -> Option<VersionId> {
        self.active.take()
    }

    /// Promote the waiting (or installing) version into the active slot.
    pub(crate) fn promote_to_active(&mut self) -> Option<VersionId> {
        let version = self.waiting.take().or_else(|| self.installing.take())?;
        self.active = Some(version);
        Some(version)
    }

    /// Clear whichever slot holds `version`.
    pub(crate) fn clear_slot(&mut self, version: VersionId) {
        if self.installing == Some(version) {
            self.installing = None;
        }
        if self.waiting == Some(version) {
            self.waiting = None;
        }
        if self.active == Some(version) {
            self.active = None;
        }
    }

    /// Take every pending (installing + waiting) version out of its slot.
    /// Used when a later job with a different script wins the scope.
    pub(crate) fn evict_pending(&mut self) -> Vec<VersionId> {
        self.installing.take().into_iter().chain(self.waiting.take()).collect()
    }

    /// Check whether `version` occupies any slot.
    pub fn references(&self, version: VersionId) -> bool {
        self.installing == Some(version)
            || self.waiting == Some(version)
            || self.active == Some(version)
    }

    /// Record a completed over-the-network update check.
    pub(crate) fn record_update_check(&mut self) {
        self.last_update_check = Some(Instant::now());
    }

    /// When the script was last fetched over the network.
    pub fn last_update_check(&self) -> Option<Instant> {
        self.last_update_check
    }

    /// Whether enough time has passed that an update check is due.
    pub fn needs_update_check(&self, interval: Duration) -> bool {
        match self.last_update_check {
            Some(last) => last.elapsed() >= interval,
            None => true,
        }
    }
}
