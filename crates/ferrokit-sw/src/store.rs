//! Live registration/version arena.
//!
//! Owns every in-memory [`Registration`] and [`Version`] in two id-keyed
//! tables; slots, jobs, and continuations refer to entries by id only.
//! Every status transition goes through this module, which also publishes
//! [`SwEvent`]s in transition order.

use hashbrown::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use url::Url;

use crate::registration::{Registration, RegistrationId};
use crate::version::{Version, VersionId, VersionStatus};
use crate::{ClientId, SwEvent};

/// An action deferred until a version's controllee count reaches zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    /// Activate the waiting version of the registration.
    PromoteWaiting { registration: RegistrationId },
    /// Tear down an uninstalling registration.
    PurgeRegistration { registration: RegistrationId },
}

#[derive(Default)]
struct StoreInner {
    registrations: HashMap<RegistrationId, Registration>,
    versions: HashMap<VersionId, Version>,
    /// Live scope → registration index. Unregister removes the entry while
    /// the registration object may stay alive for deferred teardown.
    scope_index: HashMap<String, RegistrationId>,
    /// Zero-controllee continuations, keyed by the gating version.
    pending: HashMap<VersionId, Vec<PendingAction>>,
}

/// The arena. Mutated only by the single running job per scope, except for
/// controllee add/remove which may interleave from client connect/disconnect.
pub struct SwStore {
    inner: RwLock<StoreInner>,
    event_tx: mpsc::UnboundedSender<SwEvent>,
}

impl SwStore {
    /// Create a store publishing events on `event_tx`.
    pub fn new(event_tx: mpsc::UnboundedSender<SwEvent>) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            event_tx,
        }
    }

    pub(crate) fn emit(&self, event: SwEvent) {
        let _ = self.event_tx.send(event);
    }

    // ==================== Registrations ====================

    /// Create a registration for `scope` and index it as the live one.
    pub async fn insert_registration(&self, scope: Url) -> RegistrationId {
        let registration = Registration::new(scope.clone());
        let id = registration.id;
        let mut inner = self.inner.write().await;
        inner.scope_index.insert(scope.to_string(), id);
        inner.registrations.insert(id, registration);
        debug!(registration = id.raw(), scope = %scope, "registration created");
        id
    }

    /// Snapshot a registration by id.
    pub async fn registration(&self, id: RegistrationId) -> Option<Registration> {
        self.inner.read().await.registrations.get(&id).cloned()
    }

    /// Snapshot the live registration for a scope, if any.
    pub async fn registration_by_scope(&self, scope: &str) -> Option<Registration> {
        let inner = self.inner.read().await;
        let id = inner.scope_index.get(scope)?;
        inner.registrations.get(id).cloned()
    }

    /// Number of live (indexed) scopes.
    pub async fn live_scope_count(&self) -> usize {
        self.inner.read().await.scope_index.len()
    }

    /// Mark a registration as uninstalling and drop it from the live scope
    /// index so later register/find calls do not see it.
    pub async fn mark_uninstalling(&self, id: RegistrationId) {
        let mut inner = self.inner.write().await;
        let Some(registration) = inner.registrations.get_mut(&id) else {
            return;
        };
        registration.is_uninstalling = true;
        let scope = registration.scope.to_string();
        if inner.scope_index.get(&scope) == Some(&id) {
            inner.scope_index.remove(&scope);
        }
        debug!(registration = id.raw(), scope, "registration uninstalling");
    }

    /// Remove a registration from the arena, retiring any versions still in
    /// its slots. Emits [`SwEvent::RegistrationDeleted`].
    pub async fn remove_registration(&self, id: RegistrationId) {
        let mut inner = self.inner.write().await;
        let Some(registration) = inner.registrations.remove(&id) else {
            return;
        };
        let scope = registration.scope.to_string();
        if inner.scope_index.get(&scope) == Some(&id) {
            inner.scope_index.remove(&scope);
        }
        for version in [
            registration.installing(),
            registration.waiting(),
            registration.active(),
        ]
        .into_iter()
        .flatten()
        {
            self.transition_locked(&mut inner, version, VersionStatus::Redundant);
            inner.pending.remove(&version);
            self.gc_version_locked(&mut inner, version);
        }
        self.emit(SwEvent::RegistrationDeleted {
            registration: id,
            scope,
        });
    }

    /// Record an over-the-network update check on the registration.
    pub async fn record_update_check(&self, id: RegistrationId) {
        let mut inner = self.inner.write().await;
        if let Some(registration) = inner.registrations.get_mut(&id) {
            registration.record_update_check();
        }
    }

    // ==================== Versions ====================

    /// Create a `New` version owned by `registration`.
    pub async fn create_version(&self, registration: RegistrationId, script_url: Url) -> VersionId {
        let version = Version::new(registration, script_url);
        let id = version.id;
        self.inner.write().await.versions.insert(id, version);
        id
    }

    /// Snapshot a version by id.
    pub async fn version(&self, id: VersionId) -> Option<Version> {
        self.inner.read().await.versions.get(&id).cloned()
    }

    /// Put `version` into the installing slot and move it to `Installing`.
    /// Returns false if the registration or version is gone.
    pub async fn begin_install(&self, registration: RegistrationId, version: VersionId) -> bool {
        let mut inner = self.inner.write().await;
        if !inner.versions.contains_key(&version) {
            return false;
        }
        let Some(reg) = inner.registrations.get_mut(&registration) else {
            return false;
        };
        if let Some(displaced) = reg.set_installing(version) {
            self.transition_locked(&mut inner, displaced, VersionStatus::Redundant);
            self.gc_version_locked(&mut inner, displaced);
        }
        self.transition_locked(&mut inner, version, VersionStatus::Installing)
    }

    /// Clear the installing slot and retire the failed version.
    pub async fn fail_install(&self, registration: RegistrationId, version: VersionId) {
        let mut inner = self.inner.write().await;
        if let Some(reg) = inner.registrations.get_mut(&registration) {
            reg.clear_slot(version);
        }
        self.transition_locked(&mut inner, version, VersionStatus::Redundant);
        self.gc_version_locked(&mut inner, version);
    }

    /// Record whether the script registered a fetch handler.
    pub async fn set_fetch_handler(&self, version: VersionId, has_handler: bool) {
        let mut inner = self.inner.write().await;
        if let Some(v) = inner.versions.get_mut(&version) {
            v.has_fetch_handler = has_handler;
        }
    }

    /// Move installing → waiting, transitioning the version to `Installed`.
    pub async fn promote_installing_to_waiting(
        &self,
        registration: RegistrationId,
    ) -> Option<VersionId> {
        let mut inner = self.inner.write().await;
        let version = inner
            .registrations
            .get_mut(&registration)?
            .promote_installing_to_waiting()?;
        self.transition_locked(&mut inner, version, VersionStatus::Installed);
        Some(version)
    }

    /// Take the incumbent out of the active slot for teardown.
    pub async fn take_incumbent(&self, registration: RegistrationId) -> Option<VersionId> {
        let mut inner = self.inner.write().await;
        inner.registrations.get_mut(&registration)?.take_incumbent()
    }

    /// Promote waiting (or installing) → active, transitioning the version
    /// to `Activating`.
    pub async fn promote_to_active(&self, registration: RegistrationId) -> Option<VersionId> {
        let mut inner = self.inner.write().await;
        let version = inner
            .registrations
            .get_mut(&registration)?
            .promote_to_active()?;
        self.transition_locked(&mut inner, version, VersionStatus::Activating);
        Some(version)
    }

    /// Mark the activate event accepted: `Activating` → `Activated`.
    pub async fn finish_activation(&self, version: VersionId) {
        let mut inner = self.inner.write().await;
        self.transition_locked(&mut inner, version, VersionStatus::Activated);
    }

    /// Retire a version: clear its slot, mark `Redundant`, garbage collect.
    pub async fn retire_version(&self, version: VersionId) {
        let mut inner = self.inner.write().await;
        if let Some(owner) = inner.versions.get(&version).map(|v| v.registration) {
            if let Some(reg) = inner.registrations.get_mut(&owner) {
                reg.clear_slot(version);
            }
        }
        self.transition_locked(&mut inner, version, VersionStatus::Redundant);
        self.gc_version_locked(&mut inner, version);
    }

    /// Evict every pending (installing/waiting) version of the registration,
    /// marking each `Redundant`. Returns the evicted ids.
    pub async fn evict_pending(&self, registration: RegistrationId) -> Vec<VersionId> {
        let mut inner = self.inner.write().await;
        let Some(reg) = inner.registrations.get_mut(&registration) else {
            return Vec::new();
        };
        let evicted = reg.evict_pending();
        for &version in &evicted {
            self.transition_locked(&mut inner, version, VersionStatus::Redundant);
            self.gc_version_locked(&mut inner, version);
        }
        evicted
    }

    // ==================== Controllees ====================

    /// Attach a client to a version. Returns false for unknown or redundant
    /// versions.
    pub async fn add_controllee(&self, version: VersionId, client: ClientId) -> bool {
        let mut inner = self.inner.write().await;
        match inner.versions.get_mut(&version) {
            Some(v) if !v.is_redundant() => v.add_controllee(client),
            _ => false,
        }
    }

    /// Detach a client from a version. When the controllee count reaches
    /// zero, drains and returns the continuations registered against it;
    /// the caller runs them.
    pub async fn remove_controllee(
        &self,
        version: VersionId,
        client: &ClientId,
    ) -> Vec<PendingAction> {
        let mut inner = self.inner.write().await;
        let Some(v) = inner.versions.get_mut(&version) else {
            return Vec::new();
        };
        v.remove_controllee(client);
        if v.has_controllees() {
            return Vec::new();
        }
        let actions = inner.pending.remove(&version).unwrap_or_default();
        self.gc_version_locked(&mut inner, version);
        if !actions.is_empty() {
            debug!(
                version = version.raw(),
                count = actions.len(),
                "controllee count reached zero, running deferred actions"
            );
        }
        actions
    }

    /// Register a continuation to run when `version` has no controllees.
    /// If the count is already zero the action is handed back for the caller
    /// to run immediately (the continuation must fire synchronously then).
    pub async fn register_zero_controllee_action(
        &self,
        version: VersionId,
        action: PendingAction,
    ) -> Option<PendingAction> {
        let mut inner = self.inner.write().await;
        match inner.versions.get(&version) {
            Some(v) if v.has_controllees() => {
                inner.pending.entry(version).or_default().push(action);
                None
            }
            _ => Some(action),
        }
    }

    // ==================== Internals ====================

    /// Single transition point: advances the version and emits the event.
    fn transition_locked(
        &self,
        inner: &mut StoreInner,
        version: VersionId,
        status: VersionStatus,
    ) -> bool {
        let Some(v) = inner.versions.get_mut(&version) else {
            return false;
        };
        let registration = v.registration;
        if !v.advance(status) {
            return false;
        }
        debug!(version = version.raw(), %status, "version transition");
        self.emit(SwEvent::VersionState {
            registration,
            version,
            status,
        });
        true
    }

    /// Drop a version once it is redundant and nothing references it: no
    /// slot, no controllee, no pending continuation.
    fn gc_version_locked(&self, inner: &mut StoreInner, version: VersionId) {
        let removable = match inner.versions.get(&version) {
            Some(v) => {
                v.is_redundant()
                    && !v.has_controllees()
                    && !inner.pending.contains_key(&version)
                    && !inner.registrations.values().any(|r| r.references(version))
            }
            None => false,
        };
        if removable {
            inner.versions.remove(&version);
        }
    }
}
