//! Registration jobs: one queued unit of Register/Update/Unregister work.
//!
//! A job owns the coalesced listener list for its request(s) and runs as an
//! explicit phase sequence (resolve existing → install → activate →
//! complete), checking its abort flag at every phase boundary so a global
//! abort always yields exactly one `Aborted` completion per listener.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info};
use url::Url;

use crate::lifecycle::{hash_script, LifecycleDriver};
use crate::registration::{Registration, RegistrationId};
use crate::storage::{StorageFacade, StoredRegistration};
use crate::store::{PendingAction, SwStore};
use crate::version::VersionId;
use crate::{SwError, SwEvent, SwResult};

/// What a job does to its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Register,
    Update,
    Unregister,
}

/// Terminal result delivered to every listener of a job. `None` carries no
/// registration (unregister).
pub(crate) type JobOutcome = SwResult<Option<Registration>>;

/// One queued unit of work against a scope.
pub struct RegistrationJob {
    pub(crate) kind: JobKind,
    pub(crate) scope: Url,
    pub(crate) script_url: Option<Url>,
    listeners: Vec<oneshot::Sender<JobOutcome>>,
    abort: Arc<AtomicBool>,
}

impl RegistrationJob {
    pub(crate) fn new(
        kind: JobKind,
        scope: Url,
        script_url: Option<Url>,
        listener: oneshot::Sender<JobOutcome>,
    ) -> Self {
        Self {
            kind,
            scope,
            script_url,
            listeners: vec![listener],
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a new request can piggyback on this still-queued job. Only
    /// Register requests with identical scope and script coalesce.
    pub(crate) fn coalesces_with(&self, kind: JobKind, scope: &Url, script_url: &Url) -> bool {
        self.kind == JobKind::Register
            && kind == JobKind::Register
            && self.scope == *scope
            && self.script_url.as_ref() == Some(script_url)
    }

    pub(crate) fn add_listener(&mut self, listener: oneshot::Sender<JobOutcome>) {
        self.listeners.push(listener);
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Deliver the outcome to every coalesced listener, consuming the job.
    pub(crate) fn complete(self, outcome: JobOutcome) {
        for listener in self.listeners {
            let _ = listener.send(outcome.clone());
        }
    }
}

/// Shared collaborators every job body needs.
pub(crate) struct JobContext {
    pub(crate) store: Arc<SwStore>,
    pub(crate) storage: Arc<dyn StorageFacade>,
    pub(crate) driver: LifecycleDriver,
}

fn ensure_live(abort: &AtomicBool) -> SwResult<()> {
    if abort.load(Ordering::SeqCst) {
        Err(SwError::Aborted)
    } else {
        Ok(())
    }
}

impl JobContext {
    /// Run one job to its terminal outcome.
    pub(crate) async fn execute(&self, job: &RegistrationJob) -> JobOutcome {
        debug!(kind = ?job.kind, scope = %job.scope, "job starting");
        let outcome = match job.kind {
            JobKind::Register => self.run_register(job).await,
            JobKind::Update => self.run_update(job).await,
            JobKind::Unregister => self.run_unregister(job).await,
        };
        match &outcome {
            Ok(_) => info!(kind = ?job.kind, scope = %job.scope, "job completed"),
            Err(err) => info!(kind = ?job.kind, scope = %job.scope, error = %err, "job failed"),
        }
        outcome
    }

    async fn run_register(&self, job: &RegistrationJob) -> JobOutcome {
        let script_url = job
            .script_url
            .clone()
            .ok_or_else(|| SwError::InvalidScript("register without script URL".into()))?;
        let scope_key = job.scope.as_str();

        // ResolveExisting.
        ensure_live(&job.abort)?;
        let record = self.storage.find_by_scope(scope_key).await?;
        let live = self
            .store
            .registration_by_scope(scope_key)
            .await
            .filter(|r| !r.is_uninstalling);

        if let Some(existing) = &live {
            // Duplicate-registration short-circuit: concurrent registers for
            // the same script converge here. The newest version decides, so a
            // register matching a deferred waiting version does not evict and
            // reinstall it, while an older active script no longer wins.
            if let Some(newest) = existing.newest_version() {
                if let Some(version) = self.store.version(newest).await {
                    if !version.is_redundant() && version.script_url == script_url {
                        debug!(scope = %job.scope, "register matched existing version");
                        return Ok(Some(existing.clone()));
                    }
                }
            }
        }

        // A stored record with no live registration (cold start or a prior
        // process) still makes this an update of an existing registration.
        let preexisting = live.is_some() || record.is_some();
        let registration = match live {
            Some(r) => r.id,
            None => self.store.insert_registration(job.scope.clone()).await,
        };

        // The later job wins the scope: evict any pending version a previous
        // job left behind before this install begins.
        for evicted in self.store.evict_pending(registration).await {
            self.driver.evict_version(evicted).await;
        }

        // Install.
        ensure_live(&job.abort)?;
        let version = self.store.create_version(registration, script_url).await;
        if preexisting {
            self.store.emit(SwEvent::UpdateFound { registration });
        }
        let outcome = self.driver.install(registration, version, None).await?;

        // Activate (possibly deferred). An abort landing here must not leave
        // the installed version parked in the installing slot.
        if let Err(err) = ensure_live(&job.abort) {
            self.driver.evict_version(version).await;
            return Err(err);
        }
        self.promote_or_defer(registration, version).await?;

        // Complete.
        self.persist(registration, version, outcome.script_hash).await?;
        self.snapshot(registration).await.map(Some)
    }

    async fn run_update(&self, job: &RegistrationJob) -> JobOutcome {
        let scope_key = job.scope.as_str();

        ensure_live(&job.abort)?;
        let record = self
            .storage
            .find_by_scope(scope_key)
            .await?
            .ok_or_else(|| SwError::NotFound(scope_key.to_string()))?;
        let live = self
            .store
            .registration_by_scope(scope_key)
            .await
            .filter(|r| !r.is_uninstalling)
            .ok_or_else(|| SwError::NotFound(scope_key.to_string()))?;
        let registration = live.id;

        let script_url = match &job.script_url {
            Some(url) => url.clone(),
            None => Url::parse(&record.script_url)
                .map_err(|err| SwError::InvalidScript(err.to_string()))?,
        };

        ensure_live(&job.abort)?;
        let script = self.driver.fetch_script(registration, &script_url).await?;
        if record.script_url == script_url.as_str()
            && record.script_hash == hash_script(&script.bytes)
        {
            debug!(scope = %job.scope, "script unchanged, skipping install");
            return Ok(Some(live));
        }

        for evicted in self.store.evict_pending(registration).await {
            self.driver.evict_version(evicted).await;
        }

        ensure_live(&job.abort)?;
        let version = self.store.create_version(registration, script_url).await;
        self.store.emit(SwEvent::UpdateFound { registration });
        let outcome = self
            .driver
            .install(registration, version, Some(script))
            .await?;

        if let Err(err) = ensure_live(&job.abort) {
            self.driver.evict_version(version).await;
            return Err(err);
        }
        self.promote_or_defer(registration, version).await?;

        self.persist(registration, version, outcome.script_hash).await?;
        self.snapshot(registration).await.map(Some)
    }

    async fn run_unregister(&self, job: &RegistrationJob) -> JobOutcome {
        let scope_key = job.scope.as_str();

        ensure_live(&job.abort)?;
        let record = self.storage.find_by_scope(scope_key).await?;
        let live = self
            .store
            .registration_by_scope(scope_key)
            .await
            .filter(|r| !r.is_uninstalling);
        if record.is_none() && live.is_none() {
            return Err(SwError::NotFound(scope_key.to_string()));
        }

        if let Some(record) = &record {
            self.storage.delete(record.registration_id).await?;
        }
        let Some(live) = live else {
            return Ok(None);
        };

        // The registration disappears from lookups now; the in-memory object
        // stays until the active version loses its last controllee.
        self.store.mark_uninstalling(live.id).await;

        let gating = match live.active() {
            Some(active) => self
                .store
                .version(active)
                .await
                .filter(|v| v.has_controllees())
                .map(|_| active),
            None => None,
        };

        match gating {
            Some(active) => {
                let action = PendingAction::PurgeRegistration {
                    registration: live.id,
                };
                if let Some(action) = self
                    .store
                    .register_zero_controllee_action(active, action)
                    .await
                {
                    self.run_pending_action(action).await;
                }
            }
            None => self.purge_registration(live.id).await,
        }

        Ok(None)
    }

    /// Decide where an installed version goes: straight to active when there
    /// is no incumbent, to waiting while the incumbent still has controllees
    /// (activation deferred to the zero-controllee continuation), or through
    /// `Installed` and immediately active otherwise.
    async fn promote_or_defer(
        &self,
        registration: RegistrationId,
        version: VersionId,
    ) -> SwResult<()> {
        let snapshot = self.snapshot(registration).await?;
        let Some(incumbent) = snapshot.active() else {
            // No previous active version: Installed is skipped.
            return self.driver.activate(registration, version).await;
        };

        self.store.promote_installing_to_waiting(registration).await;

        let gated = self
            .store
            .version(incumbent)
            .await
            .map(|v| v.has_controllees())
            .unwrap_or(false);
        if !gated {
            return self.driver.activate(registration, version).await;
        }

        debug!(
            registration = registration.raw(),
            "activation deferred until incumbent releases controllees"
        );
        let action = PendingAction::PromoteWaiting { registration };
        if let Some(action) = self
            .store
            .register_zero_controllee_action(incumbent, action)
            .await
        {
            // Count raced to zero: the continuation fires synchronously.
            self.run_pending_action(action).await;
        }
        Ok(())
    }

    /// Run a continuation released by a zero-controllee transition.
    pub(crate) async fn run_pending_action(&self, action: PendingAction) {
        match action {
            PendingAction::PromoteWaiting { registration } => {
                let Some(snapshot) = self.store.registration(registration).await else {
                    return;
                };
                if let Some(waiting) = snapshot.waiting() {
                    if let Err(err) = self.driver.activate(registration, waiting).await {
                        tracing::warn!(
                            registration = registration.raw(),
                            error = %err,
                            "deferred activation failed"
                        );
                    }
                }
            }
            PendingAction::PurgeRegistration { registration } => {
                self.purge_registration(registration).await;
            }
        }
    }

    /// Stop and retire every version of a registration, then drop it.
    pub(crate) async fn purge_registration(&self, registration: RegistrationId) {
        let Some(snapshot) = self.store.registration(registration).await else {
            return;
        };
        for version in [snapshot.installing(), snapshot.waiting(), snapshot.active()]
            .into_iter()
            .flatten()
        {
            self.driver.evict_version(version).await;
        }
        self.store.remove_registration(registration).await;
    }

    async fn persist(
        &self,
        registration: RegistrationId,
        version: VersionId,
        script_hash: [u8; 32],
    ) -> SwResult<()> {
        let snapshot = self.snapshot(registration).await?;
        let script_url = match self.store.version(version).await {
            Some(v) => v.script_url.to_string(),
            None => {
                return Err(SwError::ReferencedResourceBroken(format!(
                    "version {} gone before persist",
                    version.raw()
                )))
            }
        };
        self.storage
            .store(StoredRegistration {
                registration_id: registration,
                scope: snapshot.scope.to_string(),
                script_url,
                version_id: version,
                script_hash,
            })
            .await?;
        self.store.emit(SwEvent::RegistrationStored {
            registration,
            scope: snapshot.scope.to_string(),
        });
        Ok(())
    }

    async fn snapshot(&self, registration: RegistrationId) -> SwResult<Registration> {
        self.store.registration(registration).await.ok_or_else(|| {
            SwError::ReferencedResourceBroken(format!(
                "registration {} evicted mid-job",
                registration.raw()
            ))
        })
    }
}
