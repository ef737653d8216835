//! Worker lifecycle driver.
//!
//! Sequences the external script-fetch and execution-host capabilities to
//! move a version through install and activate, translating their outcomes
//! into status transitions on the arena. Install failures evict the new
//! version and surface a typed error; activate-event rejection is tolerated
//! by contract and never fails the surrounding job.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::registration::RegistrationId;
use crate::store::SwStore;
use crate::version::VersionId;
use crate::{SwError, SwResult};

// ==================== Capabilities ====================

/// Script-fetch errors.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("Network: {0}")]
    Network(String),

    #[error("Script not found: {0}")]
    NotFound(String),
}

/// A fetched worker script.
#[derive(Debug, Clone)]
pub struct FetchedScript {
    /// Script bytes.
    pub bytes: Vec<u8>,

    /// Whether the network was actually touched. False means the bytes came
    /// straight from a cache, which must not count as an update check.
    pub network_accessed: bool,
}

/// Downloads worker scripts. External capability.
#[async_trait]
pub trait ScriptFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchedScript, FetchError>;
}

/// Execution host errors.
#[derive(Error, Debug, Clone)]
pub enum HostError {
    #[error("Worker start refused: {0}")]
    StartRefused(String),

    #[error("Host unavailable: {0}")]
    Unavailable(String),
}

/// Lifecycle events dispatched into a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Install,
    Activate,
}

/// Disposition of a dispatched lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The worker handled the event. `fetch_handler_registered` is only
    /// meaningful for [`EventKind::Install`].
    Accepted { fetch_handler_registered: bool },
    /// The worker's handler rejected.
    Rejected,
}

/// Starts, stops, and dispatches events into worker instances. External
/// capability.
#[async_trait]
pub trait ExecutionHost: Send + Sync {
    async fn start(
        &self,
        version: VersionId,
        script_url: &Url,
        script: &[u8],
    ) -> Result<(), HostError>;

    async fn dispatch_event(
        &self,
        version: VersionId,
        kind: EventKind,
    ) -> Result<EventOutcome, HostError>;

    async fn stop(&self, version: VersionId);
}

/// SHA-256 digest of script bytes, stored alongside the registration record
/// to detect unchanged scripts on update. The digest is persisted, so it must
/// stay stable across builds.
pub fn hash_script(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Result of a successful install sequence.
#[derive(Debug, Clone, Copy)]
pub struct InstallOutcome {
    pub script_hash: [u8; 32],
    pub network_accessed: bool,
}

// ==================== Driver ====================

/// Drives one version through install and activate.
#[derive(Clone)]
pub struct LifecycleDriver {
    store: Arc<SwStore>,
    fetcher: Arc<dyn ScriptFetcher>,
    host: Arc<dyn ExecutionHost>,
}

impl LifecycleDriver {
    pub fn new(
        store: Arc<SwStore>,
        fetcher: Arc<dyn ScriptFetcher>,
        host: Arc<dyn ExecutionHost>,
    ) -> Self {
        Self {
            store,
            fetcher,
            host,
        }
    }

    /// Fetch a script, recording an update check on the registration when
    /// the fetch actually touched the network.
    pub async fn fetch_script(
        &self,
        registration: RegistrationId,
        url: &Url,
    ) -> SwResult<FetchedScript> {
        match self.fetcher.fetch(url).await {
            Ok(script) => {
                if script.network_accessed {
                    self.store.record_update_check(registration).await;
                }
                Ok(script)
            }
            Err(err) => Err(SwError::InstallFailed(err.to_string())),
        }
    }

    /// Run the install sequence for `version`: occupy the installing slot,
    /// fetch (unless `prefetched`), start the worker, dispatch the install
    /// event. Any failure retires the version, clears the slot, and returns
    /// the typed error; the previous active version is untouched. On success
    /// the version stays in `Installing` and promotion is the caller's call.
    pub async fn install(
        &self,
        registration: RegistrationId,
        version: VersionId,
        prefetched: Option<FetchedScript>,
    ) -> SwResult<InstallOutcome> {
        let snapshot = self.store.version(version).await.ok_or_else(|| {
            SwError::ReferencedResourceBroken(format!(
                "version {} gone before install",
                version.raw()
            ))
        })?;
        let script_url = snapshot.script_url;

        if !self.store.begin_install(registration, version).await {
            return Err(SwError::ReferencedResourceBroken(format!(
                "registration {} gone before install",
                registration.raw()
            )));
        }
        debug!(version = version.raw(), url = %script_url, "install starting");

        let script = match prefetched {
            Some(script) => script,
            None => match self.fetch_script(registration, &script_url).await {
                Ok(script) => script,
                Err(err) => {
                    self.store.fail_install(registration, version).await;
                    return Err(err);
                }
            },
        };

        if let Err(err) = self.host.start(version, &script_url, &script.bytes).await {
            self.store.fail_install(registration, version).await;
            return Err(SwError::StartWorkerFailed(err.to_string()));
        }

        match self.host.dispatch_event(version, EventKind::Install).await {
            Ok(EventOutcome::Accepted {
                fetch_handler_registered,
            }) => {
                self.store
                    .set_fetch_handler(version, fetch_handler_registered)
                    .await;
            }
            Ok(EventOutcome::Rejected) => {
                self.host.stop(version).await;
                self.store.fail_install(registration, version).await;
                return Err(SwError::InstallFailed("install event rejected".into()));
            }
            Err(err) => {
                self.host.stop(version).await;
                self.store.fail_install(registration, version).await;
                return Err(SwError::InstallFailed(err.to_string()));
            }
        }

        info!(version = version.raw(), url = %script_url, "installed");
        Ok(InstallOutcome {
            script_hash: hash_script(&script.bytes),
            network_accessed: script.network_accessed,
        })
    }

    /// Activate `version`: retire the incumbent, promote to the active slot,
    /// dispatch the activate event. Rejection of the activate event is
    /// tolerated: the version stays in `Activating` and the call still
    /// succeeds.
    pub async fn activate(&self, registration: RegistrationId, version: VersionId) -> SwResult<()> {
        if let Some(incumbent) = self.store.take_incumbent(registration).await {
            if incumbent != version {
                debug!(
                    version = incumbent.raw(),
                    "retiring incumbent active version"
                );
                self.host.stop(incumbent).await;
                self.store.retire_version(incumbent).await;
            }
        }

        let promoted = self.store.promote_to_active(registration).await;
        if promoted != Some(version) {
            return Err(SwError::ReferencedResourceBroken(format!(
                "version {} not promotable to active",
                version.raw()
            )));
        }

        match self.host.dispatch_event(version, EventKind::Activate).await {
            Ok(EventOutcome::Accepted { .. }) => {
                self.store.finish_activation(version).await;
                info!(version = version.raw(), "activated");
            }
            Ok(EventOutcome::Rejected) => {
                // Tolerated by contract: only the version status records it.
                warn!(version = version.raw(), "activate event rejected");
            }
            Err(err) => {
                warn!(version = version.raw(), error = %err, "activate dispatch failed");
            }
        }
        Ok(())
    }

    /// Stop and retire a version ahead of its natural lifecycle.
    pub async fn evict_version(&self, version: VersionId) {
        self.host.stop(version).await;
        self.store.retire_version(version).await;
    }
}
