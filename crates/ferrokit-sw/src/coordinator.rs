//! Job coordinator: per-scope FIFO job queues.
//!
//! Owns the scope → queue map. At most one job per scope executes at a
//! time; queues for different scopes run concurrently on their own runner
//! tasks. Entries are created on first submission and removed when a queue
//! drains, all under one lock.

use hashbrown::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};
use url::Url;

use crate::job::{JobContext, JobKind, JobOutcome, RegistrationJob};
use crate::lifecycle::{ExecutionHost, LifecycleDriver, ScriptFetcher};
use crate::registration::{Registration, RegistrationId};
use crate::storage::StorageFacade;
use crate::store::SwStore;
use crate::version::{Version, VersionId};
use crate::{ClientId, CoordinatorConfig, SwError, SwEvent, SwResult};

struct ScopeQueue {
    jobs: VecDeque<RegistrationJob>,
    /// Abort flag of the job currently executing, if any.
    running: Option<Arc<AtomicBool>>,
}

/// Serializes registration work per scope and fans completion out to every
/// coalesced caller.
pub struct JobCoordinator {
    ctx: Arc<JobContext>,
    queues: Arc<Mutex<HashMap<String, ScopeQueue>>>,
    config: CoordinatorConfig,
}

impl JobCoordinator {
    /// Create a coordinator over the given collaborators. Returns the
    /// coordinator and the event stream.
    pub fn new(
        storage: Arc<dyn StorageFacade>,
        fetcher: Arc<dyn ScriptFetcher>,
        host: Arc<dyn ExecutionHost>,
        config: CoordinatorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SwEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let store = Arc::new(SwStore::new(event_tx));
        let driver = LifecycleDriver::new(store.clone(), fetcher, host);
        let ctx = Arc::new(JobContext {
            store,
            storage,
            driver,
        });
        (
            Self {
                ctx,
                queues: Arc::new(Mutex::new(HashMap::new())),
                config,
            },
            event_rx,
        )
    }

    // ==================== Public contract ====================

    /// Register `script_url` for `scope`. Coalesces with a pending,
    /// not-yet-started register job for the identical pair.
    pub async fn register(&self, scope: &str, script_url: &str) -> SwResult<Registration> {
        let scope = parse_url(scope)?;
        let script = parse_url(script_url)?;
        let rx = self.submit(JobKind::Register, scope, Some(script)).await;
        expect_registration(rx.await)
    }

    /// Re-fetch the registered script for `scope` and install it if it
    /// changed. Fails with `NotFound` when the scope has no registration.
    pub async fn update(&self, scope: &str) -> SwResult<Registration> {
        let scope = parse_url(scope)?;
        let rx = self.submit(JobKind::Update, scope, None).await;
        expect_registration(rx.await)
    }

    /// Unregister `scope`. Completes as soon as the registration is removed
    /// from lookups; in-memory teardown may be deferred until the active
    /// version loses its last controllee. Never coalesced.
    pub async fn unregister(&self, scope: &str) -> SwResult<()> {
        let scope = parse_url(scope)?;
        let rx = self.submit(JobKind::Unregister, scope, None).await;
        match rx.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(SwError::Aborted),
        }
    }

    /// Abort every queued and in-flight job. Every pending caller receives
    /// exactly one completion; queued jobs get `Aborted` immediately, the
    /// in-flight job observes its flag at the next phase boundary and its
    /// runner retires the scope entry when it exits.
    pub async fn abort_all(&self) {
        let mut queues = self.queues.lock().await;
        info!(scopes = queues.len(), "aborting all registration jobs");
        // A live runner still owns its scope entry: only the runner may
        // remove it, so a submit arriving after the abort queues behind the
        // in-flight job instead of spawning a second runner for the scope.
        queues.retain(|_, queue| {
            if let Some(flag) = &queue.running {
                flag.store(true, Ordering::SeqCst);
            }
            for job in queue.jobs.drain(..) {
                job.abort_flag().store(true, Ordering::SeqCst);
                job.complete(Err(SwError::Aborted));
            }
            queue.running.is_some()
        });
    }

    // ==================== Lookups ====================

    /// Snapshot the live registration for a scope.
    pub async fn registration_for_scope(&self, scope: &str) -> Option<Registration> {
        let scope = parse_url(scope).ok()?;
        self.ctx.store.registration_by_scope(scope.as_str()).await
    }

    /// Snapshot a live registration by id.
    pub async fn registration(&self, id: RegistrationId) -> Option<Registration> {
        self.ctx.store.registration(id).await
    }

    /// Snapshot a version by id.
    pub async fn version(&self, id: VersionId) -> Option<Version> {
        self.ctx.store.version(id).await
    }

    /// Find the live registration controlling a document URL, by longest
    /// scope prefix match over stored records.
    pub async fn find_registration_for_document(
        &self,
        url: &str,
    ) -> SwResult<Option<Registration>> {
        let Some(record) = self.ctx.storage.find_by_document(url).await? else {
            return Ok(None);
        };
        Ok(self.ctx.store.registration(record.registration_id).await)
    }

    /// Whether the scope's registration is outside its update-check window.
    /// Absent scopes have nothing to check.
    pub async fn update_check_due(&self, scope: &str) -> bool {
        match self.registration_for_scope(scope).await {
            Some(registration) => {
                registration.needs_update_check(self.config.update_check_interval)
            }
            None => false,
        }
    }

    /// Number of scopes with queued or running jobs.
    pub async fn queued_scope_count(&self) -> usize {
        self.queues.lock().await.len()
    }

    // ==================== Controllees ====================

    /// Attach a client to a version.
    pub async fn add_controllee(&self, version: VersionId, client: ClientId) -> bool {
        self.ctx.store.add_controllee(version, client).await
    }

    /// Detach a client from a version. When the count reaches zero this
    /// runs any deferred activation or teardown gated on the version.
    pub async fn remove_controllee(&self, version: VersionId, client: &ClientId) {
        let actions = self.ctx.store.remove_controllee(version, client).await;
        for action in actions {
            self.ctx.run_pending_action(action).await;
        }
    }

    // ==================== Scheduling ====================

    async fn submit(
        &self,
        kind: JobKind,
        scope: Url,
        script_url: Option<Url>,
    ) -> oneshot::Receiver<JobOutcome> {
        let (tx, rx) = oneshot::channel();
        let key = scope.to_string();
        let mut queues = self.queues.lock().await;

        if kind == JobKind::Register {
            let cap = self.config.max_coalesced_listeners;
            if let (Some(queue), Some(script)) = (queues.get_mut(&key), script_url.as_ref()) {
                if let Some(job) = queue
                    .jobs
                    .iter_mut()
                    .find(|j| j.coalesces_with(kind, &scope, script))
                    .filter(|j| cap == 0 || j.listener_count() < cap)
                {
                    debug!(scope = %scope, "register coalesced onto pending job");
                    job.add_listener(tx);
                    return rx;
                }
            }
        }

        let job = RegistrationJob::new(kind, scope, script_url, tx);
        match queues.get_mut(&key) {
            Some(queue) => {
                debug!(scope = %key, depth = queue.jobs.len() + 1, "job queued");
                queue.jobs.push_back(job);
            }
            None => {
                let mut queue = ScopeQueue {
                    jobs: VecDeque::new(),
                    running: None,
                };
                queue.jobs.push_back(job);
                queues.insert(key.clone(), queue);
                self.spawn_runner(key);
            }
        }
        rx
    }

    /// One runner per non-empty scope queue. Pops the head, runs it to a
    /// terminal outcome, delivers it, then either continues with the new
    /// head or removes the drained queue and exits.
    fn spawn_runner(&self, key: String) {
        let ctx = self.ctx.clone();
        let queues = self.queues.clone();
        tokio::spawn(async move {
            loop {
                let job = {
                    let mut map = queues.lock().await;
                    let Some(queue) = map.get_mut(&key) else {
                        // abort_all removed the idle entry between jobs.
                        return;
                    };
                    match queue.jobs.pop_front() {
                        Some(job) => {
                            queue.running = Some(job.abort_flag());
                            job
                        }
                        None => {
                            map.remove(&key);
                            return;
                        }
                    }
                };

                let outcome = ctx.execute(&job).await;

                {
                    let mut map = queues.lock().await;
                    if let Some(queue) = map.get_mut(&key) {
                        queue.running = None;
                    }
                }
                job.complete(outcome);
            }
        });
    }
}

fn parse_url(value: &str) -> SwResult<Url> {
    Url::parse(value).map_err(|err| SwError::InvalidScript(format!("{value}: {err}")))
}

fn expect_registration(
    result: Result<JobOutcome, oneshot::error::RecvError>,
) -> SwResult<Registration> {
    match result {
        Ok(Ok(Some(registration))) => Ok(registration),
        Ok(Ok(None)) => Err(SwError::ReferencedResourceBroken(
            "job completed without a registration".into(),
        )),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(SwError::Aborted),
    }
}
