//! Scripted fakes for the external capabilities, shared by unit tests.

use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::lifecycle::{
    EventKind, EventOutcome, ExecutionHost, FetchError, FetchedScript, HostError, ScriptFetcher,
};
use crate::version::VersionId;

/// Fetcher serving configurable script bytes. Unconfigured URLs get their
/// own URL string as body, fetched "over the network".
pub(crate) struct FakeFetcher {
    scripts: Mutex<HashMap<String, FetchedScript>>,
    failures: Mutex<HashSet<String>>,
    fetches: AtomicUsize,
    gate: Mutex<Option<Arc<tokio::sync::Semaphore>>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashSet::new()),
            fetches: AtomicUsize::new(0),
            gate: Mutex::new(None),
        }
    }

    /// Serve `bytes` for `url` with network access.
    pub fn serve(&self, url: &str, bytes: Vec<u8>) {
        self.scripts.lock().unwrap().insert(
            url.to_string(),
            FetchedScript {
                bytes,
                network_accessed: true,
            },
        );
    }

    /// Serve `bytes` for `url` as a pure cache hit.
    pub fn cache(&self, url: &str, bytes: Vec<u8>) {
        self.scripts.lock().unwrap().insert(
            url.to_string(),
            FetchedScript {
                bytes,
                network_accessed: false,
            },
        );
    }

    /// Make fetches of `url` fail.
    pub fn fail(&self, url: &str) {
        self.failures.lock().unwrap().insert(url.to_string());
    }

    /// Total number of fetch calls.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Block every fetch until [`Self::release`] grants permits.
    pub fn hold(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(tokio::sync::Semaphore::new(0)));
    }

    /// Let `n` held fetches proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = self.gate.lock().unwrap().as_ref() {
            gate.add_permits(n);
        }
    }
}

#[async_trait]
impl ScriptFetcher for FakeFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedScript, FetchError> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(FetchError::Network("gate closed".into())),
            }
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failures.lock().unwrap().contains(url.as_str()) {
            return Err(FetchError::Network(format!("unreachable: {url}")));
        }
        let configured = self.scripts.lock().unwrap().get(url.as_str()).cloned();
        Ok(configured.unwrap_or_else(|| FetchedScript {
            bytes: url.as_str().as_bytes().to_vec(),
            network_accessed: true,
        }))
    }
}

/// Execution host recording starts/stops, with switchable refusals and an
/// in-flight dispatch counter for serialization assertions.
pub(crate) struct FakeHost {
    started: Mutex<Vec<VersionId>>,
    stopped: Mutex<Vec<VersionId>>,
    refuse_start: AtomicBool,
    reject_install: AtomicBool,
    reject_activate: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    dispatch_delay: Mutex<Option<Duration>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            started: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            refuse_start: AtomicBool::new(false),
            reject_install: AtomicBool::new(false),
            reject_activate: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            dispatch_delay: Mutex::new(None),
        }
    }

    pub fn refuse_start(&self) {
        self.refuse_start.store(true, Ordering::SeqCst);
    }

    pub fn reject_install(&self) {
        self.reject_install.store(true, Ordering::SeqCst);
    }

    pub fn reject_activate(&self) {
        self.reject_activate.store(true, Ordering::SeqCst);
    }

    pub fn delay_dispatch(&self, delay: Duration) {
        *self.dispatch_delay.lock().unwrap() = Some(delay);
    }

    pub fn was_started(&self, version: VersionId) -> bool {
        self.started.lock().unwrap().contains(&version)
    }

    pub fn was_stopped(&self, version: VersionId) -> bool {
        self.stopped.lock().unwrap().contains(&version)
    }

    /// Highest number of concurrently in-flight event dispatches seen.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionHost for FakeHost {
    async fn start(
        &self,
        version: VersionId,
        _script_url: &Url,
        _script: &[u8],
    ) -> Result<(), HostError> {
        if self.refuse_start.load(Ordering::SeqCst) {
            return Err(HostError::StartRefused("host refused".into()));
        }
        self.started.lock().unwrap().push(version);
        Ok(())
    }

    async fn dispatch_event(
        &self,
        _version: VersionId,
        kind: EventKind,
    ) -> Result<EventOutcome, HostError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let delay = *self.dispatch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = match kind {
            EventKind::Install if self.reject_install.load(Ordering::SeqCst) => {
                EventOutcome::Rejected
            }
            EventKind::Activate if self.reject_activate.load(Ordering::SeqCst) => {
                EventOutcome::Rejected
            }
            EventKind::Install => EventOutcome::Accepted {
                fetch_handler_registered: true,
            },
            EventKind::Activate => EventOutcome::Accepted {
                fetch_handler_registered: false,
            },
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(outcome)
    }

    async fn stop(&self, version: VersionId) {
        self.stopped.lock().unwrap().push(version);
    }
}
