//! # Ferrokit Service Workers
//!
//! Registration job coordination and versioned worker lifecycle management
//! for the Ferrokit browser engine.
//!
//! ## Features
//!
//! - **Job Coordinator**: per-scope FIFO queues for register/update/unregister
//! - **Lifecycle**: install → activate state machine per worker version
//! - **Coalescing**: identical concurrent register requests share one job
//! - **Controllees**: client reference counting gates activation and teardown
//! - **Abort**: global shutdown with exactly-one completion per request
//!
//! ## Architecture
//!
//! ```text
//! JobCoordinator
//!     │  (one FIFO queue per scope, one running job per scope)
//!     └── RegistrationJob (Register | Update | Unregister)
//!             │
//!             ├── StorageFacade ──── durable registration records
//!             ├── LifecycleDriver ── fetch script → start → dispatch events
//!             │       ├── ScriptFetcher (external)
//!             │       └── ExecutionHost (external)
//!             └── SwStore ────────── live Registration/Version arena
//!                     ├── Registration (installing/waiting/active slots)
//!                     └── Version (New → … → Activated, Redundant terminal)
//! ```
//!
//! Script execution, networking, and persistence are consumed through the
//! capability traits in [`lifecycle`] and [`storage`]; this crate is only
//! the coordination core.

use std::time::Duration;
use thiserror::Error;

pub mod coordinator;
pub mod job;
pub mod lifecycle;
pub mod registration;
pub mod storage;
pub mod store;
pub mod version;

#[cfg(test)]
pub(crate) mod testutil;

pub use coordinator::JobCoordinator;
pub use job::JobKind;
pub use lifecycle::{
    EventKind, EventOutcome, ExecutionHost, FetchError, FetchedScript, HostError, LifecycleDriver,
    ScriptFetcher,
};
pub use registration::{Registration, RegistrationId};
pub use storage::{InMemoryStorage, StorageError, StorageFacade, StoredRegistration};
pub use store::{PendingAction, SwStore};
pub use version::{Version, VersionId, VersionStatus};

// ==================== Errors ====================

/// Errors surfaced by registration jobs and the coordinator.
#[derive(Error, Debug, Clone)]
pub enum SwError {
    #[error("No registration for scope: {0}")]
    NotFound(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Worker start failed: {0}")]
    StartWorkerFailed(String),

    #[error("Referenced resource broken: {0}")]
    ReferencedResourceBroken(String),

    #[error("Aborted")]
    Aborted,

    #[error("Invalid scope or script URL: {0}")]
    InvalidScript(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for SwError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Result type alias for service worker operations.
pub type SwResult<T> = std::result::Result<T, SwError>;

// ==================== Types ====================

/// Identifier of a client (a page or worker depending on an active version).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    /// Create a client id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Window within which a completed update check suppresses another one.
    pub update_check_interval: Duration,

    /// Maximum listeners a queued register job may accumulate through
    /// coalescing. 0 means unlimited.
    pub max_coalesced_listeners: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            // Matches the conventional browser 24h update-check window.
            update_check_interval: Duration::from_secs(24 * 60 * 60),
            max_coalesced_listeners: 0,
        }
    }
}

// ==================== Events ====================

/// Events published by the core, delivered in transition order.
#[derive(Debug, Clone)]
pub enum SwEvent {
    /// A version moved to a new lifecycle status.
    VersionState {
        registration: RegistrationId,
        version: VersionId,
        status: VersionStatus,
    },
    /// A registration was persisted (new or updated).
    RegistrationStored {
        registration: RegistrationId,
        scope: String,
    },
    /// A registration was torn down and removed.
    RegistrationDeleted {
        registration: RegistrationId,
        scope: String,
    },
    /// A job started installing a new version over an existing registration.
    UpdateFound { registration: RegistrationId },
}
