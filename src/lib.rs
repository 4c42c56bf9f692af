//! # ECS Deploy
//!
//! Rolling deployment, rollback and one-off batch execution for Amazon ECS
//! services, across one or more independent regions.
//!
//! ## Architecture
//!
//! ```text
//! MultiRegionCoordinator
//! ├── RegionStrategy (per region)
//! │   ├── TaskDefinitionManager (per family)
//! │   │     register / revision history / rollback windows / one-off runs
//! │   └── ServiceReconciler (per service)
//! │         create-or-update / batched stabilization / event tailing
//! └── fan-out: deploy, rollback, run, register, status
//! ```
//!
//! Each region is reconciled independently; there is no cross-region
//! ordering or atomicity. Within a region, failures are isolated per task
//! definition and per service: siblings still run and one aggregate error is
//! returned at the end.
//!
//! ## Rollback
//!
//! Rollback walks each service back a configurable number of revisions
//! through the control plane's newest-first revision history, redeploys,
//! waits for the batch to stabilize, and then deregisters the revisions the
//! rollback made obsolete. The target is the oldest revision in the step
//! window; see [`strategy::ROLLBACK_TARGET_POLICY`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod logs;
pub mod region;
pub mod revision;
pub mod service;
pub mod spec;
pub mod strategy;
pub mod task_definition;
pub mod waiter;

// ============================================================================
// Public exports - orchestration entry points
// ============================================================================

pub use region::MultiRegionCoordinator;
pub use strategy::{RegionStrategy, RollbackTargetPolicy, ROLLBACK_TARGET_POLICY};

// ============================================================================
// Public exports - core infrastructure
// ============================================================================

// Error handling
pub use error::{DeployError, Result};

// Configuration and data model
pub use config::{DeployConfig, RepositorySpec, DEFAULT_SERVICE_ROLE};
pub use spec::{
    ContainerSpec, ExecutionSpec, LogConfig, ServiceSpec, TaskSpec,
};
pub use waiter::WaiterOptions;

// Per-entity managers
pub use service::{EventTail, RemoteServiceState, ServiceReconciler, ServiceSummary};
pub use task_definition::TaskDefinitionManager;
