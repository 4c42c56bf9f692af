//! Per-region orchestration strategy
//!
//! One [`RegionStrategy`] owns every task definition manager and service
//! reconciler for one region. Services failing the cluster or
//! task-definition allowlist are excluded at construction and never touched
//! for the rest of the invocation. Fan-out operations isolate failures at
//! the single-service / single-task-definition boundary: a failing entity is
//! logged and recorded, its siblings still run, and the call returns one
//! aggregate error at the end.

use crate::config::{self, DeployConfig};
use crate::error::{DeployError, Result};
use crate::service::ServiceReconciler;
use crate::spec::ServiceSpec;
use crate::task_definition::TaskDefinitionManager;
use crate::waiter::WaiterOptions;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How the rollback target is picked from the candidate window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackTargetPolicy {
    /// Walk back exactly `step` revisions: the oldest ARN in the window
    OldestInWindow,
}

/// Deliberate default, kept for compatibility with existing release flows
pub const ROLLBACK_TARGET_POLICY: RollbackTargetPolicy = RollbackTargetPolicy::OldestInWindow;

fn select_rollback_target(window: &[String]) -> Option<&String> {
    match ROLLBACK_TARGET_POLICY {
        RollbackTargetPolicy::OldestInWindow => window.last(),
    }
}

/// Resolve the cluster a service runs in, falling back to the default
fn resolve_cluster(spec: &ServiceSpec, default_cluster: Option<&str>) -> Result<String> {
    spec.cluster
        .clone()
        .or_else(|| default_cluster.map(str::to_string))
        .ok_or_else(|| {
            DeployError::config(format!(
                "service {} has no cluster and no default cluster is configured",
                spec.name
            ))
        })
}

/// Whether a service passes both allowlist filters
fn accepts_service(config: &DeployConfig, spec: &ServiceSpec, cluster: &str) -> bool {
    config.is_target_cluster(cluster) && config.is_target_task_definition(spec.task_definition_name())
}

/// Owns one region's task definitions and services for one invocation
pub struct RegionStrategy {
    region: String,
    default_cluster: Option<String>,
    service_waiter: WaiterOptions,
    task_definitions: Vec<TaskDefinitionManager>,
    services: Vec<ServiceReconciler>,
}

impl RegionStrategy {
    /// Build the strategy for one region: one manager per task spec, one
    /// reconciler per service spec passing the allowlist filters.
    pub async fn new(config: &DeployConfig, region: String) -> Result<Self> {
        let client = config::create_ecs_client(&region).await;

        let task_definitions = config
            .tasks
            .iter()
            .map(|spec| {
                TaskDefinitionManager::new(
                    spec.clone(),
                    region.clone(),
                    client.clone(),
                    config.run_task_waiter,
                )
            })
            .collect();

        let mut services = Vec::new();
        for spec in &config.services {
            let cluster = resolve_cluster(spec, config.default_cluster.as_deref())?;
            if !accepts_service(config, spec, &cluster) {
                debug!(
                    "service {} excluded by allowlist filters in {}",
                    spec.name, region
                );
                continue;
            }
            services.push(ServiceReconciler::new(
                spec.clone(),
                cluster,
                region.clone(),
                client.clone(),
                &config.service_role,
            ));
        }

        Ok(Self {
            region,
            default_cluster: config.default_cluster.clone(),
            service_waiter: config.service_waiter,
            task_definitions,
            services,
        })
    }

    /// Region this strategy reconciles
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Services owned by this strategy after filtering
    pub fn service_names(&self) -> Vec<&str> {
        self.services.iter().map(ServiceReconciler::name).collect()
    }

    /// Tag subsequent registrations with a source revision
    pub fn set_revision_label(&mut self, revision: Option<String>) {
        for manager in &mut self.task_definitions {
            manager.set_revision_label(revision.clone());
        }
    }

    /// Register every task definition that has at least one execution.
    ///
    /// Run-path registrations are always fresh, regardless of the
    /// in-process registered flag.
    pub async fn register_for_run(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        for manager in &mut self.task_definitions {
            if !manager.has_executions() {
                continue;
            }
            if let Err(e) = manager.register().await {
                error!(
                    "failed to register {} in {}: {}",
                    manager.family(),
                    self.region,
                    e
                );
                failures.push(format!("{}: {}", manager.family(), e));
            }
        }
        aggregate(format!("register for run in {}", self.region), failures)
    }

    /// Register every task definition not already registered during this
    /// invocation. Consults only the in-process flag, never the control
    /// plane.
    pub async fn register_for_deploy(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        for manager in &mut self.task_definitions {
            if manager.registered() {
                continue;
            }
            if let Err(e) = manager.register().await {
                error!(
                    "failed to register {} in {}: {}",
                    manager.family(),
                    self.region,
                    e
                );
                failures.push(format!("{}: {}", manager.family(), e));
            }
        }
        aggregate(format!("register for deploy in {}", self.region), failures)
    }

    /// Run every execution of every task definition that has one,
    /// sequentially per definition. An execution failure skips that
    /// definition's remaining executions but not its siblings.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let mut failures = Vec::new();
        for manager in &self.task_definitions {
            if !manager.has_executions() {
                continue;
            }
            for execution in &manager.spec().executions {
                let mut execution = execution.clone();
                if execution.cluster.is_none() {
                    execution.cluster = self.default_cluster.clone();
                }
                if let Err(e) = manager.run(&execution, cancel).await {
                    if e.is_cancelled() {
                        return Err(e);
                    }
                    error!(
                        "execution of {} failed in {}: {}",
                        manager.family(),
                        self.region,
                        e
                    );
                    failures.push(format!("{}: {}", manager.family(), e));
                    break;
                }
            }
        }
        aggregate(format!("run in {}", self.region), failures)
    }

    /// Deploy every owned service toward its target definition, then wait
    /// once for the whole batch to stabilize. Assumes definitions were
    /// registered beforehand; the caller sequences that.
    pub async fn deploy(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut failures = Vec::new();
        let mut deployed = Vec::new();

        for (index, service) in self.services.iter_mut().enumerate() {
            match service.deploy().await {
                Ok(()) => deployed.push(index),
                Err(e) => {
                    error!(
                        "failed to deploy service {} in {}: {}",
                        service.name(),
                        self.region,
                        e
                    );
                    failures.push(format!("{}: {}", service.name(), e));
                }
            }
        }

        let wait_on: Vec<&ServiceReconciler> =
            deployed.iter().map(|&i| &self.services[i]).collect();
        if !wait_on.is_empty() {
            if let Err(e) =
                ServiceReconciler::wait_all_stable(&wait_on, self.service_waiter, cancel).await
            {
                if e.is_cancelled() {
                    return Err(e);
                }
                failures.push(e.to_string());
            }
        }

        aggregate(format!("deploy in {}", self.region), failures)
    }

    /// Roll every owned service back `step` revisions, wait for the batch to
    /// stabilize, then deregister the revisions made obsolete by the
    /// rollback (computed from each service's pre-rollback revision).
    pub async fn rollback(&mut self, step: usize, cancel: &CancellationToken) -> Result<()> {
        let mut failures = Vec::new();
        let mut rolled_back: Vec<(usize, String)> = Vec::new();

        for index in 0..self.services.len() {
            let name = self.services[index].name().to_string();
            let current = match self.services[index].current_task_definition_arn().await {
                Ok(current) => current,
                Err(e) => {
                    error!("cannot read current revision of {}: {}", name, e);
                    failures.push(format!("{name}: {e}"));
                    continue;
                }
            };

            let Some(manager) = manager_for(&self.task_definitions, &self.services[index]) else {
                failures.push(format!("{name}: no task definition owns this service"));
                continue;
            };

            let window = manager.rollback_range(&current, step).await;
            let Some(target) = select_rollback_target(&window) else {
                let e = DeployError::RollbackUnavailable {
                    service: name.clone(),
                    current: current.clone(),
                };
                error!("{}", e);
                failures.push(e.to_string());
                continue;
            };
            let target = target.clone();

            info!("rollback {}: {} -> {}", name, current, target);
            let service = &mut self.services[index];
            service.set_target_definition(target);
            match service.deploy().await {
                Ok(()) => rolled_back.push((index, current)),
                Err(e) => {
                    error!("failed to roll back service {}: {}", name, e);
                    failures.push(format!("{name}: {e}"));
                }
            }
        }

        let wait_on: Vec<&ServiceReconciler> =
            rolled_back.iter().map(|&(i, _)| &self.services[i]).collect();
        if !wait_on.is_empty() {
            if let Err(e) =
                ServiceReconciler::wait_all_stable(&wait_on, self.service_waiter, cancel).await
            {
                if e.is_cancelled() {
                    return Err(e);
                }
                failures.push(e.to_string());
            }
        }

        // Cleanup is best-effort: a failed deregistration is logged, never
        // fails the rollback.
        for (index, previous_current) in &rolled_back {
            let service = &self.services[*index];
            let Some(manager) = manager_for(&self.task_definitions, service) else {
                continue;
            };
            let newer = manager.newer_revisions(previous_current).await;
            if newer.is_empty() {
                continue;
            }
            info!("{} will be removed.", newer.join(","));
            for arn in &newer {
                if let Err(e) = manager.deregister(arn).await {
                    warn!("failed to deregister {}: {}", arn, e);
                }
            }
        }

        aggregate(format!("rollback in {}", self.region), failures)
    }

    /// Log a read-only status snapshot of every owned service
    pub async fn display_status(&self) -> Result<()> {
        let services: Vec<&ServiceReconciler> = self.services.iter().collect();
        ServiceReconciler::display_status(&services).await
    }
}

/// The manager owning a service: matched by the service's task definition
/// name, falling back to the service name itself.
fn manager_for<'a>(
    managers: &'a [TaskDefinitionManager],
    service: &ServiceReconciler,
) -> Option<&'a TaskDefinitionManager> {
    managers
        .iter()
        .find(|m| m.family() == service.task_definition_name() || m.family() == service.name())
}

fn aggregate(scope: String, failures: Vec<String>) -> Result<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(DeployError::Aggregate { scope, failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_spec(json: &str) -> ServiceSpec {
        serde_json::from_str(json).unwrap()
    }

    fn config_with(targets_cluster: &[&str], targets_family: &[&str]) -> DeployConfig {
        let mut config: DeployConfig =
            serde_json::from_str(r#"{"regions": ["ap-northeast-1"]}"#).unwrap();
        config.target_clusters = targets_cluster.iter().map(|s| s.to_string()).collect();
        config.target_task_definitions = targets_family.iter().map(|s| s.to_string()).collect();
        config
    }

    #[test]
    fn test_select_rollback_target_is_oldest_in_window() {
        let window = vec!["r2".to_string(), "r1".to_string()];
        assert_eq!(select_rollback_target(&window).map(String::as_str), Some("r1"));
        assert_eq!(select_rollback_target(&[]), None);
    }

    #[test]
    fn test_resolve_cluster_prefers_spec_cluster() {
        let spec = service_spec(r#"{"name": "web", "cluster": "prod"}"#);
        assert_eq!(resolve_cluster(&spec, Some("default")).unwrap(), "prod");
    }

    #[test]
    fn test_resolve_cluster_falls_back_to_default() {
        let spec = service_spec(r#"{"name": "web"}"#);
        assert_eq!(resolve_cluster(&spec, Some("default")).unwrap(), "default");
        assert!(resolve_cluster(&spec, None).is_err());
    }

    #[test]
    fn test_accepts_service_with_empty_allowlists() {
        let config = config_with(&[], &[]);
        let spec = service_spec(r#"{"name": "web", "cluster": "prod"}"#);
        assert!(accepts_service(&config, &spec, "prod"));
    }

    #[test]
    fn test_accepts_service_filters_independently() {
        let config = config_with(&["prod"], &["web"]);
        let web = service_spec(r#"{"name": "web", "cluster": "prod"}"#);
        let worker = service_spec(r#"{"name": "worker", "cluster": "prod"}"#);
        assert!(accepts_service(&config, &web, "prod"));
        assert!(!accepts_service(&config, &web, "staging"));
        assert!(!accepts_service(&config, &worker, "prod"));
    }

    #[test]
    fn test_aggregate_empty_is_ok() {
        assert!(aggregate("deploy".to_string(), Vec::new()).is_ok());
        let err = aggregate("deploy".to_string(), vec!["web: boom".to_string()]).unwrap_err();
        assert!(err.to_string().contains("web: boom"));
    }
}
