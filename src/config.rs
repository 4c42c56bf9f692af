//! Resolved configuration bundle
//!
//! One JSON document describes everything an orchestration run needs: the
//! regions to reconcile, the task and service specs, allowlist filters, and
//! waiter tuning. Environment variables override the allowlists and the
//! rollback step so operators can scope an invocation without editing the
//! file:
//!
//! - `TARGET_CLUSTER` — comma-separated cluster allowlist
//! - `TARGET_TASK_DEFINITION` — comma-separated family allowlist
//! - `STEP` — rollback step count
//! - `AWS_DEFAULT_REGION` — fallback when no region is configured

use crate::error::{DeployError, Result};
use crate::spec::{ServiceSpec, TaskSpec};
use crate::waiter::WaiterOptions;
use aws_config::BehaviorVersion;
use aws_types::region::Region;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Service role used for load balancer registration when none is configured
pub const DEFAULT_SERVICE_ROLE: &str = "ecsServiceRole";

/// Configuration bundle for one orchestration invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Regions to reconcile; empty means the default region only
    #[serde(default)]
    pub regions: Vec<String>,

    /// Default region when `regions` is empty
    pub default_region: Option<String>,

    /// Cluster applied to services and executions that omit one
    pub default_cluster: Option<String>,

    /// Service role for load balancer attachments
    #[serde(default = "default_service_role")]
    pub service_role: String,

    /// Cluster allowlist; active only when non-empty
    #[serde(default)]
    pub target_clusters: Vec<String>,

    /// Task definition family allowlist; active only when non-empty
    #[serde(default)]
    pub target_task_definitions: Vec<String>,

    /// Revisions to walk backward on rollback
    #[serde(default = "default_rollback_step")]
    pub rollback_step: usize,

    /// Tuning for service stabilization waits
    #[serde(default = "WaiterOptions::service_stable")]
    pub service_waiter: WaiterOptions,

    /// Tuning for one-off task waits
    #[serde(default = "WaiterOptions::task_state")]
    pub run_task_waiter: WaiterOptions,

    /// Source repository used to tag deploys with a commit hash
    pub repository: Option<RepositorySpec>,

    /// Task definition templates
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,

    /// Long-running services
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

fn default_service_role() -> String {
    DEFAULT_SERVICE_ROLE.to_string()
}

fn default_rollback_step() -> usize {
    1
}

/// Source repository pointer for deploy tagging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositorySpec {
    /// Repository URL understood by `git ls-remote`
    pub url: String,

    /// Branch whose head tags the deploy
    pub branch: String,
}

impl DeployConfig {
    /// Load the bundle from a JSON file and apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `TARGET_CLUSTER`, `TARGET_TASK_DEFINITION` and `STEP` overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var("TARGET_CLUSTER") {
            self.target_clusters = split_allowlist(&raw);
        }
        if let Ok(raw) = std::env::var("TARGET_TASK_DEFINITION") {
            self.target_task_definitions = split_allowlist(&raw);
        }
        if let Ok(raw) = std::env::var("STEP") {
            if let Ok(step) = raw.trim().parse::<usize>() {
                self.rollback_step = step;
            }
        }
    }

    /// Regions this invocation reconciles
    pub fn resolved_regions(&self) -> Result<Vec<String>> {
        if !self.regions.is_empty() {
            return Ok(self.regions.clone());
        }
        Ok(vec![self.resolved_default_region()?])
    }

    /// The default region, falling back to `AWS_DEFAULT_REGION`
    pub fn resolved_default_region(&self) -> Result<String> {
        self.default_region
            .clone()
            .or_else(|| std::env::var("AWS_DEFAULT_REGION").ok())
            .ok_or_else(|| {
                DeployError::config("no region configured and AWS_DEFAULT_REGION is unset")
            })
    }

    /// Whether a cluster passes the cluster allowlist
    pub fn is_target_cluster(&self, cluster: &str) -> bool {
        self.target_clusters.is_empty() || self.target_clusters.iter().any(|c| c == cluster)
    }

    /// Whether a family passes the task definition allowlist
    pub fn is_target_task_definition(&self, family: &str) -> bool {
        self.target_task_definitions.is_empty()
            || self.target_task_definitions.iter().any(|t| t == family)
    }
}

/// Split a comma-separated allowlist, trimming whitespace and empties
pub fn split_allowlist(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Create an ECS client for a region
pub async fn create_ecs_client(region: &str) -> aws_sdk_ecs::Client {
    debug!("Creating ECS client for region: {}", region);

    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load()
        .await;

    aws_sdk_ecs::Client::new(&config)
}

/// Create a CloudWatch Logs client for a region
pub async fn create_logs_client(region: &str) -> aws_sdk_cloudwatchlogs::Client {
    debug!("Creating CloudWatch Logs client for region: {}", region);

    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .load()
        .await;

    aws_sdk_cloudwatchlogs::Client::new(&config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> DeployConfig {
        serde_json::from_str(r#"{"regions": ["ap-northeast-1"]}"#).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = minimal_config();
        assert_eq!(config.service_role, DEFAULT_SERVICE_ROLE);
        assert_eq!(config.rollback_step, 1);
        assert_eq!(config.service_waiter, WaiterOptions::service_stable());
        assert_eq!(config.run_task_waiter, WaiterOptions::task_state());
        assert!(config.tasks.is_empty());
        assert!(config.services.is_empty());
    }

    #[test]
    fn test_split_allowlist() {
        assert_eq!(
            split_allowlist("a, b ,c"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert_eq!(split_allowlist(" , "), Vec::<String>::new());
    }

    #[test]
    fn test_empty_allowlists_match_everything() {
        let config = minimal_config();
        assert!(config.is_target_cluster("anything"));
        assert!(config.is_target_task_definition("anything"));
    }

    #[test]
    fn test_non_empty_allowlists_filter() {
        let mut config = minimal_config();
        config.target_clusters = vec!["prod".to_string()];
        config.target_task_definitions = vec!["web".to_string()];

        assert!(config.is_target_cluster("prod"));
        assert!(!config.is_target_cluster("staging"));
        assert!(config.is_target_task_definition("web"));
        assert!(!config.is_target_task_definition("worker"));
    }

    #[test]
    fn test_resolved_regions_prefers_explicit_list() {
        let config = minimal_config();
        assert_eq!(config.resolved_regions().unwrap(), vec!["ap-northeast-1"]);
    }

    #[test]
    fn test_resolved_regions_falls_back_to_default() {
        let config: DeployConfig =
            serde_json::from_str(r#"{"default_region": "us-west-2"}"#).unwrap();
        assert_eq!(config.resolved_regions().unwrap(), vec!["us-west-2"]);
    }
}
