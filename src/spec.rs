//! Declarative task and service specifications
//!
//! These are the immutable inputs to an orchestration run, loaded from the
//! configuration bundle. A [`TaskSpec`] is the template from which task
//! definition revisions are registered; a [`ServiceSpec`] is the desired
//! state of one long-running service; an [`ExecutionSpec`] describes a
//! one-off run of a task definition. Conversions into the ECS request types
//! live here so the managers only deal in SDK builders.

use crate::waiter::WaiterOptions;
use aws_sdk_ecs::types::{
    Compatibility, ContainerDefinition, ContainerOverride, DeploymentConfiguration, HostVolumeProperties,
    KeyValuePair, LoadBalancer, LogConfiguration, LogDriver, NetworkMode, PlacementConstraint,
    PlacementConstraintType, PlacementStrategy, PlacementStrategyType,
    TaskDefinitionPlacementConstraint, TaskDefinitionPlacementConstraintType, Volume,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{DeployError, Result};

/// Docker label carrying the resolved source revision of a deploy
pub const REVISION_LABEL: &str = "deploy.revision";

/// Versioned container-spec template for one task definition family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Family name revisions are registered under
    pub name: String,

    /// Container definitions
    #[serde(default)]
    pub container_definitions: Vec<ContainerSpec>,

    /// Volumes shared between containers
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,

    /// IAM role assumed by the task's containers
    pub task_role_arn: Option<String>,

    /// IAM role used by the agent to pull images and ship logs
    pub execution_role_arn: Option<String>,

    /// Docker network mode (bridge, host, awsvpc, none)
    pub network_mode: Option<String>,

    /// Task-level CPU units
    pub cpu: Option<String>,

    /// Task-level memory
    pub memory: Option<String>,

    /// Launch types the definition must be compatible with
    #[serde(default)]
    pub requires_compatibilities: Vec<String>,

    /// Placement constraints baked into the definition
    #[serde(default)]
    pub placement_constraints: Vec<PlacementConstraintSpec>,

    /// One-off run descriptors attached to this family
    #[serde(default)]
    pub executions: Vec<ExecutionSpec>,
}

impl TaskSpec {
    /// Whether any one-off executions are attached
    pub fn has_executions(&self) -> bool {
        !self.executions.is_empty()
    }

    /// Look up a container spec by name
    pub fn container(&self, name: &str) -> Option<&ContainerSpec> {
        self.container_definitions.iter().find(|c| c.name == name)
    }

    /// Build the SDK container definitions, tagging each with the source
    /// revision label when one was resolved for this deploy.
    pub fn to_container_definitions(&self, revision: Option<&str>) -> Result<Vec<ContainerDefinition>> {
        self.container_definitions
            .iter()
            .map(|c| c.to_container_definition(revision))
            .collect()
    }

    /// Build the SDK volume list
    pub fn to_volumes(&self) -> Vec<Volume> {
        self.volumes.iter().map(VolumeSpec::to_volume).collect()
    }

    /// Build the SDK placement constraints for task definition registration
    pub fn to_placement_constraints(&self) -> Vec<TaskDefinitionPlacementConstraint> {
        self.placement_constraints
            .iter()
            .map(PlacementConstraintSpec::to_task_definition_constraint)
            .collect()
    }

    /// Launch-type compatibilities as SDK values
    pub fn to_compatibilities(&self) -> Vec<Compatibility> {
        self.requires_compatibilities
            .iter()
            .map(|c| Compatibility::from(c.as_str()))
            .collect()
    }

    /// Network mode as an SDK value
    pub fn to_network_mode(&self) -> Option<NetworkMode> {
        self.network_mode
            .as_deref()
            .map(NetworkMode::from)
    }
}

/// One container within a task definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,

    /// Image reference
    pub image: Option<String>,

    /// Command override
    #[serde(default)]
    pub command: Vec<String>,

    /// Whether the task dies when this container dies
    pub essential: Option<bool>,

    /// Environment variables (sorted for deterministic registration)
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Docker labels
    #[serde(default)]
    pub docker_labels: HashMap<String, String>,

    /// Container-level CPU units
    pub cpu: Option<i32>,

    /// Hard memory limit (MiB)
    pub memory: Option<i32>,

    /// Soft memory limit (MiB)
    pub memory_reservation: Option<i32>,

    /// Log driver configuration
    pub log_configuration: Option<LogConfig>,
}

impl ContainerSpec {
    /// Build the SDK container definition
    pub fn to_container_definition(&self, revision: Option<&str>) -> Result<ContainerDefinition> {
        let mut labels = self.docker_labels.clone();
        if let Some(rev) = revision {
            labels.insert(REVISION_LABEL.to_string(), rev.to_string());
        }

        let mut builder = ContainerDefinition::builder()
            .name(&self.name)
            .set_image(self.image.clone())
            .set_essential(self.essential)
            .set_cpu(self.cpu)
            .set_memory(self.memory)
            .set_memory_reservation(self.memory_reservation)
            .set_command(if self.command.is_empty() {
                None
            } else {
                Some(self.command.clone())
            })
            .set_environment(to_key_value_pairs(&self.environment))
            .set_docker_labels(if labels.is_empty() { None } else { Some(labels) });

        if let Some(log) = &self.log_configuration {
            builder = builder.log_configuration(log.to_log_configuration(&self.name)?);
        }

        Ok(builder.build())
    }
}

/// Log driver and driver options for one container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Driver name (e.g. "awslogs")
    pub log_driver: String,

    /// Driver options
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl LogConfig {
    /// Build the SDK log configuration
    pub fn to_log_configuration(&self, container: &str) -> Result<LogConfiguration> {
        LogConfiguration::builder()
            .log_driver(LogDriver::from(self.log_driver.as_str()))
            .set_options(if self.options.is_empty() {
                None
            } else {
                Some(self.options.clone())
            })
            .build()
            .map_err(|e| {
                DeployError::config(format!("invalid log configuration for {container}: {e}"))
            })
    }
}

/// A named volume, optionally backed by a host path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Volume name referenced from mount points
    pub name: String,

    /// Host path backing the volume
    pub host_path: Option<String>,
}

impl VolumeSpec {
    fn to_volume(&self) -> Volume {
        let mut builder = Volume::builder().name(&self.name);
        if self.host_path.is_some() {
            builder = builder.host(
                HostVolumeProperties::builder()
                    .set_source_path(self.host_path.clone())
                    .build(),
            );
        }
        builder.build()
    }
}

/// Placement constraint, usable for definitions and services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementConstraintSpec {
    /// Constraint type (memberOf, distinctInstance)
    #[serde(rename = "type")]
    pub constraint_type: String,

    /// Cluster query language expression
    pub expression: Option<String>,
}

impl PlacementConstraintSpec {
    fn to_task_definition_constraint(&self) -> TaskDefinitionPlacementConstraint {
        TaskDefinitionPlacementConstraint::builder()
            .r#type(TaskDefinitionPlacementConstraintType::from(
                self.constraint_type.as_str(),
            ))
            .set_expression(self.expression.clone())
            .build()
    }

    /// Build the service-level SDK constraint
    pub fn to_service_constraint(&self) -> PlacementConstraint {
        PlacementConstraint::builder()
            .r#type(PlacementConstraintType::from(self.constraint_type.as_str()))
            .set_expression(self.expression.clone())
            .build()
    }
}

/// Placement strategy rule for a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementStrategySpec {
    /// Strategy type (spread, binpack, random)
    #[serde(rename = "type")]
    pub strategy_type: String,

    /// Attribute the strategy applies to
    pub field: Option<String>,
}

impl PlacementStrategySpec {
    /// Build the SDK placement strategy
    pub fn to_placement_strategy(&self) -> PlacementStrategy {
        PlacementStrategy::builder()
            .r#type(PlacementStrategyType::from(self.strategy_type.as_str()))
            .set_field(self.field.clone())
            .build()
    }
}

/// Desired state of one long-running service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Service name
    pub name: String,

    /// Cluster the service runs in (falls back to the default cluster)
    pub cluster: Option<String>,

    /// Task definition family the service tracks (defaults to the service name)
    pub task_definition_name: Option<String>,

    /// Desired task count; omission preserves the running count on update
    pub desired_count: Option<i32>,

    /// Load balancer attachments
    #[serde(default)]
    pub load_balancers: Vec<LoadBalancerSpec>,

    /// Max / min healthy percent during a deployment
    pub deployment_configuration: Option<DeploymentConfigSpec>,

    /// Service-level placement constraints
    #[serde(default)]
    pub placement_constraints: Vec<PlacementConstraintSpec>,

    /// Placement strategy rules
    #[serde(default)]
    pub placement_strategy: Vec<PlacementStrategySpec>,

    /// Launch type (EC2, FARGATE)
    pub launch_type: Option<String>,

    /// Explicit service role for load balancer registration
    pub service_role: Option<String>,

    /// Force a new deployment even when the definition is unchanged
    #[serde(default)]
    pub force_new_deployment: bool,

    /// Grace period before load balancer health checks count
    pub health_check_grace_period_seconds: Option<i32>,
}

impl ServiceSpec {
    /// Family name the service tracks
    pub fn task_definition_name(&self) -> &str {
        self.task_definition_name.as_deref().unwrap_or(&self.name)
    }

    /// Build the SDK load balancer attachments
    pub fn to_load_balancers(&self) -> Vec<LoadBalancer> {
        self.load_balancers
            .iter()
            .map(LoadBalancerSpec::to_load_balancer)
            .collect()
    }

    /// Build the SDK deployment configuration (200% / 100% when unspecified)
    pub fn to_deployment_configuration(&self) -> DeploymentConfiguration {
        self.deployment_configuration
            .clone()
            .unwrap_or_default()
            .to_deployment_configuration()
    }
}

/// Load balancer attachment for a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerSpec {
    /// Target group ARN (ALB/NLB)
    pub target_group_arn: Option<String>,

    /// Classic load balancer name
    pub load_balancer_name: Option<String>,

    /// Container receiving traffic
    pub container_name: String,

    /// Container port receiving traffic
    pub container_port: i32,
}

impl LoadBalancerSpec {
    fn to_load_balancer(&self) -> LoadBalancer {
        LoadBalancer::builder()
            .set_target_group_arn(self.target_group_arn.clone())
            .set_load_balancer_name(self.load_balancer_name.clone())
            .container_name(&self.container_name)
            .container_port(self.container_port)
            .build()
    }
}

/// Deployment rollout bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfigSpec {
    /// Upper bound on running tasks during a rollout (percent of desired)
    pub maximum_percent: i32,

    /// Lower bound on healthy tasks during a rollout (percent of desired)
    pub minimum_healthy_percent: i32,
}

impl Default for DeploymentConfigSpec {
    fn default() -> Self {
        Self {
            maximum_percent: 200,
            minimum_healthy_percent: 100,
        }
    }
}

impl DeploymentConfigSpec {
    fn to_deployment_configuration(&self) -> DeploymentConfiguration {
        DeploymentConfiguration::builder()
            .maximum_percent(self.maximum_percent)
            .minimum_healthy_percent(self.minimum_healthy_percent)
            .build()
    }
}

/// One-off run descriptor for a task definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSpec {
    /// Cluster to run in (falls back to the default cluster)
    pub cluster: Option<String>,

    /// Per-container overrides
    #[serde(default)]
    pub container_overrides: Vec<ContainerOverrideSpec>,

    /// Number of task instances to start
    #[serde(default = "default_count")]
    pub count: i32,

    /// Containers whose exit is waited on and whose exit code is checked
    #[serde(default)]
    pub wait_for_stop: Vec<String>,

    /// Waiter tuning override for this execution
    pub waiter: Option<WaiterOptions>,
}

impl ExecutionSpec {
    /// Whether the run should block until the named containers stop
    pub fn monitored(&self) -> bool {
        !self.wait_for_stop.is_empty()
    }

    /// Build the SDK container overrides
    pub fn to_container_overrides(&self) -> Vec<ContainerOverride> {
        self.container_overrides
            .iter()
            .map(ContainerOverrideSpec::to_container_override)
            .collect()
    }
}

fn default_count() -> i32 {
    1
}

/// Override applied to one container for a one-off run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerOverrideSpec {
    /// Container to override
    pub name: String,

    /// Command override
    pub command: Option<Vec<String>>,

    /// Additional environment variables
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl ContainerOverrideSpec {
    fn to_container_override(&self) -> ContainerOverride {
        ContainerOverride::builder()
            .name(&self.name)
            .set_command(self.command.clone())
            .set_environment(to_key_value_pairs(&self.environment))
            .build()
    }
}

fn to_key_value_pairs(env: &BTreeMap<String, String>) -> Option<Vec<KeyValuePair>> {
    if env.is_empty() {
        return None;
    }
    Some(
        env.iter()
            .map(|(k, v)| KeyValuePair::builder().name(k).value(v).build())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task_json() -> &'static str {
        r#"{
            "name": "web",
            "container_definitions": [
                {
                    "name": "app",
                    "image": "example/app:latest",
                    "essential": true,
                    "environment": {"RAILS_ENV": "production"},
                    "log_configuration": {
                        "log_driver": "awslogs",
                        "options": {
                            "awslogs-group": "web",
                            "awslogs-region": "ap-northeast-1",
                            "awslogs-stream-prefix": "web"
                        }
                    }
                }
            ],
            "executions": [
                {
                    "cluster": null,
                    "container_overrides": [
                        {"name": "app", "command": ["rake", "db:migrate"]}
                    ],
                    "wait_for_stop": ["app"]
                }
            ]
        }"#
    }

    #[test]
    fn test_task_spec_deserializes_with_defaults() {
        let spec: TaskSpec = serde_json::from_str(sample_task_json()).unwrap();
        assert_eq!(spec.name, "web");
        assert!(spec.has_executions());
        assert!(spec.volumes.is_empty());
        assert_eq!(spec.executions[0].count, 1);
        assert!(spec.executions[0].monitored());
    }

    #[test]
    fn test_container_definition_carries_revision_label() {
        let spec: TaskSpec = serde_json::from_str(sample_task_json()).unwrap();
        let defs = spec.to_container_definitions(Some("abc123")).unwrap();
        assert_eq!(defs.len(), 1);
        let labels = defs[0].docker_labels().unwrap();
        assert_eq!(labels.get(REVISION_LABEL).map(String::as_str), Some("abc123"));
    }

    #[test]
    fn test_container_definition_without_revision_has_no_label() {
        let spec: TaskSpec = serde_json::from_str(sample_task_json()).unwrap();
        let defs = spec.to_container_definitions(None).unwrap();
        assert!(defs[0].docker_labels().is_none());
    }

    #[test]
    fn test_service_spec_task_definition_defaults_to_name() {
        let spec: ServiceSpec = serde_json::from_str(r#"{"name": "web"}"#).unwrap();
        assert_eq!(spec.task_definition_name(), "web");

        let spec: ServiceSpec =
            serde_json::from_str(r#"{"name": "web", "task_definition_name": "web-task"}"#).unwrap();
        assert_eq!(spec.task_definition_name(), "web-task");
    }

    #[test]
    fn test_deployment_configuration_defaults() {
        let spec: ServiceSpec = serde_json::from_str(r#"{"name": "web"}"#).unwrap();
        let dc = spec.to_deployment_configuration();
        assert_eq!(dc.maximum_percent(), Some(200));
        assert_eq!(dc.minimum_healthy_percent(), Some(100));
    }

    #[test]
    fn test_execution_overrides_convert() {
        let spec: TaskSpec = serde_json::from_str(sample_task_json()).unwrap();
        let overrides = spec.executions[0].to_container_overrides();
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides[0].name(), Some("app"));
        assert_eq!(
            overrides[0].command(),
            ["rake".to_string(), "db:migrate".to_string()]
        );
    }
}
