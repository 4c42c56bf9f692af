//! Service reconciliation: create-or-update, stabilization, status
//!
//! One [`ServiceReconciler`] owns one long-running service's desired state.
//! Each `deploy` derives the remote state once as a [`RemoteServiceState`]
//! variant and branches on it, so the create-vs-update decision is auditable
//! in isolation from the network call. Stabilization waits are batched per
//! (cluster, region) so one describe call covers every service sharing a
//! cluster, and each poll attempt tails deployment events past a
//! monotonically advancing watermark so no event is shown twice and none is
//! missed between attempts.

use crate::error::{DeployError, Result};
use crate::spec::ServiceSpec;
use crate::waiter::{self, WaiterOptions};
use aws_sdk_ecs::types::{LaunchType, Service, ServiceEvent};
use aws_sdk_ecs::Client;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Remote state of one service, derived once per reconciliation
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteServiceState {
    /// No service of this name exists
    Absent,

    /// Service exists and is operational
    Active(ServiceSummary),

    /// Service exists but is draining or inactive; create replaces it
    Inactive,
}

/// Snapshot of an active remote service
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSummary {
    /// Task definition revision currently in service
    pub task_definition: Option<String>,

    /// Instances currently running
    pub running_count: i32,

    /// Instances the control plane converges toward
    pub desired_count: i32,
}

impl RemoteServiceState {
    /// Derive the state from a describe-services response
    pub fn from_describe(services: &[Service], name: &str) -> Self {
        let service = services
            .iter()
            .find(|s| s.service_name() == Some(name));
        match service {
            None => Self::Absent,
            Some(s) if s.status() == Some("ACTIVE") => Self::Active(ServiceSummary {
                task_definition: s.task_definition().map(str::to_string),
                running_count: s.running_count(),
                desired_count: s.desired_count(),
            }),
            Some(_) => Self::Inactive,
        }
    }
}

/// Whether a service has converged: one steady deployment, counts matching
fn is_stable(service: &Service) -> bool {
    service.deployments().len() == 1 && service.running_count() == service.desired_count()
}

/// Watermark over a service's event feed.
///
/// ECS reports events newest first; `fresh` returns only the events created
/// after the watermark, re-ordered oldest first, and advances the watermark
/// to the newest one returned.
#[derive(Debug, Clone)]
pub struct EventTail {
    last_seen: Option<DateTime<Utc>>,
}

impl EventTail {
    /// Tail events created after `start`
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            last_seen: Some(start),
        }
    }

    /// Tail every event in the feed
    pub fn from_beginning() -> Self {
        Self { last_seen: None }
    }

    /// Events newer than the watermark, in creation order
    pub fn fresh(&mut self, events: &[ServiceEvent]) -> Vec<(DateTime<Utc>, String)> {
        let mut fresh: Vec<(DateTime<Utc>, String)> = events
            .iter()
            .filter_map(|e| {
                let at = e
                    .created_at()
                    .and_then(|d| DateTime::from_timestamp(d.secs(), d.subsec_nanos()))?;
                if self.last_seen.is_some_and(|seen| at <= seen) {
                    return None;
                }
                Some((at, e.message().unwrap_or("").to_string()))
            })
            .collect();
        fresh.sort_by_key(|(at, _)| *at);
        if let Some((at, _)) = fresh.last() {
            self.last_seen = Some(*at);
        }
        fresh
    }
}

/// Owns one service's desired state for the duration of an invocation
pub struct ServiceReconciler {
    spec: ServiceSpec,
    cluster: String,
    region: String,
    client: Client,
    service_role: String,
    target_definition: String,
    last_deployed_at: Option<DateTime<Utc>>,
}

impl ServiceReconciler {
    /// Create a reconciler for one service in one cluster and region
    pub fn new(
        spec: ServiceSpec,
        cluster: String,
        region: String,
        client: Client,
        default_service_role: &str,
    ) -> Self {
        let service_role = spec
            .service_role
            .clone()
            .unwrap_or_else(|| default_service_role.to_string());
        let target_definition = spec.task_definition_name().to_string();
        Self {
            spec,
            cluster,
            region,
            client,
            service_role,
            target_definition,
            last_deployed_at: None,
        }
    }

    /// Service name
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Cluster the service runs in
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Region the service runs in
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Task definition family the service tracks
    pub fn task_definition_name(&self) -> &str {
        self.spec.task_definition_name()
    }

    /// Definition reference the next deploy points the service at
    pub fn target_definition(&self) -> &str {
        &self.target_definition
    }

    /// Point the next deploy at a specific revision (rollback path)
    pub fn set_target_definition(&mut self, reference: impl Into<String>) {
        self.target_definition = reference.into();
    }

    /// Event tail for the stabilization wait: starts at the last deploy
    /// when one happened this invocation, otherwise covers the whole feed.
    fn deployment_event_tail(&self) -> EventTail {
        match self.last_deployed_at {
            Some(start) => EventTail::starting_at(start),
            None => EventTail::from_beginning(),
        }
    }

    /// Task definition revision currently in service on the control plane
    pub async fn current_task_definition_arn(&self) -> Result<String> {
        let response = self
            .client
            .describe_services()
            .cluster(&self.cluster)
            .services(&self.spec.name)
            .send()
            .await
            .map_err(DeployError::from_ecs)?;

        response
            .services()
            .first()
            .and_then(|s| s.task_definition())
            .map(str::to_string)
            .ok_or_else(|| DeployError::ServiceNotFound(self.spec.name.clone()))
    }

    /// Derive the remote state of this service
    pub async fn remote_state(&self) -> Result<RemoteServiceState> {
        let response = self
            .client
            .describe_services()
            .cluster(&self.cluster)
            .services(&self.spec.name)
            .send()
            .await
            .map_err(DeployError::from_ecs)?;

        Ok(RemoteServiceState::from_describe(
            response.services(),
            &self.spec.name,
        ))
    }

    /// Reconcile the service toward the target definition revision.
    ///
    /// Absent or inactive services are created with the full spec; active
    /// services are updated, preserving the running desired count when the
    /// spec does not pin one.
    pub async fn deploy(&mut self) -> Result<()> {
        let state = self.remote_state().await?;

        match state {
            RemoteServiceState::Active(summary) => {
                info!(
                    "updating service {} in {} ({}): {} -> {}",
                    self.spec.name,
                    self.cluster,
                    self.region,
                    summary.task_definition.as_deref().unwrap_or("-"),
                    self.target_definition
                );
                self.update().await?;
            }
            RemoteServiceState::Absent | RemoteServiceState::Inactive => {
                info!(
                    "creating service {} in {} ({}) -> {}",
                    self.spec.name, self.cluster, self.region, self.target_definition
                );
                self.create().await?;
            }
        }

        self.last_deployed_at = Some(Utc::now());
        Ok(())
    }

    async fn create(&self) -> Result<()> {
        let mut request = self
            .client
            .create_service()
            .cluster(&self.cluster)
            .service_name(&self.spec.name)
            .task_definition(&self.target_definition)
            .desired_count(self.spec.desired_count.unwrap_or(0))
            .deployment_configuration(self.spec.to_deployment_configuration())
            .set_placement_constraints(non_empty(
                self.spec
                    .placement_constraints
                    .iter()
                    .map(|c| c.to_service_constraint())
                    .collect(),
            ))
            .set_placement_strategy(non_empty(
                self.spec
                    .placement_strategy
                    .iter()
                    .map(|s| s.to_placement_strategy())
                    .collect(),
            ))
            .set_launch_type(self.spec.launch_type.as_deref().map(LaunchType::from))
            .set_health_check_grace_period_seconds(self.spec.health_check_grace_period_seconds);

        if !self.spec.load_balancers.is_empty() {
            request = request
                .role(&self.service_role)
                .set_load_balancers(Some(self.spec.to_load_balancers()));
        }

        request.send().await.map_err(DeployError::from_ecs)?;
        info!("created service {} in {}", self.spec.name, self.region);
        Ok(())
    }

    async fn update(&self) -> Result<()> {
        self.client
            .update_service()
            .cluster(&self.cluster)
            .service(&self.spec.name)
            .task_definition(&self.target_definition)
            .deployment_configuration(self.spec.to_deployment_configuration())
            .set_desired_count(self.spec.desired_count)
            .force_new_deployment(self.spec.force_new_deployment)
            .send()
            .await
            .map_err(DeployError::from_ecs)?;

        info!("updated service {} in {}", self.spec.name, self.region);
        Ok(())
    }

    /// Wait until every given service has stabilized.
    ///
    /// Services are grouped by (cluster, region) so one describe call per
    /// attempt covers all services sharing a cluster. Deployment events are
    /// tailed between attempts; exhausting the attempt budget for a group is
    /// a terminal failure.
    pub async fn wait_all_stable(
        services: &[&ServiceReconciler],
        options: WaiterOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for ((cluster, region), group) in group_by_cluster(services) {
            let client = group[0].client.clone();
            let names: Vec<String> = group.iter().map(|s| s.name().to_string()).collect();
            let mut tails: HashMap<String, EventTail> = group
                .iter()
                .map(|s| (s.name().to_string(), s.deployment_event_tail()))
                .collect();

            let mut attempts = 0;
            loop {
                waiter::ensure_active(cancel)?;
                info!("wait service stable [{}]", names.join(", "));

                let response = client
                    .describe_services()
                    .cluster(&cluster)
                    .set_services(Some(names.clone()))
                    .send()
                    .await
                    .map_err(DeployError::from_ecs)?;

                let described = response.services();
                let mut all_stable = described.len() == names.len() && !described.is_empty();
                for service in described {
                    let Some(name) = service.service_name() else {
                        continue;
                    };
                    if let Some(tail) = tails.get_mut(name) {
                        for (at, message) in tail.fresh(service.events()) {
                            info!("[{}] [{}] {}", name, at.to_rfc3339(), message);
                        }
                    }
                    if !is_stable(service) {
                        all_stable = false;
                    }
                }

                if all_stable {
                    info!("services stable [{}]", names.join(", "));
                    break;
                }

                attempts += 1;
                if attempts >= options.max_attempts {
                    return Err(DeployError::WaitTimeout {
                        what: format!("services stable in {cluster} ({region})"),
                        attempts,
                    });
                }
                waiter::sleep_between_attempts(&options, cancel).await?;
            }
        }
        Ok(())
    }

    /// Log a read-only status snapshot of the given services
    pub async fn display_status(services: &[&ServiceReconciler]) -> Result<()> {
        for ((cluster, _region), group) in group_by_cluster(services) {
            let client = group[0].client.clone();
            let names: Vec<String> = group.iter().map(|s| s.name().to_string()).collect();

            let response = client
                .describe_services()
                .cluster(&cluster)
                .set_services(Some(names))
                .send()
                .await
                .map_err(DeployError::from_ecs)?;

            for service in response.services() {
                let deploying = service.deployments().len() > 1;
                info!(
                    "{:<32} {:>3}/{:<3} {} [{}]",
                    service.service_name().unwrap_or("-"),
                    service.running_count(),
                    service.desired_count(),
                    service.task_definition().unwrap_or("-"),
                    if deploying { "deploying" } else { "steady" }
                );
            }
        }
        Ok(())
    }
}

fn group_by_cluster<'a>(
    services: &[&'a ServiceReconciler],
) -> BTreeMap<(String, String), Vec<&'a ServiceReconciler>> {
    let mut groups: BTreeMap<(String, String), Vec<&'a ServiceReconciler>> = BTreeMap::new();
    for service in services {
        groups
            .entry((service.cluster.clone(), service.region.clone()))
            .or_default()
            .push(service);
    }
    groups
}

fn non_empty<T>(values: Vec<T>) -> Option<Vec<T>> {
    if values.is_empty() { None } else { Some(values) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_ecs::primitives::DateTime as AwsDateTime;
    use aws_sdk_ecs::types::Deployment;

    fn active_service(name: &str, running: i32, desired: i32, deployments: usize) -> Service {
        let mut builder = Service::builder()
            .service_name(name)
            .status("ACTIVE")
            .task_definition("arn:td/web:5")
            .running_count(running)
            .desired_count(desired);
        for _ in 0..deployments {
            builder = builder.deployments(Deployment::builder().status("PRIMARY").build());
        }
        builder.build()
    }

    #[test]
    fn test_remote_state_absent() {
        assert_eq!(
            RemoteServiceState::from_describe(&[], "web"),
            RemoteServiceState::Absent
        );
    }

    #[test]
    fn test_remote_state_active_carries_summary() {
        let services = [active_service("web", 2, 2, 1)];
        match RemoteServiceState::from_describe(&services, "web") {
            RemoteServiceState::Active(summary) => {
                assert_eq!(summary.running_count, 2);
                assert_eq!(summary.desired_count, 2);
                assert_eq!(summary.task_definition.as_deref(), Some("arn:td/web:5"));
            }
            other => panic!("expected Active, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_state_inactive() {
        let services = [Service::builder()
            .service_name("web")
            .status("INACTIVE")
            .build()];
        assert_eq!(
            RemoteServiceState::from_describe(&services, "web"),
            RemoteServiceState::Inactive
        );
    }

    #[test]
    fn test_remote_state_ignores_other_names() {
        let services = [active_service("other", 1, 1, 1)];
        assert_eq!(
            RemoteServiceState::from_describe(&services, "web"),
            RemoteServiceState::Absent
        );
    }

    #[test]
    fn test_is_stable() {
        assert!(is_stable(&active_service("web", 2, 2, 1)));
        assert!(!is_stable(&active_service("web", 1, 2, 1)));
        assert!(!is_stable(&active_service("web", 2, 2, 2)));
    }

    fn event(id: &str, secs: i64, message: &str) -> ServiceEvent {
        ServiceEvent::builder()
            .id(id)
            .created_at(AwsDateTime::from_secs(secs))
            .message(message)
            .build()
    }

    #[test]
    fn test_event_tail_emits_each_event_once_in_order() {
        let mut tail = EventTail::from_beginning();

        // ECS reports newest first.
        let first_poll = [event("b", 20, "second"), event("a", 10, "first")];
        let emitted = tail.fresh(&first_poll);
        assert_eq!(
            emitted.iter().map(|(_, m)| m.as_str()).collect::<Vec<_>>(),
            vec!["first", "second"]
        );

        // Overlapping second poll: old events suppressed, new one emitted.
        let second_poll = [
            event("c", 30, "third"),
            event("b", 20, "second"),
            event("a", 10, "first"),
        ];
        let emitted = tail.fresh(&second_poll);
        assert_eq!(
            emitted.iter().map(|(_, m)| m.as_str()).collect::<Vec<_>>(),
            vec!["third"]
        );

        // Nothing new: nothing emitted.
        assert!(tail.fresh(&second_poll).is_empty());
    }

    #[test]
    fn test_event_tail_respects_start_watermark() {
        let start = DateTime::from_timestamp(15, 0).unwrap();
        let mut tail = EventTail::starting_at(start);

        let poll = [event("b", 20, "after"), event("a", 10, "before")];
        let emitted = tail.fresh(&poll);
        assert_eq!(
            emitted.iter().map(|(_, m)| m.as_str()).collect::<Vec<_>>(),
            vec!["after"]
        );
    }

    fn offline_client() -> Client {
        let config = aws_sdk_ecs::Config::builder()
            .behavior_version(aws_sdk_ecs::config::BehaviorVersion::latest())
            .region(aws_sdk_ecs::config::Region::new("us-east-1"))
            .build();
        Client::from_conf(config)
    }

    #[test]
    fn test_deployment_event_tail_covers_feed_before_first_deploy() {
        let spec: ServiceSpec = serde_json::from_str(r#"{"name": "web"}"#).unwrap();
        let mut reconciler = ServiceReconciler::new(
            spec,
            "default".to_string(),
            "us-east-1".to_string(),
            offline_client(),
            "ecsServiceRole",
        );
        let poll = [event("a", 10, "early")];

        // Never deployed this invocation: the whole feed is tailed.
        let mut tail = reconciler.deployment_event_tail();
        assert_eq!(tail.fresh(&poll).len(), 1);

        // After a deploy only events past the deploy time come through.
        reconciler.last_deployed_at = Some(DateTime::from_timestamp(15, 0).unwrap());
        let mut tail = reconciler.deployment_event_tail();
        assert!(tail.fresh(&poll).is_empty());
    }
}
