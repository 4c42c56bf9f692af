//! Task definition registration, revision history and one-off runs
//!
//! One [`TaskDefinitionManager`] owns one family: it registers new revisions
//! from its [`TaskSpec`], queries the control plane's newest-first revision
//! history, computes rollback and cleanup windows over that history, and
//! drives one-off runs through start → running → stopped with log tailing
//! and exit-code inspection.
//!
//! Revision history is never persisted locally; it is re-queried on every
//! use. The history-slice computations ([`rollback_window`], [`newer_than`])
//! are pure functions over the externally sorted list: they rely on the
//! control plane's descending-sort contract and return empty when the
//! current revision does not appear in the queried window.

use crate::config;
use crate::error::{DeployError, Result};
use crate::logs;
use crate::spec::{ExecutionSpec, TaskSpec};
use crate::waiter::{self, WaiterOptions};
use aws_sdk_ecs::types::{Container, SortOrder, Task, TaskOverride};
use aws_sdk_ecs::Client;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// `started-by` tag applied to one-off task instances
const STARTED_BY: &str = "ecs-deploy";

/// The revisions a rollback may target: the `step` entries immediately older
/// than `current` in the newest-first history, newest first.
///
/// Empty when `current` is not present in the history; callers must treat
/// that as "rollback impossible" rather than guessing a target.
pub fn rollback_window<'a>(history: &'a [String], current: &str, step: usize) -> &'a [String] {
    match history.iter().position(|arn| arn == current) {
        Some(index) => {
            let start = (index + 1).min(history.len());
            let end = (index + 1 + step).min(history.len());
            &history[start..end]
        }
        None => &[],
    }
}

/// Every revision strictly newer than `current`, newest first.
///
/// Empty when `current` is not present; post-rollback cleanup treats that as
/// "nothing to clean", not an error.
pub fn newer_than<'a>(history: &'a [String], current: &str) -> &'a [String] {
    history
        .iter()
        .position(|arn| arn == current)
        .map(|index| &history[..index])
        .unwrap_or(&[])
}

/// Lifecycle state a one-off run is waited into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskLifecycle {
    Running,
    Stopped,
}

impl TaskLifecycle {
    fn status(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for TaskLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status())
    }
}

/// Owns one task definition family for the duration of an invocation
pub struct TaskDefinitionManager {
    spec: TaskSpec,
    region: String,
    client: Client,
    run_waiter: WaiterOptions,
    registered: bool,
    current_arn: Option<String>,
    revision_label: Option<String>,
}

impl TaskDefinitionManager {
    /// Create a manager for one family in one region
    pub fn new(spec: TaskSpec, region: String, client: Client, run_waiter: WaiterOptions) -> Self {
        Self {
            spec,
            region,
            client,
            run_waiter,
            registered: false,
            current_arn: None,
            revision_label: None,
        }
    }

    /// Family name revisions are registered under
    pub fn family(&self) -> &str {
        &self.spec.name
    }

    /// The spec this manager registers from
    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    /// Whether any one-off executions are attached to this family
    pub fn has_executions(&self) -> bool {
        self.spec.has_executions()
    }

    /// Whether a revision was registered during this invocation
    pub fn registered(&self) -> bool {
        self.registered
    }

    /// Tag subsequent registrations with a source revision
    pub fn set_revision_label(&mut self, revision: Option<String>) {
        self.revision_label = revision;
    }

    /// Register the spec as a new revision under the family name.
    ///
    /// The returned `family:revision` ARN becomes this manager's current
    /// definition for subsequent runs in the same invocation, and the
    /// invocation-scoped `registered` flag is set so the deploy path can
    /// skip redundant registration.
    pub async fn register(&mut self) -> Result<String> {
        let container_definitions = self
            .spec
            .to_container_definitions(self.revision_label.as_deref())?;

        let response = self
            .client
            .register_task_definition()
            .family(&self.spec.name)
            .set_container_definitions(Some(container_definitions))
            .set_volumes(non_empty(self.spec.to_volumes()))
            .set_task_role_arn(self.spec.task_role_arn.clone())
            .set_execution_role_arn(self.spec.execution_role_arn.clone())
            .set_network_mode(self.spec.to_network_mode())
            .set_cpu(self.spec.cpu.clone())
            .set_memory(self.spec.memory.clone())
            .set_placement_constraints(non_empty(self.spec.to_placement_constraints()))
            .set_requires_compatibilities(non_empty(self.spec.to_compatibilities()))
            .send()
            .await
            .map_err(DeployError::from_ecs)?;

        let arn = response
            .task_definition()
            .and_then(|td| td.task_definition_arn())
            .ok_or_else(|| {
                DeployError::config(format!(
                    "no task definition ARN in register response for {}",
                    self.spec.name
                ))
            })?
            .to_string();

        info!("registered task definition {} in {}", arn, self.region);
        self.registered = true;
        self.current_arn = Some(arn.clone());
        Ok(arn)
    }

    /// Known revision ARNs for the family, newest first.
    ///
    /// History queries are best-effort: any failure degrades to an empty
    /// list so one family's missing history never aborts another's
    /// deploy or rollback.
    pub async fn recent_revision_arns(&self) -> Vec<String> {
        let result = self
            .client
            .list_task_definitions()
            .family_prefix(&self.spec.name)
            .sort(SortOrder::Desc)
            .send()
            .await;

        match result {
            Ok(response) => response.task_definition_arns().to_vec(),
            Err(e) => {
                warn!(
                    "failed to list task definitions for {}: {}",
                    self.spec.name,
                    DeployError::from_ecs(e)
                );
                Vec::new()
            }
        }
    }

    /// Rollback candidates for `current`, see [`rollback_window`]
    pub async fn rollback_range(&self, current: &str, step: usize) -> Vec<String> {
        let history = self.recent_revision_arns().await;
        rollback_window(&history, current, step).to_vec()
    }

    /// Revisions newer than `current`, see [`newer_than`]
    pub async fn newer_revisions(&self, current: &str) -> Vec<String> {
        let history = self.recent_revision_arns().await;
        newer_than(&history, current).to_vec()
    }

    /// Remove one revision by ARN
    pub async fn deregister(&self, arn: &str) -> Result<()> {
        self.client
            .deregister_task_definition()
            .task_definition(arn)
            .send()
            .await
            .map_err(DeployError::from_ecs)?;

        info!("deregistered task definition {} in {}", arn, self.region);
        Ok(())
    }

    /// Start one or more task instances from the current definition.
    ///
    /// When the execution names wait-for-stop containers the call blocks:
    /// a failed wait for RUNNING is tolerated (the task may already have
    /// stopped), a failed wait for STOPPED is remembered and only re-raised
    /// after logs are tailed and exit codes inspected, so diagnostics are
    /// never lost to an early abort.
    pub async fn run(&self, execution: &ExecutionSpec, cancel: &CancellationToken) -> Result<()> {
        let cluster = execution.cluster.as_deref().ok_or_else(|| {
            DeployError::config(format!(
                "execution of {} has no cluster and no default cluster is configured",
                self.spec.name
            ))
        })?;
        let reference = self.current_arn.as_deref().unwrap_or(&self.spec.name);

        let response = self
            .client
            .run_task()
            .cluster(cluster)
            .task_definition(reference)
            .overrides(
                TaskOverride::builder()
                    .set_container_overrides(non_empty(execution.to_container_overrides()))
                    .build(),
            )
            .count(execution.count)
            .started_by(STARTED_BY)
            .send()
            .await
            .map_err(DeployError::from_ecs)?;

        let start_failures: Vec<String> = response
            .failures()
            .iter()
            .map(|f| {
                format!(
                    "{}: {}",
                    f.arn().unwrap_or("unknown"),
                    f.reason().unwrap_or("unknown")
                )
            })
            .collect();
        if !start_failures.is_empty() {
            return Err(DeployError::TaskStartFailed(start_failures.join("; ")));
        }

        if !execution.monitored() {
            info!(
                "ran task {} in {} ({} instance(s))",
                reference, self.region, execution.count
            );
            return Ok(());
        }

        let task_arns: Vec<String> = response
            .tasks()
            .iter()
            .filter_map(|t| t.task_arn().map(str::to_string))
            .collect();
        let options = execution.waiter.unwrap_or(self.run_waiter);

        // The task may transition straight to STOPPED before the poller
        // ever observes RUNNING; that is not a failure of the run.
        if let Err(e) = self
            .wait_tasks(cluster, &task_arns, TaskLifecycle::Running, options, cancel)
            .await
        {
            if e.is_cancelled() {
                return Err(e);
            }
            warn!("wait for running tasks tolerated a failure: {}", e);
        }

        let stop_failure = match self
            .wait_tasks(cluster, &task_arns, TaskLifecycle::Stopped, options, cancel)
            .await
        {
            Ok(()) => None,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => Some(e),
        };

        let described = self
            .client
            .describe_tasks()
            .cluster(cluster)
            .set_tasks(Some(task_arns))
            .send()
            .await
            .map_err(DeployError::from_ecs)?;

        // Diagnostics first: tail every tailable container's stream.
        for task in described.tasks() {
            for container in task.containers() {
                let Some(name) = container.name() else { continue };
                if !logs::has_stream_prefix(&self.spec, name) {
                    continue;
                }
                if let Err(e) = self.tail_logs(container).await {
                    warn!("failed to tail logs for {}: {}", name, e);
                }
            }
        }

        inspect_stopped_tasks(
            described.tasks(),
            &execution.wait_for_stop,
            &self.spec.name,
            stop_failure,
        )?;

        info!(
            "ran task {} in {} ({} instance(s))",
            reference, self.region, execution.count
        );
        Ok(())
    }

    async fn wait_tasks(
        &self,
        cluster: &str,
        task_arns: &[String],
        target: TaskLifecycle,
        options: WaiterOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut attempts = 0;
        loop {
            waiter::ensure_active(cancel)?;

            let response = self
                .client
                .describe_tasks()
                .cluster(cluster)
                .set_tasks(Some(task_arns.to_vec()))
                .send()
                .await
                .map_err(DeployError::from_ecs)?;

            let statuses: Vec<&str> = response
                .tasks()
                .iter()
                .filter_map(|t| t.last_status())
                .collect();

            match target {
                TaskLifecycle::Running => {
                    if !statuses.is_empty() && statuses.iter().all(|s| *s == "RUNNING") {
                        return Ok(());
                    }
                    if statuses.iter().any(|s| *s == "STOPPED") {
                        return Err(DeployError::WaitFailed {
                            what: format!("tasks RUNNING in {cluster}"),
                            reason: "a task stopped before reaching RUNNING".to_string(),
                        });
                    }
                }
                TaskLifecycle::Stopped => {
                    if !statuses.is_empty() && statuses.iter().all(|s| *s == "STOPPED") {
                        return Ok(());
                    }
                }
            }

            attempts += 1;
            if attempts >= options.max_attempts {
                return Err(DeployError::WaitTimeout {
                    what: format!("tasks {target} in {cluster}"),
                    attempts,
                });
            }
            waiter::sleep_between_attempts(&options, cancel).await?;
        }
    }

    async fn tail_logs(&self, container: &Container) -> Result<()> {
        let (Some(name), Some(task_arn)) = (container.name(), container.task_arn()) else {
            return Ok(());
        };
        let Some(options) = logs::awslogs_options(&self.spec, name) else {
            return Ok(());
        };
        let region = options.region.clone().unwrap_or_else(|| self.region.clone());
        let client = config::create_logs_client(&region).await;
        logs::tail_container_logs(&client, &options, name, task_arn).await
    }
}

/// Conclude a monitored run after its tasks stopped and their logs were
/// tailed: inspect exit codes of the monitored containers, then re-raise a
/// remembered stop-wait failure. A container failure takes precedence over
/// the remembered failure.
fn inspect_stopped_tasks(
    tasks: &[Task],
    wait_for_stop: &[String],
    family: &str,
    stop_failure: Option<DeployError>,
) -> Result<()> {
    for task in tasks {
        for container in task.containers() {
            let Some(name) = container.name() else { continue };
            if !wait_for_stop.iter().any(|w| w == name) {
                continue;
            }
            check_exit_code(container, name, family)?;
        }
    }

    if let Some(e) = stop_failure {
        return Err(e);
    }
    Ok(())
}

/// A monitored container must exit zero; anything else is a run failure
/// carrying the container name, family and reason or exit code.
fn check_exit_code(container: &Container, name: &str, family: &str) -> Result<()> {
    if container.exit_code() == Some(0) {
        return Ok(());
    }
    let detail = match container.reason() {
        Some(reason) => reason.to_string(),
        None => match container.exit_code() {
            Some(code) => format!("Exit: {code}"),
            None => "Exit: none".to_string(),
        },
    };
    Err(DeployError::ContainerFailed {
        container: name.to_string(),
        task_definition: family.to_string(),
        detail,
    })
}

fn non_empty<T>(values: Vec<T>) -> Option<Vec<T>> {
    if values.is_empty() { None } else { Some(values) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> Vec<String> {
        ["r5", "r4", "r3", "r2", "r1"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_rollback_window_slices_older_revisions() {
        let h = history();
        assert_eq!(rollback_window(&h, "r5", 2), &["r4", "r3"]);
        assert_eq!(rollback_window(&h, "r3", 2), &["r2", "r1"]);
        assert_eq!(rollback_window(&h, "r3", 1), &["r2"]);
    }

    #[test]
    fn test_rollback_window_clips_to_history_length() {
        let h = history();
        assert_eq!(rollback_window(&h, "r2", 5), &["r1"]);
        assert!(rollback_window(&h, "r1", 3).is_empty());
    }

    #[test]
    fn test_rollback_window_empty_when_current_absent() {
        let h = history();
        assert!(rollback_window(&h, "r9", 2).is_empty());
        assert!(rollback_window(&[], "r1", 2).is_empty());
    }

    #[test]
    fn test_newer_than_slices_before_current() {
        let h = history();
        assert_eq!(newer_than(&h, "r3"), &["r5", "r4"]);
        assert!(newer_than(&h, "r5").is_empty());
        assert_eq!(newer_than(&h, "r1"), &["r5", "r4", "r3", "r2"]);
    }

    #[test]
    fn test_newer_than_empty_when_current_absent() {
        let h = history();
        assert!(newer_than(&h, "r9").is_empty());
    }

    #[test]
    fn test_rollback_target_walks_back_exactly_step_revisions() {
        // history r5..r1, current r3, step 2 => window [r2, r1], oldest is r1
        let h = history();
        let window = rollback_window(&h, "r3", 2);
        assert_eq!(window.last().map(String::as_str), Some("r1"));
    }

    #[test]
    fn test_check_exit_code_zero_passes() {
        let container = Container::builder().name("app").exit_code(0).build();
        assert!(check_exit_code(&container, "app", "web").is_ok());
    }

    #[test]
    fn test_check_exit_code_nonzero_fails_with_context() {
        let container = Container::builder().name("app").exit_code(137).build();
        let err = check_exit_code(&container, "app", "web").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("app"));
        assert!(msg.contains("web"));
        assert!(msg.contains("Exit: 137"));
    }

    #[test]
    fn test_check_exit_code_missing_fails() {
        let container = Container::builder().name("app").build();
        assert!(check_exit_code(&container, "app", "web").is_err());
    }

    #[test]
    fn test_check_exit_code_prefers_reason() {
        let container = Container::builder()
            .name("app")
            .reason("OutOfMemoryError: Container killed")
            .build();
        let err = check_exit_code(&container, "app", "web").unwrap_err();
        assert!(err.to_string().contains("OutOfMemoryError"));
    }

    fn stopped_task(name: &str, exit_code: Option<i32>) -> Task {
        let mut container = Container::builder().name(name);
        if let Some(code) = exit_code {
            container = container.exit_code(code);
        }
        Task::builder().containers(container.build()).build()
    }

    fn stop_wait_timeout() -> DeployError {
        DeployError::WaitTimeout {
            what: "tasks STOPPED in default".to_string(),
            attempts: 100,
        }
    }

    #[test]
    fn test_inspect_stopped_tasks_clean_run_passes() {
        let tasks = [stopped_task("app", Some(0))];
        assert!(inspect_stopped_tasks(&tasks, &["app".to_string()], "web", None).is_ok());
    }

    #[test]
    fn test_stop_wait_failure_surfaces_after_exit_codes_pass() {
        let tasks = [stopped_task("app", Some(0))];
        let err = inspect_stopped_tasks(
            &tasks,
            &["app".to_string()],
            "web",
            Some(stop_wait_timeout()),
        )
        .unwrap_err();
        assert!(matches!(err, DeployError::WaitTimeout { .. }));
    }

    #[test]
    fn test_container_failure_preempts_stop_wait_failure() {
        let tasks = [stopped_task("app", Some(137))];
        let err = inspect_stopped_tasks(
            &tasks,
            &["app".to_string()],
            "web",
            Some(stop_wait_timeout()),
        )
        .unwrap_err();
        assert!(matches!(err, DeployError::ContainerFailed { .. }));
    }

    #[test]
    fn test_unmonitored_containers_are_not_inspected() {
        // Sidecar never exits zero but is not in the wait-for-stop set.
        let tasks = [stopped_task("sidecar", Some(1)), stopped_task("app", Some(0))];
        assert!(inspect_stopped_tasks(&tasks, &["app".to_string()], "web", None).is_ok());
    }

    #[test]
    fn test_task_lifecycle_display() {
        assert_eq!(TaskLifecycle::Running.to_string(), "RUNNING");
        assert_eq!(TaskLifecycle::Stopped.to_string(), "STOPPED");
    }
}
