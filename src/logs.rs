//! CloudWatch Logs tailing for one-off task runs
//!
//! Containers configured with the `awslogs` driver write to a log stream
//! named `{stream-prefix}/{container}/{task-id}`. After a monitored run
//! stops, the deployer fetches those streams and echoes every event into its
//! own log so failures are diagnosable without opening the AWS console. A
//! missing stream is downgraded to a warning since a container that died
//! before emitting output has no stream at all.

use crate::error::{DeployError, Result};
use crate::spec::TaskSpec;
use chrono::DateTime;
use tracing::{info, warn};

/// Log driver name whose streams this module knows how to locate
const AWSLOGS_DRIVER: &str = "awslogs";

/// Parsed `awslogs` driver options for one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwslogsOptions {
    /// Log group name
    pub group: String,

    /// Region the group lives in
    pub region: Option<String>,

    /// Stream prefix; tailing requires one to derive the stream name
    pub stream_prefix: Option<String>,
}

/// Extract `awslogs` options for a container, if that driver is configured
pub fn awslogs_options(task: &TaskSpec, container_name: &str) -> Option<AwslogsOptions> {
    let container = task.container(container_name)?;
    let log = container.log_configuration.as_ref()?;
    if log.log_driver != AWSLOGS_DRIVER {
        return None;
    }
    Some(AwslogsOptions {
        group: log.options.get("awslogs-group")?.clone(),
        region: log.options.get("awslogs-region").cloned(),
        stream_prefix: log.options.get("awslogs-stream-prefix").cloned(),
    })
}

/// Whether a container's logs can be tailed (awslogs with a stream prefix)
pub fn has_stream_prefix(task: &TaskSpec, container_name: &str) -> bool {
    awslogs_options(task, container_name)
        .map(|o| o.stream_prefix.is_some())
        .unwrap_or(false)
}

/// Derive the stream name for a container of one task instance
pub fn stream_name(prefix: &str, container_name: &str, task_arn: &str) -> String {
    let task_id = task_arn.rsplit('/').next().unwrap_or(task_arn);
    format!("{prefix}/{container_name}/{task_id}")
}

/// Tail every event of one container's log stream into the deployer's log
///
/// Follows the forward pagination token until it stops advancing. A stream
/// that does not exist yields a warning, not an error.
pub async fn tail_container_logs(
    client: &aws_sdk_cloudwatchlogs::Client,
    options: &AwslogsOptions,
    container_name: &str,
    task_arn: &str,
) -> Result<()> {
    let Some(prefix) = options.stream_prefix.as_deref() else {
        return Ok(());
    };
    let stream = stream_name(prefix, container_name, task_arn);

    let mut token: Option<String> = None;
    loop {
        let response = match client
            .get_log_events()
            .log_group_name(&options.group)
            .log_stream_name(&stream)
            .set_next_token(token.clone())
            .start_from_head(true)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_not_found_exception()) =>
            {
                warn!("{} does not exist.", stream);
                return Ok(());
            }
            Err(e) => return Err(DeployError::from_logs(e)),
        };

        for event in response.events() {
            let timestamp = event
                .timestamp()
                .and_then(DateTime::from_timestamp_millis)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string());
            info!(
                "[{}] [{}] {}",
                container_name,
                timestamp,
                event.message().unwrap_or("")
            );
        }

        // The forward token repeats once the end of the stream is reached.
        let next = response.next_forward_token().map(str::to_string);
        if next.is_none() || next == token {
            return Ok(());
        }
        token = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with_awslogs() -> TaskSpec {
        serde_json::from_str(
            r#"{
                "name": "web",
                "container_definitions": [
                    {
                        "name": "app",
                        "image": "example/app:latest",
                        "log_configuration": {
                            "log_driver": "awslogs",
                            "options": {
                                "awslogs-group": "web",
                                "awslogs-region": "ap-northeast-1",
                                "awslogs-stream-prefix": "web"
                            }
                        }
                    },
                    {
                        "name": "sidecar",
                        "image": "example/sidecar:latest",
                        "log_configuration": {"log_driver": "json-file"}
                    },
                    {
                        "name": "quiet",
                        "image": "example/quiet:latest"
                    }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_awslogs_options_found() {
        let task = task_with_awslogs();
        let options = awslogs_options(&task, "app").unwrap();
        assert_eq!(options.group, "web");
        assert_eq!(options.region.as_deref(), Some("ap-northeast-1"));
        assert_eq!(options.stream_prefix.as_deref(), Some("web"));
    }

    #[test]
    fn test_non_awslogs_driver_is_ignored() {
        let task = task_with_awslogs();
        assert!(awslogs_options(&task, "sidecar").is_none());
        assert!(awslogs_options(&task, "quiet").is_none());
        assert!(awslogs_options(&task, "missing").is_none());
    }

    #[test]
    fn test_has_stream_prefix() {
        let task = task_with_awslogs();
        assert!(has_stream_prefix(&task, "app"));
        assert!(!has_stream_prefix(&task, "sidecar"));
    }

    #[test]
    fn test_stream_name_uses_task_id() {
        let arn = "arn:aws:ecs:ap-northeast-1:123456789012:task/default/abcdef0123456789";
        assert_eq!(
            stream_name("web", "app", arn),
            "web/app/abcdef0123456789"
        );
    }

    #[test]
    fn test_stream_name_with_bare_task_id() {
        assert_eq!(stream_name("web", "app", "abcdef"), "web/app/abcdef");
    }
}
