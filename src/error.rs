//! Error types for the deployer

use thiserror::Error;

/// Deployer result type
pub type Result<T> = std::result::Result<T, DeployError>;

/// Errors that can occur while orchestrating deployments
#[derive(Error, Debug)]
pub enum DeployError {
    /// ECS API error
    #[error("ECS error: {0}")]
    Ecs(#[from] aws_sdk_ecs::Error),

    /// CloudWatch Logs API error
    #[error("CloudWatch Logs error: {0}")]
    Logs(#[from] aws_sdk_cloudwatchlogs::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Service does not exist on the control plane
    #[error("Service {0} not found")]
    ServiceNotFound(String),

    /// No revision older than the current one is available to roll back to
    #[error("No rollback candidate for service {service} (current: {current})")]
    RollbackUnavailable {
        /// Service whose rollback was requested
        service: String,
        /// Task definition revision currently in service
        current: String,
    },

    /// One or more task instances failed to start
    #[error("Task start failed: {0}")]
    TaskStartFailed(String),

    /// A monitored container exited abnormally
    #[error("Container \"{container}\" in \"{task_definition}\" task has errors: {detail}")]
    ContainerFailed {
        /// Name of the failed container
        container: String,
        /// Task definition family the container belongs to
        task_definition: String,
        /// Stop reason or exit code
        detail: String,
    },

    /// A wait observed a state it cannot recover from
    #[error("Wait for {what} failed: {reason}")]
    WaitFailed {
        /// What was being waited on
        what: String,
        /// Terminal state observed
        reason: String,
    },

    /// A poll loop exhausted its attempt budget
    #[error("Timed out waiting for {what} after {attempts} attempts")]
    WaitTimeout {
        /// What was being waited on
        what: String,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Source revision could not be resolved
    #[error("Revision source error: {0}")]
    RevisionSource(String),

    /// Multiple independent operations failed within one fan-out
    #[error("{scope} had {} failure(s): {}", failures.len(), failures.join("; "))]
    Aggregate {
        /// Fan-out scope (region, cluster, ...)
        scope: String,
        /// Individual failure descriptions
        failures: Vec<String>,
    },

    /// Operation was cancelled from the outside
    #[error("Operation cancelled")]
    Cancelled,
}

impl DeployError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a revision source error
    pub fn revision_source(msg: impl Into<String>) -> Self {
        Self::RevisionSource(msg.into())
    }

    /// Convert from ECS SDK error
    pub fn from_ecs<E>(err: E) -> Self
    where
        aws_sdk_ecs::Error: From<E>,
    {
        Self::Ecs(aws_sdk_ecs::Error::from(err))
    }

    /// Convert from CloudWatch Logs SDK error
    pub fn from_logs<E>(err: E) -> Self
    where
        aws_sdk_cloudwatchlogs::Error: From<E>,
    {
        Self::Logs(aws_sdk_cloudwatchlogs::Error::from(err))
    }

    /// True when the error is an external cancellation request
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_failed_message_names_container_and_family() {
        let err = DeployError::ContainerFailed {
            container: "migrate".to_string(),
            task_definition: "web-batch".to_string(),
            detail: "Exit: 137".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("migrate"));
        assert!(msg.contains("web-batch"));
        assert!(msg.contains("137"));
    }

    #[test]
    fn test_aggregate_message_joins_failures() {
        let err = DeployError::Aggregate {
            scope: "region ap-northeast-1".to_string(),
            failures: vec!["svc-a: boom".to_string(), "svc-b: bust".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 failure(s)"));
        assert!(msg.contains("svc-a: boom; svc-b: bust"));
    }

    #[test]
    fn test_is_cancelled() {
        assert!(DeployError::Cancelled.is_cancelled());
        assert!(!DeployError::config("nope").is_cancelled());
    }
}
