//! Poll-loop tuning and cancellation
//!
//! Every blocking wait against the control plane is a hand-rolled poll loop:
//! describe, check, sleep, repeat. [`WaiterOptions`] carries the delay between
//! attempts and the attempt budget; exhausting the budget is a
//! [`DeployError::WaitTimeout`], never a silent return. A
//! [`CancellationToken`] is checked between attempts so an external stop
//! request aborts the loop cleanly instead of only at process exit.

use crate::error::{DeployError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default delay between service-stability poll attempts (seconds)
const SERVICE_STABLE_DELAY_SECS: u64 = 15;

/// Default attempt budget for service-stability waits
const SERVICE_STABLE_MAX_ATTEMPTS: u32 = 40;

/// Default delay between task-state poll attempts (seconds)
const TASK_STATE_DELAY_SECS: u64 = 6;

/// Default attempt budget for task-state waits
const TASK_STATE_MAX_ATTEMPTS: u32 = 100;

/// Tuning for one blocking wait: delay between attempts and attempt budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaiterOptions {
    /// Seconds to sleep between poll attempts
    pub delay_secs: u64,

    /// Attempts before the wait is declared a timeout
    pub max_attempts: u32,
}

impl WaiterOptions {
    /// Create waiter options
    pub const fn new(delay_secs: u64, max_attempts: u32) -> Self {
        Self {
            delay_secs,
            max_attempts,
        }
    }

    /// Defaults for waiting on a service deployment to stabilize
    pub const fn service_stable() -> Self {
        Self::new(SERVICE_STABLE_DELAY_SECS, SERVICE_STABLE_MAX_ATTEMPTS)
    }

    /// Defaults for waiting on a one-off task to reach a lifecycle state
    pub const fn task_state() -> Self {
        Self::new(TASK_STATE_DELAY_SECS, TASK_STATE_MAX_ATTEMPTS)
    }

    /// Delay between attempts as a [`Duration`]
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Fail fast if cancellation was requested
pub fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(DeployError::Cancelled);
    }
    Ok(())
}

/// Sleep between poll attempts, aborting early on cancellation
pub async fn sleep_between_attempts(
    options: &WaiterOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(DeployError::Cancelled),
        _ = tokio::time::sleep(options.delay()) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tunings() {
        let stable = WaiterOptions::service_stable();
        assert_eq!(stable.delay_secs, 15);
        assert_eq!(stable.max_attempts, 40);

        let task = WaiterOptions::task_state();
        assert_eq!(task.delay_secs, 6);
        assert_eq!(task.max_attempts, 100);
    }

    #[test]
    fn test_ensure_active() {
        let cancel = CancellationToken::new();
        assert!(ensure_active(&cancel).is_ok());

        cancel.cancel();
        assert!(matches!(
            ensure_active(&cancel),
            Err(DeployError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_sleep_aborts_on_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        // A long delay must return immediately once the token is cancelled.
        let options = WaiterOptions::new(3600, 1);
        let result = sleep_between_attempts(&options, &cancel).await;
        assert!(matches!(result, Err(DeployError::Cancelled)));
    }

    #[tokio::test]
    async fn test_sleep_completes_without_cancellation() {
        let cancel = CancellationToken::new();
        let options = WaiterOptions::new(0, 1);
        assert!(sleep_between_attempts(&options, &cancel).await.is_ok());
    }
}
