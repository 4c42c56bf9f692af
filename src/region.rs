//! Multi-region fan-out
//!
//! The [`MultiRegionCoordinator`] owns one [`RegionStrategy`] per configured
//! region, created lazily and cached for the invocation. Every top-level
//! operation fans out to all regions in order; a failing region is recorded
//! and its siblings still run, but no cross-region ordering or atomicity is
//! provided — a partial failure in one region never rolls back another.

use crate::config::DeployConfig;
use crate::error::{DeployError, Result};
use crate::revision;
use crate::strategy::RegionStrategy;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Fans out every top-level operation to all configured regions
pub struct MultiRegionCoordinator {
    config: DeployConfig,
    regions: Vec<String>,
    strategies: HashMap<String, RegionStrategy>,
    revision_label: Option<String>,
}

impl MultiRegionCoordinator {
    /// Create the coordinator; the region set defaults to the single default
    /// region when none is configured.
    pub fn new(config: DeployConfig) -> Result<Self> {
        let regions = config.resolved_regions()?;
        Ok(Self {
            config,
            regions,
            strategies: HashMap::new(),
            revision_label: None,
        })
    }

    /// Regions this coordinator fans out to
    pub fn regions(&self) -> &[String] {
        &self.regions
    }

    /// Resolve the source revision once and push it to every region, so
    /// registrations are tagged with the upstream commit hash.
    pub fn set_revision(&mut self) -> Result<()> {
        let Some(repository) = self.config.repository.clone() else {
            return Ok(());
        };
        let commit = revision::resolve_revision(&repository.url, &repository.branch)?;
        info!("deploy revision {} ({})", commit, repository.branch);
        for strategy in self.strategies.values_mut() {
            strategy.set_revision_label(Some(commit.clone()));
        }
        self.revision_label = Some(commit);
        Ok(())
    }

    async fn strategy_for(&mut self, region: &str) -> Result<&mut RegionStrategy> {
        if !self.strategies.contains_key(region) {
            let mut strategy = RegionStrategy::new(&self.config, region.to_string()).await?;
            strategy.set_revision_label(self.revision_label.clone());
            self.strategies.insert(region.to_string(), strategy);
        }
        Ok(self
            .strategies
            .get_mut(region)
            .expect("strategy inserted above"))
    }

    /// Deploy every region's services and wait for stabilization
    pub async fn deploy(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut failures = Vec::new();
        for region in self.regions.clone() {
            let result = match self.strategy_for(&region).await {
                Ok(strategy) => strategy.deploy(cancel).await,
                Err(e) => Err(e),
            };
            record_failure("deploy", &region, result, &mut failures)?;
        }
        aggregate("deploy", failures)
    }

    /// Roll every region's services back `step` revisions
    pub async fn rollback(&mut self, step: usize, cancel: &CancellationToken) -> Result<()> {
        let mut failures = Vec::new();
        for region in self.regions.clone() {
            let result = match self.strategy_for(&region).await {
                Ok(strategy) => strategy.rollback(step, cancel).await,
                Err(e) => Err(e),
            };
            record_failure("rollback", &region, result, &mut failures)?;
        }
        aggregate("rollback", failures)
    }

    /// Run every region's one-off executions
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut failures = Vec::new();
        for region in self.regions.clone() {
            let result = match self.strategy_for(&region).await {
                Ok(strategy) => strategy.run(cancel).await,
                Err(e) => Err(e),
            };
            record_failure("run", &region, result, &mut failures)?;
        }
        aggregate("run", failures)
    }

    /// Freshly register definitions with executions in every region
    pub async fn register_for_run(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        for region in self.regions.clone() {
            let result = match self.strategy_for(&region).await {
                Ok(strategy) => strategy.register_for_run().await,
                Err(e) => Err(e),
            };
            record_failure("register for run", &region, result, &mut failures)?;
        }
        aggregate("register for run", failures)
    }

    /// Register not-yet-registered definitions in every region
    pub async fn register_for_deploy(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        for region in self.regions.clone() {
            let result = match self.strategy_for(&region).await {
                Ok(strategy) => strategy.register_for_deploy().await,
                Err(e) => Err(e),
            };
            record_failure("register for deploy", &region, result, &mut failures)?;
        }
        aggregate("register for deploy", failures)
    }

    /// Log a read-only status snapshot of every region's services
    pub async fn display_status(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        for region in self.regions.clone() {
            let result = match self.strategy_for(&region).await {
                Ok(strategy) => strategy.display_status().await,
                Err(e) => Err(e),
            };
            record_failure("status", &region, result, &mut failures)?;
        }
        aggregate("status", failures)
    }
}

/// Record a region's failure and keep going; cancellation stops the fan-out.
fn record_failure(
    operation: &str,
    region: &str,
    result: Result<()>,
    failures: &mut Vec<String>,
) -> Result<()> {
    if let Err(e) = result {
        if e.is_cancelled() {
            return Err(e);
        }
        error!("{} failed in region {}: {}", operation, region, e);
        failures.push(format!("{region}: {e}"));
    }
    Ok(())
}

fn aggregate(operation: &str, failures: Vec<String>) -> Result<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(DeployError::Aggregate {
            scope: operation.to_string(),
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regions_default_to_single_default_region() {
        let config: DeployConfig =
            serde_json::from_str(r#"{"default_region": "us-west-2"}"#).unwrap();
        let coordinator = MultiRegionCoordinator::new(config).unwrap();
        assert_eq!(coordinator.regions(), ["us-west-2".to_string()]);
    }

    #[test]
    fn test_explicit_region_list_wins() {
        let config: DeployConfig = serde_json::from_str(
            r#"{"regions": ["ap-northeast-1", "us-east-1"], "default_region": "us-west-2"}"#,
        )
        .unwrap();
        let coordinator = MultiRegionCoordinator::new(config).unwrap();
        assert_eq!(
            coordinator.regions(),
            ["ap-northeast-1".to_string(), "us-east-1".to_string()]
        );
    }

    #[test]
    fn test_record_failure_collects_and_continues() {
        let mut failures = Vec::new();
        let result = record_failure(
            "deploy",
            "us-east-1",
            Err(DeployError::config("boom")),
            &mut failures,
        );
        assert!(result.is_ok());
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("us-east-1"));
    }

    #[test]
    fn test_record_failure_propagates_cancellation() {
        let mut failures = Vec::new();
        let result = record_failure(
            "deploy",
            "us-east-1",
            Err(DeployError::Cancelled),
            &mut failures,
        );
        assert!(matches!(result, Err(DeployError::Cancelled)));
        assert!(failures.is_empty());
    }
}
