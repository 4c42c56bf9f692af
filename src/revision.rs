//! Source revision resolution
//!
//! Deploys are tagged with the upstream commit hash of the configured
//! repository branch, resolved with `git ls-remote`. The hash is attached as
//! a docker label on registered task definitions and echoed into the audit
//! log; nothing in the core interprets it.

use crate::error::{DeployError, Result};
use std::process::Command;

/// Resolve the current upstream commit hash of a branch
pub fn resolve_revision(url: &str, branch: &str) -> Result<String> {
    let output = Command::new("git")
        .args(["ls-remote", url, branch])
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DeployError::revision_source(format!(
            "git ls-remote {url} {branch} failed: {}",
            stderr.trim()
        )));
    }

    parse_ls_remote(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
        DeployError::revision_source(format!("branch {branch} not found in {url}"))
    })
}

/// Extract the commit hash from `git ls-remote` output
fn parse_ls_remote(output: &str) -> Option<String> {
    output
        .lines()
        .next()?
        .split_whitespace()
        .next()
        .filter(|hash| !hash.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ls_remote() {
        let output = "2f7c3a9e1b8d5f0a6c4e2d1b9a8f7e6d5c4b3a21\trefs/heads/main\n";
        assert_eq!(
            parse_ls_remote(output).as_deref(),
            Some("2f7c3a9e1b8d5f0a6c4e2d1b9a8f7e6d5c4b3a21")
        );
    }

    #[test]
    fn test_parse_ls_remote_empty() {
        assert_eq!(parse_ls_remote(""), None);
        assert_eq!(parse_ls_remote("\n"), None);
    }

    #[test]
    fn test_resolve_revision_bad_remote_fails() {
        let result = resolve_revision("/nonexistent/repo", "main");
        assert!(result.is_err());
    }
}
