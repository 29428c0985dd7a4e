//! Dependency installer: the single entry point that turns a declared
//! dependency into a usable one, without ever installing ahead of approval
//! or behind a failed integrity check.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::LoaderConfig;
use crate::deps::integrity::{verify_declared, PublishedIntegrity};
use crate::deps::state::DependencyState;
use crate::error::{LoaderError, LoaderResult};
use crate::permissions::{
    api_key_approval, check_permission, check_required_keys, PermissionDecision, PermissionPolicy,
};
use crate::types::{ApprovalRequired, InstalledDep, McpDependency};

/// Published-metadata lookup against the public package registry.
#[async_trait]
pub trait PackageRegistry: Send + Sync {
    async fn published_integrity(
        &self,
        name: &str,
        version: &str,
    ) -> LoaderResult<PublishedIntegrity>;
}

/// Registry client backed by the npm-style `GET {base}/{name}/{version}` API.
pub struct NpmPackageRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl NpmPackageRegistry {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PackageRegistry for NpmPackageRegistry {
    async fn published_integrity(
        &self,
        name: &str,
        version: &str,
    ) -> LoaderResult<PublishedIntegrity> {
        let url = format!("{}/{}/{}", self.base_url, name, version);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(LoaderError::InstallFailure(format!(
                "package registry returned {} for {}@{}",
                resp.status(),
                name,
                version
            )));
        }
        let body: serde_json::Value = resp.json().await?;
        let dist = body.get("dist").cloned().unwrap_or_default();
        Ok(PublishedIntegrity {
            integrity: dist
                .get("integrity")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            shasum: dist
                .get("shasum")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        })
    }
}

/// Outcome of `ensure_dependency`: either the dependency is ready, or the
/// caller must surface an approval result.
#[derive(Debug, Clone)]
pub enum EnsureOutcome {
    Satisfied,
    Approval(ApprovalRequired),
}

pub struct DependencyInstaller {
    state: Arc<DependencyState>,
    registry: Arc<dyn PackageRegistry>,
    policy: PermissionPolicy,
    /// Shared with the loader so session grants apply to install gates too.
    session_approvals: Arc<RwLock<HashSet<String>>>,
    install_timeout: Duration,
    trusted_mode: bool,
}

impl DependencyInstaller {
    pub fn new(
        config: &LoaderConfig,
        state: Arc<DependencyState>,
        registry: Arc<dyn PackageRegistry>,
        session_approvals: Arc<RwLock<HashSet<String>>>,
    ) -> Self {
        Self {
            state,
            registry,
            policy: config.policy.clone(),
            session_approvals,
            install_timeout: Duration::from_millis(config.install_timeout_ms),
            trusted_mode: config.trusted_mode,
        }
    }

    /// Ensure `dep` is ready for use by `tool_id`.
    ///
    /// Required environment variables are re-validated on every call, before
    /// any permission check: installation status alone never proves runtime
    /// readiness. No package is installed without either an allow-listed
    /// permission or `force_install` from an explicit approval continuation.
    pub async fn ensure_dependency(
        &self,
        dep: &McpDependency,
        force_install: bool,
        tool_id: &str,
    ) -> LoaderResult<EnsureOutcome> {
        let key_check = check_required_keys(&dep.env_vars);
        if !key_check.all_present() {
            debug!(dependency = %dep.name, missing = ?key_check.missing, "required keys missing");
            return Ok(EnsureOutcome::Approval(api_key_approval(
                &key_check,
                &dep.name,
            )));
        }

        if self.state.is_satisfied(dep).await {
            return Ok(EnsureOutcome::Satisfied);
        }

        let install_id = format!("{}:*", dep.name);
        let decision = if self.session_approvals.read().await.contains(&install_id) {
            PermissionDecision::Allowed
        } else {
            check_permission(&install_id, &self.policy)
        };
        match decision {
            PermissionDecision::Denied => {
                return Err(LoaderError::PermissionDenied(format!(
                    "installation of {} (for {}) is denied by policy",
                    dep.name, tool_id
                )));
            }
            PermissionDecision::Ask if !force_install => {
                let needs_installation = !self.state.is_satisfied(dep).await;
                return Ok(EnsureOutcome::Approval(ApprovalRequired::dependency_approval(
                    Some(dep.clone()),
                    format!(
                        "{} wants to install {}@{} via `{}`",
                        tool_id, dep.name, dep.version, dep.install_command
                    ),
                    needs_installation,
                )));
            }
            _ => {}
        }

        // Binary-distribution dependencies skip package installation entirely;
        // the subprocess manager fetches the binary lazily. They still had to
        // pass the permission gate above.
        if dep.is_binary_distribution() {
            debug!(dependency = %dep.name, "binary distribution, skipping install bookkeeping");
            return Ok(EnsureOutcome::Satisfied);
        }

        // Verify before install. Installing first and verifying after would
        // admit a window where untrusted code has already run.
        let published = self
            .registry
            .published_integrity(&dep.name, &dep.version)
            .await?;
        let verified = verify_declared(&dep.name, &dep.digest, &published, self.trusted_mode)?;

        self.run_install_command(dep).await?;

        self.state
            .record(InstalledDep {
                name: dep.name.clone(),
                version: dep.version.clone(),
                digest: verified,
                installed_at: Utc::now(),
                install_command: dep.install_command.clone(),
            })
            .await?;
        info!(dependency = %dep.name, version = %dep.version, "installed and recorded");
        Ok(EnsureOutcome::Satisfied)
    }

    async fn run_install_command(&self, dep: &McpDependency) -> LoaderResult<()> {
        let parts: Vec<&str> = dep.install_command.split_whitespace().collect();
        let Some((program, args)) = parts.split_first() else {
            return Err(LoaderError::InstallFailure(format!(
                "{}: empty install command",
                dep.name
            )));
        };

        info!(dependency = %dep.name, command = %dep.install_command, "running install command");
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(self.install_timeout, cmd.output())
            .await
            .map_err(|_| {
                LoaderError::Timeout(format!(
                    "install of {} exceeded {:?}",
                    dep.name, self.install_timeout
                ))
            })?
            .map_err(|e| {
                LoaderError::InstallFailure(format!("{}: failed to execute: {}", dep.name, e))
            })?;

        if output.status.success() {
            debug!(dependency = %dep.name, "install command succeeded");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(dependency = %dep.name, "install command failed: {}", stderr);
            Err(LoaderError::InstallFailure(format!(
                "{}: install command exited with {}: {}",
                dep.name, output.status, stderr
            )))
        }
    }
}
