//! Core data model: capability metadata, declared dependencies, installed
//! records, and the approval-required result shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::LoaderError;

/// Marker install command for dependencies shipped as pre-built binaries.
/// These skip package installation bookkeeping; the subprocess manager
/// resolves the binary lazily through the binary resolver.
pub const BINARY_DISTRIBUTION: &str = "binary";

/// How a capability executes once loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionKind {
    /// Fetched code run in an isolated sandbox with no ambient permissions.
    SandboxedCode,
    /// Delegated to a long-lived local tool-server subprocess.
    Subprocess,
    /// Forwarded over HTTP to a remote target.
    NetworkForward,
}

/// Routing hint used by the nested-call directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingHint {
    Local,
    Remote,
}

/// Install instructions attached to capability metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variable names that must be present before running.
    #[serde(default)]
    pub env_vars: Vec<String>,
}

/// Kind of a declared external package dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Subprocess,
}

/// A declared external package a capability needs before it can run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpDependency {
    pub name: String,
    pub kind: DependencyKind,
    /// Install command string, or [`BINARY_DISTRIBUTION`] for binary channels.
    pub install_command: String,
    /// Pinned version. Never a range.
    pub version: String,
    /// Expected integrity digest; format selected by its string prefix.
    pub digest: String,
    /// Environment variable names required at runtime.
    #[serde(default)]
    pub env_vars: Vec<String>,
    /// Explicit command override for launching the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Dependency-specific environment overrides merged over the process env.
    #[serde(default)]
    pub env_overrides: HashMap<String, String>,
}

impl McpDependency {
    pub fn is_binary_distribution(&self) -> bool {
        self.install_command == BINARY_DISTRIBUTION
    }
}

/// Describes one loadable unit, as fetched from the metadata registry.
///
/// Immutable once fetched; a cache invalidation triggers a fresh fetch that
/// supersedes the old value wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityMetadata {
    /// Fully-qualified capability name.
    pub name: String,
    pub kind: ExecutionKind,
    /// Where to fetch raw code from. Required when `kind` is sandboxed code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_url: Option<String>,
    /// Tool names this capability exposes (unprefixed action names).
    #[serde(default)]
    pub tools: Vec<String>,
    pub routing: RoutingHint,
    #[serde(default)]
    pub dependencies: Vec<McpDependency>,
    /// Content digest of the fetched code, when the registry publishes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<InstallSpec>,
    /// POST target for network-forward capabilities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_url: Option<String>,
    /// Header templates for network-forward; `${VAR}` resolved fail-closed.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// One entry of Dependency State: a package that was installed and verified.
///
/// Never mutated in place; a newer install overwrites the record atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledDep {
    pub name: String,
    pub version: String,
    /// The digest verified against the package registry, not the declared one.
    pub digest: String,
    pub installed_at: DateTime<Utc>,
    pub install_command: String,
}

/// Approval-required result shapes, surfaced instead of executing anything.
///
/// These are not errors: the caller must either re-invoke with an approval
/// continuation or treat the result as a rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ApprovalRequired {
    /// A dependency (or a tool gated by `ask` policy) needs user consent.
    DependencyApproval {
        workflow_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dependency: Option<McpDependency>,
        description: String,
        /// Whether granting the approval will additionally trigger an install,
        /// so callers can render one combined prompt.
        needs_installation: bool,
    },
    /// Required environment variables are missing or invalid.
    ApiKeyRequired {
        workflow_id: String,
        missing_keys: Vec<String>,
        instructions: String,
    },
    /// The lockfile manager observed a digest change.
    IntegrityApproval {
        old_digest: String,
        new_digest: String,
        name: String,
    },
}

impl ApprovalRequired {
    pub fn dependency_approval(dependency: Option<McpDependency>, description: String, needs_installation: bool) -> Self {
        ApprovalRequired::DependencyApproval {
            workflow_id: Uuid::new_v4().to_string(),
            dependency,
            description,
            needs_installation,
        }
    }

    pub fn api_key_required(missing_keys: Vec<String>, instructions: String) -> Self {
        ApprovalRequired::ApiKeyRequired {
            workflow_id: Uuid::new_v4().to_string(),
            missing_keys,
            instructions,
        }
    }
}

impl fmt::Display for ApprovalRequired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalRequired::DependencyApproval { description, .. } => {
                write!(f, "DependencyApproval({})", description)
            }
            ApprovalRequired::ApiKeyRequired { missing_keys, .. } => {
                write!(f, "ApiKeyRequired({})", missing_keys.join(", "))
            }
            ApprovalRequired::IntegrityApproval { name, .. } => {
                write!(f, "IntegrityApproval({})", name)
            }
        }
    }
}

/// Continuation supplied when re-invoking after an out-of-band approval flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Continuation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    pub approved: bool,
}

impl Continuation {
    pub fn approved() -> Self {
        Self {
            workflow_id: None,
            approved: true,
        }
    }

    pub fn denied() -> Self {
        Self {
            workflow_id: None,
            approved: false,
        }
    }
}

/// A parsed `namespace:action` tool identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolId {
    pub namespace: String,
    pub action: String,
}

impl ToolId {
    pub fn parse(raw: &str) -> Result<Self, LoaderError> {
        let mut parts = raw.splitn(2, ':');
        let namespace = parts.next().unwrap_or_default();
        let action = parts.next().unwrap_or_default();
        if namespace.is_empty() || action.is_empty() {
            return Err(LoaderError::InvalidIdentifier(raw.to_string()));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            action: action.to_string(),
        })
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_id_parse() {
        let id = ToolId::parse("memory:create_entities").unwrap();
        assert_eq!(id.namespace, "memory");
        assert_eq!(id.action, "create_entities");
        assert_eq!(id.to_string(), "memory:create_entities");
    }

    #[test]
    fn test_tool_id_rejects_malformed() {
        assert!(ToolId::parse("memory").is_err());
        assert!(ToolId::parse(":action").is_err());
        assert!(ToolId::parse("ns:").is_err());
        assert!(ToolId::parse("").is_err());
    }

    #[test]
    fn test_binary_distribution_marker() {
        let dep = McpDependency {
            name: "fs".to_string(),
            kind: DependencyKind::Subprocess,
            install_command: BINARY_DISTRIBUTION.to_string(),
            version: "1.0.0".to_string(),
            digest: "sha256-abc".to_string(),
            env_vars: vec![],
            command: None,
            args: vec![],
            env_overrides: HashMap::new(),
        };
        assert!(dep.is_binary_distribution());
    }

    #[test]
    fn test_approval_serde_tagging() {
        let approval = ApprovalRequired::api_key_required(
            vec!["API_KEY".to_string()],
            "Set API_KEY in your environment".to_string(),
        );
        let json = serde_json::to_value(&approval).unwrap();
        assert_eq!(json["type"], "ApiKeyRequired");
        assert_eq!(json["missing_keys"][0], "API_KEY");
    }
}
