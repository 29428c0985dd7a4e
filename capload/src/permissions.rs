//! Permission policy evaluation and BYOK key checking.
//!
//! A policy is three string-pattern lists (allow / deny / ask). Every tool id
//! about to execute is checked against them in deny-first order. The default
//! policy asks about everything, which is the safe default: nothing runs
//! without an explicit grant.

use serde::{Deserialize, Serialize};

use crate::types::ApprovalRequired;

/// Three-way outcome of a permission check, evaluated before any side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Allowed,
    Denied,
    Ask,
}

/// User-controlled allow / deny / ask pattern lists.
///
/// Patterns are either `*` (everything), `namespace:*` (every action under a
/// namespace), or an exact `namespace:action` id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionPolicy {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub ask: Vec<String>,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        // Deny nothing, allow nothing, ask everything.
        Self {
            allow: Vec::new(),
            deny: Vec::new(),
            ask: vec!["*".to_string()],
        }
    }
}

impl PermissionPolicy {
    pub fn allow_all() -> Self {
        Self {
            allow: vec!["*".to_string()],
            deny: Vec::new(),
            ask: Vec::new(),
        }
    }
}

/// Evaluate `tool_id` against the policy. Deny wins over allow wins over ask;
/// anything unmatched falls back to `Ask`.
pub fn check_permission(tool_id: &str, policy: &PermissionPolicy) -> PermissionDecision {
    if policy.deny.iter().any(|p| pattern_matches(p, tool_id)) {
        return PermissionDecision::Denied;
    }
    if policy.allow.iter().any(|p| pattern_matches(p, tool_id)) {
        return PermissionDecision::Allowed;
    }
    if policy.ask.iter().any(|p| pattern_matches(p, tool_id)) {
        return PermissionDecision::Ask;
    }
    PermissionDecision::Ask
}

fn pattern_matches(pattern: &str, tool_id: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(":*") {
        return tool_id
            .split_once(':')
            .map(|(ns, _)| ns == prefix)
            .unwrap_or(false);
    }
    pattern == tool_id
}

/// Result of validating required environment variables.
#[derive(Debug, Clone, Default)]
pub struct KeyCheck {
    /// Variables that are unset or empty in the process environment.
    pub missing: Vec<String>,
}

impl KeyCheck {
    pub fn all_present(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Validate that every named variable is set and non-empty.
///
/// Keys can become invalid after installation (removed from local config),
/// so this runs on every dependency check regardless of install status.
pub fn check_required_keys(names: &[String]) -> KeyCheck {
    let missing = names
        .iter()
        .filter(|name| {
            std::env::var(name.as_str())
                .map(|v| v.trim().is_empty())
                .unwrap_or(true)
        })
        .cloned()
        .collect();
    KeyCheck { missing }
}

/// Build the api-key-required approval shape from a failed key check.
pub fn api_key_approval(check: &KeyCheck, context: &str) -> ApprovalRequired {
    ApprovalRequired::api_key_required(
        check.missing.clone(),
        format!(
            "Set the following environment variables for {}: {}",
            context,
            check.missing.join(", ")
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_asks_everything() {
        let policy = PermissionPolicy::default();
        assert_eq!(
            check_permission("memory:create_entities", &policy),
            PermissionDecision::Ask
        );
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let policy = PermissionPolicy {
            allow: vec!["fs:*".to_string()],
            deny: vec!["fs:delete".to_string()],
            ask: vec![],
        };
        assert_eq!(check_permission("fs:delete", &policy), PermissionDecision::Denied);
        assert_eq!(check_permission("fs:read", &policy), PermissionDecision::Allowed);
    }

    #[test]
    fn test_namespace_wildcard_does_not_cross_namespaces() {
        let policy = PermissionPolicy {
            allow: vec!["fs:*".to_string()],
            deny: vec![],
            ask: vec![],
        };
        assert_eq!(check_permission("fs:read", &policy), PermissionDecision::Allowed);
        // Unmatched falls back to ask.
        assert_eq!(check_permission("net:fetch", &policy), PermissionDecision::Ask);
    }

    #[test]
    fn test_exact_match_only_for_plain_patterns() {
        let policy = PermissionPolicy {
            allow: vec!["fs:read".to_string()],
            deny: vec![],
            ask: vec![],
        };
        assert_eq!(check_permission("fs:read", &policy), PermissionDecision::Allowed);
        assert_eq!(check_permission("fs:read_file", &policy), PermissionDecision::Ask);
    }

    #[test]
    fn test_key_check_reports_missing_and_empty() {
        std::env::set_var("CAPLOAD_TEST_KEY_SET", "value");
        std::env::set_var("CAPLOAD_TEST_KEY_EMPTY", "");
        let check = check_required_keys(&[
            "CAPLOAD_TEST_KEY_SET".to_string(),
            "CAPLOAD_TEST_KEY_EMPTY".to_string(),
            "CAPLOAD_TEST_KEY_UNSET".to_string(),
        ]);
        assert_eq!(
            check.missing,
            vec![
                "CAPLOAD_TEST_KEY_EMPTY".to_string(),
                "CAPLOAD_TEST_KEY_UNSET".to_string()
            ]
        );
        assert!(!check.all_present());
    }
}
