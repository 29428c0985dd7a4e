use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::permissions::PermissionPolicy;

/// Configuration for one loader instance.
///
/// All caches and timers are scoped to the instance that owns this config so
/// tests can construct isolated loaders side by side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Directory holding the persisted dependency state file.
    pub state_dir: PathBuf,
    /// Directory holding downloaded platform binaries, one subdir per name/version.
    pub binary_cache_dir: PathBuf,

    /// Public package registry queried for published integrity metadata.
    pub package_registry_url: String,
    /// Base URL for release artifacts of binary-distributed tool servers.
    pub release_base_url: String,
    /// Endpoint answering `latest` version queries for binary releases.
    pub release_index_url: String,

    /// Gateway that remote-routed nested calls are forwarded to.
    pub remote_gateway_url: String,
    /// Name of the environment variable holding the gateway bearer token.
    pub remote_token_env: String,

    /// Per-request timeout for subprocess calls.
    pub request_timeout_ms: u64,
    /// Timeout for the initialize handshake after spawning.
    pub handshake_timeout_ms: u64,
    /// Overall timeout for one install command.
    pub install_timeout_ms: u64,
    /// Overall timeout for one binary download.
    pub download_timeout_ms: u64,

    /// A subprocess idle longer than this is reclaimed.
    pub idle_timeout_ms: u64,
    /// How often the idle reaper scans the live map.
    pub reap_interval_ms: u64,

    /// Bounded restart attempts after an unexpected subprocess crash.
    pub max_restart_attempts: u32,
    pub restart_initial_delay_ms: u64,
    pub restart_max_delay_ms: u64,

    /// When set, dependencies with unverifiable digest formats are allowed
    /// through with a warning instead of failing. Never the default.
    pub trusted_mode: bool,

    /// Allow / deny / ask pattern lists evaluated for every tool id.
    pub policy: PermissionPolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".capload/state"),
            binary_cache_dir: PathBuf::from(".capload/binaries"),
            package_registry_url: "https://registry.npmjs.org".to_string(),
            release_base_url: "https://releases.capload.dev/artifacts".to_string(),
            release_index_url: "https://releases.capload.dev/index".to_string(),
            remote_gateway_url: "https://gateway.capload.dev/call".to_string(),
            remote_token_env: "CAPLOAD_GATEWAY_TOKEN".to_string(),
            request_timeout_ms: 30_000,
            handshake_timeout_ms: 15_000,
            install_timeout_ms: 120_000,
            download_timeout_ms: 120_000,
            idle_timeout_ms: 300_000,
            reap_interval_ms: 10_000,
            max_restart_attempts: 3,
            restart_initial_delay_ms: 250,
            restart_max_delay_ms: 10_000,
            trusted_mode: false,
            policy: PermissionPolicy::default(),
        }
    }
}
