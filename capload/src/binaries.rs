//! Platform-binary resolver for tool servers distributed as pre-built
//! executables rather than packages.
//!
//! Detects host OS and architecture, computes a versioned cache path, and
//! either reuses a cached executable or downloads the release artifact.
//! `latest` resolutions are answered from a per-instance cache after the
//! first release-index query.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::LoaderConfig;
use crate::error::{LoaderError, LoaderResult};

pub struct BinaryResolver {
    cache_dir: PathBuf,
    release_base_url: String,
    release_index_url: String,
    client: reqwest::Client,
    /// `name → resolved version` for `latest` queries, process-lifetime scoped.
    latest_cache: RwLock<HashMap<String, String>>,
}

impl BinaryResolver {
    pub fn new(config: &LoaderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.download_timeout_ms))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            cache_dir: config.binary_cache_dir.clone(),
            release_base_url: config.release_base_url.trim_end_matches('/').to_string(),
            release_index_url: config.release_index_url.trim_end_matches('/').to_string(),
            client,
            latest_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the executable for `name` at `version` (which may be `latest`),
    /// returning a path to a ready-to-run local binary.
    pub async fn resolve(&self, name: &str, version: &str) -> LoaderResult<PathBuf> {
        let version = if version == "latest" {
            self.resolve_latest(name).await?
        } else {
            version.to_string()
        };

        let asset = asset_name(name, &version, std::env::consts::OS, std::env::consts::ARCH);
        let path = self.cache_dir.join(name).join(&version).join(&asset);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(binary = %name, version = %version, "using cached binary");
            return Ok(path);
        }

        self.download(name, &version, &asset, &path).await?;
        Ok(path)
    }

    async fn resolve_latest(&self, name: &str) -> LoaderResult<String> {
        if let Some(version) = self.latest_cache.read().await.get(name) {
            return Ok(version.clone());
        }
        let url = format!("{}/{}/latest", self.release_index_url, name);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(LoaderError::Http(format!(
                "release index returned {} for {}",
                resp.status(),
                name
            )));
        }
        let body: serde_json::Value = resp.json().await?;
        let version = body
            .get("version")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                LoaderError::Http(format!("release index gave no version for {}", name))
            })?
            .to_string();
        self.latest_cache
            .write()
            .await
            .insert(name.to_string(), version.clone());
        Ok(version)
    }

    async fn download(
        &self,
        name: &str,
        version: &str,
        asset: &str,
        path: &Path,
    ) -> LoaderResult<()> {
        let url = format!("{}/{}/{}/{}", self.release_base_url, name, version, asset);
        info!(binary = %name, version = %version, url = %url, "downloading release binary");
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(LoaderError::Http(format!(
                "binary download returned {} for {}",
                resp.status(),
                asset
            )));
        }
        let bytes = resp.bytes().await?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &bytes).await?;
        mark_executable(path).await?;
        Ok(())
    }
}

/// Expected release asset name for one platform.
pub fn asset_name(name: &str, version: &str, os: &str, arch: &str) -> String {
    let ext = if os == "windows" { ".exe" } else { "" };
    format!("{}-{}-{}-{}{}", name, version, os, arch, ext)
}

#[cfg(unix)]
async fn mark_executable(path: &Path) -> LoaderResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o755);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn mark_executable(_path: &Path) -> LoaderResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn resolver_in(dir: &TempDir) -> BinaryResolver {
        let config = LoaderConfig {
            binary_cache_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        BinaryResolver::new(&config)
    }

    #[test]
    fn test_asset_name_per_platform() {
        assert_eq!(
            asset_name("fs-server", "1.4.0", "linux", "x86_64"),
            "fs-server-1.4.0-linux-x86_64"
        );
        assert_eq!(
            asset_name("fs-server", "1.4.0", "windows", "x86_64"),
            "fs-server-1.4.0-windows-x86_64.exe"
        );
    }

    #[tokio::test]
    async fn test_cached_binary_is_reused_without_network() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver_in(&dir);

        let asset = asset_name(
            "fs-server",
            "1.4.0",
            std::env::consts::OS,
            std::env::consts::ARCH,
        );
        let cached = dir.path().join("fs-server").join("1.4.0").join(&asset);
        tokio::fs::create_dir_all(cached.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&cached, b"#!/bin/sh\n").await.unwrap();

        // The configured release URLs are unreachable; a cache hit must not
        // touch them.
        let path = resolver.resolve("fs-server", "1.4.0").await.unwrap();
        assert_eq!(path, cached);
    }
}
