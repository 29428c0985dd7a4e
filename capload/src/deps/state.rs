//! Persisted Dependency State: which packages are installed, at which version,
//! with which verified digest.
//!
//! Records live in a single JSON file under the state directory. Writes go
//! through a temp file and an atomic rename, and complete before the caller
//! is told the install succeeded, so a crash immediately after install cannot
//! leave a package usable-but-unrecorded.

use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::LoaderResult;
use crate::types::{InstalledDep, McpDependency};

const STATE_FILE: &str = "deps.json";

pub struct DependencyState {
    path: PathBuf,
    records: RwLock<HashMap<String, InstalledDep>>,
}

impl DependencyState {
    /// Open (or initialize) the state file under `state_dir`.
    pub async fn open(state_dir: &PathBuf) -> LoaderResult<Self> {
        tokio::fs::create_dir_all(state_dir).await?;
        let path = state_dir.join(STATE_FILE);
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub async fn get(&self, name: &str) -> Option<InstalledDep> {
        self.records.read().await.get(name).cloned()
    }

    /// A dependency is satisfied only if the installed version AND digest both
    /// match. A version match with a stale digest is not satisfied: a changed
    /// digest forces re-approval, never silent reuse.
    pub async fn is_satisfied(&self, dep: &McpDependency) -> bool {
        match self.records.read().await.get(&dep.name) {
            Some(rec) => rec.version == dep.version && rec.digest == dep.digest,
            None => false,
        }
    }

    /// Record a successful install, overwriting any prior entry atomically.
    /// The write is durable before this returns.
    pub async fn record(&self, dep: InstalledDep) -> LoaderResult<()> {
        let mut records = self.records.write().await;
        records.insert(dep.name.clone(), dep);
        self.persist(&records).await?;
        Ok(())
    }

    /// Remove a record on explicit uninstall. Returns whether it existed.
    pub async fn remove(&self, name: &str) -> LoaderResult<bool> {
        let mut records = self.records.write().await;
        let existed = records.remove(name).is_some();
        if existed {
            self.persist(&records).await?;
        }
        Ok(existed)
    }

    async fn persist(&self, records: &HashMap<String, InstalledDep>) -> LoaderResult<()> {
        let bytes = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "persisted dependency state");
        Ok(())
    }
}
