//! Sandbox execution seam and trace collection.
//!
//! The sandbox interpreter itself is an opaque collaborator: it executes
//! fetched code in isolation with no ambient permissions. Its only channel to
//! the outside world is the [`HostCall`] hook, which the loader implements by
//! re-entering its own routing logic. Every intercepted call is timed and
//! recorded; on completion the accumulated trace is handed to a sink on a
//! spawned task so delivery never blocks the caller's result.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use crate::error::LoaderResult;

/// The single intercepted call hook exposed to sandboxed code:
/// `namespace:action` → arguments → result.
#[async_trait]
pub trait HostCall: Send + Sync {
    async fn call(&self, namespace: &str, action: &str, args: Value) -> LoaderResult<Value>;
}

/// Opaque "execute code in isolation" collaborator. Implementations own
/// call-depth and iteration budgets for the code they run.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn execute(
        &self,
        code: &str,
        args: Value,
        host: Arc<dyn HostCall>,
    ) -> LoaderResult<Value>;
}

/// One recorded nested tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolTraceEntry {
    pub tool_id: String,
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

/// Accumulates trace entries for one capability execution.
#[derive(Default)]
pub struct TraceCollector {
    entries: StdMutex<Vec<ToolTraceEntry>>,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: ToolTraceEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    /// Take every accumulated entry, leaving the collector empty.
    pub fn take(&self) -> Vec<ToolTraceEntry> {
        self.entries
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }
}

/// Consumer of execution traces (the learning subsystem's ingestion point).
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn deliver(&self, capability: &str, entries: Vec<ToolTraceEntry>);

    /// Flush any buffered traces; called from loader shutdown.
    async fn flush(&self) {}
}

/// Wraps a [`HostCall`] so every intercepted call is timed and recorded.
pub struct TracedHost {
    inner: Arc<dyn HostCall>,
    collector: Arc<TraceCollector>,
}

impl TracedHost {
    pub fn new(inner: Arc<dyn HostCall>, collector: Arc<TraceCollector>) -> Self {
        Self { inner, collector }
    }
}

#[async_trait]
impl HostCall for TracedHost {
    async fn call(&self, namespace: &str, action: &str, args: Value) -> LoaderResult<Value> {
        let started_at = Utc::now();
        let start = Instant::now();
        let outcome = self.inner.call(namespace, action, args.clone()).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let entry = match &outcome {
            Ok(result) => ToolTraceEntry {
                tool_id: format!("{}:{}", namespace, action),
                args,
                result: Some(result.clone()),
                error: None,
                duration_ms,
                started_at,
            },
            Err(e) => ToolTraceEntry {
                tool_id: format!("{}:{}", namespace, action),
                args,
                result: None,
                error: Some(e.to_string()),
                duration_ms,
                started_at,
            },
        };
        self.collector.record(entry);
        outcome
    }
}
