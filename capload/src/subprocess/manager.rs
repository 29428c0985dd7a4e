//! Lifecycle manager for external tool-server subprocesses.
//!
//! One live process per distinct dependency name. Concurrent callers of the
//! same name wait on a single in-flight spawn or restart through a per-name
//! gate; other names stay fully concurrent. Crashed processes are restarted
//! with bounded exponential backoff, and idle processes are reclaimed by a
//! background reaper.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::backoff::RestartBackoff;
use crate::binaries::BinaryResolver;
use crate::config::LoaderConfig;
use crate::error::{LoaderError, LoaderResult};
use crate::subprocess::process::StdioProcess;
use crate::types::McpDependency;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

enum GateAction {
    /// Another caller is spawning or restarting this name; wait on its signal.
    Wait(watch::Receiver<bool>),
    /// This caller owns the spawn; complete the signal when done.
    Spawn(watch::Sender<bool>),
}

pub struct StdioProcessManager {
    request_timeout: Duration,
    handshake_timeout: Duration,
    idle_timeout: Duration,
    reap_interval: Duration,
    max_restart_attempts: u32,
    restart_initial_delay: Duration,
    restart_max_delay: Duration,

    binaries: Arc<BinaryResolver>,
    live: RwLock<HashMap<String, Arc<StdioProcess>>>,
    /// Original dependency descriptors, kept for crash-triggered restarts.
    deps: RwLock<HashMap<String, McpDependency>>,
    /// Per-name spawn/restart markers. This is the one piece of state that
    /// guards a multi-step async sequence against concurrent re-entry.
    gates: Mutex<HashMap<String, watch::Receiver<bool>>>,
    crash_tx: mpsc::UnboundedSender<String>,
    spawn_count: AtomicUsize,
    shutting_down: AtomicBool,
}

impl StdioProcessManager {
    pub fn new(config: &LoaderConfig, binaries: Arc<BinaryResolver>) -> Arc<Self> {
        let (crash_tx, mut crash_rx) = mpsc::unbounded_channel::<String>();
        let manager = Arc::new(Self {
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            reap_interval: Duration::from_millis(config.reap_interval_ms),
            max_restart_attempts: config.max_restart_attempts,
            restart_initial_delay: Duration::from_millis(config.restart_initial_delay_ms),
            restart_max_delay: Duration::from_millis(config.restart_max_delay_ms),
            binaries,
            live: RwLock::new(HashMap::new()),
            deps: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            crash_tx,
            spawn_count: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
        });

        // Crash handler task: restart with backoff on unexpected termination.
        let weak: Weak<Self> = Arc::downgrade(&manager);
        tokio::spawn(async move {
            while let Some(name) = crash_rx.recv().await {
                match weak.upgrade() {
                    Some(mgr) => mgr.handle_crash(&name).await,
                    None => break,
                }
            }
        });

        // Idle reaper task.
        let weak: Weak<Self> = Arc::downgrade(&manager);
        let reap_interval = manager.reap_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(reap_interval).await;
                let Some(mgr) = weak.upgrade() else { break };
                if mgr.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                mgr.reap_idle().await;
            }
        });

        manager
    }

    /// Number of subprocess spawns performed over this manager's lifetime.
    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }

    /// Pid of the live process serving `name`, if any.
    pub async fn pid_of(&self, name: &str) -> Option<u32> {
        self.live.read().await.get(name).and_then(|p| p.pid())
    }

    /// Return the live process for `dep`, spawning it if needed. Callers
    /// racing an in-flight spawn or restart for the same name wait on its
    /// completion signal rather than spawning a second process.
    pub async fn get_or_spawn(&self, dep: &McpDependency) -> LoaderResult<Arc<StdioProcess>> {
        loop {
            if let Some(proc) = self.live.read().await.get(&dep.name) {
                if proc.is_alive() {
                    return Ok(Arc::clone(proc));
                }
            }

            let action = {
                let mut gates = self.gates.lock().await;
                // Re-check under the gate lock: a finished spawn inserts into
                // the live map before releasing its gate.
                if let Some(proc) = self.live.read().await.get(&dep.name) {
                    if proc.is_alive() {
                        return Ok(Arc::clone(proc));
                    }
                }
                match gates.get(&dep.name) {
                    Some(rx) => GateAction::Wait(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(false);
                        gates.insert(dep.name.clone(), rx);
                        GateAction::Spawn(tx)
                    }
                }
            };

            match action {
                GateAction::Wait(mut rx) => {
                    if !*rx.borrow() {
                        let _ = rx.changed().await;
                    }
                    // Loop around and pick up the freshly spawned process.
                }
                GateAction::Spawn(tx) => {
                    let result = self.spawn_and_handshake(dep).await;
                    if let Ok(proc) = &result {
                        self.live
                            .write()
                            .await
                            .insert(dep.name.clone(), Arc::clone(proc));
                        self.deps.write().await.insert(dep.name.clone(), dep.clone());
                    }
                    self.gates.lock().await.remove(&dep.name);
                    let _ = tx.send(true);
                    return result;
                }
            }
        }
    }

    /// Call a tool on the subprocess serving `dep`. The tool name is the
    /// capability's own action name, not namespace-prefixed.
    pub async fn call_tool(
        &self,
        dep: &McpDependency,
        tool: &str,
        args: Value,
    ) -> LoaderResult<Value> {
        let proc = self.get_or_spawn(dep).await?;
        proc.request(
            "tools/call",
            json!({ "name": tool, "arguments": args }),
            self.request_timeout,
        )
        .await
    }

    /// Terminate every managed subprocess and stop background tasks.
    pub async fn shutdown_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let procs: Vec<_> = self.live.write().await.drain().collect();
        futures::future::join_all(procs.into_iter().map(|(name, proc)| async move {
            debug!(process = %name, "shutting down subprocess");
            proc.shutdown().await;
        }))
        .await;
        self.deps.write().await.clear();
        self.gates.lock().await.clear();
    }

    async fn spawn_and_handshake(&self, dep: &McpDependency) -> LoaderResult<Arc<StdioProcess>> {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);

        let (program, args) = self.resolve_executable(dep).await?;
        info!(dependency = %dep.name, program = %program, "spawning tool server");
        let proc = StdioProcess::spawn(
            &dep.name,
            &program,
            &args,
            &dep.env_overrides,
            self.crash_tx.clone(),
        )?;

        // Protocol handshake: the process is not ready until `initialize`
        // completes and the `initialized` notification is sent.
        let init = proc
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "clientInfo": {
                        "name": "capload",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "capabilities": {},
                }),
                self.handshake_timeout,
            )
            .await;
        if let Err(e) = init {
            proc.shutdown().await;
            return Err(LoaderError::SpawnFailure(format!(
                "{}: initialize handshake failed: {}",
                dep.name, e
            )));
        }
        proc.notify("notifications/initialized", json!({})).await?;

        Ok(proc)
    }

    async fn resolve_executable(&self, dep: &McpDependency) -> LoaderResult<(String, Vec<String>)> {
        if let Some(command) = &dep.command {
            return Ok((command.clone(), dep.args.clone()));
        }
        if dep.is_binary_distribution() {
            let path = self.binaries.resolve(&dep.name, &dep.version).await?;
            return Ok((path.to_string_lossy().into_owned(), dep.args.clone()));
        }
        // Package-installed servers launch through the package runner.
        let mut args = vec!["-y".to_string(), format!("{}@{}", dep.name, dep.version)];
        args.extend(dep.args.iter().cloned());
        Ok(("npx".to_string(), args))
    }

    async fn handle_crash(&self, name: &str) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut live = self.live.write().await;
            match live.get(name) {
                // A caller already put a healthy replacement in place between
                // the crash notification and this handler; leave it alone.
                Some(proc) if proc.is_alive() => {
                    debug!(process = %name, "stale crash notification, live replacement in place");
                    return;
                }
                Some(_) => {
                    live.remove(name);
                }
                None => {}
            }
        }
        warn!(process = %name, "subprocess crashed, attempting restart");

        let Some(dep) = self.deps.read().await.get(name).cloned() else {
            return;
        };

        // Take the gate so concurrent callers wait on this restart instead of
        // racing a spawn of their own.
        let gate_tx = {
            let mut gates = self.gates.lock().await;
            if gates.contains_key(name) {
                // A caller-initiated spawn is already in flight; let it win.
                return;
            }
            let (tx, rx) = watch::channel(false);
            gates.insert(name.to_string(), rx);
            tx
        };

        let mut backoff = RestartBackoff::new(
            self.restart_initial_delay,
            self.restart_max_delay,
            self.max_restart_attempts,
        );
        let mut restarted = false;
        while let Some(delay) = backoff.next_delay() {
            debug!(process = %name, attempt = backoff.attempts_made(), "restart backoff {:?}", delay);
            tokio::time::sleep(delay).await;
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            match self.spawn_and_handshake(&dep).await {
                Ok(proc) => {
                    self.live.write().await.insert(name.to_string(), proc);
                    info!(process = %name, "restart succeeded");
                    restarted = true;
                    break;
                }
                Err(e) => {
                    warn!(process = %name, attempt = backoff.attempts_made(), "restart failed: {}", e);
                }
            }
        }
        if !restarted {
            error!(
                process = %name,
                attempts = self.max_restart_attempts,
                "giving up on restart; the next call will spawn fresh"
            );
        }

        self.gates.lock().await.remove(name);
        let _ = gate_tx.send(true);
    }

    async fn reap_idle(&self) {
        let idle: Vec<(String, Arc<StdioProcess>)> = {
            let live = self.live.read().await;
            live.iter()
                .filter(|(_, p)| p.idle_for() > self.idle_timeout)
                .map(|(n, p)| (n.clone(), Arc::clone(p)))
                .collect()
        };
        for (name, proc) in idle {
            info!(process = %name, idle = ?proc.idle_for(), "reclaiming idle subprocess");
            self.live.write().await.remove(&name);
            proc.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_handler_spares_live_replacement() {
        let dir = TempDir::new().unwrap();
        let config = LoaderConfig {
            state_dir: dir.path().join("state"),
            binary_cache_dir: dir.path().join("binaries"),
            restart_initial_delay_ms: 10,
            restart_max_delay_ms: 20,
            ..Default::default()
        };
        let manager = StdioProcessManager::new(&config, Arc::new(BinaryResolver::new(&config)));

        // Stand in for a replacement a caller spawned after the crash but
        // before the handler ran: a live process already registered under the
        // crashed name.
        let (crash_tx, _crash_rx) = mpsc::unbounded_channel();
        let replacement =
            StdioProcess::spawn("svc", "cat", &[], &HashMap::new(), crash_tx).unwrap();
        manager
            .live
            .write()
            .await
            .insert("svc".to_string(), Arc::clone(&replacement));

        manager.handle_crash("svc").await;

        let spared = manager
            .live
            .read()
            .await
            .get("svc")
            .map(|p| p.is_alive())
            .unwrap_or(false);
        assert!(spared, "live replacement was evicted by a stale crash event");

        manager.shutdown_all().await;
    }
}
