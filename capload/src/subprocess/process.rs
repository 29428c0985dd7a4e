//! One running tool-server subprocess, with request multiplexing over its
//! single stdio stream.
//!
//! A single background reader task serves every outstanding request on the
//! process. Responses are matched to pending requests strictly by id: the
//! reader never hands the first response it sees to whichever caller happens
//! to be waiting.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::error::{LoaderError, LoaderResult};
use crate::subprocess::framing::drain_messages;

type PendingMap = Arc<RwLock<HashMap<i64, oneshot::Sender<LoaderResult<Value>>>>>;

pub struct StdioProcess {
    name: String,
    pid: Option<u32>,
    child: Mutex<Child>,
    writer: mpsc::Sender<String>,
    pending: PendingMap,
    next_id: AtomicI64,
    alive: Arc<AtomicBool>,
    last_activity: StdMutex<Instant>,
}

impl std::fmt::Debug for StdioProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioProcess")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .finish()
    }
}

impl StdioProcess {
    /// Spawn the server process with piped stdio and start its writer, reader,
    /// and stderr-drain tasks. `crash_tx` receives the dependency name when
    /// the reader observes stream closure while the process is believed live.
    pub fn spawn(
        name: &str,
        program: &str,
        args: &[String],
        env_overrides: &HashMap<String, String>,
        crash_tx: mpsc::UnboundedSender<String>,
    ) -> LoaderResult<Arc<Self>> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Dependency-specific overrides win over the inherited process env.
        for (k, v) in env_overrides {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| {
            LoaderError::SpawnFailure(format!("{}: failed to spawn {}: {}", name, program, e))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| LoaderError::SpawnFailure(format!("{}: no stdin handle", name)))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| LoaderError::SpawnFailure(format!("{}: no stdout handle", name)))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| LoaderError::SpawnFailure(format!("{}: no stderr handle", name)))?;
        let pid = child.id();

        let (tx, mut rx) = mpsc::channel::<String>(64);
        let pending: PendingMap = Arc::new(RwLock::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        // Stdin writer task: serializes and sends requests to the server.
        let writer_name = name.to_string();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = stdin.write_all(msg.as_bytes()).await {
                    error!(process = %writer_name, "failed to write to stdin: {}", e);
                    break;
                }
                if let Err(e) = stdin.write_all(b"\n").await {
                    error!(process = %writer_name, "failed to write newline: {}", e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    error!(process = %writer_name, "failed to flush stdin: {}", e);
                    break;
                }
            }
        });

        // Stdout reader task: reassembles frames from raw reads and completes
        // the pending entry whose id matches each decoded response.
        let reader_pending = Arc::clone(&pending);
        let reader_alive = Arc::clone(&alive);
        let reader_name = name.to_string();
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        for msg in drain_messages(&mut buf) {
                            dispatch_message(&reader_name, &msg, &reader_pending).await;
                        }
                    }
                    Err(e) => {
                        error!(process = %reader_name, "error reading stdout: {}", e);
                        break;
                    }
                }
            }
            // Stream closed. If the process was still believed live this is an
            // unexpected crash, distinct from a deliberate shutdown which
            // clears the alive flag first.
            if reader_alive.swap(false, Ordering::SeqCst) {
                warn!(process = %reader_name, "unexpected stream closure, treating as crash");
                reject_all(
                    &reader_pending,
                    || LoaderError::Terminated(format!("{}: subprocess terminated unexpectedly", reader_name)),
                )
                .await;
                let _ = crash_tx.send(reader_name.clone());
            }
        });

        // Stderr drain task: server diagnostics go to our logs.
        let stderr_name = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(process = %stderr_name, "stderr: {}", line);
            }
        });

        Ok(Arc::new(Self {
            name: name.to_string(),
            pid,
            child: Mutex::new(child),
            writer: tx,
            pending,
            next_id: AtomicI64::new(1),
            alive,
            last_activity: StdMutex::new(Instant::now()),
        }))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Time since the last successful call on this process.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    fn touch(&self) {
        if let Ok(mut t) = self.last_activity.lock() {
            *t = Instant::now();
        }
    }

    /// Send a JSON-RPC request and await its response, independently of any
    /// other in-flight request on this process. A timeout rejects only this
    /// request and removes only its own pending entry.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> LoaderResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let (resp_tx, resp_rx) = oneshot::channel();
        {
            let mut pending = self.pending.write().await;
            pending.insert(id, resp_tx);
        }

        let msg = serde_json::to_string(&request)?;
        if self.writer.send(msg).await.is_err() {
            self.pending.write().await.remove(&id);
            return Err(LoaderError::Terminated(format!(
                "{}: stdin writer task is gone",
                self.name
            )));
        }

        match tokio::time::timeout(timeout, resp_rx).await {
            Ok(Ok(result)) => {
                let response = result?;
                if let Some(error) = response.get("error") {
                    let code = error.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
                    let message = error
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("unknown error");
                    return Err(LoaderError::SubprocessFailure(format!(
                        "{}: server error {} on '{}': {}",
                        self.name, code, method, message
                    )));
                }
                self.touch();
                Ok(response.get("result").cloned().unwrap_or(Value::Null))
            }
            Ok(Err(_)) => Err(LoaderError::Terminated(format!(
                "{}: response channel closed for '{}'",
                self.name, method
            ))),
            Err(_) => {
                self.pending.write().await.remove(&id);
                Err(LoaderError::Timeout(format!(
                    "{}: request '{}' (id {}) timed out after {:?}",
                    self.name, method, id, timeout
                )))
            }
        }
    }

    /// Send a JSON-RPC notification (no id, no response expected).
    pub async fn notify(&self, method: &str, params: Value) -> LoaderResult<()> {
        let notification = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        let msg = serde_json::to_string(&notification)?;
        self.writer.send(msg).await.map_err(|_| {
            LoaderError::Terminated(format!("{}: stdin writer task is gone", self.name))
        })
    }

    /// Deliberate shutdown: mark not-alive first so the reader's EOF is not
    /// mistaken for a crash, then reject pendings and kill the child.
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        reject_all(&self.pending, || {
            LoaderError::Terminated(format!("{}: subprocess shut down", self.name))
        })
        .await;
        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            debug!(process = %self.name, "kill failed (already exited?): {}", e);
        }
    }
}

async fn dispatch_message(name: &str, msg: &str, pending: &PendingMap) {
    let Ok(value) = serde_json::from_str::<Value>(msg) else {
        warn!(process = %name, "discarding unparseable message: {}", msg);
        return;
    };
    let id = match value.get("id") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse::<i64>().ok(),
        _ => None,
    };
    let Some(id) = id else {
        // Server-initiated notification; nothing is waiting on it.
        debug!(process = %name, "ignoring message without id");
        return;
    };
    let sender = pending.write().await.remove(&id);
    match sender {
        Some(tx) => {
            let _ = tx.send(Ok(value));
        }
        None => {
            warn!(process = %name, id, "response with no pending request");
        }
    }
}

async fn reject_all(pending: &PendingMap, make_err: impl Fn() -> LoaderError) {
    let senders: Vec<_> = pending.write().await.drain().collect();
    for (_, tx) in senders {
        let _ = tx.send(Err(make_err()));
    }
}
