//! Capability loader orchestrator.
//!
//! Drives the full load/call flow: metadata resolution, dependency and
//! permission gating (pausing for approval instead of executing anything),
//! backend dispatch, and the nested call surface that sandboxed code uses to
//! invoke further tools. A load or call returns exactly one of: a ready
//! handle / result, an approval-required shape, or an error.
//!
//! Concurrent loads of one capability name coalesce on a per-name completion
//! signal, the same shape the subprocess manager uses for spawns. Cycles are
//! a property of a nested-call chain, not of concurrency: each sandbox host
//! carries the chain of capability names that led to it, and a nested call
//! back into any of them is rejected.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::binaries::BinaryResolver;
use crate::config::LoaderConfig;
use crate::deps::installer::{DependencyInstaller, EnsureOutcome, NpmPackageRegistry, PackageRegistry};
use crate::deps::state::DependencyState;
use crate::deps::integrity::verify_content;
use crate::error::{LoaderError, LoaderResult};
use crate::forward::{forward_call, resolve_header_templates};
use crate::permissions::{api_key_approval, check_permission, check_required_keys, PermissionDecision};
use crate::registry::{LockfileManager, MetadataOrApproval, RegistryClient};
use crate::sandbox::{HostCall, SandboxRuntime, TraceCollector, TraceSink, TracedHost};
use crate::subprocess::manager::StdioProcessManager;
use crate::types::{
    ApprovalRequired, CapabilityMetadata, Continuation, ExecutionKind, McpDependency, RoutingHint,
    ToolId,
};

/// Classifies nested-call identifiers the loader has no local mapping for.
#[async_trait]
pub trait RoutingDirectory: Send + Sync {
    async fn classify(&self, tool_id: &str) -> LoaderResult<RoutingHint>;
}

/// A loaded, ready-to-use capability bound to one execution backend.
#[derive(Debug, Clone)]
pub struct CapabilityHandle {
    pub metadata: Arc<CapabilityMetadata>,
    /// Whether fetched code is re-verified against the metadata digest.
    /// FQDN-based loads skip this: the resolver already verified upstream.
    verify_integrity: bool,
}

impl CapabilityHandle {
    pub fn tools(&self) -> &[String] {
        &self.metadata.tools
    }
}

/// Result of `load`: a usable handle, or an approval the caller must handle.
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    Ready(Arc<CapabilityHandle>),
    Approval(ApprovalRequired),
}

/// Result of `call`: the tool's value, or an approval the caller must handle.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    Completed(Value),
    Approval(ApprovalRequired),
}

enum LoadGate {
    /// The handle landed in the cache while taking the gate lock.
    Cached(Arc<CapabilityHandle>),
    /// Another caller is loading this name; wait on its signal and retry.
    Wait(watch::Receiver<bool>),
    /// This caller owns the load; complete the signal when done.
    Owner(watch::Sender<bool>),
}

pub struct CapabilityLoaderBuilder {
    config: LoaderConfig,
    registry: Arc<dyn RegistryClient>,
    sandbox: Arc<dyn SandboxRuntime>,
    routing: Arc<dyn RoutingDirectory>,
    lockfile: Option<Arc<dyn LockfileManager>>,
    trace_sink: Option<Arc<dyn TraceSink>>,
    package_registry: Option<Arc<dyn PackageRegistry>>,
}

impl CapabilityLoaderBuilder {
    pub fn new(
        config: LoaderConfig,
        registry: Arc<dyn RegistryClient>,
        sandbox: Arc<dyn SandboxRuntime>,
        routing: Arc<dyn RoutingDirectory>,
    ) -> Self {
        Self {
            config,
            registry,
            sandbox,
            routing,
            lockfile: None,
            trace_sink: None,
            package_registry: None,
        }
    }

    pub fn with_lockfile(mut self, lockfile: Arc<dyn LockfileManager>) -> Self {
        self.lockfile = Some(lockfile);
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    pub fn with_package_registry(mut self, registry: Arc<dyn PackageRegistry>) -> Self {
        self.package_registry = Some(registry);
        self
    }

    pub async fn build(self) -> LoaderResult<Arc<CapabilityLoader>> {
        let state = Arc::new(DependencyState::open(&self.config.state_dir).await?);
        let session_approvals = Arc::new(tokio::sync::RwLock::new(HashSet::new()));
        let package_registry = self.package_registry.unwrap_or_else(|| {
            Arc::new(NpmPackageRegistry::new(&self.config.package_registry_url))
        });
        let installer = Arc::new(DependencyInstaller::new(
            &self.config,
            Arc::clone(&state),
            package_registry,
            Arc::clone(&session_approvals),
        ));
        let binaries = Arc::new(BinaryResolver::new(&self.config));
        let subprocesses = StdioProcessManager::new(&self.config, binaries);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(self.config.request_timeout_ms))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Ok(Arc::new_cyclic(|self_ref| CapabilityLoader {
            self_ref: self_ref.clone(),
            config: self.config,
            registry: self.registry,
            lockfile: self.lockfile,
            sandbox: self.sandbox,
            routing: self.routing,
            trace_sink: self.trace_sink,
            state,
            installer,
            subprocesses,
            http,
            session_approvals,
            handles: tokio::sync::RwLock::new(HashMap::new()),
            code_cache: tokio::sync::RwLock::new(HashMap::new()),
            load_gates: tokio::sync::Mutex::new(HashMap::new()),
        }))
    }
}

pub struct CapabilityLoader {
    /// Back-reference handed to nested-call hosts, which need an owning
    /// handle into the loader from inside sandbox executions.
    self_ref: Weak<Self>,
    config: LoaderConfig,
    registry: Arc<dyn RegistryClient>,
    lockfile: Option<Arc<dyn LockfileManager>>,
    sandbox: Arc<dyn SandboxRuntime>,
    routing: Arc<dyn RoutingDirectory>,
    trace_sink: Option<Arc<dyn TraceSink>>,
    state: Arc<DependencyState>,
    installer: Arc<DependencyInstaller>,
    subprocesses: Arc<StdioProcessManager>,
    http: reqwest::Client,
    /// Tool ids approved for this loader instance's lifetime.
    session_approvals: Arc<tokio::sync::RwLock<HashSet<String>>>,
    /// Handle cache keyed by the input name used to load.
    handles: tokio::sync::RwLock<HashMap<String, Arc<CapabilityHandle>>>,
    /// Raw code cache for sandboxed capabilities, fetched once per name.
    code_cache: tokio::sync::RwLock<HashMap<String, String>>,
    /// Per-name in-flight-load markers; concurrent loaders of one name wait
    /// on the first caller's completion signal instead of fetching twice.
    load_gates: tokio::sync::Mutex<HashMap<String, watch::Receiver<bool>>>,
}

impl CapabilityLoader {
    /// Resolve `name` (cache-first) into a ready execution handle, or pause
    /// with an approval result. No package is installed and no subprocess is
    /// spawned without a prior allow-listed permission or an explicit
    /// approval continuation. Concurrent callers of the same name share one
    /// metadata fetch.
    pub async fn load(
        &self,
        name: &str,
        continuation: Option<&Continuation>,
    ) -> LoaderResult<LoadOutcome> {
        // A tool id is accepted for convenience; the capability name is the
        // namespace part.
        let cap_name = name.split(':').next().unwrap_or(name).to_string();
        if cap_name.is_empty() {
            return Err(LoaderError::InvalidIdentifier(name.to_string()));
        }

        loop {
            if let Some(handle) = self.handles.read().await.get(&cap_name) {
                return Ok(LoadOutcome::Ready(Arc::clone(handle)));
            }
            match self.enter_load_gate(&cap_name).await {
                LoadGate::Cached(handle) => return Ok(LoadOutcome::Ready(handle)),
                LoadGate::Wait(mut rx) => {
                    if !*rx.borrow() {
                        let _ = rx.changed().await;
                    }
                    // Loop around: a successful load left a cached handle. A
                    // failed or paused one did not, and this caller retries
                    // the fetch itself.
                }
                LoadGate::Owner(tx) => {
                    let result = self.fetch_named(&cap_name, name, continuation).await;
                    self.release_load_gate(&cap_name, tx).await;
                    return result;
                }
            }
        }
    }

    /// Load by fully-resolved identifier. Skips name resolution and the local
    /// code-integrity re-check because the trusted resolver collaborator
    /// already performed both.
    pub async fn load_by_fqdn(
        &self,
        fqdn: &str,
        continuation: Option<&Continuation>,
    ) -> LoaderResult<LoadOutcome> {
        if fqdn.is_empty() {
            return Err(LoaderError::InvalidIdentifier(fqdn.to_string()));
        }
        loop {
            if let Some(handle) = self.handles.read().await.get(fqdn) {
                return Ok(LoadOutcome::Ready(Arc::clone(handle)));
            }
            match self.enter_load_gate(fqdn).await {
                LoadGate::Cached(handle) => return Ok(LoadOutcome::Ready(handle)),
                LoadGate::Wait(mut rx) => {
                    if !*rx.borrow() {
                        let _ = rx.changed().await;
                    }
                }
                LoadGate::Owner(tx) => {
                    let result = match self.registry.fetch_by_fqdn(fqdn).await {
                        Ok(metadata) => {
                            self.finish_load(fqdn, fqdn, metadata, continuation, false)
                                .await
                        }
                        Err(e) => Err(e),
                    };
                    self.release_load_gate(fqdn, tx).await;
                    return result;
                }
            }
        }
    }

    /// Load `tool_id`'s capability and invoke the action on it.
    pub async fn call(
        &self,
        tool_id: &str,
        args: Value,
        continuation: Option<&Continuation>,
    ) -> LoaderResult<CallOutcome> {
        self.call_inner(tool_id, args, continuation, &[]).await
    }

    /// `call` against a fully-resolved identifier plus an action name.
    pub async fn call_with_fqdn(
        &self,
        fqdn: &str,
        action: &str,
        args: Value,
        continuation: Option<&Continuation>,
    ) -> LoaderResult<CallOutcome> {
        let handle = match self.load_by_fqdn(fqdn, continuation).await? {
            LoadOutcome::Ready(handle) => handle,
            LoadOutcome::Approval(approval) => return Ok(CallOutcome::Approval(approval)),
        };
        let tool = ToolId {
            namespace: handle.metadata.name.clone(),
            action: action.to_string(),
        };
        self.dispatch(&handle, &tool, args, continuation, &[]).await
    }

    /// Add a tool id to the session allow-set, used by the continuation flow
    /// after the user grants approval out of band. Approval is per tool,
    /// never per namespace.
    pub async fn approve_tool_for_session(&self, tool_id: &str) {
        self.session_approvals
            .write()
            .await
            .insert(tool_id.to_string());
    }

    /// Flush pending trace data, terminate every managed subprocess, and
    /// clear the handle cache.
    pub async fn shutdown(&self) {
        info!("shutting down capability loader");
        if let Some(sink) = &self.trace_sink {
            sink.flush().await;
        }
        self.subprocesses.shutdown_all().await;
        self.handles.write().await.clear();
        self.code_cache.write().await.clear();
    }

    /// Spawn count of the underlying subprocess manager (observability).
    pub fn subprocess_spawn_count(&self) -> usize {
        self.subprocesses.spawn_count()
    }

    /// Pid of the live subprocess serving a dependency name, if any.
    pub async fn subprocess_pid(&self, name: &str) -> Option<u32> {
        self.subprocesses.pid_of(name).await
    }

    async fn enter_load_gate(&self, key: &str) -> LoadGate {
        let mut gates = self.load_gates.lock().await;
        // Re-check under the gate lock: a finished load inserts into the
        // handle cache before releasing its gate.
        if let Some(handle) = self.handles.read().await.get(key) {
            return LoadGate::Cached(Arc::clone(handle));
        }
        match gates.get(key) {
            Some(rx) => LoadGate::Wait(rx.clone()),
            None => {
                let (tx, rx) = watch::channel(false);
                gates.insert(key.to_string(), rx);
                LoadGate::Owner(tx)
            }
        }
    }

    async fn release_load_gate(&self, key: &str, tx: watch::Sender<bool>) {
        self.load_gates.lock().await.remove(key);
        let _ = tx.send(true);
    }

    async fn fetch_named(
        &self,
        cap_name: &str,
        requested: &str,
        continuation: Option<&Continuation>,
    ) -> LoaderResult<LoadOutcome> {
        let metadata = match &self.lockfile {
            Some(lockfile) => match continuation {
                Some(c) if c.approved => {
                    self.registry
                        .continue_fetch_with_approval(cap_name, lockfile.as_ref(), true)
                        .await?
                }
                _ => {
                    match self
                        .registry
                        .fetch_with_integrity(cap_name, lockfile.as_ref())
                        .await?
                    {
                        MetadataOrApproval::Metadata(m) => m,
                        MetadataOrApproval::Approval(approval) => {
                            if matches!(continuation, Some(c) if !c.approved) {
                                return Err(LoaderError::PermissionDenied(format!(
                                    "integrity change for {} was rejected",
                                    cap_name
                                )));
                            }
                            return Ok(LoadOutcome::Approval(approval));
                        }
                    }
                }
            },
            None => self.registry.fetch(cap_name).await?,
        };

        self.finish_load(cap_name, requested, metadata, continuation, true)
            .await
    }

    async fn call_inner(
        &self,
        tool_id: &str,
        args: Value,
        continuation: Option<&Continuation>,
        chain: &[String],
    ) -> LoaderResult<CallOutcome> {
        let tool = ToolId::parse(tool_id)?;
        let handle = match self.load(tool_id, continuation).await? {
            LoadOutcome::Ready(handle) => handle,
            LoadOutcome::Approval(approval) => return Ok(CallOutcome::Approval(approval)),
        };
        self.dispatch(&handle, &tool, args, continuation, chain).await
    }

    async fn finish_load(
        &self,
        cache_key: &str,
        requested: &str,
        metadata: CapabilityMetadata,
        continuation: Option<&Continuation>,
        verify_integrity: bool,
    ) -> LoaderResult<LoadOutcome> {
        let force_install = matches!(continuation, Some(c) if c.approved);
        if matches!(continuation, Some(c) if !c.approved) {
            // Denial of a pending approval never degrades into proceeding.
            for dep in &metadata.dependencies {
                if !self.state.is_satisfied(dep).await {
                    return Err(LoaderError::PermissionDenied(format!(
                        "approval for {} (dependency {}) was denied",
                        requested, dep.name
                    )));
                }
            }
        }

        for dep in &metadata.dependencies {
            match self
                .installer
                .ensure_dependency(dep, force_install, requested)
                .await?
            {
                EnsureOutcome::Satisfied => {}
                EnsureOutcome::Approval(approval) => {
                    debug!(capability = %metadata.name, dependency = %dep.name, "load paused for approval");
                    return Ok(LoadOutcome::Approval(approval));
                }
            }
        }

        if let Some(install) = &metadata.install {
            let check = check_required_keys(&install.env_vars);
            if !check.all_present() {
                return Ok(LoadOutcome::Approval(api_key_approval(
                    &check,
                    &metadata.name,
                )));
            }
        }

        let handle = Arc::new(CapabilityHandle {
            metadata: Arc::new(metadata),
            verify_integrity,
        });
        self.handles
            .write()
            .await
            .insert(cache_key.to_string(), Arc::clone(&handle));
        Ok(LoadOutcome::Ready(handle))
    }

    /// Strict three-way permission evaluation for a tool about to execute,
    /// before any side effect. Returns an approval shape for `ask` with no
    /// continuation, so the caller can present one combined prompt.
    async fn evaluate_permission(
        &self,
        tool: &ToolId,
        handle: &CapabilityHandle,
        continuation: Option<&Continuation>,
    ) -> LoaderResult<Option<ApprovalRequired>> {
        let tool_id = tool.to_string();
        if self.session_approvals.read().await.contains(&tool_id) {
            return Ok(None);
        }
        match check_permission(&tool_id, &self.config.policy) {
            PermissionDecision::Denied => Err(LoaderError::PermissionDenied(tool_id)),
            PermissionDecision::Allowed => {
                self.approve_tool_for_session(&tool_id).await;
                Ok(None)
            }
            PermissionDecision::Ask => match continuation {
                Some(c) if c.approved => {
                    self.approve_tool_for_session(&tool_id).await;
                    Ok(None)
                }
                Some(_) => Err(LoaderError::PermissionDenied(format!(
                    "approval for {} was denied",
                    tool_id
                ))),
                None => {
                    // Compute whether granting would additionally install, so
                    // the user sees one prompt rather than two.
                    let mut needs_installation = false;
                    for dep in &handle.metadata.dependencies {
                        if !self.state.is_satisfied(dep).await {
                            needs_installation = true;
                            break;
                        }
                    }
                    let dep_for_prompt = handle
                        .metadata
                        .dependencies
                        .iter()
                        .find(|d| d.name == tool.namespace)
                        .or_else(|| handle.metadata.dependencies.first())
                        .cloned();
                    Ok(Some(ApprovalRequired::dependency_approval(
                        dep_for_prompt,
                        format!("run tool {}", tool_id),
                        needs_installation,
                    )))
                }
            },
        }
    }

    async fn dispatch(
        &self,
        handle: &Arc<CapabilityHandle>,
        tool: &ToolId,
        args: Value,
        continuation: Option<&Continuation>,
        chain: &[String],
    ) -> LoaderResult<CallOutcome> {
        // An action the capability never declared is a caller mistake, not
        // something to prompt the user about.
        if !handle.metadata.tools.is_empty() && !handle.metadata.tools.contains(&tool.action) {
            return Err(LoaderError::UnknownMethod(tool.to_string()));
        }

        if let Some(approval) = self.evaluate_permission(tool, handle, continuation).await? {
            return Ok(CallOutcome::Approval(approval));
        }

        let result = match handle.metadata.kind {
            ExecutionKind::SandboxedCode => {
                self.execute_sandbox(handle, tool, args, chain).await?
            }
            ExecutionKind::Subprocess => {
                let dep = handle.metadata.dependencies.first().ok_or_else(|| {
                    LoaderError::SpawnFailure(format!(
                        "{}: subprocess capability declares no dependency",
                        handle.metadata.name
                    ))
                })?;
                // The capability's own tool names are not namespace-prefixed
                // when forwarded; only the loader's name carries the namespace.
                self.subprocesses
                    .call_tool(dep, &tool.action, args)
                    .await?
            }
            ExecutionKind::NetworkForward => {
                let url = handle.metadata.forward_url.as_deref().ok_or_else(|| {
                    LoaderError::ForwardFailure(format!(
                        "{}: no forward target configured",
                        handle.metadata.name
                    ))
                })?;
                let headers = resolve_header_templates(&handle.metadata.headers)?;
                forward_call(&self.http, url, &tool.to_string(), args, &headers).await?
            }
        };
        Ok(CallOutcome::Completed(result))
    }

    async fn execute_sandbox(
        &self,
        handle: &Arc<CapabilityHandle>,
        tool: &ToolId,
        args: Value,
        chain: &[String],
    ) -> LoaderResult<Value> {
        let Some(loader) = self.self_ref.upgrade() else {
            return Err(LoaderError::SandboxFailure(
                "loader is shutting down".to_string(),
            ));
        };
        let code = self.fetch_code(handle).await?;
        let collector = Arc::new(TraceCollector::new());
        let mut chain = chain.to_vec();
        chain.push(handle.metadata.name.clone());
        let nested: Arc<dyn HostCall> = Arc::new(NestedRouter {
            loader,
            metadata: Arc::clone(&handle.metadata),
            chain,
        });
        let host = Arc::new(TracedHost::new(nested, Arc::clone(&collector)));

        debug!(capability = %handle.metadata.name, action = %tool.action, "executing in sandbox");
        let result = self.sandbox.execute(&code, args, host).await;

        // Hand the accumulated trace to the sync collaborator without ever
        // blocking the caller's result on delivery.
        let entries = collector.take();
        if let Some(sink) = &self.trace_sink {
            if !entries.is_empty() {
                let sink = Arc::clone(sink);
                let capability = handle.metadata.name.clone();
                tokio::spawn(async move {
                    sink.deliver(&capability, entries).await;
                });
            }
        }
        result
    }

    /// Fetch raw capability code, once per name. Verifies the declared
    /// content digest unless the handle came through the FQDN path.
    async fn fetch_code(&self, handle: &CapabilityHandle) -> LoaderResult<String> {
        let name = &handle.metadata.name;
        if let Some(code) = self.code_cache.read().await.get(name) {
            return Ok(code.clone());
        }

        let url = handle.metadata.code_url.as_deref().ok_or_else(|| {
            LoaderError::MetadataFetch(format!("{}: sandboxed capability without code_url", name))
        })?;
        let code = if let Some(path) = url.strip_prefix("file://") {
            tokio::fs::read_to_string(path).await?
        } else {
            let resp = self.http.get(url).send().await?;
            if !resp.status().is_success() {
                return Err(LoaderError::MetadataFetch(format!(
                    "{}: code fetch returned {}",
                    name,
                    resp.status()
                )));
            }
            resp.text().await?
        };

        if handle.verify_integrity {
            if let Some(digest) = &handle.metadata.integrity {
                verify_content(name, digest, code.as_bytes())?;
            }
        }

        self.code_cache
            .write()
            .await
            .insert(name.clone(), code.clone());
        Ok(code)
    }

    /// Nested call routing, re-entered from sandboxed code through the host
    /// hook. Re-applies the full permission check before any routing, and
    /// rejects calls back into any capability already on the current chain.
    async fn route_nested(
        &self,
        metadata: &CapabilityMetadata,
        chain: &[String],
        namespace: &str,
        action: &str,
        args: Value,
    ) -> LoaderResult<Value> {
        if namespace.is_empty() || action.is_empty() {
            return Err(LoaderError::InvalidIdentifier(format!(
                "{}:{}",
                namespace, action
            )));
        }
        if chain.iter().any(|name| name == namespace) {
            return Err(LoaderError::CyclicLoad(namespace.to_string()));
        }
        let tool_id = format!("{}:{}", namespace, action);

        if !self.session_approvals.read().await.contains(&tool_id) {
            match check_permission(&tool_id, &self.config.policy) {
                PermissionDecision::Denied => {
                    return Err(LoaderError::PermissionDenied(tool_id));
                }
                PermissionDecision::Ask => {
                    // A running sandbox cannot pause for approval; fail closed
                    // and let the caller pre-approve for the session.
                    return Err(LoaderError::PermissionDenied(format!(
                        "nested call to {} requires approval",
                        tool_id
                    )));
                }
                PermissionDecision::Allowed => {
                    self.approve_tool_for_session(&tool_id).await;
                }
            }
        }

        // Declared subprocess dependencies are served directly.
        if let Some(dep) = metadata
            .dependencies
            .iter()
            .find(|d| d.name == namespace)
        {
            return self.call_dependency_tool(dep, &tool_id, action, args).await;
        }

        match self.routing.classify(&tool_id).await? {
            RoutingHint::Remote => {
                let token_env = &self.config.remote_token_env;
                let token = match std::env::var(token_env) {
                    Ok(v) if !v.trim().is_empty() => v,
                    // A missing token is a configuration error, distinct from
                    // a permission denial.
                    _ => {
                        return Err(LoaderError::MissingEnvVars {
                            keys: vec![token_env.clone()],
                        })
                    }
                };
                let headers = vec![("Authorization".to_string(), format!("Bearer {}", token))];
                forward_call(
                    &self.http,
                    &self.config.remote_gateway_url,
                    &tool_id,
                    args,
                    &headers,
                )
                .await
            }
            RoutingHint::Local => match self.call_inner(&tool_id, args, None, chain).await? {
                CallOutcome::Completed(value) => Ok(value),
                CallOutcome::Approval(approval) => Err(LoaderError::PermissionDenied(format!(
                    "nested call to {} requires approval: {}",
                    tool_id, approval
                ))),
            },
        }
    }

    async fn call_dependency_tool(
        &self,
        dep: &McpDependency,
        tool_id: &str,
        action: &str,
        args: Value,
    ) -> LoaderResult<Value> {
        match self.installer.ensure_dependency(dep, false, tool_id).await? {
            EnsureOutcome::Satisfied => self.subprocesses.call_tool(dep, action, args).await,
            EnsureOutcome::Approval(approval) => {
                warn!(dependency = %dep.name, "nested call blocked pending approval");
                Err(LoaderError::PermissionDenied(format!(
                    "nested call to {} requires approval: {}",
                    tool_id, approval
                )))
            }
        }
    }
}

/// The `mcp.*` proxy handed to sandboxed code: an explicit two-argument
/// dispatch back into the orchestrator's routing, not reflective lookup.
/// Carries the chain of capability names leading to this sandbox so cycles
/// are caught at the call site.
struct NestedRouter {
    loader: Arc<CapabilityLoader>,
    metadata: Arc<CapabilityMetadata>,
    chain: Vec<String>,
}

#[async_trait]
impl HostCall for NestedRouter {
    async fn call(&self, namespace: &str, action: &str, args: Value) -> LoaderResult<Value> {
        self.loader
            .route_nested(&self.metadata, &self.chain, namespace, action, args)
            .await
    }
}
