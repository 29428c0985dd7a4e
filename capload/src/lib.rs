//! capload: client-side loading and execution of remotely-described tool
//! capabilities.
//!
//! A capability is named metadata resolved from a registry: which tools it
//! exposes, what it depends on, and which of three backends executes it
//! (sandboxed code, a long-lived stdio subprocess, or a network forward).
//! The loader turns names into ready execution handles while enforcing two
//! gates before anything runs or installs: a pattern-based permission policy
//! with human-in-the-loop approval, and supply-chain integrity verification
//! of every dependency against its registry-published digest.
//!
//! Entry point is [`CapabilityLoader`], built through
//! [`CapabilityLoaderBuilder`] with the host's collaborators (registry
//! client, sandbox runtime, routing directory, optional lockfile and trace
//! sink). Operations that need a human decision return an
//! [`ApprovalRequired`] value instead of erroring; callers resume them with
//! a [`Continuation`].

pub mod backoff;
pub mod binaries;
pub mod config;
pub mod deps;
pub mod error;
pub mod forward;
pub mod loader;
pub mod permissions;
pub mod registry;
pub mod sandbox;
pub mod subprocess;
pub mod types;

pub use config::LoaderConfig;
pub use error::{LoaderError, LoaderResult};
pub use loader::{
    CallOutcome, CapabilityHandle, CapabilityLoader, CapabilityLoaderBuilder, LoadOutcome,
    RoutingDirectory,
};
pub use permissions::{check_permission, PermissionDecision, PermissionPolicy};
pub use registry::{LockfileManager, MetadataOrApproval, RegistryClient};
pub use sandbox::{HostCall, SandboxRuntime, ToolTraceEntry, TraceSink};
pub use types::{
    ApprovalRequired, CapabilityMetadata, Continuation, DependencyKind, ExecutionKind,
    InstallSpec, InstalledDep, McpDependency, RoutingHint, ToolId,
};
