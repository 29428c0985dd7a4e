//! Collaborator seams for the metadata registry and lockfile manager.
//!
//! The loader treats these as opaque network collaborators: it consumes their
//! contracts and passes integrity-approval shapes through unmodified.

use async_trait::async_trait;

use crate::error::LoaderResult;
use crate::types::{ApprovalRequired, CapabilityMetadata};

/// Result of an integrity-checked fetch: either the metadata, or the
/// integrity-approval shape produced by the lockfile manager on a digest
/// mismatch, passed straight through to the loader's caller.
#[derive(Debug, Clone)]
pub enum MetadataOrApproval {
    Metadata(CapabilityMetadata),
    Approval(ApprovalRequired),
}

/// Thin fetch-and-cache wrapper around the remote metadata registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn fetch(&self, name: &str) -> LoaderResult<CapabilityMetadata>;

    /// Identical contract but keyed by the fully-resolved identifier; the
    /// caller has already performed resolution and integrity checking.
    async fn fetch_by_fqdn(&self, fqdn: &str) -> LoaderResult<CapabilityMetadata>;

    async fn fetch_with_integrity(
        &self,
        name: &str,
        lockfile: &dyn LockfileManager,
    ) -> LoaderResult<MetadataOrApproval>;

    async fn continue_fetch_with_approval(
        &self,
        name: &str,
        lockfile: &dyn LockfileManager,
        approved: bool,
    ) -> LoaderResult<CapabilityMetadata>;
}

/// Lockfile manager contract. Its presence gates whether integrity-checked
/// fetch is used at all.
#[async_trait]
pub trait LockfileManager: Send + Sync {
    async fn recorded_digest(&self, name: &str) -> LoaderResult<Option<String>>;
    async fn record_digest(&self, name: &str, digest: &str) -> LoaderResult<()>;
}
