//! Dependency state, integrity verification, and installation.

pub mod installer;
pub mod integrity;
pub mod state;

pub use installer::{DependencyInstaller, EnsureOutcome, NpmPackageRegistry, PackageRegistry};
pub use integrity::{digest_format, sha256_sri, verify_content, verify_declared, DigestFormat, PublishedIntegrity};
pub use state::DependencyState;
