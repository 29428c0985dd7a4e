//! Supply-chain integrity verification.
//!
//! Before anything is written to disk or an install command runs, the locally
//! declared digest is compared against the package registry's published
//! metadata. The comparison format is selected by the digest's string prefix:
//! SRI-style (`sha512-` / `sha256-` / `sha1-`) against the published
//! `integrity` field, bare 40-hex legacy values against the published
//! `shasum`. Unknown formats are unverifiable and pass only in trusted mode.

use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{LoaderError, LoaderResult};

/// Digest format selected by string prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestFormat {
    /// Subresource-integrity style: `<algo>-<base64>`.
    Sri,
    /// Bare 40-character hex sha1, the legacy registry shasum format.
    LegacyHex,
    Unknown,
}

const SRI_PREFIXES: [&str; 3] = ["sha512-", "sha256-", "sha1-"];

pub fn digest_format(digest: &str) -> DigestFormat {
    if SRI_PREFIXES.iter().any(|p| digest.starts_with(p)) {
        return DigestFormat::Sri;
    }
    if digest.len() == 40 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return DigestFormat::LegacyHex;
    }
    DigestFormat::Unknown
}

/// Integrity metadata published by the package registry for one exact version.
#[derive(Debug, Clone, Default)]
pub struct PublishedIntegrity {
    /// SRI string(s), possibly space-separated for multiple algorithms.
    pub integrity: Option<String>,
    /// Legacy single-hash hex digest.
    pub shasum: Option<String>,
}

/// Compare the declared digest against the registry's published metadata.
///
/// Returns the verified digest on success so Dependency State records ground
/// truth rather than the declaration. A mismatch is an integrity violation
/// and must not proceed to install.
pub fn verify_declared(
    name: &str,
    declared: &str,
    published: &PublishedIntegrity,
    trusted_mode: bool,
) -> LoaderResult<String> {
    match digest_format(declared) {
        DigestFormat::Sri => {
            let Some(integrity) = published.integrity.as_deref() else {
                return Err(LoaderError::IntegrityViolation(format!(
                    "{}: registry published no integrity field to verify '{}' against",
                    name, declared
                )));
            };
            if integrity.split_whitespace().any(|entry| entry == declared) {
                Ok(declared.to_string())
            } else {
                Err(LoaderError::IntegrityViolation(format!(
                    "{}: declared digest {} does not match registry integrity {}",
                    name, declared, integrity
                )))
            }
        }
        DigestFormat::LegacyHex => {
            let Some(shasum) = published.shasum.as_deref() else {
                return Err(LoaderError::IntegrityViolation(format!(
                    "{}: registry published no shasum to verify legacy digest against",
                    name
                )));
            };
            if shasum.eq_ignore_ascii_case(declared) {
                Ok(shasum.to_lowercase())
            } else {
                Err(LoaderError::IntegrityViolation(format!(
                    "{}: declared shasum {} does not match registry shasum {}",
                    name, declared, shasum
                )))
            }
        }
        DigestFormat::Unknown => {
            if trusted_mode {
                warn!(
                    package = name,
                    digest = declared,
                    "unverifiable digest format, allowed by trusted mode"
                );
                Ok(declared.to_string())
            } else {
                Err(LoaderError::IntegrityViolation(format!(
                    "{}: unverifiable digest format '{}'",
                    name, declared
                )))
            }
        }
    }
}

/// SRI sha256 digest of raw content bytes, for verifying fetched code.
pub fn sha256_sri(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    format!(
        "sha256-{}",
        base64::engine::general_purpose::STANDARD.encode(hash)
    )
}

/// Verify fetched content bytes against a declared content digest.
pub fn verify_content(name: &str, declared: &str, bytes: &[u8]) -> LoaderResult<()> {
    let actual = sha256_sri(bytes);
    if actual == declared {
        Ok(())
    } else {
        Err(LoaderError::IntegrityViolation(format!(
            "{}: fetched content digest {} does not match declared {}",
            name, actual, declared
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_dispatch() {
        assert_eq!(digest_format("sha512-AAA"), DigestFormat::Sri);
        assert_eq!(digest_format("sha256-AAA"), DigestFormat::Sri);
        assert_eq!(
            digest_format("0123456789abcdef0123456789abcdef01234567"),
            DigestFormat::LegacyHex
        );
        assert_eq!(digest_format("md5-zzz"), DigestFormat::Unknown);
        assert_eq!(digest_format("deadbeef"), DigestFormat::Unknown);
    }

    #[test]
    fn test_sri_match_among_multiple_published() {
        let published = PublishedIntegrity {
            integrity: Some("sha512-XYZ sha256-AAA".to_string()),
            shasum: None,
        };
        let verified = verify_declared("memory", "sha256-AAA", &published, false).unwrap();
        assert_eq!(verified, "sha256-AAA");
    }

    #[test]
    fn test_sri_mismatch_is_violation() {
        let published = PublishedIntegrity {
            integrity: Some("sha256-BBB".to_string()),
            shasum: None,
        };
        let err = verify_declared("memory", "sha256-AAA", &published, false).unwrap_err();
        assert!(matches!(err, LoaderError::IntegrityViolation(_)));
    }

    #[test]
    fn test_legacy_shasum_comparison() {
        let published = PublishedIntegrity {
            integrity: None,
            shasum: Some("0123456789ABCDEF0123456789abcdef01234567".to_string()),
        };
        let verified = verify_declared(
            "memory",
            "0123456789abcdef0123456789abcdef01234567",
            &published,
            false,
        )
        .unwrap();
        assert_eq!(verified, "0123456789abcdef0123456789abcdef01234567");
    }

    #[test]
    fn test_unknown_format_only_passes_in_trusted_mode() {
        let published = PublishedIntegrity::default();
        assert!(verify_declared("memory", "md5-zzz", &published, false).is_err());
        assert_eq!(
            verify_declared("memory", "md5-zzz", &published, true).unwrap(),
            "md5-zzz"
        );
    }

    #[test]
    fn test_content_verification() {
        let code = b"export function run() {}";
        let digest = sha256_sri(code);
        assert!(verify_content("cap", &digest, code).is_ok());
        assert!(verify_content("cap", &digest, b"tampered").is_err());
    }
}
