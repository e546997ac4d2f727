//! Typed failure kinds surfaced by the export and import engines.
//!
//! Most code in this crate returns [`anyhow::Result`]; the errors here are
//! the ones a caller needs to tell apart (for example to pick a process
//! exit code). They survive being wrapped in additional context, see
//! [`Error::find`].

use crate::objects::ObjectType;
use thiserror::Error;

/// A verification or local-store failure with a stable identity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The bytes of a blob do not hash to the digest the manifest declared.
    #[error("Blob digest mismatch: expected {expected}, found {actual}")]
    BlobDigestMismatch {
        /// The declared digest (`sha256:...`)
        expected: String,
        /// The digest of the bytes actually received
        actual: String,
    },
    /// A repository object does not hash to its name.
    #[error("Corrupted {objtype} object {checksum}: content checksum is {actual}")]
    ObjectChecksumMismatch {
        /// Kind of the object
        objtype: ObjectType,
        /// The checksum the object was named with
        checksum: String,
        /// The checksum computed over its canonical bytes
        actual: String,
    },
    /// The commit reconstructed from the layers is not the one the image names.
    #[error("Commit mismatch: image references {expected}, layers contain {actual}")]
    CommitMismatch {
        /// Commit named by the manifest annotation
        expected: String,
        /// Commit found in (or absent from) the layers
        actual: String,
    },
    /// The commit signature could not be verified.
    #[error("Signature verification failed for commit {commit}: {reason}")]
    SignatureInvalid {
        /// The commit checksum
        commit: String,
        /// Human readable failure reason
        reason: String,
    },
    /// Export was asked to require a signature, but the commit has none.
    #[error("Commit {commit} is not signed, but a signature is required")]
    UnsignedCommit {
        /// The commit checksum
        commit: String,
    },
    /// A referenced object is not present.
    #[error("Missing {objtype} object {checksum}")]
    MissingObject {
        /// Kind of the object
        objtype: ObjectType,
        /// Object checksum
        checksum: String,
    },
    /// The repository write transaction could not be opened or published.
    #[error("Repository transaction failed: {0}")]
    Transaction(String),
}

impl Error {
    /// Find the first typed error in the chain of `e`.
    pub fn find(e: &anyhow::Error) -> Option<&Error> {
        e.chain().find_map(|c| c.downcast_ref::<Error>())
    }

    /// The process exit code for this failure kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::BlobDigestMismatch { .. } => 10,
            Error::ObjectChecksumMismatch { .. } => 11,
            Error::CommitMismatch { .. } => 12,
            Error::SignatureInvalid { .. } => 13,
            Error::UnsignedCommit { .. } => 14,
            Error::MissingObject { .. } => 15,
            Error::Transaction(_) => 16,
        }
    }

    pub(crate) fn missing(objtype: ObjectType, checksum: impl Into<String>) -> Self {
        Error::MissingObject {
            objtype,
            checksum: checksum.into(),
        }
    }
}

/// Map an arbitrary error to a process exit code; untyped failures
/// (I/O, parse errors and the like) map to 1.
pub fn exit_code(e: &anyhow::Error) -> i32 {
    Error::find(e).map(Error::exit_code).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_find_through_context() {
        let r: anyhow::Result<()> = Err(Error::missing(ObjectType::DirTree, "ab".repeat(32)).into());
        let e = r.context("Walking tree").context("Exporting").unwrap_err();
        assert!(matches!(
            Error::find(&e),
            Some(Error::MissingObject {
                objtype: ObjectType::DirTree,
                ..
            })
        ));
        assert_eq!(exit_code(&e), 15);
        assert!(format!("{e:#}").contains("Missing dirtree object"));
    }

    #[test]
    fn test_untyped() {
        let e = anyhow::anyhow!("Reading config");
        assert!(Error::find(&e).is_none());
        assert_eq!(exit_code(&e), 1);
    }

    #[test]
    fn test_exit_codes_distinct() {
        let all = [
            Error::BlobDigestMismatch {
                expected: String::new(),
                actual: String::new(),
            },
            Error::ObjectChecksumMismatch {
                objtype: ObjectType::File,
                checksum: String::new(),
                actual: String::new(),
            },
            Error::CommitMismatch {
                expected: String::new(),
                actual: String::new(),
            },
            Error::SignatureInvalid {
                commit: String::new(),
                reason: String::new(),
            },
            Error::UnsignedCommit {
                commit: String::new(),
            },
            Error::missing(ObjectType::File, ""),
            Error::Transaction(String::new()),
        ];
        let mut codes: Vec<_> = all.iter().map(Error::exit_code).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
        assert!(!codes.contains(&0) && !codes.contains(&1));
    }
}
