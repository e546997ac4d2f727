//! # The repository collaborator
//!
//! The engines only talk to object storage through the traits in this
//! module: [`ObjectReader`] for lookups, [`Repository`] for the ref table and
//! for opening a write [`Transaction`]. A transaction is created from a
//! [`StagingArea`] holding already validated objects; nothing becomes
//! visible until [`Transaction::commit`], and dropping it discards
//! everything.

use crate::integrity::{self, Keyring, TrustPolicy};
use crate::objects::{
    is_sha256, verify_object, Commit, DetachedMetadata, FileHeader, MetadataObject, ObjectType,
};
use crate::Result;
use anyhow::{anyhow, Context};
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Read;

mod builder;
pub use builder::*;
mod local;
pub use local::*;
mod staging;
pub use staging::*;

/// Relative path of an object inside an `objects/` directory.
pub(crate) fn object_relpath(objtype: ObjectType, checksum: &str) -> Utf8PathBuf {
    let (first, rest) = checksum.split_at(2.min(checksum.len()));
    format!("{first}/{rest}.{objtype}").into()
}

/// Read access to content-addressed objects.
pub trait ObjectReader {
    /// Whether the object exists.
    fn has_object(&self, objtype: ObjectType, checksum: &str) -> Result<bool>;

    /// The full canonical bytes of an object; fails with
    /// [`crate::Error::MissingObject`] when absent.
    fn read_object(&self, objtype: ObjectType, checksum: &str) -> Result<Vec<u8>>;

    /// A streaming reader over the canonical bytes of an object.
    fn open_object(&self, objtype: ObjectType, checksum: &str) -> Result<Box<dyn Read + Send>> {
        let buf = self.read_object(objtype, checksum)?;
        Ok(Box::new(std::io::Cursor::new(buf)))
    }

    /// Detached metadata (signatures) for a commit.
    fn read_detached_metadata(&self, commit: &str) -> Result<Option<DetachedMetadata>>;

    /// Parse the header of a file object, returning a reader positioned
    /// at its content.
    fn query_file(&self, checksum: &str) -> Result<(FileHeader, Box<dyn Read + Send>)> {
        let mut r = self.open_object(ObjectType::File, checksum)?;
        let header = FileHeader::read_from(&mut r)
            .with_context(|| format!("Reading file object {checksum}"))?;
        Ok((header, r))
    }
}

/// Load and parse a metadata object, verifying that it hashes to its name.
pub fn load<T, O>(reader: &O, checksum: &str) -> Result<T>
where
    T: MetadataObject,
    O: ObjectReader + ?Sized,
{
    let buf = reader.read_object(T::OBJTYPE, checksum)?;
    verify_object(T::OBJTYPE, checksum, &buf)?;
    T::from_bytes(&buf)
}

/// Counters describing what a transaction wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// New file objects
    pub content_written: u64,
    /// New metadata objects (commit, dirtree, dirmeta)
    pub metadata_written: u64,
    /// Objects that were already present and not rewritten
    pub skipped: u64,
}

impl WriteStats {
    /// Total number of objects written.
    pub fn total_written(&self) -> u64 {
        self.content_written + self.metadata_written
    }
}

/// A parsed commit together with its detached signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMetadata {
    /// The commit checksum
    pub checksum: String,
    /// The parsed commit object
    pub commit: Commit,
    /// Detached signatures over the checksum
    pub signatures: Vec<Vec<u8>>,
}

impl CommitMetadata {
    /// Parent commit, if any.
    pub fn parent(&self) -> Option<&str> {
        self.commit.parent.as_deref()
    }

    /// Root directory tree.
    pub fn root_tree(&self) -> &str {
        &self.commit.root_tree
    }

    /// Version string from the commit metadata.
    pub fn version(&self) -> Option<&str> {
        self.commit.version()
    }

    /// Whether the commit carries at least one signature.
    pub fn is_signed(&self) -> bool {
        !self.signatures.is_empty()
    }
}

/// An open write transaction; reads see both staged and existing objects.
///
/// Dropping a transaction without calling [`Transaction::commit`] discards
/// the staged objects and leaves the repository untouched.
pub trait Transaction: ObjectReader + Debug + Send {
    /// What committing would write.
    fn stats(&self) -> WriteStats;

    /// Publish every staged object.
    fn commit(self: Box<Self>) -> Result<WriteStats>;
}

/// An object store with a ref table.
pub trait Repository: ObjectReader + Debug + Send + Sync {
    /// Hand a set of validated objects to the store as one transaction.
    /// Blocks while another transaction is open on the same repository.
    fn write_objects(&self, objects: StagingArea) -> Result<Box<dyn Transaction>>;

    /// The commit for a ref, if the ref exists.
    fn read_ref(&self, name: &str) -> Result<Option<String>>;

    /// Point `name` at `checksum`; the update is atomic.
    fn update_ref(&self, name: &str, checksum: &str) -> Result<()>;

    /// Check that `name` can be updated, without changing anything.
    fn check_ref(&self, name: &str) -> Result<()> {
        validate_ref(name)
    }

    /// A new empty area for staging objects, ideally on the same filesystem
    /// as the object store.
    fn new_staging_area(&self) -> Result<StagingArea> {
        StagingArea::new(tempfile::tempdir()?)
    }

    /// Parse a commit and its signatures.
    fn read_commit(&self, checksum: &str) -> Result<CommitMetadata> {
        let commit: Commit = load(self, checksum)?;
        let signatures = match self.read_detached_metadata(checksum)? {
            Some(m) => m.signatures()?,
            None => Vec::new(),
        };
        Ok(CommitMetadata {
            checksum: checksum.to_string(),
            commit,
            signatures,
        })
    }

    /// Resolve a commit checksum or ref name to a commit checksum.
    fn resolve_rev(&self, rev: &str) -> Result<String> {
        if is_sha256(rev) && self.has_object(ObjectType::Commit, rev)? {
            return Ok(rev.to_string());
        }
        self.read_ref(rev)?
            .ok_or_else(|| anyhow!("Ref {rev} not found"))
    }

    /// Verify that a commit carries a signature from `keyring`.
    fn verify_signature(&self, commit: &str, keyring: &Keyring) -> Result<()> {
        integrity::verify_commit(self, commit, keyring, TrustPolicy::SignatureRequired)?;
        Ok(())
    }
}

/// Validate a ref name: slash separated components of
/// `[A-Za-z0-9._-]`, none of them empty, `.` or `..`.
pub fn validate_ref(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.split('/').all(|c| {
            !(c.is_empty() || c == "." || c == "..")
                && c.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        });
    if !valid {
        return Err(anyhow!("Invalid ref name {name:?}"));
    }
    Ok(())
}

/// Set of `(type, checksum)` pairs in a stable order.
pub(crate) type ObjectSet = BTreeMap<(ObjectType, String), Utf8PathBuf>;

/// Move a file, copying across filesystems.
pub(crate) fn move_file(src: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
    }
    match std::fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(rustix::io::Errno::XDEV.raw_os_error()) => {
            std::fs::copy(src, dest).with_context(|| format!("Copying {src} to {dest}"))?;
            std::fs::remove_file(src).with_context(|| format!("Removing {src}"))?;
            Ok(())
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("Renaming {src} to {dest}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{quickcheck, TestResult};

    #[test]
    fn test_object_relpath() {
        let c = "a86d80a3e9ff77c2e3144c787b7769b300f91ffd770221aac27bab854960b964";
        assert_eq!(
            object_relpath(ObjectType::DirTree, c).as_str(),
            "a8/6d80a3e9ff77c2e3144c787b7769b300f91ffd770221aac27bab854960b964.dirtree"
        );
    }

    #[test]
    fn test_validate_ref() {
        for ok in ["main", "exampleos/x86_64/stable", "a.b-c_d"] {
            validate_ref(ok).unwrap();
        }
        for bad in ["", "/main", "main/", "a//b", "../x", "a/./b", "with space", "a:b"] {
            assert!(validate_ref(bad).is_err(), "{bad}");
        }
    }

    fn accepted_ref_stays_relative(s: String) -> TestResult {
        if validate_ref(&s).is_err() {
            return TestResult::discard();
        }
        let p = Utf8Path::new(&s);
        TestResult::from_bool(
            p.is_relative()
                && p.components()
                    .all(|c| matches!(c, camino::Utf8Component::Normal(_))),
        )
    }

    #[test]
    fn qcheck_validate_ref() {
        quickcheck(accepted_ref_stays_relative as fn(String) -> TestResult);
    }
}
