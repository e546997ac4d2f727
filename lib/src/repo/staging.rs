use super::{move_file, object_relpath, ObjectReader, ObjectSet};
use crate::integrity::Sha256Writer;
use crate::objects::{DetachedMetadata, ObjectType};
use crate::Result;
use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeMap;
use std::io::Read;
use tempfile::TempDir;

/// A transient holding area for objects that have been validated but are
/// not yet part of any repository.
///
/// Every object is checked to hash to its name as it is written here.
/// The backing directory is removed when the area is dropped.
#[derive(Debug)]
pub struct StagingArea {
    dir: TempDir,
    path: Utf8PathBuf,
    objects: ObjectSet,
    detached: BTreeMap<String, DetachedMetadata>,
}

impl StagingArea {
    /// Stage objects below an (empty) temporary directory.
    pub fn new(dir: TempDir) -> Result<Self> {
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf())?;
        Ok(Self {
            dir,
            path,
            objects: Default::default(),
            detached: Default::default(),
        })
    }

    /// The backing directory.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// A sibling area, on the same filesystem.
    pub fn new_child(&self) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("layer-")
            .tempdir_in(self.dir.path())?;
        Self::new(dir)
    }

    /// Number of staged objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.detached.is_empty()
    }

    /// Whether the object is staged.
    pub fn contains(&self, objtype: ObjectType, checksum: &str) -> bool {
        self.objects
            .contains_key(&(objtype, checksum.to_string()))
    }

    /// Staged objects in `(type, checksum)` order.
    pub fn objects(&self) -> impl Iterator<Item = (ObjectType, &str)> + '_ {
        self.objects.keys().map(|(t, c)| (*t, c.as_str()))
    }

    /// Checksums of staged commit objects.
    pub fn commits(&self) -> impl Iterator<Item = &str> + '_ {
        self.objects()
            .filter(|(t, _)| *t == ObjectType::Commit)
            .map(|(_, c)| c)
    }

    /// Stream an object into the area; fails with
    /// [`crate::Error::ObjectChecksumMismatch`] if it does not hash to
    /// `checksum`. Returns the number of bytes written.
    pub fn write_object(
        &mut self,
        objtype: ObjectType,
        checksum: &str,
        src: impl Read,
    ) -> Result<u64> {
        self.stage(objtype, Some(checksum), src).map(|r| r.1)
    }

    /// Stream an object of not yet known checksum into the area, returning
    /// its checksum.
    pub fn add_object(&mut self, objtype: ObjectType, src: impl Read) -> Result<String> {
        self.stage(objtype, None, src).map(|r| r.0)
    }

    fn stage(
        &mut self,
        objtype: ObjectType,
        expected: Option<&str>,
        mut src: impl Read,
    ) -> Result<(String, u64)> {
        let tmpf = tempfile::NamedTempFile::new_in(&self.path)?;
        let mut w = Sha256Writer::new(std::io::BufWriter::new(tmpf))?;
        let n = std::io::copy(&mut src, &mut w)
            .with_context(|| format!("Staging {objtype} {}", expected.unwrap_or_default()))?;
        let (w, actual) = w.finish()?;
        if let Some(checksum) = expected {
            if actual != checksum {
                return Err(crate::Error::ObjectChecksumMismatch {
                    objtype,
                    checksum: checksum.to_string(),
                    actual,
                }
                .into());
            }
        }
        let tmpf = w.into_inner().map_err(|e| e.into_error())?;
        let key = (objtype, actual);
        if !self.objects.contains_key(&key) {
            let dest = self
                .path
                .join("objects")
                .join(object_relpath(objtype, &key.1));
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            tmpf.persist(&dest)?;
            tracing::trace!("Staged {objtype} {}", key.1);
            self.objects.insert(key.clone(), dest);
        }
        Ok((key.1, n))
    }

    /// Write a fully buffered object.
    pub fn write_object_bytes(
        &mut self,
        objtype: ObjectType,
        checksum: &str,
        buf: &[u8],
    ) -> Result<()> {
        self.write_object(objtype, checksum, buf).map(|_| ())
    }

    /// Record detached metadata for a commit, merging signatures.
    pub fn add_detached_metadata(&mut self, commit: &str, meta: DetachedMetadata) -> Result<()> {
        let existing = self.detached.entry(commit.to_string()).or_default();
        for sig in meta.signatures()? {
            existing.add_signature(&sig);
        }
        Ok(())
    }

    /// Detached metadata for staged commits.
    pub fn detached_metadata(&self) -> impl Iterator<Item = (&str, &DetachedMetadata)> + '_ {
        self.detached.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Drop a staged object, e.g. because the repository already has it.
    pub fn remove(&mut self, objtype: ObjectType, checksum: &str) -> Result<bool> {
        match self.objects.remove(&(objtype, checksum.to_string())) {
            Some(path) => {
                std::fs::remove_file(&path).with_context(|| format!("Removing {path}"))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Move every object from `other` into this area.
    pub fn merge(&mut self, other: StagingArea) -> Result<()> {
        let StagingArea {
            dir,
            objects,
            detached,
            ..
        } = other;
        for (key, src) in objects {
            if self.objects.contains_key(&key) {
                continue;
            }
            let dest = self
                .path
                .join("objects")
                .join(object_relpath(key.0, &key.1));
            move_file(&src, &dest)?;
            self.objects.insert(key, dest);
        }
        for (commit, meta) in detached {
            self.add_detached_metadata(&commit, meta)?;
        }
        dir.close()?;
        Ok(())
    }

    /// Consume the area, yielding the staged object files. The directory
    /// holding them stays alive as long as the returned [`TempDir`].
    pub(crate) fn into_parts(self) -> (TempDir, ObjectSet, BTreeMap<String, DetachedMetadata>) {
        (self.dir, self.objects, self.detached)
    }
}

impl ObjectReader for StagingArea {
    fn has_object(&self, objtype: ObjectType, checksum: &str) -> Result<bool> {
        Ok(self.contains(objtype, checksum))
    }

    fn read_object(&self, objtype: ObjectType, checksum: &str) -> Result<Vec<u8>> {
        let path = self
            .objects
            .get(&(objtype, checksum.to_string()))
            .ok_or_else(|| crate::Error::missing(objtype, checksum))?;
        std::fs::read(path).with_context(|| format!("Reading {path}"))
    }

    fn open_object(&self, objtype: ObjectType, checksum: &str) -> Result<Box<dyn Read + Send>> {
        let path = self
            .objects
            .get(&(objtype, checksum.to_string()))
            .ok_or_else(|| crate::Error::missing(objtype, checksum))?;
        let f = std::fs::File::open(path).with_context(|| format!("Opening {path}"))?;
        Ok(Box::new(std::io::BufReader::new(f)))
    }

    fn read_detached_metadata(&self, commit: &str) -> Result<Option<DetachedMetadata>> {
        Ok(self.detached.get(commit).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::sha256_hex;

    #[test]
    fn test_staging_verify_and_merge() -> Result<()> {
        let mut a = StagingArea::new(tempfile::tempdir()?)?;
        let data = b"{}";
        let sum = sha256_hex(data)?;
        a.write_object_bytes(ObjectType::DirTree, &sum, data)?;
        assert!(a.contains(ObjectType::DirTree, &sum));
        assert_eq!(a.read_object(ObjectType::DirTree, &sum)?, data);

        let e = a
            .write_object_bytes(ObjectType::DirMeta, &sum, b"{ }")
            .unwrap_err();
        assert!(matches!(
            crate::Error::find(&e),
            Some(crate::Error::ObjectChecksumMismatch { .. })
        ));
        assert_eq!(a.len(), 1);

        let mut b = a.new_child()?;
        let other = b"[]";
        let other_sum = sha256_hex(other)?;
        b.write_object_bytes(ObjectType::DirMeta, &other_sum, other)?;
        b.write_object_bytes(ObjectType::DirTree, &sum, data)?;
        let mut meta = DetachedMetadata::default();
        meta.add_signature(b"sig");
        b.add_detached_metadata(&sum, meta)?;
        a.merge(b)?;
        assert_eq!(a.len(), 2);
        assert_eq!(a.read_object(ObjectType::DirMeta, &other_sum)?, other);
        assert!(a.read_detached_metadata(&sum)?.is_some());

        assert!(a.remove(ObjectType::DirMeta, &other_sum)?);
        assert!(!a.remove(ObjectType::DirMeta, &other_sum)?);
        let e = a.read_object(ObjectType::DirMeta, &other_sum).unwrap_err();
        assert!(matches!(
            crate::Error::find(&e),
            Some(crate::Error::MissingObject { .. })
        ));
        Ok(())
    }
}
