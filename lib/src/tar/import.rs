//! Unpack a layer tar stream into a staging area

use super::{OBJECTS_DIR, XATTRS_EXTENSION};
use crate::objects::{
    is_sha256, DetachedMetadata, FileHeader, ObjectType, Xattrs, MAX_METADATA_SIZE,
    MAX_XATTR_SIZE,
};
use crate::repo::{ObjectReader, StagingArea};
use crate::Result;
use anyhow::{anyhow, ensure, Context};
use camino::{Utf8Path, Utf8PathBuf};
use std::io::Read;

/// What unpacking a single layer did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LayerImportStats {
    /// Objects validated and staged
    pub staged: u64,
    /// Objects already present in the repository, not staged
    pub skipped: u64,
    /// Commit objects carried by the layer
    pub commits: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum MemberKind {
    Object(ObjectType),
    Xattrs,
}

/// Split a member path into checksum and kind.
fn parse_object_entry_path(path: &Utf8Path) -> Result<(String, MemberKind)> {
    let rel = path
        .strip_prefix(OBJECTS_DIR)
        .map_err(|_| anyhow!("Unexpected path in layer: {path}"))?;
    let (parent, name) = match rel.as_str().split_once('/') {
        Some(v) => v,
        None => return Err(anyhow!("Invalid object path {path}")),
    };
    if parent.len() != 2 {
        return Err(anyhow!("Invalid checksum parent {parent}"));
    }
    let (rest, ext) = name
        .rsplit_once('.')
        .ok_or_else(|| anyhow!("Invalid objpath {path}"))?;
    let checksum = format!("{parent}{rest}");
    if !is_sha256(&checksum) {
        return Err(anyhow!("Invalid checksum in {path}"));
    }
    let kind = if ext == XATTRS_EXTENSION {
        MemberKind::Xattrs
    } else {
        MemberKind::Object(
            ObjectType::from_extension(ext)
                .ok_or_else(|| anyhow!("Invalid object type {ext}"))?,
        )
    };
    Ok((checksum, kind))
}

/// Directories may only be the objects directory, its parents and shards.
fn validate_directory(path: &Utf8Path) -> Result<()> {
    let objdir = Utf8Path::new(OBJECTS_DIR);
    if objdir.starts_with(path) {
        return Ok(());
    }
    if let Ok(shard) = path.strip_prefix(objdir) {
        let s = shard.as_str();
        if s.len() == 2 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(());
        }
    }
    Err(anyhow!("Unexpected directory in layer: {path}"))
}

fn read_bounded(entry: &mut impl Read, size: u64, limit: u64, what: &str) -> Result<Vec<u8>> {
    ensure!(size <= limit, "{what} of size {size} exceeds {limit} bytes");
    let mut buf = Vec::with_capacity(size as usize);
    entry.take(limit).read_to_end(&mut buf)?;
    Ok(buf)
}

struct LayerImporter<'a, O: ?Sized> {
    existing: &'a O,
    staging: &'a mut StagingArea,
    next_xattrs: Option<(String, Xattrs)>,
    stats: LayerImportStats,
}

impl<'a, O: ObjectReader + ?Sized> LayerImporter<'a, O> {
    fn skip(&mut self, objtype: ObjectType, checksum: &str) -> Result<bool> {
        if self.existing.has_object(objtype, checksum)? {
            tracing::trace!("Skipping existing {objtype} {checksum}");
            self.stats.skipped += 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn import_metadata<R: Read>(
        &mut self,
        entry: &mut tar::Entry<R>,
        objtype: ObjectType,
        checksum: &str,
    ) -> Result<()> {
        if objtype == ObjectType::Commit {
            self.stats.commits.push(checksum.to_string());
        }
        let size = entry.header().size()?;
        ensure!(
            size <= MAX_METADATA_SIZE,
            "Metadata object {checksum} of size {size} exceeds {MAX_METADATA_SIZE} bytes"
        );
        if objtype == ObjectType::CommitMeta {
            let buf = read_bounded(entry, size, MAX_METADATA_SIZE, "commitmeta")?;
            let meta = DetachedMetadata::from_bytes(&buf)?;
            return self.staging.add_detached_metadata(checksum, meta);
        }
        if self.skip(objtype, checksum)? {
            return Ok(());
        }
        self.staging
            .write_object(objtype, checksum, entry.take(MAX_METADATA_SIZE))?;
        self.stats.staged += 1;
        Ok(())
    }

    fn import_xattrs<R: Read>(&mut self, entry: &mut tar::Entry<R>, checksum: &str) -> Result<()> {
        let size = entry.header().size()?;
        let buf = read_bounded(entry, size, MAX_XATTR_SIZE, "xattrs")?;
        let xattrs: Xattrs = serde_json::from_slice(&buf).context("Parsing xattrs")?;
        self.next_xattrs = Some((checksum.to_string(), xattrs));
        Ok(())
    }

    fn import_content<R: Read>(&mut self, entry: &mut tar::Entry<R>, checksum: &str) -> Result<()> {
        let xattrs = match self.next_xattrs.take() {
            Some((c, x)) if c == checksum => x,
            Some((c, _)) => return Err(anyhow!("Orphaned xattrs for {c}")),
            None => Default::default(),
        };
        if self.skip(ObjectType::File, checksum)? {
            return Ok(());
        }
        let h = entry.header();
        let uid = u32::try_from(h.uid()?)?;
        let gid = u32::try_from(h.gid()?)?;
        let mode = h.mode()? & 0o7777;
        let header = match h.entry_type() {
            tar::EntryType::Regular => FileHeader {
                uid,
                gid,
                mode,
                size: entry.size(),
                symlink: None,
                xattrs,
            },
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| anyhow!("Symlink without target"))?;
                let target = target
                    .to_str()
                    .ok_or_else(|| anyhow!("Invalid non-UTF8 symlink target"))?
                    .to_string();
                FileHeader {
                    uid,
                    gid,
                    mode,
                    size: 0,
                    symlink: Some(target),
                    xattrs,
                }
            }
            o => return Err(anyhow!("Unsupported content object type {o:?}")),
        };
        let prefix = header.encode()?;
        let src = std::io::Cursor::new(prefix).chain(entry);
        self.staging.write_object(ObjectType::File, checksum, src)?;
        self.stats.staged += 1;
        Ok(())
    }

    fn import(mut self, src: impl Read) -> Result<LayerImportStats> {
        let mut archive = tar::Archive::new(src);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?;
            let path = Utf8PathBuf::try_from(path.into_owned())
                .map_err(|e| anyhow!("Invalid non-utf8 path {:?}", e.into_path_buf()))?;
            let path = match path.strip_prefix("./") {
                Ok(p) => p.to_owned(),
                Err(_) => path,
            };
            let entry_type = entry.header().entry_type();
            if entry_type == tar::EntryType::Directory {
                validate_directory(&path)?;
                continue;
            }
            let (checksum, kind) = parse_object_entry_path(&path)?;
            if let Some((c, _)) = self.next_xattrs.as_ref() {
                if kind != MemberKind::Object(ObjectType::File) {
                    return Err(anyhow!("Orphaned xattrs for {c}"));
                }
            }
            let is_regular = entry_type == tar::EntryType::Regular;
            match kind {
                MemberKind::Object(ObjectType::File) => {
                    self.import_content(&mut entry, &checksum)
                }
                _ if !is_regular => {
                    Err(anyhow!("Unexpected entry type {entry_type:?} for {path}"))
                }
                MemberKind::Object(objtype) => {
                    self.import_metadata(&mut entry, objtype, &checksum)
                }
                MemberKind::Xattrs => self.import_xattrs(&mut entry, &checksum),
            }
            .with_context(|| format!("Processing {path}"))?;
        }
        if let Some((c, _)) = self.next_xattrs {
            return Err(anyhow!("Orphaned xattrs for {c}"));
        }
        Ok(self.stats)
    }
}

/// Unpack a layer into `staging`, validating every object against its
/// name. Objects that `existing` already has are skipped.
pub fn import_layer<O: ObjectReader + ?Sized>(
    src: impl Read,
    existing: &O,
    staging: &mut StagingArea,
) -> Result<LayerImportStats> {
    let importer = LayerImporter {
        existing,
        staging,
        next_xattrs: None,
        stats: Default::default(),
    };
    let stats = importer.import(src)?;
    tracing::debug!(
        "Unpacked layer: {} staged, {} skipped",
        stats.staged,
        stats.skipped
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::{Chunking, ChunkingPolicy};
    use crate::objectindex::ObjectIndex;
    use crate::repo::{CommitBuilder, CommitOpts, LocalRepo};
    use crate::tar::{object_path, write_chunk};

    #[test]
    fn test_parse_object_entry_path() -> Result<()> {
        let c = "a86d80a3e9ff77c2e3144c787b7769b300f91ffd770221aac27bab854960b964";
        let p = crate::tar::object_path(ObjectType::DirTree, c);
        assert_eq!(
            parse_object_entry_path(&p)?,
            (c.to_string(), MemberKind::Object(ObjectType::DirTree))
        );
        let p = crate::tar::xattrs_path(c);
        assert_eq!(parse_object_entry_path(&p)?.1, MemberKind::Xattrs);
        for bad in [
            "usr/bin/sh",
            "sysroot/ostree/repo/objects/a8",
            "sysroot/ostree/repo/objects/a8/xyz.file",
            "sysroot/ostree/repo/objects/a86/d80a3e9ff77c2e3144c787b7769b300f91ffd770221aac27bab854960b964.file",
            "sysroot/ostree/repo/objects/a8/6d80a3e9ff77c2e3144c787b7769b300f91ffd770221aac27bab854960b964.bin",
        ] {
            assert!(parse_object_entry_path(Utf8Path::new(bad)).is_err(), "{bad}");
        }
        validate_directory(Utf8Path::new("sysroot"))?;
        validate_directory(Utf8Path::new("sysroot/ostree/repo/objects/ff"))?;
        assert!(validate_directory(Utf8Path::new("usr")).is_err());
        assert!(validate_directory(Utf8Path::new("sysroot/ostree/repo/objects/zz")).is_err());
        Ok(())
    }

    fn fixture() -> Result<(tempfile::TempDir, LocalRepo, String, Vec<u8>)> {
        let td = tempfile::tempdir()?;
        let repo = LocalRepo::create(Utf8Path::from_path(td.path()).unwrap())?;
        let mut b = CommitBuilder::new(&repo)?;
        let mut h = FileHeader::regular(0, 0, 0o755, 2);
        h.xattrs.insert("user.test".into(), hex::encode(b"x"));
        b.add_file(Utf8Path::new("/usr/bin/sh"), &h, b"sh")?;
        b.add_file(
            Utf8Path::new("/usr/bin/bash"),
            &FileHeader::symlink(0, 0, "sh"),
            b"",
        )?;
        let commit = b.commit(
            &repo,
            &CommitOpts {
                timestamp: Some(0),
                ..Default::default()
            },
        )?;
        let idx = ObjectIndex::new(&repo, &commit)?;
        let delta = crate::dedup::resolve(&idx, None)?;
        let chunking = Chunking::new(&repo, &delta, ChunkingPolicy::SingleLayer)?;
        let layer = write_chunk(&repo, &chunking, 0, Vec::new())?;
        Ok((td, repo, commit, layer))
    }

    #[test]
    fn test_roundtrip_into_empty() -> Result<()> {
        let (_td, repo, commit, layer) = fixture()?;
        let empty = StagingArea::new(tempfile::tempdir()?)?;
        let mut staging = StagingArea::new(tempfile::tempdir()?)?;
        let stats = import_layer(layer.as_slice(), &empty, &mut staging)?;
        assert_eq!(stats.commits, vec![commit.clone()]);
        assert_eq!(stats.skipped, 0);
        let mut expected = repo.list_objects()?;
        expected.sort();
        let mut got: Vec<_> = staging
            .objects()
            .map(|(t, c)| (t, c.to_string()))
            .collect();
        got.sort();
        assert_eq!(got, expected);
        assert_eq!(stats.staged as usize, expected.len());

        // Everything is skipped when importing into the source repository
        let mut staging = StagingArea::new(tempfile::tempdir()?)?;
        let stats = import_layer(layer.as_slice(), &repo, &mut staging)?;
        assert_eq!(stats.staged, 0);
        assert_eq!(staging.len(), 0);
        Ok(())
    }

    #[test]
    fn test_tampered_content() -> Result<()> {
        let (_td, repo, _commit, layer) = fixture()?;
        let (_, sh) = repo
            .list_objects()?
            .into_iter()
            .find(|(t, c)| {
                *t == ObjectType::File
                    && repo
                        .query_file(c)
                        .map(|(h, _)| h.symlink.is_none())
                        .unwrap_or(false)
            })
            .unwrap();
        // Rewrite the regular file member with different content of the same size
        let mut out = tar::Builder::new(Vec::new());
        let shpath = object_path(ObjectType::File, &sh);
        let mut a = tar::Archive::new(layer.as_slice());
        for e in a.entries()? {
            let mut e = e?;
            let mut h = e.header().clone();
            let path = e.path()?.into_owned();
            let mut data = Vec::new();
            e.read_to_end(&mut data)?;
            if path.to_str() == Some(shpath.as_str()) {
                data = b"SH".to_vec();
            }
            match h.entry_type() {
                tar::EntryType::Symlink => {
                    let target = e.link_name()?.unwrap().into_owned();
                    out.append_link(&mut h, &path, target)?;
                }
                _ => out.append_data(&mut h, &path, data.as_slice())?,
            }
        }
        let tampered = out.into_inner()?;
        let empty = StagingArea::new(tempfile::tempdir()?)?;
        let mut staging = StagingArea::new(tempfile::tempdir()?)?;
        let e = import_layer(tampered.as_slice(), &empty, &mut staging).unwrap_err();
        assert!(matches!(
            crate::Error::find(&e),
            Some(crate::Error::ObjectChecksumMismatch {
                objtype: ObjectType::File,
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn test_reject_foreign_member() -> Result<()> {
        let mut out = tar::Builder::new(Vec::new());
        let mut h = tar::Header::new_gnu();
        h.set_entry_type(tar::EntryType::Regular);
        h.set_size(2);
        h.set_mode(0o644);
        out.append_data(&mut h, "etc/passwd", &b"x\n"[..])?;
        let buf = out.into_inner()?;
        let empty = StagingArea::new(tempfile::tempdir()?)?;
        let mut staging = StagingArea::new(tempfile::tempdir()?)?;
        let e = import_layer(buf.as_slice(), &empty, &mut staging).unwrap_err();
        assert!(format!("{e:#}").contains("Unexpected path"));
        Ok(())
    }
}
