//! Serialize a chunk of objects into a layer tar stream

use super::{object_path, xattrs_path, OBJECTS_DIR};
use crate::chunking::Chunking;
use crate::objects::{to_canonical_json, ObjectType};
use crate::repo::ObjectReader;
use crate::Result;
use anyhow::{anyhow, Context};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use std::collections::HashSet;
use std::io::{BufReader, Read, Write};

/// A decently large buffer, as used by e.g. coreutils `cat`.
/// System calls are expensive.
const BUF_CAPACITY: usize = 131072;

struct LayerTarWriter<'a, O: ?Sized, W: Write> {
    reader: &'a O,
    out: tar::Builder<W>,
    wrote: HashSet<(ObjectType, String)>,
}

fn new_header(entry_type: tar::EntryType, uid: u32, gid: u32, mode: u32) -> tar::Header {
    let mut h = tar::Header::new_gnu();
    h.set_entry_type(entry_type);
    h.set_uid(uid.into());
    h.set_gid(gid.into());
    h.set_mode(mode);
    h.set_mtime(0);
    h.set_size(0);
    h
}

impl<'a, O: ObjectReader + ?Sized, W: Write> LayerTarWriter<'a, O, W> {
    fn new(reader: &'a O, out: W) -> Self {
        Self {
            reader,
            out: tar::Builder::new(out),
            wrote: HashSet::new(),
        }
    }

    /// Add a directory entry with default permissions (root/root 0755)
    fn append_default_dir(&mut self, path: &Utf8Path) -> Result<()> {
        let mut h = new_header(tar::EntryType::Directory, 0, 0, 0o755);
        self.out.append_data(&mut h, path, std::io::empty())?;
        Ok(())
    }

    /// Write the initial directory structure.
    fn write_initial_directories(&mut self) -> Result<()> {
        let objdir = Utf8Path::new(OBJECTS_DIR);
        // Add all parent directories
        let parent_dirs = {
            let mut parts: Vec<_> = objdir.ancestors().collect();
            parts.reverse();
            parts
        };
        for path in parent_dirs {
            if path.as_str().is_empty() {
                continue;
            }
            self.append_default_dir(path)?;
        }
        // Object subdirectories
        for d in 0..=0xFFu8 {
            let path: Utf8PathBuf = format!("{objdir}/{d:02x}").into();
            self.append_default_dir(&path)?;
        }
        Ok(())
    }

    fn first_write(&mut self, objtype: ObjectType, checksum: &str) -> bool {
        self.wrote.insert((objtype, checksum.to_string()))
    }

    /// Append a metadata object with its canonical bytes.
    fn append_metadata(&mut self, objtype: ObjectType, checksum: &str) -> Result<()> {
        if !self.first_write(objtype, checksum) {
            return Ok(());
        }
        let data = self.reader.read_object(objtype, checksum)?;
        self.append_metadata_bytes(objtype, checksum, &data)
    }

    fn append_metadata_bytes(
        &mut self,
        objtype: ObjectType,
        checksum: &str,
        data: &[u8],
    ) -> Result<()> {
        let mut h = new_header(tar::EntryType::Regular, 0, 0, 0o644);
        h.set_size(data.len() as u64);
        self.out
            .append_data(&mut h, object_path(objtype, checksum), data)
            .with_context(|| format!("Writing object {checksum}"))?;
        Ok(())
    }

    /// Append the commit object and its detached metadata.
    fn append_commit(&mut self, checksum: &str) -> Result<()> {
        self.append_metadata(ObjectType::Commit, checksum)?;
        if let Some(meta) = self.reader.read_detached_metadata(checksum)? {
            if !meta.is_empty() {
                self.append_metadata_bytes(ObjectType::CommitMeta, checksum, &meta.to_bytes()?)?;
            }
        }
        Ok(())
    }

    /// Append a file object as a native regular file or symlink member.
    fn append_content(&mut self, checksum: &str) -> Result<()> {
        if !self.first_write(ObjectType::File, checksum) {
            return Ok(());
        }
        let path = object_path(ObjectType::File, checksum);
        let (meta, content) = self.reader.query_file(checksum)?;

        if !meta.xattrs.is_empty() {
            let data = to_canonical_json(&meta.xattrs)?;
            let mut h = new_header(tar::EntryType::Regular, 0, 0, 0o644);
            h.set_size(data.len() as u64);
            self.out
                .append_data(&mut h, xattrs_path(checksum), data.as_slice())
                .context("Writing xattrs")?;
        }

        match meta.symlink.as_deref() {
            None => {
                let mut h = new_header(tar::EntryType::Regular, meta.uid, meta.gid, meta.mode);
                h.set_size(meta.size);
                let instream = BufReader::with_capacity(BUF_CAPACITY, content.take(meta.size));
                self.out
                    .append_data(&mut h, &path, instream)
                    .with_context(|| format!("Writing regfile {checksum}"))?;
            }
            Some(target) => {
                let mut h = new_header(tar::EntryType::Symlink, meta.uid, meta.gid, meta.mode);
                self.out
                    .append_link(&mut h, &path, target)
                    .with_context(|| format!("Writing content symlink: {checksum}"))?;
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<W> {
        Ok(self.out.into_inner()?)
    }
}

/// Serialize chunk `index` of `chunking` into `out`. The first chunk also
/// carries the directory skeleton, the commit, its detached metadata and
/// every delta metadata object.
#[context("Writing layer {index}")]
pub fn write_chunk<O, W>(reader: &O, chunking: &Chunking, index: usize, out: W) -> Result<W>
where
    O: ObjectReader + ?Sized,
    W: Write,
{
    let chunk = chunking
        .chunks
        .get(index)
        .ok_or_else(|| anyhow!("No chunk {index}"))?;
    let mut w = LayerTarWriter::new(reader, out);
    if index == 0 {
        w.write_initial_directories()?;
        w.append_commit(&chunking.commit)?;
        for (objtype, checksum) in &chunking.metadata {
            w.append_metadata(*objtype, checksum)?;
        }
    }
    for checksum in chunk.content.keys() {
        w.append_content(checksum)?;
    }
    tracing::debug!(
        "Wrote layer {index} ({}) with {} objects",
        chunk.name,
        chunk.content.len()
    );
    w.finish()
}
