//! # Mapping tree paths to content checksums
//!
//! An [`ObjectIndex`] walks the tree of a commit depth-first, visiting the
//! children of each directory in lexicographic name order, and yields one
//! [`ObjectMapEntry`] per non-directory path. The walk is lazy and can be
//! restarted any number of times; it always produces the same sequence.

use crate::objects::{Commit, DirTree, ObjectType};
use crate::repo::{load, ObjectReader};
use crate::Result;
use camino::Utf8PathBuf;
use indexmap::IndexSet;
use std::collections::HashSet;

/// A path in a commit and the file object stored there.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectMapEntry {
    /// Absolute path in the tree
    pub path: Utf8PathBuf,
    /// File object checksum
    pub checksum: String,
}

/// The tree of one commit, readable through an [`ObjectReader`].
#[derive(Debug)]
pub struct ObjectIndex<'a, O: ?Sized> {
    reader: &'a O,
    commit: String,
    root_tree: String,
    root_meta: String,
}

impl<'a, O: ObjectReader + ?Sized> ObjectIndex<'a, O> {
    /// Index the commit `commit`; fails with [`crate::Error::MissingObject`]
    /// if it is not present.
    pub fn new(reader: &'a O, commit: &str) -> Result<Self> {
        let c: Commit = load(reader, commit)?;
        Ok(Self::from_parts(reader, commit, &c))
    }

    /// Index an already parsed commit.
    pub fn from_parts(reader: &'a O, checksum: &str, commit: &Commit) -> Self {
        Self {
            reader,
            commit: checksum.to_string(),
            root_tree: commit.root_tree.clone(),
            root_meta: commit.root_meta.clone(),
        }
    }

    /// The commit checksum.
    pub fn commit(&self) -> &str {
        &self.commit
    }

    /// A fresh walk over every file entry of the tree.
    pub fn entries(&self) -> Entries<'a, O> {
        Entries {
            reader: self.reader,
            root: Some(self.root_tree.clone()),
            stack: Vec::new(),
            done: false,
        }
    }

    /// The distinct directory metadata and tree objects reachable from the
    /// commit, root first, in walk order.
    pub fn metadata_objects(&self) -> Result<Vec<(ObjectType, String)>> {
        let mut seen = IndexSet::new();
        seen.insert((ObjectType::DirMeta, self.root_meta.clone()));
        self.metadata_recurse(&self.root_tree, &mut seen)?;
        Ok(seen.into_iter().collect())
    }

    fn metadata_recurse(
        &self,
        tree: &str,
        seen: &mut IndexSet<(ObjectType, String)>,
    ) -> Result<()> {
        if !seen.insert((ObjectType::DirTree, tree.to_string())) {
            return Ok(());
        }
        let t: DirTree = load(self.reader, tree)?;
        for d in &t.dirs {
            seen.insert((ObjectType::DirMeta, d.meta.clone()));
            self.metadata_recurse(&d.tree, seen)?;
        }
        Ok(())
    }

    /// The set of all file checksums in the tree.
    pub fn content_checksums(&self) -> Result<HashSet<String>> {
        self.entries().map(|e| e.map(|e| e.checksum)).collect()
    }
}

enum Child {
    File(String, String),
    Dir(String, String),
}

struct Frame {
    path: Utf8PathBuf,
    children: std::vec::IntoIter<Child>,
}

/// Iterator over the entries of an [`ObjectIndex`].
///
/// After yielding an error the iterator is exhausted.
pub struct Entries<'a, O: ?Sized> {
    reader: &'a O,
    root: Option<String>,
    stack: Vec<Frame>,
    done: bool,
}

impl<O: ?Sized> std::fmt::Debug for Entries<'_, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entries")
            .field("depth", &self.stack.len())
            .field("done", &self.done)
            .finish()
    }
}

impl<O: ObjectReader + ?Sized> Entries<'_, O> {
    fn push_dir(&mut self, path: Utf8PathBuf, tree: &str) -> Result<()> {
        let t: DirTree = load(self.reader, tree)?;
        let mut children: Vec<_> = t
            .files
            .into_iter()
            .map(|f| Child::File(f.name, f.checksum))
            .chain(t.dirs.into_iter().map(|d| Child::Dir(d.name, d.tree)))
            .collect();
        children.sort_by(|a, b| a.name().cmp(b.name()));
        self.stack.push(Frame {
            path,
            children: children.into_iter(),
        });
        Ok(())
    }

    fn next_entry(&mut self) -> Result<Option<ObjectMapEntry>> {
        if let Some(root) = self.root.take() {
            self.push_dir(Utf8PathBuf::from("/"), &root)?;
        }
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let Some(child) = frame.children.next() else {
                self.stack.pop();
                continue;
            };
            let path = frame.path.join(child.name());
            match child {
                Child::File(_, checksum) => {
                    if !self.reader.has_object(ObjectType::File, &checksum)? {
                        return Err(crate::Error::missing(ObjectType::File, checksum).into());
                    }
                    return Ok(Some(ObjectMapEntry { path, checksum }));
                }
                Child::Dir(_, tree) => self.push_dir(path, &tree)?,
            }
        }
    }
}

impl Child {
    fn name(&self) -> &str {
        match self {
            Child::File(n, _) | Child::Dir(n, _) => n,
        }
    }
}

impl<O: ObjectReader + ?Sized> Iterator for Entries<'_, O> {
    type Item = Result<ObjectMapEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_entry() {
            Ok(Some(e)) => Some(Ok(e)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{FileHeader, MetadataObject};
    use crate::repo::{CommitBuilder, CommitOpts, LocalRepo, Repository};
    use camino::Utf8Path;

    fn build(repo: &LocalRepo, files: &[(&str, &str)]) -> Result<String> {
        let mut b = CommitBuilder::new(repo)?;
        for (path, content) in files {
            let h = FileHeader::regular(0, 0, 0o644, content.len() as u64);
            b.add_file(Utf8Path::new(path), &h, content.as_bytes())?;
        }
        b.commit(
            repo,
            &CommitOpts {
                timestamp: Some(0),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_order_and_restart() -> Result<()> {
        let td = tempfile::tempdir()?;
        let repo = LocalRepo::create(Utf8Path::from_path(td.path()).unwrap())?;
        let commit = build(
            &repo,
            &[
                ("/usr/bin/sh", "sh"),
                ("/etc/os-release", "ID=exampleos"),
                ("/a-file", "a"),
                ("/usr/bin/bash", "sh"),
                ("/zz", "z"),
            ],
        )?;
        let idx = ObjectIndex::new(&repo, &commit)?;
        let paths: Vec<_> = idx
            .entries()
            .map(|e| e.map(|e| e.path.to_string()))
            .collect::<Result<_>>()?;
        assert_eq!(
            paths,
            ["/a-file", "/etc/os-release", "/usr/bin/bash", "/usr/bin/sh", "/zz"]
        );
        let again: Vec<_> = idx.entries().collect::<Result<_>>()?;
        assert_eq!(again.len(), 5);
        assert_eq!(again[2].checksum, again[3].checksum);
        assert_eq!(idx.content_checksums()?.len(), 4);

        let meta = idx.metadata_objects()?;
        // root dirmeta, root tree, etc tree, usr tree, usr/bin tree; the
        // default dirmeta is shared by every directory
        assert_eq!(meta.len(), 5);
        assert_eq!(meta[0].0, ObjectType::DirMeta);
        assert_eq!(meta[1].0, ObjectType::DirTree);
        Ok(())
    }

    #[test]
    fn test_missing_objects() -> Result<()> {
        let td = tempfile::tempdir()?;
        let repo = LocalRepo::create(Utf8Path::from_path(td.path()).unwrap())?;
        let commit = build(&repo, &[("/usr/bin/sh", "sh"), ("/etc/hostname", "h")])?;
        let e = ObjectIndex::new(&repo, &"0".repeat(64)).unwrap_err();
        assert!(matches!(
            crate::Error::find(&e),
            Some(crate::Error::MissingObject {
                objtype: ObjectType::Commit,
                ..
            })
        ));

        let c = repo.read_commit(&commit)?.commit;
        let root: DirTree = load(&repo, &c.root_tree)?;
        let etc = &root.dirs.iter().find(|d| d.name == "etc").unwrap().tree;
        let etc: DirTree = load(&repo, etc)?;
        let hostname = &etc.files[0].checksum;
        let relpath = crate::repo::object_relpath(ObjectType::File, hostname);
        std::fs::remove_file(repo.path().join("objects").join(relpath))?;

        let idx = ObjectIndex::new(&repo, &commit)?;
        let mut it = idx.entries();
        let e = it.next().unwrap().unwrap_err();
        assert!(matches!(
            crate::Error::find(&e),
            Some(crate::Error::MissingObject {
                objtype: ObjectType::File,
                ..
            })
        ));
        assert!(it.next().is_none());
        assert_eq!(root.checksum()?, c.root_tree);
        Ok(())
    }
}
