use super::{load, Repository, StagingArea};
use crate::objects::{
    file_object_bytes, Commit, DirMeta, DirTree, FileHeader, MetadataObject, ObjectType, TreeDir,
    TreeFile, COMMIT_META_VERSION,
};
use crate::Result;
use anyhow::{anyhow, Context};
use camino::{Utf8Component, Utf8Path};
use fn_error_context::context;
use std::collections::BTreeMap;
use std::io::Read;
use std::os::unix::fs::MetadataExt;

/// An in-memory directory whose children are referenced by checksum.
#[derive(Debug, Clone)]
struct MutableTree {
    meta: String,
    files: BTreeMap<String, String>,
    dirs: BTreeMap<String, MutableTree>,
}

impl MutableTree {
    fn new(meta: String) -> Self {
        Self {
            meta,
            files: Default::default(),
            dirs: Default::default(),
        }
    }

    fn load(repo: &dyn Repository, tree: &str, meta: &str) -> Result<Self> {
        let t: DirTree = load(repo, tree)?;
        let mut r = Self::new(meta.to_string());
        for f in t.files {
            r.files.insert(f.name, f.checksum);
        }
        for d in t.dirs {
            let child = Self::load(repo, &d.tree, &d.meta)?;
            r.dirs.insert(d.name, child);
        }
        Ok(r)
    }

    /// Walk to the directory `components`, creating missing directories
    /// with metadata `meta`.
    fn ensure_dir<'a>(
        &mut self,
        components: impl IntoIterator<Item = &'a str>,
        meta: &str,
    ) -> Result<&mut MutableTree> {
        let mut cur = self;
        for name in components {
            if cur.files.contains_key(name) {
                return Err(anyhow!("{name} is not a directory"));
            }
            cur = cur
                .dirs
                .entry(name.to_string())
                .or_insert_with(|| MutableTree::new(meta.to_string()));
        }
        Ok(cur)
    }

    fn write(&self, staging: &mut StagingArea) -> Result<String> {
        let mut tree = DirTree::default();
        for (name, checksum) in &self.files {
            tree.files.push(TreeFile {
                name: name.clone(),
                checksum: checksum.clone(),
            });
        }
        for (name, child) in &self.dirs {
            let t = child.write(staging)?;
            tree.dirs.push(TreeDir {
                name: name.clone(),
                tree: t,
                meta: child.meta.clone(),
            });
        }
        stage_metadata(staging, &tree)
    }
}

fn stage_metadata<T: MetadataObject>(staging: &mut StagingArea, v: &T) -> Result<String> {
    let buf = v.to_bytes()?;
    staging.add_object(T::OBJTYPE, buf.as_slice())
}

/// Split a relative path into its normal components.
fn path_components(path: &Utf8Path) -> Result<Vec<&str>> {
    path.components()
        .filter(|c| !matches!(c, Utf8Component::RootDir | Utf8Component::CurDir))
        .map(|c| match c {
            Utf8Component::Normal(n) => Ok(n),
            o => Err(anyhow!("Invalid path component {o} in {path}")),
        })
        .collect()
}

/// Options for writing a commit.
#[derive(Debug, Clone, Default)]
pub struct CommitOpts {
    /// One line summary
    pub subject: String,
    /// Longer description
    pub body: String,
    /// Seconds since the epoch; defaults to now
    pub timestamp: Option<u64>,
    /// Parent commit
    pub parent: Option<String>,
    /// Value for the `version` metadata key
    pub version: Option<String>,
    /// Point this ref at the new commit
    pub refname: Option<String>,
}

/// Assemble a filesystem tree and write it as a commit.
#[derive(Debug)]
pub struct CommitBuilder {
    staging: StagingArea,
    root: MutableTree,
    default_meta: String,
}

impl CommitBuilder {
    /// Start from an empty root directory.
    pub fn new(repo: &dyn Repository) -> Result<Self> {
        let mut staging = repo.new_staging_area()?;
        let default_meta = stage_metadata(&mut staging, &DirMeta::default())?;
        let root = MutableTree::new(default_meta.clone());
        Ok(Self {
            staging,
            root,
            default_meta,
        })
    }

    /// Start from the tree of an existing commit.
    #[context("Loading tree of {commit}")]
    pub fn from_commit(repo: &dyn Repository, commit: &str) -> Result<Self> {
        let mut r = Self::new(repo)?;
        let c: Commit = load(repo, commit)?;
        r.root = MutableTree::load(repo, &c.root_tree, &c.root_meta)?;
        Ok(r)
    }

    /// Create (or update the metadata of) a directory and its parents.
    pub fn mkdir(&mut self, path: &Utf8Path, meta: &DirMeta) -> Result<()> {
        let meta = stage_metadata(&mut self.staging, meta)?;
        let components = path_components(path)?;
        let default_meta = self.default_meta.clone();
        let dir = self.root.ensure_dir(components, &default_meta)?;
        dir.meta = meta;
        Ok(())
    }

    /// Add a file (or symlink) at `path`, replacing any existing file.
    pub fn add_file(&mut self, path: &Utf8Path, header: &FileHeader, content: &[u8]) -> Result<String> {
        let buf = file_object_bytes(header, content)?;
        let checksum = self.staging.add_object(ObjectType::File, buf.as_slice())?;
        self.link(path, &checksum)?;
        Ok(checksum)
    }

    /// Add a file whose content is streamed from `content`.
    pub fn add_file_from(
        &mut self,
        path: &Utf8Path,
        header: &FileHeader,
        content: impl Read,
    ) -> Result<String> {
        let prefix = header.encode()?;
        let src = std::io::Cursor::new(prefix).chain(content.take(header.size));
        let checksum = self.staging.add_object(ObjectType::File, src)?;
        self.link(path, &checksum)?;
        Ok(checksum)
    }

    /// Point `path` at an existing file object.
    pub fn link(&mut self, path: &Utf8Path, checksum: &str) -> Result<()> {
        let mut components = path_components(path)?;
        let name = components
            .pop()
            .ok_or_else(|| anyhow!("Invalid file path {path}"))?;
        let default_meta = self.default_meta.clone();
        let dir = self.root.ensure_dir(components, &default_meta)?;
        if dir.dirs.contains_key(name) {
            return Err(anyhow!("{path} is a directory"));
        }
        dir.files.insert(name.to_string(), checksum.to_string());
        Ok(())
    }

    /// Remove a file or directory; returns whether it existed.
    pub fn remove(&mut self, path: &Utf8Path) -> Result<bool> {
        let mut components = path_components(path)?;
        let Some(name) = components.pop() else {
            return Ok(false);
        };
        let mut dir = &mut self.root;
        for c in components {
            match dir.dirs.get_mut(c) {
                Some(d) => dir = d,
                None => return Ok(false),
            }
        }
        Ok(dir.files.remove(name).is_some() || dir.dirs.remove(name).is_some())
    }

    /// Recursively import the contents of a local directory into the
    /// root of the tree, keeping ownership and permission bits.
    #[context("Importing {src}")]
    pub fn add_directory_contents(&mut self, src: &Utf8Path) -> Result<()> {
        self.add_directory_recurse(src, Utf8Path::new(""))
    }

    fn add_directory_recurse(&mut self, src: &Utf8Path, dest: &Utf8Path) -> Result<()> {
        let mut entries = src
            .read_dir_utf8()?
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by(|a, b| a.file_name().cmp(b.file_name()));
        for entry in entries {
            let path = entry.path();
            let target = dest.join(entry.file_name());
            let meta = std::fs::symlink_metadata(path)?;
            let ft = meta.file_type();
            let perms = meta.mode() & 0o7777;
            if ft.is_dir() {
                let dirmeta = DirMeta {
                    uid: meta.uid(),
                    gid: meta.gid(),
                    mode: perms,
                    xattrs: Default::default(),
                };
                self.mkdir(&target, &dirmeta)?;
                self.add_directory_recurse(path, &target)?;
            } else if ft.is_symlink() {
                let link = std::fs::read_link(path)?;
                let link = link
                    .to_str()
                    .ok_or_else(|| anyhow!("Non-UTF8 symlink target in {path}"))?;
                let header = FileHeader::symlink(meta.uid(), meta.gid(), link);
                self.add_file(&target, &header, &[])?;
            } else if ft.is_file() {
                let header = FileHeader::regular(meta.uid(), meta.gid(), perms, meta.len());
                let f = std::fs::File::open(path).with_context(|| format!("Opening {path}"))?;
                self.add_file_from(&target, &header, std::io::BufReader::new(f))?;
            } else {
                return Err(anyhow!("Unsupported file type: {path}"));
            }
        }
        Ok(())
    }

    /// Write all objects in one transaction and optionally update a ref.
    /// Returns the commit checksum.
    pub fn commit(mut self, repo: &dyn Repository, opts: &CommitOpts) -> Result<String> {
        let root_tree = self.root.write(&mut self.staging)?;
        let timestamp = match opts.timestamp {
            Some(t) => t,
            None => u64::try_from(chrono::Utc::now().timestamp())?,
        };
        let mut metadata = BTreeMap::new();
        if let Some(v) = opts.version.as_deref() {
            metadata.insert(COMMIT_META_VERSION.to_string(), v.to_string());
        }
        let commit = Commit {
            parent: opts.parent.clone(),
            subject: opts.subject.clone(),
            body: opts.body.clone(),
            timestamp,
            root_tree,
            root_meta: self.root.meta.clone(),
            metadata,
        };
        let checksum = stage_metadata(&mut self.staging, &commit)?;
        let stats = repo.write_objects(self.staging)?.commit()?;
        tracing::debug!(
            "Wrote commit {checksum}: {} new objects",
            stats.total_written()
        );
        if let Some(r) = opts.refname.as_deref() {
            repo.update_ref(r, &checksum)?;
        }
        Ok(checksum)
    }
}
