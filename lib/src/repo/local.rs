//! An on-disk repository.
//!
//! Layout:
//!
//! ```text
//! config                      JSON, see RepoConfig
//! lock                        flock()ed by the single open write transaction
//! objects/XX/REST.KIND        content-addressed objects
//! refs/heads/NAME             one commit checksum per ref
//! tmp/                        staging areas
//! ```

use super::{
    move_file, object_relpath, validate_ref, ObjectReader, ObjectSet, Repository, StagingArea,
    Transaction, WriteStats,
};
use crate::integrity::TrustPolicy;
use crate::objects::{is_sha256, DetachedMetadata, ObjectType};
use crate::Result;
use anyhow::{anyhow, Context};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use tempfile::TempDir;

/// Current on-disk format version.
pub const REPO_VERSION: u32 = 1;

/// Per-repository configuration, stored as JSON in `config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RepoConfig {
    /// Format version
    pub version: u32,
    /// Trust policy used by `pull` when none is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_policy: Option<TrustPolicy>,
    /// Keyring (file or directory) used by `pull` when none is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyring: Option<Utf8PathBuf>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            version: REPO_VERSION,
            trust_policy: None,
            keyring: None,
        }
    }
}

/// A repository in a local directory.
#[derive(Debug, Clone)]
pub struct LocalRepo {
    path: Utf8PathBuf,
    config: RepoConfig,
}

/// Exclusive lock on the repository, released on drop.
#[derive(Debug)]
struct RepoLock(#[allow(dead_code)] std::fs::File);

impl LocalRepo {
    /// Initialize a new repository at `path`, which may not exist yet
    /// but must not already contain a repository.
    #[context("Creating repository {path}")]
    pub fn create(path: &Utf8Path) -> Result<Self> {
        let config_path = path.join("config");
        if config_path.try_exists()? {
            return Err(anyhow!("A repository already exists"));
        }
        for d in ["objects", "refs/heads", "tmp"] {
            std::fs::create_dir_all(path.join(d))?;
        }
        std::fs::write(path.join("lock"), b"")?;
        let r = Self {
            path: path.to_owned(),
            config: RepoConfig::default(),
        };
        r.write_config()?;
        tracing::debug!("Created repository {path}");
        Ok(r)
    }

    /// Open an existing repository.
    #[context("Opening repository {path}")]
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read(path.join("config")).context("Reading config")?;
        let config: RepoConfig = serde_json::from_slice(&buf).context("Parsing config")?;
        if config.version != REPO_VERSION {
            return Err(anyhow!(
                "Unsupported repository version {} (expected {REPO_VERSION})",
                config.version
            ));
        }
        Ok(Self {
            path: path.to_owned(),
            config,
        })
    }

    /// The repository directory.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// The repository configuration.
    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// Replace and persist the configuration.
    pub fn set_config(&mut self, config: RepoConfig) -> Result<()> {
        self.config = config;
        self.write_config()
    }

    fn write_config(&self) -> Result<()> {
        let mut f = tempfile::NamedTempFile::new_in(&self.path)?;
        serde_json::to_writer_pretty(&mut f, &self.config)?;
        f.write_all(b"\n")?;
        f.persist(self.path.join("config"))?;
        Ok(())
    }

    fn object_path(&self, objtype: ObjectType, checksum: &str) -> Utf8PathBuf {
        self.path.join("objects").join(object_relpath(objtype, checksum))
    }

    fn ref_path(&self, name: &str) -> Result<Utf8PathBuf> {
        validate_ref(name)?;
        Ok(self.path.join("refs/heads").join(name))
    }

    fn lock(&self) -> Result<RepoLock> {
        let f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path.join("lock"))?;
        tracing::trace!("Waiting for repository lock");
        rustix::fs::flock(&f, rustix::fs::FlockOperation::LockExclusive)
            .context("Locking repository")?;
        Ok(RepoLock(f))
    }

    /// All refs and their targets, sorted by name.
    pub fn list_refs(&self) -> Result<BTreeMap<String, String>> {
        fn walk(
            base: &Utf8Path,
            dir: &Utf8Path,
            out: &mut BTreeMap<String, String>,
        ) -> Result<()> {
            for entry in dir.read_dir_utf8()? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    walk(base, path, out)?;
                } else if let Ok(name) = path.strip_prefix(base) {
                    let target = std::fs::read_to_string(path)?;
                    out.insert(name.to_string(), target.trim().to_string());
                }
            }
            Ok(())
        }
        let base = self.path.join("refs/heads");
        let mut r = BTreeMap::new();
        walk(&base, &base, &mut r)?;
        Ok(r)
    }

    /// Every stored object, sorted.
    pub fn list_objects(&self) -> Result<Vec<(ObjectType, String)>> {
        let mut r = Vec::new();
        let objdir = self.path.join("objects");
        for shard in objdir.read_dir_utf8()? {
            let shard = shard?;
            let prefix = shard.file_name();
            for ent in shard.path().read_dir_utf8()? {
                let ent = ent?;
                let Some((rest, ext)) = ent.file_name().rsplit_once('.') else {
                    continue;
                };
                let Some(objtype) = ObjectType::from_extension(ext) else {
                    continue;
                };
                if objtype == ObjectType::CommitMeta {
                    continue;
                }
                r.push((objtype, format!("{prefix}{rest}")));
            }
        }
        r.sort();
        Ok(r)
    }

    /// Add a signature to the detached metadata of a commit.
    #[context("Adding signature to {commit}")]
    pub fn add_signature(&self, commit: &str, signature: &[u8]) -> Result<()> {
        if !self.has_object(ObjectType::Commit, commit)? {
            return Err(crate::Error::missing(ObjectType::Commit, commit).into());
        }
        let _lock = self.lock()?;
        let mut meta = self.read_detached_metadata(commit)?.unwrap_or_default();
        meta.add_signature(signature);
        self.write_detached_metadata_locked(commit, &meta)
    }

    fn write_detached_metadata_locked(&self, commit: &str, meta: &DetachedMetadata) -> Result<()> {
        let dest = self.object_path(ObjectType::CommitMeta, commit);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = tempfile::NamedTempFile::new_in(self.path.join("tmp"))?;
        f.write_all(&meta.to_bytes()?)?;
        f.persist(&dest)?;
        Ok(())
    }
}

impl ObjectReader for LocalRepo {
    fn has_object(&self, objtype: ObjectType, checksum: &str) -> Result<bool> {
        if !is_sha256(checksum) {
            return Ok(false);
        }
        Ok(self.object_path(objtype, checksum).try_exists()?)
    }

    fn read_object(&self, objtype: ObjectType, checksum: &str) -> Result<Vec<u8>> {
        let mut r = self.open_object(objtype, checksum)?;
        let mut buf = Vec::new();
        r.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn open_object(&self, objtype: ObjectType, checksum: &str) -> Result<Box<dyn Read + Send>> {
        if !is_sha256(checksum) {
            return Err(anyhow!("Invalid checksum {checksum:?}"));
        }
        let path = self.object_path(objtype, checksum);
        match std::fs::File::open(&path) {
            Ok(f) => Ok(Box::new(std::io::BufReader::new(f))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(crate::Error::missing(objtype, checksum).into())
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("Opening {path}"))),
        }
    }

    fn read_detached_metadata(&self, commit: &str) -> Result<Option<DetachedMetadata>> {
        let path = self.object_path(ObjectType::CommitMeta, commit);
        match std::fs::read(&path) {
            Ok(buf) => Ok(Some(DetachedMetadata::from_bytes(&buf)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::Error::new(e).context(format!("Reading {path}"))),
        }
    }
}

impl Repository for LocalRepo {
    fn write_objects(&self, mut objects: StagingArea) -> Result<Box<dyn Transaction>> {
        let lock = self
            .lock()
            .map_err(|e| crate::Error::Transaction(format!("{e:#}")))?;
        let mut stats = WriteStats::default();
        let present: Vec<_> = objects
            .objects()
            .map(|(t, c)| (t, c.to_string()))
            .collect();
        for (objtype, checksum) in present {
            if self.has_object(objtype, &checksum)? {
                objects.remove(objtype, &checksum)?;
                stats.skipped += 1;
            } else if objtype == ObjectType::File {
                stats.content_written += 1;
            } else {
                stats.metadata_written += 1;
            }
        }
        let (dir, objects, detached) = objects.into_parts();
        tracing::debug!(
            "Opened transaction: {} new objects, {} already present",
            stats.total_written(),
            stats.skipped
        );
        Ok(Box::new(LocalTransaction {
            repo: self.clone(),
            _dir: dir,
            objects,
            detached,
            stats,
            _lock: lock,
        }))
    }

    fn read_ref(&self, name: &str) -> Result<Option<String>> {
        let path = self.ref_path(name)?;
        match std::fs::read_to_string(&path) {
            Ok(s) => {
                let s = s.trim();
                if !is_sha256(s) {
                    return Err(anyhow!("Ref {name} has invalid target {s:?}"));
                }
                Ok(Some(s.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::Error::new(e).context(format!("Reading ref {name}"))),
        }
    }

    #[context("Updating ref {name}")]
    fn update_ref(&self, name: &str, checksum: &str) -> Result<()> {
        self.check_ref(name)?;
        let path = self.ref_path(name)?;
        if !self.has_object(ObjectType::Commit, checksum)? {
            return Err(crate::Error::missing(ObjectType::Commit, checksum).into());
        }
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("Invalid ref path {path}"))?;
        std::fs::create_dir_all(parent)?;
        let mut f = tempfile::NamedTempFile::new_in(self.path.join("tmp"))?;
        writeln!(f, "{checksum}")?;
        f.persist(&path)?;
        tracing::debug!("Updated ref {name} => {checksum}");
        Ok(())
    }

    /// A ref may not live where a ref directory is, nor below another ref.
    fn check_ref(&self, name: &str) -> Result<()> {
        let path = self.ref_path(name)?;
        let base = self.path.join("refs/heads");
        if path.is_dir() {
            return Err(anyhow!("Ref {name} conflicts with existing refs below it"));
        }
        for p in path.ancestors().skip(1) {
            if p == base.as_path() {
                break;
            }
            if p.is_file() {
                let other = p.strip_prefix(&base).unwrap_or(p);
                return Err(anyhow!("Ref {name} conflicts with ref {other}"));
            }
        }
        Ok(())
    }

    fn new_staging_area(&self) -> Result<StagingArea> {
        let dir = tempfile::Builder::new()
            .prefix("staging-")
            .tempdir_in(self.path.join("tmp"))?;
        StagingArea::new(dir)
    }
}

/// Objects are published in this order so that a commit never becomes
/// visible before the objects it references.
fn publish_rank(objtype: ObjectType) -> u8 {
    match objtype {
        ObjectType::File => 0,
        ObjectType::DirMeta => 1,
        ObjectType::DirTree => 2,
        ObjectType::CommitMeta => 3,
        ObjectType::Commit => 4,
    }
}

#[derive(Debug)]
struct LocalTransaction {
    repo: LocalRepo,
    _dir: TempDir,
    objects: ObjectSet,
    detached: BTreeMap<String, DetachedMetadata>,
    stats: WriteStats,
    _lock: RepoLock,
}

impl LocalTransaction {
    fn staged_path(&self, objtype: ObjectType, checksum: &str) -> Option<&Utf8PathBuf> {
        self.objects.get(&(objtype, checksum.to_string()))
    }
}

impl ObjectReader for LocalTransaction {
    fn has_object(&self, objtype: ObjectType, checksum: &str) -> Result<bool> {
        if self.staged_path(objtype, checksum).is_some() {
            return Ok(true);
        }
        self.repo.has_object(objtype, checksum)
    }

    fn read_object(&self, objtype: ObjectType, checksum: &str) -> Result<Vec<u8>> {
        match self.staged_path(objtype, checksum) {
            Some(p) => std::fs::read(p).with_context(|| format!("Reading {p}")),
            None => self.repo.read_object(objtype, checksum),
        }
    }

    fn open_object(&self, objtype: ObjectType, checksum: &str) -> Result<Box<dyn Read + Send>> {
        match self.staged_path(objtype, checksum) {
            Some(p) => {
                let f = std::fs::File::open(p).with_context(|| format!("Opening {p}"))?;
                Ok(Box::new(std::io::BufReader::new(f)))
            }
            None => self.repo.open_object(objtype, checksum),
        }
    }

    fn read_detached_metadata(&self, commit: &str) -> Result<Option<DetachedMetadata>> {
        let existing = self.repo.read_detached_metadata(commit)?;
        let Some(staged) = self.detached.get(commit) else {
            return Ok(existing);
        };
        let mut r = existing.unwrap_or_default();
        for sig in staged.signatures()? {
            r.add_signature(&sig);
        }
        Ok(Some(r))
    }
}

impl Transaction for LocalTransaction {
    fn stats(&self) -> WriteStats {
        self.stats
    }

    fn commit(self: Box<Self>) -> Result<WriteStats> {
        let mut ordered: Vec<_> = self.objects.iter().collect();
        ordered.sort_by_key(|((t, _), _)| publish_rank(*t));
        for ((objtype, checksum), src) in ordered {
            let dest = self.repo.object_path(*objtype, checksum);
            move_file(src, &dest).map_err(|e| crate::Error::Transaction(format!("{e:#}")))?;
        }
        for commit in self.detached.keys() {
            let meta = self.read_detached_metadata(commit)?.unwrap_or_default();
            self.repo
                .write_detached_metadata_locked(commit, &meta)
                .map_err(|e| crate::Error::Transaction(format!("{e:#}")))?;
        }
        tracing::debug!(
            "Committed transaction: {} content, {} metadata, {} skipped",
            self.stats.content_written,
            self.stats.metadata_written,
            self.stats.skipped
        );
        Ok(self.stats)
    }
}
