//! # Repository objects
//!
//! Every object is addressed by the sha256 of its canonical bytes. Metadata
//! objects (commits, directory trees and directory metadata) are canonical
//! JSON as produced by [`olpc_cjson`]; file objects are a length-prefixed
//! canonical JSON header followed by the file content. The detached metadata
//! of a commit is keyed by the commit checksum instead of its own.

use crate::Result;
use anyhow::{anyhow, ensure, Context};
use openssl::hash::{hash, MessageDigest};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::Read;

/// Limit on metadata objects (commit/dirtree/dirmeta/commitmeta).
pub const MAX_METADATA_SIZE: u64 = 10 * 1024 * 1024;
/// Arbitrary limit on the serialized extended attributes of a single file
/// to avoid RAM exhaustion attacks.
pub const MAX_XATTR_SIZE: u64 = 1024 * 1024;
/// Commit metadata key holding a human readable version.
pub const COMMIT_META_VERSION: &str = "version";

/// Extended attributes; values are hex encoded since they may be binary.
pub type Xattrs = BTreeMap<String, String>;

/// The kind of a repository object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    /// A commit
    Commit,
    /// Detached metadata (signatures) of a commit
    CommitMeta,
    /// A directory listing
    DirTree,
    /// Directory ownership, permissions and xattrs
    DirMeta,
    /// File content plus metadata
    File,
}

impl ObjectType {
    /// The suffix used for this object type in paths.
    pub fn extension(self) -> &'static str {
        match self {
            ObjectType::Commit => "commit",
            ObjectType::CommitMeta => "commitmeta",
            ObjectType::DirTree => "dirtree",
            ObjectType::DirMeta => "dirmeta",
            ObjectType::File => "file",
        }
    }

    /// Parse a path suffix; unknown suffixes are `None`.
    pub fn from_extension(s: &str) -> Option<Self> {
        Some(match s {
            "commit" => ObjectType::Commit,
            "commitmeta" => ObjectType::CommitMeta,
            "dirtree" => ObjectType::DirTree,
            "dirmeta" => ObjectType::DirMeta,
            "file" => ObjectType::File,
            _ => return None,
        })
    }

    /// Everything except file objects.
    pub fn is_metadata(self) -> bool {
        !matches!(self, ObjectType::File)
    }
}

impl Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Validate that `input` is a lowercase hex sha256 checksum.
pub fn validate_sha256(input: String) -> Result<String> {
    if input.len() != 64 {
        return Err(anyhow!("Invalid sha256 checksum (len) {}", input));
    }
    if !input.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
        return Err(anyhow!("Invalid sha256 checksum {}", input));
    }
    Ok(input)
}

pub(crate) fn is_sha256(input: &str) -> bool {
    input.len() == 64 && input.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

/// Hex encoded sha256 of `data`.
pub fn sha256_hex(data: &[u8]) -> Result<String> {
    Ok(hex::encode(hash(MessageDigest::sha256(), data)?))
}

/// Serialize a value into its canonical JSON form.
pub fn to_canonical_json<S: Serialize + ?Sized>(v: &S) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut ser =
        serde_json::Serializer::with_formatter(&mut buf, olpc_cjson::CanonicalFormatter::new());
    v.serialize(&mut ser)?;
    Ok(buf)
}

fn from_bounded_json<T: DeserializeOwned>(buf: &[u8], objtype: ObjectType) -> Result<T> {
    ensure!(
        buf.len() as u64 <= MAX_METADATA_SIZE,
        "{} object of size {} exceeds {} bytes",
        objtype,
        buf.len(),
        MAX_METADATA_SIZE
    );
    serde_json::from_slice(buf).with_context(|| format!("Parsing {objtype} object"))
}

/// Check that `data` hashes to `checksum`.
pub fn verify_object(objtype: ObjectType, checksum: &str, data: &[u8]) -> Result<()> {
    let actual = sha256_hex(data)?;
    if actual != checksum {
        return Err(crate::Error::ObjectChecksumMismatch {
            objtype,
            checksum: checksum.to_string(),
            actual,
        }
        .into());
    }
    Ok(())
}

/// Shared behavior of the content-addressed metadata objects.
pub trait MetadataObject: Serialize + DeserializeOwned {
    /// The object type
    const OBJTYPE: ObjectType;

    /// Structural validation after parsing.
    fn validate(&self) -> Result<()>;

    /// The canonical bytes.
    fn to_bytes(&self) -> Result<Vec<u8>> {
        to_canonical_json(self)
    }

    /// Parse and validate canonical bytes.
    fn from_bytes(buf: &[u8]) -> Result<Self> {
        let v: Self = from_bounded_json(buf, Self::OBJTYPE)?;
        v.validate()?;
        Ok(v)
    }

    /// The checksum (object name).
    fn checksum(&self) -> Result<String> {
        sha256_hex(&self.to_bytes()?)
    }
}

/// A commit object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// The previous commit, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// One line summary
    pub subject: String,
    /// Longer description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    /// Seconds since the epoch
    pub timestamp: u64,
    /// Root directory tree
    pub root_tree: String,
    /// Metadata of the root directory
    pub root_meta: String,
    /// Additional string metadata, e.g. [`COMMIT_META_VERSION`]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Commit {
    /// The version string, if set.
    pub fn version(&self) -> Option<&str> {
        self.metadata.get(COMMIT_META_VERSION).map(|s| s.as_str())
    }
}

impl MetadataObject for Commit {
    const OBJTYPE: ObjectType = ObjectType::Commit;

    fn validate(&self) -> Result<()> {
        for c in [Some(&self.root_tree), Some(&self.root_meta), self.parent.as_ref()]
            .into_iter()
            .flatten()
        {
            ensure!(is_sha256(c), "Invalid checksum in commit: {c}");
        }
        Ok(())
    }
}

/// A file entry in a directory tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeFile {
    /// File name
    pub name: String,
    /// File object checksum
    pub checksum: String,
}

/// A subdirectory entry in a directory tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDir {
    /// Directory name
    pub name: String,
    /// Directory tree checksum
    pub tree: String,
    /// Directory metadata checksum
    pub meta: String,
}

/// A directory listing; both lists are sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirTree {
    /// Non-directory entries
    pub files: Vec<TreeFile>,
    /// Subdirectories
    pub dirs: Vec<TreeDir>,
}

fn validate_name(name: &str) -> Result<()> {
    ensure!(
        !(name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0'])),
        "Invalid file name {name:?}"
    );
    Ok(())
}

impl MetadataObject for DirTree {
    const OBJTYPE: ObjectType = ObjectType::DirTree;

    fn validate(&self) -> Result<()> {
        let files = self.files.iter().map(|f| (f.name.as_str(), [&f.checksum, &f.checksum]));
        let dirs = self.dirs.iter().map(|d| (d.name.as_str(), [&d.tree, &d.meta]));
        for list in [files.collect::<Vec<_>>(), dirs.collect::<Vec<_>>()] {
            for w in list.windows(2) {
                ensure!(w[0].0 < w[1].0, "Unsorted directory tree at {:?}", w[1].0);
            }
            for (name, checksums) in list {
                validate_name(name)?;
                for c in checksums {
                    ensure!(is_sha256(c), "Invalid checksum for {name:?}: {c}");
                }
            }
        }
        for d in &self.dirs {
            let dup = self
                .files
                .binary_search_by(|f| f.name.as_str().cmp(&d.name))
                .is_ok();
            ensure!(!dup, "Duplicate directory entry {:?}", d.name);
        }
        Ok(())
    }
}

/// Ownership, mode and xattrs of a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirMeta {
    /// Owner
    pub uid: u32,
    /// Group
    pub gid: u32,
    /// Permission bits
    pub mode: u32,
    /// Extended attributes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: Xattrs,
}

impl Default for DirMeta {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            mode: 0o755,
            xattrs: Default::default(),
        }
    }
}

impl MetadataObject for DirMeta {
    const OBJTYPE: ObjectType = ObjectType::DirMeta;

    fn validate(&self) -> Result<()> {
        ensure!(self.mode & !0o7777 == 0, "Invalid directory mode {:o}", self.mode);
        validate_xattrs(&self.xattrs)
    }
}

fn validate_xattrs(xattrs: &Xattrs) -> Result<()> {
    for (k, v) in xattrs {
        ensure!(!k.is_empty() && !k.contains('\0'), "Invalid xattr name {k:?}");
        hex::decode(v).with_context(|| format!("Invalid xattr value for {k}"))?;
    }
    Ok(())
}

/// The metadata part of a file object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    /// Owner
    pub uid: u32,
    /// Group
    pub gid: u32,
    /// Permission bits
    pub mode: u32,
    /// Content length; always zero for symlinks
    pub size: u64,
    /// Symbolic link target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink: Option<String>,
    /// Extended attributes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: Xattrs,
}

impl FileHeader {
    /// Header for a regular file.
    pub fn regular(uid: u32, gid: u32, mode: u32, size: u64) -> Self {
        Self {
            uid,
            gid,
            mode,
            size,
            symlink: None,
            xattrs: Default::default(),
        }
    }

    /// Header for a symbolic link.
    pub fn symlink(uid: u32, gid: u32, target: impl Into<String>) -> Self {
        Self {
            uid,
            gid,
            mode: 0o777,
            size: 0,
            symlink: Some(target.into()),
            xattrs: Default::default(),
        }
    }

    /// Whether this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.symlink.is_some()
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.mode & !0o7777 == 0, "Invalid file mode {:o}", self.mode);
        if let Some(target) = self.symlink.as_deref() {
            ensure!(self.size == 0, "Symlink with non-zero size");
            ensure!(
                !target.is_empty() && !target.contains('\0'),
                "Invalid symlink target"
            );
        }
        validate_xattrs(&self.xattrs)
    }

    /// The prefix of a file object: header length and canonical header.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let header = to_canonical_json(self)?;
        let len = u32::try_from(header.len())?;
        let mut r = Vec::with_capacity(header.len() + 4);
        r.extend_from_slice(&len.to_be_bytes());
        r.extend_from_slice(&header);
        Ok(r)
    }

    /// Read the header of a file object; the reader is left positioned at
    /// the start of the content.
    pub fn read_from(r: &mut impl Read) -> Result<Self> {
        let mut lenbuf = [0u8; 4];
        r.read_exact(&mut lenbuf).context("Reading file header length")?;
        let len = u32::from_be_bytes(lenbuf) as u64;
        ensure!(
            len <= MAX_XATTR_SIZE + 4096,
            "File header of size {len} is too large"
        );
        let mut buf = vec![0u8; len as usize];
        r.read_exact(&mut buf).context("Reading file header")?;
        let h: FileHeader = serde_json::from_slice(&buf).context("Parsing file header")?;
        h.validate()?;
        Ok(h)
    }
}

/// The full canonical bytes of a small file object.
pub fn file_object_bytes(header: &FileHeader, content: &[u8]) -> Result<Vec<u8>> {
    ensure!(
        header.size == content.len() as u64,
        "File header size {} does not match content length {}",
        header.size,
        content.len()
    );
    let mut r = header.encode()?;
    r.extend_from_slice(content);
    Ok(r)
}

/// Detached metadata of a commit; currently only signatures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachedMetadata {
    /// Hex encoded ed25519 signatures over the commit checksum
    #[serde(
        rename = "ostree.sign.ed25519",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub ed25519: Vec<String>,
}

impl DetachedMetadata {
    /// Parse canonical bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let v: Self = from_bounded_json(buf, ObjectType::CommitMeta)?;
        for s in &v.ed25519 {
            hex::decode(s).context("Invalid signature encoding")?;
        }
        Ok(v)
    }

    /// The canonical bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        to_canonical_json(self)
    }

    /// Decoded signatures.
    pub fn signatures(&self) -> Result<Vec<Vec<u8>>> {
        self.ed25519
            .iter()
            .map(|s| hex::decode(s).map_err(Into::into))
            .collect()
    }

    /// Add a signature unless it is already present.
    pub fn add_signature(&mut self, sig: &[u8]) {
        let sig = hex::encode(sig);
        if !self.ed25519.contains(&sig) {
            self.ed25519.push(sig);
        }
    }

    /// Whether there are no signatures.
    pub fn is_empty(&self) -> bool {
        self.ed25519.is_empty()
    }
}
