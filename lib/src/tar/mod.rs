//! # Layer archives
//!
//! A layer is a tar stream of repository objects below
//! `sysroot/ostree/repo/objects`, using the same `XX/REST.KIND` sharding as
//! a repository on disk. The stream produced for a given set of objects is
//! byte-for-byte reproducible.
//!
//! # Tar stream layout
//!
//! The first layer of an image starts with the parent directories and all
//! 256 shard directories, followed by the commit object, its detached
//! metadata (`.commitmeta`) and the directory tree and metadata objects.
//! Metadata objects are stored as regular members with their canonical
//! bytes, owned by root with mode `0644`.
//!
//! File objects are stored natively: a regular file or symlink member
//! carrying the ownership, mode and content, so that the object checksum
//! can be recomputed from the member alone.
//!
//! # Extended attributes
//!
//! Extended attributes of a file object travel in a `REST.file-xattrs`
//! member immediately preceding it, holding the canonical JSON of the
//! attribute map. Files without xattrs have no such member.
//!
//! All headers use the GNU format with a modification time of zero.

use crate::objects::ObjectType;
use camino::Utf8PathBuf;

mod export;
pub use export::*;
mod import;
pub use import::*;

// Below sysroot/ostree so that the usual ostree -> sysroot/ostree symlink works.
const OBJECTS_DIR: &str = "sysroot/ostree/repo/objects";
const XATTRS_EXTENSION: &str = "file-xattrs";

/// Path of an object member in a layer.
pub(crate) fn object_path(objtype: ObjectType, checksum: &str) -> Utf8PathBuf {
    format!(
        "{OBJECTS_DIR}/{}",
        crate::repo::object_relpath(objtype, checksum)
    )
    .into()
}

fn xattrs_path(checksum: &str) -> Utf8PathBuf {
    let (first, rest) = checksum.split_at(2);
    format!("{OBJECTS_DIR}/{first}/{rest}.{XATTRS_EXTENSION}").into()
}
