//! # APIs bridging OSTree and container images
//!
//! This module contains APIs to bidirectionally map between a repository
//! and container images.
//!
//! [`encapsulate()`] serializes a commit, optionally as a delta against a
//! base commit, into an image; [`store::ImageImporter`] verifies an image
//! and writes the commit it carries into a repository.

use anyhow::anyhow;
use camino::{Utf8Path, Utf8PathBuf};
use oci_spec::image as oci_image;
use std::convert::{TryFrom, TryInto};
use tokio::io::AsyncRead;

use crate::Result;

/// The label injected into a container image that contains the ostree commit SHA-256.
pub const OSTREE_COMMIT_LABEL: &str = "ostree.commit";
/// The ref name the commit was exported from.
pub const OSTREE_REF_LABEL: &str = "ostree.ref";
/// Comma separated hex signatures over the commit checksum.
pub const OSTREE_SIGNATURE_LABEL: &str = "ostree.signature";
/// The `version` metadata of the commit.
pub const OSTREE_VERSION_LABEL: &str = "ostree.version";
/// The base commit a derived image was computed against.
pub const OSTREE_BASE_LABEL: &str = "ostree.base";
/// Per-layer annotation: the layer name.
pub const OSTREE_LAYER_LABEL: &str = "ostree.layer";
/// Per-layer annotation: comma separated checksums of the file objects carried.
pub const OSTREE_CONTENT_LABEL: &str = "ostree.content";

/// A backend/transport for OCI/Docker images.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    /// A remote Docker/OCI registry (`registry:` or `docker://`)
    Registry,
    /// A local OCI directory (`oci:`)
    OciDir,
    /// A local OCI archive tarball (`oci-archive:`)
    OciArchive,
}

/// Combination of a remote image reference and transport.
///
/// For example, `docker://quay.io/exampleos/blah:latest` or `oci:/srv/images/blah`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// The storage and transport for the image
    pub transport: Transport,
    /// The image name (e.g. `quay.io/somerepo/someimage:latest`)
    pub name: String,
}

impl ImageReference {
    /// Create a new `ImageReference` that refers to a specific digest.
    ///
    /// ```rust
    /// use std::convert::TryInto;
    /// let r: ostree_container::container::ImageReference = "docker://quay.io/exampleos/exampleos:latest".try_into().unwrap();
    /// let n = r.with_digest("sha256:41af286dc0b172ed2f1ca934fd2278de4a1192302ffa07087cea2682e7d372e3");
    /// assert_eq!(n.name, "quay.io/exampleos/exampleos@sha256:41af286dc0b172ed2f1ca934fd2278de4a1192302ffa07087cea2682e7d372e3");
    /// ```
    pub fn with_digest(&self, digest: &str) -> Self {
        let name = self.name.as_str();
        let name = if let Some(idx) = name.rfind('@') {
            name.split_at(idx).0
        } else if let Some(idx) = name.rfind(':') {
            name.split_at(idx).0
        } else {
            name
        };
        Self {
            transport: self.transport,
            name: format!("{}@{}", name, digest),
        }
    }

    /// The local path for `oci:` and `oci-archive:` references.
    pub fn local_path(&self) -> Result<&Utf8Path> {
        match self.transport {
            Transport::OciDir | Transport::OciArchive => Ok(Utf8Path::new(&self.name)),
            Transport::Registry => Err(anyhow!(
                "Registry transport is not supported for {}; copy the image to an oci: directory first",
                self
            )),
        }
    }
}

impl TryFrom<&str> for Transport {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        Ok(match value {
            "registry" | "docker" => Self::Registry,
            "oci" => Self::OciDir,
            "oci-archive" => Self::OciArchive,
            o => return Err(anyhow!("Unknown transport '{}'", o)),
        })
    }
}

impl TryFrom<&str> for ImageReference {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        let (transport_name, mut name) = value
            .split_once(':')
            .ok_or_else(|| anyhow!("Missing ':' in {}", value))?;
        let transport: Transport = transport_name.try_into()?;
        if name.is_empty() {
            return Err(anyhow!("Invalid empty name in {}", value));
        }
        if transport_name == "docker" {
            name = name
                .strip_prefix("//")
                .ok_or_else(|| anyhow!("Missing // in docker:// in {}", value))?;
        }
        Ok(Self {
            transport,
            name: name.to_string(),
        })
    }
}

impl std::str::FromStr for ImageReference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::try_from(s)
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Registry => "docker://",
            Self::OciArchive => "oci-archive:",
            Self::OciDir => "oci:",
        };
        f.write_str(s)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.transport, self.name)
    }
}

/// A byte stream for a blob.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Where images are read from.
pub trait ImageSource: std::fmt::Debug + Send + Sync {
    /// The raw manifest bytes, along with the digest the source lists for
    /// them. Neither is verified here.
    fn fetch_manifest(&self) -> Result<(Vec<u8>, String)>;

    /// Open a blob. The stream is untrusted until its digest is checked.
    fn fetch_blob(&self, desc: &oci_image::Descriptor) -> Result<BlobReader>;
}

/// Where images are written to.
pub trait ImageDestination: std::fmt::Debug + Send + Sync {
    /// A writer for a new blob; the blob appears once it is completed.
    fn push_blob(&self) -> Result<ocidir::BlobWriter>;

    /// A writer for a new gzip compressed layer.
    fn push_layer(&self, c: flate2::Compression) -> Result<ocidir::LayerWriter> {
        ocidir::LayerWriter::new(self.push_blob()?, c)
    }

    /// Write the manifest and make it the image's only entry.
    fn push_manifest(&self, manifest: &oci_image::ImageManifest) -> Result<oci_image::Descriptor>;

    /// Finish writing the image.
    fn finish(self: Box<Self>) -> Result<()>;
}

impl ImageSource for ocidir::OciDir {
    fn fetch_manifest(&self) -> Result<(Vec<u8>, String)> {
        let (buf, desc) = self.read_manifest_raw()?;
        Ok((buf, desc.digest().to_string()))
    }

    fn fetch_blob(&self, desc: &oci_image::Descriptor) -> Result<BlobReader> {
        let f = self.open_blob(desc.digest())?;
        Ok(Box::new(tokio::io::BufReader::new(tokio::fs::File::from_std(
            f,
        ))))
    }
}

impl ImageDestination for ocidir::OciDir {
    fn push_blob(&self) -> Result<ocidir::BlobWriter> {
        self.create_blob()
    }

    fn push_manifest(&self, manifest: &oci_image::ImageManifest) -> Result<oci_image::Descriptor> {
        self.write_manifest(manifest, ocidir::this_platform()?)
    }

    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// An `oci-archive:` tarball, accessed through an unpacked copy.
#[derive(Debug)]
pub struct OciArchive {
    _tempdir: tempfile::TempDir,
    dir: ocidir::OciDir,
    path: Utf8PathBuf,
}

impl OciArchive {
    fn tempdir() -> Result<(tempfile::TempDir, Utf8PathBuf)> {
        let td = tempfile::tempdir()?;
        let path = Utf8PathBuf::try_from(td.path().join("image"))?;
        Ok((td, path))
    }

    /// Unpack an existing archive.
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let (td, tmp) = Self::tempdir()?;
        let dir = ocidir::OciDir::extract_archive(path, &tmp)?;
        Ok(Self {
            _tempdir: td,
            dir,
            path: path.to_owned(),
        })
    }

    /// Prepare a new archive, written by [`ImageDestination::finish`].
    pub fn create(path: &Utf8Path) -> Result<Self> {
        let (td, tmp) = Self::tempdir()?;
        let dir = ocidir::OciDir::create(&tmp)?;
        Ok(Self {
            _tempdir: td,
            dir,
            path: path.to_owned(),
        })
    }
}

impl ImageSource for OciArchive {
    fn fetch_manifest(&self) -> Result<(Vec<u8>, String)> {
        self.dir.fetch_manifest()
    }

    fn fetch_blob(&self, desc: &oci_image::Descriptor) -> Result<BlobReader> {
        self.dir.fetch_blob(desc)
    }
}

impl ImageDestination for OciArchive {
    fn push_blob(&self) -> Result<ocidir::BlobWriter> {
        self.dir.create_blob()
    }

    fn push_manifest(&self, manifest: &oci_image::ImageManifest) -> Result<oci_image::Descriptor> {
        ImageDestination::push_manifest(&self.dir, manifest)
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.dir.write_archive(&self.path)
    }
}

/// Open an image for reading.
pub fn open_source(imgref: &ImageReference) -> Result<Box<dyn ImageSource>> {
    let path = imgref.local_path()?;
    Ok(match imgref.transport {
        Transport::OciArchive => Box::new(OciArchive::open(path)?),
        _ => Box::new(ocidir::OciDir::open(path)?),
    })
}

/// Open an image for writing.
pub fn create_destination(imgref: &ImageReference) -> Result<Box<dyn ImageDestination>> {
    let path = imgref.local_path()?;
    Ok(match imgref.transport {
        Transport::OciArchive => Box::new(OciArchive::create(path)?),
        _ => Box::new(ocidir::OciDir::create(path)?),
    })
}

mod encapsulate;
pub use encapsulate::*;
pub mod ocidir;
pub mod store;
