//! Internal API to interact with Open Container Images; mostly
//! oriented towards generating images.

use crate::integrity::{parse_sha256_digest, Sha256Writer};
use crate::objects::to_canonical_json;
use crate::Result;
use anyhow::{anyhow, Context};
use camino::{Utf8Path, Utf8PathBuf};
use flate2::write::GzEncoder;
use fn_error_context::context;
use oci_image::MediaType;
use oci_spec::image as oci_image;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::io::{BufWriter, Read, Write};

/// Map the value from `uname -m` to the Go architecture.
pub(crate) fn machine_to_oci(machine: &str) -> &str {
    match machine {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        o => o,
    }
}

static THIS_OCI_ARCH: Lazy<oci_image::Arch> = Lazy::new(|| {
    let uts = rustix::system::uname();
    let machine = uts.machine().to_string_lossy();
    oci_image::Arch::from(machine_to_oci(&machine))
});

/// Path inside an OCI directory to the blobs
const BLOBDIR: &str = "blobs/sha256";
const OCI_LAYOUT: &str = "oci-layout";
const INDEX_JSON: &str = "index.json";

/// The legacy MIME type for uncompressed docker-formatted layers.
pub(crate) const DOCKER_TYPE_LAYER_TAR: &str = "application/vnd.docker.image.rootfs.diff.tar";
/// The docker MIME type for gzip compressed layers.
pub(crate) const DOCKER_TYPE_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Completed blob metadata
#[derive(Debug)]
pub struct Blob {
    /// Hex sha256 of the blob
    pub sha256: String,
    /// Size in bytes
    pub size: u64,
}

impl Blob {
    /// The `sha256:<hex>` digest.
    pub fn digest_id(&self) -> String {
        format!("sha256:{}", self.sha256)
    }

    pub(crate) fn descriptor(&self) -> oci_image::DescriptorBuilder {
        oci_image::DescriptorBuilder::default()
            .digest(self.digest_id())
            .size(self.size as i64)
    }
}

/// Completed layer metadata
#[derive(Debug)]
pub struct Layer {
    /// The compressed blob
    pub blob: Blob,
    /// Hex sha256 of the uncompressed tar stream
    pub uncompressed_sha256: String,
}

impl Layer {
    pub(crate) fn descriptor(&self) -> oci_image::DescriptorBuilder {
        self.blob.descriptor()
    }
}

/// Create an OCI blob.
#[derive(Debug)]
pub struct BlobWriter {
    w: Sha256Writer<BufWriter<tempfile::NamedTempFile>>,
    blobdir: Utf8PathBuf,
}

impl BlobWriter {
    #[context("Creating blob writer")]
    fn new(blobdir: &Utf8Path) -> Result<Self> {
        let tmpf = tempfile::NamedTempFile::new_in(blobdir)?;
        Ok(Self {
            w: Sha256Writer::new(BufWriter::new(tmpf))?,
            blobdir: blobdir.to_owned(),
        })
    }

    /// Finish writing this blob object.
    #[context("Completing blob")]
    pub fn complete(self) -> Result<Blob> {
        let size = self.w.len();
        let (w, sha256) = self.w.finish()?;
        let tmpf = w.into_inner().map_err(|e| e.into_error())?;
        let target = self.blobdir.join(&sha256);
        tmpf.persist(&target)
            .with_context(|| format!("Writing {target}"))?;
        Ok(Blob { sha256, size })
    }
}

impl Write for BlobWriter {
    fn write(&mut self, srcbuf: &[u8]) -> std::io::Result<usize> {
        self.w.write(srcbuf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.w.flush()
    }
}

/// Create an OCI layer (also a blob): a gzip compressed stream, also
/// tracking the digest of the uncompressed data.
pub struct LayerWriter {
    w: Sha256Writer<GzEncoder<BlobWriter>>,
}

impl std::fmt::Debug for LayerWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerWriter")
            .field("uncompressed", &self.w.len())
            .finish()
    }
}

impl LayerWriter {
    /// Compress into `bw`. The gzip header carries no timestamp or name, so
    /// identical input yields an identical blob.
    pub fn new(bw: BlobWriter, c: flate2::Compression) -> Result<Self> {
        Ok(Self {
            w: Sha256Writer::new(GzEncoder::new(bw, c))?,
        })
    }

    /// Consume this writer, flushing buffered data and put the blob in place.
    #[context("Completing layer")]
    pub fn complete(self) -> Result<Layer> {
        let (gz, uncompressed_sha256) = self.w.finish()?;
        let blob = gz.finish()?.complete()?;
        Ok(Layer {
            blob,
            uncompressed_sha256,
        })
    }
}

impl Write for LayerWriter {
    fn write(&mut self, srcbuf: &[u8]) -> std::io::Result<usize> {
        self.w.write(srcbuf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// Sadly the builder bits in the OCI spec don't offer mutable access to fields
// https://github.com/containers/oci-spec-rs/issues/86
fn vec_clone_append<T: Clone>(s: &[T], i: T) -> Vec<T> {
    s.iter().cloned().chain(std::iter::once(i)).collect()
}

/// Create a dummy config descriptor.
/// Our API right now always mutates a manifest, which means we need
/// a "valid" manifest, which requires a "valid" config descriptor.
/// This digest should never actually be used for anything.
fn empty_config_descriptor() -> Result<oci_image::Descriptor> {
    Ok(oci_image::DescriptorBuilder::default()
        .media_type(MediaType::ImageConfig)
        .size(7023)
        .digest("sha256:a5b2b2c507a0944348e0303114d8d93aaaa081732b86451d9bce1f432a537bc7")
        .build()?)
}

/// Generate a "valid" empty manifest.  See above.
pub(crate) fn new_empty_manifest() -> Result<oci_image::ImageManifestBuilder> {
    Ok(oci_image::ImageManifestBuilder::default()
        .schema_version(oci_image::SCHEMA_VERSION)
        .media_type(MediaType::ImageManifest)
        .config(empty_config_descriptor()?)
        .layers(Vec::new()))
}

/// Generate an image configuration targeting Linux for this architecture.
pub(crate) fn new_config() -> oci_image::ImageConfigurationBuilder {
    oci_image::ImageConfigurationBuilder::default()
        .architecture(THIS_OCI_ARCH.clone())
        .os(oci_image::Os::Linux)
}

/// Return a Platform object for Linux for this architecture.
pub(crate) fn this_platform() -> Result<oci_image::Platform> {
    Ok(oci_image::PlatformBuilder::default()
        .os(oci_image::Os::Linux)
        .architecture(THIS_OCI_ARCH.clone())
        .build()?)
}

/// Write a serializable data (JSON) as an OCI blob
#[context("Writing json blob")]
pub(crate) fn write_json_blob<S: serde::Serialize>(
    mut w: BlobWriter,
    v: &S,
    media_type: MediaType,
) -> Result<oci_image::DescriptorBuilder> {
    w.write_all(&to_canonical_json(v)?)?;
    let blob = w.complete()?;
    Ok(blob.descriptor().media_type(media_type))
}

/// Add a layer to the top of the image stack with optional annotations.
/// The first pushed layer becomes the root.
pub(crate) fn push_layer_annotated(
    manifest: &mut oci_image::ImageManifest,
    config: &mut oci_image::ImageConfiguration,
    layer: Layer,
    annotations: Option<impl Into<HashMap<String, String>>>,
    description: &str,
) -> Result<()> {
    let mut builder = layer.descriptor().media_type(MediaType::ImageLayerGzip);
    if let Some(annotations) = annotations {
        builder = builder.annotations(annotations);
    }
    let blobdesc = builder.build()?;
    manifest.set_layers(vec_clone_append(manifest.layers(), blobdesc));
    let mut rootfs = config.rootfs().clone();
    rootfs.set_diff_ids(vec_clone_append(
        rootfs.diff_ids(),
        format!("sha256:{}", layer.uncompressed_sha256),
    ));
    config.set_rootfs(rootfs);
    let mut h = oci_image::HistoryBuilder::default().created_by(description.to_string());
    if let Some(created) = config.created() {
        h = h.created(created.clone());
    }
    config.set_history(vec_clone_append(config.history(), h.build()?));
    Ok(())
}

/// Write `data` to `path` via a temporary file in the same directory.
fn write_file_atomic(path: &Utf8Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("Invalid path {path}"))?;
    let mut tmpf = tempfile::NamedTempFile::new_in(parent)?;
    tmpf.write_all(data)?;
    tmpf.persist(path)
        .with_context(|| format!("Writing {path}"))?;
    Ok(())
}

/// An OCI image layout directory.
#[derive(Debug, Clone)]
pub struct OciDir {
    path: Utf8PathBuf,
}

impl OciDir {
    /// Create a new OCI directory at the target path, which should be empty
    /// or absent.
    #[context("Creating OCI dir {path}")]
    pub fn create(path: &Utf8Path) -> Result<Self> {
        std::fs::create_dir_all(path.join(BLOBDIR))?;
        write_file_atomic(
            &path.join(OCI_LAYOUT),
            br#"{"imageLayoutVersion":"1.0.0"}"#,
        )?;
        Self::open(path)
    }

    /// Open an existing OCI directory.
    #[context("Opening OCI dir {path}")]
    pub fn open(path: &Utf8Path) -> Result<Self> {
        if !path.join(OCI_LAYOUT).try_exists()? {
            return Err(anyhow!("Missing {OCI_LAYOUT}"));
        }
        Ok(Self {
            path: path.to_owned(),
        })
    }

    /// The directory.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Create a writer for a new blob.
    pub fn create_blob(&self) -> Result<BlobWriter> {
        BlobWriter::new(&self.path.join(BLOBDIR))
    }

    /// Create a writer for a new gzip compressed layer blob.
    pub fn create_layer(&self, c: Option<flate2::Compression>) -> Result<LayerWriter> {
        LayerWriter::new(self.create_blob()?, c.unwrap_or_default())
    }

    /// Path to the blob with the given digest; only `sha256` is supported.
    pub fn blob_path(&self, digest: &str) -> Result<Utf8PathBuf> {
        let hash = parse_sha256_digest(digest)?;
        Ok(self.path.join(BLOBDIR).join(hash))
    }

    /// Whether the blob exists.
    pub fn has_blob(&self, digest: &str) -> Result<bool> {
        Ok(self.blob_path(digest)?.try_exists()?)
    }

    /// Open a blob for reading.
    pub fn open_blob(&self, digest: &str) -> Result<std::fs::File> {
        let path = self.blob_path(digest)?;
        std::fs::File::open(&path).with_context(|| format!("Opening blob {digest}"))
    }

    /// Read a JSON blob, which is expected to be small.
    pub fn read_json_blob<T: serde::de::DeserializeOwned>(
        &self,
        desc: &oci_image::Descriptor,
    ) -> Result<T> {
        let f = self.open_blob(desc.digest())?;
        let f = std::io::BufReader::new(f.take(crate::objects::MAX_METADATA_SIZE));
        serde_json::from_reader(f).with_context(|| format!("Parsing {}", desc.digest()))
    }

    /// Write a serializable data (JSON) as an OCI blob
    pub fn write_json_blob<S: serde::Serialize>(
        &self,
        v: &S,
        media_type: MediaType,
    ) -> Result<oci_image::DescriptorBuilder> {
        write_json_blob(self.create_blob()?, v, media_type)
    }

    /// Write a configuration blob.
    pub fn write_config(
        &self,
        config: &oci_image::ImageConfiguration,
    ) -> Result<oci_image::Descriptor> {
        Ok(self.write_json_blob(config, MediaType::ImageConfig)?.build()?)
    }

    /// Write a manifest as a blob, and replace the index with a reference to it.
    #[context("Writing manifest")]
    pub fn write_manifest(
        &self,
        manifest: &oci_image::ImageManifest,
        platform: oci_image::Platform,
    ) -> Result<oci_image::Descriptor> {
        let manifest = self
            .write_json_blob(manifest, MediaType::ImageManifest)?
            .platform(platform)
            .build()?;

        let index_data = oci_image::ImageIndexBuilder::default()
            .schema_version(oci_image::SCHEMA_VERSION)
            .manifests(vec![manifest.clone()])
            .build()?;
        write_file_atomic(&self.path.join(INDEX_JSON), &to_canonical_json(&index_data)?)?;
        Ok(manifest)
    }

    /// The descriptor of the single manifest in the index.
    pub fn read_manifest_descriptor(&self) -> Result<oci_image::Descriptor> {
        let path = self.path.join(INDEX_JSON);
        let f = std::fs::File::open(&path).with_context(|| format!("Opening {path}"))?;
        let idx: oci_image::ImageIndex = serde_json::from_reader(std::io::BufReader::new(f))
            .with_context(|| format!("Parsing {path}"))?;
        match idx.manifests().as_slice() {
            [] => anyhow::bail!("No manifests found"),
            [desc] => Ok(desc.clone()),
            manifests => anyhow::bail!("Expected exactly 1 manifest, found {}", manifests.len()),
        }
    }

    /// If this OCI directory has a single manifest, return its raw bytes
    /// along with the index entry. The bytes are not verified here.
    pub fn read_manifest_raw(&self) -> Result<(Vec<u8>, oci_image::Descriptor)> {
        let desc = self.read_manifest_descriptor()?;
        let mut buf = Vec::new();
        self.open_blob(desc.digest())?
            .take(crate::objects::MAX_METADATA_SIZE)
            .read_to_end(&mut buf)?;
        Ok((buf, desc))
    }

    /// If this OCI directory has a single manifest, return it.  Otherwise, an error is returned.
    pub fn read_manifest(&self) -> Result<oci_image::ImageManifest> {
        let desc = self.read_manifest_descriptor()?;
        self.read_json_blob(&desc)
    }

    /// Serialize the directory as an `oci-archive` tarball. Members are
    /// written in sorted order with fixed metadata.
    #[context("Writing OCI archive {dest}")]
    pub fn write_archive(&self, dest: &Utf8Path) -> Result<()> {
        let parent = dest
            .parent()
            .filter(|p| !p.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        let tmpf = tempfile::NamedTempFile::new_in(parent)?;
        let mut out = tar::Builder::new(BufWriter::new(tmpf));
        let mut files = vec![Utf8PathBuf::from(OCI_LAYOUT), Utf8PathBuf::from(INDEX_JSON)];
        let mut blobs = self
            .path
            .join(BLOBDIR)
            .read_dir_utf8()?
            .map(|e| e.map(|e| Utf8Path::new(BLOBDIR).join(e.file_name())))
            .collect::<std::io::Result<Vec<_>>>()?;
        blobs.sort();
        files.extend(blobs);
        for d in ["blobs", BLOBDIR] {
            let mut h = tar::Header::new_gnu();
            h.set_entry_type(tar::EntryType::Directory);
            h.set_mode(0o755);
            h.set_mtime(0);
            h.set_size(0);
            out.append_data(&mut h, d, std::io::empty())?;
        }
        for f in files {
            let src = std::fs::File::open(self.path.join(&f))
                .with_context(|| format!("Opening {f}"))?;
            let mut h = tar::Header::new_gnu();
            h.set_entry_type(tar::EntryType::Regular);
            h.set_mode(0o644);
            h.set_mtime(0);
            h.set_size(src.metadata()?.len());
            out.append_data(&mut h, &f, src)?;
        }
        let w = out.into_inner()?;
        let tmpf = w.into_inner().map_err(|e| e.into_error())?;
        tmpf.persist(dest)?;
        Ok(())
    }

    /// Unpack an `oci-archive` tarball into `dest`.
    #[context("Extracting OCI archive {src}")]
    pub fn extract_archive(src: &Utf8Path, dest: &Utf8Path) -> Result<Self> {
        let f = std::fs::File::open(src)?;
        let mut a = tar::Archive::new(std::io::BufReader::new(f));
        a.set_preserve_permissions(false);
        a.unpack(dest)?;
        Self::open(dest)
    }
}
