//! APIs for creating container images from commits

use super::ocidir::{self, new_config, new_empty_manifest, push_layer_annotated, write_json_blob};
use super::*;
use crate::chunking::{Chunking, ChunkingPolicy};
use crate::dedup;
use crate::integrity::{digest_of, parse_sha256_digest, verify_blob_digest};
use crate::objectindex::ObjectIndex;
use crate::objects::ObjectType;
use crate::repo::{CommitMetadata, Repository};
use crate::tokio_util::spawn_blocking_flatten;
use anyhow::Context;
use fn_error_context::context;
use futures_util::{StreamExt, TryStreamExt};
use oci_image::MediaType;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::instrument;

/// Whether an export must be computed against a base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DerivationPolicy {
    /// Export everything when no base is given
    #[default]
    Optional,
    /// Refuse to export without a base
    Required,
}

/// The base of a derived image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseRef {
    /// A commit checksum or ref name in the repository
    Rev(String),
    /// An image whose manifest names its commit
    Image(ImageReference),
}

impl std::str::FromStr for BaseRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            anyhow::bail!("Empty base");
        }
        // Anything with a known transport prefix is an image
        Ok(match ImageReference::try_from(s) {
            Ok(imgref) => Self::Image(imgref),
            Err(_) => Self::Rev(s.to_string()),
        })
    }
}

/// Options controlling commit export into OCI
#[derive(Debug, Clone)]
pub struct ExportOpts {
    /// How to split the objects into layers
    pub chunking: ChunkingPolicy,
    /// Only export what the base does not already have
    pub base: Option<BaseRef>,
    /// Whether a base is mandatory
    pub derivation: DerivationPolicy,
    /// Fail with [`crate::Error::UnsignedCommit`] if the commit has no signature
    pub require_signature: bool,
    /// Additional image labels
    pub labels: BTreeMap<String, String>,
    /// Ref name recorded in the image; defaults to the exported rev when it
    /// is a ref
    pub refname: Option<String>,
    /// Maximum number of layers serialized concurrently
    pub jobs: usize,
    /// Gzip compression level
    pub compression: flate2::Compression,
}

impl Default for ExportOpts {
    fn default() -> Self {
        Self {
            chunking: Default::default(),
            base: None,
            derivation: Default::default(),
            require_signature: false,
            labels: Default::default(),
            refname: None,
            jobs: 4,
            compression: flate2::Compression::default(),
        }
    }
}

/// Everything decided before any output is written.
#[derive(Debug)]
pub struct PreparedExport {
    /// The exported commit
    pub commit: CommitMetadata,
    /// Ref name recorded in the image
    pub refname: Option<String>,
    /// The layers
    pub chunking: Chunking,
    /// Number of file objects carried
    pub n_content_objects: usize,
}

impl PreparedExport {
    /// The base commit, if derived.
    pub fn base(&self) -> Option<&str> {
        self.chunking.base.as_deref()
    }
}

/// The result of an export.
#[derive(Debug)]
pub struct ExportResult {
    /// The exported commit
    pub commit: String,
    /// The base commit, if derived
    pub base: Option<String>,
    /// The manifest that was written
    pub manifest: oci_image::ImageManifest,
    /// Digest of the manifest (`sha256:...`)
    pub manifest_digest: String,
}

/// Read the commit checksum from the manifest of an image, verifying the
/// manifest digest.
#[context("Reading base image {imgref}")]
pub fn commit_from_image(imgref: &ImageReference) -> Result<String> {
    let src = open_source(imgref)?;
    let (buf, expected) = src.fetch_manifest()?;
    verify_blob_digest(&expected, &digest_of(&buf)?)?;
    let manifest: oci_image::ImageManifest = serde_json::from_slice(&buf)?;
    let commit = manifest
        .annotations()
        .as_ref()
        .and_then(|a| a.get(OSTREE_COMMIT_LABEL))
        .ok_or_else(|| anyhow::anyhow!("Image has no {OSTREE_COMMIT_LABEL} annotation"))?;
    crate::objects::validate_sha256(commit.clone())
}

/// Resolve the base of an export to a commit present in `repo`.
pub fn resolve_base(repo: &dyn Repository, base: &BaseRef) -> Result<String> {
    let commit = match base {
        BaseRef::Rev(rev) => repo.resolve_rev(rev)?,
        BaseRef::Image(imgref) => commit_from_image(imgref)?,
    };
    if !repo.has_object(ObjectType::Commit, &commit)? {
        return Err(crate::Error::missing(ObjectType::Commit, commit).into());
    }
    Ok(commit)
}

/// Compute what an export of `rev` would write. No output is produced;
/// all policy checks happen here.
#[context("Preparing export of {rev}")]
pub fn prepare_export(
    repo: &dyn Repository,
    rev: &str,
    opts: &ExportOpts,
) -> Result<PreparedExport> {
    let checksum = repo.resolve_rev(rev)?;
    let commit = repo.read_commit(&checksum)?;
    if opts.require_signature && !commit.is_signed() {
        return Err(crate::Error::UnsignedCommit { commit: checksum }.into());
    }
    let base = match (&opts.base, opts.derivation) {
        (None, DerivationPolicy::Required) => {
            anyhow::bail!("A base is required to export {rev}")
        }
        (None, DerivationPolicy::Optional) => None,
        (Some(b), _) => Some(resolve_base(repo, b)?),
    };
    let target = ObjectIndex::new(repo, &checksum)?;
    let base_index = base
        .as_deref()
        .map(|b| ObjectIndex::new(repo, b))
        .transpose()?;
    let delta = dedup::resolve(&target, base_index.as_ref())?;
    let n_content_objects = delta.n_content_objects();
    let chunking = Chunking::new(repo, &delta, opts.chunking)?;
    let refname = match opts.refname.as_deref() {
        Some(r) => Some(r.to_string()),
        None if rev != checksum => Some(rev.to_string()),
        None => None,
    };
    Ok(PreparedExport {
        commit,
        refname,
        chunking,
        n_content_objects,
    })
}

fn layer_annotations(chunk: &crate::chunking::Chunk) -> HashMap<String, String> {
    let content = chunk
        .content
        .keys()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(",");
    HashMap::from([
        (OSTREE_LAYER_LABEL.to_string(), chunk.name.clone()),
        (OSTREE_CONTENT_LABEL.to_string(), content),
    ])
}

fn manifest_annotations(prep: &PreparedExport) -> HashMap<String, String> {
    let commit = &prep.commit;
    let mut r = HashMap::new();
    r.insert(OSTREE_COMMIT_LABEL.to_string(), commit.checksum.clone());
    if let Some(refname) = prep.refname.as_deref() {
        r.insert(OSTREE_REF_LABEL.to_string(), refname.to_string());
    }
    if commit.is_signed() {
        let sigs = commit
            .signatures
            .iter()
            .map(hex::encode)
            .collect::<Vec<_>>()
            .join(",");
        r.insert(OSTREE_SIGNATURE_LABEL.to_string(), sigs);
    }
    if let Some(version) = commit.version() {
        r.insert(OSTREE_VERSION_LABEL.to_string(), version.to_string());
    }
    if let Some(base) = prep.base() {
        r.insert(OSTREE_BASE_LABEL.to_string(), base.to_string());
    }
    r
}

fn image_config(prep: &PreparedExport, opts: &ExportOpts) -> Result<oci_image::ImageConfiguration> {
    let commit = &prep.commit;
    let created = i64::try_from(commit.commit.timestamp)
        .ok()
        .and_then(|t| chrono::DateTime::<chrono::Utc>::from_timestamp(t, 0))
        .ok_or_else(|| anyhow::anyhow!("Invalid commit timestamp {}", commit.commit.timestamp))?
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let mut labels: HashMap<String, String> = opts
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.insert(OSTREE_COMMIT_LABEL.to_string(), commit.checksum.clone());
    if let Some(version) = commit.version() {
        labels.insert(OSTREE_VERSION_LABEL.to_string(), version.to_string());
    }
    let rootfs = oci_image::RootFsBuilder::default()
        .typ("layers")
        .diff_ids(Vec::<String>::new())
        .build()?;
    Ok(new_config()
        .created(created)
        .config(oci_image::ConfigBuilder::default().labels(labels).build()?)
        .rootfs(rootfs)
        .build()?)
}

/// Serialize every layer of `prep`, concurrently, returning them in order.
async fn write_layers(
    repo: &Arc<dyn Repository>,
    prep: &PreparedExport,
    opts: &ExportOpts,
    dest: &dyn ImageDestination,
) -> Result<Vec<ocidir::Layer>> {
    let chunking = Arc::new(prep.chunking.clone());
    let n = chunking.chunks.len();
    let mut writers = Vec::with_capacity(n);
    for _ in 0..n {
        writers.push(dest.push_layer(opts.compression)?);
    }
    futures_util::stream::iter(writers.into_iter().enumerate())
        .map(|(i, w)| {
            let repo = Arc::clone(repo);
            let chunking = Arc::clone(&chunking);
            spawn_blocking_flatten(move || {
                let w = crate::tar::write_chunk(&*repo, &chunking, i, w)?;
                w.complete()
            })
        })
        .buffered(opts.jobs.max(1))
        .try_collect()
        .await
}

/// Write the image for an already prepared export.
#[instrument(level = "debug", skip_all, fields(commit = prep.commit.checksum.as_str()))]
pub async fn write_image(
    repo: &Arc<dyn Repository>,
    prep: &PreparedExport,
    opts: &ExportOpts,
    dest: Box<dyn ImageDestination>,
) -> Result<ExportResult> {
    let layers = write_layers(repo, prep, opts, dest.as_ref()).await?;
    let mut manifest = new_empty_manifest()?.build()?;
    let mut config = image_config(prep, opts)?;
    for (layer, chunk) in layers.into_iter().zip(prep.chunking.chunks.iter()) {
        tracing::debug!("Layer {}: {}", chunk.name, layer.blob.digest_id());
        push_layer_annotated(
            &mut manifest,
            &mut config,
            layer,
            Some(layer_annotations(chunk)),
            &format!("ostree export {} ({})", prep.commit.checksum, chunk.name),
        )?;
    }
    let config = write_json_blob(dest.push_blob()?, &config, MediaType::ImageConfig)?.build()?;
    manifest.set_config(config);
    manifest.set_annotations(Some(manifest_annotations(prep)));
    let desc = dest.push_manifest(&manifest)?;
    dest.finish()?;
    let manifest_digest = desc.digest().to_string();
    parse_sha256_digest(&manifest_digest)?;
    tracing::info!("Exported {} as {manifest_digest}", prep.commit.checksum);
    Ok(ExportResult {
        commit: prep.commit.checksum.clone(),
        base: prep.base().map(ToOwned::to_owned),
        manifest,
        manifest_digest,
    })
}

/// Given a repository and rev, generate a container image at `dest`.
///
/// Serializing the same commit against the same base with the same policy
/// produces byte-identical blobs and manifest.
#[instrument(level = "debug", skip(repo, opts))]
pub async fn encapsulate(
    repo: &Arc<dyn Repository>,
    rev: &str,
    opts: &ExportOpts,
    dest: &ImageReference,
) -> Result<ExportResult> {
    let prep = {
        let repo = Arc::clone(repo);
        let rev = rev.to_string();
        let opts = opts.clone();
        spawn_blocking_flatten(move || prepare_export(&*repo, &rev, &opts)).await?
    };
    let dest = create_destination(dest).with_context(|| format!("Opening {dest}"))?;
    write_image(repo, &prep, opts, dest).await
}
