//! APIs for importing container images into a repository
//!
//! # Import states
//!
//! An import moves through Fetching, Staging, Committing, Verifying and
//! Finalizing. Every layer is hashed as it streams in and compared with the
//! manifest before any of it is unpacked; every object is hashed as it is
//! staged. The staged objects are handed to the repository as one
//! transaction, the commit is checked against the manifest, and its
//! signature against the keyring. Only then are the objects published and
//! the ref moved. Failing or cancelling at any earlier point drops the
//! transaction and leaves the repository as it was.

use super::ocidir::{DOCKER_TYPE_LAYER_GZIP, DOCKER_TYPE_LAYER_TAR};
use super::*;
use crate::integrity::{
    digest_of, verify_blob_digest, verify_commit, DigestingReader, Keyring, SignatureStatus,
    TrustPolicy,
};
use crate::objectindex::ObjectIndex;
use crate::objects::{
    validate_sha256, Commit, DetachedMetadata, DirMeta, MetadataObject, ObjectType,
};
use crate::repo::{load, Repository, StagingArea, Transaction, WriteStats};
use crate::tokio_util::{check_cancelled, run_with_cancellable, spawn_blocking_flatten};
use ::tokio_util::io::SyncIoBridge;
use ::tokio_util::sync::CancellationToken;
use anyhow::{anyhow, Context};
use fn_error_context::context;
use futures_util::{StreamExt, TryStreamExt};
use oci_image::{Descriptor, ImageConfiguration, ImageManifest, MediaType};
use std::io::{BufRead, Read, Seek};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::watch;

/// The state an import is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportState {
    /// Downloading and digest-checking layer blobs
    Fetching,
    /// Unpacking layers and checking every object
    Staging,
    /// Handing the objects to the repository and checking the commit
    Committing,
    /// Checking the commit signature
    Verifying,
    /// Publishing objects and moving the ref
    Finalizing,
    /// Done
    Completed,
}

/// Sent across a channel to track the import.
#[derive(Debug)]
pub enum ImportProgress {
    /// Entered a new state.
    State(ImportState),
    /// Started fetching this layer.
    LayerStarted(Descriptor),
    /// Successfully fetched and unpacked this layer.
    LayerCompleted(Descriptor),
}

impl ImportProgress {
    /// Returns `true` if this message signifies the start of a new layer being fetched.
    pub fn is_starting(&self) -> bool {
        matches!(self, ImportProgress::LayerStarted(_))
    }
}

/// Sent across a channel to track the byte-level progress of a layer fetch.
#[derive(Clone, Debug)]
pub struct LayerProgress {
    /// Index of the layer in the manifest
    pub layer_index: usize,
    /// Number of bytes downloaded
    pub fetched: u64,
    /// Total number of bytes outstanding
    pub total: u64,
}

type LayerProgressSender = Arc<watch::Sender<Option<LayerProgress>>>;

/// A read wrapper that updates the download progress.
#[pin_project::pin_project]
#[derive(Debug)]
struct ProgressReader<T> {
    #[pin]
    reader: T,
    layer_index: usize,
    fetched: u64,
    total: u64,
    progress: LayerProgressSender,
}

impl<T: AsyncRead> AsyncRead for ProgressReader<T> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.project();
        let len = buf.filled().len();
        match this.reader.poll_read(cx, buf) {
            v @ std::task::Poll::Ready(Ok(_)) => {
                *this.fetched += (buf.filled().len() - len) as u64;
                // Ignore errors, if the caller disconnected from progress that's OK.
                this.progress.send_replace(Some(LayerProgress {
                    layer_index: *this.layer_index,
                    fetched: *this.fetched,
                    total: *this.total,
                }));
                v
            }
            o => o,
        }
    }
}

/// Options for importing an image.
#[derive(Debug, Clone)]
pub struct ImportOpts {
    /// Ref to update; defaults to the image's `ostree.ref` annotation
    pub target_ref: Option<String>,
    /// How commit signatures are treated
    pub trust_policy: TrustPolicy,
    /// Trusted keys
    pub keyring: Keyring,
    /// Maximum number of layers fetched and unpacked concurrently
    pub jobs: usize,
}

impl Default for ImportOpts {
    fn default() -> Self {
        Self {
            target_ref: None,
            trust_policy: Default::default(),
            keyring: Default::default(),
            jobs: 4,
        }
    }
}

/// What the image says about itself.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    /// The verified manifest digest
    pub manifest_digest: String,
    /// The manifest
    pub manifest: ImageManifest,
    /// The verified image configuration
    pub config: ImageConfiguration,
}

fn annotation<'a>(manifest: &'a ImageManifest, key: &str) -> Option<&'a str> {
    manifest
        .annotations()
        .as_ref()
        .and_then(|a| a.get(key))
        .map(|s| s.as_str())
}

impl ImageInfo {
    /// The commit checksum named by the image.
    pub fn commit(&self) -> Option<&str> {
        annotation(&self.manifest, OSTREE_COMMIT_LABEL)
    }

    /// The ref name recorded in the image.
    pub fn refname(&self) -> Option<&str> {
        annotation(&self.manifest, OSTREE_REF_LABEL)
    }

    /// The commit version.
    pub fn version(&self) -> Option<&str> {
        annotation(&self.manifest, OSTREE_VERSION_LABEL)
    }

    /// The base commit a derived image requires.
    pub fn base(&self) -> Option<&str> {
        annotation(&self.manifest, OSTREE_BASE_LABEL)
    }

    /// Signatures carried in the manifest annotations; malformed entries
    /// are skipped.
    pub fn signatures(&self) -> Vec<Vec<u8>> {
        let Some(v) = annotation(&self.manifest, OSTREE_SIGNATURE_LABEL) else {
            return Vec::new();
        };
        v.split(',')
            .filter(|s| !s.is_empty())
            .filter_map(|s| match hex::decode(s) {
                Ok(sig) => Some(sig),
                Err(e) => {
                    tracing::warn!("Ignoring malformed signature annotation: {e}");
                    None
                }
            })
            .collect()
    }

    /// The uncompressed digests of the layers, when the configuration
    /// lists one per layer.
    fn diff_ids(&self) -> Option<&[String]> {
        let diff_ids = self.config.rootfs().diff_ids();
        (diff_ids.len() == self.manifest.layers().len()).then_some(diff_ids.as_slice())
    }
}

/// Fetch a small JSON blob, verifying its digest.
async fn fetch_json_blob<T: serde::de::DeserializeOwned>(
    source: &dyn ImageSource,
    desc: &Descriptor,
) -> Result<T> {
    let blob = source.fetch_blob(desc)?;
    let mut r = DigestingReader::new(AsyncReadExt::take(
        blob,
        crate::objects::MAX_METADATA_SIZE,
    ))?;
    let mut buf = Vec::new();
    AsyncReadExt::read_to_end(&mut r, &mut buf).await?;
    verify_blob_digest(desc.digest(), &r.finish()?)?;
    serde_json::from_slice(&buf).with_context(|| format!("Parsing {}", desc.digest()))
}

/// Fetch and verify the manifest and configuration of an image.
#[context("Fetching manifest")]
pub async fn fetch_image_info(source: &dyn ImageSource) -> Result<ImageInfo> {
    let (buf, listed) = source.fetch_manifest()?;
    let manifest_digest = digest_of(&buf)?;
    verify_blob_digest(&listed, &manifest_digest)?;
    let manifest: ImageManifest = serde_json::from_slice(&buf).context("Parsing manifest")?;
    let config = fetch_json_blob(source, manifest.config()).await?;
    Ok(ImageInfo {
        manifest_digest,
        manifest,
        config,
    })
}

/// Whether a layer of this media type can be unpacked.
fn check_layer_media_type(media_type: &MediaType) -> Result<()> {
    match media_type {
        MediaType::ImageLayerGzip | MediaType::ImageLayer => Ok(()),
        MediaType::Other(t) if t == DOCKER_TYPE_LAYER_GZIP || t == DOCKER_TYPE_LAYER_TAR => Ok(()),
        o => anyhow::bail!("Unhandled layer type: {}", o),
    }
}

fn new_layer_decompressor(
    media_type: &MediaType,
    src: impl BufRead + Send + 'static,
) -> Result<Box<dyn Read + Send>> {
    let r: Box<dyn Read + Send> = match media_type {
        MediaType::ImageLayerGzip => Box::new(flate2::bufread::GzDecoder::new(src)),
        MediaType::Other(t) if t == DOCKER_TYPE_LAYER_GZIP => {
            Box::new(flate2::bufread::GzDecoder::new(src))
        }
        MediaType::ImageLayer => Box::new(src),
        MediaType::Other(t) if t == DOCKER_TYPE_LAYER_TAR => Box::new(src),
        o => anyhow::bail!("Unhandled layer type: {}", o),
    };
    Ok(r)
}

/// Result of invoking [`ImageImporter::prepare`].
#[derive(Debug)]
pub enum PrepareResult {
    /// The commit is present and the target ref already points to it.
    AlreadyPresent(Box<PreparedImport>),
    /// The image needs to be downloaded
    Ready(Box<PreparedImport>),
}

/// Information about what an import will do.
#[derive(Debug)]
pub struct PreparedImport {
    /// The verified manifest and configuration
    pub info: ImageInfo,
    /// The commit the image carries
    pub commit: String,
    /// The ref that will be updated
    pub target_ref: String,
    /// The current target of that ref
    pub previous_commit: Option<String>,
    /// Whether the repository already has the commit
    pub commit_present: bool,
}

impl PreparedImport {
    /// Layers to fetch; none when the commit is already present.
    pub fn layers_to_fetch(&self) -> impl Iterator<Item = &Descriptor> {
        let layers: &[Descriptor] = if self.commit_present {
            &[]
        } else {
            self.info.manifest.layers()
        };
        layers.iter()
    }

    /// Summarize the layers to fetch.
    pub fn format_layer_status(&self) -> Option<String> {
        // Sizes were checked to be non-negative when preparing
        let (n, size) = self.layers_to_fetch().fold((0usize, 0u64), |(n, s), l| {
            (n + 1, s + u64::try_from(l.size()).unwrap_or_default())
        });
        (n > 0).then(|| format!("layers needed: {n} ({})", indicatif::HumanBytes(size)))
    }
}

/// The outcome of a successful import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportResult {
    /// The imported commit
    pub commit: String,
    /// The updated ref
    pub target_ref: String,
    /// Digest of the imported manifest
    pub manifest_digest: String,
    /// What was written
    pub stats: WriteStats,
    /// Outcome of the signature check
    pub signature: SignatureStatus,
}

/// Context for importing a container image.
#[derive(Debug)]
pub struct ImageImporter {
    repo: Arc<dyn Repository>,
    source: Box<dyn ImageSource>,
    opts: ImportOpts,
    cancel: CancellationToken,
    layer_progress: Option<Sender<ImportProgress>>,
    layer_byte_progress: Option<LayerProgressSender>,
}

/// A layer that has been fetched, verified and unpacked.
#[derive(Debug)]
struct StagedLayer {
    index: usize,
    staging: StagingArea,
}

/// The transaction, after the commit has been checked.
#[derive(Debug)]
struct VerifiedImport {
    txn: Option<Box<dyn Transaction>>,
    signature: SignatureStatus,
}

impl ImageImporter {
    /// Create a new importer.
    pub fn new(repo: Arc<dyn Repository>, source: Box<dyn ImageSource>, opts: ImportOpts) -> Self {
        Self {
            repo,
            source,
            opts,
            cancel: CancellationToken::new(),
            layer_progress: None,
            layer_byte_progress: None,
        }
    }

    /// A token that cancels the import when triggered. Cancelling is
    /// honored up to the point where objects are published.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Create a channel receiver that will get notifications for layer fetches.
    pub fn request_progress(&mut self) -> Receiver<ImportProgress> {
        let (s, r) = tokio::sync::mpsc::channel(2);
        self.layer_progress = Some(s);
        r
    }

    /// Create a channel receiver that will get notifications for byte-level progress of layer fetches.
    pub fn request_layer_progress(&mut self) -> watch::Receiver<Option<LayerProgress>> {
        let (s, r) = watch::channel(None);
        self.layer_byte_progress = Some(Arc::new(s));
        r
    }

    async fn send_progress(&self, p: ImportProgress) {
        if let Some(s) = self.layer_progress.as_ref() {
            // The receiver going away is fine
            let _ = s.send(p).await;
        }
    }

    async fn set_state(&self, state: ImportState) {
        tracing::info!("Import state: {state:?}");
        self.send_progress(ImportProgress::State(state)).await;
    }

    /// Fetch and verify the manifest, and determine what needs to be done.
    /// Nothing is written.
    #[context("Preparing import")]
    pub async fn prepare(&mut self) -> Result<PrepareResult> {
        check_cancelled(&self.cancel)?;
        let info = run_with_cancellable(fetch_image_info(self.source.as_ref()), &self.cancel).await?;
        let commit = info
            .commit()
            .ok_or_else(|| anyhow!("Image has no {OSTREE_COMMIT_LABEL} annotation"))?;
        let commit = validate_sha256(commit.to_string())?;
        let target_ref = self
            .opts
            .target_ref
            .as_deref()
            .or(info.refname())
            .ok_or_else(|| anyhow!("No target ref given and the image names none"))?
            .to_string();
        self.repo.check_ref(&target_ref)?;
        for layer in info.manifest.layers() {
            check_layer_media_type(layer.media_type())?;
            u64::try_from(layer.size())
                .with_context(|| format!("Invalid size for layer {}", layer.digest()))?;
        }
        let previous_commit = self.repo.read_ref(&target_ref)?;
        let commit_present = self.repo.has_object(ObjectType::Commit, &commit)?;
        if !commit_present {
            if let Some(base) = info.base() {
                if !self.repo.has_object(ObjectType::Commit, base)? {
                    return Err(crate::Error::missing(ObjectType::Commit, base).into());
                }
            }
        }
        let up_to_date = commit_present && previous_commit.as_deref() == Some(commit.as_str());
        let prep = Box::new(PreparedImport {
            info,
            commit,
            target_ref,
            previous_commit,
            commit_present,
        });
        Ok(if up_to_date {
            PrepareResult::AlreadyPresent(prep)
        } else {
            PrepareResult::Ready(prep)
        })
    }

    /// Fetch, verify and unpack one layer into its own staging area.
    async fn fetch_layer(
        &self,
        index: usize,
        layer: &Descriptor,
        diff_id: Option<String>,
        staging: StagingArea,
    ) -> Result<StagedLayer> {
        tracing::debug!("fetching {}", layer.digest());
        self.send_progress(ImportProgress::LayerStarted(layer.clone()))
            .await;
        let blob = self.source.fetch_blob(layer)?;
        let blob: BlobReader = match self.layer_byte_progress.as_ref() {
            Some(progress) => Box::new(ProgressReader {
                reader: blob,
                layer_index: index,
                fetched: 0,
                total: u64::try_from(layer.size())?,
                progress: Arc::clone(progress),
            }),
            None => blob,
        };
        let repo = Arc::clone(&self.repo);
        let desc = layer.clone();
        let cancel = self.cancel.clone();
        let staging = spawn_blocking_flatten(move || {
            unpack_layer(blob, &desc, diff_id.as_deref(), &*repo, staging, &cancel)
        })
        .await?;
        self.send_progress(ImportProgress::LayerCompleted(layer.clone()))
            .await;
        Ok(StagedLayer { index, staging })
    }

    /// Fetching, Staging, Committing and Verifying. The returned
    /// transaction has not been published.
    async fn fetch_and_verify(&self, prep: &PreparedImport) -> Result<VerifiedImport> {
        let commit = prep.commit.clone();
        if prep.commit_present {
            tracing::debug!("Commit {commit} already present");
            self.set_state(ImportState::Verifying).await;
            let repo = Arc::clone(&self.repo);
            let keyring = self.opts.keyring.clone();
            let policy = self.opts.trust_policy;
            let signature = spawn_blocking_flatten(move || {
                verify_commit(&*repo, &commit, &keyring, policy)
            })
            .await?;
            return Ok(VerifiedImport {
                txn: None,
                signature,
            });
        }

        self.set_state(ImportState::Fetching).await;
        let mut staging = self.repo.new_staging_area()?;
        let diff_ids = prep.info.diff_ids();
        let mut children = Vec::new();
        for (i, layer) in prep.info.manifest.layers().iter().enumerate() {
            let diff_id = diff_ids.map(|d| d[i].clone());
            children.push((i, layer, diff_id, staging.new_child()?));
        }
        let mut staged: Vec<StagedLayer> = futures_util::stream::iter(children)
            .map(|(i, layer, diff_id, child)| self.fetch_layer(i, layer, diff_id, child))
            .buffer_unordered(self.opts.jobs.max(1))
            .try_collect()
            .await?;

        self.set_state(ImportState::Staging).await;
        staged.sort_by_key(|l| l.index);
        for l in staged {
            staging.merge(l.staging)?;
        }
        let signatures = prep.info.signatures();
        if !signatures.is_empty() {
            let mut meta = DetachedMetadata::default();
            for sig in &signatures {
                meta.add_signature(sig);
            }
            staging.add_detached_metadata(&commit, meta)?;
        }
        check_staged_commit(&staging, &commit)?;
        check_cancelled(&self.cancel)?;

        self.set_state(ImportState::Committing).await;
        let repo = Arc::clone(&self.repo);
        let c = commit.clone();
        let txn = spawn_blocking_flatten(move || {
            let txn = repo.write_objects(staging)?;
            verify_written_tree(txn.as_ref(), &c)?;
            Ok(txn)
        })
        .await?;
        check_cancelled(&self.cancel)?;

        self.set_state(ImportState::Verifying).await;
        let keyring = self.opts.keyring.clone();
        let policy = self.opts.trust_policy;
        let (txn, signature) = spawn_blocking_flatten(move || {
            let status = verify_commit(txn.as_ref(), &commit, &keyring, policy)?;
            Ok((txn, status))
        })
        .await?;
        Ok(VerifiedImport {
            txn: Some(txn),
            signature,
        })
    }

    /// Import a prepared image. On error, nothing has been published and
    /// the target ref is unchanged.
    #[tracing::instrument(level = "debug", skip_all, fields(commit = prep.commit.as_str()))]
    pub async fn import(self, prep: Box<PreparedImport>) -> Result<ImportResult> {
        let verified = run_with_cancellable(self.fetch_and_verify(&prep), &self.cancel).await?;
        check_cancelled(&self.cancel)?;

        // Past this point the import is no longer cancellable.
        self.set_state(ImportState::Finalizing).await;
        let repo = Arc::clone(&self.repo);
        let commit = prep.commit.clone();
        let target_ref = prep.target_ref.clone();
        let previous = prep.previous_commit.clone();
        let txn = verified.txn;
        let stats = spawn_blocking_flatten(move || {
            let move_ref = previous.as_deref() != Some(commit.as_str());
            if move_ref {
                repo.check_ref(&target_ref)?;
            }
            let stats = match txn {
                Some(txn) => txn.commit()?,
                None => WriteStats::default(),
            };
            if move_ref {
                repo.update_ref(&target_ref, &commit)?;
            }
            Ok(stats)
        })
        .await?;
        self.set_state(ImportState::Completed).await;
        tracing::info!(
            "Imported {} => {}: {} objects written",
            prep.target_ref,
            prep.commit,
            stats.total_written()
        );
        Ok(ImportResult {
            commit: prep.commit.clone(),
            target_ref: prep.target_ref.clone(),
            manifest_digest: prep.info.manifest_digest.clone(),
            stats,
            signature: verified.signature,
        })
    }

    /// Prepare and import in one step. An image whose commit the target
    /// ref already points to is only re-verified.
    pub async fn pull(mut self) -> Result<ImportResult> {
        let prep = match self.prepare().await? {
            PrepareResult::Ready(prep) | PrepareResult::AlreadyPresent(prep) => prep,
        };
        self.import(prep).await
    }
}

/// Stream a layer blob to a temporary file, verify its digest, then unpack
/// and validate its objects.
fn unpack_layer(
    blob: BlobReader,
    desc: &Descriptor,
    diff_id: Option<&str>,
    existing: &dyn Repository,
    mut staging: StagingArea,
    cancel: &CancellationToken,
) -> Result<StagingArea> {
    let mut tmpf = tempfile::tempfile_in(staging.path())?;
    let mut src = SyncIoBridge::new(DigestingReader::new(blob)?);
    std::io::copy(&mut src, &mut tmpf).with_context(|| format!("Fetching {}", desc.digest()))?;
    let digest = src.into_inner().finish()?;
    verify_blob_digest(desc.digest(), &digest)?;
    check_cancelled(cancel)?;

    tmpf.rewind()?;
    let decompressed = new_layer_decompressor(
        desc.media_type(),
        std::io::BufReader::new(tmpf),
    )?;
    let mut tarstream = DigestingReader::new(decompressed)?;
    let stats = crate::tar::import_layer(&mut tarstream, existing, &mut staging)
        .with_context(|| format!("Unpacking {}", desc.digest()))?;
    // Consume any trailing padding so the uncompressed digest is complete
    std::io::copy(&mut tarstream, &mut std::io::sink())?;
    if let Some(diff_id) = diff_id {
        verify_blob_digest(diff_id, &tarstream.finish()?)?;
    }
    tracing::debug!(
        "Layer {}: {} objects staged, {} present",
        desc.digest(),
        stats.staged,
        stats.skipped
    );
    Ok(staging)
}

/// The layers must carry exactly the commit the manifest names.
fn check_staged_commit(staging: &StagingArea, expected: &str) -> Result<()> {
    let staged: Vec<&str> = staging.commits().collect();
    match staged.as_slice() {
        [c] if *c == expected => Ok(()),
        [] => Err(crate::Error::CommitMismatch {
            expected: expected.to_string(),
            actual: "none".to_string(),
        }
        .into()),
        o => Err(crate::Error::CommitMismatch {
            expected: expected.to_string(),
            actual: o.join(","),
        }
        .into()),
    }
}

/// Walk the tree of `commit` as seen through the open transaction, load
/// every directory metadata object it references, and recompute the commit
/// checksum from its canonical encoding. Any absent object is
/// [`crate::Error::MissingObject`].
fn verify_written_tree(txn: &dyn Transaction, commit: &str) -> Result<()> {
    let c: Commit = load(txn, commit)?;
    let index = ObjectIndex::from_parts(txn, commit, &c);
    let mut n = 0u64;
    for entry in index.entries() {
        entry?;
        n += 1;
    }
    let metadata = index.metadata_objects()?;
    for (objtype, checksum) in &metadata {
        // Trees were loaded by the walk above
        if *objtype == ObjectType::DirMeta {
            let _: DirMeta = load(txn, checksum)?;
        }
    }
    let n_meta = metadata.len();
    let actual = c.checksum()?;
    if actual != commit {
        return Err(crate::Error::CommitMismatch {
            expected: commit.to_string(),
            actual,
        }
        .into());
    }
    tracing::debug!("Verified tree of {commit}: {n} files, {n_meta} metadata objects");
    Ok(())
}

/// Open `imgref` and import it into `repo`.
pub async fn pull(
    repo: Arc<dyn Repository>,
    imgref: &ImageReference,
    opts: ImportOpts,
) -> Result<ImportResult> {
    let source = open_source(imgref).with_context(|| format!("Opening {imgref}"))?;
    ImageImporter::new(repo, source, opts).pull().await
}
