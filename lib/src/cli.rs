//! # Commandline parsing
//!
//! The `ostree-container` binary is a thin wrapper around
//! [`run_from_iter`]; the command definitions live here so that they can
//! be reused and tested as a library.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use fn_error_context::context;
use ostree_container_utils::format_truncated;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::Write;
use std::num::{NonZeroU32, NonZeroU64};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;

use crate::chunking::ChunkingPolicy;
use crate::container::store::{
    fetch_image_info, ImageImporter, ImportOpts, ImportProgress, LayerProgress, PrepareResult,
    PreparedImport,
};
use crate::container::{
    self as ostree_container, BaseRef, DerivationPolicy, ImageReference, OSTREE_CONTENT_LABEL,
    OSTREE_LAYER_LABEL,
};
use crate::integrity::{Keyring, SignatureStatus, SigningKey, TrustPolicy};
use crate::repo::{CommitBuilder, CommitOpts, LocalRepo, RepoConfig, Repository};
use crate::tokio_util::spawn_blocking_flatten;

/// Parse an [`ImageReference`] from a CLI argument.
pub fn parse_imgref(s: &str) -> Result<ImageReference> {
    ImageReference::try_from(s)
}

/// Parse the base of a derived image from a CLI argument.
pub fn parse_base(s: &str) -> Result<BaseRef> {
    s.parse()
}

/// Parse a `KEY=VALUE` image label.
pub fn parse_label(s: &str) -> Result<(String, String)> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Missing '=' in label {s}"))?;
    if k.is_empty() {
        anyhow::bail!("Empty label key in {s}");
    }
    Ok((k.to_string(), v.to_string()))
}

/// How layers are chosen.
#[derive(Debug, clap::Args)]
pub(crate) struct ChunkingOpts {
    /// Put all objects into a single layer (the default)
    #[clap(long)]
    single_layer: bool,

    /// Spread objects over at most this many layers
    #[clap(long)]
    max_layers: Option<NonZeroU32>,

    /// Start a new layer once a layer would exceed this many bytes
    #[clap(long)]
    max_blob_size: Option<NonZeroU64>,
}

impl ChunkingOpts {
    fn policy(&self) -> Result<ChunkingPolicy> {
        ChunkingPolicy::from_flags(self.single_layer, self.max_layers, self.max_blob_size)
    }
}

/// Options for exporting a commit to a container image.
#[derive(Debug, Parser)]
pub(crate) struct BuildOpts {
    /// Path to the repository
    #[clap(long, value_parser)]
    repo: Utf8PathBuf,

    /// The ref or commit to export
    #[clap(long = "ref")]
    rev: String,

    /// Only export what this base does not have: a ref, a commit, or an
    /// image reference such as `oci:/path/to/base`
    #[clap(long, value_parser = parse_base)]
    from: Option<BaseRef>,

    /// Whether a base is mandatory
    #[clap(long, value_enum, default_value_t)]
    derivation: DerivationPolicy,

    /// Fail if the commit is not signed
    #[clap(long)]
    require_signature: bool,

    #[clap(flatten)]
    chunking: ChunkingOpts,

    /// Additional labels for the image configuration
    #[clap(name = "label", long, short, value_parser = parse_label)]
    labels: Vec<(String, String)>,

    /// Number of layers serialized in parallel
    #[clap(long, default_value_t = 4)]
    jobs: usize,

    /// Compress layers at the fastest level
    #[clap(long)]
    compression_fast: bool,

    /// Print the layers that would be written and exit
    #[clap(long)]
    dry_run: bool,

    /// Image reference, e.g. oci:/path/to/dir or oci-archive:/path/to/image.tar
    #[clap(value_parser = parse_imgref)]
    target: ImageReference,
}

/// Options for importing a container image.
#[derive(Debug, Parser)]
pub(crate) struct PullOpts {
    /// Path to the repository
    #[clap(long, value_parser)]
    repo: Utf8PathBuf,

    /// Ref to update; defaults to the ref recorded in the image
    #[clap(long = "ref")]
    target_ref: Option<String>,

    /// Signature policy; defaults to the repository configuration
    #[clap(long, value_enum)]
    policy: Option<TrustPolicy>,

    /// Trusted public keys (PEM files or directories of them); defaults to
    /// the repository configuration
    #[clap(long)]
    keyring: Vec<Utf8PathBuf>,

    /// Number of layers fetched in parallel
    #[clap(long, default_value_t = 4)]
    jobs: usize,

    /// Don't display progress
    #[clap(long)]
    quiet: bool,

    /// Image reference, e.g. oci:/path/to/dir
    #[clap(value_parser = parse_imgref)]
    image: ImageReference,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum Opt {
    /// Create an empty repository
    Init {
        /// Path to the repository
        #[clap(long, value_parser)]
        repo: Utf8PathBuf,

        /// Default signature policy for pulls
        #[clap(long, value_enum)]
        policy: Option<TrustPolicy>,

        /// Default keyring for pulls
        #[clap(long)]
        keyring: Option<Utf8PathBuf>,
    },
    /// Commit the contents of a directory
    Commit {
        /// Path to the repository
        #[clap(long, value_parser)]
        repo: Utf8PathBuf,

        /// Ref to update; its current commit becomes the parent
        #[clap(long = "ref")]
        refname: String,

        /// One line summary
        #[clap(long, short)]
        subject: Option<String>,

        /// Version string stored in the commit metadata
        #[clap(long)]
        version: Option<String>,

        /// Directory to commit
        dir: Utf8PathBuf,
    },
    /// Sign a commit with an ed25519 private key
    Sign {
        /// Path to the repository
        #[clap(long, value_parser)]
        repo: Utf8PathBuf,

        /// PEM encoded private key
        #[clap(long)]
        key: Utf8PathBuf,

        /// Ref or commit
        rev: String,
    },
    /// Check that a commit carries a trusted signature
    Verify {
        /// Path to the repository
        #[clap(long, value_parser)]
        repo: Utf8PathBuf,

        /// Trusted public keys (PEM files or directories of them)
        #[clap(long, required = true)]
        keyring: Vec<Utf8PathBuf>,

        /// Ref or commit
        rev: String,
    },
    /// Export a commit as a container image
    Build(BuildOpts),
    /// Import a container image, verifying it, and update a ref
    Pull(PullOpts),
    /// Print information about an exported image
    Inspect {
        /// Image reference, e.g. oci:/path/to/dir
        #[clap(value_parser = parse_imgref)]
        image: ImageReference,

        /// Print the manifest as JSON
        #[clap(long)]
        json: bool,
    },
}

/// Toplevel options.
#[derive(Debug, Parser)]
#[clap(name = "ostree-container")]
#[clap(rename_all = "kebab-case")]
#[clap(version)]
pub(crate) struct Cli {
    /// Increase logging verbosity; may be repeated
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(subcommand)]
    opt: Opt,
}

/// Render an import progress notification as a string.
pub fn layer_progress_format(p: &ImportProgress) -> String {
    let (starting, layer) = match p {
        ImportProgress::State(s) => return format!("{s:?}"),
        ImportProgress::LayerStarted(v) => (true, v),
        ImportProgress::LayerCompleted(v) => (false, v),
    };
    // podman outputs 12 characters of digest, let's add 7 for `sha256:`.
    let short_digest = layer.digest().chars().take(12 + 7).collect::<String>();
    if starting {
        let size = indicatif::HumanBytes(layer.size().try_into().unwrap_or_default());
        format!("Fetching layer {short_digest} ({size})")
    } else {
        format!("Fetched layer {short_digest}")
    }
}

/// Write container fetch progress to standard error.
pub async fn handle_layer_progress_print(
    mut layers: Receiver<ImportProgress>,
    mut layer_bytes: tokio::sync::watch::Receiver<Option<LayerProgress>>,
) {
    let style = indicatif::ProgressStyle::default_bar();
    let style = style
        .clone()
        .template("{prefix} {bytes} [{bar:20}] ({eta}) {msg}")
        .unwrap_or(style);
    let pb = indicatif::ProgressBar::new(100);
    pb.set_style(style);
    loop {
        tokio::select! {
            // Always handle layer changes first.
            biased;
            layer = layers.recv() => {
                if let Some(l) = layer {
                    if l.is_starting() {
                        pb.set_position(0);
                    } else if matches!(l, ImportProgress::LayerCompleted(_)) {
                        pb.finish();
                    }
                    pb.set_message(layer_progress_format(&l));
                } else {
                    // If the receiver is disconnected, then we're done
                    break
                };
            },
            r = layer_bytes.changed() => {
                if r.is_err() {
                    // If the receiver is disconnected, then we're done
                    break
                }
                let bytes = layer_bytes.borrow();
                if let Some(bytes) = &*bytes {
                    pb.set_length(bytes.total);
                    pb.set_position(bytes.fetched);
                }
            }
        }
    }
    pb.finish_and_clear();
}

/// Write the status of layers to download.
pub fn print_layer_status(prep: &PreparedImport) {
    if let Some(status) = prep.format_layer_status() {
        println!("{status}");
        let _ = std::io::stdout().flush();
    }
}

#[context("Initializing repository")]
fn repo_init(repo: &Utf8Path, policy: Option<TrustPolicy>, keyring: Option<Utf8PathBuf>) -> Result<()> {
    let mut r = LocalRepo::create(repo)?;
    if policy.is_some() || keyring.is_some() {
        r.set_config(RepoConfig {
            trust_policy: policy,
            keyring,
            ..r.config().clone()
        })?;
    }
    println!("Initialized {repo}");
    Ok(())
}

#[context("Committing {dir}")]
fn repo_commit(
    repo: &Utf8Path,
    refname: &str,
    subject: Option<String>,
    version: Option<String>,
    dir: &Utf8Path,
) -> Result<()> {
    let repo = LocalRepo::open(repo)?;
    let parent = repo.read_ref(refname)?;
    let mut builder = CommitBuilder::new(&repo)?;
    builder.add_directory_contents(dir)?;
    let opts = CommitOpts {
        subject: subject.unwrap_or_else(|| format!("Commit of {dir}")),
        parent,
        version,
        refname: Some(refname.to_string()),
        ..Default::default()
    };
    let commit = builder.commit(&repo, &opts)?;
    println!("{refname} => {commit}");
    Ok(())
}

#[context("Signing {rev}")]
fn repo_sign(repo: &Utf8Path, key: &Utf8Path, rev: &str) -> Result<()> {
    let repo = LocalRepo::open(repo)?;
    let pem = std::fs::read(key).with_context(|| format!("Reading {key}"))?;
    let key = SigningKey::from_pem(&pem)?;
    let commit = repo.resolve_rev(rev)?;
    let sig = key.sign(&commit)?;
    repo.add_signature(&commit, &sig)?;
    println!("Signed {commit}");
    Ok(())
}

fn repo_verify(repo: &Utf8Path, keyring: &[Utf8PathBuf], rev: &str) -> Result<()> {
    let repo = LocalRepo::open(repo)?;
    let keyring = Keyring::load(keyring)?;
    let commit = repo.resolve_rev(rev)?;
    repo.verify_signature(&commit, &keyring)?;
    println!("Signature of {commit} verified");
    Ok(())
}

/// Export a commit to a container image.
async fn container_build(opts: BuildOpts) -> Result<()> {
    let repo: Arc<dyn Repository> = Arc::new(LocalRepo::open(&opts.repo)?);
    let exportopts = ostree_container::ExportOpts {
        chunking: opts.chunking.policy()?,
        base: opts.from,
        derivation: opts.derivation,
        require_signature: opts.require_signature,
        labels: opts.labels.into_iter().collect::<BTreeMap<_, _>>(),
        jobs: opts.jobs,
        compression: if opts.compression_fast {
            flate2::Compression::fast()
        } else {
            flate2::Compression::default()
        },
        ..Default::default()
    };
    if opts.dry_run {
        let prep = {
            let repo = Arc::clone(&repo);
            let rev = opts.rev.clone();
            let exportopts = exportopts.clone();
            spawn_blocking_flatten(move || {
                ostree_container::prepare_export(&*repo, &rev, &exportopts)
            })
            .await?
        };
        prep.chunking.print();
        println!("Content objects: {}", prep.n_content_objects);
        return Ok(());
    }
    let r = ostree_container::encapsulate(&repo, &opts.rev, &exportopts, &opts.target).await?;
    if let Some(base) = r.base.as_deref() {
        println!("Base: {base}");
    }
    println!("{} => {} ({})", r.commit, opts.target, r.manifest_digest);
    Ok(())
}

/// Import a container image into a repository.
async fn container_pull(opts: PullOpts) -> Result<()> {
    let local = LocalRepo::open(&opts.repo)?;
    let config = local.config().clone();
    let trust_policy = opts.policy.or(config.trust_policy).unwrap_or_default();
    let keyring_paths = if opts.keyring.is_empty() {
        config.keyring.into_iter().collect()
    } else {
        opts.keyring
    };
    let keyring = Keyring::load(&keyring_paths)?;
    tracing::debug!(
        "Trust policy {trust_policy:?} with {} trusted key(s)",
        keyring.len()
    );
    let repo: Arc<dyn Repository> = Arc::new(local);
    let source = ostree_container::open_source(&opts.image)
        .with_context(|| format!("Opening {}", opts.image))?;
    let importopts = ImportOpts {
        target_ref: opts.target_ref,
        trust_policy,
        keyring,
        jobs: opts.jobs,
    };
    let mut importer = ImageImporter::new(repo, source, importopts);
    let printer = (!opts.quiet).then(|| {
        let layer_progress = importer.request_progress();
        let layer_byte_progress = importer.request_layer_progress();
        tokio::task::spawn(async move {
            handle_layer_progress_print(layer_progress, layer_byte_progress).await
        })
    });
    let prep = match importer.prepare().await? {
        PrepareResult::AlreadyPresent(prep) => {
            println!("No changes in {} => {}", opts.image, prep.commit);
            prep
        }
        PrepareResult::Ready(prep) => {
            if !opts.quiet {
                print_layer_status(&prep);
            }
            prep
        }
    };
    let import = importer.import(prep).await;
    if let Some(printer) = printer {
        printer.await?;
    }
    let import = import?;
    match &import.signature {
        SignatureStatus::Verified => println!("Signature: verified"),
        SignatureStatus::Unsigned => println!("Signature: none"),
        SignatureStatus::Skipped => println!("Signature: not checked"),
        SignatureStatus::Invalid(reason) => println!("Signature: invalid ({reason})"),
    }
    let stats = &import.stats;
    println!(
        "Wrote {} content and {} metadata objects, {} already present",
        stats.content_written, stats.metadata_written, stats.skipped
    );
    println!("Imported: {} => {}", import.target_ref, import.commit);
    Ok(())
}

/// Print information about an image.
async fn container_inspect(image: &ImageReference, json: bool) -> Result<()> {
    let source = ostree_container::open_source(image)?;
    let info = fetch_image_info(source.as_ref()).await?;
    if json {
        let mut stdout = std::io::stdout().lock();
        serde_json::to_writer_pretty(&mut stdout, &info.manifest)?;
        writeln!(stdout)?;
        return Ok(());
    }
    println!("Manifest: {}", info.manifest_digest);
    println!("Commit: {}", info.commit().unwrap_or("<none>"));
    if let Some(r) = info.refname() {
        println!("Ref: {r}");
    }
    if let Some(v) = info.version() {
        println!("Version: {v}");
    }
    if let Some(b) = info.base() {
        println!("Base: {b}");
    }
    println!("Signatures: {}", info.signatures().len());
    let mut labels = info
        .config
        .config()
        .as_ref()
        .and_then(|c| c.labels().as_ref())
        .map(|l| l.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>())
        .unwrap_or_default();
    labels.sort();
    println!("Labels: {}", format_truncated(labels.iter(), 8, ", "));
    println!(
        "Architecture: {} OS: {}",
        info.config.architecture(),
        info.config.os()
    );
    for layer in info.manifest.layers() {
        let annotations = layer.annotations().as_ref();
        let name = annotations
            .and_then(|a| a.get(OSTREE_LAYER_LABEL))
            .map(|s| s.as_str())
            .unwrap_or("<unknown>");
        let n_objects = annotations
            .and_then(|a| a.get(OSTREE_CONTENT_LABEL))
            .map(|s| s.split(',').filter(|c| !c.is_empty()).count())
            .unwrap_or_default();
        let size = indicatif::HumanBytes(layer.size().try_into().unwrap_or_default());
        println!(
            "  {} {name}: {n_objects} content objects, {size}",
            layer.digest()
        );
    }
    Ok(())
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    ostree_container_utils::initialize_tracing(cli.verbose);
    tracing::trace!("starting");
    run_from_opt(cli.opt).await
}

async fn run_from_opt(opt: Opt) -> Result<()> {
    match opt {
        Opt::Init {
            repo,
            policy,
            keyring,
        } => repo_init(&repo, policy, keyring),
        Opt::Commit {
            repo,
            refname,
            subject,
            version,
            dir,
        } => repo_commit(&repo, &refname, subject, version, &dir),
        Opt::Sign { repo, key, rev } => repo_sign(&repo, &key, &rev),
        Opt::Verify { repo, keyring, rev } => repo_verify(&repo, &keyring, &rev),
        Opt::Build(opts) => container_build(opts).await,
        Opt::Pull(opts) => container_pull(opts).await,
        Opt::Inspect { image, json } => container_inspect(&image, json).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_label() {
        assert_eq!(
            parse_label("a=b=c").unwrap(),
            ("a".to_string(), "b=c".to_string())
        );
        assert_eq!(parse_label("a=").unwrap(), ("a".to_string(), String::new()));
        assert!(parse_label("a").is_err());
        assert!(parse_label("=b").is_err());
    }

    #[test]
    fn test_parse_args() {
        let cli = Cli::try_parse_from([
            "ostree-container",
            "-vv",
            "build",
            "--repo=/repo",
            "--ref=exampleos/stable",
            "--from=oci:/base",
            "--max-layers=8",
            "--label",
            "k=v",
            "oci:/out",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Opt::Build(b) = cli.opt else {
            panic!("Expected build")
        };
        assert_eq!(b.rev, "exampleos/stable");
        assert!(matches!(b.from, Some(BaseRef::Image(_))));
        assert_eq!(
            b.chunking.policy().unwrap(),
            ChunkingPolicy::MaxLayers(NonZeroU32::new(8).unwrap())
        );
        assert_eq!(b.labels, vec![("k".to_string(), "v".to_string())]);

        let cli = Cli::try_parse_from([
            "ostree-container",
            "pull",
            "--repo=/repo",
            "--policy=signature-required",
            "--keyring=/keys",
            "oci-archive:/img.tar",
        ])
        .unwrap();
        let Opt::Pull(p) = cli.opt else {
            panic!("Expected pull")
        };
        assert_eq!(p.policy, Some(TrustPolicy::SignatureRequired));
        assert_eq!(p.keyring, vec![Utf8PathBuf::from("/keys")]);

        // Chunking flags are exclusive
        let cli = Cli::try_parse_from([
            "ostree-container",
            "build",
            "--repo=/repo",
            "--ref=r",
            "--single-layer",
            "--max-layers=2",
            "oci:/out",
        ])
        .unwrap();
        let Opt::Build(b) = cli.opt else {
            panic!("Expected build")
        };
        assert!(b.chunking.policy().is_err());
        assert!(Cli::try_parse_from(["ostree-container", "pull", "--repo=/r", "nope"]).is_err());
    }
}
