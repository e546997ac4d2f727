//! Integration tests for exporting and importing images.

use anyhow::{Context, Result};
use camino::Utf8Path;
use oci_spec::image::{Descriptor, ImageConfiguration, ImageManifest};
use ostree_container::chunking::{ChunkingPolicy, COMMIT_CHUNK_NAME};
use ostree_container::container::ocidir::OciDir;
use ostree_container::container::store::{ImageImporter, ImportOpts, PrepareResult};
use ostree_container::container::{
    self, BaseRef, DerivationPolicy, ExportOpts, ImageReference, Transport, OSTREE_BASE_LABEL,
    OSTREE_COMMIT_LABEL, OSTREE_LAYER_LABEL, OSTREE_REF_LABEL, OSTREE_SIGNATURE_LABEL,
    OSTREE_VERSION_LABEL,
};
use ostree_container::fixture::{
    Fixture, CONTENTS_V1_UPDATE, CONTENT_OBJECTS_V0, TESTREF, TEST_TIMESTAMP,
};
use ostree_container::integrity::{SignatureStatus, SigningKey, TrustPolicy};
use ostree_container::objectindex::{ObjectIndex, ObjectMapEntry};
use ostree_container::objects::ObjectType;
use ostree_container::repo::{LocalRepo, ObjectReader, Repository, WriteStats};
use ostree_container::Error;
use std::io::{Read, Write};
use std::num::NonZeroU32;
use std::path::Path;

fn assert_err_contains<T>(r: Result<T>, s: impl AsRef<str>) {
    let s = s.as_ref();
    let msg = format!("{:#}", r.err().unwrap());
    if !msg.contains(s) {
        panic!(r#"Error message "{}" did not contain "{}""#, msg, s);
    }
}

/// The typed failure kind of `r`, which must be an error.
fn error_kind<T: std::fmt::Debug>(r: Result<T>) -> Error {
    let e = r.expect_err("expected failure");
    Error::find(&e)
        .cloned()
        .unwrap_or_else(|| panic!("untyped error: {e:#}"))
}

fn tree_of(repo: &dyn Repository, commit: &str) -> Result<Vec<ObjectMapEntry>> {
    ObjectIndex::new(repo, commit)?.entries().collect()
}

fn annotation<'a>(manifest: &'a ImageManifest, key: &str) -> Option<&'a str> {
    manifest
        .annotations()
        .as_ref()
        .and_then(|a| a.get(key))
        .map(|s| s.as_str())
}

fn ocidir(imgref: &ImageReference) -> Result<OciDir> {
    assert_eq!(imgref.transport, Transport::OciDir);
    OciDir::open(Utf8Path::new(&imgref.name))
}

/// Replace the manifest of an OCI directory, keeping its index entry.
fn rewrite_manifest(
    oci: &OciDir,
    f: impl FnOnce(&mut ImageManifest, &mut ImageConfiguration) -> Result<()>,
) -> Result<()> {
    let desc = oci.read_manifest_descriptor()?;
    let mut manifest = oci.read_manifest()?;
    let mut config: ImageConfiguration = oci.read_json_blob(manifest.config())?;
    f(&mut manifest, &mut config)?;
    manifest.set_config(oci.write_config(&config)?);
    let platform = desc.platform().clone().context("Missing platform")?;
    oci.write_manifest(&manifest, platform)?;
    Ok(())
}

#[tokio::test]
async fn test_container_import_export() -> Result<()> {
    let fixture = Fixture::new_v1()?;
    let commit = fixture.sign(TESTREF)?;
    let (imgref, exported) = fixture.export(TESTREF, &Default::default(), "img").await?;
    assert_eq!(exported.commit, commit);
    assert!(exported.base.is_none());

    let manifest = &exported.manifest;
    assert_eq!(manifest.layers().len(), 1);
    assert_eq!(annotation(manifest, OSTREE_COMMIT_LABEL), Some(commit.as_str()));
    assert_eq!(annotation(manifest, OSTREE_REF_LABEL), Some(TESTREF));
    assert_eq!(annotation(manifest, OSTREE_VERSION_LABEL), Some("42.0"));
    assert!(annotation(manifest, OSTREE_SIGNATURE_LABEL).is_some());
    assert!(annotation(manifest, OSTREE_BASE_LABEL).is_none());

    let oci = ocidir(&imgref)?;
    let config: ImageConfiguration = oci.read_json_blob(manifest.config())?;
    assert_eq!(config.rootfs().diff_ids().len(), 1);
    assert_eq!(config.history().len(), 1);
    assert_eq!(config.created().as_deref(), Some("2023-11-14T22:13:20Z"));
    let labels = config.config().as_ref().unwrap().labels().as_ref().unwrap();
    assert_eq!(labels.get(OSTREE_COMMIT_LABEL), Some(&commit));

    let opts = fixture.import_opts(TrustPolicy::SignatureRequired)?;
    let import = fixture.import(&imgref, opts).await?;
    assert_eq!(import.commit, commit);
    assert_eq!(import.target_ref, TESTREF);
    assert_eq!(import.manifest_digest, exported.manifest_digest);
    assert_eq!(import.signature, SignatureStatus::Verified);
    assert_eq!(import.stats.content_written, CONTENT_OBJECTS_V0 as u64);
    assert_eq!(import.stats.skipped, 0);
    assert_eq!(fixture.destrepo.read_ref(TESTREF)?.as_deref(), Some(commit.as_str()));

    // Same tree, same objects
    similar_asserts::assert_eq!(
        tree_of(&fixture.destrepo, &commit)?,
        tree_of(&fixture.srcrepo, &commit)?
    );
    let c = fixture.destrepo.read_commit(&commit)?;
    assert_eq!(c.version(), Some("42.0"));
    assert_eq!(c.commit.timestamp, TEST_TIMESTAMP);
    assert!(c.is_signed());
    let bash = tree_of(&fixture.destrepo, &commit)?
        .into_iter()
        .find(|e| e.path == "/usr/bin/bash")
        .unwrap();
    let (header, mut content) = fixture.destrepo.query_file(&bash.checksum)?;
    assert_eq!(header.mode, 0o755);
    let mut buf = String::new();
    content.read_to_string(&mut buf)?;
    assert_eq!(buf, "the-bash-shell");
    let arping = tree_of(&fixture.destrepo, &commit)?
        .into_iter()
        .find(|e| e.path == "/usr/bin/arping")
        .unwrap();
    let (header, _) = fixture.destrepo.query_file(&arping.checksum)?;
    assert_eq!(
        header.xattrs.get("security.capability").map(|s| s.as_str()),
        Some(hex::encode("cap_net_raw+p").as_str())
    );
    Ok(())
}

#[tokio::test]
async fn test_export_reproducible() -> Result<()> {
    let fixture = Fixture::new_v1()?;
    let opts = ExportOpts {
        chunking: ChunkingPolicy::MaxLayers(NonZeroU32::new(3).unwrap()),
        ..Default::default()
    };
    let (a, ra) = fixture.export(TESTREF, &opts, "a").await?;
    let (b, rb) = fixture.export(TESTREF, &opts, "b").await?;
    assert_eq!(ra.manifest_digest, rb.manifest_digest);
    similar_asserts::assert_eq!(ra.manifest, rb.manifest);
    let (a, b) = (ocidir(&a)?, ocidir(&b)?);
    for layer in ra.manifest.layers() {
        let mut x = Vec::new();
        a.open_blob(layer.digest())?.read_to_end(&mut x)?;
        let mut y = Vec::new();
        b.open_blob(layer.digest())?.read_to_end(&mut y)?;
        assert_eq!(x, y);
    }

    // The archive form is reproducible too
    let archives = ["a.tar", "b.tar"].map(|n| ImageReference {
        transport: Transport::OciArchive,
        name: fixture.path.join(n).into_string(),
    });
    for imgref in &archives {
        container::encapsulate(&fixture.src(), TESTREF, &opts, imgref).await?;
    }
    let x = std::fs::read(&archives[0].name)?;
    let y = std::fs::read(&archives[1].name)?;
    assert!(x == y, "archives differ");
    Ok(())
}

#[tokio::test]
async fn test_container_chunked() -> Result<()> {
    let fixture = Fixture::new_v1()?;
    let opts = ExportOpts {
        chunking: ChunkingPolicy::MaxLayers(NonZeroU32::new(3).unwrap()),
        jobs: 2,
        ..Default::default()
    };
    let (imgref, exported) = fixture.export(TESTREF, &opts, "img").await?;
    let layers = exported.manifest.layers();
    assert!(layers.len() > 1 && layers.len() <= 3, "{} layers", layers.len());
    let names = layers
        .iter()
        .map(|l| {
            l.annotations()
                .as_ref()
                .and_then(|a| a.get(OSTREE_LAYER_LABEL))
                .cloned()
                .unwrap()
        })
        .collect::<Vec<_>>();
    assert_eq!(names[0], COMMIT_CHUNK_NAME);

    let source = container::open_source(&imgref)?;
    let mut imp = ImageImporter::new(fixture.dest(), source, Default::default());
    let mut progress = imp.request_progress();
    let collector = tokio::spawn(async move {
        let mut started = 0;
        let mut completed = 0;
        while let Some(p) = progress.recv().await {
            if p.is_starting() {
                started += 1;
            } else if matches!(p, container::store::ImportProgress::LayerCompleted(_)) {
                completed += 1;
            }
        }
        (started, completed)
    });
    let prep = match imp.prepare().await? {
        PrepareResult::AlreadyPresent(_) => panic!("should not be already imported"),
        PrepareResult::Ready(r) => r,
    };
    assert_eq!(prep.layers_to_fetch().count(), layers.len());
    assert!(prep.format_layer_status().is_some());
    assert_eq!(prep.info.version(), Some("42.0"));
    let import = imp.import(prep).await?;
    assert_eq!(collector.await?, (layers.len(), layers.len()));
    assert_eq!(import.signature, SignatureStatus::Unsigned);
    assert_eq!(import.stats.content_written, CONTENT_OBJECTS_V0 as u64);
    similar_asserts::assert_eq!(
        tree_of(&fixture.destrepo, &import.commit)?,
        tree_of(&fixture.srcrepo, &import.commit)?
    );
    Ok(())
}

#[tokio::test]
async fn test_import_idempotent() -> Result<()> {
    let fixture = Fixture::new_v1()?;
    let (imgref, _) = fixture.export(TESTREF, &Default::default(), "img").await?;
    let first = fixture.import(&imgref, Default::default()).await?;
    assert!(first.stats.total_written() > 0);
    let before = fixture.destrepo.list_objects()?;

    let source = container::open_source(&imgref)?;
    let mut imp = ImageImporter::new(fixture.dest(), source, Default::default());
    let prep = match imp.prepare().await? {
        PrepareResult::AlreadyPresent(p) => p,
        PrepareResult::Ready(_) => panic!("should be already imported"),
    };
    assert_eq!(prep.layers_to_fetch().count(), 0);
    assert!(prep.format_layer_status().is_none());
    let second = imp.import(prep).await?;
    assert_eq!(second.commit, first.commit);
    assert_eq!(second.stats, WriteStats::default());
    assert_eq!(fixture.destrepo.list_objects()?, before);

    // A present commit under a new ref only moves the ref
    let opts = ImportOpts {
        target_ref: Some("other".into()),
        ..Default::default()
    };
    let third = fixture.import(&imgref, opts).await?;
    assert_eq!(third.stats.total_written(), 0);
    assert_eq!(
        fixture.destrepo.read_ref("other")?.as_deref(),
        Some(first.commit.as_str())
    );
    Ok(())
}

#[tokio::test]
async fn test_dedup_monotone() -> Result<()> {
    let fixture = Fixture::new_v1()?;
    let v1 = fixture.head()?;
    let v2 = fixture.update(CONTENTS_V1_UPDATE, Some("43.0"))?;
    assert_ne!(v1, v2);

    let full = container::prepare_export(&fixture.srcrepo, TESTREF, &Default::default())?;
    assert_eq!(full.n_content_objects, CONTENT_OBJECTS_V0);
    let opts = ExportOpts {
        base: Some(BaseRef::Rev(v1.clone())),
        ..Default::default()
    };
    let derived = container::prepare_export(&fixture.srcrepo, TESTREF, &opts)?;
    assert_eq!(derived.base(), Some(v1.as_str()));
    assert_eq!(derived.n_content_objects, 1);
    assert!(derived.chunking.metadata.len() < full.chunking.metadata.len());

    // Against itself nothing but the commit remains
    let opts = ExportOpts {
        base: Some(BaseRef::Rev(v2.clone())),
        ..Default::default()
    };
    let own = container::prepare_export(&fixture.srcrepo, &v2, &opts)?;
    assert_eq!(own.n_content_objects, 0);
    assert!(own.chunking.metadata.is_empty());
    assert!(own.refname.is_none());

    let opts = ExportOpts {
        derivation: DerivationPolicy::Required,
        ..Default::default()
    };
    assert_err_contains(
        container::prepare_export(&fixture.srcrepo, TESTREF, &opts),
        "A base is required",
    );
    let opts = ExportOpts {
        base: Some(BaseRef::Rev("0".repeat(64))),
        ..Default::default()
    };
    assert!(container::prepare_export(&fixture.srcrepo, TESTREF, &opts).is_err());
    Ok(())
}

#[tokio::test]
async fn test_container_write_derive() -> Result<()> {
    let fixture = Fixture::new_v1()?;
    let v1 = fixture.head()?;
    let (base_img, _) = fixture.export(TESTREF, &Default::default(), "base").await?;
    fixture.import(&base_img, Default::default()).await?;

    let v2 = fixture.update(CONTENTS_V1_UPDATE, Some("43.0"))?;
    let opts = ExportOpts {
        base: Some(BaseRef::Image(base_img.clone())),
        derivation: DerivationPolicy::Required,
        ..Default::default()
    };
    let (imgref, exported) = fixture.export(TESTREF, &opts, "derived").await?;
    assert_eq!(exported.base.as_deref(), Some(v1.as_str()));
    assert_eq!(
        annotation(&exported.manifest, OSTREE_BASE_LABEL),
        Some(v1.as_str())
    );

    // An empty repository lacks the base
    let empty = LocalRepo::create(&fixture.path.join("empty"))?;
    let source = container::open_source(&imgref)?;
    let mut imp = ImageImporter::new(std::sync::Arc::new(empty.clone()), source, Default::default());
    let kind = error_kind(imp.prepare().await);
    assert_eq!(
        kind,
        Error::MissingObject {
            objtype: ObjectType::Commit,
            checksum: v1.clone()
        }
    );
    assert!(empty.list_refs()?.is_empty());

    let import = fixture.import(&imgref, Default::default()).await?;
    assert_eq!(import.commit, v2);
    assert_eq!(import.stats.content_written, 1);
    assert_eq!(fixture.destrepo.read_ref(TESTREF)?.as_deref(), Some(v2.as_str()));
    similar_asserts::assert_eq!(
        tree_of(&fixture.destrepo, &v2)?,
        tree_of(&fixture.srcrepo, &v2)?
    );
    assert_eq!(fixture.destrepo.read_commit(&v2)?.parent(), Some(v1.as_str()));
    Ok(())
}

#[tokio::test]
async fn test_blob_digest_mismatch() -> Result<()> {
    let fixture = Fixture::new_v1()?;
    let (imgref, exported) = fixture.export(TESTREF, &Default::default(), "img").await?;
    let oci = ocidir(&imgref)?;
    let layer = &exported.manifest.layers()[0];
    let path = oci.blob_path(layer.digest())?;
    let mut buf = std::fs::read(&path)?;
    let n = buf.len() / 2;
    buf[n] ^= 0x01;
    std::fs::write(&path, &buf)?;

    let opts = fixture.import_opts(TrustPolicy::DigestOnly)?;
    let kind = error_kind(fixture.import(&imgref, opts).await);
    assert!(
        matches!(kind, Error::BlobDigestMismatch { ref expected, .. } if expected == layer.digest()),
        "{kind:?}"
    );
    assert_eq!(kind.exit_code(), 10);
    assert!(fixture.destrepo.read_ref(TESTREF)?.is_none());
    assert!(fixture.destrepo.list_objects()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_manifest_digest_mismatch() -> Result<()> {
    let fixture = Fixture::new_v1()?;
    let (imgref, exported) = fixture.export(TESTREF, &Default::default(), "img").await?;
    let oci = ocidir(&imgref)?;
    let path = oci.blob_path(&exported.manifest_digest)?;
    let mut buf = std::fs::read(&path)?;
    buf.push(b'\n');
    std::fs::write(&path, &buf)?;
    let kind = error_kind(fixture.import(&imgref, Default::default()).await);
    assert!(matches!(kind, Error::BlobDigestMismatch { .. }), "{kind:?}");
    Ok(())
}

#[tokio::test]
async fn test_signature_policy() -> Result<()> {
    let fixture = Fixture::new_v1()?;
    let commit = fixture.head()?;

    // Export refuses an unsigned commit when asked to, before writing anything
    let opts = ExportOpts {
        require_signature: true,
        ..Default::default()
    };
    let kind = error_kind(fixture.export(TESTREF, &opts, "refused").await);
    assert_eq!(
        kind,
        Error::UnsignedCommit {
            commit: commit.clone()
        }
    );
    assert!(!fixture.path.join("refused").exists());

    let (imgref, _) = fixture.export(TESTREF, &Default::default(), "unsigned").await?;
    let opts = fixture.import_opts(TrustPolicy::SignatureRequired)?;
    let kind = error_kind(fixture.import(&imgref, opts).await);
    assert!(matches!(kind, Error::SignatureInvalid { .. }), "{kind:?}");
    assert_eq!(kind.exit_code(), 13);
    assert!(fixture.destrepo.read_ref(TESTREF)?.is_none());
    assert!(!fixture.destrepo.has_object(ObjectType::Commit, &commit)?);

    // Allowed when signatures are optional
    let opts = fixture.import_opts(TrustPolicy::SignatureIfPresent)?;
    let import = fixture.import(&imgref, opts).await?;
    assert_eq!(import.signature, SignatureStatus::Unsigned);
    Ok(())
}

#[tokio::test]
async fn test_signature_wrong_key() -> Result<()> {
    let fixture = Fixture::new_v1()?;
    let other = SigningKey::generate()?;
    let commit = fixture.head()?;
    fixture.srcrepo.add_signature(&commit, &other.sign(&commit)?)?;
    let (imgref, _) = fixture.export(TESTREF, &Default::default(), "img").await?;

    let opts = fixture.import_opts(TrustPolicy::SignatureRequired)?;
    let kind = error_kind(fixture.import(&imgref, opts).await);
    assert!(matches!(kind, Error::SignatureInvalid { .. }), "{kind:?}");
    assert!(fixture.destrepo.read_ref(TESTREF)?.is_none());

    let opts = fixture.import_opts(TrustPolicy::SignatureIfPresent)?;
    let import = fixture.import(&imgref, opts).await?;
    assert!(matches!(import.signature, SignatureStatus::Invalid(_)));

    let opts = fixture.import_opts(TrustPolicy::DigestOnly)?;
    let import = fixture.import(&imgref, opts).await?;
    assert_eq!(import.signature, SignatureStatus::Skipped);
    Ok(())
}

#[tokio::test]
async fn test_commit_annotation_tampered() -> Result<()> {
    let fixture = Fixture::new_v1()?;
    let (imgref, _) = fixture.export(TESTREF, &Default::default(), "img").await?;
    let forged = "1".repeat(64);
    rewrite_manifest(&ocidir(&imgref)?, |manifest, _| {
        let mut annotations = manifest.annotations().clone().unwrap_or_default();
        annotations.insert(OSTREE_COMMIT_LABEL.to_string(), forged.clone());
        manifest.set_annotations(Some(annotations));
        Ok(())
    })?;
    let kind = error_kind(fixture.import(&imgref, Default::default()).await);
    assert_eq!(
        kind,
        Error::CommitMismatch {
            expected: forged,
            actual: fixture.head()?
        }
    );
    assert_eq!(kind.exit_code(), 12);
    assert!(fixture.destrepo.read_ref(TESTREF)?.is_none());
    assert!(fixture.destrepo.list_objects()?.is_empty());
    Ok(())
}

/// Rebuild the first layer through `f`, which may modify a member's data or
/// drop the member by returning `false`. Digests, sizes and diff_ids are
/// fixed up so that only the object content is off.
fn rewrite_first_layer(
    oci: &OciDir,
    mut f: impl FnMut(&Path, &tar::Header, &mut Vec<u8>) -> bool,
) -> Result<()> {
    let manifest = oci.read_manifest()?;
    let layer: &Descriptor = &manifest.layers()[0];
    let mut out = tar::Builder::new(Vec::new());
    let mut archive =
        tar::Archive::new(flate2::read::GzDecoder::new(oci.open_blob(layer.digest())?));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let mut header = entry.header().clone();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        if !f(&path, &header, &mut data) {
            continue;
        }
        match header.entry_type() {
            tar::EntryType::Symlink => {
                let target = entry.link_name()?.unwrap().into_owned();
                out.append_link(&mut header, &path, target)?;
            }
            _ => out.append_data(&mut header, &path, data.as_slice())?,
        }
    }
    let mut w = oci.create_layer(None)?;
    w.write_all(&out.into_inner()?)?;
    let new_layer = w.complete()?;
    rewrite_manifest(oci, |manifest, config| {
        let mut layers = manifest.layers().clone();
        layers[0].set_digest(new_layer.blob.digest_id());
        layers[0].set_size(new_layer.blob.size.try_into()?);
        manifest.set_layers(layers);
        let mut rootfs = config.rootfs().clone();
        let mut diff_ids = rootfs.diff_ids().clone();
        diff_ids[0] = format!("sha256:{}", new_layer.uncompressed_sha256);
        rootfs.set_diff_ids(diff_ids);
        config.set_rootfs(rootfs);
        Ok(())
    })
}

#[tokio::test]
async fn test_object_tampered() -> Result<()> {
    let fixture = Fixture::new_v1()?;
    let (imgref, _) = fixture.export(TESTREF, &Default::default(), "img").await?;
    let mut tampered = false;
    rewrite_first_layer(&ocidir(&imgref)?, |path, header, data| {
        if !tampered
            && header.entry_type() == tar::EntryType::Regular
            && path.extension().is_some_and(|e| e == "file")
            && !data.is_empty()
        {
            data[0] ^= 0xff;
            tampered = true;
        }
        true
    })?;
    assert!(tampered);

    let kind = error_kind(fixture.import(&imgref, Default::default()).await);
    assert!(
        matches!(kind, Error::ObjectChecksumMismatch { objtype: ObjectType::File, .. }),
        "{kind:?}"
    );
    assert_eq!(kind.exit_code(), 11);
    assert!(fixture.destrepo.read_ref(TESTREF)?.is_none());
    assert!(fixture.destrepo.list_objects()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_missing_dirmeta() -> Result<()> {
    let fixture = Fixture::new_v1()?;
    let commit = fixture.head()?;
    let (imgref, _) = fixture.export(TESTREF, &Default::default(), "img").await?;
    let mut dropped = None;
    rewrite_first_layer(&ocidir(&imgref)?, |path, _, _| {
        if dropped.is_some() || path.extension().map_or(true, |e| e != "dirmeta") {
            return true;
        }
        let shard = path.parent().and_then(|p| p.file_name()).unwrap();
        let rest = path.file_stem().unwrap();
        dropped = Some(format!(
            "{}{}",
            shard.to_str().unwrap(),
            rest.to_str().unwrap()
        ));
        false
    })?;
    let dropped = dropped.expect("no dirmeta member");

    let kind = error_kind(fixture.import(&imgref, Default::default()).await);
    assert_eq!(
        kind,
        Error::MissingObject {
            objtype: ObjectType::DirMeta,
            checksum: dropped
        }
    );
    assert!(fixture.destrepo.read_ref(TESTREF)?.is_none());
    assert!(!fixture.destrepo.has_object(ObjectType::Commit, &commit)?);
    assert!(fixture.destrepo.list_objects()?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_imports() -> Result<()> {
    let fixture = Fixture::new_v1()?;
    let v1 = fixture.head()?;
    let (img1, _) = fixture.export(TESTREF, &Default::default(), "v1").await?;
    let v2 = fixture.update(CONTENTS_V1_UPDATE, Some("43.0"))?;
    let (img2, _) = fixture.export(TESTREF, &Default::default(), "v2").await?;

    let opts = |r: &str| ImportOpts {
        target_ref: Some(r.to_string()),
        ..Default::default()
    };
    let (a, b) = tokio::join!(
        fixture.import(&img1, opts("exampleos/v1")),
        fixture.import(&img2, opts("exampleos/v2"))
    );
    let (a, b) = (a?, b?);
    assert_eq!(a.commit, v1);
    assert_eq!(b.commit, v2);
    // The second transaction to run sees the shared objects as present
    let written = a.stats.content_written + b.stats.content_written;
    assert_eq!(written, CONTENT_OBJECTS_V0 as u64 + 1);

    let refs = fixture.destrepo.list_refs()?;
    assert_eq!(refs.get("exampleos/v1"), Some(&v1));
    assert_eq!(refs.get("exampleos/v2"), Some(&v2));
    for commit in [&v1, &v2] {
        similar_asserts::assert_eq!(
            tree_of(&fixture.destrepo, commit)?,
            tree_of(&fixture.srcrepo, commit)?
        );
        for (objtype, checksum) in ObjectIndex::new(&fixture.srcrepo, commit)?.metadata_objects()? {
            assert!(fixture.destrepo.has_object(objtype, &checksum)?);
        }
    }
    assert!(fixture.destrepo.list_objects()?.len() <= fixture.srcrepo.list_objects()?.len());
    Ok(())
}

#[tokio::test]
async fn test_ref_conflict_publishes_nothing() -> Result<()> {
    let fixture = Fixture::new_v1()?;
    let (img1, _) = fixture.export(TESTREF, &Default::default(), "v1").await?;
    fixture.import(&img1, Default::default()).await?;
    let before = fixture.destrepo.list_objects()?;

    let v2 = fixture.update(CONTENTS_V1_UPDATE, Some("43.0"))?;
    let (img2, _) = fixture.export(TESTREF, &Default::default(), "v2").await?;
    // A ref cannot live where the directory of TESTREF is
    let opts = ImportOpts {
        target_ref: Some("exampleos".into()),
        ..Default::default()
    };
    assert_err_contains(fixture.import(&img2, opts).await, "conflicts");
    assert!(!fixture.destrepo.has_object(ObjectType::Commit, &v2)?);
    assert_eq!(fixture.destrepo.list_objects()?, before);
    assert_eq!(fixture.destrepo.list_refs()?.len(), 1);

    // A conflicting ref appearing after prepare is caught before publishing
    let opts = ImportOpts {
        target_ref: Some("exampleos/next".into()),
        ..Default::default()
    };
    let mut imp = ImageImporter::new(fixture.dest(), container::open_source(&img2)?, opts);
    let prep = match imp.prepare().await? {
        PrepareResult::Ready(r) => r,
        PrepareResult::AlreadyPresent(_) => panic!("should not be already imported"),
    };
    let v1 = fixture.destrepo.read_ref(TESTREF)?.unwrap();
    fixture.destrepo.update_ref("exampleos/next/pinned", &v1)?;
    assert_err_contains(imp.import(prep).await, "conflicts");
    assert!(!fixture.destrepo.has_object(ObjectType::Commit, &v2)?);
    assert_eq!(fixture.destrepo.list_objects()?, before);
    assert_eq!(fixture.destrepo.list_refs()?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_negative_layer_size() -> Result<()> {
    let fixture = Fixture::new_v1()?;
    let (imgref, _) = fixture.export(TESTREF, &Default::default(), "img").await?;
    rewrite_manifest(&ocidir(&imgref)?, |manifest, _| {
        let mut layers = manifest.layers().clone();
        layers[0].set_size(-1);
        manifest.set_layers(layers);
        Ok(())
    })?;
    assert_err_contains(
        fixture.import(&imgref, Default::default()).await,
        "Invalid size for layer",
    );
    assert!(fixture.destrepo.read_ref(TESTREF)?.is_none());
    assert!(fixture.destrepo.list_objects()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_oci_archive() -> Result<()> {
    let fixture = Fixture::new_v1()?;
    let commit = fixture.sign(TESTREF)?;
    let imgref = ImageReference::try_from(format!("oci-archive:{}/img.tar", fixture.path).as_str())?;
    container::encapsulate(&fixture.src(), TESTREF, &Default::default(), &imgref).await?;
    let opts = fixture.import_opts(TrustPolicy::SignatureRequired)?;
    let import = fixture.import(&imgref, opts).await?;
    assert_eq!(import.commit, commit);
    let info = container::store::fetch_image_info(container::open_source(&imgref)?.as_ref()).await?;
    assert_eq!(info.commit(), Some(commit.as_str()));
    assert_eq!(info.signatures().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_import_cancelled() -> Result<()> {
    let fixture = Fixture::new_v1()?;
    let (imgref, _) = fixture.export(TESTREF, &Default::default(), "img").await?;
    let source = container::open_source(&imgref)?;
    let mut imp = ImageImporter::new(fixture.dest(), source, Default::default());
    let prep = match imp.prepare().await? {
        PrepareResult::Ready(r) => r,
        PrepareResult::AlreadyPresent(_) => panic!("should not be already imported"),
    };
    imp.cancellation_token().cancel();
    assert_err_contains(imp.import(prep).await, "cancelled");
    assert!(fixture.destrepo.read_ref(TESTREF)?.is_none());
    assert!(fixture.destrepo.list_objects()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_registry_unsupported() -> Result<()> {
    let fixture = Fixture::new_v1()?;
    let imgref = ImageReference::try_from("docker://quay.io/exampleos/exampleos:latest")?;
    assert_err_contains(
        fixture.import(&imgref, Default::default()).await,
        "Registry transport is not supported",
    );
    Ok(())
}
