//! Test suite fixture.  Should only be used by this library.

#![allow(missing_docs)]

use crate::container::store::{ImageImporter, ImportOpts, ImportResult};
use crate::container::{self, ExportOpts, ExportResult, ImageReference, Transport};
use crate::integrity::{Keyring, SigningKey, TrustPolicy};
use crate::repo::{CommitBuilder, CommitOpts, LocalRepo, Repository};
use crate::objects::{DirMeta, FileHeader, Xattrs};
use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use std::borrow::Cow;
use std::sync::Arc;

pub const TESTREF: &str = "exampleos/x86_64/stable";
/// A fixed timestamp so that commits are reproducible.
pub const TEST_TIMESTAMP: u64 = 1_700_000_000;

#[derive(Debug)]
enum FileDefType {
    Regular(Cow<'static, str>),
    Symlink(Cow<'static, str>),
    Directory,
}

/// One line of a compact tree definition.
///
/// `r PATH CONTENT [KEY=VALUE...]` is a regular file, `l PATH TARGET` a
/// symlink and `d PATH` a directory. `m UID GID MODE` sets the ownership
/// and (octal) mode for the lines that follow; a bare `m` resets it.
#[derive(Debug)]
pub struct FileDef {
    uid: u32,
    gid: u32,
    mode: u32,
    path: Cow<'static, Utf8Path>,
    xattrs: Xattrs,
    ty: FileDefType,
}

impl TryFrom<&'static str> for FileDef {
    type Error = anyhow::Error;

    fn try_from(value: &'static str) -> Result<Self, Self::Error> {
        let mut parts = value.split(' ');
        let tydef = parts
            .next()
            .ok_or_else(|| anyhow!("Missing type definition"))?;
        let name = parts.next().ok_or_else(|| anyhow!("Missing file name"))?;
        let contents = parts.next();
        let contents = move || contents.ok_or_else(|| anyhow!("Missing file contents: {}", value));
        let xattrs = parts
            .map(|xattr| -> Result<(String, String)> {
                let (k, v) = xattr
                    .split_once('=')
                    .ok_or_else(|| anyhow!("Invalid xattr: {xattr}"))?;
                Ok((k.to_string(), hex::encode(v)))
            })
            .collect::<Result<Xattrs>>()?;
        let ty = match tydef {
            // A missing content is an empty file
            "r" => FileDefType::Regular(contents().unwrap_or_default().into()),
            "l" => FileDefType::Symlink(contents()?.into()),
            "d" => FileDefType::Directory,
            _ => anyhow::bail!("Invalid filedef type: {}", value),
        };
        Ok(FileDef {
            uid: 0,
            gid: 0,
            mode: 0o644,
            path: Cow::Borrowed(name.into()),
            xattrs,
            ty,
        })
    }
}

fn parse_mode(line: &str) -> Result<(u32, u32, u32)> {
    let mut parts = line.split(' ').skip(1);
    // An empty mode resets to defaults
    let uid = if let Some(u) = parts.next() {
        u
    } else {
        return Ok((0, 0, 0o644));
    };
    let gid = parts.next().ok_or_else(|| anyhow!("Missing gid"))?;
    let mode = parts.next().ok_or_else(|| anyhow!("Missing mode"))?;
    if parts.next().is_some() {
        anyhow::bail!("Invalid mode: {}", line);
    }
    Ok((uid.parse()?, gid.parse()?, u32::from_str_radix(mode, 8)?))
}

impl FileDef {
    /// Parse a list of newline-separated file definitions.
    pub fn iter_from(defs: &'static str) -> impl Iterator<Item = Result<FileDef>> {
        let mut uid = 0;
        let mut gid = 0;
        let mut mode = 0o644;
        defs.lines()
            .filter(|v| !(v.is_empty() || v.starts_with('#')))
            .filter_map(move |line| {
                if line.starts_with('m') {
                    match parse_mode(line) {
                        Ok(r) => {
                            uid = r.0;
                            gid = r.1;
                            mode = r.2;
                            None
                        }
                        Err(e) => Some(Err(e)),
                    }
                } else {
                    Some(FileDef::try_from(line).map(|mut def| {
                        def.uid = uid;
                        def.gid = gid;
                        def.mode = mode;
                        def
                    }))
                }
            })
    }

    /// Add this entry to a tree under construction.
    pub fn apply(&self, b: &mut CommitBuilder) -> Result<()> {
        match &self.ty {
            FileDefType::Regular(data) => {
                let mut h =
                    FileHeader::regular(self.uid, self.gid, self.mode, data.len().try_into()?);
                h.xattrs = self.xattrs.clone();
                b.add_file(&self.path, &h, data.as_bytes())?;
            }
            FileDefType::Symlink(target) => {
                let mut h = FileHeader::symlink(self.uid, self.gid, target.to_string());
                h.xattrs = self.xattrs.clone();
                b.add_file(&self.path, &h, b"")?;
            }
            FileDefType::Directory => {
                let meta = DirMeta {
                    uid: self.uid,
                    gid: self.gid,
                    mode: self.mode,
                    xattrs: self.xattrs.clone(),
                };
                b.mkdir(&self.path, &meta)?;
            }
        }
        Ok(())
    }
}

/// The base tree used by most tests.
pub static CONTENTS_V0: &str = indoc::indoc! { r##"
r usr/lib/modules/5.10.18-200.x86_64/vmlinuz this-is-a-kernel
r usr/lib/modules/5.10.18-200.x86_64/initramfs this-is-an-initramfs
m 0 0 755
r usr/bin/bash the-bash-shell
l usr/bin/sh bash
r usr/bin/arping arping-binary security.capability=cap_net_raw+p
m 0 0 644
# Some empty files
r usr/lib/emptyfile
r usr/lib64/emptyfile2
# Should be the same object
r usr/bin/hardlink-a testlink
r usr/bin/hardlink-b testlink
r usr/etc/someconfig.conf someconfig
m 10 10 644
r usr/etc/polkit.conf a-polkit-config
m 0 0 644
r usr/lib/sysimage/pkgdb some-package-database
r usr/lib/pkgdb/pkgdb some-package-database
m
d boot
d run
l opt var/opt
m 0 0 1755
d tmp
"## };

/// Distinct file objects in [`CONTENTS_V0`]; the two empty files, the
/// hardlinks and the package databases each share one object.
pub const CONTENT_OBJECTS_V0: usize = 11;

/// An update that changes exactly one file.
pub static CONTENTS_V1_UPDATE: &str = indoc::indoc! { r##"
m 0 0 755
r usr/bin/bash the-updated-bash-shell
"## };

/// A temporary source and destination repository and a signing key.
#[derive(Debug)]
pub struct Fixture {
    // Just holds a reference
    _tempdir: tempfile::TempDir,
    pub path: Utf8PathBuf,
    pub srcrepo: LocalRepo,
    pub destrepo: LocalRepo,
    pub key: SigningKey,
    pub keyring_path: Utf8PathBuf,
}

impl Fixture {
    /// Create the repositories and commit [`CONTENTS_V0`] to [`TESTREF`].
    #[context("Initializing fixture")]
    pub fn new_v1() -> Result<Self> {
        let tempdir = tempfile::tempdir_in("/var/tmp")?;
        let path: &Utf8Path = tempdir.path().try_into()?;
        let path = path.to_path_buf();
        let srcrepo = LocalRepo::create(&path.join("src/repo"))?;
        let destrepo = LocalRepo::create(&path.join("dest/repo"))?;
        let key = SigningKey::generate()?;
        let keyring_path = path.join("keys/test.pem");
        std::fs::create_dir_all(path.join("keys"))?;
        std::fs::write(&keyring_path, key.public_key_pem()?)?;
        let r = Self {
            _tempdir: tempdir,
            path,
            srcrepo,
            destrepo,
            key,
            keyring_path,
        };
        r.commit_filedefs(None, FileDef::iter_from(CONTENTS_V0), Some("42.0"))?;
        Ok(r)
    }

    /// The source repository as a shareable trait object.
    pub fn src(&self) -> Arc<dyn Repository> {
        Arc::new(self.srcrepo.clone())
    }

    /// The destination repository as a shareable trait object.
    pub fn dest(&self) -> Arc<dyn Repository> {
        Arc::new(self.destrepo.clone())
    }

    /// Commit the result of applying `defs` on top of `parent` (or an empty
    /// tree) to [`TESTREF`] in the source repository.
    pub fn commit_filedefs(
        &self,
        parent: Option<&str>,
        defs: impl IntoIterator<Item = Result<FileDef>>,
        version: Option<&str>,
    ) -> Result<String> {
        let mut b = match parent {
            Some(p) => CommitBuilder::from_commit(&self.srcrepo, p)?,
            None => CommitBuilder::new(&self.srcrepo)?,
        };
        for def in defs {
            def?.apply(&mut b)?;
        }
        let opts = CommitOpts {
            subject: "Test commit".into(),
            timestamp: Some(TEST_TIMESTAMP),
            parent: parent.map(ToOwned::to_owned),
            version: version.map(ToOwned::to_owned),
            refname: Some(TESTREF.to_string()),
            ..Default::default()
        };
        b.commit(&self.srcrepo, &opts)
    }

    /// Apply `defs` on top of the current [`TESTREF`].
    pub fn update(&self, defs: &'static str, version: Option<&str>) -> Result<String> {
        let parent = self.head()?;
        self.commit_filedefs(Some(&parent), FileDef::iter_from(defs), version)
    }

    /// The commit [`TESTREF`] points to in the source repository.
    pub fn head(&self) -> Result<String> {
        self.srcrepo
            .read_ref(TESTREF)?
            .ok_or_else(|| anyhow!("{TESTREF} is not set"))
    }

    /// Sign `rev` in the source repository with the fixture key.
    pub fn sign(&self, rev: &str) -> Result<String> {
        let commit = self.srcrepo.resolve_rev(rev)?;
        let sig = self.key.sign(&commit)?;
        self.srcrepo.add_signature(&commit, &sig)?;
        Ok(commit)
    }

    /// A keyring holding the fixture's public key.
    pub fn keyring(&self) -> Result<Keyring> {
        Keyring::load(&[self.keyring_path.clone()])
    }

    /// Import options trusting the fixture key.
    pub fn import_opts(&self, trust_policy: TrustPolicy) -> Result<ImportOpts> {
        Ok(ImportOpts {
            trust_policy,
            keyring: self.keyring()?,
            ..Default::default()
        })
    }

    /// A reference to an OCI directory named `name` inside the fixture.
    pub fn oci_ref(&self, name: &str) -> ImageReference {
        ImageReference {
            transport: Transport::OciDir,
            name: self.path.join(name).into_string(),
        }
    }

    /// Export `rev` from the source repository to the OCI directory `name`.
    pub async fn export(
        &self,
        rev: &str,
        opts: &ExportOpts,
        name: &str,
    ) -> Result<(ImageReference, ExportResult)> {
        let imgref = self.oci_ref(name);
        let r = container::encapsulate(&self.src(), rev, opts, &imgref)
            .await
            .with_context(|| format!("Exporting {rev}"))?;
        Ok((imgref, r))
    }

    /// Import `imgref` into the destination repository.
    pub async fn import(&self, imgref: &ImageReference, opts: ImportOpts) -> Result<ImportResult> {
        let source = container::open_source(imgref)?;
        ImageImporter::new(self.dest(), source, opts).pull().await
    }
}
