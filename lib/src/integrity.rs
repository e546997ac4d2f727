//! # Blob digests and commit signatures
//!
//! Two independent checks. Blob digests protect the transport: every layer
//! is hashed while it streams in and compared with the manifest before any
//! of its bytes are used. Commit signatures protect the content: they are
//! ed25519 signatures over the ASCII commit checksum, checked once per
//! commit after the tree has been reconstructed.

use crate::objects::{sha256_hex, ObjectType};
use crate::repo::ObjectReader;
use crate::Result;
use anyhow::{anyhow, Context};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use openssl::hash::{Hasher, MessageDigest};
use openssl::pkey::{PKey, Private, Public};
use openssl::sign::{Signer, Verifier};
use pin_project::pin_project;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::pin::Pin;
use std::task::{ready, Context as TaskContext, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// How commit signatures are treated on import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TrustPolicy {
    /// Only verify blob digests
    DigestOnly,
    /// Require a valid signature from the keyring
    SignatureRequired,
    /// Verify signatures when the commit has any; failures only warn
    #[default]
    SignatureIfPresent,
}

/// The outcome of the signature check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
    /// A signature verified against the keyring
    Verified,
    /// The commit has no signatures
    Unsigned,
    /// Signatures exist but none verified
    Invalid(String),
    /// The policy does not check signatures
    Skipped,
}

/// Trusted ed25519 public keys.
#[derive(Debug, Default, Clone)]
pub struct Keyring {
    keys: Vec<PKey<Public>>,
}

impl Keyring {
    /// Load PEM public keys from files, or from every `*.pem` file in
    /// directories.
    #[context("Loading keyring")]
    pub fn load(paths: &[Utf8PathBuf]) -> Result<Self> {
        let mut r = Self::default();
        for path in paths {
            if path.is_dir() {
                let mut entries = path
                    .read_dir_utf8()?
                    .map(|e| e.map(|e| e.into_path()))
                    .collect::<std::io::Result<Vec<_>>>()?;
                entries.sort();
                for p in entries.iter().filter(|p| p.extension() == Some("pem")) {
                    r.add_pem_file(p)?;
                }
            } else {
                r.add_pem_file(path)?;
            }
        }
        tracing::debug!("Loaded {} trusted keys", r.keys.len());
        Ok(r)
    }

    fn add_pem_file(&mut self, path: &Utf8Path) -> Result<()> {
        let buf = std::fs::read(path).with_context(|| format!("Reading {path}"))?;
        self.add_pem(&buf).with_context(|| format!("Parsing {path}"))
    }

    /// Add a PEM encoded public key.
    pub fn add_pem(&mut self, pem: &[u8]) -> Result<()> {
        let key = PKey::public_key_from_pem(pem)?;
        if key.id() != openssl::pkey::Id::ED25519 {
            return Err(anyhow!("Not an ed25519 key"));
        }
        self.keys.push(key);
        Ok(())
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether there are no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn verifies(&self, commit: &str, signature: &[u8]) -> Result<bool> {
        for key in &self.keys {
            let mut v = Verifier::new_without_digest(key)?;
            // A malformed signature is a verification failure, not an error
            if v.verify_oneshot(signature, commit.as_bytes()).unwrap_or(false) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// An ed25519 private key for signing commits.
#[derive(Debug)]
pub struct SigningKey {
    key: PKey<Private>,
}

impl SigningKey {
    /// Generate a new random key.
    pub fn generate() -> Result<Self> {
        Ok(Self {
            key: PKey::generate_ed25519()?,
        })
    }

    /// Parse a PEM (PKCS#8) private key.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let key = PKey::private_key_from_pem(pem)?;
        if key.id() != openssl::pkey::Id::ED25519 {
            return Err(anyhow!("Not an ed25519 key"));
        }
        Ok(Self { key })
    }

    /// The private key as PEM.
    pub fn to_pem(&self) -> Result<Vec<u8>> {
        Ok(self.key.private_key_to_pem_pkcs8()?)
    }

    /// The public key as PEM, suitable for a keyring.
    pub fn public_key_pem(&self) -> Result<Vec<u8>> {
        Ok(self.key.public_key_to_pem()?)
    }

    /// Sign a commit checksum.
    pub fn sign(&self, commit: &str) -> Result<Vec<u8>> {
        let mut signer = Signer::new_without_digest(&self.key)?;
        Ok(signer.sign_oneshot_to_vec(commit.as_bytes())?)
    }
}

/// Check `signatures` over `commit` against `keyring`.
pub fn check_signatures(
    commit: &str,
    signatures: &[Vec<u8>],
    keyring: &Keyring,
) -> Result<SignatureStatus> {
    if signatures.is_empty() {
        return Ok(SignatureStatus::Unsigned);
    }
    if keyring.is_empty() {
        return Ok(SignatureStatus::Invalid("no trusted keys configured".into()));
    }
    for sig in signatures {
        if keyring.verifies(commit, sig)? {
            return Ok(SignatureStatus::Verified);
        }
    }
    Ok(SignatureStatus::Invalid(format!(
        "none of {} signature(s) matched a trusted key",
        signatures.len()
    )))
}

/// Apply `policy` to the signatures of `commit` as stored in `reader`.
/// Fails with [`crate::Error::SignatureInvalid`] only under
/// [`TrustPolicy::SignatureRequired`].
#[tracing::instrument(level = "debug", skip(reader, keyring))]
pub fn verify_commit<O: ObjectReader + ?Sized>(
    reader: &O,
    commit: &str,
    keyring: &Keyring,
    policy: TrustPolicy,
) -> Result<SignatureStatus> {
    if policy == TrustPolicy::DigestOnly {
        return Ok(SignatureStatus::Skipped);
    }
    if !reader.has_object(ObjectType::Commit, commit)? {
        return Err(crate::Error::missing(ObjectType::Commit, commit).into());
    }
    let signatures = match reader.read_detached_metadata(commit)? {
        Some(m) => m.signatures()?,
        None => Vec::new(),
    };
    let status = check_signatures(commit, &signatures, keyring)?;
    match (&status, policy) {
        (SignatureStatus::Verified, _) => {
            tracing::debug!("Verified signature on {commit}");
        }
        (SignatureStatus::Unsigned, TrustPolicy::SignatureRequired) => {
            return Err(crate::Error::SignatureInvalid {
                commit: commit.to_string(),
                reason: "commit is not signed".into(),
            }
            .into())
        }
        (SignatureStatus::Invalid(reason), TrustPolicy::SignatureRequired) => {
            return Err(crate::Error::SignatureInvalid {
                commit: commit.to_string(),
                reason: reason.clone(),
            }
            .into())
        }
        (SignatureStatus::Invalid(reason), _) => {
            tracing::warn!("Ignoring invalid signature on {commit}: {reason}");
        }
        _ => {}
    }
    Ok(status)
}

/// Split a `sha256:<hex>` digest.
pub fn parse_sha256_digest(digest: &str) -> Result<&str> {
    let hex = digest
        .strip_prefix("sha256:")
        .ok_or_else(|| anyhow!("Unsupported digest algorithm in {digest}"))?;
    if !crate::objects::is_sha256(hex) {
        return Err(anyhow!("Invalid digest {digest}"));
    }
    Ok(hex)
}

/// The `sha256:<hex>` digest of a buffer.
pub fn digest_of(data: &[u8]) -> Result<String> {
    Ok(format!("sha256:{}", sha256_hex(data)?))
}

/// Fail with [`crate::Error::BlobDigestMismatch`] unless the digests match.
pub fn verify_blob_digest(expected: &str, actual: &str) -> Result<()> {
    if expected != actual {
        return Err(crate::Error::BlobDigestMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
        .into());
    }
    Ok(())
}

fn new_hasher() -> Result<Hasher> {
    Ok(Hasher::new(MessageDigest::sha256())?)
}

/// A [`Write`] adapter computing the sha256 of everything written.
pub struct Sha256Writer<W> {
    inner: W,
    hasher: Hasher,
    len: u64,
}

impl<W> std::fmt::Debug for Sha256Writer<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sha256Writer").field("len", &self.len).finish()
    }
}

impl<W: Write> Sha256Writer<W> {
    /// Wrap a writer.
    pub fn new(inner: W) -> Result<Self> {
        Ok(Self {
            inner,
            hasher: new_hasher()?,
            len: 0,
        })
    }

    /// Flush and return the writer with the hex digest.
    pub fn finish(mut self) -> Result<(W, String)> {
        self.inner.flush()?;
        let digest = self.hasher.finish()?;
        Ok((self.inner, hex::encode(digest)))
    }

    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether nothing was written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<W: Write> Write for Sha256Writer<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]).map_err(std::io::Error::other)?;
        self.len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// A reader computing the sha256 of everything read through it; usable
/// both as an [`AsyncRead`] and a [`Read`] adapter.
#[pin_project]
pub struct DigestingReader<R> {
    #[pin]
    inner: R,
    hasher: Hasher,
    len: u64,
}

impl<R> std::fmt::Debug for DigestingReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestingReader")
            .field("len", &self.len)
            .finish()
    }
}

impl<R> DigestingReader<R> {
    /// Wrap a reader.
    pub fn new(inner: R) -> Result<Self> {
        Ok(Self {
            inner,
            hasher: new_hasher()?,
            len: 0,
        })
    }

    /// Bytes read so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether nothing was read yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The `sha256:<hex>` digest of everything read.
    pub fn finish(mut self) -> Result<String> {
        let digest = self.hasher.finish()?;
        Ok(format!("sha256:{}", hex::encode(digest)))
    }
}

impl<R: Read> Read for DigestingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]).map_err(std::io::Error::other)?;
        self.len += n as u64;
        Ok(n)
    }
}

impl<R: AsyncRead> AsyncRead for DigestingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        let new = &buf.filled()[before..];
        this.hasher.update(new).map_err(std::io::Error::other)?;
        *this.len += new.len() as u64;
        Poll::Ready(Ok(()))
    }
}
