//! # Move operating system trees between ostree-style repositories and OCI images
//!
//! This crate translates a checksum-addressed commit tree into a standard
//! container image and back. Export serializes the objects a base does not
//! already have into reproducible tar layers; import verifies every blob
//! digest, every object checksum, the commit and its signature before
//! anything becomes visible in the target repository.
//!
//! The main entry points are [`container::encapsulate`] and
//! [`container::store::ImageImporter`]. Both operate on a
//! [`repo::Repository`], for which [`repo::LocalRepo`] is an on-disk
//! implementation.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

// Re-export our dependencies.  Users of this crate that need
// to reference the OCI types should use these.
pub use oci_spec;

type Result<T> = anyhow::Result<T>;

pub mod chunking;
pub mod cli;
pub mod container;
pub mod dedup;
pub mod error;
pub use error::Error;
pub mod integrity;
pub mod objectindex;
pub mod objects;
pub mod repo;
pub mod tar;
pub mod tokio_util;

#[cfg(feature = "internal-testing-api")]
pub mod fixture;
