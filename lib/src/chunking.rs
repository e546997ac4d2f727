//! Split an object delta into layers

// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::num::{NonZeroU32, NonZeroU64};

use crate::dedup::ObjectDelta;
use crate::objects::ObjectType;
use crate::repo::ObjectReader;
use crate::Result;
use anyhow::anyhow;
use camino::Utf8PathBuf;
use indexmap::IndexMap;
use indicatif::HumanBytes;

/// Maximum number of layers (chunks) we will use.
// We take half the limit of 128.
pub const MAX_CHUNKS: u32 = 64;

/// Name of the first layer, which carries the commit and metadata.
pub const COMMIT_CHUNK_NAME: &str = "ostree-commit";

/// Maps from a file checksum to its size and paths (several when the same
/// content appears more than once in the tree).
pub type ChunkMapping = IndexMap<String, (u64, Vec<Utf8PathBuf>)>;

/// How to split the delta into layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkingPolicy {
    /// Everything in one layer
    #[default]
    SingleLayer,
    /// Start a new layer once adding the next object would exceed this
    /// many content bytes; an oversized object gets a layer of its own
    MaxBlobSize(NonZeroU64),
    /// Spread the content over at most this many layers, in tree order
    MaxLayers(NonZeroU32),
}

impl ChunkingPolicy {
    /// Build a policy from the command line flags, which are exclusive.
    pub fn from_flags(
        single_layer: bool,
        max_layers: Option<NonZeroU32>,
        max_blob_size: Option<NonZeroU64>,
    ) -> Result<Self> {
        match (single_layer, max_layers, max_blob_size) {
            (_, None, None) => Ok(Self::SingleLayer),
            (false, Some(n), None) => {
                if n.get() > MAX_CHUNKS {
                    return Err(anyhow!("At most {MAX_CHUNKS} layers are supported"));
                }
                Ok(Self::MaxLayers(n))
            }
            (false, None, Some(b)) => Ok(Self::MaxBlobSize(b)),
            _ => Err(anyhow!(
                "Only one of single layer, max layers and max blob size may be given"
            )),
        }
    }
}

/// One future layer.
#[derive(Debug, Default, Clone)]
pub struct Chunk {
    /// Layer name, recorded in the layer annotations
    pub name: String,
    /// File objects, in order
    pub content: ChunkMapping,
    /// Sum of the content sizes
    pub size: u64,
}

impl Chunk {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Move an object from this chunk to `dest`; returns false if it was
    /// not here.
    pub(crate) fn move_obj(&mut self, dest: &mut Self, checksum: &str) -> bool {
        if let Some((name, (size, paths))) = self.content.shift_remove_entry(checksum) {
            let v = dest.content.insert(name, (size, paths));
            debug_assert!(v.is_none());
            self.size -= size;
            dest.size += size;
            true
        } else {
            false
        }
    }
}

/// The layers of an export: the first carries the commit and all delta
/// metadata objects; file objects are spread over all of them, each in
/// exactly one layer.
#[derive(Debug, Clone)]
pub struct Chunking {
    /// Target commit
    pub commit: String,
    /// Base commit the delta was computed against
    pub base: Option<String>,
    /// Directory metadata and trees, carried by the first layer
    pub metadata: Vec<(ObjectType, String)>,
    /// Layers, in order
    pub chunks: Vec<Chunk>,
}

impl Chunking {
    /// Partition `delta` according to `policy`.
    pub fn new<O: ObjectReader + ?Sized>(
        reader: &O,
        delta: &ObjectDelta,
        policy: ChunkingPolicy,
    ) -> Result<Self> {
        let mut all = Chunk::new(COMMIT_CHUNK_NAME);
        for entry in &delta.content {
            if let Some((_, paths)) = all.content.get_mut(&entry.checksum) {
                paths.push(entry.path.clone());
                continue;
            }
            let (header, _) = reader.query_file(&entry.checksum)?;
            all.size += header.size;
            all.content
                .insert(entry.checksum.clone(), (header.size, vec![entry.path.clone()]));
        }
        let chunks = match policy {
            ChunkingPolicy::SingleLayer => vec![all],
            ChunkingPolicy::MaxBlobSize(max) => split_greedy(all, max.get(), u32::MAX),
            ChunkingPolicy::MaxLayers(n) => {
                let target = all.size.div_ceil(u64::from(n.get())).max(1);
                split_greedy(all, target, n.get())
            }
        };
        tracing::debug!("Split {} into {} layers", delta.commit, chunks.len());
        Ok(Self {
            commit: delta.commit.clone(),
            base: delta.base.clone(),
            metadata: delta.metadata.clone(),
            chunks,
        })
    }

    /// Print the layer breakdown to stdout.
    pub fn print(&self) {
        println!("Commit: {}", self.commit);
        if let Some(base) = self.base.as_deref() {
            println!("Base: {base}");
        }
        println!("Metadata objects: {}", self.metadata.len());
        for (n, chunk) in self.chunks.iter().enumerate() {
            println!(
                "Chunk {}: \"{}\": objects:{} size:{}",
                n,
                chunk.name,
                chunk.content.len(),
                HumanBytes(chunk.size)
            );
        }
    }
}

/// Fill chunks in order; the last allowed chunk takes the remainder.
fn split_greedy(mut all: Chunk, max_size: u64, max_chunks: u32) -> Vec<Chunk> {
    let order: Vec<(String, u64)> = all
        .content
        .iter()
        .map(|(k, (size, _))| (k.clone(), *size))
        .collect();
    let mut chunks = vec![Chunk::new(COMMIT_CHUNK_NAME)];
    for (checksum, size) in order {
        let n_chunks = chunks.len() as u32;
        let Some(cur) = chunks.last_mut() else {
            break;
        };
        let full = !cur.content.is_empty() && cur.size + size > max_size;
        if full && n_chunks < max_chunks {
            chunks.push(Chunk::new(&format!("content-{n_chunks}")));
        }
        if let Some(cur) = chunks.last_mut() {
            all.move_obj(cur, &checksum);
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(sizes: &[u64]) -> Chunk {
        let mut c = Chunk::new(COMMIT_CHUNK_NAME);
        for (i, s) in sizes.iter().enumerate() {
            c.content
                .insert(format!("{i:064}"), (*s, vec![format!("/f{i}").into()]));
            c.size += s;
        }
        c
    }

    fn shape(chunks: &[Chunk]) -> Vec<Vec<u64>> {
        chunks
            .iter()
            .map(|c| c.content.values().map(|v| v.0).collect())
            .collect()
    }

    #[test]
    fn test_max_blob_size() {
        let chunks = split_greedy(mapping(&[10, 10, 25, 5, 5]), 20, u32::MAX);
        assert_eq!(shape(&chunks), vec![vec![10, 10], vec![25], vec![5, 5]]);
        assert_eq!(chunks[0].name, COMMIT_CHUNK_NAME);
        assert_eq!(chunks[2].name, "content-2");
        assert_eq!(chunks.iter().map(|c| c.size).sum::<u64>(), 55);
    }

    #[test]
    fn test_max_layers() {
        let all = mapping(&[1, 1, 1, 1, 1, 1, 1]);
        let target = all.size.div_ceil(3);
        let chunks = split_greedy(all, target, 3);
        assert_eq!(shape(&chunks), vec![vec![1, 1, 1], vec![1, 1, 1], vec![1]]);
        let chunks = split_greedy(mapping(&[5, 5, 5, 5]), 1, 2);
        assert_eq!(shape(&chunks), vec![vec![5], vec![5, 5, 5]]);
    }

    #[test]
    fn test_empty() {
        let chunks = split_greedy(mapping(&[]), 1, 4);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.is_empty());
    }

    #[test]
    fn test_from_flags() {
        assert_eq!(
            ChunkingPolicy::from_flags(false, None, None).unwrap(),
            ChunkingPolicy::SingleLayer
        );
        let n = NonZeroU32::new(8).unwrap();
        assert_eq!(
            ChunkingPolicy::from_flags(false, Some(n), None).unwrap(),
            ChunkingPolicy::MaxLayers(n)
        );
        let too_many = NonZeroU32::new(MAX_CHUNKS + 1).unwrap();
        assert!(ChunkingPolicy::from_flags(false, Some(too_many), None).is_err());
        assert!(ChunkingPolicy::from_flags(true, Some(n), None).is_err());
        let b = NonZeroU64::new(1024).unwrap();
        assert!(ChunkingPolicy::from_flags(false, Some(n), Some(b)).is_err());
    }
}
