//! # Computing the object delta against a base commit
//!
//! Dedup keys on checksum, not path: a file that exists anywhere in the
//! base is omitted even when it moved. The target order is never changed,
//! which keeps the layer contents reproducible.

use crate::objectindex::{ObjectIndex, ObjectMapEntry};
use crate::objects::ObjectType;
use crate::repo::ObjectReader;
use crate::Result;
use std::collections::HashSet;

/// Checksums contained in a base commit.
#[derive(Debug, Default, Clone)]
pub struct BaseObjects {
    content: HashSet<String>,
    metadata: HashSet<(ObjectType, String)>,
}

impl BaseObjects {
    /// Collect everything reachable from the indexed commit.
    pub fn from_index<O: ObjectReader + ?Sized>(index: &ObjectIndex<'_, O>) -> Result<Self> {
        Ok(Self {
            content: index.content_checksums()?,
            metadata: index.metadata_objects()?.into_iter().collect(),
        })
    }

    /// Whether the base holds this file object.
    pub fn contains_content(&self, checksum: &str) -> bool {
        self.content.contains(checksum)
    }

    /// Whether the base holds this metadata object.
    pub fn contains_metadata(&self, objtype: ObjectType, checksum: &str) -> bool {
        self.metadata.contains(&(objtype, checksum.to_string()))
    }
}

/// Filter a target entry sequence down to the entries whose checksum is
/// not in `base`. Without a base the sequence passes through unchanged.
pub fn content_delta<'b, I>(
    target: I,
    base: Option<&'b BaseObjects>,
) -> impl Iterator<Item = Result<ObjectMapEntry>> + 'b
where
    I: IntoIterator<Item = Result<ObjectMapEntry>>,
    I::IntoIter: 'b,
{
    target.into_iter().filter(move |e| match (e, base) {
        (Ok(e), Some(base)) => !base.contains_content(&e.checksum),
        _ => true,
    })
}

/// The objects a derived export must carry.
#[derive(Debug, Clone)]
pub struct ObjectDelta {
    /// Target commit
    pub commit: String,
    /// Base commit, if any
    pub base: Option<String>,
    /// File entries not present in the base, in tree order
    pub content: Vec<ObjectMapEntry>,
    /// Directory metadata and tree objects not present in the base
    pub metadata: Vec<(ObjectType, String)>,
}

impl ObjectDelta {
    /// Number of distinct file objects.
    pub fn n_content_objects(&self) -> usize {
        self.content
            .iter()
            .map(|e| e.checksum.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Compute the delta of `target` against an optional `base`.
#[tracing::instrument(level = "debug", skip_all, fields(commit = target.commit()))]
pub fn resolve<O: ObjectReader + ?Sized>(
    target: &ObjectIndex<'_, O>,
    base: Option<&ObjectIndex<'_, O>>,
) -> Result<ObjectDelta> {
    let base_objects = base.map(BaseObjects::from_index).transpose()?;
    let content =
        content_delta(target.entries(), base_objects.as_ref()).collect::<Result<Vec<_>>>()?;
    let metadata = target
        .metadata_objects()?
        .into_iter()
        .filter(|(t, c)| {
            base_objects
                .as_ref()
                .map_or(true, |b| !b.contains_metadata(*t, c))
        })
        .collect::<Vec<_>>();
    tracing::debug!(
        "Delta: {} entries, {} metadata objects",
        content.len(),
        metadata.len()
    );
    Ok(ObjectDelta {
        commit: target.commit().to_string(),
        base: base.map(|b| b.commit().to_string()),
        content,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn entry(path: &str, checksum: &str) -> Result<ObjectMapEntry> {
        Ok(ObjectMapEntry {
            path: Utf8PathBuf::from(path),
            checksum: checksum.repeat(64),
        })
    }

    fn target() -> Vec<Result<ObjectMapEntry>> {
        vec![
            entry("/a", "1"),
            entry("/b", "2"),
            entry("/c/moved", "3"),
            entry("/d", "4"),
        ]
    }

    #[test]
    fn test_content_delta() -> Result<()> {
        let all: Vec<_> = content_delta(target(), None).collect::<Result<_>>()?;
        assert_eq!(all.len(), 4);

        let base = BaseObjects {
            content: ["1", "3"].iter().map(|c| c.repeat(64)).collect(),
            metadata: Default::default(),
        };
        let delta: Vec<_> = content_delta(target(), Some(&base)).collect::<Result<_>>()?;
        let paths: Vec<_> = delta.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["/b", "/d"]);
        Ok(())
    }

    #[test]
    fn test_errors_pass_through() {
        let base = BaseObjects::default();
        let target = vec![entry("/a", "1"), Err(anyhow::anyhow!("broken"))];
        let r: Result<Vec<_>> = content_delta(target, Some(&base)).collect();
        assert!(r.is_err());
    }
}
