//! Restore engines.
//!
//! Two strategies satisfy one contract: make the destination match the
//! source, all-or-nothing. Which one a deployment uses is decided by
//! configuration (whether a recovery partition exists), never by
//! runtime branching inside a single monolithic function.

mod blockcopy;
mod treesync;

pub(crate) use blockcopy::BlockCopy;
pub(crate) use treesync::{stage_file_copy, TreeSync};

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::consts::DEFAULT_EXCLUDES;

/// Paths (relative to the restore roots) that a restore never touches:
/// skipped when reading the source, and protected from deletion on the
/// destination.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExcludeSet {
    paths: Vec<Utf8PathBuf>,
}

impl ExcludeSet {
    /// The live/virtual trees every tree-sync restore must skip.
    pub(crate) fn defaults() -> Self {
        let mut s = Self::default();
        for p in DEFAULT_EXCLUDES {
            s.insert(*p);
        }
        s
    }

    /// Add a path, relative to the restore roots.
    pub(crate) fn insert(&mut self, rel: impl Into<Utf8PathBuf>) {
        self.paths.push(rel.into());
    }

    /// Whether `rel` (or an ancestor of it) was excluded.
    pub(crate) fn contains(&self, rel: &Utf8Path) -> bool {
        self.paths.iter().any(|e| rel.starts_with(e))
    }

    /// Whether an excluded path lives somewhere beneath `rel`, which
    /// protects `rel` from wholesale deletion.
    pub(crate) fn shelters(&self, rel: &Utf8Path) -> bool {
        self.paths
            .iter()
            .any(|e| e.starts_with(rel) && e.as_path() != rel)
    }
}

/// A strategy for making `dest` match `source`.
///
/// Implementations are all-or-nothing: they either complete the whole
/// copy or abort on the first I/O error, surfacing the offending path.
/// They never retry on their own — partial data may now exist on the
/// destination, and what happens next is a decision for whoever
/// scheduled the operation.
pub(crate) trait RestoreEngine {
    /// Mirror `source` onto `dest`, honoring `excludes`.
    fn restore(&self, source: &Utf8Path, dest: &Utf8Path, excludes: &ExcludeSet) -> Result<()>;
}
