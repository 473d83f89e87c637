//! Small filesystem helpers shared across the state machine.

use std::fs::File;
use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8Path;

/// Write `contents` to `path` atomically: staged in the same
/// directory, fsynced, then renamed over the target, with the
/// directory fsynced afterwards. There is never a moment where `path`
/// exists with partial contents.
pub(crate) fn write_atomic(path: &Utf8Path, contents: &[u8]) -> Result<()> {
    let dir = parent_of(path)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".bootmend-tmp.")
        .tempfile_in(dir)
        .with_context(|| format!("staging in {dir}"))?;
    tmp.write_all(contents).context("writing staged contents")?;
    tmp.as_file().sync_all().context("syncing staged contents")?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("renaming over {path}"))?;
    fsync_dir(dir)
}

/// Durably record a directory mutation (rename, create, unlink).
pub(crate) fn fsync_dir(dir: &Utf8Path) -> Result<()> {
    let f = File::open(dir).with_context(|| format!("opening {dir}"))?;
    f.sync_all().with_context(|| format!("syncing {dir}"))
}

pub(crate) fn parent_of(path: &Utf8Path) -> Result<&Utf8Path> {
    path.parent()
        .with_context(|| format!("{path} has no parent directory"))
}
