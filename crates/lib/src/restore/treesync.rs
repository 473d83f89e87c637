//! Single-pass tree mirroring.
//!
//! Mirrors a source root onto a destination root in one interleaved
//! walk: within each directory, stale destination entries are removed
//! and source entries copied as parts of the same pass. There is
//! deliberately no separate "delete everything" phase — when this
//! engine runs in-band, the destination contains the very executables
//! performing the copy, and a delete phase would remove the
//! interpreter or loader needed to finish the job.

use std::collections::BTreeMap;
use std::fs::Metadata;
use std::os::unix::fs::{fchown, lchown, symlink, MetadataExt, PermissionsExt};

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;
use rustix::fs::{Timespec, Timestamps};

use super::{ExcludeSet, RestoreEngine};
use crate::error::ResetError;

/// The tree-sync restore strategy.
#[derive(Debug)]
pub(crate) struct TreeSync;

impl RestoreEngine for TreeSync {
    #[context("Tree-sync restore of {dest}")]
    fn restore(&self, source: &Utf8Path, dest: &Utf8Path, excludes: &ExcludeSet) -> Result<()> {
        if !source.is_dir() {
            return Err(io_failed(
                source,
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "restore source is not a directory",
                ),
            ));
        }
        std::fs::create_dir_all(dest).map_err(|e| io_failed(dest, e))?;
        sync_dir(source, dest, Utf8Path::new(""), excludes)
    }
}

fn io_failed(path: &Utf8Path, e: std::io::Error) -> anyhow::Error {
    ResetError::Restore {
        path: path.to_owned(),
        source: e,
    }
    .into()
}

fn read_entries(dir: &Utf8Path) -> Result<BTreeMap<String, Metadata>> {
    let mut out = BTreeMap::new();
    let entries = std::fs::read_dir(dir).map_err(|e| io_failed(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_failed(dir, e))?;
        let name = entry.file_name().into_string().map_err(|n| {
            io_failed(
                dir,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("non-UTF-8 file name {n:?}"),
                ),
            )
        })?;
        // DirEntry::metadata does not traverse symlinks
        let meta = entry.metadata().map_err(|e| io_failed(dir, e))?;
        out.insert(name, meta);
    }
    Ok(out)
}

fn sync_dir(src: &Utf8Path, dst: &Utf8Path, rel: &Utf8Path, excludes: &ExcludeSet) -> Result<()> {
    let src_entries = read_entries(src)?;
    // Stale destination entries go first so freed-up names can be
    // reused by the copies below. Both halves run per directory.
    for (name, dst_meta) in read_entries(dst)? {
        let rel_child = rel.join(&name);
        if excludes.contains(&rel_child) {
            tracing::trace!("protected: {rel_child}");
            continue;
        }
        if src_entries.contains_key(&name) {
            continue;
        }
        if excludes.shelters(&rel_child) {
            tracing::debug!("keeping {rel_child}: shelters an excluded path");
            continue;
        }
        let dst_child = dst.join(&name);
        let removed = if dst_meta.is_dir() {
            std::fs::remove_dir_all(&dst_child)
        } else {
            std::fs::remove_file(&dst_child)
        };
        removed.map_err(|e| io_failed(&dst_child, e))?;
    }
    for (name, src_meta) in src_entries {
        let rel_child = rel.join(&name);
        if excludes.contains(&rel_child) {
            tracing::trace!("excluded: {rel_child}");
            continue;
        }
        let src_child = src.join(&name);
        let dst_child = dst.join(&name);
        let ftype = src_meta.file_type();
        if ftype.is_dir() {
            mirror_dir(&dst_child, &src_meta)?;
            sync_dir(&src_child, &dst_child, &rel_child, excludes)?;
        } else if ftype.is_symlink() {
            mirror_symlink(&src_child, &dst_child)?;
        } else if ftype.is_file() {
            if !unchanged(&src_meta, &dst_child) {
                stage_file_copy(&src_child, &dst_child).map_err(|e| io_failed(&src_child, e))?;
            }
        } else {
            // fifos, sockets, device nodes; /dev is excluded wholesale
            // and devtmpfs repopulates it at boot
            tracing::debug!("skipping special file {rel_child}");
        }
    }
    Ok(())
}

fn mirror_dir(dst: &Utf8Path, src_meta: &Metadata) -> Result<()> {
    match std::fs::symlink_metadata(dst) {
        Ok(m) if m.is_dir() => {}
        Ok(_) => {
            // a file or symlink where a directory belongs
            std::fs::remove_file(dst).map_err(|e| io_failed(dst, e))?;
            std::fs::create_dir(dst).map_err(|e| io_failed(dst, e))?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir(dst).map_err(|e| io_failed(dst, e))?;
        }
        Err(e) => return Err(io_failed(dst, e)),
    }
    std::fs::set_permissions(
        dst,
        std::fs::Permissions::from_mode(src_meta.mode() & 0o7777),
    )
    .map_err(|e| io_failed(dst, e))?;
    mirror_ownership(dst, src_meta).map_err(|e| io_failed(dst, e))
}

fn mirror_symlink(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    let target = std::fs::read_link(src).map_err(|e| io_failed(src, e))?;
    if let Ok(existing) = std::fs::read_link(dst) {
        if existing == target {
            return Ok(());
        }
    }
    if let Ok(m) = std::fs::symlink_metadata(dst) {
        if m.is_dir() {
            std::fs::remove_dir_all(dst).map_err(|e| io_failed(dst, e))?;
        }
    }
    // Stage under a temporary name and rename into place so the link
    // never disappears from the destination mid-run.
    let name = dst.file_name().unwrap_or("link");
    let tmp = dst.with_file_name(format!(".bootmend-ln.{name}"));
    let _ = std::fs::remove_file(&tmp);
    symlink(&target, &tmp).map_err(|e| io_failed(&tmp, e))?;
    std::fs::rename(&tmp, dst).map_err(|e| io_failed(dst, e))?;
    let src_meta = std::fs::symlink_metadata(src).map_err(|e| io_failed(src, e))?;
    mirror_ownership(dst, &src_meta).map_err(|e| io_failed(dst, e))
}

// rsync-style quick check: same size and mtime (seconds) means skip.
fn unchanged(src_meta: &Metadata, dst: &Utf8Path) -> bool {
    match std::fs::symlink_metadata(dst) {
        Ok(m) => m.is_file() && m.len() == src_meta.len() && m.mtime() == src_meta.mtime(),
        Err(_) => false,
    }
}

// Ownership can only be preserved with privileges; in-band restores
// always have them, tests do not.
fn mirror_ownership(path: &Utf8Path, meta: &Metadata) -> std::io::Result<()> {
    if !rustix::process::getuid().is_root() {
        return Ok(());
    }
    lchown(path, Some(meta.uid()), Some(meta.gid()))
}

fn timestamps_of(meta: &Metadata) -> Timestamps {
    Timestamps {
        last_access: Timespec {
            tv_sec: meta.atime(),
            tv_nsec: meta.atime_nsec(),
        },
        last_modification: Timespec {
            tv_sec: meta.mtime(),
            tv_nsec: meta.mtime_nsec(),
        },
    }
}

/// Copy `src` over `dst` through a staged temporary file in the
/// destination directory, preserving mode, mtime, and (when
/// privileged) ownership. The final rename means a running executable
/// at `dst` is replaced, never truncated in place.
pub(crate) fn stage_file_copy(src: &Utf8Path, dst: &Utf8Path) -> std::io::Result<()> {
    let src_meta = std::fs::symlink_metadata(src)?;
    if let Ok(m) = std::fs::symlink_metadata(dst) {
        if m.is_dir() {
            std::fs::remove_dir_all(dst)?;
        }
    }
    let dir = dst.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "destination has no parent directory",
        )
    })?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".bootmend-tmp.")
        .tempfile_in(dir)?;
    let mut reader = std::fs::File::open(src)?;
    std::io::copy(&mut reader, tmp.as_file_mut())?;
    if rustix::process::getuid().is_root() {
        fchown(tmp.as_file(), Some(src_meta.uid()), Some(src_meta.gid()))?;
    }
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(src_meta.mode() & 0o7777))?;
    rustix::fs::futimens(tmp.as_file(), &timestamps_of(&src_meta))?;
    tmp.as_file().sync_all()?;
    tmp.persist(dst).map_err(|e| e.error)?;
    Ok(())
}
