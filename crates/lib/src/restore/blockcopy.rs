//! Raw block-range copy.
//!
//! The strong-atomicity strategy: the destination partition is
//! overwritten byte for byte from the source partition. It requires
//! both ranges to be equal-sized and unmounted, which is why it only
//! runs from the recovery environment — a mounted, live active root
//! cannot be safely overwritten this way.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};

use anyhow::Result;
use camino::Utf8Path;

use super::{ExcludeSet, RestoreEngine};
use crate::blockdev;
use crate::error::ResetError;
use crate::mount;

/// Copy granularity. 1 MiB amortizes syscall overhead without
/// noticeable memory cost on small boards.
const CHUNK: usize = 1 << 20;

/// The block-copy restore strategy.
#[derive(Debug)]
pub(crate) struct BlockCopy;

impl RestoreEngine for BlockCopy {
    fn restore(&self, source: &Utf8Path, dest: &Utf8Path, _excludes: &ExcludeSet) -> Result<()> {
        let source_bytes = blockdev::device_size(source)?;
        let dest_bytes = blockdev::device_size(dest)?;
        if source_bytes != dest_bytes {
            return Err(ResetError::SizeMismatch {
                source_bytes,
                dest_bytes,
            }
            .into());
        }
        for dev in [source, dest] {
            if mount::device_is_mounted(dev)? {
                return Err(ResetError::Validation(format!(
                    "{dev} is mounted; block copy requires both partitions offline"
                ))
                .into());
            }
        }
        copy_range(source, dest, source_bytes)
    }
}

fn copy_range(source: &Utf8Path, dest: &Utf8Path, total: u64) -> Result<()> {
    let mut src = File::open(source).map_err(|e| read_failed(source, 0, e))?;
    let mut dst = OpenOptions::new()
        .write(true)
        .open(dest)
        .map_err(|e| write_failed(dest, 0, e))?;
    let mut buf = vec![0u8; CHUNK];
    let mut offset: u64 = 0;
    while offset < total {
        let want = std::cmp::min(CHUNK as u64, total - offset) as usize;
        let chunk = &mut buf[..want];
        src.read_exact(chunk)
            .map_err(|e| read_failed(source, offset, e))?;
        dst.write_all(chunk)
            .map_err(|e| write_failed(dest, offset, e))?;
        offset += want as u64;
    }
    dst.sync_all().map_err(|e| write_failed(dest, offset, e))?;
    tracing::debug!("copied {total} bytes from {source} to {dest}");
    Ok(())
}

// The offending offset is part of the audit contract on failure.
fn read_failed(path: &Utf8Path, offset: u64, e: std::io::Error) -> anyhow::Error {
    ResetError::Restore {
        path: path.to_owned(),
        source: std::io::Error::new(e.kind(), format!("read at offset {offset}: {e}")),
    }
    .into()
}

fn write_failed(path: &Utf8Path, offset: u64, e: std::io::Error) -> anyhow::Error {
    ResetError::Restore {
        path: path.to_owned(),
        source: std::io::Error::new(e.kind(), format!("write at offset {offset}: {e}")),
    }
    .into()
}
