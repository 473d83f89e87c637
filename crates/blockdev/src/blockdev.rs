//! Block device enumeration backed by util-linux.
//!
//! Partition roles in bootmend are resolved by filesystem label, never
//! by partition index; this crate provides the label-indexed view of
//! `lsblk` output that the rest of the tool builds on.

use std::os::unix::fs::FileTypeExt;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use bootmend_utils::CommandRunExt;

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// A node in the lsblk device tree: a whole disk or one of its partitions.
#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    /// Kernel device name (e.g. `mmcblk0p2`)
    pub name: String,
    /// Filesystem label, if any
    pub label: Option<String>,
    /// Filesystem type, if any
    pub fstype: Option<String>,
    /// Size in bytes
    pub size: u64,
    /// Child devices (partitions of a disk)
    pub children: Option<Vec<Device>>,
    // NOTE not available on older util-linux; path() backfills it.
    path: Option<String>,
}

impl Device {
    /// Path to the device node. RHEL8's lsblk doesn't have PATH, so we do it.
    pub fn path(&self) -> Utf8PathBuf {
        self.path
            .clone()
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| format!("/dev/{}", self.name).into())
    }
}

/// List all block devices on the system, with their partitions.
#[context("Listing block devices")]
pub fn list_all() -> Result<Vec<Device>> {
    let devs: DevicesOutput = Command::new("lsblk")
        .args(["-J", "-b", "-O"])
        .log_debug()
        .run_and_parse_json()?;
    Ok(devs.blockdevices)
}

/// Find every device in `devices` (at any depth) carrying the given
/// filesystem label. The caller decides whether multiple matches are
/// an error; for role resolution they always are.
pub fn find_by_label<'a>(devices: &'a [Device], label: &str) -> Vec<&'a Device> {
    fn walk<'a>(dev: &'a Device, label: &str, out: &mut Vec<&'a Device>) {
        if dev.label.as_deref() == Some(label) {
            out.push(dev);
        }
        for child in dev.children.iter().flatten() {
            walk(child, label, out);
        }
    }
    let mut out = Vec::new();
    for dev in devices {
        walk(dev, label, &mut out);
    }
    out
}

/// Size in bytes of a block device, or of a regular file standing in
/// for one (as in tests and loopback-backed setups).
#[context("Sizing {path}")]
pub fn device_size(path: &Utf8Path) -> Result<u64> {
    let meta = std::fs::metadata(path).with_context(|| format!("statting {path}"))?;
    if meta.file_type().is_block_device() {
        let s = Command::new("blockdev")
            .arg("--getsize64")
            .arg(path)
            .log_debug()
            .run_get_string()?;
        s.trim()
            .parse()
            .with_context(|| format!("parsing blockdev output {s:?}"))
    } else if meta.is_file() {
        Ok(meta.len())
    } else {
        Err(anyhow!("{path} is neither a block device nor a regular file"))
    }
}
