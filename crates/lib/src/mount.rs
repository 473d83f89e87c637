//! Short-lived mounts used for validation and restore.

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use bootmend_utils::CommandRunExt;

/// A mounted filesystem that is unmounted again on drop. The explicit
/// `unmount()` surfaces errors; the drop path is best-effort only.
#[derive(Debug)]
pub(crate) struct TempMount {
    target: Utf8PathBuf,
    mounted: bool,
}

impl TempMount {
    /// Mount `dev` writable on `target`, creating the mountpoint.
    pub(crate) fn new(dev: &Utf8Path, target: &Utf8Path) -> Result<Self> {
        Self::mount_with(dev, target, None)
    }

    /// Mount `dev` read-only on `target`, creating the mountpoint.
    pub(crate) fn new_ro(dev: &Utf8Path, target: &Utf8Path) -> Result<Self> {
        Self::mount_with(dev, target, Some("ro"))
    }

    #[context("Mounting {dev} at {target}")]
    fn mount_with(dev: &Utf8Path, target: &Utf8Path, options: Option<&str>) -> Result<Self> {
        std::fs::create_dir_all(target).with_context(|| format!("creating {target}"))?;
        let mut cmd = Command::new("mount");
        if let Some(options) = options {
            cmd.args(["-o", options]);
        }
        cmd.arg(dev).arg(target).log_debug().run()?;
        Ok(Self {
            target: target.to_owned(),
            mounted: true,
        })
    }

    pub(crate) fn target(&self) -> &Utf8Path {
        &self.target
    }

    // Shared backend for our `unmount` and `drop` implementations.
    fn impl_unmount(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        self.mounted = false;
        Command::new("umount").arg(&self.target).log_debug().run()
    }

    /// Consume this mount, unmounting it.
    pub(crate) fn unmount(mut self) -> Result<()> {
        self.impl_unmount()
    }
}

impl Drop for TempMount {
    fn drop(&mut self) {
        // Best effort to unmount if we're dropped without invoking `unmount`
        let _ = self.impl_unmount();
    }
}

/// Whether `dev` currently backs any mount on this system.
#[context("Inspecting mount table")]
pub(crate) fn device_is_mounted(dev: &Utf8Path) -> Result<bool> {
    let table =
        std::fs::read_to_string("/proc/self/mounts").context("reading /proc/self/mounts")?;
    Ok(is_mount_source(&table, dev))
}

fn is_mount_source(table: &str, dev: &Utf8Path) -> bool {
    table
        .lines()
        .filter_map(|l| l.split_whitespace().next())
        .any(|src| src == dev.as_str())
}
