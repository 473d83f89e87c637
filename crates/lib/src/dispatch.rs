//! The in-band boot dispatcher.
//!
//! Runs as an early-boot one-shot (see
//! `systemd/bootmend-dispatch.service`), ordered after filesystems are
//! mounted and before general services start. If no reset is pending
//! it does nothing; otherwise it performs exactly one restore before
//! anything else can come to depend on the active root's contents.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::audit::AuditLog;
use crate::config::Config;
use crate::consts::BACKUP_MOUNTPOINT;
use crate::devices;
use crate::mount::TempMount;
use crate::restore::{stage_file_copy, ExcludeSet, RestoreEngine, TreeSync};
use crate::scheduler;

/// What a dispatch pass did.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    /// No reset was pending; boot proceeds untouched.
    NoResetPending,
    /// The active root was restored from backup.
    Restored,
}

/// Entry point for the early-boot service.
#[context("Dispatching pending reset")]
pub(crate) fn run(cfg: &Config) -> Result<DispatchOutcome> {
    if !cfg.flag_path().try_exists().context("checking reset flag")? {
        tracing::debug!("no reset pending");
        return Ok(DispatchOutcome::NoResetPending);
    }
    let parts = devices::resolve_pair(cfg)?;
    let tool = tool_path()?;
    let mnt = TempMount::new_ro(&parts.backup.device, Utf8Path::new(BACKUP_MOUNTPOINT))?;
    let outcome = execute(cfg, mnt.target(), Utf8Path::new("/"), &[tool]);
    // Unmount trouble after a successful restore must not masquerade
    // as a failed restore and leave the flag set.
    if let Err(e) = mnt.unmount() {
        tracing::warn!("unmounting backup: {e:#}");
    }
    outcome
}

// Our executable, relative to the active root it lives on.
fn tool_path() -> Result<Utf8PathBuf> {
    let exe = bootmend_utils::exec::executable_path()?;
    let exe = Utf8PathBuf::try_from(exe).context("executable path is not UTF-8")?;
    Ok(exe
        .strip_prefix("/")
        .map(ToOwned::to_owned)
        .unwrap_or(exe))
}

/// Restore `dest_root` from `source_root` with the tree-sync engine,
/// protecting `tools` (paths relative to the roots) and re-provisioning
/// them from the source afterwards. Factored over plain paths so the
/// whole boot cycle is testable on scratch directories.
pub(crate) fn execute(
    cfg: &Config,
    source_root: &Utf8Path,
    dest_root: &Utf8Path,
    tools: &[Utf8PathBuf],
) -> Result<DispatchOutcome> {
    if !cfg.flag_path().try_exists().context("checking reset flag")? {
        return Ok(DispatchOutcome::NoResetPending);
    }
    let audit = AuditLog::new(cfg.audit_path());
    audit.append(&format!("restore begin (tree-sync, source={source_root})"))?;

    let mut excludes = ExcludeSet::defaults();
    for t in tools {
        excludes.insert(t.clone());
    }
    let result = devices::validate_root_structure(source_root)
        .and_then(|()| TreeSync.restore(source_root, dest_root, &excludes))
        .and_then(|()| reinstall_tools(source_root, dest_root, tools));
    match result {
        Ok(()) => {
            scheduler::remove_flag(&cfg.flag_path())?;
            audit.append("restore complete")?;
            Ok(DispatchOutcome::Restored)
        }
        Err(e) => {
            // The flag deliberately stays: the system must not resume
            // normal operation on a half-restored root.
            if let Err(ae) = audit.append(&format!("restore FAILED: {e:#}")) {
                tracing::error!("recording restore failure: {ae:#}");
            }
            Err(e)
        }
    }
}

// The mirroring pass excluded the running tooling; bring over the
// backup's copy now so the restored root is self-contained.
fn reinstall_tools(
    source_root: &Utf8Path,
    dest_root: &Utf8Path,
    tools: &[Utf8PathBuf],
) -> Result<()> {
    for rel in tools {
        let src = source_root.join(rel);
        if !src.is_file() {
            tracing::warn!("backup carries no {rel}; keeping the active copy");
            continue;
        }
        let dst = dest_root.join(rel);
        stage_file_copy(&src, &dst).with_context(|| format!("reinstalling {rel}"))?;
    }
    Ok(())
}
