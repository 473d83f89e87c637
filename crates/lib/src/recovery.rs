//! The recovery-environment dispatcher.
//!
//! Runs inside the minimal recovery OS the scheduler pointed the boot
//! configuration at. It has one job: put the active partition back,
//! hand the boot configuration back, and reboot. It runs
//! unconditionally — being booted into recovery at all is the signal —
//! but it refuses to touch anything unless it can prove what "normal"
//! looked like.

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::audit::AuditLog;
use crate::bootconfig;
use crate::config::Config;
use crate::devices;
use crate::error::ResetError;
use crate::mount::{self, TempMount};
use crate::restore::{BlockCopy, ExcludeSet, RestoreEngine};
use crate::scheduler;

/// Entry point inside the recovery environment.
#[context("Recovery restore")]
pub(crate) fn run(cfg: &Config) -> Result<()> {
    let parts = devices::resolve_pair(cfg)?;
    // The recovery image may not mount the boot partition on its own,
    // and the flag, audit trail, and saved configuration all live there.
    let boot_mount = if mount::device_is_mounted(&parts.boot.device)? {
        None
    } else {
        Some(TempMount::new(&parts.boot.device, &cfg.boot_mount)?)
    };
    let result = execute(cfg, &parts.backup.device, &parts.active.device);
    if let Some(mnt) = boot_mount {
        if let Err(e) = mnt.unmount() {
            tracing::warn!("unmounting boot partition: {e:#}");
        }
    }
    result
}

/// Block-copy `source_dev` over `dest_dev`, then return the system to
/// its saved boot configuration. Factored over plain paths so it is
/// testable with scratch files standing in for partitions.
pub(crate) fn execute(cfg: &Config, source_dev: &Utf8Path, dest_dev: &Utf8Path) -> Result<()> {
    let saved = cfg.saved_cmdline_path();
    // Prove we can hand back "normal" before destroying anything.
    if !saved
        .try_exists()
        .with_context(|| format!("checking {saved}"))?
    {
        return Err(ResetError::ConfigurationCorrupt(format!(
            "booted into recovery but {saved} is missing"
        ))
        .into());
    }
    let audit = AuditLog::new(cfg.audit_path());
    audit.append(&format!("restore begin (block-copy, source={source_dev})"))?;
    if let Err(e) = BlockCopy.restore(source_dev, dest_dev, &ExcludeSet::default()) {
        if let Err(ae) = audit.append(&format!("restore FAILED: {e:#}")) {
            tracing::error!("recording restore failure: {ae:#}");
        }
        return Err(e);
    }
    bootconfig::restore_copy(&saved, &cfg.cmdline_path())?;
    let flag = cfg.flag_path();
    if flag
        .try_exists()
        .with_context(|| format!("checking {flag}"))?
    {
        scheduler::remove_flag(&flag)?;
    }
    audit.append("restore complete")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Strategy;
    use crate::scheduler::ResetState;
    use camino::Utf8PathBuf;

    const CMDLINE: &str = "console=tty1 root=LABEL=rootfs rootwait\n";

    struct Harness {
        _boot: tempfile::TempDir,
        _disks: tempfile::TempDir,
        cfg: Config,
        active: Utf8PathBuf,
        backup: Utf8PathBuf,
    }

    fn harness() -> Harness {
        let boot = tempfile::tempdir().unwrap();
        let disks = tempfile::tempdir().unwrap();
        let cfg = Config {
            strategy: Strategy::Recovery,
            boot_mount: Utf8PathBuf::try_from(boot.path().to_path_buf()).unwrap(),
            ..Config::default()
        };
        // state as the scheduler left it: flag set, cmdline pointed at
        // recovery, original saved byte-exactly
        std::fs::write(cfg.cmdline_path(), "console=tty1 root=LABEL=recovery rootwait\n")
            .unwrap();
        std::fs::write(cfg.saved_cmdline_path(), CMDLINE).unwrap();
        std::fs::write(cfg.flag_path(), "").unwrap();

        let active = Utf8PathBuf::try_from(disks.path().join("active.img")).unwrap();
        let backup = Utf8PathBuf::try_from(disks.path().join("factory.img")).unwrap();
        std::fs::write(&active, vec![0xaau8; 1 << 16]).unwrap();
        std::fs::write(&backup, vec![0x55u8; 1 << 16]).unwrap();
        Harness {
            _boot: boot,
            _disks: disks,
            cfg,
            active,
            backup,
        }
    }

    #[test]
    fn test_recovery_restore() {
        let h = harness();
        execute(&h.cfg, &h.backup, &h.active).unwrap();

        // active now mirrors the backup
        assert_eq!(
            std::fs::read(&h.active).unwrap(),
            std::fs::read(&h.backup).unwrap()
        );
        // boot configuration handed back verbatim, saved copy consumed
        assert_eq!(
            std::fs::read_to_string(h.cfg.cmdline_path()).unwrap(),
            CMDLINE
        );
        assert!(!h.cfg.saved_cmdline_path().exists());
        // the intent was consumed
        assert_eq!(
            crate::scheduler::status(&h.cfg).unwrap().state,
            ResetState::Idle
        );
        let trail = AuditLog::new(h.cfg.audit_path()).read().unwrap().unwrap();
        assert!(trail.contains("restore begin (block-copy"));
        assert!(trail.contains("restore complete"));
    }

    #[test]
    fn test_missing_saved_config_refuses() {
        let h = harness();
        std::fs::remove_file(h.cfg.saved_cmdline_path()).unwrap();
        let e = execute(&h.cfg, &h.backup, &h.active).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<ResetError>(),
            Some(ResetError::ConfigurationCorrupt(_))
        ));
        // nothing was copied
        assert_eq!(std::fs::read(&h.active).unwrap(), vec![0xaau8; 1 << 16]);
    }

    #[test]
    fn test_failed_copy_fails_closed() {
        let h = harness();
        // a truncated backup partition cannot be a valid source
        std::fs::write(&h.backup, vec![0x55u8; 1 << 12]).unwrap();
        let e = execute(&h.cfg, &h.backup, &h.active).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<ResetError>(),
            Some(ResetError::SizeMismatch { .. })
        ));
        // flag and rewritten configuration stay; next boot lands in
        // recovery again rather than on a half-restored root
        assert!(h.cfg.flag_path().exists());
        assert_eq!(
            std::fs::read_to_string(h.cfg.cmdline_path()).unwrap(),
            "console=tty1 root=LABEL=recovery rootwait\n"
        );
        let trail = AuditLog::new(h.cfg.audit_path()).read().unwrap().unwrap();
        assert!(trail.contains("restore FAILED"));
    }
}
