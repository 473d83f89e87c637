//! The reset scheduler.
//!
//! A cross-reboot state machine whose store is the filesystem: the
//! flag file on the boot partition *is* the state (`Idle` when absent,
//! `Scheduled` when present), and every transition is an atomic file
//! create or delete. The flag doubles as the mutual-exclusion token
//! that keeps two resets from competing for the boot configuration.

use std::io::ErrorKind;

use anyhow::{Context, Result};
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use fn_error_context::context;
use serde::Serialize;

use crate::audit::AuditLog;
use crate::bootconfig;
use crate::config::{Config, Strategy};
use crate::devices::{self, ResolvedPartitions};
use crate::error::ResetError;
use crate::utils::{fsync_dir, parent_of, write_atomic};

/// Persisted scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ResetState {
    /// No reset pending.
    Idle,
    /// A reset will run on the next boot.
    Scheduled,
}

/// Snapshot reported by `status`.
#[derive(Debug, Serialize)]
pub(crate) struct StatusReport {
    pub(crate) state: ResetState,
    pub(crate) strategy: Strategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) scheduled_at: Option<DateTime<Utc>>,
}

/// Non-destructive read of the scheduler state.
#[context("Reading reset status")]
pub(crate) fn status(cfg: &Config) -> Result<StatusReport> {
    let flag = cfg.flag_path();
    let meta = match std::fs::symlink_metadata(&flag) {
        Ok(m) => Some(m),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => return Err(e).with_context(|| format!("statting {flag}")),
    };
    let scheduled_at = meta
        .as_ref()
        .and_then(|m| m.modified().ok())
        .map(DateTime::<Utc>::from);
    Ok(StatusReport {
        state: if meta.is_some() {
            ResetState::Scheduled
        } else {
            ResetState::Idle
        },
        strategy: cfg.strategy,
        scheduled_at,
    })
}

/// Record the intent to restore on the next boot.
///
/// `backup_root` is a mounted view of the backup partition, validated
/// structurally before anything is persisted. The caller has already
/// obtained the user's confirmation; this function only commits. The
/// restore itself is *not* performed here — that is the boot
/// dispatcher's job.
#[context("Scheduling factory reset")]
pub(crate) fn schedule(
    cfg: &Config,
    parts: &ResolvedPartitions,
    backup_root: &Utf8Path,
) -> Result<()> {
    let flag = cfg.flag_path();
    if flag
        .try_exists()
        .with_context(|| format!("checking {flag}"))?
    {
        return Err(ResetError::AlreadyScheduled.into());
    }
    devices::validate_root_structure(backup_root)?;

    if cfg.strategy == Strategy::Recovery {
        let recovery = parts.recovery.as_ref().ok_or_else(|| {
            anyhow::Error::from(ResetError::Validation(
                "no recovery partition resolved".into(),
            ))
        })?;
        let cmdline_path = cfg.cmdline_path();
        bootconfig::save_copy(&cmdline_path, &cfg.saved_cmdline_path())?;
        let contents = std::fs::read_to_string(&cmdline_path)
            .with_context(|| format!("reading {cmdline_path}"))?;
        let rewritten =
            bootconfig::rewrite_root(&contents, &bootconfig::root_for_label(&recovery.label))?;
        write_atomic(&cmdline_path, rewritten.as_bytes())?;
    }

    create_flag(&flag)?;
    AuditLog::new(cfg.audit_path()).append(&format!(
        "reset scheduled (strategy={}, backup={})",
        cfg.strategy, parts.backup.device
    ))?;
    Ok(())
}

// O_EXCL creation is the commit point; a competing writer loses here.
fn create_flag(flag: &Utf8Path) -> Result<()> {
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(flag)
    {
        Ok(f) => f.sync_all().with_context(|| format!("syncing {flag}"))?,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(ResetError::AlreadyScheduled.into())
        }
        Err(e) => return Err(e).with_context(|| format!("creating {flag}")),
    }
    fsync_dir(parent_of(flag)?)
}

/// Revoke a pending reset, restoring the pre-schedule boot
/// configuration byte for byte when it was modified.
#[context("Canceling factory reset")]
pub(crate) fn cancel(cfg: &Config) -> Result<()> {
    let flag = cfg.flag_path();
    if !flag
        .try_exists()
        .with_context(|| format!("checking {flag}"))?
    {
        return Err(ResetError::NothingScheduled.into());
    }
    let saved = cfg.saved_cmdline_path();
    let have_saved = saved
        .try_exists()
        .with_context(|| format!("checking {saved}"))?;
    if have_saved {
        bootconfig::restore_copy(&saved, &cfg.cmdline_path())?;
    } else if cfg.strategy == Strategy::Recovery {
        // The scheduler rewrote the boot configuration but its proof
        // of the original is gone. Do not guess what normal was.
        return Err(ResetError::ConfigurationCorrupt(format!(
            "reset is scheduled but {saved} is missing"
        ))
        .into());
    }
    remove_flag(&flag)?;
    AuditLog::new(cfg.audit_path()).append("reset canceled")?;
    Ok(())
}

/// Consume the intent; called after a completed restore and by cancel.
pub(crate) fn remove_flag(flag: &Utf8Path) -> Result<()> {
    std::fs::remove_file(flag).with_context(|| format!("removing {flag}"))?;
    fsync_dir(parent_of(flag)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::Partition;
    use camino::Utf8PathBuf;

    const CMDLINE: &str = "console=tty1 root=LABEL=rootfs rootwait\n";

    struct Harness {
        _boot: tempfile::TempDir,
        backup_root: tempfile::TempDir,
        cfg: Config,
    }

    fn harness(strategy: Strategy) -> Harness {
        let boot = tempfile::tempdir().unwrap();
        let backup_root = tempfile::tempdir().unwrap();
        for d in ["etc", "usr", "var"] {
            std::fs::create_dir(backup_root.path().join(d)).unwrap();
        }
        let cfg = Config {
            strategy,
            boot_mount: Utf8PathBuf::try_from(boot.path().to_path_buf()).unwrap(),
            ..Config::default()
        };
        std::fs::write(cfg.cmdline_path(), CMDLINE).unwrap();
        Harness {
            _boot: boot,
            backup_root,
            cfg,
        }
    }

    impl Harness {
        fn backup_root(&self) -> &Utf8Path {
            Utf8Path::from_path(self.backup_root.path()).unwrap()
        }

        fn parts(&self) -> ResolvedPartitions {
            let part = |label: &str, device: &str| Partition {
                label: label.into(),
                device: device.into(),
                fstype: Some("ext4".into()),
                size: 8u64 << 30,
            };
            ResolvedPartitions {
                boot: part("bootfs", "/dev/mmcblk0p1"),
                active: part("rootfs", "/dev/mmcblk0p2"),
                backup: part("factory", "/dev/mmcblk0p3"),
                recovery: Some(part("recovery", "/dev/mmcblk0p4")),
            }
        }
    }

    #[test]
    fn test_schedule_status_cancel() {
        let h = harness(Strategy::InBand);
        assert_eq!(status(&h.cfg).unwrap().state, ResetState::Idle);

        schedule(&h.cfg, &h.parts(), h.backup_root()).unwrap();
        let report = status(&h.cfg).unwrap();
        assert_eq!(report.state, ResetState::Scheduled);
        assert!(report.scheduled_at.is_some());
        // in-band scheduling leaves the boot configuration alone
        assert_eq!(
            std::fs::read_to_string(h.cfg.cmdline_path()).unwrap(),
            CMDLINE
        );

        cancel(&h.cfg).unwrap();
        assert_eq!(status(&h.cfg).unwrap().state, ResetState::Idle);
    }

    #[test]
    fn test_double_schedule() {
        let h = harness(Strategy::InBand);
        schedule(&h.cfg, &h.parts(), h.backup_root()).unwrap();
        let e = schedule(&h.cfg, &h.parts(), h.backup_root()).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<ResetError>(),
            Some(ResetError::AlreadyScheduled)
        ));
        // still exactly one intent
        assert!(h.cfg.flag_path().exists());
    }

    #[test]
    fn test_cancel_without_schedule() {
        let h = harness(Strategy::InBand);
        let e = cancel(&h.cfg).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<ResetError>(),
            Some(ResetError::NothingScheduled)
        ));
    }

    #[test]
    fn test_schedule_rejects_invalid_backup() {
        let h = harness(Strategy::InBand);
        std::fs::remove_dir(h.backup_root().join("etc")).unwrap();
        let e = schedule(&h.cfg, &h.parts(), h.backup_root()).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<ResetError>(),
            Some(ResetError::Validation(_))
        ));
        // nothing was persisted
        assert_eq!(status(&h.cfg).unwrap().state, ResetState::Idle);
    }

    #[test]
    fn test_recovery_schedule_rewrites_and_cancel_restores() {
        let h = harness(Strategy::Recovery);
        schedule(&h.cfg, &h.parts(), h.backup_root()).unwrap();

        let rewritten = std::fs::read_to_string(h.cfg.cmdline_path()).unwrap();
        assert_eq!(rewritten, "console=tty1 root=LABEL=recovery rootwait\n");
        // the saved copy is byte-identical to the pre-schedule state
        assert_eq!(
            std::fs::read_to_string(h.cfg.saved_cmdline_path()).unwrap(),
            CMDLINE
        );

        cancel(&h.cfg).unwrap();
        assert_eq!(
            std::fs::read_to_string(h.cfg.cmdline_path()).unwrap(),
            CMDLINE
        );
        assert!(!h.cfg.saved_cmdline_path().exists());
        assert_eq!(status(&h.cfg).unwrap().state, ResetState::Idle);
    }

    #[test]
    fn test_recovery_cancel_without_saved_copy() {
        let h = harness(Strategy::Recovery);
        schedule(&h.cfg, &h.parts(), h.backup_root()).unwrap();
        std::fs::remove_file(h.cfg.saved_cmdline_path()).unwrap();

        let e = cancel(&h.cfg).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<ResetError>(),
            Some(ResetError::ConfigurationCorrupt(_))
        ));
        // fail closed: the reset stays scheduled
        assert_eq!(status(&h.cfg).unwrap().state, ResetState::Scheduled);
    }

    #[test]
    fn test_audit_trail_written() {
        let h = harness(Strategy::InBand);
        schedule(&h.cfg, &h.parts(), h.backup_root()).unwrap();
        cancel(&h.cfg).unwrap();
        let trail = AuditLog::new(h.cfg.audit_path()).read().unwrap().unwrap();
        assert!(trail.contains("reset scheduled"));
        assert!(trail.contains("reset canceled"));
    }
}
