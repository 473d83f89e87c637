//! Role-labeled partition resolution and validation.
//!
//! Partition roles are resolved by filesystem label, never by index:
//! the index-to-role mapping may change between media generations, the
//! label contract does not.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::blockdev::{self, Device};
use crate::config::{Config, Strategy};
use crate::consts::ROOT_STRUCTURE;
use crate::error::ResetError;

/// A partition resolved to its role by filesystem label.
#[derive(Debug, Clone)]
pub(crate) struct Partition {
    pub(crate) label: String,
    pub(crate) device: Utf8PathBuf,
    pub(crate) fstype: Option<String>,
    pub(crate) size: u64,
}

impl Partition {
    fn from_device(dev: &Device, label: &str) -> Self {
        Self {
            label: label.to_owned(),
            device: dev.path(),
            fstype: dev.fstype.clone(),
            size: dev.size,
        }
    }
}

/// The partitions a reset needs: boot (which stores the intent), the
/// active/backup pair, and the recovery partition when one exists.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedPartitions {
    pub(crate) boot: Partition,
    pub(crate) active: Partition,
    pub(crate) backup: Partition,
    pub(crate) recovery: Option<Partition>,
}

/// Find at most one partition with the given label; more than one
/// match means the label contract is violated.
fn find_label(devices: &[Device], label: &str) -> Result<Option<Partition>> {
    let matches = blockdev::find_by_label(devices, label);
    match matches.as_slice() {
        [] => Ok(None),
        [dev] => Ok(Some(Partition::from_device(dev, label))),
        many => Err(ResetError::Validation(format!(
            "label {label:?} is ambiguous: {} partitions carry it",
            many.len()
        ))
        .into()),
    }
}

fn require_label(devices: &[Device], label: &str) -> Result<Partition> {
    find_label(devices, label)?.ok_or_else(|| {
        anyhow::Error::from(ResetError::Validation(format!(
            "no partition labeled {label:?} found"
        )))
    })
}

/// Resolve all role partitions per the configured label contract.
#[context("Resolving role-labeled partitions")]
pub(crate) fn resolve_pair(cfg: &Config) -> Result<ResolvedPartitions> {
    let devices = blockdev::list_all()?;
    resolve_pair_in(cfg, &devices)
}

pub(crate) fn resolve_pair_in(cfg: &Config, devices: &[Device]) -> Result<ResolvedPartitions> {
    let labels = &cfg.labels;
    if labels.active == labels.backup {
        return Err(ResetError::Validation(format!(
            "active and backup labels collide ({:?})",
            labels.active
        ))
        .into());
    }
    let boot = require_label(devices, &labels.boot)?;
    let active = require_label(devices, &labels.active)?;
    let backup = require_label(devices, &labels.backup)?;
    let recovery = find_label(devices, &labels.recovery)?;
    if let (Some(a), Some(b)) = (active.fstype.as_deref(), backup.fstype.as_deref()) {
        if a != b {
            tracing::warn!("active is {a} but backup is {b}; restore will change filesystem type");
        }
    }
    if cfg.strategy == Strategy::Recovery {
        if recovery.is_none() {
            return Err(ResetError::Validation(format!(
                "strategy is {} but no partition is labeled {:?}",
                cfg.strategy, labels.recovery
            ))
            .into());
        }
        if active.size != backup.size {
            return Err(ResetError::Validation(format!(
                "block copy needs equal-sized partitions; active is {} bytes, backup {} bytes",
                active.size, backup.size
            ))
            .into());
        }
    }
    Ok(ResolvedPartitions {
        boot,
        active,
        backup,
        recovery,
    })
}

/// Reject restore sources that do not look like an initialized root
/// filesystem. This guards against silently "restoring" from a blank
/// or wrong-role partition.
pub(crate) fn validate_root_structure(root: &Utf8Path) -> Result<()> {
    let missing: Vec<&str> = ROOT_STRUCTURE
        .iter()
        .copied()
        .filter(|d| !root.join(d).is_dir())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ResetError::Validation(format!(
            "backup at {root} is missing {}; refusing to restore from it",
            missing.join(", ")
        ))
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Labels;

    fn disk(children: serde_json::Value) -> Vec<Device> {
        let v = serde_json::json!([{
            "name": "mmcblk0",
            "label": null,
            "fstype": null,
            "size": 32_000_000_000u64,
            "children": children,
        }]);
        serde_json::from_value(v).unwrap()
    }

    fn part(name: &str, label: &str, size: u64) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "label": label,
            "fstype": "ext4",
            "size": size,
            "children": null,
        })
    }

    fn standard_disk() -> Vec<Device> {
        disk(serde_json::json!([
            part("mmcblk0p1", "bootfs", 256 << 20),
            part("mmcblk0p2", "rootfs", 8 << 30),
            part("mmcblk0p3", "factory", 8 << 30),
            part("mmcblk0p4", "recovery", 1 << 30),
        ]))
    }

    #[test]
    fn test_resolve_pair() {
        let cfg = Config::default();
        let parts = resolve_pair_in(&cfg, &standard_disk()).unwrap();
        assert_eq!(parts.active.device, "/dev/mmcblk0p2");
        assert_eq!(parts.backup.device, "/dev/mmcblk0p3");
        assert_eq!(parts.boot.label, "bootfs");
        assert!(parts.recovery.is_some());
    }

    #[test]
    fn test_missing_backup() {
        let cfg = Config::default();
        let devices = disk(serde_json::json!([
            part("mmcblk0p1", "bootfs", 256 << 20),
            part("mmcblk0p2", "rootfs", 8 << 30),
        ]));
        let e = resolve_pair_in(&cfg, &devices).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<ResetError>(),
            Some(ResetError::Validation(_))
        ));
    }

    #[test]
    fn test_ambiguous_label() {
        let cfg = Config::default();
        let devices = disk(serde_json::json!([
            part("mmcblk0p1", "bootfs", 256 << 20),
            part("mmcblk0p2", "rootfs", 8 << 30),
            part("mmcblk0p3", "rootfs", 8 << 30),
            part("mmcblk0p4", "factory", 8 << 30),
        ]));
        let e = resolve_pair_in(&cfg, &devices).unwrap_err();
        assert!(format!("{e:#}").contains("ambiguous"));
    }

    #[test]
    fn test_label_collision() {
        let cfg = Config {
            labels: Labels {
                backup: "rootfs".into(),
                ..Labels::default()
            },
            ..Config::default()
        };
        let e = resolve_pair_in(&cfg, &standard_disk()).unwrap_err();
        assert!(format!("{e:#}").contains("collide"));
    }

    #[test]
    fn test_recovery_strategy_requires_equal_sizes() {
        let cfg = Config {
            strategy: Strategy::Recovery,
            ..Config::default()
        };
        let devices = disk(serde_json::json!([
            part("mmcblk0p1", "bootfs", 256 << 20),
            part("mmcblk0p2", "rootfs", 8 << 30),
            part("mmcblk0p3", "factory", 4 << 30),
            part("mmcblk0p4", "recovery", 1 << 30),
        ]));
        let e = resolve_pair_in(&cfg, &devices).unwrap_err();
        assert!(format!("{e:#}").contains("equal-sized"));
    }

    #[test]
    fn test_recovery_strategy_requires_recovery_partition() {
        let cfg = Config {
            strategy: Strategy::Recovery,
            ..Config::default()
        };
        let devices = disk(serde_json::json!([
            part("mmcblk0p1", "bootfs", 256 << 20),
            part("mmcblk0p2", "rootfs", 8 << 30),
            part("mmcblk0p3", "factory", 8 << 30),
        ]));
        assert!(resolve_pair_in(&cfg, &devices).is_err());
    }

    #[test]
    fn test_validate_root_structure() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        for d in ["etc", "usr"] {
            std::fs::create_dir(root.join(d)).unwrap();
        }
        let e = validate_root_structure(root).unwrap_err();
        assert!(format!("{e:#}").contains("missing var"));
        std::fs::create_dir(root.join("var")).unwrap();
        validate_root_structure(root).unwrap();
    }
}
