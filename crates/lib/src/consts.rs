//! The on-disk contract of the reset state machine.
//!
//! Everything here is compatibility-sensitive across media
//! generations: the dispatcher on a new image must understand what an
//! old image's scheduler wrote, and vice versa.

/// Default filesystem label of the boot partition.
pub(crate) const LABEL_BOOT: &str = "bootfs";
/// Default filesystem label of the active root partition.
pub(crate) const LABEL_ACTIVE: &str = "rootfs";
/// Default filesystem label of the backup (restore source) partition.
pub(crate) const LABEL_BACKUP: &str = "factory";
/// Default filesystem label of the optional recovery partition.
pub(crate) const LABEL_RECOVERY: &str = "recovery";

/// Marker file on the boot partition recording a pending reset.
/// Its existence is the entire payload.
pub(crate) const RESET_FLAG: &str = "bootmend-reset-requested";
/// Append-only restore audit trail, kept on the boot partition so it
/// survives the restore it describes.
pub(crate) const AUDIT_LOG: &str = "bootmend-restore.log";
/// Boot configuration file consumed by the firmware, relative to the
/// boot partition root.
pub(crate) const CMDLINE: &str = "cmdline.txt";
/// Suffix of the byte-exact pre-reset copy of the boot configuration.
pub(crate) const SAVED_SUFFIX: &str = ".bootmend-saved";

/// Where the in-band dispatcher mounts the backup partition.
pub(crate) const BACKUP_MOUNTPOINT: &str = "/run/bootmend/backup";
/// Deployment configuration.
pub(crate) const CONFIG_PATH: &str = "/etc/bootmend/config.toml";

/// Directories every initialized root filesystem is expected to carry;
/// a restore source missing any of them is rejected.
pub(crate) const ROOT_STRUCTURE: &[&str] = &["etc", "usr", "var"];

/// Paths never mirrored between the backup and active roots: live
/// kernel/process trees, mountpoints of other partitions, and
/// transient state.
pub(crate) const DEFAULT_EXCLUDES: &[&str] = &[
    "boot",
    "dev",
    "proc",
    "sys",
    "run",
    "tmp",
    "var/tmp",
    "mnt",
    "media",
    "lost+found",
];
