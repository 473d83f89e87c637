//! Deployment configuration.
//!
//! `/etc/bootmend/config.toml` selects the restore strategy and the
//! role label contract for this generation of media. A missing file
//! means the defaults; changing labels on deployed media is a breaking
//! change, since the dispatcher resolves partitions by label alone.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::consts;

/// Which restore strategy this deployment uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum Strategy {
    /// Tree-sync run by an early-boot service on the active system.
    #[default]
    InBand,
    /// Raw block copy run from the dedicated recovery partition.
    Recovery,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Strategy::InBand => "in-band",
            Strategy::Recovery => "recovery",
        })
    }
}

/// Role label assignments.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub(crate) struct Labels {
    pub(crate) boot: String,
    pub(crate) active: String,
    pub(crate) backup: String,
    pub(crate) recovery: String,
}

impl Default for Labels {
    fn default() -> Self {
        Self {
            boot: consts::LABEL_BOOT.into(),
            active: consts::LABEL_ACTIVE.into(),
            backup: consts::LABEL_BACKUP.into(),
            recovery: consts::LABEL_RECOVERY.into(),
        }
    }
}

/// Parsed deployment configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub(crate) struct Config {
    pub(crate) strategy: Strategy,
    pub(crate) labels: Labels,
    /// Where the boot partition is mounted on the running system.
    pub(crate) boot_mount: Utf8PathBuf,
    /// Boot configuration file name, relative to the boot mount.
    pub(crate) cmdline: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            labels: Labels::default(),
            boot_mount: "/boot".into(),
            cmdline: consts::CMDLINE.into(),
        }
    }
}

impl Config {
    /// Load the system configuration, defaults when absent.
    pub(crate) fn load() -> Result<Self> {
        Self::load_from(Utf8Path::new(consts::CONFIG_PATH))
    }

    #[context("Loading configuration {path}")]
    pub(crate) fn load_from(path: &Utf8Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).context("reading"),
        };
        toml::from_str(&contents).context("parsing TOML")
    }

    pub(crate) fn flag_path(&self) -> Utf8PathBuf {
        self.boot_mount.join(consts::RESET_FLAG)
    }

    pub(crate) fn audit_path(&self) -> Utf8PathBuf {
        self.boot_mount.join(consts::AUDIT_LOG)
    }

    pub(crate) fn cmdline_path(&self) -> Utf8PathBuf {
        self.boot_mount.join(&self.cmdline)
    }

    pub(crate) fn saved_cmdline_path(&self) -> Utf8PathBuf {
        self.boot_mount
            .join(format!("{}{}", self.cmdline, consts::SAVED_SUFFIX))
    }
}
