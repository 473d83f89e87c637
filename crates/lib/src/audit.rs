//! The restore audit trail.
//!
//! Append-only, line-oriented, timestamped. It lives on the boot
//! partition precisely so it survives the restore it describes; the
//! active root is the one thing we know gets overwritten.

use std::fs::OpenOptions;
use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use chrono::SecondsFormat;
use fn_error_context::context;

/// Writer/reader for the audit log.
#[derive(Debug)]
pub(crate) struct AuditLog {
    path: Utf8PathBuf,
}

impl AuditLog {
    pub(crate) fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    /// Append one timestamped record. Failures surface to the caller;
    /// a restore we cannot account for must not silently proceed.
    #[context("Appending to audit log {}", self.path)]
    pub(crate) fn append(&self, event: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("opening")?;
        let stamp = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        writeln!(f, "{stamp} {event}").context("writing")?;
        f.sync_all().context("syncing")
    }

    /// The full trail, or `None` if nothing was ever recorded.
    pub(crate) fn read(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path)),
        }
    }
}
