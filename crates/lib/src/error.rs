//! Typed failures of the reset state machine.

use camino::Utf8PathBuf;
use thiserror::Error;

/// The failure taxonomy callers make decisions on. Everything else
/// travels as [`anyhow::Error`] context wrapped around these.
#[derive(Debug, Error)]
pub(crate) enum ResetError {
    /// A precondition on the partition layout or backup contents failed.
    #[error("validation failed: {0}")]
    Validation(String),
    /// A reset is already pending; it must be canceled first.
    #[error("a factory reset is already scheduled")]
    AlreadyScheduled,
    /// Cancellation was requested with nothing scheduled.
    #[error("no factory reset is scheduled")]
    NothingScheduled,
    /// The saved boot configuration cannot prove what "normal" was.
    #[error("boot configuration state is corrupt: {0}")]
    ConfigurationCorrupt(String),
    /// The restore engine aborted on an I/O failure.
    #[error("restore failed at {path}")]
    Restore {
        /// The offending path.
        path: Utf8PathBuf,
        /// The underlying failure; block copies carry the offset here.
        #[source]
        source: std::io::Error,
    },
    /// Source and destination block ranges differ in size.
    #[error("source is {source_bytes} bytes but destination is {dest_bytes} bytes")]
    SizeMismatch {
        /// Size of the restore source.
        source_bytes: u64,
        /// Size of the restore destination.
        dest_bytes: u64,
    },
}
