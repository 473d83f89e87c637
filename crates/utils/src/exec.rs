use std::path::PathBuf;

use anyhow::Result;

/// Environment variable holding a reference to our original binary,
/// set when a wrapper re-executed us from a temporary copy.
pub const ORIG: &str = "_BOOTMEND_ORIG_EXE";

/// Return the path to our own executable as installed on disk.
/// This is the path the tree-sync engine must protect while a
/// restore is rewriting the filesystem underneath us.
pub fn executable_path() -> Result<PathBuf> {
    if let Some(p) = std::env::var_os(ORIG) {
        Ok(p.into())
    } else {
        std::env::current_exe().map_err(Into::into)
    }
}
