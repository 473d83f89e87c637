//! Interactive confirmation for destructive operations.

use std::io::Write;

use anyhow::{Context, Result};

/// Ask for an explicit yes before committing to a destructive
/// operation. Empty input and EOF both mean no.
pub(crate) fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush().context("flushing stdout")?;
    let mut line = String::new();
    let n = std::io::stdin()
        .read_line(&mut line)
        .context("reading stdin")?;
    if n == 0 {
        return Ok(false);
    }
    let line = line.trim();
    Ok(line.eq_ignore_ascii_case("y") || line.eq_ignore_ascii_case("yes"))
}
