//! Boot configuration handling.
//!
//! The boot configuration is a plain-text kernel command line
//! (`cmdline.txt` on typical single-board firmware) whose `root=`
//! parameter selects the partition the next boot mounts as root. The
//! scheduler repoints it at the recovery partition, and both
//! cancellation and the recovery dispatcher must put back the previous
//! configuration *verbatim* — hence the byte-exact saved copy.

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::error::ResetError;
use crate::utils::{fsync_dir, parent_of, write_atomic};

/// A parsed kernel command line.
#[derive(Debug)]
pub(crate) struct Cmdline<'a>(&'a str);

/// A single command line parameter and its location in the input.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Parameter<'a> {
    /// The full original token
    pub(crate) parameter: &'a str,
    /// Byte offset of the token in the underlying text
    pub(crate) start: usize,
    /// The parameter key
    pub(crate) key: &'a str,
    /// The parameter value, if present
    pub(crate) value: Option<&'a str>,
}

impl<'a> From<&'a str> for Cmdline<'a> {
    fn from(input: &'a str) -> Self {
        Self(input)
    }
}

impl<'a> Cmdline<'a> {
    /// Iterate over all parameters. Handles quoted values containing
    /// whitespace and splits on unquoted whitespace (including
    /// newlines, so multi-line configurations work unchanged).
    pub(crate) fn iter(&self) -> impl Iterator<Item = Parameter<'a>> {
        let text = self.0;
        let mut in_quotes = false;
        let mut token_start = None::<usize>;
        let mut out = Vec::new();
        for (i, c) in text.char_indices() {
            if c == '"' {
                in_quotes = !in_quotes;
            }
            if c.is_whitespace() && !in_quotes {
                if let Some(s) = token_start.take() {
                    out.push(Parameter::parse(&text[s..i], s));
                }
            } else if token_start.is_none() {
                token_start = Some(i);
            }
        }
        if let Some(s) = token_start {
            out.push(Parameter::parse(&text[s..], s));
        }
        out.into_iter()
    }

    /// Locate the first parameter with the given key. Key comparison
    /// treats dashes and underscores as equivalent.
    pub(crate) fn find(&self, key: &str) -> Option<Parameter<'a>> {
        self.iter().find(|p| key_eq(p.key, key))
    }
}

fn key_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.chars().zip(b.chars()).all(|(x, y)| {
            let x = if x == '-' { '_' } else { x };
            let y = if y == '-' { '_' } else { y };
            x == y
        })
}

impl<'a> Parameter<'a> {
    fn parse(token: &'a str, start: usize) -> Self {
        match token.split_once('=') {
            Some((k, v)) => Self {
                parameter: token,
                start,
                key: k,
                value: Some(strip_quotes(v)),
            },
            None => Self {
                parameter: token,
                start,
                key: token,
                value: None,
            },
        }
    }
}

// Strips only the outermost pair of double quotes.
fn strip_quotes(v: &str) -> &str {
    v.strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(v)
}

/// The `root=` source selecting a partition by filesystem label.
pub(crate) fn root_for_label(label: &str) -> String {
    format!("LABEL={label}")
}

/// Rewrite `root=` to point the next boot at `new_root`, preserving
/// every other byte of the configuration.
pub(crate) fn rewrite_root(contents: &str, new_root: &str) -> Result<String> {
    let cmdline = Cmdline::from(contents);
    let Some(param) = cmdline.find("root") else {
        return Err(ResetError::ConfigurationCorrupt(
            "boot configuration has no root= parameter".into(),
        )
        .into());
    };
    if param.value.is_none() {
        return Err(ResetError::ConfigurationCorrupt(
            "boot configuration's root parameter carries no value".into(),
        )
        .into());
    }
    let mut out = String::with_capacity(contents.len() + new_root.len());
    out.push_str(&contents[..param.start]);
    out.push_str("root=");
    out.push_str(new_root);
    out.push_str(&contents[param.start + param.parameter.len()..]);
    Ok(out)
}

/// Save a byte-exact copy of the boot configuration before mutating
/// it. Refuses to overwrite an existing copy: that copy is the only
/// proof of what "normal" looked like.
#[context("Saving boot configuration")]
pub(crate) fn save_copy(cmdline: &Utf8Path, saved: &Utf8Path) -> Result<()> {
    if saved
        .try_exists()
        .with_context(|| format!("checking {saved}"))?
    {
        return Err(ResetError::ConfigurationCorrupt(format!(
            "saved boot configuration {saved} already exists"
        ))
        .into());
    }
    let contents = std::fs::read(cmdline).with_context(|| format!("reading {cmdline}"))?;
    write_atomic(saved, &contents)
}

/// Restore the boot configuration from its saved copy, byte for byte,
/// then remove the copy.
#[context("Restoring boot configuration")]
pub(crate) fn restore_copy(saved: &Utf8Path, cmdline: &Utf8Path) -> Result<()> {
    let contents = match std::fs::read(saved) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ResetError::ConfigurationCorrupt(format!(
                "saved boot configuration {saved} is missing"
            ))
            .into());
        }
        Err(e) => {
            return Err(ResetError::ConfigurationCorrupt(format!(
                "saved boot configuration {saved} is unreadable: {e}"
            ))
            .into());
        }
    };
    write_atomic(cmdline, &contents)?;
    std::fs::remove_file(saved).with_context(|| format!("removing {saved}"))?;
    fsync_dir(parent_of(saved)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    const CMDLINE: &str =
        "console=serial0,115200 console=tty1 root=LABEL=rootfs rootfstype=ext4 fsck.repair=yes rootwait\n";

    #[test]
    fn test_iter_and_find() {
        let c = Cmdline::from(CMDLINE);
        assert_eq!(c.iter().count(), 6);
        let root = c.find("root").unwrap();
        assert_eq!(root.value, Some("LABEL=rootfs"));
        assert_eq!(root.parameter, "root=LABEL=rootfs");
        assert!(c.find("rootwait").unwrap().value.is_none());
        assert!(c.find("nope").is_none());
    }

    #[test]
    fn test_dash_underscore_keys() {
        let c = Cmdline::from("systemd.unified_cgroup_hierarchy=0");
        assert!(c.find("systemd.unified-cgroup-hierarchy").is_some());
    }

    #[test]
    fn test_quoted_values() {
        let c = Cmdline::from(r#"foo="bar baz" root=LABEL=rootfs"#);
        let foo = c.find("foo").unwrap();
        assert_eq!(foo.value, Some("bar baz"));
        assert_eq!(c.find("root").unwrap().value, Some("LABEL=rootfs"));
    }

    #[test]
    fn test_rewrite_root() {
        let out = rewrite_root(CMDLINE, &root_for_label("recovery")).unwrap();
        assert_eq!(
            out,
            "console=serial0,115200 console=tty1 root=LABEL=recovery rootfstype=ext4 fsck.repair=yes rootwait\n"
        );
        // everything but the root token is untouched, including the newline
        let back = rewrite_root(&out, &root_for_label("rootfs")).unwrap();
        assert_eq!(back, CMDLINE);
    }

    #[test]
    fn test_rewrite_root_missing() {
        let e = rewrite_root("quiet splash", "LABEL=recovery").unwrap_err();
        assert!(matches!(
            e.downcast_ref::<ResetError>(),
            Some(ResetError::ConfigurationCorrupt(_))
        ));
    }

    fn tempdir_path(td: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::try_from(td.path().to_path_buf()).unwrap()
    }

    #[test]
    fn test_save_restore_roundtrip() {
        let td = tempfile::tempdir().unwrap();
        let dir = tempdir_path(&td);
        let cmdline = dir.join("cmdline.txt");
        let saved = dir.join("cmdline.txt.bootmend-saved");
        std::fs::write(&cmdline, CMDLINE).unwrap();

        save_copy(&cmdline, &saved).unwrap();
        assert_eq!(std::fs::read_to_string(&saved).unwrap(), CMDLINE);
        // a second save must not clobber the original proof
        assert!(save_copy(&cmdline, &saved).is_err());

        std::fs::write(&cmdline, "root=LABEL=recovery\n").unwrap();
        restore_copy(&saved, &cmdline).unwrap();
        assert_eq!(std::fs::read_to_string(&cmdline).unwrap(), CMDLINE);
        assert!(!saved.exists());
    }

    #[test]
    fn test_restore_missing_saved() {
        let td = tempfile::tempdir().unwrap();
        let dir = tempdir_path(&td);
        let e = restore_copy(&dir.join("nope"), &dir.join("cmdline.txt")).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<ResetError>(),
            Some(ResetError::ConfigurationCorrupt(_))
        ));
    }
}
