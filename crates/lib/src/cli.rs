//! The command-line surface.
//!
//! A thin layer over the scheduler plus the two boot-time entrypoints.
//! `schedule`, `status`, and `cancel` never touch a restore engine
//! directly; the engines only run from `dispatch` and
//! `recovery-restore`.

use anyhow::{ensure, Context, Result};
use camino::Utf8Path;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;

use bootmend_utils::PathQuotedDisplay;

use crate::audit::AuditLog;
use crate::config::Config;
use crate::devices;
use crate::dispatch::{self, DispatchOutcome};
use crate::mount::TempMount;
use crate::prompt;
use crate::reboot;
use crate::recovery;
use crate::scheduler::{self, ResetState};

/// Factory reset orchestration for removable boot media.
#[derive(Debug, Parser)]
#[clap(name = "bootmend", version)]
pub struct Cli {
    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Schedule a factory reset for the next boot.
    ///
    /// Validates the backup partition, records the reset intent on the
    /// boot partition, and (on recovery deployments) repoints the boot
    /// configuration at the recovery environment. The restore itself
    /// happens at the next boot.
    Schedule {
        /// Skip the interactive confirmation. The next boot will
        /// irreversibly overwrite the active root filesystem.
        #[clap(long)]
        acknowledge_destructive: bool,
    },
    /// Report whether a reset is pending.
    Status {
        /// Emit machine-readable JSON.
        #[clap(long)]
        json: bool,
    },
    /// Revoke a pending reset before it runs.
    Cancel,
    /// Print the restore audit trail.
    Audit,
    /// Run the early-boot dispatch step (invoked by the systemd unit).
    #[clap(hide = true)]
    Dispatch,
    /// Restore the active partition from inside the recovery environment.
    #[clap(hide = true)]
    RecoveryRestore,
}

/// Parse process arguments and execute the selected command.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Schedule {
            acknowledge_destructive,
        } => schedule(acknowledge_destructive),
        Cmd::Status { json } => status(json),
        Cmd::Cancel => cancel(),
        Cmd::Audit => audit(),
        Cmd::Dispatch => dispatch_cmd(),
        Cmd::RecoveryRestore => recovery_restore(),
    }
}

fn require_root() -> Result<()> {
    ensure!(
        rustix::process::getuid().is_root(),
        "this command must run as root"
    );
    Ok(())
}

fn schedule(acknowledge_destructive: bool) -> Result<()> {
    require_root()?;
    let cfg = Config::load()?;
    let parts = devices::resolve_pair(&cfg)?;
    let mountpoint = tempfile::tempdir().context("creating temporary mountpoint")?;
    let target = Utf8Path::from_path(mountpoint.path()).context("non-UTF-8 tempdir")?;
    let mnt = TempMount::new_ro(&parts.backup.device, target)?;
    devices::validate_root_structure(mnt.target())?;
    // The confirmation is part of the contract: what follows is a
    // destructive operation on next boot.
    if !acknowledge_destructive {
        let ok = prompt::confirm(&format!(
            "NOTICE: the next boot will erase {} and restore it from {}. Continue?",
            PathQuotedDisplay::new(&parts.active.device),
            PathQuotedDisplay::new(&parts.backup.device),
        ))?;
        if !ok {
            anyhow::bail!("aborted");
        }
    }
    scheduler::schedule(&cfg, &parts, mnt.target())?;
    mnt.unmount()?;
    println!("Factory reset scheduled for the next boot.");
    Ok(())
}

fn status(json: bool) -> Result<()> {
    let cfg = Config::load()?;
    let report = scheduler::status(&cfg)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serializing status")?
        );
        return Ok(());
    }
    match report.state {
        ResetState::Scheduled => {
            let since = report
                .scheduled_at
                .map(|t| {
                    format!(
                        " since {}",
                        t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
                    )
                })
                .unwrap_or_default();
            println!(
                "Factory reset: {}{since} (strategy {})",
                "scheduled".yellow(),
                report.strategy
            );
        }
        ResetState::Idle => println!("Factory reset: {}", "idle".green()),
    }
    Ok(())
}

fn cancel() -> Result<()> {
    require_root()?;
    let cfg = Config::load()?;
    scheduler::cancel(&cfg)?;
    println!("Canceled the pending factory reset.");
    Ok(())
}

fn audit() -> Result<()> {
    let cfg = Config::load()?;
    match AuditLog::new(cfg.audit_path()).read()? {
        Some(trail) => print!("{trail}"),
        None => println!("No restore activity recorded."),
    }
    Ok(())
}

fn dispatch_cmd() -> Result<()> {
    require_root()?;
    let cfg = Config::load()?;
    match dispatch::run(&cfg)? {
        DispatchOutcome::NoResetPending => tracing::debug!("nothing to do"),
        DispatchOutcome::Restored => println!("Active root restored from backup."),
    }
    Ok(())
}

fn recovery_restore() -> Result<()> {
    require_root()?;
    let cfg = Config::load()?;
    recovery::run(&cfg)?;
    reboot::reboot()
}
