//! terraflow unlock
//!
//! A lock file outlives the process that created it when that process
//! crashes. Nothing expires it automatically; this command is how an
//! operator clears it.

use super::resolve_workspace_dir;
use colored::Colorize;
use std::path::PathBuf;
use terraflow_cloud::pipeline::{force_unlock, is_locked, local_holder, read_lock};

pub fn handle(resource_id: &str, root: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let dir = resolve_workspace_dir(resource_id, root)?;

    if !is_locked(&dir) {
        println!("{}", "No operation lock present".dimmed());
        return Ok(());
    }

    match read_lock(&dir) {
        Ok(Some(lock)) if !force => {
            if lock.holder != local_holder() {
                anyhow::bail!(
                    "Lock is held by {} (pid {}), which cannot be checked from this host; use --force to remove it",
                    lock.holder,
                    lock.pid
                );
            }
            if process_alive(lock.pid) {
                anyhow::bail!(
                    "Lock is held by running process {} ({}); use --force to remove it anyway",
                    lock.pid,
                    lock.operation
                );
            }
            println!(
                "Owner pid {} of the {} lock is gone",
                lock.pid.to_string().yellow(),
                lock.operation
            );
        }
        Err(e) if !force => {
            anyhow::bail!("Lock file is unreadable ({}); use --force to remove it", e);
        }
        _ => {}
    }

    if force_unlock(&dir)? {
        println!("{}", "✓ Operation lock removed".green().bold());
    } else {
        println!("{}", "Lock was already released".dimmed());
    }
    Ok(())
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // signal 0: existence check only
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}
