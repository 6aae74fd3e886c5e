//! terraflow status

use super::resolve_workspace_dir;
use chrono::Utc;
use colored::Colorize;
use std::path::PathBuf;
use terraflow_cloud::pipeline::{inspect_pipeline, read_lock};
use terraflow_cloud::workspace::STATE_FILE;
use terraflow_cloud::{Handle, PipelineState, StateFile};

pub fn handle(resource_id: &str, root: Option<PathBuf>) -> anyhow::Result<()> {
    let handle = Handle::new(resource_id);
    let dir = resolve_workspace_dir(resource_id, root)?;

    println!("{:<12} {}", "Resource:".bold(), resource_id.cyan());
    println!("{:<12} {}", "Handle:".bold(), handle);
    println!("{:<12} {}", "Directory:".bold(), dir.display());

    if !dir.is_dir() {
        println!("{}", "No workspace on disk".dimmed());
        return Ok(());
    }

    // inspection only; a waiting result is left for its poller
    let pipeline = match inspect_pipeline(&dir)? {
        Some(PipelineState::Locked) => "locked".yellow(),
        Some(PipelineState::NoStoreYet) => "partial result of a crashed writer".red(),
        Some(PipelineState::NotStarted) => "idle".green(),
        None => "result waiting".cyan(),
    };
    println!("{:<12} {}", "Pipeline:".bold(), pipeline);

    match read_lock(&dir) {
        Ok(Some(lock)) => {
            let age = Utc::now().signed_duration_since(lock.acquired_at);
            println!(
                "{:<12} {} by {} (pid {}), {}s ago",
                "Lock:".bold(),
                lock.operation,
                lock.holder,
                lock.pid,
                age.num_seconds()
            );
        }
        Ok(None) => {}
        Err(e) => println!("{:<12} {} ({})", "Lock:".bold(), "unreadable".red(), e),
    }

    match std::fs::read(dir.join(STATE_FILE)) {
        Ok(raw) => match StateFile::from_bytes(raw) {
            Ok(state) => println!(
                "{:<12} {}",
                "External ID:".bold(),
                state.resource_id().unwrap_or("-")
            ),
            Err(e) => println!("{:<12} {} ({})", "State:".bold(), "invalid".red(), e),
        },
        Err(_) => println!("{:<12} {}", "State:".bold(), "none".dimmed()),
    }

    Ok(())
}
