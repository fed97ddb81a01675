//! Process launch, monitoring and bookkeeping
//!
//! This module handles:
//! - Launching guest programs and polling them to completion (engine)
//! - The bounded registry of recently exited tracked processes (registry)
//! - The private environment-override table for launches (environment)
//! - Enumerating live guest processes for the list operations

pub mod engine;
pub mod environment;
pub mod registry;

pub use engine::{
    CompletionSink, ProcessEngine, ProgramCompletion, ReportLaunch, TrackedLaunch,
};
pub use environment::EnvironmentTable;
pub use registry::{ExitedProcessEntry, ExitedProcessRegistry};

use guestops_shared::OpResult;

/// One live guest process, as seen by an OS-level enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveProcess {
    pub pid: u64,
    pub name: String,
    pub owner: String,
    pub start_time: u64,
}

/// Enumerate live processes from the OS.
///
/// Best-effort: entries that vanish mid-scan are skipped, not errors.
#[cfg(unix)]
pub fn enumerate_live() -> OpResult<Vec<LiveProcess>> {
    use std::os::unix::fs::MetadataExt;

    let mut out = Vec::new();
    for entry in std::fs::read_dir("/proc")? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let pid: u64 = match entry.file_name().to_string_lossy().parse() {
            Ok(pid) => pid,
            Err(_) => continue,
        };

        let name = read_command_name(pid).unwrap_or_default();
        let (owner, start_time) = match entry.metadata() {
            Ok(meta) => {
                let owner = crate::impersonate::unix::username_for_uid(meta.uid())
                    .unwrap_or_else(|| meta.uid().to_string());
                (owner, meta.ctime().max(0) as u64)
            }
            Err(_) => continue, // raced with process exit
        };

        out.push(LiveProcess {
            pid,
            name,
            owner,
            start_time,
        });
    }
    out.sort_by_key(|p| p.pid);
    Ok(out)
}

#[cfg(not(unix))]
pub fn enumerate_live() -> OpResult<Vec<LiveProcess>> {
    Err(guestops_shared::OpError::NotSupported)
}

#[cfg(unix)]
fn read_command_name(pid: u64) -> Option<String> {
    let cmdline = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    if !cmdline.is_empty() {
        let joined: Vec<String> = cmdline
            .split(|&b| b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect();
        if !joined.is_empty() {
            return Some(joined.join(" "));
        }
    }
    // kernel threads have an empty cmdline; fall back to comm
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .ok()
        .map(|s| s.trim_end().to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn live_enumeration_contains_this_process() {
        let own_pid = std::process::id() as u64;
        let procs = enumerate_live().expect("enumeration failed");
        assert!(procs.iter().any(|p| p.pid == own_pid));
        assert!(procs.windows(2).all(|w| w[0].pid < w[1].pid));
    }
}
