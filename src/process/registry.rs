//! Bounded registry of tracked guest processes and their outcomes
//!
//! A tracked launch records a running placeholder here at spawn time; the
//! completion monitor promotes it in place once the process exits. Terminal
//! entries stay queryable for a retention window and are then reaped.
//!
//! The registry is the only writer of its entries, and every operation runs
//! behind a single lock so a find-then-mutate chain is atomic. That is what
//! preserves the at-most-one-entry-per-pid invariant on a multi-threaded
//! runtime.

use guestops_shared::limits::EXITED_PROGRAM_REAP_SECS;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// One tracked process, running or recently exited
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitedProcessEntry {
    pub pid: u64,
    /// Guest account the program was started as
    pub owner: String,
    pub program: String,
    pub start_time: u64,
    pub end_time: u64,
    pub exit_code: i32,
    pub is_running: bool,
}

impl ExitedProcessEntry {
    /// Placeholder recorded at launch, before the outcome is known
    pub fn running(pid: u64, owner: String, program: String, start_time: u64) -> Self {
        Self {
            pid,
            owner,
            program,
            start_time,
            end_time: 0,
            exit_code: 0,
            is_running: true,
        }
    }
}

/// Registry of recently running/exited tracked processes, keyed by pid
#[derive(Debug, Default)]
pub struct ExitedProcessRegistry {
    entries: RwLock<HashMap<u64, ExitedProcessEntry>>,
}

impl ExitedProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a just-launched tracked process. Replaces any stale entry for
    /// the same pid (the OS has recycled it, so the old record is dead).
    pub async fn record_running(&self, entry: ExitedProcessEntry) {
        let mut entries = self.entries.write().await;
        entries.insert(entry.pid, entry);
    }

    /// Record an observed exit.
    ///
    /// The normal path updates the running placeholder in place. If no entry
    /// exists (the exit was observed before the placeholder was persisted, or
    /// the process was never tracked), a terminal entry is synthesized from
    /// what we know, which is only the pid, exit code and end time.
    pub async fn record_exit(&self, pid: u64, exit_code: i32, end_time: u64) {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&pid) {
            Some(entry) => {
                entry.exit_code = exit_code;
                entry.end_time = end_time;
                entry.is_running = false;
            }
            None => {
                debug!(pid, "exit observed for untracked process, synthesizing record");
                entries.insert(
                    pid,
                    ExitedProcessEntry {
                        pid,
                        owner: String::new(),
                        program: String::new(),
                        start_time: 0,
                        end_time,
                        exit_code,
                        is_running: false,
                    },
                );
            }
        }
    }

    /// Drop terminal entries older than the retention window. Running entries
    /// never age out. Reads do not reap on their own, so callers must invoke
    /// this before serving registry contents.
    pub async fn reap(&self, now: u64) {
        let cutoff = now.saturating_sub(EXITED_PROGRAM_REAP_SECS);
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.is_running || e.end_time >= cutoff);
    }

    pub async fn find(&self, pid: u64) -> Option<ExitedProcessEntry> {
        self.entries.read().await.get(&pid).cloned()
    }

    pub async fn contains(&self, pid: u64) -> bool {
        self.entries.read().await.contains_key(&pid)
    }

    /// Snapshot entries, optionally restricted to a pid filter, ordered by
    /// pid for stable output
    pub async fn list(&self, filter: Option<&[u64]>) -> Vec<ExitedProcessEntry> {
        let entries = self.entries.read().await;
        let mut out: Vec<ExitedProcessEntry> = match filter {
            Some(pids) => pids
                .iter()
                .filter_map(|pid| entries.get(pid).cloned())
                .collect(),
            None => entries.values().cloned().collect(),
        };
        out.sort_by_key(|e| e.pid);
        out
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(pid: u64) -> ExitedProcessEntry {
        ExitedProcessEntry::running(pid, "tester".into(), "/bin/true".into(), 100)
    }

    #[tokio::test]
    async fn exit_updates_running_entry_in_place() {
        let registry = ExitedProcessRegistry::new();
        registry.record_running(running(42)).await;
        registry.record_exit(42, 7, 200).await;

        assert_eq!(registry.len().await, 1, "one entry per pid");
        let entry = registry.find(42).await.expect("entry must survive exit");
        assert_eq!(entry.exit_code, 7);
        assert_eq!(entry.end_time, 200);
        assert!(!entry.is_running);
        // fields from the launch-time record are preserved
        assert_eq!(entry.owner, "tester");
        assert_eq!(entry.program, "/bin/true");
    }

    #[tokio::test]
    async fn at_most_one_entry_per_pid() {
        let registry = ExitedProcessRegistry::new();
        registry.record_running(running(7)).await;
        registry.record_running(running(7)).await;
        registry.record_exit(7, 0, 150).await;
        registry.record_exit(7, 1, 160).await;
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn untracked_exit_synthesizes_terminal_entry() {
        let registry = ExitedProcessRegistry::new();
        registry.record_exit(99, 3, 500).await;

        let entry = registry.find(99).await.unwrap();
        assert!(!entry.is_running);
        assert_eq!(entry.exit_code, 3);
        assert_eq!(entry.owner, "");
        assert_eq!(entry.program, "");
    }

    #[tokio::test]
    async fn reap_honors_retention_boundary() {
        let now = 10_000;
        let registry = ExitedProcessRegistry::new();

        registry
            .record_exit(1, 0, now - EXITED_PROGRAM_REAP_SECS - 1)
            .await;
        registry
            .record_exit(2, 0, now - EXITED_PROGRAM_REAP_SECS + 1)
            .await;

        registry.reap(now).await;
        assert!(registry.find(1).await.is_none(), "past the window: reaped");
        assert!(registry.find(2).await.is_some(), "inside the window: kept");
    }

    #[tokio::test]
    async fn reap_is_idempotent() {
        let now = 10_000;
        let registry = ExitedProcessRegistry::new();
        registry.record_exit(1, 0, now - EXITED_PROGRAM_REAP_SECS - 1).await;
        registry.record_exit(2, 0, now).await;

        registry.reap(now).await;
        let after_first = registry.len().await;
        registry.reap(now).await;
        assert_eq!(registry.len().await, after_first);
    }

    #[tokio::test]
    async fn running_entries_never_age_out() {
        let registry = ExitedProcessRegistry::new();
        let mut entry = running(5);
        entry.start_time = 0;
        registry.record_running(entry).await;

        registry.reap(u64::MAX).await;
        assert!(registry.find(5).await.is_some());
    }

    #[tokio::test]
    async fn list_applies_pid_filter() {
        let registry = ExitedProcessRegistry::new();
        registry.record_running(running(1)).await;
        registry.record_running(running(2)).await;
        registry.record_running(running(3)).await;

        let all = registry.list(None).await;
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].pid < w[1].pid));

        let some = registry.list(Some(&[3, 1, 99])).await;
        let pids: Vec<u64> = some.iter().map(|e| e.pid).collect();
        assert_eq!(pids, vec![1, 3]);
    }
}
