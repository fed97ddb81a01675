//! Process launch, listing and kill handlers

use super::{credential, HandlerContext};
use crate::command::ResultBuf;
use crate::process::{enumerate_live, ReportLaunch, TrackedLaunch};
use guestops_shared::limits::MAX_PROCESS_LIST_RESULT_LENGTH;
use guestops_shared::wire::{
    Envelope, KillProcessRequest, ListProcessesRequest, RunProgramRequest, StartProgramRequest,
    RUN_RETURN_IMMEDIATELY,
};
use guestops_shared::{now_secs, OpError, OpResult};
use tracing::{debug, info};

/// Fire-and-report launch. Replies with the pid right away; the outcome
/// arrives later on the completion sink under the request name.
pub async fn run_program(
    ctx: &HandlerContext,
    envelope: &Envelope<'_>,
    request_name: &str,
) -> OpResult<ResultBuf> {
    let req = RunProgramRequest::decode(envelope)?;
    let cred = credential(envelope)?;
    let _guard = ctx.gate.impersonate(&cred).await?;

    let pid = ctx
        .engine
        .run_program(ReportLaunch {
            request_name: request_name.to_string(),
            program_path: req.program_path.to_string(),
            arguments: req.arguments.map(str::to_string),
            fire_and_forget: req.options & RUN_RETURN_IMMEDIATELY != 0,
            temp_script: None,
        })
        .await?;
    Ok(ResultBuf::text(pid.to_string()))
}

/// Tracked launch whose outcome stays queryable through the process list
pub async fn start_program(ctx: &HandlerContext, envelope: &Envelope<'_>) -> OpResult<ResultBuf> {
    let req = StartProgramRequest::decode(envelope)?;
    let cred = credential(envelope)?;
    let guard = ctx.gate.impersonate(&cred).await?;
    let owner = guard.username().unwrap_or_default();

    let mut env_vars = Vec::with_capacity(req.env_vars.len());
    for pair in &req.env_vars {
        let (name, value) = pair.split_once('=').ok_or(OpError::InvalidArgument)?;
        env_vars.push((name.to_string(), value.to_string()));
    }

    let pid = ctx
        .engine
        .start_program(TrackedLaunch {
            program_path: req.program_path.to_string(),
            arguments: req.arguments.map(str::to_string),
            working_dir: req.working_dir.map(str::to_string),
            env_vars,
            owner,
        })
        .await?;
    Ok(ResultBuf::text(pid.to_string()))
}

/// Plain listing entry: live processes carry no exit fields
fn format_live_entry(name: &str, pid: u64, user: &str, start: u64) -> String {
    format!(
        "<proc><name>{name}</name><pid>{pid}</pid><user>{user}</user>\
         <start>{start}</start></proc>"
    )
}

/// Extended listing entry, exit fields included
fn format_entry(
    name: &str,
    pid: u64,
    user: &str,
    start: u64,
    exit_code: i32,
    end_time: u64,
) -> String {
    format!(
        "<proc><name>{name}</name><pid>{pid}</pid><user>{user}</user>\
         <start>{start}</start><eCode>{exit_code}</eCode><eTime>{end_time}</eTime></proc>"
    )
}

/// Append the entry only if the result stays within the size cap
fn push_within_budget(out: &mut String, entry: String) -> bool {
    if out.len() + entry.len() > MAX_PROCESS_LIST_RESULT_LENGTH {
        return false;
    }
    out.push_str(&entry);
    true
}

/// Live process listing only; exited records are not consulted
pub async fn list_processes(ctx: &HandlerContext, envelope: &Envelope<'_>) -> OpResult<ResultBuf> {
    let req = ListProcessesRequest::decode(envelope)?;
    let cred = credential(envelope)?;
    let _guard = ctx.gate.impersonate(&cred).await?;

    let mut out = String::new();
    for p in enumerate_live()? {
        if !req.pids.is_empty() && !req.pids.contains(&p.pid) {
            continue;
        }
        let entry = format_live_entry(&p.name, p.pid, &p.owner, p.start_time);
        if !push_within_budget(&mut out, entry) {
            break;
        }
    }
    Ok(ResultBuf::text(out))
}

/// Extended listing: merges the exited-process registry with the live view.
/// A tracked pid appears exactly once, from the registry, so a completed
/// program is never double-reported while its pid number is recycled.
pub async fn list_processes_ex(
    ctx: &HandlerContext,
    envelope: &Envelope<'_>,
) -> OpResult<ResultBuf> {
    let req = ListProcessesRequest::decode(envelope)?;
    let cred = credential(envelope)?;
    let _guard = ctx.gate.impersonate(&cred).await?;

    ctx.registry.reap(now_secs()).await;
    let filter = (!req.pids.is_empty()).then_some(req.pids.as_slice());

    let mut out = String::new();
    for e in ctx.registry.list(filter).await {
        let entry = format_entry(
            &e.program, e.pid, &e.owner, e.start_time, e.exit_code, e.end_time,
        );
        if !push_within_budget(&mut out, entry) {
            break;
        }
    }
    for p in enumerate_live()? {
        if let Some(pids) = filter {
            if !pids.contains(&p.pid) {
                continue;
            }
        }
        if ctx.registry.contains(p.pid).await {
            continue;
        }
        let entry = format_entry(&p.name, p.pid, &p.owner, p.start_time, 0, 0);
        if !push_within_budget(&mut out, entry) {
            break;
        }
    }
    Ok(ResultBuf::text(out))
}

/// A kill aimed at the agent itself, its whole process group, or the signal
/// broadcast targets would take the automation channel down with it.
fn refuse_self_kill(agent_pid: u64, target: i64) -> OpResult<()> {
    let own = agent_pid as i64;
    #[cfg(unix)]
    // SAFETY: getpgrp has no failure modes
    let pgrp = unsafe { libc::getpgrp() } as i64;
    #[cfg(not(unix))]
    let pgrp = own;

    if target == own || target == 0 || target == -1 || target == -pgrp {
        info!(target, "refusing kill aimed at the agent itself");
        return Err(OpError::PermissionDenied);
    }
    Ok(())
}

#[cfg(unix)]
pub async fn kill_process(ctx: &HandlerContext, envelope: &Envelope<'_>) -> OpResult<ResultBuf> {
    let req = KillProcessRequest::decode(envelope)?;
    refuse_self_kill(ctx.agent_pid, req.pid)?;
    let cred = credential(envelope)?;
    let _guard = ctx.gate.impersonate(&cred).await?;

    debug!(pid = req.pid, "delivering fatal signal");
    // SAFETY: plain signal delivery, checked for failure
    if unsafe { libc::kill(req.pid as libc::pid_t, libc::SIGKILL) } != 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(-1);
        return Err(match errno {
            libc::ESRCH => OpError::NotFound,
            libc::EPERM => OpError::PermissionDenied,
            other => OpError::System(other),
        });
    }
    Ok(ResultBuf::empty())
}

#[cfg(not(unix))]
pub async fn kill_process(ctx: &HandlerContext, envelope: &Envelope<'_>) -> OpResult<ResultBuf> {
    let req = KillProcessRequest::decode(envelope)?;
    refuse_self_kill(ctx.agent_pid, req.pid)?;
    let cred = credential(envelope)?;
    let _guard = ctx.gate.impersonate(&cred).await?;
    Err(OpError::NotSupported)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn self_kill_targets_are_refused() {
        let own = std::process::id() as u64;
        // SAFETY: getpgrp has no failure modes
        let pgrp = unsafe { libc::getpgrp() } as i64;
        for target in [own as i64, 0, -1, -pgrp] {
            assert_eq!(
                refuse_self_kill(own, target),
                Err(OpError::PermissionDenied),
                "target {target} must be refused"
            );
        }
    }

    #[test]
    fn foreign_pid_passes_the_self_kill_check() {
        assert_eq!(refuse_self_kill(std::process::id() as u64, 1), Ok(()));
    }

    #[test]
    fn entry_format_is_stable() {
        assert_eq!(
            format_entry("/bin/true", 42, "root", 100, 7, 160),
            "<proc><name>/bin/true</name><pid>42</pid><user>root</user>\
             <start>100</start><eCode>7</eCode><eTime>160</eTime></proc>"
        );
    }

    #[test]
    fn live_entries_carry_no_exit_fields() {
        let entry = format_live_entry("/bin/cat", 42, "root", 100);
        assert_eq!(
            entry,
            "<proc><name>/bin/cat</name><pid>42</pid><user>root</user>\
             <start>100</start></proc>"
        );
        assert!(!entry.contains("<eCode>"));
        assert!(!entry.contains("<eTime>"));
    }

    #[test]
    fn listing_never_exceeds_the_result_cap() {
        let entry = format_entry("/bin/true", 1, "root", 0, 0, 0);

        // one byte short of fitting: the entry is refused, not truncated
        let mut out = "x".repeat(MAX_PROCESS_LIST_RESULT_LENGTH - entry.len() + 1);
        assert!(!push_within_budget(&mut out, entry.clone()));
        assert!(out.len() <= MAX_PROCESS_LIST_RESULT_LENGTH);

        // an entry that exactly fits is accepted
        let mut out = "x".repeat(MAX_PROCESS_LIST_RESULT_LENGTH - entry.len());
        assert!(push_within_budget(&mut out, entry));
        assert_eq!(out.len(), MAX_PROCESS_LIST_RESULT_LENGTH);
    }
}
