//! RunScript handler: materialize the script as a guest temp file and run it
//! through an interpreter as a fire-and-report launch

use super::{credential, HandlerContext};
use crate::command::ResultBuf;
use crate::process::ReportLaunch;
use guestops_shared::wire::{Envelope, RunScriptRequest, RUN_RETURN_IMMEDIATELY};
use guestops_shared::{OpError, OpResult};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const DEFAULT_INTERPRETER: &str = "/bin/sh";

/// Cap on the unique-name search; past this the temp directory is unusable
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// Create the script file with a collision-proof unique name, readable and
/// runnable by the impersonated account only
async fn write_script_file(script: &str) -> OpResult<PathBuf> {
    let dir = std::env::temp_dir();
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let path = dir.join(format!("guestops_script_{}_{attempt}", std::process::id()));
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o700);
        let mut file = match options.open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(OpError::from_io(&e)),
        };
        if let Err(e) = file.write_all(script.as_bytes()).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(OpError::from_io(&e));
        }
        debug!(path = %path.display(), "script file written");
        return Ok(path);
    }
    Err(OpError::System(libc::EEXIST))
}

pub async fn run_script(
    ctx: &HandlerContext,
    envelope: &Envelope<'_>,
    request_name: &str,
) -> OpResult<ResultBuf> {
    let req = RunScriptRequest::decode(envelope)?;
    let cred = credential(envelope)?;
    let _guard = ctx.gate.impersonate(&cred).await?;

    let interpreter = match req.interpreter {
        Some(i) if !i.is_empty() => i,
        _ => DEFAULT_INTERPRETER,
    };

    // Written under the impersonated identity, so the file is owned by and
    // readable to the account the script will run as.
    let script_path = write_script_file(req.script).await?;
    let arguments = format!("\"{}\"", script_path.display());

    // The engine deletes the temp file on every failure path and once the
    // script finishes.
    let pid = ctx
        .engine
        .run_program(ReportLaunch {
            request_name: request_name.to_string(),
            program_path: interpreter.to_string(),
            arguments: Some(arguments),
            fire_and_forget: req.options & RUN_RETURN_IMMEDIATELY != 0,
            temp_script: Some(script_path),
        })
        .await?;
    Ok(ResultBuf::text(pid.to_string()))
}
