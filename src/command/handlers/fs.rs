//! Filesystem handlers
//!
//! All path access happens under the impersonated identity, so the guest OS
//! itself enforces per-user access rules. Handlers only translate outcomes
//! into the status taxonomy.

use super::{credential, HandlerContext};
use crate::command::ResultBuf;
use guestops_shared::wire::{CreateTempObjectRequest, Envelope, FilePathRequest, MoveObjectRequest};
use guestops_shared::{OpError, OpResult, Opcode};
use std::fmt::Write as _;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use tracing::debug;

fn metadata_of(path: &str) -> OpResult<Metadata> {
    std::fs::symlink_metadata(path).map_err(|e| OpError::from_io(&e))
}

/// DeleteFile / DeleteDirectory
pub async fn delete_object(
    ctx: &HandlerContext,
    envelope: &Envelope<'_>,
    opcode: Opcode,
) -> OpResult<ResultBuf> {
    let req = FilePathRequest::decode(envelope)?;
    let cred = credential(envelope)?;
    let _guard = ctx.gate.impersonate(&cred).await?;

    let meta = metadata_of(req.path)?;
    match opcode {
        Opcode::DeleteFile => {
            if meta.is_dir() {
                return Err(OpError::InvalidArgument);
            }
            std::fs::remove_file(req.path)?;
        }
        Opcode::DeleteDirectory => {
            if !meta.is_dir() {
                return Err(OpError::NotADirectory);
            }
            std::fs::remove_dir_all(req.path)?;
        }
        _ => return Err(OpError::InvalidArgument),
    }
    debug!(path = %req.path, "deleted");
    Ok(ResultBuf::empty())
}

/// FileExists / DirectoryExists. The answer is part of the result, never an
/// error: a missing path is a successful "0".
pub async fn object_exists(
    ctx: &HandlerContext,
    envelope: &Envelope<'_>,
    opcode: Opcode,
) -> OpResult<ResultBuf> {
    let req = FilePathRequest::decode(envelope)?;
    let cred = credential(envelope)?;
    let _guard = ctx.gate.impersonate(&cred).await?;

    let path = Path::new(req.path);
    let exists = match opcode {
        Opcode::FileExists => path.is_file(),
        Opcode::DirectoryExists => path.is_dir(),
        _ => return Err(OpError::InvalidArgument),
    };
    Ok(if exists {
        ResultBuf::fixed(b"1")
    } else {
        ResultBuf::fixed(b"0")
    })
}

/// MoveFile / MoveDirectory
pub async fn move_object(
    ctx: &HandlerContext,
    envelope: &Envelope<'_>,
    opcode: Opcode,
) -> OpResult<ResultBuf> {
    let req = MoveObjectRequest::decode(envelope)?;
    let cred = credential(envelope)?;
    let _guard = ctx.gate.impersonate(&cred).await?;

    let meta = metadata_of(req.source)?;
    match opcode {
        Opcode::MoveFile if meta.is_dir() => return Err(OpError::InvalidArgument),
        Opcode::MoveDirectory if !meta.is_dir() => return Err(OpError::NotADirectory),
        Opcode::MoveFile | Opcode::MoveDirectory => {}
        _ => return Err(OpError::InvalidArgument),
    }
    std::fs::rename(req.source, req.dest)?;
    debug!(source = %req.source, dest = %req.dest, "moved");
    Ok(ResultBuf::empty())
}

/// CreateDirectory, creating missing parents along the way
pub async fn create_directory(
    ctx: &HandlerContext,
    envelope: &Envelope<'_>,
) -> OpResult<ResultBuf> {
    let req = FilePathRequest::decode(envelope)?;
    let cred = credential(envelope)?;
    let _guard = ctx.gate.impersonate(&cred).await?;

    if Path::new(req.path).exists() {
        return Err(OpError::System(libc::EEXIST));
    }
    std::fs::create_dir_all(req.path)?;
    Ok(ResultBuf::empty())
}

fn format_file_info(out: &mut String, name: &str, meta: &Metadata) {
    let file_type = if meta.file_type().is_symlink() {
        2
    } else if meta.is_dir() {
        1
    } else {
        0
    };
    let mod_time = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    // infallible for String
    let _ = write!(
        out,
        "<fi><name>{name}</name><ft>{file_type}</ft><fs>{}</fs><mt>{mod_time}</mt></fi>",
        meta.len()
    );
}

pub async fn list_directory(ctx: &HandlerContext, envelope: &Envelope<'_>) -> OpResult<ResultBuf> {
    let req = FilePathRequest::decode(envelope)?;
    let cred = credential(envelope)?;
    let _guard = ctx.gate.impersonate(&cred).await?;

    let meta = metadata_of(req.path)?;
    if !meta.is_dir() {
        return Err(OpError::NotADirectory);
    }

    let mut entries = Vec::new();
    for entry in std::fs::read_dir(req.path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        // entries may vanish between readdir and stat
        if let Ok(meta) = std::fs::symlink_metadata(entry.path()) {
            entries.push((name, meta));
        }
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = String::new();
    for (name, meta) in &entries {
        format_file_info(&mut out, name, meta);
    }
    Ok(ResultBuf::text(out))
}

pub async fn get_file_info(ctx: &HandlerContext, envelope: &Envelope<'_>) -> OpResult<ResultBuf> {
    let req = FilePathRequest::decode(envelope)?;
    let cred = credential(envelope)?;
    let _guard = ctx.gate.impersonate(&cred).await?;

    let meta = metadata_of(req.path)?;
    let mut out = String::new();
    format_file_info(&mut out, req.path, &meta);
    Ok(ResultBuf::text(out))
}

const MAX_TEMP_NAME_ATTEMPTS: u32 = 10_000;

/// CreateTempFile / CreateTempDirectory. The result is the absolute path of
/// the freshly created object.
pub async fn create_temp_object(
    ctx: &HandlerContext,
    envelope: &Envelope<'_>,
    opcode: Opcode,
) -> OpResult<ResultBuf> {
    let req = CreateTempObjectRequest::decode(envelope)?;
    let cred = credential(envelope)?;
    let _guard = ctx.gate.impersonate(&cred).await?;

    let parent: PathBuf = match req.parent_dir {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir(),
    };
    if !parent.is_dir() {
        return Err(OpError::NotADirectory);
    }
    let prefix = req.prefix.unwrap_or("gtmp");
    let suffix = req.suffix.unwrap_or("");

    for attempt in 0..MAX_TEMP_NAME_ATTEMPTS {
        let candidate = parent.join(format!("{prefix}{}_{attempt}{suffix}", std::process::id()));
        let created = match opcode {
            Opcode::CreateTempFile => {
                let mut options = std::fs::OpenOptions::new();
                options.write(true).create_new(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    options.mode(0o600);
                }
                options.open(&candidate).map(|_| ())
            }
            Opcode::CreateTempDirectory => std::fs::create_dir(&candidate),
            _ => return Err(OpError::InvalidArgument),
        };
        match created {
            Ok(()) => {
                debug!(path = %candidate.display(), "temp object created");
                return Ok(ResultBuf::text(candidate.to_string_lossy().into_owned()));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(OpError::from_io(&e)),
        }
    }
    Err(OpError::System(libc::EEXIST))
}
