//! Variable read/write handlers
//!
//! Two scopes exist: the launch environment (backed by the override table,
//! which shadows the ambient environment) and the free-form guest variable
//! store. A read of an unset variable returns an empty result, not an error,
//! so controllers can probe without special-casing.

use super::{credential, HandlerContext};
use crate::command::ResultBuf;
use guestops_shared::wire::{
    Envelope, ReadEnvVariablesRequest, ReadVariableRequest, WriteVariableRequest,
};
use guestops_shared::{variable_scope, OpError, OpResult};
use std::fmt::Write as _;

pub async fn read_variable(ctx: &HandlerContext, envelope: &Envelope<'_>) -> OpResult<ResultBuf> {
    let req = ReadVariableRequest::decode(envelope)?;
    let cred = credential(envelope)?;
    let _guard = ctx.gate.impersonate(&cred).await?;

    let value = match req.scope {
        variable_scope::GUEST_ENVIRONMENT => ctx.env.get(req.name).await,
        variable_scope::GUEST_VARIABLE => ctx.guest_vars.read().await.get(req.name).cloned(),
        _ => return Err(OpError::InvalidArgument),
    };
    Ok(ResultBuf::text(value.unwrap_or_default()))
}

pub async fn write_variable(ctx: &HandlerContext, envelope: &Envelope<'_>) -> OpResult<ResultBuf> {
    let req = WriteVariableRequest::decode(envelope)?;
    let cred = credential(envelope)?;
    let _guard = ctx.gate.impersonate(&cred).await?;

    // an omitted value writes the empty string, same as a present-but-empty one
    let value = req.value.unwrap_or("");
    match req.scope {
        variable_scope::GUEST_ENVIRONMENT => ctx.env.set(req.name, value).await,
        variable_scope::GUEST_VARIABLE => {
            ctx.guest_vars
                .write()
                .await
                .insert(req.name.to_string(), value.to_string());
        }
        _ => return Err(OpError::InvalidArgument),
    }
    Ok(ResultBuf::empty())
}

/// Read launch-environment variables. No names means the whole table; named
/// variables that are unset are simply omitted from the result.
pub async fn read_env_variables(
    ctx: &HandlerContext,
    envelope: &Envelope<'_>,
) -> OpResult<ResultBuf> {
    let req = ReadEnvVariablesRequest::decode(envelope)?;
    let cred = credential(envelope)?;
    let _guard = ctx.gate.impersonate(&cred).await?;

    let mut out = String::new();
    if req.names.is_empty() {
        let snapshot = ctx.env.snapshot().await;
        let mut pairs: Vec<_> = snapshot.into_iter().collect();
        pairs.sort();
        for (name, value) in pairs {
            let _ = write!(out, "<ev>{name}={value}</ev>");
        }
    } else {
        for name in req.names {
            if let Some(value) = ctx.env.get(name).await {
                let _ = write!(out, "<ev>{name}={value}</ev>");
            }
        }
    }
    Ok(ResultBuf::text(out))
}
