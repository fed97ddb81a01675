//! Credential validation handlers
//!
//! CheckUserAccount and Logout both resolve the credential through the gate
//! and immediately drop the context. The side effect is the validation (and
//! its release) itself; the reply carries no result.

use super::{credential, HandlerContext};
use crate::command::ResultBuf;
use guestops_shared::wire::Envelope;
use guestops_shared::OpResult;
use tracing::debug;

pub async fn check_user_account(
    ctx: &HandlerContext,
    envelope: &Envelope<'_>,
) -> OpResult<ResultBuf> {
    let cred = credential(envelope)?;
    let guard = ctx.gate.impersonate(&cred).await?;
    if let Ok(user) = guard.username() {
        debug!(%user, "credential validated");
    }
    drop(guard);
    Ok(ResultBuf::empty())
}
